//! Assembler for strategy assembly, the source form of sandbox artifacts.
//!
//! ```text
//! ; comment
//! .entry afterInitialize(uint256 initialX, uint256 initialY) -> (uint256 bidFee, uint256 askFee)
//!     push 0.003w          ; `w` suffix = WAD-scaled decimal
//!     dup 0
//!     return 2
//! .entry getName() -> (string) view
//!     returnstr "Vanilla_30bps"
//! ```
//!
//! Consecutive `.entry` lines share the code that follows them. `arg` takes
//! either an index or a parameter name of the most recent entry.

use std::collections::HashMap;
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::artifact::{Abi, AbiFunction, AbiParam, ArtifactCompiler, CompiledArtifact};
use crate::error::ArtifactError;
use crate::sandbox::{Op, Program};
use crate::types::WAD;

/// Compiles strategy assembly into a [`CompiledArtifact`].
#[derive(Clone, Copy, Debug, Default)]
pub struct AsmCompiler;

impl ArtifactCompiler for AsmCompiler {
    fn compile(&self, source: &str) -> Result<CompiledArtifact, ArtifactError> {
        let (bytecode, abi) = assemble(source)?;
        CompiledArtifact::new(bytecode, abi)
    }
}

enum Operand {
    None,
    Word(u128),
    Byte(u8),
    Label(String),
    Str(String),
}

struct Instr {
    op: Op,
    operand: Operand,
}

fn fail(line: usize, reason: impl Into<String>) -> ArtifactError {
    ArtifactError::Assemble {
        line,
        reason: reason.into(),
    }
}

/// Assemble `source` into `(bytecode, abi)`.
pub fn assemble(source: &str) -> Result<(Vec<u8>, Abi), ArtifactError> {
    let mut instrs: Vec<Instr> = Vec::new();
    let mut labels: HashMap<String, usize> = HashMap::new();
    let mut entries: Vec<(AbiFunction, usize)> = Vec::new();
    let mut offset = 0usize;

    for (idx, raw) in source.lines().enumerate() {
        let line = idx + 1;
        let text = strip_comment(raw).trim();
        if text.is_empty() {
            continue;
        }

        if let Some(header) = text.strip_prefix(".entry") {
            let func = parse_entry(header.trim(), line)?;
            if entries.iter().any(|(f, _)| f.signature() == func.signature()) {
                return Err(fail(line, format!("duplicate entry {}", func.signature())));
            }
            entries.push((func, offset));
            continue;
        }

        if let Some(label) = text.strip_suffix(':') {
            if !is_ident(label) {
                return Err(fail(line, format!("invalid label '{label}'")));
            }
            if labels.insert(label.to_string(), offset).is_some() {
                return Err(fail(line, format!("duplicate label '{label}'")));
            }
            continue;
        }

        let (mnemonic, rest) = match text.split_once(char::is_whitespace) {
            Some((m, r)) => (m, r.trim()),
            None => (text, ""),
        };
        let op = Op::from_mnemonic(mnemonic)
            .ok_or_else(|| fail(line, format!("unknown instruction '{mnemonic}'")))?;
        let current_inputs = entries.last().map(|(f, _)| f.inputs.as_slice()).unwrap_or(&[]);
        let operand = parse_operand(op, rest, current_inputs, line)?;
        offset += 1 + op.immediate_len();
        instrs.push(Instr { op, operand });
    }

    if entries.len() > u8::MAX as usize {
        return Err(fail(0, "too many entry points"));
    }

    let mut code = Vec::with_capacity(offset);
    let mut data = Vec::new();
    for instr in &instrs {
        code.push(instr.op as u8);
        match &instr.operand {
            Operand::None => {}
            Operand::Word(w) => code.extend_from_slice(&w.to_le_bytes()),
            Operand::Byte(b) => code.push(*b),
            Operand::Label(name) => {
                let target = labels
                    .get(name)
                    .ok_or_else(|| ArtifactError::UndefinedLabel(name.clone()))?;
                code.extend_from_slice(&(*target as u32).to_le_bytes());
            }
            Operand::Str(s) => {
                let start = data.len() as u32;
                data.extend_from_slice(s.as_bytes());
                code.extend_from_slice(&start.to_le_bytes());
                code.extend_from_slice(&(s.len() as u32).to_le_bytes());
            }
        }
    }

    let table = entries.iter().map(|(f, at)| (f.selector(), *at)).collect();
    let program = Program::new(table, data, code)?;
    let abi = Abi(entries.into_iter().map(|(f, _)| f).collect());
    Ok((program.encode(), abi))
}

fn strip_comment(line: &str) -> &str {
    let mut quoted = false;
    for (i, ch) in line.char_indices() {
        match ch {
            '"' => quoted = !quoted,
            ';' if !quoted => return &line[..i],
            _ => {}
        }
    }
    line
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_params(list: &str, line: usize) -> Result<Vec<AbiParam>, ArtifactError> {
    list.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            let mut parts = p.split_whitespace();
            let ty = parts.next().unwrap_or_default();
            if !is_ident(ty) {
                return Err(fail(line, format!("invalid parameter type '{ty}'")));
            }
            Ok(AbiParam {
                name: parts.last().unwrap_or_default().to_string(),
                ty: ty.to_string(),
            })
        })
        .collect()
}

fn parse_entry(header: &str, line: usize) -> Result<AbiFunction, ArtifactError> {
    let open = header
        .find('(')
        .ok_or_else(|| fail(line, "entry needs a parameter list"))?;
    let close = header[open..]
        .find(')')
        .map(|i| open + i)
        .ok_or_else(|| fail(line, "unterminated parameter list"))?;
    let name = header[..open].trim();
    if !is_ident(name) {
        return Err(fail(line, format!("invalid entry name '{name}'")));
    }
    let inputs = parse_params(&header[open + 1..close], line)?;

    let mut rest = header[close + 1..].trim();
    let mut outputs = Vec::new();
    if let Some(after_arrow) = rest.strip_prefix("->") {
        let after_arrow = after_arrow.trim();
        let body = after_arrow
            .strip_prefix('(')
            .and_then(|r| r.find(')').map(|i| (&r[..i], &r[i + 1..])))
            .ok_or_else(|| fail(line, "malformed return list"))?;
        outputs = parse_params(body.0, line)?;
        rest = body.1.trim();
    }

    let state_mutability = match rest {
        "" => "nonpayable",
        "view" => "view",
        "pure" => "pure",
        other => return Err(fail(line, format!("unexpected '{other}' after entry"))),
    };

    Ok(AbiFunction {
        kind: if name == "constructor" { "constructor" } else { "function" }.to_string(),
        name: if name == "constructor" { String::new() } else { name.to_string() },
        inputs,
        outputs,
        state_mutability: state_mutability.to_string(),
    })
}

fn parse_word(text: &str, line: usize) -> Result<u128, ArtifactError> {
    let cleaned = text.replace('_', "");
    let bad = || fail(line, format!("invalid number '{text}'"));
    if let Some(dec) = cleaned.strip_suffix('w') {
        let value = Decimal::from_str(dec).map_err(|_| bad())?;
        let scaled = value.checked_mul(Decimal::from(WAD as u64)).ok_or_else(bad)?;
        if scaled.is_sign_negative() || scaled.fract() != Decimal::ZERO {
            return Err(fail(line, format!("'{text}' is not representable as a WAD word")));
        }
        return scaled.to_u128().ok_or_else(bad);
    }
    if let Some(hex) = cleaned.strip_prefix("0x") {
        return u128::from_str_radix(hex, 16).map_err(|_| bad());
    }
    cleaned.parse::<u128>().map_err(|_| bad())
}

fn parse_byte(text: &str, line: usize) -> Result<u8, ArtifactError> {
    text.parse::<u8>()
        .map_err(|_| fail(line, format!("expected a small integer, got '{text}'")))
}

fn parse_operand(
    op: Op,
    rest: &str,
    inputs: &[AbiParam],
    line: usize,
) -> Result<Operand, ArtifactError> {
    let operand = match op {
        Op::Push => Operand::Word(parse_word(rest, line)?),
        Op::Dup | Op::Swap | Op::SLoad | Op::SStore | Op::Return => {
            Operand::Byte(parse_byte(rest, line)?)
        }
        Op::Arg => match rest.parse::<u8>() {
            Ok(i) => Operand::Byte(i),
            Err(_) => {
                let index = inputs
                    .iter()
                    .position(|p| p.name == rest)
                    .ok_or_else(|| fail(line, format!("unknown argument '{rest}'")))?;
                Operand::Byte(index as u8)
            }
        },
        Op::Jump | Op::JumpI => {
            if !is_ident(rest) {
                return Err(fail(line, format!("invalid jump target '{rest}'")));
            }
            Operand::Label(rest.to_string())
        }
        Op::ReturnStr => {
            let s = rest
                .strip_prefix('"')
                .and_then(|r| r.strip_suffix('"'))
                .ok_or_else(|| fail(line, "returnstr needs a quoted string"))?;
            Operand::Str(s.to_string())
        }
        _ => {
            if !rest.is_empty() {
                return Err(fail(line, format!("'{}' takes no operand", op.mnemonic())));
            }
            Operand::None
        }
    };
    Ok(operand)
}
