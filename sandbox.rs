//! Deterministic sandbox machine for untrusted strategy code.
//!
//! A strategy is a stack program over 128-bit words with a fixed storage
//! model of [`SLOT_COUNT`] slots. The instruction set has no way to reach
//! anything outside the call: no external calls, no value transfer, no code
//! creation, no environment reads. Every call runs under an instruction
//! budget so it always terminates.
//!
//! Bytecode layout (little-endian):
//!
//! ```text
//!   0  magic         "AMMS"
//!   4  version       u8 (= 1)
//!   5  entry_count   u8
//!   6  entries       entry_count × (selector [u8; 4], code offset u32)
//!   .. data_len      u32
//!   .. data          [u8; data_len]   (string constants)
//!   .. code          rest of the buffer
//! ```

use sha3::{Digest, Keccak256};

use crate::error::SandboxError;
use crate::types::WAD;

pub const MAGIC: &[u8; 4] = b"AMMS";
pub const VERSION: u8 = 1;

/// Number of persistent word slots per instance.
pub const SLOT_COUNT: usize = 32;

/// Instructions a single call may execute.
pub const STEP_LIMIT: u32 = 100_000;

pub const MAX_STACK: usize = 256;

/// Persistent storage of one sandbox instance.
pub type Storage = [u128; SLOT_COUNT];

pub type Selector = [u8; 4];

/// First four bytes of keccak-256 over a canonical signature such as
/// `afterInitialize(uint256,uint256)`.
pub fn selector(signature: &str) -> Selector {
    let digest = Keccak256::digest(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

// ─── Instruction set ──────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    Stop = 0x00,
    Add = 0x01,
    Sub = 0x02,
    Mul = 0x03,
    Div = 0x04,
    Mod = 0x05,
    /// `a * b / WAD`
    WMul = 0x06,
    /// `a * WAD / b`
    WDiv = 0x07,
    Min = 0x08,
    Max = 0x09,
    Lt = 0x10,
    Gt = 0x11,
    Eq = 0x12,
    IsZero = 0x13,
    And = 0x14,
    Or = 0x15,
    /// imm: u128
    Push = 0x20,
    Pop = 0x21,
    /// imm: u8 depth (0 = top)
    Dup = 0x22,
    /// imm: u8 depth (>= 1)
    Swap = 0x23,
    /// imm: u8 argument index
    Arg = 0x30,
    /// imm: u8 slot
    SLoad = 0x31,
    /// imm: u8 slot
    SStore = 0x32,
    /// imm: u32 code offset
    Jump = 0x40,
    /// imm: u32 code offset; pops the condition
    JumpI = 0x41,
    /// imm: u8 number of words popped as the result
    Return = 0x50,
    /// imm: u32 data offset, u32 length
    ReturnStr = 0x51,
    Revert = 0xfd,
}

impl Op {
    pub const ALL: [Op; 27] = [
        Op::Stop,
        Op::Add,
        Op::Sub,
        Op::Mul,
        Op::Div,
        Op::Mod,
        Op::WMul,
        Op::WDiv,
        Op::Min,
        Op::Max,
        Op::Lt,
        Op::Gt,
        Op::Eq,
        Op::IsZero,
        Op::And,
        Op::Or,
        Op::Push,
        Op::Pop,
        Op::Dup,
        Op::Swap,
        Op::Arg,
        Op::SLoad,
        Op::SStore,
        Op::Jump,
        Op::JumpI,
        Op::Return,
        Op::ReturnStr,
    ];

    pub fn from_byte(byte: u8) -> Option<Op> {
        if byte == Op::Revert as u8 {
            return Some(Op::Revert);
        }
        Op::ALL.iter().copied().find(|op| *op as u8 == byte)
    }

    /// Bytes of immediate operand following the opcode.
    pub fn immediate_len(self) -> usize {
        match self {
            Op::Push => 16,
            Op::Dup | Op::Swap | Op::Arg | Op::SLoad | Op::SStore | Op::Return => 1,
            Op::Jump | Op::JumpI => 4,
            Op::ReturnStr => 8,
            _ => 0,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Op::Stop => "stop",
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Mod => "mod",
            Op::WMul => "wmul",
            Op::WDiv => "wdiv",
            Op::Min => "min",
            Op::Max => "max",
            Op::Lt => "lt",
            Op::Gt => "gt",
            Op::Eq => "eq",
            Op::IsZero => "iszero",
            Op::And => "and",
            Op::Or => "or",
            Op::Push => "push",
            Op::Pop => "pop",
            Op::Dup => "dup",
            Op::Swap => "swap",
            Op::Arg => "arg",
            Op::SLoad => "sload",
            Op::SStore => "sstore",
            Op::Jump => "jump",
            Op::JumpI => "jumpi",
            Op::Return => "return",
            Op::ReturnStr => "returnstr",
            Op::Revert => "revert",
        }
    }

    pub fn from_mnemonic(name: &str) -> Option<Op> {
        let lower = name.to_ascii_lowercase();
        if lower == "revert" {
            return Some(Op::Revert);
        }
        Op::ALL.iter().copied().find(|op| op.mnemonic() == lower)
    }
}

// ─── Program ──────────────────────────────────────────────────────────────────

/// Decoded, verified bytecode. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Program {
    entries: Vec<(Selector, usize)>,
    data: Vec<u8>,
    code: Vec<u8>,
    /// `true` at every offset where an instruction starts.
    boundaries: Vec<bool>,
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
}

impl Program {
    pub fn new(
        entries: Vec<(Selector, usize)>,
        data: Vec<u8>,
        code: Vec<u8>,
    ) -> Result<Self, SandboxError> {
        let boundaries = scan_boundaries(&code)?;
        for (sel, offset) in &entries {
            if !boundaries.get(*offset).copied().unwrap_or(false) {
                return Err(SandboxError::BadBytecode(format!(
                    "entry 0x{} points inside an instruction ({offset})",
                    hex::encode(sel)
                )));
            }
        }
        Ok(Self {
            entries,
            data,
            code,
            boundaries,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SandboxError> {
        let bad = |why: &str| SandboxError::BadBytecode(why.to_string());
        if bytes.len() < 6 || &bytes[0..4] != MAGIC {
            return Err(bad("missing magic header"));
        }
        if bytes[4] != VERSION {
            return Err(bad("unsupported version"));
        }
        let count = bytes[5] as usize;
        let mut at = 6;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let sel: Selector = bytes
                .get(at..at + 4)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| bad("truncated entry table"))?;
            let offset = read_u32(bytes, at + 4).ok_or_else(|| bad("truncated entry table"))?;
            entries.push((sel, offset as usize));
            at += 8;
        }
        let data_len = read_u32(bytes, at).ok_or_else(|| bad("truncated data length"))? as usize;
        at += 4;
        let data = bytes
            .get(at..at + data_len)
            .ok_or_else(|| bad("truncated data section"))?
            .to_vec();
        at += data_len;
        Self::new(entries, data, bytes[at..].to_vec())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(10 + self.entries.len() * 8 + self.data.len() + self.code.len());
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.push(self.entries.len() as u8);
        for (sel, offset) in &self.entries {
            out.extend_from_slice(sel);
            out.extend_from_slice(&(*offset as u32).to_le_bytes());
        }
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&self.code);
        out
    }

    pub fn entry(&self, sel: &Selector) -> Option<usize> {
        self.entries.iter().find(|(s, _)| s == sel).map(|(_, o)| *o)
    }
}

fn scan_boundaries(code: &[u8]) -> Result<Vec<bool>, SandboxError> {
    let mut marks = vec![false; code.len()];
    let mut pc = 0;
    while pc < code.len() {
        let op = Op::from_byte(code[pc]).ok_or_else(|| {
            SandboxError::BadBytecode(format!("invalid opcode 0x{:02x} at {pc}", code[pc]))
        })?;
        marks[pc] = true;
        pc += 1 + op.immediate_len();
    }
    if pc != code.len() {
        return Err(SandboxError::BadBytecode("truncated final instruction".into()));
    }
    Ok(marks)
}

// ─── Execution ────────────────────────────────────────────────────────────────

/// What a call handed back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Output {
    Words(Vec<u128>),
    Bytes(Vec<u8>),
    /// Halted without a return value.
    Empty,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallMode {
    Mutating,
    ReadOnly,
}

/// Run the entry point `sel` against `storage`.
///
/// Storage is only written through on success; a failed call leaves it as it
/// was before the call.
pub fn execute(
    program: &Program,
    storage: &mut Storage,
    sel: &Selector,
    args: &[u128],
    mode: CallMode,
) -> Result<Output, SandboxError> {
    let start = program.entry(sel).ok_or_else(|| SandboxError::UnknownSelector {
        selector: hex::encode(sel),
    })?;
    let mut scratch = *storage;
    let out = Frame {
        program,
        storage: &mut scratch,
        args,
        mode,
        stack: Vec::with_capacity(16),
    }
    .run(start)?;
    *storage = scratch;
    Ok(out)
}

struct Frame<'a> {
    program: &'a Program,
    storage: &'a mut Storage,
    args: &'a [u128],
    mode: CallMode,
    stack: Vec<u128>,
}

impl Frame<'_> {
    fn pop(&mut self, pc: usize) -> Result<u128, SandboxError> {
        self.stack.pop().ok_or(SandboxError::StackUnderflow { pc })
    }

    fn push(&mut self, v: u128, pc: usize) -> Result<(), SandboxError> {
        if self.stack.len() >= MAX_STACK {
            return Err(SandboxError::StackOverflow { pc });
        }
        self.stack.push(v);
        Ok(())
    }

    fn binary(
        &mut self,
        pc: usize,
        f: impl FnOnce(u128, u128) -> Option<u128>,
    ) -> Result<(), SandboxError> {
        let b = self.pop(pc)?;
        let a = self.pop(pc)?;
        let v = f(a, b).ok_or(SandboxError::Arithmetic { pc })?;
        self.push(v, pc)
    }

    fn jump_target(&self, target: usize) -> Result<usize, SandboxError> {
        if self.program.boundaries.get(target).copied().unwrap_or(false) {
            Ok(target)
        } else {
            Err(SandboxError::InvalidJump { target })
        }
    }

    fn run(mut self, start: usize) -> Result<Output, SandboxError> {
        let program = self.program;
        let code = &program.code;
        let mut pc = start;
        let mut steps = 0u32;

        loop {
            steps += 1;
            if steps > STEP_LIMIT {
                return Err(SandboxError::OutOfBudget { limit: STEP_LIMIT });
            }
            let Some(&byte) = code.get(pc) else {
                return Ok(Output::Empty);
            };
            let op = Op::from_byte(byte).ok_or(SandboxError::InvalidOpcode { opcode: byte, pc })?;
            let imm = &code[pc + 1..pc + 1 + op.immediate_len()];
            let imm_u8 = || imm[0];
            let imm_u32 = |at: usize| u32::from_le_bytes([imm[at], imm[at + 1], imm[at + 2], imm[at + 3]]) as usize;
            let next = pc + 1 + op.immediate_len();

            match op {
                Op::Stop => return Ok(Output::Empty),
                Op::Revert => return Err(SandboxError::Revert { pc }),
                Op::Add => self.binary(pc, u128::checked_add)?,
                Op::Sub => self.binary(pc, u128::checked_sub)?,
                Op::Mul => self.binary(pc, u128::checked_mul)?,
                Op::Div => self.binary(pc, u128::checked_div)?,
                Op::Mod => self.binary(pc, u128::checked_rem)?,
                Op::WMul => self.binary(pc, |a, b| a.checked_mul(b).map(|p| p / WAD))?,
                Op::WDiv => self.binary(pc, |a, b| a.checked_mul(WAD).and_then(|p| p.checked_div(b)))?,
                Op::Min => self.binary(pc, |a, b| Some(a.min(b)))?,
                Op::Max => self.binary(pc, |a, b| Some(a.max(b)))?,
                Op::Lt => self.binary(pc, |a, b| Some((a < b) as u128))?,
                Op::Gt => self.binary(pc, |a, b| Some((a > b) as u128))?,
                Op::Eq => self.binary(pc, |a, b| Some((a == b) as u128))?,
                Op::And => self.binary(pc, |a, b| Some((a != 0 && b != 0) as u128))?,
                Op::Or => self.binary(pc, |a, b| Some((a != 0 || b != 0) as u128))?,
                Op::IsZero => {
                    let a = self.pop(pc)?;
                    self.push((a == 0) as u128, pc)?;
                }
                Op::Push => {
                    let mut raw = [0u8; 16];
                    raw.copy_from_slice(imm);
                    self.push(u128::from_le_bytes(raw), pc)?;
                }
                Op::Pop => {
                    self.pop(pc)?;
                }
                Op::Dup => {
                    let depth = imm_u8() as usize;
                    let len = self.stack.len();
                    if depth >= len {
                        return Err(SandboxError::StackUnderflow { pc });
                    }
                    let v = self.stack[len - 1 - depth];
                    self.push(v, pc)?;
                }
                Op::Swap => {
                    let depth = imm_u8() as usize;
                    let len = self.stack.len();
                    if depth == 0 || depth >= len {
                        return Err(SandboxError::StackUnderflow { pc });
                    }
                    self.stack.swap(len - 1, len - 1 - depth);
                }
                Op::Arg => {
                    let index = imm_u8();
                    let v = *self
                        .args
                        .get(index as usize)
                        .ok_or(SandboxError::ArgOutOfRange { index })?;
                    self.push(v, pc)?;
                }
                Op::SLoad => {
                    let slot = imm_u8();
                    let v = *self
                        .storage
                        .get(slot as usize)
                        .ok_or(SandboxError::SlotOutOfRange { slot })?;
                    self.push(v, pc)?;
                }
                Op::SStore => {
                    let slot = imm_u8();
                    if self.mode == CallMode::ReadOnly {
                        return Err(SandboxError::StaticWrite);
                    }
                    let v = self.pop(pc)?;
                    *self
                        .storage
                        .get_mut(slot as usize)
                        .ok_or(SandboxError::SlotOutOfRange { slot })? = v;
                }
                Op::Jump => {
                    pc = self.jump_target(imm_u32(0))?;
                    continue;
                }
                Op::JumpI => {
                    let cond = self.pop(pc)?;
                    if cond != 0 {
                        pc = self.jump_target(imm_u32(0))?;
                        continue;
                    }
                }
                Op::Return => {
                    let n = imm_u8() as usize;
                    if n > self.stack.len() {
                        return Err(SandboxError::StackUnderflow { pc });
                    }
                    let words = self.stack.split_off(self.stack.len() - n);
                    return Ok(Output::Words(words));
                }
                Op::ReturnStr => {
                    let (offset, len) = (imm_u32(0), imm_u32(4));
                    let bytes = program
                        .data
                        .get(offset..offset + len)
                        .ok_or_else(|| SandboxError::MalformedReturn("string outside data section".into()))?;
                    return Ok(Output::Bytes(bytes.to_vec()));
                }
            }
            pc = next;
        }
    }
}
