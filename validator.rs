//! Static admission control for submitted strategy source.
//!
//! Pattern-level gating only. It is allowed to be unsound: the sandbox has no
//! instructions for calling out, creating code or self-destructing, so the
//! execution boundary holds regardless of what slips through here.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tracing::debug;

use crate::error::ConfigError;
use crate::rules::ValidatorRules;

/// Outcome of validating one source file. `valid == errors.is_empty()`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    fn new(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

struct CompiledDeny {
    regex: Regex,
    unless_after: Option<Regex>,
    message: String,
}

struct CompiledFunction {
    regex: Regex,
    message: String,
}

/// Compiled form of a [`ValidatorRules`] table. Stateless after construction
/// and safe to share across threads.
pub struct Validator {
    rules: ValidatorRules,
    pragma: Regex,
    license: Regex,
    denied: Vec<CompiledDeny>,
    contract_decl: Regex,
    contract_open: Regex,
    any_contract: Regex,
    functions: Vec<CompiledFunction>,
    import: Regex,
    state_var: Regex,
}

static BUILTIN: Lazy<Validator> = Lazy::new(|| {
    Validator::new(ValidatorRules::default()).expect("built-in validator rules compile")
});

fn compile(rule: &str, pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|source| ConfigError::Pattern {
        rule: rule.to_string(),
        source,
    })
}

fn compile_ci(rule: &str, pattern: &str) -> Result<Regex, ConfigError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| ConfigError::Pattern {
            rule: rule.to_string(),
            source,
        })
}

impl Validator {
    pub fn new(rules: ValidatorRules) -> Result<Self, ConfigError> {
        let denied = rules
            .denied
            .iter()
            .map(|d| {
                Ok(CompiledDeny {
                    regex: compile_ci(&d.message, &d.pattern)?,
                    unless_after: d
                        .unless_after
                        .as_deref()
                        .map(|p| compile_ci(&d.message, p))
                        .transpose()?,
                    message: d.message.clone(),
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let functions = rules
            .required_functions
            .iter()
            .map(|f| {
                Ok(CompiledFunction {
                    regex: compile(
                        &f.name,
                        &format!(r"function\s+{}\s*\(", regex::escape(&f.name)),
                    )?,
                    message: f.message.clone(),
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let decl = format!(
            r"contract\s+{}\s+is\s+{}\b",
            regex::escape(&rules.contract_name),
            regex::escape(&rules.base_contract)
        );
        let open = format!(
            r"contract\s+{}\s+is\s+{}\s*\{{",
            regex::escape(&rules.contract_name),
            regex::escape(&rules.base_contract)
        );

        Ok(Self {
            pragma: compile("pragma", &rules.pragma_pattern)?,
            license: compile("license", &rules.license_pattern)?,
            denied,
            contract_decl: compile("contract", &decl)?,
            contract_open: compile("contract", &open)?,
            any_contract: compile("contract", r"(?m)^\s*(?:abstract\s+)?contract\s+\w+")?,
            functions,
            import: compile(
                "import",
                r#"\bimport\s+[^;]*?["']([^"']+)["']"#,
            )?,
            state_var: compile(
                "storage",
                r"^\s*(uint\d*|int\d*|bool|address|bytes\d*|string|mapping\s*\([^)]*\))(?:\s*\[\d*\])*\s+((?:\w+\s+)*)(\w+)\s*[;=]",
            )?,
            rules,
        })
    }

    /// Validator over the built-in rule tables.
    pub fn builtin() -> &'static Validator {
        &BUILTIN
    }

    pub fn rules(&self) -> &ValidatorRules {
        &self.rules
    }

    /// Run every rule over `source` and collect all violations.
    pub fn validate(&self, source: &str) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if !self.pragma.is_match(source) {
            errors.push(self.rules.pragma_message.clone());
        }
        if !self.license.is_match(source) {
            warnings.push(self.rules.license_message.clone());
        }

        for rule in &self.denied {
            if self.deny_fires(rule, source) {
                errors.push(rule.message.clone());
            }
        }

        if !self.contract_decl.is_match(source) {
            errors.push(self.rules.contract_message());
        }
        let declared = self.any_contract.find_iter(source).count();
        if declared > 1 {
            errors.push(format!(
                "Only one top-level contract may be declared (found {declared})"
            ));
        }
        for f in &self.functions {
            if !f.regex.is_match(source) {
                errors.push(f.message.clone());
            }
        }

        errors.extend(self.check_imports(source));
        warnings.extend(self.check_storage(source));

        debug!(
            errors = errors.len(),
            warnings = warnings.len(),
            "validated strategy source"
        );
        ValidationResult::new(errors, warnings)
    }

    /// `(true, None)` when valid, otherwise `(false, first error)`.
    pub fn quick_check(&self, source: &str) -> (bool, Option<String>) {
        let result = self.validate(source);
        if result.valid {
            return (true, None);
        }
        let first = result
            .errors
            .into_iter()
            .next()
            .unwrap_or_else(|| "Unknown validation error".to_string());
        (false, Some(first))
    }

    fn deny_fires(&self, rule: &CompiledDeny, source: &str) -> bool {
        rule.regex.find_iter(source).any(|m| match &rule.unless_after {
            Some(exempt) => !exempt.is_match(&source[m.end()..]),
            None => true,
        })
    }

    fn check_imports(&self, source: &str) -> Vec<String> {
        self.import
            .captures_iter(source)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str())
            .filter(|path| {
                let bare = path.strip_prefix("./").unwrap_or(*path);
                !self.rules.allowed_imports.iter().any(|a| a == bare)
            })
            .map(|path| {
                format!(
                    "Import '{path}' is not allowed. Only {} can be imported.",
                    self.rules.allowed_imports.join(", ")
                )
            })
            .collect()
    }

    /// Warn about contract-level variable declarations outside the sanctioned
    /// names. Only text at brace depth 1 of the strategy contract is scanned.
    fn check_storage(&self, source: &str) -> Vec<String> {
        let Some(open) = self.contract_open.find(source) else {
            return Vec::new();
        };

        let mut depth = 1usize;
        let mut contract_level = String::new();
        for ch in source[open.end()..].chars() {
            match ch {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ if depth == 1 => contract_level.push(ch),
                _ => {}
            }
        }

        let mut warnings = Vec::new();
        for line in contract_level.lines() {
            let Some(caps) = self.state_var.captures(line) else {
                continue;
            };
            let modifiers = caps.get(2).map_or("", |m| m.as_str());
            if modifiers
                .split_whitespace()
                .any(|w| w == "constant" || w == "immutable")
            {
                continue;
            }
            let name = &caps[3];
            if self.rules.storage_allowlist.iter().any(|a| a == name) {
                continue;
            }
            warnings.push(format!(
                "State variable '{name}' declared outside slots array. \
                 Use slots[0-31] for persistent storage to ensure storage limits."
            ));
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMPLIANT: &str = include_str!("templates/Strategy.sol");

    fn validate(src: &str) -> ValidationResult {
        Validator::builtin().validate(src)
    }

    /// The template with `snippet` placed just before afterSwap stores its fee.
    fn with_snippet(snippet: &str) -> String {
        COMPLIANT.replace("slots[0] = fee;", &format!("{snippet}\n        slots[0] = fee;"))
    }

    #[test]
    fn compliant_template_passes() {
        let r = validate(COMPLIANT);
        assert!(r.valid, "unexpected errors: {:?}", r.errors);
        assert!(r.errors.is_empty());
        assert!(r.warnings.is_empty(), "unexpected warnings: {:?}", r.warnings);
    }

    #[test]
    fn every_denied_pattern_is_reported() {
        let cases = [
            ("(bool ok, ) = target.call{value: 1}(\"\");", "External calls (call{) are not allowed"),
            ("target.call(data);", "Low-level call() is not allowed"),
            ("target.delegatecall(data);", "delegatecall is not allowed"),
            ("target.staticcall(data);", "staticcall is not allowed"),
            ("selfdestruct(payable(msg.sender));", "selfdestruct is not allowed"),
            ("suicide(owner);", "suicide is not allowed"),
            ("assembly { sstore(0, 1) }", "Inline assembly is not allowed"),
            ("Helper h = new Helper();", "Creating new contracts is not allowed"),
            ("payable(msg.sender).transfer(1);", "transfer() is not allowed"),
            ("payable(msg.sender).send(1);", "send() is not allowed"),
            ("address miner = block.coinbase;", "block.coinbase access is not allowed"),
            (
                "uint256 r = block.prevrandao;",
                "block.difficulty / block.prevrandao access is not allowed",
            ),
        ];
        for (snippet, message) in cases {
            let src = with_snippet(snippet);
            let r = validate(&src);
            assert!(!r.valid, "{snippet} slipped through");
            assert!(
                r.errors.iter().any(|e| e == message),
                "{snippet}: missing '{message}' in {:?}",
                r.errors
            );
        }
    }

    #[test]
    fn denied_patterns_match_case_insensitively() {
        let src = with_snippet("SELFDESTRUCT(owner);");
        assert!(validate(&src)
            .errors
            .contains(&"selfdestruct is not allowed".to_string()));
    }

    #[test]
    fn interface_declarations_need_the_sanctioned_reference() {
        let custom = format!("{COMPLIANT}\ninterface IOracle {{ function price() external view returns (uint256); }}\n");
        assert!(validate(&custom)
            .errors
            .contains(&"Custom interfaces are not allowed".to_string()));

        let sanctioned = format!("{COMPLIANT}\ninterface IHelper {{ }}\n// implements IAMMStrategy\n");
        assert!(!validate(&sanctioned)
            .errors
            .contains(&"Custom interfaces are not allowed".to_string()));
    }

    #[test]
    fn each_missing_entry_point_is_a_distinct_error() {
        let src = COMPLIANT
            .replace("function afterSwap", "function onSwap")
            .replace("function getName", "function label");
        let r = validate(&src);
        assert_eq!(
            r.errors,
            vec![
                "Must implement afterSwap(TradeInfo calldata) function".to_string(),
                "Must implement getName() function".to_string(),
            ]
        );
    }

    #[test]
    fn wrong_contract_declaration_is_rejected() {
        let src = COMPLIANT.replace("contract Strategy is AMMStrategyBase", "contract Mine is AMMStrategyBase");
        let r = validate(&src);
        assert!(r
            .errors
            .contains(&"Contract must be named 'Strategy' and inherit from AMMStrategyBase".to_string()));
    }

    #[test]
    fn second_contract_is_rejected() {
        let src = format!("{COMPLIANT}\ncontract Sidecar {{}}\n");
        let r = validate(&src);
        assert!(r
            .errors
            .iter()
            .any(|e| e.starts_with("Only one top-level contract may be declared")));
    }

    #[test]
    fn missing_pragma_is_error_missing_license_is_warning() {
        let src = COMPLIANT
            .replace("pragma solidity ^0.8.24;", "")
            .replace("// SPDX-License-Identifier: MIT", "");
        let r = validate(&src);
        assert_eq!(r.errors, vec!["Missing pragma solidity directive".to_string()]);
        assert_eq!(r.warnings, vec!["Missing SPDX license identifier".to_string()]);
    }

    #[test]
    fn foreign_imports_are_named() {
        let src = COMPLIANT.replace(
            "import {AMMStrategyBase} from \"./AMMStrategyBase.sol\";",
            "import {AMMStrategyBase} from \"./AMMStrategyBase.sol\";\nimport \"@openzeppelin/utils/Address.sol\";",
        );
        let r = validate(&src);
        assert_eq!(r.errors.len(), 1);
        assert!(r.errors[0].contains("'@openzeppelin/utils/Address.sol'"));
    }

    #[test]
    fn every_import_form_is_checked() {
        let forms = [
            "import \"./Evil.sol\";",
            "import * as E from \"./Evil.sol\";",
            "import \"./Evil.sol\" as E;",
            "import {A as B} from './Evil.sol';",
        ];
        for form in forms {
            let src = COMPLIANT.replace(
                "import {AMMStrategyBase} from \"./AMMStrategyBase.sol\";",
                &format!("import {{AMMStrategyBase}} from \"./AMMStrategyBase.sol\";\n{form}"),
            );
            let r = validate(&src);
            assert!(!r.valid, "{form} was admitted");
            assert_eq!(r.errors.len(), 1, "{form}: {:?}", r.errors);
            assert!(r.errors[0].contains("'./Evil.sol'"), "{form}: {:?}", r.errors);
        }
    }

    #[test]
    fn storage_outside_slots_is_only_a_warning() {
        let src = with_snippet(
            "}\n    uint256 public lastPrice;\n    mapping(uint256 => uint256) history;\n    function helper() internal {",
        );
        let r = validate(&src);
        assert!(r.valid, "{:?}", r.errors);
        assert_eq!(r.warnings.len(), 2, "{:?}", r.warnings);
        assert!(r.warnings[0].contains("'lastPrice'"));
        assert!(r.warnings[1].contains("'history'"));
    }

    #[test]
    fn locals_and_constants_are_not_storage() {
        let src = with_snippet("uint256 localValue = 3;");
        assert!(validate(&src).warnings.is_empty());
    }

    #[test]
    fn quick_check_reports_first_error() {
        assert_eq!(Validator::builtin().quick_check(COMPLIANT), (true, None));
        let (ok, err) = Validator::builtin().quick_check("contract Nope {}");
        assert!(!ok);
        assert_eq!(err.as_deref(), Some("Missing pragma solidity directive"));
    }

    #[test]
    fn replacement_rules_take_effect() {
        let mut rules = ValidatorRules::default();
        rules.contract_name = "Fees".into();
        let v = Validator::new(rules).unwrap();
        let src = COMPLIANT.replace("contract Strategy", "contract Fees");
        assert!(v.validate(&src).valid);
    }

    #[test]
    fn broken_rule_pattern_is_a_config_error() {
        let mut rules = ValidatorRules::default();
        rules.pragma_pattern = "(".into();
        assert!(matches!(Validator::new(rules), Err(ConfigError::Pattern { .. })));
    }
}
