//! Rule tables for the strategy source validator.
//!
//! The tables are tied to one version of the strategy base template, so they
//! live in data rather than code: `ValidatorRules::default()` carries the
//! built-in tables and `config/validator_rules.toml` is the same content in
//! file form for operators who need to swap them.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// A pattern that must not appear anywhere in a submission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenyRule {
    pub pattern: String,
    pub message: String,
    /// Exemption: the rule does not fire when this pattern matches somewhere
    /// after the offending match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unless_after: Option<String>,
}

/// An entry point the submission must define.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredFunction {
    pub name: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorRules {
    pub pragma_pattern: String,
    pub pragma_message: String,
    pub license_pattern: String,
    pub license_message: String,
    /// Name of the single top-level contract.
    pub contract_name: String,
    /// Base template the contract must inherit from.
    pub base_contract: String,
    pub required_functions: Vec<RequiredFunction>,
    pub denied: Vec<DenyRule>,
    /// Module paths an `import` may name (a leading `./` is ignored).
    pub allowed_imports: Vec<String>,
    /// Contract-level identifiers the storage heuristic never warns about.
    pub storage_allowlist: Vec<String>,
}

impl ValidatorRules {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(ConfigError::Parse)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        Self::from_toml_str(&raw)
    }

    pub fn contract_message(&self) -> String {
        format!(
            "Contract must be named '{}' and inherit from {}",
            self.contract_name, self.base_contract
        )
    }
}

fn deny(pattern: &str, message: &str) -> DenyRule {
    DenyRule {
        pattern: pattern.into(),
        message: message.into(),
        unless_after: None,
    }
}

fn required(name: &str, message: &str) -> RequiredFunction {
    RequiredFunction {
        name: name.into(),
        message: message.into(),
    }
}

impl Default for ValidatorRules {
    fn default() -> Self {
        Self {
            pragma_pattern: r"pragma\s+solidity\s+".into(),
            pragma_message: "Missing pragma solidity directive".into(),
            license_pattern: r"//\s*SPDX-License-Identifier:".into(),
            license_message: "Missing SPDX license identifier".into(),
            contract_name: "Strategy".into(),
            base_contract: "AMMStrategyBase".into(),
            required_functions: vec![
                required(
                    "afterInitialize",
                    "Must implement afterInitialize(uint256, uint256) function",
                ),
                required(
                    "afterSwap",
                    "Must implement afterSwap(TradeInfo calldata) function",
                ),
                required("getName", "Must implement getName() function"),
            ],
            denied: vec![
                deny(r"\bcall\s*\{", "External calls (call{) are not allowed"),
                deny(r"\.call\s*\(", "Low-level call() is not allowed"),
                deny(r"\bdelegatecall\s*\(", "delegatecall is not allowed"),
                deny(r"\bstaticcall\s*\(", "staticcall is not allowed"),
                deny(r"\bselfdestruct\s*\(", "selfdestruct is not allowed"),
                deny(r"\bsuicide\s*\(", "suicide is not allowed"),
                deny(r"\bassembly\s*\{", "Inline assembly is not allowed"),
                deny(r"\bnew\s+\w+\s*\(", "Creating new contracts is not allowed"),
                deny(r"\.transfer\s*\(", "transfer() is not allowed"),
                deny(r"\.send\s*\(", "send() is not allowed"),
                deny(r"\bcoinbase\b", "block.coinbase access is not allowed"),
                deny(
                    r"\bblock\.(difficulty|prevrandao)\b",
                    "block.difficulty / block.prevrandao access is not allowed",
                ),
                DenyRule {
                    pattern: r"\binterface\s+\w+\s*\{".into(),
                    message: "Custom interfaces are not allowed".into(),
                    unless_after: Some("IAMMStrategy".into()),
                },
            ],
            allowed_imports: vec!["AMMStrategyBase.sol".into(), "IAMMStrategy.sol".into()],
            storage_allowlist: ["slots", "WAD", "MAX_FEE", "MIN_FEE", "BPS"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shipped_rules_file_matches_defaults() {
        let shipped = include_str!("config/validator_rules.toml");
        let parsed = ValidatorRules::from_toml_str(shipped).unwrap();
        assert_eq!(parsed, ValidatorRules::default());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let rules = ValidatorRules::from_toml_str(r#"contract_name = "Fees""#).unwrap();
        assert_eq!(rules.contract_name, "Fees");
        assert_eq!(rules.base_contract, "AMMStrategyBase");
        assert_eq!(rules.required_functions.len(), 3);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let err = ValidatorRules::from_toml_str("denied = 7").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
