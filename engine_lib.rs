extern crate self as amm_arena;

pub mod adapter;
pub mod amm;
pub mod arbitrage;
pub mod artifact;
pub mod asm;
pub mod baseline;
pub mod config;
pub mod error;
pub mod market;
pub mod router;
pub mod rules;
pub mod sandbox;
pub mod sim;
pub mod strategy;
pub mod types;
pub mod validator;

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
