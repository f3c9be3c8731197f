use std::fs;
use std::path::{Path, PathBuf};

use amm_arena::adapter::SandboxStrategy;
use amm_arena::artifact::ArtifactCache;
use amm_arena::asm::AsmCompiler;
use amm_arena::baseline::load_vanilla_strategy;
use amm_arena::config::{LoggingConfig, SimulationConfig};
use amm_arena::rules::ValidatorRules;
use amm_arena::sim::{Simulation, SimulationSummary};
use amm_arena::strategy::Strategy;
use amm_arena::validator::Validator;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(name = "amm-arena", about = "Validate and simulate AMM fee strategies")]
struct Cli {
	/// Log filter when RUST_LOG is unset.
	#[arg(long, global = true, default_value = "info")]
	log_level: String,
	#[arg(long, global = true, default_value = "pretty", value_parser = ["pretty", "json"])]
	log_format: String,
	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Check strategy sources against the admission rules.
	Validate {
		/// Replacement rule tables (TOML).
		#[arg(long)]
		rules: Option<PathBuf>,
		files: Vec<PathBuf>,
	},
	/// Run one simulation with assembled strategies (vanilla if none given).
	Simulate {
		#[arg(long)]
		config: Option<PathBuf>,
		#[arg(long)]
		steps: Option<u64>,
		#[arg(long)]
		seed: Option<u64>,
		#[arg(long)]
		json: bool,
		files: Vec<PathBuf>,
	},
}

fn main() -> Result<()> {
	let cli = Cli::parse();
	LoggingConfig {
		level: cli.log_level,
		format: cli.log_format,
	}
	.init();

	match cli.command {
		Commands::Validate { rules, files } => validate_cmd(rules.as_deref(), &files),
		Commands::Simulate {
			config,
			steps,
			seed,
			json,
			files,
		} => simulate_cmd(config.as_deref(), steps, seed, json, &files),
	}
}

fn validate_cmd(rules: Option<&Path>, files: &[PathBuf]) -> Result<()> {
	if files.is_empty() {
		bail!("Provide at least one strategy source file.");
	}

	let custom;
	let validator = match rules {
		Some(path) => {
			let rules = ValidatorRules::from_path(path)
				.with_context(|| format!("failed to load rules from {}", path.display()))?;
			custom = Validator::new(rules)?;
			&custom
		}
		None => Validator::builtin(),
	};

	let mut failed = 0;
	for file in files {
		let source = fs::read_to_string(file)
			.with_context(|| format!("failed to read {}", file.display()))?;
		let result = validator.validate(&source);

		if result.valid {
			println!("[PASS] {}", file.display());
		} else {
			println!("[FAIL] {}", file.display());
			failed += 1;
		}
		for err in &result.errors {
			println!("  error: {err}");
		}
		for warning in &result.warnings {
			println!("  warning: {warning}");
		}
	}

	if failed > 0 {
		bail!("{failed} of {} files failed validation", files.len());
	}
	Ok(())
}

fn simulate_cmd(
	config_path: Option<&Path>,
	steps: Option<u64>,
	seed: Option<u64>,
	json: bool,
	files: &[PathBuf],
) -> Result<()> {
	let mut config = match config_path {
		Some(path) => SimulationConfig::from_path(path)
			.with_context(|| format!("failed to load config from {}", path.display()))?,
		None => SimulationConfig::default(),
	};
	if let Some(steps) = steps {
		config.n_steps = steps;
	}
	if let Some(seed) = seed {
		config.seed = seed;
	}

	let mut strategies: Vec<Box<dyn Strategy>> = Vec::with_capacity(files.len().max(1));
	if files.is_empty() {
		strategies.push(Box::new(load_vanilla_strategy()?));
	}
	for file in files {
		strategies.push(Box::new(load_strategy(file)?));
	}

	let mut sim = Simulation::new(config, strategies)?;
	let summary = sim.run()?;

	if json {
		println!("{}", serde_json::to_string_pretty(&summary)?);
	} else {
		print_summary(&summary);
	}
	Ok(())
}

fn load_strategy(file: &Path) -> Result<SandboxStrategy> {
	let source = fs::read_to_string(file)
		.with_context(|| format!("failed to read {}", file.display()))?;
	let artifact = ArtifactCache::global()
		.get_or_compile(&source, &AsmCompiler)
		.with_context(|| format!("failed to assemble {}", file.display()))?;
	let strategy = SandboxStrategy::new(artifact)
		.with_context(|| format!("failed to deploy {}", file.display()))?;
	info!(file = %file.display(), name = strategy.name(), "strategy loaded");
	Ok(strategy)
}

fn print_summary(summary: &SimulationSummary) {
	println!(
		"\nSteps: {}   Final fair price: {:.4}",
		summary.steps, summary.final_fair_price
	);
	println!("\nPool                                 Reserve X      Reserve Y       Spot   Retail      Arb");
	println!("------------------------------------------------------------------------------------------");
	for pool in &summary.pools {
		println!(
			"{:<30} {:>14} {:>14} {:>10} {:>8} {:>8}",
			pool.name,
			format!("{:.4}", pool.reserve_x),
			format!("{:.4}", pool.reserve_y),
			pool.spot_price.map_or_else(|| "-".to_string(), |p| format!("{p:.4}")),
			pool.retail_trades,
			pool.arb_trades
		);
	}
}
