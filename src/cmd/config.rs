//! Configuration view and validation commands: `marshal config`.

use anyhow::Result;

use marshal::marshal_config::{MarshalConfig, MarshalToml};

use super::super::ConfigCommands;

/// Returns the exit status: `config validate` fails when there are warnings.
pub fn cmd_config(config: &MarshalConfig, command: Option<ConfigCommands>) -> Result<u8> {
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Marshal Configuration");
            println!("=====================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No marshal.toml found at {}; using defaults.", config_path.display());
            }
            println!();

            let toml = &config.toml;
            println!("[execution]");
            println!("  phase_timeout_secs = {}", toml.execution.phase_timeout_secs);
            println!("  require_contract = {}", toml.execution.require_contract);
            println!();
            println!("[retry]");
            println!("  max_attempts = {}", toml.retry.max_attempts);
            println!("  unknown_max_attempts = {}", toml.retry.unknown_max_attempts);
            println!("  max_step_backs = {}", toml.retry.max_step_backs);
            println!();
            println!("[poller]");
            println!(
                "  floor_secs = {}, factor = {}, ceiling_secs = {}",
                toml.poller.floor_secs, toml.poller.factor, toml.poller.ceiling_secs
            );
            println!();

            if !toml.phases.overrides.is_empty() {
                println!("[phases.overrides]");
                for (pattern, over) in &toml.phases.overrides {
                    println!("  \"{}\":", pattern);
                    if let Some(secs) = over.timeout_secs {
                        println!("    timeout_secs = {}", secs);
                    }
                    if let Some(max) = over.max_attempts {
                        println!("    max_attempts = {}", max);
                    }
                    if over.instruction.is_some() {
                        println!("    instruction = (custom)");
                    }
                }
                println!();
            }

            if !toml.step_back.is_empty() {
                println!("[step_back]");
                for (phase, target) in &toml.step_back {
                    println!("  {} = \"{}\"", phase, target);
                }
                println!();
            }

            println!("[checkers]");
            for (name, checker) in toml.checkers() {
                println!("  {} = {:?}", name, checker.command);
            }
            println!();

            println!("Effective values (with env/CLI overrides):");
            println!("  project = \"{}\"", config.project_name());
            println!("  worker_cmd = \"{}\"", config.worker_cmd());
            println!("  worker_flags = {:?}", config.worker_flags());
            println!("  max_concurrent = {}", config.max_concurrent());
            match config.max_cost_usd() {
                Some(limit) => println!("  max_cost_usd = {:.2}", limit),
                None => println!("  max_cost_usd = (unbounded)"),
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
                println!();
                return Ok(0);
            }
            println!("Configuration warnings:");
            for warning in &warnings {
                println!("  - {}", warning);
            }
            println!();
            return Ok(1);
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("marshal.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(0);
            }
            std::fs::create_dir_all(&config.marshal_dir)?;

            let mut toml = MarshalToml::default();
            toml.project.name = Some(config.project_name());
            toml.save(&config_path)?;

            println!("Created marshal.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [worker] command and flags");
            println!("  - [checkers.<name>] and [evidence.<phase>] completion checks");
            println!("  - [phases.overrides.\"pattern-*\"] for phase-specific settings");
            println!();
        }
    }

    Ok(0)
}
