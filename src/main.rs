use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use marshal::marshal_config::MarshalConfig;
use marshal::telemetry;

mod cmd;

#[derive(Parser)]
#[command(name = "marshal")]
#[command(version, about = "Autonomous build orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by `run` and `resume`.
#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    /// Run only this milestone
    #[arg(short, long)]
    pub milestone: Option<String>,

    /// Maximum concurrent phases (overrides marshal.toml and MARSHAL_MAX_CONCURRENT)
    #[arg(long)]
    pub max_concurrent: Option<usize>,

    /// Stop starting attempts once reported cost exceeds this many USD
    #[arg(long)]
    pub max_cost: Option<f64>,

    /// UI output mode: full, minimal, json
    #[arg(long, default_value = "full")]
    pub ui: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .marshal/ with a default marshal.toml and milestones.json
    Init,
    /// Start a new run
    Run {
        #[command(flatten)]
        args: RunArgs,

        /// Discard an existing checkpoint instead of refusing to start
        #[arg(long)]
        fresh: bool,
    },
    /// Continue from the last checkpoint
    Resume {
        #[command(flatten)]
        args: RunArgs,
    },
    /// Show milestone and phase state from the checkpoint
    Status {
        /// Print the raw checkpoint as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show each milestone's phase graph in execution waves
    Phases {
        #[arg(short, long)]
        milestone: Option<String>,
    },
    /// Re-open phases in the checkpoint, or delete it
    Reset {
        /// Milestone to reset (all of its phases unless --phase is given)
        #[arg(long)]
        milestone: Option<String>,

        /// Phase to reset, together with everything downstream of it
        #[arg(long, requires = "milestone")]
        phase: Option<String>,

        /// Required to delete the whole checkpoint
        #[arg(long)]
        force: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default marshal.toml
    Init,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {:#}", console::style("error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<u8> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = MarshalConfig::new(project_dir)?;

    let log_dir = match &cli.command {
        Commands::Run { .. } | Commands::Resume { .. } => Some(config.log_dir()),
        _ => None,
    };
    let _log_guard = telemetry::init_logging(&config.toml.logging, log_dir.as_deref(), cli.verbose)?;

    match cli.command {
        Commands::Init => cmd::cmd_init(&config)?,
        Commands::Run { args, fresh } => {
            return cmd::cmd_run(config, &args, cmd::StartMode::Start { fresh }, cli.verbose).await;
        }
        Commands::Resume { args } => {
            return cmd::cmd_run(config, &args, cmd::StartMode::Resume, cli.verbose).await;
        }
        Commands::Status { json } => cmd::cmd_status(&config, json)?,
        Commands::Phases { milestone } => cmd::cmd_phases(&config, milestone.as_deref())?,
        Commands::Reset {
            milestone,
            phase,
            force,
        } => cmd::cmd_reset(&config, milestone.as_deref(), phase.as_deref(), force).await?,
        Commands::Config { command } => return cmd::cmd_config(&config, command),
    }
    Ok(0)
}
