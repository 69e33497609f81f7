//! Milestone execution: `marshal run` and `marshal resume`.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use marshal::checkpoint::{CheckpointManager, OpenMode};
use marshal::errors::CheckpointError;
use marshal::marshal_config::MarshalConfig;
use marshal::orchestrator::{Orchestrator, RunEvent, RunOutcome, RunScope};
use marshal::ui::{RunUI, UiMode};
use marshal::worker::WorkerGateway;

use super::super::RunArgs;

/// How to treat an existing checkpoint.
#[derive(Debug, Clone, Copy)]
pub enum StartMode {
    Start { fresh: bool },
    Resume,
}

impl StartMode {
    fn open_mode(self) -> OpenMode {
        match self {
            StartMode::Start { fresh: true } => OpenMode::Overwrite,
            StartMode::Start { fresh: false } => OpenMode::Fresh,
            StartMode::Resume => OpenMode::Resume,
        }
    }
}

/// Run milestones and return the process exit status.
pub async fn cmd_run(
    config: MarshalConfig,
    args: &RunArgs,
    mode: StartMode,
    verbose: bool,
) -> Result<u8> {
    let config = MarshalConfig {
        cli_max_concurrent: args.max_concurrent,
        cli_max_cost_usd: args.max_cost,
        ..config
    };
    for warning in config.validate() {
        tracing::warn!("config: {}", warning);
    }

    let milestones = config.load_milestones()?.milestones;
    let scope = match &args.milestone {
        Some(name) => RunScope::Milestone(name.clone()),
        None => RunScope::All,
    };
    let total_phases: usize = milestones
        .iter()
        .filter(|m| args.milestone.as_ref().is_none_or(|name| &m.name == name))
        .map(|m| m.phases.len())
        .sum();

    let checkpoint = match CheckpointManager::open(
        &config.marshal_dir,
        &config.project_name(),
        &milestones,
        mode.open_mode(),
    ) {
        Ok(manager) => manager,
        Err(e @ CheckpointError::AlreadyExists { .. }) => {
            return Err(anyhow::Error::new(e)
                .context("A previous run exists; use 'marshal resume' or 'marshal run --fresh'"));
        }
        Err(e @ CheckpointError::NotFound { .. }) => {
            return Err(anyhow::Error::new(e).context("Nothing to resume; use 'marshal run'"));
        }
        Err(e) => return Err(e.into()),
    };

    let gateway: Arc<dyn WorkerGateway> = Arc::new(config.gateway()?);
    let settings = config.run_settings();
    tracing::info!(
        project = %config.project_name(),
        worker = %config.worker_cmd(),
        max_concurrent = settings.max_concurrent,
        max_cost_usd = ?settings.max_cost_usd,
        ?mode,
        "starting run"
    );

    let (tx, mut rx) = mpsc::channel::<RunEvent>(256);
    let orchestrator = Orchestrator::new(
        Arc::new(checkpoint),
        gateway,
        config.classifier()?,
        config.validator(),
        settings,
        milestones,
    )
    .with_event_channel(tx);

    let ui_mode = UiMode::parse(&args.ui);
    let ui_task = tokio::spawn(async move {
        let mut ui = RunUI::new(total_phases, ui_mode, verbose);
        while let Some(event) = rx.recv().await {
            ui.handle_event(&event);
        }
        ui.finish();
    });

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping in-flight attempts");
            interrupt.cancel();
        }
    });

    let result = orchestrator.run(scope, cancel).await;
    signal_task.abort();
    // Dropping the orchestrator closes the event channel and releases the lock.
    drop(orchestrator);
    let _ = ui_task.await;

    let outcome = result?;
    match &outcome {
        RunOutcome::Completed => tracing::info!("run complete"),
        other => eprintln!("{}", console::style(other.to_string()).yellow()),
    }
    Ok(outcome.exit_code())
}
