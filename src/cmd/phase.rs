//! Checkpoint inspection and repair: `marshal status`, `phases`, `reset`.

use anyhow::{Context, Result, bail};
use console::style;

use marshal::checkpoint::{
    CheckpointManager, CheckpointStore, MilestoneState, OpenMode, PhaseRecord, PhaseState,
};
use marshal::dag::DagScheduler;
use marshal::init::is_initialized;
use marshal::marshal_config::MarshalConfig;
use marshal::worker::stream::truncate_str;

fn styled_state(state: &PhaseState) -> String {
    let label = state.label();
    match state {
        PhaseState::Success { .. } => style(label).green().to_string(),
        PhaseState::Running { .. } | PhaseState::EvidenceValidating { .. } => {
            style(label).cyan().to_string()
        }
        PhaseState::Failed { .. } => style(label).yellow().to_string(),
        PhaseState::FatalStop { .. } => style(label).red().bold().to_string(),
        PhaseState::Pending => style(label).dim().to_string(),
    }
}

fn milestone_label(milestone: &MilestoneState) -> &'static str {
    if milestone.completed {
        "complete"
    } else if milestone.fatal_phase().is_some() {
        "halted"
    } else if milestone.phases.iter().any(|p| p.attempts > 0) {
        "in progress"
    } else {
        "pending"
    }
}

fn print_phase(record: &PhaseRecord) {
    println!(
        "    {:<22} {:<30} attempts {:<3} ${:.2}",
        record.name,
        styled_state(&record.state),
        record.attempts,
        record.cost_usd
    );
    if !record.state.is_success()
        && let Some(failure) = &record.last_failure
    {
        println!(
            "      {} {:?}: {}",
            style("last failure").dim(),
            failure.classification,
            truncate_str(&failure.diagnostic, 120)
        );
    }
}

pub fn cmd_status(config: &MarshalConfig, json: bool) -> Result<()> {
    if !is_initialized(&config.project_dir) {
        println!();
        println!("Project: Not initialized");
        println!();
        println!("Run 'marshal init' to initialize the project.");
        println!();
        return Ok(());
    }

    let store = CheckpointStore::new(config.checkpoint_file());
    let Some(checkpoint) = store.load()? else {
        println!();
        println!("No checkpoint yet. Run 'marshal run' to start.");
        println!();
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&checkpoint)?);
        return Ok(());
    }

    println!();
    println!("Marshal Run Status");
    println!("==================");
    println!();
    println!("Project:    {} ({})", checkpoint.project.name, checkpoint.project.id);
    println!(
        "Updated:    {} (commit #{})",
        checkpoint.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
        checkpoint.sequence
    );
    println!("Total cost: ${:.2}", checkpoint.total_cost_usd);
    println!(
        "Failures:   {} recorded",
        checkpoint.failures.len()
    );
    println!();

    for (i, milestone) in checkpoint.project.milestones.iter().enumerate() {
        let marker = if i == checkpoint.project.current_milestone {
            style("→").cyan().bold().to_string()
        } else {
            " ".to_string()
        };
        println!(
            "{} {} [{}] ${:.2}{}",
            marker,
            style(&milestone.name).bold(),
            milestone_label(milestone),
            milestone.cost_usd(),
            if milestone.step_backs > 0 {
                format!(", {} step-back(s)", milestone.step_backs)
            } else {
                String::new()
            }
        );
        for record in &milestone.phases {
            print_phase(record);
        }
        println!();
    }

    if let Some(fatal) = checkpoint
        .project
        .milestones
        .iter()
        .find_map(|m| m.fatal_phase().map(|p| (m.name.as_str(), p)))
    {
        println!(
            "{} '{}' in '{}' stopped the run. Fix the cause, then 'marshal reset --milestone {} --phase {}' and 'marshal resume'.",
            style("Halted:").red().bold(),
            fatal.1.name,
            fatal.0,
            fatal.0,
            fatal.1.name
        );
        println!();
    }
    Ok(())
}

pub fn cmd_phases(config: &MarshalConfig, only: Option<&str>) -> Result<()> {
    let file = config.load_milestones()?;
    if let Some(name) = only
        && file.milestone(name).is_none()
    {
        bail!("Unknown milestone '{}'", name);
    }

    println!();
    println!("Milestones for {}", style(&file.project).bold());
    println!();
    for milestone in file
        .milestones
        .iter()
        .filter(|m| only.is_none_or(|name| m.name == name))
    {
        let scheduler = DagScheduler::from_phases(&milestone.phases)
            .with_context(|| format!("Invalid phase graph in milestone '{}'", milestone.name))?;
        println!("{} ({} phases)", style(&milestone.name).bold(), scheduler.phase_count());
        if !milestone.description.trim().is_empty() {
            println!("  {}", style(milestone.description.trim()).dim());
        }
        for (i, wave) in scheduler.compute_waves().iter().enumerate() {
            println!("  wave {}:", i + 1);
            for phase in wave {
                let deps = milestone
                    .phase(phase)
                    .map(|p| p.depends_on.join(", "))
                    .unwrap_or_default();
                if deps.is_empty() {
                    println!("    {}", phase);
                } else {
                    println!("    {:<22} {}", phase, style(format!("after {}", deps)).dim());
                }
            }
        }
        println!();
    }
    Ok(())
}

pub async fn cmd_reset(
    config: &MarshalConfig,
    milestone: Option<&str>,
    phase: Option<&str>,
    force: bool,
) -> Result<()> {
    let Some(milestone) = milestone else {
        if !force {
            bail!("Refusing to delete the checkpoint without --force");
        }
        // Deleted under the directory lock so a live run keeps its checkpoint.
        let removed = CheckpointManager::discard(&config.marshal_dir)?;
        println!();
        if removed {
            println!("Checkpoint deleted. The next 'marshal run' starts from scratch.");
        } else {
            println!("No checkpoint to delete.");
        }
        println!();
        return Ok(());
    };

    let file = config.load_milestones()?;
    let spec = file
        .milestone(milestone)
        .with_context(|| format!("Unknown milestone '{}'", milestone))?;
    let targets: Vec<String> = match phase {
        Some(phase) => {
            let scheduler = DagScheduler::from_phases(&spec.phases)?;
            if !scheduler.contains(phase) {
                bail!("Unknown phase '{}' in milestone '{}'", phase, milestone);
            }
            let mut targets = vec![phase.to_string()];
            targets.extend(scheduler.downstream_of(phase));
            targets
        }
        None => spec.phases.iter().map(|p| p.name.clone()).collect(),
    };

    let manager = CheckpointManager::open(
        &config.marshal_dir,
        &config.project_name(),
        &file.milestones,
        OpenMode::Resume,
    )?;
    let reset = manager
        .commit(|cp| {
            let state = cp.milestone_mut(milestone)?;
            let mut reset = Vec::new();
            for name in &targets {
                if let Some(record) = state.phase_mut(name) {
                    record.reset();
                    reset.push(name.clone());
                }
            }
            state.completed = false;
            if phase.is_none() {
                state.step_backs = 0;
            }
            cp.project.advance_pointer();
            Ok(reset)
        })
        .await?;

    tracing::info!(milestone, phases = ?reset, "phases reset");
    println!();
    println!(
        "Reset {} phase(s) in '{}': {}",
        reset.len(),
        milestone,
        reset.join(", ")
    );
    println!("Run 'marshal resume' to continue.");
    println!();
    Ok(())
}
