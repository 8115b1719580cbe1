use crate::commands::SelectArgs;
use crate::output;

use std::sync::Arc;

use clap::Args;
use color_eyre::Result;

use expgrid_core::{
    progress_channel, InstanceOutcome, PhaseStatus, PipelineEvent, PipelineKind, RunOptions,
};

/// Options for setup and analyze
#[derive(Args, Debug)]
pub struct PipelineArgs {
    #[command(flatten)]
    pub select: SelectArgs,

    /// Render only; skip provisioning, submission and destructive phases
    #[arg(long)]
    pub dry_run: bool,

    /// Re-run phases that already completed
    #[arg(long)]
    pub force: bool,

    /// Run only phases matching these globs (comma separated)
    #[arg(long, value_name = "GLOB", value_delimiter = ',')]
    pub phases: Vec<String>,
}

/// Options for execute
#[derive(Args, Debug)]
pub struct ExecuteArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Wait for submitted jobs to finish
    #[arg(long)]
    pub wait: bool,
}

pub async fn execute(pipeline: PipelineKind, args: PipelineArgs, wait: bool) -> Result<()> {
    let workspace = Arc::new(args.select.open()?);
    let options = RunOptions {
        filters: args.select.filters(),
        dry_run: args.dry_run,
        force: args.force,
        phases: args.phases,
        wait,
    };

    output::status(
        "Running",
        &format!("{} in {}", pipeline, workspace.root().display()),
    );

    let (tx, mut rx) = progress_channel();

    // Spawn the run in background
    let run = {
        let workspace = Arc::clone(&workspace);
        tokio::spawn(async move { workspace.run_pipeline(pipeline, &options, Some(tx)).await })
    };

    // Process events in the foreground
    while let Some(event) = rx.recv().await {
        render(&event);
    }

    let report = run.await??;

    let failures: Vec<_> = report
        .instances
        .iter()
        .filter_map(|i| match &i.outcome {
            InstanceOutcome::Failed { phase, error } => Some((&i.experiment, phase, error)),
            InstanceOutcome::Completed => None,
        })
        .collect();

    if report.instances.is_empty() {
        output::warning("no experiments selected");
    }

    if failures.is_empty() {
        return Ok(());
    }

    println!();
    for (experiment, phase, error) in &failures {
        output::failure(&format!("{} failed in '{}'", experiment, phase));
        output::dim(&format!("      {}", error));
    }
    color_eyre::eyre::bail!(
        "{} of {} experiments failed",
        failures.len(),
        report.instances.len()
    )
}

fn render(event: &PipelineEvent) {
    match event {
        PipelineEvent::PipelineStarted {
            pipeline,
            phases,
            total_instances,
            dry_run,
        } => {
            println!();
            let mode = if *dry_run { " (dry run)" } else { "" };
            output::header(&format!(
                "Pipeline '{}'{}: {} experiments, phases {}",
                pipeline,
                mode,
                total_instances,
                phases.join(" -> ")
            ));
        }

        PipelineEvent::PipelineCompleted {
            succeeded,
            failed,
            duration,
            ..
        } => {
            println!();
            if *failed == 0 {
                output::success(&format!(
                    "{} experiments completed in {:.2}s",
                    succeeded,
                    duration.as_secs_f64()
                ));
            } else {
                output::failure(&format!(
                    "{} succeeded, {} failed after {:.2}s",
                    succeeded,
                    failed,
                    duration.as_secs_f64()
                ));
            }
        }

        PipelineEvent::InstanceStarted { .. } | PipelineEvent::PhaseStarted { .. } => {}

        PipelineEvent::InstanceCompleted {
            experiment,
            success,
            duration,
        } => {
            let message = format!("{} ({:.2}s)", experiment, duration.as_secs_f64());
            if *success {
                output::check(&message);
            } else {
                output::failure(&message);
            }
        }

        PipelineEvent::PhaseFinished {
            experiment,
            phase,
            status,
            duration,
            detail,
        } => {
            let detail = detail
                .as_deref()
                .map(|d| format!(": {}", d))
                .unwrap_or_default();
            let line = format!(
                "    {} {} {} ({:.2}s){}",
                experiment,
                phase,
                status.as_str(),
                duration.as_secs_f64(),
                detail
            );
            match status {
                PhaseStatus::Ran => output::dim_success(&line),
                PhaseStatus::Failed => output::dim_failure(&line),
                PhaseStatus::Skipped | PhaseStatus::Suppressed => output::dim(&line),
            }
        }

        PipelineEvent::PhaseFailed {
            experiment,
            phase,
            error,
            duration,
        } => {
            output::dim_failure(&format!(
                "    {} {} FAIL ({:.2}s)",
                experiment,
                phase,
                duration.as_secs_f64()
            ));
            output::phase_error(error);
        }
    }
}
