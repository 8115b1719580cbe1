use crate::commands::SelectArgs;
use crate::output;

use std::fmt::Display;

use clap::Args;
use color_eyre::Result;

use expgrid_core::{CleanOptions, CleanOutcome, InstanceResult, WaitOutcome};

/// Options for status, wait and logs
#[derive(Args, Debug)]
pub struct JobArgs {
    #[command(flatten)]
    pub select: SelectArgs,
}

/// Options for clean
#[derive(Args, Debug)]
pub struct CleanArgs {
    #[command(flatten)]
    pub select: SelectArgs,

    /// Cancel jobs that are still queued or running
    #[arg(long)]
    pub cancel: bool,

    /// Show what would be cancelled or removed without doing it
    #[arg(long)]
    pub dry_run: bool,
}

pub async fn status(args: JobArgs) -> Result<()> {
    let workspace = args.select.open()?;
    let results = workspace.status(&args.select.filters()).await?;
    report(&results, |status| status.to_string())
}

pub async fn wait(args: JobArgs) -> Result<()> {
    let workspace = args.select.open()?;
    output::status("Waiting", &format!("{}", workspace.root().display()));
    let results = workspace.wait(&args.select.filters()).await?;

    let mut unfinished = 0;
    for result in &results {
        match &result.result {
            Ok(WaitOutcome::Finished(status)) => {
                output::check(&format!("{}: {}", result.experiment, status))
            }
            Ok(WaitOutcome::TimedOut { polls }) => {
                unfinished += 1;
                output::warning(&format!(
                    "{}: gave up after {} polls",
                    result.experiment, polls
                ));
            }
            Ok(WaitOutcome::Cancelled { .. }) => {
                unfinished += 1;
                output::warning(&format!("{}: wait cancelled", result.experiment));
            }
            Err(e) => {
                unfinished += 1;
                output::failure(&e.to_string());
            }
        }
    }

    if unfinished > 0 {
        color_eyre::eyre::bail!("{} of {} experiments did not finish", unfinished, results.len());
    }
    Ok(())
}

pub async fn clean(args: CleanArgs) -> Result<()> {
    let workspace = args.select.open()?;
    let options = CleanOptions {
        cancel: args.cancel,
        dry_run: args.dry_run,
    };
    let results = workspace.clean(&args.select.filters(), options).await?;
    report(&results, |outcome| match outcome {
        CleanOutcome::NothingToClean => "nothing to clean".to_string(),
        CleanOutcome::RemovedStale { job_id } => format!("removed record of job {}", job_id),
        CleanOutcome::Cancelled { job_id } => format!("cancelled job {}", job_id),
        CleanOutcome::WouldRemoveStale { job_id } => {
            format!("would remove record of job {} (dry run)", job_id)
        }
        CleanOutcome::WouldCancel { job_id } => format!("would cancel job {} (dry run)", job_id),
    })
}

pub async fn logs(args: JobArgs) -> Result<()> {
    let workspace = args.select.open()?;
    let results = workspace.logs(&args.select.filters()).await?;
    report(&results, |files| match files.len() {
        0 => "no logs".to_string(),
        _ => files
            .iter()
            .map(|f| f.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
    })
}

/// One line per instance; errors are listed but only fail the command at
/// the end
fn report<T, F, D>(results: &[InstanceResult<T>], describe: F) -> Result<()>
where
    F: Fn(&T) -> D,
    D: Display,
{
    if results.is_empty() {
        output::warning("no experiments selected");
        return Ok(());
    }

    let mut failed = 0;
    for result in results {
        match &result.result {
            Ok(value) => println!("  {}: {}", result.experiment, describe(value)),
            Err(e) => {
                failed += 1;
                output::failure(&e.to_string());
            }
        }
    }

    if failed > 0 {
        color_eyre::eyre::bail!("{} of {} experiments reported errors", failed, results.len());
    }
    Ok(())
}
