// Expgrid CLI
// Argument parsing, logging setup and command dispatch

mod commands;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

use commands::generate::GenerateArgs;
use commands::jobs::{CleanArgs, JobArgs};
use commands::pipeline::{ExecuteArgs, PipelineArgs};
use expgrid_core::PipelineKind;

/// Generate, run and track parameter-sweep experiments
#[derive(Parser)]
#[command(name = "expgrid", version, about, long_about = None)]
struct Cli {
    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the experiments the workspace expands to
    Generate(GenerateArgs),

    /// Install software and render experiment directories
    Setup(PipelineArgs),

    /// Submit experiments to their workflow managers
    #[command(alias = "submit")]
    Execute(ExecuteArgs),

    /// Query job status, fetch logs and write status files
    Analyze(PipelineArgs),

    /// Block until submitted jobs finish
    Wait(JobArgs),

    /// Show the current status of submitted jobs
    Status(JobArgs),

    /// Remove job tracking for finished jobs
    Clean(CleanArgs),

    /// Copy job logs into experiment run directories
    Logs(JobArgs),
}

/// `EXPGRID_LOG`, then `RUST_LOG`, then the verbosity flag
fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("EXPGRID_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose >= 2)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Generate(args) => commands::generate::execute(args),
        Commands::Setup(args) => commands::pipeline::execute(PipelineKind::Setup, args, false).await,
        Commands::Execute(args) => {
            commands::pipeline::execute(PipelineKind::Execute, args.pipeline, args.wait).await
        }
        Commands::Analyze(args) => {
            commands::pipeline::execute(PipelineKind::Analyze, args, false).await
        }
        Commands::Wait(args) => commands::jobs::wait(args).await,
        Commands::Status(args) => commands::jobs::status(args).await,
        Commands::Clean(args) => commands::jobs::clean(args).await,
        Commands::Logs(args) => commands::jobs::logs(args).await,
    }
}
