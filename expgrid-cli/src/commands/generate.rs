use crate::commands::SelectArgs;
use crate::output;

use clap::Args;
use color_eyre::Result;

use expgrid_core::ExperimentSetBuilder;

/// List the experiments a workspace expands to
#[derive(Args, Debug)]
pub struct GenerateArgs {
    #[command(flatten)]
    pub select: SelectArgs,

    /// Also print every resolved variable
    #[arg(long)]
    pub variables: bool,

    /// Include instances kept out of pipelines (excluded, repeat bases)
    #[arg(long)]
    pub all: bool,
}

pub fn execute(args: GenerateArgs) -> Result<()> {
    let config = args.select.load_config()?;
    output::status("Generating", &format!("{}", config.root.display()));

    let outcome = ExperimentSetBuilder::new(&config).build_lenient()?;
    let filters = args.select.filters();

    let mut listed = 0;
    for entry in outcome.set.entries() {
        let instance = &entry.instance;
        match &entry.exclusion {
            Some(reason) => {
                if !args.all {
                    continue;
                }
                output::dim(&format!("  {} ({})", instance.namespace(), reason));
            }
            None => {
                if !filters.matches(instance)? {
                    continue;
                }
                println!("  {}", instance.namespace());
            }
        }
        listed += 1;

        if args.variables {
            for (name, value) in &instance.variables {
                output::dim(&format!("      {} = {}", name, value));
            }
        }
    }

    let active = outcome.set.active().count();
    output::info(&format!(
        "{} listed, {} active of {} generated",
        listed,
        active,
        outcome.set.len()
    ));

    if !outcome.errors.is_empty() {
        for error in &outcome.errors {
            output::error(&error.to_string());
        }
        color_eyre::eyre::bail!("{} experiment templates failed to build", outcome.errors.len());
    }

    Ok(())
}
