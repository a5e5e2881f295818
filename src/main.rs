//! `autocomplete-sft` command-line entry point.

use anyhow::Context;
use clap::Parser;

use autocomplete_sft::cli::{Cli, Command};
use autocomplete_sft::config::SftConfig;
use autocomplete_sft::hub::CliPublisher;
use autocomplete_sft::trainer::SftTrainerFactory;
use autocomplete_sft::{pipeline, runtime};

fn main() -> anyhow::Result<()> {
    runtime::init_environment();

    let cli = Cli::parse();
    runtime::init_logging(cli.verbose)?;

    match cli.command {
        Command::Train(args) => {
            let config = args.resolve().context("invalid configuration")?;
            let output = pipeline::run(&config, &SftTrainerFactory, &CliPublisher::default())
                .context("fine-tuning failed")?;
            tracing::info!(
                "Done: {} steps, loss {:.4}, saved to {}",
                output.train.global_step,
                output.train.training_loss,
                output.output_dir.display()
            );
        }
        Command::Validate(args) => {
            let config = args.resolve().context("invalid configuration")?;
            tracing::info!("Configuration is valid");
            print!("{}", serde_yaml::to_string(&config)?);
        }
        Command::InitConfig { path } => {
            SftConfig::default()
                .to_file(&path)
                .with_context(|| format!("failed to write {}", path.display()))?;
            tracing::info!("Wrote default configuration to {}", path.display());
        }
    }

    Ok(())
}
