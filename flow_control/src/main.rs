//! Main entry point for the flow-replay CLI.

use anyhow::{Context, Result};
use clap::Parser;
use flow_control::{cli, replay, settings::Settings, telemetry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::Cli::parse();

    // Load settings
    let mut settings = Settings::load(args.config.as_deref())?;

    // Initialize logging
    telemetry::init(&settings.logging)?;

    // Stop between simulation steps on Ctrl-C
    let stop = Arc::new(AtomicBool::new(false));
    let stop_signal = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current step");
            stop_signal.store(true, Ordering::Relaxed);
        }
    });

    let command = args.command.unwrap_or(cli::Commands::Experiment {
        num_runs: None,
        num_steps: None,
        csv: false,
    });

    match command {
        cli::Commands::Experiment { num_runs, num_steps, csv } => {
            if let Some(n) = num_runs {
                settings.experiment.num_runs = n;
            }
            if let Some(n) = num_steps {
                settings.experiment.num_steps = n;
            }
            settings.experiment.convert_to_csv |= csv;
            settings.validate()?;

            let result = tokio::task::spawn_blocking(move || replay::run_experiment(&settings, stop))
                .await
                .context("Experiment task panicked")??;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        cli::Commands::Rollout => {
            let summary = tokio::task::spawn_blocking(move || replay::run_rollout(&settings, stop))
                .await
                .context("Rollout task panicked")??;
            println!("Final Reward: {}", summary.total_reward);
            Ok(())
        }
        cli::Commands::InitModel { output } => {
            replay::init_model(&settings, &output)?;
            info!("Untrained policy written to {:?}", output);
            Ok(())
        }
    }
}
