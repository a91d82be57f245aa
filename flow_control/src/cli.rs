//! Command-line interface definitions using clap derive API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Replay trained imitation policies on the crosswalk environment
#[derive(Parser)]
#[command(name = "flow-replay")]
#[command(about = "Replay trained imitation-learning policies in a multi-agent traffic environment")]
#[command(version)]
pub struct Cli {
    /// Configuration file layered over the built-in defaults
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the configured experiment (the default)
    Experiment {
        /// Override the number of runs
        #[arg(long)]
        num_runs: Option<usize>,
        /// Override the number of steps per run
        #[arg(long)]
        num_steps: Option<usize>,
        /// Write emission data as CSV
        #[arg(long)]
        csv: bool,
    },
    /// Run a single rollout and report the final reward
    Rollout,
    /// Write an untrained policy network sized for the environment
    InitModel {
        /// Where to write the weights file
        #[arg(short, long)]
        output: PathBuf,
    },
}
