use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use quranlab_agent::{level_table, load_config, replay};

/// QuranLab policy runner
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML file overlaid on the environment configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the level ladder
    Levels,

    /// Replay a JSONL script of learner and expert events
    Replay {
        script: PathBuf,

        /// Override the expert response guarantee, in seconds
        #[arg(long)]
        guarantee_secs: Option<i64>,
    },

    /// Load and validate configuration, print it with secrets elided
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref()).context("loading configuration")?;

    match args.command {
        Command::Levels => {
            print!("{}", level_table());
        }
        Command::Replay {
            script,
            guarantee_secs,
        } => {
            let report = replay::replay_file(&config, &script, guarantee_secs)
                .await
                .with_context(|| format!("replaying {}", script.display()))?;
            info!(
                steps = report.steps,
                users = report.users.len(),
                requests = report.requests.len(),
                "replay finished"
            );
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
        }
    }

    Ok(())
}
