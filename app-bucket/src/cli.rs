/// # app-bucket CLI
///
/// Command parsing and orchestration for the operator binary. Reconciliation
/// logic lives in [`app-bucket-core`]; this module only loads the config, seeds
/// the in-process substrate and drives the controllers.
///
/// ## Commands
/// - `run`: reconcile until interrupted (Ctrl-C).
/// - `reconcile`: reconcile for a settle window, then print every record's
///   observed state as YAML on stdout.
///
/// [`app-bucket-core`]: ../../app-bucket-core/
use crate::load_config::load_config;
use crate::operator::{controllers, run_controllers, Substrate};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// CLI for app-bucket: distribute mobile packages from object storage.
#[derive(Parser)]
#[clap(
    name = "app-bucket",
    version,
    about = "Reconcile mobile app packages in object storage into icons, releases and universal links"
)]
pub struct Cli {
    /// Raise log verbosity (-v debug, -vv trace). `RUST_LOG` takes precedence.
    #[clap(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run every controller until interrupted
    Run {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
    },
    /// Reconcile the seeded records for a while, then print their status
    Reconcile {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Seconds to let the controllers settle before printing
        #[clap(long, default_value_t = 5)]
        settle_secs: u64,
    },
}

async fn start(config: PathBuf) -> Result<(Substrate, crate::load_config::OperatorConfig)> {
    let config = load_config(config)?;
    std::fs::create_dir_all(&config.scratch_dir).with_context(|| {
        format!("Failed to create scratch directory {:?}", config.scratch_dir)
    })?;
    let substrate = Substrate::new();
    substrate.seed(config.records.clone()).await?;
    Ok((substrate, config))
}

/// Async CLI entrypoint shared by `main` and the integration tests.
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Run { config } => {
            let (substrate, config) = start(config).await?;
            tracing::info!(command = "run", workers = config.workers, "Starting controllers");
            let cancel = CancellationToken::new();
            let running = tokio::spawn(run_controllers(
                controllers(&substrate, &config),
                cancel.clone(),
            ));
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for interrupt")?;
            tracing::info!(command = "run", "Interrupt received, stopping controllers");
            cancel.cancel();
            running.await.context("Controller task failed")?;
            Ok(())
        }
        Commands::Reconcile {
            config,
            settle_secs,
        } => {
            let (substrate, config) = start(config).await?;
            tracing::info!(command = "reconcile", settle_secs, "Starting controllers");
            let cancel = CancellationToken::new();
            let running = tokio::spawn(run_controllers(
                controllers(&substrate, &config),
                cancel.clone(),
            ));
            tokio::time::sleep(Duration::from_secs(settle_secs)).await;
            cancel.cancel();
            running.await.context("Controller task failed")?;

            let report = serde_yaml::to_string(&substrate.report())
                .context("Failed to render status report")?;
            println!("{report}");
            tracing::info!(command = "reconcile", "Reconcile complete");
            Ok(())
        }
    }
}
