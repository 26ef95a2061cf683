//! PodShell Broker
//!
//! WebSocket service that gives each client a throwaway pod with a shell.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use broker::cluster::KubeCluster;
use broker::config::{default_config_path, Config};
use broker::lifecycle::PodLifecycle;
use broker::orchestrator::{BrokerOrchestrator, OrchestratorEvent};
use broker::reconciler::OrphanReconciler;
use broker::registry::SessionRegistry;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// PodShell Broker - per-session pods behind a WebSocket terminal.
#[derive(Parser, Debug)]
#[command(name = "podshell-broker")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the broker.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Serve terminal sessions until SIGINT or SIGTERM
    Start {
        /// Address to listen on, overriding the configuration
        #[arg(long, value_name = "ADDR")]
        listen: Option<String>,
    },

    /// Delete every managed pod once and exit
    Reconcile,

    /// Print the effective configuration
    Config {
        /// Write it to the configuration file instead of printing it
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };

    // Apply environment variable overrides
    config.apply_env_overrides();
    if let Commands::Start {
        listen: Some(listen),
    } = &cli.command
    {
        config.server.listen_addr = listen.clone();
    }

    // Validate configuration
    config.validate()?;

    init_tracing(&config, cli.verbose);

    match cli.command {
        Commands::Start { .. } => run_broker(config).await?,
        Commands::Reconcile => run_reconcile(&config).await?,
        Commands::Config { write: false } => {
            print!("{}", config.to_toml()?);
        }
        Commands::Config { write: true } => {
            let path = cli.config.unwrap_or_else(default_config_path);
            config.save(&path)?;
            println!("Configuration written to {}", path.display());
        }
    }

    Ok(())
}

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(config: &Config, verbose: bool) {
    let level = if verbose {
        "debug"
    } else {
        config.logging.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn connect_cluster(config: &Config) -> anyhow::Result<KubeCluster> {
    KubeCluster::connect(
        &config.cluster.namespace,
        config.cluster.kubeconfig.as_deref(),
    )
    .await
    .context("Failed to connect to the Kubernetes API")
}

/// Runs the broker until a shutdown signal arrives.
async fn run_broker(config: Config) -> anyhow::Result<()> {
    tracing::info!("PodShell broker starting...");

    let cluster = connect_cluster(&config).await?;
    let shutdown_timeout = config.server.shutdown_timeout();
    let mut orchestrator = BrokerOrchestrator::new(config, Arc::new(cluster));

    // Subscribe before starting so the startup sweep is logged too
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::SessionOpened { peer } => {
                    tracing::debug!("Session opened: {}", peer);
                }
                OrchestratorEvent::SessionClosed {
                    peer,
                    session_id,
                    pod,
                    error,
                } => match error {
                    Some(error) => tracing::info!(
                        %session_id,
                        pod = ?pod,
                        "Session from {} ended: {}",
                        peer,
                        error
                    ),
                    None => tracing::info!(%session_id, pod = ?pod, "Session from {} ended", peer),
                },
                OrchestratorEvent::ReconcileCompleted(report) => {
                    tracing::info!(
                        "Reconciled: {} orphan(s) deleted, {} pod(s) in use",
                        report.deleted.len(),
                        report.retained.len()
                    );
                }
            }
        }
    });

    orchestrator.start().await?;

    // Wait for shutdown signal (SIGTERM or SIGINT)
    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    match tokio::time::timeout(shutdown_timeout, orchestrator.shutdown()).await {
        Ok(result) => result?,
        Err(_) => {
            tracing::error!("Shutdown did not finish within {:?}, exiting", shutdown_timeout);
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Sweeps every managed pod. No sessions run here, so all of them are orphans.
async fn run_reconcile(config: &Config) -> anyhow::Result<()> {
    let cluster = connect_cluster(config).await?;
    let lifecycle = Arc::new(PodLifecycle::new(
        Arc::new(cluster),
        Arc::new(SessionRegistry::new()),
    ));

    let report = OrphanReconciler::new(lifecycle).reconcile().await?;
    if report.deleted.is_empty() {
        println!("No orphaned pods found.");
    } else {
        println!("Deleted {} orphaned pod(s):", report.deleted.len());
        for pod in &report.deleted {
            println!("  {}", pod);
        }
    }
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}
