//! # PodShell Broker Library
//!
//! The broker hands every WebSocket client its own throwaway pod with an
//! interactive shell attached.
//!
//! ## Overview
//!
//! For each connection the broker:
//!
//! - **Provisions** a uniquely named pod for the user in the handshake
//! - **Waits** until the pod is running and ready, then tells the client
//! - **Bridges** client frames to the shell's TTY and shell output back
//! - **Tears down** the pod when either side goes away
//!
//! Pods left behind by a crash are swept by the orphan reconciler at
//! startup and again at shutdown.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Broker Orchestrator                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  accept loop ──▶ SessionDriver (one task per connection)     │
//! │                      │                                       │
//! │        ┌─────────────┼──────────────────┐                    │
//! │        ▼             ▼                  ▼                    │
//! │  ┌───────────┐ ┌────────────┐   ┌────────────────┐           │
//! │  │   Pod     │ │  Terminal  │   │    Session     │           │
//! │  │ Lifecycle │ │   Bridge   │   │    Registry    │           │
//! │  └─────┬─────┘ └────────────┘   └───────▲────────┘           │
//! │        │                                │                    │
//! │        ▼                                │                    │
//! │  ┌───────────────────┐        ┌─────────┴────────┐           │
//! │  │ PodCluster (kube) │◀───────│ Orphan Reconciler│           │
//! │  └───────────────────┘        └──────────────────┘           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use broker::{BrokerOrchestrator, Config, KubeCluster};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let cluster = KubeCluster::connect(
//!         &config.cluster.namespace,
//!         config.cluster.kubeconfig.as_deref(),
//!     )
//!     .await?;
//!
//!     let mut orchestrator = BrokerOrchestrator::new(config, Arc::new(cluster));
//!     orchestrator.start().await?;
//!
//!     // Wait for shutdown signal...
//!
//!     orchestrator.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`cluster`]: Pod operations against Kubernetes or an in-memory fake
//! - [`naming`]: Pod name generation
//! - [`registry`]: Pods owned by live sessions
//! - [`lifecycle`]: Create, readiness wait and delete
//! - [`reconciler`]: Orphan pod cleanup
//! - [`bridge`]: WebSocket to exec stream adapter
//! - [`session`]: Per-connection state machine
//! - [`orchestrator`]: Accept loop and shutdown coordinator

pub mod bridge;
pub mod cluster;
pub mod config;
pub mod lifecycle;
pub mod naming;
pub mod orchestrator;
pub mod reconciler;
pub mod registry;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use config::{Config, ConfigError};

pub use cluster::{ClusterError, InMemoryCluster, KubeCluster, PodCluster, PodPhase, PodStatusView};

pub use lifecycle::{LifecycleError, PodLifecycle};

pub use reconciler::{OrphanReconciler, ReconcileReport};

pub use registry::SessionRegistry;

pub use bridge::{BridgeError, TerminalBridge, TerminalStreams};

pub use session::{
    Session, SessionDriver, SessionError, SessionId, SessionOutcome, SessionSettings, SessionState,
};

pub use orchestrator::{BrokerOrchestrator, OrchestratorEvent, OrchestratorState};
