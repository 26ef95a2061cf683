//! Broker orchestrator for wiring together all components.
//!
//! The `BrokerOrchestrator` owns the listener, the session registry and the
//! pod lifecycle manager. It sweeps orphans before serving, runs one
//! [`SessionDriver`] task per accepted connection, and shuts down in
//! explicit phases: draining live sessions, a final reconcile, then stopped.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::cluster::PodCluster;
use crate::config::Config;
use crate::lifecycle::PodLifecycle;
use crate::reconciler::{OrphanReconciler, ReconcileReport};
use crate::registry::SessionRegistry;
use crate::session::{SessionDriver, SessionId, SessionSettings};

/// Broker orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Created, not started.
    Idle,
    /// Sweeping orphans and binding the listener.
    Starting,
    /// Accepting connections.
    Running,
    /// No longer accepting; waiting for sessions to finish.
    Draining,
    /// Running the final orphan sweep.
    Reconciling,
    /// Shutdown complete.
    Stopped,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// A client connection was upgraded.
    SessionOpened { peer: SocketAddr },
    /// A session finished and its pod was released.
    SessionClosed {
        peer: SocketAddr,
        session_id: SessionId,
        pod: Option<String>,
        error: Option<String>,
    },
    /// An orphan sweep finished.
    ReconcileCompleted(ReconcileReport),
}

/// Broker orchestrator that manages all subsystems.
pub struct BrokerOrchestrator<C> {
    /// Configuration.
    config: Config,
    /// Pod lifecycle manager shared with every session.
    lifecycle: Arc<PodLifecycle<C>>,
    /// Runs individual sessions.
    driver: Arc<SessionDriver<C>>,
    /// Current state.
    state_tx: watch::Sender<OrchestratorState>,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
    /// Stops the accept loop.
    accept_token: CancellationToken,
    /// Cancels live sessions.
    session_token: CancellationToken,
    /// Tracks the accept loop and every session task.
    tracker: TaskTracker,
    /// Address the listener is bound to, once started.
    local_addr: Option<SocketAddr>,
}

impl<C: PodCluster> BrokerOrchestrator<C> {
    /// Creates a new orchestrator over `cluster` with an empty registry.
    pub fn new(config: Config, cluster: Arc<C>) -> Self {
        let lifecycle = Arc::new(PodLifecycle::new(cluster, Arc::new(SessionRegistry::new())));
        Self::with_lifecycle(config, lifecycle)
    }

    /// Creates an orchestrator around an existing lifecycle manager.
    pub fn with_lifecycle(config: Config, lifecycle: Arc<PodLifecycle<C>>) -> Self {
        let settings = SessionSettings {
            namespace: config.cluster.namespace.clone(),
            create_attempts: config.session.create_attempts,
            ready_timeout: config.session.ready_timeout(),
            shell: vec![config.session.shell.clone()],
        };
        let driver = Arc::new(SessionDriver::new(Arc::clone(&lifecycle), settings));
        let (state_tx, _) = watch::channel(OrchestratorState::Idle);
        let (event_tx, _) = broadcast::channel(256);

        Self {
            config,
            lifecycle,
            driver,
            state_tx,
            event_tx,
            accept_token: CancellationToken::new(),
            session_token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            local_addr: None,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> OrchestratorState {
        *self.state_tx.borrow()
    }

    /// Returns a receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<OrchestratorState> {
        self.state_tx.subscribe()
    }

    /// Resolves once shutdown has completed.
    pub async fn wait_stopped(&self) {
        let mut rx = self.state_tx.subscribe();
        // The sender lives in `self`, so this cannot fail while we borrow it.
        let _ = rx.wait_for(|s| *s == OrchestratorState::Stopped).await;
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn lifecycle(&self) -> &Arc<PodLifecycle<C>> {
        &self.lifecycle
    }

    /// Returns the number of pods owned by live sessions.
    pub fn active_sessions(&self) -> usize {
        self.lifecycle.registry().len()
    }

    /// Sweeps orphans, binds the listener and starts accepting.
    ///
    /// A failed sweep is logged and startup continues. A failed bind is
    /// returned to the caller.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.state() != OrchestratorState::Idle {
            anyhow::bail!("Orchestrator has already been started");
        }
        self.set_state(OrchestratorState::Starting);

        info!("Starting broker orchestrator...");
        self.reconcile().await;

        let listener = match TcpListener::bind(self.config.server.listen_addr.as_str()).await {
            Ok(listener) => listener,
            Err(e) => {
                self.set_state(OrchestratorState::Stopped);
                return Err(e).with_context(|| {
                    format!("Failed to bind {}", self.config.server.listen_addr)
                });
            }
        };
        let local_addr = listener
            .local_addr()
            .context("Failed to read listener address")?;
        self.local_addr = Some(local_addr);

        self.tracker.spawn(Self::accept_loop(
            listener,
            Arc::clone(&self.driver),
            self.tracker.clone(),
            self.event_tx.clone(),
            self.accept_token.clone(),
            self.session_token.clone(),
        ));

        self.set_state(OrchestratorState::Running);
        info!("Broker listening on ws://{}", local_addr);
        Ok(local_addr)
    }

    async fn accept_loop(
        listener: TcpListener,
        driver: Arc<SessionDriver<C>>,
        tracker: TaskTracker,
        event_tx: broadcast::Sender<OrchestratorEvent>,
        accept_token: CancellationToken,
        session_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = accept_token.cancelled() => {
                    info!("Accept loop received shutdown signal");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Accepted connection");
                        tracker.spawn(Self::handle_connection(
                            stream,
                            peer,
                            Arc::clone(&driver),
                            event_tx.clone(),
                            session_token.child_token(),
                        ));
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                    }
                },
            }
        }
    }

    /// Upgrades one connection and runs its session to completion.
    async fn handle_connection(
        stream: TcpStream,
        peer: SocketAddr,
        driver: Arc<SessionDriver<C>>,
        event_tx: broadcast::Sender<OrchestratorEvent>,
        cancel: CancellationToken,
    ) {
        let ws = tokio::select! {
            _ = cancel.cancelled() => return,
            upgraded = tokio_tungstenite::accept_async(stream) => match upgraded {
                Ok(ws) => ws,
                Err(e) => {
                    debug!(%peer, "WebSocket upgrade failed: {}", e);
                    return;
                }
            },
        };

        let _ = event_tx.send(OrchestratorEvent::SessionOpened { peer });

        let outcome = driver.run(ws, cancel).await;
        let _ = event_tx.send(OrchestratorEvent::SessionClosed {
            peer,
            session_id: outcome.session.id(),
            pod: outcome.session.pod_name().map(str::to_string),
            error: outcome.error.as_ref().map(|e| e.to_string()),
        });
    }

    /// Runs one orphan sweep and reports it.
    pub async fn reconcile(&self) -> Option<ReconcileReport> {
        match OrphanReconciler::new(Arc::clone(&self.lifecycle))
            .reconcile()
            .await
        {
            Ok(report) => {
                self.emit_event(OrchestratorEvent::ReconcileCompleted(report.clone()));
                Some(report)
            }
            Err(e) => {
                error!("Orphan reconciliation failed: {}", e);
                None
            }
        }
    }

    /// Stops the broker gracefully.
    ///
    /// Stops accepting, cancels live sessions and waits up to the drain
    /// timeout for their pods to be released, then sweeps whatever is left.
    pub async fn shutdown(&self) -> Result<()> {
        match self.state() {
            OrchestratorState::Stopped => return Ok(()),
            OrchestratorState::Draining | OrchestratorState::Reconciling => {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            _ => {}
        }

        info!("Stopping broker orchestrator...");
        self.set_state(OrchestratorState::Draining);

        self.accept_token.cancel();
        self.session_token.cancel();
        self.tracker.close();

        let drain_timeout = self.config.server.drain_timeout();
        if tokio::time::timeout(drain_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                timeout = ?drain_timeout,
                remaining = self.tracker.len(),
                "Sessions still running after drain timeout"
            );
        }

        self.set_state(OrchestratorState::Reconciling);
        self.reconcile().await;

        self.set_state(OrchestratorState::Stopped);
        info!("Broker orchestrator stopped");
        Ok(())
    }

    fn set_state(&self, state: OrchestratorState) {
        self.state_tx.send_replace(state);
        self.emit_event(OrchestratorEvent::StateChanged(state));
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }
}
