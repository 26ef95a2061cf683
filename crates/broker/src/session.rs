//! Per-connection session driver.
//!
//! Each accepted connection becomes one [`Session`] that moves through
//! `Created → Provisioning → Ready → Streaming → Closing → Closed`. Once a
//! pod exists, every exit path deletes it and drops it from the registry
//! before the session reaches `Closed`.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use protocol::{ClientHandshake, ProtocolError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::bridge::{BridgeError, TerminalBridge};
use crate::cluster::{ClusterError, PodCluster};
use crate::lifecycle::{LifecycleError, PodLifecycle};

/// How long a client may take to send its handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Unique identifier for a session.
pub type SessionId = Uuid;

/// Errors that end a session.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The handshake frame was malformed or had no user id.
    #[error("invalid handshake: {0}")]
    Handshake(#[from] ProtocolError),

    /// The client left or stalled before sending a handshake.
    #[error("no handshake received")]
    NoHandshake,

    /// The connection failed before streaming began.
    #[error("connection error: {0}")]
    Connection(#[from] WsError),

    /// Provisioning the pod failed.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// The bridge could not talk to the client.
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// The exec stream failed.
    #[error("exec stream failed: {0}")]
    Exec(#[source] ClusterError),

    /// The broker is shutting down.
    #[error("session cancelled")]
    Cancelled,

    #[error("invalid session transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connection accepted, waiting for the handshake.
    Created,
    /// Creating the pod and waiting for it to become ready.
    Provisioning,
    /// The pod is running and ready.
    Ready,
    /// The shell is attached and traffic is flowing.
    Streaming,
    /// Tearing the pod down.
    Closing,
    /// Finished.
    Closed,
}

impl SessionState {
    /// Returns true if a session may move from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Created, Provisioning)
                | (Created, Closed)
                | (Provisioning, Ready)
                | (Provisioning, Closing)
                | (Provisioning, Closed)
                | (Ready, Streaming)
                | (Ready, Closing)
                | (Streaming, Closing)
                | (Closing, Closed)
        )
    }
}

/// One client connection and the pod it owns.
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    namespace: String,
    owner: Option<String>,
    pod_name: Option<String>,
    state: SessionState,
}

impl Session {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            namespace: namespace.into(),
            owner: None,
            pod_name: None,
            state: SessionState::Created,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// User id from the handshake, once received.
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Name of the owned pod, once created.
    pub fn pod_name(&self) -> Option<&str> {
        self.pod_name.as_deref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Moves to `next` if the state machine allows it.
    pub fn transition(&mut self, next: SessionState) -> Result<(), SessionError> {
        if !self.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(session_id = %self.id, from = ?self.state, to = ?next, "Session state change");
        self.state = next;
        Ok(())
    }

    fn enter(&mut self, next: SessionState) {
        if let Err(e) = self.transition(next) {
            error!(session_id = %self.id, "{}", e);
        }
    }
}

/// Final state of a session and the error that ended it, if any.
#[derive(Debug)]
pub struct SessionOutcome {
    pub session: Session,
    pub error: Option<SessionError>,
}

impl SessionOutcome {
    /// True when the session ended because the client or shell finished.
    pub fn is_clean(&self) -> bool {
        self.error.is_none()
    }
}

/// Settings shared by every session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub namespace: String,
    pub create_attempts: u32,
    pub ready_timeout: Duration,
    pub shell: Vec<String>,
}

/// Drives sessions from handshake to teardown.
pub struct SessionDriver<C> {
    lifecycle: Arc<PodLifecycle<C>>,
    settings: SessionSettings,
}

impl<C: PodCluster> SessionDriver<C> {
    pub fn new(lifecycle: Arc<PodLifecycle<C>>, settings: SessionSettings) -> Self {
        Self {
            lifecycle,
            settings,
        }
    }

    pub fn lifecycle(&self) -> &Arc<PodLifecycle<C>> {
        &self.lifecycle
    }

    /// Runs one session over an upgraded connection until it is closed.
    ///
    /// `cancel` interrupts every blocking step; the pod is still torn down.
    pub async fn run<S>(&self, ws: WebSocketStream<S>, cancel: CancellationToken) -> SessionOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let session = Session::new(self.settings.namespace.clone());
        let span = info_span!("session", session_id = %session.id());
        self.drive(session, ws, cancel).instrument(span).await
    }

    async fn drive<S>(
        &self,
        mut session: Session,
        mut ws: WebSocketStream<S>,
        cancel: CancellationToken,
    ) -> SessionOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let handshake = match read_handshake(&mut ws, &cancel).await {
            Ok(handshake) => handshake,
            Err(e) => {
                debug!("Rejecting connection: {}", e);
                session.enter(SessionState::Closed);
                return SessionOutcome {
                    session,
                    error: Some(e),
                };
            }
        };

        info!(user_id = %handshake.user_id, "Handshake received");
        session.owner = Some(handshake.user_id.clone());
        session.enter(SessionState::Provisioning);

        let pod_name = match self
            .lifecycle
            .create_with_retry(
                &handshake.user_id,
                self.settings.create_attempts,
                &cancel,
            )
            .await
        {
            Ok(pod_name) => pod_name,
            Err(e) => {
                warn!(user_id = %handshake.user_id, "Could not create pod: {}", e);
                session.enter(SessionState::Closed);
                return SessionOutcome {
                    session,
                    error: Some(e.into()),
                };
            }
        };
        session.pod_name = Some(pod_name.clone());

        let bridge = TerminalBridge::new(ws, pod_name.clone(), Arc::clone(&self.lifecycle));
        let closer = bridge.closer();

        let result = self
            .attach(&mut session, bridge, &pod_name, &cancel)
            .await;
        match &result {
            Ok(()) => info!(pod = %pod_name, "Session finished"),
            Err(e) => warn!(pod = %pod_name, "Session failed: {}", e),
        }

        session.enter(SessionState::Closing);
        closer.close().await;
        self.lifecycle.registry().remove(&pod_name);
        session.enter(SessionState::Closed);

        SessionOutcome {
            session,
            error: result.err(),
        }
    }

    async fn attach<S>(
        &self,
        session: &mut Session,
        mut bridge: TerminalBridge<S, C>,
        pod_name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let ready = tokio::select! {
            result = self.lifecycle.wait_for_ready(pod_name, self.settings.ready_timeout, cancel) => Some(result),
            hangup = bridge.wait_for_hangup() => {
                hangup?;
                None
            }
        };
        match ready {
            Some(result) => result?,
            None => {
                info!(pod = %pod_name, "Client left before the pod was ready");
                return Ok(());
            }
        }
        session.enter(SessionState::Ready);

        bridge.notify_ready().await?;
        let (streams, _closer) = bridge.into_streams();
        session.enter(SessionState::Streaming);

        tokio::select! {
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            result = self.lifecycle.cluster().exec_attach(pod_name, &self.settings.shell, streams) => {
                result.map_err(SessionError::Exec)
            }
        }
    }
}

/// Waits for the client's handshake frame.
async fn read_handshake<S>(
    ws: &mut WebSocketStream<S>,
    cancel: &CancellationToken,
) -> Result<ClientHandshake, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = tokio::time::sleep(HANDSHAKE_TIMEOUT);
    tokio::pin!(deadline);

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            _ = &mut deadline => return Err(SessionError::NoHandshake),
            message = ws.next() => message,
        };

        match message {
            Some(Ok(WsMessage::Text(text))) => return Ok(ClientHandshake::parse(text.as_bytes())?),
            Some(Ok(WsMessage::Binary(data))) => return Ok(ClientHandshake::parse(&data)?),
            Some(Ok(WsMessage::Close(_))) | None => return Err(SessionError::NoHandshake),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}
