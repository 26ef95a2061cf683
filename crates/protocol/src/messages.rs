//! Message definitions for the PodShell terminal endpoint.
//!
//! All control messages are JSON encoded. Apart from the initial handshake
//! and resize requests, frames on the connection carry raw terminal bytes.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Status value announced once the pod is ready for input.
pub const STATUS_READY: &str = "ready";

/// First message sent by a client after the connection upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHandshake {
    /// Identifier of the user requesting a terminal.
    pub user_id: String,
}

/// Wire shape used to decode handshakes; `user_id` may be absent or null.
#[derive(Deserialize)]
struct RawHandshake {
    #[serde(default)]
    user_id: Option<String>,
}

impl ClientHandshake {
    /// Decodes a handshake frame.
    ///
    /// Fails with [`ProtocolError::MissingUserId`] when the identifier is
    /// absent, null or empty.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let raw: RawHandshake = serde_json::from_slice(bytes)?;
        match raw.user_id {
            Some(user_id) if !user_id.is_empty() => Ok(Self { user_id }),
            _ => Err(ProtocolError::MissingUserId),
        }
    }
}

/// Status notification sent from the broker to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub status: String,
}

impl ServerStatus {
    /// The notification sent when the shell is about to be attached.
    pub fn ready() -> Self {
        Self {
            status: STATUS_READY.to_string(),
        }
    }

    /// Returns true if this is the ready notification.
    pub fn is_ready(&self) -> bool {
        self.status == STATUS_READY
    }

    /// Encodes the status as JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

/// Control messages a client may interleave with terminal input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// The client terminal changed size.
    Resize { cols: u16, rows: u16 },
}

impl ControlMessage {
    /// Attempts to interpret a text frame as a control message.
    ///
    /// Returns `None` for anything that is not a well-formed control
    /// message, in which case the frame is terminal input.
    pub fn parse(text: &str) -> Option<Self> {
        if !text.trim_start().starts_with('{') {
            return None;
        }
        serde_json::from_str(text).ok()
    }

    /// Returns the requested size for resize messages.
    pub fn terminal_size(&self) -> TerminalSize {
        match *self {
            ControlMessage::Resize { cols, rows } => TerminalSize { cols, rows },
        }
    }

    /// Encodes the control message as JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
