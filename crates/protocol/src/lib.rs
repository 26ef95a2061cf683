//! # PodShell Protocol Library
//!
//! Message definitions for the PodShell terminal endpoint.
//!
//! ## Overview
//!
//! A client talks to the broker over a WebSocket:
//!
//! ```text
//! client                                   broker
//!   │  {"user_id":"alice"}                   │
//!   │ ─────────────────────────────────────▶ │  provision pod
//!   │                    {"status":"ready"}  │
//!   │ ◀───────────────────────────────────── │
//!   │  terminal input / resize requests      │
//!   │ ─────────────────────────────────────▶ │  exec-attach
//!   │                       terminal output  │
//!   │ ◀───────────────────────────────────── │
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ClientHandshake, ControlMessage, ServerStatus};
//!
//! let hs = ClientHandshake::parse(br#"{"user_id":"alice"}"#).unwrap();
//! assert_eq!(hs.user_id, "alice");
//!
//! let resize = ControlMessage::parse(r#"{"type":"resize","cols":80,"rows":24}"#);
//! assert!(resize.is_some());
//!
//! assert_eq!(ServerStatus::ready().to_json().unwrap(), r#"{"status":"ready"}"#);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Handshake, status and control messages
//! - [`error`]: Error types

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{ClientHandshake, ControlMessage, ServerStatus, TerminalSize, STATUS_READY};
