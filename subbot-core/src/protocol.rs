//! Contract with the chat-network protocol engine.
//!
//! The orchestrator never speaks the wire protocol itself. It opens a
//! connection through a [`ProtocolClient`], receives the engine's lifecycle
//! callbacks as a closed set of [`LifecycleEvent`] variants on one channel, and
//! treats credential handles as opaque strings to persist and replay.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Why the engine closed a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum CloseReason {
    ConnectionLost,
    TimedOut,
    RestartRequired,
    LoggedOut,
    Banned,
    Replaced,
    Other(String),
}

impl CloseReason {
    /// The remote network rejected the credentials for good.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            CloseReason::LoggedOut | CloseReason::Banned | CloseReason::Replaced
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ConnectionLost => f.write_str("connection_lost"),
            CloseReason::TimedOut => f.write_str("timed_out"),
            CloseReason::RestartRequired => f.write_str("restart_required"),
            CloseReason::LoggedOut => f.write_str("logged_out"),
            CloseReason::Banned => f.write_str("banned"),
            CloseReason::Replaced => f.write_str("replaced"),
            CloseReason::Other(detail) => write!(f, "other: {}", detail),
        }
    }
}

/// Lifecycle callbacks from the engine, one channel per connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    QrUpdated { payload: String },
    PairingCodeReady { code: String },
    Authenticated { credential: String },
    CredentialsUpdated { credential: String },
    Closed { reason: CloseReason },
}

#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("connection closed: {0}")]
    Closed(CloseReason),

    #[error("pairing code rejected: {0}")]
    PairingRejected(String),

    #[error("credentials rejected by the remote network: {0}")]
    CredentialsRejected(String),

    #[error("gateway error: {0}")]
    Gateway(String),
}

impl ProtocolError {
    /// Permanent failures move a session to `error`; everything else is retried.
    pub fn is_permanent(&self) -> bool {
        match self {
            ProtocolError::CredentialsRejected(_) => true,
            ProtocolError::Closed(reason) => reason.is_permanent(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub session_code: String,
    /// Replayed credential handle; `None` starts a fresh authentication.
    pub credential: Option<String>,
}

/// A live connection as seen by its supervisor.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Ask the engine for a pairing code, optionally proposing our own.
    async fn request_pairing_code(
        &self,
        phone_number: &str,
        custom_code: Option<&str>,
    ) -> Result<String, ProtocolError>;

    /// Round-trip liveness probe used for heartbeats.
    async fn ping(&self) -> Result<(), ProtocolError>;

    /// Close the connection. Idempotent.
    async fn close(&self);
}

pub struct ConnectionHandle {
    pub connection: Arc<dyn Connection>,
    pub events: mpsc::Receiver<LifecycleEvent>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ProtocolClient: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> Result<ConnectionHandle, ProtocolError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_close_reasons() {
        assert!(CloseReason::LoggedOut.is_permanent());
        assert!(CloseReason::Banned.is_permanent());
        assert!(!CloseReason::ConnectionLost.is_permanent());
        assert!(!CloseReason::RestartRequired.is_permanent());
    }

    #[test]
    fn test_protocol_error_permanence() {
        assert!(ProtocolError::CredentialsRejected("revoked".into()).is_permanent());
        assert!(ProtocolError::Closed(CloseReason::Replaced).is_permanent());
        assert!(!ProtocolError::Timeout(5).is_permanent());
        assert!(!ProtocolError::Connect("refused".into()).is_permanent());
    }

    #[test]
    fn test_lifecycle_event_wire_shape() {
        let ev = LifecycleEvent::Closed {
            reason: CloseReason::Other("stream errored".into()),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "closed");
        assert_eq!(json["reason"]["reason"], "other");
        assert_eq!(json["reason"]["detail"], "stream errored");

        let back: LifecycleEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, ev);
    }
}
