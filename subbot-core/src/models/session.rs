use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SubbotError;

/// How a sub-bot proves ownership of its chat account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Qr,
    Pairing,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Qr => "qr",
            AuthMethod::Pairing => "pairing",
        }
    }

    /// The `waiting_*` status this method parks in until the user confirms.
    pub fn waiting_status(&self) -> SessionStatus {
        match self {
            AuthMethod::Qr => SessionStatus::WaitingScan,
            AuthMethod::Pairing => SessionStatus::WaitingPairing,
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMethod {
    type Err = SubbotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "qr" => Ok(AuthMethod::Qr),
            "pairing" | "code" => Ok(AuthMethod::Pairing),
            other => Err(SubbotError::Validation(format!(
                "unknown auth method '{}', expected 'qr' or 'pairing'",
                other
            ))),
        }
    }
}

/// Lifecycle state of a sub-bot session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    WaitingScan,
    WaitingPairing,
    Connected,
    Disconnected,
    Reconnecting,
    Inactive,
    Error,
}

impl SessionStatus {
    pub const ALL: [SessionStatus; 8] = [
        SessionStatus::Pending,
        SessionStatus::WaitingScan,
        SessionStatus::WaitingPairing,
        SessionStatus::Connected,
        SessionStatus::Disconnected,
        SessionStatus::Reconnecting,
        SessionStatus::Inactive,
        SessionStatus::Error,
    ];

    /// Statuses the recovery pass relaunches after a restart.
    pub const RECOVERABLE: [SessionStatus; 4] = [
        SessionStatus::Connected,
        SessionStatus::WaitingScan,
        SessionStatus::WaitingPairing,
        SessionStatus::Reconnecting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::WaitingScan => "waiting_scan",
            SessionStatus::WaitingPairing => "waiting_pairing",
            SessionStatus::Connected => "connected",
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Reconnecting => "reconnecting",
            SessionStatus::Inactive => "inactive",
            SessionStatus::Error => "error",
        }
    }

    /// Terminal states only leave through an explicit operator re-authentication.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Inactive | SessionStatus::Error)
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self, SessionStatus::WaitingScan | SessionStatus::WaitingPairing)
    }

    /// States in which a second launch for the same code is rejected.
    pub fn holds_connection(&self) -> bool {
        matches!(
            self,
            SessionStatus::WaitingScan
                | SessionStatus::WaitingPairing
                | SessionStatus::Connected
                | SessionStatus::Reconnecting
        )
    }

    /// The legal edges of the lifecycle state machine.
    ///
    /// `error`/`inactive -> pending` is deliberately absent: that edge is only
    /// taken by the store's `reactivate` operation.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Pending, WaitingScan | WaitingPairing | Error | Inactive) => true,
            (WaitingScan | WaitingPairing, Connected | Disconnected | Reconnecting | Error | Inactive) => {
                true
            }
            (Connected, Disconnected | Reconnecting | Error | Inactive) => true,
            (Disconnected, Reconnecting | Error | Inactive) => true,
            (
                Reconnecting,
                Connected | Disconnected | WaitingScan | WaitingPairing | Error | Inactive,
            ) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = SubbotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SessionStatus::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| SubbotError::Validation(format!("unknown session status '{}'", s)))
    }
}

/// One sub-bot session as persisted by the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub id: i64,
    pub code: String,
    pub owner_identifier: String,
    pub owner_display_name: Option<String>,
    pub method: AuthMethod,
    pub status: SessionStatus,
    pub qr_payload: Option<String>,
    pub pairing_code: Option<String>,
    pub auth_data_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub message_count: i64,
    pub metadata: serde_json::Value,
}

impl SessionRecord {
    /// Most recent evidence of liveness, falling back to when the session connected.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_heartbeat_at
            .or(self.connected_at)
            .unwrap_or(self.created_at)
    }

    pub fn has_credentials(&self) -> bool {
        self.auth_data_path.is_some()
    }
}

/// Input for allocating a new session record.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub owner_identifier: String,
    pub owner_display_name: Option<String>,
    pub method: AuthMethod,
    pub metadata: serde_json::Value,
}

/// A requested status change plus the fields that move with it.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub status: SessionStatus,
    pub reason: Option<String>,
    /// New credential handle to persist alongside the transition.
    pub credential: Option<String>,
    /// Clears the transient QR payload and pairing code.
    pub clear_challenge: bool,
}

impl StatusUpdate {
    pub fn to(status: SessionStatus) -> Self {
        Self {
            status,
            reason: None,
            credential: None,
            clear_challenge: false,
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    pub fn clear_challenge(mut self) -> Self {
        self.clear_challenge = true;
        self
    }
}

/// Transient authentication artefacts shown to the user.
#[derive(Debug, Clone, Default)]
pub struct ChallengeUpdate {
    pub qr_payload: Option<String>,
    pub pairing_code: Option<String>,
}
