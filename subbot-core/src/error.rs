use thiserror::Error;

use crate::models::SessionStatus;
use crate::protocol::ProtocolError;

#[derive(Error, Debug)]
pub enum SubbotError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Session {0} already has a live connection")]
    AlreadyActive(String),

    #[error("Capacity exceeded: {scope} limit of {limit} active sessions reached")]
    CapacityExceeded { scope: String, limit: usize },

    #[error("Invalid pairing code: {0}")]
    InvalidCode(String),

    #[error("Invalid transition for {code}: {from} -> {to}")]
    InvalidTransition {
        code: String,
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for SubbotError {
    fn from(e: sqlx::Error) -> Self {
        SubbotError::Persistence(e.to_string())
    }
}

impl SubbotError {
    /// Stable identifier carried in structured responses.
    pub fn kind(&self) -> &'static str {
        match self {
            SubbotError::Validation(_) => "validation",
            SubbotError::NotFound(_) => "not_found",
            SubbotError::Conflict(_) => "conflict",
            SubbotError::AlreadyActive(_) => "already_active",
            SubbotError::CapacityExceeded { .. } => "capacity_exceeded",
            SubbotError::InvalidCode(_) => "invalid_code",
            SubbotError::InvalidTransition { .. } => "invalid_transition",
            SubbotError::Protocol(_) => "protocol",
            SubbotError::Persistence(_) => "persistence",
            SubbotError::Config(_) => "config",
            SubbotError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_stable_snake_case() {
        assert_eq!(SubbotError::Validation("x".into()).kind(), "validation");
        assert_eq!(SubbotError::NotFound("SB-1".into()).kind(), "not_found");
        assert_eq!(
            SubbotError::CapacityExceeded {
                scope: "global".into(),
                limit: 2
            }
            .kind(),
            "capacity_exceeded"
        );
        assert_eq!(
            SubbotError::InvalidTransition {
                code: "SB-1".into(),
                from: SessionStatus::Inactive,
                to: SessionStatus::Connected,
            }
            .kind(),
            "invalid_transition"
        );
    }

    #[test]
    fn test_sqlx_errors_map_to_persistence() {
        let err: SubbotError = sqlx::Error::PoolTimedOut.into();
        assert_eq!(err.kind(), "persistence");
    }

    #[test]
    fn test_transition_message_names_both_states() {
        let err = SubbotError::InvalidTransition {
            code: "SB-1".into(),
            from: SessionStatus::Error,
            to: SessionStatus::Connected,
        };
        assert_eq!(err.to_string(), "Invalid transition for SB-1: error -> connected");
    }
}
