use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SubbotError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Launch,
    Transition,
    CredentialsUpdated,
    ReconnectExhausted,
    Reactivated,
    Revoked,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::Created,
        EventKind::Launch,
        EventKind::Transition,
        EventKind::CredentialsUpdated,
        EventKind::ReconnectExhausted,
        EventKind::Reactivated,
        EventKind::Revoked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Launch => "launch",
            EventKind::Transition => "transition",
            EventKind::CredentialsUpdated => "credentials_updated",
            EventKind::ReconnectExhausted => "reconnect_exhausted",
            EventKind::Reactivated => "reactivated",
            EventKind::Revoked => "revoked",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = SubbotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .find(|kind| kind.as_str() == s)
            .copied()
            .ok_or_else(|| SubbotError::Validation(format!("unknown event kind '{}'", s)))
    }
}

/// Append-only audit entry. Never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventLogEntry {
    pub id: i64,
    pub code: String,
    pub event_kind: EventKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub code: String,
    pub event_kind: EventKind,
    pub payload: serde_json::Value,
}

impl NewEvent {
    pub fn new(code: impl Into<String>, event_kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            code: code.into(),
            event_kind,
            payload,
        }
    }
}

pub const DEFAULT_EVENT_PAGE: u32 = 50;
pub const MAX_EVENT_PAGE: u32 = 500;

/// Read-only query over the event log, newest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub code: Option<String>,
    pub event_kind: Option<EventKind>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl EventFilter {
    pub fn for_code(code: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            ..Default::default()
        }
    }

    pub fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_EVENT_PAGE).clamp(1, MAX_EVENT_PAGE)
    }

    pub fn effective_offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }

    pub fn matches(&self, entry: &EventLogEntry) -> bool {
        self.code.as_deref().map_or(true, |c| c == entry.code)
            && self.event_kind.map_or(true, |k| k == entry.event_kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_is_clamped() {
        let f = EventFilter {
            limit: Some(10_000),
            ..Default::default()
        };
        assert_eq!(f.effective_limit(), MAX_EVENT_PAGE);
        assert_eq!(EventFilter::default().effective_limit(), DEFAULT_EVENT_PAGE);
        let zero = EventFilter {
            limit: Some(0),
            ..Default::default()
        };
        assert_eq!(zero.effective_limit(), 1);
    }

    #[test]
    fn test_filter_matches_code_and_kind() {
        let entry = EventLogEntry {
            id: 1,
            code: "SB-1".into(),
            event_kind: EventKind::Launch,
            payload: serde_json::json!({}),
            created_at: Utc::now(),
        };
        assert!(EventFilter::for_code("SB-1").matches(&entry));
        assert!(!EventFilter::for_code("SB-2").matches(&entry));
        let by_kind = EventFilter {
            event_kind: Some(EventKind::Transition),
            ..Default::default()
        };
        assert!(!by_kind.matches(&entry));
    }

    #[test]
    fn test_kind_parses() {
        assert_eq!(
            "reconnect_exhausted".parse::<EventKind>().unwrap(),
            EventKind::ReconnectExhausted
        );
        assert!("heartbeat".parse::<EventKind>().is_err());
    }
}
