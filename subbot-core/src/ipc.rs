use serde::{Deserialize, Serialize};

use crate::error::SubbotError;
use crate::models::{AuthMethod, EventKind};

pub const PROTOCOL_VERSION: &str = "subbot/1";

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SubbotRequest {
    Ping,
    Health,
    CreateSession {
        owner: String,
        display_name: Option<String>,
        method: AuthMethod,
        /// Overrides the digits taken from `owner` for pairing.
        phone_number: Option<String>,
    },
    GetSession {
        code: String,
    },
    ListSessions {
        owner: String,
    },
    ListAllSessions,
    DeactivateSession {
        code: String,
        actor: Option<String>,
    },
    RevokeSession {
        code: String,
        actor: Option<String>,
    },
    ReauthenticateSession {
        code: String,
        method: AuthMethod,
        phone_number: Option<String>,
        actor: Option<String>,
    },
    RelaunchSession {
        code: String,
    },
    RecordMessage {
        code: String,
    },
    Events {
        code: Option<String>,
        event_kind: Option<EventKind>,
        limit: Option<u32>,
        offset: Option<u32>,
    },
    GlobalActivation,
    SetGlobalActivation {
        is_on: bool,
        actor: String,
    },
    GroupActivation {
        group: String,
    },
    SetGroupActivation {
        group: String,
        is_active: bool,
        actor: String,
    },
}

/// Structured result for the command layer. Failures never cross this
/// boundary as anything but `status = "error"` plus a readable message.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SubbotResponse {
    pub status: String,
    pub message: String,
    pub data: Option<serde_json::Value>,
    pub error_kind: Option<String>,
    pub version: String,
}

impl SubbotResponse {
    pub fn ok(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            status: "ok".to_string(),
            message: message.into(),
            data: Some(data),
            error_kind: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: msg.into(),
            data: None,
            error_kind: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn from_error(e: &SubbotError) -> Self {
        let mut resp = Self::err(e.to_string());
        resp.error_kind = Some(e.kind().to_string());
        resp
    }

    pub fn pong() -> Self {
        Self::ok("pong", serde_json::json!({"pong": true}))
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}
