use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Process-wide master switch consulted by the command layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalActivationState {
    pub is_on: bool,
    pub last_changed_by: Option<String>,
    pub last_changed_at: DateTime<Utc>,
}

impl Default for GlobalActivationState {
    fn default() -> Self {
        Self {
            is_on: true,
            last_changed_by: None,
            last_changed_at: Utc::now(),
        }
    }
}

/// Per chat-group override of whether the bot answers there.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupActivationOverride {
    pub group_identifier: String,
    pub is_active: bool,
    pub updated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
