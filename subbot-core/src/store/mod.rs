//! Session Record Store: the single source of truth for session lifecycle.
//!
//! Two backends share one contract: [`PgStore`] for deployments and
//! [`MemoryStore`] for tests and ephemeral runs. Every status-changing write
//! validates the edge against [`SessionStatus::can_transition_to`], derives
//! `is_active` from the new status and appends a `transition` event. The event
//! append is best-effort: a failure there is logged, never returned.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SubbotError;
use crate::models::{
    ChallengeUpdate, EventFilter, EventLogEntry, GlobalActivationState, GroupActivationOverride,
    NewEvent, NewSession, SessionRecord, SessionStatus, StatusUpdate,
};

/// How many times `create` draws a fresh code before giving up.
pub const CODE_ATTEMPTS: usize = 5;

/// `SB-` followed by eight upper-case hex characters.
pub fn generate_code() -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("SB-{}", raw[..8].to_ascii_uppercase())
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Allocate a `pending` record with a fresh unique code.
    async fn create(&self, new: NewSession) -> Result<SessionRecord, SubbotError>;

    async fn get(&self, code: &str) -> Result<Option<SessionRecord>, SubbotError>;

    async fn list_by_owner(&self, owner: &str) -> Result<Vec<SessionRecord>, SubbotError>;

    async fn list_all(&self) -> Result<Vec<SessionRecord>, SubbotError>;

    async fn list_by_status(
        &self,
        statuses: &[SessionStatus],
    ) -> Result<Vec<SessionRecord>, SubbotError>;

    /// Records the recovery pass relaunches: `is_active` or a recoverable status.
    async fn list_recoverable(&self) -> Result<Vec<SessionRecord>, SubbotError>;

    /// Atomic, validated status change.
    ///
    /// Fails with `Conflict` when the code is unknown (or was deleted
    /// concurrently) and with `InvalidTransition` when the edge is illegal.
    async fn update_status(
        &self,
        code: &str,
        update: StatusUpdate,
    ) -> Result<SessionRecord, SubbotError>;

    /// Operator re-authentication: `error`/`inactive` back to `pending`.
    async fn reactivate(
        &self,
        code: &str,
        method: crate::models::AuthMethod,
        actor: &str,
    ) -> Result<SessionRecord, SubbotError>;

    async fn update_challenge(
        &self,
        code: &str,
        challenge: ChallengeUpdate,
    ) -> Result<(), SubbotError>;

    async fn update_credentials(&self, code: &str, credential: &str) -> Result<(), SubbotError>;

    /// Returns `false` when the session is not `connected`. Never moves the
    /// timestamp backwards.
    async fn record_heartbeat(&self, code: &str, at: DateTime<Utc>) -> Result<bool, SubbotError>;

    async fn increment_message_count(&self, code: &str) -> Result<i64, SubbotError>;

    /// Physical removal. Only explicit revocation calls this.
    async fn delete(&self, code: &str) -> Result<bool, SubbotError>;

    async fn append_event(&self, event: NewEvent) -> Result<EventLogEntry, SubbotError>;

    async fn query_events(&self, filter: &EventFilter) -> Result<Vec<EventLogEntry>, SubbotError>;

    /// Backend identification for health reporting; fails when unreachable.
    async fn health_check(&self) -> Result<String, SubbotError>;
}

/// Global and per-group activation flags read by the command layer.
#[async_trait]
pub trait ActivationStore: Send + Sync {
    async fn global_state(&self) -> Result<GlobalActivationState, SubbotError>;

    async fn set_global_state(
        &self,
        is_on: bool,
        actor: &str,
    ) -> Result<GlobalActivationState, SubbotError>;

    async fn group_state(
        &self,
        group_identifier: &str,
    ) -> Result<Option<GroupActivationOverride>, SubbotError>;

    async fn set_group_state(
        &self,
        group_identifier: &str,
        is_active: bool,
        actor: &str,
    ) -> Result<GroupActivationOverride, SubbotError>;
}

/// Both halves of the persistence contract behind one object.
pub trait Store: SessionStore + ActivationStore {}

impl<T: SessionStore + ActivationStore> Store for T {}

/// Validate an edge, producing the taxonomy error the contract promises.
pub(crate) fn check_transition(
    code: &str,
    from: SessionStatus,
    to: SessionStatus,
) -> Result<(), SubbotError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(SubbotError::InvalidTransition {
            code: code.to_string(),
            from,
            to,
        })
    }
}

pub(crate) fn transition_payload(
    from: SessionStatus,
    update: &StatusUpdate,
) -> serde_json::Value {
    serde_json::json!({
        "from": from.as_str(),
        "to": update.status.as_str(),
        "reason": update.reason,
    })
}
