use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{
    check_transition, generate_code, transition_payload, ActivationStore, SessionStore,
    CODE_ATTEMPTS,
};
use crate::error::SubbotError;
use crate::models::{
    AuthMethod, ChallengeUpdate, EventFilter, EventKind, EventLogEntry, GlobalActivationState,
    GroupActivationOverride, NewEvent, NewSession, SessionRecord, SessionStatus, StatusUpdate,
};

#[derive(Default)]
struct MemoryState {
    next_session_id: i64,
    next_event_id: i64,
    sessions: HashMap<String, SessionRecord>,
    events: Vec<EventLogEntry>,
    global: GlobalActivationState,
    groups: HashMap<String, GroupActivationOverride>,
}

/// In-process store with the same semantics as [`super::PgStore`].
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_event_log: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every event append fail, to exercise the best-effort path.
    pub fn set_event_log_failure(&self, fail: bool) {
        self.fail_event_log.store(fail, Ordering::SeqCst);
    }

    fn push_event(&self, state: &mut MemoryState, event: NewEvent) -> Result<EventLogEntry, SubbotError> {
        if self.fail_event_log.load(Ordering::SeqCst) {
            return Err(SubbotError::Persistence("event log unavailable".to_string()));
        }
        state.next_event_id += 1;
        let entry = EventLogEntry {
            id: state.next_event_id,
            code: event.code,
            event_kind: event.event_kind,
            payload: event.payload,
            created_at: Utc::now(),
        };
        state.events.push(entry.clone());
        Ok(entry)
    }

    /// Append inside the same critical section as the record write, warning on failure.
    fn log_best_effort(&self, state: &mut MemoryState, event: NewEvent) {
        let code = event.code.clone();
        if let Err(e) = self.push_event(state, event) {
            tracing::warn!(code = %code, error = %e, "Event log append failed; record write kept");
        }
    }
}

fn sorted(mut records: Vec<SessionRecord>) -> Vec<SessionRecord> {
    records.sort_by_key(|r| r.id);
    records
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create(&self, new: NewSession) -> Result<SessionRecord, SubbotError> {
        let mut state = self.state.lock().await;
        let mut code = generate_code();
        let mut attempts = 1;
        while state.sessions.contains_key(&code) {
            if attempts >= CODE_ATTEMPTS {
                return Err(SubbotError::Conflict(
                    "could not allocate a unique session code".to_string(),
                ));
            }
            code = generate_code();
            attempts += 1;
        }

        state.next_session_id += 1;
        let record = SessionRecord {
            id: state.next_session_id,
            code: code.clone(),
            owner_identifier: new.owner_identifier,
            owner_display_name: new.owner_display_name,
            method: new.method,
            status: SessionStatus::Pending,
            qr_payload: None,
            pairing_code: None,
            auth_data_path: None,
            created_at: Utc::now(),
            last_heartbeat_at: None,
            connected_at: None,
            is_active: false,
            message_count: 0,
            metadata: new.metadata,
        };
        state.sessions.insert(code.clone(), record.clone());
        let payload = serde_json::json!({
            "owner": record.owner_identifier,
            "method": record.method.as_str(),
        });
        self.log_best_effort(&mut state, NewEvent::new(code, EventKind::Created, payload));
        Ok(record)
    }

    async fn get(&self, code: &str) -> Result<Option<SessionRecord>, SubbotError> {
        Ok(self.state.lock().await.sessions.get(code).cloned())
    }

    async fn list_by_owner(&self, owner: &str) -> Result<Vec<SessionRecord>, SubbotError> {
        let state = self.state.lock().await;
        Ok(sorted(
            state
                .sessions
                .values()
                .filter(|r| r.owner_identifier == owner)
                .cloned()
                .collect(),
        ))
    }

    async fn list_all(&self) -> Result<Vec<SessionRecord>, SubbotError> {
        let state = self.state.lock().await;
        Ok(sorted(state.sessions.values().cloned().collect()))
    }

    async fn list_by_status(
        &self,
        statuses: &[SessionStatus],
    ) -> Result<Vec<SessionRecord>, SubbotError> {
        let state = self.state.lock().await;
        Ok(sorted(
            state
                .sessions
                .values()
                .filter(|r| statuses.contains(&r.status))
                .cloned()
                .collect(),
        ))
    }

    async fn list_recoverable(&self) -> Result<Vec<SessionRecord>, SubbotError> {
        let state = self.state.lock().await;
        Ok(sorted(
            state
                .sessions
                .values()
                .filter(|r| r.is_active || SessionStatus::RECOVERABLE.contains(&r.status))
                .cloned()
                .collect(),
        ))
    }

    async fn update_status(
        &self,
        code: &str,
        update: StatusUpdate,
    ) -> Result<SessionRecord, SubbotError> {
        let mut state = self.state.lock().await;
        let record = state
            .sessions
            .get_mut(code)
            .ok_or_else(|| SubbotError::Conflict(format!("session {} not found", code)))?;

        let from = record.status;
        check_transition(code, from, update.status)?;

        let now = Utc::now();
        record.status = update.status;
        record.is_active = update.status == SessionStatus::Connected;
        if update.status == SessionStatus::Connected {
            record.connected_at = Some(now);
            record.last_heartbeat_at = Some(record.last_heartbeat_at.map_or(now, |t| t.max(now)));
        }
        if let Some(credential) = &update.credential {
            record.auth_data_path = Some(credential.clone());
        }
        if update.clear_challenge {
            record.qr_payload = None;
            record.pairing_code = None;
        }
        let updated = record.clone();

        let payload = transition_payload(from, &update);
        self.log_best_effort(
            &mut state,
            NewEvent::new(code, EventKind::Transition, payload),
        );
        Ok(updated)
    }

    async fn reactivate(
        &self,
        code: &str,
        method: AuthMethod,
        actor: &str,
    ) -> Result<SessionRecord, SubbotError> {
        let mut state = self.state.lock().await;
        let record = state
            .sessions
            .get_mut(code)
            .ok_or_else(|| SubbotError::Conflict(format!("session {} not found", code)))?;

        let from = record.status;
        if !from.is_terminal() {
            return Err(SubbotError::InvalidTransition {
                code: code.to_string(),
                from,
                to: SessionStatus::Pending,
            });
        }
        record.status = SessionStatus::Pending;
        record.method = method;
        record.is_active = false;
        record.qr_payload = None;
        record.pairing_code = None;
        record.auth_data_path = None;
        let updated = record.clone();

        let payload = serde_json::json!({
            "from": from.as_str(),
            "method": method.as_str(),
            "actor": actor,
        });
        self.log_best_effort(
            &mut state,
            NewEvent::new(code, EventKind::Reactivated, payload),
        );
        Ok(updated)
    }

    async fn update_challenge(
        &self,
        code: &str,
        challenge: ChallengeUpdate,
    ) -> Result<(), SubbotError> {
        let mut state = self.state.lock().await;
        let record = state
            .sessions
            .get_mut(code)
            .ok_or_else(|| SubbotError::Conflict(format!("session {} not found", code)))?;
        if challenge.qr_payload.is_some() {
            record.qr_payload = challenge.qr_payload;
        }
        if challenge.pairing_code.is_some() {
            record.pairing_code = challenge.pairing_code;
        }
        Ok(())
    }

    async fn update_credentials(&self, code: &str, credential: &str) -> Result<(), SubbotError> {
        let mut state = self.state.lock().await;
        let record = state
            .sessions
            .get_mut(code)
            .ok_or_else(|| SubbotError::Conflict(format!("session {} not found", code)))?;
        record.auth_data_path = Some(credential.to_string());
        Ok(())
    }

    async fn record_heartbeat(&self, code: &str, at: DateTime<Utc>) -> Result<bool, SubbotError> {
        let mut state = self.state.lock().await;
        match state.sessions.get_mut(code) {
            Some(record) if record.status == SessionStatus::Connected => {
                record.last_heartbeat_at = Some(record.last_heartbeat_at.map_or(at, |t| t.max(at)));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment_message_count(&self, code: &str) -> Result<i64, SubbotError> {
        let mut state = self.state.lock().await;
        let record = state
            .sessions
            .get_mut(code)
            .ok_or_else(|| SubbotError::Conflict(format!("session {} not found", code)))?;
        record.message_count += 1;
        Ok(record.message_count)
    }

    async fn delete(&self, code: &str) -> Result<bool, SubbotError> {
        Ok(self.state.lock().await.sessions.remove(code).is_some())
    }

    async fn append_event(&self, event: NewEvent) -> Result<EventLogEntry, SubbotError> {
        let mut state = self.state.lock().await;
        self.push_event(&mut state, event)
    }

    async fn query_events(&self, filter: &EventFilter) -> Result<Vec<EventLogEntry>, SubbotError> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .skip(filter.effective_offset() as usize)
            .take(filter.effective_limit() as usize)
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> Result<String, SubbotError> {
        Ok("memory".to_string())
    }
}

#[async_trait]
impl ActivationStore for MemoryStore {
    async fn global_state(&self) -> Result<GlobalActivationState, SubbotError> {
        Ok(self.state.lock().await.global.clone())
    }

    async fn set_global_state(
        &self,
        is_on: bool,
        actor: &str,
    ) -> Result<GlobalActivationState, SubbotError> {
        let mut state = self.state.lock().await;
        state.global = GlobalActivationState {
            is_on,
            last_changed_by: Some(actor.to_string()),
            last_changed_at: Utc::now(),
        };
        Ok(state.global.clone())
    }

    async fn group_state(
        &self,
        group_identifier: &str,
    ) -> Result<Option<GroupActivationOverride>, SubbotError> {
        Ok(self.state.lock().await.groups.get(group_identifier).cloned())
    }

    async fn set_group_state(
        &self,
        group_identifier: &str,
        is_active: bool,
        actor: &str,
    ) -> Result<GroupActivationOverride, SubbotError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let entry = state
            .groups
            .entry(group_identifier.to_string())
            .or_insert_with(|| GroupActivationOverride {
                group_identifier: group_identifier.to_string(),
                is_active,
                updated_by: None,
                created_at: now,
                updated_at: now,
            });
        entry.is_active = is_active;
        entry.updated_by = Some(actor.to_string());
        entry.updated_at = now;
        Ok(entry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn new_session(owner: &str, method: AuthMethod) -> NewSession {
        NewSession {
            owner_identifier: owner.to_string(),
            owner_display_name: Some("Tester".to_string()),
            method,
            metadata: serde_json::json!({"creatorPushName": "Tester"}),
        }
    }

    #[tokio::test]
    async fn test_create_allocates_unique_pending_records() {
        let store = MemoryStore::new();
        let mut codes = HashSet::new();
        for _ in 0..200 {
            let record = store.create(new_session("549111", AuthMethod::Qr)).await.unwrap();
            assert_eq!(record.status, SessionStatus::Pending);
            assert!(!record.is_active);
            assert!(codes.insert(record.code));
        }
        assert_eq!(store.list_by_owner("549111").await.unwrap().len(), 200);
    }

    #[tokio::test]
    async fn test_update_unknown_code_is_conflict() {
        let store = MemoryStore::new();
        let err = store
            .update_status("SB-NOPE", StatusUpdate::to(SessionStatus::WaitingScan))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn test_is_active_tracks_connected_through_every_transition() {
        let store = MemoryStore::new();
        let record = store.create(new_session("549111", AuthMethod::Pairing)).await.unwrap();
        let path = [
            SessionStatus::WaitingPairing,
            SessionStatus::Connected,
            SessionStatus::Disconnected,
            SessionStatus::Reconnecting,
            SessionStatus::Connected,
            SessionStatus::Inactive,
        ];
        for status in path {
            let updated = store
                .update_status(&record.code, StatusUpdate::to(status))
                .await
                .unwrap();
            assert_eq!(updated.is_active, status == SessionStatus::Connected);
        }
    }

    #[tokio::test]
    async fn test_terminal_state_rejects_transition_and_keeps_record() {
        let store = MemoryStore::new();
        let record = store.create(new_session("549111", AuthMethod::Qr)).await.unwrap();
        store
            .update_status(&record.code, StatusUpdate::to(SessionStatus::Error).reason("banned"))
            .await
            .unwrap();
        let before = store.get(&record.code).await.unwrap().unwrap();

        let err = store
            .update_status(&record.code, StatusUpdate::to(SessionStatus::Reconnecting))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_transition");
        assert_eq!(store.get(&record.code).await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn test_reactivate_only_from_terminal() {
        let store = MemoryStore::new();
        let record = store.create(new_session("549111", AuthMethod::Qr)).await.unwrap();
        assert!(store.reactivate(&record.code, AuthMethod::Qr, "admin").await.is_err());

        store
            .update_status(&record.code, StatusUpdate::to(SessionStatus::Inactive))
            .await
            .unwrap();
        let again = store
            .reactivate(&record.code, AuthMethod::Pairing, "admin")
            .await
            .unwrap();
        assert_eq!(again.status, SessionStatus::Pending);
        assert_eq!(again.method, AuthMethod::Pairing);
        assert_eq!(again.code, record.code);
    }

    #[tokio::test]
    async fn test_connected_stamps_and_heartbeat_is_monotonic() {
        let store = MemoryStore::new();
        let record = store.create(new_session("549111", AuthMethod::Qr)).await.unwrap();
        assert!(!store.record_heartbeat(&record.code, Utc::now()).await.unwrap());

        store
            .update_status(&record.code, StatusUpdate::to(SessionStatus::WaitingScan))
            .await
            .unwrap();
        let connected = store
            .update_status(
                &record.code,
                StatusUpdate::to(SessionStatus::Connected)
                    .credential("auth/SB-1")
                    .clear_challenge(),
            )
            .await
            .unwrap();
        assert!(connected.connected_at.is_some());
        assert_eq!(connected.auth_data_path.as_deref(), Some("auth/SB-1"));

        let later = Utc::now() + chrono::Duration::seconds(60);
        assert!(store.record_heartbeat(&record.code, later).await.unwrap());
        let earlier = Utc::now() - chrono::Duration::seconds(60);
        assert!(store.record_heartbeat(&record.code, earlier).await.unwrap());
        let current = store.get(&record.code).await.unwrap().unwrap();
        assert_eq!(current.last_heartbeat_at, Some(later));
    }

    #[tokio::test]
    async fn test_transitions_are_logged() {
        let store = MemoryStore::new();
        let record = store.create(new_session("549111", AuthMethod::Qr)).await.unwrap();
        store
            .update_status(&record.code, StatusUpdate::to(SessionStatus::WaitingScan))
            .await
            .unwrap();

        let events = store
            .query_events(&EventFilter::for_code(record.code.clone()))
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_kind, EventKind::Transition);
        assert_eq!(events[0].payload["to"], "waiting_scan");
        assert_eq!(events[1].event_kind, EventKind::Created);
    }

    #[tokio::test]
    async fn test_event_log_failure_does_not_fail_the_write() {
        let store = MemoryStore::new();
        let record = store.create(new_session("549111", AuthMethod::Qr)).await.unwrap();
        store.set_event_log_failure(true);

        let updated = store
            .update_status(&record.code, StatusUpdate::to(SessionStatus::WaitingScan))
            .await
            .unwrap();
        assert_eq!(updated.status, SessionStatus::WaitingScan);

        store.set_event_log_failure(false);
        let events = store.query_events(&EventFilter::default()).await.unwrap();
        assert_eq!(events.len(), 1, "only the creation event was recorded");
    }

    #[tokio::test]
    async fn test_query_events_paginates_newest_first() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .append_event(NewEvent::new(
                    "SB-1",
                    EventKind::Launch,
                    serde_json::json!({ "n": i }),
                ))
                .await
                .unwrap();
        }
        let page = store
            .query_events(&EventFilter {
                code: Some("SB-1".into()),
                event_kind: None,
                limit: Some(2),
                offset: Some(1),
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].payload["n"], 3);
        assert_eq!(page[1].payload["n"], 2);
    }

    #[tokio::test]
    async fn test_recoverable_set() {
        let store = MemoryStore::new();
        let a = store.create(new_session("1", AuthMethod::Qr)).await.unwrap();
        let b = store.create(new_session("2", AuthMethod::Qr)).await.unwrap();
        let _pending = store.create(new_session("3", AuthMethod::Qr)).await.unwrap();
        store
            .update_status(&a.code, StatusUpdate::to(SessionStatus::WaitingScan))
            .await
            .unwrap();
        store
            .update_status(&b.code, StatusUpdate::to(SessionStatus::Inactive))
            .await
            .unwrap();

        let recoverable = store.list_recoverable().await.unwrap();
        assert_eq!(recoverable.len(), 1);
        assert_eq!(recoverable[0].code, a.code);
    }

    #[tokio::test]
    async fn test_activation_flags() {
        let store = MemoryStore::new();
        assert!(store.global_state().await.unwrap().is_on);
        let off = store.set_global_state(false, "admin").await.unwrap();
        assert!(!off.is_on);
        assert_eq!(off.last_changed_by.as_deref(), Some("admin"));

        assert!(store.group_state("g1@g.us").await.unwrap().is_none());
        store.set_group_state("g1@g.us", false, "mod").await.unwrap();
        let group = store.set_group_state("g1@g.us", true, "mod2").await.unwrap();
        assert!(group.is_active);
        assert_eq!(group.updated_by.as_deref(), Some("mod2"));
        assert!(group.updated_at >= group.created_at);
    }
}
