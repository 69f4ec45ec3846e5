//! Connection supervisor
//!
//! One tokio task per live session code. The task owns the protocol
//! connection, consumes its lifecycle events, writes every status change
//! through the store, pings for heartbeats while connected and reconnects with
//! capped exponential backoff after transient losses.
//!
//! Whoever launched the session gets exactly one answer on a oneshot: the
//! first authentication challenge, `Resumed` once stored credentials are
//! accepted, or the error that ended the first attempt.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use subbot_core::config::SubbotConfig;
use subbot_core::models::{
    AuthMethod, ChallengeUpdate, EventKind, NewEvent, SessionRecord, SessionStatus, StatusUpdate,
};
use subbot_core::{
    CloseReason, ConnectRequest, Connection, ConnectionHandle, LifecycleEvent, ProtocolClient,
    ProtocolError, Store, SubbotError,
};
use tokio::sync::{mpsc, oneshot};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::auth::{AuthChallenge, AuthIssuer};
use super::registry::{Control, Reservation, SessionEntry, SessionRegistry};

pub type LaunchOutcome = Result<AuthChallenge, SubbotError>;

// ============================================================================
// SETTINGS
// ============================================================================

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: usize,
    pub jitter: bool,
}

impl ReconnectPolicy {
    /// `initial, 2*initial, 4*initial, ...` capped at `max_delay_ms`, at most
    /// `max_attempts` entries.
    pub fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send + Sync> {
        // from_millis(2) doubles each step; the factor scales it to the initial delay
        let factor = (self.initial_delay_ms / 2).max(1);
        let base = ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(Duration::from_millis(self.max_delay_ms.max(1)))
            .take(self.max_attempts);
        if self.jitter {
            Box::new(base.map(jitter))
        } else {
            Box::new(base)
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub heartbeat_interval: Duration,
    pub auth_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl SupervisorSettings {
    pub fn from_config(config: &SubbotConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat.interval(),
            auth_timeout: config.auth.auth_timeout(),
            reconnect: ReconnectPolicy {
                initial_delay_ms: config.supervisor.reconnect_initial_delay_ms,
                max_delay_ms: config.supervisor.reconnect_max_delay_ms,
                max_attempts: config.supervisor.reconnect_max_attempts,
                jitter: config.supervisor.reconnect_jitter,
            },
        }
    }
}

// ============================================================================
// PUBLIC API
// ============================================================================

#[derive(Debug, Clone)]
pub enum LaunchMode {
    /// New authentication with the given method.
    Fresh {
        method: AuthMethod,
        phone_number: Option<String>,
    },
    /// Replay the stored credential handle.
    Resume,
}

impl LaunchMode {
    fn as_str(&self) -> &'static str {
        match self {
            LaunchMode::Fresh { .. } => "fresh",
            LaunchMode::Resume => "resume",
        }
    }
}

#[derive(Clone)]
pub struct ConnectionSupervisor {
    store: Arc<dyn Store>,
    protocol: Arc<dyn ProtocolClient>,
    registry: SessionRegistry,
    issuer: Arc<AuthIssuer>,
    settings: SupervisorSettings,
    tracker: TaskTracker,
}

impl ConnectionSupervisor {
    pub fn new(
        store: Arc<dyn Store>,
        protocol: Arc<dyn ProtocolClient>,
        registry: SessionRegistry,
        issuer: Arc<AuthIssuer>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            store,
            protocol,
            registry,
            issuer,
            settings,
            tracker: TaskTracker::new(),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn issuer(&self) -> &AuthIssuer {
        &self.issuer
    }

    pub fn reserve(&self, record: &SessionRecord) -> Result<Reservation, SubbotError> {
        self.registry
            .reserve(&record.code, &record.owner_identifier)
    }

    /// Start the supervisor task for a reserved code.
    pub fn spawn(
        &self,
        reservation: Reservation,
        record: SessionRecord,
        mode: LaunchMode,
    ) -> oneshot::Receiver<LaunchOutcome> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (entry, control_rx, cancel) = reservation.into_parts();
        let task = SessionTask {
            code: record.code.clone(),
            store: Arc::clone(&self.store),
            protocol: Arc::clone(&self.protocol),
            registry: self.registry.clone(),
            issuer: Arc::clone(&self.issuer),
            backoff: self.settings.reconnect.delays(),
            settings: self.settings.clone(),
            entry,
            control_rx,
            cancel,
            ready: Some(ready_tx),
            status: record.status,
            credential: record.auth_data_path.clone(),
            pending_reply: None,
        };
        self.tracker.spawn(task.run(mode));
        ready_rx
    }

    pub fn launch(
        &self,
        record: SessionRecord,
        mode: LaunchMode,
    ) -> Result<oneshot::Receiver<LaunchOutcome>, SubbotError> {
        let reservation = self.reserve(&record)?;
        Ok(self.spawn(reservation, record, mode))
    }

    /// Ask a live supervisor to close and finish in `inactive`.
    ///
    /// `None` when no supervisor is running for `code` (or it exited before
    /// answering); the caller then owns the store transition.
    pub async fn deactivate(
        &self,
        code: &str,
        actor: &str,
    ) -> Option<Result<SessionRecord, SubbotError>> {
        let sender = self.registry.control_sender(code)?;
        let (reply, rx) = oneshot::channel();
        let request = Control::Deactivate {
            actor: actor.to_string(),
            reply,
        };
        if sender.send(request).await.is_err() {
            return None;
        }
        rx.await.ok()
    }

    /// Tell a live supervisor its heartbeat went stale.
    pub fn signal_stale(&self, code: &str) -> bool {
        match self.registry.control_sender(code) {
            Some(sender) => sender.try_send(Control::Stale).is_ok(),
            None => false,
        }
    }

    /// Cancel every supervisor and wait for them to close their connections.
    /// Returns `false` if `grace` ran out first.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.registry.cancel_all();
        self.tracker.close();
        tokio::time::timeout(grace, self.tracker.wait()).await.is_ok()
    }
}

// ============================================================================
// SESSION TASK
// ============================================================================

enum Step {
    Authenticate {
        method: AuthMethod,
        phone_number: Option<String>,
    },
    Connect,
    Backoff,
    Exit,
}

/// Why the event loop over one connection stopped.
enum DriveExit {
    Closed(CloseReason),
    Stale,
    AuthTimeout,
    Deactivated {
        actor: String,
        reply: oneshot::Sender<Result<SessionRecord, SubbotError>>,
    },
    Shutdown,
    Fault(SubbotError),
}

type DeactivateReply = (
    oneshot::Sender<Result<SessionRecord, SubbotError>>,
    Result<SessionRecord, SubbotError>,
);

struct SessionTask {
    code: String,
    store: Arc<dyn Store>,
    protocol: Arc<dyn ProtocolClient>,
    registry: SessionRegistry,
    issuer: Arc<AuthIssuer>,
    settings: SupervisorSettings,
    entry: Arc<SessionEntry>,
    control_rx: mpsc::Receiver<Control>,
    cancel: CancellationToken,
    ready: Option<oneshot::Sender<LaunchOutcome>>,
    status: SessionStatus,
    credential: Option<String>,
    backoff: Box<dyn Iterator<Item = Duration> + Send + Sync>,
    pending_reply: Option<DeactivateReply>,
}

impl SessionTask {
    async fn run(mut self, mode: LaunchMode) {
        info!(code = %self.code, mode = mode.as_str(), "Supervisor started");
        self.log_event(
            EventKind::Launch,
            serde_json::json!({
                "mode": mode.as_str(),
                "protocol": self.protocol.name(),
            }),
        )
        .await;

        let mut step = match mode {
            LaunchMode::Fresh {
                method,
                phone_number,
            } => Step::Authenticate {
                method,
                phone_number,
            },
            LaunchMode::Resume => Step::Connect,
        };

        loop {
            step = match step {
                Step::Authenticate {
                    method,
                    phone_number,
                } => self.authenticate(method, phone_number).await,
                Step::Connect => self.reconnect().await,
                Step::Backoff => self.backoff().await,
                Step::Exit => break,
            };
        }

        // Free the code before anyone hears back so an immediate relaunch succeeds.
        self.registry.release(&self.entry);
        if let Some((reply, result)) = self.pending_reply.take() {
            let _ = reply.send(result);
        }
        self.resolve_ready(Err(SubbotError::Protocol(ProtocolError::Gateway(
            "supervisor stopped before the session authenticated".to_string(),
        ))));
        info!(code = %self.code, status = %self.status, "Supervisor stopped");
    }

    async fn authenticate(&mut self, method: AuthMethod, phone_number: Option<String>) -> Step {
        let handle = match self.open(None).await {
            Some(Ok(handle)) => handle,
            Some(Err(e)) => {
                let reason = e.to_string();
                return self.fail(&reason, e.into()).await;
            }
            None => return Step::Exit,
        };

        if method == AuthMethod::Pairing {
            let phone = match phone_number {
                Some(phone) => phone,
                None => {
                    handle.connection.close().await;
                    return self
                        .fail(
                            "missing_phone_number",
                            SubbotError::Validation(
                                "pairing requires a phone number".to_string(),
                            ),
                        )
                        .await;
                }
            };
            let challenge = match self
                .issuer
                .issue_pairing_code(handle.connection.as_ref(), &phone)
                .await
            {
                Ok(challenge) => challenge,
                Err(e) => {
                    handle.connection.close().await;
                    return self.fail("pairing_code_unavailable", e).await;
                }
            };
            self.save_challenge(ChallengeUpdate {
                qr_payload: None,
                pairing_code: Some(challenge.code.clone()),
            })
            .await;
            if let Err(e) = self
                .transition(StatusUpdate::to(SessionStatus::WaitingPairing))
                .await
            {
                handle.connection.close().await;
                return self.abort(e);
            }
            self.resolve_ready(Ok(AuthChallenge::Pairing(challenge)));
        }

        self.drive_and_settle(handle).await
    }

    async fn reconnect(&mut self) -> Step {
        if self.status != SessionStatus::Reconnecting {
            if let Err(e) = self
                .transition(StatusUpdate::to(SessionStatus::Reconnecting).reason("reconnect"))
                .await
            {
                return self.abort(e);
            }
        }

        let credential = match self.credential.clone() {
            Some(credential) => credential,
            None => {
                return self
                    .fail(
                        "missing_credentials",
                        SubbotError::Validation(format!(
                            "session {} has no stored credentials to resume",
                            self.code
                        )),
                    )
                    .await;
            }
        };

        match self.open(Some(credential)).await {
            Some(Ok(handle)) => self.drive_and_settle(handle).await,
            Some(Err(e)) if e.is_permanent() => {
                let reason = e.to_string();
                self.fail(&reason, e.into()).await
            }
            Some(Err(e)) => {
                warn!(code = %self.code, "Reconnect attempt failed: {}", e);
                self.resolve_ready(Err(e.into()));
                self.lose("connect_failed").await
            }
            None => Step::Exit,
        }
    }

    async fn backoff(&mut self) -> Step {
        let delay = match self.backoff.next() {
            Some(delay) => delay,
            None => {
                warn!(code = %self.code, "Reconnect attempts exhausted, leaving session disconnected");
                self.log_event(
                    EventKind::ReconnectExhausted,
                    serde_json::json!({ "attempts": self.settings.reconnect.max_attempts }),
                )
                .await;
                return Step::Exit;
            }
        };

        debug!(code = %self.code, delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Step::Exit,
                _ = &mut sleep => return Step::Connect,
                ctrl = self.control_rx.recv() => match ctrl {
                    Some(Control::Deactivate { actor, reply }) => {
                        self.finish_inactive(&actor, reply).await;
                        return Step::Exit;
                    }
                    Some(Control::Stale) => continue,
                    None => return Step::Exit,
                },
            }
        }
    }

    /// `None` when shutdown interrupted the connect.
    async fn open(
        &mut self,
        credential: Option<String>,
    ) -> Option<Result<ConnectionHandle, ProtocolError>> {
        let request = ConnectRequest {
            session_code: self.code.clone(),
            credential,
        };
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = self.protocol.connect(request) => Some(result),
        }
    }

    async fn drive_and_settle(&mut self, handle: ConnectionHandle) -> Step {
        let connection = Arc::clone(&handle.connection);
        let exit = self.drive(handle).await;
        connection.close().await;

        match exit {
            DriveExit::Shutdown => Step::Exit,
            DriveExit::Deactivated { actor, reply } => {
                self.finish_inactive(&actor, reply).await;
                Step::Exit
            }
            DriveExit::Fault(e) => self.abort(e),
            DriveExit::AuthTimeout if self.credential.is_some() => self.lose("auth_timeout").await,
            DriveExit::AuthTimeout => {
                let secs = self.settings.auth_timeout.as_secs();
                self.fail("auth_timeout", ProtocolError::Timeout(secs).into())
                    .await
            }
            DriveExit::Closed(reason) if reason.is_permanent() => {
                let detail = reason.to_string();
                self.fail(&detail, ProtocolError::Closed(reason).into()).await
            }
            DriveExit::Closed(reason) => self.lose(&reason.to_string()).await,
            DriveExit::Stale => self.lose("heartbeat_stale").await,
        }
    }

    async fn drive(&mut self, handle: ConnectionHandle) -> DriveExit {
        let ConnectionHandle {
            connection,
            mut events,
        } = handle;
        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let auth_deadline = tokio::time::sleep(self.settings.auth_timeout);
        tokio::pin!(auth_deadline);

        loop {
            let connected = self.status == SessionStatus::Connected;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return DriveExit::Shutdown,
                ctrl = self.control_rx.recv() => match ctrl {
                    Some(Control::Deactivate { actor, reply }) => {
                        return DriveExit::Deactivated { actor, reply };
                    }
                    Some(Control::Stale) if connected => return DriveExit::Stale,
                    Some(Control::Stale) => {
                        debug!(code = %self.code, status = %self.status, "Stale signal ignored");
                    }
                    None => return DriveExit::Shutdown,
                },
                event = events.recv() => match event {
                    Some(event) => {
                        if let Some(exit) = self.dispatch(event).await {
                            return exit;
                        }
                    }
                    None => return DriveExit::Closed(CloseReason::ConnectionLost),
                },
                _ = heartbeat.tick(), if connected => {
                    self.heartbeat(connection.as_ref()).await;
                }
                _ = &mut auth_deadline, if !connected => return DriveExit::AuthTimeout,
            }
        }
    }

    async fn dispatch(&mut self, event: LifecycleEvent) -> Option<DriveExit> {
        match event {
            LifecycleEvent::QrUpdated { payload } => {
                if !matches!(
                    self.status,
                    SessionStatus::Pending | SessionStatus::WaitingScan
                ) {
                    warn!(code = %self.code, status = %self.status, "QR challenge outside authentication ignored");
                    return None;
                }
                let challenge = match self.issuer.issue_qr(&self.registry, &self.code, &payload) {
                    Ok(challenge) => challenge,
                    Err(e) => return Some(DriveExit::Fault(e)),
                };
                self.save_challenge(ChallengeUpdate {
                    qr_payload: Some(payload),
                    pairing_code: None,
                })
                .await;
                if self.status == SessionStatus::Pending {
                    if let Err(e) = self
                        .transition(StatusUpdate::to(SessionStatus::WaitingScan))
                        .await
                    {
                        return Some(DriveExit::Fault(e));
                    }
                }
                self.resolve_ready(Ok(AuthChallenge::Qr(challenge)));
                None
            }
            LifecycleEvent::PairingCodeReady { code } => {
                debug!(code = %self.code, "Engine pushed a pairing code");
                self.save_challenge(ChallengeUpdate {
                    qr_payload: None,
                    pairing_code: Some(code),
                })
                .await;
                None
            }
            LifecycleEvent::Authenticated { credential } => {
                self.credential = Some(credential.clone());
                if self.status == SessionStatus::Connected {
                    self.save_credentials(&credential).await;
                    return None;
                }
                let update = StatusUpdate::to(SessionStatus::Connected)
                    .reason("authenticated")
                    .credential(credential)
                    .clear_challenge();
                if let Err(e) = self.transition(update).await {
                    return Some(DriveExit::Fault(e));
                }
                self.backoff = self.settings.reconnect.delays();
                info!(code = %self.code, "Session connected");
                self.resolve_ready(Ok(AuthChallenge::Resumed));
                None
            }
            LifecycleEvent::CredentialsUpdated { credential } => {
                let first = self.credential.is_none();
                self.credential = Some(credential.clone());
                self.save_credentials(&credential).await;
                if first {
                    self.log_event(EventKind::CredentialsUpdated, serde_json::json!({}))
                        .await;
                }
                None
            }
            LifecycleEvent::Closed { reason } => Some(DriveExit::Closed(reason)),
        }
    }

    async fn heartbeat(&self, connection: &dyn Connection) {
        let ping = tokio::time::timeout(self.settings.heartbeat_interval, connection.ping()).await;
        match ping {
            Ok(Ok(())) => match self.store.record_heartbeat(&self.code, Utc::now()).await {
                Ok(true) => debug!(code = %self.code, "Heartbeat recorded"),
                Ok(false) => debug!(code = %self.code, "Heartbeat skipped, session not connected"),
                Err(e) => warn!(code = %self.code, "Heartbeat write failed: {}", e),
            },
            Ok(Err(e)) => debug!(code = %self.code, "Ping failed, no heartbeat: {}", e),
            Err(_) => debug!(code = %self.code, "Ping timed out, no heartbeat"),
        }
    }

    /// Transient loss: park in `disconnected` and back off. Without a
    /// credential there is nothing to resume with, so that is an error.
    async fn lose(&mut self, reason: &str) -> Step {
        if self.credential.is_none() {
            return self
                .fail(
                    &format!("closed before authentication: {}", reason),
                    ProtocolError::Closed(CloseReason::Other(reason.to_string())).into(),
                )
                .await;
        }
        info!(code = %self.code, reason, "Connection lost");
        if self.status != SessionStatus::Disconnected {
            if let Err(e) = self
                .transition(StatusUpdate::to(SessionStatus::Disconnected).reason(reason))
                .await
            {
                return self.abort(e);
            }
        }
        self.resolve_ready(Err(SubbotError::Protocol(ProtocolError::Closed(
            CloseReason::Other(reason.to_string()),
        ))));
        Step::Backoff
    }

    /// Permanent failure: record `error` with the reason and stop.
    async fn fail(&mut self, reason: &str, err: SubbotError) -> Step {
        error!(code = %self.code, reason, "Session failed: {}", err);
        if self.status != SessionStatus::Error {
            if let Err(e) = self
                .transition(StatusUpdate::to(SessionStatus::Error).reason(reason))
                .await
            {
                warn!(code = %self.code, "Could not record error state: {}", e);
            }
        }
        self.resolve_ready(Err(err));
        Step::Exit
    }

    /// The store refused a write we depend on; stop without further writes.
    fn abort(&mut self, err: SubbotError) -> Step {
        error!(code = %self.code, "Supervisor aborted: {}", err);
        self.resolve_ready(Err(err));
        Step::Exit
    }

    async fn finish_inactive(
        &mut self,
        actor: &str,
        reply: oneshot::Sender<Result<SessionRecord, SubbotError>>,
    ) {
        let update = StatusUpdate::to(SessionStatus::Inactive)
            .reason(format!("deactivated by {}", actor));
        let result = self.transition(update).await;
        if result.is_ok() {
            info!(code = %self.code, actor, "Session deactivated");
        }
        self.pending_reply = Some((reply, result));
    }

    /// Validated write through the store, retried once on a concurrent update.
    async fn transition(&mut self, update: StatusUpdate) -> Result<SessionRecord, SubbotError> {
        let record = match self.store.update_status(&self.code, update.clone()).await {
            Err(SubbotError::Conflict(detail)) => {
                debug!(code = %self.code, "Transition conflict, retrying: {}", detail);
                self.store.update_status(&self.code, update).await?
            }
            other => other?,
        };
        self.status = record.status;
        Ok(record)
    }

    fn resolve_ready(&mut self, outcome: LaunchOutcome) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(outcome);
        }
    }

    async fn save_challenge(&self, challenge: ChallengeUpdate) {
        if let Err(e) = self.store.update_challenge(&self.code, challenge).await {
            warn!(code = %self.code, "Failed to store challenge: {}", e);
        }
    }

    async fn save_credentials(&self, credential: &str) {
        if let Err(e) = self.store.update_credentials(&self.code, credential).await {
            warn!(code = %self.code, "Failed to store credentials: {}", e);
        }
    }

    async fn log_event(&self, kind: EventKind, payload: serde_json::Value) {
        if let Err(e) = self
            .store
            .append_event(NewEvent::new(self.code.clone(), kind, payload))
            .await
        {
            warn!(code = %self.code, "Event log append failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subbot_core::config::AuthConfig;
    use subbot_core::models::{EventFilter, NewSession};
    use subbot_core::testing::MockProtocol;
    use subbot_core::config::HeartbeatConfig;
    use subbot_core::{MemoryStore, SessionStore};

    use crate::subsystems::admission::AdmissionLimiter;
    use crate::subsystems::heartbeat::run_liveness_sweep;

    struct Harness {
        store: Arc<MemoryStore>,
        protocol: MockProtocol,
        supervisor: ConnectionSupervisor,
    }

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            heartbeat_interval: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(180),
            reconnect: ReconnectPolicy {
                initial_delay_ms: 10,
                max_delay_ms: 40,
                max_attempts: 3,
                jitter: false,
            },
        }
    }

    fn harness_with(settings: SupervisorSettings) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let protocol = MockProtocol::new();
        let registry = SessionRegistry::new(AdmissionLimiter::new(10, 0), CancellationToken::new());
        let supervisor = ConnectionSupervisor::new(
            store.clone(),
            Arc::new(protocol.clone()),
            registry,
            Arc::new(AuthIssuer::new(&AuthConfig::default())),
            settings,
        );
        Harness {
            store,
            protocol,
            supervisor,
        }
    }

    fn harness() -> Harness {
        harness_with(settings())
    }

    async fn new_record(store: &MemoryStore, method: AuthMethod) -> SessionRecord {
        store
            .create(NewSession {
                owner_identifier: "549111".into(),
                owner_display_name: None,
                method,
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap()
    }

    async fn wait_for_status(store: &MemoryStore, code: &str, status: SessionStatus) {
        for _ in 0..200 {
            if store.get(code).await.unwrap().map(|r| r.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "session {} never reached {}, last {:?}",
            code,
            status,
            store.get(code).await.unwrap().map(|r| r.status)
        );
    }

    async fn connected_session(h: &Harness) -> SessionRecord {
        let record = new_record(&h.store, AuthMethod::Qr).await;
        let ready = h
            .supervisor
            .launch(
                record.clone(),
                LaunchMode::Fresh {
                    method: AuthMethod::Qr,
                    phone_number: None,
                },
            )
            .unwrap();
        assert!(matches!(ready.await.unwrap(), Ok(AuthChallenge::Qr(_))));
        h.protocol
            .emit(
                &record.code,
                LifecycleEvent::Authenticated {
                    credential: "creds/SB".into(),
                },
            )
            .await;
        wait_for_status(&h.store, &record.code, SessionStatus::Connected).await;
        record
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            initial_delay_ms: 2000,
            max_delay_ms: 10_000,
            max_attempts: 5,
            jitter: false,
        };
        let delays: Vec<u64> = policy.delays().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![2000, 4000, 8000, 10_000, 10_000]);
    }

    #[test]
    fn test_jittered_backoff_never_exceeds_plain() {
        let policy = ReconnectPolicy {
            initial_delay_ms: 1000,
            max_delay_ms: 8000,
            max_attempts: 4,
            jitter: true,
        };
        let delays: Vec<Duration> = policy.delays().collect();
        assert_eq!(delays.len(), 4);
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(8000)));
    }

    #[tokio::test]
    async fn test_qr_launch_reaches_waiting_scan_then_connected() {
        let h = harness();
        let record = connected_session(&h).await;

        let stored = h.store.get(&record.code).await.unwrap().unwrap();
        assert!(stored.is_active);
        assert_eq!(stored.auth_data_path.as_deref(), Some("creds/SB"));
        assert!(stored.qr_payload.is_none());
        assert_eq!(h.protocol.open_connections(&record.code), 1);
    }

    #[tokio::test]
    async fn test_pairing_launch_issues_code() {
        let h = harness();
        let record = new_record(&h.store, AuthMethod::Pairing).await;
        let ready = h
            .supervisor
            .launch(
                record.clone(),
                LaunchMode::Fresh {
                    method: AuthMethod::Pairing,
                    phone_number: Some("549111".into()),
                },
            )
            .unwrap();
        match ready.await.unwrap().unwrap() {
            AuthChallenge::Pairing(challenge) => assert_eq!(challenge.code.len(), 8),
            other => panic!("unexpected challenge {:?}", other),
        }
        let stored = h.store.get(&record.code).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::WaitingPairing);
        assert!(stored.pairing_code.is_some());
    }

    #[tokio::test]
    async fn test_second_launch_is_already_active() {
        let h = harness();
        let record = connected_session(&h).await;
        let err = h
            .supervisor
            .launch(record.clone(), LaunchMode::Resume)
            .unwrap_err();
        assert_eq!(err.kind(), "already_active");
        assert_eq!(h.protocol.connect_count(&record.code), 1);
    }

    #[tokio::test]
    async fn test_transient_close_reconnects_with_stored_credentials() {
        let h = harness();
        let record = connected_session(&h).await;
        h.protocol
            .emit(
                &record.code,
                LifecycleEvent::Closed {
                    reason: CloseReason::ConnectionLost,
                },
            )
            .await;

        for _ in 0..200 {
            if h.protocol.connect_count(&record.code) == 2
                && h.store.get(&record.code).await.unwrap().unwrap().status
                    == SessionStatus::Connected
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.protocol.connect_count(&record.code), 2);
        assert_eq!(h.protocol.open_connections(&record.code), 1);

        let transitions = h
            .store
            .query_events(&EventFilter {
                code: Some(record.code.clone()),
                event_kind: Some(EventKind::Transition),
                ..EventFilter::default()
            })
            .await
            .unwrap();
        let targets: Vec<String> = transitions
            .iter()
            .rev()
            .map(|e| e.payload["to"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(
            targets,
            vec!["waiting_scan", "connected", "disconnected", "reconnecting", "connected"]
        );
    }

    #[tokio::test]
    async fn test_logged_out_moves_to_error_without_retry() {
        let h = harness();
        let record = connected_session(&h).await;
        h.protocol
            .emit(
                &record.code,
                LifecycleEvent::Closed {
                    reason: CloseReason::LoggedOut,
                },
            )
            .await;
        wait_for_status(&h.store, &record.code, SessionStatus::Error).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(h.protocol.connect_count(&record.code), 1);
        assert!(!h.supervisor.registry().contains(&record.code));
        assert_eq!(h.supervisor.registry().limiter().in_use(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_budget_leaves_disconnected() {
        let h = harness();
        let record = connected_session(&h).await;
        h.protocol.fail_next_connects(
            &record.code,
            vec![
                ProtocolError::Connect("refused".into()),
                ProtocolError::Connect("refused".into()),
                ProtocolError::Connect("refused".into()),
            ],
        );
        h.protocol
            .emit(
                &record.code,
                LifecycleEvent::Closed {
                    reason: CloseReason::TimedOut,
                },
            )
            .await;

        for _ in 0..200 {
            if !h.supervisor.registry().contains(&record.code) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!h.supervisor.registry().contains(&record.code));
        let stored = h.store.get(&record.code).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Disconnected);
        assert_eq!(h.protocol.connect_count(&record.code), 4);

        let exhausted = h
            .store
            .query_events(&EventFilter {
                code: Some(record.code.clone()),
                event_kind: Some(EventKind::ReconnectExhausted),
                ..EventFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(exhausted.len(), 1);
    }

    #[tokio::test]
    async fn test_deactivate_closes_connection() {
        let h = harness();
        let record = connected_session(&h).await;
        let result = h
            .supervisor
            .deactivate(&record.code, "admin")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.status, SessionStatus::Inactive);
        assert!(!result.is_active);
        assert_eq!(h.protocol.open_connections(&record.code), 0);
        assert!(!h.supervisor.registry().contains(&record.code));
        assert!(h.supervisor.deactivate(&record.code, "admin").await.is_none());
    }

    #[tokio::test]
    async fn test_stale_signal_forces_reconnect() {
        let h = harness();
        let record = connected_session(&h).await;
        assert!(h.supervisor.signal_stale(&record.code));
        for _ in 0..200 {
            if h.protocol.connect_count(&record.code) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.protocol.connect_count(&record.code), 2);
        wait_for_status(&h.store, &record.code, SessionStatus::Connected).await;
    }

    #[tokio::test]
    async fn test_deactivate_during_backoff_cancels_retry() {
        let mut s = settings();
        s.reconnect.initial_delay_ms = 10_000;
        s.reconnect.max_delay_ms = 10_000;
        let h = harness_with(s);
        let record = connected_session(&h).await;
        assert_eq!(h.supervisor.registry().limiter().in_use(), 1);

        h.protocol
            .emit(
                &record.code,
                LifecycleEvent::Closed {
                    reason: CloseReason::ConnectionLost,
                },
            )
            .await;
        wait_for_status(&h.store, &record.code, SessionStatus::Disconnected).await;

        let result = h
            .supervisor
            .deactivate(&record.code, "admin")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.status, SessionStatus::Inactive);
        assert!(!h.supervisor.registry().contains(&record.code));
        assert_eq!(h.supervisor.registry().limiter().in_use(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.protocol.connect_count(&record.code), 1);
        assert_eq!(h.protocol.open_connections(&record.code), 0);
        let stored = h.store.get(&record.code).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Inactive);
    }

    #[tokio::test]
    async fn test_failing_pings_go_stale_and_sweep_reconnects() {
        let mut s = settings();
        s.heartbeat_interval = Duration::from_millis(20);
        let h = harness_with(s);
        let record = connected_session(&h).await;

        h.protocol.set_ping_ok(&record.code, false);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let before = h.store.get(&record.code).await.unwrap().unwrap().last_heartbeat_at;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let after = h.store.get(&record.code).await.unwrap().unwrap();
        assert_eq!(after.last_heartbeat_at, before);
        assert_eq!(after.status, SessionStatus::Connected);

        let store: Arc<dyn Store> = h.store.clone();
        let config = HeartbeatConfig {
            interval_secs: 30,
            staleness_multiplier: 3,
            sweep_interval_secs: 30,
        };
        let later = Utc::now() + chrono::Duration::seconds(91);
        let report = run_liveness_sweep(&store, &h.supervisor, &config, later)
            .await
            .unwrap();
        assert_eq!(report.stale, 1);
        assert_eq!(report.signalled, 1);

        for _ in 0..200 {
            if h.protocol.connect_count(&record.code) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.protocol.connect_count(&record.code), 2);
        wait_for_status(&h.store, &record.code, SessionStatus::Connected).await;

        let transitions = h
            .store
            .query_events(&EventFilter {
                code: Some(record.code.clone()),
                event_kind: Some(EventKind::Transition),
                ..EventFilter::default()
            })
            .await
            .unwrap();
        assert!(transitions
            .iter()
            .any(|e| e.payload["to"] == "disconnected" && e.payload["reason"] == "heartbeat_stale"));
    }

    #[tokio::test]
    async fn test_fresh_connect_without_challenge_times_out() {
        let mut s = settings();
        s.auth_timeout = Duration::from_millis(30);
        let h = harness_with(s);
        h.protocol.set_qr_on_connect(None);
        let record = new_record(&h.store, AuthMethod::Qr).await;
        let ready = h
            .supervisor
            .launch(
                record.clone(),
                LaunchMode::Fresh {
                    method: AuthMethod::Qr,
                    phone_number: None,
                },
            )
            .unwrap();
        let outcome = ready.await.unwrap();
        assert!(matches!(
            outcome,
            Err(SubbotError::Protocol(ProtocolError::Timeout(_)))
        ));
        wait_for_status(&h.store, &record.code, SessionStatus::Error).await;
        assert_eq!(h.protocol.open_connections(&record.code), 0);
    }

    #[tokio::test]
    async fn test_auth_timeout_moves_to_error() {
        let mut s = settings();
        s.auth_timeout = Duration::from_millis(30);
        let h = harness_with(s);
        let record = new_record(&h.store, AuthMethod::Qr).await;
        let ready = h
            .supervisor
            .launch(
                record.clone(),
                LaunchMode::Fresh {
                    method: AuthMethod::Qr,
                    phone_number: None,
                },
            )
            .unwrap();
        assert!(ready.await.unwrap().is_ok());
        wait_for_status(&h.store, &record.code, SessionStatus::Error).await;
        assert_eq!(h.protocol.open_connections(&record.code), 0);
    }

    #[tokio::test]
    async fn test_resume_without_credentials_is_error() {
        let h = harness();
        let record = new_record(&h.store, AuthMethod::Qr).await;
        h.store
            .update_status(&record.code, StatusUpdate::to(SessionStatus::WaitingScan))
            .await
            .unwrap();
        let record = h.store.get(&record.code).await.unwrap().unwrap();
        let ready = h.supervisor.launch(record.clone(), LaunchMode::Resume).unwrap();
        assert!(ready.await.unwrap().is_err());
        let stored = h.store.get(&record.code).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Error);
        assert_eq!(h.protocol.connect_count(&record.code), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_recorded_while_connected() {
        let h = harness();
        let record = connected_session(&h).await;
        for _ in 0..200 {
            let stored = h.store.get(&record.code).await.unwrap().unwrap();
            if stored.last_heartbeat_at > stored.connected_at {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no heartbeat after connect");
    }

    #[tokio::test]
    async fn test_shutdown_closes_without_status_change() {
        let h = harness();
        let record = connected_session(&h).await;
        assert!(h.supervisor.shutdown(Duration::from_secs(1)).await);
        assert_eq!(h.protocol.open_connections(&record.code), 0);
        let stored = h.store.get(&record.code).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Connected);
    }
}
