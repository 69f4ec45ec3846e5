//! Orchestrator facade
//!
//! The single entry point the command layer talks to. It owns the store, the
//! supervisor (with its registry and admission limiter) and the config, and
//! turns each operator command into store writes plus supervisor launches.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use subbot_core::config::SubbotConfig;
use subbot_core::models::{
    AuthMethod, EventFilter, EventKind, EventLogEntry, GlobalActivationState, NewEvent,
    NewSession, SessionRecord, SessionStatus, StatusUpdate,
};
use subbot_core::{ProtocolClient, ProtocolError, Store, SubbotError};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::admission::AdmissionLimiter;
use super::auth::{AuthChallenge, AuthIssuer};
use super::heartbeat::{self, SweepReport};
use super::recovery::{self, RecoveryReport};
use super::registry::SessionRegistry;
use super::supervisor::{
    ConnectionSupervisor, LaunchMode, LaunchOutcome, SupervisorSettings,
};

const MIN_PHONE_DIGITS: usize = 6;
const MAX_PHONE_DIGITS: usize = 15;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    pub owner: String,
    pub display_name: Option<String>,
    pub method: AuthMethod,
    pub phone_number: Option<String>,
}

/// A freshly launched session and the challenge the user must answer.
#[derive(Debug, Clone, Serialize)]
pub struct SessionLaunch {
    pub session: SessionRecord,
    pub challenge: AuthChallenge,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    /// Every supervisor exited within the grace period.
    pub drained: bool,
    pub marked_disconnected: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupActivation {
    pub group: String,
    pub is_active: bool,
    /// `false` when no override exists and the default applies.
    pub overridden: bool,
}

pub struct Orchestrator {
    store: Arc<dyn Store>,
    supervisor: ConnectionSupervisor,
    config: SubbotConfig,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn Store>, protocol: Arc<dyn ProtocolClient>, config: SubbotConfig) -> Self {
        let limiter = AdmissionLimiter::new(
            config.supervisor.max_sessions,
            config.supervisor.max_sessions_per_owner,
        );
        let registry = SessionRegistry::new(limiter, CancellationToken::new());
        let supervisor = ConnectionSupervisor::new(
            Arc::clone(&store),
            protocol,
            registry,
            Arc::new(AuthIssuer::new(&config.auth)),
            SupervisorSettings::from_config(&config),
        );
        Self {
            store,
            supervisor,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    pub fn config(&self) -> &SubbotConfig {
        &self.config
    }

    pub fn live_sessions(&self) -> usize {
        self.supervisor.registry().len()
    }

    // ========================================================================
    // SESSION LIFECYCLE
    // ========================================================================

    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<SessionLaunch, SubbotError> {
        let owner = request.owner.trim().to_string();
        if owner.is_empty() {
            return Err(SubbotError::Validation("owner must not be empty".to_string()));
        }
        let phone_number = match request.method {
            AuthMethod::Pairing => Some(resolve_phone(request.phone_number.as_deref(), &owner)?),
            AuthMethod::Qr => None,
        };

        // Take the slot first so a full orchestrator never leaves a stray pending record.
        let permit = self.supervisor.registry().limiter().try_acquire(&owner)?;
        let record = self
            .store
            .create(NewSession {
                owner_identifier: owner.clone(),
                owner_display_name: request.display_name.clone(),
                method: request.method,
                metadata: serde_json::json!({ "creatorPushName": request.display_name }),
            })
            .await?;
        let reservation = self.supervisor.registry().adopt(&record.code, permit)?;

        info!(code = %record.code, owner = %owner, method = %request.method, "Session created");
        let ready = self.supervisor.spawn(
            reservation,
            record.clone(),
            LaunchMode::Fresh {
                method: request.method,
                phone_number,
            },
        );
        let challenge = self.await_challenge(&record.code, ready).await?;
        Ok(SessionLaunch {
            session: self.require(&record.code).await?,
            challenge,
        })
    }

    pub async fn get_session(&self, code: &str) -> Result<SessionRecord, SubbotError> {
        self.require(code).await
    }

    pub async fn list_sessions(&self, owner: &str) -> Result<Vec<SessionRecord>, SubbotError> {
        self.store.list_by_owner(owner).await
    }

    pub async fn list_all_sessions(&self) -> Result<Vec<SessionRecord>, SubbotError> {
        self.store.list_all().await
    }

    pub async fn deactivate_session(
        &self,
        code: &str,
        actor: &str,
    ) -> Result<SessionRecord, SubbotError> {
        self.require(code).await?;
        if let Some(result) = self.supervisor.deactivate(code, actor).await {
            return result;
        }
        let update =
            StatusUpdate::to(SessionStatus::Inactive).reason(format!("deactivated by {}", actor));
        let record = self.update_with_retry(code, update).await?;
        info!(code, actor, "Session deactivated");
        Ok(record)
    }

    /// Stop the session and remove its record for good.
    pub async fn revoke_session(&self, code: &str, actor: &str) -> Result<(), SubbotError> {
        let record = self.require(code).await?;
        if !record.status.is_terminal() {
            match self.deactivate_session(code, actor).await {
                Ok(_) | Err(SubbotError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        self.store.delete(code).await?;
        if let Err(e) = self
            .store
            .append_event(NewEvent::new(
                code,
                EventKind::Revoked,
                serde_json::json!({ "actor": actor }),
            ))
            .await
        {
            warn!(code, "Event log append failed: {}", e);
        }
        info!(code, actor, "Session revoked");
        Ok(())
    }

    /// Operator re-authentication of an `error` or `inactive` session.
    pub async fn reauthenticate_session(
        &self,
        code: &str,
        method: AuthMethod,
        phone_number: Option<String>,
        actor: &str,
    ) -> Result<SessionLaunch, SubbotError> {
        let record = self.require(code).await?;
        if !record.status.is_terminal() {
            return Err(SubbotError::Validation(format!(
                "session {} is {}, only error or inactive sessions can re-authenticate",
                code, record.status
            )));
        }
        let phone_number = match method {
            AuthMethod::Pairing => Some(resolve_phone(
                phone_number.as_deref(),
                &record.owner_identifier,
            )?),
            AuthMethod::Qr => None,
        };

        let reservation = self.supervisor.reserve(&record)?;
        let record = self.store.reactivate(code, method, actor).await?;
        info!(code, actor, method = %method, "Session re-authenticating");
        let ready = self.supervisor.spawn(
            reservation,
            record,
            LaunchMode::Fresh {
                method,
                phone_number,
            },
        );
        let challenge = self.await_challenge(code, ready).await?;
        Ok(SessionLaunch {
            session: self.require(code).await?,
            challenge,
        })
    }

    /// Resume a `disconnected` session from its stored credentials.
    pub async fn relaunch_session(&self, code: &str) -> Result<SessionRecord, SubbotError> {
        let record = self.require(code).await?;
        if self.supervisor.registry().contains(code) {
            return Err(SubbotError::AlreadyActive(code.to_string()));
        }
        if record.status != SessionStatus::Disconnected {
            return Err(SubbotError::Validation(format!(
                "session {} is {}, only disconnected sessions can be relaunched",
                code, record.status
            )));
        }
        if !record.has_credentials() {
            return Err(SubbotError::Validation(format!(
                "session {} has no stored credentials",
                code
            )));
        }

        let ready = self.supervisor.launch(record, LaunchMode::Resume)?;
        let timeout = Duration::from_secs(self.config.recovery.relaunch_timeout_secs.max(1));
        match tokio::time::timeout(timeout, ready).await {
            Ok(Ok(Ok(_))) => {}
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(_)) => return Err(supervisor_gone()),
            Err(_) => warn!(code, "Relaunch still connecting after {}s", timeout.as_secs()),
        }
        self.require(code).await
    }

    pub async fn record_message(&self, code: &str) -> Result<i64, SubbotError> {
        self.store.increment_message_count(code).await
    }

    pub async fn events(&self, filter: &EventFilter) -> Result<Vec<EventLogEntry>, SubbotError> {
        self.store.query_events(filter).await
    }

    // ========================================================================
    // ACTIVATION
    // ========================================================================

    pub async fn global_activation(&self) -> Result<GlobalActivationState, SubbotError> {
        self.store.global_state().await
    }

    pub async fn set_global_activation(
        &self,
        is_on: bool,
        actor: &str,
    ) -> Result<GlobalActivationState, SubbotError> {
        let state = self.store.set_global_state(is_on, actor).await?;
        info!(is_on, actor, "Global activation changed");
        Ok(state)
    }

    pub async fn group_activation(&self, group: &str) -> Result<GroupActivation, SubbotError> {
        let current = self.store.group_state(group).await?;
        Ok(GroupActivation {
            group: group.to_string(),
            is_active: current.as_ref().map_or(true, |g| g.is_active),
            overridden: current.is_some(),
        })
    }

    pub async fn set_group_activation(
        &self,
        group: &str,
        is_active: bool,
        actor: &str,
    ) -> Result<GroupActivation, SubbotError> {
        if group.trim().is_empty() {
            return Err(SubbotError::Validation("group must not be empty".to_string()));
        }
        let state = self.store.set_group_state(group, is_active, actor).await?;
        Ok(GroupActivation {
            group: state.group_identifier,
            is_active: state.is_active,
            overridden: true,
        })
    }

    // ========================================================================
    // BACKGROUND PASSES
    // ========================================================================

    pub async fn recover(&self) -> Result<RecoveryReport, SubbotError> {
        recovery::run_recovery(&self.store, &self.supervisor, &self.config.recovery).await
    }

    pub async fn sweep_liveness(&self) -> Result<SweepReport, SubbotError> {
        heartbeat::run_liveness_sweep(
            &self.store,
            &self.supervisor,
            &self.config.heartbeat,
            Utc::now(),
        )
        .await
    }

    /// Close every connection, then record sessions that were live as
    /// `disconnected`. Startup recovery leaves those alone; the operator
    /// brings them back with `relaunch`.
    pub async fn shutdown(&self) -> ShutdownReport {
        let drained = self.supervisor.shutdown(SHUTDOWN_GRACE).await;
        if !drained {
            warn!("Supervisors still running after {}s grace", SHUTDOWN_GRACE.as_secs());
        }

        let mut report = ShutdownReport {
            drained,
            ..ShutdownReport::default()
        };
        let live = match self
            .store
            .list_by_status(&[SessionStatus::Connected, SessionStatus::Reconnecting])
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!("Shutdown sweep could not list sessions: {}", e);
                return report;
            }
        };
        for record in live {
            let update = StatusUpdate::to(SessionStatus::Disconnected).reason("shutdown");
            match self.store.update_status(&record.code, update).await {
                Ok(_) => report.marked_disconnected += 1,
                Err(e) => {
                    warn!(code = %record.code, "Shutdown sweep failed: {}", e);
                    report.failed += 1;
                }
            }
        }
        info!(
            "Shutdown complete: {} sessions marked disconnected, {} failed",
            report.marked_disconnected, report.failed
        );
        report
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    async fn require(&self, code: &str) -> Result<SessionRecord, SubbotError> {
        self.store
            .get(code)
            .await?
            .ok_or_else(|| SubbotError::NotFound(format!("session {}", code)))
    }

    async fn update_with_retry(
        &self,
        code: &str,
        update: StatusUpdate,
    ) -> Result<SessionRecord, SubbotError> {
        match self.store.update_status(code, update.clone()).await {
            Err(SubbotError::Conflict(_)) => self.store.update_status(code, update).await,
            other => other,
        }
    }

    /// Wait for the first challenge. A launch that never produces one is
    /// stopped so no half-started session lingers.
    async fn await_challenge(
        &self,
        code: &str,
        ready: oneshot::Receiver<LaunchOutcome>,
    ) -> Result<AuthChallenge, SubbotError> {
        let timeout = self.config.auth.challenge_timeout();
        match tokio::time::timeout(timeout, ready).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(supervisor_gone()),
            Err(_) => {
                warn!(code, "No challenge within {}s, stopping launch", timeout.as_secs());
                if let Some(Err(e)) = self.supervisor.deactivate(code, SYSTEM_ACTOR).await {
                    warn!(code, "Could not stop timed-out launch: {}", e);
                }
                Err(SubbotError::Protocol(ProtocolError::Timeout(timeout.as_secs())))
            }
        }
    }
}

fn supervisor_gone() -> SubbotError {
    SubbotError::Protocol(ProtocolError::Gateway(
        "supervisor stopped without reporting".to_string(),
    ))
}

/// Digits of `explicit`, or of the owner identifier when absent
/// (`549111@s.whatsapp.net` -> `549111`).
pub fn resolve_phone(explicit: Option<&str>, owner: &str) -> Result<String, SubbotError> {
    let source = explicit.unwrap_or_else(|| owner.split('@').next().unwrap_or(owner));
    let digits: String = source.chars().filter(|c| c.is_ascii_digit()).collect();
    if !(MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits.len()) {
        return Err(SubbotError::Validation(format!(
            "phone number must have {}-{} digits, got {}",
            MIN_PHONE_DIGITS,
            MAX_PHONE_DIGITS,
            digits.len()
        )));
    }
    Ok(digits)
}
