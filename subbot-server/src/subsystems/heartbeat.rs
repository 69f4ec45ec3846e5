//! Heartbeat / liveness monitor
//!
//! Supervisors record a heartbeat each time a ping round-trips. This sweep
//! looks for `connected` sessions whose last heartbeat is older than
//! `interval * staleness_multiplier` and forces them back through the
//! reconnect path:
//!
//!   - live supervisor    -> `Control::Stale`, the supervisor reconnects itself
//!   - no live supervisor -> record moved to `disconnected`, resume launched
//!
//! The sweep never reads a session as healthy just because its status says so.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use subbot_core::config::HeartbeatConfig;
use subbot_core::models::{SessionRecord, SessionStatus, StatusUpdate};
use subbot_core::{Store, SubbotError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::supervisor::{ConnectionSupervisor, LaunchMode};

// ============================================================================
// PUBLIC API
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub checked: usize,
    pub stale: usize,
    pub signalled: usize,
    pub orphaned: usize,
    pub relaunched: usize,
    pub elapsed_ms: u64,
}

pub async fn run_liveness_sweep(
    store: &Arc<dyn Store>,
    supervisor: &ConnectionSupervisor,
    config: &HeartbeatConfig,
    now: DateTime<Utc>,
) -> Result<SweepReport, SubbotError> {
    let start = std::time::Instant::now();
    let threshold = config.staleness_threshold();
    let mut report = SweepReport::default();

    let connected = store.list_by_status(&[SessionStatus::Connected]).await?;
    report.checked = connected.len();

    for record in connected {
        if now - record.last_seen() <= threshold {
            continue;
        }
        report.stale += 1;

        if supervisor.registry().contains(&record.code) {
            if supervisor.signal_stale(&record.code) {
                report.signalled += 1;
            } else {
                warn!(code = %record.code, "Stale session supervisor did not accept signal");
            }
            continue;
        }

        // Status says connected but nothing in this process holds the connection.
        report.orphaned += 1;
        if relaunch_orphan(store, supervisor, &record).await {
            report.relaunched += 1;
        }
    }

    report.elapsed_ms = start.elapsed().as_millis() as u64;
    if report.stale > 0 {
        info!(
            "Liveness sweep: {} checked, {} stale ({} signalled, {} orphaned, {} relaunched) in {}ms",
            report.checked,
            report.stale,
            report.signalled,
            report.orphaned,
            report.relaunched,
            report.elapsed_ms
        );
    }
    Ok(report)
}

/// Move a stale `connected` record with no supervisor to `disconnected` and
/// resume it. The code is reserved before the write, so a supervisor started
/// since `record` was read (startup recovery, an operator relaunch) keeps
/// sole ownership and the orphan is skipped.
pub async fn relaunch_orphan(
    store: &Arc<dyn Store>,
    supervisor: &ConnectionSupervisor,
    record: &SessionRecord,
) -> bool {
    let reservation = match supervisor.reserve(record) {
        Ok(reservation) => reservation,
        Err(SubbotError::AlreadyActive(_)) => {
            debug!(code = %record.code, "Orphan picked up by another supervisor, skipping");
            return false;
        }
        Err(e) => {
            warn!(code = %record.code, "Relaunch of orphaned session refused: {}", e);
            return false;
        }
    };

    let update = StatusUpdate::to(SessionStatus::Disconnected).reason("heartbeat_stale");
    let record = match store.update_status(&record.code, update).await {
        Ok(record) => record,
        Err(e) => {
            warn!(code = %record.code, "Could not mark orphaned session disconnected: {}", e);
            return false;
        }
    };
    supervisor.spawn(reservation, record, LaunchMode::Resume);
    true
}

/// Run sweeps on `sweep_interval` until shutdown is broadcast.
pub async fn run_liveness_loop(
    store: Arc<dyn Store>,
    supervisor: ConnectionSupervisor,
    config: HeartbeatConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(config.sweep_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(
        "Liveness loop started (sweep every {}s, stale after {}s)",
        config.sweep_interval().as_secs(),
        config.staleness_threshold().num_seconds()
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = run_liveness_sweep(&store, &supervisor, &config, Utc::now()).await {
                    warn!("Liveness sweep failed: {}", e);
                }
            }
            _ = shutdown.recv() => {
                info!("Liveness loop shutting down");
                break;
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
