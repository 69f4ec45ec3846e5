//! Startup recovery
//!
//! Relaunches every session the store says should be live: `is_active`
//! records plus anything in a recoverable status. Relaunches run with bounded
//! concurrency and go through the same admission path as any other launch, so
//! running recovery twice never doubles a connection.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use subbot_core::config::RecoveryConfig;
use subbot_core::models::{SessionRecord, SessionStatus, StatusUpdate};
use subbot_core::{Store, SubbotError};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::supervisor::{ConnectionSupervisor, LaunchMode};

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RecoveryReport {
    pub scanned: usize,
    /// Already had a live supervisor.
    pub skipped: usize,
    pub relaunched: usize,
    /// Still connecting when the per-session wait ran out.
    pub pending: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
}

enum Outcome {
    Skipped,
    Relaunched,
    Pending,
    Failed,
}

pub async fn run_recovery(
    store: &Arc<dyn Store>,
    supervisor: &ConnectionSupervisor,
    config: &RecoveryConfig,
) -> Result<RecoveryReport, SubbotError> {
    let start = std::time::Instant::now();
    let records = store.list_recoverable().await?;
    let report = Mutex::new(RecoveryReport {
        scanned: records.len(),
        ..RecoveryReport::default()
    });

    info!("Recovery started: {} candidate sessions", records.len());

    let timeout = Duration::from_secs(config.relaunch_timeout_secs.max(1));
    futures::stream::iter(records)
        .for_each_concurrent(config.max_concurrent_relaunches.max(1), |record| {
            let report = &report;
            async move {
                let outcome = relaunch_one(store, supervisor, record, timeout).await;
                let mut report = report.lock().await;
                match outcome {
                    Outcome::Skipped => report.skipped += 1,
                    Outcome::Relaunched => report.relaunched += 1,
                    Outcome::Pending => report.pending += 1,
                    Outcome::Failed => report.failed += 1,
                }
            }
        })
        .await;

    let mut report = report.into_inner();
    report.elapsed_ms = start.elapsed().as_millis() as u64;
    info!(
        "Recovery complete: {} scanned, {} relaunched, {} pending, {} skipped, {} failed in {}ms",
        report.scanned,
        report.relaunched,
        report.pending,
        report.skipped,
        report.failed,
        report.elapsed_ms
    );
    Ok(report)
}

async fn relaunch_one(
    store: &Arc<dyn Store>,
    supervisor: &ConnectionSupervisor,
    record: SessionRecord,
    timeout: Duration,
) -> Outcome {
    let code = record.code.clone();
    if supervisor.registry().contains(&code) {
        return Outcome::Skipped;
    }

    // Reserve before touching the record so a rejected relaunch leaves it as it was.
    let reservation = match supervisor.reserve(&record) {
        Ok(reservation) => reservation,
        Err(SubbotError::AlreadyActive(_)) => return Outcome::Skipped,
        Err(e) => {
            warn!(code = %code, "Recovery relaunch refused: {}", e);
            return Outcome::Failed;
        }
    };

    let record = if record.status == SessionStatus::Reconnecting {
        record
    } else {
        let update = StatusUpdate::to(SessionStatus::Reconnecting).reason("recovery");
        match store.update_status(&code, update).await {
            Ok(record) => record,
            Err(e) => {
                warn!(code = %code, "Could not mark session reconnecting: {}", e);
                return Outcome::Failed;
            }
        }
    };

    let ready = supervisor.spawn(reservation, record, LaunchMode::Resume);
    match tokio::time::timeout(timeout, ready).await {
        Ok(Ok(Ok(_))) => Outcome::Relaunched,
        Ok(Ok(Err(e))) => {
            warn!(code = %code, "Recovery relaunch failed: {}", e);
            Outcome::Failed
        }
        Ok(Err(_)) => Outcome::Failed,
        Err(_) => {
            warn!(code = %code, "Recovery relaunch still connecting after {}s", timeout.as_secs());
            Outcome::Pending
        }
    }
}
