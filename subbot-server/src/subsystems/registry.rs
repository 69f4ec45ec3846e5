//! In-memory registry of live session supervisors.
//!
//! One entry per code that currently has a supervisor task. The entry is the
//! only way to reach that task: a control channel for operator commands plus a
//! cancellation token that is a child of the process-wide root token. Holding
//! an entry also holds an admission slot.

use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use subbot_core::models::SessionRecord;
use subbot_core::SubbotError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::admission::{AdmissionLimiter, AdmissionPermit};

const CONTROL_CAPACITY: usize = 8;

/// Commands a supervisor accepts while it runs.
#[derive(Debug)]
pub enum Control {
    /// Close the connection and finish in `inactive`.
    Deactivate {
        actor: String,
        reply: oneshot::Sender<Result<SessionRecord, SubbotError>>,
    },
    /// The liveness monitor saw no heartbeat within the threshold.
    Stale,
}

#[derive(Debug)]
pub struct SessionEntry {
    pub code: String,
    pub owner: String,
    control: mpsc::Sender<Control>,
    cancel: CancellationToken,
    permit: Mutex<Option<AdmissionPermit>>,
}

impl SessionEntry {
    fn release_permit(&self) {
        if let Ok(mut permit) = self.permit.lock() {
            permit.take();
        }
    }
}

/// A registry slot handed to a supervisor task. Dropping it unused frees the
/// slot again.
#[derive(Debug)]
pub struct Reservation {
    guard: ReleaseGuard,
    control_rx: mpsc::Receiver<Control>,
}

impl Reservation {
    pub fn code(&self) -> &str {
        &self.guard.entry.code
    }

    /// Hand the slot to a supervisor task, which releases it when it stops.
    pub(crate) fn into_parts(
        self,
    ) -> (Arc<SessionEntry>, mpsc::Receiver<Control>, CancellationToken) {
        let Reservation {
            mut guard,
            control_rx,
        } = self;
        guard.spawned = true;
        let entry = Arc::clone(&guard.entry);
        let cancel = entry.cancel.clone();
        (entry, control_rx, cancel)
    }
}

#[derive(Debug)]
struct ReleaseGuard {
    registry: SessionRegistry,
    entry: Arc<SessionEntry>,
    spawned: bool,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if !self.spawned {
            self.registry.release(&self.entry);
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionRegistry {
    entries: Arc<DashMap<String, Arc<SessionEntry>>>,
    limiter: Arc<AdmissionLimiter>,
    root: CancellationToken,
}

impl SessionRegistry {
    pub fn new(limiter: Arc<AdmissionLimiter>, root: CancellationToken) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            limiter,
            root,
        }
    }

    pub fn limiter(&self) -> &Arc<AdmissionLimiter> {
        &self.limiter
    }

    /// Claim `code` for a new supervisor, taking an admission slot for `owner`.
    pub fn reserve(&self, code: &str, owner: &str) -> Result<Reservation, SubbotError> {
        if self.entries.contains_key(code) {
            return Err(SubbotError::AlreadyActive(code.to_string()));
        }
        let permit = self.limiter.try_acquire(owner)?;
        self.adopt(code, permit)
    }

    /// Claim `code` with a slot the caller already acquired.
    pub fn adopt(&self, code: &str, permit: AdmissionPermit) -> Result<Reservation, SubbotError> {
        match self.entries.entry(code.to_string()) {
            Entry::Occupied(_) => Err(SubbotError::AlreadyActive(code.to_string())),
            Entry::Vacant(slot) => {
                let (control, control_rx) = mpsc::channel(CONTROL_CAPACITY);
                let entry = Arc::new(SessionEntry {
                    code: code.to_string(),
                    owner: permit.owner().to_string(),
                    control,
                    cancel: self.root.child_token(),
                    permit: Mutex::new(Some(permit)),
                });
                slot.insert(Arc::clone(&entry));
                Ok(Reservation {
                    guard: ReleaseGuard {
                        registry: self.clone(),
                        entry,
                        spawned: false,
                    },
                    control_rx,
                })
            }
        }
    }

    /// Drop `entry` if it is still the one registered under its code.
    pub fn release(&self, entry: &Arc<SessionEntry>) {
        entry.release_permit();
        self.entries
            .remove_if(&entry.code, |_, current| Arc::ptr_eq(current, entry));
    }

    pub fn contains(&self, code: &str) -> bool {
        self.entries.contains_key(code)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cloned out so callers never hold a map guard across an await.
    pub fn control_sender(&self, code: &str) -> Option<mpsc::Sender<Control>> {
        self.entries.get(code).map(|e| e.control.clone())
    }

    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.root.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(max_total: usize, max_per_owner: usize) -> SessionRegistry {
        SessionRegistry::new(
            AdmissionLimiter::new(max_total, max_per_owner),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_second_reserve_for_same_code_is_rejected() {
        let registry = registry(10, 0);
        let first = registry.reserve("SB-1", "owner").unwrap();
        let err = registry.reserve("SB-1", "owner").unwrap_err();
        assert!(matches!(err, SubbotError::AlreadyActive(code) if code == "SB-1"));
        assert_eq!(registry.limiter().in_use(), 1);
        drop(first);
    }

    #[test]
    fn test_unused_reservation_frees_slot() {
        let registry = registry(1, 0);
        let reservation = registry.reserve("SB-1", "owner").unwrap();
        assert_eq!(reservation.code(), "SB-1");
        drop(reservation);
        assert!(!registry.contains("SB-1"));
        assert_eq!(registry.limiter().in_use(), 0);
        assert!(registry.reserve("SB-2", "owner").is_ok());
    }

    #[test]
    fn test_spawned_reservation_keeps_slot_until_released() {
        let registry = registry(1, 0);
        let (entry, _rx, _cancel) = registry.reserve("SB-1", "owner").unwrap().into_parts();
        assert!(registry.contains("SB-1"));
        assert_eq!(registry.limiter().in_use(), 1);
        registry.release(&entry);
        assert_eq!(registry.limiter().in_use(), 0);
    }

    #[test]
    fn test_release_only_removes_matching_entry() {
        let registry = registry(10, 0);
        let (entry, _rx, _cancel) = registry.reserve("SB-1", "owner").unwrap().into_parts();
        registry.release(&entry);
        assert!(!registry.contains("SB-1"));

        let (newer, _rx2, _cancel2) = registry.reserve("SB-1", "owner").unwrap().into_parts();
        registry.release(&entry);
        assert!(registry.contains("SB-1"));
        registry.release(&newer);
        assert!(registry.is_empty());
        assert_eq!(registry.limiter().in_use(), 0);
    }

    #[test]
    fn test_capacity_rejection_leaves_registry_untouched() {
        let registry = registry(1, 0);
        let _held = registry.reserve("SB-1", "a").unwrap();
        let err = registry.reserve("SB-2", "b").unwrap_err();
        assert_eq!(err.kind(), "capacity_exceeded");
        assert!(registry.contains("SB-1"));
        assert!(!registry.contains("SB-2"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_cancel_all_reaches_children() {
        let registry = registry(10, 0);
        let (_entry, _rx, cancel) = registry.reserve("SB-1", "a").unwrap().into_parts();
        assert!(!cancel.is_cancelled());
        registry.cancel_all();
        assert!(cancel.is_cancelled());
        assert!(registry.is_shutting_down());
    }
}
