//! Admission limiter
//!
//! Bounds how many sessions may hold a live connection at once, process-wide
//! and per owner. The global bound is a single atomic counter; per-owner
//! counts live in a `DashMap` so owners never contend with each other. A
//! rejected request is not queued: the caller gets `CapacityExceeded` and is
//! expected to retry later.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use subbot_core::SubbotError;

/// `0` disables a bound.
#[derive(Debug)]
pub struct AdmissionLimiter {
    max_total: usize,
    max_per_owner: usize,
    total: AtomicUsize,
    per_owner: DashMap<String, usize>,
}

impl AdmissionLimiter {
    pub fn new(max_total: usize, max_per_owner: usize) -> Arc<Self> {
        Arc::new(Self {
            max_total,
            max_per_owner,
            total: AtomicUsize::new(0),
            per_owner: DashMap::new(),
        })
    }

    pub fn try_acquire(self: &Arc<Self>, owner: &str) -> Result<AdmissionPermit, SubbotError> {
        if self.max_per_owner > 0 {
            let mut count = self.per_owner.entry(owner.to_string()).or_insert(0);
            if *count >= self.max_per_owner {
                return Err(SubbotError::CapacityExceeded {
                    scope: format!("owner {}", owner),
                    limit: self.max_per_owner,
                });
            }
            *count += 1;
        }

        let max_total = self.max_total;
        let admitted = self
            .total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (max_total == 0 || n < max_total).then_some(n + 1)
            })
            .is_ok();
        if !admitted {
            self.release_owner(owner);
            return Err(SubbotError::CapacityExceeded {
                scope: "global".to_string(),
                limit: max_total,
            });
        }

        Ok(AdmissionPermit {
            limiter: Arc::clone(self),
            owner: owner.to_string(),
        })
    }

    pub fn in_use(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn owner_in_use(&self, owner: &str) -> usize {
        self.per_owner.get(owner).map(|c| *c).unwrap_or(0)
    }

    fn release_owner(&self, owner: &str) {
        if self.max_per_owner == 0 {
            return;
        }
        if let Some(mut count) = self.per_owner.get_mut(owner) {
            *count = count.saturating_sub(1);
        }
        self.per_owner.remove_if(owner, |_, count| *count == 0);
    }
}

/// One admitted slot. Dropping it gives the slot back.
#[derive(Debug)]
pub struct AdmissionPermit {
    limiter: Arc<AdmissionLimiter>,
    owner: String,
}

impl AdmissionPermit {
    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.limiter.total.fetch_sub(1, Ordering::SeqCst);
        self.limiter.release_owner(&self.owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_cap_admits_exactly_n() {
        let limiter = AdmissionLimiter::new(3, 0);
        let mut permits = Vec::new();
        let mut rejected = 0;
        for i in 0..4 {
            match limiter.try_acquire(&format!("owner-{}", i)) {
                Ok(p) => permits.push(p),
                Err(SubbotError::CapacityExceeded { scope, limit }) => {
                    assert_eq!(scope, "global");
                    assert_eq!(limit, 3);
                    rejected += 1;
                }
                Err(e) => panic!("unexpected error {:?}", e),
            }
        }
        assert_eq!(permits.len(), 3);
        assert_eq!(rejected, 1);
        assert_eq!(limiter.in_use(), 3);
    }

    #[test]
    fn test_concurrent_acquire_respects_cap() {
        let limiter = AdmissionLimiter::new(8, 0);
        let handles: Vec<_> = (0..9)
            .map(|i| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || limiter.try_acquire(&format!("o{}", i)))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let capacity = results
            .iter()
            .filter(|r| matches!(r, Err(SubbotError::CapacityExceeded { .. })))
            .count();
        assert_eq!(ok, 8);
        assert_eq!(capacity, 1);
    }

    #[test]
    fn test_per_owner_cap_and_release() {
        let limiter = AdmissionLimiter::new(10, 2);
        let a = limiter.try_acquire("549111").unwrap();
        let _b = limiter.try_acquire("549111").unwrap();
        let err = limiter.try_acquire("549111").unwrap_err();
        assert!(matches!(err, SubbotError::CapacityExceeded { limit: 2, .. }));
        assert!(limiter.try_acquire("549222").is_ok());

        drop(a);
        assert_eq!(limiter.owner_in_use("549111"), 1);
        assert!(limiter.try_acquire("549111").is_ok());
    }

    #[test]
    fn test_global_rejection_rolls_back_owner_count() {
        let limiter = AdmissionLimiter::new(1, 5);
        let _held = limiter.try_acquire("a").unwrap();
        assert!(limiter.try_acquire("b").is_err());
        assert_eq!(limiter.owner_in_use("b"), 0);
    }

    #[test]
    fn test_drop_returns_slot() {
        let limiter = AdmissionLimiter::new(1, 0);
        let permit = limiter.try_acquire("a").unwrap();
        assert_eq!(permit.owner(), "a");
        drop(permit);
        assert_eq!(limiter.in_use(), 0);
        assert!(limiter.try_acquire("a").is_ok());
    }
}
