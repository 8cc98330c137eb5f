// =============================================================================
// Market locks — per-market leases serializing all candidate work
// =============================================================================
//
// A lock may be stolen only after its expiry plus a 5-second grace. Renewal
// extends the lease to now+60s and bumps the version; the pre-submit check
// requires owner match, version match, and at least 10 seconds of remaining
// TTL — anything else aborts the submission with LOCK_LOST.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::constants::{LOCK_STEAL_GRACE_SEC, LOCK_TTL_SEC, MIN_LOCK_TTL_BEFORE_SUBMIT_SEC};

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone)]
pub struct MarketLock {
    pub market_id: String,
    pub owner_instance_id: String,
    pub owner_worker_id: String,
    pub version: u64,
    pub heartbeat_ms: i64,
    pub expires_at_ms: i64,
}

impl MarketLock {
    fn new(market_id: &str, instance_id: &str, worker_id: &str, now: i64) -> Self {
        Self {
            market_id: market_id.to_string(),
            owner_instance_id: instance_id.to_string(),
            owner_worker_id: worker_id.to_string(),
            version: 1,
            heartbeat_ms: now,
            expires_at_ms: now + LOCK_TTL_SEC * 1000,
        }
    }

    fn is_stealable(&self, now: i64) -> bool {
        now > self.expires_at_ms + LOCK_STEAL_GRACE_SEC * 1000
    }
}

/// In-memory per-market lease manager, one per process instance.
pub struct LockManager {
    instance_id: String,
    locks: Mutex<HashMap<String, MarketLock>>,
}

impl LockManager {
    pub fn new(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Acquire a lease. Succeeds when no lock exists, the holder's lease is
    /// expired past the steal grace, or the requester already owns it.
    /// Returns the lock version on success.
    pub fn acquire(&self, market_id: &str, worker_id: &str) -> Option<u64> {
        let now = now_ms();
        let mut locks = self.locks.lock();

        match locks.get(market_id) {
            None => {
                let lock = MarketLock::new(market_id, &self.instance_id, worker_id, now);
                let version = lock.version;
                locks.insert(market_id.to_string(), lock);
                debug!(market_id, worker_id, version, "lock acquired");
                Some(version)
            }
            Some(existing) if existing.is_stealable(now) => {
                let mut lock = MarketLock::new(market_id, &self.instance_id, worker_id, now);
                lock.version = existing.version + 1;
                let version = lock.version;
                warn!(
                    market_id,
                    from = %existing.owner_worker_id,
                    by = worker_id,
                    version,
                    "lock stolen after expiry grace"
                );
                locks.insert(market_id.to_string(), lock);
                Some(version)
            }
            Some(existing)
                if existing.owner_instance_id == self.instance_id
                    && existing.owner_worker_id == worker_id =>
            {
                Some(existing.version)
            }
            Some(_) => None,
        }
    }

    /// Renew the lease: refresh heartbeat, extend expiry to now+60s, bump
    /// version. Only the owner may renew.
    pub fn renew(&self, market_id: &str, worker_id: &str) -> Option<u64> {
        let now = now_ms();
        let mut locks = self.locks.lock();
        let lock = locks.get_mut(market_id)?;

        if lock.owner_instance_id != self.instance_id || lock.owner_worker_id != worker_id {
            return None;
        }

        lock.heartbeat_ms = now;
        lock.expires_at_ms = now + LOCK_TTL_SEC * 1000;
        lock.version += 1;
        Some(lock.version)
    }

    pub fn release(&self, market_id: &str, worker_id: &str) -> bool {
        let mut locks = self.locks.lock();
        match locks.get(market_id) {
            Some(lock)
                if lock.owner_instance_id == self.instance_id
                    && lock.owner_worker_id == worker_id =>
            {
                locks.remove(market_id);
                true
            }
            _ => false,
        }
    }

    /// Pre-submit validation: owner instance + worker match, expected
    /// version match, and remaining TTL of at least 10 seconds.
    pub fn validate_for_submit(
        &self,
        market_id: &str,
        worker_id: &str,
        expected_version: u64,
    ) -> Result<(), String> {
        let now = now_ms();
        let locks = self.locks.lock();
        let Some(lock) = locks.get(market_id) else {
            return Err(format!("no lock held for market {market_id}"));
        };

        if lock.owner_instance_id != self.instance_id {
            return Err("lock owned by different instance".to_string());
        }
        if lock.owner_worker_id != worker_id {
            return Err("lock owned by different worker".to_string());
        }

        let remaining_ms = lock.expires_at_ms - now;
        if remaining_ms < MIN_LOCK_TTL_BEFORE_SUBMIT_SEC * 1000 {
            return Err(format!(
                "lock TTL too low ({}ms < {}ms)",
                remaining_ms,
                MIN_LOCK_TTL_BEFORE_SUBMIT_SEC * 1000
            ));
        }
        if lock.version != expected_version {
            return Err(format!(
                "lock version mismatch (expected={} actual={})",
                expected_version, lock.version
            ));
        }

        Ok(())
    }

    #[cfg(test)]
    fn force_expire(&self, market_id: &str, delta_ms: i64) {
        let mut locks = self.locks.lock();
        if let Some(lock) = locks.get_mut(market_id) {
            lock.expires_at_ms -= delta_ms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_reentrant_acquire() {
        let lm = LockManager::new("inst-1");
        assert_eq!(lm.acquire("m1", "w1"), Some(1));
        // Same worker re-acquires at the same version.
        assert_eq!(lm.acquire("m1", "w1"), Some(1));
        // Another worker is refused.
        assert_eq!(lm.acquire("m1", "w2"), None);
    }

    #[test]
    fn steal_requires_expiry_plus_grace() {
        let lm = LockManager::new("inst-1");
        lm.acquire("m1", "w1").unwrap();

        // Expired but inside the 5s grace: still held.
        lm.force_expire("m1", LOCK_TTL_SEC * 1000 + 1_000);
        assert_eq!(lm.acquire("m1", "w2"), None);

        // Past expiry + grace: stealable, version bumps.
        lm.force_expire("m1", LOCK_STEAL_GRACE_SEC * 1000);
        assert_eq!(lm.acquire("m1", "w2"), Some(2));
    }

    #[test]
    fn renew_extends_and_bumps_version() {
        let lm = LockManager::new("inst-1");
        lm.acquire("m1", "w1").unwrap();
        assert_eq!(lm.renew("m1", "w1"), Some(2));
        assert_eq!(lm.renew("m1", "w1"), Some(3));
        // Non-owner renew fails.
        assert_eq!(lm.renew("m1", "w2"), None);
        assert_eq!(lm.renew("missing", "w1"), None);
    }

    #[test]
    fn release_only_by_owner() {
        let lm = LockManager::new("inst-1");
        lm.acquire("m1", "w1").unwrap();
        assert!(!lm.release("m1", "w2"));
        assert!(lm.release("m1", "w1"));
        // Freed for anyone.
        assert_eq!(lm.acquire("m1", "w2"), Some(1));
    }

    #[test]
    fn validate_for_submit_gates() {
        let lm = LockManager::new("inst-1");
        let version = lm.acquire("m1", "w1").unwrap();

        assert!(lm.validate_for_submit("m1", "w1", version).is_ok());

        // Wrong version.
        let err = lm.validate_for_submit("m1", "w1", version + 1).unwrap_err();
        assert!(err.contains("version mismatch"));

        // Wrong worker.
        let err = lm.validate_for_submit("m1", "w2", version).unwrap_err();
        assert!(err.contains("different worker"));

        // No lock at all.
        let err = lm.validate_for_submit("m2", "w1", 1).unwrap_err();
        assert!(err.contains("no lock"));

        // TTL below the submission floor.
        lm.force_expire("m1", (LOCK_TTL_SEC - MIN_LOCK_TTL_BEFORE_SUBMIT_SEC + 1) * 1000);
        let err = lm.validate_for_submit("m1", "w1", version).unwrap_err();
        assert!(err.contains("TTL too low"));
    }
}
