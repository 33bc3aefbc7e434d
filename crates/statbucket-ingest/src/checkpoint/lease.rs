//! Per-dataset run leases
//!
//! At most one run may hold a dataset at a time. A lease carries a deadline;
//! once it passes, another run may take the dataset over. Holders renew the
//! lease as they make progress, so the deadline bounds the time between two
//! renewals rather than the whole run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::CheckpointLeaseError;

#[derive(Debug, Clone, Copy)]
struct LeaseEntry {
    token: Uuid,
    deadline: Instant,
}

/// Hands out exclusive per-dataset leases
#[derive(Debug, Clone, Default)]
pub struct LeaseManager {
    leases: Arc<Mutex<HashMap<String, LeaseEntry>>>,
}

impl LeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, LeaseEntry>> {
        self.leases.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the lease for `dataset`, valid for `ttl`
    pub fn acquire(&self, dataset: &str, ttl: Duration) -> Result<LeaseGuard, CheckpointLeaseError> {
        let now = Instant::now();
        let mut leases = self.lock();
        if let Some(existing) = leases.get(dataset) {
            if existing.deadline > now {
                return Err(CheckpointLeaseError::Held {
                    dataset: dataset.to_string(),
                    holder: existing.token,
                });
            }
            warn!(dataset = %dataset, holder = %existing.token, "Taking over expired lease");
        }

        let entry = LeaseEntry {
            token: Uuid::new_v4(),
            deadline: now + ttl,
        };
        leases.insert(dataset.to_string(), entry);
        debug!(dataset = %dataset, token = %entry.token, "Lease acquired");

        Ok(LeaseGuard {
            manager: self.clone(),
            dataset: dataset.to_string(),
            token: entry.token,
            deadline: entry.deadline,
        })
    }

    /// Current holder of a dataset lease, if unexpired
    pub fn holder(&self, dataset: &str) -> Option<Uuid> {
        let now = Instant::now();
        self.lock()
            .get(dataset)
            .filter(|e| e.deadline > now)
            .map(|e| e.token)
    }

    /// Move the deadline of a lease still held by `token`
    fn extend(&self, dataset: &str, token: Uuid, deadline: Instant) -> bool {
        let mut leases = self.lock();
        match leases.get_mut(dataset) {
            Some(entry) if entry.token == token => {
                entry.deadline = deadline;
                true
            },
            _ => false,
        }
    }

    fn release(&self, dataset: &str, token: Uuid) {
        let mut leases = self.lock();
        if leases.get(dataset).is_some_and(|e| e.token == token) {
            leases.remove(dataset);
            debug!(dataset = %dataset, token = %token, "Lease released");
        }
    }
}

/// Held lease; released on drop
#[derive(Debug)]
pub struct LeaseGuard {
    manager: LeaseManager,
    dataset: String,
    token: Uuid,
    deadline: Instant,
}

impl LeaseGuard {
    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Still the holder and not past the deadline
    pub fn is_valid(&self) -> bool {
        Instant::now() < self.deadline && self.manager.holder(&self.dataset) == Some(self.token)
    }

    pub fn ensure_valid(&self) -> Result<(), CheckpointLeaseError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(CheckpointLeaseError::Expired(self.dataset.clone()))
        }
    }

    /// Push the deadline to `ttl` from now. An expired or taken-over lease
    /// cannot be renewed.
    pub fn renew(&mut self, ttl: Duration) -> Result<(), CheckpointLeaseError> {
        self.ensure_valid()?;
        let deadline = Instant::now() + ttl;
        if !self.manager.extend(&self.dataset, self.token, deadline) {
            return Err(CheckpointLeaseError::Expired(self.dataset.clone()));
        }
        self.deadline = deadline;
        debug!(dataset = %self.dataset, token = %self.token, "Lease renewed");
        Ok(())
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.manager.release(&self.dataset, self.token);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exclusive_until_dropped() {
        let leases = LeaseManager::new();
        let guard = leases.acquire("team_season", Duration::from_secs(60)).unwrap();
        let err = leases.acquire("team_season", Duration::from_secs(60)).unwrap_err();
        assert!(matches!(err, CheckpointLeaseError::Held { holder, .. } if holder == guard.token()));

        // Other datasets are independent.
        let _other = leases.acquire("player_totals", Duration::from_secs(60)).unwrap();

        drop(guard);
        assert!(leases.acquire("team_season", Duration::from_secs(60)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_can_be_taken_over() {
        let leases = LeaseManager::new();
        let stale = leases.acquire("team_season", Duration::from_secs(5)).unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        assert!(!stale.is_valid());
        let fresh = leases.acquire("team_season", Duration::from_secs(5)).unwrap();

        // Dropping the stale guard must not release the new holder.
        drop(stale);
        assert_eq!(leases.holder("team_season"), Some(fresh.token()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_extends_deadline() {
        let leases = LeaseManager::new();
        let mut guard = leases.acquire("team_season", Duration::from_secs(5)).unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        guard.renew(Duration::from_secs(5)).unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;

        assert!(guard.is_valid());
        assert!(leases.acquire("team_season", Duration::from_secs(5)).is_err());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(matches!(
            guard.renew(Duration::from_secs(5)),
            Err(CheckpointLeaseError::Expired(_))
        ));
    }
}
