//! Cache of remote lease sets learned from lookups and directory stores.
//!
//! Entries are shared as `Arc<LeaseSet>` snapshots. Each entry remembers
//! when it was last stored or handed out; cleanup purges entries unused
//! for the retention window and entries whose leases have all expired.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::DestinationError;
use crate::lease_set::LeaseSet;
use crate::types::IdentHash;

struct Entry {
    lease_set: Arc<LeaseSet>,
    last_used: Instant,
}

#[derive(Default)]
pub struct LeaseSetRepository {
    entries: HashMap<IdentHash, Entry>,
}

impl LeaseSetRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify and store a lease set under `key`.
    ///
    /// The key must be the lease set's own identity hash and the signature
    /// must check out; otherwise nothing is stored. A newer copy replaces
    /// the cached one.
    pub fn insert(
        &mut self,
        key: &IdentHash,
        lease_set: LeaseSet,
        now: Instant,
    ) -> Result<Arc<LeaseSet>, DestinationError> {
        let ident = lease_set.ident_hash();
        if ident != *key {
            return Err(DestinationError::Malformed {
                reason: format!("lease set for {ident} stored under {key}"),
            });
        }
        lease_set.verify()?;

        let lease_set = Arc::new(lease_set);
        self.entries.insert(
            ident,
            Entry {
                lease_set: Arc::clone(&lease_set),
                last_used: now,
            },
        );
        Ok(lease_set)
    }

    /// Cached lease set with at least one live lease; marks it used.
    ///
    /// An entry whose leases have all expired is not returned. It stays
    /// until the next cleanup.
    pub fn find(&mut self, key: &IdentHash, now: Instant, now_ms: u64) -> Option<Arc<LeaseSet>> {
        let entry = self.entries.get_mut(key)?;
        if !entry.lease_set.has_non_expired_leases(now_ms) {
            tracing::debug!("repository: lease set {key} expired");
            return None;
        }
        entry.last_used = now;
        Some(Arc::clone(&entry.lease_set))
    }

    pub fn contains(&self, key: &IdentHash) -> bool {
        self.entries.contains_key(key)
    }

    /// Purge stale entries. Returns the number removed.
    pub fn cleanup(&mut self, now: Instant, now_ms: u64, retention: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|ident, entry| {
            let keep = entry.lease_set.has_non_expired_leases(now_ms)
                && now.saturating_duration_since(entry.last_used) < retention;
            if !keep {
                tracing::debug!("repository: purging lease set {ident}");
            }
            keep
        });
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
