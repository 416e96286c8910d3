//! Directory (floodfill network database) seam.
//!
//! The storage engine is external. The destination only needs: the
//! directory nodes closest to a key (excluding ones already tried), whether
//! a router is known locally, a way to ask for an unknown router's record,
//! and a read of lease sets the local database happens to hold.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::lease_set::LeaseSet;
use crate::types::IdentHash;

pub trait NetDb: Send + Sync {
    /// Up to `count` directory nodes closest to `key` by XOR distance,
    /// skipping `excluded`. Closest first.
    fn closest_floodfills(
        &self,
        key: &IdentHash,
        excluded: &HashSet<IdentHash>,
        count: usize,
    ) -> Vec<IdentHash>;

    /// Single closest directory node not in `excluded`.
    fn closest_floodfill(&self, key: &IdentHash, excluded: &HashSet<IdentHash>) -> Option<IdentHash> {
        self.closest_floodfills(key, excluded, 1).into_iter().next()
    }

    /// Whether the router's record is known (so it can be messaged).
    fn has_router(&self, ident: &IdentHash) -> bool;

    /// Ask the directory to fetch an unknown router's record.
    fn request_router(&self, ident: &IdentHash);

    /// Lease set held by the local database, if any.
    fn find_lease_set(&self, key: &IdentHash) -> Option<LeaseSet>;
}

/// Sort `candidates` by XOR distance to `key` and keep the `count` closest
/// that are not excluded.
pub fn closest_by_distance<'a>(
    key: &IdentHash,
    candidates: impl IntoIterator<Item = &'a IdentHash>,
    excluded: &HashSet<IdentHash>,
    count: usize,
) -> Vec<IdentHash> {
    let mut found: Vec<IdentHash> = candidates
        .into_iter()
        .filter(|c| !excluded.contains(c))
        .copied()
        .collect();
    found.sort_by_key(|c| c.xor_distance(key));
    found.dedup();
    found.truncate(count);
    found
}

/// In-memory directory view, fed by the embedder.
#[derive(Debug, Default)]
pub struct MemoryNetDb {
    floodfills: RwLock<HashSet<IdentHash>>,
    routers: RwLock<HashSet<IdentHash>>,
    lease_sets: RwLock<HashMap<IdentHash, LeaseSet>>,
    requested: RwLock<Vec<IdentHash>>,
}

impl MemoryNetDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a router; `floodfill` marks it as a directory node.
    pub fn add_router(&self, ident: IdentHash, floodfill: bool) {
        write(&self.routers).insert(ident);
        if floodfill {
            write(&self.floodfills).insert(ident);
        }
    }

    pub fn store_lease_set(&self, lease_set: LeaseSet) {
        write(&self.lease_sets).insert(lease_set.ident_hash(), lease_set);
    }

    /// Routers the destination asked us to fetch.
    pub fn requested_routers(&self) -> Vec<IdentHash> {
        read(&self.requested).clone()
    }

    pub fn floodfill_count(&self) -> usize {
        read(&self.floodfills).len()
    }
}

impl NetDb for MemoryNetDb {
    fn closest_floodfills(
        &self,
        key: &IdentHash,
        excluded: &HashSet<IdentHash>,
        count: usize,
    ) -> Vec<IdentHash> {
        closest_by_distance(key, read(&self.floodfills).iter(), excluded, count)
    }

    fn has_router(&self, ident: &IdentHash) -> bool {
        read(&self.routers).contains(ident)
    }

    fn request_router(&self, ident: &IdentHash) {
        write(&self.requested).push(*ident);
    }

    fn find_lease_set(&self, key: &IdentHash) -> Option<LeaseSet> {
        read(&self.lease_sets).get(key).cloned()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
