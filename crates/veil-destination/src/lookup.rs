//! Iterative lease set lookups.
//!
//! At most one request per target. Each round picks up to
//! `max_per_round` directory nodes closest to the target that were not
//! asked before, and every node picked joins the request's exclusion set.
//! The set only grows and is dropped with the request.
//!
//! Pure logic, no I/O. The caller sends the lookups, arms the round timer,
//! and resolves the waiters returned by [`LookupCoordinator::complete`].
//! Waiters are opaque here: anything the caller wants to resume once the
//! lease set is known (or known to be missing).

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;

use crate::directory::{closest_by_distance, NetDb};
use crate::timer::TimerId;
use crate::types::{IdentHash, MAX_LEASESET_REQUEST_TIMEOUT, MAX_NUM_FLOODFILLS_PER_REQUEST};

/// In-flight resolution of one remote lease set.
#[derive(Debug)]
pub struct LeaseSetRequest<W> {
    pub excluded: HashSet<IdentHash>,
    /// Peers hinted by search replies, to be asked next round.
    pub candidates: Vec<IdentHash>,
    pub started_at: Instant,
    pub timer: Option<TimerId>,
    pub waiters: Vec<W>,
}

/// What to do with a fired round timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Timer belongs to a request that is gone or already moved on.
    Stale,
    /// Start another round.
    Retry,
    /// Overall time cap reached; resolve "not found".
    Expired,
}

#[derive(Debug)]
pub struct LookupCoordinator<W> {
    requests: HashMap<IdentHash, LeaseSetRequest<W>>,
    max_per_round: usize,
    max_lookup_time: Duration,
}

impl<W> Default for LookupCoordinator<W> {
    fn default() -> Self {
        Self::new(MAX_NUM_FLOODFILLS_PER_REQUEST, MAX_LEASESET_REQUEST_TIMEOUT)
    }
}

impl<W> LookupCoordinator<W> {
    pub fn new(max_per_round: usize, max_lookup_time: Duration) -> Self {
        Self {
            requests: HashMap::new(),
            max_per_round,
            max_lookup_time,
        }
    }

    /// Attach `waiter` to the request for `target`, creating it if needed.
    ///
    /// Returns true if a new request was created (caller starts round one).
    pub fn request(&mut self, target: IdentHash, waiter: W, now: Instant) -> bool {
        if let Some(existing) = self.requests.get_mut(&target) {
            existing.waiters.push(waiter);
            return false;
        }
        self.requests.insert(
            target,
            LeaseSetRequest {
                excluded: HashSet::new(),
                candidates: Vec::new(),
                started_at: now,
                timer: None,
                waiters: vec![waiter],
            },
        );
        true
    }

    pub fn is_pending(&self, target: &IdentHash) -> bool {
        self.requests.contains_key(target)
    }

    pub fn get(&self, target: &IdentHash) -> Option<&LeaseSetRequest<W>> {
        self.requests.get(target)
    }

    /// Pick the nodes for the next round and add them to the exclusion set.
    ///
    /// Hinted candidates go first, then the closest directory nodes. An
    /// empty result means there is nobody left to ask.
    pub fn next_round(&mut self, target: &IdentHash, netdb: &dyn NetDb) -> Vec<IdentHash> {
        let Some(request) = self.requests.get_mut(target) else {
            return Vec::new();
        };

        let mut picked = closest_by_distance(
            target,
            request.candidates.iter(),
            &request.excluded,
            self.max_per_round,
        );
        request.candidates.clear();
        request.excluded.extend(picked.iter().copied());

        let remaining = self.max_per_round.saturating_sub(picked.len());
        if remaining > 0 {
            let more = netdb.closest_floodfills(target, &request.excluded, remaining);
            request.excluded.extend(more.iter().copied());
            picked.extend(more);
        }
        picked
    }

    /// Add peers from a search reply as candidates for the next round.
    ///
    /// Peers already asked are ignored. Peers the directory has no record
    /// of are not queried; the directory is asked to fetch them instead.
    /// Returns false if there is no request for `target`.
    pub fn add_hints(&mut self, target: &IdentHash, peers: &[IdentHash], netdb: &dyn NetDb) -> bool {
        let Some(request) = self.requests.get_mut(target) else {
            return false;
        };
        for peer in peers {
            if request.excluded.contains(peer) || request.candidates.contains(peer) {
                continue;
            }
            if netdb.has_router(peer) {
                request.candidates.push(*peer);
            } else {
                tracing::debug!("lookup: hinted peer {peer} unknown, requesting router");
                netdb.request_router(peer);
            }
        }
        true
    }

    pub fn set_timer(&mut self, target: &IdentHash, timer: TimerId) {
        if let Some(request) = self.requests.get_mut(target) {
            request.timer = Some(timer);
        }
    }

    /// Classify a fired round timer.
    pub fn on_timeout(&mut self, target: &IdentHash, timer: TimerId, now: Instant) -> TimeoutAction {
        let Some(request) = self.requests.get_mut(target) else {
            return TimeoutAction::Stale;
        };
        if request.timer != Some(timer) {
            return TimeoutAction::Stale;
        }
        request.timer = None;
        if now.saturating_duration_since(request.started_at) < self.max_lookup_time {
            TimeoutAction::Retry
        } else {
            TimeoutAction::Expired
        }
    }

    /// Remove the request for `target`, handing back its waiters and timer.
    ///
    /// Used both to resolve and to cancel. A second call returns `None`,
    /// so no request can be finished twice.
    pub fn complete(&mut self, target: &IdentHash) -> Option<LeaseSetRequest<W>> {
        self.requests.remove(target)
    }

    /// Remove every request (shutdown).
    pub fn drain(&mut self) -> Vec<LeaseSetRequest<W>> {
        self.requests.drain().map(|(_, r)| r).collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
