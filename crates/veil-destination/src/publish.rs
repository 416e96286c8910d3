//! Publish cycle bookkeeping for the local lease set.
//!
//! A cycle stores the lease set at one directory node at a time and waits
//! for a delivery status carrying the store's token. A timeout moves on to
//! a node not yet tried in this cycle. Every pool change starts a new
//! cycle with an empty exclusion set.
//!
//! Pure logic, no I/O.

use std::collections::HashSet;

use crate::directory::NetDb;
use crate::timer::TimerId;
use crate::types::IdentHash;

/// Store awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPublish {
    pub token: u32,
    pub floodfill: IdentHash,
    pub timer: Option<TimerId>,
}

#[derive(Debug, Default)]
pub struct PublishCoordinator {
    pending: Option<PendingPublish>,
    excluded: HashSet<IdentHash>,
}

impl PublishCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the current cycle. Returns the timer of an abandoned store.
    pub fn start_cycle(&mut self) -> Option<TimerId> {
        self.excluded.clear();
        self.pending.take().and_then(|p| p.timer)
    }

    /// Closest directory node to `key` not tried in this cycle.
    ///
    /// When every node has been tried the exclusion set is cleared and
    /// `None` is returned; the cycle stops until the next trigger.
    pub fn next_floodfill(&mut self, key: &IdentHash, netdb: &dyn NetDb) -> Option<IdentHash> {
        match netdb.closest_floodfill(key, &self.excluded) {
            Some(floodfill) => {
                self.excluded.insert(floodfill);
                Some(floodfill)
            }
            None => {
                self.excluded.clear();
                None
            }
        }
    }

    /// Record a store sent to `floodfill`. Returns its fresh, non-zero token.
    pub fn begin(&mut self, floodfill: IdentHash) -> u32 {
        let token = loop {
            let t: u32 = rand::random();
            if t != 0 {
                break t;
            }
        };
        self.pending = Some(PendingPublish {
            token,
            floodfill,
            timer: None,
        });
        token
    }

    pub fn set_timer(&mut self, timer: TimerId) {
        if let Some(pending) = self.pending.as_mut() {
            pending.timer = Some(timer);
        }
    }

    /// Match a delivery status against the pending store.
    ///
    /// On a match the cycle is complete and the pending store is returned.
    pub fn confirm(&mut self, msg_id: u32) -> Option<PendingPublish> {
        match &self.pending {
            Some(p) if p.token == msg_id => self.pending.take(),
            _ => None,
        }
    }

    /// True if `timer` is the confirmation timer of the pending store,
    /// which is then abandoned.
    pub fn on_timeout(&mut self, timer: TimerId) -> bool {
        match &self.pending {
            Some(p) if p.timer == Some(timer) => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    pub fn pending(&self) -> Option<&PendingPublish> {
        self.pending.as_ref()
    }

    /// Nodes tried in the current cycle.
    pub fn tried(&self) -> &HashSet<IdentHash> {
        &self.excluded
    }
}
