//! Deadline queue driven by the destination's event loop.
//!
//! The loop sleeps until [`TimerQueue::next_deadline`] and then drains
//! [`TimerQueue::pop_expired`]. Cancelled timers stay in the heap until
//! they surface and are skipped there.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use tokio::time::Instant;

use crate::types::IdentHash;

/// Handle to a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// What a timer is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Lookup round for the given target timed out.
    LookupRound(IdentHash),
    /// Published lease set was not confirmed in time.
    PublishConfirmation,
    /// Periodic repository and session-tag cleanup.
    Cleanup,
    /// Periodic check for approaching lease expiry.
    LeaseRefresh,
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    live: HashMap<TimerId, TimerKind>,
    next_id: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deadline: Instant, kind: TimerKind) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.heap.push(Reverse((deadline, id)));
        self.live.insert(id, kind);
        id
    }

    /// Disarm a timer. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.live.remove(&id).is_some()
    }

    /// Earliest live deadline.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek() {
            if self.live.contains_key(id) {
                return Some(*deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Remove and return every live timer due at or before `now`, earliest first.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<(TimerId, TimerKind)> {
        let mut fired = Vec::new();
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(kind) = self.live.remove(&id) {
                fired.push((id, kind));
            }
        }
        fired
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fires_in_deadline_order() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        timers.schedule(now + Duration::from_secs(5), TimerKind::Cleanup);
        timers.schedule(now + Duration::from_secs(1), TimerKind::PublishConfirmation);

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(1)));
        let fired = timers.pop_expired(now + Duration::from_secs(10));
        let kinds: Vec<_> = fired.into_iter().map(|(_, k)| k).collect();
        assert_eq!(kinds, vec![TimerKind::PublishConfirmation, TimerKind::Cleanup]);
        assert!(timers.is_empty());
    }

    #[test]
    fn nothing_fires_early() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        timers.schedule(now + Duration::from_secs(5), TimerKind::Cleanup);
        assert!(timers.pop_expired(now).is_empty());
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        let target = IdentHash::from_bytes([1; 32]);
        let id = timers.schedule(now, TimerKind::LookupRound(target));

        assert!(timers.cancel(id));
        assert!(!timers.cancel(id));
        assert_eq!(timers.next_deadline(), None);
        assert!(timers.pop_expired(now + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn clear_disarms_everything() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        timers.schedule(now, TimerKind::Cleanup);
        timers.schedule(now, TimerKind::LeaseRefresh);
        timers.clear();
        assert!(timers.is_empty());
        assert!(timers.pop_expired(now).is_empty());
    }
}
