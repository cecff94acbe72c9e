//! Request coalescing
//!
//! Concurrent cache misses for the same key can share one execution:
//!
//! ```text
//! execute(A) ─┐
//!             │                         leader runs the
//! execute(B) ─┼──► RequestCoalescer ──► fallback chain once
//!             │         │                     │
//! execute(C) ─┘         ▼                     ▼
//!               B, C await broadcast ◄── outcome
//! ```
//!
//! The first caller becomes the leader and holds a [`CoalesceLease`].
//! Completing the lease broadcasts the outcome to every follower. If the
//! leader is dropped without completing (cancelled), followers see the
//! channel close and run their own execution.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

struct Slot<T> {
    lease_id: u64,
    sender: broadcast::Sender<T>,
}

/// Outcome of registering a key
pub enum Registration<'a, T: Clone> {
    /// First caller: run the work and complete the lease
    Leader(CoalesceLease<'a, T>),
    /// Work already in flight: await the leader's outcome
    Follower(broadcast::Receiver<T>),
}

/// Coalescing statistics
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CoalescerStats {
    /// Registrations that started new work
    pub leaders: u64,
    /// Registrations that joined in-flight work
    pub followers: u64,
    /// Leases dropped without an outcome
    pub abandoned: u64,
}

/// Tracks in-flight work by key
pub struct RequestCoalescer<T: Clone> {
    in_flight: DashMap<String, Slot<T>>,
    next_lease: AtomicU64,
    leaders: AtomicU64,
    followers: AtomicU64,
    abandoned: AtomicU64,
}

impl<T: Clone> Default for RequestCoalescer<T> {
    fn default() -> Self {
        Self {
            in_flight: DashMap::new(),
            next_lease: AtomicU64::new(0),
            leaders: AtomicU64::new(0),
            followers: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
        }
    }
}

impl<T: Clone> RequestCoalescer<T> {
    /// Create an empty coalescer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Join or start the work for `key`
    pub fn register(&self, key: &str) -> Registration<'_, T> {
        match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                self.followers.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(cache_key = key, "Joining in-flight execution");
                Registration::Follower(entry.get().sender.subscribe())
            }
            Entry::Vacant(entry) => {
                let lease_id = self.next_lease.fetch_add(1, Ordering::Relaxed);
                // Outcomes are sent exactly once
                let (sender, _) = broadcast::channel(1);
                entry.insert(Slot { lease_id, sender });
                self.leaders.fetch_add(1, Ordering::Relaxed);
                Registration::Leader(CoalesceLease {
                    coalescer: self,
                    key: key.to_string(),
                    lease_id,
                    finished: false,
                })
            }
        }
    }

    fn take(&self, key: &str, lease_id: u64) -> Option<broadcast::Sender<T>> {
        self.in_flight
            .remove_if(key, |_, slot| slot.lease_id == lease_id)
            .map(|(_, slot)| slot.sender)
    }

    /// Keys with work in flight
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> CoalescerStats {
        CoalescerStats {
            leaders: self.leaders.load(Ordering::Relaxed),
            followers: self.followers.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

/// Leadership of one in-flight key
pub struct CoalesceLease<'a, T: Clone> {
    coalescer: &'a RequestCoalescer<T>,
    key: String,
    lease_id: u64,
    finished: bool,
}

impl<T: Clone> CoalesceLease<'_, T> {
    /// Publish the outcome to followers and release the key
    ///
    /// The key is released before sending, so callers arriving afterwards
    /// start fresh (and normally hit the cache).
    pub fn complete(mut self, outcome: T) {
        self.finished = true;
        if let Some(sender) = self.coalescer.take(&self.key, self.lease_id) {
            let waiting = sender.receiver_count();
            // No receivers is fine
            let _ = sender.send(outcome);
            if waiting > 0 {
                tracing::debug!(cache_key = %self.key, waiting, "Shared outcome with followers");
            }
        }
    }
}

impl<T: Clone> Drop for CoalesceLease<'_, T> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if self.coalescer.take(&self.key, self.lease_id).is_some() {
            self.coalescer.abandoned.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                cache_key = %self.key,
                "Leader abandoned execution, followers will retry"
            );
        }
    }
}
