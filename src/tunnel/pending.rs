//! Bounded table of upstream requests awaiting a reply.
//!
//! Size and age limits are only enforced when a request is added. An
//! entry leaving the table by any path drops, and thereby closes, its
//! socket.

use std::collections::VecDeque;
use std::net::UdpSocket;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::metrics as counters;

/// Maximum number of requests awaiting a reply.
pub const MAX_WAITING: usize = 1024;

/// Age after which a request is abandoned.
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// A forwarded query whose reply has not arrived yet.
#[derive(Debug)]
pub struct PendingRequest<S = UdpSocket> {
    pub socket: S,
    /// The original packet read from the interface.
    pub packet: Vec<u8>,
    pub created_at: Instant,
}

impl<S> PendingRequest<S> {
    pub fn new(socket: S, packet: Vec<u8>) -> Self {
        Self::new_at(socket, packet, Instant::now())
    }

    pub fn new_at(socket: S, packet: Vec<u8>, created_at: Instant) -> Self {
        Self {
            socket,
            packet,
            created_at,
        }
    }
}

#[derive(Debug)]
pub struct PendingRequestTable<S = UdpSocket> {
    entries: VecDeque<PendingRequest<S>>,
    max_waiting: usize,
    timeout: Duration,
}

impl<S> Default for PendingRequestTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> PendingRequestTable<S> {
    pub fn new() -> Self {
        Self::with_limits(MAX_WAITING, TIMEOUT)
    }

    /// A table holding at most `max_waiting` entries (at least one).
    pub fn with_limits(max_waiting: usize, timeout: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            max_waiting: max_waiting.max(1),
            timeout,
        }
    }

    /// Add `entry`, evicting to stay within the limits.
    ///
    /// Returns how many entries were evicted.
    pub fn add(&mut self, entry: PendingRequest<S>) -> usize {
        self.add_at(entry, Instant::now())
    }

    /// Same as [`Self::add`], judging ages relative to `now`.
    pub fn add_at(&mut self, entry: PendingRequest<S>, now: Instant) -> usize {
        let mut evicted = 0;

        if self.entries.len() >= self.max_waiting && self.entries.pop_front().is_some() {
            evicted += 1;
        }
        self.entries.push_back(entry);

        // Entries arrive in roughly chronological order, so trimming the
        // expired prefix is enough.
        while self
            .entries
            .front()
            .is_some_and(|oldest| now.saturating_duration_since(oldest.created_at) > self.timeout)
        {
            self.entries.pop_front();
            evicted += 1;
        }

        if evicted > 0 {
            debug!("Evicted {evicted} pending requests, {} left", self.entries.len());
            metrics::counter!(counters::PENDING_EVICTIONS).increment(evicted as u64);
        }
        evicted
    }

    /// Take the entry at `index` out of the table.
    pub fn remove(&mut self, index: usize) -> Option<PendingRequest<S>> {
        self.entries.remove(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingRequest<S>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
