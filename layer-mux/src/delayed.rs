//! Queue of requests waiting out a backoff before being resent.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::request::RequestId;

/// Ascending `(request_id, send_at)` list. A request appears at most once.
#[derive(Debug, Default)]
pub(crate) struct DelayedQueue {
    entries: VecDeque<(RequestId, Instant)>,
}

impl DelayedQueue {
    pub(crate) fn new() -> Self { Self::default() }

    /// Schedule `id` for `at`, replacing any earlier schedule for it.
    ///
    /// Returns `true` when the earliest deadline changed, i.e. the timer
    /// must be re-armed.
    pub(crate) fn schedule(&mut self, id: RequestId, at: Instant) -> bool {
        let front = self.next_deadline();
        self.remove(id);
        let pos = self.entries.partition_point(|&(_, t)| t <= at);
        self.entries.insert(pos, (id, at));
        self.next_deadline() != front
    }

    /// Queue `id` right behind `after`, sharing its deadline. Returns `false`
    /// if `after` is not queued.
    pub(crate) fn insert_after(&mut self, id: RequestId, after: RequestId) -> bool {
        if id == after {
            return false;
        }
        self.remove(id);
        let Some(pos) = self.entries.iter().position(|&(r, _)| r == after) else {
            return false;
        };
        let at = self.entries[pos].1;
        self.entries.insert(pos + 1, (id, at));
        true
    }

    pub(crate) fn remove(&mut self, id: RequestId) -> bool {
        match self.entries.iter().position(|&(r, _)| r == id) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn contains(&self, id: RequestId) -> bool {
        self.entries.iter().any(|&(r, _)| r == id)
    }

    /// Time left until `id` is resent.
    pub(crate) fn remaining(&self, id: RequestId, now: Instant) -> Option<Duration> {
        self.entries
            .iter()
            .find(|&&(r, _)| r == id)
            .map(|&(_, at)| at.saturating_duration_since(now))
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.front().map(|&(_, at)| at)
    }

    /// Remove and return every request due at `now`, in queue order.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Vec<RequestId> {
        let mut due = Vec::new();
        while let Some(&(id, at)) = self.entries.front() {
            if at > now {
                break;
            }
            self.entries.pop_front();
            due.push(id);
        }
        due
    }

    pub(crate) fn clear(&mut self) { self.entries.clear() }

    pub(crate) fn len(&self) -> usize { self.entries.len() }
}
