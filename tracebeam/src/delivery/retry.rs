//! Holding area for payloads that failed delivery retryably.

use crate::delivery::payload::TracePayload;
use crate::time::Timestamp;
use crate::{beam_debug, beam_warn};
use std::collections::VecDeque;
use std::time::Duration;

/// Entries pending longer than this are dropped at drain time; the endpoint
/// treats telemetry this old as stale.
const MAX_PAYLOAD_AGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug)]
pub(crate) struct RetryEntry {
    pub(crate) payload: TracePayload,
    pub(crate) enqueue_time: Timestamp,
    pub(crate) attempts: u32,
}

/// FIFO of payloads awaiting redelivery, bounded by entry count.
///
/// At capacity the oldest payload is evicted, whatever it contains: recent
/// telemetry is worth more than old, and first-class spans buy no
/// protection here. Owned by the worker task, so no interior locking.
#[derive(Debug)]
pub(crate) struct RetryQueue {
    entries: VecDeque<RetryEntry>,
    capacity: usize,
}

impl RetryQueue {
    pub(crate) fn new(capacity: usize) -> RetryQueue {
        RetryQueue {
            entries: VecDeque::new(),
            capacity,
        }
    }

    pub(crate) fn push(&mut self, payload: TracePayload, now: Timestamp, attempts: u32) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            if self.entries.pop_front().is_some() {
                beam_warn!(
                    name: "RetryQueue.Evicted",
                    message = "pending payload evicted to admit a newer one",
                    capacity = self.capacity
                );
            }
        }
        self.entries.push_back(RetryEntry {
            payload,
            enqueue_time: now,
            attempts,
        });
    }

    /// Next payload to retry, oldest first. Entries past the age limit are
    /// discarded on the way out.
    pub(crate) fn pop_pending(&mut self, now: Timestamp) -> Option<RetryEntry> {
        while let Some(entry) = self.entries.pop_front() {
            if now.duration_since(entry.enqueue_time) <= MAX_PAYLOAD_AGE {
                return Some(entry);
            }
            beam_debug!(
                name: "RetryQueue.Expired",
                attempts = entry.attempts
            );
        }
        None
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
