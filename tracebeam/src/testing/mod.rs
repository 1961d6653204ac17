//! In-memory doubles for exercising the SDK without clocks, disks, or
//! networks.
//!
//! Used by the crate's own tests and exported to downstream test suites
//! behind the `testing` feature.

use crate::delivery::payload::TracePayload;
use crate::delivery::{Delivery, DeliveryError, DeliveryResponse, DeliveryState};
use crate::error::SdkResult;
use crate::time::{Clock, Timestamp};
use crate::trace::{SpanEnded, SpanProcessor};
use async_trait::async_trait;
use futures_util::future::{self, BoxFuture};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use crate::trace::id_generator::increment::SequentialIdGenerator;

/// Wall-clock origin of [`ManualClock`], matching a freshly constructed
/// production clock started at this fixed instant. Far enough from the epoch
/// that pre-origin wall times exist and can be tested.
const WALL_ORIGIN: Duration = Duration::from_secs(1_700_000_000);

/// A [`Clock`] that only moves when told to. Clones share the same time.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    elapsed_nanos: Arc<AtomicU64>,
}

impl ManualClock {
    /// A clock frozen at its origin.
    pub fn new() -> ManualClock {
        ManualClock::default()
    }

    /// Advance both the monotonic reading and the wall time.
    pub fn advance(&self, duration: Duration) {
        self.elapsed_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_nanos(self.elapsed_nanos.load(Ordering::SeqCst))
    }

    fn date(&self) -> SystemTime {
        UNIX_EPOCH + WALL_ORIGIN + Duration::from_nanos(self.elapsed_nanos.load(Ordering::SeqCst))
    }

    fn to_unix_nanos(&self, timestamp: Timestamp) -> u64 {
        (WALL_ORIGIN.as_nanos() as u64).saturating_add(timestamp.as_nanos())
    }

    fn convert(&self, wall: SystemTime) -> Option<Timestamp> {
        let since_epoch = wall.duration_since(UNIX_EPOCH).ok()?;
        let since_origin = since_epoch.checked_sub(WALL_ORIGIN)?;
        Some(Timestamp::from_nanos(since_origin.as_nanos() as u64))
    }
}

/// A [`Delivery`] that records every payload and replies from a script.
///
/// Unscripted sends succeed without a sampling probability. Clones share
/// the script and the recorded requests.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDelivery {
    script: Arc<Mutex<VecDeque<Result<DeliveryResponse, DeliveryError>>>>,
    requests: Arc<Mutex<Vec<TracePayload>>>,
}

impl InMemoryDelivery {
    /// A delivery with an empty script.
    pub fn new() -> InMemoryDelivery {
        InMemoryDelivery::default()
    }

    /// Queue the response for the next unanswered send.
    pub fn enqueue_response(&self, response: Result<DeliveryResponse, DeliveryError>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(response);
        }
    }

    /// Every payload sent so far, oldest first.
    pub fn requests(&self) -> Vec<TracePayload> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    /// Number of payloads sent so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|requests| requests.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Delivery for InMemoryDelivery {
    async fn send(&self, payload: &TracePayload) -> Result<DeliveryResponse, DeliveryError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(payload.clone());
        }
        let scripted = self.script.lock().ok().and_then(|mut script| script.pop_front());
        scripted.unwrap_or(Ok(DeliveryResponse::new(DeliveryState::Success)))
    }
}

/// A [`SpanProcessor`] that collects ended spans instead of batching them.
/// Clones share the collected spans.
#[derive(Clone, Debug, Default)]
pub struct InMemorySpanProcessor {
    spans: Arc<Mutex<Vec<SpanEnded>>>,
}

impl InMemorySpanProcessor {
    /// A processor that has accepted nothing yet.
    pub fn new() -> InMemorySpanProcessor {
        InMemorySpanProcessor::default()
    }

    /// Every span accepted so far, in arrival order.
    pub fn spans(&self) -> Vec<SpanEnded> {
        self.spans
            .lock()
            .map(|spans| spans.clone())
            .unwrap_or_default()
    }

    /// Number of spans accepted so far.
    pub fn span_count(&self) -> usize {
        self.spans.lock().map(|spans| spans.len()).unwrap_or(0)
    }
}

impl SpanProcessor for InMemorySpanProcessor {
    fn add(&self, span: SpanEnded) {
        if let Ok(mut spans) = self.spans.lock() {
            spans.push(span);
        }
    }

    fn force_flush(&self) -> BoxFuture<'static, SdkResult> {
        Box::pin(future::ready(Ok(())))
    }

    fn shutdown(&self) -> BoxFuture<'static, SdkResult> {
        Box::pin(future::ready(Ok(())))
    }
}
