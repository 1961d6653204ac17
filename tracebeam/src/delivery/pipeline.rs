//! Moves formed batches to the endpoint and owns everything that can go
//! wrong on the way: re-sampling, retries, timeouts, and the persisted
//! device identity.
//!
//! The pipeline is owned by the batch worker task; all methods take
//! `&mut self` and no state here is shared or locked.

use crate::delivery::payload::{TracePayload, TracePayloadEncoder};
use crate::delivery::retry::RetryQueue;
use crate::delivery::{Delivery, DeliveryError, DeliveryResponse, DeliveryState};
use crate::persistence::Persistence;
use crate::resource::Resource;
use crate::runtime::Runtime;
use crate::time::Clock;
use crate::trace::probability::ProbabilityManager;
use crate::trace::sampler::Sampler;
use crate::trace::SpanEnded;
use crate::{beam_debug, beam_error, beam_warn};
use futures_util::future::{self, Either};
use futures_util::pin_mut;
use std::sync::Arc;
use std::time::Duration;

/// A body this large cannot be delivered by any endpoint we talk to, so a
/// transport error on it is permanent.
const MAX_RETRYABLE_BODY_BYTES: usize = 1_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SendOutcome {
    Success,
    Retryable,
    Discard,
}

enum SendFailure {
    Transport(DeliveryError),
    TimedOut,
}

pub(crate) struct DeliveryPipeline<R: Runtime> {
    delivery: Arc<dyn Delivery>,
    persistence: Arc<dyn Persistence>,
    probability_manager: Box<dyn ProbabilityManager>,
    sampler: Arc<Sampler>,
    encoder: TracePayloadEncoder,
    resource: Resource,
    retry_queue: RetryQueue,
    clock: Arc<dyn Clock>,
    runtime: R,
    delivery_timeout: Duration,
    device_resolved: bool,
}

impl<R: Runtime> DeliveryPipeline<R> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        delivery: Arc<dyn Delivery>,
        persistence: Arc<dyn Persistence>,
        probability_manager: Box<dyn ProbabilityManager>,
        sampler: Arc<Sampler>,
        encoder: TracePayloadEncoder,
        resource: Resource,
        retry_queue_capacity: usize,
        delivery_timeout: Duration,
        clock: Arc<dyn Clock>,
        runtime: R,
    ) -> DeliveryPipeline<R> {
        DeliveryPipeline {
            delivery,
            persistence,
            probability_manager,
            sampler,
            encoder,
            resource,
            retry_queue: RetryQueue::new(retry_queue_capacity),
            clock,
            runtime,
            delivery_timeout,
            device_resolved: false,
        }
    }

    /// Deliver one formed batch: freshen the probability, re-sample, give
    /// pending payloads their chance first, then send.
    pub(crate) async fn dispatch(&mut self, batch: Vec<SpanEnded>) {
        if batch.is_empty() {
            return;
        }

        self.probability_manager.ensure_fresh().await;
        self.resolve_device_id().await;

        let total = batch.len();
        let current = self.sampler.probability();
        let spans: Vec<SpanEnded> = batch
            .into_iter()
            .filter_map(|mut span| {
                // A probability drop since the span ended can only demote it.
                span.sampling_probability = span.sampling_probability.min(current);
                (span.first_class || span.sampling_probability.admits(span.sampling_rate))
                    .then_some(span)
            })
            .collect();
        let sampled = spans.len();

        self.drain_retries().await;

        if spans.is_empty() {
            beam_debug!(
                name: "Pipeline.BatchSampledOut",
                total = total
            );
            return;
        }

        let payload = match self.encoder.encode(&spans, &self.resource, sampled, total) {
            Ok(payload) => payload,
            Err(error) => {
                beam_error!(
                    name: "Pipeline.EncodeFailed",
                    spans = sampled,
                    reason = format!("{error}")
                );
                return;
            }
        };
        self.send_once(payload, 0).await;
    }

    /// Retry pending payloads, oldest first. Stops at the first retryable
    /// failure; an unhealthy endpoint is not worth hammering.
    pub(crate) async fn drain_retries(&mut self) {
        let mut remaining = self.retry_queue.len();
        while remaining > 0 {
            remaining -= 1;
            let now = self.clock.now();
            let Some(entry) = self.retry_queue.pop_pending(now) else {
                break;
            };
            if self.send_once(entry.payload, entry.attempts).await == SendOutcome::Retryable {
                break;
            }
        }
    }

    pub(crate) fn pending_retries(&self) -> usize {
        self.retry_queue.len()
    }

    async fn send_once(&mut self, mut payload: TracePayload, prior_attempts: u32) -> SendOutcome {
        self.encoder.stamp_sent_at(&mut payload);
        match self.send_with_timeout(&payload).await {
            Ok(response) => match response.state {
                DeliveryState::Success => {
                    if let Some(probability) = response.sampling_probability {
                        self.probability_manager.set_probability(probability).await;
                    }
                    SendOutcome::Success
                }
                DeliveryState::FailureRetryable => {
                    self.enqueue_retry(payload, prior_attempts);
                    SendOutcome::Retryable
                }
                DeliveryState::FailureDiscard => {
                    beam_warn!(
                        name: "Pipeline.PayloadRejected",
                        attempts = prior_attempts + 1
                    );
                    SendOutcome::Discard
                }
            },
            Err(SendFailure::TimedOut) => {
                beam_debug!(
                    name: "Pipeline.DeliveryTimeout",
                    timeout_ms = self.delivery_timeout.as_millis() as u64
                );
                self.enqueue_retry(payload, prior_attempts);
                SendOutcome::Retryable
            }
            Err(SendFailure::Transport(error)) => {
                if payload.body().len() > MAX_RETRYABLE_BODY_BYTES {
                    beam_warn!(
                        name: "Pipeline.OversizePayloadDiscarded",
                        bytes = payload.body().len(),
                        reason = format!("{error}")
                    );
                    SendOutcome::Discard
                } else {
                    beam_debug!(
                        name: "Pipeline.DeliveryFailed",
                        reason = format!("{error}")
                    );
                    self.enqueue_retry(payload, prior_attempts);
                    SendOutcome::Retryable
                }
            }
        }
    }

    async fn send_with_timeout(
        &mut self,
        payload: &TracePayload,
    ) -> Result<DeliveryResponse, SendFailure> {
        let send = self.delivery.send(payload);
        let timeout = self.runtime.delay(self.delivery_timeout);
        pin_mut!(send);
        match future::select(send, timeout).await {
            Either::Left((result, _)) => result.map_err(SendFailure::Transport),
            Either::Right(_) => Err(SendFailure::TimedOut),
        }
    }

    fn enqueue_retry(&mut self, payload: TracePayload, prior_attempts: u32) {
        let now = self.clock.now();
        self.retry_queue.push(payload, now, prior_attempts + 1);
    }

    /// Load or mint the persisted device id and attach it to the resource.
    /// Runs once; failures leave the payloads without a `device.id`.
    async fn resolve_device_id(&mut self) {
        if self.device_resolved {
            return;
        }
        self.device_resolved = true;

        let mut state = match self.persistence.load().await {
            Ok(Some(state)) => state,
            Ok(None) => Default::default(),
            Err(error) => {
                beam_warn!(
                    name: "Pipeline.DeviceIdLoadFailed",
                    reason = format!("{error}")
                );
                Default::default()
            }
        };

        let device_id = match state.device_id.clone() {
            Some(id) => id,
            None => {
                let id = format!("{:016x}", rand::random::<u64>());
                state.device_id = Some(id.clone());
                if let Err(error) = self.persistence.save(&state).await {
                    beam_warn!(
                        name: "Pipeline.DeviceIdPersistFailed",
                        reason = format!("{error}")
                    );
                }
                id
            }
        };
        self.resource.set_device_id(&device_id);
    }
}

#[cfg(all(test, feature = "rt-tokio"))]
mod tests {
    use super::*;
    use crate::attributes::{SpanAttributeLimits, SpanAttributes};
    use crate::delivery::payload::SPAN_SAMPLING_HEADER;
    use crate::persistence::InMemoryPersistence;
    use crate::runtime::Tokio;
    use crate::testing::{InMemoryDelivery, ManualClock};
    use crate::time::Timestamp;
    use crate::trace::sampler::SamplingProbability;
    use crate::trace::{SpanId, SpanKind, TraceId};
    use async_trait::async_trait;
    use std::fmt;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingManager {
        applied: Arc<Mutex<Vec<f64>>>,
    }

    #[async_trait]
    impl ProbabilityManager for RecordingManager {
        async fn ensure_fresh(&mut self) {}

        async fn set_probability(&mut self, probability: f64) {
            self.applied.lock().unwrap().push(probability);
        }
    }

    impl fmt::Debug for RecordingManager {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("RecordingManager").finish()
        }
    }

    struct Harness {
        pipeline: DeliveryPipeline<Tokio>,
        delivery: Arc<InMemoryDelivery>,
        persistence: Arc<InMemoryPersistence>,
        sampler: Arc<Sampler>,
        applied: Arc<Mutex<Vec<f64>>>,
    }

    fn harness() -> Harness {
        harness_with(Arc::new(InMemoryPersistence::new()), 8)
    }

    fn harness_with(persistence: Arc<InMemoryPersistence>, retry_capacity: usize) -> Harness {
        let delivery = Arc::new(InMemoryDelivery::new());
        let sampler = Arc::new(Sampler::new(1.0));
        let clock: Arc<ManualClock> = Arc::new(ManualClock::new());
        let manager = RecordingManager::default();
        let applied = manager.applied.clone();
        let pipeline = DeliveryPipeline::new(
            delivery.clone(),
            persistence.clone(),
            Box::new(manager),
            sampler.clone(),
            TracePayloadEncoder::new("abcdef0123456789abcdef0123456789".to_owned(), clock.clone()),
            Resource::new("production", None, None),
            retry_capacity,
            Duration::from_secs(5),
            clock,
            Tokio,
        );
        Harness {
            pipeline,
            delivery,
            persistence,
            sampler,
            applied,
        }
    }

    fn span(name: &str) -> SpanEnded {
        SpanEnded {
            span_id: SpanId::from(7u64),
            trace_id: TraceId::from(7u128),
            parent_span_id: None,
            name: name.to_owned().into(),
            kind: SpanKind::Internal,
            start_time: Timestamp::from_nanos(1),
            end_time: Timestamp::from_nanos(2),
            attributes: SpanAttributes::new(SpanAttributeLimits::default()),
            events: Vec::new(),
            first_class: false,
            sampling_rate: 7,
            sampling_probability: SamplingProbability::new(1.0),
        }
    }

    fn body_contains(payload: &TracePayload, needle: &str) -> bool {
        String::from_utf8_lossy(payload.body()).contains(needle)
    }

    #[tokio::test]
    async fn dispatch_sends_one_payload_with_counts() {
        let mut h = harness();
        h.pipeline.dispatch(vec![span("alpha"), span("beta")]).await;

        let requests = h.delivery.requests();
        assert_eq!(requests.len(), 1);
        assert!(body_contains(&requests[0], "alpha"));
        assert_eq!(requests[0].header(SPAN_SAMPLING_HEADER), Some("2:2"));
        assert_eq!(h.pipeline.pending_retries(), 0);
    }

    #[tokio::test]
    async fn empty_batch_never_touches_the_network() {
        let mut h = harness();
        h.pipeline.dispatch(Vec::new()).await;
        assert_eq!(h.delivery.request_count(), 0);
    }

    #[tokio::test]
    async fn response_probability_reaches_the_manager() {
        let mut h = harness();
        h.delivery.enqueue_response(Ok(
            DeliveryResponse::new(DeliveryState::Success).with_probability(0.25)
        ));
        h.pipeline.dispatch(vec![span("alpha")]).await;
        assert_eq!(h.applied.lock().unwrap().as_slice(), &[0.25]);
    }

    #[tokio::test]
    async fn retryable_failure_is_queued_and_drained_before_new_payloads() {
        let mut h = harness();
        h.delivery.enqueue_response(Ok(DeliveryResponse::new(
            DeliveryState::FailureRetryable,
        )));
        h.pipeline.dispatch(vec![span("first")]).await;
        assert_eq!(h.pipeline.pending_retries(), 1);

        h.pipeline.dispatch(vec![span("second")]).await;
        let requests = h.delivery.requests();
        assert_eq!(requests.len(), 3);
        // Attempt order: first (failed), first again, then the new batch.
        assert!(body_contains(&requests[1], "first"));
        assert!(body_contains(&requests[2], "second"));
        assert_eq!(h.pipeline.pending_retries(), 0);
    }

    #[tokio::test]
    async fn discard_failures_are_not_queued() {
        let mut h = harness();
        h.delivery.enqueue_response(Ok(DeliveryResponse::new(
            DeliveryState::FailureDiscard,
        )));
        h.pipeline.dispatch(vec![span("alpha")]).await;
        assert_eq!(h.delivery.request_count(), 1);
        assert_eq!(h.pipeline.pending_retries(), 0);
    }

    #[tokio::test]
    async fn transport_error_is_retryable_for_normal_bodies() {
        let mut h = harness();
        h.delivery.enqueue_response(Err(DeliveryError::Transport(
            "connection reset".to_owned(),
        )));
        h.pipeline.dispatch(vec![span("alpha")]).await;
        assert_eq!(h.pipeline.pending_retries(), 1);
    }

    #[tokio::test]
    async fn oversize_body_discards_on_transport_error() {
        let mut h = harness();
        h.delivery.enqueue_response(Err(DeliveryError::Transport(
            "connection reset".to_owned(),
        )));

        let mut big = span("huge");
        let mut attributes = SpanAttributes::new(SpanAttributeLimits::unlimited());
        let filler = "x".repeat(10_000);
        for i in 0..120 {
            attributes.set(format!("filler.{i}"), filler.clone());
        }
        big.attributes = attributes;

        h.pipeline.dispatch(vec![big]).await;
        assert_eq!(h.pipeline.pending_retries(), 0);
    }

    #[tokio::test]
    async fn stalled_delivery_times_out_as_retryable() {
        #[derive(Debug)]
        struct StalledDelivery;

        #[async_trait]
        impl Delivery for StalledDelivery {
            async fn send(
                &self,
                _payload: &TracePayload,
            ) -> Result<DeliveryResponse, DeliveryError> {
                futures_util::future::pending::<()>().await;
                unreachable!()
            }
        }

        let clock: Arc<ManualClock> = Arc::new(ManualClock::new());
        let manager = RecordingManager::default();
        let mut pipeline = DeliveryPipeline::new(
            Arc::new(StalledDelivery),
            Arc::new(InMemoryPersistence::new()),
            Box::new(manager),
            Arc::new(Sampler::new(1.0)),
            TracePayloadEncoder::new("abcdef0123456789abcdef0123456789".to_owned(), clock.clone()),
            Resource::new("production", None, None),
            8,
            Duration::from_millis(20),
            clock,
            Tokio,
        );

        pipeline.dispatch(vec![span("alpha")]).await;
        assert_eq!(pipeline.pending_retries(), 1);
    }

    #[tokio::test]
    async fn probability_drop_demotes_plain_spans_but_not_first_class() {
        let mut h = harness();
        h.sampler.set_probability(SamplingProbability::new(0.0));

        let mut plain = span("plain");
        plain.sampling_rate = u32::MAX;
        let mut important = span("important");
        important.sampling_rate = u32::MAX;
        important.first_class = true;

        h.pipeline.dispatch(vec![plain, important]).await;
        let requests = h.delivery.requests();
        assert_eq!(requests.len(), 1);
        assert!(!body_contains(&requests[0], "plain"));
        assert!(body_contains(&requests[0], "important"));
        assert_eq!(requests[0].header(SPAN_SAMPLING_HEADER), Some("1:2"));
    }

    #[tokio::test]
    async fn fully_sampled_out_batch_sends_nothing() {
        let mut h = harness();
        h.sampler.set_probability(SamplingProbability::new(0.0));
        let mut plain = span("plain");
        plain.sampling_rate = u32::MAX;

        h.pipeline.dispatch(vec![plain]).await;
        assert_eq!(h.delivery.request_count(), 0);
    }

    #[tokio::test]
    async fn retry_capacity_evicts_oldest_payload() {
        let mut h = harness_with(Arc::new(InMemoryPersistence::new()), 1);
        h.delivery.enqueue_response(Ok(DeliveryResponse::new(
            DeliveryState::FailureRetryable,
        )));
        h.pipeline.dispatch(vec![span("first")]).await;

        // The drain attempt fails again, then the new payload fails too.
        h.delivery.enqueue_response(Ok(DeliveryResponse::new(
            DeliveryState::FailureRetryable,
        )));
        h.delivery.enqueue_response(Ok(DeliveryResponse::new(
            DeliveryState::FailureRetryable,
        )));
        h.pipeline.dispatch(vec![span("second")]).await;

        assert_eq!(h.pipeline.pending_retries(), 1);
        h.pipeline.drain_retries().await;
        let requests = h.delivery.requests();
        assert!(body_contains(&requests[requests.len() - 1], "second"));
    }

    #[tokio::test]
    async fn device_id_is_minted_once_and_reused() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let mut h = harness_with(persistence.clone(), 8);
        h.pipeline.dispatch(vec![span("alpha")]).await;

        let minted = persistence.snapshot().unwrap().device_id.unwrap();
        assert_eq!(minted.len(), 16);
        let requests = h.delivery.requests();
        assert!(body_contains(&requests[0], "device.id"));
        assert!(body_contains(&requests[0], &minted));

        // A later pipeline over the same store reuses the id.
        let mut h2 = harness_with(persistence.clone(), 8);
        h2.pipeline.dispatch(vec![span("beta")]).await;
        assert_eq!(persistence.snapshot().unwrap().device_id.unwrap(), minted);
    }
}
