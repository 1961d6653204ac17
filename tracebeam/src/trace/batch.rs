//! Batching of ended spans ahead of delivery.
//!
//! A [`BatchProcessor`] handle forwards ended spans over a bounded channel
//! to a dedicated worker task. The worker owns the buffer and the delivery
//! pipeline outright, so application threads never contend with network
//! I/O: their worst case is a failed `try_send`, which drops the span and
//! bumps a counter.
//!
//! Batches close on whichever comes first: the buffer reaching
//! `max_batch_size`, or `batch_inactivity_timeout` elapsing since the batch
//! received its first span. The timer is armed once per batch (not sliding)
//! and stamped with a generation so a timer that outlives its batch cannot
//! flush the next one early.

use crate::delivery::pipeline::DeliveryPipeline;
use crate::error::{SdkError, SdkResult};
use crate::runtime::{RuntimeChannel, TrySend, TrySendError};
use crate::trace::SpanEnded;
use crate::{beam_debug, beam_warn};
use futures_channel::oneshot;
use futures_util::future::{self, BoxFuture};
use futures_util::stream::{self, Stream, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Sink for ended spans.
///
/// `add` must be cheap and non-blocking; the async work happens behind the
/// returned futures of `force_flush` and `shutdown` only.
pub trait SpanProcessor: Send + Sync + fmt::Debug + 'static {
    /// Accept one ended span. Never blocks; spans may be dropped under
    /// backpressure.
    fn add(&self, span: SpanEnded);

    /// Deliver everything currently buffered, including pending retries.
    fn force_flush(&self) -> BoxFuture<'static, SdkResult>;

    /// Final flush, then release the worker. Idempotent; later calls return
    /// [`SdkError::AlreadyShutdown`].
    fn shutdown(&self) -> BoxFuture<'static, SdkResult>;
}

#[derive(Debug)]
enum WorkerMessage {
    Span(SpanEnded),
    /// One-shot inactivity timer, stamped with the arming generation.
    FlushTimeout(u64),
    /// Periodic nudge to drain the retry queue.
    RetryTick,
    Flush(Option<oneshot::Sender<SdkResult>>),
    Shutdown(oneshot::Sender<SdkResult>),
}

/// Handle half of the batching stage; cheap to share behind an `Arc`.
pub struct BatchProcessor<R: RuntimeChannel> {
    sender: R::Sender<WorkerMessage>,
    dropped_spans: AtomicUsize,
    is_shutdown: AtomicBool,
}

impl<R: RuntimeChannel> BatchProcessor<R> {
    /// Spawn the worker task on `runtime` and return the handle.
    pub(crate) fn new(
        pipeline: DeliveryPipeline<R>,
        max_batch_size: usize,
        batch_inactivity_timeout: Duration,
        max_queue_size: usize,
        retry_drain_interval: Duration,
        runtime: R,
    ) -> BatchProcessor<R> {
        let (sender, receiver) = runtime.batch_message_channel::<WorkerMessage>(max_queue_size);
        let ticker = runtime
            .interval(retry_drain_interval)
            .skip(1)
            .map(|_| WorkerMessage::RetryTick);

        let worker = Worker {
            buffer: Vec::with_capacity(max_batch_size.min(512)),
            generation: 0,
            max_batch_size,
            inactivity_timeout: batch_inactivity_timeout,
            pipeline,
            timer_sender: sender.clone(),
            runtime: runtime.clone(),
        };
        let messages = Box::pin(stream::select(receiver, ticker));
        runtime.spawn(Box::pin(worker.run(messages)));

        BatchProcessor {
            sender,
            dropped_spans: AtomicUsize::new(0),
            is_shutdown: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub(crate) fn dropped_spans(&self) -> usize {
        self.dropped_spans.load(Ordering::Relaxed)
    }
}

impl<R: RuntimeChannel> SpanProcessor for BatchProcessor<R> {
    fn add(&self, span: SpanEnded) {
        if self.is_shutdown.load(Ordering::Relaxed) {
            beam_debug!(name: "BatchProcessor.AddAfterShutdown");
            return;
        }
        match self.sender.try_send(WorkerMessage::Span(span)) {
            Ok(()) => {}
            Err(TrySendError::ChannelFull) => {
                // Only the first drop is worth a warning; the total is
                // reported at shutdown.
                if self.dropped_spans.fetch_add(1, Ordering::Relaxed) == 0 {
                    beam_warn!(
                        name: "BatchProcessor.QueueFull",
                        message = "dropping ended spans, the delivery worker is not keeping up"
                    );
                }
            }
            Err(error) => {
                beam_debug!(
                    name: "BatchProcessor.SendFailed",
                    reason = format!("{error}")
                );
            }
        }
    }

    fn force_flush(&self) -> BoxFuture<'static, SdkResult> {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return Box::pin(future::ready(Err(SdkError::AlreadyShutdown)));
        }
        let (responder, receiver) = oneshot::channel();
        match self.sender.try_send(WorkerMessage::Flush(Some(responder))) {
            Ok(()) => Box::pin(async move {
                receiver
                    .await
                    .unwrap_or(Err(SdkError::Internal("flush acknowledgement lost".to_owned())))
            }),
            Err(error) => Box::pin(future::ready(Err(SdkError::Internal(error.to_string())))),
        }
    }

    fn shutdown(&self) -> BoxFuture<'static, SdkResult> {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            return Box::pin(future::ready(Err(SdkError::AlreadyShutdown)));
        }
        let dropped = self.dropped_spans.load(Ordering::Relaxed);
        if dropped > 0 {
            beam_warn!(
                name: "BatchProcessor.SpansDropped",
                count = dropped
            );
        }

        let (responder, receiver) = oneshot::channel();
        match self.sender.try_send(WorkerMessage::Shutdown(responder)) {
            Ok(()) => Box::pin(async move {
                receiver
                    .await
                    .unwrap_or(Err(SdkError::Internal("shutdown acknowledgement lost".to_owned())))
            }),
            Err(error) => Box::pin(future::ready(Err(SdkError::Internal(error.to_string())))),
        }
    }
}

impl<R: RuntimeChannel> fmt::Debug for BatchProcessor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("is_shutdown", &self.is_shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

struct Worker<R: RuntimeChannel> {
    buffer: Vec<SpanEnded>,
    /// Bumped on every flush; a `FlushTimeout` carrying an older value is
    /// from a batch that no longer exists.
    generation: u64,
    max_batch_size: usize,
    inactivity_timeout: Duration,
    pipeline: DeliveryPipeline<R>,
    timer_sender: R::Sender<WorkerMessage>,
    runtime: R,
}

impl<R: RuntimeChannel> Worker<R> {
    async fn run<S>(mut self, mut messages: S)
    where
        S: Stream<Item = WorkerMessage> + Unpin,
    {
        while let Some(message) = messages.next().await {
            if !self.process(message).await {
                break;
            }
        }
    }

    async fn process(&mut self, message: WorkerMessage) -> bool {
        match message {
            WorkerMessage::Span(span) => {
                if self.buffer.is_empty() {
                    self.arm_timer();
                }
                self.buffer.push(span);
                if self.buffer.len() >= self.max_batch_size {
                    self.flush().await;
                }
            }
            WorkerMessage::FlushTimeout(generation) => {
                if generation == self.generation {
                    self.flush().await;
                }
            }
            WorkerMessage::RetryTick => {
                if self.pipeline.pending_retries() > 0 {
                    self.pipeline.drain_retries().await;
                }
            }
            WorkerMessage::Flush(responder) => {
                self.flush().await;
                self.pipeline.drain_retries().await;
                if let Some(responder) = responder {
                    let _ = responder.send(Ok(()));
                }
            }
            WorkerMessage::Shutdown(responder) => {
                self.flush().await;
                self.pipeline.drain_retries().await;
                let _ = responder.send(Ok(()));
                return false;
            }
        }
        true
    }

    /// Start the inactivity countdown for the batch that just opened. The
    /// timer message travels through the regular channel, so it observes
    /// the same ordering as spans do.
    fn arm_timer(&self) {
        let generation = self.generation;
        let sender = self.timer_sender.clone();
        let delay = self.runtime.delay(self.inactivity_timeout);
        self.runtime.spawn(Box::pin(async move {
            delay.await;
            // A full channel loses the timeout; the size trigger or the
            // retry ticker will close the batch instead.
            let _ = sender.try_send(WorkerMessage::FlushTimeout(generation));
        }));
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        self.generation = self.generation.wrapping_add(1);
        let batch = self.buffer.split_off(0);
        self.pipeline.dispatch(batch).await;
    }
}

#[cfg(all(test, feature = "rt-tokio"))]
mod tests {
    use super::*;
    use crate::attributes::{SpanAttributeLimits, SpanAttributes};
    use crate::delivery::payload::{TracePayload, TracePayloadEncoder};
    use crate::delivery::{Delivery, DeliveryResponse, DeliveryState};
    use crate::persistence::InMemoryPersistence;
    use crate::resource::Resource;
    use crate::runtime::Tokio;
    use crate::testing::{InMemoryDelivery, ManualClock};
    use crate::time::Timestamp;
    use crate::trace::probability::FixedProbabilityManager;
    use crate::trace::sampler::{Sampler, SamplingProbability};
    use crate::trace::{SpanId, SpanKind, TraceId};
    use std::sync::Arc;

    fn span(name: &str, id: u64) -> SpanEnded {
        SpanEnded {
            span_id: SpanId::from(id),
            trace_id: TraceId::from(id as u128),
            parent_span_id: None,
            name: name.to_owned().into(),
            kind: SpanKind::Internal,
            start_time: Timestamp::from_nanos(1),
            end_time: Timestamp::from_nanos(2),
            attributes: SpanAttributes::new(SpanAttributeLimits::default()),
            events: Vec::new(),
            first_class: false,
            sampling_rate: 0,
            sampling_probability: SamplingProbability::new(1.0),
        }
    }

    struct Options {
        max_batch_size: usize,
        inactivity_timeout: Duration,
        max_queue_size: usize,
        retry_drain_interval: Duration,
        delivery_timeout: Duration,
    }

    impl Default for Options {
        fn default() -> Self {
            Options {
                max_batch_size: 100,
                inactivity_timeout: Duration::from_secs(30),
                max_queue_size: 64,
                retry_drain_interval: Duration::from_secs(60),
                delivery_timeout: Duration::from_secs(5),
            }
        }
    }

    fn processor_with(
        delivery: Arc<dyn Delivery>,
        options: Options,
    ) -> BatchProcessor<Tokio> {
        let sampler = Arc::new(Sampler::new(1.0));
        let clock: Arc<ManualClock> = Arc::new(ManualClock::new());
        let pipeline = DeliveryPipeline::new(
            delivery,
            Arc::new(InMemoryPersistence::new()),
            Box::new(FixedProbabilityManager::new(sampler.clone(), 1.0)),
            sampler,
            TracePayloadEncoder::new("abcdef0123456789abcdef0123456789".to_owned(), clock.clone()),
            Resource::new("production", None, None),
            8,
            options.delivery_timeout,
            clock,
            Tokio,
        );
        BatchProcessor::new(
            pipeline,
            options.max_batch_size,
            options.inactivity_timeout,
            options.max_queue_size,
            options.retry_drain_interval,
            Tokio,
        )
    }

    async fn wait_until(mut predicate: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if predicate() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        predicate()
    }

    fn span_names(payload: &TracePayload) -> Vec<String> {
        let body: serde_json::Value = serde_json::from_slice(payload.body()).unwrap();
        body["resourceSpans"][0]["scopeSpans"][0]["spans"]
            .as_array()
            .unwrap()
            .iter()
            .map(|span| span["name"].as_str().unwrap().to_owned())
            .collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reaching_max_batch_size_flushes_exactly_once() {
        let delivery = Arc::new(InMemoryDelivery::new());
        let processor = processor_with(
            delivery.clone(),
            Options {
                max_batch_size: 3,
                ..Default::default()
            },
        );

        processor.add(span("a", 1));
        processor.add(span("b", 2));
        processor.add(span("c", 3));

        assert!(wait_until(|| delivery.request_count() == 1).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(delivery.request_count(), 1);
        assert_eq!(span_names(&delivery.requests()[0]), vec!["a", "b", "c"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inactivity_timeout_flushes_a_partial_batch() {
        let delivery = Arc::new(InMemoryDelivery::new());
        let processor = processor_with(
            delivery.clone(),
            Options {
                max_batch_size: 100,
                inactivity_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        );

        processor.add(span("only", 1));
        assert!(wait_until(|| delivery.request_count() == 1).await);
        assert_eq!(span_names(&delivery.requests()[0]), vec!["only"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn nothing_flushes_before_either_trigger() {
        let delivery = Arc::new(InMemoryDelivery::new());
        let processor = processor_with(
            delivery.clone(),
            Options {
                max_batch_size: 3,
                ..Default::default()
            },
        );

        processor.add(span("a", 1));
        processor.add(span("b", 2));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(delivery.request_count(), 0);

        processor.force_flush().await.unwrap();
        assert_eq!(delivery.request_count(), 1);
        assert_eq!(span_names(&delivery.requests()[0]), vec!["a", "b"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn flushing_an_empty_buffer_is_silent() {
        let delivery = Arc::new(InMemoryDelivery::new());
        let processor = processor_with(delivery.clone(), Options::default());

        processor.force_flush().await.unwrap();
        assert_eq!(delivery.request_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_flushes_and_seals_the_processor() {
        let delivery = Arc::new(InMemoryDelivery::new());
        let processor = processor_with(delivery.clone(), Options::default());

        processor.add(span("last", 1));
        processor.shutdown().await.unwrap();
        assert_eq!(delivery.request_count(), 1);

        assert_eq!(processor.force_flush().await, Err(SdkError::AlreadyShutdown));
        assert_eq!(processor.shutdown().await, Err(SdkError::AlreadyShutdown));

        processor.add(span("late", 2));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(delivery.request_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retry_ticker_redelivers_failed_payloads() {
        let delivery = Arc::new(InMemoryDelivery::new());
        delivery.enqueue_response(Ok(DeliveryResponse::new(
            DeliveryState::FailureRetryable,
        )));
        let processor = processor_with(
            delivery.clone(),
            Options {
                max_batch_size: 1,
                retry_drain_interval: Duration::from_millis(50),
                ..Default::default()
            },
        );

        processor.add(span("flaky", 1));
        assert!(wait_until(|| delivery.request_count() >= 2).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn overflow_drops_spans_instead_of_blocking() {
        #[derive(Debug)]
        struct StalledDelivery;

        #[async_trait::async_trait]
        impl Delivery for StalledDelivery {
            async fn send(
                &self,
                _payload: &TracePayload,
            ) -> Result<DeliveryResponse, crate::delivery::DeliveryError> {
                futures_util::future::pending::<()>().await;
                unreachable!()
            }
        }

        let processor = processor_with(
            Arc::new(StalledDelivery),
            Options {
                max_batch_size: 1,
                max_queue_size: 4,
                delivery_timeout: Duration::from_secs(30),
                ..Default::default()
            },
        );

        // First span sends the worker into the stalled dispatch.
        processor.add(span("stuck", 0));
        tokio::time::sleep(Duration::from_millis(50)).await;
        for i in 0..8 {
            processor.add(span("overflow", i + 1));
        }

        assert!(processor.dropped_spans() >= 1);
    }
}
