//! The client: construction, span entry points, and lifecycle.

use crate::attributes::StringValue;
use crate::beam_info;
use crate::config::Configuration;
use crate::delivery::payload::TracePayloadEncoder;
use crate::delivery::pipeline::DeliveryPipeline;
use crate::delivery::Delivery;
use crate::error::{SdkError, SdkResult};
use crate::persistence::{InMemoryPersistence, Persistence};
use crate::resource::Resource;
use crate::runtime::RuntimeChannel;
use crate::time::{Clock, MonotonicClock};
use crate::trace::probability::{
    FixedProbabilityManager, NegotiatedProbabilityManager, ProbabilityManager,
};
use crate::trace::{
    BatchProcessor, IdGenerator, RandomIdGenerator, Sampler, Span, SpanContext, SpanContextStack,
    SpanFactory, SpanOptions, SpanProcessor,
};
use std::sync::Arc;

/// Recorded on every span started through the client; framework
/// integrations layered on top use their own category values.
const SPAN_CATEGORY_ATTRIBUTE: &str = "tracebeam.span.category";

/// Entry point of the SDK. One per monitored process.
///
/// Spans started from the client keep working after it is dropped or shut
/// down; they simply stop being delivered. Dropping the client posts a
/// best-effort shutdown to the delivery worker, flushing whatever is
/// buffered without waiting for the acknowledgement.
///
/// ```no_run
/// # use tracebeam::{Client, Configuration};
/// # use tracebeam::delivery::Delivery;
/// # async fn example(delivery: impl Delivery) -> Result<(), tracebeam::SdkError> {
/// let client = Client::builder(Configuration::new("abcdef0123456789abcdef0123456789"))
///     .with_delivery(delivery)
///     .build(tracebeam::runtime::Tokio)?;
///
/// let span = client.start_span("checkout");
/// span.set_attribute("cart_size", 3i64);
/// span.end();
///
/// client.shutdown().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Client {
    factory: Arc<SpanFactory>,
    processor: Arc<dyn SpanProcessor>,
}

impl Client {
    /// Start assembling a client from the given configuration.
    pub fn builder(configuration: Configuration) -> ClientBuilder {
        ClientBuilder {
            configuration,
            delivery: None,
            persistence: None,
            clock: None,
            id_generator: None,
        }
    }

    /// Start a span parented on the current context. Equivalent to
    /// [`start_span_with_options`](Client::start_span_with_options) with
    /// default options.
    pub fn start_span(&self, name: impl Into<StringValue>) -> Span {
        self.start_span_with_options(name, SpanOptions::default())
    }

    /// Start a span with explicit parenting, timing, kind, or first-class
    /// options.
    pub fn start_span_with_options(
        &self,
        name: impl Into<StringValue>,
        options: SpanOptions,
    ) -> Span {
        let span = self.factory.start_span(name, options);
        span.set_attribute(SPAN_CATEGORY_ATTRIBUTE, "custom");
        span
    }

    /// The context of the innermost open span, if any.
    pub fn current_span_context(&self) -> Option<SpanContext> {
        self.factory.current_context()
    }

    /// Deliver everything currently buffered, including pending retries.
    pub async fn force_flush(&self) -> SdkResult {
        self.processor.force_flush().await
    }

    /// Final flush, then stop the delivery worker. Subsequent calls (and
    /// flushes) return [`SdkError::AlreadyShutdown`].
    pub async fn shutdown(&self) -> SdkResult {
        self.processor.shutdown().await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // Posting the message is enough; nobody waits for the result. A
        // no-op when `shutdown` already ran.
        drop(self.processor.shutdown());
    }
}

/// Assembles a [`Client`] from the configuration and the host-supplied
/// capabilities.
///
/// A [`Delivery`] implementation is required; persistence defaults to
/// [`InMemoryPersistence`], the clock and id generator to the production
/// implementations.
#[derive(Debug)]
pub struct ClientBuilder {
    configuration: Configuration,
    delivery: Option<Arc<dyn Delivery>>,
    persistence: Option<Arc<dyn Persistence>>,
    clock: Option<Arc<dyn Clock>>,
    id_generator: Option<Arc<dyn IdGenerator>>,
}

impl ClientBuilder {
    /// Set the transport that moves payloads to the endpoint. Required.
    pub fn with_delivery(mut self, delivery: impl Delivery) -> Self {
        self.delivery = Some(Arc::new(delivery));
        self
    }

    /// Set the store for state surviving restarts (sampling probability,
    /// device id).
    pub fn with_persistence(mut self, persistence: impl Persistence) -> Self {
        self.persistence = Some(Arc::new(persistence));
        self
    }

    /// Replace the clock, usually with a manual one in tests.
    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Replace the id generator, usually with a deterministic one in tests.
    pub fn with_id_generator(mut self, id_generator: impl IdGenerator + 'static) -> Self {
        self.id_generator = Some(Arc::new(id_generator));
        self
    }

    /// Wire everything together and spawn the delivery worker on `runtime`.
    pub fn build<R: RuntimeChannel>(self, runtime: R) -> Result<Client, SdkError> {
        let configuration = self.configuration;
        configuration.log_validation_warnings();

        let Some(delivery) = self.delivery else {
            return Err(SdkError::Internal(
                "a Delivery implementation is required".to_owned(),
            ));
        };
        let persistence = self
            .persistence
            .unwrap_or_else(|| Arc::new(InMemoryPersistence::new()));
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));
        let id_generator = self
            .id_generator
            .unwrap_or_else(|| Arc::new(RandomIdGenerator::default()));

        let sampler = Arc::new(Sampler::new(1.0));
        let probability_manager: Box<dyn ProbabilityManager> =
            match configuration.sampling_probability {
                Some(probability) => {
                    Box::new(FixedProbabilityManager::new(sampler.clone(), probability))
                }
                None => Box::new(NegotiatedProbabilityManager::new(
                    sampler.clone(),
                    persistence.clone(),
                    delivery.clone(),
                    configuration.api_key.clone(),
                    clock.clone(),
                    runtime.clone(),
                )),
            };

        let resource = Resource::new(
            &configuration.release_stage,
            configuration.service_name.as_deref(),
            configuration.app_version.as_deref(),
        );
        let encoder = TracePayloadEncoder::new(configuration.api_key.clone(), clock.clone());
        let pipeline = DeliveryPipeline::new(
            delivery,
            persistence,
            probability_manager,
            sampler.clone(),
            encoder,
            resource,
            configuration.batch.retry_queue_max_size,
            configuration.batch.delivery_timeout,
            clock.clone(),
            runtime.clone(),
        );
        let processor: Arc<dyn SpanProcessor> = Arc::new(BatchProcessor::new(
            pipeline,
            configuration.batch.max_batch_size,
            configuration.batch.batch_inactivity_timeout,
            configuration.batch.max_queue_size,
            configuration.batch.retry_drain_interval,
            runtime,
        ));

        let release_stage_enabled = configuration.release_stage_enabled();
        if !release_stage_enabled {
            beam_info!(
                name: "Client.ReleaseStageNotEnabled",
                message = "spans will be created but not delivered",
                release_stage = configuration.release_stage.as_str()
            );
        }

        let stack = Arc::new(SpanContextStack::new(clock.clone()));
        let factory = Arc::new(SpanFactory::new(
            clock,
            id_generator,
            sampler,
            stack,
            processor.clone(),
            configuration.attribute_limits,
            release_stage_enabled,
        ));

        Ok(Client { factory, processor })
    }
}

#[cfg(all(test, feature = "rt-tokio"))]
mod tests {
    use super::*;
    use crate::config::BatchConfig;
    use crate::delivery::{DeliveryResponse, DeliveryState};
    use crate::runtime::Tokio;
    use crate::testing::{InMemoryDelivery, ManualClock, SequentialIdGenerator};
    use std::time::Duration;

    fn configuration() -> Configuration {
        // Fixed probability keeps the delivery log free of probe requests;
        // long timers keep flushing under test control.
        Configuration::new("abcdef0123456789abcdef0123456789")
            .with_sampling_probability(1.0)
            .with_batch(
                BatchConfig::builder()
                    .with_max_batch_size(10)
                    .with_batch_inactivity_timeout(Duration::from_secs(120))
                    .with_retry_drain_interval(Duration::from_secs(120))
                    .build(),
            )
    }

    fn client_with(configuration: Configuration, delivery: InMemoryDelivery) -> Client {
        Client::builder(configuration)
            .with_delivery(delivery)
            .with_clock(ManualClock::new())
            .with_id_generator(SequentialIdGenerator::new())
            .build(Tokio)
            .expect("client builds")
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

    fn first_span(body: &[u8]) -> serde_json::Value {
        let body: serde_json::Value = serde_json::from_slice(body).unwrap();
        body["resourceSpans"][0]["scopeSpans"][0]["spans"][0].clone()
    }

    fn attribute<'a>(span: &'a serde_json::Value, key: &str) -> Option<&'a serde_json::Value> {
        span["attributes"]
            .as_array()?
            .iter()
            .find(|kv| kv["key"] == key)
            .map(|kv| &kv["value"])
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn spans_flow_from_start_to_delivery() {
        let delivery = InMemoryDelivery::new();
        let client = client_with(configuration(), delivery.clone());

        let span = client.start_span("checkout");
        span.set_attribute("cart_size", 3i64);
        span.end();
        client.force_flush().await.unwrap();

        let requests = delivery.requests();
        assert_eq!(requests.len(), 1);
        let wire = first_span(requests[0].body());
        assert_eq!(wire["name"], "checkout");
        assert_eq!(
            attribute(&wire, SPAN_CATEGORY_ATTRIBUTE).unwrap()["stringValue"],
            "custom"
        );
        assert_eq!(attribute(&wire, "cart_size").unwrap()["intValue"], "3");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_is_idempotent() {
        let client = client_with(configuration(), InMemoryDelivery::new());

        assert_eq!(client.shutdown().await, Ok(()));
        assert_eq!(client.shutdown().await, Err(SdkError::AlreadyShutdown));
        assert_eq!(client.force_flush().await, Err(SdkError::AlreadyShutdown));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn current_span_context_tracks_open_spans() {
        let client = client_with(configuration(), InMemoryDelivery::new());
        assert!(client.current_span_context().is_none());

        let outer = client.start_span("outer");
        let inner = client.start_span("inner");
        assert_eq!(
            client.current_span_context().map(|c| c.span_id()),
            Some(inner.span_id())
        );

        inner.end();
        assert_eq!(
            client.current_span_context().map(|c| c.span_id()),
            Some(outer.span_id())
        );
        outer.end();
        assert!(client.current_span_context().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disabled_release_stage_delivers_nothing() {
        let delivery = InMemoryDelivery::new();
        let client = client_with(
            configuration()
                .with_release_stage("staging")
                .with_enabled_release_stages(["production"]),
            delivery.clone(),
        );

        client.start_span("invisible").end();
        client.force_flush().await.unwrap();
        assert_eq!(delivery.request_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn negotiated_client_probes_before_the_first_batch() {
        let delivery = InMemoryDelivery::new();
        delivery.enqueue_response(Ok(
            DeliveryResponse::new(DeliveryState::Success).with_probability(1.0)
        ));
        let mut configuration = configuration();
        configuration.sampling_probability = None;
        let client = client_with(configuration, delivery.clone());

        client.start_span("first").end();
        client.force_flush().await.unwrap();

        let requests = delivery.requests();
        assert_eq!(requests.len(), 2);
        let probe: serde_json::Value = serde_json::from_slice(requests[0].body()).unwrap();
        assert_eq!(probe, serde_json::json!({ "resourceSpans": [] }));
        assert_eq!(first_span(requests[1].body())["name"], "first");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn build_without_delivery_fails() {
        let result = Client::builder(configuration()).build(Tokio);
        assert!(matches!(result, Err(SdkError::Internal(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dropping_the_client_flushes_buffered_spans() {
        let delivery = InMemoryDelivery::new();
        {
            let client = client_with(configuration(), delivery.clone());
            client.start_span("buffered").end();
        }

        assert!(wait_until(|| delivery.request_count() == 1).await);
        assert_eq!(first_span(delivery.requests()[0].body())["name"], "buffered");
    }
}
