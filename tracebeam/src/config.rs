//! Client configuration.
//!
//! [`Configuration`] is everything the host decides once at startup;
//! [`BatchConfig`] is the batching/delivery tuning, with environment
//! overrides for operators who cannot rebuild the host.

use crate::attributes::SpanAttributeLimits;
use crate::beam_warn;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Maximum number of spans per delivery payload.
pub(crate) const TRACEBEAM_MAX_BATCH_SIZE: &str = "TRACEBEAM_MAX_BATCH_SIZE";
pub(crate) const TRACEBEAM_MAX_BATCH_SIZE_DEFAULT: usize = 100;

/// Milliseconds of batch inactivity before a partial batch is flushed.
pub(crate) const TRACEBEAM_BATCH_INACTIVITY_TIMEOUT_MS: &str =
    "TRACEBEAM_BATCH_INACTIVITY_TIMEOUT_MS";
pub(crate) const TRACEBEAM_BATCH_INACTIVITY_TIMEOUT_MS_DEFAULT: u64 = 30_000;

/// Capacity of the channel feeding the delivery worker, in spans.
pub(crate) const TRACEBEAM_MAX_QUEUE_SIZE: &str = "TRACEBEAM_MAX_QUEUE_SIZE";
pub(crate) const TRACEBEAM_MAX_QUEUE_SIZE_DEFAULT: usize = 2_048;

/// Milliseconds allowed for a single delivery attempt.
pub(crate) const TRACEBEAM_DELIVERY_TIMEOUT_MS: &str = "TRACEBEAM_DELIVERY_TIMEOUT_MS";
pub(crate) const TRACEBEAM_DELIVERY_TIMEOUT_MS_DEFAULT: u64 = 30_000;

/// Maximum number of undelivered payloads held for retry.
pub(crate) const TRACEBEAM_RETRY_QUEUE_MAX_SIZE: &str = "TRACEBEAM_RETRY_QUEUE_MAX_SIZE";
pub(crate) const TRACEBEAM_RETRY_QUEUE_MAX_SIZE_DEFAULT: usize = 10;

/// Milliseconds between periodic retry-queue drain opportunities.
pub(crate) const TRACEBEAM_RETRY_DRAIN_INTERVAL_MS: &str = "TRACEBEAM_RETRY_DRAIN_INTERVAL_MS";
pub(crate) const TRACEBEAM_RETRY_DRAIN_INTERVAL_MS_DEFAULT: u64 = 30_000;

const DEFAULT_ENDPOINT: &str = "https://otlp.tracebeam.com/v1/traces";
const DEFAULT_RELEASE_STAGE: &str = "production";

/// Host-supplied configuration for a [`Client`](crate::Client).
///
/// Only the api key is required. An api key that is not a 32-character
/// lowercase-hex string is used anyway, with a logged warning, so a typo
/// degrades into server-side rejection rather than silent local inactivity.
#[derive(Clone, Debug)]
pub struct Configuration {
    /// Project api key, sent with every payload.
    pub api_key: String,
    /// Trace ingestion endpoint.
    pub endpoint: String,
    /// Deployment stage of this process, e.g. `"production"` or `"staging"`.
    pub release_stage: String,
    /// When set, spans are delivered only if `release_stage` is listed.
    pub enabled_release_stages: Option<Vec<String>>,
    /// Recorded as the `service.name` resource attribute.
    pub service_name: Option<String>,
    /// Recorded as the `service.version` resource attribute.
    pub app_version: Option<String>,
    /// Bounds on per-span attribute storage.
    pub attribute_limits: SpanAttributeLimits,
    /// Pins the sampling probability instead of negotiating it with the
    /// endpoint.
    pub sampling_probability: Option<f64>,
    /// Batching and delivery tuning.
    pub batch: BatchConfig,
}

impl Configuration {
    /// Configuration with the given api key and every other field at its
    /// default.
    pub fn new(api_key: impl Into<String>) -> Configuration {
        Configuration {
            api_key: api_key.into(),
            endpoint: DEFAULT_ENDPOINT.to_owned(),
            release_stage: DEFAULT_RELEASE_STAGE.to_owned(),
            enabled_release_stages: None,
            service_name: None,
            app_version: None,
            attribute_limits: SpanAttributeLimits::default(),
            sampling_probability: None,
            batch: BatchConfig::default(),
        }
    }

    /// Override the ingestion endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Set the release stage. The default is `"production"`.
    pub fn with_release_stage(mut self, release_stage: impl Into<String>) -> Self {
        self.release_stage = release_stage.into();
        self
    }

    /// Restrict delivery to the listed release stages.
    pub fn with_enabled_release_stages(
        mut self,
        stages: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.enabled_release_stages = Some(stages.into_iter().map(Into::into).collect());
        self
    }

    /// Set the `service.name` resource attribute.
    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    /// Set the `service.version` resource attribute.
    pub fn with_app_version(mut self, app_version: impl Into<String>) -> Self {
        self.app_version = Some(app_version.into());
        self
    }

    /// Override the per-span attribute bounds.
    pub fn with_attribute_limits(mut self, limits: SpanAttributeLimits) -> Self {
        self.attribute_limits = limits;
        self
    }

    /// Fix the sampling probability, skipping endpoint negotiation entirely.
    pub fn with_sampling_probability(mut self, probability: f64) -> Self {
        self.sampling_probability = Some(probability);
        self
    }

    /// Override the batching and delivery tuning.
    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    /// Warn about suspicious values. Never rejects; the values are used
    /// as supplied.
    pub(crate) fn log_validation_warnings(&self) {
        if !is_valid_api_key(&self.api_key) {
            beam_warn!(
                name: "Config.SuspiciousApiKey",
                message = "api key should be a 32-character lowercase hex string",
                api_key = self.api_key.as_str()
            );
        }
        if let Some(probability) = self.sampling_probability {
            if !probability.is_finite() || !(0.0..=1.0).contains(&probability) {
                beam_warn!(
                    name: "Config.SuspiciousSamplingProbability",
                    message = "fixed sampling probability outside [0, 1] will be clamped",
                    probability = probability
                );
            }
        }
    }

    pub(crate) fn release_stage_enabled(&self) -> bool {
        match &self.enabled_release_stages {
            Some(stages) => stages.iter().any(|stage| stage == &self.release_stage),
            None => true,
        }
    }
}

fn is_valid_api_key(api_key: &str) -> bool {
    api_key.len() == 32
        && api_key
            .bytes()
            .all(|byte| matches!(byte, b'0'..=b'9' | b'a'..=b'f'))
}

/// Batching and delivery tuning.
///
/// Use [`BatchConfig::builder`] to deviate from the defaults.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchConfig {
    pub(crate) max_batch_size: usize,
    pub(crate) batch_inactivity_timeout: Duration,
    pub(crate) max_queue_size: usize,
    pub(crate) delivery_timeout: Duration,
    pub(crate) retry_queue_max_size: usize,
    pub(crate) retry_drain_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfigBuilder::default().build()
    }
}

impl BatchConfig {
    /// A builder seeded from the defaults and the environment overrides.
    pub fn builder() -> BatchConfigBuilder {
        BatchConfigBuilder::default()
    }
}

/// Builder for [`BatchConfig`].
///
/// `Default` starts from the built-in defaults, then applies the
/// `TRACEBEAM_*` environment overrides. Unparsable override values are
/// ignored with a warning.
#[derive(Debug)]
pub struct BatchConfigBuilder {
    max_batch_size: usize,
    batch_inactivity_timeout: Duration,
    max_queue_size: usize,
    delivery_timeout: Duration,
    retry_queue_max_size: usize,
    retry_drain_interval: Duration,
}

impl Default for BatchConfigBuilder {
    fn default() -> Self {
        BatchConfigBuilder {
            max_batch_size: TRACEBEAM_MAX_BATCH_SIZE_DEFAULT,
            batch_inactivity_timeout: Duration::from_millis(
                TRACEBEAM_BATCH_INACTIVITY_TIMEOUT_MS_DEFAULT,
            ),
            max_queue_size: TRACEBEAM_MAX_QUEUE_SIZE_DEFAULT,
            delivery_timeout: Duration::from_millis(TRACEBEAM_DELIVERY_TIMEOUT_MS_DEFAULT),
            retry_queue_max_size: TRACEBEAM_RETRY_QUEUE_MAX_SIZE_DEFAULT,
            retry_drain_interval: Duration::from_millis(TRACEBEAM_RETRY_DRAIN_INTERVAL_MS_DEFAULT),
        }
        .init_from_env_vars()
    }
}

impl BatchConfigBuilder {
    /// Spans per payload. The default is 100.
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// How long a partial batch may sit idle before it is flushed anyway.
    /// The default is 30 seconds.
    pub fn with_batch_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.batch_inactivity_timeout = timeout;
        self
    }

    /// Capacity of the channel feeding the delivery worker; ended spans are
    /// dropped once it is full. The default is 2048.
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Upper bound on one delivery attempt; a timeout counts as retryable.
    /// The default is 30 seconds.
    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// Undelivered payloads kept for retry; the oldest is evicted at
    /// capacity. The default is 10.
    pub fn with_retry_queue_max_size(mut self, max_size: usize) -> Self {
        self.retry_queue_max_size = max_size;
        self
    }

    /// How often the worker offers the retry queue a drain opportunity when
    /// no new batches arrive. The default is 30 seconds.
    pub fn with_retry_drain_interval(mut self, interval: Duration) -> Self {
        self.retry_drain_interval = interval;
        self
    }

    /// Build, enforcing `max_batch_size <= max_queue_size`.
    pub fn build(self) -> BatchConfig {
        BatchConfig {
            max_batch_size: self.max_batch_size.min(self.max_queue_size),
            batch_inactivity_timeout: self.batch_inactivity_timeout,
            max_queue_size: self.max_queue_size,
            delivery_timeout: self.delivery_timeout,
            retry_queue_max_size: self.retry_queue_max_size,
            retry_drain_interval: self.retry_drain_interval,
        }
    }

    fn init_from_env_vars(mut self) -> Self {
        if let Some(size) = env_override::<usize>(TRACEBEAM_MAX_BATCH_SIZE) {
            self.max_batch_size = size;
        }
        if let Some(millis) = env_override::<u64>(TRACEBEAM_BATCH_INACTIVITY_TIMEOUT_MS) {
            self.batch_inactivity_timeout = Duration::from_millis(millis);
        }
        if let Some(size) = env_override::<usize>(TRACEBEAM_MAX_QUEUE_SIZE) {
            self.max_queue_size = size;
        }
        if let Some(millis) = env_override::<u64>(TRACEBEAM_DELIVERY_TIMEOUT_MS) {
            self.delivery_timeout = Duration::from_millis(millis);
        }
        if let Some(size) = env_override::<usize>(TRACEBEAM_RETRY_QUEUE_MAX_SIZE) {
            self.retry_queue_max_size = size;
        }
        if let Some(millis) = env_override::<u64>(TRACEBEAM_RETRY_DRAIN_INTERVAL_MS) {
            self.retry_drain_interval = Duration::from_millis(millis);
        }
        self
    }
}

fn env_override<T: FromStr>(name: &'static str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match T::from_str(&raw) {
        Ok(value) => Some(value),
        Err(_) => {
            beam_warn!(
                name: "Config.InvalidEnvOverride",
                message = "ignoring unparsable environment override",
                variable = name,
                value = raw.as_str()
            );
            None
        }
    }
}
