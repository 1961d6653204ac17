//! Resolution and persistence of the process-wide sampling probability.
//!
//! The probability can be fixed by configuration or negotiated with the
//! endpoint: learned from a response header, persisted with a timestamp,
//! and refreshed once it is older than the freshness window. Span creation
//! never waits on any of this; only batch formation does, and even that is
//! bounded on cold start.

use crate::delivery::payload::TracePayloadEncoder;
use crate::delivery::{Delivery, DeliveryResponse};
use crate::persistence::{PersistedProbability, Persistence};
use crate::runtime::Runtime;
use crate::time::Clock;
use crate::trace::sampler::{Sampler, SamplingProbability};
use crate::{beam_debug, beam_warn};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

/// A learned probability older than this is refreshed on the next flush.
const PROBABILITY_FRESHNESS: Duration = Duration::from_secs(24 * 60 * 60);

/// Pause between probe attempts.
const PROBE_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Cold-start probe attempts before giving up and batching on the default.
const INITIAL_PROBE_ATTEMPTS: u32 = 5;

/// Owner of the sampling probability, driven by the delivery worker.
#[async_trait]
pub trait ProbabilityManager: Send + fmt::Debug {
    /// Return once a usable probability exists. May read persistence or
    /// negotiate with the endpoint; never loops unbounded.
    async fn ensure_fresh(&mut self);

    /// Apply a server-supplied probability. Out-of-range values are ignored
    /// with a warning.
    async fn set_probability(&mut self, probability: f64);
}

/// Probability pinned by configuration. Ignores the server and never
/// touches persistence or the network.
#[derive(Debug)]
pub struct FixedProbabilityManager {
    sampler: Arc<Sampler>,
}

impl FixedProbabilityManager {
    /// Pin `sampler` to `probability` for the life of the process.
    pub fn new(sampler: Arc<Sampler>, probability: f64) -> FixedProbabilityManager {
        sampler.set_probability(SamplingProbability::new(probability));
        FixedProbabilityManager { sampler }
    }
}

#[async_trait]
impl ProbabilityManager for FixedProbabilityManager {
    async fn ensure_fresh(&mut self) {}

    async fn set_probability(&mut self, probability: f64) {
        beam_debug!(
            name: "Sampling.FixedProbability",
            message = "server probability ignored, sampling probability is fixed by configuration",
            ignored = probability,
            fixed = self.sampler.probability().raw()
        );
    }
}

/// Probability negotiated with the endpoint and persisted across restarts.
///
/// Starts from the in-memory default of 1.0. The first `ensure_fresh` loads
/// the persisted value: a fresh one is used as-is, a stale one is used but
/// refreshed with a probe, and a missing one triggers the bounded cold-start
/// negotiation.
pub struct NegotiatedProbabilityManager<R: Runtime> {
    sampler: Arc<Sampler>,
    persistence: Arc<dyn Persistence>,
    delivery: Arc<dyn Delivery>,
    encoder: TracePayloadEncoder,
    clock: Arc<dyn Clock>,
    runtime: R,
    loaded: bool,
    /// Unix-millisecond stamp of the value in effect; `None` until a value
    /// has been learned or the cold-start negotiation has been exhausted.
    learned_at_millis: Option<u64>,
    /// Stamp of the last probe, successful or not; throttles stale refresh.
    last_probe_millis: Option<u64>,
    probe_attempts: u32,
    probe_delay: Duration,
}

impl<R: Runtime> NegotiatedProbabilityManager<R> {
    /// A manager that probes through `delivery` and records what it learns
    /// in `persistence`.
    pub fn new(
        sampler: Arc<Sampler>,
        persistence: Arc<dyn Persistence>,
        delivery: Arc<dyn Delivery>,
        api_key: String,
        clock: Arc<dyn Clock>,
        runtime: R,
    ) -> NegotiatedProbabilityManager<R> {
        let encoder = TracePayloadEncoder::new(api_key, clock.clone());
        NegotiatedProbabilityManager {
            sampler,
            persistence,
            delivery,
            encoder,
            clock,
            runtime,
            loaded: false,
            learned_at_millis: None,
            last_probe_millis: None,
            probe_attempts: INITIAL_PROBE_ATTEMPTS,
            probe_delay: PROBE_RETRY_DELAY,
        }
    }

    /// Override the cold-start probe policy.
    pub fn with_probe_policy(mut self, attempts: u32, delay: Duration) -> Self {
        self.probe_attempts = attempts;
        self.probe_delay = delay;
        self
    }

    fn now_millis(&self) -> u64 {
        self.clock
            .date()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn is_stale(&self, learned_at_millis: u64) -> bool {
        let age = self.now_millis().saturating_sub(learned_at_millis);
        age > PROBABILITY_FRESHNESS.as_millis() as u64
    }

    async fn load_persisted(&mut self) {
        self.loaded = true;
        let persisted = match self.persistence.load().await {
            Ok(state) => state.and_then(|s| s.sampling_probability),
            Err(error) => {
                beam_warn!(
                    name: "Sampling.LoadFailed",
                    reason = format!("{error}")
                );
                None
            }
        };
        if let Some(PersistedProbability { value, time }) = persisted {
            self.sampler.set_probability(SamplingProbability::new(value));
            self.learned_at_millis = Some(time);
            beam_debug!(
                name: "Sampling.Restored",
                probability = value
            );
        }
    }

    /// One probe round trip. Applies and persists a probability if the
    /// response carries one.
    async fn probe_once(&mut self) -> bool {
        self.last_probe_millis = Some(self.now_millis());
        let mut probe = self.encoder.probe();
        self.encoder.stamp_sent_at(&mut probe);

        match self.delivery.send(&probe).await {
            Ok(DeliveryResponse {
                sampling_probability: Some(probability),
                ..
            }) => {
                self.apply(probability).await;
                true
            }
            Ok(_) => {
                beam_debug!(
                    name: "Sampling.ProbeNoProbability"
                );
                false
            }
            Err(error) => {
                beam_debug!(
                    name: "Sampling.ProbeFailed",
                    reason = format!("{error}")
                );
                false
            }
        }
    }

    /// Cold start: no value was ever learned. Bounded, so a dead endpoint
    /// delays the first batch by at most `attempts × delay`.
    async fn negotiate_initial(&mut self) {
        for attempt in 1..=self.probe_attempts {
            if self.probe_once().await {
                return;
            }
            if attempt < self.probe_attempts {
                self.runtime.delay(self.probe_delay).await;
            }
        }
        beam_warn!(
            name: "Sampling.InitialProbeExhausted",
            message = "proceeding with the default sampling probability",
            attempts = self.probe_attempts
        );
        // Stamp the default as current so batches flow; the normal staleness
        // cycle retries later.
        self.learned_at_millis = Some(self.now_millis());
    }

    /// Stale value: keep using it, probe at most once per retry-delay.
    async fn refresh_stale(&mut self) {
        if let Some(last) = self.last_probe_millis {
            let since = self.now_millis().saturating_sub(last);
            if since < self.probe_delay.as_millis() as u64 {
                return;
            }
        }
        self.probe_once().await;
    }

    async fn apply(&mut self, probability: f64) {
        let now = self.now_millis();
        self.sampler
            .set_probability(SamplingProbability::new(probability));
        self.learned_at_millis = Some(now);

        let mut state = match self.persistence.load().await {
            Ok(Some(state)) => state,
            _ => Default::default(),
        };
        state.sampling_probability = Some(PersistedProbability {
            value: probability,
            time: now,
        });
        if let Err(error) = self.persistence.save(&state).await {
            beam_warn!(
                name: "Sampling.PersistFailed",
                reason = format!("{error}")
            );
        }
    }
}

#[async_trait]
impl<R: Runtime> ProbabilityManager for NegotiatedProbabilityManager<R> {
    async fn ensure_fresh(&mut self) {
        if !self.loaded {
            self.load_persisted().await;
        }
        match self.learned_at_millis {
            None => self.negotiate_initial().await,
            Some(learned) if self.is_stale(learned) => self.refresh_stale().await,
            Some(_) => {}
        }
    }

    async fn set_probability(&mut self, probability: f64) {
        if !probability.is_finite() || !(0.0..=1.0).contains(&probability) {
            beam_warn!(
                name: "Sampling.InvalidProbability",
                ignored = probability
            );
            return;
        }
        self.apply(probability).await;
    }
}

impl<R: Runtime> fmt::Debug for NegotiatedProbabilityManager<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiatedProbabilityManager")
            .field("loaded", &self.loaded)
            .field("learned_at_millis", &self.learned_at_millis)
            .finish()
    }
}
