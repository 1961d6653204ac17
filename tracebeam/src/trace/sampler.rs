//! Probability sampling.
//!
//! Sampling decisions are deterministic per trace: every trace id maps to a
//! fixed `u32` sampling rate, and a span is admitted when that rate is at or
//! below the current probability scaled into the same `u32` space. All spans
//! of one trace therefore share their fate, regardless of which process ends
//! them.

use crate::trace::TraceId;
use std::sync::atomic::{AtomicU64, Ordering};

/// A sampling probability in both its raw and comparison form.
///
/// `scaled` is `floor(raw × u32::MAX)`, the largest sampling rate the
/// probability admits.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplingProbability {
    raw: f64,
    scaled: u32,
}

impl SamplingProbability {
    /// Build from a raw probability, clamped into `[0, 1]`. Non-finite input
    /// collapses to 1.0; callers validate and warn before constructing.
    pub fn new(raw: f64) -> Self {
        let raw = if raw.is_finite() { raw.clamp(0.0, 1.0) } else { 1.0 };
        SamplingProbability {
            raw,
            scaled: (raw * u32::MAX as f64).floor() as u32,
        }
    }

    /// The probability as configured, in `[0, 1]`.
    pub fn raw(&self) -> f64 {
        self.raw
    }

    /// The probability scaled into sampling-rate space.
    pub fn scaled(&self) -> u32 {
        self.scaled
    }

    /// Whether a span with the given sampling rate is admitted.
    pub fn admits(&self, sampling_rate: u32) -> bool {
        sampling_rate <= self.scaled
    }

    /// The smaller of two probabilities. Used when clamping a span's recorded
    /// probability down to the current one at batch time.
    pub fn min(self, other: SamplingProbability) -> SamplingProbability {
        if other.raw < self.raw {
            other
        } else {
            self
        }
    }
}

/// Derive the sampling rate for a trace: the XOR of the four 32-bit words of
/// the 128-bit trace id. Uniform over `[0, u32::MAX]` for random ids.
pub fn sampling_rate_for(trace_id: TraceId) -> u32 {
    let b = trace_id.to_bytes();
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
        ^ u32::from_be_bytes([b[4], b[5], b[6], b[7]])
        ^ u32::from_be_bytes([b[8], b[9], b[10], b[11]])
        ^ u32::from_be_bytes([b[12], b[13], b[14], b[15]])
}

/// Shared holder of the current sampling probability.
///
/// Read lock-free on every span start and end; written by the probability
/// manager when configuration or a delivery response changes the value.
#[derive(Debug)]
pub struct Sampler {
    // f64 bits of the raw probability; the scaled form is derived on read so
    // the two can never tear.
    probability_bits: AtomicU64,
}

impl Sampler {
    /// A sampler starting at the given probability.
    pub fn new(initial_probability: f64) -> Self {
        Sampler {
            probability_bits: AtomicU64::new(
                SamplingProbability::new(initial_probability).raw().to_bits(),
            ),
        }
    }

    /// The current probability.
    pub fn probability(&self) -> SamplingProbability {
        SamplingProbability::new(f64::from_bits(
            self.probability_bits.load(Ordering::Relaxed),
        ))
    }

    /// Replace the current probability.
    pub fn set_probability(&self, probability: SamplingProbability) {
        self.probability_bits
            .store(probability.raw().to_bits(), Ordering::Relaxed);
    }

    /// Whether a span with the given sampling rate is currently admitted.
    pub fn sample(&self, sampling_rate: u32) -> bool {
        self.probability().admits(sampling_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaling_matches_the_u32_space() {
        assert_eq!(SamplingProbability::new(1.0).scaled(), u32::MAX);
        assert_eq!(SamplingProbability::new(0.0).scaled(), 0);
        assert_eq!(SamplingProbability::new(0.5).scaled(), 0x7fff_ffff);
    }

    #[test]
    fn out_of_range_input_is_clamped() {
        assert_eq!(SamplingProbability::new(2.0).raw(), 1.0);
        assert_eq!(SamplingProbability::new(-1.0).raw(), 0.0);
        assert_eq!(SamplingProbability::new(f64::NAN).raw(), 1.0);
    }

    #[test]
    fn sampling_rate_is_the_xor_of_the_id_words() {
        let trace_id = TraceId::from_hex("00000000000000000000000012345678").unwrap();
        assert_eq!(sampling_rate_for(trace_id), 0x12345678);

        let trace_id = TraceId::from_hex("00000001000000020000000300000004").unwrap();
        assert_eq!(sampling_rate_for(trace_id), 1 ^ 2 ^ 3 ^ 4);

        // Equal words cancel out.
        let trace_id = TraceId::from_hex("ffffffffffffffffffffffffffffffff").unwrap();
        assert_eq!(sampling_rate_for(trace_id), 0);
    }

    #[test]
    fn probability_one_admits_everything() {
        let probability = SamplingProbability::new(1.0);
        assert!(probability.admits(0));
        assert!(probability.admits(u32::MAX));
    }

    #[test]
    fn probability_zero_admits_only_rate_zero() {
        let probability = SamplingProbability::new(0.0);
        assert!(probability.admits(0));
        assert!(!probability.admits(1));
        assert!(!probability.admits(u32::MAX));
    }

    #[test]
    fn sampler_round_trips_updates() {
        let sampler = Sampler::new(1.0);
        assert_eq!(sampler.probability().raw(), 1.0);

        sampler.set_probability(SamplingProbability::new(0.25));
        assert_eq!(sampler.probability().raw(), 0.25);
        assert!(!sampler.sample(u32::MAX));
    }

    #[test]
    fn min_prefers_the_smaller_probability() {
        let half = SamplingProbability::new(0.5);
        let tenth = SamplingProbability::new(0.1);
        assert_eq!(half.min(tenth), tenth);
        assert_eq!(tenth.min(half), tenth);
    }
}
