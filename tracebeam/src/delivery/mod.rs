//! Delivery of encoded payloads to the collection endpoint.
//!
//! The crate never talks HTTP itself; hosts implement [`Delivery`] over
//! whatever client they already ship and report back a [`DeliveryState`].
//! Everything downstream of that classification (retrying, eviction,
//! probability updates) lives here.

pub mod payload;
pub mod pipeline;
pub mod retry;

use async_trait::async_trait;
use payload::TracePayload;
use std::fmt;
use thiserror::Error;

/// Classification of one delivery attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryState {
    /// The endpoint accepted the payload.
    Success,
    /// Transient failure; the payload is worth retrying later.
    FailureRetryable,
    /// Permanent rejection; retrying cannot change the outcome.
    FailureDiscard,
}

impl DeliveryState {
    /// Classify an HTTP status code.
    ///
    /// 2xx succeeds. 4xx is permanent except 402, 407, 408 and 429, which
    /// indicate conditions that can clear up. Everything else, including
    /// status 0 for "no response", is retryable.
    pub fn from_status(status: u16) -> DeliveryState {
        match status {
            200..=299 => DeliveryState::Success,
            402 | 407 | 408 | 429 => DeliveryState::FailureRetryable,
            400..=499 => DeliveryState::FailureDiscard,
            _ => DeliveryState::FailureRetryable,
        }
    }
}

/// What the endpoint said about one payload.
#[derive(Clone, Debug, PartialEq)]
pub struct DeliveryResponse {
    /// Outcome classification.
    pub state: DeliveryState,
    /// Value of the sampling-probability response header, when present.
    pub sampling_probability: Option<f64>,
}

impl DeliveryResponse {
    /// A response with the given state and no probability header.
    pub fn new(state: DeliveryState) -> DeliveryResponse {
        DeliveryResponse {
            state,
            sampling_probability: None,
        }
    }

    /// Attach the parsed sampling-probability header.
    pub fn with_probability(mut self, probability: f64) -> DeliveryResponse {
        self.sampling_probability = Some(probability);
        self
    }
}

/// The request never produced a classifiable response.
///
/// Errors here are treated as retryable, except when the payload body is so
/// large it can never succeed (see the pipeline's oversize rule).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DeliveryError {
    /// Connection-level failure, described for diagnostics.
    #[error("transport failure: {0}")]
    Transport(String),
    /// Any other failure in the host's delivery implementation.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// Host-supplied capability that moves bytes to the collection endpoint.
///
/// Implementations send `payload.body` with `payload.headers` attached and
/// map the response via [`DeliveryState::from_status`] and
/// [`parse_probability`]. They are called from the SDK's worker task only,
/// never from application threads.
#[async_trait]
pub trait Delivery: Send + Sync + fmt::Debug + 'static {
    /// Deliver one payload and classify the outcome.
    async fn send(&self, payload: &TracePayload) -> Result<DeliveryResponse, DeliveryError>;
}

/// Parse the sampling-probability response header. Values outside `[0, 1]`
/// or non-numeric values are ignored.
pub fn parse_probability(header_value: &str) -> Option<f64> {
    let parsed: f64 = header_value.trim().parse().ok()?;
    (parsed.is_finite() && (0.0..=1.0).contains(&parsed)).then_some(parsed)
}
