//! Span creation, identity, sampling, and batching.
//!
//! The types in this module form the span hot path: [`SpanFactory`] creates
//! [`Span`] handles, the [`SpanContextStack`] resolves default parents, the
//! [`Sampler`] decides admission, and ended spans flow into a
//! [`SpanProcessor`] for batching.

pub mod batch;
pub mod context;
pub mod id_generator;
pub mod probability;
pub mod sampler;
pub mod span;
pub mod span_factory;

pub use batch::{BatchProcessor, SpanProcessor};
pub use context::{encode_traceparent, ParentContext, RemoteParentContext, SpanContextStack};
pub use id_generator::{IdGenerator, RandomIdGenerator, SpanId, TraceId};
pub use probability::{
    FixedProbabilityManager, NegotiatedProbabilityManager, ProbabilityManager,
};
pub use sampler::{sampling_rate_for, Sampler, SamplingProbability};
pub use span::{Span, SpanContext, SpanEnded, SpanEvent};
pub use span_factory::{SpanFactory, SpanOptions};

/// The category of operation a span represents.
///
/// Serialized as the OTLP integer (internal = 1 … consumer = 5).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SpanKind {
    /// An operation internal to the application.
    #[default]
    Internal,
    /// Handling a synchronous inbound request.
    Server,
    /// An outbound synchronous request.
    Client,
    /// Creation of a message for asynchronous processing.
    Producer,
    /// Processing of an asynchronously produced message.
    Consumer,
}

impl SpanKind {
    /// The OTLP wire integer for this kind.
    pub fn as_otlp(&self) -> i32 {
        match self {
            SpanKind::Internal => 1,
            SpanKind::Server => 2,
            SpanKind::Client => 3,
            SpanKind::Producer => 4,
            SpanKind::Consumer => 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_kinds_map_to_otlp_integers() {
        assert_eq!(SpanKind::Internal.as_otlp(), 1);
        assert_eq!(SpanKind::Server.as_otlp(), 2);
        assert_eq!(SpanKind::Client.as_otlp(), 3);
        assert_eq!(SpanKind::Producer.as_otlp(), 4);
        assert_eq!(SpanKind::Consumer.as_otlp(), 5);
        assert_eq!(SpanKind::default(), SpanKind::Internal);
    }
}
