//! Span handles and their open/ended state.
//!
//! A span's mutable state lives behind a mutex in an `Option`: ending the
//! span takes the state out, which makes `end()` naturally idempotent and
//! leaves a cheap tombstone the context stack can observe.

use crate::attributes::{SpanAttributes, StringValue, Value};
use crate::time::{Time, Timestamp};
use crate::trace::sampler::SamplingProbability;
use crate::trace::span_factory::SpanFactory;
use crate::trace::{SpanId, SpanKind, TraceId};
use std::fmt;
use std::sync::{Arc, Mutex};

/// A timestamped marker recorded on an open span.
#[derive(Clone, Debug, PartialEq)]
pub struct SpanEvent {
    /// Label of the event.
    pub name: StringValue,
    /// When the event happened, relative to the clock origin.
    pub time: Timestamp,
}

/// Mutable state of an open span. Taken out exactly once when the span ends.
#[derive(Debug)]
pub(crate) struct SpanData {
    pub(crate) name: StringValue,
    pub(crate) kind: SpanKind,
    pub(crate) start_time: Timestamp,
    pub(crate) attributes: SpanAttributes,
    pub(crate) events: Vec<SpanEvent>,
    pub(crate) first_class: bool,
    /// Admission decision drawn at creation. A span rejected at start never
    /// reaches the processor, even if the probability later rises.
    pub(crate) start_sampled: bool,
    /// Probability in effect at creation; clamped downward at end and at
    /// batch formation.
    pub(crate) sampling_probability: SamplingProbability,
}

/// Identity plus shared open-state of one span. Shared between the [`Span`]
/// handle, its [`SpanContext`] clones, and the context stack.
pub(crate) struct SpanShared {
    pub(crate) span_id: SpanId,
    pub(crate) trace_id: TraceId,
    pub(crate) parent_span_id: Option<SpanId>,
    pub(crate) sampling_rate: u32,
    pub(crate) open: Mutex<Option<SpanData>>,
}

impl SpanShared {
    pub(crate) fn is_open(&self) -> bool {
        self.open.lock().map(|data| data.is_some()).unwrap_or(false)
    }

    pub(crate) fn start_time(&self) -> Option<Timestamp> {
        self.open
            .lock()
            .ok()
            .and_then(|data| data.as_ref().map(|d| d.start_time))
    }
}

impl fmt::Debug for SpanShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanShared")
            .field("span_id", &self.span_id)
            .field("trace_id", &self.trace_id)
            .field("parent_span_id", &self.parent_span_id)
            .field("open", &self.is_open())
            .finish()
    }
}

/// The identity of a span, cheap to clone and safe to hold after the span
/// ends.
///
/// Used to parent new spans (explicitly via
/// [`ParentContext`](crate::trace::ParentContext) or implicitly through the
/// context stack) and to correlate telemetry with external systems.
#[derive(Clone, Debug)]
pub struct SpanContext {
    pub(crate) shared: Arc<SpanShared>,
}

impl SpanContext {
    /// The span's own id.
    pub fn span_id(&self) -> SpanId {
        self.shared.span_id
    }

    /// The id of the trace this span belongs to.
    pub fn trace_id(&self) -> TraceId {
        self.shared.trace_id
    }

    /// The parent span's id, if the span is not a root.
    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.shared.parent_span_id
    }

    /// The trace's sampling rate, shared by every span of the trace.
    pub fn sampling_rate(&self) -> u32 {
        self.shared.sampling_rate
    }

    /// Whether the span is still open. Ended spans are no longer eligible to
    /// be the current context.
    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }
}

impl PartialEq for SpanContext {
    fn eq(&self, other: &Self) -> bool {
        self.shared.span_id == other.shared.span_id
            && self.shared.trace_id == other.shared.trace_id
    }
}

impl Eq for SpanContext {}

/// Handle to an open span.
///
/// All mutation is a no-op once the span has ended; none of the methods can
/// fail or panic, so instrumentation never disturbs the host application.
#[derive(Debug)]
pub struct Span {
    context: SpanContext,
    factory: Arc<SpanFactory>,
}

impl Span {
    pub(crate) fn new(context: SpanContext, factory: Arc<SpanFactory>) -> Span {
        Span { context, factory }
    }

    /// This span's identity.
    pub fn context(&self) -> &SpanContext {
        &self.context
    }

    /// The span's own id.
    pub fn span_id(&self) -> SpanId {
        self.context.span_id()
    }

    /// The id of the trace this span belongs to.
    pub fn trace_id(&self) -> TraceId {
        self.context.trace_id()
    }

    /// Whether the span has not yet ended.
    pub fn is_open(&self) -> bool {
        self.context.is_open()
    }

    /// Record an attribute. Limits are enforced as described on
    /// [`SpanAttributes`]; ignored after the span ends.
    pub fn set_attribute(&self, key: impl Into<crate::attributes::Key>, value: impl Into<Value>) {
        if let Ok(mut guard) = self.context.shared.open.lock() {
            if let Some(data) = guard.as_mut() {
                data.attributes.set(key, value);
            }
        }
    }

    /// Remove an attribute recorded earlier. Ignored after the span ends.
    pub fn remove_attribute(&self, key: &str) {
        if let Ok(mut guard) = self.context.shared.open.lock() {
            if let Some(data) = guard.as_mut() {
                data.attributes.remove(key);
            }
        }
    }

    /// Replace the span's name. Ignored after the span ends.
    pub fn update_name(&self, name: impl Into<StringValue>) {
        if let Ok(mut guard) = self.context.shared.open.lock() {
            if let Some(data) = guard.as_mut() {
                data.name = name.into();
            }
        }
    }

    /// Record a named event at the current time.
    pub fn add_event(&self, name: impl Into<StringValue>) {
        let time = self.factory.now();
        self.add_event_at(name, Time::Timestamp(time));
    }

    /// Record a named event at an explicit time. An unusable time falls back
    /// to the current time.
    pub fn add_event_at(&self, name: impl Into<StringValue>, time: Time) {
        let time = self.factory.resolve_or_now(time);
        if let Ok(mut guard) = self.context.shared.open.lock() {
            if let Some(data) = guard.as_mut() {
                data.events.push(SpanEvent {
                    name: name.into(),
                    time,
                });
            }
        }
    }

    /// End the span now. Idempotent: only the first call produces a
    /// [`SpanEnded`].
    pub fn end(&self) {
        self.factory.end_span(&self.context, None);
    }

    /// End the span at an explicit time. A time the clock cannot resolve
    /// (e.g. a wall time predating the process) falls back to now with a
    /// logged warning.
    pub fn end_at(&self, time: impl Into<Time>) {
        self.factory.end_span(&self.context, Some(time.into()));
    }
}

/// An immutable ended span, ready for batching and delivery.
#[derive(Clone, Debug)]
pub struct SpanEnded {
    /// The span's own id.
    pub span_id: SpanId,
    /// The id of the trace this span belongs to.
    pub trace_id: TraceId,
    /// The parent span's id, if the span is not a root.
    pub parent_span_id: Option<SpanId>,
    /// Name at the time the span ended.
    pub name: StringValue,
    /// The kind of operation the span represents.
    pub kind: SpanKind,
    /// When the span started, relative to the clock origin.
    pub start_time: Timestamp,
    /// When the span ended, relative to the clock origin.
    pub end_time: Timestamp,
    /// Attributes recorded while the span was open, bounds already applied.
    pub attributes: SpanAttributes,
    /// Events recorded while the span was open, in recording order.
    pub events: Vec<SpanEvent>,
    /// Whether the span is exempt from sampling rejection.
    pub first_class: bool,
    /// Sampling rate derived from the trace id.
    pub sampling_rate: u32,
    /// The probability this span was last evaluated against.
    pub sampling_probability: SamplingProbability,
}
