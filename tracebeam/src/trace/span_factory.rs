//! Orchestration of the span lifecycle: creation, parent resolution,
//! sampling draws, and hand-off of ended spans to the processor.

use crate::attributes::{SpanAttributeLimits, SpanAttributes, StringValue};
use crate::beam_warn;
use crate::time::{Clock, Time, Timestamp};
use crate::trace::context::{ParentContext, SpanContextStack};
use crate::trace::id_generator::IdGenerator;
use crate::trace::sampler::{sampling_rate_for, Sampler};
use crate::trace::span::{Span, SpanContext, SpanData, SpanEnded, SpanShared};
use crate::trace::{SpanKind, SpanProcessor};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Recorded when a span is explicitly marked (or unmarked) first-class.
pub(crate) const FIRST_CLASS_ATTRIBUTE: &str = "tracebeam.span.first_class";

/// Options for [`SpanFactory::start_span`] and
/// [`Client::start_span_with_options`](crate::Client::start_span_with_options).
#[derive(Clone, Debug)]
pub struct SpanOptions {
    /// How to resolve the parent. Defaults to the current context.
    pub parent: ParentContext,
    /// Explicit start time; defaults to now.
    pub start_time: Option<Time>,
    /// Whether the new span becomes the current context.
    pub make_current: bool,
    /// Marks the span first-class (exempt from sampling rejection) and
    /// records the marker attribute. Unset means plain.
    pub first_class: Option<bool>,
    /// The kind of work the span represents.
    pub kind: SpanKind,
}

impl Default for SpanOptions {
    fn default() -> Self {
        SpanOptions {
            parent: ParentContext::CurrentContext,
            start_time: None,
            make_current: true,
            first_class: None,
            kind: SpanKind::Internal,
        }
    }
}

impl SpanOptions {
    /// Parent the span on `parent` instead of the current context. Accepts a
    /// [`SpanContext`], a [`RemoteParentContext`], or a [`ParentContext`]
    /// directly.
    ///
    /// [`RemoteParentContext`]: crate::trace::RemoteParentContext
    pub fn with_parent(mut self, parent: impl Into<ParentContext>) -> Self {
        self.parent = parent.into();
        self
    }

    /// Backdate the span to an explicit start time.
    pub fn with_start_time(mut self, time: impl Into<Time>) -> Self {
        self.start_time = Some(time.into());
        self
    }

    /// Set the span kind. Defaults to [`SpanKind::Internal`].
    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = kind;
        self
    }

    /// Mark the span first-class or explicitly plain.
    pub fn first_class(mut self, first_class: bool) -> Self {
        self.first_class = Some(first_class);
        self
    }

    /// Do not make the new span the current context.
    pub fn detached(mut self) -> Self {
        self.make_current = false;
        self
    }
}

/// Creates spans and finalizes them.
///
/// One factory per [`Client`](crate::Client); shared by every [`Span`]
/// handle. Nothing here blocks or fails: invalid input is coerced with a
/// warning and sampling discards happen silently on the way out.
pub struct SpanFactory {
    clock: Arc<dyn Clock>,
    id_generator: Arc<dyn IdGenerator>,
    sampler: Arc<Sampler>,
    stack: Arc<SpanContextStack>,
    processor: Arc<dyn SpanProcessor>,
    attribute_limits: SpanAttributeLimits,
    /// False when `enabled_release_stages` excludes the configured stage;
    /// spans then work locally but are never delivered.
    release_stage_enabled: bool,
}

impl SpanFactory {
    pub(crate) fn new(
        clock: Arc<dyn Clock>,
        id_generator: Arc<dyn IdGenerator>,
        sampler: Arc<Sampler>,
        stack: Arc<SpanContextStack>,
        processor: Arc<dyn SpanProcessor>,
        attribute_limits: SpanAttributeLimits,
        release_stage_enabled: bool,
    ) -> SpanFactory {
        SpanFactory {
            clock,
            id_generator,
            sampler,
            stack,
            processor,
            attribute_limits,
            release_stage_enabled,
        }
    }

    pub(crate) fn start_span(
        self: &Arc<Self>,
        name: impl Into<StringValue>,
        options: SpanOptions,
    ) -> Span {
        let name = name.into();
        if name.as_str().is_empty() {
            beam_warn!(
                name: "SpanFactory.EmptyName",
                message = "starting a span with an empty name"
            );
        }

        let (trace_id, parent_span_id) = match &options.parent {
            ParentContext::CurrentContext => match self.stack.current() {
                Some(parent) => (parent.trace_id(), Some(parent.span_id())),
                None => (self.id_generator.new_trace_id(), None),
            },
            ParentContext::NoParent => (self.id_generator.new_trace_id(), None),
            ParentContext::Parent(parent) => (parent.trace_id(), Some(parent.span_id())),
            ParentContext::Remote(remote) => (remote.trace_id, Some(remote.parent_span_id)),
        };
        let span_id = self.id_generator.new_span_id();
        let sampling_rate = sampling_rate_for(trace_id);

        // The admission draw at creation; a rejection here is final even if
        // the probability later rises.
        let probability = self.sampler.probability();
        let start_sampled = probability.admits(sampling_rate);

        let start_time = match options.start_time {
            Some(time) => self.resolve_or_now(time),
            None => self.clock.now(),
        };

        let mut attributes = SpanAttributes::new(self.attribute_limits);
        if let Some(first_class) = options.first_class {
            attributes.set(FIRST_CLASS_ATTRIBUTE, first_class);
        }

        let context = SpanContext {
            shared: Arc::new(SpanShared {
                span_id,
                trace_id,
                parent_span_id,
                sampling_rate,
                open: Mutex::new(Some(SpanData {
                    name,
                    kind: options.kind,
                    start_time,
                    attributes,
                    events: Vec::new(),
                    first_class: options.first_class.unwrap_or(false),
                    start_sampled,
                    sampling_probability: probability,
                })),
            }),
        };

        if options.make_current {
            self.stack.push(context.clone());
        }
        Span::new(context, self.clone())
    }

    /// Finalize a span. Called through [`Span::end`]/[`Span::end_at`]; safe
    /// to call repeatedly, only the first call takes effect.
    pub(crate) fn end_span(&self, context: &SpanContext, time: Option<Time>) {
        let data = match context.shared.open.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(data) = data else {
            beam_warn!(
                name: "SpanFactory.AlreadyEnded",
                message = "attempted to end a span which has already ended"
            );
            return;
        };

        self.stack.pop(context.span_id());

        let end_time = match time {
            Some(time) => self.resolve_or_now(time),
            None => self.clock.now(),
        };

        if !self.release_stage_enabled {
            return;
        }

        // Re-evaluate against the probability in effect now; a drop since
        // creation demotes the span, a rise never resurrects one.
        let probability = data.sampling_probability.min(self.sampler.probability());
        if !data.first_class {
            if !data.start_sampled {
                return;
            }
            if !probability.admits(context.sampling_rate()) {
                return;
            }
        }
        self.processor.add(SpanEnded {
            span_id: context.span_id(),
            trace_id: context.trace_id(),
            parent_span_id: context.parent_span_id(),
            name: data.name,
            kind: data.kind,
            start_time: data.start_time,
            end_time,
            attributes: data.attributes,
            events: data.events,
            first_class: data.first_class,
            sampling_rate: context.sampling_rate(),
            sampling_probability: probability,
        });
    }

    pub(crate) fn current_context(&self) -> Option<SpanContext> {
        self.stack.current()
    }

    pub(crate) fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Resolve a caller-supplied time, falling back to now when the clock
    /// cannot express it (e.g. a wall time predating the process).
    pub(crate) fn resolve_or_now(&self, time: Time) -> Timestamp {
        match self.clock.resolve(time) {
            Some(timestamp) => timestamp,
            None => {
                beam_warn!(
                    name: "SpanFactory.UnusableTime",
                    message = "explicit time predates the clock origin, using now instead"
                );
                self.clock.now()
            }
        }
    }
}

impl fmt::Debug for SpanFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanFactory")
            .field("release_stage_enabled", &self.release_stage_enabled)
            .finish()
    }
}
