//! Parent resolution: the span context stack and remote parents.

use crate::time::{Clock, Timestamp};
use crate::trace::span::SpanContext;
use crate::trace::{SpanId, TraceId};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Contexts open longer than this stop being eligible as the current span.
/// Long-running operations keep their own handle; the stack only guards
/// against leaks from spans that were never ended.
const CONTEXT_EXPIRY: Duration = Duration::from_secs(60 * 60);

/// How a new span picks its parent.
#[derive(Clone, Debug, Default)]
pub enum ParentContext {
    /// Parent on the context stack's current span, if any.
    #[default]
    CurrentContext,
    /// Start a new root trace even when a current span exists.
    NoParent,
    /// Parent on an explicit local span.
    Parent(SpanContext),
    /// Continue a trace started by another process.
    Remote(RemoteParentContext),
}

impl From<SpanContext> for ParentContext {
    fn from(value: SpanContext) -> Self {
        ParentContext::Parent(value)
    }
}

impl From<RemoteParentContext> for ParentContext {
    fn from(value: RemoteParentContext) -> Self {
        ParentContext::Remote(value)
    }
}

/// Trace continuation received from another process, typically via a W3C
/// `traceparent` header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteParentContext {
    /// The id of the trace being continued.
    pub trace_id: TraceId,
    /// The id of the remote span that becomes the local root's parent.
    pub parent_span_id: SpanId,
}

impl RemoteParentContext {
    /// A remote parent from already-decoded ids.
    pub fn new(trace_id: TraceId, parent_span_id: SpanId) -> RemoteParentContext {
        RemoteParentContext {
            trace_id,
            parent_span_id,
        }
    }

    /// Parse a `traceparent` header value:
    /// `00-{32 lowercase hex}-{16 lowercase hex}-{2 hex flags}`.
    ///
    /// Returns `None` for unsupported versions, malformed fields, or zero
    /// ids; the flags octet is validated but otherwise ignored, as the
    /// upstream decision does not bind local sampling.
    pub fn parse_traceparent(value: &str) -> Option<RemoteParentContext> {
        let mut parts = value.split('-');
        let version = parts.next()?;
        let trace = parts.next()?;
        let span = parts.next()?;
        let flags = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        if version != "00" || trace.len() != 32 || span.len() != 16 || flags.len() != 2 {
            return None;
        }
        if !is_lower_hex(trace) || !is_lower_hex(span) || !is_lower_hex(flags) {
            return None;
        }

        let trace_id = TraceId::from_hex(trace).ok()?;
        let parent_span_id = SpanId::from_hex(span).ok()?;
        if trace_id == TraceId::INVALID || parent_span_id == SpanId::INVALID {
            return None;
        }

        Some(RemoteParentContext {
            trace_id,
            parent_span_id,
        })
    }
}

/// Render the outgoing `traceparent` header value for propagating a trace to
/// a downstream process.
pub fn encode_traceparent(trace_id: TraceId, span_id: SpanId, sampled: bool) -> String {
    let flags = if sampled { "01" } else { "00" };
    format!("00-{trace_id}-{span_id}-{flags}")
}

fn is_lower_hex(value: &str) -> bool {
    value
        .bytes()
        .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Tracks which span is "current" for implicit parent resolution.
///
/// Spans push themselves when started with `make_current` and are popped by
/// id when they end, wherever they sit in the stack, so overlapping async
/// spans that end out of order cannot strand a stale current entry.
#[derive(Debug)]
pub struct SpanContextStack {
    entries: Mutex<Vec<SpanContext>>,
    clock: Arc<dyn Clock>,
}

impl SpanContextStack {
    pub(crate) fn new(clock: Arc<dyn Clock>) -> SpanContextStack {
        SpanContextStack {
            entries: Mutex::new(Vec::new()),
            clock,
        }
    }

    /// Make `context` the current span. Contexts that have already ended are
    /// ignored.
    pub(crate) fn push(&self, context: SpanContext) {
        if !context.is_open() {
            return;
        }
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(context);
        }
    }

    /// Remove the entry for `span_id`, wherever it sits. No effect when the
    /// span was started without `make_current` or was already removed.
    pub(crate) fn pop(&self, span_id: SpanId) {
        if let Ok(mut entries) = self.entries.lock() {
            if let Some(position) = entries.iter().rposition(|c| c.span_id() == span_id) {
                entries.remove(position);
            }
        }
    }

    /// The current span context, if a usable one exists.
    ///
    /// Ended or expired entries found on top are swept before answering, so
    /// the result is always an open, non-expired span.
    pub fn current(&self) -> Option<SpanContext> {
        let now = self.clock.now();
        let Ok(mut entries) = self.entries.lock() else {
            return None;
        };
        while let Some(top) = entries.last() {
            if is_usable(top, now) {
                return Some(top.clone());
            }
            entries.pop();
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn depth(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }
}

fn is_usable(context: &SpanContext, now: Timestamp) -> bool {
    match context.shared.start_time() {
        Some(start) => now.duration_since(start) <= CONTEXT_EXPIRY,
        // Already ended.
        None => false,
    }
}
