//! OTLP-JSON encoding of ended spans.
//!
//! The body is encoded exactly once into bytes; retries resend the same
//! bytes, only the sent-at header is refreshed per attempt. 64-bit
//! nanosecond timestamps and integer attribute values travel as decimal
//! strings because they exceed JSON's safe integer range.

use crate::attributes::{Array, SpanAttributes, Value};
use crate::resource::Resource;
use crate::time::Clock;
use crate::trace::SpanEnded;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Request header carrying the project api key.
pub const API_KEY_HEADER: &str = "Tracebeam-Api-Key";
/// Request content type, always `application/json`.
pub const CONTENT_TYPE_HEADER: &str = "Content-Type";
/// Request header reporting the `sampled:total` counts at batch formation.
pub const SPAN_SAMPLING_HEADER: &str = "Tracebeam-Span-Sampling";
/// Request header with the RFC 3339 time of this delivery attempt.
pub const SENT_AT_HEADER: &str = "Tracebeam-Sent-At";
/// Response header the endpoint uses to push a new sampling probability.
pub const SAMPLING_PROBABILITY_HEADER: &str = "Tracebeam-Sampling-Probability";

/// An encoded request: opaque JSON bytes plus the headers to attach.
#[derive(Clone, Debug)]
pub struct TracePayload {
    headers: Vec<(&'static str, String)>,
    body: Vec<u8>,
}

impl TracePayload {
    /// All headers to attach to the request, in no particular order.
    pub fn headers(&self) -> &[(&'static str, String)] {
        &self.headers
    }

    /// The value of one header, if present.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| *header == name)
            .map(|(_, value)| value.as_str())
    }

    /// The encoded JSON body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub(crate) fn set_header(&mut self, name: &'static str, value: String) {
        match self.headers.iter_mut().find(|(header, _)| *header == name) {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name, value)),
        }
    }
}

/// Builds [`TracePayload`]s for batches and for the empty probability probe.
pub(crate) struct TracePayloadEncoder {
    api_key: String,
    clock: Arc<dyn Clock>,
}

impl TracePayloadEncoder {
    pub(crate) fn new(api_key: String, clock: Arc<dyn Clock>) -> TracePayloadEncoder {
        TracePayloadEncoder { api_key, clock }
    }

    /// Encode a batch. `sampled`/`total` describe the re-sampling outcome at
    /// batch formation and travel in the span-sampling header.
    pub(crate) fn encode(
        &self,
        spans: &[SpanEnded],
        resource: &Resource,
        sampled: usize,
        total: usize,
    ) -> Result<TracePayload, serde_json::Error> {
        let request = WireRequest {
            resource_spans: vec![WireResourceSpans {
                resource: WireResource {
                    attributes: wire_attributes(resource.attributes()),
                },
                scope_spans: vec![WireScopeSpans {
                    spans: spans.iter().map(|span| self.wire_span(span)).collect(),
                }],
            }],
        };
        let body = serde_json::to_vec(&request)?;

        Ok(TracePayload {
            headers: self.headers(sampled, total),
            body,
        })
    }

    /// The empty payload sent only to obtain a probability response header.
    pub(crate) fn probe(&self) -> TracePayload {
        TracePayload {
            headers: self.headers(0, 0),
            // Fixed and tiny; hand-rolled to avoid an infallible-encode dance.
            body: b"{\"resourceSpans\":[]}".to_vec(),
        }
    }

    /// Refresh the sent-at header immediately before a delivery attempt.
    pub(crate) fn stamp_sent_at(&self, payload: &mut TracePayload) {
        let sent_at = DateTime::<Utc>::from(self.clock.date())
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        payload.set_header(SENT_AT_HEADER, sent_at);
    }

    fn headers(&self, sampled: usize, total: usize) -> Vec<(&'static str, String)> {
        vec![
            (API_KEY_HEADER, self.api_key.clone()),
            (CONTENT_TYPE_HEADER, "application/json".to_owned()),
            (SPAN_SAMPLING_HEADER, format!("{sampled}:{total}")),
        ]
    }

    fn wire_span(&self, span: &SpanEnded) -> WireSpan {
        WireSpan {
            name: span.name.as_str().to_owned(),
            kind: span.kind.as_otlp(),
            span_id: span.span_id.to_string(),
            trace_id: span.trace_id.to_string(),
            parent_span_id: span.parent_span_id.map(|id| id.to_string()),
            start_time_unix_nano: self.clock.to_unix_nanos(span.start_time).to_string(),
            end_time_unix_nano: self.clock.to_unix_nanos(span.end_time).to_string(),
            attributes: wire_attributes(&span.attributes),
            dropped_attributes_count: span.attributes.dropped_count(),
            events: span
                .events
                .iter()
                .map(|event| WireEvent {
                    name: event.name.as_str().to_owned(),
                    time_unix_nano: self.clock.to_unix_nanos(event.time).to_string(),
                })
                .collect(),
        }
    }
}

impl fmt::Debug for TracePayloadEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracePayloadEncoder").finish()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    resource_spans: Vec<WireResourceSpans>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireResourceSpans {
    resource: WireResource,
    scope_spans: Vec<WireScopeSpans>,
}

#[derive(Serialize)]
struct WireResource {
    attributes: Vec<WireKeyValue>,
}

#[derive(Serialize)]
struct WireScopeSpans {
    spans: Vec<WireSpan>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireSpan {
    name: String,
    kind: i32,
    span_id: String,
    trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_span_id: Option<String>,
    start_time_unix_nano: String,
    end_time_unix_nano: String,
    attributes: Vec<WireKeyValue>,
    #[serde(skip_serializing_if = "is_zero")]
    dropped_attributes_count: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    events: Vec<WireEvent>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent {
    name: String,
    time_unix_nano: String,
}

#[derive(Serialize)]
struct WireKeyValue {
    key: String,
    value: WireValue,
}

// Externally tagged, so each variant serializes as {"stringValue": ...} etc.
#[derive(Serialize)]
enum WireValue {
    #[serde(rename = "boolValue")]
    Bool(bool),
    #[serde(rename = "intValue")]
    Int(String),
    #[serde(rename = "doubleValue")]
    Double(f64),
    #[serde(rename = "stringValue")]
    String(String),
    #[serde(rename = "arrayValue")]
    Array(WireArray),
}

#[derive(Serialize)]
struct WireArray {
    values: Vec<WireValue>,
}

fn is_zero(count: &u32) -> bool {
    *count == 0
}

fn wire_attributes(attributes: &SpanAttributes) -> Vec<WireKeyValue> {
    attributes
        .iter()
        .map(|(key, value)| WireKeyValue {
            key: key.as_str().to_owned(),
            value: wire_value(value),
        })
        .collect()
}

fn wire_value(value: &Value) -> WireValue {
    match value {
        Value::Bool(value) => WireValue::Bool(*value),
        Value::I64(value) => WireValue::Int(value.to_string()),
        Value::F64(value) => WireValue::Double(*value),
        Value::String(value) => WireValue::String(value.as_str().to_owned()),
        Value::Array(array) => WireValue::Array(WireArray {
            values: wire_array(array),
        }),
    }
}

fn wire_array(array: &Array) -> Vec<WireValue> {
    match array {
        Array::Bool(values) => values.iter().map(|v| WireValue::Bool(*v)).collect(),
        Array::I64(values) => values.iter().map(|v| WireValue::Int(v.to_string())).collect(),
        Array::F64(values) => values.iter().map(|v| WireValue::Double(*v)).collect(),
        Array::String(values) => values
            .iter()
            .map(|v| WireValue::String(v.as_str().to_owned()))
            .collect(),
    }
}
