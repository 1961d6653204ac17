//! Attribute keys, typed values, and the bounded per-span store.
//!
//! Attribute abuse must never break an instrumented application, so every
//! limit violation here recovers locally: strings are truncated with an
//! explicit marker, over-long arrays lose their tail, and keys past the count
//! limit are dropped. Each recovery increments a dropped counter that is
//! reported on the wire as `droppedAttributesCount`.

use crate::beam_warn;
use std::borrow::Cow;
use std::fmt;

/// Default maximum number of attributes per span.
pub const ATTRIBUTE_COUNT_LIMIT_DEFAULT: usize = 128;
/// Hard cap for the configurable attribute count limit.
pub const ATTRIBUTE_COUNT_LIMIT_MAX: usize = 1000;

/// Default maximum length, in characters, of a string attribute value.
pub const ATTRIBUTE_STRING_VALUE_LIMIT_DEFAULT: usize = 1024;
/// Hard cap for the configurable string value limit.
pub const ATTRIBUTE_STRING_VALUE_LIMIT_MAX: usize = 10_000;

/// Default maximum number of elements in an array attribute.
pub const ATTRIBUTE_ARRAY_LENGTH_LIMIT_DEFAULT: usize = 1000;
/// Hard cap for the configurable array length limit.
pub const ATTRIBUTE_ARRAY_LENGTH_LIMIT_MAX: usize = 10_000;

// Keys have a fixed limit; it is not configurable.
const ATTRIBUTE_KEY_LENGTH_LIMIT: usize = 128;

/// The key part of an attribute pair.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(Cow<'static, str>);

impl Key {
    /// Create a new `Key` from a static string with no allocation.
    pub const fn from_static_str(value: &'static str) -> Self {
        Key(Cow::Borrowed(value))
    }

    /// The key as `&str`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&'static str> for Key {
    fn from(value: &'static str) -> Self {
        Key(Cow::Borrowed(value))
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key(Cow::Owned(value))
    }
}

impl From<Cow<'static, str>> for Key {
    fn from(value: Cow<'static, str>) -> Self {
        Key(value)
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.0.into_owned()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wrapper for string-like attribute values.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StringValue(Cow<'static, str>);

impl StringValue {
    /// The value as `&str`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&'static str> for StringValue {
    fn from(value: &'static str) -> Self {
        StringValue(Cow::Borrowed(value))
    }
}

impl From<String> for StringValue {
    fn from(value: String) -> Self {
        StringValue(Cow::Owned(value))
    }
}

impl From<Cow<'static, str>> for StringValue {
    fn from(value: Cow<'static, str>) -> Self {
        StringValue(value)
    }
}

impl From<StringValue> for String {
    fn from(value: StringValue) -> Self {
        value.0.into_owned()
    }
}

impl fmt::Display for StringValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An array attribute containing homogeneous values.
///
/// Mixed element types are unrepresentable by construction; the original
/// duck-typed surface had to validate this at runtime.
#[derive(Clone, Debug, PartialEq)]
pub enum Array {
    /// Array of bools.
    Bool(Vec<bool>),
    /// Array of integers.
    I64(Vec<i64>),
    /// Array of floats.
    F64(Vec<f64>),
    /// Array of strings.
    String(Vec<StringValue>),
}

impl Array {
    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            Array::Bool(values) => values.len(),
            Array::I64(values) => values.len(),
            Array::F64(values) => values.len(),
            Array::String(values) => values.len(),
        }
    }

    /// Whether the array has no elements. Empty arrays are valid attribute
    /// values and serialize as empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

macro_rules! into_array {
    ($(($t:ty, $val:expr),)+) => {
        $(
            impl From<$t> for Array {
                fn from(t: $t) -> Self {
                    $val(t)
                }
            }
        )+
    }
}

into_array!(
    (Vec<bool>, Array::Bool),
    (Vec<i64>, Array::I64),
    (Vec<f64>, Array::F64),
    (Vec<StringValue>, Array::String),
);

/// The value part of an attribute pair.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// bool values.
    Bool(bool),
    /// i64 values.
    I64(i64),
    /// f64 values.
    F64(f64),
    /// String values.
    String(StringValue),
    /// Array of homogeneous values.
    Array(Array),
}

macro_rules! into_value {
    ($(($t:ty, $val:expr),)+) => {
        $(
            impl From<$t> for Value {
                fn from(t: $t) -> Self {
                    $val(t)
                }
            }
        )+
    }
}

into_value!(
    (bool, Value::Bool),
    (i64, Value::I64),
    (f64, Value::F64),
    (StringValue, Value::String),
);

impl From<&'static str> for Value {
    fn from(value: &'static str) -> Self {
        Value::String(value.into())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value.into())
    }
}

impl From<Array> for Value {
    fn from(value: Array) -> Self {
        Value::Array(value)
    }
}

impl From<Vec<bool>> for Value {
    fn from(values: Vec<bool>) -> Self {
        Value::Array(Array::Bool(values))
    }
}

impl From<Vec<i64>> for Value {
    fn from(values: Vec<i64>) -> Self {
        Value::Array(Array::I64(values))
    }
}

impl From<Vec<f64>> for Value {
    fn from(values: Vec<f64>) -> Self {
        Value::Array(Array::F64(values))
    }
}

impl From<Vec<StringValue>> for Value {
    fn from(values: Vec<StringValue>) -> Self {
        Value::Array(Array::String(values))
    }
}

/// Configured bounds for one span's attribute store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpanAttributeLimits {
    /// Maximum number of attributes.
    pub attribute_count_limit: usize,
    /// Maximum length of a string value or string array element, in
    /// characters.
    pub attribute_string_value_limit: usize,
    /// Maximum number of elements in an array value.
    pub attribute_array_length_limit: usize,
}

impl Default for SpanAttributeLimits {
    fn default() -> Self {
        SpanAttributeLimits {
            attribute_count_limit: ATTRIBUTE_COUNT_LIMIT_DEFAULT,
            attribute_string_value_limit: ATTRIBUTE_STRING_VALUE_LIMIT_DEFAULT,
            attribute_array_length_limit: ATTRIBUTE_ARRAY_LENGTH_LIMIT_DEFAULT,
        }
    }
}

impl SpanAttributeLimits {
    /// Limits that never truncate or drop. Used for resource attributes,
    /// whose values are SDK-controlled.
    pub fn unlimited() -> Self {
        SpanAttributeLimits {
            attribute_count_limit: usize::MAX,
            attribute_string_value_limit: usize::MAX,
            attribute_array_length_limit: usize::MAX,
        }
    }
}

/// Bounded, order-preserving attribute store owned by one span.
///
/// Insertion order is kept for deterministic serialization; overwriting an
/// existing key keeps its original position.
#[derive(Clone, Debug)]
pub struct SpanAttributes {
    entries: Vec<(Key, Value)>,
    dropped_count: u32,
    limits: SpanAttributeLimits,
}

impl SpanAttributes {
    /// An empty store enforcing `limits`.
    pub fn new(limits: SpanAttributeLimits) -> Self {
        SpanAttributes {
            entries: Vec::new(),
            dropped_count: 0,
            limits,
        }
    }

    /// Store `value` under `key`, enforcing the configured limits.
    ///
    /// Violations never fail the caller: strings are truncated with a
    /// `" *** {n} CHARS TRUNCATED"` marker, arrays lose excess elements, and
    /// new keys past the count limit (or invalid values) are dropped. Every
    /// truncation or drop increments the dropped counter.
    pub fn set(&mut self, key: impl Into<Key>, value: impl Into<Value>) {
        let key = key.into();
        if key.as_str().is_empty() {
            beam_warn!(name: "Attributes.EmptyKey");
            return;
        }
        if key.as_str().chars().count() > ATTRIBUTE_KEY_LENGTH_LIMIT {
            beam_warn!(
                name: "Attributes.KeyTooLong",
                limit = ATTRIBUTE_KEY_LENGTH_LIMIT
            );
            self.dropped_count += 1;
            return;
        }

        let value = match self.bound_value(value.into(), key.as_str()) {
            Some(value) => value,
            None => return,
        };

        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
            return;
        }

        if self.entries.len() >= self.limits.attribute_count_limit {
            beam_warn!(
                name: "Attributes.CountLimitExceeded",
                key = key.as_str(),
                limit = self.limits.attribute_count_limit
            );
            self.dropped_count += 1;
            return;
        }

        self.entries.push((key, value));
    }

    /// Remove the attribute stored under `key`, if any. The dropped counter
    /// is untouched; it only tracks limit enforcement.
    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| k.as_str() != key);
    }

    /// The stored value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_str() == key)
            .map(|(_, v)| v)
    }

    /// Number of stored attributes. Never exceeds the count limit.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no attributes are stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cumulative count of dropped or truncated attribute data, surfaced at
    /// serialization.
    pub fn dropped_count(&self) -> u32 {
        self.dropped_count
    }

    /// Iterate entries in insertion order. Serialization is pure; all
    /// enforcement happened in `set`.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Value)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    fn bound_value(&mut self, value: Value, key: &str) -> Option<Value> {
        match value {
            Value::F64(value) if !value.is_finite() => {
                beam_warn!(name: "Attributes.NonFiniteNumber", key = key);
                self.dropped_count += 1;
                None
            }
            Value::String(value) => Some(Value::String(self.bound_string(value, key))),
            Value::Array(array) => self.bound_array(array, key).map(Value::Array),
            other => Some(other),
        }
    }

    fn bound_array(&mut self, array: Array, key: &str) -> Option<Array> {
        if let Array::F64(values) = &array {
            if values.iter().any(|value| !value.is_finite()) {
                beam_warn!(name: "Attributes.NonFiniteNumber", key = key);
                self.dropped_count += 1;
                return None;
            }
        }

        let limit = self.limits.attribute_array_length_limit;
        let over = array.len().saturating_sub(limit);
        let array = if over > 0 {
            beam_warn!(
                name: "Attributes.ArrayTruncated",
                key = key,
                dropped_elements = over
            );
            self.dropped_count += over as u32;
            match array {
                Array::Bool(mut values) => Array::Bool({
                    values.truncate(limit);
                    values
                }),
                Array::I64(mut values) => Array::I64({
                    values.truncate(limit);
                    values
                }),
                Array::F64(mut values) => Array::F64({
                    values.truncate(limit);
                    values
                }),
                Array::String(mut values) => Array::String({
                    values.truncate(limit);
                    values
                }),
            }
        } else {
            array
        };

        match array {
            Array::String(values) => Some(Array::String(
                values
                    .into_iter()
                    .map(|value| self.bound_string(value, key))
                    .collect(),
            )),
            other => Some(other),
        }
    }

    fn bound_string(&mut self, value: StringValue, key: &str) -> StringValue {
        let limit = self.limits.attribute_string_value_limit;
        let length = value.as_str().chars().count();
        if length <= limit {
            return value;
        }

        let removed = length - limit;
        let mut truncated: String = value.as_str().chars().take(limit).collect();
        truncated.push_str(&format!(" *** {removed} CHARS TRUNCATED"));
        beam_warn!(
            name: "Attributes.StringTruncated",
            key = key,
            removed_chars = removed
        );
        self.dropped_count += 1;
        StringValue::from(truncated)
    }
}

impl Default for SpanAttributes {
    fn default() -> Self {
        SpanAttributes::new(SpanAttributeLimits::default())
    }
}
