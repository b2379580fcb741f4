/// Typed row values: the driver-level scan result and the coerced form the
/// extractor works with.
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// A column value exactly as the driver handed it over. Character data
/// arrives as `Bytes`; `Text` is for values a driver renders itself, such as
/// timestamps.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bytes(Vec<u8>),
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

/// One scanned result row, in column order.
pub type RawRow = Vec<(String, RawValue)>;

/// A semantically typed column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

/// Column name → typed value for a single result row.
pub type Row = HashMap<String, Value>;

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The value as a metric value, or `None` for null.
    pub fn to_metric(&self) -> Option<MetricValue> {
        match self {
            Value::Null => None,
            Value::Text(s) => Some(MetricValue::Text(s.clone())),
            Value::Int(i) => Some(MetricValue::Int(*i)),
            Value::Float(f) => Some(MetricValue::Float(*f)),
            Value::Bool(b) => Some(MetricValue::Bool(*b)),
        }
    }
}

/// Canonical string form used when a value is spliced into a metric key.
/// Null renders as the empty string.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Text(s) => f.write_str(s),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// The value carried by an emitted metric point.
///
/// Columns are passed through with their coerced type, so a text column
/// referenced by a value key ends up here as `Text`; exporters decide
/// whether they can send it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl MetricValue {
    /// Numeric view of the value; `None` for text and booleans.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Int(i) => Some(*i as f64),
            MetricValue::Float(f) => Some(*f),
            MetricValue::Bool(_) | MetricValue::Text(_) => None,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Int(i) => write!(f, "{i}"),
            MetricValue::Float(v) => write!(f, "{v}"),
            MetricValue::Bool(b) => write!(f, "{b}"),
            MetricValue::Text(s) => f.write_str(s),
        }
    }
}

/// Coerce one scanned row into a typed `Row`.
///
/// Byte strings are decoded as UTF-8 text and then reparsed as an integer,
/// then as a float; the first successful parse wins, otherwise the text is
/// kept. Every other raw value keeps its native type.
pub fn coerce_row(raw: RawRow) -> Row {
    raw.into_iter()
        .map(|(col, value)| (col, coerce_value(value)))
        .collect()
}

fn coerce_value(raw: RawValue) -> Value {
    match raw {
        RawValue::Null => Value::Null,
        RawValue::Bytes(bytes) => reparse(String::from_utf8_lossy(&bytes).into_owned()),
        RawValue::Text(s) => Value::Text(s),
        RawValue::Int(i) => Value::Int(i),
        RawValue::Float(f) => Value::Float(f),
        RawValue::Bool(b) => Value::Bool(b),
    }
}

fn reparse(text: String) -> Value {
    if let Ok(i) = text.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = text.parse::<f64>() {
        return Value::Float(f);
    }
    Value::Text(text)
}
