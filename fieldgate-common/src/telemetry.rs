use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// One decoded field value as published by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryPoint {
    /// Unix epoch milliseconds when the poll response was decoded.
    pub timestamp: i64,

    /// Device identifier the value was read from.
    pub source: String,

    /// Field protocol, e.g. "modbus_tcp".
    pub protocol: String,

    /// Point tag.
    pub metric: String,

    pub value: TelemetryValue,

    /// Context labels (table flag, function code, unit, ...).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

impl TelemetryPoint {
    pub fn new(
        source: impl Into<String>,
        protocol: impl Into<String>,
        metric: impl Into<String>,
        value: TelemetryValue,
    ) -> Self {
        Self {
            timestamp: current_timestamp_millis(),
            source: source.into(),
            protocol: protocol.into(),
            metric: metric.into(),
            value,
            labels: HashMap::new(),
        }
    }

    /// Override the timestamp, e.g. with the decode time of the whole group.
    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Typed value produced by the point decoder.
///
/// Integers that went through no scaling stay integral so 64-bit counters keep
/// full precision; anything scaled or scripted becomes a float.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TelemetryValue {
    Unsigned(u64),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    /// Hex text for string points.
    Text(String),
    Array(Vec<f64>),
}

impl TelemetryValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TelemetryValue::Unsigned(v) => Some(*v as f64),
            TelemetryValue::Integer(v) => Some(*v as f64),
            TelemetryValue::Float(v) => Some(*v),
            TelemetryValue::Boolean(v) => Some(if *v { 1.0 } else { 0.0 }),
            TelemetryValue::Text(_) | TelemetryValue::Array(_) => None,
        }
    }
}

impl From<u64> for TelemetryValue {
    fn from(v: u64) -> Self {
        TelemetryValue::Unsigned(v)
    }
}

impl From<i64> for TelemetryValue {
    fn from(v: i64) -> Self {
        TelemetryValue::Integer(v)
    }
}

impl From<f64> for TelemetryValue {
    fn from(v: f64) -> Self {
        TelemetryValue::Float(v)
    }
}

impl From<bool> for TelemetryValue {
    fn from(v: bool) -> Self {
        TelemetryValue::Boolean(v)
    }
}

impl From<String> for TelemetryValue {
    fn from(v: String) -> Self {
        TelemetryValue::Text(v)
    }
}

impl From<Vec<f64>> for TelemetryValue {
    fn from(v: Vec<f64>) -> Self {
        TelemetryValue::Array(v)
    }
}

/// Get the current timestamp in milliseconds since Unix epoch.
///
/// Returns 0 if system time is before Unix epoch.
pub fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_point_creation() {
        let point = TelemetryPoint::new(
            "boiler-1",
            "modbus_tcp",
            "supply_temp",
            TelemetryValue::Float(71.5),
        )
        .at(1_700_000_000_000)
        .with_label("unit", "degC");

        assert_eq!(point.source, "boiler-1");
        assert_eq!(point.protocol, "modbus_tcp");
        assert_eq!(point.timestamp, 1_700_000_000_000);
        assert_eq!(point.labels.get("unit"), Some(&"degC".to_string()));
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(TelemetryValue::from(42u64), TelemetryValue::Unsigned(42));
        assert_eq!(TelemetryValue::from(-7i64), TelemetryValue::Integer(-7));
        assert_eq!(TelemetryValue::from(true), TelemetryValue::Boolean(true));
        assert_eq!(
            TelemetryValue::from(vec![1.0, 2.5]),
            TelemetryValue::Array(vec![1.0, 2.5])
        );
    }

    #[test]
    fn test_numeric_view() {
        assert_eq!(TelemetryValue::Integer(-3).as_f64(), Some(-3.0));
        assert_eq!(TelemetryValue::Boolean(true).as_f64(), Some(1.0));
        assert_eq!(TelemetryValue::Text("00ff".into()).as_f64(), None);
    }

    #[test]
    fn test_untagged_json_shape() {
        let json = serde_json::to_string(&TelemetryValue::Array(vec![1.0, 2.0])).unwrap();
        assert_eq!(json, "[1.0,2.0]");

        let value: TelemetryValue = serde_json::from_str("-12").unwrap();
        assert_eq!(value, TelemetryValue::Integer(-12));
    }
}
