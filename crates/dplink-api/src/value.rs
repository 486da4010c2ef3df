// ── Datapoint identifiers and raw values ──
//
// Every device property is addressed by a short id and carries one raw
// scalar. Values are tagged once, at ingestion, so downstream code never has
// to guess whether `1` meant `true`.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// A datapoint → raw value map, ordered by [`DpId`].
pub type DpValues = BTreeMap<DpId, DpValue>;

// ── DpId ────────────────────────────────────────────────────────────

/// Protocol key of a datapoint.
///
/// Usually numeric (`"1"`, `"101"`), occasionally not. Ordering is numeric
/// for numeric ids, which sort before any non-numeric id; the latter sort
/// lexically. Profile files may write ids as bare integers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct DpId(String);

impl DpId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric value of the id, if it is a plain unsigned integer.
    pub fn numeric(&self) -> Option<u32> {
        self.0.parse().ok()
    }
}

impl Ord for DpId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for DpId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for DpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DpId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for DpId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u32> for DpId {
    fn from(n: u32) -> Self {
        Self(n.to_string())
    }
}

impl<'de> Deserialize<'de> for DpId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Self(n.to_string()),
            Raw::Text(s) => Self(s),
        })
    }
}

// ── DpValue ─────────────────────────────────────────────────────────

/// A raw datapoint value as reported by (or sent to) a device.
///
/// Numeric equality is lenient across `Int` and `Float` (`Int(1) ==
/// Float(1.0)`), mirroring how devices echo numbers back; `Bool` is never
/// equal to a number.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DpValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl DpValue {
    /// Tag a JSON value.
    ///
    /// `null` yields `None`. Arrays and objects are kept as their JSON text
    /// so that structured payloads survive a round trip through the cache.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        use serde_json::Value;

        match value {
            Value::Null => None,
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float)),
            Value::String(s) => Some(Self::Str(s.clone())),
            Value::Array(_) | Value::Object(_) => Some(Self::Str(value.to_string())),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Value::from(*f),
            Self::Str(s) => serde_json::Value::String(s.clone()),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view: integers widen to floats, strings are not parsed.
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Short name of the variant, for logs and diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
        }
    }
}

impl PartialEq for DpValue {
    #[allow(clippy::float_cmp, clippy::cast_precision_loss, clippy::as_conversions)]
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Int(a), Self::Float(b)) | (Self::Float(b), Self::Int(a)) => *a as f64 == *b,
            (Self::Str(a), Self::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for DpValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<bool> for DpValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for DpValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for DpValue {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for DpValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for DpValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<String> for DpValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

/// Tag every entry of a JSON object, dropping `null`s.
pub fn values_from_json(object: &serde_json::Map<String, serde_json::Value>) -> DpValues {
    object
        .iter()
        .filter_map(|(k, v)| DpValue::from_json(v).map(|value| (DpId::from(k.as_str()), value)))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_ids_sort_numerically_before_text() {
        let mut ids: Vec<DpId> = ["101", "9", "mode", "20", "1", "alpha"]
            .into_iter()
            .map(DpId::from)
            .collect();
        ids.sort();
        let sorted: Vec<&str> = ids.iter().map(DpId::as_str).collect();
        assert_eq!(sorted, ["1", "9", "20", "101", "alpha", "mode"]);
    }

    #[test]
    fn ids_deserialize_from_integers_and_strings() {
        let ids: Vec<DpId> = serde_json::from_value(json!([1, "2", 101])).unwrap();
        assert_eq!(ids, vec![DpId::from(1), DpId::from("2"), DpId::from(101)]);
    }

    #[test]
    fn json_ingestion_keeps_bool_and_int_apart() {
        assert_eq!(DpValue::from_json(&json!(true)), Some(DpValue::Bool(true)));
        assert!(matches!(
            DpValue::from_json(&json!(1)),
            Some(DpValue::Int(1))
        ));
        assert!(matches!(
            DpValue::from_json(&json!(2.5)),
            Some(DpValue::Float(_))
        ));
        assert_eq!(DpValue::from_json(&json!(null)), None);
        assert_eq!(
            DpValue::from_json(&json!({"a": 1})),
            Some(DpValue::Str("{\"a\":1}".into()))
        );
    }

    #[test]
    fn equality_is_lenient_across_numbers_only() {
        assert_eq!(DpValue::Int(3), DpValue::Float(3.0));
        assert_ne!(DpValue::Int(1), DpValue::Bool(true));
        assert_ne!(DpValue::Str("1".into()), DpValue::Int(1));
    }

    #[test]
    fn untagged_deserialize_prefers_int_over_float() {
        let v: DpValue = serde_json::from_str("42").unwrap();
        assert!(matches!(v, DpValue::Int(42)));
        let v: DpValue = serde_json::from_str("4.2").unwrap();
        assert!(matches!(v, DpValue::Float(_)));
    }

    #[test]
    fn values_from_json_drops_nulls() {
        let obj = json!({"1": true, "2": null, "3": "auto"});
        let values = values_from_json(obj.as_object().unwrap());
        assert_eq!(values.len(), 2);
        assert_eq!(values.get(&DpId::from(3)), Some(&DpValue::from("auto")));
    }
}
