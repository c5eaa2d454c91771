use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::error::{invalid_argument, ReplicaResult};
use crate::model::{GeoPoint, Timestamp};
use crate::value::{ArrayValue, BytesValue, MapValue};

#[derive(Clone, Debug, PartialEq)]
pub struct Value {
    kind: ValueKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    String(String),
    Bytes(BytesValue),
    Reference(String),
    GeoPoint(GeoPoint),
    Array(ArrayValue),
    Map(MapValue),
}

impl Value {
    pub fn null() -> Self {
        Self {
            kind: ValueKind::Null,
        }
    }

    pub fn from_bool(value: bool) -> Self {
        Self {
            kind: ValueKind::Boolean(value),
        }
    }

    pub fn from_integer(value: i64) -> Self {
        Self {
            kind: ValueKind::Integer(value),
        }
    }

    pub fn from_double(value: f64) -> Self {
        Self {
            kind: ValueKind::Double(value),
        }
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self {
            kind: ValueKind::Timestamp(value),
        }
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::String(value.into()),
        }
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        Self {
            kind: ValueKind::Bytes(value),
        }
    }

    pub fn from_reference(path: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::Reference(path.into()),
        }
    }

    pub fn from_geo_point(value: GeoPoint) -> Self {
        Self {
            kind: ValueKind::GeoPoint(value),
        }
    }

    pub fn from_array(values: Vec<Value>) -> Self {
        Self {
            kind: ValueKind::Array(ArrayValue::new(values)),
        }
    }

    pub fn from_map(map: BTreeMap<String, Value>) -> Self {
        Self {
            kind: ValueKind::Map(MapValue::new(map)),
        }
    }

    /// Converts plain JSON into a value. Integral numbers become integers,
    /// other numbers doubles.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::null(),
            serde_json::Value::Bool(value) => Self::from_bool(*value),
            serde_json::Value::Number(number) => match number.as_i64() {
                Some(integer) => Self::from_integer(integer),
                None => Self::from_double(number.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(value) => Self::from_string(value.clone()),
            serde_json::Value::Array(values) => {
                Self::from_array(values.iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(object) => Self::from_map(
                object
                    .iter()
                    .map(|(key, value)| (key.clone(), Self::from_json(value)))
                    .collect(),
            ),
        }
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.kind, ValueKind::Double(value) if value.is_nan())
    }

    /// Semantic equality: integers and doubles compare numerically, NaN equals NaN.
    pub fn equals(&self, other: &Value) -> bool {
        if self.is_nan() && other.is_nan() {
            return true;
        }
        compare_values(self, other) == Ordering::Equal
    }

    /// Stable textual rendering, used for query canonical ids and index entries.
    pub fn canonical_id(&self) -> String {
        match &self.kind {
            ValueKind::Null => "null".to_string(),
            ValueKind::Boolean(value) => value.to_string(),
            ValueKind::Integer(value) => value.to_string(),
            ValueKind::Double(value) => {
                if value.fract() == 0.0 && value.is_finite() {
                    format!("{}", *value as i64)
                } else {
                    value.to_string()
                }
            }
            ValueKind::Timestamp(value) => value.canonical_id(),
            ValueKind::String(value) => value.clone(),
            ValueKind::Bytes(value) => value.canonical_id(),
            ValueKind::Reference(value) => value.clone(),
            ValueKind::GeoPoint(value) => value.canonical_id(),
            ValueKind::Array(array) => {
                let parts: Vec<String> = array.values().iter().map(Value::canonical_id).collect();
                format!("[{}]", parts.join(","))
            }
            ValueKind::Map(map) => {
                let parts: Vec<String> = map
                    .fields()
                    .iter()
                    .map(|(key, value)| format!("{key}:{}", value.canonical_id()))
                    .collect();
                format!("{{{}}}", parts.join(","))
            }
        }
    }

    pub fn as_map(&self) -> ReplicaResult<&MapValue> {
        match &self.kind {
            ValueKind::Map(map) => Ok(map),
            _ => Err(invalid_argument("expected a map value")),
        }
    }
}

fn type_order(value: &Value) -> u8 {
    match value.kind() {
        ValueKind::Null => 0,
        ValueKind::Boolean(_) => 1,
        ValueKind::Integer(_) | ValueKind::Double(_) => 2,
        ValueKind::Timestamp(_) => 3,
        ValueKind::String(_) => 4,
        ValueKind::Bytes(_) => 5,
        ValueKind::Reference(_) => 6,
        ValueKind::GeoPoint(_) => 7,
        ValueKind::Array(_) => 8,
        ValueKind::Map(_) => 9,
    }
}

/// Total order across all value types. Values of different types order by
/// type; NaN sorts before every other number.
pub fn compare_values(left: &Value, right: &Value) -> Ordering {
    let by_type = type_order(left).cmp(&type_order(right));
    if by_type != Ordering::Equal {
        return by_type;
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Integer(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Double(b)) => compare_doubles(*a as f64, *b),
        (ValueKind::Double(a), ValueKind::Integer(b)) => compare_doubles(*a, *b as f64),
        (ValueKind::Double(a), ValueKind::Double(b)) => compare_doubles(*a, *b),
        (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a.cmp(b),
        (ValueKind::String(a), ValueKind::String(b)) => a.cmp(b),
        (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a.cmp(b),
        (ValueKind::Reference(a), ValueKind::Reference(b)) => a.split('/').cmp(b.split('/')),
        (ValueKind::GeoPoint(a), ValueKind::GeoPoint(b)) => a.compare(b),
        (ValueKind::Array(a), ValueKind::Array(b)) => {
            for (l, r) in a.values().iter().zip(b.values().iter()) {
                let ordering = compare_values(l, r);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.values().len().cmp(&b.values().len())
        }
        (ValueKind::Map(a), ValueKind::Map(b)) => {
            for ((lk, lv), (rk, rv)) in a.fields().iter().zip(b.fields().iter()) {
                let ordering = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.fields().len().cmp(&b.fields().len())
        }
        _ => Ordering::Equal,
    }
}

fn compare_doubles(left: f64, right: f64) -> Ordering {
    match left.partial_cmp(&right) {
        Some(ordering) => ordering,
        None => match (left.is_nan(), right.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            _ => Ordering::Greater,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn converts_json() {
        let value = Value::from_json(&json!({"name": "a", "count": 2, "ratio": 0.5}));
        let map = value.as_map().unwrap();
        assert_eq!(map.fields().get("name"), Some(&Value::from_string("a")));
        assert_eq!(map.fields().get("count"), Some(&Value::from_integer(2)));
        assert_eq!(map.fields().get("ratio"), Some(&Value::from_double(0.5)));
    }

    #[test]
    fn orders_across_types() {
        assert_eq!(
            compare_values(&Value::null(), &Value::from_bool(false)),
            Ordering::Less
        );
        assert_eq!(
            compare_values(&Value::from_integer(2), &Value::from_double(1.5)),
            Ordering::Greater
        );
        assert_eq!(
            compare_values(&Value::from_double(f64::NAN), &Value::from_integer(-10)),
            Ordering::Less
        );
        assert_eq!(
            compare_values(&Value::from_string("z"), &Value::from_array(vec![])),
            Ordering::Less
        );
    }

    #[test]
    fn numeric_equality_ignores_representation() {
        assert!(Value::from_integer(1).equals(&Value::from_double(1.0)));
        assert!(!Value::from_integer(1).equals(&Value::from_string("1")));
    }
}
