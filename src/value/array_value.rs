use crate::value::Value;

/// Ordered list of values held in a document field.
///
/// Membership uses [`Value::equals`], so `1` and `1.0` count as the same
/// element for `array-contains` filters and array transforms.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct ArrayValue {
    values: Vec<Value>,
}

impl ArrayValue {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn contains(&self, needle: &Value) -> bool {
        self.values.iter().any(|candidate| candidate.equals(needle))
    }

    /// Appends each of `additions` that is not already present, keeping the
    /// existing order.
    pub fn union(&self, additions: &[Value]) -> ArrayValue {
        let mut values = self.values.clone();
        for element in additions {
            if !values.iter().any(|candidate| candidate.equals(element)) {
                values.push(element.clone());
            }
        }
        ArrayValue::new(values)
    }

    /// Drops every occurrence of each of `removals`.
    pub fn without(&self, removals: &[Value]) -> ArrayValue {
        let values = self
            .values
            .iter()
            .filter(|candidate| !removals.iter().any(|needle| needle.equals(candidate)))
            .cloned()
            .collect();
        ArrayValue::new(values)
    }
}
