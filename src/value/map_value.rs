use std::collections::BTreeMap;

use crate::model::FieldPath;
use crate::value::{Value, ValueKind};

/// Field data of a document or of a nested map value.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct MapValue {
    fields: BTreeMap<String, Value>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, Value>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, Value> {
        self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Resolves a possibly nested field.
    pub fn get(&self, path: &FieldPath) -> Option<&Value> {
        find_in_map(self, path.segments())
    }

    /// Writes `value` at `path`, creating intermediate maps and replacing
    /// non-map values found along the way.
    pub fn set(&mut self, path: &FieldPath, value: Value) {
        set_at_segments(&mut self.fields, path.segments(), value);
    }

    /// Removes the field at `path`; empty parent maps are left in place.
    pub fn delete(&mut self, path: &FieldPath) {
        remove_at_segments(&mut self.fields, path.segments());
    }
}

fn find_in_map<'a>(map: &'a MapValue, segments: &[String]) -> Option<&'a Value> {
    let (first, rest) = segments.split_first()?;
    let value = map.fields.get(first)?;
    if rest.is_empty() {
        Some(value)
    } else if let ValueKind::Map(child) = value.kind() {
        find_in_map(child, rest)
    } else {
        None
    }
}

fn set_at_segments(fields: &mut BTreeMap<String, Value>, segments: &[String], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };

    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }

    let mut child_fields = match fields.get(first).map(Value::kind) {
        Some(ValueKind::Map(map)) => map.fields().clone(),
        _ => BTreeMap::new(),
    };
    set_at_segments(&mut child_fields, rest, value);
    fields.insert(first.clone(), Value::from_map(child_fields));
}

fn remove_at_segments(fields: &mut BTreeMap<String, Value>, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };

    if rest.is_empty() {
        fields.remove(first);
        return;
    }

    if let Some(ValueKind::Map(child_map)) = fields.get(first).map(Value::kind) {
        let mut child_fields = child_map.fields().clone();
        remove_at_segments(&mut child_fields, rest);
        fields.insert(first.clone(), Value::from_map(child_fields));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    #[test]
    fn nested_set_get_delete() {
        let mut map = MapValue::empty();
        map.set(&path("address.city"), Value::from_string("Turin"));
        assert_eq!(
            map.get(&path("address.city")),
            Some(&Value::from_string("Turin"))
        );

        map.delete(&path("address.city"));
        assert!(map.get(&path("address.city")).is_none());
        assert!(map.get(&path("address")).is_some());
    }

    #[test]
    fn set_replaces_scalar_parent() {
        let mut map = MapValue::empty();
        map.set(&path("a"), Value::from_integer(1));
        map.set(&path("a.b"), Value::from_integer(2));
        assert_eq!(map.get(&path("a.b")), Some(&Value::from_integer(2)));
    }
}
