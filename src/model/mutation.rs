use std::collections::BTreeSet;

use crate::error::{invalid_argument, ReplicaResult};
use crate::model::{Document, DocumentKey, FieldPath, SnapshotVersion, Timestamp};
use crate::value::{ArrayValue, MapValue, Value, ValueKind};

/// Condition that must hold on the previous document for a mutation to apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Precondition {
    #[default]
    None,
    MustExist,
    MustNotExist,
    /// The document must exist at exactly this version.
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_valid_for(&self, document: &Document) -> bool {
        match self {
            Precondition::None => true,
            Precondition::MustExist => document.is_found(),
            Precondition::MustNotExist => !document.is_found(),
            Precondition::UpdateTime(version) => {
                document.is_found() && document.version() == *version
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    Increment(Value),
    ArrayUnion(Vec<Value>),
    ArrayRemove(Vec<Value>),
}

/// A transform resolved against the field's previous value at apply time.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    field: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MutationKind {
    /// Replaces the whole document.
    Set(MapValue),
    /// Writes only the masked fields; masked fields absent from `data` are deleted.
    Patch { data: MapValue, mask: Vec<FieldPath> },
    Delete,
    /// Checks the precondition without changing the document.
    Verify,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    key: DocumentKey,
    kind: MutationKind,
    precondition: Precondition,
    transforms: Vec<FieldTransform>,
}

/// Server outcome of one mutation inside an acknowledged batch.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Vec<Value>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion) -> Self {
        Self {
            version,
            transform_results: Vec::new(),
        }
    }
}

/// Fields touched by the mutations applied so far to a local view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MutatedFields {
    /// A set or delete replaced the document as a whole.
    WholeDocument,
    Fields(BTreeSet<FieldPath>),
}

impl MutatedFields {
    pub fn none() -> Self {
        MutatedFields::Fields(BTreeSet::new())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, MutatedFields::Fields(fields) if fields.is_empty())
    }

    fn union<'a>(self, paths: impl IntoIterator<Item = &'a FieldPath>) -> Self {
        match self {
            MutatedFields::WholeDocument => MutatedFields::WholeDocument,
            MutatedFields::Fields(mut fields) => {
                fields.extend(paths.into_iter().cloned());
                MutatedFields::Fields(fields)
            }
        }
    }
}

impl Mutation {
    pub fn set(key: DocumentKey, data: MapValue) -> Self {
        Self::new(key, MutationKind::Set(data), Precondition::None)
    }

    /// Patch writing every leaf field of `data`. Requires the document to exist.
    pub fn patch(key: DocumentKey, data: MapValue) -> Self {
        let mask = leaf_field_paths(&data);
        Self::patch_with_mask(key, data, mask)
    }

    pub fn patch_with_mask(key: DocumentKey, data: MapValue, mask: Vec<FieldPath>) -> Self {
        Self::new(
            key,
            MutationKind::Patch { data, mask },
            Precondition::MustExist,
        )
    }

    pub fn delete(key: DocumentKey) -> Self {
        Self::new(key, MutationKind::Delete, Precondition::None)
    }

    pub fn verify(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self::new(key, MutationKind::Verify, Precondition::UpdateTime(version))
    }

    fn new(key: DocumentKey, kind: MutationKind, precondition: Precondition) -> Self {
        Self {
            key,
            kind,
            precondition,
            transforms: Vec::new(),
        }
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    pub fn with_transform(mut self, field: FieldPath, operation: TransformOperation) -> Self {
        self.transforms.push(FieldTransform::new(field, operation));
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn kind(&self) -> &MutationKind {
        &self.kind
    }

    pub fn precondition(&self) -> Precondition {
        self.precondition
    }

    pub fn transforms(&self) -> &[FieldTransform] {
        &self.transforms
    }

    /// Rejects mutations that could never apply, before they reach the queue.
    pub fn validate(&self) -> ReplicaResult<()> {
        if !self.transforms.is_empty()
            && matches!(self.kind, MutationKind::Delete | MutationKind::Verify)
        {
            return Err(invalid_argument(format!(
                "Field transforms are not allowed on delete or verify of {}",
                self.key
            )));
        }
        for transform in &self.transforms {
            if let TransformOperation::Increment(operand) = transform.operation() {
                if !operand.is_number() {
                    return Err(invalid_argument(format!(
                        "Increment of '{}' requires a numeric operand",
                        transform.field()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Applies this mutation to the latency-compensated view of `document`.
    ///
    /// Returns the union of `previous` with the fields this mutation wrote.
    /// A failed precondition leaves both the document and the mask untouched.
    pub fn apply_to_local_view(
        &self,
        document: &mut Document,
        previous: MutatedFields,
        local_write_time: Timestamp,
    ) -> ReplicaResult<MutatedFields> {
        if !self.precondition.is_valid_for(document) {
            return Ok(previous);
        }

        match &self.kind {
            MutationKind::Set(data) => {
                let transform_results = self.local_transform_results(document, local_write_time)?;
                let mut new_data = data.clone();
                self.write_transform_results(&mut new_data, transform_results);
                document.convert_to_found(document.version(), new_data);
                document.set_has_local_mutations();
                Ok(MutatedFields::WholeDocument)
            }
            MutationKind::Patch { data, mask } => {
                let transform_results = self.local_transform_results(document, local_write_time)?;
                let mut new_data = document.data().cloned().unwrap_or_default();
                apply_patch(&mut new_data, data, mask);
                self.write_transform_results(&mut new_data, transform_results);
                document.convert_to_found(document.version(), new_data);
                document.set_has_local_mutations();
                Ok(previous
                    .union(mask.iter())
                    .union(self.transforms.iter().map(FieldTransform::field)))
            }
            MutationKind::Delete => {
                document.convert_to_missing(document.version());
                document.set_has_local_mutations();
                Ok(MutatedFields::WholeDocument)
            }
            MutationKind::Verify => Ok(previous),
        }
    }

    /// Applies the server-acknowledged outcome of this mutation to the
    /// remote document.
    pub fn apply_to_remote_document(
        &self,
        document: &mut Document,
        result: &MutationResult,
    ) -> ReplicaResult<()> {
        match &self.kind {
            MutationKind::Set(data) => {
                let transform_results = self.server_transform_results(document, result)?;
                let mut new_data = data.clone();
                self.write_transform_results(&mut new_data, transform_results);
                document.convert_to_found(result.version, new_data);
                document.set_has_committed_mutations();
            }
            MutationKind::Patch { data, mask } => {
                if !self.precondition.is_valid_for(document) {
                    document.convert_to_unknown(result.version);
                    return Ok(());
                }
                let transform_results = self.server_transform_results(document, result)?;
                let mut new_data = document.data().cloned().unwrap_or_default();
                apply_patch(&mut new_data, data, mask);
                self.write_transform_results(&mut new_data, transform_results);
                document.convert_to_found(result.version, new_data);
                document.set_has_committed_mutations();
            }
            MutationKind::Delete => {
                document.convert_to_missing(result.version);
                document.set_has_committed_mutations();
            }
            MutationKind::Verify => {}
        }
        Ok(())
    }

    fn local_transform_results(
        &self,
        document: &Document,
        local_write_time: Timestamp,
    ) -> ReplicaResult<Vec<Value>> {
        self.transforms
            .iter()
            .map(|transform| {
                resolve_transform(transform, document.field(transform.field()), local_write_time)
            })
            .collect()
    }

    fn server_transform_results(
        &self,
        document: &Document,
        result: &MutationResult,
    ) -> ReplicaResult<Vec<Value>> {
        if result.transform_results.len() == self.transforms.len() {
            return Ok(result.transform_results.clone());
        }
        if !result.transform_results.is_empty() {
            return Err(invalid_argument(format!(
                "Write result for {} carries {} transform results, expected {}",
                self.key,
                result.transform_results.len(),
                self.transforms.len()
            )));
        }
        // Acks without transform payloads resolve against the commit time.
        self.local_transform_results(document, result.version.timestamp())
    }

    fn write_transform_results(&self, data: &mut MapValue, results: Vec<Value>) {
        for (transform, value) in self.transforms.iter().zip(results) {
            data.set(transform.field(), value);
        }
    }
}

fn apply_patch(target: &mut MapValue, data: &MapValue, mask: &[FieldPath]) {
    for path in mask {
        match data.get(path) {
            Some(value) => target.set(path, value.clone()),
            None => target.delete(path),
        }
    }
}

/// Leaf paths of `data`; empty nested maps count as leaves.
pub(crate) fn leaf_field_paths(data: &MapValue) -> Vec<FieldPath> {
    let mut paths = Vec::new();
    collect_leaf_paths(data, &mut Vec::new(), &mut paths);
    paths
}

fn collect_leaf_paths(map: &MapValue, prefix: &mut Vec<String>, out: &mut Vec<FieldPath>) {
    for (name, value) in map.fields() {
        prefix.push(name.clone());
        match value.kind() {
            ValueKind::Map(child) if !child.is_empty() => collect_leaf_paths(child, prefix, out),
            _ => {
                if let Ok(path) = FieldPath::new(prefix.iter().cloned()) {
                    out.push(path);
                }
            }
        }
        prefix.pop();
    }
}

fn resolve_transform(
    transform: &FieldTransform,
    previous: Option<&Value>,
    write_time: Timestamp,
) -> ReplicaResult<Value> {
    match transform.operation() {
        TransformOperation::ServerTimestamp => Ok(Value::from_timestamp(write_time)),
        TransformOperation::Increment(operand) => numeric_increment(previous, operand),
        TransformOperation::ArrayUnion(elements) => Ok(array_union(previous, elements)),
        TransformOperation::ArrayRemove(elements) => Ok(array_remove(previous, elements)),
    }
}

fn existing_array(existing: Option<&Value>) -> ArrayValue {
    match existing.map(Value::kind) {
        Some(ValueKind::Array(array)) => array.clone(),
        _ => ArrayValue::default(),
    }
}

fn array_union(existing: Option<&Value>, additions: &[Value]) -> Value {
    let merged = existing_array(existing).union(additions);
    Value::from_array(merged.values().to_vec())
}

fn array_remove(existing: Option<&Value>, removals: &[Value]) -> Value {
    let remaining = existing_array(existing).without(removals);
    Value::from_array(remaining.values().to_vec())
}

fn numeric_increment(existing: Option<&Value>, operand: &Value) -> ReplicaResult<Value> {
    let base = existing.filter(|value| value.is_number());
    let result = match (base.map(Value::kind), operand.kind()) {
        (Some(ValueKind::Integer(current)), ValueKind::Integer(delta)) => {
            match current.checked_add(*delta) {
                Some(sum) => Value::from_integer(sum),
                None => Value::from_double(*current as f64 + *delta as f64),
            }
        }
        (Some(ValueKind::Integer(current)), ValueKind::Double(delta)) => {
            Value::from_double(*current as f64 + *delta)
        }
        (Some(ValueKind::Double(current)), ValueKind::Integer(delta)) => {
            Value::from_double(*current + *delta as f64)
        }
        (Some(ValueKind::Double(current)), ValueKind::Double(delta)) => {
            Value::from_double(*current + *delta)
        }
        (None, ValueKind::Integer(_) | ValueKind::Double(_)) => operand.clone(),
        _ => return Err(invalid_argument("Increment requires a numeric operand")),
    };
    Ok(result)
}
