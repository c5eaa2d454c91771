use crate::error::ReplicaResult;
use crate::model::{BatchId, Document, DocumentKey, MutatedFields, Mutation, Timestamp};
use crate::value::MapValue;

/// Net local effect of every pending batch touching one document.
#[derive(Clone, Debug, PartialEq)]
pub struct Overlay {
    largest_batch_id: BatchId,
    mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: BatchId, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    /// Derives the coalesced mutation from a document that went through a
    /// full replay of its pending batches.
    ///
    /// Returns `None` when no pending mutation took effect.
    pub fn from_replayed(
        document: &Document,
        mutated: &MutatedFields,
        largest_batch_id: BatchId,
    ) -> Option<Self> {
        if !document.has_local_mutations() || mutated.is_empty() {
            return None;
        }

        let key = document.key().clone();
        let mutation = match mutated {
            MutatedFields::WholeDocument => match document.data() {
                Some(data) => Mutation::set(key, data.clone()),
                None => Mutation::delete(key),
            },
            MutatedFields::Fields(fields) => {
                let source = document.data().cloned().unwrap_or_default();
                let mut patch = MapValue::empty();
                for field in fields {
                    if let Some(value) = source.get(field) {
                        patch.set(field, value.clone());
                    }
                }
                Mutation::patch_with_mask(key, patch, fields.iter().cloned().collect())
            }
        };
        Some(Self::new(largest_batch_id, mutation))
    }

    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }

    pub fn largest_batch_id(&self) -> BatchId {
        self.largest_batch_id
    }

    pub fn mutation(&self) -> &Mutation {
        &self.mutation
    }

    /// Applies the overlay on top of the remote base document.
    ///
    /// A root `set` yields a found document even without a base; a patch on
    /// an absent base leaves it missing.
    pub fn apply(&self, base: &Document) -> ReplicaResult<Document> {
        let mut document = base.clone();
        self.mutation.apply_to_local_view(
            &mut document,
            MutatedFields::none(),
            Timestamp::now(),
        )?;
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldPath, SnapshotVersion};
    use crate::value::Value;
    use serde_json::json;

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/eros").unwrap()
    }

    fn map(json: serde_json::Value) -> MapValue {
        Value::from_json(&json).as_map().unwrap().clone()
    }

    #[test]
    fn set_overlay_creates_document_without_base() {
        let overlay = Overlay::new(3, Mutation::set(key(), map(json!({"name": "a"}))));
        let base = Document::missing(key(), SnapshotVersion::min());
        let doc = overlay.apply(&base).unwrap();
        assert!(doc.is_found());
        assert!(doc.has_local_mutations());
    }

    #[test]
    fn patch_overlay_without_base_stays_missing() {
        let overlay = Overlay::new(
            3,
            Mutation::patch_with_mask(
                key(),
                map(json!({"name": "a"})),
                vec![FieldPath::from_dot_separated("name").unwrap()],
            ),
        );
        let base = Document::missing(key(), SnapshotVersion::min());
        assert!(overlay.apply(&base).unwrap().is_missing());
    }

    #[test]
    fn no_overlay_when_nothing_applied() {
        let doc = Document::missing(key(), SnapshotVersion::min());
        assert!(Overlay::from_replayed(&doc, &MutatedFields::none(), 1).is_none());
    }

    #[test]
    fn deleted_document_yields_delete_overlay() {
        let mut doc = Document::found(key(), SnapshotVersion::from_micros(1), map(json!({})));
        Mutation::delete(key())
            .apply_to_local_view(&mut doc, MutatedFields::none(), Timestamp::now())
            .unwrap();
        let overlay = Overlay::from_replayed(&doc, &MutatedFields::WholeDocument, 4).unwrap();
        assert_eq!(overlay.mutation(), &Mutation::delete(key()));
        assert_eq!(overlay.largest_batch_id(), 4);
    }
}
