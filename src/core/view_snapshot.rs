use std::collections::{BTreeMap, BTreeSet};

use crate::core::document_set::DocumentSet;
use crate::core::query::Query;
use crate::error::{internal_error, ReplicaResult};
use crate::model::{Document, DocumentKey};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    /// Only the document's metadata (pending writes) changed.
    Metadata,
}

impl ChangeType {
    /// Removals sort first, then additions, then modifications.
    fn rank(self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub document: Document,
}

/// Per-key change accumulator; successive changes to one key collapse into
/// their net effect, so an add followed by a remove leaves nothing.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn track(&mut self, change: DocumentViewChange) -> ReplicaResult<()> {
        let key = change.document.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return Ok(());
        };

        use ChangeType::*;
        let merged = match (old.change_type, change.change_type) {
            (Metadata, Removed | Modified | Metadata) => Some(change),
            (old_type, Metadata) if old_type != Removed => Some(DocumentViewChange {
                change_type: old_type,
                document: change.document,
            }),
            (Modified, Modified) => Some(change),
            (Added, Modified) => Some(DocumentViewChange {
                change_type: Added,
                document: change.document,
            }),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange {
                change_type: Removed,
                document: old.document.clone(),
            }),
            (Removed, Added) => Some(DocumentViewChange {
                change_type: Modified,
                document: change.document,
            }),
            (old_type, new_type) => {
                return Err(internal_error(format!(
                    "Cannot apply {new_type:?} after {old_type:?} for {key}"
                )))
            }
        };
        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
        Ok(())
    }

    pub fn into_changes(self) -> Vec<DocumentViewChange> {
        self.changes.into_values().collect()
    }

    /// Orders changes the way they are reported: by type, then by `query`.
    pub(crate) fn sorted_changes(self, query: &Query) -> Vec<DocumentViewChange> {
        let comparator = query.comparator();
        let mut changes = self.into_changes();
        changes.sort_by(|left, right| {
            left.change_type
                .rank()
                .cmp(&right.change_type.rank())
                .then_with(|| comparator.as_ref()(&left.document, &right.document))
        });
        changes
    }
}

/// Cache and pending-write state of a snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotMetadata {
    from_cache: bool,
    has_pending_writes: bool,
}

impl SnapshotMetadata {
    pub fn new(from_cache: bool, has_pending_writes: bool) -> Self {
        Self {
            from_cache,
            has_pending_writes,
        }
    }

    /// True until the server confirmed the results are up to date.
    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_pending_writes
    }
}

/// One entry of [`ViewSnapshot::changes`].
///
/// `old_index` is the position in the previous snapshot and `new_index` the
/// position in this one, each counted after applying the preceding changes.
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotChange {
    pub change_type: ChangeType,
    pub document: Document,
    pub old_index: Option<usize>,
    pub new_index: Option<usize>,
}

impl SnapshotChange {
    /// A modification that moved the document within the results.
    pub fn is_reorder(&self) -> bool {
        matches!(self.change_type, ChangeType::Modified | ChangeType::Metadata)
            && self.old_index != self.new_index
    }
}

/// Results of a query at one point in time, with the diff from the previous
/// snapshot delivered to the same listener.
#[derive(Clone, Debug)]
pub struct ViewSnapshot {
    query: Query,
    documents: DocumentSet,
    old_documents: DocumentSet,
    document_changes: Vec<DocumentViewChange>,
    mutated_keys: BTreeSet<DocumentKey>,
    from_cache: bool,
    sync_state_changed: bool,
    excludes_metadata_changes: bool,
    has_cached_results: bool,
}

impl ViewSnapshot {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        query: Query,
        documents: DocumentSet,
        old_documents: DocumentSet,
        document_changes: Vec<DocumentViewChange>,
        mutated_keys: BTreeSet<DocumentKey>,
        from_cache: bool,
        sync_state_changed: bool,
        has_cached_results: bool,
    ) -> Self {
        Self {
            query,
            documents,
            old_documents,
            document_changes,
            mutated_keys,
            from_cache,
            sync_state_changed,
            excludes_metadata_changes: false,
            has_cached_results,
        }
    }

    /// A snapshot reporting every document as added.
    pub(crate) fn from_initial_documents(snapshot: &ViewSnapshot) -> Self {
        let document_changes = snapshot
            .documents
            .iter()
            .map(|document| DocumentViewChange {
                change_type: ChangeType::Added,
                document: document.clone(),
            })
            .collect();
        Self {
            query: snapshot.query.clone(),
            documents: snapshot.documents.clone(),
            old_documents: DocumentSet::new(snapshot.query.comparator()),
            document_changes,
            mutated_keys: snapshot.mutated_keys.clone(),
            from_cache: snapshot.from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: snapshot.excludes_metadata_changes,
            has_cached_results: snapshot.has_cached_results,
        }
    }

    /// The same snapshot without metadata-only changes.
    pub(crate) fn without_metadata_changes(&self) -> Self {
        let mut snapshot = self.clone();
        snapshot
            .document_changes
            .retain(|change| change.change_type != ChangeType::Metadata);
        snapshot.excludes_metadata_changes = true;
        snapshot
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn documents(&self) -> &DocumentSet {
        &self.documents
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }

    /// Whether `key` is shown with local writes the server has not
    /// acknowledged.
    pub fn has_pending_writes_for(&self, key: &DocumentKey) -> bool {
        self.mutated_keys.contains(key)
    }

    pub fn metadata(&self) -> SnapshotMetadata {
        SnapshotMetadata::new(self.from_cache, self.has_pending_writes())
    }

    pub fn sync_state_changed(&self) -> bool {
        self.sync_state_changed
    }

    pub fn excludes_metadata_changes(&self) -> bool {
        self.excludes_metadata_changes
    }

    /// The target was resumed from a token, so the cached results are a
    /// reasonable first answer.
    pub fn has_cached_results(&self) -> bool {
        self.has_cached_results
    }

    pub fn document_changes(&self) -> &[DocumentViewChange] {
        &self.document_changes
    }

    /// Typed changes with their positions in the old and new results.
    pub fn changes(&self) -> Vec<SnapshotChange> {
        if self.old_documents.is_empty() {
            return self
                .document_changes
                .iter()
                .enumerate()
                .map(|(index, change)| SnapshotChange {
                    change_type: change.change_type,
                    document: change.document.clone(),
                    old_index: None,
                    new_index: Some(index),
                })
                .collect();
        }

        let mut tracker = self.old_documents.clone();
        self.document_changes
            .iter()
            .map(|change| {
                let key = change.document.key();
                let mut old_index = None;
                let mut new_index = None;
                if change.change_type != ChangeType::Added {
                    old_index = tracker.index_of(key);
                    tracker = tracker.delete(key);
                }
                if change.change_type != ChangeType::Removed {
                    tracker = tracker.add(change.document.clone());
                    new_index = tracker.index_of(key);
                }
                SnapshotChange {
                    change_type: change.change_type,
                    document: change.document.clone(),
                    old_index,
                    new_index,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::query::Direction;
    use crate::model::SnapshotVersion;
    use crate::value::Value;

    fn doc(path: &str, rank: i64) -> Document {
        let data = Value::from_json(&serde_json::json!({ "rank": rank }));
        Document::found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::min(),
            data.as_map().unwrap().clone(),
        )
    }

    fn change(change_type: ChangeType, document: Document) -> DocumentViewChange {
        DocumentViewChange {
            change_type,
            document,
        }
    }

    #[test]
    fn add_then_remove_cancels_out() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Added, doc("rooms/a", 1))).unwrap();
        set.track(change(ChangeType::Removed, doc("rooms/a", 1))).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn changes_collapse_to_net_effect() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Added, doc("rooms/a", 1))).unwrap();
        set.track(change(ChangeType::Modified, doc("rooms/a", 2))).unwrap();
        set.track(change(ChangeType::Removed, doc("rooms/b", 1))).unwrap();
        set.track(change(ChangeType::Added, doc("rooms/b", 5))).unwrap();
        set.track(change(ChangeType::Metadata, doc("rooms/c", 1))).unwrap();
        set.track(change(ChangeType::Modified, doc("rooms/c", 3))).unwrap();

        let summary: Vec<(ChangeType, Document)> = set
            .into_changes()
            .into_iter()
            .map(|change| (change.change_type, change.document))
            .collect();
        assert_eq!(
            summary,
            vec![
                (ChangeType::Added, doc("rooms/a", 2)),
                (ChangeType::Modified, doc("rooms/b", 5)),
                (ChangeType::Modified, doc("rooms/c", 3)),
            ]
        );
    }

    #[test]
    fn removed_then_modified_is_rejected() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Removed, doc("rooms/a", 1))).unwrap();
        assert!(set.track(change(ChangeType::Modified, doc("rooms/a", 1))).is_err());
    }

    #[test]
    fn changes_report_old_and_new_indexes() {
        let query = Query::collection("rooms")
            .unwrap()
            .order_by("rank", Direction::Ascending)
            .unwrap();
        let old = DocumentSet::new(query.comparator())
            .add(doc("rooms/a", 1))
            .add(doc("rooms/b", 2))
            .add(doc("rooms/c", 3));
        let new = old.delete(doc("rooms/a", 1).key()).add(doc("rooms/b", 9));
        let snapshot = ViewSnapshot::new(
            query,
            new,
            old,
            vec![
                change(ChangeType::Removed, doc("rooms/a", 1)),
                change(ChangeType::Modified, doc("rooms/b", 9)),
            ],
            BTreeSet::new(),
            false,
            false,
            false,
        );

        let changes = snapshot.changes();
        assert_eq!(changes[0].old_index, Some(0));
        assert_eq!(changes[0].new_index, None);
        assert_eq!(changes[1].old_index, Some(0));
        assert_eq!(changes[1].new_index, Some(1));
        assert!(changes[1].is_reorder());
    }
}
