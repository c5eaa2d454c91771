use std::collections::{BTreeMap, BTreeSet};

use crate::core::query::Query;
use crate::error::ReplicaResult;
use crate::model::{Document, DocumentKey, FieldPath};
use crate::settings::FieldIndexSettings;
use crate::value::Value;

/// A configured single-field equality index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldIndex {
    pub collection_id: String,
    pub field: FieldPath,
}

type IndexId = usize;

/// Client-side equality indexes over the remote document cache.
#[derive(Clone, Debug, Default)]
pub struct IndexManager {
    indexes: Vec<FieldIndex>,
    entries: BTreeMap<(IndexId, String), BTreeSet<DocumentKey>>,
    entries_by_key: BTreeMap<DocumentKey, Vec<(IndexId, String)>>,
}

impl IndexManager {
    pub fn new(settings: &[FieldIndexSettings]) -> ReplicaResult<Self> {
        let indexes = settings
            .iter()
            .map(|index| {
                Ok(FieldIndex {
                    collection_id: index.collection.clone(),
                    field: FieldPath::from_dot_separated(&index.field)?,
                })
            })
            .collect::<ReplicaResult<Vec<_>>>()?;
        Ok(Self {
            indexes,
            ..Self::default()
        })
    }

    pub fn indexes(&self) -> &[FieldIndex] {
        &self.indexes
    }

    /// Re-indexes one remote document; missing documents drop their entries.
    pub fn update(&mut self, document: &Document) {
        self.remove(document.key());
        if !document.is_found() {
            return;
        }
        let collection_id = collection_id_of(document.key());
        let mut added = Vec::new();
        for (index_id, index) in self.indexes.iter().enumerate() {
            if index.collection_id != collection_id {
                continue;
            }
            if let Some(value) = document.field(&index.field) {
                let entry = (index_id, value.canonical_id());
                self.entries
                    .entry(entry.clone())
                    .or_default()
                    .insert(document.key().clone());
                added.push(entry);
            }
        }
        if !added.is_empty() {
            self.entries_by_key.insert(document.key().clone(), added);
        }
    }

    pub fn remove(&mut self, key: &DocumentKey) {
        for entry in self.entries_by_key.remove(key).unwrap_or_default() {
            if let Some(keys) = self.entries.get_mut(&entry) {
                keys.remove(key);
                if keys.is_empty() {
                    self.entries.remove(&entry);
                }
            }
        }
    }

    /// Candidate keys for `query` when an index serves one of its equality
    /// filters; `None` when no index applies.
    pub fn candidate_keys(&self, query: &Query) -> Option<BTreeSet<DocumentKey>> {
        if query.is_document_query() {
            return None;
        }
        let collection_id = query.path().last_segment()?;
        self.indexes
            .iter()
            .enumerate()
            .filter(|(_, index)| index.collection_id == collection_id)
            .find_map(|(index_id, index)| {
                let value: &Value = query.equality_filter_on(&index.field)?;
                Some(
                    self.entries
                        .get(&(index_id, value.canonical_id()))
                        .map(|keys| {
                            keys.iter()
                                .filter(|key| query.path().is_immediate_parent_of(key.path()))
                                .cloned()
                                .collect()
                        })
                        .unwrap_or_default(),
                )
            })
    }
}

fn collection_id_of(key: &DocumentKey) -> String {
    key.collection_path()
        .last_segment()
        .unwrap_or_default()
        .to_string()
}
