use std::fmt::{Debug, Formatter};

use crate::core::query::DocumentComparator;
use crate::model::{Document, DocumentKey};
use crate::util::SortedMap;

/// Documents of one view, ordered by the view's query.
///
/// Both the key index and the ordered tree are persistent, so cloning a set
/// into a snapshot shares structure with the view it came from.
#[derive(Clone)]
pub struct DocumentSet {
    key_index: SortedMap<DocumentKey, Document>,
    sorted: SortedMap<Document, ()>,
}

impl DocumentSet {
    /// `comparator` has to break ties on the document key, as
    /// [`crate::Query::comparator`] does.
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            key_index: SortedMap::new(),
            sorted: SortedMap::with_comparator(comparator),
        }
    }

    pub fn len(&self) -> usize {
        self.key_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_index.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.key_index.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.key_index.get(key)
    }

    pub fn first(&self) -> Option<&Document> {
        self.sorted.first().map(|(document, _)| document)
    }

    pub fn last(&self) -> Option<&Document> {
        self.sorted.last().map(|(document, _)| document)
    }

    /// Position of `key` in query order.
    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let document = self.key_index.get(key)?;
        self.sorted.position_of(document)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.sorted.keys()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.key_index.keys()
    }

    /// Inserts or replaces the document with the same key.
    #[must_use]
    pub fn add(&self, document: Document) -> Self {
        let without = self.delete(document.key());
        Self {
            key_index: without.key_index.insert(document.key().clone(), document.clone()),
            sorted: without.sorted.insert(document, ()),
        }
    }

    #[must_use]
    pub fn delete(&self, key: &DocumentKey) -> Self {
        match self.key_index.get(key) {
            Some(existing) => Self {
                key_index: self.key_index.remove(key),
                sorted: self.sorted.remove(existing),
            },
            None => self.clone(),
        }
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().eq(other.iter())
    }
}

impl Debug for DocumentSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.iter().map(|document| document.key().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::query::{Direction, Query};
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

    fn by_rank_desc() -> DocumentSet {
        let query = Query::collection("rooms")
            .unwrap()
            .order_by("rank", Direction::Descending)
            .unwrap();
        DocumentSet::new(query.comparator())
    }

    #[test]
    fn keeps_query_order_and_replaces_by_key() {
        let set = by_rank_desc()
            .add(doc("rooms/a", 1))
            .add(doc("rooms/b", 3))
            .add(doc("rooms/c", 2));
        let order: Vec<String> = set.iter().map(|d| d.key().id().to_string()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);

        let updated = set.add(doc("rooms/a", 9));
        assert_eq!(updated.len(), 3);
        assert_eq!(updated.first().unwrap().key().id(), "a");
        assert_eq!(updated.index_of(&DocumentKey::from_string("rooms/c").unwrap()), Some(2));

        // The original is untouched.
        assert_eq!(set.first().unwrap().key().id(), "b");
    }

    #[test]
    fn delete_missing_key_is_a_no_op() {
        let set = by_rank_desc().add(doc("rooms/a", 1));
        let same = set.delete(&DocumentKey::from_string("rooms/z").unwrap());
        assert_eq!(same, set);
        assert!(set.delete(&DocumentKey::from_string("rooms/a").unwrap()).is_empty());
    }
}
