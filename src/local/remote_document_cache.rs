use crate::model::{Document, DocumentKey, ResourcePath, SnapshotVersion};
use crate::util::SortedMap;

type ReadTimeKey = (SnapshotVersion, Option<DocumentKey>);

/// Last documents seen from the server, keyed by document key and indexed by
/// the read time at which they were written.
///
/// Cloning is O(1); clones are unaffected by later writes.
#[derive(Clone, Debug, Default)]
pub struct RemoteDocumentCache {
    documents: SortedMap<DocumentKey, Document>,
    by_read_time: SortedMap<ReadTimeKey, ()>,
}

impl RemoteDocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Stores `document` stamped with `read_time`.
    pub fn add(&mut self, document: Document, read_time: SnapshotVersion) {
        let key = document.key().clone();
        self.remove(&key);
        self.by_read_time = self
            .by_read_time
            .insert((read_time, Some(key.clone())), ());
        self.documents = self.documents.insert(key, document.with_read_time(read_time));
    }

    pub fn remove(&mut self, key: &DocumentKey) {
        if let Some(existing) = self.documents.get(key) {
            let index_key = (existing.read_time(), Some(key.clone()));
            self.by_read_time = self.by_read_time.remove(&index_key);
            self.documents = self.documents.remove(key);
        }
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.documents.contains_key(key)
    }

    /// The cached entry, or a missing document at the min version when the
    /// key was never seen.
    pub fn get(&self, key: &DocumentKey) -> Document {
        self.documents
            .get(key)
            .cloned()
            .unwrap_or_else(|| Document::missing(key.clone(), SnapshotVersion::min()))
    }

    /// Documents directly inside `collection`, in key order.
    pub fn documents_in_collection<'a>(
        &'a self,
        collection: &'a ResourcePath,
    ) -> impl Iterator<Item = &'a Document> + 'a {
        let start = DocumentKey::from_path(collection.child("")).ok();
        let entries: Box<dyn Iterator<Item = (&'a DocumentKey, &'a Document)> + 'a> = match start {
            Some(start) => Box::new(self.documents.iter_from(&start)),
            None => Box::new(self.documents.iter()),
        };
        entries
            .take_while(move |(key, _)| collection.is_prefix_of(key.path()))
            .filter(move |(key, _)| collection.is_immediate_parent_of(key.path()))
            .map(|(_, document)| document)
    }

    /// Documents in `collection` written after `version`.
    pub fn documents_changed_since<'a>(
        &'a self,
        collection: &'a ResourcePath,
        version: SnapshotVersion,
    ) -> impl Iterator<Item = &'a Document> + 'a {
        self.by_read_time
            .iter_from(&(version, None))
            .filter(move |((read_time, _), _)| *read_time > version)
            .filter_map(|((_, key), _)| key.as_ref())
            .filter(move |key| collection.is_immediate_parent_of(key.path()))
            .filter_map(|key| self.documents.get(key))
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.documents.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::MapValue;

    fn doc(path: &str, version: i64) -> Document {
        Document::found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(version),
            MapValue::empty(),
        )
    }

    #[test]
    fn absent_keys_read_as_missing_at_min() {
        let cache = RemoteDocumentCache::new();
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let document = cache.get(&key);
        assert!(document.is_missing());
        assert!(document.version().is_min());
    }

    #[test]
    fn collection_scan_skips_nested_and_sibling_documents() {
        let mut cache = RemoteDocumentCache::new();
        for path in ["rooms/a", "rooms/a/messages/m1", "rooms/b", "roomsx/c", "other/d"] {
            cache.add(doc(path, 1), SnapshotVersion::from_micros(1));
        }
        let collection = ResourcePath::from_string("rooms").unwrap();
        let ids: Vec<&str> = cache
            .documents_in_collection(&collection)
            .map(|d| d.key().id())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn read_time_index_tracks_rewrites() {
        let mut cache = RemoteDocumentCache::new();
        cache.add(doc("rooms/a", 1), SnapshotVersion::from_micros(1));
        cache.add(doc("rooms/b", 1), SnapshotVersion::from_micros(2));
        cache.add(doc("rooms/a", 3), SnapshotVersion::from_micros(3));

        let collection = ResourcePath::from_string("rooms").unwrap();
        let changed: Vec<&str> = cache
            .documents_changed_since(&collection, SnapshotVersion::from_micros(2))
            .map(|d| d.key().id())
            .collect();
        assert_eq!(changed, vec!["a"]);

        let snapshot = cache.clone();
        cache.remove(&DocumentKey::from_string("rooms/a").unwrap());
        assert_eq!(cache.len(), 1);
        assert_eq!(snapshot.len(), 2);
    }
}
