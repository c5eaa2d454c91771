use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::local::target_data::TargetData;
use crate::model::{DocumentKey, TargetId};
use crate::util::SortedMap;

/// Hands out target ids from one parity class so ids from the local store
/// (even) and the sync engine's limbo targets (odd) never collide.
#[derive(Clone, Copy, Debug)]
pub struct TargetIdGenerator {
    next_id: TargetId,
}

impl TargetIdGenerator {
    pub fn for_target_cache() -> Self {
        Self { next_id: 2 }
    }

    pub fn for_sync_engine() -> Self {
        Self { next_id: 1 }
    }

    /// Moves past `highest` while keeping this generator's parity.
    pub fn seek_past(&mut self, highest: TargetId) {
        while self.next_id <= highest {
            self.next_id += 2;
        }
    }

    pub fn next(&mut self) -> TargetId {
        let id = self.next_id;
        self.next_id += 2;
        id
    }
}

/// Targets the store has listened to, and the document keys the server
/// reported for each of them.
#[derive(Clone, Debug)]
pub struct TargetCache {
    targets: BTreeMap<TargetId, TargetData>,
    by_canonical_id: HashMap<String, TargetId>,
    /// `(key, target_id)` references, for "is this key in any target".
    references: SortedMap<(DocumentKey, TargetId), ()>,
    matching_keys: HashMap<TargetId, BTreeSet<DocumentKey>>,
    id_generator: TargetIdGenerator,
}

impl Default for TargetCache {
    fn default() -> Self {
        Self {
            targets: BTreeMap::new(),
            by_canonical_id: HashMap::new(),
            references: SortedMap::new(),
            matching_keys: HashMap::new(),
            id_generator: TargetIdGenerator::for_target_cache(),
        }
    }
}

impl TargetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_target_id(&mut self) -> TargetId {
        self.id_generator.next()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn get(&self, target_id: TargetId) -> Option<&TargetData> {
        self.targets.get(&target_id)
    }

    pub fn get_by_canonical_id(&self, canonical_id: &str) -> Option<&TargetData> {
        self.by_canonical_id
            .get(canonical_id)
            .and_then(|target_id| self.targets.get(target_id))
    }

    pub fn targets(&self) -> impl Iterator<Item = &TargetData> {
        self.targets.values()
    }

    /// Inserts or replaces the target.
    pub fn save(&mut self, data: TargetData) {
        self.id_generator.seek_past(data.target_id);
        self.by_canonical_id
            .insert(data.query.canonical_id(), data.target_id);
        self.targets.insert(data.target_id, data);
    }

    /// Drops the target and its key references; returns the keys it held.
    pub fn remove(&mut self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        if let Some(data) = self.targets.remove(&target_id) {
            let canonical_id = data.query.canonical_id();
            if self.by_canonical_id.get(&canonical_id) == Some(&target_id) {
                self.by_canonical_id.remove(&canonical_id);
            }
        }
        let keys = self.matching_keys.remove(&target_id).unwrap_or_default();
        for key in &keys {
            self.references = self.references.remove(&(key.clone(), target_id));
        }
        keys
    }

    pub fn matching_keys(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.matching_keys
            .get(&target_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn add_matching_keys<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        target_id: TargetId,
    ) {
        let entry = self.matching_keys.entry(target_id).or_default();
        for key in keys {
            if entry.insert(key.clone()) {
                self.references = self.references.insert((key.clone(), target_id), ());
            }
        }
    }

    pub fn remove_matching_keys<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        target_id: TargetId,
    ) {
        if let Some(entry) = self.matching_keys.get_mut(&target_id) {
            for key in keys {
                if entry.remove(key) {
                    self.references = self.references.remove(&(key.clone(), target_id));
                }
            }
        }
    }

    /// Whether any target references `key`.
    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.references
            .iter_from(&(key.clone(), TargetId::MIN))
            .next()
            .is_some_and(|((referenced, _), _)| referenced == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::query::Query;
    use crate::local::target_data::TargetPurpose;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn generators_keep_parity() {
        let mut local = TargetIdGenerator::for_target_cache();
        let mut limbo = TargetIdGenerator::for_sync_engine();
        assert_eq!(local.next(), 2);
        assert_eq!(local.next(), 4);
        assert_eq!(limbo.next(), 1);
        limbo.seek_past(10);
        assert_eq!(limbo.next(), 11);
    }

    #[test]
    fn tracks_key_references_across_targets() {
        let mut cache = TargetCache::new();
        let query = Query::collection("rooms").unwrap();
        let id = cache.allocate_target_id();
        cache.save(TargetData::new(query.clone(), id, TargetPurpose::Listen, 1));
        cache.add_matching_keys([&key("rooms/a"), &key("rooms/b")], id);

        assert_eq!(cache.get_by_canonical_id(&query.canonical_id()).unwrap().target_id, id);
        assert!(cache.contains_key(&key("rooms/a")));

        cache.remove_matching_keys([&key("rooms/a")], id);
        assert!(!cache.contains_key(&key("rooms/a")));

        let removed = cache.remove(id);
        assert_eq!(removed, BTreeSet::from([key("rooms/b")]));
        assert!(!cache.contains_key(&key("rooms/b")));
        assert!(cache.get_by_canonical_id(&query.canonical_id()).is_none());
    }

    #[test]
    fn restored_targets_push_allocation_forward() {
        let mut cache = TargetCache::new();
        let query = Query::collection("rooms").unwrap();
        cache.save(TargetData::new(query, 8, TargetPurpose::Listen, 1));
        assert_eq!(cache.allocate_target_id(), 10);
    }
}
