use std::collections::{BTreeMap, BTreeSet};

use crate::error::ReplicaResult;
use crate::local::mutation_queue::MutationQueue;
use crate::local::remote_document_cache::RemoteDocumentCache;
use crate::model::{BatchId, DocumentKey, MutatedFields, Overlay, ResourcePath, BATCH_ID_UNKNOWN};
use crate::util::SortedMap;

/// Current overlay per document key.
#[derive(Clone, Debug, Default)]
pub struct OverlayCache {
    overlays: SortedMap<DocumentKey, Overlay>,
}

impl OverlayCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&Overlay> {
        self.overlays.get(key)
    }

    pub fn len(&self) -> usize {
        self.overlays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overlays.is_empty()
    }

    /// Installs a set of recalculated overlays; `None` clears the key.
    pub fn apply(&mut self, recalculated: BTreeMap<DocumentKey, Option<Overlay>>) {
        for (key, overlay) in recalculated {
            self.overlays = match overlay {
                Some(overlay) => self.overlays.insert(key, overlay),
                None => self.overlays.remove(&key),
            };
        }
    }

    /// Keys with an overlay directly inside `collection`.
    pub fn keys_in_collection(&self, collection: &ResourcePath) -> Vec<DocumentKey> {
        let start = match DocumentKey::from_path(collection.child("")) {
            Ok(start) => start,
            Err(_) => return Vec::new(),
        };
        self.overlays
            .iter_from(&start)
            .take_while(|(key, _)| collection.is_prefix_of(key.path()))
            .filter(|(key, _)| collection.is_immediate_parent_of(key.path()))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.overlays.keys()
    }
}

/// Replays every pending batch touching each of `keys`, in ascending batch
/// id order, over the remote base and derives the resulting overlay.
///
/// Nothing is installed here: the caller applies the returned map only when
/// every key recalculated successfully.
pub fn recalculate_overlays(
    queue: &MutationQueue,
    remote_documents: &RemoteDocumentCache,
    keys: &BTreeSet<DocumentKey>,
) -> ReplicaResult<BTreeMap<DocumentKey, Option<Overlay>>> {
    let mut recalculated = BTreeMap::new();
    for key in keys {
        let mut document = remote_documents.get(key);
        let mut mutated = MutatedFields::none();
        let mut largest_batch_id: BatchId = BATCH_ID_UNKNOWN;
        for batch in queue.batches_affecting(key) {
            mutated = batch.apply_to_local_view(&mut document, mutated)?;
            largest_batch_id = batch.batch_id;
        }
        let overlay = Overlay::from_replayed(&document, &mutated, largest_batch_id);
        recalculated.insert(key.clone(), overlay);
    }
    Ok(recalculated)
}
