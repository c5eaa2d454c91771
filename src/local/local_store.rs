use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::core::query::Query;
use crate::error::{internal_error, invalid_argument, ReplicaErrorCode, ReplicaResult};
use crate::local::index_manager::IndexManager;
use crate::local::local_documents::LocalDocumentsView;
use crate::local::lru::{nth_sequence_number, CollectionResult, ReferenceTracker};
use crate::local::mutation_queue::MutationQueue;
use crate::local::overlay_resolver::{recalculate_overlays, OverlayCache};
use crate::local::persistence::{Persistence, PersistedTarget, WriteSet};
use crate::local::query_engine::{self, PreviousResults, QueryResult};
use crate::local::remote_document_cache::RemoteDocumentCache;
use crate::local::target_cache::TargetCache;
use crate::local::target_data::{TargetData, TargetPurpose};
use crate::model::{
    BatchId, Document, DocumentKey, Mutation, MutationBatch, MutationBatchResult, ResumeToken,
    SnapshotVersion, TargetId, Timestamp, BATCH_ID_UNKNOWN,
};
use crate::platform::runtime;
use crate::remote::RemoteEvent;
use crate::settings::{FieldIndexSettings, StorageRetrySettings};

pub type DocumentMap = BTreeMap<DocumentKey, Document>;

/// Whether writes still reach the persistence collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageMode {
    Durable,
    /// Persistence kept failing; in-memory state is the only copy.
    NetworkOnly,
}

#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    /// Local view of every document the batch touched.
    pub changes: DocumentMap,
}

/// Key membership changes a view reported for its target.
#[derive(Clone, Debug)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

/// Owns every local cache and keeps them consistent with the durable copy.
///
/// The in-memory caches are authoritative. Each operation computes its new
/// state first, writes it through to persistence, and only then installs it,
/// so a failed operation leaves no partial state behind.
pub struct LocalStore {
    persistence: Arc<dyn Persistence>,
    storage_retry: StorageRetrySettings,
    storage_mode: StorageMode,
    remote_documents: RemoteDocumentCache,
    mutation_queue: MutationQueue,
    overlays: OverlayCache,
    target_cache: TargetCache,
    active_targets: BTreeSet<TargetId>,
    /// Keys currently displayed by a view, per target.
    view_references: BTreeSet<(DocumentKey, TargetId)>,
    index_manager: IndexManager,
    references: ReferenceTracker,
    last_remote_snapshot_version: SnapshotVersion,
}

impl LocalStore {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        storage_retry: StorageRetrySettings,
        field_indexes: &[FieldIndexSettings],
    ) -> ReplicaResult<Self> {
        Ok(Self {
            persistence,
            storage_retry,
            storage_mode: StorageMode::Durable,
            remote_documents: RemoteDocumentCache::new(),
            mutation_queue: MutationQueue::new(),
            overlays: OverlayCache::new(),
            target_cache: TargetCache::new(),
            active_targets: BTreeSet::new(),
            view_references: BTreeSet::new(),
            index_manager: IndexManager::new(field_indexes)?,
            references: ReferenceTracker::new(),
            last_remote_snapshot_version: SnapshotVersion::min(),
        })
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.storage_mode
    }

    pub fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.last_remote_snapshot_version
    }

    /// Loads pending batches, targets and the documents they reference, then
    /// rebuilds the overlays of every key with pending writes.
    pub async fn start(&mut self) -> ReplicaResult<()> {
        let persistence = Arc::clone(&self.persistence);
        let restored = retry_storage(&self.storage_retry, "hydrate", || {
            read_persisted_state(Arc::clone(&persistence))
        })
        .await?;
        match restored {
            Some(state) => self.install_persisted_state(state),
            None => {
                self.enter_network_only("hydrate");
                Ok(())
            }
        }
    }

    fn install_persisted_state(&mut self, state: PersistedState) -> ReplicaResult<()> {
        let PersistedState {
            batches,
            targets,
            documents,
        } = state;
        let batch_count = batches.len();
        let target_count = targets.len();
        self.mutation_queue = MutationQueue::restore(batches);

        for target in targets {
            let target_id = target.data.target_id;
            self.references.seek_past(target.data.sequence_number);
            if target.data.snapshot_version > self.last_remote_snapshot_version {
                self.last_remote_snapshot_version = target.data.snapshot_version;
            }
            self.target_cache.save(target.data);
            self.target_cache
                .add_matching_keys(&target.remote_keys, target_id);
        }

        let sequence = self.references.next_sequence_number();
        for document in documents {
            let read_time = document.read_time();
            self.index_manager.update(&document);
            self.references.touch(document.key(), sequence);
            self.remote_documents.add(document, read_time);
        }

        let pending_keys: BTreeSet<DocumentKey> = self
            .mutation_queue
            .all_batches()
            .flat_map(MutationBatch::keys)
            .collect();
        let overlays =
            recalculate_overlays(&self.mutation_queue, &self.remote_documents, &pending_keys)?;
        self.overlays.apply(overlays);

        log::debug!(
            "restored {batch_count} pending batches, {target_count} targets and {} documents",
            self.remote_documents.len()
        );
        Ok(())
    }

    /// Appends a batch to the mutation queue and recomputes the overlays of
    /// the keys it touches.
    pub async fn write_locally(&mut self, mutations: Vec<Mutation>) -> ReplicaResult<LocalWriteResult> {
        if mutations.is_empty() {
            return Err(invalid_argument("Mutation batches must not be empty"));
        }
        for mutation in &mutations {
            mutation.validate()?;
        }

        let mut queue = self.mutation_queue.clone();
        let batch = queue.add_batch(Timestamp::now(), mutations)?;
        let keys = batch.keys();
        let overlays = recalculate_overlays(&queue, &self.remote_documents, &keys)?;

        let mut writes = WriteSet::default();
        writes.add_batch(batch.clone());
        self.persist("write_locally", writes).await?;

        self.mutation_queue = queue;
        self.overlays.apply(overlays);
        let sequence = self.references.next_sequence_number();
        for key in &keys {
            self.references.touch(key, sequence);
        }

        Ok(LocalWriteResult {
            batch_id: batch.batch_id,
            changes: self.local_documents().get_documents(&keys)?,
        })
    }

    /// Applies an acknowledged batch to the remote documents and retires it.
    pub async fn acknowledge_batch(&mut self, result: &MutationBatchResult) -> ReplicaResult<DocumentMap> {
        let batch = &result.batch;
        let mut queue = self.mutation_queue.clone();
        queue.remove_batch(batch.batch_id)?;

        let mut remote_documents = self.remote_documents.clone();
        let mut updated = Vec::new();
        for (key, ack_version) in result.document_versions() {
            let mut document = remote_documents.get(&key);
            if document.version() < ack_version {
                batch.apply_to_remote_document(&mut document, result)?;
                remote_documents.add(document.clone(), result.commit_version);
                updated.push(document.with_read_time(result.commit_version));
            }
        }

        let keys = batch.keys();
        let overlays = recalculate_overlays(&queue, &remote_documents, &keys)?;

        let mut writes = WriteSet::default();
        writes.remove_batch(batch.batch_id);
        for document in &updated {
            writes.put_document(document.clone());
        }
        self.persist("acknowledge_batch", writes).await?;

        self.mutation_queue = queue;
        self.remote_documents = remote_documents;
        self.overlays.apply(overlays);
        let sequence = self.references.next_sequence_number();
        for document in &updated {
            self.index_manager.update(document);
            self.references.touch(document.key(), sequence);
        }

        self.local_documents().get_documents(&keys)
    }

    /// Drops a rejected batch; its keys fall back to the remaining batches.
    pub async fn reject_batch(&mut self, batch_id: BatchId) -> ReplicaResult<DocumentMap> {
        let mut queue = self.mutation_queue.clone();
        let batch = queue.remove_batch(batch_id)?;
        let keys = batch.keys();
        let overlays = recalculate_overlays(&queue, &self.remote_documents, &keys)?;

        let mut writes = WriteSet::default();
        writes.remove_batch(batch_id);
        self.persist("reject_batch", writes).await?;

        self.mutation_queue = queue;
        self.overlays.apply(overlays);
        self.local_documents().get_documents(&keys)
    }

    /// Applies a consistent snapshot from the watch stream.
    ///
    /// Returns the local view of every document whose remote state changed.
    pub async fn apply_remote_event(&mut self, event: &RemoteEvent) -> ReplicaResult<DocumentMap> {
        let remote_version = event.snapshot_version;
        let sequence = self.references.next_sequence_number();
        let mut writes = WriteSet::default();

        let mut target_cache = self.target_cache.clone();
        let mut touched_keys = BTreeSet::new();
        for (target_id, change) in &event.target_changes {
            if !self.active_targets.contains(target_id) {
                continue;
            }
            let Some(old) = target_cache.get(*target_id).cloned() else {
                continue;
            };
            target_cache.remove_matching_keys(&change.removed_documents, *target_id);
            target_cache.add_matching_keys(&change.added_documents, *target_id);
            touched_keys.extend(change.removed_documents.iter().cloned());
            touched_keys.extend(change.added_documents.iter().cloned());

            let mut updated = old.with_sequence_number(sequence);
            if event.target_resets.contains(target_id) {
                updated = updated
                    .with_resume_token(ResumeToken::empty(), SnapshotVersion::min())
                    .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
            } else if !change.resume_token.is_empty() {
                updated = updated.with_resume_token(change.resume_token.clone(), remote_version);
            }
            writes.write_target(updated.clone(), target_cache.matching_keys(*target_id));
            target_cache.save(updated);
        }

        let mut remote_documents = self.remote_documents.clone();
        let mut changed = BTreeSet::new();
        let mut index_updates = Vec::new();
        for (key, document) in &event.document_updates {
            let existing = remote_documents.get(key);
            let cached = remote_documents.contains(key);
            if document.is_missing() && document.version().is_min() {
                // Synthesized deletes at min mean access was lost; forget the entry.
                remote_documents.remove(key);
                writes.remove_document(key.clone());
                index_updates.push(document.clone());
                changed.insert(key.clone());
            } else if !cached
                || document.version() > existing.version()
                || (document.version() == existing.version() && existing.has_unconfirmed_writes())
            {
                remote_documents.add(document.clone(), remote_version);
                writes.put_document(document.clone().with_read_time(remote_version));
                index_updates.push(document.clone());
                changed.insert(key.clone());
            } else {
                log::debug!(
                    "ignoring outdated watch update for {key}: cached {:?}, received {:?}",
                    existing.version(),
                    document.version()
                );
            }
        }

        // Pending transforms resolve against the base, so every pending key
        // whose base moved is replayed again.
        let rebased: BTreeSet<DocumentKey> = changed
            .iter()
            .filter(|key| self.mutation_queue.contains_key(key))
            .cloned()
            .collect();
        let overlays = recalculate_overlays(&self.mutation_queue, &remote_documents, &rebased)?;

        self.persist("apply_remote_event", writes).await?;

        self.target_cache = target_cache;
        self.remote_documents = remote_documents;
        self.overlays.apply(overlays);
        for document in &index_updates {
            if document.is_missing() && document.version().is_min() {
                self.index_manager.remove(document.key());
            } else {
                self.index_manager.update(document);
            }
        }
        for key in changed.iter().chain(&touched_keys).chain(&event.resolved_limbo_documents) {
            self.references.touch(key, sequence);
        }
        if remote_version > self.last_remote_snapshot_version {
            self.last_remote_snapshot_version = remote_version;
        }

        self.local_documents().get_documents(&changed)
    }

    /// Records which keys each view displays and advances the limbo-free
    /// version of targets whose views are in sync.
    pub fn notify_local_view_changes(&mut self, changes: &[LocalViewChanges]) {
        for change in changes {
            for key in &change.added_keys {
                self.view_references.insert((key.clone(), change.target_id));
            }
            for key in &change.removed_keys {
                self.view_references.remove(&(key.clone(), change.target_id));
            }
            if change.from_cache {
                continue;
            }
            if let Some(data) = self.target_cache.get(change.target_id).cloned() {
                let version = data.snapshot_version;
                self.target_cache
                    .save(data.with_last_limbo_free_snapshot_version(version));
            }
        }
    }

    /// Assigns a target to `query`, reusing the cached one (and its resume
    /// token) when the query was listened to before.
    pub async fn allocate_target(&mut self, query: &Query) -> ReplicaResult<TargetData> {
        let sequence = self.references.next_sequence_number();
        let data = match self.target_cache.get_by_canonical_id(&query.canonical_id()) {
            Some(existing) => existing.clone().with_sequence_number(sequence),
            None => TargetData::new(
                query.clone(),
                self.target_cache.allocate_target_id(),
                TargetPurpose::Listen,
                sequence,
            ),
        };

        let mut writes = WriteSet::default();
        writes.write_target(data.clone(), self.target_cache.matching_keys(data.target_id));
        self.persist("allocate_target", writes).await?;

        self.target_cache.save(data.clone());
        self.active_targets.insert(data.target_id);
        Ok(data)
    }

    /// Stops tracking `target_id` as active. The target stays cached for a
    /// later resume until garbage collection removes it.
    pub async fn release_target(&mut self, target_id: TargetId) -> ReplicaResult<()> {
        if !self.active_targets.remove(&target_id) {
            return Err(internal_error(format!("Target {target_id} is not active")));
        }
        self.view_references
            .retain(|(_, referencing)| *referencing != target_id);

        let Some(data) = self.target_cache.get(target_id).cloned() else {
            return Ok(());
        };
        let data = data.with_sequence_number(self.references.next_sequence_number());
        let mut writes = WriteSet::default();
        writes.write_target(data.clone(), self.target_cache.matching_keys(target_id));
        self.persist("release_target", writes).await?;
        self.target_cache.save(data);
        Ok(())
    }

    pub fn execute_query(&self, query: &Query, use_previous_results: bool) -> ReplicaResult<QueryResult> {
        let target = self.target_cache.get_by_canonical_id(&query.canonical_id());
        let remote_keys = target
            .map(|data| self.target_cache.matching_keys(data.target_id))
            .unwrap_or_default();
        let previous = match target {
            Some(data) if use_previous_results => Some(PreviousResults {
                remote_keys: remote_keys.clone(),
                last_limbo_free_snapshot_version: data.last_limbo_free_snapshot_version,
            }),
            _ => None,
        };
        let mut result = query_engine::execute_query(
            query,
            self.local_documents(),
            &self.index_manager,
            previous.as_ref(),
        )?;
        result.remote_keys = remote_keys;
        Ok(result)
    }

    pub fn read_document(&self, key: &DocumentKey) -> ReplicaResult<Document> {
        self.local_documents().get_document(key)
    }

    pub fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.target_cache.matching_keys(target_id)
    }

    pub fn target_data(&self, target_id: TargetId) -> Option<&TargetData> {
        self.target_cache.get(target_id)
    }

    /// First pending batch after `after`; pass [`BATCH_ID_UNKNOWN`] for the head.
    pub fn next_mutation_batch(&self, after: BatchId) -> Option<MutationBatch> {
        self.mutation_queue.next_batch_after(after).cloned()
    }

    pub fn highest_unacknowledged_batch_id(&self) -> BatchId {
        self.mutation_queue.highest_batch_id()
    }

    pub fn has_pending_batches(&self) -> bool {
        self.mutation_queue.next_batch_after(BATCH_ID_UNKNOWN).is_some()
    }

    /// Removes inactive targets and orphaned documents whose sequence number
    /// is at or below the `percentile` threshold. Documents referenced by a
    /// cached target, a pending batch, a displayed view or `pinned` survive.
    pub async fn collect_garbage(
        &mut self,
        percentile: u32,
        pinned: &BTreeSet<DocumentKey>,
    ) -> ReplicaResult<CollectionResult> {
        let sequence = self.references.next_sequence_number();
        let orphaned: Vec<(DocumentKey, u64)> = self
            .remote_documents
            .keys()
            .filter(|key| !self.target_cache.contains_key(key))
            .filter(|key| !self.is_pinned(key, pinned))
            .map(|key| (key.clone(), self.references.sequence_number(key).unwrap_or(0)))
            .collect();

        let mut sequence_numbers: Vec<u64> = self
            .target_cache
            .targets()
            .map(|data| data.sequence_number)
            .collect();
        sequence_numbers.extend(orphaned.iter().map(|(_, sequence)| *sequence));
        let Some(threshold) = nth_sequence_number(sequence_numbers, percentile)? else {
            return Ok(CollectionResult::default());
        };

        let removed_targets: Vec<TargetId> = self
            .target_cache
            .targets()
            .filter(|data| !self.active_targets.contains(&data.target_id))
            .filter(|data| data.sequence_number <= threshold)
            .map(|data| data.target_id)
            .collect();
        let removed_docs: Vec<DocumentKey> = orphaned
            .into_iter()
            .filter(|(_, stamped)| *stamped <= threshold)
            .map(|(key, _)| key)
            .collect();

        let mut writes = WriteSet::default();
        for target_id in &removed_targets {
            writes.remove_target(*target_id);
        }
        for key in &removed_docs {
            writes.remove_document(key.clone());
        }
        self.persist("collect_garbage", writes).await?;

        for target_id in &removed_targets {
            for key in self.target_cache.remove(*target_id) {
                self.references.touch(&key, sequence);
            }
        }
        for key in &removed_docs {
            self.remote_documents.remove(key);
            self.index_manager.remove(key);
            self.references.remove(key);
        }

        let result = CollectionResult {
            removed_docs: removed_docs.len(),
            removed_targets: removed_targets.len(),
        };
        log::debug!(
            "garbage collection at sequence {threshold} removed {} documents and {} targets",
            result.removed_docs,
            result.removed_targets
        );
        Ok(result)
    }

    fn is_pinned(&self, key: &DocumentKey, pinned: &BTreeSet<DocumentKey>) -> bool {
        pinned.contains(key)
            || self.mutation_queue.contains_key(key)
            || self
                .view_references
                .range((key.clone(), TargetId::MIN)..=(key.clone(), TargetId::MAX))
                .next()
                .is_some()
    }

    fn local_documents(&self) -> LocalDocumentsView<'_> {
        LocalDocumentsView::new(&self.remote_documents, &self.overlays)
    }

    async fn persist(&mut self, label: &str, writes: WriteSet) -> ReplicaResult<()> {
        if writes.is_empty() || self.storage_mode == StorageMode::NetworkOnly {
            return Ok(());
        }
        let persistence = Arc::clone(&self.persistence);
        let committed = retry_storage(&self.storage_retry, label, || {
            commit_writes(Arc::clone(&persistence), label, &writes)
        })
        .await?;
        if committed.is_none() {
            self.enter_network_only(label);
        }
        Ok(())
    }

    fn enter_network_only(&mut self, label: &str) {
        log::warn!("persistence unavailable during {label}; continuing without local storage");
        self.storage_mode = StorageMode::NetworkOnly;
    }
}

struct PersistedState {
    batches: Vec<MutationBatch>,
    targets: Vec<PersistedTarget>,
    documents: Vec<Document>,
}

async fn read_persisted_state(persistence: Arc<dyn Persistence>) -> ReplicaResult<PersistedState> {
    let mut txn = persistence.begin("hydrate").await?;
    let batches = txn.read_mutation_batches(BATCH_ID_UNKNOWN).await?;
    let targets = txn.read_targets().await?;
    let mut keys: BTreeSet<DocumentKey> = batches.iter().flat_map(MutationBatch::keys).collect();
    for target in &targets {
        keys.extend(target.remote_keys.iter().cloned());
    }
    let keys: Vec<DocumentKey> = keys.into_iter().collect();
    let documents = txn.read_documents(&keys).await?;
    Ok(PersistedState {
        batches,
        targets,
        documents,
    })
}

async fn commit_writes(
    persistence: Arc<dyn Persistence>,
    label: &str,
    writes: &WriteSet,
) -> ReplicaResult<()> {
    let mut txn = persistence.begin(label).await?;
    writes.apply(txn.as_mut()).await?;
    txn.commit().await
}

/// Runs `operation` until it succeeds, fails with a non-storage error, or
/// exhausts the configured attempts. `Ok(None)` means storage stayed
/// unavailable.
async fn retry_storage<T, F, Fut>(
    settings: &StorageRetrySettings,
    label: &str,
    mut operation: F,
) -> ReplicaResult<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ReplicaResult<T>>,
{
    let max_attempts = settings.max_attempts.max(1);
    let mut delay = Duration::from_millis(settings.delay_ms);
    for attempt in 1..=max_attempts {
        match operation().await {
            Ok(value) => return Ok(Some(value)),
            Err(err) if err.code == ReplicaErrorCode::StorageUnavailable => {
                log::warn!("{label} failed (attempt {attempt}/{max_attempts}): {err}");
                if attempt < max_attempts {
                    runtime::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
            }
            Err(err) => return Err(err),
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::memory_persistence::MemoryPersistence;
    use crate::model::{MutationResult, TransformOperation};
    use crate::remote::TargetChange;
    use crate::value::{MapValue, Value};
    use serde_json::json;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn map(json: serde_json::Value) -> MapValue {
        Value::from_json(&json).as_map().unwrap().clone()
    }

    fn version(micros: i64) -> SnapshotVersion {
        SnapshotVersion::from_micros(micros)
    }

    fn store(persistence: &MemoryPersistence) -> LocalStore {
        LocalStore::new(
            Arc::new(persistence.clone()),
            StorageRetrySettings {
                max_attempts: 2,
                delay_ms: 0,
            },
            &[],
        )
        .unwrap()
    }

    fn ack(batch: MutationBatch, commit: i64) -> MutationBatchResult {
        let results = batch
            .mutations
            .iter()
            .map(|_| MutationResult::new(version(commit)))
            .collect();
        MutationBatchResult::new(batch, version(commit), results).unwrap()
    }

    fn event_for(target_id: TargetId, snapshot: i64, documents: Vec<Document>) -> RemoteEvent {
        let mut change = TargetChange {
            resume_token: ResumeToken::from(b"token".as_slice()),
            current: true,
            ..TargetChange::default()
        };
        let mut event = RemoteEvent {
            snapshot_version: version(snapshot),
            ..RemoteEvent::default()
        };
        for document in documents {
            change.added_documents.insert(document.key().clone());
            event.document_updates.insert(document.key().clone(), document);
        }
        event.target_changes.insert(target_id, change);
        event
    }

    #[tokio::test]
    async fn local_write_is_visible_and_persisted() {
        let persistence = MemoryPersistence::new();
        let mut store = store(&persistence);
        store.start().await.unwrap();

        let result = store
            .write_locally(vec![Mutation::set(key("rooms/a"), map(json!({"name": "a"})))])
            .await
            .unwrap();
        let document = &result.changes[&key("rooms/a")];
        assert!(document.is_found());
        assert!(document.has_pending_writes());
        assert_eq!(persistence.batch_ids(), vec![result.batch_id]);
    }

    #[tokio::test]
    async fn acknowledged_write_moves_into_remote_cache() {
        let persistence = MemoryPersistence::new();
        let mut store = store(&persistence);
        store.start().await.unwrap();
        store
            .write_locally(vec![Mutation::set(key("rooms/a"), map(json!({"name": "a"})))])
            .await
            .unwrap();

        let batch = store.next_mutation_batch(BATCH_ID_UNKNOWN).unwrap();
        let changes = store.acknowledge_batch(&ack(batch, 7)).await.unwrap();
        let document = &changes[&key("rooms/a")];
        assert!(!document.has_pending_writes());
        assert_eq!(document.version(), version(7));
        assert!(!store.has_pending_batches());
        assert!(persistence.document(&key("rooms/a")).is_some());
    }

    #[tokio::test]
    async fn rejected_write_restores_remote_base() {
        let persistence = MemoryPersistence::new();
        let mut store = store(&persistence);
        store.start().await.unwrap();
        let write = store
            .write_locally(vec![Mutation::delete(key("rooms/a"))])
            .await
            .unwrap();

        let changes = store.reject_batch(write.batch_id).await.unwrap();
        let document = &changes[&key("rooms/a")];
        assert!(document.is_missing());
        assert!(!document.has_pending_writes());
        assert!(persistence.batch_ids().is_empty());
    }

    #[tokio::test]
    async fn remote_event_updates_targets_and_documents() {
        let persistence = MemoryPersistence::new();
        let mut store = store(&persistence);
        store.start().await.unwrap();
        let query = Query::collection("rooms").unwrap();
        let target = store.allocate_target(&query).await.unwrap();

        let doc = Document::found(key("rooms/a"), version(3), map(json!({"n": 1})));
        let changes = store
            .apply_remote_event(&event_for(target.target_id, 3, vec![doc]))
            .await
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(
            store.remote_keys_for_target(target.target_id),
            BTreeSet::from([key("rooms/a")])
        );
        let data = store.target_data(target.target_id).unwrap();
        assert_eq!(data.snapshot_version, version(3));
        assert!(!data.resume_token.is_empty());
        assert_eq!(store.last_remote_snapshot_version(), version(3));

        // An older update for the same key is ignored.
        let stale = Document::found(key("rooms/a"), version(2), map(json!({"n": 0})));
        let changes = store
            .apply_remote_event(&event_for(target.target_id, 4, vec![stale]))
            .await
            .unwrap();
        assert!(changes.is_empty());
    }

    #[tokio::test]
    async fn pending_transforms_follow_a_new_remote_base() {
        let persistence = MemoryPersistence::new();
        let mut store = store(&persistence);
        store.start().await.unwrap();
        let target = store
            .allocate_target(&Query::collection("rooms").unwrap())
            .await
            .unwrap();
        let base = Document::found(key("rooms/a"), version(3), map(json!({"n": 1, "tags": ["a"]})));
        store
            .apply_remote_event(&event_for(target.target_id, 3, vec![base]))
            .await
            .unwrap();

        let field = |name: &str| crate::model::FieldPath::from_dot_separated(name).unwrap();
        store
            .write_locally(vec![Mutation::patch(key("rooms/a"), map(json!({"seen": true})))
                .with_transform(field("n"), TransformOperation::Increment(Value::from_integer(1)))
                .with_transform(
                    field("tags"),
                    TransformOperation::ArrayUnion(vec![Value::from_string("b")]),
                )])
            .await
            .unwrap();
        let local = store.read_document(&key("rooms/a")).unwrap();
        assert_eq!(local.data(), Some(&map(json!({"n": 2, "tags": ["a", "b"], "seen": true}))));

        let newer = Document::found(key("rooms/a"), version(4), map(json!({"n": 10, "tags": ["c"]})));
        let changes = store
            .apply_remote_event(&event_for(target.target_id, 4, vec![newer]))
            .await
            .unwrap();
        let expected = map(json!({"n": 11, "tags": ["c", "b"], "seen": true}));
        assert_eq!(changes.get(&key("rooms/a")).unwrap().data(), Some(&expected));
        let local = store.read_document(&key("rooms/a")).unwrap();
        assert_eq!(local.data(), Some(&expected));
        assert!(local.has_local_mutations());
    }

    #[tokio::test]
    async fn restart_restores_pending_batches_and_targets() {
        let persistence = MemoryPersistence::new();
        let target_id = {
            let mut store = store(&persistence);
            store.start().await.unwrap();
            let target = store
                .allocate_target(&Query::collection("rooms").unwrap())
                .await
                .unwrap();
            let doc = Document::found(key("rooms/a"), version(3), map(json!({"n": 1})));
            store
                .apply_remote_event(&event_for(target.target_id, 3, vec![doc]))
                .await
                .unwrap();
            store
                .write_locally(vec![Mutation::patch(key("rooms/a"), map(json!({"n": 2})))])
                .await
                .unwrap();
            target.target_id
        };

        let mut restarted = store(&persistence);
        restarted.start().await.unwrap();
        let document = restarted.read_document(&key("rooms/a")).unwrap();
        assert_eq!(document.data(), Some(&map(json!({"n": 2}))));
        assert!(document.has_pending_writes());
        let restored = restarted.target_data(target_id).unwrap();
        assert!(!restored.resume_token.is_empty());

        let next = restarted.write_locally(vec![Mutation::delete(key("rooms/b"))]).await.unwrap();
        assert!(next.batch_id > 1);
    }

    #[tokio::test]
    async fn persistent_failures_switch_to_network_only() {
        let persistence = MemoryPersistence::new();
        let mut store = store(&persistence);
        store.start().await.unwrap();

        persistence.fail_next_commits(1);
        store
            .write_locally(vec![Mutation::delete(key("rooms/a"))])
            .await
            .unwrap();
        assert_eq!(store.storage_mode(), StorageMode::Durable);

        persistence.fail_next_commits(2);
        let write = store
            .write_locally(vec![Mutation::delete(key("rooms/b"))])
            .await
            .unwrap();
        assert_eq!(store.storage_mode(), StorageMode::NetworkOnly);
        assert!(store.read_document(&key("rooms/b")).unwrap().has_pending_writes());
        assert!(!persistence.batch_ids().contains(&write.batch_id));
    }

    #[tokio::test]
    async fn garbage_collection_spares_active_and_pinned_state() {
        let persistence = MemoryPersistence::new();
        let mut store = store(&persistence);
        store.start().await.unwrap();

        let released = store
            .allocate_target(&Query::collection("rooms").unwrap())
            .await
            .unwrap();
        let doc = Document::found(key("rooms/a"), version(3), map(json!({"n": 1})));
        store
            .apply_remote_event(&event_for(released.target_id, 3, vec![doc]))
            .await
            .unwrap();
        store.release_target(released.target_id).await.unwrap();

        let active = store
            .allocate_target(&Query::collection("users").unwrap())
            .await
            .unwrap();

        let first = store.collect_garbage(100, &BTreeSet::new()).await.unwrap();
        assert_eq!(first.removed_targets, 1);
        assert!(store.target_data(active.target_id).is_some());
        assert!(store.target_data(released.target_id).is_none());

        // The released target's documents are orphaned now and go next time.
        let second = store.collect_garbage(100, &BTreeSet::new()).await.unwrap();
        assert_eq!(second.removed_docs, 1);
        assert!(persistence.document(&key("rooms/a")).is_none());
    }
}
