use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use futures::channel::oneshot;

use crate::core::event_manager::{
    EventManager, ListenOptions, ListenerCallbacks, ListenerId, Notification,
};
use crate::core::query::Query;
use crate::core::view::{LimboDocumentChange, View};
use crate::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::error::{internal_error, terminated, ReplicaError, ReplicaResult};
use crate::local::local_store::DocumentMap;
use crate::local::target_cache::TargetIdGenerator;
use crate::local::{
    CollectionResult, LocalStore, LocalViewChanges, StorageMode, TargetData, TargetPurpose,
};
use crate::model::{
    BatchId, Document, DocumentKey, Mutation, MutationBatch, MutationBatchResult, SnapshotVersion,
    TargetId,
};
use crate::remote::{
    OnlineState, RemoteEvent, RemoteOutcome, RemoteStore, RemoteSyncer, StreamEvent, TargetChange,
};

pub type WriteReceiver = oneshot::Receiver<ReplicaResult<()>>;

/// One active query with its materialized view.
struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

struct LimboResolution {
    key: DocumentKey,
    /// The resolution target delivered the document, so the server holds it.
    received_document: bool,
}

/// Limbo documents waiting for, or being resolved by, a single-document
/// target.
struct LimboTracker {
    target_ids: TargetIdGenerator,
    max_concurrent: usize,
    enqueued: VecDeque<DocumentKey>,
    active_by_key: BTreeMap<DocumentKey, TargetId>,
    active_by_target: BTreeMap<TargetId, LimboResolution>,
    /// Which views display each limbo key.
    references: BTreeSet<(DocumentKey, TargetId)>,
}

impl LimboTracker {
    fn new(max_concurrent: usize) -> Self {
        Self {
            target_ids: TargetIdGenerator::for_sync_engine(),
            max_concurrent,
            enqueued: VecDeque::new(),
            active_by_key: BTreeMap::new(),
            active_by_target: BTreeMap::new(),
            references: BTreeSet::new(),
        }
    }

    fn is_referenced(&self, key: &DocumentKey) -> bool {
        self.references
            .range((key.clone(), TargetId::MIN)..=(key.clone(), TargetId::MAX))
            .next()
            .is_some()
    }

    fn keys_for_target(&self, target_id: TargetId) -> Vec<DocumentKey> {
        self.references
            .iter()
            .filter(|(_, referencing)| *referencing == target_id)
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn enqueue(&mut self, key: DocumentKey) {
        if self.active_by_key.contains_key(&key) || self.enqueued.contains(&key) {
            return;
        }
        log::debug!("new document in limbo: {key}");
        self.enqueued.push_back(key);
    }

    fn keys(&self) -> BTreeSet<DocumentKey> {
        self.active_by_key
            .keys()
            .chain(self.enqueued.iter())
            .cloned()
            .collect()
    }
}

/// What the remote store may read while the sync engine lends it access.
struct SyncerView<'a> {
    local_store: &'a LocalStore,
    query_views: &'a BTreeMap<String, QueryView>,
    queries_by_target: &'a BTreeMap<TargetId, String>,
    limbo: &'a LimboTracker,
}

impl RemoteSyncer for SyncerView<'_> {
    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        if let Some(resolution) = self.limbo.active_by_target.get(&target_id) {
            return if resolution.received_document {
                BTreeSet::from([resolution.key.clone()])
            } else {
                BTreeSet::new()
            };
        }
        match self
            .queries_by_target
            .get(&target_id)
            .and_then(|canonical_id| self.query_views.get(canonical_id))
        {
            Some(query_view) => query_view.view.synced_documents().clone(),
            None => self.local_store.remote_keys_for_target(target_id),
        }
    }

    fn next_mutation_batch(&self, after: BatchId) -> Option<MutationBatch> {
        self.local_store.next_mutation_batch(after)
    }

    fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.local_store.last_remote_snapshot_version()
    }
}

/// Borrows the parts of a [`SyncEngine`] the remote store reads, leaving
/// `remote_store` free for a mutable borrow.
macro_rules! syncer {
    ($engine:expr) => {
        SyncerView {
            local_store: &$engine.local_store,
            query_views: &$engine.query_views,
            queries_by_target: &$engine.queries_by_target,
            limbo: &$engine.limbo,
        }
    };
}

/// Ties the local store, remote store and views together.
///
/// Local writes and remote events both end in [`SyncEngine::emit_new_snapshots`],
/// which recomputes every view and hands the snapshots to the event manager.
/// All methods run on the engine's serial queue.
pub struct SyncEngine {
    local_store: LocalStore,
    remote_store: RemoteStore,
    event_manager: EventManager,
    query_views: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, String>,
    limbo: LimboTracker,
    write_callbacks: BTreeMap<BatchId, oneshot::Sender<ReplicaResult<()>>>,
    online_state: OnlineState,
    next_listener_id: ListenerId,
}

impl SyncEngine {
    pub fn new(
        local_store: LocalStore,
        remote_store: RemoteStore,
        max_concurrent_limbo_resolutions: usize,
    ) -> Self {
        Self {
            local_store,
            remote_store,
            event_manager: EventManager::new(),
            query_views: BTreeMap::new(),
            queries_by_target: BTreeMap::new(),
            limbo: LimboTracker::new(max_concurrent_limbo_resolutions),
            write_callbacks: BTreeMap::new(),
            online_state: OnlineState::Unknown,
            next_listener_id: 1,
        }
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.local_store.storage_mode()
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state
    }

    /// Keys currently in limbo, enqueued or being resolved.
    pub fn limbo_keys(&self) -> BTreeSet<DocumentKey> {
        self.limbo.keys()
    }

    /// Hydrates local state, then brings the network up or keeps it down.
    pub async fn start(&mut self, network_enabled: bool) -> ReplicaResult<()> {
        self.local_store.start().await?;
        if network_enabled {
            self.enable_network().await
        } else {
            self.disable_network().await
        }
    }

    pub async fn listen(
        &mut self,
        query: Query,
        options: ListenOptions,
        callbacks: Arc<ListenerCallbacks>,
    ) -> ReplicaResult<ListenerId> {
        let listener_id = self.next_listener_id;
        self.next_listener_id += 1;

        if !self.event_manager.has_query(&query) {
            let (target_id, snapshot) = self.listen_to_query(&query).await?;
            self.event_manager.add_query(&query, target_id);
            self.event_manager.on_watch_change(vec![snapshot]);
        }
        self.event_manager
            .add_listener(&query, listener_id, options, callbacks);
        self.drain_remote_outcomes().await;
        Ok(listener_id)
    }

    async fn listen_to_query(&mut self, query: &Query) -> ReplicaResult<(TargetId, ViewSnapshot)> {
        let target = self.local_store.allocate_target(query).await?;
        let target_id = target.target_id;
        let result = self.local_store.execute_query(query, true)?;

        let mut view = View::new(query.clone(), result.remote_keys);
        let doc_changes = view.compute_doc_changes(&result.documents, None)?;
        let synthesized = TargetChange {
            resume_token: target.resume_token.clone(),
            current: false,
            ..TargetChange::default()
        };
        let change = view.apply_changes(doc_changes, Some(&synthesized), false);
        self.update_tracked_limbos(target_id, change.limbo_changes)
            .await;
        let snapshot = change
            .snapshot
            .ok_or_else(|| internal_error("A new view must produce a snapshot"))?;

        let canonical_id = query.canonical_id();
        self.queries_by_target
            .insert(target_id, canonical_id.clone());
        self.query_views.insert(
            canonical_id,
            QueryView {
                query: query.clone(),
                target_id,
                view,
            },
        );
        self.remote_store.listen(target, &syncer!(self)).await;
        Ok((target_id, snapshot))
    }

    pub async fn unlisten(&mut self, listener_id: ListenerId) -> ReplicaResult<()> {
        let Some((query, target_id)) = self.event_manager.remove_listener(listener_id) else {
            return Ok(());
        };
        self.query_views.remove(&query.canonical_id());
        self.queries_by_target.remove(&target_id);
        let released = self.local_store.release_target(target_id).await;
        self.remote_store.unlisten(target_id).await;
        self.remove_limbo_references(target_id).await;
        self.drain_remote_outcomes().await;
        released
    }

    /// Applies `mutations` locally as one batch and queues it for the server.
    /// The receiver completes when the server accepts or rejects the batch.
    pub async fn write(
        &mut self,
        mutations: Vec<Mutation>,
    ) -> ReplicaResult<(BatchId, WriteReceiver)> {
        let result = self.local_store.write_locally(mutations).await?;
        let (sender, receiver) = oneshot::channel();
        self.write_callbacks.insert(result.batch_id, sender);
        self.emit_new_snapshots(&result.changes, None).await?;
        self.remote_store.fill_write_pipeline(&syncer!(self)).await;
        self.drain_remote_outcomes().await;
        Ok((result.batch_id, receiver))
    }

    /// One-off query against the local cache, without listening.
    pub fn get_from_cache(&self, query: &Query) -> ReplicaResult<ViewSnapshot> {
        let result = self.local_store.execute_query(query, true)?;
        let mut view = View::new(query.clone(), result.remote_keys);
        let doc_changes = view.compute_doc_changes(&result.documents, None)?;
        view.apply_changes(doc_changes, None, false)
            .snapshot
            .ok_or_else(|| internal_error("A new view must produce a snapshot"))
    }

    pub fn get_document_from_cache(&self, key: &DocumentKey) -> ReplicaResult<Document> {
        self.local_store.read_document(key)
    }

    /// Garbage-collects the local cache. Keys in limbo survive.
    pub async fn run_collection(&mut self, percentile: u32) -> ReplicaResult<CollectionResult> {
        let pinned = self.limbo.keys();
        self.local_store.collect_garbage(percentile, &pinned).await
    }

    pub async fn enable_network(&mut self) -> ReplicaResult<()> {
        self.remote_store.enable_network(&syncer!(self)).await;
        self.drain_remote_outcomes().await;
        Ok(())
    }

    pub async fn disable_network(&mut self) -> ReplicaResult<()> {
        self.remote_store.disable_network().await;
        self.drain_remote_outcomes().await;
        Ok(())
    }

    /// Closes the streams, fails outstanding writes and drops every listener.
    pub async fn terminate(&mut self) {
        self.remote_store.shutdown().await;
        self.remote_store.take_outcomes();
        for (_, callback) in std::mem::take(&mut self.write_callbacks) {
            let _ = callback.send(Err(terminated("The engine was terminated")));
        }
        self.event_manager.clear();
        self.query_views.clear();
        self.queries_by_target.clear();
    }

    pub async fn handle_stream_event(&mut self, event: StreamEvent) {
        self.remote_store
            .handle_stream_event(event, &syncer!(self))
            .await;
        self.drain_remote_outcomes().await;
    }

    pub fn take_notifications(&mut self) -> Vec<Notification> {
        self.event_manager.take_notifications()
    }

    /// Applies everything the remote store produced, including outcomes
    /// raised while applying earlier ones.
    async fn drain_remote_outcomes(&mut self) {
        loop {
            let outcomes = self.remote_store.take_outcomes();
            if outcomes.is_empty() {
                break;
            }
            for outcome in outcomes {
                if let Err(err) = self.apply_remote_outcome(outcome).await {
                    log::warn!("failed to apply remote outcome: {err}");
                }
            }
        }
    }

    async fn apply_remote_outcome(&mut self, outcome: RemoteOutcome) -> ReplicaResult<()> {
        match outcome {
            RemoteOutcome::OnlineStateChanged(state) => {
                self.apply_online_state_change(state);
                Ok(())
            }
            RemoteOutcome::RemoteEvent(event) => self.apply_remote_event(event).await,
            RemoteOutcome::ListenRejected { target_id, error } => {
                self.reject_listen(target_id, error).await
            }
            RemoteOutcome::WriteAcknowledged(result) => self.apply_successful_write(result).await,
            RemoteOutcome::WriteRejected { batch_id, error } => {
                self.reject_failed_write(batch_id, error).await
            }
        }
    }

    fn apply_online_state_change(&mut self, state: OnlineState) {
        if self.online_state == state {
            return;
        }
        self.online_state = state;
        let mut snapshots = Vec::new();
        for query_view in self.query_views.values_mut() {
            let change = query_view.view.apply_online_state_change(state);
            if !change.limbo_changes.is_empty() {
                log::warn!("online state change produced limbo changes for {}", query_view.query);
            }
            snapshots.extend(change.snapshot);
        }
        self.event_manager.on_watch_change(snapshots);
        self.event_manager.on_online_state_change(state);
    }

    async fn apply_remote_event(&mut self, event: RemoteEvent) -> ReplicaResult<()> {
        for (target_id, change) in &event.target_changes {
            let Some(resolution) = self.limbo.active_by_target.get_mut(target_id) else {
                continue;
            };
            let touched = change.added_documents.len()
                + change.modified_documents.len()
                + change.removed_documents.len();
            if touched > 1 {
                log::warn!("limbo target {target_id} changed {touched} documents");
            }
            if !change.added_documents.is_empty() {
                resolution.received_document = true;
            } else if !change.removed_documents.is_empty() {
                resolution.received_document = false;
            }
        }
        let changes = self.local_store.apply_remote_event(&event).await?;
        self.emit_new_snapshots(&changes, Some(&event)).await
    }

    async fn reject_listen(&mut self, target_id: TargetId, error: ReplicaError) -> ReplicaResult<()> {
        if let Some(resolution) = self.limbo.active_by_target.remove(&target_id) {
            // Losing access to a limbo document is treated as a delete.
            let key = resolution.key;
            self.limbo.active_by_key.remove(&key);
            self.pump_limbo_resolutions().await;
            let event = RemoteEvent {
                snapshot_version: SnapshotVersion::min(),
                document_updates: BTreeMap::from([(
                    key.clone(),
                    Document::missing(key.clone(), SnapshotVersion::min()),
                )]),
                resolved_limbo_documents: BTreeSet::from([key]),
                ..RemoteEvent::default()
            };
            return self.apply_remote_event(event).await;
        }

        let Some(canonical_id) = self.queries_by_target.remove(&target_id) else {
            return Ok(());
        };
        let Some(query_view) = self.query_views.remove(&canonical_id) else {
            return Ok(());
        };
        let released = self.local_store.release_target(target_id).await;
        self.remove_limbo_references(target_id).await;
        self.event_manager.on_watch_error(&query_view.query, error);
        released
    }

    async fn apply_successful_write(&mut self, result: MutationBatchResult) -> ReplicaResult<()> {
        let batch_id = result.batch.batch_id;
        let changes = self.local_store.acknowledge_batch(&result).await?;
        self.resolve_write(batch_id, Ok(()));
        self.emit_new_snapshots(&changes, None).await?;
        self.remote_store.fill_write_pipeline(&syncer!(self)).await;
        Ok(())
    }

    async fn reject_failed_write(&mut self, batch_id: BatchId, error: ReplicaError) -> ReplicaResult<()> {
        let changes = self.local_store.reject_batch(batch_id).await?;
        self.resolve_write(batch_id, Err(error));
        self.emit_new_snapshots(&changes, None).await?;
        self.remote_store.fill_write_pipeline(&syncer!(self)).await;
        Ok(())
    }

    fn resolve_write(&mut self, batch_id: BatchId, result: ReplicaResult<()>) {
        match self.write_callbacks.remove(&batch_id) {
            Some(callback) => {
                let _ = callback.send(result);
            }
            None => log::debug!("no write callback registered for batch {batch_id}"),
        }
    }

    /// Recomputes every view against `changes`, raises the resulting
    /// snapshots and records which keys each view now displays.
    async fn emit_new_snapshots(
        &mut self,
        changes: &DocumentMap,
        event: Option<&RemoteEvent>,
    ) -> ReplicaResult<()> {
        let mut snapshots = Vec::new();
        let mut view_changes = Vec::new();
        let mut limbo_updates = Vec::new();

        for query_view in self.query_views.values_mut() {
            let target_id = query_view.target_id;
            let target_change = event.and_then(|event| event.target_changes.get(&target_id));
            if let Some(change) = target_change {
                query_view.view.restore_filtered_documents(change);
            }

            // Documents an existence filter dropped are diffed out of the
            // view now. Limbo resolution is not needed for them.
            let filtered = event.and_then(|event| event.filtered_documents.get(&target_id));
            let with_filtered;
            let view_input = match filtered {
                Some(keys) => {
                    query_view.view.hide_filtered_documents(keys);
                    let mut input = changes.clone();
                    for key in keys {
                        if !input.contains_key(key) {
                            input.insert(key.clone(), self.local_store.read_document(key)?);
                        }
                    }
                    with_filtered = input;
                    &with_filtered
                }
                None => changes,
            };

            let mut doc_changes = query_view.view.compute_doc_changes(view_input, None)?;
            if doc_changes.needs_refill {
                let result = self.local_store.execute_query(&query_view.query, false)?;
                doc_changes = query_view
                    .view
                    .compute_doc_changes(&result.documents, Some(doc_changes))?;
            }
            let pending_reset = event.is_some_and(|event| event.target_resets.contains(&target_id));
            let change = query_view
                .view
                .apply_changes(doc_changes, target_change, pending_reset);
            limbo_updates.push((target_id, change.limbo_changes));
            if let Some(snapshot) = change.snapshot {
                view_changes.push(local_view_changes(target_id, &snapshot));
                snapshots.push(snapshot);
            }
        }

        for (target_id, changes) in limbo_updates {
            self.update_tracked_limbos(target_id, changes).await;
        }
        self.event_manager.on_watch_change(snapshots);
        self.local_store.notify_local_view_changes(&view_changes);
        Ok(())
    }

    async fn update_tracked_limbos(&mut self, target_id: TargetId, changes: Vec<LimboDocumentChange>) {
        for change in changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    self.limbo.references.insert((key.clone(), target_id));
                    self.limbo.enqueue(key);
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("document no longer in limbo: {key}");
                    self.limbo.references.remove(&(key.clone(), target_id));
                    if !self.limbo.is_referenced(&key) {
                        self.remove_limbo_target(&key).await;
                    }
                }
            }
        }
        self.pump_limbo_resolutions().await;
    }

    /// Starts resolution targets for enqueued limbo keys, up to the
    /// concurrency limit.
    async fn pump_limbo_resolutions(&mut self) {
        while self.limbo.active_by_target.len() < self.limbo.max_concurrent {
            let Some(key) = self.limbo.enqueued.pop_front() else {
                break;
            };
            let target_id = self.limbo.target_ids.next();
            log::debug!("listening to limbo document {key} on target {target_id}");
            self.limbo.active_by_key.insert(key.clone(), target_id);
            self.limbo.active_by_target.insert(
                target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            let target = TargetData::new(
                Query::document(&key),
                target_id,
                TargetPurpose::LimboResolution,
                0,
            );
            self.remote_store.listen(target, &syncer!(self)).await;
        }
    }

    async fn remove_limbo_target(&mut self, key: &DocumentKey) {
        self.limbo.enqueued.retain(|enqueued| enqueued != key);
        let Some(target_id) = self.limbo.active_by_key.remove(key) else {
            return;
        };
        log::debug!("stopped listening to limbo document {key} on target {target_id}");
        self.limbo.active_by_target.remove(&target_id);
        self.remote_store.unlisten(target_id).await;
        self.pump_limbo_resolutions().await;
    }

    async fn remove_limbo_references(&mut self, target_id: TargetId) {
        for key in self.limbo.keys_for_target(target_id) {
            self.limbo.references.remove(&(key.clone(), target_id));
            if !self.limbo.is_referenced(&key) {
                self.remove_limbo_target(&key).await;
            }
        }
    }
}

fn local_view_changes(target_id: TargetId, snapshot: &ViewSnapshot) -> LocalViewChanges {
    let mut added_keys = BTreeSet::new();
    let mut removed_keys = BTreeSet::new();
    for change in snapshot.document_changes() {
        match change.change_type {
            ChangeType::Added => {
                added_keys.insert(change.document.key().clone());
            }
            ChangeType::Removed => {
                removed_keys.insert(change.document.key().clone());
            }
            ChangeType::Modified | ChangeType::Metadata => {}
        }
    }
    LocalViewChanges {
        target_id,
        from_cache: snapshot.from_cache(),
        added_keys,
        removed_keys,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::local::MemoryPersistence;
    use crate::model::{ResumeToken, Timestamp};
    use crate::remote::{InMemoryTransport, StreamEventSink, WatchChange, WatchRequest};
    use crate::settings::ReplicaSettings;
    use crate::value::Value;

    #[derive(Default)]
    struct QueueSink {
        events: Mutex<Vec<StreamEvent>>,
    }

    impl StreamEventSink for QueueSink {
        fn deliver(&self, event: StreamEvent) {
            self.events.lock().unwrap().push(event);
        }

        fn deliver_after(&self, _delay: Duration, event: StreamEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    struct Harness {
        engine: SyncEngine,
        sink: Arc<QueueSink>,
        transport: InMemoryTransport,
        seen: Arc<Mutex<Vec<ViewSnapshot>>>,
    }

    impl Harness {
        fn new() -> Self {
            let settings = ReplicaSettings::default();
            let transport = InMemoryTransport::new();
            let sink = Arc::new(QueueSink::default());
            let local_store = LocalStore::new(
                Arc::new(MemoryPersistence::new()),
                settings.storage_retry,
                &settings.field_indexes,
            )
            .unwrap();
            let remote_store = RemoteStore::new(
                Arc::new(transport.clone()),
                sink.clone() as Arc<dyn StreamEventSink>,
                &settings,
            );
            Self {
                engine: SyncEngine::new(local_store, remote_store, 2),
                sink,
                transport,
                seen: Arc::new(Mutex::new(Vec::new())),
            }
        }

        async fn pump(&mut self) {
            loop {
                let events = std::mem::take(&mut *self.sink.events.lock().unwrap());
                if events.is_empty() {
                    break;
                }
                for event in events {
                    self.engine.handle_stream_event(event).await;
                }
            }
            for notification in self.engine.take_notifications() {
                notification.deliver();
            }
        }

        async fn listen(&mut self, query: Query) -> ListenerId {
            let seen = self.seen.clone();
            let callbacks = ListenerCallbacks::new(
                Arc::new(move |snapshot| seen.lock().unwrap().push(snapshot)),
                Arc::new(|_| {}),
            );
            let id = self
                .engine
                .listen(query, ListenOptions::default(), callbacks)
                .await
                .unwrap();
            self.pump().await;
            id
        }

        fn last(&self) -> ViewSnapshot {
            self.seen.lock().unwrap().last().cloned().expect("a snapshot")
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn doc(path: &str, seconds: i64) -> Document {
        let data = Value::from_json(&serde_json::json!({ "n": seconds }));
        Document::found(key(path), version(seconds), data.as_map().unwrap().clone())
    }

    fn token(value: &str) -> ResumeToken {
        ResumeToken::new(value.as_bytes().to_vec())
    }

    fn added_target_ids(transport: &InMemoryTransport) -> Vec<TargetId> {
        transport
            .watch_requests()
            .into_iter()
            .filter_map(|request| match request {
                WatchRequest::AddTarget(spec) => Some(spec.target_id),
                WatchRequest::RemoveTarget(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn server_results_reach_the_listener() {
        let mut h = Harness::new();
        h.engine.start(true).await.unwrap();
        h.listen(Query::collection("rooms").unwrap()).await;
        let target = added_target_ids(&h.transport)[0];

        h.transport.push_watch(WatchChange::add_targets(vec![target]));
        h.transport
            .push_watch(WatchChange::updated(doc("rooms/a", 2), vec![target]));
        h.transport
            .push_watch(WatchChange::current(vec![target], token("t1")));
        h.transport
            .push_watch(WatchChange::snapshot(version(2), token("t1")));
        h.pump().await;

        let snapshot = h.last();
        assert!(!snapshot.from_cache());
        assert_eq!(snapshot.len(), 1);
        assert_eq!(h.engine.online_state(), OnlineState::Online);
    }

    #[tokio::test]
    async fn unconfirmed_document_is_resolved_through_limbo() {
        let mut h = Harness::new();
        h.engine.start(true).await.unwrap();
        h.listen(Query::collection("rooms").unwrap()).await;
        let target = added_target_ids(&h.transport)[0];

        h.transport.push_watch(WatchChange::add_targets(vec![target]));
        h.transport
            .push_watch(WatchChange::updated(doc("rooms/a", 2), vec![target]));
        h.transport
            .push_watch(WatchChange::current(vec![target], token("t1")));
        h.transport
            .push_watch(WatchChange::snapshot(version(2), token("t1")));
        h.pump().await;

        // The server drops "a" from the target without telling us why.
        h.transport
            .push_watch(WatchChange::removed(key("rooms/a"), vec![target]));
        h.transport
            .push_watch(WatchChange::snapshot(version(3), token("t2")));
        h.pump().await;
        assert_eq!(h.engine.limbo_keys(), BTreeSet::from([key("rooms/a")]));

        let limbo_target = *added_target_ids(&h.transport).last().unwrap();
        assert_eq!(limbo_target % 2, 1);
        h.transport.push_watch(WatchChange::add_targets(vec![limbo_target]));
        h.transport
            .push_watch(WatchChange::current(vec![limbo_target], token("l1")));
        h.transport
            .push_watch(WatchChange::snapshot(version(4), token("t3")));
        h.pump().await;

        let snapshot = h.last();
        assert!(snapshot.is_empty());
        assert!(!snapshot.from_cache());
        assert!(h.engine.limbo_keys().is_empty());
    }

    #[tokio::test]
    async fn rejected_listen_reports_error_and_releases_target() {
        let mut h = Harness::new();
        h.engine.start(true).await.unwrap();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let callbacks = ListenerCallbacks::new(
            Arc::new(|_| {}),
            Arc::new(move |err: ReplicaError| sink.lock().unwrap().push(err)),
        );
        h.engine
            .listen(Query::collection("secret").unwrap(), ListenOptions::default(), callbacks)
            .await
            .unwrap();
        let target = added_target_ids(&h.transport)[0];

        let change = crate::remote::WatchTargetChange::new(
            crate::remote::TargetChangeState::Remove,
            vec![target],
        )
        .with_cause(crate::error::permission_denied("denied"));
        h.transport.push_watch(WatchChange::TargetChange(change));
        h.pump().await;

        assert_eq!(errors.lock().unwrap().len(), 1);
        assert!(h.engine.query_views.is_empty());
    }

    #[tokio::test]
    async fn terminate_fails_outstanding_writes() {
        let mut h = Harness::new();
        h.engine.start(false).await.unwrap();
        let (_, receiver) = h
            .engine
            .write(vec![Mutation::delete(key("rooms/a"))])
            .await
            .unwrap();
        h.engine.terminate().await;
        let result = receiver.await.unwrap();
        assert_eq!(
            result.unwrap_err().code,
            crate::error::ReplicaErrorCode::Terminated
        );
    }
}
