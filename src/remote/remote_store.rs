use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{stream_closed, ReplicaError};
use crate::local::{TargetData, TargetPurpose};
use crate::model::{
    BatchId, DocumentKey, MutationBatch, MutationBatchResult, ResumeToken, SnapshotVersion,
    TargetId,
};
use crate::remote::online_state::{OnlineState, OnlineStateTracker};
use crate::remote::remote_event::RemoteEvent;
use crate::remote::transport::{
    StreamConnection, StreamHandler, TargetSpec, Transport, WatchRequest, WriteRequest,
    WriteResponse,
};
use crate::remote::watch_change::{TargetChangeState, WatchChange};
use crate::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::remote::write_pipeline::WritePipeline;
use crate::settings::ReplicaSettings;
use crate::util::ExponentialBackoff;

/// Something that happened on a stream, routed back onto the engine queue.
///
/// Every event carries the generation of the stream (or restart) it belongs
/// to; events from a generation that is no longer current are dropped.
#[derive(Debug)]
pub enum StreamEvent {
    WatchMessage {
        generation: u64,
        change: WatchChange,
    },
    WatchClosed {
        generation: u64,
        error: Option<ReplicaError>,
    },
    WriteMessage {
        generation: u64,
        response: WriteResponse,
    },
    WriteClosed {
        generation: u64,
        error: Option<ReplicaError>,
    },
    RestartWatch {
        generation: u64,
    },
    RestartWrite {
        generation: u64,
    },
}

/// Where stream callbacks and backoff timers post their events.
pub trait StreamEventSink: Send + Sync + 'static {
    fn deliver(&self, event: StreamEvent);

    fn deliver_after(&self, delay: Duration, event: StreamEvent);
}

/// Read access to local state the remote store needs while handling events.
pub trait RemoteSyncer: Sync {
    /// Keys the server is known to hold for `target_id`.
    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// The first queued batch with an id above `after`.
    fn next_mutation_batch(&self, after: BatchId) -> Option<MutationBatch>;

    fn last_remote_snapshot_version(&self) -> SnapshotVersion;
}

/// Results the sync layer has to apply, in the order they happened.
#[derive(Debug)]
pub enum RemoteOutcome {
    OnlineStateChanged(OnlineState),
    RemoteEvent(RemoteEvent),
    ListenRejected {
        target_id: TargetId,
        error: ReplicaError,
    },
    WriteAcknowledged(MutationBatchResult),
    WriteRejected {
        batch_id: BatchId,
        error: ReplicaError,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    Shutdown,
}

struct ActiveStream<R: Send + 'static> {
    connection: Arc<dyn StreamConnection<R>>,
    generation: u64,
}

struct WatchStreamHandler {
    sink: Arc<dyn StreamEventSink>,
    generation: u64,
}

impl StreamHandler<WatchChange> for WatchStreamHandler {
    fn on_message(&self, change: WatchChange) {
        self.sink.deliver(StreamEvent::WatchMessage {
            generation: self.generation,
            change,
        });
    }

    fn on_close(&self, error: Option<ReplicaError>) {
        self.sink.deliver(StreamEvent::WatchClosed {
            generation: self.generation,
            error,
        });
    }
}

struct WriteStreamHandler {
    sink: Arc<dyn StreamEventSink>,
    generation: u64,
}

impl StreamHandler<WriteResponse> for WriteStreamHandler {
    fn on_message(&self, response: WriteResponse) {
        self.sink.deliver(StreamEvent::WriteMessage {
            generation: self.generation,
            response,
        });
    }

    fn on_close(&self, error: Option<ReplicaError>) {
        self.sink.deliver(StreamEvent::WriteClosed {
            generation: self.generation,
            error,
        });
    }
}

struct ListenMetadata<'a> {
    targets: &'a BTreeMap<TargetId, TargetData>,
    syncer: &'a dyn RemoteSyncer,
}

impl TargetMetadataProvider for ListenMetadata<'_> {
    fn remote_keys(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.syncer.remote_keys_for_target(target_id)
    }

    fn target_data(&self, target_id: TargetId) -> Option<&TargetData> {
        self.targets.get(&target_id)
    }
}

/// Owns the watch and write streams.
///
/// Listened targets are re-sent whenever the watch stream reopens; pending
/// batches are fed to the write stream in id order and resent after a
/// reconnect. Nothing here touches local state directly: results are queued
/// as [`RemoteOutcome`]s and collected with [`RemoteStore::take_outcomes`].
pub struct RemoteStore {
    transport: Arc<dyn Transport>,
    sink: Arc<dyn StreamEventSink>,
    listen_targets: BTreeMap<TargetId, TargetData>,
    watch: Option<ActiveStream<WatchRequest>>,
    write: Option<ActiveStream<WriteRequest>>,
    watch_aggregator: Option<WatchChangeAggregator>,
    write_pipeline: WritePipeline,
    offline_causes: BTreeSet<OfflineCause>,
    online_state: OnlineStateTracker,
    watch_backoff: ExponentialBackoff,
    write_backoff: ExponentialBackoff,
    pending_watch_restart: Option<u64>,
    pending_write_restart: Option<u64>,
    next_generation: u64,
    outcomes: Vec<RemoteOutcome>,
}

impl RemoteStore {
    /// The store starts disabled; `enable_network` opens it up.
    pub fn new(
        transport: Arc<dyn Transport>,
        sink: Arc<dyn StreamEventSink>,
        settings: &ReplicaSettings,
    ) -> Self {
        Self {
            transport,
            sink,
            listen_targets: BTreeMap::new(),
            watch: None,
            write: None,
            watch_aggregator: None,
            write_pipeline: WritePipeline::new(settings.max_pending_writes),
            offline_causes: BTreeSet::from([OfflineCause::UserDisabled]),
            online_state: OnlineStateTracker::new(),
            watch_backoff: ExponentialBackoff::new(settings.stream_backoff),
            write_backoff: ExponentialBackoff::new(settings.stream_backoff),
            pending_watch_restart: None,
            pending_write_restart: None,
            next_generation: 0,
            outcomes: Vec::new(),
        }
    }

    pub fn take_outcomes(&mut self) -> Vec<RemoteOutcome> {
        std::mem::take(&mut self.outcomes)
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state.state()
    }

    pub fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }

    pub fn is_listening(&self, target_id: TargetId) -> bool {
        self.listen_targets.contains_key(&target_id)
    }

    pub fn pending_write_count(&self) -> usize {
        self.write_pipeline.len()
    }

    pub async fn enable_network(&mut self, syncer: &dyn RemoteSyncer) {
        self.offline_causes.remove(&OfflineCause::UserDisabled);
        if !self.can_use_network() {
            return;
        }
        if self.should_start_watch_stream() {
            self.start_watch_stream(syncer).await;
        } else if self.watch.is_none() {
            self.set_online_state(OnlineState::Unknown);
        }
        self.fill_write_pipeline(syncer).await;
    }

    pub async fn disable_network(&mut self) {
        self.offline_causes.insert(OfflineCause::UserDisabled);
        self.close_streams().await;
        self.set_online_state(OnlineState::Offline);
    }

    /// Closes both streams for good.
    pub async fn shutdown(&mut self) {
        self.offline_causes.insert(OfflineCause::Shutdown);
        self.close_streams().await;
        self.set_online_state(OnlineState::Unknown);
    }

    pub async fn listen(&mut self, target: TargetData, syncer: &dyn RemoteSyncer) {
        let target_id = target.target_id;
        if self.listen_targets.contains_key(&target_id) {
            return;
        }
        self.listen_targets.insert(target_id, target.clone());
        if self.should_start_watch_stream() {
            self.start_watch_stream(syncer).await;
        } else if self.watch.is_some() {
            self.send_watch_request(target, syncer).await;
        }
    }

    pub async fn unlisten(&mut self, target_id: TargetId) {
        if self.listen_targets.remove(&target_id).is_none() {
            return;
        }
        if self.watch.is_some() {
            self.send_unwatch_request(target_id).await;
        }
        if self.listen_targets.is_empty() && self.watch.is_none() && self.can_use_network() {
            self.set_online_state(OnlineState::Unknown);
        }
    }

    /// Pulls queued batches into the pipeline and makes sure the write
    /// stream is running while there is something to send.
    pub async fn fill_write_pipeline(&mut self, syncer: &dyn RemoteSyncer) {
        while self.can_use_network() && !self.write_pipeline.is_full() {
            let Some(batch) = syncer.next_mutation_batch(self.write_pipeline.last_batch_id())
            else {
                break;
            };
            self.write_pipeline.push(batch);
        }
        if self.should_start_write_stream() {
            self.start_write_stream().await;
        } else {
            self.send_next_write().await;
        }
    }

    pub async fn handle_stream_event(&mut self, event: StreamEvent, syncer: &dyn RemoteSyncer) {
        match event {
            StreamEvent::WatchMessage { generation, change } => {
                if self.is_current_watch(generation) {
                    self.on_watch_change(change, syncer).await;
                }
            }
            StreamEvent::WatchClosed { generation, error } => {
                if self.is_current_watch(generation) {
                    self.watch = None;
                    let error = error.unwrap_or_else(|| stream_closed("watch stream closed"));
                    self.handle_watch_failure(error);
                }
            }
            StreamEvent::RestartWatch { generation } => {
                if self.pending_watch_restart == Some(generation) {
                    self.pending_watch_restart = None;
                    if self.should_start_watch_stream() {
                        self.start_watch_stream(syncer).await;
                    }
                }
            }
            StreamEvent::WriteMessage {
                generation,
                response,
            } => {
                if self.is_current_write(generation) {
                    self.on_write_response(response).await;
                }
            }
            StreamEvent::WriteClosed { generation, error } => {
                if self.is_current_write(generation) {
                    self.write = None;
                    let error = error.unwrap_or_else(|| stream_closed("write stream closed"));
                    self.handle_write_failure(error);
                }
            }
            StreamEvent::RestartWrite { generation } => {
                if self.pending_write_restart == Some(generation) {
                    self.pending_write_restart = None;
                    self.fill_write_pipeline(syncer).await;
                }
            }
        }
    }

    fn is_current_watch(&self, generation: u64) -> bool {
        self.watch
            .as_ref()
            .is_some_and(|stream| stream.generation == generation)
    }

    fn is_current_write(&self, generation: u64) -> bool {
        self.write
            .as_ref()
            .is_some_and(|stream| stream.generation == generation)
    }

    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn set_online_state(&mut self, state: OnlineState) {
        let changed = self.online_state.set(state);
        self.record_online_change(changed);
    }

    fn record_online_change(&mut self, changed: Option<OnlineState>) {
        if let Some(state) = changed {
            log::debug!("online state changed to {state:?}");
            self.outcomes.push(RemoteOutcome::OnlineStateChanged(state));
        }
    }

    fn should_start_watch_stream(&self) -> bool {
        self.can_use_network()
            && self.watch.is_none()
            && self.pending_watch_restart.is_none()
            && !self.listen_targets.is_empty()
    }

    fn should_start_write_stream(&self) -> bool {
        self.can_use_network()
            && self.write.is_none()
            && self.pending_write_restart.is_none()
            && !self.write_pipeline.is_empty()
    }

    async fn close_streams(&mut self) {
        if let Some(stream) = self.write.take() {
            stream.connection.close().await;
        }
        if let Some(stream) = self.watch.take() {
            stream.connection.close().await;
        }
        self.pending_watch_restart = None;
        self.pending_write_restart = None;
        self.watch_aggregator = None;
        if !self.write_pipeline.is_empty() {
            log::debug!(
                "dropping {} pipelined batches until the network returns",
                self.write_pipeline.len()
            );
        }
        self.write_pipeline.clear();
    }

    async fn start_watch_stream(&mut self, syncer: &dyn RemoteSyncer) {
        let generation = self.next_generation();
        let handler = Arc::new(WatchStreamHandler {
            sink: Arc::clone(&self.sink),
            generation,
        });
        match self.transport.open_watch_stream(handler).await {
            Ok(connection) => {
                log::debug!("watch stream {generation} open");
                self.watch = Some(ActiveStream {
                    connection,
                    generation,
                });
                self.watch_aggregator = Some(WatchChangeAggregator::new());
                let changed = self.online_state.handle_watch_stream_start();
                self.record_online_change(changed);
                let targets: Vec<TargetData> = self.listen_targets.values().cloned().collect();
                for target in targets {
                    if !self.send_watch_request(target, syncer).await {
                        break;
                    }
                }
            }
            Err(err) => self.handle_watch_failure(err),
        }
    }

    /// False when sending failed and the stream was torn down.
    async fn send_watch_request(&mut self, target: TargetData, syncer: &dyn RemoteSyncer) -> bool {
        let Some(stream) = self.watch.as_ref() else {
            return false;
        };
        let connection = Arc::clone(&stream.connection);
        if let Some(aggregator) = self.watch_aggregator.as_mut() {
            aggregator.record_pending_target_request(target.target_id);
        }
        let resumed = !target.resume_token.is_empty() || !target.snapshot_version.is_min();
        let target = if resumed {
            let count = syncer.remote_keys_for_target(target.target_id).len();
            let count = u32::try_from(count).unwrap_or(u32::MAX);
            target.with_expected_count(Some(count))
        } else {
            target
        };
        let request = WatchRequest::AddTarget(TargetSpec {
            target_id: target.target_id,
            query: target.query,
            resume_token: target.resume_token,
            snapshot_version: target.snapshot_version,
            expected_count: target.expected_count,
        });
        match connection.send(request).await {
            Ok(()) => true,
            Err(err) => {
                self.tear_down_watch(err).await;
                false
            }
        }
    }

    async fn send_unwatch_request(&mut self, target_id: TargetId) -> bool {
        let Some(stream) = self.watch.as_ref() else {
            return false;
        };
        let connection = Arc::clone(&stream.connection);
        if let Some(aggregator) = self.watch_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        match connection.send(WatchRequest::RemoveTarget(target_id)).await {
            Ok(()) => true,
            Err(err) => {
                self.tear_down_watch(err).await;
                false
            }
        }
    }

    async fn on_watch_change(&mut self, change: WatchChange, syncer: &dyn RemoteSyncer) {
        self.watch_backoff.reset();
        self.set_online_state(OnlineState::Online);

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == TargetChangeState::Remove {
                if let Some(cause) = &target_change.cause {
                    self.handle_target_error(&target_change.target_ids, cause);
                    return;
                }
            }
        }

        let snapshot_version = match &change {
            WatchChange::TargetChange(target_change) if target_change.target_ids.is_empty() => {
                target_change.read_time
            }
            _ => SnapshotVersion::min(),
        };

        let metadata = ListenMetadata {
            targets: &self.listen_targets,
            syncer,
        };
        let Some(aggregator) = self.watch_aggregator.as_mut() else {
            return;
        };
        if let Err(err) = aggregator.handle_watch_change(change, &metadata) {
            log::warn!("closing watch stream after invalid message: {err}");
            self.tear_down_watch(err).await;
            return;
        }

        if !snapshot_version.is_min() && snapshot_version >= syncer.last_remote_snapshot_version()
        {
            self.raise_watch_snapshot(snapshot_version, syncer).await;
        }
    }

    async fn raise_watch_snapshot(
        &mut self,
        snapshot_version: SnapshotVersion,
        syncer: &dyn RemoteSyncer,
    ) {
        let metadata = ListenMetadata {
            targets: &self.listen_targets,
            syncer,
        };
        let Some(aggregator) = self.watch_aggregator.as_mut() else {
            return;
        };
        let event = aggregator.create_remote_event(snapshot_version, &metadata);

        for (target_id, change) in &event.target_changes {
            if change.resume_token.is_empty() {
                continue;
            }
            if let Some(target) = self.listen_targets.remove(target_id) {
                let target = target.with_resume_token(change.resume_token.clone(), snapshot_version);
                self.listen_targets.insert(*target_id, target);
            }
        }

        for target_id in &event.target_resets {
            let Some(target) = self.listen_targets.remove(target_id) else {
                continue;
            };
            let previous_version = target.snapshot_version;
            let target = target.with_resume_token(ResumeToken::empty(), previous_version);
            self.listen_targets.insert(*target_id, target.clone());
            log::debug!("re-listening to target {target_id} after an existence filter mismatch");
            if !self.send_unwatch_request(*target_id).await {
                break;
            }
            let relisten = TargetData::new(
                target.query,
                *target_id,
                TargetPurpose::ExistenceFilterMismatch,
                target.sequence_number,
            );
            if !self.send_watch_request(relisten, syncer).await {
                break;
            }
        }

        self.outcomes.push(RemoteOutcome::RemoteEvent(event));
    }

    fn handle_target_error(&mut self, target_ids: &[TargetId], error: &ReplicaError) {
        for target_id in target_ids {
            if self.listen_targets.remove(target_id).is_none() {
                continue;
            }
            if let Some(aggregator) = self.watch_aggregator.as_mut() {
                aggregator.remove_target(*target_id);
            }
            log::warn!("server rejected target {target_id}: {error}");
            self.outcomes.push(RemoteOutcome::ListenRejected {
                target_id: *target_id,
                error: error.clone(),
            });
        }
    }

    async fn tear_down_watch(&mut self, error: ReplicaError) {
        if let Some(stream) = self.watch.take() {
            stream.connection.close().await;
        }
        self.handle_watch_failure(error);
    }

    fn handle_watch_failure(&mut self, error: ReplicaError) {
        self.watch = None;
        self.watch_aggregator = None;
        if self.can_use_network() && !self.listen_targets.is_empty() {
            log::warn!("watch stream failed: {error}");
            let changed = self.online_state.handle_watch_stream_failure();
            self.record_online_change(changed);
            let generation = self.next_generation();
            self.pending_watch_restart = Some(generation);
            let delay = self.watch_backoff.next_delay();
            log::debug!("restarting watch stream in {delay:?}");
            self.sink
                .deliver_after(delay, StreamEvent::RestartWatch { generation });
        } else {
            self.set_online_state(OnlineState::Unknown);
        }
    }

    async fn start_write_stream(&mut self) {
        let generation = self.next_generation();
        let handler = Arc::new(WriteStreamHandler {
            sink: Arc::clone(&self.sink),
            generation,
        });
        match self.transport.open_write_stream(handler).await {
            Ok(connection) => {
                log::debug!("write stream {generation} open");
                self.write = Some(ActiveStream {
                    connection,
                    generation,
                });
                self.write_pipeline.reset_in_flight();
                self.send_next_write().await;
            }
            Err(err) => self.handle_write_failure(err),
        }
    }

    async fn send_next_write(&mut self) {
        let Some(stream) = self.write.as_ref() else {
            return;
        };
        let connection = Arc::clone(&stream.connection);
        let Some(batch) = self.write_pipeline.next_to_send() else {
            return;
        };
        let request = WriteRequest {
            batch_id: batch.batch_id,
            mutations: batch.mutations,
        };
        if let Err(err) = connection.send(request).await {
            self.tear_down_write(err).await;
        }
    }

    async fn on_write_response(&mut self, response: WriteResponse) {
        let outcome = match response {
            WriteResponse::Ack {
                batch_id,
                commit_version,
                results,
            } => self
                .write_pipeline
                .in_flight_batch(batch_id)
                .and_then(|batch| MutationBatchResult::new(batch.clone(), commit_version, results))
                .map(RemoteOutcome::WriteAcknowledged),
            WriteResponse::Reject { batch_id, error } => self
                .write_pipeline
                .in_flight_batch(batch_id)
                .map(|_| RemoteOutcome::WriteRejected { batch_id, error }),
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                log::warn!("closing write stream after invalid response: {err}");
                self.tear_down_write(err).await;
                return;
            }
        };
        let batch_id = match &outcome {
            RemoteOutcome::WriteAcknowledged(result) => result.batch.batch_id,
            RemoteOutcome::WriteRejected { batch_id, .. } => *batch_id,
            _ => return,
        };
        if let Err(err) = self.write_pipeline.pop_head(batch_id) {
            self.tear_down_write(err).await;
            return;
        }
        self.write_backoff.reset();
        self.outcomes.push(outcome);
        self.send_next_write().await;
    }

    async fn tear_down_write(&mut self, error: ReplicaError) {
        if let Some(stream) = self.write.take() {
            stream.connection.close().await;
        }
        self.handle_write_failure(error);
    }

    fn handle_write_failure(&mut self, error: ReplicaError) {
        self.write = None;
        self.write_pipeline.reset_in_flight();
        if !self.can_use_network() || self.write_pipeline.is_empty() {
            return;
        }
        log::warn!("write stream failed: {error}");
        let generation = self.next_generation();
        self.pending_write_restart = Some(generation);
        let delay = self.write_backoff.next_delay();
        log::debug!("restarting write stream in {delay:?}");
        self.sink
            .deliver_after(delay, StreamEvent::RestartWrite { generation });
    }
}
