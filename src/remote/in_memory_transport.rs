use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::{stream_closed, ReplicaError, ReplicaResult};
use crate::model::{BatchId, MutationResult, SnapshotVersion};
use crate::remote::transport::{
    StreamConnection, StreamHandler, Transport, WatchConnection, WatchRequest, WriteConnection,
    WriteRequest, WriteResponse,
};
use crate::remote::watch_change::WatchChange;

struct OpenStream<M> {
    stream_id: u64,
    handler: Arc<dyn StreamHandler<M>>,
}

struct TransportState {
    reachable: bool,
    next_stream_id: u64,
    watch: Option<OpenStream<WatchChange>>,
    write: Option<OpenStream<WriteResponse>>,
    watch_requests: Vec<WatchRequest>,
    write_requests: Vec<WriteRequest>,
    watch_opens: usize,
    write_opens: usize,
}

impl Default for TransportState {
    fn default() -> Self {
        Self {
            reachable: true,
            next_stream_id: 0,
            watch: None,
            write: None,
            watch_requests: Vec::new(),
            write_requests: Vec::new(),
            watch_opens: 0,
            write_opens: 0,
        }
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<TransportState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TransportState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Scriptable [`Transport`] standing in for the backend.
///
/// Requests sent by the engine are recorded; server messages are injected
/// with the `push_*`, `ack_write` and `reject_write` helpers. Clones share
/// the same streams.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    shared: Arc<Shared>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// An unreachable transport refuses to open streams and drops open ones.
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.lock().reachable = reachable;
        if !reachable {
            self.close_watch(Some(stream_closed("backend unreachable")));
            self.close_write(Some(stream_closed("backend unreachable")));
        }
    }

    pub fn is_watch_open(&self) -> bool {
        self.shared.lock().watch.is_some()
    }

    pub fn is_write_open(&self) -> bool {
        self.shared.lock().write.is_some()
    }

    pub fn watch_open_count(&self) -> usize {
        self.shared.lock().watch_opens
    }

    pub fn write_open_count(&self) -> usize {
        self.shared.lock().write_opens
    }

    pub fn watch_requests(&self) -> Vec<WatchRequest> {
        self.shared.lock().watch_requests.clone()
    }

    pub fn write_requests(&self) -> Vec<WriteRequest> {
        self.shared.lock().write_requests.clone()
    }

    pub fn clear_requests(&self) {
        let mut state = self.shared.lock();
        state.watch_requests.clear();
        state.write_requests.clear();
    }

    /// Delivers a watch message; returns false when no watch stream is open.
    pub fn push_watch(&self, change: WatchChange) -> bool {
        let handler = self.shared.lock().watch.as_ref().map(|open| Arc::clone(&open.handler));
        match handler {
            Some(handler) => {
                handler.on_message(change);
                true
            }
            None => false,
        }
    }

    /// Acknowledges a sent batch, with one result per mutation at
    /// `commit_version`.
    pub fn ack_write(&self, batch_id: BatchId, commit_version: SnapshotVersion) -> bool {
        let mutation_count = self
            .shared
            .lock()
            .write_requests
            .iter()
            .rev()
            .find(|request| request.batch_id == batch_id)
            .map(|request| request.mutations.len());
        let Some(mutation_count) = mutation_count else {
            return false;
        };
        self.push_write(WriteResponse::Ack {
            batch_id,
            commit_version,
            results: vec![MutationResult::new(commit_version); mutation_count],
        })
    }

    pub fn reject_write(&self, batch_id: BatchId, error: ReplicaError) -> bool {
        self.push_write(WriteResponse::Reject { batch_id, error })
    }

    pub fn push_write(&self, response: WriteResponse) -> bool {
        let handler = self.shared.lock().write.as_ref().map(|open| Arc::clone(&open.handler));
        match handler {
            Some(handler) => {
                handler.on_message(response);
                true
            }
            None => false,
        }
    }

    /// Server-side close of the watch stream.
    pub fn close_watch(&self, error: Option<ReplicaError>) {
        let open = self.shared.lock().watch.take();
        if let Some(open) = open {
            open.handler.on_close(error);
        }
    }

    pub fn close_write(&self, error: Option<ReplicaError>) {
        let open = self.shared.lock().write.take();
        if let Some(open) = open {
            open.handler.on_close(error);
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn open_watch_stream(
        &self,
        handler: Arc<dyn StreamHandler<WatchChange>>,
    ) -> ReplicaResult<WatchConnection> {
        let mut state = self.shared.lock();
        if !state.reachable {
            return Err(stream_closed("backend unreachable"));
        }
        state.next_stream_id += 1;
        state.watch_opens += 1;
        let stream_id = state.next_stream_id;
        state.watch = Some(OpenStream { stream_id, handler });
        Ok(Arc::new(InMemoryConnection {
            shared: Arc::clone(&self.shared),
            stream_id,
            kind: StreamKind::Watch,
        }))
    }

    async fn open_write_stream(
        &self,
        handler: Arc<dyn StreamHandler<WriteResponse>>,
    ) -> ReplicaResult<WriteConnection> {
        let mut state = self.shared.lock();
        if !state.reachable {
            return Err(stream_closed("backend unreachable"));
        }
        state.next_stream_id += 1;
        state.write_opens += 1;
        let stream_id = state.next_stream_id;
        state.write = Some(OpenStream { stream_id, handler });
        Ok(Arc::new(InMemoryConnection {
            shared: Arc::clone(&self.shared),
            stream_id,
            kind: StreamKind::Write,
        }))
    }
}

#[derive(Clone, Copy)]
enum StreamKind {
    Watch,
    Write,
}

struct InMemoryConnection {
    shared: Arc<Shared>,
    stream_id: u64,
    kind: StreamKind,
}

impl InMemoryConnection {
    fn is_current(&self, state: &TransportState) -> bool {
        let open_id = match self.kind {
            StreamKind::Watch => state.watch.as_ref().map(|open| open.stream_id),
            StreamKind::Write => state.write.as_ref().map(|open| open.stream_id),
        };
        open_id == Some(self.stream_id)
    }

    fn close_locked(&self, state: &mut TransportState) {
        if !self.is_current(state) {
            return;
        }
        match self.kind {
            StreamKind::Watch => state.watch = None,
            StreamKind::Write => state.write = None,
        }
    }
}

#[async_trait]
impl StreamConnection<WatchRequest> for InMemoryConnection {
    async fn send(&self, request: WatchRequest) -> ReplicaResult<()> {
        let mut state = self.shared.lock();
        if !self.is_current(&state) {
            return Err(stream_closed("watch stream is closed"));
        }
        state.watch_requests.push(request);
        Ok(())
    }

    async fn close(&self) {
        self.close_locked(&mut self.shared.lock());
    }
}

#[async_trait]
impl StreamConnection<WriteRequest> for InMemoryConnection {
    async fn send(&self, request: WriteRequest) -> ReplicaResult<()> {
        let mut state = self.shared.lock();
        if !self.is_current(&state) {
            return Err(stream_closed("write stream is closed"));
        }
        state.write_requests.push(request);
        Ok(())
    }

    async fn close(&self) {
        self.close_locked(&mut self.shared.lock());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        messages: AtomicUsize,
        closes: AtomicUsize,
    }

    impl<M> StreamHandler<M> for Counting {
        fn on_message(&self, _message: M) {
            self.messages.fetch_add(1, Ordering::SeqCst);
        }

        fn on_close(&self, _error: Option<ReplicaError>) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn records_requests_and_delivers_messages() {
        let transport = InMemoryTransport::new();
        let handler = Arc::new(Counting::default());
        let connection = transport
            .open_watch_stream(handler.clone())
            .await
            .unwrap();
        connection.send(WatchRequest::RemoveTarget(2)).await.unwrap();
        assert_eq!(transport.watch_requests(), vec![WatchRequest::RemoveTarget(2)]);

        assert!(transport.push_watch(WatchChange::add_targets(vec![2])));
        assert_eq!(handler.messages.load(Ordering::SeqCst), 1);

        transport.close_watch(None);
        assert_eq!(handler.closes.load(Ordering::SeqCst), 1);
        assert!(connection.send(WatchRequest::RemoveTarget(2)).await.is_err());
        assert!(!transport.push_watch(WatchChange::add_targets(vec![2])));
    }

    #[tokio::test]
    async fn unreachable_backend_refuses_streams() {
        let transport = InMemoryTransport::new();
        transport.set_reachable(false);
        let handler = Arc::new(Counting::default());
        assert!(transport.open_write_stream(handler).await.is_err());
        assert_eq!(transport.write_open_count(), 0);
    }
}
