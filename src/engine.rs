//! The engine handle embedders create, start and terminate.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use async_lock::Mutex;
use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::core::async_queue::AsyncQueue;
use crate::core::event_manager::{
    ListenOptions, ListenerCallbacks, ListenerId, Notification,
};
use crate::core::query::Query;
use crate::core::sync_engine::SyncEngine;
use crate::core::view_snapshot::ViewSnapshot;
use crate::error::{terminated, ReplicaError, ReplicaResult};
use crate::local::{CollectionResult, LocalStore, Persistence, StorageMode};
use crate::model::{BatchId, Document, DocumentKey, Mutation};
use crate::remote::{OnlineState, RemoteStore, StreamEvent, StreamEventSink, Transport};
use crate::settings::ReplicaSettings;

const CREATED: u8 = 0;
const STARTED: u8 = 1;
const TERMINATED: u8 = 2;

struct EngineShared {
    settings: ReplicaSettings,
    queue: AsyncQueue,
    core: Mutex<SyncEngine>,
    lifecycle: AtomicU8,
}

impl EngineShared {
    fn is_terminated(&self) -> bool {
        self.lifecycle.load(Ordering::SeqCst) == TERMINATED
    }

    async fn handle_stream_event(&self, event: StreamEvent) {
        if self.is_terminated() {
            return;
        }
        let notifications = {
            let mut core = self.core.lock().await;
            core.handle_stream_event(event).await;
            core.take_notifications()
        };
        deliver(notifications);
    }

    async fn unlisten(&self, listener_id: ListenerId) {
        if self.is_terminated() {
            return;
        }
        let notifications = {
            let mut core = self.core.lock().await;
            if let Err(err) = core.unlisten(listener_id).await {
                log::warn!("failed to release listener {listener_id}: {err}");
            }
            core.take_notifications()
        };
        deliver(notifications);
    }
}

fn deliver(notifications: Vec<Notification>) {
    for notification in notifications {
        notification.deliver();
    }
}

/// Routes stream callbacks and backoff timers onto the engine queue.
struct EngineSink {
    shared: Weak<EngineShared>,
}

impl EngineSink {
    fn job(&self, event: StreamEvent) -> impl Future<Output = ()> + Send + 'static {
        let shared = self.shared.clone();
        async move {
            if let Some(shared) = shared.upgrade() {
                shared.handle_stream_event(event).await;
            }
        }
    }
}

impl StreamEventSink for EngineSink {
    fn deliver(&self, event: StreamEvent) {
        if let Some(shared) = self.shared.upgrade() {
            shared.queue.enqueue_and_forget(self.job(event));
        }
    }

    fn deliver_after(&self, delay: Duration, event: StreamEvent) {
        if let Some(shared) = self.shared.upgrade() {
            shared.queue.enqueue_after_delay(delay, self.job(event));
        }
    }
}

/// Handle to one replica engine.
///
/// Every operation is executed on the engine's serial queue, so calls made
/// from different tasks are applied in the order they were issued. Cloning
/// the handle shares the engine.
#[derive(Clone)]
pub struct ReplicaEngine {
    shared: Arc<EngineShared>,
}

impl ReplicaEngine {
    pub fn new(
        settings: ReplicaSettings,
        persistence: Arc<dyn Persistence>,
        transport: Arc<dyn Transport>,
    ) -> ReplicaResult<Self> {
        settings.validate()?;
        let local_store = LocalStore::new(
            persistence,
            settings.storage_retry,
            &settings.field_indexes,
        )?;
        let shared = Arc::new_cyclic(|weak: &Weak<EngineShared>| {
            let sink = Arc::new(EngineSink {
                shared: weak.clone(),
            });
            let remote_store = RemoteStore::new(transport, sink, &settings);
            let core = SyncEngine::new(
                local_store,
                remote_store,
                settings.max_concurrent_limbo_resolutions,
            );
            EngineShared {
                settings: settings.clone(),
                queue: AsyncQueue::new(),
                core: Mutex::new(core),
                lifecycle: AtomicU8::new(CREATED),
            }
        });
        Ok(Self { shared })
    }

    /// Hydrates local state from persistence and connects when
    /// `network_enabled` is set. Starting twice is a no-op.
    pub async fn start(&self) -> ReplicaResult<()> {
        match self.shared.lifecycle.load(Ordering::SeqCst) {
            STARTED => return Ok(()),
            TERMINATED => return Err(terminated("The engine has been terminated")),
            _ => {}
        }
        let network_enabled = self.shared.settings.network_enabled;
        self.run_unchecked(move |core| core.start(network_enabled).boxed())
            .await?;
        self.shared.lifecycle.store(STARTED, Ordering::SeqCst);
        log::debug!("replica engine started");
        Ok(())
    }

    /// Listens to `query`. The first snapshot is raised once the results
    /// are known, and again after every change. Dropping the registration
    /// stops the listener.
    pub async fn listen<S, E>(
        &self,
        query: Query,
        options: ListenOptions,
        on_snapshot: S,
        on_error: E,
    ) -> ReplicaResult<ListenerRegistration>
    where
        S: Fn(ViewSnapshot) + Send + Sync + 'static,
        E: Fn(ReplicaError) + Send + Sync + 'static,
    {
        let callbacks = ListenerCallbacks::new(Arc::new(on_snapshot), Arc::new(on_error));
        let registered = Arc::clone(&callbacks);
        let listener_id = self
            .run(move |core| core.listen(query, options, registered).boxed())
            .await?;
        Ok(ListenerRegistration {
            shared: Arc::downgrade(&self.shared),
            listener_id,
            callbacks,
            detached: false,
        })
    }

    /// Applies `mutations` locally as one batch. The returned future
    /// completes when the server acknowledges or rejects the batch.
    pub async fn enqueue_mutations(&self, mutations: Vec<Mutation>) -> ReplicaResult<PendingWrite> {
        let (batch_id, receiver) = self
            .run(move |core| core.write(mutations).boxed())
            .await?;
        Ok(PendingWrite { batch_id, receiver })
    }

    /// Runs `query` against the local cache only.
    pub async fn get_from_cache(&self, query: Query) -> ReplicaResult<ViewSnapshot> {
        self.run(move |core| async move { core.get_from_cache(&query) }.boxed())
            .await
    }

    pub async fn get_document_from_cache(&self, key: DocumentKey) -> ReplicaResult<Document> {
        self.run(move |core| async move { core.get_document_from_cache(&key) }.boxed())
            .await
    }

    /// Evicts cached documents and targets whose last use is at or below
    /// the `percentile` of tracked sequence numbers.
    pub async fn run_collection(&self, percentile: u32) -> ReplicaResult<CollectionResult> {
        self.run(move |core| core.run_collection(percentile).boxed())
            .await
    }

    pub async fn enable_network(&self) -> ReplicaResult<()> {
        self.run(|core| core.enable_network().boxed()).await
    }

    pub async fn disable_network(&self) -> ReplicaResult<()> {
        self.run(|core| core.disable_network().boxed()).await
    }

    pub async fn online_state(&self) -> ReplicaResult<OnlineState> {
        self.run(|core| async move { Ok(core.online_state()) }.boxed())
            .await
    }

    pub async fn storage_mode(&self) -> ReplicaResult<StorageMode> {
        self.run(|core| async move { Ok(core.storage_mode()) }.boxed())
            .await
    }

    /// Resolves once every operation enqueued before it has run.
    pub async fn flush(&self) -> ReplicaResult<()> {
        self.run(|_| async { Ok(()) }.boxed()).await
    }

    /// Shuts the engine down. Pending writes fail with a terminated error
    /// and listeners stop receiving events.
    pub async fn terminate(&self) -> ReplicaResult<()> {
        if self.shared.lifecycle.swap(TERMINATED, Ordering::SeqCst) == TERMINATED {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let result = self
            .shared
            .queue
            .enqueue(async move {
                shared.core.lock().await.terminate().await;
                Ok(())
            })
            .await;
        self.shared.queue.shutdown();
        log::debug!("replica engine terminated");
        result
    }

    async fn run<T, F>(&self, op: F) -> ReplicaResult<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut SyncEngine) -> BoxFuture<'a, ReplicaResult<T>> + Send + 'static,
    {
        match self.shared.lifecycle.load(Ordering::SeqCst) {
            STARTED => self.run_unchecked(op).await,
            TERMINATED => Err(terminated("The engine has been terminated")),
            _ => Err(terminated("The engine has not been started")),
        }
    }

    async fn run_unchecked<T, F>(&self, op: F) -> ReplicaResult<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut SyncEngine) -> BoxFuture<'a, ReplicaResult<T>> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        self.shared
            .queue
            .enqueue(async move {
                let (result, notifications) = {
                    let mut core = shared.core.lock().await;
                    let result = op(&mut *core).await;
                    (result, core.take_notifications())
                };
                deliver(notifications);
                result
            })
            .await
    }
}

/// Keeps a listener registered. Dropping it (or calling
/// [`ListenerRegistration::detach`]) stops snapshot delivery immediately.
pub struct ListenerRegistration {
    shared: Weak<EngineShared>,
    listener_id: ListenerId,
    callbacks: Arc<ListenerCallbacks>,
    detached: bool,
}

impl ListenerRegistration {
    pub fn listener_id(&self) -> ListenerId {
        self.listener_id
    }

    pub fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        self.callbacks.deactivate();
        if let Some(shared) = self.shared.upgrade() {
            let weak = Arc::downgrade(&shared);
            let listener_id = self.listener_id;
            shared.queue.enqueue_and_forget(async move {
                if let Some(shared) = weak.upgrade() {
                    shared.unlisten(listener_id).await;
                }
            });
        }
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Outcome of an enqueued batch; resolves on server acknowledgement or
/// rejection.
pub struct PendingWrite {
    batch_id: BatchId,
    receiver: oneshot::Receiver<ReplicaResult<()>>,
}

impl PendingWrite {
    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }
}

impl Future for PendingWrite {
    type Output = ReplicaResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(terminated("The engine has been terminated"))),
            Poll::Pending => Poll::Pending,
        }
    }
}
