#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use firestore_replica::model::TargetId;
use firestore_replica::remote::WatchRequest;
use firestore_replica::{
    DocumentKey, InMemoryTransport, ListenOptions, ListenerRegistration, MapValue,
    MemoryPersistence, Query, ReplicaEngine, ReplicaError, ReplicaSettings, SnapshotVersion,
    Value, ViewSnapshot,
};

pub struct Fixture {
    pub engine: ReplicaEngine,
    pub transport: InMemoryTransport,
    pub persistence: MemoryPersistence,
}

impl Fixture {
    pub async fn online() -> Self {
        Self::with_settings(ReplicaSettings::default()).await
    }

    pub async fn offline() -> Self {
        Self::with_settings(ReplicaSettings {
            network_enabled: false,
            ..ReplicaSettings::default()
        })
        .await
    }

    pub async fn with_settings(settings: ReplicaSettings) -> Self {
        Self::restore(settings, MemoryPersistence::new()).await
    }

    /// Starts an engine over existing persisted state.
    pub async fn restore(settings: ReplicaSettings, persistence: MemoryPersistence) -> Self {
        let transport = InMemoryTransport::new();
        let engine = ReplicaEngine::new(
            settings,
            Arc::new(persistence.clone()),
            Arc::new(transport.clone()),
        )
        .expect("engine");
        engine.start().await.expect("start");
        Self {
            engine,
            transport,
            persistence,
        }
    }

    /// Waits until every queued stream event has been applied.
    pub async fn settle(&self) {
        self.engine.flush().await.expect("flush");
    }

    /// Target id the engine assigned to `query`.
    pub fn target_for(&self, query: &Query) -> TargetId {
        self.transport
            .watch_requests()
            .into_iter()
            .find_map(|request| match request {
                WatchRequest::AddTarget(spec) if &spec.query == query => Some(spec.target_id),
                _ => None,
            })
            .expect("target was sent")
    }

    /// Single-document (limbo resolution) targets in request order.
    pub fn limbo_targets(&self) -> Vec<TargetId> {
        let mut ids: Vec<TargetId> = self
            .transport
            .watch_requests()
            .into_iter()
            .filter_map(|request| match request {
                WatchRequest::AddTarget(spec) if spec.query.is_document_query() => {
                    Some(spec.target_id)
                }
                _ => None,
            })
            .collect();
        ids.dedup();
        ids
    }
}

#[derive(Clone, Default)]
pub struct Recorder {
    snapshots: Arc<Mutex<Vec<ViewSnapshot>>>,
    errors: Arc<Mutex<Vec<ReplicaError>>>,
}

impl Recorder {
    pub async fn listen(&self, engine: &ReplicaEngine, query: Query) -> ListenerRegistration {
        self.listen_with(engine, query, ListenOptions::default()).await
    }

    pub async fn listen_with(
        &self,
        engine: &ReplicaEngine,
        query: Query,
        options: ListenOptions,
    ) -> ListenerRegistration {
        let snapshots = self.snapshots.clone();
        let errors = self.errors.clone();
        engine
            .listen(
                query,
                options,
                move |snapshot| snapshots.lock().unwrap().push(snapshot),
                move |err| errors.lock().unwrap().push(err),
            )
            .await
            .expect("listen")
    }

    pub fn count(&self) -> usize {
        self.snapshots.lock().unwrap().len()
    }

    pub fn last(&self) -> ViewSnapshot {
        self.snapshots
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("at least one snapshot")
    }

    pub fn errors(&self) -> Vec<ReplicaError> {
        self.errors.lock().unwrap().clone()
    }
}

pub fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

pub fn map(json: serde_json::Value) -> MapValue {
    Value::from_json(&json).as_map().unwrap().clone()
}

pub fn version(seconds: i64) -> SnapshotVersion {
    SnapshotVersion::from_micros(seconds * 1_000_000)
}

pub fn keys_of(snapshot: &ViewSnapshot) -> Vec<String> {
    snapshot
        .documents()
        .iter()
        .map(|document| document.key().to_string())
        .collect()
}

/// Polls `condition` for up to a second.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
