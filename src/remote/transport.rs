use std::sync::Arc;

use async_trait::async_trait;

use crate::core::query::Query;
use crate::error::{ReplicaError, ReplicaResult};
use crate::model::{BatchId, Mutation, MutationResult, ResumeToken, SnapshotVersion, TargetId};
use crate::remote::watch_change::WatchChange;

/// Receives decoded messages from one open stream.
///
/// Callbacks must not block: implementations hand the message off and return.
pub trait StreamHandler<M>: Send + Sync {
    fn on_message(&self, message: M);

    /// The stream is gone. `None` means it was closed without an error.
    fn on_close(&self, error: Option<ReplicaError>);
}

/// Sending half of an open stream.
#[async_trait]
pub trait StreamConnection<R: Send + 'static>: Send + Sync {
    async fn send(&self, request: R) -> ReplicaResult<()>;

    /// Closes the stream; the handler receives no further callbacks.
    async fn close(&self);
}

pub type WatchConnection = Arc<dyn StreamConnection<WatchRequest>>;
pub type WriteConnection = Arc<dyn StreamConnection<WriteRequest>>;

/// Network collaborator opening the watch and write streams.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open_watch_stream(
        &self,
        handler: Arc<dyn StreamHandler<WatchChange>>,
    ) -> ReplicaResult<WatchConnection>;

    async fn open_write_stream(
        &self,
        handler: Arc<dyn StreamHandler<WriteResponse>>,
    ) -> ReplicaResult<WriteConnection>;
}

/// A target as sent to the server.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetSpec {
    pub target_id: TargetId,
    pub query: Query,
    /// Empty for a fresh listen.
    pub resume_token: ResumeToken,
    pub snapshot_version: SnapshotVersion,
    /// Number of documents the client holds for a resumed target.
    pub expected_count: Option<u32>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum WatchRequest {
    AddTarget(TargetSpec),
    RemoveTarget(TargetId),
}

#[derive(Clone, Debug, PartialEq)]
pub struct WriteRequest {
    pub batch_id: BatchId,
    pub mutations: Vec<Mutation>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum WriteResponse {
    Ack {
        batch_id: BatchId,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    },
    /// The server refused the batch; it will not be retried.
    Reject {
        batch_id: BatchId,
        error: ReplicaError,
    },
}
