use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::ReplicaResult;
use crate::local::target_data::TargetData;
use crate::model::{BatchId, Document, DocumentKey, MutationBatch, TargetId};

/// A change to the durable copy of the remote document cache.
#[derive(Clone, Debug, PartialEq)]
pub enum DocumentWrite {
    Put(Document),
    Remove(DocumentKey),
}

/// A target as stored durably, with the keys the server last reported for it.
#[derive(Clone, Debug, PartialEq)]
pub struct PersistedTarget {
    pub data: TargetData,
    pub remote_keys: BTreeSet<DocumentKey>,
}

/// Durable storage collaborator.
///
/// Every read and write happens inside a named transaction; nothing a
/// transaction wrote becomes visible to later transactions until `commit`
/// succeeds. I/O failures surface as `StorageUnavailable`.
#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    async fn begin(&self, label: &str) -> ReplicaResult<Box<dyn PersistenceTransaction>>;
}

#[async_trait]
pub trait PersistenceTransaction: Send {
    /// Returns the stored documents among `keys`; absent keys are skipped.
    async fn read_documents(&mut self, keys: &[DocumentKey]) -> ReplicaResult<Vec<Document>>;

    async fn write_documents(&mut self, changes: Vec<DocumentWrite>) -> ReplicaResult<()>;

    /// Batches with an id greater than `after_id`, in ascending id order.
    async fn read_mutation_batches(&mut self, after_id: BatchId)
        -> ReplicaResult<Vec<MutationBatch>>;

    async fn write_mutation_batch(&mut self, batch: MutationBatch) -> ReplicaResult<()>;

    async fn remove_mutation_batch(&mut self, batch_id: BatchId) -> ReplicaResult<()>;

    async fn read_targets(&mut self) -> ReplicaResult<Vec<PersistedTarget>>;

    async fn write_target(&mut self, target: PersistedTarget) -> ReplicaResult<()>;

    async fn remove_target(&mut self, target_id: TargetId) -> ReplicaResult<()>;

    async fn commit(&mut self) -> ReplicaResult<()>;
}

/// Writes staged by one local store operation, replayable as a unit so a
/// failed commit can be retried from scratch.
#[derive(Clone, Debug, Default)]
pub(crate) struct WriteSet {
    documents: Vec<DocumentWrite>,
    added_batches: Vec<MutationBatch>,
    removed_batches: Vec<BatchId>,
    targets: Vec<PersistedTarget>,
    removed_targets: Vec<TargetId>,
}

impl WriteSet {
    pub(crate) fn is_empty(&self) -> bool {
        self.documents.is_empty()
            && self.added_batches.is_empty()
            && self.removed_batches.is_empty()
            && self.targets.is_empty()
            && self.removed_targets.is_empty()
    }

    pub(crate) fn put_document(&mut self, document: Document) {
        self.documents.push(DocumentWrite::Put(document));
    }

    pub(crate) fn remove_document(&mut self, key: DocumentKey) {
        self.documents.push(DocumentWrite::Remove(key));
    }

    pub(crate) fn add_batch(&mut self, batch: MutationBatch) {
        self.added_batches.push(batch);
    }

    pub(crate) fn remove_batch(&mut self, batch_id: BatchId) {
        self.removed_batches.push(batch_id);
    }

    pub(crate) fn write_target(&mut self, data: TargetData, remote_keys: BTreeSet<DocumentKey>) {
        self.targets.push(PersistedTarget { data, remote_keys });
    }

    pub(crate) fn remove_target(&mut self, target_id: TargetId) {
        self.removed_targets.push(target_id);
    }

    pub(crate) async fn apply(&self, txn: &mut dyn PersistenceTransaction) -> ReplicaResult<()> {
        for batch in &self.added_batches {
            txn.write_mutation_batch(batch.clone()).await?;
        }
        for batch_id in &self.removed_batches {
            txn.remove_mutation_batch(*batch_id).await?;
        }
        if !self.documents.is_empty() {
            txn.write_documents(self.documents.clone()).await?;
        }
        for target in &self.targets {
            txn.write_target(target.clone()).await?;
        }
        for target_id in &self.removed_targets {
            txn.remove_target(*target_id).await?;
        }
        Ok(())
    }
}
