use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::{storage_unavailable, ReplicaResult};
use crate::local::persistence::{
    DocumentWrite, PersistedTarget, Persistence, PersistenceTransaction,
};
use crate::model::{BatchId, Document, DocumentKey, MutationBatch, TargetId};

#[derive(Clone, Debug, Default)]
struct StoredState {
    documents: BTreeMap<DocumentKey, Document>,
    batches: BTreeMap<BatchId, MutationBatch>,
    targets: BTreeMap<TargetId, PersistedTarget>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<StoredState>,
    failing_commits: AtomicU32,
    commits: AtomicUsize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, StoredState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Process-local [`Persistence`] that keeps committed state in memory.
///
/// Clones share the same storage, so a store can be "reopened" by handing a
/// clone to a new engine.
#[derive(Clone, Default)]
pub struct MemoryPersistence {
    shared: Arc<Shared>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` commits fail with `StorageUnavailable`.
    pub fn fail_next_commits(&self, count: u32) {
        self.shared.failing_commits.store(count, Ordering::SeqCst);
    }

    pub fn commit_count(&self) -> usize {
        self.shared.commits.load(Ordering::SeqCst)
    }

    pub fn document(&self, key: &DocumentKey) -> Option<Document> {
        self.shared.lock().documents.get(key).cloned()
    }

    pub fn batch_ids(&self) -> Vec<BatchId> {
        self.shared.lock().batches.keys().copied().collect()
    }

    pub fn target_ids(&self) -> Vec<TargetId> {
        self.shared.lock().targets.keys().copied().collect()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn begin(&self, label: &str) -> ReplicaResult<Box<dyn PersistenceTransaction>> {
        log::debug!("begin memory transaction '{label}'");
        let snapshot = self.shared.lock().clone();
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            staged: snapshot,
            label: label.to_string(),
        }))
    }
}

/// Works on a private copy of the committed state and swaps it in on commit.
/// Transactions must not overlap; the engine runs them one at a time.
struct MemoryTransaction {
    shared: Arc<Shared>,
    staged: StoredState,
    label: String,
}

#[async_trait]
impl PersistenceTransaction for MemoryTransaction {
    async fn read_documents(&mut self, keys: &[DocumentKey]) -> ReplicaResult<Vec<Document>> {
        Ok(keys
            .iter()
            .filter_map(|key| self.staged.documents.get(key).cloned())
            .collect())
    }

    async fn write_documents(&mut self, changes: Vec<DocumentWrite>) -> ReplicaResult<()> {
        for change in changes {
            match change {
                DocumentWrite::Put(document) => {
                    self.staged
                        .documents
                        .insert(document.key().clone(), document);
                }
                DocumentWrite::Remove(key) => {
                    self.staged.documents.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn read_mutation_batches(
        &mut self,
        after_id: BatchId,
    ) -> ReplicaResult<Vec<MutationBatch>> {
        Ok(self
            .staged
            .batches
            .range(after_id.saturating_add(1)..)
            .map(|(_, batch)| batch.clone())
            .collect())
    }

    async fn write_mutation_batch(&mut self, batch: MutationBatch) -> ReplicaResult<()> {
        self.staged.batches.insert(batch.batch_id, batch);
        Ok(())
    }

    async fn remove_mutation_batch(&mut self, batch_id: BatchId) -> ReplicaResult<()> {
        self.staged.batches.remove(&batch_id);
        Ok(())
    }

    async fn read_targets(&mut self) -> ReplicaResult<Vec<PersistedTarget>> {
        Ok(self.staged.targets.values().cloned().collect())
    }

    async fn write_target(&mut self, target: PersistedTarget) -> ReplicaResult<()> {
        self.staged.targets.insert(target.data.target_id, target);
        Ok(())
    }

    async fn remove_target(&mut self, target_id: TargetId) -> ReplicaResult<()> {
        self.staged.targets.remove(&target_id);
        Ok(())
    }

    async fn commit(&mut self) -> ReplicaResult<()> {
        let failing = self.shared.failing_commits.load(Ordering::SeqCst);
        if failing > 0 {
            self.shared
                .failing_commits
                .store(failing - 1, Ordering::SeqCst);
            return Err(storage_unavailable(format!(
                "Simulated storage failure committing '{}'",
                self.label
            )));
        }
        *self.shared.lock() = std::mem::take(&mut self.staged);
        self.shared.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
