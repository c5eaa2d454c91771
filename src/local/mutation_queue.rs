use std::collections::{BTreeMap, BTreeSet};

use crate::error::{internal_error, invalid_argument, ReplicaResult};
use crate::model::{BatchId, DocumentKey, Mutation, MutationBatch, Timestamp, BATCH_ID_UNKNOWN};
use crate::util::SortedMap;

/// Append-only log of pending local write batches, ordered by batch id.
#[derive(Clone, Debug)]
pub struct MutationQueue {
    batches: BTreeMap<BatchId, MutationBatch>,
    /// `(key, batch_id)` pairs for per-document scans.
    by_key: SortedMap<(DocumentKey, BatchId), ()>,
    next_batch_id: BatchId,
}

impl Default for MutationQueue {
    fn default() -> Self {
        Self {
            batches: BTreeMap::new(),
            by_key: SortedMap::new(),
            next_batch_id: 1,
        }
    }
}

impl MutationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the queue from durable batches. Ids continue after the
    /// highest restored batch so they are never reused.
    pub fn restore(batches: Vec<MutationBatch>) -> Self {
        let mut queue = Self::new();
        for batch in batches {
            queue.next_batch_id = queue.next_batch_id.max(batch.batch_id + 1);
            queue.index_batch(&batch);
            queue.batches.insert(batch.batch_id, batch);
        }
        queue
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// Appends a batch with an id one greater than the previous one.
    pub fn add_batch(
        &mut self,
        local_write_time: Timestamp,
        mutations: Vec<Mutation>,
    ) -> ReplicaResult<MutationBatch> {
        if mutations.is_empty() {
            return Err(invalid_argument("Mutation batches must not be empty"));
        }
        let batch = MutationBatch::new(self.next_batch_id, local_write_time, mutations);
        self.next_batch_id += 1;
        self.index_batch(&batch);
        self.batches.insert(batch.batch_id, batch.clone());
        Ok(batch)
    }

    fn index_batch(&mut self, batch: &MutationBatch) {
        for key in batch.keys() {
            self.by_key = self.by_key.insert((key, batch.batch_id), ());
        }
    }

    pub fn lookup(&self, batch_id: BatchId) -> Option<&MutationBatch> {
        self.batches.get(&batch_id)
    }

    /// First batch with an id greater than `after`.
    pub fn next_batch_after(&self, after: BatchId) -> Option<&MutationBatch> {
        self.batches
            .range(after.saturating_add(1)..)
            .next()
            .map(|(_, batch)| batch)
    }

    pub fn highest_batch_id(&self) -> BatchId {
        self.batches
            .keys()
            .next_back()
            .copied()
            .unwrap_or(BATCH_ID_UNKNOWN)
    }

    pub fn all_batches(&self) -> impl Iterator<Item = &MutationBatch> {
        self.batches.values()
    }

    /// Batches touching `key`, in ascending id order.
    pub fn batches_affecting(&self, key: &DocumentKey) -> Vec<&MutationBatch> {
        self.by_key
            .iter_from(&(key.clone(), BatchId::MIN))
            .take_while(|((indexed, _), _)| indexed == key)
            .filter_map(|((_, batch_id), _)| self.batches.get(batch_id))
            .collect()
    }

    pub fn batches_affecting_keys<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
    ) -> Vec<&MutationBatch> {
        let ids: BTreeSet<BatchId> = keys
            .into_iter()
            .flat_map(|key| self.batches_affecting(key))
            .map(|batch| batch.batch_id)
            .collect();
        ids.iter().filter_map(|id| self.batches.get(id)).collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key
            .iter_from(&(key.clone(), BatchId::MIN))
            .next()
            .is_some_and(|((indexed, _), _)| indexed == key)
    }

    /// Retires the oldest batch. Batches only leave the queue in id order,
    /// after acknowledgement or rejection.
    pub fn remove_batch(&mut self, batch_id: BatchId) -> ReplicaResult<MutationBatch> {
        let head = self.batches.keys().next().copied();
        if head != Some(batch_id) {
            return Err(internal_error(format!(
                "Can only remove the oldest pending batch ({head:?}), not {batch_id}"
            )));
        }
        let batch = self
            .batches
            .remove(&batch_id)
            .ok_or_else(|| internal_error(format!("Batch {batch_id} is not queued")))?;
        for key in batch.keys() {
            self.by_key = self.by_key.remove(&(key, batch_id));
        }
        Ok(batch)
    }
}
