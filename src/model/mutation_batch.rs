use std::collections::{BTreeMap, BTreeSet};

use crate::error::{internal_error, ReplicaResult};
use crate::model::{
    Document, DocumentKey, MutatedFields, Mutation, MutationResult, SnapshotVersion, Timestamp,
};

pub type BatchId = i32;

/// Sentinel meaning "before the first batch".
pub const BATCH_ID_UNKNOWN: BatchId = -1;

/// Ordered group of mutations written atomically under one batch id.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(batch_id: BatchId, local_write_time: Timestamp, mutations: Vec<Mutation>) -> Self {
        Self {
            batch_id,
            local_write_time,
            mutations,
        }
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations.iter().map(|m| m.key().clone()).collect()
    }

    /// Replays this batch's mutations for `document`'s key, in order.
    pub fn apply_to_local_view(
        &self,
        document: &mut Document,
        mut mutated: MutatedFields,
    ) -> ReplicaResult<MutatedFields> {
        let key = document.key().clone();
        for mutation in self.mutations.iter().filter(|m| m.key() == &key) {
            mutated = mutation.apply_to_local_view(document, mutated, self.local_write_time)?;
        }
        Ok(mutated)
    }

    pub fn apply_to_remote_document(
        &self,
        document: &mut Document,
        result: &MutationBatchResult,
    ) -> ReplicaResult<()> {
        for (index, mutation) in self.mutations.iter().enumerate() {
            if mutation.key() != document.key() {
                continue;
            }
            let mutation_result = result.mutation_results.get(index).ok_or_else(|| {
                internal_error(format!(
                    "Missing write result {index} for batch {}",
                    self.batch_id
                ))
            })?;
            mutation.apply_to_remote_document(document, mutation_result)?;
        }
        Ok(())
    }
}

/// A batch acknowledged by the server.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
}

impl MutationBatchResult {
    pub fn new(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
    ) -> ReplicaResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "Batch {} has {} mutations but {} write results",
                batch.batch_id,
                batch.mutations.len(),
                mutation_results.len()
            )));
        }
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
        })
    }

    /// Version each written document reached with this commit.
    pub fn document_versions(&self) -> BTreeMap<DocumentKey, SnapshotVersion> {
        let mut versions = BTreeMap::new();
        for (mutation, result) in self.batch.mutations.iter().zip(&self.mutation_results) {
            let version = if result.version.is_min() {
                self.commit_version
            } else {
                result.version
            };
            versions.insert(mutation.key().clone(), version);
        }
        versions
    }
}
