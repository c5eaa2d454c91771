use std::collections::{BTreeMap, BTreeSet};

use crate::model::{Document, DocumentKey, ResumeToken, SnapshotVersion, TargetId};

/// Everything the watch stream delivered up to one consistent snapshot,
/// applied to local state as a unit.
#[derive(Debug, Clone, Default)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose existence filter could not be reconciled; their
    /// resume tokens are no longer valid.
    pub target_resets: BTreeSet<TargetId>,
    /// Keys an existence filter removed from each target. Views drop them
    /// right away instead of waiting for limbo resolution.
    pub filtered_documents: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
    /// New server state per key: found, or missing when deleted.
    pub document_updates: BTreeMap<DocumentKey, Document>,
    /// Keys only referenced by limbo resolution targets.
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.document_updates.is_empty()
            && self.target_resets.is_empty()
            && self.filtered_documents.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}

/// Per-target membership changes within a [`RemoteEvent`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetChange {
    pub resume_token: ResumeToken,
    /// The target has caught up with the server's state.
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}
