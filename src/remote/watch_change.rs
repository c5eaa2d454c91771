use bytes::Bytes;

use crate::error::ReplicaError;
use crate::model::{Document, DocumentKey, ResumeToken, SnapshotVersion, TargetId};

/// A decoded message from the watch stream.
#[derive(Debug, Clone)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    /// A document was added or updated in one or more targets.
    DocumentChange(DocumentChange),
    /// A document was deleted at `read_time`.
    DocumentDelete(DocumentDelete),
    /// A document left one or more targets; its contents are unknown.
    DocumentRemove(DocumentRemove),
    ExistenceFilter(ExistenceFilterChange),
}

impl WatchChange {
    /// Acknowledges newly added targets.
    pub fn add_targets(target_ids: Vec<TargetId>) -> Self {
        WatchChange::TargetChange(WatchTargetChange::new(TargetChangeState::Add, target_ids))
    }

    /// Marks targets as current, carrying the resume token the server issued.
    pub fn current(target_ids: Vec<TargetId>, resume_token: ResumeToken) -> Self {
        WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::Current, target_ids)
                .with_resume_token(resume_token),
        )
    }

    /// Global snapshot boundary: everything sent so far is consistent at
    /// `read_time`.
    pub fn snapshot(read_time: SnapshotVersion, resume_token: ResumeToken) -> Self {
        WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::NoChange, Vec::new())
                .with_resume_token(resume_token)
                .with_read_time(read_time),
        )
    }

    pub fn updated(document: Document, target_ids: Vec<TargetId>) -> Self {
        WatchChange::DocumentChange(DocumentChange {
            updated_target_ids: target_ids,
            removed_target_ids: Vec::new(),
            document,
        })
    }

    pub fn deleted(key: DocumentKey, read_time: SnapshotVersion, target_ids: Vec<TargetId>) -> Self {
        WatchChange::DocumentDelete(DocumentDelete {
            key,
            read_time,
            removed_target_ids: target_ids,
        })
    }

    pub fn removed(key: DocumentKey, target_ids: Vec<TargetId>) -> Self {
        WatchChange::DocumentRemove(DocumentRemove {
            key,
            removed_target_ids: target_ids,
        })
    }

    pub fn existence_filter(target_id: TargetId, count: u32) -> Self {
        WatchChange::ExistenceFilter(ExistenceFilterChange {
            target_id,
            count,
            bloom_filter: None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    /// Empty means "all targets".
    pub target_ids: Vec<TargetId>,
    pub resume_token: ResumeToken,
    /// Only meaningful on a global `NoChange`; `min()` otherwise.
    pub read_time: SnapshotVersion,
    /// Set on `Remove` when the server rejected the targets.
    pub cause: Option<ReplicaError>,
}

impl WatchTargetChange {
    pub fn new(state: TargetChangeState, target_ids: Vec<TargetId>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: ResumeToken::empty(),
            read_time: SnapshotVersion::min(),
            cause: None,
        }
    }

    pub fn with_resume_token(mut self, resume_token: ResumeToken) -> Self {
        self.resume_token = resume_token;
        self
    }

    pub fn with_read_time(mut self, read_time: SnapshotVersion) -> Self {
        self.read_time = read_time;
        self
    }

    pub fn with_cause(mut self, cause: ReplicaError) -> Self {
        self.cause = Some(cause);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Add,
    Remove,
    Current,
    Reset,
}

#[derive(Debug, Clone)]
pub struct DocumentChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub document: Document,
}

#[derive(Debug, Clone)]
pub struct DocumentDelete {
    pub key: DocumentKey,
    pub read_time: SnapshotVersion,
    pub removed_target_ids: Vec<TargetId>,
}

#[derive(Debug, Clone)]
pub struct DocumentRemove {
    pub key: DocumentKey,
    pub removed_target_ids: Vec<TargetId>,
}

#[derive(Debug, Clone)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub count: u32,
    pub bloom_filter: Option<BloomFilterSpec>,
}

/// Wire form of a bloom filter attached to an existence filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilterSpec {
    pub bitmap: Bytes,
    pub padding: u8,
    pub hash_count: u32,
}
