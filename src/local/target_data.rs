use crate::core::query::Query;
use crate::model::{ListenSequenceNumber, ResumeToken, SnapshotVersion, TargetId};

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetPurpose {
    Listen,
    /// Re-listen after an existence filter could not be reconciled.
    ExistenceFilterMismatch,
    /// Single-document target confirming a limbo document.
    LimboResolution,
}

/// Everything the engine knows about a target it has listened to.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetData {
    pub target_id: TargetId,
    pub query: Query,
    pub purpose: TargetPurpose,
    pub sequence_number: ListenSequenceNumber,
    /// Version of the last consistent snapshot received for this target.
    pub snapshot_version: SnapshotVersion,
    /// Version at which the target last had no limbo documents; bounds the
    /// cached-results strategy of the query engine.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    pub resume_token: ResumeToken,
    /// Document count the server reported after the last resume, used to
    /// detect drift on the next existence filter.
    pub expected_count: Option<u32>,
}

impl TargetData {
    pub fn new(
        query: Query,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target_id,
            query,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: ResumeToken::empty(),
            expected_count: None,
        }
    }

    #[must_use]
    pub fn with_sequence_number(mut self, sequence_number: ListenSequenceNumber) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    /// A fresh token invalidates any previously expected count.
    #[must_use]
    pub fn with_resume_token(mut self, token: ResumeToken, version: SnapshotVersion) -> Self {
        self.resume_token = token;
        self.snapshot_version = version;
        self.expected_count = None;
        self
    }

    #[must_use]
    pub fn with_expected_count(mut self, count: Option<u32>) -> Self {
        self.expected_count = count;
        self
    }

    #[must_use]
    pub fn with_last_limbo_free_snapshot_version(mut self, version: SnapshotVersion) -> Self {
        self.last_limbo_free_snapshot_version = version;
        self
    }

    #[must_use]
    pub fn with_purpose(mut self, purpose: TargetPurpose) -> Self {
        self.purpose = purpose;
        self
    }
}
