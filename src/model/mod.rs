mod document;
mod document_key;
mod field_path;
mod geo_point;
mod mutation;
mod mutation_batch;
mod overlay;
mod resource_path;
mod resume_token;
mod snapshot_version;
mod timestamp;

pub use document::{Document, DocumentState};
pub use document_key::DocumentKey;
pub use field_path::{FieldPath, IntoFieldPath};
pub use geo_point::GeoPoint;
pub use mutation::{
    FieldTransform, MutatedFields, Mutation, MutationKind, MutationResult, Precondition,
    TransformOperation,
};
pub use mutation_batch::{BatchId, MutationBatch, MutationBatchResult, BATCH_ID_UNKNOWN};
pub use overlay::Overlay;
pub use resource_path::ResourcePath;
pub use resume_token::ResumeToken;
pub use snapshot_version::SnapshotVersion;
pub use timestamp::Timestamp;

/// Server-assigned identifier of a watched target.
pub type TargetId = i32;

/// Monotonic counter stamped on documents and targets for LRU collection.
pub type ListenSequenceNumber = u64;
