pub mod async_queue;
pub mod document_set;
pub mod event_manager;
pub mod query;
pub mod sync_engine;
pub mod view;
pub mod view_snapshot;

pub use async_queue::AsyncQueue;
pub use document_set::DocumentSet;
pub use event_manager::{ListenOptions, ListenerId};
pub use query::{Direction, FieldFilter, FilterOperator, LimitType, Query};
pub use sync_engine::SyncEngine;
pub use view_snapshot::{ChangeType, DocumentViewChange, SnapshotChange, SnapshotMetadata, ViewSnapshot};
