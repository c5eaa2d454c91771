#![doc = include_str!("RUSTDOC.md")]

pub mod core;
pub mod engine;
pub mod error;
pub mod local;
pub mod model;
pub mod platform;
pub mod remote;
pub mod settings;
pub mod util;
pub mod value;

pub use crate::core::{
    ChangeType, Direction, FilterOperator, ListenOptions, Query, SnapshotChange,
    SnapshotMetadata, ViewSnapshot,
};
pub use engine::{ListenerRegistration, PendingWrite, ReplicaEngine};
pub use error::{ReplicaError, ReplicaErrorCode, ReplicaResult};
pub use local::{CollectionResult, MemoryPersistence, Persistence, StorageMode};
pub use model::{Document, DocumentKey, Mutation, SnapshotVersion, Timestamp};
pub use remote::{InMemoryTransport, OnlineState, Transport};
pub use settings::ReplicaSettings;
pub use value::{MapValue, Value};
