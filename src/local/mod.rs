pub mod index_manager;
pub mod local_documents;
pub mod local_store;
pub mod lru;
pub mod memory_persistence;
pub mod mutation_queue;
pub mod overlay_resolver;
pub mod persistence;
pub mod query_engine;
pub mod remote_document_cache;
pub mod target_cache;
pub mod target_data;

pub use local_store::{LocalStore, LocalViewChanges, LocalWriteResult, StorageMode};
pub use lru::CollectionResult;
pub use memory_persistence::MemoryPersistence;
pub use persistence::{DocumentWrite, PersistedTarget, Persistence, PersistenceTransaction};
pub use query_engine::{QueryResult, QueryStrategy};
pub use target_data::{TargetData, TargetPurpose};
