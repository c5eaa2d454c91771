pub mod bloom_filter;
pub mod in_memory_transport;
pub mod online_state;
pub mod remote_event;
pub mod remote_store;
pub mod transport;
pub mod watch_change;
pub mod watch_change_aggregator;
pub mod write_pipeline;

pub use bloom_filter::BloomFilter;
pub use in_memory_transport::InMemoryTransport;
pub use online_state::OnlineState;
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::{RemoteOutcome, RemoteStore, RemoteSyncer, StreamEvent, StreamEventSink};
pub use transport::{
    StreamConnection, StreamHandler, TargetSpec, Transport, WatchConnection, WatchRequest,
    WriteConnection, WriteRequest, WriteResponse,
};
pub use watch_change::{
    BloomFilterSpec, DocumentChange, DocumentDelete, DocumentRemove, ExistenceFilterChange,
    TargetChangeState, WatchChange, WatchTargetChange,
};
pub use watch_change_aggregator::{
    ExistenceFilterOutcome, TargetMetadataProvider, WatchChangeAggregator,
};
