pub mod backoff;
pub mod sorted_map;

pub use backoff::ExponentialBackoff;
pub use sorted_map::SortedMap;
