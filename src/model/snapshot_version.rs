use std::fmt::{Display, Formatter};

use crate::model::Timestamp;

/// Server-assigned version of a document or of a whole watch snapshot.
///
/// [`SnapshotVersion::min`] means "never seen from the server".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotVersion {
    timestamp: Timestamp,
}

impl SnapshotVersion {
    pub fn new(timestamp: Timestamp) -> Self {
        Self { timestamp }
    }

    pub fn min() -> Self {
        Self {
            timestamp: Timestamp::new(0, 0),
        }
    }

    /// Convenience for tests and in-memory transports that count versions.
    pub fn from_micros(micros: i64) -> Self {
        Self::new(Timestamp::from_micros(micros))
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn is_min(&self) -> bool {
        *self == Self::min()
    }
}

impl Default for SnapshotVersion {
    fn default() -> Self {
        Self::min()
    }
}

impl Display for SnapshotVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_min() {
            write!(f, "SnapshotVersion(min)")
        } else {
            write!(f, "SnapshotVersion({})", self.timestamp)
        }
    }
}
