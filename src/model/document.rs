use crate::model::{DocumentKey, FieldPath, SnapshotVersion};
use crate::value::{MapValue, Value};

/// Existence state of a cached document.
#[derive(Clone, Debug, PartialEq)]
pub enum DocumentState {
    /// The document exists with the given fields.
    Found(MapValue),
    /// The document is known not to exist (deleted, or never created).
    Missing,
    /// The document exists on the server but its contents are unknown, e.g.
    /// after an acknowledged patch on a document that was not cached.
    Unknown,
}

/// A document as held by a cache. Callers always receive owned copies.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    key: DocumentKey,
    version: SnapshotVersion,
    read_time: SnapshotVersion,
    state: DocumentState,
    has_local_mutations: bool,
    has_committed_mutations: bool,
}

impl Document {
    pub fn found(key: DocumentKey, version: SnapshotVersion, data: MapValue) -> Self {
        Self::with_state(key, version, DocumentState::Found(data))
    }

    pub fn missing(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self::with_state(key, version, DocumentState::Missing)
    }

    pub fn unknown(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self::with_state(key, version, DocumentState::Unknown)
    }

    fn with_state(key: DocumentKey, version: SnapshotVersion, state: DocumentState) -> Self {
        Self {
            key,
            version,
            read_time: SnapshotVersion::min(),
            state,
            has_local_mutations: false,
            has_committed_mutations: false,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    /// Snapshot version at which this entry was last written to the cache.
    pub fn read_time(&self) -> SnapshotVersion {
        self.read_time
    }

    pub fn state(&self) -> &DocumentState {
        &self.state
    }

    pub fn data(&self) -> Option<&MapValue> {
        match &self.state {
            DocumentState::Found(data) => Some(data),
            _ => None,
        }
    }

    pub fn field(&self, path: &FieldPath) -> Option<&Value> {
        self.data().and_then(|data| data.get(path))
    }

    pub fn is_found(&self) -> bool {
        matches!(self.state, DocumentState::Found(_))
    }

    pub fn is_missing(&self) -> bool {
        matches!(self.state, DocumentState::Missing)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self.state, DocumentState::Unknown)
    }

    pub fn has_local_mutations(&self) -> bool {
        self.has_local_mutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.has_committed_mutations
    }

    /// Local writes not yet acknowledged by the server are reflected.
    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations
    }

    /// Local or acknowledged writes the watch stream has not yet confirmed.
    pub(crate) fn has_unconfirmed_writes(&self) -> bool {
        self.has_local_mutations || self.has_committed_mutations
    }

    pub(crate) fn convert_to_found(&mut self, version: SnapshotVersion, data: MapValue) {
        self.version = version;
        self.state = DocumentState::Found(data);
        self.has_local_mutations = false;
        self.has_committed_mutations = false;
    }

    pub(crate) fn convert_to_missing(&mut self, version: SnapshotVersion) {
        self.version = version;
        self.state = DocumentState::Missing;
        self.has_local_mutations = false;
        self.has_committed_mutations = false;
    }

    pub(crate) fn convert_to_unknown(&mut self, version: SnapshotVersion) {
        self.version = version;
        self.state = DocumentState::Unknown;
        self.has_local_mutations = false;
        self.has_committed_mutations = true;
    }

    pub(crate) fn set_has_local_mutations(&mut self) {
        self.has_local_mutations = true;
    }

    pub(crate) fn set_has_committed_mutations(&mut self) {
        self.has_committed_mutations = true;
    }

    pub(crate) fn set_read_time(&mut self, read_time: SnapshotVersion) {
        self.read_time = read_time;
    }

    pub(crate) fn with_read_time(mut self, read_time: SnapshotVersion) -> Self {
        self.read_time = read_time;
        self
    }
}
