use std::collections::BTreeMap;

use crate::error::{invalid_argument, ReplicaResult};
use crate::model::{DocumentKey, ListenSequenceNumber};

/// Result of one garbage collection pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CollectionResult {
    pub removed_docs: usize,
    pub removed_targets: usize,
}

/// Sequence-numbered liveness tracking for cached documents.
///
/// Targets carry their own sequence number in their target data; documents
/// are stamped here whenever they are written, referenced by a write, or
/// dropped from a target.
#[derive(Clone, Debug, Default)]
pub struct ReferenceTracker {
    current: ListenSequenceNumber,
    documents: BTreeMap<DocumentKey, ListenSequenceNumber>,
}

impl ReferenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the tracker at least as far as a sequence number restored from
    /// storage.
    pub fn seek_past(&mut self, sequence_number: ListenSequenceNumber) {
        self.current = self.current.max(sequence_number);
    }

    pub fn next_sequence_number(&mut self) -> ListenSequenceNumber {
        self.current += 1;
        self.current
    }

    pub fn touch(&mut self, key: &DocumentKey, sequence_number: ListenSequenceNumber) {
        self.documents.insert(key.clone(), sequence_number);
    }

    pub fn remove(&mut self, key: &DocumentKey) {
        self.documents.remove(key);
    }

    pub fn sequence_number(&self, key: &DocumentKey) -> Option<ListenSequenceNumber> {
        self.documents.get(key).copied()
    }

    pub fn documents(&self) -> impl Iterator<Item = (&DocumentKey, ListenSequenceNumber)> {
        self.documents.iter().map(|(key, sequence)| (key, *sequence))
    }
}

/// The sequence number below which `percentile` percent of `sequence_numbers`
/// fall. `None` means nothing is old enough to collect.
pub fn nth_sequence_number(
    mut sequence_numbers: Vec<ListenSequenceNumber>,
    percentile: u32,
) -> ReplicaResult<Option<ListenSequenceNumber>> {
    if percentile > 100 {
        return Err(invalid_argument(format!(
            "Collection percentile must be within 0..=100, got {percentile}"
        )));
    }
    let count = sequence_numbers.len() * percentile as usize / 100;
    if count == 0 {
        return Ok(None);
    }
    sequence_numbers.sort_unstable();
    Ok(sequence_numbers.get(count - 1).copied())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_picks_threshold() {
        let numbers = vec![5, 1, 9, 3, 7, 2, 8, 4, 6, 10];
        assert_eq!(nth_sequence_number(numbers.clone(), 50).unwrap(), Some(5));
        assert_eq!(nth_sequence_number(numbers.clone(), 100).unwrap(), Some(10));
        assert_eq!(nth_sequence_number(numbers.clone(), 5).unwrap(), None);
        assert!(nth_sequence_number(numbers, 101).is_err());
    }

    #[test]
    fn tracker_stamps_documents() {
        let mut tracker = ReferenceTracker::new();
        tracker.seek_past(40);
        let sequence = tracker.next_sequence_number();
        assert_eq!(sequence, 41);

        let key = DocumentKey::from_string("rooms/a").unwrap();
        tracker.touch(&key, sequence);
        assert_eq!(tracker.sequence_number(&key), Some(41));
        tracker.remove(&key);
        assert_eq!(tracker.documents().count(), 0);
    }
}
