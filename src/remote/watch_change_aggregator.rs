use std::collections::{BTreeMap, BTreeSet};

use crate::error::{protocol_violation, ReplicaResult};
use crate::local::{TargetData, TargetPurpose};
use crate::model::{Document, DocumentKey, ResumeToken, SnapshotVersion, TargetId};
use crate::remote::bloom_filter::BloomFilter;
use crate::remote::remote_event::{RemoteEvent, TargetChange};
use crate::remote::watch_change::{
    DocumentChange, DocumentDelete, DocumentRemove, ExistenceFilterChange, TargetChangeState,
    WatchChange, WatchTargetChange,
};

/// What the aggregator needs to know about targets it does not own.
pub trait TargetMetadataProvider {
    /// Keys the target held as of the last raised snapshot.
    fn remote_keys(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// The target's data while it is being listened to.
    fn target_data(&self, target_id: TargetId) -> Option<&TargetData>;
}

/// How an existence filter was reconciled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExistenceFilterOutcome {
    /// The local count already matched, or the target is not active.
    Matched,
    /// The bloom filter removed enough documents to match the count.
    Pruned { checks: usize, removed: usize },
    /// The target was reset and will be re-listened without a resume token.
    Reset { checks: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DocumentChangeType {
    Added,
    Modified,
    Removed,
}

#[derive(Debug)]
struct TargetState {
    /// Add/remove requests the server has not acknowledged yet.
    pending_responses: u32,
    current: bool,
    resume_token: ResumeToken,
    has_pending_changes: bool,
    document_changes: BTreeMap<DocumentKey, DocumentChangeType>,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            pending_responses: 0,
            current: false,
            resume_token: ResumeToken::empty(),
            has_pending_changes: true,
            document_changes: BTreeMap::new(),
        }
    }
}

impl TargetState {
    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, token: &ResumeToken) {
        if !token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = token.clone();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, change_type) in &self.document_changes {
            let bucket = match change_type {
                DocumentChangeType::Added => &mut change.added_documents,
                DocumentChangeType::Modified => &mut change.modified_documents,
                DocumentChangeType::Removed => &mut change.removed_documents,
            };
            bucket.insert(key.clone());
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: DocumentChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self, target_id: TargetId) -> ReplicaResult<()> {
        self.pending_responses = self.pending_responses.checked_sub(1).ok_or_else(|| {
            protocol_violation(format!("Unexpected target acknowledgement for {target_id}"))
        })?;
        Ok(())
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Buffers watch changes until a global snapshot and turns them into one
/// [`RemoteEvent`].
///
/// A stream owns one aggregator; when the stream is torn down the aggregator
/// is dropped with everything it buffered.
#[derive(Debug, Default)]
pub struct WatchChangeAggregator {
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, Document>,
    pending_document_updates_by_target: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    /// Targets each changed key belongs to, for limbo-only detection.
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeSet<TargetId>,
    pending_filtered_documents: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
}

impl WatchChangeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_watch_change(
        &mut self,
        change: WatchChange,
        metadata: &dyn TargetMetadataProvider,
    ) -> ReplicaResult<()> {
        match change {
            WatchChange::TargetChange(change) => self.handle_target_change(change, metadata),
            WatchChange::DocumentChange(change) => {
                self.handle_document_change(change, metadata);
                Ok(())
            }
            WatchChange::DocumentDelete(delete) => {
                self.handle_document_delete(delete, metadata);
                Ok(())
            }
            WatchChange::DocumentRemove(remove) => {
                self.handle_document_remove(remove, metadata);
                Ok(())
            }
            WatchChange::ExistenceFilter(filter) => self
                .handle_existence_filter(filter, metadata)
                .map(|outcome| log::debug!("existence filter outcome: {outcome:?}")),
        }
    }

    pub fn handle_target_change(
        &mut self,
        change: WatchTargetChange,
        metadata: &dyn TargetMetadataProvider,
    ) -> ReplicaResult<()> {
        let target_ids = if change.target_ids.is_empty() {
            self.target_states.keys().copied().collect()
        } else {
            change.target_ids.clone()
        };

        for target_id in target_ids {
            match change.state {
                TargetChangeState::NoChange => {
                    if self.is_active_target(target_id, metadata) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Add => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response(target_id)?;
                    if !state.is_pending() {
                        // A fresh listen: anything buffered for the old one is stale.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Remove => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response(target_id)?;
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                }
                TargetChangeState::Current => {
                    if self.is_active_target(target_id, metadata) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Reset => {
                    if self.is_active_target(target_id, metadata) {
                        self.reset_target(target_id, metadata);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn handle_document_change(
        &mut self,
        change: DocumentChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        let key = change.document.key().clone();
        for target_id in &change.updated_target_ids {
            if change.document.is_found() {
                self.add_document_to_target(*target_id, change.document.clone(), metadata);
            } else {
                self.remove_document_from_target(
                    *target_id,
                    &key,
                    Some(change.document.clone()),
                    metadata,
                );
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(
                *target_id,
                &key,
                Some(change.document.clone()),
                metadata,
            );
        }
    }

    fn handle_document_delete(&mut self, delete: DocumentDelete, metadata: &dyn TargetMetadataProvider) {
        let document = Document::missing(delete.key.clone(), delete.read_time);
        for target_id in &delete.removed_target_ids {
            self.remove_document_from_target(*target_id, &delete.key, Some(document.clone()), metadata);
        }
    }

    fn handle_document_remove(&mut self, remove: DocumentRemove, metadata: &dyn TargetMetadataProvider) {
        for target_id in &remove.removed_target_ids {
            self.remove_document_from_target(*target_id, &remove.key, None, metadata);
        }
    }

    /// Reconciles the server's document count for a target with the local
    /// one. Each locally known key is tested against the bloom filter at most
    /// once; if pruning cannot explain the difference the target is reset.
    /// Either way the dropped keys are reported in the next event.
    pub fn handle_existence_filter(
        &mut self,
        filter: ExistenceFilterChange,
        metadata: &dyn TargetMetadataProvider,
    ) -> ReplicaResult<ExistenceFilterOutcome> {
        let target_id = filter.target_id;
        let Some(target) = self.target_data_for_active_target(target_id, metadata) else {
            return Ok(ExistenceFilterOutcome::Matched);
        };
        let query = target.query.clone();

        if query.is_document_query() {
            return match filter.count {
                0 => {
                    let key = DocumentKey::from_path(query.path().clone())?;
                    let deleted = Document::missing(key.clone(), SnapshotVersion::min());
                    self.remove_document_from_target(target_id, &key, Some(deleted), metadata);
                    Ok(ExistenceFilterOutcome::Pruned {
                        checks: 0,
                        removed: 1,
                    })
                }
                1 => Ok(ExistenceFilterOutcome::Matched),
                count => Err(protocol_violation(format!(
                    "Existence filter count {count} for single document target {target_id}"
                ))),
            };
        }

        let current = self.current_document_count(target_id, metadata);
        if current == filter.count as usize {
            return Ok(ExistenceFilterOutcome::Matched);
        }

        let bloom_filter = match filter.bloom_filter.as_ref().map(BloomFilter::from_spec) {
            Some(Ok(bloom_filter)) => Some(bloom_filter),
            Some(Err(err)) => {
                log::warn!("ignoring malformed bloom filter for target {target_id}: {err}");
                None
            }
            None => None,
        };

        let mut checks = 0;
        if let Some(bloom_filter) = bloom_filter {
            let (checked, removed) = self.prune_with_bloom_filter(&bloom_filter, target_id, metadata);
            checks = checked;
            if current.saturating_sub(removed) == filter.count as usize {
                return Ok(ExistenceFilterOutcome::Pruned { checks, removed });
            }
        }

        log::debug!(
            "existence filter mismatch for target {target_id}: expected {}, have {current}",
            filter.count
        );
        let dropped = metadata.remote_keys(target_id);
        if !dropped.is_empty() {
            self.pending_filtered_documents
                .entry(target_id)
                .or_default()
                .extend(dropped);
        }
        self.reset_target(target_id, metadata);
        self.pending_target_resets.insert(target_id);
        Ok(ExistenceFilterOutcome::Reset { checks })
    }

    fn prune_with_bloom_filter(
        &mut self,
        bloom_filter: &BloomFilter,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) -> (usize, usize) {
        let mut checks = 0;
        let mut removed = 0;
        for key in metadata.remote_keys(target_id) {
            checks += 1;
            if !bloom_filter.might_contain(&key.path().canonical_string()) {
                self.remove_document_from_target(target_id, &key, None, metadata);
                self.pending_filtered_documents
                    .entry(target_id)
                    .or_default()
                    .insert(key);
                removed += 1;
            }
        }
        (checks, removed)
    }

    /// Registers an add or remove request sent for `target_id`; its changes
    /// are ignored until the server acknowledges every such request.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id).record_target_request();
    }

    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
        self.pending_filtered_documents.remove(&target_id);
    }

    /// Builds the event for everything buffered so far and clears the buffers.
    pub fn create_remote_event(
        &mut self,
        snapshot_version: SnapshotVersion,
        metadata: &dyn TargetMetadataProvider,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        for target_id in target_ids {
            let Some(target) = self.target_data_for_active_target(target_id, metadata) else {
                continue;
            };
            let query = target.query.clone();
            let current = self
                .target_states
                .get(&target_id)
                .is_some_and(|state| state.current);
            if current && query.is_document_query() {
                // A current document target that never saw its document
                // means the document does not exist.
                if let Ok(key) = DocumentKey::from_path(query.path().clone()) {
                    let updated_here = self
                        .pending_document_updates_by_target
                        .get(&key)
                        .is_some_and(|targets| targets.contains(&target_id));
                    if !updated_here && !Self::target_contains_document(target_id, &key, metadata) {
                        let deleted = Document::missing(key.clone(), snapshot_version);
                        self.remove_document_from_target(target_id, &key, Some(deleted), metadata);
                    }
                }
            }
            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = BTreeSet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo = targets.iter().all(|target_id| {
                self.target_data_for_active_target(*target_id, metadata)
                    .map_or(true, |data| data.purpose == TargetPurpose::LimboResolution)
            });
            if only_limbo {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let document_updates = std::mem::take(&mut self.pending_document_updates)
            .into_iter()
            .map(|(key, document)| (key, document.with_read_time(snapshot_version)))
            .collect();
        self.pending_document_updates_by_target.clear();
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_resets: std::mem::take(&mut self.pending_target_resets),
            filtered_documents: std::mem::take(&mut self.pending_filtered_documents),
            document_updates,
            resolved_limbo_documents,
        }
    }

    fn add_document_to_target(
        &mut self,
        target_id: TargetId,
        document: Document,
        metadata: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let key = document.key().clone();
        let change_type = if Self::target_contains_document(target_id, &key, metadata) {
            DocumentChangeType::Modified
        } else {
            DocumentChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        if let Some(filtered) = self.pending_filtered_documents.get_mut(&target_id) {
            filtered.remove(&key);
            if filtered.is_empty() {
                self.pending_filtered_documents.remove(&target_id);
            }
        }
        self.pending_document_updates.insert(key.clone(), document);
        self.pending_document_updates_by_target
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.pending_document_target_mapping
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    /// Removes `key` from the target. A key added and removed within the
    /// same snapshot leaves no change behind.
    fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: &DocumentKey,
        updated_document: Option<Document>,
        metadata: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let contained = Self::target_contains_document(target_id, key, metadata);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), DocumentChangeType::Removed);
        } else {
            state.remove_document_change(key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .remove(&target_id);
        self.pending_document_updates_by_target
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key.clone(), document);
        }
    }

    /// Forgets buffered changes and reports every known key as removed; the
    /// server resends whatever still matches.
    fn reset_target(&mut self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) {
        self.target_states.insert(target_id, TargetState::default());
        for key in metadata.remote_keys(target_id) {
            self.remove_document_from_target(target_id, &key, None, metadata);
        }
    }

    fn current_document_count(&mut self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) -> usize {
        let change = self.ensure_target_state(target_id).to_target_change();
        (metadata.remote_keys(target_id).len() + change.added_documents.len())
            .saturating_sub(change.removed_documents.len())
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states.entry(target_id).or_default()
    }

    fn is_active_target(&self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) -> bool {
        self.target_data_for_active_target(target_id, metadata).is_some()
    }

    fn target_data_for_active_target<'m>(
        &self,
        target_id: TargetId,
        metadata: &'m dyn TargetMetadataProvider,
    ) -> Option<&'m TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => metadata.target_data(target_id),
        }
    }

    fn target_contains_document(
        target_id: TargetId,
        key: &DocumentKey,
        metadata: &dyn TargetMetadataProvider,
    ) -> bool {
        metadata.remote_keys(target_id).contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::query::Query;
    use crate::remote::watch_change::BloomFilterSpec;
    use crate::value::{MapValue, Value};
    use bytes::Bytes;
    use serde_json::json;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Metadata {
        targets: HashMap<TargetId, TargetData>,
        keys: HashMap<TargetId, BTreeSet<DocumentKey>>,
    }

    impl Metadata {
        fn with_target(mut self, target_id: TargetId, query: Query, keys: &[&str]) -> Self {
            self.targets.insert(
                target_id,
                TargetData::new(query, target_id, TargetPurpose::Listen, 1),
            );
            self.keys
                .insert(target_id, keys.iter().map(|path| key(path)).collect());
            self
        }

        fn with_limbo_target(mut self, target_id: TargetId, path: &str) -> Self {
            self.targets.insert(
                target_id,
                TargetData::new(
                    Query::document(&key(path)),
                    target_id,
                    TargetPurpose::LimboResolution,
                    1,
                ),
            );
            self
        }
    }

    impl TargetMetadataProvider for Metadata {
        fn remote_keys(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
            self.keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn target_data(&self, target_id: TargetId) -> Option<&TargetData> {
            self.targets.get(&target_id)
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(path: &str, version: i64) -> Document {
        let data: MapValue = Value::from_json(&json!({"v": version})).as_map().unwrap().clone();
        Document::found(key(path), SnapshotVersion::from_micros(version), data)
    }

    fn rooms() -> Query {
        Query::collection("rooms").unwrap()
    }

    #[test]
    fn aggregates_document_changes() {
        let metadata = Metadata::default().with_target(2, rooms(), &["rooms/b"]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator
            .handle_watch_change(WatchChange::updated(doc("rooms/a", 1), vec![2]), &metadata)
            .unwrap();
        aggregator
            .handle_watch_change(WatchChange::updated(doc("rooms/b", 1), vec![2]), &metadata)
            .unwrap();
        aggregator
            .handle_watch_change(WatchChange::current(vec![2], ResumeToken::from(vec![1])), &metadata)
            .unwrap();

        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(1), &metadata);
        let change = &event.target_changes[&2];
        assert!(change.current);
        assert_eq!(change.added_documents, BTreeSet::from([key("rooms/a")]));
        assert_eq!(change.modified_documents, BTreeSet::from([key("rooms/b")]));
        assert_eq!(event.document_updates.len(), 2);
        assert!(event.resolved_limbo_documents.is_empty());
    }

    #[test]
    fn add_then_remove_in_one_snapshot_cancels_out() {
        let metadata = Metadata::default().with_target(2, rooms(), &[]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator
            .handle_watch_change(WatchChange::updated(doc("rooms/a", 1), vec![2]), &metadata)
            .unwrap();
        aggregator
            .handle_watch_change(WatchChange::removed(key("rooms/a"), vec![2]), &metadata)
            .unwrap();

        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(1), &metadata);
        let change = &event.target_changes[&2];
        assert!(change.added_documents.is_empty());
        assert!(change.removed_documents.is_empty());
    }

    #[test]
    fn changes_for_pending_targets_are_ignored() {
        let metadata = Metadata::default().with_target(2, rooms(), &[]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.record_pending_target_request(2);
        aggregator
            .handle_watch_change(WatchChange::updated(doc("rooms/a", 1), vec![2]), &metadata)
            .unwrap();
        assert!(aggregator
            .create_remote_event(SnapshotVersion::from_micros(1), &metadata)
            .document_updates
            .is_empty());

        aggregator
            .handle_watch_change(WatchChange::add_targets(vec![2]), &metadata)
            .unwrap();
        aggregator
            .handle_watch_change(WatchChange::updated(doc("rooms/a", 1), vec![2]), &metadata)
            .unwrap();
        assert_eq!(
            aggregator
                .create_remote_event(SnapshotVersion::from_micros(2), &metadata)
                .document_updates
                .len(),
            1
        );
    }

    #[test]
    fn unexpected_acknowledgement_is_a_protocol_violation() {
        let metadata = Metadata::default().with_target(2, rooms(), &[]);
        let mut aggregator = WatchChangeAggregator::new();
        let err = aggregator
            .handle_watch_change(WatchChange::add_targets(vec![2]), &metadata)
            .unwrap_err();
        assert_eq!(err.code, crate::error::ReplicaErrorCode::ProtocolViolation);
    }

    #[test]
    fn existence_filter_zero_removes_every_document() {
        let metadata =
            Metadata::default().with_target(2, rooms(), &["rooms/a", "rooms/b", "rooms/c"]);
        let mut aggregator = WatchChangeAggregator::new();
        let outcome = aggregator
            .handle_existence_filter(
                ExistenceFilterChange {
                    target_id: 2,
                    count: 0,
                    bloom_filter: None,
                },
                &metadata,
            )
            .unwrap();
        assert_eq!(outcome, ExistenceFilterOutcome::Reset { checks: 0 });

        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(5), &metadata);
        assert_eq!(event.target_changes[&2].removed_documents.len(), 3);
        assert!(event.target_resets.contains(&2));
        assert_eq!(
            event.filtered_documents[&2],
            BTreeSet::from([key("rooms/a"), key("rooms/b"), key("rooms/c")])
        );
        assert!(aggregator
            .create_remote_event(SnapshotVersion::from_micros(6), &metadata)
            .filtered_documents
            .is_empty());
    }

    #[test]
    fn document_resent_after_filter_is_not_reported_as_filtered() {
        let metadata = Metadata::default().with_target(2, rooms(), &["rooms/a", "rooms/b"]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator
            .handle_existence_filter(
                ExistenceFilterChange {
                    target_id: 2,
                    count: 0,
                    bloom_filter: None,
                },
                &metadata,
            )
            .unwrap();
        aggregator
            .handle_watch_change(WatchChange::updated(doc("rooms/a", 2), vec![2]), &metadata)
            .unwrap();

        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(5), &metadata);
        assert_eq!(event.filtered_documents[&2], BTreeSet::from([key("rooms/b")]));
    }

    #[test]
    fn bloom_filter_prunes_with_one_test_per_key() {
        let metadata =
            Metadata::default().with_target(2, rooms(), &["rooms/a", "rooms/b", "rooms/c"]);
        let mut bloom_filter = BloomFilter::new(vec![0; 64], 0, 5).unwrap();
        bloom_filter.insert("rooms/a");
        bloom_filter.insert("rooms/b");

        let mut aggregator = WatchChangeAggregator::new();
        let outcome = aggregator
            .handle_existence_filter(
                ExistenceFilterChange {
                    target_id: 2,
                    count: 2,
                    bloom_filter: Some(BloomFilterSpec {
                        bitmap: Bytes::from(bloom_filter.bitmap().to_vec()),
                        padding: 0,
                        hash_count: 5,
                    }),
                },
                &metadata,
            )
            .unwrap();
        assert_eq!(
            outcome,
            ExistenceFilterOutcome::Pruned {
                checks: 3,
                removed: 1
            }
        );

        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(5), &metadata);
        assert_eq!(
            event.target_changes[&2].removed_documents,
            BTreeSet::from([key("rooms/c")])
        );
        assert_eq!(event.filtered_documents[&2], BTreeSet::from([key("rooms/c")]));
        assert!(event.target_resets.is_empty());
    }

    #[test]
    fn bloom_filter_that_cannot_explain_count_resets() {
        let metadata = Metadata::default().with_target(2, rooms(), &["rooms/a", "rooms/b"]);
        let full = BloomFilterSpec {
            bitmap: Bytes::from(vec![0xff; 8]),
            padding: 0,
            hash_count: 3,
        };
        let mut aggregator = WatchChangeAggregator::new();
        let outcome = aggregator
            .handle_existence_filter(
                ExistenceFilterChange {
                    target_id: 2,
                    count: 1,
                    bloom_filter: Some(full),
                },
                &metadata,
            )
            .unwrap();
        assert_eq!(outcome, ExistenceFilterOutcome::Reset { checks: 2 });
    }

    #[test]
    fn current_limbo_target_without_document_synthesizes_delete() {
        let metadata = Metadata::default().with_limbo_target(1, "rooms/a");
        let mut aggregator = WatchChangeAggregator::new();
        aggregator
            .handle_watch_change(WatchChange::current(vec![1], ResumeToken::from(vec![9])), &metadata)
            .unwrap();

        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(4), &metadata);
        let deleted = &event.document_updates[&key("rooms/a")];
        assert!(deleted.is_missing());
        assert_eq!(deleted.version(), SnapshotVersion::from_micros(4));
        assert!(event.resolved_limbo_documents.contains(&key("rooms/a")));
    }
}
