use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::core::document_set::DocumentSet;
use crate::core::query::{DocumentComparator, LimitType, Query};
use crate::core::view_snapshot::{
    ChangeType, DocumentChangeSet, DocumentViewChange, ViewSnapshot,
};
use crate::error::ReplicaResult;
use crate::model::{Document, DocumentKey};
use crate::remote::{OnlineState, TargetChange};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SyncState {
    /// Results may be stale or incomplete.
    Local,
    /// The target is current and no displayed document is in limbo.
    Synced,
}

/// A displayed document started or stopped needing confirmation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

/// Result of [`View::compute_doc_changes`], not yet applied to the view.
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    /// A document left the limit window and the local cache has to be
    /// queried again for its replacement.
    pub needs_refill: bool,
    pub mutated_keys: BTreeSet<DocumentKey>,
}

#[derive(Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Materialized results of one query.
///
/// The view keeps the documents currently shown, the keys the server last
/// reported for the target (`synced_documents`) and the displayed keys the
/// server has not confirmed (`limbo_documents`).
pub struct View {
    query: Query,
    comparator: DocumentComparator,
    current: bool,
    documents: DocumentSet,
    sync_state: Option<SyncState>,
    limbo_documents: BTreeSet<DocumentKey>,
    synced_documents: BTreeSet<DocumentKey>,
    mutated_keys: BTreeSet<DocumentKey>,
    /// Keys an existence filter dropped from the target. They stay hidden
    /// until the server sends them again or they gain a local write.
    filtered_documents: BTreeSet<DocumentKey>,
}

impl View {
    pub fn new(query: Query, synced_documents: BTreeSet<DocumentKey>) -> Self {
        let comparator = query.comparator();
        Self {
            documents: DocumentSet::new(comparator.clone()),
            comparator,
            query,
            current: false,
            sync_state: None,
            limbo_documents: BTreeSet::new(),
            synced_documents,
            mutated_keys: BTreeSet::new(),
            filtered_documents: BTreeSet::new(),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    pub fn is_current(&self) -> bool {
        self.current
    }

    /// Hides `keys` from the results. The next diff over those keys reports
    /// them as removed.
    pub fn hide_filtered_documents(&mut self, keys: &BTreeSet<DocumentKey>) {
        self.filtered_documents.extend(keys.iter().cloned());
    }

    /// Keys the server sent again for the target become visible again.
    pub fn restore_filtered_documents(&mut self, change: &TargetChange) {
        if self.filtered_documents.is_empty() {
            return;
        }
        for key in change.added_documents.iter().chain(&change.modified_documents) {
            self.filtered_documents.remove(key);
        }
    }

    fn is_filtered_out(&self, document: &Document) -> bool {
        !document.has_pending_writes() && self.filtered_documents.contains(document.key())
    }

    /// Diffs `changed` against the view (or against `previous`, when
    /// refilling after a limit was underrun) without modifying it.
    pub fn compute_doc_changes(
        &self,
        changed: &BTreeMap<DocumentKey, Document>,
        previous: Option<ViewDocumentChanges>,
    ) -> ReplicaResult<ViewDocumentChanges> {
        let (mut change_set, old_documents, mut mutated_keys) = match previous {
            Some(previous) => (
                previous.change_set,
                previous.document_set,
                previous.mutated_keys,
            ),
            None => (
                DocumentChangeSet::new(),
                self.documents.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut documents = old_documents.clone();
        let mut needs_refill = false;

        let limit = self.query.limit_value().map(|limit| limit as usize);
        let at_limit = limit == Some(old_documents.len());
        let last_in_limit = match self.query.limit_type() {
            LimitType::First if at_limit => old_documents.last().cloned(),
            _ => None,
        };
        let first_in_limit = match self.query.limit_type() {
            LimitType::Last if at_limit => old_documents.first().cloned(),
            _ => None,
        };

        for (key, entry) in changed {
            let old = old_documents.get(key);
            let new = (self.query.matches(entry) && !self.is_filtered_out(entry)).then_some(entry);

            let old_had_pending = old.is_some_and(|old| self.mutated_keys.contains(old.key()));
            let new_has_pending = new.is_some_and(Document::has_pending_writes);

            let mut applied = false;
            match (old, new) {
                (Some(old), Some(new)) => {
                    if old.data() != new.data() {
                        if !should_wait_for_synced_document(old, new) {
                            change_set.track(DocumentViewChange {
                                change_type: ChangeType::Modified,
                                document: new.clone(),
                            })?;
                            applied = true;
                            let past_last = last_in_limit
                                .as_ref()
                                .is_some_and(|last| self.compare(new, last) == Ordering::Greater);
                            let before_first = first_in_limit
                                .as_ref()
                                .is_some_and(|first| self.compare(new, first) == Ordering::Less);
                            if past_last || before_first {
                                needs_refill = true;
                            }
                        }
                    } else if old_had_pending != new_has_pending {
                        change_set.track(DocumentViewChange {
                            change_type: ChangeType::Metadata,
                            document: new.clone(),
                        })?;
                        applied = true;
                    }
                }
                (None, Some(new)) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Added,
                        document: new.clone(),
                    })?;
                    applied = true;
                }
                (Some(old), None) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Removed,
                        document: old.clone(),
                    })?;
                    applied = true;
                    if last_in_limit.is_some() || first_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if applied {
                match new {
                    Some(new) => {
                        documents = documents.add(new.clone());
                        if new_has_pending {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                    }
                    None => {
                        documents = documents.delete(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while documents.len() > limit {
                let evicted = match self.query.limit_type() {
                    LimitType::First => documents.last().cloned(),
                    LimitType::Last => documents.first().cloned(),
                };
                let Some(evicted) = evicted else {
                    break;
                };
                documents = documents.delete(evicted.key());
                mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange {
                    change_type: ChangeType::Removed,
                    document: evicted,
                })?;
            }
        }

        Ok(ViewDocumentChanges {
            document_set: documents,
            change_set,
            needs_refill,
            mutated_keys,
        })
    }

    /// Installs `doc_changes`, folds in the target change and recomputes the
    /// limbo set. Produces a snapshot unless nothing visible changed.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        let old_documents = std::mem::replace(&mut self.documents, doc_changes.document_set);
        self.mutated_keys = doc_changes.mutated_keys;
        let changes = doc_changes.change_set.sorted_changes(&self.query);

        self.apply_target_change(target_change);
        let limbo_changes = if target_is_pending_reset {
            Vec::new()
        } else {
            self.update_limbo_documents()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let new_state = if synced {
            SyncState::Synced
        } else {
            SyncState::Local
        };
        let sync_state_changed = self.sync_state != Some(new_state);
        self.sync_state = Some(new_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }

        let has_cached_results =
            target_change.is_some_and(|change| !change.resume_token.is_empty());
        let snapshot = ViewSnapshot::new(
            self.query.clone(),
            self.documents.clone(),
            old_documents,
            changes,
            self.mutated_keys.clone(),
            new_state == SyncState::Local,
            sync_state_changed,
            has_cached_results,
        );
        ViewChange {
            snapshot: Some(snapshot),
            limbo_changes,
        }
    }

    /// Going offline makes a current view fall back to cached results.
    pub fn apply_online_state_change(&mut self, state: OnlineState) -> ViewChange {
        if !(self.current && state == OnlineState::Offline) {
            return ViewChange::default();
        }
        self.current = false;
        let unchanged = ViewDocumentChanges {
            document_set: self.documents.clone(),
            change_set: DocumentChangeSet::new(),
            needs_refill: false,
            mutated_keys: self.mutated_keys.clone(),
        };
        self.apply_changes(unchanged, None, false)
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        self.synced_documents
            .extend(change.added_documents.iter().cloned());
        for key in &change.modified_documents {
            if !self.synced_documents.contains(key) {
                log::debug!("modified document {key} was not synced for {}", self.query);
            }
        }
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let previous = std::mem::take(&mut self.limbo_documents);
        self.limbo_documents = self
            .documents
            .iter()
            .filter(|document| self.should_be_in_limbo(document))
            .map(|document| document.key().clone())
            .collect();

        let mut changes: Vec<LimboDocumentChange> = previous
            .difference(&self.limbo_documents)
            .cloned()
            .map(LimboDocumentChange::Removed)
            .collect();
        changes.extend(
            self.limbo_documents
                .difference(&previous)
                .cloned()
                .map(LimboDocumentChange::Added),
        );
        changes
    }

    fn should_be_in_limbo(&self, document: &Document) -> bool {
        !self.synced_documents.contains(document.key()) && !document.has_pending_writes()
    }

    fn compare(&self, left: &Document, right: &Document) -> Ordering {
        self.comparator.as_ref()(left, right)
    }
}

/// An acknowledged write replaced a locally modified document before the
/// watch stream delivered the server version; keep showing the local one.
fn should_wait_for_synced_document(old: &Document, new: &Document) -> bool {
    old.has_pending_writes() && new.has_committed_mutations() && !new.has_pending_writes()
}
