use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::query::Query;
use crate::core::view_snapshot::ViewSnapshot;
use crate::error::ReplicaError;
use crate::model::TargetId;
use crate::remote::OnlineState;

pub type SnapshotCallback = Arc<dyn Fn(ViewSnapshot) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(ReplicaError) + Send + Sync>;

/// Identifies one registered listener.
pub type ListenerId = u64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Also deliver snapshots in which only metadata changed.
    pub include_metadata_changes: bool,
    /// Hold back the first snapshot while online until the server answered,
    /// instead of showing cached results.
    pub wait_for_sync_when_online: bool,
}

/// Callbacks of one listener. Deactivated callbacks are never invoked again,
/// even for notifications already queued.
pub struct ListenerCallbacks {
    active: AtomicBool,
    on_snapshot: SnapshotCallback,
    on_error: ErrorCallback,
}

impl ListenerCallbacks {
    pub fn new(on_snapshot: SnapshotCallback, on_error: ErrorCallback) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicBool::new(true),
            on_snapshot,
            on_error,
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

impl Debug for ListenerCallbacks {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerCallbacks")
            .field("active", &self.is_active())
            .finish()
    }
}

/// A callback invocation waiting to be delivered outside the engine lock.
pub enum Notification {
    Snapshot {
        listener: Arc<ListenerCallbacks>,
        snapshot: ViewSnapshot,
    },
    Error {
        listener: Arc<ListenerCallbacks>,
        error: ReplicaError,
    },
}

impl Notification {
    pub fn deliver(self) {
        match self {
            Notification::Snapshot { listener, snapshot } => {
                if listener.is_active() {
                    (listener.on_snapshot)(snapshot);
                }
            }
            Notification::Error { listener, error } => {
                if listener.is_active() {
                    listener.deactivate();
                    (listener.on_error)(error);
                }
            }
        }
    }
}

/// Decides which view snapshots one listener gets to see.
struct QueryListener {
    id: ListenerId,
    options: ListenOptions,
    callbacks: Arc<ListenerCallbacks>,
    raised_initial_event: bool,
    online_state: OnlineState,
    snapshot: Option<ViewSnapshot>,
}

impl QueryListener {
    fn new(id: ListenerId, options: ListenOptions, callbacks: Arc<ListenerCallbacks>) -> Self {
        Self {
            id,
            options,
            callbacks,
            raised_initial_event: false,
            online_state: OnlineState::Unknown,
            snapshot: None,
        }
    }

    fn on_view_snapshot(&mut self, snapshot: &ViewSnapshot) -> Option<ViewSnapshot> {
        let snapshot = if self.options.include_metadata_changes {
            snapshot.clone()
        } else {
            snapshot.without_metadata_changes()
        };

        let raised = if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot) {
                Some(self.raise_initial_event(&snapshot))
            } else {
                None
            }
        } else if self.should_raise_event(&snapshot) {
            Some(snapshot.clone())
        } else {
            None
        };
        self.snapshot = Some(snapshot);
        raised
    }

    fn apply_online_state_change(&mut self, state: OnlineState) -> Option<ViewSnapshot> {
        self.online_state = state;
        match &self.snapshot {
            Some(snapshot)
                if !self.raised_initial_event
                    && self.should_raise_initial_event(snapshot) =>
            {
                let snapshot = snapshot.clone();
                Some(self.raise_initial_event(&snapshot))
            }
            _ => None,
        }
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.from_cache() {
            return true;
        }
        let maybe_online = self.online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // Cached results are shown once there are some, or once we know
        // the server is not going to answer soon.
        !snapshot.is_empty()
            || snapshot.has_cached_results()
            || self.online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.document_changes().is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snapshot
            .as_ref()
            .is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed() || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot) -> ViewSnapshot {
        self.raised_initial_event = true;
        ViewSnapshot::from_initial_documents(snapshot)
    }
}

struct QueryListeners {
    query: Query,
    target_id: TargetId,
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<QueryListener>,
}

/// Fans view snapshots out to listeners, grouped by query.
#[derive(Default)]
pub struct EventManager {
    queries: BTreeMap<String, QueryListeners>,
    online_state: OnlineState,
    notifications: Vec<Notification>,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_query(&self, query: &Query) -> bool {
        self.queries.contains_key(&query.canonical_id())
    }

    pub fn target_for(&self, query: &Query) -> Option<TargetId> {
        self.queries
            .get(&query.canonical_id())
            .map(|entry| entry.target_id)
    }

    pub fn add_query(&mut self, query: &Query, target_id: TargetId) {
        self.queries
            .entry(query.canonical_id())
            .or_insert_with(|| QueryListeners {
                query: query.clone(),
                target_id,
                view_snapshot: None,
                listeners: Vec::new(),
            });
    }

    /// Registers a listener on an already added query and raises its first
    /// event right away when the view has one.
    pub fn add_listener(
        &mut self,
        query: &Query,
        id: ListenerId,
        options: ListenOptions,
        callbacks: Arc<ListenerCallbacks>,
    ) {
        let online_state = self.online_state;
        let Some(entry) = self.queries.get_mut(&query.canonical_id()) else {
            log::warn!("listener {id} registered for unknown query {query}");
            return;
        };
        let mut listener = QueryListener::new(id, options, callbacks);
        let mut raised = listener.apply_online_state_change(online_state);
        if let Some(snapshot) = &entry.view_snapshot {
            if let Some(event) = listener.on_view_snapshot(snapshot) {
                raised = Some(event);
            }
        }
        if let Some(snapshot) = raised {
            self.notifications.push(Notification::Snapshot {
                listener: listener.callbacks.clone(),
                snapshot,
            });
        }
        entry.listeners.push(listener);
    }

    /// Removes the listener. Returns the query's target when it was the last
    /// listener, so the caller can stop listening.
    pub fn remove_listener(&mut self, id: ListenerId) -> Option<(Query, TargetId)> {
        let canonical_id = self
            .queries
            .iter()
            .find(|(_, entry)| entry.listeners.iter().any(|listener| listener.id == id))
            .map(|(canonical_id, _)| canonical_id.clone())?;
        let entry = self.queries.get_mut(&canonical_id)?;
        if let Some(position) = entry.listeners.iter().position(|listener| listener.id == id) {
            let listener = entry.listeners.remove(position);
            listener.callbacks.deactivate();
        }
        if !entry.listeners.is_empty() {
            return None;
        }
        let entry = self.queries.remove(&canonical_id)?;
        Some((entry.query, entry.target_id))
    }

    /// Target of the query a listener is registered on.
    pub fn listener_target(&self, id: ListenerId) -> Option<TargetId> {
        self.queries
            .values()
            .find(|entry| entry.listeners.iter().any(|listener| listener.id == id))
            .map(|entry| entry.target_id)
    }

    pub fn on_watch_change(&mut self, snapshots: Vec<ViewSnapshot>) {
        for snapshot in snapshots {
            let Some(entry) = self.queries.get_mut(&snapshot.query().canonical_id()) else {
                continue;
            };
            for listener in &mut entry.listeners {
                if let Some(raised) = listener.on_view_snapshot(&snapshot) {
                    self.notifications.push(Notification::Snapshot {
                        listener: listener.callbacks.clone(),
                        snapshot: raised,
                    });
                }
            }
            entry.view_snapshot = Some(snapshot);
        }
    }

    /// The query failed; every listener gets the error and is dropped.
    pub fn on_watch_error(&mut self, query: &Query, error: ReplicaError) {
        let Some(entry) = self.queries.remove(&query.canonical_id()) else {
            return;
        };
        for listener in entry.listeners {
            self.notifications.push(Notification::Error {
                listener: listener.callbacks,
                error: error.clone(),
            });
        }
    }

    pub fn on_online_state_change(&mut self, state: OnlineState) {
        self.online_state = state;
        for entry in self.queries.values_mut() {
            for listener in &mut entry.listeners {
                if let Some(raised) = listener.apply_online_state_change(state) {
                    self.notifications.push(Notification::Snapshot {
                        listener: listener.callbacks.clone(),
                        snapshot: raised,
                    });
                }
            }
        }
    }

    pub fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }

    /// Drops every listener without notifying it.
    pub fn clear(&mut self) {
        for entry in self.queries.values() {
            for listener in &entry.listeners {
                listener.callbacks.deactivate();
            }
        }
        self.queries.clear();
        self.notifications.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use super::*;
    use crate::core::view::View;
    use crate::model::{Document, DocumentKey, SnapshotVersion, Timestamp};
    use crate::remote::TargetChange;
    use crate::value::Value;

    fn doc(path: &str) -> Document {
        let data = Value::from_json(&serde_json::json!({ "n": 1 }));
        Document::found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            data.as_map().unwrap().clone(),
        )
    }

    fn recording() -> (Arc<ListenerCallbacks>, Arc<Mutex<Vec<ViewSnapshot>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callbacks = ListenerCallbacks::new(
            Arc::new(move |snapshot| sink.lock().unwrap().push(snapshot)),
            Arc::new(|_| {}),
        );
        (callbacks, seen)
    }

    fn deliver(manager: &mut EventManager) {
        for notification in manager.take_notifications() {
            notification.deliver();
        }
    }

    fn view_with(query: &Query, documents: &[Document], current: bool) -> ViewSnapshot {
        let mut view = View::new(query.clone(), BTreeSet::new());
        let changed = documents
            .iter()
            .map(|document| (document.key().clone(), document.clone()))
            .collect();
        let doc_changes = view.compute_doc_changes(&changed, None).unwrap();
        let target = TargetChange {
            current,
            added_documents: documents.iter().map(|d| d.key().clone()).collect(),
            ..TargetChange::default()
        };
        view.apply_changes(doc_changes, Some(&target), false)
            .snapshot
            .unwrap()
    }

    #[test]
    fn empty_cached_results_wait_for_the_server() {
        let query = Query::collection("rooms").unwrap();
        let mut manager = EventManager::new();
        let (callbacks, seen) = recording();
        manager.add_query(&query, 1);
        manager.add_listener(&query, 7, ListenOptions::default(), callbacks);

        manager.on_watch_change(vec![view_with(&query, &[], false)]);
        deliver(&mut manager);
        assert!(seen.lock().unwrap().is_empty());

        manager.on_online_state_change(OnlineState::Offline);
        deliver(&mut manager);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn server_results_are_raised_as_additions() {
        let query = Query::collection("rooms").unwrap();
        let mut manager = EventManager::new();
        let (callbacks, seen) = recording();
        manager.add_query(&query, 1);
        manager.add_listener(&query, 7, ListenOptions::default(), callbacks);

        manager.on_watch_change(vec![view_with(&query, &[doc("rooms/a")], true)]);
        deliver(&mut manager);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].from_cache());
        assert_eq!(seen[0].document_changes().len(), 1);
    }

    #[test]
    fn late_listener_gets_current_snapshot() {
        let query = Query::collection("rooms").unwrap();
        let mut manager = EventManager::new();
        manager.add_query(&query, 1);
        manager.on_watch_change(vec![view_with(&query, &[doc("rooms/a")], true)]);

        let (callbacks, seen) = recording();
        manager.add_listener(&query, 8, ListenOptions::default(), callbacks);
        deliver(&mut manager);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn removing_last_listener_releases_query() {
        let query = Query::collection("rooms").unwrap();
        let mut manager = EventManager::new();
        let (first, _) = recording();
        let (second, _) = recording();
        manager.add_query(&query, 1);
        manager.on_watch_change(vec![view_with(&query, &[], true)]);
        manager.add_listener(&query, 1, ListenOptions::default(), first.clone());
        manager.add_listener(&query, 2, ListenOptions::default(), second);

        assert!(manager.remove_listener(1).is_none());
        assert!(!first.is_active());
        let (released, target) = manager.remove_listener(2).unwrap();
        assert_eq!(released, query);
        assert_eq!(target, 1);
        assert!(!manager.has_query(&query));
    }

    #[test]
    fn errors_deactivate_listeners() {
        let query = Query::collection("rooms").unwrap();
        let mut manager = EventManager::new();
        let errors = Arc::new(Mutex::new(0));
        let counter = errors.clone();
        let callbacks = ListenerCallbacks::new(
            Arc::new(|_| {}),
            Arc::new(move |_| *counter.lock().unwrap() += 1),
        );
        manager.add_query(&query, 1);
        manager.add_listener(&query, 1, ListenOptions::default(), callbacks.clone());

        manager.on_watch_error(&query, crate::error::permission_denied("denied"));
        deliver(&mut manager);
        assert_eq!(*errors.lock().unwrap(), 1);
        assert!(!callbacks.is_active());
        assert!(!manager.has_query(&query));
    }
}
