mod common;

use common::{eventually, key, keys_of, map, version, Fixture, Recorder};
use firestore_replica::model::ResumeToken;
use firestore_replica::remote::{TargetChangeState, WatchChange, WatchTargetChange};
use firestore_replica::{
    ChangeType, Direction, Document, ListenOptions, Mutation, OnlineState, Query,
    ReplicaError, ReplicaErrorCode,
};
use serde_json::json;

fn doc(path: &str, seconds: i64, data: serde_json::Value) -> Document {
    Document::found(key(path), version(seconds), map(data))
}

fn token(value: &str) -> ResumeToken {
    ResumeToken::new(value.as_bytes().to_vec())
}

fn rooms() -> Query {
    Query::collection("rooms").unwrap()
}

/// Acknowledges `target`, sends `docs` for it and marks it current at
/// `seconds`.
fn deliver_current(f: &Fixture, target: i32, docs: Vec<Document>, seconds: i64) {
    let resume = token(&format!("t{seconds}"));
    f.transport.push_watch(WatchChange::add_targets(vec![target]));
    for document in docs {
        f.transport.push_watch(WatchChange::updated(document, vec![target]));
    }
    f.transport
        .push_watch(WatchChange::current(vec![target], resume.clone()));
    f.transport
        .push_watch(WatchChange::snapshot(version(seconds), resume));
}

#[tokio::test(flavor = "multi_thread")]
async fn listener_sees_server_results_and_local_writes() {
    let f = Fixture::online().await;
    let recorder = Recorder::default();
    let _registration = recorder.listen(&f.engine, rooms()).await;
    assert_eq!(recorder.count(), 0);

    let target = f.target_for(&rooms());
    deliver_current(&f, target, vec![doc("rooms/a", 1, json!({"n": 1}))], 1);
    f.settle().await;

    let snapshot = recorder.last();
    assert!(!snapshot.from_cache());
    assert_eq!(keys_of(&snapshot), vec!["rooms/a"]);
    assert_eq!(f.engine.online_state().await.unwrap(), OnlineState::Online);

    f.engine
        .enqueue_mutations(vec![Mutation::set(key("rooms/b"), map(json!({"n": 2})))])
        .await
        .unwrap();
    let snapshot = recorder.last();
    assert_eq!(keys_of(&snapshot), vec!["rooms/a", "rooms/b"]);
    assert!(snapshot.has_pending_writes());
    assert!(snapshot.has_pending_writes_for(&key("rooms/b")));
}

#[tokio::test(flavor = "multi_thread")]
async fn changes_within_one_snapshot_are_coalesced() {
    let f = Fixture::online().await;
    let recorder = Recorder::default();
    let _registration = recorder.listen(&f.engine, rooms()).await;
    let target = f.target_for(&rooms());
    deliver_current(&f, target, vec![doc("rooms/a", 1, json!({"n": 1}))], 1);
    f.settle().await;
    let delivered = recorder.count();

    f.transport.push_watch(WatchChange::updated(
        doc("rooms/b", 2, json!({"n": 2})),
        vec![target],
    ));
    f.transport
        .push_watch(WatchChange::deleted(key("rooms/b"), version(2), vec![target]));
    f.transport
        .push_watch(WatchChange::snapshot(version(2), token("t2")));
    f.settle().await;

    assert_eq!(recorder.count(), delivered);
    let cached = f.engine.get_document_from_cache(key("rooms/b")).await.unwrap();
    assert!(!cached.is_found());
}

#[tokio::test(flavor = "multi_thread")]
async fn existence_filter_of_zero_removes_every_document() {
    let f = Fixture::online().await;
    let recorder = Recorder::default();
    let _registration = recorder.listen(&f.engine, rooms()).await;
    let target = f.target_for(&rooms());
    deliver_current(
        &f,
        target,
        vec![
            doc("rooms/a", 1, json!({"n": 1})),
            doc("rooms/b", 1, json!({"n": 2})),
            doc("rooms/c", 1, json!({"n": 3})),
        ],
        1,
    );
    f.settle().await;
    assert_eq!(recorder.last().len(), 3);

    // The filter disagrees with what the client holds, so every cached
    // result leaves the view with the filter's snapshot.
    f.transport
        .push_watch(WatchChange::existence_filter(target, 0));
    f.transport
        .push_watch(WatchChange::snapshot(version(2), token("t2")));
    f.settle().await;

    let snapshot = recorder.last();
    assert!(snapshot.is_empty());
    let removed = snapshot
        .document_changes()
        .iter()
        .filter(|change| change.change_type == ChangeType::Removed)
        .count();
    assert_eq!(removed, 3);

    // The target is listened to again from scratch and stays empty.
    let delivered = recorder.count();
    f.transport.push_watch(WatchChange::TargetChange(WatchTargetChange::new(
        TargetChangeState::Remove,
        vec![target],
    )));
    deliver_current(&f, target, Vec::new(), 3);
    f.settle().await;

    assert!(f.limbo_targets().is_empty());
    assert_eq!(recorder.count(), delivered);
    assert!(recorder.last().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn single_document_limits_agree_in_both_directions() {
    let f = Fixture::offline().await;
    f.engine
        .enqueue_mutations(vec![Mutation::set(key("rooms/only"), map(json!({"n": 1})))])
        .await
        .unwrap();

    let ascending = Recorder::default();
    let descending = Recorder::default();
    let _a = ascending
        .listen(
            &f.engine,
            rooms().order_by("n", Direction::Ascending).unwrap().limit(1).unwrap(),
        )
        .await;
    let _d = descending
        .listen(
            &f.engine,
            rooms().order_by("n", Direction::Descending).unwrap().limit(1).unwrap(),
        )
        .await;

    assert_eq!(keys_of(&ascending.last()), vec!["rooms/only"]);
    assert_eq!(keys_of(&descending.last()), vec!["rooms/only"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn detached_listener_receives_nothing_further() {
    let f = Fixture::offline().await;
    f.engine
        .enqueue_mutations(vec![Mutation::set(key("rooms/a"), map(json!({"n": 1})))])
        .await
        .unwrap();

    let recorder = Recorder::default();
    let mut registration = recorder.listen(&f.engine, rooms()).await;
    assert_eq!(recorder.count(), 1);

    registration.detach();
    f.engine
        .enqueue_mutations(vec![Mutation::set(key("rooms/b"), map(json!({"n": 2})))])
        .await
        .unwrap();
    f.settle().await;
    assert_eq!(recorder.count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_listen_reaches_the_error_callback() {
    let f = Fixture::online().await;
    let recorder = Recorder::default();
    let query = Query::collection("secret").unwrap();
    let _registration = recorder.listen(&f.engine, query.clone()).await;
    let target = f.target_for(&query);

    let change = WatchTargetChange::new(TargetChangeState::Remove, vec![target])
        .with_cause(ReplicaError::new(ReplicaErrorCode::PermissionDenied, "denied"));
    f.transport.push_watch(WatchChange::TargetChange(change));
    f.settle().await;

    let errors = recorder.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code, ReplicaErrorCode::PermissionDenied);
}

#[tokio::test(flavor = "multi_thread")]
async fn going_offline_marks_results_as_cached() {
    let f = Fixture::online().await;
    let recorder = Recorder::default();
    let options = ListenOptions {
        include_metadata_changes: true,
        ..ListenOptions::default()
    };
    let _registration = recorder.listen_with(&f.engine, rooms(), options).await;
    let target = f.target_for(&rooms());
    deliver_current(&f, target, vec![doc("rooms/a", 1, json!({"n": 1}))], 1);
    f.settle().await;
    assert!(!recorder.last().from_cache());

    f.engine.disable_network().await.unwrap();
    assert_eq!(f.engine.online_state().await.unwrap(), OnlineState::Offline);
    let snapshot = recorder.last();
    assert!(snapshot.from_cache());
    assert_eq!(keys_of(&snapshot), vec!["rooms/a"]);

    f.engine.enable_network().await.unwrap();
    eventually(|| f.transport.watch_open_count() == 2).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cache_reads_combine_server_and_local_state() {
    let f = Fixture::online().await;
    let recorder = Recorder::default();
    let registration = recorder.listen(&f.engine, rooms()).await;
    let target = f.target_for(&rooms());
    deliver_current(&f, target, vec![doc("rooms/a", 1, json!({"n": 1}))], 1);
    f.settle().await;
    drop(registration);

    f.engine
        .enqueue_mutations(vec![Mutation::patch(key("rooms/a"), map(json!({"m": 2})))])
        .await
        .unwrap();

    let snapshot = f.engine.get_from_cache(rooms()).await.unwrap();
    assert!(snapshot.from_cache());
    assert_eq!(keys_of(&snapshot), vec!["rooms/a"]);
    let cached = f.engine.get_document_from_cache(key("rooms/a")).await.unwrap();
    assert_eq!(cached.data(), Some(&map(json!({"n": 1, "m": 2}))));
    assert!(cached.has_pending_writes());
}
