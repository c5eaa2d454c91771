mod common;

use common::{eventually, key, map, version, Fixture};
use firestore_replica::model::MutationResult;
use firestore_replica::remote::WriteResponse;
use firestore_replica::{Mutation, ReplicaError, ReplicaErrorCode, StorageMode};
use serde_json::json;

#[tokio::test(flavor = "multi_thread")]
async fn offline_write_is_visible_until_acknowledged() {
    let f = Fixture::offline().await;
    let doc_key = key("rooms/k");

    let pending = f
        .engine
        .enqueue_mutations(vec![Mutation::set(doc_key.clone(), map(json!({"name": "a"})))])
        .await
        .unwrap();

    let doc = f.engine.get_document_from_cache(doc_key.clone()).await.unwrap();
    assert_eq!(doc.data(), Some(&map(json!({"name": "a"}))));
    assert!(doc.has_pending_writes());
    assert!(f.transport.write_requests().is_empty());

    f.engine.enable_network().await.unwrap();
    assert_eq!(f.transport.write_requests().len(), 1);
    assert!(f.transport.ack_write(pending.batch_id(), version(7)));
    pending.await.unwrap();

    let doc = f.engine.get_document_from_cache(doc_key).await.unwrap();
    assert_eq!(doc.data(), Some(&map(json!({"name": "a"}))));
    assert!(!doc.has_pending_writes());
    assert_eq!(doc.version(), version(7));
}

#[tokio::test(flavor = "multi_thread")]
async fn local_view_replays_every_pending_batch() {
    let f = Fixture::offline().await;
    let doc_key = key("rooms/replay");
    let steps = vec![
        (Mutation::set(doc_key.clone(), map(json!({"n": 1}))), Some(json!({"n": 1}))),
        (
            Mutation::patch(doc_key.clone(), map(json!({"m": 2}))),
            Some(json!({"n": 1, "m": 2})),
        ),
        (Mutation::delete(doc_key.clone()), None),
        (Mutation::set(doc_key.clone(), map(json!({"n": 3}))), Some(json!({"n": 3}))),
        (Mutation::patch(doc_key.clone(), map(json!({"n": 4}))), Some(json!({"n": 4}))),
    ];

    for (mutation, expected) in steps {
        f.engine.enqueue_mutations(vec![mutation]).await.unwrap();
        let doc = f.engine.get_document_from_cache(doc_key.clone()).await.unwrap();
        match expected {
            Some(expected) => assert_eq!(doc.data(), Some(&map(expected))),
            None => assert!(!doc.is_found()),
        }
    }

    f.engine.terminate().await.unwrap();
    let restored = Fixture::restore(
        firestore_replica::ReplicaSettings {
            network_enabled: false,
            ..Default::default()
        },
        f.persistence.clone(),
    )
    .await;
    let doc = restored
        .engine
        .get_document_from_cache(doc_key)
        .await
        .unwrap();
    assert_eq!(doc.data(), Some(&map(json!({"n": 4}))));
    assert!(doc.has_pending_writes());
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_batch_is_reverted_and_later_batches_survive() {
    let f = Fixture::online().await;
    let doc_key = key("rooms/k");

    let first = f
        .engine
        .enqueue_mutations(vec![Mutation::set(doc_key.clone(), map(json!({"n": 1})))])
        .await
        .unwrap();
    let second = f
        .engine
        .enqueue_mutations(vec![Mutation::set(doc_key.clone(), map(json!({"n": 9})))])
        .await
        .unwrap();
    let third = f
        .engine
        .enqueue_mutations(vec![Mutation::patch(doc_key.clone(), map(json!({"m": 2})))])
        .await
        .unwrap();
    let (b1, b2, b3) = (first.batch_id(), second.batch_id(), third.batch_id());
    assert!(b1 < b2 && b2 < b3);
    assert_eq!(f.transport.write_requests().len(), 1);

    assert!(f.transport.ack_write(b1, version(5)));
    first.await.unwrap();

    assert!(f.transport.reject_write(
        b2,
        ReplicaError::new(ReplicaErrorCode::PermissionDenied, "no access")
    ));
    let err = second.await.unwrap_err();
    assert_eq!(err.code, ReplicaErrorCode::PermissionDenied);

    let doc = f.engine.get_document_from_cache(doc_key.clone()).await.unwrap();
    assert_eq!(doc.data(), Some(&map(json!({"n": 1, "m": 2}))));
    assert!(doc.has_pending_writes());

    let sent: Vec<_> = f
        .transport
        .write_requests()
        .iter()
        .map(|request| request.batch_id)
        .collect();
    assert_eq!(sent, vec![b1, b2, b3]);

    assert!(f.transport.ack_write(b3, version(6)));
    third.await.unwrap();
    let doc = f.engine.get_document_from_cache(doc_key).await.unwrap();
    assert_eq!(doc.data(), Some(&map(json!({"n": 1, "m": 2}))));
    assert!(!doc.has_pending_writes());
}

#[tokio::test(flavor = "multi_thread")]
async fn out_of_order_ack_is_refused() {
    let f = Fixture::online().await;
    let first = f
        .engine
        .enqueue_mutations(vec![Mutation::set(key("rooms/a"), map(json!({"v": 1})))])
        .await
        .unwrap();
    let second = f
        .engine
        .enqueue_mutations(vec![Mutation::set(key("rooms/b"), map(json!({"v": 2})))])
        .await
        .unwrap();
    let (b1, b2) = (first.batch_id(), second.batch_id());

    assert!(f.transport.push_write(WriteResponse::Ack {
        batch_id: b2,
        commit_version: version(3),
        results: vec![MutationResult::new(version(3))],
    }));
    eventually(|| f.transport.write_open_count() == 2 && f.transport.write_requests().len() == 2)
        .await;

    let doc = f.engine.get_document_from_cache(key("rooms/b")).await.unwrap();
    assert!(doc.has_pending_writes());

    assert!(f.transport.ack_write(b1, version(4)));
    first.await.unwrap();
    assert!(f.transport.ack_write(b2, version(5)));
    second.await.unwrap();

    let sent: Vec<_> = f
        .transport
        .write_requests()
        .iter()
        .map(|request| request.batch_id)
        .collect();
    assert_eq!(sent, vec![b1, b1, b2]);
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_writes_survive_a_restart() {
    let f = Fixture::offline().await;
    let doc_key = key("rooms/k");
    let pending = f
        .engine
        .enqueue_mutations(vec![Mutation::set(doc_key.clone(), map(json!({"name": "a"})))])
        .await
        .unwrap();
    let batch_id = pending.batch_id();

    f.engine.terminate().await.unwrap();
    let err = pending.await.unwrap_err();
    assert_eq!(err.code, ReplicaErrorCode::Terminated);
    let err = f.engine.get_document_from_cache(doc_key.clone()).await.unwrap_err();
    assert_eq!(err.code, ReplicaErrorCode::Terminated);

    let restored = Fixture::restore(Default::default(), f.persistence.clone()).await;
    let sent = restored.transport.write_requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].batch_id, batch_id);

    assert!(restored.transport.ack_write(batch_id, version(2)));
    eventually(|| restored.persistence.batch_ids().is_empty()).await;
    let doc = restored
        .engine
        .get_document_from_cache(doc_key)
        .await
        .unwrap();
    assert_eq!(doc.data(), Some(&map(json!({"name": "a"}))));
    assert!(!doc.has_pending_writes());
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_storage_degrades_to_network_only() {
    let f = Fixture::offline().await;
    f.persistence.fail_next_commits(u32::MAX);

    let doc_key = key("rooms/k");
    f.engine
        .enqueue_mutations(vec![Mutation::set(doc_key.clone(), map(json!({"n": 1})))])
        .await
        .unwrap();

    assert_eq!(f.engine.storage_mode().await.unwrap(), StorageMode::NetworkOnly);
    let doc = f.engine.get_document_from_cache(doc_key.clone()).await.unwrap();
    assert_eq!(doc.data(), Some(&map(json!({"n": 1}))));
    assert!(f.persistence.batch_ids().is_empty());
}
