use std::sync::Arc;

use bytes::Bytes;
use d_coord::CreateMode;
use d_coord::EventKind;
use d_coord::SessionState;
use d_coord::WatchMode;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing_test::traced_test;

use crate::common::connect;
use crate::common::next_event;
use crate::common::start_service;
use crate::common::RECV_TIMEOUT;

#[tokio::test]
#[traced_test]
async fn test_watch_sees_changes_from_another_client() {
    let service = start_service().await;
    let watcher = connect(&service).await;
    let writer = connect(&service).await;

    let mut registration = watcher
        .watch("/config", WatchMode::Persistent)
        .await
        .unwrap();

    writer.create("/config", "a", false).await.unwrap();
    writer.write("/config", "b", None).await.unwrap();
    writer.create("/config/child", "c", false).await.unwrap();

    let created = next_event(&mut registration).await;
    assert_eq!(created.kind, EventKind::Created);
    let updated = next_event(&mut registration).await;
    assert_eq!(updated.kind, EventKind::Updated);
    assert_eq!(updated.payload, Some(Bytes::from_static(b"b")));
    assert_eq!(updated.version, Some(1));
    let child = next_event(&mut registration).await;
    assert_eq!(child.kind, EventKind::ChildAdded);
    assert_eq!(child.path, "/config/child");
}

#[tokio::test]
#[traced_test]
async fn test_connection_loss_resumes_session_over_tcp() {
    let service = start_service().await;
    let client = connect(&service).await;
    let session_id = client.session_id().unwrap();
    client.create("/before", "x", false).await.unwrap();

    assert!(service.ensemble.drop_connections() >= 1);

    assert!(
        client
            .wait_for_state(SessionState::Connected, RECV_TIMEOUT)
            .await
    );
    client.create("/after", "y", false).await.unwrap();
    assert_eq!(client.session_id(), Some(session_id));
    assert_eq!(client.list_children("/").await.unwrap(), vec!["after", "before"]);
}

#[tokio::test]
#[traced_test]
async fn test_close_removes_ephemeral_nodes() {
    let service = start_service().await;
    let owner = connect(&service).await;
    let observer = connect(&service).await;

    owner
        .create_with_mode("/leader", "me", CreateMode::Ephemeral, false)
        .await
        .unwrap();
    let mut registration = observer
        .watch("/leader", WatchMode::OneShot)
        .await
        .unwrap();

    owner.close().await.unwrap();

    assert_eq!(next_event(&mut registration).await.kind, EventKind::Deleted);
    assert!(observer.exists("/leader").await.unwrap().is_none());
    assert_eq!(owner.state(), SessionState::Closed);
}

#[tokio::test]
#[traced_test]
async fn test_background_operations_complete_in_issue_order() {
    let service = start_service().await;
    let client = connect(&service).await;
    client.create("/jobs", "", false).await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = oneshot::channel();
    for i in 0..10 {
        let order = order.clone();
        client.create_background(
            &format!("/jobs/job-{i}"),
            Bytes::new(),
            false,
            move |result| {
                order.lock().push((i, result.is_ok()));
            },
        );
    }
    client.list_children_background("/jobs", move |result| {
        let _ = done_tx.send(result);
    });

    let children = tokio::time::timeout(RECV_TIMEOUT, done_rx)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(children.len(), 10);
    let order = order.lock().clone();
    assert_eq!(order, (0..10).map(|i| (i, true)).collect::<Vec<_>>());
}

#[tokio::test]
#[traced_test]
async fn test_sequential_nodes_get_increasing_suffixes() {
    let service = start_service().await;
    let client = connect(&service).await;

    let first = client
        .create_with_mode("/locks/lock-", "", CreateMode::EphemeralSequential, true)
        .await
        .unwrap();
    let second = client
        .create_with_mode("/locks/lock-", "", CreateMode::EphemeralSequential, true)
        .await
        .unwrap();

    assert_eq!(first, "/locks/lock-0000000000");
    assert_eq!(second, "/locks/lock-0000000001");
    assert_eq!(client.list_children("/locks").await.unwrap().len(), 2);
}
