use bytes::Bytes;
use d_coord::CreateMode;
use d_coord::EventKind;
use d_coord::Mirror;
use d_coord::MirrorEvent;
use d_coord::MirrorScope;
use tokio::sync::mpsc;
use tracing_test::traced_test;

use crate::common::connect;
use crate::common::start_service;
use crate::common::RECV_TIMEOUT;

async fn next_change(events: &mut mpsc::UnboundedReceiver<MirrorEvent>) -> MirrorEvent {
    tokio::time::timeout(RECV_TIMEOUT, events.recv())
        .await
        .expect("mirror event within timeout")
        .expect("mirror still running")
}

#[tokio::test]
#[traced_test]
async fn test_node_mirror_reflects_start_value_and_follows_writes() {
    let service = start_service().await;
    let client = connect(&service).await;
    let writer = connect(&service).await;
    client.create("/feature/flag", "off", true).await.unwrap();

    let mirror = Mirror::new(&client, "/feature/flag", MirrorScope::Node).unwrap();
    mirror.start(true).await.unwrap();
    assert_eq!(
        mirror.current().unwrap().unwrap().payload,
        Bytes::from_static(b"off")
    );

    let mut events = mirror.subscribe();
    let version = writer.write("/feature/flag", "on", None).await.unwrap();

    match next_change(&mut events).await {
        MirrorEvent::Changed {
            kind,
            entry: Some(entry),
            ..
        } => {
            assert_eq!(kind, EventKind::Updated);
            assert_eq!(entry.version, version);
        }
        other => panic!("unexpected mirror event: {other:?}"),
    }
    let entry = mirror.current().unwrap().unwrap();
    assert_eq!(entry.payload, Bytes::from_static(b"on"));
    assert_eq!(entry.version, 1);

    mirror.stop().await;
    assert!(mirror.is_empty());
}

#[tokio::test]
#[traced_test]
async fn test_children_mirror_tracks_membership() {
    let service = start_service().await;
    let client = connect(&service).await;
    let member = connect(&service).await;
    client.create("/members", "", false).await.unwrap();

    let mirror = Mirror::new(&client, "/members", MirrorScope::Children).unwrap();
    mirror.start(true).await.unwrap();
    assert!(mirror.is_empty());
    let mut events = mirror.subscribe();

    member
        .create_with_mode("/members/node-a", "10.0.0.1", CreateMode::Ephemeral, false)
        .await
        .unwrap();
    match next_change(&mut events).await {
        MirrorEvent::Changed { path, kind, .. } => {
            assert_eq!(path, "/members/node-a");
            assert_eq!(kind, EventKind::ChildAdded);
        }
        other => panic!("unexpected mirror event: {other:?}"),
    }
    assert_eq!(mirror.len(), 1);

    // the member's ephemeral node goes away with its session
    member.close().await.unwrap();
    assert_eq!(
        next_change(&mut events).await,
        MirrorEvent::Changed {
            path: "/members/node-a".to_string(),
            kind: EventKind::ChildRemoved,
            entry: None,
        }
    );
    assert!(mirror.is_empty());
}
