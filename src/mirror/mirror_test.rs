use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing_test::traced_test;

use super::*;
use crate::test_utils::memory_client;
use crate::test_utils::RECV_TIMEOUT;
use crate::test_utils::TEST_ENDPOINT;
use crate::MemoryEnsemble;
use crate::NodeError;
use crate::SessionState;

async fn next_change(events: &mut mpsc::UnboundedReceiver<MirrorEvent>) -> MirrorEvent {
    tokio::time::timeout(RECV_TIMEOUT, events.recv())
        .await
        .expect("mirror event within timeout")
        .expect("mirror still running")
}

fn paths(mirror: &Mirror) -> Vec<String> {
    mirror
        .entries()
        .unwrap()
        .into_iter()
        .map(|entry| entry.path)
        .collect()
}

fn shared(scope: MirrorScope) -> (MirrorShared, mpsc::UnboundedReceiver<MirrorEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = MirrorShared {
        root: "/root".to_string(),
        scope,
        entries: RwLock::new(BTreeMap::new()),
        status: RwLock::new(MirrorStatus::Live),
        invalidated: AtomicBool::new(false),
        subscribers: Mutex::new(vec![tx]),
    };
    (shared, rx)
}

fn event(
    path: &str,
    kind: EventKind,
    zxid: u64,
) -> WatchEvent {
    WatchEvent {
        watch_id: 1,
        path: path.to_string(),
        kind,
        payload: Some(Bytes::from(format!("z{zxid}"))),
        version: Some(zxid),
        zxid,
    }
}

#[test]
fn test_stale_events_are_skipped() {
    let (shared, mut events) = shared(MirrorScope::Subtree);

    shared.apply(event("/root/a", EventKind::Created, 5));
    shared.apply(event("/root/a", EventKind::Updated, 4));
    shared.apply(event("/root/a", EventKind::Deleted, 3));

    let entry = shared.entries.read().get("/root/a").cloned().unwrap();
    assert_eq!(entry.zxid, 5);
    assert_eq!(entry.payload, Bytes::from_static(b"z5"));
    assert!(matches!(events.try_recv(), Ok(MirrorEvent::Changed { .. })));
    assert!(events.try_recv().is_err());

    shared.apply(event("/root/a", EventKind::Deleted, 6));
    assert!(shared.entries.read().is_empty());
    assert_eq!(
        events.try_recv().unwrap(),
        MirrorEvent::Changed {
            path: "/root/a".to_string(),
            kind: EventKind::Deleted,
            entry: None,
        }
    );
}

#[test]
fn test_removal_of_unknown_entry_is_silent() {
    let (shared, mut events) = shared(MirrorScope::Subtree);

    shared.apply(event("/root/ghost", EventKind::Deleted, 2));

    assert!(events.try_recv().is_err());
}

#[test]
fn test_children_scope_ignores_root_and_grandchildren() {
    let scope = MirrorScope::Children;

    assert_eq!(scope.classify("/root", &event("/root", EventKind::Updated, 1)), None);
    assert_eq!(scope.classify("/root", &event("/root/a/b", EventKind::Created, 1)), None);
    assert_eq!(
        scope.classify("/root", &event("/root/a", EventKind::Created, 1)),
        Some(EventKind::ChildAdded)
    );
    assert_eq!(
        scope.classify("/root", &event("/root/a", EventKind::Deleted, 1)),
        Some(EventKind::ChildRemoved)
    );
}

#[test]
fn test_node_scope_ignores_child_notifications() {
    let scope = MirrorScope::Node;

    assert_eq!(scope.classify("/root", &event("/root/a", EventKind::ChildAdded, 1)), None);
    assert_eq!(
        scope.classify("/root", &event("/root", EventKind::Updated, 1)),
        Some(EventKind::Updated)
    );
}

#[tokio::test]
#[traced_test]
async fn test_node_mirror_follows_updates_and_deletion() {
    let ensemble = MemoryEnsemble::default();
    let client = memory_client(&ensemble).await;
    client.create("/config", "v1", false).await.unwrap();

    let mirror = Mirror::node(&client, "/config").unwrap();
    mirror.start(true).await.unwrap();
    assert_eq!(mirror.status(), MirrorStatus::Live);
    let loaded = mirror.current().unwrap().unwrap();
    assert_eq!(loaded.payload, Bytes::from_static(b"v1"));
    assert_eq!(loaded.version, 0);
    assert_eq!(loaded.last_event, None);

    let mut events = mirror.subscribe();
    client.write("/config", "v2", None).await.unwrap();
    match next_change(&mut events).await {
        MirrorEvent::Changed {
            path,
            kind,
            entry: Some(entry),
        } => {
            assert_eq!(path, "/config");
            assert_eq!(kind, EventKind::Updated);
            assert_eq!(entry.version, 1);
            assert_eq!(entry.payload, Bytes::from_static(b"v2"));
        }
        other => panic!("unexpected mirror event: {other:?}"),
    }

    // child notifications are out of scope for a node mirror
    client.create("/config/child", "c", false).await.unwrap();
    client.delete("/config", true).await.unwrap();
    assert_eq!(
        next_change(&mut events).await,
        MirrorEvent::Changed {
            path: "/config".to_string(),
            kind: EventKind::Deleted,
            entry: None,
        }
    );
    assert_eq!(mirror.current().unwrap(), None);
}

#[tokio::test]
#[traced_test]
async fn test_node_mirror_of_missing_node_sees_creation() {
    let ensemble = MemoryEnsemble::default();
    let client = memory_client(&ensemble).await;

    let mirror = Mirror::node(&client, "/later").unwrap();
    mirror.start(true).await.unwrap();
    assert!(mirror.is_empty());

    let mut events = mirror.subscribe();
    client.create("/later", "here", false).await.unwrap();

    match next_change(&mut events).await {
        MirrorEvent::Changed { kind, entry, .. } => {
            assert_eq!(kind, EventKind::Created);
            assert_eq!(entry.unwrap().payload, Bytes::from_static(b"here"));
        }
        other => panic!("unexpected mirror event: {other:?}"),
    }
    assert!(mirror.current().unwrap().is_some());
}

#[tokio::test]
#[traced_test]
async fn test_children_mirror_tracks_direct_children_only() {
    let ensemble = MemoryEnsemble::default();
    let client = memory_client(&ensemble).await;
    client.create("/svc/a", "a", true).await.unwrap();
    client.create("/svc/b", "b", true).await.unwrap();

    let mirror = Mirror::children(&client, "/svc").unwrap();
    mirror.start(true).await.unwrap();
    assert_eq!(paths(&mirror), vec!["/svc/a", "/svc/b"]);
    assert_eq!(mirror.current().unwrap(), None);

    let mut events = mirror.subscribe();
    client.create("/svc/a/deep", "x", false).await.unwrap();
    client.write("/svc", "root", None).await.unwrap();
    client.create("/svc/c", "c", false).await.unwrap();
    match next_change(&mut events).await {
        MirrorEvent::Changed { path, kind, .. } => {
            assert_eq!(path, "/svc/c");
            assert_eq!(kind, EventKind::ChildAdded);
        }
        other => panic!("unexpected mirror event: {other:?}"),
    }

    client.write("/svc/a", "a2", None).await.unwrap();
    match next_change(&mut events).await {
        MirrorEvent::Changed {
            path,
            kind,
            entry: Some(entry),
        } => {
            assert_eq!(path, "/svc/a");
            assert_eq!(kind, EventKind::Updated);
            assert_eq!(entry.version, 1);
        }
        other => panic!("unexpected mirror event: {other:?}"),
    }

    client.delete("/svc/b", false).await.unwrap();
    assert_eq!(
        next_change(&mut events).await,
        MirrorEvent::Changed {
            path: "/svc/b".to_string(),
            kind: EventKind::ChildRemoved,
            entry: None,
        }
    );
    assert_eq!(paths(&mirror), vec!["/svc/a", "/svc/c"]);
}

#[tokio::test]
#[traced_test]
async fn test_subtree_mirror_loads_and_follows_the_whole_tree() {
    let ensemble = MemoryEnsemble::default();
    let client = memory_client(&ensemble).await;
    client.create("/tree/a/b", "leaf", true).await.unwrap();
    client.create("/tree/c", "c", false).await.unwrap();

    let mirror = Mirror::subtree(&client, "/tree").unwrap();
    mirror.start(true).await.unwrap();
    assert_eq!(paths(&mirror), vec!["/tree", "/tree/a", "/tree/a/b", "/tree/c"]);
    assert_eq!(
        mirror.current_state("/tree/a/b").unwrap().unwrap().payload,
        Bytes::from_static(b"leaf")
    );

    let mut events = mirror.subscribe();
    client.create("/tree/a/b/d", "d", false).await.unwrap();
    match next_change(&mut events).await {
        MirrorEvent::Changed { path, kind, .. } => {
            assert_eq!(path, "/tree/a/b/d");
            assert_eq!(kind, EventKind::Created);
        }
        other => panic!("unexpected mirror event: {other:?}"),
    }

    client.delete("/tree", true).await.unwrap();
    for _ in 0..5 {
        match next_change(&mut events).await {
            MirrorEvent::Changed { kind, entry, .. } => {
                assert_eq!(kind, EventKind::Deleted);
                assert!(entry.is_none());
            }
            other => panic!("unexpected mirror event: {other:?}"),
        }
    }
    assert!(mirror.is_empty());
}

#[tokio::test]
#[traced_test]
async fn test_start_without_initial_state_only_sees_changes() {
    let ensemble = MemoryEnsemble::default();
    let client = memory_client(&ensemble).await;
    client.create("/lazy", "old", false).await.unwrap();

    let mirror = Mirror::node(&client, "/lazy").unwrap();
    let mut events = mirror.subscribe();
    mirror.start(false).await.unwrap();
    assert_eq!(next_change(&mut events).await, MirrorEvent::Loaded { entries: 0 });
    assert_eq!(mirror.current().unwrap(), None);

    client.write("/lazy", "new", None).await.unwrap();
    next_change(&mut events).await;

    let entry = mirror.current().unwrap().unwrap();
    assert_eq!(entry.payload, Bytes::from_static(b"new"));
    assert_eq!(entry.last_event, Some(EventKind::Updated));
}

#[tokio::test]
#[traced_test]
async fn test_session_expiry_invalidates_until_restart() {
    let ensemble = MemoryEnsemble::default();
    let client = memory_client(&ensemble).await;
    client.create("/m", "1", false).await.unwrap();

    let mirror = Mirror::node(&client, "/m").unwrap();
    mirror.start(true).await.unwrap();
    let mut events = mirror.subscribe();

    assert!(ensemble.expire_session(client.session_id().unwrap()));

    assert_eq!(next_change(&mut events).await, MirrorEvent::Invalidated);
    assert_eq!(mirror.status(), MirrorStatus::Invalidated);
    assert!(matches!(
        mirror.current(),
        Err(Error::MirrorInvalidated(root)) if root == "/m"
    ));
    assert!(mirror.entries().is_err());

    assert!(
        client
            .wait_for_state(SessionState::Connected, Duration::from_secs(5))
            .await
    );
    mirror.start(true).await.unwrap();
    assert_eq!(
        mirror.current().unwrap().unwrap().payload,
        Bytes::from_static(b"1")
    );
}

#[tokio::test]
#[traced_test]
async fn test_stop_releases_entries_and_watch() {
    let ensemble = MemoryEnsemble::default();
    let client = memory_client(&ensemble).await;
    client.create("/s/x", "x", true).await.unwrap();

    let mirror = Mirror::subtree(&client, "/s").unwrap();
    mirror.start(true).await.unwrap();
    assert_eq!(mirror.len(), 2);
    assert_eq!(client.watch_count(), 1);

    mirror.stop().await;
    assert!(mirror.is_empty());
    assert_eq!(mirror.status(), MirrorStatus::Stopped);
    assert_eq!(client.watch_count(), 0);

    // the removal is queued ahead of this request
    client.exists("/s").await.unwrap();
    assert_eq!(ensemble.watch_count(), 0);
}

#[tokio::test]
#[traced_test]
async fn test_restart_reloads_from_scratch() {
    let ensemble = MemoryEnsemble::default();
    let client = memory_client(&ensemble).await;
    client.create("/r/a", "a", true).await.unwrap();

    let mirror = Mirror::children(&client, "/r").unwrap();
    mirror.start(true).await.unwrap();
    mirror.stop().await;

    client.create("/r/b", "b", false).await.unwrap();
    mirror.start(true).await.unwrap();

    assert_eq!(paths(&mirror), vec!["/r/a", "/r/b"]);
    assert_eq!(client.watch_count(), 1);
}

#[tokio::test]
#[traced_test]
async fn test_invalid_root_is_rejected() {
    let ensemble = MemoryEnsemble::default();
    let client = memory_client(&ensemble).await;

    let err = Mirror::node(&client, "relative").unwrap_err();

    assert!(matches!(
        err.node_error(),
        Some(NodeError::InvalidPath { .. })
    ));
}

#[tokio::test]
#[traced_test]
async fn test_failed_restart_keeps_mirror_invalidated() {
    let ensemble = MemoryEnsemble::default();
    let client = memory_client(&ensemble).await;
    client.create("/m", "1", false).await.unwrap();

    let mirror = Mirror::node(&client, "/m").unwrap();
    mirror.start(true).await.unwrap();
    let mut events = mirror.subscribe();

    // the service stays unreachable, so no new session can be negotiated
    ensemble.set_reachable(TEST_ENDPOINT, false);
    assert!(ensemble.expire_session(client.session_id().unwrap()));
    assert_eq!(next_change(&mut events).await, MirrorEvent::Invalidated);

    assert!(mirror.start(true).await.is_err());
    assert_eq!(mirror.status(), MirrorStatus::Invalidated);
    assert!(matches!(
        mirror.current(),
        Err(Error::MirrorInvalidated(root)) if root == "/m"
    ));
    assert!(mirror.entries().is_err());

    mirror.stop().await;
    assert!(mirror.current().is_err());

    ensemble.set_reachable(TEST_ENDPOINT, true);
    assert!(client.wait_for_state(SessionState::Connected, RECV_TIMEOUT).await);
    mirror.start(true).await.unwrap();
    assert_eq!(mirror.status(), MirrorStatus::Live);
    assert_eq!(
        mirror.current().unwrap().unwrap().payload,
        Bytes::from_static(b"1")
    );
}
