use bytes::Bytes;

use super::*;

fn tree_with(paths: &[&str]) -> DataTree {
    let mut tree = DataTree::default();
    for p in paths {
        tree.create(p, Bytes::from_static(b"x"), CreateMode::Persistent, true, 1)
            .unwrap();
    }
    tree
}

#[test]
fn create_then_read_should_return_exact_payload_at_version_zero() {
    let mut tree = DataTree::default();
    let (actual, changes) = tree
        .create(
            "/demo/node",
            Bytes::from_static(b"hello world"),
            CreateMode::Persistent,
            true,
            7,
        )
        .unwrap();

    assert_eq!(actual, "/demo/node");
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0].path, "/demo");
    assert_eq!(changes[1].path, "/demo/node");
    assert!(changes[0].zxid < changes[1].zxid);

    let (payload, stat) = tree.read("/demo/node").unwrap();
    assert_eq!(payload, Bytes::from_static(b"hello world"));
    assert_eq!(stat.version, 0);
    assert_eq!(stat.ephemeral_owner, None);
}

#[test]
fn create_without_parents_should_fail_with_no_node() {
    let mut tree = DataTree::default();
    let err = tree
        .create("/a/b", Bytes::new(), CreateMode::Persistent, false, 1)
        .unwrap_err();

    assert_eq!(err, NodeError::NoNode("/a".to_string()));
    assert!(tree.exists("/a").unwrap().is_none());
}

#[test]
fn create_existing_should_fail_with_node_exists() {
    let mut tree = tree_with(&["/a"]);
    let err = tree
        .create("/a", Bytes::new(), CreateMode::Persistent, true, 1)
        .unwrap_err();
    assert_eq!(err, NodeError::NodeExists("/a".to_string()));

    let err = tree
        .create("/", Bytes::new(), CreateMode::Persistent, true, 1)
        .unwrap_err();
    assert_eq!(err, NodeError::NodeExists("/".to_string()));
}

#[test]
fn sequential_create_should_append_padded_counter() {
    let mut tree = tree_with(&["/queue"]);
    let (first, _) = tree
        .create("/queue/item-", Bytes::new(), CreateMode::PersistentSequential, false, 1)
        .unwrap();
    let (second, _) = tree
        .create("/queue/item-", Bytes::new(), CreateMode::PersistentSequential, false, 1)
        .unwrap();

    assert_eq!(first, "/queue/item-0000000000");
    assert_eq!(second, "/queue/item-0000000001");
    assert_eq!(
        tree.children("/queue").unwrap(),
        vec!["item-0000000000".to_string(), "item-0000000001".to_string()]
    );
}

#[test]
fn ephemeral_nodes_should_not_accept_children() {
    let mut tree = DataTree::default();
    tree.create("/lock", Bytes::new(), CreateMode::Ephemeral, false, 42)
        .unwrap();

    let err = tree
        .create("/lock/child", Bytes::new(), CreateMode::Persistent, false, 42)
        .unwrap_err();
    assert_eq!(err, NodeError::NoChildrenForEphemerals("/lock".to_string()));
}

#[test]
fn remove_ephemerals_should_only_touch_the_owner() {
    let mut tree = tree_with(&["/members"]);
    tree.create("/members/a", Bytes::new(), CreateMode::Ephemeral, false, 1)
        .unwrap();
    tree.create("/members/b", Bytes::new(), CreateMode::Ephemeral, false, 2)
        .unwrap();

    let changes = tree.remove_ephemerals(1);

    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].path, "/members/a");
    assert_eq!(changes[0].kind, ChangeKind::Deleted);
    assert_eq!(tree.children("/members").unwrap(), vec!["b".to_string()]);
}

#[test]
fn delete_with_children_should_require_recursive_flag() {
    let mut tree = tree_with(&["/demo/node/leaf", "/demo/other"]);

    let err = tree.delete("/demo", false).unwrap_err();
    assert_eq!(err, NodeError::NotEmpty("/demo".to_string()));

    let changes = tree.delete("/demo", true).unwrap();
    let order: Vec<&str> = changes.iter().map(|c| c.path.as_str()).collect();
    assert_eq!(
        order,
        vec!["/demo/node/leaf", "/demo/node", "/demo/other", "/demo"]
    );

    for p in ["/demo", "/demo/node", "/demo/node/leaf", "/demo/other"] {
        assert_eq!(tree.read(p).unwrap_err(), NodeError::NoNode(p.to_string()));
        assert_eq!(
            tree.children(p).unwrap_err(),
            NodeError::NoNode(p.to_string())
        );
    }
    assert_eq!(tree.node_count(), 1);
}

#[test]
fn delete_root_or_missing_should_fail() {
    let mut tree = DataTree::default();
    assert!(matches!(
        tree.delete("/", true),
        Err(NodeError::InvalidPath { .. })
    ));
    assert_eq!(
        tree.delete("/ghost", false).unwrap_err(),
        NodeError::NoNode("/ghost".to_string())
    );
}

#[test]
fn write_should_bump_version_and_check_expected_version() {
    let mut tree = tree_with(&["/demo/node"]);

    let (stat, change) = tree
        .write("/demo/node", Bytes::from_static(b"v2"), Some(0))
        .unwrap();
    assert_eq!(stat.version, 1);
    assert_eq!(change.kind, ChangeKind::Updated);
    assert_eq!(change.version, Some(1));

    let err = tree
        .write("/demo/node", Bytes::from_static(b"v3"), Some(0))
        .unwrap_err();
    assert_eq!(
        err,
        NodeError::VersionConflict {
            path: "/demo/node".to_string(),
            expected: 0,
            actual: 1,
        }
    );

    let (stat, _) = tree
        .write("/demo/node", Bytes::from_static(b"v4"), None)
        .unwrap();
    assert_eq!(stat.version, 2);
    assert_eq!(tree.read("/demo/node").unwrap().0, Bytes::from_static(b"v4"));
}

#[test]
fn parent_stat_should_track_children() {
    let mut tree = tree_with(&["/p/a", "/p/b"]);
    let stat = tree.exists("/p").unwrap().unwrap();
    assert_eq!(stat.num_children, 2);
    assert_eq!(stat.cversion, 2);

    tree.delete("/p/a", false).unwrap();
    let stat = tree.exists("/p").unwrap().unwrap();
    assert_eq!(stat.num_children, 1);
    assert_eq!(stat.cversion, 3);
}
