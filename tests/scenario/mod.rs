use bytes::Bytes;
use d_coord::Error;
use d_coord::NodeError;
use tracing_test::traced_test;

use crate::common::connect;
use crate::common::start_service;

#[tokio::test]
#[traced_test]
async fn test_create_read_write_with_version_check() {
    let service = start_service().await;
    let client = connect(&service).await;

    let created = client
        .create("/demo/node", "hello world", true)
        .await
        .unwrap();
    assert_eq!(created, "/demo/node");

    let data = client.read("/demo/node").await.unwrap();
    assert_eq!(data.payload, Bytes::from_static(b"hello world"));
    assert_eq!(data.version(), 0);

    assert_eq!(client.write("/demo/node", "v2", Some(0)).await.unwrap(), 1);

    let err = client.write("/demo/node", "v3", Some(0)).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Node(NodeError::VersionConflict {
            expected: 0,
            actual: 1,
            ..
        })
    ));

    client.close().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn test_versions_increase_on_every_write() {
    let service = start_service().await;
    let client = connect(&service).await;
    client.create("/counter", "0", false).await.unwrap();

    let mut last = 0;
    for round in 1..=5u64 {
        let version = client
            .write("/counter", round.to_string(), Some(last))
            .await
            .unwrap();
        assert!(version > last);
        last = version;
    }
    assert_eq!(client.read("/counter").await.unwrap().payload, Bytes::from("5"));
}

#[tokio::test]
#[traced_test]
async fn test_recursive_delete_removes_every_descendant() {
    let service = start_service().await;
    let client = connect(&service).await;
    client.create("/app/db/primary", "p", true).await.unwrap();
    client.create("/app/db/replica", "r", false).await.unwrap();
    client.create("/app/cache", "c", false).await.unwrap();

    let err = client.delete("/app", false).await.unwrap_err();
    assert!(matches!(err, Error::Node(NodeError::NotEmpty(path)) if path == "/app"));

    client.delete("/app", true).await.unwrap();

    for path in ["/app", "/app/db", "/app/db/primary", "/app/db/replica", "/app/cache"] {
        assert!(client.read(path).await.unwrap_err().is_no_node(), "{path} still readable");
        assert!(client.list_children(path).await.unwrap_err().is_no_node());
    }
}

#[tokio::test]
#[traced_test]
async fn test_writes_from_one_session_are_visible_to_another() {
    let service = start_service().await;
    let writer = connect(&service).await;
    let reader = connect(&service).await;

    writer.create("/shared", "from writer", false).await.unwrap();

    assert_eq!(
        reader.read("/shared").await.unwrap().payload,
        Bytes::from_static(b"from writer")
    );
    assert_ne!(writer.session_id(), reader.session_id());
}
