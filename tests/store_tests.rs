//! Store client behavior against the in-memory document store.


use std::collections::BTreeMap;

use axum::http::Method;
use serde_json::json;

use ci_lite::config::StoreConfig;
use ci_lite::error::CiError;
use test_harness::FakeStore;

#[tokio::test]
async fn test_get_missing_document_is_none() {
    let store = FakeStore::start().await;
    let client = store.client();

    let value: Option<u32> = client.get("last_patchset/1").await.unwrap();
    assert!(value.is_none());
}

#[tokio::test]
async fn test_put_then_get() {
    let store = FakeStore::start().await;
    let client = store.client();

    client.put("last_patchset/42", &7u32).await.unwrap();

    assert_eq!(client.get::<u32>("last_patchset/42").await.unwrap(), Some(7));
    assert_eq!(store.value("last_patchset/42"), json!(7));
}

#[tokio::test]
async fn test_conditional_write_with_current_version_succeeds() {
    let store = FakeStore::start().await;
    let client = store.client();
    client.put("doc", &json!({"a": 1})).await.unwrap();

    let current = client.get_versioned::<serde_json::Value>("doc").await.unwrap();
    assert_eq!(current.value, Some(json!({"a": 1})));

    let written = client
        .conditional_write("doc", &json!({"a": 2}), &current.etag)
        .await
        .unwrap();
    assert!(written);
    assert_eq!(store.value("doc"), json!({"a": 2}));
}

#[tokio::test]
async fn test_conditional_write_with_stale_version_is_rejected() {
    let store = FakeStore::start().await;
    let client = store.client();
    client.put("doc", &json!({"a": 1})).await.unwrap();

    let stale = client.get_versioned::<serde_json::Value>("doc").await.unwrap();
    client.put("doc", &json!({"a": 3})).await.unwrap();

    let written = client
        .conditional_write("doc", &json!({"a": 2}), &stale.etag)
        .await
        .unwrap();
    assert!(!written, "Stale version must lose");
    assert_eq!(store.value("doc"), json!({"a": 3}));
}

#[tokio::test]
async fn test_conditional_write_creates_missing_document() {
    let store = FakeStore::start().await;
    let client = store.client();

    let current = client.get_versioned::<u32>("last_patchset/9").await.unwrap();
    assert!(current.value.is_none());

    assert!(client
        .conditional_write("last_patchset/9", &2u32, &current.etag)
        .await
        .unwrap());
    assert_eq!(store.value("last_patchset/9"), json!(2));
}

#[tokio::test]
async fn test_patch_merges_keys() {
    let store = FakeStore::start().await;
    let client = store.client();

    client
        .patch("logs/1/1/v/stdout", &BTreeMap::from([("k1", "a\n")]))
        .await
        .unwrap();
    client
        .patch("logs/1/1/v/stdout", &BTreeMap::from([("k2", "b\n")]))
        .await
        .unwrap();

    assert_eq!(
        store.value("logs/1/1/v/stdout"),
        json!({"k1": "a\n", "k2": "b\n"})
    );
}

#[tokio::test]
async fn test_delete_removes_subtree() {
    let store = FakeStore::start().await;
    let client = store.client();
    store.set("logs/1/1/v/stdout", json!({"k": "x"}));
    store.set("logs/1/1/v/stderr", json!({"k": "y"}));

    client.delete("logs/1/1/v").await.unwrap();

    assert!(store.value("logs/1/1/v").is_null());
    // Deleting something that is not there is fine.
    client.delete("logs/1/1/v").await.unwrap();
}

#[tokio::test]
async fn test_server_error_maps_to_store_error() {
    let store = FakeStore::start().await;
    let client = store.client();
    store.fail_requests(Method::PUT, "jobs/", 1);

    let err = client.put("jobs/1/1/v", &json!({})).await.unwrap_err();
    match &err {
        CiError::Store { status, method, path } => {
            assert_eq!(*status, 503);
            assert_eq!(*method, "PUT");
            assert_eq!(path, "jobs/1/1/v");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.is_transient());

    // The failure budget is spent; the next write goes through.
    client.put("jobs/1/1/v", &json!({})).await.unwrap();
}

#[tokio::test]
async fn test_unreachable_store_is_transport_error() {
    let addr = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();

    let config = StoreConfig::new(format!("http://{}", addr));
    let client = ci_lite::store::StoreClient::new(&config).unwrap();
    let err = client.get::<u32>("x").await.unwrap_err();
    assert!(matches!(err, CiError::Transport(_)));
    assert!(err.is_transient());
}
