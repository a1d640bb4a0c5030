//! Worker pool management against a fake compute API.


use axum::http::StatusCode;

use ci_lite::error::CiError;
use ci_lite::pool::{MachineStatus, PoolController};
use test_harness::FakeCompute;

#[tokio::test]
async fn test_list_only_returns_pool_machines() {
    let compute = FakeCompute::start(&[
        ("ci-worker-1-0", "RUNNING"),
        ("ci-worker-1-1", "STAGING"),
        ("database", "RUNNING"),
    ])
    .await;
    let controller = PoolController::new(compute.pool_config()).unwrap();

    let machines = controller.list().await.unwrap();

    assert_eq!(machines.len(), 2);
    assert_eq!(machines[0].name, "ci-worker-1-0");
    assert_eq!(machines[0].status, MachineStatus::Running);
    assert_eq!(machines[1].status, MachineStatus::Staging);
}

#[tokio::test]
async fn test_list_of_empty_project() {
    let compute = FakeCompute::start(&[]).await;
    let controller = PoolController::new(compute.pool_config()).unwrap();

    assert!(controller.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_destroy_all_leaves_other_machines() {
    let compute = FakeCompute::start(&[
        ("ci-worker-1-0", "RUNNING"),
        ("ci-worker-1-1", "RUNNING"),
        ("database", "RUNNING"),
    ])
    .await;
    let controller = PoolController::new(compute.pool_config()).unwrap();

    let destroyed = controller.destroy_all().await.unwrap();

    assert_eq!(destroyed, vec!["ci-worker-1-0", "ci-worker-1-1"]);
    assert_eq!(compute.instance_names(), vec!["database"]);
}

#[tokio::test]
async fn test_recreate_replaces_the_pool() {
    let compute = FakeCompute::start(&[("ci-worker-1-0", "RUNNING")]).await;
    let controller = PoolController::new(compute.pool_config()).unwrap();

    let created = controller.recreate(2).await.unwrap();

    assert_eq!(created.len(), 2);
    assert!(created[0].starts_with("ci-worker-") && created[0].ends_with("-0"));
    assert!(created[1].ends_with("-1"));
    assert_eq!(compute.instance_names(), created);

    let bodies = compute.created_bodies();
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[0]["name"], serde_json::json!(created[0]));
    assert_eq!(bodies[0]["machineType"], serde_json::json!("n1-standard-8"));
}

#[tokio::test]
async fn test_rejected_create_aborts() {
    let compute = FakeCompute::start(&[]).await;
    compute.reject_creates(StatusCode::FORBIDDEN);
    let controller = PoolController::new(compute.pool_config()).unwrap();

    let err = controller.recreate(3).await.unwrap_err();

    match err {
        CiError::Provisioning { status, method, .. } => {
            assert_eq!(status, 403);
            assert_eq!(method, "POST");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(compute.instance_names().is_empty());
}

#[tokio::test]
async fn test_rejected_destroy_aborts_before_create() {
    let compute = FakeCompute::start(&[("ci-worker-1-0", "RUNNING")]).await;
    compute.reject_deletes(StatusCode::INTERNAL_SERVER_ERROR);
    let controller = PoolController::new(compute.pool_config()).unwrap();

    let err = controller.recreate(2).await.unwrap_err();

    assert!(matches!(
        err,
        CiError::Provisioning {
            status: 500,
            method: "DELETE",
            ..
        }
    ));
    assert!(compute.created_bodies().is_empty());
    assert_eq!(compute.instance_names(), vec!["ci-worker-1-0"]);
}

#[tokio::test]
async fn test_non_object_template_is_rejected() {
    let compute = FakeCompute::start(&[]).await;
    let mut config = compute.pool_config();
    config.instance_template = serde_json::json!(["not", "an", "object"]);
    let controller = PoolController::new(config).unwrap();

    let err = controller.create("ci-worker-x-0").await.unwrap_err();
    assert!(matches!(err, CiError::Config(_)));
}
