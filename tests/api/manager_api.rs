use pixelated_dispatcher::manager_client::ManagerClientError;
use secrecy::Secret;

use crate::helpers::spawn_manager;

#[tokio::test]
async fn add_then_list() {
    let manager = spawn_manager().await;
    manager.add("alice", "pw1").await;

    // exact wire shape
    let body: serde_json::Value = manager
        .api
        .get(format!("{}/agents", manager.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        body,
        serde_json::json!({ "agents": [{ "name": "alice", "state": "stopped" }] })
    );

    // the registration reached the identity provider
    assert_eq!(manager.srp.registered_users(), vec!["alice"]);
    assert!(manager.data_path("alice").is_dir());
}

#[tokio::test]
async fn duplicate_add_conflicts() {
    let manager = spawn_manager().await;
    manager.add("alice", "pw1").await;

    let result = manager
        .client
        .add("alice", &Secret::new("pw1".to_string()))
        .await;
    match result {
        Err(ManagerClientError::Http { code, .. }) => assert_eq!(code, 409),
        other => panic!("expected 409, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_name_is_rejected() {
    let manager = spawn_manager().await;

    let result = manager
        .client
        .add("not/a/name", &Secret::new("pw".to_string()))
        .await;
    match result {
        Err(ManagerClientError::Http { code, .. }) => assert_eq!(code, 400),
        other => panic!("expected 400, got {other:?}"),
    }
    // nothing was created locally or upstream
    assert!(manager.client.list().await.unwrap().is_empty());
    assert!(manager.srp.registered_users().is_empty());
}

#[tokio::test]
async fn unknown_agent_is_not_found() {
    let manager = spawn_manager().await;

    match manager.client.get_agent("ghost").await {
        Err(ManagerClientError::Http { code, .. }) => assert_eq!(code, 404),
        other => panic!("expected 404, got {other:?}"),
    }
    assert!(!manager.client.agent_exists("ghost").await.unwrap());
}

#[tokio::test]
async fn authenticate_round_trip() {
    let manager = spawn_manager().await;
    manager.add("alice", "correct horse").await;

    // the password that was registered authenticates
    manager
        .client
        .authenticate("alice", &Secret::new("correct horse".to_string()))
        .await
        .unwrap();

    // a flipped password does not
    match manager
        .client
        .authenticate("alice", &Secret::new("correct hors3".to_string()))
        .await
    {
        Err(ManagerClientError::Http { code, .. }) => assert_eq!(code, 403),
        other => panic!("expected 403, got {other:?}"),
    }
}

#[tokio::test]
async fn authenticate_unknown_agent_is_not_found() {
    let manager = spawn_manager().await;

    match manager
        .client
        .authenticate("ghost", &Secret::new("pw".to_string()))
        .await
    {
        Err(ManagerClientError::Http { code, .. }) => assert_eq!(code, 404),
        other => panic!("expected 404, got {other:?}"),
    }
}

#[tokio::test]
async fn memory_usage_has_the_aggregated_shape() {
    let manager = spawn_manager().await;
    manager.add("alice", "pw1").await;

    let body: serde_json::Value = manager
        .api
        .get(format!("{}/stats/memory_usage", manager.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["total_usage"], 0);
    assert_eq!(body["average_usage"], 0);
    assert_eq!(body["agents"], serde_json::json!([]));

    let usage = manager.client.memory_usage().await.unwrap();
    assert_eq!(usage.total_usage, 0);
}
