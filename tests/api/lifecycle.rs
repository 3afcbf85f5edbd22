use std::time::Duration;

use pixelated_dispatcher::manager_client::ManagerClientError;
use pixelated_dispatcher::provider::AgentState;

use crate::helpers::spawn_manager;
use crate::helpers::spawn_manager_with;
use crate::helpers::ManagerOptions;

#[tokio::test]
async fn ports_are_assigned_lowest_first_until_the_pool_is_dry() {
    let manager = spawn_manager_with(ManagerOptions {
        port_range: (5000, 5001),
        ..ManagerOptions::default()
    })
    .await;
    manager.add("alice", "pw1").await;
    manager.add("bob", "pw2").await;
    manager.add("carol", "pw3").await;

    let alice = manager.client.start("alice").await.unwrap();
    assert_eq!(alice.state, AgentState::Running);
    assert_eq!(alice.port, Some(5000));

    let bob = manager.client.start("bob").await.unwrap();
    assert_eq!(bob.port, Some(5001));

    // the pool is dry: the manager answers 503
    let response = manager
        .api
        .put(format!("{}/agents/carol/state", manager.addr))
        .json(&serde_json::json!({ "state": "running" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 503);

    // stopping a user frees its port for the next start
    manager.client.stop("alice").await.unwrap();
    let carol = manager.client.start("carol").await.unwrap();
    assert_eq!(carol.port, Some(5000));
}

#[tokio::test]
async fn start_response_carries_state_and_port() {
    let manager = spawn_manager_with(ManagerOptions {
        port_range: (5000, 5001),
        ..ManagerOptions::default()
    })
    .await;
    manager.add("alice", "pw1").await;

    let body: serde_json::Value = manager
        .api
        .put(format!("{}/agents/alice/state", manager.addr))
        .json(&serde_json::json!({ "state": "running" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, serde_json::json!({ "state": "running", "port": 5000 }));
}

#[tokio::test]
async fn double_start_and_spurious_stop_conflict() {
    let manager = spawn_manager().await;
    manager.add("alice", "pw1").await;
    manager.client.start("alice").await.unwrap();

    match manager.client.start("alice").await {
        Err(ManagerClientError::Http { code, .. }) => assert_eq!(code, 409),
        other => panic!("expected 409, got {other:?}"),
    }

    manager.client.stop("alice").await.unwrap();
    match manager.client.stop("alice").await {
        Err(ManagerClientError::Http { code, .. }) => assert_eq!(code, 409),
        other => panic!("expected 409, got {other:?}"),
    }
}

#[tokio::test]
async fn crashed_agent_reconciles_on_runtime_query() {
    let manager = spawn_manager_with(ManagerOptions {
        agent_body: "exit 0",
        ..ManagerOptions::default()
    })
    .await;
    manager.add("alice", "pw1").await;

    let started = manager.client.start("alice").await.unwrap();
    assert_eq!(started.state, AgentState::Running);

    // the stub agent exits immediately; the next runtime query observes it
    tokio::time::sleep(Duration::from_millis(200)).await;
    let runtime = manager.client.get_agent_runtime("alice").await.unwrap();
    assert_eq!(runtime.state, AgentState::Stopped);
    assert_eq!(runtime.port, None);
}

#[tokio::test]
async fn reset_data_requires_stopped_and_is_idempotent() {
    let manager = spawn_manager().await;
    manager.add("alice", "pw1").await;
    std::fs::write(manager.data_path("alice").join("mail.db"), b"state").unwrap();

    manager.client.start("alice").await.unwrap();
    match manager.client.reset_data("alice").await {
        Err(ManagerClientError::Http { code, .. }) => assert_eq!(code, 409),
        other => panic!("expected 409, got {other:?}"),
    }
    manager.client.stop("alice").await.unwrap();

    manager.client.reset_data("alice").await.unwrap();
    manager.client.reset_data("alice").await.unwrap();
    assert!(manager.data_path("alice").is_dir());
    assert_eq!(
        std::fs::read_dir(manager.data_path("alice")).unwrap().count(),
        0
    );
    // the user row survives the wipe
    assert!(manager.client.agent_exists("alice").await.unwrap());
}

#[tokio::test]
async fn started_agent_receives_its_credentials() {
    let manager = spawn_manager().await;
    manager.add("alice", "hunter2").await;
    manager.client.start("alice").await.unwrap();

    // the injector writes one JSON line on the agent's stdin
    let stdin_file = manager.data_path("alice").join("stdin");
    for _ in 0..50 {
        if stdin_file.is_file() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let line = std::fs::read_to_string(&stdin_file).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(parsed["user"], "alice");
    assert_eq!(parsed["password"], "hunter2");
    assert_eq!(parsed["leap_provider_hostname"], "example.org");

    manager.client.stop("alice").await.unwrap();
}
