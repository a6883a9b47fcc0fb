mod common;

use common::TestAgent;
use keyward::settings::SecretAgentSettings;
use keyward::{AgentError, AgentRegistry, ConnectOptions, SettingsStore};
use std::time::Duration;

#[tokio::test]
async fn concurrent_requests_share_one_connection() {
    let agent = TestAgent::spawn_socket().await.unwrap();
    let registry = std::sync::Arc::new(AgentRegistry::new(agent.connect_options()));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let registry = registry.clone();
        let endpoint = agent.endpoint();
        tasks.push(tokio::spawn(async move {
            registry.get_or_connect(endpoint).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap().ping().await.unwrap();
    }

    assert_eq!(agent.server.accepted_connections(), 1);
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn closed_connection_is_replaced() {
    let agent = TestAgent::spawn_socket().await.unwrap();
    let registry = AgentRegistry::new(agent.connect_options());

    let first = registry.get_or_connect(agent.endpoint()).await.unwrap();
    first.ping().await.unwrap();
    first.close().await.unwrap();

    let second = registry.get_or_connect(agent.endpoint()).await.unwrap();
    assert!(first.is_closed());
    assert!(!second.is_closed());
    second.ping().await.unwrap();
    assert_eq!(agent.server.accepted_connections(), 2);
}

#[tokio::test]
async fn idle_connection_is_replaced() {
    let agent = TestAgent::spawn_socket().await.unwrap();
    let options = agent
        .connect_options()
        .with_close_timeout(Some(Duration::from_millis(50)));
    let registry = AgentRegistry::new(options);

    let first = registry.get_or_connect(agent.endpoint()).await.unwrap();
    first.ping().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), first.closed())
        .await
        .expect("idle connection should close");

    let second = registry.get_or_connect(agent.endpoint()).await.unwrap();
    second.ping().await.unwrap();
    assert_eq!(agent.server.accepted_connections(), 2);
}

#[tokio::test]
async fn connection_without_endpoint_uses_settings_port() {
    let agent = TestAgent::spawn_tls().await.unwrap();
    let keyward::Endpoint::Port(port) = agent.endpoint() else {
        panic!("expected a port endpoint");
    };
    SettingsStore::in_state_dir(agent.dir.path())
        .update(|s| s.secret_agent = Some(SecretAgentSettings { port: Some(port) }))
        .unwrap();

    let registry = AgentRegistry::new(ConnectOptions::new(agent.dir.path(), agent.keys.clone()));
    let conn = registry.connection(None).await.unwrap();
    conn.ping().await.unwrap();
    assert_eq!(conn.endpoint(), &agent.endpoint());
}

#[tokio::test]
async fn close_all_closes_every_endpoint() {
    let a = TestAgent::spawn_socket().await.unwrap();
    let b = TestAgent::spawn_socket().await.unwrap();
    let registry = AgentRegistry::new(a.connect_options());

    let conn_a = registry.get_or_connect(a.endpoint()).await.unwrap();
    let conn_b = registry.get_or_connect(b.endpoint()).await.unwrap();
    conn_a.ping().await.unwrap();
    conn_b.ping().await.unwrap();
    assert_eq!(registry.len(), 2);

    registry.close_all().await;
    assert!(registry.is_empty());
    assert!(conn_a.is_closed());
    assert!(conn_b.is_closed());
}

#[tokio::test]
async fn tls_endpoint_with_foreign_certificate_is_refused() {
    let a = TestAgent::spawn_socket().await.unwrap();
    let b = TestAgent::spawn_tls().await.unwrap();
    // a's state dir holds a different self-signed certificate than b presents.
    let registry = AgentRegistry::new(a.connect_options());
    let err = registry.get_or_connect(b.endpoint()).await.err().unwrap();
    assert!(matches!(err, AgentError::Connection { .. }));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn disabled_registry_refuses_connections() {
    let agent = TestAgent::spawn_socket().await.unwrap();
    let registry = AgentRegistry::new(agent.connect_options());
    registry.set_enabled(false);
    assert!(matches!(
        registry.get_or_connect(agent.endpoint()).await,
        Err(AgentError::Disabled)
    ));
    assert!(matches!(
        registry.connection(None).await,
        Err(AgentError::Disabled)
    ));

    registry.set_enabled(true);
    registry
        .get_or_connect(agent.endpoint())
        .await
        .unwrap()
        .ping()
        .await
        .unwrap();
    assert_eq!(agent.server.accepted_connections(), 1);
}
