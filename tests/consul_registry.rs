//! ConsulRegistry against an in-process mock of the agent HTTP API.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use morax::config::ConsumerConfig;
use morax::consumer::Consumer;
use morax::registry::{
    CheckDefinition, ConsulRegistry, Instance, Registration, Registry, RegistryError,
};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Agent {
    registered: Mutex<Vec<Value>>,
    deregistered: Mutex<Vec<String>>,
    queries: Mutex<Vec<HashMap<String, String>>>,
}

async fn register(State(agent): State<Arc<Agent>>, Json(body): Json<Value>) -> StatusCode {
    agent.registered.lock().unwrap().push(body);
    StatusCode::OK
}

async fn deregister(State(agent): State<Arc<Agent>>, Path(id): Path<String>) -> StatusCode {
    if id == "unknown" {
        return StatusCode::NOT_FOUND;
    }
    agent.deregistered.lock().unwrap().push(id);
    StatusCode::OK
}

async fn health(
    State(agent): State<Arc<Agent>>,
    Path(name): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    agent.queries.lock().unwrap().push(query);
    match name.as_str() {
        "hello" => (
            [("X-Consul-Index", "42")],
            Json(json!([
                {
                    "Node": { "Address": "10.0.0.9" },
                    "Service": { "ID": "hello-b", "Address": "127.0.0.1", "Port": 9002 }
                },
                {
                    "Node": { "Address": "10.0.0.9" },
                    "Service": { "ID": "hello-a", "Address": "", "Port": 9001 }
                }
            ])),
        )
            .into_response(),
        "slow" => {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Json(json!([])).into_response()
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn start_agent() -> (Arc<Agent>, SocketAddr) {
    let agent = Arc::new(Agent::default());
    let app = Router::new()
        .route("/v1/agent/service/register", put(register))
        .route("/v1/agent/service/deregister/{id}", put(deregister))
        .route("/v1/health/service/{name}", get(health))
        .with_state(agent.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (agent, addr)
}

#[tokio::test]
async fn test_register_and_deregister() {
    let (agent, addr) = start_agent().await;
    let registry = ConsulRegistry::new(&addr.to_string(), Duration::from_secs(3));

    let registration = Registration {
        id: "hello-127.0.0.1:8888".into(),
        name: "hello".into(),
        address: "127.0.0.1".into(),
        port: 8888,
        check: Some(CheckDefinition {
            tcp: "127.0.0.1:8889".into(),
            timeout: "5s".into(),
            interval: "5s".into(),
            deregister_critical_service_after: "30s".into(),
        }),
    };
    registry.register(&registration).await.unwrap();

    let registered = agent.registered.lock().unwrap().clone();
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0]["ID"], "hello-127.0.0.1:8888");
    assert_eq!(registered[0]["Check"]["TCP"], "127.0.0.1:8889");
    assert_eq!(registered[0]["Check"]["DeregisterCriticalServiceAfter"], "30s");

    registry.deregister("hello-127.0.0.1:8888").await.unwrap();
    assert_eq!(
        *agent.deregistered.lock().unwrap(),
        vec!["hello-127.0.0.1:8888".to_string()]
    );

    let err = registry.deregister("unknown").await.unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Status { operation: "deregister", status: 404 }
    ));
}

#[tokio::test]
async fn test_find_instances_blocking_query() {
    let (agent, addr) = start_agent().await;
    let registry = ConsulRegistry::new(&format!("http://{addr}/"), Duration::from_secs(3));
    let cancel = CancellationToken::new();

    let (instances, index) = registry.find_instances("hello", 0, &cancel).await.unwrap();
    assert_eq!(index, 42);
    assert_eq!(
        instances,
        vec![
            Instance::new("hello-b", "127.0.0.1", 9002),
            // No service address: the node's is used.
            Instance::new("hello-a", "10.0.0.9", 9001),
        ]
    );

    registry.find_instances("hello", 43, &cancel).await.unwrap();

    let queries = agent.queries.lock().unwrap().clone();
    assert_eq!(queries[0]["passing"], "true");
    assert_eq!(queries[0]["index"], "0");
    assert_eq!(queries[0]["wait"], "3s");
    // The agent gets the last index seen.
    assert_eq!(queries[1]["index"], "42");
}

#[tokio::test]
async fn test_find_instances_errors() {
    let (_agent, addr) = start_agent().await;
    let registry = ConsulRegistry::new(&addr.to_string(), Duration::from_secs(3));

    let err = registry
        .find_instances("broken", 0, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Status { status: 500, .. }));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let err = timeout(Duration::from_secs(2), registry.find_instances("slow", 0, &cancel))
        .await
        .expect("query should stop when cancelled")
        .unwrap_err();
    assert!(matches!(err, RegistryError::Cancelled));
}

#[tokio::test]
async fn test_consumer_discovers_through_agent() {
    let (_agent, addr) = start_agent().await;
    let registry = Arc::new(ConsulRegistry::new(&addr.to_string(), Duration::from_secs(1)));
    let consumer = Consumer::new(ConsumerConfig::default(), registry);

    struct Empty;
    impl morax::consumer::Contract for Empty {
        fn bind(_: &mut morax::consumer::Binder<'_>) -> Self {
            Empty
        }
    }
    let _: Empty = consumer.register_consumer("hello").unwrap();

    assert!(consumer.wait_for_instances("hello", Duration::from_secs(2)).await);
    let ids: Vec<String> = consumer
        .instances("hello")
        .unwrap()
        .into_iter()
        .map(|i| i.id)
        .collect();
    assert_eq!(ids, vec!["hello-a", "hello-b"]);

    timeout(Duration::from_secs(2), consumer.shutdown())
        .await
        .expect("shutdown should cancel the blocking query");
}
