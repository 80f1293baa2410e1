//! Integration tests for the health endpoint.
//!
//! Each test spins up an Axum server on a random port and queries it over
//! HTTP.

use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpListener;

use mech_worker::health::{HealthState, health_routes};
use mech_worker::worker::{DoneTask, DoneTasks};

/// Start the health router on a random port, return the port.
async fn start_server(state: HealthState) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, health_routes(state)).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

async fn healthcheck(port: u16) -> Value {
    reqwest::get(format!("http://127.0.0.1:{port}/healthcheck"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

fn done_task(request_id: u64) -> DoneTask {
    DoneTask {
        request_id,
        mech_address: "0xmech".into(),
        task_executor_address: "0xagent".into(),
        tool: Some("echo".into()),
        request_id_nonce: format!("{request_id}-0"),
        transaction: None,
        task_result: Some("1220ab".into()),
    }
}

#[tokio::test]
async fn fresh_worker_is_healthy() {
    let state = HealthState::new(DoneTasks::new(), Duration::from_secs(3600));
    let port = start_server(state).await;

    let body = healthcheck(port).await;
    assert_eq!(body["is_healthy"], true);
    assert_eq!(body["pending_tasks"], 0);
    assert_eq!(body["done_tasks"], 0);
    assert!(body["last_executed_task"].is_null());
    assert!(body["seconds_since_last_task"].is_null());
}

#[tokio::test]
async fn reports_last_task_and_gauges() {
    let done = DoneTasks::new();
    let state = HealthState::new(done.clone(), Duration::from_secs(3600));
    let port = start_server(state.clone()).await;

    done.append(done_task(42)).await;
    state.set_last_executed(42).await;
    state.set_queue_gauges(3, 2).await;

    let body = healthcheck(port).await;
    assert_eq!(body["last_executed_task"]["request_id"], 42);
    assert_eq!(body["seconds_since_last_task"], 0);
    assert_eq!(body["pending_tasks"], 3);
    assert_eq!(body["executing_tasks"], 2);
    assert_eq!(body["done_tasks"], 1);
    assert_eq!(body["is_healthy"], true);
}

#[tokio::test]
async fn idle_with_pending_work_is_unhealthy() {
    let state = HealthState::new(DoneTasks::new(), Duration::ZERO);
    let port = start_server(state.clone()).await;
    state.set_queue_gauges(1, 0).await;

    let body = healthcheck(port).await;
    assert_eq!(body["is_healthy"], false);

    // Nothing waiting: idling is fine.
    state.set_queue_gauges(0, 0).await;
    let body = healthcheck(port).await;
    assert_eq!(body["is_healthy"], true);
}
