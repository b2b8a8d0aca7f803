//! Integration tests for the HTTP API.
//!
//! Each test spins up an Axum server on a random port backed by stub
//! providers and an in-memory history store, then drives it with reqwest.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::net::TcpListener;

use agentflow::api::{AppState, routes};
use agentflow::store::{HistoryStore, LibSqlHistoryStore};

use common::{StubLlm, classification, directory, draft, harness, review};

/// Start a server on a random port, return its base URL.
async fn start_server(with_history: bool) -> String {
    let h = harness(
        StubLlm::scripted("fast", vec![classification(0.95, "medium")]),
        StubLlm::scripted("strong", vec![draft()]),
        StubLlm::scripted("fast", vec![review(0.9)]),
        Arc::new(directory()),
    )
    .await;

    let history: Option<Arc<dyn HistoryStore>> = if with_history {
        Some(Arc::new(LibSqlHistoryStore::new_memory().await.unwrap()))
    } else {
        None
    };
    let app = routes(AppState {
        orchestrator: h.orchestrator,
        history,
        metrics: h.metrics,
        costs: h.costs,
        batch_concurrency: 2,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    format!("http://127.0.0.1:{port}")
}

fn inquiry() -> Value {
    json!({
        "sender": "sarah.chen@dataflow.io",
        "subject": "Enterprise pricing",
        "body": "We need pricing for 500 seats and SSO."
    })
}

#[tokio::test]
async fn health_reports_history_configuration() {
    let base = start_server(false).await;
    let body: Value = reqwest::get(format!("{base}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["history"], false);
}

#[tokio::test]
async fn process_returns_decision_and_records_history() {
    let base = start_server(true).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/process"))
        .json(&inquiry())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["verdict"], "AUTONOMOUS");
    assert_eq!(body["retry_count"], 0);
    assert_eq!(body["draft_subject"], "Re: Enterprise pricing");
    let id = body["request_id"].as_str().unwrap().to_string();

    let runs: Value = client
        .get(format!("{base}/history?limit=5"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(runs.as_array().unwrap().len(), 1);
    assert_eq!(runs[0]["request_id"], id.as_str());

    let run: Value = client
        .get(format!("{base}/history/{id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(run["phase"], "DECIDED");
    assert_eq!(run["trace"].as_array().unwrap().len(), 6);

    let stats: Value = client
        .get(format!("{base}/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["history"]["total"], 1);
    assert_eq!(stats["history"]["autonomous"], 1);
    assert_eq!(stats["costs"]["requests"], 1);

    let metrics: Value = client
        .get(format!("{base}/metrics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["decisions"], 1);
    assert_eq!(metrics["stages"]["writer"]["executions"], 1);
}

#[tokio::test]
async fn invalid_email_is_bad_request() {
    let base = start_server(true).await;
    let resp = reqwest::Client::new()
        .post(format!("{base}/process"))
        .json(&json!({"sender": "", "body": "hello"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("sender"));
}

#[tokio::test]
async fn batch_keeps_input_order() {
    let base = start_server(true).await;
    let resp = reqwest::Client::new()
        .post(format!("{base}/process/batch"))
        .json(&json!({"emails": [inquiry(), {"sender": "x@y.io", "body": " "}, inquiry()]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["verdict"], "AUTONOMOUS");
    assert!(results[1]["error"].is_string());
    assert_eq!(results[2]["verdict"], "AUTONOMOUS");
}

#[tokio::test]
async fn history_delete_and_clear() {
    let base = start_server(true).await;
    let client = reqwest::Client::new();

    let mut ids = Vec::new();
    for _ in 0..2 {
        let body: Value = client
            .post(format!("{base}/process"))
            .json(&inquiry())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        ids.push(body["request_id"].as_str().unwrap().to_string());
    }

    let resp = client
        .delete(format!("{base}/history/{}", ids[0]))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let resp = client
        .get(format!("{base}/history/{}", ids[0]))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .get(format!("{base}/history/not-a-uuid"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let body: Value = client
        .delete(format!("{base}/history"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["removed"], 1);
}

#[tokio::test]
async fn history_endpoints_without_store_are_unavailable() {
    let base = start_server(false).await;
    let resp = reqwest::get(format!("{base}/history")).await.unwrap();
    assert_eq!(resp.status(), 503);

    let stats: Value = reqwest::get(format!("{base}/stats"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(stats["history"].is_null());
}
