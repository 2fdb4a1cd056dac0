//! HTTP transport integration tests.
//!
//! Starts an axum server over a wired service and exercises it with reqwest.

use std::sync::Arc;

use provisioning_rust::api::http;
use provisioning_rust::PrefillMode;
use serde_json::{json, Value};

use crate::support::{users, Harness};

/// Bind to port 0 and return the base URL.
async fn start_server(harness: &Harness) -> String {
    let app = http::router(harness.provisioning.app_state());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn health_check() {
    let harness = Harness::new(Arc::new(users(&[]))).await;
    let base = start_server(&harness).await;

    let resp = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({ "ok": true }));
}

#[tokio::test]
async fn subscription_lifecycle() {
    let harness = Harness::new(Arc::new(users(&[]))).await;
    let base = start_server(&harness).await;
    let client = reqwest::Client::new();
    let input = json!({
        "name": "crm",
        "realm_topics": [["udm", "users/user"]],
        "request_prefill": false
    });

    let resp = client
        .post(format!("{base}/v1/subscriptions"))
        .json(&input)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["prefill_status"], "done");

    // Same settings again.
    let resp = client
        .post(format!("{base}/v1/subscriptions"))
        .json(&input)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Different settings under the same name.
    let resp = client
        .post(format!("{base}/v1/subscriptions"))
        .json(&json!({ "name": "crm", "realm_topics": [["udm", ".*"]] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("crm"));

    let resp = client.get(format!("{base}/v1/subscriptions")).send().await.unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body.as_array().unwrap().len(), 1);

    let resp = client
        .get(format!("{base}/v1/subscriptions/crm"))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["realm_topics"], json!([["udm", "users/user"]]));

    let resp = client
        .delete(format!("{base}/v1/subscriptions/crm"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let resp = client
        .get(format!("{base}/v1/subscriptions/crm"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn invalid_input_returns_400() {
    let harness = Harness::new(Arc::new(users(&[]))).await;
    let base = start_server(&harness).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/v1/subscriptions"))
        .json(&json!({ "name": "crm", "realm_topics": [["ldap", ".*"]] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(format!("{base}/v1/messages"))
        .json(&json!({
            "realm": "udm",
            "topic": "users/user",
            "body": { "old": null, "new": null }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn ingest_read_and_confirm() {
    let harness = Harness::new(Arc::new(users(&[]))).await;
    let base = start_server(&harness).await;
    let client = reqwest::Client::new();
    client
        .post(format!("{base}/v1/subscriptions"))
        .json(&json!({ "name": "crm", "realm_topics": [["udm", "users/.*"]] }))
        .send()
        .await
        .unwrap();
    let dispatcher = harness.provisioning.spawn_dispatcher();

    let resp = client
        .post(format!("{base}/v1/messages"))
        .json(&json!({
            "realm": "udm",
            "topic": "users/user",
            "body": { "new": { "dn": "uid=a" } }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let accepted: Value = resp.json().await.unwrap();
    assert!(accepted["event_id"].is_string());

    let resp = client
        .get(format!("{base}/v1/subscriptions/crm/messages?timeout=2"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let messages: Value = resp.json().await.unwrap();
    let message = &messages.as_array().unwrap()[0];
    assert_eq!(message["event_id"], accepted["event_id"]);
    assert_eq!(message["body"]["new"]["dn"], "uid=a");
    assert_eq!(message["body"]["old"], json!({}));

    let sequence = message["sequence_number"].as_u64().unwrap();
    let resp = client
        .post(format!("{base}/v1/subscriptions/crm/messages-status"))
        .json(&json!({ "sequence_number": sequence, "status": "ok" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .get(format!("{base}/v1/subscriptions/crm/messages?timeout=0.1&pop=true"))
        .send()
        .await
        .unwrap();
    let messages: Value = resp.json().await.unwrap();
    assert_eq!(messages, json!([]));

    let resp = client
        .get(format!("{base}/v1/subscriptions/nope/messages?timeout=0"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn prefill_status_follows_the_state_machine() {
    let harness = Harness::with_mode(Arc::new(users(&[])), PrefillMode::Queue).await;
    let base = start_server(&harness).await;
    let client = reqwest::Client::new();
    client
        .post(format!("{base}/v1/subscriptions"))
        .json(&json!({
            "name": "crm",
            "realm_topics": [["udm", "users/user"]],
            "request_prefill": true
        }))
        .send()
        .await
        .unwrap();

    // No worker runs, so the status stays pending until set by hand.
    let patch = |status: &'static str| {
        client
            .patch(format!("{base}/v1/subscriptions/crm/prefill"))
            .json(&json!({ "status": status }))
            .send()
    };
    assert_eq!(patch("done").await.unwrap().status(), 409);
    assert_eq!(patch("running").await.unwrap().status(), 200);
    let resp = patch("done").await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["prefill_status"], "done");
    assert_eq!(patch("running").await.unwrap().status(), 409);
}
