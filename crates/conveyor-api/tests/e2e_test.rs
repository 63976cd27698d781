// End-to-end smoke test against a running server
// Run with: CONVEYOR_CONFIG=demos/conveyor.yaml cargo run -p conveyor-api &
//           cargo test --test e2e_test -- --ignored

use serde_json::{json, Value};

const API_BASE_URL: &str = "http://localhost:8080";

#[tokio::test]
#[ignore] // Needs a running server; run with -- --ignored
async fn test_full_resource_workflow() {
    let client = reqwest::Client::new();

    // Health
    let health: Value = client
        .get(format!("{}/healthz", API_BASE_URL))
        .send()
        .await
        .expect("health request failed")
        .json()
        .await
        .expect("health body");
    assert_eq!(health["status"], "ok");

    // Create a conversation
    let response = client
        .post(format!("{}/conversations", API_BASE_URL))
        .json(&json!({"from": "+15550100", "message": "first contact"}))
        .send()
        .await
        .expect("create failed");
    assert_eq!(response.status(), 201);
    let created: Value = response.json().await.expect("create body");
    let id = created["id"].as_str().expect("created id").to_string();

    // Read it back
    let fetched: Value = client
        .get(format!("{}/conversations/{}", API_BASE_URL, id))
        .send()
        .await
        .expect("get failed")
        .json()
        .await
        .expect("get body");
    assert_eq!(fetched["id"], created["id"]);

    // Advance it
    let response = client
        .post(format!("{}/conversations/{}/transition", API_BASE_URL, id))
        .json(&json!({"transition": "open"}))
        .send()
        .await
        .expect("transition failed");
    assert_eq!(response.status(), 200);
    let advanced: Value = response.json().await.expect("transition body");
    assert_eq!(advanced["state"], "open");

    // Summary shows the live state
    let summary: Value = client
        .get(format!("{}/conversations/{}/summary", API_BASE_URL, id))
        .send()
        .await
        .expect("summary failed")
        .json()
        .await
        .expect("summary body");
    assert_eq!(summary["state"], "open");
}
