//! Loopback router behavior over the wire: endpoint schemas, depth
//! routing, batched ordering, usage accounting, and error bodies.

mod common;

use common::{FailingProvider, UppercaseProvider};
use rlm_engine::{LlmRouter, ModelProvider};
use serde_json::{json, Value};
use std::sync::Arc;

async fn started_router(
    root: Arc<dyn ModelProvider>,
    sub: Option<Arc<dyn ModelProvider>>,
) -> (LlmRouter, String) {
    let mut router = LlmRouter::new(root, sub);
    let address = router.start().await.unwrap();
    (router, address.base_url())
}

#[tokio::test]
async fn llm_query_returns_response_and_call_record() {
    let root = Arc::new(UppercaseProvider::new("root"));
    let (mut router, base) = started_router(root.clone(), None).await;

    let client = reqwest::Client::new();
    let body: Value = client
        .post(format!("{base}/llm_query"))
        .json(&json!({ "prompt": "hello" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["response"], "HELLO");
    assert_eq!(body["rlm_call"]["model"], "root");
    assert_eq!(body["rlm_call"]["prompt"], "hello");
    assert_eq!(body["rlm_call"]["usage"]["root"]["calls"], 1);

    router.stop().await;
}

#[tokio::test]
async fn depth_one_routes_to_sub_model_and_explicit_name_wins() {
    let root = Arc::new(UppercaseProvider::new("root"));
    let sub = Arc::new(UppercaseProvider::new("sub"));
    let (mut router, base) = started_router(root.clone(), Some(sub.clone())).await;

    let client = reqwest::Client::new();

    // depth 1 without an explicit model goes to the sub-model.
    let body: Value = client
        .post(format!("{base}/llm_query"))
        .json(&json!({ "prompt": "a", "depth": 1 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["rlm_call"]["model"], "sub");

    // depth 0 goes to the default.
    let body: Value = client
        .post(format!("{base}/llm_query"))
        .json(&json!({ "prompt": "a", "depth": 0 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["rlm_call"]["model"], "root");

    // An explicitly registered name always wins, regardless of depth.
    let body: Value = client
        .post(format!("{base}/llm_query"))
        .json(&json!({ "prompt": "a", "model": "sub", "depth": 0 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["rlm_call"]["model"], "sub");

    router.stop().await;
}

#[tokio::test]
async fn batched_responses_preserve_input_order() {
    // Reverse-sorted delays: the first prompt finishes last.
    let root = Arc::new(
        UppercaseProvider::new("root")
            .with_delay("a", 300)
            .with_delay("b", 150)
            .with_delay("c", 10),
    );
    let (mut router, base) = started_router(root.clone(), None).await;

    let client = reqwest::Client::new();
    let body: Value = client
        .post(format!("{base}/llm_query_batched"))
        .json(&json!({ "prompts": ["a", "b", "c"] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["responses"], json!(["A", "B", "C"]));
    let calls = body["rlm_calls"].as_array().unwrap();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0]["prompt"], "a");
    assert_eq!(calls[2]["prompt"], "c");
    assert_eq!(root.calls(), 3);

    // Usage is tracked once per element.
    assert_eq!(router.usage().get_usage_summary()["root"].calls, 3);

    router.stop().await;
}

#[tokio::test]
async fn usage_counters_accumulate_across_calls() {
    let root = Arc::new(UppercaseProvider::new("root"));
    let (mut router, base) = started_router(root, None).await;

    let client = reqwest::Client::new();
    for _ in 0..4 {
        client
            .post(format!("{base}/llm_query"))
            .json(&json!({ "prompt": "x" }))
            .send()
            .await
            .unwrap();
    }

    let summary = router.usage().get_usage_summary();
    assert_eq!(summary["root"].calls, 4);
    assert_eq!(summary["root"].input_tokens, 4);
    assert_eq!(summary["root"].output_tokens, 4);

    let last = router.usage().get_last_usage().unwrap();
    assert_eq!(last.calls, 1);

    router.stop().await;
}

#[tokio::test]
async fn adapter_failure_yields_500_error_body() {
    let (mut router, base) = started_router(Arc::new(FailingProvider), None).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/llm_query"))
        .json(&json!({ "prompt": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 500);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("synthetic adapter failure"));

    router.stop().await;
}

#[tokio::test]
async fn malformed_json_yields_500_error_body() {
    let root = Arc::new(UppercaseProvider::new("root"));
    let (mut router, base) = started_router(root, None).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/llm_query"))
        .header("Content-Type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 500);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("Invalid request body"));

    router.stop().await;
}

#[tokio::test]
async fn unknown_endpoint_is_reported() {
    let root = Arc::new(UppercaseProvider::new("root"));
    let (mut router, base) = started_router(root, None).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/nope"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Unknown endpoint: /nope");

    router.stop().await;
}

#[tokio::test]
async fn message_list_prompts_pass_through() {
    let root = Arc::new(UppercaseProvider::new("root"));
    let (mut router, base) = started_router(root, None).await;

    let client = reqwest::Client::new();
    let body: Value = client
        .post(format!("{base}/llm_query"))
        .json(&json!({
            "prompt": [
                { "role": "system", "content": "be brief" },
                { "role": "user", "content": "hi" }
            ]
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    // The stub answers with the upper-cased last message.
    assert_eq!(body["response"], "HI");

    router.stop().await;
}
