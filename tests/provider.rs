//! Provider Integration Tests
//!
//! Tests the OpenAI-compatible provider against a mock HTTP server:
//! request shape, status classification and the client's handling of
//! rate limits.

use std::sync::Arc;
use std::time::Duration;

use digestion::adapters::{
    CompletionProvider, CompletionRequest, OpenAiConfig, OpenAiProvider, ProviderError,
};
use digestion::digest::{DigestOutcome, DigestionClient};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider(server: &MockServer) -> OpenAiProvider {
    OpenAiProvider::new(OpenAiConfig {
        base_url: server.uri(),
        api_key: Some("sk-test".to_string()),
        model: "test-model".to_string(),
    })
}

fn request(json_output: bool) -> CompletionRequest {
    CompletionRequest {
        system: "Summarize.".to_string(),
        prompt: "Buy milk and call Sam.".to_string(),
        temperature: 0.3,
        max_tokens: 1000,
        json_output,
    }
}

fn chat_reply(content: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-1",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }]
    })
}

#[tokio::test]
async fn test_structured_request_shape() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("Authorization", "Bearer sk-test"))
        .and(body_partial_json(serde_json::json!({
            "model": "test-model",
            "max_tokens": 1000,
            "response_format": { "type": "json_object" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_reply("{\"ok\":true}")))
        .expect(1)
        .mount(&server)
        .await;

    let reply = provider(&server).complete(&request(true)).await.unwrap();
    assert_eq!(reply, "{\"ok\":true}");
}

#[tokio::test]
async fn test_plain_request_omits_response_format() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_reply("plain text")))
        .mount(&server)
        .await;

    provider(&server).complete(&request(false)).await.unwrap();

    let received = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    assert!(body.get("response_format").is_none());
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][1]["content"], "Buy milk and call Sam.");
}

#[tokio::test]
async fn test_rate_limit_reads_retry_after() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("Retry-After", "7")
                .set_body_string("slow down"),
        )
        .mount(&server)
        .await;

    let err = provider(&server).complete(&request(true)).await.unwrap_err();
    assert_eq!(
        err,
        ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(7))
        }
    );
}

#[tokio::test]
async fn test_server_error_is_status() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let err = provider(&server).complete(&request(true)).await.unwrap_err();
    assert!(matches!(err, ProviderError::Status { status: 503, .. }));
}

#[tokio::test]
async fn test_empty_choices_are_malformed() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "choices": [] })))
        .mount(&server)
        .await;

    let err = provider(&server).complete(&request(true)).await.unwrap_err();
    assert!(matches!(err, ProviderError::Malformed(_)));
}

#[tokio::test]
async fn test_health_check_hits_models() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "data": [] })))
        .expect(1)
        .mount(&server)
        .await;

    provider(&server).health_check().await.unwrap();
}

#[tokio::test]
async fn test_client_does_not_fall_back_on_rate_limit() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "3"))
        .mount(&server)
        .await;

    let client = DigestionClient::new(Arc::new(provider(&server)));
    let outcome = client.digest("Buy milk and call Sam.").await;

    assert!(matches!(
        outcome,
        DigestOutcome::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(3)
    ));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_client_parses_structured_reply() {
    let server = MockServer::start().await;
    let content = serde_json::json!({
        "summary": "Errands for the weekend",
        "ideas": ["Buy milk on the way home"],
        "todos": [{ "description": "Call Sam", "deadline": "Saturday", "priority": "high" }],
        "confidence": "high"
    })
    .to_string();

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_reply(&content)))
        .mount(&server)
        .await;

    let client = DigestionClient::new(Arc::new(provider(&server)));
    match client.digest("Buy milk and call Sam on Saturday.").await {
        DigestOutcome::Success(response) => {
            assert_eq!(response.summary, "Errands for the weekend");
            assert_eq!(response.todos.len(), 1);
            assert_eq!(response.todos[0].deadline.as_deref(), Some("Saturday"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}
