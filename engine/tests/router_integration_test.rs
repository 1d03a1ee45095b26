//! Integration tests for the inference port
//!
//! Validates retry and provider fallback using mock servers

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use forge_engine::config::Config;
use forge_engine::llm::{
    ollama::OllamaProvider, InferencePort, LLMError, LLMProvider, Message, SamplingParams,
};

fn reply(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "model": "qwen2.5-coder:7b",
        "message": { "role": "assistant", "content": content },
        "done": true
    }))
}

fn provider(server: &MockServer) -> Arc<dyn LLMProvider> {
    Arc::new(
        OllamaProvider::new(server.uri(), "qwen2.5-coder:7b", Duration::from_secs(5)).unwrap(),
    )
}

fn port(providers: Vec<Arc<dyn LLMProvider>>, max_retries: u32) -> InferencePort {
    InferencePort::new(
        providers,
        SamplingParams::default(),
        2,
        Duration::from_secs(5),
        max_retries,
    )
    .with_retry_delay(Duration::from_millis(5))
}

#[tokio::test]
async fn test_failover_to_second_provider() {
    let failing_server = MockServer::start().await;
    let succeeding_server = MockServer::start().await;

    // Server errors are not transient, so the first provider is tried once
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&failing_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(reply("Hello from the backup provider"))
        .expect(1)
        .mount(&succeeding_server)
        .await;

    let port = port(
        vec![provider(&failing_server), provider(&succeeding_server)],
        3,
    );

    let text = port.complete(&[Message::user("Hello")]).await.unwrap();
    assert_eq!(text, "Hello from the backup provider");
}

#[tokio::test]
async fn test_rate_limit_is_retried_on_same_provider() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(reply("third time lucky"))
        .expect(1)
        .mount(&server)
        .await;

    let port = port(vec![provider(&server)], 2);
    let text = port.complete(&[Message::user("Hello")]).await.unwrap();
    assert_eq!(text, "third time lucky");
}

#[tokio::test]
async fn test_blank_completion_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(reply("  \n"))
        .mount(&server)
        .await;

    let port = port(vec![provider(&server)], 2);
    let err = port.complete(&[Message::user("Hello")]).await.unwrap_err();
    assert!(matches!(err, LLMError::EmptyResponse));
}

#[tokio::test]
async fn test_slow_provider_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(reply("late").set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let port = InferencePort::new(
        vec![provider(&server)],
        SamplingParams::default(),
        1,
        Duration::from_millis(200),
        0,
    );
    let err = port.complete(&[Message::user("Hello")]).await.unwrap_err();
    assert!(matches!(err, LLMError::Timeout));
}

#[tokio::test]
async fn test_health_report_per_provider() {
    let up = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "models": [] })))
        .mount(&up)
        .await;
    let down = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&down)
        .await;

    let port = port(vec![provider(&up), provider(&down)], 0);
    let health = port.check_health().await;
    assert_eq!(
        health,
        vec![("ollama".to_string(), true), ("ollama".to_string(), false)]
    );
}

#[test]
fn test_port_from_config() {
    let mut config = Config::default();
    config.llm.openai.enabled = true;

    let port = InferencePort::from_config(&config).unwrap();
    assert_eq!(port.provider_names(), vec!["ollama", "openai"]);
    assert_eq!(port.sampling().max_tokens, config.llm.max_tokens);
}
