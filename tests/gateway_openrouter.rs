use std::time::Duration;

use serde_json::json;
use squad_harness::gateway::{FinishReason, GenerateRequest, ModelError, ModelGateway, OpenRouterAdapter};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn adapter(server: &MockServer) -> OpenRouterAdapter {
    OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
        .unwrap()
}

fn request() -> GenerateRequest {
    GenerateRequest::new("openai/gpt-4.1", "be terse", "propose", "test")
        .temperature(0.4)
        .max_tokens(512)
        .json()
}

#[tokio::test]
async fn openrouter_parses_content_usage_and_model() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "openai/gpt-4.1",
            "max_tokens": 512,
            "response_format": {"type": "json_object"},
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "openai/gpt-4.1-2025-04-14",
            "choices": [{
                "message": { "content": "{\"proposal\": {}}" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 20 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let resp = adapter(&server).generate(request()).await.unwrap();
    assert_eq!(resp.content, "{\"proposal\": {}}");
    assert_eq!(resp.finish_reason, FinishReason::Stop);
    assert_eq!(resp.usage.input, 10);
    assert_eq!(resp.usage.output, 20);
    assert_eq!(resp.usage.total, 30);
    assert_eq!(resp.model, "openai/gpt-4.1-2025-04-14");
}

#[tokio::test]
async fn openrouter_falls_back_to_tool_call_arguments_when_content_empty() {
    let server = MockServer::start().await;
    let args = r#"{"proposal": {"governance": {}}}"#;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{"function": {"arguments": args}}]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
        })))
        .mount(&server)
        .await;

    let resp = adapter(&server).generate(request()).await.unwrap();
    assert_eq!(resp.content, args);
    assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
    // No model echoed back: the requested one is reported.
    assert_eq!(resp.model, "openai/gpt-4.1");
}

#[tokio::test]
async fn openrouter_maps_429_to_rate_limited() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": { "message": "slow down", "code": 429 }
        })))
        .mount(&server)
        .await;

    let err = adapter(&server).generate(request()).await.unwrap_err();
    assert!(matches!(err, ModelError::RateLimited { .. }), "{err:?}");
}

#[tokio::test]
async fn openrouter_surfaces_provider_error_message() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(502)
                .insert_header("x-request-id", "req-123")
                .set_body_json(json!({ "error": { "message": "upstream overloaded" } })),
        )
        .mount(&server)
        .await;

    let err = adapter(&server).generate(request()).await.unwrap_err();
    match err {
        ModelError::Provider {
            message, context, ..
        } => {
            assert_eq!(message, "upstream overloaded");
            let context = context.unwrap();
            assert_eq!(context.http_status, Some(502));
            assert_eq!(context.request_id.as_deref(), Some("req-123"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn openrouter_detects_refusals() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "I cannot help with that request." },
                "finish_reason": "stop"
            }]
        })))
        .mount(&server)
        .await;

    let err = adapter(&server).generate(request()).await.unwrap_err();
    assert!(matches!(err, ModelError::Refused { .. }), "{err:?}");
}

#[tokio::test]
async fn oversized_input_is_rejected_before_any_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let req = GenerateRequest::new("m", "s", "x".repeat(600_000), "test");
    let err = adapter(&server).generate(req).await.unwrap_err();
    assert!(matches!(err, ModelError::InvalidRequest { .. }), "{err:?}");
}
