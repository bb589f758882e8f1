//! End-to-end tests against mock upstreams.
//!
//! Each test builds the full router with a wiremock upstream standing in for
//! the provider and drives it through tower's oneshot.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use llm_relay_rust::api::{build_router, AppState};
use llm_relay_rust::core::config::{AppConfig, AuthMode};
use llm_relay_rust::core::families::ModelFamily;
use llm_relay_rust::core::UserRateLimiter;
use llm_relay_rust::services::prompt_logger::PromptLogger;
use llm_relay_rust::services::user_store::{MemoryStore, UserStore, UserType};
use llm_relay_rust::services::{KeyPool, RequestQueue};

fn test_config(upstream: &str) -> AppConfig {
    AppConfig {
        openai_keys: vec!["sk-test-1".to_string(), "sk-test-2".to_string()],
        openai_api_base: upstream.to_string(),
        anthropic_api_base: upstream.to_string(),
        auth_mode: AuthMode::UserToken,
        ..AppConfig::default()
    }
}

fn build_state(config: AppConfig) -> Arc<AppState> {
    let key_pool = Arc::new(KeyPool::from_config(&config));
    let queue = RequestQueue::new(Arc::clone(&key_pool));
    queue.spawn_dispatcher();
    let user_store = UserStore::new(&config, Arc::new(MemoryStore::new()));
    let rate_limiter = Arc::new(UserRateLimiter::new(config.rate_limit_per_minute));

    Arc::new(AppState {
        config,
        key_pool,
        queue,
        user_store,
        rate_limiter,
        prompt_logger: PromptLogger::disabled(),
        http_client: reqwest::Client::new(),
    })
}

fn chat_request(token: &str, stream: bool) -> Request<Body> {
    let body = json!({
        "model": "gpt-3.5-turbo",
        "messages": [{"role": "user", "content": "Say hello."}],
        "stream": stream,
    });
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", token))
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8_lossy(&bytes).to_string()
}

fn sse_chunk(content: Option<&str>, finish: Option<&str>) -> String {
    let delta = match content {
        Some(text) => json!({"content": text}),
        None => json!({}),
    };
    let event = json!({
        "id": "chatcmpl-upstream",
        "object": "chat.completion.chunk",
        "created": 0,
        "model": "gpt-3.5-turbo",
        "choices": [{"index": 0, "delta": delta, "finish_reason": finish}],
    });
    format!("data: {}\n\n", event)
}

#[tokio::test]
async fn test_streaming_happy_path() {
    let upstream = MockServer::start().await;
    let sse_body = format!(
        "{}{}{}data: [DONE]\n\n",
        sse_chunk(Some("Hello"), None),
        sse_chunk(Some(" there"), None),
        sse_chunk(None, Some("stop")),
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(sse_body, "text/event-stream"),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let state = build_state(test_config(&upstream.uri()));
    let user = state.user_store.create_user(UserType::Normal, None);
    let app = build_router(Arc::clone(&state));

    let response = app.oneshot(chat_request(&user.token, true)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let body = body_string(response).await;
    assert!(body.contains("Hello"));
    assert!(body.contains(" there"));
    assert!(body.contains("\"finish_reason\":\"stop\""));
    assert!(body.trim_end().ends_with("data: [DONE]"));

    // Usage accounting ran after aggregation.
    let after = state.user_store.get_user(&user.token).unwrap();
    let charged = after.token_counts.get(&ModelFamily::Turbo).copied().unwrap_or(0);
    assert!(charged > 0, "turbo tokens should be charged");
    assert_eq!(after.prompt_count, 1);

    // The serving key recorded the same usage.
    let keys = state.key_pool.list();
    let used: u64 = keys.iter().map(|k| k.prompt_count).sum();
    assert_eq!(used, 1);
}

#[tokio::test]
async fn test_blocking_happy_path() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-upstream",
            "object": "chat.completion",
            "model": "gpt-3.5-turbo",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hi!"},
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 9, "completion_tokens": 2, "total_tokens": 11},
        })))
        .expect(1)
        .mount(&upstream)
        .await;

    let state = build_state(test_config(&upstream.uri()));
    let user = state.user_store.create_user(UserType::Normal, None);
    let app = build_router(Arc::clone(&state));

    let response = app.oneshot(chat_request(&user.token, false)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "Hi!");
}

#[tokio::test]
async fn test_rate_limit_retry_succeeds_on_second_key() {
    let upstream = MockServer::start().await;
    // First attempt is refused with 429; the retry (on the other key, after
    // revert and re-enqueue) succeeds.
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": {"message": "rate limited", "type": "rate_limit_error"}
        })))
        .up_to_n_times(1)
        .expect(1)
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "recovered"},
                "finish_reason": "stop",
            }],
        })))
        .expect(1)
        .mount(&upstream)
        .await;

    let state = build_state(test_config(&upstream.uri()));
    let user = state.user_store.create_user(UserType::Normal, None);
    let app = build_router(Arc::clone(&state));

    let response = tokio::time::timeout(
        Duration::from_secs(10),
        app.oneshot(chat_request(&user.token, false)),
    )
    .await
    .expect("request timed out")
    .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "recovered");

    // Exactly one key was marked rate limited.
    let limited = state.key_pool.list().iter().filter(|k| k.rate_limited).count();
    assert!(limited >= 1);
}

#[tokio::test]
async fn test_all_keys_disabled_yields_503_without_upstream_call() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let state = build_state(test_config(&upstream.uri()));
    for key in state.key_pool.list() {
        state.key_pool.disable(&key.hash, "revoked upstream");
    }
    let user = state.user_store.create_user(UserType::Normal, None);
    let app = build_router(Arc::clone(&state));

    let response = app.oneshot(chat_request(&user.token, false)).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["error"]["type"], "proxy_no_available_key");
}

#[tokio::test]
async fn test_quota_exceeded_yields_429_without_upstream_call() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let mut config = test_config(&upstream.uri());
    config.token_quota = [(ModelFamily::Turbo, 100)].into_iter().collect();
    let state = build_state(config);

    let user = state.user_store.create_user(UserType::Normal, None);
    state
        .user_store
        .increment_usage(&user.token, ModelFamily::Turbo, 95);
    let app = build_router(Arc::clone(&state));

    let response = app.oneshot(chat_request(&user.token, false)).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["error"]["type"], "proxy_quota_exceeded");
    assert_eq!(body["error"]["quota"], 100);
    assert_eq!(body["error"]["used"], 95);
}

#[tokio::test]
async fn test_upstream_401_disables_key_and_forwards_error() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"message": "Incorrect API key provided", "type": "invalid_request_error"}
        })))
        .expect(1)
        .mount(&upstream)
        .await;

    let mut config = test_config(&upstream.uri());
    config.openai_keys = vec!["sk-revoked".to_string()];
    let state = build_state(config);
    let user = state.user_store.create_user(UserType::Normal, None);
    let app = build_router(Arc::clone(&state));

    let response = app.oneshot(chat_request(&user.token, false)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let keys = state.key_pool.list();
    assert!(keys[0].is_disabled);
    // With its only key disabled, the shard now fails fast.
    let response = build_router(Arc::clone(&state))
        .oneshot(chat_request(&user.token, false))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let upstream = MockServer::start().await;
    let state = build_state(test_config(&upstream.uri()));
    let app = build_router(state);

    let body = json!({
        "model": "gpt-3.5-turbo",
        "messages": [{"role": "user", "content": "hi"}],
    });
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_validation_failure_carries_issues() {
    let upstream = MockServer::start().await;
    let state = build_state(test_config(&upstream.uri()));
    let user = state.user_store.create_user(UserType::Normal, None);
    let app = build_router(state);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", user.token))
        .body(Body::from(json!({"messages": []}).to_string()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["error"]["type"], "proxy_validation_error");
    assert!(!body["error"]["issues"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_anthropic_stream_translated_to_openai_deltas() {
    let upstream = MockServer::start().await;
    // Anthropic v2-style delta events.
    let sse_body = concat!(
        "event: completion\ndata: {\"completion\":\"He\",\"stop_reason\":null}\n\n",
        "event: completion\ndata: {\"completion\":\"llo\",\"stop_reason\":null}\n\n",
        "event: completion\ndata: {\"completion\":\" world\",\"stop_reason\":\"stop_sequence\"}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/complete"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(sse_body, "text/event-stream"),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let mut config = test_config(&upstream.uri());
    config.anthropic_keys = vec!["ak-test".to_string()];
    let state = build_state(config);
    let user = state.user_store.create_user(UserType::Normal, None);
    let app = build_router(Arc::clone(&state));

    // OpenAI-format body against the anthropic surface: inbound dialect is
    // openai chat, upstream events are anthropic.
    let body = json!({
        "model": "claude-v2",
        "messages": [{"role": "user", "content": "Say hello world."}],
        "stream": true,
    });
    let request = Request::builder()
        .method("POST")
        .uri("/v1/complete")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", user.token))
        .body(Body::from(body.to_string()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;

    // Concatenating the emitted deltas reproduces the completion.
    let mut content = String::new();
    for line in body.lines() {
        if let Some(payload) = line.strip_prefix("data: ") {
            if payload == "[DONE]" {
                continue;
            }
            let value: Value = serde_json::from_str(payload).unwrap();
            if let Some(delta) = value["choices"][0]["delta"]["content"].as_str() {
                content.push_str(delta);
            }
        }
    }
    assert_eq!(content, "Hello world");
    assert!(body.trim_end().ends_with("data: [DONE]"));

    let after = state.user_store.get_user(&user.token).unwrap();
    assert!(after.token_counts.get(&ModelFamily::Claude).copied().unwrap_or(0) > 0);
}

#[tokio::test]
async fn test_turbo_instruct_accepts_messages_and_answers_chat() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "gpt-3.5-turbo-instruct",
            "choices": [{"text": "Four.", "index": 0, "finish_reason": "stop"}],
        })))
        .expect(1)
        .mount(&upstream)
        .await;

    let state = build_state(test_config(&upstream.uri()));
    let user = state.user_store.create_user(UserType::Normal, None);
    let app = build_router(state);

    let body = json!({
        "model": "gpt-3.5-turbo-instruct",
        "messages": [{"role": "user", "content": "2+2?"}],
    });
    let request = Request::builder()
        .method("POST")
        .uri("/v1/turbo-instruct/v1/chat/completions")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", user.token))
        .body(Body::from(body.to_string()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    // Text completion reshaped into chat for the caller.
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "Four.");
}

#[tokio::test]
async fn test_models_list_reflects_available_families() {
    let upstream = MockServer::start().await;
    let mut config = test_config(&upstream.uri());
    config.allowed_model_families = [ModelFamily::Turbo].into_iter().collect();
    let state = build_state(config);
    let user = state.user_store.create_user(UserType::Normal, None);
    let app = build_router(state);

    let request = Request::builder()
        .method("GET")
        .uri("/v1/models")
        .header("authorization", format!("Bearer {}", user.token))
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"gpt-3.5-turbo"));
    // gpt4 keys exist but the family is not allowed.
    assert!(!ids.iter().any(|id| id.starts_with("gpt-4")));
}

#[tokio::test]
async fn test_health_endpoint_is_open() {
    let upstream = MockServer::start().await;
    let state = build_state(test_config(&upstream.uri()));
    let app = build_router(state);

    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
