//! Route handlers and router assembly.
//!
//! Every proxied endpoint runs the same skeleton: parse and validate the
//! inbound body, authenticate, classify the model into its family, transcode
//! into the outbound dialect, then hand off to the streaming or blocking
//! pipeline. The per-route closures only describe what differs.

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::api::admin::admin_router;
use crate::api::auth::authenticate_request;
use crate::api::blocking::handle_blocking;
use crate::api::models::{
    build_model_list, messages_to_anthropic_prompt, messages_to_palm_payload,
    messages_to_plain_prompt, validate_anthropic_request, validate_chat_request,
    validate_embeddings_request, validate_image_request, validate_text_request,
};
use crate::api::streaming::stream_response;
use crate::api::{AppState, RequestContext};
use crate::core::cancel::CancelHandle;
use crate::core::config::AppConfig;
use crate::core::error::{ProxyError, Result};
use crate::core::families::{classify, ModelFamily, Service};
use crate::core::metrics::render_metrics;
use crate::core::token_counter::{count_tokens, TokenInput};
use crate::transformer::ApiFormat;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(openai_chat))
        .route("/v1/completions", post(openai_text))
        .route("/v1/turbo-instruct/chat/completions", post(turbo_instruct))
        .route("/v1/turbo-instruct/v1/chat/completions", post(turbo_instruct))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/images/generations", post(image_generations))
        .route("/v1/complete", post(anthropic_complete))
        .route("/mistral-ai/v1/chat/completions", post(mistral_chat))
        .route("/google-palm/v1/chat/completions", post(palm_chat))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .nest("/admin", admin_router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Route-specific preprocessing output; everything else is shared.
struct Prepared {
    service: Service,
    family: ModelFamily,
    inbound: ApiFormat,
    outbound: ApiFormat,
    model: String,
    upstream_url: String,
    is_streaming: bool,
    prompt: Value,
    outbound_body: Value,
}

async fn proxy_entry<F>(
    state: Arc<AppState>,
    headers: HeaderMap,
    body: Bytes,
    prepare: F,
) -> Response
where
    F: FnOnce(&AppConfig, Value) -> Result<Prepared>,
{
    match proxy_entry_inner(state, headers, body, prepare).await {
        Ok(response) => response,
        Err(err) => err.classify().into_response(),
    }
}

async fn proxy_entry_inner<F>(
    state: Arc<AppState>,
    headers: HeaderMap,
    body: Bytes,
    prepare: F,
) -> Result<Response>
where
    F: FnOnce(&AppConfig, Value) -> Result<Prepared>,
{
    let body: Value = serde_json::from_slice(&body).map_err(|e| ProxyError::Validation {
        message: "request body is not valid JSON".to_string(),
        issues: vec![e.to_string()],
    })?;

    let user = authenticate_request(&state, &headers)?;
    let prepared = prepare(&state.config, body)?;

    if !state
        .config
        .allowed_model_families
        .contains(&prepared.family)
    {
        return Err(ProxyError::Validation {
            message: format!("model family {} is not served here", prepared.family),
            issues: vec![],
        });
    }

    let prompt_tokens =
        count_prompt_tokens(prepared.service, &prepared.model, &prepared.prompt);

    let ctx = RequestContext {
        request_id: Uuid::new_v4().simple().to_string(),
        service: prepared.service,
        family: prepared.family,
        inbound: prepared.inbound,
        outbound: prepared.outbound,
        model: prepared.model,
        upstream_url: prepared.upstream_url,
        is_streaming: prepared.is_streaming,
        prompt_tokens,
        prompt: prepared.prompt,
        outbound_body: prepared.outbound_body,
        user,
        cancel: CancelHandle::new(),
        origin: header_string(&headers, "origin"),
        referer: header_string(&headers, "referer"),
    };

    tracing::debug!(
        request = %ctx.request_id,
        service = %ctx.service,
        family = %ctx.family,
        model = %ctx.model,
        streaming = ctx.is_streaming,
        prompt_tokens,
        "request admitted"
    );

    if ctx.is_streaming {
        Ok(stream_response(state, ctx))
    } else {
        handle_blocking(&state, &ctx).await
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Price the prompt in whatever shape the route produced.
fn count_prompt_tokens(service: Service, model: &str, prompt: &Value) -> u64 {
    match prompt {
        Value::String(text) => {
            count_tokens(service, model, &TokenInput::Text(text)) as u64
        }
        Value::Array(items) if items.iter().all(|i| i.is_string()) => {
            let joined = items
                .iter()
                .filter_map(|i| i.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            count_tokens(service, model, &TokenInput::Text(&joined)) as u64
        }
        Value::Array(messages) => {
            count_tokens(service, model, &TokenInput::Messages(messages)) as u64
        }
        _ => 0,
    }
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

async fn openai_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy_entry(state, headers, body, |config, body| {
        let validated = validate_chat_request(&body)?;
        let family = classify(Service::Openai, &validated.model);
        Ok(Prepared {
            service: Service::Openai,
            family,
            inbound: ApiFormat::OpenAi,
            outbound: ApiFormat::OpenAi,
            upstream_url: format!("{}/v1/chat/completions", config.openai_api_base),
            model: validated.model,
            is_streaming: validated.is_streaming,
            prompt: validated.prompt,
            outbound_body: body,
        })
    })
    .await
}

async fn openai_text(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy_entry(state, headers, body, |config, body| {
        let validated = validate_text_request(&body)?;
        let family = classify(Service::Openai, &validated.model);
        Ok(Prepared {
            service: Service::Openai,
            family,
            inbound: ApiFormat::OpenAiText,
            outbound: ApiFormat::OpenAiText,
            upstream_url: format!("{}/v1/completions", config.openai_api_base),
            model: validated.model,
            is_streaming: validated.is_streaming,
            prompt: validated.prompt,
            outbound_body: body,
        })
    })
    .await
}

/// Accepts either `prompt` or `messages`; rewrites the URL (and body) onto
/// the text-completion surface while answering in chat shape.
async fn turbo_instruct(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy_entry(state, headers, body, |config, body| {
        let model = "gpt-3.5-turbo-instruct".to_string();
        let (prompt_value, prompt_for_log, is_streaming) =
            if let Some(messages) = body["messages"].as_array() {
                let validated = validate_chat_request(&body)?;
                (
                    json!(messages_to_plain_prompt(messages)),
                    validated.prompt,
                    validated.is_streaming,
                )
            } else {
                let validated = validate_text_request(&body)?;
                (body["prompt"].clone(), validated.prompt, validated.is_streaming)
            };

        let mut outbound_body = body.clone();
        if let Some(map) = outbound_body.as_object_mut() {
            map.remove("messages");
            map.insert("prompt".to_string(), prompt_value);
            map.insert("model".to_string(), json!(model.clone()));
        }

        Ok(Prepared {
            service: Service::Openai,
            family: ModelFamily::Turbo,
            inbound: ApiFormat::OpenAi,
            outbound: ApiFormat::OpenAiText,
            upstream_url: format!("{}/v1/completions", config.openai_api_base),
            model,
            is_streaming,
            prompt: prompt_for_log,
            outbound_body,
        })
    })
    .await
}

async fn embeddings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy_entry(state, headers, body, |config, body| {
        let validated = validate_embeddings_request(&body)?;
        Ok(Prepared {
            service: Service::Openai,
            family: ModelFamily::Turbo,
            inbound: ApiFormat::OpenAi,
            outbound: ApiFormat::OpenAi,
            upstream_url: format!("{}/v1/embeddings", config.openai_api_base),
            model: validated.model,
            is_streaming: false,
            prompt: validated.prompt,
            outbound_body: body,
        })
    })
    .await
}

async fn image_generations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy_entry(state, headers, body, |config, body| {
        let validated = validate_image_request(&body)?;
        Ok(Prepared {
            service: Service::Openai,
            family: ModelFamily::DallE,
            inbound: ApiFormat::OpenAiImage,
            outbound: ApiFormat::OpenAiImage,
            upstream_url: format!("{}/v1/images/generations", config.openai_api_base),
            model: validated.model,
            is_streaming: false,
            prompt: validated.prompt,
            outbound_body: body,
        })
    })
    .await
}

/// Anthropic completion. Models with the `anthropic.` vendor prefix are
/// served from the Bedrock key shard. OpenAI-format chat bodies are accepted
/// and transcoded; the response comes back in the caller's dialect.
async fn anthropic_complete(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy_entry(state, headers, body, |config, body| {
        let validated = validate_anthropic_request(&body)?;
        let family = classify(Service::Anthropic, &validated.model);
        let service = family.service();

        let openai_shaped = body.get("messages").is_some();
        let (inbound, outbound_body) = if openai_shaped {
            let messages = body["messages"].as_array().cloned().unwrap_or_default();
            let outbound = json!({
                "model": validated.model.clone(),
                "prompt": messages_to_anthropic_prompt(&messages),
                "max_tokens_to_sample": body["max_tokens"].as_u64().unwrap_or(500),
                "stream": validated.is_streaming,
            });
            (ApiFormat::OpenAi, outbound)
        } else {
            (ApiFormat::Anthropic, body.clone())
        };

        Ok(Prepared {
            service,
            family,
            inbound,
            outbound: ApiFormat::Anthropic,
            upstream_url: format!("{}/v1/complete", config.anthropic_api_base),
            model: validated.model,
            is_streaming: validated.is_streaming,
            prompt: validated.prompt,
            outbound_body,
        })
    })
    .await
}

async fn mistral_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy_entry(state, headers, body, |config, body| {
        let validated = validate_chat_request(&body)?;
        let family = classify(Service::Mistral, &validated.model);
        Ok(Prepared {
            service: Service::Mistral,
            family,
            inbound: ApiFormat::MistralAi,
            outbound: ApiFormat::MistralAi,
            upstream_url: format!("{}/v1/chat/completions", config.mistral_api_base),
            model: validated.model,
            is_streaming: validated.is_streaming,
            prompt: validated.prompt,
            outbound_body: body,
        })
    })
    .await
}

/// PaLM shard: accepts OpenAI chat, talks generateText upstream. PaLM has no
/// SSE surface, so streamed requests are answered from the single upstream
/// body via the dialect shim.
async fn palm_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy_entry(state, headers, body, |config, body| {
        let validated = validate_chat_request(&body)?;
        let family = classify(Service::GooglePalm, &validated.model);
        let messages = body["messages"].as_array().cloned().unwrap_or_default();
        let outbound_body = messages_to_palm_payload(&messages, &body);
        Ok(Prepared {
            service: Service::GooglePalm,
            family,
            inbound: ApiFormat::OpenAi,
            outbound: ApiFormat::GooglePalm,
            upstream_url: format!(
                "{}/v1beta2/models/{}:generateText",
                config.google_palm_api_base, validated.model
            ),
            model: validated.model,
            is_streaming: validated.is_streaming,
            prompt: validated.prompt,
            outbound_body,
        })
    })
    .await
}

async fn list_models(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(err) = authenticate_request(&state, &headers) {
        return err.into_response();
    }
    Json(build_model_list(&state)).into_response()
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn metrics() -> impl IntoResponse {
    render_metrics()
}
