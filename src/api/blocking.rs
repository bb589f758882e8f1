//! Blocking (non-streaming) response pipeline.
//!
//! Decode the upstream body (content-encoding is handled by the transport),
//! run the handler chain — usage accounting, prompt logging, dialect
//! transform, proxy note — and send the JSON to the client.

use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::api::mutators::ProxyReqManager;
use crate::api::upstream::{dispatch_blocking, UpstreamResponse};
use crate::api::{AppState, RequestContext};
use crate::core::error::{ProxyError, Result};
use crate::core::metrics::PROXY_REQUESTS;
use crate::core::token_counter::{count_tokens, TokenInput};
use crate::services::prompt_logger::PromptLogEntry;
use crate::transformer::ApiFormat;

pub async fn handle_blocking(state: &Arc<AppState>, ctx: &RequestContext) -> Result<Response> {
    let mut manager = ProxyReqManager::new(ctx.upstream_url.clone(), ctx.outbound_body.clone());
    let (key, upstream) = dispatch_blocking(state, ctx, &mut manager).await?;

    let body: Value = match upstream {
        UpstreamResponse::Http(response) => response.json().await?,
        UpstreamResponse::Json { body, .. } => body,
        UpstreamResponse::Events(_) => {
            return Err(ProxyError::Internal(
                "event stream on the blocking path".to_string(),
            ));
        }
    };

    let completion_text = extract_completion_text(ctx.outbound, &body);
    let completion_tokens =
        count_tokens(ctx.service, &ctx.model, &TokenInput::Text(&completion_text)) as u64;
    record_usage(state, ctx, &key.hash, completion_tokens, &completion_text);

    let mut body = transform_blocking_response(ctx.inbound, ctx.outbound, &ctx.request_id, body);
    if state.prompt_logger.is_enabled() {
        body["proxy_note"] = json!("Prompts are logged by this proxy instance.");
    }

    ctx.cancel.mark_completed();
    PROXY_REQUESTS
        .with_label_values(&[ctx.service.as_str(), ctx.family.as_str(), "ok"])
        .inc();
    Ok(Json(body).into_response())
}

/// Shared accounting tail for both pipelines: charge the user and the key,
/// and enqueue the prompt log record.
pub fn record_usage(
    state: &Arc<AppState>,
    ctx: &RequestContext,
    key_hash: &str,
    completion_tokens: u64,
    completion_text: &str,
) {
    let total = ctx.prompt_tokens + completion_tokens;
    if let Some(user) = &ctx.user {
        state
            .user_store
            .increment_usage(&user.token, ctx.family, total);
    }
    state.key_pool.increment_usage(key_hash, &ctx.model, total);

    state.prompt_logger.log(PromptLogEntry {
        timestamp: Utc::now(),
        request_id: ctx.request_id.clone(),
        model: ctx.model.clone(),
        family: ctx.family,
        prompt: ctx.prompt.clone(),
        response: completion_text.to_string(),
        prompt_tokens: ctx.prompt_tokens,
        completion_tokens,
    });
}

/// Pull the completion text out of an upstream body in `outbound` dialect,
/// for token pricing and prompt logging.
pub fn extract_completion_text(outbound: ApiFormat, body: &Value) -> String {
    match outbound {
        ApiFormat::OpenAi | ApiFormat::MistralAi => body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        ApiFormat::OpenAiText => body["choices"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        ApiFormat::Anthropic => body["completion"].as_str().unwrap_or_default().to_string(),
        ApiFormat::GooglePalm => body["candidates"][0]["output"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        // Images are not token-billed.
        ApiFormat::OpenAiImage => String::new(),
    }
}

/// Reshape the upstream body into the client's dialect when they differ
/// (turbo-instruct text → chat, anthropic/palm completions → chat).
pub fn transform_blocking_response(
    inbound: ApiFormat,
    outbound: ApiFormat,
    request_id: &str,
    body: Value,
) -> Value {
    match (inbound, outbound) {
        (inbound, outbound) if inbound == outbound => body,
        (ApiFormat::OpenAi, ApiFormat::OpenAiText) => {
            let model = body["model"].clone();
            let usage = body["usage"].clone();
            let choices: Vec<Value> = body["choices"]
                .as_array()
                .map(|choices| {
                    choices
                        .iter()
                        .enumerate()
                        .map(|(index, choice)| {
                            json!({
                                "index": index,
                                "message": {
                                    "role": "assistant",
                                    "content": choice["text"].as_str().unwrap_or_default(),
                                },
                                "finish_reason": choice["finish_reason"].clone(),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            json!({
                "id": format!("chatcmpl-{}", request_id),
                "object": "chat.completion",
                "created": Utc::now().timestamp(),
                "model": model,
                "choices": choices,
                "usage": usage,
            })
        }
        (ApiFormat::OpenAi, ApiFormat::Anthropic) => {
            let content = body["completion"].as_str().unwrap_or_default();
            json!({
                "id": format!("chatcmpl-{}", request_id),
                "object": "chat.completion",
                "created": Utc::now().timestamp(),
                "model": body["model"].clone(),
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": content},
                    "finish_reason": crate::transformer::map_anthropic_stop_reason(
                        body["stop_reason"].as_str()
                    ).unwrap_or("stop"),
                }],
            })
        }
        (ApiFormat::OpenAi, ApiFormat::GooglePalm) => {
            let content = body["candidates"][0]["output"].as_str().unwrap_or_default();
            json!({
                "id": format!("chatcmpl-{}", request_id),
                "object": "chat.completion",
                "created": Utc::now().timestamp(),
                "model": body["model"].clone(),
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": content},
                    "finish_reason": "stop",
                }],
            })
        }
        _ => body,
    }
}
