//! Upstream transport: one attempt per selected key, with 429-driven
//! re-admission handled by the callers' retry loops.
//!
//! The outbound request is built entirely from the reversible mutator state;
//! nothing from the inbound connection is forwarded as a stream. 429
//! responses mark the key rate-limited and revert the manager so the request
//! can be re-enqueued cleanly; 401/403 disable the key outright.

use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::api::mutators::{apply_mutators, MutatorContext, ProxyReqManager};
use crate::api::{AppState, RequestContext};
use crate::core::error::{ProxyError, Result};
use crate::core::families::Service;
use crate::core::metrics::PROXY_RETRIES;
use crate::services::key_pool::KeySnapshot;
use crate::services::queue::{wait_for_key, MAX_RETRIES};
use crate::transformer::SseMessage;

/// What an upstream call produced, across the three transports we speak.
pub enum UpstreamResponse {
    /// Plain HTTP response; may be a byte stream of SSE events.
    Http(reqwest::Response),
    /// Already-decoded JSON body (Bedrock blocking path).
    Json { status: u16, body: Value },
    /// Decoded event stream (Bedrock streaming path).
    Events(mpsc::Receiver<SseMessage>),
}

/// One attempt against upstream with an already-selected key.
pub enum AttemptOutcome {
    Success(UpstreamResponse),
    /// Upstream 429: the key is marked, the manager reverted; re-enqueue.
    RateLimited,
}

pub async fn attempt_upstream(
    state: &AppState,
    ctx: &RequestContext,
    manager: &mut ProxyReqManager,
    key: &KeySnapshot,
) -> Result<AttemptOutcome> {
    let mutator_ctx = MutatorContext {
        config: &state.config,
        user: ctx.user.as_ref(),
        user_store: &state.user_store,
        key,
        service: ctx.service,
        family: ctx.family,
        inbound: ctx.inbound,
        prompt_tokens: ctx.prompt_tokens,
        origin: ctx.origin.clone(),
        referer: ctx.referer.clone(),
    };
    apply_mutators(manager, &mutator_ctx)?;

    if ctx.service == Service::Aws {
        return crate::api::aws::attempt_bedrock(state, ctx, manager, key).await;
    }

    let raw_body = manager
        .raw_body()
        .cloned()
        .ok_or_else(|| ProxyError::Internal("finalize_body did not run".to_string()))?;

    let request = state
        .http_client
        .post(manager.url())
        .headers(manager.headers().clone())
        .body(raw_body);

    let send = tokio::time::timeout(
        std::time::Duration::from_secs(state.config.request_timeout_secs),
        request.send(),
    );
    let response = match send.await {
        // Timeouts classify as 504 and do not penalize the key.
        Err(_) => return Err(ProxyError::Timeout),
        Ok(Err(e)) if e.is_timeout() => return Err(ProxyError::Timeout),
        Ok(Err(e)) => return Err(ProxyError::Request(e)),
        Ok(Ok(response)) => response,
    };

    let status = response.status();
    if status.is_success() {
        // PaLM has no SSE surface; its single JSON body is decoded here and
        // pseudo-streamed by the writer when the client asked to stream.
        if ctx.service == Service::GooglePalm {
            let body: Value = response.json().await?;
            return Ok(AttemptOutcome::Success(UpstreamResponse::Json {
                status: status.as_u16(),
                body,
            }));
        }
        return Ok(AttemptOutcome::Success(UpstreamResponse::Http(response)));
    }

    let body = read_error_body(response).await;
    match status.as_u16() {
        429 => {
            state.key_pool.mark_rate_limited(&key.hash);
            manager.revert();
            PROXY_RETRIES.inc();
            tracing::info!(key = %key.hash, "upstream 429, requeueing");
            Ok(AttemptOutcome::RateLimited)
        }
        401 | 403 => {
            state
                .key_pool
                .disable(&key.hash, "upstream rejected credentials");
            Err(ProxyError::Upstream {
                status: status.as_u16(),
                body,
            })
        }
        status => Err(ProxyError::Upstream { status, body }),
    }
}

async fn read_error_body(response: reqwest::Response) -> Value {
    let text = response.text().await.unwrap_or_default();
    serde_json::from_str(&text)
        .unwrap_or_else(|_| json!({"error": {"message": text, "type": "upstream_error"}}))
}

/// Blocking-path dispatch: enqueue, wait, attempt; re-enqueue on 429 up to
/// the retry budget. Streaming runs the same loop in the stream task so it
/// can heartbeat while waiting.
pub async fn dispatch_blocking(
    state: &AppState,
    ctx: &RequestContext,
    manager: &mut ProxyReqManager,
) -> Result<(KeySnapshot, UpstreamResponse)> {
    for _attempt in 0..=MAX_RETRIES {
        let rx = state
            .queue
            .enqueue(ctx.shard(), ctx.rank(), false, ctx.cancel.clone())?;
        let key = wait_for_key(rx).await?;
        match attempt_upstream(state, ctx, manager, &key).await? {
            AttemptOutcome::Success(response) => return Ok((key, response)),
            AttemptOutcome::RateLimited => continue,
        }
    }
    Err(ProxyError::UpstreamRateLimited)
}
