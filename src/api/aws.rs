//! AWS Bedrock transport for `aws-claude` keys.
//!
//! Bedrock requests are SigV4-signed, so they go through the AWS SDK rather
//! than the shared reqwest client. The finalized mutator body is submitted
//! as the InvokeModel payload; streaming responses are decoded by the SDK
//! and re-surfaced as SSE-shaped messages so the rest of the pipeline treats
//! Bedrock like any other Anthropic stream.

use aws_config::BehaviorVersion;
use aws_sdk_bedrockruntime::config::{Credentials, Region};
use aws_sdk_bedrockruntime::primitives::Blob;
use aws_sdk_bedrockruntime::types::ResponseStream;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::api::mutators::ProxyReqManager;
use crate::api::upstream::{AttemptOutcome, UpstreamResponse};
use crate::api::{AppState, RequestContext};
use crate::core::error::{ProxyError, Result};
use crate::core::metrics::PROXY_RETRIES;
use crate::services::key_pool::{KeyExt, KeySnapshot};
use crate::transformer::SseMessage;

async fn bedrock_client(key: &KeySnapshot) -> Result<aws_sdk_bedrockruntime::Client> {
    let KeyExt::Aws {
        access_key_id,
        secret_access_key,
        region,
    } = &key.ext
    else {
        return Err(ProxyError::Internal(
            "bedrock dispatch with a non-AWS key".to_string(),
        ));
    };

    let credentials = Credentials::new(
        access_key_id.clone(),
        secret_access_key.clone(),
        None,
        None,
        "llm-relay",
    );
    let config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.clone()))
        .credentials_provider(credentials)
        .load()
        .await;
    Ok(aws_sdk_bedrockruntime::Client::new(&config))
}

pub async fn attempt_bedrock(
    state: &AppState,
    ctx: &RequestContext,
    manager: &mut ProxyReqManager,
    key: &KeySnapshot,
) -> Result<AttemptOutcome> {
    let client = bedrock_client(key).await?;
    let payload = manager
        .raw_body()
        .cloned()
        .ok_or_else(|| ProxyError::Internal("finalize_body did not run".to_string()))?;
    let blob = Blob::new(payload.to_vec());

    if ctx.is_streaming {
        let output = client
            .invoke_model_with_response_stream()
            .model_id(&ctx.model)
            .content_type("application/json")
            .accept("application/json")
            .body(blob)
            .send()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_throttling_exception() {
                    state.key_pool.mark_rate_limited(&key.hash);
                    manager.revert();
                    PROXY_RETRIES.inc();
                    return Ok(AttemptOutcome::RateLimited);
                }
                if service_err.is_access_denied_exception() {
                    state
                        .key_pool
                        .disable(&key.hash, "bedrock rejected credentials");
                    return Err(upstream_error(403, &service_err.to_string()));
                }
                return Err(upstream_error(502, &service_err.to_string()));
            }
        };

        let mut event_stream = output.body;
        let (tx, rx) = mpsc::channel::<SseMessage>(32);
        tokio::spawn(async move {
            loop {
                match event_stream.recv().await {
                    Ok(Some(ResponseStream::Chunk(part))) => {
                        let Some(bytes) = part.bytes() else { continue };
                        let data = String::from_utf8_lossy(bytes.as_ref()).to_string();
                        let message = SseMessage {
                            event: Some("completion".to_string()),
                            data: Some(data),
                        };
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(_)) => continue,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "bedrock stream decode error");
                        break;
                    }
                }
            }
        });
        return Ok(AttemptOutcome::Success(UpstreamResponse::Events(rx)));
    }

    let output = client
        .invoke_model()
        .model_id(&ctx.model)
        .content_type("application/json")
        .accept("application/json")
        .body(blob)
        .send()
        .await;

    match output {
        Ok(output) => {
            let body: Value = serde_json::from_slice(output.body().as_ref())
                .unwrap_or_else(|_| json!({}));
            Ok(AttemptOutcome::Success(UpstreamResponse::Json {
                status: 200,
                body,
            }))
        }
        Err(sdk_err) => {
            let service_err = sdk_err.into_service_error();
            if service_err.is_throttling_exception() {
                state.key_pool.mark_rate_limited(&key.hash);
                manager.revert();
                PROXY_RETRIES.inc();
                return Ok(AttemptOutcome::RateLimited);
            }
            if service_err.is_access_denied_exception() {
                state
                    .key_pool
                    .disable(&key.hash, "bedrock rejected credentials");
                return Err(upstream_error(403, &service_err.to_string()));
            }
            if service_err.is_model_timeout_exception() {
                return Err(ProxyError::Timeout);
            }
            Err(upstream_error(502, &service_err.to_string()))
        }
    }
}

fn upstream_error(status: u16, message: &str) -> ProxyError {
    ProxyError::Upstream {
        status,
        body: json!({"error": {"message": message, "type": "upstream_error"}}),
    }
}
