//! Streaming response pipeline.
//!
//! The handler returns an SSE response immediately; a spawned task drives
//! the queue wait (with keep-alive pings), the upstream stream, the dialect
//! transformer, and the aggregator, writing frames into the response body
//! channel. Whatever happens upstream, the client's stream terminates with
//! `data: [DONE]` — mid-stream failures become a fake error event first.

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::api::blocking::record_usage;
use crate::api::mutators::ProxyReqManager;
use crate::api::upstream::{attempt_upstream, AttemptOutcome, UpstreamResponse};
use crate::api::{AppState, RequestContext};
use crate::core::error::{ProxyError, Result};
use crate::core::metrics::PROXY_REQUESTS;
use crate::core::token_counter::{count_tokens, TokenInput};
use crate::services::key_pool::KeySnapshot;
use crate::services::queue::{HEARTBEAT_AFTER, HEARTBEAT_INTERVAL, MAX_RETRIES};
use crate::transformer::{
    build_fake_error_frames, format_sse_data, format_sse_done, format_sse_event, format_sse_ping,
    EventTransformer, SseMessage, SseParser, StreamAggregator,
};

/// Writes SSE frames into the response body channel. The HTTP headers go on
/// the wire exactly once, when the first frame (possibly a queue heartbeat)
/// flushes; nothing here ever re-sends them.
struct SseWriter {
    tx: mpsc::Sender<std::result::Result<Bytes, std::io::Error>>,
    done_sent: bool,
}

impl SseWriter {
    fn new(tx: mpsc::Sender<std::result::Result<Bytes, std::io::Error>>) -> Self {
        Self {
            tx,
            done_sent: false,
        }
    }

    async fn send_raw(&mut self, frames: String) -> Result<()> {
        self.tx
            .send(Ok(Bytes::from(frames)))
            .await
            .map_err(|_| ProxyError::Internal("client disconnected".to_string()))
    }

    async fn ping(&mut self) -> Result<()> {
        self.send_raw(format_sse_ping()).await
    }

    async fn event(&mut self, payload: &str) -> Result<()> {
        self.send_raw(format_sse_data(payload)).await
    }

    /// Idempotent; flushing the terminator is mandatory on every stream end.
    async fn done(&mut self) -> Result<()> {
        if self.done_sent {
            return Ok(());
        }
        self.done_sent = true;
        self.send_raw(format_sse_done()).await
    }
}

/// Build the SSE response and spawn the task that fills it.
pub fn stream_response(state: Arc<AppState>, ctx: RequestContext) -> Response {
    let (tx, rx) = mpsc::channel::<std::result::Result<Bytes, std::io::Error>>(32);
    tokio::spawn(run_stream(state, ctx, tx));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .expect("static response build")
}

async fn run_stream(
    state: Arc<AppState>,
    ctx: RequestContext,
    tx: mpsc::Sender<std::result::Result<Bytes, std::io::Error>>,
) {
    let mut writer = SseWriter::new(tx);

    match run_stream_inner(&state, &ctx, &mut writer).await {
        Ok(()) => {
            ctx.cancel.mark_completed();
            PROXY_REQUESTS
                .with_label_values(&[ctx.service.as_str(), ctx.family.as_str(), "ok"])
                .inc();
        }
        Err(err) => {
            let err = err.classify();
            PROXY_REQUESTS
                .with_label_values(&[ctx.service.as_str(), ctx.family.as_str(), err.error_type()])
                .inc();
            // Release any queue entry still pointing at this request.
            ctx.cancel.cancel();
            if !writer.done_sent {
                let frames = build_fake_error_frames(ctx.inbound, err.error_type(), &err.to_string());
                let _ = writer.send_raw(frames).await;
                writer.done_sent = true;
            }
        }
    }
}

async fn run_stream_inner(
    state: &Arc<AppState>,
    ctx: &RequestContext,
    writer: &mut SseWriter,
) -> Result<()> {
    let mut manager = ProxyReqManager::new(ctx.upstream_url.clone(), ctx.outbound_body.clone());
    let (key, upstream) = dispatch_streaming(state, ctx, &mut manager, writer).await?;

    let mut transformer = EventTransformer::new(
        ctx.upstream_dialect(),
        ctx.egress_dialect(),
        ctx.request_id.clone(),
        ctx.model.clone(),
    );
    let mut aggregator = StreamAggregator::new(
        ctx.upstream_dialect(),
        ctx.inbound,
        ctx.request_id.clone(),
        ctx.model.clone(),
    );

    match upstream {
        UpstreamResponse::Http(response) => {
            let mut parser = SseParser::new();
            let mut bytes = response.bytes_stream();
            'read: loop {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        // Client gone: drop the upstream connection and stop.
                        return Err(ProxyError::Internal("client disconnected".to_string()));
                    }
                    chunk = bytes.next() => match chunk {
                        Some(Ok(chunk)) => {
                            for message in parser.parse(&chunk) {
                                if forward(&message, &mut transformer, &mut aggregator, writer).await? {
                                    break 'read;
                                }
                            }
                        }
                        Some(Err(e)) => return Err(ProxyError::Request(e)),
                        None => {
                            if let Some(message) = parser.finish() {
                                forward(&message, &mut transformer, &mut aggregator, writer).await?;
                            }
                            break 'read;
                        }
                    }
                }
            }
        }
        UpstreamResponse::Events(mut rx) => {
            while let Some(message) = rx.recv().await {
                if forward(&message, &mut transformer, &mut aggregator, writer).await? {
                    break;
                }
            }
        }
        // Non-streaming upstream (PaLM): surface the whole body as a single
        // event through the dialect shim.
        UpstreamResponse::Json { body, .. } => {
            let message = SseMessage {
                event: None,
                data: Some(body.to_string()),
            };
            forward(&message, &mut transformer, &mut aggregator, writer).await?;
        }
    }

    writer.done().await?;
    finish_stream(state, ctx, &key, &aggregator);
    Ok(())
}

/// Transform and forward one upstream event; returns true at end-of-stream.
async fn forward(
    message: &SseMessage,
    transformer: &mut EventTransformer,
    aggregator: &mut StreamAggregator,
    writer: &mut SseWriter,
) -> Result<bool> {
    aggregator.ingest(message);
    if message.is_done() {
        writer.done().await?;
        return Ok(true);
    }
    let result = transformer.transform(message)?;
    if let Some(event) = result.event {
        if event == "[DONE]" {
            writer.done().await?;
            return Ok(true);
        }
        // Identity transforms forward the upstream event name on the frame.
        match &message.event {
            Some(name) if message.data.as_deref() == Some(event.as_str()) => {
                writer.send_raw(format_sse_event(name, &event)).await?;
            }
            _ => writer.event(&event).await?,
        }
    }
    Ok(false)
}

/// Synthesize the final response and run the blocking accounting stages on
/// it, as if the request had never streamed.
fn finish_stream(
    state: &Arc<AppState>,
    ctx: &RequestContext,
    key: &KeySnapshot,
    aggregator: &StreamAggregator,
) {
    let completion_text = aggregator.completion_text();
    let completion_tokens =
        count_tokens(ctx.service, &ctx.model, &TokenInput::Text(&completion_text)) as u64;
    let final_response = aggregator.finalize(ctx.prompt_tokens, completion_tokens);
    record_usage(state, ctx, &key.hash, completion_tokens, &completion_text);
    tracing::debug!(
        request = %ctx.request_id,
        prompt_tokens = ctx.prompt_tokens,
        completion_tokens,
        finish = %final_response["choices"][0]["finish_reason"].as_str().unwrap_or_default(),
        "stream aggregated"
    );
}

/// Streaming-path dispatch: like the blocking loop, but sends keep-alive
/// comments while queued so clients and intermediaries do not time out.
async fn dispatch_streaming(
    state: &Arc<AppState>,
    ctx: &RequestContext,
    manager: &mut ProxyReqManager,
    writer: &mut SseWriter,
) -> Result<(KeySnapshot, UpstreamResponse)> {
    for _attempt in 0..=MAX_RETRIES {
        let mut rx = state
            .queue
            .enqueue(ctx.shard(), ctx.rank(), true, ctx.cancel.clone())?;

        let mut next_ping = tokio::time::Instant::now() + HEARTBEAT_AFTER;
        let key = loop {
            tokio::select! {
                result = &mut rx => {
                    break result.map_err(|_| ProxyError::ShuttingDown)?;
                }
                _ = tokio::time::sleep_until(next_ping) => {
                    writer.ping().await?;
                    next_ping += HEARTBEAT_INTERVAL;
                }
                _ = ctx.cancel.cancelled() => {
                    return Err(ProxyError::Internal("client disconnected".to_string()));
                }
            }
        };

        match attempt_upstream(state, ctx, manager, &key).await? {
            AttemptOutcome::Success(response) => return Ok((key, response)),
            AttemptOutcome::RateLimited => continue,
        }
    }
    Err(ProxyError::UpstreamRateLimited)
}
