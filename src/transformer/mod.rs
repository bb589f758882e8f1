//! SSE stream parsing, cross-dialect event transformation, and aggregation.
//!
//! The streaming path wires these together:
//!
//! ```text
//! upstream bytes
//!     ↓
//! [SseParser]          split on \n\n, hold trailing partial
//!     ↓ SseMessage
//! [EventTransformer]   (from, to) dialect pair, carries last_position
//!     ↓ serialized egress events           ↘
//! client                          [StreamAggregator]  canonical accumulation
//!                                          ↓ on end
//!                                 final response object → blocking pipeline
//! ```

pub mod aggregator;
pub mod events;
pub mod sse;

pub use aggregator::{ApiFormat, StreamAggregator};
pub use events::{map_anthropic_stop_reason, EventTransformer, StreamDialect, TransformResult};
pub use sse::{
    format_sse_data, format_sse_done, format_sse_event, format_sse_ping, SseMessage, SseParser,
};

use serde_json::json;

/// Render a mid-stream error as wire frames in the inbound dialect: one
/// `data:` event carrying the error inside a fenced code block, then the
/// mandatory `data: [DONE]` terminator. Every stream ends gracefully on the
/// wire no matter what happened upstream.
pub fn build_fake_error_frames(format: ApiFormat, error_type: &str, message: &str) -> String {
    let payload = json!({"type": error_type, "string": message}).to_string();
    let content = format!("\n\n```\n{}\n```\n", payload);

    let event = match format {
        ApiFormat::OpenAi | ApiFormat::OpenAiImage | ApiFormat::MistralAi => json!({
            "id": "chatcmpl-error",
            "object": "chat.completion.chunk",
            "choices": [{
                "index": 0,
                "delta": {"content": content},
                "finish_reason": "stop",
            }],
        }),
        ApiFormat::OpenAiText => json!({
            "id": "cmpl-error",
            "object": "text_completion",
            "choices": [{
                "index": 0,
                "text": content,
                "finish_reason": "stop",
            }],
        }),
        ApiFormat::Anthropic => json!({
            "completion": content,
            "stop_reason": "stop_sequence",
        }),
        ApiFormat::GooglePalm => json!({
            "candidates": [{"output": content}],
        }),
    };

    format!("{}{}", format_sse_data(&event.to_string()), format_sse_done())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_fake_error_frames_terminate_with_done() {
        let frames =
            build_fake_error_frames(ApiFormat::OpenAi, "proxy_internal_error", "it broke");
        assert!(frames.ends_with("data: [DONE]\n\n"));

        let first_payload = frames
            .strip_prefix("data: ")
            .unwrap()
            .split("\n\n")
            .next()
            .unwrap();
        let value: Value = serde_json::from_str(first_payload).unwrap();
        let content = value["choices"][0]["delta"]["content"].as_str().unwrap();
        assert!(content.contains("proxy_internal_error"));
        assert!(content.contains("it broke"));
        assert!(content.contains("```"));
    }

    #[test]
    fn test_fake_error_frames_anthropic_shape() {
        let frames =
            build_fake_error_frames(ApiFormat::Anthropic, "proxy_quota_exceeded", "no more");
        let first_payload = frames
            .strip_prefix("data: ")
            .unwrap()
            .split("\n\n")
            .next()
            .unwrap();
        let value: Value = serde_json::from_str(first_payload).unwrap();
        assert!(value["completion"].as_str().unwrap().contains("no more"));
    }
}
