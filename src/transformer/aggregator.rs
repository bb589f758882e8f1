//! Stream aggregation into a final non-streaming response.
//!
//! While events are forwarded to the client, the aggregator accumulates them
//! in canonical OpenAI-chat form regardless of the egress dialect — one
//! stateful delta merge instead of one per dialect. On end-of-stream it
//! replays the accumulated events into the final response object in the
//! egress dialect, which then flows through the blocking pipeline stages
//! (quota accounting, prompt logging) as if the request had never streamed.

use chrono::Utc;
use serde_json::{json, Value};

use super::events::{EventTransformer, StreamDialect};
use super::sse::SseMessage;

/// Inbound/outbound REST dialect of a proxied endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFormat {
    OpenAi,
    OpenAiText,
    OpenAiImage,
    Anthropic,
    GooglePalm,
    MistralAi,
}

impl ApiFormat {
    /// The stream dialect a response body in this format carries.
    pub fn stream_dialect(&self) -> StreamDialect {
        match self {
            ApiFormat::OpenAi | ApiFormat::OpenAiImage => StreamDialect::OpenAiChat,
            ApiFormat::OpenAiText => StreamDialect::OpenAiText,
            ApiFormat::Anthropic => StreamDialect::AnthropicV2,
            ApiFormat::GooglePalm => StreamDialect::GoogleAi,
            ApiFormat::MistralAi => StreamDialect::OpenAiChat,
        }
    }
}

pub struct StreamAggregator {
    egress: ApiFormat,
    request_id: String,
    model: String,
    canonical: EventTransformer,
    chunks: Vec<Value>,
    /// Last parseable non-`[DONE]` ingress event, kept for the Anthropic
    /// egress path which reuses it verbatim.
    last_ingress_event: Option<Value>,
}

impl StreamAggregator {
    pub fn new(
        ingress: StreamDialect,
        egress: ApiFormat,
        request_id: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let request_id = request_id.into();
        let model = model.into();
        Self {
            egress,
            canonical: EventTransformer::new(
                ingress,
                StreamDialect::OpenAiChat,
                request_id.clone(),
                model.clone(),
            ),
            request_id,
            model,
            chunks: Vec::new(),
            last_ingress_event: None,
        }
    }

    /// Record one upstream event. Unparseable or representation-free events
    /// are skipped; aggregation must never fail the live stream.
    pub fn ingest(&mut self, message: &SseMessage) {
        if message.is_done() {
            return;
        }
        if let Some(data) = message.data.as_deref() {
            if let Ok(value) = serde_json::from_str::<Value>(data) {
                self.last_ingress_event = Some(value);
            }
        }
        if let Ok(result) = self.canonical.transform(message) {
            if let Some(event) = result.event {
                if event != "[DONE]" {
                    if let Ok(value) = serde_json::from_str::<Value>(&event) {
                        self.chunks.push(value);
                    }
                }
            }
        }
    }

    /// Concatenated delta content across all accumulated chunks.
    pub fn completion_text(&self) -> String {
        self.chunks
            .iter()
            .filter_map(|chunk| chunk["choices"][0]["delta"]["content"].as_str())
            .collect()
    }

    /// `finish_reason` carried by the last chunk that set one.
    pub fn finish_reason(&self) -> Option<String> {
        self.chunks
            .iter()
            .rev()
            .find_map(|chunk| chunk["choices"][0]["finish_reason"].as_str())
            .map(str::to_string)
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Synthesize the final response object in the egress dialect. Pure in
    /// the accumulated events: replaying the same list yields the same
    /// object.
    pub fn finalize(&self, prompt_tokens: u64, completion_tokens: u64) -> Value {
        let content = self.completion_text();
        let finish_reason = self.finish_reason().unwrap_or_else(|| "stop".to_string());
        let usage = json!({
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
        });

        match self.egress {
            ApiFormat::OpenAi | ApiFormat::OpenAiImage | ApiFormat::MistralAi => json!({
                "id": format!("chatcmpl-{}", self.request_id),
                "object": "chat.completion",
                "created": Utc::now().timestamp(),
                "model": self.model.clone(),
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": content},
                    "finish_reason": finish_reason,
                }],
                "usage": usage,
            }),
            ApiFormat::OpenAiText => json!({
                "id": format!("cmpl-{}", self.request_id),
                "object": "text_completion",
                "created": Utc::now().timestamp(),
                "model": self.model.clone(),
                "choices": [{
                    "index": 0,
                    "text": content,
                    "finish_reason": finish_reason,
                }],
                "usage": usage,
            }),
            ApiFormat::Anthropic => {
                // The final non-[DONE] event already contains the complete
                // completion; use it verbatim, overwriting log_id with the
                // request id.
                let mut event = self
                    .last_ingress_event
                    .clone()
                    .unwrap_or_else(|| json!({"completion": content, "stop_reason": "stop_sequence"}));
                event["log_id"] = json!(self.request_id.clone());
                event["model"] = json!(self.model.clone());
                event
            }
            ApiFormat::GooglePalm => json!({
                "candidates": [{"output": content}],
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_message(value: Value) -> SseMessage {
        SseMessage {
            event: None,
            data: Some(value.to_string()),
        }
    }

    fn openai_chunk(content: Option<&str>, finish: Option<&str>) -> Value {
        let delta = match content {
            Some(text) => json!({"content": text}),
            None => json!({}),
        };
        json!({
            "id": "chatcmpl-up",
            "object": "chat.completion.chunk",
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish}],
        })
    }

    #[test]
    fn test_chat_reduce() {
        let mut agg = StreamAggregator::new(
            StreamDialect::OpenAiChat,
            ApiFormat::OpenAi,
            "r1",
            "gpt-4",
        );
        agg.ingest(&data_message(openai_chunk(Some("Hello"), None)));
        agg.ingest(&data_message(openai_chunk(Some(" world"), None)));
        agg.ingest(&data_message(openai_chunk(None, Some("stop"))));
        agg.ingest(&SseMessage {
            event: None,
            data: Some("[DONE]".to_string()),
        });

        let final_response = agg.finalize(10, 2);
        assert_eq!(
            final_response["choices"][0]["message"]["content"],
            "Hello world"
        );
        assert_eq!(final_response["choices"][0]["finish_reason"], "stop");
        assert_eq!(final_response["usage"]["total_tokens"], 12);
        assert_eq!(final_response["object"], "chat.completion");
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let mut agg = StreamAggregator::new(
            StreamDialect::OpenAiChat,
            ApiFormat::OpenAi,
            "r1",
            "gpt-4",
        );
        agg.ingest(&data_message(openai_chunk(Some("same"), Some("stop"))));

        let first = agg.finalize(5, 1);
        let second = agg.finalize(5, 1);
        // `created` is stamped at synthesis time; compare everything else.
        assert_eq!(first["choices"], second["choices"]);
        assert_eq!(first["usage"], second["usage"]);
        assert_eq!(first["id"], second["id"]);
    }

    #[test]
    fn test_text_egress_concatenates() {
        let mut agg = StreamAggregator::new(
            StreamDialect::OpenAiText,
            ApiFormat::OpenAiText,
            "r1",
            "gpt-3.5-turbo-instruct",
        );
        agg.ingest(&data_message(
            json!({"choices": [{"text": "One", "finish_reason": null}]}),
        ));
        agg.ingest(&data_message(
            json!({"choices": [{"text": " two", "finish_reason": "length"}]}),
        ));

        let final_response = agg.finalize(3, 2);
        assert_eq!(final_response["object"], "text_completion");
        assert_eq!(final_response["choices"][0]["text"], "One two");
        assert_eq!(final_response["choices"][0]["finish_reason"], "length");
    }

    #[test]
    fn test_anthropic_ingress_accumulated_as_chat() {
        let mut agg = StreamAggregator::new(
            StreamDialect::AnthropicV1,
            ApiFormat::OpenAi,
            "r1",
            "claude-v2",
        );
        agg.ingest(&data_message(json!({"completion": "He", "stop_reason": null})));
        agg.ingest(&data_message(json!({"completion": "Hello", "stop_reason": null})));
        agg.ingest(&data_message(
            json!({"completion": "Hello world", "stop_reason": "stop_sequence"}),
        ));

        assert_eq!(agg.completion_text(), "Hello world");
        let final_response = agg.finalize(4, 3);
        assert_eq!(
            final_response["choices"][0]["message"]["content"],
            "Hello world"
        );
    }

    #[test]
    fn test_anthropic_egress_uses_last_event_verbatim() {
        let mut agg = StreamAggregator::new(
            StreamDialect::AnthropicV1,
            ApiFormat::Anthropic,
            "req-42",
            "claude-v2",
        );
        agg.ingest(&data_message(json!({"completion": "Hi", "stop_reason": null})));
        agg.ingest(&data_message(
            json!({"completion": "Hi there", "stop_reason": "stop_sequence", "log_id": "upstream-id"}),
        ));
        agg.ingest(&SseMessage {
            event: None,
            data: Some("[DONE]".to_string()),
        });

        let final_response = agg.finalize(2, 2);
        assert_eq!(final_response["completion"], "Hi there");
        assert_eq!(final_response["stop_reason"], "stop_sequence");
        // The upstream log id is overwritten with the request id.
        assert_eq!(final_response["log_id"], "req-42");
    }

    #[test]
    fn test_anthropic_egress_survives_missing_final_event() {
        // Upstream that never sent a parseable event still yields a usable
        // final object synthesized from the accumulated text.
        let agg = StreamAggregator::new(
            StreamDialect::AnthropicV2,
            ApiFormat::Anthropic,
            "req-7",
            "claude-2.1",
        );
        let final_response = agg.finalize(0, 0);
        assert_eq!(final_response["completion"], "");
        assert_eq!(final_response["log_id"], "req-7");
    }

    #[test]
    fn test_unparseable_events_skipped() {
        let mut agg = StreamAggregator::new(
            StreamDialect::OpenAiChat,
            ApiFormat::OpenAi,
            "r1",
            "gpt-4",
        );
        agg.ingest(&SseMessage {
            event: None,
            data: Some("not json".to_string()),
        });
        assert!(agg.is_empty());
    }
}
