//! Cross-dialect transformation of individual stream events.
//!
//! The transformer is parameterized by `(from, to)` and is the identity when
//! they match. Anthropic v1 events carry the entire completion-so-far, so the
//! v1 path keeps `last_position` (character offset already emitted) and emits
//! only the suffix; every other supported pair is already delta-shaped and
//! only needs re-enveloping.

use chrono::Utc;
use serde_json::{json, Value};

use super::sse::SseMessage;
use crate::core::error::{ProxyError, Result};

/// Wire dialect of a stream of SSE events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDialect {
    /// Anthropic `/v1/complete` with `anthropic-version` ≤ 2023-01-01:
    /// each event carries the full completion so far.
    AnthropicV1,
    /// Anthropic `/v1/complete` 2023-06-01: events carry deltas.
    AnthropicV2,
    /// Anthropic messages API events.
    AnthropicChat,
    OpenAiChat,
    OpenAiText,
    GoogleAi,
    /// Forward events untouched.
    Passthrough,
}

/// Outcome of transforming one upstream event. `position` is the updated
/// character offset already emitted; `event` is the serialized outgoing SSE
/// payload, absent for events with no egress representation (pings,
/// block boundaries).
#[derive(Debug, Clone)]
pub struct TransformResult {
    pub position: usize,
    pub event: Option<String>,
}

/// Map an Anthropic stop reason onto the OpenAI vocabulary.
pub fn map_anthropic_stop_reason(reason: Option<&str>) -> Option<&'static str> {
    match reason {
        Some("stop_sequence") | Some("end_turn") => Some("stop"),
        Some("max_tokens") => Some("length"),
        Some(_) => Some("stop"),
        None => None,
    }
}

pub struct EventTransformer {
    from: StreamDialect,
    to: StreamDialect,
    last_position: usize,
    request_id: String,
    model: String,
    created: i64,
}

impl EventTransformer {
    pub fn new(
        from: StreamDialect,
        to: StreamDialect,
        request_id: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            from,
            to,
            last_position: 0,
            request_id: request_id.into(),
            model: model.into(),
            created: Utc::now().timestamp(),
        }
    }

    pub fn last_position(&self) -> usize {
        self.last_position
    }

    /// Transform one upstream event into the egress dialect.
    pub fn transform(&mut self, message: &SseMessage) -> Result<TransformResult> {
        if message.is_done() {
            return Ok(self.result(Some("[DONE]".to_string())));
        }

        // Upstream error events abort the transform; the stream writer turns
        // the error into a fake event in the inbound dialect.
        if message.event.as_deref() == Some("error") {
            let body = message
                .data
                .as_deref()
                .and_then(|d| serde_json::from_str(d).ok())
                .unwrap_or_else(|| json!({"error": {"message": "upstream stream error"}}));
            return Err(ProxyError::Upstream { status: 502, body });
        }

        if self.from == self.to || self.from == StreamDialect::Passthrough {
            return Ok(self.result(message.data.clone()));
        }

        match (self.from, self.to) {
            (StreamDialect::AnthropicV1, StreamDialect::OpenAiChat) => {
                self.anthropic_v1_to_chat(message)
            }
            (StreamDialect::AnthropicV2, StreamDialect::OpenAiChat) => {
                self.anthropic_v2_to_chat(message)
            }
            (StreamDialect::AnthropicChat, StreamDialect::OpenAiChat) => {
                self.anthropic_messages_to_chat(message)
            }
            (StreamDialect::OpenAiText, StreamDialect::OpenAiChat) => self.text_to_chat(message),
            (StreamDialect::GoogleAi, StreamDialect::OpenAiChat) => self.google_to_chat(message),
            (from, to) => Err(ProxyError::Internal(format!(
                "unsupported stream transform {:?} -> {:?}",
                from, to
            ))),
        }
    }

    fn result(&self, event: Option<String>) -> TransformResult {
        TransformResult {
            position: self.last_position,
            event,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> String {
        json!({
            "id": format!("chatcmpl-{}", self.request_id),
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model.clone(),
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        })
        .to_string()
    }

    // v1 events carry the whole completion; emit only the unseen suffix.
    fn anthropic_v1_to_chat(&mut self, message: &SseMessage) -> Result<TransformResult> {
        if message.event.as_deref() == Some("ping") {
            return Ok(self.result(None));
        }
        let data = match message.data.as_deref() {
            Some(data) => data,
            None => return Ok(self.result(None)),
        };
        let event: Value = serde_json::from_str(data)?;
        let completion = event["completion"].as_str().unwrap_or_default();
        let total_chars = completion.chars().count();
        let suffix: String = completion.chars().skip(self.last_position).collect();
        self.last_position = total_chars.max(self.last_position);

        let finish_reason = map_anthropic_stop_reason(event["stop_reason"].as_str());
        if suffix.is_empty() && finish_reason.is_none() {
            return Ok(self.result(None));
        }
        let delta = if suffix.is_empty() {
            json!({})
        } else {
            json!({"content": suffix})
        };
        let chunk = self.chunk(delta, finish_reason);
        Ok(self.result(Some(chunk)))
    }

    // v2 events are already deltas; wrap verbatim.
    fn anthropic_v2_to_chat(&mut self, message: &SseMessage) -> Result<TransformResult> {
        if message.event.as_deref() == Some("ping") {
            return Ok(self.result(None));
        }
        let data = match message.data.as_deref() {
            Some(data) => data,
            None => return Ok(self.result(None)),
        };
        let event: Value = serde_json::from_str(data)?;
        let delta_text = event["completion"].as_str().unwrap_or_default();
        self.last_position += delta_text.chars().count();

        let finish_reason = map_anthropic_stop_reason(event["stop_reason"].as_str());
        if delta_text.is_empty() && finish_reason.is_none() {
            return Ok(self.result(None));
        }
        let delta = if delta_text.is_empty() {
            json!({})
        } else {
            json!({"content": delta_text})
        };
        let chunk = self.chunk(delta, finish_reason);
        Ok(self.result(Some(chunk)))
    }

    fn anthropic_messages_to_chat(&mut self, message: &SseMessage) -> Result<TransformResult> {
        let data = match message.data.as_deref() {
            Some(data) => data,
            None => return Ok(self.result(None)),
        };
        let event: Value = serde_json::from_str(data)?;
        let event_type = event["type"]
            .as_str()
            .or(message.event.as_deref())
            .unwrap_or_default();

        match event_type {
            "message_start" => {
                let chunk = self.chunk(json!({"role": "assistant", "content": ""}), None);
                Ok(self.result(Some(chunk)))
            }
            "content_block_delta" => {
                let text = event["delta"]["text"].as_str().unwrap_or_default();
                if text.is_empty() {
                    return Ok(self.result(None));
                }
                self.last_position += text.chars().count();
                let chunk = self.chunk(json!({"content": text}), None);
                Ok(self.result(Some(chunk)))
            }
            "message_delta" => {
                let finish_reason =
                    map_anthropic_stop_reason(event["delta"]["stop_reason"].as_str());
                let chunk = self.chunk(json!({}), finish_reason.or(Some("stop")));
                Ok(self.result(Some(chunk)))
            }
            // Block boundaries, pings, and message_stop have no chat
            // representation; the writer terminates with [DONE].
            _ => Ok(self.result(None)),
        }
    }

    fn text_to_chat(&mut self, message: &SseMessage) -> Result<TransformResult> {
        let data = match message.data.as_deref() {
            Some(data) => data,
            None => return Ok(self.result(None)),
        };
        let event: Value = serde_json::from_str(data)?;
        let choice = &event["choices"][0];
        let text = choice["text"].as_str().unwrap_or_default();
        let finish_reason = choice["finish_reason"].as_str();
        self.last_position += text.chars().count();

        if text.is_empty() && finish_reason.is_none() {
            return Ok(self.result(None));
        }
        let delta = if text.is_empty() {
            json!({})
        } else {
            json!({"content": text})
        };
        let chunk = self.chunk(delta, finish_reason);
        Ok(self.result(Some(chunk)))
    }

    fn google_to_chat(&mut self, message: &SseMessage) -> Result<TransformResult> {
        let data = match message.data.as_deref() {
            Some(data) => data,
            None => return Ok(self.result(None)),
        };
        let event: Value = serde_json::from_str(data)?;
        let candidate = &event["candidates"][0];
        let text = candidate["output"]
            .as_str()
            .or_else(|| candidate["content"].as_str())
            .unwrap_or_default();
        if text.is_empty() {
            return Ok(self.result(None));
        }
        self.last_position += text.chars().count();
        let chunk = self.chunk(json!({"content": text}), None);
        Ok(self.result(Some(chunk)))
    }
}
