//! Request validation, dialect transcoding, and the model listing.
//!
//! Inbound bodies are untyped JSON: each dialect is validated field-by-field
//! so schema failures produce a 400 with an `issues` list, and unknown
//! fields are forwarded to upstream verbatim.

use chrono::Utc;
use serde_json::{json, Value};

use crate::api::AppState;
use crate::core::error::{ProxyError, Result};
use crate::core::families::{models_for_family, ModelFamily};

/// Validated essentials of a completion-style request.
#[derive(Debug)]
pub struct ValidatedRequest {
    pub model: String,
    pub is_streaming: bool,
    /// The prompt in its inbound shape (messages array or prompt value).
    pub prompt: Value,
}

fn validation_error(issues: Vec<String>) -> ProxyError {
    ProxyError::Validation {
        message: "request body failed validation".to_string(),
        issues,
    }
}

fn require_model(body: &Value, issues: &mut Vec<String>) -> String {
    match body["model"].as_str() {
        Some(model) if !model.is_empty() => model.to_string(),
        _ => {
            issues.push("model: required string".to_string());
            String::new()
        }
    }
}

fn is_streaming(body: &Value) -> bool {
    body["stream"].as_bool().unwrap_or(false)
}

/// OpenAI chat: `model` + non-empty `messages` with role/content pairs.
pub fn validate_chat_request(body: &Value) -> Result<ValidatedRequest> {
    let mut issues = Vec::new();
    let model = require_model(body, &mut issues);

    match body["messages"].as_array() {
        Some(messages) if !messages.is_empty() => {
            for (i, message) in messages.iter().enumerate() {
                if message["role"].as_str().is_none() {
                    issues.push(format!("messages[{}].role: required string", i));
                }
                if message.get("content").is_none() {
                    issues.push(format!("messages[{}].content: required", i));
                }
            }
        }
        Some(_) => issues.push("messages: must not be empty".to_string()),
        None => issues.push("messages: required array".to_string()),
    }

    if !issues.is_empty() {
        return Err(validation_error(issues));
    }
    Ok(ValidatedRequest {
        model,
        is_streaming: is_streaming(body),
        prompt: body["messages"].clone(),
    })
}

/// OpenAI text completion: `model` + string-or-array `prompt`.
pub fn validate_text_request(body: &Value) -> Result<ValidatedRequest> {
    let mut issues = Vec::new();
    let model = require_model(body, &mut issues);

    match &body["prompt"] {
        Value::String(_) | Value::Array(_) => {}
        Value::Null => issues.push("prompt: required".to_string()),
        _ => issues.push("prompt: must be a string or array".to_string()),
    }

    if !issues.is_empty() {
        return Err(validation_error(issues));
    }
    Ok(ValidatedRequest {
        model,
        is_streaming: is_streaming(body),
        prompt: body["prompt"].clone(),
    })
}

/// Anthropic completion: `model` + `prompt` string — or an OpenAI-format
/// `messages` body, which is accepted and transcoded by the handler.
pub fn validate_anthropic_request(body: &Value) -> Result<ValidatedRequest> {
    if body.get("messages").is_some() {
        return validate_chat_request(body);
    }
    let mut issues = Vec::new();
    let model = require_model(body, &mut issues);
    if body["prompt"].as_str().is_none() {
        issues.push("prompt: required string".to_string());
    }
    if !issues.is_empty() {
        return Err(validation_error(issues));
    }
    Ok(ValidatedRequest {
        model,
        is_streaming: is_streaming(body),
        prompt: body["prompt"].clone(),
    })
}

/// Embeddings: `model` + `input`.
pub fn validate_embeddings_request(body: &Value) -> Result<ValidatedRequest> {
    let mut issues = Vec::new();
    let model = require_model(body, &mut issues);
    if body.get("input").is_none() {
        issues.push("input: required".to_string());
    }
    if !issues.is_empty() {
        return Err(validation_error(issues));
    }
    Ok(ValidatedRequest {
        model,
        is_streaming: false,
        prompt: body["input"].clone(),
    })
}

/// Image generations: `prompt` string; `model` defaults to dall-e-2.
pub fn validate_image_request(body: &Value) -> Result<ValidatedRequest> {
    let mut issues = Vec::new();
    if body["prompt"].as_str().is_none() {
        issues.push("prompt: required string".to_string());
    }
    if !issues.is_empty() {
        return Err(validation_error(issues));
    }
    let model = body["model"]
        .as_str()
        .unwrap_or("dall-e-2")
        .to_string();
    Ok(ValidatedRequest {
        model,
        is_streaming: false,
        prompt: body["prompt"].clone(),
    })
}

/// Flatten a chat message list into Anthropic's Human/Assistant prompt,
/// ending with the assistant turn the model completes.
pub fn messages_to_anthropic_prompt(messages: &[Value]) -> String {
    let mut prompt = String::new();
    for message in messages {
        let role = message["role"].as_str().unwrap_or("user");
        let content = content_as_text(&message["content"]);
        let speaker = match role {
            "assistant" => "Assistant",
            // System prompts ride along as Human turns.
            _ => "Human",
        };
        prompt.push_str(&format!("\n\n{}: {}", speaker, content));
    }
    prompt.push_str("\n\nAssistant:");
    prompt
}

/// Flatten chat messages into a plain text prompt for turbo-instruct.
pub fn messages_to_plain_prompt(messages: &[Value]) -> String {
    let mut prompt = String::new();
    for message in messages {
        let role = message["role"].as_str().unwrap_or("user");
        let content = content_as_text(&message["content"]);
        prompt.push_str(&format!("{}: {}\n", role, content));
    }
    prompt.push_str("assistant:");
    prompt
}

/// PaLM generateText payload from a chat message list. Absent tuning
/// parameters are omitted rather than sent as nulls.
pub fn messages_to_palm_payload(messages: &[Value], body: &Value) -> Value {
    let text = messages
        .iter()
        .map(|m| content_as_text(&m["content"]))
        .collect::<Vec<_>>()
        .join("\n");
    let mut payload = json!({"prompt": {"text": text}});
    if let Some(temperature) = body["temperature"].as_f64() {
        payload["temperature"] = json!(temperature);
    }
    if let Some(max_tokens) = body["max_tokens"].as_u64() {
        payload["maxOutputTokens"] = json!(max_tokens);
    }
    payload
}

fn content_as_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part["text"].as_str())
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

/// `/v1/models`: families any enabled key serves, filtered by the allowlist,
/// rendered as an OpenAI model list.
pub fn build_model_list(state: &AppState) -> Value {
    let mut families: Vec<ModelFamily> = state
        .key_pool
        .available_families()
        .into_iter()
        .filter(|family| state.config.allowed_model_families.contains(family))
        .collect();
    families.sort_by_key(|f| f.as_str());

    let created = Utc::now().timestamp();
    let data: Vec<Value> = families
        .iter()
        .flat_map(|family| {
            models_for_family(*family).iter().map(move |id| {
                json!({
                    "id": id,
                    "object": "model",
                    "created": created,
                    "owned_by": family.service().as_str(),
                })
            })
        })
        .collect();

    json!({"object": "list", "data": data})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_validation_collects_issues() {
        let err = validate_chat_request(&json!({"messages": []})).unwrap_err();
        match err {
            ProxyError::Validation { issues, .. } => {
                assert!(issues.iter().any(|i| i.starts_with("model")));
                assert!(issues.iter().any(|i| i.starts_with("messages")));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_chat_validation_accepts_well_formed() {
        let body = json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
        });
        let validated = validate_chat_request(&body).unwrap();
        assert_eq!(validated.model, "gpt-4");
        assert!(validated.is_streaming);
    }

    #[test]
    fn test_anthropic_accepts_either_shape() {
        let native = json!({"model": "claude-v2", "prompt": "\n\nHuman: hi\n\nAssistant:"});
        assert!(validate_anthropic_request(&native).is_ok());

        let openai_shaped = json!({
            "model": "claude-v2",
            "messages": [{"role": "user", "content": "hi"}],
        });
        assert!(validate_anthropic_request(&openai_shaped).is_ok());

        let bad = json!({"model": "claude-v2"});
        assert!(validate_anthropic_request(&bad).is_err());
    }

    #[test]
    fn test_anthropic_prompt_transcode() {
        let messages = vec![
            json!({"role": "system", "content": "be brief"}),
            json!({"role": "user", "content": "hello"}),
            json!({"role": "assistant", "content": "hi"}),
            json!({"role": "user", "content": "bye"}),
        ];
        let prompt = messages_to_anthropic_prompt(&messages);
        assert!(prompt.starts_with("\n\nHuman: be brief"));
        assert!(prompt.contains("\n\nAssistant: hi"));
        assert!(prompt.ends_with("\n\nAssistant:"));
    }

    #[test]
    fn test_plain_prompt_transcode() {
        let messages = vec![json!({"role": "user", "content": "2+2?"})];
        let prompt = messages_to_plain_prompt(&messages);
        assert_eq!(prompt, "user: 2+2?\nassistant:");
    }

    #[test]
    fn test_image_validation() {
        assert!(validate_image_request(&json!({"prompt": "a fox"})).is_ok());
        assert!(validate_image_request(&json!({"n": 1})).is_err());
        let validated = validate_image_request(&json!({"prompt": "x"})).unwrap();
        assert_eq!(validated.model, "dall-e-2");
    }

    #[test]
    fn test_embeddings_validation() {
        let ok = json!({"model": "text-embedding-ada-002", "input": "hello"});
        assert!(validate_embeddings_request(&ok).is_ok());
        assert!(validate_embeddings_request(&json!({"model": "x"})).is_err());
    }
}
