//! Token counting for quota accounting.
//!
//! Counting happens twice per request: the preprocessor prices the prompt
//! before admission, and the response pipeline prices the completion. OpenAI
//! families use the model's own BPE; every other service falls back to the
//! `cl100k_base` encoding, which tracks closely enough for quota purposes.
//! Encoders are cached since construction is expensive.

use dashmap::DashMap;
use lazy_static::lazy_static;
use serde_json::Value;
use std::sync::Arc;

use super::families::Service;

lazy_static! {
    static ref BPE_CACHE: DashMap<String, Arc<tiktoken_rs::CoreBPE>> = DashMap::new();
}

// Chat message framing overhead, per OpenAI's counting guide.
const TOKENS_PER_MESSAGE: usize = 4;
const REPLY_PRIMING_TOKENS: usize = 3;

/// Input to price: raw text or a chat message list.
pub enum TokenInput<'a> {
    Text(&'a str),
    Messages(&'a [Value]),
}

fn get_cached_bpe(cache_key: &str, model: &str) -> Option<Arc<tiktoken_rs::CoreBPE>> {
    if let Some(bpe) = BPE_CACHE.get(cache_key) {
        return Some(Arc::clone(&bpe));
    }

    let bpe = if model.contains("gpt-4o") {
        tiktoken_rs::o200k_base()
    } else if cache_key == "cl100k" {
        tiktoken_rs::cl100k_base()
    } else {
        tiktoken_rs::get_bpe_from_model(model).or_else(|_| tiktoken_rs::cl100k_base())
    }
    .ok()?;

    let bpe = Arc::new(bpe);
    BPE_CACHE.insert(cache_key.to_string(), Arc::clone(&bpe));
    Some(bpe)
}

fn bpe_for(service: Service, model: &str) -> Option<Arc<tiktoken_rs::CoreBPE>> {
    match service {
        Service::Openai => get_cached_bpe(model, model),
        // Non-OpenAI tokenizers are not bundled; cl100k is the accepted
        // approximation for accounting.
        _ => get_cached_bpe("cl100k", model),
    }
}

fn count_text(bpe: &tiktoken_rs::CoreBPE, text: &str) -> usize {
    bpe.encode_with_special_tokens(text).len()
}

fn message_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        // Multimodal content arrays: count the text parts only.
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

/// Count the tokens a prompt or completion will be billed as.
pub fn count_tokens(service: Service, model: &str, input: &TokenInput<'_>) -> usize {
    let Some(bpe) = bpe_for(service, model) else {
        // Encoder construction failed; charge a rough character estimate
        // rather than nothing.
        return match input {
            TokenInput::Text(text) => text.len() / 4,
            TokenInput::Messages(messages) => {
                messages
                    .iter()
                    .map(|m| message_text(&m["content"]).len() / 4)
                    .sum::<usize>()
            }
        };
    };

    match input {
        TokenInput::Text(text) => count_text(&bpe, text),
        TokenInput::Messages(messages) => {
            let mut total = REPLY_PRIMING_TOKENS;
            for message in messages.iter() {
                total += TOKENS_PER_MESSAGE;
                if let Some(role) = message.get("role").and_then(|r| r.as_str()) {
                    total += count_text(&bpe, role);
                }
                if let Some(content) = message.get("content") {
                    total += count_text(&bpe, &message_text(content));
                }
                if let Some(name) = message.get("name").and_then(|n| n.as_str()) {
                    total += count_text(&bpe, name);
                }
            }
            total
        }
    }
}
