//! Reversible outbound-request mutation pipeline.
//!
//! Every change a mutator makes to the outbound request goes through
//! [`ProxyReqManager`], which records the previous value. When a request is
//! returned to the queue after an upstream rate limit, `revert` restores the
//! request byte-for-byte so the next attempt is not doubly mutated.
//!
//! Mutators run in a fixed order; `finalize_body` must be last because it
//! serializes the body, sets `Content-Length`, and publishes the raw buffer
//! the transport sends.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use bytes::Bytes;
use serde_json::{json, Value};

use crate::core::config::AppConfig;
use crate::core::error::{ProxyError, Result, ORG_DISABLED_MESSAGE};
use crate::core::families::{ModelFamily, Service};
use crate::services::key_pool::{KeyExt, KeySnapshot};
use crate::services::user_store::{User, UserStore};
use crate::transformer::ApiFormat;

/// Everything a mutator may read. Mutators never reach for globals.
pub struct MutatorContext<'a> {
    pub config: &'a AppConfig,
    pub user: Option<&'a User>,
    pub user_store: &'a UserStore,
    pub key: &'a KeySnapshot,
    pub service: Service,
    pub family: ModelFamily,
    pub inbound: ApiFormat,
    pub prompt_tokens: u64,
    pub origin: Option<String>,
    pub referer: Option<String>,
}

enum Mutation {
    Header {
        name: HeaderName,
        prev: Option<HeaderValue>,
    },
    Url {
        prev: String,
    },
    Body {
        prev: Value,
    },
    RawBody {
        prev: Option<Bytes>,
    },
}

/// Records every mutation applied to the outbound request for exact revert.
pub struct ProxyReqManager {
    url: String,
    headers: HeaderMap,
    body: Value,
    raw_body: Option<Bytes>,
    mutations: Vec<Mutation>,
}

impl ProxyReqManager {
    /// Seed from the upstream URL and the (already validated) inbound body.
    /// Headers start empty: the outbound request is built fresh rather than
    /// forwarded, so nothing dangerous leaks through by default.
    pub fn new(url: impl Into<String>, body: Value) -> Self {
        Self {
            url: url.into(),
            headers: HeaderMap::new(),
            body,
            raw_body: None,
            mutations: Vec::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Serialized body published by `finalize_body`; `None` until then.
    pub fn raw_body(&self) -> Option<&Bytes> {
        self.raw_body.as_ref()
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ProxyError::Internal(format!("invalid header name: {}", e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ProxyError::Internal(format!("invalid header value: {}", e)))?;
        let prev = self.headers.insert(name.clone(), value);
        self.mutations.push(Mutation::Header { name, prev });
        Ok(())
    }

    pub fn remove_header(&mut self, name: &str) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ProxyError::Internal(format!("invalid header name: {}", e)))?;
        if let Some(prev) = self.headers.remove(&name) {
            self.mutations.push(Mutation::Header {
                name,
                prev: Some(prev),
            });
        }
        Ok(())
    }

    pub fn set_url(&mut self, url: impl Into<String>) {
        let prev = std::mem::replace(&mut self.url, url.into());
        self.mutations.push(Mutation::Url { prev });
    }

    pub fn set_body(&mut self, body: Value) {
        let prev = std::mem::replace(&mut self.body, body);
        self.mutations.push(Mutation::Body { prev });
    }

    fn set_raw_body(&mut self, raw: Bytes) {
        let prev = self.raw_body.replace(raw);
        self.mutations.push(Mutation::RawBody { prev });
    }

    /// Undo every recorded mutation, newest first. The manager is left
    /// byte-identical to its state at construction.
    pub fn revert(&mut self) {
        while let Some(mutation) = self.mutations.pop() {
            match mutation {
                Mutation::Header { name, prev } => match prev {
                    Some(value) => {
                        self.headers.insert(name, value);
                    }
                    None => {
                        self.headers.remove(&name);
                    }
                },
                Mutation::Url { prev } => self.url = prev,
                Mutation::Body { prev } => self.body = prev,
                Mutation::RawBody { prev } => self.raw_body = prev,
            }
        }
    }
}

type Mutator = fn(&mut ProxyReqManager, &MutatorContext<'_>) -> Result<()>;

/// The full pipeline in its required order.
const PIPELINE: &[(&str, Mutator)] = &[
    ("applyQuotaLimits", apply_quota_limits),
    ("addKey", add_key),
    ("languageFilter", language_filter),
    ("limitCompletions", limit_completions),
    ("blockZoomerOrigins", block_zoomer_origins),
    ("stripHeaders", strip_headers),
    ("finalizeBody", finalize_body),
];

/// Embeddings skip quota and body rewrites: key attachment and transport
/// finalization only.
const EMBEDDINGS_PIPELINE: &[(&str, Mutator)] = &[
    ("addKey", add_key),
    ("stripHeaders", strip_headers),
    ("finalizeBody", finalize_body),
];

/// Run the pipeline for the request's format. A mutator error aborts the
/// request before upstream contact; the manager is reverted so a retry path
/// never sees half-applied state.
pub fn apply_mutators(manager: &mut ProxyReqManager, ctx: &MutatorContext<'_>) -> Result<()> {
    let pipeline = match ctx.inbound {
        ApiFormat::OpenAi if is_embeddings(manager) => EMBEDDINGS_PIPELINE,
        _ => PIPELINE,
    };
    for (name, mutator) in pipeline {
        if let Err(err) = mutator(manager, ctx) {
            tracing::debug!(mutator = name, error = %err, "mutator aborted request");
            manager.revert();
            return Err(err);
        }
    }
    Ok(())
}

fn is_embeddings(manager: &ProxyReqManager) -> bool {
    manager.url.ends_with("/embeddings")
}

fn apply_quota_limits(_manager: &mut ProxyReqManager, ctx: &MutatorContext<'_>) -> Result<()> {
    if let Some(user) = ctx.user {
        ctx.user_store
            .check_quota(&user.token, ctx.family, ctx.prompt_tokens)?;
    }
    Ok(())
}

fn add_key(manager: &mut ProxyReqManager, ctx: &MutatorContext<'_>) -> Result<()> {
    match ctx.service {
        Service::Openai => {
            manager.set_header("authorization", &format!("Bearer {}", ctx.key.secret))?;
            if let KeyExt::OpenAi {
                organization: Some(org),
            } = &ctx.key.ext
            {
                manager.set_header("openai-organization", org)?;
            }
        }
        Service::Anthropic => {
            manager.set_header("x-api-key", &ctx.key.secret)?;
            manager.set_header("anthropic-version", "2023-06-01")?;
        }
        Service::GooglePalm => {
            // PaLM authenticates with a query parameter.
            let url = format!("{}?key={}", manager.url(), ctx.key.secret);
            manager.set_url(url);
        }
        Service::Mistral => {
            manager.set_header("authorization", &format!("Bearer {}", ctx.key.secret))?;
        }
        // Bedrock requests are signed by the SDK from the key's parsed
        // credentials; nothing to attach here.
        Service::Aws => {}
    }
    Ok(())
}

fn language_filter(manager: &mut ProxyReqManager, ctx: &MutatorContext<'_>) -> Result<()> {
    if ctx.config.reject_phrases.is_empty() {
        return Ok(());
    }
    let text = collect_prompt_text(manager.body()).to_lowercase();
    for phrase in &ctx.config.reject_phrases {
        if text.contains(&phrase.to_lowercase()) {
            return Err(ProxyError::Validation {
                message: ctx.config.reject_message.clone(),
                issues: vec![],
            });
        }
    }
    Ok(())
}

fn limit_completions(manager: &mut ProxyReqManager, ctx: &MutatorContext<'_>) -> Result<()> {
    let Some(cap) = ctx.config.max_output_tokens else {
        return Ok(());
    };
    let field = match ctx.service {
        Service::Anthropic | Service::Aws => "max_tokens_to_sample",
        _ => "max_tokens",
    };
    let requested = manager.body()[field].as_u64();
    if let Some(requested) = requested {
        if requested > cap as u64 {
            let mut body = manager.body().clone();
            body[field] = json!(cap);
            manager.set_body(body);
        }
    }
    Ok(())
}

fn block_zoomer_origins(_manager: &mut ProxyReqManager, ctx: &MutatorContext<'_>) -> Result<()> {
    if ctx.config.blocked_origins.is_empty() {
        return Ok(());
    }
    let sources = [ctx.origin.as_deref(), ctx.referer.as_deref()];
    for source in sources.into_iter().flatten() {
        for blocked in &ctx.config.blocked_origins {
            if source.contains(blocked.as_str()) {
                return Err(ProxyError::OrgDisabled(ORG_DISABLED_MESSAGE.to_string()));
            }
        }
    }
    Ok(())
}

// Headers that must never reach upstream if some earlier stage copied them.
const STRIPPED_HEADERS: &[&str] = &[
    "origin",
    "referer",
    "cookie",
    "host",
    "via",
    "forwarded",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "x-real-ip",
    "cf-connecting-ip",
    "true-client-ip",
];

fn strip_headers(manager: &mut ProxyReqManager, _ctx: &MutatorContext<'_>) -> Result<()> {
    for name in STRIPPED_HEADERS {
        manager.remove_header(name)?;
    }
    Ok(())
}

/// Must run last. Serializes the body, sets `Content-Type`/`Content-Length`,
/// and publishes the raw buffer the transport will send.
fn finalize_body(manager: &mut ProxyReqManager, ctx: &MutatorContext<'_>) -> Result<()> {
    // Image generations do not stream; the flag must not reach upstream.
    if ctx.inbound == ApiFormat::OpenAiImage && manager.body().get("stream").is_some() {
        let mut body = manager.body().clone();
        body.as_object_mut().map(|map| map.remove("stream"));
        manager.set_body(body);
    }

    let raw = serde_json::to_vec(manager.body())?;
    manager.set_header("content-type", "application/json")?;
    manager.set_header("content-length", &raw.len().to_string())?;
    manager.set_raw_body(Bytes::from(raw));
    Ok(())
}

/// Pull every piece of user text out of a request body, whatever its shape.
fn collect_prompt_text(body: &Value) -> String {
    let mut text = String::new();
    if let Some(prompt) = body["prompt"].as_str() {
        text.push_str(prompt);
        text.push('\n');
    }
    if let Some(messages) = body["messages"].as_array() {
        for message in messages {
            match &message["content"] {
                Value::String(content) => {
                    text.push_str(content);
                    text.push('\n');
                }
                Value::Array(parts) => {
                    for part in parts {
                        if let Some(part_text) = part["text"].as_str() {
                            text.push_str(part_text);
                            text.push('\n');
                        }
                    }
                }
                _ => {}
            }
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::families::classify;
    use crate::services::key_pool::KeyPool;
    use crate::services::user_store::{MemoryStore, UserType};
    use std::sync::Arc;

    fn test_fixture(config: AppConfig) -> (AppConfig, Arc<UserStore>, KeySnapshot) {
        let config = AppConfig {
            openai_keys: vec!["sk-test".to_string()],
            ..config
        };
        let pool = KeyPool::from_config(&config);
        let key = pool.get(Service::Openai, ModelFamily::Turbo).unwrap();
        let store = UserStore::new(&config, Arc::new(MemoryStore::new()));
        (config, store, key)
    }

    fn chat_body() -> Value {
        json!({
            "model": "gpt-3.5-turbo",
            "messages": [{"role": "user", "content": "hello"}],
            "max_tokens": 4096,
        })
    }

    fn ctx<'a>(
        config: &'a AppConfig,
        store: &'a UserStore,
        key: &'a KeySnapshot,
        user: Option<&'a User>,
    ) -> MutatorContext<'a> {
        MutatorContext {
            config,
            user,
            user_store: store,
            key,
            service: Service::Openai,
            family: classify(Service::Openai, "gpt-3.5-turbo"),
            inbound: ApiFormat::OpenAi,
            prompt_tokens: 10,
            origin: None,
            referer: None,
        }
    }

    #[test]
    fn test_pipeline_attaches_key_and_finalizes() {
        let (config, store, key) = test_fixture(AppConfig::default());
        let mut manager = ProxyReqManager::new("https://up/v1/chat/completions", chat_body());
        apply_mutators(&mut manager, &ctx(&config, &store, &key, None)).unwrap();

        assert_eq!(
            manager.headers().get("authorization").unwrap(),
            "Bearer sk-test"
        );
        assert_eq!(
            manager.headers().get("content-type").unwrap(),
            "application/json"
        );
        let raw = manager.raw_body().unwrap();
        assert_eq!(
            manager.headers().get("content-length").unwrap(),
            &raw.len().to_string()
        );
    }

    #[test]
    fn test_revert_restores_byte_identical_state() {
        let (config, store, key) = test_fixture(AppConfig {
            max_output_tokens: Some(100),
            ..AppConfig::default()
        });
        let body = chat_body();
        let mut manager = ProxyReqManager::new("https://up/v1/chat/completions", body.clone());
        let url_before = manager.url().to_string();

        apply_mutators(&mut manager, &ctx(&config, &store, &key, None)).unwrap();
        assert_ne!(manager.body(), &body); // max_tokens was clamped
        assert!(manager.raw_body().is_some());

        manager.revert();
        assert_eq!(manager.url(), url_before);
        assert_eq!(manager.body(), &body);
        assert!(manager.raw_body().is_none());
        assert!(manager.headers().is_empty());
    }

    #[test]
    fn test_revert_then_reapply_is_stable() {
        let (config, store, key) = test_fixture(AppConfig::default());
        let mut manager = ProxyReqManager::new("https://up/v1/chat/completions", chat_body());
        let context = ctx(&config, &store, &key, None);

        apply_mutators(&mut manager, &context).unwrap();
        let first_raw = manager.raw_body().unwrap().clone();
        manager.revert();
        apply_mutators(&mut manager, &context).unwrap();
        assert_eq!(manager.raw_body().unwrap(), &first_raw);
    }

    #[test]
    fn test_quota_mutator_rejects_exhausted_user() {
        let (config, store, key) = test_fixture(AppConfig {
            token_quota: [(ModelFamily::Turbo, 100)].into_iter().collect(),
            ..AppConfig::default()
        });
        let user = store.create_user(UserType::Normal, None);
        store.increment_usage(&user.token, ModelFamily::Turbo, 95);
        let user = store.get_user(&user.token).unwrap();

        let mut manager = ProxyReqManager::new("https://up/v1/chat/completions", chat_body());
        let err = apply_mutators(&mut manager, &ctx(&config, &store, &key, Some(&user)))
            .unwrap_err();
        assert!(matches!(err, ProxyError::QuotaExceeded { .. }));
        // Aborted pipelines leave no residue.
        assert!(manager.headers().is_empty());
        assert!(manager.raw_body().is_none());
    }

    #[test]
    fn test_limit_completions_clamps_max_tokens() {
        let (config, store, key) = test_fixture(AppConfig {
            max_output_tokens: Some(512),
            ..AppConfig::default()
        });
        let mut manager = ProxyReqManager::new("https://up/v1/chat/completions", chat_body());
        apply_mutators(&mut manager, &ctx(&config, &store, &key, None)).unwrap();
        assert_eq!(manager.body()["max_tokens"], 512);
    }

    #[test]
    fn test_language_filter_rejects_phrase() {
        let (config, store, key) = test_fixture(AppConfig {
            reject_phrases: vec!["forbidden topic".to_string()],
            ..AppConfig::default()
        });
        let body = json!({
            "model": "gpt-3.5-turbo",
            "messages": [{"role": "user", "content": "tell me about the FORBIDDEN topic"}],
        });
        let mut manager = ProxyReqManager::new("https://up/v1/chat/completions", body);
        let err =
            apply_mutators(&mut manager, &ctx(&config, &store, &key, None)).unwrap_err();
        assert!(matches!(err, ProxyError::Validation { .. }));
    }

    #[test]
    fn test_blocked_origin_gets_spoofed_disable() {
        let (config, store, key) = test_fixture(AppConfig {
            blocked_origins: vec!["scraper.example".to_string()],
            ..AppConfig::default()
        });
        let mut manager = ProxyReqManager::new("https://up/v1/chat/completions", chat_body());
        let mut context = ctx(&config, &store, &key, None);
        context.referer = Some("https://scraper.example/ui".to_string());
        let err = apply_mutators(&mut manager, &context).unwrap_err();
        match err {
            ProxyError::OrgDisabled(message) => assert_eq!(message, ORG_DISABLED_MESSAGE),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_strip_headers_removes_client_identifiers() {
        let (config, store, key) = test_fixture(AppConfig::default());
        let mut manager = ProxyReqManager::new("https://up/v1/chat/completions", chat_body());
        manager.set_header("x-forwarded-for", "1.2.3.4").unwrap();
        manager.set_header("cookie", "session=abc").unwrap();
        apply_mutators(&mut manager, &ctx(&config, &store, &key, None)).unwrap();
        assert!(manager.headers().get("x-forwarded-for").is_none());
        assert!(manager.headers().get("cookie").is_none());
        // The key added by the pipeline survives the strip.
        assert!(manager.headers().get("authorization").is_some());
    }

    #[test]
    fn test_image_finalize_strips_stream_flag() {
        let (config, store, key) = test_fixture(AppConfig::default());
        let body = json!({"model": "dall-e-3", "prompt": "a fox", "stream": true});
        let mut manager = ProxyReqManager::new("https://up/v1/images/generations", body);
        let mut context = ctx(&config, &store, &key, None);
        context.inbound = ApiFormat::OpenAiImage;
        context.family = ModelFamily::DallE;
        apply_mutators(&mut manager, &context).unwrap();
        assert!(manager.body().get("stream").is_none());
        let raw: Value = serde_json::from_slice(manager.raw_body().unwrap()).unwrap();
        assert!(raw.get("stream").is_none());
    }

    #[test]
    fn test_palm_key_goes_in_query() {
        let config = AppConfig {
            google_palm_keys: vec!["palm-secret".to_string()],
            ..AppConfig::default()
        };
        let pool = KeyPool::from_config(&config);
        let key = pool.get(Service::GooglePalm, ModelFamily::Bison).unwrap();
        let store = UserStore::new(&config, Arc::new(MemoryStore::new()));

        let mut manager = ProxyReqManager::new(
            "https://palm/v1beta2/models/text-bison-001:generateText",
            json!({"prompt": {"text": "hi"}}),
        );
        let mut context = ctx(&config, &store, &key, None);
        context.service = Service::GooglePalm;
        context.family = ModelFamily::Bison;
        apply_mutators(&mut manager, &context).unwrap();
        assert!(manager.url().ends_with("?key=palm-secret"));
        assert!(manager.headers().get("authorization").is_none());
    }

    #[test]
    fn test_embeddings_pipeline_skips_quota() {
        let (config, store, key) = test_fixture(AppConfig {
            token_quota: [(ModelFamily::Turbo, 1)].into_iter().collect(),
            ..AppConfig::default()
        });
        let user = store.create_user(UserType::Normal, None);
        store.increment_usage(&user.token, ModelFamily::Turbo, 100);
        let user = store.get_user(&user.token).unwrap();

        let body = json!({"model": "text-embedding-ada-002", "input": "hello"});
        let mut manager = ProxyReqManager::new("https://up/v1/embeddings", body);
        // Over quota, but embeddings do not consult quota.
        apply_mutators(&mut manager, &ctx(&config, &store, &key, Some(&user))).unwrap();
        assert!(manager.headers().get("authorization").is_some());
    }
}
