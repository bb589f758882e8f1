//! HTTP surface: handlers, auth, mutators, upstream dispatch, and the
//! streaming/blocking response pipelines.

pub mod admin;
pub mod auth;
pub mod aws;
pub mod blocking;
pub mod handlers;
pub mod models;
pub mod mutators;
pub mod streaming;
pub mod upstream;

use std::sync::Arc;

use crate::core::cancel::CancelHandle;
use crate::core::config::AppConfig;
use crate::core::families::{ModelFamily, Service};
use crate::core::rate_limiter::UserRateLimiter;
use crate::services::key_pool::KeyPool;
use crate::services::prompt_logger::PromptLogger;
use crate::services::queue::{RequestQueue, Shard};
use crate::services::user_store::{User, UserStore};
use crate::transformer::{ApiFormat, StreamDialect};

pub use handlers::build_router;
pub use mutators::{apply_mutators, MutatorContext, ProxyReqManager};

/// Process-wide dependencies, wired once at startup and passed explicitly.
pub struct AppState {
    pub config: AppConfig,
    pub key_pool: Arc<KeyPool>,
    pub queue: Arc<RequestQueue>,
    pub user_store: Arc<UserStore>,
    pub rate_limiter: Arc<UserRateLimiter>,
    pub prompt_logger: PromptLogger,
    pub http_client: reqwest::Client,
}

/// Everything the pipeline needs to know about one in-flight request.
pub struct RequestContext {
    pub request_id: String,
    pub service: Service,
    pub family: ModelFamily,
    pub inbound: ApiFormat,
    pub outbound: ApiFormat,
    pub model: String,
    /// Upstream endpoint this request targets (informational for Bedrock,
    /// which dispatches through the SDK).
    pub upstream_url: String,
    pub is_streaming: bool,
    pub prompt_tokens: u64,
    /// Inbound prompt (message list or prompt string), kept verbatim for
    /// prompt logging.
    pub prompt: serde_json::Value,
    /// Preprocessed body in the outbound dialect; the mutator pipeline's
    /// starting state.
    pub outbound_body: serde_json::Value,
    pub user: Option<User>,
    pub cancel: CancelHandle,
    pub origin: Option<String>,
    pub referer: Option<String>,
}

impl RequestContext {
    pub fn shard(&self) -> Shard {
        Shard {
            service: self.service,
            family: self.family,
        }
    }

    /// Queue priority rank derived from the user type; anonymous requests
    /// rank as normal.
    pub fn rank(&self) -> u8 {
        self.user.as_ref().map(|u| u.user_type.rank()).unwrap_or(1)
    }

    /// Dialect of the SSE events the selected upstream emits.
    pub fn upstream_dialect(&self) -> StreamDialect {
        match self.service {
            Service::Openai | Service::Mistral => match self.outbound {
                ApiFormat::OpenAiText => StreamDialect::OpenAiText,
                _ => StreamDialect::OpenAiChat,
            },
            // We pin anthropic-version 2023-06-01, which streams deltas.
            Service::Anthropic => StreamDialect::AnthropicV2,
            // Bedrock Claude chunks are delta-shaped completion events.
            Service::Aws => StreamDialect::AnthropicV2,
            Service::GooglePalm => StreamDialect::GoogleAi,
        }
    }

    /// Dialect of the SSE events the client expects.
    pub fn egress_dialect(&self) -> StreamDialect {
        self.inbound.stream_dialect()
    }
}
