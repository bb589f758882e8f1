//! LLM Relay - a reverse proxy that multiplexes pooled upstream credentials
//! across many concurrent clients.
//!
//! The proxy sits between clients and several LLM APIs (OpenAI, Anthropic,
//! Google PaLM, AWS Bedrock, Mistral) and provides:
//!
//! - **Key Pool**: multi-provider credential registry selecting one key per
//!   request under rate-limit, usage, and priority constraints
//! - **Request Queue**: priority admission with per-shard lockouts and
//!   keep-alive heartbeats for queued streaming clients
//! - **Reversible Mutator Pipeline**: outbound requests are built from
//!   recorded mutations that revert exactly on retry
//! - **SSE Transformation**: upstream event streams are translated across
//!   API dialects in flight and aggregated into a final response for quota
//!   accounting and prompt logging
//!
//! # Architecture
//!
//! The codebase is organized into four layers:
//!
//! - [`core`]: configuration, error taxonomy, model families, token
//!   counting, cancellation, rate limiting, metrics
//! - [`services`]: key pool, request queue, user store, prompt logger
//! - [`transformer`]: SSE parsing, dialect transforms, stream aggregation
//! - [`api`]: HTTP handlers and the request/response pipelines

pub mod api;
pub mod core;
pub mod services;
pub mod transformer;

pub use crate::api::{build_router, AppState};
pub use crate::core::{AppConfig, ModelFamily, ProxyError, Result, Service};
pub use crate::services::{KeyPool, RequestQueue, UserStore};
