//! Core functionality: configuration, error taxonomy, model families,
//! token counting, cancellation, rate limiting, and metrics.

pub mod cancel;
pub mod config;
pub mod error;
pub mod families;
pub mod metrics;
pub mod rate_limiter;
pub mod token_counter;

pub use cancel::CancelHandle;
pub use config::{AppConfig, AuthMode, GatekeeperStoreKind, QuotaRefreshPeriod, ServerConfig};
pub use error::{ProxyError, Result, ORG_DISABLED_MESSAGE};
pub use families::{classify, models_for_family, ModelFamily, Service};
pub use metrics::{init_metrics, render_metrics};
pub use rate_limiter::UserRateLimiter;
pub use token_counter::{count_tokens, TokenInput};
