//! Configuration management for the proxy.
//!
//! All options are loaded from environment variables (a `.env` file is
//! honored). Secret lists are comma-separated; quota maps use
//! `family=tokens` pairs.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use super::families::ModelFamily;

/// How inbound requests are authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Anonymous access; no user records, no quotas.
    None,
    /// Bearer user tokens checked against the gatekeeper store.
    UserToken,
}

/// Backend used to persist user records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatekeeperStoreKind {
    Memory,
    FirebaseRtdb,
}

/// Schedule on which every user's quota is re-granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaRefreshPeriod {
    Never,
    Hourly,
    Daily,
}

impl QuotaRefreshPeriod {
    pub fn interval_secs(&self) -> Option<u64> {
        match self {
            QuotaRefreshPeriod::Never => None,
            QuotaRefreshPeriod::Hourly => Some(3_600),
            QuotaRefreshPeriod::Daily => Some(86_400),
        }
    }
}

/// Server bind configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7860,
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,

    /// Per-provider secret lists. AWS entries are `accessKeyId:secret:region`.
    pub openai_keys: Vec<String>,
    pub anthropic_keys: Vec<String>,
    pub google_palm_keys: Vec<String>,
    pub aws_credentials: Vec<String>,
    pub mistral_keys: Vec<String>,

    /// Upstream base URLs, overridable for testing.
    pub openai_api_base: String,
    pub anthropic_api_base: String,
    pub google_palm_api_base: String,
    pub mistral_api_base: String,

    pub auth_mode: AuthMode,
    pub gatekeeper_store: GatekeeperStoreKind,
    pub firebase_rtdb_url: Option<String>,
    pub firebase_key: Option<String>,

    pub quota_refresh_period: QuotaRefreshPeriod,
    /// Default quota granted to non-special users, per family. Absent or 0
    /// means unlimited.
    pub token_quota: HashMap<ModelFamily, u64>,
    /// Distinct IPs allowed per user before disable. 0 disables the cap.
    pub max_ips_per_user: usize,
    /// Families advertised on `/v1/models` and admitted for service.
    pub allowed_model_families: HashSet<ModelFamily>,

    pub prompt_logging: bool,
    pub prompt_log_path: String,

    /// Per-user inbound requests per minute. 0 disables.
    pub rate_limit_per_minute: u32,
    /// Global cap applied to requested completion lengths.
    pub max_output_tokens: Option<u32>,
    /// Origin/Referer substrings that trigger the spoofed account-disabled
    /// rejection.
    pub blocked_origins: Vec<String>,
    /// Phrases that cause a prompt to be rejected outright.
    pub reject_phrases: Vec<String>,
    pub reject_message: String,

    pub request_timeout_secs: u64,
    pub user_flush_interval_secs: u64,

    pub admin_key: Option<String>,
    /// Strips stack details from 500 bodies when set.
    pub production: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            openai_keys: vec![],
            anthropic_keys: vec![],
            google_palm_keys: vec![],
            aws_credentials: vec![],
            mistral_keys: vec![],
            openai_api_base: "https://api.openai.com".to_string(),
            anthropic_api_base: "https://api.anthropic.com".to_string(),
            google_palm_api_base: "https://generativelanguage.googleapis.com".to_string(),
            mistral_api_base: "https://api.mistral.ai".to_string(),
            auth_mode: AuthMode::UserToken,
            gatekeeper_store: GatekeeperStoreKind::Memory,
            firebase_rtdb_url: None,
            firebase_key: None,
            quota_refresh_period: QuotaRefreshPeriod::Never,
            token_quota: HashMap::new(),
            max_ips_per_user: 0,
            allowed_model_families: ModelFamily::ALL.iter().copied().collect(),
            prompt_logging: false,
            prompt_log_path: "./logs/prompts.jsonl".to_string(),
            rate_limit_per_minute: 0,
            max_output_tokens: None,
            blocked_origins: vec![],
            reject_phrases: vec![],
            reject_message: "This content violates the proxy's acceptable use policy.".to_string(),
            request_timeout_secs: 300,
            user_flush_interval_secs: 20,
            admin_key: None,
            production: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let mut config = AppConfig::default();

        if let Ok(host) = std::env::var("HOST") {
            config.server.host = host;
        }
        if let Ok(port) = std::env::var("PORT") {
            config.server.port = port.parse().context("PORT must be a number")?;
        }

        config.openai_keys = csv_env("OPENAI_KEYS");
        config.anthropic_keys = csv_env("ANTHROPIC_KEYS");
        config.google_palm_keys = csv_env("GOOGLE_PALM_KEYS");
        config.aws_credentials = csv_env("AWS_CREDENTIALS");
        config.mistral_keys = csv_env("MISTRAL_KEYS");

        if let Ok(base) = std::env::var("OPENAI_API_BASE") {
            config.openai_api_base = base;
        }
        if let Ok(base) = std::env::var("ANTHROPIC_API_BASE") {
            config.anthropic_api_base = base;
        }
        if let Ok(base) = std::env::var("GOOGLE_PALM_API_BASE") {
            config.google_palm_api_base = base;
        }
        if let Ok(base) = std::env::var("MISTRAL_API_BASE") {
            config.mistral_api_base = base;
        }

        if let Ok(mode) = std::env::var("AUTH_MODE") {
            config.auth_mode = match mode.as_str() {
                "none" => AuthMode::None,
                "user_token" => AuthMode::UserToken,
                other => return Err(anyhow!("unknown AUTH_MODE: {}", other)),
            };
        }

        if let Ok(store) = std::env::var("GATEKEEPER_STORE") {
            config.gatekeeper_store = match store.as_str() {
                "memory" => GatekeeperStoreKind::Memory,
                "firebase_rtdb" => GatekeeperStoreKind::FirebaseRtdb,
                other => return Err(anyhow!("unknown GATEKEEPER_STORE: {}", other)),
            };
        }
        config.firebase_rtdb_url = std::env::var("FIREBASE_RTDB_URL").ok();
        config.firebase_key = std::env::var("FIREBASE_KEY").ok();
        if config.gatekeeper_store == GatekeeperStoreKind::FirebaseRtdb
            && config.firebase_rtdb_url.is_none()
        {
            return Err(anyhow!(
                "GATEKEEPER_STORE=firebase_rtdb requires FIREBASE_RTDB_URL"
            ));
        }

        if let Ok(period) = std::env::var("QUOTA_REFRESH_PERIOD") {
            config.quota_refresh_period = match period.as_str() {
                "never" | "" => QuotaRefreshPeriod::Never,
                "hourly" => QuotaRefreshPeriod::Hourly,
                "daily" => QuotaRefreshPeriod::Daily,
                other => return Err(anyhow!("unknown QUOTA_REFRESH_PERIOD: {}", other)),
            };
        }

        if let Ok(quota) = std::env::var("TOKEN_QUOTA") {
            config.token_quota = parse_quota_map(&quota)?;
        }
        if let Ok(max_ips) = std::env::var("MAX_IPS_PER_USER") {
            config.max_ips_per_user =
                max_ips.parse().context("MAX_IPS_PER_USER must be a number")?;
        }
        if let Ok(families) = std::env::var("ALLOWED_MODEL_FAMILIES") {
            config.allowed_model_families = families
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| ModelFamily::from_str(s).map_err(|e| anyhow!(e)))
                .collect::<Result<HashSet<_>>>()?;
        }

        config.prompt_logging = bool_env("PROMPT_LOGGING");
        if let Ok(path) = std::env::var("PROMPT_LOG_PATH") {
            config.prompt_log_path = path;
        }

        if let Ok(rate) = std::env::var("RATE_LIMIT_PER_MINUTE") {
            config.rate_limit_per_minute =
                rate.parse().context("RATE_LIMIT_PER_MINUTE must be a number")?;
        }
        if let Ok(max) = std::env::var("MAX_OUTPUT_TOKENS") {
            config.max_output_tokens =
                Some(max.parse().context("MAX_OUTPUT_TOKENS must be a number")?);
        }
        config.blocked_origins = csv_env("BLOCKED_ORIGINS");
        config.reject_phrases = csv_env("REJECT_PHRASES");
        if let Ok(message) = std::env::var("REJECT_MESSAGE") {
            config.reject_message = message;
        }

        if let Ok(timeout) = std::env::var("REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs =
                timeout.parse().context("REQUEST_TIMEOUT_SECS must be a number")?;
        }
        if let Ok(interval) = std::env::var("USER_FLUSH_INTERVAL_SECS") {
            config.user_flush_interval_secs = interval
                .parse()
                .context("USER_FLUSH_INTERVAL_SECS must be a number")?;
        }

        config.admin_key = std::env::var("ADMIN_KEY").ok();
        config.production = bool_env("PRODUCTION");

        Ok(config)
    }

    /// Total number of configured secrets across all providers.
    pub fn key_count(&self) -> usize {
        self.openai_keys.len()
            + self.anthropic_keys.len()
            + self.google_palm_keys.len()
            + self.aws_credentials.len()
            + self.mistral_keys.len()
    }
}

fn csv_env(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn bool_env(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on"))
        .unwrap_or(false)
}

/// Parse `turbo=500000,gpt4=100000` into a family→tokens map.
fn parse_quota_map(raw: &str) -> Result<HashMap<ModelFamily, u64>> {
    let mut map = HashMap::new();
    for pair in raw.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        let (family, amount) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("TOKEN_QUOTA entries must be family=tokens, got {}", pair))?;
        let family = ModelFamily::from_str(family.trim()).map_err(|e| anyhow!(e))?;
        let amount: u64 = amount
            .trim()
            .parse()
            .with_context(|| format!("invalid quota amount in {}", pair))?;
        map.insert(family, amount);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quota_map() {
        let map = parse_quota_map("turbo=500000, gpt4=100000").unwrap();
        assert_eq!(map[&ModelFamily::Turbo], 500_000);
        assert_eq!(map[&ModelFamily::Gpt4], 100_000);
    }

    #[test]
    fn test_parse_quota_map_rejects_bad_family() {
        assert!(parse_quota_map("gpt5=1").is_err());
        assert!(parse_quota_map("turbo").is_err());
        assert!(parse_quota_map("turbo=lots").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 7860);
        assert_eq!(config.user_flush_interval_secs, 20);
        assert_eq!(config.gatekeeper_store, GatekeeperStoreKind::Memory);
        assert_eq!(config.max_ips_per_user, 0);
        assert_eq!(
            config.allowed_model_families.len(),
            ModelFamily::ALL.len()
        );
        assert_eq!(config.key_count(), 0);
    }

    #[test]
    fn test_refresh_period_intervals() {
        assert_eq!(QuotaRefreshPeriod::Never.interval_secs(), None);
        assert_eq!(QuotaRefreshPeriod::Hourly.interval_secs(), Some(3_600));
        assert_eq!(QuotaRefreshPeriod::Daily.interval_secs(), Some(86_400));
    }
}
