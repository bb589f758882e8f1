//! Multi-provider credential pool.
//!
//! Holds every upstream secret the proxy owns and selects one per outgoing
//! request under rate-limit, usage, and health constraints. Selection hands
//! out immutable snapshots; all bookkeeping lives behind one coarse lock
//! (per-key latency is dominated by upstream I/O, not contention).

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::core::config::AppConfig;
use crate::core::error::{ProxyError, Result};
use crate::core::families::{classify, ModelFamily, Service};

/// Lockout applied when upstream returns 429 for a key.
pub const RATE_LIMIT_LOCKOUT: Duration = Duration::from_millis(2_000);

/// Throttle applied to a key on selection, before its first outcome is
/// known. Not a true rate limit.
pub const KEY_REUSE_DELAY: Duration = Duration::from_millis(500);

/// Provider-specific key attributes, opaque to selection.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyExt {
    OpenAi { organization: Option<String> },
    Anthropic,
    GooglePalm,
    Aws {
        access_key_id: String,
        secret_access_key: String,
        region: String,
    },
    Mistral,
}

/// One upstream credential and its bookkeeping.
#[derive(Debug, Clone)]
pub struct Key {
    secret: String,
    pub hash: String,
    pub service: Service,
    pub families: Vec<ModelFamily>,
    pub is_disabled: bool,
    pub disabled_reason: Option<String>,
    pub is_trial: bool,
    pub prompt_count: u64,
    pub token_counts: HashMap<ModelFamily, u64>,
    pub last_used: Option<Instant>,
    pub last_checked: Option<DateTime<Utc>>,
    pub rate_limited_at: Option<Instant>,
    pub rate_limited_until: Option<Instant>,
    pub ext: KeyExt,
}

impl Key {
    fn new(service: Service, secret: String, families: Vec<ModelFamily>, ext: KeyExt) -> Self {
        let hash = hash_secret(service, &secret);
        Self {
            secret,
            hash,
            service,
            families,
            is_disabled: false,
            disabled_reason: None,
            is_trial: false,
            prompt_count: 0,
            token_counts: HashMap::new(),
            last_used: None,
            last_checked: None,
            rate_limited_at: None,
            rate_limited_until: None,
            ext,
        }
    }

    /// Selection-order sense of "rate limited": the 429 lockout window has
    /// not elapsed since the last `rate_limited_at`.
    fn is_rate_limited(&self, now: Instant) -> bool {
        match self.rate_limited_at {
            Some(at) => now.duration_since(at) < RATE_LIMIT_LOCKOUT,
            None => false,
        }
    }

    /// Lockout-period sense: the reuse/lockout deadline is in the future.
    fn lockout_remaining(&self, now: Instant) -> Duration {
        match self.rate_limited_until {
            Some(until) if until > now => until - now,
            _ => Duration::ZERO,
        }
    }
}

/// Stable, provider-tagged short hash of a secret, for logging and lookup.
pub fn hash_secret(service: Service, secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    let hex = format!("{:x}", digest);
    format!("{}-{}", service.key_prefix(), &hex[..8])
}

/// Immutable copy of a selected key, handed to the request pipeline.
#[derive(Debug, Clone)]
pub struct KeySnapshot {
    pub hash: String,
    pub secret: String,
    pub service: Service,
    pub is_trial: bool,
    pub ext: KeyExt,
}

/// Redacted key view for the admin surface; the secret is elided.
#[derive(Debug, Clone, Serialize)]
pub struct KeyInfo {
    pub hash: String,
    pub service: Service,
    pub families: Vec<ModelFamily>,
    pub is_disabled: bool,
    pub disabled_reason: Option<String>,
    pub is_trial: bool,
    pub prompt_count: u64,
    pub token_counts: HashMap<ModelFamily, u64>,
    pub last_checked: Option<DateTime<Utc>>,
    pub rate_limited: bool,
}

/// Partial update merged into a key by the checker.
#[derive(Debug, Clone, Default)]
pub struct KeyUpdate {
    pub families: Option<Vec<ModelFamily>>,
    pub is_trial: Option<bool>,
    pub ext: Option<KeyExt>,
}

pub struct KeyPool {
    keys: Mutex<Vec<Key>>,
    events: Arc<Notify>,
}

impl KeyPool {
    /// Build the pool from configured secret lists. Malformed AWS entries
    /// are skipped with a warning.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut keys = Vec::new();

        for secret in &config.openai_keys {
            keys.push(Key::new(
                Service::Openai,
                secret.clone(),
                vec![
                    ModelFamily::Turbo,
                    ModelFamily::Gpt4,
                    ModelFamily::Gpt4Turbo,
                    ModelFamily::DallE,
                ],
                KeyExt::OpenAi { organization: None },
            ));
        }
        for secret in &config.anthropic_keys {
            keys.push(Key::new(
                Service::Anthropic,
                secret.clone(),
                vec![ModelFamily::Claude],
                KeyExt::Anthropic,
            ));
        }
        for secret in &config.google_palm_keys {
            keys.push(Key::new(
                Service::GooglePalm,
                secret.clone(),
                vec![ModelFamily::Bison],
                KeyExt::GooglePalm,
            ));
        }
        for secret in &config.aws_credentials {
            let parts: Vec<&str> = secret.split(':').collect();
            if parts.len() != 3 {
                tracing::warn!("skipping malformed AWS credential (want accessKeyId:secret:region)");
                continue;
            }
            keys.push(Key::new(
                Service::Aws,
                secret.clone(),
                vec![ModelFamily::AwsClaude],
                KeyExt::Aws {
                    access_key_id: parts[0].to_string(),
                    secret_access_key: parts[1].to_string(),
                    region: parts[2].to_string(),
                },
            ));
        }
        for secret in &config.mistral_keys {
            keys.push(Key::new(
                Service::Mistral,
                secret.clone(),
                vec![
                    ModelFamily::MistralTiny,
                    ModelFamily::MistralSmall,
                    ModelFamily::MistralMedium,
                    ModelFamily::MistralLarge,
                ],
                KeyExt::Mistral,
            ));
        }

        let pool = Self {
            keys: Mutex::new(keys),
            events: Arc::new(Notify::new()),
        };
        pool.log_keys();
        pool
    }

    fn log_keys(&self) {
        let keys = self.keys.lock().unwrap();
        let mut by_service: HashMap<Service, usize> = HashMap::new();
        for key in keys.iter() {
            *by_service.entry(key.service).or_default() += 1;
        }
        tracing::info!("key pool initialized with {} keys", keys.len());
        for (service, count) in by_service {
            tracing::info!("  - {}: {} keys", service, count);
        }
    }

    /// Notified whenever key availability may have changed.
    pub fn events(&self) -> Arc<Notify> {
        Arc::clone(&self.events)
    }

    /// Select an enabled key serving `family`, or fail with `NoAvailableKey`.
    pub fn get(&self, service: Service, family: ModelFamily) -> Result<KeySnapshot> {
        self.get_at(Instant::now(), service, family)
    }

    pub(crate) fn get_at(
        &self,
        now: Instant,
        service: Service,
        family: ModelFamily,
    ) -> Result<KeySnapshot> {
        let mut keys = self.keys.lock().unwrap();

        let mut candidates: Vec<usize> = keys
            .iter()
            .enumerate()
            .filter(|(_, k)| {
                k.service == service && !k.is_disabled && k.families.contains(&family)
            })
            .map(|(i, _)| i)
            .collect();

        if candidates.is_empty() {
            return Err(ProxyError::NoAvailableKey { service, family });
        }

        // Shuffle before sorting so keys with identical state rotate instead
        // of always resolving to list order.
        candidates.shuffle(&mut rand::thread_rng());
        candidates.sort_by(|&a, &b| {
            let ka = &keys[a];
            let kb = &keys[b];
            compare_keys(ka, kb, now)
        });

        let key = &mut keys[candidates[0]];
        key.last_used = Some(now);
        // Throttle the key until this request's outcome is known. Never
        // shortens an active lockout.
        let reuse_deadline = now + KEY_REUSE_DELAY;
        key.rate_limited_until = Some(match key.rate_limited_until {
            Some(until) if until > reuse_deadline => until,
            _ => reuse_deadline,
        });

        Ok(KeySnapshot {
            hash: key.hash.clone(),
            secret: key.secret.clone(),
            service: key.service,
            is_trial: key.is_trial,
            ext: key.ext.clone(),
        })
    }

    /// Idempotent; logs at warn; never fails.
    pub fn disable(&self, hash: &str, reason: &str) {
        let mut keys = self.keys.lock().unwrap();
        if let Some(key) = keys.iter_mut().find(|k| k.hash == hash) {
            if !key.is_disabled {
                key.is_disabled = true;
                key.disabled_reason = Some(reason.to_string());
                tracing::warn!(key = %hash, reason, "key disabled");
            }
        }
        drop(keys);
        self.events.notify_one();
    }

    /// Merge checker results into a key and stamp `last_checked`.
    pub fn update(&self, hash: &str, update: KeyUpdate) {
        let mut keys = self.keys.lock().unwrap();
        if let Some(key) = keys.iter_mut().find(|k| k.hash == hash) {
            if let Some(families) = update.families {
                key.families = families;
            }
            if let Some(is_trial) = update.is_trial {
                key.is_trial = is_trial;
            }
            if let Some(ext) = update.ext {
                key.ext = ext;
            }
            key.last_checked = Some(Utc::now());
        }
        drop(keys);
        self.events.notify_one();
    }

    pub fn mark_rate_limited(&self, hash: &str) {
        self.mark_rate_limited_at(Instant::now(), hash)
    }

    pub(crate) fn mark_rate_limited_at(&self, now: Instant, hash: &str) {
        let mut keys = self.keys.lock().unwrap();
        if let Some(key) = keys.iter_mut().find(|k| k.hash == hash) {
            key.rate_limited_at = Some(now);
            key.rate_limited_until = Some(now + RATE_LIMIT_LOCKOUT);
            tracing::debug!(key = %hash, "key rate limited by upstream");
        }
        drop(keys);
        self.events.notify_one();
    }

    /// Record billed tokens against the key serving `model`.
    pub fn increment_usage(&self, hash: &str, model: &str, tokens: u64) {
        let mut keys = self.keys.lock().unwrap();
        if let Some(key) = keys.iter_mut().find(|k| k.hash == hash) {
            key.prompt_count += 1;
            let family = classify(key.service, model);
            *key.token_counts.entry(family).or_default() += tokens;
        }
    }

    /// Count of enabled keys for a service.
    pub fn available(&self, service: Service) -> usize {
        let keys = self.keys.lock().unwrap();
        keys.iter()
            .filter(|k| k.service == service && !k.is_disabled)
            .count()
    }

    /// Enabled keys able to serve a shard. Zero means admission should fail
    /// with `NoAvailableKey` instead of queueing forever.
    pub fn available_for(&self, service: Service, family: ModelFamily) -> usize {
        let keys = self.keys.lock().unwrap();
        keys.iter()
            .filter(|k| k.service == service && !k.is_disabled && k.families.contains(&family))
            .count()
    }

    /// Redacted snapshots of every key.
    pub fn list(&self) -> Vec<KeyInfo> {
        let now = Instant::now();
        let keys = self.keys.lock().unwrap();
        keys.iter()
            .map(|k| KeyInfo {
                hash: k.hash.clone(),
                service: k.service,
                families: k.families.clone(),
                is_disabled: k.is_disabled,
                disabled_reason: k.disabled_reason.clone(),
                is_trial: k.is_trial,
                prompt_count: k.prompt_count,
                token_counts: k.token_counts.clone(),
                last_checked: k.last_checked,
                rate_limited: k.lockout_remaining(now) > Duration::ZERO,
            })
            .collect()
    }

    /// Whether any enabled key has never been through the checker.
    pub fn any_unchecked(&self) -> bool {
        let keys = self.keys.lock().unwrap();
        keys.iter()
            .any(|k| !k.is_disabled && k.last_checked.is_none())
    }

    /// Families any enabled key can serve, for the model listing.
    pub fn available_families(&self) -> Vec<ModelFamily> {
        let keys = self.keys.lock().unwrap();
        let mut families: Vec<ModelFamily> = Vec::new();
        for key in keys.iter().filter(|k| !k.is_disabled) {
            for family in &key.families {
                if !families.contains(family) {
                    families.push(*family);
                }
            }
        }
        families
    }

    /// Time until some key for the shard clears its lockout. Zero when any
    /// enabled key is usable now, and zero when no enabled keys exist so the
    /// admission layer surfaces `NoAvailableKey` instead of stalling.
    pub fn lockout_period(&self, service: Service, family: ModelFamily) -> Duration {
        self.lockout_period_at(Instant::now(), service, family)
    }

    pub(crate) fn lockout_period_at(
        &self,
        now: Instant,
        service: Service,
        family: ModelFamily,
    ) -> Duration {
        let keys = self.keys.lock().unwrap();
        let mut min_remaining: Option<Duration> = None;
        let mut any = false;
        for key in keys
            .iter()
            .filter(|k| k.service == service && !k.is_disabled && k.families.contains(&family))
        {
            any = true;
            let remaining = key.lockout_remaining(now);
            if remaining.is_zero() {
                return Duration::ZERO;
            }
            min_remaining = Some(match min_remaining {
                Some(current) if current < remaining => current,
                _ => remaining,
            });
        }
        if !any {
            return Duration::ZERO;
        }
        min_remaining.unwrap_or(Duration::ZERO)
    }
}

/// Total selection order; smaller is preferred.
fn compare_keys(a: &Key, b: &Key, now: Instant) -> Ordering {
    let a_limited = a.is_rate_limited(now);
    let b_limited = b.is_rate_limited(now);
    match (a_limited, b_limited) {
        (false, true) => Ordering::Less,
        (true, false) => Ordering::Greater,
        // Both limited: the one limited earlier clears first.
        (true, true) => a
            .rate_limited_at
            .cmp(&b.rate_limited_at)
            .then_with(|| a.last_used.cmp(&b.last_used)),
        // Neither limited: older lastUsed wins; never-used sorts first.
        (false, false) => a.last_used.cmp(&b.last_used),
    }
}
