//! User records, quotas, and gatekeeper persistence.
//!
//! Users live in an in-memory map keyed by UUID token. Mutations mark the
//! record dirty; a background loop flushes dirty records (and pending
//! deletions) to the configured [`GatekeeperStore`] every flush interval, and
//! admin upserts flush immediately. A minute tick expires temporary users;
//! their records are purged 24 hours after disablement.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use uuid::Uuid;

use crate::core::config::{AppConfig, GatekeeperStoreKind};
use crate::core::error::{ProxyError, Result};
use crate::core::families::ModelFamily;
use crate::core::metrics::TOKENS_CONSUMED;

pub const IP_LIMIT_DISABLED_REASON: &str = "IP address limit exceeded";
const TEMP_EXPIRED_REASON: &str = "Temporary token expired";

/// How long a disabled temporary user's record is retained before deletion.
fn disabled_temp_retention() -> ChronoDuration {
    ChronoDuration::hours(24)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    Normal,
    Special,
    Temporary,
}

impl UserType {
    /// Queue priority rank; smaller dispatches first.
    pub fn rank(&self) -> u8 {
        match self {
            UserType::Special => 0,
            UserType::Normal => 1,
            UserType::Temporary => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub token: String,
    /// Ordered set of IPs seen for this user, bounded by the configured cap.
    #[serde(default)]
    pub ip: Vec<String>,
    #[serde(rename = "type")]
    pub user_type: UserType,
    #[serde(default)]
    pub prompt_count: u64,
    #[serde(default)]
    pub token_counts: HashMap<ModelFamily, u64>,
    #[serde(default)]
    pub token_limits: HashMap<ModelFamily, u64>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Persistence backend for user records, stored under `users/<token>`.
#[async_trait]
pub trait GatekeeperStore: Send + Sync {
    async fn load_all(&self) -> anyhow::Result<Vec<User>>;
    async fn upsert(&self, users: &[User]) -> anyhow::Result<()>;
    async fn delete(&self, tokens: &[String]) -> anyhow::Result<()>;
}

/// Keeps records only for the lifetime of the process.
pub struct MemoryStore {
    records: RwLock<HashMap<String, User>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GatekeeperStore for MemoryStore {
    async fn load_all(&self) -> anyhow::Result<Vec<User>> {
        Ok(self.records.read().unwrap().values().cloned().collect())
    }

    async fn upsert(&self, users: &[User]) -> anyhow::Result<()> {
        let mut records = self.records.write().unwrap();
        for user in users {
            records.insert(user.token.clone(), user.clone());
        }
        Ok(())
    }

    async fn delete(&self, tokens: &[String]) -> anyhow::Result<()> {
        let mut records = self.records.write().unwrap();
        for token in tokens {
            records.remove(token);
        }
        Ok(())
    }
}

/// Firebase Realtime Database backend via its REST surface.
pub struct FirebaseRtdbStore {
    client: reqwest::Client,
    base_url: String,
    auth: Option<String>,
}

impl FirebaseRtdbStore {
    pub fn new(client: reqwest::Client, base_url: String, auth: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
        }
    }

    fn url(&self, path: &str) -> String {
        match &self.auth {
            Some(auth) => format!("{}/{}.json?auth={}", self.base_url, path, auth),
            None => format!("{}/{}.json", self.base_url, path),
        }
    }
}

#[async_trait]
impl GatekeeperStore for FirebaseRtdbStore {
    async fn load_all(&self) -> anyhow::Result<Vec<User>> {
        let response = self.client.get(self.url("users")).send().await?;
        let body: Option<HashMap<String, User>> = response.error_for_status()?.json().await?;
        Ok(body.map(|m| m.into_values().collect()).unwrap_or_default())
    }

    async fn upsert(&self, users: &[User]) -> anyhow::Result<()> {
        for user in users {
            self.client
                .put(self.url(&format!("users/{}", user.token)))
                .json(user)
                .send()
                .await?
                .error_for_status()?;
        }
        Ok(())
    }

    async fn delete(&self, tokens: &[String]) -> anyhow::Result<()> {
        for token in tokens {
            self.client
                .delete(self.url(&format!("users/{}", token)))
                .send()
                .await?
                .error_for_status()?;
        }
        Ok(())
    }
}

pub struct UserStore {
    users: RwLock<HashMap<String, User>>,
    dirty: RwLock<HashSet<String>>,
    pending_delete: RwLock<HashSet<String>>,
    store: Arc<dyn GatekeeperStore>,
    token_quota: HashMap<ModelFamily, u64>,
    max_ips_per_user: usize,
}

impl UserStore {
    pub fn new(config: &AppConfig, store: Arc<dyn GatekeeperStore>) -> Arc<Self> {
        Arc::new(Self {
            users: RwLock::new(HashMap::new()),
            dirty: RwLock::new(HashSet::new()),
            pending_delete: RwLock::new(HashSet::new()),
            store,
            token_quota: config.token_quota.clone(),
            max_ips_per_user: config.max_ips_per_user,
        })
    }

    /// Build the persistence backend named by the config.
    pub fn backend_from_config(
        config: &AppConfig,
        client: reqwest::Client,
    ) -> Arc<dyn GatekeeperStore> {
        match config.gatekeeper_store {
            GatekeeperStoreKind::Memory => Arc::new(MemoryStore::new()),
            GatekeeperStoreKind::FirebaseRtdb => Arc::new(FirebaseRtdbStore::new(
                client,
                config
                    .firebase_rtdb_url
                    .clone()
                    .expect("firebase_rtdb store requires FIREBASE_RTDB_URL"),
                config.firebase_key.clone(),
            )),
        }
    }

    /// Hydrate the in-memory map from the backend.
    pub async fn load(&self) -> anyhow::Result<usize> {
        let records = self.store.load_all().await?;
        let count = records.len();
        let mut users = self.users.write().unwrap();
        for user in records {
            users.insert(user.token.clone(), user);
        }
        tracing::info!(count, "loaded users from gatekeeper store");
        Ok(count)
    }

    /// Create a user with the configured default quota. Temporary users get
    /// an expiry; everyone else lives until disabled.
    pub fn create_user(&self, user_type: UserType, ttl: Option<Duration>) -> User {
        let now = Utc::now();
        let expires_at = match user_type {
            UserType::Temporary => Some(
                now + ChronoDuration::from_std(ttl.unwrap_or(Duration::from_secs(24 * 3600)))
                    .unwrap_or_else(|_| ChronoDuration::hours(24)),
            ),
            _ => None,
        };
        let user = User {
            token: Uuid::new_v4().to_string(),
            ip: vec![],
            user_type,
            prompt_count: 0,
            token_counts: HashMap::new(),
            token_limits: self.token_quota.clone(),
            created_at: now,
            last_used_at: None,
            disabled_at: None,
            disabled_reason: None,
            expires_at,
        };
        self.users
            .write()
            .unwrap()
            .insert(user.token.clone(), user.clone());
        self.mark_dirty(&user.token);
        user
    }

    /// Authenticate a token and record the caller's IP. Fails closed on
    /// unknown, disabled, or expired users; enforces the IP cap.
    pub fn authenticate(&self, token: &str, ip: &str) -> Result<User> {
        let mut users = self.users.write().unwrap();
        let user = users.get_mut(token).ok_or(ProxyError::Unauthorized)?;

        if user.disabled_at.is_some() {
            return Err(ProxyError::Unauthorized);
        }
        if let Some(expires_at) = user.expires_at {
            if expires_at < Utc::now() {
                user.disabled_at = Some(Utc::now());
                user.disabled_reason = Some(TEMP_EXPIRED_REASON.to_string());
                drop(users);
                self.mark_dirty(token);
                return Err(ProxyError::Unauthorized);
            }
        }

        if !user.ip.iter().any(|known| known == ip) {
            user.ip.push(ip.to_string());
            let over_cap = self.max_ips_per_user > 0
                && user.ip.len() > self.max_ips_per_user
                && user.user_type != UserType::Special;
            if over_cap {
                user.disabled_at = Some(Utc::now());
                user.disabled_reason = Some(IP_LIMIT_DISABLED_REASON.to_string());
                tracing::warn!(user = %token_preview(token), "user disabled: IP limit");
                drop(users);
                self.mark_dirty(token);
                return Err(ProxyError::Unauthorized);
            }
            drop(users);
            self.mark_dirty(token);
            return Ok(self.users.read().unwrap()[token].clone());
        }

        Ok(user.clone())
    }

    /// Check whether the user can spend `requested` tokens of `family`.
    /// A limit of 0 or an absent entry means unlimited.
    pub fn check_quota(&self, token: &str, family: ModelFamily, requested: u64) -> Result<()> {
        let users = self.users.read().unwrap();
        let user = users.get(token).ok_or(ProxyError::Unauthorized)?;
        let limit = user.token_limits.get(&family).copied().unwrap_or(0);
        if limit == 0 {
            return Ok(());
        }
        let used = user.token_counts.get(&family).copied().unwrap_or(0);
        if used.saturating_add(requested) > limit {
            return Err(ProxyError::QuotaExceeded {
                family,
                quota: limit,
                used,
                requested,
            });
        }
        Ok(())
    }

    /// Charge consumed tokens against the user.
    pub fn increment_usage(&self, token: &str, family: ModelFamily, tokens: u64) {
        let mut users = self.users.write().unwrap();
        if let Some(user) = users.get_mut(token) {
            user.prompt_count += 1;
            *user.token_counts.entry(family).or_default() += tokens;
            user.last_used_at = Some(Utc::now());
        }
        drop(users);
        TOKENS_CONSUMED
            .with_label_values(&[family.as_str()])
            .inc_by(tokens);
        self.mark_dirty(token);
    }

    pub fn disable_user(&self, token: &str, reason: &str) {
        let mut users = self.users.write().unwrap();
        if let Some(user) = users.get_mut(token) {
            if user.disabled_at.is_none() {
                user.disabled_at = Some(Utc::now());
                user.disabled_reason = Some(reason.to_string());
                tracing::warn!(user = %token_preview(token), reason, "user disabled");
            }
        }
        drop(users);
        self.mark_dirty(token);
    }

    pub fn get_user(&self, token: &str) -> Option<User> {
        self.users.read().unwrap().get(token).cloned()
    }

    pub fn list_users(&self) -> Vec<User> {
        self.users.read().unwrap().values().cloned().collect()
    }

    /// Admin upsert: replace or insert the record and flush immediately.
    pub async fn upsert_user(&self, user: User) -> anyhow::Result<()> {
        let token = user.token.clone();
        self.users.write().unwrap().insert(token.clone(), user);
        self.mark_dirty(&token);
        self.flush().await
    }

    /// Re-grant each family's configured quota on top of current consumption.
    /// Temporary users are skipped; their grant is fixed at creation.
    pub fn refresh_all_quotas(&self) {
        let mut refreshed = 0usize;
        let mut users = self.users.write().unwrap();
        let mut dirtied: Vec<String> = Vec::new();
        for user in users.values_mut() {
            if user.user_type == UserType::Temporary {
                continue;
            }
            for (family, quota) in &self.token_quota {
                let used = user.token_counts.get(family).copied().unwrap_or(0);
                user.token_limits.insert(*family, used + quota);
            }
            dirtied.push(user.token.clone());
            refreshed += 1;
        }
        drop(users);
        let mut dirty = self.dirty.write().unwrap();
        dirty.extend(dirtied);
        drop(dirty);
        tracing::info!(refreshed, "refreshed user quotas");
    }

    /// Disable expired temporary users; purge those disabled over 24h ago.
    /// Called by the minute tick.
    pub fn sweep_temporary_users(&self) {
        let now = Utc::now();
        let mut users = self.users.write().unwrap();
        let mut dirtied: Vec<String> = Vec::new();
        let mut purged: Vec<String> = Vec::new();

        for user in users.values_mut() {
            if user.user_type != UserType::Temporary {
                continue;
            }
            match (user.disabled_at, user.expires_at) {
                (None, Some(expires_at)) if expires_at < now => {
                    user.disabled_at = Some(now);
                    user.disabled_reason = Some(TEMP_EXPIRED_REASON.to_string());
                    dirtied.push(user.token.clone());
                }
                (Some(disabled_at), _) if now - disabled_at >= disabled_temp_retention() => {
                    purged.push(user.token.clone());
                }
                _ => {}
            }
        }
        for token in &purged {
            users.remove(token);
        }
        drop(users);

        if !dirtied.is_empty() || !purged.is_empty() {
            tracing::info!(
                expired = dirtied.len(),
                purged = purged.len(),
                "temporary user sweep"
            );
        }
        self.dirty.write().unwrap().extend(dirtied);
        let mut pending = self.pending_delete.write().unwrap();
        pending.extend(purged);
    }

    fn mark_dirty(&self, token: &str) {
        self.dirty.write().unwrap().insert(token.to_string());
    }

    /// Push dirty records and pending deletions to the backend as one batch.
    pub async fn flush(&self) -> anyhow::Result<()> {
        let dirty: Vec<String> = {
            let mut dirty = self.dirty.write().unwrap();
            dirty.drain().collect()
        };
        let deletes: Vec<String> = {
            let mut pending = self.pending_delete.write().unwrap();
            pending.drain().collect()
        };

        let upserts: Vec<User> = {
            let users = self.users.read().unwrap();
            dirty
                .iter()
                .filter_map(|token| users.get(token).cloned())
                .collect()
        };

        if !upserts.is_empty() {
            self.store.upsert(&upserts).await?;
        }
        if !deletes.is_empty() {
            self.store.delete(&deletes).await?;
        }
        Ok(())
    }

    /// Flush dirty records on the configured interval, forever.
    pub fn spawn_flush_loop(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = store.flush().await {
                    tracing::error!(error = %e, "user store flush failed");
                }
            }
        })
    }

    /// Minute tick for temporary-user expiry, plus the quota refresh
    /// schedule when one is configured.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        quota_refresh_secs: Option<u64>,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(Duration::from_secs(60));
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick of an interval fires immediately; consume it so the
            // sweep starts one period out.
            sweep.tick().await;

            let mut refresh = quota_refresh_secs.map(|secs| {
                let mut ticker = tokio::time::interval(Duration::from_secs(secs));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker
            });

            loop {
                match refresh.as_mut() {
                    Some(refresh_ticker) => {
                        tokio::select! {
                            _ = sweep.tick() => store.sweep_temporary_users(),
                            _ = refresh_ticker.tick() => store.refresh_all_quotas(),
                        }
                    }
                    None => {
                        sweep.tick().await;
                        store.sweep_temporary_users();
                    }
                }
            }
        })
    }
}

fn token_preview(token: &str) -> String {
    token.chars().take(8).collect()
}
