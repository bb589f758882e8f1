//! Minimal admin API: user management and key visibility.
//!
//! Guarded by the `ADMIN_KEY` bearer secret; with no admin key configured
//! the whole surface is closed. No UI, no sessions.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::api::auth::extract_token;
use crate::api::AppState;
use crate::core::error::{ProxyError, Result};
use crate::services::user_store::{User, UserType};

pub fn admin_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/users", get(list_users).post(create_user))
        .route("/users/:token", get(get_user).put(upsert_user))
        .route("/keys", get(list_keys))
        .route("/refresh-quotas", post(refresh_quotas))
}

fn check_admin(state: &AppState, headers: &HeaderMap) -> Result<()> {
    let Some(admin_key) = state.config.admin_key.as_deref() else {
        return Err(ProxyError::Unauthorized);
    };
    match extract_token(headers) {
        Some(token) if token == admin_key => Ok(()),
        _ => Err(ProxyError::Unauthorized),
    }
}

async fn list_users(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(err) = check_admin(&state, &headers) {
        return err.into_response();
    }
    Json(json!({"users": state.user_store.list_users()})).into_response()
}

#[derive(Debug, Deserialize)]
struct CreateUserRequest {
    #[serde(rename = "type", default = "default_user_type")]
    user_type: UserType,
    /// Lifetime for temporary users, in seconds.
    ttl_secs: Option<u64>,
}

fn default_user_type() -> UserType {
    UserType::Normal
}

async fn create_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CreateUserRequest>,
) -> Response {
    if let Err(err) = check_admin(&state, &headers) {
        return err.into_response();
    }
    let ttl = request.ttl_secs.map(Duration::from_secs);
    let user = state.user_store.create_user(request.user_type, ttl);
    Json(json!({"user": user})).into_response()
}

async fn get_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> Response {
    if let Err(err) = check_admin(&state, &headers) {
        return err.into_response();
    }
    match state.user_store.get_user(&token) {
        Some(user) => Json(json!({"user": user})).into_response(),
        None => ProxyError::Validation {
            message: "no such user".to_string(),
            issues: vec![],
        }
        .into_response(),
    }
}

async fn upsert_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(token): Path<String>,
    Json(mut user): Json<User>,
) -> Response {
    if let Err(err) = check_admin(&state, &headers) {
        return err.into_response();
    }
    user.token = token;
    match state.user_store.upsert_user(user).await {
        Ok(()) => Json(json!({"ok": true})).into_response(),
        Err(e) => ProxyError::Internal(e.to_string()).into_response(),
    }
}

async fn list_keys(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(err) = check_admin(&state, &headers) {
        return err.into_response();
    }
    Json(json!({"keys": state.key_pool.list()})).into_response()
}

async fn refresh_quotas(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(err) = check_admin(&state, &headers) {
        return err.into_response();
    }
    state.user_store.refresh_all_quotas();
    Json(json!({"ok": true})).into_response()
}
