use std::sync::Arc;

use axum::http::HeaderMap;
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::Duration;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{
    error::AppError,
    repository::SiteRepository,
    timestamp,
    types::{UserProfile, UserRecord},
};

pub fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub token: String,
    pub user: UserProfile,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

/// Admin sign-in. Tokens are handed out once and only their hash is stored.
#[derive(Clone)]
pub struct AuthService {
    records: Arc<dyn SiteRepository>,
    token_ttl: Duration,
}

impl AuthService {
    pub fn new(records: Arc<dyn SiteRepository>, token_ttl_hours: i64) -> Self {
        Self {
            records,
            token_ttl: Duration::hours(token_ttl_hours),
        }
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Session, AppError> {
        let email = normalize_email(email);
        let Some(user) = self.records.find_user_by_email(&email).await? else {
            tracing::warn!(email = %email, "login for unknown account");
            return Err(AppError::Unauthorized("invalid credentials"));
        };
        if !verify(password, &user.password_hash).unwrap_or(false) {
            tracing::warn!(email = %email, "login with wrong password");
            return Err(AppError::Unauthorized("invalid credentials"));
        }

        let token = Uuid::new_v4().to_string();
        let expires_at = timestamp::now() + self.token_ttl;
        self.records
            .store_admin_token(&sha256_hex(&token), &user.profile.id, expires_at)
            .await?;
        tracing::info!(user_id = %user.profile.id, "admin signed in");
        Ok(Session {
            token,
            user: user.profile,
            expires_at,
        })
    }

    pub async fn verify_token(&self, token: &str) -> Result<UserProfile, AppError> {
        self.records
            .user_for_token(&sha256_hex(token), timestamp::now())
            .await?
            .ok_or(AppError::Unauthorized("invalid token"))
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<UserProfile, AppError> {
        let token = bearer_token(headers).ok_or(AppError::Unauthorized("missing bearer token"))?;
        self.verify_token(&token).await
    }

    /// Creates or updates the configured admin account.
    pub async fn seed_admin(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> Result<UserProfile, AppError> {
        self.seed_admin_with_cost(email, password, display_name, DEFAULT_COST)
            .await
    }

    pub async fn seed_admin_with_cost(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
        cost: u32,
    ) -> Result<UserProfile, AppError> {
        let email = normalize_email(email);
        if email.is_empty() || password.is_empty() {
            return Err(AppError::bad_request("admin email and password are required"));
        }
        let id = match self.records.find_user_by_email(&email).await? {
            Some(existing) => existing.profile.id,
            None => Uuid::new_v4().to_string(),
        };
        let profile = UserProfile {
            id,
            email,
            display_name: display_name.to_string(),
        };
        self.records
            .upsert_user(&UserRecord {
                profile: profile.clone(),
                password_hash: hash(password, cost)?,
            })
            .await?;
        tracing::info!(email = %profile.email, "admin account ready");
        Ok(profile)
    }
}
