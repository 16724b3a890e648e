//! Password hashing and the encrypted session cookie.
//!
//! Passwords are stored as bcrypt hashes. Session cookies carry the claims
//! as JSON sealed with AES-256-GCM: `base64url(nonce || ciphertext || tag)`.
//! The key is derived from the configured session secret with
//! PBKDF2-HMAC-SHA256.

use aes_gcm::aead::{rand_core::RngCore, Aead, OsRng};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use anyhow::{anyhow, Result};
use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts};
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64_URL;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;

use crate::error::AppError;
use crate::server::AppState;
use crate::types::{Role, User};

pub const SESSION_COOKIE: &str = "bitacora_session";

/// Session lifetime (8 hours)
pub const SESSION_TTL_SECS: i64 = 8 * 60 * 60;

#[cfg(not(test))]
const HASH_COST: u32 = 12;
#[cfg(test)]
const HASH_COST: u32 = 4;

#[cfg(not(test))]
const SESSION_KEY_ITERATIONS: u32 = 100_000;
#[cfg(test)]
const SESSION_KEY_ITERATIONS: u32 = 1_000;
const SESSION_KEY_SALT: &[u8] = b"bitacora-session-v1";
const NONCE_LEN: usize = 12;

fn derive_key(secret: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(secret, salt, iterations, &mut key);
    key
}

/// Hash a password with bcrypt
pub fn hash_password(password: &str) -> Result<String> {
    bcrypt::hash(password, HASH_COST).map_err(|e| anyhow!("Failed to hash password: {}", e))
}

/// Check a password against a stored hash. Malformed hashes never match.
pub fn verify_password(password: &str, stored: &str) -> bool {
    bcrypt::verify(password, stored).unwrap_or(false)
}

/// What the session cookie proves about the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub user_id: String,
    pub username: String,
    pub role: Role,
    /// Unix timestamp (seconds)
    pub expires_at: i64,
}

impl SessionClaims {
    pub fn for_user(user: &User, now: i64) -> Self {
        Self {
            user_id: user.id.clone(),
            username: user.username.clone(),
            role: user.role,
            expires_at: now + SESSION_TTL_SECS,
        }
    }
}

/// AES-256-GCM key for sealing session cookies
#[derive(Clone)]
pub struct SessionKey {
    key: [u8; 32],
}

impl SessionKey {
    pub fn derive(secret: &str) -> Self {
        Self {
            key: derive_key(secret.as_bytes(), SESSION_KEY_SALT, SESSION_KEY_ITERATIONS),
        }
    }

    /// Key that only lives as long as the process
    pub fn random() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|e| anyhow!("invalid session key: {}", e))
    }

    /// Encrypt claims into a cookie value
    pub fn seal(&self, claims: &SessionClaims) -> Result<String> {
        let plaintext = serde_json::to_vec(claims)?;

        let mut iv = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut iv);
        let encrypted = self
            .cipher()?
            .encrypt(Nonce::from_slice(&iv), plaintext.as_slice())
            .map_err(|e| anyhow!("session encryption failed: {}", e))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + encrypted.len());
        sealed.extend_from_slice(&iv);
        sealed.extend_from_slice(&encrypted);
        Ok(B64_URL.encode(sealed))
    }

    /// Decrypt a cookie value. Tampered, foreign or expired cookies yield `None`.
    pub fn open(&self, value: &str, now: i64) -> Option<SessionClaims> {
        let sealed = B64_URL.decode(value.trim()).ok()?;
        if sealed.len() <= NONCE_LEN {
            return None;
        }
        let (iv, encrypted) = sealed.split_at(NONCE_LEN);

        let plaintext = self
            .cipher()
            .ok()?
            .decrypt(Nonce::from_slice(iv), encrypted)
            .ok()?;
        let claims: SessionClaims = serde_json::from_slice(&plaintext).ok()?;

        (claims.expires_at > now).then_some(claims)
    }
}

/// `Set-Cookie` value carrying a session
pub fn session_cookie(value: &str) -> String {
    format!(
        "{}={}; HttpOnly; SameSite=Lax; Path=/; Max-Age={}",
        SESSION_COOKIE, value, SESSION_TTL_SECS
    )
}

/// `Set-Cookie` value that removes the session
pub fn clear_session_cookie() -> String {
    format!("{}=; HttpOnly; SameSite=Lax; Path=/; Max-Age=0", SESSION_COOKIE)
}

/// Value of a cookie in a `Cookie` request header
pub fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key.trim() == name).then(|| value.trim())
    })
}

/// The logged-in user, reloaded from the user store on every request
pub struct CurrentUser(pub User);

impl FromRequestParts<Arc<AppState>> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let now = chrono::Utc::now().timestamp();
        let claims = parts
            .headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|h| h.to_str().ok())
            .find_map(|h| cookie_value(h, SESSION_COOKIE))
            .and_then(|value| state.session_key.open(value, now))
            .ok_or(AppError::Unauthorized)?;

        // Deleted accounts lose access immediately
        let user = state
            .users
            .get(&claims.user_id)?
            .ok_or(AppError::Unauthorized)?;

        Ok(CurrentUser(user))
    }
}

/// A logged-in user with the admin role
pub struct AdminUser(pub User);

impl FromRequestParts<Arc<AppState>> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let CurrentUser(user) = CurrentUser::from_request_parts(parts, state).await?;
        if !user.is_admin() {
            tracing::warn!(username = %user.username, "Admin route refused");
            return Err(AppError::Forbidden);
        }
        Ok(AdminUser(user))
    }
}
