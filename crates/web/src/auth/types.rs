//! Core types for the session gateway.

use serde::{Deserialize, Serialize};

/// Opaque session token, carried in the session cookie
pub type SessionToken = String;

/// A logged-in dashboard user
#[derive(Debug, Clone)]
pub struct Session {
    pub token: SessionToken,
    pub user: String,
    pub created_at: i64,
    pub expires_at: i64,
}

impl Session {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

/// Body of `POST /login`
#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Reply to `POST /login` and `POST /logout`
#[derive(Debug, Clone, Serialize)]
pub struct LoginResponse {
    pub success: bool,
}
