//! In-memory sessions and the account table.

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::types::{Session, SessionToken};
use crate::config::UserEntry;

/// SHA-256 hex digest of a password, the form stored in `[[users]]`.
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut v: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        v |= x ^ y;
    }
    v == 0
}

/// Accounts allowed to log in to the dashboard.
#[derive(Debug, Clone, Default)]
pub struct UserTable {
    digests: HashMap<String, String>,
}

impl UserTable {
    pub fn new(entries: &[UserEntry]) -> Self {
        let digests = entries
            .iter()
            .map(|u| (u.name.clone(), u.password_sha256.to_ascii_lowercase()))
            .collect();
        Self { digests }
    }

    /// Check a username/password pair.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        // Hash even for unknown users so both paths cost the same.
        let candidate = hash_password(password);
        match self.digests.get(username) {
            Some(expected) => constant_time_eq(expected.as_bytes(), candidate.as_bytes()),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}

/// Live login sessions, keyed by token.
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionToken, Session>>,
    ttl_secs: i64,
}

impl SessionStore {
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl_secs,
        }
    }

    /// Open a session for `user` and return it.
    pub async fn create(&self, user: &str) -> Session {
        let now = Utc::now().timestamp();
        let session = Session {
            token: hex::encode(rand::random::<[u8; 32]>()),
            user: user.to_string(),
            created_at: now,
            expires_at: now + self.ttl_secs,
        };

        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(now));
        if sessions.len() != before {
            debug!("Purged {} expired sessions", before - sessions.len());
        }
        sessions.insert(session.token.clone(), session.clone());
        info!("Session opened for {}", user);
        session
    }

    /// Resolve a token to its live session. Expired sessions are dropped.
    pub async fn get(&self, token: &str) -> Option<Session> {
        let now = Utc::now().timestamp();
        {
            let sessions = self.sessions.read().await;
            match sessions.get(token) {
                Some(s) if !s.is_expired(now) => return Some(s.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(s) = sessions.remove(token) {
            debug!("Session for {} expired", s.user);
        }
        None
    }

    /// Whether `token` names a live session. The relay re-checks this once
    /// the console socket is upgraded.
    pub async fn is_authenticated(&self, token: Option<&str>) -> bool {
        match token {
            Some(t) => self.get(t).await.is_some(),
            None => false,
        }
    }

    /// Destroy a session. Returns the user it belonged to.
    pub async fn remove(&self, token: &str) -> Option<String> {
        let removed = self.sessions.write().await.remove(token)?;
        info!("Session closed for {}", removed.user);
        Some(removed.user)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}
