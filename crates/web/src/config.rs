//! Dashboard configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use vmdeck_common::{PveConfig, PveCredentials};

/// Top-level configuration, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP listen address
    pub listen: String,

    /// Hypervisor connection
    pub proxmox: ProxmoxConfig,

    /// Login sessions
    pub session: SessionConfig,

    /// Console relay
    pub relay: RelayConfig,

    /// Dashboard accounts
    pub users: Vec<UserEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5000".to_string(),
            proxmox: ProxmoxConfig::default(),
            session: SessionConfig::default(),
            relay: RelayConfig::default(),
            users: Vec::new(),
        }
    }
}

/// Proxmox VE connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxmoxConfig {
    /// Cluster URL, e.g. `https://pve.example:8006`. A bare host gets
    /// `https://` and port 8006.
    pub url: String,

    /// `user@realm` for password logins
    pub user: Option<String>,
    pub password: Option<String>,

    /// API token id (`user@realm!name`) and secret, preferred over a password
    pub token_id: Option<String>,
    pub token_secret: Option<String>,

    /// Verify the hypervisor's TLS certificate
    pub verify_tls: bool,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for ProxmoxConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            user: None,
            password: None,
            token_id: None,
            token_secret: None,
            verify_tls: false,
            timeout_secs: 15,
        }
    }
}

/// Session cookie settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Session lifetime in seconds
    pub ttl_secs: i64,

    /// Mark the cookie `Secure` (HTTPS only)
    pub cookie_secure: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 12 * 60 * 60,
            cookie_secure: true,
        }
    }
}

/// Console relay limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Upper bound on opening the upstream console socket
    pub connect_timeout_secs: u64,

    /// Close a console after this long without data in either direction (0 = never)
    pub idle_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            idle_timeout_secs: 30 * 60,
        }
    }
}

impl RelayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

/// A dashboard account. Passwords are stored as SHA-256 hex digests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub name: String,
    pub password_sha256: String,
}

impl Config {
    /// Load configuration from file, falling back to defaults if it is absent
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply environment overrides (`PROXMOX_*`, `VMDECK_LISTEN`)
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("VMDECK_LISTEN") {
            self.listen = v;
        }
        if let Some(v) = var("PROXMOX_SERVER") {
            self.proxmox.url = v;
        }
        if let Some(v) = var("PROXMOX_USER") {
            self.proxmox.user = Some(v);
        }
        if let Some(v) = var("PROXMOX_PASSWORD") {
            self.proxmox.password = Some(v);
        }
        if let Some(v) = var("PROXMOX_TOKEN_ID") {
            self.proxmox.token_id = Some(v);
        }
        if let Some(v) = var("PROXMOX_TOKEN_SECRET") {
            self.proxmox.token_secret = Some(v);
        }
        if let Some(v) = var("PROXMOX_VERIFY_TLS") {
            self.proxmox.verify_tls = matches!(v.trim(), "1" | "true" | "yes");
        }
    }

    /// Reject configurations the server cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.proxmox.url.trim().is_empty() {
            anyhow::bail!("proxmox.url (or PROXMOX_SERVER) is required");
        }
        self.proxmox.credentials()?;
        if self.users.is_empty() {
            anyhow::bail!("at least one [[users]] entry is required");
        }
        for user in &self.users {
            if user.password_sha256.len() != 64 || hex::decode(&user.password_sha256).is_err() {
                anyhow::bail!("user {}: password_sha256 must be a 64 character hex digest", user.name);
            }
        }
        if self.session.ttl_secs <= 0 {
            anyhow::bail!("session.ttl_secs must be positive");
        }
        Ok(())
    }
}

impl ProxmoxConfig {
    fn credentials(&self) -> anyhow::Result<PveCredentials> {
        if let (Some(token_id), Some(secret)) = (&self.token_id, &self.token_secret) {
            return Ok(PveCredentials::Token {
                token_id: token_id.clone(),
                secret: secret.clone(),
            });
        }
        match (&self.user, &self.password) {
            (Some(user), Some(password)) => Ok(PveCredentials::Password {
                user: user.clone(),
                password: password.clone(),
            }),
            _ => anyhow::bail!("proxmox credentials missing: set token_id/token_secret or user/password"),
        }
    }

    /// Normalized cluster URL
    pub fn base_url(&self) -> String {
        let url = self.url.trim().trim_end_matches('/');
        if url.contains("://") {
            url.to_string()
        } else if url.contains(':') {
            format!("https://{}", url)
        } else {
            format!("https://{}:8006", url)
        }
    }

    /// Build the API client settings
    pub fn to_pve_config(&self) -> anyhow::Result<PveConfig> {
        Ok(PveConfig {
            url: self.base_url(),
            credentials: self.credentials()?,
            verify_tls: self.verify_tls,
            timeout: Duration::from_secs(self.timeout_secs),
        })
    }
}
