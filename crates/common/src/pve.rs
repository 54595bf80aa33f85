//! Proxmox VE management API client
//!
//! Implements the small slice of the `/api2/json` surface the dashboard and
//! console relay need: node and guest inventory, power control, and VNC
//! ticket issuance. The client is cheap to share behind an `Arc` and safe to
//! call from many relay pairings at once.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::types::{parse_tags, ConsoleTicket, NodeInfo, PowerAction, VmId, VmStatus, VmSummary};

/// Proxmox tickets are valid for two hours; renew well before that.
const TICKET_REFRESH_AFTER: Duration = Duration::from_secs(90 * 60);

/// Name of the Proxmox session cookie.
const AUTH_COOKIE: &str = "PVEAuthCookie";

/// Credentials used against the management API.
#[derive(Clone)]
pub enum PveCredentials {
    /// `user@realm` plus password, exchanged for a ticket at `/access/ticket`.
    Password { user: String, password: String },
    /// API token: `token_id` is `user@realm!name`.
    Token { token_id: String, secret: String },
}

impl std::fmt::Debug for PveCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PveCredentials::Password { user, .. } => {
                f.debug_struct("Password").field("user", user).finish_non_exhaustive()
            }
            PveCredentials::Token { token_id, .. } => {
                f.debug_struct("Token").field("token_id", token_id).finish_non_exhaustive()
            }
        }
    }
}

/// Connection settings for [`PveClient`].
#[derive(Debug, Clone)]
pub struct PveConfig {
    /// Base URL of the cluster, e.g. `https://pve.example:8006`
    pub url: String,
    pub credentials: PveCredentials,
    /// Verify the server certificate. Stock Proxmox installs are self-signed.
    pub verify_tls: bool,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// Everything needed to open the upstream console websocket.
#[derive(Debug, Clone)]
pub struct ConsoleEndpoint {
    pub url: Url,
    /// Extra request headers (authorization) for the upgrade request.
    pub headers: Vec<(String, String)>,
    /// Same certificate policy as the management API.
    pub verify_tls: bool,
}

/// Operations consumed from the hypervisor management API.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>>;

    async fn list_vms(&self, node: &str) -> Result<Vec<VmSummary>>;

    async fn vm_status(&self, node: &str, vmid: VmId) -> Result<VmStatus>;

    async fn power(&self, node: &str, vmid: VmId, action: PowerAction) -> Result<()>;

    /// Issue a single-use VNC ticket for a guest.
    async fn console_ticket(&self, node: &str, vmid: VmId) -> Result<ConsoleTicket>;

    /// Build the upstream websocket target for an issued ticket.
    async fn console_endpoint(
        &self,
        node: &str,
        vmid: VmId,
        ticket: &ConsoleTicket,
    ) -> Result<ConsoleEndpoint>;

    /// Every guest on every node.
    async fn list_all_vms(&self) -> Result<Vec<VmSummary>> {
        let mut vms = Vec::new();
        for node in self.list_nodes().await? {
            vms.extend(self.list_vms(&node.node).await?);
        }
        Ok(vms)
    }

    /// Find a guest by its display name, searching nodes in listing order.
    async fn find_vm_by_name(&self, name: &str) -> Result<VmSummary> {
        for node in self.list_nodes().await? {
            let vms = self.list_vms(&node.node).await?;
            if let Some(vm) = vms.into_iter().find(|vm| vm.name == name) {
                return Ok(vm);
            }
        }
        Err(Error::not_found("vm", name))
    }

    /// Confirm that `vmid` exists on `node`.
    async fn locate(&self, node: &str, vmid: VmId) -> Result<VmSummary> {
        let nodes = self.list_nodes().await?;
        if !nodes.iter().any(|n| n.node == node) {
            return Err(Error::not_found("node", node));
        }
        self.list_vms(node)
            .await?
            .into_iter()
            .find(|vm| vm.vmid == vmid)
            .ok_or_else(|| Error::not_found("vm", format!("{}/{}", node, vmid)))
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct TicketResponse {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: String,
}

#[derive(Deserialize)]
struct RawVm {
    vmid: VmId,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    tags: Option<String>,
}

impl RawVm {
    fn into_summary(self, node: &str) -> VmSummary {
        VmSummary {
            node: node.to_string(),
            name: self.name.unwrap_or_else(|| format!("vm-{}", self.vmid)),
            vmid: self.vmid,
            status: self.status,
            tags: self.tags.as_deref().map(parse_tags).unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
struct RawStatus {
    #[serde(default)]
    status: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct RawVncProxy {
    #[serde(deserialize_with = "port_from_any")]
    port: u16,
    ticket: String,
}

/// `vncproxy` reports the port as a string on some releases and a number on others.
fn port_from_any<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(n) => Ok(n),
        Port::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

struct PveSession {
    ticket: String,
    csrf_token: String,
    issued_at: Instant,
}

/// Resolved credential for a single request.
enum ApiAuth {
    Token(String),
    Ticket { ticket: String, csrf_token: String },
}

impl ApiAuth {
    fn apply(&self, req: RequestBuilder, write: bool) -> RequestBuilder {
        match self {
            ApiAuth::Token(value) => req.header(reqwest::header::AUTHORIZATION, value),
            ApiAuth::Ticket { ticket, csrf_token } => {
                let req = req.header(reqwest::header::COOKIE, format!("{}={}", AUTH_COOKIE, ticket));
                if write {
                    req.header("CSRFPreventionToken", csrf_token)
                } else {
                    req
                }
            }
        }
    }

    fn upgrade_headers(&self) -> Vec<(String, String)> {
        match self {
            ApiAuth::Token(value) => vec![("Authorization".to_string(), value.clone())],
            ApiAuth::Ticket { ticket, .. } => vec![
                ("Cookie".to_string(), format!("{}={}", AUTH_COOKIE, ticket)),
                ("Authorization".to_string(), format!("{}={}", AUTH_COOKIE, ticket)),
            ],
        }
    }
}

/// HTTPS client for a Proxmox VE cluster.
pub struct PveClient {
    http: reqwest::Client,
    base: Url,
    cfg: PveConfig,
    session: Mutex<Option<PveSession>>,
}

impl PveClient {
    /// Create a client. No request is made until the first call.
    pub fn new(cfg: PveConfig) -> Result<Self> {
        let mut base = Url::parse(&cfg.url)?;
        if base.cannot_be_a_base() || !matches!(base.scheme(), "https" | "http") {
            return Err(Error::InvalidConfig(format!(
                "hypervisor URL must be http(s): {}",
                cfg.url
            )));
        }
        let prefix = base.path().trim_end_matches('/').to_string();
        base.set_path(&format!("{}/api2/json", prefix));
        base.set_query(None);

        if !cfg.verify_tls {
            warn!("TLS certificate verification disabled for {}", base);
        }

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!cfg.verify_tls)
            .timeout(cfg.timeout)
            .build()?;

        Ok(Self {
            http,
            base,
            cfg,
            session: Mutex::new(None),
        })
    }

    /// Base API URL (`.../api2/json`).
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InvalidConfig("hypervisor URL cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn qemu_endpoint(&self, node: &str, vmid: VmId, tail: &[&str]) -> Result<Url> {
        let vmid = vmid.to_string();
        let mut segments = vec!["nodes", node, "qemu", vmid.as_str()];
        segments.extend_from_slice(tail);
        self.endpoint(&segments)
    }

    async fn auth(&self) -> Result<ApiAuth> {
        let (user, password) = match &self.cfg.credentials {
            PveCredentials::Token { token_id, secret } => {
                return Ok(ApiAuth::Token(format!("PVEAPIToken={}={}", token_id, secret)));
            }
            PveCredentials::Password { user, password } => (user, password),
        };

        // Held across the login so concurrent callers share one ticket request.
        let mut session = self.session.lock().await;
        if let Some(s) = session.as_ref() {
            if s.issued_at.elapsed() < TICKET_REFRESH_AFTER {
                return Ok(ApiAuth::Ticket {
                    ticket: s.ticket.clone(),
                    csrf_token: s.csrf_token.clone(),
                });
            }
            debug!("Proxmox ticket for {} aged out, renewing", user);
        }

        let url = self.endpoint(&["access", "ticket"])?;
        let req = self
            .http
            .post(url)
            .form(&[("username", user.as_str()), ("password", password.as_str())]);
        let issued: TicketResponse = self.send(req).await.map_err(|e| match e {
            Error::Auth(_) | Error::Api { .. } => Error::Auth(format!("login as {} rejected", user)),
            other => other,
        })?;

        info!("Authenticated to Proxmox as {}", user);
        let auth = ApiAuth::Ticket {
            ticket: issued.ticket.clone(),
            csrf_token: issued.csrf_token.clone(),
        };
        *session = Some(PveSession {
            ticket: issued.ticket,
            csrf_token: issued.csrf_token,
            issued_at: Instant::now(),
        });
        Ok(auth)
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            let envelope: Envelope<T> = resp.json().await?;
            return Ok(envelope.data);
        }

        let url = resp.url().path().to_string();
        let body = resp.text().await.unwrap_or_default();
        let message = if body.trim().is_empty() {
            status.canonical_reason().unwrap_or("request failed").to_string()
        } else {
            body
        };

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::Auth(message)),
            StatusCode::NOT_FOUND => Err(Error::not_found("endpoint", url)),
            _ => Err(Error::Api {
                status: status.as_u16(),
                message,
            }),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        form: Option<&[(&str, &str)]>,
    ) -> Result<T> {
        let write = method != Method::GET;
        let auth = self.auth().await?;
        debug!("{} {}", method, url.path());
        let mut req = auth.apply(self.http.request(method, url), write);
        if let Some(form) = form {
            req = req.form(form);
        }
        match self.send(req).await {
            Err(Error::Auth(message)) => {
                // Force a fresh login on the next call.
                *self.session.lock().await = None;
                Err(Error::Auth(message))
            }
            Err(Error::Http(err)) if err.is_timeout() => Err(Error::Timeout {
                seconds: self.cfg.timeout.as_secs(),
            }),
            other => other,
        }
    }
}

#[async_trait]
impl Hypervisor for PveClient {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        let url = self.endpoint(&["nodes"])?;
        self.call(Method::GET, url, None).await
    }

    async fn list_vms(&self, node: &str) -> Result<Vec<VmSummary>> {
        let url = self.endpoint(&["nodes", node, "qemu"])?;
        let raw: Vec<RawVm> = self.call(Method::GET, url, None).await?;
        Ok(raw.into_iter().map(|vm| vm.into_summary(node)).collect())
    }

    async fn vm_status(&self, node: &str, vmid: VmId) -> Result<VmStatus> {
        let url = self.qemu_endpoint(node, vmid, &["status", "current"])?;
        let raw: RawStatus = self.call(Method::GET, url, None).await?;
        Ok(VmStatus {
            vmid,
            status: raw.status,
            name: raw.name,
        })
    }

    async fn power(&self, node: &str, vmid: VmId, action: PowerAction) -> Result<()> {
        let url = self.qemu_endpoint(node, vmid, &["status", action.api_command()])?;
        let upid: serde_json::Value = self.call(Method::POST, url, None).await?;
        info!("{} {}/{} -> {}", action, node, vmid, upid);
        Ok(())
    }

    async fn console_ticket(&self, node: &str, vmid: VmId) -> Result<ConsoleTicket> {
        let url = self.qemu_endpoint(node, vmid, &["vncproxy"])?;
        let raw: RawVncProxy = self
            .call(Method::POST, url, Some(&[("websocket", "1")]))
            .await?;
        debug!("Issued VNC ticket for {}/{} on port {}", node, vmid, raw.port);
        Ok(ConsoleTicket {
            port: raw.port,
            ticket: raw.ticket,
        })
    }

    async fn console_endpoint(
        &self,
        node: &str,
        vmid: VmId,
        ticket: &ConsoleTicket,
    ) -> Result<ConsoleEndpoint> {
        let mut url = self.qemu_endpoint(node, vmid, &["vncwebsocket"])?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| Error::Internal(format!("cannot switch {} to {}", url, scheme)))?;
        url.query_pairs_mut()
            .append_pair("port", &ticket.port.to_string())
            .append_pair("vncticket", &ticket.ticket);

        let auth = self.auth().await?;
        Ok(ConsoleEndpoint {
            url,
            headers: auth.upgrade_headers(),
            verify_tls: self.cfg.verify_tls,
        })
    }
}
