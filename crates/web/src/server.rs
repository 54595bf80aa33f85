//! Web server implementation

use crate::auth::{
    middleware::{expired_session_cookie, session_cookie, session_token},
    require_auth, AuthenticatedUser, LoginRequest, LoginResponse, SessionStore, UserTable,
};
use crate::config::Config;
use crate::relay::{ConsoleRelay, RelayTarget, CONSOLE_SUBPROTOCOL};
use crate::static_files::StaticFiles;
use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use vmdeck_common::{Error as PveError, Hypervisor, PowerAction, PveClient, VmSummary};

/// Web server state
#[derive(Clone)]
pub struct WebServer {
    state: Arc<WebServerState>,
}

struct WebServerState {
    hypervisor: Arc<dyn Hypervisor>,
    relay: ConsoleRelay,
    sessions: Arc<SessionStore>,
    users: UserTable,
    cookie_secure: bool,
    static_files: StaticFiles,
}

/// Connect to the configured cluster and serve until the listener fails.
pub async fn serve(addr: SocketAddr, cfg: Config) -> anyhow::Result<()> {
    let pve = PveClient::new(cfg.proxmox.to_pve_config()?)?;
    info!("Using Proxmox API at {}", pve.base_url());
    let server = WebServer::new(&cfg, Arc::new(pve));
    server.serve(addr).await
}

impl WebServer {
    /// Create a new web server
    pub fn new(cfg: &Config, hypervisor: Arc<dyn Hypervisor>) -> Self {
        let sessions = Arc::new(SessionStore::new(cfg.session.ttl_secs));
        Self {
            state: Arc::new(WebServerState {
                relay: ConsoleRelay::new(hypervisor.clone(), sessions.clone(), &cfg.relay),
                hypervisor,
                sessions,
                users: UserTable::new(&cfg.users),
                cookie_secure: cfg.session.cookie_secure,
                static_files: StaticFiles::new(),
            }),
        }
    }

    /// Create router
    pub fn router(&self) -> Router {
        let sessions = self.state.sessions.clone();
        let auth_layer = middleware::from_fn(move |req, next| {
            let sessions = sessions.clone();
            async move { require_auth(sessions, req, next).await }
        });

        // Protected routes (require a dashboard session)
        let protected_routes = Router::new()
            .route("/vms", get(vms_handler))
            .route("/control_vm", post(control_vm_handler))
            .route("/console/:node/:vmid", get(console_handler))
            .route("/relay/:node/:vmid", get(relay_handler))
            .layer(auth_layer);

        Router::new()
            .route("/", get(index_handler))
            .route("/static/*path", get(static_handler))
            .route("/login", post(login_handler))
            .route("/logout", post(logout_handler))
            .route("/api/health", get(health_handler))
            .merge(protected_routes)
            .fallback(not_found_handler)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Start the web server
    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        info!("vmdeck listening on http://{}", listener.local_addr()?);
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

// ============================================================================
// Responses
// ============================================================================

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({"error": message.into()}))).into_response()
}

#[derive(Debug, Serialize)]
struct VmListResponse {
    vms: Vec<VmSummary>,
    user: String,
}

#[derive(Debug, Deserialize)]
struct ControlRequest {
    #[serde(default)]
    vm: String,
    #[serde(default)]
    action: String,
}

#[derive(Debug, Serialize)]
struct ControlResponse {
    name: String,
    status: String,
}

#[derive(Debug, Serialize)]
struct ConsoleInfo {
    node: String,
    vmid: u32,
    name: String,
    websocket_path: String,
}

// ============================================================================
// Handlers
// ============================================================================

async fn index_handler(State(state): State<Arc<WebServerState>>) -> Response {
    state.static_files.index()
}

async fn static_handler(State(state): State<Arc<WebServerState>>, Path(path): Path<String>) -> Response {
    state.static_files.serve(&path)
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "ok": true,
        "version": vmdeck_common::VERSION,
    }))
}

async fn not_found_handler() -> Response {
    json_error(StatusCode::NOT_FOUND, "Not found")
}

async fn login_handler(
    State(state): State<Arc<WebServerState>>,
    jar: CookieJar,
    Json(req): Json<LoginRequest>,
) -> Response {
    if !state.users.verify(&req.username, &req.password) {
        warn!("Failed login for {:?}", req.username);
        return (
            StatusCode::UNAUTHORIZED,
            Json(LoginResponse { success: false }),
        )
            .into_response();
    }

    let session = state.sessions.create(&req.username).await;
    let jar = jar.add(session_cookie(session.token, state.cookie_secure));
    (jar, Json(LoginResponse { success: true })).into_response()
}

async fn logout_handler(State(state): State<Arc<WebServerState>>, jar: CookieJar) -> Response {
    if let Some(token) = session_token(&jar) {
        state.sessions.remove(&token).await;
    }
    let jar = jar.remove(expired_session_cookie());
    (jar, Json(LoginResponse { success: true })).into_response()
}

async fn vms_handler(
    State(state): State<Arc<WebServerState>>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Response {
    match state.hypervisor.list_all_vms().await {
        Ok(vms) => Json(VmListResponse { vms, user: user.user }).into_response(),
        Err(e) => {
            error!("Failed to list VMs: {}", e);
            json_error(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

async fn control_vm_handler(
    State(state): State<Arc<WebServerState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(req): Json<ControlRequest>,
) -> Response {
    let action: PowerAction = match req.action.parse() {
        Ok(action) => action,
        Err(_) => {
            return json_error(
                StatusCode::BAD_REQUEST,
                format!("Unknown action: {}", req.action),
            )
        }
    };

    let vm = match state.hypervisor.find_vm_by_name(&req.vm).await {
        Ok(vm) => vm,
        Err(e) if e.is_not_found() => {
            return json_error(StatusCode::NOT_FOUND, format!("VM {} not found", req.vm))
        }
        Err(e) => return internal_error(e),
    };

    info!("{} requested {} of {} ({}/{})", user.user, action, vm.name, vm.node, vm.vmid);
    if let Err(e) = state.hypervisor.power(&vm.node, vm.vmid, action).await {
        return internal_error(e);
    }

    match state.hypervisor.vm_status(&vm.node, vm.vmid).await {
        Ok(status) => Json(ControlResponse {
            name: vm.name,
            status: status.status,
        })
        .into_response(),
        Err(e) => internal_error(e),
    }
}

fn internal_error(e: PveError) -> Response {
    error!("VM control failed: {}", e);
    json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

async fn console_handler(
    State(state): State<Arc<WebServerState>>,
    Path((node, vmid)): Path<(String, String)>,
) -> Response {
    let target = match RelayTarget::parse(&node, &vmid) {
        Ok(target) => target,
        Err(msg) => return json_error(StatusCode::BAD_REQUEST, msg),
    };

    match state.hypervisor.locate(&target.node, target.vmid).await {
        Ok(vm) => Json(ConsoleInfo {
            websocket_path: target.websocket_path(),
            node: target.node,
            vmid: target.vmid,
            name: vm.name,
        })
        .into_response(),
        Err(e) if e.is_not_found() => {
            json_error(StatusCode::NOT_FOUND, format!("VM {} not found", target))
        }
        Err(e) => {
            error!("Console lookup for {} failed: {}", target, e);
            json_error(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

async fn relay_handler(
    State(state): State<Arc<WebServerState>>,
    Extension(user): Extension<AuthenticatedUser>,
    Path((node, vmid)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    let target = match RelayTarget::parse(&node, &vmid) {
        Ok(target) => target,
        Err(msg) => return json_error(StatusCode::BAD_REQUEST, msg),
    };

    debug!("{} opening console for {}", user.user, target);
    let relay = state.relay.clone();
    ws.protocols([CONSOLE_SUBPROTOCOL])
        .on_upgrade(move |socket| async move {
            // Outcome already logged by the relay.
            let _ = relay.attach(socket, target, &user.token).await;
        })
        .into_response()
}
