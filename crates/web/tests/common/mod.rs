//! Shared fixtures: a fake cluster, a local console upstream and a running
//! dashboard bound to an ephemeral port.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest,
    handshake::server::{ErrorResponse, Request, Response},
    http::HeaderValue,
    Message,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use vmdeck_common::{
    ConsoleEndpoint, ConsoleTicket, Error, Hypervisor, NodeInfo, PowerAction, Result, VmId,
    VmStatus, VmSummary,
};
use vmdeck_web::auth::hash_password;
use vmdeck_web::config::UserEntry;
use vmdeck_web::{Config, WebServer};

pub const WAIT: Duration = Duration::from_secs(5);

/// In-memory cluster: `node-a` with guests 101 (`web01`) and 102 (`db01`).
pub struct FakeHypervisor {
    vms: Mutex<Vec<VmSummary>>,
    upstream: Mutex<Option<Url>>,
    refuse_tickets: AtomicBool,
    pub ticket_calls: AtomicUsize,
    pub endpoint_calls: AtomicUsize,
    pub power_calls: Mutex<Vec<(String, VmId, PowerAction)>>,
}

impl FakeHypervisor {
    pub fn new() -> Arc<Self> {
        let vm = |vmid, name: &str, status: &str, tags: &[&str]| VmSummary {
            node: "node-a".into(),
            vmid,
            name: name.into(),
            status: status.into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        };
        Arc::new(Self {
            vms: Mutex::new(vec![
                vm(101, "web01", "running", &["prod", "web"]),
                vm(102, "db01", "stopped", &[]),
            ]),
            upstream: Mutex::new(None),
            refuse_tickets: AtomicBool::new(false),
            ticket_calls: AtomicUsize::new(0),
            endpoint_calls: AtomicUsize::new(0),
            power_calls: Mutex::new(Vec::new()),
        })
    }

    /// Route console sessions to `url`.
    pub fn set_upstream(&self, url: Url) {
        *self.upstream.lock().unwrap() = Some(url);
    }

    /// Make every console ticket request fail the way a stopped guest does.
    pub fn refuse_tickets(&self) {
        self.refuse_tickets.store(true, Ordering::SeqCst);
    }

    pub fn tickets_issued(&self) -> usize {
        self.ticket_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        Ok(vec![NodeInfo {
            node: "node-a".into(),
            status: Some("online".into()),
        }])
    }

    async fn list_vms(&self, node: &str) -> Result<Vec<VmSummary>> {
        if node != "node-a" {
            return Err(Error::not_found("node", node));
        }
        Ok(self.vms.lock().unwrap().clone())
    }

    async fn vm_status(&self, node: &str, vmid: VmId) -> Result<VmStatus> {
        let vms = self.vms.lock().unwrap();
        let vm = vms
            .iter()
            .find(|vm| vm.node == node && vm.vmid == vmid)
            .ok_or_else(|| Error::not_found("vm", vmid))?;
        Ok(VmStatus {
            vmid,
            status: vm.status.clone(),
            name: Some(vm.name.clone()),
        })
    }

    async fn power(&self, node: &str, vmid: VmId, action: PowerAction) -> Result<()> {
        self.power_calls
            .lock()
            .unwrap()
            .push((node.to_string(), vmid, action));
        let mut vms = self.vms.lock().unwrap();
        if let Some(vm) = vms.iter_mut().find(|vm| vm.vmid == vmid) {
            vm.status = match action {
                PowerAction::Stop => "stopped".into(),
                PowerAction::Start | PowerAction::Restart => "running".into(),
            };
        }
        Ok(())
    }

    async fn console_ticket(&self, _node: &str, vmid: VmId) -> Result<ConsoleTicket> {
        let n = self.ticket_calls.fetch_add(1, Ordering::SeqCst);
        if self.refuse_tickets.load(Ordering::SeqCst) {
            return Err(Error::Api {
                status: 500,
                message: format!("VM {} not running", vmid),
            });
        }
        Ok(ConsoleTicket {
            port: 5900 + n as u16,
            ticket: format!("PVEVNC:fake-{}", n),
        })
    }

    async fn console_endpoint(
        &self,
        node: &str,
        vmid: VmId,
        ticket: &ConsoleTicket,
    ) -> Result<ConsoleEndpoint> {
        self.endpoint_calls.fetch_add(1, Ordering::SeqCst);
        let base = self
            .upstream
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Internal("no upstream configured".into()))?;

        let mut url = base.join(&format!("api2/json/nodes/{}/qemu/{}/vncwebsocket", node, vmid))?;
        url.query_pairs_mut()
            .append_pair("port", &ticket.port.to_string())
            .append_pair("vncticket", &ticket.ticket);
        Ok(ConsoleEndpoint {
            url,
            headers: vec![("Cookie".into(), "PVEAuthCookie=fake".into())],
            verify_tls: false,
        })
    }
}

/// What the fake console upstream observed.
#[derive(Debug, PartialEq)]
pub enum UpstreamEvent {
    Frame(Message),
    Closed,
}

/// A plain `ws://` console endpoint standing in for the hypervisor.
pub struct Upstream {
    pub url: Url,
    pub accepted: Arc<AtomicUsize>,
    pub events: mpsc::UnboundedReceiver<UpstreamEvent>,
    pub outgoing: mpsc::UnboundedSender<Message>,
    pub request: Arc<Mutex<Option<(String, String)>>>,
}

impl Upstream {
    pub async fn next_event(&mut self) -> UpstreamEvent {
        tokio::time::timeout(WAIT, self.events.recv())
            .await
            .expect("upstream event within deadline")
            .unwrap_or(UpstreamEvent::Closed)
    }

    /// `(path and query, cookie)` of the upgrade request.
    pub fn upgrade_request(&self) -> Option<(String, String)> {
        self.request.lock().unwrap().clone()
    }
}

pub async fn spawn_upstream() -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let request = Arc::new(Mutex::new(None));
    let (events_tx, events) = mpsc::unbounded_channel();
    let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();

    let counter = accepted.clone();
    let seen = request.clone();
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        counter.fetch_add(1, Ordering::SeqCst);

        let callback = |req: &Request, mut resp: Response| {
            let cookie = req
                .headers()
                .get("cookie")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let path = req
                .uri()
                .path_and_query()
                .map(|p| p.to_string())
                .unwrap_or_default();
            *seen.lock().unwrap() = Some((path, cookie));
            resp.headers_mut()
                .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("binary"));
            Ok::<_, ErrorResponse>(resp)
        };
        let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
            return;
        };

        loop {
            tokio::select! {
                msg = ws.next() => match msg {
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(msg)) => {
                        let _ = events_tx.send(UpstreamEvent::Frame(msg));
                    }
                    Some(Err(_)) | None => break,
                },
                out = outgoing_rx.recv() => match out {
                    Some(msg) => {
                        if ws.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = events_tx.send(UpstreamEvent::Closed);
    });

    Upstream {
        url: Url::parse(&format!("ws://{}/", addr)).unwrap(),
        accepted,
        events,
        outgoing,
        request,
    }
}

pub type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A dashboard server running against a fake cluster.
pub struct TestApp {
    pub addr: SocketAddr,
    pub fake: Arc<FakeHypervisor>,
    pub http: reqwest::Client,
}

pub async fn spawn_app(fake: Arc<FakeHypervisor>) -> TestApp {
    let mut cfg = Config::default();
    cfg.session.cookie_secure = false;
    cfg.relay.connect_timeout_secs = 2;
    cfg.users.push(UserEntry {
        name: "admin".into(),
        password_sha256: hash_password("admin"),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = WebServer::new(&cfg, fake.clone());
    tokio::spawn(server.serve_listener(listener));

    TestApp {
        addr,
        fake,
        http: reqwest::Client::new(),
    }
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn login_as(&self, username: &str, password: &str) -> reqwest::Response {
        self.http
            .post(self.url("/login"))
            .json(&serde_json::json!({"username": username, "password": password}))
            .send()
            .await
            .unwrap()
    }

    /// Log in as `admin` and return the `name=value` session cookie.
    pub async fn login(&self) -> String {
        let resp = self.login_as("admin", "admin").await;
        assert_eq!(resp.status(), 200);
        let cookie = resp
            .headers()
            .get("set-cookie")
            .expect("session cookie")
            .to_str()
            .unwrap();
        cookie.split(';').next().unwrap().to_string()
    }

    pub async fn get(&self, path: &str, cookie: Option<&str>) -> reqwest::Response {
        let mut req = self.http.get(self.url(path));
        if let Some(cookie) = cookie {
            req = req.header("cookie", cookie);
        }
        req.send().await.unwrap()
    }

    pub async fn post(
        &self,
        path: &str,
        cookie: Option<&str>,
        body: serde_json::Value,
    ) -> reqwest::Response {
        let mut req = self.http.post(self.url(path)).json(&body);
        if let Some(cookie) = cookie {
            req = req.header("cookie", cookie);
        }
        req.send().await.unwrap()
    }

    /// Open a console websocket the way noVNC does.
    pub async fn open_console(
        &self,
        path: &str,
        cookie: Option<&str>,
    ) -> std::result::Result<ClientSocket, tokio_tungstenite::tungstenite::Error> {
        let mut request = format!("ws://{}{}", self.addr, path)
            .into_client_request()
            .unwrap();
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("binary"));
        if let Some(cookie) = cookie {
            request
                .headers_mut()
                .insert("Cookie", HeaderValue::from_str(cookie).unwrap());
        }
        tokio_tungstenite::connect_async(request)
            .await
            .map(|(socket, _)| socket)
    }
}

/// Next frame from the client socket, or `None` once it has closed.
pub async fn next_client_frame(socket: &mut ClientSocket) -> Option<Message> {
    loop {
        match tokio::time::timeout(WAIT, socket.next())
            .await
            .expect("client frame within deadline")
        {
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(msg)) => return Some(msg),
            Some(Err(_)) | None => return None,
        }
    }
}
