//! Console relay
//!
//! Bridges a browser console websocket to the hypervisor's `vncwebsocket`
//! endpoint. Each pairing owns exactly one client socket and one upstream
//! socket; frames are copied verbatim in both directions until either side
//! closes, errors, or the pairing sits idle too long.
//!
//! Setup (session check, target lookup, ticket, upstream connect) happens
//! once and is never retried. VNC tickets are single-use.

use axum::extract::ws::{self, WebSocket};
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::{
    self,
    client::IntoClientRequest,
    http::{HeaderName, HeaderValue},
    protocol::{frame::coding::CloseCode, CloseFrame},
};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::auth::SessionStore;
use crate::config::RelayConfig;
use vmdeck_common::{ConsoleEndpoint, Hypervisor, VmId};

/// How long closing both sockets may take once a pairing ends.
pub const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Subprotocol noVNC and the Proxmox proxy agree on.
pub const CONSOLE_SUBPROTOCOL: &str = "binary";

const IDLE_CLOSE_CODE: u16 = 4408;

/// Websocket to the hypervisor's console endpoint.
pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code and reason, independent of the websocket library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: u16, reason: &str) -> Self {
        // Control frame payloads are capped at 125 bytes, two of them the code.
        let mut end = reason.len().min(123);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        Self {
            code,
            reason: reason[..end].to_string(),
        }
    }

    /// Codes that may not appear on the wire.
    fn is_sendable(&self) -> bool {
        !matches!(self.code, 0..=999 | 1004 | 1005 | 1006 | 1015 | 5000..=u16::MAX)
    }
}

/// A websocket message, as seen by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseReason>),
}

impl Frame {
    fn len(&self) -> usize {
        match self {
            Frame::Binary(b) | Frame::Ping(b) | Frame::Pong(b) => b.len(),
            Frame::Text(t) => t.len(),
            Frame::Close(_) => 0,
        }
    }
}

impl From<ws::Message> for Frame {
    fn from(msg: ws::Message) -> Self {
        match msg {
            ws::Message::Binary(b) => Frame::Binary(b),
            ws::Message::Text(t) => Frame::Text(t),
            ws::Message::Ping(p) => Frame::Ping(p),
            ws::Message::Pong(p) => Frame::Pong(p),
            ws::Message::Close(c) => Frame::Close(c.map(|c| CloseReason::new(c.code, &c.reason))),
        }
    }
}

impl From<Frame> for ws::Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Binary(b) => ws::Message::Binary(b),
            Frame::Text(t) => ws::Message::Text(t),
            Frame::Ping(p) => ws::Message::Ping(p),
            Frame::Pong(p) => ws::Message::Pong(p),
            Frame::Close(c) => ws::Message::Close(c.filter(CloseReason::is_sendable).map(|c| {
                ws::CloseFrame {
                    code: c.code,
                    reason: c.reason.into(),
                }
            })),
        }
    }
}

impl From<tungstenite::Message> for Frame {
    fn from(msg: tungstenite::Message) -> Self {
        match msg {
            tungstenite::Message::Binary(b) => Frame::Binary(b),
            tungstenite::Message::Text(t) => Frame::Text(t),
            tungstenite::Message::Ping(p) => Frame::Ping(p),
            tungstenite::Message::Pong(p) => Frame::Pong(p),
            tungstenite::Message::Close(c) => {
                Frame::Close(c.map(|c| CloseReason::new(u16::from(c.code), &c.reason)))
            }
            // Only produced when writing raw frames, never by a read.
            tungstenite::Message::Frame(f) => Frame::Binary(f.into_data()),
        }
    }
}

impl From<Frame> for tungstenite::Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Binary(b) => tungstenite::Message::Binary(b),
            Frame::Text(t) => tungstenite::Message::Text(t),
            Frame::Ping(p) => tungstenite::Message::Ping(p),
            Frame::Pong(p) => tungstenite::Message::Pong(p),
            Frame::Close(c) => tungstenite::Message::Close(c.filter(CloseReason::is_sendable).map(|c| {
                CloseFrame {
                    code: CloseCode::from(c.code),
                    reason: c.reason.into(),
                }
            })),
        }
    }
}

/// Direction of frame flow within a pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Browser -> hypervisor
    ClientToUpstream,
    /// Hypervisor -> browser
    UpstreamToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToUpstream => f.write_str("client->upstream"),
            Direction::UpstreamToClient => f.write_str("upstream->client"),
        }
    }
}

/// Terminal conditions of a console session. None are retried.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("not authenticated")]
    Unauthorized,

    #[error("target not found: {0}")]
    TargetNotFound(String),

    #[error("console ticket request failed: {0}")]
    TicketError(String),

    #[error("upstream console connection failed: {0}")]
    UpstreamConnectError(String),

    #[error("relay I/O error ({direction}): {message}")]
    RelayIOError { direction: Direction, message: String },
}

impl RelayError {
    /// Close code reported to the browser.
    pub fn close_code(&self) -> u16 {
        match self {
            RelayError::Unauthorized => 4401,
            RelayError::TargetNotFound(_) => 4404,
            RelayError::TicketError(_) => 4502,
            RelayError::UpstreamConnectError(_) => 4504,
            RelayError::RelayIOError { .. } => 1011,
        }
    }

    pub fn close_reason(&self) -> CloseReason {
        CloseReason::new(self.close_code(), &self.to_string())
    }
}

/// How a pairing that ran to completion ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEnd {
    ClientClosed(Option<CloseReason>),
    UpstreamClosed(Option<CloseReason>),
    IdleTimeout,
}

/// Console target named by the route `/relay/<node>/<vmid>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTarget {
    pub node: String,
    pub vmid: VmId,
}

impl RelayTarget {
    pub fn parse(node: &str, vmid: &str) -> Result<Self, String> {
        let node = node.trim();
        if node.is_empty() {
            return Err("node must not be empty".to_string());
        }
        if !node
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
        {
            return Err(format!("invalid node name: {}", node));
        }
        let vmid: VmId = vmid
            .parse()
            .map_err(|_| format!("vmid must be a positive integer: {}", vmid))?;
        if vmid == 0 {
            return Err("vmid must be a positive integer: 0".to_string());
        }
        Ok(Self {
            node: node.to_string(),
            vmid,
        })
    }

    pub fn websocket_path(&self) -> String {
        format!("/relay/{}/{}", self.node, self.vmid)
    }
}

impl fmt::Display for RelayTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.vmid)
    }
}

/// Pairs browser console sockets with hypervisor console sockets.
#[derive(Clone)]
pub struct ConsoleRelay {
    hypervisor: Arc<dyn Hypervisor>,
    sessions: Arc<SessionStore>,
    connect_timeout: Duration,
    idle_timeout: Option<Duration>,
}

impl ConsoleRelay {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, sessions: Arc<SessionStore>, cfg: &RelayConfig) -> Self {
        Self {
            hypervisor,
            sessions,
            connect_timeout: cfg.connect_timeout(),
            idle_timeout: cfg.idle_timeout(),
        }
    }

    /// Confirm the session that requested the upgrade is still live.
    pub async fn authorize(&self, token: &str) -> Result<(), RelayError> {
        if self.sessions.is_authenticated(Some(token)).await {
            Ok(())
        } else {
            Err(RelayError::Unauthorized)
        }
    }

    /// Look up the target, obtain a ticket and open the upstream socket.
    pub async fn open_upstream(&self, target: &RelayTarget) -> Result<UpstreamSocket, RelayError> {
        self.hypervisor
            .locate(&target.node, target.vmid)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    RelayError::TargetNotFound(target.to_string())
                } else {
                    RelayError::TicketError(format!("lookup of {} failed: {}", target, e))
                }
            })?;

        let ticket = self
            .hypervisor
            .console_ticket(&target.node, target.vmid)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    RelayError::TargetNotFound(target.to_string())
                } else {
                    RelayError::TicketError(e.to_string())
                }
            })?;

        let endpoint = self
            .hypervisor
            .console_endpoint(&target.node, target.vmid, &ticket)
            .await
            .map_err(|e| RelayError::TicketError(e.to_string()))?;

        connect_upstream(&endpoint, self.connect_timeout).await
    }

    /// Run a full console session for an upgraded client socket.
    ///
    /// Setup failures close the client socket with the error's close code.
    pub async fn attach(
        &self,
        mut client: WebSocket,
        target: RelayTarget,
        token: &str,
    ) -> Result<RelayEnd, RelayError> {
        let pairing = Uuid::new_v4();
        debug!(%pairing, %target, "console requested");

        let setup = async {
            self.authorize(token).await?;
            self.open_upstream(&target).await
        };
        let upstream = match setup.await {
            Ok(upstream) => upstream,
            Err(err) => {
                warn!(%pairing, %target, "console setup failed: {}", err);
                let frame = ws::Message::from(Frame::Close(Some(err.close_reason())));
                let _ = tokio::time::timeout(CLOSE_GRACE, client.send(frame)).await;
                return Err(err);
            }
        };

        info!(%pairing, %target, "console pairing established");

        let (client_tx, client_rx) = client.split();
        let (upstream_tx, upstream_rx) = upstream.split();

        let client_rx = client_rx.map(|m| m.map(Frame::from));
        let client_tx = client_tx.with(|f: Frame| future::ready(Ok::<_, axum::Error>(ws::Message::from(f))));
        let upstream_rx = upstream_rx.map(|m| m.map(Frame::from));
        let upstream_tx = upstream_tx
            .with(|f: Frame| future::ready(Ok::<_, tungstenite::Error>(tungstenite::Message::from(f))));

        let outcome = bridge(client_rx, client_tx, upstream_rx, upstream_tx, self.idle_timeout).await;
        match &outcome {
            Ok(end) => info!(%pairing, %target, "console pairing ended: {:?}", end),
            Err(err) => warn!(%pairing, %target, "console pairing failed: {}", err),
        }
        outcome
    }
}

/// Open the upstream console websocket, bounded by `limit`.
pub async fn connect_upstream(
    endpoint: &ConsoleEndpoint,
    limit: Duration,
) -> Result<UpstreamSocket, RelayError> {
    let connect_err = |e: &dyn fmt::Display| RelayError::UpstreamConnectError(e.to_string());

    let mut request = endpoint
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| connect_err(&e))?;
    let headers = request.headers_mut();
    for (name, value) in &endpoint.headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| connect_err(&e))?;
        let value = HeaderValue::from_str(value).map_err(|e| connect_err(&e))?;
        headers.insert(name, value);
    }
    headers.insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(CONSOLE_SUBPROTOCOL),
    );

    let connector = if endpoint.url.scheme() == "wss" {
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(!endpoint.verify_tls)
            .danger_accept_invalid_hostnames(!endpoint.verify_tls)
            .build()
            .map_err(|e| connect_err(&e))?;
        Some(Connector::NativeTls(tls))
    } else {
        None
    };

    debug!(
        "Connecting to console upstream {}://{}{}",
        endpoint.url.scheme(),
        endpoint.url.host_str().unwrap_or_default(),
        endpoint.url.path()
    );
    let connect = tokio_tungstenite::connect_async_tls_with_config(request, None, true, connector);
    match tokio::time::timeout(limit, connect).await {
        Err(_) => Err(RelayError::UpstreamConnectError(format!(
            "timed out after {}s",
            limit.as_secs_f32()
        ))),
        Ok(Err(e)) => Err(connect_err(&e)),
        Ok(Ok((socket, response))) => {
            debug!("Console upstream answered {}", response.status());
            Ok(socket)
        }
    }
}

/// Forward frames from `rx` to `tx` until `rx` closes.
///
/// Returns the close reason sent by the source, if any.
async fn pump<R, W, E>(
    rx: &mut R,
    tx: &mut W,
    direction: Direction,
    activity: &Notify,
) -> Result<Option<CloseReason>, RelayError>
where
    R: Stream<Item = Result<Frame, E>> + Unpin,
    E: fmt::Display,
    W: Sink<Frame> + Unpin,
    W::Error: fmt::Display,
{
    while let Some(frame) = rx.next().await {
        let frame = frame.map_err(|e| RelayError::RelayIOError {
            direction,
            message: format!("read: {}", e),
        })?;

        match frame {
            Frame::Close(reason) => {
                debug!("{} close received: {:?}", direction, reason);
                return Ok(reason);
            }
            // Control frames are answered per hop by each websocket endpoint.
            Frame::Ping(_) | Frame::Pong(_) => {}
            data => {
                activity.notify_one();
                trace!("{}: {} bytes", direction, data.len());
                tx.send(data).await.map_err(|e| RelayError::RelayIOError {
                    direction,
                    message: format!("write: {}", e),
                })?;
            }
        }
    }

    debug!("{} source ended", direction);
    Ok(None)
}

/// Race both forwarding loops and the idle watchdog; the first to finish
/// cancels the rest.
async fn splice<CR, CW, UR, UW, CE, UE>(
    client_rx: &mut CR,
    client_tx: &mut CW,
    upstream_rx: &mut UR,
    upstream_tx: &mut UW,
    idle: Option<Duration>,
) -> Result<RelayEnd, RelayError>
where
    CR: Stream<Item = Result<Frame, CE>> + Unpin,
    CE: fmt::Display,
    CW: Sink<Frame> + Unpin,
    CW::Error: fmt::Display,
    UR: Stream<Item = Result<Frame, UE>> + Unpin,
    UE: fmt::Display,
    UW: Sink<Frame> + Unpin,
    UW::Error: fmt::Display,
{
    let activity = Notify::new();
    let watchdog = async {
        match idle {
            Some(limit) => {
                while tokio::time::timeout(limit, activity.notified()).await.is_ok() {}
            }
            None => future::pending::<()>().await,
        }
    };

    tokio::select! {
        r = pump(client_rx, upstream_tx, Direction::ClientToUpstream, &activity) => {
            r.map(RelayEnd::ClientClosed)
        }
        r = pump(upstream_rx, client_tx, Direction::UpstreamToClient, &activity) => {
            r.map(RelayEnd::UpstreamClosed)
        }
        _ = watchdog => {
            debug!("console idle for {:?}", idle);
            Ok(RelayEnd::IdleTimeout)
        }
    }
}

async fn finish<W>(tx: &mut W, reason: Option<CloseReason>)
where
    W: Sink<Frame> + Unpin,
{
    if let Some(reason) = reason {
        let _ = tx.send(Frame::Close(Some(reason))).await;
    }
    let _ = tx.close().await;
}

/// Shuttle frames between two established sockets, then close both.
///
/// A clean close on one side is forwarded to the other with the same code.
/// Errors and idle timeouts close the client with a diagnostic close reason.
pub async fn bridge<CR, CW, UR, UW, CE, UE>(
    mut client_rx: CR,
    mut client_tx: CW,
    mut upstream_rx: UR,
    mut upstream_tx: UW,
    idle: Option<Duration>,
) -> Result<RelayEnd, RelayError>
where
    CR: Stream<Item = Result<Frame, CE>> + Unpin,
    CE: fmt::Display,
    CW: Sink<Frame> + Unpin,
    CW::Error: fmt::Display,
    UR: Stream<Item = Result<Frame, UE>> + Unpin,
    UE: fmt::Display,
    UW: Sink<Frame> + Unpin,
    UW::Error: fmt::Display,
{
    let outcome = splice(
        &mut client_rx,
        &mut client_tx,
        &mut upstream_rx,
        &mut upstream_tx,
        idle,
    )
    .await;

    let (to_client, to_upstream) = match &outcome {
        Ok(RelayEnd::ClientClosed(reason)) => (None, reason.clone()),
        Ok(RelayEnd::UpstreamClosed(reason)) => (reason.clone(), None),
        Ok(RelayEnd::IdleTimeout) => (Some(CloseReason::new(IDLE_CLOSE_CODE, "idle timeout")), None),
        Err(err) => (Some(err.close_reason()), None),
    };

    let shutdown = async {
        finish(&mut client_tx, to_client).await;
        finish(&mut upstream_tx, to_upstream).await;
    };
    if tokio::time::timeout(CLOSE_GRACE, shutdown).await.is_err() {
        debug!("close handshake exceeded {:?}, dropping sockets", CLOSE_GRACE);
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;

    type Inbound = mpsc::UnboundedSender<Result<Frame, String>>;
    type Outbound = mpsc::UnboundedReceiver<Frame>;

    struct Harness {
        client_in: Inbound,
        client_out: Outbound,
        upstream_in: Inbound,
        upstream_out: Outbound,
        task: tokio::task::JoinHandle<Result<RelayEnd, RelayError>>,
    }

    fn harness(idle: Option<Duration>) -> Harness {
        let (client_in, client_rx) = mpsc::unbounded::<Result<Frame, String>>();
        let (client_tx, client_out) = mpsc::unbounded::<Frame>();
        let (upstream_in, upstream_rx) = mpsc::unbounded::<Result<Frame, String>>();
        let (upstream_tx, upstream_out) = mpsc::unbounded::<Frame>();
        let task = tokio::spawn(bridge(client_rx, client_tx, upstream_rx, upstream_tx, idle));
        Harness {
            client_in,
            client_out,
            upstream_in,
            upstream_out,
            task,
        }
    }

    async fn next(out: &mut Outbound) -> Option<Frame> {
        tokio::time::timeout(Duration::from_secs(2), out.next())
            .await
            .expect("frame within deadline")
    }

    async fn ended(task: tokio::task::JoinHandle<Result<RelayEnd, RelayError>>) -> Result<RelayEnd, RelayError> {
        tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("pairing ended within deadline")
            .unwrap()
    }

    #[test]
    fn test_relay_target_parse() {
        let t = RelayTarget::parse("node-a", "101").unwrap();
        assert_eq!(t.node, "node-a");
        assert_eq!(t.vmid, 101);
        assert_eq!(t.websocket_path(), "/relay/node-a/101");

        assert!(RelayTarget::parse("", "101").is_err());
        assert!(RelayTarget::parse("node-a", "0").is_err());
        assert!(RelayTarget::parse("node-a", "-4").is_err());
        assert!(RelayTarget::parse("node-a", "abc").is_err());
        assert!(RelayTarget::parse("../etc", "101").is_err());
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(RelayError::TargetNotFound("a/1".into()).close_code(), 4404);
        assert_eq!(RelayError::TicketError("x".into()).close_code(), 4502);
        assert_eq!(RelayError::UpstreamConnectError("x".into()).close_code(), 4504);
        assert_eq!(RelayError::Unauthorized.close_code(), 4401);
        let io = RelayError::RelayIOError {
            direction: Direction::UpstreamToClient,
            message: "reset".into(),
        };
        assert_eq!(io.close_code(), 1011);
        assert!(io.close_reason().reason.contains("upstream->client"));
    }

    #[test]
    fn test_close_reason_is_truncated_on_char_boundary() {
        let long = "é".repeat(100);
        let reason = CloseReason::new(4502, &long);
        assert!(reason.reason.len() <= 123);
        assert!(reason.reason.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_reserved_close_codes_not_sent() {
        let msg = tungstenite::Message::from(Frame::Close(Some(CloseReason::new(1006, "abnormal"))));
        assert_eq!(msg, tungstenite::Message::Close(None));

        let msg = ws::Message::from(Frame::Close(Some(CloseReason::new(4404, "gone"))));
        match msg {
            ws::Message::Close(Some(frame)) => assert_eq!(frame.code, 4404),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_frames_forwarded_unmodified_and_in_order() {
        let mut h = harness(None);

        h.client_in.unbounded_send(Ok(Frame::Binary(vec![0x01, 0x02]))).unwrap();
        h.client_in.unbounded_send(Ok(Frame::Text("RFB 003.008\n".into()))).unwrap();
        h.client_in.unbounded_send(Ok(Frame::Binary(vec![0x03]))).unwrap();
        h.upstream_in.unbounded_send(Ok(Frame::Binary(vec![0xAA]))).unwrap();

        assert_eq!(next(&mut h.upstream_out).await, Some(Frame::Binary(vec![0x01, 0x02])));
        assert_eq!(next(&mut h.upstream_out).await, Some(Frame::Text("RFB 003.008\n".into())));
        assert_eq!(next(&mut h.upstream_out).await, Some(Frame::Binary(vec![0x03])));
        assert_eq!(next(&mut h.client_out).await, Some(Frame::Binary(vec![0xAA])));

        drop(h.client_in);
        assert_eq!(ended(h.task).await.unwrap(), RelayEnd::ClientClosed(None));
    }

    #[tokio::test]
    async fn test_control_frames_not_forwarded() {
        let mut h = harness(None);

        h.client_in.unbounded_send(Ok(Frame::Ping(vec![9]))).unwrap();
        h.client_in.unbounded_send(Ok(Frame::Binary(vec![1]))).unwrap();

        assert_eq!(next(&mut h.upstream_out).await, Some(Frame::Binary(vec![1])));
        drop(h.upstream_in);
        assert_eq!(ended(h.task).await.unwrap(), RelayEnd::UpstreamClosed(None));
    }

    #[tokio::test]
    async fn test_client_close_closes_upstream() {
        let mut h = harness(None);
        let bye = CloseReason::new(1000, "bye");

        h.client_in.unbounded_send(Ok(Frame::Close(Some(bye.clone())))).unwrap();

        assert_eq!(ended(h.task).await.unwrap(), RelayEnd::ClientClosed(Some(bye.clone())));
        assert_eq!(next(&mut h.upstream_out).await, Some(Frame::Close(Some(bye))));
        assert_eq!(next(&mut h.upstream_out).await, None);
        assert_eq!(next(&mut h.client_out).await, None);
    }

    #[tokio::test]
    async fn test_upstream_close_closes_client() {
        let mut h = harness(None);

        h.upstream_in.unbounded_send(Ok(Frame::Binary(vec![0xAA]))).unwrap();
        drop(h.upstream_in);

        assert_eq!(next(&mut h.client_out).await, Some(Frame::Binary(vec![0xAA])));
        assert_eq!(ended(h.task).await.unwrap(), RelayEnd::UpstreamClosed(None));
        assert_eq!(next(&mut h.client_out).await, None);
        assert_eq!(next(&mut h.upstream_out).await, None);
        drop(h.client_in);
    }

    #[tokio::test]
    async fn test_read_error_ends_pairing() {
        let mut h = harness(None);

        h.upstream_in.unbounded_send(Err("connection reset".into())).unwrap();

        let err = ended(h.task).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::RelayIOError {
                direction: Direction::UpstreamToClient,
                ..
            }
        ));
        match next(&mut h.client_out).await {
            Some(Frame::Close(Some(reason))) => assert_eq!(reason.code, 1011),
            other => panic!("expected close frame, got {:?}", other),
        }
        assert_eq!(next(&mut h.upstream_out).await, None);
        drop(h.client_in);
    }

    #[tokio::test]
    async fn test_write_error_ends_pairing() {
        let mut h = harness(None);

        h.upstream_out.close();
        h.client_in.unbounded_send(Ok(Frame::Binary(vec![1]))).unwrap();

        let err = ended(h.task).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::RelayIOError {
                direction: Direction::ClientToUpstream,
                ..
            }
        ));
        drop(h.upstream_in);
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_both_sides() {
        let mut h = harness(Some(Duration::from_millis(100)));

        h.client_in.unbounded_send(Ok(Frame::Binary(vec![1]))).unwrap();
        assert_eq!(next(&mut h.upstream_out).await, Some(Frame::Binary(vec![1])));

        assert_eq!(ended(h.task).await.unwrap(), RelayEnd::IdleTimeout);
        match next(&mut h.client_out).await {
            Some(Frame::Close(Some(reason))) => assert_eq!(reason.code, IDLE_CLOSE_CODE),
            other => panic!("expected close frame, got {:?}", other),
        }
        assert_eq!(next(&mut h.upstream_out).await, None);
        drop((h.client_in, h.upstream_in));
    }
}
