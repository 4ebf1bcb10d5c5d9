//! WebSocket pub/sub client
//!
//! Speaks the AppSync Events realtime protocol: JSON control messages over a
//! WebSocket, with authorization carried in a `header-` subprotocol on connect
//! and inline on every subscribe and publish. Binary frames travel as base64
//! string events.
//!
//! One connection task owns the socket, the desired subscription set and the
//! publish queue. After every reconnect it re-subscribes the whole set and only
//! reports [`ConnectionStatus::Connected`] once each channel is confirmed.

use super::proxy::{connect_tcp, ProxySettings};
use super::signer::{encode_auth_subprotocol, RequestSigner, SigningRequest};
use super::tls::client_config;
use super::{check_frame, ConnectionStatus, InboundMessage, PubSub, SocketOpts};
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::helper::{random_id, RetryConfig};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{client_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Protocol subprotocol offered on connect
const EVENT_SUBPROTOCOL: &str = "aws-appsync-event-ws";

/// Command queue depth between the handle and the connection task
const COMMAND_QUEUE: usize = 256;

/// Inbound queue depth towards the consumer
const INBOUND_QUEUE: usize = 1024;

/// Outbound queue depth towards the writer task
const WRITE_QUEUE: usize = 256;

type Reply = oneshot::Sender<Result<(), TransportError>>;

enum Command {
    Subscribe { channel: String, reply: Reply },
    Publish { channel: String, payload: Bytes, reply: Reply },
}

/// A publish waiting for its acknowledgement
struct PendingPublish {
    seq: u64,
    channel: String,
    payload: Bytes,
    reply: Reply,
}

#[derive(Debug, Deserialize)]
struct ServerMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    event: Option<Value>,
    #[serde(default)]
    errors: Vec<ServerError>,
    #[serde(default)]
    failed: Vec<Value>,
    #[serde(default, rename = "connectionTimeoutMs")]
    connection_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ServerError {
    #[serde(default, rename = "errorType")]
    error_type: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Turn a server error list into a transport error
fn classify_errors(errors: &[ServerError]) -> TransportError {
    let text = errors
        .iter()
        .map(|e| {
            format!(
                "{}: {}",
                e.error_type.as_deref().unwrap_or("Error"),
                e.message.as_deref().unwrap_or("")
            )
        })
        .collect::<Vec<_>>()
        .join("; ");
    let unauthorized = errors.iter().any(|e| {
        matches!(
            e.error_type.as_deref(),
            Some("UnauthorizedException") | Some("ForbiddenException")
        )
    });
    if unauthorized {
        TransportError::AuthFailed(text)
    } else {
        TransportError::Rejected(text)
    }
}

fn map_ws_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(resp) if matches!(resp.status().as_u16(), 401 | 403) => {
            TransportError::AuthFailed(format!("Handshake rejected with HTTP {}", resp.status()))
        }
        tungstenite::Error::Io(e) => TransportError::Io(e),
        other => TransportError::ConnectFailed(other.to_string()),
    }
}

/// Encode a binary frame as a publishable event (a JSON string literal)
fn encode_event(payload: &[u8]) -> String {
    Value::String(STANDARD.encode(payload)).to_string()
}

/// Decode a received `data` event back into bytes
fn decode_event(event: &Value) -> Result<Bytes, String> {
    let raw = match event {
        Value::String(s) => s,
        other => return Err(format!("Unexpected event shape: {}", other)),
    };
    let encoded = serde_json::from_str::<String>(raw).unwrap_or_else(|_| raw.clone());
    STANDARD
        .decode(encoded.as_bytes())
        .map(Bytes::from)
        .map_err(|e| format!("Event is not base64: {}", e))
}

/// Everything needed to open a connection
struct Endpoint {
    config: TransportConfig,
    signer: Arc<dyn RequestSigner>,
    proxy: ProxySettings,
    opts: SocketOpts,
    connector: Connector,
}

impl Endpoint {
    fn signing_request(&self, body: String) -> SigningRequest {
        let host = self.config.signing_host();
        SigningRequest {
            url: format!("https://{}/event", host),
            host,
            body,
        }
    }

    /// Connect, upgrade and complete `connection_init`
    async fn open(&self) -> Result<WsStream, TransportError> {
        let endpoint = &self.config.endpoint;
        let host = endpoint
            .host_str()
            .ok_or_else(|| TransportError::ConnectFailed(format!("Endpoint has no host: {}", endpoint)))?;
        let port = endpoint.port_or_known_default().unwrap_or(443);
        let timeout = self.config.connect_timeout();

        let headers = self.signer.sign(&self.signing_request("{}".to_string()))?;
        let protocols = format!("{}, {}", EVENT_SUBPROTOCOL, encode_auth_subprotocol(&headers)?);

        let mut request = endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConnectFailed(format!("Invalid endpoint: {}", e)))?;
        let value = HeaderValue::from_str(&protocols)
            .map_err(|e| TransportError::AuthFailed(format!("Invalid signed headers: {}", e)))?;
        request.headers_mut().insert("Sec-WebSocket-Protocol", value);

        let tcp = connect_tcp(host, port, &self.proxy, &self.opts, timeout).await?;
        let (mut ws, _response) = tokio::time::timeout(timeout, client_async_tls_with_config(request, tcp, None, Some(self.connector.clone())))
            .await
            .map_err(|_| TransportError::ConnectFailed(format!("WebSocket upgrade timeout to {}", endpoint)))?
            .map_err(map_ws_error)?;

        ws.send(Message::Text(json!({"type": "connection_init"}).to_string()))
            .await
            .map_err(map_ws_error)?;

        let server_timeout = tokio::time::timeout(timeout, wait_for_ack(&mut ws))
            .await
            .map_err(|_| TransportError::ConnectFailed("Timed out waiting for connection_ack".to_string()))??;

        info!(
            "Connected to {} (server keepalive timeout {:?})",
            endpoint, server_timeout
        );
        Ok(ws)
    }
}

async fn wait_for_ack(ws: &mut WsStream) -> Result<Option<Duration>, TransportError> {
    while let Some(frame) = ws.next().await {
        match frame.map_err(map_ws_error)? {
            Message::Text(text) => {
                let msg: ServerMessage = match serde_json::from_str(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!("Ignoring unparsable handshake message: {}", e);
                        continue;
                    }
                };
                match msg.kind.as_str() {
                    "connection_ack" => {
                        return Ok(msg.connection_timeout_ms.map(Duration::from_millis));
                    }
                    "connection_error" | "error" => return Err(classify_errors(&msg.errors)),
                    _ => trace!("Ignoring {} during handshake", msg.kind),
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(TransportError::ConnectFailed(
        "Connection closed during handshake".to_string(),
    ))
}

/// How a session ended
enum SessionEnd {
    Cancelled,
    Abandoned,
    Lost(TransportError),
}

/// State owned by the connection task
struct Connection {
    endpoint: Endpoint,
    retry: RetryConfig,
    desired: BTreeSet<String>,
    queue: VecDeque<PendingPublish>,
    sub_waiters: HashMap<String, Vec<Reply>>,
    next_seq: u64,
    inbound: mpsc::Sender<InboundMessage>,
    status: watch::Sender<ConnectionStatus>,
    cancel: CancellationToken,
}

/// Per-socket bookkeeping, reset on every reconnect
#[derive(Default)]
struct Session {
    /// Subscription id to channel
    channels: HashMap<String, String>,
    /// Subscription ids sent but not yet confirmed
    pending_subs: HashMap<String, String>,
    /// Re-subscriptions that gate readiness
    resubscribing: HashSet<String>,
    /// Publishes awaiting acknowledgement, by publish id
    inflight: HashMap<String, PendingPublish>,
    ready: bool,
}

impl Connection {
    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }

    async fn run(mut self, first: WsStream, mut commands: mpsc::Receiver<Command>) {
        let mut ws = Some(first);
        while let Some(stream) = ws.take() {
            match self.session(stream, &mut commands).await {
                SessionEnd::Cancelled | SessionEnd::Abandoned => break,
                SessionEnd::Lost(e) => {
                    warn!("Transport connection lost: {}", e);
                    self.set_status(ConnectionStatus::Disconnected);
                    ws = self.reconnect(&mut commands).await;
                }
            }
        }

        self.set_status(ConnectionStatus::Disconnected);
        self.fail_all(|| TransportError::Closed);
        commands.close();
        while let Some(cmd) = commands.recv().await {
            let reply = match cmd {
                Command::Subscribe { reply, .. } | Command::Publish { reply, .. } => reply,
            };
            let _ = reply.send(Err(TransportError::Closed));
        }
        debug!("Transport connection task exited");
    }

    fn fail_all<F: Fn() -> TransportError>(&mut self, err: F) {
        for pending in self.queue.drain(..) {
            let _ = pending.reply.send(Err(err()));
        }
        for (_, waiters) in self.sub_waiters.drain() {
            for reply in waiters {
                let _ = reply.send(Err(err()));
            }
        }
    }

    /// Accept a command while no socket is usable
    fn enqueue(&mut self, cmd: Command) {
        match cmd {
            Command::Subscribe { channel, reply } => {
                self.desired.insert(channel.clone());
                self.sub_waiters.entry(channel).or_default().push(reply);
            }
            Command::Publish {
                channel,
                payload,
                reply,
            } => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.queue.push_back(PendingPublish {
                    seq,
                    channel,
                    payload,
                    reply,
                });
            }
        }
    }

    async fn reconnect(&mut self, commands: &mut mpsc::Receiver<Command>) -> Option<WsStream> {
        let mut attempt: u32 = 0;
        loop {
            if self.retry.exhausted(attempt) {
                error!("Giving up on transport after {} attempts", attempt);
                let attempts = attempt;
                self.fail_all(|| {
                    TransportError::ConnectFailed(format!("Reconnect failed after {} attempts", attempts))
                });
                return None;
            }

            let delay = self.retry.delay_for_attempt(attempt);
            info!("Reconnecting in {:?} (attempt {})", delay, attempt + 1);
            let deadline = Instant::now() + delay;
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return None,
                    _ = tokio::time::sleep_until(deadline) => break,
                    cmd = commands.recv() => match cmd {
                        Some(cmd) => self.enqueue(cmd),
                        None => return None,
                    },
                }
            }

            self.set_status(ConnectionStatus::Connecting);
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                result = self.endpoint.open() => result,
            };
            match result {
                Ok(ws) => return Some(ws),
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", attempt + 1, e);
                    self.set_status(ConnectionStatus::Disconnected);
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn session(&mut self, ws: WsStream, commands: &mut mpsc::Receiver<Command>) -> SessionEnd {
        self.set_status(ConnectionStatus::Connecting);

        let (sink, mut stream) = ws.split();
        let (out_tx, out_rx) = mpsc::channel(WRITE_QUEUE);
        let writer = tokio::spawn(write_loop(sink, out_rx));
        let mut session = Session::default();

        let end = self.drive(&mut session, &mut stream, &out_tx, commands).await;

        if matches!(end, SessionEnd::Cancelled) {
            let _ = out_tx.send(Message::Close(None)).await;
        }
        drop(out_tx);
        if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
            debug!("Writer task did not finish in time");
        }

        // Unacknowledged publishes go back to the front of the queue in order
        let mut inflight: Vec<PendingPublish> = session.inflight.into_values().collect();
        inflight.sort_by_key(|p| p.seq);
        for pending in inflight.into_iter().rev() {
            self.queue.push_front(pending);
        }
        end
    }

    async fn drive(
        &mut self,
        session: &mut Session,
        stream: &mut futures::stream::SplitStream<WsStream>,
        out: &mpsc::Sender<Message>,
        commands: &mut mpsc::Receiver<Command>,
    ) -> SessionEnd {
        let desired: Vec<String> = self.desired.iter().cloned().collect();
        for channel in desired {
            match self.send_subscribe(session, out, &channel).await {
                Ok(id) => {
                    session.resubscribing.insert(id);
                }
                Err(end) => return end,
            }
        }
        if let Err(end) = self.check_ready(session, out).await {
            return end;
        }

        let keepalive = self.endpoint.config.keepalive();
        let idle_limit = keepalive + self.endpoint.config.grace();
        let mut ticker = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,

                cmd = commands.recv() => {
                    let Some(cmd) = cmd else { return SessionEnd::Abandoned };
                    if let Err(end) = self.handle_command(session, out, cmd).await {
                        return end;
                    }
                }

                frame = stream.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => return SessionEnd::Lost(map_ws_error(e)),
                        None => return SessionEnd::Lost(TransportError::ConnectFailed("Connection closed".to_string())),
                    };
                    last_seen = Instant::now();
                    match frame {
                        Message::Text(text) => {
                            if let Err(end) = self.handle_text(session, out, &text).await {
                                return end;
                            }
                        }
                        Message::Close(frame) => {
                            return SessionEnd::Lost(TransportError::ConnectFailed(format!("Server closed the connection: {:?}", frame)));
                        }
                        _ => {}
                    }
                }

                _ = ticker.tick() => {
                    if last_seen.elapsed() > idle_limit {
                        return SessionEnd::Lost(TransportError::ConnectFailed(format!(
                            "No traffic for {:?}", last_seen.elapsed()
                        )));
                    }
                    if out.send(Message::Ping(Vec::new())).await.is_err() {
                        return SessionEnd::Lost(TransportError::ConnectFailed("Writer stopped".to_string()));
                    }
                }
            }
        }
    }

    async fn handle_command(
        &mut self,
        session: &mut Session,
        out: &mpsc::Sender<Message>,
        cmd: Command,
    ) -> Result<(), SessionEnd> {
        match cmd {
            Command::Subscribe { channel, reply } => {
                let already = session.channels.values().any(|c| *c == channel);
                if already {
                    let _ = reply.send(Ok(()));
                    return Ok(());
                }
                let in_progress = session.pending_subs.values().any(|c| *c == channel);
                self.desired.insert(channel.clone());
                self.sub_waiters.entry(channel.clone()).or_default().push(reply);
                if !in_progress {
                    self.send_subscribe(session, out, &channel).await?;
                }
                Ok(())
            }
            Command::Publish {
                channel,
                payload,
                reply,
            } => {
                let seq = self.next_seq;
                self.next_seq += 1;
                let pending = PendingPublish {
                    seq,
                    channel,
                    payload,
                    reply,
                };
                if session.ready {
                    self.send_publish(session, out, pending).await
                } else {
                    self.queue.push_back(pending);
                    Ok(())
                }
            }
        }
    }

    async fn send_subscribe(
        &mut self,
        session: &mut Session,
        out: &mpsc::Sender<Message>,
        channel: &str,
    ) -> Result<String, SessionEnd> {
        let body = json!({ "channel": channel }).to_string();
        let authorization = match self.endpoint.signer.sign(&self.endpoint.signing_request(body)) {
            Ok(headers) => headers,
            Err(e) => return Err(SessionEnd::Lost(e)),
        };
        let id = random_id();
        let msg = json!({
            "type": "subscribe",
            "id": id,
            "channel": channel,
            "authorization": authorization,
        });
        session.pending_subs.insert(id.clone(), channel.to_string());
        debug!("Subscribing to {}", channel);
        send(out, msg.to_string()).await?;
        Ok(id)
    }

    async fn send_publish(
        &mut self,
        session: &mut Session,
        out: &mpsc::Sender<Message>,
        pending: PendingPublish,
    ) -> Result<(), SessionEnd> {
        if pending.reply.is_closed() {
            trace!("Skipping publish abandoned by its caller");
            return Ok(());
        }
        let events = vec![encode_event(&pending.payload)];
        let body = json!({ "channel": pending.channel, "events": events }).to_string();
        let authorization = match self.endpoint.signer.sign(&self.endpoint.signing_request(body)) {
            Ok(headers) => headers,
            Err(e) => {
                let _ = pending.reply.send(Err(e));
                return Ok(());
            }
        };
        let id = random_id();
        let msg = json!({
            "type": "publish",
            "id": id,
            "channel": pending.channel,
            "events": events,
            "authorization": authorization,
        });
        trace!("Publishing {} bytes to {}", pending.payload.len(), pending.channel);
        session.inflight.insert(id, pending);
        send(out, msg.to_string()).await
    }

    /// Flip to ready once every re-subscription is confirmed, then flush
    async fn check_ready(
        &mut self,
        session: &mut Session,
        out: &mpsc::Sender<Message>,
    ) -> Result<(), SessionEnd> {
        if session.ready || !session.resubscribing.is_empty() {
            return Ok(());
        }
        session.ready = true;
        self.set_status(ConnectionStatus::Connected);
        info!(
            "Transport ready ({} channels, {} queued publishes)",
            self.desired.len(),
            self.queue.len()
        );
        while let Some(pending) = self.queue.pop_front() {
            self.send_publish(session, out, pending).await?;
        }
        Ok(())
    }

    async fn handle_text(
        &mut self,
        session: &mut Session,
        out: &mpsc::Sender<Message>,
        text: &str,
    ) -> Result<(), SessionEnd> {
        let msg: ServerMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Ignoring unparsable server message: {}", e);
                return Ok(());
            }
        };

        match msg.kind.as_str() {
            "ka" => trace!("Keepalive"),
            "data" => {
                let channel = msg.id.as_ref().and_then(|id| session.channels.get(id));
                match (channel, msg.event.as_ref()) {
                    (Some(channel), Some(event)) => match decode_event(event) {
                        Ok(payload) => {
                            let inbound = InboundMessage {
                                channel: channel.clone(),
                                payload,
                            };
                            if self.inbound.send(inbound).await.is_err() {
                                trace!("Inbound receiver dropped");
                            }
                        }
                        Err(e) => warn!("Dropping undecodable event: {}", e),
                    },
                    _ => debug!("Dropping data for unknown subscription {:?}", msg.id),
                }
            }
            "subscribe_success" => {
                let Some(id) = msg.id else { return Ok(()) };
                if let Some(channel) = session.pending_subs.remove(&id) {
                    debug!("Subscribed to {}", channel);
                    for reply in self.sub_waiters.remove(&channel).unwrap_or_default() {
                        let _ = reply.send(Ok(()));
                    }
                    session.channels.insert(id.clone(), channel);
                    session.resubscribing.remove(&id);
                    self.check_ready(session, out).await?;
                }
            }
            "subscribe_error" => {
                let Some(id) = msg.id else { return Ok(()) };
                let err = classify_errors(&msg.errors);
                if let Some(channel) = session.pending_subs.remove(&id) {
                    warn!("Subscription to {} rejected: {}", channel, err);
                    self.desired.remove(&channel);
                    for reply in self.sub_waiters.remove(&channel).unwrap_or_default() {
                        let _ = reply.send(Err(TransportError::Rejected(err.to_string())));
                    }
                    session.resubscribing.remove(&id);
                    if matches!(err, TransportError::AuthFailed(_)) {
                        return Err(SessionEnd::Lost(err));
                    }
                    self.check_ready(session, out).await?;
                }
            }
            "publish_success" => {
                let Some(id) = msg.id else { return Ok(()) };
                if let Some(pending) = session.inflight.remove(&id) {
                    let result = if msg.failed.is_empty() {
                        Ok(())
                    } else {
                        Err(TransportError::Rejected(format!(
                            "Publish to {} failed: {:?}",
                            pending.channel, msg.failed
                        )))
                    };
                    let _ = pending.reply.send(result);
                }
            }
            "publish_error" => {
                let Some(id) = msg.id else { return Ok(()) };
                if let Some(pending) = session.inflight.remove(&id) {
                    let _ = pending.reply.send(Err(classify_errors(&msg.errors)));
                }
            }
            "error" | "connection_error" => {
                let err = classify_errors(&msg.errors);
                error!("Server error: {}", err);
                if matches!(err, TransportError::AuthFailed(_)) {
                    return Err(SessionEnd::Lost(err));
                }
            }
            other => trace!("Ignoring server message {}", other),
        }
        Ok(())
    }
}

async fn send(out: &mpsc::Sender<Message>, text: String) -> Result<(), SessionEnd> {
    out.send(Message::Text(text))
        .await
        .map_err(|_| SessionEnd::Lost(TransportError::ConnectFailed("Writer stopped".to_string())))
}

async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = sink.send(msg).await {
            debug!("WebSocket write failed: {}", e);
            return;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Handle to the WebSocket pub/sub connection
pub struct TransportClient {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    max_frame_bytes: usize,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TransportClient {
    /// Connect to the endpoint and spawn the connection task
    ///
    /// The first connection attempt is made here so configuration and
    /// credential problems surface immediately.
    pub async fn connect(
        config: TransportConfig,
        signer: Arc<dyn RequestSigner>,
    ) -> Result<(Self, mpsc::Receiver<InboundMessage>), TransportError> {
        let proxy = match &config.proxy {
            Some(url) => ProxySettings::explicit(url.clone()),
            None => ProxySettings::from_env(config.endpoint.scheme() == "wss"),
        };
        let opts = SocketOpts::from_tcp_config(&config.tcp);
        let retry = config.retry.to_retry_config();
        let max_frame_bytes = config.max_frame_bytes;
        let connector = if config.endpoint.scheme() == "wss" {
            Connector::Rustls(client_config(config.trusted_root.as_deref())?)
        } else {
            Connector::Plain
        };

        let endpoint = Endpoint {
            config,
            signer,
            proxy,
            opts,
            connector,
        };
        let first = endpoint.open().await?;

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let cancel = CancellationToken::new();

        let connection = Connection {
            endpoint,
            retry,
            desired: BTreeSet::new(),
            queue: VecDeque::new(),
            sub_waiters: HashMap::new(),
            next_seq: 0,
            inbound: inbound_tx,
            status: status_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(connection.run(first, cmd_rx));

        let client = TransportClient {
            commands: cmd_tx,
            status: status_rx,
            max_frame_bytes,
            cancel,
            task: Mutex::new(Some(task)),
        };
        Ok((client, inbound_rx))
    }

    /// Current connection status
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Watch connection status changes
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    async fn request(&self, cmd: Command, rx: oneshot::Receiver<Result<(), TransportError>>) -> Result<(), TransportError> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| TransportError::Closed)?;
        rx.await.map_err(|_| TransportError::Closed)?
    }
}

#[async_trait]
impl PubSub for TransportClient {
    async fn subscribe(&self, channel: &str) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::Subscribe {
            channel: channel.to_string(),
            reply,
        };
        self.request(cmd, rx).await
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), TransportError> {
        check_frame(payload.len(), self.max_frame_bytes)?;
        let (reply, rx) = oneshot::channel();
        let cmd = Command::Publish {
            channel: channel.to_string(),
            payload,
            reply,
        };
        self.request(cmd, rx).await
    }

    fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Transport task ended abnormally: {}", e);
            }
        }
        Ok(())
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
