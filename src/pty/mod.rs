//! Interactive shells streamed over WebSocket, either inside a sandbox
//! container or on the host.

pub mod process;
pub mod session;
pub mod target;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::BackendKind;
use crate::errors::GatewayError;
use crate::models::{ControlMessage, SandboxId, TerminalMode};
use crate::platform::ContainerPlatform;
use crate::proxy::is_loopback;
use process::{spawn, SpawnRequest};
use session::{classify_frame, ConnectionId, ConnectionRegistry, Frame, Phase};
use target::select_target;

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Output polls tolerated after the child exits before the stream is
/// considered finished even if a pipe is still held open.
const EXIT_DRAIN_TICKS: u32 = 5;

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub allow_remote: bool,
    pub host_shell: String,
    pub workdir: PathBuf,
    pub backend: BackendKind,
    pub poll_interval: Duration,
    pub termination_grace: Duration,
}

pub struct PtyBridge {
    registry: Arc<ConnectionRegistry>,
    platform: Arc<dyn ContainerPlatform>,
    config: BridgeConfig,
}

impl PtyBridge {
    pub fn new(platform: Arc<dyn ContainerPlatform>, config: BridgeConfig) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            platform,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn admits(&self, peer: &SocketAddr) -> bool {
        self.config.allow_remote || is_loopback(peer.ip())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub mode: Option<String>,
    pub container: Option<String>,
    pub cols: Option<String>,
    pub rows: Option<String>,
}

fn dimension(raw: Option<&str>, default: u16) -> u16 {
    raw.and_then(|value| value.trim().parse::<u16>().ok())
        .filter(|value| (1..=1000).contains(value))
        .unwrap_or(default)
}

/// Terminal routes apply the remote policy themselves so a rejected peer
/// still gets a text frame; the JSON routes refuse it with a 403.
pub fn build_router(bridge: Arc<PtyBridge>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/connections", get(connections))
        .route_layer(middleware::from_fn_with_state(bridge.clone(), local_only))
        .route("/", get(terminal))
        .route("/ws", get(terminal))
        .route("/terminal", get(terminal))
        .with_state(bridge)
}

async fn local_only(
    State(bridge): State<Arc<PtyBridge>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    if bridge.admits(&peer) {
        next.run(req).await
    } else {
        warn!(client = %peer, path = %req.uri().path(), "rejected remote request");
        GatewayError::RemoteRejected.into_response()
    }
}

async fn health(State(bridge): State<Arc<PtyBridge>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connections": bridge.registry.len(),
    }))
}

async fn connections(State(bridge): State<Arc<PtyBridge>>) -> impl IntoResponse {
    Json(bridge.registry.summaries())
}

async fn terminal(
    State(bridge): State<Arc<PtyBridge>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(params): Query<ConnectParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match ws {
        Ok(ws) => ws
            .on_upgrade(move |socket| run_connection(bridge, socket, params, peer))
            .into_response(),
        Err(_) => (
            StatusCode::OK,
            "sandbox terminal server: connect with a WebSocket client\n",
        )
            .into_response(),
    }
}

type SharedSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

#[derive(Debug)]
enum BridgeEvent {
    ProcessExited,
    SocketFailed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CloseReason {
    ClientClosed,
    SocketError,
    ProcessExited,
    SpawnFailed,
}

async fn send_text(sink: &SharedSink, text: String) -> bool {
    sink.lock().await.send(Message::Text(text.into())).await.is_ok()
}

async fn close_socket(sink: &SharedSink) {
    let _ = sink.lock().await.close().await;
}

/// One connection from open to closed. Every exit path goes through
/// [`ConnectionRegistry::close`].
async fn run_connection(
    bridge: Arc<PtyBridge>,
    socket: WebSocket,
    params: ConnectParams,
    peer: SocketAddr,
) {
    let (sink, mut stream) = socket.split();
    let sink: SharedSink = Arc::new(Mutex::new(sink));

    if !bridge.admits(&peer) {
        warn!(client = %peer, "rejected remote terminal connection");
        send_text(&sink, GatewayError::RemoteRejected.to_string()).await;
        close_socket(&sink).await;
        return;
    }

    // Opening
    let mode = TerminalMode::parse(params.mode.as_deref());
    let container = params.container.as_deref().and_then(SandboxId::parse);
    let cols = dimension(params.cols.as_deref(), DEFAULT_COLS);
    let rows = dimension(params.rows.as_deref(), DEFAULT_ROWS);
    let registry = bridge.registry.clone();
    let grace = bridge.config.termination_grace;
    let id = registry.open(mode, container.as_ref().map(SandboxId::to_string));
    info!(connection = %id, client = %peer, %mode, container = ?container, "terminal opened");

    // Spawning
    registry.set_phase(&id, Phase::Spawning);
    let target = select_target(
        bridge.platform.as_ref(),
        mode,
        container.as_ref(),
        &bridge.config.host_shell,
        &bridge.config.workdir,
    )
    .await;
    let request = SpawnRequest {
        command: target.command,
        cwd: target.cwd,
        cols,
        rows,
    };
    let spawned = match spawn(bridge.config.backend, &request) {
        Ok(spawned) => spawned,
        Err(err) => {
            warn!(connection = %id, %err, "shell spawn failed");
            registry.set_phase(&id, Phase::Closing);
            send_text(&sink, format!("Error: {err}")).await;
            close_socket(&sink).await;
            finish(&registry, &id, grace, CloseReason::SpawnFailed);
            return;
        }
    };
    registry.attach_process(&id, spawned.child, spawned.pipes, grace);

    let (events_tx, mut events_rx) = mpsc::channel(4);
    let timer = tokio::spawn(poll_output(
        registry.clone(),
        id,
        spawned.output,
        sink.clone(),
        events_tx,
        bridge.config.poll_interval,
    ));
    registry.attach_timer(&id, timer);

    // Streaming
    registry.set_phase(&id, Phase::Streaming);
    let reason = loop {
        tokio::select! {
            frame = stream.next() => {
                let payload = match frame {
                    Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec(),
                    Some(Ok(Message::Binary(bytes))) => bytes.to_vec(),
                    Some(Ok(Message::Close(_))) | None => break CloseReason::ClientClosed,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        debug!(connection = %id, %err, "socket error");
                        break CloseReason::SocketError;
                    }
                };
                if !deliver(&registry, &id, &payload).await {
                    break CloseReason::ProcessExited;
                }
            }
            event = events_rx.recv() => match event {
                Some(BridgeEvent::SocketFailed) => break CloseReason::SocketError,
                Some(BridgeEvent::ProcessExited) | None => break CloseReason::ProcessExited,
            }
        }
    };

    // Closing
    registry.set_phase(&id, Phase::Closing);
    finish(&registry, &id, grace, reason);
    if reason == CloseReason::ProcessExited {
        send_text(&sink, "\r\n[process exited]\r\n".to_string()).await;
    }
    if reason != CloseReason::SocketError {
        close_socket(&sink).await;
    }
}

fn finish(registry: &ConnectionRegistry, id: &ConnectionId, grace: Duration, reason: CloseReason) {
    match registry.close(id, grace) {
        Some(report) => info!(
            connection = %id,
            ?reason,
            timer_cancelled = report.timer_cancelled,
            pipes_closed = report.pipes_closed,
            signal_sent = report.signal_sent,
            phase = ?Phase::Closed,
            "terminal closed"
        ),
        None => debug!(connection = %id, ?reason, "terminal already closed"),
    }
}

/// Applies one inbound frame. Returns `false` once the child's input is gone.
async fn deliver(registry: &ConnectionRegistry, id: &ConnectionId, payload: &[u8]) -> bool {
    match classify_frame(payload) {
        Frame::Control(ControlMessage::Ping) => {
            debug!(connection = %id, "ping");
            true
        }
        Frame::Control(ControlMessage::Resize { cols, rows }) => {
            let result = registry.resize(id, cols, rows);
            debug!(connection = %id, cols, rows, ?result, "resize");
            true
        }
        Frame::Input(bytes) => match registry.input(id) {
            Some(input) => input.send(bytes).await.is_ok(),
            None => false,
        },
    }
}

/// The recurring timer: forwards whatever the child produced since the last
/// tick and reports when the child is done.
async fn poll_output(
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
    mut output: mpsc::Receiver<Vec<u8>>,
    sink: SharedSink,
    events: mpsc::Sender<BridgeEvent>,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks_since_exit = 0u32;

    loop {
        ticker.tick().await;

        let mut chunk = Vec::new();
        let mut drained = false;
        loop {
            match output.try_recv() {
                Ok(bytes) => chunk.extend_from_slice(&bytes),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    drained = true;
                    break;
                }
            }
        }

        if !chunk.is_empty() {
            let message = match String::from_utf8(chunk) {
                Ok(text) => Message::Text(text.into()),
                Err(err) => Message::Binary(err.into_bytes().into()),
            };
            if sink.lock().await.send(message).await.is_err() {
                let _ = events.send(BridgeEvent::SocketFailed).await;
                return;
            }
        }

        if registry.process_exited(&id) {
            ticks_since_exit += 1;
        }
        if drained || ticks_since_exit > EXIT_DRAIN_TICKS {
            let _ = events.send(BridgeEvent::ProcessExited).await;
            return;
        }
    }
}
