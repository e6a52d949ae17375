//! Gateway HTTP + WebSocket server (single port).

use crate::config::Config;
use crate::dispatch::{screenshot, DispatchSettings, Dispatcher, FAILED_STATUS};
use crate::exec::Allowlist;
use crate::gateway::protocol::{
    CommandRequest, EventSink, OutboundEvent, WsFrame, COMMAND_REQUEST,
};
use crate::hosts;
use crate::supervisor::{Session, SessionRegistry};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Shared state for the gateway.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub dispatcher: Arc<Dispatcher>,
    /// Same registry the dispatcher uses; disconnects and shutdown evict through it.
    pub registry: Arc<SessionRegistry>,
}

impl GatewayState {
    /// Compile the allowlist and build the registry and dispatcher for `config`.
    pub fn from_config(config: Config) -> Result<Self> {
        let allowlist = Allowlist::new(&config.allowed_commands)
            .context("compiling allowed_commands")?;
        if allowlist.is_empty() {
            log::warn!("allowed_commands is empty; every plain command will be rejected");
        }
        let registry = Arc::new(SessionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(allowlist),
            registry.clone(),
            DispatchSettings::from_config(&config),
        ));
        Ok(Self {
            config: Arc::new(config),
            dispatcher,
            registry,
        })
    }
}

/// Build the router: health, WebSocket, and screenshot files.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/ws", get(ws_handler))
        .route(
            &format!("{}/:name", screenshot::SCREENSHOT_ROUTE),
            get(screenshot_file),
        )
        .with_state(state)
}

/// Run the gateway server; binds to http_listen_address:http_listen_port.
/// Blocks until shutdown (Ctrl+C or SIGTERM), then kills every session's processes.
pub async fn run_gateway(config: Config) -> Result<()> {
    if let Some(entries) = config.host_entries.as_deref() {
        if let Err(e) = hosts::append_host_entries(std::path::Path::new(hosts::HOSTS_FILE), entries) {
            log::warn!("could not add host entries: {:#}", e);
        }
    }

    let bind_addr = config.bind_addr();
    let state = GatewayState::from_config(config)?;
    let registry = state.registry.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server exited")?;
    registry.clear().await;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, stopping all sessions");
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "port": state.config.http_listen_port,
    }))
}

/// GET /webscreenshots/:name serves a captured screenshot.
async fn screenshot_file(State(state): State<GatewayState>, Path(name): Path<String>) -> Response {
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let path = state.config.screenshot_dir.join(&name);
    match tokio::fs::read(&path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "image/jpeg")], bytes).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET /ws upgrades to WebSocket. Each connection is one session.
async fn ws_handler(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: GatewayState) {
    let session_id = format!("sid-{}", uuid::Uuid::new_v4());
    log::info!("client connected with sid: {}", session_id);
    let session = state.registry.open(&session_id).await;

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<OutboundEvent>();
    let writer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if ws_tx.send(Message::Text(event.to_json())).await.is_err() {
                break;
            }
        }
    });
    let sink: Arc<dyn EventSink> = Arc::new(event_tx);

    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        handle_frame(&state, &session, &text, &sink);
    }

    log::info!("client disconnected with sid: {}", session_id);
    state.registry.close(&session_id).await;
    drop(sink);
    writer.abort();
}

/// Parse one text frame and hand the request to the dispatcher on its own task,
/// so a halt can arrive while a command is still running.
fn handle_frame(state: &GatewayState, session: &Arc<Session>, text: &str, sink: &Arc<dyn EventSink>) {
    let session_id = session.id();
    let frame: WsFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            log::warn!("ignoring unparseable frame from {}: {}", session_id, e);
            return;
        }
    };
    if frame.typ != COMMAND_REQUEST {
        log::warn!("received unknown message: {}:{}", frame.typ, frame.data);
        return;
    }
    log::info!("received message: {} sid: {}", frame.data, session_id);

    let raw_id = frame.data.get("id").map(|v| match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    });
    let request = match CommandRequest::parse(frame.data) {
        Ok(r) => r,
        Err(e) => {
            log::warn!("invalid commandRequest from {}: {}", session_id, e);
            if let Some(id) = raw_id {
                sink.emit(OutboundEvent::stderr(&id, format!("{}\n\n", e)));
                sink.emit(OutboundEvent::completed(&id, FAILED_STATUS));
            }
            return;
        }
    };

    let dispatcher = state.dispatcher.clone();
    let session = session.clone();
    let sink = sink.clone();
    tokio::spawn(async move {
        dispatcher.handle(&session, request, sink).await;
    });
}
