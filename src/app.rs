//! HTTP/WebSocket surface for the canvas server.
//!
//! One WebSocket endpoint carries the whole sync protocol; a health
//! endpoint exposes server statistics. Each connection gets a send task
//! (channel -> encoded binary frames) and a receive task (decode ->
//! dispatch); the session is unregistered when either side ends.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::Method,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::sync::grid::{Color, Edit};
use crate::sync::protocol::{
    ClientMessage, ErrorCode, ServerMessage, SyncProtocol, PROTOCOL_VERSION,
};
use crate::sync::{SyncError, SyncServer};

/// Build the application router.
pub fn router(sync_server: Arc<SyncServer>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .with_state(sync_server)
        .layer(cors)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub protocol_version: u8,
    pub uptime_seconds: u64,
    pub online: usize,
    pub pixels: usize,
}

/// Health check endpoint.
async fn health_check(State(server): State<Arc<SyncServer>>) -> Json<HealthResponse> {
    let stats = server.stats();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION,
        uptime_seconds: stats.uptime_seconds,
        online: stats.online,
        pixels: stats.pixels,
    })
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(server): State<Arc<SyncServer>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, server))
}

/// Handle one WebSocket connection for its whole lifetime.
async fn handle_websocket(socket: WebSocket, server: Arc<SyncServer>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let session_id = uuid::Uuid::new_v4().to_string();
    info!(%session_id, "new WebSocket connection");

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Welcome goes through the same channel as everything else, so the wire
    // order is Welcome, Init, OnlineCount.
    let _ = tx.send(ServerMessage::Welcome {
        protocol_version: PROTOCOL_VERSION,
        session_id: session_id.clone(),
        server_time: chrono::Utc::now().timestamp(),
    });
    server.register_session(&session_id, tx.clone());

    let session_id_send = session_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match SyncProtocol::encode_server(&msg) {
                Ok(bytes) => {
                    if ws_sender.send(Message::Binary(bytes.to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // Dropping a frame would leave this client silently
                    // desynced; closing forces a reconnect and a fresh
                    // snapshot instead.
                    warn!(session_id = %session_id_send, error = %e, "failed to encode message, closing connection");
                    break;
                }
            }
        }
        debug!(session_id = %session_id_send, "send task ended");
    });

    let session_id_recv = session_id.clone();
    let server_recv = server.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => match SyncProtocol::decode_client(&data) {
                    Ok(client_msg) => {
                        handle_client_message(client_msg, &session_id_recv, &server_recv, &tx);
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to decode binary message");
                        let _ = tx.send(ServerMessage::Error {
                            code: ErrorCode::InvalidMessage,
                            message: e.to_string(),
                            retry_after_ms: None,
                        });
                    }
                },
                Message::Text(text) => {
                    handle_text_message(&text, &session_id_recv, &server_recv, &tx);
                }
                Message::Ping(_) => {
                    // Pong is handled by axum automatically
                }
                Message::Close(_) => {
                    info!(session_id = %session_id_recv, "WebSocket closed by client");
                    break;
                }
                _ => {}
            }
        }
        debug!(session_id = %session_id_recv, "receive task ended");
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    server.unregister_session(&session_id);
}

/// Dispatch one decoded client message.
fn handle_client_message(
    msg: ClientMessage,
    session_id: &str,
    server: &Arc<SyncServer>,
    tx: &mpsc::UnboundedSender<ServerMessage>,
) {
    match msg {
        ClientMessage::Hello {
            protocol_version,
            client_id,
            username,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                let _ = tx.send(ServerMessage::Error {
                    code: ErrorCode::VersionMismatch,
                    message: format!(
                        "protocol version {} not supported (server speaks {})",
                        protocol_version, PROTOCOL_VERSION
                    ),
                    retry_after_ms: None,
                });
                return;
            }
            let _ = server.identify_session(session_id, client_id, username);
            debug!(session_id, "hello received");
        }

        ClientMessage::Pixel { x, y, color } => {
            if let Err(e) = server.handle_edit(session_id, Edit { x, y, color }) {
                let _ = tx.send(error_response(e));
            }
        }

        ClientMessage::Chat(chat) => {
            if let Err(e) = server.handle_chat(session_id, chat) {
                let _ = tx.send(error_response(e));
            }
        }

        ClientMessage::Ping { timestamp } => {
            let _ = tx.send(ServerMessage::Pong {
                timestamp,
                server_time: chrono::Utc::now().timestamp(),
            });
        }

        ClientMessage::Goodbye { reason } => {
            info!(session_id, reason = reason.as_deref().unwrap_or(""), "goodbye");
        }
    }
}

/// JSON text frames are accepted for debugging and simple clients.
fn handle_text_message(
    text: &str,
    session_id: &str,
    server: &Arc<SyncServer>,
    tx: &mpsc::UnboundedSender<ServerMessage>,
) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(client_msg) => handle_client_message(client_msg, session_id, server, tx),
        Err(e) => {
            warn!(session_id, error = %e, "failed to parse text message");
            let _ = tx.send(ServerMessage::Error {
                code: text_error_code(text),
                message: e.to_string(),
                retry_after_ms: None,
            });
        }
    }
}

/// Error code for an unparseable text frame. A pixel frame whose only
/// problem is its color string gets the specific code; the classification
/// re-parses the frame loosely and runs the color through `Color::from_str`
/// rather than inspecting serde's error text.
fn text_error_code(text: &str) -> ErrorCode {
    #[derive(Deserialize)]
    struct RawPixel {
        color: Option<String>,
    }
    #[derive(Deserialize)]
    struct RawFrame {
        #[serde(rename = "Pixel")]
        pixel: RawPixel,
    }

    match serde_json::from_str::<RawFrame>(text) {
        Ok(frame) => match frame.pixel.color {
            Some(color) if color.parse::<Color>().is_err() => ErrorCode::InvalidColor,
            _ => ErrorCode::InvalidMessage,
        },
        Err(_) => ErrorCode::InvalidMessage,
    }
}

/// Map a sync error to the wire error message.
fn error_response(err: SyncError) -> ServerMessage {
    let (code, retry_after_ms) = match &err {
        SyncError::OutOfBounds { .. } => (ErrorCode::OutOfBounds, None),
        SyncError::RateLimited(remaining) => {
            (ErrorCode::RateLimited, Some(remaining.as_millis() as u64))
        }
        _ => (ErrorCode::ServerError, None),
    };
    ServerMessage::Error {
        code,
        message: err.to_string(),
        retry_after_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CanvasStore, StorageConfig};
    use crate::sync::client::{ClientProfile, SyncClient, SyncEvent};
    use crate::sync::grid::Color;
    use crate::sync::SyncServerConfig;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    async fn spawn_app(config: SyncServerConfig) -> (String, Arc<SyncServer>, TempDir) {
        let dir = tempdir().unwrap();
        let store = CanvasStore::new(&StorageConfig::new(dir.path().join("canvas.json")));
        let server = Arc::new(SyncServer::new(store, config));

        let app = router(server.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("ws://{}/ws", addr), server, dir)
    }

    fn no_cooldown() -> SyncServerConfig {
        SyncServerConfig {
            cooldown: Duration::ZERO,
            ..Default::default()
        }
    }

    async fn connect(url: &str) -> SyncClient {
        let mut client = SyncClient::connect(url, ClientProfile::generate(), Duration::ZERO)
            .await
            .unwrap();
        // Handshake completes with the snapshot
        wait_for(&mut client, |e| matches!(e, SyncEvent::SnapshotApplied { .. })).await;
        client
    }

    async fn wait_for(
        client: &mut SyncClient,
        pred: impl Fn(&SyncEvent) -> bool,
    ) -> SyncEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match client.next_event().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => continue,
                    None => panic!("client disconnected while waiting"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn drain_for(client: &mut SyncClient, window: Duration) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        loop {
            match tokio::time::timeout(window, client.next_event()).await {
                Ok(Some(event)) => events.push(event),
                _ => return events,
            }
        }
    }

    fn color(s: &str) -> Color {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_edit_reaches_other_client_only() {
        let (url, server, _dir) = spawn_app(no_cooldown()).await;

        let mut a = connect(&url).await;
        let mut b = connect(&url).await;

        a.send_pixel(5, 5, Some(color("#00FF00"))).unwrap();

        let event = wait_for(&mut b, |e| matches!(e, SyncEvent::RemotePixel { .. })).await;
        match event {
            SyncEvent::RemotePixel { x, y, color: c } => {
                assert_eq!((x, y), (5, 5));
                assert_eq!(c, Some(color("#00FF00")));
            }
            _ => unreachable!(),
        }

        // Both mirrors converge to the server grid
        assert_eq!(b.mirror().read().get(5, 5), Some(color("#00FF00")));
        assert_eq!(a.mirror().read().get(5, 5), Some(color("#00FF00")));
        assert_eq!(server.pixel(5, 5), Some(color("#00FF00")));

        // The sender must never get its own edit back
        let echoes = drain_for(&mut a, Duration::from_millis(200)).await;
        assert!(
            !echoes.iter().any(|e| matches!(e, SyncEvent::RemotePixel { .. })),
            "sender received its own edit: {:?}",
            echoes
        );
    }

    #[tokio::test]
    async fn test_late_joiner_gets_full_snapshot() {
        let (url, _server, _dir) = spawn_app(no_cooldown()).await;

        let mut a = connect(&url).await;
        a.send_pixel(1, 1, Some(color("#111111"))).unwrap();
        a.send_pixel(2, 2, Some(color("#222222"))).unwrap();
        a.send_pixel(2, 2, None).unwrap();

        // Give the server a moment to apply before the late join
        tokio::time::sleep(Duration::from_millis(100)).await;

        let late = connect(&url).await;
        let mirror = late.mirror();
        let mirror = mirror.read();
        assert_eq!(mirror.get(1, 1), Some(color("#111111")));
        assert_eq!(mirror.get(2, 2), None);
        assert_eq!(mirror.len(), 1);
    }

    #[tokio::test]
    async fn test_server_gate_rejects_rapid_edits_over_wire() {
        let (url, server, _dir) = spawn_app(SyncServerConfig {
            cooldown: Duration::from_secs(30),
            ..Default::default()
        })
        .await;

        // Client-side gate disabled: a non-conforming client
        let mut a = SyncClient::connect(&url, ClientProfile::generate(), Duration::ZERO)
            .await
            .unwrap();
        wait_for(&mut a, |e| matches!(e, SyncEvent::SnapshotApplied { .. })).await;

        a.send_pixel(1, 1, Some(color("#FF0000"))).unwrap();
        a.send_pixel(2, 2, Some(color("#FF0000"))).unwrap();

        let event = wait_for(&mut a, |e| matches!(e, SyncEvent::ServerError { .. })).await;
        match event {
            SyncEvent::ServerError {
                code,
                retry_after_ms,
                ..
            } => {
                assert_eq!(code, ErrorCode::RateLimited);
                assert!(retry_after_ms.unwrap() > 25_000);
            }
            _ => unreachable!(),
        }

        // First edit landed, the flooded one did not
        assert_eq!(server.pixel(1, 1), Some(color("#FF0000")));
        assert_eq!(server.pixel(2, 2), None);
    }

    #[tokio::test]
    async fn test_out_of_bounds_rejected_over_wire() {
        let (url, server, _dir) = spawn_app(SyncServerConfig {
            width: 100,
            height: 100,
            cooldown: Duration::ZERO,
            ..Default::default()
        })
        .await;

        let mut a = connect(&url).await;
        a.send_pixel(100, 0, Some(color("#FF0000"))).unwrap();

        let event = wait_for(&mut a, |e| matches!(e, SyncEvent::ServerError { .. })).await;
        assert!(matches!(
            event,
            SyncEvent::ServerError {
                code: ErrorCode::OutOfBounds,
                ..
            }
        ));
        assert!(server.grid_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_chat_is_echoed_to_everyone_including_sender() {
        let (url, _server, _dir) = spawn_app(no_cooldown()).await;

        let mut a = connect(&url).await;
        let mut b = connect(&url).await;

        a.send_chat("hello canvas").unwrap();

        for client in [&mut a, &mut b] {
            let event = wait_for(client, |e| matches!(e, SyncEvent::Chat(_))).await;
            match event {
                SyncEvent::Chat(chat) => assert_eq!(chat.message, "hello canvas"),
                _ => unreachable!(),
            }
        }
    }

    #[tokio::test]
    async fn test_online_count_tracks_connections() {
        let (url, server, _dir) = spawn_app(no_cooldown()).await;

        let mut a = connect(&url).await;
        assert_eq!(server.online_count(), 1);

        let b = connect(&url).await;
        let event = wait_for(&mut a, |e| {
            matches!(e, SyncEvent::OnlineCount { count: 2 })
        })
        .await;
        assert!(matches!(event, SyncEvent::OnlineCount { count: 2 }));

        b.goodbye();
        wait_for(&mut a, |e| matches!(e, SyncEvent::OnlineCount { count: 1 })).await;
    }

    #[tokio::test]
    async fn test_text_frame_color_errors_get_specific_code() {
        let (_url, server, _dir) = spawn_app(no_cooldown()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        // A structurally valid pixel frame with a bad color string
        handle_text_message(
            r##"{"Pixel":{"x":1,"y":1,"color":"#GGGGGG"}}"##,
            "s",
            &server,
            &tx,
        );
        match rx.try_recv().unwrap() {
            ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidColor),
            other => panic!("unexpected message: {:?}", other),
        }

        // Anything else unparseable is just an invalid message
        handle_text_message("{not json", "s", &server, &tx);
        match rx.try_recv().unwrap() {
            ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidMessage),
            other => panic!("unexpected message: {:?}", other),
        }

        // Nothing reached the grid
        assert!(server.grid_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_health_reports_stats() {
        let (_url, server, _dir) = spawn_app(no_cooldown()).await;

        let response = health_check(State(server)).await;
        assert_eq!(response.0.status, "healthy");
        assert_eq!(response.0.protocol_version, PROTOCOL_VERSION);
        assert_eq!(response.0.online, 0);
        assert_eq!(response.0.pixels, 0);
    }
}
