//! HTTP surface and WebSocket transport.
//!
//! The WebSocket endpoint (`/ws`) upgrades and bridges the socket onto
//! the same frame handler the TCP transport uses, via a
//! `tokio::io::DuplexStream`: every WebSocket text frame is one JSON
//! frame line. From the relay's perspective a WebSocket client is just
//! another byte stream.
//!
//! The HTTP side carries the prekey directory publish endpoint
//! (`POST /prekeys/bundle`, bearer-token authenticated) and a health
//! probe. Bundle *fetches* go through the `GetPrekeyBundle` frame, not
//! HTTP, because fetching consumes a one-time prekey.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tower_http::cors::CorsLayer;

use chai_sdk::x3dh::PreKeyBundle;

use crate::connection;
use crate::db::DirectoryError;
use crate::server::SharedState;

pub async fn serve(state: Arc<SharedState>, addr: &str) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "web surface listening");
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/prekeys/bundle", post(publish_bundle))
        .route("/ws", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct PublishBundleRequest {
    bundle: PreKeyBundle,
}

async fn publish_bundle(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    body: axum::Json<PublishBundleRequest>,
) -> impl IntoResponse {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let Some(user_id) = token.and_then(|t| state.resolve_token(t)) else {
        return (StatusCode::UNAUTHORIZED, "invalid bearer token").into_response();
    };

    let now = state.now_ms();
    match state.db.lock().publish_bundle(&user_id, &body.bundle, now) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(DirectoryError::BadSignature | DirectoryError::IdentityMismatch) => {
            (StatusCode::BAD_REQUEST, "BadSignature").into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "bundle publish failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal").into_response()
        }
    }
}

async fn ws_upgrade(
    State(state): State<Arc<SharedState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let bridged = bridge_ws(socket);
        connection::handle(bridged, state).await;
    })
}

// ── WebSocket ↔ frame-stream bridge ────────────────────────────────

/// A WebSocket bridged as `AsyncRead + AsyncWrite` for the connection
/// handler. Two background tasks shuttle bytes through a
/// `DuplexStream`: inbound WS frames become newline-terminated lines,
/// outbound lines become WS text frames.
pub struct WsBridge {
    reader: tokio::io::ReadHalf<tokio::io::DuplexStream>,
    writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
}

fn bridge_ws(socket: WebSocket) -> WsBridge {
    let (ws_tx, mut ws_rx) = tokio::sync::mpsc::channel::<WsMessage>(64);

    // handler_side is what the connection handler reads/writes;
    // bridge_side is what the shuttle tasks read/write.
    let (handler_side, bridge_side) = tokio::io::duplex(chai_sdk::frame::MAX_FRAME_BYTES);
    let (handler_read, handler_write) = tokio::io::split(handler_side);
    let (mut bridge_read, mut bridge_write) = tokio::io::split(bridge_side);

    // Task 1 owns the WebSocket: inbound frames go to the bridge, and
    // messages from the channel go out as WS frames.
    tokio::spawn(async move {
        let mut socket = socket;
        loop {
            tokio::select! {
                frame = socket.recv() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            let mut bytes = text.as_bytes().to_vec();
                            bytes.push(b'\n');
                            if bridge_write.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Binary(data))) => {
                            let mut bytes = data.to_vec();
                            if !bytes.ends_with(b"\n") {
                                bytes.push(b'\n');
                            }
                            if bridge_write.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {} // Ping/Pong handled by axum
                        Some(Err(_)) => break,
                    }
                }
                outbound = ws_rx.recv() => {
                    match outbound {
                        Some(msg) => {
                            if socket.send(msg).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        let _ = bridge_write.shutdown().await;
        let _ = socket.send(WsMessage::Close(None)).await;
    });

    // Task 2: lines written by the connection handler become WS text
    // frames.
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        let mut line_buf = Vec::new();
        loop {
            match bridge_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    line_buf.extend_from_slice(&buf[..n]);
                    while let Some(pos) = line_buf.iter().position(|&b| b == b'\n') {
                        let line = String::from_utf8_lossy(&line_buf[..pos]).to_string();
                        line_buf.drain(..pos + 1);
                        if ws_tx.send(WsMessage::Text(line.into())).await.is_err() {
                            return;
                        }
                    }
                }
                Err(_) => break,
            }
        }
    });

    WsBridge { reader: handler_read, writer: handler_write }
}

impl AsyncRead for WsBridge {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for WsBridge {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}
