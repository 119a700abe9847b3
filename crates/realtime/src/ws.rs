// HTTP surface: WebSocket upgrade, health and stats endpoints.

use std::{sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header::HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tandem_common::{
    protocol::ws::{encode_envelope, Envelope},
    types::ConnectionStats,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    connection::{ConnectionId, OutboundFrame},
    error::RealtimeError,
    service::RealtimeService,
};

const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
struct RouterState {
    service: Arc<RealtimeService>,
    max_frame_bytes: usize,
}

pub fn router(service: Arc<RealtimeService>, max_frame_bytes: usize) -> Router {
    let state = RouterState { service, max_frame_bytes };
    Router::new()
        .route("/healthz", get(healthz))
        .route("/stats", get(stats))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn stats(State(state): State<RouterState>) -> Json<ConnectionStats> {
    Json(state.service.stats().await)
}

async fn ws_upgrade(State(state): State<RouterState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let service = state.service.clone();
    ws.max_frame_size(state.max_frame_bytes)
        .max_message_size(state.max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(service, socket))
}

/// Owns one transport: forwards queued outbound frames and feeds inbound
/// text to the service until either side closes.
async fn handle_socket(service: Arc<RealtimeService>, mut socket: WebSocket) {
    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<OutboundFrame>();
    let connection_id = service.open_connection(outbound_sender).await;

    loop {
        tokio::select! {
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(OutboundFrame::Message(envelope)) => {
                        if send_envelope(&mut socket, &envelope).await.is_err() {
                            break;
                        }
                    }
                    Some(OutboundFrame::Close) => {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        service.handle_text(connection_id, raw_message.as_str()).await;
                    }
                    Ok(Message::Binary(_)) => {
                        let error = RealtimeError::Parse("binary frames are not supported".into());
                        if send_envelope(&mut socket, &error.to_envelope(None)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {}
                    Ok(Message::Close(_)) => break,
                    Err(error) => {
                        debug!(connection_id = %connection_id, error = %error, "transport error");
                        break;
                    }
                }
            }
        }
    }

    drain_and_close(&service, connection_id, &mut outbound_receiver, &mut socket).await;
}

/// Flushes anything queued before a server-initiated close, then tears the
/// connection down.
async fn drain_and_close(
    service: &RealtimeService,
    connection_id: ConnectionId,
    outbound_receiver: &mut mpsc::UnboundedReceiver<OutboundFrame>,
    socket: &mut WebSocket,
) {
    while let Ok(frame) = outbound_receiver.try_recv() {
        if let OutboundFrame::Message(envelope) = frame {
            if send_envelope(socket, &envelope).await.is_err() {
                break;
            }
        }
    }
    service.close_connection(connection_id).await;
}

async fn send_envelope(socket: &mut WebSocket, envelope: &Envelope) -> Result<(), ()> {
    let encoded = encode_envelope(envelope).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = next.run(request).await;

    if let Ok(request_id_header) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, request_id_header);
    }

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
