use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tandem_common::protocol::ws::TaskEventType;
use tandem_realtime::{
    auth::JwtIdentityService, cache::InMemoryCache, config::ServiceSettings, ws, RealtimeService,
};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsFrame, MaybeTlsStream, WebSocketStream,
};

type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const TEST_SECRET: &str = "tandem_test_secret_that_is_definitely_long_enough";

struct TestServer {
    addr: SocketAddr,
    service: Arc<RealtimeService>,
    jwt: JwtIdentityService,
}

impl TestServer {
    async fn start() -> Self {
        let jwt = JwtIdentityService::new(TEST_SECRET).expect("test jwt service should initialize");
        let service = Arc::new(RealtimeService::new(
            ServiceSettings::default(),
            Arc::new(jwt.clone()),
            Arc::new(InMemoryCache::new()),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("test listener should bind");
        let addr = listener.local_addr().expect("listener should expose local address");
        let app = ws::router(service.clone(), 64 * 1024);
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("realtime server should run");
        });
        Self { addr, service, jwt }
    }

    async fn connect(&self) -> ClientSocket {
        let (socket, _) =
            connect_async(format!("ws://{}/ws", self.addr)).await.expect("client should connect");
        socket
    }

    fn token(&self, user_id: &str) -> String {
        self.jwt.issue_token(user_id).expect("token should issue")
    }

    async fn authenticated(&self, user_id: &str, workspace_ids: &[&str]) -> ClientSocket {
        let mut socket = self.connect().await;
        ws_send(
            &mut socket,
            json!({
                "type": "authenticate",
                "data": { "token": self.token(user_id), "workspaceIds": workspace_ids },
            }),
        )
        .await;
        let reply = ws_recv_type(&mut socket, "authenticate").await;
        assert_eq!(reply["data"]["userId"], user_id);
        socket
    }
}

async fn ws_send(socket: &mut ClientSocket, message: Value) {
    socket.send(WsFrame::Text(message.to_string().into())).await.expect("ws message should send");
}

/// Next text frame as JSON, answering transport pings along the way.
async fn ws_recv(socket: &mut ClientSocket) -> Value {
    loop {
        let next = timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("timed out waiting for websocket frame");
        let frame =
            next.expect("websocket should remain open").expect("websocket frame should decode");

        match frame {
            WsFrame::Text(payload) => {
                return serde_json::from_str(&payload).expect("text frame should be json");
            }
            WsFrame::Ping(payload) => {
                socket.send(WsFrame::Pong(payload)).await.expect("pong should send");
            }
            WsFrame::Close(_) => panic!("websocket closed unexpectedly"),
            WsFrame::Binary(_) | WsFrame::Pong(_) | WsFrame::Frame(_) => {}
        }
    }
}

/// Skips frames until one of `message_type` arrives.
async fn ws_recv_type(socket: &mut ClientSocket, message_type: &str) -> Value {
    loop {
        let message = ws_recv(socket).await;
        if message["type"] == message_type {
            return message;
        }
    }
}

/// Asserts no frame of `message_type` arrives within a short window.
async fn assert_no_message(socket: &mut ClientSocket, message_type: &str) {
    let window = timeout(Duration::from_millis(300), async {
        loop {
            match socket.next().await {
                Some(Ok(WsFrame::Text(payload))) => {
                    let message: Value =
                        serde_json::from_str(&payload).expect("text frame should be json");
                    if message["type"] == message_type {
                        return message;
                    }
                }
                Some(Ok(_)) => {}
                _ => std::future::pending::<()>().await,
            }
        }
    })
    .await;
    assert!(window.is_err(), "unexpected {message_type} message: {window:?}");
}

/// Reads until the server closes the socket.
async fn wait_for_close(socket: &mut ClientSocket) {
    let closed = timeout(Duration::from_secs(2), async {
        while let Some(frame) = socket.next().await {
            match frame {
                Ok(WsFrame::Close(_)) | Err(_) => return,
                Ok(_) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "server did not close the socket");
}

#[tokio::test]
async fn authenticate_returns_resolved_user_id() {
    let server = TestServer::start().await;
    let mut socket = server.connect().await;

    ws_send(
        &mut socket,
        json!({ "type": "authenticate", "data": { "token": server.token("u1") }, "requestId": "r1" }),
    )
    .await;

    let reply = ws_recv(&mut socket).await;
    assert_eq!(reply["type"], "authenticate");
    assert_eq!(reply["data"], json!({ "success": true, "userId": "u1" }));
    assert_eq!(reply["requestId"], "r1");
    assert!(reply["timestamp"].is_string());
}

#[tokio::test]
async fn typing_reaches_peer_but_not_sender() {
    let server = TestServer::start().await;
    let mut client_a = server.authenticated("u1", &["w1"]).await;
    let mut client_b = server.authenticated("u2", &["w1"]).await;

    ws_send(
        &mut client_a,
        json!({ "type": "user:typing", "data": { "taskId": "t1" }, "workspaceId": "w1" }),
    )
    .await;

    let relayed = ws_recv_type(&mut client_b, "user:typing").await;
    assert_eq!(relayed["workspaceId"], "w1");
    assert_eq!(relayed["data"]["taskId"], "t1");
    assert_eq!(relayed["data"]["userId"], "u1");
    assert_no_message(&mut client_a, "user:typing").await;
}

#[tokio::test]
async fn invalid_token_gets_auth_error_then_close() {
    let server = TestServer::start().await;
    let mut socket = server.connect().await;

    ws_send(&mut socket, json!({ "type": "authenticate", "data": { "token": "not-a-jwt" } })).await;

    let reply = ws_recv(&mut socket).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["data"]["code"], "AUTH_ERROR");
    wait_for_close(&mut socket).await;
}

#[tokio::test]
async fn malformed_json_is_reported_and_socket_stays_open() {
    let server = TestServer::start().await;
    let mut socket = server.authenticated("u1", &[]).await;

    socket.send(WsFrame::Text("{oops".into())).await.expect("raw frame should send");
    let reply = ws_recv(&mut socket).await;
    assert_eq!(reply["data"]["code"], "PARSE_ERROR");

    ws_send(&mut socket, json!({ "type": "ping", "requestId": "p1" })).await;
    let pong = ws_recv_type(&mut socket, "pong").await;
    assert_eq!(pong["requestId"], "p1");
}

#[tokio::test]
async fn messages_before_authentication_are_unauthorized() {
    let server = TestServer::start().await;
    let mut socket = server.connect().await;

    ws_send(&mut socket, json!({ "type": "task:updated", "data": {} })).await;
    let reply = ws_recv(&mut socket).await;
    assert_eq!(reply["type"], "unauthorized");

    ws_send(&mut socket, json!({ "type": "ping" })).await;
    let pong = ws_recv(&mut socket).await;
    assert_eq!(pong["type"], "pong");
}

#[tokio::test]
async fn binary_frames_are_rejected_without_closing() {
    let server = TestServer::start().await;
    let mut socket = server.authenticated("u1", &[]).await;

    socket.send(WsFrame::Binary(vec![1, 2, 3].into())).await.expect("binary frame should send");
    let reply = ws_recv(&mut socket).await;
    assert_eq!(reply["data"]["code"], "PARSE_ERROR");

    ws_send(&mut socket, json!({ "type": "ping" })).await;
    ws_recv_type(&mut socket, "pong").await;
}

#[tokio::test]
async fn published_task_events_reach_workspace_members() {
    let server = TestServer::start().await;
    let mut member = server.authenticated("u1", &["w1"]).await;
    let mut outsider = server.authenticated("u2", &["w2"]).await;

    let report = server
        .service
        .publisher()
        .task_event(TaskEventType::Created, "w1", json!({ "id": "t1", "title": "Ship it" }))
        .await;
    assert_eq!(report.delivered, 1);
    assert!(report.persisted);

    let event = ws_recv_type(&mut member, "task:created").await;
    assert_eq!(event["workspaceId"], "w1");
    assert_eq!(event["data"]["title"], "Ship it");
    assert_no_message(&mut outsider, "task:created").await;
}

#[tokio::test]
async fn closing_the_socket_tears_down_the_connection() {
    let server = TestServer::start().await;
    let mut socket = server.authenticated("u1", &["w1"]).await;
    assert_eq!(server.service.stats().await.authenticated_connections, 1);

    socket.close(None).await.expect("client close should send");

    let drained = timeout(Duration::from_secs(2), async {
        loop {
            if server.service.stats().await.total_connections == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(drained.is_ok(), "connection was not torn down");
    assert!(!server.service.rooms().contains("w1").await);
}
