//! Shared utilities for integration tests: a scripted streaming server and a
//! programmable auth backend.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use resilient_client::auth::Credential;
use resilient_client::clock::epoch_millis;
use resilient_client::config::{ResilienceConfig, StorageBackend};

/// One scripted server action on a streaming connection.
#[derive(Debug, Clone)]
pub enum Step {
    /// Reply `connection_ack`.
    Ack,
    /// Send a `data` frame for the client's subscription id.
    Data(Value),
    /// Send `complete` for the client's subscription id.
    Complete,
    /// Send an `error` frame for the client's subscription id.
    Error(Value),
    /// Send `connection_error` before any ack.
    ConnectionError(Value),
    /// Send a raw text message.
    Raw(&'static str),
    /// Close with the given code.
    Close(CloseCode),
    /// Drop the TCP connection without a close frame.
    Drop,
    Sleep(Duration),
}

/// Streaming server that plays one script per accepted connection. Once the
/// scripts run out the last one repeats. After its script a connection stays
/// open, recording frames, until the client goes away.
pub struct MockStreamServer {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Value>>>,
    queries: Arc<Mutex<Vec<String>>>,
}

impl MockStreamServer {
    pub async fn start(scripts: Vec<Vec<Step>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let scripts = Arc::new(scripts);
        let connections = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let queries = Arc::new(Mutex::new(Vec::new()));

        {
            let connections = connections.clone();
            let received = received.clone();
            let queries = queries.clone();
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    let index = connections.fetch_add(1, Ordering::SeqCst);
                    let script = scripts
                        .get(index)
                        .or_else(|| scripts.last())
                        .cloned()
                        .unwrap_or_default();
                    let received = received.clone();
                    let queries = queries.clone();
                    tokio::spawn(async move {
                        serve_connection(socket, script, received, queries).await;
                    });
                }
            });
        }

        Self {
            addr,
            connections,
            received,
            queries,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("ws://{}/graphql/realtime", self.addr)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Every client frame received, across connections.
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_types(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|frame| frame["type"].as_str().map(str::to_string))
            .collect()
    }

    /// Query strings of the handshake requests.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

async fn serve_connection(
    socket: TcpStream,
    script: Vec<Step>,
    received: Arc<Mutex<Vec<Value>>>,
    queries: Arc<Mutex<Vec<String>>>,
) {
    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        queries
            .lock()
            .unwrap()
            .push(request.uri().query().unwrap_or_default().to_string());
        if let Some(protocol) = request.headers().get("Sec-WebSocket-Protocol") {
            response
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", protocol.clone());
        } else {
            response
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("graphql-ws"));
        }
        Ok(response)
    };
    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(socket, callback).await else {
        return;
    };

    let mut subscription_id: Option<String> = None;
    for step in script {
        match step {
            Step::Ack => {
                if wait_for(&mut ws, &received, "connection_init").await.is_none() {
                    return;
                }
                send(&mut ws, json!({"type": "connection_ack", "payload": {"connectionTimeoutMs": 300000}})).await;
            }
            Step::Data(payload) => {
                let Some(id) = subscription(&mut ws, &received, &mut subscription_id).await else {
                    return;
                };
                send(&mut ws, json!({"type": "data", "id": id, "payload": payload})).await;
            }
            Step::Complete => {
                let Some(id) = subscription(&mut ws, &received, &mut subscription_id).await else {
                    return;
                };
                send(&mut ws, json!({"type": "complete", "id": id})).await;
            }
            Step::Error(payload) => {
                let Some(id) = subscription(&mut ws, &received, &mut subscription_id).await else {
                    return;
                };
                send(&mut ws, json!({"type": "error", "id": id, "payload": payload})).await;
            }
            Step::ConnectionError(payload) => {
                if wait_for(&mut ws, &received, "connection_init").await.is_none() {
                    return;
                }
                send(&mut ws, json!({"type": "connection_error", "payload": payload})).await;
            }
            Step::Raw(text) => {
                let _ = ws.send(Message::text(text)).await;
            }
            Step::Close(code) => {
                let _ = ws
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: "scripted".into(),
                    })))
                    .await;
                drain(&mut ws, &received).await;
                return;
            }
            Step::Drop => return,
            Step::Sleep(duration) => tokio::time::sleep(duration).await,
        }
    }

    drain(&mut ws, &received).await;
}

/// The client's subscription id, waiting for its `start` frame if needed.
async fn subscription(
    ws: &mut WebSocketStream<TcpStream>,
    received: &Arc<Mutex<Vec<Value>>>,
    current: &mut Option<String>,
) -> Option<String> {
    if current.is_none() {
        let start = wait_for(ws, received, "start").await?;
        *current = start["id"].as_str().map(str::to_string);
    }
    current.clone()
}

/// Read until a frame of `kind` arrives, recording everything read.
async fn wait_for(
    ws: &mut WebSocketStream<TcpStream>,
    received: &Arc<Mutex<Vec<Value>>>,
    kind: &str,
) -> Option<Value> {
    while let Some(Ok(message)) = ws.next().await {
        if let Message::Text(text) = message {
            let frame: Value = serde_json::from_str(text.as_str()).unwrap_or(Value::Null);
            received.lock().unwrap().push(frame.clone());
            if frame["type"] == kind {
                return Some(frame);
            }
        }
    }
    None
}

async fn drain(ws: &mut WebSocketStream<TcpStream>, received: &Arc<Mutex<Vec<Value>>>) {
    while let Some(Ok(message)) = ws.next().await {
        match message {
            Message::Text(text) => {
                let frame: Value = serde_json::from_str(text.as_str()).unwrap_or(Value::Null);
                received.lock().unwrap().push(frame);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

async fn send(ws: &mut WebSocketStream<TcpStream>, frame: Value) {
    let _ = ws.send(Message::text(frame.to_string())).await;
}

/// Programmable auth backend. The handler receives the call number (from 0)
/// and the JSON request body and returns a status and JSON body.
pub struct MockAuthBackend {
    pub addr: SocketAddr,
    calls: Arc<AtomicUsize>,
}

impl MockAuthBackend {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(usize, Value) -> (u16, Value) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(handler);

        {
            let calls = calls.clone();
            tokio::spawn(async move {
                while let Ok((mut socket, _)) = listener.accept().await {
                    let handler = handler.clone();
                    let calls = calls.clone();
                    tokio::spawn(async move {
                        let Some(body) = read_request_body(&mut socket).await else {
                            return;
                        };
                        let call = calls.fetch_add(1, Ordering::SeqCst);
                        let (status, body) = handler(call, body);
                        let body = body.to_string();
                        let status_text = match status {
                            200 => "200 OK",
                            400 => "400 Bad Request",
                            401 => "401 Unauthorized",
                            403 => "403 Forbidden",
                            429 => "429 Too Many Requests",
                            500 => "500 Internal Server Error",
                            503 => "503 Service Unavailable",
                            _ => "200 OK",
                        };
                        let response = format!(
                            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status_text,
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
            });
        }

        Self { addr, calls }
    }

    pub fn refresh_url(&self) -> String {
        format!("http://{}/token/refresh", self.addr)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

async fn read_request_body(socket: &mut TcpStream) -> Option<Value> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
    let length = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let end = buf.len().min(header_end + length);
    Some(serde_json::from_slice(&buf[header_end..end]).unwrap_or(Value::Null))
}

/// Successful refresh response body.
pub fn token_response(id_token: &str, expires_in_secs: u64) -> Value {
    json!({
        "accessToken": format!("access-{id_token}"),
        "idToken": id_token,
        "expiresIn": expires_in_secs,
    })
}

/// Credential valid for an hour.
pub fn fresh_credential(id_token: &str) -> Credential {
    Credential {
        access_token: format!("access-{id_token}"),
        id_token: id_token.to_string(),
        refresh_token: Some("refresh-1".to_string()),
        expires_at: epoch_millis() + 3_600_000,
    }
}

/// Credential that needs a refresh before use.
pub fn expired_credential() -> Credential {
    Credential {
        access_token: "access-stale".to_string(),
        id_token: "stale".to_string(),
        refresh_token: Some("refresh-1".to_string()),
        expires_at: epoch_millis().saturating_sub(1_000),
    }
}

/// In-memory config with fast reconnects, pointed at the mock servers.
pub fn test_config(endpoint: &str, refresh_url: Option<&str>) -> ResilienceConfig {
    let mut config = ResilienceConfig::default();
    config.storage.backend = StorageBackend::Memory;
    config.connection.endpoint = endpoint.to_string();
    config.connection.connect_timeout_secs = 2;
    config.connection.reconnect_base_ms = 20;
    config.connection.reconnect_cap_ms = 100;
    config.connection.jitter_ratio = 0.0;
    config.connection.max_reconnect_attempts = 3;
    config.token.min_fetch_interval_ms = 10;
    config.queue.drain_item_delay_ms = 5;
    config.queue.reschedule_base_ms = 50;
    config.queue.reschedule_cap_ms = 200;
    if let Some(url) = refresh_url {
        config.auth.refresh_url = url.to_string();
        config.auth.request_timeout_secs = 2;
    }
    config
}

/// Wait up to two seconds for `condition`.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Context over in-memory storage with a fresh credential already signed in.
pub async fn authenticated_context(config: ResilienceConfig) -> resilient_client::AppContext {
    let auth = Arc::new(resilient_client::auth::HttpAuthService::new(&config.auth).unwrap());
    let storage = Arc::new(resilient_client::storage::MemoryStorage::new());
    let ctx = resilient_client::AppContext::with_services(config, auth, storage).unwrap();
    ctx.tokens
        .mark_authenticated(fresh_credential("id-1"))
        .await
        .unwrap();
    ctx
}
