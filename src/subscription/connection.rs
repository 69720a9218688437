//! Reconnecting streaming connection per logical subscription.
//!
//! # Responsibilities
//! - Gate every connection attempt on the circuit breaker
//! - Resolve a credential and open the socket with auth in the query string
//! - Run the `connection_init` / `connection_ack` / `start` handshake
//! - Keep the socket alive with client pings
//! - Feed successes and classified failures to the breaker
//! - Reconnect with capped exponential backoff and jitter
//!
//! # Design Decisions
//! - One supervising task per logical subscription owns the socket and timers
//! - Cancellation is a `CancellationToken` checked at every suspension point;
//!   the registry cleanup only cancels it, so cleanup is cheap and idempotent
//! - The registry entry exists before the first connect so a mass-cancel can
//!   tear the subscription down mid-connect

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::auth::TokenProvider;
use crate::clock::epoch_millis;
use crate::config::ConnectionConfig;
use crate::observability::metrics;
use crate::resilience::backoff::reconnect_delay;
use crate::resilience::classify::{ErrorKind, Fault};
use crate::resilience::CircuitBreaker;
use crate::subscription::protocol::Frame;
use crate::subscription::registry::{Subscription, SubscriptionRegistry};
use crate::subscription::target::{connection_request, parse_endpoint};
use crate::subscription::types::{
    ConnectionStatus, StreamError, StreamResult, SubscriptionEvent, SubscriptionRequest,
    SubscriptionState, TerminationReason,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Sink = SplitSink<Socket, Message>;
type Source = SplitStream<Socket>;

/// How one connection attempt ended.
enum AttemptEnd {
    Cancelled,
    Completed,
    Closed { normal: bool },
    Fatal(Fault),
    Failed(Fault),
}

/// A socket read, reduced to what the state machine cares about.
enum Incoming {
    Frame(Frame),
    Malformed(String),
    Closed { normal: bool },
    Transport(String),
    Ignored,
}

fn interpret(message: Option<Result<Message, WsError>>) -> Incoming {
    match message {
        Some(Ok(Message::Text(text))) => match Frame::decode(text.as_str()) {
            Ok(frame) => Incoming::Frame(frame),
            Err(e) => Incoming::Malformed(e.to_string()),
        },
        Some(Ok(Message::Close(frame))) => Incoming::Closed {
            normal: frame.is_some_and(|f| f.code == CloseCode::Normal),
        },
        Some(Ok(_)) => Incoming::Ignored,
        Some(Err(WsError::ConnectionClosed)) | None => Incoming::Closed { normal: false },
        Some(Err(e)) => Incoming::Transport(e.to_string()),
    }
}

async fn send_frame(sink: &mut Sink, frame: &Frame) -> Result<(), Fault> {
    let text = frame
        .encode()
        .map_err(|e| Fault::new(ErrorKind::Protocol, e.to_string()))?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| Fault::new(ErrorKind::Network, e.to_string()))
}

/// Wire id for one `start`: timestamp plus random suffix.
fn wire_id() -> String {
    format!("{}-{:08x}", epoch_millis(), fastrand::u32(..))
}

/// Per-subscription state owned by its supervising task.
struct SubscriptionCtx {
    id: String,
    key: String,
    request: SubscriptionRequest,
    cancel: CancellationToken,
    events: mpsc::Sender<SubscriptionEvent>,
    state: watch::Sender<SubscriptionState>,
    /// Set once the current attempt has delivered data.
    delivered: AtomicBool,
}

impl SubscriptionCtx {
    fn set_state(&self, state: SubscriptionState) {
        self.state.send_replace(state);
    }

    /// Deliver an event without blocking the socket. Returns false once the
    /// subscriber is gone.
    fn emit(&self, event: SubscriptionEvent) -> bool {
        match self.events.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(key = %self.key, "Subscriber is lagging, event dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Decrements the live-socket count when an acked connection ends.
struct LiveSocket<'a> {
    manager: &'a ConnectionManager,
}

impl<'a> LiveSocket<'a> {
    fn new(manager: &'a ConnectionManager) -> Self {
        if manager.live.fetch_add(1, Ordering::SeqCst) == 0 {
            manager.status.send_replace(ConnectionStatus::Connected);
        }
        Self { manager }
    }
}

impl Drop for LiveSocket<'_> {
    fn drop(&mut self) {
        if self.manager.live.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.manager.status.send_replace(ConnectionStatus::Disconnected);
        }
    }
}

/// Opens and supervises streaming subscriptions.
pub struct ConnectionManager {
    config: ConnectionConfig,
    endpoint: Url,
    breaker: Arc<CircuitBreaker>,
    tokens: Arc<TokenProvider>,
    registry: Arc<SubscriptionRegistry>,
    status: watch::Sender<ConnectionStatus>,
    live: AtomicUsize,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        breaker: Arc<CircuitBreaker>,
        tokens: Arc<TokenProvider>,
        registry: Arc<SubscriptionRegistry>,
    ) -> StreamResult<Self> {
        let endpoint = parse_endpoint(&config.endpoint)?;
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Ok(Self {
            config,
            endpoint,
            breaker,
            tokens,
            registry,
            status,
            live: AtomicUsize::new(0),
        })
    }

    /// Current process-wide connection status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Watch connection status changes.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Start a logical subscription. Fails fast, without touching the
    /// network, while the breaker is open.
    pub fn subscribe(self: &Arc<Self>, request: SubscriptionRequest) -> StreamResult<SubscriptionHandle> {
        if !self.breaker.can_proceed() {
            metrics::record_subscription_event("rejected");
            tracing::warn!(topic = %request.topic, scope = %request.scope_id, "Subscription refused, circuit open");
            return Err(StreamError::CircuitOpen);
        }

        let id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let record = self.registry.add(Subscription::new(
            id.clone(),
            request.topic.clone(),
            &request.scope_id,
            {
                let cancel = cancel.clone();
                move || cancel.cancel()
            },
        ));

        let (event_tx, event_rx) = mpsc::channel(self.config.event_buffer.max(1));
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Idle);
        let ctx = SubscriptionCtx {
            id: id.clone(),
            key: record.key().to_string(),
            request,
            cancel: cancel.clone(),
            events: event_tx,
            state: state_tx,
            delivered: AtomicBool::new(false),
        };

        tracing::info!(key = %ctx.key, subscription_id = %id, "Subscription starting");
        metrics::record_subscription_event("started");
        let task = tokio::spawn(Arc::clone(self).supervise(ctx));

        Ok(SubscriptionHandle {
            id,
            key: record.key().to_string(),
            events: event_rx,
            state: state_rx,
            cancel,
            task: Some(task),
        })
    }

    async fn supervise(self: Arc<Self>, ctx: SubscriptionCtx) {
        let max_attempts = self.config.max_reconnect_attempts;
        let mut attempt: u32 = 0;

        let reason = loop {
            let end = self.run_attempt(&ctx).await;
            // Only a connection that carried data restarts the backoff sequence.
            if ctx.delivered.swap(false, Ordering::SeqCst) {
                attempt = 0;
            }

            let fault = match end {
                AttemptEnd::Cancelled => break TerminationReason::Cancelled,
                AttemptEnd::Completed => break TerminationReason::Completed,
                AttemptEnd::Closed { normal: true } => break TerminationReason::ServerClosed,
                AttemptEnd::Fatal(fault) => break TerminationReason::Fatal(fault),
                AttemptEnd::Closed { normal: false } => {
                    let fault = Fault::new(ErrorKind::Network, "socket closed abnormally");
                    self.breaker.record_failure(&fault);
                    fault
                }
                AttemptEnd::Failed(fault) => fault,
            };

            if ctx.cancel.is_cancelled() {
                break TerminationReason::Cancelled;
            }
            if attempt >= max_attempts {
                let exhausted = Fault::new(
                    ErrorKind::Exhausted,
                    format!("gave up after {attempt} reconnect attempts: {fault}"),
                );
                self.breaker.record_failure(&exhausted);
                break TerminationReason::Exhausted { attempts: attempt };
            }
            // Doubles as the guard for the next attempt.
            if !self.breaker.can_proceed() {
                break TerminationReason::CircuitOpen;
            }

            let delay = reconnect_delay(
                attempt,
                self.config.reconnect_base_ms,
                self.config.reconnect_cap_ms,
                self.config.jitter_ratio,
            );
            attempt += 1;
            ctx.set_state(SubscriptionState::Reconnecting { attempt });
            metrics::record_reconnect();
            tracing::info!(
                key = %ctx.key,
                attempt,
                delay_ms = delay.as_millis() as u64,
                fault = %fault,
                "Reconnecting subscription"
            );

            tokio::select! {
                _ = time::sleep(delay) => {}
                _ = ctx.cancel.cancelled() => break TerminationReason::Cancelled,
            }
        };

        self.registry.remove_if_current(&ctx.key, &ctx.id);
        ctx.set_state(SubscriptionState::Terminated);
        metrics::record_subscription_event("terminated");
        tracing::info!(key = %ctx.key, reason = ?reason, "Subscription terminated");
        if ctx.events.send(SubscriptionEvent::Terminated(reason)).await.is_err() {
            tracing::debug!(key = %ctx.key, "Subscriber gone before terminal event");
        }
    }

    /// Record a fault on the breaker and decide whether it ends the
    /// subscription for good.
    fn fail(&self, fault: Fault) -> AttemptEnd {
        self.breaker.record_failure(&fault);
        if fault.is_fatal() || fault.kind.is_fatal_subscription() {
            AttemptEnd::Fatal(fault)
        } else {
            AttemptEnd::Failed(fault)
        }
    }

    async fn run_attempt(&self, ctx: &SubscriptionCtx) -> AttemptEnd {
        ctx.set_state(SubscriptionState::Connecting);

        let credential = tokio::select! {
            _ = ctx.cancel.cancelled() => return AttemptEnd::Cancelled,
            resolved = self.tokens.resolve() => match resolved {
                Ok(credential) => credential,
                Err(e) => {
                    tracing::warn!(key = %ctx.key, error = %e, "No credential for connection attempt");
                    return self.fail(e.fault());
                }
            },
        };

        let request = match connection_request(&self.endpoint, &credential) {
            Ok(request) => request,
            Err(e) => return AttemptEnd::Fatal(Fault::new(ErrorKind::Protocol, e.to_string())),
        };

        let started = Instant::now();
        let deadline = started + Duration::from_secs(self.config.connect_timeout_secs);
        let socket = tokio::select! {
            _ = ctx.cancel.cancelled() => return AttemptEnd::Cancelled,
            opened = time::timeout_at(deadline, connect_async(request)) => match opened {
                Ok(Ok((socket, _response))) => socket,
                Ok(Err(e)) => {
                    tracing::warn!(key = %ctx.key, error = %e, "Socket connect failed");
                    return self.fail(Fault::classify("", &format!("network: {e}")));
                }
                Err(_) => return self.fail(Fault::new(ErrorKind::Timeout, "connect timed out")),
            },
        };

        let (mut sink, mut source) = socket.split();
        ctx.set_state(SubscriptionState::AwaitingAck);
        if let Err(fault) = send_frame(&mut sink, &Frame::init()).await {
            return self.fail(fault);
        }

        if let Some(end) = self.await_ack(ctx, &mut sink, &mut source, deadline).await {
            return end;
        }
        metrics::record_connect_duration(started.elapsed());
        let _live = LiveSocket::new(self);

        let wire_id = wire_id();
        if let Err(fault) = send_frame(&mut sink, &Frame::subscribe(&wire_id, ctx.request.payload.clone())).await {
            return self.fail(fault);
        }
        ctx.set_state(SubscriptionState::Subscribed);
        tracing::info!(key = %ctx.key, wire_id = %wire_id, "Subscribed");

        self.stream(ctx, &mut sink, &mut source, &wire_id).await
    }

    /// Wait for `connection_ack`. `None` means acked.
    async fn await_ack(
        &self,
        ctx: &SubscriptionCtx,
        sink: &mut Sink,
        source: &mut Source,
        deadline: Instant,
    ) -> Option<AttemptEnd> {
        loop {
            let message = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    close(sink, "unsubscribed").await;
                    return Some(AttemptEnd::Cancelled);
                }
                _ = time::sleep_until(deadline) => {
                    close(sink, "ack timeout").await;
                    return Some(self.fail(Fault::new(ErrorKind::Timeout, "no connection_ack before deadline")));
                }
                message = source.next() => message,
            };

            match interpret(message) {
                Incoming::Frame(Frame::Ack { .. }) => return None,
                Incoming::Frame(frame @ (Frame::ConnectionError { .. } | Frame::Error { .. })) => {
                    let fault = frame.fault().unwrap_or_else(|| Fault::new(ErrorKind::Unknown, "error frame"));
                    tracing::warn!(key = %ctx.key, fault = %fault, "Connection rejected");
                    ctx.emit(SubscriptionEvent::Error(fault.clone()));
                    close(sink, "connection error").await;
                    return Some(self.fail(fault));
                }
                Incoming::Frame(frame) => {
                    tracing::debug!(key = %ctx.key, frame = frame.kind(), "Frame before ack ignored");
                }
                Incoming::Malformed(detail) => {
                    self.breaker.record_failure(&Fault::new(ErrorKind::Protocol, detail));
                }
                Incoming::Closed { normal } => return Some(AttemptEnd::Closed { normal }),
                Incoming::Transport(detail) => {
                    return Some(self.fail(Fault::new(ErrorKind::Network, detail)));
                }
                Incoming::Ignored => {}
            }
        }
    }

    async fn stream(
        &self,
        ctx: &SubscriptionCtx,
        sink: &mut Sink,
        source: &mut Source,
        wire_id: &str,
    ) -> AttemptEnd {
        let keepalive = Duration::from_secs(self.config.keepalive_interval_secs.max(1));
        let mut ping = time::interval_at(Instant::now() + keepalive, keepalive);
        ping.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            let message = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    ctx.set_state(SubscriptionState::Closing);
                    if let Err(fault) = send_frame(sink, &Frame::stop(wire_id)).await {
                        tracing::debug!(key = %ctx.key, fault = %fault, "Failed to send stop");
                    }
                    close(sink, "unsubscribed").await;
                    return AttemptEnd::Cancelled;
                }
                _ = ping.tick() => {
                    if let Err(fault) = send_frame(sink, &Frame::Ping).await {
                        return self.fail(fault);
                    }
                    continue;
                }
                message = source.next() => message,
            };

            match interpret(message) {
                Incoming::Frame(Frame::Data { id, payload }) if id == wire_id => {
                    self.breaker.record_success();
                    ctx.delivered.store(true, Ordering::SeqCst);
                    metrics::record_subscription_event("data");
                    if !ctx.emit(SubscriptionEvent::Data(payload)) {
                        tracing::debug!(key = %ctx.key, "Subscriber gone, closing");
                        ctx.cancel.cancel();
                    }
                }
                Incoming::Frame(Frame::Complete { id }) if id == wire_id => {
                    metrics::record_subscription_event("complete");
                    close(sink, "complete").await;
                    return AttemptEnd::Completed;
                }
                Incoming::Frame(frame @ (Frame::Error { .. } | Frame::ConnectionError { .. })) => {
                    let fault = frame.fault().unwrap_or_else(|| Fault::new(ErrorKind::Unknown, "error frame"));
                    metrics::record_subscription_event("error");
                    tracing::warn!(key = %ctx.key, fault = %fault, "Subscription error");
                    ctx.emit(SubscriptionEvent::Error(fault.clone()));
                    close(sink, "error").await;
                    return self.fail(fault);
                }
                Incoming::Frame(frame) => {
                    tracing::trace!(key = %ctx.key, frame = frame.kind(), "Frame ignored");
                }
                Incoming::Malformed(detail) => {
                    tracing::warn!(key = %ctx.key, detail = %detail, "Malformed frame");
                    self.breaker.record_failure(&Fault::new(ErrorKind::Protocol, detail));
                }
                Incoming::Closed { normal } => {
                    tracing::info!(key = %ctx.key, normal, "Socket closed by server");
                    return AttemptEnd::Closed { normal };
                }
                Incoming::Transport(detail) => {
                    tracing::warn!(key = %ctx.key, error = %detail, "Socket error");
                    return self.fail(Fault::new(ErrorKind::Network, detail));
                }
                Incoming::Ignored => {}
            }
        }
    }
}

async fn close(sink: &mut Sink, reason: &'static str) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: reason.into(),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        tracing::debug!(error = %e, "Close frame not sent");
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.endpoint.as_str())
            .field("status", &self.status())
            .field("subscriptions", &self.registry.len())
            .finish()
    }
}

/// Caller's side of a subscription. Dropping it cancels the subscription.
pub struct SubscriptionHandle {
    id: String,
    key: String,
    events: mpsc::Receiver<SubscriptionEvent>,
    state: watch::Receiver<SubscriptionState>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Next event; `None` after the terminal event has been consumed.
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Wait until the subscription reaches `state`.
    pub async fn wait_for_state(&mut self, state: SubscriptionState) -> SubscriptionState {
        match self.state.wait_for(|s| *s == state || s.is_terminated()).await {
            Ok(current) => *current,
            Err(_) => SubscriptionState::Terminated,
        }
    }

    /// Send `stop`, close the socket and wait for the supervising task.
    pub async fn unsubscribe(mut self) {
        self.cancel.cancel();
        // Nobody reads events past this point; keep the terminal send from waiting.
        self.events.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(key = %self.key, error = %e, "Subscription task failed");
            }
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}
