use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chat_core::{
    ChatError, ErrorCategory, OutboundPayload, RetryPolicy, Session, SessionTuning,
    classify_http_status,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle, time::timeout};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message as WsMessage, http::header::RETRY_AFTER},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::{
    RemoteConfig,
    wire::{self, EnginePacket, OpenHandshake, SocketPacket},
};

const EVENT_BUFFER: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle and inbound traffic reported by a live channel, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A connect attempt started. `attempt` counts retries since the last
    /// handshake; zero is the first try after `connect`.
    Connecting { attempt: u32 },
    /// Handshake completed.
    Connected,
    /// An attempt failed for a transient reason; another one follows.
    AttemptFailed { message: String },
    /// An established channel was lost; reconnecting.
    Dropped { reason: String },
    /// The handshake was refused. No further attempts are made.
    Rejected(ChatError),
    /// Raw payload of one inbound `message` event.
    Inbound(Value),
    /// The channel stopped and will emit nothing more.
    Closed,
}

/// Persistent authenticated channel to the chat service.
pub trait Transport: Send + 'static {
    /// Start connecting with the session token. Any previous channel is
    /// released first. Events arrive on the returned stream.
    fn connect(&mut self, session: &Session) -> mpsc::Receiver<TransportEvent>;

    /// Queue one outbound message. Fails when the channel is not connected.
    fn send(&self, payload: &OutboundPayload) -> Result<(), ChatError>;

    /// Release the channel. Idempotent; nothing is emitted once it returns.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

struct RunningChannel {
    stop: CancellationToken,
    outbound: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// socket.io channel over a WebSocket, with automatic reconnect.
pub struct WsTransport {
    config: RemoteConfig,
    retry_policy: RetryPolicy,
    handshake_timeout: Duration,
    running: Option<RunningChannel>,
}

impl WsTransport {
    pub fn new(config: RemoteConfig, tuning: &SessionTuning) -> Self {
        Self {
            config,
            retry_policy: RetryPolicy::from_tuning(tuning),
            handshake_timeout: tuning.handshake_timeout(),
            running: None,
        }
    }

    fn release(&mut self) -> Option<JoinHandle<()>> {
        let running = self.running.take()?;
        running.connected.store(false, Ordering::SeqCst);
        running.stop.cancel();
        Some(running.task)
    }
}

impl Transport for WsTransport {
    fn connect(&mut self, session: &Session) -> mpsc::Receiver<TransportEvent> {
        if let Some(previous) = self.release() {
            previous.abort();
        }

        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let connected = Arc::new(AtomicBool::new(false));

        let link = ChannelLink {
            socket_url: self.config.socket_url(),
            token: session.token.clone(),
            retry_policy: self.retry_policy,
            handshake_timeout: self.handshake_timeout,
            stop: stop.child_token(),
            connected: Arc::clone(&connected),
            events: event_tx,
        };
        let task = tokio::spawn(link.supervise(outbound_rx));

        self.running = Some(RunningChannel {
            stop,
            outbound: outbound_tx,
            connected,
            task,
        });
        event_rx
    }

    fn send(&self, payload: &OutboundPayload) -> Result<(), ChatError> {
        let running = self
            .running
            .as_ref()
            .filter(|running| running.connected.load(Ordering::SeqCst))
            .ok_or_else(|| {
                ChatError::new(
                    ErrorCategory::Network,
                    "channel_not_connected",
                    "live channel is not connected",
                )
            })?;

        let frame = wire::encode_event(wire::MESSAGE_EVENT, payload).map_err(|err| {
            ChatError::new(
                ErrorCategory::Serialization,
                "outbound_encode_error",
                err.to_string(),
            )
        })?;
        running.outbound.send(frame).map_err(|_| {
            ChatError::new(
                ErrorCategory::Network,
                "channel_not_connected",
                "live channel task has stopped",
            )
        })
    }

    async fn close(&mut self) {
        if let Some(task) = self.release() {
            let _ = task.await;
            debug!("live channel closed");
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.stop.cancel();
        }
    }
}

enum HandshakeError {
    Rejected(ChatError),
    Failed(ChatError),
}

enum ConnectionOutcome {
    Rejected(ChatError),
    Failed(ChatError),
    Dropped(String),
    Stopped,
}

struct ChannelLink {
    socket_url: Result<Url, ChatError>,
    token: String,
    retry_policy: RetryPolicy,
    handshake_timeout: Duration,
    stop: CancellationToken,
    connected: Arc<AtomicBool>,
    events: mpsc::Sender<TransportEvent>,
}

impl ChannelLink {
    async fn supervise(self, mut outbound: mpsc::UnboundedReceiver<String>) {
        let mut attempt: u32 = 0;

        loop {
            let mut retry_after_ms = None;
            if !self.emit(TransportEvent::Connecting { attempt }).await {
                break;
            }

            let follow_up = match self.run_connection(&mut outbound).await {
                ConnectionOutcome::Stopped => break,
                ConnectionOutcome::Rejected(error) => {
                    warn!(code = %error.code, "live channel handshake rejected");
                    self.emit(TransportEvent::Rejected(error)).await;
                    break;
                }
                ConnectionOutcome::Failed(error) => {
                    if error.is_transient() {
                        debug!(attempt, error = %error, "live channel connect attempt failed");
                    } else {
                        warn!(attempt, error = %error, "live channel connect attempt failed");
                    }
                    retry_after_ms = error.retry_after_ms;
                    TransportEvent::AttemptFailed {
                        message: error.message,
                    }
                }
                ConnectionOutcome::Dropped(reason) => {
                    info!(reason = %reason, "live channel dropped");
                    attempt = 0;
                    TransportEvent::Dropped { reason }
                }
            };
            if !self.emit(follow_up).await {
                break;
            }

            let delay = self.retry_policy.delay_for_attempt(attempt, retry_after_ms);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        if !self.stop.is_cancelled() {
            let _ = self.events.send(TransportEvent::Closed).await;
        }
    }

    async fn emit(&self, event: TransportEvent) -> bool {
        if self.stop.is_cancelled() {
            return false;
        }
        self.events.send(event).await.is_ok()
    }

    async fn run_connection(
        &self,
        outbound: &mut mpsc::UnboundedReceiver<String>,
    ) -> ConnectionOutcome {
        let url = match &self.socket_url {
            Ok(url) => url.clone(),
            Err(err) => return ConnectionOutcome::Rejected(err.clone()),
        };

        let handshake = tokio::select! {
            _ = self.stop.cancelled() => return ConnectionOutcome::Stopped,
            result = timeout(self.handshake_timeout, open_socket(&url, &self.token)) => result,
        };
        let (mut socket, open) = match handshake {
            Err(_) => return ConnectionOutcome::Failed(connect_failed("handshake timed out")),
            Ok(Err(HandshakeError::Rejected(error))) => return ConnectionOutcome::Rejected(error),
            Ok(Err(HandshakeError::Failed(error))) => return ConnectionOutcome::Failed(error),
            Ok(Ok(opened)) => opened,
        };

        debug!(sid = %open.sid, "live channel connected");
        self.connected.store(true, Ordering::SeqCst);
        if !self.emit(TransportEvent::Connected).await {
            let _ = socket.close(None).await;
            return ConnectionOutcome::Stopped;
        }

        // No traffic for a full ping cycle means the server is gone.
        let liveness = Duration::from_millis(open.ping_interval.saturating_add(open.ping_timeout));
        let outcome = loop {
            tokio::select! {
                _ = self.stop.cancelled() => {
                    let _ = socket.close(None).await;
                    break ConnectionOutcome::Stopped;
                }
                Some(frame) = outbound.recv() => {
                    if let Err(err) = socket.send(WsMessage::text(frame)).await {
                        break ConnectionOutcome::Dropped(err.to_string());
                    }
                }
                next = timeout(liveness, socket.next()) => {
                    let text = match next {
                        Err(_) => break ConnectionOutcome::Dropped("server heartbeat timed out".into()),
                        Ok(None) => break ConnectionOutcome::Dropped("connection closed".into()),
                        Ok(Some(Err(err))) => break ConnectionOutcome::Dropped(err.to_string()),
                        Ok(Some(Ok(WsMessage::Close(_)))) => {
                            break ConnectionOutcome::Dropped("server closed the connection".into());
                        }
                        Ok(Some(Ok(WsMessage::Text(text)))) => text,
                        Ok(Some(Ok(_))) => continue,
                    };

                    match wire::decode(text.as_str()) {
                        Ok(EnginePacket::Ping) => {
                            if let Err(err) = socket.send(WsMessage::text(wire::PONG)).await {
                                break ConnectionOutcome::Dropped(err.to_string());
                            }
                        }
                        Ok(EnginePacket::Message(SocketPacket::Event { name, args }))
                            if name == wire::MESSAGE_EVENT =>
                        {
                            let Some(payload) = args.into_iter().next() else {
                                trace!("message event without payload");
                                continue;
                            };
                            if !self.emit(TransportEvent::Inbound(payload)).await {
                                let _ = socket.close(None).await;
                                break ConnectionOutcome::Stopped;
                            }
                        }
                        Ok(EnginePacket::Message(SocketPacket::Disconnect)) => {
                            break ConnectionOutcome::Dropped("server disconnected the socket".into());
                        }
                        Ok(EnginePacket::Close) => {
                            break ConnectionOutcome::Dropped("server closed the session".into());
                        }
                        Ok(other) => trace!(packet = ?other, "ignoring packet"),
                        Err(err) => trace!(error = %err, "ignoring undecodable frame"),
                    }
                }
            }
        };

        self.connected.store(false, Ordering::SeqCst);
        outcome
    }
}

async fn open_socket(url: &Url, token: &str) -> Result<(WsStream, OpenHandshake), HandshakeError> {
    let (mut socket, _) = connect_async(url.as_str())
        .await
        .map_err(classify_connect_error)?;

    let open = loop {
        match next_packet(&mut socket).await? {
            EnginePacket::Open(open) => break open,
            other => trace!(packet = ?other, "packet before engine open"),
        }
    };

    let connect = wire::encode_connect(token)
        .map_err(|err| HandshakeError::Failed(connect_failed(err.to_string())))?;
    socket
        .send(WsMessage::text(connect))
        .await
        .map_err(|err| HandshakeError::Failed(connect_failed(err.to_string())))?;

    loop {
        match next_packet(&mut socket).await? {
            EnginePacket::Message(SocketPacket::Connect(_)) => return Ok((socket, open)),
            EnginePacket::Message(SocketPacket::ConnectError(message)) => {
                return Err(HandshakeError::Rejected(ChatError::new(
                    ErrorCategory::Auth,
                    "handshake_rejected",
                    message,
                )));
            }
            EnginePacket::Ping => socket
                .send(WsMessage::text(wire::PONG))
                .await
                .map_err(|err| HandshakeError::Failed(connect_failed(err.to_string())))?,
            EnginePacket::Close | EnginePacket::Message(SocketPacket::Disconnect) => {
                return Err(HandshakeError::Failed(connect_failed("closed during handshake")));
            }
            other => trace!(packet = ?other, "packet during handshake"),
        }
    }
}

async fn next_packet(socket: &mut WsStream) -> Result<EnginePacket, HandshakeError> {
    loop {
        match socket.next().await {
            None | Some(Ok(WsMessage::Close(_))) => {
                return Err(HandshakeError::Failed(connect_failed("closed during handshake")));
            }
            Some(Err(err)) => return Err(HandshakeError::Failed(connect_failed(err.to_string()))),
            Some(Ok(WsMessage::Text(text))) => {
                return wire::decode(text.as_str()).map_err(|err| {
                    HandshakeError::Failed(ChatError::new(
                        ErrorCategory::Protocol,
                        "channel_protocol_error",
                        format!("protocol error: {err}"),
                    ))
                });
            }
            Some(Ok(_)) => {}
        }
    }
}

fn connect_failed(message: impl Into<String>) -> ChatError {
    ChatError::new(ErrorCategory::Network, "channel_connect_failed", message)
}

/// Map a failed WebSocket upgrade. Auth statuses are terminal; anything else
/// is retried, honoring a `Retry-After` delay in seconds when the server sent one.
fn classify_connect_error(err: WsError) -> HandshakeError {
    let WsError::Http(response) = &err else {
        return HandshakeError::Failed(connect_failed(err.to_string()));
    };

    let status = response.status().as_u16();
    let category = classify_http_status(status);
    if category == ErrorCategory::Auth {
        return HandshakeError::Rejected(ChatError::new(
            category,
            "handshake_rejected",
            format!("server refused the channel with status {status}"),
        ));
    }

    let error = ChatError::new(
        category,
        "channel_upgrade_failed",
        format!("server answered the channel upgrade with status {status}"),
    );
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());
    HandshakeError::Failed(match retry_after {
        Some(seconds) => error.with_retry_after(Duration::from_secs(seconds)),
        None => error,
    })
}
