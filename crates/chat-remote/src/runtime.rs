use std::{sync::Arc, time::Duration};

use chat_core::{
    ChatChannelError, ChatChannels, ChatCommand, ChatEvent, ChatNotice, ConnectionSignal,
    ConnectionState, ConnectionStateMachine, EventStream, LoadError, Message, MessageId,
    OutboundComposer, Session, SessionTuning, TimelineMerger, UserIdentity, normalize_inbound,
    unix_ms_now,
};
use chat_platform::{
    CredentialStore, CredentialStoreError, SessionGate, SessionVault, Unauthenticated,
};
use serde_json::Value;
use tokio::{
    sync::{mpsc, watch},
    task::{JoinError, JoinHandle},
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    history::HistorySource,
    transport::{Transport, TransportEvent},
};

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 512;
const MAX_EXPIRY_TICK: Duration = Duration::from_secs(1);
const MIN_EXPIRY_TICK: Duration = Duration::from_millis(10);

/// Latest connection state and timeline, for frontends that poll or await
/// changes instead of consuming events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionView {
    pub state: ConnectionState,
    pub timeline: Vec<Message>,
}

/// Entry point for one authenticated chat session.
pub struct ChatSession;

impl ChatSession {
    /// Check the session and, only if it is valid, start connecting and
    /// loading history in parallel.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<G, H, T>(
        gate: &G,
        history: H,
        transport: T,
        tuning: SessionTuning,
    ) -> Result<ChatSessionHandle, Unauthenticated>
    where
        G: SessionGate + ?Sized,
        H: HistorySource,
        T: Transport,
    {
        let session = gate.check()?;
        info!(user_id = %session.user.id, "starting chat session");

        let (channels, command_rx) = ChatChannels::new(COMMAND_BUFFER, EVENT_BUFFER);
        let (view_tx, view_rx) = watch::channel(SessionView::default());
        let stop = CancellationToken::new();

        let user = session.user.clone();
        let runtime = SessionRuntime {
            session,
            channels: channels.clone(),
            commands: command_rx,
            view: view_tx,
            stop: stop.child_token(),
            history: Arc::new(history),
            history_task: None,
            transport,
            transport_events: None,
            connection: ConnectionStateMachine::default(),
            timeline: TimelineMerger::new(),
            composer: OutboundComposer::from_tuning(&tuning),
            expiry_tick: tuning
                .echo_timeout()
                .clamp(MIN_EXPIRY_TICK, MAX_EXPIRY_TICK),
        };
        let task = tokio::spawn(runtime.run());

        Ok(ChatSessionHandle {
            user,
            channels,
            view: view_rx,
            stop,
            task: Some(task),
        })
    }
}

/// Presentation-side handle of a running chat session.
///
/// Dropping the handle stops the session without waiting for teardown.
pub struct ChatSessionHandle {
    user: UserIdentity,
    channels: ChatChannels,
    view: watch::Receiver<SessionView>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ChatSessionHandle {
    /// The signed-in user.
    pub fn user(&self) -> &UserIdentity {
        &self.user
    }

    /// Compose and send `text`. Rejections arrive as notices.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), ChatChannelError> {
        self.channels
            .send_command(ChatCommand::Send { text: text.into() })
            .await
    }

    /// Request a fresh connection, the only way out of `Errored`.
    pub async fn reconnect(&self) -> Result<(), ChatChannelError> {
        self.channels.send_command(ChatCommand::Reconnect).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.view.borrow().state
    }

    pub fn timeline(&self) -> Vec<Message> {
        self.view.borrow().timeline.clone()
    }

    /// Tear the session down. Returns once the channel is closed and no
    /// further events or timeline changes can happen.
    pub async fn close(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take()
            && let Err(err) = task.await
        {
            warn!(error = %err, "chat session task ended abnormally");
        }
    }

    /// Tear the session down, then forget the stored credentials.
    pub async fn logout<S: CredentialStore>(
        self,
        vault: &SessionVault<S>,
    ) -> Result<(), CredentialStoreError> {
        self.close().await;
        vault.clear()?;
        info!("logged out");
        Ok(())
    }
}

impl Drop for ChatSessionHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

type HistoryResult = Result<Vec<Message>, LoadError>;

struct SessionRuntime<H, T> {
    session: Session,
    channels: ChatChannels,
    commands: mpsc::Receiver<ChatCommand>,
    view: watch::Sender<SessionView>,
    stop: CancellationToken,
    history: Arc<H>,
    history_task: Option<JoinHandle<HistoryResult>>,
    transport: T,
    transport_events: Option<mpsc::Receiver<TransportEvent>>,
    connection: ConnectionStateMachine,
    timeline: TimelineMerger,
    composer: OutboundComposer,
    expiry_tick: Duration,
}

impl<H: HistorySource, T: Transport> SessionRuntime<H, T> {
    async fn run(mut self) {
        self.begin_connect();
        self.begin_history_load();

        let mut expiry = tokio::time::interval(self.expiry_tick);
        expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(ChatCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                event = next_transport_event(&mut self.transport_events) => {
                    match event {
                        Some(event) => self.handle_transport_event(event),
                        None => self.transport_events = None,
                    }
                }
                joined = next_history_result(&mut self.history_task) => {
                    self.history_task = None;
                    self.handle_history(joined);
                }
                _ = expiry.tick() => self.expire_pending(),
            }
        }

        self.teardown().await;
    }

    async fn handle_command(&mut self, command: ChatCommand) {
        match command {
            ChatCommand::Send { text } => self.handle_send(&text),
            ChatCommand::Reconnect => self.handle_reconnect().await,
            ChatCommand::Shutdown => {}
        }
    }

    fn handle_send(&mut self, text: &str) {
        let message = match self.composer.compose(text, &self.session, unix_ms_now()) {
            Ok(message) => message,
            Err(rejected) => {
                debug!(reason = %rejected, "compose rejected");
                self.channels.notify(ChatNotice::SendRejected {
                    reason: rejected.to_string(),
                });
                return;
            }
        };

        let provisional_id = message.id.clone();
        match self.timeline.insert_provisional(message) {
            Ok(true) => self.publish_timeline(),
            Ok(false) => {}
            Err(err) => warn!(error = %err, "provisional insert refused"),
        }

        if !self.connection.is_connected() {
            debug!(id = %provisional_id, "not connected; send deferred until reconnect");
            return;
        }
        self.transmit(&provisional_id);
    }

    fn transmit(&mut self, provisional_id: &MessageId) {
        let Some(payload) = self.composer.payload(provisional_id) else {
            return;
        };
        match self.transport.send(payload) {
            Ok(()) => self.composer.mark_transmitted(provisional_id),
            Err(err) => debug!(id = %provisional_id, error = %err, "send deferred"),
        }
    }

    async fn handle_reconnect(&mut self) {
        if !matches!(
            self.connection.state(),
            ConnectionState::Errored | ConnectionState::Disconnected
        ) {
            debug!(state = ?self.connection.state(), "reconnect ignored");
            return;
        }
        self.transport_events = None;
        self.transport.close().await;
        self.begin_connect();
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connecting { attempt } => trace!(attempt, "channel connect attempt"),
            TransportEvent::Connected => {
                if self.apply_signal(ConnectionSignal::HandshakeSucceeded) {
                    self.retry_unsent();
                }
            }
            TransportEvent::AttemptFailed { message } => {
                self.apply_signal(ConnectionSignal::AttemptFailed { message });
            }
            TransportEvent::Dropped { reason } => {
                info!(reason = %reason, "live channel dropped; reconnecting");
                self.apply_signal(ConnectionSignal::Dropped);
            }
            TransportEvent::Rejected(error) => {
                self.apply_signal(ConnectionSignal::HandshakeRejected(error));
            }
            TransportEvent::Inbound(payload) => self.ingest_inbound(&payload),
            TransportEvent::Closed => {
                debug!("live channel stopped");
                self.transport_events = None;
            }
        }
    }

    fn ingest_inbound(&mut self, payload: &Value) {
        let inbound = match normalize_inbound(payload) {
            Ok(inbound) => inbound,
            Err(err) => {
                trace!(error = %err, "dropping malformed live payload");
                return;
            }
        };

        let changed = match self.composer.match_echo(&inbound) {
            Some(provisional_id) => {
                match self.timeline.reconcile(&provisional_id, inbound.message) {
                    Ok(_) => true,
                    Err(err) => {
                        warn!(error = %err, "echo reconcile refused");
                        false
                    }
                }
            }
            None => self.timeline.ingest_live(inbound.message),
        };

        if changed {
            self.publish_timeline();
        }
    }

    fn retry_unsent(&mut self) {
        for (provisional_id, _) in self.composer.take_retryable() {
            debug!(id = %provisional_id, "retrying unsent message");
            self.transmit(&provisional_id);
        }
    }

    fn handle_history(&mut self, joined: Result<HistoryResult, JoinError>) {
        let message = match joined {
            Ok(Ok(history)) => {
                match self.timeline.seed(history) {
                    Ok(kept) => {
                        debug!(kept, "timeline seeded from history");
                        self.publish_timeline();
                    }
                    Err(err) => warn!(error = %err, "history ignored"),
                }
                return;
            }
            Ok(Err(err)) => err.to_string(),
            Err(err) if err.is_cancelled() => return,
            Err(err) => format!("history task failed: {err}"),
        };

        warn!(error = %message, "message history unavailable");
        self.channels.notify(ChatNotice::LoadFailed { message });
    }

    fn expire_pending(&mut self) {
        for provisional_id in self.composer.expire(unix_ms_now()) {
            debug!(id = %provisional_id, "no echo received in time");
            self.channels
                .notify(ChatNotice::SendUnconfirmed { provisional_id });
        }
    }

    fn begin_connect(&mut self) {
        if self.apply_signal(ConnectionSignal::Connect) {
            self.transport_events = Some(self.transport.connect(&self.session));
        }
    }

    fn begin_history_load(&mut self) {
        let history = Arc::clone(&self.history);
        let session = self.session.clone();
        self.history_task = Some(tokio::spawn(async move { history.load(&session).await }));
    }

    async fn teardown(&mut self) {
        if let Some(task) = self.history_task.take() {
            task.abort();
        }
        self.transport_events = None;
        self.transport.close().await;
        self.apply_signal(ConnectionSignal::Close);
        debug!(user_id = %self.session.user.id, "chat session stopped");
    }

    /// Returns whether the signal was accepted.
    fn apply_signal(&mut self, signal: ConnectionSignal) -> bool {
        match self.connection.apply(&signal) {
            Ok(events) => {
                let state = self.connection.state();
                self.view.send_if_modified(|view| {
                    let modified = view.state != state;
                    view.state = state;
                    modified
                });
                for event in events {
                    self.channels.emit(event);
                }
                true
            }
            Err(err) => {
                warn!(signal = ?signal, code = %err.code, "connection signal ignored");
                false
            }
        }
    }

    fn publish_timeline(&mut self) {
        let messages = self.timeline.snapshot();
        self.view.send_modify(|view| view.timeline = messages.clone());
        self.channels
            .emit(ChatEvent::TimelineUpdated { messages });
    }
}

async fn next_transport_event(
    events: &mut Option<mpsc::Receiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_history_result(
    task: &mut Option<JoinHandle<HistoryResult>>,
) -> Result<HistoryResult, JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}
