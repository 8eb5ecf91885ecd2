//! Frontend-facing state reducer for `chat-terminal`.

use std::{collections::HashSet, fmt};

use chat_core::{ChatEvent, ChatNotice, ConnectionState, Message, UserId};
use chrono::{DateTime, Local, Utc};
use tracing::trace;

/// Timeline row as printed to the terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    pub id: String,
    pub sender: String,
    pub body: String,
    pub time: String,
    pub is_own: bool,
    pub provisional: bool,
}

/// Full view state after the latest event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalSnapshot {
    pub messages: Vec<MessageView>,
    pub status_text: String,
    pub error_text: Option<String>,
    pub can_send: bool,
}

/// One line of terminal output produced by a state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalLine {
    Status(String),
    Message(MessageView),
    /// An own message was confirmed by the server.
    Delivered(String),
    Notice(String),
    Error(String),
}

impl fmt::Display for TerminalLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(text) => write!(f, "-- {text} --"),
            Self::Message(view) => {
                let sender = if view.is_own { "you" } else { view.sender.as_str() };
                let marker = if view.provisional { " (sending)" } else { "" };
                write!(f, "[{}] {sender}: {}{marker}", view.time, view.body)
            }
            Self::Delivered(body) => write!(f, "   delivered: {body}"),
            Self::Notice(text) => write!(f, "** {text}"),
            Self::Error(text) => write!(f, "!! {text}"),
        }
    }
}

/// Mutable view state fed by session events.
#[derive(Debug, Clone)]
pub struct TerminalState {
    own_user_id: UserId,
    connection: ConnectionState,
    messages: Vec<MessageView>,
    printed: HashSet<String>,
    error_text: Option<String>,
}

impl TerminalState {
    pub fn new(own_user_id: UserId) -> Self {
        Self {
            own_user_id,
            connection: ConnectionState::Disconnected,
            messages: Vec::new(),
            printed: HashSet::new(),
            error_text: None,
        }
    }

    pub fn snapshot(&self) -> TerminalSnapshot {
        TerminalSnapshot {
            messages: self.messages.clone(),
            status_text: status_label(self.connection).to_owned(),
            error_text: self.error_text.clone(),
            can_send: self.connection == ConnectionState::Connected,
        }
    }

    /// Apply one session event and return the lines to print.
    pub fn handle_event(&mut self, event: ChatEvent) -> Vec<TerminalLine> {
        match event {
            ChatEvent::StateChanged { state } => self.set_connection(state),
            ChatEvent::TimelineUpdated { messages } => self.replace_timeline(&messages),
            ChatEvent::Notice(notice) => self.handle_notice(notice),
        }
    }

    pub fn set_connection(&mut self, state: ConnectionState) -> Vec<TerminalLine> {
        if state == self.connection {
            return Vec::new();
        }
        self.connection = state;
        if state == ConnectionState::Connected {
            self.error_text = None;
        }
        vec![TerminalLine::Status(status_label(state).to_owned())]
    }

    /// Replace the timeline with a fresh snapshot. Only rows not printed
    /// before produce output.
    pub fn replace_timeline(&mut self, messages: &[Message]) -> Vec<TerminalLine> {
        let views: Vec<MessageView> = messages.iter().map(|m| self.view_of(m)).collect();

        let current: HashSet<&str> = views.iter().map(|view| view.id.as_str()).collect();
        let mut confirmed = self
            .messages
            .iter()
            .filter(|view| view.provisional && !current.contains(view.id.as_str()))
            .count();

        let mut lines = Vec::new();
        for view in &views {
            if !self.printed.insert(view.id.clone()) {
                continue;
            }
            if view.is_own && !view.provisional && confirmed > 0 {
                confirmed -= 1;
                lines.push(TerminalLine::Delivered(view.body.clone()));
            } else {
                lines.push(TerminalLine::Message(view.clone()));
            }
        }

        trace!(rows = views.len(), new = lines.len(), "timeline replaced");
        self.messages = views;
        lines
    }

    fn handle_notice(&mut self, notice: ChatNotice) -> Vec<TerminalLine> {
        let line = match notice {
            ChatNotice::Connected => TerminalLine::Notice("connected, welcome to the chat".into()),
            ChatNotice::Errored { code, message } => {
                let text = format!("connection rejected ({code}): {message}");
                self.error_text = Some(text.clone());
                TerminalLine::Error(format!("{text}; /reconnect or /logout"))
            }
            ChatNotice::Unreachable { message } => {
                TerminalLine::Error(format!("chat server unreachable ({message}), retrying"))
            }
            ChatNotice::LoadFailed { message } => {
                let text = format!("failed to load message history: {message}");
                self.error_text = Some(text.clone());
                TerminalLine::Error(text)
            }
            ChatNotice::SendRejected { reason } => {
                TerminalLine::Notice(format!("not sent: {reason}"))
            }
            ChatNotice::SendUnconfirmed { provisional_id } => {
                let id = provisional_id.to_string();
                let body = self
                    .messages
                    .iter()
                    .find(|view| view.id == id)
                    .map_or("message", |view| view.body.as_str());
                TerminalLine::Error(format!("no confirmation received for \"{body}\""))
            }
        };
        vec![line]
    }

    fn view_of(&self, message: &Message) -> MessageView {
        MessageView {
            id: message.id.to_string(),
            sender: message.sender_name.clone(),
            body: message.text.clone(),
            time: clock_label(message.timestamp_ms),
            is_own: message.sender_id == self.own_user_id,
            provisional: message.is_provisional(),
        }
    }
}

fn status_label(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Disconnected => "Disconnected",
        ConnectionState::Connecting => "Connecting",
        ConnectionState::Connected => "Connected",
        ConnectionState::Errored => "Connection error",
    }
}

fn clock_label(timestamp_ms: u64) -> String {
    i64::try_from(timestamp_ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|utc| utc.with_timezone(&Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_owned())
}
