use std::{fmt, time::Duration};

use serde::{Deserialize, Deserializer, Serialize, de};

pub const DEFAULT_ECHO_WINDOW_MS: u64 = 30_000;
pub const DEFAULT_ECHO_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_HISTORY_PAGE_SIZE: u16 = 100;
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Opaque user identifier issued by the chat service.
///
/// The service reports numeric ids for its users, older clients send them as
/// strings; both forms deserialize to the same value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(i64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(value) if value.trim().is_empty() => {
                Err(de::Error::custom("user id must not be empty"))
            }
            Raw::Text(value) => Ok(Self(value)),
            Raw::Number(value) => Ok(Self(value.to_string())),
        }
    }
}

/// Authenticated user identity attached to a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: UserId,
    pub username: String,
}

/// Token plus identity that authorizes chat activity.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    /// Bearer token used for history requests and the channel handshake.
    pub token: String,
    pub user: UserIdentity,
}

impl Session {
    pub fn new(token: impl Into<String>, user: UserIdentity) -> Self {
        Self {
            token: token.into(),
            user,
        }
    }
}

// Keeps bearer tokens out of log output.
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("user", &self.user)
            .finish()
    }
}

/// Message identifier.
///
/// `Local` ids are correlation tokens minted for optimistic (provisional)
/// messages; `Server` ids come from the service or are derived from payload
/// content when the service omits them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageId {
    Server(String),
    Local(String),
}

impl MessageId {
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Server(id) | Self::Local(id) => id,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(id) => f.write_str(id),
            Self::Local(id) => write!(f, "local:{id}"),
        }
    }
}

/// Canonical chat message as held by the timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    /// Non-empty message text.
    pub text: String,
    pub sender_id: UserId,
    pub sender_name: String,
    /// Creation time in milliseconds since Unix epoch.
    pub timestamp_ms: u64,
}

impl Message {
    /// Whether this is an optimistic local echo awaiting confirmation.
    pub fn is_provisional(&self) -> bool {
        self.id.is_local()
    }
}

/// Live channel connection state observed by frontends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No channel is open.
    #[default]
    Disconnected,
    /// A connection or reconnection attempt is in progress.
    Connecting,
    /// Handshake completed; live messages flow.
    Connected,
    /// Handshake rejected; only a fresh connect leaves this state.
    Errored,
}

/// Optional runtime tuning supplied when a chat session starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SessionTuning {
    /// Max distance between send time and echo timestamp for a match.
    pub echo_window_ms: Option<u64>,
    /// How long a provisional message is tracked before giving up on its echo.
    pub echo_timeout_ms: Option<u64>,
    /// Page size requested from the history endpoint.
    pub history_page_size: Option<u16>,
    pub reconnect_base_ms: Option<u64>,
    pub reconnect_max_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
}

impl SessionTuning {
    pub fn echo_window_ms(&self) -> u64 {
        self.echo_window_ms.unwrap_or(DEFAULT_ECHO_WINDOW_MS)
    }

    pub fn echo_timeout(&self) -> Duration {
        Duration::from_millis(self.echo_timeout_ms.unwrap_or(DEFAULT_ECHO_TIMEOUT_MS))
    }

    /// Requested page size, clamped to `1..=100`.
    pub fn history_page_size(&self) -> u16 {
        self.history_page_size
            .unwrap_or(DEFAULT_HISTORY_PAGE_SIZE)
            .clamp(1, 100)
    }

    pub fn reconnect_base_ms(&self) -> u64 {
        self.reconnect_base_ms.unwrap_or(DEFAULT_RECONNECT_BASE_MS)
    }

    pub fn reconnect_max_ms(&self) -> u64 {
        self.reconnect_max_ms
            .unwrap_or(DEFAULT_RECONNECT_MAX_MS)
            .max(self.reconnect_base_ms())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(
            self.handshake_timeout_ms
                .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_MS),
        )
    }
}

/// Command channel input accepted by a session runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatCommand {
    /// Compose and send a text message.
    Send { text: String },
    /// Start a fresh connection attempt, used to leave `Errored`.
    Reconnect,
    /// Tear the session down.
    Shutdown,
}

/// One-shot notifications intended for user-visible toasts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatNotice {
    /// First successful channel handshake of the session.
    Connected,
    /// Channel handshake was rejected.
    Errored { code: String, message: String },
    /// Channel could not be reached; reconnect attempts continue.
    Unreachable { message: String },
    /// History could not be loaded.
    LoadFailed { message: String },
    /// Composed text was rejected before anything was sent.
    SendRejected { reason: String },
    /// No echo arrived for a provisional message in time; it stays visible.
    SendUnconfirmed { provisional_id: MessageId },
}

/// Event channel output emitted by a session runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatEvent {
    /// Connection state transition.
    StateChanged { state: ConnectionState },
    /// Timeline snapshot after a mutation, in display order.
    TimelineUpdated { messages: Vec<Message> },
    /// User-visible notification.
    Notice(ChatNotice),
}
