//! Service adapters for the chat room backend.
//!
//! [`HttpHistoryLoader`] reads the message collection over HTTP,
//! [`AuthClient`] exchanges credentials for a session, [`WsTransport`] keeps
//! the socket.io live channel up, and [`ChatSession`] runs the session actor
//! that ties them to the core timeline.

use std::time::Duration;

use chat_core::{ChatError, ErrorCategory};
use serde::Deserialize;
use url::Url;

pub mod auth;
pub mod history;
pub mod runtime;
pub mod transport;
pub mod wire;

#[cfg(test)]
pub(crate) mod test_support;

pub use auth::AuthClient;
pub use history::{HistorySource, HttpHistoryLoader};
pub use runtime::{ChatSession, ChatSessionHandle, SessionView};
pub use transport::{Transport, TransportEvent, WsTransport};

const USER_AGENT: &str = concat!("chat-remote/", env!("CARGO_PKG_VERSION"));
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Location of the chat service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    base_url: Url,
}

impl RemoteConfig {
    /// Accepts `http` and `https` base URLs; a trailing path is kept.
    pub fn new(mut base_url: Url) -> Result<Self, ChatError> {
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(ChatError::new(
                ErrorCategory::Config,
                "invalid_backend_url",
                format!("unsupported backend url scheme '{}'", base_url.scheme()),
            ));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        base_url.set_query(None);
        base_url.set_fragment(None);
        Ok(Self { base_url })
    }

    pub fn parse(raw: &str) -> Result<Self, ChatError> {
        let url = Url::parse(raw.trim()).map_err(|err| {
            ChatError::new(
                ErrorCategory::Config,
                "invalid_backend_url",
                format!("invalid backend url '{raw}': {err}"),
            )
        })?;
        Self::new(url)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve a service path such as `api/messages` against the base URL.
    pub fn endpoint(&self, path: &str) -> Result<Url, ChatError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|err| {
                ChatError::new(
                    ErrorCategory::Config,
                    "invalid_endpoint",
                    format!("cannot resolve '{path}': {err}"),
                )
            })
    }

    /// Engine.IO v4 WebSocket endpoint.
    pub fn socket_url(&self) -> Result<Url, ChatError> {
        let mut url = self.endpoint("socket.io/")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme).map_err(|()| {
            ChatError::new(
                ErrorCategory::Config,
                "invalid_backend_url",
                format!("cannot derive websocket url from {}", self.base_url),
            )
        })?;
        url.set_query(Some("EIO=4&transport=websocket"));
        Ok(url)
    }
}

/// Shared HTTP client for history and auth requests.
pub fn http_client() -> Result<reqwest::Client, ChatError> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|err| {
            ChatError::new(
                ErrorCategory::Internal,
                "http_client_build_error",
                err.to_string(),
            )
        })
}

#[derive(Deserialize)]
struct ServiceErrorBody {
    error: ServiceErrorDetail,
}

#[derive(Deserialize)]
struct ServiceErrorDetail {
    message: String,
}

/// Extract `error.message` from a service error body, if present.
pub(crate) fn service_error_message(body: &str) -> Option<String> {
    serde_json::from_str::<ServiceErrorBody>(body)
        .ok()
        .map(|body| body.error.message)
        .filter(|message| !message.trim().is_empty())
}
