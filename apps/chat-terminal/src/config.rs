//! Environment-backed runtime configuration for `chat-terminal`.

use std::{env, error::Error, fmt, path::PathBuf};

use chat_core::SessionTuning;
use url::Url;

const DEFAULT_BACKEND_URL: &str = "http://localhost:1337";
const DEFAULT_SESSION_FILE: &str = "./.chatroom/session.json";

/// Runtime configuration used by the terminal app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalConfig {
    /// Base URL of the chat service (REST and socket.io).
    pub backend_url: Url,
    /// JSON file holding the stored session when the OS keyring is not used.
    pub session_file: PathBuf,
    /// Optional login identifier (email or username) prefill.
    pub prefill_user: Option<String>,
    /// Optional password prefill.
    pub prefill_password: Option<String>,
    /// Runtime tuning forwarded to `ChatSession::start`.
    pub tuning: SessionTuning,
}

impl TerminalConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let raw_url = optional_trimmed_env("CHATROOM_BACKEND_URL", &mut lookup)
            .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_owned());
        let backend_url = Url::parse(&raw_url).map_err(|err| ConfigError::InvalidValue {
            key: "CHATROOM_BACKEND_URL",
            value: raw_url.clone(),
            reason: err.to_string(),
        })?;
        if !matches!(backend_url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidValue {
                key: "CHATROOM_BACKEND_URL",
                value: raw_url,
                reason: "must be an http or https url".to_owned(),
            });
        }

        let session_file = optional_trimmed_env("CHATROOM_SESSION_FILE", &mut lookup)
            .map_or_else(|| PathBuf::from(DEFAULT_SESSION_FILE), PathBuf::from);
        let prefill_user = optional_trimmed_env("CHATROOM_USER", &mut lookup);
        let prefill_password = lookup("CHATROOM_PASSWORD").filter(|value| !value.is_empty());

        let history_page_size = parse_optional_u16("CHATROOM_HISTORY_PAGE_SIZE", &mut lookup)?;
        if let Some(size) = history_page_size
            && !(1..=100).contains(&size)
        {
            return Err(ConfigError::InvalidValue {
                key: "CHATROOM_HISTORY_PAGE_SIZE",
                value: size.to_string(),
                reason: "must be between 1 and 100".to_owned(),
            });
        }

        let reconnect_base_ms = parse_optional_u64("CHATROOM_RECONNECT_BASE_MS", &mut lookup)?;
        if reconnect_base_ms == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "CHATROOM_RECONNECT_BASE_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        let tuning = SessionTuning {
            echo_window_ms: parse_optional_u64("CHATROOM_ECHO_WINDOW_MS", &mut lookup)?,
            echo_timeout_ms: parse_optional_u64("CHATROOM_ECHO_TIMEOUT_MS", &mut lookup)?,
            history_page_size,
            reconnect_base_ms,
            reconnect_max_ms: parse_optional_u64("CHATROOM_RECONNECT_MAX_MS", &mut lookup)?,
            handshake_timeout_ms: parse_optional_u64("CHATROOM_HANDSHAKE_TIMEOUT_MS", &mut lookup)?,
        };

        Ok(Self {
            backend_url,
            session_file,
            prefill_user,
            prefill_password,
            tuning,
        })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional_u16<F>(key: &'static str, lookup: &mut F) -> Result<Option<u16>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u16>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_u64<F>(key: &'static str, lookup: &mut F) -> Result<Option<u64>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u64>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<TerminalConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        TerminalConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_without_environment() {
        let cfg = config_from_pairs(&[]).expect("empty environment should parse");
        assert_eq!(cfg.backend_url.as_str(), "http://localhost:1337/");
        assert_eq!(cfg.session_file, PathBuf::from(DEFAULT_SESSION_FILE));
        assert_eq!(cfg.prefill_user, None);
        assert_eq!(cfg.prefill_password, None);
        assert_eq!(cfg.tuning, SessionTuning::default());
    }

    #[test]
    fn parses_prefill_and_tuning_values() {
        let cfg = config_from_pairs(&[
            ("CHATROOM_BACKEND_URL", " https://chat.example.org "),
            ("CHATROOM_SESSION_FILE", "/tmp/chat/session.json"),
            ("CHATROOM_USER", "alice@example.org"),
            ("CHATROOM_PASSWORD", " secret "),
            ("CHATROOM_HISTORY_PAGE_SIZE", "25"),
            ("CHATROOM_ECHO_WINDOW_MS", "5000"),
            ("CHATROOM_ECHO_TIMEOUT_MS", "20000"),
            ("CHATROOM_RECONNECT_BASE_MS", "250"),
            ("CHATROOM_RECONNECT_MAX_MS", "8000"),
            ("CHATROOM_HANDSHAKE_TIMEOUT_MS", "3000"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.backend_url.as_str(), "https://chat.example.org/");
        assert_eq!(cfg.session_file, PathBuf::from("/tmp/chat/session.json"));
        assert_eq!(cfg.prefill_user.as_deref(), Some("alice@example.org"));
        assert_eq!(cfg.prefill_password.as_deref(), Some(" secret "));
        assert_eq!(cfg.tuning.history_page_size, Some(25));
        assert_eq!(cfg.tuning.echo_window_ms, Some(5_000));
        assert_eq!(cfg.tuning.echo_timeout_ms, Some(20_000));
        assert_eq!(cfg.tuning.reconnect_base_ms, Some(250));
        assert_eq!(cfg.tuning.reconnect_max_ms, Some(8_000));
        assert_eq!(cfg.tuning.handshake_timeout_ms, Some(3_000));
    }

    #[test]
    fn rejects_invalid_numeric_values() {
        let err = config_from_pairs(&[("CHATROOM_ECHO_WINDOW_MS", "soon")])
            .expect_err("invalid number should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "CHATROOM_ECHO_WINDOW_MS",
                ..
            }
        ));

        let err = config_from_pairs(&[("CHATROOM_HISTORY_PAGE_SIZE", "0")])
            .expect_err("zero page size should fail");
        assert_eq!(
            err.to_string(),
            "invalid CHATROOM_HISTORY_PAGE_SIZE='0': must be between 1 and 100"
        );

        assert!(config_from_pairs(&[("CHATROOM_RECONNECT_BASE_MS", "0")]).is_err());
    }

    #[test]
    fn rejects_unusable_backend_url() {
        let err = config_from_pairs(&[("CHATROOM_BACKEND_URL", "localhost")])
            .expect_err("relative url should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "CHATROOM_BACKEND_URL",
                ..
            }
        ));
        assert!(config_from_pairs(&[("CHATROOM_BACKEND_URL", "ws://localhost:1337")]).is_err());
    }
}
