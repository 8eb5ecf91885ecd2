use chat_core::{Session, UserIdentity};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{CredentialStore, CredentialStoreError, ScopedCredentialStore};

pub const DEFAULT_SESSION_SERVICE: &str = "dev.chatroom.session";
const TOKEN_KEY: &str = "token";
const USER_KEY: &str = "user";

/// Why no session could be produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnauthenticatedReason {
    MissingToken,
    MissingUser,
    InvalidUser,
    StoreUnavailable,
}

/// Returned by [`SessionGate::check`] when chat activity must not start.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unauthenticated ({reason:?})")]
pub struct Unauthenticated {
    pub reason: UnauthenticatedReason,
}

impl Unauthenticated {
    pub fn new(reason: UnauthenticatedReason) -> Self {
        Self { reason }
    }
}

/// Validates that a session exists before any chat activity starts.
pub trait SessionGate {
    /// Read the stored session. Has no side effects beyond the read.
    fn check(&self) -> Result<Session, Unauthenticated>;
}

/// Persists the session as a `token` and a JSON `user` entry.
pub struct SessionVault<S: CredentialStore> {
    store: ScopedCredentialStore<S>,
}

impl<S: CredentialStore> SessionVault<S> {
    pub fn new(inner: S) -> Self {
        Self::with_service(inner, DEFAULT_SESSION_SERVICE)
    }

    pub fn with_service(inner: S, service: impl Into<String>) -> Self {
        Self {
            store: ScopedCredentialStore::new(inner, service),
        }
    }

    /// Store a freshly issued session.
    pub fn save(&self, session: &Session) -> Result<(), CredentialStoreError> {
        let user = serde_json::to_string(&session.user)
            .map_err(|err| CredentialStoreError::Backend(err.to_string()))?;
        self.store.set(TOKEN_KEY, &session.token)?;
        self.store.set(USER_KEY, &user)?;
        debug!(user_id = %session.user.id, "session saved");
        Ok(())
    }

    /// Remove both session entries. Missing entries are not an error.
    pub fn clear(&self) -> Result<(), CredentialStoreError> {
        for key in [TOKEN_KEY, USER_KEY] {
            match self.store.delete(key) {
                Ok(()) | Err(CredentialStoreError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }
        debug!("session cleared");
        Ok(())
    }
}

impl<S: CredentialStore> SessionGate for SessionVault<S> {
    fn check(&self) -> Result<Session, Unauthenticated> {
        let read = |key: &str| {
            self.store.get_optional(key).map_err(|err| {
                warn!(error = %err, "credential store read failed");
                Unauthenticated::new(UnauthenticatedReason::StoreUnavailable)
            })
        };

        let token = read(TOKEN_KEY)?
            .filter(|token| !token.trim().is_empty())
            .ok_or(Unauthenticated::new(UnauthenticatedReason::MissingToken))?;
        let raw_user = read(USER_KEY)?
            .ok_or(Unauthenticated::new(UnauthenticatedReason::MissingUser))?;

        let user = serde_json::from_str::<UserIdentity>(&raw_user)
            .ok()
            .filter(|user| !user.username.trim().is_empty())
            .ok_or(Unauthenticated::new(UnauthenticatedReason::InvalidUser))?;

        Ok(Session::new(token, user))
    }
}
