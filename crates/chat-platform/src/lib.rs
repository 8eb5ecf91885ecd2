//! Local key-value credential storage and the session gate built on it.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use thiserror::Error;

/// JSON file backed credential store.
pub mod file_store;
/// Session gate and vault over a scoped credential store.
pub mod session;

pub use file_store::FileCredentialStore;
pub use session::{SessionGate, SessionVault, Unauthenticated, UnauthenticatedReason};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialStoreError {
    #[error("credential not found")]
    NotFound,
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
    #[error("credential store backend failure: {0}")]
    Backend(String),
}

/// Key-value store for credentials, namespaced by service.
pub trait CredentialStore: Send + Sync {
    fn set_value(&self, service: &str, key: &str, value: &str)
    -> Result<(), CredentialStoreError>;

    fn get_value(&self, service: &str, key: &str) -> Result<String, CredentialStoreError>;

    fn delete_value(&self, service: &str, key: &str) -> Result<(), CredentialStoreError>;
}

#[derive(Clone, Default)]
pub struct InMemoryCredentialStore {
    data: Arc<RwLock<HashMap<(String, String), String>>>,
}

impl CredentialStore for InMemoryCredentialStore {
    fn set_value(
        &self,
        service: &str,
        key: &str,
        value: &str,
    ) -> Result<(), CredentialStoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| CredentialStoreError::Backend("poisoned lock".to_owned()))?;
        data.insert((service.to_owned(), key.to_owned()), value.to_owned());
        Ok(())
    }

    fn get_value(&self, service: &str, key: &str) -> Result<String, CredentialStoreError> {
        let data = self
            .data
            .read()
            .map_err(|_| CredentialStoreError::Backend("poisoned lock".to_owned()))?;
        data.get(&(service.to_owned(), key.to_owned()))
            .cloned()
            .ok_or(CredentialStoreError::NotFound)
    }

    fn delete_value(&self, service: &str, key: &str) -> Result<(), CredentialStoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| CredentialStoreError::Backend("poisoned lock".to_owned()))?;
        data.remove(&(service.to_owned(), key.to_owned()))
            .map(|_| ())
            .ok_or(CredentialStoreError::NotFound)
    }
}

#[cfg(feature = "os-keyring")]
#[derive(Default, Clone, Copy)]
pub struct OsKeyringCredentialStore;

#[cfg(feature = "os-keyring")]
impl CredentialStore for OsKeyringCredentialStore {
    fn set_value(
        &self,
        service: &str,
        key: &str,
        value: &str,
    ) -> Result<(), CredentialStoreError> {
        let entry = keyring::Entry::new(service, key)
            .map_err(|err| CredentialStoreError::Backend(err.to_string()))?;
        entry
            .set_password(value)
            .map_err(|err| CredentialStoreError::Backend(err.to_string()))
    }

    fn get_value(&self, service: &str, key: &str) -> Result<String, CredentialStoreError> {
        let entry = keyring::Entry::new(service, key)
            .map_err(|err| CredentialStoreError::Backend(err.to_string()))?;
        entry.get_password().map_err(map_keyring_error)
    }

    fn delete_value(&self, service: &str, key: &str) -> Result<(), CredentialStoreError> {
        let entry = keyring::Entry::new(service, key)
            .map_err(|err| CredentialStoreError::Backend(err.to_string()))?;
        entry.delete_credential().map_err(map_keyring_error)
    }
}

#[cfg(feature = "os-keyring")]
fn map_keyring_error(err: keyring::Error) -> CredentialStoreError {
    match err {
        keyring::Error::NoEntry => CredentialStoreError::NotFound,
        keyring::Error::NoStorageAccess(inner) => {
            CredentialStoreError::Unavailable(inner.to_string())
        }
        other => CredentialStoreError::Backend(other.to_string()),
    }
}

/// Credential store bound to one service namespace.
#[derive(Clone)]
pub struct ScopedCredentialStore<S: CredentialStore> {
    inner: S,
    service: String,
}

impl<S: CredentialStore> ScopedCredentialStore<S> {
    pub fn new(inner: S, service: impl Into<String>) -> Self {
        Self {
            inner,
            service: service.into(),
        }
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), CredentialStoreError> {
        self.inner.set_value(&self.service, key, value)
    }

    pub fn get(&self, key: &str) -> Result<String, CredentialStoreError> {
        self.inner.get_value(&self.service, key)
    }

    /// Read a value, mapping `NotFound` to `None`.
    pub fn get_optional(&self, key: &str) -> Result<Option<String>, CredentialStoreError> {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(CredentialStoreError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn delete(&self, key: &str) -> Result<(), CredentialStoreError> {
        self.inner.delete_value(&self.service, key)
    }
}
