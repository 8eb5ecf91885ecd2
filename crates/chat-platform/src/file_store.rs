//! Credential store persisted as one JSON document on disk.

use std::{
    collections::BTreeMap,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    process,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::debug;

use crate::{CredentialStore, CredentialStoreError};

type Document = BTreeMap<String, BTreeMap<String, String>>;

/// Durable credential store keeping `service -> key -> value` in a JSON file.
///
/// Each write stages an owner-only temp file and renames it over the target.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Document, CredentialStoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Document::new()),
            Err(err) => {
                return Err(CredentialStoreError::Unavailable(format!(
                    "cannot read session file {}: {err}",
                    self.path.display()
                )));
            }
        };

        serde_json::from_str(&raw).map_err(|err| {
            CredentialStoreError::Backend(format!(
                "session file {} is not valid JSON: {err}",
                self.path.display()
            ))
        })
    }

    fn save(&self, document: &Document) -> Result<(), CredentialStoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|err| {
                CredentialStoreError::Unavailable(format!(
                    "cannot create directory {} for the session file: {err}",
                    parent.display()
                ))
            })?;
        }

        let encoded = serde_json::to_vec_pretty(document)
            .map_err(|err| CredentialStoreError::Backend(err.to_string()))?;
        let temp_path = temp_path_for(&self.path);
        if let Err(err) = write_private(&temp_path, &encoded) {
            let _ = fs::remove_file(&temp_path);
            return Err(CredentialStoreError::Unavailable(format!(
                "cannot stage session file {}: {err}",
                temp_path.display()
            )));
        }

        replace_file(&temp_path, &self.path).map_err(|err| {
            let _ = fs::remove_file(&temp_path);
            CredentialStoreError::Backend(format!(
                "cannot replace session file {}: {err}",
                self.path.display()
            ))
        })?;

        debug!(path = %self.path.display(), bytes = encoded.len(), "session file written");
        Ok(())
    }

    fn update<R>(
        &self,
        mutate: impl FnOnce(&mut Document) -> Result<R, CredentialStoreError>,
    ) -> Result<R, CredentialStoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| CredentialStoreError::Backend("poisoned lock".to_owned()))?;
        let mut document = self.load()?;
        let result = mutate(&mut document)?;
        if document.is_empty() {
            remove_if_present(&self.path)?;
        } else {
            self.save(&document)?;
        }
        Ok(result)
    }
}

impl CredentialStore for FileCredentialStore {
    fn set_value(
        &self,
        service: &str,
        key: &str,
        value: &str,
    ) -> Result<(), CredentialStoreError> {
        self.update(|document| {
            document
                .entry(service.to_owned())
                .or_default()
                .insert(key.to_owned(), value.to_owned());
            Ok(())
        })
    }

    fn get_value(&self, service: &str, key: &str) -> Result<String, CredentialStoreError> {
        self.load()?
            .get(service)
            .and_then(|entries| entries.get(key))
            .cloned()
            .ok_or(CredentialStoreError::NotFound)
    }

    fn delete_value(&self, service: &str, key: &str) -> Result<(), CredentialStoreError> {
        self.update(|document| {
            let entries = document
                .get_mut(service)
                .ok_or(CredentialStoreError::NotFound)?;
            entries.remove(key).ok_or(CredentialStoreError::NotFound)?;
            if entries.is_empty() {
                document.remove(service);
            }
            Ok(())
        })
    }
}

fn remove_if_present(path: &Path) -> Result<(), CredentialStoreError> {
    remove_if_exists(path).map_err(|err| {
        CredentialStoreError::Backend(format!(
            "cannot delete session file {}: {err}",
            path.display()
        ))
    })
}

/// Create `path` readable by the owner only, since it holds bearer tokens.
fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

fn replace_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        // Rename cannot overwrite an existing file on Windows.
        Err(_) if cfg!(windows) => {
            remove_if_exists(to)?;
            fs::rename(from, to)
        }
        Err(err) => Err(err),
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("credentials.json");
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    parent.join(format!(".{file_name}.{}.{now_nanos}.tmp", process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn unique_temp_path(label: &str) -> PathBuf {
        let now_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        env::temp_dir()
            .join(format!("chatroom-{label}-{now_nanos}"))
            .join("credentials.json")
    }

    #[test]
    fn persists_values_across_instances() {
        let path = unique_temp_path("file-store");
        let store = FileCredentialStore::new(&path);
        store
            .set_value("chatroom", "token", "jwt-1")
            .expect("set should work");
        store
            .set_value("chatroom", "user", "{\"id\":1}")
            .expect("set should work");

        let reopened = FileCredentialStore::new(&path);
        assert_eq!(
            reopened.get_value("chatroom", "token").expect("get"),
            "jwt-1"
        );

        reopened
            .delete_value("chatroom", "token")
            .expect("delete should work");
        reopened
            .delete_value("chatroom", "user")
            .expect("delete should work");
        assert!(!path.exists(), "empty store removes its file");
        assert_eq!(
            store.get_value("chatroom", "token"),
            Err(CredentialStoreError::NotFound)
        );
    }

    #[test]
    fn corrupt_file_is_a_backend_error() {
        let path = unique_temp_path("corrupt");
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, "not json").expect("write");

        let store = FileCredentialStore::new(&path);
        assert!(matches!(
            store.get_value("chatroom", "token"),
            Err(CredentialStoreError::Backend(_))
        ));
        let _ = fs::remove_file(&path);
    }

    #[cfg(unix)]
    #[test]
    fn session_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let path = unique_temp_path("private");
        let store = FileCredentialStore::new(&path);
        store
            .set_value("chatroom", "token", "jwt-private")
            .expect("set should work");

        let mode = fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let leftovers = fs::read_dir(path.parent().expect("parent"))
            .expect("read dir")
            .count();
        assert_eq!(leftovers, 1, "temp file is renamed away");
        let _ = fs::remove_file(&path);
    }
}
