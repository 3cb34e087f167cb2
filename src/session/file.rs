//! JSON-file session storage
//!
//! Lets the CLI keep its session values (the resolved client IP in
//! particular) between invocations. Every write rewrites the whole file;
//! session state is a handful of short strings.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::trait_def::{SessionError, SessionStore};

#[derive(Debug)]
pub struct FileSessionStore {
    path: PathBuf,
    entries: DashMap<String, String>,
}

impl FileSessionStore {
    /// Open the store at `path`, starting empty if the file does not exist yet
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let path = path.as_ref().to_path_buf();
        let entries: DashMap<String, String> = match std::fs::read_to_string(&path) {
            Ok(raw) if !raw.trim().is_empty() => {
                let stored: BTreeMap<String, String> = serde_json::from_str(&raw)?;
                stored.into_iter().collect()
            }
            Ok(_) => DashMap::new(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => DashMap::new(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<(), SessionError> {
        let snapshot: BTreeMap<String, String> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, serde_json::to_vec_pretty(&snapshot)?)?;
        Ok(())
    }

    fn persist_or_warn(&self) {
        if let Err(err) = self.persist() {
            warn!(path = %self.path.display(), error = %err, "failed to persist session store");
        }
    }
}

impl SessionStore for FileSessionStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn set(&self, key: &str, value: &str) {
        self.entries.insert(key.to_string(), value.to_string());
        self.persist_or_warn();
    }

    fn remove(&self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.persist_or_warn();
        }
    }
}
