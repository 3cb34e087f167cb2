use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("session file is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Session-scoped string storage shared by everything running in one page session
///
/// Reads and writes are not transactional: concurrent writers to the same
/// key race and the last one wins.
pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str);

    fn remove(&self, key: &str);
}
