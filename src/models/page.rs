use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{Arc, PoisonError, RwLock};

/// Ambient page values sampled whenever an event is tracked
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    pub url: String,
    pub referrer: String,
    pub user_agent: String,
    pub title: String,
    /// Account identifier typed by the visitor; only its digest is ever sent
    #[serde(default)]
    pub account: String,
}

impl PageInfo {
    pub fn new(url: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user_agent: user_agent.into(),
            ..Default::default()
        }
    }

    /// Lowercase hex SHA-256 of the account identifier
    pub fn account_digest(&self) -> String {
        format!("{:x}", Sha256::digest(self.account.as_bytes()))
    }
}

/// Shared, updatable view of the current page
///
/// Cloning the handle shares the same underlying page, so navigation
/// performed through one clone is observed by every holder.
#[derive(Debug, Clone, Default)]
pub struct PageHandle(Arc<RwLock<PageInfo>>);

impl PageHandle {
    pub fn new(info: PageInfo) -> Self {
        Self(Arc::new(RwLock::new(info)))
    }

    pub fn snapshot(&self) -> PageInfo {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Move to a new URL, recording the previous one as referrer
    pub fn navigate(&self, url: impl Into<String>) {
        let mut page = self.0.write().unwrap_or_else(PoisonError::into_inner);
        page.referrer = std::mem::replace(&mut page.url, url.into());
    }

    pub fn set_title(&self, title: impl Into<String>) {
        self.0.write().unwrap_or_else(PoisonError::into_inner).title = title.into();
    }

    pub fn set_account(&self, account: impl Into<String>) {
        self.0.write().unwrap_or_else(PoisonError::into_inner).account = account.into();
    }
}
