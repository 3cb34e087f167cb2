use dashmap::DashMap;

use super::trait_def::SessionStore;

/// In-process session storage; dropped with the page session
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    entries: DashMap<String, String>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn set(&self, key: &str, value: &str) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_overwrites_and_remove_clears() {
        let store = MemorySessionStore::new();
        store.set("client_ip_cache", "1.1.1.1");
        store.set("client_ip_cache", "2.2.2.2");
        assert_eq!(store.get("client_ip_cache").as_deref(), Some("2.2.2.2"));

        store.remove("client_ip_cache");
        assert!(store.get("client_ip_cache").is_none());
        assert!(store.is_empty());
    }
}
