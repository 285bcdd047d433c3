use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use berth_types::{ServerConfig, ServerId, ServerState, ServerSummary};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    pub server_id: ServerId,
    /// Runtime container id.
    pub handle: String,
    pub container_name: String,
    pub started_at: DateTime<Utc>,
    /// `None` when recovered from a container whose config label was missing or unreadable.
    pub config: Option<ServerConfig>,
    pub state: ServerState,
}

impl RegistryEntry {
    pub fn summary(&self) -> ServerSummary {
        ServerSummary {
            server_id: self.server_id.clone(),
            container_id: self.handle.clone(),
            container_name: self.container_name.clone(),
            state: self.state,
            started_at: self.started_at,
            config: self.config.clone(),
        }
    }
}

/// `server id -> container` map. Readable from anywhere; only the orchestrator mutates it.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<HashMap<ServerId, RegistryEntry>>>,
}

impl Registry {
    pub fn get(&self, server_id: &ServerId) -> Option<RegistryEntry> {
        self.read(|m| m.get(server_id).cloned())
    }

    pub fn contains(&self, server_id: &ServerId) -> bool {
        self.read(|m| m.contains_key(server_id))
    }

    pub fn len(&self) -> usize {
        self.read(HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries ordered by server id.
    pub fn snapshot(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<RegistryEntry> = self.read(|m| m.values().cloned().collect());
        entries.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        entries
    }

    pub(crate) fn insert(&self, entry: RegistryEntry) {
        self.write(|m| {
            m.insert(entry.server_id.clone(), entry);
        });
    }

    pub(crate) fn remove(&self, server_id: &ServerId) -> Option<RegistryEntry> {
        self.write(|m| m.remove(server_id))
    }

    pub(crate) fn update(&self, server_id: &ServerId, f: impl FnOnce(&mut RegistryEntry)) {
        self.write(|m| {
            if let Some(entry) = m.get_mut(server_id) {
                f(entry);
            }
        });
    }

    /// Removes the entry only while it still points at `handle`.
    pub(crate) fn remove_if_handle(&self, server_id: &ServerId, handle: &str) -> bool {
        self.write(|m| {
            if m.get(server_id).is_some_and(|e| e.handle == handle) {
                m.remove(server_id);
                true
            } else {
                false
            }
        })
    }

    fn read<T>(&self, f: impl FnOnce(&HashMap<ServerId, RegistryEntry>) -> T) -> T {
        f(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write<T>(&self, f: impl FnOnce(&mut HashMap<ServerId, RegistryEntry>) -> T) -> T {
        f(&mut self.inner.write().unwrap_or_else(PoisonError::into_inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> RegistryEntry {
        RegistryEntry {
            server_id: ServerId::parse(id).unwrap(),
            handle: format!("h-{id}"),
            container_name: format!("palworld-{id}"),
            started_at: Utc::now(),
            config: None,
            state: ServerState::Running,
        }
    }

    #[test]
    fn remove_if_handle_skips_replaced_entries() {
        let registry = Registry::default();
        registry.insert(entry("a"));
        let id = ServerId::parse("a").unwrap();

        assert!(!registry.remove_if_handle(&id, "h-old"));
        assert!(registry.contains(&id));
        assert!(registry.remove_if_handle(&id, "h-a"));
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_is_sorted() {
        let registry = Registry::default();
        for id in ["c", "a", "b"] {
            registry.insert(entry(id));
        }
        let ids: Vec<String> = registry
            .snapshot()
            .into_iter()
            .map(|e| String::from(e.server_id))
            .collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn update_ignores_unknown() {
        let registry = Registry::default();
        registry.update(&ServerId::parse("ghost").unwrap(), |e| e.state = ServerState::Stopped);
        assert!(registry.is_empty());
    }
}
