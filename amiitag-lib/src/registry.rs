//! Host-owned set of device sessions, keyed by peer name.

use crate::device::DeviceSession;
use crate::transport::TransportChannel;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

pub struct DeviceRegistry<C> {
    sessions: HashMap<String, Arc<DeviceSession<C>>>,
}

impl<C> Default for DeviceRegistry<C> {
    fn default() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }
}

impl<C: TransportChannel> DeviceRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session previously registered under `name`, if any.
    pub fn insert(&mut self, name: impl Into<String>, session: DeviceSession<C>) -> Option<Arc<DeviceSession<C>>> {
        self.sessions.insert(name.into(), Arc::new(session))
    }

    pub fn get(&self, name: &str) -> Option<Arc<DeviceSession<C>>> {
        self.sessions.get(name).cloned()
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<DeviceSession<C>>> {
        self.sessions.remove(name)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.sessions.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn disconnect_all(&self) {
        for name in self.names() {
            if let Some(session) = self.sessions.get(&name) {
                // disconnect never fails
                let _ = session.disconnect().await;
                info!("Disconnected {}", name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::device::SessionState;
    use crate::transport::MemoryChannel;

    #[tokio::test]
    async fn test_registry_names_and_disconnect() {
        let mut registry = DeviceRegistry::new();
        let mut peers = Vec::new();
        for name in ["Puck B", "Puck A"] {
            let (channel, peer) = MemoryChannel::pair();
            peers.push(peer);
            assert!(registry.insert(name, DeviceSession::new(channel, SessionConfig::default())).is_none());
        }
        assert_eq!(registry.names(), vec!["Puck A", "Puck B"]);
        assert_eq!(registry.len(), 2);

        registry.disconnect_all().await;
        assert_eq!(registry.get("Puck A").unwrap().state(), SessionState::Idle);
        assert!(registry.remove("Puck B").is_some());
        assert!(registry.get("Puck B").is_none());
    }
}
