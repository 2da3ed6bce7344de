//! Agent RPC fabric: one HTTP client per server plus a supervised status socket.

mod client;
mod supervisor;
pub mod types;

use std::sync::Arc;

use dashmap::DashMap;

pub use client::{AgentClient, CHECK_UPDATES_TIMEOUT};
pub use supervisor::{AgentSupervisor, dial, terminal_url, to_hub_event};

use crate::config::AgentConfig;
use crate::error::Result;
use crate::types::Server;

/// Process-wide cache of agent clients, keyed by server id.
pub struct AgentRegistry {
    config: AgentConfig,
    clients: DashMap<i64, Arc<AgentClient>>,
}

impl AgentRegistry {
    #[must_use]
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            clients: DashMap::new(),
        }
    }

    pub fn client(&self, server: &Server) -> Result<Arc<AgentClient>> {
        if let Some(client) = self.clients.get(&server.id) {
            return Ok(client.clone());
        }

        let client = Arc::new(AgentClient::new(server, &self.config)?);
        self.clients.insert(server.id, client.clone());
        Ok(client)
    }

    /// Drops the cached client after the server's address or token changed.
    pub fn forget(&self, server_id: i64) {
        self.clients.remove(&server_id);
    }
}
