//! # Virtual Agent Router
//!
//! Maps an `agent_id` to the connector that serves it. Built once at startup from
//! every configured connector's `list_agents()` and read-only afterwards.
//!
//! ## Rules:
//! - Registration order is preserved for listing
//! - Duplicate agent ids: the first registration wins, later ones are dropped with a warning
//! - Default agent: the first registration claiming `is_default`, otherwise the first registered

use crate::connectors::{AgentInfo, Connector};
use crate::error::{AppResult, GatewayError};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

struct Registration {
    info: AgentInfo,
    connector: Arc<dyn Connector>,
}

#[derive(Default)]
pub struct VirtualAgentRouter {
    registrations: Vec<Registration>,
    by_id: HashMap<String, usize>,
    default_index: Option<usize>,
}

impl VirtualAgentRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask `connector` for its agents and register each of them.
    /// Returns how many agents were accepted.
    pub async fn register(&mut self, connector: Arc<dyn Connector>) -> usize {
        let agents = connector.list_agents().await;
        let mut accepted = 0;
        for agent in agents {
            if let Some(&existing) = self.by_id.get(&agent.agent_id) {
                warn!(
                    agent_id = %agent.agent_id,
                    kept = %self.registrations[existing].connector.name(),
                    dropped = %connector.name(),
                    "Duplicate agent id, keeping first registration"
                );
                continue;
            }

            let index = self.registrations.len();
            if agent.is_default {
                match self.default_index {
                    None => self.default_index = Some(index),
                    Some(_) => warn!(agent_id = %agent.agent_id, "Default agent already set, ignoring default flag"),
                }
            }
            info!(agent_id = %agent.agent_id, connector = %connector.name(), "Registered agent");
            self.by_id.insert(agent.agent_id.clone(), index);
            self.registrations.push(Registration {
                info: agent,
                connector: connector.clone(),
            });
            accepted += 1;
        }
        accepted
    }

    pub fn lookup(&self, agent_id: &str) -> AppResult<Arc<dyn Connector>> {
        self.by_id
            .get(agent_id)
            .map(|&index| self.registrations[index].connector.clone())
            .ok_or_else(|| GatewayError::UnknownAgent(agent_id.to_string()))
    }

    /// Every registered agent in registration order, with the effective default flagged.
    pub fn list_all_agents(&self) -> Vec<AgentInfo> {
        let default = self.default_position();
        self.registrations
            .iter()
            .enumerate()
            .map(|(index, registration)| AgentInfo {
                is_default: Some(index) == default,
                ..registration.info.clone()
            })
            .collect()
    }

    pub fn default_agent(&self) -> Option<&AgentInfo> {
        self.default_position()
            .map(|index| &self.registrations[index].info)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    fn default_position(&self) -> Option<usize> {
        if self.registrations.is_empty() {
            return None;
        }
        Some(self.default_index.unwrap_or(0))
    }
}
