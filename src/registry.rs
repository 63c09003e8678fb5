//! Agent registry built from `[[agents]]` configuration.

use std::collections::BTreeMap;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::AgentConfig;
use crate::schedule::ScheduleSpec;
use crate::traits::{AgentDefinition, AgentPolicy, AgentRegistry};

#[derive(Serialize)]
struct HashInput<'a> {
    id: &'a str,
    name: &'a str,
    description: &'a str,
    agent_type: &'a str,
    enabled: bool,
    schedule: &'a ScheduleSpec,
    policy: &'a AgentPolicy,
    runner: Option<&'a str>,
}

/// Hex SHA-256 over the definition's JSON form. Any field change moves it.
pub fn definition_hash(def: &AgentDefinition) -> String {
    let input = HashInput {
        id: &def.id,
        name: &def.name,
        description: &def.description,
        agent_type: &def.agent_type,
        enabled: def.enabled,
        schedule: &def.schedule,
        policy: &def.policy,
        runner: def.runner.as_deref(),
    };
    let bytes = serde_json::to_vec(&input).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

impl AgentDefinition {
    pub fn from_config(cfg: &AgentConfig) -> anyhow::Result<Self> {
        let schedule = cfg
            .schedule
            .resolve(&cfg.timezone)
            .map_err(|e| anyhow::anyhow!("agent '{}': {}", cfg.id, e))?;
        let mut def = AgentDefinition {
            id: cfg.id.clone(),
            name: cfg.name.clone().unwrap_or_else(|| cfg.id.clone()),
            description: cfg.description.clone(),
            agent_type: cfg.agent_type.clone(),
            enabled: cfg.enabled,
            schedule,
            policy: cfg.policy.clone(),
            runner: cfg.runner.clone(),
            definition_hash: String::new(),
        };
        def.definition_hash = definition_hash(&def);
        Ok(def)
    }
}

/// Static registry: definitions are fixed for the life of the process.
#[derive(Debug, Clone, Default)]
pub struct ConfigAgentRegistry {
    agents: BTreeMap<String, AgentDefinition>,
}

impl ConfigAgentRegistry {
    pub fn from_config(agents: &[AgentConfig]) -> anyhow::Result<Self> {
        let defs = agents
            .iter()
            .map(AgentDefinition::from_config)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self::from_definitions(defs))
    }

    pub fn from_definitions(defs: Vec<AgentDefinition>) -> Self {
        Self {
            agents: defs.into_iter().map(|d| (d.id.clone(), d)).collect(),
        }
    }
}

impl AgentRegistry for ConfigAgentRegistry {
    fn get_agent(&self, agent_id: &str) -> Option<AgentDefinition> {
        self.agents.get(agent_id).cloned()
    }

    fn list_agents(&self) -> Vec<AgentDefinition> {
        self.agents.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn config() -> AppConfig {
        toml::from_str(
            r#"
            [[agents]]
            id = "digest"
            name = "Morning digest"
            schedule = "daily at 7am"

            [[agents]]
            id = "poller"
            enabled = false
            schedule = "every 10m"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn builds_definitions_from_config() {
        let registry = ConfigAgentRegistry::from_config(&config().agents).unwrap();
        let digest = registry.get_agent("digest").unwrap();
        assert_eq!(digest.name, "Morning digest");
        assert_eq!(digest.definition_hash.len(), 64);
        assert!(registry.get_agent("nope").is_none());
        assert_eq!(registry.list_agents().len(), 2);
        let enabled: Vec<String> = registry.enabled_agents().into_iter().map(|a| a.id).collect();
        assert_eq!(enabled, vec!["digest"]);
    }

    #[test]
    fn hash_tracks_definition_changes() {
        let mut cfg = config();
        let before = ConfigAgentRegistry::from_config(&cfg.agents)
            .unwrap()
            .get_agent("digest")
            .unwrap()
            .definition_hash;
        let again = ConfigAgentRegistry::from_config(&cfg.agents)
            .unwrap()
            .get_agent("digest")
            .unwrap()
            .definition_hash;
        assert_eq!(before, again);

        cfg.agents[0].policy.priority = Some(90);
        let after = ConfigAgentRegistry::from_config(&cfg.agents)
            .unwrap()
            .get_agent("digest")
            .unwrap()
            .definition_hash;
        assert_ne!(before, after);
    }
}
