// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Identity & Character Definitions
//!
//! A [`Character`] is the immutable description of an agent handed to the host
//! by an external loader. The host never reads character files itself; it only
//! validates the record it is given and derives a stable [`AgentId`] from it.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Agent identity, lifecycle status and lifecycle error taxonomy

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::pool::{LeaseId, RetryPolicy};

/// Namespace for name-derived agent ids. Changing it re-keys every agent.
const AGENT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6a1f_0c2e_57d4_4b8a_9e11_2f3c_4d5e_6f70);

const MAX_NAME_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic id for an agent name. The same name always maps to the
    /// same id across processes and restarts.
    pub fn from_name(name: &str) -> Self {
        Self(Uuid::new_v5(&AGENT_ID_NAMESPACE, name.as_bytes()))
    }

    /// Accepts either a UUID string or an arbitrary identifier. Non-UUID input
    /// is hashed with [`AgentId::from_name`].
    pub fn resolve(raw: &str) -> Self {
        match Uuid::parse_str(raw.trim()) {
            Ok(uuid) => Self(uuid),
            Err(_) => Self::from_name(raw.trim()),
        }
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable definition of an agent's identity and configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Character {
    /// Explicit id. When absent the id is derived from `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<AgentId>,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bio: Vec<String>,

    /// Plugin package names the agent expects to have loaded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<String>,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub settings: serde_json::Map<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub secrets: serde_json::Map<String, serde_json::Value>,
}

impl Character {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            username: None,
            bio: Vec::new(),
            plugins: Vec::new(),
            settings: serde_json::Map::new(),
            secrets: serde_json::Map::new(),
        }
    }

    /// Character used when the caller supplies none.
    pub fn default_agent() -> Self {
        let mut character = Self::new("Warden");
        character.username = Some("warden".to_string());
        character.bio = vec!["Default agent hosted by the Warden runtime.".to_string()];
        character
    }

    pub fn with_id(mut self, id: AgentId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugins.push(plugin.into());
        self
    }

    pub fn agent_id(&self) -> AgentId {
        self.id.unwrap_or_else(|| AgentId::from_name(&self.name))
    }

    pub fn validate(&self) -> Result<(), CharacterError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(CharacterError::EmptyName);
        }
        if name.chars().count() > MAX_NAME_LEN {
            return Err(CharacterError::NameTooLong(MAX_NAME_LEN));
        }

        let mut seen = HashSet::new();
        for plugin in &self.plugins {
            let plugin = plugin.trim();
            if plugin.is_empty() {
                return Err(CharacterError::EmptyPluginName);
            }
            if !seen.insert(plugin) {
                return Err(CharacterError::DuplicatePlugin(plugin.to_string()));
            }
        }

        if let Some(value) = self.settings.get("secrets") {
            if !value.is_object() {
                return Err(CharacterError::InvalidSetting {
                    key: "secrets".to_string(),
                    reason: "must be an object".to_string(),
                });
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CharacterError {
    #[error("character name cannot be empty")]
    EmptyName,

    #[error("character name exceeds {0} characters")]
    NameTooLong(usize),

    #[error("plugin names cannot be empty")]
    EmptyPluginName,

    #[error("plugin '{0}' is listed more than once")]
    DuplicatePlugin(String),

    #[error("invalid setting '{key}': {reason}")]
    InvalidSetting { key: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Starting => "starting",
            AgentStatus::Running => "running",
            AgentStatus::Stopping => "stopping",
            AgentStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Read-only view of a live agent handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub agent_id: AgentId,
    pub name: String,
    pub status: AgentStatus,
    pub lease_id: Option<LeaseId>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Options for a batch of agent starts.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Applied to transient failures (pool exhaustion, connection errors).
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("agent {0} is already running")]
    AlreadyRunning(AgentId),

    #[error("agent {0} is not running")]
    NotRunning(AgentId),

    #[error("agent '{name}' failed to initialize: {reason}")]
    InitializationFailure { name: String, reason: String },
}

impl LifecycleError {
    /// Benign conditions are reported but do not count as failures.
    pub fn is_benign(&self) -> bool {
        matches!(self, LifecycleError::AlreadyRunning(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_is_stable_for_name() {
        assert_eq!(AgentId::from_name("atlas"), AgentId::from_name("atlas"));
        assert_ne!(AgentId::from_name("atlas"), AgentId::from_name("hermes"));
    }

    #[test]
    fn test_explicit_id_wins_over_name() {
        let id = AgentId::new();
        let character = Character::new("atlas").with_id(id);
        assert_eq!(character.agent_id(), id);
        assert_eq!(Character::new("atlas").agent_id(), AgentId::from_name("atlas"));
    }

    #[test]
    fn test_resolve_accepts_uuid_and_free_text() {
        let id = AgentId::new();
        assert_eq!(AgentId::resolve(&id.to_string()), id);
        assert_eq!(AgentId::resolve("test-agent-42"), AgentId::from_name("test-agent-42"));
    }

    #[test]
    fn test_validate_rejects_bad_characters() {
        assert_eq!(Character::new("  ").validate(), Err(CharacterError::EmptyName));
        assert_eq!(
            Character::new("atlas").with_plugin("").validate(),
            Err(CharacterError::EmptyPluginName)
        );
        assert!(matches!(
            Character::new("atlas")
                .with_plugin("sql")
                .with_plugin("sql")
                .validate(),
            Err(CharacterError::DuplicatePlugin(_))
        ));
        assert!(Character::new("atlas").with_plugin("sql").validate().is_ok());
    }

    #[test]
    fn test_character_deserializes_camel_case() {
        let json = r#"{"name":"atlas","plugins":["sql"],"settings":{"model":"small"}}"#;
        let character: Character = serde_json::from_str(json).unwrap();
        assert_eq!(character.name, "atlas");
        assert_eq!(character.plugins, vec!["sql".to_string()]);
        assert!(character.id.is_none());
    }
}
