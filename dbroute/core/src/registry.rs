//! Entity Registry
//!
//! Per logical entity (a table or model type) the registry stores the master
//! connection, the ordered slave list, the slave-read forcing flag, and free
//! form options. Entries are written at configuration time and read on every
//! routing call, so the map sits behind a reader/writer lock and hands out
//! `Arc` snapshots.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionDescriptor;
use crate::error::ConfigError;
use crate::routing::selection;

/// Routing configuration of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityConfig {
    /// Connection used for writes and consistent reads
    pub master: ConnectionDescriptor,
    /// Replicas, in configuration order
    #[serde(default)]
    pub slaves: Vec<ConnectionDescriptor>,
    /// Route implicit reads to slaves
    #[serde(default)]
    pub force_slave_reads: bool,
    /// Options not interpreted by the router
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
}

impl EntityConfig {
    /// Configuration with only a master
    pub fn new(master: impl Into<ConnectionDescriptor>) -> Self {
        Self {
            master: master.into(),
            slaves: Vec::new(),
            force_slave_reads: false,
            options: HashMap::new(),
        }
    }

    /// Set the slave list
    #[must_use]
    pub fn with_slaves<I, D>(mut self, slaves: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<ConnectionDescriptor>,
    {
        self.slaves = slaves.into_iter().map(Into::into).collect();
        self
    }

    /// Enable or disable implicit slave reads
    #[must_use]
    pub fn with_force_slave_reads(mut self, force: bool) -> Self {
        self.force_slave_reads = force;
        self
    }

    /// Attach an option
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Check that slave connection names are unique
    pub fn validate(&self, entity: &str) -> Result<(), ConfigError> {
        let mut seen = HashSet::with_capacity(self.slaves.len());
        for slave in &self.slaves {
            if !seen.insert(slave.name()) {
                return Err(ConfigError::DuplicateSlave {
                    entity: entity.to_string(),
                    name: slave.name().to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Registry of entity configurations
#[derive(Debug, Default)]
pub struct EntityRegistry {
    entities: RwLock<HashMap<String, Arc<EntityConfig>>>,
}

impl EntityRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the configuration of `entity`
    ///
    /// Fails immediately when two slaves share a connection name; the
    /// previous configuration is kept in that case.
    pub fn configure(&self, entity: &str, config: EntityConfig) -> Result<(), ConfigError> {
        config.validate(entity)?;
        tracing::info!(
            entity = entity,
            master = %config.master,
            slaves = config.slaves.len(),
            force_slave_reads = config.force_slave_reads,
            "Entity configured"
        );
        self.entities
            .write()
            .insert(entity.to_string(), Arc::new(config));
        Ok(())
    }

    /// Remove the configuration of `entity`
    pub fn remove(&self, entity: &str) -> Option<Arc<EntityConfig>> {
        self.entities.write().remove(entity)
    }

    /// Configuration snapshot of `entity`
    #[must_use]
    pub fn get(&self, entity: &str) -> Option<Arc<EntityConfig>> {
        self.entities.read().get(entity).cloned()
    }

    /// Master connection of `entity`
    #[must_use]
    pub fn master(&self, entity: &str) -> Option<ConnectionDescriptor> {
        self.entities.read().get(entity).map(|c| c.master.clone())
    }

    /// Slaves of `entity`, empty when unconfigured
    #[must_use]
    pub fn slaves(&self, entity: &str) -> Vec<ConnectionDescriptor> {
        self.entities
            .read()
            .get(entity)
            .map(|c| c.slaves.clone())
            .unwrap_or_default()
    }

    /// Options of `entity`, empty when unconfigured
    #[must_use]
    pub fn options(&self, entity: &str) -> HashMap<String, serde_json::Value> {
        self.entities
            .read()
            .get(entity)
            .map(|c| c.options.clone())
            .unwrap_or_default()
    }

    /// Configured slave-read forcing of `entity`
    #[must_use]
    pub fn force_slave_reads(&self, entity: &str) -> bool {
        self.entities
            .read()
            .get(entity)
            .is_some_and(|c| c.force_slave_reads)
    }

    /// Any slave of `entity`, ignoring failure history
    #[must_use]
    pub fn random_slave(&self, entity: &str) -> Option<ConnectionDescriptor> {
        let entities = self.entities.read();
        selection::pick_random(&entities.get(entity)?.slaves).cloned()
    }

    /// Names of all configured entities
    #[must_use]
    pub fn entities(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entities.read().keys().cloned().collect();
        names.sort();
        names
    }
}
