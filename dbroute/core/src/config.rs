//! Routing Configuration
//!
//! Router-wide settings plus the per-entity master/slave layout, loaded from
//! a TOML file and adjusted by environment variables.
//!
//! ```toml
//! [router]
//! eligibility_window_secs = 15
//! connections_should_exist = false
//! force_slave_reads = false
//!
//! [entities.Order]
//! master = "orders_master"
//! slaves = ["orders_s1", { name = "orders_s2", target = "postgres://s2/orders" }]
//! force_slave_reads = true
//!
//! [entities.Order.options]
//! shard = 3
//! ```
//!
//! # Environment Variables
//!
//! - `DBROUTE_CONFIG`: path of the routing file
//! - `DBROUTE_ELIGIBILITY_WINDOW_SECS`: seconds a failed slave is skipped
//! - `DBROUTE_CONNECTIONS_SHOULD_EXIST`: only route to established connections
//! - `DBROUTE_FORCE_SLAVE_READS`: process-wide slave-read forcing default

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionDescriptor;
use crate::error::ConfigError;
use crate::failures::DEFAULT_ELIGIBILITY_WINDOW_SECS;
use crate::registry::EntityConfig;

// ============================================================================
// Router settings
// ============================================================================

/// Router-wide settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Seconds a failed slave stays out of rotation (default: 15)
    pub eligibility_window_secs: u64,
    /// Ask the factory for already-established connections only (default: false)
    pub connections_should_exist: bool,
    /// Process-wide slave-read forcing default (default: false)
    pub force_slave_reads: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            eligibility_window_secs: DEFAULT_ELIGIBILITY_WINDOW_SECS,
            connections_should_exist: false,
            force_slave_reads: false,
        }
    }
}

fn env_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

impl RouterConfig {
    /// Defaults overridden by environment variables
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply environment variable overrides to `self`
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        Self {
            eligibility_window_secs: std::env::var("DBROUTE_ELIGIBILITY_WINDOW_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(self.eligibility_window_secs),
            connections_should_exist: std::env::var("DBROUTE_CONNECTIONS_SHOULD_EXIST")
                .map(|v| env_flag(&v))
                .unwrap_or(self.connections_should_exist),
            force_slave_reads: std::env::var("DBROUTE_FORCE_SLAVE_READS")
                .map(|v| env_flag(&v))
                .unwrap_or(self.force_slave_reads),
        }
    }
}

// ============================================================================
// Routing file
// ============================================================================

/// A connection written either as a bare name or as name plus target
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DescriptorSpec {
    /// Name doubling as factory target
    Name(String),
    /// Name with a distinct factory target
    Full {
        /// Connection name
        name: String,
        /// Factory target
        target: String,
    },
}

impl From<&DescriptorSpec> for ConnectionDescriptor {
    fn from(descriptor: &DescriptorSpec) -> Self {
        match descriptor {
            DescriptorSpec::Name(name) => ConnectionDescriptor::new(name.as_str()),
            DescriptorSpec::Full { name, target } => {
                ConnectionDescriptor::with_target(name.as_str(), target.as_str())
            }
        }
    }
}

/// One `[entities.<name>]` section
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntitySection {
    /// Master connection
    pub master: Option<DescriptorSpec>,
    /// Slave connections
    #[serde(default)]
    pub slaves: Vec<DescriptorSpec>,
    /// Implicit slave reads for this entity
    #[serde(default)]
    pub force_slave_reads: bool,
    /// Options passed through untouched
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
}

impl EntitySection {
    /// Convert into a validated [`EntityConfig`]
    pub fn to_entity_config(&self, entity: &str) -> Result<EntityConfig, ConfigError> {
        let master = self.master.as_ref().ok_or_else(|| ConfigError::MissingMaster {
            entity: entity.to_string(),
        })?;
        let config = EntityConfig {
            master: master.into(),
            slaves: self.slaves.iter().map(ConnectionDescriptor::from).collect(),
            force_slave_reads: self.force_slave_reads,
            options: self.options.clone(),
        };
        config.validate(entity)?;
        Ok(config)
    }
}

/// Parsed routing file
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingFile {
    /// Router-wide settings
    #[serde(default)]
    pub router: RouterConfig,
    /// Entity sections, ordered by name
    #[serde(default)]
    pub entities: BTreeMap<String, EntitySection>,
}

impl RoutingFile {
    /// Parse TOML text; `origin` is only used in error messages
    pub fn parse(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let file: Self = toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })?;
        file.entity_configs()?;
        Ok(file)
    }

    /// Every entity converted and validated
    pub fn entity_configs(&self) -> Result<Vec<(String, EntityConfig)>, ConfigError> {
        self.entities
            .iter()
            .map(|(name, section)| Ok((name.clone(), section.to_entity_config(name)?)))
            .collect()
    }
}

/// Where the configuration came from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    /// No file found
    Defaults,
    /// Loaded from a file
    File(PathBuf),
    /// Loaded from the file named by `DBROUTE_CONFIG`
    Environment(PathBuf),
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Defaults => f.write_str("defaults"),
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Environment(path) => write!(f, "{} (DBROUTE_CONFIG)", path.display()),
        }
    }
}

/// `$XDG_CONFIG_HOME/dbroute/routing.toml`
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("dbroute").join("routing.toml"))
}

/// Load and validate a routing file
pub fn load_config_from_path(path: &Path) -> Result<RoutingFile, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    RoutingFile::parse(&text, path)
}

/// Load from `DBROUTE_CONFIG` or the default path, then apply env overrides
///
/// A missing default file yields the defaults; a missing file named by
/// `DBROUTE_CONFIG` is an error.
pub fn load_config() -> Result<(RoutingFile, ConfigSource), ConfigError> {
    let (mut file, source) = match std::env::var("DBROUTE_CONFIG") {
        Ok(path) => {
            let path = PathBuf::from(path);
            (load_config_from_path(&path)?, ConfigSource::Environment(path))
        }
        Err(_) => match default_config_path().filter(|p| p.exists()) {
            Some(path) => (load_config_from_path(&path)?, ConfigSource::File(path)),
            None => (RoutingFile::default(), ConfigSource::Defaults),
        },
    };
    file.router = file.router.with_env_overrides();
    tracing::debug!(source = %source, entities = file.entities.len(), "Routing configuration loaded");
    Ok((file, source))
}
