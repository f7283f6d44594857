//! Configuration loading and typed config structures.
//!
//! A model can be described in YAML (by default `tessera-config.yaml`):
//!
//! ```yaml
//! model:
//!   name: shmoo
//!   seed: 42
//!   stages: 2
//!   order: random
//!   stop_after: 200
//! primitives:
//!   - name: agent
//!     count: 50
//!     breeds:
//!       - name: hawk
//!       - name: dove
//! goods:
//!   - name: shmoo
//!     endowment: 10
//! grid:
//!   width: 20
//!   height: 20
//!   neighborhood: eight
//!   wrap: true
//! ```
//!
//! Every field has a default. `TESSERA_SEED` and `TESSERA_STOP_AFTER`
//! override the file.

use std::path::Path;

use serde::Deserialize;
use tessera_types::{ExecutionOrder, Stage};
use tracing::debug;

use crate::agents::Breed;
use crate::spatial::GridConfig;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// An environment override could not be parsed.
    #[error("invalid value {value:?} for {var}: {reason}")]
    Override {
        /// The variable.
        var: &'static str,
        /// Its raw value.
        value: String,
        /// Parse failure.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SimulationConfig {
    /// Run-level settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Entity categories and their initial populations.
    #[serde(default)]
    pub primitives: Vec<PrimitiveConfig>,

    /// Goods held by entities.
    #[serde(default)]
    pub goods: Vec<GoodConfig>,

    /// Optional spatial grid.
    #[serde(default)]
    pub grid: Option<GridConfig>,
}

impl SimulationConfig {
    /// Load configuration from a YAML file, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if it is not valid YAML, or
    /// [`ConfigError::Override`] for an unparsable override.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.apply_env_overrides()?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Parse configuration from a YAML string. No overrides are applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yml::from_str(yaml)?)
    }

    /// Apply `TESSERA_SEED` and `TESSERA_STOP_AFTER` from the process
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Override`] for an unparsable value.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// `TESSERA_STOP_AFTER` accepts a period count or `off`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Override`] for an unparsable value.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("TESSERA_SEED") {
            let seed = value.trim().parse().map_err(|err: std::num::ParseIntError| {
                ConfigError::Override {
                    var: "TESSERA_SEED",
                    value: value.clone(),
                    reason: err.to_string(),
                }
            })?;
            self.model.seed = Some(seed);
        }
        if let Some(value) = lookup("TESSERA_STOP_AFTER") {
            self.model.stop_after = if value.trim().eq_ignore_ascii_case("off") {
                None
            } else {
                Some(value.trim().parse().map_err(|err: std::num::ParseIntError| {
                    ConfigError::Override {
                        var: "TESSERA_STOP_AFTER",
                        value: value.clone(),
                        reason: err.to_string(),
                    }
                })?)
            };
        }
        Ok(())
    }
}

/// Run-level settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelConfig {
    /// Model name, used in logs and status snapshots.
    #[serde(default = "default_name")]
    pub name: String,

    /// Random seed. Absent means OS entropy.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Stages per period.
    #[serde(default = "default_stages")]
    pub stages: Stage,

    /// Entity iteration order.
    #[serde(default)]
    pub order: ExecutionOrder,

    /// Stop once this many periods have run. `null` runs until stopped.
    #[serde(default = "default_stop_after")]
    pub stop_after: Option<u64>,

    /// Observer notification interval, in periods.
    #[serde(default = "default_refresh")]
    pub refresh: u64,

    /// Series export written at termination.
    #[serde(default)]
    pub csv: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            seed: None,
            stages: default_stages(),
            order: ExecutionOrder::default(),
            stop_after: default_stop_after(),
            refresh: default_refresh(),
            csv: None,
        }
    }
}

/// A primitive with its initial population.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PrimitiveConfig {
    /// Primitive name.
    pub name: String,

    /// Initial population.
    #[serde(default)]
    pub count: u64,

    /// Stepping priority.
    #[serde(default)]
    pub priority: i32,

    /// Upper bound of the population slider. Defaults to the larger of
    /// 100 and `count`.
    #[serde(default)]
    pub max: Option<u64>,

    /// Breeds. A primitive without breeds gets one named after itself.
    #[serde(default)]
    pub breeds: Vec<Breed>,
}

/// A good with its endowment.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GoodConfig {
    /// Good name.
    pub name: String,

    /// Starting stock of every new entity.
    #[serde(default)]
    pub endowment: f64,

    /// Whether this is the money good.
    #[serde(default)]
    pub money: bool,
}

fn default_name() -> String {
    "tessera".to_owned()
}

const fn default_stages() -> Stage {
    1
}

#[allow(clippy::unnecessary_wraps)]
const fn default_stop_after() -> Option<u64> {
    Some(100)
}

const fn default_refresh() -> u64 {
    1
}
