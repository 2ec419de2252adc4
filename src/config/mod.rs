//! # Configuration Management Module
//!
//! Loads and validates the TOML configuration for the claims service: where
//! the store lives, how logging behaves, and the per-world rules the
//! permission resolver consults.
//!
//! ## Configuration Structure
//!
//! - [`StorageConfig`] - Data persistence settings
//! - [`LoggingConfig`] - Logging and debugging settings
//! - [`WorldRules`] - Overlay distance, material allow-lists, spawner policy, cell price
//!
//! ## Configuration File Format
//!
//! ```toml
//! [storage]
//! data_dir = "./data"
//!
//! [logging]
//! level = "info"
//! file = "townward.log"
//!
//! [rules]
//! overlay_distance = 2
//! wild_place = ["torch", "ladder"]
//! chunk_price = 500
//!
//! [worlds.nether]
//! deny_spawner_spawns = true
//! ```
//!
//! A `[worlds.<name>]` table replaces the default `[rules]` wholesale for that
//! world; fields it leaves out take their built-in defaults.

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tokio::fs;

use crate::claims::types::DEFAULT_CELL_SIZE;

/// Largest overlay distance accepted; beyond this a single edit check would
/// scan an unreasonable number of columns.
pub const MAX_OVERLAY_DISTANCE: u32 = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
    /// Optional override for the claims sled database; defaults to `<data_dir>/claims`.
    #[serde(default)]
    pub db_path: Option<String>,
}

impl StorageConfig {
    pub fn claims_db_path(&self) -> String {
        match &self.db_path {
            Some(path) => path.clone(),
            None => format!("{}/claims", self.data_dir.trim_end_matches('/')),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

/// Rules the permission resolver applies inside one world.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorldRules {
    /// Edits within this many blocks of a residence are judged by that residence.
    pub overlay_distance: u32,
    /// Materials anyone may place inside a town.
    pub town_place: BTreeSet<String>,
    /// Materials anyone may break inside a town.
    pub town_destroy: BTreeSet<String>,
    /// Materials anyone may place in the wildness.
    pub wild_place: BTreeSet<String>,
    /// Materials anyone may break in the wildness.
    pub wild_destroy: BTreeSet<String>,
    /// Refuse creatures coming out of spawner blocks.
    pub deny_spawner_spawns: bool,
    /// Price of one grid cell in minor currency units.
    pub chunk_price: i64,
    /// Edge length of a grid cell in blocks.
    pub cell_size: i32,
}

impl Default for WorldRules {
    fn default() -> Self {
        Self {
            overlay_distance: 0,
            town_place: BTreeSet::new(),
            town_destroy: BTreeSet::new(),
            wild_place: BTreeSet::new(),
            wild_destroy: BTreeSet::new(),
            deny_spawner_spawns: false,
            chunk_price: 100,
            cell_size: DEFAULT_CELL_SIZE,
        }
    }
}

impl WorldRules {
    fn validate(&self, label: &str) -> Result<()> {
        if self.overlay_distance > MAX_OVERLAY_DISTANCE {
            bail!(
                "{}: overlay_distance {} exceeds {}",
                label,
                self.overlay_distance,
                MAX_OVERLAY_DISTANCE
            );
        }
        if self.chunk_price < 0 {
            bail!("{}: chunk_price must not be negative", label);
        }
        if self.cell_size <= 0 {
            bail!("{}: cell_size must be positive", label);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub rules: WorldRules,
    #[serde(default)]
    pub worlds: HashMap<String, WorldRules>,
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config = Self::from_toml(&content)
            .map_err(|e| anyhow!("Failed to load config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Parse and validate configuration text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.rules.validate("rules")?;
        for (world, rules) in &self.worlds {
            rules.validate(&format!("worlds.{}", world))?;
            if rules.cell_size != self.rules.cell_size {
                bail!(
                    "worlds.{}: cell_size must match the default rules ({})",
                    world,
                    self.rules.cell_size
                );
            }
        }
        Ok(())
    }

    /// Rules for `world`: its override if present, else the defaults.
    pub fn rules_for(&self, world: &str) -> &WorldRules {
        self.worlds.get(world).unwrap_or(&self.rules)
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut rules = WorldRules {
            overlay_distance: 2,
            ..WorldRules::default()
        };
        rules.wild_place.insert("torch".to_string());
        rules.wild_destroy.insert("torch".to_string());
        rules.town_place.insert("torch".to_string());

        Config {
            storage: StorageConfig {
                data_dir: "./data".to_string(),
                db_path: None,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("townward.log".to_string()),
            },
            rules,
            worlds: HashMap::new(),
        }
    }
}
