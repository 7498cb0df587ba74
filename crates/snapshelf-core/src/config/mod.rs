//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::storage::FileStore;
use crate::sync::chunker::{HEADER_OVERHEAD, MAX_FRAGMENT_TOTAL, MIN_FRAGMENT_DATA};

/// Snapshelf configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Characters per visual code, header included
    pub max_fragment_size: usize,
    /// Most codes one export may produce
    pub max_fragments: usize,
    /// DEFLATE level, 0-9
    pub compression_level: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Name given to a newly created device identity
    pub default_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: Option<PathBuf>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_fragment_size: 1000,
            max_fragments: 12,
            compression_level: 9,
        }
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("SNAPSHELF_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("snapshelf")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or return defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config = Self::from_toml(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Parse and validate TOML text
    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let min_size = HEADER_OVERHEAD + MIN_FRAGMENT_DATA;
        if self.transfer.max_fragment_size < min_size {
            return Err(anyhow!(
                "transfer.max_fragment_size must be at least {} (chunk header plus data)",
                min_size
            ));
        }
        if self.transfer.max_fragments == 0 || self.transfer.max_fragments > MAX_FRAGMENT_TOTAL {
            return Err(anyhow!(
                "transfer.max_fragments must be between 1 and {}",
                MAX_FRAGMENT_TOTAL
            ));
        }
        if self.transfer.compression_level > 9 {
            return Err(anyhow!("transfer.compression_level must be between 0 and 9"));
        }
        if let Some(name) = &self.device.default_name {
            if name.trim().is_empty() {
                return Err(anyhow!("device.default_name cannot be empty"));
            }
        }
        Ok(())
    }

    /// Directory for device identity and pending import sessions
    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.storage.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(FileStore::default_dir()?),
        }
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "transfer.max_fragment_size" => Ok(self.transfer.max_fragment_size.to_string()),
            "transfer.max_fragments" => Ok(self.transfer.max_fragments.to_string()),
            "transfer.compression_level" => Ok(self.transfer.compression_level.to_string()),
            "device.default_name" => Ok(self
                .device
                .default_name
                .clone()
                .unwrap_or_else(|| "(host name)".to_string())),
            "storage.data_dir" => Ok(match &self.storage.data_dir {
                Some(dir) => dir.display().to_string(),
                None => "(platform default)".to_string(),
            }),
            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `snapshelf config list` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut updated = self.clone();
        match key {
            "transfer.max_fragment_size" => {
                updated.transfer.max_fragment_size = value
                    .parse()
                    .with_context(|| format!("Invalid max_fragment_size value: {}", value))?;
            }
            "transfer.max_fragments" => {
                updated.transfer.max_fragments = value
                    .parse()
                    .with_context(|| format!("Invalid max_fragments value: {}", value))?;
            }
            "transfer.compression_level" => {
                updated.transfer.compression_level = value
                    .parse()
                    .with_context(|| format!("Invalid compression_level value: {}", value))?;
            }
            "device.default_name" => {
                updated.device.default_name = Some(value.trim().to_string());
            }
            "storage.data_dir" => {
                updated.storage.data_dir = Some(PathBuf::from(value));
            }
            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `snapshelf config list` to see available keys.",
                    key
                ));
            }
        }
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        let keys = [
            "transfer.max_fragment_size",
            "transfer.max_fragments",
            "transfer.compression_level",
            "device.default_name",
            "storage.data_dir",
        ];

        keys.into_iter()
            .map(|key| {
                let value = self.get(key)?;
                Ok((key.to_string(), value))
            })
            .collect()
    }

    /// Remove the config file so defaults apply again
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}
