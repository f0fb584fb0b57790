use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::aggregate::TieBreak;
use crate::confidence::ConfidenceWeights;
use crate::error::ConfigError;
use crate::scanner::ScanLimits;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageLayout {
    #[serde(default)]
    pub external_data_root: Option<PathBuf>,
    #[serde(default)]
    pub obb_root: Option<PathBuf>,
}

impl StorageLayout {
    pub fn external_data_dir(&self, key: &str) -> Option<PathBuf> {
        self.external_data_root.as_ref().map(|root| root.join(key))
    }

    pub fn obb_dir(&self, key: &str) -> Option<PathBuf> {
        self.obb_root.as_ref().map(|root| root.join(key))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default)]
    pub scan: ScanLimits,
    #[serde(default)]
    pub weights: ConfidenceWeights,
    #[serde(default)]
    pub media_tie_break: TieBreak,
    #[serde(default)]
    pub layout: StorageLayout,
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_cache_capacity() -> usize {
    100
}

fn default_workers() -> usize {
    2
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_capacity: default_cache_capacity(),
            workers: default_workers(),
            default_timeout_ms: default_timeout_ms(),
            scan: ScanLimits::default(),
            weights: ConfidenceWeights::default(),
            media_tie_break: TieBreak::default(),
            layout: StorageLayout::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: EngineConfig = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let counts = [
            ("cache_capacity", self.cache_capacity as u64),
            ("workers", self.workers as u64),
            ("default_timeout_ms", self.default_timeout_ms),
            ("scan.max_files", self.scan.max_files),
        ];
        if let Some(&(field, _)) = counts.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero { field });
        }

        for (field, value) in self.weights.fields() {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfRange { field, value });
            }
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}
