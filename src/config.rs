//! Manager configuration
//!
//! Loaded from TOML. Every field has a default, so an empty file (or no file)
//! yields a usable configuration. Durations are expressed in milliseconds.

use crate::error::ConfigError;
use crate::metric::{Category, Labels};
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Settings for the collector of one category
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct CategoryConfig {
    /// Whether `initialize()` should build a collector for this category
    pub enabled: bool,
    /// Registry name override; defaults to the category name
    pub name: Option<String>,
    /// Collector interval; falls back to the global interval
    pub interval_ms: Option<u64>,
    /// Labels stamped on every metric of this category
    pub labels: Labels,
    /// Collector-specific settings passed through to the factory untouched
    pub options: toml::Table,
}

impl CategoryConfig {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }
}

/// Top-level configuration of a [`Manager`](crate::manager::Manager)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ManagerConfig {
    /// Default collector interval for categories without their own
    pub global_interval_ms: u64,
    /// Labels merged into every category; a category's own key wins
    pub global_labels: Labels,
    /// Period of the flush loop that polls every enabled collector
    pub flush_interval_ms: u64,
    /// Upper bound on a single `collect()` call; defaults to the flush interval
    pub collect_timeout_ms: Option<u64>,
    /// How long `stop()` waits for background tasks before detaching them
    pub shutdown_timeout_ms: u64,
    /// Capacity of the metrics channel, in batches
    pub metrics_buffer_size: usize,
    /// Capacity of the error channel
    pub error_buffer_size: usize,

    pub system: CategoryConfig,
    pub application: CategoryConfig,
    pub database: CategoryConfig,
    pub business: CategoryConfig,
    pub cache: CategoryConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            global_interval_ms: 10_000,
            global_labels: Labels::new(),
            flush_interval_ms: 1_000,
            collect_timeout_ms: None,
            shutdown_timeout_ms: 5_000,
            metrics_buffer_size: 1_000,
            error_buffer_size: 100,
            system: CategoryConfig::enabled(),
            application: CategoryConfig::default(),
            database: CategoryConfig::default(),
            business: CategoryConfig::default(),
            cache: CategoryConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Load and validate a configuration file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ReadError` if the file cannot be read, `TomlError`
    /// if it is not valid TOML and `ValidationError` if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!("Reading configuration from {}", path.display());
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ManagerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every value is usable by the manager
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "flush_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.global_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "global_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.collect_timeout_ms == Some(0) {
            return Err(ConfigError::ValidationError(
                "collect_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.metrics_buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "metrics_buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.error_buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "error_buffer_size must be greater than zero".to_string(),
            ));
        }
        for category in Category::ALL {
            let section = self.category(category);
            if section.interval_ms == Some(0) {
                return Err(ConfigError::ValidationError(format!(
                    "{}.interval_ms must be greater than zero",
                    category
                )));
            }
            if matches!(section.name.as_deref(), Some(name) if name.trim().is_empty()) {
                return Err(ConfigError::ValidationError(format!(
                    "{}.name must not be empty",
                    category
                )));
            }
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn global_interval(&self) -> Duration {
        Duration::from_millis(self.global_interval_ms)
    }

    pub fn collect_timeout(&self) -> Duration {
        Duration::from_millis(self.collect_timeout_ms.unwrap_or(self.flush_interval_ms))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn category(&self, category: Category) -> &CategoryConfig {
        match category {
            Category::System => &self.system,
            Category::Application => &self.application,
            Category::Database => &self.database,
            Category::Business => &self.business,
            Category::Cache => &self.cache,
        }
    }

    pub fn category_mut(&mut self, category: Category) -> &mut CategoryConfig {
        match category {
            Category::System => &mut self.system,
            Category::Application => &mut self.application,
            Category::Database => &mut self.database,
            Category::Business => &mut self.business,
            Category::Cache => &mut self.cache,
        }
    }

    /// Collector interval for a category, falling back to the global interval
    pub fn interval_for(&self, category: Category) -> Duration {
        self.category(category)
            .interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.global_interval())
    }

    /// Registry name of the collector built for a category
    pub fn name_for(&self, category: Category) -> String {
        self.category(category)
            .name
            .clone()
            .unwrap_or_else(|| category.as_str().to_string())
    }

    /// Copy global labels into every category section without overwriting
    /// keys the section already defines
    pub fn merge_global_labels(&mut self) {
        if self.global_labels.is_empty() {
            return;
        }
        let global = self.global_labels.clone();
        for category in Category::ALL {
            let labels = &mut self.category_mut(category).labels;
            for (key, value) in &global {
                labels
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
        }
    }
}
