use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::models::{CommentConfig, QuantitySpec, ServiceBounds};

/// Top-level settings, read from a YAML file.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Settings {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub feed_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub dispatch_timeout_secs: u64,
    #[serde(default = "default_generation_timeout")]
    pub generation_timeout_secs: u64,
    #[serde(default)]
    pub executor: EndpointConfig,
    pub generator: Option<EndpointConfig>,
    #[serde(default)]
    pub comment_fill: CommentFill,
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

fn default_database_url() -> String {
    "sqlite:triggerrss.db".to_string()
}

fn default_poll_interval() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    30
}

fn default_generation_timeout() -> u64 {
    60
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            poll_interval_secs: default_poll_interval(),
            feed_timeout_secs: default_request_timeout(),
            dispatch_timeout_secs: default_request_timeout(),
            generation_timeout_secs: default_generation_timeout(),
            executor: EndpointConfig::default(),
            generator: None,
            comment_fill: CommentFill::default(),
            log: LogSettings::default(),
            targets: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct EndpointConfig {
    pub endpoint: String,
    pub api_key: String,
}

/// What to do when the generator returns fewer comments than requested.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommentFill {
    /// Top up from the manual pool, then the generic set.
    #[default]
    Pad,
    /// Submit whatever the generator returned.
    AsGenerated,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LogSettings {
    #[serde(default = "default_console_level")]
    pub console_level: String,
    #[serde(default = "default_file_level")]
    pub file_level: String,
    pub file: Option<String>,
}

fn default_console_level() -> String {
    "info".to_string()
}

fn default_file_level() -> String {
    "debug".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            console_level: default_console_level(),
            file_level: default_file_level(),
            file: None,
        }
    }
}

/// A monitored feed as configured by the operator.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TargetConfig {
    pub name: String,
    pub feed_url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ActionConfig {
    pub service_id: i64,
    #[serde(default)]
    pub service_name: String,
    pub quantity: QuantitySpec,
    #[serde(default)]
    pub bounds: ServiceBounds,
    pub comments: Option<CommentConfig>,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

impl Settings {
    /// Load and validate settings from a YAML file.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        info!("Loading settings from YAML file: {}", path);

        let contents = fs::read_to_string(Path::new(path)).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;

        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let settings: Settings = serde_yaml::from_str(contents)?;
        settings.validate()?;
        debug!(
            "Settings loaded: {} targets, poll interval {}s",
            settings.targets.len(),
            settings.poll_interval_secs
        );
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (field, secs) in [
            ("feed_timeout_secs", self.feed_timeout_secs),
            ("dispatch_timeout_secs", self.dispatch_timeout_secs),
            ("generation_timeout_secs", self.generation_timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::ZeroTimeout(field));
            }
        }

        let mut names = HashSet::new();

        for target in &self.targets {
            if !names.insert(target.name.as_str()) {
                return Err(ConfigError::DuplicateTarget(target.name.clone()));
            }

            for action in &target.actions {
                action.quantity.validate(action.bounds).map_err(|reason| ConfigError::InvalidAction {
                    target: target.name.clone(),
                    service_id: action.service_id,
                    reason,
                })?;
            }
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn feed_timeout(&self) -> Duration {
        Duration::from_secs(self.feed_timeout_secs)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }
}
