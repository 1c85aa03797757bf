use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::stats::{DEFAULT_FLAP_WINDOW, DEFAULT_WINDOW, WindowSettings};

/// Cadence and concurrency of a monitoring run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub interval: Duration,
    pub timeout: Duration,
    /// Maximum number of probes in flight across all hosts.
    pub parallel: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(1),
            parallel: 64,
        }
    }
}

impl ScheduleConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.interval.is_zero() {
            return Err(EngineError::InvalidConfig("interval must be greater than zero".into()));
        }
        if self.timeout.is_zero() {
            return Err(EngineError::InvalidConfig("timeout must be greater than zero".into()));
        }
        if self.parallel == 0 {
            return Err(EngineError::InvalidConfig("parallel must be at least 1".into()));
        }
        Ok(())
    }
}

/// Settings read from `config.json` in the user's config directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub hosts: Vec<String>,
    pub interval_secs: f64,
    pub timeout_secs: f64,
    pub parallel: usize,
    pub window: usize,
    pub flap_window: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["1.1.1.1".to_string(), "8.8.8.8".to_string(), "example.com".to_string()],
            interval_secs: 5.0,
            timeout_secs: 1.0,
            parallel: 64,
            window: DEFAULT_WINDOW,
            flap_window: DEFAULT_FLAP_WINDOW,
        }
    }
}

impl AppConfig {
    pub fn get_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("PingMonitor").join("config.json"))
    }

    /// Loads the user config, falling back to defaults when it is missing or
    /// unreadable.
    pub fn load() -> Self {
        match Self::get_config_path() {
            Some(path) if path.exists() => Self::load_from_path(&path).unwrap_or_else(|e| {
                warn!("Ignoring config {}: {}", path.display(), e);
                AppConfig::default()
            }),
            _ => AppConfig::default(),
        }
    }

    pub fn load_from_path(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str::<AppConfig>(&content)?)
    }

    pub fn schedule(&self) -> Result<ScheduleConfig, EngineError> {
        let seconds = |name: &str, value: f64| {
            Duration::try_from_secs_f64(value)
                .map_err(|_| EngineError::InvalidConfig(format!("{name} must be a non-negative number of seconds")))
        };
        let schedule = ScheduleConfig {
            interval: seconds("interval_secs", self.interval_secs)?,
            timeout: seconds("timeout_secs", self.timeout_secs)?,
            parallel: self.parallel,
        };
        schedule.validate()?;
        Ok(schedule)
    }

    pub fn window_settings(&self) -> WindowSettings {
        WindowSettings {
            window: self.window,
            flap_window: self.flap_window,
        }
    }
}
