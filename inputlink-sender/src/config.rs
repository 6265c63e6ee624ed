//! Sender process configuration.

use std::path::Path;

use inputlink_core::config::ControllerConfig;
use inputlink_core::{LinkError, SenderConfig};
use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderAppConfig {
    /// Link, capture and controller settings.
    pub sender: SenderConfig,
    /// Hardware source settings.
    pub hardware: HardwareConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Hardware source settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Seconds per full stick revolution of the synthetic pads.
    pub synthetic_period_secs: f32,
    /// Controller ids the synthetic source reports as unplugged.
    pub unplugged: Vec<String>,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Seconds between statistics lines (0 = never).
    pub stats_interval_secs: u64,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for SenderAppConfig {
    fn default() -> Self {
        Self {
            sender: SenderConfig {
                controllers: vec![ControllerConfig::new("synthetic-0", 1)],
                ..Default::default()
            },
            hardware: HardwareConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            synthetic_period_secs: 4.0,
            unplugged: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            stats_interval_secs: 30,
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl SenderAppConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Parse and validate a TOML document.
    pub fn parse(text: &str) -> Result<Self, LinkError> {
        let config: Self = toml::from_str(text).map_err(|e| LinkError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        self.sender.validate()?;
        if !self.hardware.synthetic_period_secs.is_finite()
            || self.hardware.synthetic_period_secs <= 0.0
        {
            return Err(LinkError::Config(
                "synthetic_period_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Render the default configuration as TOML.
    pub fn default_toml() -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(&Self::default())
    }
}

// ── Tests ────────────────────────────────────────────────────────
