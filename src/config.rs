//! Configuration file
//!
//! `config.yml` is read once at startup. Every section has defaults, so a
//! missing file runs the ledger with a warning limit of 3 and no punishment.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::CONSOLE_TARGET;
use crate::ledger::{EscalationPolicy, MAX_TTL_SECS, PunishmentKind, SchedulerSettings, parse_duration};
use crate::messages::{Messages, PunishmentMessages};
use crate::notify::validate_url;

/// Configuration layout this build understands
pub const CONFIG_VERSION: u32 = 1;
pub const DEFAULT_CONFIG_FILE: &str = "config.yml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Unsupported config_version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Invalid configuration value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarningSettings {
    /// Active warnings that trigger the punishment
    pub limit: u64,
    /// Seconds between the decision and the punishment
    pub delay: i64,
    /// Count cache TTL in seconds, 0 keeps entries until invalidated
    pub cache_ttl: u64,
    /// Seconds between expiration sweeps
    pub sweep_interval: u64,
}

impl Default for WarningSettings {
    fn default() -> Self {
        Self {
            limit: 3,
            delay: 0,
            cache_ttl: crate::ledger::DEFAULT_TTL_SECS,
            sweep_interval: crate::ledger::DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PunishmentSettings {
    #[serde(rename = "type")]
    pub kind: PunishmentKind,
    pub messages: PunishmentMessages,
    /// Tempban window as a duration string such as `1d` or `12h30m`
    pub tempban_duration: String,
}

impl Default for PunishmentSettings {
    fn default() -> Self {
        Self {
            kind: PunishmentKind::None,
            messages: PunishmentMessages::default(),
            tempban_duration: "1d".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordSettings {
    pub enabled: bool,
    pub webhook_url: String,
    /// Directory holding `<kind>_event.json` payload templates
    pub templates_dir: PathBuf,
}

impl Default for DiscordSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: String::new(),
            templates_dir: PathBuf::from("webhooks"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub path: PathBuf,
    /// JSON file from older installs, imported once if present
    pub legacy_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/warnings.yml"),
            legacy_path: PathBuf::from("warnings.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Missing means a pre-versioned file, which is rejected
    #[serde(default)]
    pub config_version: u32,
    #[serde(default)]
    pub warning: WarningSettings,
    #[serde(default)]
    pub punishment: PunishmentSettings,
    #[serde(default)]
    pub messages: Messages,
    #[serde(default)]
    pub discord: DiscordSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION,
            warning: WarningSettings::default(),
            punishment: PunishmentSettings::default(),
            messages: Messages::default(),
            discord: DiscordSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

impl LedgerConfig {
    /// Load and validate the configuration file, using defaults if it is missing
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, does not parse, or fails validation.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(target: CONSOLE_TARGET, "No configuration at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let config = Self::from_yaml(&content)?;
        info!(target: CONSOLE_TARGET, "Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Parse and validate configuration text
    ///
    /// # Errors
    /// Returns an error if the text does not parse or fails validation.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns the first rule the configuration breaks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.config_version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion {
                found: self.config_version,
                expected: CONFIG_VERSION,
            });
        }

        let warning = &self.warning;
        if warning.limit == 0 {
            return Err(ConfigError::invalid("warning.limit", "must be greater than 0"));
        }
        if warning.delay < 0 {
            return Err(ConfigError::invalid("warning.delay", "must not be negative"));
        }
        if warning.cache_ttl > MAX_TTL_SECS {
            return Err(ConfigError::invalid(
                "warning.cache_ttl",
                format!("must be at most {MAX_TTL_SECS} seconds"),
            ));
        }
        if warning.sweep_interval == 0 {
            return Err(ConfigError::invalid("warning.sweep_interval", "must be greater than 0"));
        }

        if self.punishment.kind != PunishmentKind::None {
            let missing = self.punishment.messages.missing();
            if !missing.is_empty() {
                let names: Vec<String> = missing.iter().map(ToString::to_string).collect();
                return Err(ConfigError::invalid(
                    "punishment.messages",
                    format!("missing message for {}", names.join(", ")),
                ));
            }
        }
        self.tempban_window()?;

        if self.discord.enabled {
            validate_url(&self.discord.webhook_url)
                .map_err(|e| ConfigError::invalid("discord.webhook_url", e.to_string()))?;
        }
        Ok(())
    }

    /// Tempban window parsed from `punishment.tempban_duration`
    ///
    /// # Errors
    /// Returns an error for an unparseable or zero duration.
    pub fn tempban_window(&self) -> Result<chrono::Duration, ConfigError> {
        let raw = &self.punishment.tempban_duration;
        match parse_duration(raw) {
            Ok(Some(window)) => Ok(window),
            Ok(None) => Err(ConfigError::invalid("punishment.tempban_duration", "must be longer than zero")),
            Err(e) => Err(ConfigError::invalid("punishment.tempban_duration", e.to_string())),
        }
    }

    #[must_use]
    pub fn escalation_policy(&self) -> EscalationPolicy {
        EscalationPolicy {
            limit: self.warning.limit,
            kind: self.punishment.kind,
        }
    }

    /// # Errors
    /// Returns an error if the tempban window is invalid.
    pub fn scheduler_settings(&self) -> Result<SchedulerSettings, ConfigError> {
        Ok(SchedulerSettings {
            delay_secs: self.warning.delay,
            tempban_duration: self.tempban_window()?,
            messages: self.messages.clone(),
            punishment_messages: self.punishment.messages.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
config_version: 1
warning:
  limit: 5
  delay: 10
  cache_ttl: 60
punishment:
  type: ban-ip
  tempban_duration: 12h
messages:
  warned: "Warned by {source}: {reason}"
discord:
  enabled: true
  webhook_url: https://discord.com/api/webhooks/1/abc
"#;

    #[test]
    fn test_parse_sample() {
        let config = LedgerConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.warning.limit, 5);
        assert_eq!(config.warning.sweep_interval, 180);
        assert_eq!(config.punishment.kind, PunishmentKind::BanIp);
        assert_eq!(config.messages.warned, "Warned by {source}: {reason}");
        assert_eq!(config.discord.templates_dir, PathBuf::from("webhooks"));

        let policy = config.escalation_policy();
        assert_eq!(policy.limit, 5);
        let settings = config.scheduler_settings().unwrap();
        assert_eq!(settings.delay_secs, 10);
        assert_eq!(settings.tempban_duration, chrono::Duration::hours(12));
    }

    #[test]
    fn test_version_is_required() {
        let err = LedgerConfig::from_yaml("warning:\n  limit: 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion { found: 0, expected: 1 }));
        let err = LedgerConfig::from_yaml("config_version: 2\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion { found: 2, .. }));
    }

    #[test]
    fn test_rejects_bad_values() {
        let cases = [
            ("config_version: 1\nwarning:\n  limit: 0\n", "warning.limit"),
            ("config_version: 1\nwarning:\n  delay: -1\n", "warning.delay"),
            ("config_version: 1\nwarning:\n  cache_ttl: 86401\n", "warning.cache_ttl"),
            ("config_version: 1\nwarning:\n  sweep_interval: 0\n", "warning.sweep_interval"),
            ("config_version: 1\npunishment:\n  tempban_duration: soon\n", "punishment.tempban_duration"),
            ("config_version: 1\npunishment:\n  tempban_duration: 0d\n", "punishment.tempban_duration"),
            ("config_version: 1\ndiscord:\n  enabled: true\n  webhook_url: nope\n", "discord.webhook_url"),
            (
                "config_version: 1\npunishment:\n  type: kick\n  messages:\n    kick: \"\"\n",
                "punishment.messages",
            ),
        ];
        for (yaml, expected) in cases {
            match LedgerConfig::from_yaml(yaml) {
                Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, expected, "{yaml}"),
                other => panic!("expected {expected} to be rejected, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_unknown_punishment_type() {
        let err = LedgerConfig::from_yaml("config_version: 1\npunishment:\n  type: jail\n").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }

    #[test]
    fn test_disabled_webhook_needs_no_url() {
        assert!(LedgerConfig::from_yaml("config_version: 1\ndiscord:\n  enabled: false\n").is_ok());
    }

    #[tokio::test]
    async fn test_load_file_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = LedgerConfig::load(dir.path().join("config.yml")).await.unwrap();
        assert_eq!(missing, LedgerConfig::default());

        let path = dir.path().join("config.yml");
        tokio::fs::write(&path, SAMPLE).await.unwrap();
        let loaded = LedgerConfig::load(&path).await.unwrap();
        assert_eq!(loaded.warning.limit, 5);
    }
}
