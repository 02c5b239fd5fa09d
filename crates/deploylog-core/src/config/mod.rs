//! Configuration parsing and validation.
//!
//! This module handles parsing of the monitor configuration file (TOML) that
//! defines the watched directory, the archive location, the cluster map,
//! the ignorable error codes and the notification settings.
//!
//! Configuration is validated as a whole at load time; a
//! [`MonitorConfig`] that exists is known to be usable by the pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Weekday;
use serde::{Deserialize, Serialize};

use crate::notify::{self, NotifierSettings, RetryPolicy};

/// Top-level monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    /// Watched directory and pipeline settings.
    pub monitor: WatchConfig,

    /// Cluster name to instance names.
    #[serde(default)]
    pub clusters: BTreeMap<String, Vec<String>>,

    /// Validator settings.
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Notification settings.
    #[serde(default)]
    pub notification: NotificationConfig,
}

impl MonitorConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails
    /// validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or the configuration fails
    /// [`MonitorConfig::validate`].
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    fn normalize(&mut self) {
        self.validation.ignorable_errors = self
            .validation
            .ignorable_errors
            .iter()
            .map(|code| code.trim().to_ascii_uppercase())
            .collect();
        self.monitor.container_extension = self
            .monitor
            .container_extension
            .trim_start_matches('.')
            .to_ascii_lowercase();
    }

    /// Check every cross-field rule.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first violated
    /// rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor.poll_interval_secs == 0 {
            return Err(invalid("monitor.poll_interval_secs must be > 0"));
        }
        if self.monitor.container_extension.is_empty()
            || self.monitor.container_extension == "zip"
        {
            return Err(invalid(
                "monitor.container_extension must be non-empty and differ from 'zip'",
            ));
        }
        if self.monitor.activity_capacity == 0 {
            return Err(invalid("monitor.activity_capacity must be > 0"));
        }
        if self.clusters.is_empty() {
            return Err(invalid("at least one cluster must be configured"));
        }

        let mut owners: BTreeMap<&str, &str> = BTreeMap::new();
        for (cluster, instances) in &self.clusters {
            if instances.is_empty() {
                return Err(invalid(format!("cluster '{cluster}' has no instances")));
            }
            for instance in instances {
                if let Some(previous) = owners.insert(instance.as_str(), cluster.as_str()) {
                    return Err(invalid(format!(
                        "instance '{instance}' is listed in both '{previous}' and '{cluster}'"
                    )));
                }
            }
        }

        self.notification.validate()
    }

    /// Look up the cluster that owns `instance`.
    #[must_use]
    pub fn cluster_for(&self, instance: &str) -> Option<&str> {
        self.clusters
            .iter()
            .find(|(_, instances)| instances.iter().any(|i| i == instance))
            .map(|(cluster, _)| cluster.as_str())
    }

    /// Poll interval as a [`Duration`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.poll_interval_secs)
    }

    /// Ignorable error codes (upper case).
    #[must_use]
    pub fn ignorable_errors(&self) -> BTreeSet<String> {
        self.validation.ignorable_errors.iter().cloned().collect()
    }
}

/// Watched directory and pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchConfig {
    /// Directory polled for incoming packages.
    pub watch_dir: PathBuf,

    /// Root of the archive hierarchy.
    pub base_archive_path: PathBuf,

    /// Seconds between directory scans.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Only process a file once its fingerprint is unchanged across two
    /// consecutive scans.
    #[serde(default = "default_true")]
    pub settle_polls: bool,

    /// Extension of email containers (without dot).
    #[serde(default = "default_container_extension")]
    pub container_extension: String,

    /// Fingerprint state file. In-memory only when absent.
    #[serde(default)]
    pub state_file: Option<PathBuf>,

    /// Parent directory for extraction sandboxes (system temp when absent).
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,

    /// Upper bound on bytes extracted from one archive.
    #[serde(default = "default_max_extracted_bytes")]
    pub max_extracted_bytes: u64,

    /// Upper bound on entries in one archive.
    #[serde(default = "default_max_archive_entries")]
    pub max_archive_entries: usize,

    /// Capacity of the activity feed consumed by the presentation layer.
    #[serde(default = "default_activity_capacity")]
    pub activity_capacity: usize,

    /// Weekday that anchors a deployment cycle.
    #[serde(default = "default_anchor_weekday")]
    pub anchor_weekday: Weekday,
}

const fn default_poll_interval() -> u64 {
    30
}

const fn default_true() -> bool {
    true
}

fn default_container_extension() -> String {
    "msg".to_string()
}

const fn default_max_extracted_bytes() -> u64 {
    512 * 1024 * 1024
}

const fn default_max_archive_entries() -> usize {
    10_000
}

const fn default_activity_capacity() -> usize {
    500
}

const fn default_anchor_weekday() -> Weekday {
    Weekday::Fri
}

/// Validator settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationConfig {
    /// Error codes that do not fail a deployment (e.g. `ORA-00001`).
    #[serde(default)]
    pub ignorable_errors: Vec<String>,
}

/// Notification settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationConfig {
    /// Whether notifications are sent at all.
    #[serde(default)]
    pub enabled: bool,

    /// Recipient addresses.
    #[serde(default)]
    pub recipients: Vec<String>,

    /// Outbox directory for the spool transport.
    ///
    /// **Required when `enabled = true`.**
    #[serde(default)]
    pub outbox_dir: Option<PathBuf>,

    /// Subject template per status (`PASS`, `FAIL`).
    #[serde(default)]
    pub subject_templates: BTreeMap<String, String>,

    /// Body template.
    #[serde(default)]
    pub body_template: String,

    /// Delivery retry policy.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl NotificationConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (status, template) in &self.subject_templates {
            notify::template::check(template).map_err(|e| {
                invalid(format!("notification.subject_templates.{status}: {e}"))
            })?;
        }
        notify::template::check(&self.body_template)
            .map_err(|e| invalid(format!("notification.body_template: {e}")))?;

        if self.retry.max_attempts == 0 {
            return Err(invalid("notification.retry.max_attempts must be >= 1"));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(invalid("notification.retry.multiplier must be >= 1.0"));
        }

        if !self.enabled {
            return Ok(());
        }
        if self.recipients.is_empty() {
            return Err(invalid(
                "notification.recipients must not be empty when notifications are enabled",
            ));
        }
        if let Some(bad) = self.recipients.iter().find(|r| !notify::is_valid_address(r)) {
            return Err(invalid(format!(
                "notification.recipients contains a malformed address: {bad}"
            )));
        }
        if self.outbox_dir.is_none() {
            return Err(invalid(
                "notification.outbox_dir is required when notifications are enabled",
            ));
        }
        Ok(())
    }

    /// Settings for a [`crate::notify::Notifier`].
    #[must_use]
    pub fn notifier_settings(&self) -> NotifierSettings {
        NotifierSettings {
            recipients: self.recipients.clone(),
            subject_templates: self.subject_templates.clone(),
            body_template: self.body_template.clone(),
            retry: self.retry.clone(),
        }
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation(message.into())
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [monitor]
        watch_dir = "/srv/deploylog/incoming"
        base_archive_path = "/srv/deploylog/audit"

        [clusters]
        mena = ["FSMHO1U"]
    "#;

    #[test]
    fn test_parse_minimal_config() {
        let config = MonitorConfig::from_toml(MINIMAL).unwrap();

        assert_eq!(config.monitor.poll_interval_secs, 30);
        assert!(config.monitor.settle_polls);
        assert_eq!(config.monitor.container_extension, "msg");
        assert_eq!(config.monitor.anchor_weekday, Weekday::Fri);
        assert_eq!(config.cluster_for("FSMHO1U"), Some("mena"));
        assert_eq!(config.cluster_for("UNKNOWN"), None);
        assert!(!config.notification.enabled);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [monitor]
            watch_dir = "/srv/deploylog/incoming"
            base_archive_path = "/srv/deploylog/audit"
            poll_interval_secs = 10
            settle_polls = false
            container_extension = ".MSG"
            state_file = "/srv/deploylog/state.json"
            anchor_weekday = "Thu"

            [clusters]
            mena = ["FSMHO1U", "FSMHO2U"]
            apac = ["FSAPC1P"]

            [validation]
            ignorable_errors = ["ora-00001", " ORA-00955 "]

            [notification]
            enabled = true
            recipients = ["release-ops@example.com"]
            outbox_dir = "/srv/deploylog/outbox"
            body_template = "{cluster}/{instance}: {status}\n{message}"

            [notification.subject_templates]
            PASS = "[{cluster}] {instance} PASS"
            FAIL = "[{cluster}] {instance} FAIL"

            [notification.retry]
            max_attempts = 4
            initial_delay = "2s"
        "#;

        let config = MonitorConfig::from_toml(toml).unwrap();
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert!(!config.monitor.settle_polls);
        assert_eq!(config.monitor.container_extension, "msg");
        assert_eq!(config.monitor.anchor_weekday, Weekday::Thu);
        assert_eq!(config.cluster_for("FSAPC1P"), Some("apac"));
        assert!(config.ignorable_errors().contains("ORA-00001"));
        assert!(config.ignorable_errors().contains("ORA-00955"));
        assert_eq!(config.notification.retry.max_attempts, 4);
        assert_eq!(
            config.notification.retry.initial_delay,
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_reject_zero_poll_interval() {
        let toml = MINIMAL.replace(
            "[clusters]",
            "poll_interval_secs = 0\n\n        [clusters]",
        );
        let err = MonitorConfig::from_toml(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("poll_interval")));
    }

    #[test]
    fn test_reject_instance_in_two_clusters() {
        let toml = r#"
            [monitor]
            watch_dir = "/in"
            base_archive_path = "/out"

            [clusters]
            mena = ["FSMHO1U"]
            apac = ["FSMHO1U"]
        "#;
        let err = MonitorConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("FSMHO1U")));
    }

    #[test]
    fn test_reject_empty_cluster() {
        let toml = r#"
            [monitor]
            watch_dir = "/in"
            base_archive_path = "/out"

            [clusters]
            mena = []
        "#;
        let err = MonitorConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("mena")));
    }

    #[test]
    fn test_reject_unknown_placeholder() {
        let toml = format!(
            "{MINIMAL}\n[notification.subject_templates]\nPASS = \"{{owner}} PASS\"\n"
        );
        let err = MonitorConfig::from_toml(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("owner")));
    }

    #[test]
    fn test_reject_enabled_notification_without_recipients() {
        let toml = format!("{MINIMAL}\n[notification]\nenabled = true\noutbox_dir = \"/out\"\n");
        let err = MonitorConfig::from_toml(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("recipients")));
    }

    #[test]
    fn test_reject_malformed_recipient() {
        let toml = format!(
            "{MINIMAL}\n[notification]\nenabled = true\noutbox_dir = \"/out\"\nrecipients = [\"ops at example\"]\n"
        );
        let err = MonitorConfig::from_toml(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("malformed")));
    }

    #[test]
    fn test_reject_unknown_field() {
        let toml = MINIMAL.replace("[clusters]", "colour = \"blue\"\n[clusters]");
        assert!(matches!(
            MonitorConfig::from_toml(&toml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let config = MonitorConfig::from_toml(MINIMAL).unwrap();
        let rendered = config.to_toml().unwrap();
        let reparsed = MonitorConfig::from_toml(&rendered).unwrap();
        assert_eq!(reparsed.cluster_for("FSMHO1U"), Some("mena"));
    }
}
