//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Configuration for the subscription engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Event-queue capacity per subscription group.
    pub group_capacity: usize,
    /// Default deadline applied to events when the caller gives none.
    pub default_timeout: Duration,
    /// How long an engine-managed pump sleeps when its group is idle.
    pub pump_idle: Duration,
    /// How soon an engine-managed pump retries shelved records.
    pub shelve_retry: Duration,
    /// Directory for persisted notification logs (`None` = in-memory only).
    pub notif_dir: Option<PathBuf>,
    /// Retention window for replayable notifications.
    pub notif_retention: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            group_capacity: 256,
            default_timeout: Duration::from_secs(5),
            pump_idle: Duration::from_millis(100),
            shelve_retry: Duration::from_millis(20),
            notif_dir: None,
            notif_retention: Duration::from_secs(60 * 60),
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a message naming the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.group_capacity == 0 {
            return Err("group_capacity must be > 0".to_string());
        }
        if self.default_timeout.is_zero() {
            return Err("default_timeout must be > 0".to_string());
        }
        if self.shelve_retry.is_zero() {
            return Err("shelve_retry must be > 0".to_string());
        }
        Ok(())
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    group_capacity: Option<usize>,
    default_timeout: Option<Duration>,
    pump_idle: Option<Duration>,
    shelve_retry: Option<Duration>,
    notif_dir: Option<PathBuf>,
    notif_retention: Option<Duration>,
}

impl EngineConfigBuilder {
    /// Sets the per-group event-queue capacity.
    #[must_use]
    pub fn group_capacity(mut self, capacity: usize) -> Self {
        self.group_capacity = Some(capacity);
        self
    }

    /// Sets the default event deadline.
    #[must_use]
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Sets the idle sleep of engine-managed pumps.
    #[must_use]
    pub fn pump_idle(mut self, idle: Duration) -> Self {
        self.pump_idle = Some(idle);
        self
    }

    /// Sets the retry interval for shelved records.
    #[must_use]
    pub fn shelve_retry(mut self, retry: Duration) -> Self {
        self.shelve_retry = Some(retry);
        self
    }

    /// Sets the notification-log directory.
    #[must_use]
    pub fn notif_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.notif_dir = Some(dir.into());
        self
    }

    /// Sets the notification retention window.
    #[must_use]
    pub fn notif_retention(mut self, retention: Duration) -> Self {
        self.notif_retention = Some(retention);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns a message if the resulting configuration is invalid.
    pub fn build(self) -> Result<EngineConfig, String> {
        let defaults = EngineConfig::default();
        let config = EngineConfig {
            group_capacity: self.group_capacity.unwrap_or(defaults.group_capacity),
            default_timeout: self.default_timeout.unwrap_or(defaults.default_timeout),
            pump_idle: self.pump_idle.unwrap_or(defaults.pump_idle),
            shelve_retry: self.shelve_retry.unwrap_or(defaults.shelve_retry),
            notif_dir: self.notif_dir,
            notif_retention: self.notif_retention.unwrap_or(defaults.notif_retention),
        };
        config.validate()?;
        Ok(config)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default_is_valid() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.group_capacity, 256);
        assert!(cfg.notif_dir.is_none());
    }

    #[test]
    fn test_config_builder() {
        let cfg = EngineConfig::builder()
            .group_capacity(16)
            .default_timeout(Duration::from_secs(1))
            .notif_dir("/tmp/conflux-notif")
            .build()
            .unwrap();
        assert_eq!(cfg.group_capacity, 16);
        assert_eq!(cfg.default_timeout, Duration::from_secs(1));
        assert!(cfg.notif_dir.is_some());
    }

    #[test]
    fn test_config_rejects_zero_capacity() {
        let err = EngineConfig::builder().group_capacity(0).build();
        assert!(err.is_err());
    }
}
