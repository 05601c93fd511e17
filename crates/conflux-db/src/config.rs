//! Configuration for a `Conflux` instance.

use std::path::PathBuf;

use conflux_core::EngineConfig;

/// Configuration for a [`Conflux`](crate::Conflux) instance.
#[derive(Debug, Clone, Default)]
pub struct ConfluxConfig {
    /// Engine tuning (queue capacities, timeouts, pump behavior).
    pub engine: EngineConfig,
    /// Storage directory for persisted state (`None` = fully in-memory).
    /// Notification logs land in `<storage_dir>/notif/`.
    pub storage_dir: Option<PathBuf>,
}

impl ConfluxConfig {
    /// Creates a configuration persisting under `storage_dir`.
    #[must_use]
    pub fn with_storage(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConfig::default(),
            storage_dir: Some(storage_dir.into()),
        }
    }

    /// Resolves the engine configuration, deriving the notification-log
    /// directory from the storage directory when set.
    #[must_use]
    pub(crate) fn resolved_engine(&self) -> EngineConfig {
        let mut engine = self.engine.clone();
        if engine.notif_dir.is_none() {
            if let Some(dir) = &self.storage_dir {
                engine.notif_dir = Some(dir.join("notif"));
            }
        }
        engine
    }
}
