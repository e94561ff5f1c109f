//! Projection runtime configuration.

use serde::Deserialize;

/// Tunables for one projection instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    /// Handled events between checkpoint suggestions.
    pub checkpoint_handled_threshold: i64,
    /// Unhandled bytes (position distance) between checkpoint suggestions.
    pub checkpoint_unhandled_bytes_threshold: i64,
    /// Queue depth above which the subscription reader is paused.
    pub pending_events_threshold: usize,
    /// Maximum events per append to an emitted stream.
    pub max_write_batch_length: usize,
    /// Whether checkpoints are persisted at all.
    pub checkpoints_enabled: bool,
    /// Whether the handler may emit to derived streams.
    pub emit_enabled: bool,
    /// Whether partitioned handlers get per-partition state streams and a
    /// partition catalog.
    pub emit_partition_state: bool,
    /// Stop the projection when the source reports EOF.
    pub stop_on_eof: bool,
    /// Cached partitions kept beyond the locked set.
    pub max_cached_partitions: usize,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            checkpoint_handled_threshold: 4096,
            checkpoint_unhandled_bytes_threshold: 10_000_000,
            pending_events_threshold: 5000,
            max_write_batch_length: 500,
            checkpoints_enabled: true,
            emit_enabled: true,
            emit_partition_state: true,
            stop_on_eof: false,
            max_cached_partitions: 1000,
        }
    }
}

impl ProjectionConfig {
    /// Load configuration from file and environment.
    ///
    /// Sources (later overrides earlier):
    /// 1. `asterism.yaml` in the current directory (if present)
    /// 2. File named by the `ASTERISM_CONFIG` environment variable (if set)
    /// 3. Environment variables with the `ASTERISM_` prefix
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config, Environment, File, FileFormat};

        let mut builder = Config::builder()
            .add_source(File::new("asterism", FileFormat::Yaml).required(false))
            .add_source(File::new("asterism.yaml", FileFormat::Yaml).required(false));

        if let Ok(path) = std::env::var("ASTERISM_CONFIG") {
            builder = builder.add_source(File::new(&path, FileFormat::Yaml).required(true));
        }

        let loaded = builder
            .add_source(
                Environment::with_prefix("ASTERISM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(loaded.try_deserialize()?)
    }
}
