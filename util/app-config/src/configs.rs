//! The per-subsystem configuration structs.

use crate::{ConfigError, Result};
use serde::Deserialize;
use std::path::PathBuf;

fn default_true() -> bool {
    true
}

/// Root configuration document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Storage backend settings.
    pub storage: StorageConfig,
    /// Simulation core settings.
    pub simulation: SimulationConfig,
    /// Tick capture settings.
    #[serde(default)]
    pub capture: CaptureConfig,
    /// Topic / broker settings.
    #[serde(default)]
    pub topic: TopicConfig,
    /// Indexer service settings.
    #[serde(default)]
    pub indexer: IndexerConfig,
}

impl AppConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        self.storage.validate()?;
        self.simulation.validate()?;
        self.capture.validate()?;
        self.topic.validate()?;
        self.indexer.validate()
    }
}

/// Storage backend settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Absolute root directory for all runs.
    pub root: PathBuf,
    /// Batch file compression.
    #[serde(default)]
    pub compression: CompressionConfig,
}

impl StorageConfig {
    fn validate(&self) -> Result<()> {
        if !self.root.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "storage.root must be an absolute path, got {}",
                self.root.display()
            )));
        }
        self.compression.validate()
    }
}

/// Batch file compression settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompressionConfig {
    /// Disabling compression forces the `none` codec regardless of `codec`.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Codec name: `none` or `zstd`.
    #[serde(default = "CompressionConfig::default_codec")]
    pub codec: String,
    /// Codec-specific compression level.
    #[serde(default = "CompressionConfig::default_level")]
    pub level: i32,
}

impl CompressionConfig {
    fn default_codec() -> String {
        "zstd".to_owned()
    }

    fn default_level() -> i32 {
        3
    }

    fn validate(&self) -> Result<()> {
        match self.codec.as_str() {
            "none" | "zstd" => Ok(()),
            other => Err(ConfigError::Invalid(format!(
                "unknown compression codec {:?} (expected \"none\" or \"zstd\")",
                other
            ))),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig {
            enabled: true,
            codec: Self::default_codec(),
            level: Self::default_level(),
        }
    }
}

/// Grid boundary behaviour, config form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TopologyKind {
    /// Out-of-range coordinates are an error.
    Bounded,
    /// Coordinates wrap around every axis.
    #[default]
    Toroidal,
}

/// Per-instruction energy accounting.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ThermodynamicsConfig {
    /// Energy cost of a successfully executed instruction.
    pub base_cost: i32,
    /// Energy cost charged instead when an instruction fails.
    pub error_penalty: i32,
    /// Entropy added per grid write.
    pub entropy_per_write: i32,
}

impl Default for ThermodynamicsConfig {
    fn default() -> Self {
        ThermodynamicsConfig {
            base_cost: 1,
            error_penalty: 5,
            entropy_per_write: 1,
        }
    }
}

/// Simulation core settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulationConfig {
    /// World extents, one entry per axis.
    pub shape: Vec<i32>,
    /// Boundary behaviour.
    #[serde(default)]
    pub topology: TopologyKind,
    /// Worker count for the tick pool.
    #[serde(default = "SimulationConfig::default_parallelism")]
    pub parallelism: usize,
    /// Seed for deterministic world initialisation.
    #[serde(default)]
    pub seed: u64,
    /// Upper bound for every organism stack.
    #[serde(default = "SimulationConfig::default_stack_limit")]
    pub stack_limit: usize,
    /// Energy ceiling for newly created organisms.
    #[serde(default = "SimulationConfig::default_max_energy")]
    pub max_energy: i32,
    /// Per-instruction energy accounting.
    #[serde(default)]
    pub thermodynamics: ThermodynamicsConfig,
}

impl SimulationConfig {
    fn default_parallelism() -> usize {
        4
    }

    fn default_stack_limit() -> usize {
        128
    }

    fn default_max_energy() -> i32 {
        10_000
    }

    fn validate(&self) -> Result<()> {
        if self.shape.is_empty() || self.shape.iter().any(|d| *d <= 0) {
            return Err(ConfigError::Invalid(format!(
                "simulation.shape must be non-empty with positive extents, got {:?}",
                self.shape
            )));
        }
        if self.parallelism < 2 {
            return Err(ConfigError::Invalid(
                "simulation.parallelism must be at least 2".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Tick capture settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CaptureConfig {
    /// Ticks between full enumerations.
    pub snapshot_interval: i64,
    /// Ticks per chunk.
    pub chunk_interval: i64,
    /// Chunks per persisted batch file.
    pub batch_size: usize,
}

impl CaptureConfig {
    fn validate(&self) -> Result<()> {
        if self.snapshot_interval <= 0 || self.chunk_interval <= 0 || self.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "capture intervals and batch size must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            snapshot_interval: 100,
            chunk_interval: 100,
            batch_size: 10,
        }
    }
}

/// Topic / broker settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TopicConfig {
    /// Broker endpoint; the embedded broker ignores it.
    pub broker_url: String,
    /// Base topic name; the run id is appended per run.
    pub topic_name: String,
    /// Seconds an unacknowledged message may stay claimed.
    pub claim_timeout_secs: u64,
    /// Journal retention for new-consumer-group replay.
    pub retention_enabled: bool,
    /// Upper bound used when estimating journal sizes.
    pub max_size_bytes_for_estimation: u64,
}

impl TopicConfig {
    fn validate(&self) -> Result<()> {
        if self.topic_name.is_empty() {
            return Err(ConfigError::Invalid(
                "topic.topic_name must not be empty".to_owned(),
            ));
        }
        if self.claim_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "topic.claim_timeout_secs must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        TopicConfig {
            broker_url: "embedded://".to_owned(),
            topic_name: "evochora.batches".to_owned(),
            claim_timeout_secs: 300,
            retention_enabled: true,
            max_size_bytes_for_estimation: 512 << 20,
        }
    }
}

/// Indexer service settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IndexerConfig {
    /// Chunks per transactional flush.
    pub insert_batch_size: usize,
    /// Milliseconds after which a partial buffer is flushed anyway.
    pub flush_timeout_ms: u64,
    /// Topic receive timeout per iteration.
    pub topic_poll_timeout_ms: u64,
    /// Delay between metadata polls while waiting for a run to appear.
    pub metadata_poll_interval_ms: u64,
    /// Give up waiting for metadata after this long.
    pub metadata_max_poll_duration_ms: u64,
}

impl IndexerConfig {
    fn validate(&self) -> Result<()> {
        if self.insert_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "indexer.insert_batch_size must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

impl Default for IndexerConfig {
    fn default() -> Self {
        IndexerConfig {
            insert_batch_size: 64,
            flush_timeout_ms: 2_000,
            topic_poll_timeout_ms: 500,
            metadata_poll_interval_ms: 250,
            metadata_max_poll_duration_ms: 60_000,
        }
    }
}
