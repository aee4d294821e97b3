//! Typed application configuration for all Evochora services.
//!
//! Configuration is a TOML document deserialised into per-subsystem
//! structs. String values may reference environment variables as `${VAR}`;
//! expansion happens before parsing and unset variables are an error, so a
//! missing variable never silently becomes an empty path.

mod configs;

pub use configs::{
    AppConfig, CaptureConfig, CompressionConfig, IndexerConfig, SimulationConfig, StorageConfig,
    ThermodynamicsConfig, TopicConfig, TopologyKind,
};

use std::path::Path;
use thiserror::Error;

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The document did not parse as TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// `${VAR}` referenced an unset environment variable.
    #[error("environment variable {0} referenced by config is not set")]
    UnsetVariable(String),
    /// A value failed semantic validation.
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Shorthand result type for configuration loading.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Loads, expands, parses, and validates a config file.
pub fn load(path: &Path) -> Result<AppConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse(&raw)
}

/// Parses a config document from a string (tests and embedded defaults).
pub fn parse(raw: &str) -> Result<AppConfig> {
    let expanded = expand_variables(raw, |name| std::env::var(name).ok())?;
    let config: AppConfig = toml::from_str(&expanded)?;
    config.validate()?;
    Ok(config)
}

/// Substitutes `${VAR}` occurrences using `lookup`.
///
/// `$${` escapes a literal `${`.
fn expand_variables(raw: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        if rest[..start].ends_with('$') {
            out.push_str(&rest[..start - 1]);
            out.push_str("${");
            rest = &rest[start + 2..];
            continue;
        }
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| ConfigError::Invalid("unterminated ${ in config".to_owned()))?;
        let name = &after[..end];
        let value =
            lookup(name).ok_or_else(|| ConfigError::UnsetVariable(name.to_owned()))?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
