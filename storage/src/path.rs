//! Storage key layout and validation.
//!
//! Keys are slash-separated paths relative to the storage root:
//! `<runId>/raw/<ggg>/<hhh>/batch_<first:019>_<last:019>.pb[.zst]`. The
//! 19-digit zero padding makes lexicographic order equal tick order, which
//! the listing and resume logic rely on.

use crate::{StorageError, Result};
use evochora_protocol::Compression;

/// Directory under a run id holding the batch tree and metadata.
pub const RAW_DIR: &str = "raw";
/// Directory superseded files are moved to; nothing is ever deleted.
pub const SUPERSEDED_DIR: &str = "superseded";
/// Base name of the run metadata message.
pub const METADATA_BASE: &str = "metadata";

const TICK_WIDTH: usize = 19;

/// Characters rejected in any key segment.
const RESERVED: &[char] = &['<', '>', ':', '"', '|', '?', '*', '\\'];

/// Validates a caller-supplied storage key, every segment included.
pub fn validate_key(key: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(StorageError::InvalidKey {
            key: key.to_owned(),
            reason: reason.to_owned(),
        })
    };
    if key.is_empty() {
        return invalid("empty key");
    }
    if key.starts_with('/') {
        return invalid("absolute path");
    }
    if key.len() >= 2 && key.as_bytes()[1] == b':' && key.as_bytes()[0].is_ascii_alphabetic() {
        return invalid("windows drive letter");
    }
    for segment in key.split('/') {
        if segment.is_empty() {
            return invalid("empty path segment");
        }
        if segment == "." || segment == ".." {
            return invalid("relative path segment");
        }
        if segment.chars().any(|c| c.is_control()) {
            return invalid("control character in segment");
        }
        if segment.chars().any(|c| RESERVED.contains(&c)) {
            return invalid("reserved character in segment");
        }
    }
    Ok(())
}

/// Validates a run id: one single path segment.
pub fn validate_run_id(run_id: &str) -> Result<()> {
    validate_key(run_id)?;
    if run_id.contains('/') {
        return Err(StorageError::InvalidKey {
            key: run_id.to_owned(),
            reason: "run id must be a single segment".to_owned(),
        });
    }
    Ok(())
}

/// The decade-group directory pair for a first tick.
fn tick_groups(first_tick: i64) -> (String, String) {
    let first = first_tick.max(0);
    (
        format!("{:03}", (first / 1_000_000) % 1_000),
        format!("{:03}", (first / 1_000) % 1_000),
    )
}

/// File name of a batch covering `[first_tick, last_tick]`.
pub fn batch_file_name(first_tick: i64, last_tick: i64, compression: Compression) -> String {
    format!(
        "batch_{:0width$}_{:0width$}.{}",
        first_tick,
        last_tick,
        compression.extension(),
        width = TICK_WIDTH
    )
}

/// Full key of a batch file.
pub fn batch_key(
    run_id: &str,
    first_tick: i64,
    last_tick: i64,
    compression: Compression,
) -> String {
    let (ggg, hhh) = tick_groups(first_tick);
    format!(
        "{}/{}/{}/{}/{}",
        run_id,
        RAW_DIR,
        ggg,
        hhh,
        batch_file_name(first_tick, last_tick, compression)
    )
}

/// Key of a run's metadata message.
pub fn metadata_key(run_id: &str, compression: Compression) -> String {
    format!(
        "{}/{}/{}.{}",
        run_id,
        RAW_DIR,
        METADATA_BASE,
        compression.extension()
    )
}

/// Tick range and codec parsed from a batch file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchFileName {
    /// First tick covered by the file.
    pub first_tick: i64,
    /// Last tick covered by the file.
    pub last_tick: i64,
    /// Codec encoded in the extension.
    pub compression: Compression,
}

/// Parses `batch_<first>_<last>.pb[.zst]`; `None` for anything else,
/// in-flight `.tmp` files included.
pub fn parse_batch_file_name(name: &str) -> Option<BatchFileName> {
    let compression = match name {
        _ if name.ends_with(".pb.zst") => Compression::Zstd,
        _ if name.ends_with(".pb") => Compression::None,
        _ => return None,
    };
    let stem = name
        .strip_suffix(".pb.zst")
        .or_else(|| name.strip_suffix(".pb"))?;
    let rest = stem.strip_prefix("batch_")?;
    let (first, last) = rest.split_once('_')?;
    if first.len() != TICK_WIDTH || last.len() != TICK_WIDTH {
        return None;
    }
    Some(BatchFileName {
        first_tick: first.parse().ok()?,
        last_tick: last.parse().ok()?,
        compression,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_order_like_ticks() {
        let a = batch_key("r", 999, 1_008, Compression::Zstd);
        let b = batch_key("r", 1_009, 2_000, Compression::Zstd);
        let c = batch_key("r", 1_000_000, 1_000_999, Compression::Zstd);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a, format!("r/raw/000/000/batch_{:019}_{:019}.pb.zst", 999, 1008));
        assert!(c.starts_with("r/raw/001/000/"));
    }

    #[test]
    fn parse_round_trips() {
        let name = batch_file_name(42, 99, Compression::None);
        assert_eq!(
            parse_batch_file_name(&name),
            Some(BatchFileName {
                first_tick: 42,
                last_tick: 99,
                compression: Compression::None,
            })
        );
        assert_eq!(parse_batch_file_name("batch_1_2.pb"), None);
        assert_eq!(
            parse_batch_file_name(&format!("{}.deadbeef.tmp", name)),
            None
        );
    }

    #[test]
    fn hostile_keys_are_rejected() {
        for key in [
            "",
            "/etc/passwd",
            "run/../secrets",
            "run/./x",
            "C:evil",
            "run//x",
            "run/fi|le",
            "run/a\u{0007}b",
            "run\\windows",
        ] {
            assert!(validate_key(key).is_err(), "key {:?} must be rejected", key);
        }
        validate_key("run-1/raw/000/000/batch_x.pb").unwrap();
    }

    #[test]
    fn run_ids_are_single_segments() {
        validate_run_id("run-2026-01").unwrap();
        assert!(validate_run_id("run/nested").is_err());
    }
}
