//! Filesystem storage backend.
//!
//! Every write goes to `<final_name>.<uuid>.tmp` in the final directory
//! and is renamed into place on success, so readers only ever observe
//! complete files. `.tmp` leftovers from crashes are invisible to listing
//! and are overwritten by the next successful write of the same range.

use crate::path::{
    batch_key, metadata_key, parse_batch_file_name, validate_key, validate_run_id, BatchFileName,
    RAW_DIR, SUPERSEDED_DIR,
};
use crate::{BatchListing, Result, SortOrder, StorageError, StorageResource, WriteResult};
use evochora_app_config::StorageConfig;
use evochora_logger::{debug, warn};
use evochora_protocol::{
    compress_bytes, decompress_bytes, ChunkFilter, ChunkHeader, Compression, ProtocolError,
    TickDataChunk,
};
use std::cell::Cell;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Storage rooted in a local directory.
pub struct FilesystemStorage {
    root: PathBuf,
    compression: Compression,
    level: i32,
}

impl FilesystemStorage {
    /// Opens (and creates) a storage root. The root must be absolute.
    pub fn new(root: &Path, compression: Compression, level: i32) -> Result<FilesystemStorage> {
        if !root.is_absolute() {
            return Err(StorageError::BadRoot {
                root: root.display().to_string(),
                reason: "root must be an absolute path".to_owned(),
            });
        }
        fs::create_dir_all(root).map_err(|source| StorageError::BadRoot {
            root: root.display().to_string(),
            reason: source.to_string(),
        })?;
        Ok(FilesystemStorage {
            root: root.to_path_buf(),
            compression,
            level,
        })
    }

    /// Opens a storage root from validated configuration.
    pub fn from_config(config: &StorageConfig) -> Result<FilesystemStorage> {
        let compression = if config.compression.enabled {
            Compression::from_name(&config.compression.codec).unwrap_or(Compression::Zstd)
        } else {
            Compression::None
        };
        Self::new(&config.root, compression, config.compression.level)
    }

    /// The codec applied to new batch files.
    pub fn compression(&self) -> Compression {
        self.compression
    }

    fn absolute(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn io(key: &str, source: std::io::Error) -> StorageError {
        StorageError::Io {
            key: key.to_owned(),
            source,
        }
    }

    /// Writes through a uuid-suffixed temp file and renames into place.
    fn atomic_write(
        &self,
        key: &str,
        write: impl FnOnce(&mut File) -> Result<()>,
    ) -> Result<()> {
        let target = self.absolute(key)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| Self::io(key, e))?;
        }
        let tmp = target.with_file_name(format!(
            "{}.{}.tmp",
            target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Uuid::new_v4()
        ));
        let result = (|| {
            let mut file = File::create(&tmp).map_err(|e| Self::io(key, e))?;
            write(&mut file)?;
            file.sync_all().map_err(|e| Self::io(key, e))?;
            Ok(())
        })();
        match result {
            Ok(()) => fs::rename(&tmp, &target).map_err(|e| {
                let _ = fs::remove_file(&tmp);
                Self::io(key, e)
            }),
            Err(error) => {
                let _ = fs::remove_file(&tmp);
                Err(error)
            }
        }
    }

    fn open_batch(&self, key: &str) -> Result<(File, Compression)> {
        let path = self.absolute(key)?;
        let compression = Compression::from_path(&path).ok_or_else(|| {
            StorageError::InvalidRequest(format!("{} is not a batch or message file", key))
        })?;
        let file = File::open(&path).map_err(|e| Self::io(key, e))?;
        Ok((file, compression))
    }

    /// Batch files hidden by the duplicate-`first_tick` rule: the wider
    /// leftovers of crashed writers. `cleanup --compact` supersedes these.
    pub fn stale_duplicates(&self, run_id: &str) -> Result<Vec<String>> {
        let all = self.collect_batch_files_raw(run_id)?;
        let kept: std::collections::HashSet<String> = dedup_by_first_tick(all.clone())
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        Ok(all
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| !kept.contains(key))
            .collect())
    }

    /// Every batch file of a run, as `(key, parsed_name)` sorted ascending
    /// by key, with the duplicate-first-tick rule applied.
    fn collect_batch_files(&self, run_id: &str) -> Result<Vec<(String, BatchFileName)>> {
        Ok(dedup_by_first_tick(self.collect_batch_files_raw(run_id)?))
    }

    /// As above, duplicates included.
    fn collect_batch_files_raw(&self, run_id: &str) -> Result<Vec<(String, BatchFileName)>> {
        validate_run_id(run_id)?;
        let raw = self.root.join(run_id).join(RAW_DIR);
        if !raw.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for group in sorted_dir(&raw, run_id)? {
            if !group.path.is_dir() {
                continue;
            }
            for sub in sorted_dir(&group.path, run_id)? {
                if !sub.path.is_dir() {
                    continue;
                }
                for entry in sorted_dir(&sub.path, run_id)? {
                    if let Some(parsed) = parse_batch_file_name(&entry.name) {
                        let key = format!(
                            "{}/{}/{}/{}/{}",
                            run_id, RAW_DIR, group.name, sub.name, entry.name
                        );
                        files.push((key, parsed));
                    }
                }
            }
        }
        files.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(files)
    }
}

struct DirEntryName {
    name: String,
    path: PathBuf,
}

fn sorted_dir(dir: &Path, key: &str) -> Result<Vec<DirEntryName>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| FilesystemStorage::io(key, e))? {
        let entry = entry.map_err(|e| FilesystemStorage::io(key, e))?;
        entries.push(DirEntryName {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: entry.path(),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// Applies the crash-recovery rule: of two files sharing a `first_tick`,
/// the one with the smaller `last_tick` is authoritative.
fn dedup_by_first_tick(files: Vec<(String, BatchFileName)>) -> Vec<(String, BatchFileName)> {
    let mut kept: Vec<(String, BatchFileName)> = Vec::with_capacity(files.len());
    for (key, parsed) in files {
        match kept.last() {
            Some((kept_key, kept_parsed)) if kept_parsed.first_tick == parsed.first_tick => {
                // keys sort by (first, last), so the kept entry already has
                // the smaller last_tick
                warn!(
                    "duplicate first_tick {}: keeping {}, ignoring {}",
                    parsed.first_tick, kept_key, key
                );
            }
            _ => kept.push((key, parsed)),
        }
    }
    kept
}

impl StorageResource for FilesystemStorage {
    fn write_chunk_batch_streaming(
        &self,
        chunks: &mut dyn Iterator<Item = TickDataChunk>,
    ) -> Result<WriteResult> {
        let Some(first) = chunks.next() else {
            return Err(StorageError::InvalidRequest(
                "cannot write an empty chunk batch".to_owned(),
            ));
        };
        let run_id = first.simulation_run_id.clone();
        validate_run_id(&run_id)?;
        let first_tick = first.first_tick;

        // the final name depends on the last tick, which is only known
        // after the stream is drained; write to a temp in the final
        // directory and rename once
        let dir_key = batch_key(&run_id, first_tick, first_tick, self.compression);
        let dir = self
            .absolute(&dir_key)?
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&dir).map_err(|e| Self::io(&dir_key, e))?;
        let tmp = dir.join(format!("batch_{:019}_inflight.{}.tmp", first_tick, Uuid::new_v4()));

        let last_tick = Cell::new(first.last_tick);
        let count = Cell::new(0usize);
        let stream = std::iter::once(first).chain(chunks).inspect(|chunk| {
            last_tick.set(chunk.last_tick);
            count.set(count.get() + 1);
        });

        let write_result = File::create(&tmp)
            .map_err(|e| Self::io(&dir_key, e))
            .and_then(|file| {
                evochora_protocol::write_chunks(file, self.compression, self.level, stream)
                    .map_err(|source| match source {
                        ProtocolError::Io(e) => Self::io(&dir_key, e),
                        other => StorageError::Corrupt {
                            key: dir_key.clone(),
                            source: other,
                        },
                    })
            });
        if let Err(error) = write_result {
            let _ = fs::remove_file(&tmp);
            return Err(error);
        }

        let final_key = batch_key(&run_id, first_tick, last_tick.get(), self.compression);
        let final_path = self.absolute(&final_key)?;
        fs::rename(&tmp, &final_path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Self::io(&final_key, e)
        })?;
        debug!(
            "wrote batch {} ({} chunks, ticks {}..={})",
            final_key,
            count.get(),
            first_tick,
            last_tick.get()
        );
        Ok(WriteResult {
            path: final_key,
            first_tick,
            last_tick: last_tick.get(),
            chunk_count: count.get(),
        })
    }

    fn write_message_bytes(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let compression =
            Compression::from_path(Path::new(key)).unwrap_or(Compression::None);
        let body =
            compress_bytes(bytes, compression, self.level).map_err(|e| Self::io(key, e))?;
        self.atomic_write(key, |file| file.write_all(&body).map_err(|e| Self::io(key, e)))
    }

    fn read_message_bytes(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.absolute(key)?;
        let compression = Compression::from_path(&path).unwrap_or(Compression::None);
        let mut bytes = Vec::new();
        File::open(&path)
            .and_then(|mut file| file.read_to_end(&mut bytes))
            .map_err(|e| Self::io(key, e))?;
        decompress_bytes(&bytes, compression).map_err(|e| Self::io(key, e))
    }

    fn for_each_raw_chunk(
        &self,
        key: &str,
        consumer: &mut dyn FnMut(&ChunkHeader, &[u8]) -> Result<()>,
    ) -> Result<()> {
        let (file, compression) = self.open_batch(key)?;
        let mut caller_error: Option<StorageError> = None;
        let result =
            evochora_protocol::for_each_raw_chunk(file, compression, |header, frame| {
                consumer(header, frame).map_err(|error| {
                    caller_error = Some(error);
                    halt_iteration()
                })
            });
        finish_iteration(key, result, caller_error)
    }

    fn for_each_chunk(
        &self,
        key: &str,
        filter: ChunkFilter,
        consumer: &mut dyn FnMut(TickDataChunk) -> Result<()>,
    ) -> Result<()> {
        let (file, compression) = self.open_batch(key)?;
        let mut caller_error: Option<StorageError> = None;
        let result = evochora_protocol::for_each_chunk(file, compression, filter, |chunk| {
            consumer(chunk).map_err(|error| {
                caller_error = Some(error);
                halt_iteration()
            })
        });
        finish_iteration(key, result, caller_error)
    }

    fn list_batch_files(
        &self,
        prefix: &str,
        continuation_token: Option<&str>,
        max_results: usize,
        start_tick: Option<i64>,
        end_tick: Option<i64>,
        sort_order: SortOrder,
    ) -> Result<BatchListing> {
        if max_results == 0 {
            return Err(StorageError::InvalidRequest(
                "max_results must be positive".to_owned(),
            ));
        }
        let mut files = self.collect_batch_files(prefix)?;
        files.retain(|(_, parsed)| {
            start_tick.map_or(true, |start| parsed.last_tick >= start)
                && end_tick.map_or(true, |end| parsed.first_tick <= end)
        });
        if sort_order == SortOrder::Descending {
            files.reverse();
        }
        if let Some(token) = continuation_token {
            files.retain(|(key, _)| match sort_order {
                SortOrder::Ascending => key.as_str() > token,
                SortOrder::Descending => key.as_str() < token,
            });
        }
        let more = files.len() > max_results;
        files.truncate(max_results);
        let next_token = more.then(|| files.last().map(|(key, _)| key.clone())).flatten();
        Ok(BatchListing {
            paths: files.into_iter().map(|(key, _)| key).collect(),
            next_token,
        })
    }

    fn find_metadata_path(&self, run_id: &str) -> Result<Option<String>> {
        validate_run_id(run_id)?;
        for compression in [Compression::Zstd, Compression::None] {
            let key = metadata_key(run_id, compression);
            if self.root.join(&key).is_file() {
                return Ok(Some(key));
            }
        }
        Ok(None)
    }

    fn find_last_batch_file(&self, run_id_prefix: &str) -> Result<Option<String>> {
        if !run_id_prefix.is_empty() {
            validate_key(run_id_prefix)?;
        }
        let mut runs: Vec<String> = sorted_dir(&self.root, run_id_prefix)?
            .into_iter()
            .filter(|entry| entry.path.is_dir() && entry.name.starts_with(run_id_prefix))
            .map(|entry| entry.name)
            .collect();
        runs.reverse();

        for run_id in runs {
            let raw = self.root.join(&run_id).join(RAW_DIR);
            if !raw.is_dir() {
                continue;
            }
            // reverse traversal: newest group first, backtracking out of
            // directories that contain no batch files
            let mut groups = sorted_dir(&raw, &run_id)?;
            groups.reverse();
            for group in groups.into_iter().filter(|g| g.path.is_dir()) {
                let mut subs = sorted_dir(&group.path, &run_id)?;
                subs.reverse();
                for sub in subs.into_iter().filter(|s| s.path.is_dir()) {
                    let mut best: Option<(String, BatchFileName)> = None;
                    for entry in sorted_dir(&sub.path, &run_id)? {
                        let Some(parsed) = parse_batch_file_name(&entry.name) else {
                            continue;
                        };
                        best = Some(match best {
                            // same first_tick: the smaller last_tick wins
                            Some((_, b))
                                if parsed.first_tick > b.first_tick
                                    || (parsed.first_tick == b.first_tick
                                        && parsed.last_tick < b.last_tick) =>
                            {
                                (entry.name.clone(), parsed)
                            }
                            Some(best) => best,
                            None => (entry.name.clone(), parsed),
                        });
                    }
                    if let Some((name, _)) = best {
                        return Ok(Some(format!(
                            "{}/{}/{}/{}/{}",
                            run_id, RAW_DIR, group.name, sub.name, name
                        )));
                    }
                }
            }
        }
        Ok(None)
    }

    fn list_run_ids(&self, after_timestamp_ms: Option<u64>) -> Result<Vec<String>> {
        let mut runs = Vec::new();
        for entry in sorted_dir(&self.root, "<root>")? {
            let raw = entry.path.join(RAW_DIR);
            if !raw.is_dir() {
                continue;
            }
            if let Some(after) = after_timestamp_ms {
                let touched = raw
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);
                if touched <= after {
                    continue;
                }
            }
            runs.push(entry.name);
        }
        Ok(runs)
    }

    fn move_to_superseded(&self, key: &str) -> Result<()> {
        let source = self.absolute(key)?;
        let marker = format!("/{}/", RAW_DIR);
        let Some(position) = key.find(&marker) else {
            return Err(StorageError::InvalidRequest(format!(
                "{} is not under a {}/ directory",
                key, RAW_DIR
            )));
        };
        let dest_key = format!(
            "{}/{}/{}",
            &key[..position],
            SUPERSEDED_DIR,
            &key[position + marker.len()..]
        );
        let dest = self.absolute(&dest_key)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| Self::io(&dest_key, e))?;
        }
        fs::rename(&source, &dest).map_err(|e| Self::io(key, e))?;
        warn!("superseded {} -> {}", key, dest_key);
        Ok(())
    }
}

/// Sentinel protocol error used to stop iteration on a consumer error.
fn halt_iteration() -> ProtocolError {
    ProtocolError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        "consumer aborted iteration",
    ))
}

fn finish_iteration(
    key: &str,
    result: evochora_protocol::Result<()>,
    caller_error: Option<StorageError>,
) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(_) if caller_error.is_some() => Err(caller_error.expect("checked above")),
        Err(ProtocolError::Io(source)) => Err(StorageError::Io {
            key: key.to_owned(),
            source,
        }),
        Err(source) => Err(StorageError::Corrupt {
            key: key.to_owned(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{read_message, write_message};
    use evochora_protocol::{SimulationMetadata, TickData};
    use tempfile::TempDir;

    fn chunk(run_id: &str, first: i64, last: i64) -> TickDataChunk {
        TickDataChunk {
            simulation_run_id: run_id.into(),
            first_tick: first,
            last_tick: last,
            tick_count: (last - first + 1) as i32,
            snapshot: Some(TickData {
                tick_number: first,
                simulation_run_id: run_id.into(),
                ..Default::default()
            }),
            deltas: Vec::new(),
        }
    }

    fn storage(dir: &TempDir) -> FilesystemStorage {
        FilesystemStorage::new(dir.path(), Compression::Zstd, 3).unwrap()
    }

    fn write_batch(storage: &FilesystemStorage, run: &str, first: i64, last: i64) -> WriteResult {
        let mid = (first + last) / 2;
        let mut chunks = vec![chunk(run, first, mid), chunk(run, mid + 1, last)].into_iter();
        storage.write_chunk_batch_streaming(&mut chunks).unwrap()
    }

    #[test]
    fn streamed_batches_round_trip() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let result = write_batch(&storage, "run-a", 0, 19);
        assert_eq!(result.first_tick, 0);
        assert_eq!(result.last_tick, 19);
        assert_eq!(result.chunk_count, 2);
        assert!(result.path.ends_with(&format!(
            "batch_{:019}_{:019}.pb.zst",
            0, 19
        )));

        let chunks = storage.read_all_chunks(&result.path).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].first_tick, 0);
        assert_eq!(chunks[1].last_tick, 19);
    }

    #[test]
    fn no_temp_files_survive_a_write() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        write_batch(&storage, "run-a", 0, 9);
        let mut stack = vec![dir.path().to_path_buf()];
        while let Some(current) = stack.pop() {
            for entry in fs::read_dir(current).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    assert_ne!(path.extension().unwrap(), "tmp", "{:?}", path);
                }
            }
        }
    }

    #[test]
    fn duplicate_first_ticks_resolve_to_the_smaller_range() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        write_batch(&storage, "run-a", 0, 9);
        // a crashed writer left a wider file for the same first tick
        write_batch(&storage, "run-a", 0, 19);

        let listing = storage
            .list_batch_files("run-a", None, 10, None, None, SortOrder::Ascending)
            .unwrap();
        assert_eq!(listing.paths.len(), 1);
        assert!(listing.paths[0].contains(&format!("batch_{:019}_{:019}", 0, 9)));
        assert!(listing.next_token.is_none());
    }

    #[test]
    fn listing_filters_ranges_and_paginates() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        for start in [0i64, 10, 20, 30] {
            write_batch(&storage, "run-a", start, start + 9);
        }

        let page = storage
            .list_batch_files("run-a", None, 2, None, None, SortOrder::Ascending)
            .unwrap();
        assert_eq!(page.paths.len(), 2);
        let token = page.next_token.clone().expect("more pages remain");
        let rest = storage
            .list_batch_files("run-a", Some(&token), 10, None, None, SortOrder::Ascending)
            .unwrap();
        assert_eq!(rest.paths.len(), 2);
        assert!(rest.next_token.is_none());

        let ranged = storage
            .list_batch_files("run-a", None, 10, Some(12), Some(25), SortOrder::Ascending)
            .unwrap();
        assert_eq!(ranged.paths.len(), 2, "{:?}", ranged.paths);

        let newest_first = storage
            .list_batch_files("run-a", None, 1, None, None, SortOrder::Descending)
            .unwrap();
        assert!(newest_first.paths[0].contains(&format!("batch_{:019}", 30)));
    }

    #[test]
    fn find_last_batch_file_walks_backwards() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        write_batch(&storage, "run-a", 0, 999);
        // lands in a different group directory (ggg/hhh split at 1k)
        write_batch(&storage, "run-a", 1_000, 1_999);
        write_batch(&storage, "run-a", 2_000_000, 2_000_009);

        let last = storage.find_last_batch_file("run-a").unwrap().unwrap();
        assert!(last.contains(&format!("batch_{:019}", 2_000_000)));
        assert!(last.starts_with("run-a/raw/002/000/"));

        assert_eq!(storage.find_last_batch_file("other").unwrap(), None);
    }

    #[test]
    fn superseded_files_leave_the_listing_but_not_the_disk() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let a = write_batch(&storage, "run-a", 0, 9);
        write_batch(&storage, "run-a", 10, 19);

        storage.move_to_superseded(&a.path).unwrap();
        let listing = storage.list_all_batch_files("run-a").unwrap();
        assert_eq!(listing.len(), 1);
        let moved = a.path.replacen("/raw/", "/superseded/", 1);
        assert!(dir.path().join(moved).is_file());
    }

    #[test]
    fn metadata_round_trips_with_compression() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let metadata = SimulationMetadata {
            run_id: "run-a".into(),
            shape: vec![10, 10, 10],
            topology: 0,
            started_at_ms: 123,
            snapshot_interval: 100,
            chunk_interval: 100,
        };
        let key = metadata_key("run-a", Compression::Zstd);
        write_message(&storage, &key, &metadata).unwrap();

        assert_eq!(storage.find_metadata_path("run-a").unwrap(), Some(key.clone()));
        let read: SimulationMetadata = read_message(&storage, &key).unwrap();
        assert_eq!(read, metadata);
    }

    #[test]
    fn hostile_keys_are_rejected_everywhere() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        assert!(matches!(
            storage.read_message_bytes("../escape.pb"),
            Err(StorageError::InvalidKey { .. })
        ));
        assert!(matches!(
            storage.list_batch_files("run/../x", None, 1, None, None, SortOrder::Ascending),
            Err(StorageError::InvalidKey { .. })
        ));
        assert!(matches!(
            storage.list_batch_files("run-a", None, 0, None, None, SortOrder::Ascending),
            Err(StorageError::InvalidRequest(_))
        ));
    }

    #[test]
    fn list_run_ids_sees_only_populated_runs() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        write_batch(&storage, "run-a", 0, 9);
        write_batch(&storage, "run-b", 0, 9);
        fs::create_dir_all(dir.path().join("not-a-run")).unwrap();

        assert_eq!(
            storage.list_run_ids(None).unwrap(),
            vec!["run-a".to_owned(), "run-b".to_owned()]
        );
        // far future cutoff filters everything out
        let future = evochora_systemtime::unix_time_as_millis() + 3_600_000;
        assert!(storage.list_run_ids(Some(future)).unwrap().is_empty());
    }

    #[test]
    fn consumer_errors_propagate_without_corruption_flag() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let result = write_batch(&storage, "run-a", 0, 9);
        let outcome = storage.for_each_chunk(&result.path, ChunkFilter::All, &mut |_| {
            Err(StorageError::InvalidRequest("stop".into()))
        });
        assert!(matches!(outcome, Err(StorageError::InvalidRequest(_))));
    }
}
