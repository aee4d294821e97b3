//! The `inspect storage` subcommand: batch inventory and tick coverage.

use super::{load_config, ExecError, Result};
use clap::ArgMatches;
use evochora_storage::path::parse_batch_file_name;
use evochora_storage::{FilesystemStorage, StorageResource};

pub fn exec(matches: &ArgMatches) -> Result<()> {
    let Some(("storage", sub)) = matches.subcommand() else {
        return Err(ExecError("unknown inspect target".to_owned()));
    };
    let config = load_config(matches)?;
    let run_id = sub.get_one::<String>("run-id").expect("required");

    let storage = FilesystemStorage::from_config(&config.storage)?;
    let paths = storage.list_all_batch_files(run_id)?;
    if paths.is_empty() {
        return Err(ExecError(format!("run {} has no batch files", run_id)));
    }

    println!("run:        {}", run_id);
    match storage.find_metadata_path(run_id)? {
        Some(metadata) => println!("metadata:   {}", metadata),
        None => println!("metadata:   (missing)"),
    }
    println!("batches:    {}", paths.len());

    let mut covered = 0i64;
    let mut gaps = Vec::new();
    let mut previous_last: Option<i64> = None;
    let mut first_tick = i64::MAX;
    let mut last_tick = i64::MIN;
    for path in &paths {
        let name = path.rsplit('/').next().unwrap_or(path);
        let Some(parsed) = parse_batch_file_name(name) else {
            continue;
        };
        covered += parsed.last_tick - parsed.first_tick + 1;
        first_tick = first_tick.min(parsed.first_tick);
        last_tick = last_tick.max(parsed.last_tick);
        if let Some(previous) = previous_last {
            if parsed.first_tick != previous + 1 {
                gaps.push((previous, parsed.first_tick));
            }
        }
        previous_last = Some(parsed.last_tick);
    }
    println!("ticks:      {}..={} ({} covered)", first_tick, last_tick, covered);
    if gaps.is_empty() {
        println!("coverage:   contiguous");
    } else {
        println!("coverage:   {} gap(s)", gaps.len());
        for (after, next) in gaps {
            println!("  gap after tick {} (next batch starts at {})", after, next);
        }
    }
    Ok(())
}
