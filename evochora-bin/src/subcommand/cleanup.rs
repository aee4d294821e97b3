//! The `cleanup` subcommand: supersede batch files. Nothing is deleted;
//! files move to the run's `superseded/` area.

use super::{load_config, ExecError, Result};
use clap::ArgMatches;
use evochora_storage::{FilesystemStorage, StorageResource};

pub fn exec(matches: &ArgMatches) -> Result<()> {
    let config = load_config(matches)?;
    let run_id = matches.get_one::<String>("run-id").expect("required");
    let keep = matches.get_one::<usize>("keep").copied();
    let delete = matches.get_flag("delete");
    let compact = matches.get_flag("compact");
    let force = matches.get_flag("force");

    if keep.is_none() && !delete && !compact {
        return Err(ExecError(
            "nothing to do: pass --keep N, --delete, or --compact".to_owned(),
        ));
    }

    let storage = FilesystemStorage::from_config(&config.storage)?;
    let mut victims: Vec<String> = Vec::new();
    if compact {
        victims.extend(storage.stale_duplicates(run_id)?);
    }
    if delete {
        victims.extend(storage.list_all_batch_files(run_id)?);
    } else if let Some(keep) = keep {
        let all = storage.list_all_batch_files(run_id)?;
        let cut = all.len().saturating_sub(keep);
        victims.extend(all.into_iter().take(cut));
    }
    victims.sort();
    victims.dedup();

    if victims.is_empty() {
        println!("run {}: nothing to supersede", run_id);
        return Ok(());
    }
    if !force {
        println!(
            "run {}: would supersede {} file(s); re-run with --force to apply",
            run_id,
            victims.len()
        );
        for victim in &victims {
            println!("  {}", victim);
        }
        return Ok(());
    }
    for victim in &victims {
        storage.move_to_superseded(victim)?;
    }
    println!("run {}: superseded {} file(s)", run_id, victims.len());
    Ok(())
}
