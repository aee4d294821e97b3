//! Evochora executable entry points.

mod cli;
mod subcommand;

use evochora_logger::error;

/// Runs the CLI and returns the process exit code.
pub fn run_app() -> i32 {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();

    let matches = cli::build_cli().get_matches();
    let outcome = match matches.subcommand() {
        Some((cli::CMD_RUN, matches)) => subcommand::run::exec(matches),
        Some((cli::CMD_INSPECT, matches)) => subcommand::inspect::exec(matches),
        Some((cli::CMD_CLEANUP, matches)) => subcommand::cleanup::exec(matches),
        _ => unreachable!("clap enforces a known subcommand"),
    };
    match outcome {
        Ok(()) => 0,
        Err(error) => {
            error!("{}", error);
            1
        }
    }
}
