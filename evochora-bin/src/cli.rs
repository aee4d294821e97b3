//! Command line definitions.

use clap::{Arg, ArgAction, Command};

pub const CMD_RUN: &str = "run";
pub const CMD_INSPECT: &str = "inspect";
pub const CMD_CLEANUP: &str = "cleanup";

pub fn build_cli() -> Command {
    Command::new("evochora")
        .about("Evochora artificial-life simulation platform")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .global(true)
                .value_name("FILE")
                .help("Path to the TOML configuration file"),
        )
        .subcommand(
            Command::new(CMD_RUN)
                .about("Run a simulation and persist its tick stream")
                .arg(
                    Arg::new("run-id")
                        .long("run-id")
                        .value_name("ID")
                        .help("Run identifier; generated from the clock when omitted"),
                )
                .arg(
                    Arg::new("ticks")
                        .long("ticks")
                        .value_name("N")
                        .default_value("1000")
                        .value_parser(clap::value_parser!(u64))
                        .help("Number of ticks to execute"),
                )
                .arg(
                    Arg::new("with-indexer")
                        .long("with-indexer")
                        .action(ArgAction::SetTrue)
                        .help("Run an in-process cell indexer alongside the simulation"),
                ),
        )
        .subcommand(
            Command::new(CMD_INSPECT)
                .about("Inspect stored runs")
                .subcommand_required(true)
                .subcommand(
                    Command::new("storage")
                        .about("Report batch inventory and tick coverage for a run")
                        .arg(
                            Arg::new("run-id")
                                .long("run-id")
                                .value_name("ID")
                                .required(true)
                                .help("Run to inspect"),
                        ),
                ),
        )
        .subcommand(
            Command::new(CMD_CLEANUP)
                .about("Supersede old batch files; nothing is ever deleted")
                .arg(
                    Arg::new("run-id")
                        .long("run-id")
                        .value_name("ID")
                        .required(true)
                        .help("Run to clean up"),
                )
                .arg(
                    Arg::new("keep")
                        .long("keep")
                        .value_name("N")
                        .value_parser(clap::value_parser!(usize))
                        .conflicts_with("delete")
                        .help("Keep the newest N batch files, supersede the rest"),
                )
                .arg(
                    Arg::new("delete")
                        .long("delete")
                        .action(ArgAction::SetTrue)
                        .conflicts_with("keep")
                        .help("Supersede every batch file of the run"),
                )
                .arg(
                    Arg::new("compact")
                        .long("compact")
                        .action(ArgAction::SetTrue)
                        .help("Supersede stale duplicates left behind by crashed writers"),
                )
                .arg(
                    Arg::new("force")
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("Apply the changes; without this flag the command only reports"),
                ),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_and_delete_are_mutually_exclusive() {
        let result = build_cli().try_get_matches_from([
            "evochora", "cleanup", "--run-id", "r", "--keep", "3", "--delete",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn run_defaults_parse() {
        let matches = build_cli()
            .try_get_matches_from(["evochora", "run", "-c", "conf.toml"])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, CMD_RUN);
        assert_eq!(sub.get_one::<u64>("ticks"), Some(&1000));
    }
}
