pub mod cleanup;
pub mod inspect;
pub mod run;

use clap::ArgMatches;
use evochora_app_config::AppConfig;
use std::fmt;
use std::path::Path;

/// Uniform failure type for subcommands; the message is what the operator
/// sees on stderr.
#[derive(Debug)]
pub struct ExecError(pub String);

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<E: std::error::Error> From<E> for ExecError {
    fn from(error: E) -> Self {
        ExecError(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ExecError>;

/// Loads the configuration file named by `-c/--config`.
pub fn load_config(matches: &ArgMatches) -> Result<AppConfig> {
    let path = matches
        .get_one::<String>("config")
        .ok_or_else(|| ExecError("missing -c/--config".to_owned()))?;
    Ok(evochora_app_config::load(Path::new(path))?)
}
