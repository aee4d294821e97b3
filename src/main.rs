//! Evochora executable.

use std::process::exit;

fn main() {
    exit(evochora_bin::run_app())
}
