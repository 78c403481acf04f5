//! gemmtune command-line entry point.

use anyhow::Result;
use clap::Parser;
use gemmtune_session::cli::{run_cli, Cli};

fn main() -> Result<()> {
    run_cli(Cli::parse())
}
