use anyhow::Result;
use clap::Parser;
use telemetry_cache_cli::{run_cli, Cli};

fn main() -> Result<()> {
    run_cli(Cli::parse())
}
