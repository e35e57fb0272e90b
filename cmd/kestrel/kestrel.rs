//! Kestrel entrypoint: parse the command line, set up tracing, and run
//! demo programs through the VM.

mod cli;
mod demos;
mod initializers;

use clap::Parser;

use crate::cli::CLI;
use crate::initializers::init_tracing;

fn main() -> eyre::Result<()> {
    let cli = CLI::parse();
    init_tracing(&cli.opts);
    match cli.command {
        Some(command) => command.run(&cli.opts),
        None => demos::run_all(&cli.opts),
    }
}
