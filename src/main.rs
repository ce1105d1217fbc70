use anyhow::Result;
use clap::Parser;
use colored::*;

use ovlink::cli::{self, Cli};

fn main() {
    if let Err(e) = run() {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    cli::init_logging(cli.verbose, cli.quiet);

    // The emulated device is a single hart; host commands get the full pool.
    let runtime = if cli.is_device() {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
    } else {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
    };
    runtime.block_on(cli::run(cli))
}
