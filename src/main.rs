use clap::Parser;
use log::debug;

use unchained::cli::{self, Cli};

fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let args = Cli::parse();
    debug!("Running {:?} against {}", args.command, args.data_dir.display());

    cli::run(args)
}
