//! stackrun CLI: multi-module infrastructure stack orchestration.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "stackrun",
    version,
    about = "Run provisioning commands across a stack of dependent infrastructure modules"
)]
struct Cli {
    /// Stack root directory
    #[arg(long, global = true, default_value = ".")]
    working_dir: PathBuf,

    /// Log progress at info level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: stackrun::cli::Commands,
}

fn main() {
    let cli = Cli::parse();
    stackrun::logging::init(cli.verbose);
    match stackrun::cli::dispatch(cli.command, &cli.working_dir) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    }
}
