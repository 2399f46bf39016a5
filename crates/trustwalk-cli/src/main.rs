//! trustwalk - verify signed git history
//!
//! Walks first-parent history from a commit down to a trusted root, checking
//! signatures, recorded tree digests and merge cleanliness on the way.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

use commands::{GlobalArgs, tree_digest, verify};

/// trustwalk - verify that every commit down to a trusted root is signed
#[derive(Parser, Debug)]
#[command(name = "trustwalk")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(flatten)]
    verify: verify::VerifyArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the `Tree-SHA512:` line for a commit
    TreeDigest(tree_digest::TreeDigestArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&cli.global.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let exit_code = match &cli.command {
        Some(Commands::TreeDigest(args)) => tree_digest::run_tree_digest(&cli.global, args),
        None => verify::run_verify(&cli.global, &cli.verify),
    };
    std::process::exit(i32::from(exit_code));
}
