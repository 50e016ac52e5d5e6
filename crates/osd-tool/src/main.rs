//! Object storage maintenance tool (osd-tool).
//!
//! Works directly on a storage directory while the daemon is stopped.
//!
//! # Usage
//!
//! ```text
//! osd-tool [OPTIONS] --dir <DIR> <COMMAND>
//!
//! Commands:
//!   files     List all files
//!   objects   List the objects of a file
//!   versions  Show the version table of a file
//!   size      Show the size of a file
//!   prune     Drop snapshots of a file
//!   delete    Delete a file
//!
//! Options:
//!   -d, --dir <DIR>                  Storage directory
//!   -L, --layout <LAYOUT>            Layout, read from the directory if omitted
//!   -s, --stripe-size <SIZE>         Stripe size of the files [default: 128K]
//!   -w, --width <WIDTH>              Stripe width of the files [default: 1]
//! ```

mod common;
mod file;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use osd_proto::defaults::DEFAULT_STRIPE_WIDTH;

use crate::common::{exit_error, open_engine, striping_policy};

/// Object storage maintenance tool.
///
/// Lists, inspects and prunes the files of one storage directory.
#[derive(Parser)]
#[command(name = "osd-tool", version, about = "Object storage maintenance tool")]
struct Cli {
    /// Storage directory
    #[arg(short = 'd', long)]
    dir: PathBuf,

    /// Storage layout (read from the directory if omitted)
    #[arg(short = 'L', long)]
    layout: Option<String>,

    /// Stripe size of the inspected files (K/M suffix allowed)
    #[arg(short = 's', long, default_value = "128K")]
    stripe_size: String,

    /// Stripe width of the inspected files
    #[arg(short = 'w', long, default_value_t = DEFAULT_STRIPE_WIDTH)]
    width: u32,

    /// Enable verbose/debug logging
    #[arg(short = 'v', long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all files
    Files,
    /// List the objects of a file
    Objects {
        /// File id
        file_id: String,
    },
    /// Show the version table of a file
    Versions {
        /// File id
        file_id: String,
    },
    /// Show the size of a file
    Size {
        /// File id
        file_id: String,
        /// Snapshot timestamp in milliseconds
        #[arg(long)]
        at: Option<u64>,
    },
    /// Drop every snapshot of a file that is not kept
    Prune {
        /// File id
        file_id: String,
        /// Snapshot timestamp to keep, can be given multiple times
        #[arg(long = "keep", value_name = "TS")]
        keep: Vec<u64>,
    },
    /// Delete a file with all its objects and versions
    Delete {
        /// File id
        file_id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let policy = striping_policy(&cli.stripe_size, cli.width);
    let engine = match open_engine(&cli.dir, cli.layout.as_deref()).await {
        Ok(engine) => engine,
        Err(e) => exit_error(&format!("Failed to open {}: {}", cli.dir.display(), e)),
    };

    match cli.command {
        Commands::Files => {
            file::file_list(&engine, policy).await;
        }
        Commands::Objects { file_id } => {
            file::object_list(&engine, policy, &file_id).await;
        }
        Commands::Versions { file_id } => {
            file::version_list(&engine, policy, &file_id).await;
        }
        Commands::Size { file_id, at } => {
            file::file_size(&engine, policy, &file_id, at).await;
        }
        Commands::Prune { file_id, keep } => {
            file::prune(&engine, policy, &file_id, keep).await;
        }
        Commands::Delete { file_id } => {
            file::delete(&engine, &file_id).await;
        }
    }
}
