//! CLI argument definitions.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "polyunwind",
    about = "Userland companion for the in-kernel unwinder",
    after_help = "\
EXAMPLES:
    polyunwind replay events.bin              Decode a captured event stream
    polyunwind replay events.bin --json       Emit one JSON object per record"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Decode a captured event stream for inspection.
    Replay {
        /// Path to a file of framed records captured from the ring buffer.
        path: PathBuf,

        /// Emit one JSON object per record instead of a human-readable line.
        #[arg(long)]
        json: bool,

        /// Suppress the summary line printed after the last record.
        #[arg(short, long)]
        quiet: bool,
    },
}
