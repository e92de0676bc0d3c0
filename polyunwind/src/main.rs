use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use polyunwind::cli::{Cli, Command};
use polyunwind::replay::{read_records, ReplayRecord};

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Command::Replay { path, json, quiet } => {
            info!("decoding event stream: {}", path.display());
            let records = read_records(&path)
                .with_context(|| format!("failed to decode {}", path.display()))?;

            for record in &records {
                if json {
                    println!("{}", serde_json::to_string(record)?);
                } else {
                    print_record(record);
                }
            }

            if !quiet {
                println!("-- {} record(s)", records.len());
            }
        }
    }

    Ok(())
}

fn print_record(record: &ReplayRecord) {
    match record {
        ReplayRecord::Pid { pid, event_type } => {
            println!("pid={pid} event_type={event_type}");
        }
        ReplayRecord::Munmap { pid, addr } => {
            println!("pid={pid} munmap addr=0x{addr:x}");
        }
    }
}
