// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::{Path, PathBuf};

use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use tidemq::store::{
    decode_record, CqEntry, DecodeOutcome, DelayEnvelope, CQ_ENTRY_SIZE, DELAY_TOPIC,
};
use tidemq::{AppResult, CheckPointFile};

#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode the records of a commit log segment
    CommitLog {
        #[arg(short, long)]
        file: PathBuf,
        /// print message bodies
        #[arg(short, long)]
        body: bool,
    },
    /// Decode the entries of a consume queue file
    ConsumeQueue {
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Print a checkpoint or delay offset file
    Checkpoint {
        #[arg(short, long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> AppResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::CommitLog { file, body } => parse_commit_log(file, *body),
        Commands::ConsumeQueue { file } => parse_consume_queue(file),
        Commands::Checkpoint { file } => parse_checkpoint(file).await,
    }
}

fn base_offset(file: &Path) -> u64 {
    file.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.parse().ok())
        .unwrap_or(0)
}

fn format_timestamp(millis: u64) -> String {
    match Local.timestamp_millis_opt(millis as i64).single() {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => millis.to_string(),
    }
}

fn parse_commit_log(file: &Path, print_body: bool) -> AppResult<()> {
    let contents = std::fs::read(file)?;
    let base_offset = base_offset(file);
    println!("segment {} ({} bytes)", file.display(), contents.len());

    let mut pos = 0usize;
    let mut records = 0u64;
    while pos < contents.len() {
        match decode_record(&contents[pos..], true) {
            DecodeOutcome::Record(record) => {
                println!(
                    "offset: {} size: {} topic: {} queue: {} queue_offset: {} stored: {} delay_level: {}",
                    base_offset + pos as u64,
                    record.total_size,
                    record.topic,
                    record.queue_id,
                    record.queue_offset,
                    format_timestamp(record.store_timestamp),
                    record.delay_level
                );
                if record.topic == DELAY_TOPIC {
                    match DelayEnvelope::decode(record.body.clone()) {
                        Ok(envelope) => println!(
                            "    delayed for {}-{} due {}",
                            envelope.topic,
                            envelope.queue_id,
                            format_timestamp(envelope.due_timestamp)
                        ),
                        Err(e) => println!("    bad delay envelope: {}", e),
                    }
                }
                if print_body {
                    println!("    body: {}", String::from_utf8_lossy(&record.body));
                }
                pos += record.total_size as usize;
                records += 1;
            }
            DecodeOutcome::EndOfSegment => {
                println!("end marker at {}", base_offset + pos as u64);
                break;
            }
            DecodeOutcome::EndOfData => {
                println!("end of data at {}", base_offset + pos as u64);
                break;
            }
            DecodeOutcome::Corrupt(reason) => {
                println!("corrupt at {}: {}", base_offset + pos as u64, reason);
                break;
            }
        }
    }
    println!("{} records", records);
    Ok(())
}

fn parse_consume_queue(file: &Path) -> AppResult<()> {
    let contents = std::fs::read(file)?;
    let first_queue_offset = base_offset(file) / CQ_ENTRY_SIZE;
    let mut count = 0u64;
    for (i, chunk) in contents.chunks_exact(CQ_ENTRY_SIZE as usize).enumerate() {
        let entry = CqEntry::decode(chunk);
        if entry.is_empty() {
            break;
        }
        println!(
            "queue_offset: {} commit_log_offset: {} size: {} tag: {}",
            first_queue_offset + i as u64,
            entry.commit_log_offset,
            entry.size,
            entry.tag
        );
        count += 1;
    }
    println!("{} entries", count);
    Ok(())
}

async fn parse_checkpoint(file: &Path) -> AppResult<()> {
    let checkpoint = CheckPointFile::new(file);
    let points = checkpoint.read_checkpoints().await?;
    let mut names: Vec<_> = points.keys().collect();
    names.sort();
    for name in names {
        println!("{} {}", name, points[name]);
    }
    Ok(())
}
