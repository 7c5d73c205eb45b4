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

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::PathBuf;

use bytes::{Bytes, BytesMut};
use clap::{Parser, Subcommand};
use stonelog::log::{OffsetIndexEntry, TimeIndexEntry, INDEX_ENTRY_SIZE};
use stonelog::message::constants::RECORD_BATCH_OVERHEAD;
use stonelog::message::{BatchHeader, LogRecordBatch};
use stonelog::AppResult;

/// Dumps commit log segment files.
#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every batch of a `.log` file
    Log {
        #[arg(short, long)]
        file: PathBuf,
        /// also print record payloads
        #[arg(short, long)]
        records: bool,
    },
    /// Print a `.index` file
    Index {
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Print a `.timeindex` file
    TimeIndex {
        #[arg(short, long)]
        file: PathBuf,
    },
}

fn main() -> AppResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Log { file, records } => parse_log(file, *records),
        Commands::Index { file } => parse_index(file),
        Commands::TimeIndex { file } => parse_time_index(file),
    }
}

fn parse_log(file: &PathBuf, print_records: bool) -> AppResult<()> {
    let mut reader = BufReader::new(File::open(file)?);
    let mut position = 0u64;
    let mut header_bytes = [0u8; RECORD_BATCH_OVERHEAD];

    loop {
        match reader.read_exact(&mut header_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                println!("end of file at position {}", position);
                break;
            }
            Err(e) => return Err(e.into()),
        }
        let header = BatchHeader::parse(&header_bytes)?;
        let mut frame = BytesMut::zeroed(header.frame_size());
        frame[..RECORD_BATCH_OVERHEAD].copy_from_slice(&header_bytes);
        if let Err(e) = reader.read_exact(&mut frame[RECORD_BATCH_OVERHEAD..]) {
            if e.kind() == ErrorKind::UnexpectedEof {
                println!("torn batch at position {}: {}", position, header);
                break;
            }
            return Err(e.into());
        }

        println!("position: {} {}", position, header);
        if print_records {
            let batch = LogRecordBatch::read_batch(&mut Bytes::from(frame))?;
            for record in batch.records() {
                println!(
                    "    offset: {} timestamp: {} payload: {}",
                    record.offset,
                    record.timestamp,
                    String::from_utf8_lossy(&record.payload)
                );
            }
        } else {
            header.verify_crc(&frame)?;
        }
        position += header.frame_size() as u64;
    }
    Ok(())
}

fn read_entries(file: &PathBuf) -> AppResult<Vec<[u8; INDEX_ENTRY_SIZE]>> {
    let mut reader = BufReader::new(File::open(file)?);
    let mut entries = Vec::new();
    let mut entry = [0u8; INDEX_ENTRY_SIZE];
    loop {
        match reader.read_exact(&mut entry) {
            Ok(()) => entries.push(entry),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(entries)
}

fn parse_index(file: &PathBuf) -> AppResult<()> {
    for entry in read_entries(file)? {
        let entry = OffsetIndexEntry::decode(&entry)?;
        println!(
            "relative offset: {}, position: {}",
            entry.relative_offset, entry.file_position
        );
    }
    Ok(())
}

fn parse_time_index(file: &PathBuf) -> AppResult<()> {
    for entry in read_entries(file)? {
        let entry = TimeIndexEntry::decode(&entry)?;
        println!(
            "timestamp: {}, relative offset: {}",
            entry.timestamp, entry.relative_offset
        );
    }
    Ok(())
}
