//! Standalone CAN log decoder tool
//!
//! Streams the frames of an ASC/BLF/CSV log through the decoder and prints
//! every decoded sample, without building a store.
//!
//! Usage:
//!   decode_log <log_file> [--dbc <file.dbc>] [--limit <count>]
//!
//! Example:
//!   decode_log trace.asc --dbc powertrain.dbc --limit 100

use can_log_series::{
    decode_frame, load_dbc, open_frame_source, DecodeMode, DecoderError, LogInput,
};
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <log_file> [--dbc <file.dbc>] [--limit <count>]", args[0]);
        eprintln!("\nExample:");
        eprintln!("  {} trace.asc --dbc powertrain.dbc --limit 100", args[0]);
        std::process::exit(1);
    }

    let log_file = PathBuf::from(&args[1]);
    let mut dbc_file: Option<PathBuf> = None;
    let mut limit: Option<usize> = None;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--dbc" => {
                i += 1;
                dbc_file = args.get(i).map(PathBuf::from);
            }
            "--limit" => {
                i += 1;
                if let Some(value) = args.get(i) {
                    limit = Some(value.parse()?);
                }
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let mode = match &dbc_file {
        Some(path) => DecodeMode::from(load_dbc(path)?),
        None => DecodeMode::RawBytes,
    };

    let mut source = open_frame_source(LogInput::open(&log_file)?)?;
    let mut frames = 0usize;
    let mut malformed = 0usize;
    let mut samples_per_key: BTreeMap<String, usize> = BTreeMap::new();

    for item in source.by_ref() {
        let frame = match item {
            Ok(frame) => frame,
            Err(DecoderError::MalformedRecord { position, reason }) => {
                malformed += 1;
                eprintln!("Skipping record {}: {}", position, reason);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        frames += 1;

        let decoded = decode_frame(&frame, &mode);
        for (key, sample) in &decoded.samples {
            *samples_per_key.entry(key.clone()).or_insert(0) += 1;
            if limit.map_or(true, |max| frames <= max) {
                println!("[{:>12.6}] {:<40} = {}", sample.timestamp, key, sample.value);
            }
        }
        for diagnostic in &decoded.diagnostics {
            log::debug!("{}", diagnostic);
        }
    }

    println!("\n=== DECODING SUMMARY ===");
    println!("Frames: {}", frames);
    println!("Malformed records: {}", malformed);
    println!("Series: {}", samples_per_key.len());
    for (key, count) in &samples_per_key {
        println!("  {}: {} samples", key, count);
    }

    Ok(())
}
