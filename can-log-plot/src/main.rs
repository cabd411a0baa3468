//! CAN Log Plot CLI Application
//!
//! Command-line front end for the can-log-series library:
//! - Load a log (ASC, BLF, CSV) and an optional DBC
//! - List the selectable signals
//! - Prepare a selection with an optional time window and normalization
//! - Print statistics (text or JSON) and export CSV tables

use anyhow::{bail, Context, Result};
use can_log_series::{
    load_dbc, write_frame_table, write_series_table, DecodeMode, DiagnosticKind,
    PreparedSelection, SchemaAdapter, SeriesStats, SeriesStore, Session, TimeWindow,
};
use clap::Parser;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod config;

use config::{AppConfig, SignalSelection};

/// CAN Log Plot - Decode CAN logs into signal series
#[derive(Parser, Debug)]
#[command(name = "can-log-plot")]
#[command(about = "Decode CAN log files (ASC, BLF, CSV) into signal series", long_about = None)]
#[command(version)]
struct Args {
    /// Path to ASC/BLF/CSV log file
    #[arg(short, long, value_name = "FILE")]
    log: Option<PathBuf>,

    /// Path to DBC file
    #[arg(long, value_name = "FILE")]
    dbc: Option<PathBuf>,

    /// Signal to prepare (can be repeated; "all" selects every signal)
    #[arg(short, long, value_name = "KEY")]
    signal: Vec<String>,

    /// Window start in seconds
    #[arg(long, value_name = "SECONDS")]
    start: Option<f64>,

    /// Window end in seconds
    #[arg(long, value_name = "SECONDS")]
    end: Option<f64>,

    /// Scale each series to [0, 1]
    #[arg(short, long)]
    normalize: bool,

    /// List selectable signals and exit
    #[arg(long)]
    list_signals: bool,

    /// Export the frame table as CSV
    #[arg(long, value_name = "FILE")]
    frames_out: Option<PathBuf>,

    /// Export the prepared series as CSV
    #[arg(long, value_name = "FILE")]
    series_out: Option<PathBuf>,

    /// Print statistics as JSON
    #[arg(long)]
    json: bool,

    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Maximum number of frames to ingest
    #[arg(long, value_name = "COUNT")]
    max_frames: Option<usize>,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

/// JSON view of a prepared selection (values omitted)
#[derive(Debug, Serialize)]
struct SelectionSummary<'a> {
    window: TimeWindow,
    window_substituted: bool,
    missing_keys: &'a [String],
    series: BTreeMap<&'a str, SeriesSummary>,
}

#[derive(Debug, Serialize)]
struct SeriesSummary {
    samples: usize,
    stats: Option<SeriesStats>,
}

impl<'a> From<&'a PreparedSelection> for SelectionSummary<'a> {
    fn from(selection: &'a PreparedSelection) -> Self {
        Self {
            window: selection.window,
            window_substituted: selection.window_substituted,
            missing_keys: &selection.missing_keys,
            series: selection
                .series
                .iter()
                .map(|(key, series)| {
                    (
                        key.as_str(),
                        SeriesSummary {
                            samples: series.len(),
                            stats: series.stats,
                        },
                    )
                })
                .collect(),
        }
    }
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("CAN Log Plot CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using series library v{}", can_log_series::VERSION);

    let config = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => AppConfig::default(),
    };

    let Some(log_path) = args.log.clone().or_else(|| config.input.log.clone()) else {
        println!("CAN Log Plot - No input specified");
        println!("\nQuick Start:");
        println!("  can-log-plot --log trace.asc --list-signals");
        println!("  can-log-plot --log trace.blf --dbc signals.dbc --signal Engine.RPM");
        println!("  can-log-plot --config config.toml");
        println!("\nUse --help for more options");
        return Ok(());
    };

    run(&args, &config, &log_path)
}

fn run(args: &Args, config: &AppConfig, log_path: &Path) -> Result<()> {
    let schema = load_schema(args.dbc.as_ref().or(config.input.dbc.as_ref()));
    let mode = DecodeMode::from(schema.clone());

    // Ingest on the worker thread
    let mut session = Session::new();
    let ingest_config = config.filtering.ingest_config(args.max_frames);
    session.start_ingest(log_path.to_path_buf(), mode, ingest_config)?;
    let store = session
        .wait_ingest(|percent| log::info!("Loading {:?}: {}%", log_path, percent))
        .with_context(|| format!("Failed to load log file {:?}", log_path))?;

    print_store_summary(&store);

    if args.list_signals {
        for key in signal_catalog(&store, schema.as_deref()) {
            println!("{}", key);
        }
        return Ok(());
    }

    if let Some(path) = args.frames_out.as_ref().or(config.output.frames_csv.as_ref()) {
        let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
        write_frame_table(BufWriter::new(file), store.frames())?;
        println!("Frame table written to {:?}", path);
    }

    let selection = if args.signal.is_empty() {
        config.signals.select.clone()
    } else if args.signal.len() == 1 && args.signal[0].eq_ignore_ascii_case("all") {
        SignalSelection::All(args.signal[0].clone())
    } else {
        SignalSelection::List(args.signal.clone())
    };
    if selection.is_empty() {
        log::info!("No signals selected; use --signal or --list-signals");
        return Ok(());
    }
    let keys = selection.resolve(store.keys());

    let window = resolve_window(
        args.start.or(config.plot.start),
        args.end.or(config.plot.end),
        store.time_range(),
    )?;
    let normalize = args.normalize || config.plot.normalize;

    session.start_prepare(keys, window, normalize)?;
    let prepared = session.wait_prepare().context("Failed to prepare signals")?;

    if prepared.window_substituted {
        println!(
            "No data in the requested window; showing full range [{:.3}, {:.3}]",
            prepared.window.start, prepared.window.end
        );
    }

    if args.json || config.output.json {
        println!("{}", serde_json::to_string_pretty(&SelectionSummary::from(&prepared))?);
    } else {
        print_selection(&prepared);
    }

    if let Some(path) = args.series_out.as_ref().or(config.output.series_csv.as_ref()) {
        let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
        write_series_table(BufWriter::new(file), &prepared)?;
        println!("Series written to {:?}", path);
    }

    Ok(())
}

/// A broken DBC does not stop the load; decoding falls back to raw bytes
fn load_schema(path: Option<&PathBuf>) -> Option<Arc<SchemaAdapter>> {
    let path = path?;
    match load_dbc(path) {
        Ok(schema) => {
            let stats = schema.stats();
            println!(
                "Loaded DBC {:?}: {} messages, {} signals",
                path, stats.num_messages, stats.num_signals
            );
            Some(Arc::new(schema))
        }
        Err(e) => {
            log::error!("{}", e);
            eprintln!("Error loading DBC, decoding raw bytes instead: {}", e);
            None
        }
    }
}

/// Keys to offer for selection: schema signals of the identifiers present,
/// or the raw byte series without a schema
fn signal_catalog(store: &SeriesStore, schema: Option<&SchemaAdapter>) -> Vec<String> {
    match schema {
        Some(schema) => schema.signal_catalog(&store.identifiers()),
        None => store.keys().map(str::to_string).collect(),
    }
}

/// Custom window from optional bounds; a missing bound defaults to the log range
fn resolve_window(
    start: Option<f64>,
    end: Option<f64>,
    log_range: Option<(f64, f64)>,
) -> Result<Option<TimeWindow>> {
    if start.is_none() && end.is_none() {
        return Ok(None);
    }
    let (log_start, log_end) = log_range.unwrap_or((0.0, 0.0));
    let start = start.unwrap_or(log_start);
    let end = end.unwrap_or(log_end);
    if start >= end {
        bail!("Window start ({}) must be before end ({})", start, end);
    }
    Ok(Some(TimeWindow::new(start, end)?))
}

fn print_store_summary(store: &SeriesStore) {
    let report = store.report();
    println!("Frames:  {}", store.frames().len());
    println!("Series:  {}", store.keys().count());
    if let Some((start, end)) = store.time_range() {
        println!("Range:   {:.6} .. {:.6} s", start, end);
    }
    if let Some(start) = report.measurement_start {
        println!("Started: {}", start);
    }
    if report.malformed_records > 0 {
        println!("Malformed records: {}", report.malformed_records);
    }
    if !report.unknown_identifiers.is_empty() {
        println!(
            "Unknown identifiers: {} ({} frames)",
            report.unknown_identifiers.len(),
            report.unknown_identifiers.values().sum::<u64>()
        );
    }
    let decode_failures = report.count(DiagnosticKind::SignalDecodeFailure);
    if decode_failures > 0 {
        println!("Signal decode failures: {}", decode_failures);
    }
}

fn print_selection(selection: &PreparedSelection) {
    println!(
        "\nWindow [{:.3}, {:.3}] s",
        selection.window.start, selection.window.end
    );
    println!("{:<40} {:>8} {:>14} {:>14} {:>14}", "Signal", "Samples", "Min", "Max", "Mean");
    for (key, series) in &selection.series {
        match series.stats {
            Some(stats) => println!(
                "{:<40} {:>8} {:>14.4} {:>14.4} {:>14.4}",
                key,
                series.len(),
                stats.min,
                stats.max,
                stats.mean
            ),
            None => println!("{:<40} {:>8}", key, series.len()),
        }
    }
    for key in &selection.missing_keys {
        println!("{:<40} not found", key);
    }
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
