//! CAN Log Series Library
//!
//! Reads CAN bus logs (ASC, BLF, CSV), decodes them with an optional DBC
//! schema into per-signal time series, and prepares selections of those
//! series for plotting.
//!
//! # Architecture
//!
//! - Frame sources turn a byte stream into a sequence of raw frames
//! - The decoder turns each frame into `(key, sample)` pairs, either with a
//!   schema (`Message.Signal` keys) or byte-wise (`ID_0x123.Byte0` keys)
//! - A store builder accumulates frames and series and is frozen once the
//!   log has been read
//! - The preparation engine windows, normalizes and summarizes a selection
//!
//! The library does NOT render anything. Plotting, styling and the
//! command-line front end live in the application layer (can-log-plot).
//!
//! # Example Usage
//!
//! ```no_run
//! use can_log_series::{
//!     ingest_input, load_dbc, prepare, DecodeMode, IngestConfig, LogInput, TimeWindow,
//! };
//! use std::path::Path;
//! use std::sync::atomic::AtomicBool;
//!
//! let schema = load_dbc(Path::new("powertrain.dbc")).unwrap();
//! let input = LogInput::open(Path::new("trace.asc")).unwrap();
//!
//! let store = ingest_input(
//!     input,
//!     DecodeMode::from(schema),
//!     &IngestConfig::new(),
//!     &mut |percent| println!("{}%", percent),
//!     &AtomicBool::new(false),
//! )
//! .unwrap();
//!
//! let window = TimeWindow::new(0.0, 10.0).unwrap();
//! let prepared = prepare(&store, &["Engine.RPM"], Some(window), true).unwrap();
//! for (key, series) in &prepared.series {
//!     println!("{}: {:?}", key, series.stats);
//! }
//! ```

// Public modules
pub mod config;
pub mod decoder;
pub mod export;
pub mod formats;
pub mod message_decoder;
pub mod prepare;
pub mod signals;
pub mod store;
pub mod types;
pub mod worker;

// Re-export main types for convenience
pub use config::IngestConfig;
pub use decoder::{decode, decode_frame, raw_byte_key, DecodeMode, FrameDecode};
pub use export::{write_frame_table, write_series_table};
pub use formats::{open_frame_source, FrameSource, LogFormat, LogInput};
pub use prepare::{prepare, PreparedSelection, PreparedSeries, SeriesStats, TimeWindow};
pub use signals::{
    load_dbc, strip_display_prefix, MessageSchema, SchemaAdapter, SignalSchema,
    MULTIPLEXED_PREFIX,
};
pub use store::{ingest, ingest_input, IngestReport, Series, SeriesStore, SeriesStoreBuilder};
pub use types::{
    DecoderError, Diagnostic, DiagnosticKind, Frame, Result, Sample, MAX_PAYLOAD_LEN,
};
pub use worker::{spawn_ingest, spawn_prepare, IngestEvent, IngestRequest, Session};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
