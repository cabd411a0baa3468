//! Log file format parsers (ASC, BLF, CSV)
//!
//! This module contains readers for the supported CAN log formats. Each
//! reader is an iterator over `Result<Frame>`: malformed records surface as
//! recoverable [`DecoderError::MalformedRecord`] items, read failures as
//! [`DecoderError::IoError`].

use crate::types::{DecoderError, Frame, Result};
use chrono::NaiveDateTime;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

pub mod asc;
pub mod blf;
pub mod csv;

pub use asc::AscFrameIterator;
pub use blf::BlfFrameIterator;
pub use self::csv::CsvFrameIterator;

/// Supported log file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Vector ASC text trace
    Asc,
    /// Vector BLF binary trace
    Blf,
    /// Tabular text (python-can CSV or an exported frame table)
    Csv,
}

impl LogFormat {
    /// Determine the format from a file extension (case-insensitive)
    pub fn from_extension(extension: &str) -> Result<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "asc" => Ok(LogFormat::Asc),
            "blf" => Ok(LogFormat::Blf),
            "csv" => Ok(LogFormat::Csv),
            other => Err(DecoderError::UnsupportedFormat(format!(".{}", other))),
        }
    }

    /// Determine the format from a file path
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path.extension().and_then(|s| s.to_str()).ok_or_else(|| {
            DecoderError::UnsupportedFormat(format!("no extension on {:?}", path))
        })?;
        Self::from_extension(extension)
    }

    /// True for line-oriented formats
    pub fn is_text(&self) -> bool {
        matches!(self, LogFormat::Asc | LogFormat::Csv)
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Asc => write!(f, "ASC"),
            LogFormat::Blf => write!(f, "BLF"),
            LogFormat::Csv => write!(f, "CSV"),
        }
    }
}

/// An opened log, ready to be turned into a frame source
pub struct LogInput {
    pub format: LogFormat,
    pub reader: Box<dyn BufRead + Send>,
    /// Best-effort total frame count, used only for progress
    pub estimated_frames: Option<u64>,
}

impl LogInput {
    /// Wrap a caller-supplied byte stream
    pub fn from_reader(format: LogFormat, reader: impl BufRead + Send + 'static) -> Self {
        Self {
            format,
            reader: Box::new(reader),
            estimated_frames: None,
        }
    }

    /// Builder method: supply a frame count estimate
    pub fn with_estimate(mut self, estimated_frames: u64) -> Self {
        self.estimated_frames = Some(estimated_frames);
        self
    }

    /// Open a log file. The format comes from the extension; for text formats
    /// the line count serves as the progress estimate.
    pub fn open(path: &Path) -> Result<Self> {
        let format = LogFormat::from_path(path)?;
        log::info!("Opening {} log file: {:?}", format, path);

        let file = File::open(path)?;
        let estimated_frames = if format.is_text() {
            count_lines(path)
        } else {
            None
        };

        Ok(Self {
            format,
            reader: Box::new(BufReader::new(file)),
            estimated_frames,
        })
    }
}

impl fmt::Debug for LogInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogInput")
            .field("format", &self.format)
            .field("estimated_frames", &self.estimated_frames)
            .finish_non_exhaustive()
    }
}

/// Count lines of a text file; `None` if it cannot be read
fn count_lines(path: &Path) -> Option<u64> {
    let file = File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    let mut count = 0u64;
    loop {
        let buf = reader.fill_buf().ok()?;
        if buf.is_empty() {
            break;
        }
        count += buf.iter().filter(|&&b| b == b'\n').count() as u64;
        let consumed = buf.len();
        reader.consume(consumed);
    }
    Some(count)
}

/// Common interface of all frame readers
pub trait FrameSource: Iterator<Item = Result<Frame>> + Send {
    /// Best-effort total number of frames (progress reporting only)
    fn estimated_total(&self) -> Option<u64>;

    /// Measurement start as recorded in the log header, if any
    fn measurement_start(&self) -> Option<NaiveDateTime> {
        None
    }
}

/// Create the frame source matching the input's format
pub fn open_frame_source(input: LogInput) -> Result<Box<dyn FrameSource>> {
    log::debug!("Creating {} frame source", input.format);
    match input.format {
        LogFormat::Asc => Ok(Box::new(AscFrameIterator::new(
            input.reader,
            input.estimated_frames,
        ))),
        LogFormat::Blf => Ok(Box::new(BlfFrameIterator::open(
            input.reader,
            input.estimated_frames,
        )?)),
        LogFormat::Csv => Ok(Box::new(CsvFrameIterator::open(
            input.reader,
            input.estimated_frames,
        )?)),
    }
}

/// Parse a hex token such as `1F`, `0x1F` or `1Fx`
pub(crate) fn parse_hex_u32(token: &str) -> Option<u32> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    u32::from_str_radix(digits, 16).ok()
}

/// Data length for a CAN FD DLC code
pub(crate) fn dlc_to_len(dlc: u8) -> usize {
    match dlc {
        0..=8 => dlc as usize,
        9 => 12,
        10 => 16,
        11 => 20,
        12 => 24,
        13 => 32,
        14 => 48,
        _ => 64,
    }
}
