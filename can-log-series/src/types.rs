//! Core types for the CAN log series library
//!
//! This module defines the frame and sample types produced during ingestion,
//! the error type shared by every fallible operation, and the diagnostics
//! recorded for per-record and per-signal problems that do not abort a load.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for library operations
pub type Result<T> = std::result::Result<T, DecoderError>;

/// Maximum payload length of a CAN FD frame
pub const MAX_PAYLOAD_LEN: usize = 64;

/// Raw CAN frame from a log file (ASC, BLF, CSV)
///
/// This represents a single frame as read from the log file, before any
/// signal decoding. Frames are immutable once produced and kept in arrival
/// order; timestamps are not assumed to be sorted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Log-relative timestamp in seconds
    pub timestamp: f64,
    /// CAN message ID (11-bit or 29-bit)
    pub identifier: u32,
    /// Frame data bytes (0-8 bytes for classic CAN, up to 64 for CAN-FD)
    pub payload: Vec<u8>,
    /// Data length as declared by the log record
    pub declared_length: usize,
    /// 0-based bus channel
    pub channel: u16,
    /// True if this is a CAN-FD frame
    pub is_extended_datarate: bool,
    /// True if the CAN-FD bitrate switch was set
    pub bitrate_switch: bool,
    /// True if this is an extended (29-bit) CAN ID
    #[serde(default)]
    pub is_extended_id: bool,
    /// True if this is a remote frame
    #[serde(default)]
    pub is_remote: bool,
}

impl Frame {
    /// Create a classic CAN frame whose declared length matches its payload
    pub fn new(timestamp: f64, identifier: u32, payload: Vec<u8>) -> Self {
        let declared_length = payload.len();
        Self {
            timestamp,
            identifier,
            payload,
            declared_length,
            channel: 0,
            is_extended_datarate: false,
            bitrate_switch: false,
            is_extended_id: identifier > 0x7FF,
            is_remote: false,
        }
    }

    /// Builder method: set the bus channel
    pub fn with_channel(mut self, channel: u16) -> Self {
        self.channel = channel;
        self
    }

    /// Builder method: mark as CAN-FD with the given bitrate switch flag
    pub fn with_fd(mut self, bitrate_switch: bool) -> Self {
        self.is_extended_datarate = true;
        self.bitrate_switch = bitrate_switch;
        self
    }

    /// Payload rendered as space-separated upper-case hex bytes
    pub fn payload_hex(&self) -> String {
        self.payload
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// One decoded value of one signal
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Timestamp of the frame the value was decoded from
    pub timestamp: f64,
    /// Physical (scaled) value, or the raw byte in schema-less mode
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: f64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Errors that can occur while loading, decoding or preparing data
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    #[error("Unsupported log file format: {0}")]
    UnsupportedFormat(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to load signal database: {0}")]
    SchemaLoadError(String),

    #[error("Malformed record at line/object {position}: {reason}")]
    MalformedRecord { position: u64, reason: String },

    #[error("No data available for selected signals")]
    NoDataForSelection,

    #[error("Invalid time window: start {start} must be before end {end}")]
    InvalidWindow { start: f64, end: f64 },

    #[error("Session busy: {0} already running")]
    Busy(&'static str),

    #[error("No {0} running")]
    Idle(&'static str),

    #[error("Operation cancelled")]
    Cancelled,
}

impl DecoderError {
    /// Create a malformed record error
    pub fn malformed(position: u64, reason: impl Into<String>) -> Self {
        DecoderError::MalformedRecord {
            position,
            reason: reason.into(),
        }
    }

    /// True if ingestion may continue after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DecoderError::MalformedRecord { .. })
    }
}

/// Kind of a non-fatal problem recorded during ingestion or preparation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosticKind {
    /// A single bad record in an otherwise valid log
    MalformedRecord,
    /// Frame identifier absent from the loaded schema
    UnknownIdentifier,
    /// One signal's bit range is invalid for a given frame
    SignalDecodeFailure,
    /// A decoded value was not a finite number
    NonNumericValue,
    /// A selected key has no stored series
    MissingSignalKey,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticKind::MalformedRecord => write!(f, "MalformedRecord"),
            DiagnosticKind::UnknownIdentifier => write!(f, "UnknownIdentifier"),
            DiagnosticKind::SignalDecodeFailure => write!(f, "SignalDecodeFailure"),
            DiagnosticKind::NonNumericValue => write!(f, "NonNumericValue"),
            DiagnosticKind::MissingSignalKey => write!(f, "MissingSignalKey"),
        }
    }
}

/// A recorded, non-fatal problem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// Timestamp of the affected frame, if any
    pub timestamp: Option<f64>,
    /// Identifier of the affected frame, if any
    pub identifier: Option<u32>,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            timestamp: None,
            identifier: None,
            message: message.into(),
        }
    }

    /// Attach the frame the diagnostic refers to
    pub fn for_frame(mut self, frame: &Frame) -> Self {
        self.timestamp = Some(frame.timestamp);
        self.identifier = Some(frame.identifier);
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.kind)?;
        if let Some(id) = self.identifier {
            write!(f, " 0x{:X}", id)?;
        }
        if let Some(ts) = self.timestamp {
            write!(f, " @{:.6}", ts)?;
        }
        write!(f, " {}", self.message)
    }
}
