//! Frame decoder
//!
//! Turns one raw frame into zero or more `(series key, sample)` pairs. The
//! decode path is chosen once per store build through [`DecodeMode`], so the
//! per-frame contract stays the same with or without a schema.

use crate::message_decoder::MessageDecoder;
use crate::signals::SchemaAdapter;
use crate::types::{Diagnostic, DiagnosticKind, Frame, Sample};
use std::sync::Arc;

/// How frames are turned into samples
#[derive(Debug, Clone)]
pub enum DecodeMode {
    /// Decode signals with a loaded schema
    SchemaDriven(Arc<SchemaAdapter>),
    /// No schema: one series per payload byte
    RawBytes,
}

impl DecodeMode {
    pub fn schema(&self) -> Option<&SchemaAdapter> {
        match self {
            DecodeMode::SchemaDriven(schema) => Some(schema),
            DecodeMode::RawBytes => None,
        }
    }
}

impl From<Option<Arc<SchemaAdapter>>> for DecodeMode {
    fn from(schema: Option<Arc<SchemaAdapter>>) -> Self {
        match schema {
            Some(schema) => DecodeMode::SchemaDriven(schema),
            None => DecodeMode::RawBytes,
        }
    }
}

impl From<SchemaAdapter> for DecodeMode {
    fn from(schema: SchemaAdapter) -> Self {
        DecodeMode::SchemaDriven(Arc::new(schema))
    }
}

/// Everything produced by decoding one frame
#[derive(Debug, Default)]
pub struct FrameDecode {
    pub samples: Vec<(String, Sample)>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Series key used for one payload byte in schema-less mode
pub fn raw_byte_key(identifier: u32, index: usize) -> String {
    format!("ID_0x{:X}.Byte{}", identifier, index)
}

/// Decode a frame, discarding diagnostics other than logging them
pub fn decode(frame: &Frame, mode: &DecodeMode) -> Vec<(String, Sample)> {
    let decoded = decode_frame(frame, mode);
    for diagnostic in &decoded.diagnostics {
        log::debug!("{}", diagnostic);
    }
    decoded.samples
}

/// Decode a frame and return samples together with diagnostics
pub fn decode_frame(frame: &Frame, mode: &DecodeMode) -> FrameDecode {
    match mode {
        DecodeMode::RawBytes => FrameDecode {
            samples: decode_raw_bytes(frame),
            diagnostics: Vec::new(),
        },
        DecodeMode::SchemaDriven(schema) => match schema.message_for(frame.identifier) {
            Some(message) => {
                log::trace!("Decoding message: {} (ID 0x{:X})", message.name, frame.identifier);
                let decoded = MessageDecoder::decode_message(frame, message);
                FrameDecode {
                    samples: decoded.samples,
                    diagnostics: decoded.diagnostics,
                }
            }
            None => {
                log::trace!("Unknown CAN ID: 0x{:X}", frame.identifier);
                FrameDecode {
                    samples: Vec::new(),
                    diagnostics: vec![Diagnostic::new(
                        DiagnosticKind::UnknownIdentifier,
                        "unknown identifier",
                    )
                    .for_frame(frame)],
                }
            }
        },
    }
}

fn decode_raw_bytes(frame: &Frame) -> Vec<(String, Sample)> {
    frame
        .payload
        .iter()
        .take(frame.declared_length)
        .enumerate()
        .map(|(i, byte)| {
            (
                raw_byte_key(frame.identifier, i),
                Sample::new(frame.timestamp, *byte as f64),
            )
        })
        .collect()
}
