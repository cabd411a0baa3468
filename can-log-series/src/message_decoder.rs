//! Message Decoding Engine
//!
//! Extracts signal values from raw CAN payloads based on signal definitions
//! from the schema. Handles bit extraction, endianness, multiplexing, and
//! physical value conversion.
//!
//! Multiplexed messages are decoded in two phases: the multiplexer's raw
//! value is resolved first, then the candidate signals are filtered by a
//! membership test on their `multiplexer_values`. Unconditional signals (empty
//! `multiplexer_values`) are always decoded.

use crate::signals::database::{ByteOrder, MessageSchema, SignalSchema};
use crate::types::{Diagnostic, DiagnosticKind, Frame, Sample};
use std::fmt;

/// Why a single signal could not be extracted from a payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    /// The signal's bit range reaches past the end of the payload
    OutOfRange {
        signal: String,
        required_bytes: usize,
        available_bytes: usize,
    },
    /// Bit length outside 1..=64
    InvalidLength { signal: String, bit_length: u16 },
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractError::OutOfRange {
                signal,
                required_bytes,
                available_bytes,
            } => write!(
                f,
                "Signal '{}' requires {} bytes but frame only has {} bytes",
                signal, required_bytes, available_bytes
            ),
            ExtractError::InvalidLength { signal, bit_length } => {
                write!(f, "Signal '{}' has unsupported bit length {}", signal, bit_length)
            }
        }
    }
}

/// Result of decoding one frame against one message definition
#[derive(Debug, Default)]
pub struct MessageDecode {
    /// (series key, sample) pairs in signal definition order
    pub samples: Vec<(String, Sample)>,
    /// Per-signal problems; never fatal for the frame
    pub diagnostics: Vec<Diagnostic>,
    /// Active multiplexer value (if the message is multiplexed and resolvable)
    pub multiplexer_value: Option<u64>,
}

/// Message decoder - extracts signals from CAN frames
pub struct MessageDecoder;

impl MessageDecoder {
    /// Decode every active signal of `message` from `frame`
    pub fn decode_message(frame: &Frame, message: &MessageSchema) -> MessageDecode {
        let mut out = MessageDecode::default();

        // Phase one: resolve the multiplexer value
        if message.is_multiplexed {
            match Self::resolve_multiplexer(&frame.payload, message) {
                Some(Ok(value)) => out.multiplexer_value = Some(value),
                Some(Err(e)) => out.diagnostics.push(
                    Diagnostic::new(DiagnosticKind::SignalDecodeFailure, e.to_string())
                        .for_frame(frame),
                ),
                None => log::debug!(
                    "Multiplexed message {} has no multiplexer signal",
                    message.name
                ),
            }
        }

        // Phase two: decode unconditional signals plus the active group
        for signal in Self::active_signals(message, out.multiplexer_value) {
            match Self::decode_signal(&frame.payload, signal) {
                Ok(value) if value.is_finite() => {
                    out.samples
                        .push((message.signal_key(signal), Sample::new(frame.timestamp, value)));
                }
                Ok(value) => {
                    out.diagnostics.push(
                        Diagnostic::new(
                            DiagnosticKind::NonNumericValue,
                            format!("{} decoded to {}", message.signal_key(signal), value),
                        )
                        .for_frame(frame),
                    );
                }
                Err(e) => {
                    log::trace!("{} (ID 0x{:X})", e, frame.identifier);
                    out.diagnostics.push(
                        Diagnostic::new(DiagnosticKind::SignalDecodeFailure, e.to_string())
                            .for_frame(frame),
                    );
                }
            }
        }

        out
    }

    /// Raw (unsigned, unscaled) value of the message's multiplexer signal.
    ///
    /// Returns `None` when the message has no designated multiplexer.
    pub fn resolve_multiplexer(
        data: &[u8],
        message: &MessageSchema,
    ) -> Option<Result<u64, ExtractError>> {
        let mux = message.multiplexer()?;
        Some(Self::extract_raw(data, mux))
    }

    /// Signals to decode for a given multiplexer value: all unconditional
    /// signals, plus the gated ones whose value set contains `mux_value`.
    pub fn active_signals(
        message: &MessageSchema,
        mux_value: Option<u64>,
    ) -> impl Iterator<Item = &SignalSchema> {
        message.signals.iter().filter(move |signal| {
            if signal.multiplexer_values.is_empty() {
                return true;
            }
            match mux_value {
                Some(m) => signal.multiplexer_values.contains(&m),
                None => false,
            }
        })
    }

    /// Decode a single signal into its physical value
    pub fn decode_signal(data: &[u8], signal: &SignalSchema) -> Result<f64, ExtractError> {
        let raw = Self::extract_raw(data, signal)?;

        let raw_value = if signal.is_signed() {
            Self::sign_extend(raw, signal.bit_length as usize) as f64
        } else {
            raw as f64
        };

        Ok(raw_value * signal.scale + signal.offset)
    }

    /// Extract the raw bit field of a signal
    pub fn extract_raw(data: &[u8], signal: &SignalSchema) -> Result<u64, ExtractError> {
        let start_bit = signal.start_bit as usize;
        let length = signal.bit_length as usize;

        if length == 0 || length > 64 {
            return Err(ExtractError::InvalidLength {
                signal: signal.name.clone(),
                bit_length: signal.bit_length,
            });
        }

        let extracted = match signal.byte_order {
            ByteOrder::LittleEndian => Self::extract_little_endian(data, start_bit, length),
            ByteOrder::BigEndian => Self::extract_big_endian(data, start_bit, length),
        };

        extracted.ok_or_else(|| ExtractError::OutOfRange {
            signal: signal.name.clone(),
            required_bytes: Self::required_bytes(signal),
            available_bytes: data.len(),
        })
    }

    /// Number of payload bytes a signal touches
    fn required_bytes(signal: &SignalSchema) -> usize {
        let start_bit = signal.start_bit as usize;
        let length = signal.bit_length as usize;
        match signal.byte_order {
            ByteOrder::LittleEndian => (start_bit + length).div_ceil(8),
            ByteOrder::BigEndian => {
                // Bits left in the start byte, then whole bytes downwards
                let first = start_bit % 8 + 1;
                start_bit / 8 + 1 + length.saturating_sub(first).div_ceil(8)
            }
        }
    }

    /// Extract signal with little-endian (Intel) byte order
    ///
    /// - Start bit points to the LSB
    /// - Bits are numbered from LSB to MSB within each byte
    fn extract_little_endian(data: &[u8], start_bit: usize, length: usize) -> Option<u64> {
        if start_bit + length > data.len() * 8 {
            return None;
        }

        let mut result: u64 = 0;
        for i in 0..length {
            let bit_pos = start_bit + i;
            let bit_value = (data[bit_pos / 8] >> (bit_pos % 8)) & 0x01;
            result |= (bit_value as u64) << i;
        }

        Some(result)
    }

    /// Extract signal with big-endian (Motorola) byte order
    ///
    /// - Start bit points to the MSB, in DBC numbering (bit 7 of byte 0 is 7)
    /// - Within a byte the signal walks towards bit 0, then continues at
    ///   bit 7 of the next byte
    fn extract_big_endian(data: &[u8], start_bit: usize, length: usize) -> Option<u64> {
        let mut result: u64 = 0;
        let mut byte_idx = start_bit / 8;
        let mut bit_in_byte = start_bit % 8;

        for _ in 0..length {
            let byte = *data.get(byte_idx)?;
            let bit_value = (byte >> bit_in_byte) & 0x01;
            result = (result << 1) | bit_value as u64;

            if bit_in_byte == 0 {
                byte_idx += 1;
                bit_in_byte = 7;
            } else {
                bit_in_byte -= 1;
            }
        }

        Some(result)
    }

    /// Sign-extend a value from N bits to 64 bits
    fn sign_extend(value: u64, bit_length: usize) -> i64 {
        if bit_length >= 64 {
            return value as i64;
        }

        let sign_bit = 1u64 << (bit_length - 1);
        if (value & sign_bit) != 0 {
            let mask = !0u64 << bit_length;
            (value | mask) as i64
        } else {
            value as i64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mux_message() -> MessageSchema {
        MessageSchema {
            identifier: 0x300,
            name: "Diag".to_string(),
            size: 8,
            sender: None,
            signals: vec![
                SignalSchema::new("Mode", 0, 8).as_multiplexer(),
                SignalSchema::new("Counter", 56, 8),
                SignalSchema::new("Voltage", 8, 16).multiplexed_on([0]),
                SignalSchema::new("Current", 8, 16)
                    .with_scaling(0.5, 0.0)
                    .multiplexed_on([1]),
                SignalSchema::new("Shared", 24, 8).multiplexed_on([1, 2]),
            ],
            is_multiplexed: true,
            multiplexer_signal: Some("Mode".to_string()),
        }
    }

    fn keys(decode: &MessageDecode) -> Vec<&str> {
        decode.samples.iter().map(|(k, _)| k.as_str()).collect()
    }

    #[test]
    fn test_extract_little_endian_simple() {
        let data = [0xAB, 0xCD, 0xEF, 0x12];
        assert_eq!(MessageDecoder::extract_little_endian(&data, 0, 8), Some(0xAB));
    }

    #[test]
    fn test_extract_little_endian_cross_byte() {
        let data = [0xAB, 0xCD, 0xEF, 0x12];
        assert_eq!(MessageDecoder::extract_little_endian(&data, 0, 16), Some(0xCDAB));
        assert_eq!(MessageDecoder::extract_little_endian(&data, 4, 8), Some(0xDA));
    }

    #[test]
    fn test_extract_big_endian() {
        let data = [0xAB, 0xCD, 0xEF, 0x12];
        assert_eq!(MessageDecoder::extract_big_endian(&data, 7, 8), Some(0xAB));
        assert_eq!(MessageDecoder::extract_big_endian(&data, 7, 16), Some(0xABCD));
        // Low nibble of byte 0
        assert_eq!(MessageDecoder::extract_big_endian(&data, 3, 4), Some(0x0B));
        // 12 bits: low nibble of byte 0 followed by byte 1
        assert_eq!(MessageDecoder::extract_big_endian(&data, 3, 12), Some(0xBCD));
    }

    #[test]
    fn test_out_of_range() {
        let data = [0x01, 0x02];
        assert_eq!(MessageDecoder::extract_little_endian(&data, 8, 16), None);
        assert_eq!(MessageDecoder::extract_big_endian(&data, 15, 16), None);

        let signal = SignalSchema::new("TooLong", 8, 16);
        match MessageDecoder::extract_raw(&data, &signal) {
            Err(ExtractError::OutOfRange {
                required_bytes,
                available_bytes,
                ..
            }) => {
                assert_eq!(required_bytes, 3);
                assert_eq!(available_bytes, 2);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_length() {
        let signal = SignalSchema::new("Empty", 0, 0);
        assert!(matches!(
            MessageDecoder::extract_raw(&[0u8; 8], &signal),
            Err(ExtractError::InvalidLength { .. })
        ));
    }

    #[test]
    fn test_sign_extend() {
        assert_eq!(MessageDecoder::sign_extend(0x7F, 8), 127);
        assert_eq!(MessageDecoder::sign_extend(0xFF, 8), -1);
        assert_eq!(MessageDecoder::sign_extend(0x8000, 16), -32768);
    }

    #[test]
    fn test_decode_signed_scaled() {
        let signal = SignalSchema::new("Temp", 0, 8).signed().with_scaling(0.5, 10.0);
        // 0xF6 = -10 -> -10 * 0.5 + 10 = 5
        let value = MessageDecoder::decode_signal(&[0xF6], &signal).unwrap();
        assert_eq!(value, 5.0);
    }

    #[test]
    fn test_unconditional_round_trip() {
        let message = MessageSchema {
            identifier: 0x100,
            name: "Engine".to_string(),
            size: 8,
            sender: None,
            signals: vec![
                SignalSchema::new("RPM", 0, 16).with_scaling(0.25, 0.0),
                SignalSchema::new("Temp", 16, 8).with_scaling(1.0, -40.0),
                SignalSchema::new("Load", 31, 8)
                    .with_byte_order(ByteOrder::BigEndian)
                    .with_scaling(0.5, 0.0),
            ],
            is_multiplexed: false,
            multiplexer_signal: None,
        };
        let frame = Frame::new(1.5, 0x100, vec![0x40, 0x1F, 0x5A, 0xC8, 0, 0, 0, 0]);

        let decoded = MessageDecoder::decode_message(&frame, &message);
        assert!(decoded.diagnostics.is_empty());
        assert_eq!(decoded.samples.len(), 3);
        assert_eq!(decoded.samples[0].1, Sample::new(1.5, 0x1F40 as f64 * 0.25));
        assert_eq!(decoded.samples[1].1.value, 0x5A as f64 - 40.0);
        assert_eq!(decoded.samples[2].1.value, 0xC8 as f64 * 0.5);
    }

    #[test]
    fn test_multiplexing_selectivity() {
        let message = mux_message();

        let frame = Frame::new(0.0, 0x300, vec![1, 0x10, 0x00, 7, 0, 0, 0, 9]);
        let decoded = MessageDecoder::decode_message(&frame, &message);
        assert_eq!(decoded.multiplexer_value, Some(1));
        assert_eq!(
            keys(&decoded),
            vec!["Diag.Mode", "Diag.Counter", "Diag.Current", "Diag.Shared"]
        );
        assert_eq!(decoded.samples[2].1.value, 8.0);

        let frame = Frame::new(0.1, 0x300, vec![0, 0x10, 0x00, 7, 0, 0, 0, 9]);
        let decoded = MessageDecoder::decode_message(&frame, &message);
        assert_eq!(decoded.multiplexer_value, Some(0));
        assert_eq!(keys(&decoded), vec!["Diag.Mode", "Diag.Counter", "Diag.Voltage"]);

        let frame = Frame::new(0.2, 0x300, vec![5, 0x10, 0x00, 7, 0, 0, 0, 9]);
        let decoded = MessageDecoder::decode_message(&frame, &message);
        assert_eq!(keys(&decoded), vec!["Diag.Mode", "Diag.Counter"]);
    }

    #[test]
    fn test_failing_signal_does_not_abort_siblings() {
        let message = mux_message();
        // Only 4 bytes: Counter (byte 7) is out of range, the rest decode
        let frame = Frame::new(0.0, 0x300, vec![2, 0, 0, 3]);
        let decoded = MessageDecoder::decode_message(&frame, &message);

        assert_eq!(keys(&decoded), vec!["Diag.Mode", "Diag.Shared"]);
        assert_eq!(decoded.diagnostics.len(), 1);
        assert_eq!(decoded.diagnostics[0].kind, DiagnosticKind::SignalDecodeFailure);
    }

    #[test]
    fn test_unresolvable_multiplexer_keeps_unconditional_signals() {
        let message = mux_message();
        let frame = Frame::new(0.0, 0x300, vec![]);
        let decoded = MessageDecoder::decode_message(&frame, &message);

        assert_eq!(decoded.multiplexer_value, None);
        assert!(decoded.samples.is_empty());
        // Multiplexer, Mode (as unconditional signal) and Counter all fail
        assert_eq!(decoded.diagnostics.len(), 3);
    }

    #[test]
    fn test_non_finite_values_are_dropped() {
        let message = MessageSchema {
            identifier: 0x1,
            name: "Broken".to_string(),
            size: 1,
            sender: None,
            signals: vec![SignalSchema::new("Inf", 0, 8).with_scaling(f64::INFINITY, 0.0)],
            is_multiplexed: false,
            multiplexer_signal: None,
        };
        let decoded = MessageDecoder::decode_message(&Frame::new(0.0, 0x1, vec![1]), &message);
        assert!(decoded.samples.is_empty());
        assert_eq!(decoded.diagnostics[0].kind, DiagnosticKind::NonNumericValue);
    }
}
