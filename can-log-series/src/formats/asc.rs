//! ASC (Vector ASCII trace) file parser
//!
//! Reads the line-oriented ASC format. Only CAN and CAN-FD data/remote frame
//! lines produce frames; header lines configure number base and timestamp
//! mode; event lines (statistics, status, error frames, trigger blocks) are
//! skipped silently.
//!
//! ```text
//! date Mon Jan 15 10:30:00.000 am 2024
//! base hex  timestamps absolute
//!    0.010000 1  100             Rx   d 8 01 02 03 04 05 06 07 08
//!    0.020000 1  18FEF100x       Rx   d 3 AA BB CC
//!    0.030000 CANFD   1 Rx        200  EngineFd   1 0 9 12 00 01 02 03 04 05 06 07 08 09 0A 0B
//! ```

use crate::formats::{dlc_to_len, parse_hex_u32, FrameSource};
use crate::types::{DecoderError, Frame, Result};
use chrono::NaiveDateTime;
use std::io::BufRead;

/// Iterator over CAN frames from an ASC trace
pub struct AscFrameIterator<R: BufRead> {
    reader: R,
    line: String,
    line_no: u64,
    /// Identifiers and DLCs are hex unless `base dec` is declared
    hex_base: bool,
    relative_timestamps: bool,
    last_timestamp: f64,
    measurement_start: Option<NaiveDateTime>,
    estimated_frames: Option<u64>,
    finished: bool,
}

/// Outcome of looking at one line
enum LineKind {
    Frame(Frame),
    Skip,
}

impl<R: BufRead> AscFrameIterator<R> {
    pub fn new(reader: R, estimated_frames: Option<u64>) -> Self {
        log::info!("Parsing ASC trace");
        Self {
            reader,
            line: String::new(),
            line_no: 0,
            hex_base: true,
            relative_timestamps: false,
            last_timestamp: 0.0,
            measurement_start: None,
            estimated_frames,
            finished: false,
        }
    }

    fn parse_line(&mut self, line: &str) -> std::result::Result<LineKind, String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = tokens.first() else {
            return Ok(LineKind::Skip);
        };

        match first.to_ascii_lowercase().as_str() {
            "date" => {
                self.measurement_start = parse_date(&tokens[1..]);
                return Ok(LineKind::Skip);
            }
            "base" => {
                self.parse_base_line(&tokens);
                return Ok(LineKind::Skip);
            }
            _ => {}
        }

        if first.starts_with("//") {
            return Ok(LineKind::Skip);
        }

        let Ok(raw_timestamp) = first.parse::<f64>() else {
            // Header or trigger block line
            return Ok(LineKind::Skip);
        };
        if tokens.len() < 4 {
            return Ok(LineKind::Skip);
        }

        let frame = if tokens[1].eq_ignore_ascii_case("CANFD") {
            if !is_direction(tokens[3]) || tokens[4..].first() == Some(&"ErrorFrame") {
                return Ok(LineKind::Skip);
            }
            self.parse_canfd(&tokens[2..])?
        } else if tokens[1].parse::<u16>().is_ok() && is_direction(tokens[3]) {
            self.parse_classic(&tokens[1..])?
        } else {
            // CAN status, statistics, error frames, ...
            return Ok(LineKind::Skip);
        };

        let timestamp = if self.relative_timestamps {
            self.last_timestamp + raw_timestamp
        } else {
            raw_timestamp
        };
        self.last_timestamp = timestamp;

        Ok(LineKind::Frame(Frame { timestamp, ..frame }))
    }

    /// `base hex  timestamps absolute`
    fn parse_base_line(&mut self, tokens: &[&str]) {
        for pair in tokens.windows(2) {
            match (pair[0], pair[1]) {
                ("base", base) => self.hex_base = !base.eq_ignore_ascii_case("dec"),
                ("timestamps", mode) => {
                    self.relative_timestamps = mode.eq_ignore_ascii_case("relative")
                }
                _ => {}
            }
        }
        log::debug!(
            "ASC base: {}, timestamps: {}",
            if self.hex_base { "hex" } else { "dec" },
            if self.relative_timestamps { "relative" } else { "absolute" }
        );
    }

    fn parse_number(&self, token: &str) -> Option<u32> {
        if self.hex_base {
            parse_hex_u32(token)
        } else {
            token.parse().ok()
        }
    }

    /// Identifier token with optional trailing `x` for extended IDs
    fn parse_identifier(&self, token: &str) -> std::result::Result<(u32, bool), String> {
        let (digits, extended) = match token.strip_suffix(['x', 'X']) {
            Some(digits) => (digits, true),
            None => (token, false),
        };
        let identifier = self
            .parse_number(digits)
            .ok_or_else(|| format!("invalid identifier '{}'", token))?;
        Ok((identifier, extended || identifier > 0x7FF))
    }

    /// `<channel> <id> <Rx|Tx> d <dlc> <data...>` or `... r [dlc]`
    fn parse_classic(&self, tokens: &[&str]) -> std::result::Result<Frame, String> {
        let channel = parse_channel(tokens[0])?;
        let (identifier, is_extended_id) = self.parse_identifier(tokens[1])?;

        let kind = tokens.get(3).copied().unwrap_or("d");
        let mut frame = Frame {
            timestamp: 0.0,
            identifier,
            payload: Vec::new(),
            declared_length: 0,
            channel,
            is_extended_datarate: false,
            bitrate_switch: false,
            is_extended_id,
            is_remote: false,
        };

        if kind.eq_ignore_ascii_case("r") {
            frame.is_remote = true;
            if let Some(dlc) = tokens.get(4).and_then(|t| self.parse_number(t)) {
                frame.declared_length = dlc as usize;
            }
            return Ok(frame);
        }

        let dlc = tokens
            .get(4)
            .and_then(|t| self.parse_number(t))
            .ok_or_else(|| "missing or invalid DLC".to_string())?;
        let data_len = (dlc as usize).min(8);
        frame.payload = parse_data_bytes(&tokens[5..], data_len)?;
        frame.declared_length = dlc as usize;
        Ok(frame)
    }

    /// `<channel> <Rx|Tx> <id> [name] <brs> <esi> <dlc> <len> <data...>`
    fn parse_canfd(&self, tokens: &[&str]) -> std::result::Result<Frame, String> {
        let channel = parse_channel(tokens[0])?;
        let (identifier, is_extended_id) = self.parse_identifier(
            tokens.get(2).ok_or_else(|| "missing identifier".to_string())?,
        )?;

        // Optional symbolic name between identifier and BRS flag
        let rest = match tokens.get(3) {
            Some(t) if t.chars().all(|c| c.is_ascii_digit()) => &tokens[3..],
            Some(_) => &tokens[4..],
            None => return Err("truncated CAN FD record".to_string()),
        };
        if rest.len() < 4 {
            return Err("truncated CAN FD record".to_string());
        }

        let bitrate_switch = rest[0] == "1";
        let dlc = u8::from_str_radix(rest[2], 16)
            .map_err(|_| format!("invalid DLC '{}'", rest[2]))?;
        let data_len: usize = rest[3]
            .parse()
            .map_err(|_| format!("invalid data length '{}'", rest[3]))?;
        if data_len > dlc_to_len(dlc) {
            return Err(format!("data length {} exceeds DLC {}", data_len, dlc));
        }

        Ok(Frame {
            timestamp: 0.0,
            identifier,
            payload: parse_data_bytes(&rest[4..], data_len)?,
            declared_length: data_len,
            channel,
            is_extended_datarate: true,
            bitrate_switch,
            is_extended_id,
            is_remote: false,
        })
    }
}

impl<R: BufRead> Iterator for AscFrameIterator<R> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => {
                    self.finished = true;
                    return None;
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                    // Non UTF-8 bytes: skip the line but keep reading
                    self.line_no += 1;
                    return Some(Err(DecoderError::malformed(self.line_no, e.to_string())));
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(DecoderError::IoError(e)));
                }
            }
            self.line_no += 1;

            let line = std::mem::take(&mut self.line);
            let parsed = self.parse_line(line.trim());
            self.line = line;

            match parsed {
                Ok(LineKind::Frame(frame)) => return Some(Ok(frame)),
                Ok(LineKind::Skip) => continue,
                Err(reason) => {
                    return Some(Err(DecoderError::malformed(self.line_no, reason)));
                }
            }
        }
    }
}

impl<R: BufRead + Send> FrameSource for AscFrameIterator<R> {
    fn estimated_total(&self) -> Option<u64> {
        self.estimated_frames
    }

    fn measurement_start(&self) -> Option<NaiveDateTime> {
        self.measurement_start
    }
}

fn is_direction(token: &str) -> bool {
    token.eq_ignore_ascii_case("Rx") || token.eq_ignore_ascii_case("Tx")
}

/// ASC channels are 1-based
fn parse_channel(token: &str) -> std::result::Result<u16, String> {
    token
        .parse::<u16>()
        .map(|c| c.saturating_sub(1))
        .map_err(|_| format!("invalid channel '{}'", token))
}

/// Data bytes are always hex, independent of the declared base
fn parse_data_bytes(tokens: &[&str], count: usize) -> std::result::Result<Vec<u8>, String> {
    if tokens.len() < count {
        return Err(format!("expected {} data bytes, found {}", count, tokens.len()));
    }
    tokens[..count]
        .iter()
        .map(|t| u8::from_str_radix(t, 16).map_err(|_| format!("invalid data byte '{}'", t)))
        .collect()
}

/// Parse the text following `date`, e.g. `Mon Jan 15 10:30:00.000 am 2024`
fn parse_date(tokens: &[&str]) -> Option<NaiveDateTime> {
    let text = tokens.join(" ");
    const FORMATS: [&str; 3] = [
        "%a %b %d %I:%M:%S%.f %p %Y",
        "%a %b %d %H:%M:%S%.f %Y",
        "%a %b %d %I:%M:%S %p %Y",
    ];
    let parsed = FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&text, fmt).ok());
    if parsed.is_none() {
        log::debug!("Unrecognised ASC date line: {}", text);
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACE: &str = "\
date Mon Jan 15 10:30:00.000 am 2024
base hex  timestamps absolute
internal events logged
// version 9.0.0
Begin Triggerblock Mon Jan 15 10:30:00.000 am 2024
   0.000000 Start of measurement
   0.005000 CAN 1 Status:chip status error active
   0.010000 1  100             Rx   d 8 01 02 03 04 05 06 07 08  Length = 228000 BitCount = 118 ID = 256
   0.020000 2  18FEF100x       Tx   d 3 AA BB CC
   0.025000 1  ErrorFrame
   0.030000 CANFD   1 Rx        200  EngineFd                         1 0 9 12 00 01 02 03 04 05 06 07 08 09 0A 0B   130000  130 303000 e0006659 46500250 4b140250 20011736 2010200b
   0.040000 1  300             Rx   r
   1.015991 1  Statistic: D 0 R 0 XD 0 XR 0 E 0 O 0 B 0.00%
End TriggerBlock
";

    fn parse_all(text: &str) -> Vec<Result<Frame>> {
        AscFrameIterator::new(text.as_bytes(), None).collect()
    }

    #[test]
    fn test_parse_trace() {
        let frames: Vec<Frame> = parse_all(TRACE).into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(frames.len(), 4);

        let classic = &frames[0];
        assert_eq!(classic.timestamp, 0.01);
        assert_eq!(classic.identifier, 0x100);
        assert_eq!(classic.channel, 0);
        assert_eq!(classic.payload, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(!classic.is_extended_datarate);

        let extended = &frames[1];
        assert_eq!(extended.identifier, 0x18FE_F100);
        assert!(extended.is_extended_id);
        assert_eq!(extended.channel, 1);
        assert_eq!(extended.declared_length, 3);

        let fd = &frames[2];
        assert_eq!(fd.identifier, 0x200);
        assert!(fd.is_extended_datarate);
        assert!(fd.bitrate_switch);
        assert_eq!(fd.declared_length, 12);
        assert_eq!(fd.payload.len(), 12);
        assert_eq!(fd.payload[11], 0x0B);

        let remote = &frames[3];
        assert!(remote.is_remote);
        assert!(remote.payload.is_empty());
    }

    #[test]
    fn test_measurement_start_from_date_line() {
        let mut iter = AscFrameIterator::new(TRACE.as_bytes(), None);
        iter.by_ref().for_each(drop);
        let start = iter.measurement_start().unwrap();
        assert_eq!(start.to_string(), "2024-01-15 10:30:00");
    }

    #[test]
    fn test_malformed_line_is_recoverable() {
        let text = "\
base hex  timestamps absolute
   0.010000 1  100             Rx   d 2 01 02
   0.020000 1  100             Rx   d 2 01 ZZ
   0.030000 1  100             Rx   d 2 03 04
";
        let results = parse_all(text);
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        match &results[1] {
            Err(e @ DecoderError::MalformedRecord { position, .. }) => {
                assert!(e.is_recoverable());
                assert_eq!(*position, 3);
            }
            other => panic!("expected malformed record, got {:?}", other),
        }
        assert_eq!(results[2].as_ref().unwrap().payload, vec![3, 4]);
    }

    #[test]
    fn test_missing_data_bytes_is_malformed() {
        let text = "   0.010000 1  100             Rx   d 8 01 02\n";
        let results = parse_all(text);
        assert!(matches!(results[0], Err(DecoderError::MalformedRecord { .. })));
    }

    #[test]
    fn test_decimal_base_and_relative_timestamps() {
        let text = "\
base dec  timestamps relative
   0.500000 1  256             Rx   d 1 FF
   0.250000 1  256             Rx   d 1 0A
";
        let frames: Vec<Frame> = parse_all(text).into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(frames[0].identifier, 256);
        assert_eq!(frames[0].timestamp, 0.5);
        assert_eq!(frames[1].timestamp, 0.75);
        assert_eq!(frames[1].payload, vec![0x0A]);
    }
}
