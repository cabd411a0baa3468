//! Tabular CAN log parser
//!
//! Two header layouts are recognised:
//!
//! - python-can CSV: `timestamp,arbitration_id,extended,remote,error,dlc,data`
//!   with a hex identifier and base64 payload
//! - the frame table written by [`crate::export::write_frame_table`]:
//!   `timestamp,identifier,payload,declared_length,channel,...` with hex
//!   identifier and space separated hex payload

use crate::formats::{parse_hex_u32, FrameSource};
use crate::types::{DecoderError, Frame, Result, MAX_PAYLOAD_LEN};
use ::csv::{ReaderBuilder, StringRecord, StringRecordsIntoIter, Trim};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::io::Read;

/// Column positions of the recognised layout
#[derive(Debug, Clone)]
enum Layout {
    PythonCan {
        timestamp: usize,
        identifier: usize,
        extended: Option<usize>,
        remote: Option<usize>,
        error: Option<usize>,
        dlc: Option<usize>,
        data: usize,
    },
    FrameTable {
        timestamp: usize,
        identifier: usize,
        payload: usize,
        declared_length: Option<usize>,
        channel: Option<usize>,
        extended_datarate: Option<usize>,
        bitrate_switch: Option<usize>,
    },
}

impl Layout {
    fn from_headers(headers: &StringRecord) -> Result<Self> {
        let column = |name: &str| {
            headers
                .iter()
                .position(|h| h.eq_ignore_ascii_case(name))
        };
        let required = |name: &str| {
            column(name).ok_or_else(|| {
                DecoderError::UnsupportedFormat(format!("CSV column '{}' missing", name))
            })
        };

        if column("arbitration_id").is_some() {
            Ok(Layout::PythonCan {
                timestamp: required("timestamp")?,
                identifier: required("arbitration_id")?,
                extended: column("extended"),
                remote: column("remote"),
                error: column("error"),
                dlc: column("dlc"),
                data: required("data")?,
            })
        } else if column("identifier").is_some() {
            Ok(Layout::FrameTable {
                timestamp: required("timestamp")?,
                identifier: required("identifier")?,
                payload: required("payload")?,
                declared_length: column("declared_length"),
                channel: column("channel"),
                extended_datarate: column("is_extended_datarate"),
                bitrate_switch: column("bitrate_switch"),
            })
        } else {
            Err(DecoderError::UnsupportedFormat(format!(
                "unrecognised CSV header: {}",
                headers.iter().collect::<Vec<_>>().join(",")
            )))
        }
    }
}

/// Iterator over CAN frames from a CSV log
pub struct CsvFrameIterator<R: Read> {
    records: StringRecordsIntoIter<R>,
    layout: Layout,
    estimated_frames: Option<u64>,
}

impl<R: Read> CsvFrameIterator<R> {
    /// Read the header row and pick the layout
    pub fn open(reader: R, estimated_frames: Option<u64>) -> Result<Self> {
        log::info!("Parsing CSV log");

        let mut csv_reader = ReaderBuilder::new()
            .flexible(true)
            .trim(Trim::All)
            .comment(Some(b'#'))
            .from_reader(reader);

        let headers = csv_reader.headers().map_err(csv_error_to_decoder)?.clone();
        let layout = Layout::from_headers(&headers)?;
        log::debug!("CSV layout: {:?}", layout);

        Ok(Self {
            records: csv_reader.into_records(),
            layout,
            // The header row is not a frame
            estimated_frames: estimated_frames.map(|n| n.saturating_sub(1)),
        })
    }

    fn parse_record(&self, record: &StringRecord) -> std::result::Result<Option<Frame>, String> {
        let field = |index: usize| {
            record
                .get(index)
                .ok_or_else(|| format!("missing column {}", index + 1))
        };
        let optional = |index: Option<usize>| index.and_then(|i| record.get(i)).filter(|s| !s.is_empty());

        match &self.layout {
            Layout::PythonCan {
                timestamp,
                identifier,
                extended,
                remote,
                error,
                dlc,
                data,
            } => {
                if optional(*error).map(parse_flag).transpose()?.unwrap_or(false) {
                    return Ok(None);
                }

                let timestamp = parse_timestamp(field(*timestamp)?)?;
                let identifier = parse_identifier(field(*identifier)?)?;
                let payload = STANDARD
                    .decode(field(*data)?)
                    .map_err(|e| format!("invalid base64 data: {}", e))?;
                check_payload_len(&payload)?;

                let declared_length = match optional(*dlc) {
                    Some(text) => text
                        .parse::<usize>()
                        .map_err(|_| format!("invalid dlc '{}'", text))?,
                    None => payload.len(),
                };

                let mut frame = Frame::new(timestamp, identifier, payload);
                frame.declared_length = declared_length;
                if let Some(ext) = optional(*extended) {
                    frame.is_extended_id = parse_flag(ext)?;
                }
                frame.is_remote = optional(*remote).map(parse_flag).transpose()?.unwrap_or(false);
                frame.is_extended_datarate = declared_length > 8;
                Ok(Some(frame))
            }
            Layout::FrameTable {
                timestamp,
                identifier,
                payload,
                declared_length,
                channel,
                extended_datarate,
                bitrate_switch,
            } => {
                let timestamp = parse_timestamp(field(*timestamp)?)?;
                let identifier = parse_identifier(field(*identifier)?)?;
                let payload = parse_hex_payload(field(*payload)?)?;
                check_payload_len(&payload)?;

                let mut frame = Frame::new(timestamp, identifier, payload);
                if let Some(text) = optional(*declared_length) {
                    frame.declared_length = text
                        .parse()
                        .map_err(|_| format!("invalid declared length '{}'", text))?;
                }
                if let Some(text) = optional(*channel) {
                    frame.channel = text
                        .parse()
                        .map_err(|_| format!("invalid channel '{}'", text))?;
                }
                frame.is_extended_datarate =
                    optional(*extended_datarate).map(parse_flag).transpose()?.unwrap_or(false);
                frame.bitrate_switch =
                    optional(*bitrate_switch).map(parse_flag).transpose()?.unwrap_or(false);
                Ok(Some(frame))
            }
        }
    }
}

impl<R: Read> Iterator for CsvFrameIterator<R> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let record = match self.records.next()? {
                Ok(record) => record,
                Err(e) => return Some(Err(csv_error_to_decoder(e))),
            };

            let line = record.position().map(|p| p.line()).unwrap_or(0);
            match self.parse_record(&record) {
                Ok(Some(frame)) => return Some(Ok(frame)),
                Ok(None) => continue,
                Err(reason) => return Some(Err(DecoderError::malformed(line, reason))),
            }
        }
    }
}

impl<R: Read + Send> FrameSource for CsvFrameIterator<R> {
    fn estimated_total(&self) -> Option<u64> {
        self.estimated_frames
    }
}

/// I/O failures are fatal; anything else only affects one record
fn csv_error_to_decoder(error: ::csv::Error) -> DecoderError {
    let line = error.position().map(|p| p.line()).unwrap_or(0);
    match error.into_kind() {
        ::csv::ErrorKind::Io(e) => DecoderError::IoError(e),
        other => DecoderError::malformed(line, format!("{:?}", other)),
    }
}

fn parse_timestamp(text: &str) -> std::result::Result<f64, String> {
    text.parse::<f64>()
        .ok()
        .filter(|t| t.is_finite())
        .ok_or_else(|| format!("invalid timestamp '{}'", text))
}

fn parse_identifier(text: &str) -> std::result::Result<u32, String> {
    parse_hex_u32(text).ok_or_else(|| format!("invalid identifier '{}'", text))
}

fn parse_hex_payload(text: &str) -> std::result::Result<Vec<u8>, String> {
    text.split_whitespace()
        .map(|t| u8::from_str_radix(t, 16).map_err(|_| format!("invalid data byte '{}'", t)))
        .collect()
}

fn parse_flag(text: &str) -> std::result::Result<bool, String> {
    match text.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(format!("invalid flag '{}'", text)),
    }
}

fn check_payload_len(payload: &[u8]) -> std::result::Result<(), String> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(format!("payload of {} bytes exceeds {}", payload.len(), MAX_PAYLOAD_LEN));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(text: &str) -> Vec<Result<Frame>> {
        CsvFrameIterator::open(text.as_bytes(), None).unwrap().collect()
    }

    #[test]
    fn test_python_can_layout() {
        let text = "\
timestamp,arbitration_id,extended,remote,error,dlc,data
1.5,0x100,0,0,0,3,AQID
2.0,0x18FEF100,1,0,0,1,qg==
2.5,0x000,0,0,1,0,
";
        let frames: Vec<Frame> = parse_all(text).into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].timestamp, 1.5);
        assert_eq!(frames[0].identifier, 0x100);
        assert_eq!(frames[0].payload, vec![1, 2, 3]);
        assert!(!frames[0].is_extended_id);
        assert_eq!(frames[1].payload, vec![0xAA]);
        assert!(frames[1].is_extended_id);
    }

    #[test]
    fn test_frame_table_layout() {
        let text = "\
timestamp,identifier,payload,declared_length,channel,is_extended_datarate,bitrate_switch
0.25,0x7E8,01 02 0A,3,1,no,no
0.5,0x200,00 11 22 33 44 55 66 77 88 99 AA BB,12,0,yes,yes
";
        let frames: Vec<Frame> = parse_all(text).into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(frames[0].identifier, 0x7E8);
        assert_eq!(frames[0].payload, vec![1, 2, 10]);
        assert_eq!(frames[0].channel, 1);
        assert!(frames[1].is_extended_datarate);
        assert!(frames[1].bitrate_switch);
        assert_eq!(frames[1].declared_length, 12);
    }

    #[test]
    fn test_bad_record_is_recoverable() {
        let text = "\
timestamp,identifier,payload
0.1,0x10,01
oops,0x10,02
0.3,0x10,03
";
        let results = parse_all(text);
        assert_eq!(results.len(), 3);
        match &results[1] {
            Err(DecoderError::MalformedRecord { position, .. }) => assert_eq!(*position, 3),
            other => panic!("expected malformed record, got {:?}", other),
        }
        assert_eq!(results[2].as_ref().unwrap().payload, vec![3]);
    }

    #[test]
    fn test_unknown_header_is_unsupported() {
        let result = CsvFrameIterator::open("a,b,c\n1,2,3\n".as_bytes(), None);
        assert!(matches!(result, Err(DecoderError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_estimate_excludes_header_row() {
        let text = "timestamp,identifier,payload\n0.1,0x10,01\n";
        let iter = CsvFrameIterator::open(text.as_bytes(), Some(2)).unwrap();
        assert_eq!(iter.estimated_total(), Some(1));
    }
}
