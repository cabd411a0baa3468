//! BLF (Binary Log Format) file parser
//!
//! Vector's binary trace format. A file starts with a `LOGG` header followed
//! by `LOBJ` objects; most writers wrap the actual log objects in
//! (optionally zlib-compressed) log containers, and a log object may span
//! two containers.
//!
//! ## Supported Object Types
//! - Type 1 (CanMessage) and 86 (CanMessage2): classic CAN frames
//! - Type 100 (CanFdMessage): CAN and CAN-FD frames
//! - Type 101 (CanFdMessage64): CAN and CAN-FD frames
//! - Type 10 (LogContainer): uncompressed or zlib-compressed payload
//!
//! Other object types are skipped, with one warning per type.

use crate::formats::{dlc_to_len, FrameSource};
use crate::types::{DecoderError, Frame, Result};
use byteorder::{ByteOrder, LittleEndian};
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::HashSet;
use std::io::{self, ErrorKind, Read};

const FILE_SIGNATURE: &[u8; 4] = b"LOGG";
const OBJECT_SIGNATURE: &[u8; 4] = b"LOBJ";

/// Fixed part of the file header; the full header is `header_size` bytes
const FILE_HEADER_SIZE: usize = 72;
const OBJECT_BASE_HEADER_SIZE: usize = 16;
/// Upper bound for a single object; larger sizes are treated as corruption
const MAX_OBJECT_SIZE: usize = 16 << 20;

const CAN_MESSAGE: u32 = 1;
const LOG_CONTAINER: u32 = 10;
const CAN_MESSAGE2: u32 = 86;
const CAN_FD_MESSAGE: u32 = 100;
const CAN_FD_MESSAGE_64: u32 = 101;

const NO_COMPRESSION: u16 = 0;
const ZLIB_DEFLATE: u16 = 2;

/// Object header flag: timestamp unit is 10 µs, otherwise 1 ns
const TIME_TEN_MICS: u32 = 0x1;

const CAN_MSG_EXT: u32 = 0x8000_0000;
const REMOTE_FLAG: u8 = 0x80;
const EDL: u8 = 0x1;
const BRS: u8 = 0x2;
const REMOTE_FLAG_64: u32 = 0x0010;
const EDL_64: u32 = 0x1000;
const BRS_64: u32 = 0x2000;

/// Values read from the `LOGG` file header
#[derive(Debug, Clone, Copy)]
struct FileHeader {
    header_size: usize,
    object_count: u32,
    measurement_start: Option<NaiveDateTime>,
}

impl FileHeader {
    fn parse(buf: &[u8]) -> std::io::Result<Self> {
        if &buf[0..4] != FILE_SIGNATURE {
            return Err(std::io::Error::new(
                ErrorKind::InvalidData,
                format!("Invalid BLF file signature: {:?}", &buf[0..4]),
            ));
        }

        Ok(FileHeader {
            header_size: LittleEndian::read_u32(&buf[4..8]) as usize,
            object_count: LittleEndian::read_u32(&buf[32..36]),
            measurement_start: parse_systemtime(&buf[40..56]),
        })
    }
}

/// Iterator over CAN frames from a BLF file
pub struct BlfFrameIterator<R: Read> {
    reader: R,
    /// Log objects waiting to be parsed (container payloads concatenated)
    buffer: Vec<u8>,
    pos: usize,
    /// Byte offset of the next outer object in the file
    offset: u64,
    header: FileHeader,
    estimated_frames: Option<u64>,
    skipped_types: HashSet<u32>,
    reader_done: bool,
    finished: bool,
}

impl<R: Read> BlfFrameIterator<R> {
    /// Read and validate the file header
    pub fn open(mut reader: R, estimated_frames: Option<u64>) -> Result<Self> {
        log::info!("Parsing BLF file");

        let mut fixed = [0u8; FILE_HEADER_SIZE];
        reader.read_exact(&mut fixed)?;
        let header = FileHeader::parse(&fixed)?;

        // Skip the remainder of the header
        if header.header_size > FILE_HEADER_SIZE {
            let rest = (header.header_size - FILE_HEADER_SIZE) as u64;
            std::io::copy(&mut (&mut reader).take(rest), &mut std::io::sink())?;
        }

        log::debug!(
            "BLF header: {} bytes, {} objects",
            header.header_size,
            header.object_count
        );

        Ok(Self {
            reader,
            buffer: Vec::new(),
            pos: 0,
            offset: header.header_size.max(FILE_HEADER_SIZE) as u64,
            estimated_frames: estimated_frames
                .or_else(|| (header.object_count > 0).then_some(header.object_count as u64)),
            header,
            skipped_types: HashSet::new(),
            reader_done: false,
            finished: false,
        })
    }

    /// Read one outer object and append its log objects to the buffer.
    /// Returns `Ok(false)` at end of file.
    fn fill_buffer(&mut self) -> Result<bool> {
        let mut base = [0u8; OBJECT_BASE_HEADER_SIZE];
        match read_full(&mut self.reader, &mut base)? {
            0 => return Ok(false),
            n if n < base.len() => {
                log::warn!("BLF file truncated at offset {}", self.offset);
                return Ok(false);
            }
            _ => {}
        }

        let object_start = self.offset;
        if &base[0..4] != OBJECT_SIGNATURE {
            return Err(DecoderError::IoError(std::io::Error::new(
                ErrorKind::InvalidData,
                format!("Invalid object signature at offset {}", object_start),
            )));
        }

        let header_size = LittleEndian::read_u16(&base[4..6]) as usize;
        let object_size = LittleEndian::read_u32(&base[8..12]) as usize;
        let object_type = LittleEndian::read_u32(&base[12..16]);
        if object_size < OBJECT_BASE_HEADER_SIZE {
            return Err(DecoderError::IoError(std::io::Error::new(
                ErrorKind::InvalidData,
                format!("Invalid object size {} at offset {}", object_size, object_start),
            )));
        }

        if object_size > MAX_OBJECT_SIZE {
            // Skip the declared extent without buffering it
            let declared = (object_size - OBJECT_BASE_HEADER_SIZE + object_size % 4) as u64;
            let skipped = io::copy(&mut self.reader.by_ref().take(declared), &mut io::sink())?;
            self.offset += OBJECT_BASE_HEADER_SIZE as u64 + skipped;
            return Err(DecoderError::malformed(
                object_start,
                format!("object size {} exceeds {} bytes", object_size, MAX_OBJECT_SIZE),
            ));
        }

        let mut body = vec![0u8; object_size - OBJECT_BASE_HEADER_SIZE];
        if read_full(&mut self.reader, &mut body)? < body.len() {
            log::warn!("BLF object at offset {} truncated", object_start);
            return Ok(false);
        }

        // Objects are padded to a multiple of four bytes
        let padding = object_size % 4;
        let mut pad = [0u8; 4];
        read_full(&mut self.reader, &mut pad[..padding])?;
        self.offset += (object_size + padding) as u64;

        if object_type == LOG_CONTAINER {
            let container_body = body
                .get(header_size.saturating_sub(OBJECT_BASE_HEADER_SIZE)..)
                .unwrap_or_default();
            let data = decompress_container(container_body)
                .map_err(|reason| DecoderError::malformed(object_start, reason))?;
            self.append(&data);
        } else {
            // Uncontained log object
            self.append(&base);
            self.append(&body);
        }
        Ok(true)
    }

    fn append(&mut self, data: &[u8]) {
        if self.pos > 0 && self.pos == self.buffer.len() {
            self.buffer.clear();
            self.pos = 0;
        } else if self.pos > 1 << 20 {
            self.buffer.drain(..self.pos);
            self.pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Try to take the next complete log object from the buffer.
    /// `Ok(None)` means more data is needed.
    fn next_object(&mut self) -> Result<Option<(u32, Vec<u8>)>> {
        let available = &self.buffer[self.pos..];
        if available.len() < OBJECT_BASE_HEADER_SIZE {
            return Ok(None);
        }

        if &available[0..4] != OBJECT_SIGNATURE {
            // Padding between objects, or a corrupt region
            let Some(skip) = find_signature(available) else {
                // Keep a possible partial signature
                self.pos = self.buffer.len().saturating_sub(3);
                return Ok(None);
            };
            self.pos += skip;
            if skip >= 8 {
                return Err(DecoderError::malformed(
                    self.offset,
                    format!("skipped {} bytes between log objects", skip),
                ));
            }
            return self.next_object();
        }

        let object_size = LittleEndian::read_u32(&available[8..12]) as usize;
        let object_type = LittleEndian::read_u32(&available[12..16]);
        if object_size < OBJECT_BASE_HEADER_SIZE || object_size > MAX_OBJECT_SIZE {
            self.pos += 4;
            return Err(DecoderError::malformed(
                self.offset,
                format!("invalid log object size {}", object_size),
            ));
        }
        if available.len() < object_size {
            return Ok(None);
        }

        let object = available[..object_size].to_vec();
        self.pos += object_size;
        Ok(Some((object_type, object)))
    }

    fn parse_object(&mut self, object_type: u32, object: &[u8]) -> Option<Result<Frame>> {
        match object_type {
            CAN_MESSAGE | CAN_MESSAGE2 | CAN_FD_MESSAGE | CAN_FD_MESSAGE_64 => {
                Some(parse_can_object(object_type, object).map_err(|reason| {
                    DecoderError::malformed(self.offset, reason)
                }))
            }
            other => {
                if self.skipped_types.insert(other) {
                    log::warn!("Skipping unsupported BLF object type {}", other);
                }
                None
            }
        }
    }
}

impl<R: Read> Iterator for BlfFrameIterator<R> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            match self.next_object() {
                Ok(Some((object_type, object))) => {
                    if let Some(result) = self.parse_object(object_type, &object) {
                        return Some(result);
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => return Some(Err(e)),
            }

            if self.reader_done {
                let leftover = self.buffer.len() - self.pos;
                if leftover > 0 {
                    log::debug!("Ignoring {} trailing bytes in BLF file", leftover);
                }
                self.finished = true;
                return None;
            }

            match self.fill_buffer() {
                Ok(true) => {}
                Ok(false) => self.reader_done = true,
                Err(e) if e.is_recoverable() => return Some(Err(e)),
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl<R: Read + Send> FrameSource for BlfFrameIterator<R> {
    fn estimated_total(&self) -> Option<u64> {
        self.estimated_frames
    }

    fn measurement_start(&self) -> Option<NaiveDateTime> {
        self.header.measurement_start
    }
}

/// Read until `buf` is full or EOF; returns the number of bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn find_signature(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == OBJECT_SIGNATURE)
}

/// Container body: method u16, 6 reserved, uncompressed size u32, 4 reserved, data
fn decompress_container(body: &[u8]) -> std::result::Result<Vec<u8>, String> {
    if body.len() < 16 {
        return Err("log container too short".to_string());
    }
    let method = LittleEndian::read_u16(&body[0..2]);
    let data = &body[16..];

    match method {
        NO_COMPRESSION => Ok(data.to_vec()),
        ZLIB_DEFLATE => zune_inflate::DeflateDecoder::new(data)
            .decode_zlib()
            .map_err(|e| format!("zlib decompression failed: {:?}", e)),
        other => Err(format!("unsupported container compression method {}", other)),
    }
}

/// Parse a CAN object (type 1, 86, 100 or 101) including its headers
fn parse_can_object(object_type: u32, object: &[u8]) -> std::result::Result<Frame, String> {
    let header_size = LittleEndian::read_u16(&object[4..6]) as usize;
    if object.len() < header_size || header_size < 32 {
        return Err(format!("invalid object header size {}", header_size));
    }

    let flags = LittleEndian::read_u32(&object[16..20]);
    let raw_timestamp = LittleEndian::read_u64(&object[24..32]);
    let timestamp = if flags & TIME_TEN_MICS != 0 {
        raw_timestamp as f64 / 1e5
    } else {
        raw_timestamp as f64 / 1e9
    };

    let body = &object[header_size..];
    let truncated = || format!("object type {} truncated ({} bytes)", object_type, body.len());

    let frame = match object_type {
        CAN_MESSAGE | CAN_MESSAGE2 => {
            if body.len() < 16 {
                return Err(truncated());
            }
            let msg_flags = body[2];
            let dlc = body[3];
            let can_id = LittleEndian::read_u32(&body[4..8]);
            let is_remote = msg_flags & REMOTE_FLAG != 0;
            let len = if is_remote { 0 } else { (dlc as usize).min(8) };
            Frame {
                timestamp,
                identifier: can_id & !CAN_MSG_EXT,
                payload: body[8..8 + len].to_vec(),
                declared_length: dlc as usize,
                channel: LittleEndian::read_u16(&body[0..2]).saturating_sub(1),
                is_extended_datarate: false,
                bitrate_switch: false,
                is_extended_id: can_id & CAN_MSG_EXT != 0,
                is_remote,
            }
        }
        CAN_FD_MESSAGE => {
            if body.len() < 20 {
                return Err(truncated());
            }
            let msg_flags = body[2];
            let dlc = body[3];
            let can_id = LittleEndian::read_u32(&body[4..8]);
            let fd_flags = body[13];
            let valid_bytes = body[14] as usize;
            let is_fd = fd_flags & EDL != 0;
            let is_remote = msg_flags & REMOTE_FLAG != 0;
            let length = if is_fd { dlc_to_len(dlc) } else { (dlc as usize).min(8) };
            let len = if is_remote { 0 } else { valid_bytes.min(length) };
            let data = body.get(20..20 + len).ok_or_else(truncated)?;
            Frame {
                timestamp,
                identifier: can_id & !CAN_MSG_EXT,
                payload: data.to_vec(),
                declared_length: if is_fd { length } else { dlc as usize },
                channel: LittleEndian::read_u16(&body[0..2]).saturating_sub(1),
                is_extended_datarate: is_fd,
                bitrate_switch: fd_flags & BRS != 0,
                is_extended_id: can_id & CAN_MSG_EXT != 0,
                is_remote,
            }
        }
        CAN_FD_MESSAGE_64 => {
            if body.len() < 40 {
                return Err(truncated());
            }
            let dlc = body[1];
            let valid_bytes = body[2] as usize;
            let can_id = LittleEndian::read_u32(&body[4..8]);
            let fd_flags = LittleEndian::read_u32(&body[12..16]);
            let is_fd = fd_flags & EDL_64 != 0;
            let is_remote = fd_flags & REMOTE_FLAG_64 != 0;
            let length = if is_fd { dlc_to_len(dlc) } else { (dlc as usize).min(8) };
            let len = if is_remote { 0 } else { valid_bytes.min(length) };
            let data = body.get(40..40 + len).ok_or_else(truncated)?;
            Frame {
                timestamp,
                identifier: can_id & !CAN_MSG_EXT,
                payload: data.to_vec(),
                declared_length: if is_fd { length } else { dlc as usize },
                channel: (body[0] as u16).saturating_sub(1),
                is_extended_datarate: is_fd,
                bitrate_switch: fd_flags & BRS_64 != 0,
                is_extended_id: can_id & CAN_MSG_EXT != 0,
                is_remote,
            }
        }
        other => return Err(format!("object type {} is not a CAN message", other)),
    };

    Ok(frame)
}

/// Windows SYSTEMTIME: year, month, day of week, day, hour, minute, second, ms
fn parse_systemtime(buf: &[u8]) -> Option<NaiveDateTime> {
    let field = |i: usize| LittleEndian::read_u16(&buf[i * 2..i * 2 + 2]) as u32;
    if field(0) == 0 {
        return None;
    }
    NaiveDate::from_ymd_opt(field(0) as i32, field(1), field(3))?
        .and_hms_milli_opt(field(4), field(5), field(6), field(7))
}
