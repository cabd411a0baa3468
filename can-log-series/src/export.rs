//! CSV export of the frame table and of prepared series

use crate::prepare::PreparedSelection;
use crate::types::{DecoderError, Frame, Result};
use std::io::Write;

/// Header of the frame table; also understood by the CSV log reader
pub const FRAME_TABLE_HEADER: [&str; 7] = [
    "timestamp",
    "identifier",
    "payload",
    "declared_length",
    "channel",
    "is_extended_datarate",
    "bitrate_switch",
];

/// Write frames as CSV, one row per frame in arrival order
pub fn write_frame_table<W: Write>(writer: W, frames: &[Frame]) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(FRAME_TABLE_HEADER).map_err(csv_error)?;

    for frame in frames {
        csv.write_record([
            frame.timestamp.to_string(),
            format!("0x{:X}", frame.identifier),
            frame.payload_hex(),
            frame.declared_length.to_string(),
            frame.channel.to_string(),
            yes_no(frame.is_extended_datarate).to_string(),
            yes_no(frame.bitrate_switch).to_string(),
        ])
        .map_err(csv_error)?;
    }

    csv.flush()?;
    log::info!("Exported {} frames", frames.len());
    Ok(())
}

/// Write prepared series as CSV with a `<key>_time` and `<key>_value`
/// column per signal. Shorter series are padded with empty cells.
pub fn write_series_table<W: Write>(writer: W, selection: &PreparedSelection) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);

    let header: Vec<String> = selection
        .series
        .keys()
        .flat_map(|key| [format!("{}_time", key), format!("{}_value", key)])
        .collect();
    csv.write_record(&header).map_err(csv_error)?;

    let rows = selection.series.values().map(|s| s.len()).max().unwrap_or(0);
    for row in 0..rows {
        let record: Vec<String> = selection
            .series
            .values()
            .flat_map(|series| match (series.timestamps.get(row), series.values.get(row)) {
                (Some(t), Some(v)) => [t.to_string(), v.to_string()],
                _ => [String::new(), String::new()],
            })
            .collect();
        csv.write_record(&record).map_err(csv_error)?;
    }

    csv.flush()?;
    log::info!(
        "Exported {} series ({} rows)",
        selection.series.len(),
        rows
    );
    Ok(())
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

fn csv_error(error: csv::Error) -> DecoderError {
    match error.into_kind() {
        csv::ErrorKind::Io(e) => DecoderError::IoError(e),
        other => DecoderError::IoError(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("{:?}", other),
        )),
    }
}
