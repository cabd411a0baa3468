//! DBC file parser
//!
//! Parses Vector DBC files and converts them into a [`SchemaAdapter`].

use crate::signals::database::{
    ByteOrder, MessageSchema, SchemaAdapter, SignalSchema, ValueType,
};
use crate::types::{DecoderError, Result};
use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;

/// Bit 31 of a DBC message ID flags a 29-bit identifier
const DBC_EXTENDED_ID_FLAG: u32 = 0x8000_0000;

/// Widest `SG_MUL_VAL_` range expanded into individual multiplexer values
const MAX_EXTENDED_MUX_SPAN: u64 = 0xFFFF;

/// Load a DBC file from disk
pub fn load_dbc(path: &Path) -> Result<SchemaAdapter> {
    log::info!("Parsing DBC file: {:?}", path);

    let bytes = std::fs::read(path).map_err(|e| {
        DecoderError::SchemaLoadError(format!("Failed to read file {:?}: {}", path, e))
    })?;

    let source_filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown.dbc");

    parse_dbc_bytes(&bytes, source_filename)
}

/// Load a DBC from any reader (the caller owns opening the resource)
pub fn read_dbc<R: Read>(mut reader: R, source: &str) -> Result<SchemaAdapter> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).map_err(|e| {
        DecoderError::SchemaLoadError(format!("Failed to read {}: {}", source, e))
    })?;
    parse_dbc_bytes(&bytes, source)
}

/// Parse DBC content held in memory
pub fn parse_dbc_bytes(bytes: &[u8], source: &str) -> Result<SchemaAdapter> {
    // Try UTF-8 first, then fall back to Latin-1 (compatible with Windows-1252)
    let content = match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            log::warn!("DBC file {} is not UTF-8, trying Latin-1 encoding", source);
            bytes.iter().map(|&b| b as char).collect()
        }
    };

    let dbc = can_dbc::DBC::from_slice(content.as_bytes()).map_err(|e| {
        DecoderError::SchemaLoadError(format!("Failed to parse DBC {}: {:?}", source, e))
    })?;

    let mut schema = SchemaAdapter::new().with_source(source);
    for dbc_msg in dbc.messages() {
        let mut message = convert_message(dbc_msg)?;
        apply_extended_multiplex(&mut message, dbc_msg, dbc.extended_multiplex());
        schema.add_message(message)?;
    }

    let stats = schema.stats();
    log::info!(
        "Parsed {} messages ({} signals) from {}",
        stats.num_messages,
        stats.num_signals,
        source
    );

    Ok(schema)
}

impl SchemaAdapter {
    /// Build a schema from DBC text held in memory
    pub fn from_dbc_bytes(bytes: &[u8], source: &str) -> Result<Self> {
        parse_dbc_bytes(bytes, source)
    }
}

/// Convert a can-dbc message to our MessageSchema
fn convert_message(dbc_msg: &can_dbc::Message) -> Result<MessageSchema> {
    let mut is_multiplexed = false;
    let mut multiplexer_signal: Option<String> = None;

    // First pass: identify multiplexer signal
    for dbc_sig in dbc_msg.signals() {
        match dbc_sig.multiplexer_indicator() {
            can_dbc::MultiplexIndicator::Multiplexor => {
                is_multiplexed = true;
                multiplexer_signal = Some(dbc_sig.name().to_string());
            }
            can_dbc::MultiplexIndicator::MultiplexedSignal(_)
            | can_dbc::MultiplexIndicator::MultiplexorAndMultiplexedSignal(_) => {
                is_multiplexed = true;
            }
            can_dbc::MultiplexIndicator::Plain => {}
        }
    }

    // Second pass: convert all signals
    let signals = dbc_msg
        .signals()
        .iter()
        .map(|dbc_sig| convert_signal(dbc_sig, dbc_msg, multiplexer_signal.is_some()))
        .collect::<Result<Vec<_>>>()?;

    Ok(MessageSchema {
        identifier: dbc_msg.message_id().0 & !DBC_EXTENDED_ID_FLAG,
        name: dbc_msg.message_name().to_string(),
        size: *dbc_msg.message_size() as usize,
        sender: match dbc_msg.transmitter() {
            can_dbc::Transmitter::NodeName(name) => Some(name.to_string()),
            _ => None,
        },
        signals,
        is_multiplexed,
        multiplexer_signal,
    })
}

/// Merge `SG_MUL_VAL_` ranges into the multiplexer values of the message's signals
fn apply_extended_multiplex(
    message: &mut MessageSchema,
    dbc_msg: &can_dbc::Message,
    entries: &[can_dbc::ExtendedMultiplex],
) {
    for entry in entries.iter().filter(|e| e.message_id() == dbc_msg.message_id()) {
        if message.multiplexer_signal.as_deref() != Some(entry.multiplexor_signal_name().as_str()) {
            log::warn!(
                "Ignoring SG_MUL_VAL_ for {}.{}: switch '{}' is not the message multiplexer",
                message.name,
                entry.signal_name(),
                entry.multiplexor_signal_name()
            );
            continue;
        }

        let Some(signal) = message
            .signals
            .iter_mut()
            .find(|s| s.name == *entry.signal_name())
        else {
            log::warn!(
                "SG_MUL_VAL_ names unknown signal {}.{}",
                message.name,
                entry.signal_name()
            );
            continue;
        };

        for mapping in entry.mappings() {
            let (min, max) = (*mapping.min_value(), *mapping.max_value());
            if max < min || max - min > MAX_EXTENDED_MUX_SPAN {
                log::warn!(
                    "Skipping multiplexer range {}-{} for {}.{}",
                    min,
                    max,
                    message.name,
                    signal.name
                );
                continue;
            }
            signal.multiplexer_values.extend(min..=max);
        }
    }
}

/// Convert a can-dbc signal to our SignalSchema
fn convert_signal(
    dbc_sig: &can_dbc::Signal,
    dbc_msg: &can_dbc::Message,
    has_multiplexer: bool,
) -> Result<SignalSchema> {
    let byte_order = match *dbc_sig.byte_order() {
        can_dbc::ByteOrder::LittleEndian => ByteOrder::LittleEndian,
        can_dbc::ByteOrder::BigEndian => ByteOrder::BigEndian,
    };

    let value_type = match *dbc_sig.value_type() {
        can_dbc::ValueType::Signed => ValueType::Signed,
        can_dbc::ValueType::Unsigned => ValueType::Unsigned,
    };

    let (is_multiplexer, multiplexer_values) = match *dbc_sig.multiplexer_indicator() {
        can_dbc::MultiplexIndicator::Multiplexor => (true, BTreeSet::new()),
        can_dbc::MultiplexIndicator::MultiplexedSignal(switch_value) => {
            (false, BTreeSet::from([switch_value]))
        }
        can_dbc::MultiplexIndicator::MultiplexorAndMultiplexedSignal(switch_value) => {
            (true, BTreeSet::from([switch_value]))
        }
        can_dbc::MultiplexIndicator::Plain => (false, BTreeSet::new()),
    };

    if !multiplexer_values.is_empty() && !has_multiplexer {
        return Err(DecoderError::SchemaLoadError(format!(
            "Multiplexed signal '{}' in message '{}' but no multiplexer found",
            dbc_sig.name(),
            dbc_msg.message_name()
        )));
    }

    Ok(SignalSchema {
        name: dbc_sig.name().to_string(),
        start_bit: *dbc_sig.start_bit() as u16,
        bit_length: *dbc_sig.signal_size() as u16,
        byte_order,
        value_type,
        scale: *dbc_sig.factor(),
        offset: *dbc_sig.offset(),
        min: *dbc_sig.min(),
        max: *dbc_sig.max(),
        unit: if dbc_sig.unit().is_empty() {
            None
        } else {
            Some(dbc_sig.unit().to_string())
        },
        is_multiplexer,
        multiplexer_values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{decode, DecodeMode};
    use crate::types::Frame;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SIMPLE_DBC: &str = r#"
VERSION ""

NS_ :
    NS_DESC_
    CM_
    BA_DEF_
    BA_
    VAL_
    CAT_DEF_
    CAT_
    FILTER
    BA_DEF_DEF_
    EV_DATA_
    ENVVAR_DATA_
    SGTYPE_
    SGTYPE_VAL_
    BA_DEF_SGTYPE_
    BA_SGTYPE_
    SIG_TYPE_REF_
    VAL_TABLE_
    SIG_GROUP_
    SIG_VALTYPE_
    SIGTYPE_VALTYPE_
    BO_TX_BU_
    BA_DEF_REL_
    BA_REL_
    BA_SGTYPE_REL_
    SG_MUL_VAL_

BS_:

BU_: ECU1 ECU2

BO_ 291 EngineData: 8 ECU1
 SG_ EngineSpeed : 0|16@1+ (1,0) [0|8000] "rpm" ECU2
 SG_ EngineTemp : 16|8@1+ (1,-40) [-40|215] "C" ECU2

BO_ 512 BatteryStatus: 8 ECU1
 SG_ BatteryVoltage : 0|16@1+ (0.01,0) [0|16] "V" ECU2
"#;

    #[test]
    fn test_parse_simple_dbc() {
        let schema = parse_dbc_bytes(SIMPLE_DBC.as_bytes(), "simple.dbc").unwrap();

        assert_eq!(schema.stats().num_messages, 2);
        assert_eq!(schema.source(), Some("simple.dbc"));

        let msg = schema.message_for(291).unwrap();
        assert_eq!(msg.name, "EngineData");
        assert_eq!(msg.size, 8);
        assert_eq!(msg.sender, Some("ECU1".to_string()));
        assert_eq!(msg.signals.len(), 2);

        let speed = &msg.signals[0];
        assert_eq!(speed.name, "EngineSpeed");
        assert_eq!(speed.start_bit, 0);
        assert_eq!(speed.bit_length, 16);
        assert_eq!(speed.byte_order, ByteOrder::LittleEndian);
        assert_eq!(speed.unit, Some("rpm".to_string()));

        let temp = &msg.signals[1];
        assert_eq!(temp.offset, -40.0);
        assert!(!temp.is_multiplexed());
    }

    #[test]
    fn test_load_dbc_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(SIMPLE_DBC.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let schema = load_dbc(temp_file.path()).unwrap();
        assert!(schema.message_for(512).is_some());

        let file = std::fs::File::open(temp_file.path()).unwrap();
        let from_reader = read_dbc(file, "simple.dbc").unwrap();
        assert_eq!(from_reader.stats(), schema.stats());
    }

    #[test]
    fn test_parse_multiplexed_signals() {
        let dbc_content = r#"
VERSION ""

NS_ :

BS_:

BU_: ECU1

BO_ 512 MultiplexedMsg: 8 ECU1
 SG_ Mode M : 0|8@1+ (1,0) [0|3] "" ECU1
 SG_ SignalA m0 : 8|16@1+ (1,0) [0|100] "%" ECU1
 SG_ SignalB m1 : 8|16@1+ (0.1,0) [0|1000] "mV" ECU1
"#;

        let schema = SchemaAdapter::from_dbc_bytes(dbc_content.as_bytes(), "mux.dbc").unwrap();
        let msg = schema.message_for(512).unwrap();
        assert!(msg.is_multiplexed);
        assert_eq!(msg.multiplexer_signal, Some("Mode".to_string()));
        assert_eq!(msg.signals.len(), 3);
        assert!(msg.multiplexer().unwrap().is_multiplexer);

        let sig_a = msg.signals.iter().find(|s| s.name == "SignalA").unwrap();
        assert_eq!(sig_a.multiplexer_values, BTreeSet::from([0]));
        let sig_b = msg.signals.iter().find(|s| s.name == "SignalB").unwrap();
        assert_eq!(sig_b.multiplexer_values, BTreeSet::from([1]));
    }

    #[test]
    fn test_extended_multiplex_ranges() {
        let dbc_content = r#"
VERSION ""

NS_ :

BS_:

BU_: ECU1

BO_ 512 Mux: 8 ECU1
 SG_ Mode M : 0|8@1+ (1,0) [0|255] "" ECU1
 SG_ Ranged m1 : 8|8@1+ (1,0) [0|255] "" ECU1
 SG_ Split m4 : 16|8@1+ (1,0) [0|255] "" ECU1

SG_MUL_VAL_ 512 Ranged Mode 1-3;
SG_MUL_VAL_ 512 Split Mode 4-4, 7-8;
"#;

        let schema = SchemaAdapter::from_dbc_bytes(dbc_content.as_bytes(), "ext_mux.dbc").unwrap();
        let msg = schema.message_for(512).unwrap();

        let ranged = msg.signals.iter().find(|s| s.name == "Ranged").unwrap();
        assert_eq!(ranged.multiplexer_values, BTreeSet::from([1, 2, 3]));
        let split = msg.signals.iter().find(|s| s.name == "Split").unwrap();
        assert_eq!(split.multiplexer_values, BTreeSet::from([4, 7, 8]));

        let mode = DecodeMode::from(schema);
        let frame = Frame::new(0.0, 512, vec![2, 0x2A, 0, 0, 0, 0, 0, 0]);
        let keys: Vec<String> = decode(&frame, &mode).into_iter().map(|(k, _)| k).collect();
        assert!(keys.contains(&"Mux.Ranged".to_string()));
        assert!(!keys.contains(&"Mux.Split".to_string()));

        let frame = Frame::new(0.1, 512, vec![8, 0, 0x11, 0, 0, 0, 0, 0]);
        let keys: Vec<String> = decode(&frame, &mode).into_iter().map(|(k, _)| k).collect();
        assert!(keys.contains(&"Mux.Split".to_string()));
        assert!(!keys.contains(&"Mux.Ranged".to_string()));
    }

    #[test]
    fn test_extended_identifier_flag_is_masked() {
        let dbc_content = r#"
VERSION ""

NS_ :

BS_:

BU_: ECU1

BO_ 2566844901 J1939Msg: 8 ECU1
 SG_ Value : 0|8@1+ (1,0) [0|255] "" ECU1
"#;

        let schema = parse_dbc_bytes(dbc_content.as_bytes(), "ext.dbc").unwrap();
        // 2566844901 = 0x98FEF1E5 -> 0x18FEF1E5 once bit 31 is cleared
        assert!(schema.message_for(0x18FE_F1E5).is_some());
    }

    #[test]
    fn test_malformed_dbc_is_schema_error() {
        let result = parse_dbc_bytes(b"BO_ this is not a dbc", "broken.dbc");
        assert!(matches!(result, Err(DecoderError::SchemaLoadError(_))));
    }
}
