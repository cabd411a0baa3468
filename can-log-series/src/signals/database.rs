//! Signal dictionary
//!
//! Holds the message and signal definitions of one loaded schema, keyed by
//! CAN identifier. Pure data plus lookup; loading lives in [`super::dbc`].

use crate::types::{DecoderError, Result};
use std::collections::{BTreeSet, HashMap};

/// Display prefix marking multiplexed signals in selectable signal lists
pub const MULTIPLEXED_PREFIX: &str = "[PDU] ";

/// A complete CAN message definition
#[derive(Debug, Clone, PartialEq)]
pub struct MessageSchema {
    /// CAN message ID
    pub identifier: u32,
    /// Message name
    pub name: String,
    /// Message size in bytes
    pub size: usize,
    /// Sender ECU name (optional)
    pub sender: Option<String>,
    /// All signals in this message, in definition order
    pub signals: Vec<SignalSchema>,
    /// True if this message has multiplexed signals
    pub is_multiplexed: bool,
    /// Name of the designated multiplexer signal (if multiplexed)
    pub multiplexer_signal: Option<String>,
}

impl MessageSchema {
    /// The designated multiplexer signal of this message
    pub fn multiplexer(&self) -> Option<&SignalSchema> {
        let name = self.multiplexer_signal.as_deref()?;
        self.signals.iter().find(|s| s.name == name)
    }

    /// Series key for one of this message's signals
    pub fn signal_key(&self, signal: &SignalSchema) -> String {
        format!("{}.{}", self.name, signal.name)
    }
}

/// A CAN signal definition
#[derive(Debug, Clone, PartialEq)]
pub struct SignalSchema {
    /// Signal name
    pub name: String,
    /// Start bit in the frame (DBC numbering)
    pub start_bit: u16,
    /// Length in bits
    pub bit_length: u16,
    pub byte_order: ByteOrder,
    pub value_type: ValueType,
    /// Scale factor to convert raw value to physical value
    pub scale: f64,
    /// Offset to add after scaling
    pub offset: f64,
    /// Minimum physical value
    pub min: f64,
    /// Maximum physical value
    pub max: f64,
    /// Engineering unit (e.g., "km/h", "V")
    pub unit: Option<String>,
    /// True if this signal selects the active multiplexed group
    pub is_multiplexer: bool,
    /// Multiplexer values for which this signal is active; empty = always
    pub multiplexer_values: BTreeSet<u64>,
}

impl SignalSchema {
    /// Unsigned, little-endian, unscaled signal. Mostly useful for tests and
    /// hand-built schemas.
    pub fn new(name: impl Into<String>, start_bit: u16, bit_length: u16) -> Self {
        Self {
            name: name.into(),
            start_bit,
            bit_length,
            byte_order: ByteOrder::LittleEndian,
            value_type: ValueType::Unsigned,
            scale: 1.0,
            offset: 0.0,
            min: 0.0,
            max: 0.0,
            unit: None,
            is_multiplexer: false,
            multiplexer_values: BTreeSet::new(),
        }
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn signed(mut self) -> Self {
        self.value_type = ValueType::Signed;
        self
    }

    pub fn with_scaling(mut self, scale: f64, offset: f64) -> Self {
        self.scale = scale;
        self.offset = offset;
        self
    }

    pub fn as_multiplexer(mut self) -> Self {
        self.is_multiplexer = true;
        self
    }

    pub fn multiplexed_on(mut self, values: impl IntoIterator<Item = u64>) -> Self {
        self.multiplexer_values.extend(values);
        self
    }

    pub fn is_signed(&self) -> bool {
        self.value_type == ValueType::Signed
    }

    /// True if this signal is gated on a multiplexer value
    pub fn is_multiplexed(&self) -> bool {
        !self.multiplexer_values.is_empty()
    }
}

/// Byte order for signal extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Little-endian (Intel format)
    LittleEndian,
    /// Big-endian (Motorola format)
    BigEndian,
}

/// Value type for signal interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Signed,
    Unsigned,
}

/// One loaded signal dictionary
#[derive(Debug, Clone, Default)]
pub struct SchemaAdapter {
    /// All message definitions by CAN ID
    messages: HashMap<u32, MessageSchema>,
    /// Source file name (DBC filename), if loaded from a file
    source: Option<String>,
}

impl SchemaAdapter {
    /// Create a new empty schema
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a schema from message definitions; identifier collisions are
    /// rejected.
    pub fn from_messages(messages: impl IntoIterator<Item = MessageSchema>) -> Result<Self> {
        let mut schema = Self::new();
        for message in messages {
            schema.add_message(message)?;
        }
        Ok(schema)
    }

    /// Builder method: record the source the schema was loaded from
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Add a message definition to the schema
    pub fn add_message(&mut self, message: MessageSchema) -> Result<()> {
        if let Some(existing) = self.messages.get(&message.identifier) {
            return Err(DecoderError::SchemaLoadError(format!(
                "Duplicate message identifier 0x{:X} ('{}' and '{}')",
                message.identifier, existing.name, message.name
            )));
        }
        self.messages.insert(message.identifier, message);
        Ok(())
    }

    /// Get the message definition for a frame identifier
    pub fn message_for(&self, identifier: u32) -> Option<&MessageSchema> {
        self.messages.get(&identifier)
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// All messages, sorted by identifier
    pub fn messages(&self) -> Vec<&MessageSchema> {
        let mut messages: Vec<&MessageSchema> = self.messages.values().collect();
        messages.sort_by_key(|m| m.identifier);
        messages
    }

    /// Selectable signal names for the given identifiers, in identifier and
    /// definition order. Multiplexed signals carry [`MULTIPLEXED_PREFIX`].
    pub fn signal_catalog(&self, identifiers: &[u32]) -> Vec<String> {
        let mut catalog = Vec::new();
        for identifier in identifiers {
            let Some(message) = self.message_for(*identifier) else {
                log::debug!("No message definition for ID 0x{:X}", identifier);
                continue;
            };
            for signal in &message.signals {
                let prefix = if signal.is_multiplexed() { MULTIPLEXED_PREFIX } else { "" };
                catalog.push(format!("{}{}", prefix, message.signal_key(signal)));
            }
        }
        catalog
    }

    /// Get database statistics
    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            num_messages: self.messages.len(),
            num_signals: self.messages.values().map(|m| m.signals.len()).sum(),
            num_multiplexed: self.messages.values().filter(|m| m.is_multiplexed).count(),
        }
    }
}

/// Database statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Total number of message definitions
    pub num_messages: usize,
    /// Total number of signal definitions
    pub num_signals: usize,
    /// Number of multiplexed messages
    pub num_multiplexed: usize,
}

/// Remove the display-only multiplexed prefix from a selected signal name
pub fn strip_display_prefix(name: &str) -> &str {
    name.strip_prefix(MULTIPLEXED_PREFIX).unwrap_or(name)
}
