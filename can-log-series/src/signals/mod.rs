//! Signal dictionary and DBC parser
//!
//! This module contains the DBC loader and the schema it produces.

pub mod dbc;
pub mod database;

// Re-export key types for convenience
pub use database::{
    strip_display_prefix, ByteOrder, DatabaseStats, MessageSchema, SchemaAdapter,
    SignalSchema, ValueType, MULTIPLEXED_PREFIX,
};
pub use dbc::{load_dbc, parse_dbc_bytes, read_dbc};
