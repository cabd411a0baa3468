//! Ingestion configuration types
//!
//! This module defines the knobs the ingestion pipeline understands. Everything
//! has a serde default so partial configuration files deserialize cleanly.

use serde::{Deserialize, Serialize};

/// Configuration for building a series store from a log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Progress is reported every `progress_step` percent (1..=100)
    #[serde(default = "default_progress_step")]
    pub progress_step: u8,

    /// Optional: only ingest frames from these channels (0-based)
    #[serde(default)]
    pub channel_filter: Option<Vec<u16>>,

    /// Optional: only ingest these specific CAN message IDs
    #[serde(default)]
    pub message_filter: Option<Vec<u32>>,

    /// Optional: stop after this many accepted frames
    #[serde(default)]
    pub max_frames: Option<usize>,

    /// Maximum number of diagnostics kept in the ingest report
    #[serde(default = "default_max_diagnostics")]
    pub max_diagnostics: usize,
}

fn default_progress_step() -> u8 {
    1
}

fn default_max_diagnostics() -> usize {
    10_000
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            progress_step: default_progress_step(),
            channel_filter: None,
            message_filter: None,
            max_frames: None,
            max_diagnostics: default_max_diagnostics(),
        }
    }
}

impl IngestConfig {
    /// Create a new ingestion configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: set progress reporting granularity in percent
    pub fn with_progress_step(mut self, step: u8) -> Self {
        self.progress_step = step.clamp(1, 100);
        self
    }

    /// Builder method: set channel filter
    pub fn with_channel_filter(mut self, channels: Vec<u16>) -> Self {
        self.channel_filter = Some(channels);
        self
    }

    /// Builder method: set message filter
    pub fn with_message_filter(mut self, messages: Vec<u32>) -> Self {
        self.message_filter = Some(messages);
        self
    }

    /// Builder method: limit the number of ingested frames
    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = Some(max_frames);
        self
    }

    /// Builder method: cap the number of stored diagnostics
    pub fn with_max_diagnostics(mut self, max: usize) -> Self {
        self.max_diagnostics = max;
        self
    }

    /// Check if a channel should be processed
    pub fn should_process_channel(&self, channel: u16) -> bool {
        match &self.channel_filter {
            Some(channels) => channels.contains(&channel),
            None => true,
        }
    }

    /// Check if a message ID should be processed
    pub fn should_process_message(&self, identifier: u32) -> bool {
        match &self.message_filter {
            Some(messages) => messages.contains(&identifier),
            None => true,
        }
    }

    /// Check if a frame should be processed based on filters
    pub fn should_process_frame(&self, channel: u16, identifier: u32) -> bool {
        self.should_process_channel(channel) && self.should_process_message(identifier)
    }
}
