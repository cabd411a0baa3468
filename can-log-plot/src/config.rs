//! Configuration loading and parsing
//!
//! Every section is optional; command-line arguments override the file.

use anyhow::{Context, Result};
use can_log_series::IngestConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main application configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub signals: SignalsConfig,
    #[serde(default)]
    pub plot: PlotConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub filtering: FilteringConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InputConfig {
    pub log: Option<PathBuf>,
    pub dbc: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SignalsConfig {
    #[serde(default)]
    pub select: SignalSelection,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SignalSelection {
    All(String), // "all"
    List(Vec<String>),
}

impl Default for SignalSelection {
    fn default() -> Self {
        SignalSelection::List(Vec::new())
    }
}

impl SignalSelection {
    /// Expand against the available keys
    pub fn resolve<'a>(&self, available: impl Iterator<Item = &'a str>) -> Vec<String> {
        match self {
            SignalSelection::All(word) if word.eq_ignore_ascii_case("all") => {
                available.map(str::to_string).collect()
            }
            SignalSelection::All(single) => vec![single.clone()],
            SignalSelection::List(keys) => keys.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, SignalSelection::List(keys) if keys.is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PlotConfig {
    pub start: Option<f64>,
    pub end: Option<f64>,
    #[serde(default)]
    pub normalize: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OutputConfig {
    pub frames_csv: Option<PathBuf>,
    pub series_csv: Option<PathBuf>,
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilteringConfig {
    pub channels: Option<Vec<u16>>,
    pub message_ids: Option<Vec<u32>>,
    pub max_frames: Option<usize>,
    #[serde(default = "default_progress_step")]
    pub progress_step: u8,
}

fn default_progress_step() -> u8 {
    10
}

impl Default for FilteringConfig {
    fn default() -> Self {
        Self {
            channels: None,
            message_ids: None,
            max_frames: None,
            progress_step: default_progress_step(),
        }
    }
}

impl FilteringConfig {
    /// Library ingestion settings for this section
    pub fn ingest_config(&self, max_frames: Option<usize>) -> IngestConfig {
        let mut config = IngestConfig::new().with_progress_step(self.progress_step);
        if let Some(channels) = &self.channels {
            config = config.with_channel_filter(channels.clone());
        }
        if let Some(ids) = &self.message_ids {
            config = config.with_message_filter(ids.clone());
        }
        if let Some(max) = max_frames.or(self.max_frames) {
            config = config.with_max_frames(max);
        }
        config
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    Ok(config)
}
