//! Series preparation
//!
//! Turns a selection of signal keys into plot-ready data: window filtering,
//! optional min-max normalization and summary statistics. Preparation only
//! reads the store; every call produces a fresh [`PreparedSelection`].

use crate::signals::strip_display_prefix;
use crate::store::{Series, SeriesStore};
use crate::types::{DecoderError, Diagnostic, DiagnosticKind, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Inclusive time interval in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: f64,
    pub end: f64,
}

impl TimeWindow {
    /// Create a window, rejecting reversed, empty or non-finite bounds
    pub fn new(start: f64, end: f64) -> Result<Self> {
        let window = Self { start, end };
        window.validate()?;
        Ok(window)
    }

    fn validate(&self) -> Result<()> {
        if !self.start.is_finite() || !self.end.is_finite() || self.start >= self.end {
            return Err(DecoderError::InvalidWindow {
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }

    pub fn contains(&self, timestamp: f64) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }
}

/// Summary statistics of one prepared series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl SeriesStats {
    /// `None` for an empty slice
    pub fn compute(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let (min, max, sum) = values.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY, 0.0),
            |(min, max, sum), &v| (min.min(v), max.max(v), sum + v),
        );
        Some(Self {
            min,
            max,
            mean: sum / values.len() as f64,
        })
    }
}

/// Plot-ready data of one signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedSeries {
    pub timestamps: Vec<f64>,
    pub values: Vec<f64>,
    pub stats: Option<SeriesStats>,
}

impl PreparedSeries {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Result of preparing a selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedSelection {
    /// Non-empty series by key
    pub series: BTreeMap<String, PreparedSeries>,
    /// Window actually applied
    pub window: TimeWindow,
    /// True if the requested window held no data and the full range was used
    pub window_substituted: bool,
    /// Selected keys the store does not contain
    pub missing_keys: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Prepare the selected series for plotting
///
/// Keys may carry the `"[PDU] "` display prefix. Without a window the full
/// time range of the selected series is used. When a custom window contains
/// no sample of any selected series, the full range is substituted and
/// `window_substituted` is set.
pub fn prepare<K: AsRef<str>>(
    store: &SeriesStore,
    selected_keys: &[K],
    window: Option<TimeWindow>,
    normalize: bool,
) -> Result<PreparedSelection> {
    if let Some(window) = &window {
        window.validate()?;
    }

    let mut resolved: Vec<(&str, &Series)> = Vec::new();
    let mut missing_keys = Vec::new();
    let mut diagnostics = Vec::new();

    for key in selected_keys {
        let key = strip_display_prefix(key.as_ref());
        if resolved.iter().any(|(k, _)| *k == key) {
            continue;
        }
        match store.series(key) {
            Some(series) => resolved.push((key, series)),
            None => {
                log::warn!("Signal '{}' not found in store", key);
                if !missing_keys.iter().any(|k| k == key) {
                    missing_keys.push(key.to_string());
                    diagnostics.push(Diagnostic::new(
                        DiagnosticKind::MissingSignalKey,
                        format!("signal '{}' not found", key),
                    ));
                }
            }
        }
    }

    let full_range = resolved
        .iter()
        .filter_map(|(_, series)| series.time_range())
        .reduce(|(min_a, max_a), (min_b, max_b)| (min_a.min(min_b), max_a.max(max_b)))
        .map(|(start, end)| TimeWindow { start, end })
        .ok_or(DecoderError::NoDataForSelection)?;

    let mut applied = window.unwrap_or(full_range);
    let mut filtered = filter_window(&resolved, &applied);
    let mut window_substituted = false;

    if filtered.is_empty() && window.is_some() {
        log::warn!(
            "No data in window [{}, {}], using full range [{}, {}]",
            applied.start,
            applied.end,
            full_range.start,
            full_range.end
        );
        applied = full_range;
        filtered = filter_window(&resolved, &applied);
        window_substituted = true;
    }

    if filtered.is_empty() {
        return Err(DecoderError::NoDataForSelection);
    }

    let series = filtered
        .into_iter()
        .map(|(key, timestamps, mut values)| {
            if normalize {
                normalize_values(&mut values);
            }
            let stats = SeriesStats::compute(&values);
            (
                key.to_string(),
                PreparedSeries {
                    timestamps,
                    values,
                    stats,
                },
            )
        })
        .collect();

    Ok(PreparedSelection {
        series,
        window: applied,
        window_substituted,
        missing_keys,
        diagnostics,
    })
}

/// Samples inside the window, dropping series that end up empty
fn filter_window<'a>(
    resolved: &[(&'a str, &Series)],
    window: &TimeWindow,
) -> Vec<(&'a str, Vec<f64>, Vec<f64>)> {
    resolved
        .iter()
        .filter_map(|(key, series)| {
            let (timestamps, values): (Vec<f64>, Vec<f64>) = series
                .samples()
                .iter()
                .filter(|s| window.contains(s.timestamp))
                .map(|s| (s.timestamp, s.value))
                .unzip();
            (!timestamps.is_empty()).then_some((*key, timestamps, values))
        })
        .collect()
}

/// Min-max scale to [0, 1]; constant series are left as they are
fn normalize_values(values: &mut [f64]) {
    let Some(stats) = SeriesStats::compute(values) else {
        return;
    };
    let span = stats.max - stats.min;
    if span > 0.0 {
        for v in values.iter_mut() {
            *v = (*v - stats.min) / span;
        }
    }
}
