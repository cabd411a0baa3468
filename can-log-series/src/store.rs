//! Series store
//!
//! Holds the frame table and one series per signal key. A store is built once
//! by a [`SeriesStoreBuilder`] that the ingestion loop owns exclusively;
//! [`SeriesStoreBuilder::finish`] freezes it into an immutable [`SeriesStore`].

use crate::config::IngestConfig;
use crate::decoder::{decode_frame, DecodeMode};
use crate::formats::{open_frame_source, FrameSource, LogInput};
use crate::types::{Diagnostic, DiagnosticKind, DecoderError, Frame, Result, Sample};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Samples of one signal key, in frame arrival order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Series {
    samples: Vec<Sample>,
}

impl Series {
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Minimum and maximum sample timestamp
    pub fn time_range(&self) -> Option<(f64, f64)> {
        time_range(self.samples.iter().map(|s| s.timestamp))
    }
}

/// Counters and diagnostics gathered while building a store
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestReport {
    /// Frames yielded by the source, including filtered ones
    pub frames_read: u64,
    /// Frames rejected by the channel or identifier filter
    pub frames_filtered: u64,
    /// Records the source could not parse
    pub malformed_records: u64,
    /// Frames per identifier that had no message in the schema
    pub unknown_identifiers: BTreeMap<u32, u64>,
    pub diagnostics: Vec<Diagnostic>,
    /// Diagnostics not stored because `max_diagnostics` was reached
    pub dropped_diagnostics: u64,
    /// Measurement start recorded in the log header
    pub measurement_start: Option<NaiveDateTime>,
}

impl IngestReport {
    /// Number of diagnostics of one kind (stored ones only)
    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.diagnostics.iter().filter(|d| d.kind == kind).count()
    }
}

/// Frozen result of an ingestion
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SeriesStore {
    frames: Vec<Frame>,
    series: BTreeMap<String, Series>,
    report: IngestReport,
}

impl SeriesStore {
    /// All stored frames in arrival order
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn series(&self, key: &str) -> Option<&Series> {
        self.series.get(key)
    }

    /// Signal keys in sorted order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Series)> {
        self.series.iter().map(|(k, s)| (k.as_str(), s))
    }

    pub fn report(&self) -> &IngestReport {
        &self.report
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Distinct identifiers seen in the frame table, sorted
    pub fn identifiers(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.frames.iter().map(|f| f.identifier).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Largest declared length of any frame with this identifier
    pub fn max_declared_length(&self, identifier: u32) -> Option<usize> {
        self.frames
            .iter()
            .filter(|f| f.identifier == identifier)
            .map(|f| f.declared_length)
            .max()
    }

    /// Minimum and maximum frame timestamp
    pub fn time_range(&self) -> Option<(f64, f64)> {
        time_range(self.frames.iter().map(|f| f.timestamp))
    }

    /// Decode the same frames again with another mode (e.g. after a schema
    /// was loaded). Source-level counters and malformed record diagnostics
    /// carry over; decoder diagnostics are regenerated.
    pub fn redecode(&self, mode: DecodeMode, config: &IngestConfig) -> SeriesStore {
        log::info!("Re-decoding {} frames", self.frames.len());

        let mut builder = SeriesStoreBuilder::new(mode, config);
        builder.report.frames_read = self.report.frames_read;
        builder.report.frames_filtered = self.report.frames_filtered;
        builder.report.malformed_records = self.report.malformed_records;
        builder.report.measurement_start = self.report.measurement_start;
        for diagnostic in self
            .report
            .diagnostics
            .iter()
            .filter(|d| d.kind == DiagnosticKind::MalformedRecord)
        {
            builder.record(diagnostic.clone());
        }

        for frame in &self.frames {
            builder.push_frame(frame.clone());
        }
        builder.finish()
    }
}

/// Exclusively owned accumulator for one ingestion
pub struct SeriesStoreBuilder {
    mode: DecodeMode,
    max_diagnostics: usize,
    frames: Vec<Frame>,
    series: BTreeMap<String, Vec<Sample>>,
    report: IngestReport,
}

impl SeriesStoreBuilder {
    pub fn new(mode: DecodeMode, config: &IngestConfig) -> Self {
        Self {
            mode,
            max_diagnostics: config.max_diagnostics,
            frames: Vec::new(),
            series: BTreeMap::new(),
            report: IngestReport::default(),
        }
    }

    /// Decode a frame and append it and its samples
    pub fn push_frame(&mut self, frame: Frame) {
        let decoded = decode_frame(&frame, &self.mode);

        for (key, sample) in decoded.samples {
            self.series.entry(key).or_default().push(sample);
        }
        for diagnostic in decoded.diagnostics {
            if diagnostic.kind == DiagnosticKind::UnknownIdentifier {
                let count = self
                    .report
                    .unknown_identifiers
                    .entry(frame.identifier)
                    .or_insert(0);
                *count += 1;
                if *count > 1 {
                    continue;
                }
            }
            self.record(diagnostic);
        }

        self.frames.push(frame);
    }

    /// Record a record the source failed to parse
    pub fn record_malformed(&mut self, position: u64, reason: &str) {
        self.report.malformed_records += 1;
        self.record(Diagnostic::new(
            DiagnosticKind::MalformedRecord,
            format!("record {}: {}", position, reason),
        ));
    }

    pub fn record(&mut self, diagnostic: Diagnostic) {
        if self.report.diagnostics.len() >= self.max_diagnostics {
            log::debug!("Diagnostic dropped: {}", diagnostic);
            self.report.dropped_diagnostics += 1;
            return;
        }
        log::warn!("{}", diagnostic);
        self.report.diagnostics.push(diagnostic);
    }

    pub fn set_measurement_start(&mut self, start: Option<NaiveDateTime>) {
        self.report.measurement_start = start;
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Freeze into an immutable store
    pub fn finish(self) -> SeriesStore {
        let series = self
            .series
            .into_iter()
            .filter(|(_, samples)| !samples.is_empty())
            .map(|(key, samples)| (key, Series { samples }))
            .collect();

        SeriesStore {
            frames: self.frames,
            series,
            report: self.report,
        }
    }
}

/// Integer percent progress at a fixed step
struct ProgressTracker {
    step: u8,
    total: Option<u64>,
    last: u8,
    started: bool,
}

impl ProgressTracker {
    fn new(step: u8, total: Option<u64>) -> Self {
        Self {
            step: step.clamp(1, 100),
            total: total.filter(|&t| t > 0),
            last: 0,
            started: false,
        }
    }

    /// Emits the initial 0 once, after the first cancellation check
    fn start(&mut self, progress: &mut dyn FnMut(u8)) {
        if !self.started {
            self.started = true;
            progress(0);
        }
    }

    fn update(&mut self, consumed: u64, progress: &mut dyn FnMut(u8)) {
        let Some(total) = self.total else {
            return;
        };
        // 100 is reserved for completion
        let percent = ((consumed.saturating_mul(100) / total).min(99)) as u8;
        let stepped = percent - percent % self.step;
        if stepped > self.last {
            self.last = stepped;
            progress(stepped);
        }
    }

    fn finish(&mut self, progress: &mut dyn FnMut(u8)) {
        self.start(progress);
        self.last = 100;
        progress(100);
    }
}

/// Consume a frame source into a store
///
/// `progress` receives non-decreasing percentages, starting at 0 and ending
/// at 100 on success. `cancel` is checked before every record; a cancelled
/// build returns [`DecoderError::Cancelled`] and drops everything built so far.
pub fn ingest<S>(
    source: &mut S,
    mode: DecodeMode,
    config: &IngestConfig,
    progress: &mut dyn FnMut(u8),
    cancel: &AtomicBool,
) -> Result<SeriesStore>
where
    S: FrameSource + ?Sized,
{
    let mut tracker = ProgressTracker::new(config.progress_step, source.estimated_total());
    let mut builder = SeriesStoreBuilder::new(mode, config);
    let mut consumed = 0u64;

    loop {
        if cancel.load(Ordering::Relaxed) {
            log::info!("Ingestion cancelled after {} records", consumed);
            return Err(DecoderError::Cancelled);
        }
        tracker.start(progress);

        let Some(item) = source.next() else {
            break;
        };
        consumed += 1;

        match item {
            Ok(frame) => {
                builder.report.frames_read += 1;
                if !config.should_process_frame(frame.channel, frame.identifier) {
                    builder.report.frames_filtered += 1;
                } else {
                    builder.push_frame(frame);
                    if config.max_frames.is_some_and(|max| builder.frame_count() >= max) {
                        log::info!("Frame limit of {} reached", builder.frame_count());
                        break;
                    }
                }
            }
            Err(DecoderError::MalformedRecord { position, reason }) => {
                builder.record_malformed(position, &reason);
            }
            Err(e) => {
                log::error!("Ingestion failed: {}", e);
                return Err(e);
            }
        }

        tracker.update(consumed, progress);
    }

    builder.set_measurement_start(source.measurement_start());
    let store = builder.finish();
    tracker.finish(progress);

    log::info!(
        "Ingested {} frames into {} series ({} malformed records, {} unknown identifiers)",
        store.frames.len(),
        store.series.len(),
        store.report.malformed_records,
        store.report.unknown_identifiers.len()
    );
    Ok(store)
}

/// Open the frame source for `input` and ingest it
pub fn ingest_input(
    input: LogInput,
    mode: DecodeMode,
    config: &IngestConfig,
    progress: &mut dyn FnMut(u8),
    cancel: &AtomicBool,
) -> Result<SeriesStore> {
    let mut source = open_frame_source(input)?;
    ingest(source.as_mut(), mode, config, progress, cancel)
}

fn time_range(timestamps: impl Iterator<Item = f64>) -> Option<(f64, f64)> {
    timestamps.fold(None, |range, t| match range {
        None => Some((t, t)),
        Some((min, max)) => Some((min.min(t), max.max(t))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{MessageSchema, SchemaAdapter, SignalSchema};

    /// In-memory frame source for driving the ingestion loop
    struct VecSource {
        items: std::vec::IntoIter<Result<Frame>>,
        estimate: Option<u64>,
    }

    impl VecSource {
        fn new(items: Vec<Result<Frame>>, with_estimate: bool) -> Self {
            let estimate = with_estimate.then_some(items.len() as u64);
            Self {
                items: items.into_iter(),
                estimate,
            }
        }
    }

    impl Iterator for VecSource {
        type Item = Result<Frame>;

        fn next(&mut self) -> Option<Self::Item> {
            self.items.next()
        }
    }

    impl FrameSource for VecSource {
        fn estimated_total(&self) -> Option<u64> {
            self.estimate
        }
    }

    fn run(items: Vec<Result<Frame>>, mode: DecodeMode, config: &IngestConfig) -> (Result<SeriesStore>, Vec<u8>) {
        let mut source = VecSource::new(items, true);
        let mut reported = Vec::new();
        let cancel = AtomicBool::new(false);
        let result = ingest(&mut source, mode, config, &mut |p| reported.push(p), &cancel);
        (result, reported)
    }

    fn engine_mode() -> DecodeMode {
        DecodeMode::from(
            SchemaAdapter::from_messages(vec![MessageSchema {
                identifier: 0x100,
                name: "Engine".to_string(),
                size: 8,
                sender: None,
                signals: vec![SignalSchema::new("RPM", 0, 16)],
                is_multiplexed: false,
                multiplexer_signal: None,
            }])
            .unwrap(),
        )
    }

    #[test]
    fn test_raw_ingestion() {
        let frames = vec![
            Ok(Frame::new(0.0, 0x10, vec![1, 2])),
            Ok(Frame::new(0.1, 0x10, vec![3, 4])),
            Ok(Frame::new(0.2, 0x20, vec![5])),
        ];
        let (store, _) = run(frames, DecodeMode::RawBytes, &IngestConfig::default());
        let store = store.unwrap();

        assert_eq!(store.frames().len(), 3);
        assert_eq!(store.keys().collect::<Vec<_>>(), vec!["ID_0x10.Byte0", "ID_0x10.Byte1", "ID_0x20.Byte0"]);
        let byte1 = store.series("ID_0x10.Byte1").unwrap();
        assert_eq!(byte1.samples(), &[Sample::new(0.0, 2.0), Sample::new(0.1, 4.0)]);
        assert_eq!(store.identifiers(), vec![0x10, 0x20]);
        assert_eq!(store.max_declared_length(0x10), Some(2));
        assert_eq!(store.time_range(), Some((0.0, 0.2)));
    }

    #[test]
    fn test_progress_is_monotonic_and_completes() {
        let frames = (0..250).map(|i| Ok(Frame::new(i as f64, 0x1, vec![0]))).collect();
        let config = IngestConfig::default().with_progress_step(10);
        let (store, reported) = run(frames, DecodeMode::RawBytes, &config);

        assert!(store.is_ok());
        assert_eq!(reported.first(), Some(&0));
        assert_eq!(reported.last(), Some(&100));
        assert!(reported.windows(2).all(|w| w[0] < w[1]));
        assert!(reported.iter().all(|p| p % 10 == 0));
    }

    #[test]
    fn test_progress_without_estimate() {
        let mut source = VecSource::new(vec![Ok(Frame::new(0.0, 0x1, vec![0]))], false);
        let mut reported = Vec::new();
        let cancel = AtomicBool::new(false);
        ingest(&mut source, DecodeMode::RawBytes, &IngestConfig::default(), &mut |p| reported.push(p), &cancel).unwrap();
        assert_eq!(reported, vec![0, 100]);
    }

    #[test]
    fn test_malformed_records_become_diagnostics() {
        let frames = vec![
            Ok(Frame::new(0.0, 0x10, vec![1])),
            Err(DecoderError::malformed(2, "bad line")),
            Ok(Frame::new(0.2, 0x10, vec![3])),
        ];
        let (store, _) = run(frames, DecodeMode::RawBytes, &IngestConfig::default());
        let store = store.unwrap();

        assert_eq!(store.frames().len(), 2);
        assert_eq!(store.report().malformed_records, 1);
        assert_eq!(store.report().count(DiagnosticKind::MalformedRecord), 1);
    }

    #[test]
    fn test_fatal_error_yields_only_error() {
        let frames = vec![
            Ok(Frame::new(0.0, 0x10, vec![1])),
            Err(DecoderError::IoError(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"))),
        ];
        let (store, reported) = run(frames, DecodeMode::RawBytes, &IngestConfig::default());
        assert!(matches!(store, Err(DecoderError::IoError(_))));
        assert!(!reported.contains(&100));
    }

    #[test]
    fn test_cancelled_build() {
        let mut source = VecSource::new(vec![Ok(Frame::new(0.0, 0x1, vec![0]))], true);
        let mut reported = Vec::new();
        let cancel = AtomicBool::new(true);
        let result = ingest(&mut source, DecodeMode::RawBytes, &IngestConfig::default(), &mut |p| reported.push(p), &cancel);
        assert!(matches!(result, Err(DecoderError::Cancelled)));
        // Cancelled before the first record: not even the initial 0
        assert!(reported.is_empty());
    }

    #[test]
    fn test_out_of_order_timestamps_keep_arrival_order() {
        let frames = [2.0, 0.5, 2.0, 1.0]
            .iter()
            .enumerate()
            .map(|(i, &t)| Ok(Frame::new(t, 0x10, vec![i as u8])))
            .collect();
        let (store, _) = run(frames, DecodeMode::RawBytes, &IngestConfig::default());
        let store = store.unwrap();

        let timestamps: Vec<f64> = store
            .series("ID_0x10.Byte0")
            .unwrap()
            .samples()
            .iter()
            .map(|s| s.timestamp)
            .collect();
        assert_eq!(timestamps, vec![2.0, 0.5, 2.0, 1.0]);
        assert_eq!(store.time_range(), Some((0.5, 2.0)));
        assert_eq!(store.series("ID_0x10.Byte0").unwrap().time_range(), Some((0.5, 2.0)));
    }

    #[test]
    fn test_unknown_identifier_recorded_once() {
        let frames = vec![
            Ok(Frame::new(0.0, 0x100, vec![0x10, 0x00])),
            Ok(Frame::new(0.1, 0x555, vec![1])),
            Ok(Frame::new(0.2, 0x555, vec![2])),
        ];
        let (store, _) = run(frames, engine_mode(), &IngestConfig::default());
        let store = store.unwrap();

        assert_eq!(store.report().count(DiagnosticKind::UnknownIdentifier), 1);
        assert_eq!(store.report().unknown_identifiers.get(&0x555), Some(&2));
        assert_eq!(store.series("Engine.RPM").unwrap().len(), 1);
        // Unknown frames stay in the frame table
        assert_eq!(store.frames().len(), 3);
    }

    #[test]
    fn test_filters_and_limits() {
        let frames = vec![
            Ok(Frame::new(0.0, 0x10, vec![1]).with_channel(0)),
            Ok(Frame::new(0.1, 0x10, vec![2]).with_channel(1)),
            Ok(Frame::new(0.2, 0x20, vec![3]).with_channel(0)),
            Ok(Frame::new(0.3, 0x10, vec![4]).with_channel(0)),
        ];
        let config = IngestConfig::default()
            .with_channel_filter(vec![0])
            .with_message_filter(vec![0x10])
            .with_max_frames(1);
        let (store, _) = run(frames, DecodeMode::RawBytes, &config);
        let store = store.unwrap();

        assert_eq!(store.frames().len(), 1);
        assert_eq!(store.frames()[0].timestamp, 0.0);
    }

    #[test]
    fn test_diagnostic_cap() {
        let frames = (0..5)
            .map(|i| Err(DecoderError::malformed(i, "broken")))
            .collect();
        let config = IngestConfig::default().with_max_diagnostics(2);
        let (store, _) = run(frames, DecodeMode::RawBytes, &config);
        let report = store.unwrap().report().clone();

        assert_eq!(report.malformed_records, 5);
        assert_eq!(report.diagnostics.len(), 2);
        assert_eq!(report.dropped_diagnostics, 3);
    }

    #[test]
    fn test_redecode_with_schema() {
        let frames = vec![
            Ok(Frame::new(0.0, 0x100, vec![0x10, 0x27])),
            Err(DecoderError::malformed(2, "bad")),
        ];
        let config = IngestConfig::default();
        let (raw, _) = run(frames, DecodeMode::RawBytes, &config);
        let raw = raw.unwrap();
        assert!(raw.series("ID_0x100.Byte0").is_some());

        let decoded = raw.redecode(engine_mode(), &config);
        assert!(raw.series("Engine.RPM").is_none());
        assert_eq!(decoded.series("Engine.RPM").unwrap().samples()[0].value, 10000.0);
        assert_eq!(decoded.frames(), raw.frames());
        assert_eq!(decoded.report().malformed_records, 1);

        // Same frames, same mode: equal stores
        assert_eq!(decoded, raw.redecode(engine_mode(), &config));
    }
}
