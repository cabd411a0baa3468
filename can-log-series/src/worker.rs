//! Background ingestion and preparation
//!
//! Both jobs run on their own `std::thread` and report back over
//! `std::sync::mpsc` channels, so a front end never blocks on file I/O. A
//! [`Session`] enforces at most one running job of each kind.

use crate::config::IngestConfig;
use crate::decoder::DecodeMode;
use crate::formats::LogInput;
use crate::prepare::{prepare, PreparedSelection, TimeWindow};
use crate::store::{ingest_input, SeriesStore};
use crate::types::{DecoderError, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Messages sent from an ingestion worker
#[derive(Debug)]
pub enum IngestEvent {
    /// Percent complete, non-decreasing
    Progress(u8),
    /// Terminal: the finished store
    Completed(Box<SeriesStore>),
    /// Terminal: the ingestion failed
    Failed(DecoderError),
}

impl IngestEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, IngestEvent::Progress(_))
    }
}

/// What to ingest. Paths are opened on the worker thread.
#[derive(Debug)]
pub enum IngestRequest {
    Path(PathBuf),
    Input(LogInput),
}

impl From<PathBuf> for IngestRequest {
    fn from(path: PathBuf) -> Self {
        IngestRequest::Path(path)
    }
}

impl From<LogInput> for IngestRequest {
    fn from(input: LogInput) -> Self {
        IngestRequest::Input(input)
    }
}

/// Handle to a running ingestion
pub struct IngestHandle {
    events: Receiver<IngestEvent>,
    cancel: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl IngestHandle {
    pub fn events(&self) -> &Receiver<IngestEvent> {
        &self.events
    }

    /// Ask the worker to stop. It emits nothing further.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Block until the terminal event; progress is passed to `on_progress`
    pub fn wait(self, mut on_progress: impl FnMut(u8)) -> Result<SeriesStore> {
        let outcome = loop {
            match self.events.recv() {
                Ok(IngestEvent::Progress(percent)) => on_progress(percent),
                Ok(IngestEvent::Completed(store)) => break Ok(*store),
                Ok(IngestEvent::Failed(e)) => break Err(e),
                // Worker exited without a terminal event: it was cancelled
                Err(_) => break Err(DecoderError::Cancelled),
            }
        };
        self.join();
        outcome
    }

    fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Ingestion worker panicked");
            }
        }
    }
}

/// Start ingesting on a new thread
pub fn spawn_ingest(
    request: impl Into<IngestRequest>,
    mode: DecodeMode,
    config: IngestConfig,
) -> IngestHandle {
    let request = request.into();
    let (tx, rx) = mpsc::channel();
    let cancel = Arc::new(AtomicBool::new(false));
    let worker_cancel = Arc::clone(&cancel);

    let thread = std::thread::spawn(move || {
        let progress_tx = tx.clone();
        let mut on_progress = |percent: u8| {
            if !worker_cancel.load(Ordering::Relaxed) {
                let _ = progress_tx.send(IngestEvent::Progress(percent));
            }
        };

        let result = match request {
            IngestRequest::Path(path) => LogInput::open(&path),
            IngestRequest::Input(input) => Ok(input),
        }
        .and_then(|input| ingest_input(input, mode, &config, &mut on_progress, &worker_cancel));

        let event = match result {
            Err(DecoderError::Cancelled) => return,
            _ if worker_cancel.load(Ordering::Relaxed) => return,
            Ok(store) => IngestEvent::Completed(Box::new(store)),
            Err(e) => IngestEvent::Failed(e),
        };
        // The receiver may already be gone; nothing to report to then
        let _ = tx.send(event);
    });

    IngestHandle {
        events: rx,
        cancel,
        thread: Some(thread),
    }
}

/// Handle to a running preparation
pub struct PrepareHandle {
    result: Receiver<Result<PreparedSelection>>,
    thread: Option<JoinHandle<()>>,
}

impl PrepareHandle {
    /// Non-blocking poll
    pub fn try_result(&self) -> Option<Result<PreparedSelection>> {
        match self.result.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            // Worker exited without a result
            Err(TryRecvError::Disconnected) => Some(Err(DecoderError::Cancelled)),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    pub fn wait(mut self) -> Result<PreparedSelection> {
        let result = self
            .result
            .recv()
            .unwrap_or(Err(DecoderError::Cancelled));
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Preparation worker panicked");
            }
        }
        result
    }
}

/// Start preparing a selection on a new thread
pub fn spawn_prepare(
    store: Arc<SeriesStore>,
    keys: Vec<String>,
    window: Option<TimeWindow>,
    normalize: bool,
) -> PrepareHandle {
    let (tx, rx) = mpsc::channel();
    let thread = std::thread::spawn(move || {
        let result = prepare(&store, &keys, window, normalize);
        let _ = tx.send(result);
    });

    PrepareHandle {
        result: rx,
        thread: Some(thread),
    }
}

/// Owner of the background jobs of one front end
///
/// At most one ingestion and one preparation run at a time. The latest
/// completed store is published as a shared, read-only `Arc`.
#[derive(Default)]
pub struct Session {
    ingest: Option<IngestHandle>,
    prepare: Option<PrepareHandle>,
    store: Option<Arc<SeriesStore>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an ingestion; `Busy` while another is still running
    pub fn start_ingest(
        &mut self,
        request: impl Into<IngestRequest>,
        mode: DecodeMode,
        config: IngestConfig,
    ) -> Result<&IngestHandle> {
        if self.ingest.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(DecoderError::Busy("ingestion"));
        }
        Ok(&*self.ingest.insert(spawn_ingest(request, mode, config)))
    }

    /// Cancel the running ingestion (if any), wait for it, and start a new one
    pub fn supersede_ingest(
        &mut self,
        request: impl Into<IngestRequest>,
        mode: DecodeMode,
        config: IngestConfig,
    ) -> &IngestHandle {
        if let Some(previous) = self.ingest.take() {
            log::info!("Superseding running ingestion");
            previous.cancel();
            previous.join();
        }
        self.ingest.insert(spawn_ingest(request, mode, config))
    }

    /// Drain ingestion events without blocking. Once a terminal event is
    /// seen the worker is joined; publish a completed store with [`Session::publish`].
    pub fn poll_ingest(&mut self) -> Vec<IngestEvent> {
        let Some(handle) = &self.ingest else {
            return Vec::new();
        };

        let events: Vec<IngestEvent> = handle.events.try_iter().collect();
        if events.iter().any(IngestEvent::is_terminal) {
            if let Some(handle) = self.ingest.take() {
                handle.join();
            }
        }
        events
    }

    /// Block until the running ingestion ends and publish its store
    pub fn wait_ingest(&mut self, on_progress: impl FnMut(u8)) -> Result<Arc<SeriesStore>> {
        let handle = self
            .ingest
            .take()
            .ok_or(DecoderError::Idle("ingestion"))?;
        let store = Arc::new(handle.wait(on_progress)?);
        self.store = Some(Arc::clone(&store));
        Ok(store)
    }

    /// Publish a store built elsewhere (e.g. a re-decode)
    pub fn publish(&mut self, store: SeriesStore) -> Arc<SeriesStore> {
        let store = Arc::new(store);
        self.store = Some(Arc::clone(&store));
        store
    }

    pub fn store(&self) -> Option<Arc<SeriesStore>> {
        self.store.clone()
    }

    /// Start preparing against the published store
    pub fn start_prepare(
        &mut self,
        keys: Vec<String>,
        window: Option<TimeWindow>,
        normalize: bool,
    ) -> Result<&PrepareHandle> {
        if self.prepare.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(DecoderError::Busy("preparation"));
        }
        let store = self.store.clone().ok_or(DecoderError::NoDataForSelection)?;
        Ok(&*self.prepare.insert(spawn_prepare(store, keys, window, normalize)))
    }

    /// Block until the running preparation ends
    pub fn wait_prepare(&mut self) -> Result<PreparedSelection> {
        self.prepare
            .take()
            .ok_or(DecoderError::Idle("preparation"))?
            .wait()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(handle) = self.ingest.take() {
            handle.cancel();
            handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::LogFormat;
    use std::io::{BufRead, Cursor, Read};
    use std::sync::mpsc::Sender;
    use std::time::Duration;

    fn asc_input(lines: usize) -> LogInput {
        let mut text = String::from("base hex  timestamps absolute\n");
        for i in 0..lines {
            text.push_str(&format!("   {}.000000 1  100  Rx   d 2 {:02X} 00\n", i, i % 256));
        }
        let estimate = (lines + 1) as u64;
        LogInput::from_reader(LogFormat::Asc, Cursor::new(text.into_bytes())).with_estimate(estimate)
    }

    /// Reader that blocks until the test releases it
    struct GatedReader {
        inner: Cursor<Vec<u8>>,
        gate: Receiver<()>,
        opened: bool,
    }

    impl Read for GatedReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.opened {
                let _ = self.gate.recv();
                self.opened = true;
            }
            self.inner.read(buf)
        }
    }

    impl BufRead for GatedReader {
        fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
            if !self.opened {
                let _ = self.gate.recv();
                self.opened = true;
            }
            self.inner.fill_buf()
        }

        fn consume(&mut self, amt: usize) {
            self.inner.consume(amt)
        }
    }

    fn gated_input() -> (LogInput, Sender<()>) {
        let (tx, rx) = mpsc::channel();
        let reader = GatedReader {
            inner: Cursor::new(b"   0.000000 1  100  Rx   d 1 01\n".to_vec()),
            gate: rx,
            opened: false,
        };
        (LogInput::from_reader(LogFormat::Asc, reader), tx)
    }

    #[test]
    fn test_ingest_reports_progress_then_completes() {
        let handle = spawn_ingest(asc_input(200), DecodeMode::RawBytes, IngestConfig::default());
        let mut progress = Vec::new();
        let store = handle.wait(|p| progress.push(p)).unwrap();

        assert_eq!(store.frames().len(), 200);
        assert_eq!(progress.first(), Some(&0));
        assert_eq!(progress.last(), Some(&100));
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_ingest_failure_is_reported() {
        let handle = spawn_ingest(
            PathBuf::from("no_such_dir/missing.asc"),
            DecodeMode::RawBytes,
            IngestConfig::default(),
        );
        assert!(matches!(handle.wait(|_| {}), Err(DecoderError::IoError(_))));
    }

    #[test]
    fn test_cancelled_ingest_emits_nothing_terminal() {
        let (input, gate) = gated_input();
        let handle = spawn_ingest(input, DecodeMode::RawBytes, IngestConfig::default());
        handle.cancel();
        let _ = gate.send(());

        let events: Vec<IngestEvent> = handle.events().iter().collect();
        assert!(events.iter().all(|e| !e.is_terminal()));
    }

    #[test]
    fn test_session_rejects_second_ingest() {
        let (input, gate) = gated_input();
        let mut session = Session::new();
        session
            .start_ingest(input, DecodeMode::RawBytes, IngestConfig::default())
            .unwrap();

        let second = session.start_ingest(asc_input(1), DecodeMode::RawBytes, IngestConfig::default());
        assert!(matches!(second, Err(DecoderError::Busy(_))));

        let _ = gate.send(());
        let store = session.wait_ingest(|_| {}).unwrap();
        assert_eq!(store.frames().len(), 1);
        assert!(session.store().is_some());
    }

    #[test]
    fn test_supersede_ingest() {
        let (input, gate) = gated_input();
        let mut session = Session::new();
        session
            .start_ingest(input, DecodeMode::RawBytes, IngestConfig::default())
            .unwrap();

        // Unblocks the first worker so it can observe the cancellation
        drop(gate);
        session.supersede_ingest(asc_input(3), DecodeMode::RawBytes, IngestConfig::default());
        let store = session.wait_ingest(|_| {}).unwrap();
        assert_eq!(store.frames().len(), 3);
    }

    #[test]
    fn test_prepare_in_background() {
        let mut session = Session::new();
        assert!(session.start_prepare(vec![], None, false).is_err());

        session
            .start_ingest(asc_input(5), DecodeMode::RawBytes, IngestConfig::default())
            .unwrap();
        session.wait_ingest(|_| {}).unwrap();

        session
            .start_prepare(vec!["ID_0x100.Byte0".to_string()], None, false)
            .unwrap();
        let prepared = session.wait_prepare().unwrap();
        assert_eq!(prepared.series["ID_0x100.Byte0"].values, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_poll_ingest_collects_terminal_event() {
        let mut session = Session::new();
        session
            .start_ingest(asc_input(2), DecodeMode::RawBytes, IngestConfig::default())
            .unwrap();

        let mut events = Vec::new();
        for _ in 0..500 {
            events.extend(session.poll_ingest());
            if events.iter().any(IngestEvent::is_terminal) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(matches!(events.last(), Some(IngestEvent::Completed(_))));
    }
}
