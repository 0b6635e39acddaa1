//! Adaptive persistence: routes per-line dirty notifications into
//! write-through, debounced or best-effort flushing based on the observed
//! write rate.
//!
//! A single background thread owns the timer: it wakes on a control channel
//! (or every `idle_threshold / 2`) and flushes when a debounce deadline has
//! passed or best-effort work has gone idle. Flushes clone lines out of the
//! memory buffer before encoding, so the background thread never holds a
//! pointer into the live ring. Content is written first, then the metadata
//! slot, then one fsync, so recovered metadata always refers to content
//! that is also on disk.

use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::buffer::{GlobalIdx, MemoryBuffer};
use crate::config::PersistConfig;
use crate::store::wal::ViewportMeta;
use crate::store::DiskStore;

/// Current flushing mode, selected per write from the rate estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistMode {
    #[default]
    WriteThrough,
    Debounced,
    BestEffort,
}

/// Monotonic counters exposed to the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct PersistenceMetrics {
    pub flushed_lines: u64,
    pub failed_writes: u64,
    pub flushes: u64,
    pub pending: usize,
    pub mode: PersistMode,
}

/// A line that became durable; handed to the search-index hook.
#[derive(Debug, Clone, Copy)]
pub struct IndexedLine {
    pub global_idx: GlobalIdx,
    pub timestamp_ns: i64,
    pub is_command: bool,
}

/// Called once per durable line, strictly after the WAL append succeeded.
pub type IndexHook = Box<dyn FnMut(IndexedLine) + Send>;

#[derive(Debug, Clone, Copy)]
struct PendingWrite {
    timestamp_ns: i64,
    is_command: bool,
}

enum ControlMsg {
    Kick,
    Shutdown,
}

#[derive(Default)]
struct PersistState {
    rate_window: VecDeque<Instant>,
    pending: BTreeMap<GlobalIdx, PendingWrite>,
    pending_meta: Option<ViewportMeta>,
    last_activity: Option<Instant>,
    flush_deadline: Option<Instant>,
    mode: PersistMode,
    flushed_lines: u64,
    failed_writes: u64,
    flushes: u64,
    index_hook: Option<IndexHook>,
    closed: bool,
}

struct Shared {
    cfg: PersistConfig,
    state: Mutex<PersistState>,
    buffer: Arc<RwLock<MemoryBuffer>>,
    store: Arc<Mutex<DiskStore>>,
}

/// The rate-aware persistence controller.
pub struct AdaptivePersistence {
    shared: Arc<Shared>,
    tx: mpsc::Sender<ControlMsg>,
    worker: Option<JoinHandle<()>>,
}

impl AdaptivePersistence {
    pub fn new(
        cfg: PersistConfig,
        buffer: Arc<RwLock<MemoryBuffer>>,
        store: Arc<Mutex<DiskStore>>,
    ) -> Self {
        let shared = Arc::new(Shared {
            cfg,
            state: Mutex::new(PersistState::default()),
            buffer,
            store,
        });
        let (tx, rx) = mpsc::channel();
        let worker_shared = Arc::clone(&shared);
        let worker = thread::spawn(move || Shared::worker_loop(worker_shared, rx));
        AdaptivePersistence {
            shared,
            tx,
            worker: Some(worker),
        }
    }

    /// Register the search-index hook. Never called for a line that is not
    /// yet durable.
    pub fn set_index_hook(&self, hook: IndexHook) {
        self.shared.state.lock().expect("persist state poisoned").index_hook = Some(hook);
    }

    /// One dirty-line notification from the producer.
    pub fn notify_write(&self, g: GlobalIdx, timestamp_ns: i64, is_command: bool) {
        let now = Instant::now();
        let mode = {
            let mut st = self.shared.state.lock().expect("persist state poisoned");
            if st.closed {
                return;
            }
            st.rate_window.push_back(now);
            while st.rate_window.len() > self.shared.cfg.rate_window_size.max(2) {
                st.rate_window.pop_front();
            }
            let rate = Self::write_rate(&st.rate_window, now);
            st.last_activity = Some(now);
            st.pending.insert(
                g,
                PendingWrite {
                    timestamp_ns,
                    is_command,
                },
            );
            st.mode = if rate <= self.shared.cfg.write_through_max {
                PersistMode::WriteThrough
            } else if rate <= self.shared.cfg.debounced_max {
                PersistMode::Debounced
            } else {
                PersistMode::BestEffort
            };
            match st.mode {
                PersistMode::Debounced => {
                    let t = (rate / self.shared.cfg.debounced_max).clamp(0.0, 1.0);
                    let min = self.shared.cfg.debounce_min_ms as f64;
                    let max = self.shared.cfg.debounce_max_ms as f64;
                    let delay = Duration::from_millis((min + (max - min) * t) as u64);
                    st.flush_deadline = Some(now + delay);
                }
                PersistMode::BestEffort => st.flush_deadline = None,
                PersistMode::WriteThrough => {}
            }
            st.mode
        };
        match mode {
            PersistMode::WriteThrough => {
                if let Err(err) = Shared::flush(&self.shared) {
                    tracing::error!("write-through flush failed: {err:#}");
                }
            }
            PersistMode::Debounced => {
                let _ = self.tx.send(ControlMsg::Kick);
            }
            PersistMode::BestEffort => {}
        }
    }

    /// Writes per second over the sliding window.
    fn write_rate(window: &VecDeque<Instant>, now: Instant) -> f64 {
        let Some(&oldest) = window.front() else {
            return 0.0;
        };
        // A floor on the span keeps a short first burst from reading as an
        // infinite rate.
        let span = now.duration_since(oldest).as_secs_f64().max(0.1);
        window.len() as f64 / span
    }

    /// Overwrite the single pending metadata slot; it is written at the end
    /// of the next flush, after content, under the same fsync.
    pub fn notify_metadata_change(&self, meta: ViewportMeta) {
        let mut st = self.shared.state.lock().expect("persist state poisoned");
        if !st.closed {
            st.pending_meta = Some(meta);
        }
    }

    /// Flush everything pending now.
    pub fn flush(&self) -> Result<()> {
        Shared::flush(&self.shared)
    }

    pub fn metrics(&self) -> PersistenceMetrics {
        let st = self.shared.state.lock().expect("persist state poisoned");
        PersistenceMetrics {
            flushed_lines: st.flushed_lines,
            failed_writes: st.failed_writes,
            flushes: st.flushes,
            pending: st.pending.len(),
            mode: st.mode,
        }
    }

    /// Stop the background thread, drain pending work, fsync and close the
    /// store. Idempotent; returns the first error without abandoning the
    /// remaining steps.
    pub fn close(&mut self) -> Result<()> {
        {
            let mut st = self.shared.state.lock().expect("persist state poisoned");
            st.closed = true;
        }
        let _ = self.tx.send(ControlMsg::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        let flush_result = Shared::flush(&self.shared);
        let close_result = self
            .shared
            .store
            .lock()
            .expect("disk store lock poisoned")
            .close();
        flush_result.and(close_result)
    }
}

impl Drop for AdaptivePersistence {
    fn drop(&mut self) {
        let _ = self.tx.send(ControlMsg::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Shared {
    fn worker_loop(shared: Arc<Shared>, rx: mpsc::Receiver<ControlMsg>) {
        let tick = Duration::from_millis(shared.cfg.idle_threshold_ms.max(2) / 2);
        loop {
            let timeout = {
                let st = shared.state.lock().expect("persist state poisoned");
                match st.flush_deadline {
                    Some(deadline) => deadline
                        .saturating_duration_since(Instant::now())
                        .min(tick),
                    None => tick,
                }
            };
            match rx.recv_timeout(timeout) {
                Ok(ControlMsg::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(ControlMsg::Kick) | Err(RecvTimeoutError::Timeout) => {}
            }
            let now = Instant::now();
            let should_flush = {
                let st = shared.state.lock().expect("persist state poisoned");
                if st.closed {
                    break;
                }
                let deadline_passed = st.flush_deadline.is_some_and(|d| d <= now);
                let idle = st.mode == PersistMode::BestEffort
                    && !st.pending.is_empty()
                    && st.last_activity.is_some_and(|t| {
                        now.duration_since(t)
                            >= Duration::from_millis(shared.cfg.idle_threshold_ms)
                    });
                deadline_passed || idle
            };
            if should_flush {
                if let Err(err) = Shared::flush(&shared) {
                    tracing::error!("background flush failed: {err:#}");
                }
            }
        }
    }

    /// Ship pending content, then the metadata slot, then fsync once.
    fn flush(shared: &Arc<Shared>) -> Result<()> {
        let (batch, meta) = {
            let mut st = shared.state.lock().expect("persist state poisoned");
            st.flush_deadline = None;
            (std::mem::take(&mut st.pending), st.pending_meta.take())
        };
        if batch.is_empty() && meta.is_none() {
            return Ok(());
        }

        // Snapshot lines without holding the buffer lock across I/O.
        let mut lines = Vec::with_capacity(batch.len());
        {
            let buf = shared.buffer.read().expect("memory buffer lock poisoned");
            for (&g, write) in &batch {
                match buf.clone_line(g) {
                    Some(line) => lines.push((g, *write, line)),
                    // Dirty lines are never evicted, so a miss means the
                    // line vanished legitimately (e.g. cleared dirty flag
                    // after a concurrent flush).
                    None => tracing::debug!(g, "pending line no longer resident; skipping"),
                }
            }
        }

        let mut succeeded: Vec<(GlobalIdx, PendingWrite)> = Vec::new();
        let mut failed: Vec<(GlobalIdx, PendingWrite)> = Vec::new();
        let mut first_err: Option<anyhow::Error> = None;
        let mut meta_failed = None;
        {
            let mut store = shared.store.lock().expect("disk store lock poisoned");
            for (g, write, line) in &lines {
                match store.write_line(*g, line) {
                    Ok(()) => succeeded.push((*g, *write)),
                    Err(err) => {
                        tracing::error!("WAL write for line {g} failed: {err:#}");
                        failed.push((*g, *write));
                        first_err.get_or_insert(err);
                    }
                }
            }
            if let Some(meta) = meta {
                if let Err(err) = store.write_metadata(&meta) {
                    tracing::error!("metadata write failed: {err:#}");
                    meta_failed = Some(meta);
                    first_err.get_or_insert(err);
                }
            }
            if let Err(err) = store.sync() {
                // Durability is unknown for the whole batch; leave every
                // line dirty for retry.
                tracing::error!("WAL fsync failed: {err:#}");
                failed.append(&mut succeeded);
                first_err.get_or_insert(err);
            } else if let Err(err) = store.maybe_checkpoint() {
                tracing::error!("checkpoint failed: {err:#}");
                first_err.get_or_insert(err);
            }
        }

        // Only durable lines lose their dirty flag.
        if !succeeded.is_empty() {
            let mut buf = shared.buffer.write().expect("memory buffer lock poisoned");
            for (g, _) in &succeeded {
                buf.clear_dirty(*g);
            }
        }

        {
            let mut st = shared.state.lock().expect("persist state poisoned");
            st.flushes += 1;
            st.flushed_lines += succeeded.len() as u64;
            st.failed_writes += failed.len() as u64;
            for (g, write) in failed {
                // Keep the newer pending entry if one arrived mid-flush.
                st.pending.entry(g).or_insert(write);
            }
            if let Some(meta) = meta_failed {
                if st.pending_meta.is_none() {
                    st.pending_meta = Some(meta);
                }
            }
            if let Some(hook) = st.index_hook.as_mut() {
                for (g, write) in &succeeded {
                    hook(IndexedLine {
                        global_idx: *g,
                        timestamp_ns: write.timestamp_ns,
                        is_command: write.is_command,
                    });
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{Cell, Style};
    use crate::config::{BufferConfig, PageStoreConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        buffer: Arc<RwLock<MemoryBuffer>>,
        store: Arc<Mutex<DiskStore>>,
        persist: AdaptivePersistence,
    }

    fn fixture(cfg: PersistConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let (store, _) = DiskStore::open(
            dir.path(),
            "t",
            &PageStoreConfig::default(),
            &cfg,
        )
        .unwrap();
        let buffer = Arc::new(RwLock::new(MemoryBuffer::new(
            &BufferConfig::default(),
            80,
        )));
        let store = Arc::new(Mutex::new(store));
        let persist = AdaptivePersistence::new(cfg, buffer.clone(), store.clone());
        Fixture {
            _dir: dir,
            buffer,
            store,
            persist,
        }
    }

    fn write(fix: &Fixture, g: GlobalIdx, text: &str) -> i64 {
        let mut buf = fix.buffer.write().unwrap();
        for (i, c) in text.chars().enumerate() {
            buf.write_cell(g, i, Cell::new(c, Style::default()));
        }
        buf.get_line(g).unwrap().updated_at_ns()
    }

    #[test]
    fn write_through_is_synchronous() {
        let fix = fixture(PersistConfig::default());
        let ts = write(&fix, 0, "hello");
        fix.persist.notify_write(0, ts, false);
        // No explicit flush: the line is already in the store.
        let mut store = fix.store.lock().unwrap();
        assert_eq!(store.read_line(0).unwrap().unwrap().text(), "hello");
        drop(store);
        assert!(!fix.buffer.read().unwrap().is_dirty(0));
        assert_eq!(fix.persist.metrics().flushed_lines, 1);
    }

    #[test]
    fn burst_defers_then_flush_ships_everything() {
        let cfg = PersistConfig {
            write_through_max: 0.0, // force deferral
            debounced_max: 0.0,     // straight to best-effort
            ..PersistConfig::default()
        };
        let fix = fixture(cfg);
        for g in 0..20u64 {
            let ts = write(&fix, g, &format!("line {g}"));
            fix.persist.notify_write(g, ts, false);
        }
        assert_eq!(fix.persist.metrics().mode, PersistMode::BestEffort);
        assert_eq!(fix.persist.metrics().pending, 20);
        {
            let mut store = fix.store.lock().unwrap();
            assert!(store.read_line(5).unwrap().is_none());
        }
        fix.persist.flush().unwrap();
        assert_eq!(fix.persist.metrics().pending, 0);
        let mut store = fix.store.lock().unwrap();
        for g in 0..20u64 {
            assert_eq!(
                store.read_line(g).unwrap().unwrap().text(),
                format!("line {g}")
            );
        }
    }

    #[test]
    fn index_hook_fires_once_per_durable_line() {
        let fix = fixture(PersistConfig::default());
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        fix.persist.set_index_hook(Box::new(move |line| {
            assert_eq!(line.global_idx, 0);
            assert!(line.is_command);
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        {
            let mut buf = fix.buffer.write().unwrap();
            buf.ensure_line(0);
            buf.set_line_command(0);
        }
        let ts = write(&fix, 0, "$ make");
        fix.persist.notify_write(0, ts, true);
        fix.persist.flush().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn metadata_is_written_with_content() {
        let cfg = PersistConfig {
            write_through_max: 0.0,
            debounced_max: 0.0,
            ..PersistConfig::default()
        };
        let mut fix = fixture(cfg);
        let ts = write(&fix, 0, "content");
        fix.persist.notify_write(0, ts, false);
        fix.persist.notify_metadata_change(ViewportMeta {
            live_edge_base: 1,
            cursor_x: 5,
            cursor_y: 0,
            scroll_offset: 3,
            saved_at_ns: ts,
        });
        fix.persist.close().unwrap();

        let (_, recovered) = DiskStore::open(
            fix._dir.path(),
            "t",
            &PageStoreConfig::default(),
            &PersistConfig::default(),
        )
        .unwrap();
        let meta = recovered.metadata.unwrap();
        assert_eq!(meta.live_edge_base, 1);
        assert_eq!(meta.scroll_offset, 3);
        assert_eq!(recovered.next_global_idx, 1);
    }

    #[test]
    fn close_is_idempotent() {
        let mut fix = fixture(PersistConfig::default());
        let ts = write(&fix, 0, "x");
        fix.persist.notify_write(0, ts, false);
        fix.persist.close().unwrap();
        fix.persist.close().unwrap();
        // Notifications after close are ignored.
        fix.persist.notify_write(1, ts, false);
        assert_eq!(fix.persist.metrics().pending, 0);
    }

    #[test]
    fn mode_selection_tracks_rate() {
        let cfg = PersistConfig {
            write_through_max: 10.0,
            debounced_max: 100.0,
            ..PersistConfig::default()
        };
        let fix = fixture(cfg);
        // A few spaced notifications stay write-through; a tight burst
        // pushes the estimated rate up.
        let ts = write(&fix, 0, "a");
        fix.persist.notify_write(0, ts, false);
        assert_eq!(fix.persist.metrics().mode, PersistMode::WriteThrough);
        for g in 1..40u64 {
            let ts = write(&fix, g, "b");
            fix.persist.notify_write(g, ts, false);
        }
        assert_ne!(fix.persist.metrics().mode, PersistMode::WriteThrough);
    }
}
