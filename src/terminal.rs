//! The terminal: one content engine instance for one terminal id.
//!
//! Owns the parser, screen model, memory buffer, viewport and persistence
//! controller, and wires recovery on open: pages and WAL are replayed, blank
//! tail lines are trimmed, the memory window is seeded with the live-edge
//! region and the viewport scroll position is restored.

use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;

use crate::buffer::{GlobalIdx, MemoryBuffer};
use crate::cell::Cell;
use crate::config::EngineConfig;
use crate::line::{now_ns, LogicalLine};
use crate::observer::TerminalObserver;
use crate::parser::Parser;
use crate::persist::{AdaptivePersistence, IndexHook, PersistenceMetrics};
use crate::screen::ScreenModel;
use crate::store::wal::ViewportMeta;
use crate::store::DiskStore;
use crate::viewport::ViewportWindow;

/// How far below a claimed live edge the recovery scan looks for content
/// before giving up on trimming.
const BLANK_TAIL_SCAN_LIMIT: u64 = 4096;

pub struct Terminal {
    terminal_id: String,
    parser: Parser,
    screen: ScreenModel,
    buffer: Arc<RwLock<MemoryBuffer>>,
    viewport: ViewportWindow,
    persistence: AdaptivePersistence,
    store: Arc<Mutex<DiskStore>>,
    utf8_tail: Vec<u8>,
    closed: bool,
}

impl Terminal {
    /// Open the terminal `terminal_id`, recovering any persisted state under
    /// `config.persist_dir`.
    pub fn open(
        config: EngineConfig,
        terminal_id: &str,
        observer: Arc<dyn TerminalObserver>,
    ) -> Result<Terminal> {
        let (store, recovered) = DiskStore::open(
            &config.persist_dir,
            terminal_id,
            &config.pages,
            &config.persist,
        )?;
        let mut store = store;
        let next = recovered.next_global_idx;

        // Establish the live edge: metadata when present, else the last
        // screenful of recovered content.
        let claimed = recovered
            .metadata
            .map(|m| m.live_edge_base)
            .unwrap_or_else(|| next.saturating_sub(config.rows as GlobalIdx))
            .min(next);

        // Trim blank tail lines: a live edge pointing past the last real
        // content is clamped back to just after it.
        let live_edge_base = if claimed == 0 {
            0
        } else {
            match store.last_non_blank_before(claimed, BLANK_TAIL_SCAN_LIMIT) {
                Some(last) => (last + 1).min(claimed),
                None => claimed.saturating_sub(BLANK_TAIL_SCAN_LIMIT),
            }
        };
        if live_edge_base != claimed {
            tracing::debug!(claimed, live_edge_base, "trimmed blank tail lines");
        }

        // Seed the memory window with the live-edge region; older lines are
        // served through the viewport's disk fallback.
        let mut membuf = MemoryBuffer::new_at(&config.buffer, config.cols, live_edge_base);
        for (g, line) in store.read_range(live_edge_base, next) {
            membuf.seed_line(g, line);
        }
        if next > live_edge_base {
            membuf.ensure_line(next - 1);
        }
        membuf.take_events();

        let buffer = Arc::new(RwLock::new(membuf));
        let store = Arc::new(Mutex::new(store));
        let mut screen = ScreenModel::new(&config, Arc::clone(&buffer), observer);
        let (cursor_x, cursor_y, scroll_offset) = recovered
            .metadata
            .map(|m| {
                (
                    m.cursor_x.max(0) as u16,
                    m.cursor_y.max(0) as u16,
                    m.scroll_offset.max(0) as u64,
                )
            })
            .unwrap_or((0, 0, 0));
        screen.restore(live_edge_base, cursor_x, cursor_y);

        let mut viewport = ViewportWindow::new(
            &config.viewport,
            Arc::clone(&buffer),
            Arc::downgrade(&store),
            config.cols,
            config.rows,
        );
        viewport.set_live_edge_base(live_edge_base);
        viewport.restore_scroll(scroll_offset);

        let persistence =
            AdaptivePersistence::new(config.persist.clone(), Arc::clone(&buffer), Arc::clone(&store));

        Ok(Terminal {
            terminal_id: terminal_id.to_string(),
            parser: Parser::new(),
            screen,
            buffer,
            viewport,
            persistence,
            store,
            utf8_tail: Vec::new(),
            closed: false,
        })
    }

    pub fn terminal_id(&self) -> &str {
        &self.terminal_id
    }

    pub fn width(&self) -> u16 {
        self.screen.width()
    }

    pub fn height(&self) -> u16 {
        self.screen.height()
    }

    pub fn live_edge_base(&self) -> GlobalIdx {
        self.screen.live_edge_base()
    }

    /// One past the newest line ever produced.
    pub fn global_end(&self) -> GlobalIdx {
        self.buffer
            .read()
            .expect("memory buffer lock poisoned")
            .global_end()
    }

    /// Feed raw PTY bytes. Invalid UTF-8 becomes U+FFFD without
    /// desynchronising the parser; an incomplete trailing sequence is kept
    /// for the next call.
    pub fn feed(&mut self, bytes: &[u8]) {
        if self.closed {
            tracing::warn!("feed after close ignored");
            return;
        }
        let data: Vec<u8>;
        let mut input: &[u8] = if self.utf8_tail.is_empty() {
            bytes
        } else {
            let mut joined = std::mem::take(&mut self.utf8_tail);
            joined.extend_from_slice(bytes);
            data = joined;
            &data
        };
        while !input.is_empty() {
            match std::str::from_utf8(input) {
                Ok(valid) => {
                    for c in valid.chars() {
                        self.parser.advance(&mut self.screen, c);
                    }
                    input = &[];
                }
                Err(err) => {
                    let (valid, rest) = input.split_at(err.valid_up_to());
                    for c in std::str::from_utf8(valid).unwrap_or_default().chars() {
                        self.parser.advance(&mut self.screen, c);
                    }
                    match err.error_len() {
                        Some(bad) => {
                            self.parser.advance(&mut self.screen, char::REPLACEMENT_CHARACTER);
                            input = &rest[bad..];
                        }
                        None => {
                            // Truncated trailing sequence; wait for more bytes.
                            self.utf8_tail = rest.to_vec();
                            input = &[];
                        }
                    }
                }
            }
        }
        self.after_mutation();
    }

    /// Forward buffered write events and the current viewport metadata to
    /// the persistence controller, in producer order.
    fn after_mutation(&mut self) {
        let events = self
            .buffer
            .write()
            .expect("memory buffer lock poisoned")
            .take_events();
        for ev in events {
            self.persistence
                .notify_write(ev.global_idx, ev.timestamp_ns, ev.is_command);
        }
        self.viewport.set_live_edge_base(self.screen.live_edge_base());
        self.persistence.notify_metadata_change(self.current_meta());
    }

    fn current_meta(&self) -> ViewportMeta {
        let (x, y, _) = self.screen.cursor();
        ViewportMeta {
            live_edge_base: self.screen.live_edge_base(),
            cursor_x: x as i32,
            cursor_y: y as i32,
            scroll_offset: self.viewport.scroll_offset() as i64,
            saved_at_ns: now_ns(),
        }
    }

    /// The visible grid: the alternate screen when active, otherwise the
    /// viewport projection (which honours the scroll position).
    pub fn grid(&mut self) -> Vec<Vec<Cell>> {
        match self.screen.alt_rows() {
            Some(rows) => rows,
            None => self.viewport.grid(),
        }
    }

    /// `(x, y, visible)`.
    pub fn cursor(&self) -> (u16, u16, bool) {
        self.screen.cursor()
    }

    /// The grid as plain strings, for tests and debugging.
    pub fn display(&mut self) -> Vec<String> {
        self.grid()
            .iter()
            .map(|row| {
                row.iter()
                    .map(|c| if c.rune == '\0' { ' ' } else { c.rune })
                    .collect()
            })
            .collect()
    }

    pub fn scroll_offset(&self) -> u64 {
        self.viewport.scroll_offset()
    }

    pub fn scroll_up(&mut self, n: u64) {
        self.viewport.scroll_up(n);
        self.persistence.notify_metadata_change(self.current_meta());
    }

    pub fn scroll_down(&mut self, n: u64) {
        self.viewport.scroll_down(n);
        self.persistence.notify_metadata_change(self.current_meta());
    }

    pub fn scroll_to_top(&mut self) {
        self.viewport.scroll_to_top();
        self.persistence.notify_metadata_change(self.current_meta());
    }

    pub fn scroll_to_bottom(&mut self) {
        self.viewport.scroll_to_bottom();
        self.persistence.notify_metadata_change(self.current_meta());
    }

    /// Map a viewport cell to content coordinates.
    pub fn viewport_to_content(&mut self, y: u16, x: u16) -> Option<(GlobalIdx, usize)> {
        self.viewport.viewport_to_content(y, x)
    }

    /// Map content coordinates to the viewport.
    pub fn content_to_viewport(&mut self, g: GlobalIdx, offset: usize) -> (u16, u16, bool) {
        self.viewport.content_to_viewport(g, offset)
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.screen.resize(cols, rows);
        self.viewport.resize(cols, rows);
        self.after_mutation();
    }

    /// Read a logical line from memory, falling back to disk.
    pub fn read_line(&self, g: GlobalIdx) -> Option<LogicalLine> {
        if let Some(line) = self
            .buffer
            .read()
            .expect("memory buffer lock poisoned")
            .clone_line(g)
        {
            return Some(line);
        }
        let mut store = self.store.lock().expect("disk store lock poisoned");
        store.read_line(g).ok().flatten()
    }

    /// Largest line index whose timestamp is `<= t` (0 when `t` precedes
    /// the record).
    pub fn find_line_at(&self, t_ns: i64) -> GlobalIdx {
        let mut store = self.store.lock().expect("disk store lock poisoned");
        store.find_line_at(t_ns)
    }

    /// Flush pending persistence work now.
    pub fn flush(&self) -> Result<()> {
        self.persistence.flush()
    }

    pub fn metrics(&self) -> PersistenceMetrics {
        self.persistence.metrics()
    }

    /// Register the search-index hook.
    pub fn set_index_hook(&self, hook: IndexHook) {
        self.persistence.set_index_hook(hook);
    }

    pub fn is_alt_screen_active(&self) -> bool {
        self.screen.is_alt_active()
    }

    /// DECSET 2004 state, for the host's paste handling.
    pub fn bracketed_paste(&self) -> bool {
        self.screen.bracketed_paste()
    }

    /// DECSET 1 state, for the host's key encoding.
    pub fn app_cursor_keys(&self) -> bool {
        self.screen.app_cursor_keys()
    }

    /// DECSET 2026 state; a renderer may defer paints while set.
    pub fn sync_update(&self) -> bool {
        self.screen.sync_update()
    }

    /// Stop background work, drain pending writes, fsync and close the
    /// store. Idempotent; reports the first I/O error.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.persistence.notify_metadata_change(self.current_meta());
        let result = self.persistence.close();
        self.closed = true;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NullObserver;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir, cols: u16, rows: u16) -> EngineConfig {
        EngineConfig {
            persist_dir: dir.path().to_path_buf(),
            cols,
            rows,
            ..EngineConfig::default()
        }
    }

    fn open(dir: &TempDir, cols: u16, rows: u16) -> Terminal {
        Terminal::open(test_config(dir, cols, rows), "test", Arc::new(NullObserver)).unwrap()
    }

    #[test]
    fn feed_and_display() {
        let dir = TempDir::new().unwrap();
        let mut term = open(&dir, 10, 3);
        term.feed(b"hi\r\nthere");
        let display = term.display();
        assert_eq!(display[0].trim_end(), "hi");
        assert_eq!(display[1].trim_end(), "there");
    }

    #[test]
    fn utf8_split_across_feeds() {
        let dir = TempDir::new().unwrap();
        let mut term = open(&dir, 10, 3);
        let bytes = "héllo".as_bytes();
        // Split inside the two-byte é.
        term.feed(&bytes[..2]);
        term.feed(&bytes[2..]);
        assert_eq!(term.display()[0].trim_end(), "héllo");
    }

    #[test]
    fn invalid_utf8_becomes_replacement() {
        let dir = TempDir::new().unwrap();
        let mut term = open(&dir, 10, 3);
        term.feed(b"a\xffb");
        assert_eq!(term.display()[0].trim_end(), "a\u{fffd}b");
    }

    #[test]
    fn alt_screen_grid_switches() {
        let dir = TempDir::new().unwrap();
        let mut term = open(&dir, 10, 3);
        term.feed(b"primary");
        term.feed(b"\x1b[?1049halt");
        assert!(term.is_alt_screen_active());
        assert_eq!(term.display()[0].trim_end(), "alt");
        term.feed(b"\x1b[?1049l");
        assert_eq!(term.display()[0].trim_end(), "primary");
    }

    #[test]
    fn scrollback_navigation() {
        let dir = TempDir::new().unwrap();
        let mut term = open(&dir, 10, 2);
        for i in 0..6 {
            term.feed(format!("line{i}\r\n").as_bytes());
        }
        term.scroll_to_top();
        assert_eq!(term.display()[0].trim_end(), "line0");
        term.scroll_to_bottom();
        assert_eq!(term.scroll_offset(), 0);
    }

    #[test]
    fn close_then_feed_is_ignored() {
        let dir = TempDir::new().unwrap();
        let mut term = open(&dir, 10, 3);
        term.feed(b"before");
        term.close().unwrap();
        term.feed(b"after");
        term.close().unwrap();
    }
}
