//! Read-only projection from logical lines to the visible grid.
//!
//! The scroll model is physical: `scroll_offset` counts physical (wrapped)
//! rows back from the live edge, 0 meaning the live screen. Writes always
//! target the live edge regardless of scroll position. Rows older than the
//! in-memory window fall through to the page store, which is estimated at
//! one physical row per logical line.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock, Weak};

use lru::LruCache;

use crate::buffer::{GlobalIdx, MemoryBuffer};
use crate::cell::Cell;
use crate::config::ViewportConfig;
use crate::line::LogicalLine;
use crate::store::DiskStore;

#[derive(Debug, Clone)]
struct CachedRows {
    version: u64,
    width: u16,
    rows: Vec<Vec<Cell>>,
}

/// Where a physical row comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowSource {
    /// Estimated single row of an on-disk line.
    Disk(GlobalIdx),
    /// Row `row` of the wrapped in-memory line `g`.
    Memory { g: GlobalIdx, row: usize },
    /// Live-screen row `y` (line may not exist yet).
    Live { y: u16 },
}

/// The viewport window over scrollback plus the live screen.
pub struct ViewportWindow {
    buffer: Arc<RwLock<MemoryBuffer>>,
    /// Disk fallback; a relation, never an ownership edge.
    store: Weak<Mutex<DiskStore>>,
    width: u16,
    height: u16,
    scroll_offset: u64,
    live_edge_base: GlobalIdx,
    cache: LruCache<GlobalIdx, CachedRows>,
}

impl ViewportWindow {
    pub fn new(
        cfg: &ViewportConfig,
        buffer: Arc<RwLock<MemoryBuffer>>,
        store: Weak<Mutex<DiskStore>>,
        width: u16,
        height: u16,
    ) -> Self {
        ViewportWindow {
            buffer,
            store,
            width: width.max(1),
            height: height.max(1),
            scroll_offset: 0,
            live_edge_base: 0,
            cache: LruCache::new(NonZeroUsize::new(cfg.wrap_cache_lines.max(1)).unwrap()),
        }
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn scroll_offset(&self) -> u64 {
        self.scroll_offset
    }

    /// Track the live edge (updated by the producer after each feed).
    pub fn set_live_edge_base(&mut self, base: GlobalIdx) {
        self.live_edge_base = base;
    }

    /// Restore a persisted scroll position.
    pub fn restore_scroll(&mut self, offset: u64) {
        self.scroll_offset = offset.min(self.max_scroll());
    }

    pub fn resize(&mut self, width: u16, height: u16) {
        self.width = width.max(1);
        self.height = height.max(1);
        self.cache.clear();
        self.scroll_offset = self.scroll_offset.min(self.max_scroll());
    }

    /// Physical rows in scrollback (everything above the live screen).
    fn scrollback_physical(&self) -> u64 {
        let buf = self.buffer.read().expect("memory buffer lock poisoned");
        let width = self.width;
        let mem_start = buf.global_offset().min(self.live_edge_base);
        let disk_rows = mem_start; // one row per on-disk line
        let mem_rows: u64 = buf
            .get_range(mem_start, self.live_edge_base)
            .iter()
            .map(|(_, line)| line.physical_rows(width) as u64)
            .sum();
        disk_rows + mem_rows
    }

    /// Total physical rows: scrollback plus the live screen.
    pub fn total_physical_lines(&self) -> u64 {
        self.scrollback_physical() + self.height as u64
    }

    pub fn max_scroll(&self) -> u64 {
        // total - height, which is exactly the scrollback extent.
        self.scrollback_physical()
    }

    pub fn scroll_up(&mut self, n: u64) {
        self.scroll_offset = (self.scroll_offset + n).min(self.max_scroll());
    }

    pub fn scroll_down(&mut self, n: u64) {
        self.scroll_offset = self.scroll_offset.saturating_sub(n);
    }

    pub fn scroll_to_top(&mut self) {
        self.scroll_offset = self.max_scroll();
    }

    pub fn scroll_to_bottom(&mut self) {
        self.scroll_offset = 0;
    }

    /// Wrap a line into physical rows of exactly `width` cells. Wide cell
    /// pairs are never split across rows.
    fn wrap_cells(line: &LogicalLine, width: u16) -> Vec<Vec<Cell>> {
        let width = width as usize;
        if line.fixed_width() > 0 {
            return vec![line.row_at_width(width as u16)];
        }
        let mut rows = Vec::new();
        let mut row: Vec<Cell> = Vec::with_capacity(width);
        for cell in line.cells() {
            if cell.is_wide() && row.len() + 1 == width {
                // Pad the odd last column; the pair starts the next row.
                row.push(Cell::blank());
            }
            if row.len() == width {
                rows.push(std::mem::replace(&mut row, Vec::with_capacity(width)));
            }
            row.push(*cell);
        }
        if !row.is_empty() || rows.is_empty() {
            row.resize(width, Cell::blank());
            rows.push(row);
        }
        rows
    }

    /// Wrapped rows of an in-memory line, via the LRU cache. Entries are
    /// keyed by line and validated against the content version and width.
    fn wrapped_rows(&mut self, g: GlobalIdx) -> Vec<Vec<Cell>> {
        let buffer = Arc::clone(&self.buffer);
        let buf = buffer.read().expect("memory buffer lock poisoned");
        let version = buf.version();
        if let Some(cached) = self.cache.get(&g) {
            if cached.version == version && cached.width == self.width {
                return cached.rows.clone();
            }
        }
        let rows = match buf.get_line(g) {
            Some(line) => Self::wrap_cells(line, self.width),
            None => vec![vec![Cell::blank(); self.width as usize]],
        };
        self.cache.put(
            g,
            CachedRows {
                version,
                width: self.width,
                rows: rows.clone(),
            },
        );
        rows
    }

    /// Resolve the physical rows currently visible, bottom-anchored.
    fn visible_sources(&self) -> Vec<RowSource> {
        let buf = self.buffer.read().expect("memory buffer lock poisoned");
        let width = self.width;
        let mem_start = buf.global_offset().min(self.live_edge_base);
        let disk_rows = mem_start;

        // Physical index of each in-memory scrollback line.
        let mut mem_layout: Vec<(GlobalIdx, usize)> = Vec::new();
        let mut scrollback_total = disk_rows;
        for (g, line) in buf.get_range(mem_start, self.live_edge_base) {
            let rows = line.physical_rows(width);
            mem_layout.push((g, rows));
            scrollback_total += rows as u64;
        }
        drop(buf);

        let total = scrollback_total + self.height as u64;
        let offset = self.scroll_offset.min(scrollback_total);
        let end = total - offset;
        let start = end.saturating_sub(self.height as u64);

        let mut sources = Vec::with_capacity(self.height as usize);
        let mut p = start;
        while p < end {
            if p >= scrollback_total {
                sources.push(RowSource::Live {
                    y: (p - scrollback_total) as u16,
                });
            } else if p < disk_rows {
                sources.push(RowSource::Disk(p));
            } else {
                // Locate the in-memory line containing physical row p.
                let mut acc = disk_rows;
                let mut found = None;
                for &(g, rows) in &mem_layout {
                    if p < acc + rows as u64 {
                        found = Some(RowSource::Memory {
                            g,
                            row: (p - acc) as usize,
                        });
                        break;
                    }
                    acc += rows as u64;
                }
                sources.push(found.unwrap_or(RowSource::Live { y: 0 }));
            }
            p += 1;
        }
        sources
    }

    /// Materialise the visible grid: `height` rows of `width` cells.
    pub fn grid(&mut self) -> Vec<Vec<Cell>> {
        let sources = self.visible_sources();
        let width = self.width as usize;
        let blank_row = vec![Cell::blank(); width];
        let mut grid = Vec::with_capacity(self.height as usize);
        for source in sources {
            let row = match source {
                RowSource::Live { y } => {
                    let g = self.live_edge_base + y as GlobalIdx;
                    let buf = self.buffer.read().expect("memory buffer lock poisoned");
                    match buf.get_line(g) {
                        Some(line) => line.row_at_width(self.width),
                        None => blank_row.clone(),
                    }
                }
                RowSource::Memory { g, row } => self
                    .wrapped_rows(g)
                    .get(row)
                    .cloned()
                    .unwrap_or_else(|| blank_row.clone()),
                RowSource::Disk(g) => self.disk_row(g).unwrap_or_else(|| blank_row.clone()),
            };
            grid.push(row);
        }
        while grid.len() < self.height as usize {
            grid.push(blank_row.clone());
        }
        grid
    }

    /// Fetch an on-disk line as a single display row.
    fn disk_row(&self, g: GlobalIdx) -> Option<Vec<Cell>> {
        let store = self.store.upgrade()?;
        let mut store = store.lock().expect("disk store lock poisoned");
        match store.read_line(g) {
            Ok(Some(line)) => Some(line.row_at_width(self.width)),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!("viewport disk fallback failed for line {g}: {err:#}");
                None
            }
        }
    }

    /// Map a viewport cell to `(global index, char offset)`. `None` when the
    /// cell is not backed by line content.
    pub fn viewport_to_content(&mut self, y: u16, x: u16) -> Option<(GlobalIdx, usize)> {
        if y >= self.height || x >= self.width {
            return None;
        }
        let source = *self.visible_sources().get(y as usize)?;
        match source {
            RowSource::Live { y: live_y } => {
                let g = self.live_edge_base + live_y as GlobalIdx;
                let buf = self.buffer.read().expect("memory buffer lock poisoned");
                let line = buf.get_line(g)?;
                let offset = x as usize;
                (offset < line.len()).then_some((g, offset))
            }
            RowSource::Memory { g, row } => {
                let buf = self.buffer.read().expect("memory buffer lock poisoned");
                let line = buf.get_line(g)?;
                let offset = if line.fixed_width() > 0 {
                    x as usize
                } else {
                    row * self.width as usize + x as usize
                };
                (offset < line.len()).then_some((g, offset))
            }
            RowSource::Disk(g) => Some((g, x as usize)),
        }
    }

    /// Map `(global index, char offset)` to viewport coordinates. The flag
    /// is false when the position is scrolled out of view (the coordinates
    /// are then meaningless).
    pub fn content_to_viewport(&mut self, g: GlobalIdx, offset: usize) -> (u16, u16, bool) {
        let sources = self.visible_sources();
        let width = self.width as usize;
        for (y, source) in sources.iter().enumerate() {
            let hit = match *source {
                RowSource::Live { y: live_y } => {
                    (self.live_edge_base + live_y as GlobalIdx == g && offset < width)
                        .then_some(offset)
                }
                RowSource::Memory { g: gg, row } => (gg == g
                    && offset / width == row)
                    .then_some(offset % width),
                RowSource::Disk(gg) => (gg == g && offset < width).then_some(offset),
            };
            if let Some(x) = hit {
                return (y as u16, x as u16, true);
            }
        }
        (0, 0, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Style;
    use crate::config::BufferConfig;

    fn setup(width: u16, height: u16) -> (ViewportWindow, Arc<RwLock<MemoryBuffer>>) {
        let buffer = Arc::new(RwLock::new(MemoryBuffer::new(
            &BufferConfig {
                max_lines: 1000,
                eviction_batch: 10,
            },
            width,
        )));
        let vp = ViewportWindow::new(
            &ViewportConfig::default(),
            buffer.clone(),
            Weak::new(),
            width,
            height,
        );
        (vp, buffer)
    }

    fn write_line(buffer: &Arc<RwLock<MemoryBuffer>>, g: GlobalIdx, text: &str) {
        let mut buf = buffer.write().unwrap();
        for (i, c) in text.chars().enumerate() {
            buf.write_cell(g, i, Cell::new(c, Style::default()));
        }
    }

    fn row_text(row: &[Cell]) -> String {
        let s: String = row
            .iter()
            .map(|c| if c.rune == '\0' { ' ' } else { c.rune })
            .collect();
        s.trim_end().to_string()
    }

    #[test]
    fn live_rows_render_at_scroll_zero() {
        let (mut vp, buffer) = setup(10, 3);
        write_line(&buffer, 0, "one");
        write_line(&buffer, 1, "two");
        vp.set_live_edge_base(0);
        let grid = vp.grid();
        assert_eq!(row_text(&grid[0]), "one");
        assert_eq!(row_text(&grid[1]), "two");
        assert_eq!(row_text(&grid[2]), "");
    }

    #[test]
    fn scrollback_appears_when_scrolled() {
        let (mut vp, buffer) = setup(10, 2);
        for g in 0..6u64 {
            write_line(&buffer, g, &format!("line{g}"));
        }
        // Lines 0..4 are scrollback; 4 and 5 form the live screen.
        vp.set_live_edge_base(4);
        assert_eq!(vp.max_scroll(), 4);
        let grid = vp.grid();
        assert_eq!(row_text(&grid[0]), "line4");
        assert_eq!(row_text(&grid[1]), "line5");

        vp.scroll_up(2);
        let grid = vp.grid();
        assert_eq!(row_text(&grid[0]), "line2");
        assert_eq!(row_text(&grid[1]), "line3");

        vp.scroll_to_top();
        let grid = vp.grid();
        assert_eq!(row_text(&grid[0]), "line0");

        vp.scroll_to_bottom();
        let grid = vp.grid();
        assert_eq!(row_text(&grid[0]), "line4");
    }

    #[test]
    fn scroll_clamps_to_extent() {
        let (mut vp, buffer) = setup(10, 2);
        write_line(&buffer, 0, "a");
        write_line(&buffer, 1, "b");
        vp.set_live_edge_base(1);
        vp.scroll_up(100);
        assert_eq!(vp.scroll_offset(), 1);
        vp.scroll_down(100);
        assert_eq!(vp.scroll_offset(), 0);
    }

    #[test]
    fn long_scrollback_line_wraps_into_physical_rows() {
        let (mut vp, buffer) = setup(4, 3);
        write_line(&buffer, 0, "abcdefgh"); // 2 physical rows at width 4
        write_line(&buffer, 1, "tail");
        vp.set_live_edge_base(2);
        assert_eq!(vp.max_scroll(), 3);
        vp.scroll_to_top();
        let grid = vp.grid();
        assert_eq!(row_text(&grid[0]), "abcd");
        assert_eq!(row_text(&grid[1]), "efgh");
        assert_eq!(row_text(&grid[2]), "tail");
    }

    #[test]
    fn fixed_width_line_occupies_one_row() {
        let (mut vp, buffer) = setup(4, 2);
        write_line(&buffer, 0, "abcdefgh");
        buffer.write().unwrap().set_line_fixed(0, 8);
        write_line(&buffer, 1, "x");
        vp.set_live_edge_base(2);
        // One row for the fixed line, one for "x".
        assert_eq!(vp.max_scroll(), 2);
        vp.scroll_to_top();
        let grid = vp.grid();
        // Truncated at the current width; cells preserved in memory.
        assert_eq!(row_text(&grid[0]), "abcd");
        assert_eq!(row_text(&grid[1]), "x");
    }

    #[test]
    fn width_change_invalidates_wrapping() {
        let (mut vp, buffer) = setup(4, 4);
        write_line(&buffer, 0, "abcdefgh");
        vp.set_live_edge_base(1);
        vp.scroll_to_top();
        assert_eq!(vp.max_scroll(), 2);
        buffer.write().unwrap().set_term_width(8);
        vp.resize(8, 4);
        assert_eq!(vp.max_scroll(), 1);
        vp.scroll_to_top();
        let grid = vp.grid();
        assert_eq!(row_text(&grid[0]), "abcdefgh");
    }

    #[test]
    fn coordinate_roundtrip() {
        let (mut vp, buffer) = setup(10, 3);
        write_line(&buffer, 0, "hello");
        vp.set_live_edge_base(0);
        let (g, off) = vp.viewport_to_content(0, 2).unwrap();
        assert_eq!((g, off), (0, 2));
        let (y, x, visible) = vp.content_to_viewport(0, 2);
        assert!(visible);
        assert_eq!((y, x), (0, 2));
        // Beyond the line's cells is off-content.
        assert!(vp.viewport_to_content(0, 9).is_none());
        assert!(vp.viewport_to_content(2, 0).is_none());
    }

    #[test]
    fn content_scrolled_away_is_not_visible() {
        let (mut vp, buffer) = setup(10, 2);
        for g in 0..6u64 {
            write_line(&buffer, g, &format!("line{g}"));
        }
        vp.set_live_edge_base(4);
        let (_, _, visible) = vp.content_to_viewport(0, 0);
        assert!(!visible);
        vp.scroll_to_top();
        let (y, _, visible) = vp.content_to_viewport(0, 0);
        assert!(visible);
        assert_eq!(y, 0);
    }
}
