//! In-memory logical-line store.
//!
//! A windowed ring over the global line index: lines `[global_offset,
//! global_end)` are resident; older lines live only in the page store.
//! Every mutation bumps a `ContentVersion` used by the viewport cache and
//! records a write event that the terminal forwards to the persistence
//! controller.

use std::collections::BTreeSet;
use std::collections::VecDeque;

use crate::cell::Cell;
use crate::config::BufferConfig;
use crate::line::{now_ns, LogicalLine};

/// Identifier of a logical line, dense and monotonic, stable across
/// restarts.
pub type GlobalIdx = u64;

/// One dirty notification, drained in producer order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteEvent {
    pub global_idx: GlobalIdx,
    pub timestamp_ns: i64,
    pub is_command: bool,
}

/// Windowed map from [`GlobalIdx`] to [`LogicalLine`].
#[derive(Debug)]
pub struct MemoryBuffer {
    lines: VecDeque<LogicalLine>,
    global_offset: GlobalIdx,
    max_lines: usize,
    eviction_batch: usize,
    dirty: BTreeSet<GlobalIdx>,
    version: u64,
    term_width: u16,
    cursor: (u16, u16),
    events: Vec<WriteEvent>,
}

impl MemoryBuffer {
    pub fn new(cfg: &BufferConfig, term_width: u16) -> Self {
        Self::new_at(cfg, term_width, 0)
    }

    /// Start the window at `global_offset` (recovery: older lines are on
    /// disk).
    pub fn new_at(cfg: &BufferConfig, term_width: u16, global_offset: GlobalIdx) -> Self {
        MemoryBuffer {
            lines: VecDeque::new(),
            global_offset,
            max_lines: cfg.max_lines.max(1),
            eviction_batch: cfg.eviction_batch.max(1),
            dirty: BTreeSet::new(),
            version: 0,
            term_width,
            cursor: (0, 0),
            events: Vec::new(),
        }
    }

    pub fn global_offset(&self) -> GlobalIdx {
        self.global_offset
    }

    /// One past the newest line ever created.
    pub fn global_end(&self) -> GlobalIdx {
        self.global_offset + self.lines.len() as GlobalIdx
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Force viewport caches to refresh without changing content (alt-screen
    /// exit repaints the primary screen).
    pub fn invalidate(&mut self) {
        self.version += 1;
    }

    pub fn term_width(&self) -> u16 {
        self.term_width
    }

    /// Width used for wrap calculations. Never mutates stored cells.
    pub fn set_term_width(&mut self, width: u16) {
        if self.term_width != width {
            self.term_width = width;
            self.version += 1;
        }
    }

    /// The producer's cursor, mirrored here by the screen model.
    pub fn cursor(&self) -> (u16, u16) {
        self.cursor
    }

    pub fn set_cursor(&mut self, x: u16, y: u16) {
        self.cursor = (x, y);
    }

    pub fn contains(&self, g: GlobalIdx) -> bool {
        g >= self.global_offset && g < self.global_end()
    }

    fn slot(&self, g: GlobalIdx) -> Option<usize> {
        if self.contains(g) {
            Some((g - self.global_offset) as usize)
        } else {
            None
        }
    }

    /// Append empty lines until `global_end == g + 1`, then evict from the
    /// front if the window exceeds `max_lines`.
    pub fn ensure_line(&mut self, g: GlobalIdx) {
        if g < self.global_end() {
            return;
        }
        let missing = (g + 1 - self.global_end()) as usize;
        for _ in 0..missing {
            self.lines.push_back(LogicalLine::new());
        }
        self.version += 1;
        self.evict_if_needed();
    }

    /// FIFO eviction in batches. A batch containing a dirty line is
    /// suppressed entirely: dirty lines must reach the WAL first.
    fn evict_if_needed(&mut self) {
        while self.lines.len() > self.max_lines {
            let excess = self.lines.len() - self.max_lines;
            let batch = self.eviction_batch.min(self.lines.len());
            let batch_end = self.global_offset + batch as GlobalIdx;
            if self.dirty.range(..batch_end).next().is_some() {
                tracing::warn!(
                    over_by = excess,
                    "eviction suppressed: dirty lines in the oldest batch"
                );
                return;
            }
            self.lines.drain(..batch);
            self.global_offset = batch_end;
            self.version += 1;
            tracing::debug!(batch, new_offset = self.global_offset, "evicted lines");
        }
    }

    pub fn get_line(&self, g: GlobalIdx) -> Option<&LogicalLine> {
        self.slot(g).map(|i| &self.lines[i])
    }

    /// Snapshot a line for background encoding.
    pub fn clone_line(&self, g: GlobalIdx) -> Option<LogicalLine> {
        self.get_line(g).cloned()
    }

    /// Lines in `[a, b)` intersected with the resident window.
    pub fn get_range(&self, a: GlobalIdx, b: GlobalIdx) -> Vec<(GlobalIdx, &LogicalLine)> {
        let start = a.max(self.global_offset);
        let end = b.min(self.global_end());
        (start..end)
            .map(|g| (g, &self.lines[(g - self.global_offset) as usize]))
            .collect()
    }

    /// Restore a persisted line during recovery without dirtying it.
    pub fn seed_line(&mut self, g: GlobalIdx, line: LogicalLine) {
        self.ensure_line(g);
        if let Some(i) = self.slot(g) {
            self.lines[i] = line;
            self.version += 1;
        }
    }

    /// Apply `f` to line `g` (creating it and any gap first), then mark it
    /// dirty, bump the version and record a write event.
    pub fn mutate_line<F: FnOnce(&mut LogicalLine)>(&mut self, g: GlobalIdx, f: F) {
        self.ensure_line(g);
        let Some(i) = self.slot(g) else {
            // The line was immediately evicted; nothing to mutate.
            tracing::warn!(g, "mutation targets an evicted line");
            return;
        };
        let ts = now_ns();
        let line = &mut self.lines[i];
        f(line);
        line.touch(ts);
        let is_command = line.is_command();
        self.version += 1;
        self.dirty.insert(g);
        match self.events.last_mut() {
            Some(ev) if ev.global_idx == g => {
                ev.timestamp_ns = ts;
                ev.is_command = is_command;
            }
            _ => self.events.push(WriteEvent {
                global_idx: g,
                timestamp_ns: ts,
                is_command,
            }),
        }
    }

    /// Place one cell.
    pub fn write_cell(&mut self, g: GlobalIdx, x: usize, cell: Cell) {
        self.mutate_line(g, |line| line.put_cell(x, cell));
    }

    /// Insert one cell, shifting the tail right (IRM), bounded by `limit`.
    pub fn insert_cell(&mut self, g: GlobalIdx, x: usize, cell: Cell, limit: usize) {
        self.mutate_line(g, |line| line.insert_cell(x, cell, limit));
    }

    pub fn erase_line(&mut self, g: GlobalIdx) {
        self.mutate_line(g, |line| line.erase_all());
    }

    pub fn erase_to_end(&mut self, g: GlobalIdx, x: usize) {
        self.mutate_line(g, |line| line.erase_to_end(x));
    }

    pub fn erase_from_start(&mut self, g: GlobalIdx, x: usize, fill: Cell) {
        self.mutate_line(g, |line| line.erase_from_start(x, fill));
    }

    /// Replace a line wholesale (region shifts).
    pub fn replace_line(&mut self, g: GlobalIdx, new_line: LogicalLine) {
        self.mutate_line(g, |line| *line = new_line);
    }

    /// Shift lines `[a, b]` up by `n`: line `a` receives `a+n`, the vacated
    /// bottom fills with blanks. Global indices do not move.
    pub fn shift_region_up(&mut self, a: GlobalIdx, b: GlobalIdx, n: usize) {
        if a > b || n == 0 {
            return;
        }
        self.ensure_line(b);
        for g in a..=b {
            let src = g + n as GlobalIdx;
            let moved = if src <= b {
                self.get_line(src).cloned().unwrap_or_default()
            } else {
                LogicalLine::new()
            };
            self.replace_line(g, moved);
        }
    }

    /// Shift lines `[a, b]` down by `n`: line `b` receives `b-n`, the vacated
    /// top fills with blanks.
    pub fn shift_region_down(&mut self, a: GlobalIdx, b: GlobalIdx, n: usize) {
        if a > b || n == 0 {
            return;
        }
        self.ensure_line(b);
        for g in (a..=b).rev() {
            let moved = if g >= a + n as GlobalIdx {
                self.get_line(g - n as GlobalIdx).cloned().unwrap_or_default()
            } else {
                LogicalLine::new()
            };
            self.replace_line(g, moved);
        }
    }

    /// Commit a scroll-region linefeed to history: the region's top line
    /// (viewport row `top`) moves down to global index `base`, joining the
    /// scrollback below the viewport; rows above the region shift up one
    /// index to follow the advancing live edge; a blank line enters at the
    /// region bottom. The caller advances its live edge by one afterwards.
    ///
    /// Content at indices in `(base+top, base+bottom]` is untouched; only
    /// `[base, base+top]` rotates and `(base+bottom, end)` shifts.
    pub fn rotate_into_history(&mut self, base: GlobalIdx, top: u16, bottom: u16) {
        let top_g = base + top as GlobalIdx;
        let bottom_g = base + bottom as GlobalIdx;
        if base < self.global_offset {
            tracing::warn!(base, "scroll-region history commit below the resident window");
            return;
        }
        self.ensure_line(bottom_g);
        let base_slot = (base - self.global_offset) as usize;
        let top_slot = (top_g - self.global_offset) as usize;
        let scrolled = self.lines.remove(top_slot).unwrap_or_default();
        self.lines.insert(base_slot, scrolled);
        let after_bottom_slot = (bottom_g + 1 - self.global_offset) as usize;
        if after_bottom_slot <= self.lines.len() {
            self.lines.insert(after_bottom_slot, LogicalLine::new());
        } else {
            self.lines.push_back(LogicalLine::new());
        }
        self.version += 1;
        let ts = now_ns();
        for g in base..=top_g {
            self.record_shift(g, ts);
        }
        for g in (bottom_g + 1)..self.global_end() {
            self.record_shift(g, ts);
        }
        self.evict_if_needed();
    }

    /// Mark a line whose content changed position during a history commit.
    fn record_shift(&mut self, g: GlobalIdx, ts: i64) {
        self.dirty.insert(g);
        let is_command = self
            .get_line(g)
            .map(LogicalLine::is_command)
            .unwrap_or(false);
        match self.events.last_mut() {
            Some(ev) if ev.global_idx == g => ev.timestamp_ns = ts,
            _ => self.events.push(WriteEvent {
                global_idx: g,
                timestamp_ns: ts,
                is_command,
            }),
        }
    }

    /// Assign a non-reflowable width to a line. Idempotent.
    pub fn set_line_fixed(&mut self, g: GlobalIdx, width: u16) {
        if self.get_line(g).map(|l| l.fixed_width()) == Some(width) {
            return;
        }
        self.mutate_line(g, |line| line.set_fixed_width(width));
    }

    /// Remove the non-reflowable mark.
    pub fn clear_line_fixed(&mut self, g: GlobalIdx) {
        self.set_line_fixed(g, 0);
    }

    /// Mark a line as a shell command prompt line.
    pub fn set_line_command(&mut self, g: GlobalIdx) {
        if self.get_line(g).map(LogicalLine::is_command) == Some(true) {
            return;
        }
        self.mutate_line(g, |line| line.set_command(true));
    }

    pub fn mark_dirty(&mut self, g: GlobalIdx) {
        if self.contains(g) {
            self.dirty.insert(g);
        }
    }

    pub fn clear_dirty(&mut self, g: GlobalIdx) {
        self.dirty.remove(&g);
    }

    pub fn is_dirty(&self, g: GlobalIdx) -> bool {
        self.dirty.contains(&g)
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Drain recorded write events in producer order.
    pub fn take_events(&mut self) -> Vec<WriteEvent> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Style;

    fn small_cfg(max_lines: usize, batch: usize) -> BufferConfig {
        BufferConfig {
            max_lines,
            eviction_batch: batch,
        }
    }

    fn cell(c: char) -> Cell {
        Cell::new(c, Style::default())
    }

    #[test]
    fn ensure_line_fills_gaps() {
        let mut buf = MemoryBuffer::new(&small_cfg(100, 10), 80);
        buf.ensure_line(4);
        assert_eq!(buf.global_end(), 5);
        for g in 0..5 {
            assert!(buf.get_line(g).is_some());
        }
    }

    #[test]
    fn write_records_event_and_dirty() {
        let mut buf = MemoryBuffer::new(&small_cfg(100, 10), 80);
        buf.write_cell(0, 0, cell('a'));
        buf.write_cell(0, 1, cell('b'));
        buf.write_cell(1, 0, cell('c'));
        assert!(buf.is_dirty(0));
        assert!(buf.is_dirty(1));
        let events = buf.take_events();
        // Consecutive writes to the same line coalesce.
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].global_idx, 0);
        assert_eq!(events[1].global_idx, 1);
        assert!(buf.take_events().is_empty());
    }

    #[test]
    fn eviction_keeps_window_bounded_and_dense() {
        let mut buf = MemoryBuffer::new(&small_cfg(10, 4), 80);
        for g in 0..30 {
            buf.ensure_line(g);
        }
        assert!(buf.global_end() - buf.global_offset() <= 10);
        assert_eq!(buf.global_end(), 30);
        // Window contents are dense.
        for g in buf.global_offset()..buf.global_end() {
            assert!(buf.get_line(g).is_some());
        }
        assert!(buf.get_line(buf.global_offset() - 1).is_none());
    }

    #[test]
    fn eviction_suppressed_while_dirty() {
        let mut buf = MemoryBuffer::new(&small_cfg(10, 4), 80);
        buf.write_cell(0, 0, cell('x')); // line 0 dirty
        for g in 1..30 {
            buf.ensure_line(g);
        }
        // Line 0 is still resident.
        assert_eq!(buf.global_offset(), 0);
        assert!(buf.get_line(0).is_some());

        buf.clear_dirty(0);
        buf.ensure_line(30);
        assert!(buf.global_end() - buf.global_offset() <= 10);
    }

    #[test]
    fn version_bumps_on_mutation() {
        let mut buf = MemoryBuffer::new(&small_cfg(100, 10), 80);
        let v0 = buf.version();
        buf.write_cell(0, 0, cell('a'));
        let v1 = buf.version();
        assert!(v1 > v0);
        buf.set_term_width(40);
        assert!(buf.version() > v1);
    }

    #[test]
    fn shift_region_up_moves_content() {
        let mut buf = MemoryBuffer::new(&small_cfg(100, 10), 80);
        for g in 0..5u64 {
            buf.write_cell(g, 0, cell((b'a' + g as u8) as char));
        }
        buf.shift_region_up(1, 3, 1);
        let texts: Vec<String> = (0..5).map(|g| buf.get_line(g).unwrap().text()).collect();
        assert_eq!(texts, ["a", "c", "d", "", "e"]);
    }

    #[test]
    fn shift_region_down_moves_content() {
        let mut buf = MemoryBuffer::new(&small_cfg(100, 10), 80);
        for g in 0..5u64 {
            buf.write_cell(g, 0, cell((b'a' + g as u8) as char));
        }
        buf.shift_region_down(1, 3, 1);
        let texts: Vec<String> = (0..5).map(|g| buf.get_line(g).unwrap().text()).collect();
        assert_eq!(texts, ["a", "", "b", "c", "e"]);
    }

    #[test]
    fn rotate_into_history_commits_region_top() {
        // Screen: header, A, B, C, footer with a region over rows 1..=3.
        let mut buf = MemoryBuffer::new(&small_cfg(100, 10), 80);
        for (g, text) in ["H", "a", "b", "c", "F"].iter().enumerate() {
            buf.write_cell(g as GlobalIdx, 0, cell(text.chars().next().unwrap()));
        }
        for g in 0..5 {
            buf.clear_dirty(g);
        }
        buf.take_events();
        buf.rotate_into_history(0, 1, 3);
        // The region's top line joined scrollback at index 0; rows above the
        // region follow the live edge; a blank entered at the region bottom.
        let texts: Vec<String> = (0..6).map(|g| buf.get_line(g).unwrap().text()).collect();
        assert_eq!(texts, ["a", "H", "b", "c", "", "F"]);
        // With the live edge advanced to 1: row0=H, row1=b, row2=c,
        // row3=blank, row4=F.
        assert!(buf.is_dirty(0));
        assert!(buf.is_dirty(1));
        assert!(!buf.is_dirty(3)); // content unchanged at this index
        assert!(buf.is_dirty(5));
    }

    #[test]
    fn get_range_clips_to_window() {
        let mut buf = MemoryBuffer::new(&small_cfg(100, 10), 80);
        buf.ensure_line(9);
        assert_eq!(buf.get_range(5, 100).len(), 5);
        assert_eq!(buf.get_range(50, 100).len(), 0);
    }

    #[test]
    fn fixed_width_marking_is_idempotent() {
        let mut buf = MemoryBuffer::new(&small_cfg(100, 10), 80);
        buf.ensure_line(0);
        buf.take_events();
        buf.set_line_fixed(0, 80);
        assert_eq!(buf.take_events().len(), 1);
        buf.set_line_fixed(0, 80);
        assert!(buf.take_events().is_empty());
        buf.clear_line_fixed(0);
        assert_eq!(buf.get_line(0).unwrap().fixed_width(), 0);
    }
}
