//! Screen model: cursor, graphic rendition, margins, modes, and the mapping
//! from viewport rows to global line indices.
//!
//! The screen model implements the parser's [`Handler`] trait. Printable
//! input lands in the memory buffer at `live_edge_base + cursor_y`; the
//! alternate screen is a detached grid that never touches the buffer.
//! `live_edge_base` only ever advances: on a full-screen linefeed at the
//! bottom margin (committing the top row to scrollback) and when a
//! whole-viewport erase pushes its content to scrollback first.

mod alt;
mod charset;
mod fixed;
mod tabs;

pub use alt::AltScreen;
pub use charset::Charset;
pub use fixed::FixedWidthDetector;
pub use tabs::TabStops;

use std::sync::{Arc, RwLock};

use unicode_width::UnicodeWidthChar;

use crate::buffer::{GlobalIdx, MemoryBuffer};
use crate::cell::{Cell, CellFlags, Style};
use crate::config::EngineConfig;
use crate::line::LogicalLine;
use crate::observer::TerminalObserver;
use crate::parser::{
    ColorPlane, EraseMode, Handler, PrivateMode, SgrAttr, ShellMark, TabClearMode,
};

/// Cursor state as exposed to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub x: u16,
    pub y: u16,
    pub visible: bool,
    /// The previous write filled the last column; the next printable wraps.
    pending_wrap: bool,
}

#[derive(Debug, Clone, Copy)]
struct SavedCursor {
    x: u16,
    y: u16,
    style: Style,
    origin_mode: bool,
}

/// Owns everything the parser mutates: cursor, SGR, margins, modes, the
/// alternate screen and the live-edge mapping into the memory buffer.
pub struct ScreenModel {
    buffer: Arc<RwLock<MemoryBuffer>>,
    observer: Arc<dyn TerminalObserver>,
    width: u16,
    height: u16,
    cursor: Cursor,
    saved: Option<SavedCursor>,
    alt_saved: Option<SavedCursor>,
    style: Style,
    top_margin: u16,
    bottom_margin: u16,
    left_margin: u16,
    right_margin: u16,
    origin_mode: bool,
    auto_wrap: bool,
    insert_mode: bool,
    lr_margin_mode: bool,
    bracketed_paste: bool,
    sync_update: bool,
    app_cursor_keys: bool,
    alt: Option<AltScreen>,
    live_edge_base: GlobalIdx,
    tabs: TabStops,
    charset: Charset,
    fixed: FixedWidthDetector,
}

impl ScreenModel {
    pub fn new(
        cfg: &EngineConfig,
        buffer: Arc<RwLock<MemoryBuffer>>,
        observer: Arc<dyn TerminalObserver>,
    ) -> Self {
        let (width, height) = (cfg.cols.max(1), cfg.rows.max(1));
        ScreenModel {
            buffer,
            observer,
            width,
            height,
            cursor: Cursor {
                x: 0,
                y: 0,
                visible: true,
                pending_wrap: false,
            },
            saved: None,
            alt_saved: None,
            style: Style::default(),
            top_margin: 0,
            bottom_margin: height - 1,
            left_margin: 0,
            right_margin: width - 1,
            origin_mode: false,
            auto_wrap: true,
            insert_mode: false,
            lr_margin_mode: false,
            bracketed_paste: false,
            sync_update: false,
            app_cursor_keys: false,
            alt: None,
            live_edge_base: 0,
            tabs: TabStops::new(width),
            charset: Charset::default(),
            fixed: FixedWidthDetector::new(&cfg.fixed_width),
        }
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn live_edge_base(&self) -> GlobalIdx {
        self.live_edge_base
    }

    /// Restore the live edge and cursor from recovered metadata.
    pub fn restore(&mut self, live_edge_base: GlobalIdx, cursor_x: u16, cursor_y: u16) {
        self.live_edge_base = live_edge_base;
        self.cursor.x = cursor_x.min(self.width - 1);
        self.cursor.y = cursor_y.min(self.height - 1);
        self.sync_cursor();
    }

    pub fn cursor(&self) -> (u16, u16, bool) {
        (self.cursor.x, self.cursor.y, self.cursor.visible)
    }

    pub fn is_alt_active(&self) -> bool {
        self.alt.is_some()
    }

    /// The alternate-screen grid, when active.
    pub fn alt_rows(&self) -> Option<Vec<Vec<Cell>>> {
        self.alt.as_ref().map(AltScreen::rows)
    }

    pub fn bracketed_paste(&self) -> bool {
        self.bracketed_paste
    }

    pub fn app_cursor_keys(&self) -> bool {
        self.app_cursor_keys
    }

    pub fn sync_update(&self) -> bool {
        self.sync_update
    }

    /// Resize the screen. Margins reset to full screen; stored lines are
    /// never rewritten (the viewport re-wraps them).
    pub fn resize(&mut self, width: u16, height: u16) {
        let (width, height) = (width.max(1), height.max(1));
        if let Some(alt) = &self.alt {
            let mut grid = AltScreen::new(width, height, Cell::blank_with_bg(self.style.bg));
            for y in 0..height.min(alt.height()) {
                for x in 0..width.min(alt.width()) {
                    if let Some(cell) = alt.get(x, y) {
                        grid.put(x, y, *cell);
                    }
                }
            }
            self.alt = Some(grid);
        }
        self.width = width;
        self.height = height;
        self.top_margin = 0;
        self.bottom_margin = height - 1;
        self.left_margin = 0;
        self.right_margin = width - 1;
        self.fixed.set_region_active(false);
        self.tabs.resize(width);
        self.cursor.x = self.cursor.x.min(width - 1);
        self.cursor.y = self.cursor.y.min(height - 1);
        self.cursor.pending_wrap = false;
        let mut buf = self.buf_mut();
        buf.set_term_width(width);
        drop(buf);
        self.sync_cursor();
    }

    fn buf_mut(&self) -> std::sync::RwLockWriteGuard<'_, MemoryBuffer> {
        self.buffer.write().expect("memory buffer lock poisoned")
    }

    fn current_global(&self) -> GlobalIdx {
        self.live_edge_base + self.cursor.y as GlobalIdx
    }

    fn full_width_margins(&self) -> bool {
        self.left_margin == 0 && self.right_margin == self.width - 1
    }

    fn full_screen_margins(&self) -> bool {
        self.top_margin == 0 && self.bottom_margin == self.height - 1 && self.full_width_margins()
    }

    fn fill_cell(&self) -> Cell {
        Cell::blank_with_bg(self.style.bg)
    }

    fn sync_cursor(&mut self) {
        let (x, y) = (self.cursor.x, self.cursor.y);
        self.buf_mut().set_cursor(x, y);
    }

    /// Record an absolute row move with the fixed-width detector and mark
    /// the destination line when the TUI jump pattern fires.
    fn note_cursor_jump(&mut self) {
        let row = self.cursor.y;
        if self.fixed.record_cursor_row(row) && self.alt.is_none() {
            let g = self.current_global();
            let width = self.width;
            self.buf_mut().set_line_fixed(g, width);
        }
    }

    /// CR + index, marking the soft wrap on the line being left.
    fn wrap_line(&mut self) {
        if self.alt.is_none() {
            let g = self.current_global();
            self.buf_mut().mutate_line(g, |line| line.set_soft_wrapped(true));
        }
        self.cursor.x = self.left_margin;
        self.cursor.pending_wrap = false;
        self.index_down();
    }

    /// Move down one row, scrolling the region when at the bottom margin.
    fn index_down(&mut self) {
        if self.cursor.y == self.bottom_margin {
            self.scroll_up_for_index(1);
        } else if self.cursor.y < self.height - 1 {
            self.cursor.y += 1;
        }
        self.cursor.pending_wrap = false;
        self.sync_cursor();
    }

    fn index_up(&mut self) {
        if self.cursor.y == self.top_margin {
            self.scroll_down_region(1);
        } else if self.cursor.y > 0 {
            self.cursor.y -= 1;
        }
        self.cursor.pending_wrap = false;
        self.sync_cursor();
    }

    /// Scroll up driven by a linefeed at the bottom margin. This is the only
    /// path that advances `live_edge_base`: with full-screen margins the top
    /// row simply falls into scrollback; with a vertical region (full-width
    /// columns) the region's top line is committed to scrollback and the
    /// rows outside the region follow the live edge. Column-bounded margins
    /// cannot commit a partial line, so they shift in place and the span is
    /// lost.
    fn scroll_up_for_index(&mut self, n: u16) {
        let (top, bottom) = (self.top_margin, self.bottom_margin);
        let (l, r) = (self.left_margin, self.right_margin);
        let fill = self.fill_cell();
        if let Some(alt) = &mut self.alt {
            alt.shift_rows_up(top, bottom, n, l, r, fill);
            return;
        }
        if self.full_screen_margins() {
            self.live_edge_base += n as GlobalIdx;
            return;
        }
        if self.full_width_margins() {
            for _ in 0..n {
                let base = self.live_edge_base;
                self.buf_mut().rotate_into_history(base, top, bottom);
                self.live_edge_base += 1;
            }
            self.mark_region_fixed();
            return;
        }
        self.shift_primary_rows(top, bottom, n, true);
        self.mark_region_fixed();
    }

    /// SU/DL: in-place block shift of the region; the top lines are lost
    /// and `live_edge_base` never moves.
    fn scroll_up_in_place(&mut self, n: u16) {
        let (top, bottom) = (self.top_margin, self.bottom_margin);
        let (l, r) = (self.left_margin, self.right_margin);
        let fill = self.fill_cell();
        if let Some(alt) = &mut self.alt {
            alt.shift_rows_up(top, bottom, n, l, r, fill);
            return;
        }
        self.shift_primary_rows(top, bottom, n, true);
        if self.fixed.region_active() {
            self.mark_region_fixed();
        }
    }

    fn scroll_down_region(&mut self, n: u16) {
        let (top, bottom) = (self.top_margin, self.bottom_margin);
        let (l, r) = (self.left_margin, self.right_margin);
        let fill = self.fill_cell();
        if let Some(alt) = &mut self.alt {
            alt.shift_rows_down(top, bottom, n, l, r, fill);
            return;
        }
        self.shift_primary_rows(top, bottom, n, false);
        if self.fixed.region_active() {
            self.mark_region_fixed();
        }
    }

    /// In-place block shift of primary-screen rows `[top, bottom]`.
    fn shift_primary_rows(&mut self, top: u16, bottom: u16, n: u16, up: bool) {
        if top > bottom {
            return;
        }
        let base = self.live_edge_base;
        let (a, b) = (base + top as GlobalIdx, base + bottom as GlobalIdx);
        if self.full_width_margins() {
            let mut buf = self.buf_mut();
            if up {
                buf.shift_region_up(a, b, n as usize);
            } else {
                buf.shift_region_down(a, b, n as usize);
            }
            return;
        }
        // Narrow margins: only the cell span [l, r] of each row moves.
        let (l, r) = (self.left_margin as usize, self.right_margin as usize);
        let fill = self.fill_cell();
        let mut buf = self.buf_mut();
        buf.ensure_line(b);
        let rows: Vec<u16> = if up {
            (top..=bottom).collect()
        } else {
            (top..=bottom).rev().collect()
        };
        for y in rows {
            let src_y = if up {
                y.checked_add(n).filter(|&s| s <= bottom)
            } else {
                y.checked_sub(n).filter(|&s| s >= top)
            };
            let span: Vec<Cell> = match src_y {
                Some(src_y) => {
                    let src = buf.get_line(base + src_y as GlobalIdx);
                    (l..=r)
                        .map(|x| src.and_then(|s| s.cell(x)).copied().unwrap_or(fill))
                        .collect()
                }
                None => vec![fill; r - l + 1],
            };
            buf.mutate_line(base + y as GlobalIdx, |line| {
                for (i, cell) in span.iter().enumerate() {
                    line.put_cell(l + i, *cell);
                }
            });
        }
    }

    /// Mark every line of the active region as drawn at this width.
    fn mark_region_fixed(&mut self) {
        let base = self.live_edge_base;
        let (top, bottom) = (self.top_margin, self.bottom_margin);
        let width = self.width;
        let mut buf = self.buf_mut();
        for y in top..=bottom {
            buf.set_line_fixed(base + y as GlobalIdx, width);
        }
    }

    /// Push all non-blank viewport rows into scrollback by advancing the
    /// live edge past the last non-blank row. An all-blank viewport pushes
    /// nothing.
    fn push_viewport_to_scrollback(&mut self) {
        if self.alt.is_some() {
            return;
        }
        let base = self.live_edge_base;
        let mut last_non_blank = None;
        {
            let buf = self.buffer.read().expect("memory buffer lock poisoned");
            for y in 0..self.height {
                if let Some(line) = buf.get_line(base + y as GlobalIdx) {
                    if !line.is_blank() {
                        last_non_blank = Some(y);
                    }
                }
            }
        }
        let Some(last) = last_non_blank else {
            return;
        };
        self.live_edge_base = base + last as GlobalIdx + 1;
        tracing::debug!(
            pushed = last + 1,
            live_edge_base = self.live_edge_base,
            "viewport pushed to scrollback"
        );
    }

    /// Clear viewport row `y` (primary screen), dropping its cells.
    fn clear_primary_row(&mut self, y: u16) {
        let g = self.live_edge_base + y as GlobalIdx;
        let mut buf = self.buf_mut();
        if buf.contains(g) && !buf.get_line(g).is_none_or(LogicalLine::is_empty) {
            buf.erase_line(g);
        }
    }

    fn enter_alt_screen(&mut self) {
        if self.alt.is_some() {
            return;
        }
        self.alt_saved = Some(SavedCursor {
            x: self.cursor.x,
            y: self.cursor.y,
            style: self.style,
            origin_mode: self.origin_mode,
        });
        self.alt = Some(AltScreen::new(
            self.width,
            self.height,
            Cell::blank_with_bg(self.style.bg),
        ));
        self.cursor.x = 0;
        self.cursor.y = 0;
        self.cursor.pending_wrap = false;
        self.sync_cursor();
        self.observer.alt_screen_changed(true);
    }

    fn exit_alt_screen(&mut self) {
        if self.alt.take().is_none() {
            return;
        }
        if let Some(saved) = self.alt_saved.take() {
            self.cursor.x = saved.x.min(self.width - 1);
            self.cursor.y = saved.y.min(self.height - 1);
            self.style = saved.style;
            self.origin_mode = saved.origin_mode;
        }
        self.cursor.pending_wrap = false;
        // Force a repaint of the restored primary content.
        self.buf_mut().invalidate();
        self.sync_cursor();
        self.observer.alt_screen_changed(false);
    }

    /// Clamped absolute cursor move, honouring origin mode.
    fn move_cursor_to(&mut self, row: u16, col: u16) {
        let (row_base, row_max) = if self.origin_mode {
            (self.top_margin, self.bottom_margin)
        } else {
            (0, self.height - 1)
        };
        let (col_base, col_max) = if self.origin_mode {
            (self.left_margin, self.right_margin)
        } else {
            (0, self.width - 1)
        };
        self.cursor.y = row_base.saturating_add(row).min(row_max);
        self.cursor.x = col_base.saturating_add(col).min(col_max);
        self.cursor.pending_wrap = false;
        self.sync_cursor();
        self.note_cursor_jump();
    }
}

impl Handler for ScreenModel {
    fn input(&mut self, c: char) {
        let c = self.charset.map(c);
        let char_width = match UnicodeWidthChar::width(c) {
            Some(w) if w > 0 => (w as u16).min(2),
            _ => {
                // Zero-width scalars are not given cells.
                tracing::trace!("skipping zero-width scalar U+{:04X}", c as u32);
                return;
            }
        };
        if self.cursor.pending_wrap && self.auto_wrap {
            self.wrap_line();
        }
        let wide = char_width == 2;
        if wide && self.cursor.x.saturating_add(1) > self.right_margin {
            // A wide glyph never straddles the margin.
            if self.auto_wrap {
                self.wrap_line();
            } else {
                return;
            }
        }
        let x = self.cursor.x;
        let y = self.cursor.y;
        let style = self.style;
        let mut cell = Cell::new(c, style);
        if wide {
            cell.flags.insert(CellFlags::WIDE);
        }
        if let Some(alt) = &mut self.alt {
            if self.insert_mode {
                alt.insert_cells(x, y, char_width, self.right_margin, Cell::blank_with_bg(style.bg));
            }
            alt.put(x, y, cell);
            if wide {
                alt.put(x + 1, y, Cell::wide_continuation(style));
            }
        } else {
            let g = self.current_global();
            let limit = self.width as usize;
            let region_active = self.fixed.region_active();
            let width = self.width;
            let mut buf = self.buf_mut();
            if self.insert_mode {
                buf.insert_cell(g, x as usize, cell, limit);
                if wide {
                    buf.insert_cell(g, x as usize + 1, Cell::wide_continuation(style), limit);
                }
            } else {
                buf.write_cell(g, x as usize, cell);
                if wide {
                    buf.write_cell(g, x as usize + 1, Cell::wide_continuation(style));
                }
            }
            if region_active {
                buf.set_line_fixed(g, width);
            }
        }
        let after = self.cursor.x.saturating_add(char_width);
        if after > self.right_margin {
            self.cursor.x = self.right_margin;
            self.cursor.pending_wrap = self.auto_wrap;
        } else {
            self.cursor.x = after;
            self.cursor.pending_wrap = false;
        }
        self.sync_cursor();
    }

    fn carriage_return(&mut self) {
        self.cursor.x = if self.cursor.x >= self.left_margin {
            self.left_margin
        } else {
            0
        };
        self.cursor.pending_wrap = false;
        self.sync_cursor();
    }

    fn linefeed(&mut self) {
        self.index_down();
    }

    fn backspace(&mut self) {
        if self.cursor.x > self.left_margin {
            self.cursor.x -= 1;
        } else if self.cursor.x > 0 {
            self.cursor.x -= 1;
        }
        self.cursor.pending_wrap = false;
        self.sync_cursor();
    }

    fn horizontal_tab(&mut self) {
        self.cursor.x = self.tabs.next(self.cursor.x).min(self.right_margin);
        self.cursor.pending_wrap = false;
        self.sync_cursor();
    }

    fn reset_terminal(&mut self) {
        let was_alt = self.alt.take().is_some();
        if was_alt {
            self.observer.alt_screen_changed(false);
        }
        // The record survives a reset: the viewport is pushed, not wiped.
        self.push_viewport_to_scrollback();
        for y in 0..self.height {
            self.clear_primary_row(y);
        }
        self.style = Style::default();
        self.cursor = Cursor {
            x: 0,
            y: 0,
            visible: true,
            pending_wrap: false,
        };
        self.saved = None;
        self.alt_saved = None;
        self.top_margin = 0;
        self.bottom_margin = self.height - 1;
        self.left_margin = 0;
        self.right_margin = self.width - 1;
        self.origin_mode = false;
        self.auto_wrap = true;
        self.insert_mode = false;
        self.lr_margin_mode = false;
        self.bracketed_paste = false;
        self.sync_update = false;
        self.app_cursor_keys = false;
        self.tabs.reset();
        self.charset = Charset::default();
        self.fixed.reset();
        self.sync_cursor();
    }

    fn index(&mut self) {
        self.index_down();
    }

    fn next_line(&mut self) {
        self.carriage_return();
        self.index_down();
    }

    fn reverse_index(&mut self) {
        self.index_up();
    }

    fn set_tab_stop(&mut self) {
        self.tabs.set(self.cursor.x);
    }

    fn save_cursor(&mut self) {
        self.saved = Some(SavedCursor {
            x: self.cursor.x,
            y: self.cursor.y,
            style: self.style,
            origin_mode: self.origin_mode,
        });
    }

    fn restore_cursor(&mut self) {
        if let Some(saved) = self.saved {
            self.cursor.x = saved.x.min(self.width - 1);
            self.cursor.y = saved.y.min(self.height - 1);
            self.style = saved.style;
            self.origin_mode = saved.origin_mode;
        } else {
            self.cursor.x = 0;
            self.cursor.y = 0;
        }
        self.cursor.pending_wrap = false;
        self.sync_cursor();
    }

    fn back_index(&mut self) {
        if self.cursor.x > self.left_margin {
            self.cursor.x -= 1;
            self.sync_cursor();
            return;
        }
        let (top, bottom) = (self.top_margin, self.bottom_margin);
        let (l, r) = (self.left_margin, self.right_margin);
        let fill = self.fill_cell();
        if let Some(alt) = &mut self.alt {
            alt.shift_columns_right(top, bottom, l, r, fill);
            return;
        }
        let base = self.live_edge_base;
        let limit = r as usize + 1;
        let mut buf = self.buf_mut();
        for y in top..=bottom {
            buf.mutate_line(base + y as GlobalIdx, |line| {
                line.insert_cell(l as usize, fill, limit);
            });
        }
    }

    fn forward_index(&mut self) {
        if self.cursor.x < self.right_margin {
            self.cursor.x += 1;
            self.sync_cursor();
            return;
        }
        let (top, bottom) = (self.top_margin, self.bottom_margin);
        let (l, r) = (self.left_margin, self.right_margin);
        let fill = self.fill_cell();
        if let Some(alt) = &mut self.alt {
            alt.shift_columns_left(top, bottom, l, r, fill);
            return;
        }
        let base = self.live_edge_base;
        let mut buf = self.buf_mut();
        for y in top..=bottom {
            buf.mutate_line(base + y as GlobalIdx, |line| {
                line.delete_cells(l as usize, 1);
                if line.len() > r as usize {
                    line.put_cell(r as usize, fill);
                }
            });
        }
    }

    fn screen_alignment_test(&mut self) {
        self.top_margin = 0;
        self.bottom_margin = self.height - 1;
        self.left_margin = 0;
        self.right_margin = self.width - 1;
        self.fixed.set_region_active(false);
        let e = Cell::new('E', Style::default());
        if let Some(alt) = &mut self.alt {
            alt.clear_all(e);
        } else {
            let base = self.live_edge_base;
            let width = self.width as usize;
            let mut buf = self.buf_mut();
            for y in 0..self.height {
                buf.mutate_line(base + y as GlobalIdx, |line| {
                    line.erase_all();
                    for x in 0..width {
                        line.put_cell(x, e);
                    }
                });
            }
        }
        self.cursor.x = 0;
        self.cursor.y = 0;
        self.cursor.pending_wrap = false;
        self.sync_cursor();
    }

    fn designate_charset(&mut self, designator: char) {
        self.charset = Charset::from_designator(designator);
    }

    fn cursor_up(&mut self, n: u16) {
        let floor = if self.cursor.y >= self.top_margin {
            self.top_margin
        } else {
            0
        };
        self.cursor.y = self.cursor.y.saturating_sub(n).max(floor);
        self.cursor.pending_wrap = false;
        self.sync_cursor();
    }

    fn cursor_down(&mut self, n: u16) {
        let ceil = if self.cursor.y <= self.bottom_margin {
            self.bottom_margin
        } else {
            self.height - 1
        };
        self.cursor.y = self.cursor.y.saturating_add(n).min(ceil);
        self.cursor.pending_wrap = false;
        self.sync_cursor();
    }

    fn cursor_forward(&mut self, n: u16) {
        self.cursor.x = self.cursor.x.saturating_add(n).min(self.right_margin);
        self.cursor.pending_wrap = false;
        self.sync_cursor();
    }

    fn cursor_back(&mut self, n: u16) {
        let floor = if self.cursor.x >= self.left_margin {
            self.left_margin
        } else {
            0
        };
        self.cursor.x = self.cursor.x.saturating_sub(n).max(floor);
        self.cursor.pending_wrap = false;
        self.sync_cursor();
    }

    fn cursor_next_line(&mut self, n: u16) {
        self.cursor_down(n);
        self.carriage_return();
    }

    fn cursor_prev_line(&mut self, n: u16) {
        self.cursor_up(n);
        self.carriage_return();
    }

    fn cursor_column(&mut self, col: u16) {
        let (base, max) = if self.origin_mode {
            (self.left_margin, self.right_margin)
        } else {
            (0, self.width - 1)
        };
        self.cursor.x = base.saturating_add(col).min(max);
        self.cursor.pending_wrap = false;
        self.sync_cursor();
    }

    fn cursor_position(&mut self, row: u16, col: u16) {
        self.move_cursor_to(row, col);
    }

    fn erase_display(&mut self, mode: EraseMode) {
        let fill = self.fill_cell();
        if let Some(alt) = &mut self.alt {
            let (w, h) = (self.width, self.height);
            let (x, y) = (self.cursor.x, self.cursor.y);
            match mode {
                EraseMode::ToEnd => {
                    alt.erase_span(y, x, w - 1, fill);
                    for row in y + 1..h {
                        alt.erase_span(row, 0, w - 1, fill);
                    }
                }
                EraseMode::ToStart => {
                    for row in 0..y {
                        alt.erase_span(row, 0, w - 1, fill);
                    }
                    alt.erase_span(y, 0, x, fill);
                }
                EraseMode::All => alt.clear_all(fill),
            }
            return;
        }
        match mode {
            EraseMode::ToEnd if self.cursor.x == 0 && self.cursor.y == 0 => {
                self.erase_display(EraseMode::All);
            }
            EraseMode::ToEnd => {
                let g = self.current_global();
                let x = self.cursor.x as usize;
                self.buf_mut().erase_to_end(g, x);
                for y in self.cursor.y + 1..self.height {
                    self.clear_primary_row(y);
                }
            }
            EraseMode::ToStart => {
                for y in 0..self.cursor.y {
                    self.clear_primary_row(y);
                }
                let g = self.current_global();
                let x = self.cursor.x as usize;
                self.buf_mut().erase_from_start(g, x, fill);
            }
            EraseMode::All => {
                self.push_viewport_to_scrollback();
                for y in 0..self.height {
                    self.clear_primary_row(y);
                }
            }
        }
    }

    fn erase_line(&mut self, mode: EraseMode) {
        let fill = self.fill_cell();
        let (x, y) = (self.cursor.x, self.cursor.y);
        if let Some(alt) = &mut self.alt {
            let w = self.width;
            match mode {
                EraseMode::ToEnd => alt.erase_span(y, x, w - 1, fill),
                EraseMode::ToStart => alt.erase_span(y, 0, x, fill),
                EraseMode::All => alt.erase_span(y, 0, w - 1, fill),
            }
            return;
        }
        let g = self.current_global();
        let mut buf = self.buf_mut();
        match mode {
            EraseMode::ToEnd => buf.erase_to_end(g, x as usize),
            EraseMode::ToStart => buf.erase_from_start(g, x as usize, fill),
            EraseMode::All => buf.erase_line(g),
        }
    }

    fn insert_lines(&mut self, n: u16) {
        if self.cursor.y < self.top_margin || self.cursor.y > self.bottom_margin {
            return;
        }
        let saved_top = self.top_margin;
        self.top_margin = self.cursor.y;
        self.scroll_down_region(n);
        self.top_margin = saved_top;
        self.carriage_return();
    }

    fn delete_lines(&mut self, n: u16) {
        if self.cursor.y < self.top_margin || self.cursor.y > self.bottom_margin {
            return;
        }
        let saved_top = self.top_margin;
        self.top_margin = self.cursor.y;
        self.scroll_up_in_place(n);
        self.top_margin = saved_top;
        self.carriage_return();
    }

    fn insert_chars(&mut self, n: u16) {
        let fill = self.fill_cell();
        let (x, y) = (self.cursor.x, self.cursor.y);
        if let Some(alt) = &mut self.alt {
            alt.insert_cells(x, y, n, self.right_margin, fill);
            return;
        }
        let g = self.current_global();
        let limit = self.right_margin as usize + 1;
        self.buf_mut()
            .mutate_line(g, |line| line.insert_blanks(x as usize, n as usize, fill, limit));
    }

    fn delete_chars(&mut self, n: u16) {
        let fill = self.fill_cell();
        let (x, y) = (self.cursor.x, self.cursor.y);
        if let Some(alt) = &mut self.alt {
            alt.delete_cells(x, y, n, self.right_margin, fill);
            return;
        }
        let g = self.current_global();
        self.buf_mut()
            .mutate_line(g, |line| line.delete_cells(x as usize, n as usize));
    }

    fn erase_chars(&mut self, n: u16) {
        let fill = self.fill_cell();
        let (x, y) = (self.cursor.x, self.cursor.y);
        if let Some(alt) = &mut self.alt {
            let end = x.saturating_add(n.max(1) - 1).min(self.width - 1);
            alt.erase_span(y, x, end, fill);
            return;
        }
        let g = self.current_global();
        self.buf_mut()
            .mutate_line(g, |line| line.erase_cells(x as usize, n as usize, fill));
    }

    fn scroll_up(&mut self, n: u16) {
        // SU never commits to scrollback: the shift is in place even with
        // full-screen margins.
        self.scroll_up_in_place(n);
    }

    fn scroll_down(&mut self, n: u16) {
        self.scroll_down_region(n);
    }

    fn set_scroll_region(&mut self, top: u16, bottom: Option<u16>) {
        let bottom = bottom.unwrap_or(self.height - 1).min(self.height - 1);
        if top >= bottom {
            tracing::debug!(top, bottom, "ignoring degenerate DECSTBM");
            return;
        }
        self.top_margin = top;
        self.bottom_margin = bottom;
        self.fixed
            .set_region_active(!(top == 0 && bottom == self.height - 1));
        self.move_cursor_to(0, 0);
    }

    fn set_horizontal_margins(&mut self, left: u16, right: Option<u16>) {
        if !self.lr_margin_mode {
            tracing::debug!("DECSLRM ignored: DECLRMM not set");
            return;
        }
        let right = right.unwrap_or(self.width - 1).min(self.width - 1);
        if left >= right {
            tracing::debug!(left, right, "ignoring degenerate DECSLRM");
            return;
        }
        self.left_margin = left;
        self.right_margin = right;
        self.move_cursor_to(0, 0);
    }

    fn sgr_attr(&mut self, attr: SgrAttr) {
        use crate::cell::Attributes;
        match attr {
            SgrAttr::Reset => self.style = Style::default(),
            SgrAttr::Bold => self.style.attr.insert(Attributes::BOLD),
            SgrAttr::Underline => self.style.attr.insert(Attributes::UNDERLINE),
            SgrAttr::Reverse => self.style.attr.insert(Attributes::REVERSE),
            SgrAttr::CancelBold => self.style.attr.remove(Attributes::BOLD),
            SgrAttr::CancelUnderline => self.style.attr.remove(Attributes::UNDERLINE),
            SgrAttr::CancelReverse => self.style.attr.remove(Attributes::REVERSE),
            SgrAttr::Foreground(color) => self.style.fg = color,
            SgrAttr::Background(color) => self.style.bg = color,
        }
    }

    fn device_status_report(&mut self, kind: u16) {
        match kind {
            5 => self.observer.dsr_reply("\x1b[0n"),
            6 => {
                let (row, col) = if self.origin_mode {
                    (
                        self.cursor.y.saturating_sub(self.top_margin) + 1,
                        self.cursor.x.saturating_sub(self.left_margin) + 1,
                    )
                } else {
                    (self.cursor.y + 1, self.cursor.x + 1)
                };
                self.observer.dsr_reply(&format!("\x1b[{};{}R", row, col));
            }
            other => tracing::debug!("unhandled DSR {}", other),
        }
    }

    fn set_private_mode(&mut self, mode: PrivateMode) {
        match mode {
            PrivateMode::AppCursorKeys => self.app_cursor_keys = true,
            PrivateMode::OriginMode => {
                self.origin_mode = true;
                self.move_cursor_to(0, 0);
            }
            PrivateMode::AutoWrap => self.auto_wrap = true,
            PrivateMode::ShowCursor => {
                self.cursor.visible = true;
                self.fixed.record_visibility(true);
            }
            PrivateMode::LeftRightMargins => self.lr_margin_mode = true,
            PrivateMode::AltScreen => self.enter_alt_screen(),
            PrivateMode::BracketedPaste => {
                self.bracketed_paste = true;
                self.observer.bracketed_paste_changed(true);
            }
            PrivateMode::SyncUpdate => {
                self.sync_update = true;
                self.observer.sync_update_changed(true);
            }
        }
    }

    fn reset_private_mode(&mut self, mode: PrivateMode) {
        match mode {
            PrivateMode::AppCursorKeys => self.app_cursor_keys = false,
            PrivateMode::OriginMode => {
                self.origin_mode = false;
                self.move_cursor_to(0, 0);
            }
            PrivateMode::AutoWrap => self.auto_wrap = false,
            PrivateMode::ShowCursor => {
                self.cursor.visible = false;
                self.fixed.record_visibility(false);
            }
            PrivateMode::LeftRightMargins => {
                self.lr_margin_mode = false;
                self.left_margin = 0;
                self.right_margin = self.width - 1;
            }
            PrivateMode::AltScreen => self.exit_alt_screen(),
            PrivateMode::BracketedPaste => {
                self.bracketed_paste = false;
                self.observer.bracketed_paste_changed(false);
            }
            PrivateMode::SyncUpdate => {
                self.sync_update = false;
                self.observer.sync_update_changed(false);
            }
        }
    }

    fn set_insert_mode(&mut self, enabled: bool) {
        self.insert_mode = enabled;
    }

    fn clear_tab_stop(&mut self, mode: TabClearMode) {
        match mode {
            TabClearMode::Current => self.tabs.clear(self.cursor.x),
            TabClearMode::All => self.tabs.clear_all(),
        }
    }

    fn set_title(&mut self, title: &str) {
        self.observer.title_changed(title);
    }

    fn set_default_color(&mut self, plane: ColorPlane, rgb: (u8, u8, u8)) {
        match plane {
            ColorPlane::Foreground => self.observer.default_fg_changed(rgb),
            ColorPlane::Background => self.observer.default_bg_changed(rgb),
        }
    }

    fn query_default_color(&mut self, plane: ColorPlane) {
        match plane {
            ColorPlane::Foreground => self.observer.default_fg_queried(),
            ColorPlane::Background => self.observer.default_bg_queried(),
        }
    }

    fn shell_integration(&mut self, mark: ShellMark) {
        match mark {
            ShellMark::PromptStart => {
                if self.alt.is_none() {
                    let g = self.current_global();
                    self.buf_mut().set_line_command(g);
                }
                self.observer.prompt_started();
            }
            ShellMark::InputStart => self.observer.input_started(),
            ShellMark::CommandStart => self.observer.command_started(),
            ShellMark::CommandEnd(code) => self.observer.command_ended(code),
        }
    }

    fn env_capture(&mut self, data: &[u8]) {
        self.observer.env_captured(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Color;
    use crate::observer::NullObserver;
    use crate::parser::Parser;

    struct Fixture {
        parser: Parser,
        screen: ScreenModel,
        buffer: Arc<RwLock<MemoryBuffer>>,
    }

    impl Fixture {
        fn new(cols: u16, rows: u16) -> Self {
            let cfg = EngineConfig {
                cols,
                rows,
                ..EngineConfig::default()
            };
            let buffer = Arc::new(RwLock::new(MemoryBuffer::new(&cfg.buffer, cols)));
            let screen = ScreenModel::new(&cfg, buffer.clone(), Arc::new(NullObserver));
            Fixture {
                parser: Parser::new(),
                screen,
                buffer,
            }
        }

        fn feed(&mut self, s: &str) {
            self.parser.advance_str(&mut self.screen, s);
        }

        fn line_text(&self, g: GlobalIdx) -> String {
            self.buffer
                .read()
                .unwrap()
                .get_line(g)
                .map(|l| l.text())
                .unwrap_or_default()
        }

        fn row_text(&self, y: u16) -> String {
            self.line_text(self.screen.live_edge_base() + y as GlobalIdx)
        }
    }

    #[test]
    fn write_and_wrap() {
        let mut f = Fixture::new(10, 5);
        f.feed("AAAAAAAAAABBBBB");
        assert_eq!(f.row_text(0), "AAAAAAAAAA");
        assert_eq!(f.row_text(1), "BBBBB");
        let (x, y, _) = f.screen.cursor();
        assert_eq!((x, y), (5, 1));
    }

    #[test]
    fn wrap_marks_continuation() {
        let mut f = Fixture::new(5, 5);
        f.feed("abcdefg");
        let buf = f.buffer.read().unwrap();
        assert!(buf.get_line(0).unwrap().is_soft_wrapped());
        assert!(!buf.get_line(1).unwrap().is_soft_wrapped());
    }

    #[test]
    fn linefeed_at_bottom_advances_live_edge() {
        let mut f = Fixture::new(10, 3);
        f.feed("a\r\nb\r\nc");
        assert_eq!(f.screen.live_edge_base(), 0);
        f.feed("\r\nd");
        assert_eq!(f.screen.live_edge_base(), 1);
        assert_eq!(f.line_text(0), "a");
        assert_eq!(f.row_text(2), "d");
    }

    #[test]
    fn cup_is_clamped() {
        let mut f = Fixture::new(10, 5);
        f.feed("\x1b[99;99H");
        let (x, y, _) = f.screen.cursor();
        assert_eq!((x, y), (9, 4));
    }

    #[test]
    fn scroll_region_shifts_in_place() {
        let mut f = Fixture::new(10, 5);
        f.feed("top\r\naaa\r\nbbb\r\nccc\r\nbot");
        f.feed("\x1b[2;4r"); // rows 1..=3
        f.feed("\x1b[2;1H"); // cursor to region top
        f.feed("\x1b[2S\x1b[r");
        assert_eq!(f.row_text(0), "top");
        assert_eq!(f.row_text(1), "ccc");
        assert_eq!(f.row_text(2), "");
        assert_eq!(f.row_text(3), "");
        assert_eq!(f.row_text(4), "bot");
        assert_eq!(f.screen.live_edge_base(), 0);
    }

    #[test]
    fn region_linefeed_commits_to_scrollback() {
        let mut f = Fixture::new(20, 5);
        f.feed("HEAD\x1b[5;1HFOOT");
        f.feed("\x1b[2;4r\x1b[2;1H");
        f.feed("A\r\nB\r\nC\r\nD\r\nE");
        // Two linefeeds scrolled at the bottom margin; each committed the
        // region's top line to scrollback.
        assert_eq!(f.screen.live_edge_base(), 2);
        assert_eq!(f.line_text(0), "A");
        assert_eq!(f.line_text(1), "B");
        assert_eq!(f.row_text(0), "HEAD");
        assert_eq!(f.row_text(1), "C");
        assert_eq!(f.row_text(2), "D");
        assert_eq!(f.row_text(3), "E");
        assert_eq!(f.row_text(4), "FOOT");
    }

    #[test]
    fn region_lines_are_marked_fixed_width() {
        let mut f = Fixture::new(10, 5);
        f.feed("\x1b[2;4r\x1b[2;1Hxyz");
        let buf = f.buffer.read().unwrap();
        assert_eq!(buf.get_line(1).unwrap().fixed_width(), 10);
    }

    #[test]
    fn ed2_pushes_viewport_to_scrollback() {
        let mut f = Fixture::new(10, 4);
        f.feed("one\r\ntwo\r\nthree");
        f.feed("\x1b[H\x1b[2J");
        assert_eq!(f.screen.live_edge_base(), 3);
        assert_eq!(f.line_text(0), "one");
        assert_eq!(f.line_text(1), "two");
        assert_eq!(f.line_text(2), "three");
        for y in 0..4 {
            assert_eq!(f.row_text(y), "");
        }
    }

    #[test]
    fn ed2_on_blank_viewport_is_a_noop_push() {
        let mut f = Fixture::new(10, 4);
        f.feed("\x1b[2J");
        assert_eq!(f.screen.live_edge_base(), 0);
    }

    #[test]
    fn alt_screen_is_isolated() {
        let mut f = Fixture::new(10, 4);
        f.feed("primary");
        let end_before = f.buffer.read().unwrap().global_end();
        f.feed("\x1b[?1049h");
        assert!(f.screen.is_alt_active());
        f.feed("alt text\x1b[2J");
        assert_eq!(f.buffer.read().unwrap().global_end(), end_before);
        f.feed("\x1b[?1049l");
        assert!(!f.screen.is_alt_active());
        assert_eq!(f.row_text(0), "primary");
    }

    #[test]
    fn alt_screen_rows_render() {
        let mut f = Fixture::new(6, 2);
        f.feed("\x1b[?1049hhi");
        let rows = f.screen.alt_rows().unwrap();
        assert_eq!(rows[0][0].rune, 'h');
        assert_eq!(rows[0][1].rune, 'i');
    }

    #[test]
    fn wide_chars_take_two_cells() {
        let mut f = Fixture::new(10, 2);
        f.feed("日x");
        let buf = f.buffer.read().unwrap();
        let line = buf.get_line(0).unwrap();
        assert!(line.cell(0).unwrap().is_wide());
        assert!(line.cell(1).unwrap().is_wide_continuation());
        assert_eq!(line.cell(2).unwrap().rune, 'x');
        drop(buf);
        let (x, _, _) = f.screen.cursor();
        assert_eq!(x, 3);
    }

    #[test]
    fn wide_char_never_straddles_the_margin() {
        let mut f = Fixture::new(5, 2);
        f.feed("abcd日");
        // The wide glyph wrapped to the next row.
        assert_eq!(f.row_text(0), "abcd");
        assert_eq!(f.row_text(1), "日");
    }

    #[test]
    fn insert_mode_shifts_tail() {
        let mut f = Fixture::new(10, 2);
        f.feed("abc\x1b[1;1H\x1b[4hX\x1b[4l");
        assert_eq!(f.row_text(0), "Xabc");
    }

    #[test]
    fn origin_mode_addresses_inside_margins() {
        let mut f = Fixture::new(10, 6);
        f.feed("\x1b[2;5r\x1b[?6h\x1b[1;1Hx");
        // Row 1 of the region is absolute row 2 (index 1).
        assert_eq!(f.line_text(1), "x");
    }

    #[test]
    fn il_dl_inside_region() {
        let mut f = Fixture::new(10, 5);
        f.feed("aaa\r\nbbb\r\nccc\r\nddd\r\neee");
        f.feed("\x1b[2;4r\x1b[2;1H\x1b[1L");
        assert_eq!(f.row_text(1), "");
        assert_eq!(f.row_text(2), "bbb");
        assert_eq!(f.row_text(3), "ccc");
        assert_eq!(f.row_text(4), "eee");
        f.feed("\x1b[2;1H\x1b[1M");
        assert_eq!(f.row_text(1), "bbb");
        assert_eq!(f.row_text(3), "");
        assert_eq!(f.screen.live_edge_base(), 0);
    }

    #[test]
    fn reverse_index_at_top_scrolls_down() {
        let mut f = Fixture::new(10, 3);
        f.feed("aaa\r\nbbb\r\nccc\x1b[1;1H\x1bM");
        assert_eq!(f.row_text(0), "");
        assert_eq!(f.row_text(1), "aaa");
        assert_eq!(f.row_text(2), "bbb");
    }

    #[test]
    fn decaln_fills_screen() {
        let mut f = Fixture::new(4, 2);
        f.feed("\x1b#8");
        assert_eq!(f.row_text(0), "EEEE");
        assert_eq!(f.row_text(1), "EEEE");
    }

    #[test]
    fn tab_advances_to_stops() {
        let mut f = Fixture::new(20, 2);
        f.feed("a\tb");
        let buf = f.buffer.read().unwrap();
        let line = buf.get_line(0).unwrap();
        assert_eq!(line.cell(8).unwrap().rune, 'b');
    }

    #[test]
    fn sgr_styles_written_cells() {
        let mut f = Fixture::new(10, 2);
        f.feed("\x1b[1;31mx\x1b[my");
        let buf = f.buffer.read().unwrap();
        let line = buf.get_line(0).unwrap();
        let x = line.cell(0).unwrap();
        assert_eq!(x.fg, Color::Standard(1));
        assert!(x.attr.contains(crate::cell::Attributes::BOLD));
        let y = line.cell(1).unwrap();
        assert_eq!(y.fg, Color::Default);
        assert!(y.attr.is_empty());
    }

    #[test]
    fn prompt_mark_sets_command_flag() {
        let mut f = Fixture::new(10, 2);
        f.feed("\x1b]133;A\x07$ ls");
        let buf = f.buffer.read().unwrap();
        assert!(buf.get_line(0).unwrap().is_command());
    }

    #[test]
    fn dec_graphics_charset_draws_lines() {
        let mut f = Fixture::new(10, 2);
        f.feed("\x1b(0lqqk\x1b(Bok");
        assert_eq!(f.row_text(0), "┌──┐ok");
    }

    #[test]
    fn autowrap_off_sticks_at_margin() {
        let mut f = Fixture::new(5, 2);
        f.feed("\x1b[?7labcdefg");
        assert_eq!(f.row_text(0), "abcdg");
        assert_eq!(f.row_text(1), "");
    }
}
