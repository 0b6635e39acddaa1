//! Logical lines: one line of program output, independent of terminal width.
//!
//! A logical line may be longer than the terminal is wide; the viewport wraps
//! it into physical rows at display time. Lines produced inside a TUI scroll
//! region carry a non-zero `fixed_width` and are never re-wrapped.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::cell::{Cell, CellFlags, Color};

/// Wall-clock nanoseconds since the Unix epoch.
pub(crate) fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// An ordered sequence of cells representing one logical line of output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalLine {
    cells: Vec<Cell>,
    /// 0 = reflowable; >0 = produced inside a scroll region at that screen
    /// width, must never be re-wrapped.
    fixed_width: u16,
    /// Wall-clock nanoseconds of the last modification.
    updated_at_ns: i64,
    /// The line originated as a shell command prompt (OSC 133); used by
    /// search ranking downstream.
    is_command: bool,
}

impl Default for LogicalLine {
    fn default() -> Self {
        Self::new()
    }
}

impl LogicalLine {
    pub fn new() -> Self {
        LogicalLine {
            cells: Vec::new(),
            fixed_width: 0,
            updated_at_ns: now_ns(),
            is_command: false,
        }
    }

    /// Rebuild a line from its persisted parts.
    pub fn from_parts(
        cells: Vec<Cell>,
        fixed_width: u16,
        updated_at_ns: i64,
        is_command: bool,
    ) -> Self {
        LogicalLine {
            cells,
            fixed_width,
            updated_at_ns,
            is_command,
        }
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cell(&self, x: usize) -> Option<&Cell> {
        self.cells.get(x)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn fixed_width(&self) -> u16 {
        self.fixed_width
    }

    pub fn set_fixed_width(&mut self, width: u16) {
        self.fixed_width = width;
    }

    pub fn updated_at_ns(&self) -> i64 {
        self.updated_at_ns
    }

    pub fn touch(&mut self, ts_ns: i64) {
        self.updated_at_ns = ts_ns;
    }

    pub fn is_command(&self) -> bool {
        self.is_command
    }

    pub fn set_command(&mut self, is_command: bool) {
        self.is_command = is_command;
    }

    /// True when no cell would draw anything.
    pub fn is_blank(&self) -> bool {
        self.cells.iter().all(Cell::is_blank)
    }

    /// Place a cell at column `x`, growing the line with blanks if needed.
    pub fn put_cell(&mut self, x: usize, cell: Cell) {
        if x >= self.cells.len() {
            self.cells.resize(x + 1, Cell::blank());
        }
        self.cells[x] = cell;
    }

    /// Insert a cell at column `x`, shifting the remainder right (IRM).
    /// Cells pushed past `limit` columns are dropped.
    pub fn insert_cell(&mut self, x: usize, cell: Cell, limit: usize) {
        if x >= self.cells.len() {
            self.put_cell(x, cell);
        } else {
            self.cells.insert(x, cell);
        }
        if self.cells.len() > limit {
            self.cells.truncate(limit);
        }
    }

    /// Insert `n` blank cells at column `x` (ICH), bounded by `limit`.
    pub fn insert_blanks(&mut self, x: usize, n: usize, fill: Cell, limit: usize) {
        if x >= self.cells.len() {
            return;
        }
        for _ in 0..n {
            self.cells.insert(x, fill);
        }
        if self.cells.len() > limit {
            self.cells.truncate(limit);
        }
    }

    /// Delete `n` cells at column `x`, shifting the remainder left (DCH).
    pub fn delete_cells(&mut self, x: usize, n: usize) {
        if x >= self.cells.len() {
            return;
        }
        let end = (x + n).min(self.cells.len());
        self.cells.drain(x..end);
    }

    /// Overwrite `n` cells at column `x` with `fill`, without shifting (ECH).
    pub fn erase_cells(&mut self, x: usize, n: usize, fill: Cell) {
        for i in x..(x + n) {
            if i >= self.cells.len() {
                break;
            }
            self.cells[i] = fill;
        }
    }

    /// Clear the whole line, painting nothing (EL 2 drops the cells).
    pub fn erase_all(&mut self) {
        self.cells.clear();
    }

    /// Erase from column `x` to the end of the line (EL 0).
    pub fn erase_to_end(&mut self, x: usize) {
        self.cells.truncate(x);
    }

    /// Erase from the start of the line through column `x` (EL 1).
    pub fn erase_from_start(&mut self, x: usize, fill: Cell) {
        let end = (x + 1).min(self.cells.len());
        for cell in &mut self.cells[..end] {
            *cell = fill;
        }
    }

    /// Whether the line soft-wrapped at write time: its last cell carries the
    /// continuation flag set by the write-with-wrap path.
    pub fn is_soft_wrapped(&self) -> bool {
        self.cells
            .last()
            .is_some_and(|c| c.flags.contains(CellFlags::WRAPPED))
    }

    pub fn set_soft_wrapped(&mut self, wrapped: bool) {
        if let Some(last) = self.cells.last_mut() {
            last.flags.set(CellFlags::WRAPPED, wrapped);
        }
    }

    /// Number of physical rows this line occupies at terminal width `width`.
    ///
    /// Fixed-width lines always occupy exactly one row; reflowable lines take
    /// `ceil(len / width)` rows and at least one.
    pub fn physical_rows(&self, width: u16) -> usize {
        if self.fixed_width > 0 || width == 0 {
            return 1;
        }
        self.cells.len().div_ceil(width as usize).max(1)
    }

    /// The printable text of the line, continuation cells skipped and
    /// trailing blanks trimmed.
    pub fn text(&self) -> String {
        let mut out = String::with_capacity(self.cells.len());
        for cell in &self.cells {
            if cell.is_wide_continuation() {
                continue;
            }
            out.push(if cell.rune == '\0' { ' ' } else { cell.rune });
        }
        let trimmed = out.trim_end().len();
        out.truncate(trimmed);
        out
    }

    /// Materialise the line as exactly `width` display cells for one physical
    /// row, truncating or padding with blanks. Used for fixed-width lines.
    pub fn row_at_width(&self, width: u16) -> Vec<Cell> {
        let width = width as usize;
        let mut row: Vec<Cell> = self.cells.iter().take(width).copied().collect();
        row.resize(width, Cell::blank());
        row
    }

    /// Default background of the trailing erase, if any cell has one.
    pub fn fill_bg(&self) -> Color {
        self.cells.last().map(|c| c.bg).unwrap_or(Color::Default)
    }
}
