//! Cell-level value types: one screen position and its styling.
//!
//! A `Cell` is the unit both the screen model and the on-disk codec work in.
//! Wide graphemes occupy two cells: the left half carries the rune with the
//! `WIDE` flag, the right half is a continuation cell (`rune == '\0'`).

use bitflags::bitflags;

/// A foreground or background color.
///
/// `Standard` covers the classic 16-color palette (bright colors are stored
/// as values 8..=15), `Indexed` the 256-color palette, `Rgb` 24-bit truecolor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Color {
    /// The terminal's configured default for this plane.
    #[default]
    Default,
    /// 16-color palette, 0..=15.
    Standard(u8),
    /// 256-color palette.
    Indexed(u8),
    /// 24-bit truecolor.
    Rgb(u8, u8, u8),
}

bitflags! {
    /// Graphic rendition attributes carried by a cell.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Attributes: u16 {
        const BOLD = 1 << 0;
        const UNDERLINE = 1 << 1;
        const REVERSE = 1 << 2;
    }
}

bitflags! {
    /// Structural cell flags, persisted alongside the styling.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CellFlags: u8 {
        /// Left half of a two-column grapheme.
        const WIDE = 1 << 0;
        /// The logical line continues on the next physical row.
        const WRAPPED = 1 << 1;
    }
}

/// The current graphic rendition: what SGR has most recently selected.
///
/// New cells are stamped with a copy of this at write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Style {
    pub fg: Color,
    pub bg: Color,
    pub attr: Attributes,
}

/// A single screen position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    /// Unicode scalar; `'\0'` marks the continuation half of a wide cell
    /// and empty cells produced by erasure.
    pub rune: char,
    pub fg: Color,
    pub bg: Color,
    pub attr: Attributes,
    pub flags: CellFlags,
}

impl Default for Cell {
    fn default() -> Self {
        Self::blank()
    }
}

impl Cell {
    /// An empty cell with default colors.
    pub fn blank() -> Self {
        Cell {
            rune: '\0',
            fg: Color::Default,
            bg: Color::Default,
            attr: Attributes::empty(),
            flags: CellFlags::empty(),
        }
    }

    /// An empty cell carrying the given background (used by erase operations,
    /// which paint with the current SGR background).
    pub fn blank_with_bg(bg: Color) -> Self {
        Cell {
            bg,
            ..Self::blank()
        }
    }

    /// A printable cell stamped with the given style.
    pub fn new(rune: char, style: Style) -> Self {
        Cell {
            rune,
            fg: style.fg,
            bg: style.bg,
            attr: style.attr,
            flags: CellFlags::empty(),
        }
    }

    /// The continuation half of a wide cell.
    pub fn wide_continuation(style: Style) -> Self {
        Cell {
            rune: '\0',
            fg: style.fg,
            bg: style.bg,
            attr: style.attr,
            flags: CellFlags::WIDE,
        }
    }

    pub fn is_wide(&self) -> bool {
        self.flags.contains(CellFlags::WIDE) && self.rune != '\0'
    }

    pub fn is_wide_continuation(&self) -> bool {
        self.flags.contains(CellFlags::WIDE) && self.rune == '\0'
    }

    /// True when nothing would be drawn for this cell: no rune, no reverse
    /// video, default background.
    pub fn is_blank(&self) -> bool {
        (self.rune == '\0' || self.rune == ' ')
            && self.bg == Color::Default
            && !self.attr.contains(Attributes::REVERSE)
    }
}
