//! Binary encoding of cells and logical lines, shared by pages and the WAL.
//!
//! Cell record: `u32 rune, u16 attr, u8 fg_mode, fg_payload, u8 bg_mode,
//! bg_payload, u8 flags`. Color payloads: default none, standard/256 one
//! byte, RGB three bytes. Line body: `u32 fixed_width, u32 cell_count`,
//! then the cells. All integers little-endian.

use anyhow::{bail, Result};

use crate::cell::{Attributes, Cell, CellFlags, Color};
use crate::line::LogicalLine;

const COLOR_DEFAULT: u8 = 0;
const COLOR_STANDARD: u8 = 1;
const COLOR_INDEXED: u8 = 2;
const COLOR_RGB: u8 = 3;

/// Line-level flags stored in page index entries and WAL records.
pub const LINE_FLAG_COMMAND: u32 = 1 << 0;

/// Flags word for a line.
pub fn line_flags(line: &LogicalLine) -> u32 {
    if line.is_command() {
        LINE_FLAG_COMMAND
    } else {
        0
    }
}

/// Cursor over a byte slice with checked little-endian reads.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            bail!("short read: wanted {n} bytes, {} left", self.remaining());
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

fn encode_color(out: &mut Vec<u8>, color: Color) {
    match color {
        Color::Default => out.push(COLOR_DEFAULT),
        Color::Standard(v) => {
            out.push(COLOR_STANDARD);
            out.push(v);
        }
        Color::Indexed(v) => {
            out.push(COLOR_INDEXED);
            out.push(v);
        }
        Color::Rgb(r, g, b) => {
            out.push(COLOR_RGB);
            out.extend_from_slice(&[r, g, b]);
        }
    }
}

fn decode_color(r: &mut Reader) -> Result<Color> {
    match r.u8()? {
        COLOR_DEFAULT => Ok(Color::Default),
        COLOR_STANDARD => Ok(Color::Standard(r.u8()?)),
        COLOR_INDEXED => Ok(Color::Indexed(r.u8()?)),
        COLOR_RGB => {
            let rgb = r.take(3)?;
            Ok(Color::Rgb(rgb[0], rgb[1], rgb[2]))
        }
        mode => bail!("corrupt cell: unknown color mode {mode}"),
    }
}

pub fn encode_cell(out: &mut Vec<u8>, cell: &Cell) {
    out.extend_from_slice(&(cell.rune as u32).to_le_bytes());
    out.extend_from_slice(&cell.attr.bits().to_le_bytes());
    encode_color(out, cell.fg);
    encode_color(out, cell.bg);
    out.push(cell.flags.bits());
}

pub fn decode_cell(r: &mut Reader) -> Result<Cell> {
    let raw_rune = r.u32()?;
    let rune = char::from_u32(raw_rune)
        .ok_or_else(|| anyhow::anyhow!("corrupt cell: invalid scalar {raw_rune:#x}"))?;
    let attr = Attributes::from_bits_truncate(r.u16()?);
    let fg = decode_color(r)?;
    let bg = decode_color(r)?;
    let flags = CellFlags::from_bits_truncate(r.u8()?);
    Ok(Cell {
        rune,
        fg,
        bg,
        attr,
        flags,
    })
}

/// Append the page-format body of a line: fixed width, cell count, cells.
pub fn encode_line_body(out: &mut Vec<u8>, line: &LogicalLine) {
    out.extend_from_slice(&(line.fixed_width() as u32).to_le_bytes());
    out.extend_from_slice(&(line.cells().len() as u32).to_le_bytes());
    for cell in line.cells() {
        encode_cell(out, cell);
    }
}

/// Decode a line body. Timestamp and flags come from the surrounding index
/// entry or WAL record.
pub fn decode_line_body(r: &mut Reader, timestamp_ns: i64, flags: u32) -> Result<LogicalLine> {
    let fixed_width = r.u32()?;
    let count = r.u32()? as usize;
    // A count beyond the remaining bytes is corruption, not an allocation
    // request.
    if count > r.remaining() {
        bail!("corrupt line: cell count {count} exceeds payload");
    }
    let mut cells = Vec::with_capacity(count);
    for _ in 0..count {
        cells.push(decode_cell(r)?);
    }
    Ok(LogicalLine::from_parts(
        cells,
        fixed_width.min(u16::MAX as u32) as u16,
        timestamp_ns,
        flags & LINE_FLAG_COMMAND != 0,
    ))
}

/// Size of the encoded body, used for page sizing decisions.
pub fn encoded_line_len(line: &LogicalLine) -> usize {
    let mut n = 8; // fixed_width + cell_count
    for cell in line.cells() {
        n += 9; // rune, attr, fg mode, bg mode, flags
        n += match cell.fg {
            Color::Default => 0,
            Color::Standard(_) | Color::Indexed(_) => 1,
            Color::Rgb(..) => 3,
        };
        n += match cell.bg {
            Color::Default => 0,
            Color::Standard(_) | Color::Indexed(_) => 1,
            Color::Rgb(..) => 3,
        };
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Style;

    fn styled_line() -> LogicalLine {
        let mut line = LogicalLine::new();
        let mut style = Style::default();
        style.fg = Color::Rgb(1, 2, 3);
        style.bg = Color::Indexed(240);
        style.attr = Attributes::BOLD | Attributes::REVERSE;
        line.put_cell(0, Cell::new('a', style));
        line.put_cell(1, Cell::new('ß', Style::default()));
        line.put_cell(5, Cell::new('日', style));
        line.set_fixed_width(40);
        line.set_command(true);
        line
    }

    #[test]
    fn cell_roundtrip() {
        let mut style = Style::default();
        style.fg = Color::Standard(9);
        let cell = Cell::new('x', style);
        let mut buf = Vec::new();
        encode_cell(&mut buf, &cell);
        let decoded = decode_cell(&mut Reader::new(&buf)).unwrap();
        assert_eq!(decoded, cell);
    }

    #[test]
    fn line_roundtrip_preserves_cells_and_fixed_width() {
        let line = styled_line();
        let mut buf = Vec::new();
        encode_line_body(&mut buf, &line);
        assert_eq!(buf.len(), encoded_line_len(&line));
        let decoded =
            decode_line_body(&mut Reader::new(&buf), line.updated_at_ns(), line_flags(&line))
                .unwrap();
        assert_eq!(decoded.cells(), line.cells());
        assert_eq!(decoded.fixed_width(), line.fixed_width());
        assert!(decoded.is_command());
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let line = styled_line();
        let mut buf = Vec::new();
        encode_line_body(&mut buf, &line);
        for cut in [1, buf.len() / 2, buf.len() - 1] {
            assert!(decode_line_body(&mut Reader::new(&buf[..cut]), 0, 0).is_err());
        }
    }

    #[test]
    fn absurd_cell_count_rejected_without_allocating() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(decode_line_body(&mut Reader::new(&buf), 0, 0).is_err());
    }

    #[test]
    fn cell_encoded_sizes() {
        // Default colors carry no payload; RGB carries three bytes each.
        let plain = Cell::blank();
        let mut buf = Vec::new();
        encode_cell(&mut buf, &plain);
        assert_eq!(buf.len(), 9);

        let mut style = Style::default();
        style.fg = Color::Rgb(0, 0, 0);
        style.bg = Color::Rgb(0, 0, 0);
        let heavy = Cell::new('x', style);
        buf.clear();
        encode_cell(&mut buf, &heavy);
        assert_eq!(buf.len(), 15);
    }
}
