//! The on-disk page: a ~64 KiB immutable unit of bulk line storage.
//!
//! Layout: a fixed 64-byte header, a dense line index (20 bytes per line:
//! offset, length, flags, timestamp), then the packed line bodies. The
//! header checksum covers the pre-state header fields and everything after
//! the header, so torn page files are detected on read.

use anyhow::{bail, Context, Result};

use crate::buffer::GlobalIdx;
use crate::line::LogicalLine;
use crate::store::codec::{self, Reader};

pub const PAGE_MAGIC: [u8; 4] = *b"PAGE";
pub const PAGE_VERSION: u16 = 1;
pub const PAGE_HEADER_LEN: usize = 64;
pub const INDEX_ENTRY_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Live,
    Sealed,
    Compacted,
}

impl PageState {
    fn to_u8(self) -> u8 {
        match self {
            PageState::Live => 0,
            PageState::Sealed => 1,
            PageState::Compacted => 2,
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(PageState::Live),
            1 => Ok(PageState::Sealed),
            2 => Ok(PageState::Compacted),
            other => bail!("corrupt page: unknown state {other}"),
        }
    }
}

/// One line-index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: u32,
    pub length: u32,
    pub flags: u32,
    pub timestamp_ns: i64,
}

/// An in-memory page. Sealed pages are decoded from disk on demand; the one
/// live page accumulates appends until it would exceed the target size.
#[derive(Debug, Clone)]
pub struct Page {
    id: u64,
    first_global_idx: GlobalIdx,
    state: PageState,
    entries: Vec<IndexEntry>,
    body: Vec<u8>,
}

impl Page {
    pub fn new(id: u64, first_global_idx: GlobalIdx) -> Self {
        Page {
            id,
            first_global_idx,
            state: PageState::Live,
            entries: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn first_global_idx(&self) -> GlobalIdx {
        self.first_global_idx
    }

    pub fn state(&self) -> PageState {
        self.state
    }

    pub fn seal(&mut self) {
        self.state = PageState::Sealed;
    }

    pub fn line_count(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One past the last line stored here.
    pub fn next_global_idx(&self) -> GlobalIdx {
        self.first_global_idx + self.entries.len() as GlobalIdx
    }

    pub fn contains(&self, g: GlobalIdx) -> bool {
        g >= self.first_global_idx && g < self.next_global_idx()
    }

    pub fn first_timestamp_ns(&self) -> i64 {
        self.entries.first().map(|e| e.timestamp_ns).unwrap_or(0)
    }

    pub fn last_timestamp_ns(&self) -> i64 {
        self.entries.last().map(|e| e.timestamp_ns).unwrap_or(0)
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Total file size if encoded now.
    pub fn encoded_len(&self) -> usize {
        PAGE_HEADER_LEN + self.entries.len() * INDEX_ENTRY_LEN + self.body.len()
    }

    /// Would appending a line of `line_len` body bytes push the page past
    /// `target`? An empty page accepts any line (the single-line rule).
    pub fn would_exceed(&self, line_len: usize, target: usize) -> bool {
        !self.is_empty() && self.encoded_len() + INDEX_ENTRY_LEN + line_len > target
    }

    pub fn append_line(&mut self, line: &LogicalLine) {
        let offset = self.body.len() as u32;
        codec::encode_line_body(&mut self.body, line);
        self.entries.push(IndexEntry {
            offset,
            length: self.body.len() as u32 - offset,
            flags: codec::line_flags(line),
            timestamp_ns: line.updated_at_ns(),
        });
    }

    pub fn read_line(&self, g: GlobalIdx) -> Result<LogicalLine> {
        if !self.contains(g) {
            bail!("line {g} not in page {}", self.id);
        }
        let entry = self.entries[(g - self.first_global_idx) as usize];
        let start = entry.offset as usize;
        let end = start + entry.length as usize;
        if end > self.body.len() {
            bail!("corrupt page {}: index entry past body", self.id);
        }
        codec::decode_line_body(
            &mut Reader::new(&self.body[start..end]),
            entry.timestamp_ns,
            entry.flags,
        )
        .with_context(|| format!("decoding line {g} in page {}", self.id))
    }

    /// Rewrite a stored line in place. Same-length bodies are spliced;
    /// otherwise the body is rebuilt and later entries shift.
    pub fn update_line(&mut self, g: GlobalIdx, line: &LogicalLine) -> Result<()> {
        if !self.contains(g) {
            bail!("line {g} not in page {}", self.id);
        }
        let slot = (g - self.first_global_idx) as usize;
        let mut encoded = Vec::new();
        codec::encode_line_body(&mut encoded, line);
        let entry = self.entries[slot];
        let start = entry.offset as usize;
        let end = start + entry.length as usize;
        if encoded.len() == entry.length as usize {
            self.body[start..end].copy_from_slice(&encoded);
        } else {
            let delta = encoded.len() as i64 - entry.length as i64;
            self.body.splice(start..end, encoded.iter().copied());
            for later in &mut self.entries[slot + 1..] {
                later.offset = (later.offset as i64 + delta) as u32;
            }
            self.entries[slot].length = encoded.len() as u32;
        }
        self.entries[slot].flags = codec::line_flags(line);
        self.entries[slot].timestamp_ns = line.updated_at_ns();
        Ok(())
    }

    /// Largest index whose timestamp is `<= t`, if any line qualifies.
    pub fn find_line_at(&self, t: i64) -> Option<GlobalIdx> {
        let idx = self.entries.partition_point(|e| e.timestamp_ns <= t);
        if idx == 0 {
            None
        } else {
            Some(self.first_global_idx + idx as GlobalIdx - 1)
        }
    }

    /// Serialise to the on-disk format.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&PAGE_MAGIC);
        out.extend_from_slice(&PAGE_VERSION.to_le_bytes());
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&(self.first_global_idx as i64).to_le_bytes());
        out.extend_from_slice(&self.first_timestamp_ns().to_le_bytes());
        out.extend_from_slice(&self.last_timestamp_ns().to_le_bytes());
        out.extend_from_slice(&self.line_count().to_le_bytes());
        out.push(self.state.to_u8());
        debug_assert_eq!(out.len(), 43);
        out.extend_from_slice(&[0u8; 4]); // crc placeholder
        out.resize(PAGE_HEADER_LEN, 0);
        for entry in &self.entries {
            out.extend_from_slice(&entry.offset.to_le_bytes());
            out.extend_from_slice(&entry.length.to_le_bytes());
            out.extend_from_slice(&entry.flags.to_le_bytes());
            out.extend_from_slice(&entry.timestamp_ns.to_le_bytes());
        }
        out.extend_from_slice(&self.body);
        let crc = page_crc(&out);
        out[43..47].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// Decode and checksum-verify an on-disk page.
    pub fn decode(bytes: &[u8]) -> Result<Page> {
        let header = Self::decode_header(bytes)?;
        let expected = u32::from_le_bytes(bytes[43..47].try_into().unwrap());
        let actual = page_crc(bytes);
        if expected != actual {
            bail!(
                "corrupt page {}: checksum mismatch ({expected:#x} != {actual:#x})",
                header.id
            );
        }
        let mut page = header;
        let count = u32::from_le_bytes(bytes[38..42].try_into().unwrap()) as usize;
        let index_end = PAGE_HEADER_LEN + count * INDEX_ENTRY_LEN;
        if bytes.len() < index_end {
            bail!("corrupt page {}: truncated index", page.id);
        }
        let mut r = Reader::new(&bytes[PAGE_HEADER_LEN..index_end]);
        for _ in 0..count {
            page.entries.push(IndexEntry {
                offset: r.u32()?,
                length: r.u32()?,
                flags: r.u32()?,
                timestamp_ns: r.i64()?,
            });
        }
        page.body = bytes[index_end..].to_vec();
        Ok(page)
    }

    /// Parse the fixed header only; no checksum verification. Used to build
    /// the page directory without loading bodies.
    pub fn decode_header(bytes: &[u8]) -> Result<Page> {
        if bytes.len() < PAGE_HEADER_LEN {
            bail!("corrupt page: shorter than the header");
        }
        if bytes[0..4] != PAGE_MAGIC {
            bail!("corrupt page: bad magic");
        }
        let version = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
        if version != PAGE_VERSION {
            bail!("unsupported page version {version}");
        }
        let id = u64::from_le_bytes(bytes[6..14].try_into().unwrap());
        let first_global_idx = i64::from_le_bytes(bytes[14..22].try_into().unwrap());
        if first_global_idx < 0 {
            bail!("corrupt page {id}: negative first index");
        }
        let line_count = u32::from_le_bytes(bytes[38..42].try_into().unwrap());
        let state = PageState::from_u8(bytes[42])?;
        Ok(Page {
            id,
            first_global_idx: first_global_idx as GlobalIdx,
            state,
            entries: Vec::with_capacity(line_count as usize),
            body: Vec::new(),
        })
    }

    /// Header timestamps, readable without the body (directory scan).
    pub fn decode_header_timestamps(bytes: &[u8]) -> Result<(i64, i64)> {
        if bytes.len() < PAGE_HEADER_LEN {
            bail!("corrupt page: shorter than the header");
        }
        let first = i64::from_le_bytes(bytes[22..30].try_into().unwrap());
        let last = i64::from_le_bytes(bytes[30..38].try_into().unwrap());
        Ok((first, last))
    }
}

/// CRC32 over the pre-state header fields and everything after the header
/// (index and body). The state byte itself is not covered.
fn page_crc(encoded: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&encoded[0..42]);
    if encoded.len() > PAGE_HEADER_LEN {
        hasher.update(&encoded[PAGE_HEADER_LEN..]);
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{Cell, Style};

    fn line_of(text: &str, ts: i64) -> LogicalLine {
        let mut line = LogicalLine::new();
        for (i, c) in text.chars().enumerate() {
            line.put_cell(i, Cell::new(c, Style::default()));
        }
        line.touch(ts);
        line
    }

    #[test]
    fn append_and_read_back() {
        let mut page = Page::new(0, 100);
        page.append_line(&line_of("first", 10));
        page.append_line(&line_of("second", 20));
        assert_eq!(page.line_count(), 2);
        assert!(page.contains(100));
        assert!(page.contains(101));
        assert!(!page.contains(102));
        assert_eq!(page.read_line(100).unwrap().text(), "first");
        assert_eq!(page.read_line(101).unwrap().text(), "second");
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut page = Page::new(7, 42);
        for i in 0..10 {
            page.append_line(&line_of(&format!("line {i}"), i as i64 * 100));
        }
        page.seal();
        let bytes = page.encode();
        let decoded = Page::decode(&bytes).unwrap();
        assert_eq!(decoded.id(), 7);
        assert_eq!(decoded.first_global_idx(), 42);
        assert_eq!(decoded.state(), PageState::Sealed);
        assert_eq!(decoded.line_count(), 10);
        for i in 0..10u64 {
            assert_eq!(
                decoded.read_line(42 + i).unwrap().text(),
                format!("line {i}")
            );
        }
    }

    #[test]
    fn corruption_is_detected() {
        let mut page = Page::new(0, 0);
        page.append_line(&line_of("data", 1));
        let mut bytes = page.encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(Page::decode(&bytes).is_err());
    }

    #[test]
    fn update_same_length_in_place() {
        let mut page = Page::new(0, 0);
        page.append_line(&line_of("aaaa", 1));
        page.append_line(&line_of("bbbb", 2));
        let before = page.encoded_len();
        page.update_line(0, &line_of("cccc", 3)).unwrap();
        assert_eq!(page.encoded_len(), before);
        assert_eq!(page.read_line(0).unwrap().text(), "cccc");
        assert_eq!(page.read_line(1).unwrap().text(), "bbbb");
    }

    #[test]
    fn update_different_length_shifts_later_entries() {
        let mut page = Page::new(0, 0);
        page.append_line(&line_of("short", 1));
        page.append_line(&line_of("tail", 2));
        page.update_line(0, &line_of("much longer line", 3)).unwrap();
        assert_eq!(page.read_line(0).unwrap().text(), "much longer line");
        assert_eq!(page.read_line(1).unwrap().text(), "tail");
        // And it still round-trips through the wire format.
        let decoded = Page::decode(&page.encode()).unwrap();
        assert_eq!(decoded.read_line(1).unwrap().text(), "tail");
    }

    #[test]
    fn would_exceed_single_line_rule() {
        let page = Page::new(0, 0);
        // An oversized line on an empty page is always accepted.
        assert!(!page.would_exceed(1 << 20, 64 * 1024));
        let mut page = page;
        page.append_line(&line_of("x", 1));
        assert!(page.would_exceed(1 << 20, 64 * 1024));
    }

    #[test]
    fn find_line_at_timestamps() {
        let mut page = Page::new(0, 10);
        page.append_line(&line_of("a", 100));
        page.append_line(&line_of("b", 200));
        page.append_line(&line_of("c", 300));
        assert_eq!(page.find_line_at(50), None);
        assert_eq!(page.find_line_at(100), Some(10));
        assert_eq!(page.find_line_at(250), Some(11));
        assert_eq!(page.find_line_at(999), Some(12));
    }
}
