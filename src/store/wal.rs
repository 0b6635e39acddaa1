//! Write-ahead log: a single append-only file of length-prefixed,
//! checksummed records.
//!
//! Record wire format: `u32 length, u8 kind, body, u32 crc32` where length
//! counts the kind byte plus the body and the checksum covers the same
//! range. Append/update bodies carry the global index, timestamp and line
//! flags, then a line body in the page encoding. A torn or corrupt record
//! stops replay at that point and the file is truncated back to the last
//! good record, so later appends never interleave with garbage.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::buffer::GlobalIdx;
use crate::line::LogicalLine;
use crate::store::codec::{self, Reader};
use crate::store::page_store::PageStore;

pub const RECORD_APPEND: u8 = 1;
pub const RECORD_UPDATE: u8 = 2;
pub const RECORD_METADATA: u8 = 3;
pub const RECORD_CHECKPOINT: u8 = 4;

/// Viewport state persisted alongside content so recovery restores what the
/// user was looking at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewportMeta {
    pub live_edge_base: GlobalIdx,
    pub cursor_x: i32,
    pub cursor_y: i32,
    pub scroll_offset: i64,
    pub saved_at_ns: i64,
}

/// A content record not yet applied to the page store.
#[derive(Debug, Clone)]
pub struct PendingLine {
    pub global_idx: GlobalIdx,
    pub line: LogicalLine,
}

/// What replay found.
#[derive(Debug)]
pub struct WalRecovery {
    pub metadata: Option<ViewportMeta>,
    pub next_global_idx: GlobalIdx,
}

pub struct Wal {
    path: PathBuf,
    writer: BufWriter<File>,
    offset: u64,
    next_global_idx: GlobalIdx,
    /// Records since the last checkpoint, in write order. Kept in memory so
    /// reads see un-checkpointed lines and checkpoint application needs no
    /// re-read of the file.
    pending: Vec<PendingLine>,
    /// Newest metadata ever logged; re-logged after truncation so recovery
    /// always finds the viewport state.
    last_metadata: Option<ViewportMeta>,
    /// Offset replay must start from to see everything since the last
    /// checkpoint. Always 0 after a truncating checkpoint.
    last_checkpoint_offset: u64,
    entries_since_checkpoint: usize,
}

impl Wal {
    /// Open the log, replaying valid records from `replay_from` (the offset
    /// stored by the last checkpoint descriptor).
    pub fn open<P: AsRef<Path>>(
        path: P,
        replay_from: u64,
        store_next_global: GlobalIdx,
    ) -> Result<(Self, WalRecovery)> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("opening WAL {}", path.display()))?;
        let file_len = file.metadata()?.len();
        let mut replay_from = replay_from;
        if replay_from > file_len {
            tracing::warn!(
                replay_from,
                file_len,
                "checkpoint offset beyond WAL end; assuming post-checkpoint crash"
            );
            replay_from = file_len;
        }

        let mut pending = Vec::new();
        let mut metadata = None;
        let mut next_global_idx = store_next_global;
        let mut good_end = replay_from;

        if replay_from < file_len {
            file.seek(SeekFrom::Start(replay_from))?;
            let mut tail = Vec::with_capacity((file_len - replay_from) as usize);
            file.read_to_end(&mut tail)?;
            let mut r = Reader::new(&tail);
            loop {
                let before = r.remaining();
                match Self::replay_one(&mut r) {
                    Ok(Some(record)) => {
                        good_end += (before - r.remaining()) as u64;
                        match record {
                            Replayed::Line { kind, entry } => {
                                if kind == RECORD_APPEND {
                                    next_global_idx = next_global_idx.max(entry.global_idx + 1);
                                }
                                pending.push(entry);
                            }
                            Replayed::Metadata(meta) => metadata = Some(meta),
                            Replayed::Checkpoint => pending.clear(),
                        }
                    }
                    Ok(None) => break, // clean end of log
                    Err(err) => {
                        tracing::warn!("WAL replay stopped: {err:#}");
                        break;
                    }
                }
            }
            if good_end < file_len {
                tracing::warn!(
                    discarded = file_len - good_end,
                    "truncating WAL past last valid record"
                );
                file.set_len(good_end)?;
            }
        }

        file.seek(SeekFrom::Start(good_end))?;
        let entries_since_checkpoint = pending.len();
        let wal = Wal {
            path,
            writer: BufWriter::new(file),
            offset: good_end,
            next_global_idx,
            pending,
            last_metadata: metadata,
            last_checkpoint_offset: replay_from,
            entries_since_checkpoint,
        };
        let recovery = WalRecovery {
            metadata,
            next_global_idx,
        };
        Ok((wal, recovery))
    }

    /// Parse one record. `Ok(None)` at a clean end; `Err` on torn or corrupt
    /// data.
    fn replay_one(r: &mut Reader) -> Result<Option<Replayed>> {
        if r.remaining() == 0 {
            return Ok(None);
        }
        let length = r.u32()? as usize;
        if length == 0 || r.remaining() < length + 4 {
            anyhow::bail!("torn record: {} bytes left, record wants {length}", r.remaining());
        }
        let payload = r.take(length)?;
        let expected = r.u32()?;
        let actual = crc32fast::hash(payload);
        if expected != actual {
            anyhow::bail!("record checksum mismatch");
        }
        let kind = payload[0];
        let mut body = Reader::new(&payload[1..]);
        match kind {
            RECORD_APPEND | RECORD_UPDATE => {
                let g = body.i64()?;
                let ts = body.i64()?;
                let flags = body.u32()?;
                let line = codec::decode_line_body(&mut body, ts, flags)?;
                anyhow::ensure!(g >= 0, "negative global index");
                Ok(Some(Replayed::Line {
                    kind,
                    entry: PendingLine {
                        global_idx: g as GlobalIdx,
                        line,
                    },
                }))
            }
            RECORD_METADATA => {
                let meta = ViewportMeta {
                    live_edge_base: body.i64()?.max(0) as GlobalIdx,
                    cursor_x: body.i32()?,
                    cursor_y: body.i32()?,
                    scroll_offset: body.i64()?,
                    saved_at_ns: body.i64()?,
                };
                Ok(Some(Replayed::Metadata(meta)))
            }
            RECORD_CHECKPOINT => Ok(Some(Replayed::Checkpoint)),
            other => anyhow::bail!("unknown record kind {other}"),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Where replay must start to cover everything since the last
    /// checkpoint.
    pub fn last_checkpoint_offset(&self) -> u64 {
        self.last_checkpoint_offset
    }

    pub fn next_global_idx(&self) -> GlobalIdx {
        self.next_global_idx
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// The newest un-checkpointed version of line `g`, if any.
    pub fn read_pending(&self, g: GlobalIdx) -> Option<&LogicalLine> {
        self.pending
            .iter()
            .rev()
            .find(|p| p.global_idx == g)
            .map(|p| &p.line)
    }

    /// Largest pending index whose timestamp is `<= t`.
    pub fn pending_find_at(&self, t: i64) -> Option<GlobalIdx> {
        self.pending
            .iter()
            .filter(|p| p.line.updated_at_ns() <= t)
            .map(|p| p.global_idx)
            .max()
    }

    /// Log one line. Whether this is an append or an update is decided by
    /// the line index: appends advance `next_global_idx`, updates do not.
    pub fn append(&mut self, g: GlobalIdx, line: &LogicalLine) -> Result<()> {
        let kind = if g >= self.next_global_idx {
            RECORD_APPEND
        } else {
            RECORD_UPDATE
        };
        let mut body = Vec::with_capacity(20 + codec::encoded_line_len(line));
        body.extend_from_slice(&(g as i64).to_le_bytes());
        body.extend_from_slice(&line.updated_at_ns().to_le_bytes());
        body.extend_from_slice(&codec::line_flags(line).to_le_bytes());
        codec::encode_line_body(&mut body, line);
        self.write_record(kind, &body)?;
        if kind == RECORD_APPEND {
            self.next_global_idx = g + 1;
        }
        self.pending.push(PendingLine {
            global_idx: g,
            line: line.clone(),
        });
        self.entries_since_checkpoint += 1;
        Ok(())
    }

    /// Log a metadata record. Interleaved with content so recovery returns
    /// the newest metadata whose content also reached the log.
    pub fn write_metadata(&mut self, meta: &ViewportMeta) -> Result<()> {
        self.last_metadata = Some(*meta);
        let mut body = Vec::with_capacity(32);
        body.extend_from_slice(&(meta.live_edge_base as i64).to_le_bytes());
        body.extend_from_slice(&meta.cursor_x.to_le_bytes());
        body.extend_from_slice(&meta.cursor_y.to_le_bytes());
        body.extend_from_slice(&meta.scroll_offset.to_le_bytes());
        body.extend_from_slice(&meta.saved_at_ns.to_le_bytes());
        self.write_record(RECORD_METADATA, &body)
    }

    fn write_record(&mut self, kind: u8, body: &[u8]) -> Result<()> {
        let mut record = Vec::with_capacity(9 + body.len());
        record.extend_from_slice(&((body.len() + 1) as u32).to_le_bytes());
        record.push(kind);
        record.extend_from_slice(body);
        let crc = crc32fast::hash(&record[4..]);
        record.extend_from_slice(&crc.to_le_bytes());
        self.writer
            .write_all(&record)
            .with_context(|| format!("appending to WAL {}", self.path.display()))?;
        self.offset += record.len() as u64;
        Ok(())
    }

    /// Flush buffered records and fsync.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer
            .get_ref()
            .sync_data()
            .with_context(|| format!("syncing WAL {}", self.path.display()))?;
        Ok(())
    }

    pub fn should_checkpoint(&self, threshold: usize) -> bool {
        self.entries_since_checkpoint >= threshold.max(1)
    }

    /// Apply pending records to the page store, flush it, then drop the
    /// applied prefix: a checkpoint marker is written as a barrier and the
    /// log is truncated to empty.
    pub fn checkpoint(&mut self, pages: &mut PageStore) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        for entry in &self.pending {
            let g = entry.global_idx;
            if g >= pages.next_global_idx() {
                // Preserve index density across any gap.
                while pages.next_global_idx() < g {
                    let filler = LogicalLine::new();
                    pages.append_line(pages.next_global_idx(), &filler)?;
                }
                pages.append_line(g, &entry.line)?;
            } else {
                pages.update_line(g, &entry.line)?;
            }
        }
        pages.flush()?;
        self.write_record(RECORD_CHECKPOINT, &[])?;
        self.sync()?;
        let file = self.writer.get_mut();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        self.offset = 0;
        self.last_checkpoint_offset = 0;
        let applied = std::mem::take(&mut self.pending);
        self.entries_since_checkpoint = 0;
        // The truncation dropped any metadata records; re-log the newest so
        // recovery still finds the viewport state.
        if let Some(meta) = self.last_metadata {
            self.write_metadata(&meta)?;
        }
        tracing::debug!(applied = applied.len(), "WAL checkpoint complete");
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.sync()
    }
}

#[derive(Debug)]
enum Replayed {
    Line { kind: u8, entry: PendingLine },
    Metadata(ViewportMeta),
    Checkpoint,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{Cell, Style};
    use crate::config::PageStoreConfig;
    use tempfile::TempDir;

    fn line_of(text: &str, ts: i64) -> LogicalLine {
        let mut line = LogicalLine::new();
        for (i, c) in text.chars().enumerate() {
            line.put_cell(i, Cell::new(c, Style::default()));
        }
        line.touch(ts);
        line
    }

    fn meta(base: GlobalIdx, scroll: i64) -> ViewportMeta {
        ViewportMeta {
            live_edge_base: base,
            cursor_x: 3,
            cursor_y: 4,
            scroll_offset: scroll,
            saved_at_ns: 12345,
        }
    }

    #[test]
    fn append_and_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        {
            let (mut wal, _) = Wal::open(&path, 0, 0).unwrap();
            for i in 0..5u64 {
                wal.append(i, &line_of(&format!("line {i}"), i as i64)).unwrap();
            }
            wal.write_metadata(&meta(2, 0)).unwrap();
            wal.sync().unwrap();
        }
        let (wal, recovery) = Wal::open(&path, 0, 0).unwrap();
        assert_eq!(recovery.next_global_idx, 5);
        assert_eq!(wal.pending_len(), 5);
        assert_eq!(wal.read_pending(3).unwrap().text(), "line 3");
        let m = recovery.metadata.unwrap();
        assert_eq!(m.live_edge_base, 2);
        assert_eq!((m.cursor_x, m.cursor_y), (3, 4));
    }

    #[test]
    fn update_does_not_advance_next_index() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        let (mut wal, _) = Wal::open(&path, 0, 0).unwrap();
        wal.append(0, &line_of("a", 1)).unwrap();
        wal.append(1, &line_of("b", 2)).unwrap();
        wal.append(0, &line_of("a2", 3)).unwrap(); // update
        assert_eq!(wal.next_global_idx(), 2);
        assert_eq!(wal.read_pending(0).unwrap().text(), "a2");
    }

    #[test]
    fn torn_tail_is_discarded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        {
            let (mut wal, _) = Wal::open(&path, 0, 0).unwrap();
            wal.append(0, &line_of("good", 1)).unwrap();
            wal.append(1, &line_of("torn", 2)).unwrap();
            wal.sync().unwrap();
        }
        // Chop the last few bytes to simulate a torn write.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();
        drop(file);

        let (wal, recovery) = Wal::open(&path, 0, 0).unwrap();
        assert_eq!(recovery.next_global_idx, 1);
        assert_eq!(wal.pending_len(), 1);
        assert!(wal.read_pending(1).is_none());
        // The torn bytes are gone from the file.
        let remaining = std::fs::metadata(&path).unwrap().len();
        assert!(remaining < len - 3);
    }

    #[test]
    fn corrupt_record_stops_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        {
            let (mut wal, _) = Wal::open(&path, 0, 0).unwrap();
            wal.append(0, &line_of("first", 1)).unwrap();
            wal.append(1, &line_of("second", 2)).unwrap();
            wal.append(2, &line_of("third", 3)).unwrap();
            wal.sync().unwrap();
        }
        // Flip a byte in the middle record's body.
        let mut bytes = std::fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let (_, recovery) = Wal::open(&path, 0, 0).unwrap();
        // Replay keeps everything before the first bad checksum.
        assert!(recovery.next_global_idx < 3);
    }

    #[test]
    fn checkpoint_applies_and_truncates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        let mut pages = PageStore::open(dir.path().join("pages"), &PageStoreConfig::default())
            .unwrap();
        let (mut wal, _) = Wal::open(&path, 0, 0).unwrap();
        for i in 0..10u64 {
            wal.append(i, &line_of(&format!("line {i}"), i as i64)).unwrap();
        }
        wal.append(4, &line_of("updated", 99)).unwrap();
        wal.checkpoint(&mut pages).unwrap();
        assert_eq!(wal.pending_len(), 0);
        assert_eq!(wal.offset(), 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
        assert_eq!(pages.next_global_idx(), 10);
        assert_eq!(pages.read_line(4).unwrap().unwrap().text(), "updated");
        assert_eq!(pages.read_line(9).unwrap().unwrap().text(), "line 9");
        // next_global_idx survives even though the log is empty.
        assert_eq!(wal.next_global_idx(), 10);
    }

    #[test]
    fn metadata_after_content_wins() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        {
            let (mut wal, _) = Wal::open(&path, 0, 0).unwrap();
            wal.write_metadata(&meta(0, 0)).unwrap();
            wal.append(0, &line_of("x", 1)).unwrap();
            wal.write_metadata(&meta(5, 100)).unwrap();
            wal.sync().unwrap();
        }
        let (_, recovery) = Wal::open(&path, 0, 0).unwrap();
        let m = recovery.metadata.unwrap();
        assert_eq!(m.live_edge_base, 5);
        assert_eq!(m.scroll_offset, 100);
    }
}
