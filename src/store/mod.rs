//! Two-tier disk persistence: an append-only WAL in front of immutable
//! ~64 KiB pages, coordinated under one lock.
//!
//! On-disk layout per terminal: `<persist_dir>/terminals/<terminal_id>/`
//! containing `pages/NNNNNN.page`, `wal.log` and a small JSON `checkpoint`
//! descriptor holding the last page id and the WAL offset of the most
//! recent successful checkpoint.

pub mod codec;
pub mod page;
pub mod page_store;
pub mod wal;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::buffer::GlobalIdx;
use crate::config::{PageStoreConfig, PersistConfig};
use crate::line::LogicalLine;
use page_store::PageStore;
use wal::{ViewportMeta, Wal};

/// Contents of the `checkpoint` file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct CheckpointDescriptor {
    pub last_page_id: u64,
    pub wal_offset: u64,
}

/// State handed back to the terminal after recovery.
#[derive(Debug)]
pub struct RecoveredState {
    pub metadata: Option<ViewportMeta>,
    pub next_global_idx: GlobalIdx,
}

/// WAL + page store for one terminal id.
pub struct DiskStore {
    root: PathBuf,
    pages: PageStore,
    wal: Wal,
    checkpoint_threshold: usize,
}

impl DiskStore {
    /// Open (creating if needed) the store for `terminal_id` and replay the
    /// WAL from the last checkpoint.
    pub fn open(
        persist_dir: &Path,
        terminal_id: &str,
        pages_cfg: &PageStoreConfig,
        persist_cfg: &PersistConfig,
    ) -> Result<(Self, RecoveredState)> {
        let root = persist_dir.join("terminals").join(terminal_id);
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating terminal directory {}", root.display()))?;

        let pages = PageStore::open(root.join("pages"), pages_cfg)?;
        let descriptor = Self::read_descriptor(&root.join("checkpoint"));
        let (wal, recovery) = Wal::open(
            root.join("wal.log"),
            descriptor.wal_offset,
            pages.next_global_idx(),
        )?;
        tracing::info!(
            terminal_id,
            next_global_idx = recovery.next_global_idx,
            pending = wal.pending_len(),
            "disk store opened"
        );
        Ok((
            DiskStore {
                root,
                pages,
                wal,
                checkpoint_threshold: persist_cfg.checkpoint_threshold,
            },
            RecoveredState {
                metadata: recovery.metadata,
                next_global_idx: recovery.next_global_idx,
            },
        ))
    }

    fn read_descriptor(path: &Path) -> CheckpointDescriptor {
        match std::fs::read_to_string(path) {
            Ok(data) => serde_json::from_str(&data).unwrap_or_else(|err| {
                tracing::warn!("unreadable checkpoint descriptor, replaying full WAL: {err}");
                CheckpointDescriptor::default()
            }),
            Err(_) => CheckpointDescriptor::default(),
        }
    }

    fn write_descriptor(&self) -> Result<()> {
        let descriptor = CheckpointDescriptor {
            last_page_id: self.pages.last_page_id(),
            wal_offset: self.wal.last_checkpoint_offset(),
        };
        let path = self.root.join("checkpoint");
        let tmp = self.root.join("checkpoint.tmp");
        let data = serde_json::to_string(&descriptor)?;
        std::fs::write(&tmp, data)
            .with_context(|| format!("writing checkpoint descriptor {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("committing checkpoint descriptor {}", path.display()))?;
        Ok(())
    }

    pub fn next_global_idx(&self) -> GlobalIdx {
        self.wal.next_global_idx()
    }

    /// Log one line (append or in-place update decided by index).
    pub fn write_line(&mut self, g: GlobalIdx, line: &LogicalLine) -> Result<()> {
        self.wal.append(g, line)
    }

    pub fn write_metadata(&mut self, meta: &ViewportMeta) -> Result<()> {
        self.wal.write_metadata(meta)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.wal.sync()
    }

    /// Read one line, preferring un-checkpointed WAL content over pages.
    pub fn read_line(&mut self, g: GlobalIdx) -> Result<Option<LogicalLine>> {
        if let Some(line) = self.wal.read_pending(g) {
            return Ok(Some(line.clone()));
        }
        self.pages.read_line(g)
    }

    /// Read `[a, b)`, overlaying pending WAL content and silently skipping
    /// corrupt page ranges.
    pub fn read_range(&mut self, a: GlobalIdx, b: GlobalIdx) -> Vec<(GlobalIdx, LogicalLine)> {
        let mut out = self.pages.read_range(a, b);
        for g in a..b.min(self.wal.next_global_idx()) {
            if let Some(line) = self.wal.read_pending(g) {
                match out.binary_search_by_key(&g, |(gg, _)| *gg) {
                    Ok(i) => out[i].1 = line.clone(),
                    Err(i) => out.insert(i, (g, line.clone())),
                }
            }
        }
        out
    }

    /// Largest index whose timestamp is `<= t`, or 0 when `t` precedes the
    /// store.
    pub fn find_line_at(&mut self, t: i64) -> GlobalIdx {
        let from_pages = self.pages.find_line_at(t);
        let from_pending = self.wal.pending_find_at(t).unwrap_or(0);
        from_pages.max(from_pending)
    }

    /// The newest non-blank line strictly below `g`, used to trim blank tail
    /// lines after recovery. Scans at most `limit` lines down.
    pub fn last_non_blank_before(&mut self, g: GlobalIdx, limit: u64) -> Option<GlobalIdx> {
        let floor = g.saturating_sub(limit);
        let mut cursor = g;
        while cursor > floor {
            cursor -= 1;
            match self.read_line(cursor) {
                Ok(Some(line)) if !line.is_blank() => return Some(cursor),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!("blank-tail scan stopped at {cursor}: {err:#}");
                    return Some(cursor);
                }
            }
        }
        None
    }

    /// Checkpoint when the WAL has accumulated enough entries.
    pub fn maybe_checkpoint(&mut self) -> Result<()> {
        if self.wal.should_checkpoint(self.checkpoint_threshold) {
            self.checkpoint()?;
        }
        Ok(())
    }

    /// Group pending WAL entries into pages, flush them, truncate the WAL
    /// and commit the descriptor.
    pub fn checkpoint(&mut self) -> Result<()> {
        self.wal.checkpoint(&mut self.pages)?;
        self.write_descriptor()
    }

    /// Flush everything and close. Attempts every step and returns the
    /// first error.
    pub fn close(&mut self) -> Result<()> {
        let mut first_err = None;
        for result in [self.checkpoint(), self.pages.close(), self.wal.close()] {
            if let Err(err) = result {
                tracing::error!("error closing disk store: {err:#}");
                first_err.get_or_insert(err);
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
    use tempfile::TempDir;

    fn open(dir: &Path) -> (DiskStore, RecoveredState) {
        DiskStore::open(
            dir,
            "term-1",
            &PageStoreConfig {
                target_page_size: 1024,
                page_cache: 4,
            },
            &PersistConfig::default(),
        )
        .unwrap()
    }

    fn line_of(text: &str, ts: i64) -> LogicalLine {
        let mut line = LogicalLine::new();
        for (i, c) in text.chars().enumerate() {
            line.put_cell(i, Cell::new(c, Style::default()));
        }
        line.touch(ts);
        line
    }

    #[test]
    fn lines_survive_close_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let (mut store, _) = open(dir.path());
            for i in 0..50u64 {
                store
                    .write_line(i, &line_of(&format!("row {i}"), i as i64))
                    .unwrap();
            }
            store
                .write_metadata(&ViewportMeta {
                    live_edge_base: 40,
                    cursor_x: 1,
                    cursor_y: 2,
                    scroll_offset: 7,
                    saved_at_ns: 1,
                })
                .unwrap();
            store.close().unwrap();
        }
        let (mut store, recovered) = open(dir.path());
        assert_eq!(recovered.next_global_idx, 50);
        for i in 0..50u64 {
            assert_eq!(
                store.read_line(i).unwrap().unwrap().text(),
                format!("row {i}")
            );
        }
        assert!(store.read_line(50).unwrap().is_none());
        // Metadata survives the checkpoint truncation performed by close.
        let meta = recovered.metadata.unwrap();
        assert_eq!(meta.live_edge_base, 40);
        assert_eq!(meta.scroll_offset, 7);
    }

    #[test]
    fn unclosed_store_recovers_from_wal() {
        let dir = TempDir::new().unwrap();
        {
            let (mut store, _) = open(dir.path());
            for i in 0..5u64 {
                store
                    .write_line(i, &line_of(&format!("wal {i}"), i as i64))
                    .unwrap();
            }
            store
                .write_metadata(&ViewportMeta {
                    live_edge_base: 4,
                    cursor_x: 0,
                    cursor_y: 0,
                    scroll_offset: 0,
                    saved_at_ns: 9,
                })
                .unwrap();
            store.sync().unwrap();
            // Dropped without close: no checkpoint ran.
        }
        let (mut store, recovered) = open(dir.path());
        assert_eq!(recovered.next_global_idx, 5);
        let meta = recovered.metadata.unwrap();
        assert_eq!(meta.live_edge_base, 4);
        assert_eq!(store.read_line(2).unwrap().unwrap().text(), "wal 2");
    }

    #[test]
    fn pending_overlay_wins_in_range_reads() {
        let dir = TempDir::new().unwrap();
        let (mut store, _) = open(dir.path());
        for i in 0..10u64 {
            store
                .write_line(i, &line_of(&format!("v1 {i}"), i as i64))
                .unwrap();
        }
        store.checkpoint().unwrap();
        store.write_line(3, &line_of("v2 3", 100)).unwrap();
        let range = store.read_range(0, 10);
        assert_eq!(range.len(), 10);
        assert_eq!(range[3].1.text(), "v2 3");
        assert_eq!(range[4].1.text(), "v1 4");
    }

    #[test]
    fn last_non_blank_scan() {
        let dir = TempDir::new().unwrap();
        let (mut store, _) = open(dir.path());
        store.write_line(0, &line_of("content", 1)).unwrap();
        store.write_line(1, &LogicalLine::new()).unwrap();
        store.write_line(2, &LogicalLine::new()).unwrap();
        assert_eq!(store.last_non_blank_before(3, 100), Some(0));
        assert_eq!(store.last_non_blank_before(3, 1), None);
    }

    #[test]
    fn terminals_are_isolated_by_id() {
        let dir = TempDir::new().unwrap();
        let (mut a, _) = DiskStore::open(
            dir.path(),
            "term-a",
            &PageStoreConfig::default(),
            &PersistConfig::default(),
        )
        .unwrap();
        a.write_line(0, &line_of("only in a", 1)).unwrap();
        a.close().unwrap();

        let (mut b, recovered) = DiskStore::open(
            dir.path(),
            "term-b",
            &PageStoreConfig::default(),
            &PersistConfig::default(),
        )
        .unwrap();
        assert_eq!(recovered.next_global_idx, 0);
        assert!(b.read_line(0).unwrap().is_none());
    }
}
