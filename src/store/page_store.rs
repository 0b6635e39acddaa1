//! The page store: a directory of numbered page files plus one live page.
//!
//! Sealed pages are immutable; updates to them rewrite the whole page file
//! atomically (write-temp-then-rename). Appends only ever target the live
//! page, and only the WAL checkpoint calls into the append path, so page
//! files change exactly when a checkpoint says so.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use lru::LruCache;

use crate::buffer::GlobalIdx;
use crate::config::PageStoreConfig;
use crate::line::LogicalLine;
use crate::store::codec;
use crate::store::page::{Page, PageState, PAGE_HEADER_LEN};

/// Directory entry for a sealed page, kept in memory for binary search.
#[derive(Debug, Clone)]
struct PageMeta {
    id: u64,
    first_global_idx: GlobalIdx,
    line_count: u32,
    first_timestamp_ns: i64,
    last_timestamp_ns: i64,
}

impl PageMeta {
    fn next_global_idx(&self) -> GlobalIdx {
        self.first_global_idx + self.line_count as GlobalIdx
    }

    fn contains(&self, g: GlobalIdx) -> bool {
        g >= self.first_global_idx && g < self.next_global_idx()
    }
}

pub struct PageStore {
    dir: PathBuf,
    target_page_size: usize,
    /// Sealed pages, sorted by `first_global_idx`.
    sealed: Vec<PageMeta>,
    current: Page,
    current_dirty: bool,
    cache: LruCache<u64, Page>,
}

impl PageStore {
    /// Open (or create) the page directory and rebuild the in-memory page
    /// directory from file headers.
    pub fn open<P: AsRef<Path>>(dir: P, cfg: &PageStoreConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating page directory {}", dir.display()))?;

        let mut sealed = Vec::new();
        let mut live: Option<Page> = None;
        let mut max_id = None::<u64>;
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("scanning page directory {}", dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("page") {
                continue;
            }
            let bytes = std::fs::read(&path)
                .with_context(|| format!("reading page file {}", path.display()))?;
            let header = match Page::decode_header(&bytes) {
                Ok(h) => h,
                Err(err) => {
                    tracing::warn!("skipping unreadable page {}: {err:#}", path.display());
                    continue;
                }
            };
            max_id = Some(max_id.map_or(header.id(), |m: u64| m.max(header.id())));
            match header.state() {
                PageState::Live => match Page::decode(&bytes) {
                    Ok(page) => live = Some(page),
                    Err(err) => {
                        tracing::warn!(
                            "live page {} is corrupt, dropping it: {err:#}",
                            path.display()
                        );
                    }
                },
                PageState::Sealed | PageState::Compacted => {
                    let (first_ts, last_ts) = Page::decode_header_timestamps(&bytes)?;
                    sealed.push(PageMeta {
                        id: header.id(),
                        first_global_idx: header.first_global_idx(),
                        line_count: header.line_count(),
                        first_timestamp_ns: first_ts,
                        last_timestamp_ns: last_ts,
                    });
                }
            }
        }
        sealed.sort_by_key(|m| m.first_global_idx);

        let current = match live {
            Some(page) => page,
            None => {
                let next_id = max_id.map_or(0, |m| m + 1);
                let next_global = sealed.last().map_or(0, PageMeta::next_global_idx);
                Page::new(next_id, next_global)
            }
        };
        tracing::debug!(
            sealed = sealed.len(),
            current_id = current.id(),
            next_global = current.next_global_idx(),
            "page store opened"
        );
        Ok(PageStore {
            dir,
            target_page_size: cfg.target_page_size.max(PAGE_HEADER_LEN * 2),
            sealed,
            current,
            current_dirty: false,
            cache: LruCache::new(NonZeroUsize::new(cfg.page_cache.max(1)).unwrap()),
        })
    }

    fn page_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{id:06}.page"))
    }

    /// One past the newest line in the store.
    pub fn next_global_idx(&self) -> GlobalIdx {
        self.current.next_global_idx()
    }

    pub fn first_global_idx(&self) -> GlobalIdx {
        self.sealed
            .first()
            .map_or(self.current.first_global_idx(), |m| m.first_global_idx)
    }

    pub fn last_page_id(&self) -> u64 {
        self.current.id()
    }

    pub fn sealed_page_count(&self) -> usize {
        self.sealed.len()
    }

    /// Append the next line. Lines must arrive densely; a non-dense index is
    /// a caller bug.
    pub fn append_line(&mut self, g: GlobalIdx, line: &LogicalLine) -> Result<()> {
        if g != self.next_global_idx() {
            bail!(
                "non-dense append: line {g}, store expects {}",
                self.next_global_idx()
            );
        }
        let encoded = codec::encoded_line_len(line);
        if self.current.would_exceed(encoded, self.target_page_size) {
            self.seal_current()?;
        }
        self.current.append_line(line);
        self.current_dirty = true;
        Ok(())
    }

    /// Seal the live page, write it out, and start a new one.
    fn seal_current(&mut self) -> Result<()> {
        self.current.seal();
        self.write_page_file(&self.current)?;
        let meta = PageMeta {
            id: self.current.id(),
            first_global_idx: self.current.first_global_idx(),
            line_count: self.current.line_count(),
            first_timestamp_ns: self.current.first_timestamp_ns(),
            last_timestamp_ns: self.current.last_timestamp_ns(),
        };
        tracing::debug!(
            page = meta.id,
            lines = meta.line_count,
            "sealed page"
        );
        let next = Page::new(self.current.id() + 1, self.current.next_global_idx());
        let old = std::mem::replace(&mut self.current, next);
        self.cache.put(meta.id, old);
        self.sealed.push(meta);
        self.current_dirty = true;
        Ok(())
    }

    /// Serialise the live page to disk. Sealed pages were written when they
    /// sealed.
    pub fn flush(&mut self) -> Result<()> {
        if !self.current_dirty || self.current.is_empty() {
            return Ok(());
        }
        self.write_page_file(&self.current)?;
        self.current_dirty = false;
        Ok(())
    }

    fn write_page_file(&self, page: &Page) -> Result<()> {
        let path = self.page_path(page.id());
        let tmp = path.with_extension("page.tmp");
        let bytes = page.encode();
        std::fs::write(&tmp, &bytes)
            .with_context(|| format!("writing page file {}", tmp.display()))?;
        let file = std::fs::File::open(&tmp)?;
        file.sync_all()
            .with_context(|| format!("syncing page file {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("committing page file {}", path.display()))?;
        Ok(())
    }

    fn sealed_meta_for(&self, g: GlobalIdx) -> Option<&PageMeta> {
        let idx = self.sealed.partition_point(|m| m.first_global_idx <= g);
        let meta = self.sealed.get(idx.checked_sub(1)?)?;
        meta.contains(g).then_some(meta)
    }

    fn load_sealed(&mut self, id: u64) -> Result<&Page> {
        if !self.cache.contains(&id) {
            let path = self.page_path(id);
            let bytes = std::fs::read(&path)
                .with_context(|| format!("reading page file {}", path.display()))?;
            let page = Page::decode(&bytes)
                .with_context(|| format!("decoding page file {}", path.display()))?;
            self.cache.put(id, page);
        }
        Ok(self.cache.get(&id).unwrap())
    }

    /// Read one line. `Ok(None)` when the index is out of range; `Err` on a
    /// corrupt page.
    pub fn read_line(&mut self, g: GlobalIdx) -> Result<Option<LogicalLine>> {
        if self.current.contains(g) {
            return Ok(Some(self.current.read_line(g)?));
        }
        let Some(meta) = self.sealed_meta_for(g) else {
            return Ok(None);
        };
        let id = meta.id;
        let page = self.load_sealed(id)?;
        Ok(Some(page.read_line(g)?))
    }

    /// Read lines in `[a, b)`. Indices inside a corrupt page are silently
    /// skipped (with a warning in the log).
    pub fn read_range(&mut self, a: GlobalIdx, b: GlobalIdx) -> Vec<(GlobalIdx, LogicalLine)> {
        let mut out = Vec::new();
        let mut g = a;
        let end = b.min(self.next_global_idx());
        while g < end {
            if self.current.contains(g) {
                for gg in g..end {
                    match self.current.read_line(gg) {
                        Ok(line) => out.push((gg, line)),
                        Err(err) => tracing::warn!("skipping line {gg}: {err:#}"),
                    }
                }
                break;
            }
            let Some(meta) = self.sealed_meta_for(g) else {
                g += 1;
                continue;
            };
            let (id, page_end) = (meta.id, meta.next_global_idx());
            let chunk_end = end.min(page_end);
            match self.load_sealed(id) {
                Ok(page) => {
                    for gg in g..chunk_end {
                        match page.read_line(gg) {
                            Ok(line) => out.push((gg, line)),
                            Err(err) => tracing::warn!("skipping line {gg}: {err:#}"),
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!("skipping page {id}: {err:#}");
                }
            }
            g = chunk_end;
        }
        out
    }

    /// Rewrite a stored line. Lines in the live page mutate in memory; lines
    /// in a sealed page force an atomic rewrite of that page file.
    pub fn update_line(&mut self, g: GlobalIdx, line: &LogicalLine) -> Result<()> {
        if self.current.contains(g) {
            self.current.update_line(g, line)?;
            self.current_dirty = true;
            return Ok(());
        }
        let Some(meta) = self.sealed_meta_for(g) else {
            bail!("update of unknown line {g}");
        };
        let id = meta.id;
        self.load_sealed(id)?;
        let mut page = self.cache.pop(&id).unwrap();
        page.update_line(g, line)?;
        self.write_page_file(&page)?;
        if let Some(meta) = self.sealed.iter_mut().find(|m| m.id == id) {
            meta.first_timestamp_ns = page.first_timestamp_ns();
            meta.last_timestamp_ns = page.last_timestamp_ns();
        }
        self.cache.put(id, page);
        Ok(())
    }

    /// Largest index whose timestamp is `<= t`, or 0 when `t` precedes the
    /// store. Two-level binary search: page by header timestamps, then the
    /// line index inside the page.
    pub fn find_line_at(&mut self, t: i64) -> GlobalIdx {
        // Candidate pages whose first timestamp is <= t; the newest such page
        // holds the answer unless it is entirely newer than t.
        let idx = self
            .sealed
            .partition_point(|m| m.first_timestamp_ns <= t);
        let mut candidates: Vec<u64> = Vec::new();
        if !self.current.is_empty() && self.current.first_timestamp_ns() <= t {
            candidates.push(self.current.id());
        }
        if let Some(meta) = self.sealed.get(idx.wrapping_sub(1)) {
            candidates.push(meta.id);
        }
        for id in candidates {
            if id == self.current.id() {
                if let Some(g) = self.current.find_line_at(t) {
                    return g;
                }
                continue;
            }
            match self.load_sealed(id) {
                Ok(page) => {
                    if let Some(g) = page.find_line_at(t) {
                        return g;
                    }
                }
                Err(err) => tracing::warn!("skipping page {id} in timestamp search: {err:#}"),
            }
        }
        0
    }

    pub fn close(&mut self) -> Result<()> {
        self.flush()
    }
}
