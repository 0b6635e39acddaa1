//! Shared fixtures for the end-to-end scenarios.
#![allow(dead_code)]

use std::sync::Arc;

use tempfile::TempDir;
use texel::{EngineConfig, GlobalIdx, NullObserver, Terminal};

/// Engine config rooted in a scratch directory.
pub fn config_in(dir: &TempDir, cols: u16, rows: u16) -> EngineConfig {
    EngineConfig {
        persist_dir: dir.path().to_path_buf(),
        cols,
        rows,
        ..EngineConfig::default()
    }
}

/// Config whose persistence never flushes on its own: everything stays
/// pending until an explicit flush or close. Used by the crash scenarios.
pub fn manual_flush_config(dir: &TempDir, cols: u16, rows: u16) -> EngineConfig {
    let mut cfg = config_in(dir, cols, rows);
    cfg.persist.write_through_max = 0.0;
    cfg.persist.debounced_max = 0.0;
    cfg.persist.idle_threshold_ms = 600_000;
    cfg
}

pub fn open(dir: &TempDir, id: &str, cols: u16, rows: u16) -> Terminal {
    Terminal::open(config_in(dir, cols, rows), id, Arc::new(NullObserver)).unwrap()
}

pub fn open_with(cfg: EngineConfig, id: &str) -> Terminal {
    Terminal::open(cfg, id, Arc::new(NullObserver)).unwrap()
}

pub fn feed(term: &mut Terminal, s: &str) {
    term.feed(s.as_bytes());
}

/// The visible grid as right-trimmed strings.
pub fn rows(term: &mut Terminal) -> Vec<String> {
    term.display()
        .iter()
        .map(|r| r.trim_end().to_string())
        .collect()
}

/// Text of one logical line, empty if it does not exist.
pub fn line_text(term: &Terminal, g: GlobalIdx) -> String {
    term.read_line(g).map(|l| l.text()).unwrap_or_default()
}
