//! Engine configuration.
//!
//! All fields default to the engine's built-in values, so a `Default`
//! construction works without a config file, and a partial JSON file only
//! overrides what it names.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory for persisted terminals. Terminal state lives under
    /// `<persist_dir>/terminals/<terminal_id>/`.
    #[serde(default = "default_persist_dir")]
    pub persist_dir: PathBuf,

    /// Initial terminal width in columns.
    #[serde(default = "default_cols")]
    pub cols: u16,

    /// Initial terminal height in rows.
    #[serde(default = "default_rows")]
    pub rows: u16,

    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub pages: PageStoreConfig,

    #[serde(default)]
    pub persist: PersistConfig,

    #[serde(default)]
    pub viewport: ViewportConfig,

    #[serde(default)]
    pub fixed_width: FixedWidthConfig,
}

fn default_persist_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("texel")
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            persist_dir: default_persist_dir(),
            cols: default_cols(),
            rows: default_rows(),
            buffer: BufferConfig::default(),
            pages: PageStoreConfig::default(),
            persist: PersistConfig::default(),
            viewport: ViewportConfig::default(),
            fixed_width: FixedWidthConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file. Missing fields fall back to
    /// defaults; a missing file is an error (callers decide whether to fall
    /// back to `Default`).
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))
    }
}

/// Memory-buffer window sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Maximum logical lines held in memory.
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,

    /// Lines evicted per eviction pass.
    #[serde(default = "default_eviction_batch")]
    pub eviction_batch: usize,
}

fn default_max_lines() -> usize {
    50_000
}

fn default_eviction_batch() -> usize {
    1_000
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            max_lines: default_max_lines(),
            eviction_batch: default_eviction_batch(),
        }
    }
}

/// On-disk page sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageStoreConfig {
    /// A page is sealed when the next line would push it past this size.
    #[serde(default = "default_target_page_size")]
    pub target_page_size: usize,

    /// Sealed pages kept decoded in memory.
    #[serde(default = "default_page_cache")]
    pub page_cache: usize,
}

fn default_target_page_size() -> usize {
    64 * 1024
}

fn default_page_cache() -> usize {
    16
}

impl Default for PageStoreConfig {
    fn default() -> Self {
        PageStoreConfig {
            target_page_size: default_target_page_size(),
            page_cache: default_page_cache(),
        }
    }
}

/// Adaptive persistence thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistConfig {
    /// Timestamps kept for the write-rate estimate.
    #[serde(default = "default_rate_window_size")]
    pub rate_window_size: usize,

    /// Writes per second at or below which every line is flushed
    /// synchronously.
    #[serde(default = "default_write_through_max")]
    pub write_through_max: f64,

    /// Writes per second at or below which flushes are debounced.
    #[serde(default = "default_debounced_max")]
    pub debounced_max: f64,

    /// Shortest debounce delay, milliseconds.
    #[serde(default = "default_debounce_min_ms")]
    pub debounce_min_ms: u64,

    /// Longest debounce delay, milliseconds.
    #[serde(default = "default_debounce_max_ms")]
    pub debounce_max_ms: u64,

    /// Idle time after which best-effort pending work is flushed,
    /// milliseconds.
    #[serde(default = "default_idle_threshold_ms")]
    pub idle_threshold_ms: u64,

    /// WAL entries accumulated before an automatic checkpoint.
    #[serde(default = "default_checkpoint_threshold")]
    pub checkpoint_threshold: usize,
}

fn default_rate_window_size() -> usize {
    32
}

fn default_write_through_max() -> f64 {
    10.0
}

fn default_debounced_max() -> f64 {
    100.0
}

fn default_debounce_min_ms() -> u64 {
    25
}

fn default_debounce_max_ms() -> u64 {
    250
}

fn default_idle_threshold_ms() -> u64 {
    1_000
}

fn default_checkpoint_threshold() -> usize {
    512
}

impl Default for PersistConfig {
    fn default() -> Self {
        PersistConfig {
            rate_window_size: default_rate_window_size(),
            write_through_max: default_write_through_max(),
            debounced_max: default_debounced_max(),
            debounce_min_ms: default_debounce_min_ms(),
            debounce_max_ms: default_debounce_max_ms(),
            idle_threshold_ms: default_idle_threshold_ms(),
            checkpoint_threshold: default_checkpoint_threshold(),
        }
    }
}

/// Viewport projection tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewportConfig {
    /// Logical lines whose wrapped rows are cached.
    #[serde(default = "default_wrap_cache_lines")]
    pub wrap_cache_lines: usize,
}

fn default_wrap_cache_lines() -> usize {
    256
}

impl Default for ViewportConfig {
    fn default() -> Self {
        ViewportConfig {
            wrap_cache_lines: default_wrap_cache_lines(),
        }
    }
}

/// Fixed-width (non-reflowable) line detection thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedWidthConfig {
    /// Minimum cursor jump, in rows, that counts toward TUI detection.
    #[serde(default = "default_min_jump_distance")]
    pub min_jump_distance: u16,

    /// Consecutive qualifying jumps before the current line is marked.
    #[serde(default = "default_jump_threshold")]
    pub jump_threshold: u32,
}

fn default_min_jump_distance() -> u16 {
    4
}

fn default_jump_threshold() -> u32 {
    3
}

impl Default for FixedWidthConfig {
    fn default() -> Self {
        FixedWidthConfig {
            min_jump_distance: default_min_jump_distance(),
            jump_threshold: default_jump_threshold(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.buffer.max_lines, 50_000);
        assert_eq!(cfg.buffer.eviction_batch, 1_000);
        assert_eq!(cfg.pages.target_page_size, 64 * 1024);
        assert_eq!(cfg.persist.write_through_max, 10.0);
        assert_eq!(cfg.persist.debounced_max, 100.0);
        assert_eq!(cfg.persist.idle_threshold_ms, 1_000);
    }

    #[test]
    fn partial_json_overrides_only_named_fields() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"cols": 132, "buffer": {"max_lines": 100}}"#).unwrap();
        assert_eq!(cfg.cols, 132);
        assert_eq!(cfg.rows, 24);
        assert_eq!(cfg.buffer.max_lines, 100);
        assert_eq!(cfg.buffer.eviction_batch, 1_000);
    }
}
