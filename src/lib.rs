//! texel: a terminal content engine.
//!
//! Consumes a byte stream of VT/ANSI escape sequences from a pseudo-terminal
//! and maintains a durable, resizable, searchable record of every logical
//! line a program ever emitted, while rendering the currently visible screen
//! for a renderer.
//!
//! The engine is built from five subsystems:
//!
//! - [`parser`]: a deterministic state machine decoding CSI/OSC/DCS/ESC
//!   sequences into terminal actions.
//! - [`buffer`]: the in-memory logical-line store with a global line index
//!   and eviction.
//! - [`viewport`]: a read-only projection from logical lines to the visible
//!   grid, with scrollback navigation.
//! - [`store`]: the two-tier disk format, an append-only WAL for crash
//!   safety in front of immutable ~64 KiB pages.
//! - [`persist`]: the rate-aware controller routing dirty notifications
//!   into write-through, debounced or best-effort flushing.
//!
//! [`Terminal`] ties them together for one terminal id:
//!
//! ```no_run
//! use std::sync::Arc;
//! use texel::{EngineConfig, NullObserver, Terminal};
//!
//! let mut term = Terminal::open(
//!     EngineConfig::default(),
//!     "demo",
//!     Arc::new(NullObserver),
//! )?;
//! term.feed(b"hello \x1b[1mworld\x1b[0m\r\n");
//! let grid = term.grid();
//! term.close()?;
//! # anyhow::Ok(())
//! ```

pub mod buffer;
pub mod cell;
pub mod config;
pub mod line;
pub mod logging;
pub mod observer;
pub mod parser;
pub mod persist;
pub mod screen;
pub mod store;
pub mod terminal;
pub mod viewport;

pub use buffer::{GlobalIdx, MemoryBuffer, WriteEvent};
pub use cell::{Attributes, Cell, CellFlags, Color, Style};
pub use config::EngineConfig;
pub use line::LogicalLine;
pub use observer::{NullObserver, TerminalObserver};
pub use parser::{Handler, Parser};
pub use persist::{AdaptivePersistence, IndexedLine, PersistMode, PersistenceMetrics};
pub use screen::ScreenModel;
pub use store::wal::ViewportMeta;
pub use store::DiskStore;
pub use terminal::Terminal;
pub use viewport::ViewportWindow;
