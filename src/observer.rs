//! Host-facing notification surface.
//!
//! The host supplies one observer at construction; the engine invokes it
//! synchronously from the producer thread. Implementations must not block.

/// Notifications emitted by the parser and screen model.
///
/// Every method has a no-op default so hosts implement only what they need.
pub trait TerminalObserver: Send + Sync {
    /// OSC 0/1/2 window title.
    fn title_changed(&self, _title: &str) {}

    /// OSC 10 set default foreground.
    fn default_fg_changed(&self, _rgb: (u8, u8, u8)) {}

    /// OSC 11 set default background.
    fn default_bg_changed(&self, _rgb: (u8, u8, u8)) {}

    /// OSC 10 with a `?` payload. The host must emit the reply through its
    /// transport.
    fn default_fg_queried(&self) {}

    /// OSC 11 with a `?` payload.
    fn default_bg_queried(&self) {}

    /// DECSET/DECRST 1049.
    fn alt_screen_changed(&self, _active: bool) {}

    /// DECSET/DECRST 2004.
    fn bracketed_paste_changed(&self, _enabled: bool) {}

    /// DECSET/DECRST 2026 synchronized update.
    fn sync_update_changed(&self, _enabled: bool) {}

    /// OSC 133 A.
    fn prompt_started(&self) {}

    /// OSC 133 B.
    fn input_started(&self) {}

    /// OSC 133 C.
    fn command_started(&self) {}

    /// OSC 133 D, with the exit code when the shell supplied one.
    fn command_ended(&self, _exit_code: Option<i32>) {}

    /// DSR reply bytes that must be written back to the program.
    fn dsr_reply(&self, _reply: &str) {}

    /// Decoded DCS `texel-env` environment capture.
    fn env_captured(&self, _data: &[u8]) {}
}

/// Observer that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl TerminalObserver for NullObserver {}
