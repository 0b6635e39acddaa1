//! Detection of non-reflowable (TUI-drawn) lines.
//!
//! Full-screen programs position the cursor freely and redraw in place;
//! their output only makes sense at the width it was drawn at. Two signals
//! classify a line as fixed-width: an active non-full-screen scroll region,
//! and repeated large cursor jumps. Cursor visibility is tracked as a
//! supporting signal: TUIs usually hide the cursor while painting.

use crate::config::FixedWidthConfig;

#[derive(Debug)]
pub struct FixedWidthDetector {
    min_jump_distance: u16,
    jump_threshold: u32,
    consecutive_jumps: u32,
    last_row: u16,
    region_active: bool,
    cursor_hidden: bool,
}

impl FixedWidthDetector {
    pub fn new(cfg: &FixedWidthConfig) -> Self {
        FixedWidthDetector {
            min_jump_distance: cfg.min_jump_distance.max(1),
            jump_threshold: cfg.jump_threshold.max(1),
            consecutive_jumps: 0,
            last_row: 0,
            region_active: false,
            cursor_hidden: false,
        }
    }

    /// DECSTBM with non-full-screen margins entered or left.
    pub fn set_region_active(&mut self, active: bool) {
        if self.region_active != active {
            tracing::debug!(active, "scroll-region fixed-width signal");
        }
        self.region_active = active;
    }

    /// While a region is active, every written line is marked.
    pub fn region_active(&self) -> bool {
        self.region_active
    }

    pub fn record_visibility(&mut self, visible: bool) {
        self.cursor_hidden = !visible;
    }

    /// Record an absolute cursor row move. Returns true when the jump
    /// pattern says the current line should be marked non-reflowable.
    pub fn record_cursor_row(&mut self, row: u16) -> bool {
        let jump = self.last_row.abs_diff(row);
        self.last_row = row;
        if jump >= self.min_jump_distance {
            self.consecutive_jumps += 1;
        } else {
            self.consecutive_jumps = 0;
        }
        // A hidden cursor corroborates; one fewer jump suffices.
        let threshold = if self.cursor_hidden {
            self.jump_threshold.saturating_sub(1).max(1)
        } else {
            self.jump_threshold
        };
        self.consecutive_jumps >= threshold
    }

    pub fn reset(&mut self) {
        self.consecutive_jumps = 0;
        self.region_active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> FixedWidthDetector {
        FixedWidthDetector::new(&FixedWidthConfig {
            min_jump_distance: 4,
            jump_threshold: 3,
        })
    }

    #[test]
    fn small_moves_never_trigger() {
        let mut d = detector();
        for row in [1, 2, 3, 4, 5, 6, 7, 8] {
            assert!(!d.record_cursor_row(row));
        }
    }

    #[test]
    fn repeated_jumps_trigger() {
        let mut d = detector();
        assert!(!d.record_cursor_row(10));
        assert!(!d.record_cursor_row(2));
        assert!(d.record_cursor_row(12));
    }

    #[test]
    fn a_small_move_resets_the_streak() {
        let mut d = detector();
        d.record_cursor_row(10);
        d.record_cursor_row(2);
        d.record_cursor_row(3); // jump of 1
        assert!(!d.record_cursor_row(12));
        assert!(!d.record_cursor_row(2));
        assert!(d.record_cursor_row(12));
    }

    #[test]
    fn hidden_cursor_lowers_threshold() {
        let mut d = detector();
        d.record_visibility(false);
        assert!(!d.record_cursor_row(10));
        assert!(d.record_cursor_row(2));
    }
}
