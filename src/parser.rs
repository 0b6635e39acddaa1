//! VT/ANSI escape-sequence parser.
//!
//! A deterministic state machine that decodes a stream of Unicode scalars
//! into terminal actions. The parser holds no terminal state of its own:
//! it is generic over a [`Handler`] with one method per action, every method
//! defaulting to a no-op, so the screen model implements only what it
//! consumes and tests can record dispatches verbatim.
//!
//! The machine has six states (Ground, Escape, CSI, OSC, DCS, charset
//! selection) plus a transient state for `ESC #`. Malformed input never
//! fails: the first byte that cannot extend the current state discards any
//! partially accumulated sequence, returns the machine to Ground, and is
//! then examined again as ordinary input.

use base64::Engine as _;

use crate::cell::Color;

/// Upper bound on recorded CSI parameter groups; further groups are ignored.
const MAX_PARAMS: usize = 32;

/// Upper bound on an accumulated OSC payload.
const MAX_OSC_LEN: usize = 4096;

/// Upper bound on an accumulated DCS payload (environment captures are the
/// largest legitimate use).
const MAX_DCS_LEN: usize = 64 * 1024;

/// Erase extent for ED and EL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseMode {
    /// From the cursor to the end (ED 0 / EL 0).
    ToEnd,
    /// From the start through the cursor (ED 1 / EL 1).
    ToStart,
    /// Everything (ED 2 / EL 2).
    All,
}

impl EraseMode {
    fn from_param(n: u16) -> Option<Self> {
        match n {
            0 => Some(EraseMode::ToEnd),
            1 => Some(EraseMode::ToStart),
            2 => Some(EraseMode::All),
            _ => None,
        }
    }
}

/// TBC extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabClearMode {
    /// Clear the stop at the cursor column (TBC 0).
    Current,
    /// Clear every stop (TBC 3).
    All,
}

/// DEC private modes the engine recognises (DECSET/DECRST).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivateMode {
    /// ?1 application cursor keys.
    AppCursorKeys,
    /// ?6 origin mode.
    OriginMode,
    /// ?7 auto-wrap.
    AutoWrap,
    /// ?25 cursor visibility.
    ShowCursor,
    /// ?69 left/right margin mode (DECLRMM).
    LeftRightMargins,
    /// ?1049 alternate screen with cursor save.
    AltScreen,
    /// ?2004 bracketed paste.
    BracketedPaste,
    /// ?2026 synchronized update.
    SyncUpdate,
}

impl PrivateMode {
    pub fn from_raw(n: u16) -> Option<Self> {
        match n {
            1 => Some(PrivateMode::AppCursorKeys),
            6 => Some(PrivateMode::OriginMode),
            7 => Some(PrivateMode::AutoWrap),
            25 => Some(PrivateMode::ShowCursor),
            69 => Some(PrivateMode::LeftRightMargins),
            1049 => Some(PrivateMode::AltScreen),
            2004 => Some(PrivateMode::BracketedPaste),
            2026 => Some(PrivateMode::SyncUpdate),
            _ => None,
        }
    }
}

/// One parsed SGR item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SgrAttr {
    Reset,
    Bold,
    Underline,
    Reverse,
    CancelBold,
    CancelUnderline,
    CancelReverse,
    Foreground(Color),
    Background(Color),
}

/// Which default color an OSC 10/11 addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorPlane {
    Foreground,
    Background,
}

/// OSC 133 shell-integration marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellMark {
    PromptStart,
    InputStart,
    CommandStart,
    CommandEnd(Option<i32>),
}

/// Receiver of parsed terminal actions.
///
/// All methods default to no-ops. The parser calls them synchronously while
/// consuming input; implementations must not block.
pub trait Handler {
    /// A printable scalar for the write-with-wrap path.
    fn input(&mut self, _c: char) {}

    fn carriage_return(&mut self) {}
    /// LF, VT and FF all index down (possibly scrolling).
    fn linefeed(&mut self) {}
    fn backspace(&mut self) {}
    fn horizontal_tab(&mut self) {}

    /// ESC c full reset.
    fn reset_terminal(&mut self) {}
    /// ESC D.
    fn index(&mut self) {}
    /// ESC E.
    fn next_line(&mut self) {}
    /// ESC M.
    fn reverse_index(&mut self) {}
    /// ESC H.
    fn set_tab_stop(&mut self) {}
    /// ESC 7.
    fn save_cursor(&mut self) {}
    /// ESC 8.
    fn restore_cursor(&mut self) {}
    /// ESC 6.
    fn back_index(&mut self) {}
    /// ESC 9.
    fn forward_index(&mut self) {}
    /// ESC # 8 fills the screen with `E`.
    fn screen_alignment_test(&mut self) {}
    /// ESC ( final byte; charset switching is otherwise ignored.
    fn designate_charset(&mut self, _charset: char) {}

    fn cursor_up(&mut self, _n: u16) {}
    fn cursor_down(&mut self, _n: u16) {}
    fn cursor_forward(&mut self, _n: u16) {}
    fn cursor_back(&mut self, _n: u16) {}
    fn cursor_next_line(&mut self, _n: u16) {}
    fn cursor_prev_line(&mut self, _n: u16) {}
    /// CHA; zero-based column.
    fn cursor_column(&mut self, _col: u16) {}
    /// CUP/HVP; zero-based row and column.
    fn cursor_position(&mut self, _row: u16, _col: u16) {}

    fn erase_display(&mut self, _mode: EraseMode) {}
    fn erase_line(&mut self, _mode: EraseMode) {}
    fn insert_lines(&mut self, _n: u16) {}
    fn delete_lines(&mut self, _n: u16) {}
    fn insert_chars(&mut self, _n: u16) {}
    fn delete_chars(&mut self, _n: u16) {}
    fn erase_chars(&mut self, _n: u16) {}
    fn scroll_up(&mut self, _n: u16) {}
    fn scroll_down(&mut self, _n: u16) {}

    /// DECSTBM; zero-based inclusive margins, `None` bottom = last row.
    fn set_scroll_region(&mut self, _top: u16, _bottom: Option<u16>) {}
    /// DECSLRM; zero-based inclusive margins, `None` right = last column.
    fn set_horizontal_margins(&mut self, _left: u16, _right: Option<u16>) {}

    /// One SGR item; a single `CSI ... m` may produce several calls.
    fn sgr_attr(&mut self, _attr: SgrAttr) {}

    /// DSR; the reply must be routed back to the program.
    fn device_status_report(&mut self, _kind: u16) {}

    fn set_private_mode(&mut self, _mode: PrivateMode) {}
    fn reset_private_mode(&mut self, _mode: PrivateMode) {}
    /// ANSI mode 4 (IRM).
    fn set_insert_mode(&mut self, _enabled: bool) {}
    fn clear_tab_stop(&mut self, _mode: TabClearMode) {}

    /// OSC 0/1/2.
    fn set_title(&mut self, _title: &str) {}
    /// OSC 10/11 with a color payload.
    fn set_default_color(&mut self, _plane: ColorPlane, _rgb: (u8, u8, u8)) {}
    /// OSC 10/11 with a `?` payload.
    fn query_default_color(&mut self, _plane: ColorPlane) {}
    /// OSC 133.
    fn shell_integration(&mut self, _mark: ShellMark) {}
    /// DCS `texel-env;` payload, already base64-decoded.
    fn env_capture(&mut self, _data: &[u8]) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum State {
    #[default]
    Ground,
    Escape,
    Csi,
    Osc,
    Dcs,
    Charset,
    Hash,
}

/// The escape-sequence state machine.
#[derive(Debug, Default)]
pub struct Parser {
    state: State,
    /// Completed parameter groups; each group is a top-level parameter with
    /// its colon-separated subparameters.
    params: Vec<Vec<u16>>,
    /// Subparameters of the group being accumulated.
    group: Vec<u16>,
    /// Value currently being accumulated.
    cur: u32,
    /// `?` was seen in the parameter prelude.
    private: bool,
    /// Single recorded intermediate byte.
    intermediate: Option<char>,
    osc: String,
    dcs: String,
    /// Inside OSC/DCS, an ESC was seen and `\` would complete ST.
    st_pending: bool,
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one Unicode scalar through the machine.
    pub fn advance<H: Handler>(&mut self, handler: &mut H, c: char) {
        match self.state {
            State::Ground => self.ground(handler, c),
            State::Escape => self.escape(handler, c),
            State::Csi => self.csi(handler, c),
            State::Osc => self.osc(handler, c),
            State::Dcs => self.dcs(handler, c),
            State::Charset => {
                handler.designate_charset(c);
                self.state = State::Ground;
            }
            State::Hash => {
                if c == '8' {
                    handler.screen_alignment_test();
                } else {
                    tracing::debug!("ignoring ESC # {:?}", c);
                }
                self.state = State::Ground;
            }
        }
    }

    /// Convenience for tests and in-process feeding.
    pub fn advance_str<H: Handler>(&mut self, handler: &mut H, s: &str) {
        for c in s.chars() {
            self.advance(handler, c);
        }
    }

    fn reset_sequence(&mut self) {
        self.params.clear();
        self.group.clear();
        self.cur = 0;
        self.private = false;
        self.intermediate = None;
        self.osc.clear();
        self.dcs.clear();
        self.st_pending = false;
        self.state = State::Ground;
    }

    /// Abort the current sequence and re-examine `c` from Ground.
    fn abort_and_reprocess<H: Handler>(&mut self, handler: &mut H, c: char) {
        self.reset_sequence();
        self.ground(handler, c);
    }

    fn ground<H: Handler>(&mut self, handler: &mut H, c: char) {
        match c {
            '\x1b' => {
                self.state = State::Escape;
            }
            '\n' | '\x0b' | '\x0c' => handler.linefeed(),
            '\r' => handler.carriage_return(),
            '\x08' | '\x7f' => handler.backspace(),
            '\t' => handler.horizontal_tab(),
            '\x07' => {} // BEL
            c if (c as u32) < 0x20 => {
                tracing::trace!("ignoring control 0x{:02x}", c as u32);
            }
            c => handler.input(c),
        }
    }

    fn escape<H: Handler>(&mut self, handler: &mut H, c: char) {
        match c {
            '[' => self.state = State::Csi,
            ']' => self.state = State::Osc,
            'P' => self.state = State::Dcs,
            '(' => self.state = State::Charset,
            '#' => self.state = State::Hash,
            'c' => {
                handler.reset_terminal();
                self.state = State::Ground;
            }
            'D' => {
                handler.index();
                self.state = State::Ground;
            }
            'E' => {
                handler.next_line();
                self.state = State::Ground;
            }
            'M' => {
                handler.reverse_index();
                self.state = State::Ground;
            }
            'H' => {
                handler.set_tab_stop();
                self.state = State::Ground;
            }
            '7' => {
                handler.save_cursor();
                self.state = State::Ground;
            }
            '8' => {
                handler.restore_cursor();
                self.state = State::Ground;
            }
            '6' => {
                handler.back_index();
                self.state = State::Ground;
            }
            '9' => {
                handler.forward_index();
                self.state = State::Ground;
            }
            // Keypad modes; recognised but not acted on.
            '=' | '>' => self.state = State::Ground,
            // A lone string terminator.
            '\\' => self.state = State::Ground,
            _ => {
                tracing::debug!("unknown escape final {:?}", c);
                self.abort_and_reprocess(handler, c);
            }
        }
    }

    fn push_value(&mut self) {
        if self.group.len() < MAX_PARAMS {
            self.group.push(self.cur.min(u16::MAX as u32) as u16);
        }
        self.cur = 0;
    }

    fn push_group(&mut self) {
        self.push_value();
        if self.params.len() < MAX_PARAMS {
            self.params.push(std::mem::take(&mut self.group));
        } else {
            self.group.clear();
        }
    }

    fn csi<H: Handler>(&mut self, handler: &mut H, c: char) {
        match c {
            '0'..='9' => {
                self.cur = self.cur.saturating_mul(10).saturating_add(c as u32 - '0' as u32);
            }
            ';' => self.push_group(),
            ':' => self.push_value(),
            '?' => self.private = true,
            '<' | '=' | '>' => self.intermediate = Some(c),
            '\u{20}'..='\u{2f}' => self.intermediate = Some(c),
            '\u{40}'..='\u{7e}' => {
                self.push_group();
                let params = std::mem::take(&mut self.params);
                let private = self.private;
                let intermediate = self.intermediate;
                self.reset_sequence();
                self.csi_dispatch(handler, c, &params, private, intermediate);
            }
            _ => self.abort_and_reprocess(handler, c),
        }
    }

    /// First value of group `i`, or `default` when absent or zero-from-empty.
    fn arg(params: &[Vec<u16>], i: usize, default: u16) -> u16 {
        match params.get(i).and_then(|g| g.first()) {
            Some(&v) => v,
            None => default,
        }
    }

    /// Count argument: group `i`, zero treated as one.
    fn arg1(params: &[Vec<u16>], i: usize) -> u16 {
        Self::arg(params, i, 1).max(1)
    }

    fn csi_dispatch<H: Handler>(
        &mut self,
        handler: &mut H,
        action: char,
        params: &[Vec<u16>],
        private: bool,
        intermediate: Option<char>,
    ) {
        if let Some(im) = intermediate {
            // No intermediate-qualified sequences are recognised.
            tracing::debug!("ignoring CSI with intermediate {:?}, final {:?}", im, action);
            return;
        }
        match action {
            'A' => handler.cursor_up(Self::arg1(params, 0)),
            'B' => handler.cursor_down(Self::arg1(params, 0)),
            'C' => handler.cursor_forward(Self::arg1(params, 0)),
            'D' => handler.cursor_back(Self::arg1(params, 0)),
            'E' => handler.cursor_next_line(Self::arg1(params, 0)),
            'F' => handler.cursor_prev_line(Self::arg1(params, 0)),
            'G' => handler.cursor_column(Self::arg1(params, 0) - 1),
            'H' | 'f' => {
                let row = Self::arg1(params, 0) - 1;
                let col = Self::arg1(params, 1) - 1;
                handler.cursor_position(row, col);
            }
            'J' => {
                if let Some(mode) = EraseMode::from_param(Self::arg(params, 0, 0)) {
                    handler.erase_display(mode);
                }
            }
            'K' => {
                if let Some(mode) = EraseMode::from_param(Self::arg(params, 0, 0)) {
                    handler.erase_line(mode);
                }
            }
            'L' => handler.insert_lines(Self::arg1(params, 0)),
            'M' => handler.delete_lines(Self::arg1(params, 0)),
            '@' => handler.insert_chars(Self::arg1(params, 0)),
            'P' => handler.delete_chars(Self::arg1(params, 0)),
            'X' => handler.erase_chars(Self::arg1(params, 0)),
            'S' => handler.scroll_up(Self::arg1(params, 0)),
            'T' => handler.scroll_down(Self::arg1(params, 0)),
            'r' => {
                let top = Self::arg1(params, 0) - 1;
                let bottom = match Self::arg(params, 1, 0) {
                    0 => None,
                    b => Some(b - 1),
                };
                handler.set_scroll_region(top, bottom);
            }
            's' => {
                let left = Self::arg1(params, 0) - 1;
                let right = match Self::arg(params, 1, 0) {
                    0 => None,
                    r => Some(r - 1),
                };
                handler.set_horizontal_margins(left, right);
            }
            'm' => self.sgr_dispatch(handler, params),
            'n' => handler.device_status_report(Self::arg(params, 0, 0)),
            'g' => match Self::arg(params, 0, 0) {
                0 => handler.clear_tab_stop(TabClearMode::Current),
                3 => handler.clear_tab_stop(TabClearMode::All),
                other => tracing::debug!("ignoring TBC {}", other),
            },
            'h' | 'l' => {
                let enable = action == 'h';
                for group in params {
                    let Some(&raw) = group.first() else { continue };
                    if private {
                        match PrivateMode::from_raw(raw) {
                            Some(mode) if enable => handler.set_private_mode(mode),
                            Some(mode) => handler.reset_private_mode(mode),
                            None => {
                                tracing::debug!(
                                    "unhandled private mode {} ({})",
                                    raw,
                                    if enable { "set" } else { "reset" }
                                );
                            }
                        }
                    } else if raw == 4 {
                        handler.set_insert_mode(enable);
                    } else {
                        tracing::debug!("unhandled ANSI mode {}", raw);
                    }
                }
            }
            _ => {
                tracing::debug!("unknown CSI final {:?}", action);
            }
        }
    }

    fn sgr_dispatch<H: Handler>(&mut self, handler: &mut H, params: &[Vec<u16>]) {
        if params.iter().all(|g| g.iter().all(|&v| v == 0)) {
            handler.sgr_attr(SgrAttr::Reset);
            return;
        }
        let mut i = 0;
        while i < params.len() {
            let group = &params[i];
            let first = group.first().copied().unwrap_or(0);
            match first {
                0 => handler.sgr_attr(SgrAttr::Reset),
                1 => handler.sgr_attr(SgrAttr::Bold),
                4 => handler.sgr_attr(SgrAttr::Underline),
                7 => handler.sgr_attr(SgrAttr::Reverse),
                22 => handler.sgr_attr(SgrAttr::CancelBold),
                24 => handler.sgr_attr(SgrAttr::CancelUnderline),
                27 => handler.sgr_attr(SgrAttr::CancelReverse),
                30..=37 => handler.sgr_attr(SgrAttr::Foreground(Color::Standard(first as u8 - 30))),
                39 => handler.sgr_attr(SgrAttr::Foreground(Color::Default)),
                40..=47 => handler.sgr_attr(SgrAttr::Background(Color::Standard(first as u8 - 40))),
                49 => handler.sgr_attr(SgrAttr::Background(Color::Default)),
                90..=97 => {
                    handler.sgr_attr(SgrAttr::Foreground(Color::Standard(first as u8 - 90 + 8)))
                }
                100..=107 => {
                    handler.sgr_attr(SgrAttr::Background(Color::Standard(first as u8 - 100 + 8)))
                }
                38 | 48 => {
                    let color = if group.len() > 1 {
                        Self::extended_color_from_subparams(&group[1..])
                    } else {
                        let (color, consumed) = Self::extended_color_from_groups(&params[i + 1..]);
                        i += consumed;
                        color
                    };
                    match color {
                        Some(c) if first == 38 => handler.sgr_attr(SgrAttr::Foreground(c)),
                        Some(c) => handler.sgr_attr(SgrAttr::Background(c)),
                        None => tracing::debug!("malformed SGR {} color spec", first),
                    }
                }
                other => {
                    // Unknown parameters are skipped without disturbing the rest.
                    tracing::trace!("skipping SGR {}", other);
                }
            }
            i += 1;
        }
    }

    /// Colon form: `38:5:n`, `38:2:r:g:b`, or ITU-T `38:2:cs:r:g:b`.
    fn extended_color_from_subparams(sub: &[u16]) -> Option<Color> {
        match sub.first()? {
            5 => Some(Color::Indexed(*sub.get(1)? as u8)),
            2 => {
                let rgb = match sub.len() {
                    // Colorspace id present; skip it.
                    n if n >= 5 => &sub[2..5],
                    4 => &sub[1..4],
                    _ => return None,
                };
                Some(Color::Rgb(rgb[0] as u8, rgb[1] as u8, rgb[2] as u8))
            }
            _ => None,
        }
    }

    /// Semicolon form: `38;5;n` or `38;2;r;g;b` spread over following groups.
    /// Returns the color and the number of groups consumed.
    fn extended_color_from_groups(rest: &[Vec<u16>]) -> (Option<Color>, usize) {
        let first = rest.first().and_then(|g| g.first()).copied();
        match first {
            Some(5) => {
                let n = rest.get(1).and_then(|g| g.first()).copied();
                match n {
                    Some(n) => (Some(Color::Indexed(n as u8)), 2),
                    None => (None, rest.len().min(1)),
                }
            }
            Some(2) => {
                let mut rgb = [0u8; 3];
                for (slot, group) in rgb.iter_mut().zip(rest.get(1..4).unwrap_or(&[])) {
                    match group.first() {
                        Some(&v) => *slot = v as u8,
                        None => return (None, rest.len().min(4)),
                    }
                }
                if rest.len() >= 4 {
                    (Some(Color::Rgb(rgb[0], rgb[1], rgb[2])), 4)
                } else {
                    (None, rest.len())
                }
            }
            _ => (None, 0),
        }
    }

    fn osc<H: Handler>(&mut self, handler: &mut H, c: char) {
        if self.st_pending {
            self.st_pending = false;
            if c == '\\' {
                self.osc_dispatch(handler);
                self.reset_sequence();
            } else {
                // ESC aborted the string and begins a new sequence.
                self.reset_sequence();
                self.state = State::Escape;
                self.escape(handler, c);
            }
            return;
        }
        match c {
            '\x07' => {
                self.osc_dispatch(handler);
                self.reset_sequence();
            }
            '\x1b' => self.st_pending = true,
            c if (c as u32) < 0x20 => {}
            c => {
                if self.osc.len() < MAX_OSC_LEN {
                    self.osc.push(c);
                }
            }
        }
    }

    fn osc_dispatch<H: Handler>(&mut self, handler: &mut H) {
        let payload = std::mem::take(&mut self.osc);
        let (cmd, rest) = match payload.split_once(';') {
            Some((cmd, rest)) => (cmd, rest),
            None => (payload.as_str(), ""),
        };
        let Ok(cmd) = cmd.parse::<u16>() else {
            tracing::debug!("ignoring OSC without numeric command");
            return;
        };
        match cmd {
            0 | 1 | 2 => handler.set_title(rest),
            10 | 11 => {
                let plane = if cmd == 10 {
                    ColorPlane::Foreground
                } else {
                    ColorPlane::Background
                };
                if rest == "?" {
                    handler.query_default_color(plane);
                } else if let Some(rgb) = parse_color_spec(rest) {
                    handler.set_default_color(plane, rgb);
                } else {
                    tracing::debug!("ignoring OSC {} payload {:?}", cmd, rest);
                }
            }
            133 => {
                let (sub, arg) = match rest.split_once(';') {
                    Some((sub, arg)) => (sub, Some(arg)),
                    None => (rest, None),
                };
                let mark = match sub {
                    "A" => Some(ShellMark::PromptStart),
                    "B" => Some(ShellMark::InputStart),
                    "C" => Some(ShellMark::CommandStart),
                    "D" => Some(ShellMark::CommandEnd(
                        arg.and_then(|a| a.parse::<i32>().ok()),
                    )),
                    _ => None,
                };
                match mark {
                    Some(mark) => handler.shell_integration(mark),
                    None => tracing::debug!("ignoring OSC 133 subcommand {:?}", sub),
                }
            }
            other => {
                tracing::trace!("ignoring OSC {}", other);
            }
        }
    }

    fn dcs<H: Handler>(&mut self, handler: &mut H, c: char) {
        if self.st_pending {
            self.st_pending = false;
            if c == '\\' {
                self.dcs_dispatch(handler);
                self.reset_sequence();
            } else {
                self.reset_sequence();
                self.state = State::Escape;
                self.escape(handler, c);
            }
            return;
        }
        match c {
            '\x1b' => self.st_pending = true,
            c if (c as u32) < 0x20 => {}
            c => {
                if self.dcs.len() < MAX_DCS_LEN {
                    self.dcs.push(c);
                }
            }
        }
    }

    fn dcs_dispatch<H: Handler>(&mut self, handler: &mut H) {
        let payload = std::mem::take(&mut self.dcs);
        let Some(encoded) = payload.strip_prefix("texel-env;") else {
            tracing::trace!("dropping unrecognised DCS ({} bytes)", payload.len());
            return;
        };
        match base64::engine::general_purpose::STANDARD.decode(encoded.trim()) {
            Ok(data) => handler.env_capture(&data),
            Err(err) => tracing::debug!("dropping undecodable texel-env capture: {}", err),
        }
    }
}

/// Parse an OSC 10/11 color payload: `rgb:RRRR/GGGG/BBBB` (1–4 hex digits
/// per component, scaled to 8 bits) or `#RRGGBB`.
fn parse_color_spec(spec: &str) -> Option<(u8, u8, u8)> {
    if let Some(rest) = spec.strip_prefix("rgb:") {
        let mut parts = rest.split('/');
        let r = scale_hex_component(parts.next()?)?;
        let g = scale_hex_component(parts.next()?)?;
        let b = scale_hex_component(parts.next()?)?;
        if parts.next().is_some() {
            return None;
        }
        return Some((r, g, b));
    }
    if let Some(hex) = spec.strip_prefix('#') {
        if hex.len() == 6 {
            let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
            let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
            let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
            return Some((r, g, b));
        }
    }
    None
}

fn scale_hex_component(s: &str) -> Option<u8> {
    if s.is_empty() || s.len() > 4 {
        return None;
    }
    let value = u32::from_str_radix(s, 16).ok()?;
    let max = (1u32 << (4 * s.len() as u32)) - 1;
    Some(((value * 255 + max / 2) / max) as u8)
}
