//! Terminal screen state: styled cell grids, cursor, selection, scrollback
//! and the mode flags the key encoder consults.
//!
//! The render thread never touches this structure directly; it takes a
//! [`Screen`] snapshot under the terminal mutex and works on the clone.

use std::collections::VecDeque;

use unicode_width::UnicodeWidthChar;

use crate::color::{Color, ColorPalette};
use crate::keyboard::{EncoderState, KittyKeyboardState};

/// Underline decoration styles (SGR 4 with subparameters).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum UnderlineStyle {
    #[default]
    None,
    Single,
    Double,
    Curly,
    Dotted,
    Dashed,
}

/// A single cell in the terminal grid.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Cell {
    pub ch: char,
    pub fg: Color,
    pub bg: Color,
    pub bold: bool,
    pub italic: bool,
    pub faint: bool,
    pub inverse: bool,
    pub underline: UnderlineStyle,
    pub strikethrough: bool,
    /// Leading cell of a double-width character.
    pub wide: bool,
    /// Trailing half of a double-width character; the glyph lives in the
    /// previous cell.
    pub wide_continuation: bool,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            ch: ' ',
            fg: Color::Default,
            bg: Color::Default,
            bold: false,
            italic: false,
            faint: false,
            inverse: false,
            underline: UnderlineStyle::None,
            strikethrough: false,
            wide: false,
            wide_continuation: false,
        }
    }
}

/// One grid row. The id is stable across scrolling and identifies the row
/// in the renderer's cache.
#[derive(Clone, Debug)]
pub struct Row {
    pub id: u64,
    pub cells: Vec<Cell>,
    pub dirty: bool,
}

impl Row {
    fn new(id: u64, cols: usize) -> Self {
        Self { id, cells: vec![Cell::default(); cols], dirty: true }
    }
}

/// Which screen is active.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScreenKind {
    Primary,
    Alternate,
}

/// Cursor shapes as set by DECSCUSR, reduced to the drawn geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CursorStyle {
    #[default]
    Box,
    HollowBox,
    Bar,
}

#[derive(Clone, Copy, Debug)]
pub struct Cursor {
    pub x: usize,
    pub y: usize,
    pub style: CursorStyle,
    pub visible: bool,
}

/// A selection span in viewport coordinates, normalized so that
/// (start_row, start_col) <= (end_row, end_col). Both ends inclusive.
///
/// The renderer keys its row cache on this, so it must stay `Hash`/`Eq`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Selection {
    pub start_col: u16,
    pub start_row: u16,
    pub end_col: u16,
    pub end_row: u16,
}

impl Selection {
    pub fn new(start: (usize, usize), end: (usize, usize)) -> Self {
        let (a, b) = if (start.1, start.0) <= (end.1, end.0) { (start, end) } else { (end, start) };
        Self {
            start_col: a.0 as u16,
            start_row: a.1 as u16,
            end_col: b.0 as u16,
            end_row: b.1 as u16,
        }
    }

    pub fn contains_row(&self, row: usize) -> bool {
        (self.start_row as usize..=self.end_row as usize).contains(&row)
    }

    /// Linear (reading-order) containment.
    pub fn contains(&self, col: usize, row: usize) -> bool {
        if !self.contains_row(row) {
            return false;
        }
        if row == self.start_row as usize && col < self.start_col as usize {
            return false;
        }
        if row == self.end_row as usize && col > self.end_col as usize {
            return false;
        }
        true
    }
}

/// Cloned view of the visible screen handed to the renderer.
#[derive(Clone, Debug)]
pub struct Screen {
    pub cols: usize,
    pub rows: Vec<Row>,
    pub cursor: Cursor,
    /// False while the user has scrolled back; the cursor is off-viewport
    /// then and must not be drawn.
    pub viewport_at_bottom: bool,
}

/// Mode flags toggled by DEC private modes and modifyOtherKeys.
#[derive(Clone, Copy, Debug)]
pub struct TerminalModes {
    pub alt_esc_prefix: bool,
    pub cursor_key_application: bool,
    pub keypad_key_application: bool,
    pub modify_other_keys_state_2: bool,
}

impl Default for TerminalModes {
    fn default() -> Self {
        Self {
            alt_esc_prefix: true,
            cursor_key_application: false,
            keypad_key_application: false,
            modify_other_keys_state_2: false,
        }
    }
}

/// The terminal state shared between the PTY reader and the renderer.
pub struct Terminal {
    pub cols: usize,
    pub rows: usize,
    screen: Vec<Row>,
    alt_screen: Vec<Row>,
    active: ScreenKind,
    scrollback: VecDeque<Row>,
    scrollback_limit: usize,
    /// Rows scrolled up from the bottom; 0 means live view.
    viewport_offset: usize,
    cursor: Cursor,
    saved_cursor: (usize, usize),
    /// Pen state applied to newly written cells.
    pub pen: Cell,
    /// Selection anchored in absolute row coordinates (scrollback included)
    /// so it stays put while the screen scrolls.
    selection: Option<((usize, usize), (usize, usize))>,
    pub modes: TerminalModes,
    pub kitty_keyboard: KittyKeyboardState,
    pub palette: ColorPalette,
    next_row_id: u64,
}

impl Terminal {
    pub fn new(cols: usize, rows: usize, scrollback_limit: usize) -> Self {
        let mut term = Self {
            cols,
            rows,
            screen: Vec::new(),
            alt_screen: Vec::new(),
            active: ScreenKind::Primary,
            scrollback: VecDeque::new(),
            scrollback_limit,
            viewport_offset: 0,
            cursor: Cursor { x: 0, y: 0, style: CursorStyle::Box, visible: true },
            saved_cursor: (0, 0),
            pen: Cell::default(),
            selection: None,
            modes: TerminalModes::default(),
            kitty_keyboard: KittyKeyboardState::default(),
            palette: ColorPalette::default(),
            next_row_id: 0,
        };
        term.screen = term.fresh_rows(rows);
        term.alt_screen = term.fresh_rows(rows);
        term
    }

    fn fresh_row(&mut self) -> Row {
        let id = self.next_row_id;
        self.next_row_id += 1;
        Row::new(id, self.cols)
    }

    fn fresh_rows(&mut self, n: usize) -> Vec<Row> {
        (0..n).map(|_| self.fresh_row()).collect()
    }

    pub fn active_screen(&self) -> ScreenKind {
        self.active
    }

    fn grid(&self) -> &Vec<Row> {
        match self.active {
            ScreenKind::Primary => &self.screen,
            ScreenKind::Alternate => &self.alt_screen,
        }
    }

    fn grid_mut(&mut self) -> &mut Vec<Row> {
        match self.active {
            ScreenKind::Primary => &mut self.screen,
            ScreenKind::Alternate => &mut self.alt_screen,
        }
    }

    /// Switch to the alternate screen, clearing it. No scrollback there.
    pub fn enter_alt_screen(&mut self) {
        if self.active == ScreenKind::Alternate {
            return;
        }
        self.saved_cursor = (self.cursor.x, self.cursor.y);
        self.alt_screen = self.fresh_rows(self.rows);
        self.active = ScreenKind::Alternate;
        self.cursor.x = 0;
        self.cursor.y = 0;
        self.viewport_offset = 0;
    }

    pub fn exit_alt_screen(&mut self) {
        if self.active == ScreenKind::Primary {
            return;
        }
        self.active = ScreenKind::Primary;
        let (x, y) = self.saved_cursor;
        self.cursor.x = x;
        self.cursor.y = y;
        for row in &mut self.screen {
            row.dirty = true;
        }
    }

    /// Feeds plain output text. Printable characters and the basic C0
    /// controls are interpreted; escape sequences are currently swallowed
    /// undecoded.
    ///
    /// TODO: replace the escape-swallowing below with a real VT parser.
    pub fn feed(&mut self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\x1b' => {
                    // Swallow CSI/OSC/two-byte escapes so stray sequences do
                    // not print as text.
                    match chars.peek() {
                        Some('[') => {
                            chars.next();
                            while let Some(&c) = chars.peek() {
                                chars.next();
                                if ('\x40'..='\x7e').contains(&c) {
                                    break;
                                }
                            }
                        }
                        Some(']') => {
                            chars.next();
                            while let Some(c) = chars.next() {
                                if c == '\x07' {
                                    break;
                                }
                                if c == '\x1b' {
                                    chars.next_if(|&c| c == '\\');
                                    break;
                                }
                            }
                        }
                        Some(_) => {
                            chars.next();
                        }
                        None => {}
                    }
                }
                '\n' => self.newline(),
                '\r' => self.cursor.x = 0,
                '\t' => {
                    let next_stop = (self.cursor.x / 8 + 1) * 8;
                    self.cursor.x = next_stop.min(self.cols.saturating_sub(1));
                }
                '\x08' => self.cursor.x = self.cursor.x.saturating_sub(1),
                '\x07' => {}
                c if (c as u32) >= 0x20 => self.put_char(c),
                _ => {}
            }
        }
    }

    /// Writes one printable character at the cursor, advancing it and
    /// wrapping at the margin. Wide characters occupy two cells.
    pub fn put_char(&mut self, c: char) {
        let width = c.width().unwrap_or(1).max(1);
        if self.cursor.x + width > self.cols {
            self.newline();
            self.cursor.x = 0;
        }
        let (x, y) = (self.cursor.x, self.cursor.y);
        let pen = self.pen;
        let cols = self.cols;
        let row = &mut self.grid_mut()[y];
        row.dirty = true;
        row.cells[x] = Cell { ch: c, wide: width == 2, wide_continuation: false, ..pen };
        if width == 2 && x + 1 < cols {
            row.cells[x + 1] = Cell { ch: ' ', wide_continuation: true, ..pen };
        }
        // May land one past the margin; the next write wraps and the
        // snapshot clamps for drawing.
        self.cursor.x += width;
    }

    fn newline(&mut self) {
        if self.cursor.y + 1 < self.rows {
            self.cursor.y += 1;
        } else {
            self.scroll_up();
        }
        self.cursor.x = 0;
    }

    /// Scrolls the active grid up one line. On the primary screen the top
    /// row moves into scrollback; the alternate screen discards it.
    fn scroll_up(&mut self) {
        let fresh = self.fresh_row();
        let grid = match self.active {
            ScreenKind::Primary => &mut self.screen,
            ScreenKind::Alternate => &mut self.alt_screen,
        };
        let top = grid.remove(0);
        grid.push(fresh);
        for row in grid.iter_mut() {
            row.dirty = true;
        }
        if self.active == ScreenKind::Primary {
            self.scrollback.push_back(top);
            while self.scrollback.len() > self.scrollback_limit {
                self.scrollback.pop_front();
            }
        }
    }

    /// Scrolls the viewport by `delta` rows (positive = back in history).
    pub fn scroll_viewport(&mut self, delta: isize) {
        if self.active == ScreenKind::Alternate {
            return;
        }
        let max = self.scrollback.len();
        let new = (self.viewport_offset as isize).saturating_add(delta);
        let new = new.clamp(0, max as isize) as usize;
        if new != self.viewport_offset {
            self.viewport_offset = new;
            for row in &mut self.screen {
                row.dirty = true;
            }
        }
    }

    pub fn viewport_at_bottom(&self) -> bool {
        self.viewport_offset == 0
    }

    /// Sets the selection from two absolute (col, row) points, rows counted
    /// from the top of scrollback.
    pub fn set_selection(&mut self, start: (usize, usize), end: (usize, usize)) {
        self.selection = Some((start, end));
        for row in self.grid_mut().iter_mut() {
            row.dirty = true;
        }
    }

    pub fn clear_selection(&mut self) {
        if self.selection.take().is_some() {
            for row in self.grid_mut().iter_mut() {
                row.dirty = true;
            }
        }
    }

    /// The selection converted to viewport coordinates, `None` when it is
    /// entirely off-screen.
    pub fn selection_in_viewport(&self) -> Option<Selection> {
        let (start, end) = self.selection?;
        let top = self.scrollback.len().saturating_sub(self.viewport_offset);
        let clamp_row = |row: usize| row.checked_sub(top).filter(|r| *r < self.rows);
        let sel = Selection::new(start, end);
        // Clip to the viewport; rows above map to column 0 of row 0, rows
        // below to the last cell of the last row.
        let (start_row, start_col) = match clamp_row(sel.start_row as usize) {
            Some(r) => (r, sel.start_col as usize),
            None if (sel.start_row as usize) < top => (0, 0),
            None => return None,
        };
        let (end_row, end_col) = match clamp_row(sel.end_row as usize) {
            Some(r) => (r, sel.end_col as usize),
            None if (sel.end_row as usize) < top => return None,
            None => (self.rows - 1, self.cols.saturating_sub(1)),
        };
        Some(Selection::new((start_col, start_row), (end_col, end_row)))
    }

    pub fn set_cursor_style(&mut self, style: CursorStyle) {
        self.cursor.style = style;
    }

    pub fn set_cursor_visible(&mut self, visible: bool) {
        self.cursor.visible = visible;
    }

    /// Clones the visible screen for the renderer and clears the live dirty
    /// flags; the clone keeps them so the renderer can skip its cache for
    /// rows that changed.
    pub fn snapshot(&mut self) -> Screen {
        let mut cursor = self.cursor;
        cursor.x = cursor.x.min(self.cols.saturating_sub(1));
        let viewport_at_bottom = self.viewport_at_bottom();
        let rows = if self.active == ScreenKind::Primary && self.viewport_offset > 0 {
            let mut rows = Vec::with_capacity(self.rows);
            let sb = self.scrollback.len();
            for i in 0..self.rows {
                let abs = sb - self.viewport_offset + i;
                if abs < sb {
                    rows.push(self.scrollback[abs].clone());
                } else {
                    rows.push(self.screen[abs - sb].clone());
                }
            }
            rows
        } else {
            self.grid().clone()
        };
        for row in self.grid_mut().iter_mut() {
            row.dirty = false;
        }
        Screen { cols: self.cols, rows, cursor, viewport_at_bottom }
    }

    /// Resizes both grids. Row content is clipped or padded; new rows get
    /// fresh identities.
    pub fn resize(&mut self, cols: usize, rows: usize) {
        if cols == self.cols && rows == self.rows {
            return;
        }
        self.cols = cols;
        self.rows = rows;
        for kind in [ScreenKind::Primary, ScreenKind::Alternate] {
            let grid = match kind {
                ScreenKind::Primary => &mut self.screen,
                ScreenKind::Alternate => &mut self.alt_screen,
            };
            grid.truncate(rows);
            for row in grid.iter_mut() {
                row.cells.resize(cols, Cell::default());
                row.dirty = true;
            }
            let missing = rows - grid.len();
            for _ in 0..missing {
                let row = self.fresh_row();
                match kind {
                    ScreenKind::Primary => self.screen.push(row),
                    ScreenKind::Alternate => self.alt_screen.push(row),
                }
            }
        }
        self.cursor.x = self.cursor.x.min(cols.saturating_sub(1));
        self.cursor.y = self.cursor.y.min(rows.saturating_sub(1));
        self.selection = None;
    }

    /// The mode flags the key encoder needs, captured for one event.
    pub fn encoder_state(&self) -> EncoderState {
        EncoderState {
            alt_esc_prefix: self.modes.alt_esc_prefix,
            cursor_key_application: self.modes.cursor_key_application,
            keypad_key_application: self.modes.keypad_key_application,
            modify_other_keys_state_2: self.modes.modify_other_keys_state_2,
            kitty_flags: self.kitty_keyboard.flags(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_places_text() {
        let mut term = Terminal::new(10, 3, 100);
        term.feed(b"hi");
        let snap = term.snapshot();
        assert_eq!(snap.rows[0].cells[0].ch, 'h');
        assert_eq!(snap.rows[0].cells[1].ch, 'i');
        assert_eq!(snap.cursor.x, 2);
    }

    #[test]
    fn newline_and_cr() {
        let mut term = Terminal::new(10, 3, 100);
        term.feed(b"a\r\nb");
        let snap = term.snapshot();
        assert_eq!(snap.rows[0].cells[0].ch, 'a');
        assert_eq!(snap.rows[1].cells[0].ch, 'b');
    }

    #[test]
    fn wide_char_occupies_two_cells() {
        let mut term = Terminal::new(10, 3, 100);
        term.put_char('世');
        let snap = term.snapshot();
        assert!(snap.rows[0].cells[0].wide);
        assert!(snap.rows[0].cells[1].wide_continuation);
        assert_eq!(snap.cursor.x, 2);
    }

    #[test]
    fn scroll_preserves_row_identity() {
        let mut term = Terminal::new(4, 2, 100);
        let before: Vec<u64> = term.snapshot().rows.iter().map(|r| r.id).collect();
        term.feed(b"a\nb\nc");
        let after: Vec<u64> = term.snapshot().rows.iter().map(|r| r.id).collect();
        // One scroll: the old second row is now on top, a fresh row below.
        assert_eq!(after[0], before[1]);
        assert_ne!(after[1], before[0]);
        assert_ne!(after[1], before[1]);
    }

    #[test]
    fn snapshot_clears_live_dirty_flags() {
        let mut term = Terminal::new(4, 2, 100);
        term.feed(b"x");
        let snap = term.snapshot();
        assert!(snap.rows[0].dirty);
        let snap2 = term.snapshot();
        assert!(!snap2.rows[0].dirty);
    }

    #[test]
    fn escape_sequences_are_swallowed() {
        let mut term = Terminal::new(10, 2, 100);
        term.feed(b"\x1b[1;31mok\x1b]0;title\x07!");
        let snap = term.snapshot();
        let text: String = snap.rows[0].cells[..3].iter().map(|c| c.ch).collect();
        assert_eq!(text, "ok!");
    }

    #[test]
    fn selection_containment() {
        let sel = Selection::new((2, 1), (3, 2));
        assert!(!sel.contains(5, 0));
        assert!(sel.contains(2, 1));
        assert!(sel.contains(9, 1));
        assert!(sel.contains(0, 2));
        assert!(sel.contains(3, 2));
        assert!(!sel.contains(4, 2));
        assert!(sel.contains_row(1));
        assert!(!sel.contains_row(3));
    }

    #[test]
    fn selection_normalizes_direction() {
        let sel = Selection::new((3, 2), (2, 1));
        assert_eq!((sel.start_col, sel.start_row), (2, 1));
        assert_eq!((sel.end_col, sel.end_row), (3, 2));
    }

    #[test]
    fn alt_screen_round_trip() {
        let mut term = Terminal::new(10, 3, 100);
        term.feed(b"primary");
        term.enter_alt_screen();
        assert_eq!(term.active_screen(), ScreenKind::Alternate);
        term.feed(b"alt");
        let snap = term.snapshot();
        assert_eq!(snap.rows[0].cells[0].ch, 'a');
        term.exit_alt_screen();
        let snap = term.snapshot();
        assert_eq!(snap.rows[0].cells[0].ch, 'p');
    }

    #[test]
    fn scrollback_viewport() {
        let mut term = Terminal::new(4, 2, 100);
        term.feed(b"1\n2\n3\n4");
        assert!(term.viewport_at_bottom());
        term.scroll_viewport(1);
        assert!(!term.viewport_at_bottom());
        let snap = term.snapshot();
        assert_eq!(snap.rows[0].cells[0].ch, '2');
        assert!(!snap.viewport_at_bottom);
        term.scroll_viewport(-5);
        assert!(term.viewport_at_bottom());
    }

    #[test]
    fn selection_converts_to_viewport_coordinates() {
        let mut term = Terminal::new(4, 2, 100);
        term.feed(b"1\n2\n3");
        // Scrollback holds "1"; the screen shows "2" and "3". Select the
        // visible "2" row by its absolute position.
        term.set_selection((0, 1), (1, 1));
        let sel = term.selection_in_viewport().unwrap();
        assert_eq!((sel.start_row, sel.end_row), (0, 0));

        // A selection entirely inside scrollback disappears from view.
        term.set_selection((0, 0), (1, 0));
        assert!(term.selection_in_viewport().is_none());

        // Scrolling back one line brings it into the viewport.
        term.scroll_viewport(1);
        let sel = term.selection_in_viewport().unwrap();
        assert_eq!((sel.start_row, sel.end_row), (0, 0));
    }

    #[test]
    fn resize_keeps_cursor_in_bounds() {
        let mut term = Terminal::new(10, 5, 100);
        term.feed(b"abcdefgh");
        term.resize(4, 2);
        let snap = term.snapshot();
        assert_eq!(snap.cols, 4);
        assert_eq!(snap.rows.len(), 2);
        assert!(snap.cursor.x < 4);
        assert!(snap.cursor.y < 2);
    }
}
