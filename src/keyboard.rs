//! Keyboard protocol encoding.
//!
//! Translates one keyboard event plus terminal mode state into the byte
//! sequence written to the PTY. Four overlapping protocols are implemented:
//! the traditional PC-style sequences, xterm's modifyOtherKeys (state 2),
//! fixterms CSI u, and the Kitty keyboard protocol as specified at
//! https://sw.kovidgoyal.net/kitty/keyboard-protocol/

use std::collections::HashMap;
use std::sync::OnceLock;

use bitflags::bitflags;
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// The caller-provided buffer cannot hold the sequence. Callers are
    /// expected to provide at least 128 bytes.
    #[error("output buffer too small for key sequence")]
    BufferTooSmall,
}

bitflags! {
    /// Keyboard modifier state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Mods: u8 {
        const SHIFT = 1;
        const ALT = 2;
        const CTRL = 4;
        const SUPER = 8;
        const HYPER = 16;
        const META = 32;
        const CAPS_LOCK = 64;
        const NUM_LOCK = 128;
    }
}

impl Mods {
    /// Modifier parameter for CSI u / PC-style sequences: 3-bit mask + 1.
    pub fn csi_u_param(self) -> u32 {
        1 + (self.bits() & 0b111) as u32
    }

    /// Modifier parameter for the Kitty protocol: full 8-bit mask + 1.
    pub fn kitty_param(self) -> u32 {
        1 + self.bits() as u32
    }
}

bitflags! {
    /// Kitty keyboard protocol enhancement flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct KittyFlags: u8 {
        /// Report Esc, alt+key, ctrl+key unambiguously as CSI u.
        const DISAMBIGUATE = 0b00001;
        /// Report key repeat and release events.
        const REPORT_EVENTS = 0b00010;
        /// Report the shifted key alongside the base key.
        const REPORT_ALTERNATES = 0b00100;
        /// Report all keys as escape codes, including text-generating ones.
        const REPORT_ALL = 0b01000;
        /// Report the text associated with a key event.
        const REPORT_ASSOCIATED = 0b10000;
    }
}

/// What happened to the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Press,
    Repeat,
    Release,
}

/// Logical keys. Character-producing keys carry their unshifted character;
/// everything else is named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    Unidentified,
    Char(char),
    Enter,
    Tab,
    Backspace,
    Escape,
    Insert,
    Delete,
    Home,
    End,
    PageUp,
    PageDown,
    Left,
    Right,
    Up,
    Down,
    F1,
    F2,
    F3,
    F4,
    F5,
    F6,
    F7,
    F8,
    F9,
    F10,
    F11,
    F12,
    CapsLock,
    ScrollLock,
    NumLock,
    PrintScreen,
    Pause,
    Menu,
    Kp0,
    Kp1,
    Kp2,
    Kp3,
    Kp4,
    Kp5,
    Kp6,
    Kp7,
    Kp8,
    Kp9,
    KpDecimal,
    KpDivide,
    KpMultiply,
    KpSubtract,
    KpAdd,
    KpEnter,
    KpEqual,
    LeftShift,
    LeftControl,
    LeftAlt,
    LeftSuper,
    LeftHyper,
    LeftMeta,
    RightShift,
    RightControl,
    RightAlt,
    RightSuper,
    RightHyper,
    RightMeta,
    IsoLevel3Shift,
    IsoLevel5Shift,
    MediaPlay,
    MediaPause,
    MediaPlayPause,
    MediaStop,
    MediaTrackNext,
    MediaTrackPrevious,
    LowerVolume,
    RaiseVolume,
    MuteVolume,
}

/// A single keyboard event as delivered by the windowing layer.
#[derive(Debug, Clone)]
pub struct KeyEvent<'a> {
    pub key: Key,
    pub action: KeyAction,
    pub mods: Mods,
    /// The text the OS says this event produces. May be empty or contain
    /// several codepoints.
    pub utf8: &'a str,
    /// The codepoint this key would produce without shift, 0 if unknown.
    pub unshifted_codepoint: u32,
    /// True while an IME dead-key composition is in progress.
    pub composing: bool,
}

impl<'a> KeyEvent<'a> {
    /// Modifiers with the lock keys stripped. Caps/num lock never change
    /// which sequence a key produces.
    pub fn effective_mods(&self) -> Mods {
        self.mods - (Mods::CAPS_LOCK | Mods::NUM_LOCK)
    }

    /// Modifiers used for table lookups: the effective set restricted to
    /// the binding modifiers.
    pub fn binding_mods(&self) -> Mods {
        self.effective_mods() & (Mods::SHIFT | Mods::ALT | Mods::CTRL | Mods::SUPER)
    }

    /// The single codepoint of `utf8`, if it is exactly one.
    fn utf8_codepoint(&self) -> Option<u32> {
        let mut chars = self.utf8.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Some(c as u32),
            _ => None,
        }
    }
}

/// Terminal mode flags consulted by the encoder. Constructed per event from
/// the terminal state and discarded with the encoder.
#[derive(Debug, Clone, Copy)]
pub struct EncoderState {
    /// Prefix alt-modified text keys with ESC.
    pub alt_esc_prefix: bool,
    /// DECCKM: arrows send SS3 instead of CSI.
    pub cursor_key_application: bool,
    /// DECKPAM: keypad keys send SS3 sequences.
    pub keypad_key_application: bool,
    /// xterm modifyOtherKeys, state 2.
    pub modify_other_keys_state_2: bool,
    /// Kitty keyboard protocol flags currently in effect.
    pub kitty_flags: KittyFlags,
}

impl Default for EncoderState {
    fn default() -> Self {
        Self {
            alt_esc_prefix: true,
            cursor_key_application: false,
            keypad_key_application: false,
            modify_other_keys_state_2: false,
            kitty_flags: KittyFlags::empty(),
        }
    }
}

// ─── function key table ────────────────────────────────────────────────────

/// Requirement on the DECCKM cursor key mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorMode {
    Any,
    Normal,
    Application,
}

/// Requirement on the keypad application mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeypadMode {
    Any,
    Normal,
    Application,
}

/// Requirement on the modifyOtherKeys state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModifyKeys {
    Any,
    Set,
    SetOther,
}

/// One candidate sequence for a named key. The first entry whose mode
/// requirements hold and whose mods equal the event's binding mods wins.
#[derive(Debug, Clone)]
struct FunctionKeyEntry {
    mods: Mods,
    /// An entry with empty `mods` normally matches only an unmodified
    /// press; with this bit it matches any modifier state.
    mods_empty_is_any: bool,
    cursor: CursorMode,
    keypad: KeypadMode,
    modify_other_keys: ModifyKeys,
    sequence: String,
}

impl FunctionKeyEntry {
    fn matches(&self, binding_mods: Mods, state: &EncoderState) -> bool {
        match self.cursor {
            CursorMode::Any => {}
            CursorMode::Normal if state.cursor_key_application => return false,
            CursorMode::Application if !state.cursor_key_application => return false,
            _ => {}
        }
        match self.keypad {
            KeypadMode::Any => {}
            KeypadMode::Normal if state.keypad_key_application => return false,
            KeypadMode::Application if !state.keypad_key_application => return false,
            _ => {}
        }
        match self.modify_other_keys {
            ModifyKeys::Any => {}
            ModifyKeys::Set if !state.modify_other_keys_state_2 => return false,
            ModifyKeys::SetOther if state.modify_other_keys_state_2 => return false,
            _ => {}
        }
        if self.mods.is_empty() && self.mods_empty_is_any {
            return true;
        }
        self.mods == binding_mods
    }
}

/// Shift/alt/ctrl combinations in xterm parameter order: index i encodes
/// as modifier parameter i + 2.
fn mod_combos() -> [Mods; 7] {
    [
        Mods::SHIFT,
        Mods::ALT,
        Mods::SHIFT | Mods::ALT,
        Mods::CTRL,
        Mods::SHIFT | Mods::CTRL,
        Mods::ALT | Mods::CTRL,
        Mods::SHIFT | Mods::ALT | Mods::CTRL,
    ]
}

fn plain(sequence: &str, cursor: CursorMode, keypad: KeypadMode) -> FunctionKeyEntry {
    FunctionKeyEntry {
        mods: Mods::empty(),
        mods_empty_is_any: false,
        cursor,
        keypad,
        modify_other_keys: ModifyKeys::Any,
        sequence: sequence.to_string(),
    }
}

fn modified(mods: Mods, sequence: String) -> FunctionKeyEntry {
    FunctionKeyEntry {
        mods,
        mods_empty_is_any: false,
        cursor: CursorMode::Any,
        keypad: KeypadMode::Any,
        modify_other_keys: ModifyKeys::Any,
        sequence,
    }
}

/// SS3 in application cursor mode, CSI otherwise, `CSI 1;m F` when modified.
fn cursor_key(final_byte: char) -> Vec<FunctionKeyEntry> {
    let mut entries = vec![
        plain(&format!("\x1bO{final_byte}"), CursorMode::Application, KeypadMode::Any),
        plain(&format!("\x1b[{final_byte}"), CursorMode::Normal, KeypadMode::Any),
    ];
    for (i, mods) in mod_combos().into_iter().enumerate() {
        entries.push(modified(mods, format!("\x1b[1;{}{final_byte}", i + 2)));
    }
    entries
}

/// SS3 without modifiers, `CSI 1;m F` with.
fn ss3_key(final_byte: char) -> Vec<FunctionKeyEntry> {
    let mut entries = vec![plain(&format!("\x1bO{final_byte}"), CursorMode::Any, KeypadMode::Any)];
    for (i, mods) in mod_combos().into_iter().enumerate() {
        entries.push(modified(mods, format!("\x1b[1;{}{final_byte}", i + 2)));
    }
    entries
}

/// `CSI n ~` without modifiers, `CSI n;m ~` with.
fn tilde_key(number: u32) -> Vec<FunctionKeyEntry> {
    let mut entries = vec![plain(&format!("\x1b[{number}~"), CursorMode::Any, KeypadMode::Any)];
    for (i, mods) in mod_combos().into_iter().enumerate() {
        entries.push(modified(mods, format!("\x1b[{number};{}~", i + 2)));
    }
    entries
}

/// SS3 sequence sent only in keypad application mode, regardless of mods.
fn keypad_app(final_byte: char) -> Vec<FunctionKeyEntry> {
    vec![FunctionKeyEntry {
        mods: Mods::empty(),
        mods_empty_is_any: true,
        cursor: CursorMode::Any,
        keypad: KeypadMode::Application,
        modify_other_keys: ModifyKeys::Any,
        sequence: format!("\x1bO{final_byte}"),
    }]
}

fn build_function_keys() -> HashMap<Key, Vec<FunctionKeyEntry>> {
    let mut table = HashMap::new();

    table.insert(Key::Up, cursor_key('A'));
    table.insert(Key::Down, cursor_key('B'));
    table.insert(Key::Right, cursor_key('C'));
    table.insert(Key::Left, cursor_key('D'));
    table.insert(Key::Home, cursor_key('H'));
    table.insert(Key::End, cursor_key('F'));

    table.insert(Key::F1, ss3_key('P'));
    table.insert(Key::F2, ss3_key('Q'));
    table.insert(Key::F3, ss3_key('R'));
    table.insert(Key::F4, ss3_key('S'));
    table.insert(Key::F5, tilde_key(15));
    table.insert(Key::F6, tilde_key(17));
    table.insert(Key::F7, tilde_key(18));
    table.insert(Key::F8, tilde_key(19));
    table.insert(Key::F9, tilde_key(20));
    table.insert(Key::F10, tilde_key(21));
    table.insert(Key::F11, tilde_key(23));
    table.insert(Key::F12, tilde_key(24));

    table.insert(Key::Insert, tilde_key(2));
    table.insert(Key::Delete, tilde_key(3));
    table.insert(Key::PageUp, tilde_key(5));
    table.insert(Key::PageDown, tilde_key(6));

    table.insert(
        Key::Enter,
        vec![plain("\r", CursorMode::Any, KeypadMode::Any)],
    );
    table.insert(
        Key::Tab,
        vec![
            plain("\t", CursorMode::Any, KeypadMode::Any),
            modified(Mods::SHIFT, "\x1b[Z".to_string()),
        ],
    );
    table.insert(
        Key::Backspace,
        vec![
            plain("\x7f", CursorMode::Any, KeypadMode::Any),
            // Ctrl swaps DEL for BS; under modifyOtherKeys the modified key
            // reports through the CSI 27 path instead.
            FunctionKeyEntry {
                mods: Mods::CTRL,
                mods_empty_is_any: false,
                cursor: CursorMode::Any,
                keypad: KeypadMode::Any,
                modify_other_keys: ModifyKeys::SetOther,
                sequence: "\x08".to_string(),
            },
        ],
    );
    table.insert(
        Key::Escape,
        vec![plain("\x1b", CursorMode::Any, KeypadMode::Any)],
    );

    table.insert(Key::Kp0, keypad_app('p'));
    table.insert(Key::Kp1, keypad_app('q'));
    table.insert(Key::Kp2, keypad_app('r'));
    table.insert(Key::Kp3, keypad_app('s'));
    table.insert(Key::Kp4, keypad_app('t'));
    table.insert(Key::Kp5, keypad_app('u'));
    table.insert(Key::Kp6, keypad_app('v'));
    table.insert(Key::Kp7, keypad_app('w'));
    table.insert(Key::Kp8, keypad_app('x'));
    table.insert(Key::Kp9, keypad_app('y'));
    table.insert(Key::KpDecimal, keypad_app('n'));
    table.insert(Key::KpDivide, keypad_app('o'));
    table.insert(Key::KpMultiply, keypad_app('j'));
    table.insert(Key::KpSubtract, keypad_app('m'));
    table.insert(Key::KpAdd, keypad_app('k'));
    table.insert(Key::KpEqual, keypad_app('X'));
    let mut kp_enter = keypad_app('M');
    kp_enter.push(FunctionKeyEntry {
        mods: Mods::empty(),
        mods_empty_is_any: true,
        cursor: CursorMode::Any,
        keypad: KeypadMode::Normal,
        modify_other_keys: ModifyKeys::Any,
        sequence: "\r".to_string(),
    });
    table.insert(Key::KpEnter, kp_enter);

    table
}

fn function_keys() -> &'static HashMap<Key, Vec<FunctionKeyEntry>> {
    static TABLE: OnceLock<HashMap<Key, Vec<FunctionKeyEntry>>> = OnceLock::new();
    TABLE.get_or_init(build_function_keys)
}

/// The modifyOtherKeys modifier table: row index + 2 is the parameter
/// reported in `CSI 27 ; n ; cp ~`. Matches xterm's table.
fn modify_other_rows() -> [Mods; 15] {
    let s = Mods::SHIFT;
    let a = Mods::ALT;
    let c = Mods::CTRL;
    let m = Mods::META;
    [
        s,
        a,
        s | a,
        c,
        s | c,
        a | c,
        s | a | c,
        m,
        m | s,
        m | a,
        m | a | s,
        m | c,
        m | c | s,
        m | c | a,
        m | c | a | s,
    ]
}

// ─── Kitty functional key table ────────────────────────────────────────────

/// One Kitty protocol table entry. `final_byte` selects the encoded form:
/// 'u' and '~' take the full CSI u grammar, everything else the short
/// `CSI 1;mods F` form.
#[derive(Debug, Clone, Copy)]
struct KittyEntry {
    key: Key,
    code: u32,
    final_byte: u8,
    /// Modifier keys keep reporting while an IME composition is active.
    modifier: bool,
}

const fn kitty_entry(key: Key, code: u32, final_byte: u8) -> KittyEntry {
    KittyEntry { key, code, final_byte, modifier: false }
}

const fn kitty_modifier(key: Key, code: u32) -> KittyEntry {
    KittyEntry { key, code, final_byte: b'u', modifier: true }
}

static KITTY_TABLE: &[KittyEntry] = &[
    kitty_entry(Key::Escape, 27, b'u'),
    kitty_entry(Key::Enter, 13, b'u'),
    kitty_entry(Key::Tab, 9, b'u'),
    kitty_entry(Key::Backspace, 127, b'u'),
    kitty_entry(Key::Insert, 2, b'~'),
    kitty_entry(Key::Delete, 3, b'~'),
    kitty_entry(Key::Left, 1, b'D'),
    kitty_entry(Key::Right, 1, b'C'),
    kitty_entry(Key::Up, 1, b'A'),
    kitty_entry(Key::Down, 1, b'B'),
    kitty_entry(Key::PageUp, 5, b'~'),
    kitty_entry(Key::PageDown, 6, b'~'),
    kitty_entry(Key::Home, 1, b'H'),
    kitty_entry(Key::End, 1, b'F'),
    kitty_entry(Key::CapsLock, 57358, b'u'),
    kitty_entry(Key::ScrollLock, 57359, b'u'),
    kitty_entry(Key::NumLock, 57360, b'u'),
    kitty_entry(Key::PrintScreen, 57361, b'u'),
    kitty_entry(Key::Pause, 57362, b'u'),
    kitty_entry(Key::Menu, 57363, b'u'),
    kitty_entry(Key::F1, 1, b'P'),
    kitty_entry(Key::F2, 1, b'Q'),
    // F3 moved off CSI R to avoid colliding with cursor position reports.
    kitty_entry(Key::F3, 13, b'~'),
    kitty_entry(Key::F4, 1, b'S'),
    kitty_entry(Key::F5, 15, b'~'),
    kitty_entry(Key::F6, 17, b'~'),
    kitty_entry(Key::F7, 18, b'~'),
    kitty_entry(Key::F8, 19, b'~'),
    kitty_entry(Key::F9, 20, b'~'),
    kitty_entry(Key::F10, 21, b'~'),
    kitty_entry(Key::F11, 23, b'~'),
    kitty_entry(Key::F12, 24, b'~'),
    kitty_entry(Key::Kp0, 57399, b'u'),
    kitty_entry(Key::Kp1, 57400, b'u'),
    kitty_entry(Key::Kp2, 57401, b'u'),
    kitty_entry(Key::Kp3, 57402, b'u'),
    kitty_entry(Key::Kp4, 57403, b'u'),
    kitty_entry(Key::Kp5, 57404, b'u'),
    kitty_entry(Key::Kp6, 57405, b'u'),
    kitty_entry(Key::Kp7, 57406, b'u'),
    kitty_entry(Key::Kp8, 57407, b'u'),
    kitty_entry(Key::Kp9, 57408, b'u'),
    kitty_entry(Key::KpDecimal, 57409, b'u'),
    kitty_entry(Key::KpDivide, 57410, b'u'),
    kitty_entry(Key::KpMultiply, 57411, b'u'),
    kitty_entry(Key::KpSubtract, 57412, b'u'),
    kitty_entry(Key::KpAdd, 57413, b'u'),
    kitty_entry(Key::KpEnter, 57414, b'u'),
    kitty_entry(Key::KpEqual, 57415, b'u'),
    kitty_entry(Key::MediaPlay, 57428, b'u'),
    kitty_entry(Key::MediaPause, 57429, b'u'),
    kitty_entry(Key::MediaPlayPause, 57430, b'u'),
    kitty_entry(Key::MediaStop, 57432, b'u'),
    kitty_entry(Key::MediaTrackNext, 57435, b'u'),
    kitty_entry(Key::MediaTrackPrevious, 57436, b'u'),
    kitty_entry(Key::LowerVolume, 57438, b'u'),
    kitty_entry(Key::RaiseVolume, 57439, b'u'),
    kitty_entry(Key::MuteVolume, 57440, b'u'),
    kitty_modifier(Key::LeftShift, 57441),
    kitty_modifier(Key::LeftControl, 57442),
    kitty_modifier(Key::LeftAlt, 57443),
    kitty_modifier(Key::LeftSuper, 57444),
    kitty_modifier(Key::LeftHyper, 57445),
    kitty_modifier(Key::LeftMeta, 57446),
    kitty_modifier(Key::RightShift, 57447),
    kitty_modifier(Key::RightControl, 57448),
    kitty_modifier(Key::RightAlt, 57449),
    kitty_modifier(Key::RightSuper, 57450),
    kitty_modifier(Key::RightHyper, 57451),
    kitty_modifier(Key::RightMeta, 57452),
    kitty_modifier(Key::IsoLevel3Shift, 57453),
    kitty_modifier(Key::IsoLevel5Shift, 57454),
];

fn kitty_lookup(key: Key) -> Option<KittyEntry> {
    KITTY_TABLE.iter().copied().find(|e| e.key == key)
}

// ─── sequence writer ───────────────────────────────────────────────────────

/// Writes a sequence into a caller-provided buffer, surfacing
/// `BufferTooSmall` instead of truncating.
struct SeqWriter<'b> {
    buf: &'b mut [u8],
    len: usize,
}

impl<'b> SeqWriter<'b> {
    fn new(buf: &'b mut [u8]) -> Self {
        Self { buf, len: 0 }
    }

    fn push(&mut self, byte: u8) -> Result<(), EncodeError> {
        if self.len == self.buf.len() {
            return Err(EncodeError::BufferTooSmall);
        }
        self.buf[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    fn push_bytes(&mut self, bytes: &[u8]) -> Result<(), EncodeError> {
        for &b in bytes {
            self.push(b)?;
        }
        Ok(())
    }

    fn push_str(&mut self, s: &str) -> Result<(), EncodeError> {
        self.push_bytes(s.as_bytes())
    }

    fn push_u32(&mut self, value: u32) -> Result<(), EncodeError> {
        let mut digits = [0u8; 10];
        let mut rest = value;
        let mut n = 0;
        loop {
            digits[n] = b'0' + (rest % 10) as u8;
            rest /= 10;
            n += 1;
            if rest == 0 {
                break;
            }
        }
        while n > 0 {
            n -= 1;
            self.push(digits[n])?;
        }
        Ok(())
    }

    fn finish(self) -> &'b [u8] {
        &self.buf[..self.len]
    }
}

// ─── the encoder ───────────────────────────────────────────────────────────

/// Event type parameter values in the Kitty protocol.
const KITTY_EVENT_PRESS: u32 = 1;
const KITTY_EVENT_REPEAT: u32 = 2;
const KITTY_EVENT_RELEASE: u32 = 3;

/// A Kitty protocol sequence under construction.
#[derive(Debug, Default)]
struct KittySequence<'a> {
    key: u32,
    final_byte: u8,
    mods: u32,
    event: Option<u32>,
    alternate: Option<u32>,
    text: &'a str,
}

/// Encodes one key event. Constructed per event and discarded; holds no
/// state beyond the borrowed event and mode flags.
pub struct KeyEncoder<'a> {
    event: &'a KeyEvent<'a>,
    state: EncoderState,
}

impl<'a> KeyEncoder<'a> {
    pub fn new(event: &'a KeyEvent<'a>, state: EncoderState) -> Self {
        Self { event, state }
    }

    /// Encodes the event into `buf` and returns the written prefix. An
    /// empty slice means the event must not emit anything.
    pub fn encode<'b>(&self, buf: &'b mut [u8]) -> Result<&'b [u8], EncodeError> {
        if self.state.kitty_flags.is_empty() {
            self.legacy(buf)
        } else {
            self.kitty(buf)
        }
    }

    fn legacy<'b>(&self, buf: &'b mut [u8]) -> Result<&'b [u8], EncodeError> {
        let event = self.event;
        if event.action == KeyAction::Release {
            return Ok(&buf[..0]);
        }
        if event.composing {
            return Ok(&buf[..0]);
        }

        let binding_mods = event.binding_mods();

        // PC-style function keys.
        if let Some(entries) = function_keys().get(&event.key) {
            if let Some(entry) = entries.iter().find(|e| e.matches(binding_mods, &self.state)) {
                let mut w = SeqWriter::new(buf);
                w.push_str(&entry.sequence)?;
                return Ok(w.finish());
            }
        }

        // C0 control characters. Only a bare ctrl (alt may ride along as an
        // ESC prefix) selects this path.
        if binding_mods - Mods::ALT == Mods::CTRL {
            if let Some(byte) = self.ctrl_seq() {
                let mut w = SeqWriter::new(buf);
                if binding_mods.contains(Mods::ALT) {
                    w.push(0x1b)?;
                }
                w.push(byte)?;
                return Ok(w.finish());
            }
        }

        if event.utf8.is_empty() {
            return Ok(&buf[..0]);
        }

        // xterm modifyOtherKeys state 2.
        if self.state.modify_other_keys_state_2 {
            if let Some(cp) = event.utf8_codepoint() {
                if should_modify(cp, binding_mods) {
                    if let Some(row) = modify_other_rows().iter().position(|&m| m == binding_mods)
                    {
                        let mut w = SeqWriter::new(buf);
                        w.push_str("\x1b[27;")?;
                        w.push_u32(row as u32 + 2)?;
                        w.push(b';')?;
                        w.push_u32(cp)?;
                        w.push(b'~')?;
                        return Ok(w.finish());
                    }
                }
            }
        }

        // Fixterms CSI u. Reports the raw first byte of the produced text;
        // full mods so shift is visible to the application.
        if event.mods.contains(Mods::CTRL) {
            let mut w = SeqWriter::new(buf);
            w.push_str("\x1b[")?;
            w.push_u32(event.utf8.as_bytes()[0] as u32)?;
            w.push(b';')?;
            w.push_u32(event.mods.csi_u_param())?;
            w.push(b'u')?;
            return Ok(w.finish());
        }

        let mut w = SeqWriter::new(buf);
        if binding_mods.contains(Mods::ALT) && self.state.alt_esc_prefix {
            w.push(0x1b)?;
        }
        w.push_str(event.utf8)?;
        Ok(w.finish())
    }

    /// The hardcoded C0 byte for ctrl+key. `i`, `m` and `[` are absent on
    /// purpose: their control codes alias tab, enter and escape, and the
    /// fixterms path reports them unambiguously instead. The digit rows
    /// match xterm on US layouts rather than anything derivable.
    fn ctrl_seq(&self) -> Option<u8> {
        let c = match self.event.key {
            Key::Char(c) => c.to_ascii_lowercase(),
            _ => return None,
        };
        Some(match c {
            ' ' | '@' | '2' => 0x00,
            'a' => 0x01,
            'b' => 0x02,
            'c' => 0x03,
            'd' => 0x04,
            'e' => 0x05,
            'f' => 0x06,
            'g' => 0x07,
            'h' => 0x08,
            'j' => 0x0a,
            'k' => 0x0b,
            'l' => 0x0c,
            'n' => 0x0e,
            'o' => 0x0f,
            'p' => 0x10,
            'q' => 0x11,
            'r' => 0x12,
            's' => 0x13,
            't' => 0x14,
            'u' => 0x15,
            'v' => 0x16,
            'w' => 0x17,
            'x' => 0x18,
            'y' => 0x19,
            'z' => 0x1a,
            '3' => 0x1b,
            '4' | '\\' => 0x1c,
            '5' | ']' => 0x1d,
            '6' | '^' => 0x1e,
            '7' | '/' | '_' => 0x1f,
            '8' | '?' => 0x7f,
            _ => return None,
        })
    }

    fn kitty<'b>(&self, buf: &'b mut [u8]) -> Result<&'b [u8], EncodeError> {
        let event = self.event;
        let flags = self.state.kitty_flags;

        if event.action == KeyAction::Release && !flags.contains(KittyFlags::REPORT_EVENTS) {
            return Ok(&buf[..0]);
        }

        let entry = kitty_lookup(event.key).or_else(|| {
            (event.unshifted_codepoint > 0).then(|| KittyEntry {
                key: event.key,
                code: event.unshifted_codepoint,
                final_byte: b'u',
                modifier: false,
            })
        });

        // Modifier keys keep reporting during an IME composition; nothing
        // else does.
        if event.composing && !entry.map(|e| e.modifier).unwrap_or(false) {
            return Ok(&buf[..0]);
        }

        if !flags.contains(KittyFlags::REPORT_ALL) {
            if event.effective_mods().is_empty() {
                let legacy = match event.key {
                    Key::Enter => Some("\r"),
                    Key::Tab => Some("\t"),
                    Key::Backspace => Some("\x7f"),
                    _ => None,
                };
                if let Some(seq) = legacy {
                    let mut w = SeqWriter::new(buf);
                    w.push_str(seq)?;
                    return Ok(w.finish());
                }
            }
            if !event.utf8.is_empty()
                && event.binding_mods().is_empty()
                && event.action != KeyAction::Release
            {
                let mut w = SeqWriter::new(buf);
                w.push_str(event.utf8)?;
                return Ok(w.finish());
            }
        }

        let Some(entry) = entry else {
            return Ok(&buf[..0]);
        };

        let mut seq = KittySequence {
            key: entry.code,
            final_byte: entry.final_byte,
            mods: event.mods.kitty_param(),
            event: None,
            alternate: None,
            text: "",
        };
        if flags.contains(KittyFlags::REPORT_EVENTS) {
            // Press carries an explicit :1 event tag rather than being
            // omitted. Consumers depend on this; do not "fix" it.
            seq.event = Some(match event.action {
                KeyAction::Press => KITTY_EVENT_PRESS,
                KeyAction::Repeat => KITTY_EVENT_REPEAT,
                KeyAction::Release => KITTY_EVENT_RELEASE,
            });
        }
        if flags.contains(KittyFlags::REPORT_ALTERNATES) {
            if let Some(cp) = event.utf8_codepoint() {
                if cp != seq.key {
                    seq.alternate = Some(cp);
                }
            }
        }
        if flags.contains(KittyFlags::REPORT_ASSOCIATED) {
            seq.text = event.utf8;
        }

        let mut w = SeqWriter::new(buf);
        match seq.final_byte {
            b'u' | b'~' => Self::write_full(&seq, &mut w)?,
            _ => Self::write_special(&seq, &mut w)?,
        }
        Ok(w.finish())
    }

    /// Full CSI u grammar:
    /// `ESC [ key (:alt)* [; mods [:event]] [;[;] text-codepoints] final`.
    fn write_full(seq: &KittySequence, w: &mut SeqWriter) -> Result<(), EncodeError> {
        w.push_str("\x1b[")?;
        w.push_u32(seq.key)?;
        if let Some(alt) = seq.alternate {
            w.push(b':')?;
            w.push_u32(alt)?;
        }
        let mods_section = seq.event.is_some() || seq.mods > 1;
        if mods_section {
            w.push(b';')?;
            w.push_u32(seq.mods)?;
            if let Some(ev) = seq.event {
                w.push(b':')?;
                w.push_u32(ev)?;
            }
        }
        if !seq.text.is_empty() {
            if !mods_section {
                // Placeholder keeps the text parameter positional.
                w.push(b';')?;
            }
            w.push(b';')?;
            for (i, cp) in seq.text.chars().enumerate() {
                if i > 0 {
                    w.push(b':')?;
                }
                w.push_u32(cp as u32)?;
            }
        }
        w.push(seq.final_byte)
    }

    /// Short form for keys with a legacy CSI final byte.
    fn write_special(seq: &KittySequence, w: &mut SeqWriter) -> Result<(), EncodeError> {
        w.push_str("\x1b[")?;
        if let Some(ev) = seq.event {
            w.push_str("1;")?;
            w.push_u32(seq.mods)?;
            w.push(b':')?;
            w.push_u32(ev)?;
        } else if seq.mods > 1 {
            w.push_str("1;")?;
            w.push_u32(seq.mods)?;
        }
        w.push(seq.final_byte)
    }
}

/// xterm's rule for which printable keys modifyOtherKeys state 2 rewrites.
fn should_modify(cp: u32, binding_mods: Mods) -> bool {
    if (0x40..=0x7f).contains(&cp) {
        return true;
    }
    if !(binding_mods - Mods::SHIFT).is_empty() {
        return true;
    }
    cp == ' ' as u32 && binding_mods == Mods::SHIFT
}

// ─── kitty protocol state ──────────────────────────────────────────────────

/// Kitty keyboard flag state for one screen, with the push/pop stack the
/// protocol requires.
#[derive(Debug, Clone, Default)]
pub struct KittyKeyboardState {
    flags: KittyFlags,
    stack: Vec<KittyFlags>,
}

impl KittyKeyboardState {
    /// Stack depth cap; the oldest entry is evicted beyond this.
    const MAX_STACK: usize = 16;

    pub fn flags(&self) -> KittyFlags {
        self.flags
    }

    /// `CSI = flags ; mode u`. Mode 1 replaces, 2 sets bits, 3 clears bits.
    pub fn set_flags(&mut self, flags: u8, mode: u8) {
        let flags = KittyFlags::from_bits_truncate(flags);
        match mode {
            2 => self.flags |= flags,
            3 => self.flags &= !flags,
            _ => self.flags = flags,
        }
    }

    /// `CSI > flags u`: push the current flags and install new ones.
    pub fn push(&mut self, flags: u8) {
        if self.stack.len() >= Self::MAX_STACK {
            self.stack.remove(0);
        }
        self.stack.push(self.flags);
        self.flags = KittyFlags::from_bits_truncate(flags);
    }

    /// `CSI < n u`: pop `n` entries. Popping past the bottom clears all
    /// flags.
    pub fn pop(&mut self, count: usize) {
        for _ in 0..count.max(1) {
            match self.stack.pop() {
                Some(flags) => self.flags = flags,
                None => {
                    self.flags = KittyFlags::empty();
                    break;
                }
            }
        }
    }

    /// Response to a `CSI ? u` query.
    pub fn query_response(&self) -> Vec<u8> {
        format!("\x1b[?{}u", self.flags.bits()).into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event<'a>(key: Key, mods: Mods, utf8: &'a str, unshifted: u32) -> KeyEvent<'a> {
        KeyEvent {
            key,
            action: KeyAction::Press,
            mods,
            utf8,
            unshifted_codepoint: unshifted,
            composing: false,
        }
    }

    fn encode(event: &KeyEvent, state: EncoderState) -> Vec<u8> {
        let mut buf = [0u8; 128];
        let out = KeyEncoder::new(event, state)
            .encode(&mut buf)
            .expect("buffer large enough");
        out.to_vec()
    }

    fn kitty_state(flags: KittyFlags) -> EncoderState {
        EncoderState { kitty_flags: flags, ..Default::default() }
    }

    #[test]
    fn legacy_ctrl_c() {
        let ev = event(Key::Char('c'), Mods::CTRL, "\x03", 'c' as u32);
        assert_eq!(encode(&ev, EncoderState::default()), vec![0x03]);
    }

    #[test]
    fn legacy_ctrl_alt_c() {
        let ev = event(Key::Char('c'), Mods::CTRL | Mods::ALT, "\x03", 'c' as u32);
        assert_eq!(encode(&ev, EncoderState::default()), vec![0x1b, 0x03]);
    }

    #[test]
    fn legacy_ctrl_i_uses_fixterms() {
        // i is excluded from the C0 table, so ctrl+i reports through CSI u
        // instead of aliasing tab.
        let ev = event(Key::Char('i'), Mods::CTRL, "i", 'i' as u32);
        assert_eq!(encode(&ev, EncoderState::default()), b"\x1b[105;5u");
    }

    #[test]
    fn legacy_fixterms_reports_shift() {
        let ev = event(Key::Char('h'), Mods::CTRL | Mods::SHIFT, "H", 'h' as u32);
        assert_eq!(encode(&ev, EncoderState::default()), b"\x1b[72;6u");
    }

    #[test]
    fn legacy_fixterms_uses_first_byte_of_multibyte_text() {
        // Deliberate: the raw first byte, not the decoded codepoint.
        let ev = event(Key::Char('é'), Mods::CTRL, "é", 'é' as u32);
        assert_eq!(encode(&ev, EncoderState::default()), b"\x1b[195;5u");
    }

    #[test]
    fn modify_other_keys_ctrl_shift_h() {
        let ev = event(Key::Char('h'), Mods::CTRL | Mods::SHIFT, "H", 'h' as u32);
        let state = EncoderState { modify_other_keys_state_2: true, ..Default::default() };
        assert_eq!(encode(&ev, state), b"\x1b[27;6;72~");
    }

    #[test]
    fn modify_other_keys_shift_space() {
        let ev = event(Key::Char(' '), Mods::SHIFT, " ", ' ' as u32);
        let state = EncoderState { modify_other_keys_state_2: true, ..Default::default() };
        assert_eq!(encode(&ev, state), b"\x1b[27;2;32~");
    }

    #[test]
    fn modify_other_keys_ignores_plain_text() {
        let ev = event(Key::Char('a'), Mods::empty(), "a", 'a' as u32);
        let state = EncoderState { modify_other_keys_state_2: true, ..Default::default() };
        assert_eq!(encode(&ev, state), b"a");
    }

    #[test]
    fn legacy_release_is_empty() {
        let mut ev = event(Key::Char('a'), Mods::empty(), "a", 'a' as u32);
        ev.action = KeyAction::Release;
        assert!(encode(&ev, EncoderState::default()).is_empty());
    }

    #[test]
    fn legacy_composing_is_empty() {
        let mut ev = event(Key::Char('a'), Mods::empty(), "a", 'a' as u32);
        ev.composing = true;
        assert!(encode(&ev, EncoderState::default()).is_empty());
    }

    #[test]
    fn legacy_alt_prefixes_escape() {
        let ev = event(Key::Char('x'), Mods::ALT, "x", 'x' as u32);
        assert_eq!(encode(&ev, EncoderState::default()), b"\x1bx");
    }

    #[test]
    fn legacy_alt_without_esc_prefix_mode() {
        let ev = event(Key::Char('x'), Mods::ALT, "x", 'x' as u32);
        let state = EncoderState { alt_esc_prefix: false, ..Default::default() };
        assert_eq!(encode(&ev, state), b"x");
    }

    #[test]
    fn arrow_modes() {
        let ev = event(Key::Up, Mods::empty(), "", 0);
        assert_eq!(encode(&ev, EncoderState::default()), b"\x1b[A");
        let state = EncoderState { cursor_key_application: true, ..Default::default() };
        assert_eq!(encode(&ev, state), b"\x1bOA");
    }

    #[test]
    fn arrow_with_mods_is_pc_style_in_both_modes() {
        let ev = event(Key::Up, Mods::CTRL, "", 0);
        assert_eq!(encode(&ev, EncoderState::default()), b"\x1b[1;5A");
        let state = EncoderState { cursor_key_application: true, ..Default::default() };
        assert_eq!(encode(&ev, state), b"\x1b[1;5A");
    }

    #[test]
    fn shift_tab_is_backtab() {
        let ev = event(Key::Tab, Mods::SHIFT, "", 0);
        assert_eq!(encode(&ev, EncoderState::default()), b"\x1b[Z");
    }

    #[test]
    fn function_and_nav_keys() {
        assert_eq!(encode(&event(Key::F1, Mods::empty(), "", 0), EncoderState::default()), b"\x1bOP");
        assert_eq!(encode(&event(Key::F5, Mods::empty(), "", 0), EncoderState::default()), b"\x1b[15~");
        assert_eq!(
            encode(&event(Key::F5, Mods::SHIFT | Mods::CTRL, "", 0), EncoderState::default()),
            b"\x1b[15;6~"
        );
        assert_eq!(encode(&event(Key::Delete, Mods::empty(), "", 0), EncoderState::default()), b"\x1b[3~");
    }

    #[test]
    fn keypad_application_mode() {
        let ev = event(Key::Kp5, Mods::empty(), "5", '5' as u32);
        assert_eq!(encode(&ev, EncoderState::default()), b"5");
        let state = EncoderState { keypad_key_application: true, ..Default::default() };
        assert_eq!(encode(&ev, state), b"\x1bOu");
    }

    #[test]
    fn kitty_plain_text_passthrough() {
        let ev = event(Key::Char('a'), Mods::empty(), "abcd", 'a' as u32);
        assert_eq!(encode(&ev, kitty_state(KittyFlags::DISAMBIGUATE)), b"abcd");
    }

    #[test]
    fn kitty_report_alternates_shift_a() {
        let ev = event(Key::Char('a'), Mods::SHIFT, "A", 'a' as u32);
        let state = kitty_state(KittyFlags::DISAMBIGUATE | KittyFlags::REPORT_ALTERNATES);
        assert_eq!(encode(&ev, state), b"\x1b[97:65;2u");
    }

    #[test]
    fn kitty_modifier_reports_while_composing() {
        let mut ev = event(Key::LeftShift, Mods::SHIFT, "", 0);
        ev.composing = true;
        assert_eq!(encode(&ev, kitty_state(KittyFlags::DISAMBIGUATE)), b"\x1b[57441;2u");
    }

    #[test]
    fn kitty_composing_swallows_text_keys() {
        let mut ev = event(Key::Char('a'), Mods::empty(), "a", 'a' as u32);
        ev.composing = true;
        assert!(encode(&ev, kitty_state(KittyFlags::DISAMBIGUATE)).is_empty());
    }

    #[test]
    fn kitty_legacy_compat_enter() {
        let ev = event(Key::Enter, Mods::empty(), "\r", 0);
        assert_eq!(encode(&ev, kitty_state(KittyFlags::DISAMBIGUATE)), b"\r");
    }

    #[test]
    fn kitty_report_all_bypasses_compat() {
        let ev = event(Key::Enter, Mods::empty(), "\r", 0);
        let state = kitty_state(KittyFlags::DISAMBIGUATE | KittyFlags::REPORT_ALL);
        assert_eq!(encode(&ev, state), b"\x1b[13u");
    }

    #[test]
    fn kitty_ctrl_key_is_csi_u() {
        let ev = event(Key::Char('c'), Mods::CTRL, "\x03", 'c' as u32);
        assert_eq!(encode(&ev, kitty_state(KittyFlags::DISAMBIGUATE)), b"\x1b[99;5u");
    }

    #[test]
    fn kitty_release_without_report_events_is_empty() {
        let mut ev = event(Key::Char('a'), Mods::empty(), "a", 'a' as u32);
        ev.action = KeyAction::Release;
        assert!(encode(&ev, kitty_state(KittyFlags::DISAMBIGUATE)).is_empty());
    }

    #[test]
    fn kitty_press_event_tag_is_explicit() {
        let ev = event(Key::Char('a'), Mods::CTRL, "a", 'a' as u32);
        let state = kitty_state(KittyFlags::DISAMBIGUATE | KittyFlags::REPORT_EVENTS);
        assert_eq!(encode(&ev, state), b"\x1b[97;5:1u");
    }

    #[test]
    fn kitty_release_event_tag() {
        let mut ev = event(Key::Char('a'), Mods::empty(), "", 'a' as u32);
        ev.action = KeyAction::Release;
        let state = kitty_state(KittyFlags::DISAMBIGUATE | KittyFlags::REPORT_EVENTS);
        assert_eq!(encode(&ev, state), b"\x1b[97;1:3u");
    }

    #[test]
    fn kitty_associated_text() {
        let ev = event(Key::Char('a'), Mods::CTRL, "a", 'a' as u32);
        let state = kitty_state(KittyFlags::DISAMBIGUATE | KittyFlags::REPORT_ASSOCIATED);
        assert_eq!(encode(&ev, state), b"\x1b[97;5;97u");
    }

    #[test]
    fn kitty_associated_text_placeholder_without_mods() {
        // REPORT_ALL forces the escape form even for plain text keys; the
        // suppressed modifier section leaves a placeholder parameter.
        let ev = event(Key::Char('a'), Mods::empty(), "a", 'a' as u32);
        let state = kitty_state(KittyFlags::REPORT_ALL | KittyFlags::REPORT_ASSOCIATED);
        assert_eq!(encode(&ev, state), b"\x1b[97;;97u");
    }

    #[test]
    fn kitty_special_form_arrows() {
        let ev = event(Key::Up, Mods::empty(), "", 0);
        assert_eq!(encode(&ev, kitty_state(KittyFlags::DISAMBIGUATE)), b"\x1b[A");

        let ev = event(Key::Up, Mods::SHIFT, "", 0);
        assert_eq!(encode(&ev, kitty_state(KittyFlags::DISAMBIGUATE)), b"\x1b[1;2A");

        let mut ev = event(Key::Up, Mods::empty(), "", 0);
        ev.action = KeyAction::Repeat;
        let state = kitty_state(KittyFlags::DISAMBIGUATE | KittyFlags::REPORT_EVENTS);
        assert_eq!(encode(&ev, state), b"\x1b[1;1:2A");
    }

    #[test]
    fn kitty_tilde_keys_keep_legacy_numbers() {
        let ev = event(Key::PageUp, Mods::CTRL, "", 0);
        assert_eq!(encode(&ev, kitty_state(KittyFlags::DISAMBIGUATE)), b"\x1b[5;5~");
    }

    #[test]
    fn buffer_too_small_is_reported() {
        let ev = event(Key::Char('h'), Mods::CTRL | Mods::SHIFT, "H", 'h' as u32);
        let state = EncoderState { modify_other_keys_state_2: true, ..Default::default() };
        let mut buf = [0u8; 4];
        assert_eq!(
            KeyEncoder::new(&ev, state).encode(&mut buf),
            Err(EncodeError::BufferTooSmall)
        );
    }

    #[test]
    fn caps_lock_does_not_disturb_lookups() {
        let ev = event(Key::Char('c'), Mods::CTRL | Mods::CAPS_LOCK, "\x03", 'c' as u32);
        assert_eq!(encode(&ev, EncoderState::default()), vec![0x03]);
    }

    #[test]
    fn kitty_flag_stack() {
        let mut state = KittyKeyboardState::default();
        state.set_flags(0b00001, 1);
        assert_eq!(state.flags(), KittyFlags::DISAMBIGUATE);

        state.push(0b01011);
        assert_eq!(
            state.flags(),
            KittyFlags::DISAMBIGUATE | KittyFlags::REPORT_EVENTS | KittyFlags::REPORT_ALL
        );

        state.pop(1);
        assert_eq!(state.flags(), KittyFlags::DISAMBIGUATE);

        // Popping past the bottom resets everything.
        state.pop(5);
        assert!(state.flags().is_empty());

        assert_eq!(state.query_response(), b"\x1b[?0u");
    }

    #[test]
    fn kitty_stack_depth_is_bounded() {
        let mut state = KittyKeyboardState::default();
        for _ in 0..40 {
            state.push(0b00001);
        }
        state.pop(40);
        assert!(state.flags().is_empty());
    }
}
