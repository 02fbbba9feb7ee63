//! Terminal colors and the 256-entry palette.
//!
//! Cells carry a `Color` which is resolved against the palette at rebuild
//! time; `Default` means "unset" so callers can distinguish a cell that
//! wants the default foreground from one that set it explicitly.

/// A cell color as written by SGR sequences.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Color {
    /// No explicit color; resolution falls back per ground (fg/bg).
    #[default]
    Default,
    Indexed(u8),
    Rgb(u8, u8, u8),
}

/// The 16 ANSI colors (normal, then bright).
const ANSI: [[u8; 3]; 16] = [
    [0, 0, 0],
    [204, 0, 0],
    [0, 204, 0],
    [204, 204, 0],
    [0, 0, 204],
    [204, 0, 204],
    [0, 204, 204],
    [204, 204, 204],
    [102, 102, 102],
    [255, 0, 0],
    [0, 255, 0],
    [255, 255, 0],
    [0, 0, 255],
    [255, 0, 255],
    [0, 255, 255],
    [255, 255, 255],
];

/// Channel ramp of the xterm 6x6x6 color cube.
const CUBE_STEPS: [u8; 6] = [0, 95, 135, 175, 215, 255];

/// 256 indexed colors plus the defaults and overlay colors used by the
/// renderer.
#[derive(Clone)]
pub struct ColorPalette {
    /// ANSI 0-15, the 216 color cube, 24 grayscale steps.
    pub colors: [[u8; 3]; 256],
    pub default_fg: [u8; 3],
    pub default_bg: [u8; 3],
    /// Cursor fill color.
    pub cursor: [u8; 3],
    /// Selection overrides; `None` falls back to the inverted defaults.
    pub selection_fg: Option<[u8; 3]>,
    pub selection_bg: Option<[u8; 3]>,
}

impl Default for ColorPalette {
    fn default() -> Self {
        let mut colors = [[0u8; 3]; 256];
        colors[..16].copy_from_slice(&ANSI);
        for (i, slot) in colors[16..232].iter_mut().enumerate() {
            *slot = [
                CUBE_STEPS[i / 36],
                CUBE_STEPS[i / 6 % 6],
                CUBE_STEPS[i % 6],
            ];
        }
        for (i, slot) in colors[232..].iter_mut().enumerate() {
            let gray = (8 + 10 * i) as u8;
            *slot = [gray; 3];
        }

        Self {
            colors,
            default_fg: [230, 230, 230],
            default_bg: [26, 26, 26],
            cursor: [255, 255, 255],
            selection_fg: None,
            selection_bg: None,
        }
    }
}

/// One hex channel of a color spec. Two digits pass through; four-digit
/// X11 channels keep their high byte.
fn channel(hex: &str) -> Option<u8> {
    match hex.len() {
        2 => u8::from_str_radix(hex, 16).ok(),
        4 => u16::from_str_radix(hex, 16).ok().map(|v| (v >> 8) as u8),
        _ => None,
    }
}

impl ColorPalette {
    /// Parse a color specification like "#RRGGBB" or "rgb:RR/GG/BB"
    /// (16-bit "rgb:RRRR/GGGG/BBBB" channels are accepted too).
    pub fn parse_color_spec(spec: &str) -> Option<[u8; 3]> {
        let spec = spec.trim();

        if let Some(hex) = spec.strip_prefix('#') {
            if hex.len() != 6 {
                return None;
            }
            return Some([channel(&hex[..2])?, channel(&hex[2..4])?, channel(&hex[4..])?]);
        }

        let mut channels = spec.strip_prefix("rgb:")?.split('/');
        let rgb = [
            channel(channels.next()?)?,
            channel(channels.next()?)?,
            channel(channels.next()?)?,
        ];
        if channels.next().is_some() {
            return None;
        }
        Some(rgb)
    }

    /// Resolve an explicit color, `None` when the cell left it unset.
    pub fn resolve(&self, color: Color) -> Option<[u8; 3]> {
        match color {
            Color::Default => None,
            Color::Indexed(i) => Some(self.colors[i as usize]),
            Color::Rgb(r, g, b) => Some([r, g, b]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hex_spec() {
        assert_eq!(ColorPalette::parse_color_spec("#ff8000"), Some([255, 128, 0]));
        assert_eq!(ColorPalette::parse_color_spec("#ff80"), None);
        assert_eq!(ColorPalette::parse_color_spec("#gg0000"), None);
    }

    #[test]
    fn parse_rgb_spec() {
        assert_eq!(ColorPalette::parse_color_spec("rgb:ff/80/00"), Some([255, 128, 0]));
        assert_eq!(ColorPalette::parse_color_spec("rgb:ffff/8080/0000"), Some([255, 128, 0]));
        // Wrong arity in either direction is rejected.
        assert_eq!(ColorPalette::parse_color_spec("rgb:ff/80"), None);
        assert_eq!(ColorPalette::parse_color_spec("rgb:ff/80/00/00"), None);
    }

    #[test]
    fn resolve_distinguishes_unset() {
        let palette = ColorPalette::default();
        assert_eq!(palette.resolve(Color::Default), None);
        assert_eq!(palette.resolve(Color::Indexed(1)), Some([204, 0, 0]));
        assert_eq!(palette.resolve(Color::Rgb(1, 2, 3)), Some([1, 2, 3]));
    }

    #[test]
    fn color_cube_corners() {
        let palette = ColorPalette::default();
        assert_eq!(palette.colors[16], [0, 0, 0]);
        // xterm 123 is #87ffff.
        assert_eq!(palette.colors[123], [135, 255, 255]);
        assert_eq!(palette.colors[231], [255, 255, 255]);
        assert_eq!(palette.colors[255], [238, 238, 238]);
    }
}
