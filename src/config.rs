//! Configuration management.
//!
//! Loads configuration from `~/.config/ember/config.json`. Missing file or
//! unparseable content falls back to defaults with a logged warning.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::color::ColorPalette;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Font family name resolved through fontconfig; `None` uses the
    /// system monospace default.
    pub font_family: Option<String>,
    /// Font size in pixels.
    pub font_size: f32,
    /// Lines of scrollback kept per primary screen.
    pub scrollback_lines: usize,
    /// Shell to spawn; `None` uses $SHELL.
    pub shell: Option<String>,
    /// Colors as "#RRGGBB" or "rgb:RR/GG/BB" specs.
    pub foreground: Option<String>,
    pub background: Option<String>,
    pub cursor_color: Option<String>,
    pub selection_foreground: Option<String>,
    pub selection_background: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            font_family: None,
            font_size: 15.0,
            scrollback_lines: 10_000,
            shell: None,
            foreground: None,
            background: None,
            cursor_color: None,
            selection_foreground: None,
            selection_background: None,
        }
    }
}

impl Config {
    pub fn config_path() -> Option<PathBuf> {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("ember").join("config.json"))
    }

    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(config) => config,
                Err(err) => {
                    log::warn!("invalid config at {}: {err}", path.display());
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Applies the configured color overrides to a palette.
    pub fn apply_palette(&self, palette: &mut ColorPalette) {
        let parse = |spec: &Option<String>| spec.as_deref().and_then(ColorPalette::parse_color_spec);
        if let Some(fg) = parse(&self.foreground) {
            palette.default_fg = fg;
        }
        if let Some(bg) = parse(&self.background) {
            palette.default_bg = bg;
        }
        if let Some(cursor) = parse(&self.cursor_color) {
            palette.cursor = cursor;
        }
        palette.selection_fg = parse(&self.selection_foreground);
        palette.selection_bg = parse(&self.selection_background);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.font_size, 15.0);
        assert_eq!(config.scrollback_lines, 10_000);
        assert!(config.font_family.is_none());
    }

    #[test]
    fn parse_partial_config() {
        let config: Config =
            serde_json::from_str(r##"{"font_size": 18.0, "background": "#101010"}"##).unwrap();
        assert_eq!(config.font_size, 18.0);
        assert_eq!(config.background.as_deref(), Some("#101010"));
        // Unspecified fields keep their defaults.
        assert_eq!(config.scrollback_lines, 10_000);
    }

    #[test]
    fn apply_palette_overrides() {
        let config: Config = serde_json::from_str(
            r##"{"foreground": "#ffffff", "cursor_color": "#ff0000", "selection_background": "#00ff00"}"##,
        )
        .unwrap();
        let mut palette = ColorPalette::default();
        config.apply_palette(&mut palette);
        assert_eq!(palette.default_fg, [255, 255, 255]);
        assert_eq!(palette.cursor, [255, 0, 0]);
        assert_eq!(palette.selection_bg, Some([0, 255, 0]));
        assert_eq!(palette.selection_fg, None);
    }
}
