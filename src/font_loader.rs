//! Font discovery and loading via fontconfig.
//!
//! Each variant is loaded once and kept for the lifetime of the process;
//! both an ab_glyph reference (rasterization) and a rustybuzz face
//! (shaping) are parsed from the same leaked buffer.

use std::path::{Path, PathBuf};

use ab_glyph::{Font, FontRef};
use fontconfig::Fontconfig;
use thiserror::Error;

/// Font indices used in glyph cache keys and shaped cells.
pub const FONT_REGULAR: u8 = 0;
pub const FONT_BOLD: u8 = 1;
pub const FONT_ITALIC: u8 = 2;
pub const FONT_BOLD_ITALIC: u8 = 3;
pub const FONT_EMOJI: u8 = 4;

#[derive(Error, Debug)]
pub enum FontError {
    #[error("fontconfig initialization failed")]
    FontconfigInit,
    #[error("no usable monospace font found")]
    NoFontsFound,
    #[error("failed to read font file {0}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("failed to parse font file {0}")]
    Parse(PathBuf),
}

/// One loaded font file.
pub struct FontVariant {
    pub path: PathBuf,
    font: FontRef<'static>,
    face: rustybuzz::Face<'static>,
}

impl FontVariant {
    pub fn load(path: &Path) -> Result<Self, FontError> {
        let data = std::fs::read(path).map_err(|e| FontError::Read(path.to_path_buf(), e))?;
        // Fonts live for the whole program; leaking sidesteps the
        // self-referential ownership between the buffer and both parsers.
        let data: &'static [u8] = Box::leak(data.into_boxed_slice());
        let font = FontRef::try_from_slice(data)
            .map_err(|_| FontError::Parse(path.to_path_buf()))?;
        let face = rustybuzz::Face::from_slice(data, 0)
            .ok_or_else(|| FontError::Parse(path.to_path_buf()))?;
        Ok(Self { path: path.to_path_buf(), font, face })
    }

    pub fn font(&self) -> &FontRef<'static> {
        &self.font
    }

    pub fn face(&self) -> &rustybuzz::Face<'static> {
        &self.face
    }
}

/// The regular/bold/italic/bold-italic variants of the configured family
/// plus a color emoji face.
pub struct FontStack {
    variants: [Option<FontVariant>; 4],
    emoji: Option<FontVariant>,
}

impl FontStack {
    /// Discovers and loads the family (or the system monospace default).
    /// Only the regular face is required; missing variants fall back to it.
    pub fn load(family: Option<&str>) -> Result<Self, FontError> {
        let fc = Fontconfig::new().ok_or(FontError::FontconfigInit)?;
        let family = family.unwrap_or("monospace");

        let find = |style: Option<&str>| -> Option<PathBuf> {
            fc.find(family, style).map(|f| f.path)
        };

        let regular_path = find(None).ok_or(FontError::NoFontsFound)?;
        let regular = FontVariant::load(&regular_path)?;

        let load_style = |style: &str| -> Option<FontVariant> {
            let path = find(Some(style))?;
            if path == regular_path {
                // fontconfig substituted the regular face; treat the
                // variant as absent rather than double-loading it.
                return None;
            }
            match FontVariant::load(&path) {
                Ok(v) => Some(v),
                Err(err) => {
                    log::warn!("failed to load {style} variant: {err}");
                    None
                }
            }
        };

        let bold = load_style("Bold");
        let italic = load_style("Italic");
        let bold_italic = load_style("Bold Italic");

        let emoji = fc
            .find("Noto Color Emoji", None)
            .map(|f| f.path)
            .and_then(|path| match FontVariant::load(&path) {
                Ok(v) => Some(v),
                Err(err) => {
                    log::warn!("failed to load emoji font: {err}");
                    None
                }
            });

        log::info!(
            "loaded font family {family:?} (bold: {}, italic: {}, emoji: {})",
            bold.is_some(),
            italic.is_some(),
            emoji.is_some()
        );

        Ok(Self { variants: [Some(regular), bold, italic, bold_italic], emoji })
    }

    /// The font index for a cell's style.
    pub fn index_for(bold: bool, italic: bool, emoji: bool) -> u8 {
        if emoji {
            return FONT_EMOJI;
        }
        match (bold, italic) {
            (false, false) => FONT_REGULAR,
            (true, false) => FONT_BOLD,
            (false, true) => FONT_ITALIC,
            (true, true) => FONT_BOLD_ITALIC,
        }
    }

    /// The variant for an index, falling back to regular for styles that
    /// were not found on the system.
    pub fn variant(&self, index: u8) -> &FontVariant {
        let slot = match index {
            FONT_EMOJI => self.emoji.as_ref(),
            i if (i as usize) < 4 => self.variants[i as usize].as_ref(),
            _ => None,
        };
        slot.unwrap_or_else(|| self.regular())
    }

    pub fn regular(&self) -> &FontVariant {
        self.variants[0].as_ref().expect("regular variant always loaded")
    }

    pub fn has_emoji(&self) -> bool {
        self.emoji.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn style_indices() {
        assert_eq!(FontStack::index_for(false, false, false), FONT_REGULAR);
        assert_eq!(FontStack::index_for(true, false, false), FONT_BOLD);
        assert_eq!(FontStack::index_for(false, true, false), FONT_ITALIC);
        assert_eq!(FontStack::index_for(true, true, false), FONT_BOLD_ITALIC);
        assert_eq!(FontStack::index_for(true, false, true), FONT_EMOJI);
    }

    #[test]
    fn load_system_monospace() {
        // Best-effort: hosts without fontconfig fonts skip the assertions.
        let Ok(stack) = FontStack::load(None) else {
            return;
        };
        assert!(stack.regular().font().glyph_count() > 0);
        assert!(stack.variant(FONT_BOLD).font().glyph_count() > 0);
    }
}
