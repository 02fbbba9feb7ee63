//! Text shaping over terminal rows.
//!
//! Rows are split into maximal same-font runs which are shaped with
//! rustybuzz so ligatures and combining marks resolve correctly, then each
//! shaped glyph is mapped back to its source cell through the cluster
//! indices. The cell rebuilder consumes this through the [`GlyphSource`]
//! trait so its logic stays testable without system fonts.

use ab_glyph::Font;
use rustybuzz::UnicodeBuffer;

use crate::atlas::{AtlasGlyph, FontMetrics, GlyphAtlas};
use crate::font_loader::{FontError, FontStack};
use crate::terminal::{Row, UnderlineStyle};

/// One shaped glyph mapped back to its source cell.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ShapedCell {
    pub col: usize,
    pub glyph: u16,
    pub font_index: u8,
    /// Shaping offsets in pixels, already y-down.
    pub x_offset: i32,
    pub y_offset: i32,
    /// Cells the glyph spans (1 or 2).
    pub width: u8,
}

/// Source of shaped rows and rendered glyphs for the cell rebuilder.
pub trait GlyphSource {
    fn shape_row(&mut self, row: &Row) -> Vec<ShapedCell>;
    fn glyph(&mut self, font_index: u8, glyph: u16, cell_height: u32) -> Option<AtlasGlyph>;
    fn underline(&mut self, style: UnderlineStyle) -> Option<AtlasGlyph>;
    fn metrics(&self) -> FontMetrics;
}

/// A maximal stretch of one row sharing a font, shaped as a unit.
#[derive(Debug, PartialEq)]
struct TextRun {
    font_index: u8,
    text: String,
    /// (byte offset into `text`, source column, cell span) per character.
    clusters: Vec<(u32, usize, u8)>,
}

/// Characters taking the emoji presentation, rendered from the color font.
fn is_emoji(c: char) -> bool {
    matches!(c as u32, 0x1f000..=0x1faff | 0x2600..=0x26ff | 0x2764 | 0xfe0f)
}

/// Splits a row into shaping runs. Wide-character continuation cells fold
/// into the cluster of their leading cell.
fn segment_runs(row: &Row, has_emoji: bool) -> Vec<TextRun> {
    let mut runs: Vec<TextRun> = Vec::new();
    for (col, cell) in row.cells.iter().enumerate() {
        if cell.wide_continuation {
            continue;
        }
        let emoji = has_emoji && is_emoji(cell.ch);
        let font_index = FontStack::index_for(cell.bold, cell.italic, emoji);
        let width = if cell.wide { 2 } else { 1 };

        match runs.last_mut() {
            Some(run) if run.font_index == font_index => {
                run.clusters.push((run.text.len() as u32, col, width));
                run.text.push(cell.ch);
            }
            _ => {
                runs.push(TextRun {
                    font_index,
                    text: cell.ch.to_string(),
                    clusters: vec![(0, col, width)],
                });
            }
        }
    }
    runs
}

/// The production glyph source: the loaded font stack plus the atlas cache.
pub struct FontEngine {
    pub fonts: FontStack,
    pub atlas: GlyphAtlas,
}

impl FontEngine {
    pub fn new(family: Option<&str>, font_size: f32) -> Result<Self, FontError> {
        let fonts = FontStack::load(family)?;
        let atlas = GlyphAtlas::new(&fonts, font_size);
        Ok(Self { fonts, atlas })
    }

    pub fn set_font_size(&mut self, font_size: f32) {
        self.atlas.set_font_size(&self.fonts, font_size);
    }

    fn shape_run(&self, run: &TextRun, out: &mut Vec<ShapedCell>) {
        let variant = self.fonts.variant(run.font_index);
        let units_to_px = self.atlas.font_size() / variant.font().height_unscaled();

        let mut buffer = UnicodeBuffer::new();
        buffer.push_str(&run.text);
        let shaped = rustybuzz::shape(variant.face(), &[], buffer);

        let infos = shaped.glyph_infos();
        let positions = shaped.glyph_positions();
        for (info, pos) in infos.iter().zip(positions) {
            // Map the cluster (byte offset) back to its source column.
            let idx = match run.clusters.binary_search_by_key(&info.cluster, |c| c.0) {
                Ok(i) => i,
                Err(0) => 0,
                Err(i) => i - 1,
            };
            let (_, col, width) = run.clusters[idx];
            out.push(ShapedCell {
                col,
                glyph: info.glyph_id as u16,
                font_index: run.font_index,
                x_offset: (pos.x_offset as f32 * units_to_px).round() as i32,
                y_offset: (-pos.y_offset as f32 * units_to_px).round() as i32,
                width,
            });
        }
    }
}

impl GlyphSource for FontEngine {
    fn shape_row(&mut self, row: &Row) -> Vec<ShapedCell> {
        let mut out = Vec::with_capacity(row.cells.len());
        for run in segment_runs(row, self.fonts.has_emoji()) {
            self.shape_run(&run, &mut out);
        }
        out
    }

    fn glyph(&mut self, font_index: u8, glyph: u16, cell_height: u32) -> Option<AtlasGlyph> {
        self.atlas.glyph(&self.fonts, font_index, glyph, cell_height)
    }

    fn underline(&mut self, style: UnderlineStyle) -> Option<AtlasGlyph> {
        self.atlas.underline_sprite(style)
    }

    fn metrics(&self) -> FontMetrics {
        self.atlas.metrics()
    }
}
