//! Glyph atlases and rasterization.
//!
//! Two CPU-side images back the GPU textures: a single-channel atlas for
//! outline glyphs and decoration sprites, and a BGRA atlas for color emoji.
//! The renderer inspects the `modified`/`resized` flags before each draw
//! and re-uploads whatever changed.

use std::collections::HashMap;

use ab_glyph::{Font, GlyphId, PxScale, ScaleFont};

use crate::font_loader::{FontStack, FontVariant, FONT_EMOJI};
use crate::terminal::UnderlineStyle;

/// Pixel layout of one atlas.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AtlasFormat {
    /// One byte per pixel, glyph coverage.
    Greyscale,
    /// Four bytes per pixel, pre-decoded emoji.
    Bgra,
}

impl AtlasFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            AtlasFormat::Greyscale => 1,
            AtlasFormat::Bgra => 4,
        }
    }
}

/// A shelf-packed CPU image. Regions are never freed individually; the
/// whole atlas resets when font metrics change.
pub struct Atlas {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    pub format: AtlasFormat,
    /// Content changed since the last texture upload.
    pub modified: bool,
    /// The backing image grew; the texture must be recreated.
    pub resized: bool,
    cursor_x: u32,
    cursor_y: u32,
    shelf_height: u32,
}

impl Atlas {
    const INITIAL_SIZE: u32 = 1024;
    /// One-pixel gutter between regions against sampling bleed.
    const PADDING: u32 = 1;

    pub fn new(format: AtlasFormat) -> Self {
        let size = Self::INITIAL_SIZE;
        Self {
            width: size,
            height: size,
            data: vec![0; (size * size * format.bytes_per_pixel()) as usize],
            format,
            modified: false,
            resized: false,
            cursor_x: 0,
            cursor_y: 0,
            shelf_height: 0,
        }
    }

    /// Allocates a region, growing the image downward when full. Returns
    /// the top-left texel.
    pub fn reserve(&mut self, w: u32, h: u32) -> (u32, u32) {
        debug_assert!(w + Self::PADDING <= self.width, "region wider than atlas");
        let padded_w = w + Self::PADDING;
        let padded_h = h + Self::PADDING;
        if self.cursor_x + padded_w > self.width {
            self.cursor_y += self.shelf_height;
            self.cursor_x = 0;
            self.shelf_height = 0;
        }
        while self.cursor_y + padded_h > self.height {
            self.grow();
        }
        let pos = (self.cursor_x, self.cursor_y);
        self.cursor_x += padded_w;
        self.shelf_height = self.shelf_height.max(padded_h);
        pos
    }

    fn grow(&mut self) {
        self.height *= 2;
        self.data
            .resize((self.width * self.height * self.format.bytes_per_pixel()) as usize, 0);
        self.resized = true;
        self.modified = true;
    }

    /// Copies a tightly-packed source bitmap into the region at (x, y).
    pub fn write(&mut self, x: u32, y: u32, w: u32, h: u32, src: &[u8]) {
        let bpp = self.format.bytes_per_pixel();
        debug_assert_eq!(src.len() as u32, w * h * bpp);
        for row in 0..h {
            let dst_start = (((y + row) * self.width + x) * bpp) as usize;
            let src_start = (row * w * bpp) as usize;
            let len = (w * bpp) as usize;
            self.data[dst_start..dst_start + len].copy_from_slice(&src[src_start..src_start + len]);
        }
        self.modified = true;
    }

    /// Drops every region and zeroes the image. Size is kept.
    pub fn clear(&mut self) {
        self.data.fill(0);
        self.cursor_x = 0;
        self.cursor_y = 0;
        self.shelf_height = 0;
        self.modified = true;
    }
}

/// Where a rendered glyph landed and how to position it in its cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AtlasGlyph {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Offset of the glyph's top-left from the cell origin.
    pub offset_x: i32,
    pub offset_y: i32,
    /// Lives in the color atlas; the shader samples it directly instead of
    /// tinting with the foreground color.
    pub colored: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct GlyphKey {
    font_index: u8,
    glyph: u16,
    /// Glyph renders are only valid for the cell geometry they were
    /// rasterized at.
    cell_height: u32,
}

/// Metrics of the monospace cell derived from the regular face.
#[derive(Clone, Copy, Debug)]
pub struct FontMetrics {
    pub cell_width: f32,
    pub cell_height: f32,
    /// Baseline distance from the cell top.
    pub baseline: f32,
    /// Top of the underline bar, from the cell top.
    pub underline_position: f32,
    pub underline_thickness: f32,
    pub strikethrough_position: f32,
    pub strikethrough_thickness: f32,
}

impl FontMetrics {
    /// Derived from the regular-weight ASCII 'M'; any ASCII glyph gives
    /// the same advance in a monospace face.
    fn compute(stack: &FontStack, font_size: f32) -> Self {
        let font = stack.regular().font();
        let scaled = font.as_scaled(PxScale::from(font_size));
        let m = font.glyph_id('M');
        let cell_width = scaled.h_advance(m).ceil();
        let cell_height = (scaled.ascent() - scaled.descent() + scaled.line_gap()).ceil();
        let baseline = scaled.ascent().round();

        let px_per_unit = font_size / font.height_unscaled();
        let face = stack.regular().face();
        let underline_position = face
            .underline_metrics()
            .map(|m| baseline - m.position as f32 * px_per_unit)
            .unwrap_or(baseline + 2.0)
            .min(cell_height - 2.0);
        let strikethrough_position = face
            .strikeout_metrics()
            .map(|m| baseline - m.position as f32 * px_per_unit)
            .unwrap_or((baseline * 0.65).round());

        Self {
            cell_width,
            cell_height,
            baseline,
            underline_position: underline_position.round(),
            underline_thickness: 2.0,
            strikethrough_position: strikethrough_position.round(),
            strikethrough_thickness: 2.0,
        }
    }
}

/// The glyph cache over both atlases. Keys include the cell height so a
/// font-size change never resolves to stale texels.
pub struct GlyphAtlas {
    pub grey: Atlas,
    pub color: Atlas,
    glyphs: HashMap<GlyphKey, Option<AtlasGlyph>>,
    sprites: HashMap<UnderlineStyle, AtlasGlyph>,
    font_size: f32,
    metrics: FontMetrics,
}

impl GlyphAtlas {
    pub fn new(stack: &FontStack, font_size: f32) -> Self {
        Self {
            grey: Atlas::new(AtlasFormat::Greyscale),
            color: Atlas::new(AtlasFormat::Bgra),
            glyphs: HashMap::new(),
            sprites: HashMap::new(),
            font_size,
            metrics: FontMetrics::compute(stack, font_size),
        }
    }

    pub fn metrics(&self) -> FontMetrics {
        self.metrics
    }

    pub fn font_size(&self) -> f32 {
        self.font_size
    }

    /// Applies a new font size: metrics change, every cached region points
    /// at stale texels, so both atlases reset.
    pub fn set_font_size(&mut self, stack: &FontStack, font_size: f32) {
        self.font_size = font_size;
        self.metrics = FontMetrics::compute(stack, font_size);
        self.glyphs.clear();
        self.sprites.clear();
        self.grey.clear();
        self.color.clear();
    }

    /// Renders a glyph (or returns its cached region). `None` means the
    /// glyph has no visible pixels — spaces, empty outlines.
    pub fn glyph(
        &mut self,
        stack: &FontStack,
        font_index: u8,
        glyph: u16,
        cell_height: u32,
    ) -> Option<AtlasGlyph> {
        let key = GlyphKey { font_index, glyph, cell_height };
        if let Some(cached) = self.glyphs.get(&key) {
            return *cached;
        }
        let variant = stack.variant(font_index);
        let rendered = if font_index == FONT_EMOJI && stack.has_emoji() {
            self.render_color_glyph(variant, glyph, cell_height)
        } else {
            self.render_outline_glyph(variant, glyph)
        };
        self.glyphs.insert(key, rendered);
        rendered
    }

    /// Rasterizes an outline glyph into the greyscale atlas, snapped to
    /// integer pixel bounds so stem widths stay even.
    fn render_outline_glyph(&mut self, variant: &FontVariant, glyph: u16) -> Option<AtlasGlyph> {
        let font = variant.font();
        let glyph_id = GlyphId(glyph);
        let scale = PxScale::from(self.font_size);

        let unpositioned = glyph_id.with_scale_and_position(scale, ab_glyph::point(0.0, 0.0));
        let outlined = font.outline_glyph(unpositioned)?;
        let raw_bounds = outlined.px_bounds();
        let snapped_min_x = raw_bounds.min.x.floor();
        let snapped_min_y = raw_bounds.min.y.floor();
        let snapped = glyph_id.with_scale_and_position(
            scale,
            ab_glyph::point(snapped_min_x - raw_bounds.min.x, snapped_min_y - raw_bounds.min.y),
        );
        let outlined = font.outline_glyph(snapped)?;
        let bounds = outlined.px_bounds();
        let width = bounds.width().ceil() as u32;
        let height = bounds.height().ceil() as u32;
        if width == 0 || height == 0 {
            return None;
        }

        let mut bitmap = vec![0u8; (width * height) as usize];
        outlined.draw(|x, y, coverage| {
            if x < width && y < height {
                bitmap[(y * width + x) as usize] = (coverage * 255.0) as u8;
            }
        });

        let (x, y) = self.grey.reserve(width, height);
        self.grey.write(x, y, width, height, &bitmap);

        Some(AtlasGlyph {
            x,
            y,
            width,
            height,
            // bounds.min.y is negative above the baseline; the cell origin
            // is the top-left corner.
            offset_x: snapped_min_x as i32,
            offset_y: (self.metrics.baseline + snapped_min_y) as i32,
            colored: false,
        })
    }

    /// Decodes an embedded raster image (emoji) into the color atlas,
    /// scaled to the cell height.
    fn render_color_glyph(
        &mut self,
        variant: &FontVariant,
        glyph: u16,
        cell_height: u32,
    ) -> Option<AtlasGlyph> {
        use rustybuzz::ttf_parser;

        let face: &ttf_parser::Face = variant.face();
        let raster = face.glyph_raster_image(ttf_parser::GlyphId(glyph), cell_height as u16)?;
        if raster.format != ttf_parser::RasterImageFormat::PNG {
            return None;
        }
        let decoded = match image::load_from_memory(raster.data) {
            Ok(img) => img.to_rgba8(),
            Err(err) => {
                log::warn!("failed to decode emoji glyph {glyph}: {err}");
                return None;
            }
        };

        // Scale to the cell height, preserving aspect; emoji span two cells
        // horizontally so width is rarely the constraint.
        let target_h = cell_height.max(1);
        let target_w =
            ((decoded.width() as f32 / decoded.height().max(1) as f32) * target_h as f32).round()
                as u32;
        let scaled = image::imageops::resize(
            &decoded,
            target_w.max(1),
            target_h,
            image::imageops::FilterType::Triangle,
        );

        let mut bgra = scaled.into_raw();
        for px in bgra.chunks_exact_mut(4) {
            px.swap(0, 2);
        }

        let (x, y) = self.color.reserve(target_w.max(1), target_h);
        self.color.write(x, y, target_w.max(1), target_h, &bgra);

        Some(AtlasGlyph {
            x,
            y,
            width: target_w.max(1),
            height: target_h,
            offset_x: 0,
            offset_y: 0,
            colored: true,
        })
    }

    /// The decoration sprite for an underline style, rendered on demand at
    /// the current metrics.
    pub fn underline_sprite(&mut self, style: UnderlineStyle) -> Option<AtlasGlyph> {
        if style == UnderlineStyle::None {
            return None;
        }
        if let Some(sprite) = self.sprites.get(&style) {
            return Some(*sprite);
        }

        let width = self.metrics.cell_width as u32;
        let thickness = (self.metrics.underline_thickness as u32).max(1);
        let (height, bitmap) = draw_underline(style, width, thickness);
        let (x, y) = self.grey.reserve(width, height);
        self.grey.write(x, y, width, height, &bitmap);

        let sprite = AtlasGlyph {
            x,
            y,
            width,
            height,
            offset_x: 0,
            offset_y: self.metrics.underline_position as i32,
            colored: false,
        };
        self.sprites.insert(style, sprite);
        Some(sprite)
    }
}

/// Procedural decoration bitmaps. Returns (height, pixels).
fn draw_underline(style: UnderlineStyle, width: u32, thickness: u32) -> (u32, Vec<u8>) {
    let w = width as usize;
    let t = thickness as usize;
    match style {
        UnderlineStyle::None => (0, Vec::new()),
        UnderlineStyle::Single => (thickness, vec![0xff; w * t]),
        UnderlineStyle::Double => {
            let height = t * 3;
            let mut bitmap = vec![0u8; w * height];
            bitmap[..w * t].fill(0xff);
            bitmap[w * t * 2..].fill(0xff);
            (height as u32, bitmap)
        }
        UnderlineStyle::Dotted => {
            let mut bitmap = vec![0u8; w * t];
            for y in 0..t {
                for x in 0..w {
                    if (x / t.max(1)) % 2 == 0 {
                        bitmap[y * w + x] = 0xff;
                    }
                }
            }
            (thickness, bitmap)
        }
        UnderlineStyle::Dashed => {
            let mut bitmap = vec![0u8; w * t];
            let dash = (w / 3).max(1);
            for y in 0..t {
                for x in 0..w {
                    if (x / dash) % 2 == 0 {
                        bitmap[y * w + x] = 0xff;
                    }
                }
            }
            (thickness, bitmap)
        }
        UnderlineStyle::Curly => {
            let height = t * 3;
            let mut bitmap = vec![0u8; w * height];
            let amplitude = (height - t) as f32 / 2.0;
            for x in 0..w {
                let phase = x as f32 / w as f32 * std::f32::consts::TAU;
                let center = amplitude + phase.sin() * amplitude;
                let top = center.round() as usize;
                for y in top..(top + t).min(height) {
                    bitmap[y * w + x] = 0xff;
                }
            }
            (height as u32, bitmap)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_packs_left_to_right() {
        let mut atlas = Atlas::new(AtlasFormat::Greyscale);
        let (x0, y0) = atlas.reserve(10, 10);
        let (x1, y1) = atlas.reserve(10, 10);
        assert_eq!((x0, y0), (0, 0));
        assert_eq!(y1, 0);
        assert!(x1 > x0);
    }

    #[test]
    fn reserve_opens_new_shelf() {
        let mut atlas = Atlas::new(AtlasFormat::Greyscale);
        atlas.reserve(1000, 20);
        let (x, y) = atlas.reserve(100, 20);
        assert_eq!(x, 0);
        assert!(y >= 20);
    }

    #[test]
    fn reserve_grows_and_flags_resize() {
        let mut atlas = Atlas::new(AtlasFormat::Greyscale);
        let before = atlas.height;
        for _ in 0..2 {
            atlas.reserve(1000, 700);
        }
        assert!(atlas.height > before);
        assert!(atlas.resized);
        assert!(atlas.modified);
    }

    #[test]
    fn write_marks_modified_and_places_pixels() {
        let mut atlas = Atlas::new(AtlasFormat::Greyscale);
        let (x, y) = atlas.reserve(2, 2);
        atlas.write(x, y, 2, 2, &[1, 2, 3, 4]);
        assert!(atlas.modified);
        assert_eq!(atlas.data[(y * atlas.width + x) as usize], 1);
        assert_eq!(atlas.data[((y + 1) * atlas.width + x + 1) as usize], 4);
    }

    #[test]
    fn clear_resets_packing() {
        let mut atlas = Atlas::new(AtlasFormat::Greyscale);
        let first = atlas.reserve(10, 10);
        atlas.clear();
        let again = atlas.reserve(10, 10);
        assert_eq!(first, again);
    }

    #[test]
    fn underline_bitmaps_have_expected_shape() {
        let (h, px) = draw_underline(UnderlineStyle::Single, 8, 2);
        assert_eq!(h, 2);
        assert!(px.iter().all(|&p| p == 0xff));

        let (h, px) = draw_underline(UnderlineStyle::Double, 8, 2);
        assert_eq!(h, 6);
        // Gap row between the two bars.
        assert!(px[8 * 2..8 * 4].iter().all(|&p| p == 0));

        let (_, px) = draw_underline(UnderlineStyle::Dotted, 8, 2);
        assert!(px.iter().any(|&p| p == 0) && px.iter().any(|&p| p == 0xff));
    }

    #[test]
    fn glyph_cache_with_system_font() {
        let Ok(stack) = crate::font_loader::FontStack::load(None) else {
            return;
        };
        let mut atlas = GlyphAtlas::new(&stack, 16.0);
        let metrics = atlas.metrics();
        assert!(metrics.cell_width > 0.0);
        assert!(metrics.cell_height >= metrics.baseline);

        let gid = stack.regular().font().glyph_id('M').0;
        let cell_h = metrics.cell_height as u32;
        let first = atlas.glyph(&stack, 0, gid, cell_h).expect("M has pixels");
        let second = atlas.glyph(&stack, 0, gid, cell_h).expect("cached");
        assert_eq!(first, second);
        assert!(atlas.grey.modified);
    }
}
