//! GPU data structures for terminal cell rendering.
//!
//! Contains the per-instance cell record, uniform structures and constants
//! for wgpu rendering. All structures use `#[repr(C)]` and implement
//! `bytemuck::Pod` for GPU upload.

use bytemuck::{Pod, Zeroable};

/// Cell modes discriminating what the shader draws for an instance. Mask
/// bits may be OR'd on top of the base value; none are currently assigned.
pub const MODE_BG: u8 = 1;
pub const MODE_FG: u8 = 2;
pub const MODE_CURSOR_RECT: u8 = 3;
pub const MODE_CURSOR_RECT_HOLLOW: u8 = 4;
pub const MODE_CURSOR_BAR: u8 = 5;
/// Glyph sampled from the color atlas (emoji presentation).
pub const MODE_FG_COLOR: u8 = 7;
pub const MODE_STRIKETHROUGH: u8 = 8;

/// Index pattern for the unit quad every instance expands to.
pub const QUAD_INDICES: [u16; 6] = [0, 1, 3, 1, 2, 3];

/// One cell instance. The field order is observable to the shader through
/// the vertex attribute layout and must not be reordered.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct GpuCell {
    /// Cell position in grid units.
    pub grid_col: u16,
    pub grid_row: u16,
    /// Top-left of the glyph in atlas texels.
    pub glyph_x: u32,
    pub glyph_y: u32,
    pub glyph_width: u32,
    pub glyph_height: u32,
    /// Pen offset from the cell origin.
    pub glyph_offset_x: i32,
    pub glyph_offset_y: i32,
    pub fg: [u8; 4],
    pub bg: [u8; 4],
    pub mode: u8,
    /// Cells this glyph spans (1 or 2).
    pub grid_width: u8,
    /// Keeps the instance stride a multiple of four as wgpu requires;
    /// follows the last observable field.
    pub _pad: [u8; 2],
}

impl GpuCell {
    const ATTRIBS: [wgpu::VertexAttribute; 7] = wgpu::vertex_attr_array![
        0 => Uint16x2, // grid_col, grid_row
        1 => Uint32x2, // glyph_x, glyph_y
        2 => Uint32x2, // glyph_width, glyph_height
        3 => Sint32x2, // glyph_offset_x, glyph_offset_y
        4 => Uint8x4,  // fg
        5 => Uint8x4,  // bg
        6 => Uint8x2,  // mode, grid_width
    ];

    pub fn desc() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<GpuCell>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Instance,
            attributes: &Self::ATTRIBS,
        }
    }
}

/// Uniforms shared by the background and foreground passes. Matches the
/// `Uniforms` struct in glyph_shader.wgsl exactly.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct Uniforms {
    /// 2D orthographic projection from pixel space.
    pub projection: [[f32; 4]; 4],
    pub cell_size: [f32; 2],
    pub strikethrough_position: f32,
    pub strikethrough_thickness: f32,
}

impl Uniforms {
    /// Orthographic projection mapping (0,0)..(width,height) pixels to NDC
    /// with y pointing down, column-major as WGSL expects.
    pub fn ortho(width: f32, height: f32) -> [[f32; 4]; 4] {
        [
            [2.0 / width, 0.0, 0.0, 0.0],
            [0.0, -2.0 / height, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [-1.0, 1.0, 0.0, 1.0],
        ]
    }
}
