//! GPU-accelerated cell rendering.
//!
//! Every frame the visible screen snapshot is lowered into two flat arrays
//! of [`GpuCell`] instances — background rectangles and foreground glyphs —
//! then streamed to the GPU and drawn as two instanced quad passes sharing
//! one shader. A row-granularity LRU avoids re-shaping rows whose content
//! did not change.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use wgpu::util::DeviceExt;
use winit::event_loop::EventLoopProxy;

use crate::atlas::{Atlas, AtlasFormat};
use crate::color::ColorPalette;
use crate::config::Config;
use crate::font_loader::FontError;
use crate::gpu_types::{
    GpuCell, Uniforms, MODE_BG, MODE_CURSOR_BAR, MODE_CURSOR_RECT, MODE_CURSOR_RECT_HOLLOW,
    MODE_FG, MODE_FG_COLOR, MODE_STRIKETHROUGH, QUAD_INDICES,
};
use crate::row_cache::{RowCache, RowKey};
use crate::shaper::{FontEngine, GlyphSource, ShapedCell};
use crate::terminal::{
    Cell, CursorStyle, Screen, ScreenKind, Selection, Terminal, UnderlineStyle,
};

#[derive(Error, Debug)]
pub enum RendererError {
    #[error("no suitable GPU adapter found")]
    AdapterNotFound,
    #[error("failed to create rendering surface")]
    CreateSurface(#[from] wgpu::CreateSurfaceError),
    #[error("failed to acquire GPU device")]
    Device(#[from] wgpu::RequestDeviceError),
    #[error("surface error")]
    Surface(#[from] wgpu::SurfaceError),
    #[error(transparent)]
    Font(#[from] FontError),
}

/// Messages posted back to the window event loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WindowMessage {
    /// Font metrics changed the cell geometry; the grid must reflow.
    CellSize { width: f32, height: f32 },
}

// ─── cell rebuilding ───────────────────────────────────────────────────────

/// Lowers screen snapshots into GPU cell arrays. CPU-only; the GPU side
/// streams whatever this produces.
pub struct CellRebuilder {
    /// Background rectangles, `MODE_BG` only.
    pub cells_bg: Vec<GpuCell>,
    /// Glyphs, decorations and the cursor.
    pub cells: Vec<GpuCell>,
    cache: RowCache,
}

impl CellRebuilder {
    pub fn new(rows: usize) -> Self {
        Self { cells_bg: Vec::new(), cells: Vec::new(), cache: RowCache::new(rows) }
    }

    /// Drops every cached row. Required whenever cached atlas coordinates
    /// go stale (font size change).
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Rebuilds both cell arrays from scratch for one frame.
    pub fn rebuild(
        &mut self,
        active: ScreenKind,
        selection: Option<Selection>,
        screen: &Screen,
        palette: &ColorPalette,
        draw_cursor: bool,
        glyphs: &mut dyn GlyphSource,
    ) {
        let rows = screen.rows.len();
        let cols = screen.cols;
        self.cache.set_rows(rows);
        loop {
            self.cells_bg.clear();
            self.cells.clear();
            self.cells_bg.reserve(rows * cols);
            self.cells.reserve(rows * cols * 2 + 1);
            if self.rebuild_pass(active, selection, screen, palette, draw_cursor, glyphs) {
                break;
            }
            // A row overflowed the reserved space; start over with more so
            // cached rows stay consistent with emitted ones.
            let grown = self.cells.capacity() * 2;
            self.cells.reserve(grown);
        }

        debug_assert!(self.cells_bg.iter().all(|c| c.mode == MODE_BG));
        debug_assert!(self.cells.iter().all(|c| c.mode != MODE_BG));
    }

    fn rebuild_pass(
        &mut self,
        active: ScreenKind,
        selection: Option<Selection>,
        screen: &Screen,
        palette: &ColorPalette,
        draw_cursor: bool,
        glyphs: &mut dyn GlyphSource,
    ) -> bool {
        let metrics = glyphs.metrics();
        let cell_height = metrics.cell_height as u32;
        let cursor = screen.cursor;
        let capture_cursor = draw_cursor
            && cursor.visible
            && cursor.style == CursorStyle::Box
            && screen.viewport_at_bottom;
        let mut cursor_cell: Option<GpuCell> = None;

        for (y, row) in screen.rows.iter().enumerate() {
            let per_row_selection = selection.filter(|s| s.contains_row(y));
            let bg_start = self.cells_bg.len();
            let fg_start = self.cells.len();
            let key = RowKey { selection: per_row_selection, screen: active, row_id: row.id };

            let mut hit = false;
            if !row.dirty {
                if let Some(cached) = self.cache.get(&key) {
                    for cell in cached {
                        let mut cell = *cell;
                        cell.grid_row = y as u16;
                        if cell.mode == MODE_BG {
                            self.cells_bg.push(cell);
                        } else {
                            self.cells.push(cell);
                        }
                    }
                    hit = true;
                }
            }

            if !hit {
                for shaped in glyphs.shape_row(row) {
                    let cell = &row.cells[shaped.col];
                    if !self.update_cell(
                        per_row_selection,
                        cell,
                        &shaped,
                        palette,
                        cell_height,
                        shaped.col,
                        y,
                        glyphs,
                    ) {
                        return false;
                    }
                }

                // Cache the freshly shaped row with rows normalized to 0;
                // bg cells lead so a hit can split them back out by mode.
                let mut cached =
                    Vec::with_capacity(self.cells_bg.len() - bg_start + self.cells.len() - fg_start);
                for cell in self.cells_bg[bg_start..].iter().chain(&self.cells[fg_start..]) {
                    let mut cell = *cell;
                    cell.grid_row = 0;
                    cached.push(cell);
                }
                self.cache.put(key, cached);
            }

            if capture_cursor && y == cursor.y {
                cursor_cell = self.cells[fg_start..]
                    .iter()
                    .find(|c| c.grid_col == cursor.x as u16 && c.mode == MODE_FG)
                    .copied();
            }
        }

        if draw_cursor && cursor.visible && screen.viewport_at_bottom {
            self.cells.push(Self::cursor_gpu_cell(screen, palette));
        }

        // The cursor rectangle covers the glyph under it; re-emit that
        // glyph on top, forced to black, so it stays readable.
        if let Some(mut overlay) = cursor_cell {
            overlay.fg = [0, 0, 0, 255];
            self.cells.push(overlay);
        }

        true
    }

    /// Emits up to four instances for one shaped glyph. Returns false when
    /// the foreground array would overflow its reservation.
    #[allow(clippy::too_many_arguments)]
    fn update_cell(
        &mut self,
        selection: Option<Selection>,
        cell: &Cell,
        shaped: &ShapedCell,
        palette: &ColorPalette,
        cell_height: u32,
        x: usize,
        y: usize,
        glyphs: &mut dyn GlyphSource,
    ) -> bool {
        let selected = selection.map(|s| s.contains(x, y)).unwrap_or(false);
        let (bg, fg) = if selected {
            (
                Some(palette.selection_bg.unwrap_or(palette.default_fg)),
                palette.selection_fg.unwrap_or(palette.default_bg),
            )
        } else if cell.inverse {
            (
                Some(palette.resolve(cell.fg).unwrap_or(palette.default_fg)),
                palette.resolve(cell.bg).unwrap_or(palette.default_bg),
            )
        } else {
            (palette.resolve(cell.bg), palette.resolve(cell.fg).unwrap_or(palette.default_fg))
        };

        let alpha = if cell.faint { 175 } else { 255 };
        let has_glyph = cell.ch != ' ' && cell.ch != '\0';
        let needed = usize::from(bg.is_some())
            + usize::from(has_glyph)
            + usize::from(cell.underline != UnderlineStyle::None)
            + usize::from(cell.strikethrough);
        if self.cells.len() + needed > self.cells.capacity() {
            return false;
        }

        let grid_width = if cell.wide { 2 } else { 1 };
        let base = GpuCell {
            grid_col: x as u16,
            grid_row: y as u16,
            fg: rgba(fg, alpha),
            grid_width,
            ..Default::default()
        };

        if let Some(bg) = bg {
            self.cells_bg.push(GpuCell { bg: rgba(bg, alpha), mode: MODE_BG, ..base });
        }

        if has_glyph {
            if let Some(glyph) = glyphs.glyph(shaped.font_index, shaped.glyph, cell_height) {
                self.cells.push(GpuCell {
                    glyph_x: glyph.x,
                    glyph_y: glyph.y,
                    glyph_width: glyph.width,
                    glyph_height: glyph.height,
                    glyph_offset_x: glyph.offset_x + shaped.x_offset,
                    glyph_offset_y: glyph.offset_y + shaped.y_offset,
                    mode: if glyph.colored { MODE_FG_COLOR } else { MODE_FG },
                    ..base
                });
            }
        }

        if cell.underline != UnderlineStyle::None {
            if let Some(sprite) = glyphs.underline(cell.underline) {
                self.cells.push(GpuCell {
                    glyph_x: sprite.x,
                    glyph_y: sprite.y,
                    glyph_width: sprite.width,
                    glyph_height: sprite.height,
                    glyph_offset_x: sprite.offset_x,
                    glyph_offset_y: sprite.offset_y,
                    mode: MODE_FG,
                    ..base
                });
            }
        }

        if cell.strikethrough {
            // No glyph; the shader derives the bar from uniforms.
            self.cells.push(GpuCell { mode: MODE_STRIKETHROUGH, ..base });
        }

        true
    }

    fn cursor_gpu_cell(screen: &Screen, palette: &ColorPalette) -> GpuCell {
        let cursor = screen.cursor;
        let mode = match cursor.style {
            CursorStyle::Box => MODE_CURSOR_RECT,
            CursorStyle::HollowBox => MODE_CURSOR_RECT_HOLLOW,
            CursorStyle::Bar => MODE_CURSOR_BAR,
        };
        let under = screen
            .rows
            .get(cursor.y)
            .and_then(|row| row.cells.get(cursor.x));
        let grid_width = if under.map(|c| c.wide).unwrap_or(false) { 2 } else { 1 };
        GpuCell {
            grid_col: cursor.x as u16,
            grid_row: cursor.y as u16,
            bg: rgba(palette.cursor, 255),
            // Alpha zero: the cursor draws no glyph of its own.
            fg: [0, 0, 0, 0],
            mode,
            grid_width,
            ..Default::default()
        }
    }
}

fn rgba(rgb: [u8; 3], alpha: u8) -> [u8; 4] {
    [rgb[0], rgb[1], rgb[2], alpha]
}

// ─── GPU streaming ─────────────────────────────────────────────────────────

/// One GPU-resident instance buffer with grow-only reallocation and a
/// high-water upload mark.
struct GpuCellBuffer {
    buffer: wgpu::Buffer,
    /// Allocated capacity in cells.
    size: usize,
    /// Cells already uploaded this generation.
    written: usize,
    label: &'static str,
}

impl GpuCellBuffer {
    fn new(device: &wgpu::Device, label: &'static str) -> Self {
        let size = 64;
        Self { buffer: Self::alloc(device, label, size), size, written: 0, label }
    }

    fn alloc(device: &wgpu::Device, label: &str, cells: usize) -> wgpu::Buffer {
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: (cells * std::mem::size_of::<GpuCell>()) as u64,
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    /// Uploads `cells`, reallocating when the CPU-side capacity outgrew the
    /// GPU allocation. Only the suffix past the high-water mark is sent.
    fn upload(&mut self, device: &wgpu::Device, queue: &wgpu::Queue, cells: &Vec<GpuCell>) {
        if self.size < cells.capacity() {
            self.buffer = Self::alloc(device, self.label, cells.capacity());
            self.size = cells.capacity();
            self.written = 0;
        }
        if self.written < cells.len() {
            let offset = (self.written * std::mem::size_of::<GpuCell>()) as u64;
            queue.write_buffer(&self.buffer, offset, bytemuck::cast_slice(&cells[self.written..]));
            self.written = cells.len();
        }
    }
}

// ─── the renderer ──────────────────────────────────────────────────────────

/// Owns the GPU context, the font engine and the cell rebuilder. Lives on
/// the render thread; terminal state is reached only through the mutex in
/// [`Renderer::render`].
pub struct Renderer {
    surface: wgpu::Surface<'static>,
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface_config: wgpu::SurfaceConfiguration,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    bind_group: wgpu::BindGroup,
    sampler: wgpu::Sampler,
    uniform_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    grey_texture: wgpu::Texture,
    color_texture: wgpu::Texture,
    bg_buffer: GpuCellBuffer,
    fg_buffer: GpuCellBuffer,
    engine: FontEngine,
    rebuilder: CellRebuilder,
    cell_size: (f32, f32),
    mailbox: EventLoopProxy<WindowMessage>,
}

impl Renderer {
    pub async fn new(
        window: Arc<winit::window::Window>,
        config: &Config,
        mailbox: EventLoopProxy<WindowMessage>,
    ) -> Result<Self, RendererError> {
        let size = window.inner_size();
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let surface = instance.create_surface(window.clone())?;
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::LowPower,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .ok_or(RendererError::AdapterNotFound)?;
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("ember device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::downlevel_defaults(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await?;

        let caps = surface.get_capabilities(&adapter);
        let format = caps
            .formats
            .iter()
            .copied()
            .find(|f| !f.is_srgb())
            .unwrap_or(caps.formats[0]);
        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode: caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &surface_config);

        let engine = FontEngine::new(config.font_family.as_deref(), config.font_size)?;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("glyph shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("glyph_shader.wgsl").into()),
        });

        let bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("cell bind group layout"),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float { filterable: true },
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 2,
                        visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float { filterable: true },
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 3,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                        count: None,
                    },
                ],
            });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("cell pipeline layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("cell pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                buffers: &[GpuCell::desc()],
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("cell uniforms"),
            size: std::mem::size_of::<Uniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("quad indices"),
            contents: bytemuck::cast_slice(&QUAD_INDICES),
            usage: wgpu::BufferUsages::INDEX,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("atlas sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let grey_texture =
            Self::make_atlas_texture(&device, &engine.atlas.grey, "greyscale atlas");
        let color_texture = Self::make_atlas_texture(&device, &engine.atlas.color, "color atlas");
        let bind_group = Self::make_bind_group(
            &device,
            &bind_group_layout,
            &uniform_buffer,
            &grey_texture,
            &color_texture,
            &sampler,
        );

        let bg_buffer = GpuCellBuffer::new(&device, "bg cells");
        let fg_buffer = GpuCellBuffer::new(&device, "fg cells");
        let rows = (size.height as f32 / engine.atlas.metrics().cell_height).max(1.0) as usize;
        let mut renderer = Self {
            surface,
            device,
            queue,
            surface_config,
            pipeline,
            bind_group_layout,
            bind_group,
            sampler,
            uniform_buffer,
            index_buffer,
            grey_texture,
            color_texture,
            bg_buffer,
            fg_buffer,
            engine,
            rebuilder: CellRebuilder::new(rows),
            cell_size: (0.0, 0.0),
            mailbox,
        };
        renderer.reset_font_metrics();
        Ok(renderer)
    }

    fn make_atlas_texture(device: &wgpu::Device, atlas: &Atlas, label: &str) -> wgpu::Texture {
        let format = match atlas.format {
            AtlasFormat::Greyscale => wgpu::TextureFormat::R8Unorm,
            AtlasFormat::Bgra => wgpu::TextureFormat::Bgra8Unorm,
        };
        device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d { width: atlas.width, height: atlas.height, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        })
    }

    fn make_bind_group(
        device: &wgpu::Device,
        layout: &wgpu::BindGroupLayout,
        uniforms: &wgpu::Buffer,
        grey: &wgpu::Texture,
        color: &wgpu::Texture,
        sampler: &wgpu::Sampler,
    ) -> wgpu::BindGroup {
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("cell bind group"),
            layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: uniforms.as_entire_binding() },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(
                        &grey.create_view(&wgpu::TextureViewDescriptor::default()),
                    ),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(
                        &color.create_view(&wgpu::TextureViewDescriptor::default()),
                    ),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::Sampler(sampler),
                },
            ],
        })
    }

    /// The current cell geometry in pixels.
    pub fn cell_size(&self) -> (f32, f32) {
        self.cell_size
    }

    /// Grid dimensions fitting the current surface.
    pub fn grid_size(&self) -> (usize, usize) {
        let cols = (self.surface_config.width as f32 / self.cell_size.0).max(1.0) as usize;
        let rows = (self.surface_config.height as f32 / self.cell_size.1).max(1.0) as usize;
        (cols, rows)
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.surface_config.width = width;
        self.surface_config.height = height;
        self.surface.configure(&self.device, &self.surface_config);
        self.upload_uniforms();
    }

    pub fn set_font_size(&mut self, size: f32) {
        if (size - self.engine.atlas.font_size()).abs() < f32::EPSILON {
            return;
        }
        self.engine.set_font_size(size);
        // Cached rows reference texels of the old atlas generation.
        self.rebuilder.clear_cache();
        self.reset_font_metrics();
    }

    /// Re-queries the 'M' metrics from the atlas, pushes the derived
    /// uniforms, and tells the window when the cell geometry moved.
    fn reset_font_metrics(&mut self) {
        let metrics = self.engine.atlas.metrics();
        let new_size = (metrics.cell_width, metrics.cell_height);
        if new_size != self.cell_size {
            self.cell_size = new_size;
            if self
                .mailbox
                .send_event(WindowMessage::CellSize { width: new_size.0, height: new_size.1 })
                .is_err()
            {
                log::warn!("window mailbox closed; cell size change dropped");
            }
        }
        self.upload_uniforms();
    }

    fn upload_uniforms(&mut self) {
        let metrics = self.engine.atlas.metrics();
        let uniforms = Uniforms {
            projection: Uniforms::ortho(
                self.surface_config.width as f32,
                self.surface_config.height as f32,
            ),
            cell_size: [metrics.cell_width, metrics.cell_height],
            strikethrough_position: metrics.strikethrough_position,
            strikethrough_thickness: metrics.strikethrough_thickness,
        };
        self.queue.write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&uniforms));
    }

    /// Uploads an atlas whose content changed; a grown atlas needs a fresh
    /// texture and bind group.
    fn flush_atlases(&mut self) {
        let mut rebind = false;
        for which in [AtlasFormat::Greyscale, AtlasFormat::Bgra] {
            let atlas = match which {
                AtlasFormat::Greyscale => &mut self.engine.atlas.grey,
                AtlasFormat::Bgra => &mut self.engine.atlas.color,
            };
            if !atlas.modified {
                continue;
            }
            if atlas.resized {
                let label = match which {
                    AtlasFormat::Greyscale => "greyscale atlas",
                    AtlasFormat::Bgra => "color atlas",
                };
                let texture = Self::make_atlas_texture(&self.device, atlas, label);
                match which {
                    AtlasFormat::Greyscale => self.grey_texture = texture,
                    AtlasFormat::Bgra => self.color_texture = texture,
                }
                rebind = true;
                atlas.resized = false;
            }
            let texture = match which {
                AtlasFormat::Greyscale => &self.grey_texture,
                AtlasFormat::Bgra => &self.color_texture,
            };
            let bpp = atlas.format.bytes_per_pixel();
            self.queue.write_texture(
                wgpu::ImageCopyTexture {
                    texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                &atlas.data,
                wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(atlas.width * bpp),
                    rows_per_image: Some(atlas.height),
                },
                wgpu::Extent3d {
                    width: atlas.width,
                    height: atlas.height,
                    depth_or_array_layers: 1,
                },
            );
            atlas.modified = false;
        }
        if rebind {
            self.bind_group = Self::make_bind_group(
                &self.device,
                &self.bind_group_layout,
                &self.uniform_buffer,
                &self.grey_texture,
                &self.color_texture,
                &self.sampler,
            );
        }
    }

    /// Renders one frame. The terminal mutex is held only long enough to
    /// snapshot the visible screen; shaping and drawing run on the clone.
    pub fn render(
        &mut self,
        terminal: &Mutex<Terminal>,
        draw_cursor: bool,
    ) -> Result<(), RendererError> {
        let (screen, selection, active, palette) = {
            let mut term = terminal.lock().expect("terminal mutex poisoned");
            let selection = term.selection_in_viewport();
            let active = term.active_screen();
            let palette = term.palette.clone();
            (term.snapshot(), selection, active, palette)
        };

        self.rebuilder.rebuild(
            active,
            selection,
            &screen,
            &palette,
            draw_cursor,
            &mut self.engine,
        );

        self.flush_atlases();

        // Full re-upload each frame for now; the high-water mark exists so
        // a later change can stream only appended cells between frames.
        self.bg_buffer.written = 0;
        self.fg_buffer.written = 0;
        self.bg_buffer.upload(&self.device, &self.queue, &self.rebuilder.cells_bg);
        self.fg_buffer.upload(&self.device, &self.queue, &self.rebuilder.cells);

        let frame = self.surface.get_current_texture()?;
        let view = frame.texture.create_view(&wgpu::TextureViewDescriptor::default());
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("frame") });

        {
            let bg = palette.default_bg;
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("cells"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: bg[0] as f64 / 255.0,
                            g: bg[1] as f64 / 255.0,
                            b: bg[2] as f64 / 255.0,
                            a: 1.0,
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &self.bind_group, &[]);
            pass.set_index_buffer(self.index_buffer.slice(..), wgpu::IndexFormat::Uint16);

            // Two identical draws differing only in their instance buffer;
            // the mode field discriminates inside the shader.
            pass.set_vertex_buffer(0, self.bg_buffer.buffer.slice(..));
            pass.draw_indexed(0..6, 0, 0..self.rebuilder.cells_bg.len() as u32);
            pass.set_vertex_buffer(0, self.fg_buffer.buffer.slice(..));
            pass.draw_indexed(0..6, 0, 0..self.rebuilder.cells.len() as u32);
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        frame.present();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::{AtlasGlyph, FontMetrics};
    use crate::terminal::{Cursor, Row};

    /// Deterministic glyph source: glyph id = codepoint, every glyph 8x12
    /// at x = id * 10. Counts shaping calls so tests can assert cache hits.
    struct FakeGlyphs {
        shape_calls: usize,
    }

    impl FakeGlyphs {
        fn new() -> Self {
            Self { shape_calls: 0 }
        }
    }

    impl GlyphSource for FakeGlyphs {
        fn shape_row(&mut self, row: &Row) -> Vec<ShapedCell> {
            self.shape_calls += 1;
            row.cells
                .iter()
                .enumerate()
                .filter(|(_, c)| !c.wide_continuation)
                .map(|(col, c)| ShapedCell {
                    col,
                    glyph: c.ch as u16,
                    font_index: 0,
                    x_offset: 0,
                    y_offset: 0,
                    width: if c.wide { 2 } else { 1 },
                })
                .collect()
        }

        fn glyph(&mut self, _font_index: u8, glyph: u16, _cell_height: u32) -> Option<AtlasGlyph> {
            if glyph == ' ' as u16 {
                return None;
            }
            Some(AtlasGlyph {
                x: glyph as u32 * 10,
                y: 0,
                width: 8,
                height: 12,
                offset_x: 1,
                offset_y: 2,
                colored: false,
            })
        }

        fn underline(&mut self, _style: UnderlineStyle) -> Option<AtlasGlyph> {
            Some(AtlasGlyph {
                x: 0,
                y: 500,
                width: 8,
                height: 2,
                offset_x: 0,
                offset_y: 14,
                colored: false,
            })
        }

        fn metrics(&self) -> FontMetrics {
            FontMetrics {
                cell_width: 8.0,
                cell_height: 16.0,
                baseline: 12.0,
                underline_position: 14.0,
                underline_thickness: 2.0,
                strikethrough_position: 8.0,
                strikethrough_thickness: 2.0,
            }
        }
    }

    fn screen_from(lines: &[&str]) -> Screen {
        let cols = lines.iter().map(|l| l.chars().count()).max().unwrap_or(1);
        let rows = lines
            .iter()
            .enumerate()
            .map(|(i, line)| {
                let mut cells: Vec<Cell> =
                    line.chars().map(|ch| Cell { ch, ..Default::default() }).collect();
                cells.resize(cols, Cell::default());
                Row { id: i as u64, cells, dirty: true }
            })
            .collect();
        Screen {
            cols,
            rows,
            cursor: Cursor { x: 0, y: 0, style: CursorStyle::Box, visible: false },
            viewport_at_bottom: true,
        }
    }

    fn rebuild(
        rb: &mut CellRebuilder,
        screen: &Screen,
        selection: Option<Selection>,
        draw_cursor: bool,
        glyphs: &mut FakeGlyphs,
    ) {
        let palette = ColorPalette::default();
        rb.rebuild(ScreenKind::Primary, selection, screen, &palette, draw_cursor, glyphs);
    }

    #[test]
    fn selection_splits_bg_and_fg() {
        let mut rb = CellRebuilder::new(1);
        let mut glyphs = FakeGlyphs::new();
        let screen = screen_from(&["AB"]);
        let palette = ColorPalette::default();
        let selection = Some(Selection::new((0, 0), (0, 0)));

        rebuild(&mut rb, &screen, selection, false, &mut glyphs);

        // Only the selected column has a background; it takes the inverted
        // default foreground.
        assert_eq!(rb.cells_bg.len(), 1);
        assert_eq!(rb.cells_bg[0].grid_col, 0);
        assert_eq!(rb.cells_bg[0].mode, MODE_BG);
        assert_eq!(&rb.cells_bg[0].bg[..3], &palette.default_fg);

        assert_eq!(rb.cells.len(), 2);
        assert_eq!(rb.cells[0].grid_col, 0);
        assert_eq!(&rb.cells[0].fg[..3], &palette.default_bg);
        assert_eq!(rb.cells[1].grid_col, 1);
        assert_eq!(&rb.cells[1].fg[..3], &palette.default_fg);
    }

    #[test]
    fn cache_hit_matches_miss_output() {
        let mut rb = CellRebuilder::new(1);
        let mut glyphs = FakeGlyphs::new();
        let mut screen = screen_from(&["AB"]);
        let selection = Some(Selection::new((0, 0), (0, 0)));

        rebuild(&mut rb, &screen, selection, false, &mut glyphs);
        let first_fg = rb.cells.clone();
        let first_bg = rb.cells_bg.clone();
        assert_eq!(glyphs.shape_calls, 1);

        // Identical input, row now clean: must come from the cache and be
        // bit-identical.
        for row in &mut screen.rows {
            row.dirty = false;
        }
        rebuild(&mut rb, &screen, selection, false, &mut glyphs);
        assert_eq!(glyphs.shape_calls, 1);
        assert_eq!(rb.cells, first_fg);
        assert_eq!(rb.cells_bg, first_bg);
    }

    #[test]
    fn cache_hit_restamps_grid_row() {
        let mut rb = CellRebuilder::new(2);
        let mut glyphs = FakeGlyphs::new();
        let screen = screen_from(&["A"]);
        rebuild(&mut rb, &screen, None, false, &mut glyphs);

        // The same row (same id, clean) shown one line lower, as after a
        // scroll.
        let mut moved = screen_from(&["", "A"]);
        moved.rows[0].id = 99;
        moved.rows[1].id = screen.rows[0].id;
        moved.rows[1].dirty = false;
        moved.rows[0].dirty = true;
        rebuild(&mut rb, &moved, None, false, &mut glyphs);

        let glyph = rb.cells.iter().find(|c| c.mode == MODE_FG).unwrap();
        assert_eq!(glyph.grid_row, 1);
        // Row 1 came from cache: one shape call for the original screen,
        // one for the now-empty row 0.
        assert_eq!(glyphs.shape_calls, 2);
    }

    #[test]
    fn dirty_rows_bypass_the_cache() {
        let mut rb = CellRebuilder::new(1);
        let mut glyphs = FakeGlyphs::new();
        let screen = screen_from(&["A"]);
        rebuild(&mut rb, &screen, None, false, &mut glyphs);
        rebuild(&mut rb, &screen, None, false, &mut glyphs);
        // Still dirty, so it shaped twice.
        assert_eq!(glyphs.shape_calls, 2);
    }

    #[test]
    fn selection_toggle_keeps_both_cache_entries() {
        let mut rb = CellRebuilder::new(1);
        let mut glyphs = FakeGlyphs::new();
        let mut screen = screen_from(&["AB"]);
        let selection = Some(Selection::new((0, 0), (1, 0)));

        rebuild(&mut rb, &screen, selection, false, &mut glyphs);
        for row in &mut screen.rows {
            row.dirty = false;
        }
        rebuild(&mut rb, &screen, None, false, &mut glyphs);
        assert_eq!(glyphs.shape_calls, 2);
        assert_eq!(rb.cache_len(), 2);

        // Toggling back hits the selected rendering without reshaping.
        rebuild(&mut rb, &screen, selection, false, &mut glyphs);
        rebuild(&mut rb, &screen, None, false, &mut glyphs);
        assert_eq!(glyphs.shape_calls, 2);
    }

    #[test]
    fn cursor_cell_is_last_with_overlay_on_top() {
        let mut rb = CellRebuilder::new(1);
        let mut glyphs = FakeGlyphs::new();
        let mut screen = screen_from(&["AB"]);
        screen.cursor = Cursor { x: 0, y: 0, style: CursorStyle::Box, visible: true };
        let palette = ColorPalette::default();

        rebuild(&mut rb, &screen, None, true, &mut glyphs);

        let n = rb.cells.len();
        let cursor = &rb.cells[n - 2];
        assert_eq!(cursor.mode, MODE_CURSOR_RECT);
        assert_eq!(&cursor.bg[..3], &palette.cursor);
        assert_eq!(cursor.fg[3], 0);

        // The glyph under the cursor is re-emitted on top in opaque black.
        let overlay = &rb.cells[n - 1];
        assert_eq!(overlay.mode, MODE_FG);
        assert_eq!(overlay.grid_col, 0);
        assert_eq!(overlay.fg, [0, 0, 0, 255]);
    }

    #[test]
    fn hollow_and_bar_cursors_skip_overlay() {
        for style in [CursorStyle::HollowBox, CursorStyle::Bar] {
            let mut rb = CellRebuilder::new(1);
            let mut glyphs = FakeGlyphs::new();
            let mut screen = screen_from(&["A"]);
            screen.cursor = Cursor { x: 0, y: 0, style, visible: true };
            rebuild(&mut rb, &screen, None, true, &mut glyphs);

            let last = rb.cells.last().unwrap();
            let expected = match style {
                CursorStyle::HollowBox => MODE_CURSOR_RECT_HOLLOW,
                _ => MODE_CURSOR_BAR,
            };
            assert_eq!(last.mode, expected);
        }
    }

    #[test]
    fn cursor_respects_scrolled_viewport() {
        let mut rb = CellRebuilder::new(1);
        let mut glyphs = FakeGlyphs::new();
        let mut screen = screen_from(&["A"]);
        screen.cursor = Cursor { x: 0, y: 0, style: CursorStyle::Box, visible: true };
        screen.viewport_at_bottom = false;
        rebuild(&mut rb, &screen, None, true, &mut glyphs);
        assert!(rb.cells.iter().all(|c| c.mode == MODE_FG));
    }

    #[test]
    fn cursor_width_honors_wide_cell() {
        let mut rb = CellRebuilder::new(1);
        let mut glyphs = FakeGlyphs::new();
        let mut screen = screen_from(&["世 "]);
        screen.rows[0].cells[0].wide = true;
        screen.rows[0].cells[1].wide_continuation = true;
        screen.cursor = Cursor { x: 0, y: 0, style: CursorStyle::Box, visible: true };
        rebuild(&mut rb, &screen, None, true, &mut glyphs);

        let cursor = rb.cells.iter().find(|c| c.mode == MODE_CURSOR_RECT).unwrap();
        assert_eq!(cursor.grid_width, 2);
    }

    #[test]
    fn inverse_swaps_colors() {
        let mut rb = CellRebuilder::new(1);
        let mut glyphs = FakeGlyphs::new();
        let mut screen = screen_from(&["A"]);
        screen.rows[0].cells[0].inverse = true;
        let palette = ColorPalette::default();
        rebuild(&mut rb, &screen, None, false, &mut glyphs);

        assert_eq!(rb.cells_bg.len(), 1);
        assert_eq!(&rb.cells_bg[0].bg[..3], &palette.default_fg);
        assert_eq!(&rb.cells[0].fg[..3], &palette.default_bg);
    }

    #[test]
    fn faint_lowers_alpha() {
        let mut rb = CellRebuilder::new(1);
        let mut glyphs = FakeGlyphs::new();
        let mut screen = screen_from(&["A"]);
        screen.rows[0].cells[0].faint = true;
        rebuild(&mut rb, &screen, None, false, &mut glyphs);
        assert_eq!(rb.cells[0].fg[3], 175);
    }

    #[test]
    fn decorations_emit_extra_cells() {
        let mut rb = CellRebuilder::new(1);
        let mut glyphs = FakeGlyphs::new();
        let mut screen = screen_from(&["A"]);
        screen.rows[0].cells[0].underline = UnderlineStyle::Curly;
        screen.rows[0].cells[0].strikethrough = true;
        rebuild(&mut rb, &screen, None, false, &mut glyphs);

        assert_eq!(rb.cells.len(), 3);
        assert_eq!(rb.cells[0].mode, MODE_FG);
        assert_eq!(rb.cells[1].mode, MODE_FG); // underline sprite
        assert_eq!(rb.cells[1].glyph_y, 500);
        assert_eq!(rb.cells[2].mode, MODE_STRIKETHROUGH);
        assert_eq!(rb.cells[2].glyph_width, 0);
    }

    #[test]
    fn array_purity_invariants() {
        let mut rb = CellRebuilder::new(2);
        let mut glyphs = FakeGlyphs::new();
        let mut screen = screen_from(&["AB", "CD"]);
        screen.rows[0].cells[0].inverse = true;
        screen.rows[1].cells[1].underline = UnderlineStyle::Single;
        screen.cursor = Cursor { x: 1, y: 1, style: CursorStyle::Box, visible: true };
        rebuild(&mut rb, &screen, None, true, &mut glyphs);

        assert!(rb.cells_bg.iter().all(|c| c.mode == MODE_BG));
        assert!(rb.cells.iter().all(|c| c.mode != MODE_BG));
        let cols = screen.cols as u16;
        let rows = screen.rows.len() as u16;
        assert!(rb
            .cells
            .iter()
            .chain(&rb.cells_bg)
            .all(|c| c.grid_col < cols && c.grid_row < rows));
    }

    #[test]
    fn overflow_grows_and_completes() {
        // Every cell carries a glyph, an underline and a strikethrough, so
        // the initial rows*cols*2+1 reservation cannot hold a full frame.
        let mut rb = CellRebuilder::new(1);
        let mut glyphs = FakeGlyphs::new();
        let mut screen = screen_from(&["ABCDEFGH"]);
        for cell in &mut screen.rows[0].cells {
            cell.underline = UnderlineStyle::Single;
            cell.strikethrough = true;
        }
        rebuild(&mut rb, &screen, None, false, &mut glyphs);
        assert_eq!(rb.cells.len(), 8 * 3);
    }
}
