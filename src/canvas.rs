use image::{GrayImage, Rgba, RgbaImage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::selection::SelectionState;

pub const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

// ============================================================================
// RECT
// ============================================================================

/// Axis-aligned pixel rectangle. The origin may sit off-canvas; use
/// [`Rect::clip_to`] before touching pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    /// Normalised rectangle spanning two arbitrary corners.
    pub fn from_corners(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self {
            x: x0.min(x1),
            y: y0.min(y1),
            w: x0.abs_diff(x1),
            h: y0.abs_diff(y1),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    pub fn right(&self) -> i64 {
        self.x as i64 + self.w as i64
    }

    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.h as i64
    }

    pub fn center(&self) -> (f32, f32) {
        (
            self.x as f32 + self.w as f32 * 0.5,
            self.y as f32 + self.h as f32 * 0.5,
        )
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x && y >= self.y && (x as i64) < self.right() && (y as i64) < self.bottom()
    }

    /// Intersection with a `width × height` surface anchored at the origin.
    /// Returns `None` when nothing is left.
    pub fn clip_to(&self, width: u32, height: u32) -> Option<Rect> {
        let x0 = (self.x as i64).max(0);
        let y0 = (self.y as i64).max(0);
        let x1 = self.right().min(width as i64);
        let y1 = self.bottom().min(height as i64);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Rect::new(x0 as i32, y0 as i32, (x1 - x0) as u32, (y1 - y0) as u32))
    }
}

/// Parse `#rgb`, `#rrggbb` or `#rrggbbaa` (leading `#` optional).
pub fn parse_hex_color(s: &str) -> Option<Rgba<u8>> {
    let hex = s.trim().trim_start_matches('#');
    let byte = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();
    match hex.len() {
        3 => {
            let mut out = [0u8, 0, 0, 255];
            for (i, c) in hex.chars().enumerate() {
                let v = c.to_digit(16)? as u8;
                out[i] = v * 17;
            }
            Some(Rgba(out))
        }
        6 => Some(Rgba([byte(0)?, byte(2)?, byte(4)?, 255])),
        8 => Some(Rgba([byte(0)?, byte(2)?, byte(4)?, byte(6)?])),
        _ => None,
    }
}

// ============================================================================
// RASTER BUFFER – owned RGBA surface
// ============================================================================

/// Owned 2D RGBA pixel surface; the storage unit of a [`Layer`].
///
/// Out-of-bounds reads return transparent pixels and out-of-bounds writes
/// are dropped, so brush and transform kernels can work on unclipped
/// footprints.
#[derive(Clone, Debug, PartialEq)]
pub struct RasterBuffer {
    image: RgbaImage,
}

impl RasterBuffer {
    pub fn new(width: u32, height: u32) -> Self {
        Self { image: RgbaImage::new(width, height) }
    }

    pub fn new_filled(width: u32, height: u32, color: Rgba<u8>) -> Self {
        Self { image: RgbaImage::from_pixel(width, height, color) }
    }

    pub fn from_image(image: RgbaImage) -> Self {
        Self { image }
    }

    /// Wrap raw RGBA bytes. `None` if the length does not match.
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        RgbaImage::from_raw(width, height, data).map(|image| Self { image })
    }

    pub fn width(&self) -> u32 { self.image.width() }

    pub fn height(&self) -> u32 { self.image.height() }

    pub fn as_image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }

    pub fn as_raw(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub(crate) fn as_raw_mut(&mut self) -> &mut [u8] {
        &mut self.image
    }

    pub fn pixel(&self, x: u32, y: u32) -> Rgba<u8> {
        if x < self.width() && y < self.height() {
            *self.image.get_pixel(x, y)
        } else {
            TRANSPARENT
        }
    }

    /// Signed-coordinate read, for footprints that hang off the edge.
    pub fn pixel_at(&self, x: i32, y: i32) -> Rgba<u8> {
        if x < 0 || y < 0 {
            return TRANSPARENT;
        }
        self.pixel(x as u32, y as u32)
    }

    pub fn put_pixel(&mut self, x: u32, y: u32, pixel: Rgba<u8>) {
        if x < self.width() && y < self.height() {
            self.image.put_pixel(x, y, pixel);
        }
    }

    pub fn get_pixel_mut(&mut self, x: u32, y: u32) -> Option<&mut Rgba<u8>> {
        if x < self.width() && y < self.height() {
            Some(self.image.get_pixel_mut(x, y))
        } else {
            None
        }
    }

    /// Copy of the region under `rect`, clipped to the surface.
    pub fn get_region(&self, rect: Rect) -> Option<RasterBuffer> {
        let r = rect.clip_to(self.width(), self.height())?;
        let sub = image::imageops::crop_imm(&self.image, r.x as u32, r.y as u32, r.w, r.h).to_image();
        Some(Self { image: sub })
    }

    /// Write `src` verbatim with its top-left at `(x, y)`. No blending.
    pub fn set_region(&mut self, x: i32, y: i32, src: &RasterBuffer) {
        for sy in 0..src.height() {
            let dy = y as i64 + sy as i64;
            if dy < 0 || dy >= self.height() as i64 {
                continue;
            }
            for sx in 0..src.width() {
                let dx = x as i64 + sx as i64;
                if dx < 0 || dx >= self.width() as i64 {
                    continue;
                }
                self.image.put_pixel(dx as u32, dy as u32, *src.image.get_pixel(sx, sy));
            }
        }
    }

    pub fn fill_region(&mut self, rect: Rect, color: Rgba<u8>) {
        let Some(r) = rect.clip_to(self.width(), self.height()) else { return };
        for y in r.y as u32..r.y as u32 + r.h {
            for x in r.x as u32..r.x as u32 + r.w {
                self.image.put_pixel(x, y, color);
            }
        }
    }

    pub fn clear_region(&mut self, rect: Rect) {
        self.fill_region(rect, TRANSPARENT);
    }

    pub fn fill(&mut self, color: Rgba<u8>) {
        for p in self.image.pixels_mut() {
            *p = color;
        }
    }

    pub fn clear(&mut self) {
        self.fill(TRANSPARENT);
    }

    /// Fill every pixel whose mask value is non-zero.
    pub fn fill_mask(&mut self, mask: &GrayImage, color: Rgba<u8>) {
        let w = self.width().min(mask.width());
        let h = self.height().min(mask.height());
        for y in 0..h {
            for x in 0..w {
                if mask.get_pixel(x, y).0[0] > 0 {
                    self.image.put_pixel(x, y, color);
                }
            }
        }
    }

    pub fn clear_mask(&mut self, mask: &GrayImage) {
        self.fill_mask(mask, TRANSPARENT);
    }

    /// Composite `src` over this surface at `(x, y)` with the given operator.
    pub fn draw_over(&mut self, src: &RasterBuffer, x: i32, y: i32, mode: BlendMode, opacity: f32) {
        for sy in 0..src.height() {
            let dy = y as i64 + sy as i64;
            if dy < 0 || dy >= self.height() as i64 {
                continue;
            }
            for sx in 0..src.width() {
                let dx = x as i64 + sx as i64;
                if dx < 0 || dx >= self.width() as i64 {
                    continue;
                }
                let top = *src.image.get_pixel(sx, sy);
                let base = self.image.get_pixel_mut(dx as u32, dy as u32);
                *base = blend_pixel(*base, top, mode, opacity);
            }
        }
    }

    pub fn memory_bytes(&self) -> usize {
        self.image.as_raw().len()
    }
}

// ============================================================================
// BLEND MODES
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlendMode {
    #[default]
    Normal,
    Multiply,
    Screen,
    Overlay,
    Darken,
    Lighten,
    ColorDodge,
    ColorBurn,
    HardLight,
    SoftLight,
    Difference,
    Exclusion,
}

impl BlendMode {
    pub fn all() -> &'static [BlendMode] {
        &[
            BlendMode::Normal,
            BlendMode::Multiply,
            BlendMode::Screen,
            BlendMode::Overlay,
            BlendMode::Darken,
            BlendMode::Lighten,
            BlendMode::ColorDodge,
            BlendMode::ColorBurn,
            BlendMode::HardLight,
            BlendMode::SoftLight,
            BlendMode::Difference,
            BlendMode::Exclusion,
        ]
    }

    /// Stable identifier, also accepted by [`BlendMode::from_name`].
    pub fn name(&self) -> &'static str {
        match self {
            BlendMode::Normal => "normal",
            BlendMode::Multiply => "multiply",
            BlendMode::Screen => "screen",
            BlendMode::Overlay => "overlay",
            BlendMode::Darken => "darken",
            BlendMode::Lighten => "lighten",
            BlendMode::ColorDodge => "color-dodge",
            BlendMode::ColorBurn => "color-burn",
            BlendMode::HardLight => "hard-light",
            BlendMode::SoftLight => "soft-light",
            BlendMode::Difference => "difference",
            BlendMode::Exclusion => "exclusion",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let key = name.trim().to_ascii_lowercase().replace(['_', ' '], "-");
        Self::all().iter().copied().find(|m| m.name() == key)
    }
}

/// Composite one `top` pixel over `base` with straight (non-premultiplied)
/// alpha, applying the separable blend function of `mode`.
pub fn blend_pixel(base: Rgba<u8>, top: Rgba<u8>, mode: BlendMode, opacity: f32) -> Rgba<u8> {
    // Fast path: fully transparent top pixel, nothing to blend
    if top[3] == 0 || opacity <= 0.0 {
        return base;
    }

    // Fast path: Normal blend, full opacity, fully opaque top pixel, overwrite
    if mode == BlendMode::Normal && opacity >= 1.0 && top[3] == 255 {
        return top;
    }

    let opacity = opacity.clamp(0.0, 1.0);

    let base_r = base[0] as f32 / 255.0;
    let base_g = base[1] as f32 / 255.0;
    let base_b = base[2] as f32 / 255.0;
    let base_a = base[3] as f32 / 255.0;

    let top_r = top[0] as f32 / 255.0;
    let top_g = top[1] as f32 / 255.0;
    let top_b = top[2] as f32 / 255.0;
    let top_a = (top[3] as f32 / 255.0) * opacity;

    let (r, g, b) = match mode {
        BlendMode::Normal => (top_r, top_g, top_b),
        BlendMode::Multiply => (base_r * top_r, base_g * top_g, base_b * top_b),
        BlendMode::Screen => (
            1.0 - (1.0 - base_r) * (1.0 - top_r),
            1.0 - (1.0 - base_g) * (1.0 - top_g),
            1.0 - (1.0 - base_b) * (1.0 - top_b),
        ),
        BlendMode::Overlay => (
            overlay_channel(base_r, top_r),
            overlay_channel(base_g, top_g),
            overlay_channel(base_b, top_b),
        ),
        BlendMode::Darken => (base_r.min(top_r), base_g.min(top_g), base_b.min(top_b)),
        BlendMode::Lighten => (base_r.max(top_r), base_g.max(top_g), base_b.max(top_b)),
        BlendMode::ColorDodge => (
            color_dodge_channel(base_r, top_r),
            color_dodge_channel(base_g, top_g),
            color_dodge_channel(base_b, top_b),
        ),
        BlendMode::ColorBurn => (
            color_burn_channel(base_r, top_r),
            color_burn_channel(base_g, top_g),
            color_burn_channel(base_b, top_b),
        ),
        BlendMode::HardLight => (
            overlay_channel(top_r, base_r),
            overlay_channel(top_g, base_g),
            overlay_channel(top_b, base_b),
        ),
        BlendMode::SoftLight => (
            soft_light_channel(base_r, top_r),
            soft_light_channel(base_g, top_g),
            soft_light_channel(base_b, top_b),
        ),
        BlendMode::Difference => ((base_r - top_r).abs(), (base_g - top_g).abs(), (base_b - top_b).abs()),
        BlendMode::Exclusion => (
            base_r + top_r - 2.0 * base_r * top_r,
            base_g + top_g - 2.0 * base_g * top_g,
            base_b + top_b - 2.0 * base_b * top_b,
        ),
    };

    // Where the backdrop is transparent the blend function has nothing to
    // act on, so the source colour shows through unchanged.
    let r = top_r + (r - top_r) * base_a;
    let g = top_g + (g - top_g) * base_a;
    let b = top_b + (b - top_b) * base_a;

    let out_a = top_a + base_a * (1.0 - top_a);
    if out_a == 0.0 {
        return TRANSPARENT;
    }

    let out_r = (r * top_a + base_r * base_a * (1.0 - top_a)) / out_a;
    let out_g = (g * top_a + base_g * base_a * (1.0 - top_a)) / out_a;
    let out_b = (b * top_a + base_b * base_a * (1.0 - top_a)) / out_a;

    Rgba([
        (out_r * 255.0).round().clamp(0.0, 255.0) as u8,
        (out_g * 255.0).round().clamp(0.0, 255.0) as u8,
        (out_b * 255.0).round().clamp(0.0, 255.0) as u8,
        (out_a * 255.0).round().clamp(0.0, 255.0) as u8,
    ])
}

fn overlay_channel(base: f32, top: f32) -> f32 {
    if base < 0.5 {
        2.0 * base * top
    } else {
        1.0 - 2.0 * (1.0 - base) * (1.0 - top)
    }
}

fn color_burn_channel(base: f32, top: f32) -> f32 {
    if base >= 1.0 {
        1.0
    } else if top <= 0.0 {
        0.0
    } else {
        (1.0 - (1.0 - base) / top).max(0.0)
    }
}

fn color_dodge_channel(base: f32, top: f32) -> f32 {
    if base <= 0.0 {
        0.0
    } else if top >= 1.0 {
        1.0
    } else {
        (base / (1.0 - top)).min(1.0)
    }
}

/// W3C Soft Light formula.
fn soft_light_channel(base: f32, top: f32) -> f32 {
    if top <= 0.5 {
        base - (1.0 - 2.0 * top) * base * (1.0 - base)
    } else {
        let d = if base <= 0.25 {
            ((16.0 * base - 12.0) * base + 4.0) * base
        } else {
            base.sqrt()
        };
        base + (2.0 * top - 1.0) * (d - base)
    }
}

// ============================================================================
// LAYER
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct Layer {
    pub name: String,
    pub visible: bool,
    /// Always within `0.0..=1.0`.
    pub opacity: f32,
    pub blend_mode: BlendMode,
    /// Clip this layer to the alpha of the nearest non-clipping layer below.
    pub clipping_mask: bool,
    pub pixels: RasterBuffer,
}

impl Layer {
    pub fn new(name: String, width: u32, height: u32, fill_color: Rgba<u8>) -> Self {
        Self::from_pixels(name, RasterBuffer::new_filled(width, height, fill_color))
    }

    pub fn from_pixels(name: String, pixels: RasterBuffer) -> Self {
        Self {
            name,
            visible: true,
            opacity: 1.0,
            blend_mode: BlendMode::Normal,
            clipping_mask: false,
            pixels,
        }
    }
}

// ============================================================================
// COMPOSITOR
// ============================================================================

/// Blend every visible layer into a `width × height` surface.
///
/// Index 0 is the topmost layer, so the stack is walked from the highest
/// index down and index 0 paints last. Rows are processed in parallel.
pub fn composite_layers(layers: &[Layer], width: u32, height: u32) -> RgbaImage {
    let mut result = RgbaImage::new(width, height);
    let row_bytes = width as usize * 4;
    if row_bytes == 0 || height == 0 {
        return result;
    }

    // (layer, clip base) pairs in paint order.
    let mut plan: Vec<(&Layer, Option<&Layer>)> = Vec::with_capacity(layers.len());
    let mut clip_base: Option<&Layer> = None;
    for layer in layers.iter().rev() {
        if !layer.clipping_mask {
            clip_base = Some(layer);
            if layer.visible {
                plan.push((layer, None));
            }
            continue;
        }
        match clip_base {
            // A clipped layer disappears together with its base.
            Some(base) if !base.visible => {}
            Some(base) => {
                if layer.visible {
                    plan.push((layer, Some(base)));
                }
            }
            None => {
                if layer.visible {
                    plan.push((layer, None));
                }
            }
        }
    }

    let dst_raw: &mut [u8] = &mut result;
    dst_raw.par_chunks_mut(row_bytes).enumerate().for_each(|(y, row)| {
        let y = y as u32;
        for (layer, base) in &plan {
            for x in 0..width {
                let mut top = layer.pixels.pixel(x, y);
                if let Some(base) = base {
                    let clip = base.pixels.pixel(x, y)[3] as u16;
                    top[3] = ((top[3] as u16 * clip + 127) / 255) as u8;
                }
                if top[3] == 0 {
                    continue;
                }
                let o = x as usize * 4;
                let under = Rgba([row[o], row[o + 1], row[o + 2], row[o + 3]]);
                let out = blend_pixel(under, top, layer.blend_mode, layer.opacity);
                row[o..o + 4].copy_from_slice(&out.0);
            }
        }
    });

    result
}

/// Downscale so the longest edge is at most `max_edge`, keeping the aspect ratio.
pub fn scale_to_max_edge(image: &RgbaImage, max_edge: u32) -> RgbaImage {
    let (w, h) = (image.width(), image.height());
    let longest = w.max(h);
    if longest <= max_edge || longest == 0 {
        return image.clone();
    }
    let scale = max_edge as f32 / longest as f32;
    let nw = ((w as f32 * scale).round() as u32).max(1);
    let nh = ((h as f32 * scale).round() as u32).max(1);
    image::imageops::resize(image, nw, nh, image::imageops::FilterType::Triangle)
}

// ============================================================================
// LAYER STACK
// ============================================================================

/// Ordered layers (index 0 = topmost) plus the current-layer cursor.
///
/// Never empty and the cursor is always in bounds. The methods here mutate
/// directly; history-recorded variants live in `ops::canvas_ops`.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerStack {
    layers: Vec<Layer>,
    current: usize,
    width: u32,
    height: u32,
}

impl LayerStack {
    pub fn new(width: u32, height: u32, name: &str, fill: Rgba<u8>) -> Self {
        Self {
            layers: vec![Layer::new(name.to_string(), width, height, fill)],
            current: 0,
            width,
            height,
        }
    }

    /// Build from existing layers. `None` if `layers` is empty.
    pub fn from_layers(width: u32, height: u32, layers: Vec<Layer>, current: usize) -> Option<Self> {
        if layers.is_empty() {
            return None;
        }
        let current = current.min(layers.len() - 1);
        Some(Self { layers, current, width, height })
    }

    pub fn width(&self) -> u32 { self.width }

    pub fn height(&self) -> u32 { self.height }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, index: usize) -> Option<&Layer> {
        self.layers.get(index)
    }

    pub fn layer_mut(&mut self, index: usize) -> Option<&mut Layer> {
        self.layers.get_mut(index)
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current_layer(&self) -> &Layer {
        &self.layers[self.current]
    }

    pub fn current_layer_mut(&mut self) -> &mut Layer {
        &mut self.layers[self.current]
    }

    pub fn check_index(&self, index: usize) -> Result<(), EngineError> {
        if index < self.layers.len() {
            Ok(())
        } else {
            Err(EngineError::OutOfBounds { index, len: self.layers.len() })
        }
    }

    pub fn set_current(&mut self, index: usize) -> Result<(), EngineError> {
        self.check_index(index)?;
        self.current = index;
        Ok(())
    }

    /// Insert a layer on top and make it current. `image` is placed at the
    /// origin of a canvas-sized buffer.
    pub fn add_layer(&mut self, name: &str, image: Option<RasterBuffer>) -> usize {
        let mut pixels = RasterBuffer::new(self.width, self.height);
        if let Some(img) = image {
            if img.width() == self.width && img.height() == self.height {
                pixels = img;
            } else {
                pixels.set_region(0, 0, &img);
            }
        }
        self.layers.insert(0, Layer::from_pixels(name.to_string(), pixels));
        self.current = 0;
        0
    }

    /// Remove a layer. The last remaining layer cannot be removed.
    pub fn remove_layer(&mut self, index: usize) -> Result<Layer, EngineError> {
        self.check_index(index)?;
        if self.layers.len() <= 1 {
            return Err(EngineError::OutOfBounds { index, len: self.layers.len() });
        }
        let removed = self.layers.remove(index);
        if self.current > index || self.current >= self.layers.len() {
            self.current = self.current.saturating_sub(1);
        }
        Ok(removed)
    }

    /// Clone a layer directly above its source; the copy becomes current.
    pub fn duplicate_layer(&mut self, index: usize) -> Result<usize, EngineError> {
        self.check_index(index)?;
        let mut dup = self.layers[index].clone();
        dup.name = format!("{} Copy", dup.name);
        self.layers.insert(index, dup);
        self.current = index;
        Ok(index)
    }

    pub fn rename(&mut self, index: usize, name: &str) -> Result<(), EngineError> {
        self.check_index(index)?;
        self.layers[index].name = name.to_string();
        Ok(())
    }

    /// Clamp into `0.0..=1.0`. NaN leaves the layer untouched.
    pub fn set_opacity(&mut self, index: usize, opacity: f32) -> Result<(), EngineError> {
        self.check_index(index)?;
        if !opacity.is_nan() {
            self.layers[index].opacity = opacity.clamp(0.0, 1.0);
        }
        Ok(())
    }

    pub fn set_blend_mode(&mut self, index: usize, mode: BlendMode) -> Result<(), EngineError> {
        self.check_index(index)?;
        self.layers[index].blend_mode = mode;
        Ok(())
    }

    pub fn toggle_visibility(&mut self, index: usize) -> Result<bool, EngineError> {
        self.check_index(index)?;
        let layer = &mut self.layers[index];
        layer.visible = !layer.visible;
        Ok(layer.visible)
    }

    pub fn set_clipping_mask(&mut self, index: usize, clipping: bool) -> Result<(), EngineError> {
        self.check_index(index)?;
        self.layers[index].clipping_mask = clipping;
        Ok(())
    }

    /// Reorder; the current layer follows its content.
    pub fn move_layer(&mut self, from: usize, to: usize) -> Result<(), EngineError> {
        self.check_index(from)?;
        self.check_index(to)?;
        let current_was_moved = self.current == from;
        let layer = self.layers.remove(from);
        self.layers.insert(to, layer);
        if current_was_moved {
            self.current = to;
        } else if from < self.current && to >= self.current {
            self.current -= 1;
        } else if from > self.current && to <= self.current {
            self.current += 1;
        }
        Ok(())
    }

    /// Composite layer `index` into layer `index - 1` with the source layer's
    /// opacity and blend mode, then drop the source.
    pub fn merge_down(&mut self, index: usize) -> Result<(), EngineError> {
        self.check_index(index)?;
        if index == 0 {
            return Err(EngineError::OutOfBounds { index, len: self.layers.len() });
        }
        let source = self.layers.remove(index);
        let target = &mut self.layers[index - 1];
        target.pixels.draw_over(&source.pixels, 0, 0, source.blend_mode, source.opacity);
        if self.current >= index {
            self.current -= 1;
        }
        Ok(())
    }

    /// Replace everything with one normal, fully opaque layer holding the
    /// composite of the visible layers.
    pub fn flatten(&mut self, name: &str) {
        let composite = self.composite();
        self.layers.clear();
        self.layers.push(Layer::from_pixels(name.to_string(), RasterBuffer::from_image(composite)));
        self.current = 0;
    }

    pub fn composite(&self) -> RgbaImage {
        composite_layers(&self.layers, self.width, self.height)
    }

    /// Composite scaled down for previews.
    pub fn composite_scaled(&self, max_edge: u32) -> RgbaImage {
        scale_to_max_edge(&self.composite(), max_edge)
    }

    /// Swap in restored content (history, file load).
    pub(crate) fn restore(&mut self, width: u32, height: u32, layers: Vec<Layer>, current: usize) {
        if layers.is_empty() {
            return;
        }
        self.current = current.min(layers.len() - 1);
        self.layers = layers;
        self.width = width;
        self.height = height;
    }

    pub fn memory_bytes(&self) -> usize {
        self.layers.iter().map(|l| l.pixels.memory_bytes() + l.name.len()).sum()
    }
}

// ============================================================================
// CANVAS STATE
// ============================================================================

/// Everything a history snapshot captures: the layers and the selection.
#[derive(Clone, Debug, PartialEq)]
pub struct CanvasState {
    pub layers: LayerStack,
    pub selection: SelectionState,
}

impl CanvasState {
    pub fn new(width: u32, height: u32, layer_name: &str, fill: Rgba<u8>) -> Self {
        Self {
            layers: LayerStack::new(width, height, layer_name, fill),
            selection: SelectionState::None,
        }
    }

    pub fn width(&self) -> u32 { self.layers.width() }

    pub fn height(&self) -> u32 { self.layers.height() }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
    const BLUE: Rgba<u8> = Rgba([0, 0, 255, 255]);

    fn stack() -> LayerStack {
        LayerStack::new(8, 6, "Background", Rgba([255, 255, 255, 255]))
    }

    #[test]
    fn add_layer_goes_on_top_and_becomes_current() {
        let mut s = LayerStack::new(800, 600, "Background", TRANSPARENT);
        s.add_layer("L2", None);
        assert_eq!(s.len(), 2);
        assert_eq!(s.layers()[0].name, "L2");
        assert_eq!(s.current_index(), 0);
    }

    #[test]
    fn last_layer_cannot_be_removed() {
        let mut s = stack();
        assert!(s.remove_layer(0).is_err());
        assert_eq!(s.len(), 1);
        assert!(s.remove_layer(5).is_err());
    }

    #[test]
    fn remove_keeps_cursor_in_bounds() {
        let mut s = stack();
        s.add_layer("A", None);
        s.add_layer("B", None);
        s.set_current(2).unwrap();
        s.remove_layer(2).unwrap();
        assert_eq!(s.current_index(), 1);
        assert_eq!(s.current_layer().name, "A");
    }

    #[test]
    fn opacity_is_clamped() {
        let mut s = stack();
        s.set_opacity(0, 1.7).unwrap();
        assert_eq!(s.layers()[0].opacity, 1.0);
        s.set_opacity(0, -3.0).unwrap();
        assert_eq!(s.layers()[0].opacity, 0.0);
        s.set_opacity(0, 0.25).unwrap();
        s.set_opacity(0, f32::NAN).unwrap();
        assert_eq!(s.layers()[0].opacity, 0.25);
        assert!(s.set_opacity(3, 0.5).is_err());
    }

    #[test]
    fn duplicate_inserts_above_source() {
        let mut s = stack();
        s.layer_mut(0).unwrap().pixels.put_pixel(1, 1, RED);
        s.add_layer("Top", None);
        let idx = s.duplicate_layer(1).unwrap();
        assert_eq!(idx, 1);
        assert_eq!(s.layers()[1].name, "Background Copy");
        assert_eq!(s.layers()[2].name, "Background");
        assert_eq!(s.layers()[1].pixels, s.layers()[2].pixels);
    }

    #[test]
    fn topmost_layer_dominates_composite() {
        let mut s = LayerStack::new(4, 4, "Bottom", BLUE);
        s.add_layer("Top", Some(RasterBuffer::new_filled(4, 4, RED)));
        assert_eq!(*s.composite().get_pixel(2, 2), RED);
        s.toggle_visibility(0).unwrap();
        assert_eq!(*s.composite().get_pixel(2, 2), BLUE);
    }

    #[test]
    fn merge_down_uses_source_opacity() {
        let mut s = LayerStack::new(2, 2, "Base", TRANSPARENT);
        s.add_layer("Paint", Some(RasterBuffer::new_filled(2, 2, RED)));
        s.layer_mut(1).unwrap().pixels.fill(BLUE);
        s.set_opacity(1, 0.5).unwrap();
        s.layer_mut(0).unwrap().pixels.clear();
        s.merge_down(1).unwrap();
        assert_eq!(s.len(), 1);
        let p = s.layers()[0].pixels.pixel(0, 0);
        assert_eq!(p[2], 255);
        assert_eq!(p[3], 128);
    }

    #[test]
    fn merge_down_of_top_layer_is_rejected() {
        let mut s = stack();
        s.add_layer("A", None);
        assert!(s.merge_down(0).is_err());
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn flatten_is_idempotent() {
        let mut s = LayerStack::new(4, 4, "Bottom", BLUE);
        s.add_layer("Top", Some(RasterBuffer::new_filled(2, 2, RED)));
        s.set_blend_mode(0, BlendMode::Screen).unwrap();
        s.set_opacity(0, 0.6).unwrap();
        s.flatten("Background");
        let once = s.composite();
        s.flatten("Background");
        assert_eq!(s.len(), 1);
        assert_eq!(s.composite(), once);
        assert_eq!(s.layers()[0].opacity, 1.0);
        assert_eq!(s.layers()[0].blend_mode, BlendMode::Normal);
    }

    #[test]
    fn clipping_layer_is_limited_to_base_alpha() {
        let mut base = RasterBuffer::new(4, 1);
        base.put_pixel(0, 0, BLUE);
        let mut s = LayerStack::new(4, 1, "Bottom", TRANSPARENT);
        s.add_layer("Base", Some(base));
        s.add_layer("Clip", Some(RasterBuffer::new_filled(4, 1, RED)));
        s.set_clipping_mask(0, true).unwrap();
        let out = s.composite();
        assert_eq!(*out.get_pixel(0, 0), RED);
        assert_eq!(out.get_pixel(1, 0)[3], 0);
    }

    #[test]
    fn multiply_darkens() {
        let out = blend_pixel(Rgba([200, 200, 200, 255]), Rgba([128, 255, 0, 255]), BlendMode::Multiply, 1.0);
        assert_eq!(out, Rgba([100, 200, 0, 255]));
    }

    #[test]
    fn blend_over_transparent_keeps_source_colour() {
        let out = blend_pixel(TRANSPARENT, RED, BlendMode::Multiply, 1.0);
        assert_eq!(out, RED);
    }

    #[test]
    fn region_round_trip() {
        let mut b = RasterBuffer::new(5, 5);
        b.fill_region(Rect::new(1, 1, 2, 2), RED);
        let region = b.get_region(Rect::new(0, 0, 3, 3)).unwrap();
        b.clear_region(Rect::new(-4, -4, 100, 100));
        assert_eq!(b.pixel(1, 1), TRANSPARENT);
        b.set_region(0, 0, &region);
        assert_eq!(b.pixel(2, 2), RED);
        assert_eq!(b.pixel(3, 3), TRANSPARENT);
    }

    #[test]
    fn hex_colors() {
        assert_eq!(parse_hex_color("#ff0000"), Some(RED));
        assert_eq!(parse_hex_color("0f08"), None);
        assert_eq!(parse_hex_color("#00f"), Some(BLUE));
        assert_eq!(parse_hex_color("#11223344"), Some(Rgba([0x11, 0x22, 0x33, 0x44])));
        assert_eq!(parse_hex_color("#zzzzzz"), None);
    }

    #[test]
    fn blend_mode_names_round_trip() {
        for m in BlendMode::all() {
            assert_eq!(BlendMode::from_name(m.name()), Some(*m));
        }
        assert_eq!(BlendMode::from_name("Color Dodge"), Some(BlendMode::ColorDodge));
    }
}
