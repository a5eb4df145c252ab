use image::{Rgba, RgbaImage};
use rayon::prelude::*;

use crate::canvas::{BlendMode, CanvasState, LayerStack, RasterBuffer, Rect, blend_pixel};
use crate::components::history::HistoryManager;
use crate::error::EngineError;

const MIN_SCALE: f32 = 0.01;

// ============================================================================
// FREE TRANSFORM OVERLAY
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq)]
enum OverlayDrag {
    Move { last: (f32, f32) },
    Handle {
        start_scale: f32,
        start_rotation: f32,
        start_distance: f32,
        start_angle: f32,
    },
}

/// A region lifted off a layer for interactive move/scale/rotate.
///
/// Entering clears the region from the layer; [`TransformOverlay::cancel`]
/// puts it back untouched and [`TransformOverlay::confirm`] rasterises the
/// transformed pixels with one history entry.
#[derive(Clone, Debug)]
pub struct TransformOverlay {
    layer_index: usize,
    rect: Rect,
    backup: RasterBuffer,
    /// Isolated working surface, same size as `rect`.
    working: RasterBuffer,
    pub offset: (f32, f32),
    pub scale: f32,
    /// Radians, clockwise in canvas space (y down).
    pub rotation: f32,
    drag: Option<OverlayDrag>,
}

impl TransformOverlay {
    /// Lift `rect` off the current layer.
    pub fn begin(stack: &mut LayerStack, rect: Rect) -> Result<Self, EngineError> {
        let rect = rect
            .clip_to(stack.width(), stack.height())
            .ok_or(EngineError::SurfaceUnavailable)?;
        let layer_index = stack.current_index();
        let layer = stack.current_layer_mut();
        let backup = layer.pixels.get_region(rect).ok_or(EngineError::SurfaceUnavailable)?;
        layer.pixels.clear_region(rect);
        log::debug!("transform: lifted {:?} from layer {}", rect, layer_index);
        Ok(Self {
            layer_index,
            rect,
            working: backup.clone(),
            backup,
            offset: (0.0, 0.0),
            scale: 1.0,
            rotation: 0.0,
            drag: None,
        })
    }

    pub fn layer_index(&self) -> usize {
        self.layer_index
    }

    pub fn source_rect(&self) -> Rect {
        self.rect
    }

    pub fn working_surface(&self) -> &RasterBuffer {
        &self.working
    }

    pub fn center(&self) -> (f32, f32) {
        let (cx, cy) = self.rect.center();
        (cx + self.offset.0, cy + self.offset.1)
    }

    /// Transformed corners: top-left, top-right, bottom-right, bottom-left.
    pub fn handle_positions(&self) -> [(f32, f32); 4] {
        let hw = self.rect.w as f32 * 0.5;
        let hh = self.rect.h as f32 * 0.5;
        let (c, s) = (self.rotation.cos(), self.rotation.sin());
        let (cx, cy) = self.center();
        [(-hw, -hh), (hw, -hh), (hw, hh), (-hw, hh)].map(|(x, y)| {
            let (x, y) = (x * self.scale, y * self.scale);
            (cx + x * c - y * s, cy + x * s + y * c)
        })
    }

    pub fn hit_handle(&self, pos: (f32, f32), radius: f32) -> Option<usize> {
        self.handle_positions().iter().position(|&(hx, hy)| {
            let (dx, dy) = (pos.0 - hx, pos.1 - hy);
            dx * dx + dy * dy <= radius * radius
        })
    }

    /// Start a drag: a corner handle scales and rotates, anything else moves.
    pub fn pointer_down(&mut self, pos: (f32, f32), handle_radius: f32) {
        let (cx, cy) = self.center();
        let (dx, dy) = (pos.0 - cx, pos.1 - cy);
        let distance = (dx * dx + dy * dy).sqrt();
        self.drag = match self.hit_handle(pos, handle_radius) {
            Some(_) if distance > f32::EPSILON => Some(OverlayDrag::Handle {
                start_scale: self.scale,
                start_rotation: self.rotation,
                start_distance: distance,
                start_angle: dy.atan2(dx),
            }),
            _ => Some(OverlayDrag::Move { last: pos }),
        };
    }

    pub fn pointer_move(&mut self, pos: (f32, f32)) {
        let (cx, cy) = self.center();
        match &mut self.drag {
            None => {}
            Some(OverlayDrag::Move { last }) => {
                self.offset.0 += pos.0 - last.0;
                self.offset.1 += pos.1 - last.1;
                *last = pos;
            }
            Some(OverlayDrag::Handle { start_scale, start_rotation, start_distance, start_angle }) => {
                let (dx, dy) = (pos.0 - cx, pos.1 - cy);
                let distance = (dx * dx + dy * dy).sqrt();
                self.scale = (*start_scale * distance / *start_distance).max(MIN_SCALE);
                self.rotation = *start_rotation + (dy.atan2(dx) - *start_angle);
            }
        }
    }

    pub fn pointer_up(&mut self) {
        self.drag = None;
    }

    pub fn is_dragging(&self) -> bool {
        self.drag.is_some()
    }

    /// Commit: record one history entry of the pre-transform layer, then
    /// draw the working surface at its transformed placement. Returns the
    /// area that changed.
    pub fn confirm(self, state: &mut CanvasState, history: &mut HistoryManager) -> Result<Rect, EngineError> {
        state.layers.check_index(self.layer_index).map_err(|_| EngineError::SurfaceUnavailable)?;

        // History must see the layer as it was before the lift.
        if let Some(layer) = state.layers.layer_mut(self.layer_index) {
            layer.pixels.set_region(self.rect.x, self.rect.y, &self.backup);
        }
        history.save_history(state, "Free Transform");

        let center = self.center();
        let Some(layer) = state.layers.layer_mut(self.layer_index) else {
            return Err(EngineError::SurfaceUnavailable);
        };
        layer.pixels.clear_region(self.rect);
        let drawn = draw_transformed(&mut layer.pixels, self.working.as_image(), center, self.rotation, self.scale);
        log::info!(
            "transform: confirmed on layer {} (offset {:?}, scale {:.3}, rotation {:.3})",
            self.layer_index,
            self.offset,
            self.scale,
            self.rotation
        );
        Ok(drawn.map_or(self.rect, |d| union(d, self.rect)))
    }

    /// Put the lifted pixels back. No history entry.
    pub fn cancel(self, stack: &mut LayerStack) -> Result<(), EngineError> {
        let layer = stack.layer_mut(self.layer_index).ok_or(EngineError::SurfaceUnavailable)?;
        layer.pixels.set_region(self.rect.x, self.rect.y, &self.backup);
        log::info!("transform: cancelled on layer {}", self.layer_index);
        Ok(())
    }
}

fn union(a: Rect, b: Rect) -> Rect {
    let x0 = a.x.min(b.x);
    let y0 = a.y.min(b.y);
    let x1 = a.right().max(b.right()) as i32;
    let y1 = a.bottom().max(b.bottom()) as i32;
    Rect::from_corners(x0, y0, x1, y1)
}

/// Source-over `src` onto `dst`, centred at `center`, rotated then scaled
/// about that centre. Inverse-maps each destination pixel with bilinear
/// sampling; rows run in parallel. Returns the touched area.
pub fn draw_transformed(
    dst: &mut RasterBuffer,
    src: &RgbaImage,
    center: (f32, f32),
    rotation: f32,
    scale: f32,
) -> Option<Rect> {
    let scale = scale.max(MIN_SCALE);
    let inv_scale = 1.0 / scale;
    let (sin, cos) = rotation.sin_cos();
    let half_w = src.width() as f32 * 0.5;
    let half_h = src.height() as f32 * 0.5;

    // Forward-mapped corners give the destination bounds.
    let corners = [(-half_w, -half_h), (half_w, -half_h), (half_w, half_h), (-half_w, half_h)]
        .map(|(x, y)| (center.0 + (x * cos - y * sin) * scale, center.1 + (x * sin + y * cos) * scale));
    let min_x = corners.iter().map(|c| c.0).fold(f32::INFINITY, f32::min).floor() as i32;
    let min_y = corners.iter().map(|c| c.1).fold(f32::INFINITY, f32::min).floor() as i32;
    let max_x = corners.iter().map(|c| c.0).fold(f32::NEG_INFINITY, f32::max).ceil() as i32;
    let max_y = corners.iter().map(|c| c.1).fold(f32::NEG_INFINITY, f32::max).ceil() as i32;
    let bounds = Rect::from_corners(min_x, min_y, max_x, max_y).clip_to(dst.width(), dst.height())?;

    let (src_w, src_h) = (src.width() as i64, src.height() as i64);
    let row_bytes = dst.width() as usize * 4;
    let x_start = bounds.x as usize;
    let x_end = x_start + bounds.w as usize;

    dst.as_raw_mut()
        .par_chunks_mut(row_bytes)
        .enumerate()
        .skip(bounds.y as usize)
        .take(bounds.h as usize)
        .for_each(|(dy, row)| {
            let py = dy as f32 + 0.5 - center.1;
            for dx in x_start..x_end {
                let px = dx as f32 + 0.5 - center.0;
                // R(-θ) then 1/s, back into working-surface coordinates.
                let lx = (px * cos + py * sin) * inv_scale + half_w;
                let ly = (-px * sin + py * cos) * inv_scale + half_h;
                // Weighted sum of the four surrounding texels; outside the
                // surface counts as transparent.
                let (sx, sy) = (lx - 0.5, ly - 0.5);
                let (x0, y0) = (sx.floor(), sy.floor());
                let (fx, fy) = (sx - x0, sy - y0);
                let mut acc = [0f32; 4];
                for (ox, oy, weight) in [
                    (0, 0, (1.0 - fx) * (1.0 - fy)),
                    (1, 0, fx * (1.0 - fy)),
                    (0, 1, (1.0 - fx) * fy),
                    (1, 1, fx * fy),
                ] {
                    let (tx, ty) = (x0 as i64 + ox, y0 as i64 + oy);
                    if weight <= 0.0 || tx < 0 || ty < 0 || tx >= src_w || ty >= src_h {
                        continue;
                    }
                    let texel = src.get_pixel(tx as u32, ty as u32);
                    for (sum, &v) in acc.iter_mut().zip(texel.0.iter()) {
                        *sum += v as f32 * weight;
                    }
                }
                let top = Rgba(acc.map(|v| v.round().clamp(0.0, 255.0) as u8));
                if top[3] == 0 {
                    continue;
                }
                let o = dx * 4;
                let base = Rgba([row[o], row[o + 1], row[o + 2], row[o + 3]]);
                let out = blend_pixel(base, top, BlendMode::Normal, 1.0);
                row[o..o + 4].copy_from_slice(&out.0);
            }
        });

    Some(bounds)
}
