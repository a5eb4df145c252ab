use image::Rgba;

use crate::canvas::{BlendMode, RasterBuffer, Rect, blend_pixel};

pub const MIN_LINE_WIDTH: f32 = 1.0;
pub const MAX_LINE_WIDTH: f32 = 1000.0;

/// Peak alpha of a bleed daub at 100 % blend strength.
const BLEED_PEAK_ALPHA: f32 = 0.5;
/// Clusters beyond this count are folded into their nearest neighbour.
const MAX_BLEED_CLUSTERS: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ColorMixMode {
    #[default]
    Normal,
    Spectral,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BrushTool {
    #[default]
    Brush,
    Eraser,
}

/// Per-session brush parameters. Percentages are whole numbers `0..=100`.
#[derive(Clone, Debug, PartialEq)]
pub struct BrushSettings {
    pub tool: BrushTool,
    line_width: f32,
    opacity: u8,
    mix_ratio: u8,
    blend_strength: u8,
    pub color_mix_mode: ColorMixMode,
    pub color: Rgba<u8>,
}

impl Default for BrushSettings {
    fn default() -> Self {
        Self {
            tool: BrushTool::Brush,
            line_width: 10.0,
            opacity: 100,
            mix_ratio: 100,
            blend_strength: 0,
            color_mix_mode: ColorMixMode::Normal,
            color: Rgba([0, 0, 0, 255]),
        }
    }
}

impl BrushSettings {
    pub fn line_width(&self) -> f32 { self.line_width }
    pub fn opacity(&self) -> u8 { self.opacity }
    pub fn mix_ratio(&self) -> u8 { self.mix_ratio }
    pub fn blend_strength(&self) -> u8 { self.blend_strength }

    pub fn set_line_width(&mut self, px: f32) {
        if px.is_finite() {
            self.line_width = px.clamp(MIN_LINE_WIDTH, MAX_LINE_WIDTH);
        }
    }

    /// `0` switches the brush into bleed mode.
    pub fn set_opacity(&mut self, pct: u8) {
        self.opacity = pct.min(100);
    }

    /// Weight of the chosen colour against the colour already under the brush.
    pub fn set_mix_ratio(&mut self, pct: u8) {
        self.mix_ratio = pct.min(100);
    }

    pub fn set_blend_strength(&mut self, pct: u8) {
        self.blend_strength = pct.min(100);
    }
}

// ============================================================================
// COLOUR MIXING
// ============================================================================

/// Two-colour mixing function. `ratio` is the weight of `b`: 0 yields `a`,
/// 1 yields `b`. Returning `None` signals the mix could not be computed.
pub trait ColorMixer: Send + Sync {
    fn mix(&self, a: Rgba<u8>, b: Rgba<u8>, ratio: f32) -> Option<Rgba<u8>>;
}

/// Per-channel linear interpolation in sRGB.
pub fn mix_normal(a: Rgba<u8>, b: Rgba<u8>, ratio: f32) -> Rgba<u8> {
    let t = if ratio.is_nan() { 0.0 } else { ratio.clamp(0.0, 1.0) };
    let lerp = |x: u8, y: u8| (x as f32 + (y as f32 - x as f32) * t).round().clamp(0.0, 255.0) as u8;
    Rgba([lerp(a[0], b[0]), lerp(a[1], b[1]), lerp(a[2], b[2]), lerp(a[3], b[3])])
}

/// Pigment-style mix through `mixer`, falling back to [`mix_normal`].
pub fn mix_spectral(mixer: &dyn ColorMixer, a: Rgba<u8>, b: Rgba<u8>, ratio: f32) -> Rgba<u8> {
    mixer.mix(a, b, ratio).unwrap_or_else(|| {
        log::debug!("spectral mix failed, using linear mix");
        mix_normal(a, b, ratio)
    })
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LinearMixer;

impl ColorMixer for LinearMixer {
    fn mix(&self, a: Rgba<u8>, b: Rgba<u8>, ratio: f32) -> Option<Rgba<u8>> {
        Some(mix_normal(a, b, ratio))
    }
}

/// Single-constant Kubelka–Munk model applied per channel in linear light.
///
/// Each channel's reflectance R maps to an absorption/scattering ratio
/// `K/S = (1 - R)² / 2R`; ratios mix linearly and map back through
/// `R = 1 + K/S - sqrt((K/S)² + 2 K/S)`. Mixing this way darkens like
/// paint instead of averaging like light.
#[derive(Clone, Copy, Debug, Default)]
pub struct KubelkaMunkMixer;

const MIN_REFLECTANCE: f64 = 1e-4;

fn srgb_to_linear(c: f64) -> f64 {
    if c <= 0.04045 { c / 12.92 } else { ((c + 0.055) / 1.055).powf(2.4) }
}

fn linear_to_srgb(c: f64) -> f64 {
    if c <= 0.0031308 { c * 12.92 } else { 1.055 * c.powf(1.0 / 2.4) - 0.055 }
}

fn reflectance_to_ks(r: f64) -> f64 {
    let r = r.clamp(MIN_REFLECTANCE, 1.0);
    (1.0 - r) * (1.0 - r) / (2.0 * r)
}

/// `1 + ks - sqrt(ks² + 2ks)`, rearranged to avoid cancellation at high ks.
fn ks_to_reflectance(ks: f64) -> f64 {
    1.0 / (1.0 + ks + (ks * ks + 2.0 * ks).sqrt())
}

impl ColorMixer for KubelkaMunkMixer {
    fn mix(&self, a: Rgba<u8>, b: Rgba<u8>, ratio: f32) -> Option<Rgba<u8>> {
        if !ratio.is_finite() {
            return None;
        }
        let t = ratio.clamp(0.0, 1.0) as f64;
        let mut out = [0u8; 4];
        for c in 0..3 {
            let ka = reflectance_to_ks(srgb_to_linear(a[c] as f64 / 255.0));
            let kb = reflectance_to_ks(srgb_to_linear(b[c] as f64 / 255.0));
            let r = ks_to_reflectance(ka + (kb - ka) * t);
            let v = linear_to_srgb(r.clamp(0.0, 1.0)) * 255.0;
            if !v.is_finite() {
                return None;
            }
            out[c] = v.round().clamp(0.0, 255.0) as u8;
        }
        out[3] = (a[3] as f64 + (b[3] as f64 - a[3] as f64) * t).round() as u8;
        Some(Rgba(out))
    }
}

// ============================================================================
// BRUSH ENGINE
// ============================================================================

/// Rasterises strokes into a layer buffer.
///
/// The engine never touches history; the caller snapshots once before
/// [`BrushEngine::begin_stroke`].
pub struct BrushEngine {
    pub settings: BrushSettings,
    pub bleed_threshold: u8,
    spectral: Box<dyn ColorMixer>,
    last_pos: Option<(f32, f32)>,
}

impl BrushEngine {
    pub fn new(settings: BrushSettings, bleed_threshold: u8) -> Self {
        Self {
            settings,
            bleed_threshold,
            spectral: Box::new(KubelkaMunkMixer),
            last_pos: None,
        }
    }

    /// Replace the pigment model used in spectral mode.
    pub fn with_spectral_mixer(mut self, mixer: Box<dyn ColorMixer>) -> Self {
        self.spectral = mixer;
        self
    }

    pub fn is_stroking(&self) -> bool {
        self.last_pos.is_some()
    }

    /// Mix with the active colour-mix mode.
    pub fn mix(&self, a: Rgba<u8>, b: Rgba<u8>, ratio: f32) -> Rgba<u8> {
        match self.settings.color_mix_mode {
            ColorMixMode::Normal => mix_normal(a, b, ratio),
            ColorMixMode::Spectral => mix_spectral(self.spectral.as_ref(), a, b, ratio),
        }
    }

    /// Start a stroke and paint its first sample. Returns the touched area.
    pub fn begin_stroke(&mut self, layer: &mut RasterBuffer, pos: (f32, f32)) -> Option<Rect> {
        self.last_pos = Some(pos);
        self.paint_segment(layer, pos, pos)
    }

    /// Extend the stroke from the previous pointer position.
    pub fn continue_stroke(&mut self, layer: &mut RasterBuffer, pos: (f32, f32)) -> Option<Rect> {
        let from = self.last_pos?;
        self.last_pos = Some(pos);
        self.paint_segment(layer, from, pos)
    }

    pub fn end_stroke(&mut self) {
        self.last_pos = None;
    }

    fn radius(&self) -> f32 {
        (self.settings.line_width / 2.0).max(0.5)
    }

    /// Paint one segment according to tool and mode.
    pub fn paint_segment(&self, layer: &mut RasterBuffer, from: (f32, f32), to: (f32, f32)) -> Option<Rect> {
        let r = self.radius();
        let s = &self.settings;

        if s.tool == BrushTool::Eraser {
            erase_capsule(layer, from, to, r);
            return segment_bounds(from, to, r, layer);
        }

        let strength = s.blend_strength as f32 / 100.0;
        if s.opacity == 0 {
            if s.blend_strength == 0 {
                return None;
            }
            let daub_radius = (r * strength).max(0.5);
            let peak = strength * BLEED_PEAK_ALPHA;
            for p in stroke_samples(layer, from, to, r) {
                if let Some(color) = self.bleed_color(layer, p, r) {
                    paint_daub(layer, p, daub_radius, 0.0, color, peak);
                }
            }
            return segment_bounds(from, to, r, layer);
        }

        let alpha = s.opacity as f32 / 100.0;
        if s.blend_strength == 0 {
            let color = self.colored_mode_color(layer, to, r);
            stroke_capsule(layer, from, to, r, color, alpha);
        } else {
            let inner = r * (1.0 - strength);
            for p in stroke_samples(layer, from, to, r) {
                let color = self.colored_mode_color(layer, p, r);
                paint_daub(layer, p, r, inner, color, alpha);
            }
        }
        segment_bounds(from, to, r, layer)
    }

    /// The chosen colour, pulled toward the paint already under the brush
    /// when the mix ratio is below 100 %.
    fn colored_mode_color(&self, layer: &RasterBuffer, center: (f32, f32), r: f32) -> Rgba<u8> {
        let chosen = self.settings.color;
        if self.settings.mix_ratio >= 100 {
            return chosen;
        }
        match average_under(layer, center, r) {
            Some(under) => {
                let mut mixed = self.mix(under, chosen, self.settings.mix_ratio as f32 / 100.0);
                mixed[3] = chosen[3];
                mixed
            }
            None => chosen,
        }
    }

    /// Mix of the distinct colour clusters in the footprint, weighted by
    /// their pixel counts. `None` over fully transparent paint.
    fn bleed_color(&self, layer: &RasterBuffer, center: (f32, f32), r: f32) -> Option<Rgba<u8>> {
        let mut clusters = find_clusters(layer, center, r, self.bleed_threshold);
        clusters.sort_by(|a, b| b.count.cmp(&a.count));
        let (first, rest) = clusters.split_first()?;
        let mut acc = first.mean();
        let mut weight = first.count as f32;
        for c in rest {
            let n = c.count as f32;
            acc = self.mix(acc, c.mean(), n / (weight + n));
            weight += n;
        }
        Some(acc)
    }
}

struct ColorCluster {
    representative: [u8; 3],
    sum: [u64; 4],
    count: u32,
}

impl ColorCluster {
    fn mean(&self) -> Rgba<u8> {
        let n = self.count.max(1) as u64;
        Rgba([
            (self.sum[0] / n) as u8,
            (self.sum[1] / n) as u8,
            (self.sum[2] / n) as u8,
            (self.sum[3] / n) as u8,
        ])
    }

    fn add(&mut self, p: Rgba<u8>) {
        for c in 0..4 {
            self.sum[c] += p[c] as u64;
        }
        self.count += 1;
    }
}

/// Greedy clustering of non-transparent footprint pixels: a pixel joins the
/// first cluster whose representative is within `threshold` on every RGB
/// channel, otherwise it starts a new cluster.
fn find_clusters(layer: &RasterBuffer, center: (f32, f32), r: f32, threshold: u8) -> Vec<ColorCluster> {
    let mut clusters: Vec<ColorCluster> = Vec::new();
    for_each_in_disc(layer, center, r, |x, y, _| {
        let p = layer.pixel(x, y);
        if p[3] == 0 {
            return;
        }
        let rgb = [p[0], p[1], p[2]];
        let close = |rep: &[u8; 3]| (0..3).all(|c| rep[c].abs_diff(rgb[c]) <= threshold);
        if let Some(cluster) = clusters.iter_mut().find(|c| close(&c.representative)) {
            cluster.add(p);
        } else if clusters.len() < MAX_BLEED_CLUSTERS {
            let mut cluster = ColorCluster { representative: rgb, sum: [0; 4], count: 0 };
            cluster.add(p);
            clusters.push(cluster);
        } else if let Some(nearest) = clusters.iter_mut().min_by_key(|c| {
            (0..3).map(|i| c.representative[i].abs_diff(rgb[i]) as u32).sum::<u32>()
        }) {
            nearest.add(p);
        }
    });
    clusters
}

/// Alpha-weighted mean colour of the footprint.
fn average_under(layer: &RasterBuffer, center: (f32, f32), r: f32) -> Option<Rgba<u8>> {
    let mut sum = [0f64; 3];
    let mut alpha_sum = 0f64;
    let mut count = 0u32;
    for_each_in_disc(layer, center, r, |x, y, _| {
        let p = layer.pixel(x, y);
        let a = p[3] as f64;
        sum[0] += p[0] as f64 * a;
        sum[1] += p[1] as f64 * a;
        sum[2] += p[2] as f64 * a;
        alpha_sum += a;
        count += 1;
    });
    if alpha_sum <= 0.0 || count == 0 {
        return None;
    }
    Some(Rgba([
        (sum[0] / alpha_sum).round() as u8,
        (sum[1] / alpha_sum).round() as u8,
        (sum[2] / alpha_sum).round() as u8,
        (alpha_sum / count as f64).round() as u8,
    ]))
}

/// Visit in-bounds pixels whose centre lies within `r` of `center`.
fn for_each_in_disc(layer: &RasterBuffer, center: (f32, f32), r: f32, mut f: impl FnMut(u32, u32, f32)) {
    let (cx, cy) = center;
    let min_x = (cx - r).floor().max(0.0) as u32;
    let min_y = (cy - r).floor().max(0.0) as u32;
    let max_x = ((cx + r).ceil().max(0.0) as u32).min(layer.width());
    let max_y = ((cy + r).ceil().max(0.0) as u32).min(layer.height());
    for y in min_y..max_y {
        for x in min_x..max_x {
            let dx = x as f32 + 0.5 - cx;
            let dy = y as f32 + 0.5 - cy;
            let d = (dx * dx + dy * dy).sqrt();
            if d <= r {
                f(x, y, d);
            }
        }
    }
}

/// Points along `from → to` at ~1 px spacing, excluding `from` unless the
/// segment is degenerate. Only the part of the segment within `r` of the
/// layer is sampled, so far-off pointer positions cost nothing.
fn stroke_samples(layer: &RasterBuffer, from: (f32, f32), to: (f32, f32), r: f32) -> Vec<(f32, f32)> {
    let min = (-r, -r);
    let max = (layer.width() as f32 + r, layer.height() as f32 + r);
    let Some((from, to)) = clip_segment(from, to, min, max) else {
        return Vec::new();
    };
    let dx = to.0 - from.0;
    let dy = to.1 - from.1;
    let dist = (dx * dx + dy * dy).sqrt();
    if dist < 1e-3 {
        return vec![to];
    }
    let steps = dist.ceil() as usize;
    (1..=steps)
        .map(|i| {
            let t = i as f32 / steps as f32;
            (from.0 + dx * t, from.1 + dy * t)
        })
        .collect()
}

/// Liang-Barsky clip of `a → b` against the box `min..max`. `None` when the
/// segment misses the box or has a non-finite end.
fn clip_segment(a: (f32, f32), b: (f32, f32), min: (f32, f32), max: (f32, f32)) -> Option<((f32, f32), (f32, f32))> {
    if ![a.0, a.1, b.0, b.1].iter().all(|v| v.is_finite()) {
        return None;
    }
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let mut t0 = 0.0f32;
    let mut t1 = 1.0f32;
    for (p, q) in [(-dx, a.0 - min.0), (dx, max.0 - a.0), (-dy, a.1 - min.1), (dy, max.1 - a.1)] {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
            continue;
        }
        let t = q / p;
        if p < 0.0 {
            t0 = t0.max(t);
        } else {
            t1 = t1.min(t);
        }
        if t0 > t1 {
            return None;
        }
    }
    Some(((a.0 + dx * t0, a.1 + dy * t0), (a.0 + dx * t1, a.1 + dy * t1)))
}

fn distance_to_segment(p: (f32, f32), a: (f32, f32), b: (f32, f32)) -> f32 {
    let (abx, aby) = (b.0 - a.0, b.1 - a.1);
    let len_sq = abx * abx + aby * aby;
    let t = if len_sq <= f32::EPSILON {
        0.0
    } else {
        (((p.0 - a.0) * abx + (p.1 - a.1) * aby) / len_sq).clamp(0.0, 1.0)
    };
    let (qx, qy) = (a.0 + abx * t, a.1 + aby * t);
    ((p.0 - qx).powi(2) + (p.1 - qy).powi(2)).sqrt()
}

/// Visit pixels covered by the capsule around `a → b`, with a 1 px
/// anti-aliased rim. Coverage is passed in `0..=1`.
fn for_each_in_capsule(layer: &RasterBuffer, a: (f32, f32), b: (f32, f32), r: f32, mut f: impl FnMut(u32, u32, f32)) {
    let min_x = (a.0.min(b.0) - r - 1.0).floor().max(0.0) as u32;
    let min_y = (a.1.min(b.1) - r - 1.0).floor().max(0.0) as u32;
    let max_x = ((a.0.max(b.0) + r + 1.0).ceil().max(0.0) as u32).min(layer.width());
    let max_y = ((a.1.max(b.1) + r + 1.0).ceil().max(0.0) as u32).min(layer.height());
    for y in min_y..max_y {
        for x in min_x..max_x {
            let d = distance_to_segment((x as f32 + 0.5, y as f32 + 0.5), a, b);
            let coverage = (r + 0.5 - d).clamp(0.0, 1.0);
            if coverage > 0.0 {
                f(x, y, coverage);
            }
        }
    }
}

fn erase_capsule(layer: &mut RasterBuffer, a: (f32, f32), b: (f32, f32), r: f32) {
    let mut hits = Vec::new();
    for_each_in_capsule(layer, a, b, r, |x, y, cov| hits.push((x, y, cov)));
    for (x, y, cov) in hits {
        if let Some(p) = layer.get_pixel_mut(x, y) {
            let remaining = p[3] as f32 * (1.0 - cov);
            p[3] = remaining.round() as u8;
            if p[3] == 0 {
                *p = Rgba([0, 0, 0, 0]);
            }
        }
    }
}

fn stroke_capsule(layer: &mut RasterBuffer, a: (f32, f32), b: (f32, f32), r: f32, color: Rgba<u8>, alpha: f32) {
    let mut hits = Vec::new();
    for_each_in_capsule(layer, a, b, r, |x, y, cov| hits.push((x, y, cov)));
    for (x, y, cov) in hits {
        paint_pixel(layer, x, y, color, alpha * cov);
    }
}

/// Radial daub: full `alpha` inside `inner`, smoothstep falloff to zero at `r`.
fn paint_daub(layer: &mut RasterBuffer, center: (f32, f32), r: f32, inner: f32, color: Rgba<u8>, alpha: f32) {
    let mut hits = Vec::new();
    for_each_in_disc(layer, center, r, |x, y, d| hits.push((x, y, d)));
    let fade = (r - inner).max(f32::EPSILON);
    for (x, y, d) in hits {
        let a = if d <= inner {
            alpha
        } else {
            let t = 1.0 - ((d - inner) / fade).clamp(0.0, 1.0);
            alpha * t * t * (3.0 - 2.0 * t)
        };
        paint_pixel(layer, x, y, color, a);
    }
}

fn paint_pixel(layer: &mut RasterBuffer, x: u32, y: u32, color: Rgba<u8>, alpha: f32) {
    if alpha <= 0.0 {
        return;
    }
    let top = Rgba([color[0], color[1], color[2], (color[3] as f32 * alpha.min(1.0)).round() as u8]);
    if let Some(p) = layer.get_pixel_mut(x, y) {
        *p = blend_pixel(*p, top, BlendMode::Normal, 1.0);
    }
}

fn segment_bounds(a: (f32, f32), b: (f32, f32), r: f32, layer: &RasterBuffer) -> Option<Rect> {
    let x0 = (a.0.min(b.0) - r - 1.0).floor() as i32;
    let y0 = (a.1.min(b.1) - r - 1.0).floor() as i32;
    let x1 = (a.0.max(b.0) + r + 1.0).ceil() as i32;
    let y1 = (a.1.max(b.1) + r + 1.0).ceil() as i32;
    Rect::from_corners(x0, y0, x1, y1).clip_to(layer.width(), layer.height())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
    const BLUE: Rgba<u8> = Rgba([0, 0, 255, 255]);

    fn engine(f: impl FnOnce(&mut BrushSettings)) -> BrushEngine {
        let mut s = BrushSettings::default();
        f(&mut s);
        BrushEngine::new(s, 30)
    }

    #[test]
    fn settings_are_clamped() {
        let mut s = BrushSettings::default();
        s.set_line_width(5000.0);
        assert_eq!(s.line_width(), MAX_LINE_WIDTH);
        s.set_line_width(0.0);
        assert_eq!(s.line_width(), MIN_LINE_WIDTH);
        s.set_opacity(250);
        assert_eq!(s.opacity(), 100);
    }

    #[test]
    fn solid_stroke_paints_chosen_color() {
        let mut layer = RasterBuffer::new(40, 20);
        let mut eng = engine(|s| {
            s.color = RED;
            s.set_line_width(6.0);
        });
        eng.begin_stroke(&mut layer, (5.0, 10.0));
        let dirty = eng.continue_stroke(&mut layer, (35.0, 10.0)).unwrap();
        eng.end_stroke();
        assert_eq!(layer.pixel(20, 10), RED);
        assert_eq!(layer.pixel(20, 2), Rgba([0, 0, 0, 0]));
        assert!(dirty.contains(20, 10));
        assert!(!eng.is_stroking());
    }

    #[test]
    fn eraser_clears_under_the_stroke() {
        let mut layer = RasterBuffer::new_filled(20, 20, BLUE);
        let mut eng = engine(|s| {
            s.tool = BrushTool::Eraser;
            s.set_line_width(4.0);
            s.set_opacity(10);
        });
        eng.begin_stroke(&mut layer, (2.0, 10.0));
        eng.continue_stroke(&mut layer, (18.0, 10.0));
        assert_eq!(layer.pixel(10, 10)[3], 0);
        assert_eq!(layer.pixel(10, 2), BLUE);
    }

    #[test]
    fn bleed_without_strength_is_a_no_op() {
        let mut layer = RasterBuffer::new_filled(10, 10, BLUE);
        let before = layer.clone();
        let mut eng = engine(|s| s.set_opacity(0));
        assert!(eng.begin_stroke(&mut layer, (5.0, 5.0)).is_none());
        assert_eq!(layer, before);
    }

    #[test]
    fn bleed_mixes_neighbouring_colors() {
        let mut layer = RasterBuffer::new(20, 20);
        layer.fill_region(Rect::new(0, 0, 10, 20), RED);
        layer.fill_region(Rect::new(10, 0, 10, 20), BLUE);
        let mut eng = engine(|s| {
            s.set_opacity(0);
            s.set_blend_strength(100);
            s.set_line_width(10.0);
        });
        eng.begin_stroke(&mut layer, (10.0, 10.0));
        let p = layer.pixel(10, 10);
        assert!(p[0] > 0 && p[2] > 0, "expected a red/blue mix, got {p:?}");
    }

    #[test]
    fn colored_daubs_have_a_solid_core_and_soft_rim() {
        let mut layer = RasterBuffer::new(40, 20);
        let mut eng = engine(|s| {
            s.color = RED;
            s.set_line_width(10.0);
            s.set_blend_strength(50);
        });
        eng.begin_stroke(&mut layer, (10.0, 10.0));
        eng.continue_stroke(&mut layer, (30.0, 10.0));
        assert_eq!(layer.pixel(20, 10), RED);
        let rim = layer.pixel(20, 14);
        assert!(rim[3] > 0 && rim[3] < 255, "rim alpha {}", rim[3]);
        assert_eq!(rim[0], 255);
        assert_eq!(layer.pixel(20, 16)[3], 0);
    }

    #[test]
    fn samples_stay_near_the_layer() {
        let layer = RasterBuffer::new(40, 20);
        let far = stroke_samples(&layer, (10.0, 10.0), (1e12, 10.0), 5.0);
        assert!(!far.is_empty());
        assert!(far.len() <= 40);
        assert!(far.iter().all(|p| p.0 <= 45.5));
        assert!(stroke_samples(&layer, (500.0, 500.0), (900.0, 500.0), 5.0).is_empty());
        assert!(stroke_samples(&layer, (10.0, 10.0), (f32::NAN, 10.0), 5.0).is_empty());
        assert_eq!(stroke_samples(&layer, (10.0, 10.0), (20.0, 10.0), 5.0).len(), 10);
    }

    #[test]
    fn mix_ratio_pulls_toward_existing_paint() {
        let mut layer = RasterBuffer::new_filled(20, 20, BLUE);
        let mut eng = engine(|s| {
            s.color = RED;
            s.set_mix_ratio(50);
            s.set_line_width(6.0);
        });
        eng.begin_stroke(&mut layer, (10.0, 10.0));
        let p = layer.pixel(10, 10);
        assert!((126..=130).contains(&p[0]), "{p:?}");
        assert!((126..=130).contains(&p[2]), "{p:?}");
    }

    #[test]
    fn normal_mix_is_linear() {
        assert_eq!(mix_normal(Rgba([0, 100, 200, 255]), Rgba([100, 200, 0, 255]), 0.5), Rgba([50, 150, 100, 255]));
        assert_eq!(mix_normal(RED, BLUE, 0.0), RED);
        assert_eq!(mix_normal(RED, BLUE, 1.0), BLUE);
    }

    #[test]
    fn spectral_mix_stays_between_endpoints() {
        let a = Rgba([40, 80, 200, 255]);
        let b = Rgba([230, 210, 40, 255]);
        let km = KubelkaMunkMixer;
        assert_eq!(km.mix(a, b, 0.0), Some(a));
        assert_eq!(km.mix(a, b, 1.0), Some(b));
        let m = km.mix(a, b, 0.5).unwrap();
        for c in 0..3 {
            assert!(m[c] >= a[c].min(b[c]) && m[c] <= a[c].max(b[c]));
        }
        assert_ne!(m, mix_normal(a, b, 0.5));
        let white = Rgba([255, 255, 255, 255]);
        assert_eq!(km.mix(white, white, 0.3), Some(white));
    }

    struct Broken;
    impl ColorMixer for Broken {
        fn mix(&self, _: Rgba<u8>, _: Rgba<u8>, _: f32) -> Option<Rgba<u8>> {
            None
        }
    }

    #[test]
    fn spectral_falls_back_to_linear() {
        assert_eq!(mix_spectral(&Broken, RED, BLUE, 0.5), mix_normal(RED, BLUE, 0.5));
        let eng = engine(|s| s.color_mix_mode = ColorMixMode::Spectral).with_spectral_mixer(Box::new(Broken));
        assert_eq!(eng.mix(RED, BLUE, 0.25), mix_normal(RED, BLUE, 0.25));
    }
}
