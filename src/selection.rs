use image::{GrayImage, RgbaImage};

use crate::canvas::Rect;

/// Length of one marching-ants dash cycle, in canvas pixels.
pub const ANTS_DASH_PERIOD: f32 = 8.0;

/// Minimum extent (exclusive) a rectangle drag needs on both axes to commit.
pub const MIN_RECT_EXTENT: u32 = 2;

// ============================================================================
// SELECTION STATE
// ============================================================================

/// The committed selection. Scopes fill, clear and transform.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum SelectionState {
    #[default]
    None,
    Rect(Rect),
    /// Closed polygon: the last point repeats the first.
    Lasso(Vec<(f32, f32)>),
    Magic(MagicSelection),
}

/// Result of a magic-wand flood fill.
#[derive(Clone, Debug, PartialEq)]
pub struct MagicSelection {
    /// 255 inside, 0 outside. Canvas-sized.
    pub mask: GrayImage,
    pub outline: SelectionOutline,
    pub bounds: Rect,
}

/// Pixel-edge runs along the mask boundary, used to draw marching ants.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct SelectionOutline {
    /// Edges lying on row boundaries, found by scanning rows.
    pub horizontal: Vec<EdgeRun>,
    /// Edges lying on column boundaries, found by scanning columns.
    pub vertical: Vec<EdgeRun>,
}

/// One straight boundary run: `line` is the grid line (row or column
/// boundary index), `start..end` the covered span along it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EdgeRun {
    pub line: u32,
    pub start: u32,
    pub end: u32,
}

/// What a fill or clear should touch.
#[derive(Clone, Copy, Debug)]
pub enum SelectionScope<'a> {
    Everything,
    Rect(Rect),
    Mask(&'a GrayImage),
}

impl SelectionState {
    pub fn has_selection(&self) -> bool {
        !matches!(self, SelectionState::None)
    }

    pub fn kind(&self) -> Option<&'static str> {
        match self {
            SelectionState::None => None,
            SelectionState::Rect(_) => Some("rect"),
            SelectionState::Lasso(_) => Some("lasso"),
            SelectionState::Magic(_) => Some("magic"),
        }
    }

    /// Rect mode reports its rect, lasso the extents of its points, magic
    /// the precomputed mask bounds.
    pub fn bounding_rect(&self) -> Option<Rect> {
        match self {
            SelectionState::None => None,
            SelectionState::Rect(r) => Some(*r),
            SelectionState::Lasso(points) => polygon_bounds(points),
            SelectionState::Magic(m) => Some(m.bounds),
        }
    }

    /// Whether the pixel at `(x, y)` lies inside the selected region.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        match self {
            SelectionState::None => false,
            SelectionState::Rect(r) => r.contains(x, y),
            SelectionState::Lasso(points) => point_in_polygon(points, x as f32 + 0.5, y as f32 + 0.5),
            SelectionState::Magic(m) => {
                x >= 0
                    && y >= 0
                    && (x as u32) < m.mask.width()
                    && (y as u32) < m.mask.height()
                    && m.mask.get_pixel(x as u32, y as u32).0[0] > 0
            }
        }
    }

    /// Region a fill or clear should cover. Rect and lasso selections scope
    /// to their bounding rect, magic selections to their exact mask.
    pub fn scope(&self) -> SelectionScope<'_> {
        match self {
            SelectionState::None => SelectionScope::Everything,
            SelectionState::Magic(m) => SelectionScope::Mask(&m.mask),
            other => match other.bounding_rect() {
                Some(r) => SelectionScope::Rect(r),
                None => SelectionScope::Everything,
            },
        }
    }

    pub fn select_all(width: u32, height: u32) -> Self {
        SelectionState::Rect(Rect::new(0, 0, width, height))
    }
}

fn polygon_bounds(points: &[(f32, f32)]) -> Option<Rect> {
    let (first, rest) = points.split_first()?;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.0, first.1, first.0, first.1);
    for &(x, y) in rest {
        min_x = min_x.min(x);
        min_y = min_y.min(y);
        max_x = max_x.max(x);
        max_y = max_y.max(y);
    }
    let x0 = min_x.floor() as i32;
    let y0 = min_y.floor() as i32;
    let x1 = max_x.ceil() as i32;
    let y1 = max_y.ceil() as i32;
    Some(Rect::from_corners(x0, y0, x1, y1))
}

/// Even-odd crossing test; the closing edge is implied.
fn point_in_polygon(points: &[(f32, f32)], px: f32, py: f32) -> bool {
    let n = points.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = points[i];
        let (xj, yj) = points[j];
        if (yi > py) != (yj > py) {
            let x = xi + (py - yi) / (yj - yi) * (xj - xi);
            if px < x {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

// ============================================================================
// MAGIC WAND
// ============================================================================

/// Flood fill from `(seed_x, seed_y)` over `source`, 4-connected.
///
/// A pixel joins when each RGB channel is within `tolerance` of the seed
/// colour; alpha is ignored. Returns `None` when the seed is off-canvas or
/// the region is the seed pixel alone. The result depends only on the
/// buffer, the seed and the tolerance.
pub fn magic_wand(source: &RgbaImage, seed_x: u32, seed_y: u32, tolerance: u8) -> Option<MagicSelection> {
    let (w, h) = source.dimensions();
    if seed_x >= w || seed_y >= h {
        return None;
    }
    let (mask, bbox, count) = flood_fill(source.as_raw(), seed_x, seed_y, tolerance, w, h);
    if count <= 1 {
        return None;
    }
    let (min_x, min_y, max_x, max_y) = bbox;
    let mask = GrayImage::from_raw(w, h, mask)?;
    let outline = trace_outline(&mask);
    Some(MagicSelection {
        mask,
        outline,
        bounds: Rect::new(min_x as i32, min_y as i32, max_x - min_x + 1, max_y - min_y + 1),
    })
}

/// DFS over a flat RGBA buffer. The mask doubles as the visited set.
/// Returns the mask, the inclusive bbox and the pixel count.
fn flood_fill(
    flat_pixels: &[u8],
    start_x: u32,
    start_y: u32,
    tolerance: u8,
    canvas_w: u32,
    canvas_h: u32,
) -> (Vec<u8>, (u32, u32, u32, u32), usize) {
    let wu = canvas_w as usize;
    let hu = canvas_h as usize;
    let mut mask = vec![0u8; wu * hu];

    #[inline(always)]
    fn matches(flat: &[u8], idx: usize, seed: [u8; 3], tol: u8) -> bool {
        let o = idx * 4;
        flat[o].abs_diff(seed[0]) <= tol
            && flat[o + 1].abs_diff(seed[1]) <= tol
            && flat[o + 2].abs_diff(seed[2]) <= tol
    }

    let seed_idx = start_y as usize * wu + start_x as usize;
    let so = seed_idx * 4;
    let seed = [flat_pixels[so], flat_pixels[so + 1], flat_pixels[so + 2]];

    let (mut min_x, mut min_y, mut max_x, mut max_y) = (start_x, start_y, start_x, start_y);
    let mut count = 0usize;

    // Packed flat indices keep the stack small.
    let mut stack: Vec<u32> = Vec::with_capacity(4096);
    mask[seed_idx] = 255;
    stack.push(seed_idx as u32);

    while let Some(idx) = stack.pop() {
        count += 1;
        let x = (idx as usize % wu) as u32;
        let y = (idx as usize / wu) as u32;
        min_x = min_x.min(x);
        max_x = max_x.max(x);
        min_y = min_y.min(y);
        max_y = max_y.max(y);

        let mut visit = |ni: usize, mask: &mut Vec<u8>| {
            if mask[ni] == 0 && matches(flat_pixels, ni, seed, tolerance) {
                mask[ni] = 255;
                stack.push(ni as u32);
            }
        };
        if x > 0 {
            visit(idx as usize - 1, &mut mask);
        }
        if x + 1 < canvas_w {
            visit(idx as usize + 1, &mut mask);
        }
        if y > 0 {
            visit(idx as usize - wu, &mut mask);
        }
        if y + 1 < canvas_h {
            visit(idx as usize + wu, &mut mask);
        }
    }

    (mask, (min_x, min_y, max_x, max_y), count)
}

/// Collect boundary edges of a mask as merged runs.
pub fn trace_outline(mask: &GrayImage) -> SelectionOutline {
    let (w, h) = mask.dimensions();
    let inside = |x: i64, y: i64| -> bool {
        x >= 0 && y >= 0 && x < w as i64 && y < h as i64 && mask.get_pixel(x as u32, y as u32).0[0] > 0
    };

    let mut horizontal = Vec::new();
    for line in 0..=h {
        let mut run_start: Option<u32> = None;
        for x in 0..=w {
            let edge = x < w && inside(x as i64, line as i64 - 1) != inside(x as i64, line as i64);
            match (edge, run_start) {
                (true, None) => run_start = Some(x),
                (false, Some(start)) => {
                    horizontal.push(EdgeRun { line, start, end: x });
                    run_start = None;
                }
                _ => {}
            }
        }
    }

    let mut vertical = Vec::new();
    for line in 0..=w {
        let mut run_start: Option<u32> = None;
        for y in 0..=h {
            let edge = y < h && inside(line as i64 - 1, y as i64) != inside(line as i64, y as i64);
            match (edge, run_start) {
                (true, None) => run_start = Some(y),
                (false, Some(start)) => {
                    vertical.push(EdgeRun { line, start, end: y });
                    run_start = None;
                }
                _ => {}
            }
        }
    }

    SelectionOutline { horizontal, vertical }
}

// ============================================================================
// SELECTION ENGINE – drag state machine
// ============================================================================

#[derive(Clone, Debug, PartialEq, Default)]
pub enum SelectionPhase {
    #[default]
    Idle,
    RectDragging { origin: (i32, i32), current: Rect },
    LassoDragging { points: Vec<(f32, f32)> },
}

/// Which buffer the magic wand samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum WandSource {
    #[default]
    Composite,
    ActiveLayer,
}

/// Turns pointer drags into committed selections.
#[derive(Clone, Debug, Default)]
pub struct SelectionEngine {
    phase: SelectionPhase,
    pub wand_source: WandSource,
}

impl SelectionEngine {
    pub fn phase(&self) -> &SelectionPhase {
        &self.phase
    }

    pub fn is_dragging(&self) -> bool {
        self.phase != SelectionPhase::Idle
    }

    pub fn begin_rect(&mut self, pos: (f32, f32)) {
        let origin = (pos.0.floor() as i32, pos.1.floor() as i32);
        self.phase = SelectionPhase::RectDragging { origin, current: Rect::new(origin.0, origin.1, 0, 0) };
    }

    pub fn begin_lasso(&mut self, pos: (f32, f32)) {
        self.phase = SelectionPhase::LassoDragging { points: vec![pos] };
    }

    pub fn drag_to(&mut self, pos: (f32, f32)) {
        match &mut self.phase {
            SelectionPhase::Idle => {}
            SelectionPhase::RectDragging { origin, current } => {
                *current = Rect::from_corners(origin.0, origin.1, pos.0.floor() as i32, pos.1.floor() as i32);
            }
            SelectionPhase::LassoDragging { points } => points.push(pos),
        }
    }

    /// End the drag. Returns the selection to commit, or `None` when the
    /// gesture was too small and is discarded. Always returns to idle.
    pub fn finish(&mut self) -> Option<SelectionState> {
        match std::mem::take(&mut self.phase) {
            SelectionPhase::Idle => None,
            SelectionPhase::RectDragging { current, .. } => {
                (current.w > MIN_RECT_EXTENT && current.h > MIN_RECT_EXTENT).then_some(SelectionState::Rect(current))
            }
            SelectionPhase::LassoDragging { mut points } => {
                if points.len() < 3 {
                    return None;
                }
                points.push(points[0]);
                Some(SelectionState::Lasso(points))
            }
        }
    }

    pub fn cancel(&mut self) {
        self.phase = SelectionPhase::Idle;
    }

    /// The in-progress shape, for drawing while dragging.
    pub fn preview(&self) -> Option<SelectionState> {
        match &self.phase {
            SelectionPhase::Idle => None,
            SelectionPhase::RectDragging { current, .. } => Some(SelectionState::Rect(*current)),
            SelectionPhase::LassoDragging { points } => Some(SelectionState::Lasso(points.clone())),
        }
    }
}

// ============================================================================
// MARCHING ANTS
// ============================================================================

/// Dash-offset animation for the selection border.
///
/// The host calls [`MarchingAnts::tick`] once per frame while it returns
/// `true`; the first tick after the selection disappears stops the loop.
#[derive(Clone, Debug)]
pub struct MarchingAnts {
    offset: f32,
    step: f32,
    running: bool,
}

impl MarchingAnts {
    pub fn new(step: f32) -> Self {
        Self { offset: 0.0, step, running: false }
    }

    pub fn offset(&self) -> f32 {
        self.offset
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Returns `true` if the loop was idle and the caller should schedule
    /// the first frame.
    pub fn start(&mut self) -> bool {
        let was_idle = !self.running;
        self.running = true;
        was_idle
    }

    pub fn tick(&mut self, has_selection: bool) -> bool {
        if !self.running {
            return false;
        }
        if !has_selection {
            self.running = false;
            self.offset = 0.0;
            return false;
        }
        self.offset = (self.offset + self.step).rem_euclid(ANTS_DASH_PERIOD);
        true
    }
}

impl Default for MarchingAnts {
    fn default() -> Self {
        Self::new(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgba};

    fn split_canvas(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_fn(w, h, |x, _| {
            if x < w / 2 { Rgba([20, 20, 20, 255]) } else { Rgba([200, 180, 160, 255]) }
        })
    }

    #[test]
    fn wand_selects_one_half() {
        let img = split_canvas(40, 30);
        let sel = magic_wand(&img, 0, 0, 32).unwrap();
        assert_eq!(sel.bounds, Rect::new(0, 0, 20, 30));
        for y in 0..30 {
            for x in 0..40 {
                assert_eq!(sel.mask.get_pixel(x, y).0[0] > 0, x < 20, "pixel {x},{y}");
            }
        }
    }

    #[test]
    fn wand_is_deterministic() {
        let img = RgbaImage::from_fn(25, 25, |x, y| Rgba([(x * 9) as u8, (y * 7) as u8, ((x + y) * 3) as u8, 255]));
        let a = magic_wand(&img, 12, 12, 32).unwrap();
        let b = magic_wand(&img, 12, 12, 32).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn isolated_seed_yields_nothing() {
        let mut img = RgbaImage::from_pixel(5, 5, Rgba([0, 0, 0, 255]));
        img.put_pixel(2, 2, Rgba([255, 255, 255, 255]));
        assert!(magic_wand(&img, 2, 2, 32).is_none());
        assert!(magic_wand(&img, 9, 9, 32).is_none());
    }

    #[test]
    fn wand_tolerance_is_inclusive() {
        let img = RgbaImage::from_fn(4, 1, |x, _| Rgba([100 + x as u8 * 32, 0, 0, 255]));
        let sel = magic_wand(&img, 0, 0, 32).unwrap();
        assert_eq!(sel.bounds, Rect::new(0, 0, 2, 1));
    }

    #[test]
    fn outline_of_square() {
        let mut mask = GrayImage::new(6, 6);
        for y in 1..4 {
            for x in 2..5 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        let outline = trace_outline(&mask);
        assert_eq!(
            outline.horizontal,
            vec![EdgeRun { line: 1, start: 2, end: 5 }, EdgeRun { line: 4, start: 2, end: 5 }]
        );
        assert_eq!(
            outline.vertical,
            vec![EdgeRun { line: 2, start: 1, end: 4 }, EdgeRun { line: 5, start: 1, end: 4 }]
        );
    }

    #[test]
    fn small_rect_drag_is_discarded() {
        let mut eng = SelectionEngine::default();
        eng.begin_rect((10.0, 10.0));
        eng.drag_to((12.0, 30.0));
        assert!(eng.finish().is_none());
        assert!(!eng.is_dragging());
    }

    #[test]
    fn rect_drag_normalises_corners() {
        let mut eng = SelectionEngine::default();
        eng.begin_rect((50.0, 40.0));
        eng.drag_to((20.0, 60.0));
        let sel = eng.finish().unwrap();
        assert_eq!(sel.bounding_rect(), Some(Rect::new(20, 40, 30, 20)));
    }

    #[test]
    fn lasso_closes_and_reports_extents() {
        let mut eng = SelectionEngine::default();
        eng.begin_lasso((5.0, 5.0));
        eng.drag_to((25.0, 8.0));
        eng.drag_to((15.0, 30.0));
        let sel = eng.finish().unwrap();
        let SelectionState::Lasso(points) = &sel else { panic!("expected lasso") };
        assert_eq!(points.first(), points.last());
        assert_eq!(sel.bounding_rect(), Some(Rect::new(5, 5, 20, 25)));
        assert!(sel.contains(15, 12));
        assert!(!sel.contains(6, 28));
    }

    #[test]
    fn two_point_lasso_is_discarded() {
        let mut eng = SelectionEngine::default();
        eng.begin_lasso((0.0, 0.0));
        eng.drag_to((5.0, 5.0));
        assert!(eng.finish().is_none());
    }

    #[test]
    fn ants_stop_when_selection_clears() {
        let mut ants = MarchingAnts::new(3.0);
        assert!(!ants.tick(true));
        assert!(ants.start());
        assert!(!ants.start());
        assert!(ants.tick(true));
        assert!(ants.tick(true));
        assert!(ants.tick(true));
        assert_eq!(ants.offset(), 1.0);
        assert!(!ants.tick(false));
        assert!(!ants.is_running());
    }
}
