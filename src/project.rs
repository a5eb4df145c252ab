use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use image::Rgba;
use uuid::Uuid;

use crate::brush::{BrushEngine, BrushSettings, BrushTool};
use crate::canvas::{BlendMode, CanvasState, LayerStack, RasterBuffer, Rect};
use crate::components::history::HistoryManager;
use crate::config::EngineSettings;
use crate::error::{CodecError, EngineError};
use crate::io::{self, AutoSave, LayeredImageCodec, PsdCodec};
use crate::ops::canvas_ops;
use crate::ops::transform::TransformOverlay;
use crate::selection::{MarchingAnts, SelectionEngine, SelectionState, WandSource, magic_wand};

/// Pointer tool currently routed to by the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Tool {
    #[default]
    RectSelect,
    Lasso,
    MagicWand,
    Brush,
    Eraser,
}

/// Which component owns pointer input. Only one at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum EditMode {
    #[default]
    Idle,
    Selecting,
    Painting,
    Transforming,
}

impl EditMode {
    pub fn label(&self) -> &'static str {
        match self {
            EditMode::Idle => "idle",
            EditMode::Selecting => "selection",
            EditMode::Painting => "painting",
            EditMode::Transforming => "transform",
        }
    }
}

/// Change notifications delivered to subscribers.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    LayersChanged,
    SelectionChanged,
    HistoryChanged,
    TransformChanged,
    ModeChanged(EditMode),
    Saved(PathBuf),
    Loaded(PathBuf),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Observer = Box<dyn FnMut(&SessionEvent)>;

// ============================================================================
// PAINTER SESSION
// ============================================================================

/// Single open painting: the canvas, its history and every piece of
/// interactive state that edits it.
pub struct PainterSession {
    pub id: Uuid,
    /// Display name (derived from path or "Untitled-X")
    pub name: String,
    /// `None` until the document is saved or opened from disk.
    pub path: Option<PathBuf>,
    pub is_dirty: bool,

    canvas: CanvasState,
    history: HistoryManager,
    settings: EngineSettings,

    tool: Tool,
    mode: EditMode,
    selection_engine: SelectionEngine,
    brush: BrushEngine,
    transform: Option<TransformOverlay>,
    ants: MarchingAnts,

    autosave: AutoSave,
    /// Overrides where auto-save writes; see [`Self::autosave_target`].
    autosave_path: Option<PathBuf>,
    codec: Box<dyn LayeredImageCodec>,

    observers: Vec<(SubscriptionId, Observer)>,
    next_subscription: u64,
}

impl PainterSession {
    pub fn new_untitled(untitled_counter: usize, settings: EngineSettings) -> Self {
        let canvas = CanvasState::new(
            settings.default_width,
            settings.default_height,
            &settings.default_layer_name,
            settings.default_fill_color(),
        );
        let mut brush_settings = BrushSettings::default();
        brush_settings.color_mix_mode = settings.color_mix_mode;
        Self {
            id: Uuid::new_v4(),
            name: format!("Untitled-{}", untitled_counter),
            path: None,
            is_dirty: false,
            canvas,
            history: HistoryManager::new(settings.history_capacity),
            tool: Tool::default(),
            mode: EditMode::Idle,
            selection_engine: SelectionEngine::default(),
            brush: BrushEngine::new(brush_settings, settings.bleed_threshold),
            transform: None,
            ants: MarchingAnts::new(settings.ants_dash_step),
            autosave: AutoSave::new(Duration::from_millis(settings.autosave_delay_ms)),
            autosave_path: None,
            codec: Box::new(PsdCodec {
                thumbnail_max_edge: settings.thumbnail_max_edge,
                default_fill: settings.default_fill_color(),
            }),
            observers: Vec::new(),
            next_subscription: 0,
            settings,
        }
    }

    /// Swap the layered-image codec used by load, save and auto-save.
    pub fn with_codec(mut self, codec: Box<dyn LayeredImageCodec>) -> Self {
        self.codec = codec;
        self
    }

    // --- accessors ---------------------------------------------------------

    pub fn canvas(&self) -> &CanvasState {
        &self.canvas
    }

    pub fn layers(&self) -> &LayerStack {
        &self.canvas.layers
    }

    pub fn selection(&self) -> &SelectionState {
        &self.canvas.selection
    }

    pub fn history(&self) -> &HistoryManager {
        &self.history
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn tool(&self) -> Tool {
        self.tool
    }

    pub fn mode(&self) -> EditMode {
        self.mode
    }

    pub fn selection_engine(&self) -> &SelectionEngine {
        &self.selection_engine
    }

    pub fn brush(&self) -> &BrushEngine {
        &self.brush
    }

    /// Brush parameters may change at any time; they apply from the next sample.
    pub fn brush_mut(&mut self) -> &mut BrushEngine {
        &mut self.brush
    }

    pub fn transform(&self) -> Option<&TransformOverlay> {
        self.transform.as_ref()
    }

    pub fn transform_mut(&mut self) -> Option<&mut TransformOverlay> {
        self.transform.as_mut()
    }

    pub fn ants(&self) -> &MarchingAnts {
        &self.ants
    }

    pub fn autosave(&self) -> &AutoSave {
        &self.autosave
    }

    pub fn mark_dirty(&mut self) {
        self.is_dirty = true;
    }

    pub fn mark_clean(&mut self) {
        self.is_dirty = false;
    }

    /// Get the display title (name with dirty indicator)
    pub fn display_title(&self) -> String {
        if self.is_dirty {
            format!("{}*", self.name)
        } else {
            self.name.clone()
        }
    }

    fn update_name_from_path(&mut self) {
        if let Some(ref path) = self.path {
            self.name = path
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "Unknown".to_string());
        }
    }

    // --- observers ---------------------------------------------------------

    pub fn subscribe(&mut self, observer: impl FnMut(&SessionEvent) + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.observers.push((id, Box::new(observer)));
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(sub, _)| *sub != id);
        self.observers.len() != before
    }

    fn emit(&mut self, event: SessionEvent) {
        for (_, observer) in self.observers.iter_mut() {
            observer(&event);
        }
    }

    fn set_mode(&mut self, mode: EditMode) {
        if self.mode != mode {
            self.mode = mode;
            self.emit(SessionEvent::ModeChanged(mode));
        }
    }

    /// Bookkeeping after a committed, history-recorded edit.
    fn after_edit(&mut self, layers: bool, selection: bool) {
        self.mark_dirty();
        self.autosave.schedule(Instant::now());
        if layers {
            self.emit(SessionEvent::LayersChanged);
        }
        if selection {
            self.emit(SessionEvent::SelectionChanged);
        }
        self.emit(SessionEvent::HistoryChanged);
    }

    fn ensure_idle(&self) -> Result<(), EngineError> {
        match self.mode {
            EditMode::Idle => Ok(()),
            other => Err(EngineError::Busy(other.label())),
        }
    }

    // --- tools & pointer routing -------------------------------------------

    /// Switch tools. Refused while a drag, stroke or transform is in progress.
    pub fn set_tool(&mut self, tool: Tool) -> Result<(), EngineError> {
        self.ensure_idle()?;
        self.tool = tool;
        match tool {
            Tool::Brush => self.brush.settings.tool = BrushTool::Brush,
            Tool::Eraser => self.brush.settings.tool = BrushTool::Eraser,
            _ => {}
        }
        Ok(())
    }

    pub fn set_wand_source(&mut self, source: WandSource) {
        self.selection_engine.wand_source = source;
    }

    /// Press at canvas position `pos`.
    pub fn pointer_down(&mut self, pos: (f32, f32)) -> Result<(), EngineError> {
        if self.mode == EditMode::Transforming {
            let radius = self.settings.handle_radius;
            if let Some(overlay) = self.transform.as_mut() {
                overlay.pointer_down(pos, radius);
            }
            return Ok(());
        }
        self.ensure_idle()?;

        match self.tool {
            Tool::RectSelect => {
                self.selection_engine.begin_rect(pos);
                self.set_mode(EditMode::Selecting);
            }
            Tool::Lasso => {
                self.selection_engine.begin_lasso(pos);
                self.set_mode(EditMode::Selecting);
            }
            Tool::MagicWand => {
                let (x, y) = (pos.0.floor(), pos.1.floor());
                if x < 0.0 || y < 0.0 {
                    return Err(EngineError::SurfaceUnavailable);
                }
                self.magic_wand_at(x as u32, y as u32)?;
            }
            Tool::Brush | Tool::Eraser => self.begin_stroke(pos)?,
        }
        Ok(())
    }

    pub fn pointer_move(&mut self, pos: (f32, f32)) {
        match self.mode {
            EditMode::Idle => {}
            EditMode::Selecting => self.selection_engine.drag_to(pos),
            EditMode::Painting => {
                let layer = &mut self.canvas.layers.current_layer_mut().pixels;
                if self.brush.continue_stroke(layer, pos).is_some() {
                    self.emit(SessionEvent::LayersChanged);
                }
            }
            EditMode::Transforming => {
                if let Some(overlay) = self.transform.as_mut()
                    && overlay.is_dragging()
                {
                    overlay.pointer_move(pos);
                    self.emit(SessionEvent::TransformChanged);
                }
            }
        }
    }

    pub fn pointer_up(&mut self) {
        match self.mode {
            EditMode::Idle => {}
            EditMode::Selecting => {
                self.set_mode(EditMode::Idle);
                match self.selection_engine.finish() {
                    Some(selection) => self.commit_selection(selection),
                    None => log::debug!("selection drag discarded"),
                }
            }
            EditMode::Painting => self.finish_stroke(),
            EditMode::Transforming => {
                if let Some(overlay) = self.transform.as_mut() {
                    overlay.pointer_up();
                }
            }
        }
    }

    /// Abort an in-progress drag or stroke. A stroke keeps what it painted.
    pub fn pointer_cancel(&mut self) {
        match self.mode {
            EditMode::Selecting => {
                self.selection_engine.cancel();
                self.set_mode(EditMode::Idle);
            }
            EditMode::Painting => self.finish_stroke(),
            EditMode::Idle | EditMode::Transforming => {}
        }
    }

    /// One history entry, taken before the first sample of the stroke.
    fn begin_stroke(&mut self, pos: (f32, f32)) -> Result<(), EngineError> {
        if !(pos.0.is_finite() && pos.1.is_finite()) {
            return Err(EngineError::SurfaceUnavailable);
        }
        let description = match self.brush.settings.tool {
            BrushTool::Brush => "Brush Stroke",
            BrushTool::Eraser => "Eraser",
        };
        self.history.save_history(&self.canvas, description);
        let layer = &mut self.canvas.layers.current_layer_mut().pixels;
        self.brush.begin_stroke(layer, pos);
        self.set_mode(EditMode::Painting);
        self.after_edit(true, false);
        Ok(())
    }

    /// Close the stroke. Its later samples changed the layer after the
    /// auto-save scheduled by `begin_stroke`, so the debounce restarts here.
    fn finish_stroke(&mut self) {
        self.brush.end_stroke();
        self.set_mode(EditMode::Idle);
        self.mark_dirty();
        self.autosave.schedule(Instant::now());
    }

    fn commit_selection(&mut self, selection: SelectionState) {
        canvas_ops::set_selection(&mut self.canvas, &mut self.history, selection);
        self.ants.start();
        self.after_edit(false, true);
    }

    /// Advance the marching-ants dash. Returns whether another frame should
    /// be scheduled.
    pub fn tick_ants(&mut self) -> bool {
        self.ants.tick(self.canvas.selection.has_selection())
    }

    // --- selection ---------------------------------------------------------

    /// Flood-select from `(x, y)`. A result containing only the seed clears
    /// the selection instead. Returns whether a selection exists afterwards.
    pub fn magic_wand_at(&mut self, x: u32, y: u32) -> Result<bool, EngineError> {
        self.ensure_idle()?;
        if x >= self.canvas.width() || y >= self.canvas.height() {
            return Err(EngineError::SurfaceUnavailable);
        }
        let result = match self.selection_engine.wand_source {
            WandSource::Composite => magic_wand(&self.canvas.layers.composite(), x, y, self.settings.wand_tolerance),
            WandSource::ActiveLayer => magic_wand(
                self.canvas.layers.current_layer().pixels.as_image(),
                x,
                y,
                self.settings.wand_tolerance,
            ),
        };
        match result {
            Some(selection) => {
                log::info!("magic wand at ({}, {}): {:?}", x, y, selection.bounds);
                self.commit_selection(SelectionState::Magic(selection));
                Ok(true)
            }
            None => {
                self.clear_selection()?;
                Ok(false)
            }
        }
    }

    /// Commit a rectangle selection directly. Rects of 2 px or less on
    /// either side are ignored, like a too-small drag.
    pub fn select_rect(&mut self, rect: Rect) -> Result<bool, EngineError> {
        self.ensure_idle()?;
        if rect.w <= crate::selection::MIN_RECT_EXTENT || rect.h <= crate::selection::MIN_RECT_EXTENT {
            return Ok(false);
        }
        self.commit_selection(SelectionState::Rect(rect));
        Ok(true)
    }

    pub fn select_all(&mut self) -> Result<(), EngineError> {
        self.ensure_idle()?;
        self.commit_selection(SelectionState::select_all(self.canvas.width(), self.canvas.height()));
        Ok(())
    }

    /// Returns false (and records nothing) when there was no selection.
    pub fn clear_selection(&mut self) -> Result<bool, EngineError> {
        self.ensure_idle()?;
        let cleared = canvas_ops::clear_selection(&mut self.canvas, &mut self.history);
        if cleared {
            self.after_edit(false, true);
        }
        Ok(cleared)
    }

    // --- layer operations --------------------------------------------------

    pub fn add_layer(&mut self, name: &str, image: Option<RasterBuffer>) -> Result<usize, EngineError> {
        self.ensure_idle()?;
        let idx = canvas_ops::add_layer(&mut self.canvas, &mut self.history, name, image);
        self.after_edit(true, false);
        Ok(idx)
    }

    pub fn remove_layer(&mut self, index: usize) -> Result<(), EngineError> {
        self.ensure_idle()?;
        canvas_ops::remove_layer(&mut self.canvas, &mut self.history, index)?;
        self.after_edit(true, false);
        Ok(())
    }

    pub fn duplicate_layer(&mut self, index: usize) -> Result<usize, EngineError> {
        self.ensure_idle()?;
        let idx = canvas_ops::duplicate_layer(&mut self.canvas, &mut self.history, index)?;
        self.after_edit(true, false);
        Ok(idx)
    }

    pub fn rename_layer(&mut self, index: usize, name: &str) -> Result<(), EngineError> {
        self.ensure_idle()?;
        canvas_ops::rename_layer(&mut self.canvas, &mut self.history, index, name)?;
        self.after_edit(true, false);
        Ok(())
    }

    pub fn set_layer_opacity(&mut self, index: usize, opacity: f32) -> Result<(), EngineError> {
        self.ensure_idle()?;
        if opacity.is_nan() {
            self.canvas.layers.check_index(index)?;
            return Ok(());
        }
        canvas_ops::set_opacity(&mut self.canvas, &mut self.history, index, opacity)?;
        self.after_edit(true, false);
        Ok(())
    }

    pub fn set_blend_mode(&mut self, index: usize, mode: BlendMode) -> Result<(), EngineError> {
        self.ensure_idle()?;
        canvas_ops::set_blend_mode(&mut self.canvas, &mut self.history, index, mode)?;
        self.after_edit(true, false);
        Ok(())
    }

    pub fn toggle_visibility(&mut self, index: usize) -> Result<bool, EngineError> {
        self.ensure_idle()?;
        let visible = canvas_ops::toggle_visibility(&mut self.canvas, &mut self.history, index)?;
        self.after_edit(true, false);
        Ok(visible)
    }

    pub fn set_clipping_mask(&mut self, index: usize, clipping: bool) -> Result<(), EngineError> {
        self.ensure_idle()?;
        canvas_ops::set_clipping_mask(&mut self.canvas, &mut self.history, index, clipping)?;
        self.after_edit(true, false);
        Ok(())
    }

    pub fn move_layer(&mut self, from: usize, to: usize) -> Result<(), EngineError> {
        self.ensure_idle()?;
        canvas_ops::move_layer(&mut self.canvas, &mut self.history, from, to)?;
        self.after_edit(true, false);
        Ok(())
    }

    /// Change the current layer. Not an edit: no history, no auto-save.
    pub fn set_current_layer(&mut self, index: usize) -> Result<(), EngineError> {
        self.ensure_idle()?;
        self.canvas.layers.set_current(index)?;
        self.emit(SessionEvent::LayersChanged);
        Ok(())
    }

    pub fn merge_down(&mut self, index: usize) -> Result<(), EngineError> {
        self.ensure_idle()?;
        canvas_ops::merge_down(&mut self.canvas, &mut self.history, index)?;
        self.after_edit(true, false);
        Ok(())
    }

    pub fn flatten(&mut self) -> Result<(), EngineError> {
        self.ensure_idle()?;
        let name = self.settings.default_layer_name.clone();
        canvas_ops::flatten(&mut self.canvas, &mut self.history, &name);
        self.after_edit(true, false);
        Ok(())
    }

    pub fn fill(&mut self, color: Rgba<u8>, rect: Option<Rect>) -> Result<(), EngineError> {
        self.ensure_idle()?;
        canvas_ops::fill(&mut self.canvas, &mut self.history, color, rect)?;
        self.after_edit(true, false);
        Ok(())
    }

    pub fn clear(&mut self, rect: Option<Rect>) -> Result<(), EngineError> {
        self.ensure_idle()?;
        canvas_ops::clear(&mut self.canvas, &mut self.history, rect)?;
        self.after_edit(true, false);
        Ok(())
    }

    // --- history -----------------------------------------------------------

    pub fn undo(&mut self) -> Result<String, EngineError> {
        self.ensure_idle()?;
        let description = self.history.undo(&mut self.canvas)?;
        self.after_undo_redo();
        Ok(description)
    }

    pub fn redo(&mut self) -> Result<String, EngineError> {
        self.ensure_idle()?;
        let description = self.history.redo(&mut self.canvas)?;
        self.after_undo_redo();
        Ok(description)
    }

    fn after_undo_redo(&mut self) {
        if self.canvas.selection.has_selection() {
            self.ants.start();
        }
        self.after_edit(true, true);
    }

    // --- free transform ----------------------------------------------------

    /// Lift the selected region of the current layer into a transform overlay.
    pub fn begin_transform(&mut self) -> Result<(), EngineError> {
        self.ensure_idle()?;
        let rect = self.canvas.selection.bounding_rect().ok_or(EngineError::SurfaceUnavailable)?;
        let overlay = TransformOverlay::begin(&mut self.canvas.layers, rect)?;
        self.transform = Some(overlay);
        self.set_mode(EditMode::Transforming);
        self.emit(SessionEvent::TransformChanged);
        Ok(())
    }

    /// Apply the overlay to its layer as one undoable step.
    pub fn commit_transform(&mut self) -> Result<Rect, EngineError> {
        let overlay = self.transform.take().ok_or(EngineError::SurfaceUnavailable)?;
        self.set_mode(EditMode::Idle);
        let changed = overlay.confirm(&mut self.canvas, &mut self.history)?;
        self.emit(SessionEvent::TransformChanged);
        self.after_edit(true, false);
        Ok(changed)
    }

    /// Put the lifted pixels back. Records nothing.
    pub fn cancel_transform(&mut self) -> Result<(), EngineError> {
        let overlay = self.transform.take().ok_or(EngineError::SurfaceUnavailable)?;
        self.set_mode(EditMode::Idle);
        overlay.cancel(&mut self.canvas.layers)?;
        self.emit(SessionEvent::TransformChanged);
        self.emit(SessionEvent::LayersChanged);
        Ok(())
    }

    // --- persistence -------------------------------------------------------

    /// The stack as it should be persisted: a pending transform is not part
    /// of the document yet, so its lifted pixels are written back in place.
    fn persisted_stack(&self) -> Result<LayerStack, CodecError> {
        let Some(overlay) = &self.transform else {
            return Ok(self.canvas.layers.clone());
        };
        let mut stack = self.canvas.layers.clone();
        overlay
            .clone()
            .cancel(&mut stack)
            .map_err(|e| CodecError::InvalidLayerData(e.to_string()))?;
        Ok(stack)
    }

    /// Replace the document with the file at `path`. On failure nothing changes.
    pub fn open(&mut self, path: &Path) -> Result<(), CodecError> {
        let stack = io::load_document(self.codec.as_ref(), path)?.into_stack()?;

        self.transform = None;
        self.selection_engine.cancel();
        self.brush.end_stroke();
        self.set_mode(EditMode::Idle);
        self.canvas = CanvasState { layers: stack, selection: SelectionState::None };
        self.history.clear();
        self.autosave.cancel();
        self.path = Some(path.to_path_buf());
        self.update_name_from_path();
        self.mark_clean();

        self.emit(SessionEvent::Loaded(path.to_path_buf()));
        self.emit(SessionEvent::LayersChanged);
        self.emit(SessionEvent::SelectionChanged);
        self.emit(SessionEvent::HistoryChanged);
        Ok(())
    }

    /// Save to the document's own path.
    pub fn save(&mut self) -> Result<PathBuf, CodecError> {
        let path = self.path.clone().ok_or_else(|| {
            CodecError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "document has no path yet"))
        })?;
        self.save_as(&path)?;
        Ok(path)
    }

    /// Save to `path`, which becomes the document's path.
    pub fn save_as(&mut self, path: &Path) -> Result<(), CodecError> {
        let stack = self.persisted_stack()?;
        io::save_document(self.codec.as_ref(), &stack, path, self.settings.thumbnail_max_edge)?;
        self.path = Some(path.to_path_buf());
        self.update_name_from_path();
        self.mark_clean();
        self.autosave.cancel();
        self.emit(SessionEvent::Saved(path.to_path_buf()));
        Ok(())
    }

    /// Flattened preview, longest edge bounded by the configured maximum.
    pub fn thumbnail(&self) -> image::RgbaImage {
        self.canvas.layers.composite_scaled(self.settings.thumbnail_max_edge)
    }

    // --- auto-save ---------------------------------------------------------

    pub fn set_autosave_path(&mut self, path: Option<PathBuf>) {
        self.autosave_path = path;
    }

    /// Where auto-save writes: the explicit override, else the document's
    /// own path, else `<autosave dir>/<name>.autosave.psd`.
    pub fn autosave_target(&self) -> Option<PathBuf> {
        if let Some(p) = &self.autosave_path {
            return Some(p.clone());
        }
        if let Some(p) = &self.path {
            return Some(p.clone());
        }
        let safe_name: String = self
            .name
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        io::autosave_dir().map(|dir| dir.join(format!("{}.autosave.psd", safe_name)))
    }

    /// Group several edits so they produce a single auto-save.
    pub fn begin_batch(&mut self) {
        self.autosave.begin_batch();
    }

    pub fn end_batch(&mut self) {
        self.autosave.end_batch(Instant::now());
    }

    /// Drive the debounced writer. Returns `None` when nothing was due,
    /// otherwise the outcome of the write. A due write waits while a stroke
    /// is still painting.
    pub fn tick(&mut self, now: Instant) -> Option<Result<PathBuf, CodecError>> {
        if self.mode == EditMode::Painting || !self.autosave.poll(now) {
            return None;
        }
        let Some(target) = self.autosave_target() else {
            log::warn!("auto-save skipped: no target directory");
            return None;
        };
        if let Some(dir) = target.parent()
            && let Err(e) = std::fs::create_dir_all(dir)
        {
            log::warn!("auto-save skipped: cannot create {}: {}", dir.display(), e);
            return Some(Err(CodecError::Io(e)));
        }
        let result = self.persisted_stack().and_then(|stack| {
            io::save_document(self.codec.as_ref(), &stack, &target, self.settings.thumbnail_max_edge)
        });
        match result {
            Ok(()) => {
                log::info!("auto-saved to {}", target.display());
                if self.path.as_deref() == Some(target.as_path()) {
                    self.mark_clean();
                }
                self.emit(SessionEvent::Saved(target.clone()));
                Some(Ok(target))
            }
            Err(e) => {
                log::error!("auto-save to {} failed: {}", target.display(), e);
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn session() -> PainterSession {
        PainterSession::new_untitled(1, EngineSettings::default())
    }

    #[test]
    fn fresh_session_defaults() {
        let s = session();
        assert_eq!(s.layers().len(), 1);
        assert_eq!((s.canvas().width(), s.canvas().height()), (800, 600));
        assert_eq!(s.history().capacity(), 20);
        assert_eq!(s.display_title(), "Untitled-1");
        assert_eq!(s.mode(), EditMode::Idle);
    }

    #[test]
    fn one_snapshot_per_stroke() {
        let mut s = session();
        s.set_tool(Tool::Brush).unwrap();
        s.brush_mut().settings.color = Rgba([0, 0, 0, 255]);
        s.pointer_down((10.0, 10.0)).unwrap();
        for i in 0..30 {
            s.pointer_move((10.0 + i as f32 * 3.0, 10.0));
        }
        s.pointer_up();
        assert_eq!(s.history().undo_count(), 1);
        assert_eq!(s.history().undo_description(), Some("Brush Stroke"));
        assert!(s.is_dirty);
        assert_eq!(s.display_title(), "Untitled-1*");
    }

    #[test]
    fn modes_are_exclusive() {
        let mut s = session();
        s.pointer_down((5.0, 5.0)).unwrap();
        assert_eq!(s.mode(), EditMode::Selecting);
        assert_eq!(s.set_tool(Tool::Brush), Err(EngineError::Busy("selection")));
        assert_eq!(s.add_layer("x", None), Err(EngineError::Busy("selection")));
        s.pointer_move((50.0, 40.0));
        s.pointer_up();
        assert_eq!(s.selection().bounding_rect(), Some(Rect::new(5, 5, 45, 35)));

        s.begin_transform().unwrap();
        assert_eq!(s.mode(), EditMode::Transforming);
        assert_eq!(s.undo(), Err(EngineError::Busy("transform")));
        s.cancel_transform().unwrap();
        assert_eq!(s.mode(), EditMode::Idle);
    }

    #[test]
    fn tiny_drag_keeps_previous_selection() {
        let mut s = session();
        s.select_rect(Rect::new(0, 0, 50, 50)).unwrap();
        s.pointer_down((100.0, 100.0)).unwrap();
        s.pointer_move((101.0, 101.0));
        s.pointer_up();
        assert_eq!(s.selection().bounding_rect(), Some(Rect::new(0, 0, 50, 50)));
        assert_eq!(s.history().undo_count(), 1);
    }

    #[test]
    fn observers_hear_edits_until_unsubscribed() {
        let mut s = session();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let id = s.subscribe(move |e| sink.borrow_mut().push(e.clone()));
        s.add_layer("L2", None).unwrap();
        assert!(seen.borrow().contains(&SessionEvent::LayersChanged));
        assert!(seen.borrow().contains(&SessionEvent::HistoryChanged));

        assert!(s.unsubscribe(id));
        let count = seen.borrow().len();
        s.add_layer("L3", None).unwrap();
        assert_eq!(seen.borrow().len(), count);
        assert!(!s.unsubscribe(id));
    }

    #[test]
    fn ants_run_while_selected() {
        let mut s = session();
        assert!(!s.tick_ants());
        s.select_all().unwrap();
        assert!(s.tick_ants());
        assert!(s.ants().offset() > 0.0);
        s.clear_selection().unwrap();
        assert!(!s.tick_ants());
        assert!(!s.ants().is_running());
    }

    #[test]
    fn wand_with_seed_only_clears() {
        let mut s = session();
        s.set_wand_source(WandSource::ActiveLayer);
        s.select_all().unwrap();
        // a lone red pixel surrounded by transparent black
        s.fill(Rgba([255, 0, 0, 255]), Some(Rect::new(0, 0, 1, 1))).unwrap();
        assert!(!s.magic_wand_at(0, 0).unwrap());
        assert!(!s.selection().has_selection());
        assert!(s.magic_wand_at(400, 300).unwrap());
        assert_eq!(s.magic_wand_at(900, 0), Err(EngineError::SurfaceUnavailable));
    }

    #[test]
    fn saving_during_transform_writes_the_lifted_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.psd");
        let mut s = session();
        s.fill(Rgba([0, 255, 0, 255]), None).unwrap();
        s.select_rect(Rect::new(10, 10, 20, 20)).unwrap();
        s.begin_transform().unwrap();
        assert_eq!(s.layers().current_layer().pixels.pixel(15, 15)[3], 0);
        s.save_as(&path).unwrap();

        let mut other = session();
        other.open(&path).unwrap();
        assert_eq!(other.layers().current_layer().pixels.pixel(15, 15), Rgba([0, 255, 0, 255]));
        assert_eq!(other.name, "t.psd");
    }
}
