// ============================================================================
// CANVAS-LEVEL OPERATIONS: history-recorded layer and pixel edits
// ============================================================================
//
// Every function validates first, then records exactly one snapshot, then
// mutates. A rejected call leaves both the canvas and the history as they
// were.

use image::Rgba;

use crate::canvas::{BlendMode, CanvasState, RasterBuffer, Rect};
use crate::components::history::HistoryManager;
use crate::error::EngineError;
use crate::selection::{SelectionScope, SelectionState};

pub fn add_layer(
    state: &mut CanvasState,
    history: &mut HistoryManager,
    name: &str,
    image: Option<RasterBuffer>,
) -> usize {
    history.save_history(state, "Add Layer");
    let idx = state.layers.add_layer(name, image);
    log::info!("layer added: \"{}\" ({} layers)", name, state.layers.len());
    idx
}

/// Refuses to remove the last remaining layer.
pub fn remove_layer(state: &mut CanvasState, history: &mut HistoryManager, index: usize) -> Result<(), EngineError> {
    state.layers.check_index(index)?;
    if state.layers.len() <= 1 {
        return Err(EngineError::OutOfBounds { index, len: 1 });
    }
    history.save_history(state, "Delete Layer");
    let removed = state.layers.remove_layer(index)?;
    log::info!("layer removed: \"{}\"", removed.name);
    Ok(())
}

pub fn duplicate_layer(state: &mut CanvasState, history: &mut HistoryManager, index: usize) -> Result<usize, EngineError> {
    state.layers.check_index(index)?;
    history.save_history(state, "Duplicate Layer");
    state.layers.duplicate_layer(index)
}

pub fn rename_layer(state: &mut CanvasState, history: &mut HistoryManager, index: usize, name: &str) -> Result<(), EngineError> {
    state.layers.check_index(index)?;
    history.save_history(state, "Rename Layer");
    state.layers.rename(index, name)
}

/// Clamps into `0.0..=1.0`; NaN is ignored and records nothing.
pub fn set_opacity(state: &mut CanvasState, history: &mut HistoryManager, index: usize, opacity: f32) -> Result<(), EngineError> {
    state.layers.check_index(index)?;
    if opacity.is_nan() {
        return Ok(());
    }
    history.save_history(state, "Layer Opacity");
    state.layers.set_opacity(index, opacity)
}

pub fn set_blend_mode(state: &mut CanvasState, history: &mut HistoryManager, index: usize, mode: BlendMode) -> Result<(), EngineError> {
    state.layers.check_index(index)?;
    history.save_history(state, "Blend Mode");
    state.layers.set_blend_mode(index, mode)
}

/// Returns the new visibility.
pub fn toggle_visibility(state: &mut CanvasState, history: &mut HistoryManager, index: usize) -> Result<bool, EngineError> {
    state.layers.check_index(index)?;
    history.save_history(state, "Layer Visibility");
    state.layers.toggle_visibility(index)
}

pub fn set_clipping_mask(
    state: &mut CanvasState,
    history: &mut HistoryManager,
    index: usize,
    clipping: bool,
) -> Result<(), EngineError> {
    state.layers.check_index(index)?;
    history.save_history(state, "Clipping Mask");
    state.layers.set_clipping_mask(index, clipping)
}

pub fn move_layer(state: &mut CanvasState, history: &mut HistoryManager, from: usize, to: usize) -> Result<(), EngineError> {
    state.layers.check_index(from)?;
    state.layers.check_index(to)?;
    if from == to {
        return Ok(());
    }
    history.save_history(state, "Move Layer");
    state.layers.move_layer(from, to)
}

/// Merge layer `index` into the layer above it in index order (`index - 1`).
pub fn merge_down(state: &mut CanvasState, history: &mut HistoryManager, index: usize) -> Result<(), EngineError> {
    state.layers.check_index(index)?;
    if index == 0 {
        return Err(EngineError::OutOfBounds { index, len: state.layers.len() });
    }
    history.save_history(state, "Merge Down");
    state.layers.merge_down(index)?;
    log::info!("merged layer {} into {}", index, index - 1);
    Ok(())
}

pub fn flatten(state: &mut CanvasState, history: &mut HistoryManager, name: &str) {
    history.save_history(state, "Flatten Image");
    state.layers.flatten(name);
    log::info!("image flattened");
}

fn apply_in_scope(
    state: &mut CanvasState,
    history: &mut HistoryManager,
    rect: Option<Rect>,
    description: &str,
    color: Rgba<u8>,
) -> Result<(), EngineError> {
    let scope = match rect {
        Some(r) => SelectionScope::Rect(
            r.clip_to(state.width(), state.height()).ok_or(EngineError::SurfaceUnavailable)?,
        ),
        None => state.selection.scope(),
    };
    history.save_history(state, description);
    let pixels = &mut state.layers.current_layer_mut().pixels;
    match scope {
        SelectionScope::Everything => pixels.fill(color),
        SelectionScope::Rect(r) => pixels.fill_region(r, color),
        SelectionScope::Mask(mask) => pixels.fill_mask(mask, color),
    }
    Ok(())
}

/// Fill the current layer inside `rect`, or inside the selection when no
/// rect is given, or everywhere when there is neither.
pub fn fill(
    state: &mut CanvasState,
    history: &mut HistoryManager,
    color: Rgba<u8>,
    rect: Option<Rect>,
) -> Result<(), EngineError> {
    apply_in_scope(state, history, rect, "Fill", color)
}

/// Make pixels transparent, scoped like [`fill`].
pub fn clear(state: &mut CanvasState, history: &mut HistoryManager, rect: Option<Rect>) -> Result<(), EngineError> {
    apply_in_scope(state, history, rect, "Clear", Rgba([0, 0, 0, 0]))
}

/// Commit a selection as an undoable step.
pub fn set_selection(state: &mut CanvasState, history: &mut HistoryManager, selection: SelectionState) {
    history.save_history(state, "Select");
    log::debug!("selection committed: {:?}", selection.kind());
    state.selection = selection;
}

/// Drop the selection. Does nothing, and records nothing, without one.
pub fn clear_selection(state: &mut CanvasState, history: &mut HistoryManager) -> bool {
    if !state.selection.has_selection() {
        return false;
    }
    history.save_history(state, "Deselect");
    state.selection = SelectionState::None;
    true
}
