use std::collections::VecDeque;
use std::time::SystemTime;

use crate::canvas::{CanvasState, Layer};
use crate::error::EngineError;
use crate::selection::SelectionState;

pub const DEFAULT_HISTORY_CAPACITY: usize = 20;

// ============================================================================
// HISTORY SNAPSHOT: full copy of the editable state
// ============================================================================

/// Deep copy of every layer (pixels included), the current-layer index and
/// the selection, taken immediately before a mutation.
#[derive(Clone, Debug)]
pub struct HistorySnapshot {
    pub description: String,
    pub width: u32,
    pub height: u32,
    pub layers: Vec<Layer>,
    pub current_layer_index: usize,
    pub selection: SelectionState,
    pub timestamp: SystemTime,
}

impl HistorySnapshot {
    pub fn capture(state: &CanvasState, description: &str) -> Self {
        Self {
            description: description.to_string(),
            width: state.layers.width(),
            height: state.layers.height(),
            layers: state.layers.layers().to_vec(),
            current_layer_index: state.layers.current_index(),
            selection: state.selection.clone(),
            timestamp: SystemTime::now(),
        }
    }

    /// Move the recorded state into `state`, replacing it wholesale.
    pub fn restore_into(self, state: &mut CanvasState) {
        state.layers.restore(self.width, self.height, self.layers, self.current_layer_index);
        state.selection = self.selection;
    }

    pub fn memory_bytes(&self) -> usize {
        self.layers.iter().map(|l| l.pixels.memory_bytes() + l.name.len()).sum()
    }
}

// ============================================================================
// HISTORY MANAGER: bounded linear undo/redo
// ============================================================================

/// Linear undo/redo over full-state snapshots.
///
/// Pushing a new snapshot discards the redo stack; past `capacity` the
/// oldest snapshot is evicted.
#[derive(Debug)]
pub struct HistoryManager {
    undo_stack: VecDeque<HistorySnapshot>,
    redo_stack: VecDeque<HistorySnapshot>,
    capacity: usize,
    /// Running memory total across both stacks.
    total_memory: usize,
}

impl Default for HistoryManager {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl HistoryManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: VecDeque::new(),
            capacity: capacity.max(1),
            total_memory: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record `state` as it is right now. Call BEFORE mutating it.
    pub fn save_history(&mut self, state: &CanvasState, description: &str) {
        for snap in self.redo_stack.drain(..) {
            self.total_memory = self.total_memory.saturating_sub(snap.memory_bytes());
        }

        let snap = HistorySnapshot::capture(state, description);
        self.total_memory += snap.memory_bytes();
        self.undo_stack.push_back(snap);
        log::debug!("history: saved \"{}\" ({} undo entries)", description, self.undo_stack.len());

        self.prune();
    }

    /// Step back one snapshot. The live state moves onto the redo stack.
    pub fn undo(&mut self, state: &mut CanvasState) -> Result<String, EngineError> {
        let snap = self.undo_stack.pop_back().ok_or(EngineError::HistoryEmpty)?;
        let description = snap.description.clone();
        let live = HistorySnapshot::capture(state, &description);
        self.total_memory = self.total_memory.saturating_sub(snap.memory_bytes()) + live.memory_bytes();
        self.redo_stack.push_back(live);
        snap.restore_into(state);
        log::info!("undo: {}", description);
        Ok(description)
    }

    /// Re-apply the most recently undone snapshot.
    pub fn redo(&mut self, state: &mut CanvasState) -> Result<String, EngineError> {
        let snap = self.redo_stack.pop_back().ok_or(EngineError::HistoryEmpty)?;
        let description = snap.description.clone();
        let live = HistorySnapshot::capture(state, &description);
        self.total_memory = self.total_memory.saturating_sub(snap.memory_bytes()) + live.memory_bytes();
        self.undo_stack.push_back(live);
        snap.restore_into(state);
        self.prune();
        log::info!("redo: {}", description);
        Ok(description)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_description(&self) -> Option<&str> {
        self.undo_stack.back().map(|s| s.description.as_str())
    }

    pub fn redo_description(&self) -> Option<&str> {
        self.redo_stack.back().map(|s| s.description.as_str())
    }

    /// Get all undo descriptions (most recent first)
    pub fn undo_history(&self) -> Vec<String> {
        self.undo_stack.iter().rev().map(|s| s.description.clone()).collect()
    }

    /// Bytes held by both stacks (O(1) via cached total)
    pub fn memory_usage(&self) -> usize {
        self.total_memory
    }

    fn prune(&mut self) {
        while self.undo_stack.len() > self.capacity {
            if let Some(removed) = self.undo_stack.pop_front() {
                self.total_memory = self.total_memory.saturating_sub(removed.memory_bytes());
                log::debug!("history: evicted \"{}\"", removed.description);
            }
        }
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.total_memory = 0;
    }

    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::{Rect, TRANSPARENT};
    use image::Rgba;

    fn canvas() -> CanvasState {
        CanvasState::new(200, 150, "Background", TRANSPARENT)
    }

    #[test]
    fn undo_restores_pre_fill_pixels() {
        let mut state = canvas();
        let mut history = HistoryManager::default();
        let blank = state.clone();

        history.save_history(&state, "Fill");
        state.layers.current_layer_mut().pixels.fill_region(Rect::new(0, 0, 100, 100), Rgba([255, 0, 0, 255]));
        assert_ne!(state, blank);

        assert_eq!(history.undo(&mut state).unwrap(), "Fill");
        assert_eq!(state, blank);
    }

    #[test]
    fn empty_history_reports_failure_without_touching_state() {
        let mut state = canvas();
        let before = state.clone();
        let mut history = HistoryManager::default();
        assert_eq!(history.undo(&mut state), Err(EngineError::HistoryEmpty));
        assert_eq!(history.redo(&mut state), Err(EngineError::HistoryEmpty));
        assert_eq!(state, before);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mut state = canvas();
        let mut history = HistoryManager::new(3);
        for i in 0..5 {
            history.save_history(&state, &format!("op {i}"));
            state.layers.add_layer(&format!("L{i}"), None);
        }
        assert_eq!(history.undo_count(), 3);
        assert_eq!(history.undo_history(), vec!["op 4", "op 3", "op 2"]);
    }

    #[test]
    fn new_edit_discards_redo() {
        let mut state = canvas();
        let mut history = HistoryManager::default();
        history.save_history(&state, "a");
        state.layers.add_layer("A", None);
        history.undo(&mut state).unwrap();
        assert!(history.can_redo());
        history.save_history(&state, "b");
        assert!(!history.can_redo());
        assert_eq!(history.redo(&mut state), Err(EngineError::HistoryEmpty));
    }

    #[test]
    fn undo_redo_law() {
        let mut state = canvas();
        let mut history = HistoryManager::default();
        let start = state.clone();

        for i in 0..20u8 {
            history.save_history(&state, "step");
            match i % 4 {
                0 => {
                    state.layers.add_layer("x", None);
                }
                1 => state.layers.current_layer_mut().pixels.fill_region(
                    Rect::new(i as i32, i as i32, 10, 10),
                    Rgba([i * 10, 0, 255 - i, 255]),
                ),
                2 => state.selection = SelectionState::Rect(Rect::new(1, 2, 30, 40)),
                _ => {
                    let _ = state.layers.set_opacity(0, i as f32 / 20.0);
                }
            }
        }
        let end = state.clone();

        for _ in 0..20 {
            history.undo(&mut state).unwrap();
        }
        assert_eq!(state, start);
        for _ in 0..20 {
            history.redo(&mut state).unwrap();
        }
        assert_eq!(state, end);
    }

    #[test]
    fn memory_tracks_both_stacks() {
        let mut state = canvas();
        let mut history = HistoryManager::default();
        history.save_history(&state, "a");
        let one = history.memory_usage();
        assert_eq!(one, 200 * 150 * 4 + "Background".len());
        history.undo(&mut state).unwrap();
        assert_eq!(history.memory_usage(), one);
        history.clear();
        assert_eq!(history.memory_usage(), 0);
    }
}
