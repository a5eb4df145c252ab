use thiserror::Error;

/// Failure kinds of the editing core.
///
/// None of these are fatal: every operation that returns one has left the
/// session exactly as it found it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// A pixel surface could not be acquired (no active layer, empty region).
    #[error("pixel surface unavailable")]
    SurfaceUnavailable,
    /// A layer index outside the stack.
    #[error("layer index {index} out of bounds ({len} layers)")]
    OutOfBounds { index: usize, len: usize },
    /// Undo or redo with nothing recorded.
    #[error("no history available")]
    HistoryEmpty,
    /// Another edit mode currently owns pointer input.
    #[error("{0} is active")]
    Busy(&'static str),
}

impl EngineError {
    /// Status token reported back through the command bus.
    pub fn status(&self) -> &'static str {
        match self {
            EngineError::SurfaceUnavailable => "surface_unavailable",
            EngineError::OutOfBounds { .. } => "out_of_bounds",
            EngineError::HistoryEmpty => "history_empty",
            EngineError::Busy(_) => "busy",
        }
    }
}

/// Errors produced at the layered-image codec boundary.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("unsupported color mode {0}")]
    UnsupportedColorMode(u16),
    #[error("unsupported bit depth {0}")]
    UnsupportedDepth(u16),
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("invalid layer data: {0}")]
    InvalidLayerData(String),
    #[error("invalid dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("image encoding failed: {0}")]
    Encode(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
