//! Paint layer engine: a stack of raster layers with blend modes,
//! rectangle/lasso/magic-wand selections, a mixing brush, free transform,
//! bounded undo/redo and a layered-image codec, driven through a
//! [`project::PainterSession`] or the string-based [`commands::CommandBus`].

pub mod brush;
pub mod canvas;
pub mod commands;
pub mod components;
pub mod config;
pub mod error;
pub mod io;
pub mod logger;
pub mod ops;
pub mod project;
pub mod selection;

pub use canvas::{BlendMode, CanvasState, Layer, LayerStack, RasterBuffer, Rect};
pub use commands::CommandBus;
pub use error::{CodecError, EngineError};
pub use project::{EditMode, PainterSession, SessionEvent, Tool};
