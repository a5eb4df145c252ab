use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use base64::Engine;
use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder, RgbaImage};

use crate::canvas::{Layer, LayerStack, composite_layers, scale_to_max_edge};
use crate::config::EngineSettings;
use crate::error::CodecError;

mod psd;

pub use psd::PsdCodec;

/// Maximum supported canvas dimension in pixels (per axis).
/// Prevents memory exhaustion from crafted files.
pub const MAX_CANVAS_DIM: u32 = 30_000;
/// Maximum number of layers in a document.
pub const MAX_LAYERS: usize = 256;

// ============================================================================
// LAYERED IMAGE: what crosses the codec boundary
// ============================================================================

/// Plain layered document: dimensions, layers (index 0 = topmost) and an
/// optional flattened preview.
#[derive(Clone, Debug, PartialEq)]
pub struct LayeredImage {
    pub width: u32,
    pub height: u32,
    pub layers: Vec<Layer>,
    pub thumbnail: Option<RgbaImage>,
}

impl LayeredImage {
    /// Copy a stack out for encoding, with a preview bounded to `thumbnail_max_edge`.
    pub fn from_stack(stack: &LayerStack, thumbnail_max_edge: u32) -> Self {
        Self {
            width: stack.width(),
            height: stack.height(),
            layers: stack.layers().to_vec(),
            thumbnail: Some(stack.composite_scaled(thumbnail_max_edge)),
        }
    }

    /// Turn a decoded document into a live stack with the top layer current.
    pub fn into_stack(self) -> Result<LayerStack, CodecError> {
        LayerStack::from_layers(self.width, self.height, self.layers, 0)
            .ok_or_else(|| CodecError::InvalidLayerData("document has no layers".into()))
    }

    /// The stored preview, or one regenerated from the visible layers.
    pub fn thumbnail_or_generate(&self, max_edge: u32) -> RgbaImage {
        match &self.thumbnail {
            Some(t) => scale_to_max_edge(t, max_edge),
            None => generate_thumbnail(&self.layers, self.width, self.height, max_edge),
        }
    }
}

/// Encode/decode pair for a layered-image binary. Implementations hold no
/// session state.
pub trait LayeredImageCodec {
    fn decode(&self, data: &[u8]) -> Result<LayeredImage, CodecError>;
    fn encode(&self, image: &LayeredImage) -> Result<Vec<u8>, CodecError>;
}

/// Composite the visible layers and shrink the result so its longest edge
/// is at most `max_edge`.
pub fn generate_thumbnail(layers: &[Layer], width: u32, height: u32, max_edge: u32) -> RgbaImage {
    scale_to_max_edge(&composite_layers(layers, width, height), max_edge)
}

/// PNG-encode `image` as a `data:image/png;base64,...` URL.
pub fn png_data_url(image: &RgbaImage) -> Result<String, CodecError> {
    let mut png = Vec::new();
    PngEncoder::new(&mut png)
        .write_image(image.as_raw(), image.width(), image.height(), ColorType::Rgba8)
        .map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(&png)
    ))
}

// ============================================================================
// FILE LOAD / SAVE
// ============================================================================

/// Encode `stack` and write it to `path`.
///
/// The bytes go to a sibling temp file first and are renamed into place,
/// so a failed write never leaves a truncated document behind.
pub fn save_document(
    codec: &dyn LayeredImageCodec,
    stack: &LayerStack,
    path: &Path,
    thumbnail_max_edge: u32,
) -> Result<(), CodecError> {
    let bytes = codec.encode(&LayeredImage::from_stack(stack, thumbnail_max_edge))?;
    let tmp = temp_sibling(path);
    if let Err(e) = fs::write(&tmp, &bytes) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    fs::rename(&tmp, path)?;
    log::info!("saved {} ({} bytes, {} layers)", path.display(), bytes.len(), stack.len());
    Ok(())
}

/// Read and decode the document at `path`.
pub fn load_document(codec: &dyn LayeredImageCodec, path: &Path) -> Result<LayeredImage, CodecError> {
    let bytes = fs::read(path)?;
    match codec.decode(&bytes) {
        Ok(doc) => {
            log::info!(
                "loaded {} ({}x{}, {} layers)",
                path.display(),
                doc.width,
                doc.height,
                doc.layers.len()
            );
            Ok(doc)
        }
        Err(e) => {
            log::warn!("failed to decode {}: {}", path.display(), e);
            Err(e)
        }
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Returns the platform-specific directory used for auto-save files.
///
/// `%APPDATA%\LayerPaint\autosave\`       (Windows)
/// `~/.config/layerpaint/autosave/`       (Linux)
/// `~/Library/Application Support/LayerPaint/autosave/`  (macOS)
pub fn autosave_dir() -> Option<PathBuf> {
    EngineSettings::settings_path().and_then(|p| p.parent().map(|d| d.join("autosave")))
}

// ============================================================================
// AUTO-SAVE TIMER
// ============================================================================

/// Debounce timer for persisting the layer stack.
///
/// Each [`schedule`](Self::schedule) pushes the deadline out to
/// `now + delay` (last scheduled wins). Inside a batch, scheduling is only
/// remembered and fires once when the outermost batch ends.
#[derive(Clone, Debug)]
pub struct AutoSave {
    delay: Duration,
    deadline: Option<Instant>,
    batch_depth: usize,
    pending_in_batch: bool,
}

impl AutoSave {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
            batch_depth: 0,
            pending_in_batch: false,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some() || self.pending_in_batch
    }

    pub fn in_batch(&self) -> bool {
        self.batch_depth > 0
    }

    pub fn schedule(&mut self, now: Instant) {
        if self.batch_depth > 0 {
            self.pending_in_batch = true;
            return;
        }
        self.deadline = Some(now + self.delay);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
        self.pending_in_batch = false;
    }

    pub fn begin_batch(&mut self) {
        self.batch_depth += 1;
    }

    pub fn end_batch(&mut self, now: Instant) {
        if self.batch_depth == 0 {
            return;
        }
        self.batch_depth -= 1;
        if self.batch_depth == 0 && self.pending_in_batch {
            self.pending_in_batch = false;
            self.schedule(now);
        }
    }

    /// True exactly once per elapsed deadline; the caller then writes.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(d) if now >= d => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

impl Default for AutoSave {
    fn default() -> Self {
        Self::new(Duration::from_millis(2000))
    }
}
