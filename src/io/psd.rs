//! Photoshop-style layered document codec (RGB, 8 bits per channel).
//!
//! Reads raw and PackBits channel data; writes raw. Layers are stored
//! bottom-first on disk and reversed to the engine's top-first order.

use image::{Rgba, RgbaImage};

use super::{LayeredImage, LayeredImageCodec, MAX_CANVAS_DIM, MAX_LAYERS};
use crate::canvas::{BlendMode, Layer, RasterBuffer, TRANSPARENT, composite_layers, scale_to_max_edge};
use crate::error::CodecError;

const SIGNATURE: &[u8; 4] = b"8BPS";
const RESOURCE_SIGNATURE: &[u8; 4] = b"8BIM";
const COLOR_MODE_RGB: u16 = 3;
const FLAG_HIDDEN: u8 = 0x02;

const COMPRESSION_RAW: u16 = 0;
const COMPRESSION_RLE: u16 = 1;

fn blend_key(mode: BlendMode) -> &'static [u8; 4] {
    match mode {
        BlendMode::Normal => b"norm",
        BlendMode::Multiply => b"mul ",
        BlendMode::Screen => b"scrn",
        BlendMode::Overlay => b"over",
        BlendMode::Darken => b"dark",
        BlendMode::Lighten => b"lite",
        BlendMode::ColorDodge => b"div ",
        BlendMode::ColorBurn => b"idiv",
        BlendMode::HardLight => b"hLit",
        BlendMode::SoftLight => b"sLit",
        BlendMode::Difference => b"diff",
        BlendMode::Exclusion => b"smud",
    }
}

/// Unknown keys fall back to normal.
fn blend_from_key(key: &[u8]) -> BlendMode {
    match key {
        b"mul " => BlendMode::Multiply,
        b"scrn" => BlendMode::Screen,
        b"over" => BlendMode::Overlay,
        b"dark" => BlendMode::Darken,
        b"lite" => BlendMode::Lighten,
        b"div " => BlendMode::ColorDodge,
        b"idiv" => BlendMode::ColorBurn,
        b"hLit" => BlendMode::HardLight,
        b"sLit" => BlendMode::SoftLight,
        b"diff" => BlendMode::Difference,
        b"smud" => BlendMode::Exclusion,
        _ => BlendMode::Normal,
    }
}

/// Codec for `.psd` documents.
#[derive(Clone, Debug)]
pub struct PsdCodec {
    /// Longest edge of the preview produced when the file has none.
    pub thumbnail_max_edge: u32,
    /// Fill for layers stored without pixel data.
    pub default_fill: Rgba<u8>,
}

impl Default for PsdCodec {
    fn default() -> Self {
        Self {
            thumbnail_max_edge: 512,
            default_fill: TRANSPARENT,
        }
    }
}

impl LayeredImageCodec for PsdCodec {
    fn decode(&self, data: &[u8]) -> Result<LayeredImage, CodecError> {
        let mut doc = PsdReader::new(data, self.default_fill).read()?;
        doc.thumbnail = match doc.thumbnail.take() {
            Some(t) => Some(scale_to_max_edge(&t, self.thumbnail_max_edge)),
            None => Some(doc.thumbnail_or_generate(self.thumbnail_max_edge)),
        };
        Ok(doc)
    }

    fn encode(&self, image: &LayeredImage) -> Result<Vec<u8>, CodecError> {
        write_document(image)
    }
}

// ============================================================================
// READER
// ============================================================================

#[derive(Default)]
struct Planes {
    rgb: [Option<Vec<u8>>; 3],
    alpha: Option<Vec<u8>>,
}

struct LayerRecord {
    top: i32,
    left: i32,
    bottom: i32,
    right: i32,
    channels: Vec<(i16, u32)>,
    blend_mode: BlendMode,
    opacity: u8,
    clipping: bool,
    hidden: bool,
    name: String,
}

impl LayerRecord {
    fn size(&self) -> (u32, u32) {
        let w = (self.right as i64 - self.left as i64).max(0) as u32;
        let h = (self.bottom as i64 - self.top as i64).max(0) as u32;
        (w, h)
    }
}

struct PsdReader<'a> {
    data: &'a [u8],
    cursor: usize,
    default_fill: Rgba<u8>,
}

impl<'a> PsdReader<'a> {
    fn new(data: &'a [u8], default_fill: Rgba<u8>) -> Self {
        Self { data, cursor: 0, default_fill }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self.cursor.checked_add(len).ok_or(CodecError::UnexpectedEof)?;
        if end > self.data.len() {
            return Err(CodecError::UnexpectedEof);
        }
        let out = &self.data[self.cursor..end];
        self.cursor = end;
        Ok(out)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_array::<1>()?[0])
    }

    fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    fn read_i16(&mut self) -> Result<i16, CodecError> {
        Ok(i16::from_be_bytes(self.read_array()?))
    }

    fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_be_bytes(self.read_array()?))
    }

    fn skip(&mut self, len: usize) -> Result<(), CodecError> {
        self.read_bytes(len).map(|_| ())
    }

    fn seek(&mut self, pos: usize) -> Result<(), CodecError> {
        if pos > self.data.len() {
            return Err(CodecError::UnexpectedEof);
        }
        self.cursor = pos;
        Ok(())
    }

    fn read(mut self) -> Result<LayeredImage, CodecError> {
        if &self.read_array::<4>()? != SIGNATURE {
            return Err(CodecError::InvalidSignature);
        }
        let version = self.read_u16()?;
        if version != 1 {
            return Err(CodecError::UnsupportedVersion(version));
        }
        self.skip(6)?;
        let channels = self.read_u16()?;
        let height = self.read_u32()?;
        let width = self.read_u32()?;
        let depth = self.read_u16()?;
        let mode = self.read_u16()?;
        if depth != 8 {
            return Err(CodecError::UnsupportedDepth(depth));
        }
        if mode != COLOR_MODE_RGB {
            return Err(CodecError::UnsupportedColorMode(mode));
        }
        if width == 0 || height == 0 || width > MAX_CANVAS_DIM || height > MAX_CANVAS_DIM {
            return Err(CodecError::InvalidDimensions { width, height });
        }

        let color_data_len = self.read_u32()? as usize;
        self.skip(color_data_len)?;
        let resources_len = self.read_u32()? as usize;
        self.skip(resources_len)?;

        let mut layers = self.read_layer_section(width, height)?;
        let composite = if self.cursor + 2 <= self.data.len() {
            Some(self.read_composite(width, height, channels)?)
        } else {
            None
        };

        if layers.is_empty() {
            // A flat file: its composite is the only layer.
            let pixels = match &composite {
                Some(img) => RasterBuffer::from_image(img.clone()),
                None => return Err(CodecError::InvalidLayerData("no layers and no image data".into())),
            };
            layers.push(Layer::from_pixels("Background".to_string(), pixels));
        }

        Ok(LayeredImage { width, height, layers, thumbnail: composite })
    }

    fn read_layer_section(&mut self, width: u32, height: u32) -> Result<Vec<Layer>, CodecError> {
        let section_len = self.read_u32()? as usize;
        if section_len == 0 {
            return Ok(Vec::new());
        }
        let section_end = self.cursor.checked_add(section_len).ok_or(CodecError::UnexpectedEof)?;
        let info_len = self.read_u32()? as usize;
        if info_len == 0 {
            self.seek(section_end)?;
            return Ok(Vec::new());
        }

        // Negative means the first alpha channel holds merged transparency.
        let count = self.read_i16()?.unsigned_abs() as usize;
        if count > MAX_LAYERS {
            return Err(CodecError::InvalidLayerData(format!("{count} layers exceeds the limit of {MAX_LAYERS}")));
        }

        let mut records = Vec::with_capacity(count);
        let mut total_area = 0u64;
        let area_budget = width as u64 * height as u64 * MAX_LAYERS as u64;
        for _ in 0..count {
            let record = self.read_record(width, height)?;
            let (w, h) = record.size();
            total_area += w as u64 * h as u64;
            if total_area > area_budget {
                return Err(CodecError::InvalidLayerData("layer rects exceed the canvas budget".into()));
            }
            records.push(record);
        }

        let mut layers = Vec::with_capacity(count);
        for record in &records {
            let planes = self.read_channels(record)?;
            layers.push(self.build_layer(record, planes, width, height));
        }

        self.seek(section_end)?;
        // Stored bottom-first.
        layers.reverse();
        Ok(layers)
    }

    /// One layer record. The rect is checked against the canvas here so no
    /// channel buffer is ever sized from an unchecked rect.
    fn read_record(&mut self, width: u32, height: u32) -> Result<LayerRecord, CodecError> {
        let top = self.read_i32()?;
        let left = self.read_i32()?;
        let bottom = self.read_i32()?;
        let right = self.read_i32()?;
        check_layer_rect([top, left, bottom, right], width, height)?;

        let channel_count = self.read_u16()? as usize;
        if channel_count > 56 {
            return Err(CodecError::InvalidLayerData(format!("{channel_count} channels in one layer")));
        }
        let mut channels = Vec::with_capacity(channel_count);
        for _ in 0..channel_count {
            let id = self.read_i16()?;
            let len = self.read_u32()?;
            channels.push((id, len));
        }

        if &self.read_array::<4>()? != RESOURCE_SIGNATURE {
            return Err(CodecError::InvalidLayerData("missing blend-mode signature".into()));
        }
        let blend_mode = blend_from_key(&self.read_array::<4>()?);
        let opacity = self.read_u8()?;
        let clipping = self.read_u8()? != 0;
        let flags = self.read_u8()?;
        self.skip(1)?;

        let extra_len = self.read_u32()? as usize;
        let extra_end = self.cursor.checked_add(extra_len).ok_or(CodecError::UnexpectedEof)?;
        let mask_len = self.read_u32()? as usize;
        self.skip(mask_len)?;
        let ranges_len = self.read_u32()? as usize;
        self.skip(ranges_len)?;

        let name_len = self.read_u8()? as usize;
        let mut name = String::from_utf8_lossy(self.read_bytes(name_len)?).into_owned();
        self.skip(pascal_padding(name_len))?;

        while self.cursor + 12 <= extra_end {
            let sig = self.read_array::<4>()?;
            let key = self.read_array::<4>()?;
            let len = self.read_u32()? as usize;
            let block_end = self.cursor.checked_add(len).ok_or(CodecError::UnexpectedEof)?;
            if &sig != RESOURCE_SIGNATURE && &sig != b"8B64" {
                break;
            }
            if &key == b"luni" && len >= 4 {
                let chars = self.read_u32()? as usize;
                if chars * 2 + 4 <= len {
                    let units: Vec<u16> = self
                        .read_bytes(chars * 2)?
                        .chunks_exact(2)
                        .map(|c| u16::from_be_bytes([c[0], c[1]]))
                        .collect();
                    name = String::from_utf16_lossy(&units).trim_end_matches('\0').to_string();
                }
            }
            self.seek(block_end + (len & 1))?;
        }
        self.seek(extra_end)?;

        Ok(LayerRecord {
            top,
            left,
            bottom,
            right,
            channels,
            blend_mode,
            opacity,
            clipping,
            hidden: flags & FLAG_HIDDEN != 0,
            name,
        })
    }

    fn read_channels(&mut self, record: &LayerRecord) -> Result<Planes, CodecError> {
        let (w, h) = record.size();
        let mut planes = Planes::default();
        for &(id, len) in &record.channels {
            let len = len as usize;
            if len == 0 {
                continue;
            }
            let end = self.cursor.checked_add(len).ok_or(CodecError::UnexpectedEof)?;
            if len < 2 || w == 0 || h == 0 {
                self.seek(end)?;
                continue;
            }
            let compression = self.read_u16()?;
            let plane = self.read_plane(compression, w as usize, h as usize, end)?;
            self.seek(end)?;
            match id {
                0..=2 => planes.rgb[id as usize] = Some(plane),
                -1 => planes.alpha = Some(plane),
                _ => {}
            }
        }
        Ok(planes)
    }

    /// One channel's pixels, `w * h` bytes, ending no later than `end`.
    fn read_plane(&mut self, compression: u16, w: usize, h: usize, end: usize) -> Result<Vec<u8>, CodecError> {
        let expected = w * h;
        match compression {
            COMPRESSION_RAW => Ok(self.read_bytes(expected)?.to_vec()),
            COMPRESSION_RLE => {
                check_rle_capacity(expected, end.saturating_sub(self.cursor))?;
                let mut row_lens = Vec::with_capacity(h);
                for _ in 0..h {
                    row_lens.push(self.read_u16()? as usize);
                }
                let mut out = Vec::with_capacity(expected);
                for len in row_lens {
                    if self.cursor + len > end {
                        return Err(CodecError::UnexpectedEof);
                    }
                    out.extend(decode_rle(self.read_bytes(len)?, w));
                }
                Ok(out)
            }
            other => Err(CodecError::InvalidLayerData(format!("unsupported compression {other}"))),
        }
    }

    fn build_layer(&self, record: &LayerRecord, planes: Planes, width: u32, height: u32) -> Layer {
        let (w, h) = record.size();
        let has_color = planes.rgb.iter().any(Option::is_some);
        let pixels = if w == 0 || h == 0 || (!has_color && planes.alpha.is_none()) {
            log::warn!("layer \"{}\" has no pixel data; using default fill", record.name);
            RasterBuffer::new_filled(width, height, self.default_fill)
        } else {
            let mut local = RgbaImage::new(w, h);
            for (i, px) in local.pixels_mut().enumerate() {
                let channel = |p: &Option<Vec<u8>>, fallback: u8| p.as_ref().and_then(|v| v.get(i).copied()).unwrap_or(fallback);
                *px = Rgba([
                    channel(&planes.rgb[0], 0),
                    channel(&planes.rgb[1], 0),
                    channel(&planes.rgb[2], 0),
                    channel(&planes.alpha, 255),
                ]);
            }
            let mut canvas = RasterBuffer::new(width, height);
            canvas.set_region(record.left, record.top, &RasterBuffer::from_image(local));
            canvas
        };

        Layer {
            name: record.name.clone(),
            visible: !record.hidden,
            opacity: record.opacity as f32 / 255.0,
            blend_mode: record.blend_mode,
            clipping_mask: record.clipping,
            pixels,
        }
    }

    fn read_composite(&mut self, width: u32, height: u32, channels: u16) -> Result<RgbaImage, CodecError> {
        let compression = self.read_u16()?;
        let (w, h) = (width as usize, height as usize);
        let plane_len = w * h;
        let used = (channels as usize).min(4);
        if used < 3 {
            return Err(CodecError::InvalidLayerData(format!("{channels} channels in the image data")));
        }

        let planes: Vec<Vec<u8>> = match compression {
            COMPRESSION_RAW => {
                let mut planes = Vec::with_capacity(used);
                for _ in 0..used {
                    planes.push(self.read_bytes(plane_len)?.to_vec());
                }
                planes
            }
            COMPRESSION_RLE => {
                check_rle_capacity(plane_len * used, self.data.len().saturating_sub(self.cursor))?;
                // Row lengths for every channel come first, then the data.
                let mut row_lens = Vec::with_capacity(h * channels as usize);
                for _ in 0..h * channels as usize {
                    row_lens.push(self.read_u16()? as usize);
                }
                let mut planes = Vec::with_capacity(used);
                for c in 0..used {
                    let mut plane = Vec::with_capacity(plane_len);
                    for &len in &row_lens[c * h..(c + 1) * h] {
                        plane.extend(decode_rle(self.read_bytes(len)?, w));
                    }
                    planes.push(plane);
                }
                planes
            }
            other => return Err(CodecError::InvalidLayerData(format!("unsupported compression {other}"))),
        };

        let mut img = RgbaImage::new(width, height);
        for (i, px) in img.pixels_mut().enumerate() {
            let get = |c: usize, fallback: u8| planes.get(c).map_or(fallback, |p| p[i]);
            *px = Rgba([get(0, 0), get(1, 0), get(2, 0), get(3, 255)]);
        }
        Ok(img)
    }
}

/// Reject layer rects wider or taller than any canvas, or lying wholly
/// outside this one. Empty rects are layers without pixels and pass.
fn check_layer_rect([top, left, bottom, right]: [i32; 4], width: u32, height: u32) -> Result<(), CodecError> {
    let w = right as i64 - left as i64;
    let h = bottom as i64 - top as i64;
    if w <= 0 || h <= 0 {
        return Ok(());
    }
    if w > MAX_CANVAS_DIM as i64 || h > MAX_CANVAS_DIM as i64 {
        return Err(CodecError::InvalidLayerData(format!("layer rect {w}x{h} exceeds the size limit")));
    }
    if right <= 0 || bottom <= 0 || left as i64 >= width as i64 || top as i64 >= height as i64 {
        return Err(CodecError::InvalidLayerData(format!(
            "layer rect ({left},{top})-({right},{bottom}) lies outside the {width}x{height} canvas"
        )));
    }
    Ok(())
}

/// PackBits expands at most 128 bytes out of every 2 bytes in, row
/// headers included, so `available` input bounds what can be decoded.
fn check_rle_capacity(expected: usize, available: usize) -> Result<(), CodecError> {
    if expected > available.saturating_mul(64) {
        return Err(CodecError::InvalidLayerData(format!(
            "{available} bytes of RLE data cannot hold {expected} pixels"
        )));
    }
    Ok(())
}

/// Unpack one PackBits row, padded or truncated to `expected` bytes.
fn decode_rle(data: &[u8], expected: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(expected);
    let mut i = 0;
    while i < data.len() && out.len() < expected {
        let n = data[i] as i8;
        i += 1;
        if n >= 0 {
            let count = n as usize + 1;
            let end = (i + count).min(data.len());
            out.extend_from_slice(&data[i..end]);
            i = end;
        } else if n > -128 {
            let count = (-(n as i16)) as usize + 1;
            if let Some(&v) = data.get(i) {
                out.extend(std::iter::repeat_n(v, count));
                i += 1;
            }
        }
    }
    out.resize(expected, 0);
    out
}

/// Bytes after a Pascal string so that length byte + text is a multiple of 4.
fn pascal_padding(text_len: usize) -> usize {
    ((text_len + 1 + 3) & !3) - (text_len + 1)
}

// ============================================================================
// WRITER
// ============================================================================

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_i16(buf: &mut Vec<u8>, v: i16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn len_u32(len: usize) -> Result<u32, CodecError> {
    u32::try_from(len).map_err(|_| CodecError::InvalidLayerData("section larger than 4 GiB".into()))
}

fn write_document(doc: &LayeredImage) -> Result<Vec<u8>, CodecError> {
    let (width, height) = (doc.width, doc.height);
    if width == 0 || height == 0 || width > MAX_CANVAS_DIM || height > MAX_CANVAS_DIM {
        return Err(CodecError::InvalidDimensions { width, height });
    }
    if doc.layers.is_empty() || doc.layers.len() > MAX_LAYERS {
        return Err(CodecError::InvalidLayerData(format!("cannot write {} layers", doc.layers.len())));
    }
    if let Some(bad) = doc.layers.iter().find(|l| l.pixels.width() != width || l.pixels.height() != height) {
        return Err(CodecError::InvalidLayerData(format!("layer \"{}\" does not match the canvas size", bad.name)));
    }

    let mut out = Vec::new();
    out.extend_from_slice(SIGNATURE);
    put_u16(&mut out, 1);
    out.extend_from_slice(&[0; 6]);
    put_u16(&mut out, 4);
    put_u32(&mut out, height);
    put_u32(&mut out, width);
    put_u16(&mut out, 8);
    put_u16(&mut out, COLOR_MODE_RGB);
    put_u32(&mut out, 0); // color mode data
    put_u32(&mut out, 0); // image resources

    let plane_len = width as usize * height as usize;
    let channel_len = len_u32(2 + plane_len)?;

    let mut info = Vec::new();
    put_i16(&mut info, doc.layers.len() as i16);
    for layer in doc.layers.iter().rev() {
        write_record(&mut info, layer, width, height, channel_len)?;
    }
    for layer in doc.layers.iter().rev() {
        let raw = layer.pixels.as_raw();
        for c in [0usize, 1, 2, 3] {
            put_u16(&mut info, COMPRESSION_RAW);
            info.extend(raw.iter().skip(c).step_by(4));
        }
    }
    if info.len() % 2 == 1 {
        info.push(0);
    }

    let mut section = Vec::with_capacity(info.len() + 8);
    put_u32(&mut section, len_u32(info.len())?);
    section.extend_from_slice(&info);
    put_u32(&mut section, 0); // global layer mask
    put_u32(&mut out, len_u32(section.len())?);
    out.extend_from_slice(&section);

    // Flattened preview at full size, planar RGBA.
    let flat = composite_layers(&doc.layers, width, height);
    put_u16(&mut out, COMPRESSION_RAW);
    for c in 0..4 {
        out.extend(flat.as_raw().iter().skip(c).step_by(4));
    }
    Ok(out)
}

fn write_record(buf: &mut Vec<u8>, layer: &Layer, width: u32, height: u32, channel_len: u32) -> Result<(), CodecError> {
    put_i32(buf, 0);
    put_i32(buf, 0);
    put_i32(buf, height as i32);
    put_i32(buf, width as i32);
    put_u16(buf, 4);
    for id in [0i16, 1, 2, -1] {
        put_i16(buf, id);
        put_u32(buf, channel_len);
    }
    buf.extend_from_slice(RESOURCE_SIGNATURE);
    buf.extend_from_slice(blend_key(layer.blend_mode));
    buf.push((layer.opacity.clamp(0.0, 1.0) * 255.0).round() as u8);
    buf.push(layer.clipping_mask as u8);
    buf.push(if layer.visible { 0 } else { FLAG_HIDDEN });
    buf.push(0);

    let mut extra = Vec::new();
    put_u32(&mut extra, 0); // layer mask
    put_u32(&mut extra, 0); // blending ranges

    let ascii: Vec<u8> = layer
        .name
        .chars()
        .take(255)
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect();
    extra.push(ascii.len() as u8);
    extra.extend_from_slice(&ascii);
    extra.extend(std::iter::repeat_n(0u8, pascal_padding(ascii.len())));

    let units: Vec<u16> = layer.name.encode_utf16().collect();
    let mut luni = Vec::with_capacity(4 + units.len() * 2);
    put_u32(&mut luni, units.len() as u32);
    for u in &units {
        put_u16(&mut luni, *u);
    }
    while luni.len() % 4 != 0 {
        luni.push(0);
    }
    extra.extend_from_slice(RESOURCE_SIGNATURE);
    extra.extend_from_slice(b"luni");
    put_u32(&mut extra, len_u32(luni.len())?);
    extra.extend_from_slice(&luni);

    put_u32(buf, len_u32(extra.len())?);
    buf.extend_from_slice(&extra);
    Ok(())
}
