//! Image normalization and content fingerprints
//!
//! Every captured creative, however it was obtained, goes through
//! [`normalize`] before it is stored. The canonical form is an RGBA8 PNG
//! written with a pinned encoder configuration:
//!
//! | Parameter | Value |
//! |-----------|-------|
//! | Crate | `image` 0.24 (`png` backend) |
//! | Color type | `Rgba8` |
//! | Compression | `CompressionType::Best` |
//! | Filter | `FilterType::Adaptive` |
//!
//! The SHA-256 of those bytes is the dedup and storage key, so changing any
//! row above changes every content hash. Bump the pipeline version when
//! doing so.
//!
//! ```rust
//! use creative_capture::{hamming_distance, normalize};
//! use image::{ImageOutputFormat, Rgba, RgbaImage};
//!
//! let img = RgbaImage::from_pixel(4, 4, Rgba([200, 10, 10, 255]));
//! let mut raw = std::io::Cursor::new(Vec::new());
//! image::DynamicImage::ImageRgba8(img)
//!     .write_to(&mut raw, ImageOutputFormat::Png)
//!     .unwrap();
//!
//! let asset = normalize(raw.get_ref(), false).unwrap();
//! assert_eq!(asset.content_hash.len(), 64);
//! assert_eq!(hamming_distance(&asset.fingerprint, &asset.fingerprint), 0);
//! ```

use crate::CaptureError;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::{self, FilterType};
use image::{ColorType, GrayImage, ImageEncoder, RgbaImage};
use sha2::{Digest, Sha256};

/// Channel difference from the background that still counts as background.
const TRIM_TOLERANCE: u8 = 100;

/// Side of the luminance grid used for the perceptual fingerprint.
const FINGERPRINT_GRID: u32 = 8;

/// Distance reported when either fingerprint cannot be parsed.
pub const MAX_FINGERPRINT_DISTANCE: u32 = 64;

/// Canonical, content-addressed form of one captured creative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedAsset {
    pub bytes: Vec<u8>,
    /// Lowercase hex SHA-256 of `bytes`
    pub content_hash: String,
    /// 16 hex digits, advisory only
    pub fingerprint: String,
    pub width: u32,
    pub height: u32,
}

/// Decode `raw`, optionally trim a background border, and re-encode it in the
/// canonical PNG form.
pub fn normalize(raw: &[u8], trim: bool) -> Result<NormalizedAsset, CaptureError> {
    let mut rgba = decode_rgba(raw)?;

    if trim {
        if let Some((x, y, w, h)) = content_bounds(&rgba) {
            if (w, h) != rgba.dimensions() {
                rgba = imageops::crop_imm(&rgba, x, y, w, h).to_image();
            }
        }
    }

    let bytes = encode_canonical(&rgba)?;
    let content_hash = sha256_hex(&bytes);
    let fingerprint = fingerprint_image(&rgba);
    let (width, height) = rgba.dimensions();

    Ok(NormalizedAsset {
        bytes,
        content_hash,
        fingerprint,
        width,
        height,
    })
}

/// Perceptual fingerprint of undecoded bytes.
pub fn fingerprint(raw: &[u8]) -> Result<String, CaptureError> {
    Ok(fingerprint_image(&decode_rgba(raw)?))
}

/// Average hash over an 8x8 luminance grid, packed row-major, most
/// significant bit first.
pub fn fingerprint_image(rgba: &RgbaImage) -> String {
    let gray: GrayImage = image::DynamicImage::ImageRgba8(rgba.clone()).to_luma8();
    let grid = imageops::resize(&gray, FINGERPRINT_GRID, FINGERPRINT_GRID, FilterType::Lanczos3);

    let cells: Vec<u32> = grid.pixels().map(|p| p.0[0] as u32).collect();
    let mean = cells.iter().sum::<u32>() as f64 / cells.len() as f64;

    let bits = cells
        .iter()
        .fold(0u64, |acc, &cell| (acc << 1) | u64::from(cell as f64 > mean));

    format!("{bits:016x}")
}

/// Number of differing bits between two fingerprints.
///
/// Unparseable input is treated as maximally different.
pub fn hamming_distance(a: &str, b: &str) -> u32 {
    match (u64::from_str_radix(a, 16), u64::from_str_radix(b, 16)) {
        (Ok(a), Ok(b)) => (a ^ b).count_ones(),
        _ => MAX_FINGERPRINT_DISTANCE,
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn decode_rgba(raw: &[u8]) -> Result<RgbaImage, CaptureError> {
    if raw.is_empty() {
        return Err(CaptureError::Decode("empty payload".to_string()));
    }
    Ok(image::load_from_memory(raw)?.to_rgba8())
}

fn encode_canonical(rgba: &RgbaImage) -> Result<Vec<u8>, CaptureError> {
    let mut out = Vec::new();
    let encoder = PngEncoder::new_with_quality(&mut out, CompressionType::Best, PngFilter::Adaptive);
    encoder
        .write_image(rgba.as_raw(), rgba.width(), rgba.height(), ColorType::Rgba8)
        .map_err(|e| CaptureError::Decode(format!("png encode: {e}")))?;
    Ok(out)
}

/// A pixel is background when it is close to fully transparent or close to
/// opaque white.
fn is_background(px: &image::Rgba<u8>) -> bool {
    let [r, g, b, a] = px.0;
    let transparent = a <= TRIM_TOLERANCE;
    let white = a >= 255 - TRIM_TOLERANCE
        && r >= 255 - TRIM_TOLERANCE
        && g >= 255 - TRIM_TOLERANCE
        && b >= 255 - TRIM_TOLERANCE;
    transparent || white
}

/// Bounding box `(x, y, width, height)` of non-background pixels, or `None`
/// for a blank image.
fn content_bounds(rgba: &RgbaImage) -> Option<(u32, u32, u32, u32)> {
    let mut min_x = u32::MAX;
    let mut min_y = u32::MAX;
    let mut max_x = 0;
    let mut max_y = 0;
    let mut found = false;

    for (x, y, px) in rgba.enumerate_pixels() {
        if !is_background(px) {
            found = true;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
    }

    found.then(|| (min_x, min_y, max_x - min_x + 1, max_y - min_y + 1))
}
