//! Decoded image values and the byte codec used by the disk and network tiers.

use std::{fmt, io::Cursor, sync::Arc};

use image::{
    ColorType, DynamicImage, GenericImageView, codecs::jpeg::JpegEncoder,
};

use crate::error::CodecError;

/// Quality used for on-disk JPEG encoding (the equivalent of quality 1.0).
pub const DEFAULT_JPEG_QUALITY: u8 = 100;

/// A decoded, ready-to-render image. Cloning shares the pixels.
#[derive(Clone)]
pub struct ImageEntry {
    image: Arc<DynamicImage>,
}

impl ImageEntry {
    pub fn new(image: DynamicImage) -> Self {
        Self {
            image: Arc::new(image),
        }
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Resident size of the decoded pixels.
    pub fn estimated_bytes(&self) -> u64 {
        self.image.as_bytes().len() as u64
    }

    /// True when both entries share the same decoded pixels.
    pub fn ptr_eq(&self, other: &ImageEntry) -> bool {
        Arc::ptr_eq(&self.image, &other.image)
    }
}

impl From<DynamicImage> for ImageEntry {
    fn from(image: DynamicImage) -> Self {
        Self::new(image)
    }
}

impl fmt::Debug for ImageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (width, height) = self.dimensions();
        f.debug_struct("ImageEntry")
            .field("width", &width)
            .field("height", &height)
            .field("color", &self.image.color())
            .finish()
    }
}

/// Converts between encoded bytes and decoded images.
///
/// The disk tier uses `encode` for writes and `decode` for reads; fetched
/// network bodies go through `decode`.
pub trait ImageCodec: Send + Sync + fmt::Debug {
    fn decode(&self, bytes: &[u8]) -> Result<ImageEntry, CodecError>;

    fn encode(&self, entry: &ImageEntry) -> Result<Vec<u8>, CodecError>;
}

/// Decodes any format the `image` crate recognises and encodes JPEG.
#[derive(Debug, Clone, Copy)]
pub struct JpegCodec {
    quality: u8,
}

impl JpegCodec {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }
}

impl Default for JpegCodec {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl ImageCodec for JpegCodec {
    fn decode(&self, bytes: &[u8]) -> Result<ImageEntry, CodecError> {
        image::load_from_memory(bytes)
            .map(ImageEntry::new)
            .map_err(|e| CodecError::Decode(e.to_string()))
    }

    fn encode(&self, entry: &ImageEntry) -> Result<Vec<u8>, CodecError> {
        let (width, height) = entry.dimensions();
        if width == 0 || height == 0 {
            return Err(CodecError::Encode(
                "image dimensions must be non-zero".into(),
            ));
        }

        // JPEG has no alpha channel.
        let rgb = entry.image().to_rgb8();

        let mut out = Cursor::new(Vec::new());
        let mut encoder = JpegEncoder::new_with_quality(&mut out, self.quality);
        encoder
            .encode(rgb.as_raw(), width, height, ColorType::Rgb8.into())
            .map_err(|e| CodecError::Encode(e.to_string()))?;

        Ok(out.into_inner())
    }
}
