use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::capture::config::CameraId;
use crate::error::ImageError;

/// Pixel element type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelType {
    U8,
    U16,
}

impl PixelType {
    pub fn element_size(self) -> usize {
        match self {
            PixelType::U8 => 1,
            PixelType::U16 => 2,
        }
    }
}

/// How the image bytes are encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    None,
    Jpeg,
    Png,
}

/// Reference to an image stored in the shared image buffer.
///
/// Only the index crosses process boundaries; `len` and `checksum` are what
/// the writer recorded at `put_image` time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRef {
    pub index: u32,
    pub len: u64,
    pub checksum: u64,
}

/// Image bytes, either held inline or parked in a shared-buffer slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageData {
    Inline(Bytes),
    Shared(SlotRef),
}

/// Raw image with enough metadata to rebuild the pixel array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub pixel_type: PixelType,
    pub compression: Compression,
    pub data: ImageData,
}

impl RawImage {
    /// Uncompressed pixels. Length must be `width * height * channels * element_size`.
    pub fn from_pixels(
        width: u32,
        height: u32,
        channels: u8,
        pixel_type: PixelType,
        pixels: Bytes,
    ) -> Result<Self, ImageError> {
        let image = Self {
            width,
            height,
            channels,
            pixel_type,
            compression: Compression::None,
            data: ImageData::Inline(pixels),
        };
        let expected = image.uncompressed_len();
        if image.byte_len() != expected {
            return Err(ImageError::LengthMismatch {
                expected,
                actual: image.byte_len(),
            });
        }
        Ok(image)
    }

    /// Compressed stream; the byte length is whatever the stream is
    pub fn from_compressed(
        width: u32,
        height: u32,
        channels: u8,
        compression: Compression,
        stream: Bytes,
    ) -> Self {
        Self {
            width,
            height,
            channels,
            pixel_type: PixelType::U8,
            compression,
            data: ImageData::Inline(stream),
        }
    }

    pub fn uncompressed_len(&self) -> usize {
        self.width as usize
            * self.height as usize
            * self.channels as usize
            * self.pixel_type.element_size()
    }

    pub fn byte_len(&self) -> usize {
        match &self.data {
            ImageData::Inline(bytes) => bytes.len(),
            ImageData::Shared(slot) => slot.len as usize,
        }
    }

    pub fn bytes(&self) -> Result<&Bytes, ImageError> {
        match &self.data {
            ImageData::Inline(bytes) => Ok(bytes),
            ImageData::Shared(slot) => Err(ImageError::NotHydrated(slot.index)),
        }
    }

    pub fn slot(&self) -> Option<SlotRef> {
        match self.data {
            ImageData::Shared(slot) => Some(slot),
            ImageData::Inline(_) => None,
        }
    }

    pub fn is_hydrated(&self) -> bool {
        matches!(self.data, ImageData::Inline(_))
    }
}

/// Sum of byte values, used to detect corruption after a cross-process read
pub fn pixel_checksum(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(0u64, |sum, &b| sum.wrapping_add(u64::from(b)))
}

/// One successful device read.
///
/// Created exactly once by a capture worker and never mutated afterwards,
/// except that the receiving side swaps a slot reference for the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramePayload {
    pub success: bool,
    pub image: RawImage,
    /// Monotonic capture timestamp
    pub timestamp_ns: u64,
    /// Per-camera, strictly increasing, starts at 0
    pub sequence: u64,
    pub camera_id: CameraId,
    /// Time spent inside the device read
    pub acquisition_ns: Option<u64>,
}

impl FramePayload {
    pub fn resolution(&self) -> (u32, u32) {
        (self.image.width, self.image.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncompressed_length_is_checked() {
        let ok = RawImage::from_pixels(4, 2, 3, PixelType::U8, Bytes::from(vec![0u8; 24]));
        assert!(ok.is_ok());

        let wide = RawImage::from_pixels(4, 2, 1, PixelType::U16, Bytes::from(vec![0u8; 16]));
        assert!(wide.is_ok());

        let bad = RawImage::from_pixels(4, 2, 3, PixelType::U8, Bytes::from(vec![0u8; 23]));
        assert!(matches!(
            bad,
            Err(ImageError::LengthMismatch {
                expected: 24,
                actual: 23
            })
        ));
    }

    #[test]
    fn shared_images_are_not_readable_until_hydrated() {
        let image = RawImage {
            width: 2,
            height: 2,
            channels: 1,
            pixel_type: PixelType::U8,
            compression: Compression::None,
            data: ImageData::Shared(SlotRef {
                index: 3,
                len: 4,
                checksum: 10,
            }),
        };
        assert_eq!(image.byte_len(), 4);
        assert!(!image.is_hydrated());
        assert!(matches!(image.bytes(), Err(ImageError::NotHydrated(3))));
    }

    #[test]
    fn checksum_is_sum_of_bytes() {
        assert_eq!(pixel_checksum(&[1, 2, 3, 250]), 256);
        assert_eq!(pixel_checksum(&[]), 0);
    }
}
