use std::io::Cursor;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, ImageFormat};

use super::config::Rotation;
use super::frame::{Compression, PixelType, RawImage};
use crate::error::ImageError;

/// Decode any image to uncompressed 8-bit pixels
pub fn decode_frame(image: &RawImage) -> Result<RawImage, ImageError> {
    let data = image.bytes()?;
    match image.compression {
        Compression::None => Ok(image.clone()),
        Compression::Jpeg => {
            let mut decoder = zune_jpeg::JpegDecoder::new(&data[..]);
            let pixels = decoder
                .decode()
                .map_err(|e| ImageError::Decode(format!("{e:?}")))?;
            let (width, height) = decoder
                .dimensions()
                .ok_or_else(|| ImageError::Decode("jpeg without dimensions".into()))?;
            let area = width * height;
            if area == 0 || pixels.len() % area != 0 {
                return Err(ImageError::Decode(format!(
                    "{} decoded bytes for {width}x{height}",
                    pixels.len()
                )));
            }
            RawImage::from_pixels(
                width as u32,
                height as u32,
                (pixels.len() / area) as u8,
                PixelType::U8,
                Bytes::from(pixels),
            )
        }
        Compression::Png => {
            let decoded = image::load_from_memory_with_format(data, ImageFormat::Png)
                .map_err(|e| ImageError::Decode(e.to_string()))?;
            let (width, height) = (decoded.width(), decoded.height());
            let channels = decoded.color().channel_count();
            if decoded.color().bytes_per_pixel() != channels {
                return Err(ImageError::Unsupported(format!(
                    "{:?} png",
                    decoded.color()
                )));
            }
            RawImage::from_pixels(
                width,
                height,
                channels,
                PixelType::U8,
                Bytes::from(decoded.into_bytes()),
            )
        }
    }
}

/// Unpack packed YUYV 4:2:2 (BT.601 studio range) into 8-bit gray, RGB or
/// RGBA. `stride` is the byte length of one source row, padding included.
pub fn yuyv_to_pixels(
    width: u32,
    height: u32,
    stride: usize,
    channels: u8,
    data: &[u8],
) -> Result<RawImage, ImageError> {
    let (w, h) = (width as usize, height as usize);
    if w % 2 != 0 || !matches!(channels, 1 | 3 | 4) {
        return Err(ImageError::Unsupported(format!(
            "yuyv {width}x{height} into {channels} channels"
        )));
    }
    let row_len = w * 2;
    let stride = stride.max(row_len);
    let expected = if h == 0 { 0 } else { stride * (h - 1) + row_len };
    if data.len() < expected {
        return Err(ImageError::LengthMismatch {
            expected,
            actual: data.len(),
        });
    }

    let mut out = Vec::with_capacity(w * h * channels as usize);
    for row in data.chunks(stride).take(h) {
        for pair in row[..row_len].chunks_exact(4) {
            let (u, v) = (pair[1], pair[3]);
            for y in [pair[0], pair[2]] {
                if channels == 1 {
                    out.push(y);
                    continue;
                }
                out.extend_from_slice(&yuv_to_rgb(y, u, v));
                if channels == 4 {
                    out.push(u8::MAX);
                }
            }
        }
    }
    RawImage::from_pixels(width, height, channels, PixelType::U8, Bytes::from(out))
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    let scale = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        scale(298 * c + 409 * e),
        scale(298 * c - 100 * d - 208 * e),
        scale(298 * c + 516 * d),
    ]
}

fn color_type(image: &RawImage) -> Result<ExtendedColorType, ImageError> {
    match (image.pixel_type, image.channels) {
        (PixelType::U8, 1) => Ok(ExtendedColorType::L8),
        (PixelType::U8, 3) => Ok(ExtendedColorType::Rgb8),
        (PixelType::U8, 4) => Ok(ExtendedColorType::Rgba8),
        (pixel_type, channels) => Err(ImageError::Unsupported(format!(
            "{channels} channels of {pixel_type:?}"
        ))),
    }
}

/// Encode to JPEG. Alpha is dropped, JPEG has no use for it.
pub fn encode_jpeg(image: &RawImage, quality: u8) -> Result<Bytes, ImageError> {
    if image.compression == Compression::Jpeg {
        return Ok(image.bytes()?.clone());
    }
    let raw = decode_frame(image)?;
    let mut color = color_type(&raw)?;
    let pixels = raw.bytes()?;
    let rgb;
    let pixels: &[u8] = if color == ExtendedColorType::Rgba8 {
        rgb = pixels
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect::<Vec<u8>>();
        color = ExtendedColorType::Rgb8;
        &rgb
    } else {
        &pixels[..]
    };

    let mut out = Vec::with_capacity(pixels.len() / 8);
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode(pixels, raw.width, raw.height, color)
        .map_err(|e| ImageError::Encode(e.to_string()))?;
    Ok(Bytes::from(out))
}

/// Encode to PNG (lossless)
pub fn encode_png(image: &RawImage) -> Result<Bytes, ImageError> {
    let raw = decode_frame(image)?;
    let color = color_type(&raw)?;
    let mut out = Cursor::new(Vec::new());
    PngEncoder::new(&mut out)
        .write_image(raw.bytes()?, raw.width, raw.height, color)
        .map_err(|e| ImageError::Encode(e.to_string()))?;
    Ok(Bytes::from(out.into_inner()))
}

/// Rotate an image. Compressed input comes back as raw pixels.
pub fn rotate(image: &RawImage, rotation: Rotation) -> Result<RawImage, ImageError> {
    if rotation == Rotation::None {
        return Ok(image.clone());
    }
    let raw = decode_frame(image)?;
    let src = raw.bytes()?;
    let (w, h) = (raw.width as usize, raw.height as usize);
    let px = raw.channels as usize * raw.pixel_type.element_size();
    let mut dst = vec![0u8; src.len()];

    let (out_w, out_h) = if rotation.swaps_axes() { (h, w) } else { (w, h) };
    for y in 0..h {
        for x in 0..w {
            let (nx, ny) = match rotation {
                Rotation::Clockwise90 => (h - 1 - y, x),
                Rotation::Rotate180 => (w - 1 - x, h - 1 - y),
                Rotation::Counterclockwise90 => (y, w - 1 - x),
                Rotation::None => (x, y),
            };
            let from = (y * w + x) * px;
            let to = (ny * out_w + nx) * px;
            dst[to..to + px].copy_from_slice(&src[from..from + px]);
        }
    }

    RawImage::from_pixels(
        out_w as u32,
        out_h as u32,
        raw.channels,
        raw.pixel_type,
        Bytes::from(dst),
    )
}
