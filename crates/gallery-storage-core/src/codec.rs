//! PNG encoding with text chunks, and decoding of browsed images.
//!
//! Metadata values that fit in Latin-1 are written as `tEXt`; anything else
//! goes into `iTXt`. Text chunks are written ahead of the image data so a
//! decoder sees them while reading the header.

use tracing::debug;

use crate::artifact::{ImageArtifact, PixelBuffer, PixelFormat, TextMetadata};
use crate::error::StorageError;

pub const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Encode pixels as PNG, embedding `metadata` as text chunks.
pub fn encode_png(image: &PixelBuffer, metadata: &TextMetadata) -> Result<Vec<u8>, StorageError> {
    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, image.width(), image.height());
        encoder.set_color(color_type(image.format()));
        encoder.set_depth(png::BitDepth::Eight);

        for (key, value) in metadata {
            let added = if is_latin1(value) {
                encoder.add_text_chunk(key.clone(), value.clone())
            } else {
                encoder.add_itxt_chunk(key.clone(), value.clone())
            };
            added.map_err(|e| {
                StorageError::Transfer(format!("Invalid PNG text chunk '{}': {}", key, e))
            })?;
        }

        let mut writer = encoder
            .write_header()
            .map_err(|e| StorageError::Transfer(format!("PNG header encode failed: {}", e)))?;
        writer
            .write_image_data(image.data())
            .map_err(|e| StorageError::Transfer(format!("PNG data encode failed: {}", e)))?;
        writer
            .finish()
            .map_err(|e| StorageError::Transfer(format!("PNG finalize failed: {}", e)))?;
    }

    debug!(
        "Encoded {}x{} PNG ({} bytes, {} text chunks)",
        image.width(),
        image.height(),
        out.len(),
        metadata.len()
    );
    Ok(out)
}

/// Decode a downloaded image. PNG text chunks become metadata; other formats
/// decode to RGBA with an empty metadata map.
pub fn decode_image(bytes: &[u8]) -> Result<ImageArtifact, StorageError> {
    if bytes.starts_with(&PNG_SIGNATURE) {
        decode_png(bytes)
    } else {
        decode_other(bytes)
    }
}

fn decode_png(bytes: &[u8]) -> Result<ImageArtifact, StorageError> {
    let mut decoder = png::Decoder::new(bytes);
    decoder.set_transformations(png::Transformations::EXPAND | png::Transformations::STRIP_16);

    let mut reader = decoder
        .read_info()
        .map_err(|e| StorageError::Transfer(format!("PNG header decode failed: {}", e)))?;

    let mut data = vec![0; reader.output_buffer_size()];
    let frame = reader
        .next_frame(&mut data)
        .map_err(|e| StorageError::Transfer(format!("PNG data decode failed: {}", e)))?;
    data.truncate(frame.buffer_size());

    let format = match frame.color_type {
        png::ColorType::Grayscale => PixelFormat::Gray,
        png::ColorType::GrayscaleAlpha => PixelFormat::GrayAlpha,
        png::ColorType::Rgb => PixelFormat::Rgb,
        png::ColorType::Rgba => PixelFormat::Rgba,
        other => {
            return Err(StorageError::Transfer(format!(
                "Unsupported PNG output color type {:?}",
                other
            )))
        }
    };

    let info = reader.info();
    let mut metadata = TextMetadata::new();
    for chunk in &info.uncompressed_latin1_text {
        metadata.insert(chunk.keyword.clone(), chunk.text.clone());
    }
    for chunk in &info.compressed_latin1_text {
        if let Ok(text) = chunk.get_text() {
            metadata.insert(chunk.keyword.clone(), text);
        }
    }
    for chunk in &info.utf8_text {
        if let Ok(text) = chunk.get_text() {
            metadata.insert(chunk.keyword.clone(), text);
        }
    }

    let pixels = PixelBuffer::new(frame.width, frame.height, format, data)?;
    Ok(ImageArtifact { pixels, metadata })
}

fn decode_other(bytes: &[u8]) -> Result<ImageArtifact, StorageError> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| StorageError::Transfer(format!("Image decode failed: {}", e)))?
        .to_rgba8();
    let (width, height) = image.dimensions();
    let pixels = PixelBuffer::new(width, height, PixelFormat::Rgba, image.into_raw())?;
    Ok(ImageArtifact {
        pixels,
        metadata: TextMetadata::new(),
    })
}

fn color_type(format: PixelFormat) -> png::ColorType {
    match format {
        PixelFormat::Gray => png::ColorType::Grayscale,
        PixelFormat::GrayAlpha => png::ColorType::GrayscaleAlpha,
        PixelFormat::Rgb => png::ColorType::Rgb,
        PixelFormat::Rgba => png::ColorType::Rgba,
    }
}

fn is_latin1(text: &str) -> bool {
    text.chars().all(|c| (c as u32) < 0x100)
}
