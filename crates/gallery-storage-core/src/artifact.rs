use indexmap::IndexMap;

use crate::error::StorageError;

/// Text metadata embedded in a stored image, in insertion order.
pub type TextMetadata = IndexMap<String, String>;

/// Metadata key holding the generation recipe.
pub const PARAMETERS_KEY: &str = "parameters";

/// Channel layout of an 8-bit pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Gray,
    GrayAlpha,
    Rgb,
    Rgba,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            Self::Gray => 1,
            Self::GrayAlpha => 2,
            Self::Rgb => 3,
            Self::Rgba => 4,
        }
    }
}

/// Raw 8-bit pixels, row-major, no padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
}

impl PixelBuffer {
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> Result<Self, StorageError> {
        let expected = width as usize * height as usize * format.channels();
        if width == 0 || height == 0 {
            return Err(StorageError::Transfer(format!(
                "Image dimensions must be non-zero, got {}x{}",
                width, height
            )));
        }
        if data.len() != expected {
            return Err(StorageError::Transfer(format!(
                "Pixel buffer of {} bytes does not match {}x{} {:?} ({} bytes)",
                data.len(),
                width,
                height,
                format,
                expected
            )));
        }
        Ok(Self {
            width,
            height,
            format,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// A decoded image together with its embedded text metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageArtifact {
    pub pixels: PixelBuffer,
    pub metadata: TextMetadata,
}

impl ImageArtifact {
    /// The generation recipe, if the image carries one.
    pub fn parameters(&self) -> Option<&str> {
        self.metadata.get(PARAMETERS_KEY).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_buffer_validates_length() {
        assert!(PixelBuffer::new(2, 2, PixelFormat::Rgb, vec![0; 12]).is_ok());
        assert!(PixelBuffer::new(2, 2, PixelFormat::Rgba, vec![0; 12]).is_err());
        assert!(PixelBuffer::new(0, 2, PixelFormat::Gray, vec![]).is_err());
    }

    #[test]
    fn test_parameters_lookup() {
        let mut metadata = TextMetadata::new();
        metadata.insert("parameters".to_string(), "a cat, steps: 20".to_string());
        let artifact = ImageArtifact {
            pixels: PixelBuffer::new(1, 1, PixelFormat::Gray, vec![7]).unwrap(),
            metadata,
        };
        assert_eq!(artifact.parameters(), Some("a cat, steps: 20"));
    }
}
