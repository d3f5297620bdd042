use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};

/// A decoded video frame with its zero-based position in the source.
///
/// Frames handed out by a source are owned by the caller. Anything that
/// needs to keep a frame past the current loop iteration clones it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: u64,
    pub image: RgbImage,
}

impl Frame {
    pub fn new(index: u64, image: RgbImage) -> Self {
        Self { index, image }
    }

    /// Build a frame from packed `rgb24` bytes, as produced by a raw video pipe.
    pub fn from_rgb24(index: u64, width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * 3;
        let got = data.len();
        let image = RgbImage::from_raw(width, height, data)
            .ok_or(FrameError::BufferSize { got, expected })?;
        Ok(Self { index, image })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Single-channel intensity image resized to exactly `width` x `height`.
    pub fn to_gray_resized(&self, width: u32, height: u32) -> GrayImage {
        let gray = imageops::grayscale(&self.image);
        if gray.dimensions() == (width, height) {
            return gray;
        }
        imageops::resize(&gray, width, height, FilterType::Triangle)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame buffer has {got} bytes, expected {expected}")]
    BufferSize { got: usize, expected: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn from_rgb24_checks_length() {
        let frame = Frame::from_rgb24(3, 4, 2, vec![0; 4 * 2 * 3]).unwrap();
        assert_eq!(frame.index, 3);
        assert_eq!((frame.width(), frame.height()), (4, 2));

        let err = Frame::from_rgb24(0, 4, 2, vec![0; 10]).unwrap_err();
        assert!(matches!(err, FrameError::BufferSize { got: 10, expected: 24 }));
    }

    #[test]
    fn gray_resize_has_requested_dimensions() {
        let frame = Frame::new(0, RgbImage::from_pixel(64, 48, Rgb([200, 10, 10])));
        let gray = frame.to_gray_resized(32, 16);
        assert_eq!(gray.dimensions(), (32, 16));
    }

    #[test]
    fn gray_of_white_is_white() {
        let frame = Frame::new(0, RgbImage::from_pixel(8, 8, Rgb([255, 255, 255])));
        let gray = frame.to_gray_resized(8, 8);
        assert!(gray.pixels().all(|p| p.0[0] == 255));
    }
}
