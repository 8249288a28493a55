//! Decoded analysis frames.
//!
//! A `Frame` is produced by the stream source once per analysed tick, read by
//! the gates and the detector, and dropped at the end of the tick. Nothing in
//! the pipeline retains a frame across ticks; cross-frame memory lives in
//! `GateState` and the detector's persistence counter instead.

use anyhow::{anyhow, Result};
use image::{imageops, GrayImage, RgbImage};
use std::time::{Duration, Instant};

/// One decoded frame of the low-resolution analysis stream.
#[derive(Clone, Debug)]
pub struct Frame {
    image: RgbImage,
    /// Monotonic capture instant.
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self {
            image,
            captured_at: Instant::now(),
        }
    }

    /// Time since capture, as of `now`.
    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.captured_at)
    }

    /// Build a frame from a packed RGB24 buffer.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("RGB buffer does not fit {}x{}", width, height))?;
        Ok(Self::new(image))
    }

    /// Uniformly filled frame. Mostly useful for synthetic sources and tests.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        Self::new(RgbImage::from_pixel(width, height, image::Rgb(rgb)))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut RgbImage {
        &mut self.image
    }

    /// Full-resolution single-channel intensity.
    pub fn to_gray(&self) -> GrayImage {
        imageops::grayscale(&self.image)
    }

    /// Downsample to `width`x`height`, then convert to intensity.
    pub fn downsampled_gray(&self, width: u32, height: u32) -> GrayImage {
        let tiny = imageops::resize(&self.image, width, height, imageops::FilterType::Triangle);
        imageops::grayscale(&tiny)
    }
}

/// Arithmetic mean of a single-channel image. Empty images have mean 0.
pub fn mean_intensity(gray: &GrayImage) -> f64 {
    let raw = gray.as_raw();
    if raw.is_empty() {
        return 0.0;
    }
    let sum: u64 = raw.iter().map(|&p| p as u64).sum();
    sum as f64 / raw.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn age_is_measured_from_capture() {
        let frame = Frame::solid(4, 4, [0, 0, 0]);
        let later = frame.captured_at + Duration::from_millis(80);
        assert_eq!(frame.age_at(later), Duration::from_millis(80));
        assert_eq!(frame.age_at(frame.captured_at), Duration::ZERO);
        if let Some(earlier) = frame.captured_at.checked_sub(Duration::from_millis(5)) {
            assert_eq!(frame.age_at(earlier), Duration::ZERO);
        }
    }

    #[test]
    fn from_rgb_rejects_short_buffers() {
        assert!(Frame::from_rgb(vec![0u8; 10], 4, 4).is_err());
        assert!(Frame::from_rgb(vec![0u8; 48], 4, 4).is_ok());
    }

    #[test]
    fn downsampled_mean_tracks_brightness() {
        let dark = Frame::solid(64, 36, [10, 10, 10]);
        let bright = Frame::solid(64, 36, [200, 200, 200]);

        let dark_mean = mean_intensity(&dark.downsampled_gray(16, 9));
        let bright_mean = mean_intensity(&bright.downsampled_gray(16, 9));

        assert!((dark_mean - 10.0).abs() < 1.0);
        assert!((bright_mean - 200.0).abs() < 1.0);
    }

    #[test]
    fn empty_image_has_zero_mean() {
        assert_eq!(mean_intensity(&GrayImage::new(0, 0)), 0.0);
    }
}
