//! Input preparation shared by the inference backends.

use image::{imageops, Rgb, RgbImage};

use crate::detect::result::BoundingBox;

/// Grey used for letterbox padding.
pub const LETTERBOX_FILL: u8 = 114;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// Aspect-preserving fit of a frame into a square model input.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Letterbox {
    pub size: u32,
    pub scale: f32,
    pub scaled_width: u32,
    pub scaled_height: u32,
    pub pad_x: u32,
    pub pad_y: u32,
}

impl Letterbox {
    pub fn fit(width: u32, height: u32, size: u32) -> Self {
        let scale = (size as f32 / width.max(1) as f32).min(size as f32 / height.max(1) as f32);
        let scaled_width = ((width as f32 * scale) as u32).clamp(1, size);
        let scaled_height = ((height as f32 * scale) as u32).clamp(1, size);
        Self {
            size,
            scale,
            scaled_width,
            scaled_height,
            pad_x: (size - scaled_width) / 2,
            pad_y: (size - scaled_height) / 2,
        }
    }

    /// Resize `image` and centre it on a padded square canvas.
    pub fn apply(&self, image: &RgbImage) -> RgbImage {
        let resized = if image.dimensions() == (self.scaled_width, self.scaled_height) {
            image.clone()
        } else {
            imageops::resize(
                image,
                self.scaled_width,
                self.scaled_height,
                imageops::FilterType::Triangle,
            )
        };
        let mut canvas = RgbImage::from_pixel(self.size, self.size, Rgb([LETTERBOX_FILL; 3]));
        imageops::replace(&mut canvas, &resized, self.pad_x as i64, self.pad_y as i64);
        canvas
    }

    /// Map a box from model input space back to frame space.
    pub fn unmap(&self, bbox: BoundingBox) -> BoundingBox {
        let px = self.pad_x as f32;
        let py = self.pad_y as f32;
        BoundingBox {
            x1: (bbox.x1 - px) / self.scale,
            y1: (bbox.y1 - py) / self.scale,
            x2: (bbox.x2 - px) / self.scale,
            y2: (bbox.y2 - py) / self.scale,
        }
    }
}

/// Pack an image into planar CHW floats as `(pixel - mean) * scale`.
pub fn to_chw(image: &RgbImage, order: ChannelOrder, mean: f32, scale: f32) -> Vec<f32> {
    let (width, height) = image.dimensions();
    let plane = (width as usize) * (height as usize);
    let mut out = vec![0f32; plane * 3];
    for (x, y, pixel) in image.enumerate_pixels() {
        let idx = (y as usize) * (width as usize) + x as usize;
        for channel in 0..3 {
            let source = match order {
                ChannelOrder::Rgb => channel,
                ChannelOrder::Bgr => 2 - channel,
            };
            out[channel * plane + idx] = (pixel[source] as f32 - mean) * scale;
        }
    }
    out
}
