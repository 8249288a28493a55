#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::Result;
use image::imageops;

use super::tract::TractModel;
use crate::detect::backend::DetectorBackend;
use crate::detect::decode::decode_ssd;
use crate::detect::preprocess::{to_chw, ChannelOrder};
use crate::detect::result::Detection;
use crate::frame::Frame;

const SSD_MEAN: f32 = 127.5;
const SSD_SCALE: f32 = 0.007843;

/// MobileNet-SSD-family ONNX detector.
///
/// The frame is stretched (not letterboxed) to the square input, fed as BGR
/// normalised around 127.5, and the normalised output corners are scaled
/// straight back to frame pixels.
pub struct SsdBackend {
    model: TractModel,
    input_size: u32,
    min_confidence: f32,
}

impl SsdBackend {
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model = TractModel::load(model_path.as_ref(), input_size, input_size)?;
        Ok(Self {
            model,
            input_size,
            min_confidence: 0.05,
        })
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.min_confidence = threshold;
        self
    }
}

impl DetectorBackend for SsdBackend {
    fn name(&self) -> &'static str {
        "ssd"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let resized = imageops::resize(
            frame.image(),
            self.input_size,
            self.input_size,
            imageops::FilterType::Triangle,
        );
        let input = to_chw(&resized, ChannelOrder::Bgr, SSD_MEAN, SSD_SCALE);
        let (output, shape) = self.model.run(input)?;
        decode_ssd(
            &output,
            &shape,
            frame.width(),
            frame.height(),
            self.min_confidence,
        )
    }
}
