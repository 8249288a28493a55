#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::Result;

use super::tract::TractModel;
use crate::detect::backend::DetectorBackend;
use crate::detect::decode::decode_yolo;
use crate::detect::preprocess::{to_chw, ChannelOrder, Letterbox};
use crate::detect::result::Detection;
use crate::frame::Frame;

/// YOLOv8-family ONNX detector.
///
/// Frames are letterboxed onto a square `input_size` canvas, scaled to
/// `0..1` RGB, and the decoded boxes are mapped back through the letterbox.
pub struct YoloBackend {
    model: TractModel,
    input_size: u32,
    min_confidence: f32,
}

impl YoloBackend {
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model = TractModel::load(model_path.as_ref(), input_size, input_size)?;
        Ok(Self {
            model,
            input_size,
            min_confidence: 0.05,
        })
    }

    /// Drop candidates below this score before they reach the filter.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.min_confidence = threshold;
        self
    }
}

impl DetectorBackend for YoloBackend {
    fn name(&self) -> &'static str {
        "yolo"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let letterbox = Letterbox::fit(frame.width(), frame.height(), self.input_size);
        let canvas = letterbox.apply(frame.image());
        let input = to_chw(&canvas, ChannelOrder::Rgb, 0.0, 1.0 / 255.0);
        let (output, shape) = self.model.run(input)?;
        decode_yolo(
            &output,
            &shape,
            &letterbox,
            frame.width(),
            frame.height(),
            self.min_confidence,
        )
    }
}
