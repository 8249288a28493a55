#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

/// Optimised, runnable ONNX graph with a fixed `1x3xHxW` f32 input.
pub(crate) struct TractModel {
    plan: TypedRunnableModel<TypedModel>,
    width: usize,
    height: usize,
}

impl TractModel {
    /// Load an ONNX model from disk and prepare it for inference.
    pub(crate) fn load(model_path: &Path, width: u32, height: u32) -> Result<Self> {
        let plan = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            plan,
            width: width as usize,
            height: height as usize,
        })
    }

    /// Run on planar CHW input; returns the first output flattened with its shape.
    pub(crate) fn run(&self, chw: Vec<f32>) -> Result<(Vec<f32>, Vec<usize>)> {
        let input = tract_ndarray::Array4::from_shape_vec((1, 3, self.height, self.width), chw)
            .context("input tensor does not match model input")?
            .into_tensor();
        let outputs = self
            .plan
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        Ok((view.iter().copied().collect(), view.shape().to_vec()))
    }
}
