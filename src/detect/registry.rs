use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::Deserialize;

use super::backend::DetectorBackend;

/// Inference backends selectable from configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// No confirmation stage: motion candidates are events.
    #[default]
    None,
    /// Alias of `None`: the detector degrades to pure motion gating.
    Noop,
    Yolo,
    Ssd,
}

impl BackendKind {
    /// Square model input edge used when configuration does not set one.
    pub fn default_input_size(self) -> u32 {
        match self {
            BackendKind::Ssd => 300,
            _ => 640,
        }
    }

    /// Target class id in the model's label map.
    pub fn default_class_id(self) -> u32 {
        match self {
            BackendKind::Ssd => 15,
            _ => 0,
        }
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(BackendKind::None),
            "noop" => Ok(BackendKind::Noop),
            "yolo" => Ok(BackendKind::Yolo),
            "ssd" => Ok(BackendKind::Ssd),
            other => Err(anyhow!(
                "unknown detector backend '{}' (expected none, noop, yolo or ssd)",
                other
            )),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BackendSpec {
    pub kind: BackendKind,
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
    /// Scores below this are dropped while decoding.
    pub decode_threshold: f32,
}

/// Load the configured backend.
///
/// `Ok(None)` means no confirmation stage was requested. Errors are meant to
/// be handed to `PersonDetector::from_load`, which degrades instead of failing.
pub fn load_backend(spec: &BackendSpec) -> Result<Option<Box<dyn DetectorBackend>>> {
    match spec.kind {
        BackendKind::None | BackendKind::Noop => Ok(None),
        BackendKind::Yolo | BackendKind::Ssd => load_model_backend(spec),
    }
}

#[cfg(feature = "backend-tract")]
fn load_model_backend(spec: &BackendSpec) -> Result<Option<Box<dyn DetectorBackend>>> {
    use super::backends::{SsdBackend, YoloBackend};

    let path = spec
        .model_path
        .as_ref()
        .ok_or_else(|| anyhow!("detector backend {:?} needs a model_path", spec.kind))?;
    let backend: Box<dyn DetectorBackend> = match spec.kind {
        BackendKind::Yolo => Box::new(
            YoloBackend::new(path, spec.input_size)?.with_threshold(spec.decode_threshold),
        ),
        _ => Box::new(
            SsdBackend::new(path, spec.input_size)?.with_threshold(spec.decode_threshold),
        ),
    };
    Ok(Some(backend))
}

#[cfg(not(feature = "backend-tract"))]
fn load_model_backend(spec: &BackendSpec) -> Result<Option<Box<dyn DetectorBackend>>> {
    Err(anyhow!(
        "detector backend {:?} requires the backend-tract feature",
        spec.kind
    ))
}
