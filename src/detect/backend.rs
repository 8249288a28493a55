use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Inference backend that turns a frame into raw detections.
///
/// Backends are loaded once at startup and owned by the `PersonDetector`.
/// They report every detection they decode; class, confidence and geometry
/// filtering happen afterwards in `DetectionFilter`, so all backends share
/// the same rejection rules.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run inference on a frame.
    ///
    /// Returned boxes are in frame pixel coordinates, clamped to the frame.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
