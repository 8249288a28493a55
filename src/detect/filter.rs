use crate::detect::result::Detection;

/// Rejection rules applied to every backend's raw detections.
///
/// The geometric limits exist to drop small or flat boxes: debris, rain,
/// shadows and distant background objects.
#[derive(Clone, Debug)]
pub struct DetectionFilter {
    pub class_id: u32,
    pub min_confidence: f32,
    /// Minimum box area in frame pixels.
    pub min_area: f32,
    /// Minimum height/width ratio.
    pub min_aspect: f32,
    /// Minimum box height in frame pixels.
    pub min_height: f32,
}

impl Default for DetectionFilter {
    fn default() -> Self {
        Self {
            class_id: 0,
            min_confidence: 0.22,
            min_area: 1000.0,
            min_aspect: 0.45,
            min_height: 45.0,
        }
    }
}

impl DetectionFilter {
    pub fn accepts(&self, detection: &Detection) -> bool {
        detection.class_id == self.class_id
            && detection.confidence >= self.min_confidence
            && detection.bbox.area() >= self.min_area
            && detection.bbox.aspect_ratio() >= self.min_aspect
            && detection.bbox.height() >= self.min_height
    }

    /// Highest-confidence detection that survives every rule.
    pub fn best<'a>(&self, detections: &'a [Detection]) -> Option<&'a Detection> {
        detections
            .iter()
            .filter(|d| self.accepts(d))
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    }
}
