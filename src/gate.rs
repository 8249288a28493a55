//! Cheap two-stage motion pre-filter.
//!
//! Stage 1 compares the mean intensity of a tiny downsampled frame against the
//! previous sample and short-circuits when the scene is static. Stage 2 runs
//! only when stage 1 saw a change: it blurs the full frame and counts pixels
//! that differ from a slowly refreshed baseline.
//!
//! The baseline is not replaced every frame. It is promoted from the most
//! recent stage-2 image only after a run of stable (non-candidate) frames, so a
//! subject that walks in slowly does not get absorbed into the background.

use image::GrayImage;

use crate::frame::{mean_intensity, Frame};

#[derive(Clone, Debug)]
pub struct GateConfig {
    /// Minimum change in downsampled mean intensity that wakes stage 2.
    pub mean_sensitivity: f64,
    /// Differing-pixel count above which a frame is a motion candidate.
    pub pixel_threshold: u32,
    /// Per-pixel absolute difference that counts as "changed".
    pub diff_threshold: u8,
    /// Gaussian sigma for the stage-2 blur. Zero disables blurring.
    pub blur_sigma: f32,
    /// Non-candidate frames required before the baseline is refreshed.
    pub stability_frames: u32,
    pub mean_width: u32,
    pub mean_height: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            mean_sensitivity: 0.3,
            pixel_threshold: 200,
            diff_threshold: 25,
            blur_sigma: 3.5,
            stability_frames: 3,
            mean_width: 80,
            mean_height: 45,
        }
    }
}

/// Which stage produced a gate decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateStage {
    /// Stage 1 saw no meaningful change; stage 2 was skipped.
    MeanStable,
    /// Stage 2 had no baseline; this frame became it.
    BaselineSeeded,
    /// Stage 2 compared against the baseline.
    PixelDiff,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GateOutcome {
    pub motion: bool,
    /// Differing pixels counted by stage 2 (0 when it did not compare).
    pub changed_pixels: u32,
    pub stage: GateStage,
    /// `None` on the first frame after start or reset.
    pub mean_delta: Option<f64>,
}

/// Cross-frame memory of the gate.
#[derive(Debug, Default)]
pub struct GateState {
    pub last_mean: Option<f64>,
    pub baseline: Option<GrayImage>,
    /// Blurred image from this tick's stage 2, candidate for the next baseline.
    pending: Option<GrayImage>,
    pub stable_frames: u32,
}

impl GateState {
    /// True when no baseline of any kind is known.
    pub fn is_unknown(&self) -> bool {
        self.last_mean.is_none() && self.baseline.is_none()
    }
}

/// Call counters, used to verify that the cheap path really is cheap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GateStats {
    pub evaluations: u64,
    pub pixel_diff_runs: u64,
    pub baseline_refreshes: u64,
}

pub struct FrameGate {
    config: GateConfig,
    state: GateState,
    stats: GateStats,
}

impl FrameGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            state: GateState::default(),
            stats: GateStats::default(),
        }
    }

    pub fn state(&self) -> &GateState {
        &self.state
    }

    pub fn stats(&self) -> GateStats {
        self.stats
    }

    /// Forget all baselines. Called after a stream reconnect.
    pub fn reset(&mut self) {
        self.state = GateState::default();
    }

    pub fn evaluate(&mut self, frame: &Frame) -> GateOutcome {
        self.stats.evaluations += 1;
        self.state.pending = None;

        let tiny = frame.downsampled_gray(self.config.mean_width, self.config.mean_height);
        let current_mean = mean_intensity(&tiny);
        let previous = self.state.last_mean.replace(current_mean);
        let mean_delta = previous.map(|last| (current_mean - last).abs());

        // First frame after start/reset always falls through to stage 2.
        if let Some(delta) = mean_delta {
            if delta < self.config.mean_sensitivity {
                return self.settle(GateOutcome {
                    motion: false,
                    changed_pixels: 0,
                    stage: GateStage::MeanStable,
                    mean_delta,
                });
            }
        }

        self.stats.pixel_diff_runs += 1;
        let blurred = self.blur(frame.to_gray());

        let needs_seed = match &self.state.baseline {
            Some(baseline) if baseline.dimensions() != blurred.dimensions() => {
                log::info!(
                    "frame gate: frame size changed to {}x{}, re-seeding baseline",
                    blurred.width(),
                    blurred.height()
                );
                true
            }
            Some(_) => false,
            None => true,
        };
        if needs_seed {
            self.state.baseline = Some(blurred);
            return self.settle(GateOutcome {
                motion: false,
                changed_pixels: 0,
                stage: GateStage::BaselineSeeded,
                mean_delta,
            });
        }

        let changed_pixels = match &self.state.baseline {
            Some(baseline) => count_changed(baseline, &blurred, self.config.diff_threshold),
            None => 0,
        };
        let motion = changed_pixels > self.config.pixel_threshold;
        self.state.pending = Some(blurred);

        if motion {
            self.state.stable_frames = 0;
            GateOutcome {
                motion,
                changed_pixels,
                stage: GateStage::PixelDiff,
                mean_delta,
            }
        } else {
            self.settle(GateOutcome {
                motion,
                changed_pixels,
                stage: GateStage::PixelDiff,
                mean_delta,
            })
        }
    }

    /// Promote this tick's stage-2 image to baseline once the stable run is
    /// long enough. Returns true when the baseline changed.
    pub fn refresh_baseline(&mut self) -> bool {
        if self.state.stable_frames < self.config.stability_frames {
            return false;
        }
        match self.state.pending.take() {
            Some(blurred) => {
                self.state.baseline = Some(blurred);
                self.stats.baseline_refreshes += 1;
                true
            }
            None => false,
        }
    }

    fn settle(&mut self, outcome: GateOutcome) -> GateOutcome {
        self.state.stable_frames = self.state.stable_frames.saturating_add(1);
        outcome
    }

    fn blur(&self, gray: GrayImage) -> GrayImage {
        if self.config.blur_sigma > 0.0 {
            imageproc::filter::gaussian_blur_f32(&gray, self.config.blur_sigma)
        } else {
            gray
        }
    }
}

fn count_changed(baseline: &GrayImage, current: &GrayImage, threshold: u8) -> u32 {
    baseline
        .as_raw()
        .iter()
        .zip(current.as_raw())
        .filter(|(a, b)| a.abs_diff(**b) > threshold)
        .count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn config() -> GateConfig {
        GateConfig {
            pixel_threshold: 50,
            blur_sigma: 0.0,
            ..GateConfig::default()
        }
    }

    fn frame_with_square(background: u8, square: Option<(u32, u32, u32, u8)>) -> Frame {
        let mut image = RgbImage::from_pixel(64, 36, Rgb([background; 3]));
        if let Some((x0, y0, size, value)) = square {
            for y in y0..(y0 + size).min(36) {
                for x in x0..(x0 + size).min(64) {
                    image.put_pixel(x, y, Rgb([value; 3]));
                }
            }
        }
        Frame::new(image)
    }

    #[test]
    fn first_frame_seeds_baseline_without_motion() {
        let mut gate = FrameGate::new(config());
        let outcome = gate.evaluate(&frame_with_square(100, None));

        assert!(!outcome.motion);
        assert_eq!(outcome.stage, GateStage::BaselineSeeded);
        assert_eq!(outcome.mean_delta, None);
        assert!(gate.state().baseline.is_some());
        assert_eq!(gate.stats().pixel_diff_runs, 1);
    }

    #[test]
    fn static_scene_short_circuits_stage_two() {
        let mut gate = FrameGate::new(config());
        gate.evaluate(&frame_with_square(100, None));
        for _ in 0..20 {
            let outcome = gate.evaluate(&frame_with_square(100, None));
            assert_eq!(outcome.stage, GateStage::MeanStable);
            assert!(!outcome.motion);
        }
        assert_eq!(gate.stats().evaluations, 21);
        assert_eq!(gate.stats().pixel_diff_runs, 1);
    }

    #[test]
    fn bright_square_is_a_motion_candidate() {
        let mut gate = FrameGate::new(config());
        gate.evaluate(&frame_with_square(100, None));

        let outcome = gate.evaluate(&frame_with_square(100, Some((10, 10, 16, 250))));
        assert_eq!(outcome.stage, GateStage::PixelDiff);
        assert!(outcome.motion);
        assert_eq!(outcome.changed_pixels, 256);
        assert_eq!(gate.state().stable_frames, 0);
    }

    #[test]
    fn small_change_below_pixel_threshold_is_not_motion() {
        let mut gate = FrameGate::new(config());
        gate.evaluate(&frame_with_square(100, None));

        let outcome = gate.evaluate(&frame_with_square(100, Some((0, 0, 6, 255))));
        assert_eq!(outcome.stage, GateStage::PixelDiff);
        assert!(!outcome.motion);
        assert_eq!(outcome.changed_pixels, 36);
    }

    #[test]
    fn baseline_refreshes_only_after_stable_run() {
        let mut gate = FrameGate::new(config());
        gate.evaluate(&frame_with_square(100, None));
        // Lighting drift wakes stage 2 but stays under diff_threshold.
        let outcome = gate.evaluate(&frame_with_square(110, None));
        assert_eq!(outcome.stage, GateStage::PixelDiff);
        assert!(!outcome.motion);
        assert!(!gate.refresh_baseline());

        gate.evaluate(&frame_with_square(112, None));
        assert!(gate.refresh_baseline());
        let level = gate.state().baseline.as_ref().map(|b| b.get_pixel(0, 0)[0]);
        assert_eq!(level, Some(112));
        assert_eq!(gate.stats().baseline_refreshes, 1);
    }

    #[test]
    fn motion_restarts_the_stable_run() {
        let mut gate = FrameGate::new(config());
        gate.evaluate(&frame_with_square(100, None));
        gate.evaluate(&frame_with_square(110, None));
        gate.evaluate(&frame_with_square(112, None));
        assert_eq!(gate.state().stable_frames, 3);

        let outcome = gate.evaluate(&frame_with_square(100, Some((10, 10, 16, 250))));
        assert!(outcome.motion);
        assert!(!gate.refresh_baseline());
    }

    #[test]
    fn refresh_requires_a_fresh_stage_two_image() {
        let mut gate = FrameGate::new(config());
        gate.evaluate(&frame_with_square(100, None));
        for _ in 0..5 {
            gate.evaluate(&frame_with_square(100, None));
        }
        assert!(gate.state().stable_frames >= 3);
        assert!(!gate.refresh_baseline());
    }

    #[test]
    fn reset_forgets_every_baseline() {
        let mut gate = FrameGate::new(config());
        gate.evaluate(&frame_with_square(100, None));
        gate.evaluate(&frame_with_square(100, None));
        assert!(!gate.state().is_unknown());

        gate.reset();
        assert!(gate.state().is_unknown());
        assert_eq!(gate.state().stable_frames, 0);
    }
}
