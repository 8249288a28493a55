//! Person confirmation stage.
//!
//! Runs the configured inference backend on motion candidates, filters the raw
//! detections and debounces the result through a persistence counter. When no
//! backend could be loaded the detector reports `Presence::Unavailable` for
//! every frame and the pipeline falls back to motion-only gating.

use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::filter::DetectionFilter;
use crate::detect::persistence::Persistence;
use crate::frame::Frame;

#[derive(Clone, Debug)]
pub struct PersonConfig {
    pub filter: DetectionFilter,
    pub persistence_cap: u32,
    /// Persistence needed to call a frame "present" after inference ran.
    pub decision_threshold: u32,
    /// Persistence needed when inference was throttled this tick.
    pub throttled_threshold: u32,
}

impl Default for PersonConfig {
    fn default() -> Self {
        Self {
            filter: DetectionFilter::default(),
            persistence_cap: 5,
            decision_threshold: 1,
            throttled_threshold: 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presence {
    Present,
    Absent,
    /// No backend is loaded; the caller decides on motion alone.
    Unavailable,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DetectorStats {
    pub inference_runs: u64,
    pub throttled: u64,
    pub failures: u64,
}

pub struct PersonDetector {
    backend: Option<Box<dyn DetectorBackend>>,
    config: PersonConfig,
    persistence: Persistence,
    failing: bool,
    stats: DetectorStats,
}

impl PersonDetector {
    pub fn new(backend: Box<dyn DetectorBackend>, config: PersonConfig) -> Self {
        let persistence = Persistence::new(config.persistence_cap);
        Self {
            backend: Some(backend),
            config,
            persistence,
            failing: false,
            stats: DetectorStats::default(),
        }
    }

    /// Detector without a backend: every frame is `Unavailable`.
    pub fn motion_only(config: PersonConfig) -> Self {
        let persistence = Persistence::new(config.persistence_cap);
        Self {
            backend: None,
            config,
            persistence,
            failing: false,
            stats: DetectorStats::default(),
        }
    }

    /// Wrap the result of loading a backend at startup.
    ///
    /// A load failure is logged and degrades to motion-only gating; it never
    /// stops the caller.
    pub fn from_load(loaded: Result<Option<Box<dyn DetectorBackend>>>, config: PersonConfig) -> Self {
        match loaded {
            Ok(Some(mut backend)) => {
                if let Err(e) = backend.warm_up() {
                    log::warn!("detector {}: warm-up failed: {:#}", backend.name(), e);
                }
                log::info!("detector {} loaded", backend.name());
                Self::new(backend, config)
            }
            Ok(None) => {
                log::info!("no detector backend configured, gating on motion only");
                Self::motion_only(config)
            }
            Err(e) => {
                log::error!(
                    "failed to load detector backend, gating on motion only: {:#}",
                    e
                );
                Self::motion_only(config)
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_some()
    }

    pub fn backend_name(&self) -> Option<&'static str> {
        self.backend.as_ref().map(|b| b.name())
    }

    pub fn persistence(&self) -> u32 {
        self.persistence.value()
    }

    pub fn stats(&self) -> DetectorStats {
        self.stats
    }

    /// Forget temporal state. Called after a stream reconnect.
    pub fn reset(&mut self) {
        self.persistence.reset();
    }

    /// Decide whether a person is present in `frame`.
    ///
    /// With `run_inference == false` the backend is not invoked and the
    /// current persistence value stands in for a fresh result, at the stricter
    /// throttled threshold.
    pub fn evaluate(&mut self, frame: &Frame, run_inference: bool) -> Presence {
        let Some(backend) = self.backend.as_mut() else {
            return Presence::Unavailable;
        };

        if !run_inference {
            self.stats.throttled += 1;
            return if self.persistence.value() >= self.config.throttled_threshold {
                Presence::Present
            } else {
                Presence::Absent
            };
        }

        self.stats.inference_runs += 1;
        let hit = match backend.detect(frame) {
            Ok(detections) => {
                if self.failing {
                    log::info!("detector {}: inference recovered", backend.name());
                    self.failing = false;
                }
                match self.config.filter.best(&detections) {
                    Some(best) => {
                        log::debug!(
                            "detector {}: person conf={:.3} h={:.0} area={:.0} ({} raw)",
                            backend.name(),
                            best.confidence,
                            best.bbox.height(),
                            best.bbox.area(),
                            detections.len()
                        );
                        true
                    }
                    None => false,
                }
            }
            Err(e) => {
                self.stats.failures += 1;
                if self.failing {
                    log::debug!("detector {}: inference still failing: {:#}", backend.name(), e);
                } else {
                    log::warn!(
                        "detector {}: inference failed, treating frame as empty: {:#}",
                        backend.name(),
                        e
                    );
                    self.failing = true;
                }
                false
            }
        };

        if self.persistence.observe(hit) >= self.config.decision_threshold {
            Presence::Present
        } else {
            Presence::Absent
        }
    }
}
