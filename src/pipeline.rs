//! The analysis loop.
//!
//! One `Pipeline` owns every piece of mutable state: the stream source, the
//! gate, the detector, the event counters and the recording controller. Each
//! tick acquires at most one frame, folds its verdict into the counters and
//! ticks the controller exactly once, whether or not a frame was analysed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::detect::{PersonDetector, Presence};
use crate::frame::Frame;
use crate::gate::{FrameGate, GateOutcome};
use crate::ingest::{Acquisition, StreamBackend, StreamSource};
use crate::recorder::{ControllerState, RecordingController, Transition};

/// Debounce counters feeding the controller. At most one is nonzero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventCounters {
    pub motion: u32,
    pub no_motion: u32,
}

impl EventCounters {
    pub fn record_event(&mut self) {
        self.motion = self.motion.saturating_add(1);
        self.no_motion = 0;
    }

    pub fn record_quiet(&mut self) {
        self.no_motion = self.no_motion.saturating_add(1);
        self.motion = 0;
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Run inference on the Nth, 2Nth, ... consecutive motion candidate; the
    /// candidates in between reuse the persistence value.
    pub throttle_n: u32,
    /// Pause between ticks.
    pub tick_interval: Duration,
    pub health_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            throttle_n: 1,
            tick_interval: Duration::from_millis(20),
            health_interval: Duration::from_secs(5),
        }
    }
}

/// What happened to the frame slot of a tick.
#[derive(Clone, Debug, PartialEq)]
pub enum TickOutcome {
    Analysed {
        gate: GateOutcome,
        /// `None` when the gate found no motion candidate.
        presence: Option<Presence>,
        event: bool,
    },
    Skipped,
    Missed,
    RetrieveFailed,
    Reconnected,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TickReport {
    pub outcome: TickOutcome,
    pub counters: EventCounters,
    pub transition: Option<Transition>,
    pub state: ControllerState,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub ticks: u64,
    pub analysed: u64,
    pub events: u64,
    pub transitions: u64,
}

pub struct Pipeline<B: StreamBackend> {
    source: StreamSource<B>,
    gate: FrameGate,
    detector: PersonDetector,
    controller: RecordingController,
    config: PipelineConfig,
    counters: EventCounters,
    throttle_counter: u32,
    stats: PipelineStats,
}

impl<B: StreamBackend> Pipeline<B> {
    pub fn new(
        source: StreamSource<B>,
        gate: FrameGate,
        detector: PersonDetector,
        controller: RecordingController,
        config: PipelineConfig,
    ) -> Self {
        Self {
            source,
            gate,
            detector,
            controller,
            config,
            counters: EventCounters::default(),
            throttle_counter: 0,
            stats: PipelineStats::default(),
        }
    }

    pub fn source(&self) -> &StreamSource<B> {
        &self.source
    }

    pub fn gate(&self) -> &FrameGate {
        &self.gate
    }

    pub fn detector(&self) -> &PersonDetector {
        &self.detector
    }

    pub fn controller(&self) -> &RecordingController {
        &self.controller
    }

    pub fn counters(&self) -> EventCounters {
        self.counters
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Connect the stream. False only if shutdown interrupted the retries.
    pub fn open(&mut self) -> bool {
        self.source.open()
    }

    pub fn tick(&mut self) -> TickReport {
        self.tick_at(Instant::now())
    }

    /// One loop iteration, with `now` as the controller's clock.
    pub fn tick_at(&mut self, now: Instant) -> TickReport {
        self.stats.ticks += 1;
        let outcome = match self.source.acquire() {
            Acquisition::Frame(frame) => {
                self.stats.analysed += 1;
                self.analyse(&frame)
            }
            Acquisition::Reconnected => {
                self.gate.reset();
                self.detector.reset();
                self.throttle_counter = 0;
                self.counters.record_quiet();
                TickOutcome::Reconnected
            }
            Acquisition::Skipped => TickOutcome::Skipped,
            Acquisition::Missed => TickOutcome::Missed,
            Acquisition::RetrieveFailed => TickOutcome::RetrieveFailed,
        };

        let transition = self.controller.tick_at(&self.counters, now);
        if transition.is_some() {
            self.stats.transitions += 1;
        }
        TickReport {
            outcome,
            counters: self.counters,
            transition,
            state: self.controller.state(),
        }
    }

    /// Tick until `shutdown` is set, then stop any recording.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        if !self.open() {
            log::info!("shutdown requested before the stream connected");
            return;
        }

        let mut last_health = Instant::now();
        while !shutdown.load(Ordering::SeqCst) {
            self.tick();
            if last_health.elapsed() >= self.config.health_interval {
                self.log_health();
                last_health = Instant::now();
            }
            if !self.config.tick_interval.is_zero() {
                std::thread::sleep(self.config.tick_interval);
            }
        }

        log::info!("shutting down analysis loop");
        if let Some(exit) = self.controller.shutdown() {
            log::info!("final recording closed ({})", exit);
        }
        self.source.release();
        self.log_health();
    }

    fn analyse(&mut self, frame: &Frame) -> TickOutcome {
        let gate = self.gate.evaluate(frame);
        if !gate.motion {
            self.counters.record_quiet();
            self.throttle_counter = 0;
            if self.gate.refresh_baseline() {
                log::debug!("gate: baseline refreshed");
            }
            return TickOutcome::Analysed {
                gate,
                presence: None,
                event: false,
            };
        }

        self.throttle_counter = self.throttle_counter.wrapping_add(1);
        let run_inference = self.throttle_counter % self.config.throttle_n.max(1) == 0;
        let presence = self.detector.evaluate(frame, run_inference);
        let event = match presence {
            Presence::Present => true,
            Presence::Absent => false,
            Presence::Unavailable => true,
        };
        if event {
            self.stats.events += 1;
            self.counters.record_event();
        } else {
            self.counters.record_quiet();
        }
        log::debug!(
            "gate: motion px={} presence={:?} motion={} no_motion={} frame_age={:?}",
            gate.changed_pixels,
            presence,
            self.counters.motion,
            self.counters.no_motion,
            frame.age_at(Instant::now())
        );
        TickOutcome::Analysed {
            gate,
            presence: Some(presence),
            event,
        }
    }

    fn log_health(&self) {
        let stream = self.source.stats();
        let detector = self.detector.stats();
        log::info!(
            "health: grabbed={} analysed={} skipped={} reconnects={} inference={} \
             inference_failures={} events={} state={}",
            stream.grabbed,
            self.stats.analysed,
            stream.skipped,
            stream.reconnects,
            detector.inference_runs,
            detector.failures,
            self.stats.events,
            self.controller.state()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::PersonConfig;
    use crate::gate::GateConfig;
    use crate::ingest::StreamConfig;
    use crate::recorder::{
        ControllerConfig, OutputNaming, ProcessExit, RecorderLauncher, RecorderProcess,
    };
    use anyhow::{anyhow, Result};
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};

    /// Stream that plays back a fixed list of frames, `None` = grab failure.
    struct Playback(VecDeque<Option<Frame>>, Option<Frame>);

    impl StreamBackend for Playback {
        fn describe(&self) -> String {
            "playback".to_string()
        }
        fn open(&mut self) -> Result<()> {
            Ok(())
        }
        fn grab(&mut self) -> Result<()> {
            match self.0.pop_front().flatten() {
                Some(frame) => {
                    self.1 = Some(frame);
                    Ok(())
                }
                None => Err(anyhow!("end of playback")),
            }
        }
        fn retrieve(&mut self) -> Result<Frame> {
            self.1.take().ok_or_else(|| anyhow!("nothing grabbed"))
        }
        fn release(&mut self) {}
    }

    struct IdleProcess;

    impl RecorderProcess for IdleProcess {
        fn poll(&mut self) -> Result<Option<ProcessExit>> {
            Ok(None)
        }
        fn terminate(&mut self, _grace: Duration) -> Result<ProcessExit> {
            Ok(ProcessExit::code(0))
        }
    }

    struct IdleLauncher;

    impl RecorderLauncher for IdleLauncher {
        fn launch(&mut self, _output: &Path) -> Result<Box<dyn RecorderProcess>> {
            Ok(Box::new(IdleProcess))
        }
    }

    fn pipeline(frames: Vec<Option<Frame>>) -> Pipeline<Playback> {
        let source = StreamSource::new(
            Playback(frames.into(), None),
            StreamConfig {
                retry_backoff: Duration::ZERO,
                miss_delay: Duration::ZERO,
                ..StreamConfig::default()
            },
        );
        let controller = RecordingController::new(
            ControllerConfig::default(),
            Box::new(IdleLauncher),
            OutputNaming {
                dir: PathBuf::from("/nonexistent"),
                prefix: "cam1".to_string(),
                extension: "mp4".to_string(),
            },
        );
        let mut p = Pipeline::new(
            source,
            FrameGate::new(GateConfig::default()),
            PersonDetector::motion_only(PersonConfig::default()),
            controller,
            PipelineConfig::default(),
        );
        assert!(p.open());
        p
    }

    fn with_block(level: u8) -> Frame {
        let mut frame = Frame::solid(160, 90, [level, level, level]);
        let image = frame.image_mut();
        for y in 20..60 {
            for x in 40..100 {
                image.put_pixel(x, y, image::Rgb([255, 255, 255]));
            }
        }
        frame
    }

    #[test]
    fn counters_are_mutually_exclusive() {
        let mut c = EventCounters::default();
        c.record_event();
        c.record_event();
        assert_eq!(c, EventCounters { motion: 2, no_motion: 0 });
        c.record_quiet();
        assert_eq!(c, EventCounters { motion: 0, no_motion: 1 });
    }

    #[test]
    fn motion_only_gating_starts_recording() {
        let plain = || Some(Frame::solid(160, 90, [40, 40, 40]));
        let mut p = pipeline(vec![plain(), plain(), Some(with_block(40))]);

        assert_eq!(p.tick().state, ControllerState::Idle);
        assert_eq!(p.tick().counters.no_motion, 2);
        let report = p.tick();
        assert!(matches!(
            report.outcome,
            TickOutcome::Analysed {
                presence: Some(Presence::Unavailable),
                event: true,
                ..
            }
        ));
        assert_eq!(report.counters.motion, 1);
        assert_eq!(report.state, ControllerState::Recording);
    }

    #[test]
    fn controller_ticks_when_no_frame_is_analysed() {
        let mut p = pipeline(vec![None, None]);
        let first = p.tick();
        assert_eq!(first.outcome, TickOutcome::Missed);
        assert_eq!(first.counters, EventCounters::default());
        assert_eq!(p.tick().outcome, TickOutcome::Missed);
        assert_eq!(p.stats().ticks, 2);
    }
}
