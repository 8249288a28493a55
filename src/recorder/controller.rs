//! Recording lifecycle state machine.
//!
//! ```text
//!            motion >= start                no_motion >= stop
//!   IDLE ---------------------> RECORDING ---------------------> COOLDOWN
//!    ^  ^                        |    ^                            |  |
//!    |  +-- recorder exited -----+    +------ motion >= start -----+  |
//!    |                                                                |
//!    +------- recorder exited, or min duration elapsed (stop) --------+
//! ```
//!
//! Under the lockout policy there is no COOLDOWN: the recorder ends its own
//! clip, and a recorder still running `LOCKOUT_GRACE` past the clip length
//! is stopped.
//!
//! The session lives inside the phase, so a recording handle exists exactly
//! when the controller is not idle, and only the idle phase can launch.

use chrono::Local;
use std::fmt;
use std::time::{Duration, Instant};

use super::{OutputNaming, ProcessExit, RecorderLauncher, RecordingSession};
use crate::pipeline::EventCounters;

/// Extra time a fixed-length recorder gets to finish its clip.
pub const LOCKOUT_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    pub start_threshold: u32,
    /// `None` never leaves RECORDING on quiet alone (lockout policy). The
    /// recorder then writes clips of `min_duration` and is expected to exit.
    pub stop_threshold: Option<u32>,
    pub min_duration: Duration,
    /// Bound on the graceful stop before the recorder is killed.
    pub stop_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            start_threshold: 1,
            stop_threshold: Some(10),
            min_duration: Duration::from_secs(15),
            stop_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ControllerState {
    Idle,
    Recording,
    Cooldown,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ControllerState::Idle => "IDLE",
            ControllerState::Recording => "RECORDING",
            ControllerState::Cooldown => "COOLDOWN",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransitionReason {
    MotionStarted,
    MotionStopped,
    MotionResumed,
    MinDurationElapsed,
    ClipOverran,
    RecorderFinished(ProcessExit),
    RecorderCrashed(ProcessExit),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: ControllerState,
    pub to: ControllerState,
    pub reason: TransitionReason,
}

enum Phase {
    Idle,
    Recording(RecordingSession),
    Cooldown(RecordingSession),
}

pub struct RecordingController {
    config: ControllerConfig,
    launcher: Box<dyn RecorderLauncher>,
    naming: OutputNaming,
    phase: Phase,
    launch_failures: u64,
}

impl RecordingController {
    pub fn new(
        config: ControllerConfig,
        launcher: Box<dyn RecorderLauncher>,
        naming: OutputNaming,
    ) -> Self {
        Self {
            config,
            launcher,
            naming,
            phase: Phase::Idle,
            launch_failures: 0,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn state(&self) -> ControllerState {
        match self.phase {
            Phase::Idle => ControllerState::Idle,
            Phase::Recording(_) => ControllerState::Recording,
            Phase::Cooldown(_) => ControllerState::Cooldown,
        }
    }

    pub fn session(&self) -> Option<&RecordingSession> {
        match &self.phase {
            Phase::Idle => None,
            Phase::Recording(session) | Phase::Cooldown(session) => Some(session),
        }
    }

    pub fn launch_failures(&self) -> u64 {
        self.launch_failures
    }

    pub fn tick(&mut self, counters: &EventCounters) -> Option<Transition> {
        self.tick_at(counters, Instant::now())
    }

    /// Evaluate the transition table once, with `now` as the current time.
    pub fn tick_at(&mut self, counters: &EventCounters, now: Instant) -> Option<Transition> {
        let from = self.state();
        let (next, reason) = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => self.from_idle(counters, now),
            Phase::Recording(session) => self.from_recording(session, counters, now),
            Phase::Cooldown(session) => self.from_cooldown(session, counters, now),
        };
        self.phase = next;

        let reason = reason?;
        let transition = Transition {
            from,
            to: self.state(),
            reason,
        };
        log::info!(
            "recording: {} -> {} ({:?}) motion={} no_motion={}",
            transition.from,
            transition.to,
            transition.reason,
            counters.motion,
            counters.no_motion
        );
        Some(transition)
    }

    /// Stop any active recording. Used on shutdown.
    pub fn shutdown(&mut self) -> Option<ProcessExit> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => None,
            Phase::Recording(session) | Phase::Cooldown(session) => {
                log::info!(
                    "recording: stopping {} for shutdown",
                    session.output_path().display()
                );
                self.stop(session, Instant::now())
            }
        }
    }

    fn from_idle(
        &mut self,
        counters: &EventCounters,
        now: Instant,
    ) -> (Phase, Option<TransitionReason>) {
        if counters.motion < self.config.start_threshold {
            return (Phase::Idle, None);
        }

        let output = self.naming.next_path(Local::now());
        log::info!(
            "recording: motion={} reached start threshold {}, launching recorder -> {}",
            counters.motion,
            self.config.start_threshold,
            output.display()
        );
        match self.launcher.launch(&output) {
            Ok(process) => (
                Phase::Recording(RecordingSession::new(process, now, output)),
                Some(TransitionReason::MotionStarted),
            ),
            Err(e) => {
                self.launch_failures += 1;
                log::warn!(
                    "recording: launch failed, staying IDLE (failures={}): {:#}",
                    self.launch_failures,
                    e
                );
                (Phase::Idle, None)
            }
        }
    }

    fn from_recording(
        &mut self,
        mut session: RecordingSession,
        counters: &EventCounters,
        now: Instant,
    ) -> (Phase, Option<TransitionReason>) {
        if let Some(reason) = self.check_exited(&mut session) {
            return (Phase::Idle, Some(reason));
        }
        match self.config.stop_threshold {
            Some(stop) if counters.no_motion >= stop => {
                (Phase::Cooldown(session), Some(TransitionReason::MotionStopped))
            }
            Some(_) => (Phase::Recording(session), None),
            None if session.elapsed_at(now) >= self.config.min_duration + LOCKOUT_GRACE => {
                log::warn!(
                    "recording: recorder for {} still running {:.1}s after its clip length, stopping it",
                    session.output_path().display(),
                    LOCKOUT_GRACE.as_secs_f64()
                );
                self.stop(session, now);
                (Phase::Idle, Some(TransitionReason::ClipOverran))
            }
            None => (Phase::Recording(session), None),
        }
    }

    fn from_cooldown(
        &mut self,
        mut session: RecordingSession,
        counters: &EventCounters,
        now: Instant,
    ) -> (Phase, Option<TransitionReason>) {
        if let Some(reason) = self.check_exited(&mut session) {
            return (Phase::Idle, Some(reason));
        }
        if counters.motion >= self.config.start_threshold {
            return (Phase::Recording(session), Some(TransitionReason::MotionResumed));
        }
        if session.elapsed_at(now) >= self.config.min_duration {
            self.stop(session, now);
            return (Phase::Idle, Some(TransitionReason::MinDurationElapsed));
        }
        (Phase::Cooldown(session), None)
    }

    /// Release the session if its recorder is gone.
    ///
    /// Only a fixed-length clip is expected to end on its own. Any other
    /// exit, status 0 included, is a crash.
    fn check_exited(&self, session: &mut RecordingSession) -> Option<TransitionReason> {
        let exit = match session.process_mut().poll() {
            Ok(Some(exit)) => exit,
            Ok(None) => return None,
            Err(e) => {
                log::warn!(
                    "recording: lost track of recorder for {}: {:#}",
                    session.output_path().display(),
                    e
                );
                ProcessExit::unknown()
            }
        };
        let clip_mode = self.config.stop_threshold.is_none();
        if clip_mode && exit.success() {
            log::info!(
                "recording: recorder finished {} ({})",
                session.output_path().display(),
                exit
            );
            Some(TransitionReason::RecorderFinished(exit))
        } else {
            log::warn!(
                "recording: recorder crashed while writing {} ({})",
                session.output_path().display(),
                exit
            );
            Some(TransitionReason::RecorderCrashed(exit))
        }
    }

    fn stop(&mut self, mut session: RecordingSession, now: Instant) -> Option<ProcessExit> {
        let elapsed = session.elapsed_at(now);
        match session.process_mut().terminate(self.config.stop_timeout) {
            Ok(exit) => {
                log::info!(
                    "recording: stopped {} after {:.1}s ({})",
                    session.output_path().display(),
                    elapsed.as_secs_f64(),
                    exit
                );
                Some(exit)
            }
            Err(e) => {
                log::warn!(
                    "recording: failed to stop recorder for {}: {:#}",
                    session.output_path().display(),
                    e
                );
                None
            }
        }
    }
}
