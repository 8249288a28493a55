//! Event-triggered recorder.
//!
//! Watches a low-resolution analysis stream and records the matching
//! high-resolution stream only while something is happening.
//!
//! # Architecture
//!
//! Each tick of the single analysis loop runs a cascade of increasingly
//! expensive filters, stopping as soon as one says "nothing here":
//!
//! 1. **Mean gate**: mean intensity of an 80x45 thumbnail vs. the last sample.
//! 2. **Pixel-difference gate**: blurred frame vs. a slowly refreshed baseline.
//! 3. **Person detector** (optional): filtered detections smoothed by a
//!    bounded persistence counter.
//!
//! The verdict feeds two debounce counters, and those drive a three-state
//! recording controller (IDLE, RECORDING, COOLDOWN) that launches and stops
//! an external recorder process.
//!
//! # Module Structure
//!
//! - `frame`: decoded analysis frames
//! - `ingest`: stream transport and the connect/skip/reconnect policy
//! - `gate`: the two cheap motion filters
//! - `detect`: inference backends, detection filtering, persistence
//! - `recorder`: recorder processes and the recording state machine
//! - `pipeline`: the loop tying the stages together
//! - `config`: file and environment configuration

pub mod config;
pub mod detect;
pub mod frame;
pub mod gate;
pub mod ingest;
pub mod pipeline;
pub mod recorder;

pub use config::RecorderConfig;
pub use detect::{BoundingBox, Detection, DetectorBackend, PersonDetector, Presence};
pub use frame::Frame;
pub use gate::{FrameGate, GateConfig, GateOutcome};
pub use ingest::{Acquisition, RtspBackend, RtspConfig, StreamBackend, StreamSource};
pub use pipeline::{EventCounters, Pipeline, PipelineConfig, TickOutcome, TickReport};
pub use recorder::{
    ControllerState, FfmpegLauncher, RecorderLauncher, RecorderProcess, RecordingController,
    RecordingSession,
};
