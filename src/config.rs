use anyhow::{anyhow, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::{BackendKind, BackendSpec, DetectionFilter, PersonConfig};
use crate::gate::GateConfig;
use crate::ingest::{RtspConfig, StreamConfig};
use crate::pipeline::PipelineConfig;
use crate::recorder::{ControllerConfig, FfmpegConfig, OutputNaming};

const DEFAULT_STREAM_URL: &str = "stub://front_camera";
const DEFAULT_ARCHIVE_URL: &str = "stub://front_camera_hd";
const DEFAULT_OUTPUT_DIR: &str = "recordings";
const DEFAULT_PREFIX: &str = "cam1";
const DEFAULT_EXTENSION: &str = "mp4";
const DEFAULT_FFMPEG: &str = "ffmpeg";
const DEFAULT_AUDIO_BITRATE: &str = "32k";
const DEFAULT_TICK_INTERVAL_MS: u64 = 20;
const PREFIX_PATTERN: &str = r"^[A-Za-z0-9_-]{1,64}$";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RecorderConfigFile {
    tick_interval_ms: Option<u64>,
    stream: Option<StreamConfigFile>,
    gate: Option<GateConfigFile>,
    detector: Option<DetectorConfigFile>,
    recording: Option<RecordingConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StreamConfigFile {
    url: Option<String>,
    frame_skip: Option<u32>,
    reconnect_after: Option<u32>,
    retry_backoff_ms: Option<u64>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct GateConfigFile {
    mean_sensitivity: Option<f64>,
    pixel_threshold: Option<u32>,
    diff_threshold: Option<u8>,
    blur_sigma: Option<f32>,
    stability_frames: Option<u32>,
    mean_width: Option<u32>,
    mean_height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectorConfigFile {
    backend: Option<BackendKind>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    class_id: Option<u32>,
    confidence: Option<f32>,
    min_area: Option<f32>,
    min_aspect: Option<f32>,
    min_height: Option<f32>,
    throttle_n: Option<u32>,
    persistence_cap: Option<u32>,
    decision_threshold: Option<u32>,
    throttled_threshold: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RecordingConfigFile {
    archive_url: Option<String>,
    output_dir: Option<PathBuf>,
    prefix: Option<String>,
    extension: Option<String>,
    ffmpeg: Option<PathBuf>,
    audio_bitrate: Option<String>,
    connect_timeout_us: Option<u64>,
    start_threshold: Option<u32>,
    stop_threshold: Option<u32>,
    min_duration_secs: Option<u64>,
    stop_timeout_ms: Option<u64>,
    startup_probe_ms: Option<u64>,
    policy: Option<RecordingPolicy>,
    lockout_secs: Option<u64>,
}

/// How a recording session ends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingPolicy {
    /// RECORDING -> COOLDOWN on quiet, stop once the minimum duration passed.
    #[default]
    Cooldown,
    /// Fixed-length clips; the recorder ends the session itself.
    Lockout,
}

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub tick_interval: Duration,
    pub stream: StreamSettings,
    pub gate: GateConfig,
    pub detector: DetectorSettings,
    pub recording: RecordingSettings,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub url: String,
    pub frame_skip: u32,
    pub reconnect_after: u32,
    pub retry_backoff: Duration,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: BackendKind,
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
    pub class_id: u32,
    pub confidence: f32,
    pub min_area: f32,
    pub min_aspect: f32,
    pub min_height: f32,
    pub throttle_n: u32,
    pub persistence_cap: u32,
    pub decision_threshold: u32,
    pub throttled_threshold: u32,
}

#[derive(Debug, Clone)]
pub struct RecordingSettings {
    pub archive_url: String,
    pub output_dir: PathBuf,
    pub prefix: String,
    pub extension: String,
    pub ffmpeg: PathBuf,
    pub audio_bitrate: String,
    pub connect_timeout_us: u64,
    pub start_threshold: u32,
    pub stop_threshold: u32,
    pub min_duration: Duration,
    pub stop_timeout: Duration,
    pub startup_probe: Duration,
    pub policy: RecordingPolicy,
    pub lockout: Duration,
}

impl RecorderConfig {
    /// Load from the file named by `RECORDER_CONFIG` (if any), then apply env
    /// overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("RECORDER_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => RecorderConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Replace the analysis stream URL (command-line override) and validate
    /// the result again.
    pub fn with_stream_url(mut self, url: impl Into<String>) -> Result<Self> {
        self.stream.url = url.into();
        self.validate()?;
        Ok(self)
    }

    fn from_file(file: RecorderConfigFile) -> Self {
        let stream = file.stream.unwrap_or_default();
        let gate = file.gate.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        let recording = file.recording.unwrap_or_default();
        let gate_defaults = GateConfig::default();
        let filter_defaults = DetectionFilter::default();
        let person_defaults = PersonConfig::default();
        let controller_defaults = ControllerConfig::default();
        let ffmpeg_defaults = FfmpegConfig::default();
        let stream_defaults = StreamConfig::default();
        let rtsp_defaults = RtspConfig::default();
        let backend = detector.backend.unwrap_or_default();

        Self {
            tick_interval: Duration::from_millis(
                file.tick_interval_ms.unwrap_or(DEFAULT_TICK_INTERVAL_MS),
            ),
            stream: StreamSettings {
                url: stream.url.unwrap_or_else(|| DEFAULT_STREAM_URL.to_string()),
                frame_skip: stream.frame_skip.unwrap_or(stream_defaults.frame_skip),
                reconnect_after: stream
                    .reconnect_after
                    .unwrap_or(stream_defaults.reconnect_after),
                retry_backoff: stream
                    .retry_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(stream_defaults.retry_backoff),
                width: stream.width.unwrap_or(rtsp_defaults.width),
                height: stream.height.unwrap_or(rtsp_defaults.height),
            },
            gate: GateConfig {
                mean_sensitivity: gate
                    .mean_sensitivity
                    .unwrap_or(gate_defaults.mean_sensitivity),
                pixel_threshold: gate.pixel_threshold.unwrap_or(gate_defaults.pixel_threshold),
                diff_threshold: gate.diff_threshold.unwrap_or(gate_defaults.diff_threshold),
                blur_sigma: gate.blur_sigma.unwrap_or(gate_defaults.blur_sigma),
                stability_frames: gate
                    .stability_frames
                    .unwrap_or(gate_defaults.stability_frames),
                mean_width: gate.mean_width.unwrap_or(gate_defaults.mean_width),
                mean_height: gate.mean_height.unwrap_or(gate_defaults.mean_height),
            },
            detector: DetectorSettings {
                backend,
                model_path: detector.model_path,
                input_size: detector
                    .input_size
                    .unwrap_or_else(|| backend.default_input_size()),
                class_id: detector
                    .class_id
                    .unwrap_or_else(|| backend.default_class_id()),
                confidence: detector.confidence.unwrap_or(filter_defaults.min_confidence),
                min_area: detector.min_area.unwrap_or(filter_defaults.min_area),
                min_aspect: detector.min_aspect.unwrap_or(filter_defaults.min_aspect),
                min_height: detector.min_height.unwrap_or(filter_defaults.min_height),
                throttle_n: detector.throttle_n.unwrap_or(1),
                persistence_cap: detector
                    .persistence_cap
                    .unwrap_or(person_defaults.persistence_cap),
                decision_threshold: detector
                    .decision_threshold
                    .unwrap_or(person_defaults.decision_threshold),
                throttled_threshold: detector
                    .throttled_threshold
                    .unwrap_or(person_defaults.throttled_threshold),
            },
            recording: RecordingSettings {
                archive_url: recording
                    .archive_url
                    .unwrap_or_else(|| DEFAULT_ARCHIVE_URL.to_string()),
                output_dir: recording
                    .output_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
                prefix: recording
                    .prefix
                    .unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
                extension: recording
                    .extension
                    .unwrap_or_else(|| DEFAULT_EXTENSION.to_string()),
                ffmpeg: recording
                    .ffmpeg
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_FFMPEG)),
                audio_bitrate: recording
                    .audio_bitrate
                    .unwrap_or_else(|| DEFAULT_AUDIO_BITRATE.to_string()),
                connect_timeout_us: recording
                    .connect_timeout_us
                    .unwrap_or(ffmpeg_defaults.connect_timeout_us),
                start_threshold: recording
                    .start_threshold
                    .unwrap_or(controller_defaults.start_threshold),
                stop_threshold: recording.stop_threshold.unwrap_or(10),
                min_duration: recording
                    .min_duration_secs
                    .map(Duration::from_secs)
                    .unwrap_or(controller_defaults.min_duration),
                stop_timeout: recording
                    .stop_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(controller_defaults.stop_timeout),
                startup_probe: recording
                    .startup_probe_ms
                    .map(Duration::from_millis)
                    .unwrap_or(ffmpeg_defaults.startup_probe),
                policy: recording.policy.unwrap_or_default(),
                lockout: Duration::from_secs(recording.lockout_secs.unwrap_or(20)),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = non_empty_env("RECORDER_STREAM_URL") {
            self.stream.url = url;
        }
        if let Some(url) = non_empty_env("RECORDER_ARCHIVE_URL") {
            self.recording.archive_url = url;
        }
        if let Some(dir) = non_empty_env("RECORDER_OUTPUT_DIR") {
            self.recording.output_dir = PathBuf::from(dir);
        }
        if let Some(prefix) = non_empty_env("RECORDER_PREFIX") {
            self.recording.prefix = prefix;
        }
        if let Some(backend) = non_empty_env("RECORDER_DETECTOR") {
            let kind: BackendKind = backend.parse()?;
            if kind != self.detector.backend {
                self.detector.input_size = kind.default_input_size();
                self.detector.class_id = kind.default_class_id();
            }
            self.detector.backend = kind;
        }
        if let Some(path) = non_empty_env("RECORDER_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(secs) = non_empty_env("RECORDER_MIN_DURATION_SECS") {
            let seconds: u64 = secs.parse().map_err(|_| {
                anyhow!("RECORDER_MIN_DURATION_SECS must be an integer number of seconds")
            })?;
            self.recording.min_duration = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.stream.url.trim().is_empty() {
            return Err(anyhow!("stream url must not be empty"));
        }
        if self.stream.frame_skip == 0 {
            return Err(anyhow!("stream.frame_skip must be at least 1"));
        }
        if self.stream.reconnect_after == 0 {
            return Err(anyhow!("stream.reconnect_after must be at least 1"));
        }
        if self.stream.width == 0 || self.stream.height == 0 {
            return Err(anyhow!("stream width and height must be greater than zero"));
        }

        if !self.gate.mean_sensitivity.is_finite() || self.gate.mean_sensitivity < 0.0 {
            return Err(anyhow!("gate.mean_sensitivity must be a non-negative number"));
        }
        if !self.gate.blur_sigma.is_finite() || self.gate.blur_sigma < 0.0 {
            return Err(anyhow!("gate.blur_sigma must be a non-negative number"));
        }
        if self.gate.mean_width == 0 || self.gate.mean_height == 0 {
            return Err(anyhow!("gate mean resolution must be greater than zero"));
        }

        let d = &self.detector;
        if d.throttle_n == 0 {
            return Err(anyhow!("detector.throttle_n must be at least 1"));
        }
        if d.persistence_cap == 0 {
            return Err(anyhow!("detector.persistence_cap must be at least 1"));
        }
        if d.decision_threshold > d.persistence_cap || d.throttled_threshold > d.persistence_cap {
            return Err(anyhow!(
                "detector thresholds ({}, {}) must not exceed persistence_cap {}",
                d.decision_threshold,
                d.throttled_threshold,
                d.persistence_cap
            ));
        }
        if !(0.0..=1.0).contains(&d.confidence) {
            return Err(anyhow!("detector.confidence must be within [0, 1]"));
        }
        if matches!(d.backend, BackendKind::Yolo | BackendKind::Ssd) && d.input_size == 0 {
            return Err(anyhow!("detector.input_size must be greater than zero"));
        }

        let r = &self.recording;
        if r.archive_url.trim().is_empty() {
            return Err(anyhow!("recording.archive_url must not be empty"));
        }
        let prefix_re = Regex::new(PREFIX_PATTERN)?;
        if !prefix_re.is_match(&r.prefix) {
            return Err(anyhow!(
                "recording.prefix '{}' must match {}",
                r.prefix,
                PREFIX_PATTERN
            ));
        }
        if r.extension.is_empty() || !r.extension.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(anyhow!(
                "recording.extension '{}' must be alphanumeric",
                r.extension
            ));
        }
        if r.start_threshold == 0 {
            return Err(anyhow!("recording.start_threshold must be at least 1"));
        }
        if r.stop_threshold == 0 {
            return Err(anyhow!("recording.stop_threshold must be at least 1"));
        }
        if r.policy == RecordingPolicy::Lockout && r.lockout.is_zero() {
            return Err(anyhow!("recording.lockout_secs must be greater than zero"));
        }
        Ok(())
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            frame_skip: self.stream.frame_skip,
            reconnect_after: self.stream.reconnect_after,
            retry_backoff: self.stream.retry_backoff,
            ..StreamConfig::default()
        }
    }

    pub fn rtsp_config(&self) -> RtspConfig {
        RtspConfig {
            url: self.stream.url.clone(),
            width: self.stream.width,
            height: self.stream.height,
            ..RtspConfig::default()
        }
    }

    pub fn person_config(&self) -> PersonConfig {
        let d = &self.detector;
        PersonConfig {
            filter: DetectionFilter {
                class_id: d.class_id,
                min_confidence: d.confidence,
                min_area: d.min_area,
                min_aspect: d.min_aspect,
                min_height: d.min_height,
            },
            persistence_cap: d.persistence_cap,
            decision_threshold: d.decision_threshold,
            throttled_threshold: d.throttled_threshold,
        }
    }

    pub fn backend_spec(&self) -> BackendSpec {
        BackendSpec {
            kind: self.detector.backend,
            model_path: self.detector.model_path.clone(),
            input_size: self.detector.input_size,
            decode_threshold: self.detector.confidence,
        }
    }

    /// Controller thresholds for the configured policy.
    pub fn controller_config(&self) -> ControllerConfig {
        let r = &self.recording;
        match r.policy {
            RecordingPolicy::Cooldown => ControllerConfig {
                start_threshold: r.start_threshold,
                stop_threshold: Some(r.stop_threshold),
                min_duration: r.min_duration,
                stop_timeout: r.stop_timeout,
            },
            RecordingPolicy::Lockout => ControllerConfig {
                start_threshold: r.start_threshold,
                stop_threshold: None,
                min_duration: r.lockout,
                stop_timeout: r.stop_timeout,
            },
        }
    }

    pub fn ffmpeg_config(&self) -> FfmpegConfig {
        let r = &self.recording;
        FfmpegConfig {
            binary: r.ffmpeg.clone(),
            archive_url: r.archive_url.clone(),
            audio_bitrate: r.audio_bitrate.clone(),
            connect_timeout_us: r.connect_timeout_us,
            clip_length: (r.policy == RecordingPolicy::Lockout).then_some(r.lockout),
            startup_probe: r.startup_probe,
        }
    }

    pub fn output_naming(&self) -> OutputNaming {
        OutputNaming {
            dir: self.recording.output_dir.clone(),
            prefix: self.recording.prefix.clone(),
            extension: self.recording.extension.clone(),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            throttle_n: self.detector.throttle_n,
            tick_interval: self.tick_interval,
            ..PipelineConfig::default()
        }
    }
}

fn read_config_file(path: &Path) -> Result<RecorderConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}
