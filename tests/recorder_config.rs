use std::sync::Mutex;
use std::time::Duration;

use tempfile::Builder;

use event_recorder::config::{RecorderConfig, RecordingPolicy};
use event_recorder::detect::BackendKind;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "RECORDER_CONFIG",
        "RECORDER_STREAM_URL",
        "RECORDER_ARCHIVE_URL",
        "RECORDER_OUTPUT_DIR",
        "RECORDER_PREFIX",
        "RECORDER_DETECTOR",
        "RECORDER_MODEL_PATH",
        "RECORDER_MIN_DURATION_SECS",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
    let mut file = Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    std::io::Write::write_all(&mut file, contents.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_json_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".json",
        r#"{
            "tick_interval_ms": 40,
            "stream": {
                "url": "rtsp://camera-1/stream2",
                "frame_skip": 2,
                "reconnect_after": 5
            },
            "gate": {
                "mean_sensitivity": 0.5,
                "pixel_threshold": 350
            },
            "detector": {
                "backend": "yolo",
                "model_path": "/models/yolov8n.onnx",
                "confidence": 0.3,
                "throttle_n": 3
            },
            "recording": {
                "archive_url": "rtsp://camera-1/stream1",
                "output_dir": "/srv/clips",
                "prefix": "porch",
                "stop_threshold": 15
            }
        }"#,
    );

    std::env::set_var("RECORDER_CONFIG", file.path());
    std::env::set_var("RECORDER_PREFIX", "driveway");
    std::env::set_var("RECORDER_MIN_DURATION_SECS", "30");

    let cfg = RecorderConfig::load().expect("load config");

    assert_eq!(cfg.tick_interval, Duration::from_millis(40));
    assert_eq!(cfg.stream.url, "rtsp://camera-1/stream2");
    assert_eq!(cfg.stream.frame_skip, 2);
    assert_eq!(cfg.stream_config().reconnect_after, 5);
    assert_eq!(cfg.gate.mean_sensitivity, 0.5);
    assert_eq!(cfg.gate.pixel_threshold, 350);
    assert_eq!(cfg.gate.stability_frames, 3);
    assert_eq!(cfg.detector.backend, BackendKind::Yolo);
    assert_eq!(cfg.detector.input_size, 640);
    assert_eq!(cfg.backend_spec().decode_threshold, 0.3);
    assert_eq!(cfg.pipeline_config().throttle_n, 3);
    assert_eq!(cfg.recording.archive_url, "rtsp://camera-1/stream1");
    assert_eq!(cfg.output_naming().prefix, "driveway");
    assert_eq!(cfg.controller_config().stop_threshold, Some(15));
    assert_eq!(cfg.controller_config().min_duration, Duration::from_secs(30));

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".toml",
        r#"
[stream]
url = "stub://garden"

[recording]
archive_url = "rtsp://garden/hd"
policy = "lockout"
lockout_secs = 25
"#,
    );

    let cfg = RecorderConfig::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.stream.url, "stub://garden");
    assert_eq!(cfg.recording.policy, RecordingPolicy::Lockout);
    assert_eq!(cfg.controller_config().stop_threshold, None);
    assert_eq!(
        cfg.ffmpeg_config().clip_length,
        Some(Duration::from_secs(25))
    );

    clear_env();
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = RecorderConfig::load().expect("load defaults");
    assert_eq!(cfg.stream.url, "stub://front_camera");
    assert_eq!(cfg.detector.backend, BackendKind::None);
    assert_eq!(cfg.recording.prefix, "cam1");
    assert_eq!(cfg.recording.extension, "mp4");
    assert_eq!(cfg.tick_interval, Duration::from_millis(20));
}

#[test]
fn detector_env_override_switches_defaults() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("RECORDER_DETECTOR", "ssd");
    std::env::set_var("RECORDER_MODEL_PATH", "/models/mobilenet_ssd.onnx");
    let cfg = RecorderConfig::load().expect("load config");
    assert_eq!(cfg.detector.backend, BackendKind::Ssd);
    assert_eq!(cfg.detector.input_size, 300);
    assert_eq!(cfg.person_config().filter.class_id, 15);
    assert_eq!(
        cfg.backend_spec().model_path.as_deref(),
        Some(std::path::Path::new("/models/mobilenet_ssd.onnx"))
    );

    clear_env();
}

#[test]
fn rejects_invalid_env_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("RECORDER_MIN_DURATION_SECS", "soon");
    assert!(RecorderConfig::load().is_err());
    clear_env();

    std::env::set_var("RECORDER_DETECTOR", "resnet");
    assert!(RecorderConfig::load().is_err());
    clear_env();

    std::env::set_var("RECORDER_PREFIX", "cam/../../etc");
    assert!(RecorderConfig::load().is_err());
    clear_env();
}

#[test]
fn command_line_stream_url_cannot_be_empty() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = RecorderConfig::load().expect("load defaults");
    assert!(cfg.clone().with_stream_url("").is_err());
    let cfg = cfg
        .with_stream_url("rtsp://camera-2/stream2")
        .expect("valid override");
    assert_eq!(cfg.stream.url, "rtsp://camera-2/stream2");
}

#[test]
fn rejects_malformed_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(".json", r#"{ "stream": { "frame_skip": "often" } }"#);
    assert!(RecorderConfig::load_from(Some(file.path())).is_err());

    let file = write_config(".json", r#"{ "stream": { "frame_skip": 0 } }"#);
    assert!(RecorderConfig::load_from(Some(file.path())).is_err());
}
