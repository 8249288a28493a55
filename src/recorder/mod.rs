//! Archival recording sessions.
//!
//! The analysis loop never touches the archival stream itself. Recording is
//! delegated to an external process (ffmpeg by default) that stream-copies
//! video from the high-resolution endpoint into a timestamped file. This
//! module owns launching that process, watching it, and stopping it within a
//! bounded time. `controller` decides when to do each.

pub mod controller;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use std::ffi::OsString;
use std::fmt;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

pub use controller::{
    ControllerConfig, ControllerState, RecordingController, Transition, TransitionReason,
};

/// How a recorder process ended.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    /// Exit status could not be determined.
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Handle to a running recorder.
pub trait RecorderProcess: Send {
    /// Non-blocking liveness check. `Some` once the process has exited.
    fn poll(&mut self) -> Result<Option<ProcessExit>>;

    /// Ask the process to finish, waiting at most `grace` before killing it.
    fn terminate(&mut self, grace: Duration) -> Result<ProcessExit>;
}

/// Starts recorder processes.
pub trait RecorderLauncher: Send {
    fn launch(&mut self, output: &Path) -> Result<Box<dyn RecorderProcess>>;
}

/// A live archival capture.
pub struct RecordingSession {
    process: Box<dyn RecorderProcess>,
    started: Instant,
    output_path: PathBuf,
}

impl RecordingSession {
    pub fn new(process: Box<dyn RecorderProcess>, started: Instant, output_path: PathBuf) -> Self {
        Self {
            process,
            started,
            output_path,
        }
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn elapsed_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    pub(crate) fn process_mut(&mut self) -> &mut dyn RecorderProcess {
        self.process.as_mut()
    }
}

impl fmt::Debug for RecordingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingSession")
            .field("started", &self.started)
            .field("output_path", &self.output_path)
            .finish_non_exhaustive()
    }
}

/// `<dir>/<prefix>_<YYYYMMDD_HHMMSS>.<ext>`
#[derive(Clone, Debug)]
pub struct OutputNaming {
    pub dir: PathBuf,
    pub prefix: String,
    pub extension: String,
}

impl OutputNaming {
    pub fn file_name(&self, at: DateTime<Local>) -> String {
        format!(
            "{}_{}.{}",
            self.prefix,
            at.format("%Y%m%d_%H%M%S"),
            self.extension
        )
    }

    /// Path for a recording starting at `at`. Two sessions started within the
    /// same second get a numeric suffix instead of overwriting each other.
    pub fn next_path(&self, at: DateTime<Local>) -> PathBuf {
        let path = self.dir.join(self.file_name(at));
        if !path.exists() {
            return path;
        }
        let stamp = at.format("%Y%m%d_%H%M%S");
        (1u32..)
            .map(|n| {
                self.dir
                    .join(format!("{}_{}_{}.{}", self.prefix, stamp, n, self.extension))
            })
            .find(|candidate| !candidate.exists())
            .unwrap_or(path)
    }
}

#[derive(Clone, Debug)]
pub struct FfmpegConfig {
    pub binary: PathBuf,
    pub archive_url: String,
    pub audio_bitrate: String,
    pub connect_timeout_us: u64,
    /// Fixed clip length (`-t`), used by the lockout policy.
    pub clip_length: Option<Duration>,
    /// How long to watch a fresh process for an immediate exit.
    pub startup_probe: Duration,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ffmpeg"),
            archive_url: String::new(),
            audio_bitrate: "32k".to_string(),
            connect_timeout_us: 4_000_000,
            clip_length: None,
            startup_probe: Duration::from_millis(300),
        }
    }
}

/// Launches ffmpeg: video stream-copied, audio re-encoded to AAC.
pub struct FfmpegLauncher {
    config: FfmpegConfig,
}

impl FfmpegLauncher {
    pub fn new(config: FfmpegConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FfmpegConfig {
        &self.config
    }

    pub fn args(&self, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-nostats",
            "-rtsp_transport",
            "tcp",
            "-rtsp_flags",
            "prefer_tcp",
            "-timeout",
        ]
        .iter()
        .map(OsString::from)
        .collect();
        args.push(self.config.connect_timeout_us.to_string().into());
        for arg in ["-fflags", "+genpts", "-use_wallclock_as_timestamps", "1", "-i"] {
            args.push(arg.into());
        }
        args.push(self.config.archive_url.clone().into());
        if let Some(length) = self.config.clip_length {
            args.push("-t".into());
            args.push(length.as_secs().max(1).to_string().into());
        }
        for arg in ["-c:v", "copy", "-c:a", "aac", "-b:a"] {
            args.push(arg.into());
        }
        args.push(self.config.audio_bitrate.clone().into());
        for arg in ["-movflags", "+faststart", "-reset_timestamps", "1"] {
            args.push(arg.into());
        }
        args.push(output.as_os_str().to_os_string());
        args
    }
}

impl RecorderLauncher for FfmpegLauncher {
    fn launch(&mut self, output: &Path) -> Result<Box<dyn RecorderProcess>> {
        let mut child = Command::new(&self.config.binary)
            .args(self.args(output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn {}", self.config.binary.display()))?;

        if let Some(stderr) = child.stderr.take() {
            let label = output
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            std::thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    if !line.trim().is_empty() {
                        log::warn!("recorder {}: {}", label, line);
                    }
                }
            });
        }

        let mut process = ChildProcess::new(child);
        if !self.config.startup_probe.is_zero() {
            std::thread::sleep(self.config.startup_probe);
            if let Some(exit) = process.poll()? {
                return Err(anyhow!("recorder exited during startup ({})", exit));
            }
        }
        Ok(Box::new(process))
    }
}

/// `RecorderProcess` over a spawned child.
pub struct ChildProcess {
    child: Child,
    exited: Option<ProcessExit>,
}

const TERMINATE_POLL: Duration = Duration::from_millis(20);

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self {
            child,
            exited: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    #[cfg(unix)]
    fn request_stop(&mut self) -> Result<()> {
        let pid = libc::pid_t::try_from(self.child.id()).context("recorder pid out of range")?;
        // SAFETY: kill(2) with a pid we spawned and have not reaped yet.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error()).context("send SIGTERM to recorder");
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn request_stop(&mut self) -> Result<()> {
        self.child.kill().context("stop recorder")
    }
}

impl RecorderProcess for ChildProcess {
    fn poll(&mut self) -> Result<Option<ProcessExit>> {
        if let Some(exit) = self.exited {
            return Ok(Some(exit));
        }
        let status = self.child.try_wait().context("poll recorder process")?;
        self.exited = status.map(ProcessExit::from);
        Ok(self.exited)
    }

    fn terminate(&mut self, grace: Duration) -> Result<ProcessExit> {
        if let Some(exit) = self.poll()? {
            return Ok(exit);
        }

        if let Err(e) = self.request_stop() {
            log::debug!("recorder {}: graceful stop failed: {:#}", self.id(), e);
        }
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if let Some(exit) = self.poll()? {
                return Ok(exit);
            }
            std::thread::sleep(TERMINATE_POLL);
        }

        log::warn!(
            "recorder {} did not exit within {:?}, killing",
            self.id(),
            grace
        );
        if let Err(e) = self.child.kill() {
            log::debug!("recorder {}: kill failed: {}", self.id(), e);
        }
        let status = self.child.wait().context("reap recorder process")?;
        let exit = ProcessExit::from(status);
        self.exited = Some(exit);
        Ok(exit)
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.exited.is_none() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn naming(dir: &Path) -> OutputNaming {
        OutputNaming {
            dir: dir.to_path_buf(),
            prefix: "cam1".to_string(),
            extension: "mp4".to_string(),
        }
    }

    #[test]
    fn file_name_uses_prefix_and_timestamp() -> Result<()> {
        let at = Local
            .with_ymd_and_hms(2024, 3, 9, 7, 5, 42)
            .single()
            .ok_or_else(|| anyhow!("ambiguous local time"))?;
        let n = naming(Path::new("/var/rec"));
        assert_eq!(n.file_name(at), "cam1_20240309_070542.mp4");
        assert_eq!(
            n.next_path(at),
            PathBuf::from("/var/rec/cam1_20240309_070542.mp4")
        );
        Ok(())
    }

    #[test]
    fn next_path_does_not_overwrite() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let at = Local
            .with_ymd_and_hms(2024, 3, 9, 7, 5, 42)
            .single()
            .ok_or_else(|| anyhow!("ambiguous local time"))?;
        let n = naming(dir.path());
        std::fs::write(dir.path().join("cam1_20240309_070542.mp4"), b"")?;
        assert_eq!(
            n.next_path(at),
            dir.path().join("cam1_20240309_070542_1.mp4")
        );
        Ok(())
    }

    #[test]
    fn ffmpeg_args_follow_recording_contract() {
        let launcher = FfmpegLauncher::new(FfmpegConfig {
            archive_url: "rtsp://10.0.0.5/stream1".to_string(),
            ..FfmpegConfig::default()
        });
        let args: Vec<String> = launcher
            .args(Path::new("out/cam1.mp4"))
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        let pos = |flag: &str| args.iter().position(|a| a == flag);
        let input = pos("-i").map(|i| args[i + 1].as_str());
        assert_eq!(input, Some("rtsp://10.0.0.5/stream1"));
        assert_eq!(pos("-rtsp_transport").map(|i| args[i + 1].as_str()), Some("tcp"));
        assert_eq!(pos("-timeout").map(|i| args[i + 1].as_str()), Some("4000000"));
        assert_eq!(pos("-c:v").map(|i| args[i + 1].as_str()), Some("copy"));
        assert_eq!(pos("-b:a").map(|i| args[i + 1].as_str()), Some("32k"));
        assert_eq!(pos("-movflags").map(|i| args[i + 1].as_str()), Some("+faststart"));
        assert!(pos("-use_wallclock_as_timestamps").is_some());
        assert!(pos("-t").is_none());
        assert_eq!(args.last().map(String::as_str), Some("out/cam1.mp4"));
    }

    #[test]
    fn clip_length_adds_duration_limit() {
        let launcher = FfmpegLauncher::new(FfmpegConfig {
            archive_url: "rtsp://cam/1".to_string(),
            clip_length: Some(Duration::from_secs(20)),
            ..FfmpegConfig::default()
        });
        let args = launcher.args(Path::new("clip.mp4"));
        let t = args.iter().position(|a| a == "-t");
        let input = args.iter().position(|a| a == "-i");
        assert!(t.is_some() && t > input);
        assert_eq!(t.map(|i| args[i + 1].clone()), Some(OsString::from("20")));
    }

    #[test]
    fn exit_display_and_success() {
        assert!(ProcessExit::code(0).success());
        assert!(!ProcessExit::code(1).success());
        assert!(!ProcessExit::unknown().success());
        assert_eq!(ProcessExit::code(1).to_string(), "exit code 1");
    }

    #[test]
    fn missing_binary_is_a_launch_error() {
        let mut launcher = FfmpegLauncher::new(FfmpegConfig {
            binary: PathBuf::from("/nonexistent/recorder-binary"),
            archive_url: "rtsp://cam/1".to_string(),
            ..FfmpegConfig::default()
        });
        assert!(launcher.launch(Path::new("x.mp4")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn child_process_reports_exit_and_terminates() -> Result<()> {
        let child = Command::new("sh").arg("-c").arg("exit 3").spawn()?;
        let mut process = ChildProcess::new(child);
        let deadline = Instant::now() + Duration::from_secs(5);
        let exit = loop {
            if let Some(exit) = process.poll()? {
                break exit;
            }
            assert!(Instant::now() < deadline, "child never exited");
            std::thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(exit, ProcessExit::code(3));

        let child = Command::new("sleep").arg("30").spawn()?;
        let mut process = ChildProcess::new(child);
        let started = Instant::now();
        let exit = process.terminate(Duration::from_secs(2))?;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!exit.success());
        Ok(())
    }
}
