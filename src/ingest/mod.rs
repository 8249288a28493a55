//! Analysis-stream ingestion.
//!
//! `StreamBackend` is the transport seam (connect, cheap grab, decode of the
//! grabbed frame). `StreamSource` wraps a backend with the connection policy
//! the pipeline relies on:
//! - `open` retries forever with a fixed backoff
//! - only every Nth grabbed frame is decoded and handed downstream
//! - K consecutive grab failures release and reopen the connection
//!
//! Every call to `acquire` returns an `Acquisition` so the caller can keep
//! ticking its timers even when no frame was analysed.

pub mod rtsp;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::frame::Frame;

pub use rtsp::{RtspBackend, RtspConfig};

/// Transport for a live analysis stream.
pub trait StreamBackend {
    /// Human-readable endpoint for log lines.
    fn describe(&self) -> String;

    /// Single connection attempt. Implementations keep at most one frame
    /// buffered so a slow consumer never sees stale frames.
    fn open(&mut self) -> Result<()>;

    /// Fetch the next frame without decoding it.
    fn grab(&mut self) -> Result<()>;

    /// Decode the most recently grabbed frame.
    fn retrieve(&mut self) -> Result<Frame>;

    /// Drop the connection. Must be safe to call when not connected.
    fn release(&mut self);
}

#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Decode every Nth grabbed frame.
    pub frame_skip: u32,
    /// Consecutive grab failures that trigger a reconnect.
    pub reconnect_after: u32,
    /// Delay between connection attempts.
    pub retry_backoff: Duration,
    /// Pause after a failed grab that does not yet trigger a reconnect.
    pub miss_delay: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            frame_skip: 1,
            reconnect_after: 10,
            retry_backoff: Duration::from_secs(2),
            miss_delay: Duration::from_millis(100),
        }
    }
}

/// What one `acquire` call produced.
#[derive(Debug)]
pub enum Acquisition {
    /// A decoded frame to analyse.
    Frame(Frame),
    /// Grab succeeded but this tick falls between sampled frames.
    Skipped,
    /// Grab failed; not yet enough failures to reconnect.
    Missed,
    /// Grab succeeded but decoding failed.
    RetrieveFailed,
    /// The connection was dropped and reopened on this tick.
    Reconnected,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub grabbed: u64,
    pub retrieved: u64,
    pub skipped: u64,
    pub grab_failures: u64,
    pub retrieve_failures: u64,
    pub reconnects: u64,
}

pub struct StreamSource<B: StreamBackend> {
    backend: B,
    config: StreamConfig,
    grab_counter: u32,
    consecutive_failures: u32,
    shutdown: Option<Arc<AtomicBool>>,
    stats: StreamStats,
}

impl<B: StreamBackend> StreamSource<B> {
    pub fn new(backend: B, config: StreamConfig) -> Self {
        Self {
            backend,
            config,
            grab_counter: 0,
            consecutive_failures: 0,
            shutdown: None,
            stats: StreamStats::default(),
        }
    }

    /// Abort the open-retry loop once `flag` is set.
    pub fn with_shutdown(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(flag);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Connect, retrying with a fixed backoff until it succeeds.
    ///
    /// Returns false only when the shutdown flag interrupted the retries.
    pub fn open(&mut self) -> bool {
        let mut attempts = 0u64;
        loop {
            attempts += 1;
            match self.backend.open() {
                Ok(()) => {
                    log::info!(
                        "stream {}: connected after {} attempt(s)",
                        self.backend.describe(),
                        attempts
                    );
                    return true;
                }
                Err(e) => {
                    log::warn!(
                        "stream {}: open failed, retrying in {:?}: {:#}",
                        self.backend.describe(),
                        self.config.retry_backoff,
                        e
                    );
                }
            }
            if self.shutting_down() {
                return false;
            }
            std::thread::sleep(self.config.retry_backoff);
            if self.shutting_down() {
                return false;
            }
        }
    }

    /// Advance the stream by one tick.
    pub fn acquire(&mut self) -> Acquisition {
        if let Err(e) = self.backend.grab() {
            self.stats.grab_failures += 1;
            self.consecutive_failures += 1;
            if self.consecutive_failures < self.config.reconnect_after {
                log::debug!(
                    "stream {}: grab failed ({}/{}): {:#}",
                    self.backend.describe(),
                    self.consecutive_failures,
                    self.config.reconnect_after,
                    e
                );
                if !self.config.miss_delay.is_zero() {
                    std::thread::sleep(self.config.miss_delay);
                }
                return Acquisition::Missed;
            }
            self.reconnect(&e);
            return Acquisition::Reconnected;
        }

        self.stats.grabbed += 1;
        self.consecutive_failures = 0;
        self.grab_counter = self.grab_counter.wrapping_add(1);
        if self.grab_counter % self.config.frame_skip.max(1) != 0 {
            self.stats.skipped += 1;
            return Acquisition::Skipped;
        }

        match self.backend.retrieve() {
            Ok(frame) => {
                self.stats.retrieved += 1;
                Acquisition::Frame(frame)
            }
            Err(e) => {
                self.stats.retrieve_failures += 1;
                log::debug!(
                    "stream {}: retrieve failed: {:#}",
                    self.backend.describe(),
                    e
                );
                Acquisition::RetrieveFailed
            }
        }
    }

    /// Release the connection, e.g. on shutdown.
    pub fn release(&mut self) {
        self.backend.release();
    }

    fn reconnect(&mut self, last_error: &anyhow::Error) {
        log::warn!(
            "stream {}: offline after {} failed grabs, reconnecting: {:#}",
            self.backend.describe(),
            self.consecutive_failures,
            last_error
        );
        self.consecutive_failures = 0;
        self.grab_counter = 0;
        self.stats.reconnects += 1;
        self.backend.release();
        self.open();
    }

    fn shutting_down(&self) -> bool {
        self.shutdown
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    /// Backend whose grab results follow a script; `false` = failure.
    #[derive(Default)]
    struct Scripted {
        grabs: Vec<bool>,
        position: usize,
        opens: u32,
        open_failures: u32,
        releases: u32,
    }

    impl StreamBackend for Scripted {
        fn describe(&self) -> String {
            "scripted".to_string()
        }

        fn open(&mut self) -> Result<()> {
            if self.open_failures > 0 {
                self.open_failures -= 1;
                return Err(anyhow!("refused"));
            }
            self.opens += 1;
            Ok(())
        }

        fn grab(&mut self) -> Result<()> {
            let ok = self.grabs.get(self.position).copied().unwrap_or(true);
            self.position += 1;
            if ok {
                Ok(())
            } else {
                Err(anyhow!("no frame"))
            }
        }

        fn retrieve(&mut self) -> Result<Frame> {
            Ok(Frame::solid(8, 8, [0, 0, 0]))
        }

        fn release(&mut self) {
            self.releases += 1;
        }
    }

    fn fast_config(frame_skip: u32) -> StreamConfig {
        StreamConfig {
            frame_skip,
            reconnect_after: 10,
            retry_backoff: Duration::ZERO,
            miss_delay: Duration::ZERO,
        }
    }

    #[test]
    fn open_retries_until_success() {
        let backend = Scripted {
            open_failures: 3,
            ..Scripted::default()
        };
        let mut source = StreamSource::new(backend, fast_config(1));
        assert!(source.open());
        assert_eq!(source.backend().opens, 1);
    }

    #[test]
    fn open_gives_up_on_shutdown() {
        let backend = Scripted {
            open_failures: u32::MAX,
            ..Scripted::default()
        };
        let flag = Arc::new(AtomicBool::new(true));
        let mut source = StreamSource::new(backend, fast_config(1)).with_shutdown(flag);
        assert!(!source.open());
    }

    #[test]
    fn frame_skip_decodes_every_nth_grab() {
        let mut source = StreamSource::new(Scripted::default(), fast_config(3));
        source.open();

        let decoded = (0..9)
            .filter(|_| matches!(source.acquire(), Acquisition::Frame(_)))
            .count();
        assert_eq!(decoded, 3);
        assert_eq!(source.stats().skipped, 6);
    }

    #[test]
    fn ten_consecutive_failures_reconnect_once() {
        let backend = Scripted {
            grabs: vec![false; 10],
            ..Scripted::default()
        };
        let mut source = StreamSource::new(backend, fast_config(1));
        source.open();

        for _ in 0..9 {
            assert!(matches!(source.acquire(), Acquisition::Missed));
        }
        assert!(matches!(source.acquire(), Acquisition::Reconnected));
        assert_eq!(source.consecutive_failures(), 0);
        assert_eq!(source.backend().releases, 1);
        assert_eq!(source.backend().opens, 2);
        assert!(matches!(source.acquire(), Acquisition::Frame(_)));
    }

    #[test]
    fn successful_grab_resets_failure_run() {
        let mut grabs = vec![false; 9];
        grabs.push(true);
        grabs.extend(vec![false; 9]);
        let backend = Scripted {
            grabs,
            ..Scripted::default()
        };
        let mut source = StreamSource::new(backend, fast_config(1));
        source.open();

        for _ in 0..19 {
            assert!(!matches!(source.acquire(), Acquisition::Reconnected));
        }
        assert_eq!(source.stats().reconnects, 0);
        assert_eq!(source.consecutive_failures(), 9);
    }
}
