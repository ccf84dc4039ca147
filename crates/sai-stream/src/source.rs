//! Per-camera frame source.
//!
//! Each source owns one read loop on its own task. The loop grabs frames
//! continuously, decodes one whenever the current decode delay has elapsed,
//! and publishes it into a single-slot watch cell. Readers only ever see
//! the newest complete `Arc<FrameInfo>`; they never wait on camera I/O.

use rand::rngs::StdRng;
use rand::SeedableRng;
use sai_models::{ActiveRule, CameraConfig, CameraId, FrameInfo};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, FailureLog, OutageLog};
use crate::connector::{FrameReader, StreamConnector};
use crate::error::StreamError;
use crate::metrics;
use crate::preferences::{DecodeDelayRange, StreamPreferences};

#[derive(Debug, Default)]
struct SourceStats {
    connected: AtomicBool,
    frames_decoded: AtomicU64,
    reconnects: AtomicU64,
    consecutive_failures: AtomicU32,
}

/// Point-in-time view of a source's health.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub connected: bool,
    pub frames_decoded: u64,
    pub reconnects: u64,
    pub consecutive_failures: u32,
    pub last_sequence: Option<u64>,
    pub last_frame_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// One camera's stream.
pub struct FrameSource {
    camera_uuid: CameraId,
    latest: watch::Receiver<Option<Arc<FrameInfo>>>,
    rules_tx: watch::Sender<Arc<[ActiveRule]>>,
    shutdown_tx: watch::Sender<bool>,
    stats: Arc<SourceStats>,
    stop_timeout: Duration,
    pending: Option<ReadLoop>,
    task: Option<JoinHandle<()>>,
}

impl FrameSource {
    /// Build a source for `camera`. Nothing is opened until [`start`](Self::start).
    pub fn new(
        camera: CameraConfig,
        connector: Arc<dyn StreamConnector>,
        prefs: StreamPreferences,
        delay_rx: watch::Receiver<DecodeDelayRange>,
    ) -> Self {
        let (latest_tx, latest) = watch::channel(None);
        let (rules_tx, rules_rx) = watch::channel(Arc::from(camera.active_rules.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(SourceStats::default());

        Self {
            camera_uuid: camera.camera_uuid.clone(),
            latest,
            rules_tx,
            shutdown_tx,
            stats: Arc::clone(&stats),
            stop_timeout: prefs.stop_timeout,
            pending: Some(ReadLoop {
                camera,
                connector,
                prefs,
                delay_rx,
                rules_rx,
                latest_tx,
                shutdown_rx,
                stats,
            }),
            task: None,
        }
    }

    pub fn camera_uuid(&self) -> &CameraId {
        &self.camera_uuid
    }

    /// Spawn the read loop. Calling it again is a no-op.
    pub fn start(&mut self) {
        if let Some(read_loop) = self.pending.take() {
            self.task = Some(tokio::spawn(read_loop.run()));
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Most recently decoded frame, or `None` before the first decode.
    pub fn latest_frame(&self) -> Option<Arc<FrameInfo>> {
        self.latest.borrow().clone()
    }

    /// Replace the rules attached to frames decoded from now on.
    pub fn update_rules(&self, rules: Vec<ActiveRule>) {
        self.rules_tx.send_replace(Arc::from(rules));
    }

    pub fn status(&self) -> SourceStatus {
        let latest = self.latest_frame();
        SourceStatus {
            connected: self.stats.connected.load(Ordering::Relaxed),
            frames_decoded: self.stats.frames_decoded.load(Ordering::Relaxed),
            reconnects: self.stats.reconnects.load(Ordering::Relaxed),
            consecutive_failures: self.stats.consecutive_failures.load(Ordering::Relaxed),
            last_sequence: latest.as_ref().map(|f| f.sequence),
            last_frame_at: latest.as_ref().map(|f| f.frame_timestamp),
        }
    }

    /// Stop the read loop and release the stream.
    ///
    /// Waits up to the configured stop timeout, then aborts the task.
    pub async fn stop(&mut self) {
        self.pending = None;
        self.shutdown_tx.send_replace(true);
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(self.stop_timeout, &mut task).await.is_err() {
                warn!(camera_uuid = %self.camera_uuid, "Read loop did not stop in time, aborting");
                task.abort();
            }
        }
        self.stats.connected.store(false, Ordering::Relaxed);
        debug!(camera_uuid = %self.camera_uuid, "Frame source stopped");
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// Why a connected session ended.
struct SessionFailure {
    cause: &'static str,
    error: StreamError,
}

impl SessionFailure {
    fn new(cause: &'static str, error: StreamError) -> Self {
        Self { cause, error }
    }
}

struct LoopState {
    backoff: Backoff,
    outage: OutageLog,
    rng: StdRng,
    sequence: u64,
}

struct ReadLoop {
    camera: CameraConfig,
    connector: Arc<dyn StreamConnector>,
    prefs: StreamPreferences,
    delay_rx: watch::Receiver<DecodeDelayRange>,
    rules_rx: watch::Receiver<Arc<[ActiveRule]>>,
    latest_tx: watch::Sender<Option<Arc<FrameInfo>>>,
    shutdown_rx: watch::Receiver<bool>,
    stats: Arc<SourceStats>,
}

impl ReadLoop {
    async fn run(mut self) {
        let camera_uuid = self.camera.camera_uuid.clone();
        let mut shutdown = self.shutdown_rx.clone();
        let mut state = LoopState {
            backoff: Backoff::new(self.prefs.backoff),
            outage: OutageLog::new(self.prefs.max_logged_failures),
            rng: StdRng::from_os_rng(),
            sequence: 0,
        };

        info!(
            camera_uuid = %camera_uuid,
            connector = self.connector.name(),
            "Frame source started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let failure = tokio::select! {
                _ = shutdown.changed() => break,
                failure = self.session(&mut state) => failure,
            };

            let log = state.outage.failed();
            self.stats.connected.store(false, Ordering::Relaxed);
            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            self.stats
                .consecutive_failures
                .store(state.outage.failed_attempts(), Ordering::Relaxed);
            metrics::record_reconnect(camera_uuid.as_str(), failure.cause);

            let delay = state.backoff.next_delay();
            match log {
                FailureLog::Warn => warn!(
                    camera_uuid = %camera_uuid,
                    cause = failure.cause,
                    error = %failure.error,
                    retry_in = ?delay,
                    "Camera stream failed"
                ),
                FailureLog::GoingQuiet => warn!(
                    camera_uuid = %camera_uuid,
                    attempts = state.outage.failed_attempts(),
                    error = %failure.error,
                    "Camera still offline, retrying quietly until it recovers"
                ),
                FailureLog::Silent => debug!(
                    camera_uuid = %camera_uuid,
                    cause = failure.cause,
                    retry_in = ?delay,
                    "Camera stream failed"
                ),
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(camera_uuid = %camera_uuid, "Frame source read loop exited");
    }

    /// Connect and read until something fails.
    async fn session(&mut self, state: &mut LoopState) -> SessionFailure {
        let connect_timeout = self.prefs.connect_timeout;
        let mut reader = match tokio::time::timeout(
            connect_timeout,
            self.connector.connect(&self.camera),
        )
        .await
        {
            Ok(Ok(reader)) => reader,
            Ok(Err(e)) => return SessionFailure::new("connect", e),
            Err(_) => return SessionFailure::new("connect", StreamError::Timeout(connect_timeout)),
        };

        self.stats.connected.store(true, Ordering::Relaxed);
        debug!(camera_uuid = %self.camera.camera_uuid, "Camera stream connected");

        let mut next_decode = Instant::now();
        let mut decode_failures = 0u32;

        loop {
            if let Err(error) = self.read_step(reader.grab()).await {
                return SessionFailure::new("read", error);
            }

            if Instant::now() < next_decode {
                continue;
            }

            match self.read_step(reader.retrieve()).await {
                Ok(image) => {
                    decode_failures = 0;
                    state.sequence += 1;
                    self.publish(image, state.sequence);
                    state.backoff.reset();
                    if let Some(outage) = state.outage.recovered() {
                        info!(
                            camera_uuid = %self.camera.camera_uuid,
                            attempts = outage.failed_attempts,
                            downtime = ?outage.downtime,
                            went_quiet = outage.went_quiet,
                            "Camera stream recovered"
                        );
                    }

                    let range = *self.delay_rx.borrow();
                    next_decode = Instant::now() + range.sample(&mut state.rng);
                }
                Err(error) if error.requires_reconnect() => {
                    return SessionFailure::new("read", error);
                }
                Err(error) => {
                    decode_failures += 1;
                    self.stats
                        .consecutive_failures
                        .store(decode_failures, Ordering::Relaxed);
                    debug!(
                        camera_uuid = %self.camera.camera_uuid,
                        failures = decode_failures,
                        error = %error,
                        "Frame decode failed"
                    );
                    if decode_failures >= self.prefs.max_consecutive_decode_failures {
                        return SessionFailure::new("decode", error);
                    }
                }
            }
        }
    }

    async fn read_step<T>(
        &self,
        op: impl std::future::Future<Output = Result<T, StreamError>>,
    ) -> Result<T, StreamError> {
        let read_timeout = self.prefs.read_timeout;
        tokio::time::timeout(read_timeout, op)
            .await
            .map_err(|_| StreamError::Timeout(read_timeout))?
    }

    fn publish(&self, image: image::RgbImage, sequence: u64) {
        let rules = self.rules_rx.borrow().clone();
        let frame = FrameInfo::new(
            self.camera.camera_uuid.clone(),
            sequence,
            image,
            self.camera.camera_region.clone(),
            rules,
        );
        self.latest_tx.send_replace(Some(Arc::new(frame)));
        self.stats.frames_decoded.fetch_add(1, Ordering::Relaxed);
        self.stats.consecutive_failures.store(0, Ordering::Relaxed);
        metrics::record_frame_decoded(self.camera.camera_uuid.as_str());
    }
}

/// Connectors used by tests across the crate.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::connector::FrameReader;
    use crate::error::StreamResult;
    use async_trait::async_trait;
    use image::RgbImage;
    use sai_models::CameraStatus;
    use std::sync::Mutex;

    pub fn camera(id: &str, ip: &str) -> CameraConfig {
        CameraConfig {
            camera_uuid: CameraId::from(id),
            camera_region: "dock".to_string(),
            camera_description: String::new(),
            camera_status: CameraStatus::Active,
            nvr_ip_address: None,
            camera_ip_address: ip.to_string(),
            username: "admin".to_string(),
            password: "secret".to_string(),
            stream_path: "stream1".to_string(),
            active_rules: Vec::new(),
        }
    }

    /// Fails every connect until `fail_until`, then serves 25 fps blank frames.
    pub struct FakeConnector {
        fail_until: Instant,
        pub connect_attempts: AtomicU32,
        pub open_readers: Arc<AtomicU32>,
        pub connected_at: Mutex<Option<Instant>>,
        /// Every retrieve fails when set
        pub failing_retrieves: bool,
    }

    impl FakeConnector {
        pub fn healthy() -> Self {
            Self::failing_until(Instant::now())
        }

        pub fn failing_until(fail_until: Instant) -> Self {
            Self {
                fail_until,
                connect_attempts: AtomicU32::new(0),
                open_readers: Arc::new(AtomicU32::new(0)),
                connected_at: Mutex::new(None),
                failing_retrieves: false,
            }
        }
    }

    #[async_trait]
    impl StreamConnector for FakeConnector {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn connect(&self, _camera: &CameraConfig) -> StreamResult<Box<dyn FrameReader>> {
            self.connect_attempts.fetch_add(1, Ordering::SeqCst);
            if Instant::now() < self.fail_until {
                return Err(StreamError::connect_failed("connection refused"));
            }
            *self.connected_at.lock().unwrap() = Some(Instant::now());
            self.open_readers.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeReader {
                open_readers: Arc::clone(&self.open_readers),
                fail_retrieve: self.failing_retrieves,
            }))
        }
    }

    struct FakeReader {
        open_readers: Arc<AtomicU32>,
        fail_retrieve: bool,
    }

    #[async_trait]
    impl FrameReader for FakeReader {
        async fn grab(&mut self) -> StreamResult<()> {
            tokio::time::sleep(Duration::from_millis(40)).await;
            Ok(())
        }

        async fn retrieve(&mut self) -> StreamResult<RgbImage> {
            if self.fail_retrieve {
                return Err(StreamError::decode_failed("corrupt frame"));
            }
            Ok(RgbImage::new(16, 9))
        }
    }

    impl Drop for FakeReader {
        fn drop(&mut self) {
            self.open_readers.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
