//! Supervised ingestion of one camera source.
//!
//! An [`IngestSupervisor`] keeps a decoder process running for one source
//! type. Each *session* launches the decoder, frames its stdout into Annex-B
//! units and forwards them to the [`PeerManager`] while the source is the
//! active one. When a session ends, for any reason, the supervisor waits
//! out a backoff delay and starts another, until stopped or cancelled.
//!
//! ```text
//!  start ──► launch ──► read frames ──► EOF / error ──► backoff ──┐
//!              ▲                                                  │
//!              └──────────────────────────────────────────────────┘
//!  stop / cancel: kill decoder, exit loop
//! ```
//!
//! Frames are read and dropped while the source is inactive, so switching
//! sources never waits for a decoder to start up.

pub mod backoff;
pub mod decoder;
pub mod diagnostics;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{GatewayError, Result};
use crate::media::{FrameReader, FrameUnit};
use crate::peer::PeerManager;
use backoff::{Backoff, BackoffPolicy};
use decoder::DecoderLauncher;

/// Upper bound on waiting for a killed decoder to be reaped.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Frames between progress log lines (~10 s at 30 fps).
const PROGRESS_INTERVAL: u64 = 300;

/// Supported ingest protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Rtmp,
    Rtsp,
}

impl SourceKind {
    pub const ALL: [SourceKind; 2] = [SourceKind::Rtmp, SourceKind::Rtsp];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Rtmp => "rtmp",
            SourceKind::Rtsp => "rtsp",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = GatewayError;

    /// Case-insensitive; surrounding whitespace is ignored.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rtmp" => Ok(SourceKind::Rtmp),
            "rtsp" => Ok(SourceKind::Rtsp),
            _ => Err(GatewayError::UnknownSource(s.to_string())),
        }
    }
}

/// Per-frame check deciding whether this source's frames reach viewers.
pub type ActiveGate = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Default)]
struct RunState {
    running: bool,
    generation: u64,
    stop: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    kind: SourceKind,
    url: String,
    launcher: Arc<dyn DecoderLauncher>,
    peers: PeerManager,
    gate: ActiveGate,
    policy: BackoffPolicy,
    state: Mutex<RunState>,
}

enum SessionEnd {
    /// Stop or cancellation was requested.
    Stopped,
    /// The decoder closed its output.
    Eof,
}

/// Keeps one decoder process alive for a source. Cheap to clone.
#[derive(Clone)]
pub struct IngestSupervisor {
    inner: Arc<Inner>,
}

impl IngestSupervisor {
    pub fn new(
        kind: SourceKind,
        url: impl Into<String>,
        launcher: Arc<dyn DecoderLauncher>,
        peers: PeerManager,
        gate: ActiveGate,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                kind,
                url: url.into(),
                launcher,
                peers,
                gate,
                policy,
                state: Mutex::new(RunState::default()),
            }),
        }
    }

    pub fn kind(&self) -> SourceKind {
        self.inner.kind
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Launch the supervised loop in the background.
    ///
    /// `cancel` is the gateway-wide shutdown signal. Fails with
    /// [`GatewayError::AlreadyRunning`] if a loop is already active.
    pub fn start(&self, cancel: watch::Receiver<bool>) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.running {
            return Err(GatewayError::AlreadyRunning(self.inner.kind));
        }

        state.running = true;
        state.generation += 1;
        let generation = state.generation;
        let (stop_tx, stop_rx) = watch::channel(false);
        state.stop = Some(stop_tx);

        // A loop from an earlier start may still be killing its decoder.
        let previous = state.task.take();
        let inner = Arc::clone(&self.inner);
        state.task = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            inner.supervise(generation, cancel, stop_rx).await;
        }));

        tracing::info!(source = %self.inner.kind, url = %self.inner.url, "ingest started");
        Ok(())
    }

    /// Kill the current decoder and end the loop. Idempotent.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        if !state.running {
            return;
        }
        state.running = false;
        if let Some(stop) = state.stop.take() {
            stop.send_replace(true);
        }
        tracing::info!(source = %self.inner.kind, "ingest stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Wait for the background loop to finish (after stop or cancel).
    pub async fn join(&self) {
        let task = self.inner.state.lock().task.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl fmt::Debug for IngestSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestSupervisor")
            .field("kind", &self.inner.kind)
            .field("url", &self.inner.url)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Resolves once `rx` carries `true`. Never resolves if the sender is gone.
async fn signalled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|v| *v).await.is_err() {
        std::future::pending::<()>().await;
    }
}

impl Inner {
    async fn supervise(
        self: Arc<Self>,
        generation: u64,
        mut cancel: watch::Receiver<bool>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut backoff = Backoff::new(self.policy);

        loop {
            if *cancel.borrow() || *stop.borrow() {
                break;
            }

            let started = Instant::now();
            match self.run_session(&mut cancel, &mut stop).await {
                Ok(SessionEnd::Stopped) => break,
                Ok(SessionEnd::Eof) => {
                    tracing::warn!(source = %self.kind, "decoder output ended");
                }
                Err(e) => {
                    tracing::error!(source = %self.kind, error = %e, "ingest session failed");
                }
            }

            backoff.record_session(started.elapsed());
            let delay = backoff.next_delay();
            tracing::info!(source = %self.kind, ?delay, attempt = backoff.attempts(), "restarting ingest");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = signalled(&mut cancel) => break,
                _ = signalled(&mut stop) => break,
            }
        }

        let mut state = self.state.lock();
        if state.generation == generation && state.running {
            state.running = false;
            state.stop = None;
        }
        tracing::debug!(source = %self.kind, "ingest loop exited");
    }

    async fn run_session(
        &self,
        cancel: &mut watch::Receiver<bool>,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd> {
        tracing::info!(source = %self.kind, url = %self.url, "launching decoder");
        let mut process = self.launcher.launch(self.kind, &self.url)?;
        tracing::info!(source = %self.kind, pid = ?process.id(), "decoder started");

        let diagnostics = process
            .stderr
            .take()
            .map(|stderr| tokio::spawn(diagnostics::drain(stderr, self.kind)));

        let stdout = std::mem::replace(&mut process.stdout, Box::new(tokio::io::empty()));
        let mut reader = FrameReader::new(stdout);
        let mut frames = 0u64;

        let outcome = loop {
            tokio::select! {
                _ = signalled(cancel) => break Ok(SessionEnd::Stopped),
                _ = signalled(stop) => break Ok(SessionEnd::Stopped),
                unit = reader.next_unit() => match unit {
                    Ok(Some(unit)) => {
                        frames += 1;
                        self.forward(unit, frames).await;
                    }
                    Ok(None) => break Ok(SessionEnd::Eof),
                    Err(e) => break Err(GatewayError::Subprocess(e)),
                },
            }
        };

        process.kill(KILL_WAIT).await;
        if let Some(task) = diagnostics {
            task.abort();
        }
        tracing::info!(source = %self.kind, frames, "ingest session ended");
        outcome
    }

    async fn forward(&self, unit: FrameUnit, frames: u64) {
        if frames == 1 {
            tracing::info!(
                source = %self.kind,
                size = unit.len(),
                head = %hex_prefix(unit.as_bytes(), 16),
                "first frame received"
            );
        }

        if (self.gate)() {
            self.peers.write_video_sample(unit.into_bytes(), 0).await;
        } else {
            tracing::trace!(source = %self.kind, "inactive source, frame dropped");
        }

        if frames % PROGRESS_INTERVAL == 0 {
            tracing::info!(source = %self.kind, frames, "ingest progress");
        }
    }
}

fn hex_prefix(bytes: &[u8], max: usize) -> String {
    bytes
        .iter()
        .take(max)
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::peer::{EventSink, PeerConnector, PeerTransport};
    use crate::snapshot::{SnapshotService, StillEncoder};
    use async_trait::async_trait;
    use bytes::Bytes;
    use decoder::DecoderProcess;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoPeers;

    #[async_trait]
    impl PeerConnector for NoPeers {
        async fn connect(&self, _: &str, _: EventSink) -> Result<Arc<dyn PeerTransport>> {
            Err(GatewayError::PeerConnection("unused".into()))
        }
    }

    struct NoEncoder;

    #[async_trait]
    impl StillEncoder for NoEncoder {
        async fn encode_jpeg(&self, _: Bytes) -> Result<Vec<u8>> {
            Err(GatewayError::Encode("unused".into()))
        }
    }

    /// Hands out decoders that print a fixed stream and exit.
    #[derive(Default)]
    struct ScriptedLauncher {
        launches: AtomicUsize,
        fail: bool,
    }

    impl DecoderLauncher for ScriptedLauncher {
        fn launch(&self, _: SourceKind, _: &str) -> io::Result<DecoderProcess> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::NotFound, "ffmpeg"));
            }
            let stdout: &'static [u8] = &[0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x65, 0x88];
            let stderr: &'static [u8] = b"Input #0, rtsp\nerror while decoding MB 1 2\n";
            Ok(DecoderProcess::from_streams(
                Box::new(stdout),
                Some(Box::new(stderr)),
            ))
        }
    }

    /// Hands out decoders whose output never ends.
    #[derive(Default)]
    struct EndlessLauncher {
        writers: parking_lot::Mutex<Vec<tokio::io::DuplexStream>>,
    }

    impl DecoderLauncher for EndlessLauncher {
        fn launch(&self, _: SourceKind, _: &str) -> io::Result<DecoderProcess> {
            let (writer, reader) = tokio::io::duplex(64);
            self.writers.lock().push(writer);
            Ok(DecoderProcess::from_streams(Box::new(reader), None))
        }
    }

    fn endless() -> Arc<dyn DecoderLauncher> {
        Arc::new(EndlessLauncher::default())
    }

    fn supervisor(launcher: Arc<dyn DecoderLauncher>) -> IngestSupervisor {
        let snapshots = Arc::new(SnapshotService::new(
            Arc::new(NoEncoder),
            Duration::from_secs(1),
        ));
        let peers = PeerManager::new(Arc::new(NoPeers), snapshots, &GatewayConfig::default());
        IngestSupervisor::new(
            SourceKind::Rtsp,
            "rtsp://cam/stream",
            launcher,
            peers,
            Arc::new(|| true),
            BackoffPolicy::default(),
        )
    }

    #[test]
    fn source_kind_parsing() {
        assert_eq!("rtsp".parse::<SourceKind>().unwrap(), SourceKind::Rtsp);
        assert_eq!("RTMP".parse::<SourceKind>().unwrap(), SourceKind::Rtmp);
        assert_eq!(" Rtsp ".parse::<SourceKind>().unwrap(), SourceKind::Rtsp);
        assert!(matches!(
            "webrtc".parse::<SourceKind>(),
            Err(GatewayError::UnknownSource(s)) if s == "webrtc"
        ));
        assert_eq!(SourceKind::Rtmp.to_string(), "rtmp");
    }

    #[test]
    fn hex_prefix_truncates() {
        assert_eq!(hex_prefix(&[0, 0, 0, 1, 0x67], 4), "00 00 00 01");
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_rejected() {
        let (_cancel_tx, cancel) = watch::channel(false);
        let sup = supervisor(endless());

        sup.start(cancel.clone()).unwrap();
        assert!(matches!(
            sup.start(cancel),
            Err(GatewayError::AlreadyRunning(SourceKind::Rtsp))
        ));
        assert!(sup.is_running());
        sup.stop();
        sup.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_allows_restart() {
        let (_cancel_tx, cancel) = watch::channel(false);
        let sup = supervisor(endless());

        sup.start(cancel.clone()).unwrap();
        sup.stop();
        sup.stop();
        assert!(!sup.is_running());

        sup.start(cancel).unwrap();
        assert!(sup.is_running());
        sup.stop();
        sup.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn ended_sessions_are_relaunched_with_backoff() {
        let (_cancel_tx, cancel) = watch::channel(false);
        let launcher = Arc::new(ScriptedLauncher::default());
        let sup = supervisor(Arc::clone(&launcher) as Arc<dyn DecoderLauncher>);

        sup.start(cancel).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);

        // 2 s then 4 s backoff.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 3);
        assert!(sup.is_running());

        sup.stop();
        sup.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn spawn_failures_back_off() {
        let (_cancel_tx, cancel) = watch::channel(false);
        let launcher = Arc::new(ScriptedLauncher {
            fail: true,
            ..Default::default()
        });
        let sup = supervisor(Arc::clone(&launcher) as Arc<dyn DecoderLauncher>);

        sup.start(cancel).unwrap();
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
        assert!(sup.is_running());
        sup.stop();
        sup.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_loop() {
        let (cancel_tx, cancel) = watch::channel(false);
        let sup = supervisor(endless());

        sup.start(cancel).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel_tx.send_replace(true);
        sup.join().await;
        assert!(!sup.is_running());
    }
}
