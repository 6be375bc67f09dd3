//! External decoder processes.
//!
//! Each ingest session runs one ffmpeg process that reads the camera URL and
//! writes a raw H.264 Annex-B stream to stdout:
//!
//! | Source | Video | Notes |
//! |--------|-------|-------|
//! | RTSP | transcoded with libx264 | baseline, zero-latency, no B-frames, GOP 30 |
//! | RTMP | copied | input is assumed to already be H.264 |
//!
//! RTSP cameras commonly deliver HEVC or high-profile H.264 that browsers
//! cannot decode, so that path always re-encodes.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::process::{Child, Command};

use super::SourceKind;
use crate::config::FfmpegConfig;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// A running decoder: its output streams plus, for real processes, the
/// child handle used to kill it.
pub struct DecoderProcess {
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    child: Option<Child>,
}

impl DecoderProcess {
    /// Wrap in-memory streams (no process behind them).
    pub fn from_streams(stdout: BoxedReader, stderr: Option<BoxedReader>) -> Self {
        Self {
            stdout,
            stderr,
            child: None,
        }
    }

    pub fn from_child(mut child: Child) -> io::Result<Self> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("decoder stdout not captured"))?;
        let stderr = child.stderr.take().map(|s| Box::new(s) as BoxedReader);
        Ok(Self {
            stdout: Box::new(stdout),
            stderr,
            child: Some(child),
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Kill the process outright and reap it, waiting at most `wait`.
    pub async fn kill(&mut self, wait: Duration) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        if let Err(e) = child.start_kill() {
            tracing::debug!(error = %e, "decoder already exited");
        }
        match tokio::time::timeout(wait, child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(%status, "decoder reaped"),
            Ok(Err(e)) => tracing::warn!(error = %e, "failed to reap decoder"),
            Err(_) => tracing::warn!("decoder did not exit in time"),
        }
    }
}

impl std::fmt::Debug for DecoderProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderProcess")
            .field("pid", &self.id())
            .finish_non_exhaustive()
    }
}

/// Starts the process that turns a source URL into an Annex-B stream.
pub trait DecoderLauncher: Send + Sync {
    fn launch(&self, kind: SourceKind, url: &str) -> io::Result<DecoderProcess>;
}

/// Launches ffmpeg with per-source arguments.
#[derive(Debug, Clone, Default)]
pub struct FfmpegLauncher {
    config: FfmpegConfig,
}

impl FfmpegLauncher {
    pub fn new(config: FfmpegConfig) -> Self {
        Self { config }
    }

    pub fn args(&self, kind: SourceKind, url: &str) -> Vec<String> {
        let args: Vec<&str> = match kind {
            SourceKind::Rtsp => vec![
                "-hide_banner",
                "-rtsp_transport",
                self.config.rtsp_transport.as_str(),
                "-fflags",
                "+genpts",
                "-avoid_negative_ts",
                "make_zero",
                "-i",
                url,
                "-an",
                "-c:v",
                "libx264",
                "-preset",
                "veryfast",
                "-tune",
                "zerolatency",
                "-profile:v",
                "baseline",
                "-level",
                "3.1",
                "-pix_fmt",
                "yuv420p",
                "-g",
                "30",
                "-keyint_min",
                "30",
                "-sc_threshold",
                "0",
                "-bf",
                "0",
                "-flags",
                "+low_delay",
                "-f",
                "h264",
                "pipe:1",
            ],
            SourceKind::Rtmp => vec![
                "-hide_banner",
                "-i",
                url,
                "-c",
                "copy",
                "-f",
                "h264",
                "-an",
                "pipe:1",
            ],
        };
        args.into_iter().map(String::from).collect()
    }
}

impl DecoderLauncher for FfmpegLauncher {
    fn launch(&self, kind: SourceKind, url: &str) -> io::Result<DecoderProcess> {
        let child = Command::new(&self.config.binary)
            .args(self.args(kind, url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        DecoderProcess::from_child(child)
    }
}
