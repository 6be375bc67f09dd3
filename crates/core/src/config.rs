use std::time::Duration;

use crate::ingest::SourceKind;
use crate::ingest::backoff::BackoffPolicy;
use crate::media::ClockConfig;

/// Default public STUN servers.
pub const DEFAULT_STUN_URLS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Gateway-wide configuration.
///
/// Built once by the embedding binary and shared read-only by every
/// component. Every field has a usable default; only source URLs normally
/// need to be set.
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub sources: SourceUrls,
    /// Source forwarded after startup. Falls back to RTSP, then RTMP,
    /// whichever is configured first.
    pub initial_source: Option<SourceKind>,
    pub ice: IceConfig,
    pub clock: ClockConfig,
    pub backoff: BackoffPolicy,
    pub peer: PeerTimings,
    pub ffmpeg: FfmpegConfig,
    pub snapshot: SnapshotConfig,
}

impl GatewayConfig {
    /// The source to forward at startup, if any is configured.
    pub fn startup_source(&self) -> Option<SourceKind> {
        self.initial_source
            .filter(|kind| self.sources.get(*kind).is_some())
            .or_else(|| {
                [SourceKind::Rtsp, SourceKind::Rtmp]
                    .into_iter()
                    .find(|kind| self.sources.get(*kind).is_some())
            })
    }
}

/// Ingest URLs per source type. `None` means the type is not configured.
#[derive(Debug, Clone, Default)]
pub struct SourceUrls {
    pub rtmp: Option<String>,
    pub rtsp: Option<String>,
}

impl SourceUrls {
    pub fn get(&self, kind: SourceKind) -> Option<&str> {
        match kind {
            SourceKind::Rtmp => self.rtmp.as_deref(),
            SourceKind::Rtsp => self.rtsp.as_deref(),
        }
        .filter(|url| !url.is_empty())
    }

    /// Configured source types in declaration order.
    pub fn configured(&self) -> Vec<SourceKind> {
        SourceKind::ALL
            .into_iter()
            .filter(|kind| self.get(*kind).is_some())
            .collect()
    }
}

/// ICE servers handed to every new peer connection.
#[derive(Debug, Clone)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
    /// Optional TURN relay with static long-term credentials.
    pub relay: Option<RelayServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: DEFAULT_STUN_URLS.iter().map(|s| s.to_string()).collect(),
            relay: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// Timers driving negotiation and the per-peer connection state machine.
#[derive(Debug, Clone, Copy)]
pub struct PeerTimings {
    /// Upper bound on ICE candidate gathering during offer handling.
    pub gather_timeout: Duration,
    /// How long a disconnected peer is left alone to recover.
    pub disconnect_grace: Duration,
    /// Delay before the single ICE restart attempt after failure.
    pub ice_restart_delay: Duration,
    /// How long a restarted peer may stay failed before removal.
    pub failed_grace: Duration,
}

impl Default for PeerTimings {
    fn default() -> Self {
        Self {
            gather_timeout: Duration::from_secs(10),
            disconnect_grace: Duration::from_secs(5),
            ice_restart_delay: Duration::from_secs(2),
            failed_grace: Duration::from_secs(5),
        }
    }
}

/// External ffmpeg binary used for ingest and snapshot encoding.
#[derive(Debug, Clone)]
pub struct FfmpegConfig {
    pub binary: String,
    /// `-rtsp_transport` value for RTSP inputs.
    pub rtsp_transport: String,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            binary: "ffmpeg".to_string(),
            rtsp_transport: "tcp".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SnapshotConfig {
    /// How long a capture waits for the next frame.
    pub timeout: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}
