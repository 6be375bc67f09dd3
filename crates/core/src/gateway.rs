use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;

use crate::config::GatewayConfig;
use crate::error::Result;
use crate::ingest::SourceKind;
use crate::ingest::decoder::{DecoderLauncher, FfmpegLauncher};
use crate::peer::rtc::RtcConnector;
use crate::peer::{PeerConnector, PeerManager, PeerSnapshot};
use crate::router::SourceRouter;
use crate::snapshot::{FfmpegStillEncoder, SnapshotService, StillEncoder};

/// Entry point for the HTTP layer.
///
/// Owns the peer manager, the source router and the shutdown signal that
/// every ingest loop observes.
pub struct Gateway {
    config: Arc<GatewayConfig>,
    peers: PeerManager,
    router: SourceRouter,
    shutdown: watch::Sender<bool>,
}

impl Gateway {
    /// Gateway backed by webrtc-rs and the configured ffmpeg binary.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let connector = Arc::new(RtcConnector::new(config.ice.clone())?);
        let launcher = Arc::new(FfmpegLauncher::new(config.ffmpeg.clone()));
        let encoder = Arc::new(FfmpegStillEncoder::new(config.ffmpeg.binary.clone()));
        Ok(Self::with_components(config, connector, launcher, encoder))
    }

    /// Gateway with caller-supplied WebRTC, decoder and still-image backends.
    pub fn with_components(
        config: GatewayConfig,
        connector: Arc<dyn PeerConnector>,
        launcher: Arc<dyn DecoderLauncher>,
        encoder: Arc<dyn StillEncoder>,
    ) -> Self {
        let (shutdown, cancel) = watch::channel(false);
        let snapshots = Arc::new(SnapshotService::new(encoder, config.snapshot.timeout));
        let peers = PeerManager::new(connector, snapshots, &config);
        let router = SourceRouter::new(
            config.sources.clone(),
            launcher,
            peers.clone(),
            config.backoff,
            cancel,
        );
        Self {
            config: Arc::new(config),
            peers,
            router,
            shutdown,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn peers(&self) -> &PeerManager {
        &self.peers
    }

    pub fn router(&self) -> &SourceRouter {
        &self.router
    }

    /// Start every configured source and select the startup source.
    ///
    /// Returns the source that is now forwarded, if any.
    pub fn start(&self) -> Result<Option<SourceKind>> {
        self.router.start_all();
        let Some(kind) = self.config.startup_source() else {
            tracing::warn!("no video source configured");
            return Ok(None);
        };
        self.router.set_active_source(kind.as_str())?;
        Ok(Some(kind))
    }

    pub async fn create_peer(&self, id: &str) -> Result<()> {
        self.peers.create_session(id).await.map(|_| ())
    }

    pub async fn handle_offer(&self, id: &str, offer_sdp: String) -> Result<String> {
        self.peers.handle_offer(id, offer_sdp).await
    }

    pub async fn remove_peer(&self, id: &str) {
        self.peers.remove_peer(id).await
    }

    pub fn all_peers(&self) -> HashMap<String, PeerSnapshot> {
        self.peers.get_all_peers()
    }

    pub fn connected_peers_count(&self) -> usize {
        self.peers.connected_peers_count()
    }

    pub async fn capture_snapshot(&self) -> Result<String> {
        self.peers.capture_snapshot().await
    }

    pub fn start_source(&self, source: &str) -> Result<()> {
        self.router.start_source(source)
    }

    pub fn set_active_source(&self, source: &str) -> Result<()> {
        self.router.set_active_source(source)
    }

    pub fn current_source(&self) -> Option<SourceKind> {
        self.router.current_source()
    }

    pub fn available_sources(&self) -> Vec<SourceKind> {
        self.router.available_sources()
    }

    pub fn is_source_running(&self) -> bool {
        self.router.is_source_running()
    }

    /// Cancel every ingest loop, kill decoders and close all peers.
    pub async fn shutdown(&self) {
        tracing::info!("gateway shutting down");
        self.shutdown.send_replace(true);
        self.router.stop_all();
        self.peers.close_all().await;
        self.router.join_all().await;
    }
}
