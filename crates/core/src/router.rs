//! Source routing: which ingested source reaches viewers.
//!
//! Two facts are tracked per source and never collapsed into one:
//!
//! | Fact | Owner | Changed by |
//! |------|-------|------------|
//! | running | each [`IngestSupervisor`] | `start_all`, `start_source`, `stop_*` |
//! | active | the shared [`ActiveSource`] | `set_active_source`, `start_source` |
//!
//! Several sources may run at once; only the active one's frames are
//! forwarded. Switching the active source is a flag flip, so viewers see
//! the new source from its next frame.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::config::SourceUrls;
use crate::error::{GatewayError, Result};
use crate::ingest::backoff::BackoffPolicy;
use crate::ingest::decoder::DecoderLauncher;
use crate::ingest::{ActiveGate, IngestSupervisor, SourceKind};
use crate::peer::PeerManager;

/// The source whose frames are currently forwarded. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct ActiveSource(Arc<RwLock<Option<SourceKind>>>);

impl ActiveSource {
    pub fn get(&self) -> Option<SourceKind> {
        *self.0.read()
    }

    pub fn set(&self, kind: Option<SourceKind>) {
        *self.0.write() = kind;
    }

    pub fn is(&self, kind: SourceKind) -> bool {
        self.get() == Some(kind)
    }

    /// Gate for a supervisor of `kind`.
    pub fn gate(&self, kind: SourceKind) -> ActiveGate {
        let active = self.clone();
        Arc::new(move || active.is(kind))
    }
}

pub struct SourceRouter {
    urls: SourceUrls,
    launcher: Arc<dyn DecoderLauncher>,
    peers: PeerManager,
    policy: BackoffPolicy,
    cancel: watch::Receiver<bool>,
    active: ActiveSource,
    supervisors: Mutex<HashMap<SourceKind, IngestSupervisor>>,
}

impl SourceRouter {
    pub fn new(
        urls: SourceUrls,
        launcher: Arc<dyn DecoderLauncher>,
        peers: PeerManager,
        policy: BackoffPolicy,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            urls,
            launcher,
            peers,
            policy,
            cancel,
            active: ActiveSource::default(),
            supervisors: Mutex::new(HashMap::new()),
        }
    }

    /// Supervisor for `kind`, built on first use.
    fn supervisor(&self, kind: SourceKind) -> Result<IngestSupervisor> {
        let url = self
            .urls
            .get(kind)
            .ok_or(GatewayError::NotConfigured(kind))?;

        let mut supervisors = self.supervisors.lock();
        let supervisor = supervisors.entry(kind).or_insert_with(|| {
            tracing::debug!(source = %kind, url, "creating ingest supervisor");
            IngestSupervisor::new(
                kind,
                url,
                Arc::clone(&self.launcher),
                self.peers.clone(),
                self.active.gate(kind),
                self.policy,
            )
        });
        Ok(supervisor.clone())
    }

    fn ensure_started(&self, supervisor: &IngestSupervisor) -> Result<()> {
        match supervisor.start(self.cancel.clone()) {
            Ok(()) | Err(GatewayError::AlreadyRunning(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Start every configured source. Does not change the active source.
    pub fn start_all(&self) {
        for kind in self.urls.configured() {
            let started = self
                .supervisor(kind)
                .and_then(|supervisor| self.ensure_started(&supervisor));
            if let Err(e) = started {
                tracing::error!(source = %kind, error = %e, "failed to start source");
            }
        }
    }

    /// Forward frames from `source` from now on. Nothing is started or stopped.
    pub fn set_active_source(&self, source: &str) -> Result<()> {
        let kind: SourceKind = source.parse()?;
        let previous = self.active.get();
        self.active.set(Some(kind));
        tracing::info!(source = %kind, ?previous, "active source changed");
        Ok(())
    }

    /// Start `source` if needed and make it the active source.
    pub fn start_source(&self, source: &str) -> Result<()> {
        let kind: SourceKind = source.parse()?;
        let supervisor = self.supervisor(kind)?;
        self.ensure_started(&supervisor)?;
        self.active.set(Some(kind));
        tracing::info!(source = %kind, "source started and active");
        Ok(())
    }

    /// Stop the active source's supervisor and clear the selection.
    pub fn stop_current_source(&self) {
        let Some(kind) = self.active.get() else {
            return;
        };
        if let Some(supervisor) = self.supervisors.lock().get(&kind) {
            supervisor.stop();
        }
        self.active.set(None);
    }

    /// Stop every supervisor and clear the selection.
    pub fn stop_all(&self) {
        for supervisor in self.supervisors.lock().values() {
            supervisor.stop();
        }
        self.active.set(None);
    }

    /// Wait for every supervisor's loop to exit.
    pub async fn join_all(&self) {
        let supervisors: Vec<_> = self.supervisors.lock().values().cloned().collect();
        for supervisor in supervisors {
            supervisor.join().await;
        }
    }

    pub fn current_source(&self) -> Option<SourceKind> {
        self.active.get()
    }

    /// Whether the active source's supervisor is running.
    pub fn is_source_running(&self) -> bool {
        let Some(kind) = self.active.get() else {
            return false;
        };
        self.supervisors
            .lock()
            .get(&kind)
            .is_some_and(IngestSupervisor::is_running)
    }

    pub fn is_running(&self, kind: SourceKind) -> bool {
        self.supervisors
            .lock()
            .get(&kind)
            .is_some_and(IngestSupervisor::is_running)
    }

    /// Source types that are configured or already have a supervisor.
    pub fn available_sources(&self) -> Vec<SourceKind> {
        let supervisors = self.supervisors.lock();
        SourceKind::ALL
            .into_iter()
            .filter(|kind| self.urls.get(*kind).is_some() || supervisors.contains_key(kind))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::ingest::decoder::DecoderProcess;
    use crate::peer::{EventSink, PeerConnector, PeerTransport};
    use crate::snapshot::{SnapshotService, StillEncoder};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::io;
    use std::time::Duration;

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

    #[derive(Default)]
    struct IdleLauncher {
        writers: Mutex<Vec<tokio::io::DuplexStream>>,
    }

    impl DecoderLauncher for IdleLauncher {
        fn launch(&self, _: SourceKind, _: &str) -> io::Result<DecoderProcess> {
            let (writer, reader) = tokio::io::duplex(64);
            self.writers.lock().push(writer);
            Ok(DecoderProcess::from_streams(Box::new(reader), None))
        }
    }

    fn router(urls: SourceUrls) -> (SourceRouter, watch::Sender<bool>) {
        let (cancel_tx, cancel) = watch::channel(false);
        let snapshots = Arc::new(SnapshotService::new(
            Arc::new(NoEncoder),
            Duration::from_secs(1),
        ));
        let peers = PeerManager::new(Arc::new(NoPeers), snapshots, &GatewayConfig::default());
        let router = SourceRouter::new(
            urls,
            Arc::new(IdleLauncher::default()),
            peers,
            BackoffPolicy::default(),
            cancel,
        );
        (router, cancel_tx)
    }

    fn both() -> SourceUrls {
        SourceUrls {
            rtmp: Some("rtmp://host/live".into()),
            rtsp: Some("rtsp://cam/stream".into()),
        }
    }

    #[tokio::test]
    async fn start_unconfigured_source_leaves_selection_unchanged() {
        let (router, _cancel) = router(SourceUrls {
            rtmp: Some("rtmp://host/live".into()),
            rtsp: None,
        });
        router.start_source("rtmp").unwrap();

        let err = router.start_source("rtsp").unwrap_err();
        assert!(matches!(err, GatewayError::NotConfigured(SourceKind::Rtsp)));
        assert_eq!(router.current_source(), Some(SourceKind::Rtmp));
        router.stop_all();
    }

    #[tokio::test]
    async fn unknown_source_type_is_rejected() {
        let (router, _cancel) = router(both());
        assert!(matches!(
            router.set_active_source("hls"),
            Err(GatewayError::UnknownSource(_))
        ));
        assert!(matches!(
            router.start_source("hls"),
            Err(GatewayError::UnknownSource(_))
        ));
        assert_eq!(router.current_source(), None);
    }

    #[tokio::test]
    async fn switching_active_source_does_not_touch_supervisors() {
        let (router, _cancel) = router(both());
        router.start_all();
        assert!(router.is_running(SourceKind::Rtmp));
        assert!(router.is_running(SourceKind::Rtsp));
        assert_eq!(router.current_source(), None);
        assert!(!router.is_source_running());

        router.set_active_source("RTSP").unwrap();
        assert_eq!(router.current_source(), Some(SourceKind::Rtsp));
        assert!(router.is_running(SourceKind::Rtmp));
        assert!(router.is_running(SourceKind::Rtsp));
        assert!(router.is_source_running());

        router.set_active_source("rtmp").unwrap();
        assert_eq!(router.current_source(), Some(SourceKind::Rtmp));
        assert!(router.is_running(SourceKind::Rtsp));

        router.stop_all();
        router.join_all().await;
        assert!(!router.is_running(SourceKind::Rtmp));
        assert_eq!(router.current_source(), None);
    }

    #[tokio::test]
    async fn active_source_can_be_set_before_it_runs() {
        let (router, _cancel) = router(both());
        router.set_active_source("rtsp").unwrap();
        assert!(!router.is_source_running());
        assert!(!router.is_running(SourceKind::Rtsp));
    }

    #[tokio::test]
    async fn start_source_is_lazy_and_idempotent() {
        let (router, _cancel) = router(both());
        assert!(!router.is_running(SourceKind::Rtsp));

        router.start_source("rtsp").unwrap();
        router.start_source("Rtsp").unwrap();
        assert!(router.is_source_running());
        assert!(!router.is_running(SourceKind::Rtmp));

        router.stop_current_source();
        assert_eq!(router.current_source(), None);
        assert!(!router.is_running(SourceKind::Rtsp));
    }

    #[test]
    fn available_sources_follow_configuration() {
        let (configured, _cancel) = router(SourceUrls {
            rtmp: None,
            rtsp: Some("rtsp://cam/stream".into()),
        });
        assert_eq!(configured.available_sources(), vec![SourceKind::Rtsp]);

        let (empty, _cancel) = router(SourceUrls::default());
        assert!(empty.available_sources().is_empty());
    }

    #[test]
    fn gate_tracks_selection() {
        let active = ActiveSource::default();
        let rtsp = active.gate(SourceKind::Rtsp);
        assert!(!rtsp());
        active.set(Some(SourceKind::Rtsp));
        assert!(rtsp());
        active.set(Some(SourceKind::Rtmp));
        assert!(!rtsp());
    }
}
