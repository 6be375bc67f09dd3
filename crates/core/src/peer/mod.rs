//! Viewer sessions and video fan-out.
//!
//! A [`PeerManager`] owns every viewer's WebRTC connection. The HTTP layer
//! creates a session, hands over the browser's SDP offer, and gets a
//! complete answer back. The ingest side calls
//! [`PeerManager::write_video_sample`] for every frame, which is then
//! written to each viewer whose connection can carry media.
//!
//! ## Locking
//!
//! | Lock | Guards | Held for |
//! |------|--------|----------|
//! | registry `RwLock` | id → session map | insert, remove, clone-out |
//! | per-session `Mutex` | connected flag | a single read or write |
//! | clock `Mutex` | presentation clock | one tick |
//!
//! The registry lock is always released before a session lock is taken, and
//! no lock is held across an `.await`. Fan-out iterates a cloned list of
//! sessions, so a concurrent removal only makes a write fail against an
//! already closed connection.
//!
//! ## Recovery
//!
//! A disconnected peer is left alone to recover. When ICE fails, one ICE
//! restart is attempted after a short delay. A connection that is still
//! failed after the grace period, or that closes, is removed.

pub mod rtc;
pub mod rtp;
pub mod state;
pub mod transport;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;

use crate::config::{GatewayConfig, PeerTimings};
use crate::error::{GatewayError, Result};
use crate::media::{PresentationClock, Sample, UnitKind, split_units};
use crate::snapshot::SnapshotService;
pub use state::{ConnectionState, IceState};
pub use transport::{EventSink, PeerConnector, PeerEvent, PeerTransport};

/// Nominal duration of one audio sample.
pub const AUDIO_SAMPLE_DURATION: Duration = Duration::from_millis(20);

/// One viewer connection.
pub struct PeerSession {
    id: String,
    serial: u64,
    transport: Arc<dyn PeerTransport>,
    connected: Mutex<bool>,
    restart_attempted: AtomicBool,
    created_at: SystemTime,
}

impl PeerSession {
    fn new(id: &str, serial: u64, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            id: id.to_string(),
            serial,
            transport,
            connected: Mutex::new(false),
            restart_attempted: AtomicBool::new(false),
            created_at: SystemTime::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether both the connection and ICE have reported an established path.
    pub fn is_connected(&self) -> bool {
        *self.connected.lock()
    }

    fn set_connected(&self, connected: bool) {
        *self.connected.lock() = connected;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.connection_state()
    }

    pub fn ice_state(&self) -> IceState {
        self.transport.ice_state()
    }

    /// Whether video samples should be written to this peer right now.
    pub fn can_send(&self) -> bool {
        state::can_send(self.connection_state(), self.ice_state())
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            id: self.id.clone(),
            connection_state: self.connection_state(),
            ice_state: self.ice_state(),
            connected: self.is_connected(),
            created_at: self.created_at,
        }
    }

    async fn close(&self) {
        if let Err(e) = self.transport.close().await {
            tracing::debug!(peer_id = %self.id, error = %e, "error closing peer connection");
        }
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of a peer for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerSnapshot {
    pub id: String,
    pub connection_state: ConnectionState,
    pub ice_state: IceState,
    pub connected: bool,
    pub created_at: SystemTime,
}

struct Inner {
    connector: Arc<dyn PeerConnector>,
    peers: RwLock<HashMap<String, Arc<PeerSession>>>,
    clock: Mutex<PresentationClock>,
    timings: PeerTimings,
    snapshots: Arc<SnapshotService>,
    next_serial: AtomicU64,
    shutdown: watch::Sender<bool>,
}

/// Registry of viewer sessions. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct PeerManager {
    inner: Arc<Inner>,
}

impl PeerManager {
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        snapshots: Arc<SnapshotService>,
        config: &GatewayConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                connector,
                peers: RwLock::new(HashMap::new()),
                clock: Mutex::new(PresentationClock::new(config.clock)),
                timings: config.peer,
                snapshots,
                next_serial: AtomicU64::new(1),
                shutdown,
            }),
        }
    }

    pub fn snapshots(&self) -> &Arc<SnapshotService> {
        &self.inner.snapshots
    }

    /// Create a connection for `id` and register it.
    ///
    /// An existing session with the same id is closed and replaced.
    pub async fn create_session(&self, id: &str) -> Result<Arc<PeerSession>> {
        if *self.inner.shutdown.borrow() {
            return Err(GatewayError::Cancelled);
        }
        let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
        let events = self.event_sink(id, serial);
        let transport = self.inner.connector.connect(id, events).await?;

        let session = Arc::new(PeerSession::new(id, serial, transport));
        if *self.inner.shutdown.borrow() {
            session.close().await;
            return Err(GatewayError::Cancelled);
        }
        let replaced = self
            .inner
            .peers
            .write()
            .insert(id.to_string(), Arc::clone(&session));

        if let Some(old) = replaced {
            tracing::warn!(peer_id = %id, "replacing existing peer session");
            old.close().await;
        }
        tracing::info!(peer_id = %id, "peer created");
        Ok(session)
    }

    /// Apply the viewer's offer and return the complete answer SDP.
    pub async fn handle_offer(&self, id: &str, offer_sdp: String) -> Result<String> {
        let session = self
            .get_peer(id)
            .ok_or_else(|| GatewayError::PeerNotFound(id.to_string()))?;

        let mut shutdown = self.inner.shutdown.subscribe();
        if *shutdown.borrow() {
            return Err(GatewayError::Cancelled);
        }

        tracing::debug!(peer_id = %id, "handling offer");
        let answer = tokio::select! {
            answer = session.transport.negotiate(offer_sdp, self.inner.timings.gather_timeout) => answer,
            _ = shutdown.wait_for(|stop| *stop) => return Err(GatewayError::Cancelled),
        };

        match &answer {
            Ok(_) => tracing::info!(peer_id = %id, "answer created"),
            Err(e) => tracing::error!(peer_id = %id, error = %e, "negotiation failed"),
        }
        answer
    }

    /// Close and unregister `id`. Unknown ids are ignored.
    pub async fn remove_peer(&self, id: &str) {
        let removed = self.inner.peers.write().remove(id);
        if let Some(session) = removed {
            session.close().await;
            tracing::info!(peer_id = %id, "peer removed");
        }
    }

    /// Remove `id` only if it still refers to the session with `serial`.
    async fn remove_if_current(&self, id: &str, serial: u64) {
        let removed = {
            let mut peers = self.inner.peers.write();
            match peers.get(id) {
                Some(session) if session.serial == serial => peers.remove(id),
                _ => None,
            }
        };
        if let Some(session) = removed {
            session.close().await;
            tracing::info!(peer_id = %id, "peer removed");
        }
    }

    pub fn get_peer(&self, id: &str) -> Option<Arc<PeerSession>> {
        self.inner.peers.read().get(id).cloned()
    }

    fn current_session(&self, id: &str, serial: u64) -> Option<Arc<PeerSession>> {
        self.get_peer(id).filter(|s| s.serial == serial)
    }

    pub fn get_all_peers(&self) -> HashMap<String, PeerSnapshot> {
        self.sessions()
            .into_iter()
            .map(|s| (s.id.clone(), s.snapshot()))
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.read().len()
    }

    pub fn connected_peers_count(&self) -> usize {
        self.sessions().iter().filter(|s| s.is_connected()).count()
    }

    /// Clone of the registry contents, taken under the read lock.
    fn sessions(&self) -> Vec<Arc<PeerSession>> {
        self.inner.peers.read().values().cloned().collect()
    }

    /// Frame one payload and write it to every peer that can take media.
    ///
    /// Parameter sets go first with zero timestamp and duration. Picture
    /// units follow, sharing one clock value; the last one ends the frame.
    /// The clock advances once per call, and only if the payload holds
    /// picture data. `_timestamp_hint`
    /// from the source is not used.
    pub async fn write_video_sample(&self, payload: Bytes, _timestamp_hint: u32) {
        let units = split_units(&payload);
        self.inner.snapshots.offer_frame(&payload, &units);

        let peers = self.sessions();
        if peers.is_empty() || units.is_empty() {
            return;
        }

        let (params, pictures): (Vec<_>, Vec<_>) = units
            .into_iter()
            .partition(|u| u.kind() == UnitKind::ParameterSet);

        let mut samples = Vec::with_capacity(params.len() + pictures.len());
        samples.extend(params.into_iter().map(|u| Sample::untimed(u.into_bytes())));
        if !pictures.is_empty() {
            let (timestamp, duration) = {
                let mut clock = self.inner.clock.lock();
                (clock.tick(), clock.config().frame_duration())
            };
            let last = pictures.len() - 1;
            samples.extend(pictures.into_iter().enumerate().map(|(i, u)| {
                let sample = Sample::timed(u.into_bytes(), duration, timestamp);
                if i == last { sample.with_end_of_frame() } else { sample }
            }));
        }

        let samples = &samples;
        let writes = peers.iter().filter(|p| p.can_send()).map(|peer| async move {
            for sample in samples {
                if let Err(e) = peer.transport.write_video(sample).await {
                    tracing::warn!(peer_id = %peer.id, error = %e, "video write failed");
                    break;
                }
            }
        });
        join_all(writes).await;
    }

    /// Write one audio sample to every connected peer.
    pub async fn write_audio_sample(&self, payload: Bytes, timestamp_hint: u32) {
        let peers = self.sessions();
        if peers.is_empty() || payload.is_empty() {
            return;
        }
        let sample = Sample::timed(payload, AUDIO_SAMPLE_DURATION, timestamp_hint as u64);
        let sample = &sample;
        let writes = peers.iter().filter(|p| p.is_connected()).map(|peer| async move {
            if let Err(e) = peer.transport.write_audio(sample).await {
                tracing::warn!(peer_id = %peer.id, error = %e, "audio write failed");
            }
        });
        join_all(writes).await;
    }

    pub async fn capture_snapshot(&self) -> Result<String> {
        self.inner.snapshots.capture_snapshot().await
    }

    /// Cancel pending negotiations and close every peer.
    pub async fn close_all(&self) {
        self.inner.shutdown.send_replace(true);
        let drained: Vec<_> = self.inner.peers.write().drain().map(|(_, s)| s).collect();
        join_all(drained.iter().map(|s| s.close())).await;
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "closed all peers");
        }
    }

    fn event_sink(&self, id: &str, serial: u64) -> EventSink {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let id = id.to_string();
        Arc::new(move |event| {
            if let Some(inner) = inner.upgrade() {
                PeerManager { inner }.on_event(&id, serial, event);
            }
        })
    }

    fn on_event(&self, id: &str, serial: u64, event: PeerEvent) {
        let Some(session) = self.current_session(id, serial) else {
            tracing::trace!(peer_id = %id, ?event, "event for stale session");
            return;
        };

        match event {
            PeerEvent::Connection(state) => {
                let ice = session.ice_state();
                session.set_connected(
                    state == ConnectionState::Connected
                        && matches!(ice, IceState::Connected | IceState::Completed),
                );
                match state {
                    ConnectionState::New | ConnectionState::Connecting => {
                        tracing::debug!(peer_id = %id, %state, %ice, "connection state");
                    }
                    ConnectionState::Connected => {
                        tracing::info!(peer_id = %id, %ice, "peer connected");
                    }
                    ConnectionState::Disconnected => {
                        tracing::warn!(peer_id = %id, %ice, "peer disconnected, waiting for recovery");
                    }
                    ConnectionState::Failed => {
                        tracing::error!(peer_id = %id, %ice, "peer connection failed");
                        self.spawn_failed_check(session);
                    }
                    ConnectionState::Closed => {
                        tracing::info!(peer_id = %id, "peer connection closed");
                        self.spawn_removal(id, serial);
                    }
                }
            }
            PeerEvent::Ice(state) => match state {
                IceState::Connected | IceState::Completed => {
                    session.set_connected(true);
                    tracing::info!(peer_id = %id, %state, "ICE established");
                }
                IceState::Disconnected => {
                    session.set_connected(false);
                    tracing::warn!(peer_id = %id, "ICE disconnected, may recover");
                    self.spawn_disconnect_watch(session);
                }
                IceState::Failed => {
                    session.set_connected(false);
                    tracing::error!(peer_id = %id, "ICE failed");
                    self.spawn_ice_restart(session);
                }
                IceState::Closed => {
                    session.set_connected(false);
                    self.spawn_removal(id, serial);
                }
                IceState::New | IceState::Checking => {
                    tracing::debug!(peer_id = %id, %state, "ICE state");
                }
            },
        }
    }

    fn spawn_removal(&self, id: &str, serial: u64) {
        let manager = self.clone();
        let id = id.to_string();
        tokio::spawn(async move { manager.remove_if_current(&id, serial).await });
    }

    fn spawn_disconnect_watch(&self, session: Arc<PeerSession>) {
        let grace = self.inner.timings.disconnect_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let ice = session.ice_state();
            if matches!(ice, IceState::Disconnected | IceState::Failed) {
                tracing::warn!(peer_id = %session.id, %ice, "peer still disconnected after grace period");
            }
        });
    }

    fn spawn_ice_restart(&self, session: Arc<PeerSession>) {
        if session.restart_attempted.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = self.clone();
        let delay = self.inner.timings.ice_restart_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if manager.current_session(&session.id, session.serial).is_none()
                || session.connection_state().is_terminal()
            {
                return;
            }
            tracing::info!(peer_id = %session.id, "attempting ICE restart");
            if let Err(e) = session.transport.restart_ice().await {
                tracing::warn!(peer_id = %session.id, error = %e, "ICE restart failed");
            }
        });
    }

    fn spawn_failed_check(&self, session: Arc<PeerSession>) {
        let manager = self.clone();
        let grace = self.inner.timings.failed_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if session.connection_state() == ConnectionState::Failed {
                tracing::warn!(peer_id = %session.id, "removing failed peer");
                manager.remove_if_current(&session.id, session.serial).await;
            }
        });
    }
}
