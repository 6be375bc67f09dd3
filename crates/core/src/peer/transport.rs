//! Seams between the peer manager and the WebRTC stack.
//!
//! [`PeerConnector`] builds one [`PeerTransport`] per viewer. The production
//! implementation lives in [`super::rtc`]; tests supply in-memory fakes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::state::{ConnectionState, IceState};
use crate::error::Result;
use crate::media::Sample;

/// State change reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    Connection(ConnectionState),
    Ice(IceState),
}

/// Callback a transport invokes on every state change. Must not block.
pub type EventSink = Arc<dyn Fn(PeerEvent) + Send + Sync>;

/// One negotiated (or negotiating) connection to a viewer, with an outbound
/// video track and an outbound audio track.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn connection_state(&self) -> ConnectionState;

    fn ice_state(&self) -> IceState;

    /// Apply a remote offer and return the local answer SDP.
    ///
    /// Waits for ICE gathering to finish, or for `gather_timeout`, so the
    /// answer carries every candidate found by then.
    async fn negotiate(&self, offer_sdp: String, gather_timeout: Duration) -> Result<String>;

    async fn write_video(&self, sample: &Sample) -> Result<()>;

    async fn write_audio(&self, sample: &Sample) -> Result<()>;

    async fn restart_ice(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Build a connection with both tracks attached. Partially created
    /// resources are released on failure.
    async fn connect(&self, peer_id: &str, events: EventSink) -> Result<Arc<dyn PeerTransport>>;
}
