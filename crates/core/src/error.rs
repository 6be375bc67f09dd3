//! Error types for the gateway library.

use crate::ingest::SourceKind;

/// Errors that can occur in the gateway library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Sources**: [`NotConfigured`](Self::NotConfigured),
///   [`AlreadyRunning`](Self::AlreadyRunning),
///   [`UnknownSource`](Self::UnknownSource).
/// - **Peers**: [`PeerNotFound`](Self::PeerNotFound),
///   [`PeerConnection`](Self::PeerConnection),
///   [`Negotiation`](Self::Negotiation).
/// - **Waits**: [`Timeout`](Self::Timeout), [`Cancelled`](Self::Cancelled).
/// - **External processes**: [`Subprocess`](Self::Subprocess),
///   [`Encode`](Self::Encode).
///
/// Subprocess failures inside an ingestion session are retried by the
/// supervisor and never reach callers; every other variant is returned
/// synchronously to whoever invoked the operation.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// No URL is configured for the requested source type.
    #[error("{0} source not configured")]
    NotConfigured(SourceKind),

    /// [`IngestSupervisor::start`](crate::ingest::IngestSupervisor::start) was
    /// called while a supervised loop was already active.
    #[error("{0} ingest is already running")]
    AlreadyRunning(SourceKind),

    /// No peer with the given ID is registered.
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// The source type is not one of the supported kinds.
    #[error("unknown source type: {0}")]
    UnknownSource(String),

    /// The peer connection or one of its tracks could not be constructed.
    #[error("peer connection error: {0}")]
    PeerConnection(String),

    /// Setting or creating a session description failed.
    #[error("SDP negotiation failed: {0}")]
    Negotiation(String),

    /// A bounded wait elapsed.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The gateway is shutting down.
    #[error("operation cancelled by shutdown")]
    Cancelled,

    /// Spawning or talking to an external process failed.
    #[error("subprocess error: {0}")]
    Subprocess(#[from] std::io::Error),

    /// Still-image conversion failed and no fallback applied.
    #[error("encode error: {0}")]
    Encode(String),
}

/// Convenience alias for `Result<T, GatewayError>`.
pub type Result<T> = std::result::Result<T, GatewayError>;
