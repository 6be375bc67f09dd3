pub mod config;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod media;
pub mod peer;
pub mod router;
pub mod snapshot;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use gateway::Gateway;
pub use ingest::SourceKind;
pub use peer::{PeerManager, PeerSnapshot};
