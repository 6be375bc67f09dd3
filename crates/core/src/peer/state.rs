//! Peer connection and ICE states, independent of the WebRTC stack.
//!
//! ```text
//! New ─► Connecting ─► Connected ◄─► Disconnected
//!                          │              │
//!                          ▼              ▼
//!                        Failed ──(one ICE restart)──► Connected
//!                          │
//!                          ▼
//!                        Closed (terminal, peer removed)
//! ```
//!
//! Samples are only written to peers that are connected or about to be:
//! the connection must be `Connecting` or `Connected`, and ICE must be
//! `Checking`, `Connected` or `Completed`.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn can_send(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Closed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IceState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceState {
    pub fn can_send(self) -> bool {
        matches!(self, Self::Checking | Self::Connected | Self::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Checking => "checking",
            Self::Connected => "connected",
            Self::Completed => "completed",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for IceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a peer in these states should receive video samples.
pub fn can_send(connection: ConnectionState, ice: IceState) -> bool {
    connection.can_send() && ice.can_send()
}
