//! Video elementary-stream handling.
//!
//! The ingest path delivers a raw H.264 Annex-B byte stream. This module
//! turns it into timestamped [`Sample`]s ready for an outbound WebRTC track:
//!
//! ```text
//! bytes ──► annexb (frame units) ──► h264 (classify) ──► clock (pts) ──► Sample
//! ```
//!
//! | Stage | Module | Notes |
//! |-------|--------|-------|
//! | Framing | [`annexb`] | 3- and 4-byte start codes, units up to 16 MiB |
//! | Classification | [`h264`] | parameter set vs picture |
//! | Timestamps | [`clock`] | 90 kHz, clamped wall-clock deltas |

pub mod annexb;
pub mod clock;
pub mod h264;

use std::time::Duration;

use bytes::Bytes;

pub use annexb::{AnnexBSplitter, FrameReader, FrameUnit, split_units};
pub use clock::{ClockConfig, PresentationClock};
pub use h264::UnitKind;

/// One unit of media ready for a track write.
///
/// Produced per frame unit and consumed immediately by every eligible peer;
/// never retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// Start-code-prefixed payload.
    pub data: Bytes,
    /// Presentation duration. Zero for parameter sets.
    pub duration: Duration,
    /// Presentation timestamp in clock ticks. Zero for parameter sets.
    pub timestamp: u64,
    /// Last unit of its picture; the RTP marker goes on its final packet.
    pub end_of_frame: bool,
}

impl Sample {
    /// A sample that carries no presentation time.
    pub fn untimed(data: Bytes) -> Self {
        Self {
            data,
            duration: Duration::ZERO,
            timestamp: 0,
            end_of_frame: false,
        }
    }

    pub fn timed(data: Bytes, duration: Duration, timestamp: u64) -> Self {
        Self {
            data,
            duration,
            timestamp,
            end_of_frame: false,
        }
    }

    pub fn with_end_of_frame(mut self) -> Self {
        self.end_of_frame = true;
        self
    }
}
