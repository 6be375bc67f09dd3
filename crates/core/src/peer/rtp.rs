//! RTP packetization for the outbound H.264 track (RFC 3550, RFC 6184).
//!
//! Every packet of a [`Sample`] carries that sample's presentation
//! timestamp, offset by a random per-connection base:
//!
//! ```text
//!  rtp_timestamp = base + (clock mod 2^32)      (wrapping)
//!  sequence      = previous + 1                 (wrapping, random start)
//!  marker        = last packet of an end-of-frame sample
//! ```
//!
//! Fragmentation (FU-A) and parameter-set aggregation (STAP-A) are done by
//! webrtc-rs's [`H264Payloader`]. It holds SPS and PPS back and emits them
//! as one STAP-A right before the next picture unit, so parameter sets go
//! out with the timestamp of the picture they describe.

use bytes::Bytes;
use webrtc::rtp::codecs::h264::H264Payloader;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::Payloader;

use crate::error::{GatewayError, Result};
use crate::media::Sample;

/// Largest RTP payload produced, leaving room for SRTP and header
/// extensions within a typical path MTU.
pub const RTP_PAYLOAD_MTU: usize = 1200;

const RTP_VERSION: u8 = 2;

/// Per-connection packetizer state.
#[derive(Debug)]
pub struct VideoPacketizer {
    payloader: H264Payloader,
    sequence: u16,
    timestamp_base: u32,
}

impl VideoPacketizer {
    /// Random initial sequence number and timestamp base (RFC 3550 §5.1).
    pub fn new() -> Self {
        Self::with_offsets(rand::random::<u16>(), rand::random::<u32>())
    }

    pub fn with_offsets(sequence: u16, timestamp_base: u32) -> Self {
        Self {
            payloader: H264Payloader::default(),
            sequence,
            timestamp_base,
        }
    }

    /// Wire timestamp for a presentation clock value.
    pub fn rtp_timestamp(&self, clock: u64) -> u32 {
        // RTP timestamps are modulo 2^32.
        let wrapped = (clock % (1u64 << 32)) as u32;
        self.timestamp_base.wrapping_add(wrapped)
    }

    /// Packets for one sample. Parameter sets alone yield none.
    pub fn packetize(&mut self, sample: &Sample) -> Result<Vec<Packet>> {
        let payloads: Vec<Bytes> = self
            .payloader
            .payload(RTP_PAYLOAD_MTU, &sample.data)
            .map_err(|e| GatewayError::PeerConnection(format!("packetization failed: {e}")))?;

        let timestamp = self.rtp_timestamp(sample.timestamp);
        let last = payloads.len().saturating_sub(1);
        let packets = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| {
                let sequence_number = self.sequence;
                self.sequence = self.sequence.wrapping_add(1);
                Packet {
                    header: Header {
                        version: RTP_VERSION,
                        marker: sample.end_of_frame && i == last,
                        sequence_number,
                        timestamp,
                        ..Default::default()
                    },
                    payload,
                }
            })
            .collect();
        Ok(packets)
    }
}

impl Default for VideoPacketizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SPS: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1f, 0xe9];
    const PPS: &[u8] = &[0, 0, 0, 1, 0x68, 0xce, 0x3c, 0x80];
    const IDR_A: &[u8] = &[0, 0, 0, 1, 0x65, 0x88, 0x84, 0x00, 0x33];
    const IDR_B: &[u8] = &[0, 0, 0, 1, 0x65, 0x00, 0x6e, 0x22, 0x21];
    const SLICE: &[u8] = &[0, 0, 0, 1, 0x41, 0x9a, 0x02, 0x04];

    const FRAME: Duration = Duration::from_nanos(33_333_333);

    fn nal_type(packet: &Packet) -> u8 {
        packet.payload[0] & 0x1f
    }

    fn packetize_all(packetizer: &mut VideoPacketizer, samples: &[Sample]) -> Vec<Packet> {
        samples
            .iter()
            .flat_map(|s| packetizer.packetize(s).unwrap())
            .collect()
    }

    #[test]
    fn picture_units_of_one_frame_share_the_clock_timestamp() {
        let mut packetizer = VideoPacketizer::with_offsets(100, 1_000);
        let frame = [
            Sample::untimed(Bytes::from_static(SPS)),
            Sample::untimed(Bytes::from_static(PPS)),
            Sample::timed(Bytes::from_static(IDR_A), FRAME, 3000),
            Sample::timed(Bytes::from_static(IDR_B), FRAME, 3000).with_end_of_frame(),
        ];
        let packets = packetize_all(&mut packetizer, &frame);

        // STAP-A with SPS+PPS, then the two IDR slices.
        let types: Vec<u8> = packets.iter().map(nal_type).collect();
        assert_eq!(types, [24, 5, 5]);
        assert!(packets.iter().all(|p| p.header.timestamp == 4_000));
        let markers: Vec<bool> = packets.iter().map(|p| p.header.marker).collect();
        assert_eq!(markers, [false, false, true]);
        let sequences: Vec<u16> = packets.iter().map(|p| p.header.sequence_number).collect();
        assert_eq!(sequences, [100, 101, 102]);
        assert!(packets.iter().all(|p| p.header.version == 2));
    }

    #[test]
    fn wire_timestamp_follows_clock_not_duration() {
        let mut packetizer = VideoPacketizer::with_offsets(0, 0);
        let first = Sample::timed(Bytes::from_static(IDR_A), FRAME, 3000).with_end_of_frame();
        // 60 ms later: the clock moved 5400 ticks, not one nominal frame.
        let second = Sample::timed(Bytes::from_static(SLICE), FRAME, 8400).with_end_of_frame();
        let packets = packetize_all(&mut packetizer, &[first, second]);

        let stamps: Vec<u32> = packets.iter().map(|p| p.header.timestamp).collect();
        assert_eq!(stamps, [3000, 8400]);
    }

    #[test]
    fn large_units_are_fragmented_under_one_timestamp() {
        let mut data = vec![0, 0, 0, 1, 0x65];
        data.extend(std::iter::repeat_n(0xab, RTP_PAYLOAD_MTU * 3));
        let sample = Sample::timed(Bytes::from(data), FRAME, 3000).with_end_of_frame();

        let mut packetizer = VideoPacketizer::with_offsets(u16::MAX, 0);
        let packets = packetizer.packetize(&sample).unwrap();

        assert!(packets.len() > 3);
        assert!(packets.iter().all(|p| nal_type(p) == 28));
        assert!(packets.iter().all(|p| p.payload.len() <= RTP_PAYLOAD_MTU));
        assert!(packets.iter().all(|p| p.header.timestamp == 3000));
        assert_eq!(packets.iter().filter(|p| p.header.marker).count(), 1);
        assert!(packets.last().unwrap().header.marker);
        assert_eq!(packets[0].header.sequence_number, u16::MAX);
        assert_eq!(packets[1].header.sequence_number, 0);
    }

    #[test]
    fn timestamp_wraps_modulo_32_bits() {
        let packetizer = VideoPacketizer::with_offsets(0, 10);
        assert_eq!(packetizer.rtp_timestamp(u32::MAX as u64 + 5), 14);
        let near_top = VideoPacketizer::with_offsets(0, u32::MAX - 1);
        assert_eq!(near_top.rtp_timestamp(3), 1);
    }

    #[test]
    fn parameter_sets_alone_produce_no_packets() {
        let mut packetizer = VideoPacketizer::with_offsets(7, 0);
        let packets = packetizer
            .packetize(&Sample::untimed(Bytes::from_static(SPS)))
            .unwrap();
        assert!(packets.is_empty());
        assert_eq!(packetizer.sequence, 7);
    }
}
