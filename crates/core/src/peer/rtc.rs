//! [`PeerTransport`] backed by webrtc-rs.
//!
//! Every connection carries two send-only tracks:
//!
//! | Track | Codec | Clock | Notes |
//! |-------|-------|-------|-------|
//! | video | H.264 | 90 kHz | constrained baseline, packetization-mode 1 |
//! | audio | Opus | 48 kHz | stereo, idle unless audio samples are written |
//!
//! Video is packetized here by [`VideoPacketizer`] so every packet carries
//! the presentation clock value of its sample. Audio goes through
//! webrtc-rs's sample track, which stamps packets from sample durations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use webrtc::api::API;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MediaEngine};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use super::rtp::VideoPacketizer;
use super::state::{ConnectionState, IceState};
use super::transport::{EventSink, PeerConnector, PeerEvent, PeerTransport};
use crate::config::IceConfig;
use crate::error::{GatewayError, Result};
use crate::media::Sample;

const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";
const VIDEO_CLOCK_RATE: u32 = 90_000;
const AUDIO_CLOCK_RATE: u32 = 48_000;
const AUDIO_CHANNELS: u16 = 2;
const STREAM_ID: &str = "webrtc-gateway";

fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn ice_state(state: RTCIceConnectionState) -> IceState {
    match state {
        RTCIceConnectionState::Checking => IceState::Checking,
        RTCIceConnectionState::Connected => IceState::Connected,
        RTCIceConnectionState::Completed => IceState::Completed,
        RTCIceConnectionState::Disconnected => IceState::Disconnected,
        RTCIceConnectionState::Failed => IceState::Failed,
        RTCIceConnectionState::Closed => IceState::Closed,
        _ => IceState::New,
    }
}

fn ice_servers(config: &IceConfig) -> Vec<RTCIceServer> {
    let mut servers = Vec::with_capacity(config.stun_urls.len() + 1);
    if !config.stun_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: config.stun_urls.clone(),
            ..Default::default()
        });
    }
    if let Some(relay) = &config.relay {
        servers.push(RTCIceServer {
            urls: vec![relay.url.clone()],
            username: relay.username.clone(),
            credential: relay.credential.clone(),
            ..Default::default()
        });
    }
    servers
}

/// Builds webrtc-rs peer connections sharing one media engine setup.
pub struct RtcConnector {
    api: API,
    ice: IceConfig,
}

impl RtcConnector {
    pub fn new(ice: IceConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| GatewayError::PeerConnection(format!("failed to register codecs: {e}")))?;

        let registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| {
                GatewayError::PeerConnection(format!("failed to register interceptors: {e}"))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api, ice })
    }

    async fn attach_tracks(
        pc: &RTCPeerConnection,
        peer_id: &str,
    ) -> Result<(Arc<TrackLocalStaticRTP>, Arc<TrackLocalStaticSample>)> {
        let video = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: VIDEO_CLOCK_RATE,
                channels: 0,
                sdp_fmtp_line: H264_FMTP.to_owned(),
                rtcp_feedback: vec![],
            },
            format!("video-{peer_id}"),
            STREAM_ID.to_owned(),
        ));
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: AUDIO_CLOCK_RATE,
                channels: AUDIO_CHANNELS,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            format!("audio-{peer_id}"),
            STREAM_ID.to_owned(),
        ));

        let tracks: [(&str, Arc<dyn TrackLocal + Send + Sync>); 2] = [
            ("video", Arc::clone(&video) as Arc<dyn TrackLocal + Send + Sync>),
            ("audio", Arc::clone(&audio) as Arc<dyn TrackLocal + Send + Sync>),
        ];
        for (kind, track) in tracks {
            let sender = pc
                .add_track(track)
                .await
                .map_err(|e| {
                    GatewayError::PeerConnection(format!("failed to add {kind} track: {e}"))
                })?;
            spawn_rtcp_drain(sender);
        }

        Ok((video, audio))
    }
}

/// Read incoming RTCP so the interceptors (NACK, receiver reports) run.
fn spawn_rtcp_drain(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
    });
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(&self, peer_id: &str, events: EventSink) -> Result<Arc<dyn PeerTransport>> {
        let config = RTCConfiguration {
            ice_servers: ice_servers(&self.ice),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await.map_err(|e| {
            GatewayError::PeerConnection(format!("failed to create peer connection: {e}"))
        })?);

        let (video, audio) = match Self::attach_tracks(&pc, peer_id).await {
            Ok(tracks) => tracks,
            Err(e) => {
                if let Err(close_err) = pc.close().await {
                    tracing::debug!(peer_id, error = %close_err, "close after failed setup");
                }
                return Err(e);
            }
        };

        let sink = Arc::clone(&events);
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            sink(PeerEvent::Connection(connection_state(s)));
            Box::pin(async {})
        }));

        let sink = events;
        pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
            sink(PeerEvent::Ice(ice_state(s)));
            Box::pin(async {})
        }));

        tracing::debug!(peer_id, "peer connection created");

        Ok(Arc::new(RtcTransport {
            pc,
            video,
            packetizer: Mutex::new(VideoPacketizer::new()),
            audio,
        }))
    }
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    video: Arc<TrackLocalStaticRTP>,
    packetizer: Mutex<VideoPacketizer>,
    audio: Arc<TrackLocalStaticSample>,
}

#[async_trait]
impl PeerTransport for RtcTransport {
    fn connection_state(&self) -> ConnectionState {
        connection_state(self.pc.connection_state())
    }

    fn ice_state(&self) -> IceState {
        ice_state(self.pc.ice_connection_state())
    }

    async fn negotiate(&self, offer_sdp: String, gather_timeout: Duration) -> Result<String> {
        let offer = RTCSessionDescription::offer(offer_sdp)
            .map_err(|e| GatewayError::Negotiation(format!("invalid offer: {e}")))?;

        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| GatewayError::Negotiation(format!("set remote description: {e}")))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| GatewayError::Negotiation(format!("create answer: {e}")))?;

        let mut gathered = self.pc.gathering_complete_promise().await;

        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| GatewayError::Negotiation(format!("set local description: {e}")))?;

        if tokio::time::timeout(gather_timeout, gathered.recv())
            .await
            .is_err()
        {
            tracing::warn!(
                timeout = ?gather_timeout,
                "ICE gathering incomplete, answering with candidates found so far"
            );
        }

        self.pc
            .local_description()
            .await
            .map(|desc| desc.sdp)
            .ok_or_else(|| GatewayError::Negotiation("no local description".into()))
    }

    async fn write_video(&self, sample: &Sample) -> Result<()> {
        let packets = self.packetizer.lock().packetize(sample)?;
        for packet in &packets {
            self.video
                .write_rtp(packet)
                .await
                .map_err(|e| GatewayError::PeerConnection(format!("video write failed: {e}")))?;
        }
        Ok(())
    }

    async fn write_audio(&self, sample: &Sample) -> Result<()> {
        let sample = webrtc::media::Sample {
            data: sample.data.clone(),
            duration: sample.duration,
            ..Default::default()
        };
        self.audio
            .write_sample(&sample)
            .await
            .map_err(|e| GatewayError::PeerConnection(format!("audio write failed: {e}")))
    }

    async fn restart_ice(&self) -> Result<()> {
        let offer = self
            .pc
            .create_offer(Some(RTCOfferOptions {
                ice_restart: true,
                ..Default::default()
            }))
            .await
            .map_err(|e| GatewayError::Negotiation(format!("ICE restart offer: {e}")))?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| GatewayError::Negotiation(format!("ICE restart: {e}")))
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| GatewayError::PeerConnection(format!("close failed: {e}")))
    }
}
