//! Still-image capture from the live video path.
//!
//! A capture is a single-slot handshake with the frame writer:
//!
//! 1. [`SnapshotService::capture_snapshot`] subscribes to the frame
//!    broadcast, then [`SnapshotService::request_snapshot`] puts a token
//!    into a one-element request slot. A token already waiting is left
//!    alone, so concurrent captures share one request.
//! 2. The frame writer calls [`SnapshotService::offer_frame`] for every
//!    frame. The first frame holding an IDR slice takes the token and is
//!    broadcast to every waiting capture. Neither step ever blocks the
//!    frame path.
//! 3. Each capture waits at most its own timeout for that frame, converts
//!    it to JPEG and returns a `data:` URI.
//!
//! A picture unit alone cannot be decoded, so the most recent SPS and PPS
//! seen on the frame path are prepended before encoding. When the encoder
//! is missing or fails, a fixed placeholder image is returned instead.

use std::io::Cursor;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{Bytes, BytesMut};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};

use crate::error::{GatewayError, Result};
use crate::media::FrameUnit;
use crate::media::h264::{self, NAL_PPS, NAL_SPS};

pub const DATA_URI_PREFIX: &str = "data:image/jpeg;base64,";

const PLACEHOLDER_SIZE: u32 = 100;
const PLACEHOLDER_QUALITY: u8 = 90;
const ENCODE_TIMEOUT: Duration = Duration::from_secs(10);

/// Converts one H.264 Annex-B access unit into a JPEG image.
#[async_trait]
pub trait StillEncoder: Send + Sync {
    async fn encode_jpeg(&self, h264: Bytes) -> Result<Vec<u8>>;
}

/// Runs `ffmpeg` with the frame on stdin and reads the JPEG from stdout.
#[derive(Debug, Clone)]
pub struct FfmpegStillEncoder {
    binary: String,
}

impl FfmpegStillEncoder {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl StillEncoder for FfmpegStillEncoder {
    async fn encode_jpeg(&self, h264: Bytes) -> Result<Vec<u8>> {
        let mut child = Command::new(&self.binary)
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                "-f",
                "h264",
                "-i",
                "pipe:0",
                "-frames:v",
                "1",
                "-f",
                "image2",
                "-c:v",
                "mjpeg",
                "pipe:1",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::Encode("encoder stdin not captured".into()))?;
        // Written from a separate task so a full stdout pipe cannot deadlock us.
        let feeder = tokio::spawn(async move {
            stdin.write_all(&h264).await?;
            stdin.shutdown().await
        });

        let output = tokio::time::timeout(ENCODE_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| GatewayError::Timeout("snapshot encoder"))??;

        match feeder.await {
            Ok(Err(e)) => tracing::debug!(error = %e, "encoder closed stdin early"),
            Err(e) => tracing::debug!(error = %e, "encoder feeder task failed"),
            Ok(Ok(())) => {}
        }

        if !output.status.success() || output.stdout.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GatewayError::Encode(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

/// A 100×100 solid red JPEG.
pub fn placeholder_jpeg() -> Result<Vec<u8>> {
    let img = RgbImage::from_pixel(PLACEHOLDER_SIZE, PLACEHOLDER_SIZE, Rgb([255, 0, 0]));
    let mut buf = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buf, PLACEHOLDER_QUALITY)
        .encode_image(&img)
        .map_err(|e| GatewayError::Encode(e.to_string()))?;
    Ok(buf.into_inner())
}

pub fn to_data_uri(jpeg: &[u8]) -> String {
    format!("{DATA_URI_PREFIX}{}", STANDARD.encode(jpeg))
}

#[derive(Debug, Default)]
struct ParameterSets {
    sps: Option<Bytes>,
    pps: Option<Bytes>,
}

pub struct SnapshotService {
    request_tx: mpsc::Sender<()>,
    request_rx: Mutex<mpsc::Receiver<()>>,
    frames: broadcast::Sender<Bytes>,
    parameter_sets: Mutex<ParameterSets>,
    encoder: Arc<dyn StillEncoder>,
    timeout: Duration,
}

impl SnapshotService {
    pub fn new(encoder: Arc<dyn StillEncoder>, timeout: Duration) -> Self {
        let (request_tx, request_rx) = mpsc::channel(1);
        let (frames, _) = broadcast::channel(1);
        Self {
            request_tx,
            request_rx: Mutex::new(request_rx),
            frames,
            parameter_sets: Mutex::new(ParameterSets::default()),
            encoder,
            timeout,
        }
    }

    /// Ask for the next frame. Returns `false` if a request was already pending.
    pub fn request_snapshot(&self) -> bool {
        match self.request_tx.try_send(()) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!("snapshot request already pending");
                false
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.request_rx.lock().is_empty()
    }

    /// Frame-path hook. `units` are the frame units of `frame`.
    ///
    /// Only a frame with an IDR slice answers a pending request; anything
    /// else cannot be decoded on its own.
    pub fn offer_frame(&self, frame: &Bytes, units: &[FrameUnit]) {
        self.remember_parameter_sets(units);

        if !units.iter().any(|u| h264::is_keyframe(u.nal())) {
            return;
        }
        if self.request_rx.lock().try_recv().is_err() {
            return;
        }
        match self.frames.send(frame.clone()) {
            Ok(waiters) => tracing::debug!(bytes = frame.len(), waiters, "keyframe captured for snapshot"),
            Err(_) => tracing::debug!("snapshot request abandoned, frame dropped"),
        }
    }

    fn remember_parameter_sets(&self, units: &[FrameUnit]) {
        for unit in units {
            match h264::nal_type(unit.nal()) {
                Some(NAL_SPS) => self.parameter_sets.lock().sps = Some(unit.as_bytes().clone()),
                Some(NAL_PPS) => self.parameter_sets.lock().pps = Some(unit.as_bytes().clone()),
                _ => {}
            }
        }
    }

    /// Prefix `frame` with cached parameter sets it does not carry itself.
    fn decodable(&self, frame: Bytes) -> Bytes {
        let units = crate::media::split_units(&frame);
        let has = |t: u8| units.iter().any(|u| h264::nal_type(u.nal()) == Some(t));
        let (has_sps, has_pps) = (has(NAL_SPS), has(NAL_PPS));
        if has_sps && has_pps {
            return frame;
        }

        let sets = self.parameter_sets.lock();
        let mut out = BytesMut::new();
        if !has_sps && let Some(sps) = &sets.sps {
            out.extend_from_slice(sps);
        }
        if !has_pps && let Some(pps) = &sets.pps {
            out.extend_from_slice(pps);
        }
        if out.is_empty() {
            return frame;
        }
        out.extend_from_slice(&frame);
        out.freeze()
    }

    /// Capture the next frame as a `data:image/jpeg;base64,...` URI.
    pub async fn capture_snapshot(&self) -> Result<String> {
        let mut frames = self.frames.subscribe();
        self.request_snapshot();

        let frame = match tokio::time::timeout(self.timeout, next_frame(&mut frames)).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Err(GatewayError::Encode("snapshot channel closed".into())),
            Err(_) => {
                // Other captures may still be waiting on the same request.
                if self.frames.receiver_count() == 1 {
                    let _ = self.request_rx.lock().try_recv();
                }
                tracing::warn!(timeout = ?self.timeout, "no keyframe arrived for snapshot");
                return Err(GatewayError::Timeout("snapshot frame"));
            }
        };
        drop(frames);

        if frame.is_empty() {
            return Err(GatewayError::Encode("empty frame captured".into()));
        }
        tracing::info!(bytes = frame.len(), "captured frame for snapshot");

        let jpeg = match self.encoder.encode_jpeg(self.decodable(frame)).await {
            Ok(jpeg) => jpeg,
            Err(e) => {
                tracing::warn!(error = %e, "snapshot encode failed, using placeholder");
                placeholder_jpeg()?
            }
        };
        Ok(to_data_uri(&jpeg))
    }
}

async fn next_frame(frames: &mut broadcast::Receiver<Bytes>) -> Option<Bytes> {
    loop {
        match frames.recv().await {
            Ok(frame) => return Some(frame),
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::split_units;

    struct Echo;

    #[async_trait]
    impl StillEncoder for Echo {
        async fn encode_jpeg(&self, h264: Bytes) -> Result<Vec<u8>> {
            Ok(h264.to_vec())
        }
    }

    struct Broken;

    #[async_trait]
    impl StillEncoder for Broken {
        async fn encode_jpeg(&self, _: Bytes) -> Result<Vec<u8>> {
            Err(GatewayError::Encode("no ffmpeg".into()))
        }
    }

    fn service(encoder: Arc<dyn StillEncoder>) -> Arc<SnapshotService> {
        Arc::new(SnapshotService::new(encoder, Duration::from_millis(500)))
    }

    fn offer(service: &SnapshotService, frame: &'static [u8]) {
        let frame = Bytes::from_static(frame);
        let units = split_units(&frame);
        service.offer_frame(&frame, &units);
    }

    fn decode_uri(uri: &str) -> Vec<u8> {
        let b64 = uri.strip_prefix(DATA_URI_PREFIX).unwrap();
        STANDARD.decode(b64).unwrap()
    }

    #[test]
    fn placeholder_is_a_jpeg() {
        let jpeg = placeholder_jpeg().unwrap();
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xff, 0xd9]);
    }

    #[test]
    fn duplicate_requests_are_dropped() {
        let service = service(Arc::new(Echo));
        assert!(service.request_snapshot());
        assert!(!service.request_snapshot());
        assert!(service.is_pending());
    }

    #[test]
    fn frames_without_request_are_ignored() {
        let service = service(Arc::new(Echo));
        let mut rx = service.frames.subscribe();
        offer(&service, &[0, 0, 0, 1, 0x65, 0x88]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn pending_request_takes_exactly_one_frame() {
        let service = service(Arc::new(Echo));
        let mut rx = service.frames.subscribe();
        service.request_snapshot();
        offer(&service, &[0, 0, 0, 1, 0x65, 0x01]);
        offer(&service, &[0, 0, 0, 1, 0x65, 0x02]);
        assert!(!service.is_pending());
        assert_eq!(rx.try_recv().unwrap().as_ref(), &[0, 0, 0, 1, 0x65, 0x01]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn only_keyframes_answer_a_request() {
        let service = service(Arc::new(Echo));
        let mut rx = service.frames.subscribe();
        service.request_snapshot();

        offer(&service, &[0, 0, 0, 1, 0x67, 0x42]);
        offer(&service, &[0, 0, 0, 1, 0x06, 0x05]);
        offer(&service, &[0, 0, 0, 1, 0x41, 0x9a]);
        assert!(service.is_pending());
        assert!(rx.try_recv().is_err());

        offer(&service, &[0, 0, 0, 1, 0x65, 0x88]);
        assert!(!service.is_pending());
        assert_eq!(rx.try_recv().unwrap().as_ref(), &[0, 0, 0, 1, 0x65, 0x88]);
    }

    #[tokio::test]
    async fn capture_prepends_cached_parameter_sets() {
        let service = service(Arc::new(Echo));
        offer(&service, &[0, 0, 0, 1, 0x67, 0x42]);
        offer(&service, &[0, 0, 0, 1, 0x68, 0xce]);

        let capture = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.capture_snapshot().await }
        });
        while !service.is_pending() {
            tokio::task::yield_now().await;
        }
        offer(&service, &[0, 0, 0, 1, 0x65, 0x88]);

        let uri = capture.await.unwrap().unwrap();
        assert_eq!(
            decode_uri(&uri),
            vec![0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0xce, 0, 0, 0, 1, 0x65, 0x88]
        );
    }

    #[tokio::test]
    async fn encoder_failure_falls_back_to_placeholder() {
        let service = service(Arc::new(Broken));
        let capture = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.capture_snapshot().await }
        });
        while !service.is_pending() {
            tokio::task::yield_now().await;
        }
        offer(&service, &[0, 0, 0, 1, 0x65, 0x88]);

        let uri = capture.await.unwrap().unwrap();
        assert_eq!(decode_uri(&uri), placeholder_jpeg().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn capture_times_out_without_frames() {
        let service = service(Arc::new(Echo));
        let err = service.capture_snapshot().await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout(_)));
        assert!(!service.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_captures_share_one_timeout() {
        let service = service(Arc::new(Echo));
        let started = tokio::time::Instant::now();

        let results = futures::future::join_all((0..3).map(|_| service.capture_snapshot())).await;

        assert!(
            results
                .iter()
                .all(|r| matches!(r, Err(GatewayError::Timeout(_))))
        );
        assert!(started.elapsed() < Duration::from_millis(600));
        assert!(!service.is_pending());
    }

    #[tokio::test]
    async fn one_keyframe_answers_every_waiting_capture() {
        let service = service(Arc::new(Echo));
        let captures: Vec<_> = (0..3)
            .map(|_| {
                let service = Arc::clone(&service);
                tokio::spawn(async move { service.capture_snapshot().await })
            })
            .collect();
        while service.frames.receiver_count() < 3 || !service.is_pending() {
            tokio::task::yield_now().await;
        }

        offer(&service, &[0, 0, 0, 1, 0x65, 0x88]);

        for capture in captures {
            let uri = capture.await.unwrap().unwrap();
            assert_eq!(decode_uri(&uri), vec![0, 0, 0, 1, 0x65, 0x88]);
        }
        assert!(!service.is_pending());
    }
}
