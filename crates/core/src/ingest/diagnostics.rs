//! Classification of decoder diagnostic output.
//!
//! ffmpeg writes everything to stderr: banners, stream info, progress and
//! real failures. Lines are bucketed by keyword so that real failures stand
//! out in the log while routine chatter stays at debug.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use super::SourceKind;

/// Decoder messages that look like errors but are recovered from on the
/// next key frame (broken reference picture sets, concealed macroblocks,
/// parameter sets referenced before the first SPS/PPS arrives).
const RECOVERABLE: &[&str] = &[
    "Could not find ref with POC",
    "Error constructing the frame RPS",
    "error while decoding MB",
    "concealing",
    "non-existing PPS",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Debug,
}

pub fn classify(line: &str) -> Severity {
    if RECOVERABLE.iter().any(|p| line.contains(p)) {
        return Severity::Debug;
    }
    let lower = line.to_ascii_lowercase();
    if lower.contains("error") || lower.contains("failed") {
        Severity::Error
    } else if lower.contains("warning") {
        Severity::Warning
    } else {
        Severity::Debug
    }
}

/// Log every line of `stream` at its classified severity until EOF.
pub(crate) async fn drain<R>(stream: R, source: SourceKind)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                match classify(line) {
                    Severity::Error => tracing::error!(source = %source, "ffmpeg: {line}"),
                    Severity::Warning => tracing::warn!(source = %source, "ffmpeg: {line}"),
                    Severity::Debug => tracing::debug!(source = %source, "ffmpeg: {line}"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(source = %source, error = %e, "decoder stderr closed");
                break;
            }
        }
    }
}
