use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::h264::{self, UnitKind};

/// Largest unit [`FrameReader`] will buffer before giving up on a stream.
/// A single high-resolution IDR picture can run to several megabytes.
pub const MAX_UNIT_SIZE: usize = 16 * 1024 * 1024;

const READ_CHUNK: usize = 64 * 1024;

/// One start-code-delimited unit of an Annex B byte stream.
///
/// The unit keeps its leading start code (`00 00 01` or `00 00 00 01`).
/// [`nal`](Self::nal) gives the bytes after it. A stream that never
/// contained a start code produces a single unit with an empty start code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameUnit {
    bytes: Bytes,
    start_code_len: usize,
}

impl FrameUnit {
    /// Full unit including its start code.
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    pub fn start_code(&self) -> &[u8] {
        &self.bytes[..self.start_code_len]
    }

    /// NAL payload without the start code.
    pub fn nal(&self) -> &[u8] {
        &self.bytes[self.start_code_len..]
    }

    pub fn kind(&self) -> UnitKind {
        h264::classify(self.nal())
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Find the next start code at or after `from`.
///
/// Returns `(position, length)`. A `00 00 01` preceded by a zero byte at or
/// above `floor` is reported as the 4-byte form so the zero is not left
/// dangling at the end of the previous unit.
fn find_start_code(data: &[u8], from: usize, floor: usize) -> Option<(usize, usize)> {
    if from >= data.len() {
        return None;
    }
    let offset = data[from..].windows(3).position(|w| w == [0, 0, 1])?;
    let i = from + offset;
    if i > floor && data[i - 1] == 0 {
        Some((i - 1, 4))
    } else {
        Some((i, 3))
    }
}

/// Split a complete buffer into units.
///
/// Bytes before the first start code are dropped, matching the streaming
/// splitter. A buffer without any start code yields itself as one unit.
pub fn split_units(data: &Bytes) -> Vec<FrameUnit> {
    let mut units = Vec::new();

    let Some((mut start, mut sc)) = find_start_code(data, 0, 0) else {
        if !data.is_empty() {
            units.push(FrameUnit {
                bytes: data.clone(),
                start_code_len: 0,
            });
        }
        return units;
    };

    loop {
        let content = start + sc;
        match find_start_code(data, content, content) {
            Some((next, next_sc)) => {
                units.push(FrameUnit {
                    bytes: data.slice(start..next),
                    start_code_len: sc,
                });
                start = next;
                sc = next_sc;
            }
            None => {
                units.push(FrameUnit {
                    bytes: data.slice(start..),
                    start_code_len: sc,
                });
                return units;
            }
        }
    }
}

/// Incremental Annex B splitter over arbitrarily sized chunks.
///
/// Feed bytes with [`push`](Self::push), drain complete units with
/// [`next_unit`](Self::next_unit), and call [`finish`](Self::finish) once
/// at end of stream to flush the unterminated tail. A start code split
/// across two chunks is never mistaken for a missing one: the scan resumes
/// two bytes before the previous end of buffer.
#[derive(Debug, Default)]
pub struct AnnexBSplitter {
    buf: BytesMut,
    /// Length of the start code sitting at `buf[0]`, once one was found.
    head: Option<usize>,
    scan_from: usize,
}

impl AnnexBSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes currently held back waiting for a terminating start code.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete unit, or `None` if more input is needed.
    pub fn next_unit(&mut self) -> Option<FrameUnit> {
        let sc = match self.head {
            Some(sc) => sc,
            None => {
                let (pos, sc) = find_start_code(&self.buf, 0, 0)?;
                if pos > 0 {
                    tracing::trace!(skipped = pos, "discarding bytes before first start code");
                    self.buf.advance(pos);
                }
                self.head = Some(sc);
                self.scan_from = sc;
                sc
            }
        };

        match find_start_code(&self.buf, self.scan_from, sc) {
            Some((next, next_sc)) => {
                let bytes = self.buf.split_to(next).freeze();
                self.head = Some(next_sc);
                self.scan_from = next_sc;
                Some(FrameUnit {
                    bytes,
                    start_code_len: sc,
                })
            }
            None => {
                self.scan_from = self.buf.len().saturating_sub(2).max(sc);
                None
            }
        }
    }

    /// Flush whatever is buffered as the final unit.
    ///
    /// Call only after [`next_unit`](Self::next_unit) returned `None`.
    pub fn finish(&mut self) -> Option<FrameUnit> {
        if self.buf.is_empty() {
            self.head = None;
            return None;
        }
        let start_code_len = self.head.take().unwrap_or(0);
        self.scan_from = 0;
        Some(FrameUnit {
            bytes: self.buf.split().freeze(),
            start_code_len,
        })
    }
}

/// Lazily frames an async byte stream (e.g. a decoder's stdout) into units.
///
/// The sequence is finite and not restartable: once end of stream has
/// been seen and the tail flushed, [`next_unit`](Self::next_unit) keeps
/// returning `Ok(None)`.
pub struct FrameReader<R> {
    inner: R,
    splitter: AnnexBSplitter,
    scratch: Vec<u8>,
    eof: bool,
    max_unit_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_unit_size(inner, MAX_UNIT_SIZE)
    }

    pub fn with_max_unit_size(inner: R, max_unit_size: usize) -> Self {
        Self {
            inner,
            splitter: AnnexBSplitter::new(),
            scratch: vec![0u8; READ_CHUNK],
            eof: false,
            max_unit_size,
        }
    }

    /// Read until the next unit is complete.
    ///
    /// Fails with [`io::ErrorKind::InvalidData`] if a single unit grows past
    /// the configured maximum.
    pub async fn next_unit(&mut self) -> io::Result<Option<FrameUnit>> {
        loop {
            if let Some(unit) = self.splitter.next_unit() {
                return Ok(Some(unit));
            }
            if self.eof {
                return Ok(self.splitter.finish());
            }
            if self.splitter.buffered() > self.max_unit_size {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "frame unit exceeds {} bytes without a terminating start code",
                        self.max_unit_size
                    ),
                ));
            }

            let n = self.inner.read(&mut self.scratch).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.splitter.push(&self.scratch[..n]);
            }
        }
    }
}
