//! Multiplexed log stream framing.
//!
//! Engines that combine stdout and stderr into one byte stream prefix every
//! chunk of output with an 8-byte header:
//!
//! | byte(s) | meaning                                            |
//! |---------|----------------------------------------------------|
//! | 0       | stream tag: 0 stdin, 1 stdout, 2 stderr            |
//! | 1–3     | unused                                             |
//! | 4–7     | payload length, big-endian `u32`                   |
//!
//! [`FrameCodec`] decodes that stream into [`LogFrame`]s for use with
//! [`tokio_util::codec::FramedRead`] or a manual decode loop, and encodes
//! frames back for fake engines and tests.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::{AppError, Result};

/// Size of the per-frame header.
pub const HEADER_LEN: usize = 8;

/// Largest payload the decoder will buffer: 16 MiB.
///
/// Larger announced lengths are reported as [`AppError::Frame`] and their
/// payload is skipped so decoding can resume at the next header.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Which output stream a frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl StreamKind {
    /// Map a header tag onto a stream kind.
    ///
    /// Only `2` means stderr. Every other value, including stdin (`0`) and
    /// the undocumented `3` some engines emit, is normalized to stdout.
    #[must_use]
    pub fn from_tag(tag: u8) -> Self {
        if tag == 2 {
            Self::Stderr
        } else {
            Self::Stdout
        }
    }

    /// Header tag for this kind.
    #[must_use]
    pub fn tag(self) -> u8 {
        match self {
            Self::Stdout => 1,
            Self::Stderr => 2,
        }
    }

    /// `"stdout"` or `"stderr"`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// One decoded unit of a multiplexed log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFrame {
    /// Stream the payload was written to.
    pub kind: StreamKind,
    /// Raw payload bytes.
    pub payload: Bytes,
}

impl LogFrame {
    /// A stdout frame.
    #[must_use]
    pub fn stdout(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: StreamKind::Stdout,
            payload: payload.into(),
        }
    }

    /// A stderr frame.
    #[must_use]
    pub fn stderr(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: StreamKind::Stderr,
            payload: payload.into(),
        }
    }

    /// Payload as text, replacing invalid UTF-8.
    #[must_use]
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Decoder/encoder for the 8-byte-header multiplexed format.
///
/// # Decoder
///
/// Yields one [`LogFrame`] per non-empty frame. Zero-length frames are
/// consumed silently. Errors:
///
/// - [`AppError::Frame`]`("frame too large: …")` when a header announces more
///   than [`MAX_FRAME_BYTES`]; the payload is discarded and the codec stays
///   usable.
/// - [`AppError::Frame`]`("truncated frame: …")` from `decode_eof` when the
///   stream ends inside a header or payload.
///
/// Note that [`tokio_util::codec::FramedRead`] ends the stream after the first
/// decoder error; callers that must survive bad frames drive the codec
/// manually.
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Payload bytes of an oversized frame still to be skipped.
    discard: usize,
}

impl FrameCodec {
    /// Create a codec positioned at a frame boundary.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the codec is still skipping the payload of an oversized frame.
    #[must_use]
    pub fn is_skipping(&self) -> bool {
        self.discard > 0
    }
}

impl Decoder for FrameCodec {
    type Item = LogFrame;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<LogFrame>> {
        loop {
            if self.discard > 0 {
                let skip = self.discard.min(src.len());
                src.advance(skip);
                self.discard -= skip;
                if self.discard > 0 {
                    return Ok(None);
                }
            }

            if src.len() < HEADER_LEN {
                src.reserve(HEADER_LEN - src.len());
                return Ok(None);
            }

            let tag = src[0];
            let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;

            if len > MAX_FRAME_BYTES {
                src.advance(HEADER_LEN);
                self.discard = len;
                return Err(AppError::Frame(format!(
                    "frame too large: {len} bytes exceeds {MAX_FRAME_BYTES}"
                )));
            }

            if src.len() < HEADER_LEN + len {
                src.reserve(HEADER_LEN + len - src.len());
                return Ok(None);
            }

            src.advance(HEADER_LEN);
            let payload = src.split_to(len).freeze();

            if payload.is_empty() {
                continue;
            }

            if !matches!(tag, 1 | 2) {
                debug!(tag, "normalizing unknown stream tag to stdout");
            }

            return Ok(Some(LogFrame {
                kind: StreamKind::from_tag(tag),
                payload,
            }));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<LogFrame>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        if src.is_empty() && self.discard == 0 {
            return Ok(None);
        }

        let remaining = src.len();
        let missing = self.discard;
        src.clear();
        self.discard = 0;
        Err(AppError::Frame(format!(
            "truncated frame: {remaining} bytes buffered, {missing} payload bytes never arrived"
        )))
    }
}

impl Encoder<LogFrame> for FrameCodec {
    type Error = AppError;

    fn encode(&mut self, frame: LogFrame, dst: &mut BytesMut) -> Result<()> {
        let len = u32::try_from(frame.payload.len())
            .map_err(|_| AppError::Frame("payload longer than u32::MAX".into()))?;
        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_u8(frame.kind.tag());
        dst.put_bytes(0, 3);
        dst.put_u32(len);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

/// Encode a sequence of frames into one multiplexed buffer.
///
/// # Errors
///
/// Returns [`AppError::Frame`] if a payload does not fit a `u32` length.
pub fn encode_frames<I>(frames: I) -> Result<Bytes>
where
    I: IntoIterator<Item = LogFrame>,
{
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    for frame in frames {
        codec.encode(frame, &mut buf)?;
    }
    Ok(buf.freeze())
}
