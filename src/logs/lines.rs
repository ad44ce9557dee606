//! Line-splitting mode over a multiplexed log stream.
//!
//! Readiness checks want lines, not frames. [`LogLineCodec`] reads raw
//! multiplexed output one logical line at a time, stripping the 8-byte frame
//! header once at the start of each logical line. Lines longer than the line
//! buffer are yielded as a prefix chunk followed by continuation chunks;
//! continuations are never header-stripped.
//!
//! Every logical line start is assumed to be a frame start. A frame holding
//! several lines therefore loses the first [`HEADER_LEN`] bytes of each line
//! after its first, and a short trailing line can eat into the next header.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use super::frame::HEADER_LEN;
use crate::{AppError, Result};

/// Line buffer size: 64 KiB. Longer lines are split into chunks.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// One chunk of a logical log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Line content without header or trailing newline.
    pub content: Bytes,
    /// Whether more chunks of the same logical line follow.
    pub is_prefix: bool,
}

impl LogLine {
    /// Content as text, replacing invalid UTF-8.
    #[must_use]
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }
}

/// Header-stripping line decoder.
#[derive(Debug)]
pub struct LogLineCodec {
    max_line: usize,
    /// True when the next byte starts a new logical line (and so a header).
    line_started: bool,
    /// Offset already scanned for `\n`, so rescans stay linear.
    next_index: usize,
}

impl LogLineCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }

    /// Create a codec with a custom line buffer size (minimum 1 byte).
    #[must_use]
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            max_line: max_line.max(1),
            line_started: true,
            next_index: 0,
        }
    }

    fn take(&mut self, src: &mut BytesMut, len: usize, consumed: usize, is_prefix: bool) -> LogLine {
        let mut content = src.split_to(consumed);
        content.truncate(len);
        if content.last() == Some(&b'\r') && !is_prefix {
            content.truncate(len - 1);
        }
        self.next_index = 0;
        self.line_started = !is_prefix;
        LogLine {
            content: content.freeze(),
            is_prefix,
        }
    }
}

impl Default for LogLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LogLineCodec {
    type Item = LogLine;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<LogLine>> {
        if self.line_started {
            // The header is consumed as a unit so newline bytes inside the
            // length field can never split a line.
            if src.len() < HEADER_LEN {
                return Ok(None);
            }
            src.advance(HEADER_LEN);
            self.line_started = false;
            self.next_index = 0;
        }

        let scan_end = src.len().min(self.max_line);
        if let Some(offset) = src[self.next_index..scan_end]
            .iter()
            .position(|b| *b == b'\n')
        {
            let newline = self.next_index + offset;
            return Ok(Some(self.take(src, newline, newline + 1, false)));
        }

        if src.len() >= self.max_line {
            let max = self.max_line;
            return Ok(Some(self.take(src, max, max, true)));
        }

        self.next_index = src.len();
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<LogLine>> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }

        if src.is_empty() {
            return Ok(None);
        }

        if self.line_started {
            let remaining = src.len();
            src.clear();
            return Err(AppError::Frame(format!(
                "truncated frame header: {remaining} of {HEADER_LEN} bytes"
            )));
        }

        let len = src.len();
        Ok(Some(self.take(src, len, len, false)))
    }
}
