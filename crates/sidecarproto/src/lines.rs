//! Reassembles newline-delimited lines from arbitrary stdout chunks.

use bytes::{Buf, BytesMut};

/// Lines longer than this are discarded instead of growing the buffer forever.
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Buffers partial input until a `\n` arrives.
///
/// Pipe reads split wherever the kernel pleases, so one read may hold half a
/// line or several. Push every chunk, then drain complete lines.
#[derive(Debug)]
pub struct LineAssembler {
    buf: BytesMut,
    max_line_bytes: usize,
    oversized: u64,
    discarding: bool,
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

impl LineAssembler {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            max_line_bytes,
            oversized: 0,
            discarding: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete line without its terminator (`\r\n` tolerated).
    ///
    /// Blank lines are skipped and invalid UTF-8 is replaced lossily; the JSON
    /// parser downstream decides whether what is left is usable.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let Some(pos) = self.buf.iter().position(|b| *b == b'\n') else {
                if self.buf.len() > self.max_line_bytes {
                    // No terminator in sight; drop what we have and resync on the next newline.
                    self.oversized += 1;
                    self.buf.clear();
                    self.discarding = true;
                }
                return None;
            };

            let raw = self.buf.split_to(pos);
            self.buf.advance(1);

            if self.discarding {
                // Tail of a line we already gave up on.
                self.discarding = false;
                continue;
            }

            let mut line = String::from_utf8_lossy(&raw).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }
            if line.trim().is_empty() {
                continue;
            }
            if line.len() > self.max_line_bytes {
                self.oversized += 1;
                continue;
            }
            return Some(line);
        }
    }

    /// Whatever is buffered without a terminator (used at EOF).
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.buf.is_empty() || self.discarding {
            self.buf.clear();
            return None;
        }
        let raw = self.buf.split();
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        (!line.is_empty()).then_some(line)
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Lines dropped for exceeding the length cap.
    pub fn oversized_count(&self) -> u64 {
        self.oversized
    }
}
