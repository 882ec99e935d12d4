use serde::Serialize;

use crate::ProtocolError;

/// Default ceiling for a single frame before the buffer gives up on it.
pub const DEFAULT_MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// Incremental newline framer.
///
/// Bytes are appended as they arrive from the socket; complete lines are
/// handed out one at a time and any partial tail stays buffered until the
/// next read supplies its terminator.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    // bytes already scanned for a newline, so repeated pushes stay linear
    scanned: usize,
    max_line: usize,
    discarding: bool,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::with_max_line(DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_line: max_line.max(1),
            discarding: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes held that do not yet form a complete line.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// Next complete, non-blank line without its terminator.
    ///
    /// Returns `None` when no full line is buffered. A line longer than the
    /// configured maximum is dropped in its entirety and reported once as
    /// [`ProtocolError::Oversized`]; framing resumes after its newline.
    pub fn next_line(&mut self) -> Option<Result<String, ProtocolError>> {
        loop {
            let newline = self.buf[self.scanned..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|pos| pos + self.scanned);

            let Some(end) = newline else {
                self.scanned = self.buf.len();
                if !self.discarding && self.buf.len() > self.max_line {
                    self.discarding = true;
                    self.buf.clear();
                    self.scanned = 0;
                    return Some(Err(ProtocolError::Oversized {
                        limit: self.max_line,
                    }));
                }
                if self.discarding {
                    self.buf.clear();
                    self.scanned = 0;
                }
                return None;
            };

            let mut line: Vec<u8> = self.buf.drain(..=end).collect();
            self.scanned = 0;
            if self.discarding {
                // tail of an oversized frame
                self.discarding = false;
                continue;
            }
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.len() > self.max_line {
                return Some(Err(ProtocolError::Oversized {
                    limit: self.max_line,
                }));
            }
            if line.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }
            return Some(String::from_utf8(line).map_err(|_| ProtocolError::NotUtf8));
        }
    }
}

/// Serialize a frame as one JSON document followed by `\n`.
pub fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut out = serde_json::to_vec(value)?;
    out.push(b'\n');
    Ok(out)
}
