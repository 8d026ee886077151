//! Line splitting for chunked byte streams.
//!
//! Chunks arrive at arbitrary boundaries; [`LineBuffer`] keeps the partial
//! tail between pushes and hands out complete lines with the terminator
//! (`\n` or `\r\n`) removed.

use bytes::BytesMut;
use tracing::warn;

pub struct LineBuffer {
    buffer: BytesMut,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete line, if one is buffered. Lines that are not valid
    /// UTF-8 are dropped.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let newline_pos = self.buffer.iter().position(|&b| b == b'\n')?;
            let mut line_bytes = self.buffer.split_to(newline_pos + 1);
            line_bytes.truncate(line_bytes.len() - 1);
            if line_bytes.last() == Some(&b'\r') {
                line_bytes.truncate(line_bytes.len() - 1);
            }

            match String::from_utf8(line_bytes.to_vec()) {
                Ok(line) => return Some(line),
                Err(e) => {
                    warn!(error = %e, "skipping line with invalid UTF-8");
                }
            }
        }
    }

    /// Drain whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = self.buffer.split();
        let mut rest: &[u8] = &rest;
        if rest.last() == Some(&b'\r') {
            rest = &rest[..rest.len() - 1];
        }
        match std::str::from_utf8(rest) {
            Ok(line) => Some(line.to_string()),
            Err(e) => {
                warn!(error = %e, "dropping trailing bytes with invalid UTF-8");
                None
            }
        }
    }

    /// Bytes held that do not yet form a complete line.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
