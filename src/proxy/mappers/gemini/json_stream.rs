// Depth-tracked JSON stream rewrite for large non-SSE bodies.
// Each complete top-level object is unwrapped and emitted as soon as it closes;
// bytes between objects (`[`, `,`, `]`, whitespace) pass through verbatim.

use bytes::{Bytes, BytesMut};
use serde_json::Value;

use super::streaming::ChunkTransformer;
use super::wrapper::unwrap_response;

/// Largest partial object held before salvaging it
pub const MAX_OBJECT_BUFFER: usize = 1024 * 1024;

pub struct JsonStreamTransformer {
    buffer: Vec<u8>,
    /// Expected closers for open `{` / `[` inside the current object
    stack: Vec<u8>,
    in_string: bool,
    escaped: bool,
    /// Skipping the tail of an object that was already salvaged
    truncating: bool,
    max_buffer: usize,
    objects: u64,
    salvaged: u64,
}

impl Default for JsonStreamTransformer {
    fn default() -> Self {
        Self::with_limit(MAX_OBJECT_BUFFER)
    }
}

impl JsonStreamTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_buffer: usize) -> Self {
        Self {
            buffer: Vec::new(),
            stack: Vec::new(),
            in_string: false,
            escaped: false,
            truncating: false,
            max_buffer,
            objects: 0,
            salvaged: 0,
        }
    }

    /// (objects emitted, objects salvaged)
    pub fn stats(&self) -> (u64, u64) {
        (self.objects, self.salvaged)
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.stack.clear();
        self.in_string = false;
        self.escaped = false;
        self.truncating = false;
    }

    /// Advance the string/depth state by one byte. True when the top-level object closed.
    fn advance(&mut self, b: u8) -> bool {
        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if b == b'\\' {
                self.escaped = true;
            } else if b == b'"' {
                self.in_string = false;
            }
            return false;
        }
        match b {
            b'"' => self.in_string = true,
            b'{' => self.stack.push(b'}'),
            b'[' => self.stack.push(b']'),
            b'}' | b']' => {
                self.stack.pop();
                return self.stack.is_empty();
            }
            _ => {}
        }
        false
    }

    fn emit_object(&mut self, out: &mut BytesMut) {
        self.objects += 1;
        match serde_json::from_slice::<Value>(&self.buffer) {
            Ok(value) => match serde_json::to_vec(&unwrap_response(value)) {
                Ok(bytes) => out.extend_from_slice(&bytes),
                Err(_) => out.extend_from_slice(&self.buffer),
            },
            Err(e) => {
                tracing::debug!("JSON stream object did not parse ({}), passing through", e);
                out.extend_from_slice(&self.buffer);
            }
        }
        self.reset();
    }

    /// Close whatever is open and try to parse; fall back to the raw bytes
    fn salvage(&mut self, out: &mut BytesMut) {
        self.salvaged += 1;
        tracing::warn!(
            "JSON stream object exceeded {} bytes at depth {}, truncating",
            self.max_buffer,
            self.stack.len()
        );
        let mut closed = self.buffer.clone();
        if self.in_string {
            if self.escaped {
                closed.pop();
            }
            closed.push(b'"');
        }
        while closed.last().is_some_and(|b| b.is_ascii_whitespace() || *b == b',' || *b == b':') {
            closed.pop();
        }
        closed.extend(self.stack.iter().rev());

        match serde_json::from_slice::<Value>(&closed) {
            Ok(value) => match serde_json::to_vec(&unwrap_response(value)) {
                Ok(bytes) => out.extend_from_slice(&bytes),
                Err(_) => out.extend_from_slice(&self.buffer),
            },
            Err(_) => out.extend_from_slice(&self.buffer),
        }
        // Keep the depth state so the rest of this object is skipped
        self.buffer.clear();
        self.truncating = true;
    }
}

impl ChunkTransformer for JsonStreamTransformer {
    fn push(&mut self, chunk: &[u8]) -> Bytes {
        let mut out = BytesMut::new();

        for &b in chunk {
            if self.stack.is_empty() {
                if b == b'{' {
                    self.buffer.push(b);
                    self.stack.push(b'}');
                } else {
                    out.extend_from_slice(&[b]);
                }
                continue;
            }

            if !self.truncating {
                self.buffer.push(b);
            }

            if self.advance(b) {
                if self.truncating {
                    self.reset();
                } else {
                    self.emit_object(&mut out);
                }
                continue;
            }

            if !self.truncating && self.buffer.len() > self.max_buffer {
                self.salvage(&mut out);
            }
        }

        out.freeze()
    }

    fn flush(&mut self) -> Bytes {
        if self.truncating {
            self.reset();
            return Bytes::new();
        }
        if self.buffer.is_empty() {
            return Bytes::new();
        }
        tracing::warn!(
            "JSON stream ended inside an object ({} bytes buffered), passing through",
            self.buffer.len()
        );
        let rest = Bytes::from(std::mem::take(&mut self.buffer));
        self.reset();
        rest
    }
}
