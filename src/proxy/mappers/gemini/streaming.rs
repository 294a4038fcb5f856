// SSE rewrite (v1internal envelope -> public Gemini shape)
// Line-oriented; works on bytes so multi-byte characters split across chunks stay intact

use bytes::{Bytes, BytesMut};
use serde_json::{json, Value};

use super::wrapper::unwrap_response;
use crate::error::google_status;
use crate::proxy::common::ErrorClassification;

/// Incremental chunk rewriter shared by the SSE and JSON body paths
pub trait ChunkTransformer: Send {
    /// Feed a chunk, get back whatever is complete
    fn push(&mut self, chunk: &[u8]) -> Bytes;

    /// Emit anything still buffered at end of stream
    fn flush(&mut self) -> Bytes;
}

/// Longest partial line held back while waiting for its newline
pub const MAX_LINE_BUFFER: usize = 1024 * 1024;

pub struct SseTransformer {
    buffer: BytesMut,
    /// Prefix of `buffer` already known to hold no newline
    scanned: usize,
    max_buffer: usize,
    /// An oversized line was passed through raw; forward bytes until its newline
    overflowed: bool,
    lines: u64,
    rewritten: u64,
}

impl Default for SseTransformer {
    fn default() -> Self {
        Self::with_limit(MAX_LINE_BUFFER)
    }
}

impl SseTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_buffer: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            scanned: 0,
            max_buffer,
            overflowed: false,
            lines: 0,
            rewritten: 0,
        }
    }

    /// (lines seen, data lines rewritten)
    pub fn stats(&self) -> (u64, u64) {
        (self.lines, self.rewritten)
    }

    fn transform_line(&mut self, line: &[u8], out: &mut BytesMut) {
        self.lines += 1;
        let (content, terminator) = split_terminator(line);
        match rewrite_data_line(content) {
            Some(rewritten) => {
                self.rewritten += 1;
                out.extend_from_slice(rewritten.as_bytes());
                out.extend_from_slice(terminator);
            }
            None => out.extend_from_slice(line),
        }
    }
}

impl ChunkTransformer for SseTransformer {
    fn push(&mut self, chunk: &[u8]) -> Bytes {
        let mut out = BytesMut::new();
        let mut chunk = chunk;

        if self.overflowed {
            match chunk.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    out.extend_from_slice(&chunk[..=pos]);
                    chunk = &chunk[pos + 1..];
                    self.overflowed = false;
                }
                None => {
                    out.extend_from_slice(chunk);
                    return out.freeze();
                }
            }
        }

        self.buffer.extend_from_slice(chunk);
        while let Some(pos) = self.buffer[self.scanned..].iter().position(|&b| b == b'\n') {
            let line = self.buffer.split_to(self.scanned + pos + 1);
            self.scanned = 0;
            self.transform_line(&line, &mut out);
        }
        self.scanned = self.buffer.len();

        if self.buffer.len() > self.max_buffer {
            tracing::warn!(
                "[Gemini-SSE] Line exceeded {} bytes without a newline, passing it through raw",
                self.max_buffer
            );
            self.lines += 1;
            out.extend_from_slice(&self.buffer.split());
            self.scanned = 0;
            self.overflowed = true;
        }
        out.freeze()
    }

    fn flush(&mut self) -> Bytes {
        self.overflowed = false;
        self.scanned = 0;
        if self.buffer.is_empty() {
            return Bytes::new();
        }
        let rest = self.buffer.split();
        let mut out = BytesMut::new();
        self.transform_line(&rest, &mut out);
        out.freeze()
    }
}

/// Split `\n` / `\r\n` off the end of a line
fn split_terminator(line: &[u8]) -> (&[u8], &[u8]) {
    let content_len = if line.ends_with(b"\r\n") {
        line.len() - 2
    } else if line.ends_with(b"\n") {
        line.len() - 1
    } else {
        line.len()
    };
    line.split_at(content_len)
}

/// `data: <json>` -> `data: <unwrapped json>`. None means pass the line through as is.
fn rewrite_data_line(content: &[u8]) -> Option<String> {
    let payload = content.strip_prefix(b"data:")?;
    let payload = payload.strip_prefix(b" ").unwrap_or(payload);
    let text = std::str::from_utf8(payload).ok()?.trim();
    if text.is_empty() || text == "[DONE]" {
        return None;
    }
    match serde_json::from_str::<Value>(text) {
        Ok(value) => {
            let unwrapped = unwrap_response(value);
            let serialized = serde_json::to_string(&unwrapped).ok()?;
            Some(format!("data: {}", serialized))
        }
        Err(e) => {
            tracing::debug!("[Gemini-SSE] JSON parse error: {}, passing raw line", e);
            None
        }
    }
}

/// Terminal event for a stream that fails after headers were sent
pub fn sse_error_event(classification: &ErrorClassification) -> Bytes {
    let payload = json!({
        "error": {
            "code": classification.status_code,
            "message": classification.message,
            "status": google_status(classification.status_code),
        }
    });
    Bytes::from(format!(
        "event: error\ndata: {}\n\n",
        serde_json::to_string(&payload).unwrap_or_default()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::common::error_classifier::classify_status;

    fn run(chunks: &[&[u8]]) -> Vec<u8> {
        let mut t = SseTransformer::new();
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend_from_slice(&t.push(chunk));
        }
        out.extend_from_slice(&t.flush());
        out
    }

    #[test]
    fn test_rewrites_data_line() {
        let out = run(&[b"data: {\"response\":{\"candidates\":[1]}}\n"]);
        assert_eq!(out, b"data: {\"candidates\":[1]}\n");
    }

    #[test]
    fn test_malformed_json_is_byte_identical() {
        let input = b"data: {not json}\n";
        assert_eq!(run(&[input]), input.to_vec());
    }

    #[test]
    fn test_non_data_lines_pass_through() {
        let input = b": keepalive\nevent: message\n\ndata: [DONE]\n";
        assert_eq!(run(&[input]), input.to_vec());
    }

    #[test]
    fn test_line_split_across_chunks() {
        let out = run(&[
            b"data: {\"resp",
            b"onse\":{\"a\":1}}\n\ndata: {\"response\"",
            b":{\"b\":2}}\n",
        ]);
        assert_eq!(out, b"data: {\"a\":1}\n\ndata: {\"b\":2}\n");
    }

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        let line = "data: {\"response\":{\"text\":\"héllo 世界\"}}\n".as_bytes();
        // split inside the three-byte '世'
        let cut = line.iter().position(|&b| b == 0xE4).unwrap() + 1;
        let out = run(&[&line[..cut], &line[cut..]]);
        assert_eq!(String::from_utf8(out).unwrap(), "data: {\"text\":\"héllo 世界\"}\n");
    }

    #[test]
    fn test_crlf_terminator_kept() {
        let out = run(&[b"data: {\"response\":{\"a\":1}}\r\n"]);
        assert_eq!(out, b"data: {\"a\":1}\r\n");
    }

    #[test]
    fn test_flush_rewrites_complete_trailing_line() {
        let mut t = SseTransformer::new();
        assert!(t.push(b"data: {\"response\":{\"a\":1}}").is_empty());
        assert_eq!(&t.flush()[..], b"data: {\"a\":1}");
        assert!(t.flush().is_empty());
    }

    #[test]
    fn test_flush_passes_partial_line() {
        let mut t = SseTransformer::new();
        t.push(b"data: {\"response\":");
        assert_eq!(&t.flush()[..], b"data: {\"response\":");
    }

    #[test]
    fn test_oversized_line_passes_through_raw() {
        let mut t = SseTransformer::with_limit(16);
        let mut out = Vec::new();
        out.extend_from_slice(&t.push(b"data: {\"response\":{\"text\":\""));
        // beyond the limit, bytes are forwarded without buffering
        assert_eq!(out, b"data: {\"response\":{\"text\":\"");
        out.extend_from_slice(&t.push(b"xxxxxxxxxxxxxxxxxxxxxxxx"));
        out.extend_from_slice(&t.push(b"\"}}\ndata: {\"response\":{\"a\":1}}\n"));
        out.extend_from_slice(&t.flush());

        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "data: {\"response\":{\"text\":\"xxxxxxxxxxxxxxxxxxxxxxxx\"}}\ndata: {\"a\":1}\n"
        );
        assert!(t.buffer.is_empty());
    }

    #[test]
    fn test_many_small_chunks_without_newline_stay_buffered() {
        let mut t = SseTransformer::new();
        for _ in 0..1000 {
            assert!(t.push(b"ab").is_empty());
        }
        assert_eq!(t.scanned, 2000);
        let out = t.push(b"\n");
        assert_eq!(out.len(), 2001);
        assert_eq!(t.scanned, 0);
    }

    #[test]
    fn test_error_event_shape() {
        let event = sse_error_event(&classify_status(503, "backend unavailable"));
        let text = String::from_utf8(event.to_vec()).unwrap();
        assert!(text.starts_with("event: error\ndata: "));
        assert!(text.ends_with("\n\n"));
        assert!(text.contains("\"code\":503"));
    }
}
