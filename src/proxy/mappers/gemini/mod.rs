// Gemini mapper module
// Responsible for v1internal wrapping/unwrapping and streaming rewrite

pub mod json_stream;
pub mod path;
pub mod streaming;
pub mod wrapper;

pub use json_stream::JsonStreamTransformer;
pub use path::{parse_model_path, ModelPath};
pub use streaming::{sse_error_event, ChunkTransformer, SseTransformer};
pub use wrapper::{build_upstream_request, unwrap_response, upstream_method};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use std::pin::Pin;

use crate::error::AppError;
use crate::proxy::common::classify_error;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Invoked once when the upstream body ends; carries the sanitized failure message if it broke off
pub type StreamCompletion = Box<dyn FnOnce(Option<String>) + Send>;

/// Upstream SSE -> client SSE. A mid-stream failure becomes one terminal `event: error`.
pub fn create_sse_stream<S, E>(upstream: S, on_complete: StreamCompletion) -> ByteStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<AppError> + Send + 'static,
{
    create_transformed_stream(upstream, SseTransformer::new(), true, on_complete)
}

/// Large JSON body rewrite. A mid-stream failure aborts the body.
pub fn create_json_stream<S, E>(upstream: S, on_complete: StreamCompletion) -> ByteStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<AppError> + Send + 'static,
{
    create_transformed_stream(upstream, JsonStreamTransformer::new(), false, on_complete)
}

/// Bytes needed after `emitted_tail` (the last bytes sent) to start a fresh SSE event
fn event_separator(emitted_tail: &[u8]) -> &'static [u8] {
    if emitted_tail.is_empty() || emitted_tail.ends_with(b"\n\n") {
        b""
    } else if emitted_tail.ends_with(b"\n") {
        b"\n"
    } else {
        b"\n\n"
    }
}

fn remember_tail(tail: &mut Vec<u8>, out: &[u8]) {
    tail.extend_from_slice(&out[out.len().saturating_sub(2)..]);
    let excess = tail.len().saturating_sub(2);
    tail.drain(..excess);
}

fn create_transformed_stream<S, E, T>(
    upstream: S,
    transformer: T,
    sse_errors: bool,
    on_complete: StreamCompletion,
) -> ByteStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<AppError> + Send + 'static,
    T: ChunkTransformer + 'static,
{
    use async_stream::stream;
    use futures::StreamExt;

    Box::pin(stream! {
        let mut upstream = Box::pin(upstream);
        let mut transformer = transformer;
        let mut failure = None;
        let mut emitted_tail: Vec<u8> = Vec::with_capacity(2);

        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => {
                    let out = transformer.push(&bytes);
                    if !out.is_empty() {
                        remember_tail(&mut emitted_tail, &out);
                        yield Ok(out);
                    }
                }
                Err(e) => {
                    let classification = classify_error(&e.into());
                    tracing::error!("[Gemini-Stream] Upstream error: {}", classification.message);
                    failure = Some(classification);
                    break;
                }
            }
        }

        let tail = transformer.flush();
        if sse_errors && failure.is_some() && !tail.ends_with(b"\n") {
            // half a line never reaches the client, the error event follows instead
            tracing::debug!("[Gemini-Stream] Dropping {} bytes of truncated SSE line", tail.len());
        } else if !tail.is_empty() {
            remember_tail(&mut emitted_tail, &tail);
            yield Ok(tail);
        }

        match failure {
            Some(classification) => {
                on_complete(Some(classification.message.clone()));
                if sse_errors {
                    let mut event = BytesMut::from(event_separator(&emitted_tail));
                    event.extend_from_slice(&sse_error_event(&classification));
                    yield Ok(event.freeze());
                } else {
                    yield Err(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        classification.message,
                    ));
                }
            }
            None => on_complete(None),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_sse_stream_rewrites_and_completes() {
        let chunks: Vec<Result<Bytes, reqwest::Error>> = vec![
            Ok(Bytes::from_static(b"data: {\"response\":{\"a\"")),
            Ok(Bytes::from_static(b":1}}\n\n")),
        ];
        let done = Arc::new(Mutex::new(None));
        let recorded = done.clone();
        let stream = create_sse_stream(
            futures::stream::iter(chunks),
            Box::new(move |outcome| {
                *recorded.lock().unwrap() = Some(outcome);
            }),
        );

        let out: Vec<u8> = stream
            .map(|r| r.unwrap().to_vec())
            .collect::<Vec<_>>()
            .await
            .concat();
        assert_eq!(out, b"data: {\"a\":1}\n\n");
        assert_eq!(*done.lock().unwrap(), Some(None));
    }

    fn broken_pipe() -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::BrokenPipe, "connection reset")
    }

    async fn collect_sse(
        chunks: Vec<Result<Bytes, std::io::Error>>,
    ) -> (String, Option<Option<String>>) {
        let done = Arc::new(Mutex::new(None));
        let recorded = done.clone();
        let stream = create_sse_stream(
            futures::stream::iter(chunks),
            Box::new(move |outcome| {
                *recorded.lock().unwrap() = Some(outcome);
            }),
        );
        let out: Vec<u8> = stream
            .map(|r| r.unwrap().to_vec())
            .collect::<Vec<_>>()
            .await
            .concat();
        let outcome = done.lock().unwrap().clone();
        (String::from_utf8(out).unwrap(), outcome)
    }

    #[tokio::test]
    async fn test_sse_failure_mid_line_emits_separate_error_event() {
        let (text, outcome) = collect_sse(vec![
            Ok(Bytes::from_static(b"data: {\"response\":{\"a\":1}}\n\ndata: {\"resp")),
            Err(broken_pipe()),
        ])
        .await;

        assert!(text.starts_with("data: {\"a\":1}\n\nevent: error\ndata: {"));
        assert!(!text.contains("{\"resp"));
        assert!(text.ends_with("\n\n"));
        assert!(matches!(outcome, Some(Some(_))));
    }

    #[tokio::test]
    async fn test_sse_failure_after_open_event_closes_it_first() {
        let (text, _) = collect_sse(vec![
            Ok(Bytes::from_static(b"data: {\"response\":{\"a\":1}}\n")),
            Err(broken_pipe()),
        ])
        .await;

        assert!(text.starts_with("data: {\"a\":1}\n\nevent: error\n"));
    }

    #[tokio::test]
    async fn test_sse_failure_before_any_output() {
        let (text, _) = collect_sse(vec![Err(broken_pipe())]).await;
        assert!(text.starts_with("event: error\ndata: "));
    }

    #[test]
    fn test_event_separator() {
        assert_eq!(event_separator(b""), b"");
        assert_eq!(event_separator(b"\n\n"), b"");
        assert_eq!(event_separator(b"}\n"), b"\n");
        assert_eq!(event_separator(b"ab"), b"\n\n");

        let mut tail = Vec::new();
        remember_tail(&mut tail, b"data: x\n");
        remember_tail(&mut tail, b"\n");
        assert_eq!(tail, b"\n\n");
    }

    #[tokio::test]
    async fn test_json_stream_rewrites_array() {
        let chunks: Vec<Result<Bytes, reqwest::Error>> = vec![
            Ok(Bytes::from_static(b"[{\"response\":{\"a\":1}},")),
            Ok(Bytes::from_static(b"{\"response\":{\"a\":2}}]")),
        ];
        let stream = create_json_stream(futures::stream::iter(chunks), Box::new(|_| {}));
        let out: Vec<u8> = stream
            .map(|r| r.unwrap().to_vec())
            .collect::<Vec<_>>()
            .await
            .concat();
        assert_eq!(out, b"[{\"a\":1},{\"a\":2}]");
    }
}
