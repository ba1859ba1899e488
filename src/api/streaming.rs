//! Streaming fan-out for SSE responses.
//!
//! An upstream byte stream is teed into independent consumers: the
//! client-facing branch (returned immediately, bytes unmodified), a
//! usage-extraction drain, and an optional fixture-capture drain. Each consumer
//! owns its own channel, so the client branch is structurally incapable of
//! being blocked or failed by the others. The side branches receive chunks via
//! `try_send` and simply miss data if they fall behind, and their drain loops
//! swallow their own errors.

use axum::body::Body;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

use crate::api::models::TokenUsage;
use crate::core::error_types::FailoverErrorType;
use crate::services::recorder::StreamCapture;
use crate::services::usage::SseUsageTracker;

const CLIENT_RELAY_BUFFER: usize = 32;
const SIDE_BRANCH_BUFFER: usize = 256;

/// Splits a byte stream into SSE events at blank-line boundaries.
#[derive(Debug, Default)]
pub struct SseEventScanner {
    buffer: Vec<u8>,
}

impl SseEventScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every event completed by this chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        loop {
            let Some((end, delim_len)) = find_event_boundary(&self.buffer) else {
                break;
            };
            let event: Vec<u8> = self.buffer.drain(..end + delim_len).collect();
            let text = String::from_utf8_lossy(&event[..end]).into_owned();
            if !text.trim().is_empty() {
                events.push(text);
            }
        }
        events
    }

    /// The trailing partial event, if the stream ended without a blank line.
    pub fn finish(self) -> Option<String> {
        let text = String::from_utf8_lossy(&self.buffer).into_owned();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

/// Locate the next blank-line event delimiter (`\n\n`, CRLF tolerated).
/// Returns the event's end offset and the delimiter length.
fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    for i in 0..buffer.len().saturating_sub(1) {
        if buffer[i..].starts_with(b"\r\n\r\n") {
            return Some((i, 4));
        }
        if buffer[i] == b'\n' && buffer[i + 1] == b'\n' {
            return Some((i, 2));
        }
    }
    None
}

/// Extract the `data:` payloads of one SSE event. The space after the colon is
/// optional; carriage returns are tolerated.
pub fn data_payloads(event: &str) -> Vec<&str> {
    event
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|payload| payload.strip_prefix(' ').unwrap_or(payload))
        .collect()
}

/// How a stream relay ended.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub ttft_ms: Option<u64>,
    pub duration_ms: u64,
    pub bytes_forwarded: u64,
    /// Set when the upstream timed out or errored mid-stream
    pub error: Option<FailoverErrorType>,
    pub client_disconnected: bool,
}

/// Receivers resolved once the stream's side branches drain. The usage future
/// resolves only after the extraction branch has consumed the whole stream.
#[derive(Debug)]
pub struct StreamHandles {
    pub usage: oneshot::Receiver<Option<TokenUsage>>,
    pub outcome: oneshot::Receiver<StreamOutcome>,
    pub capture: Option<oneshot::Receiver<StreamCapture>>,
}

/// Tee an upstream SSE byte stream into a client body plus out-of-band
/// usage/capture consumers.
///
/// The deadline is the upstream's configured timeout measured from request
/// start; hitting it cancels every branch of the tee.
pub fn spawn_stream_fanout<S>(
    upstream: S,
    deadline: tokio::time::Instant,
    started: Instant,
    capture_ceiling: Option<usize>,
) -> (Body, StreamHandles)
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + Unpin + 'static,
{
    let (client_tx, mut client_rx) =
        mpsc::channel::<Result<Bytes, std::io::Error>>(CLIENT_RELAY_BUFFER);
    let (usage_tx, usage_rx) = mpsc::channel::<Bytes>(SIDE_BRANCH_BUFFER);
    let (usage_done_tx, usage_done_rx) = oneshot::channel();
    let (outcome_tx, outcome_rx) = oneshot::channel();

    let (capture_chunk_tx, capture_done_rx) = match capture_ceiling {
        Some(ceiling) => {
            let (chunk_tx, chunk_rx) = mpsc::channel::<Bytes>(SIDE_BRANCH_BUFFER);
            let (done_tx, done_rx) = oneshot::channel();
            tokio::spawn(capture_drain(chunk_rx, done_tx, ceiling));
            (Some(chunk_tx), Some(done_rx))
        }
        None => (None, None),
    };

    tokio::spawn(usage_drain(usage_rx, usage_done_tx));
    tokio::spawn(relay(
        upstream,
        client_tx,
        usage_tx,
        capture_chunk_tx,
        outcome_tx,
        deadline,
        started,
    ));

    let body = Body::from_stream(async_stream::stream! {
        while let Some(item) = client_rx.recv().await {
            yield item;
        }
    });

    (
        body,
        StreamHandles {
            usage: usage_done_rx,
            outcome: outcome_rx,
            capture: capture_done_rx,
        },
    )
}

async fn relay<S>(
    mut upstream: S,
    client_tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
    usage_tx: mpsc::Sender<Bytes>,
    capture_tx: Option<mpsc::Sender<Bytes>>,
    outcome_tx: oneshot::Sender<StreamOutcome>,
    deadline: tokio::time::Instant,
    started: Instant,
) where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + Unpin + 'static,
{
    let mut ttft_ms: Option<u64> = None;
    let mut bytes_forwarded: u64 = 0;
    let mut error: Option<FailoverErrorType> = None;
    let mut client_disconnected = false;

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                // Cancels every branch of the tee: the upstream stream and all
                // senders drop when this task returns
                error = Some(FailoverErrorType::Timeout);
                break;
            }
            _ = client_tx.closed() => {
                // Client went away before the upstream finished; the stream is
                // abandoned, not failed
                client_disconnected = true;
                break;
            }
            item = upstream.next() => {
                match item {
                    None => break,
                    Some(Ok(chunk)) => {
                        if ttft_ms.is_none() {
                            ttft_ms = Some(started.elapsed().as_millis() as u64);
                        }
                        bytes_forwarded += chunk.len() as u64;

                        // Side branches must never block client delivery:
                        // a full/closed side channel drops the chunk there
                        let _ = usage_tx.try_send(chunk.clone());
                        if let Some(tx) = &capture_tx {
                            let _ = tx.try_send(chunk.clone());
                        }

                        if client_tx.send(Ok(chunk)).await.is_err() {
                            client_disconnected = true;
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        error = Some(crate::core::error_types::classify_transport_error(&err));
                        let _ = client_tx
                            .send(Err(std::io::Error::new(std::io::ErrorKind::Other, err)))
                            .await;
                        break;
                    }
                }
            }
        }
    }

    let _ = outcome_tx.send(StreamOutcome {
        ttft_ms,
        duration_ms: started.elapsed().as_millis() as u64,
        bytes_forwarded,
        error,
        client_disconnected,
    });
}

/// Drains the usage branch: scans SSE events, applies the extractor to every
/// `data:` payload, and resolves the usage future once the branch is dry.
/// Its own failures resolve the future with `None`, never more.
async fn usage_drain(
    mut rx: mpsc::Receiver<Bytes>,
    done_tx: oneshot::Sender<Option<TokenUsage>>,
) {
    let mut scanner = SseEventScanner::new();
    let mut tracker = SseUsageTracker::new();

    while let Some(chunk) = rx.recv().await {
        for event in scanner.push(&chunk) {
            for payload in data_payloads(&event) {
                tracker.observe_payload(payload);
            }
        }
    }
    if let Some(tail) = scanner.finish() {
        for payload in data_payloads(&tail) {
            tracker.observe_payload(payload);
        }
    }

    let _ = done_tx.send(tracker.finalize());
}

/// Drains the capture branch into a byte-capped event list. Cancels its
/// receiver once the ceiling is hit so a long stream costs nothing further.
async fn capture_drain(
    mut rx: mpsc::Receiver<Bytes>,
    done_tx: oneshot::Sender<StreamCapture>,
    ceiling: usize,
) {
    let mut scanner = SseEventScanner::new();
    let mut capture = StreamCapture::default();

    'outer: while let Some(chunk) = rx.recv().await {
        for event in scanner.push(&chunk) {
            if !capture.push_event(&event, ceiling) {
                break 'outer;
            }
        }
    }
    rx.close();

    if !capture.truncated {
        if let Some(tail) = scanner.finish() {
            capture.push_event(&tail, ceiling);
        }
    }

    let _ = done_tx.send(capture);
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[test]
    fn test_scanner_splits_on_blank_lines() {
        let mut scanner = SseEventScanner::new();
        let events = scanner.push(b"data: {\"a\":1}\n\ndata: {\"b\":2}\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], "data: {\"a\":1}");
        assert_eq!(events[1], "data: {\"b\":2}");
    }

    #[test]
    fn test_scanner_buffers_partial_events() {
        let mut scanner = SseEventScanner::new();
        assert!(scanner.push(b"data: {\"a\"").is_empty());
        let events = scanner.push(b":1}\n\n");
        assert_eq!(events, vec!["data: {\"a\":1}"]);
    }

    #[test]
    fn test_scanner_handles_crlf_delimiters() {
        let mut scanner = SseEventScanner::new();
        let events = scanner.push(b"data: {\"a\":1}\r\n\r\ndata: [DONE]\r\n\r\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], "data: {\"a\":1}");
    }

    #[test]
    fn test_scanner_finish_returns_tail() {
        let mut scanner = SseEventScanner::new();
        scanner.push(b"data: unfinished");
        assert_eq!(scanner.finish(), Some("data: unfinished".to_string()));

        let scanner = SseEventScanner::new();
        assert_eq!(scanner.finish(), None);
    }

    #[test]
    fn test_data_payloads() {
        assert_eq!(data_payloads("data: {\"a\":1}"), vec!["{\"a\":1}"]);
        // Space after the colon is optional
        assert_eq!(data_payloads("data:{\"a\":1}"), vec!["{\"a\":1}"]);
        assert_eq!(
            data_payloads("event: delta\r\ndata: {\"a\":1}\r"),
            vec!["{\"a\":1}"]
        );
        assert!(data_payloads(": comment\nevent: ping").is_empty());
    }

    fn sse_chunks(events: &[&str]) -> Vec<reqwest::Result<Bytes>> {
        events
            .iter()
            .map(|e| Ok(Bytes::from(format!("{}\n\n", e))))
            .collect()
    }

    async fn collect_body(body: Body) -> Vec<u8> {
        axum::body::to_bytes(body, usize::MAX).await.unwrap().to_vec()
    }

    #[tokio::test]
    async fn test_fanout_forwards_bytes_unchanged() {
        let chunks = sse_chunks(&[
            r#"data: {"choices":[{"delta":{"content":"hi"}}]}"#,
            r#"data: {"usage":{"prompt_tokens":10,"completion_tokens":5}}"#,
            "data: [DONE]",
        ]);
        let expected: Vec<u8> = chunks
            .iter()
            .map(|c| c.as_ref().unwrap().to_vec())
            .collect::<Vec<_>>()
            .concat();

        let (body, handles) = spawn_stream_fanout(
            stream::iter(chunks),
            tokio::time::Instant::now() + std::time::Duration::from_secs(5),
            Instant::now(),
            None,
        );

        assert_eq!(collect_body(body).await, expected);

        let usage = handles.usage.await.unwrap().unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.total_tokens, 15);

        let outcome = handles.outcome.await.unwrap();
        assert!(outcome.error.is_none());
        assert!(outcome.ttft_ms.is_some());
        assert_eq!(outcome.bytes_forwarded, expected.len() as u64);
    }

    #[tokio::test]
    async fn test_fanout_usage_none_when_stream_has_no_usage() {
        let chunks = sse_chunks(&[r#"data: {"choices":[]}"#, "data: [DONE]"]);
        let (body, handles) = spawn_stream_fanout(
            stream::iter(chunks),
            tokio::time::Instant::now() + std::time::Duration::from_secs(5),
            Instant::now(),
            None,
        );
        collect_body(body).await;
        assert!(handles.usage.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fanout_capture_collects_events() {
        let chunks = sse_chunks(&[r#"data: {"a":1}"#, "data: [DONE]"]);
        let (body, handles) = spawn_stream_fanout(
            stream::iter(chunks),
            tokio::time::Instant::now() + std::time::Duration::from_secs(5),
            Instant::now(),
            Some(1024),
        );
        collect_body(body).await;

        let capture = handles.capture.unwrap().await.unwrap();
        assert_eq!(capture.events.len(), 2);
        assert!(!capture.truncated);
    }

    #[tokio::test]
    async fn test_fanout_capture_truncates_at_ceiling() {
        let big = format!("data: {{\"pad\":\"{}\"}}", "x".repeat(200));
        let chunks = sse_chunks(&[big.as_str(), big.as_str(), "data: [DONE]"]);
        let (body, handles) = spawn_stream_fanout(
            stream::iter(chunks),
            tokio::time::Instant::now() + std::time::Duration::from_secs(5),
            Instant::now(),
            Some(250),
        );
        // Client still receives everything
        let delivered = collect_body(body).await;
        assert!(delivered.len() > 400);

        let capture = handles.capture.unwrap().await.unwrap();
        assert!(capture.truncated);
    }

    #[tokio::test]
    async fn test_fanout_deadline_cancels_branches() {
        // An upstream that never completes
        let pending =
            stream::once(async {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                Ok(Bytes::from_static(b"data: late\n\n"))
            });
        let (body, handles) = spawn_stream_fanout(
            Box::pin(pending),
            tokio::time::Instant::now() + std::time::Duration::from_millis(50),
            Instant::now(),
            None,
        );

        let delivered = collect_body(body).await;
        assert!(delivered.is_empty());

        let outcome = handles.outcome.await.unwrap();
        assert_eq!(outcome.error, Some(FailoverErrorType::Timeout));
        // Usage future still resolves (with nothing); drain errors never hang
        assert!(handles.usage.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fanout_client_disconnect_detected() {
        let (chunk_tx, chunk_rx) = mpsc::channel::<reqwest::Result<Bytes>>(4);
        let upstream = async_stream::stream! {
            let mut rx = chunk_rx;
            while let Some(item) = rx.recv().await {
                yield item;
            }
        };

        let (body, handles) = spawn_stream_fanout(
            Box::pin(upstream),
            tokio::time::Instant::now() + std::time::Duration::from_secs(5),
            Instant::now(),
            None,
        );

        chunk_tx
            .send(Ok(Bytes::from_static(b"data: {\"a\":1}\n\n")))
            .await
            .unwrap();
        // Client walks away mid-stream
        drop(body);

        let outcome = handles.outcome.await.unwrap();
        assert!(outcome.client_disconnected);
        assert!(outcome.error.is_none());
    }
}
