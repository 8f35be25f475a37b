//! Response body tee
//!
//! One pump task reads the upstream body and pushes every chunk to two
//! places: an unbounded channel that backs the client's response body, and a
//! capture buffer handed to the background pipeline once the upstream is
//! drained. The client channel is unbounded so a slow reader never stalls the
//! capture side, and a client that goes away never truncates the capture.

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// The capture side of a teed body
#[derive(Debug, Clone)]
pub struct CapturedBody {
    /// Every byte received from upstream, in order
    pub bytes: Bytes,
    /// The client stopped reading before the upstream finished
    pub client_disconnected: bool,
    /// The upstream body ended with an error
    pub truncated: bool,
    pub finished_at: Instant,
}

/// Split an upstream body stream into a client body and a capture handle
pub fn tee<S, E>(upstream: S) -> (Body, oneshot::Receiver<CapturedBody>)
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let (client_tx, client_rx) = mpsc::unbounded_channel::<Result<Bytes, std::io::Error>>();
    let (done_tx, done_rx) = oneshot::channel();

    tokio::spawn(pump(upstream, client_tx, done_tx));

    let body = Body::from_stream(UnboundedReceiverStream::new(client_rx));
    (body, done_rx)
}

async fn pump<S, E>(
    upstream: S,
    client_tx: mpsc::UnboundedSender<Result<Bytes, std::io::Error>>,
    done_tx: oneshot::Sender<CapturedBody>,
) where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut upstream = std::pin::pin!(upstream);
    let mut buffer = BytesMut::new();
    let mut client_disconnected = false;
    let mut truncated = false;

    while let Some(chunk) = upstream.next().await {
        match chunk {
            Ok(bytes) => {
                buffer.extend_from_slice(&bytes);
                if !client_disconnected && client_tx.send(Ok(bytes)).is_err() {
                    // Keep draining so the capture stays complete
                    tracing::debug!("client disconnected mid-stream, continuing capture");
                    client_disconnected = true;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, bytes = buffer.len(), "upstream body ended with an error");
                truncated = true;
                if !client_disconnected {
                    let _ = client_tx.send(Err(std::io::Error::other(e.to_string())));
                }
                break;
            }
        }
    }
    drop(client_tx);

    let captured = CapturedBody {
        bytes: buffer.freeze(),
        client_disconnected,
        truncated,
        finished_at: Instant::now(),
    };
    if done_tx.send(captured).is_err() {
        tracing::debug!("capture receiver dropped before body completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn chunks(parts: &[&'static str]) -> Vec<Result<Bytes, String>> {
        parts.iter().map(|p| Ok(Bytes::from_static(p.as_bytes()))).collect()
    }

    #[tokio::test]
    async fn test_client_and_capture_see_identical_bytes() {
        let upstream = futures::stream::iter(chunks(&["data: a\n\n", "data: b\n\n", "tail"]));
        let (body, captured) = tee(upstream);

        let client_bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        let captured = captured.await.unwrap();

        assert_eq!(client_bytes, captured.bytes);
        assert_eq!(&client_bytes[..], b"data: a\n\ndata: b\n\ntail");
        assert!(!captured.client_disconnected);
        assert!(!captured.truncated);
    }

    #[tokio::test]
    async fn test_dropped_client_does_not_truncate_capture() {
        let (tx, rx) = mpsc::unbounded_channel::<Result<Bytes, String>>();
        let (body, captured) = tee(UnboundedReceiverStream::new(rx));

        tx.send(Ok(Bytes::from_static(b"first "))).unwrap();
        // Client goes away before the upstream is finished
        drop(body);
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(Ok(Bytes::from_static(b"second"))).unwrap();
        drop(tx);

        let captured = captured.await.unwrap();
        assert_eq!(&captured.bytes[..], b"first second");
        assert!(captured.client_disconnected);
        assert!(!captured.truncated);
    }

    #[tokio::test]
    async fn test_upstream_error_marks_truncated() {
        let upstream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err("connection reset".to_string()),
            Ok(Bytes::from_static(b"never")),
        ]);
        let (body, captured) = tee(upstream);

        assert!(axum::body::to_bytes(body, usize::MAX).await.is_err());
        let captured = captured.await.unwrap();
        assert_eq!(&captured.bytes[..], b"partial");
        assert!(captured.truncated);
    }

    #[tokio::test]
    async fn test_empty_upstream() {
        let upstream = futures::stream::iter(Vec::<Result<Bytes, String>>::new());
        let (body, captured) = tee(upstream);
        assert!(axum::body::to_bytes(body, usize::MAX).await.unwrap().is_empty());
        assert!(captured.await.unwrap().bytes.is_empty());
    }
}
