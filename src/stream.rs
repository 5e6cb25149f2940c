//! Streaming responder.
//!
//! Writes a requested number of bytes to a [`ChunkSink`] by repeatedly
//! handing out the same payload view:
//!
//! ```text
//! total = 100_000, chunk = 32_768
//! writes: 32_768 | 32_768 | 32_768 | 1_696
//! ```
//!
//! A failed write ends the stream without error: a disconnecting client is
//! the normal way for a long transfer to stop early.

use crate::payload::{Payload, PayloadError};
use async_trait::async_trait;
use bytes::Bytes;
use hyper::body::{Body, Frame};
use std::convert::Infallible;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Chunk size used by the server (sweet spot may depend on OS and hardware).
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Content type of every streamed response.
pub const CONTENT_TYPE: &str = "application/octet-stream";

/// Metadata sent before the first chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHead {
    pub content_type: &'static str,
    pub content_length: u64,
}

/// Destination of a byte stream.
#[async_trait]
pub trait ChunkSink: Send {
    /// Publish the stream metadata. Called once, before any write.
    async fn start(&mut self, head: StreamHead) -> io::Result<()>;

    /// Write one chunk.
    async fn write(&mut self, chunk: Bytes) -> io::Result<()>;

    /// Push out anything still buffered.
    async fn flush(&mut self) -> io::Result<()>;
}

/// How a stream attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Every requested byte was handed to the sink.
    Complete { written: u64 },
    /// The sink failed; `written` bytes were accepted before that.
    Aborted { written: u64 },
}

/// Produces fixed-size chunks from the shared payload.
#[derive(Debug, Clone)]
pub struct Streamer {
    chunk: Bytes,
}

impl Streamer {
    /// Create a streamer that writes chunks of `chunk_size` bytes.
    ///
    /// Fails if the chunk does not fit in the payload; this is checked once at
    /// startup so the request path never has to.
    pub fn new(payload: &Payload, chunk_size: usize) -> Result<Self, PayloadError> {
        if chunk_size == 0 {
            return Err(PayloadError::EmptyChunk);
        }
        Ok(Self {
            chunk: payload.slice(chunk_size)?,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk.len()
    }

    /// Write `total_size` bytes to `sink`.
    pub async fn stream<S>(&self, sink: &mut S, total_size: u64) -> StreamOutcome
    where
        S: ChunkSink + ?Sized,
    {
        let head = StreamHead {
            content_type: CONTENT_TYPE,
            content_length: total_size,
        };

        let outcome = match sink.start(head).await {
            Ok(()) => self.write_chunks(sink, total_size).await,
            Err(e) => {
                debug!(error = %e, "Stream aborted before first write");
                StreamOutcome::Aborted { written: 0 }
            }
        };

        if let Err(e) = sink.flush().await {
            debug!(error = %e, "Flush failed");
        }

        outcome
    }

    async fn write_chunks<S>(&self, sink: &mut S, total_size: u64) -> StreamOutcome
    where
        S: ChunkSink + ?Sized,
    {
        let chunk_len = self.chunk.len() as u64;
        let full_chunks = total_size / chunk_len;
        let remainder = (total_size % chunk_len) as usize;
        let mut written = 0u64;

        for _ in 0..full_chunks {
            if let Err(e) = sink.write(self.chunk.clone()).await {
                debug!(error = %e, written, total_size, "Stream aborted");
                return StreamOutcome::Aborted { written };
            }
            written += chunk_len;
        }

        if remainder > 0 {
            if let Err(e) = sink.write(self.chunk.slice(..remainder)).await {
                debug!(error = %e, written, total_size, "Stream aborted");
                return StreamOutcome::Aborted { written };
            }
            written += remainder as u64;
        }

        StreamOutcome::Complete { written }
    }
}

/// Create a sink whose chunks come out of the returned body.
///
/// The head is delivered separately so the response headers can be built
/// before the first chunk exists. `depth` bounds the number of chunks queued
/// between the writer and the transport.
pub fn channel(depth: usize) -> (ChannelSink, oneshot::Receiver<StreamHead>, ChunkBody) {
    let (head_tx, head_rx) = oneshot::channel();
    let (tx, rx) = mpsc::channel(depth);

    let sink = ChannelSink {
        head_tx: Some(head_tx),
        tx: Some(tx),
    };
    (sink, head_rx, ChunkBody { rx })
}

/// Sending half of [`channel`].
#[derive(Debug)]
pub struct ChannelSink {
    head_tx: Option<oneshot::Sender<StreamHead>>,
    tx: Option<mpsc::Sender<Bytes>>,
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "response body closed")
}

#[async_trait]
impl ChunkSink for ChannelSink {
    async fn start(&mut self, head: StreamHead) -> io::Result<()> {
        let head_tx = self
            .head_tx
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "stream already started"))?;
        head_tx.send(head).map_err(|_| closed())
    }

    async fn write(&mut self, chunk: Bytes) -> io::Result<()> {
        let tx = self.tx.as_ref().ok_or_else(closed)?;
        tx.send(chunk).await.map_err(|_| closed())
    }

    /// Closing the channel ends the body, so the transport sends out
    /// whatever it still holds instead of waiting for more.
    async fn flush(&mut self) -> io::Result<()> {
        self.tx.take();
        Ok(())
    }
}

/// Response body fed by a [`ChannelSink`].
#[derive(Debug)]
pub struct ChunkBody {
    rx: mpsc::Receiver<Bytes>,
}

impl Body for ChunkBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        self.rx
            .poll_recv(cx)
            .map(|chunk| chunk.map(|data| Ok(Frame::data(data))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::PAYLOAD_SIZE;
    use http_body_util::BodyExt;

    /// Sink that records write sizes, optionally failing after `fail_after` writes.
    #[derive(Default)]
    struct RecordingSink {
        head: Option<StreamHead>,
        writes: Vec<usize>,
        wrote_before_start: bool,
        flushes: usize,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl ChunkSink for RecordingSink {
        async fn start(&mut self, head: StreamHead) -> io::Result<()> {
            self.head = Some(head);
            Ok(())
        }

        async fn write(&mut self, chunk: Bytes) -> io::Result<()> {
            if self.head.is_none() {
                self.wrote_before_start = true;
            }
            if self.fail_after == Some(self.writes.len()) {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
            }
            self.writes.push(chunk.len());
            Ok(())
        }

        async fn flush(&mut self) -> io::Result<()> {
            self.flushes += 1;
            Ok(())
        }
    }

    fn streamer() -> Streamer {
        Streamer::new(&Payload::new(3), CHUNK_SIZE).unwrap()
    }

    #[tokio::test]
    async fn test_chunking_across_boundaries() {
        let streamer = streamer();
        let c = CHUNK_SIZE as u64;
        let sizes = [
            0,
            1,
            c - 1,
            c,
            c + 1,
            2 * c,
            PAYLOAD_SIZE as u64 + 17,
            PAYLOAD_SIZE as u64 * 1000,
            PAYLOAD_SIZE as u64 * 1000 - 3,
        ];

        for n in sizes {
            let mut sink = RecordingSink::default();
            let outcome = streamer.stream(&mut sink, n).await;
            assert_eq!(outcome, StreamOutcome::Complete { written: n });

            let remainder = (n % c) as usize;
            let full = (n / c) as usize;
            let expected_writes = full + usize::from(remainder > 0);
            assert_eq!(sink.writes.len(), expected_writes, "n = {n}");
            assert!(sink.writes[..full].iter().all(|&w| w == CHUNK_SIZE));
            if remainder > 0 {
                assert_eq!(*sink.writes.last().unwrap(), remainder);
            }
            assert_eq!(sink.writes.iter().map(|&w| w as u64).sum::<u64>(), n);
            assert_eq!(sink.flushes, 1);
            assert!(!sink.wrote_before_start);
            assert_eq!(
                sink.head,
                Some(StreamHead {
                    content_type: CONTENT_TYPE,
                    content_length: n,
                })
            );
        }
    }

    #[tokio::test]
    async fn test_abort_on_write_failure() {
        let streamer = streamer();
        let mut sink = RecordingSink {
            fail_after: Some(2),
            ..Default::default()
        };

        let total = 10 * CHUNK_SIZE as u64 + 5;
        let outcome = streamer.stream(&mut sink, total).await;

        assert_eq!(
            outcome,
            StreamOutcome::Aborted {
                written: 2 * CHUNK_SIZE as u64
            }
        );
        // No partial chunk after the failure, but still flushed.
        assert_eq!(sink.writes, vec![CHUNK_SIZE, CHUNK_SIZE]);
        assert_eq!(sink.flushes, 1);
    }

    #[tokio::test]
    async fn test_abort_on_remainder_failure() {
        let streamer = streamer();
        let mut sink = RecordingSink {
            fail_after: Some(1),
            ..Default::default()
        };

        let outcome = streamer.stream(&mut sink, CHUNK_SIZE as u64 + 10).await;
        assert_eq!(
            outcome,
            StreamOutcome::Aborted {
                written: CHUNK_SIZE as u64
            }
        );
        assert_eq!(sink.flushes, 1);
    }

    #[test]
    fn test_chunk_size_checked() {
        let payload = Payload::new(0);
        assert!(matches!(
            Streamer::new(&payload, PAYLOAD_SIZE + 1),
            Err(PayloadError::ChunkTooLarge { .. })
        ));
        assert_eq!(Streamer::new(&payload, 0).unwrap_err(), PayloadError::EmptyChunk);
        assert_eq!(Streamer::new(&payload, PAYLOAD_SIZE).unwrap().chunk_size(), PAYLOAD_SIZE);
    }

    #[tokio::test]
    async fn test_channel_body_carries_stream() {
        let payload = Payload::new(9);
        let streamer = Streamer::new(&payload, CHUNK_SIZE).unwrap();
        let (mut sink, head_rx, body) = channel(4);

        let total = 3 * CHUNK_SIZE as u64 + 100;
        let writer = tokio::spawn(async move { streamer.stream(&mut sink, total).await });

        let head = head_rx.await.unwrap();
        assert_eq!(head.content_length, total);
        assert_eq!(head.content_type, CONTENT_TYPE);

        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(bytes.len() as u64, total);
        assert_eq!(&bytes[..CHUNK_SIZE], &payload.slice(CHUNK_SIZE).unwrap()[..]);

        assert_eq!(writer.await.unwrap(), StreamOutcome::Complete { written: total });
    }

    #[tokio::test]
    async fn test_channel_receiver_dropped() {
        let streamer = streamer();
        let (mut sink, head_rx, body) = channel(1);
        drop(body);

        let writer = tokio::spawn(async move { streamer.stream(&mut sink, 1 << 30).await });
        assert!(head_rx.await.is_ok());

        assert_eq!(writer.await.unwrap(), StreamOutcome::Aborted { written: 0 });
    }
}
