//! Copy loops between byte streams and ray queues
//!
//! Provides the two loop bodies every handler uses plus the inbound-side
//! relay with idle timeout detection.

use pin_project_lite::pin_project;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use super::alloc::{self, SizeClass};
use super::ray::{ChunkReceiver, ChunkSender, InboundRay};
use crate::logger::log;

/// Write every chunk from `input` to `writer` until the queue closes
///
/// Chunks are released after they are written. A write error ends the loop;
/// the receiver is dropped with it so the producer sees the queue closed.
pub async fn chan_to_writer<W>(writer: &mut W, input: &mut ChunkReceiver) -> std::io::Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut written = 0u64;
    while let Some(chunk) = input.recv().await {
        if chunk.is_empty() {
            chunk.release();
            continue;
        }
        let result = writer.write_all(&chunk).await;
        let len = chunk.len() as u64;
        chunk.release();
        result?;
        written += len;
    }
    writer.flush().await?;
    Ok(written)
}

/// Read from `reader` into pooled chunks and queue them on `output` until EOF
///
/// Returns early without error when the consumer has gone away.
pub async fn reader_to_chan<R>(output: &ChunkSender, reader: &mut R) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut read = 0u64;
    loop {
        let mut chunk = alloc::acquire(SizeClass::Large);
        let n = match chunk.read_from(reader).await {
            Ok(n) => n,
            Err(e) => {
                chunk.release();
                return Err(e);
            }
        };
        if n == 0 {
            chunk.release();
            return Ok(read);
        }
        read += n as u64;
        if let Err(chunk) = output.send(chunk).await {
            chunk.release();
            return Ok(read);
        }
    }
}

pin_project! {
    /// A stream wrapper that tracks the last activity time and bytes moved
    struct TimedStream<S> {
        #[pin]
        inner: S,
        start_time: Instant,
        last_activity: Arc<AtomicU64>,
        read_bytes: Arc<AtomicU64>,
        write_bytes: Arc<AtomicU64>,
    }
}

impl<S> TimedStream<S> {
    fn new(inner: S, start_time: Instant, last_activity: Arc<AtomicU64>) -> Self {
        Self {
            inner,
            start_time,
            last_activity,
            read_bytes: Arc::new(AtomicU64::new(0)),
            write_bytes: Arc::new(AtomicU64::new(0)),
        }
    }

    fn touch(start_time: &Instant, last_activity: &AtomicU64) {
        last_activity.store(start_time.elapsed().as_millis() as u64, Ordering::Release);
    }
}

impl<S: AsyncRead> AsyncRead for TimedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        let before_len = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let bytes_read = buf.filled().len() - before_len;
            if bytes_read > 0 {
                Self::touch(this.start_time, this.last_activity);
                this.read_bytes
                    .fetch_add(bytes_read as u64, Ordering::Relaxed);
            }
        }
        result
    }
}

impl<S: AsyncWrite> AsyncWrite for TimedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.project();
        let result = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 {
                Self::touch(this.start_time, this.last_activity);
                this.write_bytes.fetch_add(*n as u64, Ordering::Relaxed);
            }
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Result of an inbound relay
#[derive(Debug, Clone, Copy)]
pub struct RelayResult {
    /// Bytes read from the client and queued towards the destination
    pub uploaded: u64,
    /// Bytes taken from the ray and written to the client
    pub downloaded: u64,
    /// Whether both directions finished (false on idle timeout)
    pub completed: bool,
}

/// Relay between a client stream and the inbound side of a ray
///
/// Client EOF closes `ray.output`; closure of `ray.input` half-closes the
/// client stream. With `idle_timeout`, both loops are abandoned once nothing
/// moved in either direction for that long, which drops the stream and both
/// ray endpoints.
pub async fn relay_stream<S>(
    stream: S,
    ray: InboundRay,
    idle_timeout: Option<Duration>,
) -> RelayResult
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let start_time = Instant::now();
    let last_activity = Arc::new(AtomicU64::new(0));
    let stream = TimedStream::new(stream, start_time, Arc::clone(&last_activity));
    let read_bytes = Arc::clone(&stream.read_bytes);
    let write_bytes = Arc::clone(&stream.write_bytes);

    let (mut reader, mut writer) = tokio::io::split(stream);
    let InboundRay { mut input, output } = ray;

    let upload = async move {
        if let Err(e) = reader_to_chan(&output, &mut reader).await {
            log::debug!(error = %e, "Client read ended with error");
        }
        output.close();
    };
    let download = async move {
        if let Err(e) = chan_to_writer(&mut writer, &mut input).await {
            log::debug!(error = %e, "Client write ended with error");
            input.discard();
        }
        let _ = writer.shutdown().await;
    };
    let both = async {
        tokio::join!(upload, download);
    };

    let completed = match idle_timeout {
        Some(limit) if !limit.is_zero() => {
            let timeout_check = async {
                let tick = (limit / 4).clamp(Duration::from_millis(10), Duration::from_secs(30));
                let mut interval = tokio::time::interval(tick);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let last_active = last_activity.load(Ordering::Acquire);
                    let idle_ms =
                        (start_time.elapsed().as_millis() as u64).saturating_sub(last_active);
                    if idle_ms >= limit.as_millis() as u64 {
                        return;
                    }
                }
            };
            tokio::select! {
                _ = both => true,
                _ = timeout_check => false,
            }
        }
        _ => {
            both.await;
            true
        }
    };

    RelayResult {
        uploaded: read_bytes.load(Ordering::Relaxed),
        downloaded: write_bytes.load(Ordering::Relaxed),
        completed,
    }
}
