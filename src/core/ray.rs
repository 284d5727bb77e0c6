//! Duplex ray transport
//!
//! A ray is two bounded chunk queues crossing between an inbound and an
//! outbound handler:
//!
//! ```text
//!   inbound.output ──────────► outbound.input
//!   inbound.input  ◄────────── outbound.output
//! ```
//!
//! The producer of a queue closes it (or drops its sender) at end-of-stream;
//! the consumer then sees `recv() == None`.

use tokio::sync::mpsc;

use super::alloc::Chunk;

/// Default number of chunks a queue holds before `send` waits
pub const DEFAULT_RAY_CAPACITY: usize = 16;

/// Producing end of a chunk queue
#[derive(Debug)]
pub struct ChunkSender {
    tx: mpsc::Sender<Chunk>,
}

impl ChunkSender {
    /// Queue a chunk, waiting while the queue is full
    ///
    /// Returns the chunk if the consumer is gone, so the caller can release it.
    pub async fn send(&self, chunk: Chunk) -> Result<(), Chunk> {
        self.tx.send(chunk).await.map_err(|e| e.0)
    }

    /// Whether the consumer has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Signal end-of-stream to the consumer
    pub fn close(self) {
        drop(self.tx);
    }
}

/// Consuming end of a chunk queue
#[derive(Debug)]
pub struct ChunkReceiver {
    rx: mpsc::Receiver<Chunk>,
}

impl ChunkReceiver {
    /// Next chunk, or `None` once the producer closed the queue and it drained
    pub async fn recv(&mut self) -> Option<Chunk> {
        self.rx.recv().await
    }

    /// Stop accepting chunks and release anything still queued
    pub fn discard(mut self) {
        self.rx.close();
        while let Ok(chunk) = self.rx.try_recv() {
            chunk.release();
        }
    }
}

fn queue(capacity: usize) -> (ChunkSender, ChunkReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChunkSender { tx }, ChunkReceiver { rx })
}

/// Endpoints held by the inbound (client-side) handler
#[derive(Debug)]
pub struct InboundRay {
    /// Chunks coming back from the destination
    pub input: ChunkReceiver,
    /// Chunks going towards the destination
    pub output: ChunkSender,
}

/// Endpoints held by the outbound (destination-side) handler
#[derive(Debug)]
pub struct OutboundRay {
    /// Chunks coming from the client
    pub input: ChunkReceiver,
    /// Chunks going back to the client
    pub output: ChunkSender,
}

/// A freshly created ray, not yet split between handlers
#[derive(Debug)]
pub struct Ray {
    pub inbound: InboundRay,
    pub outbound: OutboundRay,
}

impl Default for Ray {
    fn default() -> Self {
        Self::new()
    }
}

impl Ray {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RAY_CAPACITY)
    }

    /// Create a ray whose queues each hold `capacity` chunks
    pub fn with_capacity(capacity: usize) -> Self {
        let (uplink_tx, uplink_rx) = queue(capacity);
        let (downlink_tx, downlink_rx) = queue(capacity);
        Self {
            inbound: InboundRay {
                input: downlink_rx,
                output: uplink_tx,
            },
            outbound: OutboundRay {
                input: uplink_rx,
                output: downlink_tx,
            },
        }
    }

    pub fn split(self) -> (InboundRay, OutboundRay) {
        (self.inbound, self.outbound)
    }
}
