//! Core gateway module
//!
//! This module contains the protocol-independent machinery:
//! - Pooled chunk buffers
//! - Destinations, packets and rays
//! - Handler roles and the protocol registry
//! - Dispatching and the listening point

pub mod alloc;
pub mod copy;
mod destination;
mod dispatcher;
mod handler;
mod point;
mod ray;
mod registry;

pub use alloc::{Arena, Chunk, SizeClass, LARGE_CHUNK_SIZE, SMALL_CHUNK_SIZE};
pub use copy::{chan_to_writer, reader_to_chan, relay_stream, RelayResult};
pub use destination::{
    Address, Destination, Network, Packet, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6,
};
pub use dispatcher::Dispatcher;
pub use handler::{
    InboundConnectionHandler, InboundContext, InboundProtocol, OutboundConnectionHandler,
    OutboundContext, OutboundProtocol,
};
pub use point::{Point, RunningPoint};
pub use ray::{
    ChunkReceiver, ChunkSender, InboundRay, OutboundRay, Ray, DEFAULT_RAY_CAPACITY,
};
pub use registry::{AnyConfig, ConfigType, Registry};
