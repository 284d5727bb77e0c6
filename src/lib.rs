//! Protocol-agnostic proxy gateway
//!
//! Architecture:
//! - `core/`: Buffers, rays, handler roles, registry, dispatcher and points
//! - `proxy/`: Built-in protocols (dokodemo-door, socks, freedom)
//! - `transport`: Stream abstraction handed to inbound handlers
//! - `config`: CLI and TOML configuration

pub mod config;
pub mod core;
pub mod error;
pub mod logger;
pub mod proxy;
pub mod transport;

pub use error::{GatewayError, Result};
