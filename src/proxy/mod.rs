//! Built-in proxy protocols
//!
//! - `dokodemo-door`: forwards everything to one fixed destination
//! - `socks`: SOCKS5 CONNECT without authentication
//! - `freedom`: dials the requested destination directly

pub mod dokodemo;
pub mod freedom;
pub mod socks;

pub use dokodemo::{DokodemoConfig, DokodemoDoor};
pub use freedom::{Freedom, FreedomConfig};
pub use socks::{Socks, SocksConfig};

use crate::core::Registry;
use crate::error::Result;

/// Register every built-in protocol in `registry`
pub fn register_builtins(registry: &Registry) -> Result<()> {
    registry.register_inbound::<DokodemoDoor>()?;
    registry.register_inbound::<Socks>()?;
    registry.register_outbound::<Freedom>()?;
    Ok(())
}
