//! Packet dispatcher
//!
//! Opens a ray for each packet, runs the outbound handler on its own task
//! with one side and returns the other side to the inbound caller.

use std::sync::Arc;

use super::destination::Packet;
use super::handler::OutboundConnectionHandler;
use super::ray::{InboundRay, Ray};
use crate::logger::log;

pub struct Dispatcher {
    outbound: Arc<dyn OutboundConnectionHandler>,
    outbound_name: String,
    ray_capacity: usize,
}

impl Dispatcher {
    pub fn new(
        outbound: Arc<dyn OutboundConnectionHandler>,
        outbound_name: impl Into<String>,
        ray_capacity: usize,
    ) -> Self {
        Self {
            outbound,
            outbound_name: outbound_name.into(),
            ray_capacity,
        }
    }

    /// Name of the outbound protocol packets are sent to
    pub fn outbound_name(&self) -> &str {
        &self.outbound_name
    }

    /// Start relaying `packet` through the outbound handler
    ///
    /// Must be called from within a tokio runtime. Outbound errors are logged
    /// here; the inbound side only observes its input queue closing.
    pub fn dispatch_to_outbound(&self, packet: Packet) -> InboundRay {
        let (inbound, outbound) = Ray::with_capacity(self.ray_capacity).split();
        let destination = packet.destination().to_string();
        log::dispatch(&destination, &self.outbound_name);

        let handler = Arc::clone(&self.outbound);
        tokio::spawn(async move {
            match handler.dispatch(packet, outbound).await {
                Ok(()) => log::trace!(destination = %destination, "Outbound finished"),
                Err(e) => log::warn!(destination = %destination, error = %e, "Outbound failed"),
            }
        });

        inbound
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("outbound", &self.outbound_name)
            .field("ray_capacity", &self.ray_capacity)
            .finish()
    }
}
