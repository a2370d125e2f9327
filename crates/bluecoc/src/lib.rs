//! bluecoc - LE credit based channels and EATT bearers for a Bluetooth host
//!
//! This library implements the connection oriented part of L2CAP on LE links
//! (credit based flow control, segmentation and reassembly, enhanced batch
//! connect and reconfigure) and the EATT layer that carries ATT over those
//! channels. It is transport agnostic: frames, timers and buffers are reached
//! through the traits in [`runtime`].

pub mod eatt;
pub mod error;
pub mod host;
pub mod l2cap;
pub mod runtime;

#[cfg(test)]
mod testing;

// Re-export common types for convenience
pub use eatt::{AttBearerHandler, AttRole, Bearer, BearerSender, EattConfig, EattError, EattEvent, EattManager};
pub use error::TransportError;
pub use host::Host;
pub use l2cap::{
    ChannelId, CocEvent, ConnHandle, L2capConfig, L2capError, L2capManager, LeCreditBasedConfig, Registration,
    PSM,
};
pub use runtime::{BufferAllocator, Event, EventQueue, EventSender, FrameSink, HeapBuffers, TimerId, TimerService};
