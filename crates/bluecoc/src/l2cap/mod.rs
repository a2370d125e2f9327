//! L2CAP (Logical Link Control and Adaptation Protocol) implementation
//!
//! This module provides the LE credit based part of L2CAP, which is responsible for:
//! - Multiplexing dynamic channels over a single LE link
//! - Segmentation and reassembly of SDUs into K-frames
//! - Credit based flow control for each channel
//! - Enhanced (multi channel) connect and reconfigure transactions

pub mod batch;
pub mod channel;
pub mod constants;
pub mod core;
pub mod flow;
pub mod link;
pub mod packet;
pub mod pool;
pub mod psm;
pub mod registry;
pub mod sar;
pub mod signaling;
pub mod types;

// Re-export the public API
pub use self::channel::ChannelContext;
pub use self::core::L2capManager;
pub use self::flow::CreditFlow;
pub use self::link::LinkContext;
pub use self::packet::{BasicFrame, BasicHeader, CommandHeader};
pub use self::pool::{ChannelPool, CidMap};
pub use self::psm::{obtain_dynamic_psm, PSM};
pub use self::registry::Registration;
pub use self::sar::{Reassembler, ReassemblyError, Segmenter};
pub use self::signaling::SignalingMessage;
pub use self::types::*;
