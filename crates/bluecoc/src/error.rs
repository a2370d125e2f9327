//! Error types for the bluecoc library
//!
//! This module defines the errors reported by the collaborators the
//! channel layer runs on: the frame transport and the timer service.

use thiserror::Error;

/// Errors raised by the lower transport or the scheduler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Failed to send frame on handle 0x{handle:04X}, CID 0x{cid:04X}: {reason}")]
    SendFailed { handle: u16, cid: u16, reason: String },

    #[error("Link 0x{0:04X} is not available")]
    LinkUnavailable(u16),

    #[error("Timer service failure: {0}")]
    Timer(String),

    #[error("Event queue closed")]
    QueueClosed,
}
