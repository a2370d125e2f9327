//! Runtime seams
//!
//! The channel layer never owns threads, sockets or clocks. It talks to the
//! outside world through the traits in this module:
//! - `FrameSink` hands finished frames to the link
//! - `TimerService` arms single-shot timers that come back as events
//! - `BufferAllocator` bounds the memory used for SDU reassembly
//!
//! Everything that happens to the stack is an `Event` posted on the
//! `EventQueue` and drained one at a time by the `Host`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use log::{trace, warn};

use crate::error::TransportError;
use crate::l2cap::constants::*;
use crate::l2cap::packet::BasicFrame;
use crate::l2cap::pool::CidMap;
use crate::l2cap::{ChannelId, ConnHandle, LinkRole};

/// Lower transport: sends one L2CAP payload on a channel of a link
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, handle: ConnHandle, cid: ChannelId, payload: &[u8]) -> Result<(), TransportError>;
}

/// Identifies a timer armed through the `TimerService`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Response timeout (RTX) for the signaling request `signal_id` on a link
    Signaling { handle: ConnHandle, signal_id: u8 },
    /// EATT collision backoff on a link
    EattBackoff(ConnHandle),
}

/// Single-shot timers that fire as `Event::TimerExpired`
pub trait TimerService: Send + Sync {
    fn start(&self, id: TimerId, after: Duration) -> Result<(), TransportError>;
    fn stop(&self, id: TimerId);
}

/// Length-bounded buffers for reassembly
pub trait BufferAllocator: Send + Sync {
    /// Returns an empty buffer able to hold `len` bytes, or `None` when the
    /// budget is exhausted
    fn allocate(&self, len: usize) -> Option<Vec<u8>>;
    /// Gives a buffer obtained from `allocate` back to the budget
    fn release(&self, buffer: Vec<u8>);
}

/// Heap backed allocator with a fixed byte budget
#[derive(Debug)]
pub struct HeapBuffers {
    capacity: usize,
    in_use: AtomicUsize,
}

impl HeapBuffers {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            in_use: AtomicUsize::new(0),
        }
    }

    /// Bytes currently handed out
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }
}

impl Default for HeapBuffers {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

impl BufferAllocator for HeapBuffers {
    fn allocate(&self, len: usize) -> Option<Vec<u8>> {
        let buffer = Vec::with_capacity(len);
        let reserved = buffer.capacity();

        self.in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(reserved).filter(|total| *total <= self.capacity)
            })
            .ok()?;

        Some(buffer)
    }

    fn release(&self, buffer: Vec<u8>) {
        let reserved = buffer.capacity();
        let _ = self
            .in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| Some(used.saturating_sub(reserved)));
    }
}

/// Everything the dispatch loop reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A link came up
    LinkOpened {
        handle: ConnHandle,
        conn_id: u8,
        role: LinkRole,
        conn_interval: Duration,
    },
    /// A link went down
    LinkClosed { handle: ConnHandle },
    /// The lower transport stopped or resumed accepting data on a link
    LinkFlow { handle: ConnHandle, enabled: bool },
    /// An L2CAP payload arrived on a channel
    Frame {
        handle: ConnHandle,
        cid: ChannelId,
        payload: Vec<u8>,
    },
    /// A timer armed through the `TimerService` fired
    TimerExpired(TimerId),
}

/// Posting side of the event queue
#[derive(Debug, Clone)]
pub struct EventSender {
    sender: Sender<Event>,
}

impl EventSender {
    pub fn post(&self, event: Event) -> Result<(), TransportError> {
        self.sender.send(event).map_err(|_| TransportError::QueueClosed)
    }
}

/// Single-consumer event queue
#[derive(Debug)]
pub struct EventQueue {
    sender: Sender<Event>,
    receiver: Receiver<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self { sender, receiver }
    }

    pub fn sender(&self) -> EventSender {
        EventSender {
            sender: self.sender.clone(),
        }
    }

    /// Next event if one is already queued
    pub fn try_next(&self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }

    /// Waits up to `timeout` for the next event
    pub fn next_timeout(&self, timeout: Duration) -> Option<Event> {
        self.receiver.recv_timeout(timeout).ok()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Interrupt-side entry point for received frames
///
/// Runs outside the dispatch loop. Frames for dynamic CIDs that are not
/// allocated are dropped here, before they cost a queue slot.
#[derive(Debug, Clone)]
pub struct ReceivePath {
    sender: EventSender,
    occupancy: CidMap,
}

impl ReceivePath {
    pub fn new(sender: EventSender, occupancy: CidMap) -> Self {
        Self { sender, occupancy }
    }

    /// Posts a payload already split from its basic header.
    /// Returns whether the frame was queued.
    pub fn deliver(&self, handle: ConnHandle, cid: ChannelId, payload: &[u8]) -> Result<bool, TransportError> {
        let accepted = match cid {
            L2CAP_LE_SIGNALING_CID | L2CAP_ATTRIBUTE_PROTOCOL_CID => true,
            L2CAP_DYNAMIC_CID_MIN..=L2CAP_DYNAMIC_CID_MAX => self.occupancy.is_allocated(cid),
            _ => false,
        };

        if !accepted {
            trace!("Dropping frame for CID 0x{:04X} on handle 0x{:04X}", cid, handle);
            return Ok(false);
        }

        self.sender.post(Event::Frame {
            handle,
            cid,
            payload: payload.to_vec(),
        })?;

        Ok(true)
    }

    /// Posts a raw basic-header frame
    pub fn deliver_packet(&self, handle: ConnHandle, raw: &[u8]) -> Result<bool, TransportError> {
        match BasicFrame::parse(raw) {
            Some(packet) => self.deliver(handle, packet.header.channel_id, &packet.payload),
            None => {
                warn!("Malformed L2CAP frame on handle 0x{:04X}: {}", handle, hex::encode(raw));
                Ok(false)
            }
        }
    }
}
