//! Segmentation and reassembly of SDUs over K-frames
//!
//! The first K-frame of an SDU starts with the 2 byte SDU length; the rest
//! of that frame and every following frame carry raw SDU bytes.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use super::constants::*;
use crate::runtime::BufferAllocator;

/// Splits one outbound SDU into K-frames
#[derive(Debug, Clone)]
pub struct Segmenter {
    sdu: Vec<u8>,
    sent: usize,
    started: bool,
}

impl Segmenter {
    pub fn new(sdu: Vec<u8>) -> Self {
        Self {
            sdu,
            sent: 0,
            started: false,
        }
    }

    /// Total SDU length
    pub fn total(&self) -> usize {
        self.sdu.len()
    }

    /// SDU bytes already handed out
    pub fn sent(&self) -> usize {
        self.sent
    }

    pub fn is_complete(&self) -> bool {
        self.started && self.sent >= self.sdu.len()
    }

    /// Builds the next K-frame for a peer accepting `mps` byte frames
    pub fn next_fragment(&mut self, mps: u16) -> Option<Vec<u8>> {
        if self.is_complete() {
            return None;
        }

        let mps = mps as usize;
        let remaining = self.sdu.len() - self.sent;

        if !self.started {
            let take = remaining.min(mps.saturating_sub(L2CAP_SDU_LENGTH_SIZE));
            let mut frame = Vec::with_capacity(L2CAP_SDU_LENGTH_SIZE + take);
            frame.extend_from_slice(&(self.sdu.len() as u16).to_le_bytes());
            frame.extend_from_slice(&self.sdu[..take]);

            self.started = true;
            self.sent = take;
            return Some(frame);
        }

        if mps == 0 {
            return None;
        }

        let take = remaining.min(mps);
        let frame = self.sdu[self.sent..self.sent + take].to_vec();
        self.sent += take;
        Some(frame)
    }
}

/// Reasons an inbound K-frame breaks the SAR rules
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("First K-frame is {0} bytes, too short for the SDU length")]
    MissingSduLength(usize),

    #[error("SDU length {length} exceeds the local MTU {mtu}")]
    SduTooLarge { length: usize, mtu: u16 },

    #[error("K-frame overruns the SDU: {received} of {expected} bytes")]
    Overrun { received: usize, expected: usize },

    #[error("No buffer available for a {0} byte SDU")]
    NoBuffer(usize),
}

/// Collects inbound K-frames into SDUs
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: Option<Vec<u8>>,
    total: usize,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a partial SDU is buffered
    pub fn in_progress(&self) -> bool {
        self.buffer.is_some()
    }

    /// Bytes buffered for the SDU in progress
    pub fn received(&self) -> usize {
        self.buffer.as_ref().map_or(0, Vec::len)
    }

    /// Feeds one K-frame. Returns the SDU once its last byte arrived.
    pub fn push(
        &mut self,
        frame: &[u8],
        mtu: u16,
        buffers: &dyn BufferAllocator,
    ) -> Result<Option<Vec<u8>>, ReassemblyError> {
        let Some(buffer) = self.buffer.as_mut() else {
            return self.start(frame, mtu, buffers);
        };

        let expected = self.total;
        if frame.len() > expected - buffer.len() {
            let received = buffer.len() + frame.len();
            self.reset(buffers);
            return Err(ReassemblyError::Overrun { received, expected });
        }

        buffer.extend_from_slice(frame);
        if buffer.len() < expected {
            return Ok(None);
        }

        let sdu = buffer.to_vec();
        self.reset(buffers);
        Ok(Some(sdu))
    }

    /// Drops any partial SDU
    pub fn reset(&mut self, buffers: &dyn BufferAllocator) {
        if let Some(buffer) = self.buffer.take() {
            buffers.release(buffer);
        }
        self.total = 0;
    }

    fn start(
        &mut self,
        frame: &[u8],
        mtu: u16,
        buffers: &dyn BufferAllocator,
    ) -> Result<Option<Vec<u8>>, ReassemblyError> {
        if frame.len() < L2CAP_SDU_LENGTH_SIZE {
            return Err(ReassemblyError::MissingSduLength(frame.len()));
        }

        let total = LittleEndian::read_u16(frame) as usize;
        if total > mtu as usize {
            return Err(ReassemblyError::SduTooLarge { length: total, mtu });
        }

        let payload = &frame[L2CAP_SDU_LENGTH_SIZE..];
        if payload.len() > total {
            return Err(ReassemblyError::Overrun {
                received: payload.len(),
                expected: total,
            });
        }

        // Whole SDU in one frame
        if payload.len() == total {
            return Ok(Some(payload.to_vec()));
        }

        let mut buffer = buffers.allocate(total).ok_or(ReassemblyError::NoBuffer(total))?;
        buffer.extend_from_slice(payload);

        self.buffer = Some(buffer);
        self.total = total;
        Ok(None)
    }
}
