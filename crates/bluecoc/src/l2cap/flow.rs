//! Credit based flow control
//!
//! Every K-frame costs one credit. `local` counts the frames the peer may
//! still send to us, `peer` the frames we may still send to the peer. Both
//! counters are bounded by a ceiling; a grant that would cross it is an
//! error, never a wrap.

use super::types::*;

/// Per channel credit accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditFlow {
    local: u16,
    peer: u16,
    refill: u16,
    ceiling: u16,
}

impl CreditFlow {
    /// Initial peer credits above the ceiling are clamped to it
    pub fn new(local: u16, peer: u16, refill: u16, ceiling: u16) -> Self {
        Self {
            local: local.min(ceiling),
            peer: peer.min(ceiling),
            refill: refill.min(ceiling),
            ceiling,
        }
    }

    /// Credits we have granted and the peer has not used yet
    pub fn local(&self) -> u16 {
        self.local
    }

    /// Credits the peer has granted and we have not used yet
    pub fn peer(&self) -> u16 {
        self.peer
    }

    /// Credits granted back when the peer has used them all
    pub fn refill(&self) -> u16 {
        self.refill
    }

    pub fn ceiling(&self) -> u16 {
        self.ceiling
    }

    pub fn can_send(&self) -> bool {
        self.peer > 0
    }

    /// Takes one credit for an outbound frame
    pub fn consume_peer(&mut self) -> bool {
        if self.peer == 0 {
            return false;
        }
        self.peer -= 1;
        true
    }

    /// Applies a Flow Control Credit from the peer
    pub fn grant_peer(&mut self, credits: u16) -> L2capResult<u16> {
        self.peer = Self::checked_grant(self.peer, credits, self.ceiling)?;
        Ok(self.peer)
    }

    /// Records credits we are about to send to the peer
    pub fn grant_local(&mut self, credits: u16) -> L2capResult<u16> {
        self.local = Self::checked_grant(self.local, credits, self.ceiling)?;
        Ok(self.local)
    }

    /// Charges one credit for an inbound frame.
    ///
    /// A frame received with no local credit left is a protocol violation.
    /// When the last credit is used and automatic refill is on, the counter
    /// is reset to the refill amount and that amount is returned so the
    /// caller can send it to the peer.
    pub fn consume_local(&mut self) -> L2capResult<Option<u16>> {
        if self.local == 0 {
            return Err(L2capError::ProtocolError(
                "K-frame received without credits".into(),
            ));
        }

        self.local -= 1;

        if self.local == 0 && self.refill > 0 {
            self.local = self.refill;
            return Ok(Some(self.refill));
        }

        Ok(None)
    }

    fn checked_grant(current: u16, credits: u16, ceiling: u16) -> L2capResult<u16> {
        match current.checked_add(credits) {
            Some(total) if total <= ceiling => Ok(total),
            _ => Err(L2capError::CreditOverflow(ceiling)),
        }
    }
}
