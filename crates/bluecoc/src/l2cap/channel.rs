//! L2CAP Channel implementation
//!
//! This module provides the context of one LE credit based channel: its
//! endpoints, negotiated sizes, credit counters and the SDUs in transit.

use std::fmt;

use super::flow::CreditFlow;
use super::psm::PSM;
use super::sar::{Reassembler, Segmenter};
use super::types::*;

/// LE credit based channel context
pub struct ChannelContext {
    pub(crate) state: L2capChannelState,
    /// Registration that owns the channel
    pub(crate) registration: RegistrationId,
    pub(crate) psm: PSM,
    /// Link the channel runs on
    pub(crate) handle: ConnHandle,
    pub(crate) local_cid: ChannelId,
    /// Zero until the peer has told us its CID
    pub(crate) peer_cid: ChannelId,
    pub(crate) local_mtu: u16,
    pub(crate) local_mps: u16,
    pub(crate) peer_mtu: u16,
    pub(crate) peer_mps: u16,
    pub(crate) flow: CreditFlow,
    /// Identifier of the request that opened (or is closing) the channel
    pub(crate) signal_id: u8,
    /// Outbound SDU in flight
    pub(crate) tx: Option<Segmenter>,
    /// Inbound SDU being reassembled
    pub(crate) rx: Reassembler,
    /// Reason recorded when a local disconnect was started
    pub(crate) disconnect_reason: Option<DisconnectReason>,
    /// Whether the local side opened the channel
    pub(crate) initiator: bool,
}

impl ChannelContext {
    /// Creates a context for a channel opened by the local side
    pub(crate) fn outgoing(
        registration: RegistrationId,
        psm: PSM,
        handle: ConnHandle,
        local_cid: ChannelId,
        config: &LeCreditBasedConfig,
        ceiling: u16,
        signal_id: u8,
    ) -> Self {
        Self {
            state: L2capChannelState::Connecting,
            registration,
            psm,
            handle,
            local_cid,
            peer_cid: 0,
            local_mtu: config.mtu,
            local_mps: config.mps,
            peer_mtu: 0,
            peer_mps: 0,
            flow: CreditFlow::new(config.initial_credits, 0, config.credit_refill, ceiling),
            signal_id,
            tx: None,
            rx: Reassembler::new(),
            disconnect_reason: None,
            initiator: true,
        }
    }

    /// Creates a connected context for a channel the peer opened
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn incoming(
        registration: RegistrationId,
        psm: PSM,
        handle: ConnHandle,
        local_cid: ChannelId,
        config: &LeCreditBasedConfig,
        ceiling: u16,
        signal_id: u8,
        peer: PeerParameters,
    ) -> Self {
        let mut channel = Self::outgoing(registration, psm, handle, local_cid, config, ceiling, signal_id);
        channel.initiator = false;
        channel.complete(peer);
        channel
    }

    /// Applies the peer's parameters and moves to Connected
    pub(crate) fn complete(&mut self, peer: PeerParameters) {
        self.peer_cid = peer.cid;
        self.peer_mtu = peer.mtu;
        self.peer_mps = peer.mps;
        self.flow = CreditFlow::new(self.flow.local(), peer.credits, self.flow.refill(), self.flow.ceiling());
        self.state = L2capChannelState::Connected;
    }

    pub fn state(&self) -> L2capChannelState {
        self.state
    }

    pub fn registration(&self) -> RegistrationId {
        self.registration
    }

    pub fn psm(&self) -> PSM {
        self.psm
    }

    pub fn handle(&self) -> ConnHandle {
        self.handle
    }

    pub fn local_cid(&self) -> ChannelId {
        self.local_cid
    }

    pub fn peer_cid(&self) -> ChannelId {
        self.peer_cid
    }

    pub fn local_mtu(&self) -> u16 {
        self.local_mtu
    }

    pub fn local_mps(&self) -> u16 {
        self.local_mps
    }

    pub fn peer_mtu(&self) -> u16 {
        self.peer_mtu
    }

    pub fn peer_mps(&self) -> u16 {
        self.peer_mps
    }

    pub fn local_credits(&self) -> u16 {
        self.flow.local()
    }

    pub fn peer_credits(&self) -> u16 {
        self.flow.peer()
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Whether an outbound SDU is still being sent
    pub fn tx_pending(&self) -> bool {
        self.tx.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.state == L2capChannelState::Connected
    }
}

impl fmt::Debug for ChannelContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelContext")
            .field("state", &self.state)
            .field("handle", &self.handle)
            .field("local_cid", &self.local_cid)
            .field("peer_cid", &self.peer_cid)
            .field("local_mtu", &self.local_mtu)
            .field("peer_mtu", &self.peer_mtu)
            .field("flow", &self.flow)
            .field("tx_pending", &self.tx.is_some())
            .finish()
    }
}

/// What the peer announced for its end of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerParameters {
    pub cid: ChannelId,
    pub mtu: u16,
    pub mps: u16,
    pub credits: u16,
}
