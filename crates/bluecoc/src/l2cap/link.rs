//! Per link state: security, flow and outstanding signaling requests

use std::collections::HashMap;
use std::time::Duration;

use super::types::*;
use crate::runtime::TimerId;

/// What an outstanding signaling request is waiting for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingKind {
    /// LE credit based connection request for one channel
    Connect { cid: ChannelId },
    /// Disconnection request for one channel
    Disconnect { cid: ChannelId },
    /// Enhanced connection request for a batch of channels
    EnhancedConnect {
        registration: RegistrationId,
        cids: Vec<ChannelId>,
    },
    /// Reconfiguration of a batch of channels, reported to `registration`
    Reconfigure {
        registration: RegistrationId,
        cids: Vec<ChannelId>,
        mtu: u16,
        mps: u16,
    },
}

/// An outstanding request and the timer guarding it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub kind: PendingKind,
    pub timer: TimerId,
}

/// State kept for one radio connection
#[derive(Debug)]
pub struct LinkContext {
    pub handle: ConnHandle,
    pub conn_id: u8,
    pub role: LinkRole,
    pub conn_interval: Duration,
    /// Set while the lower transport cannot take data
    pub flow_disabled: bool,
    pub security: SecurityLevel,
    next_signal_id: u8,
    pending: HashMap<u8, PendingRequest>,
}

impl LinkContext {
    pub fn new(handle: ConnHandle, conn_id: u8, role: LinkRole, conn_interval: Duration) -> Self {
        Self {
            handle,
            conn_id,
            role,
            conn_interval,
            flow_disabled: false,
            security: SecurityLevel::None,
            next_signal_id: 1,
            pending: HashMap::new(),
        }
    }

    /// Next identifier that is neither zero nor owned by a pending request
    pub fn allocate_signal_id(&mut self) -> Option<u8> {
        for _ in 0..u8::MAX {
            let id = self.next_signal_id;
            self.next_signal_id = match id.wrapping_add(1) {
                0 => 1,
                next => next,
            };

            if !self.pending.contains_key(&id) {
                return Some(id);
            }
        }

        None
    }

    pub fn insert_pending(&mut self, signal_id: u8, request: PendingRequest) {
        self.pending.insert(signal_id, request);
    }

    pub fn pending(&self, signal_id: u8) -> Option<&PendingRequest> {
        self.pending.get(&signal_id)
    }

    pub fn take_pending(&mut self, signal_id: u8) -> Option<PendingRequest> {
        self.pending.remove(&signal_id)
    }

    /// Removes and returns every outstanding request
    pub fn drain_pending(&mut self) -> Vec<PendingRequest> {
        self.pending.drain().map(|(_, request)| request).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
