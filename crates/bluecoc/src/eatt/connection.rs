//! Per link EATT state

use std::time::Duration;

use super::types::*;
use crate::l2cap::{ChannelId, ConnHandle, LinkRole};

/// EATT bookkeeping for one link
#[derive(Debug)]
pub struct EattConnection {
    pub handle: ConnHandle,
    pub role: LinkRole,
    pub conn_interval: Duration,
    pub state: EattState,
    pub slots: Vec<EattChannelSlot>,
    /// Target MTU/MPS while reconfiguring
    pub pending_mtu: Option<(u16, u16)>,
    /// Channel batches still to be reconfigured
    pub(crate) pending_batches: Vec<Vec<ChannelId>>,
    /// Set while the collision backoff timer runs
    pub(crate) backoff_armed: bool,
}

impl EattConnection {
    pub fn new(handle: ConnHandle, role: LinkRole, conn_interval: Duration, config: &EattConfig) -> Self {
        Self {
            handle,
            role,
            conn_interval,
            state: EattState::Idle,
            slots: (0..config.num_channels)
                .map(|index| EattChannelSlot::new(config.priority(index)))
                .collect(),
            pending_mtu: None,
            pending_batches: Vec::new(),
            backoff_armed: false,
        }
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.in_use).count()
    }

    pub fn free_slots(&self) -> usize {
        self.slots.len() - self.open_count()
    }

    pub fn slot_for_cid(&self, cid: ChannelId) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.in_use && slot.cid == cid)
    }

    /// Puts a newly opened channel into the first unused slot
    pub fn claim_slot(&mut self, cid: ChannelId, mtu: u16) -> Option<usize> {
        let index = self.slots.iter().position(|slot| !slot.in_use)?;
        let slot = &mut self.slots[index];
        slot.cid = cid;
        slot.local_mtu = mtu;
        slot.in_use = true;
        Some(index)
    }

    /// Frees the slot of a closed channel
    pub fn release_cid(&mut self, cid: ChannelId) -> Option<usize> {
        let index = self.slot_for_cid(cid)?;
        self.slots[index].clear();
        Some(index)
    }

    /// CIDs of every open bearer, in slot order
    pub fn open_cids(&self) -> Vec<ChannelId> {
        self.slots
            .iter()
            .filter(|slot| slot.in_use)
            .map(|slot| slot.cid)
            .collect()
    }

    pub fn bearer_mtu(&self, bearer: Bearer) -> Option<u16> {
        match bearer {
            Bearer::Legacy => Some(ATT_DEFAULT_MTU),
            Bearer::Enhanced(index) => self
                .slots
                .get(index)
                .filter(|slot| slot.in_use)
                .map(|slot| slot.local_mtu),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_claim_and_release() {
        let config = EattConfig {
            num_channels: 3,
            priorities: vec![1, 2],
            ..Default::default()
        };
        let mut connection = EattConnection::new(1, LinkRole::Central, Duration::from_millis(30), &config);

        assert_eq!(connection.free_slots(), 3);
        assert_eq!(connection.claim_slot(0x0040, 100), Some(0));
        assert_eq!(connection.claim_slot(0x0041, 64), Some(1));
        assert_eq!(connection.claim_slot(0x0042, 64), Some(2));
        assert_eq!(connection.claim_slot(0x0043, 64), None);

        assert_eq!(connection.release_cid(0x0041), Some(1));
        assert_eq!(connection.slots[1].priority, 2);
        assert_eq!(connection.slots[2].priority, 0);
        assert_eq!(connection.open_cids(), vec![0x0040, 0x0042]);
        assert_eq!(connection.bearer_mtu(Bearer::Enhanced(1)), None);
        assert_eq!(connection.bearer_mtu(Bearer::Enhanced(0)), Some(100));
        assert_eq!(connection.bearer_mtu(Bearer::Legacy), Some(ATT_DEFAULT_MTU));

        // Reused slot
        assert_eq!(connection.claim_slot(0x0044, 64), Some(1));
    }
}
