//! Channel pool
//!
//! Fixed table of channel contexts. Slot `i` owns local CID `0x0040 + i`.
//! Which slots are taken is mirrored in a `CidMap` shared with the receive
//! path; finding and marking a free slot happens under its lock.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::channel::ChannelContext;
use super::constants::*;
use super::types::*;

const MAX_POOL_SIZE: usize = (L2CAP_DYNAMIC_CID_MAX - L2CAP_DYNAMIC_CID_MIN + 1) as usize;

/// Occupancy of the dynamic CID range
#[derive(Debug, Clone)]
pub struct CidMap {
    slots: Arc<Mutex<Vec<bool>>>,
}

impl CidMap {
    pub fn new(size: usize) -> Self {
        Self {
            slots: Arc::new(Mutex::new(vec![false; size.min(MAX_POOL_SIZE)])),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<bool>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.lock().len()
    }

    pub fn is_allocated(&self, cid: ChannelId) -> bool {
        match cid_index(cid) {
            Some(index) => self.lock().get(index).copied().unwrap_or(false),
            None => false,
        }
    }

    /// Marks the first free slot as taken and returns its index
    pub(crate) fn claim(&self) -> Option<usize> {
        let mut slots = self.lock();
        let index = slots.iter().position(|taken| !taken)?;
        slots[index] = true;
        Some(index)
    }

    pub(crate) fn release(&self, index: usize) {
        if let Some(slot) = self.lock().get_mut(index) {
            *slot = false;
        }
    }
}

fn cid_index(cid: ChannelId) -> Option<usize> {
    if (L2CAP_DYNAMIC_CID_MIN..=L2CAP_DYNAMIC_CID_MAX).contains(&cid) {
        Some((cid - L2CAP_DYNAMIC_CID_MIN) as usize)
    } else {
        None
    }
}

fn index_cid(index: usize) -> ChannelId {
    L2CAP_DYNAMIC_CID_MIN + index as u16
}

/// Arena of channel contexts addressed by local CID
#[derive(Debug)]
pub struct ChannelPool {
    slots: Vec<Option<ChannelContext>>,
    occupancy: CidMap,
}

impl ChannelPool {
    pub fn new(size: usize) -> Self {
        let occupancy = CidMap::new(size);
        let slots = (0..occupancy.capacity()).map(|_| None).collect();

        Self { slots, occupancy }
    }

    /// Handle on the occupancy map for the receive path
    pub fn occupancy(&self) -> CidMap {
        self.occupancy.clone()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_slots(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_none()).count()
    }

    /// Allocates the lowest free CID and stores the context built for it
    pub fn allocate<F>(&mut self, build: F) -> Option<ChannelId>
    where
        F: FnOnce(ChannelId) -> ChannelContext,
    {
        let index = self.occupancy.claim()?;
        let cid = index_cid(index);
        self.slots[index] = Some(build(cid));
        Some(cid)
    }

    /// Removes a context and returns its CID to the free range
    pub fn free(&mut self, cid: ChannelId) -> Option<ChannelContext> {
        let index = cid_index(cid)?;
        let channel = self.slots.get_mut(index)?.take()?;
        self.occupancy.release(index);
        Some(channel)
    }

    pub fn get(&self, cid: ChannelId) -> Option<&ChannelContext> {
        self.slots.get(cid_index(cid)?)?.as_ref()
    }

    pub fn get_mut(&mut self, cid: ChannelId) -> Option<&mut ChannelContext> {
        self.slots.get_mut(cid_index(cid)?)?.as_mut()
    }

    /// Finds the local channel the peer knows as `peer_cid` on a link
    pub fn find_by_peer(&self, handle: ConnHandle, peer_cid: ChannelId) -> Option<ChannelId> {
        self.iter()
            .find(|channel| channel.handle == handle && channel.peer_cid == peer_cid)
            .map(|channel| channel.local_cid)
    }

    /// Local CIDs of every channel on a link, lowest first
    pub fn cids_on_link(&self, handle: ConnHandle) -> Vec<ChannelId> {
        self.iter()
            .filter(|channel| channel.handle == handle)
            .map(|channel| channel.local_cid)
            .collect()
    }

    /// Number of channels a registration holds on a link
    pub fn count_for(&self, handle: ConnHandle, registration: RegistrationId) -> usize {
        self.iter()
            .filter(|channel| channel.handle == handle && channel.registration == registration)
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelContext> {
        self.slots.iter().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::l2cap::psm::PSM;

    fn context(cid: ChannelId) -> ChannelContext {
        ChannelContext::outgoing(
            RegistrationId(0),
            PSM::EATT,
            0x0001,
            cid,
            &LeCreditBasedConfig::default(),
            L2CAP_LE_MAX_CREDITS,
            1,
        )
    }

    #[test]
    fn test_allocation_order_and_reuse() {
        let mut pool = ChannelPool::new(3);
        let map = pool.occupancy();

        assert_eq!(pool.allocate(context), Some(0x0040));
        assert_eq!(pool.allocate(context), Some(0x0041));
        assert_eq!(pool.allocate(context), Some(0x0042));
        assert_eq!(pool.allocate(context), None);
        assert!(map.is_allocated(0x0041));

        let freed = pool.free(0x0041).unwrap();
        assert_eq!(freed.local_cid(), 0x0041);
        assert!(!map.is_allocated(0x0041));
        assert!(pool.get(0x0041).is_none());

        // Lowest free CID comes back first
        assert_eq!(pool.allocate(context), Some(0x0041));
    }

    #[test]
    fn test_pool_size_is_capped_by_cid_range() {
        let pool = ChannelPool::new(1000);
        assert_eq!(pool.capacity(), 64);
    }

    #[test]
    fn test_lookup_by_peer() {
        let mut pool = ChannelPool::new(4);
        let cid = pool.allocate(context).unwrap();
        pool.get_mut(cid).unwrap().peer_cid = 0x0055;

        assert_eq!(pool.find_by_peer(0x0001, 0x0055), Some(cid));
        assert_eq!(pool.find_by_peer(0x0002, 0x0055), None);
        assert_eq!(pool.cids_on_link(0x0001), vec![cid]);
        assert_eq!(pool.count_for(0x0001, RegistrationId(0)), 1);
        assert_eq!(pool.count_for(0x0001, RegistrationId(1)), 0);
    }

    #[test]
    fn test_out_of_range_cids() {
        let mut pool = ChannelPool::new(4);
        assert!(pool.get(0x0004).is_none());
        assert!(pool.free(0x0080).is_none());
        assert!(!pool.occupancy().is_allocated(0x0005));
    }
}
