//! Enhanced credit based batches
//!
//! Helpers shared by the initiator and responder sides of enhanced connect
//! and reconfigure transactions.

use super::channel::ChannelContext;
use super::constants::*;
use super::types::*;

/// Checks a reconfiguration the local side wants to start.
///
/// The new MTU may not be smaller than any targeted channel's current peer
/// MTU. The MPS may only shrink when a single channel is targeted.
pub fn check_local_reconfigure(channels: &[&ChannelContext], mtu: u16, mps: u16) -> ReconfigureResult {
    if mtu < L2CAP_ENHANCED_MIN_MTU || mps < L2CAP_ENHANCED_MIN_MPS || mps > L2CAP_LE_MAX_MPS {
        return ReconfigureResult::UnacceptableParameters;
    }

    if channels.iter().any(|channel| mtu < channel.peer_mtu) {
        return ReconfigureResult::MtuReductionNotAllowed;
    }

    if channels.len() > 1 && channels.iter().any(|channel| mps < channel.peer_mps) {
        return ReconfigureResult::MpsReductionNotAllowed;
    }

    ReconfigureResult::Success
}

/// Checks a reconfiguration requested by the peer against the values it
/// announced before. `channels` holds `None` for CIDs we do not know.
pub fn check_remote_reconfigure(channels: &[Option<&ChannelContext>], mtu: u16, mps: u16) -> ReconfigureResult {
    if channels.is_empty() || channels.iter().any(Option::is_none) {
        return ReconfigureResult::InvalidDestinationCid;
    }

    if mtu < L2CAP_ENHANCED_MIN_MTU || mps < L2CAP_ENHANCED_MIN_MPS || mps > L2CAP_LE_MAX_MPS {
        return ReconfigureResult::UnacceptableParameters;
    }

    let channels: Vec<&ChannelContext> = channels.iter().flatten().copied().collect();

    if channels.iter().any(|channel| mtu < channel.peer_mtu) {
        return ReconfigureResult::MtuReductionNotAllowed;
    }

    if channels.len() > 1 && channels.iter().any(|channel| mps < channel.peer_mps) {
        return ReconfigureResult::MpsReductionNotAllowed;
    }

    ReconfigureResult::Success
}

/// Reads one entry of an enhanced connection response.
///
/// Zero or a CID outside the LE dynamic range means the channel was refused.
pub fn accepted_peer_cid(cid: Option<ChannelId>) -> Option<ChannelId> {
    cid.filter(|cid| (L2CAP_DYNAMIC_CID_MIN..=L2CAP_DYNAMIC_CID_MAX).contains(cid))
}

/// Whether MTU and MPS announced by the peer are usable for a channel
pub fn peer_parameters_valid(mtu: u16, mps: u16, enhanced: bool) -> bool {
    let config = LeCreditBasedConfig {
        mtu,
        mps,
        initial_credits: 0,
        credit_refill: 0,
    };

    if enhanced {
        config.validate_enhanced()
    } else {
        config.validate()
    }
}

/// Groups channels by owning registration, keeping first-seen order
pub fn group_by_registration<'a, I>(channels: I) -> Vec<(RegistrationId, Vec<ChannelId>)>
where
    I: IntoIterator<Item = &'a ChannelContext>,
{
    let mut groups: Vec<(RegistrationId, Vec<ChannelId>)> = Vec::new();

    for channel in channels {
        match groups.iter_mut().find(|(registration, _)| *registration == channel.registration) {
            Some((_, cids)) => cids.push(channel.local_cid),
            None => groups.push((channel.registration, vec![channel.local_cid])),
        }
    }

    groups
}
