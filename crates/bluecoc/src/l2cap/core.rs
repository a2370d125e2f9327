//! L2CAP Core Manager implementation
//!
//! This module provides the core L2CAP manager that handles:
//! - Channel management
//! - Data routing with credit based flow control
//! - Signaling commands, including the enhanced (multi channel) ones
//! - Connection setup, reconfiguration and teardown
//!
//! All methods run inside the single dispatch context. The only state shared
//! with another context is the pool's CID occupancy map.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use log::{debug, info, trace, warn};

use super::batch;
use super::channel::{ChannelContext, PeerParameters};
use super::constants::*;
use super::link::{LinkContext, PendingKind, PendingRequest};
use super::packet::CommandHeader;
use super::pool::{ChannelPool, CidMap};
use super::psm::PSM;
use super::registry::{Registration, RegistrationTable};
use super::sar::Segmenter;
use super::signaling::SignalingMessage;
use super::types::*;
use crate::runtime::{BufferAllocator, Event, FrameSink, TimerId, TimerService};

/// How a run of the transmit loop ended when it did not just run dry
enum PumpOutcome {
    Completed,
    Failed,
}

/// Why an outstanding request ended without a proper response
#[derive(Clone, Copy)]
enum RequestFailure {
    Rejected,
    TimedOut,
}

/// L2CAP Manager responsible for LE credit based channels
pub struct L2capManager {
    config: L2capConfig,

    /// Registered PSMs
    registry: RegistrationTable,

    /// Channels indexed by local CID
    pool: ChannelPool,

    /// Open links
    links: HashMap<ConnHandle, LinkContext>,

    transport: Arc<dyn FrameSink>,
    timers: Arc<dyn TimerService>,
    buffers: Arc<dyn BufferAllocator>,
}

impl L2capManager {
    /// Create a new L2CAP manager
    pub fn new(
        config: L2capConfig,
        transport: Arc<dyn FrameSink>,
        timers: Arc<dyn TimerService>,
        buffers: Arc<dyn BufferAllocator>,
    ) -> Self {
        Self {
            registry: RegistrationTable::new(config.max_registrations),
            pool: ChannelPool::new(config.max_channels),
            links: HashMap::new(),
            config,
            transport,
            timers,
            buffers,
        }
    }

    pub fn config(&self) -> &L2capConfig {
        &self.config
    }

    /// Register a PSM
    pub fn register(&mut self, registration: Registration) -> L2capResult<RegistrationId> {
        let psm = registration.psm;
        let id = self.registry.register(registration)?;
        info!("Registered {} as {:?}", psm, id);
        Ok(id)
    }

    /// Unregister a PSM. Every channel it owns must be closed first.
    pub fn deregister(&mut self, id: RegistrationId) -> L2capResult<()> {
        if self.pool.iter().any(|channel| channel.registration == id) {
            return Err(L2capError::RegistrationInUse);
        }

        let registration = self.registry.remove(id).ok_or(L2capError::PsmNotRegistered)?;
        info!("Unregistered {}", registration.psm);
        Ok(())
    }

    pub fn registration(&self, id: RegistrationId) -> Option<&Registration> {
        self.registry.get(id)
    }

    /// Occupancy map to hand to the receive path
    pub fn occupancy(&self) -> CidMap {
        self.pool.occupancy()
    }

    pub fn channel(&self, cid: ChannelId) -> Option<&ChannelContext> {
        self.pool.get(cid)
    }

    pub fn channels_on_link(&self, handle: ConnHandle) -> Vec<ChannelId> {
        self.pool.cids_on_link(handle)
    }

    pub fn link(&self, handle: ConnHandle) -> Option<&LinkContext> {
        self.links.get(&handle)
    }

    /// Whether a new SDU can be handed to the channel right now
    pub fn is_flow_enabled(&self, cid: ChannelId) -> bool {
        let Some(channel) = self.pool.get(cid) else {
            return false;
        };

        channel.is_connected()
            && channel.tx.is_none()
            && self
                .links
                .get(&channel.handle)
                .is_some_and(|link| !link.flow_disabled)
    }

    /// Route one event from the queue
    pub fn handle_event(&mut self, event: &Event) {
        match event {
            Event::LinkOpened {
                handle,
                conn_id,
                role,
                conn_interval,
            } => self.link_opened(*handle, *conn_id, *role, *conn_interval),
            Event::LinkClosed { handle } => self.link_closed(*handle),
            Event::LinkFlow { handle, enabled } => {
                if let Err(e) = self.set_link_flow(*handle, *enabled) {
                    debug!("Flow change ignored: {}", e);
                }
            }
            Event::Frame { handle, cid, payload } => self.handle_frame(*handle, *cid, payload),
            Event::TimerExpired(timer) => self.handle_timer(*timer),
        }
    }

    /// Handle a link-open notification
    pub fn link_opened(&mut self, handle: ConnHandle, conn_id: u8, role: LinkRole, conn_interval: Duration) {
        if self.links.contains_key(&handle) {
            warn!("Link 0x{:04X} is already open", handle);
            return;
        }

        info!("Link 0x{:04X} opened as {:?}", handle, role);
        self.links
            .insert(handle, LinkContext::new(handle, conn_id, role, conn_interval));
    }

    /// Handle a link-close notification: every channel on the link goes away
    pub fn link_closed(&mut self, handle: ConnHandle) {
        let Some(mut link) = self.links.remove(&handle) else {
            debug!("Close for unknown link 0x{:04X}", handle);
            return;
        };

        for request in link.drain_pending() {
            self.timers.stop(request.timer);
        }

        for cid in self.pool.cids_on_link(handle) {
            self.close_channel(cid, DisconnectReason::LinkClosed);
        }

        info!("Link 0x{:04X} closed", handle);
    }

    pub fn set_link_security(&mut self, handle: ConnHandle, level: SecurityLevel) -> L2capResult<()> {
        let link = self.links.get_mut(&handle).ok_or(L2capError::LinkNotFound(handle))?;
        link.security = level;
        Ok(())
    }

    /// Lower transport flow control for a whole link
    pub fn set_link_flow(&mut self, handle: ConnHandle, enabled: bool) -> L2capResult<()> {
        let link = self.links.get_mut(&handle).ok_or(L2capError::LinkNotFound(handle))?;
        let was_disabled = link.flow_disabled;
        link.flow_disabled = !enabled;

        if !enabled || !was_disabled {
            return Ok(());
        }

        debug!("Flow re-enabled on link 0x{:04X}", handle);

        for cid in self.pool.cids_on_link(handle) {
            let Some(channel) = self.pool.get(cid) else {
                continue;
            };
            if !channel.is_connected() {
                continue;
            }

            if channel.tx.is_some() {
                self.pump(cid);
            } else {
                let registration = channel.registration;
                self.notify(registration, CocEvent::FlowEnabled { handle, cid });
            }
        }

        Ok(())
    }

    /// Open an LE credit based channel
    pub fn connect(&mut self, registration: RegistrationId, handle: ConnHandle) -> L2capResult<ChannelId> {
        let (psm, config) = self.initiator_registration(registration)?;
        let signal_id = self.next_signal_id(handle)?;
        let ceiling = self.config.max_credits;

        let cid = self
            .pool
            .allocate(|cid| ChannelContext::outgoing(registration, psm, handle, cid, &config, ceiling, signal_id))
            .ok_or(L2capError::ResourceLimitReached)?;

        let request = SignalingMessage::LeCreditBasedConnectionRequest {
            identifier: signal_id,
            le_psm: psm.value(),
            source_cid: cid,
            mtu: config.mtu,
            mps: config.mps,
            initial_credits: config.initial_credits,
        };

        if let Err(e) = self.send_signal(handle, &request) {
            self.release_channel(cid);
            return Err(e);
        }

        self.track_request(handle, signal_id, PendingKind::Connect { cid });
        debug!("Connecting channel 0x{:04X} to {} on link 0x{:04X}", cid, psm, handle);

        Ok(cid)
    }

    /// Open up to five channels with one enhanced credit based request
    pub fn enhanced_connect(
        &mut self,
        registration: RegistrationId,
        handle: ConnHandle,
        count: usize,
    ) -> L2capResult<Vec<ChannelId>> {
        if count == 0 || count > L2CAP_ENHANCED_MAX_CHANNELS {
            return Err(L2capError::InvalidParameter(format!(
                "{} channels requested in one batch",
                count
            )));
        }

        let (psm, config) = self.initiator_registration(registration)?;
        if !config.validate_enhanced() {
            return Err(L2capError::InvalidParameter(format!(
                "MTU {} / MPS {} too small for enhanced channels",
                config.mtu, config.mps
            )));
        }

        if self.pool.free_slots() < count {
            return Err(L2capError::ResourceLimitReached);
        }

        let signal_id = self.next_signal_id(handle)?;
        let ceiling = self.config.max_credits;

        let mut cids = Vec::with_capacity(count);
        for _ in 0..count {
            let allocated = self
                .pool
                .allocate(|cid| ChannelContext::outgoing(registration, psm, handle, cid, &config, ceiling, signal_id));

            match allocated {
                Some(cid) => cids.push(cid),
                None => {
                    for cid in cids {
                        self.release_channel(cid);
                    }
                    return Err(L2capError::ResourceLimitReached);
                }
            }
        }

        let request = SignalingMessage::CreditBasedConnectionRequest {
            identifier: signal_id,
            spsm: psm.value(),
            mtu: config.mtu,
            mps: config.mps,
            initial_credits: config.initial_credits,
            source_cids: cids.clone(),
        };

        if let Err(e) = self.send_signal(handle, &request) {
            for cid in &cids {
                self.release_channel(*cid);
            }
            return Err(e);
        }

        self.track_request(
            handle,
            signal_id,
            PendingKind::EnhancedConnect {
                registration,
                cids: cids.clone(),
            },
        );
        debug!("Requested {} enhanced channels {:?} on link 0x{:04X}", count, cids, handle);

        Ok(cids)
    }

    /// Change MTU and MPS of up to five connected channels at once.
    ///
    /// The request is refused locally when the MTU is smaller than a
    /// channel's current peer MTU, or when the MPS shrinks on more than one
    /// channel.
    pub fn enhanced_reconfigure(
        &mut self,
        handle: ConnHandle,
        cids: &[ChannelId],
        mtu: u16,
        mps: u16,
    ) -> L2capResult<()> {
        if cids.is_empty() || cids.len() > L2CAP_ENHANCED_MAX_CHANNELS {
            return Err(L2capError::InvalidParameter(format!(
                "{} channels in one reconfiguration",
                cids.len()
            )));
        }

        if !self.links.contains_key(&handle) {
            return Err(L2capError::LinkNotFound(handle));
        }

        let mut channels = Vec::with_capacity(cids.len());
        for cid in cids {
            let channel = self
                .pool
                .get(*cid)
                .filter(|channel| channel.handle == handle)
                .ok_or(L2capError::ChannelNotFound)?;
            if !channel.is_connected() {
                return Err(L2capError::InvalidState);
            }
            channels.push(channel);
        }

        let result = batch::check_local_reconfigure(&channels, mtu, mps);
        if !result.is_success() {
            debug!("Reconfiguration of {:?} refused locally: {}", cids, result);
            return Err(L2capError::ReconfigureRejected(result));
        }

        let registration = channels[0].registration;
        let signal_id = self.next_signal_id(handle)?;
        let request = SignalingMessage::CreditBasedReconfigureRequest {
            identifier: signal_id,
            mtu,
            mps,
            destination_cids: cids.to_vec(),
        };
        self.send_signal(handle, &request)?;

        self.track_request(
            handle,
            signal_id,
            PendingKind::Reconfigure {
                registration,
                cids: cids.to_vec(),
                mtu,
                mps,
            },
        );

        Ok(())
    }

    /// Close a channel. Closing a channel that is gone or already closing
    /// does nothing.
    pub fn disconnect(&mut self, cid: ChannelId) -> L2capResult<()> {
        let Some(channel) = self.pool.get(cid) else {
            debug!("Channel 0x{:04X} is already closed", cid);
            return Ok(());
        };

        match channel.state {
            L2capChannelState::Connecting => self.close_channel(cid, DisconnectReason::LocalRequest),
            L2capChannelState::Connected => self.begin_disconnect(cid, DisconnectReason::LocalRequest),
            L2capChannelState::Disconnecting | L2capChannelState::Unused => {}
        }

        Ok(())
    }

    /// Send an SDU. Only one SDU may be in flight per channel.
    pub fn send(&mut self, cid: ChannelId, sdu: Vec<u8>) -> L2capResult<()> {
        let channel = self.pool.get_mut(cid).ok_or(L2capError::ChannelNotFound)?;

        if !channel.is_connected() {
            return Err(L2capError::InvalidState);
        }

        if sdu.len() > channel.peer_mtu as usize {
            return Err(L2capError::MtuExceeded);
        }

        if channel.tx.is_some() {
            return Err(L2capError::TxOverflow);
        }

        trace!("Queued {} byte SDU on channel 0x{:04X}", sdu.len(), cid);
        channel.tx = Some(Segmenter::new(sdu));
        self.pump(cid);

        Ok(())
    }

    /// Grant the peer extra credits on a channel
    pub fn give_credits(&mut self, cid: ChannelId, credits: u16) -> L2capResult<()> {
        if credits == 0 {
            return Err(L2capError::InvalidParameter("Zero credits".into()));
        }

        let handle = {
            let channel = self.pool.get(cid).ok_or(L2capError::ChannelNotFound)?;
            if !channel.is_connected() {
                return Err(L2capError::InvalidState);
            }
            channel.handle
        };

        let identifier = self.next_signal_id(handle)?;
        let channel = self.pool.get_mut(cid).ok_or(L2capError::ChannelNotFound)?;
        channel.flow.grant_local(credits)?;

        self.send_signal(
            handle,
            &SignalingMessage::FlowControlCredit {
                identifier,
                cid,
                credits,
            },
        )
    }

    /// Send a frame on a fixed channel of a link
    pub fn send_fixed(&self, handle: ConnHandle, cid: ChannelId, payload: &[u8]) -> L2capResult<()> {
        if !self.links.contains_key(&handle) {
            return Err(L2capError::LinkNotFound(handle));
        }

        trace!("TX on fixed CID 0x{:04X}: {}", cid, hex::encode(payload));
        self.transport.send_frame(handle, cid, payload)?;
        Ok(())
    }

    /// Handle a frame received on a link
    pub fn handle_frame(&mut self, handle: ConnHandle, cid: ChannelId, payload: &[u8]) {
        if !self.links.contains_key(&handle) {
            debug!("Frame for unknown link 0x{:04X}", handle);
            return;
        }

        match cid {
            L2CAP_LE_SIGNALING_CID => self.handle_signaling(handle, payload),
            L2CAP_DYNAMIC_CID_MIN..=L2CAP_DYNAMIC_CID_MAX => self.handle_data(handle, cid, payload),
            _ => trace!("Ignoring frame on fixed CID 0x{:04X}", cid),
        }
    }

    /// Handle an expired request timer
    pub fn handle_timer(&mut self, timer: TimerId) {
        let TimerId::Signaling { handle, signal_id } = timer else {
            return;
        };

        let Some(request) = self
            .links
            .get_mut(&handle)
            .and_then(|link| link.take_pending(signal_id))
        else {
            debug!("Stale timer for request {} on link 0x{:04X}", signal_id, handle);
            return;
        };

        warn!("Request {} on link 0x{:04X} timed out", signal_id, handle);
        self.fail_request(handle, signal_id, request.kind, RequestFailure::TimedOut);
    }

    fn handle_signaling(&mut self, handle: ConnHandle, data: &[u8]) {
        trace!("RX signaling on 0x{:04X}: {}", handle, hex::encode(data));

        let Some(header) = CommandHeader::parse(data) else {
            warn!("Signaling frame too short on link 0x{:04X}", handle);
            return;
        };

        match SignalingMessage::decode(&header, &data[L2CAP_COMMAND_HEADER_SIZE..]) {
            Ok(message) => self.handle_signaling_message(handle, message),
            Err(L2capError::UnknownCommand(code)) => {
                debug!("Unknown signaling command 0x{:02X}", code);
                self.reject(handle, header.identifier, L2CAP_REJECT_NOT_UNDERSTOOD, Vec::new());
            }
            Err(e) => {
                if is_request_code(header.code) {
                    warn!("Malformed request 0x{:02X}: {}", header.code, e);
                    self.reject(handle, header.identifier, L2CAP_REJECT_NOT_UNDERSTOOD, Vec::new());
                } else {
                    debug!("Ignoring malformed command 0x{:02X}: {}", header.code, e);
                }
            }
        }
    }

    fn handle_signaling_message(&mut self, handle: ConnHandle, message: SignalingMessage) {
        match message {
            SignalingMessage::CommandReject {
                identifier, reason, ..
            } => self.on_command_reject(handle, identifier, reason),

            SignalingMessage::DisconnectionRequest {
                identifier,
                destination_cid,
                source_cid,
            } => self.on_disconnection_request(handle, identifier, destination_cid, source_cid),

            SignalingMessage::DisconnectionResponse { identifier, .. } => {
                self.on_disconnection_response(handle, identifier)
            }

            SignalingMessage::LeCreditBasedConnectionRequest {
                identifier,
                le_psm,
                source_cid,
                mtu,
                mps,
                initial_credits,
            } => self.on_connection_request(
                handle,
                identifier,
                le_psm,
                PeerParameters {
                    cid: source_cid,
                    mtu,
                    mps,
                    credits: initial_credits,
                },
            ),

            SignalingMessage::LeCreditBasedConnectionResponse {
                identifier,
                destination_cid,
                mtu,
                mps,
                initial_credits,
                result,
            } => self.on_connection_response(
                handle,
                identifier,
                PeerParameters {
                    cid: destination_cid,
                    mtu,
                    mps,
                    credits: initial_credits,
                },
                result,
            ),

            SignalingMessage::FlowControlCredit { cid, credits, .. } => {
                self.on_flow_control_credit(handle, cid, credits)
            }

            SignalingMessage::CreditBasedConnectionRequest {
                identifier,
                spsm,
                mtu,
                mps,
                initial_credits,
                source_cids,
            } => self.on_enhanced_connection_request(
                handle,
                identifier,
                spsm,
                mtu,
                mps,
                initial_credits,
                &source_cids,
            ),

            SignalingMessage::CreditBasedConnectionResponse {
                identifier,
                mtu,
                mps,
                initial_credits,
                result,
                destination_cids,
            } => self.on_enhanced_connection_response(
                handle,
                identifier,
                mtu,
                mps,
                initial_credits,
                result,
                &destination_cids,
            ),

            SignalingMessage::CreditBasedReconfigureRequest {
                identifier,
                mtu,
                mps,
                destination_cids,
            } => self.on_reconfigure_request(handle, identifier, mtu, mps, &destination_cids),

            SignalingMessage::CreditBasedReconfigureResponse { identifier, result } => {
                self.on_reconfigure_response(handle, identifier, result)
            }
        }
    }

    /// Handle an LE Credit Based Connection Request
    fn on_connection_request(&mut self, handle: ConnHandle, identifier: u8, le_psm: u16, peer: PeerParameters) {
        let outcome = self
            .check_incoming(handle, le_psm, peer.mtu, peer.mps, false)
            .and_then(|registration| {
                self.check_source_cid(handle, peer.cid, &[])?;
                if self.permitted(handle, registration, 1) == 0 {
                    return Err(ConnectionResult::NoResources);
                }
                self.open_incoming(handle, registration, identifier, peer)
            });

        let response = match &outcome {
            Ok((cid, config)) => SignalingMessage::LeCreditBasedConnectionResponse {
                identifier,
                destination_cid: *cid,
                mtu: config.mtu,
                mps: config.mps,
                initial_credits: config.initial_credits,
                result: L2CAP_RESULT_SUCCESS,
            },
            Err(result) => {
                debug!("Refusing connection for PSM 0x{:04X}: {}", le_psm, result);
                SignalingMessage::LeCreditBasedConnectionResponse {
                    identifier,
                    destination_cid: 0,
                    mtu: 0,
                    mps: 0,
                    initial_credits: 0,
                    result: result.value(),
                }
            }
        };

        self.respond(handle, response);

        if let Ok((cid, _)) = outcome {
            self.announce_connected(cid, false);
        }
    }

    /// Handle an LE Credit Based Connection Response
    fn on_connection_response(&mut self, handle: ConnHandle, identifier: u8, peer: PeerParameters, result: u16) {
        let Some(cid) = self.take_request(handle, identifier, |kind| match kind {
            PendingKind::Connect { cid } => Some(*cid),
            _ => None,
        }) else {
            debug!("Unmatched connection response {} on link 0x{:04X}", identifier, handle);
            return;
        };

        let result = ConnectionResult::from_value(result);

        if !self.is_live(handle, cid, identifier, L2capChannelState::Connecting) {
            if result.is_success() {
                self.disconnect_orphan(handle, cid, peer.cid);
            }
            return;
        }

        if !result.is_success() {
            self.close_channel(cid, DisconnectReason::Refused(result));
            return;
        }

        if batch::accepted_peer_cid(Some(peer.cid)).is_none() {
            warn!("Connection response for 0x{:04X} carries CID 0x{:04X}", cid, peer.cid);
            self.close_channel(cid, DisconnectReason::ProtocolViolation);
            return;
        }

        if let Some(channel) = self.pool.get_mut(cid) {
            channel.complete(peer);
        }

        if !batch::peer_parameters_valid(peer.mtu, peer.mps, false) {
            self.protocol_violation(cid, "unusable parameters in connection response");
            return;
        }

        self.announce_connected(cid, true);
    }

    /// Handle a Credit Based Connection Request for several channels
    #[allow(clippy::too_many_arguments)]
    fn on_enhanced_connection_request(
        &mut self,
        handle: ConnHandle,
        identifier: u8,
        spsm: u16,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
        source_cids: &[ChannelId],
    ) {
        let mut destination_cids = vec![0u16; source_cids.len()];
        let mut accepted = Vec::new();
        let mut result = ConnectionResult::Success;
        let mut local = None;

        match self.check_incoming(handle, spsm, mtu, mps, true) {
            Err(failure) => result = failure,
            Ok(registration) => {
                let Some(config) = self.registry.get(registration).map(|entry| entry.config) else {
                    return;
                };
                let permitted = self.permitted(handle, registration, source_cids.len());

                for (index, source_cid) in source_cids.iter().copied().enumerate() {
                    let verdict = if !config.validate_enhanced() || accepted.len() >= permitted {
                        Err(ConnectionResult::NoResources)
                    } else {
                        self.check_source_cid(handle, source_cid, &source_cids[..index])
                            .and_then(|_| {
                                let peer = PeerParameters {
                                    cid: source_cid,
                                    mtu,
                                    mps,
                                    credits: initial_credits,
                                };
                                self.open_incoming(handle, registration, identifier, peer)
                            })
                    };

                    match verdict {
                        Ok((cid, _)) => {
                            destination_cids[index] = cid;
                            accepted.push(cid);
                        }
                        Err(failure) => {
                            if result.is_success() {
                                result = failure;
                            }
                        }
                    }
                }

                local = Some((registration, config));
            }
        }

        let (mtu_out, mps_out, credits_out) = match local {
            Some((_, config)) if !accepted.is_empty() => (config.mtu, config.mps, config.initial_credits),
            _ => (0, 0, 0),
        };

        self.respond(
            handle,
            SignalingMessage::CreditBasedConnectionResponse {
                identifier,
                mtu: mtu_out,
                mps: mps_out,
                initial_credits: credits_out,
                result: result.value(),
                destination_cids,
            },
        );

        if let Some((registration, _)) = local {
            if !accepted.is_empty() {
                info!(
                    "Accepted {} of {} enhanced channels on link 0x{:04X}",
                    accepted.len(),
                    source_cids.len(),
                    handle
                );
                self.notify(
                    registration,
                    CocEvent::EnhancedConnected {
                        handle,
                        result,
                        cids: accepted,
                        peer_mtu: mtu,
                        peer_mps: mps,
                        initiator: false,
                    },
                );
            }
        }
    }

    /// Handle a Credit Based Connection Response: every channel of the batch
    /// ends up connected or freed
    #[allow(clippy::too_many_arguments)]
    fn on_enhanced_connection_response(
        &mut self,
        handle: ConnHandle,
        identifier: u8,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
        result: u16,
        destination_cids: &[ChannelId],
    ) {
        let Some((registration, cids)) = self.take_request(handle, identifier, |kind| match kind {
            PendingKind::EnhancedConnect { registration, cids } => Some((*registration, cids.clone())),
            _ => None,
        }) else {
            debug!("Unmatched enhanced connection response {} on link 0x{:04X}", identifier, handle);
            return;
        };

        let result = ConnectionResult::from_value(result);
        let parameters_valid = batch::peer_parameters_valid(mtu, mps, true);
        let mut accepted = Vec::new();

        for (index, cid) in cids.iter().copied().enumerate() {
            let peer_cid = batch::accepted_peer_cid(destination_cids.get(index).copied());
            let live = self.is_live(handle, cid, identifier, L2capChannelState::Connecting);

            match (live, peer_cid) {
                (true, Some(peer_cid))
                    if parameters_valid && self.pool.find_by_peer(handle, peer_cid).is_none() =>
                {
                    if let Some(channel) = self.pool.get_mut(cid) {
                        channel.complete(PeerParameters {
                            cid: peer_cid,
                            mtu,
                            mps,
                            credits: initial_credits,
                        });
                        accepted.push(cid);
                    }
                }
                (true, Some(peer_cid)) => {
                    warn!("Dropping enhanced channel 0x{:04X}: unusable response entry", cid);
                    self.release_channel(cid);
                    if self.pool.find_by_peer(handle, peer_cid).is_none() {
                        self.disconnect_orphan(handle, cid, peer_cid);
                    }
                }
                (true, None) => {
                    self.release_channel(cid);
                }
                (false, Some(peer_cid)) => self.disconnect_orphan(handle, cid, peer_cid),
                (false, None) => {}
            }
        }

        info!(
            "Enhanced connection {} on link 0x{:04X}: {} of {} channels open",
            result,
            handle,
            accepted.len(),
            cids.len()
        );

        self.notify(
            registration,
            CocEvent::EnhancedConnected {
                handle,
                result,
                cids: accepted,
                peer_mtu: mtu,
                peer_mps: mps,
                initiator: true,
            },
        );
    }

    /// Handle a Credit Based Reconfigure Request from the peer
    fn on_reconfigure_request(&mut self, handle: ConnHandle, identifier: u8, mtu: u16, mps: u16, peer_cids: &[ChannelId]) {
        let local: Vec<Option<ChannelId>> = peer_cids
            .iter()
            .map(|peer_cid| {
                self.pool
                    .find_by_peer(handle, *peer_cid)
                    .filter(|cid| self.pool.get(*cid).is_some_and(ChannelContext::is_connected))
            })
            .collect();

        let result = {
            let channels: Vec<Option<&ChannelContext>> =
                local.iter().map(|cid| cid.and_then(|cid| self.pool.get(cid))).collect();
            batch::check_remote_reconfigure(&channels, mtu, mps)
        };

        self.respond(
            handle,
            SignalingMessage::CreditBasedReconfigureResponse {
                identifier,
                result: result.value(),
            },
        );

        if !result.is_success() {
            debug!("Refused reconfiguration of {:?}: {}", peer_cids, result);
            return;
        }

        let cids: Vec<ChannelId> = local.into_iter().flatten().collect();
        for cid in &cids {
            if let Some(channel) = self.pool.get_mut(*cid) {
                channel.peer_mtu = mtu;
                channel.peer_mps = mps;
            }
        }

        let groups = batch::group_by_registration(cids.iter().filter_map(|cid| self.pool.get(*cid)));
        for (registration, cids) in groups {
            self.notify(
                registration,
                CocEvent::EnhancedReconfigured {
                    handle,
                    result,
                    cids,
                    mtu,
                    mps,
                    remote: true,
                },
            );
        }
    }

    /// Handle a Credit Based Reconfigure Response
    fn on_reconfigure_response(&mut self, handle: ConnHandle, identifier: u8, result: u16) {
        let Some(kind) = self.take_request(handle, identifier, |kind| match kind {
            PendingKind::Reconfigure { .. } => Some(kind.clone()),
            _ => None,
        }) else {
            debug!("Unmatched reconfigure response {} on link 0x{:04X}", identifier, handle);
            return;
        };

        self.finish_reconfigure(handle, &kind, ReconfigureResult::from_value(result));
    }

    /// Handle a Disconnection Request
    fn on_disconnection_request(
        &mut self,
        handle: ConnHandle,
        identifier: u8,
        destination_cid: ChannelId,
        source_cid: ChannelId,
    ) {
        let target = self
            .pool
            .get(destination_cid)
            .filter(|channel| {
                channel.handle == handle
                    && channel.peer_cid == source_cid
                    && matches!(
                        channel.state,
                        L2capChannelState::Connected | L2capChannelState::Disconnecting
                    )
            })
            .map(|channel| {
                let crossed = (channel.state == L2capChannelState::Disconnecting).then_some(channel.signal_id);
                (channel.disconnect_reason.unwrap_or(DisconnectReason::RemoteRequest), crossed)
            });

        let Some((reason, crossed)) = target else {
            debug!(
                "Disconnection request for unknown channel 0x{:04X}/0x{:04X}",
                destination_cid, source_cid
            );
            let mut data = Vec::with_capacity(4);
            data.extend_from_slice(&destination_cid.to_le_bytes());
            data.extend_from_slice(&source_cid.to_le_bytes());
            self.reject(handle, identifier, L2CAP_REJECT_INVALID_CID, data);
            return;
        };

        self.respond(
            handle,
            SignalingMessage::DisconnectionResponse {
                identifier,
                destination_cid,
                source_cid,
            },
        );

        // Our own request crossed this one and will never be answered
        if let Some(signal_id) = crossed {
            self.take_request(handle, signal_id, |kind| match kind {
                PendingKind::Disconnect { cid } if *cid == destination_cid => Some(()),
                _ => None,
            });
        }
        self.close_channel(destination_cid, reason);
    }

    /// Handle a Disconnection Response
    fn on_disconnection_response(&mut self, handle: ConnHandle, identifier: u8) {
        let Some(cid) = self.take_request(handle, identifier, |kind| match kind {
            PendingKind::Disconnect { cid } => Some(*cid),
            _ => None,
        }) else {
            debug!("Unmatched disconnection response {} on link 0x{:04X}", identifier, handle);
            return;
        };

        if let Some(reason) = self.closing_reason(handle, cid, identifier) {
            self.close_channel(cid, reason);
        }
    }

    /// Handle an LE Flow Control Credit
    fn on_flow_control_credit(&mut self, handle: ConnHandle, peer_cid: ChannelId, credits: u16) {
        let Some(cid) = self.pool.find_by_peer(handle, peer_cid) else {
            debug!("Credits for unknown channel 0x{:04X}", peer_cid);
            return;
        };

        let Some(channel) = self.pool.get_mut(cid) else {
            return;
        };
        if !channel.is_connected() {
            return;
        }

        match channel.flow.grant_peer(credits) {
            Ok(total) => {
                trace!("Channel 0x{:04X} now holds {} credits", cid, total);
                self.pump(cid);
            }
            Err(e) => self.protocol_violation(cid, &e.to_string()),
        }
    }

    /// Handle a Command Reject for one of our requests
    fn on_command_reject(&mut self, handle: ConnHandle, identifier: u8, reason: u16) {
        let Some(request) = self
            .links
            .get_mut(&handle)
            .and_then(|link| link.take_pending(identifier))
        else {
            debug!("Unmatched command reject {} on link 0x{:04X}", identifier, handle);
            return;
        };

        self.timers.stop(request.timer);
        debug!("Request {} rejected with reason 0x{:04X}", identifier, reason);
        self.fail_request(handle, identifier, request.kind, RequestFailure::Rejected);
    }

    fn handle_data(&mut self, handle: ConnHandle, cid: ChannelId, payload: &[u8]) {
        let Some(channel) = self.pool.get_mut(cid) else {
            debug!("K-frame for unallocated channel 0x{:04X}", cid);
            return;
        };

        if channel.handle != handle || !channel.is_connected() {
            debug!("Dropping K-frame for channel 0x{:04X} in state {}", cid, channel.state);
            return;
        }

        trace!("RX K-frame on 0x{:04X}: {}", cid, hex::encode(payload));

        if payload.len() > channel.local_mps as usize {
            let detail = format!("{} byte K-frame exceeds MPS {}", payload.len(), channel.local_mps);
            self.protocol_violation(cid, &detail);
            return;
        }

        let refill = match channel.flow.consume_local() {
            Ok(refill) => refill,
            Err(e) => {
                self.protocol_violation(cid, &e.to_string());
                return;
            }
        };

        let registration = channel.registration;
        let mtu = channel.local_mtu;
        let sdu = match channel.rx.push(payload, mtu, self.buffers.as_ref()) {
            Ok(sdu) => sdu,
            Err(e) => {
                self.protocol_violation(cid, &e.to_string());
                return;
            }
        };

        if let Some(credits) = refill {
            self.send_credits(handle, cid, credits);
        }

        if let Some(sdu) = sdu {
            self.notify(registration, CocEvent::DataReceived { handle, cid, sdu });
        }
    }

    /// Sends queued K-frames while credits and link flow allow it
    fn pump(&mut self, cid: ChannelId) {
        let outcome = loop {
            let Some(channel) = self.pool.get_mut(cid) else {
                return;
            };
            if !channel.is_connected() {
                return;
            }
            if self.links.get(&channel.handle).map_or(true, |link| link.flow_disabled) {
                return;
            }

            let mps = channel.peer_mps;
            let Some(segmenter) = channel.tx.as_mut() else {
                return;
            };
            if segmenter.is_complete() {
                channel.tx = None;
                break PumpOutcome::Completed;
            }
            if !channel.flow.can_send() {
                trace!("Channel 0x{:04X} waiting for credits", cid);
                return;
            }

            let Some(frame) = segmenter.next_fragment(mps) else {
                channel.tx = None;
                break PumpOutcome::Completed;
            };
            channel.flow.consume_peer();

            let (handle, peer_cid) = (channel.handle, channel.peer_cid);
            trace!("TX K-frame on 0x{:04X}: {}", cid, hex::encode(&frame));

            if let Err(e) = self.transport.send_frame(handle, peer_cid, &frame) {
                warn!("Sending on channel 0x{:04X} failed: {}", cid, e);
                if let Some(channel) = self.pool.get_mut(cid) {
                    channel.tx = None;
                }
                break PumpOutcome::Failed;
            }
        };

        let Some(channel) = self.pool.get(cid) else {
            return;
        };

        let status = match outcome {
            PumpOutcome::Completed => SendStatus::Success,
            PumpOutcome::Failed => SendStatus::Failed,
        };
        let (registration, handle) = (channel.registration, channel.handle);
        self.notify(registration, CocEvent::DataSendConfirmed { handle, cid, status });
    }

    fn check_incoming(
        &self,
        handle: ConnHandle,
        psm: u16,
        mtu: u16,
        mps: u16,
        enhanced: bool,
    ) -> Result<RegistrationId, ConnectionResult> {
        let (registration, entry) = self
            .registry
            .find_acceptor(psm)
            .ok_or(ConnectionResult::PsmNotSupported)?;

        let security = self
            .links
            .get(&handle)
            .map_or(SecurityLevel::None, |link| link.security);
        if security < entry.policy.min_security_level {
            return Err(ConnectionResult::InsufficientAuthentication);
        }

        if !entry.authorized(handle) {
            return Err(ConnectionResult::InsufficientAuthorization);
        }

        if !batch::peer_parameters_valid(mtu, mps, enhanced) {
            return Err(ConnectionResult::UnacceptableParameters);
        }

        Ok(registration)
    }

    fn check_source_cid(
        &self,
        handle: ConnHandle,
        source_cid: ChannelId,
        earlier: &[ChannelId],
    ) -> Result<(), ConnectionResult> {
        if !(L2CAP_DYNAMIC_CID_MIN..=L2CAP_DYNAMIC_CID_MAX).contains(&source_cid) {
            return Err(ConnectionResult::InvalidSourceCid);
        }

        if earlier.contains(&source_cid) || self.pool.find_by_peer(handle, source_cid).is_some() {
            return Err(ConnectionResult::SourceCidAlreadyAllocated);
        }

        Ok(())
    }

    /// Allocates an accepted channel straight into Connected
    fn open_incoming(
        &mut self,
        handle: ConnHandle,
        registration: RegistrationId,
        signal_id: u8,
        peer: PeerParameters,
    ) -> Result<(ChannelId, LeCreditBasedConfig), ConnectionResult> {
        let (psm, config) = self
            .registry
            .get(registration)
            .map(|entry| (entry.psm, entry.config))
            .ok_or(ConnectionResult::PsmNotSupported)?;

        let ceiling = self.config.max_credits;
        let cid = self
            .pool
            .allocate(|cid| ChannelContext::incoming(registration, psm, handle, cid, &config, ceiling, signal_id, peer))
            .ok_or(ConnectionResult::NoResources)?;

        Ok((cid, config))
    }

    /// How many of `requested` channels the registration accepts on a link
    fn permitted(&self, handle: ConnHandle, registration: RegistrationId, requested: usize) -> usize {
        let Some(entry) = self.registry.get(registration) else {
            return 0;
        };

        let request = AcceptRequest {
            handle,
            psm: entry.psm,
            requested: requested.min(u8::MAX as usize) as u8,
            open: self.pool.count_for(handle, registration).min(u8::MAX as usize) as u8,
        };
        entry.permitted(&request) as usize
    }

    fn announce_connected(&self, cid: ChannelId, initiator: bool) {
        let Some(channel) = self.pool.get(cid) else {
            return;
        };

        info!(
            "Channel 0x{:04X} connected to peer 0x{:04X} (MTU {}, MPS {}, {} credits)",
            cid, channel.peer_cid, channel.peer_mtu, channel.peer_mps, channel.flow.peer()
        );

        self.notify(
            channel.registration,
            CocEvent::Connected {
                handle: channel.handle,
                cid,
                psm: channel.psm,
                peer_mtu: channel.peer_mtu,
                peer_mps: channel.peer_mps,
                initiator,
            },
        );
    }

    /// Moves a connected channel to Disconnecting and asks the peer to close it
    fn begin_disconnect(&mut self, cid: ChannelId, reason: DisconnectReason) {
        let Some(channel) = self.pool.get_mut(cid) else {
            return;
        };
        if !channel.is_connected() {
            return;
        }

        channel.state = L2capChannelState::Disconnecting;
        channel.disconnect_reason = Some(reason);
        channel.rx.reset(self.buffers.as_ref());
        let (handle, peer_cid) = (channel.handle, channel.peer_cid);

        let Some(signal_id) = self
            .links
            .get_mut(&handle)
            .and_then(|link| link.allocate_signal_id())
        else {
            warn!("No signaling identifier left to close channel 0x{:04X}", cid);
            self.close_channel(cid, reason);
            return;
        };

        if let Some(channel) = self.pool.get_mut(cid) {
            channel.signal_id = signal_id;
        }

        let request = SignalingMessage::DisconnectionRequest {
            identifier: signal_id,
            destination_cid: peer_cid,
            source_cid: cid,
        };

        if let Err(e) = self.send_signal(handle, &request) {
            warn!("Could not send disconnection request for 0x{:04X}: {}", cid, e);
            self.close_channel(cid, reason);
            return;
        }

        self.track_request(handle, signal_id, PendingKind::Disconnect { cid });
        debug!("Disconnecting channel 0x{:04X}: {:?}", cid, reason);
    }

    fn protocol_violation(&mut self, cid: ChannelId, detail: &str) {
        warn!("Protocol violation on channel 0x{:04X}: {}", cid, detail);
        self.begin_disconnect(cid, DisconnectReason::ProtocolViolation);
    }

    /// Closes a channel we no longer track but the peer may still hold open
    fn disconnect_orphan(&mut self, handle: ConnHandle, cid: ChannelId, peer_cid: ChannelId) {
        let Some(identifier) = self
            .links
            .get_mut(&handle)
            .and_then(|link| link.allocate_signal_id())
        else {
            return;
        };

        debug!("Closing orphaned peer channel 0x{:04X} (was 0x{:04X})", peer_cid, cid);
        self.respond(
            handle,
            SignalingMessage::DisconnectionRequest {
                identifier,
                destination_cid: peer_cid,
                source_cid: cid,
            },
        );
    }

    fn fail_request(&mut self, handle: ConnHandle, signal_id: u8, kind: PendingKind, failure: RequestFailure) {
        let (connect_result, reconfigure_result) = match failure {
            RequestFailure::Rejected => (ConnectionResult::Rejected, ReconfigureResult::Rejected),
            RequestFailure::TimedOut => (ConnectionResult::Timeout, ReconfigureResult::Timeout),
        };

        match kind {
            PendingKind::Connect { cid } => {
                if self.is_live(handle, cid, signal_id, L2capChannelState::Connecting) {
                    let reason = match failure {
                        RequestFailure::Rejected => DisconnectReason::Refused(connect_result),
                        RequestFailure::TimedOut => DisconnectReason::Timeout,
                    };
                    self.close_channel(cid, reason);
                }
            }

            PendingKind::Disconnect { cid } => {
                if let Some(reason) = self.closing_reason(handle, cid, signal_id) {
                    let reason = match failure {
                        RequestFailure::Rejected => reason,
                        RequestFailure::TimedOut => DisconnectReason::Timeout,
                    };
                    self.close_channel(cid, reason);
                }
            }

            PendingKind::EnhancedConnect { registration, cids } => {
                for cid in cids {
                    if self.is_live(handle, cid, signal_id, L2capChannelState::Connecting) {
                        self.release_channel(cid);
                    }
                }

                self.notify(
                    registration,
                    CocEvent::EnhancedConnected {
                        handle,
                        result: connect_result,
                        cids: Vec::new(),
                        peer_mtu: 0,
                        peer_mps: 0,
                        initiator: true,
                    },
                );
            }

            PendingKind::Reconfigure { .. } => {
                let live = self.finish_reconfigure(handle, &kind, reconfigure_result);

                if let RequestFailure::TimedOut = failure {
                    for cid in live {
                        self.begin_disconnect(cid, DisconnectReason::Timeout);
                    }
                }
            }
        }
    }

    /// Applies (on success) and reports a locally started reconfiguration.
    /// The requesting registration always hears the result, with no
    /// channels when the whole batch closed in the meantime. Returns the
    /// channels of the batch that are still connected.
    fn finish_reconfigure(&mut self, handle: ConnHandle, kind: &PendingKind, result: ReconfigureResult) -> Vec<ChannelId> {
        let PendingKind::Reconfigure {
            registration,
            cids,
            mtu,
            mps,
        } = kind
        else {
            return Vec::new();
        };
        let (mtu, mps) = (*mtu, *mps);

        let live: Vec<ChannelId> = cids
            .iter()
            .copied()
            .filter(|cid| {
                self.pool
                    .get(*cid)
                    .is_some_and(|channel| channel.handle == handle && channel.is_connected())
            })
            .collect();

        if result.is_success() {
            for cid in &live {
                if let Some(channel) = self.pool.get_mut(*cid) {
                    channel.local_mtu = mtu;
                    channel.local_mps = mps;
                }
            }
        }

        let mut groups = batch::group_by_registration(live.iter().filter_map(|cid| self.pool.get(*cid)));
        if !groups.iter().any(|(id, _)| id == registration) {
            debug!("Reconfiguration {} for closed channels {:?}", result, cids);
            groups.push((*registration, Vec::new()));
        }

        for (registration, cids) in groups {
            self.notify(
                registration,
                CocEvent::EnhancedReconfigured {
                    handle,
                    result,
                    cids,
                    mtu,
                    mps,
                    remote: false,
                },
            );
        }

        live
    }

    /// Frees a channel and tells its owner why
    fn close_channel(&mut self, cid: ChannelId, reason: DisconnectReason) {
        let Some(channel) = self.release_channel(cid) else {
            return;
        };

        let handle = channel.handle;
        if channel.tx.is_some() {
            self.notify(
                channel.registration,
                CocEvent::DataSendConfirmed {
                    handle,
                    cid,
                    status: SendStatus::Aborted,
                },
            );
        }

        info!("Channel 0x{:04X} on link 0x{:04X} closed: {:?}", cid, handle, reason);
        self.notify(channel.registration, CocEvent::Disconnected { handle, cid, reason });
    }

    /// Frees a channel without telling anyone
    fn release_channel(&mut self, cid: ChannelId) -> Option<ChannelContext> {
        let mut channel = self.pool.free(cid)?;
        channel.rx.reset(self.buffers.as_ref());
        Some(channel)
    }

    fn is_live(&self, handle: ConnHandle, cid: ChannelId, signal_id: u8, state: L2capChannelState) -> bool {
        self.pool.get(cid).is_some_and(|channel| {
            channel.handle == handle && channel.signal_id == signal_id && channel.state == state
        })
    }

    /// Reason recorded for a channel waiting on the given disconnection request
    fn closing_reason(&self, handle: ConnHandle, cid: ChannelId, signal_id: u8) -> Option<DisconnectReason> {
        if !self.is_live(handle, cid, signal_id, L2capChannelState::Disconnecting) {
            return None;
        }

        self.pool
            .get(cid)
            .map(|channel| channel.disconnect_reason.unwrap_or(DisconnectReason::LocalRequest))
    }

    fn initiator_registration(&self, id: RegistrationId) -> L2capResult<(PSM, LeCreditBasedConfig)> {
        let registration = self.registry.get(id).ok_or(L2capError::PsmNotRegistered)?;

        if !registration.roles.contains(RoleMask::INITIATOR) {
            return Err(L2capError::InvalidState);
        }

        Ok((registration.psm, registration.config))
    }

    fn next_signal_id(&mut self, handle: ConnHandle) -> L2capResult<u8> {
        self.links
            .get_mut(&handle)
            .ok_or(L2capError::LinkNotFound(handle))?
            .allocate_signal_id()
            .ok_or(L2capError::ResourceLimitReached)
    }

    /// Records an outstanding request and arms its response timer
    fn track_request(&mut self, handle: ConnHandle, signal_id: u8, kind: PendingKind) {
        let timer = TimerId::Signaling { handle, signal_id };

        if let Err(e) = self.timers.start(timer, self.config.request_timeout) {
            warn!("Could not arm timer for request {}: {}", signal_id, e);
        }

        if let Some(link) = self.links.get_mut(&handle) {
            link.insert_pending(signal_id, PendingRequest { kind, timer });
        }
    }

    /// Removes the pending request `identifier` if `select` accepts its kind
    fn take_request<T, F>(&mut self, handle: ConnHandle, identifier: u8, select: F) -> Option<T>
    where
        F: Fn(&PendingKind) -> Option<T>,
    {
        let link = self.links.get_mut(&handle)?;
        let selected = select(&link.pending(identifier)?.kind)?;
        let request = link.take_pending(identifier)?;
        self.timers.stop(request.timer);
        Some(selected)
    }

    fn send_credits(&mut self, handle: ConnHandle, cid: ChannelId, credits: u16) {
        let Some(identifier) = self
            .links
            .get_mut(&handle)
            .and_then(|link| link.allocate_signal_id())
        else {
            warn!("No signaling identifier left to return credits on 0x{:04X}", cid);
            return;
        };

        trace!("Returning {} credits on channel 0x{:04X}", credits, cid);
        self.respond(
            handle,
            SignalingMessage::FlowControlCredit {
                identifier,
                cid,
                credits,
            },
        );
    }

    fn reject(&self, handle: ConnHandle, identifier: u8, reason: u16, data: Vec<u8>) {
        self.respond(
            handle,
            SignalingMessage::CommandReject {
                identifier,
                reason,
                data,
            },
        );
    }

    /// Sends a signaling command, logging instead of failing
    fn respond(&self, handle: ConnHandle, message: SignalingMessage) {
        if let Err(e) = self.send_signal(handle, &message) {
            warn!("Failed to send {:?}: {}", message, e);
        }
    }

    fn send_signal(&self, handle: ConnHandle, message: &SignalingMessage) -> L2capResult<()> {
        let bytes = message.serialize();
        trace!("TX signaling on 0x{:04X}: {}", handle, hex::encode(&bytes));
        self.transport.send_frame(handle, L2CAP_LE_SIGNALING_CID, &bytes)?;
        Ok(())
    }

    /// Delivers an event to the registration's callback
    fn notify(&self, registration: RegistrationId, event: CocEvent) {
        let Some(entry) = self.registry.get(registration) else {
            warn!("Dropping {:?} for unknown registration {:?}", event, registration);
            return;
        };

        let mut callback = entry.events.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = (*callback)(event) {
            warn!("Channel event callback failed: {}", e);
        }
    }
}

fn is_request_code(code: u8) -> bool {
    matches!(
        code,
        L2CAP_DISCONNECTION_REQUEST
            | L2CAP_LE_CREDIT_BASED_CONNECTION_REQUEST
            | L2CAP_CREDIT_BASED_CONNECTION_REQUEST
            | L2CAP_CREDIT_BASED_RECONFIGURE_REQUEST
    )
}
