//! EATT Connection Manager
//!
//! This module provides the manager that keeps a pool of enhanced credit
//! based channels per link and spreads ATT traffic over them. It:
//! - registers the EATT PSM with the L2CAP manager
//! - opens channels in batches, after a collision backoff when the local
//!   side is not the central
//! - tracks each channel in a slot and picks slots for outbound PDUs
//! - routes received PDUs and completions to the ATT client or server

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info, trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::bearer::{self, AttBearerHandler, AttHandlers, AttRole, BearerSender};
use super::connection::EattConnection;
use super::selector::select_slot;
use super::types::*;
use crate::l2cap::constants::{L2CAP_ATTRIBUTE_PROTOCOL_CID, L2CAP_ENHANCED_MAX_CHANNELS};
use crate::l2cap::{
    ChannelId, CocEvent, CocEventCallback, ConnHandle, ConnectionResult, DisconnectReason, L2capError,
    L2capManager, L2capResult, LinkRole, ReconfigureResult, Registration, RegistrationId, RoleMask, SendStatus,
    PSM,
};
use crate::runtime::{Event, TimerId, TimerService};

/// Channel events queued by the registration callback
type Inbox = Arc<Mutex<VecDeque<CocEvent>>>;

/// EATT manager for every link of the host
pub struct EattManager {
    config: EattConfig,
    registration: Option<RegistrationId>,
    connections: HashMap<ConnHandle, EattConnection>,
    inbox: Inbox,
    timers: Arc<dyn TimerService>,
    rng: StdRng,
    handlers: AttHandlers,
    events: Option<EattEventCallback>,
}

impl EattManager {
    /// Create a new EATT manager
    pub fn new(
        config: EattConfig,
        timers: Arc<dyn TimerService>,
        client: Box<dyn AttBearerHandler>,
        server: Box<dyn AttBearerHandler>,
    ) -> EattResult<Self> {
        config.validate()?;

        Ok(Self {
            config,
            registration: None,
            connections: HashMap::new(),
            inbox: Arc::new(Mutex::new(VecDeque::new())),
            timers,
            rng: StdRng::from_entropy(),
            handlers: AttHandlers::new(client, server),
            events: None,
        })
    }

    /// Use a fixed seed for the backoff draw
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_events(mut self, events: EattEventCallback) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &EattConfig {
        &self.config
    }

    pub fn connection(&self, handle: ConnHandle) -> Option<&EattConnection> {
        self.connections.get(&handle)
    }

    /// Register the EATT PSM. Incoming channels are accepted up to the
    /// number of free slots on the link.
    pub fn register(&mut self, l2cap: &mut L2capManager) -> EattResult<RegistrationId> {
        if self.registration.is_some() {
            return Err(EattError::InvalidState);
        }

        let inbox = self.inbox.clone();
        let events: CocEventCallback = Arc::new(Mutex::new(move |event: CocEvent| -> L2capResult<()> {
            inbox.lock().unwrap_or_else(PoisonError::into_inner).push_back(event);
            Ok(())
        }));

        let slots = self.config.num_channels;
        let registration = Registration::new(PSM::EATT, RoleMask::all(), self.config.channel, events)
            .with_accept(move |request| slots.saturating_sub(request.open as usize).min(u8::MAX as usize) as u8);

        let id = l2cap.register(registration)?;
        self.registration = Some(id);
        Ok(id)
    }

    /// React to a stack event after the L2CAP manager has seen it
    pub fn handle_event(&mut self, l2cap: &mut L2capManager, event: &Event) {
        match event {
            Event::LinkOpened {
                handle,
                role,
                conn_interval,
                ..
            } => self.link_opened(l2cap, *handle, *role, *conn_interval),
            Event::LinkClosed { handle } => self.link_closed(*handle),
            Event::LinkFlow { handle, enabled: true } => {
                self.flow_enabled(l2cap, *handle, Bearer::Legacy, &[AttRole::Client, AttRole::Server])
            }
            Event::Frame {
                handle,
                cid: L2CAP_ATTRIBUTE_PROTOCOL_CID,
                payload,
            } => self.deliver(l2cap, *handle, Bearer::Legacy, payload),
            Event::TimerExpired(TimerId::EattBackoff(handle)) => self.backoff_expired(l2cap, *handle),
            _ => {}
        }
    }

    /// Handle the channel events queued since the last call
    pub fn process_inbox(&mut self, l2cap: &mut L2capManager) {
        loop {
            let event = self.inbox.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
            let Some(event) = event else {
                break;
            };

            trace!("EATT channel event {:?}", event);
            self.handle_channel_event(l2cap, event);
        }
    }

    /// Bearer an operation of `priority` and `size` bytes should use
    pub fn select_bearer(&self, handle: ConnHandle, priority: u8, size: usize) -> Bearer {
        self.connections
            .get(&handle)
            .and_then(|connection| select_slot(&connection.slots, priority, size))
            .map_or(Bearer::Legacy, Bearer::Enhanced)
    }

    /// Send an ATT PDU on the best bearer; returns the bearer used
    pub fn send(
        &mut self,
        l2cap: &mut L2capManager,
        handle: ConnHandle,
        priority: u8,
        pdu: Vec<u8>,
    ) -> EattResult<Bearer> {
        let bearer = self.select_bearer(handle, priority, pdu.len());
        self.send_on(l2cap, handle, bearer, pdu)?;
        Ok(bearer)
    }

    /// Send an ATT PDU on a given bearer
    pub fn send_on(&mut self, l2cap: &mut L2capManager, handle: ConnHandle, bearer: Bearer, pdu: Vec<u8>) -> EattResult<()> {
        let connection = self
            .connections
            .get_mut(&handle)
            .ok_or(EattError::UnknownLink(handle))?;
        send_pdu(l2cap, connection, handle, bearer, pdu)
    }

    pub fn bearer_mtu(&self, handle: ConnHandle, bearer: Bearer) -> Option<u16> {
        match self.connections.get(&handle) {
            Some(connection) => connection.bearer_mtu(bearer),
            None => (bearer == Bearer::Legacy).then_some(ATT_DEFAULT_MTU),
        }
    }

    /// Legacy bearer followed by every open EATT bearer
    pub fn open_bearers(&self, handle: ConnHandle) -> Vec<Bearer> {
        let mut bearers = vec![Bearer::Legacy];
        if let Some(connection) = self.connections.get(&handle) {
            bearers.extend(
                connection
                    .slots
                    .iter()
                    .enumerate()
                    .filter(|(_, slot)| slot.in_use)
                    .map(|(index, _)| Bearer::Enhanced(index)),
            );
        }
        bearers
    }

    /// Close every EATT bearer of a link
    pub fn disconnect_all(&mut self, l2cap: &mut L2capManager, handle: ConnHandle) -> EattResult<()> {
        let connection = self
            .connections
            .get(&handle)
            .ok_or(EattError::UnknownLink(handle))?;

        for cid in connection.open_cids() {
            l2cap.disconnect(cid)?;
        }
        Ok(())
    }

    /// Apply a new MTU/MPS to every open bearer of a link, five at a time
    pub fn reconfigure(&mut self, l2cap: &mut L2capManager, handle: ConnHandle, mtu: u16, mps: u16) -> EattResult<()> {
        let connection = self
            .connections
            .get_mut(&handle)
            .ok_or(EattError::UnknownLink(handle))?;

        if connection.state != EattState::Idle {
            return Err(EattError::InvalidState);
        }

        let mut batches: Vec<Vec<ChannelId>> = connection
            .open_cids()
            .chunks(L2CAP_ENHANCED_MAX_CHANNELS)
            .map(<[ChannelId]>::to_vec)
            .collect();
        batches.reverse();

        let first = batches.pop().ok_or(EattError::InvalidState)?;
        l2cap.enhanced_reconfigure(handle, &first, mtu, mps)?;

        debug!("Reconfiguring EATT bearers on 0x{:04X} to MTU {} MPS {}", handle, mtu, mps);
        connection.pending_batches = batches;
        connection.pending_mtu = Some((mtu, mps));
        connection.state = EattState::Reconfiguring;
        Ok(())
    }

    fn link_opened(&mut self, l2cap: &mut L2capManager, handle: ConnHandle, role: LinkRole, interval: Duration) {
        if self.connections.contains_key(&handle) {
            return;
        }

        self.connections
            .insert(handle, EattConnection::new(handle, role, interval, &self.config));

        if !self.config.initiate {
            return;
        }

        match role {
            LinkRole::Central => self.start_initiating(l2cap, handle),
            LinkRole::Peripheral => self.start_backoff(l2cap, handle),
        }
    }

    fn link_closed(&mut self, handle: ConnHandle) {
        let Some(connection) = self.connections.remove(&handle) else {
            return;
        };

        if connection.backoff_armed {
            self.timers.stop(TimerId::EattBackoff(handle));
        }
        debug!("EATT state for link 0x{:04X} dropped", handle);
    }

    /// Waits a random number of connection intervals before initiating
    fn start_backoff(&mut self, l2cap: &mut L2capManager, handle: ConnHandle) {
        let intervals = self
            .rng
            .gen_range(self.config.backoff_min_intervals..=self.config.backoff_max_intervals);

        let Some(connection) = self.connections.get_mut(&handle) else {
            return;
        };
        let delay = connection.conn_interval * intervals;

        match self.timers.start(TimerId::EattBackoff(handle), delay) {
            Ok(()) => {
                debug!("EATT backoff of {:?} on link 0x{:04X}", delay, handle);
                connection.state = EattState::Accepting;
                connection.backoff_armed = true;
            }
            Err(e) => {
                warn!("Could not arm EATT backoff: {}", e);
                self.start_initiating(l2cap, handle);
            }
        }
    }

    fn backoff_expired(&mut self, l2cap: &mut L2capManager, handle: ConnHandle) {
        let Some(connection) = self.connections.get_mut(&handle) else {
            return;
        };
        connection.backoff_armed = false;

        if connection.state == EattState::Accepting {
            connection.state = EattState::Idle;
            self.start_initiating(l2cap, handle);
        }
    }

    fn start_initiating(&mut self, l2cap: &mut L2capManager, handle: ConnHandle) {
        if let Some(connection) = self.connections.get_mut(&handle) {
            connection.state = EattState::Initiating;
            self.request_batch(l2cap, handle);
        }
    }

    /// Asks for as many channels as fit, at most five
    fn request_batch(&mut self, l2cap: &mut L2capManager, handle: ConnHandle) {
        let Some(connection) = self.connections.get(&handle) else {
            return;
        };
        let wanted = connection.free_slots().min(L2CAP_ENHANCED_MAX_CHANNELS);

        let Some(registration) = self.registration.filter(|_| wanted > 0) else {
            self.finish_establish(handle);
            return;
        };

        match l2cap.enhanced_connect(registration, handle, wanted) {
            Ok(cids) => debug!("Requested EATT channels {:?} on link 0x{:04X}", cids, handle),
            Err(e) => {
                warn!("EATT channel request on 0x{:04X} failed: {}", handle, e);
                self.finish_establish(handle);
            }
        }
    }

    fn finish_establish(&mut self, handle: ConnHandle) {
        let Some(connection) = self.connections.get_mut(&handle) else {
            return;
        };

        if connection.state == EattState::Initiating {
            connection.state = EattState::Idle;
        }
        let open = connection.open_count();

        info!("EATT on link 0x{:04X} has {} bearers", handle, open);
        self.emit(EattEvent::EstablishComplete { handle, open });
    }

    fn handle_channel_event(&mut self, l2cap: &mut L2capManager, event: CocEvent) {
        match event {
            CocEvent::Connected {
                handle, cid, peer_mtu, ..
            } => self.bearers_opened(l2cap, handle, &[cid], peer_mtu),

            CocEvent::EnhancedConnected {
                handle,
                result,
                cids,
                peer_mtu,
                initiator,
                ..
            } => {
                self.bearers_opened(l2cap, handle, &cids, peer_mtu);
                if initiator {
                    self.batch_resolved(l2cap, handle, result, cids.len());
                }
            }

            CocEvent::Disconnected { handle, cid, reason } => self.bearer_closed(handle, cid, reason),

            CocEvent::DataReceived { handle, cid, sdu } => {
                if let Some(index) = self
                    .connections
                    .get(&handle)
                    .and_then(|connection| connection.slot_for_cid(cid))
                {
                    self.deliver(l2cap, handle, Bearer::Enhanced(index), &sdu);
                }
            }

            CocEvent::DataSendConfirmed { handle, cid, status } => self.send_confirmed(l2cap, handle, cid, status),

            CocEvent::FlowEnabled { handle, cid } => {
                if let Some(index) = self
                    .connections
                    .get(&handle)
                    .and_then(|connection| connection.slot_for_cid(cid))
                {
                    self.flow_enabled(
                        l2cap,
                        handle,
                        Bearer::Enhanced(index),
                        &[AttRole::Client, AttRole::Server],
                    );
                }
            }

            CocEvent::EnhancedReconfigured {
                handle,
                result,
                cids,
                remote,
                ..
            } => self.reconfigured(l2cap, handle, result, &cids, remote),
        }
    }

    fn bearers_opened(&mut self, l2cap: &mut L2capManager, handle: ConnHandle, cids: &[ChannelId], peer_mtu: u16) {
        let mtu = self.config.channel.mtu.min(peer_mtu);

        for cid in cids.iter().copied() {
            let claimed = self
                .connections
                .get_mut(&handle)
                .and_then(|connection| connection.claim_slot(cid, mtu));

            match claimed {
                Some(index) => {
                    info!("EATT bearer {} on link 0x{:04X} uses channel 0x{:04X}", index, handle, cid);
                    self.emit(EattEvent::BearerOpened {
                        handle,
                        bearer: Bearer::Enhanced(index),
                        cid,
                        mtu,
                    });
                }
                None => {
                    warn!("No EATT slot left for channel 0x{:04X}", cid);
                    if let Err(e) = l2cap.disconnect(cid) {
                        warn!("Closing surplus channel 0x{:04X} failed: {}", cid, e);
                    }
                }
            }
        }
    }

    /// Keeps requesting until the target is met or the peer stops accepting
    fn batch_resolved(&mut self, l2cap: &mut L2capManager, handle: ConnHandle, result: ConnectionResult, accepted: usize) {
        let initiating = self
            .connections
            .get(&handle)
            .is_some_and(|connection| connection.state == EattState::Initiating);
        if !initiating {
            return;
        }

        if accepted == 0 || !result.is_success() {
            debug!("Peer stopped accepting EATT channels: {}", result);
            self.finish_establish(handle);
        } else {
            self.request_batch(l2cap, handle);
        }
    }

    fn bearer_closed(&mut self, handle: ConnHandle, cid: ChannelId, reason: DisconnectReason) {
        let Some(index) = self
            .connections
            .get_mut(&handle)
            .and_then(|connection| connection.release_cid(cid))
        else {
            return;
        };

        debug!("EATT bearer {} on link 0x{:04X} closed: {:?}", index, handle, reason);
        self.emit(EattEvent::BearerClosed {
            handle,
            bearer: Bearer::Enhanced(index),
            cid,
        });

        // No channel left to answer for
        let Some(connection) = self.connections.get_mut(&handle) else {
            return;
        };
        if connection.state == EattState::Reconfiguring && connection.open_count() == 0 {
            let mtu = connection.pending_mtu.take().map_or(0, |(mtu, _)| mtu);
            connection.pending_batches.clear();
            connection.state = EattState::Idle;
            self.emit(EattEvent::Reconfigured {
                handle,
                result: ReconfigureResult::Rejected,
                mtu,
            });
        }
    }

    fn deliver(&mut self, l2cap: &mut L2capManager, handle: ConnHandle, bearer: Bearer, pdu: &[u8]) {
        let Some(&opcode) = pdu.first() else {
            debug!("Empty ATT PDU on {:?}", bearer);
            return;
        };

        let Self {
            handlers, connections, ..
        } = self;
        let Some(connection) = connections.get_mut(&handle) else {
            debug!("ATT PDU for link 0x{:04X} without EATT state", handle);
            return;
        };

        if let Bearer::Enhanced(index) = bearer {
            if bearer::is_reply(opcode) {
                if let Some(slot) = connection.slots.get_mut(index) {
                    slot.awaiting_response = false;
                }
            }
        }

        let mut tx = LinkSender {
            l2cap,
            connection,
            handle,
        };
        handlers
            .get(AttRole::for_inbound(opcode))
            .pdu_received(handle, bearer, pdu, &mut tx);
    }

    /// Completion goes to the role that sent the SDU
    fn send_confirmed(&mut self, l2cap: &mut L2capManager, handle: ConnHandle, cid: ChannelId, status: SendStatus) {
        let Self {
            handlers, connections, ..
        } = self;
        let Some(connection) = connections.get_mut(&handle) else {
            return;
        };
        let Some(index) = connection.slot_for_cid(cid) else {
            return;
        };

        let slot = &mut connection.slots[index];
        slot.sdu_in_flight = false;
        if status != SendStatus::Success {
            debug!("ATT SDU on channel 0x{:04X} ended with {:?}", cid, status);
            slot.awaiting_response = false;
        }
        let Some(role) = slot.tx_role.take() else {
            return;
        };

        let bearer = Bearer::Enhanced(index);
        let mut tx = LinkSender {
            l2cap,
            connection,
            handle,
        };
        let handler = handlers.get(role);
        let again = handler.send_confirmed(handle, bearer, &mut tx);
        drain_flow(handler, handle, bearer, &mut tx, again);
    }

    fn flow_enabled(&mut self, l2cap: &mut L2capManager, handle: ConnHandle, bearer: Bearer, roles: &[AttRole]) {
        let Self {
            handlers, connections, ..
        } = self;
        let Some(connection) = connections.get_mut(&handle) else {
            return;
        };

        let mut tx = LinkSender {
            l2cap,
            connection,
            handle,
        };
        for role in roles {
            if !tx.flow_enabled(bearer) {
                break;
            }

            let handler = handlers.get(*role);
            let again = handler.flow_enabled(handle, bearer, &mut tx);
            drain_flow(handler, handle, bearer, &mut tx, again);
        }
    }

    fn reconfigured(
        &mut self,
        l2cap: &mut L2capManager,
        handle: ConnHandle,
        result: ReconfigureResult,
        cids: &[ChannelId],
        remote: bool,
    ) {
        let Some(connection) = self.connections.get_mut(&handle) else {
            return;
        };

        for cid in cids {
            if let (Some(index), Some(channel)) = (connection.slot_for_cid(*cid), l2cap.channel(*cid)) {
                connection.slots[index].local_mtu = channel.local_mtu().min(channel.peer_mtu());
            }
        }

        if remote || connection.state != EattState::Reconfiguring {
            return;
        }
        let Some((mtu, mps)) = connection.pending_mtu else {
            return;
        };

        // An empty `cids` means the whole batch closed before the answer came
        let mut result = result;
        if result.is_success() {
            while let Some(mut batch) = connection.pending_batches.pop() {
                batch.retain(|cid| connection.slot_for_cid(*cid).is_some());
                if batch.is_empty() {
                    continue;
                }

                match l2cap.enhanced_reconfigure(handle, &batch, mtu, mps) {
                    Ok(()) => return,
                    Err(L2capError::ReconfigureRejected(rejected)) => result = rejected,
                    Err(e) => {
                        warn!("EATT reconfiguration of {:?} failed: {}", batch, e);
                        result = ReconfigureResult::Rejected;
                    }
                }
                break;
            }
        }

        connection.state = EattState::Idle;
        connection.pending_mtu = None;
        connection.pending_batches.clear();

        info!("EATT reconfiguration on link 0x{:04X} finished: {}", handle, result);
        self.emit(EattEvent::Reconfigured { handle, result, mtu });
    }

    fn emit(&self, event: EattEvent) {
        let Some(events) = &self.events else {
            return;
        };

        let mut callback = events.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = (*callback)(event) {
            warn!("EATT event callback failed: {}", e);
        }
    }
}

/// Re-invokes a handler while it asks for it and the bearer stays open for data
fn drain_flow(
    handler: &mut dyn AttBearerHandler,
    handle: ConnHandle,
    bearer: Bearer,
    tx: &mut LinkSender<'_>,
    mut again: bool,
) {
    let mut rechecks = 0;
    while again && rechecks < MAX_FLOW_RECHECKS && tx.flow_enabled(bearer) {
        again = handler.flow_enabled(handle, bearer, tx);
        rechecks += 1;
    }

    if again && rechecks == MAX_FLOW_RECHECKS {
        debug!("Flow re-check limit reached on {:?}", bearer);
    }
}

/// The view of one link handed to ATT handlers
struct LinkSender<'a> {
    l2cap: &'a mut L2capManager,
    connection: &'a mut EattConnection,
    handle: ConnHandle,
}

impl BearerSender for LinkSender<'_> {
    fn send(&mut self, bearer: Bearer, pdu: Vec<u8>) -> EattResult<()> {
        send_pdu(self.l2cap, self.connection, self.handle, bearer, pdu)
    }

    fn flow_enabled(&self, bearer: Bearer) -> bool {
        match bearer {
            Bearer::Legacy => self
                .l2cap
                .link(self.handle)
                .is_some_and(|link| !link.flow_disabled),
            Bearer::Enhanced(index) => self
                .connection
                .slots
                .get(index)
                .is_some_and(|slot| slot.in_use && !slot.sdu_in_flight && self.l2cap.is_flow_enabled(slot.cid)),
        }
    }
}

fn send_pdu(
    l2cap: &mut L2capManager,
    connection: &mut EattConnection,
    handle: ConnHandle,
    bearer: Bearer,
    pdu: Vec<u8>,
) -> EattResult<()> {
    let opcode = *pdu
        .first()
        .ok_or_else(|| L2capError::InvalidParameter("Empty ATT PDU".into()))?;

    match bearer {
        Bearer::Legacy => l2cap.send_fixed(handle, L2CAP_ATTRIBUTE_PROTOCOL_CID, &pdu)?,
        Bearer::Enhanced(index) => {
            let slot = connection
                .slots
                .get_mut(index)
                .filter(|slot| slot.in_use)
                .ok_or(EattError::InvalidState)?;

            l2cap.send(slot.cid, pdu)?;
            slot.sdu_in_flight = true;
            slot.tx_role = Some(AttRole::for_outbound(opcode));
            if bearer::expects_reply(opcode) {
                slot.awaiting_response = true;
            }
        }
    }

    trace!("ATT opcode 0x{:02X} sent on {:?}", opcode, bearer);
    Ok(())
}
