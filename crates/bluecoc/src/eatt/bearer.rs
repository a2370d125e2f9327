//! ATT roles on a bearer
//!
//! Inbound PDUs are routed to the client or the server handler by opcode;
//! completion and flow notifications go to the role that sent the SDU.

use super::types::{Bearer, EattResult};
use crate::l2cap::ConnHandle;

pub const ATT_HANDLE_VALUE_NTF: u8 = 0x1B;
pub const ATT_HANDLE_VALUE_IND: u8 = 0x1D;
pub const ATT_HANDLE_VALUE_CONF: u8 = 0x1E;
pub const ATT_MULTIPLE_HANDLE_VALUE_NTF: u8 = 0x23;

/// Set in the opcode of commands, which never get a reply
const ATT_COMMAND_FLAG: u8 = 0x40;

/// Which half of the attribute protocol a PDU belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttRole {
    Client,
    Server,
}

impl AttRole {
    /// Role that consumes a received PDU: responses, notifications and
    /// indications go to the client, everything else to the server
    pub fn for_inbound(opcode: u8) -> Self {
        if opcode & 0x01 == 0x01 {
            AttRole::Client
        } else {
            AttRole::Server
        }
    }

    /// Role that produced a PDU we are sending
    pub fn for_outbound(opcode: u8) -> Self {
        match Self::for_inbound(opcode) {
            AttRole::Client => AttRole::Server,
            AttRole::Server => AttRole::Client,
        }
    }
}

/// Whether sending `opcode` leaves the bearer waiting for a reply
pub fn expects_reply(opcode: u8) -> bool {
    let is_request = opcode & 0x01 == 0 && opcode & ATT_COMMAND_FLAG == 0 && opcode != ATT_HANDLE_VALUE_CONF;
    is_request || opcode == ATT_HANDLE_VALUE_IND
}

/// Whether `opcode` answers an earlier request or indication
pub fn is_reply(opcode: u8) -> bool {
    match opcode {
        ATT_HANDLE_VALUE_CONF => true,
        ATT_HANDLE_VALUE_NTF | ATT_HANDLE_VALUE_IND | ATT_MULTIPLE_HANDLE_VALUE_NTF => false,
        _ => opcode & 0x01 == 0x01,
    }
}

/// Lets a handler put PDUs on a bearer of its link
pub trait BearerSender {
    fn send(&mut self, bearer: Bearer, pdu: Vec<u8>) -> EattResult<()>;
    fn flow_enabled(&self, bearer: Bearer) -> bool;
}

/// One side (client or server) of the attribute protocol
pub trait AttBearerHandler: Send {
    fn pdu_received(&mut self, handle: ConnHandle, bearer: Bearer, pdu: &[u8], tx: &mut dyn BearerSender);

    /// The SDU this role sent on `bearer` finished. Returns true to be asked
    /// again once flow allows.
    fn send_confirmed(&mut self, handle: ConnHandle, bearer: Bearer, tx: &mut dyn BearerSender) -> bool;

    /// `bearer` can take data again. Returns true to be asked again.
    fn flow_enabled(&mut self, handle: ConnHandle, bearer: Bearer, tx: &mut dyn BearerSender) -> bool;
}

/// The client and server handlers of the stack
pub struct AttHandlers {
    client: Box<dyn AttBearerHandler>,
    server: Box<dyn AttBearerHandler>,
}

impl AttHandlers {
    pub fn new(client: Box<dyn AttBearerHandler>, server: Box<dyn AttBearerHandler>) -> Self {
        Self { client, server }
    }

    pub fn get(&mut self, role: AttRole) -> &mut dyn AttBearerHandler {
        match role {
            AttRole::Client => self.client.as_mut(),
            AttRole::Server => self.server.as_mut(),
        }
    }
}
