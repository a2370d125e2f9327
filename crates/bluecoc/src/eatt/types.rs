//! Type definitions for EATT

use std::sync::{Arc, Mutex};

use thiserror::Error;

use super::bearer::AttRole;
use crate::l2cap::{ChannelId, ConnHandle, L2capError, LeCreditBasedConfig, ReconfigureResult};

/// MTU of the legacy ATT bearer on the fixed channel
pub const ATT_DEFAULT_MTU: u16 = 23;

/// How many times a handler is re-invoked after a flow check in one go
pub const MAX_FLOW_RECHECKS: usize = 8;

/// Upper bound on EATT bearers per link
pub const EATT_MAX_CHANNELS: usize = 16;

/// Error types specific to EATT operations
#[derive(Debug, Error)]
pub enum EattError {
    #[error("No EATT state for link 0x{0:04X}")]
    UnknownLink(ConnHandle),

    #[error("Invalid state for operation")]
    InvalidState,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("L2CAP error: {0}")]
    L2cap(#[from] L2capError),
}

/// Result type for EATT operations
pub type EattResult<T> = std::result::Result<T, EattError>;

/// EATT configuration
#[derive(Debug, Clone)]
pub struct EattConfig {
    /// Bearers wanted per link
    pub num_channels: usize,
    /// Priority of each slot by index; missing entries are 0
    pub priorities: Vec<u8>,
    /// Parameters of every EATT channel
    pub channel: LeCreditBasedConfig,
    /// Whether this side opens bearers itself
    pub initiate: bool,
    /// Collision backoff range, in connection intervals
    pub backoff_min_intervals: u32,
    pub backoff_max_intervals: u32,
}

impl Default for EattConfig {
    fn default() -> Self {
        Self {
            num_channels: 5,
            priorities: Vec::new(),
            channel: LeCreditBasedConfig {
                mtu: 247,
                mps: 247,
                initial_credits: 10,
                credit_refill: 10,
            },
            initiate: true,
            backoff_min_intervals: 2,
            backoff_max_intervals: 6,
        }
    }
}

impl EattConfig {
    pub fn validate(&self) -> EattResult<()> {
        if self.num_channels == 0 || self.num_channels > EATT_MAX_CHANNELS {
            return Err(EattError::InvalidConfig(format!(
                "{} channels per link",
                self.num_channels
            )));
        }

        if self.backoff_min_intervals < 2 || self.backoff_max_intervals < self.backoff_min_intervals {
            return Err(EattError::InvalidConfig(format!(
                "backoff range {}..={} intervals",
                self.backoff_min_intervals, self.backoff_max_intervals
            )));
        }

        if !self.channel.validate_enhanced() {
            return Err(EattError::InvalidConfig(format!(
                "MTU {} / MPS {} too small for EATT",
                self.channel.mtu, self.channel.mps
            )));
        }

        Ok(())
    }

    pub fn priority(&self, index: usize) -> u8 {
        self.priorities.get(index).copied().unwrap_or(0)
    }
}

/// EATT state of one link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EattState {
    Idle,
    /// Requesting batches of channels
    Initiating,
    /// Resizing the open channels batch by batch
    Reconfiguring,
    /// Waiting out the collision backoff before initiating
    Accepting,
}

/// One bearer slot of a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EattChannelSlot {
    pub cid: ChannelId,
    pub priority: u8,
    /// Effective MTU of the bearer, min(local, peer)
    pub local_mtu: u16,
    pub in_use: bool,
    /// An SDU is being sent on the channel
    pub sdu_in_flight: bool,
    /// A request or indication sent here still waits for its reply
    pub awaiting_response: bool,
    /// Role that sent the SDU in flight
    pub tx_role: Option<AttRole>,
}

impl EattChannelSlot {
    pub fn new(priority: u8) -> Self {
        Self {
            cid: 0,
            priority,
            local_mtu: 0,
            in_use: false,
            sdu_in_flight: false,
            awaiting_response: false,
            tx_role: None,
        }
    }

    /// Returns the slot to the unused state, keeping its priority
    pub fn clear(&mut self) {
        *self = Self::new(self.priority);
    }

    /// Whether a new operation may be placed on the slot
    pub fn is_available(&self) -> bool {
        self.in_use && !self.sdu_in_flight && !self.awaiting_response
    }
}

/// Where an ATT PDU travels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bearer {
    /// The fixed ATT channel
    Legacy,
    /// The EATT slot with this index
    Enhanced(usize),
}

/// Lifecycle events of the EATT layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EattEvent {
    BearerOpened {
        handle: ConnHandle,
        bearer: Bearer,
        cid: ChannelId,
        mtu: u16,
    },
    BearerClosed {
        handle: ConnHandle,
        bearer: Bearer,
        cid: ChannelId,
    },
    /// Initiation stopped with this many bearers open
    EstablishComplete { handle: ConnHandle, open: usize },
    Reconfigured {
        handle: ConnHandle,
        result: ReconfigureResult,
        mtu: u16,
    },
}

/// Callback for EATT lifecycle events
pub type EattEventCallback = Arc<Mutex<dyn FnMut(EattEvent) -> EattResult<()> + Send + 'static>>;
