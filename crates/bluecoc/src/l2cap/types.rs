//! Type definitions for L2CAP operations
//!
//! This module contains the core data structures shared by the channel
//! pool, the signaling handlers and the upper layers.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bitflags::bitflags;
use thiserror::Error;

use super::constants::*;
use super::psm::PSM;
use crate::error::TransportError;

/// Channel Identifier
pub type ChannelId = u16;

/// Link (connection) handle assigned by the controller
pub type ConnHandle = u16;

/// Error types specific to L2CAP operations
#[derive(Debug, Error)]
pub enum L2capError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Channel not found")]
    ChannelNotFound,

    #[error("Link 0x{0:04X} not found")]
    LinkNotFound(ConnHandle),

    #[error("Invalid state for operation")]
    InvalidState,

    #[error("MTU exceeded")]
    MtuExceeded,

    #[error("Resource limit reached")]
    ResourceLimitReached,

    #[error("PSM not registered")]
    PsmNotRegistered,

    #[error("PSM {0} already registered")]
    PsmAlreadyRegistered(PSM),

    #[error("Registration still referenced by open channels")]
    RegistrationInUse,

    #[error("An SDU is already in flight on this channel")]
    TxOverflow,

    #[error("Credit count would exceed {0}")]
    CreditOverflow(u16),

    #[error("Reconfiguration rejected: {0}")]
    ReconfigureRejected(ReconfigureResult),

    #[error("Unknown signaling command 0x{0:02X}")]
    UnknownCommand(u8),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Result type for L2CAP operations
pub type L2capResult<T> = std::result::Result<T, L2capError>;

/// Connection-oriented channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2capChannelState {
    /// Slot is free
    Unused,
    /// Waiting for the peer's connection response
    Connecting,
    /// Open and ready for data transfer
    Connected,
    /// Waiting for the disconnection to complete
    Disconnecting,
}

impl fmt::Display for L2capChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unused => write!(f, "Unused"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Role of the local device on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Central,
    Peripheral,
}

/// L2CAP Security Level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecurityLevel {
    /// No security (no authentication, no encryption)
    None = 0,
    /// Unauthenticated encryption
    Encryption = 1,
    /// Authenticated encryption
    Authentication = 2,
    /// LE Secure Connections with authenticated encryption
    SecureConnections = 3,
}

bitflags! {
    /// Which sides of a connection a registration may take
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RoleMask: u8 {
        /// May open channels toward the peer
        const INITIATOR = 0x01;
        /// May accept channels opened by the peer
        const ACCEPTOR = 0x02;
    }
}

/// L2CAP Connection Policy for determining when to allow connections
#[derive(Debug, Clone, Copy)]
pub struct ConnectionPolicy {
    /// Minimum required security level
    pub min_security_level: SecurityLevel,
    /// Whether authorization is required
    pub authorization_required: bool,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            min_security_level: SecurityLevel::None,
            authorization_required: false,
        }
    }
}

/// LE Credit-Based Connection configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeCreditBasedConfig {
    /// Maximum Transmission Unit
    pub mtu: u16,
    /// Maximum PDU size
    pub mps: u16,
    /// Initial credits granted to the peer
    pub initial_credits: u16,
    /// Credits granted back once the peer has used them all; 0 disables refill
    pub credit_refill: u16,
}

impl Default for LeCreditBasedConfig {
    fn default() -> Self {
        Self {
            mtu: L2CAP_LE_DEFAULT_MTU,
            mps: L2CAP_LE_DEFAULT_MTU,
            initial_credits: 10,
            credit_refill: 10,
        }
    }
}

impl LeCreditBasedConfig {
    /// Validates the parameters for a single LE credit based channel
    pub fn validate(&self) -> bool {
        self.mtu >= L2CAP_LE_MIN_MTU && self.mps >= L2CAP_LE_MIN_MPS && self.mps <= L2CAP_LE_MAX_MPS
    }

    /// Validates the parameters for an enhanced credit based channel
    pub fn validate_enhanced(&self) -> bool {
        self.mtu >= L2CAP_ENHANCED_MIN_MTU
            && self.mps >= L2CAP_ENHANCED_MIN_MPS
            && self.mps <= L2CAP_LE_MAX_MPS
    }
}

/// Manager wide configuration
#[derive(Debug, Clone)]
pub struct L2capConfig {
    /// Size of the channel pool
    pub max_channels: usize,
    /// Size of the registration table
    pub max_registrations: usize,
    /// How long to wait for a signaling response
    pub request_timeout: Duration,
    /// Ceiling for any credit counter
    pub max_credits: u16,
}

impl Default for L2capConfig {
    fn default() -> Self {
        Self {
            max_channels: L2CAP_DEFAULT_MAX_CHANNELS,
            max_registrations: L2CAP_DEFAULT_MAX_REGISTRATIONS,
            request_timeout: Duration::from_secs(L2CAP_REQUEST_TIMEOUT_SECS),
            max_credits: L2CAP_LE_MAX_CREDITS,
        }
    }
}

/// Result of a (possibly enhanced) credit based connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionResult {
    Success,
    PsmNotSupported,
    NoResources,
    InsufficientAuthentication,
    InsufficientAuthorization,
    InsufficientKeySize,
    InsufficientEncryption,
    InvalidSourceCid,
    SourceCidAlreadyAllocated,
    UnacceptableParameters,
    InvalidParameters,
    /// The peer answered with a Command Reject
    Rejected,
    /// No response within the request timeout
    Timeout,
    Other(u16),
}

impl ConnectionResult {
    pub fn value(&self) -> u16 {
        match self {
            Self::Success => L2CAP_RESULT_SUCCESS,
            Self::PsmNotSupported => L2CAP_RESULT_PSM_NOT_SUPPORTED,
            Self::NoResources => L2CAP_RESULT_NO_RESOURCES,
            Self::InsufficientAuthentication => L2CAP_RESULT_INSUFFICIENT_AUTHENTICATION,
            Self::InsufficientAuthorization => L2CAP_RESULT_INSUFFICIENT_AUTHORIZATION,
            Self::InsufficientKeySize => L2CAP_RESULT_INSUFFICIENT_KEY_SIZE,
            Self::InsufficientEncryption => L2CAP_RESULT_INSUFFICIENT_ENCRYPTION,
            Self::InvalidSourceCid => L2CAP_RESULT_INVALID_SOURCE_CID,
            Self::SourceCidAlreadyAllocated => L2CAP_RESULT_SOURCE_CID_ALREADY_ALLOCATED,
            Self::UnacceptableParameters => L2CAP_RESULT_UNACCEPTABLE_PARAMETERS,
            Self::InvalidParameters => L2CAP_RESULT_INVALID_PARAMETERS,
            Self::Rejected => L2CAP_RESULT_LOCAL_REJECTED,
            Self::Timeout => L2CAP_RESULT_LOCAL_TIMEOUT,
            Self::Other(value) => *value,
        }
    }

    pub fn from_value(value: u16) -> Self {
        match value {
            L2CAP_RESULT_SUCCESS => Self::Success,
            L2CAP_RESULT_PSM_NOT_SUPPORTED => Self::PsmNotSupported,
            L2CAP_RESULT_NO_RESOURCES => Self::NoResources,
            L2CAP_RESULT_INSUFFICIENT_AUTHENTICATION => Self::InsufficientAuthentication,
            L2CAP_RESULT_INSUFFICIENT_AUTHORIZATION => Self::InsufficientAuthorization,
            L2CAP_RESULT_INSUFFICIENT_KEY_SIZE => Self::InsufficientKeySize,
            L2CAP_RESULT_INSUFFICIENT_ENCRYPTION => Self::InsufficientEncryption,
            L2CAP_RESULT_INVALID_SOURCE_CID => Self::InvalidSourceCid,
            L2CAP_RESULT_SOURCE_CID_ALREADY_ALLOCATED => Self::SourceCidAlreadyAllocated,
            L2CAP_RESULT_UNACCEPTABLE_PARAMETERS => Self::UnacceptableParameters,
            L2CAP_RESULT_INVALID_PARAMETERS => Self::InvalidParameters,
            L2CAP_RESULT_LOCAL_REJECTED => Self::Rejected,
            L2CAP_RESULT_LOCAL_TIMEOUT => Self::Timeout,
            other => Self::Other(other),
        }
    }

    pub fn is_success(&self) -> bool {
        *self == Self::Success
    }
}

impl fmt::Display for ConnectionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:04X})", self, self.value())
    }
}

/// Result of a credit based reconfiguration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconfigureResult {
    Success,
    MtuReductionNotAllowed,
    MpsReductionNotAllowed,
    InvalidDestinationCid,
    UnacceptableParameters,
    Rejected,
    Timeout,
    Other(u16),
}

impl ReconfigureResult {
    pub fn value(&self) -> u16 {
        match self {
            Self::Success => L2CAP_RECONF_SUCCESS,
            Self::MtuReductionNotAllowed => L2CAP_RECONF_MTU_REDUCTION_NOT_ALLOWED,
            Self::MpsReductionNotAllowed => L2CAP_RECONF_MPS_REDUCTION_NOT_ALLOWED,
            Self::InvalidDestinationCid => L2CAP_RECONF_INVALID_DESTINATION_CID,
            Self::UnacceptableParameters => L2CAP_RECONF_UNACCEPTABLE_PARAMETERS,
            Self::Rejected => L2CAP_RESULT_LOCAL_REJECTED,
            Self::Timeout => L2CAP_RESULT_LOCAL_TIMEOUT,
            Self::Other(value) => *value,
        }
    }

    pub fn from_value(value: u16) -> Self {
        match value {
            L2CAP_RECONF_SUCCESS => Self::Success,
            L2CAP_RECONF_MTU_REDUCTION_NOT_ALLOWED => Self::MtuReductionNotAllowed,
            L2CAP_RECONF_MPS_REDUCTION_NOT_ALLOWED => Self::MpsReductionNotAllowed,
            L2CAP_RECONF_INVALID_DESTINATION_CID => Self::InvalidDestinationCid,
            L2CAP_RECONF_UNACCEPTABLE_PARAMETERS => Self::UnacceptableParameters,
            L2CAP_RESULT_LOCAL_REJECTED => Self::Rejected,
            L2CAP_RESULT_LOCAL_TIMEOUT => Self::Timeout,
            other => Self::Other(other),
        }
    }

    pub fn is_success(&self) -> bool {
        *self == Self::Success
    }
}

impl fmt::Display for ReconfigureResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:04X})", self, self.value())
    }
}

/// Why a channel went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Closed by a local API call
    LocalRequest,
    /// Closed by the peer's disconnection request
    RemoteRequest,
    /// A signaling request was not answered in time
    Timeout,
    /// The underlying link went down
    LinkClosed,
    /// The peer broke the credit or SAR rules
    ProtocolViolation,
    /// The connection attempt was refused
    Refused(ConnectionResult),
}

/// Outcome of an outbound SDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Every fragment was handed to the link
    Success,
    /// The channel closed before the SDU was fully sent
    Aborted,
    /// The frame sink refused a fragment
    Failed,
}

/// Events raised toward the owner of a registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CocEvent {
    /// A single channel opened
    Connected {
        handle: ConnHandle,
        cid: ChannelId,
        psm: PSM,
        peer_mtu: u16,
        peer_mps: u16,
        initiator: bool,
    },
    /// A channel closed or failed to open
    Disconnected {
        handle: ConnHandle,
        cid: ChannelId,
        reason: DisconnectReason,
    },
    /// A complete SDU arrived
    DataReceived {
        handle: ConnHandle,
        cid: ChannelId,
        sdu: Vec<u8>,
    },
    /// The in-flight SDU finished (or failed)
    DataSendConfirmed {
        handle: ConnHandle,
        cid: ChannelId,
        status: SendStatus,
    },
    /// The link can carry data again and nothing is queued on the channel
    FlowEnabled { handle: ConnHandle, cid: ChannelId },
    /// An enhanced connect transaction resolved
    EnhancedConnected {
        handle: ConnHandle,
        result: ConnectionResult,
        cids: Vec<ChannelId>,
        peer_mtu: u16,
        peer_mps: u16,
        initiator: bool,
    },
    /// An enhanced reconfigure transaction resolved
    EnhancedReconfigured {
        handle: ConnHandle,
        result: ReconfigureResult,
        cids: Vec<ChannelId>,
        mtu: u16,
        mps: u16,
        remote: bool,
    },
}

/// Opaque handle into the registration table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(pub(crate) u8);

/// What the accept callback is asked about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptRequest {
    pub handle: ConnHandle,
    pub psm: PSM,
    /// Channels the peer asked for in this request
    pub requested: u8,
    /// Channels this registration already has on the link
    pub open: u8,
}

/// Returns how many of the requested channels may be accepted
pub type AcceptCallback = Arc<dyn Fn(&AcceptRequest) -> u8 + Send + Sync>;

/// Decides whether an authorization-protected PSM may be used on a link
pub type AuthorizeCallback = Arc<dyn Fn(ConnHandle, PSM) -> bool + Send + Sync>;

/// Callback for channel events like connect, disconnect, etc.
pub type CocEventCallback = Arc<Mutex<dyn FnMut(CocEvent) -> L2capResult<()> + Send + 'static>>;
