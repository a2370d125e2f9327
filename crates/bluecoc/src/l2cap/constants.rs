//! L2CAP constants for LE credit based connection-oriented channels

// Fixed channel identifiers
pub const L2CAP_ATTRIBUTE_PROTOCOL_CID: u16 = 0x0004;
pub const L2CAP_LE_SIGNALING_CID: u16 = 0x0005;
pub const L2CAP_SECURITY_MANAGER_CID: u16 = 0x0006;

// LE dynamic channel identifier range
pub const L2CAP_DYNAMIC_CID_MIN: u16 = 0x0040;
pub const L2CAP_DYNAMIC_CID_MAX: u16 = 0x007F;

// Basic frame header: length (2) + channel id (2)
pub const L2CAP_BASIC_HEADER_SIZE: usize = 4;
// Signaling command header: code (1) + identifier (1) + length (2)
pub const L2CAP_COMMAND_HEADER_SIZE: usize = 4;
// SDU length field carried by the first K-frame of an SDU
pub const L2CAP_SDU_LENGTH_SIZE: usize = 2;

// Signaling command codes
pub const L2CAP_COMMAND_REJECT: u8 = 0x01;
pub const L2CAP_DISCONNECTION_REQUEST: u8 = 0x06;
pub const L2CAP_DISCONNECTION_RESPONSE: u8 = 0x07;
pub const L2CAP_LE_CREDIT_BASED_CONNECTION_REQUEST: u8 = 0x14;
pub const L2CAP_LE_CREDIT_BASED_CONNECTION_RESPONSE: u8 = 0x15;
pub const L2CAP_FLOW_CONTROL_CREDIT: u8 = 0x16;
pub const L2CAP_CREDIT_BASED_CONNECTION_REQUEST: u8 = 0x17;
pub const L2CAP_CREDIT_BASED_CONNECTION_RESPONSE: u8 = 0x18;
pub const L2CAP_CREDIT_BASED_RECONFIGURE_REQUEST: u8 = 0x19;
pub const L2CAP_CREDIT_BASED_RECONFIGURE_RESPONSE: u8 = 0x1A;

// Command reject reasons
pub const L2CAP_REJECT_NOT_UNDERSTOOD: u16 = 0x0000;
pub const L2CAP_REJECT_SIGNALING_MTU_EXCEEDED: u16 = 0x0001;
pub const L2CAP_REJECT_INVALID_CID: u16 = 0x0002;

// Connection results (LE credit based and enhanced credit based)
pub const L2CAP_RESULT_SUCCESS: u16 = 0x0000;
pub const L2CAP_RESULT_PSM_NOT_SUPPORTED: u16 = 0x0002;
pub const L2CAP_RESULT_NO_RESOURCES: u16 = 0x0004;
pub const L2CAP_RESULT_INSUFFICIENT_AUTHENTICATION: u16 = 0x0005;
pub const L2CAP_RESULT_INSUFFICIENT_AUTHORIZATION: u16 = 0x0006;
pub const L2CAP_RESULT_INSUFFICIENT_KEY_SIZE: u16 = 0x0007;
pub const L2CAP_RESULT_INSUFFICIENT_ENCRYPTION: u16 = 0x0008;
pub const L2CAP_RESULT_INVALID_SOURCE_CID: u16 = 0x0009;
pub const L2CAP_RESULT_SOURCE_CID_ALREADY_ALLOCATED: u16 = 0x000A;
pub const L2CAP_RESULT_UNACCEPTABLE_PARAMETERS: u16 = 0x000B;
pub const L2CAP_RESULT_INVALID_PARAMETERS: u16 = 0x000C;
// Locally generated, never sent on the wire
pub const L2CAP_RESULT_LOCAL_REJECTED: u16 = 0xFFFE;
pub const L2CAP_RESULT_LOCAL_TIMEOUT: u16 = 0xFFFF;

// Credit based reconfigure results
pub const L2CAP_RECONF_SUCCESS: u16 = 0x0000;
pub const L2CAP_RECONF_MTU_REDUCTION_NOT_ALLOWED: u16 = 0x0001;
pub const L2CAP_RECONF_MPS_REDUCTION_NOT_ALLOWED: u16 = 0x0002;
pub const L2CAP_RECONF_INVALID_DESTINATION_CID: u16 = 0x0003;
pub const L2CAP_RECONF_UNACCEPTABLE_PARAMETERS: u16 = 0x0004;

// LE credit based channel limits
pub const L2CAP_LE_MIN_MTU: u16 = 23;
pub const L2CAP_LE_MIN_MPS: u16 = 23;
pub const L2CAP_LE_MAX_MPS: u16 = 65533;
pub const L2CAP_LE_DEFAULT_MTU: u16 = 23;
pub const L2CAP_LE_MAX_CREDITS: u16 = 0xFFFF;

// Enhanced credit based channel limits
pub const L2CAP_ENHANCED_MIN_MTU: u16 = 64;
pub const L2CAP_ENHANCED_MIN_MPS: u16 = 64;
pub const L2CAP_ENHANCED_MAX_CHANNELS: usize = 5;

// Signaling request timeout (RTX), seconds
pub const L2CAP_REQUEST_TIMEOUT_SECS: u64 = 30;

// Default table sizes
pub const L2CAP_DEFAULT_MAX_CHANNELS: usize = 16;
pub const L2CAP_DEFAULT_MAX_REGISTRATIONS: usize = 8;
