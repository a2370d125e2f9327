//! L2CAP Signaling channel implementation
//!
//! This module encodes and decodes the LE signaling commands used by credit
//! based connection-oriented channels: connect, disconnect, flow control
//! credit, enhanced (multi-channel) connect and reconfigure, and command
//! reject.

use super::constants::*;
use super::packet::*;
use super::types::*;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Handle for identifying signaling transactions
pub type SignalId = u8;

/// L2CAP Signaling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    /// Command Reject
    CommandReject {
        identifier: SignalId,
        reason: u16,
        data: Vec<u8>,
    },

    /// Disconnection Request
    DisconnectionRequest {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
    },

    /// Disconnection Response
    DisconnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
    },

    /// LE Credit Based Connection Request
    LeCreditBasedConnectionRequest {
        identifier: SignalId,
        le_psm: u16,
        source_cid: u16,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
    },

    /// LE Credit Based Connection Response
    LeCreditBasedConnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
        result: u16,
    },

    /// Flow Control Credit Indication
    FlowControlCredit {
        identifier: SignalId,
        cid: u16,
        credits: u16,
    },

    /// Credit Based (enhanced) Connection Request
    CreditBasedConnectionRequest {
        identifier: SignalId,
        spsm: u16,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
        source_cids: Vec<u16>,
    },

    /// Credit Based (enhanced) Connection Response
    CreditBasedConnectionResponse {
        identifier: SignalId,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
        result: u16,
        destination_cids: Vec<u16>,
    },

    /// Credit Based Reconfigure Request
    CreditBasedReconfigureRequest {
        identifier: SignalId,
        mtu: u16,
        mps: u16,
        destination_cids: Vec<u16>,
    },

    /// Credit Based Reconfigure Response
    CreditBasedReconfigureResponse { identifier: SignalId, result: u16 },
}

fn read_u16(cursor: &mut Cursor<&[u8]>, field: &str) -> L2capResult<u16> {
    cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| L2capError::InvalidParameter(format!("Failed to read {}", field)))
}

fn read_cid_list(cursor: &mut Cursor<&[u8]>, remaining: usize, min: usize) -> L2capResult<Vec<u16>> {
    if remaining % 2 != 0 {
        return Err(L2capError::InvalidParameter("Odd length CID list".into()));
    }

    let count = remaining / 2;
    if count < min || count > L2CAP_ENHANCED_MAX_CHANNELS {
        return Err(L2capError::InvalidParameter(format!(
            "CID list holds {} entries",
            count
        )));
    }

    (0..count).map(|_| read_u16(cursor, "CID")).collect()
}

fn expect_length(params: &[u8], expected: usize, name: &str) -> L2capResult<()> {
    if params.len() != expected {
        return Err(L2capError::InvalidParameter(format!(
            "{} parameters are {} bytes, expected {}",
            name,
            params.len(),
            expected
        )));
    }
    Ok(())
}

impl SignalingMessage {
    /// Get the command code for this signaling message
    pub fn command_code(&self) -> u8 {
        match self {
            Self::CommandReject { .. } => L2CAP_COMMAND_REJECT,
            Self::DisconnectionRequest { .. } => L2CAP_DISCONNECTION_REQUEST,
            Self::DisconnectionResponse { .. } => L2CAP_DISCONNECTION_RESPONSE,
            Self::LeCreditBasedConnectionRequest { .. } => L2CAP_LE_CREDIT_BASED_CONNECTION_REQUEST,
            Self::LeCreditBasedConnectionResponse { .. } => L2CAP_LE_CREDIT_BASED_CONNECTION_RESPONSE,
            Self::FlowControlCredit { .. } => L2CAP_FLOW_CONTROL_CREDIT,
            Self::CreditBasedConnectionRequest { .. } => L2CAP_CREDIT_BASED_CONNECTION_REQUEST,
            Self::CreditBasedConnectionResponse { .. } => L2CAP_CREDIT_BASED_CONNECTION_RESPONSE,
            Self::CreditBasedReconfigureRequest { .. } => L2CAP_CREDIT_BASED_RECONFIGURE_REQUEST,
            Self::CreditBasedReconfigureResponse { .. } => L2CAP_CREDIT_BASED_RECONFIGURE_RESPONSE,
        }
    }

    /// Get the identifier for this signaling message
    pub fn identifier(&self) -> SignalId {
        match self {
            Self::CommandReject { identifier, .. }
            | Self::DisconnectionRequest { identifier, .. }
            | Self::DisconnectionResponse { identifier, .. }
            | Self::LeCreditBasedConnectionRequest { identifier, .. }
            | Self::LeCreditBasedConnectionResponse { identifier, .. }
            | Self::FlowControlCredit { identifier, .. }
            | Self::CreditBasedConnectionRequest { identifier, .. }
            | Self::CreditBasedConnectionResponse { identifier, .. }
            | Self::CreditBasedReconfigureRequest { identifier, .. }
            | Self::CreditBasedReconfigureResponse { identifier, .. } => *identifier,
        }
    }

    /// Whether the message opens a transaction the peer must answer
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Self::DisconnectionRequest { .. }
                | Self::LeCreditBasedConnectionRequest { .. }
                | Self::CreditBasedConnectionRequest { .. }
                | Self::CreditBasedReconfigureRequest { .. }
        )
    }

    /// Parse a signaling message from raw bytes
    pub fn parse(data: &[u8]) -> L2capResult<Self> {
        let header = CommandHeader::parse(data)
            .ok_or_else(|| L2capError::InvalidParameter("Signaling data too short".into()))?;

        Self::decode(&header, &data[L2CAP_COMMAND_HEADER_SIZE..])
    }

    /// Decode the parameters that follow an already parsed command header
    pub fn decode(header: &CommandHeader, data: &[u8]) -> L2capResult<Self> {
        if data.len() < header.length as usize {
            return Err(L2capError::InvalidParameter("Command parameters too short".into()));
        }

        let params = &data[..header.length as usize];
        let identifier = header.identifier;
        let mut cursor = Cursor::new(params);

        match header.code {
            L2CAP_COMMAND_REJECT => {
                if params.len() < 2 {
                    return Err(L2capError::InvalidParameter(
                        "Command reject parameters too short".into(),
                    ));
                }

                let reason = read_u16(&mut cursor, "reason")?;

                Ok(Self::CommandReject {
                    identifier,
                    reason,
                    data: params[2..].to_vec(),
                })
            }

            L2CAP_DISCONNECTION_REQUEST | L2CAP_DISCONNECTION_RESPONSE => {
                expect_length(params, 4, "Disconnection")?;

                let destination_cid = read_u16(&mut cursor, "destination CID")?;
                let source_cid = read_u16(&mut cursor, "source CID")?;

                if header.code == L2CAP_DISCONNECTION_REQUEST {
                    Ok(Self::DisconnectionRequest {
                        identifier,
                        destination_cid,
                        source_cid,
                    })
                } else {
                    Ok(Self::DisconnectionResponse {
                        identifier,
                        destination_cid,
                        source_cid,
                    })
                }
            }

            L2CAP_LE_CREDIT_BASED_CONNECTION_REQUEST => {
                expect_length(params, 10, "LE credit based connection request")?;

                Ok(Self::LeCreditBasedConnectionRequest {
                    identifier,
                    le_psm: read_u16(&mut cursor, "LE PSM")?,
                    source_cid: read_u16(&mut cursor, "source CID")?,
                    mtu: read_u16(&mut cursor, "MTU")?,
                    mps: read_u16(&mut cursor, "MPS")?,
                    initial_credits: read_u16(&mut cursor, "initial credits")?,
                })
            }

            L2CAP_LE_CREDIT_BASED_CONNECTION_RESPONSE => {
                expect_length(params, 10, "LE credit based connection response")?;

                Ok(Self::LeCreditBasedConnectionResponse {
                    identifier,
                    destination_cid: read_u16(&mut cursor, "destination CID")?,
                    mtu: read_u16(&mut cursor, "MTU")?,
                    mps: read_u16(&mut cursor, "MPS")?,
                    initial_credits: read_u16(&mut cursor, "initial credits")?,
                    result: read_u16(&mut cursor, "result")?,
                })
            }

            L2CAP_FLOW_CONTROL_CREDIT => {
                expect_length(params, 4, "Flow control credit")?;

                Ok(Self::FlowControlCredit {
                    identifier,
                    cid: read_u16(&mut cursor, "CID")?,
                    credits: read_u16(&mut cursor, "credits")?,
                })
            }

            L2CAP_CREDIT_BASED_CONNECTION_REQUEST => {
                if params.len() < 8 {
                    return Err(L2capError::InvalidParameter(
                        "Credit based connection request parameters too short".into(),
                    ));
                }

                let spsm = read_u16(&mut cursor, "SPSM")?;
                let mtu = read_u16(&mut cursor, "MTU")?;
                let mps = read_u16(&mut cursor, "MPS")?;
                let initial_credits = read_u16(&mut cursor, "initial credits")?;
                let source_cids = read_cid_list(&mut cursor, params.len() - 8, 1)?;

                Ok(Self::CreditBasedConnectionRequest {
                    identifier,
                    spsm,
                    mtu,
                    mps,
                    initial_credits,
                    source_cids,
                })
            }

            L2CAP_CREDIT_BASED_CONNECTION_RESPONSE => {
                if params.len() < 8 {
                    return Err(L2capError::InvalidParameter(
                        "Credit based connection response parameters too short".into(),
                    ));
                }

                let mtu = read_u16(&mut cursor, "MTU")?;
                let mps = read_u16(&mut cursor, "MPS")?;
                let initial_credits = read_u16(&mut cursor, "initial credits")?;
                let result = read_u16(&mut cursor, "result")?;
                let destination_cids = read_cid_list(&mut cursor, params.len() - 8, 0)?;

                Ok(Self::CreditBasedConnectionResponse {
                    identifier,
                    mtu,
                    mps,
                    initial_credits,
                    result,
                    destination_cids,
                })
            }

            L2CAP_CREDIT_BASED_RECONFIGURE_REQUEST => {
                if params.len() < 4 {
                    return Err(L2capError::InvalidParameter(
                        "Credit based reconfigure request parameters too short".into(),
                    ));
                }

                let mtu = read_u16(&mut cursor, "MTU")?;
                let mps = read_u16(&mut cursor, "MPS")?;
                let destination_cids = read_cid_list(&mut cursor, params.len() - 4, 1)?;

                Ok(Self::CreditBasedReconfigureRequest {
                    identifier,
                    mtu,
                    mps,
                    destination_cids,
                })
            }

            L2CAP_CREDIT_BASED_RECONFIGURE_RESPONSE => {
                expect_length(params, 2, "Credit based reconfigure response")?;

                Ok(Self::CreditBasedReconfigureResponse {
                    identifier,
                    result: read_u16(&mut cursor, "result")?,
                })
            }

            code => Err(L2capError::UnknownCommand(code)),
        }
    }

    /// Serialize the signaling message to bytes for transmission
    pub fn serialize(&self) -> Vec<u8> {
        let code = self.command_code();
        let identifier = self.identifier();

        let mut params = match self {
            Self::CommandReject { reason, data, .. } => {
                let mut params = Vec::with_capacity(2 + data.len());
                params.extend_from_slice(&reason.to_le_bytes());
                params.extend_from_slice(data);
                params
            }

            Self::DisconnectionRequest {
                destination_cid,
                source_cid,
                ..
            }
            | Self::DisconnectionResponse {
                destination_cid,
                source_cid,
                ..
            } => {
                let mut params = Vec::with_capacity(4);
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
                params
            }

            Self::LeCreditBasedConnectionRequest {
                le_psm,
                source_cid,
                mtu,
                mps,
                initial_credits,
                ..
            } => {
                let mut params = Vec::with_capacity(10);
                params.extend_from_slice(&le_psm.to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
                params.extend_from_slice(&mtu.to_le_bytes());
                params.extend_from_slice(&mps.to_le_bytes());
                params.extend_from_slice(&initial_credits.to_le_bytes());
                params
            }

            Self::LeCreditBasedConnectionResponse {
                destination_cid,
                mtu,
                mps,
                initial_credits,
                result,
                ..
            } => {
                let mut params = Vec::with_capacity(10);
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&mtu.to_le_bytes());
                params.extend_from_slice(&mps.to_le_bytes());
                params.extend_from_slice(&initial_credits.to_le_bytes());
                params.extend_from_slice(&result.to_le_bytes());
                params
            }

            Self::FlowControlCredit { cid, credits, .. } => {
                let mut params = Vec::with_capacity(4);
                params.extend_from_slice(&cid.to_le_bytes());
                params.extend_from_slice(&credits.to_le_bytes());
                params
            }

            Self::CreditBasedConnectionRequest {
                spsm,
                mtu,
                mps,
                initial_credits,
                source_cids,
                ..
            } => {
                let mut params = Vec::with_capacity(8 + 2 * source_cids.len());
                params.extend_from_slice(&spsm.to_le_bytes());
                params.extend_from_slice(&mtu.to_le_bytes());
                params.extend_from_slice(&mps.to_le_bytes());
                params.extend_from_slice(&initial_credits.to_le_bytes());
                for cid in source_cids {
                    params.extend_from_slice(&cid.to_le_bytes());
                }
                params
            }

            Self::CreditBasedConnectionResponse {
                mtu,
                mps,
                initial_credits,
                result,
                destination_cids,
                ..
            } => {
                let mut params = Vec::with_capacity(8 + 2 * destination_cids.len());
                params.extend_from_slice(&mtu.to_le_bytes());
                params.extend_from_slice(&mps.to_le_bytes());
                params.extend_from_slice(&initial_credits.to_le_bytes());
                params.extend_from_slice(&result.to_le_bytes());
                for cid in destination_cids {
                    params.extend_from_slice(&cid.to_le_bytes());
                }
                params
            }

            Self::CreditBasedReconfigureRequest {
                mtu,
                mps,
                destination_cids,
                ..
            } => {
                let mut params = Vec::with_capacity(4 + 2 * destination_cids.len());
                params.extend_from_slice(&mtu.to_le_bytes());
                params.extend_from_slice(&mps.to_le_bytes());
                for cid in destination_cids {
                    params.extend_from_slice(&cid.to_le_bytes());
                }
                params
            }

            Self::CreditBasedReconfigureResponse { result, .. } => result.to_le_bytes().to_vec(),
        };

        let cmd_header = CommandHeader::new(code, identifier, params.len() as u16);

        let mut result = Vec::with_capacity(L2CAP_COMMAND_HEADER_SIZE + params.len());
        result.extend_from_slice(&cmd_header.to_bytes());
        result.append(&mut params);

        result
    }

    /// Create an LE signaling L2CAP packet from this message
    pub fn to_packet(&self) -> BasicFrame {
        BasicFrame::new(L2CAP_LE_SIGNALING_CID, self.serialize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_le_connection_request_wire_format() {
        let request = SignalingMessage::LeCreditBasedConnectionRequest {
            identifier: 3,
            le_psm: 0x0027,
            source_cid: 0x0040,
            mtu: 65,
            mps: 65,
            initial_credits: 1,
        };

        let bytes = request.serialize();
        assert_eq!(
            bytes,
            vec![0x14, 0x03, 0x0A, 0x00, 0x27, 0x00, 0x40, 0x00, 0x41, 0x00, 0x41, 0x00, 0x01, 0x00]
        );
        assert_eq!(SignalingMessage::parse(&bytes).unwrap(), request);
    }

    #[test]
    fn test_enhanced_response_with_refused_entries() {
        let response = SignalingMessage::CreditBasedConnectionResponse {
            identifier: 9,
            mtu: 100,
            mps: 64,
            initial_credits: 5,
            result: L2CAP_RESULT_NO_RESOURCES,
            destination_cids: vec![0x0041, 0x0000, 0x0042],
        };

        let bytes = response.serialize();
        assert_eq!(bytes[2..4], [14, 0]);

        match SignalingMessage::parse(&bytes).unwrap() {
            SignalingMessage::CreditBasedConnectionResponse {
                destination_cids, ..
            } => assert_eq!(destination_cids, vec![0x0041, 0x0000, 0x0042]),
            other => panic!("Expected CreditBasedConnectionResponse, got {:?}", other),
        }
    }

    #[test]
    fn test_enhanced_request_cid_list_limits() {
        // Six CIDs is one more than allowed
        let mut bytes = vec![0x17, 0x01, 20, 0x00];
        bytes.extend_from_slice(&[0x27, 0x00, 0x40, 0x00, 0x40, 0x00, 0x01, 0x00]);
        for cid in 0x40u16..0x46 {
            bytes.extend_from_slice(&cid.to_le_bytes());
        }
        assert!(matches!(
            SignalingMessage::parse(&bytes),
            Err(L2capError::InvalidParameter(_))
        ));

        // An empty list is malformed for a request
        let bytes = vec![0x17, 0x01, 8, 0x00, 0x27, 0x00, 0x40, 0x00, 0x40, 0x00, 0x01, 0x00];
        assert!(SignalingMessage::parse(&bytes).is_err());
    }

    #[test]
    fn test_reconfigure_request_wire_format() {
        let request = SignalingMessage::CreditBasedReconfigureRequest {
            identifier: 2,
            mtu: 128,
            mps: 100,
            destination_cids: vec![0x0040, 0x0041],
        };
        let bytes = request.serialize();
        assert_eq!(bytes[0], L2CAP_CREDIT_BASED_RECONFIGURE_REQUEST);
        assert_eq!(bytes.len(), 4 + 4 + 4);
        assert_eq!(SignalingMessage::parse(&bytes).unwrap(), request);
    }

    #[test]
    fn test_unknown_command() {
        let bytes = [0x0A, 0x05, 0x02, 0x00, 0x02, 0x00];
        assert!(matches!(
            SignalingMessage::parse(&bytes),
            Err(L2capError::UnknownCommand(0x0A))
        ));
    }

    #[test]
    fn test_malformed_lengths() {
        // Flow control credit with a 3 byte body
        let bytes = [0x16, 0x01, 0x03, 0x00, 0x40, 0x00, 0x01];
        assert!(SignalingMessage::parse(&bytes).is_err());

        // Header claims more bytes than present
        let bytes = [0x06, 0x01, 0x04, 0x00, 0x40];
        assert!(SignalingMessage::parse(&bytes).is_err());
    }

    #[test]
    fn test_command_reject_with_data() {
        let reject = SignalingMessage::CommandReject {
            identifier: 4,
            reason: L2CAP_REJECT_INVALID_CID,
            data: vec![0x40, 0x00, 0x41, 0x00],
        };
        let packet = reject.to_packet();
        assert_eq!(packet.header.channel_id, L2CAP_LE_SIGNALING_CID);
        assert_eq!(SignalingMessage::parse(&packet.payload).unwrap(), reject);
    }
}
