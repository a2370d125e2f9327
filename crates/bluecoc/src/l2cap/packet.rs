//! Frame layouts
//!
//! Basic frames carry every payload on an LE link: a 2-byte length and a
//! 2-byte CID ahead of the information payload. Signaling payloads start
//! with a 4-byte command header.

use byteorder::{ByteOrder, LittleEndian};

use super::constants::*;
use super::types::ChannelId;

/// Basic frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicHeader {
    /// Information payload length
    pub length: u16,
    pub channel_id: ChannelId,
}

impl BasicHeader {
    pub fn new(length: u16, channel_id: ChannelId) -> Self {
        Self { length, channel_id }
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        let raw = data.get(..L2CAP_BASIC_HEADER_SIZE)?;
        Some(Self {
            length: LittleEndian::read_u16(&raw[0..2]),
            channel_id: LittleEndian::read_u16(&raw[2..4]),
        })
    }

    pub fn to_bytes(&self) -> [u8; L2CAP_BASIC_HEADER_SIZE] {
        let mut raw = [0u8; L2CAP_BASIC_HEADER_SIZE];
        LittleEndian::write_u16(&mut raw[0..2], self.length);
        LittleEndian::write_u16(&mut raw[2..4], self.channel_id);
        raw
    }
}

/// A complete basic frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicFrame {
    pub header: BasicHeader,
    pub payload: Vec<u8>,
}

impl BasicFrame {
    pub fn new(channel_id: ChannelId, payload: Vec<u8>) -> Self {
        Self {
            header: BasicHeader::new(payload.len() as u16, channel_id),
            payload,
        }
    }

    /// Splits a raw frame. Bytes past the announced length are ignored; a
    /// buffer shorter than announced yields `None`.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let header = BasicHeader::parse(data)?;
        let payload = data.get(L2CAP_BASIC_HEADER_SIZE..L2CAP_BASIC_HEADER_SIZE + header.length as usize)?;

        Some(Self {
            header,
            payload: payload.to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        [&self.header.to_bytes()[..], &self.payload].concat()
    }

    /// Bytes on the wire, header included
    pub fn size(&self) -> usize {
        L2CAP_BASIC_HEADER_SIZE + self.payload.len()
    }
}

/// Header of one signaling command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub code: u8,
    /// Matches a response to its request on the link
    pub identifier: u8,
    /// Parameter length
    pub length: u16,
}

impl CommandHeader {
    pub fn new(code: u8, identifier: u8, length: u16) -> Self {
        Self {
            code,
            identifier,
            length,
        }
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        let raw = data.get(..L2CAP_COMMAND_HEADER_SIZE)?;
        Some(Self {
            code: raw[0],
            identifier: raw[1],
            length: LittleEndian::read_u16(&raw[2..4]),
        })
    }

    pub fn to_bytes(&self) -> [u8; L2CAP_COMMAND_HEADER_SIZE] {
        let mut raw = [self.code, self.identifier, 0, 0];
        LittleEndian::write_u16(&mut raw[2..4], self.length);
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_frame_layout() {
        let frame = BasicFrame::new(0x0040, vec![1, 2, 3, 4]);
        assert_eq!(frame.size(), 8);

        let bytes = frame.to_bytes();
        assert_eq!(bytes, vec![0x04, 0x00, 0x40, 0x00, 1, 2, 3, 4]);
        assert_eq!(BasicFrame::parse(&bytes), Some(frame));
    }

    #[test]
    fn test_truncated_and_padded_frames() {
        // Header announces 8 bytes but only 2 follow
        assert!(BasicFrame::parse(&[0x08, 0x00, 0x40, 0x00, 0xAA, 0xBB]).is_none());
        assert!(BasicHeader::parse(&[0x08, 0x00, 0x40]).is_none());

        let padded = BasicFrame::parse(&[0x01, 0x00, 0x04, 0x00, 0xAA, 0xBB]).unwrap();
        assert_eq!(padded.header.channel_id, L2CAP_ATTRIBUTE_PROTOCOL_CID);
        assert_eq!(padded.payload, vec![0xAA]);
    }

    #[test]
    fn test_command_header() {
        let header = CommandHeader::new(L2CAP_FLOW_CONTROL_CREDIT, 7, 4);
        assert_eq!(header.to_bytes(), [0x16, 0x07, 0x04, 0x00]);
        assert_eq!(CommandHeader::parse(&header.to_bytes()), Some(header));
        assert!(CommandHeader::parse(&[0x16, 0x07]).is_none());
    }
}
