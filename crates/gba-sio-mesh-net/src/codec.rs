use std::net::Ipv4Addr;

use thiserror::Error;

pub const PACKET_HELLO: u8 = 0x01;
pub const PACKET_JOIN: u8 = 0x02;
pub const PACKET_LEAVE: u8 = 0x03;
pub const PACKET_TRANSFER_START: u8 = 0x10;
pub const PACKET_TRANSFER_DATA: u8 = 0x11;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unknown packet type {0:#04x}")]
    UnknownType(u8),
    #[error("unsupported address family, ip_version={0}")]
    UnsupportedIpVersion(u32),
}

/// One wire packet, little-endian on the byte level per field.
///
/// `Leave` is decodable and encodable for completeness but this crate never
/// constructs or dispatches on it; the opcode is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet {
    Hello { id: u8, sync: u32 },
    Join { id: u8, port: u16, address: Ipv4Addr },
    Leave,
    TransferStart { sync: u32 },
    TransferData { id: u8, data: u16 },
}

impl Packet {
    pub fn packet_type(self) -> u8 {
        match self {
            Packet::Hello { .. } => PACKET_HELLO,
            Packet::Join { .. } => PACKET_JOIN,
            Packet::Leave => PACKET_LEAVE,
            Packet::TransferStart { .. } => PACKET_TRANSFER_START,
            Packet::TransferData { .. } => PACKET_TRANSFER_DATA,
        }
    }

    /// Encodes this packet as its on-wire byte sequence, including the
    /// leading type byte and, for `Join`, the trailing address bytes.
    pub fn encode(self) -> Vec<u8> {
        match self {
            Packet::Hello { id, sync } => {
                let mut buf = Vec::with_capacity(6);
                buf.push(PACKET_HELLO);
                buf.push(id);
                buf.extend_from_slice(&sync.to_le_bytes());
                buf
            }
            Packet::Join { id, port, address } => {
                let mut buf = Vec::with_capacity(12);
                buf.push(PACKET_JOIN);
                buf.push(id);
                buf.extend_from_slice(&port.to_le_bytes());
                buf.extend_from_slice(&4u32.to_le_bytes());
                buf.extend_from_slice(&address.octets());
                buf
            }
            Packet::Leave => vec![PACKET_LEAVE, 0],
            Packet::TransferStart { sync } => {
                let mut buf = Vec::with_capacity(6);
                buf.push(PACKET_TRANSFER_START);
                buf.push(0);
                buf.extend_from_slice(&sync.to_le_bytes());
                buf
            }
            Packet::TransferData { id, data } => {
                let mut buf = Vec::with_capacity(4);
                buf.push(PACKET_TRANSFER_DATA);
                buf.push(id);
                buf.extend_from_slice(&data.to_le_bytes());
                buf
            }
        }
    }

    /// Size in bytes of the fixed header for a given type byte, i.e.
    /// everything except a Join's trailing address bytes. The caller reads
    /// this many bytes (minus the type byte already consumed), then for
    /// `Join` reads `ip_version` more before calling [`Packet::decode_join_address`].
    pub fn fixed_len(packet_type: u8) -> Result<usize, CodecError> {
        match packet_type {
            PACKET_HELLO => Ok(6),
            PACKET_JOIN => Ok(8),
            PACKET_LEAVE => Ok(2),
            PACKET_TRANSFER_START => Ok(6),
            PACKET_TRANSFER_DATA => Ok(4),
            other => Err(CodecError::UnknownType(other)),
        }
    }

    /// Decodes a non-`Join` packet from its full fixed-size byte buffer
    /// (type byte included). For `Join`, use [`decode_join`] once the
    /// address bytes have been read as well.
    pub fn decode_fixed(buf: &[u8]) -> Result<Packet, CodecError> {
        let packet_type = buf[0];
        match packet_type {
            PACKET_HELLO => Ok(Packet::Hello {
                id: buf[1],
                sync: u32::from_le_bytes(buf[2..6].try_into().unwrap()),
            }),
            PACKET_LEAVE => Ok(Packet::Leave),
            PACKET_TRANSFER_START => Ok(Packet::TransferStart {
                sync: u32::from_le_bytes(buf[2..6].try_into().unwrap()),
            }),
            PACKET_TRANSFER_DATA => Ok(Packet::TransferData {
                id: buf[1],
                data: u16::from_le_bytes(buf[2..4].try_into().unwrap()),
            }),
            PACKET_JOIN => unreachable!("Join is decoded via decode_join"),
            other => Err(CodecError::UnknownType(other)),
        }
    }

    /// Reads `id`, `port`, `ip_version` from a Join's fixed header
    /// (`fixed_len(PACKET_JOIN)` bytes, type byte included) without the
    /// trailing address.
    pub fn decode_join_header(buf: &[u8]) -> (u8, u16, u32) {
        let id = buf[1];
        let port = u16::from_le_bytes(buf[2..4].try_into().unwrap());
        let ip_version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        (id, port, ip_version)
    }

    /// Completes a Join decode given the header fields and the
    /// `ip_version`-length address bytes read after the header. Only
    /// `ip_version == 4` is supported; anything else is a [`CodecError`],
    /// even though the byte count has already been consumed off the wire
    /// (the caller must still drain those bytes to keep the stream framed).
    pub fn decode_join(id: u8, port: u16, ip_version: u32, address_bytes: &[u8]) -> Result<Packet, CodecError> {
        if ip_version != 4 {
            return Err(CodecError::UnsupportedIpVersion(ip_version));
        }
        let octets: [u8; 4] = address_bytes[..4]
            .try_into()
            .map_err(|_| CodecError::UnsupportedIpVersion(ip_version))?;
        Ok(Packet::Join { id, port, address: Ipv4Addr::from(octets) })
    }
}
