//! Matter message and protocol header codec.
//!
//! Only the parts needed for counter checks and reliable delivery are decoded,
//! application payloads are passed through as bytes.

use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use core::fmt;
use std::io::{Read, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Node([u8; 8]),
    Group(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub session_id: u16,
    pub security_flags: u8,
    pub message_counter: u32,
    pub source_node_id: Option<[u8; 8]>,
    pub destination: Option<Destination>,
}

impl MessageHeader {
    const FLAG_SRC_PRESENT: u8 = 4;
    const DSIZ_MASK: u8 = 3;
    const DSIZ_64: u8 = 1;
    const DSIZ_16: u8 = 2;
    const VERSION_MASK: u8 = 0xf0;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut flags: u8 = 0;
        if self.source_node_id.is_some() {
            flags |= Self::FLAG_SRC_PRESENT;
        }
        match self.destination {
            Some(Destination::Node(_)) => flags |= Self::DSIZ_64,
            Some(Destination::Group(_)) => flags |= Self::DSIZ_16,
            None => {}
        }
        let mut out = Vec::with_capacity(32);
        out.write_u8(flags)?;
        out.write_u16::<LittleEndian>(self.session_id)?;
        out.write_u8(self.security_flags)?;
        out.write_u32::<LittleEndian>(self.message_counter)?;
        if let Some(src) = &self.source_node_id {
            out.write_all(src)?;
        }
        match &self.destination {
            Some(Destination::Node(node)) => out.write_all(node)?,
            Some(Destination::Group(group)) => out.write_u16::<LittleEndian>(*group)?,
            None => {}
        }
        Ok(out)
    }

    /// Decode header, returns header and remaining bytes.
    pub fn decode(data: &[u8]) -> Result<(Self, &[u8])> {
        let mut cursor = std::io::Cursor::new(data);
        let flags = cursor.read_u8()?;
        if flags & Self::VERSION_MASK != 0 {
            anyhow::bail!("unsupported message version {}", flags >> 4);
        }
        let session_id = cursor.read_u16::<LittleEndian>()?;
        let security_flags = cursor.read_u8()?;
        let message_counter = cursor.read_u32::<LittleEndian>()?;
        let source_node_id = if flags & Self::FLAG_SRC_PRESENT != 0 {
            let mut src = [0u8; 8];
            cursor.read_exact(&mut src).context("truncated source node id")?;
            Some(src)
        } else {
            None
        };
        let destination = match flags & Self::DSIZ_MASK {
            Self::DSIZ_64 => {
                let mut node = [0u8; 8];
                cursor.read_exact(&mut node).context("truncated destination node id")?;
                Some(Destination::Node(node))
            }
            Self::DSIZ_16 => Some(Destination::Group(cursor.read_u16::<LittleEndian>()?)),
            0 => None,
            _ => anyhow::bail!("reserved destination size"),
        };
        let pos = cursor.position() as usize;
        Ok((
            Self {
                session_id,
                security_flags,
                message_counter,
                source_node_id,
                destination,
            },
            &data[pos..],
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMessageHeader {
    pub exchange_flags: u8,
    pub opcode: u8,
    pub exchange_id: u16,
    pub vendor_id: Option<u16>,
    pub protocol_id: u16,
    pub ack_counter: Option<u32>,
}

impl ProtocolMessageHeader {
    pub const FLAG_INITIATOR: u8 = 1;
    pub const FLAG_ACK: u8 = 2;
    pub const FLAG_RELIABILITY: u8 = 4;
    pub const FLAG_VENDOR: u8 = 0x10;

    pub const OPCODE_MSG_COUNTER_SYNC_REQ: u8 = 0x00;
    pub const OPCODE_MSG_COUNTER_SYNC_RSP: u8 = 0x01;
    pub const OPCODE_ACK: u8 = 0x10;

    pub const PROTOCOL_ID_SECURE_CHANNEL: u16 = 0;

    pub fn new(exchange_id: u16, protocol_id: u16, opcode: u8, exchange_flags: u8) -> Self {
        Self {
            exchange_flags: exchange_flags & !(Self::FLAG_ACK | Self::FLAG_VENDOR),
            opcode,
            exchange_id,
            vendor_id: None,
            protocol_id,
            ack_counter: None,
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.exchange_flags & Self::FLAG_INITIATOR != 0
    }

    pub fn needs_ack(&self) -> bool {
        self.exchange_flags & Self::FLAG_RELIABILITY != 0
    }

    pub fn is_secure_channel(&self, opcode: u8) -> bool {
        self.protocol_id == Self::PROTOCOL_ID_SECURE_CHANNEL && self.vendor_id.is_none() && self.opcode == opcode
    }

    pub fn is_standalone_ack(&self) -> bool {
        self.is_secure_channel(Self::OPCODE_ACK)
    }

    pub fn set_ack(&mut self, counter: u32) {
        self.ack_counter = Some(counter);
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut flags = self.exchange_flags & !(Self::FLAG_ACK | Self::FLAG_VENDOR);
        if self.ack_counter.is_some() {
            flags |= Self::FLAG_ACK;
        }
        if self.vendor_id.is_some() {
            flags |= Self::FLAG_VENDOR;
        }
        let mut out = Vec::with_capacity(16);
        out.write_u8(flags)?;
        out.write_u8(self.opcode)?;
        out.write_u16::<LittleEndian>(self.exchange_id)?;
        if let Some(vendor_id) = self.vendor_id {
            out.write_u16::<LittleEndian>(vendor_id)?;
        }
        out.write_u16::<LittleEndian>(self.protocol_id)?;
        if let Some(ack) = self.ack_counter {
            out.write_u32::<LittleEndian>(ack)?;
        }
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<(Self, &[u8])> {
        let mut cursor = std::io::Cursor::new(data);
        let exchange_flags = cursor.read_u8()?;
        let opcode = cursor.read_u8()?;
        let exchange_id = cursor.read_u16::<LittleEndian>()?;
        let vendor_id = if exchange_flags & Self::FLAG_VENDOR != 0 {
            Some(cursor.read_u16::<LittleEndian>()?)
        } else {
            None
        };
        let protocol_id = cursor.read_u16::<LittleEndian>()?;
        let ack_counter = if exchange_flags & Self::FLAG_ACK != 0 {
            Some(cursor.read_u32::<LittleEndian>()?)
        } else {
            None
        };
        let pos = cursor.position() as usize;
        Ok((
            Self {
                exchange_flags,
                opcode,
                exchange_id,
                vendor_id,
                protocol_id,
                ack_counter,
            },
            &data[pos..],
        ))
    }
}

pub struct Message {
    pub message_header: MessageHeader,
    pub protocol_header: ProtocolMessageHeader,
    pub payload: Vec<u8>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("message_header", &self.message_header)
            .field("protocol_header", &self.protocol_header)
            .field("payload", &hex::encode(&self.payload))
            .finish()
    }
}

impl Message {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (message_header, rest) = MessageHeader::decode(data)?;
        let (protocol_header, payload) = ProtocolMessageHeader::decode(rest)?;
        Ok(Self {
            message_header,
            protocol_header,
            payload: payload.to_vec(),
        })
    }
}

/// Standalone ack for message `counter` received on `exchange`.
///
/// `initiator` tells whether we are the initiator of the exchange.
pub fn ack(exchange: u16, counter: u32, initiator: bool) -> Result<Vec<u8>> {
    let flags = if initiator {
        ProtocolMessageHeader::FLAG_INITIATOR
    } else {
        0
    };
    let mut header = ProtocolMessageHeader::new(
        exchange,
        ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL,
        ProtocolMessageHeader::OPCODE_ACK,
        flags,
    );
    header.set_ack(counter);
    header.encode()
}

/// Add ack of `counter` to already encoded protocol header + payload.
pub fn with_ack(data: &[u8], counter: u32) -> Result<Vec<u8>> {
    let (mut header, payload) = ProtocolMessageHeader::decode(data)?;
    header.set_ack(counter);
    let mut out = header.encode()?;
    out.write_all(payload)?;
    Ok(out)
}
