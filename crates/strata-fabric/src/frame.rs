//! Wire framing: connection preamble and per-message frame headers.
//!
//! The fabric owns framing on top of the byte-stream transport. Each
//! connection carries one channel for one peer: the connecting side opens
//! with a fixed preamble naming itself and the channel, then a stream of
//! length-prefixed frames follows. Framing damage (bad magic, bad version,
//! oversized payload) is a transport fault and tears the connection down;
//! schema-level problems inside a payload never do.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::channel::FabricChannel;
use crate::error::{FabricError, Result};
use crate::msg::{Msg, MsgType};
use crate::node::NodeId;

/// Frame and preamble magic.
pub const MAGIC: u32 = 0x53_46_41_42; // "SFAB"

/// Wire protocol version.
pub const VERSION: u8 = 1;

/// Frame header size: magic:4 + version:1 + channel:1 + msg_type:2 + payload_len:4.
pub const FRAME_HEADER_SIZE: usize = 12;

/// Connection preamble size: magic:4 + node:8 + channel:1.
pub const PREAMBLE_SIZE: usize = 13;

/// Largest accepted frame payload.
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Channel the frame belongs to; must match the connection's preamble.
    pub channel: FabricChannel,
    /// Registered type of the payload.
    pub msg_type: MsgType,
    /// Payload length in bytes.
    pub payload_len: u32,
}

impl FrameHeader {
    /// Decodes and validates a header from exactly [`FRAME_HEADER_SIZE`] bytes.
    pub fn decode(raw: &[u8; FRAME_HEADER_SIZE]) -> Result<Self> {
        let mut buf = &raw[..];
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(FabricError::Unknown(format!(
                "bad frame magic 0x{magic:08x}"
            )));
        }
        let version = buf.get_u8();
        if version != VERSION {
            return Err(FabricError::Unknown(format!(
                "unsupported frame version {version}"
            )));
        }
        let channel_tag = buf.get_u8();
        let channel = FabricChannel::from_wire_tag(channel_tag).ok_or_else(|| {
            FabricError::Unknown(format!("bad channel tag {channel_tag}"))
        })?;
        let msg_type = buf.get_u16();
        let payload_len = buf.get_u32();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(FabricError::Unknown(format!(
                "frame payload of {payload_len} bytes exceeds limit"
            )));
        }
        Ok(Self {
            channel,
            msg_type,
            payload_len,
        })
    }
}

/// Encodes a message into a complete frame (header + payload).
pub fn encode_frame(msg: &Msg, channel: FabricChannel) -> Result<Bytes> {
    let payload_len = msg.wire_size();
    if payload_len > MAX_PAYLOAD_SIZE as usize {
        return Err(FabricError::BadMessage {
            reason: format!("encoded payload of {payload_len} bytes exceeds limit"),
        });
    }
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
    buf.put_u32(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(channel.wire_tag());
    buf.put_u16(msg.msg_type());
    buf.put_u32(payload_len as u32);
    msg.encode(&mut buf);
    Ok(buf.freeze())
}

/// Connection-opening preamble: who is connecting, on which channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    /// Node identifier of the connecting side.
    pub node: NodeId,
    /// Channel this connection will carry.
    pub channel: FabricChannel,
}

impl Preamble {
    /// Encodes the preamble to its fixed wire form.
    pub fn encode(&self) -> [u8; PREAMBLE_SIZE] {
        let mut raw = [0u8; PREAMBLE_SIZE];
        let mut buf = &mut raw[..];
        buf.put_u32(MAGIC);
        buf.put_u64(self.node.as_u64());
        buf.put_u8(self.channel.wire_tag());
        raw
    }

    /// Decodes and validates a preamble from exactly [`PREAMBLE_SIZE`] bytes.
    pub fn decode(raw: &[u8; PREAMBLE_SIZE]) -> Result<Self> {
        let mut buf = &raw[..];
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(FabricError::Unknown(format!(
                "bad preamble magic 0x{magic:08x}"
            )));
        }
        let node = NodeId(buf.get_u64());
        let channel_tag = buf.get_u8();
        let channel = FabricChannel::from_wire_tag(channel_tag).ok_or_else(|| {
            FabricError::Unknown(format!("bad preamble channel tag {channel_tag}"))
        })?;
        Ok(Self { node, channel })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{FieldKind, MsgTemplate};
    use std::sync::Arc;

    #[test]
    fn test_preamble_roundtrip() {
        let preamble = Preamble {
            node: NodeId(0xdead_beef_0000_0001),
            channel: FabricChannel::Bulk,
        };
        let raw = preamble.encode();
        assert_eq!(Preamble::decode(&raw).unwrap(), preamble);
    }

    #[test]
    fn test_preamble_rejects_bad_magic() {
        let mut raw = Preamble {
            node: NodeId(1),
            channel: FabricChannel::Rw,
        }
        .encode();
        raw[0] ^= 0xff;
        assert!(Preamble::decode(&raw).is_err());
    }

    #[test]
    fn test_frame_roundtrip() {
        let template = Arc::new(MsgTemplate::new(&[FieldKind::U32, FieldKind::Str]));
        let mut msg = Msg::new(7, template);
        msg.set_u32(0, 123).unwrap();
        msg.set_str(1, "hello").unwrap();

        let frame = encode_frame(&msg, FabricChannel::Meta).unwrap();
        assert_eq!(frame.len(), FRAME_HEADER_SIZE + msg.wire_size());

        let mut header_raw = [0u8; FRAME_HEADER_SIZE];
        header_raw.copy_from_slice(&frame[..FRAME_HEADER_SIZE]);
        let header = FrameHeader::decode(&header_raw).unwrap();
        assert_eq!(header.channel, FabricChannel::Meta);
        assert_eq!(header.msg_type, 7);
        assert_eq!(header.payload_len as usize, msg.wire_size());
    }

    #[test]
    fn test_header_rejects_bad_version() {
        let template = Arc::new(MsgTemplate::new(&[]));
        let msg = Msg::new(1, template);
        let frame = encode_frame(&msg, FabricChannel::Rw).unwrap();
        let mut header_raw = [0u8; FRAME_HEADER_SIZE];
        header_raw.copy_from_slice(&frame[..FRAME_HEADER_SIZE]);
        header_raw[4] = 99;
        assert!(FrameHeader::decode(&header_raw).is_err());
    }

    #[test]
    fn test_header_rejects_oversized_payload() {
        let mut raw = [0u8; FRAME_HEADER_SIZE];
        {
            let mut buf = &mut raw[..];
            buf.put_u32(MAGIC);
            buf.put_u8(VERSION);
            buf.put_u8(FabricChannel::Rw.wire_tag());
            buf.put_u16(1);
            buf.put_u32(MAX_PAYLOAD_SIZE + 1);
        }
        assert!(FrameHeader::decode(&raw).is_err());
    }
}
