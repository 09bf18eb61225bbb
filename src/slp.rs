use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};

/// Fixed-size binary header of a peer-to-peer ("SLP") frame, carried in the body region of a
///  payload whose content type is `application/x-msnmsgrp2p`.
///
/// All fields are little-endian on the wire. This is the layout with a 32-bit message id;
///  a later protocol revision widened `id` at the expense of `total_size`, byte-incompatible
///  at the same offsets, and is deliberately not decoded here (there is no version
///  negotiation signal to tell the two apart).
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct SlpHeader {
    pub session_id: u32,
    pub id: u32,
    pub offset: u64,
    pub total_size: u64,
    pub length: u32,
    pub flags: u32,
    pub ack_id: u32,
    pub ack_sub_id: u32,
    pub ack_size: u64,
}

impl SlpHeader {
    pub const SERIALIZED_LEN: usize = 48;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.session_id);
        buf.put_u32_le(self.id);
        buf.put_u64_le(self.offset);
        buf.put_u64_le(self.total_size);
        buf.put_u32_le(self.length);
        buf.put_u32_le(self.flags);
        buf.put_u32_le(self.ack_id);
        buf.put_u32_le(self.ack_sub_id);
        buf.put_u64_le(self.ack_size);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SlpHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return Err(anyhow!("SLP header truncated: {} < {} bytes", buf.remaining(), Self::SERIALIZED_LEN));
        }

        Ok(SlpHeader {
            session_id: buf.get_u32_le(),
            id: buf.get_u32_le(),
            offset: buf.get_u64_le(),
            total_size: buf.get_u64_le(),
            length: buf.get_u32_le(),
            flags: buf.get_u32_le(),
            ack_id: buf.get_u32_le(),
            ack_sub_id: buf.get_u32_le(),
            ack_size: buf.get_u64_le(),
        })
    }
}

/// Trailing 4-byte frame value, big-endian on the wire (unlike the header).
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct SlpFooter {
    pub value: u32,
}

impl SlpFooter {
    pub const SERIALIZED_LEN: usize = 4;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.value);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SlpFooter> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return Err(anyhow!("SLP footer truncated: {} < {} bytes", buf.remaining(), Self::SERIALIZED_LEN));
        }

        Ok(SlpFooter { value: buf.get_u32() })
    }
}

/// Header and footer of one SLP frame. The chunk data between the two lives in the owning
///  message's body.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct SlpFrame {
    pub header: SlpHeader,
    pub footer: SlpFooter,
}
