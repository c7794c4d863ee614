use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

use crate::compression::{compress, CompressionType};
use crate::messages::Packet;

/// Upper bound for an inbound packet payload. Inbound packets declaring more
///  than this are dropped without any attempt to resync mid-stream.
pub const MAX_PACKET_SIZE: usize = 0x00ffff;

pub const PACKET_HEADER_SIZE: usize = 5;

const MAGIC: u8 = b'C';
const LEN_HI_PLACEHOLDER: u8 = b'H';
const LEN_MID_PLACEHOLDER: u8 = b'N';

/// The fixed 5-byte packet header: magic byte, a variable-width payload
///  length spread over up to three bytes, and the compression byte.
///
/// The length encoding fills bytes from the low end and leaves the ASCII
///  placeholders 'H' / 'N' in unused higher bytes, so the decoder can tell
///  a placeholder from a length byte without a separate width field. The
///  compression byte is kept raw here; interpreting it is the reader's
///  business since unknown values have protocol-level meaning (drop the
///  packet, keep the sticky codec unchanged).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub payload_len: usize,
    pub compression: u8,
}

impl PacketHeader {
    pub fn new(payload_len: usize, compression: u8) -> PacketHeader {
        PacketHeader {
            payload_len,
            compression,
        }
    }

    /// The total wire size of the packet this header starts.
    pub fn full_size(&self) -> usize {
        PACKET_HEADER_SIZE + self.payload_len
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        let len = self.payload_len;

        let hi = if len > 0xffff {
            ((len >> 16) & 0xff) as u8
        } else {
            LEN_HI_PLACEHOLDER
        };
        let mid = if len > 0xff {
            ((len >> 8) & 0xff) as u8
        } else {
            LEN_MID_PLACEHOLDER
        };

        buf.put_u8(MAGIC);
        buf.put_u8(hi);
        buf.put_u8(mid);
        buf.put_u8((len & 0xff) as u8);
        buf.put_u8(self.compression);
    }

    /// Mirrors [PacketHeader::ser] exactly: byte 3 is always the low length
    ///  byte; byte 1 being a non-placeholder makes both bytes 1 and 2 length
    ///  bytes regardless of byte 2's value.
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let magic = buf.try_get_u8()?;
        if magic != MAGIC {
            bail!("invalid packet magic byte: {:#04x}", magic);
        }

        let hi = buf.try_get_u8()?;
        let mid = buf.try_get_u8()?;
        let lo = buf.try_get_u8()?;
        let compression = buf.try_get_u8()?;

        let mut payload_len = lo as usize;
        if hi != LEN_HI_PLACEHOLDER {
            payload_len |= (hi as usize) << 16 | (mid as usize) << 8;
        } else if mid != LEN_MID_PLACEHOLDER {
            payload_len |= (mid as usize) << 8;
        }

        Ok(PacketHeader {
            payload_len,
            compression,
        })
    }
}

/// Serialize, compress and frame a packet into one contiguous wire buffer.
///  The header's declared length is the length of the (compressed) payload.
pub fn frame_packet(packet: &Packet, compression: CompressionType) -> BytesMut {
    let payload = prost::Message::encode_to_vec(packet);
    let payload = compress(compression, &payload);

    let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + payload.len());
    PacketHeader::new(payload.len(), compression.into()).ser(&mut buf);
    buf.extend_from_slice(&payload);
    buf
}
