use anyhow::Context;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The compression codec named in byte 4 of the packet header.
///
/// The receive side treats this as "sticky": whenever a packet arrives with a
///  recognized non-zero value, the connection remembers it and compresses
///  subsequent outbound packets the same way. Unrecognized values never touch
///  the sticky state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    Snappy = 1,
}

impl CompressionType {
    pub fn as_str(self) -> &'static str {
        match self {
            CompressionType::None => "none",
            CompressionType::Snappy => "snappy",
        }
    }
}

/// Compress a serialized packet payload. The header is never compressed.
pub fn compress(compression: CompressionType, payload: &[u8]) -> Vec<u8> {
    match compression {
        CompressionType::None => payload.to_vec(),
        CompressionType::Snappy => snap::raw::Encoder::new()
            .compress_vec(payload)
            // the raw snappy encoder only fails on lengths beyond u32::MAX,
            //  far past the 3-byte length field of the packet header
            .unwrap_or_else(|_| payload.to_vec()),
    }
}

pub fn decompress(compression: CompressionType, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(payload.to_vec()),
        CompressionType::Snappy => snap::raw::Decoder::new()
            .decompress_vec(payload)
            .context("snappy decompression failed"),
    }
}
