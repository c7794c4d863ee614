use prost::Message;
use tracing::warn;

use crate::compression::{decompress, CompressionType};
use crate::messages::Packet;
use crate::packet_header::{PacketHeader, MAX_PACKET_SIZE, PACKET_HEADER_SIZE};

/// Per-connection inbound buffer plus the scan that turns raw socket reads
///  into decoded packets.
///
/// The buffer has fixed capacity; each socket read appends at `read_pos`,
///  then [PacketAssembler::scan] walks the buffered bytes from the front and
///  emits every complete packet it finds. A partial packet (or partial
///  header) at the end of the buffered bytes is compacted to the front and
///  completed by later reads. Framing violations - bad magic, a declared
///  length over [MAX_PACKET_SIZE], a packet that would not fit the buffer -
///  drop the buffered bytes wholesale; there is no resync mid-stream.
#[derive(Debug)]
pub struct PacketAssembler {
    buf: Vec<u8>,
    read_pos: usize,
}

/// What one scan saw, in counter form. The caller folds this into the
///  process-wide metrics; keeping deltas here makes the scan testable
///  without any metrics plumbing.
#[derive(Debug, Default, PartialEq)]
pub struct ScanReport {
    pub packets: Vec<Packet>,
    /// The last recognized non-zero compression value seen in this scan, to
    ///  be adopted as the connection's sticky outbound codec.
    pub observed_compression: Option<CompressionType>,
    /// Wire bytes (headers included) of all frames that passed the size
    ///  checks, whether or not their payload decoded.
    pub bytes_consumed: u64,
    pub dropped: u64,
    pub fragmented: u64,
    pub combined: u64,
}

impl PacketAssembler {
    pub fn new(capacity: usize) -> PacketAssembler {
        PacketAssembler {
            buf: vec![0; capacity],
            read_pos: 0,
        }
    }

    /// The free tail of the buffer for the next socket read. Never empty
    ///  between scans: a scan either consumes buffered bytes or drops them.
    pub fn writable(&mut self) -> &mut [u8] {
        &mut self.buf[self.read_pos..]
    }

    /// Record that a socket read filled `n` bytes of [PacketAssembler::writable].
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.read_pos + n <= self.buf.len());
        self.read_pos += n;
    }

    #[cfg(test)]
    fn buffered(&self) -> &[u8] {
        &self.buf[..self.read_pos]
    }

    pub fn scan(&mut self) -> ScanReport {
        let mut report = ScanReport::default();

        if self.read_pos < PACKET_HEADER_SIZE {
            // unfinished header; keep what we have for the next read
            report.fragmented += 1;
            return report;
        }

        let mut buf_pos = 0;
        while buf_pos < self.read_pos {
            let remaining = self.read_pos - buf_pos;

            if remaining < PACKET_HEADER_SIZE {
                report.fragmented += 1;
                self.compact(buf_pos);
                return report;
            }

            let mut header_bytes = &self.buf[buf_pos..buf_pos + PACKET_HEADER_SIZE];
            let header = match PacketHeader::deser(&mut header_bytes) {
                Ok(header) => header,
                Err(_) => {
                    warn!(
                        tag = ?&self.buf[buf_pos..buf_pos + PACKET_HEADER_SIZE],
                        "invalid packet tag, dropping buffered bytes"
                    );
                    report.dropped += 1;
                    self.read_pos = 0;
                    return report;
                }
            };

            if header.payload_len > MAX_PACKET_SIZE {
                warn!(
                    packet_size = header.payload_len,
                    "packet size exceeds the limit, dropping buffered bytes"
                );
                report.dropped += 1;
                self.read_pos = 0;
                return report;
            }

            let full_size = header.full_size();
            if remaining < full_size {
                // unfinished packet; carry the tail over to the next read
                report.fragmented += 1;
                self.compact(buf_pos);
                return report;
            }

            if buf_pos + full_size >= self.buf.len() {
                warn!(
                    packet_size = header.payload_len,
                    "packet size exceeds the read buffer, dropping buffered bytes"
                );
                report.dropped += 1;
                self.read_pos = 0;
                return report;
            }

            report.bytes_consumed += full_size as u64;

            match self.decode_payload(buf_pos, &header, &mut report) {
                Some(packet) => report.packets.push(packet),
                None => report.dropped += 1,
            }

            // either way the frame is consumed - a payload that fails to
            //  decode must not be looked at again
            buf_pos += full_size;
            if buf_pos < self.read_pos {
                report.combined += 1;
            }
        }

        self.read_pos = 0;
        report
    }

    fn decode_payload(
        &self,
        buf_pos: usize,
        header: &PacketHeader,
        report: &mut ScanReport,
    ) -> Option<Packet> {
        let payload = &self.buf[buf_pos + PACKET_HEADER_SIZE..buf_pos + header.full_size()];

        let decompressed;
        let payload = if header.compression != 0 {
            let compression = match CompressionType::try_from(header.compression) {
                Ok(compression) => compression,
                Err(_) => {
                    warn!(
                        compression = header.compression,
                        "unknown compression type, dropping packet"
                    );
                    return None;
                }
            };
            report.observed_compression = Some(compression);

            decompressed = match decompress(compression, payload) {
                Ok(decompressed) => decompressed,
                Err(e) => {
                    warn!("decompressing packet payload: {:#}", e);
                    return None;
                }
            };
            &decompressed[..]
        } else {
            payload
        };

        match Packet::decode(payload) {
            Ok(packet) => Some(packet),
            Err(e) => {
                warn!("unmarshalling packet: {}", e);
                None
            }
        }
    }

    fn compact(&mut self, buf_pos: usize) {
        let residual = self.read_pos - buf_pos;
        self.buf.copy_within(buf_pos..self.read_pos, 0);
        self.read_pos = residual;
    }
}
