use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::messages::ConnectionType;

/// Traffic and lifecycle counters, one slot per [ConnectionType]. Everything
///  is relaxed: these are observability counters, not synchronization.
#[derive(Debug, Default)]
pub struct Metrics {
    connection_num: [AtomicI64; 2],
    packet_received: [AtomicU64; 2],
    packet_sent: [AtomicU64; 2],
    bytes_received: [AtomicU64; 2],
    bytes_sent: [AtomicU64; 2],
    packet_dropped: [AtomicU64; 2],
    fragmented_packet_count: [AtomicU64; 2],
    combined_packet_count: [AtomicU64; 2],
    msg_received: [AtomicU64; 2],
    msg_sent: [AtomicU64; 2],
    fsm_disallowed: [AtomicU64; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub connection_num: i64,
    pub packet_received: u64,
    pub packet_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub packet_dropped: u64,
    pub fragmented_packet_count: u64,
    pub combined_packet_count: u64,
    pub msg_received: u64,
    pub msg_sent: u64,
    pub fsm_disallowed: u64,
}

impl Metrics {
    pub fn new() -> Metrics {
        Metrics::default()
    }

    pub fn connection_opened(&self, t: ConnectionType) {
        self.connection_num[t.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self, t: ConnectionType) {
        self.connection_num[t.index()].fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_packet_received(&self, t: ConnectionType, packets: u64) {
        self.packet_received[t.index()].fetch_add(packets, Ordering::Relaxed);
    }

    pub fn inc_packet_sent(&self, t: ConnectionType) {
        self.packet_sent[t.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, t: ConnectionType, bytes: u64) {
        self.bytes_received[t.index()].fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_sent(&self, t: ConnectionType, bytes: u64) {
        self.bytes_sent[t.index()].fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_packet_dropped(&self, t: ConnectionType, packets: u64) {
        self.packet_dropped[t.index()].fetch_add(packets, Ordering::Relaxed);
    }

    pub fn add_fragmented_packet(&self, t: ConnectionType, packets: u64) {
        self.fragmented_packet_count[t.index()].fetch_add(packets, Ordering::Relaxed);
    }

    pub fn add_combined_packet(&self, t: ConnectionType, packets: u64) {
        self.combined_packet_count[t.index()].fetch_add(packets, Ordering::Relaxed);
    }

    pub fn inc_msg_received(&self, t: ConnectionType) {
        self.msg_received[t.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_msg_sent(&self, t: ConnectionType) {
        self.msg_sent[t.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fsm_disallowed(&self, t: ConnectionType) {
        self.fsm_disallowed[t.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, t: ConnectionType) -> MetricsSnapshot {
        let i = t.index();
        MetricsSnapshot {
            connection_num: self.connection_num[i].load(Ordering::Relaxed),
            packet_received: self.packet_received[i].load(Ordering::Relaxed),
            packet_sent: self.packet_sent[i].load(Ordering::Relaxed),
            bytes_received: self.bytes_received[i].load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent[i].load(Ordering::Relaxed),
            packet_dropped: self.packet_dropped[i].load(Ordering::Relaxed),
            fragmented_packet_count: self.fragmented_packet_count[i].load(Ordering::Relaxed),
            combined_packet_count: self.combined_packet_count[i].load(Ordering::Relaxed),
            msg_received: self.msg_received[i].load(Ordering::Relaxed),
            msg_sent: self.msg_sent[i].load(Ordering::Relaxed),
            fsm_disallowed: self.fsm_disallowed[i].load(Ordering::Relaxed),
        }
    }
}
