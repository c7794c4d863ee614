use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use prost::Message;

use crate::messages::Packet;
use crate::registry::ConnectionId;

/// Persisted session envelope. After the rewrite at close, `offset_time` of
///  the first packet is its original absolute timestamp (nanoseconds since
///  epoch) and every later entry holds the delta from its predecessor, so a
///  player can re-feed the session with original pacing.
#[derive(Clone, PartialEq, Message)]
pub struct ReplaySession {
    #[prost(message, repeated, tag = "1")]
    pub packets: Vec<ReplayPacket>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReplayPacket {
    #[prost(int64, tag = "1")]
    pub offset_time: i64,
    #[prost(message, optional, tag = "2")]
    pub packet: Option<Packet>,
}

/// Tap on the receive path of a client connection, recording every decoded
///  packet with its arrival time. Only the receive worker touches it while
///  the connection lives; close takes it over for persistence.
#[derive(Debug, Default)]
pub struct ReplayRecorder {
    packets: Vec<ReplayPacket>,
}

impl ReplayRecorder {
    pub fn new() -> ReplayRecorder {
        ReplayRecorder {
            packets: Vec::with_capacity(1024),
        }
    }

    pub fn record(&mut self, packet: &Packet) {
        self.packets.push(ReplayPacket {
            offset_time: now_nanos(),
            packet: Some(packet.clone()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// Rewrite timestamps to deltas, serialize and write the session to
    ///  `<dir>/session_<id>_<yy-mm-dd_HH-MM-SS>.cpr`, creating the directory
    ///  if needed. Consumes the recorder; the rewrite is destructive.
    pub fn persist(mut self, dir: &str, conn_id: ConnectionId) -> anyhow::Result<PathBuf> {
        if self.packets.is_empty() {
            bail!("replay session is empty");
        }

        rewrite_as_deltas(&mut self.packets);

        let session = ReplaySession {
            packets: self.packets,
        };
        let data = session.encode_to_vec();

        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating replay directory {:?}", dir))?;

        let filename = format!(
            "session_{}_{}.cpr",
            conn_id,
            chrono::Local::now().format("%y-%m-%d_%H-%M-%S")
        );
        let path = Path::new(dir).join(filename);
        std::fs::write(&path, data)
            .with_context(|| format!("writing replay session to {:?}", path))?;
        Ok(path)
    }
}

/// Order-preserving, deterministic: entry 0 keeps its absolute timestamp,
///  entry n becomes `t(n) - t(n-1)` of the original values.
fn rewrite_as_deltas(packets: &mut [ReplayPacket]) {
    let mut prev = match packets.first() {
        Some(first) => first.offset_time,
        None => return,
    };

    for packet in packets.iter_mut().skip(1) {
        let original = packet.offset_time;
        packet.offset_time -= prev;
        prev = original;
    }
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
