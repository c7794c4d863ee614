use std::path::Path;

use anyhow::{bail, Context};
use serde::Deserialize;

use crate::packet_header::{MAX_PACKET_SIZE, PACKET_HEADER_SIZE};

/// Process-wide configuration snapshot. The embedding process builds (or
///  loads) one of these once and hands it to [crate::server::ServerContext];
///  nothing in this crate reads configuration from anywhere else.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Settings {
    /// Development mode switches connection id allocation from hashed ids to
    ///  a monotonic counter, which makes ids predictable across runs.
    pub development: bool,

    /// Read buffer capacity for backend server connections. Servers fan in
    ///  traffic for many players, so their buffer is sized generously.
    pub server_read_buffer_size: usize,

    /// Read buffer capacity for game client connections.
    pub client_read_buffer_size: usize,

    /// Width of the connection id space in bits (1..=32). Connection ids are
    ///  allocated in `[1, 2^bits - 1]`.
    pub max_connection_id_bits: u8,

    /// If greater than zero, connections that have not authenticated within
    ///  this many milliseconds are closed by the sweeper.
    pub connection_auth_timeout_ms: u64,

    /// Record every decoded inbound packet on client connections and persist
    ///  the session at close.
    pub enable_record_packet: bool,

    /// Directory for persisted replay sessions.
    pub replay_session_persistence_dir: String,

    /// Declarative state machine description for server connections. Must be
    ///  readable at startup.
    pub server_fsm_path: String,

    /// Declarative state machine description for client connections. Must be
    ///  readable at startup.
    pub client_fsm_path: String,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            development: false,
            server_read_buffer_size: 64 * (PACKET_HEADER_SIZE + MAX_PACKET_SIZE),
            client_read_buffer_size: 4 * (PACKET_HEADER_SIZE + MAX_PACKET_SIZE),
            max_connection_id_bits: 32,
            connection_auth_timeout_ms: 0,
            enable_record_packet: false,
            replay_session_persistence_dir: "replays".to_owned(),
            server_fsm_path: "config/server_fsm.json".to_owned(),
            client_fsm_path: "config/client_fsm.json".to_owned(),
        }
    }
}

impl Settings {
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Settings> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings file {:?}", path))?;
        let settings: Settings = serde_json::from_str(&raw)
            .with_context(|| format!("parsing settings file {:?}", path))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_connection_id_bits < 1 || self.max_connection_id_bits > 32 {
            bail!(
                "MaxConnectionIdBits must be in 1..=32, was {}",
                self.max_connection_id_bits
            );
        }

        // a buffer that cannot hold one maximum-size packet would drop every
        //  such packet as oversized
        let min_buffer = PACKET_HEADER_SIZE + MAX_PACKET_SIZE;
        if self.server_read_buffer_size < min_buffer {
            bail!(
                "ServerReadBufferSize must be at least {}, was {}",
                min_buffer,
                self.server_read_buffer_size
            );
        }
        if self.client_read_buffer_size < min_buffer {
            bail!(
                "ClientReadBufferSize must be at least {}, was {}",
                min_buffer,
                self.client_read_buffer_size
            );
        }

        Ok(())
    }

    /// The highest connection id that fits [Settings::max_connection_id_bits].
    pub fn max_connection_id(&self) -> u32 {
        (((1u64 << self.max_connection_id_bits) - 1) & 0xffff_ffff) as u32
    }
}
