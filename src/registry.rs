use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHasher};
use tracing::warn;

use crate::connection::Connection;
use crate::settings::Settings;

/// Opaque per-process connection identity. The value space is
///  `[1, 2^maxConnectionIdBits - 1]`; ids may be reused after a connection
///  closes but never clash with a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-wide connection bookkeeping: the registry proper (all live
///  connections), the unauthenticated subset the timeout sweeper works from,
///  and id allocation. Lookup-heavy; writes happen on accept and close only.
pub struct ConnectionRegistry {
    connections: RwLock<FxHashMap<ConnectionId, Arc<Connection>>>,
    unauthenticated: RwLock<FxHashMap<ConnectionId, Arc<Connection>>>,
    next_connection_id: AtomicU32,
}

impl Default for ConnectionRegistry {
    fn default() -> ConnectionRegistry {
        ConnectionRegistry {
            connections: RwLock::new(FxHashMap::default()),
            unauthenticated: RwLock::new(FxHashMap::default()),
            next_connection_id: AtomicU32::new(0),
        }
    }
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        ConnectionRegistry::default()
    }

    /// Returns None for unknown ids *and* for connections observed to be
    ///  closing, so no caller can act on a connection past its lifecycle.
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let connection = self.connections.read().get(&id).cloned()?;
        if connection.is_closing() {
            None
        } else {
            Some(connection)
        }
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    pub(crate) fn register(&self, connection: Arc<Connection>, track_unauthenticated: bool) {
        self.connections
            .write()
            .insert(connection.id(), connection.clone());
        if track_unauthenticated {
            self.unauthenticated
                .write()
                .insert(connection.id(), connection);
        }
    }

    pub(crate) fn deregister(&self, id: ConnectionId) {
        self.connections.write().remove(&id);
        self.unauthenticated.write().remove(&id);
    }

    pub(crate) fn mark_authenticated(&self, id: ConnectionId) {
        self.unauthenticated.write().remove(&id);
    }

    pub fn is_tracked_unauthenticated(&self, id: ConnectionId) -> bool {
        self.unauthenticated.read().contains_key(&id)
    }

    /// Snapshot for the auth-timeout sweeper.
    pub fn unauthenticated_connections(&self) -> Vec<Arc<Connection>> {
        self.unauthenticated.read().values().cloned().collect()
    }

    /// Allocate an id that no live connection holds.
    ///
    /// Development mode hands out a monotonic counter and never reuses ids;
    ///  exhausting the id space is unrecoverable and aborts the process.
    ///  Production mode hashes the remote address with a nanosecond timestamp
    ///  so ids are not guessable; on collision it retries with a fresh
    ///  timestamp, and 100 failed attempts abort the process.
    pub fn allocate_id(&self, remote_addr: &str, settings: &Settings) -> ConnectionId {
        let max_id = settings.max_connection_id();

        for tries in 0..=100 {
            let candidate = if settings.development {
                let next = self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
                if next >= max_id {
                    panic!("connection id space exhausted (max id {})", max_id);
                }
                next
            } else {
                let mut hasher = FxHasher::default();
                remote_addr.hash(&mut hasher);
                let hash = hasher.finish() as u32;
                let nanos = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos() as u32)
                    .unwrap_or(0);
                (hash ^ nanos) & max_id
            };

            let candidate = ConnectionId(candidate);
            if candidate.0 != 0 && !self.connections.read().contains_key(&candidate) {
                return candidate;
            }

            warn!(conn_id = candidate.0, tries, "connection id collision, retrying");
        }

        panic!("could not allocate a collision-free connection id after 100 attempts");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::stub_connection;
    use crate::messages::ConnectionType;
    use rstest::rstest;

    fn dev_settings(bits: u8) -> Settings {
        Settings {
            development: true,
            max_connection_id_bits: bits,
            ..Settings::default()
        }
    }

    #[test]
    fn test_register_get_deregister() {
        let registry = ConnectionRegistry::new();
        let connection = stub_connection(ConnectionId(7), ConnectionType::Client);

        registry.register(connection.clone(), true);
        assert_eq!(registry.len(), 1);
        assert!(registry.is_tracked_unauthenticated(ConnectionId(7)));
        assert!(registry.get(ConnectionId(7)).is_some());
        assert!(registry.get(ConnectionId(8)).is_none());

        registry.deregister(ConnectionId(7));
        assert!(registry.get(ConnectionId(7)).is_none());
        assert!(!registry.is_tracked_unauthenticated(ConnectionId(7)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_get_hides_closing_connections() {
        let registry = ConnectionRegistry::new();
        let connection = stub_connection(ConnectionId(9), ConnectionType::Server);
        registry.register(connection.clone(), false);

        connection.begin_closing_for_test();
        assert!(registry.get(ConnectionId(9)).is_none());
    }

    #[test]
    fn test_mark_authenticated_removes_from_subset_only() {
        let registry = ConnectionRegistry::new();
        let connection = stub_connection(ConnectionId(3), ConnectionType::Client);
        registry.register(connection, true);

        registry.mark_authenticated(ConnectionId(3));
        assert!(!registry.is_tracked_unauthenticated(ConnectionId(3)));
        assert!(registry.get(ConnectionId(3)).is_some());
    }

    #[test]
    fn test_dev_mode_ids_are_sequential() {
        let registry = ConnectionRegistry::new();
        let settings = dev_settings(16);
        assert_eq!(registry.allocate_id("1.2.3.4:5", &settings), ConnectionId(1));
        assert_eq!(registry.allocate_id("1.2.3.4:5", &settings), ConnectionId(2));
        assert_eq!(registry.allocate_id("9.9.9.9:1", &settings), ConnectionId(3));
    }

    #[test]
    #[should_panic(expected = "id space exhausted")]
    fn test_dev_mode_exhaustion_is_fatal() {
        let registry = ConnectionRegistry::new();
        let settings = dev_settings(2); // ids 1..=3
        assert_eq!(registry.allocate_id("a", &settings), ConnectionId(1));
        assert_eq!(registry.allocate_id("a", &settings), ConnectionId(2));
        registry.allocate_id("a", &settings);
    }

    #[test]
    fn test_prod_mode_avoids_registered_ids() {
        let registry = ConnectionRegistry::new();
        let settings = Settings {
            development: false,
            max_connection_id_bits: 32,
            ..Settings::default()
        };

        let id = registry.allocate_id("10.0.0.1:4000", &settings);
        assert_ne!(id.0, 0);
        registry.register(stub_connection(id, ConnectionType::Client), false);

        let second = registry.allocate_id("10.0.0.1:4000", &settings);
        assert_ne!(second, id);
        assert_ne!(second.0, 0);
    }

    #[rstest]
    #[case::one_bit(1)]
    fn test_prod_mode_collision_exhaustion_is_fatal(#[case] bits: u8) {
        // with a 1-bit id space the only legal id is 1; once it is taken
        //  every candidate collides (0 is never handed out)
        let registry = ConnectionRegistry::new();
        let settings = Settings {
            development: false,
            max_connection_id_bits: bits,
            ..Settings::default()
        };
        registry.register(stub_connection(ConnectionId(1), ConnectionType::Client), false);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            registry.allocate_id("10.0.0.1:4000", &settings)
        }));
        assert!(result.is_err());
    }
}
