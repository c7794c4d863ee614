use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_kcp::{KcpConfig, KcpListener};
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, ConnectionRuntime};
use crate::dispatch::{ChannelLookup, Dispatcher, MessageHandler, MessageTable};
use crate::events::ConnectionEventNotifier;
use crate::fsm::FsmTemplate;
use crate::messages::ConnectionType;
use crate::metrics::Metrics;
use crate::registry::ConnectionRegistry;
use crate::settings::Settings;
use crate::transport::{ws, StreamReader, StreamWriter};

/// The place where everything comes together: the configuration snapshot,
///  the registries, the two FSM templates, the dispatcher and the IP
///  blacklist, passed explicitly to acceptance loops and connection
///  constructors instead of living in process globals.
pub struct ServerContext {
    settings: Arc<Settings>,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<Metrics>,
    events: Arc<ConnectionEventNotifier>,
    server_fsm: Arc<FsmTemplate>,
    client_fsm: Arc<FsmTemplate>,
    ip_blacklist: RwLock<FxHashSet<IpAddr>>,
    runtime: Arc<ConnectionRuntime>,
}

impl ServerContext {
    /// Loads the two FSM templates; a missing or invalid description is a
    ///  startup failure the embedding process must treat as fatal.
    pub fn new(
        settings: Settings,
        channels: Arc<dyn ChannelLookup>,
        table: MessageTable,
        client_user_handler: Arc<dyn MessageHandler>,
        server_user_handler: Arc<dyn MessageHandler>,
    ) -> anyhow::Result<Arc<ServerContext>> {
        settings.validate()?;

        let server_fsm = FsmTemplate::load_file(&settings.server_fsm_path)?;
        info!(
            path = %settings.server_fsm_path,
            initial_state = server_fsm.initial_state_name(),
            "loaded server FSM"
        );
        let client_fsm = FsmTemplate::load_file(&settings.client_fsm_path)?;
        info!(
            path = %settings.client_fsm_path,
            initial_state = client_fsm.initial_state_name(),
            "loaded client FSM"
        );

        let settings = Arc::new(settings);
        let registry = Arc::new(ConnectionRegistry::new());
        let metrics = Arc::new(Metrics::new());
        let events = Arc::new(ConnectionEventNotifier::new());
        let dispatcher = Arc::new(Dispatcher::new(
            channels,
            table,
            events.clone(),
            metrics.clone(),
            client_user_handler,
            server_user_handler,
        ));
        let runtime = Arc::new(ConnectionRuntime {
            settings: settings.clone(),
            registry: registry.clone(),
            metrics: metrics.clone(),
            dispatcher,
            events: events.clone(),
        });

        Ok(Arc::new(ServerContext {
            settings,
            registry,
            metrics,
            events,
            server_fsm,
            client_fsm,
            ip_blacklist: RwLock::new(FxHashSet::default()),
            runtime,
        }))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn events(&self) -> &Arc<ConnectionEventNotifier> {
        &self.events
    }

    pub fn ban_ip(&self, ip: IpAddr) {
        self.ip_blacklist.write().insert(ip);
    }

    pub fn unban_ip(&self, ip: IpAddr) {
        self.ip_blacklist.write().remove(&ip);
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.ip_blacklist.read().contains(&ip)
    }

    /// Wire an accepted peer into the core: pick the role template, register
    ///  the connection and start its workers.
    pub fn add_connection(
        &self,
        connection_type: ConnectionType,
        reader: Box<dyn crate::transport::PeerReader>,
        writer: Box<dyn crate::transport::PeerWriter>,
        remote_addr: SocketAddr,
    ) -> Arc<Connection> {
        let template = match connection_type {
            ConnectionType::Server => &self.server_fsm,
            ConnectionType::Client => &self.client_fsm,
        };
        let connection = Connection::attach(
            &self.runtime,
            connection_type,
            template.instantiate(),
            reader,
            writer,
            remote_addr,
        );
        debug!(conn = %connection, "accepted connection");
        connection
    }

    fn admit(&self, peer_addr: SocketAddr) -> bool {
        if self.is_banned(peer_addr.ip()) {
            info!(
                target: "security",
                ip = %peer_addr.ip(),
                "refused connection of banned IP address"
            );
            false
        } else {
            true
        }
    }

    /// Bind a listener and run its acceptance loop on a background task.
    ///  Address syntax follows the transport's convention; supported
    ///  networks are `tcp` (plus `tcp4`/`tcp6`), `kcp` and `ws`/`websocket`.
    pub async fn start_listening(
        self: &Arc<Self>,
        connection_type: ConnectionType,
        network: &str,
        address: &str,
    ) -> anyhow::Result<ListenerHandle> {
        info!(
            conn_type = connection_type.as_str(),
            network, address, "start listening"
        );

        match network {
            "ws" | "websocket" => self.listen_ws(connection_type, address).await,
            "kcp" => self.listen_kcp(connection_type, address).await,
            "tcp" | "tcp4" | "tcp6" => self.listen_tcp(connection_type, address).await,
            _ => bail!("unsupported listener network {:?}", network),
        }
    }

    async fn listen_tcp(
        self: &Arc<Self>,
        connection_type: ConnectionType,
        address: &str,
    ) -> anyhow::Result<ListenerHandle> {
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("binding tcp listener on {}", address))?;
        let local_addr = listener.local_addr()?;

        let ctx = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Err(e) => error!("failed to accept connection: {}", e),
                    Ok((stream, peer_addr)) => {
                        if !ctx.admit(peer_addr) {
                            continue;
                        }
                        let (read_half, write_half) = stream.into_split();
                        ctx.add_connection(
                            connection_type,
                            Box::new(StreamReader(read_half)),
                            Box::new(StreamWriter(write_half)),
                            peer_addr,
                        );
                    }
                }
            }
        });

        Ok(ListenerHandle { local_addr, task })
    }

    async fn listen_kcp(
        self: &Arc<Self>,
        connection_type: ConnectionType,
        address: &str,
    ) -> anyhow::Result<ListenerHandle> {
        let local_addr: SocketAddr = address
            .parse()
            .with_context(|| format!("parsing kcp listener address {}", address))?;
        let mut listener = KcpListener::bind(KcpConfig::default(), local_addr)
            .await
            .with_context(|| format!("binding kcp listener on {}", address))?;

        let ctx = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Err(e) => error!("failed to accept connection: {}", e),
                    Ok((stream, peer_addr)) => {
                        if !ctx.admit(peer_addr) {
                            continue;
                        }
                        let (read_half, write_half) = tokio::io::split(stream);
                        ctx.add_connection(
                            connection_type,
                            Box::new(StreamReader(read_half)),
                            Box::new(StreamWriter(write_half)),
                            peer_addr,
                        );
                    }
                }
            }
        });

        Ok(ListenerHandle { local_addr, task })
    }

    async fn listen_ws(
        self: &Arc<Self>,
        connection_type: ConnectionType,
        address: &str,
    ) -> anyhow::Result<ListenerHandle> {
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("binding websocket listener on {}", address))?;
        let local_addr = listener.local_addr()?;

        let ctx = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Err(e) => error!("failed to accept connection: {}", e),
                    Ok((stream, peer_addr)) => {
                        if !ctx.admit(peer_addr) {
                            continue;
                        }
                        // the handshake must not stall the acceptance loop
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            match tokio_tungstenite::accept_async(stream).await {
                                Ok(ws_stream) => {
                                    let (reader, writer) = ws::split(ws_stream);
                                    ctx.add_connection(
                                        connection_type,
                                        Box::new(reader),
                                        Box::new(writer),
                                        peer_addr,
                                    );
                                }
                                Err(e) => {
                                    warn!(
                                        remote_addr = %peer_addr,
                                        "websocket handshake failed: {}", e
                                    );
                                }
                            }
                        });
                    }
                }
            }
        });

        Ok(ListenerHandle { local_addr, task })
    }

    /// Periodically closes connections that have not authenticated within
    ///  [Settings::connection_auth_timeout_ms]. Returns None when the
    ///  timeout is disabled.
    pub fn spawn_auth_timeout_sweeper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let timeout_ms = self.settings.connection_auth_timeout_ms;
        if timeout_ms == 0 {
            return None;
        }
        let timeout = Duration::from_millis(timeout_ms);
        let sweep_interval = (timeout / 2).max(Duration::from_millis(100));

        let ctx = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                for connection in ctx.registry.unauthenticated_connections() {
                    if connection.age() > timeout {
                        warn!(
                            conn_id = connection.id().0,
                            "closing connection that did not authenticate in time"
                        );
                        connection.close();
                    }
                }
            }
        }))
    }
}

/// A running acceptance loop. Dropping the handle leaves the loop running
///  (listeners normally live for the whole process); call
///  [ListenerHandle::shutdown] to stop accepting.
pub struct ListenerHandle {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionType;
    use crate::dispatch::test_support::{CollectingQueue, NoopHandler, SingleChannelLookup};
    use crate::messages::{AuthMessage, MessagePack, Packet, MSG_AUTH};
    use crate::packet_header::frame_packet;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    const CLIENT_FSM: &str = r#"{ "states": [
        { "name": "pre_auth", "allowed": [1], "onReceived": { "1": "handshaking" } },
        { "name": "handshaking", "allowed": [1] },
        { "name": "open", "allowed": [5, 6, 7, 8], "allowUserSpace": true }
    ] }"#;

    const SERVER_FSM: &str = r#"{ "states": [
        { "name": "pre_auth", "allowed": [1] },
        { "name": "open", "allowed": [1, 5, 6, 7, 8], "allowUserSpace": true }
    ] }"#;

    struct TestServer {
        context: Arc<ServerContext>,
        queue: Arc<CollectingQueue>,
        _dir: tempfile::TempDir,
    }

    fn test_server(settings_overrides: impl FnOnce(&mut Settings)) -> TestServer {
        let dir = tempfile::tempdir().unwrap();
        let server_fsm_path = dir.path().join("server_fsm.json");
        let client_fsm_path = dir.path().join("client_fsm.json");
        std::fs::write(&server_fsm_path, SERVER_FSM).unwrap();
        std::fs::write(&client_fsm_path, CLIENT_FSM).unwrap();

        let mut settings = Settings {
            server_fsm_path: server_fsm_path.to_str().unwrap().to_owned(),
            client_fsm_path: client_fsm_path.to_str().unwrap().to_owned(),
            ..Settings::default()
        };
        settings_overrides(&mut settings);

        let queue = Arc::new(CollectingQueue::default());
        let mut table = MessageTable::new();
        table
            .register::<AuthMessage>(MSG_AUTH, Arc::new(NoopHandler))
            .unwrap();

        let context = ServerContext::new(
            settings,
            Arc::new(SingleChannelLookup(queue.clone())),
            table,
            Arc::new(NoopHandler),
            Arc::new(NoopHandler),
        )
        .unwrap();

        TestServer {
            context,
            queue,
            _dir: dir,
        }
    }

    fn auth_packet() -> Packet {
        Packet {
            messages: vec![MessagePack {
                channel_id: 0,
                broadcast: 0,
                stub_id: 0,
                msg_type: MSG_AUTH,
                msg_body: prost::Message::encode_to_vec(&AuthMessage {
                    player_identifier_token: "abc".to_owned(),
                    login_token: "token".to_owned(),
                }),
            }],
        }
    }

    #[test]
    fn test_missing_fsm_file_is_fatal() {
        let settings = Settings {
            server_fsm_path: "/nonexistent/server_fsm.json".to_owned(),
            ..Settings::default()
        };
        let queue = Arc::new(CollectingQueue::default());
        let result = ServerContext::new(
            settings,
            Arc::new(SingleChannelLookup(queue)),
            MessageTable::new(),
            Arc::new(NoopHandler),
            Arc::new(NoopHandler),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unsupported_network_rejected() {
        let server = test_server(|_| {});
        assert!(server
            .context
            .start_listening(ConnectionType::Client, "udp", "127.0.0.1:0")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_tcp_client_auth_flow() {
        let server = test_server(|_| {});
        let listener = server
            .context
            .start_listening(ConnectionType::Client, "tcp", "127.0.0.1:0")
            .await
            .unwrap();

        let mut stream = TcpStream::connect(listener.local_addr()).await.unwrap();
        stream
            .write_all(&frame_packet(&auth_packet(), CompressionType::None))
            .await
            .unwrap();

        timeout(Duration::from_secs(2), async {
            while server.queue.len() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("auth message reaches the channel queue");

        assert_eq!(server.context.registry().len(), 1);
        let items = server.queue.take();
        let auth = items[0]
            .msg
            .as_any()
            .downcast_ref::<AuthMessage>()
            .unwrap();
        assert_eq!(auth.player_identifier_token, "abc");

        // the peer hanging up tears the connection down
        drop(stream);
        timeout(Duration::from_secs(2), async {
            while !server.context.registry().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connection deregistered after disconnect");

        listener.shutdown();
    }

    #[tokio::test]
    async fn test_banned_ip_is_refused() {
        let server = test_server(|_| {});
        server.context.ban_ip("127.0.0.1".parse().unwrap());

        let listener = server
            .context
            .start_listening(ConnectionType::Client, "tcp", "127.0.0.1:0")
            .await
            .unwrap();

        let mut stream = TcpStream::connect(listener.local_addr()).await.unwrap();
        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("server hangs up promptly")
            .unwrap();
        assert_eq!(n, 0);
        assert!(server.context.registry().is_empty());

        listener.shutdown();
    }

    #[tokio::test]
    async fn test_websocket_client_auth_flow() {
        use futures_util::SinkExt;
        use tokio_tungstenite::tungstenite::Message;

        let server = test_server(|_| {});
        let listener = server
            .context
            .start_listening(ConnectionType::Client, "ws", "127.0.0.1:0")
            .await
            .unwrap();

        let url = format!("ws://{}/", listener.local_addr());
        let (mut ws_stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let wire = frame_packet(&auth_packet(), CompressionType::None);
        ws_stream.send(Message::Binary(wire.to_vec())).await.unwrap();

        timeout(Duration::from_secs(2), async {
            while server.queue.len() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("auth message reaches the channel queue over websocket");

        listener.shutdown();
    }

    #[tokio::test]
    async fn test_auth_timeout_sweeper_closes_stale_connections() {
        let server = test_server(|settings| {
            settings.connection_auth_timeout_ms = 50;
        });
        let listener = server
            .context
            .start_listening(ConnectionType::Client, "tcp", "127.0.0.1:0")
            .await
            .unwrap();
        let sweeper = server.context.spawn_auth_timeout_sweeper().unwrap();

        let mut stream = TcpStream::connect(listener.local_addr()).await.unwrap();

        // never authenticates; the sweeper reaps it
        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(3), stream.read(&mut buf))
            .await
            .expect("sweeper closes the connection")
            .unwrap();
        assert_eq!(n, 0);
        assert!(server.context.registry().is_empty());

        sweeper.abort();
        listener.shutdown();
    }

    #[tokio::test]
    async fn test_sweeper_disabled_without_timeout() {
        let server = test_server(|settings| {
            settings.connection_auth_timeout_ms = 0;
        });
        assert!(server.context.spawn_auth_timeout_sweeper().is_none());
    }
}
