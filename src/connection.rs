use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use num_enum::IntoPrimitive;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};

use crate::assembler::{PacketAssembler, ScanReport};
use crate::compression::CompressionType;
use crate::dispatch::Dispatcher;
use crate::events::{ConnectionEvent, ConnectionEventNotifier};
use crate::fsm::ConnectionFsm;
use crate::messages::{ChannelId, ConnectionType, MessagePack, Packet, WireMessage};
use crate::metrics::Metrics;
use crate::packet_header::frame_packet;
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::replay::ReplayRecorder;
use crate::settings::Settings;
use crate::transport::{PeerReader, PeerWriter};

pub const SEND_QUEUE_DEPTH: usize = 128;

const FLUSH_INTERVAL: Duration = Duration::from_millis(1);

/// A flush stops draining the send queue once the serialized packet would
///  exceed this, so the payload length stays representable in the header's
///  3-byte length field.
const MAX_FLUSH_PACKET_SIZE: usize = 0x00ff_fff0;

/// Lifecycle state, distinct from the user-defined FSM: this one is owned by
///  the core and only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(i32)]
pub enum ConnectionState {
    Unauthenticated = 0,
    Authenticated = 1,
    Closing = 2,
}

/// One outbound message with its routing metadata, queued until the next
///  flush folds it into a packet.
#[derive(Debug)]
pub struct MessageContext {
    pub channel_id: ChannelId,
    pub broadcast: i32,
    pub stub_id: u32,
    pub msg_type: u32,
    pub msg: Box<dyn WireMessage>,
}

/// Seam between [Connection::send] and the outbound path, so tests can swap
///  the queue for a synchronous collector.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageSender: Send + Sync + 'static {
    async fn send(&self, connection: &Connection, ctx: MessageContext);
}

/// The default sender: enqueue for the flush worker. A full queue suspends
///  the producer until a flush makes room.
pub struct QueuedMessageSender;

#[async_trait]
impl MessageSender for QueuedMessageSender {
    async fn send(&self, connection: &Connection, ctx: MessageContext) {
        // a send racing the close may find the flush worker gone and the
        //  queue closed; such messages are silently discarded
        let _ = connection.send_queue.send(ctx).await;
    }
}

/// The process-wide collaborators every connection needs. Bundled so
///  acceptance loops and constructors pass one handle instead of five.
pub struct ConnectionRuntime {
    pub settings: Arc<Settings>,
    pub registry: Arc<ConnectionRegistry>,
    pub metrics: Arc<Metrics>,
    pub dispatcher: Arc<Dispatcher>,
    pub events: Arc<ConnectionEventNotifier>,
}

/// A live peer connection. Owned state follows a strict discipline: the read
///  buffer and assembler live in the receive worker, the queue receiver and
///  socket write half live in the flush worker, and everything on this struct
///  is either atomic, lock-protected, or written once at creation.
pub struct Connection {
    id: ConnectionId,
    connection_type: ConnectionType,
    state: AtomicI32,
    close_started: AtomicBool,
    compression: AtomicU8,
    remote_addr: SocketAddr,
    connected_at: Instant,
    pit: Mutex<String>,
    fsm: Mutex<ConnectionFsm>,
    fsm_disallowed_count: AtomicU64,
    sender: Arc<dyn MessageSender>,
    send_queue: mpsc::Sender<MessageContext>,
    close_handlers: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
    replay: Mutex<Option<ReplayRecorder>>,
    spatial_subscriptions: RwLock<FxHashMap<ChannelId, Bytes>>,
    shutdown: watch::Sender<bool>,
    runtime: Arc<ConnectionRuntime>,
}

impl Connection {
    /// Register a freshly accepted peer and start its two workers. The
    ///  connection is live (and reachable through the registry) when this
    ///  returns.
    pub fn attach(
        runtime: &Arc<ConnectionRuntime>,
        connection_type: ConnectionType,
        fsm: ConnectionFsm,
        reader: Box<dyn PeerReader>,
        writer: Box<dyn PeerWriter>,
        remote_addr: SocketAddr,
    ) -> Arc<Connection> {
        Self::attach_with_sender(
            runtime,
            connection_type,
            fsm,
            reader,
            writer,
            remote_addr,
            Arc::new(QueuedMessageSender),
        )
    }

    pub fn attach_with_sender(
        runtime: &Arc<ConnectionRuntime>,
        connection_type: ConnectionType,
        fsm: ConnectionFsm,
        reader: Box<dyn PeerReader>,
        writer: Box<dyn PeerWriter>,
        remote_addr: SocketAddr,
        sender: Arc<dyn MessageSender>,
    ) -> Arc<Connection> {
        let settings = &runtime.settings;
        let read_buffer_size = match connection_type {
            ConnectionType::Server => settings.server_read_buffer_size,
            ConnectionType::Client => settings.client_read_buffer_size,
        };

        let id = runtime
            .registry
            .allocate_id(&remote_addr.to_string(), settings);

        let (send_queue, queue_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let (shutdown, _) = watch::channel(false);

        let replay = if connection_type == ConnectionType::Client && settings.enable_record_packet
        {
            Some(ReplayRecorder::new())
        } else {
            None
        };

        let connection = Arc::new(Connection {
            id,
            connection_type,
            state: AtomicI32::new(ConnectionState::Unauthenticated.into()),
            close_started: AtomicBool::new(false),
            compression: AtomicU8::new(CompressionType::None.into()),
            remote_addr,
            connected_at: Instant::now(),
            pit: Mutex::new(String::new()),
            fsm: Mutex::new(fsm),
            fsm_disallowed_count: AtomicU64::new(0),
            sender,
            send_queue,
            close_handlers: Mutex::new(Vec::new()),
            replay: Mutex::new(replay),
            spatial_subscriptions: RwLock::new(FxHashMap::default()),
            shutdown,
            runtime: runtime.clone(),
        });

        runtime
            .registry
            .register(connection.clone(), settings.connection_auth_timeout_ms > 0);
        runtime.metrics.connection_opened(connection_type);

        let conn_span = span!(
            Level::INFO,
            "connection",
            conn_id = id.0,
            conn_type = connection_type.as_str()
        );

        let receive = connection.clone();
        let assembler = PacketAssembler::new(read_buffer_size);
        tokio::spawn(
            async move { receive.receive_loop(reader, assembler).await }
                .instrument(conn_span.clone()),
        );

        let flush = connection.clone();
        tokio::spawn(
            async move { flush.flush_loop(writer, queue_rx).await }.instrument(conn_span),
        );

        connection
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    pub fn is_closing(&self) -> bool {
        self.state.load(Ordering::SeqCst) > ConnectionState::Authenticated as i32
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        if self.is_closing() {
            None
        } else {
            Some(self.remote_addr)
        }
    }

    /// Time since the peer was accepted; the auth-timeout sweeper closes
    ///  unauthenticated connections past the deadline based on this.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// The peer identity token assigned at authentication; empty before.
    pub fn pit(&self) -> String {
        self.pit.lock().clone()
    }

    pub fn add_close_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.close_handlers.lock().push(Box::new(handler));
    }

    /// No-op once the connection is closing.
    pub async fn send(&self, ctx: MessageContext) {
        if self.is_closing() {
            return;
        }
        let sender = self.sender.clone();
        sender.send(self, ctx).await;
    }

    /// Idempotent teardown, safe to call concurrently with the workers: the
    ///  closing state stops dispatch and sends, the shutdown signal unblocks
    ///  the receive worker's read, and the flush worker exits on its next
    ///  tick, dropping the queue receiver.
    pub fn close(&self) {
        if self.close_started.swap(true, Ordering::SeqCst) {
            debug!("connection is already closing");
            return;
        }

        if let Some(recorder) = self.replay.lock().take() {
            match recorder.persist(&self.runtime.settings.replay_session_persistence_dir, self.id)
            {
                Ok(path) => debug!(path = %path.display(), "persisted replay session"),
                Err(e) => error!("failed to persist replay session: {:#}", e),
            }
        }

        let handlers = std::mem::take(&mut *self.close_handlers.lock());
        for handler in handlers {
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler())).is_err() {
                error!("close handler panicked");
            }
        }

        self.state
            .store(ConnectionState::Closing.into(), Ordering::SeqCst);
        let _ = self.shutdown.send(true);

        self.runtime.registry.deregister(self.id);
        self.runtime.metrics.connection_closed(self.connection_type);

        info!("closed connection");
    }

    pub fn on_authenticated(&self, pit: &str) {
        if self.is_closing() {
            return;
        }

        self.state
            .store(ConnectionState::Authenticated.into(), Ordering::SeqCst);
        self.runtime.registry.mark_authenticated(self.id);
        *self.pit.lock() = pit.to_owned();

        if !self.fsm.lock().move_to_next_state() {
            error!("no state found after the authenticated state");
        }

        let events = self.runtime.events.clone();
        let conn_id = self.id;
        tokio::spawn(async move {
            events
                .broadcast(ConnectionEvent::Authenticated { conn_id })
                .await;
        });
    }

    pub fn set_spatial_subscription(&self, channel_id: ChannelId, options: Bytes) {
        self.spatial_subscriptions
            .write()
            .insert(channel_id, options);
    }

    pub fn spatial_subscription(&self, channel_id: ChannelId) -> Option<Bytes> {
        self.spatial_subscriptions.read().get(&channel_id).cloned()
    }

    pub fn remove_spatial_subscription(&self, channel_id: ChannelId) -> Option<Bytes> {
        self.spatial_subscriptions.write().remove(&channel_id)
    }

    pub fn spatial_subscriptions(&self) -> FxHashMap<ChannelId, Bytes> {
        self.spatial_subscriptions.read().clone()
    }

    pub fn fsm_state_name(&self) -> String {
        self.fsm.lock().current_state_name().to_owned()
    }

    pub fn fsm_disallowed_count(&self) -> u64 {
        self.fsm_disallowed_count.load(Ordering::Relaxed)
    }

    pub(crate) fn fsm_is_allowed(&self, msg_type: u32) -> bool {
        self.fsm.lock().is_allowed(msg_type)
    }

    pub(crate) fn fsm_on_received(&self, msg_type: u32) {
        self.fsm.lock().on_received(msg_type);
    }

    pub(crate) fn inc_fsm_disallowed(&self) -> u64 {
        self.fsm_disallowed_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn outbound_compression(&self) -> CompressionType {
        CompressionType::try_from(self.compression.load(Ordering::Relaxed))
            .unwrap_or(CompressionType::None)
    }

    async fn receive_loop(self: Arc<Self>, mut reader: Box<dyn PeerReader>, mut assembler: PacketAssembler) {
        let mut shutdown = self.shutdown.subscribe();

        while !self.is_closing() {
            tokio::select! {
                _ = shutdown.changed() => break,
                result = reader.read_into(assembler.writable()) => match result {
                    Ok(0) => {
                        info!(remote_addr = %self.remote_addr, "disconnected");
                        self.close();
                        break;
                    }
                    Err(e) => {
                        warn!(remote_addr = %self.remote_addr, "read error: {:#}", e);
                        self.close();
                        break;
                    }
                    Ok(n) => {
                        assembler.advance(n);
                        let report = assembler.scan();
                        self.process_scan(report).await;
                    }
                },
            }
        }
    }

    async fn process_scan(&self, report: ScanReport) {
        let t = self.connection_type;
        let metrics = &self.runtime.metrics;
        metrics.add_bytes_received(t, report.bytes_consumed);
        metrics.add_packet_received(t, report.packets.len() as u64);
        metrics.add_packet_dropped(t, report.dropped);
        metrics.add_fragmented_packet(t, report.fragmented);
        metrics.add_combined_packet(t, report.combined);

        if let Some(compression) = report.observed_compression {
            self.compression.store(compression.into(), Ordering::Relaxed);
        }

        for packet in report.packets {
            if let Some(recorder) = self.replay.lock().as_mut() {
                recorder.record(&packet);
            }

            for pack in packet.messages {
                self.runtime.dispatcher.dispatch(self, pack).await;
            }
        }
    }

    async fn flush_loop(
        self: Arc<Self>,
        mut writer: Box<dyn PeerWriter>,
        mut queue_rx: mpsc::Receiver<MessageContext>,
    ) {
        let mut carry = None;
        while !self.is_closing() {
            self.flush(writer.as_mut(), &mut queue_rx, &mut carry).await;
            tokio::time::sleep(FLUSH_INTERVAL).await;
        }
    }

    /// Drain everything currently queued into one packet and write it in a
    ///  single transport write (WebSocket message boundaries depend on this).
    async fn flush(
        &self,
        writer: &mut dyn PeerWriter,
        queue_rx: &mut mpsc::Receiver<MessageContext>,
        carry: &mut Option<MessageContext>,
    ) {
        let mut packet = Packet {
            messages: Vec::new(),
        };
        let mut size = 0usize;

        loop {
            let ctx = match carry.take() {
                Some(ctx) => ctx,
                None => match queue_rx.try_recv() {
                    Ok(ctx) => ctx,
                    Err(_) => break,
                },
            };

            if size + ctx.msg.encoded_len() >= MAX_FLUSH_PACKET_SIZE {
                if packet.messages.is_empty() {
                    error!(
                        msg_type = ctx.msg_type,
                        size = ctx.msg.encoded_len(),
                        "message cannot fit into any packet, dropping"
                    );
                    continue;
                }
                warn!("packet is going to be oversized, deferring remaining messages");
                *carry = Some(ctx);
                break;
            }

            let msg_body = ctx.msg.encode_to_vec();
            trace!(msg_type = ctx.msg_type, size = msg_body.len(), "sent message");
            packet.messages.push(MessagePack {
                channel_id: ctx.channel_id,
                broadcast: ctx.broadcast,
                stub_id: ctx.stub_id,
                msg_type: ctx.msg_type,
                msg_body,
            });
            size = prost::Message::encoded_len(&packet);

            self.runtime.metrics.inc_msg_sent(self.connection_type);
        }

        if packet.messages.is_empty() {
            return;
        }

        let wire = frame_packet(&packet, self.outbound_compression());
        match writer.write_packet(&wire).await {
            Ok(()) => {
                self.runtime.metrics.inc_packet_sent(self.connection_type);
                self.runtime
                    .metrics
                    .add_bytes_sent(self.connection_type, wire.len() as u64);
            }
            Err(e) => {
                // the connection survives; the receive side notices an
                //  actually dead peer and closes
                error!("error writing packet: {:#}", e);
            }
        }
    }
}

impl Display for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Connection({} {} {})",
            self.connection_type.as_str(),
            self.id,
            self.fsm.lock().current_state_name()
        )
    }
}
