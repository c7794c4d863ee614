use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use prost::Message;
use rustc_hash::FxHashMap;
use tracing::{error, trace, warn};

use crate::connection::Connection;
use crate::events::{ConnectionEvent, ConnectionEventNotifier};
use crate::messages::{
    ChannelId, ConnectionType, MessagePack, ServerForwardMessage, WireMessage, USER_SPACE_START,
};
use crate::metrics::Metrics;
use crate::registry::ConnectionId;

/// Handler for one message type. The connection core never runs handlers; it
///  pairs them with decoded messages and hands both to the destination
///  channel's queue, whose workers invoke them.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, msg: &dyn WireMessage, source: ConnectionId, pack: &MessagePack);
}

/// A decoded message on its way into a channel queue.
pub struct IncomingMessage {
    pub msg: Box<dyn WireMessage>,
    pub handler: Arc<dyn MessageHandler>,
    pub source: ConnectionId,
    pub pack: MessagePack,
}

/// The channel subsystem as the connection core sees it: a per-channel queue
///  that takes ownership of incoming messages. Delivery ordering and handler
///  concurrency are the channel's business.
#[cfg_attr(test, automock)]
pub trait ChannelQueue: Send + Sync + 'static {
    fn put_message(&self, incoming: IncomingMessage);
}

#[cfg_attr(test, automock)]
pub trait ChannelLookup: Send + Sync + 'static {
    fn channel_queue(&self, id: ChannelId) -> Option<Arc<dyn ChannelQueue>>;
}

type DecodeFn = fn(&[u8]) -> Result<Box<dyn WireMessage>, prost::DecodeError>;

struct MessageEntry {
    decode: DecodeFn,
    handler: Arc<dyn MessageHandler>,
}

/// Registration table mapping reserved and user message types to their
///  decoder and handler. Built once at startup, frozen while serving.
#[derive(Default)]
pub struct MessageTable {
    entries: FxHashMap<u32, MessageEntry>,
}

impl MessageTable {
    pub fn new() -> MessageTable {
        MessageTable::default()
    }

    pub fn register<M>(&mut self, msg_type: u32, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()>
    where
        M: Message + Default + 'static,
    {
        let entry = MessageEntry {
            decode: |buf| M::decode(buf).map(|msg| Box::new(msg) as Box<dyn WireMessage>),
            handler,
        };
        if self.entries.insert(msg_type, entry).is_some() {
            return Err(anyhow!(
                "registering a second handler for message type {}",
                msg_type
            ));
        }
        Ok(())
    }

    fn get(&self, msg_type: u32) -> Option<&MessageEntry> {
        self.entries.get(&msg_type)
    }
}

/// Receive-path routing: decode the envelope's body, gate it through the
///  connection's state machine, hand it to the destination channel's queue.
///  One instance serves every connection.
pub struct Dispatcher {
    channels: Arc<dyn ChannelLookup>,
    table: MessageTable,
    events: Arc<ConnectionEventNotifier>,
    metrics: Arc<Metrics>,
    /// Route for user-space messages arriving from clients, wrapped into a
    ///  [ServerForwardMessage] without deserialization.
    client_user_handler: Arc<dyn MessageHandler>,
    /// Route for user-space messages arriving from servers, which carry a
    ///  ready-made [ServerForwardMessage].
    server_user_handler: Arc<dyn MessageHandler>,
}

impl Dispatcher {
    pub fn new(
        channels: Arc<dyn ChannelLookup>,
        table: MessageTable,
        events: Arc<ConnectionEventNotifier>,
        metrics: Arc<Metrics>,
        client_user_handler: Arc<dyn MessageHandler>,
        server_user_handler: Arc<dyn MessageHandler>,
    ) -> Dispatcher {
        Dispatcher {
            channels,
            table,
            events,
            metrics,
            client_user_handler,
            server_user_handler,
        }
    }

    /// Route one inbound envelope. Every failure path drops only this
    ///  message; sibling messages of the same packet are unaffected.
    pub async fn dispatch(&self, connection: &Connection, pack: MessagePack) {
        let channel = match self.channels.channel_queue(pack.channel_id) {
            Some(channel) => channel,
            None => {
                warn!(
                    channel_id = pack.channel_id,
                    msg_type = pack.msg_type,
                    "can't find channel"
                );
                return;
            }
        };

        let entry = self.table.get(pack.msg_type);
        if entry.is_none() && pack.msg_type < USER_SPACE_START {
            error!(msg_type = pack.msg_type, "undefined message type");
            return;
        }

        if !connection.fsm_is_allowed(pack.msg_type) {
            connection.inc_fsm_disallowed();
            self.metrics.inc_fsm_disallowed(connection.connection_type());
            self.events
                .broadcast(ConnectionEvent::MessageDisallowed {
                    conn_id: connection.id(),
                    conn_type: connection.connection_type(),
                    msg_type: pack.msg_type,
                    state_name: connection.fsm_state_name(),
                })
                .await;
            warn!(
                msg_type = pack.msg_type,
                conn_state = %connection.fsm_state_name(),
                "message is not allowed for current state"
            );
            return;
        }

        let (msg, handler): (Box<dyn WireMessage>, Arc<dyn MessageHandler>) = match entry {
            None => {
                // user-space message without a registered handler
                if connection.connection_type() == ConnectionType::Client {
                    // client -> server: forwarded without deserialization
                    let forward = ServerForwardMessage {
                        client_conn_id: connection.id().0,
                        payload: pack.msg_body.clone(),
                    };
                    (Box::new(forward), self.client_user_handler.clone())
                } else {
                    // server -> client/server: the body is itself a forward message
                    match ServerForwardMessage::decode(&pack.msg_body[..]) {
                        Ok(forward) => (Box::new(forward), self.server_user_handler.clone()),
                        Err(e) => {
                            error!("unmarshalling server forward message: {}", e);
                            return;
                        }
                    }
                }
            }
            Some(entry) => match (entry.decode)(&pack.msg_body) {
                Ok(msg) => (msg, entry.handler.clone()),
                Err(e) => {
                    error!(msg_type = pack.msg_type, "unmarshalling message: {}", e);
                    return;
                }
            },
        };

        connection.fsm_on_received(pack.msg_type);

        trace!(
            msg_type = pack.msg_type,
            size = pack.msg_body.len(),
            "received message"
        );
        self.metrics.inc_msg_received(connection.connection_type());

        channel.put_message(IncomingMessage {
            msg,
            handler,
            source: connection.id(),
            pack,
        });
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;

    pub struct NoopHandler;

    #[async_trait]
    impl MessageHandler for NoopHandler {
        async fn handle(&self, _msg: &dyn WireMessage, _source: ConnectionId, _pack: &MessagePack) {}
    }

    /// Channel queue that collects everything it is handed, for assertions.
    #[derive(Default)]
    pub struct CollectingQueue {
        items: Mutex<Vec<IncomingMessage>>,
    }

    impl CollectingQueue {
        pub fn len(&self) -> usize {
            self.items.lock().len()
        }

        pub fn take(&self) -> Vec<IncomingMessage> {
            std::mem::take(&mut self.items.lock())
        }
    }

    impl ChannelQueue for Arc<CollectingQueue> {
        fn put_message(&self, incoming: IncomingMessage) {
            self.items.lock().push(incoming);
        }
    }

    /// A lookup that resolves every channel id to the same collecting queue.
    pub struct SingleChannelLookup(pub Arc<CollectingQueue>);

    impl ChannelLookup for SingleChannelLookup {
        fn channel_queue(&self, _id: ChannelId) -> Option<Arc<dyn ChannelQueue>> {
            Some(Arc::new(self.0.clone()))
        }
    }

    struct NoChannels;

    impl ChannelLookup for NoChannels {
        fn channel_queue(&self, _id: ChannelId) -> Option<Arc<dyn ChannelQueue>> {
            None
        }
    }

    pub fn dispatcher_with(
        channels: Arc<dyn ChannelLookup>,
        table: MessageTable,
        events: Arc<ConnectionEventNotifier>,
        metrics: Arc<Metrics>,
    ) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            channels,
            table,
            events,
            metrics,
            Arc::new(NoopHandler),
            Arc::new(NoopHandler),
        ))
    }

    pub fn null_dispatcher() -> Arc<Dispatcher> {
        dispatcher_with(
            Arc::new(NoChannels),
            MessageTable::new(),
            Arc::new(ConnectionEventNotifier::new()),
            Arc::new(Metrics::new()),
        )
    }
}
