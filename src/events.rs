use std::sync::Arc;

use anyhow::anyhow;
use rustc_hash::FxHashMap;
use tokio::spawn;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::messages::ConnectionType;
use crate::registry::ConnectionId;

/// Connection-level events that collaborators outside the core subscribe to,
///  e.g. abuse heuristics watching for sustained disallowed traffic.
#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    /// The connection's state machine rejected an inbound message type.
    MessageDisallowed {
        conn_id: ConnectionId,
        conn_type: ConnectionType,
        msg_type: u32,
        state_name: String,
    },
    /// The connection completed authentication.
    Authenticated { conn_id: ConnectionId },
}

#[async_trait::async_trait]
pub trait ConnectionEventListener: Sync + Send {
    async fn on_connection_event(&self, event: ConnectionEvent);
}

#[derive(Default)]
pub struct ConnectionEventNotifier {
    listeners: RwLock<FxHashMap<Uuid, Arc<dyn ConnectionEventListener>>>,
}

impl ConnectionEventNotifier {
    pub fn new() -> ConnectionEventNotifier {
        ConnectionEventNotifier::default()
    }

    /// Returns the key under which the listener is registered, for removal.
    pub async fn add_listener(&self, listener: Arc<dyn ConnectionEventListener>) -> Uuid {
        let id = Uuid::new_v4();
        self.listeners.write().await.insert(id, listener);
        id
    }

    pub async fn try_remove_listener(&self, listener_id: &Uuid) -> anyhow::Result<()> {
        match self.listeners.write().await.remove(listener_id) {
            None => Err(anyhow!(
                "tried to remove a listener that was not (no longer?) registered: {}",
                listener_id
            )),
            Some(_) => Ok(()),
        }
    }

    /// Each listener runs on its own task so a slow listener cannot stall the
    ///  receive path that fired the event.
    pub async fn broadcast(&self, event: ConnectionEvent) {
        let listeners = self
            .listeners
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for listener in listeners {
            let event = event.clone();
            spawn(async move { listener.on_connection_event(event).await });
        }
    }
}
