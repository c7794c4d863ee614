use std::any::Any;
use std::fmt::Debug;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Channels are logical pub/sub groups; connections refer to them by id only.
///  The channel subsystem itself lives outside this crate.
pub type ChannelId = u32;

/// The role of a peer, fixed by the listener it connected through. Selects
///  read buffer sizing, the FSM template, and recording eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ConnectionType {
    Server = 1,
    Client = 2,
}

impl ConnectionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionType::Server => "SERVER",
            ConnectionType::Client => "CLIENT",
        }
    }

    pub fn index(self) -> usize {
        match self {
            ConnectionType::Server => 0,
            ConnectionType::Client => 1,
        }
    }
}

/// Message types below this value are reserved for the router; everything at
///  or above it is application-defined and forwarded without deserialization.
pub const USER_SPACE_START: u32 = 100;

/// Reserved message types the router knows by number. The connection core
///  treats all of them uniformly through the message table; the constants
///  exist so FSM templates and handler registrations agree on the values.
pub const MSG_AUTH: u32 = 1;
pub const MSG_SUB_TO_CHANNEL: u32 = 5;
pub const MSG_UNSUB_FROM_CHANNEL: u32 = 6;
pub const MSG_CHANNEL_DATA_UPDATE: u32 = 7;
pub const MSG_DISCONNECT: u32 = 8;

/// One framed wire unit: zero or more message envelopes, serialized as the
///  (optionally compressed) packet payload.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Packet {
    #[prost(message, repeated, tag = "1")]
    pub messages: Vec<MessagePack>,
}

/// One logical message plus its routing metadata inside a packet.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MessagePack {
    #[prost(uint32, tag = "1")]
    pub channel_id: u32,
    #[prost(enumeration = "BroadcastType", tag = "2")]
    pub broadcast: i32,
    /// Correlation id for RPC-style exchanges; opaque to the router.
    #[prost(uint32, tag = "3")]
    pub stub_id: u32,
    #[prost(uint32, tag = "4")]
    pub msg_type: u32,
    #[prost(bytes = "vec", tag = "5")]
    pub msg_body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum BroadcastType {
    NoBroadcast = 0,
    All = 1,
    AllButSender = 2,
    SingleConnection = 3,
}

/// Carrier for user-space messages crossing the router: client payloads are
///  wrapped into one of these (tagged with the originating client id) on the
///  way to a server; servers send them ready-made on the way back.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ServerForwardMessage {
    #[prost(uint32, tag = "1")]
    pub client_conn_id: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AuthMessage {
    #[prost(string, tag = "1")]
    pub player_identifier_token: String,
    #[prost(string, tag = "2")]
    pub login_token: String,
}

/// Object-safe view of a typed protocol payload, so heterogeneous decoded
///  messages can travel through send queues and channel queues. Handlers get
///  their concrete type back via [WireMessage::as_any] downcasting.
pub trait WireMessage: Debug + Send + Sync + 'static {
    fn encode_to_vec(&self) -> Vec<u8>;
    fn encoded_len(&self) -> usize;
    fn as_any(&self) -> &dyn Any;
}

impl<M> WireMessage for M
where
    M: prost::Message + 'static,
{
    fn encode_to_vec(&self) -> Vec<u8> {
        prost::Message::encode_to_vec(self)
    }

    fn encoded_len(&self) -> usize {
        prost::Message::encoded_len(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
