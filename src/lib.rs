//! Connection core of a channel-based realtime message router. It multiplexes
//!  typed messages between game clients and backend game servers over
//!  *channels* (logical pub/sub groups); this crate owns everything between
//!  the socket and the channel queues:
//!
//! * length-prefixed binary framing with fragmentation and coalescing
//! * optional per-packet Snappy compression, negotiated implicitly ("sticky"):
//!   whichever codec a peer last sent with is used for packets sent back to it
//! * a per-connection finite state machine that authorizes inbound message
//!   types, loaded from a declarative per-role template
//! * duplex concurrent I/O - a receive worker and a flush worker per
//!   connection, with a bounded send queue between producers and the flush
//! * connection identity allocation with collision avoidance
//! * an optional packet-recording side channel persisted at close
//!
//! Channel scheduling, handler implementations, credential verification and
//!  ban-list policy are external collaborators behind seams ([dispatch::ChannelLookup],
//!  [dispatch::ChannelQueue], [dispatch::MessageHandler], [connection::MessageSender]).
//!
//! ## Wire format
//!
//! Every transport-level unit is a *packet*: a 5-byte header followed by a
//!  payload. All header fields are single bytes:
//!
//! ```ascii
//! 0: 0x43 ('C')                   - magic
//! 1: bits 16-23 of the payload length, or 0x48 ('H') if the length <= 0xFFFF
//! 2: bits 8-15 of the payload length, or 0x4E ('N') if the length <= 0xFF
//! 3: bits 0-7 of the payload length
//! 4: compression type (0 = none, 1 = Snappy)
//! ```
//!
//! The placeholder bytes make an idle header read as the ASCII tag "CHN".
//!  Decoding mirrors the encoder exactly: byte 3 is always the low byte; if
//!  byte 1 is not 'H', bytes 1 and 2 are both length bytes; otherwise if
//!  byte 2 is not 'N', byte 2 is a length byte.
//!
//! The payload is a protobuf-encoded [messages::Packet] - a sequence of
//!  [messages::MessagePack] envelopes `{channel_id, broadcast, stub_id,
//!  msg_type, msg_body}` - optionally Snappy-compressed as a whole. The
//!  header is never compressed. Inbound payloads larger than 0xFFFF bytes
//!  are dropped; a flush stops draining the send queue when the serialized
//!  packet would exceed the 3-byte length field.
//!
//! Message types below [messages::USER_SPACE_START] are reserved for the
//!  router itself; everything at or above it is application-defined and
//!  forwarded opaquely.

pub mod assembler;
pub mod compression;
pub mod connection;
pub mod dispatch;
pub mod events;
pub mod fsm;
pub mod messages;
pub mod metrics;
pub mod packet_header;
pub mod registry;
pub mod replay;
pub mod server;
pub mod settings;
pub mod transport;
