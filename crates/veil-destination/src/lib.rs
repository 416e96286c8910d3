//! Veil client destination.
//!
//! One local identity on the overlay: keeps its lease set in step with
//! its tunnel pool, publishes it to directory (floodfill) nodes with
//! confirmation and retry, resolves remote lease sets through iterative
//! directory lookups, and demultiplexes inbound data to streaming and
//! datagram handlers by protocol and port.
//!
//! Wire format: MessagePack (compact binary).
//! Crypto: Ed25519 signatures + X25519/XChaCha20-Poly1305 garlic bundles.

pub mod config;
pub mod datagram;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod garlic;
pub mod identity;
pub mod lease_set;
pub mod lookup;
pub mod message;
pub mod publish;
pub mod repository;
pub mod runtime;
pub mod stats;
pub mod streaming;
pub mod timer;
pub mod tunnel;
pub mod types;

pub use config::DestinationConfig;
pub use datagram::{Datagram, DatagramDestination};
pub use directory::{MemoryNetDb, NetDb};
pub use dispatcher::{DispatchResult, ProtocolHandler, ProtocolHandlerTable};
pub use error::DestinationError;
pub use garlic::{seal_ephemeral, seal_with_session, GarlicLayer, SessionGarlic, SessionTag};
pub use identity::{EncryptionKeys, PrivateKeys, PublicIdentity};
pub use lease_set::{Lease, LeaseSet, MAX_NUM_LEASES};
pub use message::{
    DataMessage, DatabaseLookup, DatabaseSearchReply, DatabaseStore, DeliveryStatus, NetMessage,
    OutboundData, OutboundMessage, ReplyPath,
};
pub use runtime::{
    ChannelTransport, Destination, DestinationChannels, DestinationCommand, DestinationEvent,
    DestinationHandle, Transport,
};
pub use stats::DestinationStats;
pub use streaming::{Stream, StreamingDestination};
pub use tunnel::{InboundTunnel, OutboundTunnel, StaticTunnelPool, TunnelPool, TunnelPoolConfig};
pub use types::{
    now_ms, IdentHash, TunnelId, PROTOCOL_TYPE_DATAGRAM, PROTOCOL_TYPE_RAW,
    PROTOCOL_TYPE_STREAMING,
};
