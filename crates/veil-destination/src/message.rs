//! Router-level messages a destination sends and receives.
//!
//! Wire format: MessagePack. The enum tag is the leading type marker the
//! dispatcher classifies on. Application payloads travel inside
//! [`NetMessage::Data`] with a fixed trailer naming protocol and ports.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::DestinationError;
use crate::lease_set::LeaseSet;
use crate::types::{IdentHash, TunnelId};

/// Where a directory node should send its answer: an inbound tunnel of ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyPath {
    pub gateway: IdentHash,
    pub tunnel_id: TunnelId,
}

/// Store a lease set at a directory node (or a store reply from one).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseStore {
    pub key: IdentHash,
    pub lease_set: LeaseSet,
    /// Non-zero asks the receiver to confirm with a `DeliveryStatus`.
    pub reply_token: u32,
    pub reply: Option<ReplyPath>,
}

/// Ask a directory node for the lease set stored under `key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseLookup {
    pub key: IdentHash,
    pub from: ReplyPath,
    /// Nodes already asked; the receiver should not refer us back to them.
    pub excluded: Vec<IdentHash>,
    /// One-shot session key the reply is garlic-encrypted with.
    pub reply_key: [u8; 32],
    pub reply_tag: [u8; 32],
}

/// "Not here, try these" answer from a directory node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSearchReply {
    pub key: IdentHash,
    pub peers: Vec<IdentHash>,
    pub from: IdentHash,
}

/// Delivery confirmation carrying the token of the acknowledged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStatus {
    pub msg_id: u32,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NetMessage {
    DatabaseStore(DatabaseStore),
    DatabaseLookup(DatabaseLookup),
    DatabaseSearchReply(DatabaseSearchReply),
    DeliveryStatus(DeliveryStatus),
    /// Application data: payload followed by the [`DataMessage`] trailer.
    Data(Vec<u8>),
    /// Garlic-encrypted bundle of cloves.
    Garlic(Vec<u8>),
    /// Any other router-level message; never handled by a destination.
    Other { type_id: u8, payload: Vec<u8> },
}

impl NetMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, DestinationError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, DestinationError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            NetMessage::DatabaseStore(_) => "DatabaseStore",
            NetMessage::DatabaseLookup(_) => "DatabaseLookup",
            NetMessage::DatabaseSearchReply(_) => "DatabaseSearchReply",
            NetMessage::DeliveryStatus(_) => "DeliveryStatus",
            NetMessage::Data(_) => "Data",
            NetMessage::Garlic(_) => "Garlic",
            NetMessage::Other { .. } => "Other",
        }
    }
}

/// Message leaving through one of our outbound tunnels.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Outbound tunnel to send through.
    pub outbound_tunnel: TunnelId,
    /// Router the tunnel endpoint delivers to.
    pub router: IdentHash,
    /// Tunnel at `router` to inject into, if the target is a tunnel gateway.
    pub tunnel: Option<TunnelId>,
    pub message: NetMessage,
}

/// Trailer length: source port, destination port, protocol id.
pub const DATA_TRAILER_LEN: usize = 5;

/// Application payload addressed by protocol id and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage {
    pub protocol: u8,
    pub source_port: u16,
    pub destination_port: u16,
    pub payload: Vec<u8>,
}

impl DataMessage {
    /// Payload followed by `src_port(u16 BE) | dst_port(u16 BE) | protocol(u8)`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.payload.len() + DATA_TRAILER_LEN);
        buf.put_slice(&self.payload);
        buf.put_u16(self.source_port);
        buf.put_u16(self.destination_port);
        buf.put_u8(self.protocol);
        buf.to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self, DestinationError> {
        if data.len() < DATA_TRAILER_LEN {
            return Err(DestinationError::Malformed {
                reason: format!("data message too short: {} bytes", data.len()),
            });
        }
        let (payload, mut trailer) = data.split_at(data.len() - DATA_TRAILER_LEN);
        let source_port = trailer.get_u16();
        let destination_port = trailer.get_u16();
        let protocol = trailer.get_u8();
        Ok(Self {
            protocol,
            source_port,
            destination_port,
            payload: payload.to_vec(),
        })
    }
}

/// Application data queued by a handler for a remote destination.
///
/// The event loop resolves `target`, garlic-encrypts the encoded message
/// to the target's lease set key and sends it towards one of its leases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundData {
    pub target: IdentHash,
    pub message: DataMessage,
}
