//! Streaming handler (protocol 6) bound to a local port.
//!
//! This is a thin framing over the destination's data path: packets are
//! tagged with a stream id chosen by the opener and the sender's identity
//! hash, and delivered in arrival order. Reliability (acks, retransmission,
//! windowing) belongs to a real streaming library and is not done here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::dispatcher::ProtocolHandler;
use crate::error::DestinationError;
use crate::message::{DataMessage, OutboundData};
use crate::types::{IdentHash, PROTOCOL_TYPE_STREAMING};

pub const FLAG_SYN: u8 = 0x01;
pub const FLAG_CLOSE: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPacket {
    pub stream_id: u32,
    pub flags: u8,
    pub from: IdentHash,
    pub payload: Vec<u8>,
}

type StreamKey = (IdentHash, u32);
type StreamTable = Arc<Mutex<HashMap<StreamKey, mpsc::UnboundedSender<Vec<u8>>>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// One end of a stream.
#[derive(Debug)]
pub struct Stream {
    id: u32,
    local: IdentHash,
    remote: IdentHash,
    local_port: u16,
    remote_port: u16,
    outbound: mpsc::UnboundedSender<OutboundData>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    table: StreamTable,
}

impl Stream {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn remote(&self) -> IdentHash {
        self.remote
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn send(&self, data: &[u8]) -> Result<(), DestinationError> {
        self.send_packet(0, data.to_vec())
    }

    /// Next chunk from the remote end. `None` once the remote closed the
    /// stream or the destination stopped.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }

    /// Tell the remote end we are done.
    pub fn close(self) -> Result<(), DestinationError> {
        self.send_packet(FLAG_CLOSE, Vec::new())
    }

    fn send_packet(&self, flags: u8, payload: Vec<u8>) -> Result<(), DestinationError> {
        let packet = StreamPacket {
            stream_id: self.id,
            flags,
            from: self.local,
            payload,
        };
        let data = OutboundData {
            target: self.remote,
            message: DataMessage {
                protocol: PROTOCOL_TYPE_STREAMING,
                source_port: self.local_port,
                destination_port: self.remote_port,
                payload: rmp_serde::to_vec(&packet)?,
            },
        };
        self.outbound
            .send(data)
            .map_err(|_| DestinationError::Shutdown)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        lock(&self.table).remove(&(self.remote, self.id));
    }
}

/// Streaming endpoint of a destination on one port (0 = default).
pub struct StreamingDestination {
    local: IdentHash,
    port: u16,
    outbound: mpsc::UnboundedSender<OutboundData>,
    acceptor: Mutex<Option<mpsc::UnboundedSender<Stream>>>,
    streams: StreamTable,
}

impl StreamingDestination {
    pub fn new(local: IdentHash, port: u16, outbound: mpsc::UnboundedSender<OutboundData>) -> Self {
        Self {
            local,
            port,
            outbound,
            acceptor: Mutex::new(None),
            streams: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Open a stream to `remote` on `port`. The SYN goes out immediately.
    pub fn create_stream(&self, remote: IdentHash, port: u16) -> Result<Stream, DestinationError> {
        let id = loop {
            let id: u32 = rand::random();
            if id != 0 && !lock(&self.streams).contains_key(&(remote, id)) {
                break id;
            }
        };
        let stream = self.register(id, remote, port);
        stream.send_packet(FLAG_SYN, Vec::new())?;
        tracing::debug!("streaming: opened stream {id} to {remote}:{port}");
        Ok(stream)
    }

    /// Start accepting inbound streams; they arrive on the returned channel.
    ///
    /// Replaces any previous acceptor.
    pub fn accept_streams(&self) -> mpsc::UnboundedReceiver<Stream> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.acceptor) = Some(tx);
        rx
    }

    pub fn is_accepting(&self) -> bool {
        lock(&self.acceptor)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    pub fn stop_accepting(&self) {
        lock(&self.acceptor).take();
    }

    /// Number of open streams.
    pub fn stream_count(&self) -> usize {
        lock(&self.streams).len()
    }

    /// Drop every stream; their receivers see end-of-stream.
    pub fn reset(&self) {
        lock(&self.streams).clear();
        self.stop_accepting();
    }

    fn register(&self, id: u32, remote: IdentHash, remote_port: u16) -> Stream {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.streams).insert((remote, id), tx);
        Stream {
            id,
            local: self.local,
            remote,
            local_port: self.port,
            remote_port,
            outbound: self.outbound.clone(),
            inbound: rx,
            table: Arc::clone(&self.streams),
        }
    }

    fn accept(&self, packet: StreamPacket, remote_port: u16) {
        let Some(acceptor) = lock(&self.acceptor).clone() else {
            tracing::debug!(
                "streaming: no acceptor on port {}, dropping SYN from {}",
                self.port,
                packet.from
            );
            return;
        };

        let stream = self.register(packet.stream_id, packet.from, remote_port);
        if !packet.payload.is_empty() {
            if let Some(tx) = lock(&self.streams).get(&(packet.from, packet.stream_id)) {
                let _ = tx.send(packet.payload);
            }
        }
        if acceptor.send(stream).is_err() {
            tracing::debug!("streaming: acceptor on port {} went away", self.port);
            lock(&self.acceptor).take();
        }
    }
}

impl ProtocolHandler for StreamingDestination {
    fn handle_data(&self, message: DataMessage) -> Result<(), DestinationError> {
        let packet: StreamPacket = rmp_serde::from_slice(&message.payload)?;
        let key = (packet.from, packet.stream_id);

        let existing = lock(&self.streams).get(&key).cloned();
        match existing {
            Some(tx) => {
                if !packet.payload.is_empty() {
                    let _ = tx.send(packet.payload);
                }
                if packet.flags & FLAG_CLOSE != 0 {
                    lock(&self.streams).remove(&key);
                }
            }
            None if packet.flags & FLAG_SYN != 0 => self.accept(packet, message.source_port),
            None => {
                tracing::debug!(
                    "streaming: packet for unknown stream {} from {}",
                    packet.stream_id,
                    packet.from
                );
            }
        }
        Ok(())
    }
}
