//! Datagram handler: protocol 17 (signed, repliable) and 18 (raw).
//!
//! A signed datagram carries the sender's public identity and an Ed25519
//! signature over the payload; the receiver verifies it and learns who
//! sent it. Raw datagrams are anonymous.

use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::dispatcher::ProtocolHandler;
use crate::error::DestinationError;
use crate::identity::{PrivateKeys, PublicIdentity};
use crate::message::{DataMessage, OutboundData};
use crate::types::{IdentHash, PROTOCOL_TYPE_DATAGRAM, PROTOCOL_TYPE_RAW};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SignedDatagram {
    from: PublicIdentity,
    signature: Vec<u8>,
    payload: Vec<u8>,
}

/// A received datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Verified sender; `None` for raw datagrams.
    pub from: Option<IdentHash>,
    pub source_port: u16,
    pub destination_port: u16,
    pub payload: Vec<u8>,
}

pub struct DatagramDestination {
    keys: PrivateKeys,
    outbound: mpsc::UnboundedSender<OutboundData>,
    sink: Mutex<mpsc::Sender<Datagram>>,
}

impl DatagramDestination {
    pub fn new(
        keys: PrivateKeys,
        outbound: mpsc::UnboundedSender<OutboundData>,
        sink: mpsc::Sender<Datagram>,
    ) -> Self {
        Self {
            keys,
            outbound,
            sink: Mutex::new(sink),
        }
    }

    /// Route received datagrams to a new channel.
    pub fn set_sink(&self, sink: mpsc::Sender<Datagram>) {
        *self.lock_sink() = sink;
    }

    /// Send a signed datagram to `target`.
    pub fn send_datagram(
        &self,
        target: IdentHash,
        from_port: u16,
        to_port: u16,
        payload: &[u8],
    ) -> Result<(), DestinationError> {
        let datagram = SignedDatagram {
            from: *self.keys.identity(),
            signature: self.keys.sign(payload),
            payload: payload.to_vec(),
        };
        self.queue(target, PROTOCOL_TYPE_DATAGRAM, from_port, to_port, rmp_serde::to_vec(&datagram)?)
    }

    /// Send an anonymous datagram to `target`.
    pub fn send_raw_datagram(
        &self,
        target: IdentHash,
        from_port: u16,
        to_port: u16,
        payload: &[u8],
    ) -> Result<(), DestinationError> {
        self.queue(target, PROTOCOL_TYPE_RAW, from_port, to_port, payload.to_vec())
    }

    fn queue(
        &self,
        target: IdentHash,
        protocol: u8,
        source_port: u16,
        destination_port: u16,
        payload: Vec<u8>,
    ) -> Result<(), DestinationError> {
        let data = OutboundData {
            target,
            message: DataMessage {
                protocol,
                source_port,
                destination_port,
                payload,
            },
        };
        self.outbound
            .send(data)
            .map_err(|_| DestinationError::Shutdown)
    }

    fn lock_sink(&self) -> MutexGuard<'_, mpsc::Sender<Datagram>> {
        self.sink.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ProtocolHandler for DatagramDestination {
    fn handle_data(&self, message: DataMessage) -> Result<(), DestinationError> {
        let (from, payload) = match message.protocol {
            PROTOCOL_TYPE_DATAGRAM => {
                let signed: SignedDatagram = rmp_serde::from_slice(&message.payload)?;
                signed.from.verify(&signed.payload, &signed.signature)?;
                (Some(signed.from.hash()), signed.payload)
            }
            PROTOCOL_TYPE_RAW => (None, message.payload),
            other => {
                return Err(DestinationError::Malformed {
                    reason: format!("protocol {other} is not a datagram"),
                })
            }
        };

        let datagram = Datagram {
            from,
            source_port: message.source_port,
            destination_port: message.destination_port,
            payload,
        };
        // try_send: never block the event loop; a slow consumer loses datagrams
        if let Err(e) = self.lock_sink().try_send(datagram) {
            tracing::debug!("datagram: dropped inbound datagram: {e}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (
        DatagramDestination,
        mpsc::UnboundedReceiver<OutboundData>,
        mpsc::Receiver<Datagram>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (sink_tx, sink_rx) = mpsc::channel(8);
        let dest = DatagramDestination::new(PrivateKeys::generate(), out_tx, sink_tx);
        (dest, out_rx, sink_rx)
    }

    #[test]
    fn signed_datagram_carries_verified_sender() {
        let (alice, mut alice_out, _) = pair();
        let (bob, _, mut bob_in) = pair();
        let target = IdentHash::from_bytes([2; 32]);

        alice.send_datagram(target, 10, 20, b"hello").unwrap();
        let out = alice_out.try_recv().unwrap();
        assert_eq!(out.target, target);
        assert_eq!(out.message.protocol, PROTOCOL_TYPE_DATAGRAM);

        bob.handle_data(out.message).unwrap();
        let got = bob_in.try_recv().unwrap();
        assert_eq!(got.from, Some(alice.keys.ident_hash()));
        assert_eq!((got.source_port, got.destination_port), (10, 20));
        assert_eq!(got.payload, b"hello");
    }

    #[test]
    fn forged_signature_rejected() {
        let (alice, mut alice_out, _) = pair();
        let (bob, _, mut bob_in) = pair();
        alice
            .send_datagram(IdentHash::from_bytes([2; 32]), 0, 0, b"hello")
            .unwrap();
        let mut out = alice_out.try_recv().unwrap();

        let mut signed: SignedDatagram = rmp_serde::from_slice(&out.message.payload).unwrap();
        signed.payload = b"HELLO".to_vec();
        out.message.payload = rmp_serde::to_vec(&signed).unwrap();

        assert!(matches!(
            bob.handle_data(out.message),
            Err(DestinationError::InvalidSignature)
        ));
        assert!(bob_in.try_recv().is_err());
    }

    #[test]
    fn raw_datagram_is_anonymous() {
        let (alice, mut alice_out, _) = pair();
        let (bob, _, mut bob_in) = pair();
        alice
            .send_raw_datagram(IdentHash::from_bytes([2; 32]), 1, 2, b"anon")
            .unwrap();
        bob.handle_data(alice_out.try_recv().unwrap().message).unwrap();
        let got = bob_in.try_recv().unwrap();
        assert_eq!(got.from, None);
        assert_eq!(got.payload, b"anon");
    }

    #[test]
    fn sink_can_be_replaced() {
        let (alice, mut alice_out, _) = pair();
        let (bob, _, mut old_in) = pair();
        let (new_tx, mut new_in) = mpsc::channel(1);
        bob.set_sink(new_tx);

        alice
            .send_raw_datagram(IdentHash::from_bytes([2; 32]), 0, 0, b"x")
            .unwrap();
        bob.handle_data(alice_out.try_recv().unwrap().message).unwrap();
        assert!(new_in.try_recv().is_ok());
        assert!(old_in.try_recv().is_err());
    }
}
