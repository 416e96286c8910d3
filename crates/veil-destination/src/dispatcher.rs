//! Application protocol multiplexer.
//!
//! Decrypted data messages carry a protocol id and a destination port in
//! their trailer. The table maps `(protocol, port)` to a handler; port 0
//! is each protocol's default and catches ports with no exact entry.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::DestinationError;
use crate::message::DataMessage;

/// Upper-layer consumer of application data (streaming, datagrams).
///
/// Called on the destination's event loop; implementations must not block.
pub trait ProtocolHandler: Send + Sync {
    fn handle_data(&self, message: DataMessage) -> Result<(), DestinationError>;
}

/// Outcome of routing one data message.
#[derive(Debug)]
pub enum DispatchResult {
    Delivered,
    /// No handler for the protocol/port pair.
    NoHandler,
    /// The handler rejected the payload.
    Rejected(DestinationError),
}

#[derive(Default)]
pub struct ProtocolHandlerTable {
    handlers: HashMap<(u8, u16), Arc<dyn ProtocolHandler>>,
}

impl ProtocolHandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `(protocol, port)`, replacing any previous one.
    pub fn register(&mut self, protocol: u8, port: u16, handler: Arc<dyn ProtocolHandler>) {
        self.handlers.insert((protocol, port), handler);
    }

    /// Exact port first, then the protocol's port-0 default.
    pub fn lookup(&self, protocol: u8, port: u16) -> Option<&Arc<dyn ProtocolHandler>> {
        self.handlers
            .get(&(protocol, port))
            .or_else(|| self.handlers.get(&(protocol, 0)))
    }

    pub fn dispatch(&self, message: DataMessage) -> DispatchResult {
        let Some(handler) = self.lookup(message.protocol, message.destination_port) else {
            return DispatchResult::NoHandler;
        };
        match handler.handle_data(message) {
            Ok(()) => DispatchResult::Delivered,
            Err(e) => DispatchResult::Rejected(e),
        }
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
