use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::DestinationError;
use crate::lease_set::LeaseSet;
use crate::message::OutboundMessage;
use crate::streaming::Stream;

use super::DestinationEvent;

/// Intent produced by the pure `DestinationState`.
///
/// Every `handle_*` / `tick_*` method returns `Vec<DestinationEffect>`;
/// the loop then executes them through the transport and channels.
#[derive(Debug)]
pub enum DestinationEffect {
    /// Hand a message to the transport (through one of our outbound tunnels).
    Send(OutboundMessage),

    /// Emit an event to the application.
    Emit(DestinationEvent),

    /// Complete a `request_destination` caller.
    ResolveLookup {
        reply: oneshot::Sender<Option<Arc<LeaseSet>>>,
        result: Option<Arc<LeaseSet>>,
    },

    /// Complete a `create_stream` caller.
    StreamReady {
        reply: oneshot::Sender<Result<Stream, DestinationError>>,
        result: Result<Stream, DestinationError>,
    },
}
