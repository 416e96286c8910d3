//! Effect executor, the only place that touches I/O.
//!
//! - Send -> transport.send()
//! - Emit -> event_tx.try_send()
//! - ResolveLookup / StreamReady -> oneshot reply

use tokio::sync::mpsc;

use super::effect::DestinationEffect;
use super::transport::Transport;
use super::DestinationEvent;

/// Execute a list of effects using the given transport and event channel.
pub(super) async fn execute_effects<T: Transport + ?Sized>(
    effects: Vec<DestinationEffect>,
    transport: &T,
    event_tx: &mpsc::Sender<DestinationEvent>,
) {
    for effect in effects {
        match effect {
            DestinationEffect::Send(message) => {
                if let Err(e) = transport.send(&message).await {
                    tracing::warn!(
                        "transport: send of {} to {} failed: {e}",
                        message.message.kind(),
                        message.router
                    );
                    let _ = event_tx.try_send(DestinationEvent::Error {
                        description: format!("send to {} failed: {e}", message.router),
                    });
                }
            }
            DestinationEffect::Emit(event) => {
                // try_send: never block the loop on a slow consumer
                let _ = event_tx.try_send(event);
            }
            DestinationEffect::ResolveLookup { reply, result } => {
                // Caller may have given up; nothing to do then
                let _ = reply.send(result);
            }
            DestinationEffect::StreamReady { reply, result } => {
                let _ = reply.send(result);
            }
        }
    }
}
