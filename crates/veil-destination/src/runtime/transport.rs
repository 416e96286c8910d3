use crate::message::OutboundMessage;

/// Outbound side of the tunnel subsystem.
///
/// In production: the router's tunnel dispatcher.
/// In tests: `MockTransport` (records what was sent).
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Inject `message` into its outbound tunnel.
    async fn send(&self, message: &OutboundMessage) -> Result<(), String>;
}

// ── Channel transport (embedders, simulator) ─────────────────────────

/// Transport that forwards every message into a channel.
#[derive(Clone)]
pub struct ChannelTransport {
    tx: tokio::sync::mpsc::UnboundedSender<OutboundMessage>,
}

impl ChannelTransport {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<(), String> {
        self.tx
            .send(message.clone())
            .map_err(|_| "transport channel closed".to_string())
    }
}

// ── MockTransport (tests) ───────────────────────────────────────────
