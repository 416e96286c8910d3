//! The destination event loop.
//!
//! A single async task that owns the `DestinationState` and multiplexes
//! over application commands, outbound data from protocol handlers and
//! the earliest armed timer.
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::message::OutboundData;

use super::executor::execute_effects;
use super::state::DestinationState;
use super::transport::Transport;
use super::{DestinationCommand, DestinationEvent};

pub(super) async fn destination_loop<T: Transport>(
    mut state: DestinationState,
    transport: T,
    mut cmd_rx: mpsc::Receiver<DestinationCommand>,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundData>,
    event_tx: mpsc::Sender<DestinationEvent>,
) {
    let effects = state.start(Instant::now());
    execute_effects(effects, &transport, &event_tx).await;

    loop {
        let deadline = state.next_deadline();
        let effects = tokio::select! {
            // ── 1. Application commands ─────────────────────────
            cmd = cmd_rx.recv() => match cmd {
                Some(DestinationCommand::Shutdown) | None => break,
                Some(cmd) => state.handle_command(cmd, Instant::now()),
            },

            // ── 2. Data queued by streams and datagram senders ──
            Some(data) = outbound_rx.recv() => state.handle_outbound(data, Instant::now()),

            // ── 3. Timers (lookup rounds, publish, cleanup) ─────
            _ = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            } => state.tick_timers(Instant::now()),
        };
        execute_effects(effects, &transport, &event_tx).await;
    }

    state.shutdown();
}
