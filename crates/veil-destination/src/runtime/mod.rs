//! Destination runtime: runs the controller on a single event loop.
//!
//! The loop owns all mutable destination state (repository, lookups,
//! publish cycle, handler table, timers). The application talks to it
//! through a cloneable [`DestinationHandle`] and hears back through the
//! event channel in [`DestinationChannels`].
mod effect;
mod executor;
mod r#loop;
mod state;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::DestinationConfig;
use crate::datagram::{Datagram, DatagramDestination};
use crate::directory::NetDb;
use crate::error::DestinationError;
use crate::garlic::{GarlicLayer, SessionGarlic, SessionTag};
use crate::identity::{load_or_generate_encryption_keys, PrivateKeys};
use crate::lease_set::LeaseSet;
use crate::message::{DeliveryStatus, NetMessage};
use crate::stats::DestinationStats;
use crate::streaming::{Stream, StreamingDestination};
use crate::tunnel::TunnelPool;
use crate::types::IdentHash;

pub use effect::DestinationEffect;
pub use state::DestinationState;
pub use transport::{ChannelTransport, Transport};

// ── Commands (app → loop) ─────────────────────────────────────────────

/// Commands marshalled onto the destination's event loop.
pub enum DestinationCommand {
    /// Resolve a remote lease set through the directory.
    RequestDestination {
        target: IdentHash,
        reply: oneshot::Sender<Option<Arc<LeaseSet>>>,
    },
    /// Abandon a lookup; its waiters are dropped without an answer.
    CancelDestinationRequest { target: IdentHash },
    /// Cached (or locally known) lease set, without a network lookup.
    FindLeaseSet {
        target: IdentHash,
        reply: oneshot::Sender<Option<Arc<LeaseSet>>>,
    },
    /// Message delivered to us through an inbound tunnel.
    HandleMessage(NetMessage),
    ProcessGarlicMessage(Vec<u8>),
    ProcessDeliveryStatus(DeliveryStatus),
    SubmitSessionKey { key: [u8; 32], tag: SessionTag },
    /// The tunnel pool changed; rebuild (and maybe republish) the lease set.
    SetLeaseSetUpdated,
    CreateStreamingDestination {
        port: u16,
        reply: oneshot::Sender<Arc<StreamingDestination>>,
    },
    GetStreamingDestination {
        port: u16,
        reply: oneshot::Sender<Option<Arc<StreamingDestination>>>,
    },
    /// Open a stream to `target`, looking it up first if needed.
    CreateStream {
        target: IdentHash,
        port: u16,
        reply: oneshot::Sender<Result<Stream, DestinationError>>,
    },
    /// Open a stream to a destination whose lease set the caller holds.
    CreateStreamTo {
        remote: LeaseSet,
        port: u16,
        reply: oneshot::Sender<Result<Stream, DestinationError>>,
    },
    CreateDatagramDestination {
        sink: mpsc::Sender<Datagram>,
        reply: oneshot::Sender<Arc<DatagramDestination>>,
    },
    GetDatagramDestination {
        reply: oneshot::Sender<Option<Arc<DatagramDestination>>>,
    },
    GetLeaseSet {
        reply: oneshot::Sender<Option<Arc<LeaseSet>>>,
    },
    IsReady { reply: oneshot::Sender<bool> },
    NumRemoteLeaseSets { reply: oneshot::Sender<usize> },
    /// Stop the loop.
    Shutdown,
}

// ── Events (loop → app) ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationEvent {
    /// Our lease set was rebuilt from the tunnel pool.
    LeaseSetUpdated { leases: usize },
    /// A directory node confirmed our lease set.
    LeaseSetPublished { floodfill: IdentHash },
    /// A directory node did not confirm in time; another will be tried.
    PublishTimedOut { floodfill: IdentHash },
    LeaseSetResolved { ident: IdentHash },
    LookupFailed { ident: IdentHash },
    /// Non-fatal error (e.g. the transport refused a message).
    Error { description: String },
}

// ── DestinationHandle (app-facing API) ───────────────────────────────

/// Handle to a running destination.
///
/// Cheap to clone. Every method is a channel send to the event loop;
/// after the destination stopped they fail with
/// [`DestinationError::Shutdown`] (or return an empty answer).
#[derive(Clone)]
pub struct DestinationHandle {
    cmd_tx: mpsc::Sender<DestinationCommand>,
    ident: IdentHash,
    stats: Arc<DestinationStats>,
    stream_request_timeout: Duration,
}

impl DestinationHandle {
    /// Identity hash of this destination.
    pub fn ident_hash(&self) -> IdentHash {
        self.ident
    }

    pub fn stats(&self) -> &DestinationStats {
        &self.stats
    }

    async fn send(&self, cmd: DestinationCommand) -> Result<(), DestinationError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| DestinationError::Shutdown)
    }

    async fn query<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> DestinationCommand,
    ) -> Result<R, DestinationError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| DestinationError::Shutdown)
    }

    /// Resolve `target`'s lease set through the directory.
    ///
    /// Concurrent calls for one target share a single lookup. `None`
    /// means not found (or the request was cancelled).
    pub async fn request_destination(&self, target: IdentHash) -> Option<Arc<LeaseSet>> {
        let (tx, rx) = oneshot::channel();
        self.request_destination_with(target, tx).await.ok()?;
        rx.await.ok().flatten()
    }

    /// Like [`request_destination`](Self::request_destination), but the
    /// answer goes to `reply`. A cancelled request drops `reply` unanswered.
    pub async fn request_destination_with(
        &self,
        target: IdentHash,
        reply: oneshot::Sender<Option<Arc<LeaseSet>>>,
    ) -> Result<(), DestinationError> {
        self.send(DestinationCommand::RequestDestination { target, reply })
            .await
    }

    pub async fn cancel_destination_request(&self, target: IdentHash) -> Result<(), DestinationError> {
        self.send(DestinationCommand::CancelDestinationRequest { target })
            .await
    }

    /// Lease set from the cache or the local directory store. No lookup.
    pub async fn find_lease_set(&self, target: IdentHash) -> Option<Arc<LeaseSet>> {
        self.query(|reply| DestinationCommand::FindLeaseSet { target, reply })
            .await
            .ok()
            .flatten()
    }

    /// Feed a message that arrived through one of our inbound tunnels.
    pub async fn handle_message(&self, message: NetMessage) -> Result<(), DestinationError> {
        self.send(DestinationCommand::HandleMessage(message)).await
    }

    pub async fn process_garlic_message(&self, data: Vec<u8>) -> Result<(), DestinationError> {
        self.send(DestinationCommand::ProcessGarlicMessage(data)).await
    }

    pub async fn process_delivery_status_message(
        &self,
        status: DeliveryStatus,
    ) -> Result<(), DestinationError> {
        self.send(DestinationCommand::ProcessDeliveryStatus(status))
            .await
    }

    pub async fn submit_session_key(&self, key: [u8; 32], tag: SessionTag) -> Result<(), DestinationError> {
        self.send(DestinationCommand::SubmitSessionKey { key, tag })
            .await
    }

    /// Signal that the tunnel pool changed.
    pub async fn set_lease_set_updated(&self) -> Result<(), DestinationError> {
        self.send(DestinationCommand::SetLeaseSetUpdated).await
    }

    /// Our current lease set, if one has been built.
    pub async fn lease_set(&self) -> Option<Arc<LeaseSet>> {
        self.query(|reply| DestinationCommand::GetLeaseSet { reply })
            .await
            .ok()
            .flatten()
    }

    /// Non-expired own lease set and at least one outbound tunnel.
    pub async fn is_ready(&self) -> bool {
        self.query(|reply| DestinationCommand::IsReady { reply })
            .await
            .unwrap_or(false)
    }

    pub async fn num_remote_lease_sets(&self) -> usize {
        self.query(|reply| DestinationCommand::NumRemoteLeaseSets { reply })
            .await
            .unwrap_or(0)
    }

    // ── Streaming ──────────────────────────────

    /// Streaming handler on `port`, created if missing. Port 0 is the default.
    pub async fn create_streaming_destination(
        &self,
        port: u16,
    ) -> Result<Arc<StreamingDestination>, DestinationError> {
        self.query(|reply| DestinationCommand::CreateStreamingDestination { port, reply })
            .await
    }

    pub async fn get_streaming_destination(&self, port: u16) -> Option<Arc<StreamingDestination>> {
        self.query(|reply| DestinationCommand::GetStreamingDestination { port, reply })
            .await
            .ok()
            .flatten()
    }

    /// Open a stream to `target` through the default streaming handler.
    ///
    /// Looks the target up if its lease set is not cached. Fails with
    /// [`DestinationError::StreamTimeout`] after the configured timeout.
    pub async fn create_stream(&self, target: IdentHash, port: u16) -> Result<Stream, DestinationError> {
        let (tx, rx) = oneshot::channel();
        self.send(DestinationCommand::CreateStream {
            target,
            port,
            reply: tx,
        })
        .await?;
        match tokio::time::timeout(self.stream_request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DestinationError::Shutdown),
            Err(_) => Err(DestinationError::StreamTimeout { ident: target }),
        }
    }

    /// Open a stream to the destination described by `remote`.
    pub async fn create_stream_to(&self, remote: LeaseSet, port: u16) -> Result<Stream, DestinationError> {
        self.query(|reply| DestinationCommand::CreateStreamTo {
            remote,
            port,
            reply,
        })
        .await?
    }

    /// Accept inbound streams on the default streaming handler.
    pub async fn accept_streams(&self) -> Result<mpsc::UnboundedReceiver<Stream>, DestinationError> {
        Ok(self.default_streaming().await?.accept_streams())
    }

    pub async fn is_accepting_streams(&self) -> bool {
        match self.get_streaming_destination(0).await {
            Some(dest) => dest.is_accepting(),
            None => false,
        }
    }

    pub async fn stop_accepting_streams(&self) -> Result<(), DestinationError> {
        self.default_streaming().await?.stop_accepting();
        Ok(())
    }

    async fn default_streaming(&self) -> Result<Arc<StreamingDestination>, DestinationError> {
        self.get_streaming_destination(0)
            .await
            .ok_or(DestinationError::NoStreamingDestination { port: 0 })
    }

    // ── Datagrams ──────────────────────────────

    /// Register the datagram handler (protocols 17 and 18).
    ///
    /// Received datagrams arrive on the returned channel. Calling this
    /// again keeps the handler and redirects delivery to a new channel.
    pub async fn create_datagram_destination(
        &self,
        capacity: usize,
    ) -> Result<(Arc<DatagramDestination>, mpsc::Receiver<Datagram>), DestinationError> {
        let (sink, rx) = mpsc::channel(capacity.max(1));
        let dest = self
            .query(|reply| DestinationCommand::CreateDatagramDestination { sink, reply })
            .await?;
        Ok((dest, rx))
    }

    pub async fn get_datagram_destination(&self) -> Option<Arc<DatagramDestination>> {
        self.query(|reply| DestinationCommand::GetDatagramDestination { reply })
            .await
            .ok()
            .flatten()
    }
}

// ── Destination (lifecycle) ──────────────────────────────────────────

/// Channels returned to the application when a destination starts.
pub struct DestinationChannels {
    pub destination: Destination,
    /// Destination-level events.
    pub events: mpsc::Receiver<DestinationEvent>,
}

/// A running destination. Dropping it does not stop the loop; call
/// [`Destination::stop`].
pub struct Destination {
    handle: DestinationHandle,
    task: JoinHandle<()>,
}

impl Destination {
    /// Start a destination with the default session-tag garlic layer.
    ///
    /// The ephemeral encryption keys are loaded from (or persisted to)
    /// the configured keys directory. Spawns the event loop as a tokio task.
    pub fn start<T: Transport + 'static>(
        keys: PrivateKeys,
        config: DestinationConfig,
        pool: Arc<dyn TunnelPool>,
        netdb: Arc<dyn NetDb>,
        transport: T,
    ) -> DestinationChannels {
        let encryption = load_or_generate_encryption_keys(config.keys_dir.as_deref(), &keys.ident_hash());
        let encryption_key = encryption.public_key();
        Self::start_with_garlic(
            keys,
            config,
            pool,
            netdb,
            Box::new(SessionGarlic::new(encryption)),
            encryption_key,
            transport,
        )
    }

    /// Start a destination with a caller-supplied garlic layer.
    ///
    /// `encryption_key` is the public key advertised in the lease set; the
    /// garlic layer must be able to open bundles sealed to it.
    pub fn start_with_garlic<T: Transport + 'static>(
        keys: PrivateKeys,
        config: DestinationConfig,
        pool: Arc<dyn TunnelPool>,
        netdb: Arc<dyn NetDb>,
        garlic: Box<dyn GarlicLayer>,
        encryption_key: [u8; 32],
        transport: T,
    ) -> DestinationChannels {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.channel_buffer);
        let (event_tx, event_rx) = mpsc::channel(config.channel_buffer);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let stream_request_timeout = config.stream_request_timeout;

        let state = DestinationState::new(keys, config, pool, netdb, garlic, encryption_key, outbound_tx);
        let handle = DestinationHandle {
            cmd_tx,
            ident: state.ident_hash(),
            stats: state.stats(),
            stream_request_timeout,
        };

        let task = tokio::spawn(r#loop::destination_loop(
            state,
            transport,
            cmd_rx,
            outbound_rx,
            event_tx,
        ));

        DestinationChannels {
            destination: Destination { handle, task },
            events: event_rx,
        }
    }

    pub fn handle(&self) -> DestinationHandle {
        self.handle.clone()
    }

    pub fn ident_hash(&self) -> IdentHash {
        self.handle.ident
    }

    /// Stop the loop and wait for it to finish.
    ///
    /// Timers are cancelled, pending lookups and publishes are abandoned
    /// without answers, and the tunnel pool is deactivated.
    pub async fn stop(self) {
        let _ = self.handle.cmd_tx.send(DestinationCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            tracing::warn!("destination: event loop ended abnormally: {e}");
        }
    }
}
