use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::config::DestinationConfig;
use crate::datagram::{Datagram, DatagramDestination};
use crate::directory::NetDb;
use crate::dispatcher::{DispatchResult, ProtocolHandlerTable};
use crate::error::DestinationError;
use crate::garlic::{GarlicLayer, SessionTag};
use crate::identity::PrivateKeys;
use crate::lease_set::{Lease, LeaseSet};
use crate::lookup::{LookupCoordinator, TimeoutAction};
use crate::message::{
    DataMessage, DatabaseLookup, DatabaseSearchReply, DatabaseStore, DeliveryStatus, NetMessage,
    OutboundData, OutboundMessage, ReplyPath,
};
use crate::publish::PublishCoordinator;
use crate::repository::LeaseSetRepository;
use crate::stats::DestinationStats;
use crate::streaming::{Stream, StreamingDestination};
use crate::timer::{TimerId, TimerKind, TimerQueue};
use crate::tunnel::{InboundTunnel, TunnelPool};
use crate::types::{
    now_ms, IdentHash, MAX_NUM_FLOODFILLS_PER_REQUEST, PROTOCOL_TYPE_DATAGRAM, PROTOCOL_TYPE_RAW,
    PROTOCOL_TYPE_STREAMING,
};

use super::effect::DestinationEffect;
use super::{DestinationCommand, DestinationEvent};

/// Work to resume once a lookup finishes.
pub(crate) enum LookupWaiter {
    /// A `request_destination` caller.
    Notify(oneshot::Sender<Option<Arc<LeaseSet>>>),
    /// A `create_stream` caller.
    Stream {
        port: u16,
        reply: oneshot::Sender<Result<Stream, DestinationError>>,
    },
    /// Application data waiting for its target's lease set.
    Send(OutboundData),
}

/// Complete destination state: pure logic, no I/O.
///
/// Every `handle_*` / `tick_*` method returns `Vec<DestinationEffect>`;
/// none of them touches the transport or the event channel. `now` is
/// passed in so tests can drive time explicitly.
pub struct DestinationState {
    keys: PrivateKeys,
    ident: IdentHash,
    config: DestinationConfig,
    pool: Arc<dyn TunnelPool>,
    netdb: Arc<dyn NetDb>,
    garlic: Box<dyn GarlicLayer>,
    /// Ephemeral key advertised in our lease set.
    encryption_key: [u8; 32],
    outbound_tx: mpsc::UnboundedSender<OutboundData>,
    stats: Arc<DestinationStats>,

    lease_set: Option<Arc<LeaseSet>>,
    repository: LeaseSetRepository,
    lookups: LookupCoordinator<LookupWaiter>,
    publish: PublishCoordinator,
    handlers: ProtocolHandlerTable,
    streaming: HashMap<u16, Arc<StreamingDestination>>,
    datagram: Option<Arc<DatagramDestination>>,
    timers: TimerQueue,
    running: bool,
}

impl DestinationState {
    pub fn new(
        keys: PrivateKeys,
        config: DestinationConfig,
        pool: Arc<dyn TunnelPool>,
        netdb: Arc<dyn NetDb>,
        garlic: Box<dyn GarlicLayer>,
        encryption_key: [u8; 32],
        outbound_tx: mpsc::UnboundedSender<OutboundData>,
    ) -> Self {
        Self {
            ident: keys.ident_hash(),
            lookups: LookupCoordinator::new(MAX_NUM_FLOODFILLS_PER_REQUEST, config.max_lookup_time),
            keys,
            config,
            pool,
            netdb,
            garlic,
            encryption_key,
            outbound_tx,
            stats: Arc::new(DestinationStats::default()),
            lease_set: None,
            repository: LeaseSetRepository::new(),
            publish: PublishCoordinator::new(),
            handlers: ProtocolHandlerTable::new(),
            streaming: HashMap::new(),
            datagram: None,
            timers: TimerQueue::new(),
            running: false,
        }
    }

    pub fn ident_hash(&self) -> IdentHash {
        self.ident
    }

    pub fn stats(&self) -> Arc<DestinationStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn lease_set(&self) -> Option<Arc<LeaseSet>> {
        self.lease_set.clone()
    }

    pub fn num_remote_lease_sets(&self) -> usize {
        self.repository.len()
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Activate the pool, arm periodic timers, build (and publish) the
    /// lease set.
    pub fn start(&mut self, now: Instant) -> Vec<DestinationEffect> {
        if self.running {
            return Vec::new();
        }
        self.running = true;
        self.pool.set_active(true);
        if self.config.default_streaming {
            self.create_streaming_destination(0);
        }
        self.timers
            .schedule(now + self.config.cleanup_interval, TimerKind::Cleanup);
        self.timers
            .schedule(now + self.config.refresh_check_interval, TimerKind::LeaseRefresh);
        tracing::info!("destination: {} started", self.ident);
        self.handle_lease_set_updated(now)
    }

    /// Cancel timers and abandon lookups and publishing without answering
    /// anyone. Idempotent.
    pub fn shutdown(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.timers.clear();
        let abandoned = self.lookups.drain();
        if !abandoned.is_empty() {
            tracing::debug!("destination: abandoning {} lookups", abandoned.len());
        }
        self.publish.start_cycle();
        for dest in self.streaming.values() {
            dest.reset();
        }
        self.handlers.clear();
        self.pool.set_active(false);
        tracing::info!("destination: {} stopped", self.ident);
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Process one command. `Shutdown` is handled by the loop.
    pub fn handle_command(&mut self, cmd: DestinationCommand, now: Instant) -> Vec<DestinationEffect> {
        match cmd {
            DestinationCommand::RequestDestination { target, reply } => {
                self.request_destination(target, LookupWaiter::Notify(reply), now)
            }
            DestinationCommand::CancelDestinationRequest { target } => {
                self.cancel_destination_request(&target);
                Vec::new()
            }
            DestinationCommand::FindLeaseSet { target, reply } => {
                let _ = reply.send(self.find_lease_set(&target, now));
                Vec::new()
            }
            DestinationCommand::HandleMessage(message) => self.handle_message(message, now),
            DestinationCommand::ProcessGarlicMessage(data) => self.handle_garlic(&data, now),
            DestinationCommand::ProcessDeliveryStatus(status) => self.handle_delivery_status(status),
            DestinationCommand::SubmitSessionKey { key, tag } => {
                self.submit_session_key(key, tag);
                Vec::new()
            }
            DestinationCommand::SetLeaseSetUpdated => self.handle_lease_set_updated(now),
            DestinationCommand::CreateStreamingDestination { port, reply } => {
                let _ = reply.send(self.create_streaming_destination(port));
                Vec::new()
            }
            DestinationCommand::GetStreamingDestination { port, reply } => {
                let _ = reply.send(self.streaming.get(&port).cloned());
                Vec::new()
            }
            DestinationCommand::CreateStream {
                target,
                port,
                reply,
            } => self.create_stream(target, port, reply, now),
            DestinationCommand::CreateStreamTo {
                remote,
                port,
                reply,
            } => {
                let _ = reply.send(self.create_stream_to(remote, port, now));
                Vec::new()
            }
            DestinationCommand::CreateDatagramDestination { sink, reply } => {
                let _ = reply.send(self.create_datagram_destination(sink));
                Vec::new()
            }
            DestinationCommand::GetDatagramDestination { reply } => {
                let _ = reply.send(self.datagram.clone());
                Vec::new()
            }
            DestinationCommand::GetLeaseSet { reply } => {
                let _ = reply.send(self.lease_set());
                Vec::new()
            }
            DestinationCommand::IsReady { reply } => {
                let _ = reply.send(self.is_ready());
                Vec::new()
            }
            DestinationCommand::NumRemoteLeaseSets { reply } => {
                let _ = reply.send(self.num_remote_lease_sets());
                Vec::new()
            }
            // Handled in the loop, which breaks on it.
            DestinationCommand::Shutdown => Vec::new(),
        }
    }

    // ── Own lease set & publishing ───────────────────────────────────

    /// Rebuild the lease set from the pool's valid inbound tunnels.
    ///
    /// An unchanged rebuild is discarded. A changed one starts a new
    /// publish cycle when the destination is public.
    pub fn handle_lease_set_updated(&mut self, now: Instant) -> Vec<DestinationEffect> {
        let now_ms = now_ms();
        let leases: Vec<Lease> = self
            .pool
            .inbound_tunnels()
            .iter()
            .filter(|t| t.expires_at > now_ms)
            .map(InboundTunnel::to_lease)
            .collect();
        if leases.is_empty() {
            tracing::debug!("publish: no valid inbound tunnels, lease set not updated");
            return Vec::new();
        }

        let lease_set = match LeaseSet::build(&self.keys, self.encryption_key, leases) {
            Ok(ls) => ls,
            Err(e) => {
                tracing::warn!("publish: can't build lease set: {e}");
                return Vec::new();
            }
        };
        if self
            .lease_set
            .as_ref()
            .is_some_and(|current| current.same_content(&lease_set))
        {
            tracing::debug!("publish: lease set unchanged");
            return Vec::new();
        }

        let leases = lease_set.leases.len();
        self.lease_set = Some(Arc::new(lease_set));
        tracing::debug!("publish: lease set updated ({leases} leases)");

        let mut effects = vec![DestinationEffect::Emit(DestinationEvent::LeaseSetUpdated {
            leases,
        })];
        if self.config.is_public {
            if let Some(timer) = self.publish.start_cycle() {
                self.timers.cancel(timer);
            }
            effects.extend(self.publish_attempt(now));
        }
        effects
    }

    /// Send the lease set to the next untried directory node.
    fn publish_attempt(&mut self, now: Instant) -> Vec<DestinationEffect> {
        let Some(lease_set) = self.lease_set.clone() else {
            return Vec::new();
        };
        let Some(outbound) = self.pool.next_outbound_tunnel() else {
            tracing::debug!("publish: no outbound tunnels, skipping");
            return Vec::new();
        };
        let Some(inbound) = self.pool.next_inbound_tunnel() else {
            tracing::debug!("publish: no inbound tunnel for the confirmation, skipping");
            return Vec::new();
        };
        let Some(floodfill) = self.publish.next_floodfill(&self.ident, self.netdb.as_ref()) else {
            tracing::info!("publish: no more floodfills to try");
            return Vec::new();
        };

        let token = self.publish.begin(floodfill);
        let timer = self.timers.schedule(
            now + self.config.publish_confirmation_timeout,
            TimerKind::PublishConfirmation,
        );
        self.publish.set_timer(timer);
        self.stats.publishes_sent.inc();
        tracing::debug!("publish: storing lease set at {floodfill} (token {token})");

        vec![DestinationEffect::Send(OutboundMessage {
            outbound_tunnel: outbound.tunnel_id,
            router: floodfill,
            tunnel: None,
            message: NetMessage::DatabaseStore(DatabaseStore {
                key: self.ident,
                lease_set: (*lease_set).clone(),
                reply_token: token,
                reply: Some(ReplyPath {
                    gateway: inbound.gateway,
                    tunnel_id: inbound.tunnel_id,
                }),
            }),
        })]
    }

    fn on_publish_timeout(&mut self, timer: TimerId, now: Instant) -> Vec<DestinationEffect> {
        let floodfill = self.publish.pending().map(|p| p.floodfill);
        if !self.publish.on_timeout(timer) {
            return Vec::new();
        }
        self.stats.publish_timeouts.inc();

        let mut effects = Vec::new();
        if let Some(floodfill) = floodfill {
            tracing::debug!("publish: no confirmation from {floodfill}, trying another");
            effects.push(DestinationEffect::Emit(DestinationEvent::PublishTimedOut {
                floodfill,
            }));
        }
        effects.extend(self.publish_attempt(now));
        effects
    }

    /// Match against the pending publish, else let the garlic layer have it.
    pub fn handle_delivery_status(&mut self, status: DeliveryStatus) -> Vec<DestinationEffect> {
        if let Some(done) = self.publish.confirm(status.msg_id) {
            if let Some(timer) = done.timer {
                self.timers.cancel(timer);
            }
            self.stats.publishes_confirmed.inc();
            tracing::info!("publish: lease set confirmed by {}", done.floodfill);
            return vec![DestinationEffect::Emit(DestinationEvent::LeaseSetPublished {
                floodfill: done.floodfill,
            })];
        }
        if !self.garlic.handle_delivery_status(status.msg_id) {
            self.stats.dropped_unmatched_status.inc();
            tracing::debug!("dispatch: unmatched delivery status {}", status.msg_id);
        }
        Vec::new()
    }

    /// Non-expired own lease set and at least one outbound tunnel.
    pub fn is_ready(&self) -> bool {
        self.lease_set
            .as_ref()
            .is_some_and(|ls| ls.has_non_expired_leases(now_ms()))
            && !self.pool.outbound_tunnels().is_empty()
    }

    // ── Lookups ──────────────────────────────────────────────────────

    pub(crate) fn request_destination(
        &mut self,
        target: IdentHash,
        waiter: LookupWaiter,
        now: Instant,
    ) -> Vec<DestinationEffect> {
        if !self.lookups.is_pending(&target) && !self.has_lookup_tunnels() {
            tracing::debug!("lookup: no tunnels, {target} not found");
            self.stats.lookups_not_found.inc();
            return self.resume(target, waiter, None);
        }
        if self.lookups.request(target, waiter, now) {
            self.stats.lookups_started.inc();
            tracing::debug!("lookup: requesting {target}");
            self.lookup_round(target, now, false)
        } else {
            self.stats.lookups_joined.inc();
            Vec::new()
        }
    }

    fn has_lookup_tunnels(&self) -> bool {
        !self.pool.inbound_tunnels().is_empty() && !self.pool.outbound_tunnels().is_empty()
    }

    /// Query the next batch of directory nodes and arm the round timer.
    ///
    /// A `hinted` round comes from a search reply while other queries are
    /// still out. It never resolves the request: if it has nobody new to
    /// ask, the running round timer stays armed and decides.
    fn lookup_round(&mut self, target: IdentHash, now: Instant, hinted: bool) -> Vec<DestinationEffect> {
        let Some(started_at) = self.lookups.get(&target).map(|r| r.started_at) else {
            return Vec::new();
        };
        let deadline = started_at + self.config.max_lookup_time;
        if now >= deadline {
            if hinted {
                return Vec::new();
            }
            tracing::info!("lookup: {target} not found in time");
            return self.finish_lookup(target, None);
        }
        let (Some(inbound), Some(outbound)) =
            (self.pool.next_inbound_tunnel(), self.pool.next_outbound_tunnel())
        else {
            if hinted {
                return Vec::new();
            }
            tracing::debug!("lookup: tunnels gone, {target} not found");
            return self.finish_lookup(target, None);
        };

        let floodfills = self.lookups.next_round(&target, self.netdb.as_ref());
        if floodfills.is_empty() {
            if hinted {
                tracing::debug!("lookup: no new floodfills for {target}, waiting on round");
                return Vec::new();
            }
            tracing::info!("lookup: no more floodfills for {target}");
            return self.finish_lookup(target, None);
        }

        let mut excluded: Vec<IdentHash> = self
            .lookups
            .get(&target)
            .map(|r| r.excluded.iter().copied().collect())
            .unwrap_or_default();
        excluded.sort();
        let from = ReplyPath {
            gateway: inbound.gateway,
            tunnel_id: inbound.tunnel_id,
        };

        let mut effects = Vec::with_capacity(floodfills.len());
        for floodfill in floodfills {
            let reply_key: [u8; 32] = rand::random();
            let reply_tag: SessionTag = rand::random();
            self.garlic.submit_session_key(reply_key, reply_tag);
            self.stats.lookup_messages_sent.inc();
            effects.push(DestinationEffect::Send(OutboundMessage {
                outbound_tunnel: outbound.tunnel_id,
                router: floodfill,
                tunnel: None,
                message: NetMessage::DatabaseLookup(DatabaseLookup {
                    key: target,
                    from,
                    excluded: excluded.clone(),
                    reply_key,
                    reply_tag,
                }),
            }));
        }
        tracing::debug!("lookup: asked {} floodfills for {target}", effects.len());

        if let Some(previous) = self.lookups.get(&target).and_then(|r| r.timer) {
            self.timers.cancel(previous);
        }
        let timer = self.timers.schedule(
            (now + self.config.lookup_round_timeout).min(deadline),
            TimerKind::LookupRound(target),
        );
        self.lookups.set_timer(&target, timer);
        effects
    }

    fn on_lookup_timeout(&mut self, target: IdentHash, timer: TimerId, now: Instant) -> Vec<DestinationEffect> {
        match self.lookups.on_timeout(&target, timer, now) {
            TimeoutAction::Stale => Vec::new(),
            TimeoutAction::Retry => {
                tracing::debug!("lookup: round for {target} timed out, retrying");
                self.lookup_round(target, now, false)
            }
            TimeoutAction::Expired => {
                tracing::info!("lookup: {target} not found in time");
                self.finish_lookup(target, None)
            }
        }
    }

    /// Discard the request and answer every waiter with `result`.
    fn finish_lookup(&mut self, target: IdentHash, result: Option<Arc<LeaseSet>>) -> Vec<DestinationEffect> {
        let Some(request) = self.lookups.complete(&target) else {
            return Vec::new();
        };
        if let Some(timer) = request.timer {
            self.timers.cancel(timer);
        }

        let mut effects = Vec::with_capacity(request.waiters.len() + 1);
        if result.is_some() {
            self.stats.lookups_resolved.inc();
            effects.push(DestinationEffect::Emit(DestinationEvent::LeaseSetResolved {
                ident: target,
            }));
        } else {
            self.stats.lookups_not_found.inc();
            effects.push(DestinationEffect::Emit(DestinationEvent::LookupFailed {
                ident: target,
            }));
        }
        for waiter in request.waiters {
            effects.extend(self.resume(target, waiter, result.clone()));
        }
        effects
    }

    fn resume(
        &mut self,
        target: IdentHash,
        waiter: LookupWaiter,
        result: Option<Arc<LeaseSet>>,
    ) -> Vec<DestinationEffect> {
        match waiter {
            LookupWaiter::Notify(reply) => vec![DestinationEffect::ResolveLookup { reply, result }],
            LookupWaiter::Stream { port, reply } => {
                let result = match result {
                    Some(remote) => self.open_stream(remote.ident_hash(), port),
                    None => Err(DestinationError::NotFound { ident: target }),
                };
                vec![DestinationEffect::StreamReady { reply, result }]
            }
            LookupWaiter::Send(data) => match result {
                Some(remote) => self.send_data(data, &remote),
                None => {
                    self.stats.dropped_outbound.inc();
                    tracing::debug!("dispatch: dropping data for unreachable {target}");
                    Vec::new()
                }
            },
        }
    }

    /// Remove the request; its waiters are dropped unanswered.
    pub fn cancel_destination_request(&mut self, target: &IdentHash) {
        if let Some(request) = self.lookups.complete(target) {
            if let Some(timer) = request.timer {
                self.timers.cancel(timer);
            }
            tracing::debug!(
                "lookup: cancelled request for {target} ({} waiters)",
                request.waiters.len()
            );
        }
    }

    /// Cached lease set, else the local directory's copy (which is cached).
    pub fn find_lease_set(&mut self, target: &IdentHash, now: Instant) -> Option<Arc<LeaseSet>> {
        if let Some(found) = self.repository.find(target, now, now_ms()) {
            return Some(found);
        }
        let local = self.netdb.find_lease_set(target)?;
        match self.repository.insert(target, local, now) {
            Ok(ls) if ls.has_non_expired_leases(now_ms()) => Some(ls),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!("repository: local lease set for {target} rejected: {e}");
                None
            }
        }
    }

    pub fn submit_session_key(&mut self, key: [u8; 32], tag: SessionTag) {
        self.garlic.submit_session_key(key, tag);
    }

    // ── Inbound dispatch ─────────────────────────────────────────────

    pub fn handle_message(&mut self, message: NetMessage, now: Instant) -> Vec<DestinationEffect> {
        match message {
            NetMessage::DatabaseStore(store) => self.handle_database_store(store, now),
            NetMessage::DatabaseSearchReply(reply) => self.handle_search_reply(reply, now),
            NetMessage::DeliveryStatus(status) => self.handle_delivery_status(status),
            NetMessage::Data(data) => {
                self.handle_data(&data);
                Vec::new()
            }
            NetMessage::Garlic(data) => self.handle_garlic(&data, now),
            other => {
                self.stats.dropped_unexpected.inc();
                tracing::debug!("dispatch: unexpected {} message", other.kind());
                Vec::new()
            }
        }
    }

    fn handle_database_store(&mut self, store: DatabaseStore, now: Instant) -> Vec<DestinationEffect> {
        let key = store.key;
        if !store.lease_set.has_non_expired_leases(now_ms()) {
            self.stats.dropped_invalid_lease_set.inc();
            tracing::debug!("dispatch: expired lease set for {key}");
            return Vec::new();
        }
        match self.repository.insert(&key, store.lease_set, now) {
            Ok(lease_set) => {
                tracing::debug!("dispatch: lease set for {key} stored");
                self.finish_lookup(key, Some(lease_set))
            }
            Err(e) => {
                self.stats.dropped_invalid_lease_set.inc();
                tracing::warn!("dispatch: rejected lease set for {key}: {e}");
                Vec::new()
            }
        }
    }

    fn handle_search_reply(&mut self, reply: DatabaseSearchReply, now: Instant) -> Vec<DestinationEffect> {
        let key = reply.key;
        if !self.lookups.add_hints(&key, &reply.peers, self.netdb.as_ref()) {
            self.stats.dropped_late_reply.inc();
            tracing::debug!("dispatch: search reply for {key} without a request");
            return Vec::new();
        }
        tracing::debug!(
            "lookup: {} suggested {} peers for {key}",
            reply.from,
            reply.peers.len()
        );
        self.lookup_round(key, now, true)
    }

    fn handle_data(&mut self, data: &[u8]) {
        let message = match DataMessage::decode(data) {
            Ok(m) => m,
            Err(e) => {
                self.stats.dropped_malformed.inc();
                tracing::debug!("dispatch: {e}");
                return;
            }
        };
        let (protocol, port) = (message.protocol, message.destination_port);
        match self.handlers.dispatch(message) {
            DispatchResult::Delivered => {}
            DispatchResult::NoHandler => {
                self.stats.dropped_unknown_protocol.inc();
                tracing::debug!("dispatch: no handler for protocol {protocol} port {port}");
            }
            DispatchResult::Rejected(e) => {
                self.stats.dropped_malformed.inc();
                tracing::debug!("dispatch: protocol {protocol} handler rejected data: {e}");
            }
        }
    }

    fn handle_garlic(&mut self, data: &[u8], now: Instant) -> Vec<DestinationEffect> {
        let cloves = match self.garlic.decrypt(data) {
            Ok(cloves) => cloves,
            Err(e) => {
                self.stats.dropped_undecryptable.inc();
                tracing::debug!("dispatch: can't decrypt garlic: {e}");
                return Vec::new();
            }
        };
        let mut effects = Vec::new();
        for clove in cloves {
            if matches!(clove, NetMessage::Garlic(_)) {
                self.stats.dropped_unexpected.inc();
                tracing::debug!("dispatch: nested garlic dropped");
                continue;
            }
            effects.extend(self.handle_message(clove, now));
        }
        effects
    }

    // ── Outbound application data ────────────────────────────────────

    /// Route data queued by a handler, looking up its target if needed.
    pub fn handle_outbound(&mut self, data: OutboundData, now: Instant) -> Vec<DestinationEffect> {
        match self.find_lease_set(&data.target, now) {
            Some(remote) => self.send_data(data, &remote),
            None => self.request_destination(data.target, LookupWaiter::Send(data), now),
        }
    }

    /// Garlic-wrap `data` (with our lease set, so the remote can answer)
    /// and send it to one of the remote's live leases.
    fn send_data(&mut self, data: OutboundData, remote: &LeaseSet) -> Vec<DestinationEffect> {
        let leases = remote.non_expired_leases(now_ms());
        if leases.is_empty() {
            self.stats.dropped_outbound.inc();
            tracing::debug!("dispatch: no live leases for {}", data.target);
            return Vec::new();
        }
        let lease = *leases[rand::random_range(0..leases.len())];
        let Some(outbound) = self.pool.next_outbound_tunnel() else {
            self.stats.dropped_outbound.inc();
            tracing::debug!("dispatch: no outbound tunnels, dropping data for {}", data.target);
            return Vec::new();
        };

        let mut cloves = Vec::with_capacity(2);
        if let Some(own) = &self.lease_set {
            cloves.push(NetMessage::DatabaseStore(DatabaseStore {
                key: self.ident,
                lease_set: (**own).clone(),
                reply_token: 0,
                reply: None,
            }));
        }
        cloves.push(NetMessage::Data(data.message.encode()));

        match self.garlic.encrypt(&remote.encryption_key, &cloves) {
            Ok(bundle) => vec![DestinationEffect::Send(OutboundMessage {
                outbound_tunnel: outbound.tunnel_id,
                router: lease.gateway,
                tunnel: Some(lease.tunnel_id),
                message: NetMessage::Garlic(bundle),
            })],
            Err(e) => {
                self.stats.dropped_outbound.inc();
                tracing::warn!("dispatch: can't encrypt data for {}: {e}", data.target);
                Vec::new()
            }
        }
    }

    // ── Protocol handlers ────────────────────────────────────────────

    pub fn create_streaming_destination(&mut self, port: u16) -> Arc<StreamingDestination> {
        if let Some(existing) = self.streaming.get(&port) {
            return Arc::clone(existing);
        }
        let dest = Arc::new(StreamingDestination::new(
            self.ident,
            port,
            self.outbound_tx.clone(),
        ));
        self.handlers
            .register(PROTOCOL_TYPE_STREAMING, port, dest.clone());
        self.streaming.insert(port, Arc::clone(&dest));
        tracing::debug!("destination: streaming handler on port {port}");
        dest
    }

    fn open_stream(&self, remote: IdentHash, port: u16) -> Result<Stream, DestinationError> {
        let default = self
            .streaming
            .get(&0)
            .ok_or(DestinationError::NoStreamingDestination { port: 0 })?;
        default.create_stream(remote, port)
    }

    fn create_stream(
        &mut self,
        target: IdentHash,
        port: u16,
        reply: oneshot::Sender<Result<Stream, DestinationError>>,
        now: Instant,
    ) -> Vec<DestinationEffect> {
        if !self.streaming.contains_key(&0) {
            return vec![DestinationEffect::StreamReady {
                reply,
                result: Err(DestinationError::NoStreamingDestination { port: 0 }),
            }];
        }
        match self.find_lease_set(&target, now) {
            Some(remote) => vec![DestinationEffect::StreamReady {
                reply,
                result: self.open_stream(remote.ident_hash(), port),
            }],
            None => self.request_destination(target, LookupWaiter::Stream { port, reply }, now),
        }
    }

    fn create_stream_to(&mut self, remote: LeaseSet, port: u16, now: Instant) -> Result<Stream, DestinationError> {
        let ident = remote.ident_hash();
        self.repository.insert(&ident, remote, now)?;
        self.open_stream(ident, port)
    }

    fn create_datagram_destination(&mut self, sink: mpsc::Sender<Datagram>) -> Arc<DatagramDestination> {
        if let Some(existing) = &self.datagram {
            existing.set_sink(sink);
            return Arc::clone(existing);
        }
        let dest = Arc::new(DatagramDestination::new(
            self.keys.clone(),
            self.outbound_tx.clone(),
            sink,
        ));
        self.handlers
            .register(PROTOCOL_TYPE_DATAGRAM, 0, dest.clone());
        self.handlers.register(PROTOCOL_TYPE_RAW, 0, dest.clone());
        self.datagram = Some(Arc::clone(&dest));
        dest
    }

    // ── Timers ───────────────────────────────────────────────────────

    /// Fire every timer due at `now`.
    pub fn tick_timers(&mut self, now: Instant) -> Vec<DestinationEffect> {
        let mut effects = Vec::new();
        for (id, kind) in self.timers.pop_expired(now) {
            match kind {
                TimerKind::LookupRound(target) => {
                    effects.extend(self.on_lookup_timeout(target, id, now));
                }
                TimerKind::PublishConfirmation => effects.extend(self.on_publish_timeout(id, now)),
                TimerKind::Cleanup => self.tick_cleanup(now),
                TimerKind::LeaseRefresh => effects.extend(self.tick_lease_refresh(now)),
            }
        }
        effects
    }

    /// Purge stale remote lease sets and expired session tags.
    fn tick_cleanup(&mut self, now: Instant) {
        let purged = self
            .repository
            .cleanup(now, now_ms(), self.config.cleanup_interval);
        let tags = self.garlic.cleanup_expired_tags(now);
        if purged > 0 || tags > 0 {
            tracing::debug!("destination: cleanup removed {purged} lease sets, {tags} session tags");
        }
        self.timers
            .schedule(now + self.config.cleanup_interval, TimerKind::Cleanup);
    }

    /// Rebuild the lease set when its newest lease is about to expire.
    fn tick_lease_refresh(&mut self, now: Instant) -> Vec<DestinationEffect> {
        self.timers
            .schedule(now + self.config.refresh_check_interval, TimerKind::LeaseRefresh);
        let threshold = self.config.refresh_threshold.as_millis() as u64;
        let due = match &self.lease_set {
            Some(ls) => ls.latest_expiry().saturating_sub(now_ms()) < threshold,
            None => true,
        };
        if due {
            self.handle_lease_set_updated(now)
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryNetDb;
    use crate::garlic::{seal_ephemeral, SessionGarlic};
    use crate::identity::EncryptionKeys;
    use crate::tunnel::{OutboundTunnel, StaticTunnelPool, TunnelPoolConfig};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::time::Duration;

    fn h(b: u8) -> IdentHash {
        IdentHash::from_bytes([b; 32])
    }

    fn keys(seed: u64) -> PrivateKeys {
        let mut rng = StdRng::seed_from_u64(seed);
        PrivateKeys::from_seeds(rng.random(), rng.random())
    }

    fn hour_from_now() -> u64 {
        now_ms() + 3_600_000
    }

    fn inbound(id: u32) -> InboundTunnel {
        InboundTunnel {
            gateway: h(0xA0 + id as u8),
            tunnel_id: id,
            expires_at: hour_from_now(),
        }
    }

    fn outbound(id: u32) -> OutboundTunnel {
        OutboundTunnel {
            tunnel_id: 100 + id,
            endpoint: h(0xB0),
            expires_at: hour_from_now(),
        }
    }

    struct Fixture {
        state: DestinationState,
        pool: Arc<StaticTunnelPool>,
        netdb: Arc<MemoryNetDb>,
        _outbound_rx: mpsc::UnboundedReceiver<OutboundData>,
    }

    fn fixture(config: DestinationConfig, floodfills: u8) -> Fixture {
        let pool = Arc::new(StaticTunnelPool::new(TunnelPoolConfig::default()));
        pool.set_inbound(vec![inbound(1), inbound(2)]);
        pool.set_outbound(vec![outbound(1)]);
        let netdb = Arc::new(MemoryNetDb::new());
        for b in 1..=floodfills {
            netdb.add_router(h(b), true);
        }
        let encryption = EncryptionKeys::from_secret([7; 32]);
        let encryption_key = encryption.public_key();
        let (tx, rx) = mpsc::unbounded_channel();
        let state = DestinationState::new(
            keys(1),
            config,
            pool.clone(),
            netdb.clone(),
            Box::new(SessionGarlic::new(encryption)),
            encryption_key,
            tx,
        );
        Fixture {
            state,
            pool,
            netdb,
            _outbound_rx: rx,
        }
    }

    fn sends(effects: &[DestinationEffect]) -> Vec<&OutboundMessage> {
        effects
            .iter()
            .filter_map(|e| match e {
                DestinationEffect::Send(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    fn remote_lease_set(seed: u64) -> LeaseSet {
        let lease = Lease {
            gateway: h(0xCC),
            tunnel_id: 9,
            expires_at: hour_from_now(),
        };
        LeaseSet::build(&keys(seed), [3; 32], vec![lease]).unwrap()
    }

    fn store_token(message: &OutboundMessage) -> u32 {
        match &message.message {
            NetMessage::DatabaseStore(store) => store.reply_token,
            other => panic!("expected DatabaseStore, got {}", other.kind()),
        }
    }

    // ── Publishing ───────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn start_publishes_and_confirmation_completes_cycle() {
        let mut f = fixture(DestinationConfig::new().public(true), 3);
        let effects = f.state.start(Instant::now());

        assert!(f.pool.is_active());
        let sent = sends(&effects);
        assert_eq!(sent.len(), 1);
        let token = store_token(sent[0]);
        assert_ne!(token, 0);
        assert_eq!(f.state.lease_set().unwrap().leases.len(), 2);
        assert!(f.state.is_ready());

        let effects = f.state.handle_delivery_status(DeliveryStatus {
            msg_id: token,
            timestamp: 0,
        });
        assert!(matches!(
            effects[0],
            DestinationEffect::Emit(DestinationEvent::LeaseSetPublished { .. })
        ));
        assert_eq!(f.state.stats().publishes_confirmed.get(), 1);

        // Nothing left to retry
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(sends(&f.state.tick_timers(Instant::now())).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_publish_retries_other_floodfill() {
        let mut f = fixture(DestinationConfig::new().public(true), 3);
        let first = sends(&f.state.start(Instant::now()))[0].router;

        tokio::time::advance(Duration::from_secs(5)).await;
        let effects = f.state.tick_timers(Instant::now());
        let retry = sends(&effects);
        assert_eq!(retry.len(), 1);
        assert_ne!(retry[0].router, first);
        assert_eq!(f.state.stats().publish_timeouts.get(), 1);
    }

    #[test]
    fn private_destination_never_publishes() {
        let mut f = fixture(DestinationConfig::new(), 3);
        let effects = f.state.start(Instant::now());
        assert!(sends(&effects).is_empty());
        assert!(f.state.lease_set().is_some());
    }

    #[test]
    fn publish_skipped_without_outbound_tunnels() {
        let mut f = fixture(DestinationConfig::new().public(true), 3);
        f.pool.set_outbound(Vec::new());
        let effects = f.state.start(Instant::now());
        assert!(sends(&effects).is_empty());
        assert!(!f.state.is_ready());
    }

    #[test]
    fn unchanged_pool_is_not_republished() {
        let mut f = fixture(DestinationConfig::new().public(true), 3);
        f.state.start(Instant::now());
        assert!(f.state.handle_lease_set_updated(Instant::now()).is_empty());

        f.pool.set_inbound(vec![inbound(3)]);
        let effects = f.state.handle_lease_set_updated(Instant::now());
        assert_eq!(sends(&effects).len(), 1);
    }

    #[test]
    fn stale_confirmation_after_pool_change_is_ignored() {
        let mut f = fixture(DestinationConfig::new().public(true), 3);
        let old_token = store_token(sends(&f.state.start(Instant::now()))[0]);
        f.pool.set_inbound(vec![inbound(3)]);
        f.state.handle_lease_set_updated(Instant::now());

        f.state.handle_delivery_status(DeliveryStatus {
            msg_id: old_token,
            timestamp: 0,
        });
        assert_eq!(f.state.stats().publishes_confirmed.get(), 0);
        assert_eq!(f.state.stats().dropped_unmatched_status.get(), 1);
    }

    #[test]
    fn no_inbound_tunnels_no_lease_set() {
        let mut f = fixture(DestinationConfig::new().public(true), 3);
        f.pool.set_inbound(Vec::new());
        assert!(sends(&f.state.start(Instant::now())).is_empty());
        assert!(f.state.lease_set().is_none());
        assert!(!f.state.is_ready());
    }

    // ── Lookups ──────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn lookup_rounds_then_not_found() {
        let mut f = fixture(DestinationConfig::new(), 100);
        f.state.start(Instant::now());
        let (tx, mut rx) = oneshot::channel();

        let first = f
            .state
            .handle_command(DestinationCommand::RequestDestination { target: h(0), reply: tx }, Instant::now());
        let first: Vec<_> = sends(&first).iter().map(|m| m.router).collect();
        assert_eq!(first.len(), MAX_NUM_FLOODFILLS_PER_REQUEST);

        tokio::time::advance(Duration::from_secs(5)).await;
        let second = f.state.tick_timers(Instant::now());
        let second = sends(&second);
        assert_eq!(second.len(), MAX_NUM_FLOODFILLS_PER_REQUEST);
        for message in &second {
            assert!(!first.contains(&message.router));
            let NetMessage::DatabaseLookup(lookup) = &message.message else {
                panic!("expected lookup");
            };
            assert!(first.iter().all(|n| lookup.excluded.contains(n)));
        }

        let mut resolved = None;
        for _ in 0..7 {
            tokio::time::advance(Duration::from_secs(5)).await;
            for effect in f.state.tick_timers(Instant::now()) {
                if let DestinationEffect::ResolveLookup { reply, result } = effect {
                    resolved = Some(result);
                    let _ = reply.send(None);
                }
            }
        }
        assert_eq!(resolved, Some(None));
        assert!(rx.try_recv().is_ok());
        assert_eq!(f.state.stats().lookups_not_found.get(), 1);
    }

    fn resolved(effects: Vec<DestinationEffect>) -> Vec<Option<Arc<LeaseSet>>> {
        effects
            .into_iter()
            .filter_map(|e| match e {
                DestinationEffect::ResolveLookup { result, .. } => Some(result),
                _ => None,
            })
            .collect()
    }

    fn store(lease_set: LeaseSet) -> NetMessage {
        NetMessage::DatabaseStore(DatabaseStore {
            key: lease_set.ident_hash(),
            lease_set,
            reply_token: 0,
            reply: None,
        })
    }

    fn empty_search_reply(key: IdentHash, from: IdentHash) -> NetMessage {
        NetMessage::DatabaseSearchReply(DatabaseSearchReply {
            key,
            peers: Vec::new(),
            from,
        })
    }

    #[test]
    fn joined_requests_share_one_flow() {
        let mut f = fixture(DestinationConfig::new(), 10);
        f.state.start(Instant::now());
        let remote = remote_lease_set(9);
        let key = remote.ident_hash();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();

        let a = f.state.request_destination(key, LookupWaiter::Notify(tx1), Instant::now());
        let b = f.state.request_destination(key, LookupWaiter::Notify(tx2), Instant::now());
        assert_eq!(sends(&a).len(), MAX_NUM_FLOODFILLS_PER_REQUEST);
        assert!(b.is_empty());
        assert_eq!(f.state.stats().lookups_started.get(), 1);
        assert_eq!(f.state.stats().lookups_joined.get(), 1);

        let results = resolved(f.state.handle_message(store(remote), Instant::now()));
        assert_eq!(results.len(), 2);
        let (Some(first), Some(second)) = (&results[0], &results[1]) else {
            panic!("both waiters should get the lease set");
        };
        assert!(Arc::ptr_eq(first, second));
        assert!(!f.state.lookups.is_pending(&key));
        assert_eq!(f.state.num_remote_lease_sets(), 1);
    }

    #[test]
    fn negative_reply_keeps_round_waiting_for_others() {
        let mut f = fixture(DestinationConfig::new(), 7);
        let remote = remote_lease_set(9);
        let key = remote.ident_hash();
        let (tx, _rx) = oneshot::channel();

        let first = f.state.request_destination(key, LookupWaiter::Notify(tx), Instant::now());
        assert_eq!(sends(&first).len(), 7);

        // Every floodfill was asked, so the reply has nobody new to offer
        let effects = f.state.handle_message(empty_search_reply(key, h(1)), Instant::now());
        assert!(effects.is_empty());
        assert!(f.state.lookups.is_pending(&key));
        assert!(f.state.next_deadline().is_some());
        assert_eq!(f.state.stats().lookups_not_found.get(), 0);

        let results = resolved(f.state.handle_message(store(remote), Instant::now()));
        assert!(matches!(results.as_slice(), [Some(_)]));
        assert_eq!(f.state.stats().lookups_resolved.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_round_resolves_on_its_timer() {
        let mut f = fixture(DestinationConfig::new(), 7);
        let (tx, _rx) = oneshot::channel();
        f.state.request_destination(h(0), LookupWaiter::Notify(tx), Instant::now());
        f.state.handle_message(empty_search_reply(h(0), h(1)), Instant::now());

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(resolved(f.state.tick_timers(Instant::now())).is_empty());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(resolved(f.state.tick_timers(Instant::now())), vec![None]);
        assert_eq!(f.state.stats().lookups_not_found.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn search_reply_near_cap_does_not_extend_lookup() {
        let mut f = fixture(DestinationConfig::new(), 200);
        let (tx, _rx) = oneshot::channel();
        let started = Instant::now();
        f.state.request_destination(h(0), LookupWaiter::Notify(tx), started);

        for _ in 0..7 {
            tokio::time::advance(Duration::from_secs(5)).await;
            assert!(resolved(f.state.tick_timers(Instant::now())).is_empty());
        }
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(resolved(f.state.tick_timers(Instant::now())).is_empty());

        // 39 s in: the reply starts a round, but its timer is clamped to the cap
        let effects = f.state.handle_message(empty_search_reply(h(0), h(1)), Instant::now());
        assert_eq!(sends(&effects).len(), MAX_NUM_FLOODFILLS_PER_REQUEST);
        assert_eq!(f.state.next_deadline(), Some(started + Duration::from_secs(40)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(resolved(f.state.tick_timers(Instant::now())), vec![None]);
        assert!(!f.state.lookups.is_pending(&h(0)));
    }

    #[test]
    fn lookup_without_tunnels_fails_immediately() {
        let mut f = fixture(DestinationConfig::new(), 10);
        f.pool.set_outbound(Vec::new());
        let (tx, _rx) = oneshot::channel();
        let effects = f.state.request_destination(h(0), LookupWaiter::Notify(tx), Instant::now());
        assert!(matches!(
            effects[0],
            DestinationEffect::ResolveLookup { result: None, .. }
        ));
        assert!(!f.state.lookups.is_pending(&h(0)));
    }

    #[test]
    fn search_reply_triggers_round_with_hints() {
        let mut f = fixture(DestinationConfig::new(), 10);
        f.netdb.add_router(h(0xEE), true);
        let (tx, _rx) = oneshot::channel();
        f.state.request_destination(h(0), LookupWaiter::Notify(tx), Instant::now());

        let effects = f.state.handle_message(
            NetMessage::DatabaseSearchReply(DatabaseSearchReply {
                key: h(0),
                peers: vec![h(0xEE), h(0xEF)],
                from: h(1),
            }),
            Instant::now(),
        );
        let routers: Vec<_> = sends(&effects).iter().map(|m| m.router).collect();
        assert_eq!(routers[0], h(0xEE));
        assert_eq!(f.netdb.requested_routers(), vec![h(0xEF)]);
    }

    #[test]
    fn late_search_reply_is_a_noop() {
        let mut f = fixture(DestinationConfig::new(), 10);
        let effects = f.state.handle_message(
            NetMessage::DatabaseSearchReply(DatabaseSearchReply {
                key: h(0),
                peers: vec![h(1)],
                from: h(1),
            }),
            Instant::now(),
        );
        assert!(effects.is_empty());
        assert_eq!(f.state.stats().dropped_late_reply.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_timer_fired_never_answers() {
        let mut f = fixture(DestinationConfig::new(), 100);
        let (tx, mut rx) = oneshot::channel();
        f.state.request_destination(h(0), LookupWaiter::Notify(tx), Instant::now());

        tokio::time::advance(Duration::from_secs(5)).await;
        f.state.cancel_destination_request(&h(0));
        assert!(f.state.tick_timers(Instant::now()).is_empty());
        f.state.cancel_destination_request(&h(0));
        assert!(rx.try_recv().is_err());
        assert!(f.state.timers.is_empty());
    }

    #[test]
    fn invalid_store_is_dropped() {
        let mut f = fixture(DestinationConfig::new(), 10);
        let mut forged = remote_lease_set(9);
        forged.leases[0].tunnel_id = 1234;
        let effects = f.state.handle_message(
            NetMessage::DatabaseStore(DatabaseStore {
                key: forged.ident_hash(),
                lease_set: forged,
                reply_token: 0,
                reply: None,
            }),
            Instant::now(),
        );
        assert!(effects.is_empty());
        assert_eq!(f.state.stats().dropped_invalid_lease_set.get(), 1);
        assert_eq!(f.state.num_remote_lease_sets(), 0);
    }

    #[test]
    fn find_lease_set_falls_back_to_netdb() {
        let mut f = fixture(DestinationConfig::new(), 1);
        let remote = remote_lease_set(9);
        let key = remote.ident_hash();
        assert!(f.state.find_lease_set(&key, Instant::now()).is_none());

        f.netdb.store_lease_set(remote);
        assert!(f.state.find_lease_set(&key, Instant::now()).is_some());
        assert_eq!(f.state.num_remote_lease_sets(), 1);
    }

    // ── Data path ────────────────────────────────────────────────────

    #[test]
    fn data_without_handler_is_dropped_and_counted() {
        let mut f = fixture(DestinationConfig::new().default_streaming(false), 1);
        f.state.start(Instant::now());
        let data = DataMessage {
            protocol: PROTOCOL_TYPE_STREAMING,
            source_port: 0,
            destination_port: 0,
            payload: vec![1],
        };
        f.state.handle_message(NetMessage::Data(data.encode()), Instant::now());
        f.state.handle_message(NetMessage::Data(vec![1, 2]), Instant::now());
        assert_eq!(f.state.stats().dropped_unknown_protocol.get(), 1);
        assert_eq!(f.state.stats().dropped_malformed.get(), 1);
    }

    #[tokio::test]
    async fn garlic_cloves_are_dispatched() {
        let mut f = fixture(DestinationConfig::new(), 1);
        f.state.start(Instant::now());
        let (sink, mut datagrams) = mpsc::channel(4);
        f.state.create_datagram_destination(sink);

        let data = DataMessage {
            protocol: PROTOCOL_TYPE_RAW,
            source_port: 1,
            destination_port: 2,
            payload: b"hi".to_vec(),
        };
        let own_key = f.state.encryption_key;
        let bundle = seal_ephemeral(&own_key, &[NetMessage::Data(data.encode())]).unwrap();
        f.state.handle_message(NetMessage::Garlic(bundle), Instant::now());

        assert_eq!(datagrams.recv().await.unwrap().payload, b"hi");
        f.state.handle_message(NetMessage::Garlic(b"\x00\x01\x02".to_vec()), Instant::now());
        assert_eq!(f.state.stats().dropped_undecryptable.get(), 1);
    }

    #[test]
    fn outbound_data_to_known_remote_is_garlic_wrapped() {
        let mut f = fixture(DestinationConfig::new(), 1);
        f.state.start(Instant::now());
        let remote = remote_lease_set(9);
        let key = remote.ident_hash();
        f.netdb.store_lease_set(remote);

        let effects = f.state.handle_outbound(
            OutboundData {
                target: key,
                message: DataMessage {
                    protocol: PROTOCOL_TYPE_RAW,
                    source_port: 0,
                    destination_port: 0,
                    payload: b"x".to_vec(),
                },
            },
            Instant::now(),
        );
        let sent = sends(&effects);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].router, h(0xCC));
        assert_eq!(sent[0].tunnel, Some(9));
        assert!(matches!(sent[0].message, NetMessage::Garlic(_)));
    }

    #[test]
    fn create_stream_without_default_handler_fails() {
        let mut f = fixture(DestinationConfig::new().default_streaming(false), 1);
        f.state.start(Instant::now());
        let (tx, mut rx) = oneshot::channel();
        let effects = f.state.handle_command(
            DestinationCommand::CreateStream {
                target: h(5),
                port: 0,
                reply: tx,
            },
            Instant::now(),
        );
        for effect in effects {
            if let DestinationEffect::StreamReady { reply, result } = effect {
                let _ = reply.send(result);
            }
        }
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(DestinationError::NoStreamingDestination { port: 0 })
        ));
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    #[test]
    fn shutdown_abandons_everything() {
        let mut f = fixture(DestinationConfig::new().public(true), 10);
        f.state.start(Instant::now());
        let (tx, mut rx) = oneshot::channel();
        f.state.request_destination(h(0), LookupWaiter::Notify(tx), Instant::now());

        f.state.shutdown();
        assert!(!f.state.is_running());
        assert!(!f.pool.is_active());
        assert!(f.state.timers.is_empty());
        assert!(f.state.lookups.is_empty());
        assert!(f.state.publish.pending().is_none());
        assert!(rx.try_recv().is_err());
    }
}
