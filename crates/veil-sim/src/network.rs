//! Simulated overlay: directory nodes and tunnel gateways in one process.
//!
//! Each destination's `ChannelTransport` is pumped into the `Network`.
//! Messages for a directory node are answered like a floodfill would
//! (store + delivery status, lookup + garlic-wrapped reply); messages sent
//! down a lease's tunnel reach the destination owning that gateway.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use veil_destination::{
    now_ms, seal_with_session, ChannelTransport, DatabaseLookup, DatabaseSearchReply,
    DatabaseStore, DeliveryStatus, Destination, DestinationChannels, DestinationConfig,
    DestinationHandle, IdentHash, InboundTunnel, LeaseSet, MemoryNetDb, NetMessage,
    OutboundMessage, OutboundTunnel, PrivateKeys, StaticTunnelPool,
};

const TUNNEL_LIFETIME_MS: u64 = 10 * 60 * 1000;

pub struct Network {
    floodfills: HashSet<IdentHash>,
    netdb: Arc<MemoryNetDb>,
    directory: Mutex<HashMap<IdentHash, LeaseSet>>,
    gateways: Mutex<HashMap<IdentHash, DestinationHandle>>,
    /// Store confirmations still to swallow.
    drop_confirmations: AtomicU32,
    next_gateway: Mutex<u8>,
}

impl Network {
    pub fn new(floodfill_count: u8, drop_confirmations: u32) -> Arc<Self> {
        let netdb = Arc::new(MemoryNetDb::new());
        let mut floodfills = HashSet::new();
        for i in 1..=floodfill_count {
            let ident = IdentHash::from_bytes([i; 32]);
            netdb.add_router(ident, true);
            floodfills.insert(ident);
        }
        Arc::new(Self {
            floodfills,
            netdb,
            directory: Mutex::new(HashMap::new()),
            gateways: Mutex::new(HashMap::new()),
            drop_confirmations: AtomicU32::new(drop_confirmations),
            next_gateway: Mutex::new(0x80),
        })
    }

    /// Start a destination with `inbound` fresh tunnels wired into the net.
    pub fn spawn(
        self: &Arc<Self>,
        keys: PrivateKeys,
        config: DestinationConfig,
        inbound: usize,
    ) -> DestinationChannels {
        let pool = Arc::new(StaticTunnelPool::new(config.tunnels().clone()));
        let expires_at = now_ms() + TUNNEL_LIFETIME_MS;
        let gateways: Vec<IdentHash> = (0..inbound).map(|_| self.allocate_gateway()).collect();
        pool.set_inbound(
            gateways
                .iter()
                .map(|gateway| InboundTunnel {
                    gateway: *gateway,
                    tunnel_id: rand::random(),
                    expires_at,
                })
                .collect(),
        );
        pool.set_outbound(vec![OutboundTunnel {
            tunnel_id: rand::random(),
            endpoint: self.allocate_gateway(),
            expires_at,
        }]);

        let (transport, rx) = ChannelTransport::new();
        let channels = Destination::start(keys, config, pool, self.netdb.clone(), transport);
        {
            let mut map = lock(&self.gateways);
            for gateway in gateways {
                map.insert(gateway, channels.destination.handle());
            }
        }
        tokio::spawn(Arc::clone(self).pump(rx));
        channels
    }

    fn allocate_gateway(&self) -> IdentHash {
        let mut next = lock(&self.next_gateway);
        *next = next.wrapping_add(1);
        let mut bytes = [0xEE; 32];
        bytes[0] = *next;
        IdentHash::from_bytes(bytes)
    }

    async fn pump(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<OutboundMessage>) {
        while let Some(message) = rx.recv().await {
            tracing::debug!(
                "net: {} via tunnel {} to {}",
                message.message.kind(),
                message.outbound_tunnel,
                message.router
            );
            if message.tunnel.is_some() {
                match self.gateway(&message.router) {
                    Some(dest) => {
                        let _ = dest.handle_message(message.message).await;
                    }
                    None => tracing::debug!("net: no destination behind {}", message.router),
                }
                continue;
            }
            if !self.floodfills.contains(&message.router) {
                tracing::debug!("net: {} is not a directory node", message.router);
                continue;
            }
            match message.message {
                NetMessage::DatabaseStore(store) => self.on_store(store).await,
                NetMessage::DatabaseLookup(lookup) => self.on_lookup(message.router, lookup).await,
                other => tracing::debug!("net: directory ignores {}", other.kind()),
            }
        }
    }

    async fn on_store(&self, store: DatabaseStore) {
        if store.lease_set.verify().is_err() {
            tracing::warn!("net: directory rejected lease set for {}", store.key);
            return;
        }
        lock(&self.directory).insert(store.key, store.lease_set);
        tracing::info!("net: directory stored {}", store.key);

        let Some(reply) = store.reply else { return };
        if store.reply_token == 0 {
            return;
        }
        let dropped = self
            .drop_confirmations
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if dropped {
            tracing::info!("net: swallowing confirmation for {}", store.key);
            return;
        }
        if let Some(dest) = self.gateway(&reply.gateway) {
            let status = DeliveryStatus {
                msg_id: store.reply_token,
                timestamp: now_ms(),
            };
            let _ = dest.handle_message(NetMessage::DeliveryStatus(status)).await;
        }
    }

    async fn on_lookup(&self, floodfill: IdentHash, lookup: DatabaseLookup) {
        let Some(dest) = self.gateway(&lookup.from.gateway) else {
            return;
        };
        let found = lock(&self.directory).get(&lookup.key).cloned();
        let reply = match found {
            Some(lease_set) => NetMessage::DatabaseStore(DatabaseStore {
                key: lookup.key,
                lease_set,
                reply_token: 0,
                reply: None,
            }),
            None => {
                let peers: Vec<IdentHash> = self
                    .floodfills
                    .iter()
                    .filter(|f| **f != floodfill && !lookup.excluded.contains(f))
                    .copied()
                    .collect();
                NetMessage::DatabaseSearchReply(DatabaseSearchReply {
                    key: lookup.key,
                    peers,
                    from: floodfill,
                })
            }
        };
        match seal_with_session(&lookup.reply_key, &lookup.reply_tag, &[reply]) {
            Ok(bundle) => {
                let _ = dest.handle_message(NetMessage::Garlic(bundle)).await;
            }
            Err(e) => tracing::warn!("net: can't seal lookup reply: {e}"),
        }
    }

    fn gateway(&self, ident: &IdentHash) -> Option<DestinationHandle> {
        lock(&self.gateways).get(ident).cloned()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
