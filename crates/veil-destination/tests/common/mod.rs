//! In-process overlay for integration tests.
//!
//! Every destination's `ChannelTransport` is pumped into a shared
//! `SimNet`. Messages addressed to a floodfill are answered by a tiny
//! directory (store + confirm, lookup + garlic reply); messages sent down
//! a lease's tunnel are handed to the destination owning that gateway.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use veil_destination::{
    now_ms, seal_with_session, ChannelTransport, DatabaseSearchReply, DatabaseStore, Destination,
    DestinationChannels, DestinationConfig, DestinationHandle, DeliveryStatus, IdentHash,
    InboundTunnel, LeaseSet, MemoryNetDb, NetMessage, OutboundMessage, OutboundTunnel,
    PrivateKeys, StaticTunnelPool, TunnelPoolConfig,
};

pub fn h(b: u8) -> IdentHash {
    IdentHash::from_bytes([b; 32])
}

pub fn keys(seed: u8) -> PrivateKeys {
    PrivateKeys::from_seeds([seed; 32], [seed.wrapping_add(100); 32])
}

pub fn pool_with(gateways: &[u8]) -> Arc<StaticTunnelPool> {
    let pool = Arc::new(StaticTunnelPool::new(TunnelPoolConfig::default()));
    let expires_at = now_ms() + 3_600_000;
    pool.set_inbound(
        gateways
            .iter()
            .map(|g| InboundTunnel {
                gateway: h(*g),
                tunnel_id: u32::from(*g),
                expires_at,
            })
            .collect(),
    );
    pool.set_outbound(vec![OutboundTunnel {
        tunnel_id: 1,
        endpoint: h(0xFE),
        expires_at,
    }]);
    pool
}

pub fn netdb_with_floodfills(floodfills: impl IntoIterator<Item = u8>) -> Arc<MemoryNetDb> {
    let netdb = Arc::new(MemoryNetDb::new());
    for b in floodfills {
        netdb.add_router(h(b), true);
    }
    netdb
}

/// Simulated network: floodfills plus tunnel gateways.
#[derive(Default)]
pub struct SimNet {
    floodfills: HashSet<IdentHash>,
    /// Directory contents held by the floodfills.
    store: Mutex<HashMap<IdentHash, LeaseSet>>,
    /// Inbound gateway → destination owning that tunnel.
    gateways: Mutex<HashMap<IdentHash, DestinationHandle>>,
    /// Everything routed through the net, in order.
    log: Mutex<Vec<OutboundMessage>>,
}

impl SimNet {
    pub fn new(floodfills: impl IntoIterator<Item = u8>) -> Arc<Self> {
        Arc::new(Self {
            floodfills: floodfills.into_iter().map(h).collect(),
            ..Default::default()
        })
    }

    /// Start a destination wired into this net.
    pub fn spawn(
        self: &Arc<Self>,
        keys: PrivateKeys,
        config: DestinationConfig,
        gateways: &[u8],
        netdb: Arc<MemoryNetDb>,
    ) -> DestinationChannels {
        let (transport, rx) = ChannelTransport::new();
        let channels = Destination::start(keys, config, pool_with(gateways), netdb, transport);
        {
            let mut map = self.gateways.lock().unwrap();
            for g in gateways {
                map.insert(h(*g), channels.destination.handle());
            }
        }
        tokio::spawn(Arc::clone(self).pump(rx));
        channels
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.log.lock().unwrap().clone()
    }

    pub fn lookups_sent(&self) -> usize {
        self.sent()
            .iter()
            .filter(|m| matches!(m.message, NetMessage::DatabaseLookup(_)))
            .count()
    }

    async fn pump(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<OutboundMessage>) {
        while let Some(message) = rx.recv().await {
            self.log.lock().unwrap().push(message.clone());
            self.route(message).await;
        }
    }

    async fn route(&self, message: OutboundMessage) {
        if message.tunnel.is_some() {
            if let Some(dest) = self.gateway(&message.router) {
                let _ = dest.handle_message(message.message).await;
            }
            return;
        }
        if !self.floodfills.contains(&message.router) {
            return;
        }
        match message.message {
            NetMessage::DatabaseStore(store) => {
                self.store
                    .lock()
                    .unwrap()
                    .insert(store.key, store.lease_set);
                if let (Some(reply), true) = (store.reply, store.reply_token != 0) {
                    if let Some(dest) = self.gateway(&reply.gateway) {
                        let status = DeliveryStatus {
                            msg_id: store.reply_token,
                            timestamp: now_ms(),
                        };
                        let _ = dest.handle_message(NetMessage::DeliveryStatus(status)).await;
                    }
                }
            }
            NetMessage::DatabaseLookup(lookup) => {
                let Some(dest) = self.gateway(&lookup.from.gateway) else {
                    return;
                };
                let found = self.store.lock().unwrap().get(&lookup.key).cloned();
                let reply = match found {
                    Some(lease_set) => NetMessage::DatabaseStore(DatabaseStore {
                        key: lookup.key,
                        lease_set,
                        reply_token: 0,
                        reply: None,
                    }),
                    None => NetMessage::DatabaseSearchReply(DatabaseSearchReply {
                        key: lookup.key,
                        peers: Vec::new(),
                        from: message.router,
                    }),
                };
                let Ok(bundle) = seal_with_session(&lookup.reply_key, &lookup.reply_tag, &[reply])
                else {
                    return;
                };
                let _ = dest.handle_message(NetMessage::Garlic(bundle)).await;
            }
            _ => {}
        }
    }

    fn gateway(&self, ident: &IdentHash) -> Option<DestinationHandle> {
        self.gateways.lock().unwrap().get(ident).cloned()
    }
}
