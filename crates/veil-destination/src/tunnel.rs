//! Tunnel pool seam.
//!
//! Tunnel building and selection live outside the destination. The
//! destination only reads the current inbound/outbound sets (to build its
//! lease set and to pick a path for outgoing messages) and flips the pool's
//! active flag on start/stop.

use std::sync::Mutex;

use crate::lease_set::Lease;
use crate::types::{IdentHash, TunnelId};

/// Inbound tunnel: traffic enters at `gateway` and reaches us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundTunnel {
    pub gateway: IdentHash,
    pub tunnel_id: TunnelId,
    /// Unix milliseconds.
    pub expires_at: u64,
}

impl InboundTunnel {
    pub fn to_lease(&self) -> Lease {
        Lease {
            gateway: self.gateway,
            tunnel_id: self.tunnel_id,
            expires_at: self.expires_at,
        }
    }
}

/// Outbound tunnel: we inject at our side, it exits at `endpoint`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboundTunnel {
    pub tunnel_id: TunnelId,
    pub endpoint: IdentHash,
    /// Unix milliseconds.
    pub expires_at: u64,
}

/// Tunnel pool parameters requested by a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelPoolConfig {
    pub inbound_length: usize,
    pub outbound_length: usize,
    pub inbound_quantity: usize,
    pub outbound_quantity: usize,
    /// Fixed hop list; overrides automatic peer selection when set.
    pub explicit_peers: Option<Vec<IdentHash>>,
}

impl Default for TunnelPoolConfig {
    fn default() -> Self {
        Self {
            inbound_length: 3,
            outbound_length: 3,
            inbound_quantity: 5,
            outbound_quantity: 5,
            explicit_peers: None,
        }
    }
}

/// Shared tunnel pool owned by the tunnel subsystem.
///
/// Implementations are internally synchronized; the destination calls
/// these from its event loop only.
pub trait TunnelPool: Send + Sync {
    /// Currently established inbound tunnels.
    fn inbound_tunnels(&self) -> Vec<InboundTunnel>;

    /// Currently established outbound tunnels.
    fn outbound_tunnels(&self) -> Vec<OutboundTunnel>;

    /// Next inbound tunnel to use as a reply path.
    fn next_inbound_tunnel(&self) -> Option<InboundTunnel> {
        self.inbound_tunnels().into_iter().next()
    }

    /// Next outbound tunnel to send through.
    fn next_outbound_tunnel(&self) -> Option<OutboundTunnel> {
        self.outbound_tunnels().into_iter().next()
    }

    /// Start or stop maintaining tunnels for this destination.
    fn set_active(&self, active: bool);
}

/// Tunnel pool with a fixed, externally updated set of tunnels.
///
/// Used by the simulator and tests; the embedding router updates the sets
/// and then signals the destination with `set_lease_set_updated`.
#[derive(Debug, Default)]
pub struct StaticTunnelPool {
    config: TunnelPoolConfig,
    inner: Mutex<StaticPoolInner>,
}

#[derive(Debug, Default)]
struct StaticPoolInner {
    inbound: Vec<InboundTunnel>,
    outbound: Vec<OutboundTunnel>,
    active: bool,
    /// Round-robin cursor for outbound selection.
    next_outbound: usize,
}

impl StaticTunnelPool {
    pub fn new(config: TunnelPoolConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(StaticPoolInner::default()),
        }
    }

    pub fn config(&self) -> &TunnelPoolConfig {
        &self.config
    }

    pub fn set_inbound(&self, tunnels: Vec<InboundTunnel>) {
        self.lock().inbound = tunnels;
    }

    pub fn set_outbound(&self, tunnels: Vec<OutboundTunnel>) {
        self.lock().outbound = tunnels;
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StaticPoolInner> {
        // A poisoned pool still holds consistent tunnel lists
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TunnelPool for StaticTunnelPool {
    fn inbound_tunnels(&self) -> Vec<InboundTunnel> {
        self.lock().inbound.clone()
    }

    fn outbound_tunnels(&self) -> Vec<OutboundTunnel> {
        self.lock().outbound.clone()
    }

    fn next_outbound_tunnel(&self) -> Option<OutboundTunnel> {
        let mut inner = self.lock();
        if inner.outbound.is_empty() {
            return None;
        }
        let idx = inner.next_outbound % inner.outbound.len();
        inner.next_outbound = inner.next_outbound.wrapping_add(1);
        Some(inner.outbound[idx])
    }

    fn set_active(&self, active: bool) {
        self.lock().active = active;
    }
}
