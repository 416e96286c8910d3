//! Lease sets: signed reachability descriptors.
//!
//! A lease set lists the inbound tunnel gateways a destination can
//! currently be reached through, each with an expiry, plus the ephemeral
//! encryption key senders should garlic-encrypt to.

use serde::{Deserialize, Serialize};

use crate::error::DestinationError;
use crate::identity::{PrivateKeys, PublicIdentity};
use crate::types::{IdentHash, TunnelId};

/// Maximum number of leases carried in one lease set.
pub const MAX_NUM_LEASES: usize = 16;

/// One inbound tunnel entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Router hosting the tunnel gateway.
    pub gateway: IdentHash,
    /// Tunnel id at the gateway.
    pub tunnel_id: TunnelId,
    /// Expiry, Unix milliseconds.
    pub expires_at: u64,
}

/// Signed descriptor of a destination's current leases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseSet {
    pub identity: PublicIdentity,
    /// Ephemeral X25519 key for garlic encryption.
    pub encryption_key: [u8; 32],
    pub leases: Vec<Lease>,
    /// Ed25519 signature over `signing_bytes()`.
    pub signature: Vec<u8>,
}

#[derive(Serialize)]
struct SignableLeaseSet<'a> {
    identity: &'a PublicIdentity,
    encryption_key: &'a [u8; 32],
    leases: &'a [Lease],
}

impl LeaseSet {
    /// Build and sign a lease set for a local destination.
    ///
    /// Requires at least one lease; extra leases beyond
    /// [`MAX_NUM_LEASES`] are dropped.
    pub fn build(
        keys: &PrivateKeys,
        encryption_key: [u8; 32],
        mut leases: Vec<Lease>,
    ) -> Result<Self, DestinationError> {
        if leases.is_empty() {
            return Err(DestinationError::NoTunnels {
                reason: "no inbound tunnels for lease set".into(),
            });
        }
        leases.truncate(MAX_NUM_LEASES);

        let mut lease_set = Self {
            identity: *keys.identity(),
            encryption_key,
            leases,
            signature: Vec::new(),
        };
        lease_set.signature = keys.sign(&lease_set.signing_bytes());
        Ok(lease_set)
    }

    /// Identity hash of the owning destination (the directory key).
    pub fn ident_hash(&self) -> IdentHash {
        self.identity.hash()
    }

    /// Canonical bytes covered by the signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let signable = SignableLeaseSet {
            identity: &self.identity,
            encryption_key: &self.encryption_key,
            leases: &self.leases,
        };
        // Plain structs of fixed-size arrays and integers always encode
        rmp_serde::to_vec(&signable).expect("lease set signing bytes")
    }

    /// Check the signature against the embedded identity.
    pub fn verify(&self) -> Result<(), DestinationError> {
        self.identity.verify(&self.signing_bytes(), &self.signature)
    }

    /// True if at least one lease expires after `now_ms`.
    pub fn has_non_expired_leases(&self, now_ms: u64) -> bool {
        self.leases.iter().any(|l| l.expires_at > now_ms)
    }

    /// Leases still valid at `now_ms`, in descriptor order.
    pub fn non_expired_leases(&self, now_ms: u64) -> Vec<&Lease> {
        self.leases.iter().filter(|l| l.expires_at > now_ms).collect()
    }

    /// Latest expiry across all leases (0 if empty).
    pub fn latest_expiry(&self) -> u64 {
        self.leases.iter().map(|l| l.expires_at).max().unwrap_or(0)
    }

    /// Same leases and key, ignoring the signature.
    pub fn same_content(&self, other: &LeaseSet) -> bool {
        self.identity == other.identity
            && self.encryption_key == other.encryption_key
            && self.leases == other.leases
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DestinationError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, DestinationError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }
}
