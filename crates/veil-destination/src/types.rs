use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DestinationError;

/// Application protocol id carried in the data trailer: streaming.
pub const PROTOCOL_TYPE_STREAMING: u8 = 6;
/// Application protocol id: signed (repliable) datagrams.
pub const PROTOCOL_TYPE_DATAGRAM: u8 = 17;
/// Application protocol id: raw (anonymous) datagrams.
pub const PROTOCOL_TYPE_RAW: u8 = 18;

/// How long a published lease set may go unconfirmed before retrying.
pub const PUBLISH_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-round lookup timeout.
pub const LEASESET_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Overall cap on a lookup, measured from the first round.
pub const MAX_LEASESET_REQUEST_TIMEOUT: Duration = Duration::from_secs(40);
/// Cleanup cadence and retention window for remote lease sets.
pub const DESTINATION_CLEANUP_TIMEOUT: Duration = Duration::from_secs(20 * 60);
/// Directory nodes queried per lookup round.
pub const MAX_NUM_FLOODFILLS_PER_REQUEST: usize = 7;
/// Outbound stream establishment timeout.
pub const STREAM_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Tunnel identifier, local to the tunnel's gateway router.
pub type TunnelId = u32;

/// 32-byte identity hash (SHA-256 of a public identity).
///
/// Used for destinations, routers and directory keys alike. Displayed
/// and parsed as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentHash([u8; 32]);

impl IdentHash {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Kademlia XOR metric between two hashes.
    pub fn xor_distance(&self, other: &IdentHash) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }
}

impl fmt::Display for IdentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for IdentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_string();
        write!(f, "IdentHash({}...)", &hex[..12])
    }
}

impl FromStr for IdentHash {
    type Err = DestinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != 64 || !s.is_ascii() {
            return Err(DestinationError::Config(format!("invalid identity hash: {s}")));
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| DestinationError::Config(format!("invalid identity hash: {s}")))?;
        }
        Ok(Self(bytes))
    }
}

/// Current wall-clock time in Unix milliseconds.
///
/// Lease expiries travel between routers, so they use wall time rather
/// than the runtime's monotonic clock.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
