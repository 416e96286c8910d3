//! Configuration for a client destination.
//!
//! All fields have sensible defaults. Use the builder pattern:
//!
//! ```rust
//! use veil_destination::DestinationConfig;
//!
//! let config = DestinationConfig::new()
//!     .public(true)
//!     .inbound_quantity(3);
//! ```
//!
//! Embedders speaking I2CP can build one from the option map with
//! [`DestinationConfig::from_params`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::DestinationError;
use crate::tunnel::TunnelPoolConfig;
use crate::types::{
    IdentHash, DESTINATION_CLEANUP_TIMEOUT, LEASESET_REQUEST_TIMEOUT,
    MAX_LEASESET_REQUEST_TIMEOUT, PUBLISH_CONFIRMATION_TIMEOUT, STREAM_REQUEST_TIMEOUT,
};

pub const I2CP_PARAM_INBOUND_TUNNEL_LENGTH: &str = "inbound.length";
pub const I2CP_PARAM_OUTBOUND_TUNNEL_LENGTH: &str = "outbound.length";
pub const I2CP_PARAM_INBOUND_TUNNELS_QUANTITY: &str = "inbound.quantity";
pub const I2CP_PARAM_OUTBOUND_TUNNELS_QUANTITY: &str = "outbound.quantity";
pub const I2CP_PARAM_EXPLICIT_PEERS: &str = "explicitPeers";

/// Lease set is rebuilt when its newest lease expires within this window.
pub const LEASESET_REFRESH_THRESHOLD: Duration = Duration::from_secs(60);
/// How often the loop checks for approaching lease expiry.
pub const LEASESET_REFRESH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DestinationConfig {
    /// Publish the lease set to the directory.
    pub(crate) is_public: bool,
    pub(crate) tunnels: TunnelPoolConfig,
    /// Directory for persisted ephemeral keys. `None` disables persistence.
    pub(crate) keys_dir: Option<PathBuf>,
    /// Channel buffer size for commands and events.
    pub(crate) channel_buffer: usize,
    pub(crate) publish_confirmation_timeout: Duration,
    pub(crate) lookup_round_timeout: Duration,
    pub(crate) max_lookup_time: Duration,
    pub(crate) cleanup_interval: Duration,
    pub(crate) stream_request_timeout: Duration,
    pub(crate) refresh_threshold: Duration,
    pub(crate) refresh_check_interval: Duration,
    /// Register a streaming handler on port 0 at start.
    pub(crate) default_streaming: bool,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DestinationConfig {
    pub fn new() -> Self {
        Self {
            is_public: false,
            tunnels: TunnelPoolConfig::default(),
            keys_dir: None,
            channel_buffer: 256,
            publish_confirmation_timeout: PUBLISH_CONFIRMATION_TIMEOUT,
            lookup_round_timeout: LEASESET_REQUEST_TIMEOUT,
            max_lookup_time: MAX_LEASESET_REQUEST_TIMEOUT,
            cleanup_interval: DESTINATION_CLEANUP_TIMEOUT,
            stream_request_timeout: STREAM_REQUEST_TIMEOUT,
            refresh_threshold: LEASESET_REFRESH_THRESHOLD,
            refresh_check_interval: LEASESET_REFRESH_CHECK_INTERVAL,
            default_streaming: true,
        }
    }

    /// Parse I2CP-style options. Unknown keys are ignored.
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, DestinationError> {
        let mut config = Self::new();
        let tunnels = &mut config.tunnels;

        if let Some(v) = params.get(I2CP_PARAM_INBOUND_TUNNEL_LENGTH) {
            tunnels.inbound_length = parse_count(I2CP_PARAM_INBOUND_TUNNEL_LENGTH, v)?;
        }
        if let Some(v) = params.get(I2CP_PARAM_OUTBOUND_TUNNEL_LENGTH) {
            tunnels.outbound_length = parse_count(I2CP_PARAM_OUTBOUND_TUNNEL_LENGTH, v)?;
        }
        if let Some(v) = params.get(I2CP_PARAM_INBOUND_TUNNELS_QUANTITY) {
            tunnels.inbound_quantity = parse_count(I2CP_PARAM_INBOUND_TUNNELS_QUANTITY, v)?;
        }
        if let Some(v) = params.get(I2CP_PARAM_OUTBOUND_TUNNELS_QUANTITY) {
            tunnels.outbound_quantity = parse_count(I2CP_PARAM_OUTBOUND_TUNNELS_QUANTITY, v)?;
        }
        if let Some(v) = params.get(I2CP_PARAM_EXPLICIT_PEERS) {
            let peers = v
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(str::parse)
                .collect::<Result<Vec<IdentHash>, _>>()?;
            if !peers.is_empty() {
                tracing::info!("config: explicit peers set ({} hops)", peers.len());
                tunnels.explicit_peers = Some(peers);
            }
        }
        Ok(config)
    }

    /// Publish the lease set to the directory (default: false).
    pub fn public(mut self, is_public: bool) -> Self {
        self.is_public = is_public;
        self
    }

    pub fn inbound_length(mut self, hops: usize) -> Self {
        self.tunnels.inbound_length = hops;
        self
    }

    pub fn outbound_length(mut self, hops: usize) -> Self {
        self.tunnels.outbound_length = hops;
        self
    }

    pub fn inbound_quantity(mut self, count: usize) -> Self {
        self.tunnels.inbound_quantity = count;
        self
    }

    pub fn outbound_quantity(mut self, count: usize) -> Self {
        self.tunnels.outbound_quantity = count;
        self
    }

    pub fn explicit_peers(mut self, peers: Vec<IdentHash>) -> Self {
        self.tunnels.explicit_peers = Some(peers);
        self
    }

    /// Persist ephemeral encryption keys under `dir`.
    pub fn keys_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.keys_dir = Some(dir.into());
        self
    }

    /// Channel buffer size for commands and events (default: 256).
    pub fn channel_buffer(mut self, capacity: usize) -> Self {
        self.channel_buffer = capacity.max(1);
        self
    }

    /// Override the stream establishment timeout (default: 60 s).
    pub fn stream_request_timeout(mut self, timeout: Duration) -> Self {
        self.stream_request_timeout = timeout;
        self
    }

    /// Register the default (port 0) streaming handler at start (default: true).
    pub fn default_streaming(mut self, enabled: bool) -> Self {
        self.default_streaming = enabled;
        self
    }

    pub fn is_public(&self) -> bool {
        self.is_public
    }

    pub fn tunnels(&self) -> &TunnelPoolConfig {
        &self.tunnels
    }
}

fn parse_count(key: &str, value: &str) -> Result<usize, DestinationError> {
    value
        .trim()
        .parse()
        .map_err(|_| DestinationError::Config(format!("{key}: expected a number, got {value:?}")))
}
