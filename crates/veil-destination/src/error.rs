use crate::types::IdentHash;

/// Errors surfaced by the destination controller.
///
/// Most inbound failures never reach this type: malformed traffic is
/// dropped and counted in [`DestinationStats`](crate::DestinationStats).
#[derive(Debug, thiserror::Error)]
pub enum DestinationError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("malformed message: {reason}")]
    Malformed { reason: String },

    #[error("no usable tunnels: {reason}")]
    NoTunnels { reason: String },

    #[error("lease set not found: {ident}")]
    NotFound { ident: IdentHash },

    #[error("no streaming destination on port {port}")]
    NoStreamingDestination { port: u16 },

    #[error("stream request to {ident} timed out")]
    StreamTimeout { ident: IdentHash },

    #[error("destination is shut down")]
    Shutdown,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rmp_serde::encode::Error> for DestinationError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        DestinationError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for DestinationError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        DestinationError::Deserialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_not_found() {
        let err = DestinationError::NotFound {
            ident: IdentHash::from_bytes([0xab; 32]),
        };
        assert!(err.to_string().starts_with("lease set not found: abab"));
    }

    #[test]
    fn test_display_no_tunnels() {
        let err = DestinationError::NoTunnels {
            reason: "no outbound tunnels".into(),
        };
        assert_eq!(err.to_string(), "no usable tunnels: no outbound tunnels");
    }

    #[test]
    fn test_display_invalid_signature() {
        assert_eq!(
            DestinationError::InvalidSignature.to_string(),
            "signature verification failed"
        );
    }

    #[test]
    fn test_from_decode_error() {
        let err: DestinationError = rmp_serde::from_slice::<u32>(&[0xc1])
            .unwrap_err()
            .into();
        assert!(matches!(err, DestinationError::Deserialization(_)));
    }
}
