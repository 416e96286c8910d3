//! Garlic layer seam and a default session-tag implementation.
//!
//! A garlic message bundles one or more cloves (inner `NetMessage`s)
//! under one layer of encryption. Two modes:
//!
//! - **Ephemeral**: sender does X25519 DH against the recipient's lease
//!   set key, derives the AEAD key with HKDF-SHA256, encrypts with
//!   XChaCha20-Poly1305.
//! - **Tagged**: sender prefixes a session tag the recipient registered
//!   earlier via `submit_session_key`; the tag selects a symmetric key.
//!   Tags are single-use. Lookups use this mode for their replies.

use std::collections::HashMap;
use std::time::Duration;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::time::Instant;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519Secret};

use crate::error::DestinationError;
use crate::identity::EncryptionKeys;
use crate::message::NetMessage;

pub type SessionTag = [u8; 32];

/// How long a submitted session tag stays usable.
pub const SESSION_TAG_LIFETIME: Duration = Duration::from_secs(15 * 60);

/// HKDF info string for domain separation.
const HKDF_INFO: &[u8] = b"veil-garlic-x25519-xchacha20poly1305-v1";

/// Garlic capability of a destination: decrypt inbound bundles, encrypt
/// outbound ones, and remember session keys handed out for replies.
pub trait GarlicLayer: Send {
    /// Register a one-shot session key under `tag`.
    fn submit_session_key(&mut self, key: [u8; 32], tag: SessionTag);

    /// Decrypt a garlic bundle into its cloves.
    fn decrypt(&mut self, data: &[u8]) -> Result<Vec<NetMessage>, DestinationError>;

    /// Encrypt `cloves` for the holder of `recipient_key`.
    fn encrypt(
        &mut self,
        recipient_key: &[u8; 32],
        cloves: &[NetMessage],
    ) -> Result<Vec<u8>, DestinationError>;

    /// Delivery status not claimed by a publish; may acknowledge session
    /// state. Returns true if the layer recognised it.
    fn handle_delivery_status(&mut self, _msg_id: u32) -> bool {
        false
    }

    /// Drop expired session tags. Returns how many were removed.
    fn cleanup_expired_tags(&mut self, _now: Instant) -> usize {
        0
    }
}

/// Wire form of a garlic bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum GarlicEnvelope {
    Tagged {
        tag: SessionTag,
        nonce: [u8; 24],
        ciphertext: Vec<u8>,
    },
    Ephemeral {
        ephemeral_pk: [u8; 32],
        nonce: [u8; 24],
        ciphertext: Vec<u8>,
    },
}

struct SessionKey {
    key: [u8; 32],
    created: Instant,
}

/// Default garlic layer keyed by the destination's ephemeral encryption keys.
pub struct SessionGarlic {
    keys: EncryptionKeys,
    tags: HashMap<SessionTag, SessionKey>,
}

impl SessionGarlic {
    pub fn new(keys: EncryptionKeys) -> Self {
        Self {
            keys,
            tags: HashMap::new(),
        }
    }

    /// Number of registered, unused session tags.
    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }
}

impl GarlicLayer for SessionGarlic {
    fn submit_session_key(&mut self, key: [u8; 32], tag: SessionTag) {
        self.tags.insert(
            tag,
            SessionKey {
                key,
                created: Instant::now(),
            },
        );
    }

    fn decrypt(&mut self, data: &[u8]) -> Result<Vec<NetMessage>, DestinationError> {
        let envelope: GarlicEnvelope = rmp_serde::from_slice(data)?;
        let plaintext = match envelope {
            GarlicEnvelope::Tagged {
                tag,
                nonce,
                ciphertext,
            } => {
                // Single use: consumed only once a bundle opens with it
                let session = self
                    .tags
                    .get(&tag)
                    .ok_or_else(|| DestinationError::Crypto("unknown session tag".into()))?;
                let plaintext = open(&session.key, &nonce, &ciphertext)?;
                self.tags.remove(&tag);
                plaintext
            }
            GarlicEnvelope::Ephemeral {
                ephemeral_pk,
                nonce,
                ciphertext,
            } => {
                let key = derive_key(self.keys.secret(), &ephemeral_pk);
                open(&key, &nonce, &ciphertext)?
            }
        };
        rmp_serde::from_slice(&plaintext).map_err(Into::into)
    }

    fn encrypt(
        &mut self,
        recipient_key: &[u8; 32],
        cloves: &[NetMessage],
    ) -> Result<Vec<u8>, DestinationError> {
        seal_ephemeral(recipient_key, cloves)
    }

    fn cleanup_expired_tags(&mut self, now: Instant) -> usize {
        let before = self.tags.len();
        self.tags
            .retain(|_, s| now.saturating_duration_since(s.created) < SESSION_TAG_LIFETIME);
        before - self.tags.len()
    }
}

/// Encrypt cloves for `recipient_key` with a fresh ephemeral DH.
pub fn seal_ephemeral(
    recipient_key: &[u8; 32],
    cloves: &[NetMessage],
) -> Result<Vec<u8>, DestinationError> {
    let plaintext = rmp_serde::to_vec(cloves)?;
    let ephemeral_secret = X25519Secret::from(rand::random::<[u8; 32]>());
    let ephemeral_pk = X25519PublicKey::from(&ephemeral_secret).to_bytes();
    let key = derive_key(&ephemeral_secret, recipient_key);
    let (nonce, ciphertext) = seal(&key, &plaintext)?;
    let envelope = GarlicEnvelope::Ephemeral {
        ephemeral_pk,
        nonce,
        ciphertext,
    };
    rmp_serde::to_vec(&envelope).map_err(Into::into)
}

/// Encrypt cloves under a session key the recipient registered as `tag`.
///
/// This is what a directory node does with the reply key of a lookup.
pub fn seal_with_session(
    key: &[u8; 32],
    tag: &SessionTag,
    cloves: &[NetMessage],
) -> Result<Vec<u8>, DestinationError> {
    let plaintext = rmp_serde::to_vec(cloves)?;
    let (nonce, ciphertext) = seal(key, &plaintext)?;
    let envelope = GarlicEnvelope::Tagged {
        tag: *tag,
        nonce,
        ciphertext,
    };
    rmp_serde::to_vec(&envelope).map_err(Into::into)
}

/// DH + HKDF-SHA256 → 32-byte AEAD key.
fn derive_key(secret: &X25519Secret, peer_public: &[u8; 32]) -> [u8; 32] {
    let shared = secret.diffie_hellman(&X25519PublicKey::from(*peer_public));
    let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut key = [0u8; 32];
    // 32 bytes is far below HKDF-SHA256's output limit
    hkdf.expand(HKDF_INFO, &mut key)
        .expect("HKDF-SHA256 expand to 32 bytes always succeeds");
    key
}

fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<([u8; 24], Vec<u8>), DestinationError> {
    let cipher = XChaCha20Poly1305::new(&(*key).into());
    let nonce: [u8; 24] = rand::random();
    let ciphertext = cipher
        .encrypt(&XNonce::from(nonce), plaintext)
        .map_err(|e| DestinationError::Crypto(format!("encryption failed: {e}")))?;
    Ok((nonce, ciphertext))
}

fn open(key: &[u8; 32], nonce: &[u8; 24], ciphertext: &[u8]) -> Result<Vec<u8>, DestinationError> {
    let cipher = XChaCha20Poly1305::new(&(*key).into());
    cipher
        .decrypt(&XNonce::from(*nonce), ciphertext)
        .map_err(|_| DestinationError::Crypto("decryption failed: authentication error".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DeliveryStatus;

    fn status(msg_id: u32) -> NetMessage {
        NetMessage::DeliveryStatus(DeliveryStatus {
            msg_id,
            timestamp: 0,
        })
    }

    #[test]
    fn ephemeral_bundle_opens_with_lease_set_key() {
        let keys = EncryptionKeys::generate();
        let mut garlic = SessionGarlic::new(keys.clone());

        let cloves = vec![status(1), NetMessage::Data(b"payload".to_vec())];
        let sealed = seal_ephemeral(&keys.public_key(), &cloves).unwrap();
        assert_eq!(garlic.decrypt(&sealed).unwrap(), cloves);
    }

    #[test]
    fn wrong_recipient_fails() {
        let mut garlic = SessionGarlic::new(EncryptionKeys::generate());
        let other = EncryptionKeys::generate();
        let sealed = seal_ephemeral(&other.public_key(), &[status(1)]).unwrap();
        assert!(matches!(garlic.decrypt(&sealed), Err(DestinationError::Crypto(_))));
    }

    #[test]
    fn session_tag_is_single_use() {
        let mut garlic = SessionGarlic::new(EncryptionKeys::generate());
        let key = [7u8; 32];
        let tag = [8u8; 32];
        garlic.submit_session_key(key, tag);
        assert_eq!(garlic.tag_count(), 1);

        let sealed = seal_with_session(&key, &tag, &[status(5)]).unwrap();
        assert_eq!(garlic.decrypt(&sealed).unwrap(), vec![status(5)]);
        assert_eq!(garlic.tag_count(), 0);

        // Replay of the same bundle is rejected
        assert!(garlic.decrypt(&sealed).is_err());
    }

    #[test]
    fn forged_bundle_does_not_burn_tag() {
        let mut garlic = SessionGarlic::new(EncryptionKeys::generate());
        let key = [7u8; 32];
        let tag = [8u8; 32];
        garlic.submit_session_key(key, tag);

        let forged = seal_with_session(&[9; 32], &tag, &[status(1)]).unwrap();
        assert!(matches!(garlic.decrypt(&forged), Err(DestinationError::Crypto(_))));
        assert_eq!(garlic.tag_count(), 1);

        let genuine = seal_with_session(&key, &tag, &[status(5)]).unwrap();
        assert_eq!(garlic.decrypt(&genuine).unwrap(), vec![status(5)]);
        assert_eq!(garlic.tag_count(), 0);
    }

    #[test]
    fn unknown_tag_fails() {
        let mut garlic = SessionGarlic::new(EncryptionKeys::generate());
        let sealed = seal_with_session(&[1; 32], &[2; 32], &[status(5)]).unwrap();
        assert!(garlic.decrypt(&sealed).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let keys = EncryptionKeys::generate();
        let mut garlic = SessionGarlic::new(keys.clone());
        let sealed = seal_ephemeral(&keys.public_key(), &[status(1)]).unwrap();

        let mut envelope: GarlicEnvelope = rmp_serde::from_slice(&sealed).unwrap();
        if let GarlicEnvelope::Ephemeral { ciphertext, .. } = &mut envelope {
            ciphertext[0] ^= 0xFF;
        }
        let tampered = rmp_serde::to_vec(&envelope).unwrap();
        assert!(garlic.decrypt(&tampered).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        let mut garlic = SessionGarlic::new(EncryptionKeys::generate());
        assert!(garlic.decrypt(b"\x00\x01\x02").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_tags_are_purged() {
        let mut garlic = SessionGarlic::new(EncryptionKeys::generate());
        garlic.submit_session_key([1; 32], [1; 32]);
        tokio::time::advance(SESSION_TAG_LIFETIME / 2).await;
        garlic.submit_session_key([2; 32], [2; 32]);

        assert_eq!(garlic.cleanup_expired_tags(Instant::now()), 0);
        tokio::time::advance(SESSION_TAG_LIFETIME / 2).await;
        assert_eq!(garlic.cleanup_expired_tags(Instant::now()), 1);
        assert_eq!(garlic.tag_count(), 1);
    }
}
