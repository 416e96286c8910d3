//! Destination identity and key material.
//!
//! A destination has a long-term Ed25519 signing key and a long-term
//! X25519 encryption key (together: the public identity, hashed into
//! the `IdentHash`), plus an ephemeral X25519 keypair advertised in the
//! lease set and used by the garlic layer. The ephemeral keypair is
//! persisted next to other destination state so restarts keep it.

use std::fs;
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519Secret};

use crate::error::DestinationError;
use crate::types::IdentHash;

/// Public half of a destination identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicIdentity {
    /// Ed25519 verifying key.
    pub signing_key: [u8; 32],
    /// Long-term X25519 public key.
    pub encryption_key: [u8; 32],
}

impl PublicIdentity {
    /// SHA-256 over the canonical identity bytes.
    pub fn hash(&self) -> IdentHash {
        let mut hasher = Sha256::new();
        hasher.update(self.signing_key);
        hasher.update(self.encryption_key);
        IdentHash::from_bytes(hasher.finalize().into())
    }

    /// Verify an Ed25519 signature made by this identity.
    ///
    /// Uses strict verification (rejects non-canonical signatures).
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), DestinationError> {
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| DestinationError::InvalidSignature)?;
        let verifying_key = VerifyingKey::from_bytes(&self.signing_key)
            .map_err(|_| DestinationError::InvalidSignature)?;
        let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
        verifying_key
            .verify_strict(message, &signature)
            .map_err(|_| DestinationError::InvalidSignature)
    }
}

/// Long-term private keys of a local destination. Immutable once built.
#[derive(Clone)]
pub struct PrivateKeys {
    signing: SigningKey,
    encryption: X25519Secret,
    public: PublicIdentity,
    ident_hash: IdentHash,
}

impl PrivateKeys {
    /// Build from raw 32-byte seeds.
    pub fn from_seeds(signing_seed: [u8; 32], encryption_seed: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&signing_seed);
        let encryption = X25519Secret::from(encryption_seed);
        let public = PublicIdentity {
            signing_key: signing.verifying_key().to_bytes(),
            encryption_key: X25519PublicKey::from(&encryption).to_bytes(),
        };
        Self {
            ident_hash: public.hash(),
            signing,
            encryption,
            public,
        }
    }

    /// Fresh random identity.
    pub fn generate() -> Self {
        Self::from_seeds(rand::random(), rand::random())
    }

    pub fn identity(&self) -> &PublicIdentity {
        &self.public
    }

    pub fn ident_hash(&self) -> IdentHash {
        self.ident_hash
    }

    /// Sign `message` with the long-term signing key.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }

    /// Long-term X25519 secret, used by the garlic layer as a fallback key.
    pub fn encryption_secret(&self) -> &X25519Secret {
        &self.encryption
    }
}

impl std::fmt::Debug for PrivateKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKeys")
            .field("ident_hash", &self.ident_hash)
            .finish_non_exhaustive()
    }
}

/// Ephemeral X25519 keypair advertised in the lease set.
#[derive(Clone)]
pub struct EncryptionKeys {
    secret: X25519Secret,
    public: [u8; 32],
}

impl EncryptionKeys {
    pub fn generate() -> Self {
        Self::from_secret(rand::random())
    }

    pub fn from_secret(secret: [u8; 32]) -> Self {
        let secret = X25519Secret::from(secret);
        let public = X25519PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.public
    }

    pub fn secret(&self) -> &X25519Secret {
        &self.secret
    }
}

/// On-disk form of the ephemeral keypair.
#[derive(Serialize, Deserialize)]
struct PersistedKeys {
    public: [u8; 32],
    private: [u8; 32],
}

/// Path of the persisted ephemeral keys for `ident` under `dir`.
pub fn keys_path(dir: &Path, ident: &IdentHash) -> PathBuf {
    dir.join(format!("{ident}.dat"))
}

/// Load the persisted ephemeral keypair for `ident`, or generate and
/// persist a new one.
///
/// Persistence is best-effort: read or write failures are logged and a
/// fresh keypair is returned.
pub fn load_or_generate_encryption_keys(dir: Option<&Path>, ident: &IdentHash) -> EncryptionKeys {
    let Some(dir) = dir else {
        return EncryptionKeys::generate();
    };
    let path = keys_path(dir, ident);

    if path.exists() {
        match read_keys(&path) {
            Ok(keys) => {
                tracing::debug!("keys: loaded ephemeral keys from {}", path.display());
                return keys;
            }
            Err(e) => {
                tracing::warn!("keys: can't read {}: {e}, regenerating", path.display());
            }
        }
    }

    let keys = EncryptionKeys::generate();
    if let Err(e) = write_keys(&path, &keys) {
        tracing::warn!("keys: can't save keys to {}: {e}", path.display());
    }
    keys
}

fn read_keys(path: &Path) -> Result<EncryptionKeys, DestinationError> {
    let data = fs::read(path)?;
    let persisted: PersistedKeys = serde_json::from_slice(&data)
        .map_err(|e| DestinationError::Deserialization(e.to_string()))?;
    let keys = EncryptionKeys::from_secret(persisted.private);
    if keys.public_key() != persisted.public {
        return Err(DestinationError::Crypto("persisted public key mismatch".into()));
    }
    Ok(keys)
}

fn write_keys(path: &Path, keys: &EncryptionKeys) -> Result<(), DestinationError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let persisted = PersistedKeys {
        public: keys.public_key(),
        private: keys.secret().to_bytes(),
    };
    let data = serde_json::to_vec(&persisted)
        .map_err(|e| DestinationError::Serialization(e.to_string()))?;
    fs::write(path, data)?;
    Ok(())
}
