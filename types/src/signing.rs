//! Opaque sign/verify capability.
//!
//! Keys and signatures travel as lowercase hex strings so that they can be
//! embedded in block headers, certificates and registry records unchanged.

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::error::{ConsensusError, ConsensusResult};

/// Something that can sign on behalf of a public key
pub trait Signer: Send + Sync {
    /// Hex-encoded public key
    fn public_key(&self) -> String;

    /// Hex-encoded signature over `message`
    fn sign(&self, message: &[u8]) -> String;
}

/// Ed25519 signer
#[derive(Clone)]
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            key: SigningKey::generate(&mut rng),
        }
    }

    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(secret),
        }
    }

    /// Restore a signer from its hex-encoded secret key
    pub fn from_hex(secret_hex: &str) -> ConsensusResult<Self> {
        let bytes = hex::decode(secret_hex)
            .map_err(|e| ConsensusError::Serialization(format!("bad private key hex: {}", e)))?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ConsensusError::Serialization("private key must be 32 bytes".into()))?;
        Ok(Self::from_bytes(&secret))
    }

    /// Hex-encoded secret key
    pub fn secret_hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }

    /// Raw signature bytes over `message`
    pub fn sign_bytes(&self, message: &[u8]) -> [u8; 64] {
        self.key.sign(message).to_bytes()
    }
}

impl Signer for Ed25519Signer {
    fn public_key(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }

    fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.sign_bytes(message))
    }
}

impl std::fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("public_key", &self.public_key())
            .finish()
    }
}

/// Verify a hex signature against a hex public key. Malformed input is
/// simply an invalid signature.
pub fn verify_signature(public_key: &str, message: &[u8], signature: &str) -> bool {
    let Some(key) = hex::decode(public_key)
        .ok()
        .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
        .and_then(|bytes| VerifyingKey::from_bytes(&bytes).ok())
    else {
        return false;
    };
    let Some(signature) = hex::decode(signature)
        .ok()
        .and_then(|bytes| Signature::from_slice(&bytes).ok())
    else {
        return false;
    };
    key.verify(message, &signature).is_ok()
}

/// Lowercase hex SHA-256 of `data`
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(data.as_ref()))
}
