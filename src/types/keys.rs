// Keys - Ed25519 public keys of committee members
use super::primitives::{Identifier, NodeId};
use ed25519_dalek::{Signature, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ed25519 public key (32 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        PublicKey(key.to_bytes())
    }

    pub fn from_signing_key(key: &SigningKey) -> Self {
        PublicKey(key.verifying_key().to_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Node identifier derived from a staking key
    pub fn node_id(&self) -> NodeId {
        Identifier::hash(&self.0)
    }

    /// Verify a signature; malformed keys never verify
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> bool {
        let public_key = match VerifyingKey::from_bytes(&self.0) {
            Ok(pk) => pk,
            Err(_) => return false,
        };

        let sig = Signature::from_bytes(signature);

        public_key.verify(message, &sig).is_ok()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0[..8]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Signer;

    #[test]
    fn test_verify_roundtrip() {
        let key = SigningKey::from_bytes(&[3u8; 32]);
        let public = PublicKey::from_signing_key(&key);
        let sig = key.sign(b"message");

        assert!(public.verify(b"message", &sig.to_bytes()));
        assert!(!public.verify(b"other", &sig.to_bytes()));
    }

    #[test]
    fn test_node_id_is_key_hash() {
        let public = PublicKey::from_bytes([5u8; 32]);
        assert_eq!(public.node_id(), Identifier::hash(&[5u8; 32]));
    }
}
