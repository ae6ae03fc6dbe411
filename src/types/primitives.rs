// Primitives - Fundamental consensus types
use serde::{Deserialize, Serialize};
use std::fmt;

/// Content hash naming a block, vote or node (Blake3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identifier([u8; 32]);

impl Identifier {
    pub const ZERO: Identifier = Identifier([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Identifier(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hash arbitrary data with Blake3
    pub fn hash(data: &[u8]) -> Self {
        let hash = blake3::hash(data);
        Identifier(*hash.as_bytes())
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl From<[u8; 32]> for Identifier {
    fn from(bytes: [u8; 32]) -> Self {
        Identifier(bytes)
    }
}

/// Committee members are named by the hash of their staking key
pub type NodeId = Identifier;

/// Consensus round number (views can be skipped on timeout)
pub type View = u64;

/// Block height (round-robin reference protocol uses height as its view)
pub type Height = u64;

/// Unix timestamp in milliseconds
pub type Timestamp = u64;

/// Voting power of a committee member
pub type Weight = u64;

/// Current wall-clock time in milliseconds
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_deterministic() {
        let data = b"quorum";
        assert_eq!(Identifier::hash(data), Identifier::hash(data));
        assert_ne!(Identifier::hash(data), Identifier::hash(b"other"));
    }

    #[test]
    fn test_identifier_display_is_short_hex() {
        let id = Identifier::from_bytes([0xab; 32]);
        assert_eq!(id.to_string(), "abababababababab");
    }

    #[test]
    fn test_identifier_ordering_is_bytewise() {
        let low = Identifier::from_bytes([1; 32]);
        let high = Identifier::from_bytes([2; 32]);
        assert!(low < high);
        assert!(Identifier::ZERO < low);
    }
}
