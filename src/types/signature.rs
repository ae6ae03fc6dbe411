// Signature - Ed25519 wrapper, signature kinds and domain separation
use super::primitives::{Identifier, View};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// =============================================================================
// Domain separation
// =============================================================================
//
// Every signed consensus message is prefixed with its own domain so that a
// staking vote can never be replayed as a beacon vote or a timeout.
// =============================================================================

/// Domain separator for votes signed with the staking key
pub const DOMAIN_STAKING_VOTE: &[u8] = b"QUORUM_STAKING_VOTE_V1:";

/// Domain separator for votes signed with the random beacon key
pub const DOMAIN_BEACON_VOTE: &[u8] = b"QUORUM_BEACON_VOTE_V1:";

/// Domain separator for timeout objects
pub const DOMAIN_TIMEOUT: &[u8] = b"QUORUM_TIMEOUT_V1:";

/// Create a domain-separated message for signing
#[inline]
pub fn domain_separate(domain: &[u8], message: &[u8]) -> Vec<u8> {
    let mut separated = Vec::with_capacity(domain.len() + message.len());
    separated.extend_from_slice(domain);
    separated.extend_from_slice(message);
    separated
}

/// Signed payload of a vote: `view || block_id`
pub fn vote_payload(view: View, block_id: &Identifier) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8 + 32);
    payload.extend_from_slice(&view.to_be_bytes());
    payload.extend_from_slice(block_id.as_bytes());
    payload
}

/// Message a vote of the given kind signs
pub fn vote_message(sig_type: SigType, view: View, block_id: &Identifier) -> Vec<u8> {
    let domain = match sig_type {
        SigType::Staking => DOMAIN_STAKING_VOTE,
        SigType::Beacon => DOMAIN_BEACON_VOTE,
    };
    domain_separate(domain, &vote_payload(view, block_id))
}

/// Message a timeout signs: `view || newest_qc_view`
pub fn timeout_message(view: View, newest_qc_view: View) -> Vec<u8> {
    let mut payload = Vec::with_capacity(16);
    payload.extend_from_slice(&view.to_be_bytes());
    payload.extend_from_slice(&newest_qc_view.to_be_bytes());
    domain_separate(DOMAIN_TIMEOUT, &payload)
}

/// Which scheme a signer used for its vote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SigType {
    /// Primary scheme (staking key), encoded as bit 0
    Staking,
    /// Secondary scheme (random beacon key), encoded as bit 1
    Beacon,
}

impl SigType {
    pub fn to_byte(self) -> u8 {
        match self {
            SigType::Staking => 0,
            SigType::Beacon => 1,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(SigType::Staking),
            1 => Some(SigType::Beacon),
            _ => None,
        }
    }
}

impl std::fmt::Display for SigType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SigType::Staking => write!(f, "staking"),
            SigType::Beacon => write!(f, "beacon"),
        }
    }
}

/// Ed25519 signature (64 bytes) with serialization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature64(pub [u8; 64]);

impl Signature64 {
    pub const LEN: usize = 64;

    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Parse from a slice, `None` unless exactly 64 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 64] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn zero() -> Self {
        Self([0; 64])
    }
}

impl From<[u8; 64]> for Signature64 {
    fn from(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Signature64 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for Signature64 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Signature64 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = <Vec<u8>>::deserialize(deserializer)?;
        Signature64::from_slice(&bytes)
            .ok_or_else(|| serde::de::Error::custom("Signature must be 64 bytes"))
    }
}

/// Wire form of a single vote signature: `[sig_type | 64-byte signature]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteSignature {
    pub sig_type: SigType,
    pub signature: Signature64,
}

impl VoteSignature {
    pub const ENCODED_LEN: usize = 1 + Signature64::LEN;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.push(self.sig_type.to_byte());
        out.extend_from_slice(self.signature.as_bytes());
        out
    }

    /// `None` for wrong length or an unknown kind byte
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return None;
        }
        Some(Self {
            sig_type: SigType::from_byte(bytes[0])?,
            signature: Signature64::from_slice(&bytes[1..])?,
        })
    }
}
