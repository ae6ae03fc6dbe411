// Packer - Compact encoding of who signed a QC and with which scheme
//
// A QC carries two pieces of signer information:
// - signer indices: bitmap over the full committee (see signer_indices)
// - sig types: one bit per *signer*, in the same canonical order,
//   0 = staking, 1 = random beacon, right-padded to a byte boundary
//
// The sig-type bit vector travels inside the packed SignatureData blob.

use super::committee::Committee;
use super::error::{CommitteeError, EncodingError};
use super::signer_indices::{bytes_count, encode_signer_indices};
use crate::types::{Identifier, NodeId, SigType};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Signatures of a quorum, split by scheme
///
/// ed25519 has no signature aggregation: an aggregate is the concatenation
/// of 64-byte signatures in canonical signer order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockSignatureData {
    pub staking_signers: Vec<NodeId>,
    pub beacon_signers: Vec<NodeId>,
    pub aggregated_staking_sig: Vec<u8>,
    pub aggregated_beacon_sig: Vec<u8>,
    pub reconstructed_beacon_sig: Option<Vec<u8>>,
}

/// Packed signature blob embedded in a QC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureData {
    /// One bit per signer, MSB first
    pub sig_type: Vec<u8>,
    pub aggregated_staking_sig: Vec<u8>,
    pub aggregated_beacon_sig: Vec<u8>,
    pub reconstructed_beacon_sig: Option<Vec<u8>>,
}

impl SignatureData {
    pub fn encode(&self) -> Result<Vec<u8>, EncodingError> {
        bincode::serialize(self).map_err(|e| EncodingError::InvalidFormat(format!("encode sig data: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EncodingError> {
        bincode::deserialize(bytes).map_err(|e| EncodingError::InvalidFormat(format!("decode sig data: {}", e)))
    }
}

/// Serialize sig types into a bit vector of `ceil(len/8)` bytes
pub fn serialize_sig_types(sig_types: &[SigType]) -> Vec<u8> {
    let mut bytes = vec![0u8; bytes_count(sig_types.len())];
    for (pos, sig_type) in sig_types.iter().enumerate() {
        if *sig_type == SigType::Beacon {
            bytes[pos >> 3] |= 1 << (7 - (pos & 7));
        }
    }
    bytes
}

/// Deserialize `count` sig types from a bit vector
///
/// Fails with `InvalidFormat` when the byte length is not `ceil(count/8)`
/// or any bit past the `count`-th is set.
pub fn deserialize_sig_types(serialized: &[u8], count: usize) -> Result<Vec<SigType>, EncodingError> {
    let total_bytes = bytes_count(count);
    if serialized.len() != total_bytes {
        return Err(EncodingError::InvalidFormat(format!(
            "sig types of {} signers require {} bytes but got {}",
            count,
            total_bytes,
            serialized.len()
        )));
    }

    let types = (0..count)
        .map(|i| {
            if serialized[i >> 3] & (1 << (7 - (i & 7))) == 0 {
                SigType::Staking
            } else {
                SigType::Beacon
            }
        })
        .collect();

    let used_bits = count & 7;
    if used_bits != 0 {
        let remaining = serialized[total_bytes - 1] << used_bits;
        if remaining != 0 {
            return Err(EncodingError::InvalidFormat(format!(
                "the remaining bits are expected to be all 0s, but are {:#010b}",
                remaining
            )));
        }
    }

    Ok(types)
}

/// Encode signer indices and sig types against the full committee
///
/// The two signer sets must be disjoint subsets of `full_members`.
pub fn encode_signer_indices_and_sig_types(
    full_members: &[NodeId],
    staking_signers: &[NodeId],
    beacon_signers: &[NodeId],
) -> Result<(Vec<u8>, Vec<u8>), EncodingError> {
    let mut staking_lookup: HashSet<NodeId> = staking_signers.iter().copied().collect();
    let mut beacon_lookup: HashSet<NodeId> = beacon_signers.iter().copied().collect();
    if staking_lookup.len() != staking_signers.len() {
        return Err(EncodingError::UnknownOrDuplicateSigner(
            "duplicated staking signer".to_string(),
        ));
    }
    if beacon_lookup.len() != beacon_signers.len() {
        return Err(EncodingError::UnknownOrDuplicateSigner(
            "duplicated beacon signer".to_string(),
        ));
    }

    let mut indices = Vec::with_capacity(staking_signers.len() + beacon_signers.len());
    let mut sig_types = Vec::with_capacity(indices.capacity());

    for (i, member) in full_members.iter().enumerate() {
        if staking_lookup.remove(member) {
            indices.push(i);
            sig_types.push(SigType::Staking);
            continue;
        }
        if beacon_lookup.remove(member) {
            indices.push(i);
            sig_types.push(SigType::Beacon);
        }
    }

    if !staking_lookup.is_empty() {
        return Err(EncodingError::UnknownOrDuplicateSigner(format!(
            "unknown staking signers: {}",
            join_ids(&staking_lookup)
        )));
    }
    if !beacon_lookup.is_empty() {
        return Err(EncodingError::UnknownOrDuplicateSigner(format!(
            "unknown or duplicated beacon signers: {}",
            join_ids(&beacon_lookup)
        )));
    }

    let signer_indices = encode_signer_indices(&indices, full_members.len())?;
    Ok((signer_indices, serialize_sig_types(&sig_types)))
}

/// Split signers into (staking, beacon) according to the bit vector
pub fn decode_sig_types_to_signers(
    signer_ids: &[NodeId],
    sig_type: &[u8],
) -> Result<(Vec<NodeId>, Vec<NodeId>), EncodingError> {
    let sig_types = deserialize_sig_types(sig_type, signer_ids.len())?;

    let mut staking = Vec::with_capacity(signer_ids.len());
    let mut beacon = Vec::with_capacity(signer_ids.len());
    for (signer_id, sig_type) in signer_ids.iter().zip(sig_types) {
        match sig_type {
            SigType::Staking => staking.push(*signer_id),
            SigType::Beacon => beacon.push(*signer_id),
        }
    }

    Ok((staking, beacon))
}

fn join_ids(ids: &HashSet<NodeId>) -> String {
    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",")
}

/// Packing failed
#[derive(Debug, thiserror::Error)]
pub enum PackerError {
    #[error("could not resolve committee for block {block_id}: {source}")]
    Committee {
        block_id: Identifier,
        #[source]
        source: CommitteeError,
    },

    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

/// Packs and unpacks QC signature data against the committee at a block
pub struct SigDataPacker<C: Committee + ?Sized> {
    committee: Arc<C>,
}

impl<C: Committee + ?Sized> SigDataPacker<C> {
    pub fn new(committee: Arc<C>) -> Self {
        Self { committee }
    }

    /// Returns `(signer_indices, sig_data)` for a QC on `block_id`
    pub fn pack(&self, block_id: &Identifier, sig: &BlockSignatureData) -> Result<(Vec<u8>, Vec<u8>), PackerError> {
        let full_members = self
            .committee
            .identities(block_id)
            .map_err(|source| PackerError::Committee {
                block_id: *block_id,
                source,
            })?;

        let (signer_indices, sig_type) = encode_signer_indices_and_sig_types(
            &full_members.node_ids(),
            &sig.staking_signers,
            &sig.beacon_signers,
        )?;

        let data = SignatureData {
            sig_type,
            aggregated_staking_sig: sig.aggregated_staking_sig.clone(),
            aggregated_beacon_sig: sig.aggregated_beacon_sig.clone(),
            reconstructed_beacon_sig: sig.reconstructed_beacon_sig.clone(),
        };

        Ok((signer_indices, data.encode()?))
    }
}

/// Recover the partitioned signers and aggregates from packed sig data
///
/// `signer_ids` must already be resolved from the signer indices.
pub fn unpack(signer_ids: &[NodeId], sig_data: &[u8]) -> Result<BlockSignatureData, EncodingError> {
    let data = SignatureData::decode(sig_data)?;
    let (staking_signers, beacon_signers) = decode_sig_types_to_signers(signer_ids, &data.sig_type)?;

    Ok(BlockSignatureData {
        staking_signers,
        beacon_signers,
        aggregated_staking_sig: data.aggregated_staking_sig,
        aggregated_beacon_sig: data.aggregated_beacon_sig,
        reconstructed_beacon_sig: data.reconstructed_beacon_sig,
    })
}
