// Verification - Cryptographic checks of votes, QCs, timeouts and TCs
//
// Verifiers only check signatures. Authorization and weight are the
// validator's job; verifiers receive the already-resolved signer identities.

use super::error::VerifyError;
use super::packer;
use crate::types::{
    timeout_message, vote_message, Identifier, Identity, IdentityList, PublicKey, SigType, Signature64, View,
    VoteSignature,
};

/// Signature verification for consensus messages
pub trait Verifier: Send + Sync {
    /// Single vote by `voter` for `(view, block_id)`
    fn verify_vote(&self, voter: &Identity, sig_data: &[u8], view: View, block_id: &Identifier)
        -> Result<(), VerifyError>;

    /// Packed QC signatures by `signers` (canonical order) for `(view, block_id)`
    fn verify_qc(&self, signers: &IdentityList, sig_data: &[u8], view: View, block_id: &Identifier)
        -> Result<(), VerifyError>;

    /// Single timeout by `signer`
    fn verify_timeout(&self, signer: &Identity, sig_data: &[u8], view: View, newest_qc_view: View)
        -> Result<(), VerifyError>;

    /// TC signatures; `newest_qc_views[i]` belongs to `signers[i]`
    fn verify_tc(&self, signers: &IdentityList, sig_data: &[u8], view: View, newest_qc_views: &[View])
        -> Result<(), VerifyError>;
}

/// Ed25519 verifier
///
/// Aggregates are concatenations of 64-byte signatures in signer order.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Verifier;

impl Ed25519Verifier {
    pub fn new() -> Self {
        Self
    }

    fn key_for(identity: &Identity, sig_type: SigType) -> Result<PublicKey, VerifyError> {
        match sig_type {
            SigType::Staking => Ok(identity.staking_key),
            SigType::Beacon => identity.beacon_key.ok_or_else(|| {
                VerifyError::InvalidSignature(format!("{} has no beacon key", identity.node_id))
            }),
        }
    }

    /// Split a concatenated aggregate into exactly `expected` signatures
    fn split_aggregate(aggregate: &[u8], expected: usize) -> Result<Vec<Signature64>, VerifyError> {
        if aggregate.len() != expected * Signature64::LEN {
            return Err(VerifyError::InvalidFormat(format!(
                "aggregate of {} bytes cannot hold {} signatures",
                aggregate.len(),
                expected
            )));
        }
        Ok(aggregate
            .chunks_exact(Signature64::LEN)
            .filter_map(Signature64::from_slice)
            .collect())
    }

    fn verify_group(
        signers: &[Identity],
        aggregate: &[u8],
        sig_type: SigType,
        view: View,
        block_id: &Identifier,
    ) -> Result<(), VerifyError> {
        let signatures = Self::split_aggregate(aggregate, signers.len())?;
        let message = vote_message(sig_type, view, block_id);
        for (signer, signature) in signers.iter().zip(signatures.iter()) {
            let key = Self::key_for(signer, sig_type)?;
            if !key.verify(&message, signature.as_bytes()) {
                return Err(VerifyError::InvalidSignature(format!(
                    "{} signature of {} does not verify",
                    sig_type, signer.node_id
                )));
            }
        }
        Ok(())
    }
}

impl Verifier for Ed25519Verifier {
    fn verify_vote(
        &self,
        voter: &Identity,
        sig_data: &[u8],
        view: View,
        block_id: &Identifier,
    ) -> Result<(), VerifyError> {
        let vote_sig = VoteSignature::decode(sig_data).ok_or_else(|| {
            VerifyError::InvalidFormat(format!("vote signature of {} bytes", sig_data.len()))
        })?;
        let key = Self::key_for(voter, vote_sig.sig_type)?;
        let message = vote_message(vote_sig.sig_type, view, block_id);
        if key.verify(&message, vote_sig.signature.as_bytes()) {
            Ok(())
        } else {
            Err(VerifyError::InvalidSignature(format!(
                "{} vote of {} does not verify",
                vote_sig.sig_type, voter.node_id
            )))
        }
    }

    fn verify_qc(
        &self,
        signers: &IdentityList,
        sig_data: &[u8],
        view: View,
        block_id: &Identifier,
    ) -> Result<(), VerifyError> {
        if signers.is_empty() {
            return Err(VerifyError::InvalidFormat("empty signer set".to_string()));
        }

        let unpacked = packer::unpack(&signers.node_ids(), sig_data)
            .map_err(|e| VerifyError::InvalidFormat(e.to_string()))?;

        let resolve = |ids: &[crate::types::NodeId]| -> Result<Vec<Identity>, VerifyError> {
            ids.iter()
                .map(|id| {
                    signers
                        .by_node_id(id)
                        .cloned()
                        .ok_or_else(|| VerifyError::Internal(format!("unpacked signer {} not in signer set", id)))
                })
                .collect()
        };
        let staking = resolve(&unpacked.staking_signers)?;
        let beacon = resolve(&unpacked.beacon_signers)?;

        Self::verify_group(&staking, &unpacked.aggregated_staking_sig, SigType::Staking, view, block_id)?;
        Self::verify_group(&beacon, &unpacked.aggregated_beacon_sig, SigType::Beacon, view, block_id)
    }

    fn verify_timeout(
        &self,
        signer: &Identity,
        sig_data: &[u8],
        view: View,
        newest_qc_view: View,
    ) -> Result<(), VerifyError> {
        let signature = Signature64::from_slice(sig_data).ok_or_else(|| {
            VerifyError::InvalidFormat(format!("timeout signature of {} bytes", sig_data.len()))
        })?;
        if signer
            .staking_key
            .verify(&timeout_message(view, newest_qc_view), signature.as_bytes())
        {
            Ok(())
        } else {
            Err(VerifyError::InvalidSignature(format!(
                "timeout of {} for view {} does not verify",
                signer.node_id, view
            )))
        }
    }

    fn verify_tc(
        &self,
        signers: &IdentityList,
        sig_data: &[u8],
        view: View,
        newest_qc_views: &[View],
    ) -> Result<(), VerifyError> {
        if signers.is_empty() {
            return Err(VerifyError::InvalidFormat("empty signer set".to_string()));
        }
        if newest_qc_views.len() != signers.len() {
            return Err(VerifyError::InvalidFormat(format!(
                "{} signers but {} newest QC views",
                signers.len(),
                newest_qc_views.len()
            )));
        }

        let signatures = Self::split_aggregate(sig_data, signers.len())?;
        for ((signer, signature), qc_view) in signers.iter().zip(signatures.iter()).zip(newest_qc_views) {
            if !signer
                .staking_key
                .verify(&timeout_message(view, *qc_view), signature.as_bytes())
            {
                return Err(VerifyError::InvalidSignature(format!(
                    "timeout of {} inside TC for view {} does not verify",
                    signer.node_id, view
                )));
            }
        }
        Ok(())
    }
}
