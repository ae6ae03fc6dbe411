// Signer indices - Bitmap of which committee members signed
//
// One bit per committee member in canonical order. Member `i` lives in byte
// `i >> 3` under mask `1 << (7 - (i & 7))`, so the first member is the most
// significant bit of the first byte. The bitmap is right-padded with zero
// bits to a whole number of bytes.

use super::error::EncodingError;
use crate::types::{IdentityList, NodeId};

/// Number of bytes needed to hold `count` bits
#[inline]
pub fn bytes_count(count: usize) -> usize {
    (count + 7) >> 3
}

/// Encode strictly ascending member positions into a bitmap
pub fn encode_signer_indices(indices: &[usize], committee_size: usize) -> Result<Vec<u8>, EncodingError> {
    let mut bitmap = vec![0u8; bytes_count(committee_size)];
    let mut previous: Option<usize> = None;

    for &index in indices {
        if index >= committee_size {
            return Err(EncodingError::InvalidSignerIndices(format!(
                "index {} out of range for committee of {}",
                index, committee_size
            )));
        }
        if previous.map_or(false, |p| index <= p) {
            return Err(EncodingError::InvalidSignerIndices(format!(
                "indices must be strictly ascending, {} follows {:?}",
                index, previous
            )));
        }
        bitmap[index >> 3] |= 1 << (7 - (index & 7));
        previous = Some(index);
    }

    Ok(bitmap)
}

/// Decode a bitmap into ascending member positions
///
/// Rejects a bitmap of the wrong length or with non-zero padding bits.
pub fn decode_signer_indices(bitmap: &[u8], committee_size: usize) -> Result<Vec<usize>, EncodingError> {
    let expected = bytes_count(committee_size);
    if bitmap.len() != expected {
        return Err(EncodingError::InvalidSignerIndices(format!(
            "committee of {} requires {} bytes but got {}",
            committee_size,
            expected,
            bitmap.len()
        )));
    }

    let used_bits = committee_size & 7;
    if used_bits != 0 {
        let padding_mask = 0xFFu8 >> used_bits;
        let last = bitmap[expected - 1];
        if last & padding_mask != 0 {
            return Err(EncodingError::InvalidSignerIndices(format!(
                "padding bits must be zero, last byte is {:#010b}",
                last
            )));
        }
    }

    Ok((0..committee_size)
        .filter(|&i| bitmap[i >> 3] & (1 << (7 - (i & 7))) != 0)
        .collect())
}

/// Encode the given signers relative to a canonically ordered committee
pub fn encode_signer_ids(full_members: &[NodeId], signers: &[NodeId]) -> Result<Vec<u8>, EncodingError> {
    let mut indices = Vec::with_capacity(signers.len());
    for signer in signers {
        let index = full_members
            .iter()
            .position(|member| member == signer)
            .ok_or_else(|| EncodingError::UnknownOrDuplicateSigner(format!("{} is not a member", signer)))?;
        indices.push(index);
    }

    let before = indices.len();
    indices.sort_unstable();
    indices.dedup();
    if indices.len() != before {
        return Err(EncodingError::UnknownOrDuplicateSigner(
            "signer listed more than once".to_string(),
        ));
    }

    encode_signer_indices(&indices, full_members.len())
}

/// Resolve a bitmap to the signing identities, in canonical order
pub fn decode_signers(bitmap: &[u8], full_members: &IdentityList) -> Result<IdentityList, EncodingError> {
    let indices = decode_signer_indices(bitmap, full_members.len())?;
    full_members.select(&indices).ok_or_else(|| {
        EncodingError::InvalidSignerIndices("decoded index outside of committee".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Identifier;
    use proptest::prelude::*;

    #[test]
    fn test_msb_first_layout() {
        assert_eq!(encode_signer_indices(&[0], 8).unwrap(), vec![0b1000_0000]);
        assert_eq!(encode_signer_indices(&[7, 8], 10).unwrap(), vec![0b0000_0001, 0b1000_0000]);
        assert_eq!(encode_signer_indices(&[], 0).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_encode_rejects_bad_indices() {
        assert!(encode_signer_indices(&[4], 4).is_err());
        assert!(encode_signer_indices(&[2, 1], 4).is_err());
        assert!(encode_signer_indices(&[1, 1], 4).is_err());
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let err = decode_signer_indices(&[0, 0], 8).unwrap_err();
        assert!(matches!(err, EncodingError::InvalidSignerIndices(_)));
        assert!(decode_signer_indices(&[], 1).is_err());
    }

    #[test]
    fn test_decode_rejects_padding() {
        // committee of 3 uses the top three bits only
        assert_eq!(decode_signer_indices(&[0b1010_0000], 3).unwrap(), vec![0, 2]);
        assert!(decode_signer_indices(&[0b1010_1000], 3).is_err());
        assert!(decode_signer_indices(&[0b0000_0001], 3).is_err());
    }

    #[test]
    fn test_encode_signer_ids_rejects_unknown_and_duplicates() {
        let members: Vec<NodeId> = (0..4u8).map(|i| Identifier::from_bytes([i; 32])).collect();
        let outsider = Identifier::from_bytes([9; 32]);

        assert!(matches!(
            encode_signer_ids(&members, &[outsider]),
            Err(EncodingError::UnknownOrDuplicateSigner(_))
        ));
        assert!(matches!(
            encode_signer_ids(&members, &[members[1], members[1]]),
            Err(EncodingError::UnknownOrDuplicateSigner(_))
        ));
        assert_eq!(encode_signer_ids(&members, &[members[3], members[0]]).unwrap(), vec![0b1001_0000]);
    }

    proptest! {
        #[test]
        fn prop_roundtrip(size in 0usize..200, seed in any::<u64>()) {
            let indices: Vec<usize> = (0..size).filter(|i| (seed >> (i % 64)) & 1 == 1).collect();
            let bitmap = encode_signer_indices(&indices, size).unwrap();
            prop_assert_eq!(bitmap.len(), bytes_count(size));
            prop_assert_eq!(decode_signer_indices(&bitmap, size).unwrap(), indices);
        }
    }
}
