// Weight thresholds for quorums and honest majorities
use crate::types::primitives::Weight;

/// Minimum weight for a quorum: the smallest `t` with `3t > 2 * total`
///
/// Computed as `2 * floor(total / 3) + max(1, total mod 3)` in integer
/// arithmetic, so that any two quorums intersect in at least one honest
/// member.
#[inline]
pub fn quorum_threshold(total_weight: Weight) -> Weight {
    let floor_one_third = total_weight / 3;
    let remainder = total_weight % 3;
    let base = 2 * floor_one_third;
    if remainder <= 1 {
        base + 1
    } else {
        base + remainder
    }
}

/// Minimum weight guaranteed to include one honest member: `total / 3 + 1`
#[inline]
pub fn timeout_partial_threshold(total_weight: Weight) -> Weight {
    total_weight / 3 + 1
}
