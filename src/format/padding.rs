/*
 * SPDX-FileCopyrightText: 2024-2026 bootpatch contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

use num_traits::PrimInt;

/// Calculate the amount of padding that needs to be added to align the
/// specified offset to a boundary.
pub fn calc<N: PrimInt>(offset: N, alignment: N) -> N {
    let r = offset % alignment;
    if r == N::zero() {
        N::zero()
    } else {
        alignment - r
    }
}

/// Round to the next multiple of the alignment.
pub fn round<N: PrimInt>(offset: N, alignment: N) -> Option<N> {
    let remain = calc(offset, alignment);
    offset.checked_add(&remain)
}
