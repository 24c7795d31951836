//! Weighted repartitioning of the forest.
//!
//! Leaf `i` with exclusive global weight prefix `s` goes to rank
//! `min(P - 1, s * P / W)`, so every rank receives a contiguous range of the
//! forest order and ranks may end up empty. A leaf flagged in
//! `keep_with_previous` follows its predecessor, which keeps families that
//! were created in the current cycle on one rank. Afterwards no rank
//! boundary may fall inside a complete family of leaves: such a boundary
//! moves to the nearer end of the family, so every family stays coarsenable
//! on a single rank.

use crate::algs::collective::{allgather_concat, allgather_pod};
use crate::algs::communicator::Communicator;
use crate::algs::wire::WireQuadrant;
use crate::debug_invariants::DebugInvariants;
use crate::forest::Forest;
use crate::forest::quadrant::{Quadrant, is_family};
use crate::forest::transfer::transfer_fixed;
use crate::mesh_error::MeshForestError;
use itertools::Itertools;

/// Destination rank of every local leaf.
fn destinations(
    weights: &[u64],
    keep_with_previous: &[bool],
    before: u64,
    total: u64,
    size: usize,
) -> Vec<usize> {
    let mut out = Vec::with_capacity(weights.len());
    let mut prefix = before as u128;
    for (i, &w) in weights.iter().enumerate() {
        let dest = if i > 0 && keep_with_previous.get(i).copied().unwrap_or(false) {
            out[i - 1]
        } else {
            ((prefix * size as u128) / total.max(1) as u128).min(size as u128 - 1) as usize
        };
        out.push(dest);
        prefix += w as u128;
    }
    out
}

/// Move every interior boundary of `gfq` out of complete families of
/// `leaves` (all leaves, forest order), to whichever end of the family is
/// closer. Ties go to the family start.
fn keep_families_together<const D: usize>(leaves: &[Quadrant<D>], gfq: &mut [u64]) {
    let children = Quadrant::<D>::CHILDREN;
    let n = leaves.len();
    for p in 1..gfq.len().saturating_sub(1) {
        gfq[p] = gfq[p].max(gfq[p - 1]);
        let b = gfq[p] as usize;
        let cut = (1..children)
            .filter_map(|k| b.checked_sub(k))
            .find(|&f| f + children <= n && is_family(&leaves[f..f + children]));
        if let Some(f) = cut {
            let moved = if b - f <= f + children - b { f } else { f + children };
            gfq[p] = (moved as u64).max(gfq[p - 1]);
        }
    }
}

impl<const D: usize> Forest<D> {
    /// Redistribute the leaves by weight (`None`: one per leaf). Returns the
    /// partition offsets in effect before the call. Collective; fails on
    /// every rank with [`MeshForestError::CellWeightOverflow`] if the global
    /// weight sum does not fit 64 bits.
    pub fn partition<C: Communicator + ?Sized>(
        &mut self,
        comm: &C,
        weights: Option<&[u64]>,
        keep_with_previous: &[bool],
    ) -> Result<Vec<u64>, MeshForestError> {
        let n = self.local.len();
        let unit;
        let weights = match weights {
            Some(w) => w,
            None => {
                unit = vec![1u64; n];
                &unit
            }
        };
        if weights.len() != n {
            return Err(MeshForestError::BufferSizeMismatch {
                context: "partition weights".into(),
                expected: n,
                found: weights.len(),
            });
        }
        let local_sum = weights.iter().try_fold(0u64, |acc, &w| acc.checked_add(w));
        let record = [local_sum.is_none() as u64, local_sum.unwrap_or(0)];
        let sums: Vec<[u64; 2]> = allgather_concat(comm, &[record])?;
        if sums.iter().any(|r| r[0] != 0) {
            return Err(MeshForestError::CellWeightOverflow);
        }
        let rank = comm.rank();
        let size = comm.size();
        let total = sums
            .iter()
            .try_fold(0u64, |acc, r| acc.checked_add(r[1]))
            .ok_or(MeshForestError::CellWeightOverflow)?;
        let before: u64 = sums[..rank].iter().map(|r| r[1]).sum();
        // all-zero weights partition by count
        let dest = if total == 0 {
            let ones = vec![1u64; n];
            let before = self.global_first_quadrant[rank];
            destinations(&ones, keep_with_previous, before, self.n_global(), size)
        } else {
            destinations(weights, keep_with_previous, before, total, size)
        };

        let mut histogram = vec![0u64; size];
        for (d, group) in &dest.iter().chunk_by(|&&d| d) {
            histogram[d] += group.count() as u64;
        }
        let mut new_counts = vec![0u64; size];
        for h in allgather_pod(comm, &histogram)? {
            for (acc, c) in new_counts.iter_mut().zip(h) {
                *acc += c;
            }
        }
        let mut new_gfq = vec![0u64; size + 1];
        for p in 0..size {
            new_gfq[p + 1] = new_gfq[p] + new_counts[p];
        }
        if size > 1 {
            let leaves: Vec<Quadrant<D>> = self
                .gather_leaves(comm)?
                .into_vec()
                .into_iter()
                .map(|(q, _)| q)
                .collect();
            keep_families_together(&leaves, &mut new_gfq);
        }

        let old_gfq = std::mem::take(&mut self.global_first_quadrant);
        self.migrate(comm, &old_gfq, new_gfq)?;
        log::debug!(
            "[rank {rank}] partition: {n} -> {} local leaves (total weight {total})",
            self.local.len()
        );
        Ok(old_gfq)
    }

    /// Move the leaves so that rank `r` owns global indices
    /// `new_gfq[r]..new_gfq[r + 1]`. Collective.
    pub(crate) fn migrate<C: Communicator + ?Sized>(
        &mut self,
        comm: &C,
        old_gfq: &[u64],
        new_gfq: Vec<u64>,
    ) -> Result<(), MeshForestError> {
        let rank = comm.rank() as u32;
        let wire: Vec<WireQuadrant> = self.local.iter().map(|q| q.to_wire(rank)).collect();
        let moved = transfer_fixed(
            comm,
            old_gfq,
            &new_gfq,
            bytemuck::cast_slice(&wire),
            std::mem::size_of::<WireQuadrant>(),
        )?;
        let received: Vec<WireQuadrant> = bytemuck::pod_collect_to_vec(&moved);
        self.local = received
            .iter()
            .map(|w| Quadrant::<D>::from_wire(w).0)
            .collect();
        self.global_first_quadrant = new_gfq;
        crate::debug_invariants!(self.validate_invariants(), "after migrate");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn zero_prefix_goes_to_rank_zero() {
        assert_eq!(destinations(&[1, 1, 1, 1], &[], 0, 4, 4), vec![0, 1, 2, 3]);
        assert_eq!(destinations(&[3, 1], &[], 0, 4, 2), vec![0, 1]);
    }

    #[test]
    fn kept_leaves_follow_their_predecessor() {
        let keep = [false, true, true, true];
        assert_eq!(destinations(&[1, 1, 1, 1], &keep, 0, 4, 4), vec![0, 0, 0, 0]);
    }

    fn level_one_leaves(trees: u32) -> Vec<Quadrant<2>> {
        (0..trees).flat_map(|t| Quadrant::<2>::root(t).children()).collect()
    }

    #[test]
    fn boundaries_leave_families_whole() {
        let leaves = level_one_leaves(2);
        // 8 leaves, two families: cuts at 3 and 7 move to 4 and 8
        let mut gfq = vec![0, 3, 7, 8];
        keep_families_together(&leaves, &mut gfq);
        assert_eq!(gfq, vec![0, 4, 8, 8]);
        // a tie goes to the family start
        let mut gfq = vec![0, 2, 8];
        keep_families_together(&leaves, &mut gfq);
        assert_eq!(gfq, vec![0, 0, 8]);
    }

    #[test]
    fn incomplete_families_may_be_split() {
        let mut leaves = level_one_leaves(1);
        let first = leaves.remove(0);
        leaves.splice(0..0, first.children());
        // [4 grandchildren, 3 children]: only the grandchildren form a family
        let mut gfq = vec![0, 2, 5, 7];
        keep_families_together(&leaves, &mut gfq);
        assert_eq!(gfq, vec![0, 0, 5, 7]);
    }

    proptest! {
        #[test]
        fn destinations_are_monotone_and_in_range(
            weights in prop::collection::vec(0u64..1000, 1..64),
            size in 1usize..9,
        ) {
            let total: u64 = weights.iter().sum();
            let dest = destinations(&weights, &[], 0, total, size);
            prop_assert!(dest.windows(2).all(|w| w[0] <= w[1]));
            prop_assert!(dest.iter().all(|&d| d < size));
        }
    }
}
