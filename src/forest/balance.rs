//! 2:1 balance across faces, edges and corners.
//!
//! Runs on the replicated leaf set, so all ranks reach the same fixpoint
//! without further communication. Refined leaves keep their owner, which
//! keeps every rank's leaves contiguous in forest order.

use crate::algs::communicator::Communicator;
use crate::forest::connectivity::Connectivity;
use crate::forest::global::GlobalLeaves;
use crate::forest::quadrant::Quadrant;
use crate::forest::Forest;
use crate::mesh_error::MeshForestError;
use std::collections::BTreeSet;

/// Leaves that are more than one level coarser than a leaf they touch.
fn unbalanced<const D: usize>(
    conn: &Connectivity<D>,
    leaves: &GlobalLeaves<D>,
) -> BTreeSet<Quadrant<D>> {
    let mut out = BTreeSet::new();
    for (q, _) in leaves.iter() {
        if q.level < 2 {
            continue;
        }
        for corner in q.corners() {
            for (b, _) in leaves.touching(conn, q.tree, &corner) {
                if b.level + 1 < q.level {
                    out.insert(b);
                }
            }
        }
    }
    out
}

/// Refine `leaves` until no two touching leaves differ by more than one
/// level. Returns the balanced set and whether anything changed.
pub fn balance_leaves<const D: usize>(
    conn: &Connectivity<D>,
    mut leaves: GlobalLeaves<D>,
) -> (GlobalLeaves<D>, bool) {
    let mut changed = false;
    loop {
        let coarse = unbalanced(conn, &leaves);
        if coarse.is_empty() {
            return (leaves, changed);
        }
        changed = true;
        let refined = leaves.into_vec().into_iter().flat_map(|(q, owner)| {
            if coarse.contains(&q) {
                q.children().into_iter().map(|c| (c, owner)).collect()
            } else {
                vec![(q, owner)]
            }
        });
        leaves = GlobalLeaves::from_leaves(conn.n_trees(), refined.collect::<Vec<_>>());
    }
}

impl<const D: usize> Forest<D> {
    /// Enforce 2:1 balance (collective). Returns `true` if leaves were added.
    pub fn balance<C: Communicator + ?Sized>(&mut self, comm: &C) -> Result<bool, MeshForestError> {
        let global = self.gather_leaves(comm)?;
        let (balanced, changed) = balance_leaves(self.connectivity(), global);
        if !changed {
            return Ok(false);
        }
        let size = comm.size();
        let rank = self.rank() as u32;
        let mut counts = vec![0u64; size];
        let mut local = Vec::new();
        for (q, owner) in balanced.iter() {
            if let Some(c) = counts.get_mut(*owner as usize) {
                *c += 1;
            }
            if *owner == rank {
                local.push(*q);
            }
        }
        let mut gfq = vec![0u64; size + 1];
        for (p, c) in counts.iter().enumerate() {
            gfq[p + 1] = gfq[p] + c;
        }
        log::debug!(
            "[rank {rank}] balance added {} leaves",
            gfq[size] - self.n_global()
        );
        self.local = local;
        self.global_first_quadrant = gfq;
        Ok(true)
    }
}
