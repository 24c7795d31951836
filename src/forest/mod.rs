//! Forest of quadtrees/octrees distributed over the ranks of a communicator.
//!
//! Every rank stores the leaves it owns as a contiguous slice of the global
//! forest order ([`Quadrant`] ordering); `global_first_quadrant[r]` is the
//! global index of the first leaf of rank `r`. The coarse description
//! ([`Connectivity`]) is replicated.
//!
//! Operations that need more than local information (2:1 balance, ghost
//! layer, hanging-node queries, checksum) work on [`GlobalLeaves`], a
//! replicated snapshot gathered from all ranks.

pub mod balance;
pub mod connectivity;
pub mod ghost;
pub mod global;
pub mod io;
pub mod lattice;
pub mod partition;
pub mod quadrant;
pub mod transfer;

pub use connectivity::Connectivity;
pub use ghost::GhostLayer;
pub use global::GlobalLeaves;
pub use quadrant::{Octant, Quad, Quadrant};

use crate::algs::collective::{allgather_concat, global_offsets};
use crate::algs::communicator::Communicator;
use crate::algs::wire::WireQuadrant;
use crate::debug_invariants::DebugInvariants;
use crate::mesh_error::MeshForestError;
use quadrant::is_family;

/// Offsets splitting `n` items as evenly as possible over `parts` ranks;
/// lower ranks receive the extra items.
pub fn uniform_offsets(n: u64, parts: usize) -> Vec<u64> {
    let parts = parts.max(1) as u128;
    (0..=parts)
        .map(|p| ((n as u128 * p + parts - 1) / parts) as u64)
        .collect()
}

/// The distributed forest.
#[derive(Debug, Clone)]
pub struct Forest<const D: usize> {
    connectivity: Connectivity<D>,
    local: Vec<Quadrant<D>>,
    global_first_quadrant: Vec<u64>,
    rank: usize,
}

impl<const D: usize> Forest<D> {
    /// One root per tree, trees split evenly over the ranks. Collective in
    /// the sense that every rank must build the same connectivity.
    pub fn new_uniform<C: Communicator + ?Sized>(
        comm: &C,
        connectivity: Connectivity<D>,
    ) -> Result<Self, MeshForestError> {
        if D != 2 && D != 3 {
            return Err(MeshForestError::UnsupportedDimension(D));
        }
        let n_trees = connectivity.n_trees() as u64;
        let gfq = uniform_offsets(n_trees, comm.size());
        let rank = comm.rank();
        let local = (gfq[rank]..gfq[rank + 1])
            .map(|t| Quadrant::root(t as u32))
            .collect();
        Ok(Self {
            connectivity,
            local,
            global_first_quadrant: gfq,
            rank,
        })
    }

    pub(crate) fn from_parts(
        connectivity: Connectivity<D>,
        local: Vec<Quadrant<D>>,
        global_first_quadrant: Vec<u64>,
        rank: usize,
    ) -> Self {
        Self {
            connectivity,
            local,
            global_first_quadrant,
            rank,
        }
    }

    pub fn connectivity(&self) -> &Connectivity<D> {
        &self.connectivity
    }

    /// Locally owned leaves in forest order.
    pub fn local_quadrants(&self) -> &[Quadrant<D>] {
        &self.local
    }

    pub fn n_local(&self) -> usize {
        self.local.len()
    }

    pub fn n_global(&self) -> u64 {
        self.global_first_quadrant.last().copied().unwrap_or(0)
    }

    /// Global index of the first leaf of every rank, plus the total.
    pub fn global_first_quadrant(&self) -> &[u64] {
        &self.global_first_quadrant
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Refine and coarsen local leaves. `refine[i]` replaces leaf `i` by its
    /// children; a run of `2^D` consecutive leaves forming a family, all
    /// flagged in `coarsen`, is replaced by the parent. Other coarsen flags
    /// are ignored. Collective (updates the global offsets).
    pub fn adapt<C: Communicator + ?Sized>(
        &mut self,
        comm: &C,
        refine: &[bool],
        coarsen: &[bool],
    ) -> Result<(), MeshForestError> {
        let n = self.local.len();
        if refine.len() != n || coarsen.len() != n {
            return Err(MeshForestError::BufferSizeMismatch {
                context: "adapt flags".into(),
                expected: n,
                found: refine.len().min(coarsen.len()),
            });
        }
        let children = Quadrant::<D>::CHILDREN;
        let mut next = Vec::with_capacity(n);
        let mut i = 0;
        while i < n {
            let q = self.local[i];
            if coarsen[i]
                && i + children <= n
                && coarsen[i..i + children].iter().all(|&c| c)
                && is_family(&self.local[i..i + children])
            {
                if let Some(parent) = q.parent() {
                    next.push(parent);
                    i += children;
                    continue;
                }
            }
            if refine[i] {
                if q.level >= Quadrant::<D>::MAX_LEVEL {
                    return Err(MeshForestError::MaxLevelExceeded {
                        cell: q.to_string(),
                        max_level: Quadrant::<D>::MAX_LEVEL,
                    });
                }
                next.extend(q.children());
            } else {
                next.push(q);
            }
            i += 1;
        }
        self.local = next;
        self.global_first_quadrant = global_offsets(comm, self.local.len() as u64)?;
        crate::debug_invariants!(self.validate_invariants(), "after adapt");
        Ok(())
    }

    /// Replicated snapshot of all leaves (collective).
    pub fn gather_leaves<C: Communicator + ?Sized>(
        &self,
        comm: &C,
    ) -> Result<GlobalLeaves<D>, MeshForestError> {
        GlobalLeaves::gather(comm, &self.local, self.connectivity.n_trees())
    }

    /// Leaves of other ranks touching a local leaf.
    pub fn ghost_layer(&self, global: &GlobalLeaves<D>) -> GhostLayer<D> {
        GhostLayer::build(&self.connectivity, global, self.rank as u32)
    }

    /// Hash of the global leaf sequence, independent of the partition
    /// (collective).
    pub fn checksum<C: Communicator + ?Sized>(&self, comm: &C) -> Result<u64, MeshForestError> {
        let wire: Vec<WireQuadrant> = self.local.iter().map(|q| q.to_wire(0)).collect();
        let all = allgather_concat(comm, &wire)?;
        Ok(xxhash_rust::xxh3::xxh3_64(bytemuck::cast_slice(&all)))
    }

    pub fn memory_consumption(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.connectivity.memory_consumption()
            + self.local.capacity() * std::mem::size_of::<Quadrant<D>>()
            + self.global_first_quadrant.capacity() * std::mem::size_of::<u64>()
    }
}

impl<const D: usize> DebugInvariants for Forest<D> {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "Forest");
    }

    fn validate_invariants(&self) -> Result<(), MeshForestError> {
        let gfq = &self.global_first_quadrant;
        if gfq.len() < self.rank + 2 {
            return Err(MeshForestError::InvariantViolation(format!(
                "rank {} has only {} partition offsets",
                self.rank,
                gfq.len()
            )));
        }
        let owned = gfq[self.rank + 1].saturating_sub(gfq[self.rank]);
        if owned != self.local.len() as u64 {
            return Err(MeshForestError::InvariantViolation(format!(
                "partition assigns {owned} leaves to rank {} but it stores {}",
                self.rank,
                self.local.len()
            )));
        }
        let n_trees = self.connectivity.n_trees() as u32;
        if let Some(q) = self
            .local
            .iter()
            .find(|q| !q.is_valid() || q.tree >= n_trees)
        {
            return Err(MeshForestError::InvariantViolation(format!(
                "malformed leaf {q}"
            )));
        }
        for w in self.local.windows(2) {
            if w[0] >= w[1] || w[0].contains(&w[1]) {
                return Err(MeshForestError::InvariantViolation(format!(
                    "leaves {} and {} are out of order or overlap",
                    w[0], w[1]
                )));
            }
        }
        Ok(())
    }
}
