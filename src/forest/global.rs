//! Replicated view of every leaf of the forest together with its owner.
//!
//! Balance, ghost-layer construction, hanging-node detection and the
//! checksum all work on this view, gathered from the local leaves of every
//! process. Leaves are stored per tree in forest order so that the leaf
//! containing a finest-lattice cell is found by binary search.

use crate::algs::collective::allgather_concat;
use crate::algs::communicator::Communicator;
use crate::algs::wire::WireQuadrant;
use crate::forest::connectivity::Connectivity;
use crate::forest::quadrant::{Quadrant, morton_index};
use crate::mesh_error::MeshForestError;

/// Leaves of all trees with their owning rank.
#[derive(Debug, Clone)]
pub struct GlobalLeaves<const D: usize> {
    per_tree: Vec<Vec<(Quadrant<D>, u32)>>,
}

impl<const D: usize> GlobalLeaves<D> {
    /// Gather the local leaves of every process (collective).
    pub fn gather<C: Communicator + ?Sized>(
        comm: &C,
        local: &[Quadrant<D>],
        n_trees: usize,
    ) -> Result<Self, MeshForestError> {
        let rank = comm.rank() as u32;
        let wire: Vec<WireQuadrant> = local.iter().map(|q| q.to_wire(rank)).collect();
        let all = allgather_concat(comm, &wire)?;
        let mut leaves = Vec::with_capacity(all.len());
        for w in &all {
            let (q, owner) = Quadrant::<D>::from_wire(w);
            if q.tree as usize >= n_trees || !q.is_valid() {
                return Err(MeshForestError::Communication(format!(
                    "received malformed quadrant {q} from rank {owner}"
                )));
            }
            leaves.push((q, owner));
        }
        Ok(Self::from_leaves(n_trees, leaves))
    }

    /// Build from an arbitrary list of leaves.
    pub fn from_leaves(n_trees: usize, leaves: impl IntoIterator<Item = (Quadrant<D>, u32)>) -> Self {
        let mut per_tree: Vec<Vec<(Quadrant<D>, u32)>> = vec![Vec::new(); n_trees];
        for (q, owner) in leaves {
            per_tree[q.tree as usize].push((q, owner));
        }
        for list in &mut per_tree {
            list.sort_by(|a, b| a.0.cmp(&b.0));
        }
        Self { per_tree }
    }

    pub fn len(&self) -> usize {
        self.per_tree.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All leaves in forest order.
    pub fn iter(&self) -> impl Iterator<Item = &(Quadrant<D>, u32)> + '_ {
        self.per_tree.iter().flatten()
    }

    pub fn into_vec(self) -> Vec<(Quadrant<D>, u32)> {
        self.per_tree.into_iter().flatten().collect()
    }

    /// The leaf containing the finest cell anchored at `cell` of `tree`.
    pub fn find_cell(&self, tree: u32, cell: &[u32; D]) -> Option<&(Quadrant<D>, u32)> {
        let list = self.per_tree.get(tree as usize)?;
        let key = morton_index(cell, Quadrant::<D>::MAX_LEVEL);
        let idx = list.partition_point(|(q, _)| q.morton() <= key);
        let candidate = list.get(idx.checked_sub(1)?)?;
        candidate.0.contains_cell(cell).then_some(candidate)
    }

    /// Leaves whose closure contains `point` of `tree`, across tree and
    /// periodic boundaries. Each leaf is reported once.
    pub fn touching(
        &self,
        conn: &Connectivity<D>,
        tree: u32,
        point: &[u32; D],
    ) -> Vec<(Quadrant<D>, u32)> {
        let n = Quadrant::<D>::ROOT_LEN;
        let mut out: Vec<(Quadrant<D>, u32)> = Vec::new();
        for (t, p) in conn.point_images(tree, point) {
            'cells: for e in 0..(1usize << D) {
                let mut cell = p;
                for (axis, c) in cell.iter_mut().enumerate() {
                    if (e >> axis) & 1 == 1 {
                        if *c == 0 {
                            continue 'cells;
                        }
                        *c -= 1;
                    } else if *c >= n {
                        continue 'cells;
                    }
                }
                if let Some(leaf) = self.find_cell(t, &cell) {
                    if !out.iter().any(|(q, _)| *q == leaf.0) {
                        out.push(*leaf);
                    }
                }
            }
        }
        out
    }
}
