//! Ghost layer: leaves of other ranks that touch a locally owned leaf
//! (across faces, edges, corners, tree and periodic boundaries).

use crate::forest::connectivity::Connectivity;
use crate::forest::global::GlobalLeaves;
use crate::forest::quadrant::Quadrant;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default)]
pub struct GhostLayer<const D: usize> {
    ghosts: Vec<(Quadrant<D>, u32)>,
}

impl<const D: usize> GhostLayer<D> {
    pub fn build(conn: &Connectivity<D>, global: &GlobalLeaves<D>, rank: u32) -> Self {
        let mut found: BTreeSet<(Quadrant<D>, u32)> = BTreeSet::new();
        for (q, owner) in global.iter() {
            if *owner != rank {
                continue;
            }
            for corner in q.corners() {
                found.extend(
                    global
                        .touching(conn, q.tree, &corner)
                        .into_iter()
                        .filter(|(_, o)| *o != rank),
                );
            }
        }
        Self {
            ghosts: found.into_iter().collect(),
        }
    }

    /// Ghost leaves in forest order with their owners.
    pub fn quadrants(&self) -> &[(Quadrant<D>, u32)] {
        &self.ghosts
    }

    pub fn len(&self) -> usize {
        self.ghosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ghosts.is_empty()
    }

    /// Ranks owning at least one ghost, ascending.
    pub fn neighbour_ranks(&self) -> Vec<u32> {
        let ranks: BTreeSet<u32> = self.ghosts.iter().map(|(_, o)| *o).collect();
        ranks.into_iter().collect()
    }

    pub fn memory_consumption(&self) -> usize {
        std::mem::size_of::<Self>() + self.ghosts.capacity() * std::mem::size_of::<(Quadrant<D>, u32)>()
    }
}
