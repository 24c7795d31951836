//! Quadrant-cell relation table.
//!
//! One entry per locally owned quadrant of the forest, in forest order,
//! pairing the quadrant with the local cell it corresponds to and the
//! structural change the cell undergoes in the current cycle. The data
//! transfer engine indexes its buffers by position in this table, so the
//! order must match the forest's local quadrant order exactly.

use crate::forest::Forest;
use crate::forest::quadrant::Quadrant;
use crate::mesh_error::MeshForestError;
use crate::topology::cell_tree::{CellId, CellTree};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What happens to a cell during a cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum CellStatus {
    /// The cell stays as it is (it may move to another rank).
    Persist = 0,
    /// The cell is refined; reported once per parent, on the first child.
    Refine = 1,
    /// The children of the cell are removed; reported once per parent.
    Coarsen = 2,
    /// A sibling of a refined cell's first child; carries no data.
    Invalid = 3,
}

impl CellStatus {
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(CellStatus::Persist),
            1 => Some(CellStatus::Refine),
            2 => Some(CellStatus::Coarsen),
            3 => Some(CellStatus::Invalid),
            _ => None,
        }
    }
}

impl fmt::Display for CellStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CellStatus::Persist => "PERSIST",
            CellStatus::Refine => "REFINE",
            CellStatus::Coarsen => "COARSEN",
            CellStatus::Invalid => "INVALID",
        };
        f.write_str(name)
    }
}

/// One row of the table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CellRelation<const D: usize> {
    pub quadrant: Quadrant<D>,
    pub status: CellStatus,
    /// For `Refine`/`Invalid` the parent cell, otherwise the cell matching
    /// the quadrant.
    pub cell: CellId,
}

#[derive(Debug, Clone, Default)]
pub struct RelationTable<const D: usize> {
    entries: Vec<CellRelation<D>>,
}

impl<const D: usize> RelationTable<D> {
    /// Relate the forest's local quadrants to the cells of `cells`, which
    /// still reflects the mesh before the structural change.
    pub fn compute(forest: &Forest<D>, cells: &CellTree<D>) -> Result<Self, MeshForestError> {
        let mut entries = Vec::with_capacity(forest.n_local());
        for q in forest.local_quadrants() {
            if let Some(id) = cells.find_quadrant(q) {
                let status = match cells.get(id) {
                    Some(cell) if cell.is_active() => CellStatus::Persist,
                    Some(_) => CellStatus::Coarsen,
                    None => return Err(mismatch(q, "cell was removed")),
                };
                entries.push(CellRelation {
                    quadrant: *q,
                    status,
                    cell: id,
                });
                continue;
            }
            let parent = q
                .parent()
                .and_then(|p| cells.find_quadrant(&p))
                .ok_or_else(|| mismatch(q, "neither the cell nor its parent exists"))?;
            if !cells.get(parent).is_some_and(|c| c.is_active()) {
                return Err(mismatch(q, "parent cell is not active"));
            }
            let status = if q.child_id() == 0 {
                CellStatus::Refine
            } else {
                CellStatus::Invalid
            };
            entries.push(CellRelation {
                quadrant: *q,
                status,
                cell: parent,
            });
        }
        let table = Self { entries };
        table.check_count(forest.n_local())?;
        Ok(table)
    }

    /// Rebuild the table on the receiving side from the transferred
    /// statuses, after `cells` has been synchronized with the new forest.
    pub fn from_statuses(
        forest: &Forest<D>,
        cells: &CellTree<D>,
        statuses: &[CellStatus],
    ) -> Result<Self, MeshForestError> {
        if statuses.len() != forest.n_local() {
            return Err(MeshForestError::RelationCountMismatch {
                entries: statuses.len(),
                quadrants: forest.n_local(),
            });
        }
        let entries = forest
            .local_quadrants()
            .iter()
            .zip(statuses)
            .map(|(q, &status)| {
                let target = match status {
                    CellStatus::Persist | CellStatus::Coarsen => Some(*q),
                    CellStatus::Refine | CellStatus::Invalid => q.parent(),
                };
                let cell = target
                    .and_then(|t| cells.find_quadrant(&t))
                    .ok_or_else(|| mismatch(q, &format!("no cell for a {status} entry")))?;
                Ok(CellRelation {
                    quadrant: *q,
                    status,
                    cell,
                })
            })
            .collect::<Result<Vec<_>, MeshForestError>>()?;
        Ok(Self { entries })
    }

    /// Every local quadrant as [`CellStatus::Persist`].
    pub fn persist(forest: &Forest<D>, cells: &CellTree<D>) -> Result<Self, MeshForestError> {
        let statuses = vec![CellStatus::Persist; forest.n_local()];
        Self::from_statuses(forest, cells, &statuses)
    }

    /// The table must have one entry per local quadrant.
    pub fn check_count(&self, n_quadrants: usize) -> Result<(), MeshForestError> {
        if self.entries.len() != n_quadrants {
            return Err(MeshForestError::RelationCountMismatch {
                entries: self.entries.len(),
                quadrants: n_quadrants,
            });
        }
        Ok(())
    }

    pub fn entries(&self) -> &[CellRelation<D>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn statuses(&self) -> Vec<CellStatus> {
        self.entries.iter().map(|e| e.status).collect()
    }

    pub fn memory_consumption(&self) -> usize {
        std::mem::size_of::<Self>() + self.entries.capacity() * std::mem::size_of::<CellRelation<D>>()
    }
}

fn mismatch<const D: usize>(q: &Quadrant<D>, reason: &str) -> MeshForestError {
    MeshForestError::RelationMismatch {
        quadrant: q.to_string(),
        reason: reason.to_string(),
    }
}
