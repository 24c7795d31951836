//! Process-local mesh topology: the replicated coarse mesh, periodic face
//! identifications, and the cell hierarchy refined below each coarse cell.
//!
//! The hierarchy in [`cell_tree`] mirrors the forest: every locally owned
//! leaf of the forest is an active cell, ghosts surround them, and the rest
//! of the domain is covered by artificial cells.

pub mod cell_tree;
pub mod coarse_mesh;
pub mod ownership;
pub mod periodic;

pub use cell_tree::{CellGlobalId, CellId, CellRef, CellTree, RefinementCase};
pub use coarse_mesh::CoarseMesh;
pub use ownership::CellOwnership;
pub use periodic::{PeriodicFacePair, PeriodicIdentification};
