//! File output: shared files written by all ranks at disjoint offsets, and
//! a legacy VTK dump of the local cells.

pub mod parallel_file;
pub mod vtk;

pub use vtk::{VtkWriter, write_cells};
