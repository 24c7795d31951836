#![cfg_attr(docsrs, feature(doc_cfg))]
//! # mesh-forest
//!
//! mesh-forest is a distributed triangulation built on a forest of
//! quadtrees (2-D) or octrees (3-D). A coarse mesh is replicated on every
//! rank; each coarse cell roots a tree whose leaves are partitioned over the
//! ranks of a communicator along a space-filling curve.
//!
//! ## Features
//! - Refinement, coarsening and 2:1 balancing driven by per-cell flags
//! - Weighted repartitioning that keeps coarsenable families on one rank
//! - Per-cell user data carried through every structural change
//! - Checkpoint/restart onto a different number of ranks
//! - Periodic face identifications and multigrid level ownership
//! - Pluggable communication backends (serial, in-process threads, MPI)
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! mesh-forest = "0.1"
//! # features = ["mpi-support"]
//! ```
//!
//! A cycle is: set flags on locally owned active cells, optionally register
//! data with [`Triangulation::register_data_attach`], call
//! [`Triangulation::execute_coarsening_and_refinement`], then unpack with
//! [`Triangulation::notify_ready_to_unpack`].

pub mod algs;
pub mod data;
pub mod debug_invariants;
pub mod distributed;
pub mod forest;
pub mod io;
pub mod mesh_error;
pub mod topology;

pub use debug_invariants::DebugInvariants;
pub use distributed::Triangulation;
pub use mesh_error::MeshForestError;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::communicator::{Communicator, NoComm, RayonComm};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::data::{CellDataTransfer, Restriction};
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::distributed::{
        AttachHandle, CellStatus, DataSizeKind, Phase, Settings, Subscription, Triangulation,
    };
    pub use crate::forest::{Forest, Quadrant};
    pub use crate::mesh_error::MeshForestError;
    pub use crate::topology::{
        CellGlobalId, CellId, CellOwnership, CellRef, CoarseMesh, PeriodicFacePair, RefinementCase,
    };
}
