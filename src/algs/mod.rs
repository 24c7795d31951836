//! Communication backends, collectives, wire records and coarse-mesh
//! reordering.

pub mod collective;
pub mod communicator;
pub mod reorder;
pub mod wire;

pub use communicator::{Communicator, NoComm, RayonComm};
