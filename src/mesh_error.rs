//! MeshForestError: Unified error type for mesh-forest public APIs
//!
//! Every fallible operation of the distributed triangulation, the forest
//! engine and the data-transfer machinery reports through this type. The
//! variants are grouped the same way failures are classified: configuration
//! errors, structural consistency faults, lifecycle violations, I/O faults
//! and communication failures.

use thiserror::Error;

/// Unified error type for mesh-forest operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MeshForestError {
    // ----- configuration -------------------------------------------------
    /// Only quadtrees (2-D) and octrees (3-D) can be distributed.
    #[error("distributed triangulations support dimensions 2 and 3, got {0}")]
    UnsupportedDimension(usize),
    /// A refine flag requested a cut along a subset of the axes.
    #[error("anisotropic refinement requested on cell {cell}; only isotropic refinement is supported")]
    AnisotropicRefinement { cell: String },
    /// `add_periodicity` was called on a triangulation that is already refined.
    #[error("periodic faces can only be added before any refinement")]
    PeriodicityAfterRefinement,
    /// The coarse mesh handed to `create_triangulation` is malformed.
    #[error("invalid coarse mesh: {0}")]
    InvalidCoarseMesh(String),
    /// A periodic face pair references faces that cannot be matched.
    #[error("invalid periodic face pair: {0}")]
    InvalidPeriodicPair(String),
    /// The global sum of cell weights does not fit a 64-bit counter.
    #[error("sum of cell weights overflows a 64-bit counter")]
    CellWeightOverflow,
    /// A refine flag was set on a cell that already has the finest representable level.
    #[error("cell {cell} is at the maximum refinement level {max_level}")]
    MaxLevelExceeded { cell: String, max_level: u8 },
    /// `communicate_locally_moved_vertices` got a mask of the wrong length.
    #[error("vertex mask has length {got}, expected one entry per vertex ({expected})")]
    VertexMaskLength { expected: usize, got: usize },

    // ----- structural consistency -----------------------------------------
    /// The relation table and the forest disagree on the number of local quadrants.
    #[error("relation table has {entries} entries but the forest owns {quadrants} local quadrants")]
    RelationCountMismatch { entries: usize, quadrants: usize },
    /// A forest quadrant has no corresponding cell in the local tree.
    #[error("quadrant {quadrant} has no matching cell: {reason}")]
    RelationMismatch { quadrant: String, reason: String },
    /// A byte buffer does not have the size its layout implies.
    #[error("{context}: expected {expected} bytes, found {found}")]
    BufferSizeMismatch {
        context: String,
        expected: usize,
        found: usize,
    },
    /// A fixed-size pack callback returned rows of different widths.
    #[error("fixed-size callback #{index} returned {found} bytes, expected {expected}")]
    FixedSizeMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },
    /// The processes registered incompatible sets of callbacks.
    #[error("attached data layout differs between processes: {0}")]
    CallbackLayoutMismatch(String),
    /// A cell id or global cell id does not name a cell of this triangulation.
    #[error("unknown cell {0}")]
    UnknownCell(String),
    /// A restriction strategy refused to merge the children's values.
    #[error("cannot restrict values onto cell {cell}: {reason}")]
    RestrictionFailed { cell: String, reason: String },
    /// Forest or cell-tree invariant violated (reported by invariant checks).
    #[error("forest invariant violated: {0}")]
    InvariantViolation(String),

    // ----- lifecycle -----------------------------------------------------
    /// The operation needs a triangulation with content.
    #[error("`{0}` requires a triangulation that has been created")]
    EmptyTriangulation(&'static str),
    /// `create_triangulation` on a triangulation that already has cells.
    #[error("triangulation already has content; call clear() first")]
    AlreadyHasContent,
    /// `copy_triangulation` from a refined source.
    #[error("can only copy an unrefined triangulation (source has {levels} levels)")]
    SourceRefined { levels: usize },
    /// `clear` while other components still hold a subscription.
    #[error("cannot clear: {0} subscriber(s) still reference this triangulation")]
    SubscribersExist(usize),
    /// A previous refinement/repartition/persistence cycle failed midway.
    #[error("a previous cycle failed during the {phase} phase; the triangulation is corrupted and must be cleared")]
    CycleInterrupted { phase: String },
    /// The handle was issued for a different cycle than the one ready to unpack.
    #[error("attach handle {handle} is stale: data of cycle {deliverable:?} is ready to unpack")]
    StaleAttachHandle {
        handle: String,
        deliverable: Option<u64>,
    },
    /// The handle was already used to unpack.
    #[error("attach handle {0} has already been used")]
    AttachHandleConsumed(String),
    /// More registrations after `load` than attachments stored in the files.
    #[error("the loaded files carry {expected} {kind} attachments, cannot register another")]
    DeserializeRegistrationMismatch { kind: &'static str, expected: usize },

    // ----- I/O -----------------------------------------------------------
    /// Operating system error with path context.
    #[error("I/O error on {path}: {message}")]
    Io { path: String, message: String },
    /// A save file exists but its content is not what the loader expects.
    #[error("invalid save file {path}: {message}")]
    SaveFileFormat { path: String, message: String },

    // ----- communication -------------------------------------------------
    /// Failure inside a collective or point-to-point exchange.
    #[error("communication error: {0}")]
    Communication(String),
}

impl MeshForestError {
    /// Wrap an [`std::io::Error`] with the path it occurred on.
    pub fn io(path: impl AsRef<std::path::Path>, err: std::io::Error) -> Self {
        MeshForestError::Io {
            path: path.as_ref().display().to_string(),
            message: err.to_string(),
        }
    }

    /// Build a [`MeshForestError::SaveFileFormat`] for `path`.
    pub fn save_format(path: impl AsRef<std::path::Path>, message: impl Into<String>) -> Self {
        MeshForestError::SaveFileFormat {
            path: path.as_ref().display().to_string(),
            message: message.into(),
        }
    }
}
