//! Consistency checks shared by the forest, the local cell tree and the
//! triangulation that glues them together.

use crate::mesh_error::MeshForestError;

/// Structures whose internal consistency can be verified on demand.
pub trait DebugInvariants {
    /// Panic on the first violation in debug builds or with `strict-invariants`.
    fn debug_assert_invariants(&self);
    /// Return the first violation found, if any.
    fn validate_invariants(&self) -> Result<(), MeshForestError>;
}

/// Run a fallible check and panic with context when invariant checking is on.
#[macro_export]
macro_rules! debug_invariants {
    ($expr:expr, $($ctx:tt)*) => {
        #[cfg(any(debug_assertions, feature = "strict-invariants"))]
        if let Err(e) = $expr {
            panic!(concat!("[mesh-forest invariants] ", $($ctx)*, ": {}"), e);
        }
    };
}
