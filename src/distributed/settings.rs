//! Construction-time settings of a distributed triangulation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

/// Bitmask of behaviour switches, fixed when the triangulation is created.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings(u32);

impl Settings {
    /// No switches set.
    pub const DEFAULT: Settings = Settings(0);
    /// Rebuild the local cell hierarchy from scratch after every
    /// repartition, so cell ids do not depend on the history of the mesh.
    pub const MESH_RECONSTRUCTION_AFTER_REPARTITIONING: Settings = Settings(0x1);
    /// Give refined cells a level owner (multigrid hierarchy).
    pub const CONSTRUCT_MULTIGRID_HIERARCHY: Settings = Settings(0x2);
    /// `execute_coarsening_and_refinement` leaves the partition alone.
    pub const NO_AUTOMATIC_REPARTITIONING: Settings = Settings(0x4);

    const ALL: u32 = 0x7;

    /// From raw bits; unknown bits are dropped.
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Settings(bits & Self::ALL)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Settings) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Settings {
    type Output = Settings;

    fn bitor(self, rhs: Settings) -> Settings {
        Settings(self.0 | rhs.0)
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::MESH_RECONSTRUCTION_AFTER_REPARTITIONING, "mesh_reconstruction"),
            (Self::CONSTRUCT_MULTIGRID_HIERARCHY, "multigrid"),
            (Self::NO_AUTOMATIC_REPARTITIONING, "no_auto_repartition"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(s, _)| self.contains(*s))
            .map(|(_, n)| *n)
            .collect();
        if set.is_empty() {
            write!(f, "default")
        } else {
            write!(f, "{}", set.join("|"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine() {
        let s = Settings::CONSTRUCT_MULTIGRID_HIERARCHY | Settings::NO_AUTOMATIC_REPARTITIONING;
        assert!(s.contains(Settings::NO_AUTOMATIC_REPARTITIONING));
        assert!(!s.contains(Settings::MESH_RECONSTRUCTION_AFTER_REPARTITIONING));
        assert!(s.contains(Settings::DEFAULT));
        assert_eq!(s.to_string(), "multigrid|no_auto_repartition");
        assert_eq!(Settings::from_bits_truncate(0xff).bits(), 0x7);
    }

    #[test]
    fn settings_serialize_as_bits() {
        let s = Settings::MESH_RECONSTRUCTION_AFTER_REPARTITIONING;
        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(json, "1");
        assert_eq!(serde_json::from_str::<Settings>(&json).unwrap(), s);
    }
}
