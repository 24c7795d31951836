//! Ownership classification of cells relative to the calling rank.
//!
//! Active cells are locally owned, ghosts (owned by a neighbouring rank and
//! kept read-only) or artificial (placeholders for regions owned by distant
//! ranks). Non-active cells carry a level owner only when the multigrid
//! hierarchy is constructed.

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub enum CellOwnership {
    LocallyOwned,
    Ghost { owner: u32 },
    Artificial,
}

impl CellOwnership {
    /// Classify a cell with subdomain `subdomain` as seen from `my_rank`.
    pub fn classify(subdomain: Option<u32>, my_rank: u32) -> Self {
        match subdomain {
            Some(s) if s == my_rank => CellOwnership::LocallyOwned,
            Some(owner) => CellOwnership::Ghost { owner },
            None => CellOwnership::Artificial,
        }
    }

    /// Owning rank, if known on this rank.
    pub fn owner(&self, my_rank: u32) -> Option<u32> {
        match *self {
            CellOwnership::LocallyOwned => Some(my_rank),
            CellOwnership::Ghost { owner } => Some(owner),
            CellOwnership::Artificial => None,
        }
    }

    pub fn is_locally_owned(&self) -> bool {
        matches!(self, CellOwnership::LocallyOwned)
    }

    pub fn is_ghost(&self) -> bool {
        matches!(self, CellOwnership::Ghost { .. })
    }

    pub fn is_artificial(&self) -> bool {
        matches!(self, CellOwnership::Artificial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_the_subdomain() {
        assert!(CellOwnership::classify(Some(2), 2).is_locally_owned());
        assert_eq!(CellOwnership::classify(Some(1), 2), CellOwnership::Ghost { owner: 1 });
        assert!(CellOwnership::classify(None, 2).is_artificial());
        assert_eq!(CellOwnership::classify(Some(1), 2).owner(2), Some(1));
        assert_eq!(CellOwnership::Artificial.owner(0), None);
    }
}
