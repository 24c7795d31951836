//! Quadrants (2-D) and octants (3-D) of a forest of trees.

use crate::algs::wire::WireQuadrant;
use std::cmp::Ordering;
use std::fmt;

/// A node of one tree of the forest.
///
/// Coordinates are integer anchors (lower corner) on the finest lattice of
/// the tree: a tree spans `[0, ROOT_LEN)` along every axis and a quadrant of
/// level `l` has side length `ROOT_LEN >> l`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quadrant<const D: usize> {
    /// Index of the tree in forest order.
    pub tree: u32,
    /// Refinement level (0 is the tree root).
    pub level: u8,
    /// Anchor on the finest lattice.
    pub coords: [u32; D],
}

/// A quadtree node (`D = 2`).
pub type Quad = Quadrant<2>;
/// An octree node (`D = 3`).
pub type Octant = Quadrant<3>;

impl<const D: usize> Quadrant<D> {
    /// Finest level; the Morton index of a finest cell fits in 64 bits.
    pub const MAX_LEVEL: u8 = if D == 2 { 29 } else { 19 };
    /// Side length of a tree root on the finest lattice.
    pub const ROOT_LEN: u32 = 1 << Self::MAX_LEVEL;
    /// Number of children of a quadrant.
    pub const CHILDREN: usize = 1 << D;

    /// The root quadrant of `tree`.
    pub fn root(tree: u32) -> Self {
        Self {
            tree,
            level: 0,
            coords: [0; D],
        }
    }

    /// Side length on the finest lattice.
    pub fn len(&self) -> u32 {
        1 << (Self::MAX_LEVEL - self.level)
    }

    /// Child `idx`; bit `a` of `idx` selects the upper half along axis `a`.
    pub fn child(&self, idx: usize) -> Self {
        let half = self.len() >> 1;
        let mut coords = self.coords;
        for (axis, c) in coords.iter_mut().enumerate() {
            if (idx >> axis) & 1 == 1 {
                *c += half;
            }
        }
        Self {
            tree: self.tree,
            level: self.level + 1,
            coords,
        }
    }

    /// Returns the `2^D` children of this quadrant in Morton order.
    pub fn children(&self) -> Vec<Self> {
        (0..Self::CHILDREN).map(|i| self.child(i)).collect()
    }

    /// Returns the parent quadrant, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        (self.level > 0).then(|| self.ancestor(self.level - 1))
    }

    /// The ancestor at `level` (`level <= self.level`).
    pub fn ancestor(&self, level: u8) -> Self {
        let shift = Self::MAX_LEVEL - level;
        let mut coords = self.coords;
        for c in coords.iter_mut() {
            *c = (*c >> shift) << shift;
        }
        Self {
            tree: self.tree,
            level,
            coords,
        }
    }

    /// Position among its siblings (0 for the root).
    pub fn child_id(&self) -> usize {
        if self.level == 0 {
            return 0;
        }
        let shift = Self::MAX_LEVEL - self.level;
        self.coords
            .iter()
            .enumerate()
            .map(|(axis, &c)| (((c >> shift) & 1) as usize) << axis)
            .sum()
    }

    /// `true` if `other` lies inside this quadrant (or is equal to it).
    pub fn contains(&self, other: &Self) -> bool {
        self.tree == other.tree
            && self.level <= other.level
            && other.ancestor(self.level).coords == self.coords
    }

    /// `true` if `other` is a strict descendant.
    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        self.level < other.level && self.contains(other)
    }

    /// `true` if the finest cell anchored at `point` lies inside this quadrant.
    pub fn contains_cell(&self, point: &[u32; D]) -> bool {
        let len = self.len();
        self.coords
            .iter()
            .zip(point)
            .all(|(&a, &p)| p >= a && p - a < len)
    }

    /// Morton index of the anchor.
    pub fn morton(&self) -> u64 {
        morton_index(&self.coords, Self::MAX_LEVEL)
    }

    /// Corner `c` on the finest lattice (bit `a` of `c` selects the upper side).
    /// Upper corners may equal `ROOT_LEN`.
    pub fn corner(&self, c: usize) -> [u32; D] {
        let len = self.len();
        let mut p = self.coords;
        for (axis, v) in p.iter_mut().enumerate() {
            if (c >> axis) & 1 == 1 {
                *v += len;
            }
        }
        p
    }

    /// All `2^D` corners.
    pub fn corners(&self) -> Vec<[u32; D]> {
        (0..Self::CHILDREN).map(|c| self.corner(c)).collect()
    }

    /// Center of face `face` (`2 * axis + side`).
    pub fn face_center(&self, face: usize) -> [u32; D] {
        let len = self.len();
        let (face_axis, side) = (face / 2, face % 2);
        let mut p = self.coords;
        for (axis, v) in p.iter_mut().enumerate() {
            if axis == face_axis {
                *v += len * side as u32;
            } else {
                *v += len / 2;
            }
        }
        p
    }

    /// Encode for exchange and save files.
    pub fn to_wire(&self, owner: u32) -> WireQuadrant {
        WireQuadrant::new(self.tree, self.level, &self.coords, owner)
    }

    /// Decode from the wire; returns the quadrant and its owner.
    pub fn from_wire(w: &WireQuadrant) -> (Self, u32) {
        let mut coords = [0u32; D];
        for (axis, c) in coords.iter_mut().enumerate() {
            *c = w.coord(axis);
        }
        (
            Self {
                tree: w.tree(),
                level: w.level(),
                coords,
            },
            w.owner(),
        )
    }

    /// Inverse of [`morton`](Self::morton) for a quadrant of `level`;
    /// `None` if the anchor is not aligned to that level.
    pub fn from_morton(tree: u32, level: u8, morton: u64) -> Option<Self> {
        let mut coords = [0u32; D];
        for b in 0..Self::MAX_LEVEL as usize {
            for (axis, c) in coords.iter_mut().enumerate() {
                *c |= (((morton >> (b * D + axis)) & 1) as u32) << b;
            }
        }
        let q = Self { tree, level, coords };
        (morton_index(&coords, Self::MAX_LEVEL) == morton && q.is_valid()).then_some(q)
    }

    /// Structural sanity: level in range and anchor aligned to the side length.
    pub fn is_valid(&self) -> bool {
        self.level <= Self::MAX_LEVEL
            && self
                .coords
                .iter()
                .all(|&c| c < Self::ROOT_LEN && c % self.len() == 0)
    }
}

/// `true` if `quads` are exactly the `2^D` children of one parent, in order.
pub fn is_family<const D: usize>(quads: &[Quadrant<D>]) -> bool {
    if quads.len() != Quadrant::<D>::CHILDREN || quads[0].level == 0 {
        return false;
    }
    let Some(parent) = quads[0].parent() else {
        return false;
    };
    quads
        .iter()
        .enumerate()
        .all(|(i, q)| *q == parent.child(i))
}

/// Interleave the bits of `coords` (axis 0 least significant).
pub fn morton_index<const D: usize>(coords: &[u32; D], bits: u8) -> u64 {
    let mut key = 0u64;
    for b in 0..bits as usize {
        for (axis, &c) in coords.iter().enumerate() {
            key |= (((c >> b) & 1) as u64) << (b * D + axis);
        }
    }
    key
}

impl<const D: usize> Ord for Quadrant<D> {
    /// Forest order: tree, then Morton index of the anchor, then level
    /// (ancestors before descendants).
    fn cmp(&self, other: &Self) -> Ordering {
        self.tree
            .cmp(&other.tree)
            .then_with(|| self.morton().cmp(&other.morton()))
            .then_with(|| self.level.cmp(&other.level))
    }
}

impl<const D: usize> PartialOrd for Quadrant<D> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<const D: usize> fmt::Display for Quadrant<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tree {} level {} at {:?}", self.tree, self.level, self.coords)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn morton_index_decodes_back() {
        let q = Octant::root(2).child(5).child(3).child(6);
        assert_eq!(Octant::from_morton(2, q.level, q.morton()), Some(q));
        // the anchor of child 1 is not aligned at level 0
        assert_eq!(Quad::from_morton(0, 0, Quad::root(0).child(1).morton()), None);
    }

    #[test]
    fn children_are_in_morton_order() {
        let root = Quad::root(0);
        let kids = root.children();
        assert!(kids.windows(2).all(|w| w[0] < w[1]));
        for (i, k) in kids.iter().enumerate() {
            assert_eq!(k.child_id(), i);
            assert_eq!(k.parent(), Some(root));
            assert!(root.is_ancestor_of(k));
        }
        assert!(is_family(&kids));
        assert!(!is_family(&kids[..3]));
    }

    #[test]
    fn ancestors_sort_before_descendants() {
        let q = Octant::root(1).child(5).child(2);
        let p = q.parent().unwrap();
        assert!(p < q);
        assert!(Octant::root(0).child(7) < Octant::root(1));
        assert!(p.contains(&q));
        assert!(!q.contains(&p));
    }

    #[test]
    fn corners_and_face_centers() {
        let q = Quad::root(0).child(3);
        let half = Quad::ROOT_LEN / 2;
        assert_eq!(q.corner(0), [half, half]);
        assert_eq!(q.corner(3), [Quad::ROOT_LEN, Quad::ROOT_LEN]);
        assert_eq!(q.face_center(0), [half, half + half / 2]);
        assert_eq!(q.face_center(3), [half + half / 2, Quad::ROOT_LEN]);
        assert!(q.contains_cell(&[half, Quad::ROOT_LEN - 1]));
        assert!(!q.contains_cell(&[half - 1, half]));
    }

    #[test]
    fn wire_round_trip_keeps_owner() {
        let q = Octant::root(4).child(6);
        let (back, owner) = Octant::from_wire(&q.to_wire(3));
        assert_eq!(back, q);
        assert_eq!(owner, 3);
        assert!(back.is_valid());
    }
}
