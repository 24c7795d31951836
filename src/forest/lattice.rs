//! Lattice point keys: tree-independent names for points of the forest.
//!
//! A point with finest-lattice coordinates `r` inside a tree is named by the
//! multilinear weights of the tree's corner vertices,
//! `w_c = prod_a (bit_a(c) ? r_a : N - r_a)` with `N = ROOT_LEN`. A point on
//! a face shared by two trees only has non-zero weights on the shared face's
//! vertices, and those weights do not depend on how either tree orients the
//! face, so both trees produce the same key. The weights always sum to `N^D`.

use crate::forest::quadrant::Quadrant;
use crate::algs::wire::WireKeyTerm;
use std::fmt;

/// Sorted `(vertex, weight)` terms with non-zero weight.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LatticeKey(Vec<(u32, u64)>);

impl LatticeKey {
    /// Build from arbitrary terms; zero weights are dropped and repeated
    /// vertices merged.
    pub fn from_terms(mut terms: Vec<(u32, u64)>) -> Self {
        terms.retain(|&(_, w)| w > 0);
        terms.sort_unstable();
        let mut merged: Vec<(u32, u64)> = Vec::with_capacity(terms.len());
        for (v, w) in terms {
            match merged.last_mut() {
                Some(last) if last.0 == v => last.1 += w,
                _ => merged.push((v, w)),
            }
        }
        LatticeKey(merged)
    }

    pub fn terms(&self) -> &[(u32, u64)] {
        &self.0
    }

    /// The vertex this key names if it is a corner of the coarse mesh.
    pub fn as_vertex(&self) -> Option<u32> {
        match self.0.as_slice() {
            [(v, _)] => Some(*v),
            _ => None,
        }
    }

    pub fn to_wire(&self) -> Vec<WireKeyTerm> {
        self.0.iter().map(|&(v, w)| WireKeyTerm::new(v, w)).collect()
    }

    pub fn from_wire(terms: &[WireKeyTerm]) -> Self {
        Self::from_terms(terms.iter().map(|t| (t.vertex(), t.weight())).collect())
    }
}

impl fmt::Display for LatticeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (v, w)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}:{w}")?;
        }
        write!(f, "]")
    }
}

/// Key of `point` in a tree whose corner `c` is vertex `corner_vertices[c]`.
pub fn lattice_key<const D: usize>(corner_vertices: &[u32], point: &[u32; D]) -> LatticeKey {
    let n = Quadrant::<D>::ROOT_LEN as u64;
    let terms = corner_vertices
        .iter()
        .enumerate()
        .take(1 << D)
        .map(|(c, &v)| {
            let w = point.iter().enumerate().fold(1u64, |acc, (axis, &r)| {
                let r = r as u64;
                acc * if (c >> axis) & 1 == 1 { r } else { n - r }
            });
            (v, w)
        })
        .collect();
    LatticeKey::from_terms(terms)
}

/// Inverse of [`lattice_key`] for one tree: coordinates of `key` inside the
/// tree, or `None` if the point does not belong to it.
pub fn locate_in_tree<const D: usize>(corner_vertices: &[u32], key: &LatticeKey) -> Option<[u32; D]> {
    let n = Quadrant::<D>::ROOT_LEN as u64;
    let mut weights = vec![0u64; 1 << D];
    for &(v, w) in key.terms() {
        let c = corner_vertices.iter().position(|&cv| cv == v)?;
        weights[c] = w;
    }
    let denom = n.pow(D as u32 - 1);
    let mut point = [0u32; D];
    for (axis, p) in point.iter_mut().enumerate() {
        let upper: u64 = weights
            .iter()
            .enumerate()
            .filter(|(c, _)| (c >> axis) & 1 == 1)
            .map(|(_, &w)| w)
            .sum();
        if upper % denom != 0 || upper / denom > n {
            return None;
        }
        *p = (upper / denom) as u32;
    }
    (lattice_key::<D>(corner_vertices, &point) == *key).then_some(point)
}

/// Position of `point` by multilinear interpolation of the corner positions.
pub fn interpolate<const D: usize>(corner_positions: &[[f64; D]], point: &[u32; D]) -> [f64; D] {
    let n = Quadrant::<D>::ROOT_LEN as f64;
    let mut x = [0.0; D];
    for (c, pos) in corner_positions.iter().enumerate().take(1 << D) {
        let w: f64 = point
            .iter()
            .enumerate()
            .map(|(axis, &r)| {
                let t = r as f64 / n;
                if (c >> axis) & 1 == 1 { t } else { 1.0 - t }
            })
            .product();
        for (xa, pa) in x.iter_mut().zip(pos) {
            *xa += w * pa;
        }
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;

    const N: u32 = Quadrant::<2>::ROOT_LEN;

    #[test]
    fn corner_keys_name_single_vertices() {
        let verts = [10, 11, 12, 13];
        assert_eq!(lattice_key::<2>(&verts, &[0, 0]).as_vertex(), Some(10));
        assert_eq!(lattice_key::<2>(&verts, &[N, N]).as_vertex(), Some(13));
        assert_eq!(lattice_key::<2>(&verts, &[N / 2, 0]).as_vertex(), None);
    }

    #[test]
    fn shared_edge_points_agree_between_cells() {
        // two unit squares side by side: left [0,1,3,4], right [1,2,4,5]
        let left = [0, 1, 3, 4];
        let right = [1, 2, 4, 5];
        let p_left = [N, N / 4];
        let p_right = [0, N / 4];
        let k = lattice_key::<2>(&left, &p_left);
        assert_eq!(k, lattice_key::<2>(&right, &p_right));
        assert_eq!(locate_in_tree::<2>(&right, &k), Some(p_right));
        assert_eq!(locate_in_tree::<2>(&left, &k), Some(p_left));
    }

    #[test]
    fn interior_points_do_not_leak_into_neighbours() {
        let left = [0, 1, 3, 4];
        let right = [1, 2, 4, 5];
        let k = lattice_key::<2>(&left, &[N / 2, N / 2]);
        assert_eq!(locate_in_tree::<2>(&right, &k), None);
    }

    #[test]
    fn octree_weights_sum_to_volume() {
        let verts: Vec<u32> = (0..8).collect();
        let n = Quadrant::<3>::ROOT_LEN;
        let k = lattice_key::<3>(&verts, &[n / 4, n / 2, 3 * (n / 4)]);
        let total: u64 = k.terms().iter().map(|t| t.1).sum();
        assert_eq!(total, (n as u64).pow(3));
        assert_eq!(locate_in_tree::<3>(&verts, &k), Some([n / 4, n / 2, 3 * (n / 4)]));
    }

    #[test]
    fn interpolation_hits_corners_and_midpoints() {
        let pos = [[0.0, 0.0], [2.0, 0.0], [0.0, 1.0], [2.0, 1.0]];
        assert_eq!(interpolate::<2>(&pos, &[N, N]), [2.0, 1.0]);
        assert_eq!(interpolate::<2>(&pos, &[N / 2, N / 2]), [1.0, 0.5]);
    }
}
