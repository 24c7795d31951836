//! Periodic face identification.
//!
//! A [`PeriodicFacePair`] glues a boundary face of one coarse cell to a
//! boundary face of another (or the same) coarse cell. The forest uses the
//! resulting vertex correspondences to find neighbours across periodic
//! boundaries: a lattice point key whose vertices all lie on a glued face is
//! mapped onto the partner face by substituting vertices, and the closure of
//! that substitution gives every image of the point (a corner of a doubly
//! periodic square has four).

use crate::forest::lattice::LatticeKey;
use crate::mesh_error::MeshForestError;
use crate::topology::coarse_mesh::{CoarseMesh, face_corners};
use hashbrown::HashMap;
use std::collections::BTreeSet;

/// Two coarse-cell faces to be identified.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeriodicFacePair {
    /// Coarse cell indices.
    pub cells: [usize; 2],
    /// Face numbers (`2 * axis + side`) on the respective cells.
    pub faces: [usize; 2],
    /// `matching[k]` is the corner of the second face glued to corner `k` of
    /// the first (both in [`face_corners`] order). `None` means identity.
    pub matching: Option<Vec<usize>>,
}

impl PeriodicFacePair {
    /// Pair with the standard orientation: corresponding face corners match.
    pub fn new(cell_a: usize, face_a: usize, cell_b: usize, face_b: usize) -> Self {
        Self {
            cells: [cell_a, cell_b],
            faces: [face_a, face_b],
            matching: None,
        }
    }

    /// Pair with an explicit corner correspondence.
    pub fn with_matching(mut self, matching: Vec<usize>) -> Self {
        self.matching = Some(matching);
        self
    }
}

/// Vertex substitution induced by one direction of a face pair.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FaceVertexMap {
    from: Vec<u32>,
    to: Vec<u32>,
}

impl FaceVertexMap {
    fn apply(&self, key: &LatticeKey) -> Option<LatticeKey> {
        let mut terms = Vec::with_capacity(key.terms().len());
        for &(v, w) in key.terms() {
            let k = self.from.iter().position(|&f| f == v)?;
            terms.push((self.to[k], w));
        }
        Some(LatticeKey::from_terms(terms))
    }
}

/// All periodic gluings of a coarse mesh.
#[derive(Debug, Clone, Default)]
pub struct PeriodicIdentification {
    pairs: Vec<PeriodicFacePair>,
    glued: Vec<([usize; 2], [usize; 2], Vec<usize>)>,
    maps: Vec<FaceVertexMap>,
    by_vertex: HashMap<u32, Vec<usize>>,
}

impl PeriodicIdentification {
    /// Create an empty identification.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pairs(&self) -> &[PeriodicFacePair] {
        &self.pairs
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Validate `pair` against `mesh` and record it. Returns `false` if the
    /// pair (in either direction) was already present.
    pub fn insert_pair<const D: usize>(
        &mut self,
        mesh: &CoarseMesh<D>,
        pair: PeriodicFacePair,
    ) -> Result<bool, MeshForestError> {
        let n_face_corners = 1usize << (D - 1);
        for side in 0..2 {
            if pair.cells[side] >= mesh.n_cells() {
                return Err(MeshForestError::InvalidPeriodicPair(format!(
                    "cell {} out of range ({} coarse cells)",
                    pair.cells[side],
                    mesh.n_cells()
                )));
            }
            if pair.faces[side] >= 2 * D {
                return Err(MeshForestError::InvalidPeriodicPair(format!(
                    "face {} out of range for dimension {D}",
                    pair.faces[side]
                )));
            }
            if mesh.face_multiplicity(pair.cells[side], pair.faces[side]) != 1 {
                return Err(MeshForestError::InvalidPeriodicPair(format!(
                    "face {} of cell {} is not a boundary face",
                    pair.faces[side], pair.cells[side]
                )));
            }
        }
        if pair.cells[0] == pair.cells[1] && pair.faces[0] == pair.faces[1] {
            return Err(MeshForestError::InvalidPeriodicPair(
                "a face cannot be glued to itself".into(),
            ));
        }
        let matching = match &pair.matching {
            Some(m) => {
                let mut sorted = m.clone();
                sorted.sort_unstable();
                if sorted != (0..n_face_corners).collect::<Vec<_>>() {
                    return Err(MeshForestError::InvalidPeriodicPair(format!(
                        "matching {m:?} is not a permutation of the {n_face_corners} face corners"
                    )));
                }
                m.clone()
            }
            None => (0..n_face_corners).collect(),
        };
        let forward = (pair.cells, pair.faces, matching.clone());
        let backward = (
            [pair.cells[1], pair.cells[0]],
            [pair.faces[1], pair.faces[0]],
            invert(&matching),
        );
        if self.glued.contains(&forward) || self.glued.contains(&backward) {
            return Ok(false);
        }

        let a = mesh.face_vertices(pair.cells[0], pair.faces[0]);
        let b = mesh.face_vertices(pair.cells[1], pair.faces[1]);
        let b_matched: Vec<u32> = matching.iter().map(|&k| b[k]).collect();
        debug_assert_eq!(face_corners(D, pair.faces[0]).len(), a.len());
        self.push_map(FaceVertexMap {
            from: a.clone(),
            to: b_matched.clone(),
        });
        self.push_map(FaceVertexMap {
            from: b_matched,
            to: a,
        });
        self.glued.push(forward);
        self.pairs.push(pair);
        Ok(true)
    }

    fn push_map(&mut self, map: FaceVertexMap) {
        let idx = self.maps.len();
        for &v in &map.from {
            self.by_vertex.entry(v).or_default().push(idx);
        }
        self.maps.push(map);
    }

    /// Every key equivalent to `key` under the gluings, `key` included.
    pub fn images(&self, key: &LatticeKey) -> Vec<LatticeKey> {
        let mut seen: BTreeSet<LatticeKey> = BTreeSet::new();
        let mut stack = vec![key.clone()];
        seen.insert(key.clone());
        while let Some(k) = stack.pop() {
            let Some(&(first, _)) = k.terms().first() else {
                continue;
            };
            let Some(candidates) = self.by_vertex.get(&first) else {
                continue;
            };
            for &m in candidates {
                if let Some(image) = self.maps[m].apply(&k) {
                    if seen.insert(image.clone()) {
                        stack.push(image);
                    }
                }
            }
        }
        seen.into_iter().collect()
    }
}

fn invert(m: &[usize]) -> Vec<usize> {
    let mut inv = vec![0; m.len()];
    for (i, &j) in m.iter().enumerate() {
        if j < inv.len() {
            inv[j] = i;
        }
    }
    inv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forest::lattice::lattice_key;
    use crate::forest::quadrant::Quadrant;

    const N: u32 = Quadrant::<2>::ROOT_LEN;

    fn strip() -> CoarseMesh<2> {
        CoarseMesh::<2>::subdivided_hyper_rectangle([2, 1], [0.0, 0.0], [2.0, 1.0]).unwrap()
    }

    #[test]
    fn glued_faces_map_points_across() {
        let mesh = strip();
        let mut periodic = PeriodicIdentification::new();
        assert!(periodic.insert_pair(&mesh, PeriodicFacePair::new(0, 0, 1, 1)).unwrap());
        let left = lattice_key::<2>(mesh.cell_vertices(0), &[0, N / 4]);
        let right = lattice_key::<2>(mesh.cell_vertices(1), &[N, N / 4]);
        let images = periodic.images(&left);
        assert_eq!(images.len(), 2);
        assert!(images.contains(&right));
    }

    #[test]
    fn duplicate_pairs_are_ignored() {
        let mesh = strip();
        let mut periodic = PeriodicIdentification::new();
        assert!(periodic.insert_pair(&mesh, PeriodicFacePair::new(0, 0, 1, 1)).unwrap());
        assert!(!periodic.insert_pair(&mesh, PeriodicFacePair::new(1, 1, 0, 0)).unwrap());
        assert_eq!(periodic.pairs().len(), 1);
    }

    #[test]
    fn interior_faces_cannot_be_glued() {
        let mesh = strip();
        let mut periodic = PeriodicIdentification::new();
        let err = periodic
            .insert_pair(&mesh, PeriodicFacePair::new(0, 1, 1, 1))
            .unwrap_err();
        assert!(matches!(err, MeshForestError::InvalidPeriodicPair(_)));
    }

    #[test]
    fn doubly_periodic_corner_has_four_images() {
        let mesh = CoarseMesh::<2>::hyper_cube(1).unwrap();
        let mut periodic = PeriodicIdentification::new();
        periodic.insert_pair(&mesh, PeriodicFacePair::new(0, 0, 0, 1)).unwrap();
        periodic.insert_pair(&mesh, PeriodicFacePair::new(0, 2, 0, 3)).unwrap();
        let corner = lattice_key::<2>(mesh.cell_vertices(0), &[0, 0]);
        assert_eq!(periodic.images(&corner).len(), 4);
    }
}
