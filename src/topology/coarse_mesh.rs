//! Coarse mesh: the unrefined cells every tree of the forest grows from.
//!
//! Cells are hexahedra (quadrilaterals in 2-D) given by `2^D` vertex ids in
//! lexicographic order: bit `a` of the corner index selects the upper side
//! along axis `a`. The coarse mesh is replicated identically on every process.

use crate::algs::reorder::vertex_adjacency;
use crate::mesh_error::MeshForestError;
use hashbrown::HashMap;

/// Replicated description of the coarse cells.
#[derive(Debug, Clone, PartialEq)]
pub struct CoarseMesh<const D: usize> {
    vertices: Vec<[f64; D]>,
    cells: Vec<Vec<u32>>,
}

/// Corner indices of face `face` (`2 * axis + side`), in increasing order.
pub fn face_corners(dim: usize, face: usize) -> Vec<usize> {
    let (axis, side) = (face / 2, face % 2);
    (0..1usize << dim)
        .filter(|c| (c >> axis) & 1 == side)
        .collect()
}

impl<const D: usize> CoarseMesh<D> {
    /// Validate and wrap a vertex/cell description.
    pub fn new(vertices: Vec<[f64; D]>, cells: Vec<Vec<u32>>) -> Result<Self, MeshForestError> {
        if D != 2 && D != 3 {
            return Err(MeshForestError::UnsupportedDimension(D));
        }
        let mesh = Self { vertices, cells };
        mesh.validate()?;
        Ok(mesh)
    }

    /// `repetitions[a]` cells along axis `a` spanning the box `[lower, upper]`.
    pub fn subdivided_hyper_rectangle(
        repetitions: [usize; D],
        lower: [f64; D],
        upper: [f64; D],
    ) -> Result<Self, MeshForestError> {
        if repetitions.iter().any(|&r| r == 0) {
            return Err(MeshForestError::InvalidCoarseMesh(
                "every axis needs at least one cell".into(),
            ));
        }
        let npts: Vec<usize> = repetitions.iter().map(|r| r + 1).collect();
        let n_vertices: usize = npts.iter().product();
        let mut vertices = Vec::with_capacity(n_vertices);
        for linear in 0..n_vertices {
            let idx = unflatten(linear, &npts);
            let mut x = [0.0; D];
            for a in 0..D {
                let t = idx[a] as f64 / repetitions[a] as f64;
                x[a] = lower[a] + t * (upper[a] - lower[a]);
            }
            vertices.push(x);
        }
        let n_cells: usize = repetitions.iter().product();
        let mut cells = Vec::with_capacity(n_cells);
        for linear in 0..n_cells {
            let idx = unflatten(linear, &repetitions);
            let corners = (0..1usize << D)
                .map(|c| {
                    let mut stride = 1;
                    let mut v = 0;
                    for a in 0..D {
                        v += (idx[a] + ((c >> a) & 1)) * stride;
                        stride *= npts[a];
                    }
                    v as u32
                })
                .collect();
            cells.push(corners);
        }
        Self::new(vertices, cells)
    }

    /// The unit square/cube split into `n^D` cells.
    pub fn hyper_cube(n: usize) -> Result<Self, MeshForestError> {
        Self::subdivided_hyper_rectangle([n; D], [0.0; D], [1.0; D])
    }

    pub fn n_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn n_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn vertices(&self) -> &[[f64; D]] {
        &self.vertices
    }

    pub fn cells(&self) -> &[Vec<u32>] {
        &self.cells
    }

    pub fn cell_vertices(&self, cell: usize) -> &[u32] {
        &self.cells[cell]
    }

    /// Vertex ids of face `face` of `cell`, ordered like [`face_corners`].
    pub fn face_vertices(&self, cell: usize, face: usize) -> Vec<u32> {
        face_corners(D, face)
            .into_iter()
            .map(|c| self.cells[cell][c])
            .collect()
    }

    /// Cells sharing at least one vertex.
    pub fn adjacency(&self) -> Vec<Vec<usize>> {
        vertex_adjacency(&self.cells, self.vertices.len())
    }

    /// Number of cells sharing the face `face` of `cell` (1 on the boundary).
    pub fn face_multiplicity(&self, cell: usize, face: usize) -> usize {
        let mut key = self.face_vertices(cell, face);
        key.sort_unstable();
        (0..self.cells.len())
            .flat_map(|c| (0..2 * D).map(move |f| (c, f)))
            .filter(|&(c, f)| {
                let mut other = self.face_vertices(c, f);
                other.sort_unstable();
                other == key
            })
            .count()
    }

    fn validate(&self) -> Result<(), MeshForestError> {
        if self.cells.is_empty() {
            return Err(MeshForestError::InvalidCoarseMesh("no cells".into()));
        }
        if let Some(i) = self
            .vertices
            .iter()
            .position(|x| x.iter().any(|c| !c.is_finite()))
        {
            return Err(MeshForestError::InvalidCoarseMesh(format!(
                "vertex {i} has a non-finite coordinate"
            )));
        }
        let n_corners = 1usize << D;
        for (c, verts) in self.cells.iter().enumerate() {
            if verts.len() != n_corners {
                return Err(MeshForestError::InvalidCoarseMesh(format!(
                    "cell {c} has {} vertices, expected {n_corners}",
                    verts.len()
                )));
            }
            if let Some(v) = verts.iter().find(|&&v| v as usize >= self.vertices.len()) {
                return Err(MeshForestError::InvalidCoarseMesh(format!(
                    "cell {c} references vertex {v}, but there are only {}",
                    self.vertices.len()
                )));
            }
            let mut sorted = verts.clone();
            sorted.sort_unstable();
            sorted.dedup();
            if sorted.len() != n_corners {
                return Err(MeshForestError::InvalidCoarseMesh(format!(
                    "cell {c} repeats a vertex"
                )));
            }
        }
        let mut face_count: HashMap<Vec<u32>, usize> = HashMap::new();
        for c in 0..self.cells.len() {
            for f in 0..2 * D {
                let mut key = self.face_vertices(c, f);
                key.sort_unstable();
                *face_count.entry(key).or_default() += 1;
            }
        }
        if let Some((face, n)) = face_count.iter().find(|(_, n)| **n > 2) {
            return Err(MeshForestError::InvalidCoarseMesh(format!(
                "face {face:?} is shared by {n} cells"
            )));
        }
        Ok(())
    }
}

fn unflatten(mut linear: usize, extents: &[usize]) -> Vec<usize> {
    extents
        .iter()
        .map(|&e| {
            let i = linear % e;
            linear /= e;
            i
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rectangle_numbering_is_lexicographic() {
        let mesh = CoarseMesh::<2>::subdivided_hyper_rectangle([2, 1], [0.0, 0.0], [2.0, 1.0]).unwrap();
        assert_eq!(mesh.n_vertices(), 6);
        assert_eq!(mesh.cells(), &[vec![0, 1, 3, 4], vec![1, 2, 4, 5]]);
        assert_eq!(mesh.vertices()[5], [2.0, 1.0]);
        assert_eq!(mesh.face_vertices(0, 1), vec![1, 4]);
        assert_eq!(mesh.face_multiplicity(0, 1), 2);
        assert_eq!(mesh.face_multiplicity(0, 0), 1);
    }

    #[test]
    fn malformed_cells_are_rejected() {
        let verts = vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
        assert!(matches!(
            CoarseMesh::<2>::new(verts.clone(), vec![vec![0, 1, 2]]),
            Err(MeshForestError::InvalidCoarseMesh(_))
        ));
        assert!(matches!(
            CoarseMesh::<2>::new(verts.clone(), vec![vec![0, 1, 2, 9]]),
            Err(MeshForestError::InvalidCoarseMesh(_))
        ));
        assert!(matches!(
            CoarseMesh::<2>::new(verts, vec![vec![0, 1, 2, 2]]),
            Err(MeshForestError::InvalidCoarseMesh(_))
        ));
    }

    #[test]
    fn one_dimensional_meshes_are_unsupported() {
        let err = CoarseMesh::<1>::new(vec![[0.0], [1.0]], vec![vec![0, 1]]).unwrap_err();
        assert_eq!(err, MeshForestError::UnsupportedDimension(1));
    }

    #[test]
    fn cube_has_expected_size() {
        let mesh = CoarseMesh::<3>::hyper_cube(2).unwrap();
        assert_eq!(mesh.n_cells(), 8);
        assert_eq!(mesh.n_vertices(), 27);
        assert_eq!(mesh.adjacency()[0].len(), 7);
    }
}
