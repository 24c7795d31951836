//! Tree connectivity of the forest: which coarse vertices span each tree,
//! and how points of one tree map into the others.

use crate::forest::lattice::{LatticeKey, lattice_key, locate_in_tree};
use crate::forest::quadrant::Quadrant;
use crate::topology::coarse_mesh::CoarseMesh;
use crate::topology::periodic::PeriodicIdentification;

/// Trees in forest order, each spanned by `2^D` coarse vertices.
#[derive(Debug, Clone)]
pub struct Connectivity<const D: usize> {
    tree_to_vertex: Vec<Vec<u32>>,
    vertex_to_trees: Vec<Vec<u32>>,
    periodic: PeriodicIdentification,
}

impl<const D: usize> Connectivity<D> {
    /// Tree `t` is the coarse cell `tree_to_coarse[t]`.
    pub fn new(mesh: &CoarseMesh<D>, tree_to_coarse: &[usize], periodic: PeriodicIdentification) -> Self {
        let tree_to_vertex: Vec<Vec<u32>> = tree_to_coarse
            .iter()
            .map(|&c| mesh.cell_vertices(c).to_vec())
            .collect();
        let mut vertex_to_trees = vec![Vec::new(); mesh.n_vertices()];
        for (t, verts) in tree_to_vertex.iter().enumerate() {
            for &v in verts {
                vertex_to_trees[v as usize].push(t as u32);
            }
        }
        Self {
            tree_to_vertex,
            vertex_to_trees,
            periodic,
        }
    }

    pub fn n_trees(&self) -> usize {
        self.tree_to_vertex.len()
    }

    pub fn tree_vertices(&self, tree: u32) -> &[u32] {
        &self.tree_to_vertex[tree as usize]
    }

    pub fn periodic(&self) -> &PeriodicIdentification {
        &self.periodic
    }

    /// Key of `point` of `tree`.
    pub fn key(&self, tree: u32, point: &[u32; D]) -> LatticeKey {
        lattice_key::<D>(self.tree_vertices(tree), point)
    }

    /// Every `(tree, coordinates)` naming exactly this key, without periodicity.
    pub fn locate(&self, key: &LatticeKey) -> Vec<(u32, [u32; D])> {
        let Some(&(first, _)) = key.terms().first() else {
            return Vec::new();
        };
        let Some(trees) = self.vertex_to_trees.get(first as usize) else {
            return Vec::new();
        };
        trees
            .iter()
            .filter_map(|&t| locate_in_tree::<D>(self.tree_vertices(t), key).map(|p| (t, p)))
            .collect()
    }

    /// All placements of `point` of `tree` in the forest, including the
    /// point itself and its images across other trees and periodic faces.
    pub fn point_images(&self, tree: u32, point: &[u32; D]) -> Vec<(u32, [u32; D])> {
        let n = Quadrant::<D>::ROOT_LEN;
        if point.iter().all(|&r| r > 0 && r < n) {
            return vec![(tree, *point)];
        }
        let key = self.key(tree, point);
        let mut out = Vec::new();
        let keys = if self.periodic.is_empty() {
            vec![key]
        } else {
            self.periodic.images(&key)
        };
        for k in &keys {
            for placement in self.locate(k) {
                if !out.contains(&placement) {
                    out.push(placement);
                }
            }
        }
        out
    }

    pub fn memory_consumption(&self) -> usize {
        let per_tree: usize = self
            .tree_to_vertex
            .iter()
            .map(|v| v.capacity() * std::mem::size_of::<u32>())
            .sum();
        let per_vertex: usize = self
            .vertex_to_trees
            .iter()
            .map(|v| v.capacity() * std::mem::size_of::<u32>())
            .sum();
        std::mem::size_of::<Self>() + per_tree + per_vertex
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::periodic::PeriodicFacePair;

    const N: u32 = Quadrant::<2>::ROOT_LEN;

    #[test]
    fn shared_vertex_has_one_image_per_tree() {
        let mesh = CoarseMesh::<2>::hyper_cube(2).unwrap();
        let conn = Connectivity::new(&mesh, &[0, 1, 2, 3], PeriodicIdentification::new());
        // upper right corner of tree 0 is the center vertex shared by all four
        let images = conn.point_images(0, &[N, N]);
        assert_eq!(images.len(), 4);
        assert!(images.contains(&(3, [0, 0])));
        // interior points stay put
        assert_eq!(conn.point_images(2, &[1, 1]), vec![(2, [1, 1])]);
    }

    #[test]
    fn permuted_trees_are_located_by_vertex() {
        let mesh = CoarseMesh::<2>::subdivided_hyper_rectangle([2, 1], [0.0, 0.0], [2.0, 1.0]).unwrap();
        // tree 0 is coarse cell 1
        let conn = Connectivity::new(&mesh, &[1, 0], PeriodicIdentification::new());
        let images = conn.point_images(1, &[N, N / 2]);
        assert!(images.contains(&(0, [0, N / 2])));
    }

    #[test]
    fn periodic_faces_wrap_around() {
        let mesh = CoarseMesh::<2>::subdivided_hyper_rectangle([2, 1], [0.0, 0.0], [2.0, 1.0]).unwrap();
        let mut periodic = PeriodicIdentification::new();
        periodic.insert_pair(&mesh, PeriodicFacePair::new(0, 0, 1, 1)).unwrap();
        let conn = Connectivity::new(&mesh, &[0, 1], periodic);
        let images = conn.point_images(0, &[0, N / 2]);
        assert_eq!(images.len(), 2);
        assert!(images.contains(&(1, [N, N / 2])));
    }
}
