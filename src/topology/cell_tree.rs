//! Process-local cell hierarchy mirroring the distributed forest.
//!
//! Every coarse cell is the root of a tree of cells. After
//! [`CellTree::sync_from_leaves`] every locally owned or ghost leaf of the
//! forest has an active cell, refined as deep as the forest; regions known
//! to belong to distant ranks collapse into active *artificial* cells.
//! Coarse cells are never removed.
//!
//! Vertices are shared between cells through their lattice key, so two
//! neighbouring cells (in the same or in different trees) refer to the same
//! vertex id. New vertices are placed by multilinear interpolation of the
//! current positions of the coarse cell's corners.

use crate::debug_invariants::DebugInvariants;
use crate::forest::lattice::{LatticeKey, interpolate, lattice_key};
use crate::forest::quadrant::Quadrant;
use crate::mesh_error::MeshForestError;
use crate::topology::coarse_mesh::CoarseMesh;
use crate::topology::ownership::CellOwnership;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a cell in the local hierarchy. Ids of coarse cells equal their
/// coarse-cell index; ids of finer cells are reused after coarsening.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct CellId(u32);

impl CellId {
    pub const fn new(raw: u32) -> Self {
        CellId(raw)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell#{}", self.0)
    }
}

/// Identity of a cell that is the same on every rank and across cycles:
/// the coarse cell it descends from plus its position in that tree.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellGlobalId {
    pub coarse_cell: u32,
    pub level: u8,
    pub morton: u64,
}

impl fmt::Display for CellGlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}:{:x}", self.coarse_cell, self.level, self.morton)
    }
}

/// Axes along which a cell is to be cut; bit `a` selects axis `a`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RefinementCase(u8);

impl RefinementCase {
    pub const fn cut_axes(bits: u8) -> Self {
        RefinementCase(bits)
    }

    /// Cut along every axis.
    pub const fn isotropic(dim: usize) -> Self {
        RefinementCase(((1u16 << dim) - 1) as u8)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_isotropic(self, dim: usize) -> bool {
        self.0 == Self::isotropic(dim).0
    }
}

#[derive(Debug, Clone)]
struct CellData<const D: usize> {
    coarse: u32,
    tree: u32,
    level: u8,
    coords: [u32; D],
    parent: Option<CellId>,
    children: Option<Vec<CellId>>,
    vertices: Vec<u32>,
    subdomain: Option<u32>,
    level_subdomain: Option<u32>,
    refine_flag: Option<RefinementCase>,
    coarsen_flag: bool,
    alive: bool,
}

impl<const D: usize> CellData<D> {
    fn quadrant(&self) -> Quadrant<D> {
        Quadrant {
            tree: self.tree,
            level: self.level,
            coords: self.coords,
        }
    }
}

/// The local cell hierarchy.
#[derive(Debug, Clone)]
pub struct CellTree<const D: usize> {
    cells: Vec<CellData<D>>,
    free: Vec<u32>,
    coarse_cells: Vec<Vec<u32>>,
    tree_to_coarse: Vec<u32>,
    positions: Vec<[f64; D]>,
    keys: Vec<LatticeKey>,
    vertex_index: HashMap<LatticeKey, u32>,
    n_coarse_vertices: usize,
    my_subdomain: u32,
}

impl<const D: usize> CellTree<D> {
    /// Coarse cells only, all artificial until the first sync.
    pub fn new(mesh: &CoarseMesh<D>, tree_to_coarse: &[usize], my_subdomain: u32) -> Self {
        let mut coarse_to_tree = vec![0u32; tree_to_coarse.len()];
        for (t, &c) in tree_to_coarse.iter().enumerate() {
            coarse_to_tree[c] = t as u32;
        }
        let corner_weight = (Quadrant::<D>::ROOT_LEN as u64).pow(D as u32);
        let mut keys = Vec::with_capacity(mesh.n_vertices());
        let mut vertex_index = HashMap::with_capacity(mesh.n_vertices());
        for v in 0..mesh.n_vertices() as u32 {
            let key = LatticeKey::from_terms(vec![(v, corner_weight)]);
            vertex_index.insert(key.clone(), v);
            keys.push(key);
        }
        let cells = mesh
            .cells()
            .iter()
            .enumerate()
            .map(|(c, verts)| CellData {
                coarse: c as u32,
                tree: coarse_to_tree[c],
                level: 0,
                coords: [0; D],
                parent: None,
                children: None,
                vertices: verts.clone(),
                subdomain: None,
                level_subdomain: None,
                refine_flag: None,
                coarsen_flag: false,
                alive: true,
            })
            .collect();
        Self {
            cells,
            free: Vec::new(),
            coarse_cells: mesh.cells().to_vec(),
            tree_to_coarse: tree_to_coarse.iter().map(|&c| c as u32).collect(),
            positions: mesh.vertices().to_vec(),
            keys,
            vertex_index,
            n_coarse_vertices: mesh.n_vertices(),
            my_subdomain,
        }
    }

    /// A fresh hierarchy synchronized with `leaves`; vertex positions are
    /// carried over by key, so moved vertices stay where they were.
    pub fn rebuilt(&self, leaves: &[(Quadrant<D>, u32)]) -> Result<Self, MeshForestError> {
        let coarse_positions: Vec<[f64; D]> = self.positions[..self.n_coarse_vertices()].to_vec();
        let mut fresh = Self {
            cells: Vec::new(),
            free: Vec::new(),
            coarse_cells: self.coarse_cells.clone(),
            tree_to_coarse: self.tree_to_coarse.clone(),
            positions: coarse_positions,
            keys: self.keys[..self.n_coarse_vertices()].to_vec(),
            vertex_index: HashMap::new(),
            n_coarse_vertices: self.n_coarse_vertices,
            my_subdomain: self.my_subdomain,
        };
        for (v, key) in fresh.keys.iter().enumerate() {
            fresh.vertex_index.insert(key.clone(), v as u32);
        }
        for c in 0..self.n_coarse_cells() {
            let mut root = self.cells[c].clone();
            root.children = None;
            root.subdomain = None;
            root.level_subdomain = None;
            root.refine_flag = None;
            root.coarsen_flag = false;
            fresh.cells.push(root);
        }
        fresh.sync_from_leaves(leaves)?;
        for v in fresh.n_coarse_vertices()..fresh.positions.len() {
            if let Some(&old) = self.vertex_index.get(&fresh.keys[v]) {
                fresh.positions[v] = self.positions[old as usize];
            }
        }
        Ok(fresh)
    }

    pub fn my_subdomain(&self) -> u32 {
        self.my_subdomain
    }

    pub fn n_coarse_cells(&self) -> usize {
        self.coarse_cells.len()
    }

    /// Coarse vertices keep their ids `0..n` in every hierarchy.
    pub fn n_coarse_vertices(&self) -> usize {
        self.n_coarse_vertices
    }

    /// Cell with the given id, if it exists.
    pub fn get(&self, id: CellId) -> Option<CellRef<'_, D>> {
        self.cells
            .get(id.index())
            .filter(|c| c.alive)
            .map(|_| CellRef { tree: self, id })
    }

    /// The root cell of coarse cell `coarse`.
    pub fn coarse_cell(&self, coarse: usize) -> Option<CellRef<'_, D>> {
        (coarse < self.n_coarse_cells()).then(|| CellRef {
            tree: self,
            id: CellId(coarse as u32),
        })
    }

    fn data(&self, id: CellId) -> &CellData<D> {
        &self.cells[id.index()]
    }

    /// The cell matching `q`, if the hierarchy reaches that deep.
    pub fn find_quadrant(&self, q: &Quadrant<D>) -> Option<CellId> {
        let mut id = CellId(*self.tree_to_coarse.get(q.tree as usize)?);
        for level in 1..=q.level {
            let children = self.data(id).children.as_ref()?;
            id = children[q.ancestor(level).child_id()];
        }
        Some(id)
    }

    /// Every live cell, trees in forest order, parents before children.
    pub fn cells_in_forest_order(&self) -> Vec<CellId> {
        let mut out = Vec::with_capacity(self.cells.len());
        for &root in &self.tree_to_coarse {
            self.preorder(CellId(root), &mut out, false);
        }
        out
    }

    /// Active cells in forest order.
    pub fn active_cells(&self) -> Vec<CellId> {
        let mut out = Vec::new();
        for &root in &self.tree_to_coarse {
            self.preorder(CellId(root), &mut out, true);
        }
        out
    }

    fn preorder(&self, id: CellId, out: &mut Vec<CellId>, active_only: bool) {
        match &self.data(id).children {
            Some(children) => {
                if !active_only {
                    out.push(id);
                }
                for &c in children {
                    self.preorder(c, out, active_only);
                }
            }
            None => out.push(id),
        }
    }

    /// Number of locally owned active cells.
    pub fn n_locally_owned_active(&self) -> usize {
        self.cells
            .iter()
            .filter(|c| c.alive && c.children.is_none() && c.subdomain == Some(self.my_subdomain))
            .count()
    }

    /// One more than the finest level present.
    pub fn n_levels(&self) -> usize {
        self.cells
            .iter()
            .filter(|c| c.alive)
            .map(|c| c.level as usize + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn n_vertices(&self) -> usize {
        self.positions.len()
    }

    pub fn vertex_positions(&self) -> &[[f64; D]] {
        &self.positions
    }

    pub fn vertex_key(&self, vertex: u32) -> Option<&LatticeKey> {
        self.keys.get(vertex as usize)
    }

    pub fn find_vertex(&self, key: &LatticeKey) -> Option<u32> {
        self.vertex_index.get(key).copied()
    }

    pub fn set_vertex_position(&mut self, vertex: u32, position: [f64; D]) -> Result<(), MeshForestError> {
        let slot = self
            .positions
            .get_mut(vertex as usize)
            .ok_or_else(|| MeshForestError::UnknownCell(format!("vertex {vertex}")))?;
        *slot = position;
        Ok(())
    }

    /// Vertex at `point` of coarse cell `coarse`, created on first use.
    fn vertex_at(&mut self, coarse: u32, point: &[u32; D]) -> u32 {
        let corners = &self.coarse_cells[coarse as usize];
        let key = lattice_key::<D>(corners, point);
        if let Some(&v) = self.vertex_index.get(&key) {
            return v;
        }
        let corner_pos: Vec<[f64; D]> = corners.iter().map(|&v| self.positions[v as usize]).collect();
        let v = self.positions.len() as u32;
        self.positions.push(interpolate::<D>(&corner_pos, point));
        self.keys.push(key.clone());
        self.vertex_index.insert(key, v);
        v
    }

    fn alloc(&mut self, data: CellData<D>) -> CellId {
        match self.free.pop() {
            Some(slot) => {
                self.cells[slot as usize] = data;
                CellId(slot)
            }
            None => {
                self.cells.push(data);
                CellId(self.cells.len() as u32 - 1)
            }
        }
    }

    /// Give an active cell its `2^D` children (no-op if already refined).
    pub(crate) fn refine_cell(&mut self, id: CellId) {
        if self.data(id).children.is_some() {
            return;
        }
        let parent = self.data(id).clone();
        let q = parent.quadrant();
        let mut children = Vec::with_capacity(Quadrant::<D>::CHILDREN);
        for k in 0..Quadrant::<D>::CHILDREN {
            let cq = q.child(k);
            let vertices = cq
                .corners()
                .iter()
                .map(|p| self.vertex_at(parent.coarse, p))
                .collect();
            children.push(self.alloc(CellData {
                coarse: parent.coarse,
                tree: parent.tree,
                level: cq.level,
                coords: cq.coords,
                parent: Some(id),
                children: None,
                vertices,
                subdomain: parent.subdomain,
                level_subdomain: None,
                refine_flag: None,
                coarsen_flag: false,
                alive: true,
            }));
        }
        let cell = &mut self.cells[id.index()];
        cell.children = Some(children);
        cell.subdomain = None;
        cell.refine_flag = None;
        cell.coarsen_flag = false;
    }

    /// Remove all descendants of `id`, making it active.
    pub(crate) fn coarsen_cell(&mut self, id: CellId) {
        let Some(children) = self.cells[id.index()].children.take() else {
            return;
        };
        for c in children {
            self.coarsen_cell(c);
            let cell = &mut self.cells[c.index()];
            cell.alive = false;
            cell.parent = None;
            self.free.push(c.0);
        }
        self.cells[id.index()].coarsen_flag = false;
    }

    /// Match the hierarchy to `leaves` (local and ghost leaves with their
    /// owners, sorted in forest order).
    pub fn sync_from_leaves(&mut self, leaves: &[(Quadrant<D>, u32)]) -> Result<(), MeshForestError> {
        for t in 0..self.tree_to_coarse.len() as u32 {
            let start = leaves.partition_point(|(q, _)| q.tree < t);
            let end = leaves.partition_point(|(q, _)| q.tree <= t);
            let root = CellId(self.tree_to_coarse[t as usize]);
            self.sync_cell(root, &leaves[start..end])?;
        }
        crate::debug_invariants!(self.validate_invariants(), "after sync");
        Ok(())
    }

    fn sync_cell(&mut self, id: CellId, leaves: &[(Quadrant<D>, u32)]) -> Result<(), MeshForestError> {
        let q = self.data(id).quadrant();
        let Some(&(first, owner)) = leaves.first() else {
            self.coarsen_cell(id);
            self.cells[id.index()].subdomain = None;
            return Ok(());
        };
        if first == q {
            if leaves.len() != 1 {
                return Err(MeshForestError::InvariantViolation(format!(
                    "leaf {q} overlaps {} finer leaves",
                    leaves.len() - 1
                )));
            }
            self.coarsen_cell(id);
            self.cells[id.index()].subdomain = Some(owner);
            return Ok(());
        }
        if !q.is_ancestor_of(&first) {
            return Err(MeshForestError::InvariantViolation(format!(
                "leaf {first} is not inside cell {q}"
            )));
        }
        self.refine_cell(id);
        self.cells[id.index()].subdomain = None;
        let children = self.data(id).children.clone().unwrap_or_default();
        let mut rest = leaves;
        for (k, child) in children.into_iter().enumerate() {
            let cq = q.child(k);
            let n = rest.iter().take_while(|(l, _)| cq.contains(l)).count();
            self.sync_cell(child, &rest[..n])?;
            rest = &rest[n..];
        }
        if let Some((stray, _)) = rest.first() {
            return Err(MeshForestError::InvariantViolation(format!(
                "leaf {stray} is out of forest order below {q}"
            )));
        }
        Ok(())
    }

    /// Assign level subdomains: active cells use their subdomain, refined
    /// cells the one of their first descendant leaf. With `enabled == false`
    /// refined cells get none.
    pub fn compute_level_subdomains(&mut self, enabled: bool) {
        for &root in &self.tree_to_coarse.clone() {
            self.level_subdomain_of(CellId(root), enabled);
        }
    }

    fn level_subdomain_of(&mut self, id: CellId, enabled: bool) -> Option<u32> {
        let children = self.data(id).children.clone();
        let value = match children {
            None => self.data(id).subdomain,
            Some(children) => {
                let mut first = None;
                for (k, c) in children.into_iter().enumerate() {
                    let s = self.level_subdomain_of(c, enabled);
                    if k == 0 {
                        first = s;
                    }
                }
                if enabled { first } else { None }
            }
        };
        self.cells[id.index()].level_subdomain = value;
        value
    }

    pub fn set_refine_flag(&mut self, id: CellId, case: RefinementCase) -> Result<(), MeshForestError> {
        self.live_mut(id)?.refine_flag = Some(case);
        Ok(())
    }

    pub fn clear_refine_flag(&mut self, id: CellId) -> Result<(), MeshForestError> {
        self.live_mut(id)?.refine_flag = None;
        Ok(())
    }

    pub fn set_coarsen_flag(&mut self, id: CellId) -> Result<(), MeshForestError> {
        self.live_mut(id)?.coarsen_flag = true;
        Ok(())
    }

    pub fn clear_coarsen_flag(&mut self, id: CellId) -> Result<(), MeshForestError> {
        self.live_mut(id)?.coarsen_flag = false;
        Ok(())
    }

    pub fn clear_all_flags(&mut self) {
        for c in &mut self.cells {
            c.refine_flag = None;
            c.coarsen_flag = false;
        }
    }

    fn live_mut(&mut self, id: CellId) -> Result<&mut CellData<D>, MeshForestError> {
        self.cells
            .get_mut(id.index())
            .filter(|c| c.alive)
            .ok_or_else(|| MeshForestError::UnknownCell(id.to_string()))
    }

    pub fn memory_consumption(&self) -> usize {
        let cells: usize = self
            .cells
            .iter()
            .map(|c| {
                std::mem::size_of::<CellData<D>>()
                    + c.vertices.capacity() * 4
                    + c.children.as_ref().map_or(0, |v| v.capacity() * 4)
            })
            .sum();
        let keys: usize = self
            .keys
            .iter()
            .map(|k| 2 * k.terms().len() * std::mem::size_of::<(u32, u64)>())
            .sum();
        std::mem::size_of::<Self>()
            + cells
            + keys
            + self.positions.capacity() * std::mem::size_of::<[f64; D]>()
            + self.free.capacity() * 4
    }
}

impl<const D: usize> DebugInvariants for CellTree<D> {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "CellTree");
    }

    fn validate_invariants(&self) -> Result<(), MeshForestError> {
        for (i, cell) in self.cells.iter().enumerate().filter(|(_, c)| c.alive) {
            let id = CellId(i as u32);
            if let Some(children) = &cell.children {
                if children.len() != Quadrant::<D>::CHILDREN {
                    return Err(MeshForestError::InvariantViolation(format!(
                        "{id} has {} children",
                        children.len()
                    )));
                }
                for (k, c) in children.iter().enumerate() {
                    let child = &self.cells[c.index()];
                    if !child.alive || child.parent != Some(id) || child.quadrant() != cell.quadrant().child(k) {
                        return Err(MeshForestError::InvariantViolation(format!(
                            "{c} is not child {k} of {id}"
                        )));
                    }
                }
                if cell.subdomain.is_some() {
                    return Err(MeshForestError::InvariantViolation(format!(
                        "refined {id} carries a subdomain"
                    )));
                }
            }
            if cell.vertices.len() != Quadrant::<D>::CHILDREN
                || cell.vertices.iter().any(|&v| v as usize >= self.positions.len())
            {
                return Err(MeshForestError::InvariantViolation(format!(
                    "{id} has malformed vertex list {:?}",
                    cell.vertices
                )));
            }
        }
        Ok(())
    }
}

/// Read-only view of one cell.
#[derive(Copy, Clone)]
pub struct CellRef<'a, const D: usize> {
    tree: &'a CellTree<D>,
    id: CellId,
}

impl<'a, const D: usize> CellRef<'a, D> {
    fn data(&self) -> &'a CellData<D> {
        &self.tree.cells[self.id.index()]
    }

    pub fn id(&self) -> CellId {
        self.id
    }

    pub fn level(&self) -> u8 {
        self.data().level
    }

    /// Index of the coarse cell this cell descends from.
    pub fn coarse_cell(&self) -> usize {
        self.data().coarse as usize
    }

    /// Index of the forest tree this cell lives in.
    pub fn tree_index(&self) -> u32 {
        self.data().tree
    }

    pub fn quadrant(&self) -> Quadrant<D> {
        self.data().quadrant()
    }

    pub fn global_id(&self) -> CellGlobalId {
        let data = self.data();
        CellGlobalId {
            coarse_cell: data.coarse,
            level: data.level,
            morton: data.quadrant().morton(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.data().children.is_none()
    }

    pub fn has_children(&self) -> bool {
        self.data().children.is_some()
    }

    pub fn child(&self, k: usize) -> Option<CellRef<'a, D>> {
        let id = *self.data().children.as_ref()?.get(k)?;
        Some(CellRef { tree: self.tree, id })
    }

    pub fn children(&self) -> Vec<CellRef<'a, D>> {
        self.data()
            .children
            .iter()
            .flatten()
            .map(|&id| CellRef { tree: self.tree, id })
            .collect()
    }

    pub fn parent(&self) -> Option<CellRef<'a, D>> {
        self.data().parent.map(|id| CellRef { tree: self.tree, id })
    }

    /// Owner of an active cell; `None` for artificial and refined cells.
    pub fn subdomain_id(&self) -> Option<u32> {
        self.data().subdomain
    }

    pub fn level_subdomain_id(&self) -> Option<u32> {
        self.data().level_subdomain
    }

    pub fn ownership(&self) -> CellOwnership {
        CellOwnership::classify(self.data().subdomain, self.tree.my_subdomain)
    }

    pub fn is_locally_owned(&self) -> bool {
        self.is_active() && self.ownership().is_locally_owned()
    }

    pub fn is_ghost(&self) -> bool {
        self.is_active() && self.ownership().is_ghost()
    }

    pub fn is_artificial(&self) -> bool {
        self.is_active() && self.ownership().is_artificial()
    }

    pub fn is_locally_owned_on_level(&self) -> bool {
        self.data().level_subdomain == Some(self.tree.my_subdomain)
    }

    /// Vertex id of corner `c`.
    pub fn vertex_index(&self, c: usize) -> u32 {
        self.data().vertices[c]
    }

    pub fn vertex_indices(&self) -> &'a [u32] {
        &self.data().vertices
    }

    pub fn vertex(&self, c: usize) -> [f64; D] {
        self.tree.positions[self.vertex_index(c) as usize]
    }

    /// Mean of the corner positions.
    pub fn center(&self) -> [f64; D] {
        let mut x = [0.0; D];
        let verts = self.vertex_indices();
        for &v in verts {
            for (xa, pa) in x.iter_mut().zip(&self.tree.positions[v as usize]) {
                *xa += pa;
            }
        }
        x.map(|xa| xa / verts.len() as f64)
    }

    pub fn refine_flag(&self) -> Option<RefinementCase> {
        self.data().refine_flag
    }

    pub fn coarsen_flag(&self) -> bool {
        self.data().coarsen_flag
    }
}

impl<const D: usize> fmt::Debug for CellRef<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellRef")
            .field("id", &self.id)
            .field("global_id", &self.global_id())
            .field("subdomain", &self.subdomain_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(n: usize) -> (CoarseMesh<2>, Vec<usize>) {
        let mesh = CoarseMesh::<2>::hyper_cube(n).unwrap();
        let order = (0..mesh.n_cells()).collect();
        (mesh, order)
    }

    #[test]
    fn refinement_shares_vertices_between_trees() {
        let (mesh, order) = square(2);
        let mut tree = CellTree::new(&mesh, &order, 0);
        tree.refine_cell(CellId::new(0));
        tree.refine_cell(CellId::new(1));
        // 9 coarse vertices; the second cell reuses the shared edge midpoint
        assert_eq!(tree.n_vertices(), 9 + 5 + 4);
        let left = tree.coarse_cell(0).unwrap().child(1).unwrap();
        let right = tree.coarse_cell(1).unwrap().child(0).unwrap();
        assert_eq!(left.vertex_index(1), right.vertex_index(0));
        assert_eq!(left.vertex(3), [0.5, 0.25]);
        tree.validate_invariants().unwrap();
    }

    #[test]
    fn sync_materializes_owned_and_ghost_leaves() {
        let (mesh, order) = square(1);
        let mut tree = CellTree::new(&mesh, &order, 1);
        let root = Quadrant::<2>::root(0);
        let leaves: Vec<_> = (0..4).map(|i| (root.child(i), i as u32)).collect();
        tree.sync_from_leaves(&leaves[1..3]).unwrap();
        let active = tree.active_cells();
        assert_eq!(active.len(), 4);
        let owners: Vec<_> = active
            .iter()
            .map(|&id| tree.get(id).unwrap().ownership())
            .collect();
        assert_eq!(
            owners,
            vec![
                CellOwnership::Artificial,
                CellOwnership::LocallyOwned,
                CellOwnership::Ghost { owner: 2 },
                CellOwnership::Artificial,
            ]
        );
        assert_eq!(tree.n_locally_owned_active(), 1);
        assert!(tree.coarse_cell(0).unwrap().subdomain_id().is_none());
    }

    #[test]
    fn coarsening_through_sync_recycles_cells() {
        let (mesh, order) = square(1);
        let mut tree = CellTree::new(&mesh, &order, 0);
        let root = Quadrant::<2>::root(0);
        let fine: Vec<_> = root.children().into_iter().map(|q| (q, 0)).collect();
        tree.sync_from_leaves(&fine).unwrap();
        tree.sync_from_leaves(&[(root, 0)]).unwrap();
        assert_eq!(tree.active_cells(), vec![CellId::new(0)]);
        tree.sync_from_leaves(&fine).unwrap();
        assert_eq!(tree.cells.len(), 5);
        assert_eq!(tree.find_quadrant(&root.child(2)).map(|id| tree.get(id).unwrap().quadrant()), Some(root.child(2)));
    }

    #[test]
    fn rebuild_keeps_moved_vertices() {
        let (mesh, order) = square(1);
        let mut tree = CellTree::new(&mesh, &order, 0);
        let root = Quadrant::<2>::root(0);
        let fine: Vec<_> = root.children().into_iter().map(|q| (q, 0)).collect();
        tree.sync_from_leaves(&fine).unwrap();
        let centre = tree.coarse_cell(0).unwrap().child(0).unwrap().vertex_index(3);
        tree.set_vertex_position(centre, [0.6, 0.4]).unwrap();
        let fresh = tree.rebuilt(&fine).unwrap();
        let centre = fresh.coarse_cell(0).unwrap().child(3).unwrap().vertex_index(0);
        assert_eq!(fresh.vertex_positions()[centre as usize], [0.6, 0.4]);
    }

    #[test]
    fn level_subdomains_follow_first_child() {
        let (mesh, order) = square(1);
        let mut tree = CellTree::new(&mesh, &order, 3);
        let root = Quadrant::<2>::root(0);
        let leaves: Vec<_> = (0..4).map(|i| (root.child(i), 3 - i as u32)).collect();
        tree.sync_from_leaves(&leaves).unwrap();
        tree.compute_level_subdomains(true);
        let coarse = tree.coarse_cell(0).unwrap();
        assert_eq!(coarse.level_subdomain_id(), Some(3));
        assert!(coarse.is_locally_owned_on_level());
        tree.compute_level_subdomains(false);
        assert_eq!(tree.coarse_cell(0).unwrap().level_subdomain_id(), None);
    }

    #[test]
    fn isotropic_case_covers_all_axes() {
        assert!(RefinementCase::isotropic(3).is_isotropic(3));
        assert!(!RefinementCase::cut_axes(0b01).is_isotropic(2));
        assert_eq!(RefinementCase::isotropic(2).bits(), 0b11);
    }
}
