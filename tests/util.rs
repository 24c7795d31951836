#![allow(dead_code)]
use mesh_forest::prelude::*;

/// Run `f` once per rank of a fresh in-process group of `n` ranks and
/// collect the results in rank order. A rank that panics aborts the group,
/// so its peers fail their next receive, and the first panic is re-raised.
pub fn run_ranks<T, F>(n: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(RayonComm) -> T + Sync,
{
    let comms = RayonComm::group(n);
    let joined: Vec<std::thread::Result<T>> = std::thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|c| {
                let f = &f;
                s.spawn(move || f(c))
            })
            .collect();
        handles.into_iter().map(|h| h.join()).collect()
    });
    let mut out = Vec::with_capacity(n);
    for result in joined {
        match result {
            Ok(value) => out.push(value),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
    out
}

/// `[0,1]^2` split into `n x n` coarse cells.
pub fn square<C: Communicator>(comm: C, n: usize, settings: Settings) -> Triangulation<2, C> {
    let mut tria = Triangulation::new(comm, settings).unwrap();
    tria.create_from_mesh(CoarseMesh::hyper_cube(n).unwrap()).unwrap();
    tria
}

/// `[0,1]^3` split into `n^3` coarse cells.
pub fn cube<C: Communicator>(comm: C, n: usize, settings: Settings) -> Triangulation<3, C> {
    let mut tria = Triangulation::new(comm, settings).unwrap();
    tria.create_from_mesh(CoarseMesh::hyper_cube(n).unwrap()).unwrap();
    tria
}

/// Global id as bytes: coarse cell, level, morton index.
pub fn id_bytes(id: &CellGlobalId) -> Vec<u8> {
    let mut out = Vec::with_capacity(13);
    out.extend_from_slice(&id.coarse_cell.to_le_bytes());
    out.push(id.level);
    out.extend_from_slice(&id.morton.to_le_bytes());
    out
}

pub fn id_from_bytes(bytes: &[u8]) -> CellGlobalId {
    CellGlobalId {
        coarse_cell: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
        level: bytes[4],
        morton: u64::from_le_bytes(bytes[5..13].try_into().unwrap()),
    }
}

/// Locally owned active cells and their global ids.
pub fn owned_ids<const D: usize, C: Communicator>(tria: &Triangulation<D, C>) -> Vec<(CellId, CellGlobalId)> {
    tria.locally_owned_active_cells()
        .unwrap()
        .into_iter()
        .map(|id| (id, tria.cell(id).unwrap().global_id()))
        .collect()
}
