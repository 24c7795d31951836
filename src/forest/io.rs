//! Parallel save/load of the leaf set.
//!
//! File layout of `<stem>.forest`:
//! `[WireForestHeader][WireQuadrant; n_global]`, leaves in global forest
//! order. Rank `r` writes its rows at `32 + 24 * gfq[r]`, so the file does
//! not depend on the number of ranks that wrote it.

use crate::algs::collective::agree_on_result;
use crate::algs::communicator::Communicator;
use crate::algs::wire::{FOREST_MAGIC, WIRE_VERSION, WireForestHeader, WireQuadrant};
use crate::forest::connectivity::Connectivity;
use crate::forest::quadrant::Quadrant;
use crate::forest::{Forest, uniform_offsets};
use crate::io::parallel_file::{create_shared, read_at, write_at};
use crate::mesh_error::MeshForestError;
use std::mem::size_of;
use std::path::Path;

const HEADER: u64 = size_of::<WireForestHeader>() as u64;
const ROW: u64 = size_of::<WireQuadrant>() as u64;

impl<const D: usize> Forest<D> {
    /// Write the leaves to `path` (collective).
    pub fn save<C: Communicator + ?Sized>(&self, comm: &C, path: &Path) -> Result<(), MeshForestError> {
        let n_global = self.n_global();
        create_shared(comm, path, HEADER + ROW * n_global)?;
        let rank = comm.rank();
        let mut local = Ok(());
        if rank == 0 {
            let header = WireForestHeader::new(D, self.connectivity().n_trees() as u64, n_global);
            local = write_at(path, 0, bytemuck::bytes_of(&header));
        }
        if local.is_ok() {
            let rows: Vec<WireQuadrant> = self
                .local_quadrants()
                .iter()
                .map(|q| q.to_wire(rank as u32))
                .collect();
            let offset = HEADER + ROW * self.global_first_quadrant()[rank];
            local = write_at(path, offset, bytemuck::cast_slice(&rows));
        }
        agree_on_result(comm, local)?;
        log::info!(
            "[rank {rank}] wrote {} of {n_global} leaves to {}",
            self.n_local(),
            path.display()
        );
        Ok(())
    }

    /// Read a forest written by [`Forest::save`]. `partition` gives the
    /// offsets to load with; `None` (or offsets for another group size)
    /// selects the uniform partition, with boundaries moved out of complete
    /// families. Collective.
    pub fn load<C: Communicator + ?Sized>(
        comm: &C,
        path: &Path,
        connectivity: Connectivity<D>,
        partition: Option<&[u64]>,
    ) -> Result<Self, MeshForestError> {
        let header = agree_on_result(comm, read_header::<D>(path, connectivity.n_trees()))?;
        let n_global = header.n_quadrants();
        let size = comm.size();
        let rank = comm.rank();
        let (gfq, uniform) = match partition {
            Some(p) if p.len() == size + 1 && p.last() == Some(&n_global) => (p.to_vec(), false),
            _ => (uniform_offsets(n_global, size), true),
        };
        let count = (gfq[rank + 1] - gfq[rank]) as usize;
        let local = read_at(path, HEADER + ROW * gfq[rank], count * ROW as usize).and_then(|raw| {
            let rows: Vec<WireQuadrant> = bytemuck::pod_collect_to_vec(&raw);
            decode_rows::<D>(path, &rows, connectivity.n_trees())
        });
        let local = agree_on_result(comm, local)?;
        log::info!(
            "[rank {rank}] read {count} of {n_global} leaves from {}",
            path.display()
        );
        let mut forest = Forest::from_parts(connectivity, local, gfq, rank);
        if uniform && size > 1 {
            forest.partition(comm, None, &[])?;
        }
        Ok(forest)
    }
}

fn read_header<const D: usize>(path: &Path, n_trees: usize) -> Result<WireForestHeader, MeshForestError> {
    let raw = read_at(path, 0, HEADER as usize)?;
    let header: WireForestHeader = bytemuck::pod_read_unaligned(&raw);
    if header.magic != FOREST_MAGIC {
        return Err(MeshForestError::save_format(path, "not a forest file"));
    }
    if header.version() != WIRE_VERSION {
        return Err(MeshForestError::save_format(
            path,
            format!("format version {} (expected {WIRE_VERSION})", header.version()),
        ));
    }
    if header.dim() != D || header.n_trees() != n_trees as u64 {
        return Err(MeshForestError::save_format(
            path,
            format!(
                "written for {} trees in {}-D, loading {n_trees} trees in {D}-D",
                header.n_trees(),
                header.dim()
            ),
        ));
    }
    Ok(header)
}

fn decode_rows<const D: usize>(
    path: &Path,
    rows: &[WireQuadrant],
    n_trees: usize,
) -> Result<Vec<Quadrant<D>>, MeshForestError> {
    let local: Vec<Quadrant<D>> = rows.iter().map(|w| Quadrant::from_wire(w).0).collect();
    if let Some(q) = local
        .iter()
        .find(|q| !q.is_valid() || q.tree as usize >= n_trees)
    {
        return Err(MeshForestError::save_format(path, format!("malformed leaf {q}")));
    }
    if local.windows(2).any(|w| w[0] >= w[1]) {
        return Err(MeshForestError::save_format(path, "leaves are not in forest order"));
    }
    Ok(local)
}
