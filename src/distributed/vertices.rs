//! Propagation of locally moved vertex positions to the other ranks.
//!
//! A moved vertex travels as its lattice key (which every rank that knows
//! the vertex derives identically) followed by its new coordinates:
//! `[WireCount][WireKeyTerm; n][f64; 3]`, little-endian, unused
//! coordinates zero.

use crate::algs::communicator::Communicator;
use crate::algs::wire::{WireCount, WireKeyTerm};
use crate::forest::lattice::LatticeKey;
use crate::mesh_error::MeshForestError;
use crate::topology::cell_tree::CellTree;
use std::mem::size_of;

const COORDS: usize = 3;

fn encode<const D: usize>(key: &LatticeKey, position: &[f64; D], out: &mut Vec<u8>) {
    let terms = key.to_wire();
    out.extend_from_slice(bytemuck::bytes_of(&WireCount::new(terms.len())));
    out.extend_from_slice(bytemuck::cast_slice(&terms));
    for a in 0..COORDS {
        let x = position.get(a).copied().unwrap_or(0.0);
        out.extend_from_slice(&x.to_le_bytes());
    }
}

fn decode<const D: usize>(bytes: &[u8], from: usize) -> Result<Vec<(LatticeKey, [f64; D])>, MeshForestError> {
    let malformed = || MeshForestError::Communication(format!("malformed moved-vertex record from rank {from}"));
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < bytes.len() {
        let head = bytes.get(pos..pos + size_of::<WireCount>()).ok_or_else(malformed)?;
        let n = bytemuck::pod_read_unaligned::<WireCount>(head).get();
        pos += size_of::<WireCount>();
        let terms_len = n * size_of::<WireKeyTerm>();
        let terms: Vec<WireKeyTerm> =
            bytemuck::pod_collect_to_vec(bytes.get(pos..pos + terms_len).ok_or_else(malformed)?);
        pos += terms_len;
        let mut position = [0.0; D];
        for a in 0..COORDS {
            let raw = bytes.get(pos..pos + 8).ok_or_else(malformed)?;
            let mut le = [0u8; 8];
            le.copy_from_slice(raw);
            if let Some(x) = position.get_mut(a) {
                *x = f64::from_le_bytes(le);
            }
            pos += 8;
        }
        out.push((LatticeKey::from_wire(&terms), position));
    }
    Ok(out)
}

/// Send the positions of the vertices flagged in `moved` to all ranks and
/// apply the positions received from the others to the vertices known
/// locally. Returns the number of local vertices updated. Collective.
pub fn communicate_locally_moved_vertices<const D: usize, C: Communicator + ?Sized>(
    comm: &C,
    cells: &mut CellTree<D>,
    moved: &[bool],
) -> Result<usize, MeshForestError> {
    if moved.len() != cells.n_vertices() {
        return Err(MeshForestError::VertexMaskLength {
            expected: cells.n_vertices(),
            got: moved.len(),
        });
    }
    let mut send = Vec::new();
    for (v, _) in moved.iter().enumerate().filter(|(_, m)| **m) {
        if let Some(key) = cells.vertex_key(v as u32) {
            encode(key, &cells.vertex_positions()[v], &mut send);
        }
    }
    let rank = comm.rank();
    let mut updated = 0;
    for (from, bytes) in comm.allgather_bytes(&send)?.iter().enumerate() {
        if from == rank {
            continue;
        }
        for (key, position) in decode::<D>(bytes, from)? {
            if let Some(v) = cells.find_vertex(&key) {
                cells.set_vertex_position(v, position)?;
                updated += 1;
            }
        }
    }
    log::debug!("[rank {rank}] applied {updated} moved vertex positions from other ranks");
    Ok(updated)
}
