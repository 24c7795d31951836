//! Fixed, versioned, little-endian wire types for forest exchange and save files.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use std::mem::size_of;

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 1;

// All multi-byte integers in these structs are **little-endian** on the wire.
// We store them pre-LE with `.to_le()` and decode with `.from_le()`.

// ===== Forest records ======================================================

/// One quadrant plus its owning rank. Unused coordinates (2-D) are zero.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct WireQuadrant {
    pub tree_le: u32,
    pub level_le: u32,
    pub coords_le: [u32; 3],
    pub owner_le: u32,
}

impl WireQuadrant {
    pub fn new(tree: u32, level: u8, coords: &[u32], owner: u32) -> Self {
        let mut c = [0u32; 3];
        for (dst, src) in c.iter_mut().zip(coords) {
            *dst = src.to_le();
        }
        Self {
            tree_le: tree.to_le(),
            level_le: (level as u32).to_le(),
            coords_le: c,
            owner_le: owner.to_le(),
        }
    }
    pub fn tree(&self) -> u32 {
        u32::from_le(self.tree_le)
    }
    pub fn level(&self) -> u8 {
        u32::from_le(self.level_le) as u8
    }
    pub fn coord(&self, axis: usize) -> u32 {
        u32::from_le(self.coords_le[axis])
    }
    pub fn owner(&self) -> u32 {
        u32::from_le(self.owner_le)
    }
}

/// `(vertex, weight)` term of a lattice point key.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct WireKeyTerm {
    pub vertex_le: u32,
    pub reserved_le: u32, // keep zero
    pub weight_le: u64,
}

impl WireKeyTerm {
    pub fn new(vertex: u32, weight: u64) -> Self {
        Self {
            vertex_le: vertex.to_le(),
            reserved_le: 0,
            weight_le: weight.to_le(),
        }
    }
    pub fn vertex(&self) -> u32 {
        u32::from_le(self.vertex_le)
    }
    pub fn weight(&self) -> u64 {
        u64::from_le(self.weight_le)
    }
}

/// Header of a moved-vertex record: number of key terms that follow, then
/// three little-endian `f64` coordinates after the terms.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u32,
}

impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u32).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u32::from_le(self.n_le) as usize
    }
}

// ===== Save-file header ====================================================

/// Header of the `<stem>.forest` file.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct WireForestHeader {
    pub magic: [u8; 8],
    pub version_le: u16,
    pub dim_le: u16,
    pub reserved_le: u32,
    pub n_trees_le: u64,
    pub n_quadrants_le: u64,
}

pub const FOREST_MAGIC: [u8; 8] = *b"MFOREST\0";

impl WireForestHeader {
    pub fn new(dim: usize, n_trees: u64, n_quadrants: u64) -> Self {
        Self {
            magic: FOREST_MAGIC,
            version_le: WIRE_VERSION.to_le(),
            dim_le: (dim as u16).to_le(),
            reserved_le: 0,
            n_trees_le: n_trees.to_le(),
            n_quadrants_le: n_quadrants.to_le(),
        }
    }
    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }
    pub fn dim(&self) -> usize {
        u16::from_le(self.dim_le) as usize
    }
    pub fn n_trees(&self) -> u64 {
        u64::from_le(self.n_trees_le)
    }
    pub fn n_quadrants(&self) -> u64 {
        u64::from_le(self.n_quadrants_le)
    }
}

// Compile-time size checks
const_assert_eq!(size_of::<WireQuadrant>(), 24);
const_assert_eq!(size_of::<WireKeyTerm>(), 16);
const_assert_eq!(size_of::<WireCount>(), 4);
const_assert_eq!(size_of::<WireForestHeader>(), 32);

/// Read a little-endian `u32` at `offset`, if the slice is long enough.
pub fn read_u32_le(bytes: &[u8], offset: usize) -> Option<u32> {
    let raw = bytes.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

/// Decode a buffer of little-endian `u32` values.
pub fn u32s_from_le(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Encode `u32` values as little-endian bytes.
pub fn u32s_to_le(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quadrant_record_is_little_endian() {
        let w = WireQuadrant::new(3, 2, &[5, 6], 1);
        let bytes = bytemuck::bytes_of(&w);
        assert_eq!(&bytes[0..4], &[3, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[2, 0, 0, 0]);
        assert_eq!(w.coord(0), 5);
        assert_eq!(w.coord(1), 6);
        assert_eq!(w.coord(2), 0);
        assert_eq!(w.owner(), 1);
    }

    #[test]
    fn read_u32_checks_bounds() {
        let bytes = u32s_to_le(&[7, 8]);
        assert_eq!(read_u32_le(&bytes, 4), Some(8));
        assert_eq!(read_u32_le(&bytes, 5), None);
        assert_eq!(u32s_from_le(&bytes), vec![7, 8]);
    }
}
