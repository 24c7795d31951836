//! `<stem>.info`: metadata written next to the forest and data files.
//!
//! Rank 0 writes and reads the document; on load its bytes are broadcast so
//! every rank parses the same text and fails in the same way.

use crate::algs::collective::agree_on_result;
use crate::algs::communicator::Communicator;
use crate::algs::wire::WIRE_VERSION;
use crate::distributed::settings::Settings;
use crate::io::parallel_file::with_suffix;
use crate::mesh_error::MeshForestError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Contents of the info file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveInfo {
    pub version: u16,
    pub dim: usize,
    pub n_procs: usize,
    pub n_coarse_cells: usize,
    pub n_global_quadrants: u64,
    pub global_first_quadrant: Vec<u64>,
    pub n_attached_fixed: usize,
    pub n_attached_variable: usize,
    pub sizes_fixed_cumulative: Vec<u32>,
    pub settings: Settings,
}

impl SaveInfo {
    pub fn path(stem: &Path) -> std::path::PathBuf {
        with_suffix(stem, ".info")
    }

    /// Write the document from rank 0. Collective.
    pub fn write<C: Communicator + ?Sized>(&self, comm: &C, stem: &Path) -> Result<(), MeshForestError> {
        let path = Self::path(stem);
        let local = if comm.rank() == 0 {
            serde_json::to_vec_pretty(self)
                .map_err(|e| MeshForestError::save_format(&path, e.to_string()))
                .and_then(|bytes| std::fs::write(&path, bytes).map_err(|e| MeshForestError::io(&path, e)))
        } else {
            Ok(())
        };
        agree_on_result(comm, local)
    }

    /// Read the document on rank 0 and share it with every rank. Collective.
    pub fn read<C: Communicator + ?Sized>(comm: &C, stem: &Path) -> Result<Self, MeshForestError> {
        let path = Self::path(stem);
        let local = if comm.rank() == 0 {
            std::fs::read(&path).map_err(|e| MeshForestError::io(&path, e))
        } else {
            Ok(Vec::new())
        };
        let bytes = agree_on_result(comm, local)?;
        let bytes = comm.broadcast_bytes(0, &bytes)?;
        let info: SaveInfo =
            serde_json::from_slice(&bytes).map_err(|e| MeshForestError::save_format(&path, e.to_string()))?;
        if info.version != WIRE_VERSION {
            return Err(MeshForestError::save_format(
                &path,
                format!("format version {} (expected {WIRE_VERSION})", info.version),
            ));
        }
        if info.global_first_quadrant.len() != info.n_procs + 1
            || info.global_first_quadrant.last() != Some(&info.n_global_quadrants)
        {
            return Err(MeshForestError::save_format(
                &path,
                "partition offsets do not match the process count",
            ));
        }
        Ok(info)
    }

    /// Fail unless the file was written for a mesh like the one loading it.
    pub fn check_compatible(&self, stem: &Path, dim: usize, n_coarse_cells: usize) -> Result<(), MeshForestError> {
        if self.dim != dim || self.n_coarse_cells != n_coarse_cells {
            return Err(MeshForestError::save_format(
                Self::path(stem),
                format!(
                    "saved from a {}-D mesh with {} coarse cells, loading into a {dim}-D mesh with {n_coarse_cells}",
                    self.dim, self.n_coarse_cells
                ),
            ));
        }
        Ok(())
    }
}
