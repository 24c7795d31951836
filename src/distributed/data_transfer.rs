//! Movement of per-cell byte payloads across a cycle or through files.
//!
//! Every locally owned quadrant has one *fixed row*: its [`CellStatus`] as a
//! little-endian `u32`, followed by the output of each fixed-size callback
//! in registration order. `sizes_fixed_cumulative` holds the row offsets
//! `[0, 4, 4 + w0, 4 + w0 + w1, ...]`; its last entry is the row width.
//!
//! Variable-size payloads are kept separately: per quadrant, each
//! variable-size callback contributes a `u32` length followed by that many
//! bytes, and the per-quadrant totals travel in a parallel size array.
//! `INVALID` rows carry only their status.

use crate::algs::collective::{agree_on_result, exscan_sum_u64};
use crate::algs::communicator::Communicator;
use crate::algs::wire::{read_u32_le, u32s_from_le, u32s_to_le};
use crate::distributed::attach::{AttachHandle, DataSizeKind, PackCallback};
use crate::distributed::relations::{CellStatus, RelationTable};
use crate::forest::transfer::{transfer_fixed, transfer_variable};
use crate::io::parallel_file::{create_shared, read_at, with_suffix, write_at};
use crate::mesh_error::MeshForestError;
use crate::topology::cell_tree::{CellRef, CellTree};
use log::trace;
use std::path::Path;

const STATUS_BYTES: u32 = 4;

/// Per-cell outputs of the callbacks before the layout is agreed on.
struct LocalPack {
    fixed: Vec<Option<Vec<Vec<u8>>>>,
    widths: Option<Vec<u32>>,
    sizes: Vec<u32>,
    variable: Vec<u8>,
}

#[derive(Debug, Default, Clone)]
pub struct DataTransfer {
    sizes_fixed_cumulative: Vec<u32>,
    n_variable: usize,
    src_fixed: Vec<u8>,
    src_sizes: Vec<u32>,
    src_variable: Vec<u8>,
    dest_fixed: Vec<u8>,
    dest_sizes: Vec<u32>,
    dest_variable: Vec<u8>,
    dest_starts: Vec<usize>,
}

impl DataTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sizes_fixed_cumulative(&self) -> &[u32] {
        &self.sizes_fixed_cumulative
    }

    /// Bytes per fixed row, status included.
    pub fn row_width(&self) -> usize {
        self.sizes_fixed_cumulative
            .last()
            .copied()
            .unwrap_or(STATUS_BYTES) as usize
    }

    pub fn n_fixed(&self) -> usize {
        self.sizes_fixed_cumulative.len().saturating_sub(2)
    }

    pub fn n_variable(&self) -> usize {
        self.n_variable
    }

    /// Run the callbacks on every non-`INVALID` entry of `relations` and
    /// fill the send buffers. Collective: the callback layout is compared
    /// across ranks and a mismatch fails everywhere.
    pub fn pack<const D: usize, C: Communicator + ?Sized>(
        &mut self,
        comm: &C,
        relations: &RelationTable<D>,
        cells: &CellTree<D>,
        fixed: &mut [PackCallback<D>],
        variable: &mut [PackCallback<D>],
    ) -> Result<(), MeshForestError> {
        self.clear();
        let local = agree_on_result(comm, run_callbacks(relations, cells, fixed, variable))?;
        let widths = agree_on_layout(comm, fixed.len(), variable.len(), local.widths.as_deref())?;

        let mut cumulative = Vec::with_capacity(widths.len() + 2);
        cumulative.push(0);
        cumulative.push(STATUS_BYTES);
        for w in &widths {
            let last = *cumulative.last().unwrap_or(&STATUS_BYTES);
            cumulative.push(last + w);
        }
        self.sizes_fixed_cumulative = cumulative;
        self.n_variable = variable.len();

        let row = self.row_width();
        self.src_fixed = Vec::with_capacity(relations.len() * row);
        for (entry, outputs) in relations.entries().iter().zip(local.fixed) {
            let start = self.src_fixed.len();
            self.src_fixed.extend_from_slice(&entry.status.as_u32().to_le_bytes());
            for block in outputs.into_iter().flatten() {
                self.src_fixed.extend_from_slice(&block);
            }
            self.src_fixed.resize(start + row, 0);
        }
        self.src_sizes = local.sizes;
        self.src_variable = local.variable;
        trace!(
            "[rank {}] packed {} rows of {row} bytes, {} variable bytes",
            comm.rank(),
            relations.len(),
            self.src_variable.len()
        );
        Ok(())
    }

    /// Move the packed buffers from the `old_gfq` to the `new_gfq`
    /// partition. Collective.
    pub fn execute_transfer<C: Communicator + ?Sized>(
        &mut self,
        comm: &C,
        old_gfq: &[u64],
        new_gfq: &[u64],
    ) -> Result<(), MeshForestError> {
        self.dest_fixed = transfer_fixed(comm, old_gfq, new_gfq, &self.src_fixed, self.row_width())?;
        if self.n_variable > 0 {
            let (sizes, data) = transfer_variable(comm, old_gfq, new_gfq, &self.src_sizes, &self.src_variable)?;
            self.dest_sizes = sizes;
            self.dest_variable = data;
        }
        self.index_variable();
        self.src_fixed = Vec::new();
        self.src_sizes = Vec::new();
        self.src_variable = Vec::new();
        trace!(
            "[rank {}] received {} fixed and {} variable bytes",
            comm.rank(),
            self.dest_fixed.len(),
            self.dest_variable.len()
        );
        Ok(())
    }

    fn index_variable(&mut self) {
        self.dest_starts = Vec::with_capacity(self.dest_sizes.len() + 1);
        let mut acc = 0usize;
        self.dest_starts.push(0);
        for &s in &self.dest_sizes {
            acc += s as usize;
            self.dest_starts.push(acc);
        }
    }

    /// Statuses stored in the received rows, one per new local quadrant.
    pub fn unpack_cell_status(&self, n_quadrants: usize) -> Result<Vec<CellStatus>, MeshForestError> {
        let row = self.row_width();
        self.check_fixed(n_quadrants)?;
        self.dest_fixed
            .chunks_exact(row)
            .map(|r| {
                let raw = read_u32_le(r, 0).unwrap_or(u32::MAX);
                CellStatus::from_u32(raw)
                    .ok_or_else(|| MeshForestError::InvariantViolation(format!("unknown cell status {raw}")))
            })
            .collect()
    }

    fn check_fixed(&self, n_quadrants: usize) -> Result<(), MeshForestError> {
        let expected = n_quadrants * self.row_width();
        if self.dest_fixed.len() != expected {
            return Err(MeshForestError::BufferSizeMismatch {
                context: "fixed receive buffer".into(),
                expected,
                found: self.dest_fixed.len(),
            });
        }
        Ok(())
    }

    /// Hand the bytes of attachment `handle` to `unpack`, once per
    /// non-`INVALID` entry of the new relation table.
    pub fn unpack<const D: usize, F>(
        &self,
        relations: &RelationTable<D>,
        cells: &CellTree<D>,
        handle: &AttachHandle,
        mut unpack: F,
    ) -> Result<(), MeshForestError>
    where
        F: FnMut(&CellRef<'_, D>, CellStatus, &[u8]),
    {
        self.check_fixed(relations.len())?;
        let index = handle.index();
        match handle.kind() {
            DataSizeKind::Fixed => {
                if index >= self.n_fixed() {
                    return Err(MeshForestError::CallbackLayoutMismatch(format!(
                        "no fixed-size attachment #{index}; {} were transferred",
                        self.n_fixed()
                    )));
                }
                let row = self.row_width();
                let lo = self.sizes_fixed_cumulative[index + 1] as usize;
                let hi = self.sizes_fixed_cumulative[index + 2] as usize;
                for (i, entry) in relations.entries().iter().enumerate() {
                    if entry.status == CellStatus::Invalid {
                        continue;
                    }
                    let cell = cells
                        .get(entry.cell)
                        .ok_or_else(|| MeshForestError::UnknownCell(entry.cell.to_string()))?;
                    unpack(&cell, entry.status, &self.dest_fixed[i * row + lo..i * row + hi]);
                }
            }
            DataSizeKind::Variable => {
                if index >= self.n_variable {
                    return Err(MeshForestError::CallbackLayoutMismatch(format!(
                        "no variable-size attachment #{index}; {} were transferred",
                        self.n_variable
                    )));
                }
                if self.dest_sizes.len() != relations.len() {
                    return Err(MeshForestError::BufferSizeMismatch {
                        context: "variable size array".into(),
                        expected: relations.len(),
                        found: self.dest_sizes.len(),
                    });
                }
                for (i, entry) in relations.entries().iter().enumerate() {
                    if entry.status == CellStatus::Invalid {
                        continue;
                    }
                    let blob = &self.dest_variable[self.dest_starts[i]..self.dest_starts[i + 1]];
                    let block = nth_block(blob, index, self.n_variable)?;
                    let cell = cells
                        .get(entry.cell)
                        .ok_or_else(|| MeshForestError::UnknownCell(entry.cell.to_string()))?;
                    unpack(&cell, entry.status, block);
                }
            }
        }
        Ok(())
    }

    /// Write the packed (not transferred) buffers next to `stem`, rows at
    /// the positions given by `gfq`. Collective.
    pub fn save<C: Communicator + ?Sized>(
        &self,
        comm: &C,
        stem: &Path,
        gfq: &[u64],
    ) -> Result<(), MeshForestError> {
        let rank = comm.rank();
        let n_global = gfq.last().copied().unwrap_or(0);
        let row = self.row_width() as u64;

        let fixed_path = with_suffix(stem, "-fixed.data");
        let mut header = u32s_to_le(&[self.sizes_fixed_cumulative.len() as u32]);
        header.extend(u32s_to_le(&self.sizes_fixed_cumulative));
        let header_len = header.len() as u64;
        create_shared(comm, &fixed_path, header_len + n_global * row)?;
        let mut local = if rank == 0 {
            write_at(&fixed_path, 0, &header)
        } else {
            Ok(())
        };
        if local.is_ok() {
            local = write_at(&fixed_path, header_len + gfq[rank] * row, &self.src_fixed);
        }
        agree_on_result(comm, local)?;

        if self.n_variable > 0 {
            let var_path = with_suffix(stem, "-variable.data");
            let (before, total) = exscan_sum_u64(comm, self.src_variable.len() as u64)?;
            let sizes_len = 4 * n_global;
            create_shared(comm, &var_path, sizes_len + total)?;
            let local = write_at(&var_path, 4 * gfq[rank], &u32s_to_le(&self.src_sizes))
                .and_then(|_| write_at(&var_path, sizes_len + before, &self.src_variable));
            agree_on_result(comm, local)?;
        }
        log::info!(
            "[rank {rank}] wrote {} fixed and {} variable attachments for {} cells next to {}",
            self.n_fixed(),
            self.n_variable,
            self.src_fixed.len() / self.row_width(),
            stem.display()
        );
        Ok(())
    }

    /// Read buffers written by [`save`](Self::save) for the partition
    /// `gfq`, as if they had just been transferred. Collective.
    pub fn load<C: Communicator + ?Sized>(
        &mut self,
        comm: &C,
        stem: &Path,
        gfq: &[u64],
        n_fixed: usize,
        n_variable: usize,
    ) -> Result<(), MeshForestError> {
        self.clear();
        let rank = comm.rank();
        let n_global = gfq.last().copied().unwrap_or(0);
        let first = gfq[rank];
        let count = (gfq[rank + 1] - first) as usize;

        let fixed_path = with_suffix(stem, "-fixed.data");
        let var_path = with_suffix(stem, "-variable.data");
        let local = read_cumulative(&fixed_path, n_fixed).and_then(|cumulative| {
            let header_len = 4 * (cumulative.len() as u64 + 1);
            let row = *cumulative.last().unwrap_or(&STATUS_BYTES) as u64;
            let rows = read_at(&fixed_path, header_len + first * row, count * row as usize)?;
            let sizes = if n_variable > 0 {
                u32s_from_le(&read_at(&var_path, 4 * first, 4 * count)?)
            } else {
                Vec::new()
            };
            Ok((cumulative, rows, sizes))
        });
        let (cumulative, rows, sizes) = agree_on_result(comm, local)?;
        self.sizes_fixed_cumulative = cumulative;
        self.n_variable = n_variable;
        self.dest_fixed = rows;

        if n_variable > 0 {
            let mine: u64 = sizes.iter().map(|&s| s as u64).sum();
            let (before, _) = exscan_sum_u64(comm, mine)?;
            let data = read_at(&var_path, 4 * n_global + before, mine as usize);
            self.dest_variable = agree_on_result(comm, data)?;
            self.dest_sizes = sizes;
        }
        self.index_variable();
        log::info!(
            "[rank {rank}] read attachments of {count} cells from {}",
            stem.display()
        );
        Ok(())
    }

    /// Release all buffers.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn memory_consumption(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.sizes_fixed_cumulative.capacity() * 4
            + self.src_fixed.capacity()
            + self.src_sizes.capacity() * 4
            + self.src_variable.capacity()
            + self.dest_fixed.capacity()
            + self.dest_sizes.capacity() * 4
            + self.dest_variable.capacity()
            + self.dest_starts.capacity() * std::mem::size_of::<usize>()
    }
}

fn run_callbacks<const D: usize>(
    relations: &RelationTable<D>,
    cells: &CellTree<D>,
    fixed: &mut [PackCallback<D>],
    variable: &mut [PackCallback<D>],
) -> Result<LocalPack, MeshForestError> {
    let mut out = LocalPack {
        fixed: Vec::with_capacity(relations.len()),
        widths: None,
        sizes: Vec::with_capacity(relations.len()),
        variable: Vec::new(),
    };
    for entry in relations.entries() {
        if entry.status == CellStatus::Invalid {
            out.fixed.push(None);
            out.sizes.push(0);
            continue;
        }
        let cell = cells
            .get(entry.cell)
            .ok_or_else(|| MeshForestError::UnknownCell(entry.cell.to_string()))?;
        let blocks: Vec<Vec<u8>> = fixed.iter_mut().map(|cb| cb(&cell, entry.status)).collect();
        match &out.widths {
            None => out.widths = Some(blocks.iter().map(|b| b.len() as u32).collect()),
            Some(widths) => {
                if let Some((index, (w, b))) = widths
                    .iter()
                    .zip(&blocks)
                    .enumerate()
                    .find(|(_, (w, b))| **w as usize != b.len())
                {
                    return Err(MeshForestError::FixedSizeMismatch {
                        index,
                        expected: *w as usize,
                        found: b.len(),
                    });
                }
            }
        }
        out.fixed.push(Some(blocks));

        let start = out.variable.len();
        for cb in variable.iter_mut() {
            let block = cb(&cell, entry.status);
            let len = u32::try_from(block.len()).map_err(|_| MeshForestError::BufferSizeMismatch {
                context: format!("variable-size data of {}", entry.quadrant),
                expected: u32::MAX as usize,
                found: block.len(),
            })?;
            out.variable.extend_from_slice(&len.to_le_bytes());
            out.variable.extend_from_slice(&block);
        }
        let total = out.variable.len() - start;
        out.sizes.push(u32::try_from(total).map_err(|_| MeshForestError::BufferSizeMismatch {
            context: format!("variable-size data of {}", entry.quadrant),
            expected: u32::MAX as usize,
            found: total,
        })?);
    }
    Ok(out)
}

/// Compare callback counts and fixed widths of all ranks. Ranks without
/// packed cells only contribute their counts.
fn agree_on_layout<C: Communicator + ?Sized>(
    comm: &C,
    n_fixed: usize,
    n_variable: usize,
    widths: Option<&[u32]>,
) -> Result<Vec<u32>, MeshForestError> {
    let mut record = vec![n_fixed as u32, n_variable as u32, widths.is_some() as u32];
    record.extend(widths.unwrap_or_default());
    let all: Vec<Vec<u32>> = comm
        .allgather_bytes(&u32s_to_le(&record))?
        .iter()
        .map(|b| u32s_from_le(b))
        .collect();
    let reference = all.iter().find(|r| r.get(2) == Some(&1)).unwrap_or(&all[0]);
    for (rank, r) in all.iter().enumerate() {
        let counts_differ = r.get(..2) != reference.get(..2);
        let widths_differ = r.get(2) == Some(&1) && r != reference;
        if counts_differ || widths_differ {
            return Err(MeshForestError::CallbackLayoutMismatch(format!(
                "rank {rank} registered {} fixed ({:?}) and {} variable callbacks, another rank {} fixed ({:?}) and {}",
                r.first().copied().unwrap_or(0),
                r.get(3..).unwrap_or_default(),
                r.get(1).copied().unwrap_or(0),
                reference[0],
                reference.get(3..).unwrap_or_default(),
                reference[1],
            )));
        }
    }
    if reference.get(2) == Some(&1) {
        Ok(reference[3..].to_vec())
    } else {
        Ok(vec![0; n_fixed])
    }
}

fn nth_block(blob: &[u8], index: usize, n_blocks: usize) -> Result<&[u8], MeshForestError> {
    let short = |expected: usize| MeshForestError::BufferSizeMismatch {
        context: "variable-size cell data".into(),
        expected,
        found: blob.len(),
    };
    let mut pos = 0usize;
    let mut found = None;
    for k in 0..n_blocks {
        let len = read_u32_le(blob, pos).ok_or_else(|| short(pos + 4))? as usize;
        pos += 4;
        let end = pos + len;
        if end > blob.len() {
            return Err(short(end));
        }
        if k == index {
            found = Some(&blob[pos..end]);
        }
        pos = end;
    }
    if pos != blob.len() {
        return Err(short(pos));
    }
    found.ok_or_else(|| short(pos))
}

fn read_cumulative(path: &Path, n_fixed: usize) -> Result<Vec<u32>, MeshForestError> {
    let m = read_at(path, 0, 4).map(|raw| u32s_from_le(&raw)[0] as usize)?;
    if m != n_fixed + 2 {
        return Err(MeshForestError::save_format(
            path,
            format!("holds {} fixed-size attachments, expected {n_fixed}", m.saturating_sub(2)),
        ));
    }
    let cumulative = u32s_from_le(&read_at(path, 4, 4 * m)?);
    if cumulative[..2] != [0, STATUS_BYTES] || cumulative.windows(2).any(|w| w[0] > w[1]) {
        return Err(MeshForestError::save_format(
            path,
            format!("malformed row layout {cumulative:?}"),
        ));
    }
    Ok(cumulative)
}
