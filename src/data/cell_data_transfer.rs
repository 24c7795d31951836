//! One value per active cell, carried through refinement, coarsening,
//! repartitioning and checkpoints.
//!
//! Values are handed in and returned aligned with
//! [`Triangulation::locally_owned_active_cells`]. A refined cell passes its
//! value to every child; a coarsened family is merged by a [`Restriction`].
//!
//! Values are packed inside the cycle, which a callback cannot abort. A
//! cell whose value cannot be packed travels as a zero-filled value and
//! the first such error is kept: [`CellDataTransfer::packing_failure`]
//! reports it right after the cycle and [`CellDataTransfer::unpack`]
//! returns it instead of any values.

use crate::algs::communicator::Communicator;
use crate::distributed::{AttachHandle, CellStatus, Triangulation};
use crate::mesh_error::MeshForestError;
use crate::topology::cell_tree::{CellId, CellRef};
use bytemuck::Pod;
use hashbrown::HashMap;
use num_traits::{Num, NumCast};
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::Arc;

/// How the values of a coarsened family become the parent's value.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Restriction {
    /// All children must carry the same value.
    #[default]
    CheckEquality,
    Sum,
    Mean,
}

impl Restriction {
    fn apply<T>(self, values: &[T]) -> Result<T, String>
    where
        T: Copy + PartialEq + Num + NumCast,
    {
        let Some(&first) = values.first() else {
            return Err("no child values".into());
        };
        match self {
            Restriction::CheckEquality => {
                if values.iter().all(|v| *v == first) {
                    Ok(first)
                } else {
                    Err("children carry different values".into())
                }
            }
            Restriction::Sum => Ok(values.iter().fold(T::zero(), |acc, &v| acc + v)),
            Restriction::Mean => {
                let n = <T as NumCast>::from(values.len()).ok_or_else(|| "family size not representable".to_string())?;
                Ok(values.iter().fold(T::zero(), |acc, &v| acc + v) / n)
            }
        }
    }
}

/// Transfers a `T` per locally owned active cell across one cycle.
#[derive(Debug)]
pub struct CellDataTransfer<T> {
    restriction: Restriction,
    handle: Option<AttachHandle>,
    failure: Arc<Mutex<Option<MeshForestError>>>,
    _marker: PhantomData<T>,
}

impl<T> CellDataTransfer<T>
where
    T: Pod + PartialEq + Num + NumCast + 'static,
{
    pub fn new(restriction: Restriction) -> Self {
        Self {
            restriction,
            handle: None,
            failure: Arc::new(Mutex::new(None)),
            _marker: PhantomData,
        }
    }

    /// Attach `values` to the next refinement or repartitioning cycle.
    pub fn prepare_for_coarsening_and_refinement<const D: usize, C: Communicator>(
        &mut self,
        tria: &mut Triangulation<D, C>,
        values: &[T],
    ) -> Result<(), MeshForestError> {
        let owned = tria.locally_owned_active_cells()?;
        if owned.len() != values.len() {
            return Err(MeshForestError::BufferSizeMismatch {
                context: "cell values".into(),
                expected: owned.len(),
                found: values.len(),
            });
        }
        let by_cell: HashMap<CellId, T> = owned.into_iter().zip(values.iter().copied()).collect();
        let restriction = self.restriction;
        let failure = Arc::clone(&self.failure);
        *failure.lock() = None;
        let pack = move |cell: &CellRef<'_, D>, status: CellStatus| -> Vec<u8> {
            match pack_value(&by_cell, restriction, cell, status) {
                Ok(v) => bytemuck::bytes_of(&v).to_vec(),
                Err(e) => {
                    failure.lock().get_or_insert(e);
                    vec![0u8; size_of::<T>()]
                }
            }
        };
        self.handle = Some(tria.register_data_attach(pack, false)?);
        Ok(())
    }

    /// The first error raised while packing in the last cycle, if any.
    pub fn packing_failure(&self) -> Option<MeshForestError> {
        self.failure.lock().clone()
    }

    /// Attach `values` to the next [`Triangulation::save`].
    pub fn prepare_for_serialization<const D: usize, C: Communicator>(
        &mut self,
        tria: &mut Triangulation<D, C>,
        values: &[T],
    ) -> Result<(), MeshForestError> {
        self.prepare_for_coarsening_and_refinement(tria, values)
    }

    /// Values for the current locally owned active cells after the cycle.
    pub fn unpack<const D: usize, C: Communicator>(
        &mut self,
        tria: &mut Triangulation<D, C>,
    ) -> Result<Vec<T>, MeshForestError> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| MeshForestError::StaleAttachHandle {
                handle: "cell data (not attached)".into(),
                deliverable: None,
            })?;
        let failed = self.failure.lock().take();
        if let Some(e) = failed {
            // release the rows anyway; they only hold placeholders
            let _ = tria.notify_ready_to_unpack(&handle, |_, _, _| {});
            return Err(e);
        }
        let mut by_cell: HashMap<CellId, T> = HashMap::new();
        let mut bad_size = None;
        tria.notify_ready_to_unpack(&handle, |cell, status, bytes| {
            if bytes.len() != size_of::<T>() {
                bad_size.get_or_insert(bytes.len());
                return;
            }
            let value: T = bytemuck::pod_read_unaligned(bytes);
            match status {
                CellStatus::Refine => {
                    for child in cell.children() {
                        by_cell.insert(child.id(), value);
                    }
                }
                _ => {
                    by_cell.insert(cell.id(), value);
                }
            }
        })?;
        if let Some(found) = bad_size {
            return Err(MeshForestError::BufferSizeMismatch {
                context: "cell value".into(),
                expected: size_of::<T>(),
                found,
            });
        }
        tria.locally_owned_active_cells()?
            .into_iter()
            .map(|id| {
                by_cell
                    .get(&id)
                    .copied()
                    .ok_or_else(|| MeshForestError::UnknownCell(id.to_string()))
            })
            .collect()
    }

    /// Values stored by [`prepare_for_serialization`](Self::prepare_for_serialization)
    /// after [`Triangulation::load`]. Claims the next stored fixed-size
    /// attachment.
    pub fn deserialize<const D: usize, C: Communicator>(
        &mut self,
        tria: &mut Triangulation<D, C>,
    ) -> Result<Vec<T>, MeshForestError> {
        self.handle = Some(tria.register_data_attach(|_, _| Vec::new(), false)?);
        *self.failure.lock() = None;
        self.unpack(tria)
    }
}

fn pack_value<const D: usize, T>(
    by_cell: &HashMap<CellId, T>,
    restriction: Restriction,
    cell: &CellRef<'_, D>,
    status: CellStatus,
) -> Result<T, MeshForestError>
where
    T: Copy + PartialEq + Num + NumCast,
{
    let lookup = |id: CellId| {
        by_cell
            .get(&id)
            .copied()
            .ok_or_else(|| MeshForestError::UnknownCell(id.to_string()))
    };
    match status {
        CellStatus::Coarsen => {
            let values = cell
                .children()
                .iter()
                .map(|c| lookup(c.id()))
                .collect::<Result<Vec<T>, _>>()?;
            restriction
                .apply(&values)
                .map_err(|reason| MeshForestError::RestrictionFailed {
                    cell: cell.global_id().to_string(),
                    reason,
                })
        }
        _ => lookup(cell.id()),
    }
}
