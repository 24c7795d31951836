//! Registration registry for per-cell data attached to a cycle.
//!
//! `register` stores a pack callback until the next refinement,
//! repartition or save consumes it. The cycle then makes its transferred
//! data *deliverable* under a new generation number; every handle issued for
//! that generation can be used for exactly one unpack. Starting another
//! cycle discards everything: unconsumed handles of older generations are
//! rejected as stale instead of reading buffers laid out for another cycle.
//!
//! After `load`, registrations do not pack anything; each one claims the
//! next attachment stored in the files, in registration order per kind.

use crate::distributed::relations::CellStatus;
use crate::mesh_error::MeshForestError;
use crate::topology::cell_tree::CellRef;
use std::fmt;

/// Whether a callback produces the same number of bytes for every cell.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DataSizeKind {
    Fixed,
    Variable,
}

impl DataSizeKind {
    pub fn name(self) -> &'static str {
        match self {
            DataSizeKind::Fixed => "fixed-size",
            DataSizeKind::Variable => "variable-size",
        }
    }
}

/// Single-use capability returned by `register_data_attach`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AttachHandle {
    generation: u64,
    kind: DataSizeKind,
    index: usize,
}

impl AttachHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn kind(&self) -> DataSizeKind {
        self.kind
    }

    /// Position among the callbacks of the same kind.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for AttachHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.kind.name(), self.index, self.generation)
    }
}

/// Produces the bytes to attach to one cell.
pub type PackCallback<const D: usize> = Box<dyn FnMut(&CellRef<'_, D>, CellStatus) -> Vec<u8>>;

#[derive(Debug)]
struct Delivery {
    generation: u64,
    consumed_fixed: Vec<bool>,
    consumed_variable: Vec<bool>,
}

impl Delivery {
    fn slots(&mut self, kind: DataSizeKind) -> &mut Vec<bool> {
        match kind {
            DataSizeKind::Fixed => &mut self.consumed_fixed,
            DataSizeKind::Variable => &mut self.consumed_variable,
        }
    }

    fn all_consumed(&self) -> bool {
        self.consumed_fixed.iter().chain(&self.consumed_variable).all(|&c| c)
    }
}

#[derive(Debug)]
struct Claims {
    next_fixed: usize,
    next_variable: usize,
}

pub struct AttachRegistry<const D: usize> {
    generation: u64,
    pending_fixed: Vec<PackCallback<D>>,
    pending_variable: Vec<PackCallback<D>>,
    delivery: Option<Delivery>,
    claims: Option<Claims>,
}

impl<const D: usize> Default for AttachRegistry<D> {
    fn default() -> Self {
        Self {
            generation: 0,
            pending_fixed: Vec::new(),
            pending_variable: Vec::new(),
            delivery: None,
            claims: None,
        }
    }
}

impl<const D: usize> fmt::Debug for AttachRegistry<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachRegistry")
            .field("generation", &self.generation)
            .field("pending_fixed", &self.pending_fixed.len())
            .field("pending_variable", &self.pending_variable.len())
            .field("delivery", &self.delivery)
            .field("claims", &self.claims)
            .finish()
    }
}

impl<const D: usize> AttachRegistry<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `pack` for the next cycle, or claim a stored attachment after
    /// a load.
    pub fn register(
        &mut self,
        pack: PackCallback<D>,
        kind: DataSizeKind,
    ) -> Result<AttachHandle, MeshForestError> {
        if let (Some(claims), Some(delivery)) = (self.claims.as_mut(), self.delivery.as_mut()) {
            let (next, available) = match kind {
                DataSizeKind::Fixed => (&mut claims.next_fixed, delivery.consumed_fixed.len()),
                DataSizeKind::Variable => (&mut claims.next_variable, delivery.consumed_variable.len()),
            };
            if *next >= available {
                return Err(MeshForestError::DeserializeRegistrationMismatch {
                    kind: kind.name(),
                    expected: available,
                });
            }
            let handle = AttachHandle {
                generation: delivery.generation,
                kind,
                index: *next,
            };
            *next += 1;
            if claims.next_fixed == delivery.consumed_fixed.len()
                && claims.next_variable == delivery.consumed_variable.len()
            {
                self.claims = None;
            }
            drop(pack);
            return Ok(handle);
        }
        let list = match kind {
            DataSizeKind::Fixed => &mut self.pending_fixed,
            DataSizeKind::Variable => &mut self.pending_variable,
        };
        list.push(pack);
        Ok(AttachHandle {
            generation: self.generation + 1,
            kind,
            index: list.len() - 1,
        })
    }

    pub fn n_pending(&self, kind: DataSizeKind) -> usize {
        match kind {
            DataSizeKind::Fixed => self.pending_fixed.len(),
            DataSizeKind::Variable => self.pending_variable.len(),
        }
    }

    /// Start a cycle: invalidate everything deliverable and hand out the
    /// pending callbacks together with the new generation.
    pub fn begin_cycle(&mut self) -> (u64, Vec<PackCallback<D>>, Vec<PackCallback<D>>) {
        self.generation += 1;
        self.delivery = None;
        self.claims = None;
        (
            self.generation,
            std::mem::take(&mut self.pending_fixed),
            std::mem::take(&mut self.pending_variable),
        )
    }

    /// Start a load: drop pending callbacks and skip the generation their
    /// handles were issued for, so none of them can claim loaded data.
    pub fn begin_load(&mut self) -> u64 {
        let (_, fixed, variable) = self.begin_cycle();
        drop((fixed, variable));
        self.generation += 1;
        self.generation
    }

    /// Data of cycle `generation` is ready; handles of that generation may
    /// now be used once each.
    pub fn deliver(&mut self, generation: u64, n_fixed: usize, n_variable: usize) {
        self.delivery = (n_fixed + n_variable > 0).then(|| Delivery {
            generation,
            consumed_fixed: vec![false; n_fixed],
            consumed_variable: vec![false; n_variable],
        });
    }

    /// Like [`deliver`](Self::deliver), for loaded data that registrations
    /// claim in order.
    pub fn deliver_for_deserialization(&mut self, generation: u64, n_fixed: usize, n_variable: usize) {
        self.deliver(generation, n_fixed, n_variable);
        self.claims = self.delivery.as_ref().map(|_| Claims {
            next_fixed: 0,
            next_variable: 0,
        });
    }

    /// Fail unless `handle` may be used to unpack now.
    pub fn validate(&self, handle: &AttachHandle) -> Result<(), MeshForestError> {
        let stale = || MeshForestError::StaleAttachHandle {
            handle: handle.to_string(),
            deliverable: self.delivery.as_ref().map(|d| d.generation),
        };
        let delivery = self.delivery.as_ref().ok_or_else(stale)?;
        if delivery.generation != handle.generation {
            return Err(stale());
        }
        let slots = match handle.kind {
            DataSizeKind::Fixed => &delivery.consumed_fixed,
            DataSizeKind::Variable => &delivery.consumed_variable,
        };
        match slots.get(handle.index) {
            None => Err(stale()),
            Some(true) => Err(MeshForestError::AttachHandleConsumed(handle.to_string())),
            Some(false) => Ok(()),
        }
    }

    /// Mark `handle` used. Returns `true` once every deliverable handle of
    /// the generation has been used.
    pub fn consume(&mut self, handle: &AttachHandle) -> Result<bool, MeshForestError> {
        self.validate(handle)?;
        let Some(delivery) = self.delivery.as_mut() else {
            return Ok(true);
        };
        delivery.slots(handle.kind)[handle.index] = true;
        if delivery.all_consumed() {
            self.delivery = None;
            self.claims = None;
            return Ok(true);
        }
        Ok(false)
    }

    /// Drop everything, including pending registrations.
    pub fn clear(&mut self) {
        self.pending_fixed.clear();
        self.pending_variable.clear();
        self.delivery = None;
        self.claims = None;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_deliverable(&self) -> bool {
        self.delivery.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> PackCallback<2> {
        Box::new(|_, _| Vec::new())
    }

    #[test]
    fn handles_are_single_use() {
        let mut reg = AttachRegistry::<2>::new();
        let h = reg.register(noop(), DataSizeKind::Fixed).unwrap();
        let (generation, fixed, variable) = reg.begin_cycle();
        assert_eq!((fixed.len(), variable.len()), (1, 0));
        assert_eq!(h.generation(), generation);
        reg.deliver(generation, 1, 0);
        assert!(reg.consume(&h).unwrap());
        assert!(matches!(
            reg.validate(&h),
            Err(MeshForestError::StaleAttachHandle { .. })
        ));
    }

    #[test]
    fn consumed_handle_is_reported() {
        let mut reg = AttachRegistry::<2>::new();
        let a = reg.register(noop(), DataSizeKind::Fixed).unwrap();
        let _b = reg.register(noop(), DataSizeKind::Variable).unwrap();
        let (g, _, _) = reg.begin_cycle();
        reg.deliver(g, 1, 1);
        assert!(!reg.consume(&a).unwrap());
        assert_eq!(
            reg.consume(&a),
            Err(MeshForestError::AttachHandleConsumed(a.to_string()))
        );
    }

    #[test]
    fn new_cycle_invalidates_old_handles() {
        let mut reg = AttachRegistry::<2>::new();
        let h = reg.register(noop(), DataSizeKind::Fixed).unwrap();
        let (g, _, _) = reg.begin_cycle();
        reg.deliver(g, 1, 0);
        let (g2, _, _) = reg.begin_cycle();
        reg.deliver(g2, 0, 0);
        assert_eq!(
            reg.validate(&h),
            Err(MeshForestError::StaleAttachHandle {
                handle: h.to_string(),
                deliverable: None
            })
        );
    }

    #[test]
    fn loaded_attachments_are_claimed_in_order() {
        let mut reg = AttachRegistry::<2>::new();
        let (g, _, _) = reg.begin_cycle();
        reg.deliver_for_deserialization(g, 2, 0);
        let first = reg.register(noop(), DataSizeKind::Fixed).unwrap();
        assert_eq!((first.index(), first.generation()), (0, g));
        assert_eq!(
            reg.register(noop(), DataSizeKind::Variable),
            Err(MeshForestError::DeserializeRegistrationMismatch {
                kind: "variable-size",
                expected: 0
            })
        );
        let second = reg.register(noop(), DataSizeKind::Fixed).unwrap();
        assert_eq!(second.index(), 1);
        // every slot claimed: further registrations are for the next cycle
        let pending = reg.register(noop(), DataSizeKind::Fixed).unwrap();
        assert_eq!(pending.generation(), g + 1);
        assert_eq!(reg.n_pending(DataSizeKind::Fixed), 1);
    }

    #[test]
    fn handles_from_before_a_load_stay_stale() {
        let mut reg = AttachRegistry::<2>::new();
        let early = reg.register(noop(), DataSizeKind::Fixed).unwrap();
        let g = reg.begin_load();
        assert_eq!(reg.n_pending(DataSizeKind::Fixed), 0);
        assert_ne!(early.generation(), g);
        reg.deliver_for_deserialization(g, 1, 0);
        assert!(matches!(
            reg.validate(&early),
            Err(MeshForestError::StaleAttachHandle { deliverable: Some(d), .. }) if d == g
        ));
        let claimed = reg.register(noop(), DataSizeKind::Fixed).unwrap();
        assert!(reg.consume(&claimed).unwrap());
    }
}
