//! Distributed triangulation: a replicated coarse mesh, a forest of
//! quadtrees/octrees partitioned over the ranks of a communicator, and the
//! process-local cell hierarchy kept in sync with it.
//!
//! Structural changes run as a cycle
//! `Stable -> Preparing -> Transferring -> Rebuilding -> Stable`:
//! flags are applied to the forest, per-cell data registered with
//! [`Triangulation::register_data_attach`] is packed, the forest is
//! repartitioned and the data migrated, the local hierarchy is rebuilt, and
//! finally the data becomes available through
//! [`Triangulation::notify_ready_to_unpack`]. All cycle operations are
//! collective. A cycle that fails after the forest was modified leaves the
//! triangulation unusable until [`Triangulation::clear`].

pub mod attach;
pub mod data_transfer;
pub mod persistence;
pub mod relations;
pub mod settings;
pub mod vertices;

pub use attach::{AttachHandle, DataSizeKind};
pub use relations::{CellRelation, CellStatus, RelationTable};
pub use settings::Settings;

use crate::algs::collective::{agree_on_result, allreduce_max_u64};
use crate::algs::communicator::Communicator;
use crate::algs::reorder::{invert_permutation, reorder_hierarchical};
use crate::algs::wire::WIRE_VERSION;
use crate::debug_invariants::DebugInvariants;
use crate::forest::quadrant::Quadrant;
use crate::forest::{Connectivity, Forest, GhostLayer};
use crate::io::parallel_file::with_suffix;
use crate::mesh_error::MeshForestError;
use crate::topology::cell_tree::{CellGlobalId, CellId, CellRef, CellTree, RefinementCase};
use crate::topology::coarse_mesh::CoarseMesh;
use crate::topology::periodic::{PeriodicFacePair, PeriodicIdentification};
use attach::AttachRegistry;
use data_transfer::DataTransfer;
use log::{debug, info, warn};
use persistence::SaveInfo;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Where a cycle currently is.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Stable,
    Preparing,
    Transferring,
    Rebuilding,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Stable => "stable",
            Phase::Preparing => "preparing",
            Phase::Transferring => "transferring",
            Phase::Rebuilding => "rebuilding",
        };
        f.write_str(name)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Cycle {
    Adapt,
    Repartition,
}

/// Per-cell partition weight; REFINE weights are charged to every child.
pub type WeightCallback<const D: usize> = Box<dyn FnMut(&CellRef<'_, D>, CellStatus) -> u32>;

/// Keeps [`Triangulation::clear`] from running while alive.
#[derive(Debug)]
pub struct Subscription {
    count: Arc<AtomicUsize>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Everything that exists once a coarse mesh has been given.
#[derive(Debug, Clone)]
struct Content<const D: usize> {
    mesh: CoarseMesh<D>,
    coarse_to_tree: Vec<usize>,
    tree_to_coarse: Vec<usize>,
    forest: Forest<D>,
    ghosts: GhostLayer<D>,
    cells: CellTree<D>,
    n_global_levels: usize,
}

pub struct Triangulation<const D: usize, C: Communicator> {
    comm: C,
    settings: Settings,
    periodic: PeriodicIdentification,
    content: Option<Content<D>>,
    registry: AttachRegistry<D>,
    transfer: DataTransfer,
    relations: Option<RelationTable<D>>,
    weight: Option<WeightCallback<D>>,
    phase: Phase,
    poisoned: Option<Phase>,
    subscribers: Arc<AtomicUsize>,
}

impl<const D: usize, C: Communicator> fmt::Debug for Triangulation<D, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Triangulation")
            .field("rank", &self.comm.rank())
            .field("size", &self.comm.size())
            .field("settings", &self.settings)
            .field("phase", &self.phase)
            .field("poisoned", &self.poisoned)
            .field("n_local", &self.content.as_ref().map(|c| c.forest.n_local()))
            .field("registry", &self.registry)
            .finish()
    }
}

impl<const D: usize, C: Communicator> Triangulation<D, C> {
    /// An empty triangulation over `comm`.
    pub fn new(comm: C, settings: Settings) -> Result<Self, MeshForestError> {
        if D != 2 && D != 3 {
            return Err(MeshForestError::UnsupportedDimension(D));
        }
        Ok(Self {
            comm,
            settings,
            periodic: PeriodicIdentification::new(),
            content: None,
            registry: AttachRegistry::new(),
            transfer: DataTransfer::new(),
            relations: None,
            weight: None,
            phase: Phase::Stable,
            poisoned: None,
            subscribers: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn settings(&self) -> Settings {
        self.settings
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn has_content(&self) -> bool {
        self.content.is_some()
    }

    // ----- lifecycle -------------------------------------------------------

    /// Build from a coarse mesh description (collective).
    pub fn create_triangulation(
        &mut self,
        vertices: Vec<[f64; D]>,
        cells: Vec<Vec<u32>>,
    ) -> Result<(), MeshForestError> {
        let mesh = CoarseMesh::new(vertices, cells)?;
        self.create_from_mesh(mesh)
    }

    /// Build from an already validated coarse mesh (collective).
    pub fn create_from_mesh(&mut self, mesh: CoarseMesh<D>) -> Result<(), MeshForestError> {
        if self.content.is_some() {
            return Err(MeshForestError::AlreadyHasContent);
        }
        let content = build_content(&self.comm, mesh, &self.periodic, self.settings)?;
        debug!(
            "[rank {}] created triangulation: {} coarse cells, {} local trees",
            self.comm.rank(),
            content.mesh.n_cells(),
            content.forest.n_local()
        );
        self.content = Some(content);
        Ok(())
    }

    /// Take the coarse mesh (and periodic faces) of an unrefined `other`.
    pub fn copy_triangulation<C2: Communicator>(
        &mut self,
        other: &Triangulation<D, C2>,
    ) -> Result<(), MeshForestError> {
        let source = other
            .content
            .as_ref()
            .ok_or(MeshForestError::EmptyTriangulation("copy_triangulation"))?;
        if source.n_global_levels > 1 {
            return Err(MeshForestError::SourceRefined {
                levels: source.n_global_levels,
            });
        }
        if self.content.is_some() {
            return Err(MeshForestError::AlreadyHasContent);
        }
        self.periodic = other.periodic.clone();
        self.create_from_mesh(source.mesh.clone())
    }

    /// Drop all content, registrations and buffers. Fails while
    /// subscriptions are alive.
    pub fn clear(&mut self) -> Result<(), MeshForestError> {
        let n = self.subscribers.load(Ordering::Acquire);
        if n > 0 {
            return Err(MeshForestError::SubscribersExist(n));
        }
        self.content = None;
        self.periodic = PeriodicIdentification::new();
        self.registry.clear();
        self.transfer.clear();
        self.relations = None;
        self.weight = None;
        self.phase = Phase::Stable;
        self.poisoned = None;
        Ok(())
    }

    /// Register an external user of this triangulation.
    pub fn subscribe(&self) -> Subscription {
        self.subscribers.fetch_add(1, Ordering::AcqRel);
        Subscription {
            count: Arc::clone(&self.subscribers),
        }
    }

    pub fn n_subscriptions(&self) -> usize {
        self.subscribers.load(Ordering::Acquire)
    }

    fn content(&self, op: &'static str) -> Result<&Content<D>, MeshForestError> {
        if let Some(phase) = self.poisoned {
            return Err(MeshForestError::CycleInterrupted {
                phase: phase.to_string(),
            });
        }
        self.content.as_ref().ok_or(MeshForestError::EmptyTriangulation(op))
    }

    /// Glue pairs of boundary faces (collective). Only before refinement.
    pub fn add_periodicity(&mut self, pairs: &[PeriodicFacePair]) -> Result<(), MeshForestError> {
        let content = self.content("add_periodicity")?;
        if content.n_global_levels > 1 {
            return Err(MeshForestError::PeriodicityAfterRefinement);
        }
        let mut periodic = self.periodic.clone();
        let mut added = 0;
        for pair in pairs {
            if periodic.insert_pair(&content.mesh, pair.clone())? {
                added += 1;
            }
        }
        if added == 0 {
            warn!("add_periodicity: all {} face pairs were already present", pairs.len());
            return Ok(());
        }
        let mesh = content.mesh.clone();
        let rebuilt = build_content(&self.comm, mesh, &periodic, self.settings)?;
        self.periodic = periodic;
        self.content = Some(rebuilt);
        debug!("[rank {}] added {added} periodic face pairs", self.comm.rank());
        Ok(())
    }

    pub fn periodic_face_pairs(&self) -> &[PeriodicFacePair] {
        self.periodic.pairs()
    }

    // ----- flags -----------------------------------------------------------

    pub fn set_refine_flag(&mut self, id: CellId) -> Result<(), MeshForestError> {
        self.set_refine_flag_case(id, RefinementCase::isotropic(D))
    }

    /// Flag `id` with an explicit refinement case; anything but isotropic
    /// refinement is rejected when the flags are applied.
    pub fn set_refine_flag_case(&mut self, id: CellId, case: RefinementCase) -> Result<(), MeshForestError> {
        self.cells_mut("set_refine_flag")?.set_refine_flag(id, case)
    }

    pub fn clear_refine_flag(&mut self, id: CellId) -> Result<(), MeshForestError> {
        self.cells_mut("clear_refine_flag")?.clear_refine_flag(id)
    }

    pub fn set_coarsen_flag(&mut self, id: CellId) -> Result<(), MeshForestError> {
        self.cells_mut("set_coarsen_flag")?.set_coarsen_flag(id)
    }

    pub fn clear_coarsen_flag(&mut self, id: CellId) -> Result<(), MeshForestError> {
        self.cells_mut("clear_coarsen_flag")?.clear_coarsen_flag(id)
    }

    fn cells_mut(&mut self, op: &'static str) -> Result<&mut CellTree<D>, MeshForestError> {
        self.content(op)?;
        self.content
            .as_mut()
            .map(|c| &mut c.cells)
            .ok_or(MeshForestError::EmptyTriangulation(op))
    }

    /// Make the flags consistent: drop flags on cells this rank does not
    /// own, let refinement win over coarsening, and keep coarsen flags only
    /// on complete, locally owned families. Returns `true` if any flag
    /// changed. Local.
    pub fn prepare_coarsening_and_refinement(&mut self) -> Result<bool, MeshForestError> {
        prepare_flags(self.cells_mut("prepare_coarsening_and_refinement")?)
    }

    // ----- cycles ----------------------------------------------------------

    /// Apply the refine and coarsen flags, rebalance (unless disabled by
    /// [`Settings::NO_AUTOMATIC_REPARTITIONING`]) and migrate attached data
    /// (collective).
    pub fn execute_coarsening_and_refinement(&mut self) -> Result<(), MeshForestError> {
        self.run(Cycle::Adapt)
    }

    /// Rebalance the current cells over the ranks and migrate attached
    /// data (collective).
    pub fn repartition(&mut self) -> Result<(), MeshForestError> {
        self.run(Cycle::Repartition)
    }

    /// Refine every cell `times` times (collective). Attached data is
    /// carried through the first cycle only.
    pub fn refine_global(&mut self, times: usize) -> Result<(), MeshForestError> {
        for _ in 0..times {
            let owned = self.locally_owned_active_cells()?;
            let cells = self.cells_mut("refine_global")?;
            for id in owned {
                cells.set_refine_flag(id, RefinementCase::isotropic(D))?;
            }
            self.execute_coarsening_and_refinement()?;
        }
        Ok(())
    }

    fn run(&mut self, cycle: Cycle) -> Result<(), MeshForestError> {
        self.content(match cycle {
            Cycle::Adapt => "execute_coarsening_and_refinement",
            Cycle::Repartition => "repartition",
        })?;
        let result = self.cycle(cycle);
        if let Err(e) = &result {
            // a repartition only mutates once the forest has migrated
            let mutated = match (cycle, self.phase) {
                (_, Phase::Stable) => false,
                (Cycle::Repartition, Phase::Preparing) => false,
                _ => true,
            };
            if mutated {
                warn!(
                    "[rank {}] cycle failed while {}: {e}",
                    self.comm.rank(),
                    self.phase
                );
                self.poisoned = Some(self.phase);
            }
            self.transfer.clear();
            self.relations = None;
            self.phase = Phase::Stable;
        }
        result
    }

    fn cycle(&mut self, cycle: Cycle) -> Result<(), MeshForestError> {
        let (generation, mut fixed, mut variable) = self.registry.begin_cycle();
        self.relations = None;
        self.transfer.clear();
        let settings = self.settings;
        let comm = &self.comm;
        let rank = comm.rank();
        let content = self
            .content
            .as_mut()
            .ok_or(MeshForestError::EmptyTriangulation("cycle"))?;

        let relations = match cycle {
            Cycle::Adapt => {
                let local = prepare_flags(&mut content.cells)
                    .and_then(|_| forest_flags(&content.forest, &content.cells));
                let (refine, coarsen) = agree_on_result(comm, local)?;
                self.phase = Phase::Preparing;
                debug!(
                    "[rank {rank}] preparing: {} refine, {} coarsen flags on {} local cells",
                    refine.iter().filter(|&&f| f).count(),
                    coarsen.iter().filter(|&&f| f).count(),
                    refine.len()
                );
                content.forest.adapt(comm, &refine, &coarsen)?;
                content.forest.balance(comm)?;
                agree_on_result(comm, RelationTable::compute(&content.forest, &content.cells))?
            }
            Cycle::Repartition => {
                self.phase = Phase::Preparing;
                debug!("[rank {rank}] preparing repartition of {} local cells", content.forest.n_local());
                agree_on_result(comm, RelationTable::persist(&content.forest, &content.cells))?
            }
        };
        self.transfer
            .pack(comm, &relations, &content.cells, &mut fixed, &mut variable)?;
        drop((fixed, variable));

        let repartition = cycle == Cycle::Repartition || !settings.contains(Settings::NO_AUTOMATIC_REPARTITIONING);
        let old_gfq = if repartition {
            let weights = match self.weight.as_mut() {
                Some(cb) => Some(agree_on_result(comm, cell_weights(cb, &relations, &content.cells))?),
                None => None,
            };
            let keep: Vec<bool> = relations
                .entries()
                .iter()
                .map(|e| e.status == CellStatus::Invalid)
                .collect();
            let old = content.forest.partition(comm, weights.as_deref(), &keep)?;
            self.phase = Phase::Transferring;
            old
        } else {
            self.phase = Phase::Transferring;
            content.forest.global_first_quadrant().to_vec()
        };
        debug!(
            "[rank {rank}] transferring: {} -> {} local cells",
            relations.len(),
            content.forest.n_local()
        );
        self.transfer
            .execute_transfer(comm, &old_gfq, content.forest.global_first_quadrant())?;

        self.phase = Phase::Rebuilding;
        let rebuild = repartition && settings.contains(Settings::MESH_RECONSTRUCTION_AFTER_REPARTITIONING);
        synchronize(comm, content, settings, rebuild)?;
        let local = self
            .transfer
            .unpack_cell_status(content.forest.n_local())
            .and_then(|statuses| RelationTable::from_statuses(&content.forest, &content.cells, &statuses));
        let relations = agree_on_result(comm, local)?;
        debug!(
            "[rank {rank}] rebuilt: {} locally owned of {} global cells, {} levels",
            content.cells.n_locally_owned_active(),
            content.forest.n_global(),
            content.n_global_levels
        );

        self.registry
            .deliver(generation, self.transfer.n_fixed(), self.transfer.n_variable());
        if self.registry.has_deliverable() {
            self.relations = Some(relations);
        } else {
            self.transfer.clear();
        }
        self.phase = Phase::Stable;
        Ok(())
    }

    // ----- attached data ---------------------------------------------------

    /// Register `pack` for the next cycle (or, right after
    /// [`load`](Self::load), claim the next stored attachment). The returned
    /// handle unpacks once, after that cycle.
    pub fn register_data_attach<F>(
        &mut self,
        pack: F,
        returns_variable_size_data: bool,
    ) -> Result<AttachHandle, MeshForestError>
    where
        F: FnMut(&CellRef<'_, D>, CellStatus) -> Vec<u8> + 'static,
    {
        self.content("register_data_attach")?;
        let kind = if returns_variable_size_data {
            DataSizeKind::Variable
        } else {
            DataSizeKind::Fixed
        };
        self.registry.register(Box::new(pack), kind)
    }

    /// Hand the data of `handle` to `unpack`, once per cell that carried
    /// data. REFINE data arrives on the refined parent, COARSEN data on the
    /// new active cell. Local.
    pub fn notify_ready_to_unpack<F>(&mut self, handle: &AttachHandle, unpack: F) -> Result<(), MeshForestError>
    where
        F: FnMut(&CellRef<'_, D>, CellStatus, &[u8]),
    {
        let content = self.content("notify_ready_to_unpack")?;
        self.registry.validate(handle)?;
        let relations = self
            .relations
            .as_ref()
            .ok_or_else(|| MeshForestError::StaleAttachHandle {
                handle: handle.to_string(),
                deliverable: None,
            })?;
        self.transfer.unpack(relations, &content.cells, handle, unpack)?;
        if self.registry.consume(handle)? {
            self.transfer.clear();
            self.relations = None;
        }
        Ok(())
    }

    /// Weight cells for repartitioning instead of counting them.
    pub fn set_cell_weight<F>(&mut self, weight: F)
    where
        F: FnMut(&CellRef<'_, D>, CellStatus) -> u32 + 'static,
    {
        self.weight = Some(Box::new(weight));
    }

    pub fn clear_cell_weight(&mut self) {
        self.weight = None;
    }

    // ----- persistence -----------------------------------------------------

    /// Write the mesh and the registered attachments to files next to
    /// `stem` (collective).
    pub fn save(&mut self, stem: impl AsRef<Path>) -> Result<(), MeshForestError> {
        let stem = stem.as_ref();
        self.content("save")?;
        let (_, mut fixed, mut variable) = self.registry.begin_cycle();
        self.relations = None;
        let Some(content) = self.content.as_ref() else {
            return Err(MeshForestError::EmptyTriangulation("save"));
        };
        let comm = &self.comm;
        let relations = agree_on_result(comm, RelationTable::persist(&content.forest, &content.cells))?;
        let result = self
            .transfer
            .pack(comm, &relations, &content.cells, &mut fixed, &mut variable)
            .and_then(|_| content.forest.save(comm, &with_suffix(stem, ".forest")))
            .and_then(|_| {
                self.transfer
                    .save(comm, stem, content.forest.global_first_quadrant())
            })
            .and_then(|_| {
                SaveInfo {
                    version: WIRE_VERSION,
                    dim: D,
                    n_procs: comm.size(),
                    n_coarse_cells: content.mesh.n_cells(),
                    n_global_quadrants: content.forest.n_global(),
                    global_first_quadrant: content.forest.global_first_quadrant().to_vec(),
                    n_attached_fixed: self.transfer.n_fixed(),
                    n_attached_variable: self.transfer.n_variable(),
                    sizes_fixed_cumulative: self.transfer.sizes_fixed_cumulative().to_vec(),
                    settings: self.settings,
                }
                .write(comm, stem)
            });
        self.transfer.clear();
        result?;
        info!("[rank {}] saved triangulation to {}", comm.rank(), stem.display());
        Ok(())
    }

    /// Replace the refinement state by the one saved at `stem` (collective).
    /// The coarse mesh must be the one that was saved. With `autopartition`
    /// the cells are distributed uniformly; otherwise the saved partition is
    /// kept when the number of ranks did not change. Saved attachments are
    /// then claimed by registering once per attachment, in the saved order,
    /// and unpacked with status PERSIST.
    pub fn load(&mut self, stem: impl AsRef<Path>, autopartition: bool) -> Result<(), MeshForestError> {
        let stem = stem.as_ref();
        let content = self.content("load")?;
        let comm = &self.comm;
        let rank = comm.rank();
        let saved = SaveInfo::read(comm, stem)?;
        saved.check_compatible(stem, D, content.mesh.n_cells())?;
        let keep_partition = !autopartition && saved.n_procs == comm.size();
        if !keep_partition {
            info!(
                "[rank {rank}] loading {} cells saved on {} ranks with a uniform partition over {}",
                saved.n_global_quadrants,
                saved.n_procs,
                comm.size()
            );
        }
        let forest = Forest::load(
            comm,
            &with_suffix(stem, ".forest"),
            content.forest.connectivity().clone(),
            keep_partition.then_some(saved.global_first_quadrant.as_slice()),
        )?;
        let mut fresh = content.clone();
        fresh.forest = forest;
        fresh.cells = CellTree::new(&fresh.mesh, &fresh.tree_to_coarse, rank as u32);
        synchronize(comm, &mut fresh, self.settings, false)?;

        let generation = self.registry.begin_load();
        self.relations = None;
        self.transfer.load(
            comm,
            stem,
            fresh.forest.global_first_quadrant(),
            saved.n_attached_fixed,
            saved.n_attached_variable,
        )?;
        if self.transfer.sizes_fixed_cumulative() != saved.sizes_fixed_cumulative.as_slice() {
            self.transfer.clear();
            return Err(MeshForestError::save_format(
                with_suffix(stem, "-fixed.data"),
                "row layout differs from the info file",
            ));
        }
        let relations = agree_on_result(comm, RelationTable::persist(&fresh.forest, &fresh.cells))?;
        self.registry
            .deliver_for_deserialization(generation, saved.n_attached_fixed, saved.n_attached_variable);
        if self.registry.has_deliverable() {
            self.relations = Some(relations);
        } else {
            self.transfer.clear();
        }
        info!(
            "[rank {rank}] loaded {} of {} cells from {}",
            fresh.forest.n_local(),
            fresh.forest.n_global(),
            stem.display()
        );
        self.content = Some(fresh);
        Ok(())
    }

    // ----- geometry --------------------------------------------------------

    /// Share the positions of the vertices flagged in `moved` (collective).
    /// Each shared vertex must be reported by one rank only.
    pub fn communicate_locally_moved_vertices(&mut self, moved: &[bool]) -> Result<(), MeshForestError> {
        self.content("communicate_locally_moved_vertices")?;
        let Some(content) = self.content.as_mut() else {
            return Err(MeshForestError::EmptyTriangulation("communicate_locally_moved_vertices"));
        };
        vertices::communicate_locally_moved_vertices(&self.comm, &mut content.cells, moved)?;
        Ok(())
    }

    /// `true` if any face of any cell has a finer neighbour (collective).
    pub fn has_hanging_nodes(&self) -> Result<bool, MeshForestError> {
        let content = self.content("has_hanging_nodes")?;
        let global = content.forest.gather_leaves(&self.comm)?;
        let conn = content.forest.connectivity();
        let local = content.forest.local_quadrants().iter().any(|q| {
            (0..2 * D).any(|f| {
                global
                    .touching(conn, q.tree, &q.face_center(f))
                    .iter()
                    .any(|(n, _)| n.level > q.level)
            })
        });
        Ok(allreduce_max_u64(&self.comm, local as u64)? > 0)
    }

    // ----- accessors -------------------------------------------------------

    pub fn cells(&self) -> Result<&CellTree<D>, MeshForestError> {
        self.content("cells").map(|c| &c.cells)
    }

    pub fn cell(&self, id: CellId) -> Option<CellRef<'_, D>> {
        self.content.as_ref()?.cells.get(id)
    }

    /// Locally owned active cells in forest order.
    pub fn locally_owned_active_cells(&self) -> Result<Vec<CellId>, MeshForestError> {
        let content = self.content("locally_owned_active_cells")?;
        content
            .forest
            .local_quadrants()
            .iter()
            .map(|q| {
                content
                    .cells
                    .find_quadrant(q)
                    .ok_or_else(|| MeshForestError::RelationMismatch {
                        quadrant: q.to_string(),
                        reason: "locally owned quadrant has no cell".into(),
                    })
            })
            .collect()
    }

    /// The cell with the given global id, if it exists on this rank.
    pub fn find_cell(&self, id: &CellGlobalId) -> Option<CellId> {
        let content = self.content.as_ref()?;
        let tree = *content.coarse_to_tree.get(id.coarse_cell as usize)?;
        let q = Quadrant::<D>::from_morton(tree as u32, id.level, id.morton)?;
        content.cells.find_quadrant(&q)
    }

    pub fn forest(&self) -> Result<&Forest<D>, MeshForestError> {
        self.content("forest").map(|c| &c.forest)
    }

    pub fn ghost_layer(&self) -> Result<&GhostLayer<D>, MeshForestError> {
        self.content("ghost_layer").map(|c| &c.ghosts)
    }

    pub fn coarse_mesh(&self) -> Result<&CoarseMesh<D>, MeshForestError> {
        self.content("coarse_mesh").map(|c| &c.mesh)
    }

    /// `coarse_cell_to_tree()[c]` is the forest tree of coarse cell `c`.
    pub fn coarse_cell_to_tree(&self) -> Result<&[usize], MeshForestError> {
        self.content("coarse_cell_to_tree").map(|c| c.coarse_to_tree.as_slice())
    }

    /// `tree_to_coarse_cell()[t]` is the coarse cell of forest tree `t`.
    pub fn tree_to_coarse_cell(&self) -> Result<&[usize], MeshForestError> {
        self.content("tree_to_coarse_cell").map(|c| c.tree_to_coarse.as_slice())
    }

    pub fn locally_owned_subdomain(&self) -> u32 {
        self.comm.rank() as u32
    }

    pub fn n_locally_owned_active_cells(&self) -> usize {
        self.content
            .as_ref()
            .map_or(0, |c| c.cells.n_locally_owned_active())
    }

    pub fn n_global_active_cells(&self) -> u64 {
        self.content.as_ref().map_or(0, |c| c.forest.n_global())
    }

    /// Levels of the local hierarchy, ghosts and artificial cells included.
    pub fn n_levels(&self) -> usize {
        self.content.as_ref().map_or(0, |c| c.cells.n_levels())
    }

    pub fn n_global_levels(&self) -> usize {
        self.content.as_ref().map_or(0, |c| c.n_global_levels)
    }

    pub fn global_first_quadrant(&self) -> Result<&[u64], MeshForestError> {
        self.content("global_first_quadrant")
            .map(|c| c.forest.global_first_quadrant())
    }

    pub fn is_multilevel_hierarchy_constructed(&self) -> bool {
        self.settings.contains(Settings::CONSTRUCT_MULTIGRID_HIERARCHY)
    }

    /// Hash of the global leaf set, equal on every rank (collective).
    pub fn checksum(&self) -> Result<u64, MeshForestError> {
        self.content("checksum")?.forest.checksum(&self.comm)
    }

    /// Write the locally relevant cells as legacy VTK.
    pub fn write_mesh_vtk(&self, path: impl AsRef<Path>) -> Result<(), MeshForestError> {
        let content = self.content("write_mesh_vtk")?;
        crate::io::vtk::write_cells(path.as_ref(), &content.cells)
    }

    pub fn memory_consumption(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.content.as_ref().map_or(0, |c| {
                c.cells.memory_consumption()
                    + c.ghosts.memory_consumption()
                    + c.forest.memory_consumption()
                    + (c.coarse_to_tree.capacity() + c.tree_to_coarse.capacity()) * std::mem::size_of::<usize>()
            })
            + self.transfer.memory_consumption()
            + self.relations.as_ref().map_or(0, |r| r.memory_consumption())
    }

    /// Memory held by the forest and its ghost layer.
    pub fn memory_consumption_forest(&self) -> usize {
        self.content
            .as_ref()
            .map_or(0, |c| c.forest.memory_consumption() + c.ghosts.memory_consumption())
    }
}

impl<const D: usize, C: Communicator> DebugInvariants for Triangulation<D, C> {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "Triangulation");
    }

    fn validate_invariants(&self) -> Result<(), MeshForestError> {
        let Some(content) = self.content.as_ref() else {
            return Ok(());
        };
        for (c, &t) in content.coarse_to_tree.iter().enumerate() {
            if content.tree_to_coarse.get(t) != Some(&c) {
                return Err(MeshForestError::InvariantViolation(format!(
                    "coarse cell {c} maps to tree {t}, which maps back elsewhere"
                )));
            }
        }
        content.forest.validate_invariants()?;
        content.cells.validate_invariants()?;
        if content.cells.n_locally_owned_active() != content.forest.n_local() {
            return Err(MeshForestError::InvariantViolation(format!(
                "{} locally owned cells for {} local quadrants",
                content.cells.n_locally_owned_active(),
                content.forest.n_local()
            )));
        }
        Ok(())
    }
}

fn build_content<const D: usize, C: Communicator + ?Sized>(
    comm: &C,
    mesh: CoarseMesh<D>,
    periodic: &PeriodicIdentification,
    settings: Settings,
) -> Result<Content<D>, MeshForestError> {
    let tree_to_coarse = reorder_hierarchical(&mesh.adjacency());
    let coarse_to_tree = invert_permutation(&tree_to_coarse);
    let connectivity = Connectivity::new(&mesh, &tree_to_coarse, periodic.clone());
    let forest = Forest::new_uniform(comm, connectivity)?;
    let cells = CellTree::new(&mesh, &tree_to_coarse, comm.rank() as u32);
    let mut content = Content {
        mesh,
        coarse_to_tree,
        tree_to_coarse,
        forest,
        ghosts: GhostLayer::default(),
        cells,
        n_global_levels: 0,
    };
    synchronize(comm, &mut content, settings, false)?;
    Ok(content)
}

/// Bring the local hierarchy and the ghost layer in line with the forest
/// (collective).
fn synchronize<const D: usize, C: Communicator + ?Sized>(
    comm: &C,
    content: &mut Content<D>,
    settings: Settings,
    rebuild: bool,
) -> Result<(), MeshForestError> {
    let global = content.forest.gather_leaves(comm)?;
    let ghosts = content.forest.ghost_layer(&global);
    let rank = comm.rank() as u32;
    let mut leaves: Vec<(Quadrant<D>, u32)> = content
        .forest
        .local_quadrants()
        .iter()
        .map(|q| (*q, rank))
        .chain(ghosts.quadrants().iter().copied())
        .collect();
    leaves.sort_unstable_by(|a, b| a.0.cmp(&b.0));
    let local = if rebuild {
        content.cells.rebuilt(&leaves).map(|fresh| content.cells = fresh)
    } else {
        content.cells.sync_from_leaves(&leaves)
    };
    agree_on_result(comm, local)?;
    content
        .cells
        .compute_level_subdomains(settings.contains(Settings::CONSTRUCT_MULTIGRID_HIERARCHY));
    content.cells.clear_all_flags();
    content.ghosts = ghosts;
    content.n_global_levels = allreduce_max_u64(comm, content.cells.n_levels() as u64)? as usize;
    Ok(())
}

fn prepare_flags<const D: usize>(cells: &mut CellTree<D>) -> Result<bool, MeshForestError> {
    let mut changed = false;
    let mut dropped = 0usize;
    for id in cells.cells_in_forest_order() {
        let Some(cell) = cells.get(id) else {
            continue;
        };
        let (refine, coarsen) = (cell.refine_flag(), cell.coarsen_flag());
        if refine.is_none() && !coarsen {
            continue;
        }
        if !cell.is_locally_owned() {
            cells.clear_refine_flag(id)?;
            cells.clear_coarsen_flag(id)?;
            dropped += 1;
            changed = true;
            continue;
        }
        if let Some(case) = refine {
            if !case.is_isotropic(D) {
                return Err(MeshForestError::AnisotropicRefinement {
                    cell: cell.global_id().to_string(),
                });
            }
            if cell.level() >= Quadrant::<D>::MAX_LEVEL {
                return Err(MeshForestError::MaxLevelExceeded {
                    cell: cell.global_id().to_string(),
                    max_level: Quadrant::<D>::MAX_LEVEL,
                });
            }
            if coarsen {
                cells.clear_coarsen_flag(id)?;
                changed = true;
            }
        }
    }
    for id in cells.cells_in_forest_order() {
        let Some(parent) = cells.get(id) else {
            continue;
        };
        let children = parent.children();
        if !children.iter().any(|c| c.coarsen_flag()) {
            continue;
        }
        let complete = children
            .iter()
            .all(|c| c.is_locally_owned() && c.coarsen_flag() && c.refine_flag().is_none());
        if !complete {
            let ids: Vec<CellId> = children.iter().map(|c| c.id()).collect();
            for c in ids {
                cells.clear_coarsen_flag(c)?;
            }
            changed = true;
        }
    }
    if dropped > 0 {
        warn!("dropped flags on {dropped} cells that are not locally owned and active");
    }
    Ok(changed)
}

/// Refine and coarsen flags of the local quadrants, in forest order.
fn forest_flags<const D: usize>(
    forest: &Forest<D>,
    cells: &CellTree<D>,
) -> Result<(Vec<bool>, Vec<bool>), MeshForestError> {
    forest
        .local_quadrants()
        .iter()
        .map(|q| {
            let cell = cells
                .find_quadrant(q)
                .and_then(|id| cells.get(id))
                .ok_or_else(|| MeshForestError::RelationMismatch {
                    quadrant: q.to_string(),
                    reason: "locally owned quadrant has no cell".into(),
                })?;
            Ok((cell.refine_flag().is_some(), cell.coarsen_flag()))
        })
        .collect::<Result<Vec<_>, MeshForestError>>()
        .map(|flags| flags.into_iter().unzip())
}

fn cell_weights<const D: usize>(
    weight: &mut WeightCallback<D>,
    relations: &RelationTable<D>,
    cells: &CellTree<D>,
) -> Result<Vec<u64>, MeshForestError> {
    let mut out = Vec::with_capacity(relations.len());
    let mut family = 0u64;
    for entry in relations.entries() {
        let w = match entry.status {
            CellStatus::Invalid => family,
            status => {
                let cell = cells
                    .get(entry.cell)
                    .ok_or_else(|| MeshForestError::UnknownCell(entry.cell.to_string()))?;
                let w = weight(&cell, status) as u64;
                if status == CellStatus::Refine {
                    family = w;
                }
                w
            }
        };
        out.push(w);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;

    fn unit_square() -> Triangulation<2, NoComm> {
        let mut tria = Triangulation::new(NoComm, Settings::DEFAULT).unwrap();
        tria.create_from_mesh(CoarseMesh::hyper_cube(1).unwrap()).unwrap();
        tria
    }

    #[test]
    fn empty_triangulation_refuses_cycles() {
        let mut tria = Triangulation::<2, _>::new(NoComm, Settings::DEFAULT).unwrap();
        assert_eq!(
            tria.execute_coarsening_and_refinement(),
            Err(MeshForestError::EmptyTriangulation("execute_coarsening_and_refinement"))
        );
        assert!(matches!(
            Triangulation::<1, _>::new(NoComm, Settings::DEFAULT),
            Err(MeshForestError::UnsupportedDimension(1))
        ));
    }

    #[test]
    fn refine_global_then_coarsen_everything() {
        let mut tria = unit_square();
        tria.refine_global(2).unwrap();
        assert_eq!(tria.n_global_active_cells(), 16);
        assert_eq!(tria.n_global_levels(), 3);
        for id in tria.locally_owned_active_cells().unwrap() {
            tria.set_coarsen_flag(id).unwrap();
        }
        tria.execute_coarsening_and_refinement().unwrap();
        assert_eq!(tria.n_global_active_cells(), 4);
        tria.validate_invariants().unwrap();
    }

    #[test]
    fn refinement_wins_over_coarsening() {
        let mut tria = unit_square();
        tria.refine_global(1).unwrap();
        let cells = tria.locally_owned_active_cells().unwrap();
        for &id in &cells {
            tria.set_coarsen_flag(id).unwrap();
        }
        tria.set_refine_flag(cells[0]).unwrap();
        assert!(tria.prepare_coarsening_and_refinement().unwrap());
        assert!(!tria.cell(cells[0]).unwrap().coarsen_flag());
        // the family is incomplete now, so nobody coarsens
        assert!(cells[1..].iter().all(|&id| !tria.cell(id).unwrap().coarsen_flag()));
    }

    #[test]
    fn anisotropic_flags_are_rejected_without_poisoning() {
        let mut tria = unit_square();
        let id = tria.locally_owned_active_cells().unwrap()[0];
        tria.set_refine_flag_case(id, RefinementCase::cut_axes(0b01)).unwrap();
        assert!(matches!(
            tria.execute_coarsening_and_refinement(),
            Err(MeshForestError::AnisotropicRefinement { .. })
        ));
        tria.clear_refine_flag(id).unwrap();
        tria.refine_global(1).unwrap();
        assert_eq!(tria.n_global_active_cells(), 4);
    }

    #[test]
    fn hanging_nodes_appear_after_local_refinement() {
        let mut tria = Triangulation::new(NoComm, Settings::DEFAULT).unwrap();
        tria.create_from_mesh(CoarseMesh::<2>::hyper_cube(2).unwrap()).unwrap();
        assert!(!tria.has_hanging_nodes().unwrap());
        let id = tria.locally_owned_active_cells().unwrap()[0];
        tria.set_refine_flag(id).unwrap();
        tria.execute_coarsening_and_refinement().unwrap();
        assert!(tria.has_hanging_nodes().unwrap());
    }

    #[test]
    fn clear_waits_for_subscribers() {
        let mut tria = unit_square();
        let guard = tria.subscribe();
        assert_eq!(tria.clear(), Err(MeshForestError::SubscribersExist(1)));
        drop(guard);
        tria.clear().unwrap();
        assert!(!tria.has_content());
    }

    #[test]
    fn periodicity_only_before_refinement() {
        let mut tria = Triangulation::new(NoComm, Settings::DEFAULT).unwrap();
        tria.create_from_mesh(CoarseMesh::<2>::subdivided_hyper_rectangle([2, 1], [0.0, 0.0], [2.0, 1.0]).unwrap())
            .unwrap();
        let pair = PeriodicFacePair::new(0, 0, 1, 1);
        tria.add_periodicity(&[pair.clone()]).unwrap();
        tria.add_periodicity(&[pair.clone()]).unwrap();
        assert_eq!(tria.periodic_face_pairs().len(), 1);
        tria.refine_global(1).unwrap();
        assert_eq!(
            tria.add_periodicity(&[pair]),
            Err(MeshForestError::PeriodicityAfterRefinement)
        );
    }

    #[test]
    fn copy_requires_an_unrefined_source() {
        let mut source = unit_square();
        let mut copy = Triangulation::<2, _>::new(NoComm, Settings::DEFAULT).unwrap();
        copy.copy_triangulation(&source).unwrap();
        assert_eq!(copy.n_global_active_cells(), 1);
        source.refine_global(1).unwrap();
        let mut again = Triangulation::<2, _>::new(NoComm, Settings::DEFAULT).unwrap();
        assert_eq!(
            again.copy_triangulation(&source),
            Err(MeshForestError::SourceRefined { levels: 2 })
        );
    }

    #[test]
    fn global_ids_find_their_cells() {
        let mut tria = unit_square();
        tria.refine_global(2).unwrap();
        for id in tria.locally_owned_active_cells().unwrap() {
            let gid = tria.cell(id).unwrap().global_id();
            assert_eq!(tria.find_cell(&gid), Some(id));
        }
    }
}
