//! Thin façade over intra-process (threads) or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees).
//! Point-to-point handles are **waitable**; the collective entry points
//! (`allgather_bytes`, `alltoallv_bytes`, `barrier`) block until every rank
//! of the group has contributed. Default implementations build the
//! collectives from `isend`/`irecv`; backends with native collectives
//! override them.
//!
//! Every rank must enter the collectives in the same order. A rank that skips
//! one leaves its peers blocked forever; nothing here detects that. The
//! in-process backend only notices a rank whose thread panics: its peers'
//! receives then fail instead of waiting.

use crate::mesh_error::MeshForestError;
use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

/// Message tag. Collectives draw consecutive tags from a per-communicator
/// counter, so the sequence agrees on all ranks.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommTag(u16);

impl CommTag {
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }

    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Tag `k` steps after this one (wrapping).
    pub const fn offset(self, k: u16) -> Self {
        Self(self.0.wrapping_add(k))
    }
}

/// First tag handed out to internal collectives; user code should stay below.
const COLLECTIVE_TAG_BASE: u16 = 0x4000;

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Communication interface used by the forest and the triangulation.
pub trait Communicator {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// `true` for the serial no-op backend.
    fn is_no_comm(&self) -> bool {
        false
    }

    /// Reserve `count` consecutive tags for the next collective step.
    fn reserve_tag_range(&self, count: u16) -> CommTag;

    /// Every rank sends `sends[q]` to rank `q` and receives one buffer per rank.
    fn alltoallv_bytes(&self, sends: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, MeshForestError> {
        let size = self.size();
        let rank = self.rank();
        if sends.len() != size {
            return Err(MeshForestError::Communication(format!(
                "alltoallv expects {size} send buffers, got {}",
                sends.len()
            )));
        }
        if size == 1 {
            return Ok(sends);
        }
        let tag = self.reserve_tag_range(2);

        // 1) exchange lengths
        let mut len_recvs = Vec::with_capacity(size - 1);
        for peer in (0..size).filter(|&p| p != rank) {
            let mut buf = [0u8; 8];
            len_recvs.push((peer, self.irecv(peer, tag.as_u16(), &mut buf)));
        }
        let mut pending = Vec::with_capacity(2 * size);
        for (peer, buf) in sends.iter().enumerate().filter(|(p, _)| *p != rank) {
            let len = (buf.len() as u64).to_le_bytes();
            pending.push(self.isend(peer, tag.as_u16(), &len));
        }
        let mut expected = vec![0usize; size];
        let mut maybe_err = None;
        for (peer, handle) in len_recvs {
            match handle.wait() {
                Some(data) if data.len() == 8 => {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&data);
                    expected[peer] = u64::from_le_bytes(raw) as usize;
                }
                Some(data) if maybe_err.is_none() => {
                    maybe_err = Some(MeshForestError::Communication(format!(
                        "expected an 8-byte length header from rank {peer}, got {} bytes",
                        data.len()
                    )));
                }
                None if maybe_err.is_none() => {
                    maybe_err = Some(MeshForestError::Communication(format!(
                        "no length header received from rank {peer}"
                    )));
                }
                _ => {}
            }
        }
        if let Some(err) = maybe_err {
            for send in pending {
                let _ = send.wait();
            }
            return Err(err);
        }

        // 2) exchange payloads; empty messages are skipped on both sides
        let payload_tag = tag.offset(1).as_u16();
        let mut data_recvs = Vec::with_capacity(size - 1);
        for peer in (0..size).filter(|&p| p != rank && expected[p] > 0) {
            let mut buf = vec![0u8; expected[peer]];
            data_recvs.push((peer, self.irecv(peer, payload_tag, &mut buf)));
        }
        for (peer, buf) in sends.iter().enumerate() {
            if peer != rank && !buf.is_empty() {
                pending.push(self.isend(peer, payload_tag, buf));
            }
        }
        let mut out: Vec<Vec<u8>> = vec![Vec::new(); size];
        let mut sends = sends;
        out[rank] = std::mem::take(&mut sends[rank]);
        for (peer, handle) in data_recvs {
            match handle.wait() {
                Some(data) if data.len() == expected[peer] => out[peer] = data,
                Some(data) if maybe_err.is_none() => {
                    maybe_err = Some(MeshForestError::Communication(format!(
                        "rank {peer} announced {} bytes but sent {}",
                        expected[peer],
                        data.len()
                    )));
                }
                None if maybe_err.is_none() => {
                    maybe_err = Some(MeshForestError::Communication(format!(
                        "no payload received from rank {peer}"
                    )));
                }
                _ => {}
            }
        }
        for send in pending {
            let _ = send.wait();
        }
        match maybe_err {
            Some(err) => Err(err),
            None => Ok(out),
        }
    }

    /// Every rank contributes `send`; all ranks receive all contributions in rank order.
    fn allgather_bytes(&self, send: &[u8]) -> Result<Vec<Vec<u8>>, MeshForestError> {
        let size = self.size();
        if size == 1 {
            return Ok(vec![send.to_vec()]);
        }
        self.alltoallv_bytes(vec![send.to_vec(); size])
    }

    /// `data` of rank `root`, delivered to every rank.
    fn broadcast_bytes(&self, root: usize, data: &[u8]) -> Result<Vec<u8>, MeshForestError> {
        let size = self.size();
        if size == 1 {
            return Ok(data.to_vec());
        }
        let rank = self.rank();
        let sends = (0..size)
            .map(|_| if rank == root { data.to_vec() } else { Vec::new() })
            .collect();
        let mut recv = self.alltoallv_bytes(sends)?;
        match recv.get_mut(root) {
            Some(buf) => Ok(std::mem::take(buf)),
            None => Err(MeshForestError::Communication(format!(
                "broadcast root {root} outside a group of {size}"
            ))),
        }
    }

    /// Block until every rank has reached the barrier.
    fn barrier(&self) -> Result<(), MeshForestError> {
        if self.size() == 1 {
            return Ok(());
        }
        self.allgather_bytes(&[1]).map(|_| ())
    }
}

/// Compile-time no-op comm for pure serial use.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _buf: &mut [u8]) {}

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn is_no_comm(&self) -> bool {
        true
    }
    fn reserve_tag_range(&self, _count: u16) -> CommTag {
        CommTag::new(COLLECTIVE_TAG_BASE)
    }
}

// --- RayonComm: ranks as threads of one process ---
type Key = (usize, usize, u16); // (src, dst, tag)

/// Queued messages of one group, plus a flag raised when a rank dies.
#[derive(Default)]
struct Mailbox {
    queues: DashMap<Key, VecDeque<Bytes>>,
    aborted: AtomicBool,
}

static GLOBAL_MAILBOX: Lazy<Arc<Mailbox>> = Lazy::new(|| Arc::new(Mailbox::default()));

/// Receive handle that polls the shared mailbox on `wait`. Returns `None`
/// once the group is aborted and nothing is queued for it.
pub struct LocalRecv {
    mailbox: Arc<Mailbox>,
    key: Key,
}

impl Wait for LocalRecv {
    fn wait(self) -> Option<Vec<u8>> {
        loop {
            if let Some(mut queue) = self.mailbox.queues.get_mut(&self.key) {
                if let Some(bytes) = queue.pop_front() {
                    return Some(bytes.to_vec());
                }
            }
            if self.mailbox.aborted.load(Ordering::Acquire) {
                return None;
            }
            std::thread::yield_now();
        }
    }
}

/// In-process communicator: each rank is a thread, messages travel through a
/// mailbox shared by the group.
pub struct RayonComm {
    rank: usize,
    size: usize,
    mailbox: Arc<Mailbox>,
    next_tag: AtomicU16,
}

impl std::fmt::Debug for RayonComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RayonComm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl RayonComm {
    /// Rank `rank` of a group of `size` that shares the process-wide mailbox.
    ///
    /// Two groups created this way in the same process see each other's
    /// messages; prefer [`RayonComm::group`] when several groups run at once.
    pub fn new(rank: usize, size: usize) -> Self {
        Self {
            rank,
            size,
            mailbox: Arc::clone(&GLOBAL_MAILBOX),
            next_tag: AtomicU16::new(COLLECTIVE_TAG_BASE),
        }
    }

    /// A fresh group of `size` ranks with a private mailbox.
    pub fn group(size: usize) -> Vec<RayonComm> {
        let mailbox = Arc::new(Mailbox::default());
        (0..size)
            .map(|rank| RayonComm {
                rank,
                size,
                mailbox: Arc::clone(&mailbox),
                next_tag: AtomicU16::new(COLLECTIVE_TAG_BASE),
            })
            .collect()
    }

    /// Fail every pending and future receive of the group that finds no
    /// queued message. Collectives on the other ranks then return
    /// [`MeshForestError::Communication`].
    pub fn abort(&self) {
        log::error!("[rank {}] aborting a group of {}", self.rank, self.size);
        self.mailbox.aborted.store(true, Ordering::Release);
    }

    /// `true` once any rank of the group called [`RayonComm::abort`].
    pub fn is_aborted(&self) -> bool {
        self.mailbox.aborted.load(Ordering::Acquire)
    }
}

impl Drop for RayonComm {
    // a rank that unwinds never reaches its next collective
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.abort();
        }
    }
}

impl Communicator for RayonComm {
    type SendHandle = ();
    type RecvHandle = LocalRecv;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) {
        self.mailbox
            .queues
            .entry((self.rank, peer, tag))
            .or_default()
            .push_back(Bytes::copy_from_slice(buf));
    }

    fn irecv(&self, peer: usize, tag: u16, _buf: &mut [u8]) -> LocalRecv {
        LocalRecv {
            mailbox: Arc::clone(&self.mailbox),
            key: (peer, self.rank, tag),
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }
    fn size(&self) -> usize {
        self.size
    }

    fn reserve_tag_range(&self, count: u16) -> CommTag {
        let tag = self.next_tag.fetch_add(count, Ordering::Relaxed);
        CommTag::new(tag.max(COLLECTIVE_TAG_BASE))
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use mpi::datatype::{Partition, PartitionMut};
    use mpi::environment::Universe;
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;
    use mpi::Count;

    /// MPI communicator using native collectives.
    pub struct MpiComm {
        pub world: SimpleCommunicator,
        rank: usize,
        size: usize,
        next_tag: AtomicU16,
        _universe: Option<Arc<Universe>>,
    }

    impl MpiComm {
        /// Initialize MPI and wrap `MPI_COMM_WORLD`.
        pub fn new() -> Result<Self, MeshForestError> {
            let universe = mpi::initialize().ok_or_else(|| {
                MeshForestError::Communication("MPI was already initialized".into())
            })?;
            let world = universe.world();
            Ok(Self::wrap(world, Some(Arc::new(universe))))
        }

        /// Wrap an existing communicator (MPI must outlive it).
        pub fn from_communicator(world: SimpleCommunicator) -> Self {
            Self::wrap(world, None)
        }

        fn wrap(world: SimpleCommunicator, universe: Option<Arc<Universe>>) -> Self {
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Self {
                world,
                rank,
                size,
                next_tag: AtomicU16::new(COLLECTIVE_TAG_BASE),
                _universe: universe,
            }
        }
    }

    impl Wait for Option<Vec<u8>> {
        fn wait(self) -> Option<Vec<u8>> {
            self
        }
    }

    fn displacements(counts: &[Count]) -> Vec<Count> {
        counts
            .iter()
            .scan(0, |acc, &c| {
                let d = *acc;
                *acc += c;
                Some(d)
            })
            .collect()
    }

    impl Communicator for MpiComm {
        type SendHandle = ();
        type RecvHandle = Option<Vec<u8>>;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) {
            self.world
                .process_at_rank(peer as i32)
                .send_with_tag(buf, tag as i32);
        }

        fn irecv(&self, peer: usize, tag: u16, _buf: &mut [u8]) -> Option<Vec<u8>> {
            let (data, _status) = self
                .world
                .process_at_rank(peer as i32)
                .receive_vec_with_tag::<u8>(tag as i32);
            Some(data)
        }

        fn rank(&self) -> usize {
            self.rank
        }
        fn size(&self) -> usize {
            self.size
        }

        fn reserve_tag_range(&self, count: u16) -> CommTag {
            let tag = self.next_tag.fetch_add(count, Ordering::Relaxed);
            CommTag::new(tag.max(COLLECTIVE_TAG_BASE))
        }

        fn alltoallv_bytes(&self, sends: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, MeshForestError> {
            if sends.len() != self.size {
                return Err(MeshForestError::Communication(format!(
                    "alltoallv expects {} send buffers, got {}",
                    self.size,
                    sends.len()
                )));
            }
            let send_counts: Vec<Count> = sends.iter().map(|b| b.len() as Count).collect();
            let mut recv_counts = vec![0 as Count; self.size];
            self.world.all_to_all_into(&send_counts[..], &mut recv_counts[..]);
            let send_displs = displacements(&send_counts);
            let recv_displs = displacements(&recv_counts);
            let flat: Vec<u8> = sends.concat();
            let total: Count = recv_counts.iter().sum();
            let mut recv = vec![0u8; total as usize];
            {
                let send_part = Partition::new(&flat[..], &send_counts[..], &send_displs[..]);
                let mut recv_part =
                    PartitionMut::new(&mut recv[..], &recv_counts[..], &recv_displs[..]);
                self.world
                    .all_to_all_varcount_into(&send_part, &mut recv_part);
            }
            Ok(recv_displs
                .iter()
                .zip(&recv_counts)
                .map(|(&d, &c)| recv[d as usize..(d + c) as usize].to_vec())
                .collect())
        }

        fn allgather_bytes(&self, send: &[u8]) -> Result<Vec<Vec<u8>>, MeshForestError> {
            let count = send.len() as Count;
            let mut counts = vec![0 as Count; self.size];
            self.world.all_gather_into(&count, &mut counts[..]);
            let displs = displacements(&counts);
            let total: Count = counts.iter().sum();
            let mut recv = vec![0u8; total as usize];
            {
                let mut part = PartitionMut::new(&mut recv[..], &counts[..], &displs[..]);
                self.world.all_gather_varcount_into(send, &mut part);
            }
            Ok(displs
                .iter()
                .zip(&counts)
                .map(|(&d, &c)| recv[d as usize..(d + c) as usize].to_vec())
                .collect())
        }

        fn barrier(&self) -> Result<(), MeshForestError> {
            self.world.barrier();
            Ok(())
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;
