//! Typed collectives on top of the byte-level [`Communicator`] entry points.
//!
//! Values travel as little-endian `Pod` records; decoding goes through
//! `bytemuck::pod_collect_to_vec` so received buffers need no alignment.

use crate::algs::communicator::Communicator;
use crate::mesh_error::MeshForestError;
use bytemuck::Pod;

fn decode<T: Pod>(bytes: &[u8], from: usize) -> Result<Vec<T>, MeshForestError> {
    let width = std::mem::size_of::<T>();
    if width != 0 && bytes.len() % width != 0 {
        return Err(MeshForestError::Communication(format!(
            "rank {from} sent {} bytes, not a multiple of the {width}-byte record",
            bytes.len()
        )));
    }
    Ok(bytemuck::pod_collect_to_vec(bytes))
}

/// Gather `items` from every rank; result is indexed by rank.
pub fn allgather_pod<T: Pod, C: Communicator + ?Sized>(
    comm: &C,
    items: &[T],
) -> Result<Vec<Vec<T>>, MeshForestError> {
    comm.allgather_bytes(bytemuck::cast_slice(items))?
        .iter()
        .enumerate()
        .map(|(rank, bytes)| decode(bytes, rank))
        .collect()
}

/// Gather `items` from every rank and concatenate them in rank order.
pub fn allgather_concat<T: Pod, C: Communicator + ?Sized>(
    comm: &C,
    items: &[T],
) -> Result<Vec<T>, MeshForestError> {
    Ok(allgather_pod(comm, items)?.concat())
}

/// Personalized exchange of `Pod` records.
pub fn alltoallv_pod<T: Pod, C: Communicator + ?Sized>(
    comm: &C,
    sends: Vec<Vec<T>>,
) -> Result<Vec<Vec<T>>, MeshForestError> {
    let raw = sends
        .into_iter()
        .map(|v| bytemuck::cast_slice::<T, u8>(&v).to_vec())
        .collect();
    comm.alltoallv_bytes(raw)?
        .iter()
        .enumerate()
        .map(|(rank, bytes)| decode(bytes, rank))
        .collect()
}

/// One `u64` per rank.
pub fn allgather_u64<C: Communicator + ?Sized>(
    comm: &C,
    value: u64,
) -> Result<Vec<u64>, MeshForestError> {
    allgather_concat(comm, &[value.to_le()]).map(|v| v.into_iter().map(u64::from_le).collect())
}

/// Global sum; fails with [`MeshForestError::Communication`] on overflow.
pub fn allreduce_sum_u64<C: Communicator + ?Sized>(
    comm: &C,
    value: u64,
) -> Result<u64, MeshForestError> {
    allgather_u64(comm, value)?
        .into_iter()
        .try_fold(0u64, |acc, v| acc.checked_add(v))
        .ok_or_else(|| MeshForestError::Communication("global sum overflows u64".into()))
}

/// Global maximum.
pub fn allreduce_max_u64<C: Communicator + ?Sized>(
    comm: &C,
    value: u64,
) -> Result<u64, MeshForestError> {
    Ok(allgather_u64(comm, value)?.into_iter().max().unwrap_or(value))
}

/// Exclusive prefix sum over ranks, together with the global total.
pub fn exscan_sum_u64<C: Communicator + ?Sized>(
    comm: &C,
    value: u64,
) -> Result<(u64, u64), MeshForestError> {
    let all = allgather_u64(comm, value)?;
    let before: u64 = all[..comm.rank()].iter().sum();
    let total: u64 = all.iter().sum();
    Ok((before, total))
}

/// Per-rank start offsets (`len = size + 1`) of a distributed sequence whose
/// local length is `local`.
pub fn global_offsets<C: Communicator + ?Sized>(
    comm: &C,
    local: u64,
) -> Result<Vec<u64>, MeshForestError> {
    let counts = allgather_u64(comm, local)?;
    let mut offsets = Vec::with_capacity(counts.len() + 1);
    let mut acc = 0u64;
    offsets.push(0);
    for c in counts {
        acc += c;
        offsets.push(acc);
    }
    Ok(offsets)
}

/// Make a locally computed result collective: if any rank failed, every rank
/// fails. Ranks that failed keep their own error; the others report the
/// first failing rank.
pub fn agree_on_result<T, C: Communicator + ?Sized>(
    comm: &C,
    local: Result<T, MeshForestError>,
) -> Result<T, MeshForestError> {
    let payload = match &local {
        Ok(_) => vec![0u8],
        Err(e) => {
            let mut p = vec![1u8];
            p.extend_from_slice(e.to_string().as_bytes());
            p
        }
    };
    let all = comm.allgather_bytes(&payload)?;
    let value = local?;
    match all
        .iter()
        .enumerate()
        .find(|(_, p)| p.first().copied().unwrap_or(0) != 0)
    {
        Some((rank, p)) => Err(MeshForestError::Communication(format!(
            "rank {rank} failed: {}",
            String::from_utf8_lossy(&p[1..])
        ))),
        None => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, RayonComm};

    #[test]
    fn serial_collectives() {
        let comm = NoComm;
        assert_eq!(allgather_u64(&comm, 5).unwrap(), vec![5]);
        assert_eq!(exscan_sum_u64(&comm, 5).unwrap(), (0, 5));
        assert_eq!(global_offsets(&comm, 7).unwrap(), vec![0, 7]);
    }

    #[test]
    fn exscan_and_offsets_on_four_ranks() {
        let comms = RayonComm::group(4);
        let out: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = comms
                .iter()
                .map(|c| {
                    s.spawn(move || {
                        let local = c.rank() as u64 + 1;
                        (
                            exscan_sum_u64(c, local).unwrap(),
                            global_offsets(c, local).unwrap(),
                            allreduce_max_u64(c, local).unwrap(),
                        )
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let expected_before = [0u64, 1, 3, 6];
        for (rank, (scan, offsets, max)) in out.iter().enumerate() {
            assert_eq!(*scan, (expected_before[rank], 10));
            assert_eq!(offsets, &vec![0, 1, 3, 6, 10]);
            assert_eq!(*max, 4);
        }
    }

    #[test]
    fn sum_overflow_is_reported() {
        let comms = RayonComm::group(2);
        let out: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = comms
                .iter()
                .map(|c| s.spawn(move || allreduce_sum_u64(c, u64::MAX - 1)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(out.iter().all(|r| r.is_err()));
    }

    #[test]
    fn one_failing_rank_fails_all() {
        let comms = RayonComm::group(3);
        let out: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = comms
                .iter()
                .map(|c| {
                    s.spawn(move || {
                        let local = if c.rank() == 2 {
                            Err(MeshForestError::CellWeightOverflow)
                        } else {
                            Ok(c.rank())
                        };
                        agree_on_result(c, local)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(out[2], Err(MeshForestError::CellWeightOverflow));
        assert!(matches!(&out[0], Err(MeshForestError::Communication(m)) if m.contains("rank 2")));
        assert!(out[1].is_err());
    }
}
