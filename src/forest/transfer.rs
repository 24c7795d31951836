//! Migration of per-quadrant payloads between two partitions.
//!
//! Both partitions are given as global first-quadrant offsets
//! (`len = size + 1`). Rank `r` sends each peer exactly the rows of its old
//! range that fall into the peer's new range; received chunks are
//! concatenated in rank order, which is also global quadrant order.

use crate::algs::communicator::Communicator;
use crate::algs::wire::{u32s_from_le, u32s_to_le};
use crate::mesh_error::MeshForestError;
use std::ops::Range;

/// Part of `b` inside `a`; empty ranges stay inside `a`.
fn overlap(a: Range<u64>, b: Range<u64>) -> Range<u64> {
    let lo = a.start.max(b.start).min(a.end);
    let hi = a.end.min(b.end).max(lo);
    lo..hi
}

fn check_offsets(size: usize, gfq: &[u64], what: &str) -> Result<(), MeshForestError> {
    if gfq.len() != size + 1 || gfq.windows(2).any(|w| w[0] > w[1]) {
        return Err(MeshForestError::Communication(format!(
            "{what} partition offsets {gfq:?} do not describe {size} ranks"
        )));
    }
    Ok(())
}

/// Move fixed-width rows (`row` bytes per quadrant) from the old to the new
/// partition. Collective.
pub fn transfer_fixed<C: Communicator + ?Sized>(
    comm: &C,
    old_gfq: &[u64],
    new_gfq: &[u64],
    src: &[u8],
    row: usize,
) -> Result<Vec<u8>, MeshForestError> {
    let size = comm.size();
    let rank = comm.rank();
    check_offsets(size, old_gfq, "old")?;
    check_offsets(size, new_gfq, "new")?;
    if old_gfq[size] != new_gfq[size] {
        return Err(MeshForestError::Communication(format!(
            "partitions cover {} and {} quadrants",
            old_gfq[size], new_gfq[size]
        )));
    }
    let mine = old_gfq[rank]..old_gfq[rank + 1];
    let n_old = (mine.end - mine.start) as usize;
    if src.len() != n_old * row {
        return Err(MeshForestError::BufferSizeMismatch {
            context: "fixed transfer source".into(),
            expected: n_old * row,
            found: src.len(),
        });
    }
    if old_gfq == new_gfq {
        return Ok(src.to_vec());
    }
    let sends: Vec<Vec<u8>> = (0..size)
        .map(|q| {
            let o = overlap(mine.clone(), new_gfq[q]..new_gfq[q + 1]);
            let lo = (o.start - mine.start) as usize * row;
            let hi = (o.end - mine.start) as usize * row;
            src[lo..hi].to_vec()
        })
        .collect();
    log::trace!(
        "[rank {rank}] fixed transfer: {} rows of {row} bytes out",
        n_old
    );
    let dest = comm.alltoallv_bytes(sends)?.concat();
    let n_new = (new_gfq[rank + 1] - new_gfq[rank]) as usize;
    if dest.len() != n_new * row {
        return Err(MeshForestError::BufferSizeMismatch {
            context: "fixed transfer destination".into(),
            expected: n_new * row,
            found: dest.len(),
        });
    }
    Ok(dest)
}

/// Move variable-size payloads: `sizes[i]` bytes of `data` belong to local
/// quadrant `i`. Returns the new per-quadrant sizes and the concatenated
/// payloads. Collective.
pub fn transfer_variable<C: Communicator + ?Sized>(
    comm: &C,
    old_gfq: &[u64],
    new_gfq: &[u64],
    sizes: &[u32],
    data: &[u8],
) -> Result<(Vec<u32>, Vec<u8>), MeshForestError> {
    let total: usize = sizes.iter().map(|&s| s as usize).sum();
    if total != data.len() {
        return Err(MeshForestError::BufferSizeMismatch {
            context: "variable transfer source".into(),
            expected: total,
            found: data.len(),
        });
    }
    let new_sizes = u32s_from_le(&transfer_fixed(
        comm,
        old_gfq,
        new_gfq,
        &u32s_to_le(sizes),
        4,
    )?);
    if old_gfq == new_gfq {
        return Ok((new_sizes, data.to_vec()));
    }
    let size = comm.size();
    let rank = comm.rank();
    let mine = old_gfq[rank]..old_gfq[rank + 1];
    // byte offset of every local quadrant
    let mut starts = Vec::with_capacity(sizes.len() + 1);
    let mut acc = 0usize;
    starts.push(0);
    for &s in sizes {
        acc += s as usize;
        starts.push(acc);
    }
    let sends: Vec<Vec<u8>> = (0..size)
        .map(|q| {
            let o = overlap(mine.clone(), new_gfq[q]..new_gfq[q + 1]);
            let lo = starts[(o.start - mine.start) as usize];
            let hi = starts[(o.end - mine.start) as usize];
            data[lo..hi].to_vec()
        })
        .collect();
    let dest = comm.alltoallv_bytes(sends)?.concat();
    let expected: usize = new_sizes.iter().map(|&s| s as usize).sum();
    if dest.len() != expected {
        return Err(MeshForestError::BufferSizeMismatch {
            context: "variable transfer destination".into(),
            expected,
            found: dest.len(),
        });
    }
    log::trace!(
        "[rank {rank}] variable transfer: {} bytes in for {} quadrants",
        dest.len(),
        new_sizes.len()
    );
    Ok((new_sizes, dest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, RayonComm};

    #[test]
    fn serial_transfer_is_identity() {
        let out = transfer_fixed(&NoComm, &[0, 3], &[0, 3], &[1, 2, 3, 4, 5, 6], 2).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6]);
        let err = transfer_fixed(&NoComm, &[0, 3], &[0, 3], &[1, 2], 2).unwrap_err();
        assert!(matches!(err, MeshForestError::BufferSizeMismatch { .. }));
    }

    #[test]
    fn rows_follow_their_quadrants() {
        // 6 quadrants: old split [4, 2], new split [1, 5]
        let comms = RayonComm::group(2);
        let old = [0u64, 4, 6];
        let new = [0u64, 1, 6];
        let out: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = comms
                .iter()
                .map(|c| {
                    s.spawn(move || {
                        let r = c.rank() as u64;
                        let range = old[r as usize]..old[r as usize + 1];
                        let src: Vec<u8> = range.clone().map(|g| g as u8).collect();
                        let sizes: Vec<u32> = range.clone().map(|g| g as u32).collect();
                        let data: Vec<u8> = range
                            .flat_map(|g| std::iter::repeat_n(g as u8, g as usize))
                            .collect();
                        (
                            transfer_fixed(c, &old, &new, &src, 1).unwrap(),
                            transfer_variable(c, &old, &new, &sizes, &data).unwrap(),
                        )
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(out[0].0, vec![0]);
        assert_eq!(out[1].0, vec![1, 2, 3, 4, 5]);
        assert_eq!(out[0].1, (vec![0], vec![]));
        let (sizes, data) = &out[1].1;
        assert_eq!(sizes, &vec![1, 2, 3, 4, 5]);
        assert_eq!(data.len(), 15);
        assert_eq!(&data[..3], &[1, 2, 2]);
    }

    #[test]
    fn growing_ranges_receive_from_later_ranks() {
        // 4 quadrants: old split [1, 3], new split [3, 1]
        let comms = RayonComm::group(2);
        let old = [0u64, 1, 4];
        let new = [0u64, 3, 4];
        let out: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = comms
                .iter()
                .map(|c| {
                    s.spawn(move || {
                        let r = c.rank();
                        let range = old[r]..old[r + 1];
                        let src: Vec<u8> = range.clone().map(|g| 10 + g as u8).collect();
                        let sizes: Vec<u32> = range.clone().map(|g| g as u32 + 1).collect();
                        let data: Vec<u8> = range
                            .flat_map(|g| std::iter::repeat_n(g as u8, g as usize + 1))
                            .collect();
                        (
                            transfer_fixed(c, &old, &new, &src, 1).unwrap(),
                            transfer_variable(c, &old, &new, &sizes, &data).unwrap(),
                        )
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(out[0].0, vec![10, 11, 12]);
        assert_eq!(out[1].0, vec![13]);
        assert_eq!(out[0].1, (vec![1, 2, 3], vec![0, 1, 1, 2, 2, 2]));
        assert_eq!(out[1].1, (vec![4], vec![3, 3, 3, 3]));
    }

    #[test]
    fn empty_overlaps_stay_inside_the_old_range() {
        assert_eq!(overlap(0..1, 3..4), 1..1);
        assert_eq!(overlap(3..4, 0..1), 3..3);
        assert_eq!(overlap(1..4, 0..3), 1..3);
    }
}
