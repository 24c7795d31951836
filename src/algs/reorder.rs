//! Hierarchical reordering of the coarse-cell adjacency graph.
//!
//! The forest stores its trees linearly and cuts that line into per-process
//! pieces, so trees that are adjacent in the mesh should be adjacent in the
//! numbering. Starting from a minimum-degree node of each connected
//! component, the ordering grows a cluster greedily: the next node is the
//! unnumbered neighbour of the cluster with the most already-numbered
//! neighbours (ties broken by lower degree, then lower index). This keeps
//! each prefix of the numbering compact, unlike a plain breadth-first sweep
//! that wraps around in layers.

use std::collections::BTreeSet;

/// Cells sharing at least one vertex are adjacent. `cells[c]` lists the
/// vertex ids of cell `c`.
pub fn vertex_adjacency(cells: &[Vec<u32>], n_vertices: usize) -> Vec<Vec<usize>> {
    let mut vertex_to_cells: Vec<Vec<usize>> = vec![Vec::new(); n_vertices];
    for (c, verts) in cells.iter().enumerate() {
        for &v in verts {
            if let Some(list) = vertex_to_cells.get_mut(v as usize) {
                list.push(c);
            }
        }
    }
    let mut adjacency: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); cells.len()];
    for list in &vertex_to_cells {
        for &a in list {
            for &b in list {
                if a != b {
                    adjacency[a].insert(b);
                }
            }
        }
    }
    adjacency
        .into_iter()
        .map(|s| s.into_iter().collect())
        .collect()
}

/// Compute a hierarchical ordering. Returns `order` with `order[k]` the node
/// placed at position `k`; it is a permutation of `0..adjacency.len()`.
pub fn reorder_hierarchical(adjacency: &[Vec<usize>]) -> Vec<usize> {
    let n = adjacency.len();
    let degree: Vec<usize> = adjacency.iter().map(Vec::len).collect();
    let mut numbered = vec![false; n];
    // number of already-numbered neighbours of each node
    let mut score = vec![0usize; n];
    let mut order = Vec::with_capacity(n);

    while order.len() < n {
        // seed of the next component: minimum degree, lowest index
        let seed = match (0..n).filter(|&v| !numbered[v]).min_by_key(|&v| (degree[v], v)) {
            Some(v) => v,
            None => break,
        };
        // frontier keyed so that the first element is the best candidate
        let mut frontier: BTreeSet<(std::cmp::Reverse<usize>, usize, usize)> = BTreeSet::new();
        frontier.insert((std::cmp::Reverse(0), degree[seed], seed));
        while let Some(entry) = frontier.pop_first() {
            let v = entry.2;
            if numbered[v] {
                continue;
            }
            numbered[v] = true;
            order.push(v);
            for &w in &adjacency[v] {
                if numbered[w] {
                    continue;
                }
                frontier.remove(&(std::cmp::Reverse(score[w]), degree[w], w));
                score[w] += 1;
                frontier.insert((std::cmp::Reverse(score[w]), degree[w], w));
            }
        }
    }
    order
}

/// Invert a permutation.
pub fn invert_permutation(perm: &[usize]) -> Vec<usize> {
    let mut inv = vec![0usize; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        inv[p] = i;
    }
    inv
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_permutation(order: &[usize], n: usize) -> bool {
        let mut seen = vec![false; n];
        order.len() == n
            && order.iter().all(|&v| {
                let fresh = v < n && !seen[v];
                if fresh {
                    seen[v] = true;
                }
                fresh
            })
    }

    #[test]
    fn path_graph_is_numbered_end_to_end() {
        // 0 - 1 - 2 - 3, degrees 1 2 2 1
        let adj = vec![vec![1], vec![0, 2], vec![1, 3], vec![2]];
        assert_eq!(reorder_hierarchical(&adj), vec![0, 1, 2, 3]);
    }

    #[test]
    fn disconnected_components_are_all_numbered() {
        let adj = vec![vec![], vec![2], vec![1], vec![]];
        let order = reorder_hierarchical(&adj);
        assert!(is_permutation(&order, 4));
    }

    #[test]
    fn grid_ordering_keeps_prefix_compact() {
        // 4x4 grid of cells, vertex adjacency
        let nx = 4;
        let mut cells = Vec::new();
        for j in 0..nx {
            for i in 0..nx {
                let v = |a: usize, b: usize| (b * (nx + 1) + a) as u32;
                cells.push(vec![v(i, j), v(i + 1, j), v(i, j + 1), v(i + 1, j + 1)]);
            }
        }
        let adj = vertex_adjacency(&cells, (nx + 1) * (nx + 1));
        let order = reorder_hierarchical(&adj);
        assert!(is_permutation(&order, 16));
        // the first four cells form a 2x2 block around the seed corner
        let mut first: Vec<_> = order[..4].to_vec();
        first.sort_unstable();
        assert_eq!(first, vec![0, 1, 4, 5]);
        let inv = invert_permutation(&order);
        for (i, &o) in order.iter().enumerate() {
            assert_eq!(inv[o], i);
        }
    }
}
