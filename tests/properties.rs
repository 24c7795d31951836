mod util;
use util::*;

use mesh_forest::algs::reorder::{invert_permutation, reorder_hierarchical};
use mesh_forest::prelude::*;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn coarse_reordering_is_a_permutation(nx in 1usize..6, ny in 1usize..6) {
        let mesh = CoarseMesh::<2>::subdivided_hyper_rectangle([nx, ny], [0.0, 0.0], [1.0, 1.0]).unwrap();
        let order = reorder_hierarchical(&mesh.adjacency());
        let mut sorted = order.clone();
        sorted.sort_unstable();
        prop_assert_eq!(sorted, (0..nx * ny).collect::<Vec<_>>());
        let inverse = invert_permutation(&order);
        for (t, &c) in order.iter().enumerate() {
            prop_assert_eq!(inverse[c], t);
        }
    }

    #[test]
    fn adapted_meshes_agree_across_rank_counts(
        flags in proptest::collection::vec(any::<bool>(), 16),
        ranks in 2usize..5,
    ) {
        let adapt = |comm: RayonComm| {
            let mut tria = square(comm, 2, Settings::DEFAULT);
            tria.refine_global(1).unwrap();
            let values: Vec<u32> = owned_ids(&tria)
                .iter()
                .map(|(_, gid)| gid.coarse_cell)
                .collect();
            for (id, gid) in owned_ids(&tria) {
                let k = (gid.coarse_cell as usize) * 4 + tria.cell(id).unwrap().quadrant().child_id();
                if flags[k] {
                    tria.set_refine_flag(id).unwrap();
                }
            }
            let mut transfer = CellDataTransfer::<u32>::new(Restriction::CheckEquality);
            transfer.prepare_for_coarsening_and_refinement(&mut tria, &values).unwrap();
            tria.execute_coarsening_and_refinement().unwrap();
            let after = transfer.unpack(&mut tria).unwrap();
            let carried = owned_ids(&tria)
                .iter()
                .zip(&after)
                .all(|((_, gid), v)| gid.coarse_cell == *v);
            tria.validate_invariants().unwrap();
            (tria.checksum().unwrap(), tria.n_global_active_cells(), carried)
        };
        let serial = run_ranks(1, adapt);
        let parallel = run_ranks(ranks, adapt);
        let refined = flags.iter().filter(|&&f| f).count() as u64;
        prop_assert_eq!(serial[0].1, 16 + 3 * refined);
        for r in &parallel {
            prop_assert_eq!(r, &serial[0]);
        }
        prop_assert!(serial[0].2);
    }
}
