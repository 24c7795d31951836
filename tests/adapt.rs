mod util;
use util::*;

use mesh_forest::prelude::*;
use std::cell::Cell;
use std::rc::Rc;

#[test]
fn coarsening_undoes_refinement() {
    let out = run_ranks(2, |comm| {
        let mut tria = square(comm, 2, Settings::DEFAULT);
        tria.refine_global(1).unwrap();
        let original = tria.checksum().unwrap();
        for id in tria.locally_owned_active_cells().unwrap() {
            if tria.cell(id).unwrap().coarse_cell() == 3 {
                tria.set_refine_flag(id).unwrap();
            }
        }
        tria.execute_coarsening_and_refinement().unwrap();
        let refined = tria.n_global_active_cells();
        for id in tria.locally_owned_active_cells().unwrap() {
            if tria.cell(id).unwrap().level() == 2 {
                tria.set_coarsen_flag(id).unwrap();
            }
        }
        tria.execute_coarsening_and_refinement().unwrap();
        tria.validate_invariants().unwrap();
        (refined, tria.n_global_active_cells(), original == tria.checksum().unwrap())
    });
    assert!(out.iter().all(|o| *o == (16 - 4 + 16, 16, true)));
}

#[test]
fn callbacks_run_once_per_surviving_cell() {
    let out = run_ranks(3, |comm| {
        let mut tria = square(comm, 1, Settings::DEFAULT);
        tria.refine_global(2).unwrap();
        let owned = tria.locally_owned_active_cells().unwrap();
        let mut refined = 0;
        for &id in &owned {
            if tria.cell(id).unwrap().quadrant().child_id() == 0 {
                tria.set_refine_flag(id).unwrap();
                refined += 1;
            }
        }
        let packed = Rc::new(Cell::new([0usize; 4]));
        let counter = Rc::clone(&packed);
        let handle = tria
            .register_data_attach(
                move |_, status| {
                    let mut c = counter.get();
                    c[status.as_u32() as usize] += 1;
                    counter.set(c);
                    vec![status.as_u32() as u8]
                },
                false,
            )
            .unwrap();
        tria.execute_coarsening_and_refinement().unwrap();
        let mut unpacked = [0usize; 4];
        tria.notify_ready_to_unpack(&handle, |cell, status, bytes| {
            assert_eq!(bytes, [status.as_u32() as u8]);
            if status == CellStatus::Refine {
                // data of a refined cell arrives on the parent
                assert!(cell.has_children());
            } else {
                assert!(cell.is_locally_owned());
            }
            unpacked[status.as_u32() as usize] += 1;
        })
        .unwrap();
        (owned.len(), refined, packed.get(), unpacked)
    });
    let owned: usize = out.iter().map(|o| o.0).sum();
    let refined: usize = out.iter().map(|o| o.1).sum();
    let total = |f: &dyn Fn(&(usize, usize, [usize; 4], [usize; 4])) -> [usize; 4]| {
        out.iter().map(f).fold([0; 4], |mut acc, c| {
            for k in 0..4 {
                acc[k] += c[k];
            }
            acc
        })
    };
    assert_eq!(owned, 16);
    assert_eq!(refined, 4);
    let packed = total(&|o| o.2);
    assert_eq!(packed, [12, 4, 0, 0]);
    assert_eq!(total(&|o| o.3), packed);
}

#[test]
fn coarsened_data_arrives_on_the_new_cell() {
    let mut tria = square(NoComm, 1, Settings::DEFAULT);
    tria.refine_global(2).unwrap();
    for id in tria.locally_owned_active_cells().unwrap() {
        let cell = tria.cell(id).unwrap();
        if cell.parent().unwrap().global_id().morton == 0 {
            tria.set_coarsen_flag(id).unwrap();
        }
    }
    let handle = tria
        .register_data_attach(
            |cell, status| {
                if status == CellStatus::Coarsen {
                    assert_eq!(cell.children().len(), 4);
                }
                vec![cell.level()]
            },
            false,
        )
        .unwrap();
    tria.execute_coarsening_and_refinement().unwrap();
    assert_eq!(tria.n_global_active_cells(), 13);
    let mut coarsened = 0;
    tria.notify_ready_to_unpack(&handle, |cell, status, bytes| {
        if status == CellStatus::Coarsen {
            assert!(cell.is_active());
            assert_eq!((cell.level(), bytes[0]), (1, 1));
            coarsened += 1;
        }
    })
    .unwrap();
    assert_eq!(coarsened, 1);
}

#[test]
fn incomplete_families_are_not_coarsened() {
    let out = run_ranks(2, |comm| {
        let mut tria = square(comm, 1, Settings::NO_AUTOMATIC_REPARTITIONING);
        tria.refine_global(1).unwrap();
        // rank 0 owns the whole family; flag only three of the four cells
        let owned = tria.locally_owned_active_cells().unwrap();
        for &id in owned.iter().skip(1) {
            tria.set_coarsen_flag(id).unwrap();
        }
        tria.execute_coarsening_and_refinement().unwrap();
        tria.n_global_active_cells()
    });
    assert_eq!(out, vec![4, 4]);
}

#[test]
fn nested_corner_refinement() {
    let mut tria = square(NoComm, 1, Settings::DEFAULT);
    tria.refine_global(1).unwrap();
    for _ in 0..2 {
        let corner = tria
            .locally_owned_active_cells()
            .unwrap()
            .into_iter()
            .find(|&id| tria.cell(id).unwrap().global_id().morton == 0)
            .unwrap();
        tria.set_refine_flag(corner).unwrap();
        tria.execute_coarsening_and_refinement().unwrap();
    }
    assert!(tria.has_hanging_nodes().unwrap());
    let forest = tria.forest().unwrap();
    let levels: Vec<u8> = forest.local_quadrants().iter().map(|q| q.level).collect();
    assert_eq!(levels.iter().copied().max(), Some(3));
    assert_eq!(tria.n_global_active_cells(), 3 + 3 + 4);
    assert_eq!(tria.n_global_levels(), 4);
}

#[test]
fn anisotropic_refinement_fails_everywhere() {
    let out = run_ranks(2, |comm| {
        let mut tria = square(comm, 2, Settings::DEFAULT);
        if tria.comm().rank() == 1 {
            let id = tria.locally_owned_active_cells().unwrap()[0];
            tria.set_refine_flag_case(id, RefinementCase::cut_axes(0b10)).unwrap();
        }
        let result = tria.execute_coarsening_and_refinement();
        // the failure is caught before the forest changes
        (result.is_err(), tria.n_global_active_cells())
    });
    assert_eq!(out, vec![(true, 4), (true, 4)]);
}

#[test]
fn octree_refinement() {
    let out = run_ranks(2, |comm| {
        let mut tria = cube(comm, 1, Settings::DEFAULT);
        tria.refine_global(1).unwrap();
        let first = tria
            .locally_owned_active_cells()
            .unwrap()
            .into_iter()
            .find(|&id| tria.cell(id).unwrap().global_id().morton == 0);
        if let Some(id) = first {
            tria.set_refine_flag(id).unwrap();
        }
        tria.execute_coarsening_and_refinement().unwrap();
        (tria.n_global_active_cells(), tria.has_hanging_nodes().unwrap())
    });
    assert_eq!(out, vec![(15, true), (15, true)]);
}
