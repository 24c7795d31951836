mod util;
use util::*;

use mesh_forest::prelude::*;

fn uneven_rows(cell: &CellRef<'_, 2>, _: CellStatus) -> Vec<u8> {
    // one cell answers with a different width
    if cell.global_id().morton == 0 && cell.level() == 1 {
        vec![0; 3]
    } else {
        vec![0; 2]
    }
}

#[test]
fn failure_after_the_forest_changed_poisons() {
    let mut tria = square(NoComm, 1, Settings::DEFAULT);
    tria.refine_global(1).unwrap();
    tria.register_data_attach(uneven_rows, false).unwrap();
    for id in tria.locally_owned_active_cells().unwrap() {
        tria.set_refine_flag(id).unwrap();
    }
    assert!(matches!(
        tria.execute_coarsening_and_refinement(),
        Err(MeshForestError::FixedSizeMismatch { .. })
    ));
    assert_eq!(tria.phase(), Phase::Stable);
    assert_eq!(
        tria.refine_global(1),
        Err(MeshForestError::CycleInterrupted {
            phase: "preparing".into()
        })
    );
    assert!(tria.checksum().is_err());

    tria.clear().unwrap();
    tria.create_from_mesh(CoarseMesh::hyper_cube(1).unwrap()).unwrap();
    tria.refine_global(1).unwrap();
    assert_eq!(tria.n_global_active_cells(), 4);
}

#[test]
fn failed_repartition_leaves_the_mesh_usable() {
    let out = run_ranks(2, |comm| {
        let mut tria = square(comm, 1, Settings::NO_AUTOMATIC_REPARTITIONING);
        tria.refine_global(1).unwrap();
        tria.register_data_attach(uneven_rows, false).unwrap();
        let failed = tria.repartition().is_err();
        tria.repartition().unwrap();
        (failed, tria.n_locally_owned_active_cells())
    });
    // the family of four moves as a whole
    assert_eq!(out, vec![(true, 0), (true, 4)]);
}

#[test]
fn handles_expire_with_the_next_cycle() {
    let mut tria = square(NoComm, 1, Settings::DEFAULT);
    let h = tria.register_data_attach(|_, _| vec![7], false).unwrap();
    assert!(matches!(
        tria.notify_ready_to_unpack(&h, |_, _, _| {}),
        Err(MeshForestError::StaleAttachHandle { deliverable: None, .. })
    ));
    tria.refine_global(1).unwrap();
    tria.refine_global(1).unwrap();
    assert!(matches!(
        tria.notify_ready_to_unpack(&h, |_, _, _| {}),
        Err(MeshForestError::StaleAttachHandle { .. })
    ));
}

#[test]
fn each_handle_unpacks_once() {
    let mut tria = square(NoComm, 1, Settings::DEFAULT);
    let a = tria.register_data_attach(|_, _| vec![1], false).unwrap();
    let b = tria.register_data_attach(|_, _| vec![2, 2], false).unwrap();
    tria.refine_global(1).unwrap();
    let mut calls = 0;
    tria.notify_ready_to_unpack(&a, |_, status, bytes| {
        assert_eq!((status, bytes), (CellStatus::Refine, &[1u8][..]));
        calls += 1;
    })
    .unwrap();
    assert_eq!(calls, 1);
    assert_eq!(
        tria.notify_ready_to_unpack(&a, |_, _, _| {}),
        Err(MeshForestError::AttachHandleConsumed(a.to_string()))
    );
    tria.notify_ready_to_unpack(&b, |_, _, bytes| assert_eq!(bytes, [2, 2]))
        .unwrap();
}

#[test]
fn lifecycle_guards() {
    let mut tria = square(NoComm, 1, Settings::DEFAULT);
    assert_eq!(
        tria.create_from_mesh(CoarseMesh::hyper_cube(1).unwrap()),
        Err(MeshForestError::AlreadyHasContent)
    );
    let sub = tria.subscribe();
    assert_eq!(tria.n_subscriptions(), 1);
    assert_eq!(tria.clear(), Err(MeshForestError::SubscribersExist(1)));
    drop(sub);
    tria.clear().unwrap();
    assert_eq!(
        tria.repartition(),
        Err(MeshForestError::EmptyTriangulation("repartition"))
    );
    assert_eq!(tria.n_global_active_cells(), 0);
    assert!(matches!(
        tria.create_triangulation(vec![[0.0, 0.0], [1.0, 0.0]], vec![vec![0, 1, 2, 3]]),
        Err(MeshForestError::InvalidCoarseMesh(_))
    ));
}

#[test]
fn copies_start_from_the_coarse_mesh() {
    let out = run_ranks(2, |comm| {
        let source = square(NoComm, 3, Settings::DEFAULT);
        let mut copy = Triangulation::<2, _>::new(comm, Settings::CONSTRUCT_MULTIGRID_HIERARCHY).unwrap();
        copy.copy_triangulation(&source).unwrap();
        assert!(copy.is_multilevel_hierarchy_constructed());
        copy.refine_global(1).unwrap();
        (copy.n_global_active_cells(), copy.n_locally_owned_active_cells())
    });
    assert_eq!(out.iter().map(|o| o.0).collect::<Vec<_>>(), vec![36, 36]);
    assert_eq!(out.iter().map(|o| o.1).sum::<usize>(), 36);
}

#[test]
fn memory_is_reported() {
    let mut tria = square(NoComm, 2, Settings::DEFAULT);
    let coarse = tria.memory_consumption();
    tria.refine_global(2).unwrap();
    assert!(tria.memory_consumption() > coarse);
    assert!(tria.memory_consumption_forest() > 0);
}
