use ndarray::Array4;
use test_case::test_case;
use xgrid_core::domain::BlockGridConfig;
use xgrid_core::engine::{ExecutionType, NodeRole};
use xgrid_core::telemetry::init_for_tests;
use xgrid_core::{
    Backend, BlockGrid, ByDirection, ByDomain, ByPartition, Container, DataView, Field, GridError, Index3d, Loader,
    Occ, Sequencer, SequencerOptions, SetIdx, Stencil, StencilSemantic, TransferMode,
};

const DOMAIN: Index3d = Index3d { x: 6, y: 5, z: 16 };

fn active(v: Index3d) -> bool {
    // Hollow column in the middle of the domain.
    !(v.x == 3 && v.y == 2 && (5..11).contains(&v.z))
}

fn grid(devices: usize) -> BlockGrid {
    let cfg = BlockGridConfig::new(DOMAIN, Index3d::splat(2), Stencil::s7_laplace());
    BlockGrid::new(Backend::new(devices).unwrap(), cfg, active, |b| b.z == 0).unwrap()
}

/// `dst = (src + sum of active face neighbours) / 7`
fn smooth(g: &BlockGrid, name: &str, src: &Field<f64>, dst: &Field<f64>) -> Container {
    let (src, dst) = (src.clone(), dst.clone());
    Container::device(name, g, move |l: &mut Loader| {
        let s = l.read_stencil(&src, StencilSemantic::Standard);
        let d = l.write(&dst);
        let points = Stencil::s7_laplace().points().to_vec();
        Box::new(move |idx| {
            let mut acc = s.read(idx, 0);
            for &o in &points {
                if let Some(v) = s.neighbor(idx, o, 0) {
                    acc += v;
                }
            }
            d.write(idx, 0, acc / 7.0);
        })
    })
}

fn scale_then_offset(g: &BlockGrid, src: &Field<f64>, tmp: &Field<f64>, out: &Field<f64>) -> Container {
    let device = {
        let (src, tmp) = (src.clone(), tmp.clone());
        Container::device("scale", g, move |l: &mut Loader| {
            let s = l.read(&src);
            let t = l.write(&tmp);
            Box::new(move |idx| t.write(idx, 0, 2.0 * s.read(idx, 0)))
        })
    };
    let host = {
        let (tmp, out) = (tmp.clone(), out.clone());
        Container::host("offset", g, move |l: &mut Loader| {
            let t = l.read(&tmp);
            let o = l.write(&out);
            Box::new(move |idx| o.write(idx, 0, t.read(idx, 0) + 1.0))
        })
    };
    Container::device_then_host("scale_then_offset", Some(device), Some(host)).unwrap()
}

fn simulate(devices: usize, options: SequencerOptions, iterations: usize) -> (Array4<f64>, Array4<f64>) {
    let g = grid(devices);
    let new = |name: &str| Field::new(&g, name, 1, 0.0).unwrap();
    let (a, b, tmp, out) = (new("a"), new("b"), new("tmp"), new("out"));
    a.fill_with(|v, _| f64::from(v.x * 100 + v.y * 10 + v.z));

    let seq = Sequencer::sequence(
        g.backend(),
        vec![
            smooth(&g, "a2b", &a, &b),
            smooth(&g, "b2a", &b, &a),
            scale_then_offset(&g, &a, &tmp, &out),
        ],
        "jacobi",
        options,
    )
    .unwrap();
    for _ in 0..iterations {
        seq.run().unwrap();
    }
    seq.sync();
    (a.to_ndarray(), out.to_ndarray())
}

#[test_case(2, Occ::Standard, TransferMode::Get)]
#[test_case(2, Occ::None, TransferMode::Put)]
#[test_case(4, Occ::Standard, TransferMode::Put)]
#[test_case(4, Occ::None, TransferMode::Get)]
fn multi_device_matches_single_device(devices: usize, occ: Occ, transfer_mode: TransferMode) {
    init_for_tests();
    let reference = simulate(1, SequencerOptions::default(), 3);
    let options = SequencerOptions {
        occ,
        transfer_mode,
        parallel_levels: true,
    };
    let result = simulate(devices, options, 3);
    assert_eq!(reference.0, result.0);
    assert_eq!(reference.1, result.1);
}

#[test]
fn sequential_levels_give_the_same_answer() {
    init_for_tests();
    let parallel = simulate(2, SequencerOptions::default(), 2);
    let sequential = simulate(
        2,
        SequencerOptions {
            parallel_levels: false,
            ..Default::default()
        },
        2,
    );
    assert_eq!(parallel, sequential);
}

#[test]
fn graph_shape_for_two_devices() {
    init_for_tests();
    let g = grid(2);
    let new = |name: &str| Field::new(&g, name, 1, 0.0).unwrap();
    let (a, b, tmp, out) = (new("a"), new("b"), new("tmp"), new("out"));
    let seq = Sequencer::sequence(
        g.backend(),
        vec![
            smooth(&g, "a2b", &a, &b),
            smooth(&g, "b2a", &b, &a),
            scale_then_offset(&g, &a, &tmp, &out),
        ],
        "jacobi",
        SequencerOptions::default(),
    )
    .unwrap();
    let graph = seq.graph();
    let halos: Vec<_> = graph
        .nodes()
        .iter()
        .filter(|n| n.role() == NodeRole::HaloUpdate)
        .map(|n| n.label())
        .collect();
    assert_eq!(halos, vec!["halo_a", "halo_b"]);
    let composite = graph
        .nodes()
        .iter()
        .find(|n| n.container().map(Container::execution_type) == Some(ExecutionType::DeviceThenHostManaged))
        .unwrap();
    assert_eq!(composite.data_view(), DataView::Standard);
    assert!(seq.to_dot("jacobi", false).contains("scale_then_offset"));
}

#[test]
fn classifier_scenario_on_a_ten_cube() {
    init_for_tests();
    let cfg = BlockGridConfig::new(Index3d::splat(10), Index3d::splat(2), Stencil::s7_laplace());
    let g = BlockGrid::new(Backend::new(2).unwrap(), cfg, |_| true, |_| false).unwrap();
    let c = g.classifier();
    assert_eq!(c.depth(), 1);
    assert_eq!((c.decomposition().first_z(SetIdx(0)), c.decomposition().last_z(SetIdx(0))), (0, 2));
    assert_eq!((c.decomposition().first_z(SetIdx(1)), c.decomposition().last_z(SetIdx(1))), (3, 4));

    let up0 = c.get_mapper_3d_to_1d(SetIdx(0), ByPartition::Boundary, ByDirection::Up, ByDomain::Bulk);
    assert!(up0.contains_key(&Index3d::new(1, 4, 2)));
    assert_eq!(up0.len(), 25);
    assert_eq!(c.count_boundary_by(SetIdx(0), ByDirection::Down, ByDomain::Bulk), 0);
    assert_eq!(c.count_internal(SetIdx(0)), 50);

    let down1 = c.get_mapper_1d_to_3d(SetIdx(1), ByPartition::Boundary, ByDirection::Down, ByDomain::Bulk);
    assert!(down1.iter().all(|b| b.z == 3));
    assert_eq!(c.count_internal(SetIdx(1)), 25);
    assert_eq!(c.count_boundary(SetIdx(1)), 25);
}

#[test]
fn too_many_devices_for_the_stencil_is_fatal() {
    init_for_tests();
    let cfg = BlockGridConfig::new(Index3d::splat(10), Index3d::splat(2), Stencil::s27());
    let err = BlockGrid::new(Backend::new(5).unwrap(), cfg, |_| true, |_| false).unwrap_err();
    assert!(matches!(err, GridError::InfeasibleDecomposition { depth: 1, .. }), "{err}");
}
