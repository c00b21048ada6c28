use matrixcompare::assert_scalar_eq;
use nalgebra::Point3;
use rustc_hash::FxHashMap;

use micromorph::error::{root_category, ErrorCategory};
use micromorph::volume::{AabbReconstructor, VolumeReconstructor};

fn octant_nodes() -> (Vec<usize>, FxHashMap<usize, Point3<f64>>) {
    let mut nodes = Vec::new();
    let mut positions = FxHashMap::default();
    let mut id = 0;
    for z in [0.0, 0.5] {
        for y in [0.0, 0.5] {
            for x in [0.0, 0.5] {
                nodes.push(id);
                positions.insert(id, Point3::new(x, y, z));
                id += 1;
            }
        }
    }
    (nodes, positions)
}

#[test]
fn box_volume_and_surface_area_match_the_octant() {
    let (nodes, positions) = octant_nodes();
    let volume = AabbReconstructor::new().reconstruct(&nodes, &positions).unwrap();

    assert_scalar_eq!(volume.volume(), 0.125, comp = abs, tol = 1e-12);
    assert_scalar_eq!(volume.surface_area(), 6.0 * 0.25, comp = abs, tol = 1e-12);

    let patches = volume.patches();
    assert_eq!(patches.len(), 6);
    let patch_total: f64 = patches.iter().map(|p| p.area).sum();
    assert_scalar_eq!(patch_total, volume.surface_area(), comp = abs, tol = 1e-12);

    for patch in patches {
        // Each box face supports exactly the four corner nodes lying on it.
        assert_eq!(patch.nodes.len(), 4);
        assert_scalar_eq!(patch.normal.norm(), 1.0, comp = abs, tol = 1e-12);
        for &node in &patch.nodes {
            let offset = (positions[&node] - patch.centroid).dot(&patch.normal);
            assert!(offset.abs() <= 1e-9);
        }
    }
}

#[test]
fn containment_follows_the_box_bounds() {
    let (nodes, positions) = octant_nodes();
    let volume = AabbReconstructor::new().reconstruct(&nodes, &positions).unwrap();
    assert!(volume.contains(&Point3::new(0.25, 0.25, 0.25)));
    assert!(!volume.contains(&Point3::new(0.75, 0.25, 0.25)));
}

#[test]
fn coplanar_nodes_are_a_degenerate_geometry() {
    let nodes = vec![0, 1, 2, 3];
    let mut positions = FxHashMap::default();
    positions.insert(0, Point3::new(0.0, 0.0, 0.0));
    positions.insert(1, Point3::new(1.0, 0.0, 0.0));
    positions.insert(2, Point3::new(0.0, 1.0, 0.0));
    positions.insert(3, Point3::new(1.0, 1.0, 0.0));

    let report = AabbReconstructor::new().reconstruct(&nodes, &positions).unwrap_err();
    assert_eq!(root_category(&report), Some(ErrorCategory::Geometry));
}

#[test]
fn empty_node_set_is_rejected() {
    let report = AabbReconstructor::new()
        .reconstruct(&[], &FxHashMap::default())
        .unwrap_err();
    assert_eq!(root_category(&report), Some(ErrorCategory::Geometry));
}
