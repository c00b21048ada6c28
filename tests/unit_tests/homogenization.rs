use matrixcompare::assert_scalar_eq;
use nalgebra::{Matrix3, Vector3};
use proptest::prelude::*;

use micromorph::homogenization::homogenize_increment;
use micromorph::reference::build_reference_state;
use micromorph::volume::AabbReconstructor;

use crate::common;

#[test]
fn octant_domains_homogenize_to_the_nodal_fields() {
    let (mesh, snapshot) = common::two_cell_fixture();
    let reference = build_reference_state(&mesh, &snapshot.micro, &snapshot.macro_state).unwrap();
    let homogenized = homogenize_increment(&mesh, &reference, &snapshot, &AabbReconstructor::new()).unwrap();

    assert!(homogenized.warnings.is_empty());
    assert_eq!(homogenized.domains.len(), 16);

    let expected_stress = Matrix3::from_row_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
    for domain in &homogenized.domains {
        let domain = domain.as_ref().expect("no domain is degenerate");
        assert_scalar_eq!(domain.volume, common::DOMAIN_VOLUME, comp = abs, tol = 1e-3);
        assert_scalar_eq!(domain.density, common::MICRO_DENSITY, comp = abs, tol = 1e-9);
        assert_scalar_eq!(domain.surface_area, 1.5, comp = abs, tol = 1e-9);

        assert!((domain.stress - expected_stress).amax() <= 1e-12);
        assert!((domain.symmetric_stress - domain.symmetric_stress.transpose()).amax() <= 1e-14);
        assert!((domain.body_force - Vector3::from_row_slice(&common::BODY_FORCE)).amax() <= 1e-12);
        // A uniform body force over a symmetric domain produces no couple.
        assert!(domain.body_couple.amax() <= 1e-12);
        assert!(domain.acceleration.amax() <= 1e-12);
        assert!(domain.micro_spin_inertia.amax() <= 1e-12);
    }
}

#[test]
fn homogenized_mass_reproduces_the_reference_mass() {
    // Mass conservation round trip: density · volume recomputed from the
    // same inputs equals the reference-state mass.
    let (mesh, snapshot) = common::two_cell_fixture();
    let reference = build_reference_state(&mesh, &snapshot.micro, &snapshot.macro_state).unwrap();
    let homogenized = homogenize_increment(&mesh, &reference, &snapshot, &AabbReconstructor::new()).unwrap();

    for (record, domain) in reference.domains().iter().zip(&homogenized.domains) {
        let domain = domain.as_ref().unwrap();
        let mass = domain.density * domain.volume;
        assert!((mass - record.mass).abs() <= 1e-6 * record.mass);
    }
}

#[test]
fn surface_regions_partition_the_reconstructed_surface() {
    let (mesh, snapshot) = common::two_cell_fixture();
    let reference = build_reference_state(&mesh, &snapshot.micro, &snapshot.macro_state).unwrap();
    let homogenized = homogenize_increment(&mesh, &reference, &snapshot, &AabbReconstructor::new()).unwrap();

    for domain in &homogenized.domains {
        let domain = domain.as_ref().unwrap();
        let region_total: f64 = domain.regions.iter().map(|r| r.area).sum();
        assert_scalar_eq!(region_total, domain.surface_area, comp = abs, tol = 1e-9);

        // Box patches align exactly with one macro face each.
        assert_eq!(domain.regions.len(), 6);
        let mut faces: Vec<usize> = domain.regions.iter().map(|r| r.face).collect();
        faces.sort_unstable();
        assert_eq!(faces, vec![0, 1, 2, 3, 4, 5]);
        for region in &domain.regions {
            assert!(!region.ambiguous);
            // Constant nodal tractions integrate to area × traction.
            let expected = region.area * Vector3::from_row_slice(&common::SURFACE_FORCE);
            assert!((region.traction - expected).amax() <= 1e-12);
        }
    }
}

#[test]
fn quadrature_point_fields_reproduce_constant_domain_data() {
    let (mesh, snapshot) = common::two_cell_fixture();
    let reference = build_reference_state(&mesh, &snapshot.micro, &snapshot.macro_state).unwrap();
    let homogenized = homogenize_increment(&mesh, &reference, &snapshot, &AabbReconstructor::new()).unwrap();

    assert_eq!(homogenized.cells.len(), 2);
    for cell in &homogenized.cells {
        assert!(!cell.fallback_average);
        assert_eq!(cell.points.len(), 8);
        let weight_total: f64 = cell.points.iter().map(|p| p.weight).sum();
        // Quadrature weights times Jacobian determinants sum to the cell
        // volume.
        assert_scalar_eq!(weight_total, 1.0, comp = abs, tol = 1e-12);
        for point in &cell.points {
            assert_scalar_eq!(point.density, common::MICRO_DENSITY, comp = abs, tol = 1e-9);
            assert!((point.body_force - Vector3::from_row_slice(&common::BODY_FORCE)).amax() <= 1e-9);
        }
    }
}

#[test]
fn collapsed_domain_is_excluded_with_a_warning() {
    let (mesh, mut snapshot) = common::two_cell_fixture();
    let reference = build_reference_state(&mesh, &snapshot.micro, &snapshot.macro_state).unwrap();

    // Collapse one domain onto a single point: its reconstruction is
    // degenerate and its contribution must be zeroed, not fatal.
    let collapsed = mesh.domain_by_name(common::FREE_CELL, "ghost_nodeset_5").unwrap();
    for &node in &mesh.domain(collapsed).nodes {
        let position = snapshot.micro.reference_positions[&node];
        let target = Vector3::new(0.25, 0.25, 0.75);
        snapshot.micro.displacements.insert(node, target - position.coords);
    }

    let homogenized = homogenize_increment(&mesh, &reference, &snapshot, &AabbReconstructor::new()).unwrap();
    assert!(homogenized.domains[collapsed.0].is_none());
    assert_eq!(homogenized.domains.iter().filter(|d| d.is_none()).count(), 1);
    assert!(!homogenized.warnings.is_empty());
    assert!(homogenized.warnings[0].contains("ghost_nodeset_5"));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn homogenized_density_tracks_the_nodal_density(density in 0.1..10.0f64) {
        let (mesh, mut snapshot) = common::two_cell_fixture();
        for value in snapshot.micro.densities.values_mut() {
            *value = density;
        }
        let reference = build_reference_state(&mesh, &snapshot.micro, &snapshot.macro_state).unwrap();
        let homogenized = homogenize_increment(&mesh, &reference, &snapshot, &AabbReconstructor::new()).unwrap();

        for domain in &homogenized.domains {
            let domain = domain.as_ref().unwrap();
            prop_assert!((domain.density - density).abs() <= 1e-9 * density);
            let mass = domain.density * domain.volume;
            let expected = density * common::DOMAIN_VOLUME;
            prop_assert!((mass - expected).abs() <= 1e-6 * expected);
        }
    }
}
