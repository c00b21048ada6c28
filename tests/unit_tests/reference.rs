use matrixcompare::{assert_matrix_eq, assert_scalar_eq};
use nalgebra::{Matrix3, Vector3};

use micromorph::error::{root_category, ErrorCategory};
use micromorph::reference::{build_reference_state, domain_mass_properties};

use crate::common;

#[test]
fn octant_domains_have_the_expected_mass_properties() {
    let (mesh, snapshot) = common::two_cell_fixture();
    let reference = build_reference_state(&mesh, &snapshot.micro, &snapshot.macro_state).unwrap();

    assert_eq!(reference.domains().len(), 16);
    for record in reference.domains() {
        assert_scalar_eq!(record.mass, common::DOMAIN_MASS, comp = abs, tol = 1e-12);
        assert_scalar_eq!(record.volume, common::DOMAIN_VOLUME, comp = abs, tol = 1e-12);

        // Every octant center sits at quarter-coordinates of its cell.
        for i in 0..3 {
            let quarter = (record.center_of_mass[i] * 4.0).round() / 4.0;
            assert_scalar_eq!(record.center_of_mass[i], quarter, comp = abs, tol = 1e-12);
        }

        // Mass-weighted second moment of 8 corners at distance 0.25 per axis.
        let expected_inertia = Matrix3::identity() * (common::DOMAIN_MASS * 0.0625);
        assert_matrix_eq!(record.moment_of_inertia, expected_inertia, comp = abs, tol = 1e-12);

        // Shape functions at the center of mass: tensor products of 3/4 and
        // 1/4, summing to one.
        assert_scalar_eq!(record.shape_functions.sum(), 1.0, comp = abs, tol = 1e-12);
        let mut values: Vec<f64> = record.shape_functions.iter().copied().collect();
        values.sort_by(f64::total_cmp);
        assert_scalar_eq!(values[7], 0.421875, comp = abs, tol = 1e-12);
        assert_scalar_eq!(values[0], 0.015625, comp = abs, tol = 1e-12);

        // Xi vectors are the corner offsets from the octant center.
        assert_eq!(record.xis.len(), 8);
        let xi_sum: Vector3<f64> = record.xis.iter().sum();
        assert!(xi_sum.norm() <= 1e-12);
        for xi in &record.xis {
            assert_scalar_eq!(xi.amax(), 0.25, comp = abs, tol = 1e-12);
        }
    }
}

#[test]
fn current_centers_of_mass_track_the_displacements() {
    let (mesh, mut snapshot) = common::two_cell_fixture();
    let shift = Vector3::new(0.05, -0.02, 0.01);
    for displacement in snapshot.micro.displacements.values_mut() {
        *displacement = shift;
    }

    let index = mesh.domain_by_name(common::FREE_CELL, "ghost_nodeset_1").unwrap();
    let domain = mesh.domain(index);

    let (mass, _, reference_com) = domain_mass_properties(&domain.name, &domain.nodes, &snapshot.micro, false).unwrap();
    let (current_mass, _, current_com) = domain_mass_properties(&domain.name, &domain.nodes, &snapshot.micro, true).unwrap();

    assert_scalar_eq!(current_mass, mass, comp = abs, tol = 1e-12);
    assert!((current_com - reference_com - shift).norm() <= 1e-12);
}

#[test]
fn massless_domain_is_a_configuration_error() {
    let (mesh, mut snapshot) = common::two_cell_fixture();
    let index = mesh.domain_by_name(common::FREE_CELL, "ghost_nodeset_1").unwrap();
    for &node in &mesh.domain(index).nodes {
        snapshot.micro.densities.insert(node, 0.0);
    }

    let report = build_reference_state(&mesh, &snapshot.micro, &snapshot.macro_state).unwrap_err();
    assert_eq!(root_category(&report), Some(ErrorCategory::Configuration));
}

#[test]
fn center_of_mass_outside_the_owning_cell_is_a_geometry_error() {
    let (mesh, mut snapshot) = common::two_cell_fixture();
    let index = mesh.domain_by_name(common::GHOST_CELL, "free_nodeset_2").unwrap();
    for &node in &mesh.domain(index).nodes {
        let shifted = snapshot.micro.reference_positions[&node] + Vector3::new(10.0, 0.0, 0.0);
        snapshot.micro.reference_positions.insert(node, shifted);
    }

    let report = build_reference_state(&mesh, &snapshot.micro, &snapshot.macro_state).unwrap_err();
    assert_eq!(root_category(&report), Some(ErrorCategory::Geometry));
}
