use matrixcompare::assert_matrix_eq;
use nalgebra::{Matrix3, Point3, Vector3};
use proptest::prelude::*;

use micromorph::element::{Hex8Basis, Hex8Element};

fn point_in_hex_ref_domain() -> impl Strategy<Value = Point3<f64>> {
    let r = -1.0..=1.0;
    [r.clone(), r.clone(), r].prop_map(|[x, y, z]| Point3::new(x, y, z))
}

fn skewed_element() -> Hex8Element {
    Hex8Element::from_vertices([
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(1.2, 0.1, 0.0),
        Point3::new(1.3, 1.1, -0.1),
        Point3::new(0.1, 1.0, 0.1),
        Point3::new(-0.1, 0.0, 1.0),
        Point3::new(1.1, 0.2, 1.1),
        Point3::new(1.2, 1.2, 1.0),
        Point3::new(0.0, 1.1, 0.9),
    ])
}

#[test]
fn hex8_lagrange_property() {
    // N_i(x_j) = delta_ij at the reference vertices.
    let element = Hex8Element::reference();
    for (i, xi) in element.vertices().iter().enumerate() {
        let phi = element.evaluate_basis(xi);
        let mut expected = Hex8Basis::zeros();
        expected[i] = 1.0;
        assert_matrix_eq!(phi, expected, comp = abs, tol = 1e-12);
    }
}

proptest! {
    #[test]
    fn hex8_partition_of_unity(xi in point_in_hex_ref_domain()) {
        let element = Hex8Element::reference();
        let phi = element.evaluate_basis(&xi);
        prop_assert!((phi.sum() - 1.0).abs() <= 1e-12);
    }

    #[test]
    fn hex8_gradient_partition_of_unity(xi in point_in_hex_ref_domain()) {
        // Since the basis sums to one, the gradients must sum to zero.
        let element = Hex8Element::reference();
        let grad_sum = element.gradients(&xi).column_sum();
        prop_assert!(grad_sum.norm() <= 1e-12);
    }

    #[test]
    fn map_and_inverse_are_consistent(xi in point_in_hex_ref_domain()) {
        let element = skewed_element();
        let x = element.map_reference_coords(&xi);
        let recovered = element.local_coordinates(&x).unwrap();
        prop_assert!((recovered - xi).norm() <= 1e-7);
    }
}

#[test]
fn unit_cube_jacobian_is_half_identity() {
    let element = Hex8Element::from_vertices([
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(1.0, 0.0, 0.0),
        Point3::new(1.0, 1.0, 0.0),
        Point3::new(0.0, 1.0, 0.0),
        Point3::new(0.0, 0.0, 1.0),
        Point3::new(1.0, 0.0, 1.0),
        Point3::new(1.0, 1.0, 1.0),
        Point3::new(0.0, 1.0, 1.0),
    ]);
    let jacobian = element.reference_jacobian(&Point3::origin());
    assert_matrix_eq!(jacobian, 0.5 * Matrix3::identity(), comp = abs, tol = 1e-14);

    // The cell center maps to the reference origin.
    let center = element.local_coordinates(&Point3::new(0.5, 0.5, 0.5)).unwrap();
    assert!(center.coords.norm() <= 1e-12);
}

#[test]
fn global_gradients_of_linear_field_are_exact() {
    let element = skewed_element();
    let gradient = Vector3::new(2.0, -1.0, 0.5);
    // u(x) = g · x sampled at the vertices reproduces g exactly for any
    // trilinear element.
    let xi = Point3::new(0.3, -0.2, 0.7);
    let gradients = element.global_gradients(&xi).unwrap();
    let mut recovered = Vector3::zeros();
    for (a, vertex) in element.vertices().iter().enumerate() {
        recovered += gradient.dot(&vertex.coords) * gradients.column(a);
    }
    assert_matrix_eq!(recovered, gradient, comp = abs, tol = 1e-12);
}

#[test]
fn containment_accepts_interior_and_rejects_exterior_points() {
    let element = skewed_element();
    let inside = element.map_reference_coords(&Point3::new(0.2, 0.3, -0.4));
    assert!(element.contains_point(&inside, 1e-9));

    let outside = Point3::new(5.0, 5.0, 5.0);
    assert!(!element.contains_point(&outside, 1e-9));
}
