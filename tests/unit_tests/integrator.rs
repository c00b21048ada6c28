use matrixcompare::assert_scalar_eq;
use nalgebra::DVector;
use nalgebra_sparse::{CooMatrix, CscMatrix};

use micromorph::config::NewmarkParameters;
use micromorph::error::{root_category, ErrorCategory};
use micromorph::integrator::{DofHistory, NewmarkIntegrator};

fn scalar_matrix(value: f64) -> CscMatrix<f64> {
    let mut coo = CooMatrix::new(1, 1);
    coo.push(0, 0, value);
    CscMatrix::from(&coo)
}

#[test]
fn single_dof_step_matches_the_closed_form_newmark_update() {
    // M a = F with M = 2, F = 1, so a = 0.5; with β = 1/4, γ = 1/2,
    // Δt = 0.1 and (u, v, a)_prev = (0.1, 0.2, 0.3):
    //   v = 0.2 + 0.1 (0.5·0.3 + 0.5·0.5)          = 0.24
    //   u = 0.1 + 0.1·0.2 + 0.01 (0.25·0.3 + 0.25·0.5) = 0.122
    let integrator = NewmarkIntegrator::new(NewmarkParameters::default(), 0.1);
    let previous = DofHistory {
        displacement: DVector::from_vec(vec![0.1]),
        velocity: DVector::from_vec(vec![0.2]),
        acceleration: DVector::from_vec(vec![0.3]),
    };

    let updated = integrator
        .advance(&scalar_matrix(2.0), None, &DVector::from_vec(vec![1.0]), &previous)
        .unwrap();

    assert_scalar_eq!(updated.acceleration[0], 0.5, comp = abs, tol = 1e-14);
    assert_scalar_eq!(updated.velocity[0], 0.24, comp = abs, tol = 1e-14);
    assert_scalar_eq!(updated.displacement[0], 0.122, comp = abs, tol = 1e-14);
}

#[test]
fn damping_enters_the_effective_system_and_right_hand_side() {
    // (M + γ Δt C) a = F - C (v + (1-γ) Δt a_prev) with M = 1, C = 2,
    // F = 0, Δt = 0.1, v = 1, a_prev = 0: a = -2 / 1.1.
    let integrator = NewmarkIntegrator::new(NewmarkParameters::default(), 0.1);
    let previous = DofHistory {
        displacement: DVector::from_vec(vec![0.0]),
        velocity: DVector::from_vec(vec![1.0]),
        acceleration: DVector::from_vec(vec![0.0]),
    };

    let damping = scalar_matrix(2.0);
    let updated = integrator
        .advance(&scalar_matrix(1.0), Some(&damping), &DVector::from_vec(vec![0.0]), &previous)
        .unwrap();

    let expected_acceleration = -2.0 / 1.1;
    assert_scalar_eq!(updated.acceleration[0], expected_acceleration, comp = abs, tol = 1e-13);
    assert_scalar_eq!(
        updated.velocity[0],
        1.0 + 0.05 * expected_acceleration,
        comp = abs,
        tol = 1e-13
    );
    assert_scalar_eq!(
        updated.displacement[0],
        0.1 + 0.0025 * expected_acceleration,
        comp = abs,
        tol = 1e-13
    );
}

#[test]
fn singular_mass_matrix_is_a_fatal_numerical_error() {
    let integrator = NewmarkIntegrator::new(NewmarkParameters::default(), 0.1);
    let report = integrator
        .advance(
            &scalar_matrix(0.0),
            None,
            &DVector::from_vec(vec![1.0]),
            &DofHistory::zeros(1),
        )
        .unwrap_err();
    assert_eq!(root_category(&report), Some(ErrorCategory::Numerical));
}

#[test]
fn mismatched_sizes_are_rejected() {
    let integrator = NewmarkIntegrator::new(NewmarkParameters::default(), 0.1);
    let report = integrator
        .advance(
            &scalar_matrix(1.0),
            None,
            &DVector::from_vec(vec![1.0, 2.0]),
            &DofHistory::zeros(2),
        )
        .unwrap_err();
    assert_eq!(root_category(&report), Some(ErrorCategory::Numerical));
}
