//! Newmark-beta implicit time integration of the free-DOF system.
//!
//! Given the previous displacement/velocity/acceleration and the current
//! force balance, the new acceleration solves
//!
//! `(M + γ Δt C) a = f − C (v + (1 − γ) Δt a_prev)`
//!
//! and velocity and displacement follow from the standard Newmark updates.
//! A singular effective matrix is fatal to the increment: the caller must
//! shorten the time step or repair the mesh; nothing is retried here.

use eyre::Result;
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CscMatrix;

use crate::config::NewmarkParameters;
use crate::error::CouplingError;

/// Displacement, velocity and acceleration of one DOF set.
#[derive(Debug, Clone, PartialEq)]
pub struct DofHistory {
    pub displacement: DVector<f64>,
    pub velocity: DVector<f64>,
    pub acceleration: DVector<f64>,
}

impl DofHistory {
    pub fn zeros(num_dofs: usize) -> Self {
        Self {
            displacement: DVector::zeros(num_dofs),
            velocity: DVector::zeros(num_dofs),
            acceleration: DVector::zeros(num_dofs),
        }
    }

    pub fn len(&self) -> usize {
        self.displacement.len()
    }

    pub fn is_empty(&self) -> bool {
        self.displacement.is_empty()
    }
}

/// Newmark-beta integrator with a fixed time step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewmarkIntegrator {
    pub parameters: NewmarkParameters,
    pub dt: f64,
}

impl NewmarkIntegrator {
    pub fn new(parameters: NewmarkParameters, dt: f64) -> Self {
        Self { parameters, dt }
    }

    /// Advances one increment: solves the effective linear system for the
    /// new acceleration and applies the Newmark update formulas.
    ///
    /// `force` must already contain every contribution of the force balance
    /// (external − internal + coupling).
    pub fn advance(
        &self,
        mass: &CscMatrix<f64>,
        damping: Option<&CscMatrix<f64>>,
        force: &DVector<f64>,
        previous: &DofHistory,
    ) -> Result<DofHistory> {
        let op = "NewmarkIntegrator::advance";
        let n = previous.len();
        if mass.nrows() != n || mass.ncols() != n || force.len() != n {
            return Err(CouplingError::numerical(
                op,
                format!(
                    "inconsistent system sizes: mass {}x{}, force {}, history {}",
                    mass.nrows(),
                    mass.ncols(),
                    force.len(),
                    n
                ),
            )
            .into());
        }

        let NewmarkParameters { beta, gamma } = self.parameters;
        let dt = self.dt;

        let mut effective = csc_to_dense(mass);
        let mut rhs = force.clone();
        if let Some(damping) = damping {
            effective += gamma * dt * csc_to_dense(damping);
            let velocity_predictor = &previous.velocity + (1.0 - gamma) * dt * &previous.acceleration;
            rhs -= crate::util::csc_mul_vector(damping, &velocity_predictor);
        }

        let acceleration = effective
            .lu()
            .solve(&rhs)
            .ok_or_else(|| CouplingError::numerical(op, "the effective coupled mass matrix is singular"))?;

        let velocity = &previous.velocity + dt * ((1.0 - gamma) * &previous.acceleration + gamma * &acceleration);
        let displacement = &previous.displacement
            + dt * &previous.velocity
            + dt * dt * ((0.5 - beta) * &previous.acceleration + beta * &acceleration);

        Ok(DofHistory {
            displacement,
            velocity,
            acceleration,
        })
    }
}

fn csc_to_dense(matrix: &CscMatrix<f64>) -> DMatrix<f64> {
    let mut dense = DMatrix::zeros(matrix.nrows(), matrix.ncols());
    for (i, j, &value) in matrix.triplet_iter() {
        dense[(i, j)] += value;
    }
    dense
}
