//! Gauss quadrature rules for hexahedral macro cells.

use nalgebra::Point3;
use num::Zero;
use std::ops::{AddAssign, Mul};

/// A 3-D quadrature rule: paired weights and reference-domain points.
#[derive(Debug, Clone, PartialEq)]
pub struct Quadrature3d {
    weights: Vec<f64>,
    points: Vec<Point3<f64>>,
}

impl Quadrature3d {
    pub fn from_weights_and_points(weights: Vec<f64>, points: Vec<Point3<f64>>) -> Self {
        assert_eq!(weights.len(), points.len(), "weights and points must be paired");
        Self { weights, points }
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn points(&self) -> &[Point3<f64>] {
        &self.points
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, &Point3<f64>)> {
        self.weights.iter().copied().zip(self.points.iter())
    }

    /// Approximates the integral of `f` over the reference domain.
    pub fn integrate<U, F>(&self, f: F) -> U
    where
        F: Fn(&Point3<f64>) -> U,
        U: Zero + Mul<f64, Output = U> + AddAssign<U>,
    {
        let mut integral = U::zero();
        for (w, p) in self.iter() {
            integral += f(p) * w;
        }
        integral
    }
}

/// Gauss points of the two-point rule on [-1, 1].
fn gauss_points_1d_2() -> [f64; 2] {
    let c = 1.0 / 3.0f64.sqrt();
    [-c, c]
}

/// The 2×2×2 tensor-product Gauss rule on the reference hexahedron
/// [-1, 1]^3. Exact for triquadratic integrands; all weights are 1.
pub fn hex_quadrature_2x2x2() -> Quadrature3d {
    let abscissae = gauss_points_1d_2();
    let mut weights = Vec::with_capacity(8);
    let mut points = Vec::with_capacity(8);
    for &zeta in &abscissae {
        for &eta in &abscissae {
            for &xi in &abscissae {
                weights.push(1.0);
                points.push(Point3::new(xi, eta, zeta));
            }
        }
    }
    Quadrature3d::from_weights_and_points(weights, points)
}

/// The one-point (midpoint) rule on the reference hexahedron, weight 8.
pub fn hex_quadrature_midpoint() -> Quadrature3d {
    Quadrature3d::from_weights_and_points(vec![8.0], vec![Point3::origin()])
}
