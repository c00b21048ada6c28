//! The macro-scale element collaborator.
//!
//! Macro cells expose shape-function and gradient evaluation, quadrature,
//! local↔global coordinate inversion, and containment queries. Only the
//! trilinear hexahedron is currently implemented; the capability surface is
//! kept narrow so further topologies can be added as variants without
//! touching the projection or homogenization code.

use eyre::Result;
use nalgebra::{distance, Matrix3, OMatrix, Point3, Vector3, U1, U3, U8};

use crate::error::CouplingError;
use crate::quadrature::{hex_quadrature_2x2x2, Quadrature3d};

/// Row vector of the 8 trilinear basis values at a reference point.
pub type Hex8Basis = OMatrix<f64, U1, U8>;

/// Columns are the reference-coordinate gradients of the 8 basis functions.
pub type Hex8Gradients = OMatrix<f64, U3, U8>;

fn phi_linear_1d(alpha: f64, xi: f64) -> f64 {
    (1.0 + alpha * xi) / 2.0
}

fn phi_linear_1d_grad(alpha: f64) -> f64 {
    alpha / 2.0
}

/// Signs (α, β, γ) of the reference vertices, in connectivity order.
const VERTEX_SIGNS: [[f64; 3]; 8] = [
    [-1.0, -1.0, -1.0],
    [1.0, -1.0, -1.0],
    [1.0, 1.0, -1.0],
    [-1.0, 1.0, -1.0],
    [-1.0, -1.0, 1.0],
    [1.0, -1.0, 1.0],
    [1.0, 1.0, 1.0],
    [-1.0, 1.0, 1.0],
];

/// An 8-node trilinear hexahedral element given by its global vertices.
#[derive(Debug, Clone, PartialEq)]
pub struct Hex8Element {
    vertices: [Point3<f64>; 8],
}

impl Hex8Element {
    pub fn from_vertices(vertices: [Point3<f64>; 8]) -> Self {
        Self { vertices }
    }

    /// The reference element [-1, 1]^3.
    pub fn reference() -> Self {
        let mut vertices = [Point3::origin(); 8];
        for (vertex, signs) in vertices.iter_mut().zip(&VERTEX_SIGNS) {
            *vertex = Point3::new(signs[0], signs[1], signs[2]);
        }
        Self::from_vertices(vertices)
    }

    pub fn vertices(&self) -> &[Point3<f64>; 8] {
        &self.vertices
    }

    pub fn num_nodes(&self) -> usize {
        8
    }

    /// Basis values N_a(ξ) at a reference point.
    pub fn evaluate_basis(&self, xi: &Point3<f64>) -> Hex8Basis {
        let phi = |signs: &[f64; 3]| {
            phi_linear_1d(signs[0], xi[0]) * phi_linear_1d(signs[1], xi[1]) * phi_linear_1d(signs[2], xi[2])
        };
        Hex8Basis::from_fn(|_, a| phi(&VERTEX_SIGNS[a]))
    }

    /// Reference-coordinate basis gradients ∂N_a/∂ξ at a reference point.
    pub fn gradients(&self, xi: &Point3<f64>) -> Hex8Gradients {
        let grad = |signs: &[f64; 3]| {
            Vector3::new(
                phi_linear_1d_grad(signs[0]) * phi_linear_1d(signs[1], xi[1]) * phi_linear_1d(signs[2], xi[2]),
                phi_linear_1d(signs[0], xi[0]) * phi_linear_1d_grad(signs[1]) * phi_linear_1d(signs[2], xi[2]),
                phi_linear_1d(signs[0], xi[0]) * phi_linear_1d(signs[1], xi[1]) * phi_linear_1d_grad(signs[2]),
            )
        };
        let columns: Vec<_> = VERTEX_SIGNS.iter().map(grad).collect();
        Hex8Gradients::from_columns(&columns)
    }

    /// Maps a reference point to global coordinates.
    pub fn map_reference_coords(&self, xi: &Point3<f64>) -> Point3<f64> {
        let basis = self.evaluate_basis(xi);
        let mut x = Vector3::zeros();
        for (a, vertex) in self.vertices.iter().enumerate() {
            x += basis[a] * vertex.coords;
        }
        Point3::from(x)
    }

    /// Jacobian ∂x/∂ξ of the reference-to-global map.
    pub fn reference_jacobian(&self, xi: &Point3<f64>) -> Matrix3<f64> {
        let gradients = self.gradients(xi);
        let mut jacobian = Matrix3::zeros();
        for (a, vertex) in self.vertices.iter().enumerate() {
            jacobian += vertex.coords * gradients.column(a).transpose();
        }
        jacobian
    }

    /// Global-coordinate basis gradients ∂N_a/∂x at a reference point.
    ///
    /// Fails with a numerical error if the Jacobian is singular (degenerate
    /// element geometry).
    pub fn global_gradients(&self, xi: &Point3<f64>) -> Result<Hex8Gradients> {
        let jacobian = self.reference_jacobian(xi);
        let inverse_transpose = jacobian
            .try_inverse()
            .ok_or_else(|| {
                CouplingError::numerical("Hex8Element::global_gradients", "the element Jacobian is singular")
            })?
            .transpose();
        Ok(inverse_transpose * self.gradients(xi))
    }

    /// Inverts the reference-to-global map by damped Newton iteration.
    ///
    /// Mirrors the tolerances of the macro-scale shape-function collaborator:
    /// convergence when the residual drops below `tol_rel * |x| + tol_abs`.
    pub fn local_coordinates(&self, x: &Point3<f64>) -> Result<Point3<f64>> {
        const TOL_REL: f64 = 1e-9;
        const TOL_ABS: f64 = 1e-9;
        const MAX_ITERATIONS: usize = 20;
        const MAX_LINE_SEARCH: usize = 5;

        let tolerance = TOL_REL * x.coords.norm() + TOL_ABS;
        let mut xi = Point3::origin();
        let mut residual = x - self.map_reference_coords(&xi);

        for _ in 0..MAX_ITERATIONS {
            if residual.norm() <= tolerance {
                return Ok(xi);
            }
            let jacobian = self.reference_jacobian(&xi);
            let delta = jacobian.lu().solve(&residual).ok_or_else(|| {
                CouplingError::numerical(
                    "Hex8Element::local_coordinates",
                    "the element Jacobian is singular during coordinate inversion",
                )
            })?;

            // Backtracking keeps the iterate from overshooting on strongly
            // distorted cells.
            let mut step = 1.0;
            let mut next = xi + step * delta;
            let mut next_residual = x - self.map_reference_coords(&next);
            for _ in 0..MAX_LINE_SEARCH {
                if next_residual.norm() < residual.norm() {
                    break;
                }
                step *= 0.5;
                next = xi + step * delta;
                next_residual = x - self.map_reference_coords(&next);
            }
            xi = next;
            residual = next_residual;
        }

        if residual.norm() <= tolerance {
            Ok(xi)
        } else {
            Err(CouplingError::numerical(
                "Hex8Element::local_coordinates",
                format!("coordinate inversion did not converge for point {x:?}"),
            )
            .into())
        }
    }

    /// Whether a reference point lies inside [-1, 1]^3 within `tolerance`.
    pub fn local_point_inside(&self, xi: &Point3<f64>, tolerance: f64) -> bool {
        xi.iter().all(|&c| c.abs() <= 1.0 + tolerance)
    }

    /// Axis-aligned bounding box of the vertices as `(min, max)` corners.
    pub fn bounding_box(&self) -> (Point3<f64>, Point3<f64>) {
        let mut min = self.vertices[0];
        let mut max = self.vertices[0];
        for vertex in &self.vertices[1..] {
            for i in 0..3 {
                min[i] = min[i].min(vertex[i]);
                max[i] = max[i].max(vertex[i]);
            }
        }
        (min, max)
    }

    /// Cheap bounding-box rejection test for a global point.
    pub fn bounding_box_contains(&self, x: &Point3<f64>, tolerance: f64) -> bool {
        let (min, max) = self.bounding_box();
        (0..3).all(|i| x[i] >= min[i] - tolerance && x[i] <= max[i] + tolerance)
    }

    /// Whether a global point lies inside the element within `tolerance`
    /// (in reference coordinates).
    pub fn contains_point(&self, x: &Point3<f64>, tolerance: f64) -> bool {
        if !self.bounding_box_contains(x, tolerance) {
            return false;
        }
        match self.local_coordinates(x) {
            Ok(xi) => self.local_point_inside(&xi, tolerance),
            Err(_) => false,
        }
    }

    /// Largest distance between any pair of vertices.
    pub fn diameter(&self) -> f64 {
        let mut diameter: f64 = 0.0;
        for (i, x) in self.vertices.iter().enumerate() {
            for y in &self.vertices[i + 1..] {
                diameter = diameter.max(distance(x, y));
            }
        }
        diameter
    }

    /// The quadrature rule used for all volumetric cell integrals.
    pub fn quadrature(&self) -> Quadrature3d {
        hex_quadrature_2x2x2()
    }
}
