//! Assembly of the coupled mass/force system over the free macro DOF.
//!
//! Element matrices and vectors are integrated from the homogenized
//! quadrature-point fields and accumulated into a global sparse mass matrix
//! and dense force vectors through triplet accumulation (duplicate entries
//! sum, so the accumulation order is immaterial). The two consistency-
//! enforcement paths, projection-consistent and Arlequin, implement one
//! [`CouplingScheme`] interface so the time integrator never branches on the
//! coupling mode.

use eyre::{Result, WrapErr};
use log::warn;
use nalgebra::{DMatrix, DVector, Point3};
use nalgebra_sparse::{CooMatrix, CscMatrix};
use rustc_hash::FxHashMap;

use crate::config::ArlequinParameters;
use crate::data::MacroDof;
use crate::dof::{DofPartition, NodeId, MACRO_DOF_PER_NODE};
use crate::homogenization::{CellQuadratureField, HomogenizedIncrement};
use crate::mesh::{DomainKind, MacroCell, MultiscaleMesh};
use crate::projection::ProjectionOperators;
use crate::reference::ReferenceState;
use crate::util::{csc_mul_vector, csc_tr_mul_vector};

/// DOF count of one Hex8 macro element.
const ELEMENT_DOF: usize = 8 * MACRO_DOF_PER_NODE;

/// Mass matrix and force vectors of a single macro element.
#[derive(Debug, Clone)]
pub struct ElementContribution {
    pub mass: DMatrix<f64>,
    pub internal_force: DVector<f64>,
    pub external_force: DVector<f64>,
}

/// Integrates the element mass matrix and internal/external force vectors
/// of one macro cell from its homogenized quadrature-point fields.
///
/// Surface tractions and couples enter the external force through the
/// shape functions evaluated at each surface region's projected centroid.
pub fn assemble_element(
    cell: &MacroCell,
    mesh: &MultiscaleMesh,
    homogenized: &HomogenizedIncrement,
    field: &CellQuadratureField,
    macro_positions: &FxHashMap<NodeId, Point3<f64>>,
) -> Result<ElementContribution> {
    let op = "assemble_element";
    let element = cell.element(macro_positions)?;
    let quadrature = element.quadrature();

    let mut mass = DMatrix::zeros(ELEMENT_DOF, ELEMENT_DOF);
    let mut internal_force = DVector::zeros(ELEMENT_DOF);
    let mut external_force = DVector::zeros(ELEMENT_DOF);

    for (state, (_, xi)) in field.points.iter().zip(quadrature.iter()) {
        let basis = element.evaluate_basis(xi);
        let gradients = element
            .global_gradients(xi)
            .wrap_err_with(|| format!("{op}: quadrature of macro cell {}", cell.id))?;
        let weight = state.weight;

        for a in 0..8 {
            let row0 = MACRO_DOF_PER_NODE * a;

            // Internal force: stress against the gradient for the
            // displacement block, the skew stress residual against the
            // shape value for the micro-deformation block.
            for i in 0..3 {
                let mut value = 0.0;
                for j in 0..3 {
                    value += state.stress[(i, j)] * gradients[(j, a)];
                }
                internal_force[row0 + i] += weight * value;
                for j in 0..3 {
                    internal_force[row0 + 3 + 3 * i + j] +=
                        weight * (state.stress[(i, j)] - state.symmetric_stress[(i, j)]) * basis[a];
                }
            }

            // External force: body force and body couple densities.
            for i in 0..3 {
                external_force[row0 + i] += weight * state.density * state.body_force[i] * basis[a];
                for j in 0..3 {
                    external_force[row0 + 3 + 3 * i + j] += weight * state.body_couple[(i, j)] * basis[a];
                }
            }

            // Mass: translational block ρ N_a N_b I₃, micro-deformation
            // block carries the homogenized micro inertia.
            for b in 0..8 {
                let col0 = MACRO_DOF_PER_NODE * b;
                let scalar = weight * basis[a] * basis[b];
                for i in 0..3 {
                    mass[(row0 + i, col0 + i)] += state.density * scalar;
                    for j in 0..3 {
                        for l in 0..3 {
                            mass[(row0 + 3 + 3 * i + j, col0 + 3 + 3 * i + l)] +=
                                state.micro_inertia[(j, l)] * scalar;
                        }
                    }
                }
            }
        }
    }

    // Surface tractions and couples of the cell's domains.
    for &domain_index in &cell.domains {
        let Some(domain) = &homogenized.domains[domain_index.0] else {
            continue;
        };
        for region in &domain.regions {
            let local = element
                .local_coordinates(&region.projected_centroid)
                .wrap_err_with(|| {
                    format!(
                        "{op}: locating surface region centroid of domain '{}' in macro cell {}",
                        mesh.domain(domain_index).name,
                        cell.id
                    )
                })?;
            let basis = element.evaluate_basis(&local);
            for a in 0..8 {
                let row0 = MACRO_DOF_PER_NODE * a;
                for i in 0..3 {
                    external_force[row0 + i] += basis[a] * region.traction[i];
                    for j in 0..3 {
                        external_force[row0 + 3 + 3 * i + j] += basis[a] * region.couple[(i, j)];
                    }
                }
            }
        }
    }

    Ok(ElementContribution {
        mass,
        internal_force,
        external_force,
    })
}

/// The assembled free-DOF system of one increment.
#[derive(Debug, Clone)]
pub struct AssembledSystem {
    /// Homogenized mass matrix over the free macro DOF.
    pub mass: CscMatrix<f64>,
    pub internal_force: DVector<f64>,
    pub external_force: DVector<f64>,
    /// Per-macro-node external force/couple, exposed as a homogenized field.
    pub node_external_force: FxHashMap<NodeId, MacroDof>,
}

/// Assembles the global mass matrix and force vectors over all free macro
/// cells.
///
/// Cells without quadrature data (every domain excluded this increment)
/// contribute nothing; the homogenization engine has already recorded the
/// warning.
pub fn assemble_free_macro_system(
    mesh: &MultiscaleMesh,
    homogenized: &HomogenizedIncrement,
    dofs: &DofPartition,
    macro_positions: &FxHashMap<NodeId, Point3<f64>>,
) -> Result<AssembledSystem> {
    let num_dofs = dofs.free_macro.num_dofs();
    let mut mass_coo = CooMatrix::new(num_dofs, num_dofs);
    let mut internal_force = DVector::zeros(num_dofs);
    let mut external_force = DVector::zeros(num_dofs);
    let mut node_external_force: FxHashMap<NodeId, MacroDof> = FxHashMap::default();

    for (cell, field) in mesh.cells().iter().zip(&homogenized.cells) {
        debug_assert_eq!(cell.id, field.cell);
        if cell.kind != DomainKind::Free || field.points.is_empty() {
            continue;
        }

        let contribution = assemble_element(cell, mesh, homogenized, field, macro_positions)?;

        for (a, &node_a) in cell.connectivity.iter().enumerate() {
            let Some(row0) = dofs.free_macro.first_dof(node_a) else {
                warn!("macro node {node_a} of free cell {} is not a free macro node; dropping its contribution", cell.id);
                continue;
            };
            let local_row0 = MACRO_DOF_PER_NODE * a;

            let nodal = node_external_force.entry(node_a).or_insert_with(MacroDof::zeros);
            for component in 0..MACRO_DOF_PER_NODE {
                internal_force[row0 + component] += contribution.internal_force[local_row0 + component];
                external_force[row0 + component] += contribution.external_force[local_row0 + component];
                nodal[component] += contribution.external_force[local_row0 + component];
            }

            for (b, &node_b) in cell.connectivity.iter().enumerate() {
                let Some(col0) = dofs.free_macro.first_dof(node_b) else {
                    continue;
                };
                let local_col0 = MACRO_DOF_PER_NODE * b;
                for i in 0..MACRO_DOF_PER_NODE {
                    for j in 0..MACRO_DOF_PER_NODE {
                        let value = contribution.mass[(local_row0 + i, local_col0 + j)];
                        if value != 0.0 {
                            mass_coo.push(row0 + i, col0 + j, value);
                        }
                    }
                }
            }
        }
    }

    Ok(AssembledSystem {
        mass: CscMatrix::from(&mass_coo),
        internal_force,
        external_force,
        node_external_force,
    })
}

/// Kinematic state handed to a coupling scheme when it forms its forces.
#[derive(Debug, Clone, Copy)]
pub struct CouplingState<'a> {
    pub free_macro_dof: &'a DVector<f64>,
    pub free_micro_dof: &'a DVector<f64>,
    /// Ghost DOF estimates carried over from the previous increment.
    pub ghost_macro_dof: &'a DVector<f64>,
    pub ghost_micro_dof: &'a DVector<f64>,
    pub homogenized: &'a HomogenizedIncrement,
    pub reference: &'a ReferenceState,
}

/// One of the two mutually exclusive consistency-enforcement paths.
///
/// Implementations contribute (a) an optional mass/damping correction on the
/// free macro DOF block and (b) a coupling force added to the free-DOF
/// balance; the assembler and time integrator are written against this
/// interface only.
pub trait CouplingScheme {
    /// Additional mass contribution on the free macro DOF block.
    fn coupling_mass(&self, dofs: &DofPartition) -> Result<Option<CscMatrix<f64>>>;

    /// Damping contribution on the free macro DOF block.
    fn coupling_damping(&self, dofs: &DofPartition) -> Result<Option<CscMatrix<f64>>>;

    /// The coupling/consistency force on the free macro DOF.
    fn coupling_force(&self, state: &CouplingState<'_>) -> Result<DVector<f64>>;

    /// The consistency-error vector the force is driving to zero, for
    /// diagnostics.
    fn consistency_error(&self, state: &CouplingState<'_>) -> Result<DVector<f64>>;
}

/// Projection-consistent coupling: ghost DOF are derived through the
/// projection operators and an augmented-Lagrangian-style correction force
/// keeps the derived interface values consistent with the carried estimates.
pub struct ProjectionConsistentScheme<'a> {
    operators: &'a ProjectionOperators,
    macro_proportionality: f64,
    micro_proportionality: f64,
}

impl<'a> ProjectionConsistentScheme<'a> {
    pub fn new(operators: &'a ProjectionOperators, macro_proportionality: f64, micro_proportionality: f64) -> Self {
        Self {
            operators,
            macro_proportionality,
            micro_proportionality,
        }
    }
}

impl CouplingScheme for ProjectionConsistentScheme<'_> {
    fn coupling_mass(&self, _dofs: &DofPartition) -> Result<Option<CscMatrix<f64>>> {
        Ok(None)
    }

    fn coupling_damping(&self, dofs: &DofPartition) -> Result<Option<CscMatrix<f64>>> {
        // Interface damping proportional to the down-projection operator:
        // C = κ Bᵀ B on the free macro DOF block.
        let b = &self.operators.ghost_micro_from_free_macro;
        if b.nnz() == 0 || self.micro_proportionality == 0.0 {
            return Ok(None);
        }
        let mut coo = CooMatrix::new(dofs.free_macro.num_dofs(), dofs.free_macro.num_dofs());
        let b_transpose = b.transpose();
        let product = &b_transpose * b;
        for (i, j, &value) in product.triplet_iter() {
            coo.push(i, j, self.micro_proportionality * value);
        }
        Ok(Some(CscMatrix::from(&coo)))
    }

    fn coupling_force(&self, state: &CouplingState<'_>) -> Result<DVector<f64>> {
        let error = self.consistency_error(state)?;
        let force = csc_tr_mul_vector(&self.operators.ghost_micro_from_free_macro, &error);
        Ok(-self.micro_proportionality * force - self.macro_proportionality * macro_interface_error(self, state))
    }

    fn consistency_error(&self, state: &CouplingState<'_>) -> Result<DVector<f64>> {
        // Mismatch between the ghost micro DOF the operator derives now and
        // the estimate carried from the previous increment.
        let derived = self
            .operators
            .project_ghost_micro(state.free_micro_dof, state.free_macro_dof);
        Ok(derived - state.ghost_micro_dof)
    }
}

/// The macro-side interface residual routed back to the free macro DOF.
fn macro_interface_error(scheme: &ProjectionConsistentScheme<'_>, state: &CouplingState<'_>) -> DVector<f64> {
    let derived = scheme
        .operators
        .project_ghost_macro(state.free_micro_dof, state.free_macro_dof);
    let residual = derived - state.ghost_macro_dof;
    csc_tr_mul_vector(&scheme.operators.ghost_macro_from_free_macro, &residual)
}

/// Arlequin coupling: kinetic-energy weighting factors partition the
/// overlap region by volume fraction, and a penalty force drives the
/// macro field at every domain center of mass towards the measured
/// (homogenized) center-of-mass displacement.
pub struct ArlequinScheme {
    parameters: ArlequinParameters,
    /// Per free macro node kinetic-energy weighting factor α ∈ [0, 1].
    weights: Vec<f64>,
    /// Center-of-mass interpolator columns restricted to the free macro DOF.
    com_rows: CscMatrix<f64>,
    /// Reference center-of-mass displacement rows: one 3-block per domain.
    num_domains: usize,
}

impl ArlequinScheme {
    /// Builds the per-node volume-fraction weighting and the restricted
    /// center-of-mass interpolator.
    pub fn new(
        mesh: &MultiscaleMesh,
        reference: &ReferenceState,
        operators: &ProjectionOperators,
        dofs: &DofPartition,
        macro_positions: &FxHashMap<NodeId, Point3<f64>>,
        parameters: ArlequinParameters,
        kinetic_energy_weighting_factor: f64,
    ) -> Result<Self> {
        // Volume fraction of reconstructable micro material around each
        // free macro node.
        let mut domain_volume = vec![0.0; dofs.free_macro.num_nodes()];
        let mut cell_volume = vec![0.0; dofs.free_macro.num_nodes()];
        for cell in mesh.cells_of_kind(DomainKind::Free) {
            let element = cell.element(macro_positions)?;
            let quadrature = element.quadrature();
            let volume: f64 = quadrature
                .iter()
                .map(|(w, xi)| w * element.reference_jacobian(xi).determinant().abs())
                .sum();
            let covered: f64 = cell.domains.iter().map(|&d| reference.domain(d).volume).sum();
            for &node in &cell.connectivity {
                if let Some(local) = dofs.free_macro.local_index(node) {
                    domain_volume[local] += covered;
                    cell_volume[local] += volume;
                }
            }
        }
        let weights = domain_volume
            .iter()
            .zip(&cell_volume)
            .map(|(&covered, &total)| {
                if total > 0.0 {
                    (kinetic_energy_weighting_factor * covered / total).clamp(0.0, 1.0)
                } else {
                    0.0
                }
            })
            .collect();

        // Keep only the free macro columns of the COM interpolator.
        let num_free = dofs.free_macro.num_dofs();
        let mut coo = CooMatrix::new(operators.com_interpolator.nrows(), num_free);
        for (i, j, &value) in operators.com_interpolator.triplet_iter() {
            if j < num_free {
                coo.push(i, j, value);
            }
        }

        Ok(Self {
            parameters,
            weights,
            com_rows: CscMatrix::from(&coo),
            num_domains: mesh.num_domains(),
        })
    }

    /// The kinetic-energy weighting factor of each free macro node.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// The trial generalized values (displacement + micro deformation) the
    /// macro DOF currently predict at every domain center of mass.
    pub fn trial_micro_deformation(&self, free_macro_dof: &DVector<f64>) -> DVector<f64> {
        csc_mul_vector(&self.com_rows, free_macro_dof)
    }
}

impl CouplingScheme for ArlequinScheme {
    fn coupling_mass(&self, dofs: &DofPartition) -> Result<Option<CscMatrix<f64>>> {
        // Kinetic-energy weighted penalty mass on the free macro DOF.
        let num_dofs = dofs.free_macro.num_dofs();
        let mut coo = CooMatrix::new(num_dofs, num_dofs);
        for (local, &alpha) in self.weights.iter().enumerate() {
            let dof0 = MACRO_DOF_PER_NODE * local;
            for component in 0..MACRO_DOF_PER_NODE {
                coo.push(dof0 + component, dof0 + component, self.parameters.update_penalty_parameter * alpha);
            }
        }
        Ok(Some(CscMatrix::from(&coo)))
    }

    fn coupling_damping(&self, _dofs: &DofPartition) -> Result<Option<CscMatrix<f64>>> {
        Ok(None)
    }

    fn coupling_force(&self, state: &CouplingState<'_>) -> Result<DVector<f64>> {
        let error = self.consistency_error(state)?;
        Ok(-self.parameters.penalty_parameter * csc_tr_mul_vector(&self.com_rows, &error))
    }

    fn consistency_error(&self, state: &CouplingState<'_>) -> Result<DVector<f64>> {
        // Trial field at the domain centers of mass versus the homogenized
        // measurement: displacement rows carry the measured center-of-mass
        // motion, micro-deformation rows relax towards the trial values.
        let trial = self.trial_micro_deformation(state.free_macro_dof);
        let mut error = DVector::zeros(MACRO_DOF_PER_NODE * self.num_domains);
        for index in 0..self.num_domains {
            let Some(domain) = &state.homogenized.domains[index] else {
                continue;
            };
            let measured = domain.center_of_mass - state.reference.domains()[index].center_of_mass;
            let row0 = MACRO_DOF_PER_NODE * index;
            for i in 0..3 {
                error[row0 + i] = trial[row0 + i] - measured[i];
            }
        }
        Ok(error)
    }
}
