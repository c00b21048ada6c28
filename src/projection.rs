//! Construction of the inter-scale projection operators.
//!
//! The projector maps between the free/ghost partitions of the two scales at
//! the granularity of the micromorphic DOF set (3 displacement + 9
//! micro-deformation components per macro node, 3 displacement components
//! per micro node). Ghost micro domains are owned by free macro cells and
//! free micro domains by ghost macro cells, so two of the four block
//! operators carry the coupling and the remaining two vanish; all four are
//! materialized so downstream code stays strategy-agnostic.
//!
//! Three interchangeable strategies are supported:
//!
//! - [`ProjectionStrategy::DirectProjection`]: shape-function interpolation
//!   downward, mass-weighted pseudo-inverse per macro node upward. Exact for
//!   domains fully enclosed in one element; positions outside the owning
//!   element are extrapolated through the trilinear basis.
//! - [`ProjectionStrategy::L2Projection`]: per-cell least-squares fit of the
//!   macro DOF to the domains' moment data (center-of-mass displacement and
//!   inertia-weighted second moment).
//! - [`ProjectionStrategy::AveragedL2Projection`]: as L2, with each domain's
//!   normal-equation contribution weighted by its volume fraction of the
//!   owning cell.
//!
//! A rank-deficient normal system (or a singular nodal inertia in the direct
//! strategy) flags the cell as unprojectable: reported, non-fatal, the cell
//! contributes nothing.

use eyre::{Result, WrapErr};
use log::{debug, warn};
use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use nalgebra_sparse::{CooMatrix, CscMatrix};
use rustc_hash::FxHashMap;

use crate::config::ProjectionStrategy;
use crate::data::{MacroState, MicroState};
use crate::dof::{CellId, DofPartition, NodeId, MACRO_DOF_PER_NODE, MICRO_DOF_PER_NODE};
use crate::error::CouplingError;
use crate::mesh::{DomainKind, MultiscaleMesh};
use crate::reference::{DomainReference, ReferenceState};
use crate::util::{csc_mul_vector, well_conditioned_cholesky};

/// Nodal projected mass below which a macro node is skipped by the direct
/// strategy (no domain lies in its support).
const NODAL_MASS_CUTOFF: f64 = 1e-14;

/// Conditioning tolerance for the per-cell normal-equation factorization;
/// factors whose diagonal spans more than `1/RANK_TOLERANCE` indicate a
/// rank-deficient system (e.g. too few domains per cell).
const RANK_TOLERANCE: f64 = 1e-7;

/// The four block operators plus the center-of-mass interpolator.
///
/// Built once per reference configuration; immutable afterwards.
#[derive(Debug, Clone)]
pub struct ProjectionOperators {
    pub strategy: ProjectionStrategy,
    /// Ghost micro DOF from free macro DOF.
    pub ghost_micro_from_free_macro: CscMatrix<f64>,
    /// Ghost micro DOF from free micro DOF (vanishes for the supported
    /// domain partitioning; kept for the strategy-agnostic surface).
    pub ghost_micro_from_free_micro: CscMatrix<f64>,
    /// Ghost macro DOF from free micro DOF.
    pub ghost_macro_from_free_micro: CscMatrix<f64>,
    /// Ghost macro DOF from free macro DOF (vanishes, see above).
    pub ghost_macro_from_free_macro: CscMatrix<f64>,
    /// Interpolates `[free macro; ghost macro]` DOF to the 12 generalized
    /// components at every domain center of mass.
    pub com_interpolator: CscMatrix<f64>,
    /// Per-cell dense normal matrices of the least-squares strategies,
    /// kept for inspection and persistence. Empty for the direct strategy.
    pub cell_normal_matrices: FxHashMap<CellId, DMatrix<f64>>,
    /// Cells whose projector could not be built; their DOF stay at zero.
    pub unprojectable_cells: Vec<CellId>,
}

impl ProjectionOperators {
    /// Derives the ghost macro DOF vector from the free DOF vectors.
    pub fn project_ghost_macro(&self, free_micro: &DVector<f64>, free_macro: &DVector<f64>) -> DVector<f64> {
        csc_mul_vector(&self.ghost_macro_from_free_micro, free_micro)
            + csc_mul_vector(&self.ghost_macro_from_free_macro, free_macro)
    }

    /// Derives the ghost micro DOF vector from the free DOF vectors.
    pub fn project_ghost_micro(&self, free_micro: &DVector<f64>, free_macro: &DVector<f64>) -> DVector<f64> {
        csc_mul_vector(&self.ghost_micro_from_free_macro, free_macro)
            + csc_mul_vector(&self.ghost_micro_from_free_micro, free_micro)
    }
}

/// Builds the projection operators for the configured strategy.
///
/// `micro` and `macro_state` must hold the reference-increment fields used
/// by the reference-state build; the operators are functions of the
/// reference configuration only.
pub fn build_projection_operators(
    strategy: ProjectionStrategy,
    mesh: &MultiscaleMesh,
    reference: &ReferenceState,
    micro: &MicroState,
    macro_state: &MacroState,
    dofs: &DofPartition,
) -> Result<ProjectionOperators> {
    let mut unprojectable_cells = Vec::new();
    let mut cell_normal_matrices = FxHashMap::default();

    let com_interpolator = build_com_interpolator(mesh, reference, dofs)?;
    let ghost_micro_from_free_macro = build_macro_to_micro_interpolation(mesh, reference, micro, dofs)?;

    let ghost_macro_from_free_micro = match strategy {
        ProjectionStrategy::DirectProjection => {
            build_direct_micro_to_macro(mesh, reference, micro, macro_state, dofs, &mut unprojectable_cells)?
        }
        ProjectionStrategy::L2Projection => build_l2_micro_to_macro(
            mesh,
            reference,
            micro,
            dofs,
            false,
            &mut unprojectable_cells,
            &mut cell_normal_matrices,
        )?,
        ProjectionStrategy::AveragedL2Projection => build_l2_micro_to_macro(
            mesh,
            reference,
            micro,
            dofs,
            true,
            &mut unprojectable_cells,
            &mut cell_normal_matrices,
        )?,
    };

    let ghost_micro_from_free_micro =
        CscMatrix::from(&CooMatrix::new(dofs.ghost_micro.num_dofs(), dofs.free_micro.num_dofs()));
    let ghost_macro_from_free_macro =
        CscMatrix::from(&CooMatrix::new(dofs.ghost_macro.num_dofs(), dofs.free_macro.num_dofs()));

    Ok(ProjectionOperators {
        strategy,
        ghost_micro_from_free_macro,
        ghost_micro_from_free_micro,
        ghost_macro_from_free_micro,
        ghost_macro_from_free_macro,
        com_interpolator,
        cell_normal_matrices,
        unprojectable_cells,
    })
}

/// Column index of a macro node in the `[free; ghost]` concatenated macro
/// DOF layout used by the center-of-mass interpolator.
fn concatenated_macro_dof(dofs: &DofPartition, node: NodeId) -> Option<usize> {
    dofs.free_macro
        .first_dof(node)
        .or_else(|| dofs.ghost_macro.first_dof(node).map(|d| dofs.free_macro.num_dofs() + d))
}

fn build_com_interpolator(mesh: &MultiscaleMesh, reference: &ReferenceState, dofs: &DofPartition) -> Result<CscMatrix<f64>> {
    let op = "build_com_interpolator";
    let nrows = MACRO_DOF_PER_NODE * mesh.num_domains();
    let ncols = dofs.free_macro.num_dofs() + dofs.ghost_macro.num_dofs();
    let mut coo = CooMatrix::new(nrows, ncols);

    for record in reference.domains() {
        let domain = mesh.domain(record.domain);
        let cell = mesh
            .cell(domain.cell)
            .ok_or_else(|| CouplingError::configuration(op, format!("unknown macro cell {}", domain.cell)))?;
        let row0 = MACRO_DOF_PER_NODE * record.domain.0;

        for (a, &node) in cell.connectivity.iter().enumerate() {
            let col0 = concatenated_macro_dof(dofs, node).ok_or_else(|| {
                CouplingError::configuration(op, format!("macro node {node} of cell {} is neither free nor ghost", cell.id))
            })?;
            let shape = record.shape_functions[a];
            for component in 0..MACRO_DOF_PER_NODE {
                coo.push(row0 + component, col0 + component, shape);
            }
        }
    }

    Ok(CscMatrix::from(&coo))
}

/// The macro-to-micro interpolation operator: each ghost micro node's
/// displacement is the affine function
/// `u_q = Σ_a N_a(com) (u_a + φ_a Ξ_q)`
/// of its owning cell's nodal DOF, weighted by the node weight. Triplet
/// layout follows the original operator: `w·N` on the displacement block and
/// `w·N·Ξ` on the micro-deformation block.
fn build_macro_to_micro_interpolation(
    mesh: &MultiscaleMesh,
    reference: &ReferenceState,
    micro: &MicroState,
    dofs: &DofPartition,
) -> Result<CscMatrix<f64>> {
    let mut coo = CooMatrix::new(dofs.ghost_micro.num_dofs(), dofs.free_macro.num_dofs());

    for cell in mesh.cells_of_kind(DomainKind::Free) {
        for &domain_index in &cell.domains {
            let domain = mesh.domain(domain_index);
            let record = reference.domain(domain_index);

            for (q, &node) in domain.nodes.iter().enumerate() {
                // Micro nodes outside the ghost set (e.g. boundary nodes
                // solved independently) are simply not interpolated.
                let Some(row0) = dofs.ghost_micro.first_dof(node) else {
                    continue;
                };
                let weight = *micro.require("weight", &micro.weights, node)?;
                let xi = record.xis[q];

                for (a, &macro_node) in cell.connectivity.iter().enumerate() {
                    let Some(col0) = dofs.free_macro.first_dof(macro_node) else {
                        debug!(
                            "macro node {macro_node} of free cell {} is not a free macro node; skipping its interpolation",
                            cell.id
                        );
                        continue;
                    };
                    let value = weight * record.shape_functions[a];
                    for i in 0..MICRO_DOF_PER_NODE {
                        coo.push(row0 + i, col0 + i, value);
                        for j in 0..3 {
                            coo.push(row0 + i, col0 + 3 + 3 * i + j, value * xi[j]);
                        }
                    }
                }
            }
        }
    }

    Ok(CscMatrix::from(&coo))
}

/// Per-macro-node accumulators of the direct micro-to-macro projection.
#[derive(Debug, Clone)]
struct NodalMoments {
    mass: f64,
    inertia: Matrix3<f64>,
    relative_position: Vector3<f64>,
}

impl Default for NodalMoments {
    fn default() -> Self {
        Self {
            mass: 0.0,
            inertia: Matrix3::zeros(),
            relative_position: Vector3::zeros(),
        }
    }
}

/// The direct micro-to-macro projection: per ghost macro node, a
/// mass-weighted average recovers the displacement and the inverse of the
/// projected mass moment of inertia recovers the micro deformation from the
/// first moment of the micro displacements.
fn build_direct_micro_to_macro(
    mesh: &MultiscaleMesh,
    reference: &ReferenceState,
    micro: &MicroState,
    macro_state: &MacroState,
    dofs: &DofPartition,
    unprojectable: &mut Vec<CellId>,
) -> Result<CscMatrix<f64>> {
    let op = "build_direct_micro_to_macro";
    let num_ghost_macro = dofs.ghost_macro.num_nodes();
    let mut moments = vec![NodalMoments::default(); num_ghost_macro];

    // Shape functions at each micro node of each free micro domain, cached
    // for the triplet pass.
    let mut node_shapes: FxHashMap<(usize, NodeId), crate::element::Hex8Basis> = FxHashMap::default();

    for cell in mesh.cells_of_kind(DomainKind::Ghost) {
        let element = cell.element(&macro_state.reference_positions)?;
        for &domain_index in &cell.domains {
            let domain = mesh.domain(domain_index);
            let record = reference.domain(domain_index);
            for (q, &node) in domain.nodes.iter().enumerate() {
                if dofs.free_micro.first_dof(node).is_none() {
                    continue;
                }
                let position = micro.require("reference position", &micro.reference_positions, node)?;
                let local = element
                    .local_coordinates(position)
                    .wrap_err_with(|| format!("{op}: locating micro node {node} in macro cell {}", cell.id))?;
                if !element.local_point_inside(&local, 1e-6) {
                    debug!(
                        "micro node {node} of domain '{}' lies outside macro cell {}; extrapolating its shape functions",
                        domain.name, cell.id
                    );
                }
                let basis = element.evaluate_basis(&local);
                node_shapes.insert((domain_index.0, node), basis);

                let node_mass = micro.node_mass(node)?;
                let xi = record.xis[q];
                for (a, &macro_node) in cell.connectivity.iter().enumerate() {
                    let Some(local_index) = dofs.ghost_macro.local_index(macro_node) else {
                        continue;
                    };
                    let weighted = node_mass * basis[a];
                    let entry = &mut moments[local_index];
                    entry.mass += weighted;
                    entry.inertia += weighted * xi * xi.transpose();
                    entry.relative_position += weighted * xi;
                }
            }
        }
    }

    // Invert the nodal moments once; a singular inertia marks every cell
    // touching the node as unprojectable.
    let mut inverse_inertia = vec![None; num_ghost_macro];
    for (local_index, entry) in moments.iter().enumerate() {
        if entry.mass <= NODAL_MASS_CUTOFF {
            continue;
        }
        inverse_inertia[local_index] = entry.inertia.try_inverse();
        if inverse_inertia[local_index].is_none() {
            let node = dofs.ghost_macro.global_id(local_index);
            warn!("the projected mass moment of inertia at ghost macro node {node} is singular");
            for cell in mesh.cells_of_kind(DomainKind::Ghost) {
                if cell.connectivity.contains(&node) && !unprojectable.contains(&cell.id) {
                    unprojectable.push(cell.id);
                }
            }
        }
    }

    let mut coo = CooMatrix::new(dofs.ghost_macro.num_dofs(), dofs.free_micro.num_dofs());
    for cell in mesh.cells_of_kind(DomainKind::Ghost) {
        if unprojectable.contains(&cell.id) {
            continue;
        }
        for &domain_index in &cell.domains {
            let domain = mesh.domain(domain_index);
            let record = reference.domain(domain_index);
            for (q, &node) in domain.nodes.iter().enumerate() {
                let Some(col0) = dofs.free_micro.first_dof(node) else {
                    continue;
                };
                let basis = &node_shapes[&(domain_index.0, node)];
                let node_mass = micro.node_mass(node)?;
                let xi = record.xis[q];

                for (a, &macro_node) in cell.connectivity.iter().enumerate() {
                    let Some(local_index) = dofs.ghost_macro.local_index(macro_node) else {
                        continue;
                    };
                    let entry = &moments[local_index];
                    if entry.mass <= NODAL_MASS_CUTOFF {
                        continue;
                    }
                    let Some(inverse) = &inverse_inertia[local_index] else {
                        continue;
                    };
                    let row0 = MACRO_DOF_PER_NODE * local_index;
                    let weighted = node_mass * basis[a];
                    let position_term =
                        weighted * (xi - entry.relative_position / entry.mass).transpose() * inverse;

                    for i in 0..MICRO_DOF_PER_NODE {
                        coo.push(row0 + i, col0 + i, weighted / entry.mass);
                        for j in 0..3 {
                            coo.push(row0 + 3 + 3 * i + j, col0 + i, position_term[j]);
                        }
                    }
                }
            }
        }
    }

    Ok(CscMatrix::from(&coo))
}

/// Moment observation rows of one domain in the cell-local least-squares
/// system `G x = y`, together with the map `y = H q` from the cell's micro
/// DOF to the observations.
struct DomainMomentRows {
    /// 12 × 96: coefficients of the cell's macro DOF.
    design: DMatrix<f64>,
    /// 12 × (3 · cell micro nodes): map from micro DOF to the observations.
    observation: DMatrix<f64>,
}

fn domain_moment_rows(
    domain_nodes: &[NodeId],
    record: &DomainReference,
    micro: &MicroState,
    micro_local: &FxHashMap<NodeId, usize>,
) -> Result<DomainMomentRows> {
    let num_macro_dof = MACRO_DOF_PER_NODE * 8;
    let num_micro_dof = MICRO_DOF_PER_NODE * micro_local.len();
    let mut design = DMatrix::zeros(MACRO_DOF_PER_NODE, num_macro_dof);
    let mut observation = DMatrix::zeros(MACRO_DOF_PER_NODE, num_micro_dof);

    // Macro side: the interpolated center-of-mass displacement and the
    // inertia-weighted micro deformation.
    for a in 0..8 {
        let shape = record.shape_functions[a];
        let col0 = MACRO_DOF_PER_NODE * a;
        for i in 0..3 {
            design[(i, col0 + i)] = shape;
        }
        for i in 0..3 {
            for j in 0..3 {
                // Row (3 + 3i + j) observes Σ_k φ_{a,ik} I_{kj}.
                for k in 0..3 {
                    design[(3 + 3 * i + j, col0 + 3 + 3 * i + k)] = shape * record.moment_of_inertia[(k, j)];
                }
            }
        }
    }

    // Micro side: the mass-averaged displacement and the Ξ-weighted first
    // moment of the micro displacements.
    for (q, &node) in domain_nodes.iter().enumerate() {
        let Some(&local) = micro_local.get(&node) else {
            continue;
        };
        let node_mass = micro.node_mass(node)?;
        let xi = record.xis[q];
        let col0 = MICRO_DOF_PER_NODE * local;
        for i in 0..3 {
            observation[(i, col0 + i)] = node_mass / record.mass;
            for j in 0..3 {
                observation[(3 + 3 * i + j, col0 + i)] = node_mass * xi[j];
            }
        }
    }

    Ok(DomainMomentRows { design, observation })
}

/// The least-squares micro-to-macro projection, optionally volume-averaged.
///
/// Per ghost macro cell the normal equations `GᵀG x = Gᵀ y` are formed over
/// the cell's 96 macro DOF and solved against the observation operator, so
/// the resulting block maps free micro DOF directly to the cell's ghost
/// macro DOF. Macro nodes shared by several ghost cells average their
/// per-cell projections.
#[allow(clippy::too_many_arguments)]
fn build_l2_micro_to_macro(
    mesh: &MultiscaleMesh,
    reference: &ReferenceState,
    micro: &MicroState,
    dofs: &DofPartition,
    volume_averaged: bool,
    unprojectable: &mut Vec<CellId>,
    cell_normal_matrices: &mut FxHashMap<CellId, DMatrix<f64>>,
) -> Result<CscMatrix<f64>> {
    let op = "build_l2_micro_to_macro";

    // Macro nodes shared by several ghost cells average their projections.
    let mut cells_per_node = vec![0usize; dofs.ghost_macro.num_nodes()];
    for cell in mesh.cells_of_kind(DomainKind::Ghost) {
        for &node in &cell.connectivity {
            if let Some(local) = dofs.ghost_macro.local_index(node) {
                cells_per_node[local] += 1;
            }
        }
    }

    let mut coo = CooMatrix::new(dofs.ghost_macro.num_dofs(), dofs.free_micro.num_dofs());

    for cell in mesh.cells_of_kind(DomainKind::Ghost) {
        if cell.domains.is_empty() {
            continue;
        }

        // Local ordering of the micro nodes participating in this cell.
        let mut micro_local: FxHashMap<NodeId, usize> = FxHashMap::default();
        for &domain_index in &cell.domains {
            for &node in &mesh.domain(domain_index).nodes {
                if dofs.free_micro.contains(node) {
                    let next = micro_local.len();
                    micro_local.entry(node).or_insert(next);
                }
            }
        }
        if micro_local.is_empty() {
            continue;
        }

        let num_macro_dof = MACRO_DOF_PER_NODE * 8;
        let num_micro_dof = MICRO_DOF_PER_NODE * micro_local.len();
        let cell_volume: f64 = cell.domains.iter().map(|&d| reference.domain(d).volume).sum();

        let mut normal = DMatrix::zeros(num_macro_dof, num_macro_dof);
        let mut rhs = DMatrix::zeros(num_macro_dof, num_micro_dof);
        for &domain_index in &cell.domains {
            let domain = mesh.domain(domain_index);
            let record = reference.domain(domain_index);
            let rows = domain_moment_rows(&domain.nodes, record, micro, &micro_local)
                .wrap_err_with(|| format!("{op}: assembling moment rows of domain '{}'", domain.name))?;
            let weight = if volume_averaged {
                record.volume / cell_volume
            } else {
                1.0
            };
            normal += weight * rows.design.transpose() * &rows.design;
            rhs += weight * rows.design.transpose() * &rows.observation;
        }

        cell_normal_matrices.insert(cell.id, normal.clone());
        let Some(cholesky) = well_conditioned_cholesky(normal, RANK_TOLERANCE) else {
            warn!("the least-squares normal matrix of ghost macro cell {} is rank deficient; flagging it unprojectable", cell.id);
            unprojectable.push(cell.id);
            continue;
        };
        let solution = cholesky.solve(&rhs);

        // Scatter the cell block, averaging shared nodes.
        let micro_columns: Vec<(usize, NodeId)> = {
            let mut pairs: Vec<_> = micro_local.iter().map(|(&node, &local)| (local, node)).collect();
            pairs.sort_unstable();
            pairs
        };
        for (a, &macro_node) in cell.connectivity.iter().enumerate() {
            let Some(local_index) = dofs.ghost_macro.local_index(macro_node) else {
                continue;
            };
            let share = 1.0 / cells_per_node[local_index] as f64;
            let row0 = MACRO_DOF_PER_NODE * local_index;
            for component in 0..MACRO_DOF_PER_NODE {
                let local_row = MACRO_DOF_PER_NODE * a + component;
                for &(local_col_node, node) in &micro_columns {
                    let col0 = dofs
                        .free_micro
                        .first_dof(node)
                        .expect("micro_local contains free micro nodes only");
                    for i in 0..MICRO_DOF_PER_NODE {
                        let value = solution[(local_row, MICRO_DOF_PER_NODE * local_col_node + i)];
                        if value != 0.0 {
                            coo.push(row0 + component, col0 + i, share * value);
                        }
                    }
                }
            }
        }
    }

    Ok(CscMatrix::from(&coo))
}
