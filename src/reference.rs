//! Reference-state characterization of micro domains.
//!
//! Runs exactly once, on the first valid increment pair: for every micro
//! domain it computes the reference mass, center of mass, moment of inertia,
//! the owning macro cell's shape functions at the center of mass, and the
//! per-node relative position vectors Ξ consumed by the direct projection
//! strategy. The records are immutable afterwards; per-increment quantities
//! (current centers of mass) are recomputed separately.

use eyre::{Result, WrapErr};
use nalgebra::{Matrix3, Point3, Vector3};

use crate::data::{MacroState, MicroState};
use crate::element::Hex8Basis;
use crate::error::CouplingError;
use crate::mesh::{DomainIndex, MultiscaleMesh};

/// Reference coordinates further than this (in the reference cell metric)
/// outside [-1, 1]^3 make a center of mass a geometry inconsistency.
pub const CONTAINMENT_TOLERANCE: f64 = 1e-8;

/// Immutable reference record of one micro domain.
#[derive(Debug, Clone)]
pub struct DomainReference {
    pub domain: DomainIndex,
    /// Σ w·ρ·V over the member nodes.
    pub mass: f64,
    /// Σ w·V over the member nodes.
    pub volume: f64,
    pub center_of_mass: Point3<f64>,
    /// Mass-weighted second moment Σ w·m·Ξ⊗Ξ about the center of mass.
    pub moment_of_inertia: Matrix3<f64>,
    /// Center of mass in the owning cell's reference coordinates.
    pub local_center_of_mass: Point3<f64>,
    /// Owning-cell shape functions at the center of mass.
    pub shape_functions: Hex8Basis,
    /// Relative position Ξ of each member node, aligned with the domain's
    /// node list.
    pub xis: Vec<Vector3<f64>>,
}

/// The arena of reference records, aligned with the mesh domain arena.
#[derive(Debug, Clone)]
pub struct ReferenceState {
    domains: Vec<DomainReference>,
}

impl ReferenceState {
    pub fn domains(&self) -> &[DomainReference] {
        &self.domains
    }

    pub fn domain(&self, index: DomainIndex) -> &DomainReference {
        &self.domains[index.0]
    }
}

/// Mass and center of mass of a node set, from reference positions.
///
/// A domain carrying zero mass is a configuration error: it cannot
/// participate in any mass-weighted projection.
pub fn domain_mass_properties(
    name: &str,
    nodes: &[usize],
    micro: &MicroState,
    displaced: bool,
) -> Result<(f64, f64, Point3<f64>)> {
    let op = "domain_mass_properties";
    let mut mass = 0.0;
    let mut volume = 0.0;
    let mut weighted_position = Vector3::zeros();
    for &node in nodes {
        let node_mass = micro.node_mass(node)?;
        let position = if displaced {
            micro.current_position(node)?
        } else {
            *micro.require("reference position", &micro.reference_positions, node)?
        };
        mass += node_mass;
        volume += micro.node_volume(node)?;
        weighted_position += node_mass * position.coords;
    }

    if mass <= 0.0 {
        return Err(CouplingError::configuration(op, format!("micro domain '{name}' carries no mass")).into());
    }

    Ok((mass, volume, Point3::from(weighted_position / mass)))
}

/// Builds the reference state for every micro domain of the mesh.
///
/// `micro` must hold the reference-increment fields; `macro_state` supplies
/// the macro reference positions for shape-function evaluation. A center of
/// mass outside its owning cell (beyond [`CONTAINMENT_TOLERANCE`]) is a
/// geometry inconsistency and fails the whole build: a broken reference
/// state would silently corrupt every projection operator derived from it.
pub fn build_reference_state(mesh: &MultiscaleMesh, micro: &MicroState, macro_state: &MacroState) -> Result<ReferenceState> {
    let op = "build_reference_state";
    let mut domains = Vec::with_capacity(mesh.num_domains());

    for (raw_index, domain) in mesh.domains().iter().enumerate() {
        let index = DomainIndex(raw_index);
        let (mass, volume, center_of_mass) = domain_mass_properties(&domain.name, &domain.nodes, micro, false)
            .wrap_err_with(|| format!("{op}: characterizing micro domain '{}'", domain.name))?;

        let mut moment_of_inertia = Matrix3::zeros();
        let mut xis = Vec::with_capacity(domain.nodes.len());
        for &node in &domain.nodes {
            let position = micro.require("reference position", &micro.reference_positions, node)?;
            let xi = position - center_of_mass;
            moment_of_inertia += micro.node_mass(node)? * xi * xi.transpose();
            xis.push(xi);
        }

        let cell = mesh.cell(domain.cell).ok_or_else(|| {
            CouplingError::configuration(op, format!("micro domain '{}' references unknown macro cell {}", domain.name, domain.cell))
        })?;
        let element = cell.element(&macro_state.reference_positions)?;

        if !element.bounding_box_contains(&center_of_mass, CONTAINMENT_TOLERANCE * element.diameter().max(1.0)) {
            return Err(CouplingError::geometry(
                op,
                format!(
                    "center of mass {:?} of micro domain '{}' lies outside the bounding box of macro cell {}",
                    center_of_mass, domain.name, domain.cell
                ),
            )
            .into());
        }

        let local_center_of_mass = element
            .local_coordinates(&center_of_mass)
            .wrap_err_with(|| format!("{op}: locating the center of mass of micro domain '{}'", domain.name))?;

        if !element.local_point_inside(&local_center_of_mass, CONTAINMENT_TOLERANCE.max(1e-6)) {
            return Err(CouplingError::geometry(
                op,
                format!(
                    "center of mass of micro domain '{}' maps to reference coordinates {:?} outside macro cell {}",
                    domain.name, local_center_of_mass, domain.cell
                ),
            )
            .into());
        }

        let shape_functions = element.evaluate_basis(&local_center_of_mass);

        domains.push(DomainReference {
            domain: index,
            mass,
            volume,
            center_of_mass,
            moment_of_inertia,
            local_center_of_mass,
            shape_functions,
            xis,
        });
    }

    Ok(ReferenceState { domains })
}
