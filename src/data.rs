//! The mesh/solution data collaborator.
//!
//! Replaces the persisted simulation-exchange file reader: an implementation
//! of [`MultiscaleData`] supplies, for an increment pair, every nodal field
//! the pipeline consumes. All data is pulled eagerly into an owned
//! [`IncrementSnapshot`] before homogenization begins, so the numerical core
//! never blocks on I/O. A field missing for a requested node is an I/O
//! error: missing physical data cannot be safely defaulted.

use eyre::Result;
use nalgebra::{Matrix3, Point3, SVector, Vector3};
use rustc_hash::FxHashMap;

use crate::config::ForceSignConventions;
use crate::dof::{NodeId, MACRO_DOF_PER_NODE};
use crate::error::CouplingError;
use crate::mesh::MultiscaleMesh;

/// A macro nodal DOF vector: 3 displacement + 9 micro-deformation components.
pub type MacroDof = SVector<f64, { MACRO_DOF_PER_NODE }>;

/// The increments at which the micro and macro solutions are sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IncrementPair {
    pub micro_increment: usize,
    pub macro_increment: usize,
}

/// Per-micro-node fields for one increment.
#[derive(Debug, Clone, Default)]
pub struct MicroState {
    pub reference_positions: FxHashMap<NodeId, Point3<f64>>,
    pub displacements: FxHashMap<NodeId, Vector3<f64>>,
    pub velocities: FxHashMap<NodeId, Vector3<f64>>,
    pub accelerations: FxHashMap<NodeId, Vector3<f64>>,
    pub densities: FxHashMap<NodeId, f64>,
    pub volumes: FxHashMap<NodeId, f64>,
    /// Node weights de-duplicating nodes shared between overlapping domains.
    pub weights: FxHashMap<NodeId, f64>,
    pub body_forces: FxHashMap<NodeId, Vector3<f64>>,
    pub surface_forces: FxHashMap<NodeId, Vector3<f64>>,
    /// Micro stress, 9 components per node.
    pub stresses: FxHashMap<NodeId, Matrix3<f64>>,
}

impl MicroState {
    /// Current (displaced) position of a micro node.
    pub fn current_position(&self, node: NodeId) -> Result<Point3<f64>> {
        let reference = self.require("reference position", &self.reference_positions, node)?;
        let displacement = self.require("displacement", &self.displacements, node)?;
        Ok(reference + displacement)
    }

    /// Mass w·ρ·V carried by a micro node.
    pub fn node_mass(&self, node: NodeId) -> Result<f64> {
        let weight = self.require("weight", &self.weights, node)?;
        let density = self.require("density", &self.densities, node)?;
        let volume = self.require("volume", &self.volumes, node)?;
        Ok(weight * density * volume)
    }

    /// Weighted nodal volume w·V of a micro node.
    pub fn node_volume(&self, node: NodeId) -> Result<f64> {
        let weight = self.require("weight", &self.weights, node)?;
        let volume = self.require("volume", &self.volumes, node)?;
        Ok(weight * volume)
    }

    pub fn require<'a, T>(&self, field: &str, map: &'a FxHashMap<NodeId, T>, node: NodeId) -> Result<&'a T> {
        map.get(&node)
            .ok_or_else(|| CouplingError::io("MicroState::require", format!("no {field} supplied for micro node {node}")).into())
    }
}

/// Per-macro-node fields for one increment.
#[derive(Debug, Clone, Default)]
pub struct MacroState {
    pub reference_positions: FxHashMap<NodeId, Point3<f64>>,
    /// Generalized DOF (displacement + micro-deformation) per node.
    pub dof: FxHashMap<NodeId, MacroDof>,
    pub velocities: FxHashMap<NodeId, MacroDof>,
    pub accelerations: FxHashMap<NodeId, MacroDof>,
    pub internal_forces: FxHashMap<NodeId, MacroDof>,
    pub external_forces: FxHashMap<NodeId, MacroDof>,
    pub inertial_forces: FxHashMap<NodeId, MacroDof>,
}

impl MacroState {
    pub fn require<'a, T>(&self, field: &str, map: &'a FxHashMap<NodeId, T>, node: NodeId) -> Result<&'a T> {
        map.get(&node)
            .ok_or_else(|| CouplingError::io("MacroState::require", format!("no {field} supplied for macro node {node}")).into())
    }
}

/// Everything the pipeline needs for one increment, pulled eagerly.
#[derive(Debug, Clone, Default)]
pub struct IncrementSnapshot {
    pub time: f64,
    pub micro: MicroState,
    pub macro_state: MacroState,
    pub free_micro_nodes: Vec<NodeId>,
    pub ghost_micro_nodes: Vec<NodeId>,
    pub free_macro_nodes: Vec<NodeId>,
    pub ghost_macro_nodes: Vec<NodeId>,
}

/// Read-only access to the multiscale mesh and the per-increment solution
/// fields.
pub trait MultiscaleData {
    /// The mesh topology, constant over all increments.
    fn mesh(&self) -> &MultiscaleMesh;

    /// Number of increment pairs available.
    fn num_increments(&self) -> usize;

    /// Pulls the snapshot for an increment pair. Requesting an unavailable
    /// increment is an I/O error.
    fn increment(&self, pair: IncrementPair) -> Result<IncrementSnapshot>;
}

/// An in-memory [`MultiscaleData`] implementation, used by the test fixtures
/// and by callers that assemble their state programmatically.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMultiscaleData {
    mesh: MultiscaleMesh,
    increments: Vec<IncrementSnapshot>,
}

impl InMemoryMultiscaleData {
    pub fn new(mesh: MultiscaleMesh, increments: Vec<IncrementSnapshot>) -> Self {
        Self { mesh, increments }
    }
}

impl MultiscaleData for InMemoryMultiscaleData {
    fn mesh(&self) -> &MultiscaleMesh {
        &self.mesh
    }

    fn num_increments(&self) -> usize {
        self.increments.len()
    }

    fn increment(&self, pair: IncrementPair) -> Result<IncrementSnapshot> {
        if pair.micro_increment != pair.macro_increment {
            return Err(CouplingError::io(
                "InMemoryMultiscaleData::increment",
                format!(
                    "this source stores paired increments only, requested micro {} / macro {}",
                    pair.micro_increment, pair.macro_increment
                ),
            )
            .into());
        }
        self.increments.get(pair.micro_increment).cloned().ok_or_else(|| {
            CouplingError::io(
                "InMemoryMultiscaleData::increment",
                format!("increment {} is not available (have {})", pair.micro_increment, self.increments.len()),
            )
            .into()
        })
    }
}

/// Applies the configured sign conventions to the force-like fields of a
/// freshly pulled snapshot.
///
/// Signs are applied exactly once, at extraction time, so the numerical core
/// can assume a single convention throughout.
pub fn apply_force_signs(snapshot: &mut IncrementSnapshot, signs: &ForceSignConventions) {
    scale_vectors(&mut snapshot.micro.body_forces, signs.micro_body);
    scale_vectors(&mut snapshot.micro.surface_forces, signs.micro_surface);
    scale_dofs(&mut snapshot.macro_state.internal_forces, signs.macro_internal);
    scale_dofs(&mut snapshot.macro_state.external_forces, signs.macro_external);
    scale_dofs(&mut snapshot.macro_state.inertial_forces, signs.macro_inertial);
}

fn scale_vectors(map: &mut FxHashMap<NodeId, Vector3<f64>>, sign: f64) {
    if sign != 1.0 {
        for value in map.values_mut() {
            *value *= sign;
        }
    }
}

fn scale_dofs(map: &mut FxHashMap<NodeId, MacroDof>, sign: f64) {
    if sign != 1.0 {
        for value in map.values_mut() {
            *value *= sign;
        }
    }
}
