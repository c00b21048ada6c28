//! The overlap-coupling orchestrator.
//!
//! Drives the serial per-increment pipeline: pull the increment snapshot,
//! build the reference state and projection operators on the first valid
//! increment, homogenize, assemble, advance the free macro DOF with
//! Newmark-beta, and derive the ghost DOF through the projection operators.
//! One increment is fully processed before the next begins; all shared
//! mutable state is owned by the in-flight call.

use eyre::{Result, WrapErr};
use log::info;
use nalgebra::DVector;

use crate::assembly::{
    assemble_free_macro_system, ArlequinScheme, CouplingScheme, CouplingState, ProjectionConsistentScheme,
};
use crate::config::{CouplingConfiguration, CouplingMode};
use crate::data::{apply_force_signs, IncrementPair, IncrementSnapshot, MultiscaleData};
use crate::dof::DofPartition;
use crate::homogenization::{homogenize_increment, macro_current_positions, HomogenizedIncrement};
use crate::integrator::{DofHistory, NewmarkIntegrator};
use crate::io::{DenseMatrixRecord, MatrixArchive, SparseMatrixRecord};
use crate::projection::{build_projection_operators, ProjectionOperators};
use crate::reference::{build_reference_state, ReferenceState};
use crate::volume::VolumeReconstructor;

/// Everything derived from the reference configuration, built once.
struct ReferenceData {
    dofs: DofPartition,
    reference: ReferenceState,
    operators: ProjectionOperators,
}

/// Results of one processed increment.
#[derive(Debug, Clone)]
pub struct IncrementReport {
    pub homogenized: HomogenizedIncrement,
    /// Assembled external force/couple per free macro node.
    pub node_external_force: rustc_hash::FxHashMap<crate::dof::NodeId, crate::data::MacroDof>,
    /// Updated free macro DOF history (displacement, velocity,
    /// acceleration).
    pub free_macro: DofHistory,
    /// Ghost macro DOF derived through the projector.
    pub ghost_macro_dof: DVector<f64>,
    /// Ghost micro DOF derived through the projector.
    pub ghost_micro_dof: DVector<f64>,
    /// Norm of the coupling scheme's consistency-error vector.
    pub consistency_error_norm: f64,
}

/// The micromorphic overlap-coupling engine.
pub struct OverlapCoupling<Data, Reconstructor> {
    config: CouplingConfiguration,
    data: Data,
    reconstructor: Reconstructor,
    reference_data: Option<ReferenceData>,
    free_macro_history: Option<DofHistory>,
    ghost_macro_estimate: Option<DVector<f64>>,
    ghost_micro_estimate: Option<DVector<f64>>,
}

impl<Data, Reconstructor> OverlapCoupling<Data, Reconstructor>
where
    Data: MultiscaleData,
    Reconstructor: VolumeReconstructor,
{
    /// Validates the configuration and wires the collaborators together.
    pub fn new(config: CouplingConfiguration, data: Data, reconstructor: Reconstructor) -> Result<Self> {
        config.validate().wrap_err("OverlapCoupling::new: invalid configuration")?;
        Ok(Self {
            config,
            data,
            reconstructor,
            reference_data: None,
            free_macro_history: None,
            ghost_macro_estimate: None,
            ghost_micro_estimate: None,
        })
    }

    pub fn config(&self) -> &CouplingConfiguration {
        &self.config
    }

    /// The reference state, once the first increment has been processed.
    pub fn reference(&self) -> Option<&ReferenceState> {
        self.reference_data.as_ref().map(|data| &data.reference)
    }

    /// The projection operators, once built.
    pub fn operators(&self) -> Option<&ProjectionOperators> {
        self.reference_data.as_ref().map(|data| &data.operators)
    }

    /// The DOF partition, once built.
    pub fn dofs(&self) -> Option<&DofPartition> {
        self.reference_data.as_ref().map(|data| &data.dofs)
    }

    /// Processes one increment pair through the full pipeline.
    pub fn process_increment(&mut self, pair: IncrementPair, archive: &mut dyn MatrixArchive) -> Result<IncrementReport> {
        let op = "OverlapCoupling::process_increment";
        let mut snapshot = self
            .data
            .increment(pair)
            .wrap_err_with(|| format!("{op}: pulling increment pair {pair:?}"))?;
        apply_force_signs(&mut snapshot, &self.config.force_signs);

        if self.reference_data.is_none() {
            self.initialize_reference(&snapshot, pair, archive)
                .wrap_err_with(|| format!("{op}: initializing the coupling from increment pair {pair:?}"))?;
        }
        let reference_data = self.reference_data.as_ref().expect("initialized above");

        let mesh = self.data.mesh();
        let homogenized = homogenize_increment(mesh, &reference_data.reference, &snapshot, &self.reconstructor)
            .wrap_err_with(|| format!("{op}: homogenizing increment pair {pair:?}"))?;

        let macro_positions = macro_current_positions(&snapshot.macro_state);
        let system = assemble_free_macro_system(mesh, &homogenized, &reference_data.dofs, &macro_positions)
            .wrap_err_with(|| format!("{op}: assembling increment pair {pair:?}"))?;

        let free_macro_dof = gather_free_macro_dof(&snapshot, &reference_data.dofs);
        let free_micro_dof = gather_free_micro_dof(&snapshot, &reference_data.dofs)?;
        let ghost_macro_previous = self
            .ghost_macro_estimate
            .clone()
            .unwrap_or_else(|| DVector::zeros(reference_data.dofs.ghost_macro.num_dofs()));
        let ghost_micro_previous = self
            .ghost_micro_estimate
            .clone()
            .unwrap_or_else(|| DVector::zeros(reference_data.dofs.ghost_micro.num_dofs()));

        let arlequin;
        let projection_consistent;
        let scheme: &dyn CouplingScheme = match self.config.coupling {
            CouplingMode::Direct => {
                projection_consistent = ProjectionConsistentScheme::new(
                    &reference_data.operators,
                    self.config.macro_proportionality_coefficient,
                    self.config.micro_proportionality_coefficient,
                );
                &projection_consistent
            }
            CouplingMode::Arlequin => {
                arlequin = ArlequinScheme::new(
                    mesh,
                    &reference_data.reference,
                    &reference_data.operators,
                    &reference_data.dofs,
                    &macro_positions,
                    self.config.arlequin_parameters(),
                    self.config.kinetic_energy_weighting_factor,
                )?;
                &arlequin
            }
        };

        let coupling_state = CouplingState {
            free_macro_dof: &free_macro_dof,
            free_micro_dof: &free_micro_dof,
            ghost_macro_dof: &ghost_macro_previous,
            ghost_micro_dof: &ghost_micro_previous,
            homogenized: &homogenized,
            reference: &reference_data.reference,
        };

        let coupling_force = scheme.coupling_force(&coupling_state)?;
        let consistency_error_norm = scheme.consistency_error(&coupling_state)?.norm();

        let mut mass = system.mass.clone();
        if let Some(extra) = scheme.coupling_mass(&reference_data.dofs)? {
            mass = &mass + &extra;
        }
        let damping = scheme.coupling_damping(&reference_data.dofs)?;

        let force = &system.external_force - &system.internal_force + coupling_force;
        let previous = self
            .free_macro_history
            .clone()
            .unwrap_or_else(|| DofHistory::zeros(reference_data.dofs.free_macro.num_dofs()));

        let integrator = NewmarkIntegrator::new(self.config.newmark, self.config.timestep);
        let updated = integrator
            .advance(&mass, damping.as_ref(), &force, &previous)
            .wrap_err_with(|| format!("{op}: time integration of increment pair {pair:?}"))?;

        // Ghost DOF are derived, never solved.
        let ghost_macro_dof = reference_data
            .operators
            .project_ghost_macro(&free_micro_dof, &updated.displacement);
        let ghost_micro_dof = reference_data
            .operators
            .project_ghost_micro(&free_micro_dof, &updated.displacement);

        if self.config.outputs.homogenized_response {
            self.write_homogenized_outputs(pair, &system.external_force, archive)?;
        }
        if self.config.outputs.updated_dof {
            write_dense_vector(archive, pair.macro_increment, "updated_free_macro_displacement", &updated.displacement)?;
            write_dense_vector(archive, pair.macro_increment, "updated_free_macro_velocity", &updated.velocity)?;
            write_dense_vector(archive, pair.macro_increment, "updated_free_macro_acceleration", &updated.acceleration)?;
            write_dense_vector(archive, pair.macro_increment, "updated_ghost_macro_dof", &ghost_macro_dof)?;
            write_dense_vector(archive, pair.macro_increment, "updated_ghost_micro_dof", &ghost_micro_dof)?;
        }

        self.free_macro_history = Some(updated.clone());
        self.ghost_macro_estimate = Some(ghost_macro_dof.clone());
        self.ghost_micro_estimate = Some(ghost_micro_dof.clone());

        info!(
            "processed increment pair {pair:?}: {} homogenization warnings, consistency error {consistency_error_norm:.3e}",
            homogenized.warnings.len()
        );

        Ok(IncrementReport {
            homogenized,
            node_external_force: system.node_external_force,
            free_macro: updated,
            ghost_macro_dof,
            ghost_micro_dof,
            consistency_error_norm,
        })
    }

    /// Builds the DOF partition, reference state and projection operators
    /// from the first valid increment.
    fn initialize_reference(
        &mut self,
        snapshot: &IncrementSnapshot,
        pair: IncrementPair,
        archive: &mut dyn MatrixArchive,
    ) -> Result<()> {
        let mesh = self.data.mesh();
        let dofs = DofPartition::new(
            &snapshot.free_macro_nodes,
            &snapshot.ghost_macro_nodes,
            &snapshot.free_micro_nodes,
            &snapshot.ghost_micro_nodes,
        )?;
        let reference = build_reference_state(mesh, &snapshot.micro, &snapshot.macro_state)?;
        let operators = build_projection_operators(
            self.config.projection,
            mesh,
            &reference,
            &snapshot.micro,
            &snapshot.macro_state,
            &dofs,
        )?;

        if self.config.outputs.reference_information {
            let increment = pair.macro_increment;
            archive.write_sparse(
                increment,
                "reference_com_interpolator",
                SparseMatrixRecord::from_csc(&operators.com_interpolator),
            )?;
            archive.write_sparse(
                increment,
                "reference_ghost_micro_from_free_macro",
                SparseMatrixRecord::from_csc(&operators.ghost_micro_from_free_macro),
            )?;
            archive.write_sparse(
                increment,
                "reference_ghost_macro_from_free_micro",
                SparseMatrixRecord::from_csc(&operators.ghost_macro_from_free_micro),
            )?;
            for (cell, normal) in &operators.cell_normal_matrices {
                archive.write_dense(
                    increment,
                    &format!("reference_normal_matrix_cell_{cell}"),
                    DenseMatrixRecord::from_dmatrix(normal),
                )?;
            }
        }

        self.reference_data = Some(ReferenceData {
            dofs,
            reference,
            operators,
        });
        Ok(())
    }

    fn write_homogenized_outputs(
        &self,
        pair: IncrementPair,
        external_force: &DVector<f64>,
        archive: &mut dyn MatrixArchive,
    ) -> Result<()> {
        write_dense_vector(archive, pair.macro_increment, "homogenized_external_force", external_force)
    }
}

fn write_dense_vector(archive: &mut dyn MatrixArchive, increment: usize, name: &str, vector: &DVector<f64>) -> Result<()> {
    let record = DenseMatrixRecord {
        nrows: vector.len(),
        ncols: 1,
        values: vector.iter().copied().collect(),
    };
    archive.write_dense(increment, name, record)
}

/// Free macro DOF gathered from the snapshot; nodes without a supplied DOF
/// vector contribute zeros.
fn gather_free_macro_dof(snapshot: &IncrementSnapshot, dofs: &DofPartition) -> DVector<f64> {
    let map = &dofs.free_macro;
    let mut gathered = DVector::zeros(map.num_dofs());
    for (local, node) in map.iter() {
        if let Some(dof) = snapshot.macro_state.dof.get(&node) {
            for component in 0..map.dof_per_node() {
                gathered[map.dof_per_node() * local + component] = dof[component];
            }
        }
    }
    gathered
}

/// Free micro displacements gathered from the snapshot; a missing
/// displacement is an I/O error.
fn gather_free_micro_dof(snapshot: &IncrementSnapshot, dofs: &DofPartition) -> Result<DVector<f64>> {
    let map = &dofs.free_micro;
    let mut gathered = DVector::zeros(map.num_dofs());
    for (local, node) in map.iter() {
        let displacement = snapshot
            .micro
            .require("displacement", &snapshot.micro.displacements, node)?;
        for component in 0..map.dof_per_node() {
            gathered[map.dof_per_node() * local + component] = displacement[component];
        }
    }
    Ok(gathered)
}
