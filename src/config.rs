//! Configuration surface of the coupling engine.
//!
//! All strategy selectors are closed enumerations deserialized by name, so an
//! unknown strategy fails at deserialization time rather than at first use.
//! [`CouplingConfiguration::validate`] performs the cross-field checks once,
//! before any numerical work; every configuration failure is fatal.

use eyre::Result;
use serde::{Deserialize, Serialize};

use crate::error::CouplingError;

/// Strategy for constructing the inter-scale projection operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionStrategy {
    /// Exact shape-function interpolation with a mass-weighted pseudo-inverse
    /// for the micro-to-macro direction.
    DirectProjection,
    /// Least-squares fit of the macro DOF to per-domain moment data.
    L2Projection,
    /// Least-squares fit with each domain's contribution weighted by its
    /// volume fraction of the owning cell.
    AveragedL2Projection,
}

/// Consistency-enforcement path of the coupled assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouplingMode {
    /// Ghost DOF derived from free DOF through the projection operators.
    Direct,
    /// Energy-weighted coupling with an augmented coupling force.
    Arlequin,
}

/// Strategy for the kinetic/potential energy partitioning coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitioningStrategy {
    VolumeFraction,
}

/// Newmark-beta integration parameters.
///
/// The defaults (β = 1/4, γ = 1/2) are the average-acceleration scheme,
/// unconditionally stable for linear problems.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NewmarkParameters {
    pub beta: f64,
    pub gamma: f64,
}

impl Default for NewmarkParameters {
    fn default() -> Self {
        Self { beta: 0.25, gamma: 0.5 }
    }
}

/// Penalty parameters of the Arlequin coupling path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArlequinParameters {
    #[serde(default = "default_penalty")]
    pub penalty_parameter: f64,
    #[serde(default = "default_penalty")]
    pub update_penalty_parameter: f64,
}

fn default_penalty() -> f64 {
    1.0
}

impl Default for ArlequinParameters {
    fn default() -> Self {
        Self {
            penalty_parameter: 1.0,
            update_penalty_parameter: 1.0,
        }
    }
}

/// Per-scale, per-field force sign multipliers.
///
/// The macro internal force defaults to −1 for consistency with the
/// micromorphic element implementation; everything else defaults to +1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForceSignConventions {
    pub macro_internal: f64,
    pub macro_inertial: f64,
    pub macro_body: f64,
    pub macro_surface: f64,
    pub macro_external: f64,
    pub micro_internal: f64,
    pub micro_inertial: f64,
    pub micro_body: f64,
    pub micro_surface: f64,
    pub micro_external: f64,
}

impl Default for ForceSignConventions {
    fn default() -> Self {
        Self {
            macro_internal: -1.0,
            macro_inertial: 1.0,
            macro_body: 1.0,
            macro_surface: 1.0,
            macro_external: 1.0,
            micro_internal: 1.0,
            micro_inertial: 1.0,
            micro_body: 1.0,
            micro_surface: 1.0,
            micro_external: 1.0,
        }
    }
}

impl ForceSignConventions {
    fn entries(&self) -> [(&'static str, f64); 10] {
        [
            ("macro_internal", self.macro_internal),
            ("macro_inertial", self.macro_inertial),
            ("macro_body", self.macro_body),
            ("macro_surface", self.macro_surface),
            ("macro_external", self.macro_external),
            ("micro_internal", self.micro_internal),
            ("micro_inertial", self.micro_inertial),
            ("micro_body", self.micro_body),
            ("micro_surface", self.micro_surface),
            ("micro_external", self.micro_external),
        ]
    }
}

/// Toggles for what gets pushed to the persisted-matrix archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputToggles {
    pub reference_information: bool,
    pub homogenized_response: bool,
    pub updated_dof: bool,
}

impl Default for OutputToggles {
    fn default() -> Self {
        Self {
            reference_information: false,
            homogenized_response: false,
            updated_dof: true,
        }
    }
}

/// The complete, validated configuration of the coupling engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CouplingConfiguration {
    pub projection: ProjectionStrategy,
    pub coupling: CouplingMode,
    pub partitioning: PartitioningStrategy,
    /// Arlequin penalty parameters; only meaningful for
    /// [`CouplingMode::Arlequin`].
    pub arlequin: Option<ArlequinParameters>,
    pub kinetic_energy_weighting_factor: f64,
    pub potential_energy_weighting_factor: f64,
    /// Interface damping proportionality at the macro scale.
    pub macro_proportionality_coefficient: f64,
    /// Interface damping proportionality at the micro scale.
    pub micro_proportionality_coefficient: f64,
    pub newmark: NewmarkParameters,
    /// Time step Δt for the displacement update.
    pub timestep: f64,
    pub force_signs: ForceSignConventions,
    pub outputs: OutputToggles,
}

impl Default for CouplingConfiguration {
    fn default() -> Self {
        Self {
            projection: ProjectionStrategy::AveragedL2Projection,
            coupling: CouplingMode::Direct,
            partitioning: PartitioningStrategy::VolumeFraction,
            arlequin: None,
            kinetic_energy_weighting_factor: 0.5,
            potential_energy_weighting_factor: 0.5,
            macro_proportionality_coefficient: 1e-3,
            micro_proportionality_coefficient: 1e-3,
            newmark: NewmarkParameters::default(),
            timestep: 1.0,
            force_signs: ForceSignConventions::default(),
            outputs: OutputToggles::default(),
        }
    }
}

impl CouplingConfiguration {
    /// Checks option ranges and cross-field consistency.
    ///
    /// Must be called (and succeed) before the configuration is handed to the
    /// coupling engine; all failures are configuration errors.
    pub fn validate(&self) -> Result<()> {
        let op = "CouplingConfiguration::validate";

        if !(self.timestep > 0.0) {
            return Err(CouplingError::configuration(op, format!("timestep must be positive, got {}", self.timestep)).into());
        }

        if !(self.newmark.beta > 0.0 && self.newmark.beta <= 0.5) {
            return Err(CouplingError::configuration(
                op,
                format!("Newmark beta must lie in (0, 0.5], got {}", self.newmark.beta),
            )
            .into());
        }

        if !(self.newmark.gamma > 0.0 && self.newmark.gamma <= 1.0) {
            return Err(CouplingError::configuration(
                op,
                format!("Newmark gamma must lie in (0, 1], got {}", self.newmark.gamma),
            )
            .into());
        }

        for factor in [
            self.kinetic_energy_weighting_factor,
            self.potential_energy_weighting_factor,
        ] {
            if !(0.0..=1.0).contains(&factor) {
                return Err(
                    CouplingError::configuration(op, format!("energy weighting factors must lie in [0, 1], got {factor}")).into(),
                );
            }
        }

        for coefficient in [
            self.macro_proportionality_coefficient,
            self.micro_proportionality_coefficient,
        ] {
            if !(coefficient >= 0.0) {
                return Err(CouplingError::configuration(
                    op,
                    format!("proportionality coefficients must be non-negative, got {coefficient}"),
                )
                .into());
            }
        }

        for (name, sign) in self.force_signs.entries() {
            if sign != 1.0 && sign != -1.0 {
                return Err(CouplingError::configuration(op, format!("force sign '{name}' must be +1 or -1, got {sign}")).into());
            }
        }

        if self.coupling == CouplingMode::Direct && self.arlequin.is_some() {
            return Err(CouplingError::configuration(
                op,
                "Arlequin parameters were supplied but the coupling mode is 'direct'",
            )
            .into());
        }

        if let Some(arlequin) = &self.arlequin {
            if !(arlequin.penalty_parameter > 0.0) || !(arlequin.update_penalty_parameter > 0.0) {
                return Err(CouplingError::configuration(op, "Arlequin penalty parameters must be positive").into());
            }
        }

        Ok(())
    }

    /// The Arlequin parameters, falling back to the documented defaults when
    /// none were supplied.
    pub fn arlequin_parameters(&self) -> ArlequinParameters {
        self.arlequin.unwrap_or_default()
    }
}
