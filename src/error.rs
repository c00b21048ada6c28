//! Error taxonomy for the coupling pipeline.
//!
//! Failures are values, never unwinding: every fallible operation returns
//! [`eyre::Result`], and callers attach an operation frame with
//! [`eyre::WrapErr`] so the top-level increment call receives the full causal
//! chain. The root of a chain is a [`CouplingError`], which carries the
//! category that determines how the caller must react:
//!
//! - [`ErrorCategory::Configuration`]: fatal, detected before numerical work;
//! - [`ErrorCategory::Geometry`]: recoverable per-domain (the offending
//!   domain's contribution is zeroed and a warning recorded);
//! - [`ErrorCategory::Numerical`]: fatal to the increment, never retried;
//! - [`ErrorCategory::Io`]: fatal, missing physical data cannot be defaulted.

use std::error::Error;
use std::fmt;

/// The failure classes of the coupling pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Missing or contradictory options, unknown strategy names.
    Configuration,
    /// Degenerate domain volume, center of mass outside the owning cell,
    /// unassignable surface region.
    Geometry,
    /// Singular normal-equation system, singular coupled mass matrix.
    Numerical,
    /// A collaborator failed to supply a requested field.
    Io,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Geometry => "geometry",
            ErrorCategory::Numerical => "numerical",
            ErrorCategory::Io => "io",
        };
        write!(f, "{label}")
    }
}

/// Root error of a failure chain.
///
/// `operation` names the operation that raised the error with enough context
/// (domain name, cell id, matrix name) to reproduce the failure in a test.
#[derive(Debug, Clone)]
pub struct CouplingError {
    category: ErrorCategory,
    operation: String,
    message: String,
}

impl CouplingError {
    pub fn new(category: ErrorCategory, operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category,
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn configuration(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Configuration, operation, message)
    }

    pub fn geometry(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Geometry, operation, message)
    }

    pub fn numerical(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Numerical, operation, message)
    }

    pub fn io(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Io, operation, message)
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CouplingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error in {}: {}", self.category, self.operation, self.message)
    }
}

impl Error for CouplingError {}

/// Returns the category of the root [`CouplingError`] in a report's chain,
/// if the chain bottoms out in one.
pub fn root_category(report: &eyre::Report) -> Option<ErrorCategory> {
    report
        .chain()
        .filter_map(|err| err.downcast_ref::<CouplingError>())
        .last()
        .map(CouplingError::category)
}
