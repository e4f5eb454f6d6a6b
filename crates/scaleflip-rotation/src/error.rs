//! Rotation error types.

use std::fmt;

use thiserror::Error;

use scaleflip_provider::ProviderError;

use crate::controller::Step;

/// A single operation that did not reach a successful terminal state.
#[derive(Debug)]
pub struct OperationFailure {
    /// What the operation was mutating, e.g. `instance 5`.
    pub target: String,
    pub error: ProviderError,
}

impl fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.target, self.error)
    }
}

/// Errors that abort a rotation.
#[derive(Debug, Error)]
pub enum RotationError {
    #[error("{phase}: failed to read scale set {scale_set}: {source}")]
    Read {
        phase: Step,
        scale_set: String,
        #[source]
        source: ProviderError,
    },

    #[error("{phase}: failed to list instances: {source}")]
    List {
        phase: Step,
        #[source]
        source: ProviderError,
    },

    #[error("{phase}: provider rejected update of {target} ({awaited} earlier operation(s) awaited first): {source}")]
    UpdateSubmit {
        phase: Step,
        target: String,
        awaited: usize,
        #[source]
        source: ProviderError,
    },

    #[error("{phase}: {} operation(s) failed: {}", .failures.len(), join(.failures))]
    Await {
        phase: Step,
        failures: Vec<OperationFailure>,
    },

    #[error(
        "{phase}: {applied} operation(s) applied but {} failed, protection flags are inconsistent (run `scaleflip unprotect` to clear them): {}",
        .failures.len(),
        join(.failures)
    )]
    PartialApplication {
        phase: Step,
        applied: usize,
        failures: Vec<OperationFailure>,
    },

    #[error("scale-in to {target} would drop below the original capacity {original}")]
    CapacityBelowOriginal { original: u64, target: u64 },
}

impl RotationError {
    /// The phase the failure belongs to.
    pub fn phase(&self) -> Step {
        match self {
            RotationError::Read { phase, .. }
            | RotationError::List { phase, .. }
            | RotationError::UpdateSubmit { phase, .. }
            | RotationError::Await { phase, .. }
            | RotationError::PartialApplication { phase, .. } => *phase,
            RotationError::CapacityBelowOriginal { .. } => Step::ScaleIn,
        }
    }

    /// Whether protection flags may have been left set on some instances.
    pub fn needs_cleanup(&self) -> bool {
        match self {
            RotationError::PartialApplication { .. } => true,
            RotationError::UpdateSubmit {
                phase: Step::ProtectNew,
                awaited,
                ..
            } => *awaited > 0,
            other => other.phase() >= Step::ScaleIn,
        }
    }
}

fn join(failures: &[OperationFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type RotationResult<T> = Result<T, RotationError>;
