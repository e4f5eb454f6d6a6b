//! scaleflip blue/green rotation — the orchestrator.
//!
//! A rotation doubles a scale set, protects the new batch from scale-in,
//! halves it again so the provider removes the old unprotected instances,
//! then clears protection on the survivors.
//!
//! # Components
//!
//! - **`plan`** — Rotation factors and listing filters
//! - **`controller`** — Phase sequencing and abort policy
//! - **`fanout`** — Concurrent await barrier for per-instance operations
//! - **`error`** — Rotation error taxonomy

pub mod controller;
pub mod error;
pub mod fanout;
pub mod plan;

pub use controller::{Rotation, RotationPhase, RotationReport, Step};
pub use error::{OperationFailure, RotationError, RotationResult};
pub use fanout::{FanOutReport, await_all};
pub use plan::RotationPlan;
