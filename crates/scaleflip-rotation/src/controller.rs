//! Rotation controller — drives the blue/green phase sequence.
//!
//! The phases run strictly in order; each one must complete before the next
//! starts:
//!
//! ```text
//! ScaleOut → ProtectNew → AwaitProtect → ScaleIn → UnprotectAll → AwaitUnprotect → Done
//! ```
//!
//! Any failure moves the rotation to `Aborted`. Nothing is retried and
//! nothing is rolled back.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use scaleflip_core::{PendingOperation, ProtectionPolicy, ScaleSetRef, scale_capacity};
use scaleflip_provider::{ProviderError, ProviderGateway};

use crate::error::{OperationFailure, RotationError, RotationResult};
use crate::fanout::await_all;
use crate::plan::RotationPlan;

/// One step of the rotation, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Step {
    ScaleOut,
    ProtectNew,
    AwaitProtect,
    ScaleIn,
    UnprotectAll,
    AwaitUnprotect,
}

impl Step {
    pub fn label(&self) -> &'static str {
        match self {
            Step::ScaleOut => "scale-out",
            Step::ProtectNew => "protect-new",
            Step::AwaitProtect => "await-protect",
            Step::ScaleIn => "scale-in",
            Step::UnprotectAll => "unprotect-all",
            Step::AwaitUnprotect => "await-unprotect",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Current phase of a rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RotationPhase {
    /// Not started.
    Pending,
    /// Executing a step.
    Running(Step),
    /// Completed successfully.
    Done,
    /// Stopped by a failure.
    Aborted { during: Step, reason: String },
}

/// Summary of a completed rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationReport {
    pub scale_set: String,
    pub original_capacity: u64,
    pub scaled_out_capacity: u64,
    pub final_capacity: u64,
    /// Instances protected from scale-in.
    pub protected: usize,
    /// Instances whose protection was cleared.
    pub unprotected: usize,
    pub elapsed_secs: u64,
}

/// Operations collected by a submit phase.
struct Submission {
    ops: Vec<PendingOperation>,
    /// The error that stopped submission early, if any.
    rejected: Option<RotationError>,
}

/// A single, stateless rotation of one scale set.
pub struct Rotation<G> {
    gateway: Arc<G>,
    scale_set: ScaleSetRef,
    plan: RotationPlan,
    phase: RotationPhase,
    started_at: Option<Instant>,
}

impl<G: ProviderGateway> Rotation<G> {
    /// Create a rotation. Nothing is read until [`Rotation::run`].
    pub fn new(gateway: Arc<G>, scale_set: ScaleSetRef, plan: RotationPlan) -> Self {
        Self {
            gateway,
            scale_set,
            plan,
            phase: RotationPhase::Pending,
            started_at: None,
        }
    }

    pub fn phase(&self) -> &RotationPhase {
        &self.phase
    }

    pub fn plan(&self) -> &RotationPlan {
        &self.plan
    }

    /// Run the full rotation.
    pub async fn run(&mut self) -> RotationResult<RotationReport> {
        self.started_at = Some(Instant::now());
        info!(
            scale_set = %self.scale_set,
            scale_out = self.plan.scale_out_factor,
            scale_in = self.plan.scale_in_factor,
            "starting blue/green rotation"
        );

        let result = self.execute().await;
        self.finish(&result);
        result
    }

    /// Clear scale-in protection on every instance matched by the
    /// unprotect filter. Used to clean up after an aborted rotation.
    pub async fn unprotect(&mut self) -> RotationResult<usize> {
        self.started_at = Some(Instant::now());
        info!(scale_set = %self.scale_set, "clearing scale-in protection");

        let result = self.unprotect_phases().await;
        self.finish(&result);
        result
    }

    async fn execute(&mut self) -> RotationResult<RotationReport> {
        self.enter(Step::ScaleOut);
        let (original, scaled_out) = self
            .scale(Step::ScaleOut, self.plan.scale_out_factor, None)
            .await?;
        if scaled_out == original {
            warn!(
                scale_set = %self.scale_set,
                capacity = original,
                "scale-out did not add instances"
            );
        }

        self.enter(Step::ProtectNew);
        let submission = self
            .submit_protection(
                Step::ProtectNew,
                &self.plan.new_instance_filter,
                ProtectionPolicy::protected(),
            )
            .await;

        self.enter(Step::AwaitProtect);
        let protected = self.settle(Step::AwaitProtect, submission).await?;

        self.enter(Step::ScaleIn);
        let (_, final_capacity) = self
            .scale(Step::ScaleIn, self.plan.scale_in_factor, Some(original))
            .await?;

        let unprotected = self.unprotect_phases().await?;

        Ok(RotationReport {
            scale_set: self.scale_set.name.clone(),
            original_capacity: original,
            scaled_out_capacity: scaled_out,
            final_capacity,
            protected,
            unprotected,
            elapsed_secs: self.elapsed_secs(),
        })
    }

    async fn unprotect_phases(&mut self) -> RotationResult<usize> {
        self.enter(Step::UnprotectAll);
        let submission = self
            .submit_protection(
                Step::UnprotectAll,
                &self.plan.unprotect_filter,
                ProtectionPolicy::unprotected(),
            )
            .await;

        self.enter(Step::AwaitUnprotect);
        self.settle(Step::AwaitUnprotect, submission).await
    }

    fn enter(&mut self, step: Step) {
        info!(scale_set = %self.scale_set, phase = %step, "entering phase");
        self.phase = RotationPhase::Running(step);
    }

    fn finish<T>(&mut self, result: &RotationResult<T>) {
        match result {
            Ok(_) => {
                self.phase = RotationPhase::Done;
                info!(
                    scale_set = %self.scale_set,
                    elapsed_secs = self.elapsed_secs(),
                    "rotation completed"
                );
            }
            Err(e) => {
                let during = e.phase();
                self.phase = RotationPhase::Aborted {
                    during,
                    reason: e.to_string(),
                };
                error!(scale_set = %self.scale_set, phase = %during, error = %e, "rotation aborted");
                if e.needs_cleanup() {
                    warn!(
                        scale_set = %self.scale_set,
                        "some instances may still be protected from scale-in; run `scaleflip unprotect`"
                    );
                }
            }
        }
    }

    /// Read a fresh snapshot, resize by `factor`, and wait for the update.
    ///
    /// Returns `(previous, new)` capacity. When `floor` is set, refuses to
    /// shrink below it.
    async fn scale(
        &self,
        step: Step,
        factor: f64,
        floor: Option<u64>,
    ) -> RotationResult<(u64, u64)> {
        let snapshot = self
            .gateway
            .get_snapshot(&self.scale_set)
            .await
            .map_err(|source| RotationError::Read {
                phase: step,
                scale_set: self.scale_set.to_string(),
                source,
            })?;

        let target = scale_capacity(snapshot.capacity, factor);
        if let Some(original) = floor {
            if target < original {
                return Err(RotationError::CapacityBelowOriginal { original, target });
            }
        }

        info!(
            scale_set = %snapshot.name,
            from = snapshot.capacity,
            to = target,
            "scaling scale set"
        );

        let op = self
            .gateway
            .update_capacity(&self.scale_set, &snapshot, target)
            .await
            .map_err(|source| RotationError::UpdateSubmit {
                phase: step,
                target: format!("{} capacity={target}", snapshot.name),
                awaited: 0,
                source,
            })?;

        let op_target = op.target.to_string();
        self.gateway
            .await_operation(op)
            .await
            .map_err(|e| RotationError::Await {
                phase: step,
                failures: vec![OperationFailure {
                    target: op_target,
                    error: e,
                }],
            })?;

        info!(scale_set = %snapshot.name, capacity = target, "capacity applied");
        Ok((snapshot.capacity, target))
    }

    /// List instances matching `filter` and submit `policy` for each.
    ///
    /// Stops at the first listing or submit error but keeps what was
    /// already submitted so the caller can still await it.
    async fn submit_protection(
        &self,
        step: Step,
        filter: &str,
        policy: ProtectionPolicy,
    ) -> Submission {
        let mut ops = Vec::new();
        let mut instances = self.gateway.list_instances(&self.scale_set, filter);

        while let Some(item) = instances.next().await {
            let record = match item {
                Ok(record) => record,
                Err(source) => {
                    error!(phase = %step, error = %source, "instance listing failed");
                    return Submission {
                        ops,
                        rejected: Some(RotationError::List {
                            phase: step,
                            source,
                        }),
                    };
                }
            };

            match self
                .gateway
                .set_instance_protection(&self.scale_set, &record.instance_id, policy)
                .await
            {
                Ok(op) => {
                    debug!(
                        instance = %record.instance_id,
                        protect = policy.protect_from_scale_in,
                        "protection update submitted"
                    );
                    ops.push(op);
                }
                Err(source) => {
                    error!(instance = %record.instance_id, error = %source, "protection update rejected");
                    let awaited = ops.len();
                    return Submission {
                        ops,
                        rejected: Some(submit_error(step, &record.instance_id, awaited, source)),
                    };
                }
            }
        }

        info!(
            phase = %step,
            count = ops.len(),
            protect = policy.protect_from_scale_in,
            "protection updates submitted"
        );
        Submission {
            ops,
            rejected: None,
        }
    }

    /// Await everything a submit phase collected, then decide the outcome.
    async fn settle(&self, step: Step, submission: Submission) -> RotationResult<usize> {
        let Submission { ops, rejected } = submission;
        info!(phase = %step, pending = ops.len(), "awaiting operations");

        let report = await_all(&self.gateway, ops).await;
        info!(
            phase = %step,
            applied = report.applied.len(),
            failed = report.failures.len(),
            "operations settled"
        );

        if let Some(e) = rejected {
            return Err(e);
        }
        if report.failures.is_empty() {
            return Ok(report.applied.len());
        }
        if report.applied.is_empty() {
            Err(RotationError::Await {
                phase: step,
                failures: report.failures,
            })
        } else {
            Err(RotationError::PartialApplication {
                phase: step,
                applied: report.applied.len(),
                failures: report.failures,
            })
        }
    }

    fn elapsed_secs(&self) -> u64 {
        self.started_at
            .map(|t| t.elapsed().as_secs())
            .unwrap_or_default()
    }
}

fn submit_error(step: Step, instance_id: &str, awaited: usize, source: ProviderError) -> RotationError {
    RotationError::UpdateSubmit {
        phase: step,
        target: format!("instance {instance_id}"),
        awaited,
        source,
    }
}
