//! Await barrier for per-instance operations.
//!
//! Every pending operation gets its own task. The barrier returns only once
//! all of them have reached a terminal state; a failure in one task never
//! cancels its siblings. Deciding what a failure means is left to the
//! controller.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::{Id, JoinSet};
use tracing::{error, info};

use scaleflip_core::{AppliedResult, PendingOperation};
use scaleflip_provider::{ProviderError, ProviderGateway};

use crate::error::OperationFailure;

/// Outcome of a fan-out await.
#[derive(Debug, Default)]
pub struct FanOutReport {
    pub applied: Vec<AppliedResult>,
    pub failures: Vec<OperationFailure>,
}

impl FanOutReport {
    /// Number of operations that reached a terminal state.
    pub fn settled(&self) -> usize {
        self.applied.len() + self.failures.len()
    }
}

/// Await every operation in `ops` concurrently and wait for all of them.
pub async fn await_all<G: ProviderGateway>(
    gateway: &Arc<G>,
    ops: Vec<PendingOperation>,
) -> FanOutReport {
    let mut tasks = JoinSet::new();
    let mut targets: HashMap<Id, String> = HashMap::with_capacity(ops.len());
    for op in ops {
        let gateway = Arc::clone(gateway);
        let target = op.target.to_string();
        let handle = tasks.spawn(async move { gateway.await_operation(op).await });
        targets.insert(handle.id(), target);
    }

    let mut report = FanOutReport::default();
    while let Some(joined) = tasks.join_next_with_id().await {
        match joined {
            Ok((id, Ok(applied))) => {
                let target = take_target(&mut targets, id);
                info!(operation = %target, resource = %applied.resource_name, "modified instance");
                report.applied.push(applied);
            }
            Ok((id, Err(e))) => {
                let target = take_target(&mut targets, id);
                error!(operation = %target, error = %e, "operation failed");
                report.failures.push(OperationFailure { target, error: e });
            }
            Err(e) => {
                // The operation may still be running on the provider side;
                // its outcome can no longer be observed.
                let target = take_target(&mut targets, e.id());
                error!(operation = %target, error = %e, "await task did not complete");
                report.failures.push(OperationFailure {
                    target: target.clone(),
                    error: ProviderError::OperationFailed {
                        target,
                        status: "Panicked".to_string(),
                        message: e.to_string(),
                    },
                });
            }
        }
    }

    report
}

fn take_target(targets: &mut HashMap<Id, String>, id: Id) -> String {
    targets
        .remove(&id)
        .unwrap_or_else(|| "unknown operation".to_string())
}
