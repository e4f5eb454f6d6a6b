//! In-memory scale set — a simulated provider for tests and local runs.
//!
//! Updates are recorded at submit time and applied when awaited, the way a
//! real provider applies long-running operations. Scale-out creates new
//! instances on the latest model and marks every earlier instance stale.
//! Scale-in removes unprotected instances first, oldest first.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use tracing::debug;

use scaleflip_core::{
    AppliedResult, InstanceRecord, OperationTarget, PendingOperation, ProtectionPolicy,
    ScaleSetRef, ScaleSetSnapshot, Sku,
};

use crate::error::{ProviderError, ProviderResult};
use crate::gateway::{InstanceStream, ProviderGateway};

/// A simulated scale-set member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryInstance {
    pub instance_id: String,
    pub name: String,
    pub latest_model_applied: bool,
    pub protect_from_scale_in: bool,
    pub protect_from_scale_set_actions: bool,
}

#[derive(Debug, Clone)]
enum Effect {
    Capacity(u64),
    Protection {
        instance_id: String,
        policy: ProtectionPolicy,
    },
}

#[derive(Debug)]
struct Inner {
    name: String,
    sku: Sku,
    instances: Vec<MemoryInstance>,
    next_instance: u64,
    pending: HashMap<String, Effect>,
    next_op: u64,
    page_size: usize,
    delays: HashMap<String, Duration>,
    capacity_delay: Duration,
    failing: HashSet<String>,
    failing_unprotect: HashSet<String>,
    rejected: HashSet<String>,
    rejected_unprotect: HashSet<String>,
    fail_reads: bool,
    fail_capacity: bool,
    issued: u64,
    awaited: u64,
    list_calls: u64,
    completed: Vec<OperationTarget>,
    capacity_history: Vec<u64>,
}

impl Inner {
    fn add_instances(&mut self, count: u64) {
        for _ in 0..count {
            let id = self.next_instance;
            self.next_instance += 1;
            self.instances.push(MemoryInstance {
                instance_id: id.to_string(),
                name: format!("{}_{id}", self.name),
                latest_model_applied: true,
                protect_from_scale_in: false,
                protect_from_scale_set_actions: false,
            });
        }
    }

    fn resize(&mut self, capacity: u64) {
        let current = self.instances.len() as u64;
        if capacity > current {
            for inst in &mut self.instances {
                inst.latest_model_applied = false;
            }
            self.add_instances(capacity - current);
        } else if capacity < current {
            let mut excess = (current - capacity) as usize;
            // Unprotected first, then protected, oldest first within each.
            for protected in [false, true] {
                while excess > 0 {
                    let Some(pos) = self
                        .instances
                        .iter()
                        .position(|i| i.protect_from_scale_in == protected)
                    else {
                        break;
                    };
                    let removed = self.instances.remove(pos);
                    debug!(instance = %removed.instance_id, protected, "simulated scale-in removed instance");
                    excess -= 1;
                }
            }
        }
        self.capacity_history.push(capacity);
    }
}

/// Simulated scale set implementing [`ProviderGateway`].
#[derive(Debug)]
pub struct MemoryScaleSet {
    inner: Mutex<Inner>,
}

impl MemoryScaleSet {
    /// Create a scale set named `name` with `capacity` instances on the
    /// latest model and no protection.
    pub fn new(name: &str, capacity: u64) -> Self {
        let mut inner = Inner {
            name: name.to_string(),
            sku: Sku {
                name: Some("Standard_D2s_v3".to_string()),
                tier: Some("Standard".to_string()),
            },
            instances: Vec::new(),
            next_instance: 0,
            pending: HashMap::new(),
            next_op: 0,
            page_size: 50,
            delays: HashMap::new(),
            capacity_delay: Duration::ZERO,
            failing: HashSet::new(),
            failing_unprotect: HashSet::new(),
            rejected: HashSet::new(),
            rejected_unprotect: HashSet::new(),
            fail_reads: false,
            fail_capacity: false,
            issued: 0,
            awaited: 0,
            list_calls: 0,
            completed: Vec::new(),
            capacity_history: Vec::new(),
        };
        inner.add_instances(capacity);
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Number of records per listing page.
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.state().page_size = page_size.max(1);
        self
    }

    /// Delay completion of every operation on `instance_id`.
    pub fn delay_instance(&self, instance_id: &str, delay: Duration) {
        self.state().delays.insert(instance_id.to_string(), delay);
    }

    /// Delay completion of capacity updates.
    pub fn delay_capacity(&self, delay: Duration) {
        self.state().capacity_delay = delay;
    }

    /// Make operations on `instance_id` end in a failed state.
    pub fn fail_instance(&self, instance_id: &str) {
        self.state().failing.insert(instance_id.to_string());
    }

    /// Make only updates that clear protection on `instance_id` fail.
    pub fn fail_unprotect(&self, instance_id: &str) {
        self.state().failing_unprotect.insert(instance_id.to_string());
    }

    /// Reject protection requests for `instance_id` at submit time.
    pub fn reject_instance(&self, instance_id: &str) {
        self.state().rejected.insert(instance_id.to_string());
    }

    /// Reject only requests that clear protection on `instance_id`.
    pub fn reject_unprotect(&self, instance_id: &str) {
        self.state().rejected_unprotect.insert(instance_id.to_string());
    }

    /// Make snapshot reads fail.
    pub fn fail_reads(&self, fail: bool) {
        self.state().fail_reads = fail;
    }

    /// Make capacity updates end in a failed state.
    pub fn fail_capacity_updates(&self, fail: bool) {
        self.state().fail_capacity = fail;
    }

    pub fn capacity(&self) -> u64 {
        self.state().instances.len() as u64
    }

    pub fn instances(&self) -> Vec<MemoryInstance> {
        self.state().instances.clone()
    }

    pub fn protected_count(&self) -> usize {
        self.state()
            .instances
            .iter()
            .filter(|i| i.protect_from_scale_in)
            .count()
    }

    /// Operations accepted so far.
    pub fn issued_operations(&self) -> u64 {
        self.state().issued
    }

    /// Operations awaited to a terminal state so far.
    pub fn awaited_operations(&self) -> u64 {
        self.state().awaited
    }

    /// Operations accepted but never awaited.
    pub fn in_flight(&self) -> usize {
        self.state().pending.len()
    }

    /// Number of listing calls started.
    pub fn list_calls(&self) -> u64 {
        self.state().list_calls
    }

    /// Targets of awaited operations, in completion order.
    pub fn completion_order(&self) -> Vec<OperationTarget> {
        self.state().completed.clone()
    }

    /// Every capacity applied so far, in order.
    pub fn capacity_history(&self) -> Vec<u64> {
        self.state().capacity_history.clone()
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit(&self, target: OperationTarget, effect: Effect) -> PendingOperation {
        let mut inner = self.state();
        let token = format!("op-{}", inner.next_op);
        inner.next_op += 1;
        inner.issued += 1;
        inner.pending.insert(token.clone(), effect);
        PendingOperation::new(target, token)
    }
}

#[derive(Debug, Clone, Copy)]
enum ModelFilter {
    All,
    Latest(bool),
}

impl ModelFilter {
    fn parse(filter: &str) -> ProviderResult<Self> {
        let words: Vec<&str> = filter.split_whitespace().collect();
        match words.as_slice() {
            [] => Ok(Self::All),
            ["properties/latestModelApplied", "eq", "true"] => Ok(Self::Latest(true)),
            ["properties/latestModelApplied", "eq", "false"] => Ok(Self::Latest(false)),
            _ => Err(ProviderError::Decode(format!("unsupported filter: {filter}"))),
        }
    }

    fn matches(self, inst: &MemoryInstance) -> bool {
        match self {
            Self::All => true,
            Self::Latest(latest) => inst.latest_model_applied == latest,
        }
    }
}

#[async_trait]
impl ProviderGateway for MemoryScaleSet {
    async fn get_snapshot(&self, set: &ScaleSetRef) -> ProviderResult<ScaleSetSnapshot> {
        let inner = self.state();
        if inner.fail_reads {
            return Err(ProviderError::Api {
                status: 503,
                code: "ServiceUnavailable".to_string(),
                message: format!("cannot read {set}"),
            });
        }
        Ok(ScaleSetSnapshot {
            name: inner.name.clone(),
            sku: inner.sku.clone(),
            capacity: inner.instances.len() as u64,
        })
    }

    async fn update_capacity(
        &self,
        _set: &ScaleSetRef,
        snapshot: &ScaleSetSnapshot,
        capacity: u64,
    ) -> ProviderResult<PendingOperation> {
        let target = OperationTarget::Capacity {
            scale_set: snapshot.name.clone(),
            capacity,
        };
        Ok(self.submit(target, Effect::Capacity(capacity)))
    }

    fn list_instances<'a>(&'a self, _set: &'a ScaleSetRef, filter: &'a str) -> InstanceStream<'a> {
        let pages = stream::try_unfold(Some(0usize), move |cursor| async move {
            let Some(offset) = cursor else {
                return Ok::<_, ProviderError>(None);
            };
            let predicate = match ModelFilter::parse(filter) {
                Ok(predicate) => predicate,
                Err(e) => return Err(e),
            };

            let mut inner = self.state();
            if offset == 0 {
                inner.list_calls += 1;
            }
            let matching: Vec<InstanceRecord> = inner
                .instances
                .iter()
                .filter(|i| predicate.matches(i))
                .map(|i| InstanceRecord {
                    instance_id: i.instance_id.clone(),
                    name: Some(i.name.clone()),
                    latest_model_applied: i.latest_model_applied,
                })
                .collect();

            let end = (offset + inner.page_size).min(matching.len());
            let page = matching.get(offset..end).unwrap_or_default().to_vec();
            let next = (end < matching.len()).then_some(end);
            Ok(Some((page, next)))
        });

        pages
            .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    }

    async fn set_instance_protection(
        &self,
        _set: &ScaleSetRef,
        instance_id: &str,
        policy: ProtectionPolicy,
    ) -> ProviderResult<PendingOperation> {
        {
            let inner = self.state();
            let clearing = !policy.protect_from_scale_in;
            if inner.rejected.contains(instance_id)
                || (clearing && inner.rejected_unprotect.contains(instance_id))
            {
                return Err(ProviderError::Api {
                    status: 409,
                    code: "OperationNotAllowed".to_string(),
                    message: format!("instance {instance_id} rejected the update"),
                });
            }
            if !inner.instances.iter().any(|i| i.instance_id == instance_id) {
                return Err(ProviderError::NotFound(format!("instance {instance_id}")));
            }
        }

        let target = OperationTarget::Instance {
            instance_id: instance_id.to_string(),
        };
        let effect = Effect::Protection {
            instance_id: instance_id.to_string(),
            policy,
        };
        Ok(self.submit(target, effect))
    }

    async fn await_operation(&self, op: PendingOperation) -> ProviderResult<AppliedResult> {
        let (effect, delay) = {
            let inner = self.state();
            let effect = inner
                .pending
                .get(&op.token)
                .cloned()
                .ok_or_else(|| ProviderError::NotFound(format!("operation {}", op.token)))?;
            let delay = match &effect {
                Effect::Capacity(_) => inner.capacity_delay,
                Effect::Protection { instance_id, .. } => {
                    inner.delays.get(instance_id).copied().unwrap_or_default()
                }
            };
            (effect, delay)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.state();
        inner.pending.remove(&op.token);
        inner.awaited += 1;
        inner.completed.push(op.target.clone());

        let failed = |message: &str| ProviderError::OperationFailed {
            target: op.target.to_string(),
            status: "Failed".to_string(),
            message: message.to_string(),
        };

        match effect {
            Effect::Capacity(capacity) => {
                if inner.fail_capacity {
                    return Err(failed("capacity update failed"));
                }
                inner.resize(capacity);
                Ok(AppliedResult {
                    resource_name: inner.name.clone(),
                })
            }
            Effect::Protection {
                instance_id,
                policy,
            } => {
                let clearing = !policy.protect_from_scale_in;
                if inner.failing.contains(&instance_id)
                    || (clearing && inner.failing_unprotect.contains(&instance_id))
                {
                    return Err(failed("protection update failed"));
                }
                let inst = inner
                    .instances
                    .iter_mut()
                    .find(|i| i.instance_id == instance_id)
                    .ok_or_else(|| ProviderError::NotFound(format!("instance {instance_id}")))?;
                inst.protect_from_scale_in = policy.protect_from_scale_in;
                inst.protect_from_scale_set_actions = policy.protect_from_scale_set_actions;
                Ok(AppliedResult {
                    resource_name: inst.name.clone(),
                })
            }
        }
    }
}
