//! The provider capability interface.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use scaleflip_core::{
    AppliedResult, InstanceRecord, PendingOperation, ProtectionPolicy, ScaleSetRef,
    ScaleSetSnapshot,
};

use crate::error::ProviderResult;

/// Lazily paged instance listing. Finite; each call starts a fresh cursor.
pub type InstanceStream<'a> = BoxStream<'a, ProviderResult<InstanceRecord>>;

/// Operations the rotation needs from a compute provider.
///
/// Update calls return as soon as the provider accepts the request. The
/// returned [`PendingOperation`] must be handed to [`await_operation`],
/// which blocks until the provider reports a terminal state. There is no
/// built-in timeout; callers that want one wrap the future.
///
/// [`await_operation`]: ProviderGateway::await_operation
#[async_trait]
pub trait ProviderGateway: Send + Sync + 'static {
    /// Read the current SKU and capacity.
    async fn get_snapshot(&self, set: &ScaleSetRef) -> ProviderResult<ScaleSetSnapshot>;

    /// Request a new capacity, keeping the SKU from `snapshot`.
    async fn update_capacity(
        &self,
        set: &ScaleSetRef,
        snapshot: &ScaleSetSnapshot,
        capacity: u64,
    ) -> ProviderResult<PendingOperation>;

    /// List member instances matching `filter`; an empty filter lists all.
    fn list_instances<'a>(&'a self, set: &'a ScaleSetRef, filter: &'a str) -> InstanceStream<'a>;

    /// Request new protection flags on a single instance.
    async fn set_instance_protection(
        &self,
        set: &ScaleSetRef,
        instance_id: &str,
        policy: ProtectionPolicy,
    ) -> ProviderResult<PendingOperation>;

    /// Block until `op` reaches a terminal state.
    async fn await_operation(&self, op: PendingOperation) -> ProviderResult<AppliedResult>;
}
