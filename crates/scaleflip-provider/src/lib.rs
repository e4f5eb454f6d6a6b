//! scaleflip-provider — the capability interface the rotation drives.
//!
//! The orchestrator only ever sees [`ProviderGateway`]. Two implementations
//! live here:
//!
//! - **`azure`** — Azure Resource Manager REST adapter with CLI credentials
//! - **`memory`** — simulated scale set with injectable latency and failures

pub mod azure;
pub mod error;
pub mod gateway;
pub mod memory;

pub use azure::{AzureCliCredential, AzureGateway, TokenSource};
pub use error::{ProviderError, ProviderResult};
pub use gateway::{InstanceStream, ProviderGateway};
pub use memory::{MemoryInstance, MemoryScaleSet};
