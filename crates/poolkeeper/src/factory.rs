//! Pool factory capability: one implementation per backend kind.

use std::sync::Arc;

use poolkeeper_core::{BackendSettings, InstanceKey, PoolResult};

/// Turns resolved settings into a live pool handle.
///
/// `build` performs one bounded liveness check and reports failure instead
/// of retrying. Implementations hold no mutable state shared between calls,
/// so unrelated instances may be built concurrently.
pub trait PoolFactory: Send + Sync {
    type Settings: BackendSettings;
    type Pool: Send + Sync + 'static;

    fn build(&self, key: &InstanceKey, settings: &Self::Settings) -> PoolResult<Self::Pool>;
}

impl<F: PoolFactory> PoolFactory for Arc<F> {
    type Settings = F::Settings;
    type Pool = F::Pool;

    fn build(&self, key: &InstanceKey, settings: &Self::Settings) -> PoolResult<Self::Pool> {
        (**self).build(key, settings)
    }
}
