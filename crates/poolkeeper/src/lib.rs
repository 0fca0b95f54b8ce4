//! Shared, lazily-built connection pools keyed by instance name.
//!
//! Callers ask for a pool by logical instance (`"orders"` or
//! `"orders.staging"`); the first request resolves settings, runs the
//! backend factory's liveness check, and caches the pool. Every later request
//! for the same `(name, env)` gets the same `Arc`.
//!
//! - **registry**: double-checked cache guaranteeing one build per key
//! - **factory**: the per-backend build capability
//! - **pool**: the pool handle with bounded checkout
//! - **mysql** / **redis**: backend settings, connectors and factories
//! - **tcp**: timeout-bounded TCP transport
//! - **pools**: the per-backend caller facade

pub mod factory;
pub mod mysql;
pub mod pool;
pub mod pools;
pub mod redis;
pub mod registry;
pub mod tcp;

pub use factory::PoolFactory;
pub use pool::{
    ConnectionBackend, ConnectionPool, Connector, PoolLimits, PoolStats, PooledConnection,
};
pub use pools::Pools;
pub use registry::PoolRegistry;

pub use poolkeeper_core::{
    BackendSettings, ConfigDir, InstanceKey, PoolError, PoolResult, SettingsResolver,
    SettingsSource,
};
