//! poolkeeper-core: instance keys, settings sources, and settings resolution.
//!
//! - **key**: `name` / `name.environment` identities with default-env substitution
//! - **source**: the parsed configuration tree and the on-disk `config/` loader
//! - **resolver**: typed, defaulted settings records per backend kind
//! - **error**: the error taxonomy shared with the pool registry

pub mod error;
pub mod key;
pub mod resolver;
pub mod source;

pub use error::{PoolError, PoolResult};
pub use key::InstanceKey;
pub use resolver::{BackendSettings, Section, SettingsResolver};
pub use source::{AppConfig, AppSection, ConfigDir, SettingsSource};
