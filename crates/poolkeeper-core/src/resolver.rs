//! Settings resolution: instance key to a fully-defaulted settings record.
//!
//! Required fields fail with [`PoolError::ConfigInvalid`] when missing or
//! mistyped. Optional tunables silently fall back to their defaults when
//! missing *or* mistyped; a wrong-typed `maxIdle` behaves exactly like an
//! absent one.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{PoolError, PoolResult};
use crate::key::InstanceKey;
use crate::source::SettingsSource;

/// A backend-specific settings record built from one environment section.
pub trait BackendSettings: Sized + Send + Sync + 'static {
    /// Backend name used in logs (`"mysql"`, `"redis"`).
    const KIND: &'static str;

    fn from_section(section: &Section<'_>) -> PoolResult<Self>;
}

/// One `source[name][env]` table, with typed field accessors.
#[derive(Clone, Copy, Debug)]
pub struct Section<'a> {
    key: &'a InstanceKey,
    table: &'a toml::Table,
}

impl<'a> Section<'a> {
    pub fn new(key: &'a InstanceKey, table: &'a toml::Table) -> Self {
        Self { key, table }
    }

    pub fn key(&self) -> &InstanceKey {
        self.key
    }

    pub fn required_str(&self, field: &str) -> PoolResult<String> {
        match self.table.get(field) {
            Some(toml::Value::String(s)) => Ok(s.clone()),
            _ => Err(PoolError::invalid(self.key, field)),
        }
    }

    /// Ports may be written as integers or as numeric strings.
    pub fn required_port(&self, field: &str) -> PoolResult<u16> {
        let port = match self.table.get(field) {
            Some(toml::Value::Integer(n)) => u16::try_from(*n).ok(),
            Some(toml::Value::String(s)) => s.trim().parse::<u16>().ok(),
            _ => None,
        };
        port.filter(|p| *p != 0)
            .ok_or_else(|| PoolError::invalid(self.key, field))
    }

    pub fn optional_str(&self, field: &str, default: &str) -> String {
        self.table
            .get(field)
            .and_then(toml::Value::as_str)
            .unwrap_or(default)
            .to_string()
    }

    /// Non-negative integer, or `default` when absent, mistyped, or negative.
    pub fn optional_u64(&self, field: &str, default: u64) -> u64 {
        self.table
            .get(field)
            .and_then(toml::Value::as_integer)
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or(default)
    }

    pub fn optional_usize(&self, field: &str, default: usize) -> usize {
        self.table
            .get(field)
            .and_then(toml::Value::as_integer)
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(default)
    }

    /// Whole seconds.
    pub fn optional_secs(&self, field: &str, default: Duration) -> Duration {
        self.table
            .get(field)
            .and_then(toml::Value::as_integer)
            .and_then(|n| u64::try_from(n).ok())
            .map(Duration::from_secs)
            .unwrap_or(default)
    }
}

/// Turns instance keys into settings records. Holds no cache; every call
/// re-reads the in-memory tree.
#[derive(Clone, Debug)]
pub struct SettingsResolver {
    source: Arc<SettingsSource>,
}

impl SettingsResolver {
    pub fn new(source: Arc<SettingsSource>) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &SettingsSource {
        &self.source
    }

    /// Canonical key for `raw`, substituting the source's default environment.
    pub fn instance_key(&self, raw: &str) -> InstanceKey {
        InstanceKey::parse(raw, self.source.default_env())
    }

    pub fn resolve<S: BackendSettings>(&self, key: &InstanceKey) -> PoolResult<S> {
        let table = self
            .source
            .section(key.name(), key.env())
            .ok_or_else(|| PoolError::not_found(key))?;
        S::from_section(&Section::new(key, table))
    }

    pub fn resolve_str<S: BackendSettings>(&self, raw: &str) -> PoolResult<S> {
        self.resolve(&self.instance_key(raw))
    }
}
