//! Instance keys: `name` or `name.environment`.

use std::fmt;

/// Separator between the instance name and the environment suffix.
pub const ENV_SEPARATOR: char = '.';

/// Identity of one backend instance in one environment.
///
/// Always fully resolved: when the raw key carries no environment suffix
/// the default environment is substituted at parse time, so `"orders"`
/// (default env `"prod"`) and `"orders.prod"` compare and hash equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    name: String,
    env: String,
}

impl InstanceKey {
    /// Build a key from an already-split name and environment.
    pub fn new(name: impl Into<String>, env: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            env: env.into(),
        }
    }

    /// Split `raw` on its first separator; a missing or empty suffix
    /// becomes `default_env`.
    ///
    /// ```
    /// use poolkeeper_core::InstanceKey;
    ///
    /// let key = InstanceKey::parse("orders", "prod");
    /// assert_eq!(key, InstanceKey::parse("orders.prod", "staging"));
    /// assert_eq!(key.to_string(), "orders.prod");
    /// ```
    pub fn parse(raw: &str, default_env: &str) -> Self {
        match raw.split_once(ENV_SEPARATOR) {
            Some((name, env)) if !env.is_empty() => Self::new(name, env),
            Some((name, _)) => Self::new(name, default_env),
            None => Self::new(raw, default_env),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn env(&self) -> &str {
        &self.env
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.name, ENV_SEPARATOR, self.env)
    }
}
