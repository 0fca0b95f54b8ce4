//! Per-backend entry points: `pools.mysql("orders")`, `pools.redis("cache")`.

use std::sync::Arc;

use poolkeeper_core::{ConfigDir, PoolResult, SettingsSource};

use crate::mysql::MysqlPoolFactory;
use crate::pool::ConnectionPool;
use crate::redis::RedisPoolFactory;
use crate::registry::PoolRegistry;

/// One registry per backend kind, sharing nothing but the process.
#[derive(Debug)]
pub struct Pools {
    mysql: PoolRegistry<MysqlPoolFactory>,
    redis: PoolRegistry<RedisPoolFactory>,
}

impl Pools {
    pub fn new(mysql: Arc<SettingsSource>, redis: Arc<SettingsSource>) -> Self {
        Self {
            mysql: PoolRegistry::new(mysql, MysqlPoolFactory),
            redis: PoolRegistry::new(redis, RedisPoolFactory),
        }
    }

    /// Load `mysql.toml` and `redis.toml` from `dir`.
    pub fn from_config_dir(dir: &ConfigDir) -> PoolResult<Self> {
        let mysql = dir.source("mysql")?;
        let redis = dir.source("redis")?;
        tracing::info!(
            config_dir = %dir.root().display(),
            mysql_env = mysql.default_env(),
            redis_env = redis.default_env(),
            "pool registries configured"
        );
        Ok(Self::new(Arc::new(mysql), Arc::new(redis)))
    }

    /// Shared MySQL pool for `instance` (`name` or `name.env`).
    pub fn mysql(&self, instance: &str) -> PoolResult<Arc<ConnectionPool>> {
        self.mysql.get(instance)
    }

    /// Shared Redis pool for `instance` (`name` or `name.env`).
    pub fn redis(&self, instance: &str) -> PoolResult<Arc<ConnectionPool>> {
        self.redis.get(instance)
    }

    pub fn mysql_registry(&self) -> &PoolRegistry<MysqlPoolFactory> {
        &self.mysql
    }

    pub fn redis_registry(&self) -> &PoolRegistry<RedisPoolFactory> {
        &self.redis
    }
}
