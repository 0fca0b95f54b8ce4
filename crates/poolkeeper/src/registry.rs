//! Pool registry: at most one pool per instance key.
//!
//! # Architecture
//!
//! ```text
//! get("orders")
//!   → canonical key orders.<default env>
//!   → read lock: pool cached → return it
//!   → build lock, re-check cache (another caller may have just built it)
//!     → an attempt for this key failed while we were queued → that error
//!     → resolve settings → factory.build() → store → return
//!     → any failure → nothing stored, error returned, next caller retries
//! ```
//!
//! Callers queued behind a failing build share its error instead of each
//! repeating the attempt. A caller arriving after the failure builds afresh.
//!
//! One build lock serializes every slow-path build across all keys. This
//! limits throughput of cold starts for many distinct instances, not
//! correctness; hot-path reads only take the shared read lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use poolkeeper_core::{
    BackendSettings, InstanceKey, PoolError, PoolResult, SettingsResolver, SettingsSource,
};

use crate::factory::PoolFactory;

/// Lazily-populated cache of pool handles for one backend kind.
pub struct PoolRegistry<F: PoolFactory> {
    resolver: SettingsResolver,
    factory: F,
    pools: RwLock<HashMap<InstanceKey, Arc<F::Pool>>>,
    /// Guards the slow path; holds the latest failed attempt per key.
    build_lock: Mutex<HashMap<InstanceKey, FailedBuild>>,
    /// Completed build attempts, successful or not.
    attempts: AtomicU64,
}

struct FailedBuild {
    /// Value of `attempts` once this attempt completed.
    attempt: u64,
    error: PoolError,
}

impl<F: PoolFactory> PoolRegistry<F> {
    pub fn new(source: Arc<SettingsSource>, factory: F) -> Self {
        Self {
            resolver: SettingsResolver::new(source),
            factory,
            pools: RwLock::new(HashMap::new()),
            build_lock: Mutex::new(HashMap::new()),
            attempts: AtomicU64::new(0),
        }
    }

    pub fn resolver(&self) -> &SettingsResolver {
        &self.resolver
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Return the pool for `key` (`name` or `name.env`), building it on first use.
    pub fn get(&self, key: &str) -> PoolResult<Arc<F::Pool>> {
        let key = self.resolver.instance_key(key);

        if let Some(pool) = self.cached_key(&key) {
            tracing::trace!(instance = %key, "pool cache hit");
            return Ok(pool);
        }

        let arrived = self.attempts.load(Ordering::SeqCst);
        let mut failed = self.build_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = self.cached_key(&key) {
            tracing::debug!(instance = %key, "pool built by concurrent caller");
            return Ok(pool);
        }
        if let Some(prior) = failed.get(&key).filter(|f| f.attempt > arrived) {
            tracing::debug!(
                instance = %key,
                error = %prior.error,
                "sharing build failure with queued caller"
            );
            return Err(prior.error.clone());
        }

        let kind = <F::Settings as BackendSettings>::KIND;
        tracing::debug!(instance = %key, backend = kind, "building pool");
        let built = self
            .resolver
            .resolve::<F::Settings>(&key)
            .and_then(|settings| self.factory.build(&key, &settings));
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        let pool = match built {
            Ok(pool) => {
                failed.remove(&key);
                Arc::new(pool)
            }
            Err(error) => {
                tracing::warn!(
                    instance = %key,
                    backend = kind,
                    error = %error,
                    "pool build failed"
                );
                failed.insert(
                    key,
                    FailedBuild {
                        attempt,
                        error: error.clone(),
                    },
                );
                return Err(error);
            }
        };

        self.pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), Arc::clone(&pool));
        tracing::info!(instance = %key, backend = kind, "pool ready");
        Ok(pool)
    }

    /// The cached pool for `key`, without building.
    pub fn cached(&self, key: &str) -> Option<Arc<F::Pool>> {
        self.cached_key(&self.resolver.instance_key(key))
    }

    fn cached_key(&self, key: &InstanceKey) -> Option<Arc<F::Pool>> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.pools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys of every pool built so far, sorted.
    pub fn keys(&self) -> Vec<InstanceKey> {
        let mut keys: Vec<_> = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

impl<F: PoolFactory> std::fmt::Debug for PoolRegistry<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("backend", &<F::Settings as BackendSettings>::KIND)
            .field("pools", &self.keys())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use poolkeeper_core::Section;

    use crate::redis::RedisSettings;

    // ── Mock settings and factory ────────────────────────────────────

    #[derive(Debug, Clone, PartialEq)]
    struct StubSettings {
        host: String,
    }

    impl BackendSettings for StubSettings {
        const KIND: &'static str = "stub";

        fn from_section(section: &Section<'_>) -> PoolResult<Self> {
            Ok(Self {
                host: section.required_str("host")?,
            })
        }
    }

    #[derive(Debug)]
    struct StubPool {
        key: InstanceKey,
    }

    #[derive(Default)]
    struct CountingFactory {
        builds: AtomicUsize,
        should_fail: AtomicBool,
        delay: Duration,
    }

    impl CountingFactory {
        fn slow() -> Self {
            Self {
                delay: Duration::from_millis(20),
                ..Self::default()
            }
        }

        /// Slow enough that every concurrent caller queues behind the first attempt.
        fn failing() -> Self {
            Self {
                should_fail: AtomicBool::new(true),
                delay: Duration::from_millis(200),
                ..Self::default()
            }
        }

        fn builds(&self) -> usize {
            self.builds.load(Ordering::SeqCst)
        }
    }

    impl PoolFactory for CountingFactory {
        type Settings = StubSettings;
        type Pool = StubPool;

        fn build(&self, key: &InstanceKey, settings: &StubSettings) -> PoolResult<StubPool> {
            assert!(!settings.host.is_empty());
            self.builds.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if self.should_fail.load(Ordering::SeqCst) {
                return Err(PoolError::unreachable("connection refused"));
            }
            Ok(StubPool { key: key.clone() })
        }
    }

    const SOURCE: &str = r#"
env = "prod"

[x.prod]
host = "x.internal"

[y.prod]
host = "y.internal"

[orders.prod]
host = "orders.internal"

[orders.staging]
host = "orders-staging.internal"

[broken.prod]
port = 1
"#;

    fn source() -> Arc<SettingsSource> {
        Arc::new(SettingsSource::from_toml_str(SOURCE).unwrap())
    }

    fn registry(
        factory: CountingFactory,
    ) -> (PoolRegistry<Arc<CountingFactory>>, Arc<CountingFactory>) {
        let factory = Arc::new(factory);
        (PoolRegistry::new(source(), Arc::clone(&factory)), factory)
    }

    // ── Concurrent first access ─────────────────────────────────────

    #[test]
    fn concurrent_first_access_builds_once() {
        let (reg, factory) = registry(CountingFactory::slow());
        let callers = 100;
        let barrier = Barrier::new(callers);

        let pools: Vec<Arc<StubPool>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..callers)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        reg.get("x").unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(factory.builds(), 1);
        assert!(pools.iter().all(|p| Arc::ptr_eq(p, &pools[0])));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn concurrent_access_to_distinct_keys_builds_each_once() {
        let (reg, factory) = registry(CountingFactory::slow());
        let barrier = Barrier::new(40);

        std::thread::scope(|s| {
            for i in 0..40 {
                let barrier = &barrier;
                let reg = &reg;
                s.spawn(move || {
                    barrier.wait();
                    let key = if i % 2 == 0 { "x" } else { "y" };
                    reg.get(key).unwrap();
                });
            }
        });

        assert_eq!(factory.builds(), 2);
        assert_eq!(
            reg.keys(),
            vec![InstanceKey::new("x", "prod"), InstanceKey::new("y", "prod")]
        );
    }

    // ── Cache behaviour ─────────────────────────────────────────────

    #[test]
    fn cache_hit_returns_identical_handle() {
        let (reg, factory) = registry(CountingFactory::default());
        let first = reg.get("x").unwrap();
        let second = reg.get("x").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.builds(), 1);
    }

    #[test]
    fn default_env_and_explicit_env_share_an_entry() {
        let (reg, factory) = registry(CountingFactory::default());
        let implicit = reg.get("orders").unwrap();
        let explicit = reg.get("orders.prod").unwrap();

        assert!(Arc::ptr_eq(&implicit, &explicit));
        assert_eq!(factory.builds(), 1);
        assert_eq!(implicit.key, InstanceKey::new("orders", "prod"));
    }

    #[test]
    fn other_env_is_a_separate_entry() {
        let (reg, factory) = registry(CountingFactory::default());
        let prod = reg.get("orders").unwrap();
        let staging = reg.get("orders.staging").unwrap();

        assert!(!Arc::ptr_eq(&prod, &staging));
        assert_eq!(factory.builds(), 2);
    }

    #[test]
    fn cached_does_not_build() {
        let (reg, factory) = registry(CountingFactory::default());
        assert!(reg.cached("x").is_none());
        assert!(reg.is_empty());
        reg.get("x.prod").unwrap();
        assert!(reg.cached("x").is_some());
        assert_eq!(factory.builds(), 1);
    }

    // ── Failures ────────────────────────────────────────────────────

    #[test]
    fn failed_build_is_not_cached_and_can_be_retried() {
        let (reg, factory) = registry(CountingFactory::default());
        factory.should_fail.store(true, Ordering::SeqCst);

        let err = reg.get("y").unwrap_err();
        assert!(matches!(err, PoolError::BackendUnreachable(_)));
        assert!(reg.cached("y").is_none());

        factory.should_fail.store(false, Ordering::SeqCst);
        let pool = reg.get("y").unwrap();
        assert_eq!(factory.builds(), 2);

        let again = reg.get("y").unwrap();
        assert!(Arc::ptr_eq(&pool, &again));
        assert_eq!(factory.builds(), 2);
    }

    #[test]
    fn concurrent_callers_share_one_failed_attempt() {
        let (reg, factory) = registry(CountingFactory::failing());
        let callers = 100;
        let barrier = Barrier::new(callers);

        let errors: Vec<PoolError> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..callers)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        reg.get("y").unwrap_err()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(factory.builds(), 1);
        assert!(errors.iter().all(|e| *e == errors[0]));
        assert!(matches!(errors[0], PoolError::BackendUnreachable(_)));
        assert!(reg.is_empty());

        // A caller arriving after the failure makes its own attempt.
        factory.should_fail.store(false, Ordering::SeqCst);
        assert!(reg.get("y").is_ok());
        assert_eq!(factory.builds(), 2);
    }

    #[test]
    fn failure_for_one_key_is_not_shared_with_another() {
        let (reg, factory) = registry(CountingFactory::default());
        factory.should_fail.store(true, Ordering::SeqCst);
        assert!(reg.get("x").is_err());

        factory.should_fail.store(false, Ordering::SeqCst);
        assert!(reg.get("y").is_ok());
        assert!(reg.get("x").is_ok());
        assert_eq!(factory.builds(), 3);
    }

    #[test]
    fn unknown_instance_is_config_not_found() {
        let (reg, factory) = registry(CountingFactory::default());
        let err = reg.get("unknown").unwrap_err();
        assert_eq!(err, PoolError::not_found("unknown.prod"));
        assert_eq!(factory.builds(), 0);
    }

    #[test]
    fn invalid_settings_never_reach_the_factory() {
        let (reg, factory) = registry(CountingFactory::default());
        let err = reg.get("broken").unwrap_err();
        assert_eq!(err, PoolError::invalid("broken.prod", "host"));
        assert_eq!(factory.builds(), 0);
        assert!(reg.is_empty());
    }

    #[test]
    fn panicking_build_does_not_wedge_the_registry() {
        struct PanicOnce(AtomicBool);

        impl PoolFactory for PanicOnce {
            type Settings = StubSettings;
            type Pool = StubPool;

            fn build(&self, key: &InstanceKey, _: &StubSettings) -> PoolResult<StubPool> {
                if !self.0.swap(true, Ordering::SeqCst) {
                    panic!("driver bug");
                }
                Ok(StubPool { key: key.clone() })
            }
        }

        let reg = PoolRegistry::new(source(), PanicOnce(AtomicBool::new(false)));
        let reg = &reg;
        let first = std::thread::scope(|s| s.spawn(move || reg.get("x").map(|_| ())).join());
        assert!(first.is_err());
        assert!(reg.get("x").is_ok());
    }

    // ── Settings handed to the factory ──────────────────────────────

    #[derive(Default)]
    struct RecordingFactory {
        seen: Mutex<Vec<RedisSettings>>,
    }

    impl PoolFactory for RecordingFactory {
        type Settings = RedisSettings;
        type Pool = ();

        fn build(&self, _key: &InstanceKey, settings: &RedisSettings) -> PoolResult<()> {
            self.seen.lock().unwrap().push(settings.clone());
            Ok(())
        }
    }

    #[test]
    fn omitted_tunable_reaches_factory_as_default() {
        let source = SettingsSource::from_toml_str(
            "env = \"prod\"\n[cache.prod]\nhost = \"127.0.0.1\"\nport = 6379\nmaxOpen = 50\n",
        )
        .unwrap();
        let reg = PoolRegistry::new(Arc::new(source), RecordingFactory::default());
        reg.get("cache").unwrap();

        let seen = reg.factory().seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].max_idle, RedisSettings::DEFAULT_MAX_IDLE);
        assert_eq!(seen[0].max_open, 50);
    }
}
