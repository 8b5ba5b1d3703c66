//! Exclusive pooling of calculation engine instances.
//!
//! Engine instances are expensive to build and unsafe to share, so each
//! (tenant, product, environment, release, app type) tuple gets its own
//! bounded [`EnginePool`]. Acquiring returns an [`EngineLease`], an
//! index-addressed handle into the pool's slot arena that is the only way
//! to reach the instance. The lease going out of scope returns the
//! instance on every path, so a failed calculation can never strand one.
//!
//! Pools live in a [`PoolRegistry`], an explicit keyed map owned by the
//! long-lived orchestrator: create-on-miss from the release's workbook
//! payload, host-driven idle eviction, explicit removal when a release is
//! superseded. Pools for different keys share no instances or locks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::engine::{CalculationEngine, EngineFactory};
use crate::error::{ConfigError, ConfigResult, PoolError, PoolResult};
use crate::logs::{log_info_ctx, log_warning_ctx};
use crate::model::{AppType, Environment, ReleaseContext};

// =============================================================================
// Pool Key
// =============================================================================

/// Identity of one pool: a release context plus the app type.
///
/// Instances are never shared across keys; a quote workbook and a claim
/// workbook of the same release are distinct pools.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolKey {
    pub tenant_id: String,
    pub product_id: String,
    pub environment: Environment,
    pub release_id: String,
    pub app_type: AppType,
}

impl PoolKey {
    pub fn new(ctx: &ReleaseContext, app_type: AppType) -> Self {
        Self {
            tenant_id: ctx.tenant_id.clone(),
            product_id: ctx.product_id.clone(),
            environment: ctx.environment,
            release_id: ctx.release_id.clone(),
            app_type,
        }
    }
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.tenant_id, self.product_id, self.environment, self.release_id, self.app_type
        )
    }
}

// =============================================================================
// Pool Configuration
// =============================================================================

/// Sizing and wait policy for every pool in a registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum instances per pool.
    pub capacity: usize,

    /// How long an acquire waits for a free instance before failing with
    /// [`PoolError::Exhausted`]. Exhaustion is not retried internally.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 4,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Defaults overridden by `RATING_POOL_CAPACITY` and
    /// `RATING_POOL_ACQUIRE_TIMEOUT_MS` where set.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        if let Some(capacity) = std::env::var("RATING_POOL_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|c| *c > 0)
        {
            config.capacity = capacity;
        }
        if let Some(ms) = std::env::var("RATING_POOL_ACQUIRE_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.acquire_timeout = Duration::from_millis(ms);
        }
        config
    }
}

// =============================================================================
// Engine Pool
// =============================================================================

/// One slot of the instance arena.
enum Slot {
    /// A built instance waiting to be checked out.
    Idle(Box<dyn CalculationEngine>),
    /// Checked out, or reserved while a new instance is being built.
    CheckedOut,
    /// A reserved build failed; the slot can be rebuilt into.
    Vacant,
}

/// Arena shared between the pool and its outstanding leases.
struct SlotArena {
    slots: Mutex<Vec<Slot>>,
}

/// A bounded pool of engine instances for one [`PoolKey`].
///
/// Instances are built lazily on first demand and reused indefinitely;
/// their cell state is never assumed clean, callers rewrite every range.
pub struct EnginePool {
    key: PoolKey,
    config: PoolConfig,
    workbook: Vec<u8>,
    factory: Arc<dyn EngineFactory>,
    semaphore: Arc<Semaphore>,
    arena: Arc<SlotArena>,
    created_at: DateTime<Utc>,
    last_used: Mutex<DateTime<Utc>>,
    total_acquires: AtomicU64,
    total_timeouts: AtomicU64,
}

impl std::fmt::Debug for EnginePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnginePool")
            .field("key", &self.key)
            .field("config", &self.config)
            .field("workbook_len", &self.workbook.len())
            .field("created_at", &self.created_at)
            .field("total_acquires", &self.total_acquires.load(Ordering::Relaxed))
            .field("total_timeouts", &self.total_timeouts.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl EnginePool {
    /// A new, empty pool seeded with the release's workbook payload.
    pub fn new(
        key: PoolKey,
        workbook: Vec<u8>,
        factory: Arc<dyn EngineFactory>,
        config: PoolConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            semaphore: Arc::new(Semaphore::new(config.capacity)),
            arena: Arc::new(SlotArena {
                slots: Mutex::new(Vec::with_capacity(config.capacity)),
            }),
            key,
            config,
            workbook,
            factory,
            created_at: now,
            last_used: Mutex::new(now),
            total_acquires: AtomicU64::new(0),
            total_timeouts: AtomicU64::new(0),
        }
    }

    /// Check out an instance exclusively.
    ///
    /// Returns a free instance when one exists, builds a new one while
    /// under capacity, and otherwise waits up to the configured timeout
    /// for a release. The returned lease is the only handle to the
    /// instance until it is given back.
    pub async fn acquire(&self) -> PoolResult<EngineLease> {
        let permit = match tokio::time::timeout(
            self.config.acquire_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(PoolError::Closed {
                    key: self.key.to_string(),
                })
            }
            Err(_) => {
                self.total_timeouts.fetch_add(1, Ordering::Relaxed);
                log_warning_ctx(
                    format!(
                        "no engine instance freed within {} ms",
                        self.config.acquire_timeout.as_millis()
                    ),
                    self.key.to_string(),
                );
                return Err(PoolError::Exhausted {
                    key: self.key.to_string(),
                    waited_ms: self.config.acquire_timeout.as_millis() as u64,
                });
            }
        };

        self.total_acquires.fetch_add(1, Ordering::Relaxed);
        *self.last_used.lock().expect("pool clock poisoned") = Utc::now();

        // Prefer an idle instance; otherwise reserve a slot to build into.
        // The permit caps outstanding slots at the configured capacity.
        let reserved = {
            let mut slots = self.arena.slots.lock().expect("pool arena poisoned");
            let idle = slots.iter().position(|s| matches!(s, Slot::Idle(_)));
            if let Some(index) = idle {
                if let Slot::Idle(engine) = std::mem::replace(&mut slots[index], Slot::CheckedOut) {
                    return Ok(self.lease(index, engine, permit));
                }
            }
            if let Some(index) = slots.iter().position(|s| matches!(s, Slot::Vacant)) {
                slots[index] = Slot::CheckedOut;
                index
            } else {
                slots.push(Slot::CheckedOut);
                slots.len() - 1
            }
        };

        // Construction is the expensive part; keep it outside the lock.
        match self.factory.build(&self.workbook) {
            Ok(engine) => {
                log_info_ctx(
                    format!("built engine instance #{reserved}"),
                    self.key.to_string(),
                );
                Ok(self.lease(reserved, engine, permit))
            }
            Err(err) => {
                self.arena.slots.lock().expect("pool arena poisoned")[reserved] = Slot::Vacant;
                Err(PoolError::Build(err))
            }
        }
    }

    /// Return a lease to the pool.
    ///
    /// The explicit counterpart to [`EnginePool::acquire`]; dropping the
    /// lease has the same effect, which is what guarantees release on
    /// error paths.
    pub fn release(&self, lease: EngineLease) {
        drop(lease);
    }

    fn lease(&self, slot: usize, engine: Box<dyn CalculationEngine>, permit: OwnedSemaphorePermit) -> EngineLease {
        EngineLease {
            slot,
            engine: Some(engine),
            arena: Arc::clone(&self.arena),
            _permit: permit,
        }
    }

    /// Whether every instance is currently checked in.
    pub fn is_fully_idle(&self) -> bool {
        self.semaphore.available_permits() == self.config.capacity
    }

    fn last_used(&self) -> DateTime<Utc> {
        *self.last_used.lock().expect("pool clock poisoned")
    }

    /// Point-in-time counters for operators.
    pub fn stats(&self) -> PoolStats {
        let instances = {
            let slots = self.arena.slots.lock().expect("pool arena poisoned");
            slots
                .iter()
                .filter(|s| !matches!(s, Slot::Vacant))
                .count()
        };
        PoolStats {
            key: self.key.to_string(),
            capacity: self.config.capacity,
            available: self.semaphore.available_permits(),
            instances,
            created_at: self.created_at.to_rfc3339(),
            last_used: self.last_used().to_rfc3339(),
            total_acquires: self.total_acquires.load(Ordering::Relaxed),
            total_timeouts: self.total_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Exclusive handle to one checked-out instance.
///
/// Derefs to the engine. Going out of scope returns the instance to its
/// arena slot and frees the pool capacity, exactly once, on every path.
pub struct EngineLease {
    slot: usize,
    engine: Option<Box<dyn CalculationEngine>>,
    arena: Arc<SlotArena>,
    _permit: OwnedSemaphorePermit,
}

impl EngineLease {
    /// Arena index of the checked-out instance.
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl std::fmt::Debug for EngineLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineLease")
            .field("slot", &self.slot)
            .field("engine_present", &self.engine.is_some())
            .finish_non_exhaustive()
    }
}

impl std::ops::Deref for EngineLease {
    type Target = dyn CalculationEngine;

    fn deref(&self) -> &Self::Target {
        self.engine.as_deref().expect("engine held until release")
    }
}

impl std::ops::DerefMut for EngineLease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.engine.as_deref_mut().expect("engine held until release")
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            if let Ok(mut slots) = self.arena.slots.lock() {
                slots[self.slot] = Slot::Idle(engine);
            }
        }
        // The permit drops with the lease, freeing the capacity.
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub key: String,
    pub capacity: usize,
    pub available: usize,
    pub instances: usize,
    pub created_at: String,
    pub last_used: String,
    pub total_acquires: u64,
    pub total_timeouts: u64,
}

// =============================================================================
// Pool Registry
// =============================================================================

/// Explicit keyed registry of pools, owned by the orchestrator.
pub struct PoolRegistry {
    factory: Arc<dyn EngineFactory>,
    config: PoolConfig,
    pools: RwLock<HashMap<PoolKey, Arc<EnginePool>>>,
}

impl PoolRegistry {
    pub fn new(factory: Arc<dyn EngineFactory>, config: PoolConfig) -> Self {
        Self {
            factory,
            config,
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Look up an existing pool.
    pub fn get(&self, key: &PoolKey) -> Option<Arc<EnginePool>> {
        self.pools
            .read()
            .expect("registry poisoned")
            .get(key)
            .cloned()
    }

    /// Look up a pool, creating it from the release workbook on a miss.
    ///
    /// The seed closure is only invoked on a miss; it fails with the
    /// configuration error explaining why no workbook is available, which
    /// makes a missing pool self-healing exactly when the release itself
    /// is intact.
    pub fn get_or_create<F>(&self, key: &PoolKey, seed: F) -> ConfigResult<Arc<EnginePool>>
    where
        F: FnOnce() -> ConfigResult<Vec<u8>>,
    {
        if let Some(pool) = self.get(key) {
            return Ok(pool);
        }

        let workbook = seed()?;
        let mut pools = self.pools.write().expect("registry poisoned");
        let pool = pools.entry(key.clone()).or_insert_with(|| {
            log_info_ctx("created engine pool", key.to_string());
            Arc::new(EnginePool::new(
                key.clone(),
                workbook,
                Arc::clone(&self.factory),
                self.config.clone(),
            ))
        });
        Ok(Arc::clone(pool))
    }

    /// Tear a pool down explicitly (release superseded, tenant disabled).
    /// In-flight leases keep their arena alive until they drop.
    pub fn remove(&self, key: &PoolKey) -> bool {
        let removed = self
            .pools
            .write()
            .expect("registry poisoned")
            .remove(key)
            .is_some();
        if removed {
            log_info_ctx("removed engine pool", key.to_string());
        }
        removed
    }

    /// Drop every pool that has been idle longer than `max_idle` and has
    /// no instance checked out. Returns how many were evicted.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let max_idle = match chrono::Duration::from_std(max_idle) {
            Ok(d) => d,
            Err(_) => return 0,
        };
        let cutoff = Utc::now() - max_idle;
        let mut pools = self.pools.write().expect("registry poisoned");
        let before = pools.len();
        pools.retain(|key, pool| {
            let evict = pool.is_fully_idle() && pool.last_used() <= cutoff;
            if evict {
                log_info_ctx("evicted idle engine pool", key.to_string());
            }
            !evict
        });
        before - pools.len()
    }

    /// Stats for every registered pool.
    pub fn stats(&self) -> Vec<PoolStats> {
        self.pools
            .read()
            .expect("registry poisoned")
            .values()
            .map(|p| p.stats())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pools.read().expect("registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fakes::ScriptedFactory;
    use std::sync::atomic::AtomicUsize;

    fn test_key() -> PoolKey {
        PoolKey {
            tenant_id: "acme".into(),
            product_id: "home".into(),
            environment: Environment::Development,
            release_id: "r42".into(),
            app_type: AppType::Quote,
        }
    }

    fn pool_with(factory: ScriptedFactory, capacity: usize, timeout: Duration) -> EnginePool {
        EnginePool::new(
            test_key(),
            b"workbook-bytes".to_vec(),
            Arc::new(factory),
            PoolConfig {
                capacity,
                acquire_timeout: timeout,
            },
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_capacity_one_never_overlaps() {
        let pool = Arc::new(pool_with(
            ScriptedFactory::with_output("{}"),
            1,
            Duration::from_secs(5),
        ));
        let active = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..2 {
            let pool = Arc::clone(&pool);
            let active = Arc::clone(&active);
            handles.push(tokio::spawn(async move {
                let lease = pool.acquire().await.unwrap();
                let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
                assert_eq!(now_active, 1, "two callers hold the same instance");
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                pool.release(lease);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_idle_instance_is_reused() {
        let pool = pool_with(ScriptedFactory::with_output("{}"), 2, Duration::from_secs(1));
        let first = pool.acquire().await.unwrap();
        let slot = first.slot();
        pool.release(first);
        let second = pool.acquire().await.unwrap();
        assert_eq!(second.slot(), slot);
        let stats = pool.stats();
        assert_eq!(stats.instances, 1);
        assert_eq!(stats.total_acquires, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_surfaces_distinct_error() {
        let pool = pool_with(ScriptedFactory::with_output("{}"), 1, Duration::from_secs(30));
        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        match err {
            PoolError::Exhausted { waited_ms, .. } => assert_eq!(waited_ms, 30_000),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(pool.stats().total_timeouts, 1);
    }

    #[tokio::test]
    async fn test_dropped_lease_frees_capacity() {
        let pool = pool_with(ScriptedFactory::with_output("{}"), 1, Duration::from_secs(1));
        {
            let _lease = pool.acquire().await.unwrap();
            assert!(!pool.is_fully_idle());
        }
        assert!(pool.is_fully_idle());
        // And the instance is back, not rebuilt.
        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.slot(), 0);
    }

    #[tokio::test]
    async fn test_build_failure_leaves_pool_usable() {
        let factory = ScriptedFactory {
            fail_build: true,
            ..ScriptedFactory::with_output("{}")
        };
        let pool = pool_with(factory, 1, Duration::from_secs(1));
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Build(_)));
        // The reserved slot and the permit were both returned.
        assert!(pool.is_fully_idle());
        assert_eq!(pool.stats().instances, 0);
    }

    #[tokio::test]
    async fn test_registry_creates_once() {
        let registry = PoolRegistry::new(
            Arc::new(ScriptedFactory::with_output("{}")),
            PoolConfig::default(),
        );
        let seeds = AtomicUsize::new(0);
        let key = test_key();
        let first = registry
            .get_or_create(&key, || {
                seeds.fetch_add(1, Ordering::SeqCst);
                Ok(b"workbook".to_vec())
            })
            .unwrap();
        let second = registry
            .get_or_create(&key, || {
                seeds.fetch_add(1, Ordering::SeqCst);
                Ok(b"workbook".to_vec())
            })
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(seeds.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.stats().len(), 1);
        assert_eq!(registry.stats()[0].capacity, PoolConfig::default().capacity);
    }

    #[tokio::test]
    async fn test_registry_seed_failure_propagates() {
        let registry = PoolRegistry::new(
            Arc::new(ScriptedFactory::with_output("{}")),
            PoolConfig::default(),
        );
        let err = registry
            .get_or_create(&test_key(), || {
                Err(ConfigError::WorkbookMissing {
                    release_id: "r42".into(),
                    environment: "development".into(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, ConfigError::WorkbookMissing { .. }));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_evict_idle_skips_checked_out_pools() {
        let registry = PoolRegistry::new(
            Arc::new(ScriptedFactory::with_output("{}")),
            PoolConfig::default(),
        );
        let key = test_key();
        let pool = registry
            .get_or_create(&key, || Ok(b"workbook".to_vec()))
            .unwrap();
        let lease = pool.acquire().await.unwrap();
        assert_eq!(registry.evict_idle(Duration::ZERO), 0);
        pool.release(lease);
        assert_eq!(registry.evict_idle(Duration::ZERO), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_remove_is_explicit_teardown() {
        let registry = PoolRegistry::new(
            Arc::new(ScriptedFactory::with_output("{}")),
            PoolConfig::default(),
        );
        let key = test_key();
        registry
            .get_or_create(&key, || Ok(b"workbook".to_vec()))
            .unwrap();
        assert!(registry.remove(&key));
        assert!(!registry.remove(&key));
    }
}
