//! Instance pool.
//!
//! The pool owns every [`EngineInstance`] the process launches: one shared
//! default instance, created lazily, plus leased entries for callers that
//! need independent parallel sessions.
//!
//! The default instance is shared by every caller of
//! [`InstancePool::get_default_instance`]. Its commands are serialized by
//! the instance's own lock, so heavy use of the default instance means
//! callers queue behind each other. Use [`InstancePool::acquire`] when work
//! should run in parallel.

use crate::config::{EngineConfig, PoolConfig, VizhostConfig};
use crate::driver::EngineLauncher;
use crate::instance::{EngineInstance, InstanceId};
use crate::result::{VizhostError, VizhostResult};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Bookkeeping for one pooled instance
#[derive(Debug)]
struct PoolEntry {
    instance: Arc<EngineInstance>,
    in_use: bool,
    acquired_at: Option<Instant>,
    reuse_count: u32,
}

impl PoolEntry {
    /// Entry held by its creator until initialization finishes
    fn reserved(instance: Arc<EngineInstance>) -> Self {
        Self {
            instance,
            in_use: true,
            acquired_at: Some(Instant::now()),
            reuse_count: 0,
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    entries: Vec<PoolEntry>,
    default: Option<Arc<EngineInstance>>,
    launches: u64,
    closed: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.entries.len() + usize::from(self.default.is_some())
    }

    fn position(&self, id: InstanceId) -> Option<usize> {
        self.entries.iter().position(|e| e.instance.id() == id)
    }
}

struct Shared {
    config: PoolConfig,
    state: Mutex<PoolState>,
    changed: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return a leased instance. Yields the instance if it must be retired.
    fn check_in(&self, instance: &Arc<EngineInstance>) -> Option<Arc<EngineInstance>> {
        let retired = {
            let mut state = self.lock();
            let index = state.position(instance.id())?;
            let closed = state.closed;
            let worn_out = self.config.max_reuse > 0
                && state.entries[index].reuse_count >= self.config.max_reuse;

            if closed || worn_out || !instance.is_ready() {
                debug!(instance = %instance.id(), worn_out, "retiring pooled instance");
                Some(state.entries.swap_remove(index).instance)
            } else {
                let entry = &mut state.entries[index];
                entry.in_use = false;
                entry.acquired_at = None;
                None
            }
        };
        self.changed.notify_waiters();
        retired
    }

    fn forget(&self, id: InstanceId) {
        {
            let mut state = self.lock();
            if let Some(index) = state.position(id) {
                state.entries.swap_remove(index);
            }
            if state.default.as_ref().is_some_and(|d| d.id() == id) {
                state.default = None;
            }
        }
        self.changed.notify_waiters();
    }
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Live instances, default included
    pub instances: usize,
    /// Leased (or still starting) entries
    pub in_use: usize,
    /// Entries ready to lease
    pub idle: usize,
    /// Whether the default instance exists
    pub has_default: bool,
    /// Launches performed since the pool was created
    pub launches: u64,
    /// Configured maximum
    pub capacity: usize,
}

/// Owner of every engine instance in the process
pub struct InstancePool {
    engine: EngineConfig,
    launcher: Arc<dyn EngineLauncher>,
    shared: Arc<Shared>,
    default_init: tokio::sync::Mutex<()>,
}

impl fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstancePool")
            .field("launcher", &self.launcher.name())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

enum Claim {
    Idle(Arc<EngineInstance>),
    Fresh(Arc<EngineInstance>),
}

impl InstancePool {
    /// Create an empty pool
    #[must_use]
    pub fn new(config: PoolConfig, engine: EngineConfig, launcher: Arc<dyn EngineLauncher>) -> Self {
        Self {
            engine,
            launcher,
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(PoolState::default()),
                changed: Notify::new(),
            }),
            default_init: tokio::sync::Mutex::new(()),
        }
    }

    /// Create a pool from the aggregate configuration
    #[must_use]
    pub fn from_config(config: &VizhostConfig, launcher: Arc<dyn EngineLauncher>) -> Self {
        Self::new(config.pool.clone(), config.engine.clone(), launcher)
    }

    /// Pool configuration
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    fn closed_error() -> VizhostError {
        VizhostError::connection("instance pool is closed")
    }

    fn new_instance(&self, state: &mut PoolState) -> Arc<EngineInstance> {
        state.launches += 1;
        Arc::new(EngineInstance::new(
            self.engine.clone(),
            Arc::clone(&self.launcher),
        ))
    }

    /// Run `attempt` under the bookkeeping lock until it claims something,
    /// waiting for pool changes in between, bounded by the acquire timeout.
    async fn claim<T>(&self, mut attempt: impl FnMut(&mut PoolState) -> Option<T>) -> VizhostResult<T> {
        let budget = self.shared.config.acquire_timeout();
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.lock();
                if state.closed {
                    return Err(Self::closed_error());
                }
                if let Some(claimed) = attempt(&mut state) {
                    return Ok(claimed);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(VizhostError::timeout(
                    "pool acquire",
                    self.shared.config.acquire_timeout_ms,
                ));
            }
        }
    }

    fn ready_default(&self) -> Option<Arc<EngineInstance>> {
        self.shared
            .lock()
            .default
            .as_ref()
            .filter(|d| d.is_ready())
            .map(Arc::clone)
    }

    /// The shared default instance, launched on first use.
    ///
    /// Concurrent first callers are coalesced: exactly one launch happens
    /// and every caller gets the same instance. A failed launch leaves the
    /// slot empty so the next caller tries again; a default that is no
    /// longer Ready is replaced.
    ///
    /// # Errors
    ///
    /// `Connection` if the pool is closed or the instance fails to start,
    /// `Timeout` if no capacity frees up in time
    #[tracing::instrument(skip(self))]
    pub async fn get_default_instance(&self) -> VizhostResult<Arc<EngineInstance>> {
        if let Some(instance) = self.ready_default() {
            return Ok(instance);
        }

        let _single_flight = self.default_init.lock().await;
        if let Some(instance) = self.ready_default() {
            return Ok(instance);
        }

        let stale = self.shared.lock().default.take();
        if let Some(stale) = stale {
            warn!(instance = %stale.id(), state = %stale.state(), "replacing default instance");
            stale.cleanup().await;
            self.shared.changed.notify_waiters();
        }

        let instance = self
            .claim(|state| {
                if state.total() < self.shared.config.max_instances {
                    let instance = self.new_instance(state);
                    state.default = Some(Arc::clone(&instance));
                    Some(instance)
                } else {
                    None
                }
            })
            .await?;

        if let Err(e) = instance.initialize().await {
            self.shared.forget(instance.id());
            instance.cleanup().await;
            return Err(e);
        }
        info!(instance = %instance.id(), "default instance ready");
        Ok(instance)
    }

    /// Pre-create idle instances in parallel.
    ///
    /// Creates `min(count, warm_up_limit, free capacity)` instances and
    /// returns how many reached Ready.
    pub async fn warm_up(&self, count: usize) -> usize {
        let planned: Vec<Arc<EngineInstance>> = {
            let mut state = self.shared.lock();
            if state.closed {
                return 0;
            }
            let room = self.shared.config.max_instances.saturating_sub(state.total());
            let n = count.min(self.shared.config.warm_up_limit).min(room);
            (0..n)
                .map(|_| {
                    let instance = self.new_instance(&mut state);
                    state.entries.push(PoolEntry::reserved(Arc::clone(&instance)));
                    instance
                })
                .collect()
        };
        if planned.is_empty() {
            return 0;
        }

        let results = join_all(planned.iter().map(|instance| instance.initialize())).await;

        let mut ready = 0;
        for (instance, result) in planned.iter().zip(results) {
            match result {
                Ok(()) => {
                    let mut state = self.shared.lock();
                    if let Some(index) = state.position(instance.id()) {
                        let entry = &mut state.entries[index];
                        entry.in_use = false;
                        entry.acquired_at = None;
                        ready += 1;
                    }
                }
                Err(e) => {
                    warn!(instance = %instance.id(), error = %e, "warm-up instance failed");
                    self.shared.forget(instance.id());
                    instance.cleanup().await;
                }
            }
        }
        self.shared.changed.notify_waiters();
        info!(requested = count, ready, "pool warmed up");
        ready
    }

    /// Lease an instance for exclusive use.
    ///
    /// Prefers an idle entry, launches a new one when there is capacity, and
    /// otherwise waits for a release up to `acquire_timeout_ms`.
    ///
    /// # Errors
    ///
    /// `Connection` if the pool is closed or a new instance fails to start,
    /// `Timeout` if nothing frees up in time
    pub async fn acquire(&self) -> VizhostResult<PoolLease> {
        let claim = self
            .claim(|state| {
                if let Some(entry) = state.entries.iter_mut().find(|e| !e.in_use) {
                    entry.in_use = true;
                    entry.acquired_at = Some(Instant::now());
                    entry.reuse_count += 1;
                    return Some(Claim::Idle(Arc::clone(&entry.instance)));
                }
                if state.total() < self.shared.config.max_instances {
                    let instance = self.new_instance(state);
                    let mut entry = PoolEntry::reserved(Arc::clone(&instance));
                    entry.reuse_count = 1;
                    state.entries.push(entry);
                    return Some(Claim::Fresh(instance));
                }
                None
            })
            .await?;

        let instance = match claim {
            Claim::Idle(instance) => instance,
            Claim::Fresh(instance) => {
                if let Err(e) = instance.initialize().await {
                    self.shared.forget(instance.id());
                    instance.cleanup().await;
                    return Err(e);
                }
                instance
            }
        };
        debug!(instance = %instance.id(), "instance leased");
        Ok(PoolLease {
            instance: Some(instance),
            shared: Arc::clone(&self.shared),
        })
    }

    /// Return a lease, retiring the instance if it is no longer healthy or
    /// has reached `max_reuse`. Dropping the lease does the same, with
    /// retirement finishing in the background.
    pub async fn release(&self, mut lease: PoolLease) {
        if let Some(instance) = lease.instance.take() {
            if let Some(retired) = lease.shared.check_in(&instance) {
                retired.cleanup().await;
            }
        }
    }

    /// Close idle entries whose last activity is older than `idle_timeout_ms`.
    ///
    /// Returns the number of instances closed. The default instance is never reaped.
    pub async fn reap_idle(&self) -> usize {
        let idle_timeout = self.shared.config.idle_timeout();
        let expired: Vec<Arc<EngineInstance>> = {
            let mut state = self.shared.lock();
            let (keep, expired): (Vec<PoolEntry>, Vec<PoolEntry>) =
                std::mem::take(&mut state.entries)
                    .into_iter()
                    .partition(|e| e.in_use || (e.instance.is_ready() && e.instance.idle_for() < idle_timeout));
            state.entries = keep;
            expired.into_iter().map(|e| e.instance).collect()
        };
        if expired.is_empty() {
            return 0;
        }

        join_all(expired.iter().map(|instance| instance.cleanup())).await;
        self.shared.changed.notify_waiters();
        info!(reaped = expired.len(), "idle instances closed");
        expired.len()
    }

    /// Occupancy snapshot
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        let in_use = state.entries.iter().filter(|e| e.in_use).count();
        PoolStats {
            instances: state.total(),
            in_use,
            idle: state.entries.len() - in_use,
            has_default: state.default.is_some(),
            launches: state.launches,
            capacity: self.shared.config.max_instances,
        }
    }

    /// Whether [`Self::cleanup`] has run
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Close the pool and tear down every instance concurrently.
    ///
    /// In-flight operations fail with `Connection`. Later `acquire` and
    /// `get_default_instance` calls fail with `Connection`. Safe to call
    /// repeatedly.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup(&self) {
        let instances: Vec<Arc<EngineInstance>> = {
            let mut state = self.shared.lock();
            state.closed = true;
            let mut all: Vec<_> = state.entries.drain(..).map(|e| e.instance).collect();
            all.extend(state.default.take());
            all
        };
        self.shared.changed.notify_waiters();
        if instances.is_empty() {
            return;
        }

        info!(count = instances.len(), "closing pooled instances");
        join_all(instances.iter().map(|instance| instance.cleanup())).await;
    }
}

/// Exclusive use of one pooled instance.
///
/// Derefs to [`EngineInstance`]. Returned to the pool on drop.
pub struct PoolLease {
    instance: Option<Arc<EngineInstance>>,
    shared: Arc<Shared>,
}

impl PoolLease {
    /// The leased instance
    ///
    /// # Panics
    ///
    /// Never: the instance is only taken when the lease is consumed
    #[must_use]
    pub fn instance(&self) -> &Arc<EngineInstance> {
        self.instance
            .as_ref()
            .expect("lease holds its instance until released")
    }

    /// How long this lease has been held
    #[must_use]
    pub fn held_for(&self) -> std::time::Duration {
        let id = self.instance().id();
        let state = self.shared.lock();
        state
            .position(id)
            .and_then(|i| state.entries[i].acquired_at)
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }
}

impl fmt::Debug for PoolLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolLease")
            .field("instance", &self.instance.as_ref().map(|i| i.id()))
            .finish()
    }
}

impl Deref for PoolLease {
    type Target = EngineInstance;

    fn deref(&self) -> &EngineInstance {
        self.instance()
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        let Some(instance) = self.instance.take() else {
            return;
        };
        let Some(retired) = self.shared.check_in(&instance) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { retired.cleanup().await });
            }
            Err(_) => warn!(
                instance = %retired.id(),
                "lease dropped outside a runtime; instance not cleaned up"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceState;
    use crate::mock::{MockLauncher, MockOptions};
    use std::time::Duration;

    fn engine() -> EngineConfig {
        EngineConfig::default()
            .with_viewport(40, 30)
            .with_poll_interval(5)
            .with_startup_timeout(300)
    }

    fn pool_with(config: PoolConfig, launcher: &MockLauncher) -> InstancePool {
        InstancePool::new(config, engine(), Arc::new(launcher.clone()))
    }

    fn small_pool(max: usize) -> PoolConfig {
        PoolConfig::default()
            .with_max_instances(max)
            .with_acquire_timeout(100)
    }

    mod default_instance_tests {
        use super::*;

        #[tokio::test]
        async fn test_concurrent_first_callers_share_one_launch() {
            let launcher = MockLauncher::new(MockOptions::default())
                .with_launch_delay(Duration::from_millis(50));
            let pool = pool_with(PoolConfig::default(), &launcher);

            let (a, b) = tokio::join!(pool.get_default_instance(), pool.get_default_instance());
            let (a, b) = (a.unwrap(), b.unwrap());

            assert!(Arc::ptr_eq(&a, &b));
            assert_eq!(a.state(), InstanceState::Ready);
            assert_eq!(launcher.launches(), 1);
        }

        #[tokio::test]
        async fn test_failed_default_leaves_slot_empty() {
            let launcher = MockLauncher::new(MockOptions::default().with_never_callable());
            let pool = pool_with(PoolConfig::default(), &launcher);

            assert!(pool.get_default_instance().await.unwrap_err().is_connection());
            assert!(!pool.stats().has_default);
            assert!(pool.get_default_instance().await.is_err());
            assert_eq!(launcher.launches(), 2);
            assert!(launcher.handles().iter().all(|h| h.is_closed()));
        }

        #[tokio::test]
        async fn test_closed_default_is_replaced() {
            let launcher = MockLauncher::new(MockOptions::default());
            let pool = pool_with(PoolConfig::default(), &launcher);
            let first = pool.get_default_instance().await.unwrap();
            first.cleanup().await;

            let second = pool.get_default_instance().await.unwrap();
            assert_ne!(first.id(), second.id());
            assert_eq!(pool.stats().instances, 1);
        }

        #[tokio::test]
        async fn test_default_counts_toward_capacity() {
            let launcher = MockLauncher::new(MockOptions::default());
            let pool = pool_with(small_pool(1), &launcher);
            pool.get_default_instance().await.unwrap();
            let err = pool.acquire().await.unwrap_err();
            assert!(matches!(err, VizhostError::Timeout { .. }));
        }
    }

    mod lease_tests {
        use super::*;

        #[tokio::test]
        async fn test_leases_are_distinct() {
            let launcher = MockLauncher::new(MockOptions::default());
            let pool = pool_with(small_pool(2), &launcher);
            let a = pool.acquire().await.unwrap();
            let b = pool.acquire().await.unwrap();
            assert_ne!(a.id(), b.id());
            assert_eq!(pool.stats().in_use, 2);
        }

        #[tokio::test]
        async fn test_acquire_times_out_at_capacity() {
            let launcher = MockLauncher::new(MockOptions::default());
            let pool = pool_with(small_pool(1), &launcher);
            let _held = pool.acquire().await.unwrap();
            let err = pool.acquire().await.unwrap_err();
            assert!(matches!(err, VizhostError::Timeout { ms: 100, .. }));
        }

        #[tokio::test]
        async fn test_released_instance_is_reused() {
            let launcher = MockLauncher::new(MockOptions::default());
            let pool = pool_with(small_pool(1), &launcher);
            let first = pool.acquire().await.unwrap();
            let id = first.id();
            pool.release(first).await;

            let second = pool.acquire().await.unwrap();
            assert_eq!(second.id(), id);
            assert_eq!(launcher.launches(), 1);
        }

        #[tokio::test]
        async fn test_waiter_wakes_on_drop() {
            let launcher = MockLauncher::new(MockOptions::default());
            let pool = Arc::new(pool_with(
                PoolConfig::default().with_max_instances(1).with_acquire_timeout(2_000),
                &launcher,
            ));
            let held = pool.acquire().await.unwrap();
            let id = held.id();

            let waiter = {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move { pool.acquire().await.map(|lease| lease.id()) })
            };
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(held);

            assert_eq!(waiter.await.unwrap().unwrap(), id);
        }

        #[tokio::test]
        async fn test_worn_out_instance_is_retired() {
            let launcher = MockLauncher::new(MockOptions::default());
            let pool = pool_with(small_pool(2).with_max_reuse(1), &launcher);
            let lease = pool.acquire().await.unwrap();
            pool.release(lease).await;

            assert_eq!(pool.stats().instances, 0);
            assert!(launcher.handles()[0].is_closed());

            let _next = pool.acquire().await.unwrap();
            assert_eq!(launcher.launches(), 2);
        }

        #[tokio::test]
        async fn test_dead_instance_is_not_returned_to_idle() {
            let launcher = MockLauncher::new(MockOptions::default());
            let pool = pool_with(small_pool(2), &launcher);
            let lease = pool.acquire().await.unwrap();
            lease.cleanup().await;
            pool.release(lease).await;
            assert_eq!(pool.stats().instances, 0);
        }

        #[tokio::test]
        async fn test_failed_launch_frees_capacity() {
            let launcher = MockLauncher::new(MockOptions::default()).with_failing_launch();
            let pool = pool_with(small_pool(1), &launcher);
            assert!(pool.acquire().await.unwrap_err().is_connection());
            assert_eq!(pool.stats().instances, 0);
        }
    }

    mod maintenance_tests {
        use super::*;

        #[tokio::test]
        async fn test_warm_up_is_bounded() {
            let launcher = MockLauncher::new(MockOptions::default());
            let pool = pool_with(
                PoolConfig::default().with_max_instances(4).with_warm_up_limit(2),
                &launcher,
            );
            assert_eq!(pool.warm_up(5).await, 2);
            let stats = pool.stats();
            assert_eq!((stats.idle, stats.in_use), (2, 0));

            let _lease = pool.acquire().await.unwrap();
            assert_eq!(launcher.launches(), 2);
        }

        #[tokio::test]
        async fn test_warm_up_respects_capacity() {
            let launcher = MockLauncher::new(MockOptions::default());
            let pool = pool_with(small_pool(1).with_warm_up_limit(3), &launcher);
            pool.get_default_instance().await.unwrap();
            assert_eq!(pool.warm_up(3).await, 0);
        }

        #[tokio::test]
        async fn test_reap_idle() {
            let launcher = MockLauncher::new(MockOptions::default());
            let pool = pool_with(PoolConfig::default().with_idle_timeout(0), &launcher);
            pool.warm_up(1).await;
            let _held = pool.acquire().await.unwrap();
            pool.warm_up(1).await;

            assert_eq!(pool.reap_idle().await, 1);
            assert_eq!(pool.stats().in_use, 1);
            assert_eq!(pool.stats().idle, 0);
        }

        #[tokio::test]
        async fn test_cleanup_is_idempotent_and_final() {
            let launcher = MockLauncher::new(MockOptions::default());
            let pool = pool_with(PoolConfig::default(), &launcher);
            pool.get_default_instance().await.unwrap();
            pool.warm_up(2).await;

            pool.cleanup().await;
            pool.cleanup().await;

            assert!(pool.is_closed());
            assert_eq!(pool.stats().instances, 0);
            assert!(launcher.handles().iter().all(|h| h.is_closed()));
            assert!(pool.acquire().await.unwrap_err().is_connection());
            assert!(pool.get_default_instance().await.unwrap_err().is_connection());
        }

        #[tokio::test]
        async fn test_cleanup_fails_in_flight_operations() {
            let launcher = MockLauncher::new(
                MockOptions::default().with_call_delay(Duration::from_secs(5)),
            );
            let pool = Arc::new(pool_with(PoolConfig::default(), &launcher));
            let lease = pool.acquire().await.unwrap();

            let worker = tokio::spawn(async move { lease.eval_command("a = 1").await });
            tokio::time::sleep(Duration::from_millis(30)).await;
            pool.cleanup().await;

            assert!(worker.await.unwrap().unwrap_err().is_connection());
        }
    }
}
