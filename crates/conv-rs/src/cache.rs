//! Per-device tables of lazily built convolution runners.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::config::ConvConfig;
use crate::descriptor::AlgorithmDesc;
use crate::device::{CompiledConv, DeviceContext};
use crate::error::{lock_named, read_named, write_named, ConvResult};

/// Lifecycle of a cached runner. Slots that never built successfully hold no runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Built,
    AlgorithmRefined,
}

/// Compiled plan for one call site plus the algorithm currently chosen for it.
///
/// The config and plan never change after construction. The algorithm cell may be
/// rewritten by runtime autotuning; concurrent writers race and the last write wins.
pub struct CachedRunner {
    config: ConvConfig,
    plan: Arc<dyn CompiledConv>,
    algorithm: RwLock<AlgorithmDesc>,
    refinements: AtomicU64,
}

impl CachedRunner {
    pub fn new(config: ConvConfig, plan: Arc<dyn CompiledConv>) -> Self {
        let algorithm = RwLock::new(config.algorithm.clone());
        Self {
            config,
            plan,
            algorithm,
            refinements: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ConvConfig {
        &self.config
    }

    pub fn plan(&self) -> &dyn CompiledConv {
        self.plan.as_ref()
    }

    pub fn algorithm(&self) -> ConvResult<AlgorithmDesc> {
        Ok(read_named(&self.algorithm, "runner algorithm")?.clone())
    }

    pub fn set_algorithm(&self, algorithm: AlgorithmDesc) -> ConvResult<()> {
        *write_named(&self.algorithm, "runner algorithm")? = algorithm;
        self.refinements.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Number of times autotuning replaced the algorithm.
    pub fn refinement_count(&self) -> u64 {
        self.refinements.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> RunnerState {
        if self.refinement_count() == 0 {
            RunnerState::Built
        } else {
            RunnerState::AlgorithmRefined
        }
    }
}

impl fmt::Debug for CachedRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedRunner")
            .field("kind", &self.config.kind)
            .field("plan", &self.plan)
            .field("refinements", &self.refinement_count())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerCacheStats {
    pub executors: u64,
    pub runners: u64,
    pub hits: u64,
    pub misses: u64,
    pub failed_builds: u64,
}

#[derive(Default)]
struct CacheCounters {
    executors: AtomicU64,
    runners: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    failed_builds: AtomicU64,
}

type RunnerSlot = Mutex<Option<Arc<CachedRunner>>>;

/// Runner table of one device executor, keyed by call-site uid.
pub struct ExecutorRunners {
    device: DeviceContext,
    slots: Mutex<HashMap<i64, Arc<RunnerSlot>>>,
    counters: Arc<CacheCounters>,
}

impl ExecutorRunners {
    fn new(device: DeviceContext, counters: Arc<CacheCounters>) -> Self {
        Self {
            device,
            slots: Mutex::new(HashMap::new()),
            counters,
        }
    }

    pub fn device(&self) -> DeviceContext {
        self.device
    }

    /// Returns the runner for `uid`, building it with `build` on first use.
    ///
    /// The table lock only covers finding the slot; the slot's own lock is held across
    /// `build`, so racing callers for one uid see a single build while other uids proceed.
    /// A failed build leaves the slot empty and the next call builds again.
    pub fn get_or_create<F>(&self, uid: i64, build: F) -> ConvResult<Arc<CachedRunner>>
    where
        F: FnOnce() -> ConvResult<CachedRunner>,
    {
        let slot = {
            let mut slots = lock_named(&self.slots, "runner table")?;
            Arc::clone(slots.entry(uid).or_default())
        };

        let mut guard = lock_named(&slot, "runner slot")?;
        if let Some(runner) = guard.as_ref() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            log::trace!("conv runner cache hit: device={} uid={uid}", self.device.id());
            return Ok(Arc::clone(runner));
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "conv runner cache miss: device={} uid={uid}, building runner",
            self.device.id()
        );
        match build() {
            Ok(runner) => {
                let runner = Arc::new(runner);
                *guard = Some(Arc::clone(&runner));
                self.counters.runners.fetch_add(1, Ordering::Relaxed);
                Ok(runner)
            }
            Err(err) => {
                self.counters.failed_builds.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "conv runner build failed: device={} uid={uid}: {err}",
                    self.device.id()
                );
                Err(err)
            }
        }
    }

    /// Cached runner for `uid`, if one was built. Blocks while a build is in flight.
    pub fn get(&self, uid: i64) -> ConvResult<Option<Arc<CachedRunner>>> {
        let slot = match lock_named(&self.slots, "runner table")?.get(&uid) {
            Some(slot) => Arc::clone(slot),
            None => return Ok(None),
        };
        let guard = lock_named(&slot, "runner slot")?;
        Ok(guard.clone())
    }
}

/// Process-lifetime cache of runner tables, one per device executor. Nothing is evicted.
pub struct RunnerCache {
    executors: Mutex<HashMap<DeviceContext, Arc<ExecutorRunners>>>,
    counters: Arc<CacheCounters>,
}

impl RunnerCache {
    pub fn new() -> Self {
        Self {
            executors: Mutex::new(HashMap::new()),
            counters: Arc::new(CacheCounters::default()),
        }
    }

    /// Runner table for `device`, created on first use.
    pub fn executor(&self, device: DeviceContext) -> ConvResult<Arc<ExecutorRunners>> {
        let mut executors = lock_named(&self.executors, "executor table")?;
        let table = executors.entry(device).or_insert_with(|| {
            self.counters.executors.fetch_add(1, Ordering::Relaxed);
            log::debug!("creating conv runner table for device {}", device.id());
            Arc::new(ExecutorRunners::new(device, Arc::clone(&self.counters)))
        });
        Ok(Arc::clone(table))
    }

    pub fn get_or_create<F>(
        &self,
        device: DeviceContext,
        uid: i64,
        build: F,
    ) -> ConvResult<Arc<CachedRunner>>
    where
        F: FnOnce() -> ConvResult<CachedRunner>,
    {
        self.executor(device)?.get_or_create(uid, build)
    }

    pub fn stats(&self) -> RunnerCacheStats {
        RunnerCacheStats {
            executors: self.counters.executors.load(Ordering::Relaxed),
            runners: self.counters.runners.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            failed_builds: self.counters.failed_builds.load(Ordering::Relaxed),
        }
    }
}

impl Default for RunnerCache {
    fn default() -> Self {
        Self::new()
    }
}
