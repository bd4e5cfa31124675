//! Bounded worker pool.
//!
//! ## Lifecycle
//!
//! ```text
//! acquire_worker ─┬─ idle worker available → reuse it
//!                 ├─ below max_workers     → create (and, in shared mode,
//!                 │                          bind to a coordinator)
//!                 └─ at capacity           → wait for a release, up to
//!                                            acquire_timeout, then WorkerPool error
//! release_worker  → worker back to idle, one waiter woken
//! retire_worker   → worker terminated, capacity freed
//! terminate_all   → everything terminated; in-flight requests fail with Abort
//! ```
//!
//! Coordinators are created lazily on the first shared-mode acquisition and
//! live until [`WorkerPool::terminate_all`].
//!
//! ## Process-wide instance
//!
//! [`WorkerPool::get_instance`] returns one shared pool. A reset requested
//! through [`WorkerPool::reset_instance`] takes effect only after the
//! configured grace window; a `get_instance` inside that window cancels it,
//! so a component that is torn down and immediately recreated keeps its
//! workers.

use crate::config::{AssignmentPolicy, EngineStrategy, PipelineConfig};
use crate::coordinator::{CoordinatorHandle, CoordinatorStatus};
use crate::engine::host::EngineHost;
use crate::engine::pdfium::PdfiumEngineFactory;
use crate::engine::EngineFactory;
use crate::error::{ErrorKind, RenderError};
use crate::protocol::WorkerId;
use crate::recovery::RecoveryBus;
use crate::worker::{self, CoordinatorAssignment, CoordinatorLink, WorkerHandle};
use futures::future::join_all;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Notify, OnceCell};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub workers: usize,
    pub idle: usize,
    pub busy: usize,
    /// Workers being created right now.
    pub starting: usize,
    pub coordinators: usize,
    pub max_workers: usize,
    pub terminated: bool,
}

struct WorkerEntry {
    handle: WorkerHandle,
    assignment: Option<CoordinatorAssignment>,
    busy: bool,
}

#[derive(Default)]
struct PoolState {
    workers: HashMap<WorkerId, WorkerEntry>,
    idle: VecDeque<WorkerId>,
    starting: usize,
    next_coordinator: usize,
    terminated: bool,
}

pub struct WorkerPool {
    config: Arc<PipelineConfig>,
    factory: Arc<dyn EngineFactory>,
    bus: RecoveryBus,
    state: Mutex<PoolState>,
    available: Notify,
    coordinators: OnceCell<Vec<CoordinatorHandle>>,
    next_worker_id: AtomicU64,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// A pool publishing orphaned results on [`RecoveryBus::global`].
    pub fn new(config: PipelineConfig, factory: Arc<dyn EngineFactory>) -> Arc<Self> {
        let bus = RecoveryBus::global();
        bus.set_expiration(config.orphan_expiration());
        Self::with_bus(config, factory, bus)
    }

    /// A pool rendering through pdfium.
    pub fn with_pdfium(config: PipelineConfig) -> Arc<Self> {
        Self::new(config, Arc::new(PdfiumEngineFactory))
    }

    pub fn with_bus(
        config: PipelineConfig,
        factory: Arc<dyn EngineFactory>,
        bus: RecoveryBus,
    ) -> Arc<Self> {
        if let Err(e) = config.validate() {
            warn!("{}; out-of-range values are clamped", e);
        }
        info!(
            "Worker pool: max {} workers, {:?} engines, {} coordinator(s)",
            config.max_workers, config.engine_strategy, config.coordinator_count
        );
        Arc::new(Self {
            config: Arc::new(config),
            factory,
            bus,
            state: Mutex::new(PoolState::default()),
            available: Notify::new(),
            coordinators: OnceCell::new(),
            next_worker_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> Arc<PipelineConfig> {
        Arc::clone(&self.config)
    }

    pub fn bus(&self) -> &RecoveryBus {
        &self.bus
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn terminated_error() -> RenderError {
        RenderError::new(ErrorKind::WorkerPool, "worker pool has been terminated")
    }

    // ── Acquisition ──────────────────────────────────────────────────────

    /// Get a worker for exclusive use until it is released or retired.
    pub async fn acquire_worker(&self) -> Result<WorkerHandle, RenderError> {
        let started = Instant::now();
        let deadline = started + self.config.acquire_timeout();

        loop {
            // Register interest before checking state so a release between
            // the check and the wait is not missed.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_claim()? {
                Claim::Reused(handle) => {
                    debug!("Reusing idle {}", handle.id());
                    return Ok(handle);
                }
                Claim::Create => return self.create_worker().await,
                Claim::Full => {}
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let waited = started.elapsed().as_millis() as u64;
                warn!(
                    "Worker pool exhausted after {}ms ({} workers busy)",
                    waited, self.config.max_workers
                );
                return Err(RenderError::pool_exhausted(self.config.max_workers, waited));
            }
        }
    }

    fn try_claim(&self) -> Result<Claim, RenderError> {
        let mut guard = self.state();
        let state = &mut *guard;
        if state.terminated {
            return Err(Self::terminated_error());
        }
        while let Some(id) = state.idle.pop_front() {
            match state.workers.get_mut(&id) {
                Some(entry) if entry.handle.is_alive() => {
                    entry.busy = true;
                    return Ok(Claim::Reused(entry.handle.clone()));
                }
                Some(_) => {
                    warn!("Dropping dead idle {}", id);
                    state.workers.remove(&id);
                }
                None => {}
            }
        }
        if state.workers.len() + state.starting < self.config.max_workers {
            state.starting += 1;
            return Ok(Claim::Create);
        }
        Ok(Claim::Full)
    }

    async fn create_worker(&self) -> Result<WorkerHandle, RenderError> {
        let id = WorkerId(self.next_worker_id.fetch_add(1, Ordering::Relaxed));
        let slot = StartingSlot::new(self);
        let created = self.start_worker(id).await;

        let mut state = self.state();
        slot.settle(&mut state);
        match created {
            Ok(entry) if !state.terminated => {
                let handle = entry.handle.clone();
                state.workers.insert(id, entry);
                info!("Created {} ({} live)", id, state.workers.len());
                Ok(handle)
            }
            Ok(entry) => {
                entry.handle.terminate();
                Err(Self::terminated_error())
            }
            Err(e) => {
                drop(state);
                warn!("Failed to create {}: {}", id, e);
                self.available.notify_one();
                Err(e)
            }
        }
    }

    async fn start_worker(&self, id: WorkerId) -> Result<WorkerEntry, RenderError> {
        match self.config.engine_strategy {
            EngineStrategy::Dedicated => {
                let host =
                    EngineHost::spawn(format!("pdf-engine-{}", id.0), Arc::clone(&self.factory))
                        .await?;
                Ok(WorkerEntry {
                    handle: worker::spawn_dedicated(id, host, self.bus.clone()),
                    assignment: None,
                    busy: true,
                })
            }
            EngineStrategy::Shared => {
                let coordinators = self.ensure_coordinators().await?;
                let index = self.choose_coordinator(coordinators).await;
                let coordinator = &coordinators[index];

                let mut handle = worker::spawn_unassigned(id, self.bus.clone());
                let (port_tx, port_rx) = mpsc::unbounded_channel();
                let (done_tx, done_rx) = mpsc::unbounded_channel();
                if let Err(e) = coordinator.register_worker(id, port_rx, done_tx) {
                    handle.terminate();
                    return Err(e);
                }

                let assignment = CoordinatorAssignment {
                    worker_id: id,
                    coordinator_index: index,
                };
                let link = CoordinatorLink {
                    port: port_tx,
                    completions: done_rx,
                    control: coordinator.clone(),
                };
                let handshake = self.config.handshake_timeout();
                match tokio::time::timeout(handshake, handle.assign(assignment, link)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        handle.terminate();
                        return Err(e);
                    }
                    Err(_) => {
                        handle.terminate();
                        return Err(RenderError::new(
                            ErrorKind::WorkerInit,
                            format!(
                                "{id} did not acknowledge coordinator {index} within {}ms",
                                handshake.as_millis()
                            ),
                        ));
                    }
                }
                handle.coordinator_index = Some(index);
                debug!("{} bound to coordinator {}", id, index);
                Ok(WorkerEntry {
                    handle,
                    assignment: Some(assignment),
                    busy: true,
                })
            }
        }
    }

    async fn ensure_coordinators(&self) -> Result<&Vec<CoordinatorHandle>, RenderError> {
        self.coordinators
            .get_or_try_init(|| async {
                let count = self.config.coordinator_count.max(1);
                let mut coordinators: Vec<CoordinatorHandle> = Vec::with_capacity(count);
                for index in 0..count {
                    let coordinator = CoordinatorHandle::spawn(
                        index,
                        Arc::clone(&self.factory),
                        self.bus.clone(),
                    );
                    if let Err(e) = coordinator.init().await {
                        coordinator.shutdown();
                        for started in &coordinators {
                            started.shutdown();
                        }
                        return Err(e);
                    }
                    coordinators.push(coordinator);
                }
                info!("Started {} coordinator(s)", count);
                Ok(coordinators)
            })
            .await
    }

    async fn choose_coordinator(&self, coordinators: &[CoordinatorHandle]) -> usize {
        match self.config.assignment {
            AssignmentPolicy::RoundRobin => {
                let mut state = self.state();
                let index = state.next_coordinator % coordinators.len();
                state.next_coordinator += 1;
                index
            }
            AssignmentPolicy::LeastLoaded => {
                let statuses = join_all(coordinators.iter().map(CoordinatorHandle::status)).await;
                statuses
                    .iter()
                    .enumerate()
                    .filter_map(|(i, status)| {
                        status
                            .as_ref()
                            .ok()
                            .map(|s| (s.active_requests, s.active_clients.len(), i))
                    })
                    .min()
                    .map_or(0, |(_, _, i)| i)
            }
        }
    }

    // ── Release ──────────────────────────────────────────────────────────

    /// Return a worker to the idle set.
    pub fn release_worker(&self, handle: &WorkerHandle) {
        let mut guard = self.state();
        let state = &mut *guard;
        if state.terminated {
            return;
        }
        let id = handle.id();
        let alive = handle.is_alive();
        match state.workers.get_mut(&id) {
            Some(entry) if entry.busy && alive => {
                entry.busy = false;
                state.idle.push_back(id);
                debug!("Released {}", id);
            }
            Some(_) if !alive => {
                state.workers.remove(&id);
            }
            _ => return,
        }
        drop(guard);
        self.available.notify_one();
    }

    /// Terminate one worker and free its slot.
    pub(crate) fn retire_worker(&self, handle: &WorkerHandle) {
        let removed = {
            let mut state = self.state();
            let id = handle.id();
            state.idle.retain(|i| *i != id);
            state.workers.remove(&id)
        };
        handle.terminate();
        if let Some(entry) = removed {
            debug!(
                "Retired {} (coordinator {:?})",
                handle.id(),
                entry.assignment.map(|a| a.coordinator_index)
            );
            self.available.notify_one();
        }
    }

    /// Terminate every worker and coordinator. Later calls do nothing.
    pub fn terminate_all(&self) {
        let workers: Vec<WorkerHandle> = {
            let mut state = self.state();
            if state.terminated {
                return;
            }
            state.terminated = true;
            state.idle.clear();
            state.workers.drain().map(|(_, e)| e.handle).collect()
        };
        for handle in &workers {
            handle.terminate();
        }
        if let Some(coordinators) = self.coordinators.get() {
            for coordinator in coordinators {
                coordinator.shutdown();
            }
        }
        self.available.notify_waiters();
        info!("Worker pool terminated ({} workers)", workers.len());
    }

    pub fn is_terminated(&self) -> bool {
        self.state().terminated
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state();
        let busy = state.workers.values().filter(|e| e.busy).count();
        PoolStats {
            workers: state.workers.len(),
            idle: state.idle.len(),
            busy,
            starting: state.starting,
            coordinators: self.coordinators.get().map_or(0, Vec::len),
            max_workers: self.config.max_workers,
            terminated: state.terminated,
        }
    }

    /// Status of every coordinator started so far.
    pub async fn coordinator_statuses(&self) -> Vec<CoordinatorStatus> {
        let Some(coordinators) = self.coordinators.get() else {
            return Vec::new();
        };
        join_all(coordinators.iter().map(CoordinatorHandle::status))
            .await
            .into_iter()
            .filter_map(Result::ok)
            .collect()
    }

    // ── Process-wide instance ─────────────────────────────────────────────

    /// The shared pool, created with `init` if none exists.
    ///
    /// Cancels a pending [`Self::reset_instance`].
    pub fn get_instance(init: impl FnOnce() -> Arc<WorkerPool>) -> Arc<WorkerPool> {
        let mut slot = instance();
        if slot.reset_pending {
            slot.reset_pending = false;
            slot.generation += 1;
            info!("Pending worker pool reset cancelled");
        }
        Arc::clone(slot.pool.get_or_insert_with(init))
    }

    /// The shared pool, if one exists.
    pub fn current_instance() -> Option<Arc<WorkerPool>> {
        instance().pool.clone()
    }

    /// Terminate and forget the shared pool after the grace window.
    ///
    /// Repeated calls inside the window schedule a single reset. Outside a
    /// tokio runtime the reset happens immediately.
    pub fn reset_instance() {
        let (generation, grace) = {
            let mut slot = instance();
            let Some(pool) = slot.pool.as_ref() else {
                return;
            };
            if slot.reset_pending {
                debug!("Worker pool reset already scheduled");
                return;
            }
            let grace = pool.config.reset_grace();
            slot.reset_pending = true;
            slot.generation += 1;
            (slot.generation, grace)
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    tokio::time::sleep(grace).await;
                    finish_reset(generation);
                });
            }
            Err(_) => finish_reset(generation),
        }
    }
}

enum Claim {
    Reused(WorkerHandle),
    Create,
    Full,
}

/// A claimed `starting` slot. Released on drop unless settled, so an
/// acquisition cancelled mid-creation gives its capacity back.
struct StartingSlot<'a> {
    pool: &'a WorkerPool,
    settled: bool,
}

impl<'a> StartingSlot<'a> {
    fn new(pool: &'a WorkerPool) -> Self {
        Self {
            pool,
            settled: false,
        }
    }

    fn settle(mut self, state: &mut PoolState) {
        state.starting -= 1;
        self.settled = true;
    }
}

impl Drop for StartingSlot<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        {
            let mut state = self.pool.state();
            state.starting = state.starting.saturating_sub(1);
        }
        debug!("Worker creation cancelled, slot released");
        self.pool.available.notify_one();
    }
}

#[derive(Default)]
struct Instance {
    pool: Option<Arc<WorkerPool>>,
    generation: u64,
    reset_pending: bool,
}

static INSTANCE: Lazy<Mutex<Instance>> = Lazy::new(Mutex::default);

fn instance() -> MutexGuard<'static, Instance> {
    INSTANCE.lock().unwrap_or_else(PoisonError::into_inner)
}

fn finish_reset(generation: u64) {
    let pool = {
        let mut slot = instance();
        if !slot.reset_pending || slot.generation != generation {
            return;
        }
        slot.reset_pending = false;
        slot.pool.take()
    };
    if let Some(pool) = pool {
        info!("Resetting shared worker pool");
        pool.terminate_all();
    }
}
