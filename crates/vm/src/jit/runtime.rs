//! Runtime coordination: promotion, dispatch, invalidation, fork, shutdown.
//!
//! [`JitRuntime`] is owned by the interpreter and holds the profiler plus an
//! [`Arc`] of the state shared with the compiler worker. Everything the
//! worker touches lives behind that shared handle; everything only the
//! interpreter touches (the profiler, the worker handle itself) stays plain.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::hooks::TraceKind;
use crate::jit::cache::ArtifactCache;
use crate::jit::codegen::CompileRequest;
use crate::jit::counter::CallCounter;
use crate::jit::events::{EventLog, JitEvent};
use crate::jit::pipeline::{self, Worker};
use crate::jit::toolchain::Toolchain;
use crate::jit::types::{JitConfig, JitMetrics, MetricsSnapshot, UnitState};
use crate::jit::unit::{LoadedUnit, Unit, UnitKey};
use crate::method::MethodId;

/// State shared between the interpreter and the worker thread.
pub(crate) struct RuntimeShared {
    pub(crate) config: JitConfig,
    pub(crate) toolchain: Arc<dyn Toolchain>,
    pub(crate) units: RwLock<FxHashMap<UnitKey, Arc<Unit>>>,
    pub(crate) queue: Mutex<VecDeque<CompileRequest>>,
    pub(crate) cache: ArtifactCache,
    pub(crate) events: EventLog,
    pub(crate) metrics: JitMetrics,
    /// Bumped on every global cancellation; entries activated under an older
    /// epoch are never dispatched and bail out at their next sync point.
    pub(crate) cancel_epoch: AtomicU64,
    pub(crate) paused: AtomicBool,
    pub(crate) line_trace_active: AtomicBool,
    pub(crate) disabled: AtomicBool,
    pub(crate) shutting_down: AtomicBool,
    pub(crate) file_serial: AtomicU64,
    pub(crate) temp_dir: PathBuf,
}

impl std::fmt::Debug for RuntimeShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeShared")
            .field("toolchain", &self.toolchain.name())
            .field("temp_dir", &self.temp_dir)
            .field("paused", &self.paused)
            .field("disabled", &self.disabled)
            .finish_non_exhaustive()
    }
}

impl RuntimeShared {
    /// Whether the tier takes part in execution at all right now.
    pub(crate) fn engaged(&self) -> bool {
        self.config.enabled
            && !self.disabled.load(Ordering::Acquire)
            && !self.line_trace_active.load(Ordering::Acquire)
    }

    /// Permanently stop compiling and dispatching in this process.
    pub(crate) fn disable(&self, why: &str) {
        if !self.disabled.swap(true, Ordering::AcqRel) {
            tracing::warn!("JIT disabled: {why}");
        }
    }
}

/// A recompilation the interpreter should build a fresh request for.
#[derive(Debug)]
pub struct RecompilePlan {
    pub key: UnitKey,
    /// Callees the next rendition must not inline.
    pub blocklist: FxHashSet<MethodId>,
    pub reason: String,
}

/// The method-JIT tier.
#[derive(Debug)]
pub struct JitRuntime {
    shared: Arc<RuntimeShared>,
    profiler: CallCounter,
    worker: Option<Worker>,
}

impl JitRuntime {
    pub fn new(config: JitConfig, toolchain: Arc<dyn Toolchain>) -> Self {
        let config = config.validated();
        let temp_dir = config.resolved_temp_dir();
        let profiler = CallCounter::new(config.call_threshold);
        let shared = Arc::new(RuntimeShared {
            cache: ArtifactCache::new(config.max_cache),
            events: EventLog::new(config.max_retained_events, config.verbose),
            config,
            toolchain,
            units: RwLock::new(FxHashMap::default()),
            queue: Mutex::new(VecDeque::new()),
            metrics: JitMetrics::new(),
            cancel_epoch: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            line_trace_active: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            file_serial: AtomicU64::new(0),
            temp_dir,
        });
        JitRuntime {
            shared,
            profiler,
            worker: None,
        }
    }

    pub fn config(&self) -> &JitConfig {
        &self.shared.config
    }

    pub(crate) fn shared(&self) -> &Arc<RuntimeShared> {
        &self.shared
    }

    pub(crate) fn cancel_epoch(&self) -> u64 {
        self.shared.cancel_epoch.load(Ordering::Acquire)
    }

    /// Count one call of `key` and decide whether to promote it.
    ///
    /// `Some(blocklist)` means the caller must build a [`CompileRequest`]
    /// (honoring the blocklist) and [`submit`](Self::submit) it. `None` means
    /// no promotion: below threshold, tier off, or a unit for the key already
    /// exists in a state that excludes re-queueing.
    pub fn begin_promotion(&mut self, key: UnitKey, label: &str) -> Option<FxHashSet<MethodId>> {
        if !self.shared.engaged() {
            return None;
        }
        self.profiler.observe(key);
        if !self.profiler.promotable(key) {
            return None;
        }

        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let mut units = self.shared.units.write().unwrap();
        let blocklist = match units.get(&key) {
            Some(existing) => match existing.state() {
                // Retired renditions may be replaced; everything else is
                // either in flight, live, or terminally failed.
                UnitState::Stale | UnitState::Unloaded => existing.blocklist.clone(),
                _ => return None,
            },
            None => FxHashSet::default(),
        };
        let unit = Arc::new(Unit::new(key, label.to_owned(), blocklist.clone()));
        unit.try_begin_queue();
        units.insert(key, unit);
        Some(blocklist)
    }

    /// Queue a compile request. In wait mode the queue is drained on the
    /// spot; otherwise the worker thread is started on first use and woken.
    pub fn submit(&mut self, request: CompileRequest) {
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        self.shared.queue.lock().unwrap().push_back(request);
        if self.shared.config.wait {
            pipeline::process_pending(&self.shared);
        } else {
            self.ensure_worker();
            if let Some(worker) = &self.worker {
                worker.wake();
            }
        }
    }

    fn ensure_worker(&mut self) {
        if self.worker.is_none() && !self.shared.config.wait {
            self.worker = Some(Worker::start(Arc::clone(&self.shared)));
        }
    }

    /// Native entry for `key`, if one is live in the current epoch.
    pub fn dispatch(&self, key: UnitKey) -> Option<(Arc<Unit>, Arc<LoadedUnit>)> {
        if !self.shared.engaged() {
            return None;
        }
        let unit = {
            #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
            let units = self.shared.units.read().unwrap();
            Arc::clone(units.get(&key)?)
        };
        if unit.state() != UnitState::Active {
            return None;
        }
        let loaded = unit.entry()?;
        if loaded.epoch != self.cancel_epoch() {
            return None;
        }
        Some((unit, loaded))
    }

    /// Stop compiling; promotions keep queueing.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    /// Resume compiling and drain whatever queued up while paused.
    pub fn resume(&mut self) {
        self.shared.paused.store(false, Ordering::Release);
        if self.shared.config.wait {
            pipeline::process_pending(&self.shared);
        } else {
            let queued = {
                #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
                let queue = self.shared.queue.lock().unwrap();
                !queue.is_empty()
            };
            if queued {
                self.ensure_worker();
                if let Some(worker) = &self.worker {
                    worker.wake();
                }
            }
        }
    }

    /// A method was redefined: retire its old rendition and every active
    /// unit that inlined it. Returned plans must be resubmitted by the
    /// caller with freshly snapshotted requests.
    pub fn on_method_redefined(
        &mut self,
        method: MethodId,
        old_version: u64,
        method_name: &str,
    ) -> Vec<RecompilePlan> {
        let mut plans = Vec::new();
        {
            #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
            let units = self.shared.units.read().unwrap();

            let old_key = UnitKey {
                method,
                version: old_version,
            };
            if let Some(unit) = units.get(&old_key) {
                if unit.mark_stale().is_some() {
                    JitMetrics::bump(&self.shared.metrics.invalidated_units);
                    self.shared.events.emit(JitEvent::Invalidate {
                        unit: unit.label.clone(),
                        trigger: "method redefined".to_owned(),
                    });
                }
            }

            for unit in units.values() {
                if unit.state() == UnitState::Active
                    && unit.depends_on_method(method)
                    && unit.mark_stale().is_some()
                {
                    JitMetrics::bump(&self.shared.metrics.invalidated_units);
                    let mut blocklist = unit.blocklist.clone();
                    blocklist.insert(method);
                    plans.push(RecompilePlan {
                        key: unit.key,
                        blocklist,
                        reason: format!("inlined method redefined: {method_name}"),
                    });
                }
            }
        }
        // Pending requests lose their snapshot of the method so nothing
        // compiles against the retired body.
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let mut queue = self.shared.queue.lock().unwrap();
        for request in queue.iter_mut() {
            request.callees.retain(|_, snapshot| snapshot.method != method);
        }
        plans
    }

    /// A constant slot was rebound: retire every active unit that folded it.
    pub fn on_const_rebound(&mut self, slot: u16) -> Vec<RecompilePlan> {
        let mut plans = Vec::new();
        {
            #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
            let units = self.shared.units.read().unwrap();
            for unit in units.values() {
                if unit.state() == UnitState::Active
                    && unit.depends_on_const(slot)
                    && unit.mark_stale().is_some()
                {
                    JitMetrics::bump(&self.shared.metrics.invalidated_units);
                    plans.push(RecompilePlan {
                        key: unit.key,
                        blocklist: unit.blocklist.clone(),
                        reason: "bound constant changed".to_owned(),
                    });
                }
            }
        }
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let mut queue = self.shared.queue.lock().unwrap();
        for request in queue.iter_mut() {
            request.consts.remove(&slot);
        }
        plans
    }

    /// Replace the retired unit and queue its fresh request.
    pub fn resubmit(&mut self, plan: RecompilePlan, request: CompileRequest) {
        {
            #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
            let mut units = self.shared.units.write().unwrap();
            let unit = Arc::new(Unit::new(plan.key, request.label.clone(), plan.blocklist));
            unit.try_begin_queue();
            units.insert(plan.key, unit);
        }
        self.shared.events.emit(JitEvent::Recompile {
            unit: request.label.clone(),
            reason: plan.reason,
        });
        JitMetrics::bump(&self.shared.metrics.recompile_requests);
        self.submit(request);
    }

    /// React to a trace hook flip. Enabling line tracing cancels everything
    /// at once; class-definition tracing never touches generated code.
    pub fn on_trace_changed(&mut self, kind: TraceKind, enabled: bool) {
        match kind {
            TraceKind::ClassDefine => {}
            TraceKind::Line => {
                if enabled {
                    self.shared.line_trace_active.store(true, Ordering::Release);
                    self.cancel_all("line trace hook enabled");
                } else {
                    self.shared
                        .line_trace_active
                        .store(false, Ordering::Release);
                }
            }
        }
    }

    fn cancel_all(&mut self, trigger: &str) {
        self.shared.cancel_epoch.fetch_add(1, Ordering::AcqRel);
        let mut cancelled: u64 = 0;
        {
            #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
            let units = self.shared.units.read().unwrap();
            for unit in units.values() {
                if unit.mark_stale().is_some() {
                    cancelled = cancelled.saturating_add(1);
                }
            }
        }
        {
            #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
            let mut queue = self.shared.queue.lock().unwrap();
            queue.clear();
        }
        JitMetrics::add(&self.shared.metrics.invalidated_units, cancelled);
        self.shared.events.emit(JitEvent::Cancel {
            trigger: trigger.to_owned(),
        });
    }

    /// Runtime for a forked child.
    ///
    /// The child keeps every loaded entry but owns none of the files, so its
    /// cleanup never unlinks artifacts the parent still maps. In-flight work
    /// is dropped; the child re-promotes on its own counters if it keeps
    /// calling. Events and metrics start from zero.
    pub fn fork_inherited(&self) -> JitRuntime {
        let cache = self.shared.cache.fork_clone();
        let mut child_units: FxHashMap<UnitKey, Arc<Unit>> = FxHashMap::default();
        {
            #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
            let units = self.shared.units.read().unwrap();
            for (key, unit) in units.iter() {
                let clone = Arc::new(Unit::new(*key, unit.label.clone(), unit.blocklist.clone()));
                match unit.state() {
                    UnitState::Active => {
                        let Some(loaded) = unit.entry() else { continue };
                        let Some(pins) = cache.pins_of(loaded.artifact) else {
                            continue;
                        };
                        clone.try_begin_queue();
                        clone.try_begin_compile();
                        let entry = Arc::new(LoadedUnit {
                            key: *key,
                            translation: loaded.translation.clone(),
                            artifact: loaded.artifact,
                            pins,
                            epoch: loaded.epoch,
                        });
                        clone.activate(entry, unit.deps());
                    }
                    UnitState::Stale => {
                        clone.try_begin_queue();
                        clone.mark_stale();
                    }
                    UnitState::Unloaded => {
                        clone.try_begin_queue();
                        clone.mark_stale();
                        clone.mark_unloaded();
                    }
                    UnitState::Failed => {
                        clone.try_begin_queue();
                        clone.try_begin_compile();
                        clone.fail();
                    }
                    // In-flight work does not cross the fork.
                    UnitState::Fresh | UnitState::Queued | UnitState::Compiling => continue,
                }
                child_units.insert(*key, clone);
            }
        }

        let shared = Arc::new(RuntimeShared {
            config: self.shared.config.clone(),
            toolchain: Arc::clone(&self.shared.toolchain),
            units: RwLock::new(child_units),
            queue: Mutex::new(VecDeque::new()),
            cache,
            events: EventLog::new(
                self.shared.config.max_retained_events,
                self.shared.config.verbose,
            ),
            metrics: JitMetrics::new(),
            cancel_epoch: AtomicU64::new(self.cancel_epoch()),
            paused: AtomicBool::new(self.shared.paused.load(Ordering::Acquire)),
            line_trace_active: AtomicBool::new(
                self.shared.line_trace_active.load(Ordering::Acquire),
            ),
            disabled: AtomicBool::new(self.shared.disabled.load(Ordering::Acquire)),
            shutting_down: AtomicBool::new(false),
            file_serial: AtomicU64::new(self.shared.file_serial.load(Ordering::Acquire)),
            temp_dir: self.shared.temp_dir.clone(),
        });
        JitRuntime {
            shared,
            profiler: self.profiler.clone(),
            worker: None,
        }
    }

    /// Stop the worker, drop the queue, and retire every artifact. Owned
    /// files are unlinked unless temps are being kept. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.worker.take();
        {
            #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
            let mut queue = self.shared.queue.lock().unwrap();
            queue.clear();
        }
        let drained = self.shared.cache.remove_all();
        if !drained.is_empty() {
            #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
            let units = self.shared.units.read().unwrap();
            for artifact in &drained {
                self.shared.toolchain.unload(&artifact.path);
                for key in &artifact.units {
                    if let Some(unit) = units.get(key) {
                        unit.mark_stale();
                        unit.mark_unloaded();
                    }
                }
            }
        }
        for artifact in &drained {
            if artifact.owned && !self.shared.config.save_temps {
                pipeline::unlink_quietly(&artifact.path);
                if let Some(source) = &artifact.source_path {
                    pipeline::unlink_quietly(source);
                }
            }
        }
        if self.shared.config.enabled {
            self.shared.events.emit(JitEvent::Finish);
        }
    }

    pub fn events(&self) -> Vec<JitEvent> {
        self.shared.events.snapshot()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn cache_len(&self) -> usize {
        self.shared.cache.len()
    }

    pub fn cache_capacity(&self) -> usize {
        self.shared.cache.capacity()
    }

    pub fn unit_state(&self, key: UnitKey) -> Option<UnitState> {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let units = self.shared.units.read().unwrap();
        units.get(&key).map(|unit| unit.state())
    }

    pub fn queue_len(&self) -> usize {
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let queue = self.shared.queue.lock().unwrap();
        queue.len()
    }
}

impl Drop for JitRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
