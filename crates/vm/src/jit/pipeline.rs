//! The asynchronous compilation pipeline.
//!
//! Requests queue up on [`RuntimeShared`]; a single worker thread drains
//! them, drives the toolchain, registers artifacts, and activates units. In
//! wait mode the same drain runs inline on the interpreter thread, which
//! makes compilation fully synchronous and deterministic.
//!
//! When a drain finds several requests and the cache has no room for them
//! individually, the batch is compacted: every body is lowered into one
//! bundle, built into one artifact, and registered as one cache entry.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::errors::{CompileError, ToolchainError};
use crate::jit::cache::{ArtifactId, EvictedArtifact};
use crate::jit::codegen::{self, CompileRequest};
use crate::jit::events::{JitEvent, duration_ms};
use crate::jit::runtime::RuntimeShared;
use crate::jit::translation::{Translation, TranslationBundle};
use crate::jit::types::JitMetrics;
use crate::jit::unit::{InlineDep, LoadedUnit, Unit, UnitKey};

/// Handle to the compiler thread. Dropping it closes the wake channel and
/// joins the thread.
#[derive(Debug)]
pub(crate) struct Worker {
    wake: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    #[expect(clippy::expect_used, reason = "thread spawn failure is unrecoverable")]
    pub(crate) fn start(shared: Arc<RuntimeShared>) -> Self {
        let (wake, signal) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("jit-compiler".to_owned())
            .spawn(move || {
                while signal.recv().is_ok() {
                    process_pending(&shared);
                }
            })
            .expect("failed to spawn JIT compiler thread");
        Worker {
            wake: Some(wake),
            handle: Some(handle),
        }
    }

    pub(crate) fn wake(&self) {
        if let Some(wake) = &self.wake {
            let _ = wake.send(());
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.wake.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("JIT compiler thread panicked");
            }
        }
    }
}

/// Remove a file, keeping quiet when it is already gone.
pub(crate) fn unlink_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != io::ErrorKind::NotFound {
            tracing::debug!("could not remove {}: {err}", path.display());
        }
    }
}

fn temp_paths(shared: &RuntimeShared, kind: char) -> (PathBuf, PathBuf) {
    let serial = shared.file_serial.fetch_add(1, Ordering::AcqRel);
    let pid = std::process::id();
    let stem = format!("_kestrel_p{pid}{kind}{serial}");
    let source = shared
        .temp_dir
        .join(format!("{stem}.{}", shared.toolchain.source_extension()));
    let artifact = shared
        .temp_dir
        .join(format!("{stem}.{}", shared.toolchain.artifact_extension()));
    (source, artifact)
}

/// Drain and compile everything currently queued.
///
/// Paused, shutting down, or disengaged runtimes leave the queue alone;
/// resume drains whatever accumulated.
pub(crate) fn process_pending(shared: &Arc<RuntimeShared>) {
    if shared.paused.load(Ordering::Acquire)
        || shared.shutting_down.load(Ordering::Acquire)
        || !shared.engaged()
    {
        return;
    }

    let pending: Vec<CompileRequest> = {
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let mut queue = shared.queue.lock().unwrap();
        queue.drain(..).collect()
    };
    if pending.is_empty() {
        return;
    }

    // Claim each request's unit; a request whose unit was cancelled or
    // replaced while queued is dropped here.
    let mut batch: Vec<(Arc<Unit>, CompileRequest)> = Vec::new();
    {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let units = shared.units.read().unwrap();
        for request in pending {
            let Some(unit) = units.get(&request.unit) else {
                continue;
            };
            if unit.try_begin_compile() {
                batch.push((Arc::clone(unit), request));
            } else {
                tracing::debug!(
                    unit = unit.label.as_str(),
                    state = <&'static str>::from(unit.state()),
                    "dropping queued request"
                );
            }
        }
    }
    if batch.is_empty() {
        return;
    }

    if let Err(err) = fs::create_dir_all(&shared.temp_dir) {
        shared.disable(&format!(
            "cannot create temp dir {}: {err}",
            shared.temp_dir.display()
        ));
        for (unit, _) in &batch {
            unit.fail();
            JitMetrics::bump(&shared.metrics.failed_units);
            shared.events.emit(JitEvent::Failure {
                unit: unit.label.clone(),
                reason: err.to_string(),
            });
        }
        return;
    }

    let would_hold = shared.cache.len().saturating_add(batch.len());
    if batch.len() >= 2 && would_hold > shared.cache.capacity() {
        compact_batch(shared, batch);
    } else {
        for (unit, request) in batch {
            compile_one(shared, &unit, request);
        }
    }
}

/// Lower one request, recording failure on the unit if it cannot be.
fn generate_for(
    shared: &RuntimeShared,
    unit: &Unit,
    request: &CompileRequest,
) -> Option<Translation> {
    match codegen::generate(request) {
        Ok(translation) => Some(translation),
        Err(CompileError::Unsupported { insn }) => {
            unit.fail();
            JitMetrics::bump(&shared.metrics.unsupported_units);
            shared.events.emit(JitEvent::Unsupported {
                unit: unit.label.clone(),
                insn,
            });
            None
        }
        Err(other) => {
            unit.fail();
            JitMetrics::bump(&shared.metrics.failed_units);
            shared.events.emit(JitEvent::Failure {
                unit: unit.label.clone(),
                reason: other.to_string(),
            });
            None
        }
    }
}

/// Write the bundle, run the toolchain, and load the artifact back.
/// Partial files are removed on failure; the source is removed on success
/// unless temps are kept.
fn build_artifact(
    shared: &RuntimeShared,
    bundle: TranslationBundle,
    source: &Path,
    artifact: &Path,
) -> Result<Vec<Translation>, ToolchainError> {
    let json = bundle.to_json()?;
    fs::write(source, json)?;
    if let Err(err) = shared.toolchain.compile(source, artifact) {
        unlink_quietly(artifact);
        if !shared.config.save_temps {
            unlink_quietly(source);
        }
        return Err(err);
    }
    match shared.toolchain.load(artifact) {
        Ok(translations) => {
            if !shared.config.save_temps {
                unlink_quietly(source);
            }
            Ok(translations)
        }
        Err(err) => {
            unlink_quietly(artifact);
            if !shared.config.save_temps {
                unlink_quietly(source);
            }
            Err(err)
        }
    }
}

fn fail_with(shared: &RuntimeShared, unit: &Unit, err: &ToolchainError) {
    unit.fail();
    JitMetrics::bump(&shared.metrics.failed_units);
    // Compiler stderr is suppressed below verbosity 2.
    let reason = match err {
        ToolchainError::Exit { stderr, .. } if shared.config.verbose >= 2 && !stderr.is_empty() => {
            format!("{err}: {stderr}")
        }
        _ => err.to_string(),
    };
    shared.events.emit(JitEvent::Failure {
        unit: unit.label.clone(),
        reason,
    });
}

/// Retire artifacts the cache evicted: unload, mark their units, and unlink
/// owned files.
fn finalize_evictions(shared: &RuntimeShared, evicted: &[EvictedArtifact]) {
    if evicted.is_empty() {
        return;
    }
    {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let units = shared.units.read().unwrap();
        for artifact in evicted {
            shared.toolchain.unload(&artifact.path);
            for key in &artifact.units {
                if let Some(unit) = units.get(key) {
                    unit.mark_unloaded();
                }
            }
            JitMetrics::bump(&shared.metrics.evicted_artifacts);
        }
    }
    for artifact in evicted {
        if artifact.owned && !shared.config.save_temps {
            unlink_quietly(&artifact.path);
            if let Some(source) = &artifact.source_path {
                unlink_quietly(source);
            }
        }
    }
}

/// Drop an artifact registered moments ago whose activation was rejected.
fn discard_registered(shared: &RuntimeShared, id: ArtifactId) {
    if let Some(artifact) = shared.cache.remove(id) {
        shared.toolchain.unload(&artifact.path);
        if artifact.owned && !shared.config.save_temps {
            unlink_quietly(&artifact.path);
            if let Some(source) = &artifact.source_path {
                unlink_quietly(source);
            }
        }
    }
}

fn register_growth(shared: &RuntimeShared, grew_to: Option<usize>) {
    if let Some(new_capacity) = grew_to {
        JitMetrics::bump(&shared.metrics.cache_growths);
        shared.events.emit(JitEvent::CacheGrowth { new_capacity });
    }
}

fn emit_inline_events(
    shared: &RuntimeShared,
    request: &CompileRequest,
    caller: &str,
    deps: &[InlineDep],
) {
    for dep in deps {
        if let InlineDep::CalleeVersion { callee, .. } = dep {
            if let Some(snapshot) = request
                .callees
                .values()
                .find(|snapshot| snapshot.method == *callee)
            {
                shared.events.emit(JitEvent::Inline {
                    caller: caller.to_owned(),
                    callee: snapshot.label.clone(),
                });
            }
        }
    }
}

fn compile_one(shared: &Arc<RuntimeShared>, unit: &Arc<Unit>, request: CompileRequest) {
    let started = Instant::now();
    let Some(translation) = generate_for(shared, unit, &request) else {
        return;
    };
    let deps = translation.deps.clone();
    let (source, artifact) = temp_paths(shared, 'u');
    let loaded = match build_artifact(
        shared,
        TranslationBundle::new(vec![translation]),
        &source,
        &artifact,
    ) {
        Ok(translations) => translations,
        Err(err) => {
            fail_with(shared, unit, &err);
            return;
        }
    };
    let Some(translation) = loaded.into_iter().find(|t| t.unit == unit.key) else {
        unlink_quietly(&artifact);
        fail_with(
            shared,
            unit,
            &ToolchainError::Malformed(format!("artifact is missing unit {}", unit.label)),
        );
        return;
    };

    let source_kept = shared.config.save_temps.then(|| source.clone());
    let outcome = shared
        .cache
        .register(artifact.clone(), source_kept, vec![unit.key]);
    finalize_evictions(shared, &outcome.evicted);
    register_growth(shared, outcome.grew_to);

    let entry = Arc::new(LoadedUnit {
        key: unit.key,
        translation,
        artifact: outcome.id,
        pins: outcome.pins,
        epoch: shared.cancel_epoch.load(Ordering::Acquire),
    });
    if unit.activate(entry, deps.clone()) {
        JitMetrics::bump(&shared.metrics.compiled_units);
        shared.events.emit(JitEvent::Success {
            unit: unit.label.clone(),
            artifact,
            duration_ms: duration_ms(started.elapsed()),
        });
        emit_inline_events(shared, &request, &unit.label, &deps);
    } else {
        // Went stale while compiling; nothing may publish the entry.
        discard_registered(shared, outcome.id);
    }
}

fn compact_batch(shared: &Arc<RuntimeShared>, batch: Vec<(Arc<Unit>, CompileRequest)>) {
    let started = Instant::now();
    let mut translations: Vec<Translation> = Vec::new();
    let mut members: Vec<(Arc<Unit>, Vec<InlineDep>, CompileRequest)> = Vec::new();
    for (unit, request) in batch {
        if let Some(translation) = generate_for(shared, &unit, &request) {
            members.push((unit, translation.deps.clone(), request));
            translations.push(translation);
        }
    }
    // Not enough survivors to share an artifact.
    if members.len() < 2 {
        if let Some((unit, _, request)) = members.into_iter().next() {
            compile_one(shared, &unit, request);
        }
        return;
    }

    let count = members.len();
    let keys: Vec<UnitKey> = members.iter().map(|(unit, ..)| unit.key).collect();
    let (source, artifact) = temp_paths(shared, 'c');
    let loaded = match build_artifact(
        shared,
        TranslationBundle::new(translations),
        &source,
        &artifact,
    ) {
        Ok(translations) => translations,
        Err(err) => {
            for (unit, ..) in &members {
                fail_with(shared, unit, &err);
            }
            return;
        }
    };

    let source_kept = shared.config.save_temps.then(|| source.clone());
    let outcome = shared.cache.register(artifact.clone(), source_kept, keys);
    finalize_evictions(shared, &outcome.evicted);
    register_growth(shared, outcome.grew_to);

    let epoch = shared.cancel_epoch.load(Ordering::Acquire);
    let mut activated: usize = 0;
    for (unit, deps, request) in &members {
        let Some(translation) = loaded.iter().find(|t| t.unit == unit.key) else {
            continue;
        };
        let entry = Arc::new(LoadedUnit {
            key: unit.key,
            translation: translation.clone(),
            artifact: outcome.id,
            pins: Arc::clone(&outcome.pins),
            epoch,
        });
        if unit.activate(entry, deps.clone()) {
            activated = activated.saturating_add(1);
            JitMetrics::bump(&shared.metrics.compiled_units);
            shared.events.emit(JitEvent::Success {
                unit: unit.label.clone(),
                artifact: artifact.clone(),
                duration_ms: duration_ms(started.elapsed()),
            });
            emit_inline_events(shared, request, &unit.label, deps);
        }
    }
    if activated == 0 {
        discard_registered(shared, outcome.id);
        return;
    }
    JitMetrics::bump(&shared.metrics.compactions);
    shared.events.emit(JitEvent::Compaction {
        count,
        artifact,
        duration_ms: duration_ms(started.elapsed()),
    });
}
