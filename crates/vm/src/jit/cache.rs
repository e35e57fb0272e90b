//! Bounded artifact cache.
//!
//! Artifacts enter in activation order and leave oldest-first when the cache
//! is full. An artifact whose code may be running (pinned) is never evicted;
//! if every resident artifact is pinned, the cache grows instead, and the
//! capacity never shrinks back. The cache only tracks files; unlinking what
//! eviction returns is the caller's job, so the decision and the filesystem
//! work stay separable.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;

use crate::jit::unit::UnitKey;

/// Cache-local artifact handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArtifactId(pub u64);

/// Count of native frames currently inside an artifact.
#[derive(Debug, Default)]
pub struct PinCount(AtomicU32);

impl PinCount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

/// RAII pin; dropping it releases the artifact for eviction.
#[derive(Debug)]
pub struct ExecutionPin(Arc<PinCount>);

impl ExecutionPin {
    /// Take a pin for the duration of one native call.
    pub fn acquire(pins: &Arc<PinCount>) -> ExecutionPin {
        pins.0.fetch_add(1, Ordering::AcqRel);
        ExecutionPin(Arc::clone(pins))
    }
}

impl Drop for ExecutionPin {
    fn drop(&mut self) {
        // Decrement without ever passing zero.
        let _ = self
            .0
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

#[derive(Debug)]
struct Artifact {
    path: PathBuf,
    source_path: Option<PathBuf>,
    units: Vec<UnitKey>,
    /// Whether this process created the file and may unlink it. False for
    /// artifacts inherited across a fork.
    owned: bool,
    pins: Arc<PinCount>,
}

/// An artifact the cache gave up; the caller owns the cleanup.
#[derive(Debug)]
pub struct EvictedArtifact {
    pub id: ArtifactId,
    pub path: PathBuf,
    pub source_path: Option<PathBuf>,
    pub units: Vec<UnitKey>,
    pub owned: bool,
}

/// Result of registering one artifact.
#[derive(Debug)]
pub struct RegisterOutcome {
    pub id: ArtifactId,
    pub pins: Arc<PinCount>,
    /// Artifacts evicted to make room, oldest first.
    pub evicted: Vec<EvictedArtifact>,
    /// Set when no unpinned artifact could be evicted and the capacity grew.
    pub grew_to: Option<usize>,
}

#[derive(Debug)]
struct CacheInner {
    artifacts: FxHashMap<ArtifactId, Artifact>,
    /// Activation order, front is oldest.
    order: VecDeque<ArtifactId>,
    capacity: usize,
    next_id: u64,
}

/// The cache itself. Interior locking so the worker thread registers while
/// the interpreter dispatches.
#[derive(Debug)]
pub struct ArtifactCache {
    inner: RwLock<CacheInner>,
}

impl ArtifactCache {
    pub fn new(capacity: usize) -> Self {
        ArtifactCache {
            inner: RwLock::new(CacheInner {
                artifacts: FxHashMap::default(),
                order: VecDeque::new(),
                capacity: capacity.max(1),
                next_id: 0,
            }),
        }
    }

    /// Insert a freshly compiled artifact, evicting or growing as needed.
    #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
    pub fn register(
        &self,
        path: PathBuf,
        source_path: Option<PathBuf>,
        units: Vec<UnitKey>,
    ) -> RegisterOutcome {
        let mut inner = self.inner.write().unwrap();

        let mut evicted = Vec::new();
        while inner.artifacts.len() >= inner.capacity {
            match take_oldest_unpinned(&mut inner) {
                Some(artifact) => evicted.push(artifact),
                None => break,
            }
        }
        let grew_to = if inner.artifacts.len() >= inner.capacity {
            inner.capacity = inner.artifacts.len().saturating_add(1);
            Some(inner.capacity)
        } else {
            None
        };

        let id = ArtifactId(inner.next_id);
        inner.next_id = inner.next_id.wrapping_add(1);
        let pins = Arc::new(PinCount::new());
        inner.artifacts.insert(
            id,
            Artifact {
                path,
                source_path,
                units,
                owned: true,
                pins: Arc::clone(&pins),
            },
        );
        inner.order.push_back(id);

        RegisterOutcome {
            id,
            pins,
            evicted,
            grew_to,
        }
    }

    /// Drop one artifact regardless of position, e.g. when activation was
    /// rejected after a mid-compile invalidation.
    #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
    pub fn remove(&self, id: ArtifactId) -> Option<EvictedArtifact> {
        let mut inner = self.inner.write().unwrap();
        let artifact = inner.artifacts.remove(&id)?;
        inner.order.retain(|candidate| *candidate != id);
        Some(into_evicted(id, artifact))
    }

    /// Drain everything, oldest first.
    #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
    pub fn remove_all(&self) -> Vec<EvictedArtifact> {
        let mut inner = self.inner.write().unwrap();
        let order: Vec<ArtifactId> = inner.order.drain(..).collect();
        order
            .into_iter()
            .filter_map(|id| inner.artifacts.remove(&id).map(|a| into_evicted(id, a)))
            .collect()
    }

    /// Copy for a forked child: same files, nothing owned, no pins carried.
    #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
    pub fn fork_clone(&self) -> ArtifactCache {
        let inner = self.inner.read().unwrap();
        let artifacts = inner
            .artifacts
            .iter()
            .map(|(id, artifact)| {
                (
                    *id,
                    Artifact {
                        path: artifact.path.clone(),
                        source_path: artifact.source_path.clone(),
                        units: artifact.units.clone(),
                        owned: false,
                        pins: Arc::new(PinCount::new()),
                    },
                )
            })
            .collect();
        ArtifactCache {
            inner: RwLock::new(CacheInner {
                artifacts,
                order: inner.order.clone(),
                capacity: inner.capacity,
                next_id: inner.next_id,
            }),
        }
    }

    /// Pin handle for an artifact still resident, e.g. when rebuilding
    /// entries after a fork.
    #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
    pub fn pins_of(&self, id: ArtifactId) -> Option<Arc<PinCount>> {
        let inner = self.inner.read().unwrap();
        inner.artifacts.get(&id).map(|a| Arc::clone(&a.pins))
    }

    #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
    pub fn capacity(&self) -> usize {
        self.inner.read().unwrap().capacity
    }
}

fn take_oldest_unpinned(inner: &mut CacheInner) -> Option<EvictedArtifact> {
    let position = inner.order.iter().position(|id| {
        inner
            .artifacts
            .get(id)
            .is_some_and(|artifact| artifact.pins.count() == 0)
    })?;
    let id = inner.order.remove(position)?;
    let artifact = inner.artifacts.remove(&id)?;
    Some(into_evicted(id, artifact))
}

fn into_evicted(id: ArtifactId, artifact: Artifact) -> EvictedArtifact {
    EvictedArtifact {
        id,
        path: artifact.path,
        source_path: artifact.source_path,
        units: artifact.units,
        owned: artifact.owned,
    }
}
