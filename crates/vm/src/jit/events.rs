//! Observable JIT lifecycle events.
//!
//! The rendered shapes below are a stable contract: external tooling scrapes
//! them from the log stream, and the test suite asserts them verbatim. Every
//! event is recorded in a bounded ring regardless of verbosity; verbosity
//! only gates what reaches the `tracing` subscriber.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

/// One JIT lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub enum JitEvent {
    /// A unit was compiled, loaded, and activated.
    Success {
        /// Unit label (method name).
        unit: String,
        /// Artifact the native entry lives in.
        artifact: PathBuf,
        /// Wall-clock compile time in milliseconds.
        duration_ms: f64,
    },
    /// A unit was rejected for an instruction the generator does not lower.
    Unsupported {
        /// Unit label.
        unit: String,
        /// Rejected instruction name.
        insn: &'static str,
    },
    /// The toolchain or pipeline failed for a unit.
    Failure {
        /// Unit label.
        unit: String,
        /// Failure description.
        reason: String,
    },
    /// A unit is being recompiled after a broken inline dependency.
    Recompile {
        /// Unit label.
        unit: String,
        /// What broke.
        reason: String,
    },
    /// A single unit was invalidated.
    Invalidate {
        /// Unit label.
        unit: String,
        /// What invalidated it.
        trigger: String,
    },
    /// Every active unit was cancelled at once.
    Cancel {
        /// What forced the cancellation.
        trigger: String,
    },
    /// A batch of pending units was compiled into one artifact.
    Compaction {
        /// Units in the batch.
        count: usize,
        /// The shared artifact.
        artifact: PathBuf,
        /// Wall-clock batch compile time in milliseconds.
        duration_ms: f64,
    },
    /// Eviction found no unpinned artifact and the cache grew instead.
    CacheGrowth {
        /// Capacity after growth.
        new_capacity: usize,
    },
    /// A callee was expanded into a caller during lowering.
    Inline {
        /// Caller unit label.
        caller: String,
        /// Inlined callee label.
        callee: String,
    },
    /// The runtime shut down cleanly.
    Finish,
}

impl JitEvent {
    /// Lowest verbosity at which the event reaches the log stream.
    pub fn min_verbosity(&self) -> u8 {
        match self {
            JitEvent::Failure { .. } | JitEvent::CacheGrowth { .. } => 0,
            JitEvent::Inline { .. } => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for JitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JitEvent::Success {
                unit,
                artifact,
                duration_ms,
            } => write!(
                f,
                "JIT success ({duration_ms:.1}ms): {unit} -> {}",
                artifact.display()
            ),
            JitEvent::Unsupported { unit, insn } => {
                write!(f, "JIT failure: {unit}: unsupported instruction: {insn}")
            }
            JitEvent::Failure { unit, reason } => {
                write!(f, "JIT failure: {unit}: {reason}")
            }
            JitEvent::Recompile { unit, reason } => {
                write!(f, "JIT recompile: {unit} ({reason})")
            }
            JitEvent::Invalidate { unit, trigger } => {
                write!(f, "JIT invalidate: {unit} ({trigger})")
            }
            JitEvent::Cancel { trigger } => write!(f, "JIT cancel: {trigger}"),
            JitEvent::Compaction {
                count,
                artifact,
                duration_ms,
            } => write!(
                f,
                "JIT compaction ({duration_ms:.1}ms): compacted {count} units -> {}",
                artifact.display()
            ),
            JitEvent::CacheGrowth { new_capacity } => write!(
                f,
                "No units can be unloaded -- incremented max-cache-size to {new_capacity}"
            ),
            JitEvent::Inline { caller, callee } => {
                write!(f, "JIT inline: {caller} <- {callee}")
            }
            JitEvent::Finish => write!(f, "Successful JIT finish"),
        }
    }
}

/// Milliseconds as a float, for the `(N.Nms)` rendering.
#[expect(
    clippy::arithmetic_side_effects,
    reason = "float multiply cannot overflow"
)]
pub(crate) fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Bounded event ring plus the tracing bridge.
#[derive(Debug)]
pub struct EventLog {
    ring: Mutex<VecDeque<JitEvent>>,
    capacity: usize,
    verbose: u8,
}

impl EventLog {
    pub fn new(capacity: usize, verbose: u8) -> Self {
        EventLog {
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity: capacity.max(1),
            verbose,
        }
    }

    /// Record an event and, verbosity permitting, log it.
    pub fn emit(&self, event: JitEvent) {
        if self.verbose >= event.min_verbosity() {
            match event {
                JitEvent::Failure { .. }
                | JitEvent::Unsupported { .. }
                | JitEvent::CacheGrowth { .. } => tracing::warn!("{event}"),
                _ => tracing::info!("{event}"),
            }
        }
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let mut ring = self.ring.lock().unwrap();
        while ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(event);
    }

    /// Copy of the retained events, oldest first.
    pub fn snapshot(&self) -> Vec<JitEvent> {
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let ring = self.ring.lock().unwrap();
        ring.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn rendered_shapes() {
        let success = JitEvent::Success {
            unit: "fib".to_owned(),
            artifact: Path::new("/tmp/_kestrel_p1u2.kso").to_path_buf(),
            duration_ms: 0.23,
        };
        assert_eq!(
            success.to_string(),
            "JIT success (0.2ms): fib -> /tmp/_kestrel_p1u2.kso"
        );

        let unsupported = JitEvent::Unsupported {
            unit: "setup".to_owned(),
            insn: "define_class",
        };
        assert_eq!(
            unsupported.to_string(),
            "JIT failure: setup: unsupported instruction: define_class"
        );

        let growth = JitEvent::CacheGrowth { new_capacity: 11 };
        assert_eq!(
            growth.to_string(),
            "No units can be unloaded -- incremented max-cache-size to 11"
        );

        let compaction = JitEvent::Compaction {
            count: 3,
            artifact: Path::new("/tmp/_kestrel_p1c4.kso").to_path_buf(),
            duration_ms: 1.5,
        };
        assert_eq!(
            compaction.to_string(),
            "JIT compaction (1.5ms): compacted 3 units -> /tmp/_kestrel_p1c4.kso"
        );

        assert_eq!(
            JitEvent::Cancel {
                trigger: "line trace hook enabled".to_owned()
            }
            .to_string(),
            "JIT cancel: line trace hook enabled"
        );
        assert_eq!(JitEvent::Finish.to_string(), "Successful JIT finish");
    }

    #[test]
    fn ring_drops_oldest() {
        let log = EventLog::new(2, 0);
        log.emit(JitEvent::Finish);
        log.emit(JitEvent::CacheGrowth { new_capacity: 5 });
        log.emit(JitEvent::CacheGrowth { new_capacity: 6 });
        let events = log.snapshot();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], JitEvent::CacheGrowth { new_capacity: 5 });
        assert_eq!(events[1], JitEvent::CacheGrowth { new_capacity: 6 });
    }

    #[test]
    fn verbosity_thresholds() {
        assert_eq!(
            JitEvent::Failure {
                unit: "m".into(),
                reason: "io".into()
            }
            .min_verbosity(),
            0
        );
        assert_eq!(JitEvent::CacheGrowth { new_capacity: 1 }.min_verbosity(), 0);
        assert_eq!(JitEvent::Finish.min_verbosity(), 1);
        assert_eq!(
            JitEvent::Inline {
                caller: "a".into(),
                callee: "b".into()
            }
            .min_verbosity(),
            2
        );
    }
}
