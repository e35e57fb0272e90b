//! Trace hooks.
//!
//! Line hooks need per-instruction visibility, which native code cannot
//! provide, so enabling one cancels every active unit and keeps the JIT tier
//! suppressed until the hook is removed. Class-definition hooks observe an
//! instruction the generator never compiles, so they coexist with native
//! code untouched.

/// Kinds of trace hooks an embedder can install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    /// Fires before every interpreted instruction.
    Line,
    /// Fires on every `DefineClass`.
    ClassDefine,
}

/// Hook registry plus delivery counters.
#[derive(Debug, Default, Clone)]
pub struct TraceHooks {
    line: bool,
    class_define: bool,
    /// Instructions observed while the line hook was enabled.
    pub line_events: u64,
    /// Class definitions observed while the class hook was enabled.
    pub class_events: u64,
}

impl TraceHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable a hook. Returns whether the setting changed.
    pub fn set(&mut self, kind: TraceKind, enabled: bool) -> bool {
        let slot = match kind {
            TraceKind::Line => &mut self.line,
            TraceKind::ClassDefine => &mut self.class_define,
        };
        let changed = *slot != enabled;
        *slot = enabled;
        changed
    }

    pub fn enabled(&self, kind: TraceKind) -> bool {
        match kind {
            TraceKind::Line => self.line,
            TraceKind::ClassDefine => self.class_define,
        }
    }

    /// Count one instruction if the line hook is on.
    pub fn observe_line(&mut self) {
        if self.line {
            self.line_events = self.line_events.saturating_add(1);
        }
    }

    /// Count one class definition if the class hook is on.
    pub fn observe_class(&mut self) {
        if self.class_define {
            self.class_events = self.class_events.saturating_add(1);
        }
    }
}
