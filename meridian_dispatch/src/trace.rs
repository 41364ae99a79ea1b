//! Trace Hooks
//!
//! Tooling observes the engine through [`TraceSink`]s. Every precompiled,
//! dispatched and invalidated signature can be recorded, for example to
//! generate precompilation hints offline.
//!
//! Compile and dispatch events are only produced while their tracing is
//! enabled. Enabling nests: each `enable` must be paired with a `disable`,
//! so independent tools can trace the same engine.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use meridian_types::Ty;
use parking_lot::{Mutex, RwLock};

use crate::invalidation::InvalidationRecord;

/// An event reported to trace sinks.
#[derive(Clone)]
pub enum TraceEvent {
    /// An instance was compiled for its own signature.
    Precompiled {
        signature: Ty,
        elapsed: Duration,
        /// The instance had been compiled before.
        recompile: bool,
    },
    /// An instance was reached through the slow dispatch path for the
    /// first time.
    Dispatched { signature: Ty },
    /// A step of an invalidation walk.
    Invalidated(InvalidationRecord),
}

impl TraceEvent {
    /// The signature this event is about.
    pub fn signature(&self) -> Ty {
        match self {
            TraceEvent::Precompiled { signature, .. } | TraceEvent::Dispatched { signature } => signature.clone(),
            TraceEvent::Invalidated(record) => record.signature(),
        }
    }

    pub fn kind(&self) -> TraceKind {
        match self {
            TraceEvent::Precompiled { .. } => TraceKind::Precompiled,
            TraceEvent::Dispatched { .. } => TraceKind::Dispatched,
            TraceEvent::Invalidated(_) => TraceKind::Invalidated,
        }
    }
}

impl fmt::Debug for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceEvent::Precompiled {
                signature,
                elapsed,
                recompile,
            } => write!(f, "Precompiled({signature}, {elapsed:?}, recompile={recompile})"),
            TraceEvent::Dispatched { signature } => write!(f, "Dispatched({signature})"),
            TraceEvent::Invalidated(record) => write!(f, "Invalidated({record:?})"),
        }
    }
}

/// The category of a [`TraceEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceKind {
    Precompiled,
    Dispatched,
    Invalidated,
}

/// A receiver of trace events.
///
/// Sinks are called synchronously on the thread that produced the event,
/// possibly while engine locks are held; they must not call back into the
/// engine.
pub trait TraceSink: Send + Sync {
    fn record(&self, event: &TraceEvent);
}

/// A sink collecting signature descriptors in memory.
#[derive(Debug, Default)]
pub struct SignatureTrace {
    entries: Mutex<Vec<(TraceKind, Ty)>>,
}

impl SignatureTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far, in order.
    pub fn entries(&self) -> Vec<(TraceKind, Ty)> {
        self.entries.lock().clone()
    }

    /// Signatures recorded with `kind`, in order.
    pub fn signatures(&self, kind: TraceKind) -> Vec<Ty> {
        self.entries
            .lock()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, sig)| sig.clone())
            .collect()
    }

    /// Remove and return everything recorded so far.
    pub fn take(&self) -> Vec<(TraceKind, Ty)> {
        std::mem::take(&mut *self.entries.lock())
    }
}

impl TraceSink for SignatureTrace {
    fn record(&self, event: &TraceEvent) {
        self.entries.lock().push((event.kind(), event.signature()));
    }
}

// =============================================================================
// Tracer
// =============================================================================

/// The registered sinks and the tracing switches of one engine.
pub(crate) struct Tracer {
    sinks: RwLock<Vec<Arc<dyn TraceSink>>>,
    has_sinks: AtomicBool,
    compile_depth: AtomicU32,
    dispatch_depth: AtomicU32,
}

impl Tracer {
    pub(crate) fn new(trace_compile: bool, trace_dispatch: bool) -> Self {
        Self {
            sinks: RwLock::new(Vec::new()),
            has_sinks: AtomicBool::new(false),
            compile_depth: AtomicU32::new(u32::from(trace_compile)),
            dispatch_depth: AtomicU32::new(u32::from(trace_dispatch)),
        }
    }

    #[inline]
    pub(crate) fn has_sinks(&self) -> bool {
        self.has_sinks.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn compile_enabled(&self) -> bool {
        self.has_sinks() && self.compile_depth.load(Ordering::Relaxed) > 0
    }

    #[inline]
    pub(crate) fn dispatch_enabled(&self) -> bool {
        self.has_sinks() && self.dispatch_depth.load(Ordering::Relaxed) > 0
    }

    pub(crate) fn add_sink(&self, sink: Arc<dyn TraceSink>) {
        let mut sinks = self.sinks.write();
        sinks.push(sink);
        self.has_sinks.store(true, Ordering::Release);
    }

    pub(crate) fn clear_sinks(&self) {
        let mut sinks = self.sinks.write();
        sinks.clear();
        self.has_sinks.store(false, Ordering::Release);
    }

    pub(crate) fn emit(&self, event: &TraceEvent) {
        for sink in self.sinks.read().iter() {
            sink.record(event);
        }
    }

    fn adjust(counter: &AtomicU32, enable: bool) {
        if enable {
            counter.fetch_add(1, Ordering::Relaxed);
        } else {
            // Unbalanced disables stop at zero.
            let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        }
    }

    pub(crate) fn set_compile(&self, enable: bool) {
        Self::adjust(&self.compile_depth, enable);
    }

    pub(crate) fn set_dispatch(&self, enable: bool) {
        Self::adjust(&self.dispatch_depth, enable);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatched(name: &str) -> TraceEvent {
        TraceEvent::Dispatched {
            signature: Ty::tuple([Ty::named(name)]),
        }
    }

    #[test]
    fn test_switches_nest() {
        let tracer = Tracer::new(false, false);
        tracer.add_sink(Arc::new(SignatureTrace::new()));
        assert!(!tracer.compile_enabled());
        tracer.set_compile(true);
        tracer.set_compile(true);
        tracer.set_compile(false);
        assert!(tracer.compile_enabled());
        tracer.set_compile(false);
        tracer.set_compile(false);
        assert!(!tracer.compile_enabled());
        tracer.set_compile(true);
        assert!(tracer.compile_enabled());
    }

    #[test]
    fn test_no_sinks_disables_everything() {
        let tracer = Tracer::new(true, true);
        assert!(!tracer.compile_enabled() && !tracer.dispatch_enabled());
        let sink = Arc::new(SignatureTrace::new());
        tracer.add_sink(sink.clone());
        assert!(tracer.dispatch_enabled());
        tracer.clear_sinks();
        assert!(!tracer.dispatch_enabled());
        tracer.emit(&dispatched("Int64"));
        assert!(sink.entries().is_empty());
    }

    #[test]
    fn test_signature_trace_filters_by_kind() {
        let sink = SignatureTrace::new();
        sink.record(&dispatched("Int64"));
        sink.record(&TraceEvent::Precompiled {
            signature: Ty::tuple([Ty::named("String")]),
            elapsed: Duration::from_millis(1),
            recompile: false,
        });
        sink.record(&dispatched("Bool"));
        assert_eq!(
            sink.signatures(TraceKind::Dispatched),
            vec![Ty::tuple([Ty::named("Int64")]), Ty::tuple([Ty::named("Bool")])]
        );
        assert_eq!(sink.take().len(), 3);
        assert!(sink.entries().is_empty());
    }
}
