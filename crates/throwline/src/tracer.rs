//! Dispatch tracing infrastructure.
//!
//! The [`DispatchTracer`] trait defines hook points at each step of a handler
//! search. The dispatcher carries its tracer as a type parameter, so with
//! [`NoopTracer`] every hook is monomorphized away.
//!
//! | Tracer | Purpose |
//! |--------|---------|
//! | [`NoopTracer`] | Zero-cost no-op (production default) |
//! | [`StderrTracer`] | Human-readable dispatch log to stderr |
//! | [`RecordingTracer`] | Full event recording for tests and post-mortem output |
//!
//! ```ignore
//! let mut dispatcher = Dispatcher::with_parts(&runtime, NativeConstructor, StdDiagnostics, StderrTracer::new());
//! let outcome = dispatcher.raise(&mut thread, exception);
//! ```

use serde::Serialize;

use crate::{frame::FrameAddr, signal::TrapKind};

/// Trace event captured by [`RecordingTracer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    /// A hardware trap was turned into an exception.
    Trap { kind: TrapKind },
    /// A handler search started (or restarted after a resolution failure).
    Dispatch {
        class: String,
        start: Option<FrameAddr>,
    },
    /// A frame was examined.
    Frame {
        /// Number of frames passed before this one.
        depth: usize,
        method: Option<String>,
        pc: usize,
    },
    /// A catch type was resolved and cached.
    CatchResolved { class: String },
    /// A catch type could not be resolved; the search is abandoned.
    CatchUnresolvable { error_class: String },
    /// A frame passed without a match had its monitor released.
    MonitorReleased { depth: usize },
    /// The exception was handed across a foreign-call boundary.
    ForeignBoundary { depth: usize },
    /// A handler was found; control resumes there.
    Handler { depth: usize, handler_pc: usize },
    /// The stack was exhausted without finding a handler.
    Exhausted { class: String },
}

/// Trait for dispatch tracing.
///
/// All methods default to no-ops, so implementations only override the hooks
/// they care about.
pub trait DispatchTracer: std::fmt::Debug {
    /// Called when a trap is delivered to the signal bridge.
    #[inline(always)]
    fn on_trap(&mut self, _kind: TrapKind) {}

    /// Called when a search starts at `start` for an exception of class `class`.
    #[inline(always)]
    fn on_dispatch(&mut self, _class: &str, _start: Option<FrameAddr>) {}

    /// Called for each frame examined.
    ///
    /// # Arguments
    /// * `depth` - Number of frames already passed in this search
    /// * `method` - Name of the owning method, if the pc maps to one
    /// * `pc` - Program counter of the frame
    #[inline(always)]
    fn on_frame(&mut self, _depth: usize, _method: Option<&str>, _pc: usize) {}

    /// Called when a catch type is resolved for the first time.
    #[inline(always)]
    fn on_catch_resolved(&mut self, _class: &str) {}

    /// Called when resolving a catch type fails with an error of class `error_class`.
    #[inline(always)]
    fn on_catch_unresolvable(&mut self, _error_class: &str) {}

    /// Called after releasing the monitor of a frame that had no handler.
    #[inline(always)]
    fn on_monitor_release(&mut self, _depth: usize) {}

    /// Called when the foreign-boundary bridge handler runs.
    #[inline(always)]
    fn on_foreign_boundary(&mut self, _depth: usize) {}

    /// Called when a handler is found, just before control is transferred.
    #[inline(always)]
    fn on_handler(&mut self, _depth: usize, _handler_pc: usize) {}

    /// Called when the search runs out of frames.
    #[inline(always)]
    fn on_exhausted(&mut self, _class: &str) {}
}

impl<T: DispatchTracer + ?Sized> DispatchTracer for &mut T {
    fn on_trap(&mut self, kind: TrapKind) {
        (**self).on_trap(kind);
    }

    fn on_dispatch(&mut self, class: &str, start: Option<FrameAddr>) {
        (**self).on_dispatch(class, start);
    }

    fn on_frame(&mut self, depth: usize, method: Option<&str>, pc: usize) {
        (**self).on_frame(depth, method, pc);
    }

    fn on_catch_resolved(&mut self, class: &str) {
        (**self).on_catch_resolved(class);
    }

    fn on_catch_unresolvable(&mut self, error_class: &str) {
        (**self).on_catch_unresolvable(error_class);
    }

    fn on_monitor_release(&mut self, depth: usize) {
        (**self).on_monitor_release(depth);
    }

    fn on_foreign_boundary(&mut self, depth: usize) {
        (**self).on_foreign_boundary(depth);
    }

    fn on_handler(&mut self, depth: usize, handler_pc: usize) {
        (**self).on_handler(depth, handler_pc);
    }

    fn on_exhausted(&mut self, class: &str) {
        (**self).on_exhausted(class);
    }
}

// ============================================================================
// NoopTracer: production default
// ============================================================================

/// A tracer that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl DispatchTracer for NoopTracer {}

// ============================================================================
// StderrTracer: human-readable dispatch log
// ============================================================================

/// Tracer that prints a human-readable dispatch log to stderr.
///
/// Output format:
/// ```text
/// >>> DISPATCH java.lang.ArithmeticException from 0x8fc0
///   [0] app.Main.divide        pc=0x18
///   ~~~ MONITOR RELEASED       depth=0
///   [1] app.Main.run           pc=0x44
///   <<< HANDLER pc=0x60        depth=1
/// ```
#[derive(Debug)]
pub struct StderrTracer {
    /// Maximum number of lines before output stops. None = unlimited.
    limit: Option<usize>,
    count: usize,
}

impl StderrTracer {
    /// Creates a new stderr tracer with no line limit.
    #[must_use]
    pub fn new() -> Self {
        Self { limit: None, count: 0 }
    }

    /// Creates a new stderr tracer that stops after `limit` lines.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            count: 0,
        }
    }

    fn line(&mut self, line: std::fmt::Arguments<'_>) {
        if let Some(limit) = self.limit {
            if self.count == limit {
                eprintln!("--- trace limit reached ({limit} lines) ---");
            }
            if self.count >= limit {
                self.count += 1;
                return;
            }
        }
        eprintln!("{line}");
        self.count += 1;
    }
}

impl Default for StderrTracer {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchTracer for StderrTracer {
    fn on_trap(&mut self, kind: TrapKind) {
        self.line(format_args!("!!! TRAP {kind}"));
    }

    fn on_dispatch(&mut self, class: &str, start: Option<FrameAddr>) {
        match start {
            Some(start) => self.line(format_args!(">>> DISPATCH {class} from {start}")),
            None => self.line(format_args!(">>> DISPATCH {class} with no frames")),
        }
    }

    fn on_frame(&mut self, depth: usize, method: Option<&str>, pc: usize) {
        let method = method.unwrap_or("<unknown>");
        self.line(format_args!("  [{depth}] {method:<20} pc={pc:#x}"));
    }

    fn on_catch_resolved(&mut self, class: &str) {
        self.line(format_args!("  ... CATCH RESOLVED     {class}"));
    }

    fn on_catch_unresolvable(&mut self, error_class: &str) {
        self.line(format_args!("  ??? CATCH UNRESOLVABLE {error_class}"));
    }

    fn on_monitor_release(&mut self, depth: usize) {
        self.line(format_args!("  ~~~ MONITOR RELEASED   depth={depth}"));
    }

    fn on_foreign_boundary(&mut self, depth: usize) {
        self.line(format_args!("  ||| FOREIGN BOUNDARY   depth={depth}"));
    }

    fn on_handler(&mut self, depth: usize, handler_pc: usize) {
        self.line(format_args!("  <<< HANDLER pc={handler_pc:#x}  depth={depth}"));
    }

    fn on_exhausted(&mut self, class: &str) {
        self.line(format_args!("  xxx EXHAUSTED          {class}"));
    }
}

// ============================================================================
// RecordingTracer: full event capture
// ============================================================================

/// Tracer that records every event.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Vec<TraceEvent>,
}

impl RecordingTracer {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded so far, in order.
    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Consumes the recorder, returning its events.
    #[must_use]
    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }
}

impl DispatchTracer for RecordingTracer {
    fn on_trap(&mut self, kind: TrapKind) {
        self.events.push(TraceEvent::Trap { kind });
    }

    fn on_dispatch(&mut self, class: &str, start: Option<FrameAddr>) {
        self.events.push(TraceEvent::Dispatch {
            class: class.to_owned(),
            start,
        });
    }

    fn on_frame(&mut self, depth: usize, method: Option<&str>, pc: usize) {
        self.events.push(TraceEvent::Frame {
            depth,
            method: method.map(str::to_owned),
            pc,
        });
    }

    fn on_catch_resolved(&mut self, class: &str) {
        self.events.push(TraceEvent::CatchResolved {
            class: class.to_owned(),
        });
    }

    fn on_catch_unresolvable(&mut self, error_class: &str) {
        self.events.push(TraceEvent::CatchUnresolvable {
            error_class: error_class.to_owned(),
        });
    }

    fn on_monitor_release(&mut self, depth: usize) {
        self.events.push(TraceEvent::MonitorReleased { depth });
    }

    fn on_foreign_boundary(&mut self, depth: usize) {
        self.events.push(TraceEvent::ForeignBoundary { depth });
    }

    fn on_handler(&mut self, depth: usize, handler_pc: usize) {
        self.events.push(TraceEvent::Handler { depth, handler_pc });
    }

    fn on_exhausted(&mut self, class: &str) {
        self.events.push(TraceEvent::Exhausted {
            class: class.to_owned(),
        });
    }
}
