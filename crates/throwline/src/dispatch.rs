//! The dispatch engine.
//!
//! [`Dispatcher`] turns raised exceptions into a handler search over the
//! current thread's stack. The search visits frames from the start frame
//! towards the outermost one:
//!
//! 1. find the frame's method (directly for interpreted frames, by program
//!    counter for compiled ones) and ask [`find_handler`] for a match;
//! 2. on a match, transfer control to the handler and stop;
//! 3. on a catch-type resolution failure, materialize the resolution error
//!    and search again for it from the same frame, dropping the original;
//! 4. otherwise run the foreign-boundary bridge if the frame is one, release
//!    the frame's monitor if this thread holds it, and move to the caller.
//!
//! When the walker runs out of frames the search is exhausted: the
//! termination class ends the current thread, anything else is fatal.
//!
//! None of this unwinds the host stack. Every entry point returns an
//! [`Unwind`] telling the code runner where execution continues.

use std::fmt;

use crate::{
    class::WellKnownClass,
    construct::{ConstructError, ConstructorArg, ExceptionConstructor, NativeConstructor},
    error_info::{ErrorDescriptor, ErrorKind},
    exception_table::{HandlerLookup, find_handler},
    frame::FrameAddr,
    heap::ObjectId,
    io::{DiagnosticWriter, StdDiagnostics},
    method::{Method, MethodId},
    runtime::Runtime,
    signal::TrapTarget,
    thread::{ExecThread, ThreadId},
    tracer::{DispatchTracer, NoopTracer},
};

/// Where execution resumes after a handler was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resumption {
    /// Frame containing the handler; every younger frame has been discarded.
    pub frame: FrameAddr,
    /// Method owning the frame.
    pub method: Option<MethodId>,
    /// Program counter of the handler; the frame's pc already points here.
    pub handler_pc: usize,
    /// The exception being handled, for the handler to pick up.
    pub exception: ObjectId,
}

/// An unrecoverable condition; the process must not continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    /// No handler exists anywhere on the stack.
    Unhandled {
        class_name: String,
        message: Option<String>,
    },
    /// The exception to throw does not refer to a live object.
    NullException,
    /// Memory is exhausted and there is no preallocated exception to report it.
    InsufficientMemory,
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unhandled { class_name, .. } => write!(f, "no handler for exception of type `{class_name}'"),
            Self::NullException => write!(f, "exception thrown on null object"),
            Self::InsufficientMemory => write!(f, "insufficient memory"),
        }
    }
}

impl std::error::Error for FatalError {}

/// Outcome of a dispatch.
///
/// A dispatch never simply returns to the thrower: the caller must act on
/// the variant.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unwind {
    /// A handler was found; resume there.
    Resume(Resumption),
    /// The termination class went unhandled; the thread has been torn down.
    ThreadTerminated { thread: ThreadId },
    /// Unrecoverable; the diagnostic has been written and the process must abort.
    Fatal(FatalError),
}

impl Unwind {
    /// Aborts the process on [`Unwind::Fatal`], otherwise returns `self`.
    pub fn abort_on_fatal(self) -> Self {
        if let Self::Fatal(_) = self {
            std::process::abort();
        }
        self
    }

    /// The resumption point, if a handler was found.
    #[must_use]
    pub fn resumption(&self) -> Option<&Resumption> {
        match self {
            Self::Resume(resumption) => Some(resumption),
            _ => None,
        }
    }
}

/// Result of one pass over the stack.
enum Search {
    Done(Unwind),
    /// A catch type failed to resolve at `from`; search again for `exception`.
    Restart { exception: ObjectId, from: FrameAddr },
}

/// The exception dispatcher.
///
/// Generic over the constructor seam, the diagnostic sink and the tracer, so
/// the common configuration (`Dispatcher::new`) pays nothing for hooks it
/// does not use.
#[derive(Debug)]
pub struct Dispatcher<'rt, C = NativeConstructor, W = StdDiagnostics, Tr = NoopTracer> {
    runtime: &'rt Runtime,
    constructor: C,
    diagnostics: W,
    tracer: Tr,
}

impl<'rt> Dispatcher<'rt> {
    /// Dispatcher with direct allocation, stderr diagnostics and no tracing.
    #[must_use]
    pub fn new(runtime: &'rt Runtime) -> Self {
        Self::with_parts(runtime, NativeConstructor, StdDiagnostics, NoopTracer)
    }
}

impl<'rt, C, W, Tr> Dispatcher<'rt, C, W, Tr>
where
    C: ExceptionConstructor,
    W: DiagnosticWriter,
    Tr: DispatchTracer,
{
    #[must_use]
    pub fn with_parts(runtime: &'rt Runtime, constructor: C, diagnostics: W, tracer: Tr) -> Self {
        Self {
            runtime,
            constructor,
            diagnostics,
            tracer,
        }
    }

    #[must_use]
    pub fn runtime(&self) -> &'rt Runtime {
        self.runtime
    }

    #[must_use]
    pub fn tracer(&self) -> &Tr {
        &self.tracer
    }

    #[must_use]
    pub fn diagnostics(&self) -> &W {
        &self.diagnostics
    }

    /// Consumes the dispatcher, returning its constructor, diagnostic sink and tracer.
    pub fn into_parts(self) -> (C, W, Tr) {
        (self.constructor, self.diagnostics, self.tracer)
    }

    /// Turns a pending error into an exception object.
    ///
    /// The descriptor is always discarded, whichever branch is taken. If the
    /// constructor itself throws, the object it threw is returned in place of
    /// the requested one. Out-of-memory never allocates: it yields the
    /// preallocated instance, or [`FatalError::InsufficientMemory`] before
    /// initialization.
    pub fn materialize(&mut self, desc: &mut ErrorDescriptor) -> Result<ObjectId, FatalError> {
        let result = self.construct_for(desc);
        desc.discard();
        result
    }

    fn construct_for(&mut self, desc: &ErrorDescriptor) -> Result<ObjectId, FatalError> {
        let (class_name, arg) = match desc.kind() {
            ErrorKind::Exception => (
                desc.class_name().unwrap_or_default(),
                ConstructorArg::Message(desc.message().unwrap_or_default().to_owned()),
            ),
            ErrorKind::Rethrow => return desc.throwable().ok_or(FatalError::NullException),
            ErrorKind::InitializerError => {
                let cause = desc.throwable().ok_or(FatalError::NullException)?;
                (
                    WellKnownClass::ExceptionInInitializerError.name(),
                    ConstructorArg::Cause(cause),
                )
            }
            ErrorKind::OutOfMemory => {
                return self
                    .runtime
                    .preallocated()
                    .map(|pre| pre.out_of_memory)
                    .ok_or(FatalError::InsufficientMemory);
            }
        };
        match self.constructor.construct(self.runtime, class_name, arg) {
            Ok(id) | Err(ConstructError::Thrown(id)) => Ok(id),
            Err(ConstructError::OutOfMemoryUnavailable) => Err(FatalError::InsufficientMemory),
        }
    }

    /// Throws `exception` from the thread's innermost frame.
    ///
    /// A fresh backtrace is captured first, replacing any earlier one.
    pub fn raise(&mut self, thread: &mut ExecThread, exception: ObjectId) -> Unwind {
        let start = thread.top_frame();
        let Some(object) = self.runtime.heap().get(exception) else {
            return self.fatal(FatalError::NullException);
        };
        object.set_backtrace(thread.stack().capture_backtrace(start, self.runtime.methods()));
        self.dispatch(thread, exception, start)
    }

    /// Materializes `desc` and throws the result.
    pub fn raise_from_descriptor(&mut self, thread: &mut ExecThread, desc: &mut ErrorDescriptor) -> Unwind {
        match self.materialize(desc) {
            Ok(exception) => self.raise(thread, exception),
            Err(fatal) => self.fatal(fatal),
        }
    }

    /// Throws the preallocated out-of-memory exception.
    pub fn raise_out_of_memory(&mut self, thread: &mut ExecThread) -> Unwind {
        match self.runtime.preallocated() {
            Some(pre) => self.raise(thread, pre.out_of_memory),
            None => self.fatal(FatalError::InsufficientMemory),
        }
    }

    /// Throws a trap's preallocated exception from the trap-time `frame`.
    pub fn dispatch_trap(&mut self, thread: &mut ExecThread, target: TrapTarget, frame: FrameAddr) -> Unwind {
        self.tracer.on_trap(target.kind);
        let Some(object) = self.runtime.heap().get(target.exception) else {
            return self.fatal(FatalError::NullException);
        };
        object.set_backtrace(thread.stack().capture_backtrace(Some(frame), self.runtime.methods()));
        self.dispatch(thread, target.exception, Some(frame))
    }

    /// Searches for a handler of `exception` starting at `start`.
    ///
    /// The backtrace is left as is; use [`raise`](Self::raise) to capture one.
    ///
    /// # Panics
    /// Panics if the thread has interrupts disabled. Dispatching in that state
    /// is a bug in the caller, not a recoverable error.
    pub fn dispatch(&mut self, thread: &mut ExecThread, exception: ObjectId, start: Option<FrameAddr>) -> Unwind {
        assert!(
            !thread.interrupts_disabled(),
            "exception dispatched on thread {} with interrupts disabled",
            thread.id()
        );

        let mut exception = exception;
        let mut start = start;
        // each restart turns one unresolved catch type into a cached failure, so this ends
        loop {
            match self.search(thread, exception, start) {
                Search::Done(unwind) => return unwind,
                Search::Restart {
                    exception: replacement,
                    from,
                } => {
                    exception = replacement;
                    start = Some(from);
                }
            }
        }
    }

    fn search(&mut self, thread: &mut ExecThread, exception: ObjectId, start: Option<FrameAddr>) -> Search {
        let runtime = self.runtime;
        let classes = runtime.classes();
        let methods = runtime.methods();
        let Some(object) = runtime.heap().get(exception) else {
            return Search::Done(self.fatal(FatalError::NullException));
        };
        let class = object.class();

        self.tracer.on_dispatch(classes.name(class), start);
        thread.set_exception_object(Some(exception));

        let mut depth = 0;
        let mut cursor = start.filter(|&addr| thread.stack().segment().contains(addr));
        while let Some(addr) = cursor {
            let Some(&frame) = thread.stack().frame(addr) else {
                break;
            };
            let method_id = frame.method(methods);
            let method = method_id.map(|id| methods.get(id));
            self.tracer.on_frame(depth, method.map(Method::name), frame.pc());

            if let Some(method) = method {
                let capacity = runtime.config().max_error_message_size;
                match find_handler(frame.pc(), class, method, classes, capacity, &mut self.tracer) {
                    HandlerLookup::Matched { handler_pc, .. } => {
                        return Search::Done(self.transfer(thread, addr, method_id, handler_pc, exception, depth));
                    }
                    HandlerLookup::ResolutionFailed(mut desc) => {
                        return match self.materialize(&mut desc) {
                            Ok(replacement) => {
                                if let Some(object) = runtime.heap().get(replacement) {
                                    object.set_backtrace(thread.stack().capture_backtrace(Some(addr), methods));
                                }
                                Search::Restart {
                                    exception: replacement,
                                    from: addr,
                                }
                            }
                            Err(fatal) => Search::Done(self.fatal(fatal)),
                        };
                    }
                    HandlerLookup::NotMatched => {}
                }
            }

            if frame.is_foreign_boundary(methods) {
                thread.set_foreign_pending(exception);
                self.tracer.on_foreign_boundary(depth);
            }

            if let Some(method) = method
                && let Some(target) = runtime.sync_target(method, frame.receiver())
                && runtime.release_if_held(target, thread.id())
            {
                self.tracer.on_monitor_release(depth);
            }

            cursor = thread.stack().walker().next(addr);
            depth += 1;
        }

        Search::Done(self.exhausted(thread, classes.name(class), object.message()))
    }

    fn transfer(
        &mut self,
        thread: &mut ExecThread,
        frame: FrameAddr,
        method: Option<MethodId>,
        handler_pc: usize,
        exception: ObjectId,
        depth: usize,
    ) -> Unwind {
        self.tracer.on_handler(depth, handler_pc);
        thread.set_exception_object(None);
        thread.require_high_stack();
        let stack = thread.stack_mut();
        stack.unwind_to(frame);
        if let Some(target) = stack.frame_mut(frame) {
            target.set_pc(handler_pc);
        }
        Unwind::Resume(Resumption {
            frame,
            method,
            handler_pc,
            exception,
        })
    }

    fn exhausted(&mut self, thread: &mut ExecThread, class_name: &str, message: Option<&str>) -> Unwind {
        thread.set_exception_object(None);
        self.tracer.on_exhausted(class_name);
        if class_name == WellKnownClass::ThreadDeath.name() {
            thread.terminate();
            return Unwind::ThreadTerminated { thread: thread.id() };
        }
        self.fatal(FatalError::Unhandled {
            class_name: class_name.to_owned(),
            message: message.map(str::to_owned),
        })
    }

    /// Writes the diagnostic for `error` and returns the fatal outcome.
    fn fatal(&mut self, error: FatalError) -> Unwind {
        match &error {
            FatalError::Unhandled { class_name, message } => {
                self.diagnostics.write_line("Internal error.");
                self.diagnostics
                    .write_line("Please check your CLASSPATH and your installation.");
                self.diagnostics
                    .write_line(&format!("Exception thrown was of type `{class_name}'"));
                match message {
                    Some(message) => self.diagnostics.write_line(&format!("Message was `{message}'")),
                    None => self.diagnostics.write_line("NULL message"),
                }
            }
            FatalError::NullException => {
                self.diagnostics
                    .write_line("Exception thrown on null object ... aborting");
            }
            FatalError::InsufficientMemory => self.diagnostics.write_line("(Insufficient memory)"),
        }
        Unwind::Fatal(error)
    }
}
