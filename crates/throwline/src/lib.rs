#![doc = include_str!("../../../README.md")]
mod class;
mod config;
mod construct;
mod dispatch;
mod error_info;
mod exception_table;
mod frame;
mod heap;
mod io;
mod method;
mod runtime;
pub mod scenario;
mod signal;
mod thread;
pub mod tracer;

pub use crate::{
    class::{Class, ClassId, ClassTable, RegistryError, WellKnownClass},
    config::{DEFAULT_MAX_ERROR_MESSAGE_SIZE, EngineConfig},
    construct::{ConstructError, ConstructorArg, ExceptionConstructor, NativeConstructor},
    dispatch::{Dispatcher, FatalError, Resumption, Unwind},
    error_info::{ErrorDescriptor, ErrorKind},
    exception_table::{CATCH_ANY, CatchType, CatchTypeCell, ExceptionEntry, ExceptionTable, HandlerLookup, find_handler},
    frame::{
        CompiledFrame, FRAME_SIZE, Frame, FrameAddr, FrameWalker, InterpretedFrame, MachineStack, StackOverflow,
        StackSegment,
    },
    heap::{Backtrace, BacktraceEntry, Heap, HeapError, Monitor, MonitorError, Object, ObjectId},
    io::{CollectDiagnostics, DiagnosticWriter, StdDiagnostics},
    method::{AccessFlags, Method, MethodArea, MethodId},
    runtime::{InitError, Preallocated, Runtime, SyncTarget},
    signal::{TrapInstaller, TrapKind, TrapTable, TrapTarget},
    thread::{ExecThread, StackRequirement, ThreadId},
    tracer::{DispatchTracer, NoopTracer, RecordingTracer, StderrTracer, TraceEvent},
};
