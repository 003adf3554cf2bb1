//! JSON scenarios: a complete world plus one action, and the report of what
//! the engine did with it.
//!
//! A scenario describes classes, methods with their exception tables, a
//! single thread's stack (frames listed outermost first, in push order), the
//! monitors held when the action starts, and the action itself: a throw, a
//! rethrow, an initializer failure, an out-of-memory raise or a trap.
//!
//! ```json
//! {
//!   "classes": [{ "name": "app.Main" }],
//!   "methods": [{
//!     "name": "divide", "class": "app.Main",
//!     "exceptions": [{ "start": 16, "end": 32, "handler": 48, "catch": "java.lang.ArithmeticException" }]
//!   }],
//!   "thread": {
//!     "segment": { "base": 4096, "limit": 8192 },
//!     "frames": [{ "kind": "interpreted", "method": "divide", "pc": 24 }]
//!   },
//!   "action": { "kind": "trap", "trap": "arithmetic" }
//! }
//! ```

use std::{fmt, ops::Range};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    class::{ClassId, RegistryError},
    config::EngineConfig,
    construct::NativeConstructor,
    dispatch::{Dispatcher, Unwind},
    error_info::ErrorDescriptor,
    exception_table::{CATCH_ANY, ExceptionEntry, ExceptionTable},
    frame::{FrameAddr, StackOverflow, StackSegment},
    heap::{HeapError, MonitorError, ObjectId},
    io::CollectDiagnostics,
    method::{AccessFlags, Method},
    runtime::{InitError, Runtime},
    signal::{TrapKind, TrapTable},
    thread::{ExecThread, StackRequirement, ThreadId},
    tracer::{RecordingTracer, TraceEvent},
};

/// Error returned when a scenario cannot be loaded or built.
#[derive(Debug)]
pub enum ScenarioError {
    /// The input is not a valid scenario document.
    Json(serde_json::Error),
    Registry(RegistryError),
    Init(InitError),
    Heap(HeapError),
    Monitor(MonitorError),
    StackOverflow(StackOverflow),
    /// A method names a class that is not defined.
    UnknownClass(String),
    /// A frame names a method that is not defined.
    UnknownMethod(String),
    /// An object label is not defined.
    UnknownObject(String),
    /// Thread id `0` is reserved.
    InvalidThreadId,
    /// A trap action targets a frame index that does not exist.
    NoSuchFrame(usize),
    /// A trap was delivered before the trap targets were installed.
    TrapNotInstalled(TrapKind),
}

impl fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(err) => write!(f, "invalid scenario: {err}"),
            Self::Registry(err) => write!(f, "{err}"),
            Self::Init(err) => write!(f, "{err}"),
            Self::Heap(err) => write!(f, "{err}"),
            Self::Monitor(err) => write!(f, "{err}"),
            Self::StackOverflow(err) => write!(f, "{err}"),
            Self::UnknownClass(name) => write!(f, "class `{name}' is not defined"),
            Self::UnknownMethod(name) => write!(f, "method `{name}' is not defined"),
            Self::UnknownObject(label) => write!(f, "object `{label}' is not defined"),
            Self::InvalidThreadId => write!(f, "thread id 0 is reserved"),
            Self::NoSuchFrame(index) => write!(f, "no frame at index {index}"),
            Self::TrapNotInstalled(kind) => write!(f, "no target installed for {kind} traps"),
        }
    }
}

impl std::error::Error for ScenarioError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(err) => Some(err),
            Self::Registry(err) => Some(err),
            Self::Init(err) => Some(err),
            Self::Heap(err) => Some(err),
            Self::Monitor(err) => Some(err),
            Self::StackOverflow(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ScenarioError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

impl From<RegistryError> for ScenarioError {
    fn from(err: RegistryError) -> Self {
        Self::Registry(err)
    }
}

impl From<InitError> for ScenarioError {
    fn from(err: InitError) -> Self {
        Self::Init(err)
    }
}

impl From<HeapError> for ScenarioError {
    fn from(err: HeapError) -> Self {
        Self::Heap(err)
    }
}

impl From<MonitorError> for ScenarioError {
    fn from(err: MonitorError) -> Self {
        Self::Monitor(err)
    }
}

impl From<StackOverflow> for ScenarioError {
    fn from(err: StackOverflow) -> Self {
        Self::StackOverflow(err)
    }
}

fn default_true() -> bool {
    true
}

fn default_superclass() -> String {
    "java.lang.Object".to_owned()
}

fn default_thread_id() -> u64 {
    1
}

fn default_depth() -> u32 {
    1
}

/// A complete scenario document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default)]
    pub config: EngineConfig,
    /// Whether to run exception initialization before the action.
    #[serde(default = "default_true")]
    pub initialize: bool,
    #[serde(default)]
    pub classes: Vec<ClassDef>,
    #[serde(default)]
    pub methods: Vec<MethodDef>,
    /// Generated-code ranges of foreign-call trampolines.
    #[serde(default)]
    pub foreign_ranges: Vec<Range<usize>>,
    #[serde(default)]
    pub objects: Vec<ObjectDef>,
    pub thread: ThreadDef,
    #[serde(default)]
    pub monitors: Vec<MonitorDef>,
    pub action: Action,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassDef {
    pub name: String,
    #[serde(default = "default_superclass")]
    pub superclass: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodFlag {
    Static,
    Synchronized,
    Native,
}

impl From<MethodFlag> for AccessFlags {
    fn from(flag: MethodFlag) -> Self {
        match flag {
            MethodFlag::Static => Self::STATIC,
            MethodFlag::Synchronized => Self::SYNCHRONIZED,
            MethodFlag::Native => Self::NATIVE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MethodDef {
    pub name: String,
    pub class: String,
    #[serde(default)]
    pub flags: Vec<MethodFlag>,
    /// Exception table, in search order.
    #[serde(default)]
    pub exceptions: Vec<EntryDef>,
    /// Generated-code range; present only for compiled methods.
    #[serde(default)]
    pub code: Option<Range<usize>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntryDef {
    pub start: usize,
    pub end: usize,
    pub handler: usize,
    /// Catch type by name; omitted for a catch-all. Resolved lazily, so it may
    /// name a class that does not exist.
    #[serde(default)]
    pub catch: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectDef {
    pub label: String,
    pub class: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThreadDef {
    #[serde(default = "default_thread_id")]
    pub id: u64,
    pub segment: StackSegment,
    /// Frames in push order: outermost first.
    pub frames: Vec<FrameDef>,
    #[serde(default)]
    pub interrupts_disabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum FrameDef {
    Interpreted {
        method: String,
        pc: usize,
        #[serde(default)]
        receiver: Option<String>,
        /// Marks the frame through which foreign code called back in.
        #[serde(default)]
        boundary: bool,
        /// Overrides the caller link, to model a damaged stack.
        #[serde(default)]
        caller: Option<usize>,
    },
    Compiled {
        pc: usize,
        #[serde(default)]
        receiver: Option<String>,
        #[serde(default)]
        caller: Option<usize>,
    },
}

/// Whose monitor is held.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockDef {
    /// An object by label.
    Object(String),
    /// A class object by name.
    Class(String),
}

impl fmt::Display for LockDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object(label) => write!(f, "{label}"),
            Self::Class(name) => write!(f, "class {name}"),
        }
    }
}

/// A monitor held when the action starts.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorDef {
    #[serde(flatten)]
    pub lock: LockDef,
    /// Holding thread; defaults to the scenario thread.
    #[serde(default)]
    pub holder: Option<u64>,
    /// Reentrancy depth.
    #[serde(default = "default_depth")]
    pub depth: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum Action {
    /// Post and raise an exception by class name.
    Throw {
        class: String,
        #[serde(default)]
        message: Option<String>,
    },
    /// Throw an existing object again.
    Rethrow { object: String },
    /// Wrap an object thrown by a class initializer.
    InitializerError { object: String },
    OutOfMemory,
    /// Deliver a trap at frame index `frame` (default: the innermost frame).
    Trap {
        trap: TrapKind,
        #[serde(default)]
        frame: Option<usize>,
    },
}

/// A built scenario, ready for the action to run.
#[derive(Debug)]
pub struct World {
    pub runtime: Runtime,
    pub thread: ExecThread,
    pub traps: TrapTable,
    /// Object labels in definition order.
    pub objects: IndexMap<String, ObjectId>,
    /// Frame addresses in push order.
    pub frames: Vec<FrameAddr>,
}

impl Scenario {
    /// Parses a scenario document.
    pub fn from_json(json: &str) -> Result<Self, ScenarioError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Builds the runtime and thread the scenario describes.
    pub fn build(&self) -> Result<World, ScenarioError> {
        let mut runtime = Runtime::new(self.config.clone());
        for class in &self.classes {
            runtime.classes_mut().define(&class.name, Some(class.superclass.as_str()))?;
        }
        for def in &self.methods {
            let method = build_method(&mut runtime, def)?;
            runtime.methods_mut().define(method)?;
        }
        for range in &self.foreign_ranges {
            runtime.methods_mut().add_foreign_range(range.clone());
        }

        let mut traps = TrapTable::new();
        if self.initialize {
            runtime.init_exceptions(&mut traps)?;
        }

        let mut objects = IndexMap::new();
        for def in &self.objects {
            let class = class_id(&runtime, &def.class)?;
            let id = runtime
                .heap()
                .allocate_throwable(class, def.message.clone(), None)?;
            objects.insert(def.label.clone(), id);
        }

        let thread_id = ThreadId::new(self.thread.id).ok_or(ScenarioError::InvalidThreadId)?;
        let mut thread = ExecThread::new(thread_id, self.thread.segment);
        thread.set_interrupts_disabled(self.thread.interrupts_disabled);
        let mut frames = Vec::with_capacity(self.thread.frames.len());
        for def in &self.thread.frames {
            let (addr, caller) = match def {
                FrameDef::Interpreted {
                    method,
                    pc,
                    receiver,
                    boundary,
                    caller,
                } => {
                    let method = runtime
                        .methods()
                        .lookup(method)
                        .ok_or_else(|| ScenarioError::UnknownMethod(method.clone()))?;
                    let addr = if *boundary {
                        thread.push_native_boundary(method, *pc)?
                    } else {
                        thread.push_interpreted(method, *pc, object_ref(&objects, receiver.as_deref())?)?
                    };
                    (addr, *caller)
                }
                FrameDef::Compiled { pc, receiver, caller } => {
                    let addr = thread.push_compiled(*pc, object_ref(&objects, receiver.as_deref())?)?;
                    (addr, *caller)
                }
            };
            if let Some(caller) = caller
                && let Some(frame) = thread.stack_mut().frame_mut(addr)
            {
                frame.set_caller(Some(FrameAddr::new(caller)));
            }
            frames.push(addr);
        }

        for def in &self.monitors {
            let holder = match def.holder {
                Some(id) => ThreadId::new(id).ok_or(ScenarioError::InvalidThreadId)?,
                None => thread_id,
            };
            for _ in 0..def.depth {
                match &def.lock {
                    LockDef::Object(label) => {
                        let object = runtime
                            .heap()
                            .get(label_ref(&objects, label)?)
                            .ok_or_else(|| ScenarioError::UnknownObject(label.clone()))?;
                        object.monitor().enter(holder)?;
                    }
                    LockDef::Class(name) => {
                        let class = class_id(&runtime, name)?;
                        runtime.classes().get(class).monitor().enter(holder)?;
                    }
                }
            }
        }

        Ok(World {
            runtime,
            thread,
            traps,
            objects,
            frames,
        })
    }

    /// Builds the world, performs the action and reports the outcome.
    ///
    /// Fatal outcomes are reported, not acted on; see [`Unwind::abort_on_fatal`].
    pub fn run(&self) -> Result<Report, ScenarioError> {
        let World {
            runtime,
            mut thread,
            traps,
            objects,
            frames,
        } = self.build()?;
        let mut dispatcher = Dispatcher::with_parts(
            &runtime,
            NativeConstructor,
            CollectDiagnostics::new(),
            RecordingTracer::new(),
        );

        let unwind = match &self.action {
            Action::Throw { class, message } => {
                let mut desc = ErrorDescriptor::new();
                match message {
                    Some(message) => desc.post_exception_message_bounded(
                        class.clone(),
                        format_args!("{message}"),
                        runtime.config().max_error_message_size,
                    ),
                    None => desc.post_exception(class.clone()),
                }
                dispatcher.raise_from_descriptor(&mut thread, &mut desc)
            }
            Action::Rethrow { object } => {
                let mut desc = ErrorDescriptor::new();
                desc.post_rethrow(label_ref(&objects, object)?);
                dispatcher.raise_from_descriptor(&mut thread, &mut desc)
            }
            Action::InitializerError { object } => {
                let mut desc = ErrorDescriptor::new();
                desc.post_initializer_error(label_ref(&objects, object)?);
                dispatcher.raise_from_descriptor(&mut thread, &mut desc)
            }
            Action::OutOfMemory => dispatcher.raise_out_of_memory(&mut thread),
            Action::Trap { trap, frame } => {
                let frame = match frame {
                    Some(index) => *frames.get(*index).ok_or(ScenarioError::NoSuchFrame(*index))?,
                    None => thread.top_frame().ok_or(ScenarioError::NoSuchFrame(0))?,
                };
                traps
                    .deliver(*trap, &mut dispatcher, &mut thread, frame)
                    .ok_or(ScenarioError::TrapNotInstalled(*trap))?
            }
        };
        let (_, diagnostics, tracer) = dispatcher.into_parts();

        let monitors: Vec<MonitorReport> = self
            .monitors
            .iter()
            .map(|def| monitor_report(&runtime, &objects, &def.lock))
            .collect::<Result<_, _>>()?;
        Ok(Report {
            outcome: Outcome::new(&runtime, &unwind),
            monitors,
            stack_depth: thread.stack().depth(),
            stack_requirement: thread.stack_requirement(),
            foreign_pending: thread
                .foreign_pending()
                .map(|id| ExceptionReport::new(&runtime, id)),
            diagnostics: diagnostics.output().lines().map(str::to_owned).collect(),
            trace: tracer.into_events(),
        })
    }
}

fn build_method(runtime: &mut Runtime, def: &MethodDef) -> Result<Method, ScenarioError> {
    let class = class_id(runtime, &def.class)?;
    let entries = def
        .exceptions
        .iter()
        .map(|entry| {
            let catch_index = match &entry.catch {
                Some(name) => runtime.classes_mut().add_class_ref(class, name),
                None => CATCH_ANY,
            };
            ExceptionEntry::new(entry.start, entry.end, entry.handler, catch_index)
        })
        .collect::<ExceptionTable>();
    let flags = def
        .flags
        .iter()
        .fold(AccessFlags::NONE, |flags, &flag| flags | AccessFlags::from(flag));

    let mut method = Method::new(def.name.clone(), class).with_flags(flags);
    if !entries.is_empty() {
        method = method.with_exception_table(entries);
    }
    if let Some(code) = &def.code {
        method = method.with_code_range(code.clone());
    }
    Ok(method)
}

fn class_id(runtime: &Runtime, name: &str) -> Result<ClassId, ScenarioError> {
    runtime
        .classes()
        .lookup(name)
        .ok_or_else(|| ScenarioError::UnknownClass(name.to_owned()))
}

fn label_ref(objects: &IndexMap<String, ObjectId>, label: &str) -> Result<ObjectId, ScenarioError> {
    objects
        .get(label)
        .copied()
        .ok_or_else(|| ScenarioError::UnknownObject(label.to_owned()))
}

fn object_ref(objects: &IndexMap<String, ObjectId>, label: Option<&str>) -> Result<Option<ObjectId>, ScenarioError> {
    label.map(|label| label_ref(objects, label)).transpose()
}

fn monitor_report(
    runtime: &Runtime,
    objects: &IndexMap<String, ObjectId>,
    lock: &LockDef,
) -> Result<MonitorReport, ScenarioError> {
    let (holder, depth) = match lock {
        LockDef::Object(label) => {
            let object = runtime
                .heap()
                .get(label_ref(objects, label)?)
                .ok_or_else(|| ScenarioError::UnknownObject(label.clone()))?;
            (object.monitor().holder(), object.monitor().depth())
        }
        LockDef::Class(name) => {
            let monitor = runtime.classes().get(class_id(runtime, name)?).monitor();
            (monitor.holder(), monitor.depth())
        }
    };
    Ok(MonitorReport {
        lock: lock.to_string(),
        holder,
        depth,
    })
}

/// What the engine did with a scenario's action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    pub outcome: Outcome,
    /// Final state of every monitor listed in the scenario.
    pub monitors: Vec<MonitorReport>,
    /// Frames left on the stack.
    pub stack_depth: usize,
    pub stack_requirement: StackRequirement,
    /// Exception handed across a foreign-call boundary, if any.
    pub foreign_pending: Option<ExceptionReport>,
    /// Lines written to the diagnostic stream.
    pub diagnostics: Vec<String>,
    pub trace: Vec<TraceEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Resumed {
        method: Option<String>,
        frame: FrameAddr,
        handler_pc: usize,
        exception: ExceptionReport,
    },
    ThreadTerminated {
        thread: ThreadId,
    },
    Fatal {
        error: String,
    },
}

impl Outcome {
    fn new(runtime: &Runtime, unwind: &Unwind) -> Self {
        match unwind {
            Unwind::Resume(resumption) => Self::Resumed {
                method: resumption
                    .method
                    .map(|id| runtime.methods().get(id).name().to_owned()),
                frame: resumption.frame,
                handler_pc: resumption.handler_pc,
                exception: ExceptionReport::new(runtime, resumption.exception),
            },
            Unwind::ThreadTerminated { thread } => Self::ThreadTerminated { thread: *thread },
            Unwind::Fatal(error) => Self::Fatal {
                error: error.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExceptionReport {
    pub class: String,
    pub message: Option<String>,
    /// Backtrace, innermost frame first, as `method@pc`.
    pub backtrace: Vec<String>,
}

impl ExceptionReport {
    fn new(runtime: &Runtime, id: ObjectId) -> Self {
        let Some(object) = runtime.heap().get(id) else {
            return Self {
                class: "<dangling>".to_owned(),
                message: None,
                backtrace: Vec::new(),
            };
        };
        let backtrace = object
            .backtrace()
            .iter()
            .map(|entry| {
                let method = entry
                    .method
                    .map_or("<unknown>", |id| runtime.methods().get(id).name());
                format!("{method}@{:#x}", entry.pc)
            })
            .collect();
        Self {
            class: runtime.classes().name(object.class()).to_owned(),
            message: object.message().map(str::to_owned),
            backtrace,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorReport {
    pub lock: String,
    pub holder: Option<ThreadId>,
    pub depth: u32,
}
