//! Process-wide engine state: the collaborator models plus the preallocated
//! exceptions created by [`Runtime::init_exceptions`].

use std::{
    fmt,
    sync::{Mutex, OnceLock, PoisonError},
};

use crate::{
    class::{ClassId, ClassTable, RegistryError, WellKnownClass},
    config::EngineConfig,
    heap::{Heap, HeapError, ObjectId},
    method::{Method, MethodArea},
    signal::{TrapInstaller, TrapKind, TrapTarget},
    thread::ThreadId,
};

/// Exceptions allocated once at initialization and reused from then on.
///
/// These are thrown on paths where allocating is unsafe or known to fail.
/// The handles never change after initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preallocated {
    pub out_of_memory: ObjectId,
    pub null_pointer: ObjectId,
    pub arithmetic: ObjectId,
}

impl Preallocated {
    /// Preallocated exception for a trap kind.
    #[must_use]
    pub fn for_trap(&self, kind: TrapKind) -> ObjectId {
        match kind {
            TrapKind::NullPointer => self.null_pointer,
            TrapKind::Arithmetic => self.arithmetic,
        }
    }
}

/// Error returned when [`Runtime::init_exceptions`] cannot create the preallocated exceptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitError {
    /// A runtime class needed for a preallocated exception is missing.
    Registry(RegistryError),
    /// The heap refused the allocation.
    Heap(HeapError),
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registry(err) => write!(f, "cannot initialize exceptions: {err}"),
            Self::Heap(err) => write!(f, "cannot initialize exceptions: {err}"),
        }
    }
}

impl std::error::Error for InitError {}

impl From<RegistryError> for InitError {
    fn from(err: RegistryError) -> Self {
        Self::Registry(err)
    }
}

impl From<HeapError> for InitError {
    fn from(err: HeapError) -> Self {
        Self::Heap(err)
    }
}

/// The lock a frame holds while its method runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTarget {
    /// The class monitor, for static synchronized methods.
    Class(ClassId),
    /// The receiver's monitor, for synchronized instance methods.
    Object(ObjectId),
}

/// Shared runtime state.
///
/// Set up classes and methods through [`classes_mut`](Self::classes_mut) and
/// [`methods_mut`](Self::methods_mut), then share the runtime by reference
/// between threads; everything the engine touches during a dispatch goes
/// through `&self`.
#[derive(Debug)]
pub struct Runtime {
    config: EngineConfig,
    classes: ClassTable,
    methods: MethodArea,
    heap: Heap,
    preallocated: OnceLock<Preallocated>,
    /// Serializes [`Runtime::init_exceptions`] so only one caller allocates.
    init_lock: Mutex<()>,
}

impl Runtime {
    /// Creates a runtime with the bootstrap classes defined and an empty heap.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let heap = Heap::new(config.heap_allocation_limit);
        Self {
            config,
            classes: ClassTable::with_bootstrap_classes(),
            methods: MethodArea::new(),
            heap,
            preallocated: OnceLock::new(),
            init_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    pub fn classes_mut(&mut self) -> &mut ClassTable {
        &mut self.classes
    }

    #[must_use]
    pub fn methods(&self) -> &MethodArea {
        &self.methods
    }

    pub fn methods_mut(&mut self) -> &mut MethodArea {
        &mut self.methods
    }

    #[must_use]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Id of a bootstrap class.
    ///
    /// # Panics
    /// Never in practice: bootstrap classes are defined by [`Runtime::new`] and
    /// classes cannot be removed.
    #[must_use]
    pub fn well_known(&self, class: WellKnownClass) -> ClassId {
        self.classes
            .well_known(class)
            .expect("bootstrap classes are defined at construction")
    }

    /// Preallocated exceptions, once [`init_exceptions`](Self::init_exceptions) has run.
    #[must_use]
    pub fn preallocated(&self) -> Option<&Preallocated> {
        self.preallocated.get()
    }

    /// Allocates the preallocated exceptions and registers the two trap targets.
    ///
    /// Idempotent: later calls return the existing instances and install nothing.
    /// Must complete before any trap can be delivered.
    pub fn init_exceptions(&self, installer: &mut impl TrapInstaller) -> Result<&Preallocated, InitError> {
        if let Some(existing) = self.preallocated.get() {
            return Ok(existing);
        }
        let _guard = self.init_lock.lock().unwrap_or_else(PoisonError::into_inner);
        // the caller that held the lock before us may have finished the job
        if let Some(existing) = self.preallocated.get() {
            return Ok(existing);
        }

        let allocate = |class: WellKnownClass| -> Result<ObjectId, InitError> {
            let class = self
                .classes
                .well_known(class)
                .ok_or(RegistryError::MissingWellKnown(class))?;
            Ok(self.heap.allocate_throwable(class, None, None)?)
        };
        let fresh = Preallocated {
            out_of_memory: allocate(WellKnownClass::OutOfMemoryError)?,
            null_pointer: allocate(WellKnownClass::NullPointerException)?,
            arithmetic: allocate(WellKnownClass::ArithmeticException)?,
        };

        for kind in [TrapKind::NullPointer, TrapKind::Arithmetic] {
            installer.install(TrapTarget {
                kind,
                exception: fresh.for_trap(kind),
            });
        }
        Ok(self.preallocated.get_or_init(|| fresh))
    }

    /// Lock held by a frame running `method` with `receiver` in its lock slot.
    ///
    /// `None` unless the method is synchronized. A synchronized instance
    /// method whose frame has no receiver also yields `None`.
    #[must_use]
    pub fn sync_target(&self, method: &Method, receiver: Option<ObjectId>) -> Option<SyncTarget> {
        if !method.is_synchronized() {
            None
        } else if method.is_static() {
            Some(SyncTarget::Class(method.class()))
        } else {
            receiver.map(SyncTarget::Object)
        }
    }

    /// Releases one level of `target`'s monitor if `thread` holds it.
    ///
    /// Returns whether a level was released. A monitor held by another thread,
    /// or by nobody, is left alone.
    pub fn release_if_held(&self, target: SyncTarget, thread: ThreadId) -> bool {
        match target {
            SyncTarget::Class(class) => {
                let monitor = self.classes.get(class).monitor();
                monitor.holder() == Some(thread) && monitor.exit(thread).is_ok()
            }
            SyncTarget::Object(id) => self
                .heap
                .get(id)
                .is_some_and(|object| object.monitor().holder() == Some(thread) && object.monitor().exit(thread).is_ok()),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
