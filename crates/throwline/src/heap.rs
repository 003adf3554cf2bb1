//! Object store for exception objects and lock targets.
//!
//! The heap is small: the engine only needs an object's runtime
//! class, the throwable state of exception objects (message, cause,
//! backtrace), and the per-object monitor that synchronized frames hold. It
//! is shared between threads, so every operation takes `&self`.

use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
    },
};

use serde::Serialize;

use crate::{class::ClassId, method::MethodId, thread::ThreadId};

/// Unique identifier for objects stored inside the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, serde::Deserialize)]
pub struct ObjectId(u32);

impl ObjectId {
    /// Builds an id from a raw heap index.
    #[must_use]
    pub const fn from_index(index: u32) -> Self {
        Self(index)
    }

    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One frame of a captured backtrace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BacktraceEntry {
    /// Method executing in the frame, if the program counter maps to one.
    pub method: Option<MethodId>,
    /// Program counter of the frame at capture time.
    pub pc: usize,
}

/// Immutable stack snapshot taken when an exception is thrown.
///
/// Recapturing replaces the whole snapshot; entries are never edited in place.
pub type Backtrace = Arc<[BacktraceEntry]>;

/// Error returned when the heap cannot satisfy an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// The configured allocation limit has been reached.
    OutOfMemory { limit: usize },
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { limit } => write!(f, "heap exhausted: allocation limit of {limit} objects reached"),
        }
    }
}

impl std::error::Error for HeapError {}

/// Error returned by [`Monitor`] operations attempted by a thread that does not hold it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorError {
    /// The monitor is free or held by a different thread.
    NotOwner {
        /// Thread that attempted the operation.
        caller: ThreadId,
        /// Current holder, if any.
        holder: Option<ThreadId>,
    },
    /// The monitor is held by another thread; entering would block.
    Contended { holder: ThreadId },
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotOwner { caller, holder: Some(holder) } => {
                write!(f, "thread {caller} cannot exit a monitor held by thread {holder}")
            }
            Self::NotOwner { caller, holder: None } => {
                write!(f, "thread {caller} cannot exit an unowned monitor")
            }
            Self::Contended { holder } => write!(f, "monitor is held by thread {holder}"),
        }
    }
}

impl std::error::Error for MonitorError {}

/// A reentrant lock with holder identity, as attached to every object and class.
///
/// Entering never blocks: contended entry is reported as an error, since the
/// engine only ever needs to release locks the current thread already holds.
#[derive(Debug, Default)]
pub struct Monitor {
    /// Raw id of the holding thread, or `0` when free.
    holder: AtomicU64,
    /// Reentrancy depth; only meaningful while `holder` is set.
    depth: AtomicU32,
}

impl Monitor {
    /// Creates a free monitor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the thread currently holding this monitor.
    #[must_use]
    pub fn holder(&self) -> Option<ThreadId> {
        ThreadId::new(self.holder.load(Ordering::Acquire))
    }

    /// Returns the reentrancy depth (0 when free).
    #[must_use]
    pub fn depth(&self) -> u32 {
        if self.holder().is_some() {
            self.depth.load(Ordering::Acquire)
        } else {
            0
        }
    }

    /// Acquires the monitor for `thread`, or re-enters it if already held by `thread`.
    pub fn enter(&self, thread: ThreadId) -> Result<(), MonitorError> {
        match self
            .holder
            .compare_exchange(0, thread.get(), Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.depth.store(1, Ordering::Release);
                Ok(())
            }
            Err(current) if current == thread.get() => {
                self.depth.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            Err(current) => Err(MonitorError::Contended {
                holder: ThreadId::new(current).expect("compare_exchange failed on a non-zero holder"),
            }),
        }
    }

    /// Releases one level of the monitor held by `thread`.
    ///
    /// Only the holder may exit; any other caller gets [`MonitorError::NotOwner`]
    /// and the monitor is left untouched.
    pub fn exit(&self, thread: ThreadId) -> Result<(), MonitorError> {
        let holder = self.holder();
        if holder != Some(thread) {
            return Err(MonitorError::NotOwner { caller: thread, holder });
        }
        if self.depth.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.holder.store(0, Ordering::Release);
        }
        Ok(())
    }
}

/// A heap object: a plain instance or a throwable.
#[derive(Debug)]
pub struct Object {
    class: ClassId,
    message: Option<String>,
    cause: Option<ObjectId>,
    backtrace: Mutex<Backtrace>,
    monitor: Monitor,
}

impl Object {
    fn new(class: ClassId, message: Option<String>, cause: Option<ObjectId>) -> Self {
        Self {
            class,
            message,
            cause,
            backtrace: Mutex::new(Arc::from([])),
            monitor: Monitor::new(),
        }
    }

    /// Runtime class of the object.
    #[must_use]
    pub fn class(&self) -> ClassId {
        self.class
    }

    /// Detail message, if the object was constructed with one.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Wrapped cause, for initializer-error wrappers.
    #[must_use]
    pub fn cause(&self) -> Option<ObjectId> {
        self.cause
    }

    /// Returns the most recently captured backtrace.
    #[must_use]
    pub fn backtrace(&self) -> Backtrace {
        Arc::clone(&self.backtrace.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replaces the backtrace snapshot.
    pub fn set_backtrace(&self, backtrace: Backtrace) {
        *self.backtrace.lock().unwrap_or_else(PoisonError::into_inner) = backtrace;
    }

    /// The object's monitor.
    #[must_use]
    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }
}

/// Append-only, thread-safe object store with an optional allocation limit.
#[derive(Debug, Default)]
pub struct Heap {
    objects: RwLock<Vec<Arc<Object>>>,
    limit: Option<usize>,
    allocations: AtomicUsize,
}

impl Heap {
    /// Creates an empty heap; `limit` caps the number of live objects.
    #[must_use]
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            objects: RwLock::new(Vec::new()),
            limit,
            allocations: AtomicUsize::new(0),
        }
    }

    /// Allocates a plain instance of `class`.
    pub fn allocate_instance(&self, class: ClassId) -> Result<ObjectId, HeapError> {
        self.push(Object::new(class, None, None))
    }

    /// Allocates a throwable of `class` with an optional message and cause.
    pub fn allocate_throwable(
        &self,
        class: ClassId,
        message: Option<String>,
        cause: Option<ObjectId>,
    ) -> Result<ObjectId, HeapError> {
        self.push(Object::new(class, message, cause))
    }

    fn push(&self, object: Object) -> Result<ObjectId, HeapError> {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(limit) = self.limit
            && objects.len() >= limit
        {
            return Err(HeapError::OutOfMemory { limit });
        }
        let id = ObjectId(u32::try_from(objects.len()).expect("heap index exceeds u32"));
        objects.push(Arc::new(object));
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Looks up an object; `None` for an id this heap never handed out.
    #[must_use]
    pub fn get(&self, id: ObjectId) -> Option<Arc<Object>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id.index())
            .cloned()
    }

    /// Number of successful allocations over the heap's lifetime.
    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Number of objects currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the heap holds no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread(id: u64) -> ThreadId {
        ThreadId::new(id).unwrap()
    }

    #[test]
    fn monitor_is_reentrant_and_released_per_level() {
        let monitor = Monitor::new();
        monitor.enter(thread(1)).unwrap();
        monitor.enter(thread(1)).unwrap();
        assert_eq!(monitor.depth(), 2);
        monitor.exit(thread(1)).unwrap();
        assert_eq!(monitor.holder(), Some(thread(1)));
        monitor.exit(thread(1)).unwrap();
        assert_eq!(monitor.holder(), None);
        assert_eq!(monitor.depth(), 0);
    }

    #[test]
    fn monitor_refuses_foreign_exit() {
        let monitor = Monitor::new();
        monitor.enter(thread(1)).unwrap();
        assert_eq!(
            monitor.exit(thread(2)),
            Err(MonitorError::NotOwner {
                caller: thread(2),
                holder: Some(thread(1)),
            })
        );
        assert_eq!(monitor.enter(thread(2)), Err(MonitorError::Contended { holder: thread(1) }));
        assert_eq!(monitor.holder(), Some(thread(1)));
    }

    #[test]
    fn allocation_limit_reports_out_of_memory() {
        let heap = Heap::new(Some(1));
        let class = ClassId::from_index(0);
        heap.allocate_instance(class).unwrap();
        assert_eq!(heap.allocate_instance(class), Err(HeapError::OutOfMemory { limit: 1 }));
        assert_eq!(heap.allocation_count(), 1);
    }

    #[test]
    fn backtrace_is_replaced_wholesale() {
        let heap = Heap::new(None);
        let id = heap.allocate_throwable(ClassId::from_index(0), None, None).unwrap();
        let object = heap.get(id).unwrap();
        assert!(object.backtrace().is_empty());
        let first: Backtrace = Arc::from([BacktraceEntry { method: None, pc: 4 }]);
        object.set_backtrace(Arc::clone(&first));
        object.set_backtrace(Arc::from([]));
        assert_eq!(first.len(), 1);
        assert!(object.backtrace().is_empty());
    }
}
