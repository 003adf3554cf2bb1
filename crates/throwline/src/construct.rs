//! The object-construction seam used when a pending error is materialized.

use std::fmt;

use crate::{
    class::WellKnownClass,
    heap::{HeapError, ObjectId},
    runtime::Runtime,
};

/// Argument passed to an exception class's constructor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstructorArg {
    /// The no-argument constructor; the object has no detail message.
    None,
    /// The `(String)` constructor, with the detail message.
    Message(String),
    /// The `(Throwable)` constructor, with the wrapped cause.
    Cause(ObjectId),
}

/// Why a constructor did not return a new object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstructError {
    /// Construction itself raised this exception; it is thrown in place of
    /// the one being built.
    Thrown(ObjectId),
    /// Memory ran out before the preallocated out-of-memory exception existed.
    OutOfMemoryUnavailable,
}

impl fmt::Display for ConstructError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thrown(id) => write!(f, "constructor threw object {}", id.index()),
            Self::OutOfMemoryUnavailable => write!(f, "out of memory before exceptions were initialized"),
        }
    }
}

impl std::error::Error for ConstructError {}

/// Runs user-level exception constructors.
///
/// Implement this to route construction through a real interpreter; the
/// default [`NativeConstructor`] allocates the object directly.
pub trait ExceptionConstructor {
    /// Constructs an instance of `class_name` with `arg`.
    fn construct(&mut self, runtime: &Runtime, class_name: &str, arg: ConstructorArg) -> Result<ObjectId, ConstructError>;
}

impl<C: ExceptionConstructor + ?Sized> ExceptionConstructor for &mut C {
    fn construct(&mut self, runtime: &Runtime, class_name: &str, arg: ConstructorArg) -> Result<ObjectId, ConstructError> {
        (**self).construct(runtime, class_name, arg)
    }
}

/// Constructor that allocates throwables straight on the heap.
///
/// An unknown class throws `java.lang.NoClassDefFoundError` naming it; a full
/// heap throws the preallocated out-of-memory exception.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeConstructor;

impl ExceptionConstructor for NativeConstructor {
    fn construct(&mut self, runtime: &Runtime, class_name: &str, arg: ConstructorArg) -> Result<ObjectId, ConstructError> {
        let Some(class) = runtime.classes().lookup(class_name) else {
            let missing = runtime.well_known(WellKnownClass::NoClassDefFoundError);
            let thrown = runtime
                .heap()
                .allocate_throwable(missing, Some(class_name.to_owned()), None)
                .map_err(|err| out_of_memory(runtime, err))?;
            return Err(ConstructError::Thrown(thrown));
        };
        let (message, cause) = match arg {
            ConstructorArg::None => (None, None),
            ConstructorArg::Message(message) => (Some(message), None),
            ConstructorArg::Cause(cause) => (None, Some(cause)),
        };
        runtime
            .heap()
            .allocate_throwable(class, message, cause)
            .map_err(|err| out_of_memory(runtime, err))
    }
}

fn out_of_memory(runtime: &Runtime, _err: HeapError) -> ConstructError {
    match runtime.preallocated() {
        Some(pre) => ConstructError::Thrown(pre.out_of_memory),
        None => ConstructError::OutOfMemoryUnavailable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::EngineConfig, signal::TrapTable};

    #[test]
    fn message_constructor_sets_message() {
        let runtime = Runtime::default();
        let id = NativeConstructor
            .construct(&runtime, "java.lang.Error", ConstructorArg::Message("bad".to_owned()))
            .unwrap();
        let object = runtime.heap().get(id).unwrap();
        assert_eq!(runtime.classes().name(object.class()), "java.lang.Error");
        assert_eq!(object.message(), Some("bad"));
    }

    #[test]
    fn unknown_class_throws_no_class_def_found() {
        let runtime = Runtime::default();
        let err = NativeConstructor
            .construct(&runtime, "app.Missing", ConstructorArg::None)
            .unwrap_err();
        let ConstructError::Thrown(id) = err else {
            panic!("expected a thrown object, got {err:?}");
        };
        let object = runtime.heap().get(id).unwrap();
        assert_eq!(runtime.classes().name(object.class()), "java.lang.NoClassDefFoundError");
        assert_eq!(object.message(), Some("app.Missing"));
    }

    #[test]
    fn full_heap_throws_preallocated_out_of_memory() {
        let runtime = Runtime::new(EngineConfig::default().with_heap_allocation_limit(3));
        let pre = *runtime.init_exceptions(&mut TrapTable::new()).unwrap();
        let err = NativeConstructor
            .construct(&runtime, "java.lang.Error", ConstructorArg::None)
            .unwrap_err();
        assert_eq!(err, ConstructError::Thrown(pre.out_of_memory));
    }

    #[test]
    fn full_heap_before_init_has_nothing_to_throw() {
        let runtime = Runtime::new(EngineConfig::default().with_heap_allocation_limit(0));
        let err = NativeConstructor
            .construct(&runtime, "java.lang.Error", ConstructorArg::None)
            .unwrap_err();
        assert_eq!(err, ConstructError::OutOfMemoryUnavailable);
    }
}
