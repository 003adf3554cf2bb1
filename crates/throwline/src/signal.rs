//! Hardware trap bridge.
//!
//! The host's trap-delivery mechanism (a SIGSEGV/SIGFPE handler in a real
//! runtime) calls into the engine with the frame that was executing when the
//! trap fired. The engine supplies one [`TrapTarget`] per [`TrapKind`],
//! registered once by [`Runtime::init_exceptions`](crate::Runtime::init_exceptions).
//! Firing a target reuses a preallocated exception object, so nothing is
//! allocated on the trap path, but the object's backtrace is recaptured from
//! the trap frame every time.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    class::WellKnownClass,
    construct::ExceptionConstructor,
    dispatch::{Dispatcher, Unwind},
    frame::FrameAddr,
    heap::ObjectId,
    io::DiagnosticWriter,
    thread::ExecThread,
    tracer::DispatchTracer,
};

/// A hardware trap the engine converts into an exception.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TrapKind {
    /// A memory access through a null reference.
    NullPointer,
    /// An arithmetic fault such as integer division by zero.
    Arithmetic,
}

impl TrapKind {
    /// Class of the preallocated exception thrown for this trap.
    #[must_use]
    pub fn exception_class(self) -> WellKnownClass {
        match self {
            Self::NullPointer => WellKnownClass::NullPointerException,
            Self::Arithmetic => WellKnownClass::ArithmeticException,
        }
    }

    fn slot(self) -> usize {
        match self {
            Self::NullPointer => 0,
            Self::Arithmetic => 1,
        }
    }
}

/// The engine-side callback for one trap kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapTarget {
    /// Trap this target handles.
    pub kind: TrapKind,
    /// Preallocated exception thrown when the trap fires.
    pub exception: ObjectId,
}

impl TrapTarget {
    /// Throws the preallocated exception, searching for a handler from `frame`.
    pub fn fire<C, W, Tr>(
        self,
        dispatcher: &mut Dispatcher<'_, C, W, Tr>,
        thread: &mut ExecThread,
        frame: FrameAddr,
    ) -> Unwind
    where
        C: ExceptionConstructor,
        W: DiagnosticWriter,
        Tr: DispatchTracer,
    {
        dispatcher.dispatch_trap(thread, self, frame)
    }
}

/// Host-side registration of trap callbacks.
///
/// Called by the engine during initialization, once per [`TrapKind`].
pub trait TrapInstaller {
    fn install(&mut self, target: TrapTarget);
}

/// Trap installer that keeps the targets in a table, for hosts that route
/// traps in-process.
#[derive(Debug, Clone, Default)]
pub struct TrapTable {
    targets: [Option<TrapTarget>; 2],
}

impl TrapTable {
    /// Creates a table with nothing installed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installed target for `kind`, if any.
    #[must_use]
    pub fn target(&self, kind: TrapKind) -> Option<TrapTarget> {
        self.targets[kind.slot()]
    }

    /// Delivers a trap of `kind` that fired while `frame` was executing.
    ///
    /// Returns `None` when no target is installed for `kind`.
    pub fn deliver<C, W, Tr>(
        &self,
        kind: TrapKind,
        dispatcher: &mut Dispatcher<'_, C, W, Tr>,
        thread: &mut ExecThread,
        frame: FrameAddr,
    ) -> Option<Unwind>
    where
        C: ExceptionConstructor,
        W: DiagnosticWriter,
        Tr: DispatchTracer,
    {
        self.target(kind).map(|target| target.fire(dispatcher, thread, frame))
    }
}

impl TrapInstaller for TrapTable {
    fn install(&mut self, target: TrapTarget) {
        self.targets[target.kind.slot()] = Some(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_parse_from_snake_case() {
        assert_eq!("null_pointer".parse::<TrapKind>(), Ok(TrapKind::NullPointer));
        assert_eq!(TrapKind::Arithmetic.to_string(), "arithmetic");
    }

    #[test]
    fn table_holds_one_target_per_kind() {
        let mut table = TrapTable::new();
        assert_eq!(table.target(TrapKind::Arithmetic), None);
        let target = TrapTarget {
            kind: TrapKind::Arithmetic,
            exception: ObjectId::from_index(2),
        };
        table.install(target);
        assert_eq!(table.target(TrapKind::Arithmetic), Some(target));
        assert_eq!(table.target(TrapKind::NullPointer), None);
    }
}
