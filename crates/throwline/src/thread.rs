//! Per-thread execution context.
//!
//! All the thread-local state the dispatcher touches lives on [`ExecThread`]:
//! the machine stack, the slot holding the exception currently being
//! dispatched, the stack-requirement flag raised during a transfer to a
//! handler, and the pending exception handed across a foreign-call boundary.

use std::{fmt, num::NonZeroU64};

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{
    frame::{FrameAddr, MachineStack, StackOverflow, StackSegment},
    heap::ObjectId,
    method::MethodId,
};

/// Identity of a VM thread, used as monitor holder identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(NonZeroU64);

impl ThreadId {
    /// Returns `None` for `0`, which is reserved for "no thread".
    #[must_use]
    pub fn new(id: u64) -> Option<Self> {
        NonZeroU64::new(id).map(Self)
    }

    /// Raw id value.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How much free stack the thread must currently assume it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StackRequirement {
    /// Ordinary stack-overflow checking.
    #[default]
    Normal,
    /// Set while control is transferred to a handler so that stack checks do
    /// not fire part-way through the unwind.
    High,
}

/// Execution context of a single VM thread.
#[derive(Debug)]
pub struct ExecThread {
    id: ThreadId,
    stack: MachineStack,
    exception_object: Option<ObjectId>,
    stack_requirement: StackRequirement,
    interrupts_disabled: bool,
    foreign_pending: Option<ObjectId>,
    terminated: bool,
}

impl ExecThread {
    /// Creates a thread with an empty stack over `segment`.
    #[must_use]
    pub fn new(id: ThreadId, segment: StackSegment) -> Self {
        Self {
            id,
            stack: MachineStack::new(segment),
            exception_object: None,
            stack_requirement: StackRequirement::Normal,
            interrupts_disabled: false,
            foreign_pending: None,
            terminated: false,
        }
    }

    /// Thread identity.
    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// The thread's machine stack.
    #[must_use]
    pub fn stack(&self) -> &MachineStack {
        &self.stack
    }

    /// The thread's machine stack, mutably.
    pub fn stack_mut(&mut self) -> &mut MachineStack {
        &mut self.stack
    }

    /// Innermost frame.
    #[must_use]
    pub fn top_frame(&self) -> Option<FrameAddr> {
        self.stack.top()
    }

    /// Pushes an interpreted frame.
    pub fn push_interpreted(
        &mut self,
        method: MethodId,
        pc: usize,
        receiver: Option<ObjectId>,
    ) -> Result<FrameAddr, StackOverflow> {
        self.stack.push_interpreted(method, pc, receiver)
    }

    /// Pushes a compiled frame.
    pub fn push_compiled(&mut self, pc: usize, receiver: Option<ObjectId>) -> Result<FrameAddr, StackOverflow> {
        self.stack.push_compiled(pc, receiver)
    }

    /// Pushes the frame marking a foreign call back into managed code.
    pub fn push_native_boundary(&mut self, method: MethodId, pc: usize) -> Result<FrameAddr, StackOverflow> {
        self.stack.push_native_boundary(method, pc)
    }

    /// Exception currently being dispatched on this thread.
    #[must_use]
    pub fn exception_object(&self) -> Option<ObjectId> {
        self.exception_object
    }

    pub(crate) fn set_exception_object(&mut self, exception: Option<ObjectId>) {
        self.exception_object = exception;
    }

    /// Current stack requirement.
    #[must_use]
    pub fn stack_requirement(&self) -> StackRequirement {
        self.stack_requirement
    }

    pub(crate) fn require_high_stack(&mut self) {
        self.stack_requirement = StackRequirement::High;
    }

    /// Called by the code runner once it has resumed at a handler.
    pub fn clear_stack_requirement(&mut self) {
        self.stack_requirement = StackRequirement::Normal;
    }

    /// Whether interrupts are disabled on this thread.
    #[must_use]
    pub fn interrupts_disabled(&self) -> bool {
        self.interrupts_disabled
    }

    /// Marks interrupts as disabled or enabled.
    ///
    /// Dispatching an exception while they are disabled is a hard error.
    pub fn set_interrupts_disabled(&mut self, disabled: bool) {
        self.interrupts_disabled = disabled;
    }

    /// Exception handed to the foreign caller by the boundary bridge, if any.
    #[must_use]
    pub fn foreign_pending(&self) -> Option<ObjectId> {
        self.foreign_pending
    }

    /// Takes the exception handed across the foreign-call boundary.
    pub fn take_foreign_pending(&mut self) -> Option<ObjectId> {
        self.foreign_pending.take()
    }

    pub(crate) fn set_foreign_pending(&mut self, exception: ObjectId) {
        self.foreign_pending = Some(exception);
    }

    /// Whether the thread has been torn down by an unhandled termination exception.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub(crate) fn terminate(&mut self) {
        self.terminated = true;
        self.exception_object = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread() -> ExecThread {
        ExecThread::new(ThreadId::new(1).unwrap(), StackSegment::new(0x1000..0x2000))
    }

    #[test]
    fn thread_id_zero_is_reserved() {
        assert_eq!(ThreadId::new(0), None);
        assert_eq!(ThreadId::new(9).map(ThreadId::get), Some(9));
    }

    #[test]
    fn stack_requirement_round_trip() {
        let mut thread = thread();
        assert_eq!(thread.stack_requirement(), StackRequirement::Normal);
        thread.require_high_stack();
        assert_eq!(thread.stack_requirement().to_string(), "high");
        thread.clear_stack_requirement();
        assert_eq!(thread.stack_requirement(), StackRequirement::Normal);
    }

    #[test]
    fn terminate_clears_exception_slot() {
        let mut thread = thread();
        thread.set_exception_object(Some(ObjectId::from_index(3)));
        thread.terminate();
        assert!(thread.is_terminated());
        assert_eq!(thread.exception_object(), None);
    }

    #[test]
    fn foreign_pending_is_taken_once() {
        let mut thread = thread();
        thread.set_foreign_pending(ObjectId::from_index(1));
        assert_eq!(thread.take_foreign_pending(), Some(ObjectId::from_index(1)));
        assert_eq!(thread.take_foreign_pending(), None);
    }
}
