//! Call frames and the frame walker.
//!
//! Interpreted and compiled frames share one machine stack. Both kinds are
//! kept in a single [`MachineStack`], keyed by their (simulated) frame
//! address, and each frame links to its caller by address. The stack grows
//! downwards: a caller always lives at a higher address than its callee.
//!
//! [`FrameWalker::next`] is the only way the engine moves to an older frame.
//! It refuses to follow a link that leaves the active stack segment, points at
//! an address with no frame, or does not move towards older frames, so a
//! corrupted chain ends the walk instead of running into foreign memory.

use std::{fmt, ops::Range};

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{
    heap::{Backtrace, BacktraceEntry, ObjectId},
    method::{MethodArea, MethodId},
};

/// Size of one frame on the simulated machine stack.
pub const FRAME_SIZE: usize = 0x40;

/// Address of a frame on the machine stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameAddr(usize);

impl FrameAddr {
    /// Wraps a raw stack address.
    #[must_use]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the raw stack address.
    #[must_use]
    pub fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for FrameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The active physical stack segment of a thread: `[base, limit)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackSegment {
    /// Lowest valid address.
    pub base: usize,
    /// One past the highest valid address.
    pub limit: usize,
}

impl StackSegment {
    /// Creates a segment spanning `range`.
    #[must_use]
    pub fn new(range: Range<usize>) -> Self {
        Self {
            base: range.start,
            limit: range.end,
        }
    }

    /// Whether `addr` lies inside the segment.
    #[must_use]
    pub fn contains(&self, addr: FrameAddr) -> bool {
        (self.base..self.limit).contains(&addr.get())
    }
}

/// A frame created by the bytecode interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpretedFrame {
    /// Bytecode offset of the instruction being executed.
    pub pc: usize,
    /// Method running in this frame.
    pub method: MethodId,
    /// `this` for instance methods; the lock target of a synchronized instance method.
    pub receiver: Option<ObjectId>,
    /// Calling frame, or `None` for the outermost frame.
    pub caller: Option<FrameAddr>,
    /// Marks the entry point of a foreign call back into managed code.
    pub native_boundary: bool,
}

/// A frame created by code-generated machine code.
///
/// The running method is not recorded in the frame; it is recovered from the
/// program counter through [`MethodArea::method_for_pc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompiledFrame {
    /// Return address / program counter in generated code.
    pub pc: usize,
    /// Spilled `this` slot, if the method has one.
    pub receiver: Option<ObjectId>,
    /// Calling frame, or `None` for the outermost frame.
    pub caller: Option<FrameAddr>,
}

/// One frame of either execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Interpreted(InterpretedFrame),
    Compiled(CompiledFrame),
}

impl Frame {
    /// Current program counter of the frame.
    #[must_use]
    pub fn pc(&self) -> usize {
        match self {
            Self::Interpreted(f) => f.pc,
            Self::Compiled(f) => f.pc,
        }
    }

    /// Sets the program counter, used when resuming at a handler.
    pub fn set_pc(&mut self, pc: usize) {
        match self {
            Self::Interpreted(f) => f.pc = pc,
            Self::Compiled(f) => f.pc = pc,
        }
    }

    /// Link to the calling frame.
    #[must_use]
    pub fn caller(&self) -> Option<FrameAddr> {
        match self {
            Self::Interpreted(f) => f.caller,
            Self::Compiled(f) => f.caller,
        }
    }

    /// Overwrites the caller link.
    pub fn set_caller(&mut self, caller: Option<FrameAddr>) {
        match self {
            Self::Interpreted(f) => f.caller = caller,
            Self::Compiled(f) => f.caller = caller,
        }
    }

    /// Receiver / lock slot of the frame.
    #[must_use]
    pub fn receiver(&self) -> Option<ObjectId> {
        match self {
            Self::Interpreted(f) => f.receiver,
            Self::Compiled(f) => f.receiver,
        }
    }

    /// Owning method: read directly from interpreted frames, looked up by pc for compiled ones.
    #[must_use]
    pub fn method(&self, methods: &MethodArea) -> Option<MethodId> {
        match self {
            Self::Interpreted(f) => Some(f.method),
            Self::Compiled(f) => methods.method_for_pc(f.pc),
        }
    }

    /// Whether this frame is the managed side of a foreign-call boundary.
    ///
    /// Compiled frames qualify when their pc is inside a foreign-call trampoline
    /// or inside the code of a native method.
    #[must_use]
    pub fn is_foreign_boundary(&self, methods: &MethodArea) -> bool {
        match self {
            Self::Interpreted(f) => f.native_boundary,
            Self::Compiled(f) => {
                methods.is_foreign_pc(f.pc)
                    || methods
                        .method_for_pc(f.pc)
                        .is_some_and(|method| methods.get(method).is_native())
            }
        }
    }
}

/// Error returned when pushing a frame would leave the stack segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackOverflow {
    /// Segment that ran out of room.
    pub segment: StackSegment,
}

impl fmt::Display for StackOverflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stack overflow: segment {:#x}..{:#x} is full",
            self.segment.base, self.segment.limit
        )
    }
}

impl std::error::Error for StackOverflow {}

/// The frames of one thread, addressed by their position on the machine stack.
#[derive(Debug, Clone)]
pub struct MachineStack {
    segment: StackSegment,
    frames: AHashMap<FrameAddr, Frame>,
    top: Option<FrameAddr>,
}

impl MachineStack {
    /// Creates an empty stack over `segment`.
    #[must_use]
    pub fn new(segment: StackSegment) -> Self {
        Self {
            segment,
            frames: AHashMap::new(),
            top: None,
        }
    }

    /// The active stack segment.
    #[must_use]
    pub fn segment(&self) -> StackSegment {
        self.segment
    }

    /// Innermost (most recent) frame.
    #[must_use]
    pub fn top(&self) -> Option<FrameAddr> {
        self.top
    }

    /// Number of frames on the stack.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Returns the frame at `addr`.
    #[must_use]
    pub fn frame(&self, addr: FrameAddr) -> Option<&Frame> {
        self.frames.get(&addr)
    }

    /// Returns the frame at `addr` mutably.
    pub fn frame_mut(&mut self, addr: FrameAddr) -> Option<&mut Frame> {
        self.frames.get_mut(&addr)
    }

    /// Pushes an interpreted frame on top of the current one.
    pub fn push_interpreted(
        &mut self,
        method: MethodId,
        pc: usize,
        receiver: Option<ObjectId>,
    ) -> Result<FrameAddr, StackOverflow> {
        let caller = self.top;
        self.push(Frame::Interpreted(InterpretedFrame {
            pc,
            method,
            receiver,
            caller,
            native_boundary: false,
        }))
    }

    /// Pushes the interpreted frame through which foreign code called back into `method`.
    pub fn push_native_boundary(&mut self, method: MethodId, pc: usize) -> Result<FrameAddr, StackOverflow> {
        let caller = self.top;
        self.push(Frame::Interpreted(InterpretedFrame {
            pc,
            method,
            receiver: None,
            caller,
            native_boundary: true,
        }))
    }

    /// Pushes a compiled frame on top of the current one.
    pub fn push_compiled(&mut self, pc: usize, receiver: Option<ObjectId>) -> Result<FrameAddr, StackOverflow> {
        let caller = self.top;
        self.push(Frame::Compiled(CompiledFrame { pc, receiver, caller }))
    }

    fn push(&mut self, frame: Frame) -> Result<FrameAddr, StackOverflow> {
        let next = match self.top {
            Some(top) => top.get().checked_sub(FRAME_SIZE),
            None => self.segment.limit.checked_sub(FRAME_SIZE),
        };
        let addr = match next {
            Some(addr) if addr >= self.segment.base => FrameAddr(addr),
            _ => return Err(StackOverflow { segment: self.segment }),
        };
        self.insert_at(addr, frame);
        Ok(addr)
    }

    /// Places `frame` at an explicit address and makes it the top frame.
    ///
    /// Unlike the `push_*` methods this does not link the frame to the previous
    /// top nor check the address against the segment; it exists to model
    /// hand-built and damaged stacks.
    pub fn insert_at(&mut self, addr: FrameAddr, frame: Frame) {
        self.frames.insert(addr, frame);
        self.top = Some(addr);
    }

    /// Discards every frame younger than `addr`, making `addr` the top frame.
    pub fn unwind_to(&mut self, addr: FrameAddr) {
        self.frames.retain(|&frame_addr, _| frame_addr >= addr);
        self.top = Some(addr);
    }

    /// Returns a walker over this stack.
    #[must_use]
    pub fn walker(&self) -> FrameWalker<'_> {
        FrameWalker { stack: self }
    }

    /// Captures a backtrace starting at `start`, innermost frame first.
    #[must_use]
    pub fn capture_backtrace(&self, start: Option<FrameAddr>, methods: &MethodArea) -> Backtrace {
        let mut entries: SmallVec<[BacktraceEntry; 16]> = SmallVec::new();
        if let Some(start) = start {
            for (_, frame) in self.walker().frames_from(start) {
                entries.push(BacktraceEntry {
                    method: frame.method(methods),
                    pc: frame.pc(),
                });
            }
        }
        entries.into_iter().collect()
    }
}

/// Moves from a frame to its caller, refusing to leave the stack segment.
#[derive(Debug, Clone, Copy)]
pub struct FrameWalker<'s> {
    stack: &'s MachineStack,
}

impl<'s> FrameWalker<'s> {
    /// Returns the caller of `addr`.
    ///
    /// `None` when the link is empty, leaves the active segment, does not point
    /// to an older (higher) address, or names an address holding no frame. The
    /// outermost frame and a corrupted chain are indistinguishable.
    #[must_use]
    pub fn next(&self, addr: FrameAddr) -> Option<FrameAddr> {
        let caller = self.stack.frame(addr)?.caller()?;
        if caller > addr && self.stack.segment.contains(caller) && self.stack.frames.contains_key(&caller) {
            Some(caller)
        } else {
            None
        }
    }

    /// Iterates from `start` towards the outermost frame.
    ///
    /// Yields nothing if `start` itself is not a live frame.
    pub fn frames_from(self, start: FrameAddr) -> impl Iterator<Item = (FrameAddr, &'s Frame)> {
        let first = self
            .stack
            .frame(start)
            .filter(|_| self.stack.segment.contains(start))
            .map(|_| start);
        std::iter::successors(first, move |&addr| self.next(addr))
            .filter_map(move |addr| self.stack.frame(addr).map(|frame| (addr, frame)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::{AccessFlags, Method};

    fn segment() -> StackSegment {
        StackSegment::new(0x1000..0x2000)
    }

    #[test]
    fn walker_follows_callers_to_the_outermost_frame() {
        let mut stack = MachineStack::new(segment());
        let outer = stack.push_interpreted(MethodId::from_index(0), 1, None).unwrap();
        let middle = stack.push_compiled(0x4000, None).unwrap();
        let inner = stack.push_interpreted(MethodId::from_index(1), 2, None).unwrap();

        let walker = stack.walker();
        assert_eq!(walker.next(inner), Some(middle));
        assert_eq!(walker.next(middle), Some(outer));
        assert_eq!(walker.next(outer), None);
        let addrs: Vec<_> = walker.frames_from(inner).map(|(addr, _)| addr).collect();
        assert_eq!(addrs, vec![inner, middle, outer]);
    }

    #[test]
    fn walker_stops_at_links_outside_the_segment() {
        let mut stack = MachineStack::new(segment());
        let frame = Frame::Compiled(CompiledFrame {
            pc: 0x4000,
            receiver: None,
            caller: Some(FrameAddr::new(0x9000)),
        });
        stack.insert_at(FrameAddr::new(0x1f00), frame);
        // a frame exists at the bogus address, but it is outside the segment
        stack.frames.insert(
            FrameAddr::new(0x9000),
            Frame::Compiled(CompiledFrame {
                pc: 0,
                receiver: None,
                caller: None,
            }),
        );
        assert_eq!(stack.walker().next(FrameAddr::new(0x1f00)), None);
    }

    #[test]
    fn walker_refuses_links_towards_younger_frames() {
        let mut stack = MachineStack::new(segment());
        let looping = Frame::Compiled(CompiledFrame {
            pc: 0x4000,
            receiver: None,
            caller: Some(FrameAddr::new(0x1e00)),
        });
        stack.insert_at(FrameAddr::new(0x1e00), looping);
        assert_eq!(stack.walker().next(FrameAddr::new(0x1e00)), None);
    }

    #[test]
    fn compiled_frames_in_native_code_are_foreign_boundaries() {
        let class = crate::class::ClassId::from_index(0);
        let mut methods = MethodArea::new();
        methods
            .define(
                Method::new("bridge", class)
                    .with_flags(AccessFlags::NATIVE)
                    .with_code_range(0x5000..0x5100),
            )
            .unwrap();
        methods
            .define(Method::new("managed", class).with_code_range(0x6000..0x6100))
            .unwrap();
        methods.add_foreign_range(0x8000..0x8100);

        let compiled = |pc| {
            Frame::Compiled(CompiledFrame {
                pc,
                receiver: None,
                caller: None,
            })
        };
        assert!(compiled(0x5010).is_foreign_boundary(&methods));
        assert!(compiled(0x8010).is_foreign_boundary(&methods));
        assert!(!compiled(0x6010).is_foreign_boundary(&methods));
        assert!(!compiled(0x7000).is_foreign_boundary(&methods));
    }

    #[test]
    fn push_fails_when_segment_is_full() {
        let mut stack = MachineStack::new(StackSegment::new(0x1000..0x1000 + 2 * FRAME_SIZE));
        stack.push_compiled(1, None).unwrap();
        stack.push_compiled(2, None).unwrap();
        assert!(stack.push_compiled(3, None).is_err());
    }

    #[test]
    fn unwind_to_drops_younger_frames() {
        let mut stack = MachineStack::new(segment());
        let outer = stack.push_compiled(1, None).unwrap();
        stack.push_compiled(2, None).unwrap();
        stack.push_compiled(3, None).unwrap();
        stack.unwind_to(outer);
        assert_eq!(stack.top(), Some(outer));
        assert_eq!(stack.depth(), 1);
    }
}
