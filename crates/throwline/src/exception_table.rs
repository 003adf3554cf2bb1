//! Per-method exception tables and handler lookup.
//!
//! Each entry protects an inclusive `[start_pc, end_pc]` range and names its
//! catch type symbolically, as a constant-pool index of the declaring class.
//! Index 0 catches everything. Other catch types are resolved the first time
//! a lookup reaches the entry, and the outcome (the class, or the fact that
//! it cannot be resolved) is cached in the entry for good.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::{
    class::{ClassId, ClassTable},
    error_info::ErrorDescriptor,
    method::Method,
    tracer::DispatchTracer,
};

/// Constant-pool index that matches any exception class.
pub const CATCH_ANY: u16 = 0;

const UNRESOLVED: u32 = 0;
const UNRESOLVABLE: u32 = u32::MAX;

/// Resolution state of an entry's catch type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchType {
    /// Only the symbolic index is known.
    Unresolved,
    /// Resolved to a loaded class.
    Resolved(ClassId),
    /// A previous resolution attempt failed; the entry never matches again.
    Unresolvable,
}

/// Atomic tri-state cache for a catch type.
///
/// The only transitions are out of [`CatchType::Unresolved`]. Publishing uses a
/// compare-and-swap, so when two threads resolve the same entry concurrently
/// the first write wins and the other adopts it; a cached state is never
/// replaced.
#[derive(Debug, Default)]
pub struct CatchTypeCell(AtomicU32);

impl CatchTypeCell {
    /// Creates an unresolved cell.
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicU32::new(UNRESOLVED))
    }

    /// Reads the current state.
    #[must_use]
    pub fn load(&self) -> CatchType {
        decode(self.0.load(Ordering::Acquire))
    }

    /// Publishes a resolution outcome, returning the state now cached.
    ///
    /// Publishing [`CatchType::Unresolved`] is a no-op.
    pub fn publish(&self, outcome: CatchType) -> CatchType {
        let raw = match outcome {
            CatchType::Unresolved => return self.load(),
            CatchType::Resolved(class) => class.raw().checked_add(1).filter(|&raw| raw != UNRESOLVABLE),
            CatchType::Unresolvable => Some(UNRESOLVABLE),
        };
        let raw = raw.expect("class id too large for the catch-type cache");
        match self
            .0
            .compare_exchange(UNRESOLVED, raw, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => outcome,
            Err(existing) => decode(existing),
        }
    }
}

fn decode(raw: u32) -> CatchType {
    match raw {
        UNRESOLVED => CatchType::Unresolved,
        UNRESOLVABLE => CatchType::Unresolvable,
        raw => CatchType::Resolved(ClassId::from_index(raw - 1)),
    }
}

/// One protected range of a method.
#[derive(Debug)]
pub struct ExceptionEntry {
    start_pc: usize,
    end_pc: usize,
    handler_pc: usize,
    catch_index: u16,
    catch_type: CatchTypeCell,
}

impl ExceptionEntry {
    /// Creates an entry catching the class at constant-pool `catch_index`
    /// ([`CATCH_ANY`] for a catch-all).
    #[must_use]
    pub fn new(start_pc: usize, end_pc: usize, handler_pc: usize, catch_index: u16) -> Self {
        Self {
            start_pc,
            end_pc,
            handler_pc,
            catch_index,
            catch_type: CatchTypeCell::new(),
        }
    }

    /// Creates a catch-all entry.
    #[must_use]
    pub fn catch_any(start_pc: usize, end_pc: usize, handler_pc: usize) -> Self {
        Self::new(start_pc, end_pc, handler_pc, CATCH_ANY)
    }

    /// Whether `pc` falls inside the protected range.
    ///
    /// Both ends are inclusive: a pc equal to `end_pc` is covered.
    #[must_use]
    pub fn covers(&self, pc: usize) -> bool {
        self.start_pc <= pc && pc <= self.end_pc
    }

    #[must_use]
    pub fn start_pc(&self) -> usize {
        self.start_pc
    }

    #[must_use]
    pub fn end_pc(&self) -> usize {
        self.end_pc
    }

    #[must_use]
    pub fn handler_pc(&self) -> usize {
        self.handler_pc
    }

    #[must_use]
    pub fn catch_index(&self) -> u16 {
        self.catch_index
    }

    /// Cached resolution state of the catch type.
    #[must_use]
    pub fn catch_type(&self) -> CatchType {
        self.catch_type.load()
    }

    /// The cache cell itself, for publishing outcomes directly.
    #[must_use]
    pub fn catch_type_cell(&self) -> &CatchTypeCell {
        &self.catch_type
    }
}

/// Ordered list of a method's protected ranges.
///
/// Entries are searched in stored order and the first match wins; the code
/// producer is expected to emit innermost ranges first.
#[derive(Debug, Default)]
pub struct ExceptionTable {
    entries: Vec<ExceptionEntry>,
}

impl ExceptionTable {
    /// Creates a table from entries in search order.
    #[must_use]
    pub fn new(entries: Vec<ExceptionEntry>) -> Self {
        Self { entries }
    }

    /// Entries in search order.
    #[must_use]
    pub fn entries(&self) -> &[ExceptionEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<ExceptionEntry> for ExceptionTable {
    fn from_iter<I: IntoIterator<Item = ExceptionEntry>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Outcome of searching one method for a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerLookup {
    /// Entry `entry` covers the pc and catches the exception.
    Matched { handler_pc: usize, entry: usize },
    /// No entry applies.
    NotMatched,
    /// Resolving a catch type failed. The entry is now cached as unresolvable
    /// and the search must be abandoned in favour of raising this error.
    ResolutionFailed(ErrorDescriptor),
}

/// Searches `method`'s exception table for a handler of `exception_class` at `pc`.
///
/// Catch types are resolved against the method's declaring class on first use.
/// A resolution failure ends the search immediately, even if a later entry
/// would have matched.
pub fn find_handler(
    pc: usize,
    exception_class: ClassId,
    method: &Method,
    classes: &ClassTable,
    message_capacity: usize,
    tracer: &mut impl DispatchTracer,
) -> HandlerLookup {
    let Some(table) = method.exception_table() else {
        return HandlerLookup::NotMatched;
    };

    for (index, entry) in table.entries().iter().enumerate() {
        if !entry.covers(pc) {
            continue;
        }
        if entry.catch_index == CATCH_ANY {
            return HandlerLookup::Matched {
                handler_pc: entry.handler_pc,
                entry: index,
            };
        }

        let catch_class = match entry.catch_type() {
            CatchType::Resolved(class) => class,
            CatchType::Unresolvable => continue,
            CatchType::Unresolved => {
                match classes.resolve_class_ref(entry.catch_index, method.class(), message_capacity) {
                    Ok(class) => match entry.catch_type.publish(CatchType::Resolved(class)) {
                        CatchType::Resolved(class) => {
                            tracer.on_catch_resolved(classes.name(class));
                            class
                        }
                        // another thread gave up on this entry first
                        _ => continue,
                    },
                    Err(desc) => {
                        entry.catch_type.publish(CatchType::Unresolvable);
                        tracer.on_catch_unresolvable(desc.class_name().unwrap_or_default());
                        return HandlerLookup::ResolutionFailed(desc);
                    }
                }
            }
        };

        if classes.is_subclass_of(exception_class, catch_class) {
            return HandlerLookup::Matched {
                handler_pc: entry.handler_pc,
                entry: index,
            };
        }
    }
    HandlerLookup::NotMatched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        class::WellKnownClass,
        config::DEFAULT_MAX_ERROR_MESSAGE_SIZE,
        tracer::{NoopTracer, RecordingTracer, TraceEvent},
    };

    struct Fixture {
        classes: ClassTable,
        main: ClassId,
    }

    impl Fixture {
        fn new() -> Self {
            let mut classes = ClassTable::with_bootstrap_classes();
            let main = classes.define("app.Main", Some("java.lang.Object")).unwrap();
            Self { classes, main }
        }

        fn class(&self, class: WellKnownClass) -> ClassId {
            self.classes.well_known(class).unwrap()
        }

        fn lookup(&self, method: &Method, pc: usize, class: ClassId) -> HandlerLookup {
            find_handler(
                pc,
                class,
                method,
                &self.classes,
                DEFAULT_MAX_ERROR_MESSAGE_SIZE,
                &mut NoopTracer,
            )
        }
    }

    #[test]
    fn arithmetic_entry_catches_only_arithmetic() {
        let mut fx = Fixture::new();
        let idx = fx.classes.add_class_ref(fx.main, "java.lang.ArithmeticException");
        let method = Method::new("divide", fx.main)
            .with_exception_table(ExceptionTable::new(vec![ExceptionEntry::new(0x10, 0x20, 0x30, idx)]));

        assert_eq!(
            fx.lookup(&method, 0x18, fx.class(WellKnownClass::ArithmeticException)),
            HandlerLookup::Matched {
                handler_pc: 0x30,
                entry: 0
            }
        );
        assert_eq!(
            fx.lookup(&method, 0x18, fx.class(WellKnownClass::NullPointerException)),
            HandlerLookup::NotMatched
        );
    }

    #[test]
    fn range_is_inclusive_at_both_ends() {
        let fx = Fixture::new();
        let method = Method::new("m", fx.main)
            .with_exception_table(ExceptionTable::new(vec![ExceptionEntry::catch_any(0x10, 0x20, 0x30)]));
        let class = fx.class(WellKnownClass::Error);
        assert!(matches!(fx.lookup(&method, 0x10, class), HandlerLookup::Matched { .. }));
        assert!(matches!(fx.lookup(&method, 0x20, class), HandlerLookup::Matched { .. }));
        assert_eq!(fx.lookup(&method, 0x0f, class), HandlerLookup::NotMatched);
        assert_eq!(fx.lookup(&method, 0x21, class), HandlerLookup::NotMatched);
    }

    #[test]
    fn ancestor_catch_type_matches_subclasses() {
        let mut fx = Fixture::new();
        let idx = fx.classes.add_class_ref(fx.main, "java.lang.RuntimeException");
        let method = Method::new("m", fx.main)
            .with_exception_table(ExceptionTable::new(vec![ExceptionEntry::new(0, 10, 50, idx)]));
        for class in [
            WellKnownClass::RuntimeException,
            WellKnownClass::NullPointerException,
            WellKnownClass::ArithmeticException,
        ] {
            assert!(matches!(fx.lookup(&method, 5, fx.class(class)), HandlerLookup::Matched { .. }));
        }
        assert_eq!(
            fx.lookup(&method, 5, fx.class(WellKnownClass::Exception)),
            HandlerLookup::NotMatched
        );
    }

    #[test]
    fn first_matching_entry_wins() {
        let mut fx = Fixture::new();
        let npe = fx.classes.add_class_ref(fx.main, "java.lang.NullPointerException");
        let method = Method::new("m", fx.main).with_exception_table(ExceptionTable::new(vec![
            ExceptionEntry::new(4, 8, 100, npe),
            ExceptionEntry::catch_any(0, 20, 200),
        ]));
        assert_eq!(
            fx.lookup(&method, 6, fx.class(WellKnownClass::NullPointerException)),
            HandlerLookup::Matched {
                handler_pc: 100,
                entry: 0
            }
        );
        assert_eq!(
            fx.lookup(&method, 6, fx.class(WellKnownClass::Error)),
            HandlerLookup::Matched {
                handler_pc: 200,
                entry: 1
            }
        );
    }

    #[test]
    fn unresolvable_catch_type_fails_once_then_is_skipped() {
        let mut fx = Fixture::new();
        let gone = fx.classes.add_class_ref(fx.main, "app.Gone");
        let method = Method::new("m", fx.main).with_exception_table(ExceptionTable::new(vec![
            ExceptionEntry::new(0, 10, 40, gone),
            ExceptionEntry::catch_any(0, 10, 80),
        ]));
        let class = fx.class(WellKnownClass::Error);

        let mut tracer = RecordingTracer::new();
        let first = find_handler(
            5,
            class,
            &method,
            &fx.classes,
            DEFAULT_MAX_ERROR_MESSAGE_SIZE,
            &mut tracer,
        );
        let HandlerLookup::ResolutionFailed(desc) = first else {
            panic!("expected resolution failure, got {first:?}");
        };
        assert_eq!(desc.class_name(), Some("java.lang.NoClassDefFoundError"));
        assert_eq!(
            tracer.events(),
            &[TraceEvent::CatchUnresolvable {
                error_class: "java.lang.NoClassDefFoundError".to_owned()
            }]
        );

        let entry = &method.exception_table().unwrap().entries()[0];
        assert_eq!(entry.catch_type(), CatchType::Unresolvable);
        assert_eq!(
            fx.lookup(&method, 5, class),
            HandlerLookup::Matched {
                handler_pc: 80,
                entry: 1
            }
        );
    }

    #[test]
    fn resolution_is_cached() {
        let mut fx = Fixture::new();
        let idx = fx.classes.add_class_ref(fx.main, "java.lang.Error");
        let method = Method::new("m", fx.main)
            .with_exception_table(ExceptionTable::new(vec![ExceptionEntry::new(0, 10, 40, idx)]));
        let error = fx.class(WellKnownClass::Error);
        let entry = &method.exception_table().unwrap().entries()[0];
        assert_eq!(entry.catch_type(), CatchType::Unresolved);
        fx.lookup(&method, 5, fx.class(WellKnownClass::Exception));
        assert_eq!(entry.catch_type(), CatchType::Resolved(error));
    }

    #[test]
    fn published_state_is_never_replaced() {
        let cell = CatchTypeCell::new();
        let a = ClassId::from_index(3);
        let b = ClassId::from_index(4);
        assert_eq!(cell.publish(CatchType::Resolved(a)), CatchType::Resolved(a));
        assert_eq!(cell.publish(CatchType::Resolved(b)), CatchType::Resolved(a));
        assert_eq!(cell.publish(CatchType::Unresolvable), CatchType::Resolved(a));
        assert_eq!(cell.publish(CatchType::Unresolved), CatchType::Resolved(a));

        let cell = CatchTypeCell::new();
        assert_eq!(cell.publish(CatchType::Unresolvable), CatchType::Unresolvable);
        assert_eq!(cell.publish(CatchType::Resolved(a)), CatchType::Unresolvable);
        assert_eq!(cell.load(), CatchType::Unresolvable);
    }

    #[test]
    fn concurrent_first_resolution_agrees() {
        let mut fx = Fixture::new();
        let idx = fx.classes.add_class_ref(fx.main, "java.lang.Error");
        let method = Method::new("m", fx.main)
            .with_exception_table(ExceptionTable::new(vec![ExceptionEntry::new(0, 10, 40, idx)]));
        let error = fx.class(WellKnownClass::Error);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    let found = find_handler(
                        5,
                        error,
                        &method,
                        &fx.classes,
                        DEFAULT_MAX_ERROR_MESSAGE_SIZE,
                        &mut NoopTracer,
                    );
                    assert_eq!(
                        found,
                        HandlerLookup::Matched {
                            handler_pc: 40,
                            entry: 0
                        }
                    );
                });
            }
        });
        assert_eq!(
            method.exception_table().unwrap().entries()[0].catch_type(),
            CatchType::Resolved(error)
        );
    }

    #[test]
    fn method_without_table_never_matches() {
        let fx = Fixture::new();
        let method = Method::new("m", fx.main);
        assert_eq!(
            fx.lookup(&method, 0, fx.class(WellKnownClass::Error)),
            HandlerLookup::NotMatched
        );
    }
}
