//! Class registry: names, single-inheritance hierarchy, constant pools and class monitors.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

use crate::{error_info::ErrorDescriptor, heap::Monitor};

/// Index into the [`ClassTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassId(u32);

impl ClassId {
    /// Builds an id from a raw table index.
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

    pub(crate) fn raw(self) -> u32 {
        self.0
    }
}

/// Classes the runtime itself refers to by name.
///
/// Declared parents-first so that [`ClassTable::with_bootstrap_classes`] can
/// define them in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, IntoStaticStr)]
pub enum WellKnownClass {
    #[strum(serialize = "java.lang.Object")]
    Object,
    #[strum(serialize = "java.lang.Throwable")]
    Throwable,
    #[strum(serialize = "java.lang.Exception")]
    Exception,
    #[strum(serialize = "java.lang.RuntimeException")]
    RuntimeException,
    #[strum(serialize = "java.lang.NullPointerException")]
    NullPointerException,
    #[strum(serialize = "java.lang.ArithmeticException")]
    ArithmeticException,
    #[strum(serialize = "java.lang.Error")]
    Error,
    #[strum(serialize = "java.lang.LinkageError")]
    LinkageError,
    #[strum(serialize = "java.lang.NoClassDefFoundError")]
    NoClassDefFoundError,
    #[strum(serialize = "java.lang.ClassFormatError")]
    ClassFormatError,
    /// Wraps a throwable escaping a static initializer.
    #[strum(serialize = "java.lang.ExceptionInInitializerError")]
    ExceptionInInitializerError,
    #[strum(serialize = "java.lang.VirtualMachineError")]
    VirtualMachineError,
    #[strum(serialize = "java.lang.OutOfMemoryError")]
    OutOfMemoryError,
    /// The termination class: unhandled, it ends only the current thread.
    #[strum(serialize = "java.lang.ThreadDeath")]
    ThreadDeath,
}

impl WellKnownClass {
    /// Fully qualified class name.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Direct superclass in the bootstrap hierarchy.
    #[must_use]
    pub fn superclass(self) -> Option<Self> {
        match self {
            Self::Object => None,
            Self::Throwable => Some(Self::Object),
            Self::Exception | Self::Error => Some(Self::Throwable),
            Self::RuntimeException => Some(Self::Exception),
            Self::NullPointerException | Self::ArithmeticException => Some(Self::RuntimeException),
            Self::LinkageError | Self::VirtualMachineError | Self::ThreadDeath => Some(Self::Error),
            Self::NoClassDefFoundError | Self::ClassFormatError | Self::ExceptionInInitializerError => {
                Some(Self::LinkageError)
            }
            Self::OutOfMemoryError => Some(Self::VirtualMachineError),
        }
    }
}

/// Error returned when the class or method registries reject a definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A class with this name is already defined.
    DuplicateClass(String),
    /// The named superclass (or referenced class) has not been defined.
    UnknownClass(String),
    /// A well-known class the runtime needs is missing from the table.
    MissingWellKnown(WellKnownClass),
    /// A compiled method's code range overlaps another method's.
    OverlappingCode { method: String, other: String },
    /// A compiled method's code range is empty.
    EmptyCodeRange(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateClass(name) => write!(f, "class `{name}' is already defined"),
            Self::UnknownClass(name) => write!(f, "class `{name}' is not defined"),
            Self::MissingWellKnown(class) => write!(f, "runtime class `{class}' is not defined"),
            Self::OverlappingCode { method, other } => {
                write!(f, "code of `{method}' overlaps code of `{other}'")
            }
            Self::EmptyCodeRange(method) => write!(f, "code range of `{method}' is empty"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// A loaded class.
#[derive(Debug)]
pub struct Class {
    name: String,
    superclass: Option<ClassId>,
    /// Symbolic class references; pool index `n` (from 1) names `constant_pool[n - 1]`.
    constant_pool: Vec<String>,
    /// Lock taken by static synchronized methods of this class.
    monitor: Monitor,
}

impl Class {
    /// Fully qualified name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Direct superclass.
    #[must_use]
    pub fn superclass(&self) -> Option<ClassId> {
        self.superclass
    }

    /// The class object's monitor.
    #[must_use]
    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    /// Symbolic name at constant-pool `index`; index 0 is reserved.
    #[must_use]
    pub fn class_ref(&self, index: u16) -> Option<&str> {
        let slot = usize::from(index).checked_sub(1)?;
        self.constant_pool.get(slot).map(String::as_str)
    }
}

/// Registry of every class known to the runtime, in definition order.
#[derive(Debug, Default)]
pub struct ClassTable {
    classes: IndexMap<String, Class>,
}

impl ClassTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table holding every [`WellKnownClass`] with its bootstrap hierarchy.
    #[must_use]
    pub fn with_bootstrap_classes() -> Self {
        let mut table = Self::new();
        for class in WellKnownClass::iter() {
            table
                .define(class.name(), class.superclass().map(WellKnownClass::name))
                .expect("bootstrap classes are declared parents-first and unique");
        }
        table
    }

    /// Defines a class whose superclass is already defined.
    pub fn define(&mut self, name: &str, superclass: Option<&str>) -> Result<ClassId, RegistryError> {
        if self.classes.contains_key(name) {
            return Err(RegistryError::DuplicateClass(name.to_owned()));
        }
        let superclass = match superclass {
            Some(parent) => Some(
                self.lookup(parent)
                    .ok_or_else(|| RegistryError::UnknownClass(parent.to_owned()))?,
            ),
            None => None,
        };
        let index = u32::try_from(self.classes.len()).expect("class count exceeds u32");
        self.classes.insert(
            name.to_owned(),
            Class {
                name: name.to_owned(),
                superclass,
                constant_pool: Vec::new(),
                monitor: Monitor::new(),
            },
        );
        Ok(ClassId(index))
    }

    /// Appends a symbolic reference to `target` to `class`'s constant pool, returning its index.
    ///
    /// `target` does not have to exist: references are resolved lazily.
    pub fn add_class_ref(&mut self, class: ClassId, target: &str) -> u16 {
        let (_, entry) = self
            .classes
            .get_index_mut(class.index())
            .expect("class id from a different table");
        if let Some(pos) = entry.constant_pool.iter().position(|name| name == target) {
            return u16::try_from(pos + 1).expect("constant pool exceeds u16");
        }
        entry.constant_pool.push(target.to_owned());
        u16::try_from(entry.constant_pool.len()).expect("constant pool exceeds u16")
    }

    /// Looks a class up by fully qualified name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<ClassId> {
        self.classes
            .get_index_of(name)
            .map(|index| ClassId(u32::try_from(index).expect("class count exceeds u32")))
    }

    /// Looks up a runtime-designated class.
    #[must_use]
    pub fn well_known(&self, class: WellKnownClass) -> Option<ClassId> {
        self.lookup(class.name())
    }

    /// Returns the class for `id`.
    ///
    /// # Panics
    /// Panics if `id` was issued by a different table.
    #[must_use]
    pub fn get(&self, id: ClassId) -> &Class {
        self.classes
            .get_index(id.index())
            .map(|(_, class)| class)
            .expect("class id from a different table")
    }

    /// Fully qualified name of `id`.
    #[must_use]
    pub fn name(&self, id: ClassId) -> &str {
        self.get(id).name()
    }

    /// Direct superclass of `id`.
    #[must_use]
    pub fn superclass_of(&self, id: ClassId) -> Option<ClassId> {
        self.get(id).superclass
    }

    /// Iterates `id` and then each of its ancestors up to the root.
    pub fn ancestors(&self, id: ClassId) -> impl Iterator<Item = ClassId> + '_ {
        std::iter::successors(Some(id), move |&class| self.superclass_of(class))
    }

    /// Whether `class` is `target` or inherits from it.
    #[must_use]
    pub fn is_subclass_of(&self, class: ClassId, target: ClassId) -> bool {
        self.ancestors(class).any(|ancestor| ancestor == target)
    }

    /// Resolves constant-pool entry `index` of `declaring` to a loaded class.
    ///
    /// A reference naming an undefined class fails with a posted
    /// `java.lang.NoClassDefFoundError`; an index outside the pool fails with
    /// `java.lang.ClassFormatError`. Messages are bounded by `message_capacity`.
    pub fn resolve_class_ref(
        &self,
        index: u16,
        declaring: ClassId,
        message_capacity: usize,
    ) -> Result<ClassId, ErrorDescriptor> {
        let class = self.get(declaring);
        let Some(name) = class.class_ref(index) else {
            let mut desc = ErrorDescriptor::new();
            desc.post_exception_message_bounded(
                WellKnownClass::ClassFormatError.name(),
                format_args!("bad constant pool index {index} in class {}", class.name()),
                message_capacity,
            );
            return Err(desc);
        };
        self.lookup(name).ok_or_else(|| {
            let mut desc = ErrorDescriptor::new();
            desc.post_exception_message_bounded(
                WellKnownClass::NoClassDefFoundError.name(),
                format_args!("{name}"),
                message_capacity,
            );
            desc
        })
    }

    /// Number of defined classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Whether no class is defined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_info::ErrorKind;

    #[test]
    fn bootstrap_hierarchy_links_to_throwable() {
        let table = ClassTable::with_bootstrap_classes();
        let npe = table.well_known(WellKnownClass::NullPointerException).unwrap();
        let throwable = table.well_known(WellKnownClass::Throwable).unwrap();
        let error = table.well_known(WellKnownClass::Error).unwrap();
        assert!(table.is_subclass_of(npe, throwable));
        assert!(table.is_subclass_of(npe, npe));
        assert!(!table.is_subclass_of(npe, error));
        let names: Vec<_> = table.ancestors(npe).map(|id| table.name(id)).collect();
        assert_eq!(
            names,
            vec![
                "java.lang.NullPointerException",
                "java.lang.RuntimeException",
                "java.lang.Exception",
                "java.lang.Throwable",
                "java.lang.Object",
            ]
        );
    }

    #[test]
    fn define_rejects_duplicates_and_unknown_parents() {
        let mut table = ClassTable::with_bootstrap_classes();
        assert_eq!(
            table.define("java.lang.Error", Some("java.lang.Throwable")),
            Err(RegistryError::DuplicateClass("java.lang.Error".to_owned()))
        );
        assert_eq!(
            table.define("app.Failure", Some("app.Missing")),
            Err(RegistryError::UnknownClass("app.Missing".to_owned()))
        );
    }

    #[test]
    fn class_refs_are_deduplicated_and_start_at_one() {
        let mut table = ClassTable::with_bootstrap_classes();
        let main = table.define("app.Main", Some("java.lang.Object")).unwrap();
        assert_eq!(table.add_class_ref(main, "java.lang.Error"), 1);
        assert_eq!(table.add_class_ref(main, "app.Gone"), 2);
        assert_eq!(table.add_class_ref(main, "java.lang.Error"), 1);
        assert_eq!(table.get(main).class_ref(0), None);
    }

    #[test]
    fn resolving_missing_class_posts_no_class_def_found() {
        let mut table = ClassTable::with_bootstrap_classes();
        let main = table.define("app.Main", Some("java.lang.Object")).unwrap();
        let present = table.add_class_ref(main, "java.lang.Error");
        let missing = table.add_class_ref(main, "app.Gone");

        assert_eq!(
            table.resolve_class_ref(present, main, 64),
            Ok(table.well_known(WellKnownClass::Error).unwrap())
        );
        let desc = table.resolve_class_ref(missing, main, 64).unwrap_err();
        assert_eq!(desc.kind(), ErrorKind::Exception);
        assert_eq!(desc.class_name(), Some("java.lang.NoClassDefFoundError"));
        assert_eq!(desc.message(), Some("app.Gone"));

        let desc = table.resolve_class_ref(9, main, 64).unwrap_err();
        assert_eq!(desc.class_name(), Some("java.lang.ClassFormatError"));
    }
}
