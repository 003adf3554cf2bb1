//! Method metadata and the program-counter to method map used for compiled frames.

use std::{collections::BTreeMap, fmt, ops::Range};

use serde::{Deserialize, Serialize};

use crate::{
    class::{ClassId, RegistryError},
    exception_table::ExceptionTable,
};

/// Index into the [`MethodArea`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodId(u32);

impl MethodId {
    /// Builds an id from a raw index.
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

/// Method access flags, using the class-file bit values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AccessFlags(u16);

impl AccessFlags {
    pub const NONE: Self = Self(0);
    pub const STATIC: Self = Self(0x0008);
    pub const SYNCHRONIZED: Self = Self(0x0020);
    pub const NATIVE: Self = Self(0x0100);

    /// Whether every bit of `other` is set.
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bit value.
    #[must_use]
    pub fn bits(self) -> u16 {
        self.0
    }
}

impl std::ops::BitOr for AccessFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A method as seen by the exception engine.
#[derive(Debug)]
pub struct Method {
    name: String,
    class: ClassId,
    flags: AccessFlags,
    exception_table: Option<ExceptionTable>,
    code_range: Option<Range<usize>>,
}

impl Method {
    /// Creates an interpreted method with no flags and no exception table.
    #[must_use]
    pub fn new(name: impl Into<String>, class: ClassId) -> Self {
        Self {
            name: name.into(),
            class,
            flags: AccessFlags::NONE,
            exception_table: None,
            code_range: None,
        }
    }

    /// Sets the access flags.
    #[must_use]
    pub fn with_flags(mut self, flags: AccessFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Attaches an exception table.
    #[must_use]
    pub fn with_exception_table(mut self, table: ExceptionTable) -> Self {
        self.exception_table = Some(table);
        self
    }

    /// Marks the method as compiled, occupying `range` in generated code.
    #[must_use]
    pub fn with_code_range(mut self, range: Range<usize>) -> Self {
        self.code_range = Some(range);
        self
    }

    /// Method name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declaring class.
    #[must_use]
    pub fn class(&self) -> ClassId {
        self.class
    }

    /// Access flags.
    #[must_use]
    pub fn flags(&self) -> AccessFlags {
        self.flags
    }

    /// Whether the method is declared synchronized.
    #[must_use]
    pub fn is_synchronized(&self) -> bool {
        self.flags.contains(AccessFlags::SYNCHRONIZED)
    }

    /// Whether the method is static.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(AccessFlags::STATIC)
    }

    /// Whether the method is implemented by foreign code.
    #[must_use]
    pub fn is_native(&self) -> bool {
        self.flags.contains(AccessFlags::NATIVE)
    }

    /// Exception table, if the method has one.
    #[must_use]
    pub fn exception_table(&self) -> Option<&ExceptionTable> {
        self.exception_table.as_ref()
    }

    /// Generated-code range of a compiled method.
    #[must_use]
    pub fn code_range(&self) -> Option<&Range<usize>> {
        self.code_range.as_ref()
    }
}

/// All registered methods plus the address maps for generated code.
#[derive(Debug, Default)]
pub struct MethodArea {
    methods: Vec<Method>,
    /// Start address of each compiled method's code, mapped to its end and id.
    code_map: BTreeMap<usize, (usize, MethodId)>,
    /// Generated-code ranges of foreign-call trampolines.
    foreign_ranges: Vec<Range<usize>>,
}

impl MethodArea {
    /// Creates an empty method area.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `method`; compiled methods must not overlap existing code.
    pub fn define(&mut self, method: Method) -> Result<MethodId, RegistryError> {
        let id = MethodId(u32::try_from(self.methods.len()).expect("method count exceeds u32"));
        if let Some(range) = method.code_range.clone() {
            if range.is_empty() {
                return Err(RegistryError::EmptyCodeRange(method.name));
            }
            if let Some(other) = self.overlapping(&range) {
                return Err(RegistryError::OverlappingCode {
                    method: method.name,
                    other: self.get(other).name.clone(),
                });
            }
            self.code_map.insert(range.start, (range.end, id));
        }
        self.methods.push(method);
        Ok(id)
    }

    fn overlapping(&self, range: &Range<usize>) -> Option<MethodId> {
        // the only candidates are the last method starting before `range.end`
        let (_, &(end, id)) = self.code_map.range(..range.end).next_back()?;
        (end > range.start).then_some(id)
    }

    /// Returns the method for `id`.
    ///
    /// # Panics
    /// Panics if `id` was issued by a different method area.
    #[must_use]
    pub fn get(&self, id: MethodId) -> &Method {
        &self.methods[id.index()]
    }

    /// Looks a method up by name, returning the first match.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<MethodId> {
        self.methods
            .iter()
            .position(|method| method.name == name)
            .map(|index| MethodId(u32::try_from(index).expect("method count exceeds u32")))
    }

    /// Maps a generated-code program counter to the compiled method containing it.
    #[must_use]
    pub fn method_for_pc(&self, pc: usize) -> Option<MethodId> {
        let (_, &(end, id)) = self.code_map.range(..=pc).next_back()?;
        (pc < end).then_some(id)
    }

    /// Registers a generated-code range belonging to a foreign-call trampoline.
    pub fn add_foreign_range(&mut self, range: Range<usize>) {
        self.foreign_ranges.push(range);
    }

    /// Whether `pc` lies inside a foreign-call trampoline.
    #[must_use]
    pub fn is_foreign_pc(&self, pc: usize) -> bool {
        self.foreign_ranges.iter().any(|range| range.contains(&pc))
    }

    /// Number of registered methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether no method is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
