//! Pending error conditions raised by VM code before an exception object exists.
//!
//! Runtime code that detects a failure (a missing class, a failed cast, an
//! exhausted heap) does not build exception objects itself. It posts the
//! condition into an [`ErrorDescriptor`] and hands the descriptor to
//! [`Dispatcher::raise_from_descriptor`](crate::Dispatcher::raise_from_descriptor),
//! which materializes the object and starts the handler search.

use std::{
    borrow::Cow,
    fmt::{self, Write as _},
};

use strum::{Display, IntoStaticStr};

use crate::{config::DEFAULT_MAX_ERROR_MESSAGE_SIZE, heap::ObjectId};

/// Selector describing which kind of condition a descriptor carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// A named exception class plus a message; materialized by running the
    /// class's message constructor.
    Exception,
    /// An already materialized exception object, thrown again unchanged.
    Rethrow,
    /// A throwable raised by a class initializer, to be wrapped in the
    /// initializer-error class.
    InitializerError,
    /// Memory is exhausted; materializes to the preallocated singleton.
    OutOfMemory,
}

/// Message text of an [`Condition::Exception`].
///
/// `Owned` marks a buffer the descriptor allocated and must release in
/// [`ErrorDescriptor::discard`]; `Static` text is never released.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Message {
    Static(&'static str),
    Owned(String),
}

impl Message {
    fn as_str(&self) -> &str {
        match self {
            Self::Static(s) => s,
            Self::Owned(s) => s,
        }
    }
}

/// The payload of a descriptor, one variant per [`ErrorKind`].
///
/// Keeping the payload in the variant means a descriptor can never carry both
/// a class name and a throwable reference.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Condition {
    Exception {
        class_name: Cow<'static, str>,
        message: Message,
    },
    Rethrow(ObjectId),
    InitializerError(ObjectId),
    OutOfMemory,
}

/// A pending error condition, posted by the raising call site and consumed by
/// exactly one materialization.
///
/// A fresh descriptor is in the out-of-memory state, matching the zeroed state
/// that `post_out_of_memory` produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDescriptor {
    condition: Condition,
}

impl Default for ErrorDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorDescriptor {
    /// Creates an empty descriptor, in the out-of-memory state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            condition: Condition::OutOfMemory,
        }
    }

    /// Shorthand for a new descriptor with [`post_exception`](Self::post_exception) applied.
    #[must_use]
    pub fn exception(class_name: impl Into<Cow<'static, str>>) -> Self {
        let mut desc = Self::new();
        desc.post_exception(class_name);
        desc
    }

    /// Shorthand for a new descriptor with a formatted message, bounded by the default
    /// buffer size.
    #[must_use]
    pub fn exception_with_message(class_name: impl Into<Cow<'static, str>>, args: fmt::Arguments<'_>) -> Self {
        let mut desc = Self::new();
        desc.post_exception_message(class_name, args);
        desc
    }

    /// Posts `class_name` with an empty message. Does not allocate a message buffer.
    pub fn post_exception(&mut self, class_name: impl Into<Cow<'static, str>>) {
        self.condition = Condition::Exception {
            class_name: class_name.into(),
            message: Message::Static(""),
        };
    }

    /// Posts `class_name` with a message formatted from `args`, bounded by
    /// [`DEFAULT_MAX_ERROR_MESSAGE_SIZE`].
    pub fn post_exception_message(&mut self, class_name: impl Into<Cow<'static, str>>, args: fmt::Arguments<'_>) {
        self.post_exception_message_bounded(class_name, args, DEFAULT_MAX_ERROR_MESSAGE_SIZE);
    }

    /// Posts `class_name` with a message formatted into a newly allocated buffer of
    /// `capacity` bytes.
    ///
    /// The formatted text is truncated to `capacity - 1` bytes, cut back to the
    /// nearest character boundary. If the buffer cannot be allocated, the
    /// descriptor is overwritten with the out-of-memory condition instead; it is
    /// never left holding a partially formatted message.
    pub fn post_exception_message_bounded(
        &mut self,
        class_name: impl Into<Cow<'static, str>>,
        args: fmt::Arguments<'_>,
        capacity: usize,
    ) {
        let mut buf = String::new();
        if buf.try_reserve_exact(capacity).is_err() {
            self.post_out_of_memory();
            return;
        }
        let mut writer = BoundedWriter {
            buf: &mut buf,
            limit: capacity.saturating_sub(1),
        };
        // `BoundedWriter` never fails; a user `Display` impl that errors just ends the message early.
        let _ = writer.write_fmt(args);
        self.condition = Condition::Exception {
            class_name: class_name.into(),
            message: Message::Owned(buf),
        };
    }

    /// Resets the descriptor to the out-of-memory condition, dropping any payload.
    pub fn post_out_of_memory(&mut self) {
        self.condition = Condition::OutOfMemory;
    }

    /// Posts an existing exception object to be thrown again unchanged.
    pub fn post_rethrow(&mut self, throwable: ObjectId) {
        self.condition = Condition::Rethrow(throwable);
    }

    /// Posts a throwable raised by a class initializer; materialization wraps it.
    pub fn post_initializer_error(&mut self, throwable: ObjectId) {
        self.condition = Condition::InitializerError(throwable);
    }

    /// Releases the owned message buffer, if any.
    ///
    /// Returns whether a buffer was released. Calling it again is a no-op that
    /// returns `false`; the class name and any message text stay readable as an
    /// empty message.
    pub fn discard(&mut self) -> bool {
        if let Condition::Exception { message, .. } = &mut self.condition
            && matches!(message, Message::Owned(_))
        {
            *message = Message::Static("");
            return true;
        }
        false
    }

    /// Returns the selector of the posted condition.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self.condition {
            Condition::Exception { .. } => ErrorKind::Exception,
            Condition::Rethrow(_) => ErrorKind::Rethrow,
            Condition::InitializerError(_) => ErrorKind::InitializerError,
            Condition::OutOfMemory => ErrorKind::OutOfMemory,
        }
    }

    /// Whether the descriptor currently owns a message buffer that `discard` will release.
    #[must_use]
    pub fn owns_message(&self) -> bool {
        matches!(
            self.condition,
            Condition::Exception {
                message: Message::Owned(_),
                ..
            }
        )
    }

    /// Class name of an [`ErrorKind::Exception`] condition.
    #[must_use]
    pub fn class_name(&self) -> Option<&str> {
        match &self.condition {
            Condition::Exception { class_name, .. } => Some(class_name),
            _ => None,
        }
    }

    /// Message of an [`ErrorKind::Exception`] condition.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        match &self.condition {
            Condition::Exception { message, .. } => Some(message.as_str()),
            _ => None,
        }
    }

    /// Embedded throwable of a rethrow or initializer-error condition.
    #[must_use]
    pub fn throwable(&self) -> Option<ObjectId> {
        match self.condition {
            Condition::Rethrow(id) | Condition::InitializerError(id) => Some(id),
            _ => None,
        }
    }
}

/// `fmt::Write` sink that silently drops everything past `limit` bytes.
struct BoundedWriter<'a> {
    buf: &'a mut String,
    limit: usize,
}

impl fmt::Write for BoundedWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let remaining = self.limit.saturating_sub(self.buf.len());
        if s.len() <= remaining {
            self.buf.push_str(s);
        } else {
            let mut cut = remaining;
            while !s.is_char_boundary(cut) {
                cut -= 1;
            }
            self.buf.push_str(&s[..cut]);
        }
        Ok(())
    }
}
