//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Default capacity, in bytes, of a formatted error message buffer.
///
/// Messages are truncated to one byte less than this, leaving room for the
/// terminator a C-style formatter would write.
pub const DEFAULT_MAX_ERROR_MESSAGE_SIZE: usize = 1024;

/// Tunables for a [`Runtime`](crate::Runtime).
///
/// Every field has a default, so a partial JSON object (as found in scenario
/// files) deserializes into a complete configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capacity of the buffer that `post_exception_message` formats into.
    pub max_error_message_size: usize,
    /// Maximum number of heap objects before allocation reports out-of-memory.
    ///
    /// `None` means unlimited.
    pub heap_allocation_limit: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_error_message_size: DEFAULT_MAX_ERROR_MESSAGE_SIZE,
            heap_allocation_limit: None,
        }
    }
}

impl EngineConfig {
    /// Returns a copy of this configuration with the given heap allocation limit.
    #[must_use]
    pub fn with_heap_allocation_limit(mut self, limit: usize) -> Self {
        self.heap_allocation_limit = Some(limit);
        self
    }

    /// Returns a copy of this configuration with the given message buffer capacity.
    #[must_use]
    pub fn with_max_error_message_size(mut self, size: usize) -> Self {
        self.max_error_message_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"heap_allocation_limit": 8}"#).unwrap();
        assert_eq!(config.max_error_message_size, DEFAULT_MAX_ERROR_MESSAGE_SIZE);
        assert_eq!(config.heap_allocation_limit, Some(8));
    }
}
