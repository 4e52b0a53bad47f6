use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors surfaced by the pooled allocator and buffer layer.
///
/// Nothing in the allocator is retried and nothing is silently swallowed:
/// every variant here reaches the caller synchronously from the originating
/// call. Chunk-level exhaustion is handled internally by falling back to the
/// next chunk list or a fresh chunk and only becomes visible as
/// `OutOfMemory` when the backing reservation itself fails.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("Invalid allocation size: {size} bytes - {reason}")]
    InvalidSize { size: usize, reason: String },

    #[error("Configuration invalid: {field} - {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("Index out of range: index {index}, length {length}, capacity {capacity}")]
    IndexOutOfRange {
        index: usize,
        length: usize,
        capacity: usize,
    },

    #[error("Illegal reference count: {count} (attempted delta {delta})")]
    IllegalReferenceCount { count: i32, delta: i32 },

    #[error("Out of memory: {reason}")]
    OutOfMemory { reason: String },

    #[error("Unsupported operation: {operation}")]
    Unsupported { operation: String },
}

impl PoolError {
    /// Shorthand for range-check failures at the buffer surface.
    pub(crate) fn out_of_range(index: usize, length: usize, capacity: usize) -> Self {
        PoolError::IndexOutOfRange {
            index,
            length,
            capacity,
        }
    }
}
