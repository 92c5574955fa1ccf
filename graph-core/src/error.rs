//! Error taxonomy for the pipeline, memory planner, constant cache, and
//! execution dispatcher.

use thiserror::Error;

/// The single error type returned across the compile/execute boundary.
///
/// No panics and no unwinding are used for expected failure modes; every
/// fallible operation in this crate returns `Result<_, GraphError>`.
#[derive(Error, Debug, Clone)]
pub enum GraphError {
    /// A data type, attribute, or post-op combination the backend refuses.
    /// Normally raised by the (out-of-scope) primitive-descriptor layer;
    /// surfaced here so passes can reject configurations early.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// Subgraph inconsistency detected by a pass: rank mismatch, missing
    /// producer, or any other invariant violation. Fatal.
    #[error("invariant violation in pass '{pass}': {message}")]
    InvariantViolation { pass: String, message: String },

    /// Allocator failure for scratchpad, persistent, or constant buffers.
    /// Not retried.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Device or kernel dispatch failure.
    #[error("runtime failure in op '{op_kind}' at index {op_index}: {message}")]
    RuntimeFailure {
        op_kind: String,
        op_index: usize,
        message: String,
    },

    /// The thread elected producer of a constant-cache entry failed before
    /// calling `set_value`; waiters observe this via the shared future and
    /// the pending entry is removed so the next caller may retry.
    #[error("constant cache producer failed: {0}")]
    CacheProducerFailure(String),
}

pub type Result<T> = std::result::Result<T, GraphError>;

impl GraphError {
    pub fn invariant(pass: impl Into<String>, message: impl Into<String>) -> Self {
        GraphError::InvariantViolation {
            pass: pass.into(),
            message: message.into(),
        }
    }

    pub fn runtime(op_kind: impl Into<String>, op_index: usize, message: impl Into<String>) -> Self {
        GraphError::RuntimeFailure {
            op_kind: op_kind.into(),
            op_index,
            message: message.into(),
        }
    }
}
