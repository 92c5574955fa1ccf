//! Partition compilation and execution engine.
//!
//! This crate ingests a fused subgraph of tensor operations (a
//! [`PartitionDescriptor`]), lowers and optimizes it through the
//! Stage-1/Stage-2 pass pipeline in [`passes`], plans memory for every
//! intermediate and constant buffer ([`memory_planner`]), compiles the
//! surviving ops into executable kernels ([`compiled_op`]), and drives
//! execution on a device engine ([`engine`], [`dispatcher`]) while
//! amortizing constant-tensor work across invocations
//! ([`constant_cache`]). [`kernel::PartitionKernel`] is the user-facing
//! compiled object that wires all of the above together.
//!
//! Out of scope, per the partition's contract with the rest of the
//! backend: the op-kind registry and per-kernel GPU code generation, the
//! allocator implementation, and the device driver/runtime objects
//! themselves (engine, stream, events) beyond the thin interfaces this
//! crate needs to call them.

pub mod compiled_op;
pub mod config;
pub mod constant_cache;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod exec_args;
pub mod kernel;
pub mod memory_planner;
pub mod op;
pub mod pass;
pub mod passes;
pub mod subgraph;
pub mod value;

pub use config::{LogicalTensor, PartitionConfig, PartitionDescriptor};
pub use error::{GraphError, Result};
pub use kernel::PartitionKernel;
