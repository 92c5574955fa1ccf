//! Device engine, stream, and event abstractions.
//!
//! The real engine/stream/event objects are external collaborators,
//! referenced only through their interfaces. This module defines the
//! minimal interface the dispatcher needs against them, plus a CPU
//! implementation so the crate is exercisable end-to-end without a real
//! GPU runtime, and thin OpenCL/SYCL adapters gated behind feature flags
//! that model the event-chaining shape without depending on the actual
//! `ocl`/SYCL crates.

use crate::error::Result;
use std::sync::Arc;

/// A raw, engine-allocated buffer. Stands in for `dnnl::memory` /
/// `cl_mem` / USM pointers: the dispatcher only ever asks for bytes and a
/// base pointer, never anything engine-specific.
#[derive(Debug, Clone)]
pub struct DeviceBuffer {
    pub data: Arc<parking_lot::Mutex<Vec<u8>>>,
}

impl DeviceBuffer {
    pub fn zeroed(size: usize) -> Self {
        DeviceBuffer {
            data: Arc::new(parking_lot::Mutex::new(vec![0u8; size])),
        }
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An opaque completion handle. On synchronous engines this is a no-op;
/// on async engines (OCL/SYCL) it is the event chained through dispatch.
#[derive(Debug, Clone, Default)]
pub struct DeviceEvent {
    pub generation: u64,
}

impl DeviceEvent {
    pub fn completed() -> Self {
        DeviceEvent { generation: 0 }
    }
}

/// A unit of ordered dispatch against an engine. Real implementations map
/// to `dnnl::stream` / `cl_command_queue` / `sycl::queue`.
pub trait Stream: Send + Sync {
    fn engine_kind(&self) -> crate::subgraph::EngineKind;
}

pub struct CpuStream;

impl Stream for CpuStream {
    fn engine_kind(&self) -> crate::subgraph::EngineKind {
        crate::subgraph::EngineKind::Cpu
    }
}

/// The device-side allocator, used for scratchpad and constant buffers.
/// Real implementations would route to the backend's registered
/// allocator.
pub trait Allocator: Send + Sync {
    fn allocate(&self, size: usize) -> Result<DeviceBuffer>;
}

#[derive(Default)]
pub struct HeapAllocator;

impl Allocator for HeapAllocator {
    fn allocate(&self, size: usize) -> Result<DeviceBuffer> {
        Ok(DeviceBuffer::zeroed(size))
    }
}

/// Async runtime adapters (OCL/SYCL). Both are thin wrappers that chain a
/// single "last event" reference through dispatch, per the design note
/// that avoids allocating a per-op dependency list.
#[cfg(feature = "ocl_runtime")]
pub mod ocl {
    use super::DeviceEvent;

    #[derive(Default)]
    pub struct OclEventChain {
        pub last: Vec<DeviceEvent>,
    }

    impl OclEventChain {
        pub fn new(deps: Vec<DeviceEvent>) -> Self {
            OclEventChain { last: deps }
        }

        pub fn advance(&mut self, event: DeviceEvent) {
            self.last = vec![event];
        }
    }
}

#[cfg(feature = "sycl_runtime")]
pub mod sycl {
    use super::DeviceEvent;

    #[derive(Default)]
    pub struct SyclEventChain {
        pub last: Vec<DeviceEvent>,
    }

    impl SyclEventChain {
        pub fn new(deps: Vec<DeviceEvent>) -> Self {
            SyclEventChain { last: deps }
        }

        pub fn advance(&mut self, event: DeviceEvent) {
            self.last = vec![event];
        }
    }
}
