//! End-to-end coverage of rank-0 ("host scalar") subgraph inputs: a
//! scalar external input is promoted by `passes::lowering::InsertHostScalar`
//! into a `HostScalarImport` op ahead of its consumer, and the memory
//! planner routes it to the caller's `host_scalars` array rather than the
//! ordinary `inputs` array.

mod common;

use common::{buffer_from, read_buffer};
use graph_core::config::{LogicalTensor, PartitionConfig, PartitionDescriptor};
use graph_core::engine::{CpuStream, DeviceBuffer};
use graph_core::kernel::{cpu_allocator, PartitionKernel};
use graph_core::op::{Attribute, Op, OpKind};
use graph_core::subgraph::EngineKind;
use graph_core::value::{ElementType, OpId, Shape, ValueId};

#[test]
fn rank_zero_input_is_bound_from_the_host_scalars_array() {
    let y = ValueId(0);
    let x = ValueId(1);
    let out = ValueId(2);

    let mut descriptor = PartitionDescriptor::new(3, EngineKind::Cpu, PartitionConfig::default());
    descriptor.values = vec![
        LogicalTensor::new(y, ElementType::F32, Shape::static_dims([4])),
        LogicalTensor::new(x, ElementType::F32, Shape(vec![])),
        LogicalTensor::new(out, ElementType::F32, Shape::static_dims([4])),
    ];
    descriptor.input_ids = vec![y, x];
    descriptor.output_ids = vec![out];

    let mut add = Op::new(OpId(0), OpKind::Binary, vec![y, x], vec![out]);
    add.attrs.insert("algorithm".to_string(), Attribute::String("add".to_string()));
    descriptor.ops = vec![add];

    let kernel = PartitionKernel::new();
    kernel.compile(&mut descriptor, cpu_allocator(), None).unwrap();

    assert_eq!(kernel.host_scalar_count().unwrap(), 1);
    let host_scalars = kernel.host_scalars().unwrap();
    assert_eq!(host_scalars.len(), 1);
    assert_eq!(host_scalars[0].value, x);
    assert_eq!(host_scalars[0].slot, 0);

    let y_buf = buffer_from(&[1.0f32, 2.0, 3.0, 4.0]);
    let scalar_buf = buffer_from(&[10.0f32]);
    let outputs = vec![DeviceBuffer::zeroed(16)];

    kernel
        .execute(&CpuStream, &[y_buf], &outputs, &[scalar_buf])
        .unwrap();

    assert_eq!(read_buffer(&outputs[0]), vec![11.0f32, 12.0, 13.0, 14.0]);
}
