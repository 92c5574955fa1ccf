//! End-to-end `PartitionKernel` coverage of the `Binary` op kind: a
//! two-input, one-output partition with no intermediates, compiled and
//! executed exactly the way `graph-cli` drives a partition.

mod common;

use common::{buffer_from, read_buffer};
use graph_core::config::{LogicalTensor, PartitionConfig, PartitionDescriptor};
use graph_core::engine::{CpuStream, DeviceBuffer};
use graph_core::kernel::{cpu_allocator, PartitionKernel};
use graph_core::op::{Attribute, Op, OpKind};
use graph_core::subgraph::EngineKind;
use graph_core::value::{ElementType, OpId, Shape, ValueId};
use rstest::rstest;

const ROWS: i64 = 4;
const COLS: i64 = 8;
const NUMEL: usize = (ROWS * COLS) as usize;

fn binary_kernel(algorithm: &str) -> PartitionKernel {
    let lhs = ValueId(0);
    let rhs = ValueId(1);
    let out = ValueId(2);
    let shape = Shape::static_dims([ROWS, COLS]);

    let mut descriptor = PartitionDescriptor::new(1, EngineKind::Cpu, PartitionConfig::default());
    descriptor.values = vec![
        LogicalTensor::new(lhs, ElementType::F32, shape.clone()),
        LogicalTensor::new(rhs, ElementType::F32, shape.clone()),
        LogicalTensor::new(out, ElementType::F32, shape),
    ];
    descriptor.input_ids = vec![lhs, rhs];
    descriptor.output_ids = vec![out];

    let mut add = Op::new(OpId(0), OpKind::Binary, vec![lhs, rhs], vec![out]);
    add.attrs.insert("algorithm".to_string(), Attribute::String(algorithm.to_string()));
    descriptor.ops = vec![add];

    let kernel = PartitionKernel::new();
    kernel.compile(&mut descriptor, cpu_allocator(), None).unwrap();
    kernel
}

#[test]
fn binary_add_f32_is_elementwise_sum_with_no_scratchpad() {
    let kernel = binary_kernel("add");
    assert_eq!(kernel.scratchpad_size().unwrap(), 0);

    let inputs = vec![buffer_from(&vec![1.0f32; NUMEL]), buffer_from(&vec![2.0f32; NUMEL])];
    let outputs = vec![DeviceBuffer::zeroed(NUMEL * 4)];

    kernel.execute(&CpuStream, &inputs, &outputs, &[]).unwrap();

    assert_eq!(read_buffer(&outputs[0]), vec![3.0f32; NUMEL]);
}

#[rstest]
#[case::add("add", 5.0)]
#[case::mul("mul", 4.0)]
#[case::sub("sub", -3.0)]
#[case::max("max", 4.0)]
#[case::min("min", 1.0)]
fn binary_algorithm_matches_elementwise_reference(#[case] algorithm: &str, #[case] expected: f32) {
    let kernel = binary_kernel(algorithm);
    let inputs = vec![buffer_from(&vec![1.0f32; NUMEL]), buffer_from(&vec![4.0f32; NUMEL])];
    let outputs = vec![DeviceBuffer::zeroed(NUMEL * 4)];

    kernel.execute(&CpuStream, &inputs, &outputs, &[]).unwrap();

    assert_eq!(read_buffer(&outputs[0]), vec![expected; NUMEL]);
}

#[test]
fn repeated_execute_on_the_same_compiled_kernel_is_stable() {
    let kernel = binary_kernel("add");
    let outputs = vec![DeviceBuffer::zeroed(NUMEL * 4)];
    for i in 0..3 {
        let inputs = vec![buffer_from(&vec![i as f32; NUMEL]), buffer_from(&vec![1.0f32; NUMEL])];
        kernel.execute(&CpuStream, &inputs, &outputs, &[]).unwrap();
        assert_eq!(read_buffer(&outputs[0]), vec![(i + 1) as f32; NUMEL]);
    }
}
