//! Exercises the constant-tensor cache end-to-end through `PartitionKernel`:
//! a sigmoid over a constant-tagged input feeds a runtime add, so its
//! result is constant-folded into the persistent arena and cached across
//! `execute` calls that present identical external-input bytes.

mod common;

use common::{buffer_from, read_buffer};
use graph_core::config::{LogicalTensor, PartitionConfig, PartitionDescriptor};
use graph_core::engine::{CpuStream, DeviceBuffer};
use graph_core::kernel::{cpu_allocator, new_constant_cache, PartitionKernel};
use graph_core::op::{Attribute, Op, OpKind};
use graph_core::subgraph::EngineKind;
use graph_core::value::{ElementType, OpId, Shape, ValueId};

fn build_kernel() -> PartitionKernel {
    let w = ValueId(0);
    let x = ValueId(1);
    let folded = ValueId(2);
    let y = ValueId(3);
    let shape = Shape::static_dims([4]);

    let mut descriptor = PartitionDescriptor::new(7, EngineKind::Cpu, PartitionConfig::default());
    descriptor.values = vec![
        LogicalTensor::new(w, ElementType::F32, shape.clone()).constant(),
        LogicalTensor::new(x, ElementType::F32, shape.clone()),
        LogicalTensor::new(folded, ElementType::F32, shape.clone()),
        LogicalTensor::new(y, ElementType::F32, shape),
    ];
    descriptor.input_ids = vec![w, x];
    descriptor.output_ids = vec![y];

    let mut sigmoid = Op::new(OpId(0), OpKind::Eltwise, vec![w], vec![folded]);
    sigmoid.attrs.insert("algorithm".to_string(), Attribute::String("sigmoid".to_string()));

    let mut add = Op::new(OpId(1), OpKind::Binary, vec![folded, x], vec![y]);
    add.attrs.insert("algorithm".to_string(), Attribute::String("add".to_string()));

    descriptor.ops = vec![sigmoid, add];

    let kernel = PartitionKernel::new();
    kernel.compile(&mut descriptor, cpu_allocator(), None).unwrap();
    kernel
}

#[test]
fn identical_inputs_reuse_the_cached_constant_fold() {
    let cache = new_constant_cache(1 << 20);
    let w = ValueId(0);
    let x = ValueId(1);
    let folded = ValueId(2);
    let y = ValueId(3);
    let shape = Shape::static_dims([4]);

    let mut descriptor = PartitionDescriptor::new(7, EngineKind::Cpu, PartitionConfig::default());
    descriptor.values = vec![
        LogicalTensor::new(w, ElementType::F32, shape.clone()).constant(),
        LogicalTensor::new(x, ElementType::F32, shape.clone()),
        LogicalTensor::new(folded, ElementType::F32, shape.clone()),
        LogicalTensor::new(y, ElementType::F32, shape),
    ];
    descriptor.input_ids = vec![w, x];
    descriptor.output_ids = vec![y];
    let mut sigmoid = Op::new(OpId(0), OpKind::Eltwise, vec![w], vec![folded]);
    sigmoid.attrs.insert("algorithm".to_string(), Attribute::String("sigmoid".to_string()));
    let mut add = Op::new(OpId(1), OpKind::Binary, vec![folded, x], vec![y]);
    add.attrs.insert("algorithm".to_string(), Attribute::String("add".to_string()));
    descriptor.ops = vec![sigmoid, add];

    let kernel = PartitionKernel::new();
    kernel.compile(&mut descriptor, cpu_allocator(), Some(cache.clone())).unwrap();

    let w_buf = buffer_from(&[0.0f32; 4]);
    let outputs = vec![DeviceBuffer::zeroed(16)];

    let first_x = buffer_from(&[1.0f32, 2.0, 3.0, 4.0]);
    kernel.execute(&CpuStream, &[w_buf.clone(), first_x], &outputs, &[]).unwrap();
    assert_eq!(read_buffer(&outputs[0]), vec![1.5f32, 2.5, 3.5, 4.5]);
    assert_eq!(cache.len(), 1);

    let second_x = buffer_from(&[1.0f32, 2.0, 3.0, 4.0]);
    kernel.execute(&CpuStream, &[w_buf.clone(), second_x], &outputs, &[]).unwrap();
    assert_eq!(read_buffer(&outputs[0]), vec![1.5f32, 2.5, 3.5, 4.5]);
    // Same w and x bytes as before: the persistent fold is served from the
    // existing entry rather than growing the cache.
    assert_eq!(cache.len(), 1);

    // Only the constant-flagged input (`w`) contributes data identity to
    // the cache key; `x` isn't reachable from any constant op, so it only
    // contributes its descriptor. Changing `x` alone must reuse the entry.
    let third_x = buffer_from(&[10.0f32, 20.0, 30.0, 40.0]);
    kernel.execute(&CpuStream, &[w_buf.clone(), third_x], &outputs, &[]).unwrap();
    assert_eq!(read_buffer(&outputs[0]), vec![10.5f32, 20.5, 30.5, 40.5]);
    assert_eq!(cache.len(), 1);

    // Changing `w` itself folds to a different sigmoid result and mints a
    // genuinely new persistent entry.
    let second_w = buffer_from(&[1.0f32; 4]);
    let fourth_x = buffer_from(&[10.0f32, 20.0, 30.0, 40.0]);
    kernel.execute(&CpuStream, &[second_w, fourth_x], &outputs, &[]).unwrap();
    let sigmoid_one = 1.0 / (1.0 + (-1.0f32).exp());
    assert_eq!(
        read_buffer(&outputs[0]),
        vec![sigmoid_one + 10.0, sigmoid_one + 20.0, sigmoid_one + 30.0, sigmoid_one + 40.0]
    );
    assert_eq!(cache.len(), 2);
}

#[test]
fn kernel_compiles_and_runs_without_a_shared_cache() {
    let kernel = build_kernel();
    let w_buf = buffer_from(&[0.0f32; 4]);
    let x_buf = buffer_from(&[1.0f32, 2.0, 3.0, 4.0]);
    let outputs = vec![DeviceBuffer::zeroed(16)];
    kernel.execute(&CpuStream, &[w_buf, x_buf], &outputs, &[]).unwrap();
    assert_eq!(read_buffer(&outputs[0]), vec![1.5f32, 2.5, 3.5, 4.5]);
}
