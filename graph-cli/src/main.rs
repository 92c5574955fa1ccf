//! Thin outer surface for exercising `graph-core` end-to-end: reads a
//! JSON-encoded [`PartitionDescriptor`], compiles it against the CPU
//! engine, feeds it JSON-encoded f32 input tensors, and prints the
//! resulting output tensors.

use anyhow::{Context, Result};
use clap::Parser;
use graph_core::config::PartitionDescriptor;
use graph_core::engine::{CpuStream, DeviceBuffer};
use graph_core::kernel::{cpu_allocator, new_constant_cache, PartitionKernel};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(name = "graph-cli", about = "Compile and execute a fused tensor-operation partition")]
struct Args {
    /// Path to a JSON-encoded `PartitionDescriptor`.
    #[clap(long)]
    partition: PathBuf,

    /// Path to a JSON file holding one array of f32 per external input,
    /// in the order `partition.input_ids` lists them.
    #[clap(long)]
    inputs: PathBuf,

    /// Emit a `tracing` event before/after every pass in the pipeline.
    #[clap(long)]
    visualize: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let partition_json = std::fs::read_to_string(&args.partition)
        .with_context(|| format!("reading partition descriptor {}", args.partition.display()))?;
    let mut descriptor: PartitionDescriptor =
        serde_json::from_str(&partition_json).context("parsing partition descriptor JSON")?;
    descriptor.config.enable_visualize = args.visualize;

    let inputs_json = std::fs::read_to_string(&args.inputs)
        .with_context(|| format!("reading inputs file {}", args.inputs.display()))?;
    let raw_inputs: Vec<Vec<f32>> = serde_json::from_str(&inputs_json).context("parsing inputs JSON")?;
    if raw_inputs.len() != descriptor.input_ids.len() {
        anyhow::bail!(
            "inputs file has {} arrays but the partition declares {} input ids",
            raw_inputs.len(),
            descriptor.input_ids.len()
        );
    }

    // A rank-0 input isn't device-bound: `passes::lowering::InsertHostScalar`
    // promotes it into a `HostScalarImport` op during compile, and the
    // memory planner routes it into the `host_scalars` slot space instead
    // of `inputs`. Split here, before compiling, since the order each
    // array appears in must match `descriptor.input_ids` order.
    let ranks: Vec<usize> = descriptor.inputs().iter().map(|t| t.shape.rank()).collect();
    let mut input_buffers = Vec::new();
    let mut host_scalar_buffers = Vec::new();
    for (values, rank) in raw_inputs.iter().zip(ranks.iter()) {
        let buf = DeviceBuffer::zeroed(values.len() * 4);
        {
            let mut bytes = buf.data.lock();
            bytes.clear();
            for v in values {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
        }
        if *rank == 0 {
            host_scalar_buffers.push(buf);
        } else {
            input_buffers.push(buf);
        }
    }

    let kernel = PartitionKernel::new();
    let allocator = cpu_allocator();
    let cache = if descriptor.config.enable_constant_cache {
        Some(new_constant_cache(descriptor.config.constant_cache_capacity_bytes))
    } else {
        None
    };
    kernel
        .compile(&mut descriptor, allocator, cache)
        .context("compiling partition")?;

    tracing::info!(
        partition_id = descriptor.id,
        output_count = descriptor.output_ids.len(),
        "partition compiled"
    );
    for tensor in descriptor.outputs() {
        tracing::info!(value = tensor.id.0, layout = %tensor.layout_tag, "output layout after compile");
    }

    let output_buffers: Vec<DeviceBuffer> = descriptor
        .outputs()
        .iter()
        .map(|tensor| {
            let numel = tensor.shape.numel().unwrap_or(0).max(0) as usize;
            DeviceBuffer::zeroed(numel * tensor.elem_type.byte_size())
        })
        .collect();

    let stream = CpuStream;
    kernel
        .execute(&stream, &input_buffers, &output_buffers, &host_scalar_buffers)
        .context("executing partition")?;

    let results: Vec<Vec<f32>> = output_buffers
        .iter()
        .map(|buf| {
            buf.data
                .lock()
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect()
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
