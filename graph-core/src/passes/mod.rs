//! Pass families, assembled into the fixed Stage-1/Stage-2 pipeline
//! order. Order within and between families is significant.

mod bias;
mod binary;
mod compile_ops;
mod constant_prop;
mod fusion;
mod layout;
mod lift;
mod lowering;
mod quantization;
mod reorder;
mod shape_infer;
mod shape_norm;
mod transpose;

use crate::memory_planner::MemoryPlanner;
use crate::pass::PassPipeline;

/// Builds Stage 1: shape/layout-agnostic algebraic rewriting.
pub fn setup_pipeline_stage1(pipeline: &mut PassPipeline) {
    // Lowering.
    pipeline.add(lowering::LowerDown);
    pipeline.add(lowering::InsertHostScalar);

    // Algebraic fusion (N-to-1).
    pipeline.add(fusion::FuseReciprocalMulToDiv);
    pipeline.add(fusion::FuseMulSigmoidToSwish);
    pipeline.add(fusion::FuseToSum);
    pipeline.add(fusion::FuseToShuffle);
    pipeline.add(fusion::FuseToInt8Concat);

    // Reshape-aware lift.
    pipeline.add(lift::LiftUpWeightReshapeForDepthwiseConv);
    pipeline.add(lift::LiftUpTypecast);
    pipeline.add(lift::LiftUpQuantize);

    // Bias handling.
    pipeline.add(bias::FuseBiasAdd);
    pipeline.add(bias::InsertBnFolding);
    pipeline.add(bias::CheckWithBias);

    // Binary canonicalization.
    pipeline.add(binary::BinaryCanonicalization);
    pipeline.add(binary::BinaryBroadcastSwap);

    // Typecast fusion.
    pipeline.add(lift::FuseTypecastToMatmulOrConv);
    pipeline.add(lift::FuseTypecastToAdd);
    pipeline.add(lift::FusePostTypecastToPredecessor);
    pipeline.add(lift::FuseTypecastToMulScales);
    pipeline.add(quantization::InsertPermuteForDynamicMulScaleSubZp);

    // Quantization fusion.
    pipeline.add(quantization::RemoveQuantDataWithNoEffect);
    pipeline.add(bias::ConvertBiasToF32);
    pipeline.add(quantization::FuseToInt8Pool);
    pipeline.add(quantization::CombineBinaryPostOpScales);
    pipeline.add(quantization::ConvertToRuntimeSrcScales);
    pipeline.add(quantization::FuseSrcScales);
    pipeline.add(quantization::ConvertToRuntimeSrcZeroPoints);
    pipeline.add(quantization::FuseSrcZeroPoints);
    pipeline.add(quantization::InsertRuntimeU8ToS8ForMatmul);

    // Reduction, BN, prelu, matmul, conv shape normalizations.
    pipeline.add(shape_norm::InsertUnsqueezeAndSqueezeForReduction);
    pipeline.add(quantization::SwapReluMulScales);
    pipeline.add(quantization::FoldPreMulScaleIntoBn);
    pipeline.add(quantization::FoldPostMulScaleIntoBn);
    pipeline.add(lift::LiftUpPostAddForMatmul);

    pipeline.add(fusion::FusePostOps);
    pipeline.add(quantization::FoldMulScales);
    pipeline.add(quantization::ConvertToRuntimeDstScales);
    pipeline.add(quantization::FuseDstScales);
    pipeline.add(quantization::ConvertToRuntimeDstZeroPoints);
    pipeline.add(quantization::FuseDstZeroPoints);

    pipeline.add(quantization::DeferSrcZpsForPool);
    pipeline.add(quantization::RemoveQuantDataWithNoEffect);
    pipeline.add(quantization::FoldSubZpsAddZps);
    pipeline.add(quantization::RemoveQuantDataWithNoEffect);
    pipeline.add(quantization::ReplaceQuantDataWithBinaryPostOp);
    pipeline.add(fusion::FusePostOps);

    pipeline.add(quantization::ConvertRuntimeMulScales);
    pipeline.add(quantization::ConvertRuntimeZeroPoints);
    pipeline.add(quantization::FuseDynamicMulScalesAddZps);
    pipeline.add(quantization::FuseDynamicSubZpsMulScales);
    pipeline.add(quantization::ConvertDynamicQuantizeOps);

    pipeline.add(shape_norm::InsertU8ToS8ForMatmul);
    pipeline.add(shape_norm::InsertPermuteForMatmul);
    pipeline.add(shape_norm::InsertReshapeForNdx2dMatmul);
    pipeline.add(shape_norm::InsertUnsqueezeAndSqueezeForMatmul);
    pipeline.add(shape_norm::InsertUnsqueezeForPrelu);
    pipeline.add(shape_norm::InsertUnsqueezeAndSqueezeForPreluBwd);
    pipeline.add(shape_norm::InsertUnsqueezeAndSqueezeForReduction);
    pipeline.add(shape_norm::InsertPermuteForConvOrDeconv);
    pipeline.add(shape_norm::InsertPermuteForOpOnlyRequireDataFormat);
    pipeline.add(shape_norm::InsertToGroupForConvOrDeconv);
    pipeline.add(shape_norm::ConvBwdDataCanonicalization);
    pipeline.add(shape_norm::ConvBwdWeightsCanonicalization);
    pipeline.add(shape_norm::BatchnormBwdCanonicalization);
    pipeline.add(shape_norm::PoolFwdCanonicalization);
    pipeline.add(shape_norm::PoolBwdCanonicalization);
    pipeline.add(shape_norm::InsertPermuteForShuffle);
    pipeline.add(reorder::ReorderCanonicalization);
}

/// Builds Stage 2: shape inference through memory planning and op
/// compilation. `enable_constant_cache` gates the two constant-propagation
/// passes.
///
/// Returns the shared handle the `memory_plan` and `compile_ops` steps
/// write into; the caller (`PartitionKernel::compile`) locks it after
/// `pipeline.run()` returns to read out the finished memory plan.
pub fn setup_pipeline_stage2(
    pipeline: &mut PassPipeline,
    mem_planner: MemoryPlanner,
    enable_constant_cache: bool,
) -> std::sync::Arc<parking_lot::Mutex<MemoryPlanner>> {
    pipeline.set_visualize(true, false);

    if enable_constant_cache {
        pipeline.add(constant_prop::ConstantPropagation);
    }
    pipeline.add(shape_infer::InferShape);
    pipeline.add(transpose::FuseSrcTransposeToMatmul);
    pipeline.add(transpose::FuseDstTransposeToPredecessor);
    pipeline.add(layout::LayoutPropagation);
    pipeline.add(reorder::CommonReorderElimination);
    pipeline.add(reorder::FuseAdjacentReorders);

    if enable_constant_cache {
        pipeline.add(constant_prop::ConstantPropagation);
    }

    pipeline.set_visualize(true, true);
    let planner_cell = std::sync::Arc::new(parking_lot::Mutex::new(mem_planner));
    pipeline.add(compile_ops::MemoryPlan {
        planner: planner_cell.clone(),
    });
    pipeline.add(compile_ops::CompileOps {
        planner: planner_cell.clone(),
    });

    planner_cell
}
