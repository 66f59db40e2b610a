//! Hardware dispatch pipeline for accelerated convolutions.
//!
//! Stage progression for one launch: choose compute layout, correct
//! asymmetric padding, convert the input layout, normalize the filter
//! layout, autotune-or-fetch the algorithm, allocate scratch, launch, and
//! convert the output back. The accelerator primitive itself sits behind
//! `ConvBackend`.

use tracing::debug;

use crate::autotune::{
    autotune_unfused_conv, conv_autotune_map, AlgorithmCandidate, AlgorithmDesc, ConvParameters,
};
use crate::conv::{Conv2dDimensions, Conv2dParams};
use crate::executor::{executor_cache, DeviceExecutor, ExecutorConfig};
use crate::format::shape_from_format;
use crate::kernels::{
    matmul, nchw_to_nhwc, nhwc_to_nchw, pad_input_nchw, pad_input_nhwc, transform_filter,
};
use crate::scratch::{workspace_limit_bytes, ScratchAllocator};
use crate::{DType, Device, EmberError, FilterFormat, Result, Tensor, TensorFormat};

/// Shape/layout description of one activation tensor, as handed to the
/// execution primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchDescriptor {
    pub count: i64,
    pub feature_maps: i64,
    pub height: i64,
    pub width: i64,
    pub layout: TensorFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterDescriptor {
    pub output_maps: i64,
    pub input_maps: i64,
    pub height: i64,
    pub width: i64,
    pub layout: FilterFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvolutionDescriptor {
    pub stride_rows: i64,
    pub stride_cols: i64,
    pub dilation_rows: i64,
    pub dilation_cols: i64,
    /// Symmetric per-axis zero padding; the pipeline has already absorbed any
    /// asymmetry into the input tensor.
    pub padding_rows: i64,
    pub padding_cols: i64,
    pub group_count: i64,
}

/// Full descriptor set for one convolution launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvRequest {
    pub input: BatchDescriptor,
    pub filter: FilterDescriptor,
    pub output: BatchDescriptor,
    pub conv: ConvolutionDescriptor,
    pub dtype: DType,
}

/// Execution primitive boundary. Implementations advertise candidate
/// algorithms for a request and launch one of them on a stream; a profiling
/// launch reports a cost in backend-defined units (lower is better).
pub trait ConvBackend: Send + Sync {
    fn candidate_algorithms(&self, request: &ConvRequest) -> Vec<AlgorithmCandidate>;

    #[allow(clippy::too_many_arguments)]
    fn launch(
        &self,
        algo: AlgorithmDesc,
        request: &ConvRequest,
        stream: u64,
        input: &[f32],
        filter: &[f32],
        output: &mut [f32],
        scratch: &mut [u8],
    ) -> Result<f64>;
}

fn fits_i32(value: i64) -> bool {
    (0..=i32::MAX as i64).contains(&value)
}

/// Run one convolution through the dispatch pipeline. The caller's input is
/// in `params.data_format` (NHWC or NCHW) with an HWIO filter; `dims` is
/// fully resolved. The output comes back in the caller's layout.
pub(crate) fn launch_conv2d_accel(
    device: &Device,
    params: &Conv2dParams,
    dims: &Conv2dDimensions,
    input: &Tensor,
    filter: &Tensor,
) -> Result<Tensor> {
    let backend = device
        .backend()
        .ok_or_else(|| EmberError::Internal("accelerator device has no backend".to_string()))?;
    let dtype = input.dtype();

    // Channel-first unless the device runs reduced precision fast in
    // channel-last, in which case keep NHWC and skip the conversion.
    let compute_format = if dtype.is_reduced_precision()
        && device.capability().fast_channel_last_reduced_precision
    {
        TensorFormat::Nhwc
    } else {
        TensorFormat::Nchw
    };
    debug!(
        data_format = %params.data_format,
        compute_format = %compute_format,
        dtype = %dtype,
        "accelerated conv2d"
    );

    let batch = dims.batch as usize;
    let in_depth = dims.in_depth as usize;
    let patch_depth = dims.patch_depth as usize;
    let out_depth = dims.out_depth as usize;
    let out_rows = dims.out_rows as usize;
    let out_cols = dims.out_cols as usize;
    let group_count = dims.in_depth / dims.patch_depth;

    // The primitive only accepts equal padding per axis: keep the common
    // (minimum) amount and absorb the difference into an explicitly padded
    // input tensor, built in the caller's layout.
    let common_padding_rows = dims.pad_rows_before.min(dims.pad_rows_after);
    let common_padding_cols = dims.pad_cols_before.min(dims.pad_cols_after);
    let mut in_rows = dims.input_rows as usize;
    let mut in_cols = dims.input_cols as usize;
    let mut input_data = input.data().to_vec();
    if dims.pad_rows_before != dims.pad_rows_after || dims.pad_cols_before != dims.pad_cols_after {
        let pad_top = dims.pad_rows_before - common_padding_rows;
        let pad_bottom = dims.pad_rows_after - common_padding_rows;
        let pad_left = dims.pad_cols_before - common_padding_cols;
        let pad_right = dims.pad_cols_after - common_padding_cols;
        if !(fits_i32(pad_top) && fits_i32(pad_bottom) && fits_i32(pad_left) && fits_i32(pad_right))
        {
            return Err(EmberError::InvalidArgument("Padding is too large.".to_string()));
        }
        debug!(
            pad_top,
            pad_bottom, pad_left, pad_right, "padding input tensor to symmetric equivalent"
        );
        input_data = match params.data_format {
            TensorFormat::Nhwc => pad_input_nhwc(
                &input_data,
                batch,
                in_rows,
                in_cols,
                in_depth,
                pad_top as usize,
                pad_bottom as usize,
                pad_left as usize,
                pad_right as usize,
            ),
            TensorFormat::Nchw => pad_input_nchw(
                &input_data,
                batch,
                in_depth,
                in_rows,
                in_cols,
                pad_top as usize,
                pad_bottom as usize,
                pad_left as usize,
                pad_right as usize,
            ),
        };
        in_rows += (pad_top + pad_bottom) as usize;
        in_cols += (pad_left + pad_right) as usize;
    }

    // Layout conversion. Depth <= 1 is a relabeling, no transpose needed.
    if compute_format != params.data_format && in_depth > 1 {
        debug!(from = %params.data_format, to = %compute_format, "converting input layout");
        input_data = match compute_format {
            TensorFormat::Nchw => nhwc_to_nchw(&input_data, batch, in_rows, in_cols, in_depth),
            TensorFormat::Nhwc => nchw_to_nhwc(&input_data, batch, in_depth, in_rows, in_cols),
        };
    }

    // Filters are always normalized to the primitive's layout.
    let filter_layout = match compute_format {
        TensorFormat::Nchw => FilterFormat::Oihw,
        TensorFormat::Nhwc => FilterFormat::Ohwi,
    };
    let filter_data = transform_filter(
        filter.data(),
        dims.filter_rows as usize,
        dims.filter_cols as usize,
        patch_depth,
        out_depth,
        filter_layout,
    );

    let request = ConvRequest {
        input: BatchDescriptor {
            count: dims.batch,
            feature_maps: dims.in_depth,
            height: in_rows as i64,
            width: in_cols as i64,
            layout: compute_format,
        },
        filter: FilterDescriptor {
            output_maps: dims.out_depth,
            input_maps: dims.patch_depth,
            height: dims.filter_rows,
            width: dims.filter_cols,
            layout: filter_layout,
        },
        output: BatchDescriptor {
            count: dims.batch,
            feature_maps: dims.out_depth,
            height: dims.out_rows,
            width: dims.out_cols,
            layout: compute_format,
        },
        conv: ConvolutionDescriptor {
            stride_rows: dims.stride_rows,
            stride_cols: dims.stride_cols,
            dilation_rows: dims.dilation_rows,
            dilation_cols: dims.dilation_cols,
            padding_rows: common_padding_rows,
            padding_cols: common_padding_cols,
            group_count,
        },
        dtype,
    };

    // Execution context for this device, built once and cached.
    let executor_config = ExecutorConfig {
        ordinal: device.ordinal(),
        ..Default::default()
    };
    let executor = executor_cache()
        .get_or_create(&executor_config, || Ok(DeviceExecutor::new(&executor_config)))?;
    let stream = executor.default_stream();

    let parameters = ConvParameters {
        batch: dims.batch,
        in_depth: dims.in_depth,
        in_rows: in_rows as i64,
        in_cols: in_cols as i64,
        compute_format,
        out_depth: dims.out_depth,
        filter_rows: dims.filter_rows,
        filter_cols: dims.filter_cols,
        filter_depth: dims.patch_depth,
        dilation_rows: dims.dilation_rows,
        dilation_cols: dims.dilation_cols,
        stride_rows: dims.stride_rows,
        stride_cols: dims.stride_cols,
        padding_rows: common_padding_rows,
        padding_cols: common_padding_cols,
        dtype,
        device_id: device.ordinal(),
        group_count,
    };

    let mut compute_output = vec![0.0f32; batch * out_depth * out_rows * out_cols];
    let scratch_limit = workspace_limit_bytes();

    let entry = autotune_unfused_conv(
        conv_autotune_map(),
        &parameters,
        backend.as_ref(),
        &request,
        stream,
        &input_data,
        &filter_data,
        &mut compute_output,
        scratch_limit,
    )?;
    debug!(algorithm = %entry.algo, scratch = entry.scratch_bytes, "autotune selection");

    let mut allocator = ScratchAllocator::new(scratch_limit);
    let mut scratch = allocator.allocate(entry.scratch_bytes)?;
    backend.launch(
        entry.algo,
        &request,
        stream,
        &input_data,
        &filter_data,
        &mut compute_output,
        &mut scratch,
    )?;

    let out_data = if compute_format != params.data_format && out_depth > 1 {
        debug!(from = %compute_format, to = %params.data_format, "converting output layout");
        match compute_format {
            TensorFormat::Nchw => nchw_to_nhwc(&compute_output, batch, out_depth, out_rows, out_cols),
            TensorFormat::Nhwc => nhwc_to_nchw(&compute_output, batch, out_rows, out_cols, out_depth),
        }
    } else {
        compute_output
    };
    let out_shape = shape_from_format(params.data_format, batch, out_rows, out_cols, out_depth);
    Tensor::from_vec(out_data, out_shape)?.to_dtype(dtype)
}

/// Pointwise (1x1, unit stride/dilation) convolution as one dense matmul,
/// bypassing the pipeline entirely.
pub(crate) fn pointwise_matmul(
    dims: &Conv2dDimensions,
    input: &Tensor,
    filter: &Tensor,
    data_format: TensorFormat,
    dtype: DType,
) -> Result<Tensor> {
    let m = (dims.batch * dims.input_rows * dims.input_cols) as usize;
    let k = dims.in_depth as usize;
    let n = dims.out_depth as usize;
    let mut out = vec![0.0f32; m * n];
    // A 1x1 HWIO filter is already the [in_depth, out_depth] matrix.
    matmul(input.data(), filter.data(), m, k, n, &mut out);
    let shape = shape_from_format(
        data_format,
        dims.batch as usize,
        dims.out_rows as usize,
        dims.out_cols as usize,
        n,
    );
    Tensor::from_vec(out, shape)?.to_dtype(dtype)
}

/// Full-extent convolution (filter covers the whole input, VALID padding) as
/// one dense matmul per batch row.
pub(crate) fn full_extent_matmul(
    dims: &Conv2dDimensions,
    input: &Tensor,
    filter: &Tensor,
    data_format: TensorFormat,
    dtype: DType,
) -> Result<Tensor> {
    let m = dims.batch as usize;
    let k = (dims.filter_rows * dims.filter_cols * dims.patch_depth) as usize;
    let n = dims.out_depth as usize;
    let mut out = vec![0.0f32; m * n];
    // NHWC rows flatten in the same (h, w, c) order the HWIO filter uses.
    matmul(input.data(), filter.data(), m, k, n, &mut out);
    let shape = shape_from_format(data_format, m, 1, 1, n);
    Tensor::from_vec(out, shape)?.to_dtype(dtype)
}
