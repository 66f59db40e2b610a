//! 2-D convolution planning: attribute validation, dimension resolution, and
//! strategy selection across the CPU and accelerator paths.

use rayon::prelude::*;
use tracing::debug;

use crate::accel::{full_extent_matmul, launch_conv2d_accel, pointwise_matmul};
use crate::deep_conv::{can_use_deep_conv2d, deep_conv2d_nhwc};
use crate::format::{attr_dim, shape_from_format};
use crate::kernels::{
    extract_channels_nhwc, extract_filter_outputs_hwio, pad_input_nhwc, scatter_channels_nhwc,
    spatial_conv_nhwc,
};
use crate::registry::{kernel_registry, ConvLauncher};
use crate::{Device, DeviceKind, EmberError, Result, Tensor, TensorFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    Valid,
    Same,
    Explicit,
}

/// Declared convolution attributes, prior to validation.
#[derive(Debug, Clone)]
pub struct Conv2dParams {
    /// Per-dimension window strides in `data_format` order (4 components).
    pub strides: Vec<i64>,
    /// Per-dimension dilation rates in `data_format` order (4 components).
    pub dilations: Vec<i64>,
    pub padding: Padding,
    /// For `Padding::Explicit`: 8 values, (before, after) per dimension in
    /// `data_format` order. Empty otherwise.
    pub explicit_paddings: Vec<i64>,
    pub data_format: TensorFormat,
}

impl Default for Conv2dParams {
    fn default() -> Self {
        Self {
            strides: vec![1, 1, 1, 1],
            dilations: vec![1, 1, 1, 1],
            padding: Padding::Valid,
            explicit_paddings: Vec::new(),
            data_format: TensorFormat::Nhwc,
        }
    }
}

/// All derived geometry for one resolved convolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conv2dDimensions {
    pub batch: i64,
    pub input_rows: i64,
    pub input_cols: i64,
    pub in_depth: i64,
    pub filter_rows: i64,
    pub filter_cols: i64,
    pub patch_depth: i64,
    pub out_depth: i64,
    pub stride_rows: i64,
    pub stride_cols: i64,
    pub dilation_rows: i64,
    pub dilation_cols: i64,
    pub out_rows: i64,
    pub out_cols: i64,
    pub pad_rows_before: i64,
    pub pad_rows_after: i64,
    pub pad_cols_before: i64,
    pub pad_cols_after: i64,
}

impl Conv2dDimensions {
    pub fn group_count(&self) -> i64 {
        self.in_depth / self.patch_depth
    }
}

fn fits_i32(value: i64) -> bool {
    (0..=i32::MAX as i64).contains(&value)
}

fn overflow() -> EmberError {
    EmberError::InvalidArgument("convolution dimension arithmetic overflow".to_string())
}

/// Validate declared attributes before touching any tensor data.
pub fn validate_conv2d_params(params: &Conv2dParams) -> Result<()> {
    if params.dilations.len() != 4 {
        return Err(EmberError::InvalidArgument(
            "Sliding window dilations field must specify 4 dimensions".to_string(),
        ));
    }
    if params.strides.len() != 4 {
        return Err(EmberError::InvalidArgument(
            "Sliding window strides field must specify 4 dimensions".to_string(),
        ));
    }
    let format = params.data_format;
    let stride_n = attr_dim(&params.strides, format, 'N');
    let stride_c = attr_dim(&params.strides, format, 'C');
    let stride_h = attr_dim(&params.strides, format, 'H');
    let stride_w = attr_dim(&params.strides, format, 'W');
    if stride_n != 1 || stride_c != 1 {
        return Err(EmberError::Unimplemented(
            "Current implementation does not yet support strides in the batch and depth dimensions."
                .to_string(),
        ));
    }
    if stride_h <= 0 || stride_w <= 0 {
        return Err(EmberError::InvalidArgument(
            "Row and column strides should be larger than 0.".to_string(),
        ));
    }
    let dilation_n = attr_dim(&params.dilations, format, 'N');
    let dilation_c = attr_dim(&params.dilations, format, 'C');
    let dilation_h = attr_dim(&params.dilations, format, 'H');
    let dilation_w = attr_dim(&params.dilations, format, 'W');
    if dilation_n != 1 || dilation_c != 1 {
        return Err(EmberError::Unimplemented(
            "Current implementation does not yet support dilations in the batch and depth dimensions."
                .to_string(),
        ));
    }
    if dilation_h <= 0 || dilation_w <= 0 {
        return Err(EmberError::InvalidArgument(
            "Dilated rates should be larger than 0.".to_string(),
        ));
    }

    match params.padding {
        Padding::Explicit => {
            if params.explicit_paddings.len() != 8 {
                return Err(EmberError::InvalidArgument(format!(
                    "explicit_paddings attribute must contain 8 values, got {}",
                    params.explicit_paddings.len()
                )));
            }
            for &p in &params.explicit_paddings {
                if p < 0 {
                    return Err(EmberError::InvalidArgument(
                        "All explicit paddings must be non-negative.".to_string(),
                    ));
                }
            }
            for dim in ['N', 'C'] {
                let idx = match dim {
                    'N' => format.batch_index(),
                    _ => format.channel_index(),
                };
                if params.explicit_paddings[2 * idx] != 0
                    || params.explicit_paddings[2 * idx + 1] != 0
                {
                    return Err(EmberError::InvalidArgument(
                        "Explicit padding in the batch and depth dimensions must be zero."
                            .to_string(),
                    ));
                }
            }
        }
        _ => {
            if !params.explicit_paddings.is_empty() {
                return Err(EmberError::InvalidArgument(
                    "explicit_paddings attribute must be empty unless padding is EXPLICIT"
                        .to_string(),
                ));
            }
        }
    }
    Ok(())
}

/// Windowed output size for one spatial axis. Returns (output size,
/// padding before, padding after); for EXPLICIT the supplied paddings pass
/// through unchanged.
pub fn get_windowed_output_size(
    input_size: i64,
    filter_size: i64,
    dilation: i64,
    stride: i64,
    padding: Padding,
    pad_before: i64,
    pad_after: i64,
) -> Result<(i64, i64, i64)> {
    if stride <= 0 {
        return Err(EmberError::InvalidArgument(format!(
            "Stride must be > 0, but got {}",
            stride
        )));
    }
    if dilation <= 0 {
        return Err(EmberError::InvalidArgument(format!(
            "Dilation rate must be >= 1, but got {}",
            dilation
        )));
    }

    let effective_filter_size = filter_size
        .checked_sub(1)
        .and_then(|v| v.checked_mul(dilation))
        .and_then(|v| v.checked_add(1))
        .ok_or_else(overflow)?;

    let (output, before, after) = match padding {
        Padding::Valid => {
            let numerator = input_size
                .checked_sub(effective_filter_size)
                .and_then(|v| v.checked_add(stride))
                .ok_or_else(overflow)?;
            (numerator / stride, 0, 0)
        }
        Padding::Same => {
            let output = input_size
                .checked_add(stride - 1)
                .ok_or_else(overflow)?
                / stride;
            let padding_needed = ((output - 1)
                .checked_mul(stride)
                .and_then(|v| v.checked_add(effective_filter_size))
                .ok_or_else(overflow)?
                - input_size)
                .max(0);
            // Odd totals put the extra unit after.
            let before = padding_needed / 2;
            (output, before, padding_needed - before)
        }
        Padding::Explicit => {
            let numerator = input_size
                .checked_add(pad_before)
                .and_then(|v| v.checked_add(pad_after))
                .and_then(|v| v.checked_sub(effective_filter_size))
                .and_then(|v| v.checked_add(stride))
                .ok_or_else(overflow)?;
            (numerator / stride, pad_before, pad_after)
        }
    };

    if output < 0 {
        return Err(EmberError::InvalidArgument(format!(
            "Computed output size would be negative: {} (input {}, effective filter {}, stride {})",
            output, input_size, effective_filter_size, stride
        )));
    }
    if !fits_i32(output) {
        return Err(overflow());
    }
    Ok((output, before, after))
}

/// Resolve all derived geometry from validated attributes and concrete
/// input/filter shapes. Purely arithmetic; no tensor data is read.
pub fn compute_conv2d_dimensions(
    params: &Conv2dParams,
    input: &Tensor,
    filter: &Tensor,
) -> Result<Conv2dDimensions> {
    let format = params.data_format;
    if input.shape().rank() != 4 {
        return Err(EmberError::InvalidArgument(format!(
            "convolution input must be 4-dimensional: {}",
            input.shape()
        )));
    }
    if filter.shape().rank() != 4 {
        return Err(EmberError::InvalidArgument(format!(
            "convolution filter must be 4-dimensional: {}",
            filter.shape()
        )));
    }
    let filter_dims = filter.shape().dims();
    for &d in &filter_dims[..3] {
        if !fits_i32(d as i64) {
            return Err(EmberError::InvalidArgument("filter too large".to_string()));
        }
    }

    let input_dims = input.shape().dims();
    let in_depth_raw = input_dims[format.channel_index()] as i64;
    let patch_depth_raw = filter_dims[2] as i64;
    if !fits_i32(in_depth_raw) {
        return Err(EmberError::InvalidArgument("Input depth too large".to_string()));
    }
    if !fits_i32(patch_depth_raw) {
        return Err(EmberError::InvalidArgument("Patch depth too large".to_string()));
    }
    if patch_depth_raw <= 0 {
        return Err(EmberError::InvalidArgument(format!(
            "filter depth must be strictly positive, got {}",
            patch_depth_raw
        )));
    }
    if in_depth_raw % patch_depth_raw != 0 {
        return Err(EmberError::InvalidArgument(format!(
            "input depth must be evenly divisible by filter depth: {} vs {}",
            in_depth_raw, patch_depth_raw
        )));
    }
    let out_depth = filter_dims[3] as i64;
    let num_groups = in_depth_raw / patch_depth_raw;
    if num_groups > 0 && (out_depth % num_groups != 0 || out_depth < num_groups) {
        return Err(EmberError::InvalidArgument(format!(
            "output depth must be evenly divisible by number of groups: {} vs {}",
            out_depth, num_groups
        )));
    }

    let input_rows = input_dims[format.height_index()] as i64;
    let input_cols = input_dims[format.width_index()] as i64;
    let batch = input_dims[format.batch_index()] as i64;
    if !fits_i32(input_rows) {
        return Err(EmberError::InvalidArgument("Input rows too large".to_string()));
    }
    if !fits_i32(input_cols) {
        return Err(EmberError::InvalidArgument("Input cols too large".to_string()));
    }
    if !fits_i32(batch) {
        return Err(EmberError::InvalidArgument("batch is too large".to_string()));
    }
    let filter_rows = filter_dims[0] as i64;
    let filter_cols = filter_dims[1] as i64;

    let stride_rows = attr_dim(&params.strides, format, 'H');
    let stride_cols = attr_dim(&params.strides, format, 'W');
    let dilation_rows = attr_dim(&params.dilations, format, 'H');
    let dilation_cols = attr_dim(&params.dilations, format, 'W');

    let (mut pad_rows_before, mut pad_rows_after) = (0, 0);
    let (mut pad_cols_before, mut pad_cols_after) = (0, 0);
    if params.padding == Padding::Explicit {
        let h = format.height_index();
        let w = format.width_index();
        pad_rows_before = params.explicit_paddings[2 * h];
        pad_rows_after = params.explicit_paddings[2 * h + 1];
        pad_cols_before = params.explicit_paddings[2 * w];
        pad_cols_after = params.explicit_paddings[2 * w + 1];
    }

    let (out_rows, pad_rows_before, pad_rows_after) = get_windowed_output_size(
        input_rows,
        filter_rows,
        dilation_rows,
        stride_rows,
        params.padding,
        pad_rows_before,
        pad_rows_after,
    )?;
    let (out_cols, pad_cols_before, pad_cols_after) = get_windowed_output_size(
        input_cols,
        filter_cols,
        dilation_cols,
        stride_cols,
        params.padding,
        pad_cols_before,
        pad_cols_after,
    )?;

    Ok(Conv2dDimensions {
        batch,
        input_rows,
        input_cols,
        in_depth: in_depth_raw,
        filter_rows,
        filter_cols,
        patch_depth: patch_depth_raw,
        out_depth,
        stride_rows,
        stride_cols,
        dilation_rows,
        dilation_cols,
        out_rows,
        out_cols,
        pad_rows_before,
        pad_rows_after,
        pad_cols_before,
        pad_cols_after,
    })
}

/// Computational path chosen for one resolved convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvStrategy {
    /// 1x1 filter, unit stride/dilation: one dense matmul.
    PointwiseMatmul,
    /// Filter covers the whole input with VALID padding: one matmul per row.
    FullExtentMatmul,
    /// Depth-partitioned convolution, one generic pass per group.
    Grouped,
    /// Transform-domain (Winograd) CPU kernel.
    TransformDomain,
    /// Direct spatial convolution with resolved per-axis padding.
    DirectSpatial,
    /// Accelerator dispatch pipeline.
    HardwarePipeline,
}

/// Pick the computational path for a resolved convolution. First match wins;
/// the matmul shortcuts bypass the accelerator entirely for a latency win.
pub fn select_strategy(
    params: &Conv2dParams,
    dims: &Conv2dDimensions,
    device_kind: DeviceKind,
) -> ConvStrategy {
    let grouped = dims.in_depth != dims.patch_depth;
    // The matmul shortcuts flatten channel-last rows directly against the
    // HWIO filter matrix; they never apply to channel-first callers.
    let channel_last = params.data_format == TensorFormat::Nhwc;

    if channel_last
        && dims.filter_rows == 1
        && dims.filter_cols == 1
        && !grouped
        && dims.stride_rows == 1
        && dims.stride_cols == 1
        && dims.dilation_rows == 1
        && dims.dilation_cols == 1
        && params.padding != Padding::Explicit
    {
        return ConvStrategy::PointwiseMatmul;
    }
    if channel_last
        && dims.filter_rows == dims.input_rows
        && dims.filter_cols == dims.input_cols
        && !grouped
        && dims.dilation_rows == 1
        && dims.dilation_cols == 1
        && params.padding == Padding::Valid
    {
        return ConvStrategy::FullExtentMatmul;
    }

    match device_kind {
        DeviceKind::Accelerator => ConvStrategy::HardwarePipeline,
        DeviceKind::Cpu => {
            if grouped {
                return ConvStrategy::Grouped;
            }
            if params.padding != Padding::Explicit
                && dims.dilation_rows == 1
                && dims.dilation_cols == 1
                && can_use_deep_conv2d(
                    dims.stride_rows as usize,
                    dims.stride_cols as usize,
                    dims.filter_rows as usize,
                    dims.filter_cols as usize,
                    dims.in_depth as usize,
                    dims.out_depth as usize,
                    dims.out_rows as usize,
                    dims.out_cols as usize,
                )
            {
                return ConvStrategy::TransformDomain;
            }
            ConvStrategy::DirectSpatial
        }
    }
}

/// Synchronous convolution entry point.
///
/// Input is laid out per `params.data_format` and the filter is
/// `[rows, cols, in_depth, out_depth]` (HWIO). The CPU path accepts NHWC
/// only; the accelerator path accepts NHWC and NCHW. Either fully succeeds
/// with a valid output tensor or fails with one typed error and no partial
/// output.
pub fn conv2d(
    device: &Device,
    params: &Conv2dParams,
    input: &Tensor,
    filter: &Tensor,
) -> Result<Tensor> {
    validate_conv2d_params(params)?;
    if input.dtype() != filter.dtype() {
        return Err(EmberError::InvalidArgument(format!(
            "input and filter must have the same dtype: {} vs {}",
            input.dtype(),
            filter.dtype()
        )));
    }
    let dims = compute_conv2d_dimensions(params, input, filter)?;
    debug!(
        in_depth = dims.in_depth,
        patch_depth = dims.patch_depth,
        input_rows = dims.input_rows,
        input_cols = dims.input_cols,
        filter_rows = dims.filter_rows,
        filter_cols = dims.filter_cols,
        stride_rows = dims.stride_rows,
        stride_cols = dims.stride_cols,
        dilation_rows = dims.dilation_rows,
        dilation_cols = dims.dilation_cols,
        out_depth = dims.out_depth,
        "conv2d"
    );

    let out_shape = shape_from_format(
        params.data_format,
        dims.batch as usize,
        dims.out_rows as usize,
        dims.out_cols as usize,
        dims.out_depth as usize,
    );

    // Nothing to compute.
    if out_shape.elem_count() == 0 {
        return Ok(Tensor::zeros_with_dtype(out_shape, input.dtype()));
    }
    // An empty input can only contribute padding: the output is all zeros.
    if input.elem_count() == 0 {
        return Ok(Tensor::zeros_with_dtype(out_shape, input.dtype()));
    }
    if filter.elem_count() == 0 {
        return Err(EmberError::InvalidArgument(
            "filter must not have zero elements (i.e. all dimensions must be non-zero)".to_string(),
        ));
    }

    let launcher = kernel_registry().lookup("Conv2D", device.kind(), input.dtype())?;
    launcher.launch(device, params, &dims, input, filter)
}

/// CPU launcher: matmul shortcuts, grouped, transform-domain, or direct.
pub(crate) struct CpuConvLauncher;

impl ConvLauncher for CpuConvLauncher {
    fn launch(
        &self,
        _device: &Device,
        params: &Conv2dParams,
        dims: &Conv2dDimensions,
        input: &Tensor,
        filter: &Tensor,
    ) -> Result<Tensor> {
        if params.data_format != TensorFormat::Nhwc {
            return Err(EmberError::Unimplemented(format!(
                "The Conv2D op currently only supports the NHWC tensor format on the CPU. The op was given the format: {}",
                params.data_format
            )));
        }
        let strategy = select_strategy(params, dims, DeviceKind::Cpu);
        debug!(?strategy, "cpu conv2d");
        match strategy {
            ConvStrategy::PointwiseMatmul => {
                pointwise_matmul(dims, input, filter, params.data_format, input.dtype())
            }
            ConvStrategy::FullExtentMatmul => {
                full_extent_matmul(dims, input, filter, params.data_format, input.dtype())
            }
            ConvStrategy::Grouped => launch_grouped(params, dims, input, filter),
            ConvStrategy::TransformDomain => launch_deep(params, dims, input, filter),
            ConvStrategy::DirectSpatial => launch_generic(params, dims, input, filter),
            ConvStrategy::HardwarePipeline => Err(EmberError::Internal(
                "hardware pipeline selected on CPU device".to_string(),
            )),
        }
    }
}

fn launch_generic(
    params: &Conv2dParams,
    dims: &Conv2dDimensions,
    input: &Tensor,
    filter: &Tensor,
) -> Result<Tensor> {
    let batch = dims.batch as usize;
    let out_depth = dims.out_depth as usize;
    let out_rows = dims.out_rows as usize;
    let out_cols = dims.out_cols as usize;
    let mut out = vec![0.0f32; batch * out_rows * out_cols * out_depth];
    spatial_conv_nhwc(
        input.data(),
        batch,
        dims.input_rows as usize,
        dims.input_cols as usize,
        dims.in_depth as usize,
        filter.data(),
        dims.filter_rows as usize,
        dims.filter_cols as usize,
        out_depth,
        dims.stride_rows as usize,
        dims.stride_cols as usize,
        dims.dilation_rows as usize,
        dims.dilation_cols as usize,
        dims.pad_rows_before as usize,
        dims.pad_cols_before as usize,
        out_rows,
        out_cols,
        &mut out,
    );
    let shape = shape_from_format(params.data_format, batch, out_rows, out_cols, out_depth);
    Tensor::from_vec(out, shape)?.to_dtype(input.dtype())
}

/// Grouped convolution: convolve each contiguous depth slice independently
/// and concatenate the per-group outputs along depth. This is the
/// correctness-reference path, not a tuned one.
fn launch_grouped(
    params: &Conv2dParams,
    dims: &Conv2dDimensions,
    input: &Tensor,
    filter: &Tensor,
) -> Result<Tensor> {
    let batch = dims.batch as usize;
    let in_rows = dims.input_rows as usize;
    let in_cols = dims.input_cols as usize;
    let in_depth = dims.in_depth as usize;
    let patch_depth = dims.patch_depth as usize;
    let out_depth = dims.out_depth as usize;
    let out_rows = dims.out_rows as usize;
    let out_cols = dims.out_cols as usize;
    let num_groups = dims.group_count() as usize;
    let group_out_depth = out_depth / num_groups;

    let group_outputs: Vec<Vec<f32>> = (0..num_groups)
        .into_par_iter()
        .map(|g| {
            let group_input = extract_channels_nhwc(
                input.data(),
                batch,
                in_rows,
                in_cols,
                in_depth,
                g * patch_depth,
                patch_depth,
            );
            let group_filter = extract_filter_outputs_hwio(
                filter.data(),
                dims.filter_rows as usize,
                dims.filter_cols as usize,
                patch_depth,
                out_depth,
                g * group_out_depth,
                group_out_depth,
            );
            let mut group_out = vec![0.0f32; batch * out_rows * out_cols * group_out_depth];
            spatial_conv_nhwc(
                &group_input,
                batch,
                in_rows,
                in_cols,
                patch_depth,
                &group_filter,
                dims.filter_rows as usize,
                dims.filter_cols as usize,
                group_out_depth,
                dims.stride_rows as usize,
                dims.stride_cols as usize,
                dims.dilation_rows as usize,
                dims.dilation_cols as usize,
                dims.pad_rows_before as usize,
                dims.pad_cols_before as usize,
                out_rows,
                out_cols,
                &mut group_out,
            );
            group_out
        })
        .collect();

    let mut out = vec![0.0f32; batch * out_rows * out_cols * out_depth];
    for (g, group_out) in group_outputs.iter().enumerate() {
        scatter_channels_nhwc(
            group_out,
            batch,
            out_rows,
            out_cols,
            group_out_depth,
            &mut out,
            out_depth,
            g * group_out_depth,
        );
    }
    let shape = shape_from_format(params.data_format, batch, out_rows, out_cols, out_depth);
    Tensor::from_vec(out, shape)?.to_dtype(input.dtype())
}

fn launch_deep(
    params: &Conv2dParams,
    dims: &Conv2dDimensions,
    input: &Tensor,
    filter: &Tensor,
) -> Result<Tensor> {
    let batch = dims.batch as usize;
    let in_depth = dims.in_depth as usize;
    let out_depth = dims.out_depth as usize;
    let out_rows = dims.out_rows as usize;
    let out_cols = dims.out_cols as usize;

    // The tiled kernel is VALID-only; resolved padding is materialized first.
    let mut in_rows = dims.input_rows as usize;
    let mut in_cols = dims.input_cols as usize;
    let input_data;
    let padded;
    if dims.pad_rows_before != 0
        || dims.pad_rows_after != 0
        || dims.pad_cols_before != 0
        || dims.pad_cols_after != 0
    {
        padded = pad_input_nhwc(
            input.data(),
            batch,
            in_rows,
            in_cols,
            in_depth,
            dims.pad_rows_before as usize,
            dims.pad_rows_after as usize,
            dims.pad_cols_before as usize,
            dims.pad_cols_after as usize,
        );
        in_rows += (dims.pad_rows_before + dims.pad_rows_after) as usize;
        in_cols += (dims.pad_cols_before + dims.pad_cols_after) as usize;
        input_data = padded.as_slice();
    } else {
        input_data = input.data();
    }

    let out = deep_conv2d_nhwc(
        input_data,
        batch,
        in_rows,
        in_cols,
        in_depth,
        filter.data(),
        out_depth,
        out_rows,
        out_cols,
    );
    let shape = shape_from_format(params.data_format, batch, out_rows, out_cols, out_depth);
    Tensor::from_vec(out, shape)?.to_dtype(input.dtype())
}

/// Accelerator launcher: matmul shortcuts first, then the dispatch pipeline.
pub(crate) struct AccelConvLauncher;

impl ConvLauncher for AccelConvLauncher {
    fn launch(
        &self,
        device: &Device,
        params: &Conv2dParams,
        dims: &Conv2dDimensions,
        input: &Tensor,
        filter: &Tensor,
    ) -> Result<Tensor> {
        let strategy = select_strategy(params, dims, DeviceKind::Accelerator);
        debug!(?strategy, "accelerator conv2d");
        match strategy {
            ConvStrategy::PointwiseMatmul => {
                pointwise_matmul(dims, input, filter, params.data_format, input.dtype())
            }
            ConvStrategy::FullExtentMatmul => {
                full_extent_matmul(dims, input, filter, params.data_format, input.dtype())
            }
            _ => launch_conv2d_accel(device, params, dims, input, filter),
        }
    }
}
