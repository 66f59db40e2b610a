//! CPU numeric kernels consumed by the planner as black boxes: dense matmul,
//! direct spatial convolution, explicit padding, and layout transforms.
//! Everything operates on flat `f32` slices; activations are NHWC unless a
//! function says otherwise, filters are HWIO.

use crate::format::FilterFormat;

/// Row-major dense matmul: `out[m,n] = a[m,k] * b[k,n]`.
pub fn matmul(a: &[f32], b: &[f32], m: usize, k: usize, n: usize, out: &mut [f32]) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), k * n);
    debug_assert_eq!(out.len(), m * n);
    for row in 0..m {
        let a_row = &a[row * k..(row + 1) * k];
        let out_row = &mut out[row * n..(row + 1) * n];
        out_row.fill(0.0);
        for (inner, &a_val) in a_row.iter().enumerate() {
            if a_val == 0.0 {
                continue;
            }
            let b_row = &b[inner * n..(inner + 1) * n];
            for (out_val, &b_val) in out_row.iter_mut().zip(b_row) {
                *out_val += a_val * b_val;
            }
        }
    }
}

/// Direct spatial convolution, NHWC activations against an HWIO filter.
/// `pad_top`/`pad_left` are the resolved before-paddings; reads that fall
/// outside the input contribute zero.
#[allow(clippy::too_many_arguments)]
pub fn spatial_conv_nhwc(
    input: &[f32],
    batch: usize,
    in_rows: usize,
    in_cols: usize,
    in_depth: usize,
    filter: &[f32],
    filter_rows: usize,
    filter_cols: usize,
    out_depth: usize,
    stride_rows: usize,
    stride_cols: usize,
    dilation_rows: usize,
    dilation_cols: usize,
    pad_top: usize,
    pad_left: usize,
    out_rows: usize,
    out_cols: usize,
    output: &mut [f32],
) {
    debug_assert_eq!(input.len(), batch * in_rows * in_cols * in_depth);
    debug_assert_eq!(
        filter.len(),
        filter_rows * filter_cols * in_depth * out_depth
    );
    debug_assert_eq!(output.len(), batch * out_rows * out_cols * out_depth);

    for n in 0..batch {
        let in_base = n * in_rows * in_cols * in_depth;
        let out_base = n * out_rows * out_cols * out_depth;
        for out_r in 0..out_rows {
            for out_c in 0..out_cols {
                let out_off = out_base + (out_r * out_cols + out_c) * out_depth;
                for oc in 0..out_depth {
                    let mut sum = 0.0f32;
                    for kr in 0..filter_rows {
                        let in_r = (out_r * stride_rows + kr * dilation_rows) as isize
                            - pad_top as isize;
                        if in_r < 0 || in_r as usize >= in_rows {
                            continue;
                        }
                        for kc in 0..filter_cols {
                            let in_c = (out_c * stride_cols + kc * dilation_cols) as isize
                                - pad_left as isize;
                            if in_c < 0 || in_c as usize >= in_cols {
                                continue;
                            }
                            let in_off = in_base
                                + ((in_r as usize) * in_cols + in_c as usize) * in_depth;
                            let w_off = ((kr * filter_cols + kc) * in_depth) * out_depth + oc;
                            for ic in 0..in_depth {
                                sum += input[in_off + ic] * filter[w_off + ic * out_depth];
                            }
                        }
                    }
                    output[out_off + oc] = sum;
                }
            }
        }
    }
}

/// Materialize an explicitly zero-padded copy of an NHWC input.
#[allow(clippy::too_many_arguments)]
pub fn pad_input_nhwc(
    input: &[f32],
    batch: usize,
    in_rows: usize,
    in_cols: usize,
    in_depth: usize,
    pad_top: usize,
    pad_bottom: usize,
    pad_left: usize,
    pad_right: usize,
) -> Vec<f32> {
    let new_rows = in_rows + pad_top + pad_bottom;
    let new_cols = in_cols + pad_left + pad_right;
    let mut out = vec![0.0f32; batch * new_rows * new_cols * in_depth];
    for n in 0..batch {
        for r in 0..in_rows {
            let src = (n * in_rows * in_cols + r * in_cols) * in_depth;
            let dst = (n * new_rows * new_cols + (r + pad_top) * new_cols + pad_left) * in_depth;
            out[dst..dst + in_cols * in_depth]
                .copy_from_slice(&input[src..src + in_cols * in_depth]);
        }
    }
    out
}

/// Materialize an explicitly zero-padded copy of an NCHW input.
#[allow(clippy::too_many_arguments)]
pub fn pad_input_nchw(
    input: &[f32],
    batch: usize,
    depth: usize,
    in_rows: usize,
    in_cols: usize,
    pad_top: usize,
    pad_bottom: usize,
    pad_left: usize,
    pad_right: usize,
) -> Vec<f32> {
    let new_rows = in_rows + pad_top + pad_bottom;
    let new_cols = in_cols + pad_left + pad_right;
    let mut out = vec![0.0f32; batch * depth * new_rows * new_cols];
    for plane in 0..batch * depth {
        for r in 0..in_rows {
            let src = (plane * in_rows + r) * in_cols;
            let dst = (plane * new_rows + r + pad_top) * new_cols + pad_left;
            out[dst..dst + in_cols].copy_from_slice(&input[src..src + in_cols]);
        }
    }
    out
}

pub fn nhwc_to_nchw(input: &[f32], batch: usize, rows: usize, cols: usize, depth: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; input.len()];
    for n in 0..batch {
        for r in 0..rows {
            for c in 0..cols {
                let src = ((n * rows + r) * cols + c) * depth;
                for d in 0..depth {
                    out[((n * depth + d) * rows + r) * cols + c] = input[src + d];
                }
            }
        }
    }
    out
}

pub fn nchw_to_nhwc(input: &[f32], batch: usize, depth: usize, rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; input.len()];
    for n in 0..batch {
        for d in 0..depth {
            for r in 0..rows {
                let src = ((n * depth + d) * rows + r) * cols;
                for c in 0..cols {
                    out[((n * rows + r) * cols + c) * depth + d] = input[src + c];
                }
            }
        }
    }
    out
}

/// Normalize an HWIO filter into the layout the accelerator primitive wants.
pub fn transform_filter(
    filter: &[f32],
    filter_rows: usize,
    filter_cols: usize,
    in_depth: usize,
    out_depth: usize,
    dst_format: FilterFormat,
) -> Vec<f32> {
    debug_assert_eq!(filter.len(), filter_rows * filter_cols * in_depth * out_depth);
    let mut out = vec![0.0f32; filter.len()];
    for r in 0..filter_rows {
        for c in 0..filter_cols {
            for i in 0..in_depth {
                for o in 0..out_depth {
                    let src = ((r * filter_cols + c) * in_depth + i) * out_depth + o;
                    let dst = match dst_format {
                        FilterFormat::Hwio => src,
                        FilterFormat::Oihw => {
                            ((o * in_depth + i) * filter_rows + r) * filter_cols + c
                        }
                        FilterFormat::Ohwi => {
                            ((o * filter_rows + r) * filter_cols + c) * in_depth + i
                        }
                    };
                    out[dst] = filter[src];
                }
            }
        }
    }
    out
}

/// Copy a contiguous channel slice `[start, start+len)` out of an NHWC tensor.
pub fn extract_channels_nhwc(
    input: &[f32],
    batch: usize,
    rows: usize,
    cols: usize,
    depth: usize,
    start: usize,
    len: usize,
) -> Vec<f32> {
    let spatial = batch * rows * cols;
    let mut out = vec![0.0f32; spatial * len];
    for s in 0..spatial {
        let src = s * depth + start;
        out[s * len..(s + 1) * len].copy_from_slice(&input[src..src + len]);
    }
    out
}

/// Scatter a contiguous channel slice back into an NHWC tensor at `start`.
pub fn scatter_channels_nhwc(
    src: &[f32],
    batch: usize,
    rows: usize,
    cols: usize,
    len: usize,
    dst: &mut [f32],
    total_depth: usize,
    start: usize,
) {
    let spatial = batch * rows * cols;
    debug_assert_eq!(src.len(), spatial * len);
    debug_assert_eq!(dst.len(), spatial * total_depth);
    for s in 0..spatial {
        let d = s * total_depth + start;
        dst[d..d + len].copy_from_slice(&src[s * len..(s + 1) * len]);
    }
}

/// Copy the output-channel slice `[start, start+len)` of an HWIO filter.
pub fn extract_filter_outputs_hwio(
    filter: &[f32],
    filter_rows: usize,
    filter_cols: usize,
    in_depth: usize,
    out_depth: usize,
    start: usize,
    len: usize,
) -> Vec<f32> {
    let positions = filter_rows * filter_cols * in_depth;
    let mut out = vec![0.0f32; positions * len];
    for p in 0..positions {
        let src = p * out_depth + start;
        out[p * len..(p + 1) * len].copy_from_slice(&filter[src..src + len]);
    }
    out
}
