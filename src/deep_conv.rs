//! Transform-domain (Winograd F(2x2, 3x3)) convolution for the CPU path.
//!
//! Applies only to 3x3 filters with unit stride and dilation; the cost model
//! compares a direct convolution estimate against the tile transform cost and
//! rejects shapes where the transform does not pay off.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::kernels::{nchw_to_nhwc, nhwc_to_nchw, transform_filter};
use crate::FilterFormat;

static USE_DEEP_CONV: AtomicBool = AtomicBool::new(false);

/// Globally enable or disable the transform-domain fast path (off by
/// default; the direct path is the reference).
pub fn set_use_deep_conv(enabled: bool) {
    USE_DEEP_CONV.store(enabled, Ordering::Relaxed);
}

pub fn deep_conv_enabled() -> bool {
    USE_DEEP_CONV.load(Ordering::Relaxed)
}

/// Estimated multiply-accumulate count of a direct convolution.
fn direct_conv_cost(
    filter_rows: usize,
    filter_cols: usize,
    in_depth: usize,
    out_depth: usize,
    out_rows: usize,
    out_cols: usize,
) -> usize {
    filter_rows * filter_cols * in_depth * out_depth * out_rows * out_cols
}

/// Estimated cost of the F(2x2, 3x3) transform pipeline: input transform +
/// element-wise products + output transform, per 2x2 output tile.
fn deep_conv_cost(in_depth: usize, out_depth: usize, out_rows: usize, out_cols: usize) -> usize {
    let tiles = out_rows.div_ceil(2) * out_cols.div_ceil(2);
    let input_transform = 32 * in_depth;
    let products = 16 * in_depth * out_depth;
    let output_transform = 24 * out_depth;
    tiles * (input_transform + products + output_transform)
}

/// Whether the transform-domain kernel applies and is expected to win.
#[allow(clippy::too_many_arguments)]
pub fn can_use_deep_conv2d(
    stride_rows: usize,
    stride_cols: usize,
    filter_rows: usize,
    filter_cols: usize,
    in_depth: usize,
    out_depth: usize,
    out_rows: usize,
    out_cols: usize,
) -> bool {
    if !deep_conv_enabled() {
        return false;
    }
    if stride_rows != 1 || stride_cols != 1 || filter_rows != 3 || filter_cols != 3 {
        return false;
    }
    if out_rows == 0 || out_cols == 0 {
        return false;
    }
    deep_conv_cost(in_depth, out_depth, out_rows, out_cols)
        < direct_conv_cost(filter_rows, filter_cols, in_depth, out_depth, out_rows, out_cols)
}

// G * g * G^T for a single 3x3 filter tap, giving the 4x4 transformed tile.
#[inline]
fn winograd_filter_tile(g: &[f32; 9]) -> [f32; 16] {
    let mut tmp = [0.0f32; 12]; // 4x3
    for j in 0..3 {
        let g0 = g[j];
        let g1 = g[3 + j];
        let g2 = g[6 + j];
        tmp[j] = g0;
        tmp[3 + j] = (g0 + g1 + g2) * 0.5;
        tmp[6 + j] = (g0 - g1 + g2) * 0.5;
        tmp[9 + j] = g2;
    }
    let mut u = [0.0f32; 16];
    for i in 0..4 {
        let t0 = tmp[i * 3];
        let t1 = tmp[i * 3 + 1];
        let t2 = tmp[i * 3 + 2];
        u[i * 4] = t0;
        u[i * 4 + 1] = (t0 + t1 + t2) * 0.5;
        u[i * 4 + 2] = (t0 - t1 + t2) * 0.5;
        u[i * 4 + 3] = t2;
    }
    u
}

// B^T * d * B for a 4x4 input tile.
#[inline]
fn winograd_input_tile(d: &[f32; 16]) -> [f32; 16] {
    let mut tmp = [0.0f32; 16];
    for j in 0..4 {
        let d0 = d[j];
        let d1 = d[4 + j];
        let d2 = d[8 + j];
        let d3 = d[12 + j];
        tmp[j] = d0 - d2;
        tmp[4 + j] = d1 + d2;
        tmp[8 + j] = -d1 + d2;
        tmp[12 + j] = d1 - d3;
    }
    let mut v = [0.0f32; 16];
    for i in 0..4 {
        let t0 = tmp[i * 4];
        let t1 = tmp[i * 4 + 1];
        let t2 = tmp[i * 4 + 2];
        let t3 = tmp[i * 4 + 3];
        v[i * 4] = t0 - t2;
        v[i * 4 + 1] = t1 + t2;
        v[i * 4 + 2] = -t1 + t2;
        v[i * 4 + 3] = t1 - t3;
    }
    v
}

// A^T * m * A, collapsing a 4x4 accumulator to the 2x2 output tile.
#[inline]
fn winograd_output_tile(m: &[f32; 16]) -> [f32; 4] {
    let mut tmp = [0.0f32; 8]; // 2x4
    for j in 0..4 {
        let m0 = m[j];
        let m1 = m[4 + j];
        let m2 = m[8 + j];
        let m3 = m[12 + j];
        tmp[j] = m0 + m1 + m2;
        tmp[4 + j] = m1 - m2 - m3;
    }
    let mut out = [0.0f32; 4];
    for i in 0..2 {
        let t0 = tmp[i * 4];
        let t1 = tmp[i * 4 + 1];
        let t2 = tmp[i * 4 + 2];
        let t3 = tmp[i * 4 + 3];
        out[i * 2] = t0 + t1 + t2;
        out[i * 2 + 1] = t1 - t2 - t3;
    }
    out
}

/// Winograd convolution over NCHW slices. `input` must already carry any
/// resolved padding; the convolution itself is VALID with stride 1.
#[allow(clippy::too_many_arguments)]
fn winograd_conv_nchw(
    input: &[f32],
    batch: usize,
    in_depth: usize,
    in_rows: usize,
    in_cols: usize,
    filter_oihw: &[f32],
    out_depth: usize,
    out_rows: usize,
    out_cols: usize,
    output: &mut [f32],
) {
    // Pre-transform every (oc, ic) filter tap.
    let mut transformed = vec![[0.0f32; 16]; out_depth * in_depth];
    for oc in 0..out_depth {
        for ic in 0..in_depth {
            let base = (oc * in_depth + ic) * 9;
            let mut g = [0.0f32; 9];
            g.copy_from_slice(&filter_oihw[base..base + 9]);
            transformed[oc * in_depth + ic] = winograd_filter_tile(&g);
        }
    }

    let tiles_r = out_rows.div_ceil(2);
    let tiles_c = out_cols.div_ceil(2);
    let in_plane = in_rows * in_cols;
    let out_plane = out_rows * out_cols;

    for n in 0..batch {
        let in_base = n * in_depth * in_plane;
        let out_base = n * out_depth * out_plane;
        for oc in 0..out_depth {
            for tr in 0..tiles_r {
                for tc in 0..tiles_c {
                    let mut acc = [0.0f32; 16];
                    for ic in 0..in_depth {
                        let mut d = [0.0f32; 16];
                        let base_r = tr * 2;
                        let base_c = tc * 2;
                        for dr in 0..4 {
                            let r = base_r + dr;
                            if r >= in_rows {
                                continue;
                            }
                            for dc in 0..4 {
                                let c = base_c + dc;
                                if c < in_cols {
                                    d[dr * 4 + dc] =
                                        input[in_base + ic * in_plane + r * in_cols + c];
                                }
                            }
                        }
                        let v = winograd_input_tile(&d);
                        let u = &transformed[oc * in_depth + ic];
                        for i in 0..16 {
                            acc[i] += u[i] * v[i];
                        }
                    }
                    let tile = winograd_output_tile(&acc);
                    for dr in 0..2 {
                        for dc in 0..2 {
                            let r = tr * 2 + dr;
                            let c = tc * 2 + dc;
                            if r < out_rows && c < out_cols {
                                output[out_base + oc * out_plane + r * out_cols + c] =
                                    tile[dr * 2 + dc];
                            }
                        }
                    }
                }
            }
        }
    }
}

/// NHWC front door for the transform-domain kernel: converts activations to
/// NCHW and the HWIO filter to OIHW, runs the tiled transform, converts back.
#[allow(clippy::too_many_arguments)]
pub fn deep_conv2d_nhwc(
    input: &[f32],
    batch: usize,
    in_rows: usize,
    in_cols: usize,
    in_depth: usize,
    filter_hwio: &[f32],
    out_depth: usize,
    out_rows: usize,
    out_cols: usize,
) -> Vec<f32> {
    let input_nchw = nhwc_to_nchw(input, batch, in_rows, in_cols, in_depth);
    let filter_oihw = transform_filter(filter_hwio, 3, 3, in_depth, out_depth, FilterFormat::Oihw);
    let mut out_nchw = vec![0.0f32; batch * out_depth * out_rows * out_cols];
    winograd_conv_nchw(
        &input_nchw,
        batch,
        in_depth,
        in_rows,
        in_cols,
        &filter_oihw,
        out_depth,
        out_rows,
        out_cols,
        &mut out_nchw,
    );
    nchw_to_nhwc(&out_nchw, batch, out_depth, out_rows, out_cols)
}
