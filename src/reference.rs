//! Reference `ConvBackend` that executes on the host CPU.
//!
//! Serves as the default accelerator backend in tests and on machines with
//! no real accelerator: it advertises a small algorithm menu with synthetic
//! deterministic costs, honors the request descriptors bit-for-bit, and
//! records every launch so callers can assert on pipeline behavior. Fault
//! injection hooks simulate launch failures and out-of-bounds workspace
//! writes.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::accel::{ConvBackend, ConvRequest};
use crate::autotune::{AlgorithmCandidate, AlgorithmDesc};
use crate::kernels::{
    extract_channels_nhwc, extract_filter_outputs_hwio, nchw_to_nhwc, nhwc_to_nchw,
    scatter_channels_nhwc, spatial_conv_nhwc,
};
use crate::{EmberError, FilterFormat, Result, TensorFormat};

pub const ALGO_IMPLICIT_GEMM: AlgorithmDesc = AlgorithmDesc {
    id: 0,
    name: "implicit_gemm",
};
pub const ALGO_GEMM: AlgorithmDesc = AlgorithmDesc { id: 2, name: "gemm" };
pub const ALGO_WINOGRAD: AlgorithmDesc = AlgorithmDesc {
    id: 6,
    name: "winograd",
};

const SCRIBBLE_NONE: u32 = u32::MAX;

pub struct ReferenceBackend {
    launch_count: AtomicUsize,
    fail_launches: AtomicBool,
    scribble_algo: AtomicU32,
    recorded: Mutex<Vec<(u32, ConvRequest)>>,
}

impl ReferenceBackend {
    pub fn new() -> Self {
        Self {
            launch_count: AtomicUsize::new(0),
            fail_launches: AtomicBool::new(false),
            scribble_algo: AtomicU32::new(SCRIBBLE_NONE),
            recorded: Mutex::new(Vec::new()),
        }
    }

    /// Total launches so far, profiling runs included.
    pub fn launch_count(&self) -> usize {
        self.launch_count.load(Ordering::Relaxed)
    }

    /// When set, every launch fails with an internal error.
    pub fn set_fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, Ordering::Relaxed);
    }

    /// When set, the named algorithm overruns its workspace on every launch.
    pub fn set_scribble_algo(&self, algo: Option<u32>) {
        self.scribble_algo
            .store(algo.unwrap_or(SCRIBBLE_NONE), Ordering::Relaxed);
    }

    /// Every (algorithm id, request) launched so far, in order.
    pub fn recorded_launches(&self) -> Vec<(u32, ConvRequest)> {
        self.recorded.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn last_launch(&self) -> Option<(u32, ConvRequest)> {
        self.recorded
            .lock()
            .ok()
            .and_then(|r| r.last().copied())
    }

    fn winograd_eligible(request: &ConvRequest) -> bool {
        request.filter.height == 3
            && request.filter.width == 3
            && request.conv.stride_rows == 1
            && request.conv.stride_cols == 1
            && request.conv.dilation_rows == 1
            && request.conv.dilation_cols == 1
            && request.conv.group_count == 1
    }

    fn im2col_bytes(request: &ConvRequest) -> usize {
        let patches = (request.output.count * request.output.height * request.output.width) as usize;
        let patch_len =
            (request.filter.height * request.filter.width * request.filter.input_maps) as usize;
        patches * patch_len * std::mem::size_of::<f32>()
    }
}

impl Default for ReferenceBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Reorder a filter in `src_layout` into HWIO.
fn filter_to_hwio(
    filter: &[f32],
    rows: usize,
    cols: usize,
    input_maps: usize,
    output_maps: usize,
    src_layout: FilterFormat,
) -> Vec<f32> {
    if src_layout == FilterFormat::Hwio {
        return filter.to_vec();
    }
    let mut out = vec![0.0f32; filter.len()];
    for r in 0..rows {
        for c in 0..cols {
            for i in 0..input_maps {
                for o in 0..output_maps {
                    let src = match src_layout {
                        FilterFormat::Hwio => unreachable!(),
                        FilterFormat::Oihw => ((o * input_maps + i) * rows + r) * cols + c,
                        FilterFormat::Ohwi => ((o * rows + r) * cols + c) * input_maps + i,
                    };
                    out[((r * cols + c) * input_maps + i) * output_maps + o] = filter[src];
                }
            }
        }
    }
    out
}

impl ConvBackend for ReferenceBackend {
    fn candidate_algorithms(&self, request: &ConvRequest) -> Vec<AlgorithmCandidate> {
        let mut candidates = vec![
            AlgorithmCandidate {
                algo: ALGO_IMPLICIT_GEMM,
                scratch_bytes: 0,
            },
            AlgorithmCandidate {
                algo: ALGO_GEMM,
                scratch_bytes: Self::im2col_bytes(request),
            },
        ];
        if Self::winograd_eligible(request) {
            candidates.push(AlgorithmCandidate {
                algo: ALGO_WINOGRAD,
                scratch_bytes: 16 << 10,
            });
        }
        candidates
    }

    fn launch(
        &self,
        algo: AlgorithmDesc,
        request: &ConvRequest,
        _stream: u64,
        input: &[f32],
        filter: &[f32],
        output: &mut [f32],
        scratch: &mut [u8],
    ) -> Result<f64> {
        self.launch_count.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut recorded) = self.recorded.lock() {
            recorded.push((algo.id, *request));
        }
        if self.fail_launches.load(Ordering::Relaxed) {
            return Err(EmberError::Internal(format!(
                "simulated launch failure for {}",
                algo
            )));
        }
        if self.scribble_algo.load(Ordering::Relaxed) == algo.id {
            scratch.fill(0xff);
        }

        let batch = request.input.count as usize;
        let in_depth = request.input.feature_maps as usize;
        let in_rows = request.input.height as usize;
        let in_cols = request.input.width as usize;
        let out_depth = request.output.feature_maps as usize;
        let out_rows = request.output.height as usize;
        let out_cols = request.output.width as usize;
        let filter_rows = request.filter.height as usize;
        let filter_cols = request.filter.width as usize;
        let patch_depth = request.filter.input_maps as usize;
        let groups = request.conv.group_count as usize;

        let input_nhwc = match request.input.layout {
            TensorFormat::Nhwc => input.to_vec(),
            TensorFormat::Nchw => nchw_to_nhwc(input, batch, in_depth, in_rows, in_cols),
        };
        let filter_hwio = filter_to_hwio(
            filter,
            filter_rows,
            filter_cols,
            patch_depth,
            out_depth,
            request.filter.layout,
        );

        let pad_rows = request.conv.padding_rows as usize;
        let pad_cols = request.conv.padding_cols as usize;
        let mut out_nhwc = vec![0.0f32; batch * out_rows * out_cols * out_depth];
        if groups <= 1 {
            spatial_conv_nhwc(
                &input_nhwc,
                batch,
                in_rows,
                in_cols,
                in_depth,
                &filter_hwio,
                filter_rows,
                filter_cols,
                out_depth,
                request.conv.stride_rows as usize,
                request.conv.stride_cols as usize,
                request.conv.dilation_rows as usize,
                request.conv.dilation_cols as usize,
                pad_rows,
                pad_cols,
                out_rows,
                out_cols,
                &mut out_nhwc,
            );
        } else {
            let group_out_depth = out_depth / groups;
            for g in 0..groups {
                let group_input = extract_channels_nhwc(
                    &input_nhwc,
                    batch,
                    in_rows,
                    in_cols,
                    in_depth,
                    g * patch_depth,
                    patch_depth,
                );
                let group_filter = extract_filter_outputs_hwio(
                    &filter_hwio,
                    filter_rows,
                    filter_cols,
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
                    filter_rows,
                    filter_cols,
                    group_out_depth,
                    request.conv.stride_rows as usize,
                    request.conv.stride_cols as usize,
                    request.conv.dilation_rows as usize,
                    request.conv.dilation_cols as usize,
                    pad_rows,
                    pad_cols,
                    out_rows,
                    out_cols,
                    &mut group_out,
                );
                scatter_channels_nhwc(
                    &group_out,
                    batch,
                    out_rows,
                    out_cols,
                    group_out_depth,
                    &mut out_nhwc,
                    out_depth,
                    g * group_out_depth,
                );
            }
        }

        match request.output.layout {
            TensorFormat::Nhwc => output.copy_from_slice(&out_nhwc),
            TensorFormat::Nchw => {
                let converted = nhwc_to_nchw(&out_nhwc, batch, out_rows, out_cols, out_depth);
                output.copy_from_slice(&converted);
            }
        }

        // Synthetic costs: winograd beats implicit gemm beats gemm, always.
        Ok(match algo.id {
            6 => 1.0,
            0 => 2.0,
            _ => 3.0,
        })
    }
}
