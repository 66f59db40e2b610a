use std::sync::Arc;

use approx::assert_relative_eq;

use ember_core::accel::{
    BatchDescriptor, ConvBackend, ConvRequest, ConvolutionDescriptor, FilterDescriptor,
};
use ember_core::autotune::{
    autotune_unfused_conv, AlgorithmCandidate, AlgorithmDesc, AutotuneEntry, ConvParameters,
};
use ember_core::cache::ResourceCache;
use ember_core::reference::{ReferenceBackend, ALGO_IMPLICIT_GEMM, ALGO_WINOGRAD};
use ember_core::{
    conv2d, AccelCapability, Conv2dParams, DType, Device, FilterFormat, Padding, Result, Shape,
    Tensor, TensorFormat,
};

// Each test uses its own device ordinal so entries in the process-wide
// autotune and executor caches never collide across tests.
fn accel(ordinal: usize, fast_channel_last: bool) -> (Arc<ReferenceBackend>, Device) {
    let backend = Arc::new(ReferenceBackend::new());
    let capability = AccelCapability {
        fast_channel_last_reduced_precision: fast_channel_last,
    };
    let device = Device::accelerator(ordinal, capability, backend.clone());
    (backend, device)
}

fn assert_close(got: &[f32], want: &[f32]) {
    assert_eq!(got.len(), want.len());
    for (g, w) in got.iter().zip(want) {
        assert_relative_eq!(g, w, epsilon = 1e-4, max_relative = 1e-4);
    }
}

#[test]
fn asymmetric_padding_is_absorbed_into_the_input() -> Result<()> {
    let (backend, device) = accel(10, false);
    let mut params = Conv2dParams::default();
    params.padding = Padding::Explicit;
    // One extra row on top, one extra column on the left.
    params.explicit_paddings = vec![0, 0, 1, 0, 1, 0, 0, 0];

    let input = Tensor::rand_uniform(Shape::from_dims(&[1, 5, 5, 2]), -1.0, 1.0);
    let filter = Tensor::rand_uniform(Shape::from_dims(&[2, 2, 2, 3]), -1.0, 1.0);

    let out = conv2d(&device, &params, &input, &filter)?;
    assert_eq!(out.shape().dims(), &[1, 5, 5, 3]);

    // The primitive saw a symmetric problem: the odd row/column were folded
    // into a pre-padded 6x6 input and the descriptor padding dropped to zero.
    let (_, request) = backend.last_launch().unwrap();
    assert_eq!(request.input.height, 6);
    assert_eq!(request.input.width, 6);
    assert_eq!(request.conv.padding_rows, 0);
    assert_eq!(request.conv.padding_cols, 0);
    assert_eq!(request.input.layout, TensorFormat::Nchw);
    assert_eq!(request.filter.layout, FilterFormat::Oihw);
    assert_eq!(request.conv.group_count, 1);

    let cpu_out = conv2d(&Device::cpu(), &params, &input, &filter)?;
    assert_close(out.data(), cpu_out.data());
    Ok(())
}

#[test]
fn symmetric_padding_goes_straight_to_the_descriptor() -> Result<()> {
    let (backend, device) = accel(11, false);
    let mut params = Conv2dParams::default();
    params.padding = Padding::Same;

    let input = Tensor::rand_uniform(Shape::from_dims(&[1, 5, 5, 2]), -1.0, 1.0);
    let filter = Tensor::rand_uniform(Shape::from_dims(&[3, 3, 2, 4]), -1.0, 1.0);

    let out = conv2d(&device, &params, &input, &filter)?;
    assert_eq!(out.shape().dims(), &[1, 5, 5, 4]);

    let (_, request) = backend.last_launch().unwrap();
    assert_eq!(request.input.height, 5);
    assert_eq!(request.input.width, 5);
    assert_eq!(request.conv.padding_rows, 1);
    assert_eq!(request.conv.padding_cols, 1);

    let cpu_out = conv2d(&Device::cpu(), &params, &input, &filter)?;
    assert_close(out.data(), cpu_out.data());
    Ok(())
}

#[test]
fn reduced_precision_keeps_channel_last_when_the_device_is_fast_at_it() -> Result<()> {
    let (backend, device) = accel(12, true);
    let params = Conv2dParams::default();
    let input = Tensor::rand_uniform(Shape::from_dims(&[1, 6, 6, 3]), -1.0, 1.0)
        .to_dtype(DType::BF16)?;
    let filter = Tensor::rand_uniform(Shape::from_dims(&[2, 2, 3, 4]), -1.0, 1.0)
        .to_dtype(DType::BF16)?;

    let out = conv2d(&device, &params, &input, &filter)?;
    assert_eq!(out.dtype(), DType::BF16);
    assert_eq!(out.shape().dims(), &[1, 5, 5, 4]);

    let (_, request) = backend.last_launch().unwrap();
    assert_eq!(request.input.layout, TensorFormat::Nhwc);
    assert_eq!(request.filter.layout, FilterFormat::Ohwi);
    assert_eq!(request.dtype, DType::BF16);
    Ok(())
}

#[test]
fn full_precision_converts_to_channel_first_regardless_of_capability() -> Result<()> {
    let (backend, device) = accel(13, true);
    let params = Conv2dParams::default();
    let input = Tensor::rand_uniform(Shape::from_dims(&[1, 6, 6, 3]), -1.0, 1.0);
    let filter = Tensor::rand_uniform(Shape::from_dims(&[2, 2, 3, 4]), -1.0, 1.0);

    let out = conv2d(&device, &params, &input, &filter)?;
    assert_eq!(out.dtype(), DType::F32);

    let (_, request) = backend.last_launch().unwrap();
    assert_eq!(request.input.layout, TensorFormat::Nchw);
    assert_eq!(request.filter.layout, FilterFormat::Oihw);

    let cpu_out = conv2d(&Device::cpu(), &params, &input, &filter)?;
    assert_close(out.data(), cpu_out.data());
    Ok(())
}

#[test]
fn single_channel_input_matches_cpu() -> Result<()> {
    // Depth 1 skips the layout transpose; the result must not change.
    let (_, device) = accel(14, false);
    let params = Conv2dParams::default();
    let input = Tensor::rand_uniform(Shape::from_dims(&[2, 7, 7, 1]), -1.0, 1.0);
    let filter = Tensor::rand_uniform(Shape::from_dims(&[3, 3, 1, 5]), -1.0, 1.0);

    let out = conv2d(&device, &params, &input, &filter)?;
    let cpu_out = conv2d(&Device::cpu(), &params, &input, &filter)?;
    assert_close(out.data(), cpu_out.data());
    Ok(())
}

#[test]
fn autotune_runs_once_per_problem_shape() -> Result<()> {
    let (backend, device) = accel(15, false);
    let params = Conv2dParams::default();
    // 2x2 filter: the backend offers two candidates and no winograd.
    let input = Tensor::rand_uniform(Shape::from_dims(&[1, 10, 10, 2]), -1.0, 1.0);
    let filter = Tensor::rand_uniform(Shape::from_dims(&[2, 2, 2, 3]), -1.0, 1.0);

    conv2d(&device, &params, &input, &filter)?;
    // Two profiling launches plus the real one.
    assert_eq!(backend.launch_count(), 3);

    conv2d(&device, &params, &input, &filter)?;
    // Cached selection: only the real launch.
    assert_eq!(backend.launch_count(), 4);

    // A different shape triggers a fresh search.
    let wider = Tensor::rand_uniform(Shape::from_dims(&[1, 12, 10, 2]), -1.0, 1.0);
    conv2d(&device, &params, &wider, &filter)?;
    assert_eq!(backend.launch_count(), 7);
    Ok(())
}

#[test]
fn cheapest_profiled_algorithm_wins() -> Result<()> {
    let (backend, device) = accel(16, false);
    let params = Conv2dParams::default();
    // 3x3, stride 1: winograd is offered and profiles cheapest.
    let input = Tensor::rand_uniform(Shape::from_dims(&[1, 8, 8, 2]), -1.0, 1.0);
    let filter = Tensor::rand_uniform(Shape::from_dims(&[3, 3, 2, 4]), -1.0, 1.0);

    conv2d(&device, &params, &input, &filter)?;
    assert_eq!(backend.launch_count(), 4);
    let (algo, _) = backend.last_launch().unwrap();
    assert_eq!(algo, ALGO_WINOGRAD.id);
    Ok(())
}

#[test]
fn workspace_scribbler_is_excluded() -> Result<()> {
    let (backend, device) = accel(17, false);
    backend.set_scribble_algo(Some(ALGO_WINOGRAD.id));
    let params = Conv2dParams::default();
    let input = Tensor::rand_uniform(Shape::from_dims(&[1, 8, 8, 3]), -1.0, 1.0);
    let filter = Tensor::rand_uniform(Shape::from_dims(&[3, 3, 3, 4]), -1.0, 1.0);

    let out = conv2d(&device, &params, &input, &filter)?;
    // Winograd would have won on cost, but it trampled the workspace guard;
    // the next-cheapest clean candidate is selected instead.
    let (algo, _) = backend.last_launch().unwrap();
    assert_eq!(algo, ALGO_IMPLICIT_GEMM.id);

    let cpu_out = conv2d(&Device::cpu(), &params, &input, &filter)?;
    assert_close(out.data(), cpu_out.data());
    Ok(())
}

#[test]
fn launch_failure_propagates_without_evicting_the_selection() -> Result<()> {
    let (backend, device) = accel(18, false);
    let params = Conv2dParams::default();
    let input = Tensor::rand_uniform(Shape::from_dims(&[1, 9, 9, 2]), -1.0, 1.0);
    let filter = Tensor::rand_uniform(Shape::from_dims(&[2, 2, 2, 3]), -1.0, 1.0);

    conv2d(&device, &params, &input, &filter)?;
    assert_eq!(backend.launch_count(), 3);

    backend.set_fail_launches(true);
    let err = conv2d(&device, &params, &input, &filter).unwrap_err();
    assert!(matches!(err, ember_core::EmberError::Internal(_)));
    // The cached selection was reused: exactly one (failed) launch, no
    // re-profiling.
    assert_eq!(backend.launch_count(), 4);

    backend.set_fail_launches(false);
    conv2d(&device, &params, &input, &filter)?;
    assert_eq!(backend.launch_count(), 5);
    Ok(())
}

#[test]
fn failed_search_is_retried_not_cached() -> Result<()> {
    let (backend, device) = accel(19, false);
    backend.set_fail_launches(true);
    let params = Conv2dParams::default();
    let input = Tensor::rand_uniform(Shape::from_dims(&[1, 7, 9, 2]), -1.0, 1.0);
    let filter = Tensor::rand_uniform(Shape::from_dims(&[2, 2, 2, 3]), -1.0, 1.0);

    // Every profiling launch fails: the search produces no admissible
    // algorithm and nothing is cached.
    let err = conv2d(&device, &params, &input, &filter).unwrap_err();
    assert!(matches!(err, ember_core::EmberError::ConstructionFailed(_)));
    assert_eq!(backend.launch_count(), 2);

    backend.set_fail_launches(false);
    conv2d(&device, &params, &input, &filter)?;
    // The full search ran again and then launched.
    assert_eq!(backend.launch_count(), 5);
    Ok(())
}

struct BigScratchBackend {
    scratch_bytes: usize,
}

impl ConvBackend for BigScratchBackend {
    fn candidate_algorithms(&self, _request: &ConvRequest) -> Vec<AlgorithmCandidate> {
        vec![AlgorithmCandidate {
            algo: AlgorithmDesc {
                id: 1,
                name: "hungry",
            },
            scratch_bytes: self.scratch_bytes,
        }]
    }

    fn launch(
        &self,
        _algo: AlgorithmDesc,
        _request: &ConvRequest,
        _stream: u64,
        _input: &[f32],
        _filter: &[f32],
        output: &mut [f32],
        _scratch: &mut [u8],
    ) -> Result<f64> {
        output.fill(0.0);
        Ok(1.0)
    }
}

fn tiny_request() -> ConvRequest {
    ConvRequest {
        input: BatchDescriptor {
            count: 1,
            feature_maps: 1,
            height: 4,
            width: 4,
            layout: TensorFormat::Nhwc,
        },
        filter: FilterDescriptor {
            output_maps: 1,
            input_maps: 1,
            height: 2,
            width: 2,
            layout: FilterFormat::Hwio,
        },
        output: BatchDescriptor {
            count: 1,
            feature_maps: 1,
            height: 3,
            width: 3,
            layout: TensorFormat::Nhwc,
        },
        conv: ConvolutionDescriptor {
            stride_rows: 1,
            stride_cols: 1,
            dilation_rows: 1,
            dilation_cols: 1,
            padding_rows: 0,
            padding_cols: 0,
            group_count: 1,
        },
        dtype: DType::F32,
    }
}

fn tiny_parameters(device_id: usize) -> ConvParameters {
    ConvParameters {
        batch: 1,
        in_depth: 1,
        in_rows: 4,
        in_cols: 4,
        compute_format: TensorFormat::Nhwc,
        out_depth: 1,
        filter_rows: 2,
        filter_cols: 2,
        filter_depth: 1,
        dilation_rows: 1,
        dilation_cols: 1,
        stride_rows: 1,
        stride_cols: 1,
        padding_rows: 0,
        padding_cols: 0,
        dtype: DType::F32,
        device_id,
        group_count: 1,
    }
}

#[test]
fn candidates_over_the_scratch_limit_are_inadmissible() {
    let map = ResourceCache::<ConvParameters, AutotuneEntry>::new();
    let backend = BigScratchBackend {
        scratch_bytes: 1 << 20,
    };
    let request = tiny_request();
    let input = vec![0.5f32; 16];
    let filter = vec![0.5f32; 4];
    let mut output = vec![0.0f32; 9];

    let err = autotune_unfused_conv(
        &map,
        &tiny_parameters(90),
        &backend,
        &request,
        1,
        &input,
        &filter,
        &mut output,
        1024,
    )
    .unwrap_err();
    assert!(matches!(err, ember_core::EmberError::ConstructionFailed(_)));

    // The same candidate is admissible once the ceiling allows it.
    let entry = autotune_unfused_conv(
        &map,
        &tiny_parameters(90),
        &backend,
        &request,
        1,
        &input,
        &filter,
        &mut output,
        2 << 20,
    )
    .unwrap();
    assert_eq!(entry.algo.id, 1);
    assert_eq!(entry.scratch_bytes, 1 << 20);
}

#[test]
fn scratch_allocator_enforces_its_ceiling() {
    let mut allocator = ember_core::scratch::ScratchAllocator::new(1024);
    let first = allocator.allocate(600).unwrap();
    assert_eq!(first.len(), 600);
    let err = allocator.allocate(600).unwrap_err();
    assert!(err.is_resource_exhausted());
    assert_eq!(allocator.total_allocated(), 600);
    allocator.allocate(424).unwrap();
    assert_eq!(allocator.total_allocated(), 1024);
}

struct EmptyBackend;

impl ConvBackend for EmptyBackend {
    fn candidate_algorithms(&self, _request: &ConvRequest) -> Vec<AlgorithmCandidate> {
        Vec::new()
    }

    fn launch(
        &self,
        _algo: AlgorithmDesc,
        _request: &ConvRequest,
        _stream: u64,
        _input: &[f32],
        _filter: &[f32],
        _output: &mut [f32],
        _scratch: &mut [u8],
    ) -> Result<f64> {
        unreachable!("no algorithms to launch")
    }
}

#[test]
fn a_backend_with_no_algorithms_fails_the_search() {
    let map = ResourceCache::<ConvParameters, AutotuneEntry>::new();
    let request = tiny_request();
    let input = vec![0.0f32; 16];
    let filter = vec![0.0f32; 4];
    let mut output = vec![0.0f32; 9];

    let err = autotune_unfused_conv(
        &map,
        &tiny_parameters(91),
        &EmptyBackend,
        &request,
        1,
        &input,
        &filter,
        &mut output,
        1 << 20,
    )
    .unwrap_err();
    assert!(matches!(err, ember_core::EmberError::ConstructionFailed(_)));
}

#[test]
fn grouped_convolution_runs_through_the_pipeline() -> Result<()> {
    let (backend, device) = accel(20, false);
    let params = Conv2dParams::default();
    let input = Tensor::rand_uniform(Shape::from_dims(&[1, 6, 6, 8]), -1.0, 1.0);
    let filter = Tensor::rand_uniform(Shape::from_dims(&[2, 2, 4, 8]), -1.0, 1.0);

    let out = conv2d(&device, &params, &input, &filter)?;
    let (_, request) = backend.last_launch().unwrap();
    assert_eq!(request.conv.group_count, 2);

    let cpu_out = conv2d(&Device::cpu(), &params, &input, &filter)?;
    assert_close(out.data(), cpu_out.data());
    Ok(())
}

#[test]
fn channel_first_callers_run_the_pipeline() -> Result<()> {
    let (backend, device) = accel(22, false);
    let mut params = Conv2dParams::default();
    params.padding = Padding::Same;
    params.data_format = TensorFormat::Nchw;

    let nhwc = Tensor::rand_uniform(Shape::from_dims(&[2, 6, 6, 3]), -1.0, 1.0);
    let filter = Tensor::rand_uniform(Shape::from_dims(&[3, 3, 3, 4]), -1.0, 1.0);
    let input = Tensor::from_vec(
        ember_core::kernels::nhwc_to_nchw(nhwc.data(), 2, 6, 6, 3),
        Shape::from_dims(&[2, 3, 6, 6]),
    )?;

    let out = conv2d(&device, &params, &input, &filter)?;
    assert_eq!(out.shape().dims(), &[2, 4, 6, 6]);

    // Caller layout already matches the compute layout: no transpose ran.
    let (_, request) = backend.last_launch().unwrap();
    assert_eq!(request.input.layout, TensorFormat::Nchw);
    assert_eq!(request.filter.layout, FilterFormat::Oihw);

    let nhwc_params = Conv2dParams {
        padding: Padding::Same,
        ..Conv2dParams::default()
    };
    let cpu_out = conv2d(&Device::cpu(), &nhwc_params, &nhwc, &filter)?;
    let want = ember_core::kernels::nhwc_to_nchw(cpu_out.data(), 2, 6, 6, 4);
    assert_close(out.data(), &want);
    Ok(())
}

#[test]
fn channel_first_asymmetric_padding_is_absorbed_in_place() -> Result<()> {
    let (backend, device) = accel(23, false);
    let mut params = Conv2dParams::default();
    params.padding = Padding::Same;
    params.data_format = TensorFormat::Nchw;

    // 5x5 input, 2x2 filter, SAME: the odd padding unit lands after, so the
    // pipeline pre-pads the channel-first input itself.
    let nhwc = Tensor::rand_uniform(Shape::from_dims(&[1, 5, 5, 2]), -1.0, 1.0);
    let filter = Tensor::rand_uniform(Shape::from_dims(&[2, 2, 2, 3]), -1.0, 1.0);
    let input = Tensor::from_vec(
        ember_core::kernels::nhwc_to_nchw(nhwc.data(), 1, 5, 5, 2),
        Shape::from_dims(&[1, 2, 5, 5]),
    )?;

    let out = conv2d(&device, &params, &input, &filter)?;
    assert_eq!(out.shape().dims(), &[1, 3, 5, 5]);

    let (_, request) = backend.last_launch().unwrap();
    assert_eq!(request.input.height, 6);
    assert_eq!(request.input.width, 6);
    assert_eq!(request.conv.padding_rows, 0);
    assert_eq!(request.conv.padding_cols, 0);

    let nhwc_params = Conv2dParams {
        padding: Padding::Same,
        ..Conv2dParams::default()
    };
    let cpu_out = conv2d(&Device::cpu(), &nhwc_params, &nhwc, &filter)?;
    let want = ember_core::kernels::nhwc_to_nchw(cpu_out.data(), 1, 5, 5, 3);
    assert_close(out.data(), &want);
    Ok(())
}

#[test]
fn channel_first_pointwise_takes_the_pipeline_not_the_shortcut() -> Result<()> {
    // The matmul shortcut flattens channel-last rows; a channel-first caller
    // must go through the backend instead.
    let (backend, device) = accel(24, false);
    let mut params = Conv2dParams::default();
    params.data_format = TensorFormat::Nchw;

    let nhwc = Tensor::rand_uniform(Shape::from_dims(&[1, 5, 5, 3]), -1.0, 1.0);
    let filter = Tensor::rand_uniform(Shape::from_dims(&[1, 1, 3, 4]), -1.0, 1.0);
    let input = Tensor::from_vec(
        ember_core::kernels::nhwc_to_nchw(nhwc.data(), 1, 5, 5, 3),
        Shape::from_dims(&[1, 3, 5, 5]),
    )?;

    let out = conv2d(&device, &params, &input, &filter)?;
    assert_eq!(out.shape().dims(), &[1, 4, 5, 5]);
    assert!(backend.launch_count() > 0);

    let nhwc_params = Conv2dParams::default();
    let cpu_out = conv2d(&Device::cpu(), &nhwc_params, &nhwc, &filter)?;
    let want = ember_core::kernels::nhwc_to_nchw(cpu_out.data(), 1, 5, 5, 4);
    assert_close(out.data(), &want);
    Ok(())
}

#[test]
fn matmul_shortcuts_bypass_the_backend_entirely() -> Result<()> {
    let (backend, device) = accel(21, false);
    let params = Conv2dParams::default();
    let input = Tensor::rand_uniform(Shape::from_dims(&[1, 5, 5, 3]), -1.0, 1.0);
    let filter = Tensor::rand_uniform(Shape::from_dims(&[1, 1, 3, 4]), -1.0, 1.0);

    let out = conv2d(&device, &params, &input, &filter)?;
    assert_eq!(out.shape().dims(), &[1, 5, 5, 4]);
    assert_eq!(backend.launch_count(), 0);

    let cpu_out = conv2d(&Device::cpu(), &params, &input, &filter)?;
    assert_close(out.data(), cpu_out.data());
    Ok(())
}
