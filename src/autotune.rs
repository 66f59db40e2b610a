//! Algorithm autotuning for accelerator convolutions.
//!
//! A `ConvParameters` key captures everything that determines which low-level
//! algorithm wins for a problem shape; the winning selection is memoized in a
//! process-wide `ResourceCache` so the search runs once per shape.

use std::sync::Arc;

use lazy_static::lazy_static;
use tracing::debug;

use crate::accel::{ConvBackend, ConvRequest};
use crate::cache::{CacheKey, CachedResource, ResourceCache};
use crate::scratch::ScratchAllocator;
use crate::{DType, EmberError, Result, TensorFormat};

/// Cache key identifying one convolution problem shape on one device.
/// Equality and hash are structural over every field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConvParameters {
    pub batch: i64,
    pub in_depth: i64,
    pub in_rows: i64,
    pub in_cols: i64,
    pub compute_format: TensorFormat,
    pub out_depth: i64,
    pub filter_rows: i64,
    pub filter_cols: i64,
    pub filter_depth: i64,
    pub dilation_rows: i64,
    pub dilation_cols: i64,
    pub stride_rows: i64,
    pub stride_cols: i64,
    pub padding_rows: i64,
    pub padding_cols: i64,
    pub dtype: DType,
    pub device_id: usize,
    pub group_count: i64,
}

impl CacheKey for ConvParameters {
    type Primary = ConvParameters;

    fn primary(&self) -> Self::Primary {
        self.clone()
    }

    fn matches(&self, other: &Self) -> bool {
        self == other
    }
}

/// Identifier of one candidate convolution algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlgorithmDesc {
    pub id: u32,
    pub name: &'static str,
}

impl std::fmt::Display for AlgorithmDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

/// One algorithm the backend offers for a given request, with its workspace
/// requirement for that request.
#[derive(Debug, Clone, Copy)]
pub struct AlgorithmCandidate {
    pub algo: AlgorithmDesc,
    pub scratch_bytes: usize,
}

/// The winning selection for a `ConvParameters` key. Immutable once cached.
#[derive(Debug, Clone)]
pub struct AutotuneEntry {
    pub algo: AlgorithmDesc,
    pub scratch_bytes: usize,
    /// Measured cost of the profiling run, backend units (lower is better).
    pub cost: f64,
}

impl CachedResource for AutotuneEntry {}

lazy_static! {
    static ref CONV_AUTOTUNE_MAP: ResourceCache<ConvParameters, AutotuneEntry> =
        ResourceCache::new();
}

/// Process-wide map of autotuned convolution selections.
pub fn conv_autotune_map() -> &'static ResourceCache<ConvParameters, AutotuneEntry> {
    &CONV_AUTOTUNE_MAP
}

/// Guard bytes appended after each profiling workspace. An algorithm that
/// writes past its declared workspace corrupts the pattern and is excluded.
pub const REDZONE_BYTES: usize = 64;
const REDZONE_PATTERN: u8 = 0xab;

/// Fetch the cached selection for `parameters`, or run the search: profile
/// every candidate whose workspace fits `scratch_limit`, drop candidates that
/// fail or violate the redzone, keep the cheapest survivor. Ties break toward
/// the smaller workspace, then the lower id, so selection is deterministic.
///
/// Fails with `ConstructionFailed` only when no candidate is admissible; a
/// failed search is not cached and a later call retries.
#[allow(clippy::too_many_arguments)]
pub fn autotune_unfused_conv(
    map: &ResourceCache<ConvParameters, AutotuneEntry>,
    parameters: &ConvParameters,
    backend: &dyn ConvBackend,
    request: &ConvRequest,
    stream: u64,
    input: &[f32],
    filter: &[f32],
    output: &mut [f32],
    scratch_limit: usize,
) -> Result<Arc<AutotuneEntry>> {
    map.get_or_create(parameters, || {
        let candidates = backend.candidate_algorithms(request);
        if candidates.is_empty() {
            return Err(EmberError::ConstructionFailed(
                "backend offers no convolution algorithms for this shape".to_string(),
            ));
        }

        let mut best: Option<AutotuneEntry> = None;
        for candidate in &candidates {
            if candidate.scratch_bytes > scratch_limit {
                debug!(
                    algorithm = %candidate.algo,
                    scratch = candidate.scratch_bytes,
                    limit = scratch_limit,
                    "skipping candidate: workspace over limit"
                );
                continue;
            }

            let mut allocator = ScratchAllocator::new(scratch_limit + REDZONE_BYTES);
            let mut scratch = match allocator.allocate(candidate.scratch_bytes + REDZONE_BYTES) {
                Ok(buf) => buf,
                Err(_) => continue,
            };
            scratch[candidate.scratch_bytes..].fill(REDZONE_PATTERN);

            let cost = match backend.launch(
                candidate.algo,
                request,
                stream,
                input,
                filter,
                output,
                &mut scratch,
            ) {
                Ok(cost) => cost,
                Err(e) => {
                    debug!(algorithm = %candidate.algo, error = %e, "candidate failed profiling");
                    continue;
                }
            };

            if scratch[candidate.scratch_bytes..]
                .iter()
                .any(|&b| b != REDZONE_PATTERN)
            {
                debug!(algorithm = %candidate.algo, "candidate wrote past its workspace, excluded");
                continue;
            }

            debug!(algorithm = %candidate.algo, cost, "profiled candidate");
            let better = match &best {
                None => true,
                Some(b) => {
                    cost < b.cost
                        || (cost == b.cost && candidate.scratch_bytes < b.scratch_bytes)
                        || (cost == b.cost
                            && candidate.scratch_bytes == b.scratch_bytes
                            && candidate.algo.id < b.algo.id)
                }
            };
            if better {
                best = Some(AutotuneEntry {
                    algo: candidate.algo,
                    scratch_bytes: candidate.scratch_bytes,
                    cost,
                });
            }
        }

        best.ok_or_else(|| {
            EmberError::ConstructionFailed(
                "no admissible convolution algorithm for this shape".to_string(),
            )
        })
    })
}
