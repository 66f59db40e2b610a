//! Bounded scratch memory for accelerator launches.

use std::sync::OnceLock;

use tracing::warn;

use crate::{EmberError, Result};

/// 8 GiB, matching the conventional DNN workspace ceiling.
pub const DEFAULT_WORKSPACE_LIMIT_BYTES: usize = 1 << 33;

const WORKSPACE_LIMIT_ENV: &str = "EMBER_CONV_WORKSPACE_LIMIT_MB";

static WORKSPACE_LIMIT: OnceLock<usize> = OnceLock::new();

/// Scratch byte ceiling for convolution workspaces. The override is read from
/// `EMBER_CONV_WORKSPACE_LIMIT_MB` once, on first use.
pub fn workspace_limit_bytes() -> usize {
    *WORKSPACE_LIMIT.get_or_init(|| match std::env::var(WORKSPACE_LIMIT_ENV) {
        Ok(raw) if !raw.is_empty() => match raw.parse::<usize>() {
            Ok(mb) => mb << 20,
            Err(_) => {
                warn!(value = %raw, "invalid value for {}", WORKSPACE_LIMIT_ENV);
                DEFAULT_WORKSPACE_LIMIT_BYTES
            }
        },
        _ => DEFAULT_WORKSPACE_LIMIT_BYTES,
    })
}

/// Allocator backing one launch's workspace. Enforces the byte ceiling;
/// exhaustion is surfaced as `ResourceExhausted` so the caller can fall back
/// to an algorithm with a smaller footprint.
pub struct ScratchAllocator {
    limit_bytes: usize,
    allocated_bytes: usize,
}

impl ScratchAllocator {
    pub fn new(limit_bytes: usize) -> Self {
        Self {
            limit_bytes,
            allocated_bytes: 0,
        }
    }

    pub fn allocate(&mut self, bytes: usize) -> Result<Vec<u8>> {
        let requested = self.allocated_bytes.saturating_add(bytes);
        if requested > self.limit_bytes {
            return Err(EmberError::ResourceExhausted(format!(
                "scratch allocation of {} bytes exceeds limit of {} bytes ({} already in use)",
                bytes, self.limit_bytes, self.allocated_bytes
            )));
        }
        self.allocated_bytes = requested;
        Ok(vec![0u8; bytes])
    }

    pub fn total_allocated(&self) -> usize {
        self.allocated_bytes
    }

    pub fn limit_bytes(&self) -> usize {
        self.limit_bytes
    }
}
