//! Device executor caching.
//!
//! A `DeviceExecutor` is the expensive per-device execution context (owns the
//! live stream handles used to launch work). Executors are built at most once
//! per configuration through the process-wide `ExecutorCache`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use tracing::debug;

use crate::cache::{CacheKey, CachedResource, ResourceCache};
use crate::{EmberError, Result};

/// Immutable configuration identifying one executor.
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    pub ordinal: usize,
    /// Opaque hash of the platform build the executor belongs to.
    pub hash: u64,
    /// Plugin selection (DNN/BLAS implementations), opaque to the cache.
    pub plugin_config: String,
    /// Device option flags, opaque to the cache.
    pub device_options: u32,
    /// When set, lookups resolve by scanning for the executor that owns this
    /// stream instead of matching configuration fields.
    pub stream_to_find: Option<u64>,
}

impl CacheKey for ExecutorConfig {
    type Primary = (usize, u64);

    fn primary(&self) -> Self::Primary {
        (self.ordinal, self.hash)
    }

    fn matches(&self, other: &Self) -> bool {
        self.plugin_config == other.plugin_config && self.device_options == other.device_options
    }
}

static NEXT_STREAM: AtomicU64 = AtomicU64::new(1);

/// Execution context for one device configuration. Owned by the cache;
/// callers borrow it for the duration of a launch.
#[derive(Debug)]
pub struct DeviceExecutor {
    ordinal: usize,
    plugin_config: String,
    streams: Mutex<Vec<u64>>,
}

impl DeviceExecutor {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            ordinal: config.ordinal,
            plugin_config: config.plugin_config.clone(),
            streams: Mutex::new(Vec::new()),
        }
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn plugin_config(&self) -> &str {
        &self.plugin_config
    }

    /// Allocate a new live stream handle owned by this executor.
    pub fn allocate_stream(&self) -> u64 {
        let handle = NEXT_STREAM.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut streams) = self.streams.lock() {
            streams.push(handle);
        }
        handle
    }

    /// The executor's long-lived launch stream, allocated on first use.
    pub fn default_stream(&self) -> u64 {
        match self.streams.lock() {
            Ok(mut streams) => {
                if let Some(&first) = streams.first() {
                    first
                } else {
                    let handle = NEXT_STREAM.fetch_add(1, Ordering::Relaxed);
                    streams.push(handle);
                    handle
                }
            }
            Err(_) => 0,
        }
    }
}

impl CachedResource for DeviceExecutor {
    fn owns_live_handle(&self, handle: u64) -> bool {
        self.streams
            .lock()
            .map(|streams| streams.contains(&handle))
            .unwrap_or(false)
    }
}

/// Configuration-keyed cache of device executors.
pub struct ExecutorCache {
    inner: ResourceCache<ExecutorConfig, DeviceExecutor>,
}

impl ExecutorCache {
    pub fn new() -> Self {
        Self {
            inner: ResourceCache::new(),
        }
    }

    pub fn get_or_create<F>(&self, config: &ExecutorConfig, factory: F) -> Result<Arc<DeviceExecutor>>
    where
        F: FnOnce() -> Result<DeviceExecutor>,
    {
        if config.stream_to_find.is_some() {
            // Reverse lookups never construct.
            return self.get(config);
        }
        self.inner.get_or_create(config, factory)
    }

    pub fn get(&self, config: &ExecutorConfig) -> Result<Arc<DeviceExecutor>> {
        if let Some(stream) = config.stream_to_find {
            return self.inner.find_by_live_handle(stream);
        }
        self.inner.get(config).map_err(|e| match e {
            EmberError::NotFound(_) => EmberError::NotFound(format!(
                "no executors registered for (ordinal {}, hash {:#x})",
                config.ordinal, config.hash
            )),
            other => other,
        })
    }

    pub fn find_by_live_handle(&self, stream: u64) -> Result<Arc<DeviceExecutor>> {
        self.inner.find_by_live_handle(stream)
    }

    pub fn destroy_all_executors(&self) {
        debug!("destroying all cached executors");
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Default for ExecutorCache {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    static ref EXECUTOR_CACHE: ExecutorCache = ExecutorCache::new();
}

/// Process-wide executor cache.
pub fn executor_cache() -> &'static ExecutorCache {
    &EXECUTOR_CACHE
}
