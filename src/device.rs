use std::sync::Arc;

use crate::accel::ConvBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Accelerator,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => f.write_str("CPU"),
            Self::Accelerator => f.write_str("Accelerator"),
        }
    }
}

/// Capability class of an accelerator device.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccelCapability {
    /// Device can run reduced-precision convolutions efficiently in the
    /// channel-last layout, so the pipeline keeps NHWC instead of converting.
    pub fast_channel_last_reduced_precision: bool,
}

#[derive(Clone)]
enum DeviceInner {
    Cpu,
    Accel {
        ordinal: usize,
        capability: AccelCapability,
        backend: Arc<dyn ConvBackend>,
    },
}

/// Handle to the device a convolution should run on.
#[derive(Clone)]
pub struct Device {
    inner: DeviceInner,
}

impl Device {
    pub fn cpu() -> Self {
        Self {
            inner: DeviceInner::Cpu,
        }
    }

    pub fn accelerator(
        ordinal: usize,
        capability: AccelCapability,
        backend: Arc<dyn ConvBackend>,
    ) -> Self {
        Self {
            inner: DeviceInner::Accel {
                ordinal,
                capability,
                backend,
            },
        }
    }

    pub fn kind(&self) -> DeviceKind {
        match self.inner {
            DeviceInner::Cpu => DeviceKind::Cpu,
            DeviceInner::Accel { .. } => DeviceKind::Accelerator,
        }
    }

    pub fn ordinal(&self) -> usize {
        match &self.inner {
            DeviceInner::Cpu => 0,
            DeviceInner::Accel { ordinal, .. } => *ordinal,
        }
    }

    pub fn capability(&self) -> AccelCapability {
        match &self.inner {
            DeviceInner::Cpu => AccelCapability::default(),
            DeviceInner::Accel { capability, .. } => *capability,
        }
    }

    pub(crate) fn backend(&self) -> Option<&Arc<dyn ConvBackend>> {
        match &self.inner {
            DeviceInner::Cpu => None,
            DeviceInner::Accel { backend, .. } => Some(backend),
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            DeviceInner::Cpu => f.write_str("Device(CPU)"),
            DeviceInner::Accel { ordinal, .. } => write!(f, "Device(Accelerator:{})", ordinal),
        }
    }
}
