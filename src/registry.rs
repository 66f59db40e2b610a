//! Kernel registry keyed by (operation, device kind, dtype).

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::conv::{AccelConvLauncher, Conv2dDimensions, Conv2dParams, CpuConvLauncher};
use crate::{Device, DeviceKind, DType, EmberError, Result, Tensor};

/// One registered convolution kernel implementation.
pub trait ConvLauncher: Send + Sync {
    fn launch(
        &self,
        device: &Device,
        params: &Conv2dParams,
        dims: &Conv2dDimensions,
        input: &Tensor,
        filter: &Tensor,
    ) -> Result<Tensor>;
}

type RegistryKey = (&'static str, DeviceKind, DType);

pub struct KernelRegistry {
    launchers: HashMap<RegistryKey, Arc<dyn ConvLauncher>>,
}

impl KernelRegistry {
    fn new() -> Self {
        let mut launchers: HashMap<RegistryKey, Arc<dyn ConvLauncher>> = HashMap::new();
        let cpu: Arc<dyn ConvLauncher> = Arc::new(CpuConvLauncher);
        let accel: Arc<dyn ConvLauncher> = Arc::new(AccelConvLauncher);
        launchers.insert(("Conv2D", DeviceKind::Cpu, DType::F32), cpu);
        for dtype in [DType::F32, DType::F16, DType::BF16] {
            launchers.insert(("Conv2D", DeviceKind::Accelerator, dtype), accel.clone());
        }
        Self { launchers }
    }

    pub fn lookup(
        &self,
        op: &'static str,
        device_kind: DeviceKind,
        dtype: DType,
    ) -> Result<Arc<dyn ConvLauncher>> {
        self.launchers
            .get(&(op, device_kind, dtype))
            .cloned()
            .ok_or_else(|| {
                EmberError::Unimplemented(format!(
                    "no registered '{}' kernel for device {:?} with dtype {}",
                    op, device_kind, dtype
                ))
            })
    }
}

pub fn kernel_registry() -> &'static KernelRegistry {
    static REGISTRY: OnceLock<KernelRegistry> = OnceLock::new();
    REGISTRY.get_or_init(KernelRegistry::new)
}
