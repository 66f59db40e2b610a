//! Convolution planning and execution for ember.
//!
//! Two pillars: a configuration-keyed resource cache (used for device
//! executors and autotuned algorithm selections) and a 2-D convolution
//! planner that validates attributes, resolves output geometry, selects a
//! computational strategy, and dispatches to CPU kernels or the accelerator
//! pipeline.

pub mod accel;
pub mod autotune;
pub mod cache;
pub mod conv;
pub mod deep_conv;
pub mod device;
pub mod dtype;
pub mod error;
pub mod executor;
pub mod format;
pub mod kernels;
pub mod reference;
pub mod registry;
pub mod scratch;
pub mod shape;
pub mod tensor;

pub use conv::{
    compute_conv2d_dimensions, conv2d, get_windowed_output_size, select_strategy,
    validate_conv2d_params, Conv2dDimensions, Conv2dParams, ConvStrategy, Padding,
};
pub use device::{AccelCapability, Device, DeviceKind};
pub use dtype::DType;
pub use error::{EmberError, Result};
pub use format::{FilterFormat, TensorFormat};
pub use shape::Shape;
pub use tensor::Tensor;
