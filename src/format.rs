use crate::Shape;

/// Axis ordering of a 4-D activation tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorFormat {
    /// batch, height, width, channels ("channel-last")
    Nhwc,
    /// batch, channels, height, width ("channel-first")
    Nchw,
}

impl TensorFormat {
    pub fn batch_index(&self) -> usize {
        0
    }

    pub fn height_index(&self) -> usize {
        match self {
            Self::Nhwc => 1,
            Self::Nchw => 2,
        }
    }

    pub fn width_index(&self) -> usize {
        match self {
            Self::Nhwc => 2,
            Self::Nchw => 3,
        }
    }

    pub fn channel_index(&self) -> usize {
        match self {
            Self::Nhwc => 3,
            Self::Nchw => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nhwc => "NHWC",
            Self::Nchw => "NCHW",
        }
    }
}

impl std::fmt::Display for TensorFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Axis ordering of a 4-D filter tensor. Callers supply HWIO; the dispatch
/// pipeline normalizes to whatever the compute layout wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterFormat {
    /// height, width, input channels, output channels
    Hwio,
    /// output channels, input channels, height, width
    Oihw,
    /// output channels, height, width, input channels
    Ohwi,
}

impl FilterFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hwio => "HWIO",
            Self::Oihw => "OIHW",
            Self::Ohwi => "OHWI",
        }
    }
}

impl std::fmt::Display for FilterFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Assemble a 4-D shape from logical batch/height/width/channel extents.
pub fn shape_from_format(
    format: TensorFormat,
    batch: usize,
    height: usize,
    width: usize,
    channels: usize,
) -> Shape {
    match format {
        TensorFormat::Nhwc => Shape::from_dims(&[batch, height, width, channels]),
        TensorFormat::Nchw => Shape::from_dims(&[batch, channels, height, width]),
    }
}

/// Read one logical dimension out of a 4-component attribute list
/// (strides or dilations) laid out in `format` order.
pub fn attr_dim(attr: &[i64], format: TensorFormat, dim: char) -> i64 {
    let idx = match dim {
        'N' => format.batch_index(),
        'H' => format.height_index(),
        'W' => format.width_index(),
        'C' => format.channel_index(),
        _ => unreachable!("unknown dimension tag {dim}"),
    };
    attr[idx]
}
