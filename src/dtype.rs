/// Numeric data types understood by the planner.
///
/// Host storage is always `f32`; the tag records the logical precision a
/// tensor carries so that dispatch (layout choice, kernel registration) can
/// treat reduced-precision floats differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F16,
    BF16,
    F64,
}

impl DType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::BF16 => "bf16",
            Self::F64 => "f64",
        }
    }

    /// Half-width floats qualify for the accelerator's fast channel-last path.
    pub fn is_reduced_precision(&self) -> bool {
        matches!(self, Self::F16 | Self::BF16)
    }
}

impl Default for DType {
    fn default() -> Self {
        Self::F32
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
